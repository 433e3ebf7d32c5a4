//! Process-wide administrative state.
//!
//! `ControlStore` holds one enable flag per registered expert plus the
//! processing-scale hint for the capture side. It is passed around as an
//! `Arc` handle; there is no global instance. Each flag is a single atomic,
//! so the dispatcher always reads a whole boolean.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{RouterError, RouterResult};
use crate::expert::ExpertRegistry;

pub const MIN_PROCESSING_SCALE: f32 = 0.1;
pub const MAX_PROCESSING_SCALE: f32 = 1.0;
pub const DEFAULT_PROCESSING_SCALE: f32 = 0.5;

pub struct ControlStore {
    toggles: BTreeMap<String, AtomicBool>,
    processing_scale: AtomicU32,
}

impl ControlStore {
    /// One toggle per registered expert, initialised from the registration.
    pub fn from_registry(registry: &ExpertRegistry, processing_scale: f32) -> Self {
        let toggles = registry
            .iter()
            .map(|(name, entry)| (name.clone(), AtomicBool::new(entry.enabled)))
            .collect();
        Self {
            toggles,
            processing_scale: AtomicU32::new(clamp_scale(processing_scale).to_bits()),
        }
    }

    /// True when `expert` is registered and enabled.
    pub fn is_enabled(&self, expert: &str) -> bool {
        self.toggles
            .get(expert)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Flip one expert. Returns the previous state.
    pub fn set_enabled(&self, expert: &str, enabled: bool) -> RouterResult<bool> {
        let flag = self
            .toggles
            .get(expert)
            .ok_or_else(|| RouterError::UnknownExpert(expert.to_string()))?;
        Ok(flag.swap(enabled, Ordering::AcqRel))
    }

    pub fn toggles(&self) -> BTreeMap<String, bool> {
        self.toggles
            .iter()
            .map(|(name, flag)| (name.clone(), flag.load(Ordering::Acquire)))
            .collect()
    }

    pub fn processing_scale(&self) -> f32 {
        f32::from_bits(self.processing_scale.load(Ordering::Acquire))
    }

    /// Set the capture-side scale hint. Values outside [0.1, 1.0] are rejected.
    pub fn set_processing_scale(&self, value: f32) -> RouterResult<f32> {
        if !value.is_finite() || !(MIN_PROCESSING_SCALE..=MAX_PROCESSING_SCALE).contains(&value) {
            return Err(RouterError::InvalidProcessingScale(value));
        }
        self.processing_scale.store(value.to_bits(), Ordering::Release);
        Ok(value)
    }
}

pub fn clamp_scale(value: f32) -> f32 {
    if !value.is_finite() {
        return DEFAULT_PROCESSING_SCALE;
    }
    value.clamp(MIN_PROCESSING_SCALE, MAX_PROCESSING_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expert::{ExpertSchedule, FrameInfoExpert};
    use std::sync::Arc;

    fn store() -> ControlStore {
        let mut registry = ExpertRegistry::new();
        registry
            .register(FrameInfoExpert::new("detect"), ExpertSchedule::per_second(5.0))
            .unwrap();
        registry
            .register_shared(
                Arc::new(FrameInfoExpert::new("caption")),
                ExpertSchedule::per_second(1.0 / 3.0),
                false,
            )
            .unwrap();
        ControlStore::from_registry(&registry, 0.5)
    }

    #[test]
    fn toggles_start_from_registration() {
        let store = store();
        assert!(store.is_enabled("detect"));
        assert!(!store.is_enabled("caption"));
        assert!(!store.is_enabled("nope"));
    }

    #[test]
    fn set_enabled_rejects_unknown_expert() {
        let store = store();
        assert_eq!(
            store.set_enabled("nope", true),
            Err(RouterError::UnknownExpert("nope".to_string()))
        );
        assert_eq!(store.set_enabled("detect", false), Ok(true));
        assert!(!store.is_enabled("detect"));
    }

    #[test]
    fn processing_scale_bounds() {
        let store = store();
        assert_eq!(store.processing_scale(), 0.5);
        assert!(store.set_processing_scale(0.05).is_err());
        assert!(store.set_processing_scale(1.5).is_err());
        assert!(store.set_processing_scale(f32::NAN).is_err());
        assert_eq!(store.set_processing_scale(0.25), Ok(0.25));
        assert_eq!(store.processing_scale(), 0.25);
        assert_eq!(clamp_scale(3.0), 1.0);
        assert_eq!(clamp_scale(0.0), 0.1);
    }
}
