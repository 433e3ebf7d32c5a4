use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};

use super::backend::Expert;

/// Cadence for one expert. Applies independently to every camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpertSchedule {
    /// Minimum time between the completion of one invocation and the start of the next.
    pub interval: Duration,
    /// Optional per-invocation timeout. A timed-out call is recorded as a failure.
    pub timeout: Option<Duration>,
}

impl ExpertSchedule {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }

    /// `rate` invocations per second.
    pub fn per_second(rate: f64) -> Self {
        Self::every(Duration::from_secs_f64(1.0 / rate.max(f64::MIN_POSITIVE)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct RegisteredExpert {
    pub expert: Arc<dyn Expert>,
    pub schedule: ExpertSchedule,
    /// Initial toggle state.
    pub enabled: bool,
}

/// Named set of experts. Built once at startup and then shared read-only.
///
/// New experts are added by registering another implementation; nothing in
/// the dispatcher names a concrete expert.
#[derive(Clone, Default)]
pub struct ExpertRegistry {
    experts: BTreeMap<String, RegisteredExpert>,
}

impl ExpertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an expert, enabled, under its own name.
    pub fn register<E: Expert + 'static>(&mut self, expert: E, schedule: ExpertSchedule) -> Result<()> {
        self.register_shared(Arc::new(expert), schedule, true)
    }

    /// Register an already shared expert with an explicit initial toggle.
    pub fn register_shared(
        &mut self,
        expert: Arc<dyn Expert>,
        schedule: ExpertSchedule,
        enabled: bool,
    ) -> Result<()> {
        let name = expert.name().to_string();
        if name.trim().is_empty() {
            return Err(anyhow!("expert name must not be empty"));
        }
        if self.experts.contains_key(&name) {
            return Err(anyhow!("expert '{}' already registered", name));
        }
        if schedule.interval.is_zero() {
            return Err(anyhow!("expert '{}' interval must be greater than zero", name));
        }
        expert
            .warm_up()
            .map_err(|e| anyhow!("expert '{}' warm-up failed: {}", name, e))?;
        self.experts.insert(
            name,
            RegisteredExpert {
                expert,
                schedule,
                enabled,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredExpert> {
        self.experts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.experts.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.experts.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegisteredExpert)> {
        self.experts.iter()
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }
}
