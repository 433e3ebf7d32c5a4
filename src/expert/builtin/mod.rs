//! Built-in experts.
//!
//! Real inference servers are plugged in through `remote` (HTTP) or by
//! registering another `Expert` implementation; the rest are lightweight
//! experts that run in-process.

mod frame_info;
#[cfg(feature = "decode")]
mod luma;
mod motion;
#[cfg(feature = "remote-experts")]
mod remote;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use super::backend::Expert;

pub use frame_info::FrameInfoExpert;
#[cfg(feature = "decode")]
pub use luma::LumaExpert;
pub use motion::MotionExpert;
#[cfg(feature = "remote-experts")]
pub use remote::RemoteExpert;

/// Expert implementations selectable from configuration.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertKind {
    Motion,
    FrameInfo,
    Luma,
    Remote,
}

impl ExpertKind {
    /// Build an expert of this kind. `url` and `timeout` are only used by `Remote`.
    pub fn instantiate(
        self,
        name: &str,
        url: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Expert>> {
        match self {
            ExpertKind::Motion => Ok(Arc::new(MotionExpert::new(name))),
            ExpertKind::FrameInfo => Ok(Arc::new(FrameInfoExpert::new(name))),
            ExpertKind::Luma => {
                #[cfg(feature = "decode")]
                {
                    Ok(Arc::new(LumaExpert::new(name)))
                }
                #[cfg(not(feature = "decode"))]
                {
                    Err(anyhow!("expert '{}': kind luma requires the decode feature", name))
                }
            }
            ExpertKind::Remote => {
                let url = url.ok_or_else(|| anyhow!("expert '{}': kind remote requires url", name))?;
                #[cfg(feature = "remote-experts")]
                {
                    Ok(Arc::new(RemoteExpert::new(name, url, timeout)))
                }
                #[cfg(not(feature = "remote-experts"))]
                {
                    let _ = (url, timeout);
                    Err(anyhow!(
                        "expert '{}': kind remote requires the remote-experts feature",
                        name
                    ))
                }
            }
        }
    }
}
