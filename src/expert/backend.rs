use anyhow::Result;

use crate::expert::output::ExpertOutput;
use crate::frame::{CameraId, Frame};

/// A named, independently paced frame processor.
///
/// The router treats every expert the same way: one frame in, one output (or
/// an error) out. `invoke` may take arbitrarily long; it runs on the pair's
/// scheduling thread and never under a router lock.
///
/// Implementations are shared across cameras and may be invoked concurrently
/// for different (camera, expert) pairs. Any state keyed by camera or any
/// shared model handle must be synchronized internally.
pub trait Expert: Send + Sync {
    /// Registry name, also the wire name used by `expert_target`.
    fn name(&self) -> &str;

    /// Process one frame.
    fn invoke(&self, frame: &Frame) -> Result<ExpertOutput>;

    /// Optional warm-up hook, called once at registration.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    /// Drop per-camera state. Called by the camera's scheduling loop after its
    /// last invocation, e.g. when the camera is evicted.
    fn forget_camera(&self, _camera: &CameraId) {}
}
