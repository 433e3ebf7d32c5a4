//! Mentat Router
//!
//! Multi-camera frame routing and expert dispatch.
//!
//! # Architecture
//!
//! Frames arrive from many cameras over persistent connections and are fanned
//! out to a set of independently paced experts (detection, captioning, ...).
//! The router guarantees:
//!
//! 1. **Latest-wins sampling**: every (camera, expert) pair has a single-frame
//!    slot. A newer frame replaces an unconsumed one; nothing queues.
//! 2. **Non-blocking intake**: submitting a frame never waits on an expert.
//! 3. **Per-expert cadence**: each pair is invoked at most once per the
//!    expert's interval, measured from the previous completion.
//! 4. **Isolation**: a slow or failing expert never delays another pair or
//!    frame intake, and a slow subscriber never delays a publish.
//! 5. **Pull truth**: pushes are best effort; `get_camera_state` always
//!    returns the current merged state.
//!
//! # Module Structure
//!
//! - `frame`: `CameraId`, `Frame`, `ExpertSlot`
//! - `expert`: `Expert` trait, registry, built-in experts
//! - `dispatch`: intake and per-pair scheduling loops
//! - `aggregate`: merged `CameraState`, rolling FPS
//! - `publish`: subscriptions and fan-out
//! - `liveness`: connection registry and heartbeat sweeps
//! - `router`: the `Router` handle over all of the above
//! - `protocol`, `server`: WebSocket wire format and listener
//! - `config`: `routerd` configuration

pub mod aggregate;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod expert;
pub mod frame;
pub mod liveness;
pub mod protocol;
pub mod publish;
pub mod router;
pub mod server;

pub use aggregate::{CameraState, ExpertReport, ExpertResult, FailureSummary};
pub use control::ControlStore;
pub use dispatch::{DispatchStats, SubmitOutcome};
pub use error::{RouterError, RouterResult};
pub use expert::{Expert, ExpertKind, ExpertOutput, ExpertRegistry, ExpertSchedule};
pub use frame::{CameraId, ExpertSlot, Frame};
pub use liveness::{ConnectionStatus, LivenessSettings};
pub use publish::SubscriberId;
pub use router::{Router, RouterSettings, RouterStats};
pub use server::{RouterServer, ServerConfig, ServerHandle};
