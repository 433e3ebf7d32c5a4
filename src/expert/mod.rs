mod backend;
pub mod builtin;
mod output;
mod registry;

pub use backend::Expert;
pub use builtin::{ExpertKind, FrameInfoExpert, MotionExpert};
pub use output::ExpertOutput;
pub use registry::{ExpertRegistry, ExpertSchedule, RegisteredExpert};
