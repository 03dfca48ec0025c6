//! 客户端：订阅进度事件并维护显示状态

pub mod progress_state;
pub mod session;

pub use progress_state::{format_time, DeferredAction, Phase, ProgressState, StepRow, StepView, DEFAULT_GRACE_DELAY};
pub use session::ClientSession;
