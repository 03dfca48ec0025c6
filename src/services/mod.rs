pub mod broadcaster;
pub mod job_progress;

pub use broadcaster::{topic_name, Broadcaster, InMemoryBroadcaster, Subscription};
pub use job_progress::JobProgress;
