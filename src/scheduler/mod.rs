//! Upload scheduling: queues, dispatch, retry and completion

pub mod events;
pub mod manager;
pub mod state;

pub use events::{EventReceiver, PipelineEvent, RunSummary};
pub use manager::{SchedulerBuilder, UploadScheduler};
