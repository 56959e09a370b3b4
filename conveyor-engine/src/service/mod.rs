//! Services layered on top of the store

mod bulk;
pub(crate) mod hub;
mod reporter;

pub use bulk::{BulkHandle, BulkOrchestrator, FinalizeHook, SubUnitSpec};
pub use hub::{ChannelSink, HubStats, NotificationHub, NotificationSink};
pub use reporter::ProgressReporter;
