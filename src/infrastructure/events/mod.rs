//! Events - 任务进度推送

mod broadcaster;

pub use broadcaster::{BroadcasterSettings, EventBroadcaster, EventSubscription, PushEvent};
