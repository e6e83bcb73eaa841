//! Source monitoring: update feeds, per-source classification and watch tasks.

pub mod classifier;
pub mod feed;
pub mod update;
pub mod watcher;

pub use classifier::{SourceClassifier, classify};
pub use feed::{FeedMonitor, SourceMonitor, Subscription, SubscriptionId};
pub use update::{RawUpdate, Severity};
pub use watcher::SourceWatcher;
