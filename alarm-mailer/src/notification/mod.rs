//! Notification pipeline.
//!
//! Classified events are fanned out by the `FanoutRouter` to one batching
//! queue per destination. Each destination flush renders one mail which
//! goes to the shared transport queue for delivery.

pub mod events;
pub mod notifier;
pub mod queue;
pub mod render;
pub mod router;
pub mod transport;

pub use events::{AlarmEvent, AlarmReason, EventView, SourceEvent, SourceMeta};
pub use notifier::DestinationNotifier;
pub use queue::{BatchItem, BatchProcessor, BatchQueue, BatchQueueConfig, QueueState};
pub use render::{RenderContext, Renderer, TemplateRenderer};
pub use router::FanoutRouter;
pub use transport::{Envelope, MailTransport, SmtpTransport, TransportSink};
