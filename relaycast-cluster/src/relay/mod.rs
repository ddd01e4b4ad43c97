//! Relay loops
//!
//! - [`ClockGenerator`]: periodic clock events
//! - [`SubmissionIngestor`]: validated, persisted, then queued submissions
//! - [`PublishWorker`]: the single consumer that publishes queued requests
//! - [`InboundSubscriber`]: standing tap on submission and clock traffic
//! - [`FanoutRegistry`]: one forwarding loop per listener connection

pub mod fanout;
pub mod generator;
pub mod inbound;
pub mod ingestor;
pub mod publisher;

pub use fanout::{ChannelConnection, FanoutRegistry, ListenerInfo, PushConnection};
pub use generator::ClockGenerator;
pub use inbound::{InboundStats, InboundSubscriber};
pub use ingestor::SubmissionIngestor;
pub use publisher::{PublishQueue, PublishRequest, PublishWorker};
