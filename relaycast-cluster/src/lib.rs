pub mod broker;
pub mod lifecycle;
pub mod relay;

pub use broker::{Broker, BrokerMessage, MemoryBroker, RedisBroker, Subscription};
pub use lifecycle::{Coordinator, LifecycleState, RelayHandles, RelaySettings};
pub use relay::{
    ChannelConnection, ClockGenerator, FanoutRegistry, InboundStats, InboundSubscriber,
    ListenerInfo, PublishQueue, PublishRequest, PublishWorker, PushConnection,
    SubmissionIngestor,
};
