pub mod client;
pub mod dispatch;
pub mod mock;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod transport;

pub use client::{ClientSettings, FeedClient};
pub use dispatch::Dispatcher;
pub use mock::MockTransport;
pub use protocol::{ControlMessage, FeedEvent, FrameCodec, JsonCodec, SubscriptionAck};
pub use reconnect::ReconnectPolicy;
pub use registry::{QuoteCallback, Subscription, SubscriptionRegistry};
pub use transport::{FeedSession, FeedTransport, SessionGuard, WsTransport};
