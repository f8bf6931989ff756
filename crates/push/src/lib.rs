// courier-push: session and topic fan-out engine with an optional broker bridge.

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
mod queue;
pub mod session;
pub mod topic;

pub use config::{BrokerConfig, PushConfig};
pub use engine::PushEngine;
pub use error::PushError;
pub use session::{Outbox, Session, SessionKey, SessionRegistry};
pub use topic::TopicRegistry;
