//! GateMQ - MQTT CONNECT admission and session-takeover core
//!
//! The front door of a broker: validates CONNECT packets, runs
//! extension-provided authentication and will-authorization, resolves
//! client-identifier conflicts through serialized session takeover,
//! persists the session and emits the CONNACK. Wire codecs, routing and
//! storage backends plug in around it through the collaborator traits.

pub mod alias;
pub mod auth;
pub mod channel;
pub mod config;
pub mod connect;
pub mod events;
pub mod extensions;
pub mod metrics;
pub mod protocol;
pub mod session;

pub use alias::TopicAliasLimiter;
pub use auth::{AuthOrchestrator, AuthOutcome, DefaultPermissions, TopicPermission};
pub use channel::{Channel, ChannelRegistry, DisconnectSignal};
pub use config::Config;
pub use connect::{Admission, AdmissionError, ConnectHandler, NoopPollService, PublishPollService};
pub use events::{EventLog, TracingEventLog};
pub use extensions::{
    Authenticator, Authenticators, AuthVerdict, Authorizers, TaskExecutor, WillAuthorizer,
};
pub use metrics::Metrics;
pub use protocol::{ConnAck, Connect, Packet, ProtocolVersion, QoS, ReasonCode};
pub use session::{MemorySessionStore, SessionStore};
