//! Connection lifecycle event log
//!
//! Admission emits one event per connection outcome: a successful
//! connect, a server-initiated disconnect with its reason, or an
//! authentication failure. Deployments plug in their own sink; the
//! default logs through `tracing`.

use std::sync::Arc;

use tracing::{debug, info};

use crate::channel::Channel;
use crate::protocol::ReasonCode;

/// Sink for connection lifecycle events
pub trait EventLog: Send + Sync {
    /// A client completed admission and received a successful CONNACK
    fn client_connected(&self, channel: &Channel);

    /// The server disconnected a client, e.g. because its session was
    /// taken over or it idled out
    fn client_disconnected(&self, channel: &Channel, reason: Option<&str>);

    /// A CONNECT was refused before the session was established
    fn server_disconnect(
        &self,
        channel: &Channel,
        reason_code: ReasonCode,
        reason: &str,
        user_properties: &[(String, String)],
    );

    /// Authentication rejected the CONNECT
    fn auth_failed(
        &self,
        channel: &Channel,
        reason_code: ReasonCode,
        reason: &str,
        user_properties: &[(String, String)],
    );
}

/// Default event log writing structured `tracing` records
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn client_connected(&self, channel: &Channel) {
        let client_id = channel.client_id();
        info!(
            addr = %channel.addr(),
            client_id = client_id.as_deref().unwrap_or("<unknown>"),
            "client connected"
        );
    }

    fn client_disconnected(&self, channel: &Channel, reason: Option<&str>) {
        let client_id = channel.client_id();
        info!(
            addr = %channel.addr(),
            client_id = client_id.as_deref().unwrap_or("<unknown>"),
            reason = reason.unwrap_or("<none>"),
            "client disconnected"
        );
    }

    fn server_disconnect(
        &self,
        channel: &Channel,
        reason_code: ReasonCode,
        reason: &str,
        user_properties: &[(String, String)],
    ) {
        debug!(
            addr = %channel.addr(),
            %reason_code,
            reason,
            user_properties = user_properties.len(),
            "server disconnect"
        );
    }

    fn auth_failed(
        &self,
        channel: &Channel,
        reason_code: ReasonCode,
        reason: &str,
        user_properties: &[(String, String)],
    ) {
        debug!(
            addr = %channel.addr(),
            %reason_code,
            reason,
            user_properties = user_properties.len(),
            "authentication failed"
        );
    }
}

/// Implement EventLog for Arc<T> so shared sinks can be used directly
impl<T: EventLog + ?Sized> EventLog for Arc<T> {
    fn client_connected(&self, channel: &Channel) {
        (**self).client_connected(channel);
    }

    fn client_disconnected(&self, channel: &Channel, reason: Option<&str>) {
        (**self).client_disconnected(channel, reason);
    }

    fn server_disconnect(
        &self,
        channel: &Channel,
        reason_code: ReasonCode,
        reason: &str,
        user_properties: &[(String, String)],
    ) {
        (**self).server_disconnect(channel, reason_code, reason, user_properties);
    }

    fn auth_failed(
        &self,
        channel: &Channel,
        reason_code: ReasonCode,
        reason: &str,
        user_properties: &[(String, String)],
    ) {
        (**self).auth_failed(channel, reason_code, reason, user_properties);
    }
}
