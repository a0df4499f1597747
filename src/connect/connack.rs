//! CONNACK construction and the refusal path
//!
//! All CONNACKs leave through this module: the success builder honors
//! the server capabilities and fills the channel attributes later
//! stages read, and the refusal path enforces the one-CONNACK-per-
//! channel invariant, emits the lifecycle event and closes the channel
//! once the error CONNACK reached the wire.

use std::sync::Arc;

use tracing::debug;

use crate::alias::TopicAliasLimiter;
use crate::channel::Channel;
use crate::config::{Config, MQTT_MAX_PACKET_SIZE};
use crate::events::EventLog;
use crate::metrics::Metrics;
use crate::protocol::{ConnAck, Connect, Packet, ReasonCode};

/// Which lifecycle event a refusal emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefusalKind {
    /// The server refused the CONNECT for a protocol or policy reason
    ServerDisconnect,
    /// Authentication rejected the CONNECT
    AuthFailed,
}

/// Sends error CONNACKs and tears the channel down
pub(crate) struct Connacker {
    event_log: Arc<dyn EventLog>,
    metrics: Arc<Metrics>,
}

impl Connacker {
    pub fn new(event_log: Arc<dyn EventLog>, metrics: Arc<Metrics>) -> Self {
        Self { event_log, metrics }
    }

    /// Refuse the CONNECT: emit the event, send the mapped CONNACK and
    /// close the channel after the write completed.
    pub async fn refuse(
        &self,
        channel: &Arc<Channel>,
        connect: &Connect,
        reason_code: ReasonCode,
        reason_string: String,
        event_reason: &str,
        kind: RefusalKind,
    ) {
        debug!(
            addr = %channel.addr(),
            %reason_code,
            reason = %reason_string,
            "refusing CONNECT"
        );
        self.metrics.connect_refused(reason_code);

        let user_properties = connect.user_properties();
        match kind {
            RefusalKind::ServerDisconnect => {
                self.event_log
                    .server_disconnect(channel, reason_code, event_reason, user_properties);
            }
            RefusalKind::AuthFailed => {
                self.event_log
                    .auth_failed(channel, reason_code, event_reason, user_properties);
            }
        }

        if channel.claim_connack() {
            let connack = self.build_error(connect, reason_code, reason_string);
            if let Ok(write) = channel.write(Packet::ConnAck(connack)) {
                let _ = write.wait().await;
            }
        }

        channel.close();
    }

    fn build_error(
        &self,
        connect: &Connect,
        reason_code: ReasonCode,
        reason_string: String,
    ) -> ConnAck {
        let mut connack = ConnAck {
            session_present: false,
            reason_code,
            properties: Default::default(),
        };
        if connect.protocol_version.is_v5() {
            // The client can opt out of reason strings
            let wants_reason = connect.properties.request_problem_information != Some(0);
            if wants_reason && !reason_string.is_empty() {
                connack.properties.reason_string = Some(reason_string);
            }
        }
        // v3 encoders map reason_code through to_v3_connack_code and
        // drop the properties
        connack
    }
}

/// Builds the successful CONNACK and installs the channel-side effects
/// of its fields
pub(crate) struct ConnackBuilder {
    server_receive_maximum: u16,
    maximum_qos: u8,
    retained_messages_enabled: bool,
    wildcard_subscriptions_enabled: bool,
    subscription_identifiers_enabled: bool,
    shared_subscriptions_enabled: bool,
    max_packet_size: u32,
    max_session_expiry_interval: u32,
    topic_alias_maximum: u16,
    keep_alive_max: u16,
    keep_alive_allow_zero: bool,
}

impl ConnackBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            server_receive_maximum: config.mqtt.server_receive_maximum,
            maximum_qos: config.mqtt.maximum_qos,
            retained_messages_enabled: config.mqtt.retained_messages_enabled,
            wildcard_subscriptions_enabled: config.mqtt.wildcard_subscriptions_enabled,
            subscription_identifiers_enabled: config.mqtt.subscription_identifiers_enabled,
            shared_subscriptions_enabled: config.mqtt.shared_subscriptions_enabled,
            max_packet_size: config.mqtt.max_packet_size,
            max_session_expiry_interval: config.mqtt.max_session_expiry_interval,
            topic_alias_maximum: config.mqtt.effective_topic_alias_maximum(),
            keep_alive_max: config.mqtt.keep_alive_max,
            keep_alive_allow_zero: config.mqtt.keep_alive_allow_zero,
        }
    }

    /// Session expiry granted to this CONNECT: the client's request
    /// clamped to the configured maximum. v3 clients express the
    /// request through the clean-session flag.
    pub fn effective_session_expiry(&self, connect: &Connect) -> u32 {
        let requested = if connect.protocol_version.is_v5() {
            connect.session_expiry_interval()
        } else if connect.clean_start {
            0
        } else {
            crate::config::SESSION_EXPIRY_MAX
        };
        requested.min(self.max_session_expiry_interval)
    }

    /// Keep alive the connection will actually run with
    pub fn effective_keep_alive(&self, connect: &Connect) -> u16 {
        let requested = connect.keep_alive;
        if connect.protocol_version.is_v5()
            && ((requested == 0 && !self.keep_alive_allow_zero) || requested > self.keep_alive_max)
        {
            self.keep_alive_max
        } else {
            requested
        }
    }

    /// Build the CONNACK and apply its side effects to the channel
    /// attributes (effective keep alive, session expiry, outbound
    /// packet cap, topic alias table).
    pub fn build(
        &self,
        channel: &Channel,
        connect: &Connect,
        session_present: bool,
        alias_limiter: &TopicAliasLimiter,
    ) -> ConnAck {
        let effective_expiry = self.effective_session_expiry(connect);
        let effective_keep_alive = self.effective_keep_alive(connect);

        let mut attrs = channel.attrs_mut();
        attrs.session_expiry_interval = effective_expiry;
        attrs.connect_keep_alive = effective_keep_alive;

        if !connect.protocol_version.is_v5() {
            // v3 has exactly two success CONNACKs; everything else
            // lives on the channel only
            return ConnAck::v3_accepted(session_present);
        }

        let mut connack = ConnAck {
            session_present,
            reason_code: ReasonCode::Success,
            properties: Default::default(),
        };
        let props = &mut connack.properties;

        props.receive_maximum = Some(self.server_receive_maximum);
        // Per MQTT 5.0 spec 3.2.2.3.4 the property is only sent for QoS 0/1
        if self.maximum_qos < 2 {
            props.maximum_qos = Some(self.maximum_qos);
        }
        props.retain_available = Some(self.retained_messages_enabled as u8);
        props.maximum_packet_size = Some(self.max_packet_size);
        props.wildcard_subscription_available = Some(self.wildcard_subscriptions_enabled as u8);
        props.subscription_identifier_available =
            Some(self.subscription_identifiers_enabled as u8);
        props.shared_subscription_available = Some(self.shared_subscriptions_enabled as u8);

        // Included only when the server clamped the request; otherwise
        // the client keeps its own value
        if connect.session_expiry_interval() > self.max_session_expiry_interval {
            props.session_expiry_interval = Some(effective_expiry);
        }

        if connect.client_id_assigned {
            props.assigned_client_identifier = Some(connect.client_id.clone());
        }

        // Record the client's outbound cap when it is finite
        if let Some(max) = connect.properties.maximum_packet_size {
            if max < MQTT_MAX_PACKET_SIZE {
                attrs.max_packet_size_send = Some(max);
            }
        }

        if effective_keep_alive != connect.keep_alive {
            props.server_keep_alive = Some(self.keep_alive_max);
        }

        // Offer topic aliases while the global pool has headroom. The
        // check and the reservation happen as one atomic step; builds
        // for different channels race on the same pool.
        if self.topic_alias_maximum > 0 && alias_limiter.try_reserve(self.topic_alias_maximum) {
            attrs.topic_alias_mapping = vec![None; self.topic_alias_maximum as usize];
            props.topic_alias_maximum = Some(self.topic_alias_maximum);
        }

        // User properties collected during authentication are drained
        // into the CONNACK
        props.user_properties = std::mem::take(&mut attrs.auth_user_properties);

        connack
    }
}
