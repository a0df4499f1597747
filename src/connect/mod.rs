//! CONNECT admission
//!
//! The handler that turns a decoded CONNECT into a live session:
//! normalize and validate the packet, run the extension authenticator
//! fan-out, authorize the Last Will, displace any prior connection with
//! the same client identifier, persist the session, install the
//! per-connection lifecycle (keep-alive, ordered delivery and
//! flow-control stages) and emit the CONNACK.
//!
//! Admission runs as one async call on the connection's task, so all
//! per-channel state changes are serialized; the only awaits are
//! extension completion, session persistence, the displaced channel's
//! disconnect signal and the CONNACK write.

mod connack;
mod keepalive;
mod takeover;
mod validator;

pub use takeover::TakeoverArbiter;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::alias::TopicAliasLimiter;
use crate::auth::{AuthOrchestrator, AuthOutcome};
use crate::channel::{Channel, ChannelRegistry};
use crate::config::Config;
use crate::events::EventLog;
use crate::extensions::{Authenticators, Authorizers, TaskExecutor, WillAuthResult};
use crate::metrics::Metrics;
use crate::protocol::{AckReasonCode, Connect, Packet, ReasonCode, Will};
use crate::session::{SessionError, SessionStore};

use connack::{ConnackBuilder, Connacker, RefusalKind};
use validator::{ConnectValidator, DEFAULT_RECEIVE_MAXIMUM};

#[cfg(test)]
mod tests;

/// Drains queued messages for a client once its CONNACK reached the
/// wire (in-flight queue first, then the client-session queue)
pub trait PublishPollService: Send + Sync {
    fn poll_messages(&self, client_id: &str);
}

/// Poll service for brokers without queued delivery
pub struct NoopPollService;

impl PublishPollService for NoopPollService {
    fn poll_messages(&self, _client_id: &str) {}
}

/// Admission error types
#[derive(Debug)]
pub enum AdmissionError {
    /// The CONNECT was refused; the error CONNACK is already on the wire
    Refused(ReasonCode),
    /// A second CONNECT arrived on a live channel
    SecondConnect,
    /// A non-CONNECT packet arrived before the CONNECT
    FirstPacketNotConnect,
    /// The channel closed mid-admission
    ChannelClosed,
    /// The session store failed to persist the session
    Session(SessionError),
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::Refused(code) => write!(f, "CONNECT refused: {}", code),
            AdmissionError::SecondConnect => write!(f, "second CONNECT on a live channel"),
            AdmissionError::FirstPacketNotConnect => {
                write!(f, "first packet was not CONNECT")
            }
            AdmissionError::ChannelClosed => write!(f, "channel closed during admission"),
            AdmissionError::Session(e) => write!(f, "session error: {}", e),
        }
    }
}

impl std::error::Error for AdmissionError {}

impl From<SessionError> for AdmissionError {
    fn from(e: SessionError) -> Self {
        AdmissionError::Session(e)
    }
}

/// Outcome of a successful admission, handed to the steady-state
/// pipeline so downstream stages can initialize from the CONNECT
#[derive(Debug)]
pub struct Admission {
    /// The normalized CONNECT
    pub connect: Connect,
    /// Whether a prior session was resumed
    pub session_present: bool,
    /// Packets that arrived while enhanced authentication was running
    pub buffered: Vec<Packet>,
}

/// The CONNECT message handler
pub struct ConnectHandler {
    validator: ConnectValidator,
    connack: ConnackBuilder,
    connacker: Connacker,
    takeover: TakeoverArbiter,
    auth: AuthOrchestrator,
    authorizers: Arc<Authorizers>,
    registry: Arc<ChannelRegistry>,
    sessions: Arc<dyn SessionStore>,
    alias_limiter: Arc<TopicAliasLimiter>,
    event_log: Arc<dyn EventLog>,
    poll_service: Arc<dyn PublishPollService>,
    metrics: Arc<Metrics>,
    keep_alive_factor: f64,
}

impl ConnectHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        registry: Arc<ChannelRegistry>,
        sessions: Arc<dyn SessionStore>,
        authenticators: Arc<Authenticators>,
        authorizers: Arc<Authorizers>,
        task_executor: Arc<TaskExecutor>,
        event_log: Arc<dyn EventLog>,
        poll_service: Arc<dyn PublishPollService>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let auth = AuthOrchestrator::new(
            authenticators,
            task_executor,
            metrics.clone(),
            config.security.deny_unauthenticated_connections,
            Duration::from_secs(config.security.auth_task_timeout_secs),
        );
        Self {
            validator: ConnectValidator::new(config),
            connack: ConnackBuilder::new(config),
            connacker: Connacker::new(event_log.clone(), metrics.clone()),
            takeover: TakeoverArbiter::new(registry.clone(), event_log.clone(), metrics.clone()),
            auth,
            authorizers,
            registry,
            sessions,
            alias_limiter: Arc::new(TopicAliasLimiter::new(
                config.mqtt.topic_alias_global_limit,
            )),
            event_log,
            poll_service,
            metrics,
            keep_alive_factor: config.mqtt.connection_keep_alive_factor,
        }
    }

    /// The global topic-alias accounting shared by all channels of this
    /// handler
    pub fn alias_limiter(&self) -> &Arc<TopicAliasLimiter> {
        &self.alias_limiter
    }

    /// Dispatch a packet on a channel that has not completed admission.
    ///
    /// CONNECT starts admission; while enhanced authentication runs,
    /// non-AUTH packets are buffered and returned with the admission;
    /// anything else before the CONNECT is a protocol violation.
    pub async fn handle_packet(
        &self,
        channel: &Arc<Channel>,
        packet: Packet,
    ) -> Result<Option<Admission>, AdmissionError> {
        channel.touch();
        match packet {
            Packet::Connect(connect) => self.handle_connect(channel, *connect).await.map(Some),
            // AUTH belongs to the enhanced-auth exchange owned by the
            // authenticator extension
            Packet::Auth(_) => Ok(None),
            other => {
                if channel.auth_pending() {
                    channel.attrs_mut().pending_packets.push_back(other);
                    Ok(None)
                } else if !channel.connect_received() {
                    debug!(addr = %channel.addr(), "first packet was not CONNECT, closing");
                    channel.close();
                    Err(AdmissionError::FirstPacketNotConnect)
                } else {
                    // Steady-state traffic for downstream stages
                    Ok(None)
                }
            }
        }
    }

    /// Run admission for one CONNECT.
    ///
    /// On refusal the error CONNACK and the lifecycle event are already
    /// emitted and the channel is closing when this returns.
    pub async fn handle_connect(
        &self,
        channel: &Arc<Channel>,
        connect: Connect,
    ) -> Result<Admission, AdmissionError> {
        if !channel.begin_connect() {
            return Err(self.refuse_second_connect(channel));
        }
        let started = std::time::Instant::now();

        let connect = self.validator.normalize(connect);
        if let Err(refusal) = self.validator.check(&connect) {
            let code = refusal.reason_code;
            self.connacker
                .refuse(
                    channel,
                    &connect,
                    code,
                    refusal.reason_string,
                    &refusal.event_reason,
                    RefusalKind::ServerDisconnect,
                )
                .await;
            return Err(AdmissionError::Refused(code));
        }

        let client_id: Arc<str> = Arc::from(connect.client_id.as_str());
        self.install_channel_state(channel, &client_id, &connect);
        self.install_lifecycle(channel.clone(), client_id.clone());

        match self.auth.authenticate(channel, &connect).await {
            AuthOutcome::Refused {
                reason_code,
                reason_string,
            } => {
                self.connacker
                    .refuse(
                        channel,
                        &connect,
                        reason_code,
                        reason_string.clone(),
                        &reason_string,
                        RefusalKind::AuthFailed,
                    )
                    .await;
                return Err(AdmissionError::Refused(reason_code));
            }
            AuthOutcome::Authenticated | AuthOutcome::Bypassed => {}
        }
        if channel.is_closed() {
            return Err(AdmissionError::ChannelClosed);
        }

        // The will stays embargoed (prevent_lwt) until the steady-state
        // pipeline accepts it for delivery; admission only decides
        // whether the client may carry it at all.
        if let Some(will) = connect.will.clone() {
            self.authorize_will(channel, &connect, &will).await?;
            if channel.is_closed() {
                return Err(AdmissionError::ChannelClosed);
            }
        }

        self.takeover.displace_existing(&connect.client_id).await;
        if channel.is_closed() {
            return Err(AdmissionError::ChannelClosed);
        }

        self.install_session(channel, &client_id, connect, started)
            .await
    }

    /// Registry insertion, session persistence, keep-alive and CONNACK
    async fn install_session(
        &self,
        channel: &Arc<Channel>,
        client_id: &Arc<str>,
        connect: Connect,
        started: std::time::Instant,
    ) -> Result<Admission, AdmissionError> {
        if let Some(loser) = self.registry.persist(client_id.clone(), channel.clone()) {
            if !Arc::ptr_eq(&loser, channel) {
                // A concurrent admission for the same identifier reached
                // the registry between our takeover and our insert; it
                // loses the session.
                loser.set_taken_over();
                self.event_log.client_disconnected(
                    &loser,
                    Some("Another client connected with the same client id"),
                );
                self.metrics.takeovers_total.inc();
                loser.close();
            }
        }

        let session_exists = if connect.clean_start {
            false
        } else {
            self.sessions.exists(&connect.client_id).await
        };
        let effective_expiry = self.connack.effective_session_expiry(&connect);
        let session_present = self
            .sessions
            .start_persistence(&connect, session_exists, effective_expiry)
            .await?;
        if channel.is_closed() {
            return Err(AdmissionError::ChannelClosed);
        }

        // A session that expired while disconnected must not leave
        // stale shared-subscription state behind
        self.sessions.invalidate_shared_cache(&connect.client_id);

        let effective_keep_alive = self.connack.effective_keep_alive(&connect);
        keepalive::install_keep_alive(
            channel,
            effective_keep_alive,
            self.keep_alive_factor,
            self.event_log.clone(),
        );

        let connack = self
            .connack
            .build(channel, &connect, session_present, &self.alias_limiter);
        channel.attrs_mut().connect_message = Some(connect.clone());

        if !channel.claim_connack() {
            return Err(AdmissionError::ChannelClosed);
        }
        let write = channel
            .write(Packet::ConnAck(connack))
            .map_err(|_| AdmissionError::ChannelClosed)?;
        write.wait().await.map_err(|_| AdmissionError::ChannelClosed)?;

        // Post-send actions, in order: open the outbound gate, then let
        // the poll service drain the in-flight and session queues
        channel.clear_connack_pending();
        self.poll_service.poll_messages(&connect.client_id);

        self.event_log.client_connected(channel);
        self.metrics.connects_accepted_total.inc();
        self.metrics
            .connect_duration
            .observe(started.elapsed().as_secs_f64());

        let buffered = channel.attrs_mut().pending_packets.drain(..).collect();
        Ok(Admission {
            connect,
            session_present,
            buffered,
        })
    }

    /// First attribute installation after validation accepted the CONNECT
    fn install_channel_state(&self, channel: &Channel, client_id: &Arc<str>, connect: &Connect) {
        channel.init_disconnect_signal();
        let mut attrs = channel.attrs_mut();
        attrs.client_id = Some(client_id.clone());
        attrs.client_id_assigned = connect.client_id_assigned;
        attrs.client_receive_maximum = connect
            .properties
            .receive_maximum
            .unwrap_or(DEFAULT_RECEIVE_MAXIMUM);
        attrs.request_response_information =
            connect.properties.request_response_information == Some(1);
        attrs.request_problem_information =
            connect.properties.request_problem_information != Some(0);
        attrs.prevent_lwt = true;
        attrs.ordered_delivery_installed = true;
        attrs.flow_control_installed = connect.protocol_version.is_v5();
    }

    /// Watch the channel for close: drop the registry mapping while it
    /// still points here, return reserved alias slots and fire the
    /// disconnect signal the takeover arbiter waits on.
    fn install_lifecycle(&self, channel: Arc<Channel>, client_id: Arc<str>) {
        let registry = self.registry.clone();
        let alias_limiter = self.alias_limiter.clone();
        tokio::spawn(async move {
            channel.closed_wait().await;
            registry.remove(&client_id, &channel);
            let reserved = channel.attrs().topic_alias_mapping.len();
            if reserved > 0 {
                alias_limiter.release_usage(reserved as u16);
            }
            channel.complete_disconnect();
        });
    }

    /// Judge the Last Will, either through extension authorizers or the
    /// permissions installed by authentication
    async fn authorize_will(
        &self,
        channel: &Arc<Channel>,
        connect: &Connect,
        will: &Will,
    ) -> Result<(), AdmissionError> {
        if self.authorizers.available() {
            let result = self.authorizers.authorize_will(channel, connect).await;
            return self.apply_will_verdict(channel, connect, will, result).await;
        }

        let allowed = channel
            .attrs()
            .auth_permissions
            .as_ref()
            .map(|p| p.check_will(will))
            .unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            self.refuse_will(channel, connect, will, None, None, None)
                .await
        }
    }

    async fn apply_will_verdict(
        &self,
        channel: &Arc<Channel>,
        connect: &Connect,
        will: &Will,
        result: WillAuthResult,
    ) -> Result<(), AdmissionError> {
        if result.authorizer_present {
            if let Some(ack) = result.ack_reason_code {
                // An authorizer decided
                if ack == AckReasonCode::Success {
                    return Ok(());
                }
                return self
                    .refuse_will(
                        channel,
                        connect,
                        will,
                        result.disconnect_reason_code,
                        Some(ack),
                        result.reason_string,
                    )
                    .await;
            }
        }

        let undecided_denies = {
            let attrs = channel.attrs();
            match attrs.auth_permissions.as_ref() {
                // Authorizers were consulted but made no decision and
                // nothing grants the publish: deny
                Some(p) => result.authorizer_present && p.is_empty() && !p.default_overridden(),
                None => true,
            }
        };
        if undecided_denies {
            return self
                .refuse_will(
                    channel,
                    connect,
                    will,
                    result.disconnect_reason_code,
                    None,
                    None,
                )
                .await;
        }

        let allowed = channel
            .attrs()
            .auth_permissions
            .as_ref()
            .map(|p| p.check_will(will))
            .unwrap_or(false);
        if allowed {
            Ok(())
        } else {
            self.refuse_will(
                channel,
                connect,
                will,
                result.disconnect_reason_code,
                result.ack_reason_code,
                result.reason_string,
            )
            .await
        }
    }

    /// Map the denial codes and refuse the CONNECT over the will
    async fn refuse_will(
        &self,
        channel: &Arc<Channel>,
        connect: &Connect,
        will: &Will,
        disconnect_reason_code: Option<ReasonCode>,
        ack_reason_code: Option<AckReasonCode>,
        reason_string: Option<String>,
    ) -> Result<(), AdmissionError> {
        let code = disconnect_reason_code
            .and_then(ReasonCode::for_connack)
            .or_else(|| ack_reason_code.map(AckReasonCode::to_connack_code))
            .filter(|code| code.is_error())
            .unwrap_or(ReasonCode::NotAuthorized);

        let reason = reason_string.unwrap_or_else(|| {
            format!(
                "Will Publish is not authorized for topic '{}' with QoS '{}' and retain '{}'",
                will.topic, will.qos as u8, will.retain
            )
        });
        let event_reason = format!(
            "Sent a CONNECT message with a not authorized Will Publish to topic '{}' with QoS '{}' and retain '{}'",
            will.topic, will.qos as u8, will.retain
        );

        self.connacker
            .refuse(
                channel,
                connect,
                code,
                reason,
                &event_reason,
                RefusalKind::ServerDisconnect,
            )
            .await;
        Err(AdmissionError::Refused(code))
    }

    /// A second CONNECT on a live channel is a protocol error; no
    /// second CONNACK is sent.
    fn refuse_second_connect(&self, channel: &Arc<Channel>) -> AdmissionError {
        debug!(addr = %channel.addr(), "second CONNECT on a live channel, closing");
        self.event_log.server_disconnect(
            channel,
            ReasonCode::ProtocolError,
            "Sent second CONNECT message",
            &[],
        );
        channel.close();
        AdmissionError::SecondConnect
    }
}
