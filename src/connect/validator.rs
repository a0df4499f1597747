//! CONNECT validation and default fill
//!
//! Normalization builds a new CONNECT value with the documented
//! defaults substituted for absent v5 properties; the decoded packet is
//! never mutated. Validation then applies the restrictions a CONNECT
//! must satisfy before any extension code runs.

use crate::config::Config;
use crate::protocol::{Connect, ReasonCode};

/// Receive maximum assumed when the client did not send one
pub(crate) const DEFAULT_RECEIVE_MAXIMUM: u16 = 65535;

/// A validation refusal, turned into an error CONNACK by the caller
#[derive(Debug)]
pub(crate) struct Refusal {
    pub reason_code: ReasonCode,
    pub reason_string: String,
    /// Event-log line describing what the client sent
    pub event_reason: String,
}

pub(crate) struct ConnectValidator {
    max_client_id_length: usize,
    maximum_qos: u8,
    retained_messages_enabled: bool,
    max_message_expiry_interval: u32,
}

impl ConnectValidator {
    pub fn new(config: &Config) -> Self {
        Self {
            max_client_id_length: config.restrictions.max_client_id_length,
            maximum_qos: config.mqtt.maximum_qos,
            retained_messages_enabled: config.mqtt.retained_messages_enabled,
            max_message_expiry_interval: config.mqtt.max_message_expiry_interval,
        }
    }

    /// Build the normalized CONNECT: every absent v5 property replaced
    /// by its documented default, the will expiry capped to the server
    /// maximum, and an identifier assigned when the client sent none.
    pub fn normalize(&self, connect: Connect) -> Connect {
        let mut connect = connect;

        if connect.client_id.is_empty() {
            connect.client_id = format!("gatemq-{:016x}", rand_id());
            connect.client_id_assigned = true;
        }

        let props = &mut connect.properties;
        props.session_expiry_interval.get_or_insert(0);
        props.receive_maximum.get_or_insert(DEFAULT_RECEIVE_MAXIMUM);
        props.topic_alias_maximum.get_or_insert(0);
        props
            .maximum_packet_size
            .get_or_insert(crate::config::MQTT_MAX_PACKET_SIZE);
        props.request_response_information.get_or_insert(0);
        props.request_problem_information.get_or_insert(1);

        if let Some(will) = connect.will.as_mut() {
            let expiry = will
                .properties
                .message_expiry_interval
                .unwrap_or(u32::MAX)
                .min(self.max_message_expiry_interval);
            will.properties.message_expiry_interval = Some(expiry);
            will.properties.will_delay_interval.get_or_insert(0);
        }

        connect
    }

    /// Check the normalized CONNECT against the server restrictions
    pub fn check(&self, connect: &Connect) -> Result<(), Refusal> {
        self.check_client_id(connect)?;
        self.check_will_topic(connect)?;
        self.check_will_qos(connect)?;
        self.check_will_retain(connect)
    }

    fn check_client_id(&self, connect: &Connect) -> Result<(), Refusal> {
        // Server-assigned identifiers are always within bounds
        if connect.client_id_assigned {
            return Ok(());
        }
        if connect.client_id.len() > self.max_client_id_length {
            return Err(Refusal {
                reason_code: ReasonCode::ClientIdNotValid,
                reason_string: format!(
                    "Client identifier is longer than {} characters",
                    self.max_client_id_length
                ),
                event_reason: "Sent CONNECT with Client identifier too long".to_string(),
            });
        }
        Ok(())
    }

    fn check_will_topic(&self, connect: &Connect) -> Result<(), Refusal> {
        if let Some(will) = &connect.will {
            if will.topic.contains('#') || will.topic.contains('+') {
                return Err(Refusal {
                    reason_code: ReasonCode::TopicNameInvalid,
                    reason_string: "Will Publish topic contains wildcard characters (#/+)"
                        .to_string(),
                    event_reason: "Sent CONNECT with wildcard character in the Will Topic (#/+)"
                        .to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_will_qos(&self, connect: &Connect) -> Result<(), Refusal> {
        if let Some(will) = &connect.will {
            let will_qos = will.qos as u8;
            if will_qos > self.maximum_qos {
                return Err(Refusal {
                    reason_code: ReasonCode::QoSNotSupported,
                    reason_string: format!(
                        "Will QoS {} exceeds maximum supported QoS {}",
                        will_qos, self.maximum_qos
                    ),
                    event_reason: format!(
                        "Sent CONNECT with Will QoS ({}) higher than the allowed maximum ({})",
                        will_qos, self.maximum_qos
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_will_retain(&self, connect: &Connect) -> Result<(), Refusal> {
        if let Some(will) = &connect.will {
            if will.retain && !self.retained_messages_enabled {
                return Err(Refusal {
                    reason_code: ReasonCode::RetainNotSupported,
                    reason_string: "Will Retain set although retained messages are not available"
                        .to_string(),
                    event_reason:
                        "Sent CONNECT with Will Retain set although retain is not available"
                            .to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Generate a random identifier suffix
fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
