//! CONNECT admission unit tests

use std::sync::Arc;

use bytes::Bytes;

use super::connack::ConnackBuilder;
use super::validator::ConnectValidator;
use super::*;
use crate::alias::TopicAliasLimiter;
use crate::channel::Channel;
use crate::config::{Config, MQTT_MAX_PACKET_SIZE};
use crate::events::TracingEventLog;
use crate::protocol::{ProtocolVersion, QoS};

fn test_config() -> Config {
    Config::parse(
        r#"
        [restrictions]
        max_client_id_length = 23

        [mqtt]
        maximum_qos = 1
        max_session_expiry_interval = 3600
        max_message_expiry_interval = 600
        keep_alive_max = 300
        topic_alias_max_per_client = 4
        "#,
    )
    .unwrap()
}

fn new_channel() -> Arc<Channel> {
    let (channel, mut rx) = Channel::new("127.0.0.1:1883".parse().unwrap(), 16);
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            packet.confirm();
        }
    });
    channel
}

fn will(topic: &str, qos: QoS, retain: bool) -> Will {
    Will {
        topic: topic.to_string(),
        payload: Bytes::from_static(b"gone"),
        qos,
        retain,
        properties: Default::default(),
    }
}

mod validator_tests {
    use super::*;

    #[test]
    fn test_default_fill() {
        let validator = ConnectValidator::new(&test_config());
        let normalized = validator.normalize(Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        });

        let props = &normalized.properties;
        assert_eq!(props.session_expiry_interval, Some(0));
        assert_eq!(props.receive_maximum, Some(65535));
        assert_eq!(props.topic_alias_maximum, Some(0));
        assert_eq!(props.maximum_packet_size, Some(MQTT_MAX_PACKET_SIZE));
        assert_eq!(props.request_response_information, Some(0));
        assert_eq!(props.request_problem_information, Some(1));
    }

    #[test]
    fn test_default_fill_is_idempotent() {
        let validator = ConnectValidator::new(&test_config());
        let explicit = validator.normalize(Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        });
        let twice = validator.normalize(explicit.clone());
        assert_eq!(explicit, twice, "filling defaults twice must not change anything");
    }

    #[test]
    fn test_will_defaults_capped() {
        let validator = ConnectValidator::new(&test_config());
        let mut connect = Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        };
        let mut w = will("state/c1", QoS::AtMostOnce, false);
        w.properties.message_expiry_interval = Some(10_000);
        connect.will = Some(w);

        let normalized = validator.normalize(connect);
        let w = normalized.will.unwrap();
        // Capped to the configured 600s maximum
        assert_eq!(w.properties.message_expiry_interval, Some(600));
        assert_eq!(w.properties.will_delay_interval, Some(0));
    }

    #[test]
    fn test_unset_will_expiry_becomes_server_maximum() {
        let validator = ConnectValidator::new(&test_config());
        let mut connect = Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        };
        connect.will = Some(will("state/c1", QoS::AtMostOnce, false));

        let normalized = validator.normalize(connect);
        assert_eq!(
            normalized.will.unwrap().properties.message_expiry_interval,
            Some(600)
        );
    }

    #[test]
    fn test_empty_client_id_gets_assigned() {
        let validator = ConnectValidator::new(&test_config());
        let normalized = validator.normalize(Connect::default());
        assert!(!normalized.client_id.is_empty());
        assert!(normalized.client_id_assigned);
        assert!(normalized.client_id.starts_with("gatemq-"));
        // Assigned identifiers pass the length check regardless of the
        // configured bound
        assert!(validator.check(&normalized).is_ok());
    }

    #[test]
    fn test_client_id_length_boundary() {
        let validator = ConnectValidator::new(&test_config());

        let at_limit = validator.normalize(Connect {
            client_id: "a".repeat(23),
            ..Connect::default()
        });
        assert!(validator.check(&at_limit).is_ok(), "exactly the limit is accepted");

        let over_limit = validator.normalize(Connect {
            client_id: "a".repeat(24),
            ..Connect::default()
        });
        let refusal = validator.check(&over_limit).unwrap_err();
        assert_eq!(refusal.reason_code, ReasonCode::ClientIdNotValid);
    }

    #[test]
    fn test_will_wildcard_refused() {
        let validator = ConnectValidator::new(&test_config());
        for topic in ["a/#/b", "a/+/b", "#", "sensors/+"] {
            let mut connect = Connect {
                client_id: "c1".to_string(),
                ..Connect::default()
            };
            connect.will = Some(will(topic, QoS::AtMostOnce, false));
            let connect = validator.normalize(connect);
            let refusal = validator.check(&connect).unwrap_err();
            assert_eq!(
                refusal.reason_code,
                ReasonCode::TopicNameInvalid,
                "topic {} must be refused",
                topic
            );
        }
    }

    #[test]
    fn test_will_qos_above_maximum_refused() {
        let validator = ConnectValidator::new(&test_config());
        let mut connect = Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        };
        connect.will = Some(will("state/c1", QoS::ExactlyOnce, false));
        let connect = validator.normalize(connect);
        let refusal = validator.check(&connect).unwrap_err();
        assert_eq!(refusal.reason_code, ReasonCode::QoSNotSupported);
    }

    #[test]
    fn test_will_retain_refused_when_disabled() {
        let mut config = test_config();
        config.mqtt.retained_messages_enabled = false;
        let validator = ConnectValidator::new(&config);

        let mut connect = Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        };
        connect.will = Some(will("state/c1", QoS::AtMostOnce, true));
        let connect = validator.normalize(connect);
        let refusal = validator.check(&connect).unwrap_err();
        assert_eq!(refusal.reason_code, ReasonCode::RetainNotSupported);
    }
}

mod connack_tests {
    use super::*;

    fn normalized(connect: Connect) -> Connect {
        ConnectValidator::new(&test_config()).normalize(connect)
    }

    #[tokio::test]
    async fn test_v5_server_capabilities() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(100);
        let channel = new_channel();
        let connect = normalized(Connect {
            client_id: "c1".to_string(),
            keep_alive: 60,
            ..Connect::default()
        });

        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(connack.reason_code, ReasonCode::Success);
        assert!(!connack.session_present);

        let props = &connack.properties;
        assert_eq!(props.receive_maximum, Some(65535));
        assert_eq!(props.maximum_qos, Some(1), "QoS below 2 is advertised");
        assert_eq!(props.retain_available, Some(1));
        assert_eq!(props.maximum_packet_size, Some(MQTT_MAX_PACKET_SIZE));
        assert_eq!(props.wildcard_subscription_available, Some(1));
        assert_eq!(props.subscription_identifier_available, Some(1));
        assert_eq!(props.shared_subscription_available, Some(1));
        assert_eq!(props.server_keep_alive, None, "60s needs no override");
        assert_eq!(props.session_expiry_interval, None, "0 was not clamped");
        assert_eq!(props.assigned_client_identifier, None);
    }

    #[tokio::test]
    async fn test_session_expiry_clamped_and_advertised() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(100);
        let channel = new_channel();

        let mut connect = Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        };
        connect.properties.session_expiry_interval = Some(7200);
        let connect = normalized(connect);

        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(
            connack.properties.session_expiry_interval,
            Some(3600),
            "clamped value is sent back"
        );
        assert_eq!(channel.attrs().session_expiry_interval, 3600);
    }

    #[tokio::test]
    async fn test_session_expiry_within_limit_omitted() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(100);
        let channel = new_channel();

        let mut connect = Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        };
        connect.properties.session_expiry_interval = Some(3600);
        let connect = normalized(connect);

        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(
            connack.properties.session_expiry_interval, None,
            "client keeps its own value"
        );
        assert_eq!(channel.attrs().session_expiry_interval, 3600);
    }

    #[test]
    fn test_session_expiry_clamp_is_idempotent() {
        let builder = ConnackBuilder::new(&test_config());
        let mut connect = Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        };
        connect.properties.session_expiry_interval = Some(50_000);
        let connect = normalized(connect);

        let once = builder.effective_session_expiry(&connect);
        let mut clamped = connect.clone();
        clamped.properties.session_expiry_interval = Some(once);
        assert_eq!(builder.effective_session_expiry(&clamped), once);
    }

    #[tokio::test]
    async fn test_server_keep_alive_overrides() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(100);

        // keep_alive above the maximum is clamped
        let channel = new_channel();
        let connect = normalized(Connect {
            client_id: "c1".to_string(),
            keep_alive: 301,
            ..Connect::default()
        });
        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(connack.properties.server_keep_alive, Some(300));
        assert_eq!(channel.attrs().connect_keep_alive, 300);

        // zero keep_alive with allow_zero=false is raised to the maximum
        let mut config = test_config();
        config.mqtt.keep_alive_allow_zero = false;
        let builder = ConnackBuilder::new(&config);
        let channel = new_channel();
        let connect = normalized(Connect {
            client_id: "c1".to_string(),
            keep_alive: 0,
            ..Connect::default()
        });
        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(connack.properties.server_keep_alive, Some(300));
        assert_eq!(channel.attrs().connect_keep_alive, 300);

        // zero keep_alive with allow_zero=true stays disabled
        let builder = ConnackBuilder::new(&test_config());
        let channel = new_channel();
        let connect = normalized(Connect {
            client_id: "c1".to_string(),
            keep_alive: 0,
            ..Connect::default()
        });
        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(connack.properties.server_keep_alive, None);
        assert_eq!(channel.attrs().connect_keep_alive, 0);
    }

    #[tokio::test]
    async fn test_topic_alias_reservation() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(6);
        let channel = new_channel();
        let connect = normalized(Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        });

        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(connack.properties.topic_alias_maximum, Some(4));
        assert_eq!(channel.attrs().topic_alias_mapping.len(), 4);
        assert_eq!(limiter.in_use(), 4);

        // Pool nearly exhausted: the next channel gets no aliases
        let channel2 = new_channel();
        let connack2 = builder.build(&channel2, &connect, false, &limiter);
        assert_eq!(limiter.in_use(), 8, "reservation still recorded");
        assert!(connack2.properties.topic_alias_maximum.is_some());

        let channel3 = new_channel();
        let connack3 = builder.build(&channel3, &connect, false, &limiter);
        assert_eq!(connack3.properties.topic_alias_maximum, None);
        assert!(channel3.attrs().topic_alias_mapping.is_empty());
    }

    #[tokio::test]
    async fn test_client_packet_size_cap_recorded() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(100);
        let channel = new_channel();

        let mut connect = Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        };
        connect.properties.maximum_packet_size = Some(4096);
        let connect = normalized(connect);

        builder.build(&channel, &connect, false, &limiter);
        assert_eq!(channel.attrs().max_packet_size_send, Some(4096));

        // Unlimited stays unset
        let channel = new_channel();
        let connect = normalized(Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        });
        builder.build(&channel, &connect, false, &limiter);
        assert_eq!(channel.attrs().max_packet_size_send, None);
    }

    #[tokio::test]
    async fn test_assigned_identifier_advertised() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(100);
        let channel = new_channel();
        let connect = normalized(Connect::default());
        assert!(connect.client_id_assigned);

        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(
            connack.properties.assigned_client_identifier.as_deref(),
            Some(connect.client_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_auth_user_properties_drained() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(100);
        let channel = new_channel();
        channel
            .attrs_mut()
            .auth_user_properties
            .push(("tier".to_string(), "gold".to_string()));

        let connect = normalized(Connect {
            client_id: "c1".to_string(),
            ..Connect::default()
        });
        let connack = builder.build(&channel, &connect, false, &limiter);
        assert_eq!(
            connack.properties.user_properties,
            vec![("tier".to_string(), "gold".to_string())]
        );
        assert!(channel.attrs().auth_user_properties.is_empty(), "drained");
    }

    #[tokio::test]
    async fn test_v3_connack_is_fixed() {
        let builder = ConnackBuilder::new(&test_config());
        let limiter = TopicAliasLimiter::new(100);
        let channel = new_channel();

        let connect = normalized(Connect {
            protocol_version: ProtocolVersion::V311,
            client_id: "c1".to_string(),
            clean_start: false,
            keep_alive: 30,
            ..Connect::default()
        });
        let connack = builder.build(&channel, &connect, true, &limiter);

        assert!(connack.session_present);
        assert_eq!(connack.reason_code, ReasonCode::Success);
        assert!(connack.properties.is_empty(), "v3 carries no properties");
        // Session expiry lives only on the channel for v3
        assert_eq!(
            channel.attrs().session_expiry_interval,
            3600,
            "persistent v3 session clamped to the configured maximum"
        );
        assert_eq!(channel.attrs().connect_keep_alive, 30);
    }
}

mod takeover_tests {
    use super::*;
    use crate::channel::ChannelRegistry;
    use crate::metrics::Metrics;
    use std::time::Duration;

    fn arbiter(registry: Arc<ChannelRegistry>) -> TakeoverArbiter {
        TakeoverArbiter::new(registry, Arc::new(TracingEventLog), Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_no_prior_channel_completes_immediately() {
        let registry = Arc::new(ChannelRegistry::new());
        let arbiter = arbiter(registry);
        tokio::time::timeout(Duration::from_millis(100), arbiter.displace_existing("c1"))
            .await
            .expect("must resolve without a prior channel");
    }

    #[tokio::test]
    async fn test_prior_channel_displaced() {
        let registry = Arc::new(ChannelRegistry::new());
        let (prior, _rx) = Channel::new("127.0.0.1:1883".parse().unwrap(), 4);
        prior.init_disconnect_signal();
        registry.persist(Arc::from("c1"), prior.clone());

        // Simulate the transport finishing teardown after close
        {
            let prior = prior.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                prior.closed_wait().await;
                registry.remove("c1", &prior);
                prior.complete_disconnect();
            });
        }

        let arbiter = arbiter(registry.clone());
        tokio::time::timeout(Duration::from_secs(1), arbiter.displace_existing("c1"))
            .await
            .expect("displacement must finish");

        assert!(prior.is_taken_over());
        assert!(prior.is_closed());
        assert!(registry.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_takeover_waits_for_first() {
        let registry = Arc::new(ChannelRegistry::new());
        let (prior, _rx) = Channel::new("127.0.0.1:1883".parse().unwrap(), 4);
        prior.init_disconnect_signal();
        // Marked as already being taken over by someone else
        prior.set_taken_over();
        registry.persist(Arc::from("c1"), prior.clone());

        let arbiter = Arc::new(arbiter(registry.clone()));
        let second = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move { arbiter.displace_existing("c1").await })
        };

        // Not resolved while the first takeover is pending
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        // First takeover completes: entry removed, signal fired
        registry.remove("c1", &prior);
        prior.complete_disconnect();

        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .expect("second takeover must proceed after the first completes")
            .unwrap();
    }

    #[tokio::test]
    async fn test_prior_without_signal_waits_for_close() {
        let registry = Arc::new(ChannelRegistry::new());
        let (prior, _rx) = Channel::new("127.0.0.1:1883".parse().unwrap(), 4);
        // Never validated: no disconnect signal installed
        registry.persist(Arc::from("c1"), prior.clone());

        let arbiter = arbiter(registry);
        tokio::time::timeout(Duration::from_secs(1), arbiter.displace_existing("c1"))
            .await
            .expect("close future is enough when no signal exists");
        assert!(prior.is_closed());
    }
}
