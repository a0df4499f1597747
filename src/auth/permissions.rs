//! Default permissions and the will-publish evaluator
//!
//! Authenticators install a set of topic permissions on the channel;
//! when no extension authorizer decides about the Last Will, the will
//! publish is evaluated against these. Patterns support MQTT wildcards
//! (`#` and `+`).

use crate::protocol::{QoS, Will};

/// What a permission applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionActivity {
    Publish,
    Subscribe,
    All,
}

impl PermissionActivity {
    fn covers_publish(self) -> bool {
        matches!(self, PermissionActivity::Publish | PermissionActivity::All)
    }
}

/// Allow or deny on match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// One topic permission entry
#[derive(Debug, Clone)]
pub struct TopicPermission {
    /// Topic pattern, may contain MQTT wildcards
    pub filter: String,
    /// Which activity the entry covers
    pub activity: PermissionActivity,
    /// Highest QoS the entry permits
    pub max_qos: QoS,
    /// Whether retained publishes are permitted
    pub retain_allowed: bool,
    /// Verdict when the entry matches
    pub decision: PermissionDecision,
}

impl TopicPermission {
    /// Allow-all entry for a topic pattern
    pub fn allow(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            activity: PermissionActivity::All,
            max_qos: QoS::ExactlyOnce,
            retain_allowed: true,
            decision: PermissionDecision::Allow,
        }
    }

    /// Deny-all entry for a topic pattern
    pub fn deny(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            activity: PermissionActivity::All,
            max_qos: QoS::ExactlyOnce,
            retain_allowed: true,
            decision: PermissionDecision::Deny,
        }
    }

    fn matches_will(&self, will: &Will) -> bool {
        self.activity.covers_publish() && topic_matches(&self.filter, &will.topic)
    }
}

/// Permissions installed on a channel by authentication.
///
/// The default behaviour applies when no entry matches; extensions can
/// override it, and whether they did matters for the deny-by-default
/// rule of the will-authorization stage.
#[derive(Debug, Clone)]
pub struct DefaultPermissions {
    permissions: Vec<TopicPermission>,
    default_decision: PermissionDecision,
    default_overridden: bool,
}

impl DefaultPermissions {
    pub fn new() -> Self {
        Self {
            permissions: Vec::new(),
            default_decision: PermissionDecision::Allow,
            default_overridden: false,
        }
    }

    pub fn add(&mut self, permission: TopicPermission) {
        self.permissions.push(permission);
    }

    pub fn extend(&mut self, other: &DefaultPermissions) {
        self.permissions.extend(other.permissions.iter().cloned());
        if other.default_overridden {
            self.default_decision = other.default_decision;
            self.default_overridden = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    /// Change what happens when no entry matches
    pub fn set_default_decision(&mut self, decision: PermissionDecision) {
        self.default_decision = decision;
        self.default_overridden = true;
    }

    /// Whether an extension changed the unmatched-entry behaviour
    pub fn default_overridden(&self) -> bool {
        self.default_overridden
    }

    /// Evaluate the will publish of a CONNECT. The first matching entry
    /// decides; without a match the default behaviour applies.
    pub fn check_will(&self, will: &Will) -> bool {
        for permission in &self.permissions {
            if !permission.matches_will(will) {
                continue;
            }
            if permission.decision == PermissionDecision::Deny {
                return false;
            }
            if will.qos > permission.max_qos {
                return false;
            }
            if will.retain && !permission.retain_allowed {
                return false;
            }
            return true;
        }
        self.default_decision == PermissionDecision::Allow
    }
}

impl Default for DefaultPermissions {
    fn default() -> Self {
        Self::new()
    }
}

/// Match a topic name against an MQTT filter, walking both level by
/// level. `#` swallows the remainder of the topic (including the parent
/// level itself, per the filter rules), `+` consumes exactly one level.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = filter.split('/');
    let mut names = topic.split('/');

    loop {
        match (levels.next(), names.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(level), Some(name)) if level == name => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::Properties;

    fn will_publish(topic: &str, qos: QoS, retain: bool) -> Will {
        Will {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"offline"),
            qos,
            retain,
            properties: Properties::default(),
        }
    }

    #[test]
    fn test_filter_matching() {
        assert!(topic_matches("devices/d1/state", "devices/d1/state"));
        assert!(!topic_matches("devices/d1/state", "devices/d2/state"));
        assert!(!topic_matches("devices/d1", "devices/d1/state"));
        assert!(!topic_matches("devices/d1/state", "devices/d1"));

        assert!(topic_matches("devices/+/state", "devices/d7/state"));
        assert!(!topic_matches("devices/+", "devices/d7/state"));

        assert!(topic_matches("devices/#", "devices/d7/state"));
        assert!(topic_matches("devices/#", "devices"), "# covers the parent level");
        assert!(topic_matches("#", "any/topic/at/all"));
        assert!(!topic_matches("alerts/#", "devices/d1"));
    }

    #[test]
    fn test_first_matching_entry_decides() {
        let mut permissions = DefaultPermissions::new();
        permissions.add(TopicPermission::deny("alerts/#"));
        permissions.add(TopicPermission::allow("#"));

        assert!(!permissions.check_will(&will_publish("alerts/fire", QoS::AtMostOnce, false)));
        assert!(permissions.check_will(&will_publish("status/c1", QoS::AtMostOnce, false)));
    }

    #[test]
    fn test_qos_and_retain_limits_on_a_matching_entry() {
        let mut entry = TopicPermission::allow("status/#");
        entry.max_qos = QoS::AtLeastOnce;
        entry.retain_allowed = false;

        let mut permissions = DefaultPermissions::new();
        permissions.add(entry);
        permissions.set_default_decision(PermissionDecision::Deny);

        assert!(permissions.check_will(&will_publish("status/c1", QoS::AtLeastOnce, false)));
        assert!(!permissions.check_will(&will_publish("status/c1", QoS::ExactlyOnce, false)));
        assert!(!permissions.check_will(&will_publish("status/c1", QoS::AtMostOnce, true)));
    }

    #[test]
    fn test_subscribe_only_entry_does_not_cover_the_will() {
        let mut entry = TopicPermission::allow("status/#");
        entry.activity = PermissionActivity::Subscribe;

        let mut permissions = DefaultPermissions::new();
        permissions.add(entry);
        permissions.set_default_decision(PermissionDecision::Deny);

        assert!(!permissions.check_will(&will_publish("status/c1", QoS::AtMostOnce, false)));
    }

    #[test]
    fn test_default_decision_applies_without_a_match() {
        let mut permissions = DefaultPermissions::new();
        assert!(permissions.is_empty());
        assert!(!permissions.default_overridden());
        assert!(
            permissions.check_will(&will_publish("status/c1", QoS::AtMostOnce, false)),
            "unmatched wills fall through to the default allow"
        );

        permissions.set_default_decision(PermissionDecision::Deny);
        assert!(permissions.default_overridden());
        assert!(!permissions.check_will(&will_publish("status/c1", QoS::AtMostOnce, false)));
    }
}
