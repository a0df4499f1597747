//! Authentication orchestration
//!
//! Fans one CONNECT out to every registered authenticator provider on
//! the extension task executor, collapses their verdicts into a single
//! outcome, and applies the server policy for unauthenticated
//! connections when no provider decides.

mod permissions;

pub use permissions::{
    DefaultPermissions, PermissionActivity, PermissionDecision, TopicPermission,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::extensions::{AuthVerdict, AuthenticatorInput, Authenticators, TaskExecutor};
use crate::metrics::Metrics;
use crate::protocol::{Connect, ReasonCode};


/// Collapsed result of the authentication stage
#[derive(Debug)]
pub enum AuthOutcome {
    /// At least one provider admitted the client
    Authenticated,
    /// No provider was registered and policy lets the client through
    Bypassed,
    /// The client is refused with the given CONNACK reason
    Refused {
        reason_code: ReasonCode,
        reason_string: String,
    },
}

/// Runs the authenticator fan-out for one broker instance
pub struct AuthOrchestrator {
    authenticators: Arc<Authenticators>,
    executor: Arc<TaskExecutor>,
    metrics: Arc<Metrics>,
    deny_unauthenticated: bool,
    task_timeout: Duration,
}

impl AuthOrchestrator {
    pub fn new(
        authenticators: Arc<Authenticators>,
        executor: Arc<TaskExecutor>,
        metrics: Arc<Metrics>,
        deny_unauthenticated: bool,
        task_timeout: Duration,
    ) -> Self {
        Self {
            authenticators,
            executor,
            metrics,
            deny_unauthenticated,
            task_timeout,
        }
    }

    /// Authenticate a validated CONNECT.
    ///
    /// On success the channel attributes are updated (authenticated
    /// flag, permissions, user properties); on refusal the caller owns
    /// the CONNACK and event emission.
    pub async fn authenticate(&self, channel: &Arc<Channel>, connect: &Connect) -> AuthOutcome {
        let providers = self.authenticators.providers();

        if providers.is_empty() {
            if self.deny_unauthenticated {
                return AuthOutcome::Refused {
                    reason_code: ReasonCode::NotAuthorized,
                    reason_string: "no authenticator registered".to_string(),
                };
            }
            self.apply_bypass(channel);
            return AuthOutcome::Bypassed;
        }

        // v5 enhanced auth: hold back non-AUTH packets until the
        // providers resolved
        if let Some(method) = connect.auth_method() {
            channel.attrs_mut().auth_method = Some(method.to_string());
            channel.set_auth_pending(true);
        }

        let expected = providers.len();
        let (tx, rx) = mpsc::channel::<AuthVerdict>(expected);
        let input = Arc::new(AuthenticatorInput {
            client_id: Arc::from(connect.client_id.as_str()),
            connect: connect.clone(),
            channel: channel.clone(),
        });

        for (name, provider) in providers {
            let tx = tx.clone();
            let fallback_tx = tx.clone();
            let input = input.clone();
            let timeout = self.task_timeout;
            let submitted = self.executor.try_submit(async move {
                let verdict = match tokio::time::timeout(timeout, provider.authenticate(&input))
                    .await
                {
                    Ok(verdict) => verdict,
                    // A provider that never answers abstains
                    Err(_) => AuthVerdict::Continue,
                };
                let _ = tx.send(verdict).await;
            });

            if !submitted {
                warn!(extension = %name, "extension task queue full, ignoring authenticator");
                self.metrics.auth_task_queue_full_total.inc();
                // Credit the refused task so the count still reaches N
                let _ = fallback_tx.try_send(AuthVerdict::Continue);
            }
        }
        drop(tx);

        match self.reduce(rx, expected).await {
            Reduced::Failure {
                reason_code,
                reason_string,
            } => {
                channel.set_auth_pending(false);
                AuthOutcome::Refused {
                    reason_code,
                    reason_string: reason_string
                        .unwrap_or_else(|| "authentication failed".to_string()),
                }
            }
            Reduced::Success {
                permissions,
                user_properties,
            } => {
                self.apply_success(channel, permissions, user_properties);
                AuthOutcome::Authenticated
            }
            Reduced::AllContinue => {
                channel.set_auth_pending(false);
                if self.deny_unauthenticated {
                    AuthOutcome::Refused {
                        reason_code: ReasonCode::NotAuthorized,
                        reason_string: "authentication not successful".to_string(),
                    }
                } else {
                    self.apply_bypass(channel);
                    AuthOutcome::Bypassed
                }
            }
        }
    }

    /// Collect all verdicts, in whatever order the tasks finish
    async fn reduce(&self, mut rx: mpsc::Receiver<AuthVerdict>, expected: usize) -> Reduced {
        let mut failure: Option<(ReasonCode, Option<String>)> = None;
        let mut success: Option<(DefaultPermissions, Vec<(String, String)>)> = None;
        let mut seen = 0;

        while seen < expected {
            let verdict = match rx.recv().await {
                Some(verdict) => verdict,
                // All senders dropped; remaining tasks died with the
                // executor, treat the rest as abstentions
                None => break,
            };
            seen += 1;

            match verdict {
                AuthVerdict::Failure {
                    reason_code,
                    reason_string,
                } => {
                    if failure.is_none() {
                        failure = Some((reason_code, reason_string));
                    }
                }
                AuthVerdict::Success {
                    permissions,
                    user_properties,
                } => {
                    let (merged_permissions, merged_props) =
                        success.get_or_insert_with(|| (DefaultPermissions::new(), Vec::new()));
                    if let Some(permissions) = permissions {
                        merged_permissions.extend(&permissions);
                    }
                    merged_props.extend(user_properties);
                }
                AuthVerdict::Continue => {}
            }
        }

        if let Some((reason_code, reason_string)) = failure {
            Reduced::Failure {
                reason_code,
                reason_string,
            }
        } else if let Some((permissions, user_properties)) = success {
            Reduced::Success {
                permissions,
                user_properties,
            }
        } else {
            Reduced::AllContinue
        }
    }

    fn apply_success(
        &self,
        channel: &Channel,
        permissions: DefaultPermissions,
        user_properties: Vec<(String, String)>,
    ) {
        let mut attrs = channel.attrs_mut();
        attrs.authenticated = true;
        attrs.auth_bypassed = false;
        attrs.auth_permissions = Some(permissions);
        attrs.auth_user_properties.extend(user_properties);
        drop(attrs);
        // Remove the enhanced-auth packet gate, if one was installed
        channel.set_auth_pending(false);
        debug!(addr = %channel.addr(), "authentication successful");
    }

    fn apply_bypass(&self, channel: &Channel) {
        let mut attrs = channel.attrs_mut();
        attrs.authenticated = false;
        attrs.auth_bypassed = true;
        if attrs.auth_permissions.is_none() {
            attrs.auth_permissions = Some(DefaultPermissions::new());
        }
    }
}

enum Reduced {
    Failure {
        reason_code: ReasonCode,
        reason_string: Option<String>,
    },
    Success {
        permissions: DefaultPermissions,
        user_properties: Vec<(String, String)>,
    },
    AllContinue,
}
