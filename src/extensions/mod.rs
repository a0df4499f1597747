//! Extension runtime
//!
//! Provides the pluggable policy surface of admission: authenticator
//! providers that judge CONNECT packets and will authorizers that judge
//! the Last Will publish. Extension code runs on a shared, bounded task
//! executor, never on a channel's own task; results are applied back on
//! the channel task by the orchestrator.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::auth::DefaultPermissions;
use crate::channel::Channel;
use crate::protocol::{AckReasonCode, Connect, ReasonCode};


type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Shared bounded executor for extension tasks.
///
/// Submission is non-blocking: when the queue is full, `try_submit`
/// returns false and the caller decides how to degrade.
pub struct TaskExecutor {
    queue: mpsc::Sender<BoxedTask>,
}

impl TaskExecutor {
    /// Create an executor with the given queue capacity and worker count
    pub fn new(capacity: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<BoxedTask>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match task {
                        Some(task) => task.await,
                        None => break,
                    }
                }
            });
        }

        Self { queue: tx }
    }

    /// Try to enqueue a task. Returns false when the queue is full.
    pub fn try_submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queue.try_send(Box::pin(task)).is_ok()
    }
}

/// Input handed to every authenticator provider for one CONNECT
pub struct AuthenticatorInput {
    /// Client identifier from the (validated) CONNECT
    pub client_id: Arc<str>,
    /// The CONNECT under judgment
    pub connect: Connect,
    /// Handle of the connecting channel. Read-only for extensions;
    /// attribute changes go through the verdict.
    pub channel: Arc<Channel>,
}

/// One authenticator provider's verdict on a CONNECT
#[derive(Debug, Clone)]
pub enum AuthVerdict {
    /// Admit the client, optionally installing permissions and CONNACK
    /// user properties
    Success {
        permissions: Option<DefaultPermissions>,
        user_properties: Vec<(String, String)>,
    },
    /// Refuse the client with the given CONNACK reason
    Failure {
        reason_code: ReasonCode,
        reason_string: Option<String>,
    },
    /// No decision; defer to other providers or server policy
    Continue,
}

impl AuthVerdict {
    /// Plain success without permissions or user properties
    pub fn success() -> Self {
        AuthVerdict::Success {
            permissions: None,
            user_properties: Vec::new(),
        }
    }

    /// Refusal with the default "not authorized" code
    pub fn failure(reason_string: impl Into<String>) -> Self {
        AuthVerdict::Failure {
            reason_code: ReasonCode::NotAuthorized,
            reason_string: Some(reason_string.into()),
        }
    }
}

/// An extension-provided authenticator
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, input: &AuthenticatorInput) -> AuthVerdict;
}

/// Registry of authenticator providers, keyed by extension name
pub struct Authenticators {
    providers: RwLock<HashMap<String, Arc<dyn Authenticator>>>,
}

impl Authenticators {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a provider under its extension name, replacing any
    /// previous provider of that name
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn Authenticator>) {
        let name = name.into();
        trace!(extension = %name, "registering authenticator");
        self.providers.write().insert(name, provider);
    }

    pub fn unregister(&self, name: &str) {
        self.providers.write().remove(name);
    }

    pub fn available(&self) -> bool {
        !self.providers.read().is_empty()
    }

    /// Snapshot of the registered providers
    pub fn providers(&self) -> Vec<(String, Arc<dyn Authenticator>)> {
        self.providers
            .read()
            .iter()
            .map(|(name, provider)| (name.clone(), provider.clone()))
            .collect()
    }
}

impl Default for Authenticators {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of the extension will-authorization stage
#[derive(Debug, Clone, Default)]
pub struct WillAuthResult {
    /// An authorizer looked at the will
    pub authorizer_present: bool,
    /// Explicit publish-level decision, if one was made
    pub ack_reason_code: Option<AckReasonCode>,
    /// Disconnect-level reason attached to a denial
    pub disconnect_reason_code: Option<ReasonCode>,
    /// Human-readable denial reason
    pub reason_string: Option<String>,
}

/// An extension-provided authorizer for the Last Will publish
#[async_trait]
pub trait WillAuthorizer: Send + Sync {
    async fn authorize_will(&self, channel: &Channel, connect: &Connect) -> WillAuthResult;
}

/// Registry of will authorizers
pub struct Authorizers {
    providers: RwLock<Vec<Arc<dyn WillAuthorizer>>>,
}

impl Authorizers {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, provider: Arc<dyn WillAuthorizer>) {
        self.providers.write().push(provider);
    }

    pub fn available(&self) -> bool {
        !self.providers.read().is_empty()
    }

    /// Run the registered authorizers against the will of a CONNECT.
    ///
    /// The first provider that makes an explicit decision wins; when
    /// none decides, the result still records that authorizers were
    /// consulted so the caller applies the deny-by-default policy.
    pub async fn authorize_will(&self, channel: &Channel, connect: &Connect) -> WillAuthResult {
        let providers: Vec<_> = self.providers.read().clone();
        let mut undecided = WillAuthResult {
            authorizer_present: !providers.is_empty(),
            ..WillAuthResult::default()
        };

        for provider in providers {
            let result = provider.authorize_will(channel, connect).await;
            if result.ack_reason_code.is_some() || result.disconnect_reason_code.is_some() {
                return WillAuthResult {
                    authorizer_present: true,
                    ..result
                };
            }
            if result.reason_string.is_some() {
                undecided.reason_string = result.reason_string;
            }
        }

        undecided
    }
}

impl Default for Authorizers {
    fn default() -> Self {
        Self::new()
    }
}
