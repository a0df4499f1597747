//! Session takeover arbitration
//!
//! Two connections with the same client identifier must not both become
//! live, and two concurrent takeovers of the same prior channel must
//! not both run. A striped lock keyed by client identifier serializes
//! the displacement decision; waiting for the displaced channel to
//! finish tearing down happens outside the stripe.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::channel::{Channel, ChannelRegistry, DisconnectWaiter};
use crate::events::EventLog;
use crate::metrics::Metrics;

/// Safety net against a lost disconnect completion: after this many
/// chained waits the arbiter stops deferring and displaces outright.
pub(crate) const MAX_TAKEOVER_RETRIES: usize = 100;

const TAKEOVER_REASON: &str = "Another client connected with the same client id";

/// Serializes takeovers per client identifier
pub struct TakeoverArbiter {
    stripes: Vec<Mutex<()>>,
    hasher: ahash::RandomState,
    registry: Arc<ChannelRegistry>,
    event_log: Arc<dyn EventLog>,
    metrics: Arc<Metrics>,
}

/// What to await after the stripe was released
enum Step {
    /// No prior channel, proceed immediately
    Clear,
    /// A concurrent takeover owns the prior channel; wait for it to
    /// finish and look again
    WaitAndRetry(DisconnectWaiter),
    /// We displaced the prior channel; wait for its teardown
    WaitDone(DisconnectWaiter),
    /// Displaced a channel that never fully connected; its close is all
    /// there is to wait for
    WaitClose(Arc<Channel>),
}

impl TakeoverArbiter {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        event_log: Arc<dyn EventLog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let stripe_count = parallelism * 16;
        Self {
            stripes: (0..stripe_count).map(|_| Mutex::new(())).collect(),
            hasher: ahash::RandomState::new(),
            registry,
            event_log,
            metrics,
        }
    }

    fn stripe(&self, client_id: &str) -> &Mutex<()> {
        let index = self.hasher.hash_one(client_id) as usize % self.stripes.len();
        &self.stripes[index]
    }

    /// Displace any live channel registered under the client identifier
    /// and wait until it is fully gone. Resolves immediately when there
    /// is none.
    pub async fn displace_existing(&self, client_id: &str) {
        let mut retry = 0usize;
        loop {
            let step = {
                let _guard = self.stripe(client_id).lock();
                match self.registry.get(client_id) {
                    None => Step::Clear,
                    Some(prior) => self.decide(client_id, prior, retry),
                }
            };

            match step {
                Step::Clear => return,
                Step::WaitAndRetry(waiter) => {
                    waiter.wait().await;
                    retry += 1;
                }
                Step::WaitDone(waiter) => {
                    waiter.wait().await;
                    return;
                }
                Step::WaitClose(prior) => {
                    prior.closed_wait().await;
                    return;
                }
            }
        }
    }

    /// Pick the next step for one attempt. Runs under the stripe lock.
    fn decide(&self, client_id: &str, prior: Arc<Channel>, retry: usize) -> Step {
        let waiter = prior.disconnect_waiter();

        if prior.is_taken_over() && retry < MAX_TAKEOVER_RETRIES {
            // Someone else is already taking this channel over; defer
            // until their teardown completed, then re-examine the
            // registry, which by then points at the new owner.
            if let Some(waiter) = waiter {
                return Step::WaitAndRetry(waiter);
            }
            // No completion signal to chain on: fall through and
            // displace outright.
        }

        if retry >= MAX_TAKEOVER_RETRIES {
            self.metrics.takeover_retries_exhausted_total.inc();
            debug!(
                client_id,
                "takeover retries exhausted, displacing unconditionally"
            );
        }

        debug!(
            client_id,
            "disconnecting already connected client because another client connects with that id"
        );
        prior.set_taken_over();
        self.event_log
            .client_disconnected(&prior, Some(TAKEOVER_REASON));
        self.metrics.takeovers_total.inc();
        prior.close();

        match waiter {
            Some(waiter) => Step::WaitDone(waiter),
            None => Step::WaitClose(prior),
        }
    }
}
