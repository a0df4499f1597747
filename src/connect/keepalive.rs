//! Keep-alive idle monitoring
//!
//! Installed during session installation when the effective keep alive
//! is non-zero. The monitor closes the channel once no inbound activity
//! was seen for `ceil(keep_alive * grace_factor)` seconds; the MQTT
//! specification grants clients a 1.5x grace period.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::channel::Channel;
use crate::events::EventLog;

const IDLE_REASON: &str = "Keep alive timeout";

/// Compute the idle timeout for a keep alive value
pub(crate) fn idle_timeout(keep_alive_secs: u16, grace_factor: f64) -> Duration {
    Duration::from_secs((keep_alive_secs as f64 * grace_factor).ceil() as u64)
}

/// Arm the idle watchdog for a channel. A keep alive of zero installs
/// nothing; the connection may idle forever.
pub(crate) fn install_keep_alive(
    channel: &Arc<Channel>,
    keep_alive_secs: u16,
    grace_factor: f64,
    event_log: Arc<dyn EventLog>,
) {
    if keep_alive_secs == 0 {
        return;
    }

    let timeout = idle_timeout(keep_alive_secs, grace_factor);
    trace!(
        addr = %channel.addr(),
        keep_alive_secs,
        timeout_secs = timeout.as_secs(),
        "arming keep-alive idle monitor"
    );

    channel.touch();
    channel.attrs_mut().keep_alive_installed = true;

    let channel = channel.clone();
    tokio::spawn(async move {
        loop {
            let idle = channel.last_activity().elapsed();
            if idle >= timeout {
                debug!(
                    addr = %channel.addr(),
                    idle_secs = idle.as_secs(),
                    "keep alive expired, disconnecting"
                );
                event_log.client_disconnected(&channel, Some(IDLE_REASON));
                channel.close();
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(timeout - idle) => {}
                _ = channel.closed_wait() => return,
            }
        }
    });
}
