//! Channel handles and the live-connection registry
//!
//! A [`Channel`] is the admission core's view of one client connection:
//! an outbound packet queue, a close signal, a disconnect-completion
//! signal and the per-connection attribute bag that later pipeline
//! stages consume. The socket itself is owned by the transport layer;
//! it drains the outbound queue, confirms writes once bytes are
//! flushed, and calls [`Channel::complete_disconnect`] after teardown.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::auth::DefaultPermissions;
use crate::protocol::{Connect, Packet};

#[cfg(test)]
mod tests;

/// Channel error types
#[derive(Debug)]
pub enum ChannelError {
    /// The channel closed before the operation completed
    Closed,
    /// A non-AUTH packet was written before the CONNACK went out
    ConnackPending,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed"),
            ChannelError::ConnackPending => {
                write!(f, "only AUTH may be sent before the CONNACK")
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Per-connection attributes, created on CONNECT and destroyed with the
/// channel. Owned by the channel; extension tasks never touch this
/// directly, their results are applied on the channel's task.
#[derive(Debug)]
pub struct ChannelAttributes {
    /// Client identifier, set once validation accepted it
    pub client_id: Option<Arc<str>>,
    /// True iff the server chose the identifier
    pub client_id_assigned: bool,
    /// Authentication state
    pub authenticated: bool,
    /// True when no authenticator was registered and policy allowed the
    /// connection through anyway
    pub auth_bypassed: bool,
    /// v5 enhanced authentication method, while one is in use
    pub auth_method: Option<String>,
    /// Permissions installed by authentication
    pub auth_permissions: Option<DefaultPermissions>,
    /// User properties returned by authenticators, drained into the CONNACK
    pub auth_user_properties: Vec<(String, String)>,
    /// The will must not be published until will-authorization passed
    pub prevent_lwt: bool,
    /// Flow-control window granted by the client
    pub client_receive_maximum: u16,
    /// Outbound packet size cap requested by the client, when finite
    pub max_packet_size_send: Option<u32>,
    /// Effective keep alive, seconds
    pub connect_keep_alive: u16,
    /// Effective session expiry interval, seconds
    pub session_expiry_interval: u32,
    /// Topic alias slot table (slot -> topic), sized by the granted maximum
    pub topic_alias_mapping: Vec<Option<String>>,
    /// Client asked for response information in the CONNACK
    pub request_response_information: bool,
    /// Client wants reason strings on error packets
    pub request_problem_information: bool,
    /// The CONNECT retained for downstream stages
    pub connect_message: Option<Connect>,
    /// Ordered-delivery stage installed for this channel
    pub ordered_delivery_installed: bool,
    /// Flow-control stage installed for this channel (v5 only)
    pub flow_control_installed: bool,
    /// Keep-alive idle monitor installed for this channel
    pub keep_alive_installed: bool,
    /// Packets buffered while enhanced authentication is in progress
    pub pending_packets: VecDeque<Packet>,
}

impl Default for ChannelAttributes {
    fn default() -> Self {
        Self {
            client_id: None,
            client_id_assigned: false,
            authenticated: false,
            auth_bypassed: false,
            auth_method: None,
            auth_permissions: None,
            auth_user_properties: Vec::new(),
            prevent_lwt: true,
            client_receive_maximum: 65535,
            max_packet_size_send: None,
            connect_keep_alive: 0,
            session_expiry_interval: 0,
            topic_alias_mapping: Vec::new(),
            request_response_information: false,
            request_problem_information: true,
            connect_message: None,
            ordered_delivery_installed: false,
            flow_control_installed: false,
            keep_alive_installed: false,
            pending_packets: VecDeque::new(),
        }
    }
}

/// Single-assignment completion signal fired after a channel's close
/// finished. Takeover waits on this before letting the new connection
/// proceed; it fires exactly once per channel.
#[derive(Debug)]
pub struct DisconnectSignal {
    fired: AtomicBool,
    tx: watch::Sender<bool>,
}

impl DisconnectSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            tx,
        }
    }

    /// Fire the signal; later calls are no-ops
    pub fn complete(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(true);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// A waiter that resolves once the signal fired
    pub fn waiter(&self) -> DisconnectWaiter {
        DisconnectWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for DisconnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to await a [`DisconnectSignal`]
#[derive(Debug, Clone)]
pub struct DisconnectWaiter {
    rx: watch::Receiver<bool>,
}

impl DisconnectWaiter {
    pub async fn wait(mut self) {
        // The sender lives inside the channel; if the channel is dropped
        // the disconnect is trivially complete.
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}

/// A packet queued for the wire, confirmed by the transport once the
/// bytes are flushed
#[derive(Debug)]
pub struct OutboundPacket {
    pub packet: Packet,
    completion: Option<oneshot::Sender<()>>,
}

impl OutboundPacket {
    /// Confirm the packet reached the wire
    pub fn confirm(mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(());
        }
    }
}

/// Future side of an outbound write
#[derive(Debug)]
pub struct WriteFuture {
    rx: oneshot::Receiver<()>,
}

impl WriteFuture {
    /// Resolves once the transport flushed the packet
    pub async fn wait(self) -> Result<(), ChannelError> {
        self.rx.await.map_err(|_| ChannelError::Closed)
    }
}

/// Receiving end of a channel's outbound queue, held by the transport
pub type OutboundReceiver = mpsc::Receiver<OutboundPacket>;

/// One live client connection as seen by the admission core
pub struct Channel {
    addr: SocketAddr,
    outbound: mpsc::Sender<OutboundPacket>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    /// Set when a newer connection with the same identifier displaces this one
    taken_over: AtomicBool,
    /// First-CONNECT guard; a second CONNECT on the same channel is a
    /// protocol error
    connect_received: AtomicBool,
    /// At most one CONNACK ever leaves a channel
    connack_sent: AtomicBool,
    /// Gate blocking non-AUTH outbound traffic until the CONNACK went out
    connack_pending: AtomicBool,
    /// Enhanced authentication in progress; inbound non-AUTH packets are
    /// buffered until it resolves
    auth_pending: AtomicBool,
    /// Completion signal for takeover; set once admission validated the
    /// CONNECT, absent on channels that never got that far
    disconnect: RwLock<Option<Arc<DisconnectSignal>>>,
    last_activity: Mutex<Instant>,
    attrs: RwLock<ChannelAttributes>,
}

impl Channel {
    /// Create a channel with the given outbound queue capacity.
    /// Returns the handle and the transport-side receiver.
    pub fn new(addr: SocketAddr, outbound_capacity: usize) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(outbound_capacity);
        let (close_tx, _) = watch::channel(false);
        let channel = Arc::new(Self {
            addr,
            outbound: tx,
            closed: AtomicBool::new(false),
            close_tx,
            taken_over: AtomicBool::new(false),
            connect_received: AtomicBool::new(false),
            connack_sent: AtomicBool::new(false),
            connack_pending: AtomicBool::new(true),
            auth_pending: AtomicBool::new(false),
            disconnect: RwLock::new(None),
            last_activity: Mutex::new(Instant::now()),
            attrs: RwLock::new(ChannelAttributes::default()),
        });
        (channel, rx)
    }

    /// Remote address of the connection
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client identifier, once validation accepted one
    pub fn client_id(&self) -> Option<Arc<str>> {
        self.attrs.read().client_id.clone()
    }

    /// Read access to the attribute bag
    pub fn attrs(&self) -> RwLockReadGuard<'_, ChannelAttributes> {
        self.attrs.read()
    }

    /// Write access to the attribute bag
    pub fn attrs_mut(&self) -> RwLockWriteGuard<'_, ChannelAttributes> {
        self.attrs.write()
    }

    /// Queue a packet for the wire. The returned future resolves when
    /// the transport confirmed the flush.
    ///
    /// Until the CONNACK went out, only CONNACK and AUTH may leave the
    /// channel.
    pub fn write(&self, packet: Packet) -> Result<WriteFuture, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.connack_pending() && !matches!(packet, Packet::ConnAck(_) | Packet::Auth(_)) {
            return Err(ChannelError::ConnackPending);
        }
        let (tx, rx) = oneshot::channel();
        self.outbound
            .try_send(OutboundPacket {
                packet,
                completion: Some(tx),
            })
            .map_err(|_| ChannelError::Closed)?;
        Ok(WriteFuture { rx })
    }

    /// Record inbound activity, resetting the keep-alive deadline
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Instant of the most recent inbound activity
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Request connection teardown; idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(addr = %self.addr, "closing channel");
        let _ = self.close_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) was called
    pub async fn closed_wait(&self) {
        if self.is_closed() {
            return;
        }
        let mut rx = self.close_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Mark this channel as displaced by a newer connection.
    /// Returns false if it was already marked.
    pub fn set_taken_over(&self) -> bool {
        !self.taken_over.swap(true, Ordering::AcqRel)
    }

    pub fn is_taken_over(&self) -> bool {
        self.taken_over.load(Ordering::Acquire)
    }

    /// Install the first-CONNECT guard. Returns false when a CONNECT was
    /// already seen on this channel.
    pub fn begin_connect(&self) -> bool {
        !self.connect_received.swap(true, Ordering::AcqRel)
    }

    pub fn connect_received(&self) -> bool {
        self.connect_received.load(Ordering::Acquire)
    }

    /// Claim the right to send the single CONNACK of this channel.
    /// Returns false when one was already sent.
    pub fn claim_connack(&self) -> bool {
        !self.connack_sent.swap(true, Ordering::AcqRel)
    }

    pub fn connack_sent(&self) -> bool {
        self.connack_sent.load(Ordering::Acquire)
    }

    /// Clear the gate that held back outbound traffic until the CONNACK
    /// was flushed
    pub fn clear_connack_pending(&self) {
        self.connack_pending.store(false, Ordering::Release);
    }

    pub fn connack_pending(&self) -> bool {
        self.connack_pending.load(Ordering::Acquire)
    }

    /// Enhanced-auth buffering state
    pub fn set_auth_pending(&self, pending: bool) {
        self.auth_pending.store(pending, Ordering::Release);
    }

    pub fn auth_pending(&self) -> bool {
        self.auth_pending.load(Ordering::Acquire)
    }

    /// Install the disconnect-completion signal. Called once validation
    /// accepted the CONNECT; channels refused earlier never carry one.
    pub fn init_disconnect_signal(&self) {
        let mut slot = self.disconnect.write();
        if slot.is_none() {
            *slot = Some(Arc::new(DisconnectSignal::new()));
        }
    }

    /// A waiter on the disconnect signal, if one was installed
    pub fn disconnect_waiter(&self) -> Option<DisconnectWaiter> {
        self.disconnect.read().as_ref().map(|s| s.waiter())
    }

    /// Fire the disconnect signal after teardown finished. Fires at most
    /// once; returns whether this call did the firing.
    pub fn complete_disconnect(&self) -> bool {
        match self.disconnect.read().as_ref() {
            Some(signal) => signal.complete(),
            None => false,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .field("taken_over", &self.is_taken_over())
            .finish()
    }
}

/// Registry of live channels keyed by client identifier.
///
/// Insertion happens only after takeover completed, so at any instant at
/// most one channel is mapped per identifier.
pub struct ChannelRegistry {
    channels: DashMap<Arc<str>, Arc<Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Look up the live channel for a client identifier
    pub fn get(&self, client_id: &str) -> Option<Arc<Channel>> {
        self.channels.get(client_id).map(|e| e.value().clone())
    }

    /// Map a client identifier to its (new) live channel, returning the
    /// channel it displaced, if any
    pub fn persist(&self, client_id: Arc<str>, channel: Arc<Channel>) -> Option<Arc<Channel>> {
        self.channels.insert(client_id, channel)
    }

    /// Remove the mapping, but only while it still points at the given
    /// channel. A takeover may already have replaced it.
    pub fn remove(&self, client_id: &str, channel: &Arc<Channel>) -> bool {
        self.channels
            .remove_if(client_id, |_, current| Arc::ptr_eq(current, channel))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
