//! Send/receive statistics with per-message-type drop-reason breakdown.

use std::collections::HashMap;
use std::sync::Mutex;

/// Reason an outbound message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxDropReason {
    /// Message failed validation before queuing.
    ValidationFailed = 0,
    /// Shed by the current send level.
    QueueLevel = 1,
    /// No client runtime exists.
    NoClient = 2,
    /// No session to a collector exists.
    NoSession = 3,
    /// The bounded send queue refused the message.
    NoQueue = 4,
    /// The client could not hand the message to the session.
    ClientSendFailed = 5,
    /// Encoding the header record failed.
    HeaderWriteFailed = 6,
    /// Encoding the message record failed.
    WriteFailed = 7,
    /// The session lost its connection before the drain worker got there.
    SessionNotConnected = 8,
    /// UVE send while the state machine was not in a sending state.
    WrongClientSmState = 9,
    /// Shed by the per-type rate limit.
    RatelimitDrop = 10,
    /// Sending administratively disabled.
    SendingDisabled = 11,
}

/// Number of distinct [`TxDropReason`] values.
pub const TX_DROP_REASONS: usize = 12;

impl TxDropReason {
    fn index(self) -> usize {
        self as usize
    }

    /// Stable name used in logs and status output.
    pub fn name(&self) -> &'static str {
        match self {
            TxDropReason::ValidationFailed => "ValidationFailed",
            TxDropReason::QueueLevel => "QueueLevel",
            TxDropReason::NoClient => "NoClient",
            TxDropReason::NoSession => "NoSession",
            TxDropReason::NoQueue => "NoQueue",
            TxDropReason::ClientSendFailed => "ClientSendFailed",
            TxDropReason::HeaderWriteFailed => "HeaderWriteFailed",
            TxDropReason::WriteFailed => "WriteFailed",
            TxDropReason::SessionNotConnected => "SessionNotConnected",
            TxDropReason::WrongClientSmState => "WrongClientSMState",
            TxDropReason::RatelimitDrop => "RatelimitDrop",
            TxDropReason::SendingDisabled => "SendingDisabled",
        }
    }
}

/// Reason an inbound message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxDropReason {
    /// Shed by queue backpressure.
    QueueLevel = 0,
    /// No receive queue exists.
    NoQueue = 1,
    /// Control message failed negotiation checks.
    ControlMsgFailed = 2,
    /// Inbound message type is unknown.
    CreateFailed = 3,
    /// Decoding the message failed.
    DecodingFailed = 4,
}

/// Number of distinct [`RxDropReason`] values.
pub const RX_DROP_REASONS: usize = 5;

impl RxDropReason {
    fn index(self) -> usize {
        self as usize
    }

    /// Stable name used in logs and status output.
    pub fn name(&self) -> &'static str {
        match self {
            RxDropReason::QueueLevel => "QueueLevel",
            RxDropReason::NoQueue => "NoQueue",
            RxDropReason::ControlMsgFailed => "ControlMsgFailed",
            RxDropReason::CreateFailed => "CreateFailed",
            RxDropReason::DecodingFailed => "DecodingFailed",
        }
    }
}

/// Counters for one message type, or the aggregate.
#[derive(Debug, Clone)]
pub struct MessageStats {
    /// Messages sent.
    pub messages_sent: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Outbound messages dropped, all reasons.
    pub messages_sent_dropped: u64,
    /// Outbound bytes dropped, all reasons.
    pub bytes_sent_dropped: u64,
    /// Inbound messages dropped, all reasons.
    pub messages_received_dropped: u64,
    /// Inbound bytes dropped, all reasons.
    pub bytes_received_dropped: u64,
    tx_drop_msgs: [u64; TX_DROP_REASONS],
    tx_drop_bytes: [u64; TX_DROP_REASONS],
    rx_drop_msgs: [u64; RX_DROP_REASONS],
    rx_drop_bytes: [u64; RX_DROP_REASONS],
}

impl Default for MessageStats {
    fn default() -> Self {
        Self {
            messages_sent: 0,
            bytes_sent: 0,
            messages_received: 0,
            bytes_received: 0,
            messages_sent_dropped: 0,
            bytes_sent_dropped: 0,
            messages_received_dropped: 0,
            bytes_received_dropped: 0,
            tx_drop_msgs: [0; TX_DROP_REASONS],
            tx_drop_bytes: [0; TX_DROP_REASONS],
            rx_drop_msgs: [0; RX_DROP_REASONS],
            rx_drop_bytes: [0; RX_DROP_REASONS],
        }
    }
}

impl MessageStats {
    fn record_tx(&mut self, nbytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += nbytes as u64;
    }

    fn record_tx_drop(&mut self, nbytes: usize, reason: TxDropReason) {
        self.messages_sent_dropped += 1;
        self.bytes_sent_dropped += nbytes as u64;
        self.tx_drop_msgs[reason.index()] += 1;
        self.tx_drop_bytes[reason.index()] += nbytes as u64;
    }

    fn record_rx(&mut self, nbytes: usize) {
        self.messages_received += 1;
        self.bytes_received += nbytes as u64;
    }

    fn record_rx_drop(&mut self, nbytes: usize, reason: RxDropReason) {
        self.messages_received_dropped += 1;
        self.bytes_received_dropped += nbytes as u64;
        self.rx_drop_msgs[reason.index()] += 1;
        self.rx_drop_bytes[reason.index()] += nbytes as u64;
    }

    /// Dropped (messages, bytes) for one outbound reason.
    pub fn tx_dropped(&self, reason: TxDropReason) -> (u64, u64) {
        (
            self.tx_drop_msgs[reason.index()],
            self.tx_drop_bytes[reason.index()],
        )
    }

    /// Dropped (messages, bytes) for one inbound reason.
    pub fn rx_dropped(&self, reason: RxDropReason) -> (u64, u64) {
        (
            self.rx_drop_msgs[reason.index()],
            self.rx_drop_bytes[reason.index()],
        )
    }
}

#[derive(Default)]
struct Inner {
    aggregate: MessageStats,
    per_type: HashMap<String, MessageStats>,
}

/// Aggregate and per-message-type statistics, updated on every send,
/// receive, and drop.
#[derive(Default)]
pub struct SandeshMessageStats {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SandeshMessageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandeshMessageStats")
            .field("aggregate", &self.aggregate())
            .finish()
    }
}

impl SandeshMessageStats {
    /// Creates an empty statistics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful send.
    pub fn update_tx(&self, message_type: &str, nbytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.aggregate.record_tx(nbytes);
        inner
            .per_type
            .entry(message_type.to_string())
            .or_default()
            .record_tx(nbytes);
    }

    /// Records an outbound drop.
    pub fn drop_tx(&self, message_type: &str, nbytes: usize, reason: TxDropReason) {
        tracing::debug!(
            message_type,
            reason = reason.name(),
            "dropping outbound message"
        );
        let mut inner = self.inner.lock().unwrap();
        inner.aggregate.record_tx_drop(nbytes, reason);
        inner
            .per_type
            .entry(message_type.to_string())
            .or_default()
            .record_tx_drop(nbytes, reason);
    }

    /// Records a successful receive.
    pub fn update_rx(&self, message_type: &str, nbytes: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.aggregate.record_rx(nbytes);
        inner
            .per_type
            .entry(message_type.to_string())
            .or_default()
            .record_rx(nbytes);
    }

    /// Records an inbound drop.
    pub fn drop_rx(&self, message_type: &str, nbytes: usize, reason: RxDropReason) {
        tracing::debug!(
            message_type,
            reason = reason.name(),
            "dropping inbound message"
        );
        let mut inner = self.inner.lock().unwrap();
        inner.aggregate.record_rx_drop(nbytes, reason);
        inner
            .per_type
            .entry(message_type.to_string())
            .or_default()
            .record_rx_drop(nbytes, reason);
    }

    /// Snapshot of the aggregate counters.
    pub fn aggregate(&self) -> MessageStats {
        self.inner.lock().unwrap().aggregate.clone()
    }

    /// Snapshot of the counters for one message type.
    pub fn message_type(&self, name: &str) -> Option<MessageStats> {
        self.inner.lock().unwrap().per_type.get(name).cloned()
    }

    /// Snapshot of every per-type counter set.
    pub fn per_type(&self) -> HashMap<String, MessageStats> {
        self.inner.lock().unwrap().per_type.clone()
    }
}
