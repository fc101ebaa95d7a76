//! Client facade.
//!
//! Construction wires the shared state, spawns the state-machine task, and
//! hands back a handle exposing the send paths, UVE cache, trace rings, and
//! runtime status. Transport failures never surface here; they are retried
//! behind the scenes by the state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedSender};

use sandesh_transport::tls::{TlsClient, TlsConfig};

use crate::config::SandeshConfig;
use crate::connection::{RequestHandler, SandeshConnection};
use crate::error::Result;
use crate::message::{SandeshLevel, SandeshMessage, SandeshType};
use crate::session::SandeshSession;
use crate::state_machine::{Event, EventKind, State, StateMachine};
use crate::stats::{SandeshMessageStats, TxDropReason};
use crate::trace::TraceRegistry;
use crate::uve::{UveTypeRegistry, UveUpdate};

/// Initial spacing between overload-triggered session resets.
pub const INITIAL_SESSION_CLOSE_INTERVAL_MS: u64 = 10_000;
/// Ceiling on the spacing between overload-triggered session resets.
pub const MAX_SESSION_CLOSE_INTERVAL_MS: u64 = 60_000;

/// Coarse connection status reported to monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No collector connection.
    Down,
    /// Connecting or handshaking.
    Initializing,
    /// Handshake complete.
    Up,
}

/// Snapshot of the client's connection state for external monitoring.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    /// Current FSM state.
    pub state: State,
    /// Coarse connection status.
    pub connection_status: ConnectionStatus,
    /// Selected collector endpoint.
    pub collector: Option<String>,
    /// Collector identity learned during negotiation.
    pub collector_name: Option<String>,
    /// Candidate collector list.
    pub collector_list: Vec<String>,
    /// Successful-connect counter.
    pub connect_count: u64,
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self {
            state: State::Idle,
            connection_status: ConnectionStatus::Down,
            collector: None,
            collector_name: None,
            collector_list: Vec::new(),
            connect_count: 0,
        }
    }
}

/// State shared between the client facade, the state machine, and the
/// inbound dispatcher.
pub struct ClientShared {
    /// Immutable configuration.
    pub(crate) config: SandeshConfig,
    /// Aggregate and per-type statistics.
    pub(crate) stats: Arc<SandeshMessageStats>,
    /// UVE type registry and cache.
    pub(crate) uve_registry: Arc<UveTypeRegistry>,
    /// Mirror of the state machine's current session for the send path.
    pub(crate) current_session: Mutex<Option<Arc<SandeshSession>>>,
    /// Monitoring snapshot.
    pub(crate) status: Mutex<RuntimeStatus>,
    /// Administratively down; suppresses the idle-hold timer.
    pub(crate) admin_down: AtomicBool,
    /// All sending disabled.
    pub(crate) sending_all_disabled: AtomicBool,
    /// Object-log sending disabled.
    pub(crate) object_logs_disabled: AtomicBool,
    /// Gates the send-queue drain worker.
    pub(crate) send_queue_enabled: Arc<AtomicBool>,
    /// TLS connector shared by every session.
    pub(crate) tls: Option<Arc<TlsClient>>,
}

impl ClientShared {
    /// Assembles the shared state.
    pub(crate) fn new(config: SandeshConfig, tls: Option<Arc<TlsClient>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats: Arc::new(SandeshMessageStats::new()),
            uve_registry: Arc::new(UveTypeRegistry::new()),
            current_session: Mutex::new(None),
            status: Mutex::new(RuntimeStatus::default()),
            admin_down: AtomicBool::new(false),
            sending_all_disabled: AtomicBool::new(false),
            object_logs_disabled: AtomicBool::new(false),
            send_queue_enabled: Arc::new(AtomicBool::new(true)),
            tls,
        })
    }

    /// Hands a message to the current session's send queue, counting the
    /// drop when that is impossible.
    pub(crate) fn send_to_session(&self, msg: SandeshMessage) {
        let session = self.current_session.lock().unwrap().clone();
        match session {
            Some(session) if !self.config.module.is_empty() => session.enqueue(msg),
            Some(_) => {
                self.stats
                    .drop_tx(&msg.name, msg.approx_size(), TxDropReason::ClientSendFailed);
            }
            None if self.config.collectors.is_empty() => {
                // No collectors are configured, so no session will ever
                // exist to carry this.
                self.stats
                    .drop_tx(&msg.name, msg.approx_size(), TxDropReason::NoClient);
            }
            None => {
                self.stats
                    .drop_tx(&msg.name, msg.approx_size(), TxDropReason::NoSession);
            }
        }
    }
}

/// Decides whether an overload-triggered session reset may proceed.
///
/// Returns the next reset interval when allowed, `None` when the reset is
/// suppressed. The interval doubles (capped) when resets arrive between one
/// and two intervals apart, holds between two and four, and falls back to
/// the initial interval beyond four.
pub fn session_close_decision(
    now_ms: u64,
    last_close_ms: u64,
    last_interval_ms: u64,
) -> Option<u64> {
    if last_close_ms == 0 || last_interval_ms == 0 {
        return Some(INITIAL_SESSION_CLOSE_INTERVAL_MS);
    }
    let elapsed = now_ms.saturating_sub(last_close_ms);
    if elapsed <= last_interval_ms {
        None
    } else if elapsed <= 2 * last_interval_ms {
        Some((2 * last_interval_ms).min(MAX_SESSION_CLOSE_INTERVAL_MS))
    } else if elapsed <= 4 * last_interval_ms {
        Some(last_interval_ms)
    } else {
        Some(INITIAL_SESSION_CLOSE_INTERVAL_MS)
    }
}

#[derive(Default)]
struct CloseState {
    last_close_ms: u64,
    last_interval_ms: u64,
}

#[derive(Default)]
struct RateWindow {
    stamps: VecDeque<u64>,
    drop_log_disabled: bool,
}

/// Sliding one-second-window rate limiter, one window per message type.
struct RateLimiter {
    limit: AtomicU32,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit: AtomicU32::new(limit),
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::Release);
    }

    fn pass(&self, name: &str, now_sec: u64) -> bool {
        let limit = self.limit() as usize;
        if limit == 0 {
            return false;
        }
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(name.to_string()).or_default();
        while window.stamps.len() > limit {
            window.stamps.pop_front();
        }
        if window.stamps.len() == limit && window.stamps.front() == Some(&now_sec) {
            // The whole window sits inside the current second; the sender is
            // over budget. Log once per saturation episode.
            if !window.drop_log_disabled {
                tracing::error!(limit, message_type = name, "rate limit drop");
                window.drop_log_disabled = true;
            }
            return false;
        }
        window.drop_log_disabled = false;
        if window.stamps.len() == limit {
            window.stamps.pop_front();
        }
        window.stamps.push_back(now_sec);
        true
    }
}

/// The generator-side client runtime handle.
pub struct SandeshClient {
    shared: Arc<ClientShared>,
    connection: Arc<SandeshConnection>,
    event_tx: UnboundedSender<Event>,
    traces: Arc<TraceRegistry>,
    seqnums: Mutex<HashMap<String, u32>>,
    rate_limiter: RateLimiter,
    close_state: Mutex<CloseState>,
    started: Instant,
}

impl SandeshClient {
    /// Validates the configuration, spawns the state machine, and begins
    /// connecting to the configured collectors.
    pub fn new(config: SandeshConfig) -> Result<Self> {
        config.validate()?;
        let tls = match &config.tls {
            Some(files) => {
                let tls_config =
                    TlsConfig::from_files(&files.ca_cert, &files.certfile, &files.keyfile)?;
                Some(Arc::new(TlsClient::new(&tls_config)?))
            }
            None => None,
        };
        let collectors = config.collectors.clone();
        let rate_limit = config.system_rate_limit;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = ClientShared::new(config, tls);
        let connection = Arc::new(SandeshConnection::new(shared.clone(), event_tx.clone()));
        let machine = StateMachine::new(
            shared.clone(),
            connection.clone(),
            event_tx.clone(),
            collectors,
        );
        tokio::spawn(machine.run(event_rx));

        let client = Self {
            shared,
            connection,
            event_tx,
            traces: Arc::new(TraceRegistry::new()),
            seqnums: Mutex::new(HashMap::new()),
            rate_limiter: RateLimiter::new(rate_limit),
            close_state: Mutex::new(CloseState::default()),
            started: Instant::now(),
        };
        let _ = client.event_tx.send(Event::new(EventKind::Start));
        Ok(client)
    }

    /// The UVE type registry; register every UVE type before connecting so
    /// the handshake advertises it.
    pub fn uve_registry(&self) -> &Arc<UveTypeRegistry> {
        &self.shared.uve_registry
    }

    /// The named trace-ring registry.
    pub fn traces(&self) -> &Arc<TraceRegistry> {
        &self.traces
    }

    /// Aggregate and per-type statistics.
    pub fn stats(&self) -> &Arc<SandeshMessageStats> {
        &self.shared.stats
    }

    /// Registers a handler for an inbound request type.
    pub fn register_request_handler(&self, name: impl Into<String>, handler: RequestHandler) {
        self.connection.requests().register(name, handler);
    }

    /// Snapshot of the connection state for monitoring.
    pub fn status(&self) -> RuntimeStatus {
        self.shared.status.lock().unwrap().clone()
    }

    /// The current send level; messages at or above it are shed.
    pub fn send_level(&self) -> SandeshLevel {
        self.shared
            .current_session
            .lock()
            .unwrap()
            .as_ref()
            .map(|session| session.send_level())
            .unwrap_or(SandeshLevel::Invalid)
    }

    /// Queues a non-UVE message for transmission.
    ///
    /// Returns false when the message was dropped; the drop reason is
    /// counted against the message type.
    pub fn send(&self, mut msg: SandeshMessage) -> bool {
        let size = msg.approx_size();
        if msg.name.is_empty() {
            self.shared
                .stats
                .drop_tx("__UNKNOWN__", size, TxDropReason::ValidationFailed);
            return false;
        }
        if self.shared.sending_all_disabled.load(Ordering::Acquire) {
            self.shared
                .stats
                .drop_tx(&msg.name, size, TxDropReason::SendingDisabled);
            return false;
        }
        if msg.msg_type == SandeshType::Object
            && self.shared.object_logs_disabled.load(Ordering::Acquire)
        {
            self.shared
                .stats
                .drop_tx(&msg.name, size, TxDropReason::SendingDisabled);
            return false;
        }
        if msg.msg_type == SandeshType::System {
            if self.rate_limiter.limit() == 0 {
                self.shared
                    .stats
                    .drop_tx(&msg.name, size, TxDropReason::SendingDisabled);
                return false;
            }
            if !self.rate_limiter.pass(&msg.name, self.started.elapsed().as_secs()) {
                self.shared
                    .stats
                    .drop_tx(&msg.name, size, TxDropReason::RatelimitDrop);
                return false;
            }
        }
        if msg.level >= self.send_level() {
            self.shared
                .stats
                .drop_tx(&msg.name, size, TxDropReason::QueueLevel);
            return false;
        }
        msg.seqnum = self.next_seqnum(&msg.name);
        self.shared.send_to_session(msg);
        true
    }

    /// Updates the UVE cache and queues the UVE for transmission.
    ///
    /// UVE traffic has an implicit level of `SysUve`; once the send queue
    /// has degraded to that level the session is reset (rate-limited by the
    /// adaptive backoff) to force a full cache resync instead of queuing
    /// further.
    pub fn send_uve(&self, mut update: UveUpdate) -> bool {
        let Some(type_map) = self.shared.uve_registry.get(&update.type_name) else {
            tracing::error!(uve_type = %update.type_name, "UVE type not registered");
            self.shared
                .stats
                .drop_tx(&update.type_name, 0, TxDropReason::ValidationFailed);
            return false;
        };
        update.seqnum = type_map.next_seqnum();
        if !type_map.update(&update) {
            self.shared
                .stats
                .drop_tx(&update.type_name, 0, TxDropReason::ValidationFailed);
            return false;
        }
        if self.shared.sending_all_disabled.load(Ordering::Acquire) {
            self.shared
                .stats
                .drop_tx(&update.type_name, 0, TxDropReason::SendingDisabled);
            return false;
        }
        if SandeshLevel::SysUve >= self.send_level() {
            self.close_sm_session();
        }
        let msg = type_map.uve_message(&update);
        let mut event = Event::new(EventKind::UveSend);
        event.msg = Some(msg);
        let _ = self.event_tx.send(event);
        true
    }

    /// Writes one entry into a named trace ring, creating nothing: rings
    /// must be added through [`SandeshClient::traces`] first.
    pub fn trace_write(&self, buf_name: &str, entry: impl Into<String>) -> Option<u32> {
        self.traces.write(buf_name, entry)
    }

    /// Reads entries from a named trace ring on behalf of `context`; see
    /// [`crate::trace::TraceBuffer::read`].
    pub fn trace_read<F: FnMut(&str, bool)>(
        &self,
        buf_name: &str,
        context: &str,
        count: usize,
        callback: F,
    ) {
        self.traces.read(buf_name, context, count, callback);
    }

    /// Reconfigures the candidate collector list.
    pub fn set_collectors(&self, collectors: Vec<String>) {
        let _ = self
            .event_tx
            .send(Event::with_collectors(EventKind::CollectorChange, collectors));
    }

    /// Administratively brings the connection down or up.
    pub fn set_admin_state(&self, down: bool) {
        // The flag is read by the Idle entry action, so set it before the
        // event is queued.
        self.shared.admin_down.store(down, Ordering::Release);
        let kind = if down { EventKind::Stop } else { EventKind::Start };
        let _ = self.event_tx.send(Event::new(kind));
    }

    /// Stops connecting and tears down the current session.
    pub fn shutdown(&self) {
        self.set_admin_state(true);
    }

    /// Disables or re-enables sending of all messages.
    pub fn disable_sending_all_messages(&self, disable: bool) {
        let was = self
            .shared
            .sending_all_disabled
            .swap(disable, Ordering::AcqRel);
        if was != disable {
            tracing::info!(disable, "sending all messages toggled");
        }
    }

    /// Disables or re-enables sending of object logs.
    pub fn disable_sending_object_logs(&self, disable: bool) {
        let was = self
            .shared
            .object_logs_disabled
            .swap(disable, Ordering::AcqRel);
        if was != disable {
            tracing::info!(disable, "sending object logs toggled");
        }
    }

    /// Enables or disables the send-queue drain worker. Re-enabling kicks
    /// the runner on the current session.
    pub fn set_send_queue(&self, enable: bool) {
        let was = self.shared.send_queue_enabled.swap(enable, Ordering::AcqRel);
        if was != enable {
            tracing::info!(enable, "send queue toggled");
        }
        if enable {
            if let Some(session) = self.shared.current_session.lock().unwrap().clone() {
                session.maybe_start_runner();
            }
        }
    }

    /// Adjusts the system-message rate limit at runtime.
    pub fn set_system_rate_limit(&self, limit: u32) {
        self.rate_limiter.set_limit(limit);
    }

    /// Closes the current session to force a resync, rate-limited by the
    /// adaptive backoff. Returns true when a close was performed.
    pub fn close_sm_session(&self) -> bool {
        let session = self.shared.current_session.lock().unwrap().clone();
        let Some(session) = session else {
            return false;
        };
        let now_ms = (self.started.elapsed().as_millis() as u64).max(1);
        let mut state = self.close_state.lock().unwrap();
        match session_close_decision(now_ms, state.last_close_ms, state.last_interval_ms) {
            Some(interval) => {
                state.last_close_ms = now_ms;
                state.last_interval_ms = interval;
                drop(state);
                tracing::info!(endpoint = %session.endpoint(), "overload reset of collector session");
                session.close();
                true
            }
            None => false,
        }
    }

    fn next_seqnum(&self, name: &str) -> u32 {
        let mut seqnums = self.seqnums.lock().unwrap();
        let seq = seqnums.entry(name.to_string()).or_insert(0);
        *seq = seq.wrapping_add(1);
        *seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_client(config: SandeshConfig) -> SandeshClient {
        SandeshClient::new(config).unwrap()
    }

    fn system_msg(name: &str) -> SandeshMessage {
        SandeshMessage::new(
            name,
            SandeshType::System,
            SandeshLevel::SysInfo,
            json!({"text": "event"}),
        )
    }

    #[test]
    fn test_session_close_decision_initial() {
        assert_eq!(session_close_decision(0, 0, 0), Some(10_000));
        assert_eq!(session_close_decision(123_456, 0, 0), Some(10_000));
    }

    #[test]
    fn test_session_close_decision_backoff_ladder() {
        // First reset at t=1: next interval 10s.
        let interval = session_close_decision(1, 0, 0).unwrap();
        assert_eq!(interval, 10_000);
        // Second attempt inside the interval: suppressed.
        assert_eq!(session_close_decision(5_000, 1, interval), None);
        // Between one and two intervals: allowed, interval doubles.
        assert_eq!(session_close_decision(15_000, 1, interval), Some(20_000));
        // Between two and four intervals: allowed, interval unchanged.
        assert_eq!(session_close_decision(45_000, 1, 20_000), Some(20_000));
        // Beyond four intervals: allowed, interval resets.
        assert_eq!(session_close_decision(200_000, 1, 20_000), Some(10_000));
    }

    #[test]
    fn test_session_close_decision_caps_at_max() {
        assert_eq!(
            session_close_decision(100_000, 40_000, 40_000),
            Some(60_000)
        );
    }

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(3);
        for _ in 0..3 {
            assert!(limiter.pass("NodeStatus", 100));
        }
        // Over budget within the same second.
        assert!(!limiter.pass("NodeStatus", 100));
        // A new second opens the window again.
        assert!(limiter.pass("NodeStatus", 101));
        // Distinct types have distinct windows.
        assert!(limiter.pass("VrouterStats", 100));
    }

    #[test]
    fn test_rate_limiter_zero_blocks_everything() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.pass("NodeStatus", 1));
    }

    #[tokio::test]
    async fn test_send_without_session_counts_no_session() {
        // Collectors are configured but the state machine has not produced
        // a session yet.
        let client = test_client(SandeshConfig {
            module: "control-node".into(),
            collectors: vec!["127.0.0.1:18086".into()],
            ..Default::default()
        });
        assert!(!client.send(system_msg("NodeStatus")));
        let stats = client.stats().message_type("NodeStatus").unwrap();
        assert_eq!(stats.tx_dropped(TxDropReason::NoSession).0, 1);
    }

    #[tokio::test]
    async fn test_send_without_collectors_counts_no_client() {
        let client = test_client(SandeshConfig {
            module: "control-node".into(),
            ..Default::default()
        });
        assert!(!client.send(system_msg("NodeStatus")));
        let stats = client.stats().message_type("NodeStatus").unwrap();
        assert_eq!(stats.tx_dropped(TxDropReason::NoClient).0, 1);
    }

    #[tokio::test]
    async fn test_send_queue_level_gate_with_invalid_level() {
        let client = test_client(SandeshConfig {
            module: "control-node".into(),
            ..Default::default()
        });
        let mut msg = system_msg("NodeStatus");
        msg.level = SandeshLevel::Invalid;
        assert!(!client.send(msg));
        let stats = client.stats().message_type("NodeStatus").unwrap();
        assert_eq!(stats.tx_dropped(TxDropReason::QueueLevel).0, 1);
    }

    #[tokio::test]
    async fn test_send_disabled_counts_sending_disabled() {
        let client = test_client(SandeshConfig {
            module: "control-node".into(),
            ..Default::default()
        });
        client.disable_sending_all_messages(true);
        assert!(!client.send(system_msg("NodeStatus")));
        let stats = client.stats().message_type("NodeStatus").unwrap();
        assert_eq!(stats.tx_dropped(TxDropReason::SendingDisabled).0, 1);
    }

    #[tokio::test]
    async fn test_object_logs_disabled() {
        let client = test_client(SandeshConfig {
            module: "control-node".into(),
            ..Default::default()
        });
        client.disable_sending_object_logs(true);
        let mut msg = system_msg("VMLog");
        msg.msg_type = SandeshType::Object;
        assert!(!client.send(msg));
        let stats = client.stats().message_type("VMLog").unwrap();
        assert_eq!(stats.tx_dropped(TxDropReason::SendingDisabled).0, 1);
        // System messages still pass the object-log gate.
        assert!(!client.send(system_msg("NodeStatus")));
        let stats = client.stats().message_type("NodeStatus").unwrap();
        assert_eq!(stats.tx_dropped(TxDropReason::SendingDisabled).0, 0);
    }

    #[tokio::test]
    async fn test_empty_name_fails_validation() {
        let client = test_client(SandeshConfig::default());
        assert!(!client.send(system_msg("")));
        let stats = client.stats().message_type("__UNKNOWN__").unwrap();
        assert_eq!(stats.tx_dropped(TxDropReason::ValidationFailed).0, 1);
    }

    #[tokio::test]
    async fn test_unregistered_uve_fails_validation() {
        let client = test_client(SandeshConfig::default());
        let ok = client.send_uve(UveUpdate {
            type_name: "UnknownUVE".into(),
            table: "ObjectVRouter".into(),
            name: "node-1".into(),
            deleted: false,
            data: json!({}),
            seqnum: 0,
        });
        assert!(!ok);
        let stats = client.stats().message_type("UnknownUVE").unwrap();
        assert_eq!(stats.tx_dropped(TxDropReason::ValidationFailed).0, 1);
    }

    #[tokio::test]
    async fn test_close_sm_session_without_session() {
        let client = test_client(SandeshConfig::default());
        assert!(!client.close_sm_session());
    }
}
