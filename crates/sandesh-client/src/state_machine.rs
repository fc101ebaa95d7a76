//! Collector connection state machine.
//!
//! Five states, eleven events, an explicit transition table, and a single
//! dispatch function. All state-machine fields are owned by one event task;
//! concurrent activities (connect attempts, read loops, timers) never touch
//! them directly; they only enqueue events. That single consumer is the
//! sole serialization mechanism, so there is never more than one in-flight
//! transition.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::{ClientShared, ConnectionStatus};
use crate::connection::SandeshConnection;
use crate::message::{CtrlServerToClient, SandeshMessage};
use crate::session::{SandeshSession, SessionIdentity, SessionParams};
use crate::stats::TxDropReason;

/// Connection FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting out the idle-hold period before the next attempt.
    Idle,
    /// TCP connect to the selected collector in progress.
    Connect,
    /// Connected; handshake sent, response pending.
    ClientInit,
    /// Handshake complete; telemetry flowing.
    Established,
    /// No collectors are known; waiting for a collector change.
    Disconnect,
}

/// Events consumed by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Administrative start.
    Start,
    /// Administrative stop.
    Stop,
    /// Idle-hold timer fired.
    IdleHoldExpired,
    /// Connect timer fired before the handshake completed.
    ConnectTimerExpired,
    /// No collector is available to connect to.
    CollectorUnknown,
    /// Transport connect succeeded.
    TcpConnected,
    /// Transport connect failed.
    TcpConnectFail,
    /// Transport closed after being connected.
    TcpClose,
    /// The candidate collector list was reconfigured.
    CollectorChange,
    /// Handshake response arrived.
    CtrlMsgReceived,
    /// Application queued a UVE for transmission.
    UveSend,
}

/// A queued state-machine event.
#[derive(Debug)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Session the event belongs to; events from superseded sessions are
    /// discarded.
    pub session: Option<Arc<SandeshSession>>,
    /// Handshake response, for [`EventKind::CtrlMsgReceived`].
    pub ctrl: Option<CtrlServerToClient>,
    /// Message payload, for [`EventKind::UveSend`].
    pub msg: Option<SandeshMessage>,
    /// Collector identity that produced the event.
    pub source: Option<String>,
    /// New candidate list, for [`EventKind::CollectorChange`].
    pub collectors: Option<Vec<String>>,
}

impl Event {
    /// An event with no attachments.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            session: None,
            ctrl: None,
            msg: None,
            source: None,
            collectors: None,
        }
    }

    /// An event tied to a session.
    pub fn with_session(kind: EventKind, session: Arc<SandeshSession>) -> Self {
        let mut event = Self::new(kind);
        event.session = Some(session);
        event
    }

    /// A collector-change event carrying the new candidate list.
    pub fn with_collectors(kind: EventKind, collectors: Vec<String>) -> Self {
        let mut event = Self::new(kind);
        event.collectors = Some(collectors);
        event
    }
}

/// The static transition table: `(state, event)` to the next state. Events
/// not in the table are unconsumed in that state.
fn transition(state: State, event: EventKind) -> Option<State> {
    use EventKind::*;
    use State::*;
    match (state, event) {
        (Idle, IdleHoldExpired) | (Idle, CollectorChange) | (Idle, Start) => Some(Connect),
        (Disconnect, CollectorChange) => Some(Connect),
        (Connect, CollectorUnknown) => Some(State::Disconnect),
        (Connect, TcpConnectFail) | (Connect, ConnectTimerExpired) | (Connect, CollectorChange) => {
            Some(Idle)
        }
        (Connect, TcpConnected) => Some(ClientInit),
        (ClientInit, ConnectTimerExpired) | (ClientInit, TcpClose) | (ClientInit, CollectorChange) => {
            Some(Idle)
        }
        (ClientInit, CtrlMsgReceived) => Some(Established),
        (Established, TcpClose) | (Established, CollectorChange) => Some(Connect),
        (Established, Stop) => Some(Idle),
        _ => None,
    }
}

/// A cancellable scheduled event. Cancellation is idempotent.
struct Timer {
    handle: Option<JoinHandle<()>>,
}

impl Timer {
    fn new() -> Self {
        Self { handle: None }
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// The collector connection state machine. Owned and driven by a single
/// event-loop task.
pub struct StateMachine {
    shared: Arc<ClientShared>,
    connection: Arc<SandeshConnection>,
    event_tx: mpsc::UnboundedSender<Event>,
    state: State,
    connects: u64,
    collectors: Vec<String>,
    collector_index: Option<usize>,
    collector_name: Option<String>,
    session: Option<Arc<SandeshSession>>,
    idle_hold_timer: Timer,
    connect_timer: Timer,
}

impl StateMachine {
    /// Creates the machine in `Idle` with no collector selected.
    pub fn new(
        shared: Arc<ClientShared>,
        connection: Arc<SandeshConnection>,
        event_tx: mpsc::UnboundedSender<Event>,
        collectors: Vec<String>,
    ) -> Self {
        Self {
            shared,
            connection,
            event_tx,
            state: State::Idle,
            connects: 0,
            collectors,
            collector_index: None,
            collector_name: None,
            session: None,
            idle_hold_timer: Timer::new(),
            connect_timer: Timer::new(),
        }
    }

    /// Consumes events until every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = event_rx.recv().await {
            self.handle_event(event);
        }
        tracing::debug!("state machine event loop finished");
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Successful-connect counter.
    pub fn connect_count(&self) -> u64 {
        self.connects
    }

    /// Round-robin cursor into the collector list; `None` before the first
    /// selection.
    pub fn collector_index(&self) -> Option<usize> {
        self.collector_index
    }

    /// The currently selected collector endpoint.
    pub fn collector(&self) -> Option<&str> {
        self.collector_index
            .and_then(|i| self.collectors.get(i))
            .map(|s| s.as_str())
    }

    /// The current session, if any.
    pub fn session(&self) -> Option<Arc<SandeshSession>> {
        self.session.clone()
    }

    /// Processes one event to completion.
    pub fn handle_event(&mut self, event: Event) {
        if self.log_event(&event) {
            tracing::info!(event = ?event.kind, state = ?self.state, "processing event");
        }
        if let Some(session) = &event.session {
            if !self.is_current_session(session) {
                tracing::info!(event = ?event.kind, "ignoring event for superseded session");
                return;
            }
        }
        if event.kind == EventKind::CollectorChange && self.absorb_collector_change(&event) {
            return;
        }
        match event.kind {
            EventKind::UveSend => {
                self.handle_uve_send(event);
                return;
            }
            EventKind::CtrlMsgReceived if self.state == State::Established => {
                // A repeat handshake response while established re-runs the
                // cache sync without a transition.
                if let Some(ctrl) = &event.ctrl {
                    self.connection.handle_ctrl_msg(ctrl);
                }
                return;
            }
            _ => {}
        }
        match transition(self.state, event.kind) {
            None => {
                tracing::info!(event = ?event.kind, state = ?self.state, "unconsumed event");
            }
            Some(next) => {
                let prev = self.state;
                self.state = next;
                self.enter_state(&event);
                tracing::info!(event = ?event.kind, from = ?prev, to = ?self.state, "state transition");
            }
        }
    }

    fn log_event(&self, event: &Event) -> bool {
        !(self.state == State::Established && event.kind == EventKind::UveSend)
    }

    fn is_current_session(&self, session: &Arc<SandeshSession>) -> bool {
        self.session
            .as_ref()
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false)
    }

    /// Collector-change bookkeeping that happens outside the transition
    /// table. Returns true when the event is fully absorbed.
    fn absorb_collector_change(&mut self, event: &Event) -> bool {
        let current = self.collector().map(|s| s.to_string());
        self.collector_index = None;
        let mut list_changed = false;
        if let Some(new_list) = &event.collectors {
            if &self.collectors != new_list {
                self.collectors = new_list.clone();
                list_changed = true;
            }
        }
        if let (Some(first), Some(current)) = (self.collectors.first(), current.as_ref()) {
            if first == current {
                self.collector_index = Some(0);
                tracing::info!("no change in active collector; ignoring collector change");
                if list_changed {
                    self.notify_generator_info();
                }
                return true;
            }
        }
        self.notify_generator_info();
        false
    }

    fn handle_uve_send(&mut self, event: Event) {
        match self.state {
            State::ClientInit | State::Established => {
                if let Some(msg) = event.msg {
                    self.shared.send_to_session(msg);
                }
            }
            _ => {
                if let Some(msg) = &event.msg {
                    self.shared.stats.drop_tx(
                        &msg.name,
                        msg.approx_size(),
                        TxDropReason::WrongClientSmState,
                    );
                }
                tracing::info!(state = ?self.state, "discarding UVE send in wrong state");
            }
        }
    }

    fn enter_state(&mut self, event: &Event) {
        match self.state {
            State::Idle => self.on_idle(),
            State::Connect => self.on_connect(),
            State::ClientInit => self.on_client_init(),
            State::Established => self.on_established(event),
            State::Disconnect => self.on_disconnect(),
        }
    }

    fn on_idle(&mut self) {
        self.connect_timer.cancel();
        self.delete_session();
        if !self.shared.admin_down.load(Ordering::Acquire) {
            self.start_idle_hold_timer();
        }
        self.update_connection_status(ConnectionStatus::Down);
        self.collector_name = None;
        self.notify_generator_info();
    }

    fn on_connect(&mut self) {
        self.idle_hold_timer.cancel();
        self.collector_name = None;
        self.delete_session();
        match self.next_collector() {
            Some(collector) => {
                self.update_connection_status(ConnectionStatus::Initializing);
                let session = self.create_session(&collector);
                self.start_connect_timer(&session);
                tokio::spawn(session.start_connect());
            }
            None => {
                let _ = self.event_tx.send(Event::new(EventKind::CollectorUnknown));
            }
        }
    }

    fn on_client_init(&mut self) {
        self.connects += 1;
        if let Some(session) = self.session.clone() {
            tokio::spawn(session.clone().read_loop(self.connection.clone()));
            self.connection.send_handshake(&session, self.connects);
        }
        self.notify_generator_info();
        self.update_connection_status(ConnectionStatus::Initializing);
    }

    fn on_established(&mut self, event: &Event) {
        self.connect_timer.cancel();
        self.collector_name = event.source.clone();
        if let Some(ctrl) = &event.ctrl {
            self.connection.handle_ctrl_msg(ctrl);
        }
        self.update_connection_status(ConnectionStatus::Up);
        self.notify_generator_info();
    }

    fn on_disconnect(&mut self) {
        self.update_connection_status(ConnectionStatus::Down);
    }

    fn next_collector(&mut self) -> Option<String> {
        if self.collectors.is_empty() {
            self.collector_index = None;
            return None;
        }
        let next = match self.collector_index {
            None => 0,
            Some(index) => (index + 1) % self.collectors.len(),
        };
        self.collector_index = Some(next);
        Some(self.collectors[next].clone())
    }

    fn create_session(&mut self, collector: &str) -> Arc<SandeshSession> {
        debug_assert!(self.session.is_none());
        let config = &self.shared.config;
        let session = SandeshSession::new(
            SessionParams {
                endpoint: collector.to_string(),
                options: config.tcp_options(),
                tls: self.shared.tls.clone(),
                identity: SessionIdentity {
                    source_id: config.source_id.clone(),
                    module: config.module.clone(),
                    node_type: config.node_type.clone(),
                    instance_id: config.instance_id.clone(),
                },
                watermarks: config.watermarks.clone(),
                queue_bound: config.send_queue_limit,
                drain_batch: config.drain_batch,
                stats_collector: config.stats_collector.clone(),
            },
            self.event_tx.clone(),
            self.shared.stats.clone(),
            self.shared.send_queue_enabled.clone(),
        );
        self.session = Some(session.clone());
        *self.shared.current_session.lock().unwrap() = Some(session.clone());
        session
    }

    fn delete_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
            self.collector_name = None;
            *self.shared.current_session.lock().unwrap() = None;
        }
    }

    fn start_idle_hold_timer(&mut self) {
        if self.idle_hold_timer.is_running() {
            return;
        }
        let hold = self.shared.config.idle_hold();
        if hold.is_zero() {
            let _ = self.event_tx.send(Event::new(EventKind::IdleHoldExpired));
            return;
        }
        let event_tx = self.event_tx.clone();
        self.idle_hold_timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            let _ = event_tx.send(Event::new(EventKind::IdleHoldExpired));
        }));
    }

    fn start_connect_timer(&mut self, session: &Arc<SandeshSession>) {
        if self.connect_timer.is_running() {
            return;
        }
        let event_tx = self.event_tx.clone();
        let session = session.clone();
        let timeout = self.shared.config.connect_timeout();
        self.connect_timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = event_tx.send(Event::with_session(EventKind::ConnectTimerExpired, session));
        }));
    }

    fn update_connection_status(&self, status: ConnectionStatus) {
        let mut snapshot = self.shared.status.lock().unwrap();
        snapshot.connection_status = status;
        tracing::info!(status = ?status, collector = ?self.collector(), "collector connection status");
    }

    fn notify_generator_info(&self) {
        let mut snapshot = self.shared.status.lock().unwrap();
        snapshot.state = self.state;
        snapshot.collector = self.collector().map(|s| s.to_string());
        snapshot.collector_name = self.collector_name.clone();
        snapshot.collector_list = self.collectors.clone();
        snapshot.connect_count = self.connects;
        tracing::debug!(state = ?self.state, connects = self.connects, "generator info refreshed");
    }
}
