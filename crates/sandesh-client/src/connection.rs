//! Inbound message dispatch and handshake glue.
//!
//! Every body extracted by a session's read loop lands here: control
//! messages become state-machine events (or close the session on a failed
//! negotiation), ordinary messages go through the explicit request
//! registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use sandesh_transport::codec::RecordDecoder;

use crate::client::ClientShared;
use crate::message::{
    CtrlClientToServer, CtrlServerToClient, SandeshHeader, SandeshLevel, SandeshMessage,
    SandeshType, CTRL_CLIENT_TO_SERVER, CTRL_SERVER_TO_CLIENT, SANDESH_CONTROL_HINT,
};
use crate::session::{ReceiveHandler, SandeshSession};
use crate::state_machine::{Event, EventKind};
use crate::stats::RxDropReason;

/// Handler invoked with the decoded payload of an inbound request.
pub type RequestHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Explicit inbound-request dispatch table (message name to handler).
#[derive(Default)]
pub struct RequestRegistry {
    handlers: Mutex<HashMap<String, RequestHandler>>,
}

impl RequestRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. A duplicate registration is logged and ignored.
    pub fn register(&self, name: impl Into<String>, handler: RequestHandler) {
        let name = name.into();
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&name) {
            tracing::error!(name = %name, "request handler already registered");
            return;
        }
        handlers.insert(name, handler);
    }

    fn get(&self, name: &str) -> Option<RequestHandler> {
        self.handlers.lock().unwrap().get(name).cloned()
    }
}

/// Ties a session's inbound byte stream to the state machine and the
/// request registry, and builds the outbound handshake.
pub struct SandeshConnection {
    shared: Arc<ClientShared>,
    event_tx: UnboundedSender<Event>,
    requests: RequestRegistry,
}

impl SandeshConnection {
    /// Creates the dispatcher.
    pub fn new(shared: Arc<ClientShared>, event_tx: UnboundedSender<Event>) -> Self {
        Self {
            shared,
            event_tx,
            requests: RequestRegistry::new(),
        }
    }

    /// The inbound-request dispatch table.
    pub fn requests(&self) -> &RequestRegistry {
        &self.requests
    }

    /// Sends the handshake advertising identity and known UVE types.
    pub fn send_handshake(&self, session: &Arc<SandeshSession>, connect_count: u64) {
        let config = &self.shared.config;
        let ctrl = CtrlClientToServer {
            source_id: config.source_id.clone(),
            module: config.module.clone(),
            connect_count,
            uve_type_names: self.shared.uve_registry.type_names(),
            pid: std::process::id(),
            node_type: config.node_type.clone(),
            instance_id: config.instance_id.clone(),
        };
        tracing::debug!(
            uve_types = ctrl.uve_type_names.len(),
            connect_count,
            "sending control handshake"
        );
        let payload = match serde_json::to_value(&ctrl) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!(error = %err, "failed to build control handshake");
                return;
            }
        };
        let mut msg = SandeshMessage::new(
            CTRL_CLIENT_TO_SERVER,
            SandeshType::Request,
            SandeshLevel::SysInfo,
            payload,
        );
        msg.context = "ctrl".into();
        msg.hints = SANDESH_CONTROL_HINT;
        session.enqueue(msg);
    }

    /// Dispatches the handshake response to the UVE cache for delta sync.
    pub fn handle_ctrl_msg(&self, ctrl: &CtrlServerToClient) {
        tracing::debug!(types = ctrl.type_info.len(), "control message type info");
        let peer: HashMap<String, u32> = ctrl
            .type_info
            .iter()
            .map(|info| (info.type_name.clone(), info.seq_num))
            .collect();
        let shared = self.shared.clone();
        self.shared
            .uve_registry
            .sync_all(&peer, &move |msg| shared.send_to_session(msg));
    }

    fn receive_msg(&self, session: &Arc<SandeshSession>, body: &[u8]) {
        let mut decoder = RecordDecoder::new(body);
        let header: SandeshHeader = match decoder.next() {
            Ok(header) => header,
            Err(err) => {
                tracing::error!(error = %err, "failed to decode message header");
                self.shared
                    .stats
                    .drop_rx("__UNKNOWN__", body.len(), RxDropReason::DecodingFailed);
                return;
            }
        };
        if header.hints & SANDESH_CONTROL_HINT != 0 {
            self.receive_ctrl_msg(session, &header, &mut decoder, body.len());
        } else {
            self.receive_request(&header, &mut decoder, body.len());
        }
    }

    fn receive_ctrl_msg(
        &self,
        session: &Arc<SandeshSession>,
        header: &SandeshHeader,
        decoder: &mut RecordDecoder<'_>,
        msg_len: usize,
    ) {
        tracing::debug!(name = %header.name, "received control message");
        if header.name != CTRL_SERVER_TO_CLIENT {
            tracing::error!(name = %header.name, "invalid control message");
            self.shared
                .stats
                .drop_rx(&header.name, msg_len, RxDropReason::ControlMsgFailed);
            return;
        }
        let ctrl: CtrlServerToClient = match decoder.next() {
            Ok(ctrl) => ctrl,
            Err(err) => {
                tracing::error!(error = %err, "failed to decode control message");
                self.shared
                    .stats
                    .drop_rx(&header.name, msg_len, RxDropReason::DecodingFailed);
                return;
            }
        };
        self.shared.stats.update_rx(&header.name, msg_len);
        if ctrl.success {
            let mut event = Event::with_session(EventKind::CtrlMsgReceived, session.clone());
            event.ctrl = Some(ctrl);
            event.source = Some(header.source.clone());
            let _ = self.event_tx.send(event);
        } else {
            // Negotiation failed; reset the connection and retry after the
            // idle hold.
            tracing::error!(collector = %header.source, "negotiation with collector failed");
            session.close();
        }
    }

    fn receive_request(&self, header: &SandeshHeader, decoder: &mut RecordDecoder<'_>, msg_len: usize) {
        tracing::debug!(name = %header.name, "received message");
        let Some(handler) = self.requests.get(&header.name) else {
            self.shared
                .stats
                .drop_rx(&header.name, msg_len, RxDropReason::CreateFailed);
            return;
        };
        match decoder.next::<serde_json::Value>() {
            Ok(payload) => {
                self.shared.stats.update_rx(&header.name, msg_len);
                handler(payload);
            }
            Err(err) => {
                tracing::error!(name = %header.name, error = %err, "failed to decode request");
                self.shared
                    .stats
                    .drop_rx(&header.name, msg_len, RxDropReason::DecodingFailed);
            }
        }
    }
}

impl ReceiveHandler for SandeshConnection {
    fn receive(&self, session: &Arc<SandeshSession>, body: Bytes) {
        self.receive_msg(session, &body);
    }
}
