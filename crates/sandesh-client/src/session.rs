//! A single collector session.
//!
//! Owns the transport stream, the frame reader, the watermark send queue,
//! and the drain worker that encodes and writes envelopes. A session is
//! bound to exactly one collector; the state machine replaces the whole
//! session on reconnect and discards events from superseded ones.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;

use sandesh_transport::codec;
use sandesh_transport::framer::{self, FrameReader};
use sandesh_transport::tcp::{self, SessionReadHalf, SessionWriteHalf, TcpOptions, MAX_READ_SIZE};
use sandesh_transport::tls::TlsClient;

use crate::message::{timestamp_usec, SandeshHeader, SandeshLevel, SandeshMessage, SandeshType};
use crate::queue::{WaterMark, Weighted, WorkQueue};
use crate::state_machine::{Event, EventKind};
use crate::stats::{RxDropReason, SandeshMessageStats, TxDropReason};
use crate::stats_client::StatsClient;

/// Writer cache flush threshold: consecutive queue elements coalesce into
/// writes of at most this many bytes while more elements are pending.
pub const MAX_SEND_BUF_SIZE: usize = 4096;

/// Default send-queue watermark table: (byte threshold, level, is_high).
pub const DEFAULT_WATERMARKS: &[(usize, SandeshLevel, bool)] = &[
    (50 * 1024 * 1024, SandeshLevel::SysUve, true),
    (30 * 1024 * 1024, SandeshLevel::SysEmerg, true),
    (20 * 1024 * 1024, SandeshLevel::SysErr, true),
    (1024 * 1024, SandeshLevel::SysDebug, true),
    (35 * 1024 * 1024, SandeshLevel::SysEmerg, false),
    (25 * 1024 * 1024, SandeshLevel::SysErr, false),
    (15 * 1024 * 1024, SandeshLevel::SysDebug, false),
    (2 * 1024, SandeshLevel::Invalid, false),
];

/// Queued element: the message plus its accounted size.
pub struct Element {
    /// The queued message.
    pub message: SandeshMessage,
    /// Accounted byte size.
    pub size: usize,
}

impl Weighted for Element {
    fn weight(&self) -> usize {
        self.size
    }
}

/// Header fields identifying this generator on the wire.
#[derive(Debug, Clone, Default)]
pub struct SessionIdentity {
    /// Generator host identity.
    pub source_id: String,
    /// Generator module name.
    pub module: String,
    /// Generator node type.
    pub node_type: String,
    /// Generator instance id.
    pub instance_id: String,
}

/// Handles message bodies extracted from the inbound byte stream.
pub trait ReceiveHandler: Send + Sync {
    /// Called once per complete body, in arrival order.
    fn receive(&self, session: &Arc<SandeshSession>, body: Bytes);
}

/// Everything a session needs at construction.
pub struct SessionParams {
    /// Collector endpoint, `host:port`.
    pub endpoint: String,
    /// Socket options.
    pub options: TcpOptions,
    /// TLS connector; plain TCP when absent.
    pub tls: Option<Arc<TlsClient>>,
    /// Generator identity stamped into headers.
    pub identity: SessionIdentity,
    /// Watermark table: (byte threshold, level, is_high).
    pub watermarks: Vec<(usize, SandeshLevel, bool)>,
    /// Bound on queued send items.
    pub queue_bound: usize,
    /// Items the drain worker processes per scheduling slice.
    pub drain_batch: usize,
    /// Optional UDP stats daemon mirroring UVE traffic.
    pub stats_collector: Option<String>,
}

/// One transport session bound to a single collector.
pub struct SandeshSession {
    weak_self: Weak<SandeshSession>,
    endpoint: String,
    options: TcpOptions,
    tls: Option<Arc<TlsClient>>,
    identity: SessionIdentity,
    drain_batch: usize,
    connected: AtomicBool,
    read_half: Mutex<Option<SessionReadHalf>>,
    write_half: tokio::sync::Mutex<Option<SessionWriteHalf>>,
    send_queue: WorkQueue<Element>,
    send_level: Arc<AtomicU8>,
    send_buf: Mutex<BytesMut>,
    event_tx: UnboundedSender<Event>,
    stats: Arc<SandeshMessageStats>,
    sending_enabled: Arc<AtomicBool>,
    stats_client: Option<Arc<StatsClient>>,
}

impl std::fmt::Debug for SandeshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandeshSession")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("send_level", &self.send_level())
            .finish()
    }
}

impl SandeshSession {
    /// Creates a disconnected session bound to one collector.
    pub fn new(
        params: SessionParams,
        event_tx: UnboundedSender<Event>,
        stats: Arc<SandeshMessageStats>,
        sending_enabled: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let send_level = Arc::new(AtomicU8::new(SandeshLevel::Invalid as u8));
        let send_queue = WorkQueue::bounded(params.queue_bound);
        let (high, low) = build_watermarks(&params.watermarks, &send_level);
        send_queue.set_high_watermarks(high);
        send_queue.set_low_watermarks(low);
        let stats_client = params
            .stats_collector
            .as_ref()
            .map(|target| Arc::new(StatsClient::new(target.clone())));

        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            endpoint: params.endpoint,
            options: params.options,
            tls: params.tls,
            identity: params.identity,
            drain_batch: params.drain_batch,
            connected: AtomicBool::new(false),
            read_half: Mutex::new(None),
            write_half: tokio::sync::Mutex::new(None),
            send_queue,
            send_level,
            send_buf: Mutex::new(BytesMut::new()),
            event_tx,
            stats,
            sending_enabled,
            stats_client,
        })
    }

    /// The collector endpoint this session is bound to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the transport is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// The current send level; messages at or above it are shed.
    pub fn send_level(&self) -> SandeshLevel {
        SandeshLevel::from_u8(self.send_level.load(Ordering::Acquire))
    }

    /// Whether the send queue holds no pending messages.
    pub fn is_send_queue_empty(&self) -> bool {
        self.send_queue.is_empty()
    }

    /// The send queue, for watermark and counter inspection.
    pub fn send_queue(&self) -> &WorkQueue<Element> {
        &self.send_queue
    }

    /// Connects to the collector and reports the outcome to the state
    /// machine as an event.
    pub async fn start_connect(self: Arc<Self>) {
        match tcp::connect(&self.endpoint, &self.options, self.tls.as_deref()).await {
            Ok(stream) => {
                let (read, write) = stream.into_split();
                *self.read_half.lock().unwrap() = Some(read);
                *self.write_half.lock().await = Some(write);
                self.connected.store(true, Ordering::Release);
                let _ = self
                    .event_tx
                    .send(Event::with_session(EventKind::TcpConnected, self.clone()));
            }
            Err(err) => {
                tracing::error!(endpoint = %self.endpoint, error = %err, "collector connect failed");
                let _ = self
                    .event_tx
                    .send(Event::with_session(EventKind::TcpConnectFail, self.clone()));
            }
        }
    }

    /// Runs the read loop until EOF or error, handing every extracted body
    /// to `handler`.
    pub async fn read_loop(self: Arc<Self>, handler: Arc<dyn ReceiveHandler>) {
        let read_half = self.read_half.lock().unwrap().take();
        let Some(mut read_half) = read_half else {
            tracing::error!(endpoint = %self.endpoint, "read loop started without a stream");
            return;
        };
        let mut reader = FrameReader::new();
        let mut chunk = vec![0u8; MAX_READ_SIZE];
        let mut seen_drops = 0u64;
        loop {
            if !self.is_connected() {
                break;
            }
            match read_half.read(&mut chunk).await {
                Ok(0) => {
                    self.close();
                    break;
                }
                Ok(n) => {
                    reader.feed(&chunk[..n]);
                    while let Some(body) = reader.next_body() {
                        handler.receive(&self, body);
                    }
                    if reader.drops() > seen_drops {
                        for _ in seen_drops..reader.drops() {
                            self.stats
                                .drop_rx("__UNKNOWN__", 0, RxDropReason::DecodingFailed);
                        }
                        seen_drops = reader.drops();
                    }
                }
                Err(err) => {
                    tracing::error!(endpoint = %self.endpoint, error = %err, "collector read error");
                    self.close();
                    break;
                }
            }
        }
    }

    /// Closes the session. Idempotent; emits `TcpClose` exactly once.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let Some(this) = self.weak_self.upgrade() else {
                return;
            };
            let session = this.clone();
            tokio::spawn(async move {
                if let Some(mut write) = session.write_half.lock().await.take() {
                    let _ = write.shutdown().await;
                }
            });
            let _ = self
                .event_tx
                .send(Event::with_session(EventKind::TcpClose, this));
        }
    }

    /// Queues a message for transmission, starting the drain worker if
    /// needed. A refused enqueue is counted against the message type.
    pub fn enqueue(&self, message: SandeshMessage) {
        let size = message.approx_size();
        let name = message.name.clone();
        match self.send_queue.enqueue(Element { message, size }) {
            Ok(()) => self.maybe_start_runner(),
            Err(_refused) => {
                self.stats.drop_tx(&name, size, TxDropReason::NoQueue);
            }
        }
    }

    /// Starts the drain worker unless one is already running or sending is
    /// administratively disabled.
    pub fn maybe_start_runner(&self) {
        if self.send_queue.is_empty() || !self.sending_enabled.load(Ordering::Acquire) {
            return;
        }
        if !self.send_queue.try_claim_runner() {
            return;
        }
        let Some(session) = self.weak_self.upgrade() else {
            self.send_queue.release_runner();
            return;
        };
        tokio::spawn(async move {
            session.drain().await;
        });
    }

    /// Drain worker: processes bounded batches, yielding between slices so
    /// one backlog cannot monopolize the scheduler.
    async fn drain(self: Arc<Self>) {
        loop {
            let mut work = self.drain_batch;
            while work > 0 && self.sending_enabled.load(Ordering::Acquire) {
                match self.send_queue.dequeue() {
                    Some(element) => {
                        self.send_element(element).await;
                        work -= 1;
                    }
                    None => break,
                }
            }
            if self.send_queue.is_empty() || !self.sending_enabled.load(Ordering::Acquire) {
                self.send_queue.release_runner();
                // An enqueue racing the release would find the slot taken
                // and not start a worker; re-claim if work remains.
                if !self.send_queue.is_empty()
                    && self.sending_enabled.load(Ordering::Acquire)
                    && self.send_queue.try_claim_runner()
                {
                    continue;
                }
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn send_element(&self, element: Element) {
        let more = element.message.more || !self.send_queue.is_empty();
        let message = element.message;
        if !self.is_connected() {
            self.stats
                .drop_tx(&message.name, element.size, TxDropReason::SessionNotConnected);
            return;
        }
        let envelope = match self.encode(&message) {
            Ok(buf) => buf,
            Err(reason) => {
                self.stats.drop_tx(&message.name, element.size, reason);
                return;
            }
        };
        self.stats.update_tx(&message.name, envelope.len());
        if let Err(err) = self.write_buffered(&envelope, more).await {
            tracing::error!(endpoint = %self.endpoint, error = %err, "error sending message");
        }
        if message.msg_type == SandeshType::Uve || message.msg_type == SandeshType::Alarm {
            if let Some(stats_client) = &self.stats_client {
                stats_client.send(&message).await;
            }
        }
    }

    /// Encodes header and message through the codec and wraps them in the
    /// envelope.
    fn encode(&self, message: &SandeshMessage) -> Result<BytesMut, TxDropReason> {
        let header = SandeshHeader {
            name: message.name.clone(),
            timestamp: timestamp_usec(),
            module: self.identity.module.clone(),
            source: self.identity.source_id.clone(),
            context: message.context.clone(),
            sequence_num: message.seqnum,
            msg_type: message.msg_type,
            hints: message.hints,
            level: message.level,
            category: String::new(),
            node_type: self.identity.node_type.clone(),
            instance_id: self.identity.instance_id.clone(),
        };
        let mut body =
            codec::encode_record(&header).map_err(|_| TxDropReason::HeaderWriteFailed)?;
        let payload =
            codec::encode_record(&message.payload).map_err(|_| TxDropReason::WriteFailed)?;
        body.extend_from_slice(&payload);
        Ok(framer::encode_envelope(&body))
    }

    /// Coalesces consecutive envelopes into bounded socket writes while
    /// more queue elements are pending.
    async fn write_buffered(&self, envelope: &[u8], more: bool) -> std::io::Result<()> {
        let pending = {
            let mut cache = self.send_buf.lock().unwrap();
            cache.extend_from_slice(envelope);
            if more && cache.len() < MAX_SEND_BUF_SIZE {
                None
            } else {
                Some(cache.split().freeze())
            }
        };
        match pending {
            Some(data) => self.write(&data).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Writes raw bytes to the collector stream, closing the session on
    /// failure. Returns the number of bytes written.
    pub async fn write(&self, data: &[u8]) -> std::io::Result<usize> {
        if !self.is_connected() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session not connected",
            ));
        }
        let mut guard = self.write_half.lock().await;
        match guard.as_mut() {
            Some(write) => match write.write_all(data).await {
                Ok(()) => Ok(data.len()),
                Err(err) => {
                    drop(guard);
                    self.close();
                    Err(err)
                }
            },
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "session not connected",
            )),
        }
    }
}

fn build_watermarks(
    table: &[(usize, SandeshLevel, bool)],
    send_level: &Arc<AtomicU8>,
) -> (Vec<WaterMark>, Vec<WaterMark>) {
    let mut high = Vec::new();
    let mut low = Vec::new();
    for &(size, level, is_high) in table {
        let send_level = send_level.clone();
        let callback = Box::new(move |qsize: usize| {
            let prev = send_level.swap(level as u8, Ordering::AcqRel);
            if prev != level as u8 {
                tracing::info!(
                    queue_size = qsize,
                    from = %SandeshLevel::from_u8(prev),
                    to = %level,
                    "send level changed"
                );
            }
        });
        let mark = WaterMark { size, callback };
        if is_high {
            high.push(mark);
        } else {
            low.push(mark);
        }
    }
    (high, low)
}
