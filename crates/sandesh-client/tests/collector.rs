//! End-to-end tests: the client against an in-process mock collector.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sandesh_client::client::{ConnectionStatus, SandeshClient};
use sandesh_client::config::SandeshConfig;
use sandesh_client::message::{
    timestamp_usec, CtrlClientToServer, CtrlServerToClient, SandeshHeader, SandeshLevel,
    SandeshType, UveTypeInfo, CTRL_CLIENT_TO_SERVER, CTRL_SERVER_TO_CLIENT, SANDESH_CONTROL_HINT,
    SANDESH_SYNC_HINT,
};
use sandesh_client::state_machine::State;
use sandesh_client::uve::{MergeMode, UveKind, UveUpdate};
use sandesh_transport::codec::{encode_record, RecordDecoder};
use sandesh_transport::framer::{encode_envelope, FrameReader};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct MockCollector {
    stream: TcpStream,
    reader: FrameReader,
}

impl MockCollector {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        Self {
            stream,
            reader: FrameReader::new(),
        }
    }

    async fn next_message(&mut self) -> (SandeshHeader, serde_json::Value) {
        loop {
            if let Some(body) = self.reader.next_body() {
                let mut decoder = RecordDecoder::new(&body);
                let header: SandeshHeader = decoder.next().unwrap();
                let payload: serde_json::Value = decoder.next().unwrap();
                return (header, payload);
            }
            let mut chunk = vec![0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "collector connection closed unexpectedly");
            self.reader.feed(&chunk[..n]);
        }
    }

    async fn send_ctrl(&mut self, success: bool, type_info: Vec<UveTypeInfo>) {
        let header = SandeshHeader {
            name: CTRL_SERVER_TO_CLIENT.into(),
            timestamp: timestamp_usec(),
            module: "collector".into(),
            source: "mock-collector".into(),
            context: "ctrl".into(),
            sequence_num: 1,
            msg_type: SandeshType::Response,
            hints: SANDESH_CONTROL_HINT,
            level: SandeshLevel::SysInfo,
            category: String::new(),
            node_type: String::new(),
            instance_id: "0".into(),
        };
        let ctrl = CtrlServerToClient { success, type_info };
        let mut body = encode_record(&header).unwrap();
        body.extend_from_slice(&encode_record(&ctrl).unwrap());
        let envelope = encode_envelope(&body);
        self.stream.write_all(&envelope).await.unwrap();
    }
}

fn test_config(collector_addr: String) -> SandeshConfig {
    SandeshConfig {
        source_id: "host-1".into(),
        module: "control-node".into(),
        node_type: "control".into(),
        collectors: vec![collector_addr],
        idle_hold_ms: 50,
        ..Default::default()
    }
}

fn node_uve(name: &str, status: &str) -> UveUpdate {
    UveUpdate {
        type_name: "NodeStatusUVE".into(),
        table: "ObjectVRouter".into(),
        name: name.into(),
        deleted: false,
        data: serde_json::json!({"status": status}),
        seqnum: 0,
    }
}

async fn wait_for_state(client: &SandeshClient, state: State) {
    loop {
        if client.status().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_handshake_and_uve_sync() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = SandeshClient::new(test_config(addr)).unwrap();
        client
            .uve_registry()
            .register("NodeStatusUVE", UveKind::Uve, MergeMode::Overwrite)
            .unwrap();
        // Queued before any collector exists: dropped from the send path
        // but retained in the cache for the post-handshake sync.
        client.send_uve(node_uve("node-1", "functional"));

        let mut collector = MockCollector::accept(&listener).await;
        let (header, payload) = collector.next_message().await;
        assert_eq!(header.name, CTRL_CLIENT_TO_SERVER);
        assert_ne!(header.hints & SANDESH_CONTROL_HINT, 0);
        assert_eq!(header.module, "control-node");
        let ctrl: CtrlClientToServer = serde_json::from_value(payload).unwrap();
        assert_eq!(ctrl.connect_count, 1);
        assert_eq!(ctrl.uve_type_names, vec!["NodeStatusUVE".to_string()]);

        // Ack nothing: the whole cache syncs.
        collector.send_ctrl(true, vec![]).await;

        let (header, payload) = collector.next_message().await;
        assert_eq!(header.name, "NodeStatusUVE");
        assert_ne!(header.hints & SANDESH_SYNC_HINT, 0);
        assert_eq!(payload["name"], "node-1");
        assert_eq!(payload["data"]["status"], "functional");

        wait_for_state(&client, State::Established).await;
        let status = client.status();
        assert_eq!(status.connection_status, ConnectionStatus::Up);
        assert_eq!(status.collector_name.as_deref(), Some("mock-collector"));
        assert_eq!(status.connect_count, 1);

        // A live UVE now flows straight through the session.
        client.send_uve(node_uve("node-2", "functional"));
        let (header, payload) = collector.next_message().await;
        assert_eq!(header.name, "NodeStatusUVE");
        assert_eq!(payload["name"], "node-2");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_acked_seqnos_limit_the_sync() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = SandeshClient::new(test_config(addr)).unwrap();
        client
            .uve_registry()
            .register("NodeStatusUVEList", UveKind::Uve, MergeMode::Overwrite)
            .unwrap();
        for name in ["node-1", "node-2", "node-3"] {
            let mut update = node_uve(name, "functional");
            update.type_name = "NodeStatusUVEList".into();
            client.send_uve(update);
        }

        let mut collector = MockCollector::accept(&listener).await;
        let (_, _) = collector.next_message().await;
        // The collector has already seen sequence numbers up to 2: only the
        // third entry syncs.
        collector
            .send_ctrl(
                true,
                vec![UveTypeInfo {
                    type_name: "NodeStatusUVEList".into(),
                    seq_num: 2,
                }],
            )
            .await;

        let (header, payload) = collector.next_message().await;
        assert_eq!(header.name, "NodeStatusUVEList");
        assert_eq!(header.sequence_num, 3);
        assert_eq!(payload["name"], "node-3");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_reconnect_after_collector_close() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = SandeshClient::new(test_config(addr)).unwrap();

        let mut collector = MockCollector::accept(&listener).await;
        let (header, _) = collector.next_message().await;
        assert_eq!(header.name, CTRL_CLIENT_TO_SERVER);
        collector.send_ctrl(true, vec![]).await;
        wait_for_state(&client, State::Established).await;

        // Collector goes away; the client re-handshakes with a bumped
        // connect counter on the replacement connection.
        drop(collector);
        let mut collector = MockCollector::accept(&listener).await;
        let (header, payload) = collector.next_message().await;
        assert_eq!(header.name, CTRL_CLIENT_TO_SERVER);
        let ctrl: CtrlClientToServer = serde_json::from_value(payload).unwrap();
        assert_eq!(ctrl.connect_count, 2);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_failed_negotiation_forces_retry() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = SandeshClient::new(test_config(addr)).unwrap();

        let mut collector = MockCollector::accept(&listener).await;
        let (header, _) = collector.next_message().await;
        assert_eq!(header.name, CTRL_CLIENT_TO_SERVER);
        collector.send_ctrl(false, vec![]).await;

        // The refused session is closed and a fresh attempt arrives after
        // the idle hold.
        let mut collector = MockCollector::accept(&listener).await;
        let (header, payload) = collector.next_message().await;
        assert_eq!(header.name, CTRL_CLIENT_TO_SERVER);
        let ctrl: CtrlClientToServer = serde_json::from_value(payload).unwrap();
        assert_eq!(ctrl.connect_count, 2);
        assert_ne!(client.status().state, State::Established);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_shutdown_tears_down_session() {
    init_tracing();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = SandeshClient::new(test_config(addr)).unwrap();
        let mut collector = MockCollector::accept(&listener).await;
        let (_, _) = collector.next_message().await;
        collector.send_ctrl(true, vec![]).await;
        wait_for_state(&client, State::Established).await;

        client.shutdown();
        wait_for_state(&client, State::Idle).await;
        let status = client.status();
        assert_eq!(status.connection_status, ConnectionStatus::Down);

        // The administratively-down client must not reconnect.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.status().state, State::Idle);
    })
    .await
    .unwrap();
}
