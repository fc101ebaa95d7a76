//! Sandesh message model: severity levels, message kinds, the wire header
//! record, and the handshake control records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header hint: the message is a connection-control message.
pub const SANDESH_CONTROL_HINT: u32 = 0x1;
/// Header hint: the message was re-sent as part of a cache sync.
pub const SANDESH_SYNC_HINT: u32 = 0x2;

/// Name of the handshake request sent by the generator.
pub const CTRL_CLIENT_TO_SERVER: &str = "SandeshCtrlClientToServer";
/// Name of the handshake response expected from the collector.
pub const CTRL_SERVER_TO_CLIENT: &str = "SandeshCtrlServerToClient";

/// Message severity.
///
/// Lower numeric value is more severe; `SysUve` sits above the syslog-style
/// levels and `Invalid` is the out-of-band maximum. The send queue drops a
/// message when its level is numerically at or above the current send
/// level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum SandeshLevel {
    /// Emergency.
    SysEmerg = 0,
    /// Alert.
    SysAlert = 1,
    /// Critical.
    SysCrit = 2,
    /// Error.
    SysErr = 3,
    /// Warning.
    SysWarn = 4,
    /// Notice.
    SysNotice = 5,
    /// Informational.
    SysInfo = 6,
    /// Debug.
    SysDebug = 7,
    /// Implicit level of UVE traffic.
    SysUve = 8,
    /// No level; compares above every real level.
    #[default]
    Invalid = 255,
}

impl SandeshLevel {
    /// Recovers a level from its numeric representation.
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => SandeshLevel::SysEmerg,
            1 => SandeshLevel::SysAlert,
            2 => SandeshLevel::SysCrit,
            3 => SandeshLevel::SysErr,
            4 => SandeshLevel::SysWarn,
            5 => SandeshLevel::SysNotice,
            6 => SandeshLevel::SysInfo,
            7 => SandeshLevel::SysDebug,
            8 => SandeshLevel::SysUve,
            _ => SandeshLevel::Invalid,
        }
    }
}

impl std::fmt::Display for SandeshLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandeshLevel::SysEmerg => "SYS_EMERG",
            SandeshLevel::SysAlert => "SYS_ALERT",
            SandeshLevel::SysCrit => "SYS_CRIT",
            SandeshLevel::SysErr => "SYS_ERR",
            SandeshLevel::SysWarn => "SYS_WARN",
            SandeshLevel::SysNotice => "SYS_NOTICE",
            SandeshLevel::SysInfo => "SYS_INFO",
            SandeshLevel::SysDebug => "SYS_DEBUG",
            SandeshLevel::SysUve => "SYS_UVE",
            SandeshLevel::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

/// Kind of sandesh message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandeshType {
    /// System log event.
    System,
    /// Object log event.
    Object,
    /// Introspection request.
    Request,
    /// Introspection response.
    Response,
    /// Diagnostic trace.
    Trace,
    /// UVE state snapshot.
    Uve,
    /// Alarm state snapshot.
    Alarm,
}

/// Wire header record preceding every message body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandeshHeader {
    /// Message type name; routes inbound dispatch.
    pub name: String,
    /// Generation time, microseconds UTC.
    pub timestamp: i64,
    /// Originating module.
    pub module: String,
    /// Originating host identity.
    pub source: String,
    /// Request/response correlation context.
    pub context: String,
    /// Per-type sequence number.
    pub sequence_num: u32,
    /// Message kind.
    pub msg_type: SandeshType,
    /// Hint bits (control, sync).
    pub hints: u32,
    /// Severity.
    pub level: SandeshLevel,
    /// Logging category.
    pub category: String,
    /// Node type of the generator.
    pub node_type: String,
    /// Instance id of the generator.
    pub instance_id: String,
}

/// A message queued for transmission.
#[derive(Debug, Clone)]
pub struct SandeshMessage {
    /// Message type name.
    pub name: String,
    /// Message kind.
    pub msg_type: SandeshType,
    /// Severity.
    pub level: SandeshLevel,
    /// Per-type sequence number; assigned on the send path.
    pub seqnum: u32,
    /// Correlation context.
    pub context: String,
    /// Hint bits.
    pub hints: u32,
    /// More messages of the same batch follow immediately.
    pub more: bool,
    /// Opaque structured payload.
    pub payload: Value,
}

impl SandeshMessage {
    /// Creates a message with no sequence number, context, or hints.
    pub fn new(
        name: impl Into<String>,
        msg_type: SandeshType,
        level: SandeshLevel,
        payload: Value,
    ) -> Self {
        Self {
            name: name.into(),
            msg_type,
            level,
            seqnum: 0,
            context: String::new(),
            hints: 0,
            more: false,
            payload,
        }
    }

    /// Approximate byte size used for queue accounting.
    pub fn approx_size(&self) -> usize {
        self.name.len() + self.context.len() + approx_value_size(&self.payload) + 64
    }
}

fn approx_value_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(_) => 16,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(approx_value_size).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 4 + approx_value_size(v))
                .sum::<usize>()
        }
    }
}

/// Handshake request sent once per connection (generator to collector).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrlClientToServer {
    /// Generator host identity.
    pub source_id: String,
    /// Generator module name.
    pub module: String,
    /// Successful-connect counter.
    pub connect_count: u64,
    /// Every UVE type the generator knows about.
    pub uve_type_names: Vec<String>,
    /// Generator process id.
    pub pid: u32,
    /// Node type of the generator.
    pub node_type: String,
    /// Instance id of the generator.
    pub instance_id: String,
}

/// Per-type acknowledgement state in the handshake response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UveTypeInfo {
    /// UVE type name.
    pub type_name: String,
    /// Last sequence number the collector has seen for the type.
    pub seq_num: u32,
}

/// Handshake response (collector to generator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtrlServerToClient {
    /// Whether negotiation succeeded.
    pub success: bool,
    /// Per-type acknowledged sequence numbers.
    pub type_info: Vec<UveTypeInfo>,
}

/// Microseconds since the UNIX epoch.
pub fn timestamp_usec() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_level_ordering() {
        assert!(SandeshLevel::SysEmerg < SandeshLevel::SysErr);
        assert!(SandeshLevel::SysDebug < SandeshLevel::SysUve);
        assert!(SandeshLevel::SysUve < SandeshLevel::Invalid);
    }

    #[test]
    fn test_level_round_trip() {
        for raw in 0u8..=8 {
            assert_eq!(SandeshLevel::from_u8(raw) as u8, raw);
        }
        assert_eq!(SandeshLevel::from_u8(42), SandeshLevel::Invalid);
    }

    #[test]
    fn test_approx_size_grows_with_payload() {
        let small = SandeshMessage::new(
            "NodeStatus",
            SandeshType::System,
            SandeshLevel::SysInfo,
            json!({"status": "ok"}),
        );
        let big = SandeshMessage::new(
            "NodeStatus",
            SandeshType::System,
            SandeshLevel::SysInfo,
            json!({"status": "ok", "details": "x".repeat(1024)}),
        );
        assert!(big.approx_size() > small.approx_size() + 1000);
    }
}
