use std::collections::HashMap;
use std::fmt;

use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};

/// Command codes carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Udp,
    ApConfig,
    Active,
    SessKeyNegStart,
    SessKeyNegResponse,
    SessKeyNegFinish,
    Unbind,
    Control,
    Status,
    HeartBeat,
    DpQuery,
    QueryWifi,
    TokenBind,
    ControlNew,
    EnableWifi,
    DpQueryNew,
    SceneExecute,
    DpRefresh,
    UdpNew,
    ApConfigNew,
    BroadcastLpv34,
    LanExtStream,
    /// Synthetic: the device answered a DP_QUERY with "json obj data unvalid".
    /// Never appears on the wire.
    DpQueryNotSupported,
}

impl CommandType {
    /// Wire code of the command, `None` for synthetic commands
    pub fn code(&self) -> Option<u32> {
        let code = match self {
            CommandType::Udp => 0x00,
            CommandType::ApConfig => 0x01,
            CommandType::Active => 0x02,
            CommandType::SessKeyNegStart => 0x03,
            CommandType::SessKeyNegResponse => 0x04,
            CommandType::SessKeyNegFinish => 0x05,
            CommandType::Unbind => 0x06,
            CommandType::Control => 0x07,
            CommandType::Status => 0x08,
            CommandType::HeartBeat => 0x09,
            CommandType::DpQuery => 0x0a,
            CommandType::QueryWifi => 0x0b,
            CommandType::TokenBind => 0x0c,
            CommandType::ControlNew => 0x0d,
            CommandType::EnableWifi => 0x0e,
            CommandType::DpQueryNew => 0x10,
            CommandType::SceneExecute => 0x11,
            CommandType::DpRefresh => 0x12,
            CommandType::UdpNew => 0x13,
            CommandType::ApConfigNew => 0x14,
            CommandType::BroadcastLpv34 => 0x23,
            CommandType::LanExtStream => 0x40,
            CommandType::DpQueryNotSupported => return None,
        };
        Some(code)
    }

    /// Looks up a command by its wire code
    pub fn from_code(code: u32) -> Option<Self> {
        let command = match code {
            0x00 => CommandType::Udp,
            0x01 => CommandType::ApConfig,
            0x02 => CommandType::Active,
            0x03 => CommandType::SessKeyNegStart,
            0x04 => CommandType::SessKeyNegResponse,
            0x05 => CommandType::SessKeyNegFinish,
            0x06 => CommandType::Unbind,
            0x07 => CommandType::Control,
            0x08 => CommandType::Status,
            0x09 => CommandType::HeartBeat,
            0x0a => CommandType::DpQuery,
            0x0b => CommandType::QueryWifi,
            0x0c => CommandType::TokenBind,
            0x0d => CommandType::ControlNew,
            0x0e => CommandType::EnableWifi,
            0x10 => CommandType::DpQueryNew,
            0x11 => CommandType::SceneExecute,
            0x12 => CommandType::DpRefresh,
            0x13 => CommandType::UdpNew,
            0x14 => CommandType::ApConfigNew,
            0x23 => CommandType::BroadcastLpv34,
            0x40 => CommandType::LanExtStream,
            _ => return None,
        };
        Some(command)
    }

    /// Whether the command carries a discovery broadcast
    pub fn is_discovery(&self) -> bool {
        matches!(self, CommandType::Udp | CommandType::UdpNew | CommandType::BroadcastLpv34)
    }

    /// Whether a 3.4 payload goes out without the version header
    pub(crate) fn omits_v34_header(&self) -> bool {
        matches!(
            self,
            CommandType::DpQuery
                | CommandType::HeartBeat
                | CommandType::DpQueryNew
                | CommandType::SessKeyNegStart
                | CommandType::SessKeyNegFinish
                | CommandType::DpRefresh
        )
    }

    /// Whether a 3.3 payload goes out without the version header
    pub(crate) fn omits_v33_header(&self) -> bool {
        matches!(self, CommandType::DpQuery | CommandType::DpRefresh)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandType::Udp => "UDP",
            CommandType::ApConfig => "AP_CONFIG",
            CommandType::Active => "ACTIVE",
            CommandType::SessKeyNegStart => "SESS_KEY_NEG_START",
            CommandType::SessKeyNegResponse => "SESS_KEY_NEG_RESPONSE",
            CommandType::SessKeyNegFinish => "SESS_KEY_NEG_FINISH",
            CommandType::Unbind => "UNBIND",
            CommandType::Control => "CONTROL",
            CommandType::Status => "STATUS",
            CommandType::HeartBeat => "HEART_BEAT",
            CommandType::DpQuery => "DP_QUERY",
            CommandType::QueryWifi => "QUERY_WIFI",
            CommandType::TokenBind => "TOKEN_BIND",
            CommandType::ControlNew => "CONTROL_NEW",
            CommandType::EnableWifi => "ENABLE_WIFI",
            CommandType::DpQueryNew => "DP_QUERY_NEW",
            CommandType::SceneExecute => "SCENE_EXECUTE",
            CommandType::DpRefresh => "DP_REFRESH",
            CommandType::UdpNew => "UDP_NEW",
            CommandType::ApConfigNew => "AP_CONFIG_NEW",
            CommandType::BroadcastLpv34 => "BROADCAST_LPV34",
            CommandType::LanExtStream => "LAN_EXT_STREAM",
            CommandType::DpQueryNotSupported => "DP_QUERY_NOT_SUPPORTED",
        };
        f.write_str(name)
    }
}

/// A decoded or to-be-encoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Command of the frame
    pub command: CommandType,
    /// Payload of the frame
    pub payload: Payload,
}

impl Message {
    /// Creates a new message
    pub fn new(command: CommandType, payload: Payload) -> Self {
        Message { command, payload }
    }

    /// Creates a message whose content is wrapped into the device envelope
    pub fn with_content(command: CommandType, content: Map<String, Value>) -> Self {
        Message::new(command, Payload::Map(content))
    }

    /// Creates a message sending raw bytes verbatim
    pub fn raw(command: CommandType, bytes: impl Into<Vec<u8>>) -> Self {
        Message::new(command, Payload::Raw(bytes.into()))
    }

    /// Heartbeat request
    pub fn heartbeat() -> Self {
        let mut content = Map::new();
        content.insert("dps".to_string(), Value::String(String::new()));
        Message::with_content(CommandType::HeartBeat, content)
    }
}

/// Message payload variants
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured content; wrapped into the device envelope when encoded
    Map(Map<String, Value>),
    /// Raw bytes sent or received verbatim
    Raw(Vec<u8>),
    /// Discovery broadcast
    Discovery(DiscoveryMessage),
    /// Status or query reply
    Status(StatusPayload),
}

impl Payload {
    /// Empty structured payload
    pub fn empty() -> Self {
        Payload::Map(Map::new())
    }

    /// Raw bytes of the payload, if it is raw
    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Payload::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Content of a STATUS push or DP_QUERY reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(rename = "devId", default, skip_serializing_if = "Option::is_none")]
    pub dev_id: Option<String>,
    #[serde(rename = "gwId", default, skip_serializing_if = "Option::is_none")]
    pub gw_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dps: Option<HashMap<u32, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StatusData>,
}

/// Nested status data used by protocol 3.4 pushes and gateways
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dps: Option<HashMap<u32, Value>>,
}

impl StatusPayload {
    /// Data points reported by the device.
    ///
    /// Protocol 4 pushes (and replies without a top-level `dps`) carry them in `data`.
    pub fn data_points(&self) -> HashMap<u32, Value> {
        let nested = self.data.as_ref().and_then(|d| d.dps.as_ref());
        let dps = if self.protocol == Some(4) {
            nested.or(self.dps.as_ref())
        } else {
            self.dps.as_ref().or(nested)
        };
        dps.cloned().unwrap_or_default()
    }

    /// Sub-device id for gateway messages
    pub fn cid(&self) -> Option<String> {
        self.cid
            .clone()
            .or_else(|| self.data.as_ref().and_then(|d| d.cid.clone()))
    }
}

/// Discovery broadcast sent by devices on UDP
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub ip: String,
    #[serde(rename = "gwId")]
    pub gw_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ability: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,
    #[serde(rename = "productKey", default, skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wf_cfg: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_codes() {
        assert_eq!(CommandType::Control.code(), Some(7));
        assert_eq!(CommandType::BroadcastLpv34.code(), Some(0x23));
        assert_eq!(CommandType::DpQueryNotSupported.code(), None);
        assert_eq!(CommandType::from_code(0x0a), Some(CommandType::DpQuery));
        assert_eq!(CommandType::from_code(0x0f), None);

        for code in 0..=0x40u32 {
            if let Some(command) = CommandType::from_code(code) {
                assert_eq!(command.code(), Some(code));
            }
        }
        assert_eq!(CommandType::SessKeyNegResponse.to_string(), "SESS_KEY_NEG_RESPONSE");
    }

    #[test]
    fn test_heartbeat_message() {
        let heartbeat = Message::heartbeat();
        assert_eq!(heartbeat.command, CommandType::HeartBeat);
        match heartbeat.payload {
            Payload::Map(content) => assert_eq!(content.get("dps"), Some(&json!(""))),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_status_payload_v33() {
        let status: StatusPayload = serde_json::from_str(
            r#"{"devId":"bf01","dps":{"1":true,"2":"white","20":500},"t":1700000000}"#,
        )
        .unwrap();
        let dps = status.data_points();
        assert_eq!(dps.len(), 3);
        assert_eq!(dps[&1], json!(true));
        assert_eq!(dps[&20], json!(500));
        assert_eq!(status.cid(), None);
    }

    #[test]
    fn test_status_payload_protocol_4() {
        let status: StatusPayload = serde_json::from_str(
            r#"{"protocol":4,"t":1700000000,"data":{"cid":"sub1","dps":{"1":false}}}"#,
        )
        .unwrap();
        assert_eq!(status.data_points()[&1], json!(false));
        assert_eq!(status.cid().as_deref(), Some("sub1"));
    }

    #[test]
    fn test_discovery_message() {
        let message: DiscoveryMessage = serde_json::from_str(
            r#"{"ip":"192.168.1.42","gwId":"bf0123","active":2,"ability":0,"mode":0,
                "encrypt":true,"productKey":"keyabc","version":"3.3"}"#,
        )
        .unwrap();
        assert_eq!(message.ip, "192.168.1.42");
        assert_eq!(message.gw_id, "bf0123");
        assert_eq!(message.product_key.as_deref(), Some("keyabc"));
        assert_eq!(message.encrypt, Some(true));

        let missing_ip = serde_json::from_str::<DiscoveryMessage>(r#"{"gwId":"x","version":"3.3"}"#);
        assert!(missing_ip.is_err());
    }
}
