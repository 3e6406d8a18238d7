//! Routing of decoded messages to the component responsible for them.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::{CommandType, DiscoveryMessage, Message, Payload};

/// Destination of a decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// HEART_BEAT reply for the liveness monitor
    Heartbeat,
    /// SESS_KEY_NEG_RESPONSE payload for the session negotiator
    Negotiation(Vec<u8>),
    /// Data points for the device status listener
    Status {
        cid: Option<String>,
        dps: HashMap<u32, Value>,
    },
    /// Broadcast for the discovery registry
    Discovery(DiscoveryMessage),
    /// Nothing to do
    Ignore(CommandType),
}

/// Decides where a decoded message goes
pub fn route(message: Message) -> Route {
    match (message.command, message.payload) {
        (CommandType::HeartBeat, _) => Route::Heartbeat,

        (CommandType::SessKeyNegResponse, Payload::Raw(bytes)) => Route::Negotiation(bytes),

        (CommandType::Status | CommandType::DpQuery, Payload::Status(status)) => Route::Status {
            cid: status.cid(),
            dps: status.data_points(),
        },

        // the caller falls back to CONTROL with null values
        (CommandType::DpQueryNotSupported, _) => Route::Status {
            cid: None,
            dps: HashMap::new(),
        },

        (command, Payload::Discovery(info)) if command.is_discovery() => Route::Discovery(info),

        (command, _) => Route::Ignore(command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StatusData, StatusPayload};
    use serde_json::json;

    #[test]
    fn test_route_status() {
        let mut dps = HashMap::new();
        dps.insert(1, json!(true));
        let status = StatusPayload {
            protocol: Some(4),
            data: Some(StatusData {
                cid: Some("sub01".to_string()),
                dps: Some(dps.clone()),
            }),
            ..Default::default()
        };

        let route = route(Message::new(CommandType::Status, Payload::Status(status)));
        assert_eq!(route, Route::Status { cid: Some("sub01".to_string()), dps });
    }

    #[test]
    fn test_route_dp_query_not_supported() {
        let route = route(Message::new(CommandType::DpQueryNotSupported, Payload::empty()));
        assert_eq!(route, Route::Status { cid: None, dps: HashMap::new() });
    }

    #[test]
    fn test_route_control_messages() {
        assert_eq!(route(Message::heartbeat()), Route::Heartbeat);
        assert_eq!(
            route(Message::raw(CommandType::SessKeyNegResponse, vec![1, 2, 3])),
            Route::Negotiation(vec![1, 2, 3])
        );
        assert_eq!(
            route(Message::raw(CommandType::Control, Vec::new())),
            Route::Ignore(CommandType::Control)
        );
    }

    #[test]
    fn test_route_discovery() {
        let info = DiscoveryMessage {
            ip: "10.0.0.9".to_string(),
            gw_id: "bf09".to_string(),
            version: "3.3".to_string(),
            ..Default::default()
        };
        let message = Message::new(CommandType::UdpNew, Payload::Discovery(info.clone()));
        assert_eq!(route(message), Route::Discovery(info));
    }
}
