//! JSON envelope exchanged with control panels.
//!
//! Every frame is a text message of the form `{"event": <name>, "data": <payload>}`.
//!
//! Client → hub:
//! ```text
//! update_button   {cam, pos, ...fields}   relayed verbatim to the other panels
//! save_pos        {cam, pos}
//! recall_pos      {cam, pos}
//! focus_lock | focus_unlock | power_on | power_off     (data ignored)
//! ```
//!
//! Hub → client:
//! ```text
//! init            {camera_addresses, all_presets, tally_states}
//! update_tally    [code, ...]
//! error           {event, kind, message, camera?, slot?}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::device::{FocusValue, PresetSlot};
use crate::registry::Outbound;
use crate::storage::{ButtonKey, ButtonValue};
use crate::tally::TallyStatus;

/// Raw client frame before the payload is interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// A `(cam, pos)` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRef {
    #[serde(rename = "cam")]
    pub camera: usize,
    #[serde(rename = "pos")]
    pub slot: PresetSlot,
}

/// A validated client intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Button fields to merge; `cam`, `pos` and `focus` are stripped from `value`
    UpdateButton { key: ButtonKey, value: ButtonValue },
    SavePosition(PositionRef),
    RecallPosition(PositionRef),
    FocusLock(bool),
    Power(bool),
}

impl Intent {
    /// Parse and validate one text frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let envelope: ClientEnvelope =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let invalid = |reason: String| ProtocolError::InvalidPayload {
            event: envelope.event.clone(),
            reason,
        };

        match envelope.event.as_str() {
            "update_button" => {
                let position = PositionRef::deserialize(&envelope.data)
                    .map_err(|e| invalid(e.to_string()))?;
                let mut value = match envelope.data {
                    Value::Object(ref map) => map.clone(),
                    _ => return Err(invalid("expected an object".into())),
                };
                value.remove("cam");
                value.remove("pos");
                value.remove("focus");
                Ok(Intent::UpdateButton {
                    key: ButtonKey {
                        camera: position.camera,
                        slot: position.slot,
                    },
                    value,
                })
            }
            "save_pos" => PositionRef::deserialize(&envelope.data)
                .map(Intent::SavePosition)
                .map_err(|e| invalid(e.to_string())),
            "recall_pos" => PositionRef::deserialize(&envelope.data)
                .map(Intent::RecallPosition)
                .map_err(|e| invalid(e.to_string())),
            "focus_lock" => Ok(Intent::FocusLock(true)),
            "focus_unlock" => Ok(Intent::FocusLock(false)),
            "power_on" => Ok(Intent::Power(true)),
            "power_off" => Ok(Intent::Power(false)),
            _ => Err(ProtocolError::UnknownEvent(envelope.event.clone())),
        }
    }

    /// The client event name this intent came from.
    pub fn event_name(&self) -> &'static str {
        match self {
            Intent::UpdateButton { .. } => "update_button",
            Intent::SavePosition(_) => "save_pos",
            Intent::RecallPosition(_) => "recall_pos",
            Intent::FocusLock(true) => "focus_lock",
            Intent::FocusLock(false) => "focus_unlock",
            Intent::Power(true) => "power_on",
            Intent::Power(false) => "power_off",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload { event: String, reason: String },
    #[error("encode failed: {0}")]
    Encode(String),
}

/// One row of `all_presets`: stored focus and button fields for a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetRow {
    #[serde(rename = "cam")]
    pub camera: usize,
    #[serde(rename = "pos")]
    pub slot: PresetSlot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<FocusValue>,
    #[serde(flatten)]
    pub button: ButtonValue,
}

/// Full state sent to a panel on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub camera_addresses: Vec<String>,
    pub all_presets: Vec<PresetRow>,
    pub tally_states: Vec<TallyStatus>,
}

/// Failure report for the session that sent an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentFailure {
    pub event: String,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<PresetSlot>,
}

/// Hub → panel messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Init(Snapshot),
    UpdateTally(Vec<TallyStatus>),
    Error(IntentFailure),
}

impl ServerMessage {
    /// Encode once for every recipient.
    pub fn encode(&self) -> Result<Outbound, ProtocolError> {
        serde_json::to_string(self)
            .map(Arc::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_update_button_strips_position() {
        let raw = r#"{"event":"update_button","data":{"cam":1,"pos":4,"name":"Wide","btn_class":"active","focus":99}}"#;
        let intent = Intent::parse(raw).unwrap();

        let Intent::UpdateButton { key, value } = intent else {
            panic!("expected UpdateButton, got {intent:?}");
        };
        assert_eq!(key, ButtonKey { camera: 1, slot: 4 });
        assert_eq!(Value::Object(value), json!({"name": "Wide", "btn_class": "active"}));
    }

    #[test]
    fn test_parse_positions() {
        let save = Intent::parse(r#"{"event":"save_pos","data":{"cam":0,"pos":5}}"#).unwrap();
        assert_eq!(save, Intent::SavePosition(PositionRef { camera: 0, slot: 5 }));

        let recall = Intent::parse(r#"{"event":"recall_pos","data":{"cam":2,"pos":0,"extra":true}}"#).unwrap();
        assert_eq!(recall, Intent::RecallPosition(PositionRef { camera: 2, slot: 0 }));
    }

    #[test]
    fn test_parse_fleet_commands() {
        assert_eq!(Intent::parse(r#"{"event":"power_on","data":null}"#).unwrap(), Intent::Power(true));
        assert_eq!(Intent::parse(r#"{"event":"power_off"}"#).unwrap(), Intent::Power(false));
        assert_eq!(Intent::parse(r#"{"event":"focus_lock","data":{}}"#).unwrap(), Intent::FocusLock(true));
        assert_eq!(Intent::parse(r#"{"event":"focus_unlock","data":{}}"#).unwrap(), Intent::FocusLock(false));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Intent::parse("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(Intent::parse(r#"{"data":{}}"#), Err(ProtocolError::Malformed(_))));
        assert_eq!(
            Intent::parse(r#"{"event":"clear_all","data":null}"#),
            Err(ProtocolError::UnknownEvent("clear_all".into()))
        );
        assert!(matches!(
            Intent::parse(r#"{"event":"save_pos","data":{"cam":-1,"pos":1}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
        assert!(matches!(
            Intent::parse(r#"{"event":"recall_pos","data":{"cam":0,"pos":300}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
        assert!(matches!(
            Intent::parse(r#"{"event":"update_button","data":{"name":"x"}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_event_names_match_parse() {
        for event in ["save_pos", "recall_pos", "update_button", "power_on", "focus_unlock"] {
            let raw = json!({"event": event, "data": {"cam": 0, "pos": 1}}).to_string();
            assert_eq!(Intent::parse(&raw).unwrap().event_name(), event);
        }
    }

    #[test]
    fn test_init_message_shape() {
        let mut button = ButtonValue::new();
        button.insert("name".into(), json!("Pulpit"));
        let msg = ServerMessage::Init(Snapshot {
            camera_addresses: vec!["10.0.0.5".into()],
            all_presets: vec![
                PresetRow { camera: 0, slot: 1, focus: Some(4660), button },
                PresetRow { camera: 0, slot: 2, focus: None, button: ButtonValue::new() },
            ],
            tally_states: vec![TallyStatus::Unknown],
        });

        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "init",
                "data": {
                    "camera_addresses": ["10.0.0.5"],
                    "all_presets": [
                        {"cam": 0, "pos": 1, "focus": 4660, "name": "Pulpit"},
                        {"cam": 0, "pos": 2}
                    ],
                    "tally_states": [-1]
                }
            })
        );
        assert_eq!(ServerMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_update_tally_shape() {
        let msg = ServerMessage::UpdateTally(vec![TallyStatus::Unknown, TallyStatus::Program, TallyStatus::Off]);
        assert_eq!(&*msg.encode().unwrap(), r#"{"event":"update_tally","data":[-1,2,0]}"#);
    }

    #[test]
    fn test_error_shape_omits_empty_fields() {
        let msg = ServerMessage::Error(IntentFailure {
            event: "power_on".into(),
            kind: "partial".into(),
            message: "1 of 3 cameras failed".into(),
            camera: None,
            slot: None,
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "error", "data": {"event": "power_on", "kind": "partial", "message": "1 of 3 cameras failed"}})
        );
    }
}
