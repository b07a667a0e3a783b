//! Wire frames
//!
//! Client and server messages are JSON arrays whose first element is an
//! uppercase tag string: `["EVENT", ...]`, `["REQ", ...]` and so on.
//! Parsing is strict: a non-JSON or non-array frame, an unknown tag, or
//! a frame with the wrong shape is rejected.

use crate::event::Event;
use crate::filter::Filter;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed: frame")]
    Malformed,

    #[error("invalid: bad event")]
    BadEvent,

    #[error("invalid: bad filter")]
    BadFilter,
}

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// ["EVENT", event]
    Event(Box<Event>),
    /// ["REQ", sub_id, filter...]
    Req {
        sub_id: String,
        filters: Vec<Filter>,
    },
    /// ["CLOSE", sub_id]
    Close { sub_id: String },
    /// ["COUNT", sub_id, filter...]
    Count {
        sub_id: String,
        filters: Vec<Filter>,
    },
    /// ["AUTH", event]
    Auth(Box<Event>),
    /// ["NEG-OPEN", sub_id, filter, initial_message_hex]
    NegOpen {
        sub_id: String,
        filter: Box<Filter>,
        initial_message: String,
    },
    /// ["NEG-MSG", sub_id, message_hex]
    NegMsg { sub_id: String, message: String },
    /// ["NEG-CLOSE", sub_id]
    NegClose { sub_id: String },
}

/// Parse a text frame from a client.
pub fn parse_client_frame(text: &str) -> Result<ClientFrame, WireError> {
    let value: Value = serde_json::from_str(text).map_err(|_| WireError::Malformed)?;
    parse_client_value(&value)
}

/// Parse an already-deserialized client frame.
pub fn parse_client_value(value: &Value) -> Result<ClientFrame, WireError> {
    let array = value.as_array().ok_or(WireError::Malformed)?;
    let tag = array
        .first()
        .and_then(|v| v.as_str())
        .ok_or(WireError::Malformed)?;

    match tag {
        "EVENT" => {
            let ev = array.get(1).ok_or(WireError::Malformed)?;
            let event: Event =
                serde_json::from_value(ev.clone()).map_err(|_| WireError::BadEvent)?;
            Ok(ClientFrame::Event(Box::new(event)))
        }
        "AUTH" => {
            let ev = array.get(1).ok_or(WireError::Malformed)?;
            let event: Event =
                serde_json::from_value(ev.clone()).map_err(|_| WireError::BadEvent)?;
            Ok(ClientFrame::Auth(Box::new(event)))
        }
        "REQ" | "COUNT" => {
            let sub_id = subscription_id(array.get(1))?;
            let mut filters = Vec::with_capacity(array.len().saturating_sub(2));
            for raw in &array[2..] {
                let filter: Filter =
                    serde_json::from_value(raw.clone()).map_err(|_| WireError::BadFilter)?;
                filter.validate().map_err(|_| WireError::BadFilter)?;
                filters.push(filter);
            }
            if filters.is_empty() {
                return Err(WireError::BadFilter);
            }
            if tag == "REQ" {
                Ok(ClientFrame::Req { sub_id, filters })
            } else {
                Ok(ClientFrame::Count { sub_id, filters })
            }
        }
        "CLOSE" => {
            let sub_id = subscription_id(array.get(1))?;
            Ok(ClientFrame::Close { sub_id })
        }
        "NEG-OPEN" => {
            let sub_id = subscription_id(array.get(1))?;
            let raw = array.get(2).ok_or(WireError::Malformed)?;
            let filter: Filter =
                serde_json::from_value(raw.clone()).map_err(|_| WireError::BadFilter)?;
            filter.validate().map_err(|_| WireError::BadFilter)?;
            let initial_message = array
                .get(3)
                .and_then(|v| v.as_str())
                .ok_or(WireError::Malformed)?
                .to_string();
            Ok(ClientFrame::NegOpen {
                sub_id,
                filter: Box::new(filter),
                initial_message,
            })
        }
        "NEG-MSG" => {
            let sub_id = subscription_id(array.get(1))?;
            let message = array
                .get(2)
                .and_then(|v| v.as_str())
                .ok_or(WireError::Malformed)?
                .to_string();
            Ok(ClientFrame::NegMsg { sub_id, message })
        }
        "NEG-CLOSE" => {
            let sub_id = subscription_id(array.get(1))?;
            Ok(ClientFrame::NegClose { sub_id })
        }
        _ => Err(WireError::Malformed),
    }
}

fn subscription_id(value: Option<&Value>) -> Result<String, WireError> {
    let s = value.and_then(|v| v.as_str()).ok_or(WireError::Malformed)?;
    if s.is_empty() || s.len() > 64 {
        return Err(WireError::Malformed);
    }
    Ok(s.to_string())
}

// Outgoing frame builders. These return serde_json Values so callers can
// serialize once at the socket boundary.

pub fn ok_frame(event_id: &str, accepted: bool, reason: &str) -> Value {
    json!(["OK", event_id, accepted, reason])
}

pub fn event_frame(sub_id: &str, event: &Event) -> Value {
    json!(["EVENT", sub_id, event])
}

pub fn eose_frame(sub_id: &str) -> Value {
    json!(["EOSE", sub_id])
}

pub fn closed_frame(sub_id: &str, reason: &str) -> Value {
    json!(["CLOSED", sub_id, reason])
}

pub fn notice_frame(message: &str) -> Value {
    json!(["NOTICE", message])
}

pub fn auth_frame(challenge: &str) -> Value {
    json!(["AUTH", challenge])
}

pub fn count_frame(sub_id: &str, count: u64) -> Value {
    json!(["COUNT", sub_id, {"count": count}])
}

pub fn neg_msg_frame(sub_id: &str, message_hex: &str) -> Value {
    json!(["NEG-MSG", sub_id, message_hex])
}

pub fn neg_err_frame(sub_id: &str, reason: &str) -> Value {
    json!(["NEG-ERR", sub_id, reason])
}
