//! OCPP-J 1.6 wire framing: `[2,msgId,action,payload]` / `[3,msgId,payload]`
//! / `[4,msgId,errorCode,errorDescription,errorDetails]`. The adapter and
//! transport modules build on these types; the state machine never sees raw
//! JSON.

pub mod adapter;
pub mod messages;
pub mod transport;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: serde_json::Value,
}

/// A decoded frame of unknown kind, as read off the wire before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Serialize for Call {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(4))?;
        seq.serialize_element(&(MessageType::Call as u8))?;
        seq.serialize_element(&self.message_id)?;
        seq.serialize_element(&self.action)?;
        seq.serialize_element(&self.payload)?;
        seq.end()
    }
}

impl Serialize for CallResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&(MessageType::CallResult as u8))?;
        seq.serialize_element(&self.message_id)?;
        seq.serialize_element(&self.payload)?;
        seq.end()
    }
}

impl Serialize for CallError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(5))?;
        seq.serialize_element(&(MessageType::CallError as u8))?;
        seq.serialize_element(&self.message_id)?;
        seq.serialize_element(&self.error_code.to_string())?;
        seq.serialize_element(&self.error_description)?;
        seq.serialize_element(&self.error_details)?;
        seq.end()
    }
}

struct FrameVisitor;

impl<'de> Visitor<'de> for FrameVisitor {
    type Value = Frame;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an OCPP-J frame array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Frame, A::Error> {
        let type_id: u8 = seq
            .next_element()?
            .ok_or_else(|| de::Error::custom("missing message type id"))?;
        let message_id: String = seq
            .next_element()?
            .ok_or_else(|| de::Error::custom("missing message id"))?;
        match type_id {
            2 => {
                let action: String = seq.next_element()?.ok_or_else(|| de::Error::custom("missing action"))?;
                let payload: serde_json::Value =
                    seq.next_element()?.ok_or_else(|| de::Error::custom("missing payload"))?;
                Ok(Frame::Call(Call { message_id, action, payload }))
            }
            3 => {
                let payload: serde_json::Value =
                    seq.next_element()?.ok_or_else(|| de::Error::custom("missing payload"))?;
                Ok(Frame::CallResult(CallResult { message_id, payload }))
            }
            4 => {
                let error_code: String =
                    seq.next_element()?.ok_or_else(|| de::Error::custom("missing error code"))?;
                let error_description: String =
                    seq.next_element()?.ok_or_else(|| de::Error::custom("missing error description"))?;
                let error_details: serde_json::Value = seq.next_element()?.unwrap_or(serde_json::Value::Null);
                Ok(Frame::CallError(CallError {
                    message_id,
                    error_code: error_code.parse().unwrap_or(ErrorCode::GenericError),
                    error_description,
                    error_details,
                }))
            }
            other => Err(de::Error::custom(format!("unknown message type id {other}"))),
        }
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Frame, D::Error> {
        deserializer.deserialize_seq(FrameVisitor)
    }
}

/// OCPP-J error codes (Appendix of the spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NotImplemented" => Self::NotImplemented,
            "NotSupported" => Self::NotSupported,
            "InternalError" => Self::InternalError,
            "ProtocolError" => Self::ProtocolError,
            "SecurityError" => Self::SecurityError,
            "FormationViolation" => Self::FormationViolation,
            "PropertyConstraintViolation" => Self::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" => Self::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => Self::TypeConstraintViolation,
            _ => Self::GenericError,
        })
    }
}
