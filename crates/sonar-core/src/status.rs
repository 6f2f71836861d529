//! Delivery status normalization.
//!
//! Connections report the progress of an action either as a numeric code or
//! as a symbolic name, depending on which event stream carried it. Both forms
//! collapse onto [`AckLevel`], a closed ordinal scale. Anything unrecognized
//! becomes [`AckLevel::Unknown`] instead of an error, so a future status value
//! is observed as "no progress" rather than aborting a probe.

use serde::{Deserialize, Serialize};

/// A status value as delivered by the connection, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawStatus {
    Code(i64),
    Name(String),
}

impl RawStatus {
    /// Normalize onto the ordinal scale.
    pub fn level(&self) -> AckLevel {
        match self {
            Self::Code(code) => AckLevel::from_code(*code),
            Self::Name(name) => AckLevel::from_name(name),
        }
    }
}

impl From<i64> for RawStatus {
    fn from(code: i64) -> Self {
        Self::Code(code)
    }
}

impl From<&str> for RawStatus {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// How far an action has progressed toward its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckLevel {
    Unknown = 0,
    Sent = 1,
    /// The network backend accepted the action.
    ServerAck = 2,
    /// The recipient device processed the action.
    Delivered = 3,
    Read = 4,
}

impl AckLevel {
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Map a numeric status code. Code 5 ("played") implies the action was read.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Sent,
            2 => Self::ServerAck,
            3 => Self::Delivered,
            4 | 5 => Self::Read,
            _ => Self::Unknown,
        }
    }

    /// Map a symbolic status name (case-insensitive). Numeric strings are
    /// treated as codes.
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        if let Ok(code) = name.parse::<i64>() {
            return Self::from_code(code);
        }
        match name.to_ascii_uppercase().as_str() {
            "PENDING" => Self::Sent,
            "SERVER_ACK" => Self::ServerAck,
            "DELIVERY_ACK" => Self::Delivered,
            "READ" | "PLAYED" => Self::Read,
            _ => Self::Unknown,
        }
    }

    /// True once the network backend has accepted the action.
    pub fn is_server_acked(self) -> bool {
        self >= Self::ServerAck
    }

    /// True once the target device itself has acknowledged the action.
    pub fn is_client_acked(self) -> bool {
        self >= Self::Delivered
    }
}
