//! Control socket protocol
//!
//! Newline-delimited JSON in both directions, one object per line:
//!
//! ```text
//! -> {"Function":"start","Service":"web"}
//! <- {"Status":"okay"}
//! -> {"Function":"list"}
//! <- {"Status":"okay","Response":{"web":"active","db":"disabled"}}
//! -> {"Function":"stop","Service":"ghost"}
//! <- {"Status":"error","Error":"Please provide a valid Service."}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Lifecycle function named by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Disable,
    Enable,
    List,
    Reload,
    Restart,
    Start,
    Stop,
}

impl Function {
    pub const ALL: [Function; 7] = [
        Self::Disable,
        Self::Enable,
        Self::List,
        Self::Reload,
        Self::Restart,
        Self::Start,
        Self::Stop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Enable => "enable",
            Self::List => "list",
            Self::Reload => "reload",
            Self::Restart => "restart",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Function {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownFunction(s.to_string()))
    }
}

/// Request line from a client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(
        rename = "Function",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty"
    )]
    pub function: Option<String>,
    #[serde(
        rename = "Service",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty"
    )]
    pub service: Option<String>,
}

impl Request {
    pub fn new(function: Function, service: Option<&str>) -> Self {
        Self {
            function: Some(function.as_str().to_string()),
            service: service.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    /// Decode a request line.
    ///
    /// Anything that is not a request object decodes to a request without a
    /// function, which is then rejected like any other.
    pub fn parse(line: &str) -> Self {
        let decoded = serde_json::from_str::<Value>(line).and_then(|value| match value {
            Value::Object(_) => serde_json::from_value(value),
            other => Err(serde::de::Error::custom(format!(
                "expected an object, found {}",
                json_kind(&other)
            ))),
        });
        decoded.unwrap_or_else(|e| {
            log::debug!("Undecodable request {:?}: {}", line, e);
            Self::default()
        })
    }

    /// The requested function
    pub fn function(&self) -> Result<Function, ProtocolError> {
        self.function
            .as_deref()
            .ok_or(ProtocolError::MissingFunction)?
            .parse()
    }

    /// The named service, empty when absent
    pub fn service(&self) -> &str {
        self.service.as_deref().unwrap_or("")
    }

    /// Encode as one line, newline included
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        encode_line(self)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Okay,
    Error,
}

/// Response line to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "Response", default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Okay,
            response: None,
            error: None,
        }
    }

    pub fn ok_with(response: Value) -> Self {
        Self {
            status: Status::Okay,
            response: Some(response),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            response: None,
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Okay
    }

    /// Decode a response line
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim_end()).map_err(ProtocolError::Decode)
    }

    /// Encode as one line, newline included
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        encode_line(self)
    }
}

/// Serialize a value as a single JSON line
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(value).map_err(ProtocolError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Missing, null and empty strings all mean "not provided"
fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Please provide the Function.")]
    MissingFunction,

    #[error("Please provide a valid Function:  disable, enable, list, reload, restart, start, stop.")]
    UnknownFunction(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}
