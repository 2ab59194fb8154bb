use portrelay_core::Detail;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Body of a control request
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ControlRequest {
    /// Shared secret, must match the server's configured token
    #[serde(default)]
    pub token: Option<String>,
    /// Operation: details, start, stop, add/insert, remove/delete
    #[serde(default, rename = "type")]
    pub operation: Option<String>,
    /// Forwarder name (start, stop, add, remove)
    #[serde(default)]
    pub name: Option<String>,
    /// Local listen address, `host:port` or a bare port (add)
    #[serde(default)]
    pub local: Option<String>,
    /// Remote address, `host:port` or a bare port (add)
    #[serde(default)]
    pub remote: Option<String>,
}

/// Control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Details,
    Start,
    Stop,
    Add,
    Remove,
}

impl Operation {
    /// Parse an operation name; `insert` and `delete` are aliases.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "details" => Some(Self::Details),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "add" | "insert" => Some(Self::Add),
            "remove" | "delete" => Some(Self::Remove),
            _ => None,
        }
    }
}

/// One forwarder as reported by `details`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DetailRecord {
    pub name: String,
    pub local: String,
    pub remote: String,
    pub running: bool,
}

impl From<Detail> for DetailRecord {
    fn from(detail: Detail) -> Self {
        Self {
            name: detail.name,
            local: detail.local,
            remote: detail.remote,
            running: detail.running,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Registered forwarders
    pub forwarders: usize,
    /// Forwarders currently accepting connections
    pub running: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_aliases() {
        assert_eq!(Operation::parse("insert"), Some(Operation::Add));
        assert_eq!(Operation::parse("add"), Some(Operation::Add));
        assert_eq!(Operation::parse("delete"), Some(Operation::Remove));
        assert_eq!(Operation::parse("remove"), Some(Operation::Remove));
        assert_eq!(Operation::parse("details"), Some(Operation::Details));
        assert_eq!(Operation::parse("DETAILS"), None);
        assert_eq!(Operation::parse("restart"), None);
    }

    #[test]
    fn test_request_uses_type_field() {
        let request: ControlRequest = serde_json::from_str(
            r#"{"token":"t","type":"insert","name":"mysql","local":"3307","remote":"3306"}"#,
        )
        .unwrap();
        assert_eq!(request.operation.as_deref(), Some("insert"));
        assert_eq!(request.name.as_deref(), Some("mysql"));

        let sparse: ControlRequest = serde_json::from_str(r#"{"type":"details"}"#).unwrap();
        assert!(sparse.token.is_none());
        assert!(sparse.local.is_none());
    }
}
