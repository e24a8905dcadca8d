//! Server change notifications
//!
//! Published on the changes channel after every topology change. Delivery is
//! best-effort; routers use them only to check their cache sooner.

use crate::common::{timestamp_now_millis, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeAction {
    Add,
    Remove,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Add => write!(f, "ADD"),
            ChangeAction::Remove => write!(f, "REMOVE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerChangeEvent {
    pub action: ChangeAction,
    pub server: String,
    /// Unix milliseconds
    pub timestamp: i64,
    /// Router instance that made the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ServerChangeEvent {
    pub fn new(action: ChangeAction, server: &str, origin: &str) -> Self {
        Self {
            action,
            server: server.to_string(),
            timestamp: timestamp_now_millis(),
            origin: Some(origin.to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let event = ServerChangeEvent {
            action: ChangeAction::Add,
            server: "node3".into(),
            timestamp: 1_700_000_000_000,
            origin: None,
        };
        assert_eq!(
            event.to_json().unwrap(),
            r#"{"action":"ADD","server":"node3","timestamp":1700000000000}"#
        );
    }

    #[test]
    fn test_parse_without_origin() {
        let event =
            ServerChangeEvent::from_json(r#"{"action":"REMOVE","server":"n1","timestamp":5}"#)
                .unwrap();
        assert_eq!(event.action, ChangeAction::Remove);
        assert_eq!(event.origin, None);
        assert!(ServerChangeEvent::from_json("not json").is_err());
    }
}
