//! Structured audit events.
//!
//! Security-relevant events are serialized as JSON and emitted through the
//! tracing pipeline, so a SIEM can consume them from the same sink as the
//! regular log stream. Gated by the `audit_enabled` configuration flag at the
//! call sites.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{event, Level};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addr: String,
        root_dir: String,
    },

    ServerShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        mode: String,
        options: serde_json::Value,
    },

    RequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    PathTraversalAttempt {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        requested_path: String,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        blocks: u32,
        duration_ms: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
        block: u16,
    },

    SizeLimitExceeded {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        size: u64,
        max_allowed: u64,
    },

    UnknownTransferId {
        #[serde(flatten)]
        common: CommonFields,
        session_peer: String,
        stranger: String,
    },
}

/// Fields present in every audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    pub severity: String,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "kestrel-tftp".to_string(),
            severity: severity.to_string(),
        }
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let severity = self.common().severity.clone();
        let json = serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"error\": \"unserializable audit event: {:?}\"}}", self));

        match severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ServerShutdown { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::RequestDenied { common, .. }
            | AuditEvent::PathTraversalAttempt { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::SizeLimitExceeded { common, .. }
            | AuditEvent::UnknownTransferId { common, .. } => common,
        }
    }
}

/// Facade used by the dispatcher and sessions.
pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addr: &str, root_dir: &str) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
        }
        .log();
    }

    pub fn server_shutdown(reason: &str) {
        AuditEvent::ServerShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn read_request(client_addr: SocketAddr, filename: &str, mode: &str, options: serde_json::Value) {
        AuditEvent::ReadRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn write_request(client_addr: SocketAddr, filename: &str, mode: &str, options: serde_json::Value) {
        AuditEvent::WriteRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            mode: mode.to_string(),
            options,
        }
        .log();
    }

    pub fn request_denied(client_addr: SocketAddr, filename: &str, reason: &str) {
        AuditEvent::RequestDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn path_traversal_attempt(client_addr: SocketAddr, requested_path: &str) {
        AuditEvent::PathTraversalAttempt {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            requested_path: requested_path.to_string(),
        }
        .log();
    }

    pub fn transfer_completed(
        client_addr: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        blocks: u32,
        duration_ms: u64,
    ) {
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            blocks,
            duration_ms,
        }
        .log();
    }

    pub fn transfer_failed(client_addr: SocketAddr, filename: &str, error: &str, block: u16) {
        AuditEvent::TransferFailed {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
            block,
        }
        .log();
    }

    pub fn size_limit_exceeded(client_addr: SocketAddr, filename: &str, size: u64, max_allowed: u64) {
        AuditEvent::SizeLimitExceeded {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            size,
            max_allowed,
        }
        .log();
    }

    pub fn unknown_transfer_id(session_peer: SocketAddr, stranger: SocketAddr) {
        AuditEvent::UnknownTransferId {
            common: CommonFields::new("warn"),
            session_peer: session_peer.to_string(),
            stranger: stranger.to_string(),
        }
        .log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tagged_type() {
        let event = AuditEvent::RequestDenied {
            common: CommonFields::new("warn"),
            client_addr: "127.0.0.1:4242".to_string(),
            filename: "../etc/passwd".to_string(),
            reason: "path traversal".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "request_denied");
        assert_eq!(json["severity"], "warn");
        assert_eq!(json["filename"], "../etc/passwd");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn events_round_trip_through_json() {
        let event = AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: "10.0.0.9:1069".to_string(),
            filename: "fw.bin".to_string(),
            bytes_transferred: 1026,
            blocks: 3,
            duration_ms: 12,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            AuditEvent::TransferCompleted {
                bytes_transferred, blocks, ..
            } => {
                assert_eq!(bytes_transferred, 1026);
                assert_eq!(blocks, 3);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
