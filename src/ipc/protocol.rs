//! IPC protocol definitions for the control socket
//!
//! Newline-delimited JSON. Every message carries a `kind` tag; field names
//! are camelCase. Response bodies travel base64-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentResponse, FetchOutcome, ResponseSource, StatusReport};

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Default socket path for IPC communication
pub const SOCKET_PATH: &str = "/tmp/offline-cache.sock";

fn default_method() -> String {
    "GET".to_string()
}

/// Commands sent by local clients to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Command {
    /// Route a request through the controlling agent
    #[serde(rename_all = "camelCase")]
    Fetch {
        #[serde(default = "default_method")]
        method: String,
        /// Absolute request URL
        url: String,
    },
    /// Activate the waiting agent without waiting
    ForceActivate,
    /// Report generations and manifest sizes
    StatusQuery,
    /// Probe for a new deployment
    CheckForUpdate {
        /// Ignore the cooldown
        #[serde(default)]
        force: bool,
    },
    /// Delete every owned generation
    ClearCache,
}

/// Replies sent by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Reply {
    /// Answer produced by the agent
    #[serde(rename_all = "camelCase")]
    Response {
        status: u16,
        content_type: Option<String>,
        /// Base64-encoded body
        body: String,
        source: ResponseSource,
    },
    /// Not handled by the agent; the client should use the network
    Passthrough,
    /// Origin unreachable and nothing stored
    Unavailable { reason: String },
    #[serde(rename_all = "camelCase")]
    Status {
        generations: Vec<String>,
        static_count: usize,
        audio_count: usize,
    },
    /// No agent controls requests yet
    NotReady,
    Success { message: Option<String> },
    Error { error: String },
}

impl Reply {
    pub fn from_outcome(outcome: FetchOutcome) -> Self {
        match outcome {
            FetchOutcome::Passthrough => Reply::Passthrough,
            FetchOutcome::Unavailable(reason) => Reply::Unavailable { reason },
            FetchOutcome::Response(AgentResponse {
                status,
                content_type,
                body,
                source,
            }) => Reply::Response {
                status,
                content_type,
                body: BASE64.encode(&body),
                source,
            },
        }
    }

    pub fn from_status(report: StatusReport) -> Self {
        Reply::Status {
            generations: report.generations,
            static_count: report.static_count,
            audio_count: report.audio_count,
        }
    }

    /// Decode the body of a `Response` reply
    pub fn decoded_body(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        match self {
            Reply::Response { body, .. } => Some(BASE64.decode(body)),
            _ => None,
        }
    }
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Parse a JSON reply from bytes
pub fn parse_reply(data: &[u8]) -> Result<Reply, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a command to newline-terminated JSON bytes
pub fn serialize_command(command: &Command) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(command)?;
    json.push(b'\n');
    Ok(json)
}

/// Serialize a reply to newline-terminated JSON bytes
pub fn serialize_reply(reply: &Reply) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(reply)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_parse_fetch_command_defaults_to_get() {
        let json = r#"{"kind":"fetch","url":"http://localhost:8080/audio/a.mp3"}"#;
        match parse_command(json.as_bytes()).unwrap() {
            Command::Fetch { method, url } => {
                assert_eq!(method, "GET");
                assert_eq!(url, "http://localhost:8080/audio/a.mp3");
            }
            other => panic!("Expected Fetch command, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unit_commands() {
        let cases = [
            (r#"{"kind":"force-activate"}"#, Command::ForceActivate),
            (r#"{"kind":"status-query"}"#, Command::StatusQuery),
            (
                r#"{"kind":"check-for-update"}"#,
                Command::CheckForUpdate { force: false },
            ),
            (
                r#"{"kind":"check-for-update","force":true}"#,
                Command::CheckForUpdate { force: true },
            ),
            (r#"{"kind":"clear-cache"}"#, Command::ClearCache),
        ];
        for (json, expected) in cases {
            assert_eq!(parse_command(json.as_bytes()).unwrap(), expected);
        }
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(parse_command(br#"{"kind":"mount"}"#).is_err());
    }

    #[test]
    fn test_response_reply_shape() {
        let reply = Reply::from_outcome(FetchOutcome::Response(AgentResponse {
            status: 200,
            content_type: Some("audio/mpeg".into()),
            body: Bytes::from_static(b"mp3"),
            source: ResponseSource::Store,
        }));
        let json = serialize_reply(&reply).unwrap();
        assert_eq!(json.last(), Some(&b'\n'));

        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["kind"], "response");
        assert_eq!(value["contentType"], "audio/mpeg");
        assert_eq!(value["body"], "bXAz");
        assert_eq!(value["source"], "store");

        let parsed = parse_reply(&json).unwrap();
        assert_eq!(parsed.decoded_body().unwrap().unwrap(), b"mp3");
    }

    #[test]
    fn test_status_reply_shape() {
        let reply = Reply::from_status(StatusReport {
            generations: vec!["offline-cache-static-v1".into()],
            static_count: 3,
            audio_count: 7,
        });
        let value: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["kind"], "status");
        assert_eq!(value["staticCount"], 3);
        assert_eq!(value["audioCount"], 7);
        assert_eq!(value["generations"][0], "offline-cache-static-v1");
    }

    #[test]
    fn test_unit_reply_shapes() {
        assert_eq!(
            serde_json::to_string(&Reply::NotReady).unwrap(),
            r#"{"kind":"not-ready"}"#
        );
        assert_eq!(
            serde_json::to_string(&Reply::from_outcome(FetchOutcome::Unavailable("offline".into())))
                .unwrap(),
            r#"{"kind":"unavailable","reason":"offline"}"#
        );
    }
}
