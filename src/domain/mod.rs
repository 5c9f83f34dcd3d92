use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Anonymous caller record. Rows are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Identity {
    pub id: i64,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub source_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub token: String,
    pub user_agent: Option<String>,
    pub source_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The row a stored header belongs to. A header has exactly one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderOwner {
    Request(i64),
    Replay(i64),
}

impl HeaderOwner {
    pub const fn request_id(self) -> Option<i64> {
        match self {
            Self::Request(id) => Some(id),
            Self::Replay(_) => None,
        }
    }

    pub const fn replay_id(self) -> Option<i64> {
        match self {
            Self::Request(_) => None,
            Self::Replay(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapturedRequest {
    pub id: i64,
    #[serde(skip_serializing)]
    pub owner_token: String,
    pub method: String,
    pub target_url: String,
    #[serde(serialize_with = "body_as_text")]
    pub body: Vec<u8>,
    pub headers: Vec<Header>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCapturedRequest {
    pub owner_token: String,
    pub method: String,
    pub target_url: String,
    pub body: Vec<u8>,
    pub headers: Vec<Header>,
}

/// How a replay attempt ended. A replay either got an HTTP response or
/// failed in transport, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ReplayOutcome {
    Completed {
        status_code: u16,
        #[serde(serialize_with = "body_as_text")]
        response_body: Vec<u8>,
        response_headers: Vec<Header>,
    },
    Failed {
        error_message: String,
    },
}

impl ReplayOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn response_headers(&self) -> &[Header] {
        match self {
            Self::Completed {
                response_headers, ..
            } => response_headers,
            Self::Failed { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Replay {
    pub id: i64,
    pub request_id: i64,
    pub destination: String,
    #[serde(flatten)]
    pub outcome: ReplayOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReplay {
    pub request_id: i64,
    pub destination: String,
    pub outcome: ReplayOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestWithReplays {
    #[serde(flatten)]
    pub request: CapturedRequest,
    pub replays: Vec<Replay>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub request_id: i64,
    #[serde(alias = "endpoint", default)]
    pub destination: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub replay_id: i64,
}

#[derive(Debug, Serialize)]
pub struct CaptureResponse {
    pub created_id: i64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub ident: String,
}

fn body_as_text<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_owner_binds_exactly_one_column() {
        assert_eq!(HeaderOwner::Request(7).request_id(), Some(7));
        assert_eq!(HeaderOwner::Request(7).replay_id(), None);
        assert_eq!(HeaderOwner::Replay(9).request_id(), None);
        assert_eq!(HeaderOwner::Replay(9).replay_id(), Some(9));
    }

    #[test]
    fn failed_replay_serializes_without_response_fields() {
        let replay = Replay {
            id: 3,
            request_id: 1,
            destination: "http://example.test/y".to_owned(),
            outcome: ReplayOutcome::Failed {
                error_message: "connection refused".to_owned(),
            },
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };

        let value = serde_json::to_value(&replay).unwrap();
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["error_message"], "connection refused");
        assert!(value.get("status_code").is_none());
        assert!(value.get("response_body").is_none());
    }

    #[test]
    fn completed_replay_renders_binary_body_as_text() {
        let outcome = ReplayOutcome::Completed {
            status_code: 200,
            response_body: b"bin\0ary\xff".to_vec(),
            response_headers: Vec::new(),
        };

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["outcome"], "completed");
        assert_eq!(value["response_body"], "bin\u{0}ary\u{fffd}");
    }

    #[test]
    fn captured_request_hides_owner_and_renders_body_as_text() {
        let request = CapturedRequest {
            id: 1,
            owner_token: "secret".to_owned(),
            method: "POST".to_owned(),
            target_url: "/create/abc/x".to_owned(),
            body: br#"{"a":1}"#.to_vec(),
            headers: vec![Header::new("Foo", "bar")],
            received_at: Utc::now(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("owner_token").is_none());
        assert_eq!(value["body"], r#"{"a":1}"#);
        assert_eq!(value["headers"], json!([{"key": "Foo", "value": "bar"}]));
    }

    #[test]
    fn replay_request_accepts_endpoint_alias() {
        let parsed: ReplayRequest =
            serde_json::from_value(json!({"request_id": 4, "endpoint": "https://x.test"})).unwrap();
        assert_eq!(parsed.request_id, 4);
        assert_eq!(parsed.destination, "https://x.test");
    }
}
