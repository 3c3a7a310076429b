use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("malformed key id {0:?} (expected \"<algorithm>:<id>\")")]
    MalformedKeyId(String),
}
