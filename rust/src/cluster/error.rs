use super::Uid;

/// Codec failures. A frame that fails to decode is unusable and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: need {needed} bytes, have {remaining}")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("collection of {0} elements exceeds the decode limit")]
    CollectionTooLarge(usize),

    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("invalid {field} tag {value}")]
    InvalidTag { field: &'static str, value: u8 },
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),

    #[error("connect to {endpoint} timed out")]
    ConnectTimeout { endpoint: String },

    #[error("request to {endpoint} failed: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("unexpected response from {endpoint}")]
    UnexpectedResponse { endpoint: String },

    #[error("remote rejected request with code {0}")]
    Rejected(i32),

    #[error("uid {uid} exceeds bitmap capacity sized for {max_users} users")]
    BitmapOverflow { uid: Uid, max_users: u32 },

    #[error("compression failed: {0}")]
    Compression(std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("pipe closed")]
    PipeClosed,

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ClusterError>;
