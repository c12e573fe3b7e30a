// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Error taxonomy (spec §6.3/§7): every fallible operation is classified
//! into a stable string code at the point it is first observed, and the
//! classification propagates upward into `ReconnectState::last_error_code`.

use thiserror::Error;

/// Stable string codes from the error taxonomy. These are what the status
/// store, the HTTP surface, and `last_error` ever expose — never a raw
/// `CoreError` Display string, which may still contain unmasked detail
/// before `mask::scrub` has run over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthFailed,
    InvalidPath,
    NetworkUnreachable,
    InvalidStream,
    ConnectFailed,
    ReadTimeout,
    NoVideoStream,
    DecoderMissing,
    InvalidSpec,
    AlreadyExists,
    PreviewDisabled,
    BreakerOpen,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::NetworkUnreachable => "NETWORK_UNREACHABLE",
            ErrorCode::InvalidStream => "INVALID_STREAM",
            ErrorCode::ConnectFailed => "CONNECT_FAILED",
            ErrorCode::ReadTimeout => "READ_TIMEOUT",
            ErrorCode::NoVideoStream => "NO_VIDEO_STREAM",
            ErrorCode::DecoderMissing => "DECODER_MISSING",
            ErrorCode::InvalidSpec => "INVALID_SPEC",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PreviewDisabled => "PREVIEW_DISABLED",
            ErrorCode::BreakerOpen => "BREAKER_OPEN",
        }
    }

    /// Persistent-config codes open the breaker sooner (spec §7) — the
    /// camera hardware may still recover, so we keep retrying, but we
    /// stop assuming a transient blip.
    pub fn is_persistent_config(self) -> bool {
        matches!(
            self,
            ErrorCode::AuthFailed
                | ErrorCode::InvalidPath
                | ErrorCode::InvalidStream
                | ErrorCode::InvalidSpec
                | ErrorCode::DecoderMissing
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{code}: {reason}")]
    Classified { code: ErrorCode, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("camera '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("camera '{id}' not found")]
    NotFound { id: String },

    #[error("preview disabled for camera '{id}'")]
    PreviewDisabled { id: String },

    #[error("reconnect breaker open for camera '{id}'")]
    BreakerOpen { id: String },

    #[error("decoder error: {0}")]
    Decoder(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn classified(code: ErrorCode, reason: impl Into<String>) -> Self {
        CoreError::Classified {
            code,
            reason: reason.into(),
        }
    }

    /// Best-effort mapping to a taxonomy code, used anywhere a `CoreError`
    /// needs to be surfaced as `last_error` without going through the
    /// ReconnectController's own classification path.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::Classified { code, .. } => *code,
            CoreError::Config(_) => ErrorCode::InvalidSpec,
            CoreError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            CoreError::NotFound { .. } => ErrorCode::InvalidSpec,
            CoreError::PreviewDisabled { .. } => ErrorCode::PreviewDisabled,
            CoreError::BreakerOpen { .. } => ErrorCode::BreakerOpen,
            CoreError::Decoder(_) => ErrorCode::ConnectFailed,
            CoreError::Io(_) => ErrorCode::ConnectFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
