//! Error codes and the `Status` error value.

use core::fmt;

/// RPC status codes.
///
/// Codes 0-99 align with gRPC for familiarity.
/// Codes 100+ are gangway-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    // gRPC-aligned (0-99)
    Ok = 0,
    Cancelled = 1,
    DeadlineExceeded = 2,
    InvalidArgument = 3,
    NotFound = 4,
    AlreadyExists = 5,
    PermissionDenied = 6,
    ResourceExhausted = 7,
    FailedPrecondition = 8,
    Aborted = 9,
    OutOfRange = 10,
    Unimplemented = 11,
    Internal = 12,
    Unavailable = 13,
    DataLoss = 14,

    // gangway-specific (100+)
    SessionClosed = 100,
    InputClosed = 101,
    StreamClosed = 102,
    PayloadTooLarge = 103,
    NotInitialized = 104,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::DeadlineExceeded),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::NotFound),
            5 => Some(Self::AlreadyExists),
            6 => Some(Self::PermissionDenied),
            7 => Some(Self::ResourceExhausted),
            8 => Some(Self::FailedPrecondition),
            9 => Some(Self::Aborted),
            10 => Some(Self::OutOfRange),
            11 => Some(Self::Unimplemented),
            12 => Some(Self::Internal),
            13 => Some(Self::Unavailable),
            14 => Some(Self::DataLoss),
            100 => Some(Self::SessionClosed),
            101 => Some(Self::InputClosed),
            102 => Some(Self::StreamClosed),
            103 => Some(Self::PayloadTooLarge),
            104 => Some(Self::NotInitialized),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::FailedPrecondition => write!(f, "failed precondition"),
            Self::Aborted => write!(f, "aborted"),
            Self::OutOfRange => write!(f, "out of range"),
            Self::Unimplemented => write!(f, "unimplemented"),
            Self::Internal => write!(f, "internal error"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::DataLoss => write!(f, "data loss"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::InputClosed => write!(f, "input closed"),
            Self::StreamClosed => write!(f, "stream closed"),
            Self::PayloadTooLarge => write!(f, "payload too large"),
            Self::NotInitialized => write!(f, "not initialized"),
        }
    }
}

/// The error value produced by sessions, handlers, and the FFI surface.
///
/// A `Status` is what crosses the C boundary (marshaled as [`StatusDetail`])
/// and what a handler returns to fail a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: ErrorCode,
    pub message: String,
}

impl Status {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotInitialized, message)
    }

    pub fn session_closed(session_id: i64) -> Self {
        Self::new(
            ErrorCode::SessionClosed,
            format!("stream session {session_id} is closed"),
        )
    }

    pub fn session_not_found(session_id: i64) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("stream session {session_id} not found"),
        )
    }

    pub fn input_closed(session_id: i64) -> Self {
        Self::new(
            ErrorCode::InputClosed,
            format!("stream session {session_id} input is closed"),
        )
    }

    pub fn payload_too_large(len: usize) -> Self {
        Self::new(
            ErrorCode::PayloadTooLarge,
            format!("payload of {len} bytes exceeds the C ABI limit"),
        )
    }

    /// Marshal into the wire form carried across the C boundary.
    pub fn to_detail(&self) -> StatusDetail {
        StatusDetail {
            code: self.code as u32 as i32,
            message: self.message.clone(),
        }
    }

    /// Recover a `Status` from its wire form. Unknown codes map to `Internal`.
    pub fn from_detail(detail: &StatusDetail) -> Self {
        let code = u32::try_from(detail.code)
            .ok()
            .and_then(ErrorCode::from_u32)
            .unwrap_or(ErrorCode::Internal);
        Self::new(code, detail.message.clone())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

/// Wire form of a [`Status`], prost-encoded wherever an error crosses the
/// C boundary (negative-length unary replies).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusDetail {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_roundtrip() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::Cancelled,
            ErrorCode::NotFound,
            ErrorCode::Internal,
            ErrorCode::SessionClosed,
            ErrorCode::InputClosed,
            ErrorCode::PayloadTooLarge,
            ErrorCode::NotInitialized,
        ] {
            assert_eq!(ErrorCode::from_u32(code as u32), Some(code));
        }
        assert_eq!(ErrorCode::from_u32(99), None);
    }

    #[test]
    fn status_detail_roundtrip() {
        let status = Status::session_closed(7);
        let detail = status.to_detail();
        assert_eq!(detail.code, ErrorCode::SessionClosed as u32 as i32);
        assert_eq!(Status::from_detail(&detail), status);
    }

    #[test]
    fn unknown_detail_code_maps_to_internal() {
        let detail = StatusDetail {
            code: -3,
            message: "bogus".into(),
        };
        assert_eq!(Status::from_detail(&detail).code, ErrorCode::Internal);
    }
}
