use crate::frame::WireErrorCode;
use crate::overlay::OverlayError;

/// Errors surfaced to the SP layer through the user-facing API.
///
/// Wire-level `ERROR` frames are mapped onto these when they terminate a user
///  operation; everything that stays internal to the engine travels as
///  `anyhow::Error` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ZtError {
    #[error("invalid transport address")]
    AddrInval,
    #[error("address in use")]
    AddrInUse,
    #[error("no free address in the requested range")]
    AddrRange,
    #[error("connection refused by peer")]
    ConnRefused,
    #[error("object is closed")]
    Closed,
    #[error("operation timed out")]
    TimedOut,
    #[error("message too large")]
    MsgSize,
    #[error("protocol error")]
    Proto,
    #[error("operation canceled")]
    Canceled,
    #[error("an operation of this kind is already pending")]
    Busy,
    #[error("internal error")]
    Internal,
    #[error("operation not supported")]
    NotSup,
    #[error("invalid argument")]
    Inval,
    #[error("transport error {0}")]
    Tran(u8),
}

impl ZtError {
    /// Mapping of a peer-sent error code to the error that fails the local
    ///  user operation (connect or read).
    pub(crate) fn from_wire(code: WireErrorCode) -> ZtError {
        match code {
            WireErrorCode::Refused => ZtError::ConnRefused,
            WireErrorCode::NotConn => ZtError::Closed,
            WireErrorCode::WrongSp => ZtError::Proto,
            WireErrorCode::Proto => ZtError::Proto,
            WireErrorCode::MsgSize => ZtError::MsgSize,
            WireErrorCode::Unknown => ZtError::Tran(WireErrorCode::Unknown.into()),
        }
    }

    /// Mapping of overlay library failures to user-visible errors. Fatal
    ///  overlay errors additionally close the node.
    pub(crate) fn from_overlay(e: OverlayError) -> ZtError {
        match e {
            OverlayError::OutOfMemory | OverlayError::DataStoreFailed | OverlayError::Internal => {
                ZtError::Internal
            }
            OverlayError::NetworkNotFound => ZtError::AddrInval,
            OverlayError::UnsupportedOperation => ZtError::NotSup,
            OverlayError::BadParameter => ZtError::Inval,
        }
    }
}

pub type ZtResult<T> = Result<T, ZtError>;
