//! Client-side error taxonomy and session states.

use servolink_wire::ResponseCode;

/// Errors surfaced by the client runtime.
///
/// The transient variants (`AlreadyOpen`, `Busy`, `CannotConnect`,
/// `Timeout`) are worth retrying; the rest are not. Wire-level command
/// failures keep their own [`ResponseCode`] and are only mapped into this
/// taxonomy where the names overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A session is already open on this `ApiCore`.
    AlreadyOpen,
    /// The backend is mid-transition; retry shortly.
    Busy,
    /// The backend or one of its regions/sockets is unreachable.
    CannotConnect,
    /// A deadline expired before the operation completed.
    Timeout,

    /// Version mismatch between client and backend.
    Incompatible,
    /// Malformed shared-memory or wire data.
    Protocol,
    /// Caller-supplied argument is invalid.
    InvalidArgument,
    /// Operation is not valid for the current session state.
    InvalidState,
    /// Operation requires control that was not requested or granted.
    NoControl,

    /// The public-key offer's signature does not verify.
    SignatureVerification,
    /// A public key has the wrong length or form.
    InvalidPublicKey,
    /// A private key has the wrong length or form.
    InvalidPrivateKey,
    /// The requested security method is not supported.
    NotSupported,
}

impl Error {
    /// True for errors that may clear on retry.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Error::AlreadyOpen | Error::Busy | Error::CannotConnect | Error::Timeout
        )
    }

    /// Map a wire response code onto the local taxonomy where names
    /// overlap; everything else collapses to `Protocol`.
    pub fn from_response_code(code: ResponseCode) -> Error {
        match code {
            ResponseCode::InvalidArgument => Error::InvalidArgument,
            ResponseCode::NotSupported => Error::NotSupported,
            ResponseCode::NoControl => Error::NoControl,
            ResponseCode::Incompatible => Error::Incompatible,
            _ => Error::Protocol,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Error::AlreadyOpen => "a session is already open",
            Error::Busy => "backend is busy, retry later",
            Error::CannotConnect => "cannot connect to backend",
            Error::Timeout => "operation timed out",
            Error::Incompatible => "incompatible backend version",
            Error::Protocol => "malformed shared memory or wire data",
            Error::InvalidArgument => "invalid argument",
            Error::InvalidState => "operation not valid in current session state",
            Error::NoControl => "not registered for control",
            Error::SignatureVerification => "public key signature verification failed",
            Error::InvalidPublicKey => "invalid public key",
            Error::InvalidPrivateKey => "invalid private key",
            Error::NotSupported => "not supported",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Closed or never opened.
    Invalid,
    /// Attached to the backend's shared memory, read-only.
    ConnectedMonitor,
    /// Registered as a controller over the command stream.
    ConnectedControl,
    /// The backend went away; reopen to continue.
    SessionLost,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Invalid => "invalid",
            SessionState::ConnectedMonitor => "connected_monitor",
            SessionState::ConnectedControl => "connected_control",
            SessionState::SessionLost => "session_lost",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Busy.is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(!Error::Protocol.is_transient());
        assert!(!Error::NoControl.is_transient());
    }

    #[test]
    fn response_code_mapping_keeps_shared_names() {
        assert_eq!(
            Error::from_response_code(ResponseCode::NoControl),
            Error::NoControl
        );
        assert_eq!(
            Error::from_response_code(ResponseCode::Internal),
            Error::Protocol
        );
    }
}
