//! Result codes shared by the command stream and the local layer.

/// Response codes returned by backend commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    /// Command argument data is invalid.
    InvalidArgument,
    /// Command request format is invalid.
    InvalidFormat,
    /// Command is not supported.
    NotSupported,
    /// A resource is unavailable or a limit was reached.
    NoResource,
    /// The first command must always be `core:register`.
    NotRegistered,
    /// The command requires a control flag that was not granted.
    NoControl,
    /// Communication inside the backend failed, usually because the target
    /// device disconnected before the command was executed.
    InternalCommError,
    /// The backend is not compatible with this client version.
    Incompatible,
    /// Unknown backend-internal failure.
    Internal,
    Unknown(i32),
}

impl ResponseCode {
    pub fn from_raw(raw: i32) -> ResponseCode {
        match raw {
            0 => ResponseCode::Ok,
            1 => ResponseCode::InvalidArgument,
            2 => ResponseCode::InvalidFormat,
            3 => ResponseCode::NotSupported,
            4 => ResponseCode::NoResource,
            5 => ResponseCode::NotRegistered,
            6 => ResponseCode::NoControl,
            7 => ResponseCode::InternalCommError,
            8 => ResponseCode::Incompatible,
            0xfff0 => ResponseCode::Internal,
            other => ResponseCode::Unknown(other),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            ResponseCode::Ok => 0,
            ResponseCode::InvalidArgument => 1,
            ResponseCode::InvalidFormat => 2,
            ResponseCode::NotSupported => 3,
            ResponseCode::NoResource => 4,
            ResponseCode::NotRegistered => 5,
            ResponseCode::NoControl => 6,
            ResponseCode::InternalCommError => 7,
            ResponseCode::Incompatible => 8,
            ResponseCode::Internal => 0xfff0,
            ResponseCode::Unknown(raw) => raw,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResponseCode::Ok => "ok",
            ResponseCode::InvalidArgument => "invalid_argument",
            ResponseCode::InvalidFormat => "invalid_format",
            ResponseCode::NotSupported => "not_supported",
            ResponseCode::NoResource => "no_resource",
            ResponseCode::NotRegistered => "not_registered",
            ResponseCode::NoControl => "no_control",
            ResponseCode::InternalCommError => "internal_comm_error",
            ResponseCode::Incompatible => "incompatible",
            ResponseCode::Internal => "internal",
            ResponseCode::Unknown(raw) => return write!(f, "unknown({raw})"),
        };
        f.write_str(name)
    }
}
