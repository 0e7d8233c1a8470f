use duocall_proto::RequestParseError;
use thiserror::Error;

/// Request-level errors, reported back to the requester as an error event
/// carrying a numeric code and a cause string. They never reach the peer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("No message")]
    NoMessage,

    #[error("JSON error: not an object")]
    InvalidJson,

    #[error("Unknown request ({0})")]
    UnknownRequest(String),

    #[error("Register a username first")]
    RegisterFirst,

    #[error("Invalid element ({0})")]
    InvalidElement(String),

    #[error("Missing element ({0})")]
    MissingElement(String),

    #[error("Username '{0}' is already taken")]
    UsernameTaken(String),

    #[error("Already logged in ({0})")]
    AlreadyRegistered(String),

    #[error("Username '{0}' doesn't exist")]
    NoSuchUsername(String),

    #[error("You can't call yourself")]
    SelfCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("{0}")]
    NoCall(&'static str),

    #[error("Missing SDP")]
    MissingSdp,

    #[error("Missing parameters (videocall, record)")]
    MissingCallMetadata,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Username '{0}' is not authorized")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric wire code carried on the error event.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::NoMessage => 470,
            Self::InvalidJson => 471,
            Self::UnknownRequest(_) => 472,
            Self::RegisterFirst => 473,
            Self::InvalidElement(_) => 474,
            Self::MissingElement(_) => 475,
            Self::UsernameTaken(_) => 476,
            Self::AlreadyRegistered(_) => 477,
            Self::NoSuchUsername(_) => 478,
            Self::SelfCall => 479,
            Self::AlreadyInCall => 480,
            Self::NoCall(_) => 481,
            Self::MissingSdp => 482,
            Self::MissingCallMetadata | Self::InvalidSdp(_) => 483,
            Self::Unauthorized(_) => 484,
            Self::Internal(_) => 499,
        }
    }
}

impl From<RequestParseError> for Error {
    fn from(err: RequestParseError) -> Self {
        match err {
            RequestParseError::NotAnObject => Self::InvalidJson,
            RequestParseError::MissingRequest => Self::MissingElement("request".to_string()),
            RequestParseError::UnknownRequest(name) => Self::UnknownRequest(name),
            RequestParseError::MissingField(field) => Self::MissingElement(field.to_string()),
            RequestParseError::InvalidField(field) => Self::InvalidElement(field.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
