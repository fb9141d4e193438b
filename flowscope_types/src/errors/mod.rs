use std::fmt::{Debug, Display, Formatter};

/// The default error type for this crate
#[derive(Debug)]
pub enum Error {
    /// A byte did not map onto any variant of the named enum
    InvalidValue { kind: &'static str, value: u64 },
    /// A configuration document could not be parsed or failed validation
    InvalidConfig(String),
    /// For generic error types
    Generic(&'static str),
    /// For message types requiring heap
    Other(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidValue { kind, value } => write!(f, "Invalid {kind} value: {value:#x}"),
            Error::InvalidConfig(err) => write!(f, "Invalid configuration: {err}"),
            Error::Generic(err) => write!(f, "{err}"),
            Error::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}
