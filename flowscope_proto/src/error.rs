use flowscope_types::prelude::{ExpertGroup, ProtocolId};
use flowscope_wire::FramingError;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};

/// The basic error type for this crate. None of these escape a packet: the session turns them
/// into expert records on the offending packet
pub enum DissectError {
    /// The framer refused the bytes
    Framing(FramingError),
    /// A field extends past the end of the captured bytes
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    /// A bad packet
    InvalidPacket(&'static str),
    /// A conversation already owns state for this protocol
    StateAlreadyExists(ProtocolId),
    /// An index into a fixed-capacity structure was out of range
    CapacityExceeded {
        what: &'static str,
        index: usize,
        capacity: usize,
    },
    /// Something was referenced before it was allocated
    NotAllocated(&'static str),
    /// For a converted error
    Generic(String),
}

impl Error for DissectError {}

impl Debug for DissectError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_msg())
    }
}

impl DissectError {
    fn to_msg(&self) -> String {
        match self {
            DissectError::Framing(err) => err.to_string(),
            DissectError::Truncated {
                offset,
                needed,
                available,
            } => {
                format!("Field at offset {offset} needs {needed} bytes, but only {available} were captured")
            }
            DissectError::InvalidPacket(err) => (*err).to_string(),
            DissectError::StateAlreadyExists(protocol) => {
                format!("Conversation already holds {protocol} state")
            }
            DissectError::CapacityExceeded {
                what,
                index,
                capacity,
            } => format!("{what} index {index} is outside the allocated capacity of {capacity}"),
            DissectError::NotAllocated(what) => format!("{what} has not been allocated"),
            DissectError::Generic(err) => err.to_string(),
        }
    }

    pub fn into_string(self) -> String {
        match self {
            DissectError::Generic(err) => err,
            other => other.to_msg(),
        }
    }

    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Generic(msg.into())
    }

    /// The expert group a packet carrying this error is filed under
    pub fn expert_group(&self) -> ExpertGroup {
        match self {
            DissectError::Framing(_)
            | DissectError::Truncated { .. }
            | DissectError::InvalidPacket(_) => ExpertGroup::Malformed,
            DissectError::CapacityExceeded { .. } | DissectError::NotAllocated(_) => {
                ExpertGroup::Undecoded
            }
            DissectError::StateAlreadyExists(_) | DissectError::Generic(_) => {
                ExpertGroup::Protocol
            }
        }
    }
}

impl Display for DissectError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <Self as Debug>::fmt(self, f)
    }
}

impl From<FramingError> for DissectError {
    fn from(err: FramingError) -> Self {
        DissectError::Framing(err)
    }
}

impl From<std::io::Error> for DissectError {
    fn from(err: std::io::Error) -> Self {
        DissectError::Generic(err.to_string())
    }
}

impl From<flowscope_types::errors::Error> for DissectError {
    fn from(err: flowscope_types::errors::Error) -> Self {
        DissectError::Generic(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for DissectError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        DissectError::InvalidPacket("String is not valid UTF-8")
    }
}
