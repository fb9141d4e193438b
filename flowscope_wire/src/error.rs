use std::fmt::Formatter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Fewer bytes than the fixed header were available
    HeaderTooShort { needed: usize, available: usize },
    /// The header declared a length below the header size or above the protocol maximum
    ImplausibleLength {
        declared: usize,
        min: usize,
        max: usize,
    },
    /// The header declared more bytes than the datagram carries
    Truncated { declared: usize, available: usize },
    /// The validity check refused bytes that only resemble a header
    Rejected,
    Io(String),
}

impl FramingError {
    pub fn std(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, self.to_string())
    }
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::HeaderTooShort { needed, available } => write!(
                f,
                "Header needs {needed} bytes but only {available} are available"
            ),
            FramingError::ImplausibleLength { declared, min, max } => write!(
                f,
                "Declared PDU length {declared} is outside of [{min}, {max}]"
            ),
            FramingError::Truncated {
                declared,
                available,
            } => write!(
                f,
                "Declared PDU length {declared} exceeds the {available} bytes remaining"
            ),
            FramingError::Rejected => write!(f, "Bytes do not form a valid PDU header"),
            FramingError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for FramingError {}

impl From<FramingError> for std::io::Error {
    fn from(val: FramingError) -> Self {
        val.std()
    }
}

impl From<std::io::Error> for FramingError {
    fn from(err: std::io::Error) -> Self {
        FramingError::Io(err.to_string())
    }
}
