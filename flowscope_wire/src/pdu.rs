use crate::error::FramingError;

/// Describes how a protocol delimits its own messages
pub trait PduFormat {
    /// The minimum number of bytes needed before the PDU length can be read
    fn fixed_header_len(&self) -> usize;

    /// The total length (header + payload) of the PDU starting at `header`. `header` always holds
    /// at least [`Self::fixed_header_len`] bytes
    fn pdu_len(&self, header: &[u8]) -> usize;

    /// The largest PDU this protocol will ever produce
    fn max_pdu_len(&self) -> usize {
        usize::MAX
    }

    /// Lets heuristic protocols refuse bytes that merely start with a matching pattern. Receives
    /// every byte remaining at the candidate offset
    fn is_valid(&self, _bytes: &[u8]) -> bool {
        true
    }

    /// Whether a single datagram may carry several PDUs back to back
    fn multiple_per_datagram(&self) -> bool {
        false
    }
}

impl<T: PduFormat + ?Sized> PduFormat for &T {
    fn fixed_header_len(&self) -> usize {
        (**self).fixed_header_len()
    }

    fn pdu_len(&self, header: &[u8]) -> usize {
        (**self).pdu_len(header)
    }

    fn max_pdu_len(&self) -> usize {
        (**self).max_pdu_len()
    }

    fn is_valid(&self, bytes: &[u8]) -> bool {
        (**self).is_valid(bytes)
    }

    fn multiple_per_datagram(&self) -> bool {
        (**self).multiple_per_datagram()
    }
}

/// One delimited PDU inside a larger buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pdu<'a> {
    /// Position of this PDU among those delivered from the same buffer
    pub index: usize,
    /// Offset of the first PDU byte inside the buffer
    pub offset: usize,
    pub bytes: &'a [u8],
}

/// Reads and sanity-checks the PDU length at the start of `bytes`
pub fn checked_pdu_len<F: PduFormat + ?Sized>(
    format: &F,
    bytes: &[u8],
) -> Result<usize, FramingError> {
    let needed = format.fixed_header_len();
    if bytes.len() < needed {
        return Err(FramingError::HeaderTooShort {
            needed,
            available: bytes.len(),
        });
    }

    if !format.is_valid(bytes) {
        return Err(FramingError::Rejected);
    }

    let declared = format.pdu_len(&bytes[..needed]);
    let max = format.max_pdu_len();
    if declared < needed || declared > max || declared == 0 {
        return Err(FramingError::ImplausibleLength {
            declared,
            min: needed.max(1),
            max,
        });
    }

    Ok(declared)
}

type LengthExtractor = Box<dyn Fn(&[u8]) -> usize>;
type ValidityCheck = Box<dyn Fn(&[u8]) -> bool>;

/// A [`PduFormat`] assembled from closures, for protocols that do not warrant their own type
pub struct DynPduFormat {
    fixed_header_len: usize,
    max_pdu_len: usize,
    multiple_per_datagram: bool,
    length: LengthExtractor,
    validity: Option<ValidityCheck>,
}

impl DynPduFormat {
    pub fn new(fixed_header_len: usize, length: impl Fn(&[u8]) -> usize + 'static) -> Self {
        Self {
            fixed_header_len,
            max_pdu_len: usize::MAX,
            multiple_per_datagram: false,
            length: Box::new(length),
            validity: None,
        }
    }

    pub fn with_validity(mut self, validity: impl Fn(&[u8]) -> bool + 'static) -> Self {
        self.validity = Some(Box::new(validity));
        self
    }

    pub fn with_max_pdu_len(mut self, max_pdu_len: usize) -> Self {
        self.max_pdu_len = max_pdu_len;
        self
    }

    pub fn with_multiple_per_datagram(mut self, multiple: bool) -> Self {
        self.multiple_per_datagram = multiple;
        self
    }
}

impl PduFormat for DynPduFormat {
    fn fixed_header_len(&self) -> usize {
        self.fixed_header_len
    }

    fn pdu_len(&self, header: &[u8]) -> usize {
        (self.length)(header)
    }

    fn max_pdu_len(&self) -> usize {
        self.max_pdu_len
    }

    fn is_valid(&self, bytes: &[u8]) -> bool {
        self.validity.as_ref().map(|f| f(bytes)).unwrap_or(true)
    }

    fn multiple_per_datagram(&self) -> bool {
        self.multiple_per_datagram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be16_plus_header() -> DynPduFormat {
        DynPduFormat::new(2, |h| u16::from_be_bytes([h[0], h[1]]) as usize + 2)
            .with_max_pdu_len(64)
    }

    #[test]
    fn length_is_read_from_header() {
        let format = be16_plus_header();
        assert_eq!(checked_pdu_len(&format, &[0, 3, 1, 2, 3]), Ok(5));
    }

    #[test]
    fn short_header_is_reported() {
        let format = be16_plus_header();
        assert_eq!(
            checked_pdu_len(&format, &[0]),
            Err(FramingError::HeaderTooShort {
                needed: 2,
                available: 1
            })
        );
    }

    #[test]
    fn oversized_length_is_implausible() {
        let format = be16_plus_header();
        assert!(matches!(
            checked_pdu_len(&format, &[0xFF, 0xFF]),
            Err(FramingError::ImplausibleLength { max: 64, .. })
        ));
    }

    #[test]
    fn validity_check_rejects() {
        let format = be16_plus_header().with_validity(|b| b[0] == 0);
        assert_eq!(
            checked_pdu_len(&format, &[1, 0, 0]),
            Err(FramingError::Rejected)
        );
    }
}
