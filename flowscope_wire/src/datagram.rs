use crate::error::FramingError;
use crate::pdu::{checked_pdu_len, Pdu, PduFormat};
use std::ops::Range;

/// The outcome of framing one datagram
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatagramReport {
    /// PDUs handed to the handler
    pub delivered: usize,
    /// Bytes covered by delivered PDUs
    pub consumed: usize,
    /// Bytes after the last PDU that do not form another one
    pub trailing: Option<Range<usize>>,
    /// Set when framing stopped on a bad header. Already-delivered PDUs stand
    pub error: Option<FramingError>,
}

impl DatagramReport {
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.trailing.is_none()
    }
}

/// Delivers each complete PDU found in `datagram`, once, in order.
///
/// A datagram shorter than the fixed header, or whose first header declares an implausible
/// length or more bytes than are present, is rejected with an error and nothing is delivered.
/// Bytes left after a valid PDU are reported as trailing data, unless the format allows several
/// PDUs per datagram and they parse as another PDU.
pub fn frame_datagram<F, H>(datagram: &[u8], format: &F, mut handler: H) -> DatagramReport
where
    F: PduFormat + ?Sized,
    H: FnMut(Pdu<'_>),
{
    let mut report = DatagramReport::default();
    let mut offset = 0;

    loop {
        if report.delivered > 0 && offset >= datagram.len() {
            break;
        }

        let remaining = &datagram[offset..];
        match checked_pdu_len(format, remaining) {
            Ok(len) if len <= remaining.len() => {
                handler(Pdu {
                    index: report.delivered,
                    offset,
                    bytes: &remaining[..len],
                });
                report.delivered += 1;
                offset += len;

                if !format.multiple_per_datagram() {
                    break;
                }
            }

            Ok(declared) => {
                log::warn!(target: "flowscope", "PDU at offset {offset} declares {declared} bytes; only {} remain", remaining.len());
                report.error = Some(FramingError::Truncated {
                    declared,
                    available: remaining.len(),
                });
                break;
            }

            Err(FramingError::HeaderTooShort { .. }) | Err(FramingError::Rejected)
                if report.delivered > 0 =>
            {
                break;
            }

            Err(err) => {
                log::warn!(target: "flowscope", "Framing stopped at offset {offset}: {err}");
                report.error = Some(err);
                break;
            }
        }
    }

    report.consumed = offset;
    if report.error.is_none() && offset < datagram.len() {
        report.trailing = Some(offset..datagram.len());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::DynPduFormat;

    fn format(multiple: bool) -> DynPduFormat {
        // [len:1][payload], len counts the payload only
        DynPduFormat::new(1, |h| h[0] as usize + 1)
            .with_max_pdu_len(32)
            .with_multiple_per_datagram(multiple)
    }

    fn collect(datagram: &[u8], multiple: bool) -> (Vec<Vec<u8>>, DatagramReport) {
        let mut pdus = Vec::new();
        let report = frame_datagram(datagram, &format(multiple), |pdu| {
            pdus.push(pdu.bytes.to_vec())
        });
        (pdus, report)
    }

    #[test]
    fn one_pdu_per_datagram_leaves_trailing_bytes() {
        let (pdus, report) = collect(&[2, 0xA, 0xB, 0xEE, 0xEE], false);
        assert_eq!(pdus, vec![vec![2, 0xA, 0xB]]);
        assert_eq!(report.trailing, Some(3..5));
        assert!(report.error.is_none());
    }

    #[test]
    fn several_pdus_per_datagram() {
        let (pdus, report) = collect(&[1, 0xA, 2, 0xB, 0xC], true);
        assert_eq!(pdus, vec![vec![1, 0xA], vec![2, 0xB, 0xC]]);
        assert!(report.is_clean());
        assert_eq!(report.consumed, 5);
    }

    #[test]
    fn empty_datagram_is_too_short() {
        let (pdus, report) = collect(&[], false);
        assert!(pdus.is_empty());
        assert_eq!(
            report.error,
            Some(FramingError::HeaderTooShort {
                needed: 1,
                available: 0
            })
        );
    }

    #[test]
    fn truncated_pdu_is_rejected_without_consuming() {
        let (pdus, report) = collect(&[9, 1, 2], false);
        assert!(pdus.is_empty());
        assert_eq!(
            report.error,
            Some(FramingError::Truncated {
                declared: 10,
                available: 3
            })
        );
        assert_eq!(report.consumed, 0);
        assert!(report.trailing.is_none());
    }

    #[test]
    fn truncated_second_pdu_keeps_the_first() {
        let (pdus, report) = collect(&[1, 0xA, 5, 0xB], true);
        assert_eq!(pdus, vec![vec![1, 0xA]]);
        assert!(matches!(report.error, Some(FramingError::Truncated { .. })));
        assert_eq!(report.consumed, 2);
    }
}
