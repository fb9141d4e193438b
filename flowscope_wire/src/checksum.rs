//! Pass/fail contract for the simple checksums carried inside PDUs. A mismatch is informational:
//! callers report it and keep decoding

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    Good,
    Bad { expected: u8, computed: u8 },
    /// The PDU ended before the checksum byte
    Unverified,
}

impl ChecksumStatus {
    pub fn is_bad(&self) -> bool {
        matches!(self, ChecksumStatus::Bad { .. })
    }
}

/// XOR of every byte in `bytes`
pub fn xor8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Checks `covered` against a trailing XOR byte, if one was captured
pub fn verify_xor8(covered: &[u8], expected: Option<u8>) -> ChecksumStatus {
    let Some(expected) = expected else {
        return ChecksumStatus::Unverified;
    };

    let computed = xor8(covered);
    if computed == expected {
        ChecksumStatus::Good
    } else {
        log::warn!(target: "flowscope", "XOR checksum mismatch: expected {expected:#04x}, computed {computed:#04x}");
        ChecksumStatus::Bad { expected, computed }
    }
}
