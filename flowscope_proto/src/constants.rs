/// `[len:2 LE][counter:2 LE]` in front of every XCP packet on Ethernet
pub const XCP_ETH_HEADER_LEN: usize = 4;
/// Fixed control header in front of every MS Proxy message
pub const MSPROXY_HEADER_LEN: usize = 38;
pub const MSPROXY_MAGIC: &[u8; 4] = b"RWSP";
/// `[datalen:2 LE][header:2 LE]`
pub const Z21_HEADER_LEN: usize = 4;
pub const DCC_HEADER_LEN: usize = 24;
/// Every DCC packet ends with an MD5 signature
pub const DCC_SIGNATURE_LEN: usize = 16;
/// The DCC client library refuses anything larger
pub const DCC_MAX_PKT_LEN: usize = 1400;
pub const SHICP_HEADER_LEN: usize = 17;
pub const SHICP_MAGIC: u16 = 0x4248;
pub const SHICP_VERSION: u8 = 1;
/// Bound on the number of PDUs a single datagram may fan out into
pub const MAX_PDUS_PER_DATAGRAM: usize = 256;
