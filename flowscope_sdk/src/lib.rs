//! # flowscope
//!
//! A stateful packet-dissection engine for conversation-oriented protocols. Packets are handed
//! to an [`AnalysisSession`](crate::prelude::AnalysisSession) in capture order; the session
//! tracks conversations, runs each protocol's state machine exactly once per frame and can
//! re-render any analysed frame afterwards, in any order, with identical output.
//!
//! Built-in dissectors: SOCKS v4/v5 (including UDP relays and BIND), XCP on Ethernet with the
//! DAQ/ODT model, the Microsoft Proxy control channel and its redirected data channels, the
//! Roco Z21 LAN protocol, the Distributed Checksum Clearinghouse and SHICP.
//!
//! ```rust
//! use flowscope_sdk::prelude::*;
//!
//! let session = AnalysisBuilder::default()
//!     .with_socks_ports([1080, 1081])
//!     .with_max_dispatch_depth(4)
//!     .build()
//!     .unwrap();
//! ```
//!
//! # Feature Flags
//! - `verbose-tracing`: instruments the dissector entry points with `tracing` spans
#![forbid(unsafe_code)]
#![deny(unused_extern_crates, unused_import_braces)]

pub mod prelude {
    pub use crate::builder::analysis_builder::AnalysisBuilder;
    pub use flowscope_proto::prelude::*;
}

mod builder;
#[doc(hidden)]
pub mod test_common;
