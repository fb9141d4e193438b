//! Plain data shared by every flowscope crate: transport and packet identities, the structured
//! output records a dissector emits, and the serde-backed analysis configuration.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::Error;
    pub use crate::proto::*;
    pub use crate::records::*;
}

pub mod config;
pub mod errors;
pub mod proto;
pub mod records;
