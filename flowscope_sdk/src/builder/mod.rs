//! Builders for configuring and opening analysis sessions.
//!
//! # Components
//! - [`analysis_builder`]: validated construction of an [`AnalysisSession`](flowscope_proto::prelude::AnalysisSession)

pub mod analysis_builder;
