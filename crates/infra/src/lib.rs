//! Infrastructure layer: the batch analysis engine and its storage adapters.

pub mod dataset;
pub mod jobs;
