//! `recap-ai`
//!
//! **Responsibility:** boundary to the external analysis service.
//!
//! - `AiCaller`: one call, one prepared text, one structured result.
//! - `AiError`: failures carry a transient/permanent classification the
//!   engine's retry policy acts on.
//! - `AiCallers`: backends selectable by model name.
//! - No retries, persistence, or scheduling happen here.

pub mod caller;
pub mod http;
pub mod prompt;
pub mod registry;
pub mod result;

pub use caller::AiCaller;
pub use http::{HttpAiCaller, HttpAiConfig};
pub use prompt::{DEFAULT_ANALYSIS_INSTRUCTIONS, DEFAULT_FILTER_KEYWORDS, default_filter_keywords};
pub use registry::{AiCallers, UnknownModel};
pub use result::{AiError, AnalysisResult, ErrorClass};
