use std::sync::Arc;

use async_trait::async_trait;

use crate::result::{AiError, AnalysisResult};

/// The external analysis service.
///
/// One call analyses one prepared text under the given instructions. The
/// implementation owns any provider rate-limit budget; from the caller's side
/// exhausting it only shows up as a transient [`AiError`].
///
/// Implementations must not retry internally; the engine owns retries.
#[async_trait]
pub trait AiCaller: Send + Sync + 'static {
    /// Provider/model label recorded alongside saved results.
    fn provider(&self) -> &str;

    async fn analyze(&self, text: &str, instructions: &str) -> Result<AnalysisResult, AiError>;
}

#[async_trait]
impl<T: AiCaller + ?Sized> AiCaller for Arc<T> {
    fn provider(&self) -> &str {
        (**self).provider()
    }

    async fn analyze(&self, text: &str, instructions: &str) -> Result<AnalysisResult, AiError> {
        (**self).analyze(text, instructions).await
    }
}
