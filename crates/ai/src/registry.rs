use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::caller::AiCaller;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown model: {0}")]
pub struct UnknownModel(pub String);

/// Analysis backends selectable by model name.
///
/// Jobs that name no model use the default caller. A named model must be
/// registered; results are always labelled with the provider of the caller
/// that actually answered.
#[derive(Clone)]
pub struct AiCallers {
    default: Arc<dyn AiCaller>,
    by_model: BTreeMap<String, Arc<dyn AiCaller>>,
}

impl AiCallers {
    pub fn new(default: Arc<dyn AiCaller>) -> Self {
        Self {
            default,
            by_model: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, caller: Arc<dyn AiCaller>) -> Self {
        self.by_model.insert(model.into(), caller);
        self
    }

    pub fn default_caller(&self) -> &Arc<dyn AiCaller> {
        &self.default
    }

    /// Caller for `model`, or the default when none is named.
    pub fn resolve(&self, model: Option<&str>) -> Result<&Arc<dyn AiCaller>, UnknownModel> {
        match model.map(str::trim).filter(|m| !m.is_empty()) {
            None => Ok(&self.default),
            Some(name) => self
                .by_model
                .get(name)
                .ok_or_else(|| UnknownModel(name.to_string())),
        }
    }

    /// Registered model names, sorted.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.by_model.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for AiCallers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiCallers")
            .field("default", &self.default.provider())
            .field("models", &self.by_model.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::result::{AiError, AnalysisResult};

    struct Named(&'static str);

    #[async_trait]
    impl AiCaller for Named {
        fn provider(&self) -> &str {
            self.0
        }

        async fn analyze(&self, _text: &str, _instructions: &str) -> Result<AnalysisResult, AiError> {
            Ok(AnalysisResult::new(self.0))
        }
    }

    #[test]
    fn resolves_by_model_name() {
        let callers = AiCallers::new(Arc::new(Named("default")))
            .with_model("gpt-4o", Arc::new(Named("openai-compatible:gpt-4o")))
            .with_model("azure-gpt4", Arc::new(Named("openai-compatible:azure-gpt4")));

        assert_eq!(callers.resolve(None).unwrap().provider(), "default");
        assert_eq!(callers.resolve(Some("  ")).unwrap().provider(), "default");
        assert_eq!(
            callers.resolve(Some("azure-gpt4")).unwrap().provider(),
            "openai-compatible:azure-gpt4"
        );
        assert_eq!(callers.models().collect::<Vec<_>>(), vec!["azure-gpt4", "gpt-4o"]);
    }

    #[test]
    fn unknown_model_is_an_error() {
        let callers = AiCallers::new(Arc::new(Named("default")));
        let err = callers.resolve(Some("claude")).err().unwrap();
        assert_eq!(err, UnknownModel("claude".to_string()));
    }
}
