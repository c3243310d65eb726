use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Structured output of one AI analysis call.
///
/// Field names follow the JSON object the analysis instructions ask the model
/// to return. Anything else the model produced is kept in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Short summary of the analysed content.
    pub summary: String,

    /// Coarse risk label ("low" / "medium" / "high"), if the model gave one.
    pub risk_level: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Notable compliance or sensitivity findings; empty when none.
    pub key_findings: Option<String>,

    /// Raw model output plus anything the caller wants to attach.
    #[serde(default)]
    pub metadata: JsonValue,
}

impl AnalysisResult {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            risk_level: None,
            tags: Vec::new(),
            key_findings: None,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_risk_level(mut self, risk_level: impl Into<String>) -> Self {
        self.risk_level = Some(risk_level.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_key_findings(mut self, findings: impl Into<String>) -> Self {
        self.key_findings = Some(findings.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build a result from the JSON object a model returned.
    ///
    /// `summary` is required; the other fields are optional and tolerated in
    /// loose shapes (e.g. `tags` given as a comma separated string).
    pub fn from_model_json(value: JsonValue) -> Result<Self, AiError> {
        let obj = value
            .as_object()
            .ok_or_else(|| AiError::MalformedResponse("expected a JSON object".to_string()))?;

        let summary = obj
            .get("summary")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AiError::MalformedResponse("missing `summary`".to_string()))?
            .to_string();

        let risk_level = obj
            .get("risk_level")
            .and_then(JsonValue::as_str)
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let tags = match obj.get("tags") {
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            Some(JsonValue::String(s)) => s
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        let key_findings = obj
            .get("key_findings")
            .and_then(JsonValue::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(Self {
            summary,
            risk_level,
            tags,
            key_findings,
            metadata: value,
        })
    }
}

/// How a failed AI call should be treated by the retry policy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Expected to succeed on retry (timeouts, rate limits, 5xx).
    Transient,
    /// Retrying cannot fix it (malformed input, policy rejection).
    Permanent,
}

#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("ai call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rejected by provider (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),
}

impl AiError {
    /// Shorthand for a transient failure with a free-form message.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Shorthand for a permanent failure with a free-form message.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AiError::Timeout(_)
            | AiError::RateLimited(_)
            | AiError::Transport(_)
            | AiError::Unavailable { .. } => ErrorClass::Transient,
            AiError::InvalidInput(_) | AiError::Rejected { .. } | AiError::MalformedResponse(_) => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_model_object() {
        let r = AnalysisResult::from_model_json(json!({
            "risk_level": "High",
            "summary": " quarterly numbers discussed ",
            "tags": ["finance", " q3 ", ""],
            "key_findings": "mentions unreleased earnings"
        }))
        .unwrap();

        assert_eq!(r.summary, "quarterly numbers discussed");
        assert_eq!(r.risk_level.as_deref(), Some("high"));
        assert_eq!(r.tags, vec!["finance", "q3"]);
        assert_eq!(r.key_findings.as_deref(), Some("mentions unreleased earnings"));
        assert_eq!(r.metadata["risk_level"], "High");
    }

    #[test]
    fn accepts_comma_separated_tags_and_blank_findings() {
        let r = AnalysisResult::from_model_json(json!({
            "summary": "ok",
            "tags": "a, b ,c",
            "key_findings": "   "
        }))
        .unwrap();

        assert_eq!(r.tags, vec!["a", "b", "c"]);
        assert!(r.key_findings.is_none());
    }

    #[test]
    fn missing_summary_is_malformed() {
        let err = AnalysisResult::from_model_json(json!({ "tags": [] })).unwrap_err();
        assert!(matches!(err, AiError::MalformedResponse(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn classification() {
        assert!(AiError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(AiError::RateLimited("slow down".into()).is_transient());
        assert!(AiError::transient("reset").is_transient());
        assert!(AiError::Unavailable { status: 503, message: String::new() }.is_transient());

        assert_eq!(AiError::permanent("bad").class(), ErrorClass::Permanent);
        assert_eq!(
            AiError::Rejected { status: 400, message: String::new() }.class(),
            ErrorClass::Permanent
        );
    }
}
