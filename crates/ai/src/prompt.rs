//! Default analysis instructions and filter keywords.

/// Instructions used when a job is created without its own.
pub const DEFAULT_ANALYSIS_INSTRUCTIONS: &str = r#"Analyse the correspondence below and answer with a JSON object:
{
    "risk_level": "low | medium | high",
    "summary": "core content in at most 100 words",
    "tags": ["tag1", "tag2", "tag3"],
    "key_findings": "sensitive or compliance-relevant content, or an empty string"
}

Output the JSON object only, without any prefix or explanation.
risk_level must be one of "low", "medium", "high"."#;

/// Subject/sender keywords that mark automated mail not worth analysing.
pub const DEFAULT_FILTER_KEYWORDS: &[&str] = &[
    "Systems bounce",
    "Verify",
    "Auto-Reply",
    "Out of Office",
    "Delivery Status",
    "Undeliverable",
];

pub fn default_filter_keywords() -> Vec<String> {
    DEFAULT_FILTER_KEYWORDS.iter().map(|k| k.to_string()).collect()
}
