//! Result Mapper
//!
//! Decodes the extracted worker document into a typed outcome and shapes the
//! reply for the caller, either as the normalized envelope or as the worker's
//! own document passed through unchanged.

use crate::error::{PipelineError, Result};
use crate::extractor::ExtractedDocument;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SOURCE_WORKER: &str = "worker";
pub const SOURCE_PARSING: &str = "parsing";
pub const SOURCE_CLASSIFICATION: &str = "tower_classification";

const UNKNOWN_ERROR: &str = "Unknown error";

/// How a successful pipeline run is shaped for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Map onto [`ResponseEnvelope`]
    Normalized,
    /// Return the worker's decoded document unmodified
    PassThrough,
}

/// What the worker declared about the image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub success: bool,
    #[serde(default)]
    pub tower_type: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default, rename = "error")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerClassification {
    pub tower_type: String,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub source: String,
    pub message: String,
}

impl EnvelopeError {
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }
}

/// Normalized response contract.
///
/// `success` is false exactly when `errors` is non-empty or no
/// classification is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    pub tower_classification: Option<TowerClassification>,
    /// Antenna detection is not produced by this service
    pub antenna_detection: Option<Value>,
    pub errors: Vec<EnvelopeError>,
}

/// A worker outcome that passed validation
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Classified(TowerClassification),
    /// Analysis completed but the worker declined to classify
    Declined { message: Option<String> },
}

const MISSING_TOWER_TYPE: &str = "worker reported success without a tower_type";

impl ClassificationOutcome {
    /// `success: true` must come with a `tower_type`
    pub fn into_verdict(self) -> std::result::Result<Verdict, String> {
        match (self.success, self.tower_type) {
            (true, Some(tower_type)) => Ok(Verdict::Classified(TowerClassification {
                tower_type,
                confidence: self.confidence,
            })),
            (true, None) => Err(MISSING_TOWER_TYPE.to_string()),
            (false, _) => Ok(Verdict::Declined {
                message: self.error_message,
            }),
        }
    }
}

impl ResponseEnvelope {
    pub fn from_verdict(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Classified(classification) => Self {
                success: true,
                tower_classification: Some(classification),
                antenna_detection: None,
                errors: Vec::new(),
            },
            Verdict::Declined { message } => Self::failure(
                SOURCE_CLASSIFICATION,
                message.unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
            ),
        }
    }

    pub fn failure(source: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            tower_classification: None,
            antenna_detection: None,
            errors: vec![EnvelopeError::new(source, message)],
        }
    }
}

/// Reply for a pipeline run that produced a decodable document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClassificationReply {
    Envelope(ResponseEnvelope),
    PassThrough(Value),
}

impl ClassificationReply {
    /// Whether the worker reported a successful classification
    pub fn is_success(&self) -> bool {
        match self {
            ClassificationReply::Envelope(envelope) => envelope.success,
            ClassificationReply::PassThrough(doc) => {
                doc.get("success").and_then(Value::as_bool).unwrap_or(false)
            }
        }
    }
}

/// Decode and validate the candidate document.
///
/// Returns the raw JSON object alongside the verdict so pass-through mode
/// can hand back exactly what the worker printed.
pub fn decode_outcome(document: &ExtractedDocument) -> std::result::Result<(Value, Verdict), String> {
    let value: Value = serde_json::from_str(&document.text).map_err(|e| e.to_string())?;

    if !value.is_object() {
        return Err(format!("expected a JSON object, found {}", json_kind(&value)));
    }

    let outcome: ClassificationOutcome =
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;

    Ok((value, outcome.into_verdict()?))
}

/// Map the document onto the reply for `mode`, or fail with
/// `MalformedWorkerOutput` carrying the raw streams.
pub fn map_document(
    document: &ExtractedDocument,
    stdout: &str,
    stderr: &str,
    mode: ResponseMode,
) -> Result<ClassificationReply> {
    let (value, verdict) =
        decode_outcome(document).map_err(|reason| PipelineError::MalformedWorkerOutput {
            reason,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })?;

    Ok(match mode {
        ResponseMode::Normalized => ClassificationReply::Envelope(ResponseEnvelope::from_verdict(verdict)),
        ResponseMode::PassThrough => ClassificationReply::PassThrough(value),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::extract_from_text;
    use serde_json::json;

    fn map(stdout: &str, mode: ResponseMode) -> Result<ClassificationReply> {
        map_document(&extract_from_text(stdout), stdout, "stderr text", mode)
    }

    #[test]
    fn test_success_envelope() {
        let stdout = r#"noise-before{"success":true,"tower_type":"monopole","confidence":0.92}noise-after"#;
        let reply = map(stdout, ResponseMode::Normalized).unwrap();

        assert_eq!(
            reply,
            ClassificationReply::Envelope(ResponseEnvelope {
                success: true,
                tower_classification: Some(TowerClassification {
                    tower_type: "monopole".to_string(),
                    confidence: Some(0.92),
                }),
                antenna_detection: None,
                errors: vec![],
            })
        );
        assert!(reply.is_success());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let reply = map(r#"{"success":true,"tower_type":"guyed"}"#, ResponseMode::Normalized).unwrap();
        let body = serde_json::to_value(&reply).unwrap();

        assert_eq!(
            body,
            json!({
                "success": true,
                "towerClassification": {"tower_type": "guyed", "confidence": null},
                "antennaDetection": null,
                "errors": []
            })
        );
    }

    #[test]
    fn test_domain_failure_uses_worker_message() {
        let reply = map(r#"{"success":false,"error":"image unreadable"}"#, ResponseMode::Normalized).unwrap();

        let ClassificationReply::Envelope(envelope) = reply else {
            panic!("expected envelope");
        };
        assert!(!envelope.success);
        assert!(envelope.tower_classification.is_none());
        assert_eq!(
            envelope.errors,
            vec![EnvelopeError::new(SOURCE_CLASSIFICATION, "image unreadable")]
        );
    }

    #[test]
    fn test_domain_failure_without_message() {
        let reply = map(r#"{"success":false}"#, ResponseMode::Normalized).unwrap();
        let ClassificationReply::Envelope(envelope) = reply else {
            panic!("expected envelope");
        };
        assert_eq!(envelope.errors[0].message, "Unknown error");
    }

    #[test]
    fn test_pass_through_returns_document_unmodified() {
        let stdout = r#"log line {"success":true,"tower_type":"lattice","extra":{"k":1}}"#;
        let reply = map(stdout, ResponseMode::PassThrough).unwrap();

        assert_eq!(
            reply,
            ClassificationReply::PassThrough(json!({
                "success": true,
                "tower_type": "lattice",
                "extra": {"k": 1}
            }))
        );
    }

    #[test]
    fn test_no_braces_is_malformed_in_both_modes() {
        for mode in [ResponseMode::Normalized, ResponseMode::PassThrough] {
            match map("Traceback: something went wrong", mode) {
                Err(PipelineError::MalformedWorkerOutput { stdout, stderr, .. }) => {
                    assert_eq!(stdout, "Traceback: something went wrong");
                    assert_eq!(stderr, "stderr text");
                }
                other => panic!("expected malformed output, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_success_without_tower_type_is_rejected() {
        let result = map(r#"{"success":true,"confidence":0.5}"#, ResponseMode::PassThrough);
        match result {
            Err(PipelineError::MalformedWorkerOutput { reason, .. }) => {
                assert!(reason.contains("tower_type"));
            }
            other => panic!("expected malformed output, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_field_types_are_rejected() {
        assert!(map(r#"{"success":"yes"}"#, ResponseMode::Normalized).is_err());
        assert!(map(r#"{"tower_type":"monopole"}"#, ResponseMode::Normalized).is_err());
        assert!(map("[1, 2]", ResponseMode::Normalized).is_err());
    }

    #[test]
    fn test_success_invariant_holds() {
        for stdout in [
            r#"{"success":true,"tower_type":"water_tank","confidence":0.4}"#,
            r#"{"success":false,"error":"x"}"#,
        ] {
            let ClassificationReply::Envelope(envelope) = map(stdout, ResponseMode::Normalized).unwrap() else {
                panic!("expected envelope");
            };
            assert_eq!(
                envelope.success,
                envelope.errors.is_empty() && envelope.tower_classification.is_some()
            );
        }
    }

    #[test]
    fn test_verdict_requires_tower_type_on_success() {
        let outcome = ClassificationOutcome {
            success: true,
            tower_type: None,
            confidence: Some(0.3),
            error_message: None,
        };
        assert!(outcome.into_verdict().is_err());

        let outcome = ClassificationOutcome {
            success: false,
            tower_type: Some("monopole".to_string()),
            confidence: None,
            error_message: None,
        };
        assert_eq!(outcome.into_verdict(), Ok(Verdict::Declined { message: None }));
    }
}
