//! Terminal marshaling of execution outcomes.
//!
//! Every call ends here: the outcome of the pipeline — a value, a validation
//! failure, or a runtime failure — becomes one [`StructuredResult`].
//! [`marshal`] is total and never raises.

use serde::Serialize;
use serde_json::Value;

use crate::diagnostics::{RuntimeError, RuntimeKind, ValidationError, ValidationResult};

/// Exactly one variant per call; never both a value and an error.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success(Value),
    ValidationFailure(ValidationResult),
    RuntimeFailure(RuntimeError),
}

/// The shape every caller receives: `success == value present == error absent`.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ErrorPayload {
    Validation {
        kind: &'static str,
        errors: Vec<ValidationError>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<ValidationError>,
    },
    Runtime {
        kind: RuntimeKind,
        message: String,
        suggestion: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        traceback: Option<Vec<String>>,
    },
}

pub fn marshal(outcome: ExecutionOutcome) -> StructuredResult {
    match outcome {
        ExecutionOutcome::Success(value) => StructuredResult {
            success: true,
            value: Some(value),
            error: None,
        },
        ExecutionOutcome::ValidationFailure(vr) => StructuredResult {
            success: false,
            value: None,
            error: Some(ErrorPayload::Validation {
                kind: "validation",
                errors: vr.errors,
                warnings: vr.warnings,
            }),
        },
        ExecutionOutcome::RuntimeFailure(err) => StructuredResult {
            success: false,
            value: None,
            error: Some(ErrorPayload::Runtime {
                kind: err.kind,
                message: err.message,
                suggestion: err.suggestion,
                traceback: err.traceback,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Span;
    use serde_json::json;
    use std::time::Duration;

    fn invariant_holds(result: &StructuredResult) -> bool {
        result.success == result.value.is_some() && result.success == result.error.is_none()
    }

    #[test]
    fn test_marshal_success() {
        let result = marshal(ExecutionOutcome::Success(json!({"n": 3})));
        assert!(result.success);
        assert!(invariant_holds(&result));
        assert_eq!(result.value.unwrap()["n"], 3);
    }

    #[test]
    fn test_marshal_success_null_value_is_still_present() {
        // A script returning nil succeeds with an explicit null value.
        let result = marshal(ExecutionOutcome::Success(Value::Null));
        assert!(result.success);
        assert_eq!(result.value, Some(Value::Null));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_marshal_validation_failure() {
        let vr = ValidationResult::new(
            vec![ValidationError::undeclared_global(
                "serch",
                Span { line: 1, col: 8 },
                Some("search"),
            )],
            vec![],
        );
        let result = marshal(ExecutionOutcome::ValidationFailure(vr));
        assert!(!result.success);
        assert!(invariant_holds(&result));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"]["kind"], "validation");
        assert_eq!(json["error"]["errors"][0]["kind"], "undeclared-global");
        assert_eq!(json["error"]["errors"][0]["location"]["line"], 1);
    }

    #[test]
    fn test_marshal_runtime_failure() {
        let result = marshal(ExecutionOutcome::RuntimeFailure(RuntimeError::timeout(
            Duration::from_millis(100),
        )));
        assert!(!result.success);
        assert!(invariant_holds(&result));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"]["kind"], "timeout");
        assert!(json["error"]["suggestion"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn test_marshal_runtime_failure_with_traceback() {
        let err = RuntimeError::script_error(
            "attempt to index a nil value",
            Some(vec!["script:3: in main chunk".to_string()]),
        );
        let json = serde_json::to_value(marshal(ExecutionOutcome::RuntimeFailure(err))).unwrap();
        assert_eq!(json["error"]["kind"], "unhandled-script-error");
        assert_eq!(json["error"]["traceback"][0], "script:3: in main chunk");
    }
}
