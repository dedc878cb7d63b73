//! Structured diagnostics for script validation and execution.
//!
//! Every diagnostic carries a kind, a message, and a non-empty suggestion —
//! the contract is that feedback is always self-correction-ready for the
//! agent that submitted the script.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Line/column position of a finding within the submitted script (1-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

/// Kinds of static findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationKind {
    SyntaxError,
    DisallowedConstruct,
    UndeclaredGlobal,
    UnboundedLoopHeuristic,
    MissingReturn,
}

/// A single static finding, with an actionable rewrite hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub kind: ValidationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Span>,
    pub message: String,
    pub suggestion: String,
}

impl ValidationError {
    pub fn syntax(message: impl Into<String>, line: Option<usize>, suggestion: impl Into<String>) -> Self {
        Self {
            kind: ValidationKind::SyntaxError,
            location: line.map(|line| Span { line, col: 1 }),
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn disallowed(name: &str, span: Span, suggestion: impl Into<String>) -> Self {
        Self {
            kind: ValidationKind::DisallowedConstruct,
            location: Some(span),
            message: format!("'{name}' is not available in query scripts"),
            suggestion: suggestion.into(),
        }
    }

    pub fn undeclared_global(name: &str, span: Span, did_you_mean: Option<&str>) -> Self {
        let suggestion = match did_you_mean {
            Some(candidate) => format!("Did you mean '{candidate}'?"),
            None => format!(
                "Declare '{name}' with 'local {name} = ...' before using it, \
                 or use one of the host bindings: search, json."
            ),
        };
        Self {
            kind: ValidationKind::UndeclaredGlobal,
            location: Some(span),
            message: format!("Undeclared global '{name}'"),
            suggestion,
        }
    }

    pub fn unbounded_loop(span: Span) -> Self {
        Self {
            kind: ValidationKind::UnboundedLoopHeuristic,
            location: Some(span),
            message: "Loop has no statically visible exit".to_string(),
            suggestion: "Add a 'break' or bound the loop with a counter, otherwise \
                         it will hit the execution time budget."
                .to_string(),
        }
    }

    pub fn missing_return() -> Self {
        Self {
            kind: ValidationKind::MissingReturn,
            location: None,
            message: "Script has no return statement".to_string(),
            suggestion: "Add 'return <value>' so the call produces a result.".to_string(),
        }
    }
}

/// Result of validating a script, produced exactly once per submission
/// and never mutated afterwards.
///
/// `valid` is true iff there are no hard-fail errors; warnings (the
/// unbounded-loop heuristic, missing return) never invalidate on their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn new(errors: Vec<ValidationError>, warnings: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Kinds of execution failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    Timeout,
    MemoryLimit,
    InstructionLimit,
    HostFunctionError,
    UnhandledScriptError,
}

/// A runtime failure, caught at the sandbox boundary and reported as data —
/// never propagated as a host-level fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeError {
    pub kind: RuntimeKind,
    pub message: String,
    pub suggestion: String,
    /// Call-site chain within the script, not the host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<Vec<String>>,
}

impl RuntimeError {
    pub fn timeout(budget: Duration) -> Self {
        Self {
            kind: RuntimeKind::Timeout,
            message: format!("Execution exceeded the {}ms time budget", budget.as_millis()),
            suggestion: "Reduce the amount of work per call: lower the search limit, \
                         bound your loops, or split the query into smaller scripts."
                .to_string(),
            traceback: None,
        }
    }

    pub fn instruction_limit(budget: u64) -> Self {
        Self {
            kind: RuntimeKind::InstructionLimit,
            message: format!("Execution exceeded the budget of {budget} instructions"),
            suggestion: "Bound your loops and avoid rescanning results repeatedly; \
                         the script must finish within a fixed instruction budget."
                .to_string(),
            traceback: None,
        }
    }

    pub fn memory_limit(ceiling_bytes: usize) -> Self {
        Self {
            kind: RuntimeKind::MemoryLimit,
            message: format!("Execution exceeded the memory ceiling of {ceiling_bytes} bytes"),
            suggestion: "Build smaller intermediate values: filter search results \
                         before transforming them and avoid concatenating large strings."
                .to_string(),
            traceback: None,
        }
    }

    pub fn host_function(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            kind: RuntimeKind::HostFunctionError,
            message: message.into(),
            suggestion: suggestion.into(),
            traceback: None,
        }
    }

    pub fn script_error(message: impl Into<String>, traceback: Option<Vec<String>>) -> Self {
        Self {
            kind: RuntimeKind::UnhandledScriptError,
            message: message.into(),
            suggestion: "Fix the error at the reported line; wrap risky operations \
                         in pcall() if you want to handle them in the script."
                .to_string(),
            traceback,
        }
    }

    pub fn with_suggestion_note(mut self, note: &str) -> Self {
        self.suggestion = format!("{} {note}", self.suggestion);
        self
    }
}
