//! Execution engine: validate, run, marshal.
//!
//! One engine serves many concurrent submissions; the store behind it is
//! shared, and each execution gets its own VM on a blocking worker.

use crate::diagnostics::{RuntimeKind, ValidationKind, ValidationResult};
use crate::outcome::{marshal, ExecutionOutcome, StructuredResult};
use crate::sandbox::{self, ResourceLimits};
use crate::store::MemoryStore;
use crate::validator::Validator;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Engine {
    store: Arc<MemoryStore>,
    validator: Validator,
    limits: ResourceLimits,
}

impl Engine {
    pub fn new(store: Arc<MemoryStore>, validator: Validator, limits: ResourceLimits) -> Self {
        Self {
            store,
            validator,
            limits,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Static checks only; never executes the script.
    pub fn validate(&self, source: &str) -> ValidationResult {
        self.validator.validate(source)
    }

    /// Full pipeline for one submission. Always returns a structured
    /// result; failures at every stage are data, not panics.
    pub async fn execute(&self, source: &str) -> StructuredResult {
        marshal(self.run(source).await)
    }

    async fn run(&self, source: &str) -> ExecutionOutcome {
        let validation = self.validator.validate(source);
        if !validation.valid {
            warn!(
                "validation rejected script: {} error(s)",
                validation.errors.len()
            );
            return ExecutionOutcome::ValidationFailure(validation);
        }

        let loop_warning = validation
            .warnings
            .iter()
            .any(|w| w.kind == ValidationKind::UnboundedLoopHeuristic);

        let store = self.store.clone();
        let limits = self.limits;
        let owned_source = source.to_string();
        let result = tokio::task::spawn_blocking(move || {
            sandbox::run(&owned_source, store, &limits)
        })
        .await
        // A panic here is a sandbox bug, not a script failure
        .expect("sandbox execution task panicked");

        match result {
            Ok(value) => {
                info!("script completed successfully");
                ExecutionOutcome::Success(value)
            }
            Err(mut error) => {
                warn!("script failed: {:?} {}", error.kind, error.message);
                // A loop the validator already flagged explains the limit
                if loop_warning
                    && matches!(error.kind, RuntimeKind::Timeout | RuntimeKind::InstructionLimit)
                {
                    error = error.with_suggestion_note(
                        "Validation flagged a loop with no reachable exit; add a break or a bounded condition.",
                    );
                }
                ExecutionOutcome::RuntimeFailure(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn engine_with_data(dir: &std::path::Path) -> Engine {
        let store = MemoryStore::open(dir).unwrap();
        store.create_collection("memories").unwrap();
        store
            .insert("memories", "prefers tabs over spaces", serde_json::Map::new())
            .unwrap();
        Engine::new(
            Arc::new(store),
            Validator::new(false),
            ResourceLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_end_to_end_success() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_data(dir.path());
        let result = engine
            .execute("local hits = search('memories', 'tabs', 3)\nreturn #hits")
            .await;
        assert!(result.success);
        assert_eq!(result.value, Some(json!(1)));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_invalid_script_never_executes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_data(dir.path());
        let result = engine.execute("return os.time()").await;
        assert!(!result.success);
        // The failed submission must not have touched the store
        assert_eq!(engine.store().stats().queries, 0);
    }

    #[tokio::test]
    async fn test_runtime_failure_is_structured() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_data(dir.path());
        let result = engine.execute("error('boom')").await;
        assert!(!result.success);
        assert!(result.value.is_none());
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_limit_failure_cites_flagged_loop() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        let engine = Engine::new(
            Arc::new(store),
            Validator::new(false),
            ResourceLimits {
                instruction_budget: 100_000,
                ..Default::default()
            },
        );
        let result = engine.execute("while true do end").await;
        assert!(!result.success);
        let payload = serde_json::to_value(&result).unwrap();
        let suggestion = payload["error"]["suggestion"].as_str().unwrap();
        assert!(suggestion.contains("no reachable exit"), "{suggestion}");
    }

    #[tokio::test]
    async fn test_concurrent_executions() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        store.create_collection("a").unwrap();
        store.create_collection("b").unwrap();
        store.insert("a", "alpha records", serde_json::Map::new()).unwrap();
        store.insert("b", "beta records", serde_json::Map::new()).unwrap();
        let engine = Arc::new(Engine::new(
            Arc::new(store),
            Validator::new(false),
            ResourceLimits::default(),
        ));

        let mut handles = Vec::new();
        for collection in ["a", "b"] {
            let engine = engine.clone();
            let source = format!("return search('{collection}', 'records', 5)[1].collection");
            handles.push(tokio::spawn(async move { engine.execute(&source).await }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.success);
            seen.push(result.value.unwrap());
        }
        seen.sort_by_key(|v| v.as_str().unwrap_or_default().to_string());
        assert_eq!(seen, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn test_timeout_budget_honored() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).unwrap();
        let engine = Engine::new(
            Arc::new(store),
            Validator::new(false),
            ResourceLimits {
                timeout: Duration::from_millis(50),
                instruction_budget: u64::MAX,
                ..Default::default()
            },
        );
        let started = std::time::Instant::now();
        let result = engine.execute("n = 0 while true do n = n + 1 end").await;
        assert!(!result.success);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
