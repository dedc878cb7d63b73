use std::time::Duration;

/// Hard ceilings applied to every script execution. All four are enforced
/// unconditionally; a caller can widen them but never disable them.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Wall-clock budget for one execution, host calls included.
    pub timeout: Duration,
    /// Maximum Lua VM instructions before the script is killed.
    pub instruction_budget: u64,
    /// Ceiling on VM-allocated memory in bytes.
    pub memory_limit_bytes: usize,
    /// Largest `limit` a script may pass to search().
    pub max_search_limit: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            instruction_budget: 10_000_000,
            memory_limit_bytes: 64 * 1024 * 1024,
            max_search_limit: 100,
        }
    }
}
