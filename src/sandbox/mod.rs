//! Sandboxed execution of validated scripts.
//!
//! Each run gets a fresh VM with a minimal stdlib (string, table, math),
//! dangerous base globals removed, a memory ceiling, and an instruction
//! hook that enforces both the instruction budget and the wall-clock
//! deadline. The VM is created and dropped inside [`run`]; nothing leaks
//! between executions.

mod bridge;
mod limits;

pub use limits::ResourceLimits;

use crate::diagnostics::RuntimeError;
use crate::store::MemoryStore;
use bridge::{find_bridge_error, BridgeError};
use mlua::{HookTriggers, Lua, LuaOptions, MultiValue, StdLib};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Instructions between hook invocations. Small enough that a runaway
/// script overshoots its budget by at most this much.
const HOOK_INTERVAL: u64 = 4096;

/// Base-library globals removed before any script code runs. The stdlib
/// subset keeps the dangerous libraries unloaded; these are the leftover
/// escape hatches the base library always carries.
const SCRUBBED_GLOBALS: &[&str] = &[
    "load",
    "loadstring",
    "loadfile",
    "dofile",
    "print",
    "collectgarbage",
    "rawget",
    "rawset",
    "rawequal",
    "rawlen",
    "setmetatable",
    "getmetatable",
];

// Which limit the hook tripped, if any. Stored outside the VM so a
// script-side pcall cannot mask the classification.
const TRIP_NONE: u8 = 0;
const TRIP_INSTRUCTIONS: u8 = 1;
const TRIP_DEADLINE: u8 = 2;

/// Runs a validated script to completion and marshals its return value.
///
/// Blocking: call from a blocking-capable context. Limit breaches,
/// script-raised errors, and host call failures all come back as a
/// classified [`RuntimeError`].
pub fn run(
    source: &str,
    store: Arc<MemoryStore>,
    limits: &ResourceLimits,
) -> Result<JsonValue, RuntimeError> {
    let lua = match Lua::new_with(StdLib::STRING | StdLib::TABLE | StdLib::MATH, LuaOptions::default())
    {
        Ok(lua) => lua,
        Err(e) => {
            return Err(RuntimeError::host_function(
                format!("sandbox could not be initialized: {e}"),
                "Retry the request.",
            ))
        }
    };

    if let Err(e) = prepare(&lua, limits) {
        return Err(RuntimeError::host_function(
            format!("sandbox setup failed: {e}"),
            "Retry the request.",
        ));
    }

    let deadline = Instant::now() + limits.timeout;
    if let Err(e) = bridge::install(&lua, store, deadline, limits.max_search_limit) {
        return Err(RuntimeError::host_function(
            format!("host bridge installation failed: {e}"),
            "Retry the request.",
        ));
    }

    let tripped = Arc::new(AtomicU8::new(TRIP_NONE));
    let executed = Arc::new(AtomicU64::new(0));
    let budget = limits.instruction_budget;
    let hook_tripped = tripped.clone();
    let hook_executed = executed.clone();
    lua.set_hook(
        HookTriggers {
            every_nth_instruction: Some(HOOK_INTERVAL as u32),
            ..Default::default()
        },
        move |_lua, _debug| {
            // Once a limit has tripped, re-raise on every trigger so a
            // pcall cannot swallow it and keep running
            let state = hook_tripped.load(Ordering::Relaxed);
            if state != TRIP_NONE {
                return Err(mlua::Error::RuntimeError("resource limit exceeded".to_string()));
            }
            // Deadline outranks the instruction budget when both trip in
            // the same window
            if Instant::now() >= deadline {
                hook_tripped.store(TRIP_DEADLINE, Ordering::Relaxed);
                return Err(mlua::Error::RuntimeError("execution deadline reached".to_string()));
            }
            let total = hook_executed.fetch_add(HOOK_INTERVAL, Ordering::Relaxed) + HOOK_INTERVAL;
            if total > budget {
                hook_tripped.store(TRIP_INSTRUCTIONS, Ordering::Relaxed);
                return Err(mlua::Error::RuntimeError("instruction budget exhausted".to_string()));
            }
            Ok(())
        },
    );

    let outcome = lua
        .load(source)
        .set_name("script")
        .eval::<MultiValue>();
    lua.remove_hook();

    let values = match outcome {
        Ok(values) => values,
        Err(e) => return Err(classify(&e, tripped.load(Ordering::Relaxed), limits)),
    };

    debug!(
        "script completed: {} instruction windows, {} return values",
        executed.load(Ordering::Relaxed) / HOOK_INTERVAL,
        values.len()
    );

    if values.len() > 1 {
        return Err(RuntimeError::host_function(
            format!("script returned {} values", values.len()),
            "Return a single value; wrap multiple results in a table.",
        ));
    }
    let value = values.into_iter().next().unwrap_or(mlua::Value::Nil);
    bridge::lua_to_json(value).map_err(|e| classify(&e, TRIP_NONE, limits))
}

fn prepare(lua: &Lua, limits: &ResourceLimits) -> mlua::Result<()> {
    lua.set_memory_limit(limits.memory_limit_bytes)?;
    let globals = lua.globals();
    for name in SCRUBBED_GLOBALS {
        globals.set(*name, mlua::Nil)?;
    }
    Ok(())
}

/// Maps a VM error to its diagnosis. The trip flag wins, then bridge
/// errors recovered from the callback chain, then the VM's own memory
/// error, and anything left is the script's own error.
fn classify(error: &mlua::Error, tripped: u8, limits: &ResourceLimits) -> RuntimeError {
    match tripped {
        TRIP_DEADLINE => return RuntimeError::timeout(limits.timeout),
        TRIP_INSTRUCTIONS => return RuntimeError::instruction_limit(limits.instruction_budget),
        _ => {}
    }
    if let Some(bridge_error) = find_bridge_error(error) {
        return match bridge_error {
            BridgeError::Timeout => RuntimeError::timeout(limits.timeout),
            BridgeError::HostFunction { message, suggestion } => {
                RuntimeError::host_function(message.clone(), suggestion.clone())
            }
        };
    }
    if is_memory_error(error) {
        return RuntimeError::memory_limit(limits.memory_limit_bytes);
    }
    script_failure(error)
}

fn is_memory_error(error: &mlua::Error) -> bool {
    match error {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        mlua::Error::WithContext { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

fn script_failure(error: &mlua::Error) -> RuntimeError {
    match error {
        mlua::Error::CallbackError { traceback, cause } => {
            RuntimeError::script_error(cause.to_string(), parse_traceback(traceback))
        }
        mlua::Error::RuntimeError(message) => match message.find("stack traceback:") {
            Some(idx) => {
                let (head, tail) = message.split_at(idx);
                RuntimeError::script_error(head.trim().to_string(), parse_traceback(tail))
            }
            None => RuntimeError::script_error(message.trim().to_string(), None),
        },
        other => RuntimeError::script_error(other.to_string(), None),
    }
}

/// Keeps the script-level frames of a Lua traceback, dropping the header
/// and C-function frames that mean nothing to a script author.
fn parse_traceback(traceback: &str) -> Option<Vec<String>> {
    let frames: Vec<String> = traceback
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| *line != "stack traceback:")
        .filter(|line| !line.contains("[C]"))
        .map(str::to_string)
        .collect();
    if frames.is_empty() {
        None
    } else {
        Some(frames)
    }
}
