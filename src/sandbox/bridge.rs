//! Host bridge: the only surface a sandboxed script can reach.
//!
//! Installs `search(collection, text, limit)` plus a `json` table with
//! `encode`/`decode`. Bridge failures travel through the Lua VM as
//! [`BridgeError`] so the runner can recover the original classification
//! instead of a stringified Lua error.

use crate::store::{MemoryStore, QueryError};
use mlua::{Lua, Table, Value as LuaValue};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{message}")]
    HostFunction { message: String, suggestion: String },
    #[error("execution deadline reached during a host call")]
    Timeout,
}

impl From<BridgeError> for mlua::Error {
    fn from(e: BridgeError) -> Self {
        mlua::Error::ExternalError(Arc::new(e))
    }
}

/// Recovers a [`BridgeError`] from an error the VM has wrapped, however
/// deeply. Lua callbacks nest causes, so this walks the chain.
pub fn find_bridge_error(error: &mlua::Error) -> Option<&BridgeError> {
    match error {
        mlua::Error::CallbackError { cause, .. } => find_bridge_error(cause),
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<BridgeError>(),
        mlua::Error::WithContext { cause, .. } => find_bridge_error(cause),
        _ => None,
    }
}

fn host_error(message: impl Into<String>, suggestion: impl Into<String>) -> mlua::Error {
    BridgeError::HostFunction {
        message: message.into(),
        suggestion: suggestion.into(),
    }
    .into()
}

fn expect_string(value: &LuaValue, what: &str) -> Result<String, mlua::Error> {
    match value {
        LuaValue::String(s) => Ok(s.to_str()?.to_string()),
        other => Err(host_error(
            format!("search {what} must be a string, got {}", other.type_name()),
            "Call search('collection', 'query text', limit).",
        )),
    }
}

/// Registers the host functions on the VM's globals.
///
/// `deadline` is checked on entry to every host call: instruction hooks do
/// not fire while the VM is inside Rust, so the bridge enforces the
/// wall-clock budget itself and threads the deadline into the store scan.
pub fn install(
    lua: &Lua,
    store: Arc<MemoryStore>,
    deadline: Instant,
    max_search_limit: usize,
) -> mlua::Result<()> {
    let globals = lua.globals();

    let search_store = store.clone();
    // Arguments arrive untyped; the bridge does its own checking so a
    // wrong-typed call reports a host error with a hint instead of a raw
    // conversion failure
    let search = lua.create_function(move |lua, args: (LuaValue, LuaValue, LuaValue)| {
        if Instant::now() >= deadline {
            return Err(BridgeError::Timeout.into());
        }
        let collection = expect_string(&args.0, "collection")?;
        let text = expect_string(&args.1, "query")?;
        let limit = match args.2 {
            LuaValue::Integer(i) => i,
            LuaValue::Number(n) if n.fract() == 0.0 => n as i64,
            other => {
                return Err(host_error(
                    format!(
                        "search limit must be a whole number, got {}",
                        other.type_name()
                    ),
                    format!("Pass a limit between 1 and {max_search_limit}."),
                ))
            }
        };
        if limit < 1 || limit as usize > max_search_limit {
            return Err(host_error(
                format!("search limit {limit} is out of range"),
                format!("Pass a limit between 1 and {max_search_limit}."),
            ));
        }
        let records = search_store
            .query(&collection, &text, limit as usize, Some(deadline))
            .map_err(|e| match e {
                QueryError::UnknownCollection { name, available } => host_error(
                    format!("collection '{name}' does not exist"),
                    if available.is_empty() {
                        "No collections exist yet; create one before querying.".to_string()
                    } else {
                        format!("Available collections: {}.", available.join(", "))
                    },
                ),
                QueryError::Interrupted => BridgeError::Timeout.into(),
            })?;

        let results = lua.create_table()?;
        for (i, record) in records.iter().enumerate() {
            let json = serde_json::to_value(record)
                .map_err(|e| host_error(format!("result serialization failed: {e}"), "Retry the request."))?;
            results.set(i + 1, json_to_lua(lua, &json)?)?;
        }
        Ok(results)
    })?;
    globals.set("search", search)?;

    let json_table: Table = lua.create_table()?;
    json_table.set(
        "encode",
        lua.create_function(|_, value: LuaValue| {
            let json = lua_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| host_error(format!("json.encode failed: {e}"), "Encode plain tables and scalars only."))
        })?,
    )?;
    json_table.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let json: JsonValue = serde_json::from_str(&text).map_err(|e| {
                host_error(
                    format!("json.decode failed: {e}"),
                    "Pass json.decode a string containing valid JSON.",
                )
            })?;
            json_to_lua(lua, &json)
        })?,
    )?;
    globals.set("json", json_table)?;

    Ok(())
}

// ── value conversion ────────────────────────────────────────────────────

/// Deepest nesting either conversion will walk. Matches serde_json's own
/// decode recursion limit; past it the value is reported as a host error
/// instead of recursing toward a stack overflow.
const MAX_VALUE_DEPTH: usize = 128;

/// Converts a Lua value into JSON. A table with consecutive integer keys
/// from 1 becomes an array; any other table becomes an object with
/// stringified keys. Functions and other VM-internal values are rejected
/// rather than silently dropped.
pub fn lua_to_json(value: LuaValue) -> Result<JsonValue, mlua::Error> {
    lua_to_json_at(value, 0)
}

fn lua_to_json_at(value: LuaValue, depth: usize) -> Result<JsonValue, mlua::Error> {
    if depth > MAX_VALUE_DEPTH {
        return Err(host_error(
            "value is nested too deeply",
            "Return flatter data structures.",
        ));
    }
    match value {
        LuaValue::Nil => Ok(JsonValue::Null),
        LuaValue::Boolean(b) => Ok(JsonValue::Bool(b)),
        LuaValue::Integer(i) => Ok(JsonValue::from(i)),
        LuaValue::Number(n) => {
            if n.is_finite() {
                Ok(serde_json::Number::from_f64(n)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null))
            } else {
                Err(host_error(
                    "cannot represent NaN or infinity in a result",
                    "Return finite numbers only.",
                ))
            }
        }
        LuaValue::String(s) => Ok(JsonValue::String(s.to_str()?.to_string())),
        LuaValue::Table(table) => {
            let len = table.raw_len();
            // Array when keys are exactly 1..=len
            let mut key_count = 0usize;
            let mut is_array = true;
            for pair in table.clone().pairs::<LuaValue, LuaValue>() {
                let (key, _) = pair?;
                key_count += 1;
                match key {
                    LuaValue::Integer(i) if i >= 1 && (i as usize) <= len => {}
                    _ => is_array = false,
                }
            }
            if is_array && key_count == len {
                let mut array = Vec::with_capacity(len);
                for i in 1..=len {
                    array.push(lua_to_json_at(table.get(i)?, depth + 1)?);
                }
                Ok(JsonValue::Array(array))
            } else {
                let mut object = serde_json::Map::new();
                for pair in table.pairs::<LuaValue, LuaValue>() {
                    let (key, value) = pair?;
                    let key = match key {
                        LuaValue::String(s) => s.to_str()?.to_string(),
                        LuaValue::Integer(i) => i.to_string(),
                        LuaValue::Number(n) => n.to_string(),
                        LuaValue::Boolean(b) => b.to_string(),
                        other => {
                            return Err(host_error(
                                format!("table key of type {} cannot become a JSON key", other.type_name()),
                                "Use string or number table keys in returned tables.",
                            ))
                        }
                    };
                    object.insert(key, lua_to_json_at(value, depth + 1)?);
                }
                Ok(JsonValue::Object(object))
            }
        }
        other => Err(host_error(
            format!("a {} cannot be part of a result", other.type_name()),
            "Return nil, booleans, numbers, strings, or tables of those.",
        )),
    }
}

pub fn json_to_lua<'lua>(lua: &'lua Lua, json: &JsonValue) -> mlua::Result<LuaValue<'lua>> {
    json_to_lua_at(lua, json, 0)
}

fn json_to_lua_at<'lua>(
    lua: &'lua Lua,
    json: &JsonValue,
    depth: usize,
) -> mlua::Result<LuaValue<'lua>> {
    if depth > MAX_VALUE_DEPTH {
        return Err(host_error(
            "value is nested too deeply",
            "Decode flatter data structures.",
        ));
    }
    match json {
        JsonValue::Null => Ok(LuaValue::Nil),
        JsonValue::Bool(b) => Ok(LuaValue::Boolean(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        JsonValue::String(s) => Ok(LuaValue::String(lua.create_string(s)?)),
        JsonValue::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.set(i + 1, json_to_lua_at(lua, item, depth + 1)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        JsonValue::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (key, value) in map {
                table.set(key.as_str(), json_to_lua_at(lua, value, depth + 1)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_to_json(source: &str) -> Result<JsonValue, mlua::Error> {
        let lua = Lua::new();
        let value: LuaValue = lua.load(source).eval()?;
        lua_to_json(value)
    }

    #[test]
    fn test_scalars_round_trip() {
        assert_eq!(eval_to_json("return nil").unwrap(), json!(null));
        assert_eq!(eval_to_json("return true").unwrap(), json!(true));
        assert_eq!(eval_to_json("return 42").unwrap(), json!(42));
        assert_eq!(eval_to_json("return 1.5").unwrap(), json!(1.5));
        assert_eq!(eval_to_json("return 'hi'").unwrap(), json!("hi"));
    }

    #[test]
    fn test_sequential_table_becomes_array() {
        assert_eq!(eval_to_json("return {1, 2, 3}").unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_keyed_table_becomes_object() {
        assert_eq!(
            eval_to_json("return {name = 'ada', score = 2}").unwrap(),
            json!({"name": "ada", "score": 2})
        );
    }

    #[test]
    fn test_mixed_table_becomes_object() {
        let value = eval_to_json("return {1, 2, extra = true}").unwrap();
        assert_eq!(value, json!({"1": 1, "2": 2, "extra": true}));
    }

    #[test]
    fn test_nested_structures() {
        assert_eq!(
            eval_to_json("return {list = {1, {inner = 'x'}}, empty = nil}").unwrap(),
            json!({"list": [1, {"inner": "x"}]})
        );
    }

    #[test]
    fn test_function_value_rejected() {
        let err = eval_to_json("return function() end").unwrap_err();
        assert!(find_bridge_error(&err).is_some());
    }

    #[test]
    fn test_deeply_nested_table_rejected() {
        let err = eval_to_json("local t = {} for i = 1, 200 do t = {t} end return t").unwrap_err();
        match find_bridge_error(&err) {
            Some(BridgeError::HostFunction { message, .. }) => {
                assert!(message.contains("nested too deeply"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_nesting_within_limit_converts() {
        let value = eval_to_json("local t = {} for i = 1, 100 do t = {t} end return t").unwrap();
        assert!(value.is_array());
    }

    #[test]
    fn test_nan_rejected() {
        let err = eval_to_json("return 0/0").unwrap_err();
        assert!(find_bridge_error(&err).is_some());
    }

    #[test]
    fn test_json_to_lua_and_back() {
        let lua = Lua::new();
        let original = json!({"a": [1, 2.5, "three", null], "b": {"nested": true}});
        let lua_value = json_to_lua(&lua, &original).unwrap();
        let round_tripped = lua_to_json(lua_value).unwrap();
        assert_eq!(round_tripped, original);
    }

    #[test]
    fn test_find_bridge_error_unwraps_callback_nesting() {
        let inner: mlua::Error = BridgeError::Timeout.into();
        let wrapped = mlua::Error::CallbackError {
            traceback: "stack traceback: ...".to_string(),
            cause: Arc::new(inner),
        };
        assert!(matches!(
            find_bridge_error(&wrapped),
            Some(BridgeError::Timeout)
        ));
    }
}
