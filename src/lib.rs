//! Sandboxed Lua query engine over a persistent agent memory store.
//!
//! An agent submits untrusted Lua source. The engine validates it statically,
//! runs it in a fresh capability-restricted interpreter under hard resource
//! ceilings, and returns either the computed value or a structured
//! diagnostic (kind + message + suggestion) the agent can act on.
//!
//! Pipeline: [`Validator`] → [`sandbox`] → [`outcome::marshal`].
//! The only names reachable from a script are `search(collection, query,
//! limit)`, `json.encode(value)`, `json.decode(string)`, and a small set of
//! pure standard utilities.

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod outcome;
pub mod sandbox;
pub mod store;
pub mod validator;

pub use config::Config;
pub use diagnostics::{RuntimeError, ValidationError, ValidationResult};
pub use engine::Engine;
pub use outcome::{ExecutionOutcome, StructuredResult};
pub use sandbox::ResourceLimits;
pub use store::{MemoryRecord, MemoryStore};
pub use validator::Validator;
