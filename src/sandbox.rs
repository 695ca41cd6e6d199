//! Pod-side execution sandbox.
//!
//! This is the code that runs inside a pod: a [`PodInstance`] executes code through a
//! pluggable [`Interpreter`] and keeps per-scope bindings in a [`ScopeTable`]. It is served
//! to the fleet manager with [`crate::channel::tcp_channel::connect_pod`]; the
//! `podfleet-pod` binary does that with a [`ScriptInterpreter`].

pub mod pod_instance;
pub mod scope_table;
pub mod script_interpreter;

pub use pod_instance::{Interpreter, PodInstance};
pub use scope_table::ScopeTable;
pub use script_interpreter::{read_preload, Language, ScriptInterpreter};
