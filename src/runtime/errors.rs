//! Compile-time error types for the graph compiler
//!
//! Compilation surfaces a single failure: the first fault found by the
//! pass that reaches it. Run-time faults (spawn failures, nonzero exits)
//! are logged by the supervisor, never raised as errors.

use crate::plan::{Ref, ValueType};
use std::io;

/// Why a plan could not be compiled into a runnable program
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("link endpoint {0} names a node that does not exist")]
    UnresolvedRef(Ref),

    #[error("port '{port}' is not declared on node '{node}'")]
    UnknownPort { node: String, port: String },

    #[error("mismatched type {src_ty}->{dst_ty} for ports {src} -> {dst}")]
    TypeMismatch {
        src_ty: ValueType,
        dst_ty: ValueType,
        src: Ref,
        dst: Ref,
    },

    #[error("duplicate link destination {0}")]
    DuplicateLink(Ref),

    #[error("variable-to-variable link {src} -> {dst} is not allowed")]
    VariableToVariable { src: Ref, dst: Ref },

    #[error("preset for variable '{name}' is not a {expected}")]
    BindTypeMismatch { name: String, expected: ValueType },

    #[error("variable '{0}' is unbound, must preset value")]
    UnboundVariable(String),

    #[error("argument port '{port}' of process '{proc}' is not wired")]
    UnwiredArg { proc: String, port: String },

    #[error("argument port '{port}' of process '{proc}' cannot pass a {ty} output")]
    UnsupportedArg {
        proc: String,
        port: String,
        ty: ValueType,
    },

    #[error("create pipe for link {src} -> {dst}: {source}")]
    PipeCreationFailed {
        src: Ref,
        dst: Ref,
        source: io::Error,
    },

    #[error("open '{path}' for variable '{name}': {source}")]
    FileOpenFailed {
        name: String,
        path: String,
        source: io::Error,
    },

    #[error("bind variable '{name}': {source}")]
    BindFailed { name: String, source: io::Error },
}
