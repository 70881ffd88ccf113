//! Runtime support: graph compiler and process supervisor

pub mod build;
pub mod errors;
pub mod program;

pub use errors::BuildError;
pub use program::{
    CancelHandle, CommandSpec, LinkId, LinkInstance, ProcessInstance, Program, Value,
    VariableInstance,
};
