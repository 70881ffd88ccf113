//! Dataflow runtime that wires OS processes together with typed kernel pipes
//!
//! A plan describes named pipes: directed graphs of processes connected by
//! typed ports, with variables supplying inputs and outputs at the boundary.
//! The runtime compiles a pipe into a `Program`, materializing stream edges
//! as anonymous kernel pipes and string edges as argument values while
//! typechecking all the wiring, and then supervises the resulting OS
//! processes to completion. Payload bytes move between the children over
//! their pipes; the runtime itself carries none.
//!
//! # Architecture
//!
//! - **Plan model** (`plan`): immutable pipe description with sorted-vector
//!   lookups, plus the JSON reader
//! - **Graph compiler** (`runtime::build`): six ordered passes from plan to
//!   executable program
//! - **Supervisor** (`runtime::program`): one worker thread per process,
//!   descriptor ownership and close propagation, cancellation
//!
//! # Example
//!
//! ```no_run
//! use hoser::Program;
//! use std::collections::BTreeMap;
//! use std::fs::File;
//!
//! let pipes = hoser::plan::parse(File::open("plan.json")?)?;
//! let mut program = Program::build(&pipes[0], BTreeMap::new())?;
//! program.start();
//! let _codes = program.wait();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod plan;
pub mod runtime;

pub use plan::{
    Arg, Link, Node, ParseError, Pipe, Port, PortDir, Process, Ref, ValueType, Variable,
};
pub use runtime::{
    BuildError, CancelHandle, CommandSpec, LinkId, LinkInstance, ProcessInstance, Program, Value,
    VariableInstance,
};
