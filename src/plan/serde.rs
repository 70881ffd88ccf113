//! JSON plan reader
//!
//! A plan file is a JSON array of pipes. Each process argument is either a
//! string literal or an object `{"name": "port"}` referring to a port of
//! the enclosing process:
//!
//! ```json
//! [{
//!   "name": "copy",
//!   "procs": [{
//!     "name": "cat",
//!     "in": [{"name": "stdin", "type": "stream"}],
//!     "out": [{"name": "stdout", "type": "stream"}],
//!     "exe": "cat",
//!     "args": []
//!   }],
//!   "vars": [
//!     {"name": "stdin", "out": [{"name": "value", "type": "stream"}], "default": ""},
//!     {"name": "stdout", "in": [{"name": "value", "type": "stream"}], "default": ""}
//!   ],
//!   "links": [
//!     {"src": {"node": "stdin", "port": "value"}, "dst": {"node": "cat", "port": "stdin"}},
//!     {"src": {"node": "cat", "port": "stdout"}, "dst": {"node": "stdout", "port": "value"}}
//!   ]
//! }]
//! ```
//!
//! Pipes are normalized (sorted for lookup) on load.

use super::{Arg, Link, Node, Pipe, Process, Variable};
use serde::Deserialize;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid plan: {0}")]
    Json(#[from] serde_json::Error),

    #[error("port '{port}' is not a port of process '{process}'")]
    UnknownPort { process: String, port: String },

    #[error("variable '{0}' must declare exactly one port")]
    BadVariable(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawArg {
    Literal(String),
    Port { name: String },
}

#[derive(Deserialize)]
struct RawProcess {
    #[serde(flatten)]
    node: Node,
    exe: String,
    #[serde(default)]
    args: Vec<RawArg>,
}

#[derive(Deserialize)]
struct RawPipe {
    #[serde(default)]
    name: String,
    #[serde(default)]
    procs: Vec<RawProcess>,
    #[serde(default)]
    vars: Vec<Variable>,
    #[serde(default)]
    links: Vec<Link>,
}

/// Read a plan (a JSON array of pipes) from `r`
pub fn parse(r: impl io::Read) -> Result<Vec<Pipe>, ParseError> {
    let raw: Vec<RawPipe> = serde_json::from_reader(r)?;
    raw.into_iter().map(convert_pipe).collect()
}

/// Read a plan from a string slice
pub fn parse_str(s: &str) -> Result<Vec<Pipe>, ParseError> {
    let raw: Vec<RawPipe> = serde_json::from_str(s)?;
    raw.into_iter().map(convert_pipe).collect()
}

fn convert_pipe(raw: RawPipe) -> Result<Pipe, ParseError> {
    let mut pipe = Pipe {
        name: raw.name,
        procs: Vec::with_capacity(raw.procs.len()),
        vars: raw.vars,
        links: raw.links,
    };
    for proc in raw.procs {
        pipe.procs.push(convert_process(proc)?);
    }
    for var in &pipe.vars {
        if var.node.inputs.len() + var.node.outputs.len() != 1 {
            return Err(ParseError::BadVariable(var.node.name.clone()));
        }
    }
    pipe.normalize();
    Ok(pipe)
}

fn convert_process(raw: RawProcess) -> Result<Process, ParseError> {
    let mut args = Vec::with_capacity(raw.args.len());
    for arg in raw.args {
        match arg {
            RawArg::Literal(s) => args.push(Arg::Literal(s)),
            RawArg::Port { name } => {
                if raw.node.find_port(&name).is_none() {
                    return Err(ParseError::UnknownPort {
                        process: raw.node.name.clone(),
                        port: name,
                    });
                }
                args.push(Arg::Port(name));
            }
        }
    }
    Ok(Process {
        node: raw.node,
        exe: raw.exe,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Ref, ValueType};

    const COPY_PLAN: &str = r#"[{
        "name": "copy",
        "procs": [{
            "name": "cat",
            "in": [{"name": "stdin", "type": "stream"}],
            "out": [{"name": "stdout", "type": "stream"}],
            "exe": "cat",
            "args": []
        }],
        "vars": [
            {"name": "stdin", "out": [{"name": "value", "type": "stream"}], "default": ""},
            {"name": "stdout", "in": [{"name": "value", "type": "stream"}], "default": ""}
        ],
        "links": [
            {"src": {"node": "stdin", "port": "value"}, "dst": {"node": "cat", "port": "stdin"}},
            {"src": {"node": "cat", "port": "stdout"}, "dst": {"node": "stdout", "port": "value"}}
        ]
    }]"#;

    #[test]
    fn test_parse_copy_plan() {
        let pipes = parse_str(COPY_PLAN).unwrap();
        assert_eq!(pipes.len(), 1);

        let pipe = &pipes[0];
        assert_eq!(pipe.name, "copy");

        let cat = pipe.find_proc("cat").expect("cat process");
        assert_eq!(cat.exe, "cat");
        assert_eq!(cat.node.inputs[0].ty, ValueType::Stream);

        let stdin = pipe.find_var("stdin").expect("stdin variable");
        assert_eq!(stdin.value_type(), Some(ValueType::Stream));
        assert!(stdin.input().is_none());

        // normalized on load, so dst lookups work immediately
        let link = pipe
            .find_link(&Ref::new("cat", "stdin"))
            .expect("link into cat");
        assert_eq!(link.src, Ref::new("stdin", "value"));
    }

    #[test]
    fn test_parse_arg_forms() {
        let pipes = parse_str(
            r#"[{
                "name": "args",
                "procs": [{
                    "name": "p",
                    "in": [{"name": "in", "type": "string"}],
                    "out": [],
                    "exe": "echo",
                    "args": ["-n", {"name": "in"}]
                }]
            }]"#,
        )
        .unwrap();
        let p = pipes[0].find_proc("p").unwrap();
        assert_eq!(
            p.args,
            vec![
                Arg::Literal("-n".to_string()),
                Arg::Port("in".to_string())
            ]
        );
    }

    #[test]
    fn test_unknown_port_arg_rejected() {
        let err = parse_str(
            r#"[{
                "name": "bad",
                "procs": [{
                    "name": "p",
                    "in": [],
                    "out": [],
                    "exe": "echo",
                    "args": [{"name": "missing"}]
                }]
            }]"#,
        )
        .unwrap_err();
        match err {
            ParseError::UnknownPort { process, port } => {
                assert_eq!(process, "p");
                assert_eq!(port, "missing");
            }
            other => panic!("expected UnknownPort, got {other}"),
        }
    }

    #[test]
    fn test_variable_must_have_one_port() {
        let err = parse_str(
            r#"[{
                "name": "bad",
                "vars": [{"name": "v", "default": ""}]
            }]"#,
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::BadVariable(name) if name == "v"));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(parse_str("{not json"), Err(ParseError::Json(_))));
        // a plan must be an array of pipes
        assert!(matches!(parse_str(r#"{"name": "x"}"#), Err(ParseError::Json(_))));
    }
}
