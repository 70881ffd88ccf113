//! In-memory plan model
//!
//! A plan is a set of named pipes. Each pipe is a directed graph of
//! processes wired together by typed ports, with variables providing the
//! inputs and outputs at the boundary. Nodes are kept sorted by name and
//! links sorted by destination so all lookups are binary searches.

pub mod serde;

use ::serde::Deserialize;
use std::fmt;

pub use self::serde::{ParseError, parse, parse_str};

/// Value type carried by a port: a byte stream or a constant string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Stream,
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Stream => write!(f, "stream"),
            ValueType::String => write!(f, "string"),
        }
    }
}

/// A named, typed endpoint on a node
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Port {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
}

/// Which side of a node declares a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDir {
    In,
    Out,
}

/// Common shape of processes and variables: a name plus ordered port lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default, rename = "in")]
    pub inputs: Vec<Port>,
    #[serde(default, rename = "out")]
    pub outputs: Vec<Port>,
}

impl Node {
    /// Linear scan over input ports then output ports
    pub fn find_port(&self, name: &str) -> Option<(&Port, PortDir)> {
        if let Some(port) = self.inputs.iter().find(|p| p.name == name) {
            return Some((port, PortDir::In));
        }
        if let Some(port) = self.outputs.iter().find(|p| p.name == name) {
            return Some((port, PortDir::Out));
        }
        None
    }
}

/// One argument in a process's argument template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Passed through to the command line unchanged
    Literal(String),
    /// Placeholder for a port of the same process, replaced at wire-up time
    /// with either a pipe endpoint path or the string flowing through it
    Port(String),
}

/// A node bound to an executable and an argument template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub node: Node,
    pub exe: String,
    pub args: Vec<Arg>,
}

/// A single-ported node naming an input to or output from the graph
///
/// A variable with an input port is a sink produced by the graph; one with
/// an output port is a source consumed by it. Its type is its port's type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Variable {
    #[serde(flatten)]
    pub node: Node,
    #[serde(default)]
    pub default: String,
}

impl Variable {
    /// The variable's single port, whichever side declares it
    pub fn port(&self) -> Option<&Port> {
        self.node.inputs.first().or_else(|| self.node.outputs.first())
    }

    /// The inbound port, present only on sink variables
    pub fn input(&self) -> Option<&Port> {
        self.node.inputs.first()
    }

    pub fn value_type(&self) -> Option<ValueType> {
        self.port().map(|p| p.ty)
    }

    pub fn has_default(&self) -> bool {
        !self.default.is_empty()
    }
}

/// A `(node, port)` pair identifying one link endpoint
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct Ref {
    pub node: String,
    pub port: String,
}

impl Ref {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.port)
    }
}

/// A directed edge between two refs; all edges in a pipe are distinct by dst
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Link {
    pub src: Ref,
    pub dst: Ref,
}

/// One named dataflow graph within a plan
#[derive(Debug, Clone, Default)]
pub struct Pipe {
    pub name: String,
    pub procs: Vec<Process>,
    pub vars: Vec<Variable>,
    pub links: Vec<Link>,
}

fn find_by_name<'a, T>(items: &'a [T], name: &str, key: impl Fn(&T) -> &str) -> Option<&'a T> {
    items
        .binary_search_by(|item| key(item).cmp(name))
        .ok()
        .map(|i| &items[i])
}

impl Pipe {
    /// Sort processes and variables by name and links by destination.
    ///
    /// Must be called before any `find_*` lookup. The parser normalizes
    /// pipes on load; programmatic constructors call this themselves.
    pub fn normalize(&mut self) {
        self.procs.sort_by(|a, b| a.node.name.cmp(&b.node.name));
        self.vars.sort_by(|a, b| a.node.name.cmp(&b.node.name));
        self.links.sort_by(|a, b| a.dst.cmp(&b.dst));
    }

    pub fn find_proc(&self, name: &str) -> Option<&Process> {
        find_by_name(&self.procs, name, |p| &p.node.name)
    }

    pub fn find_var(&self, name: &str) -> Option<&Variable> {
        find_by_name(&self.vars, name, |v| &v.node.name)
    }

    /// Look up the unique link arriving at `dst`
    pub fn find_link(&self, dst: &Ref) -> Option<&Link> {
        self.links
            .binary_search_by(|link| link.dst.cmp(dst))
            .ok()
            .map(|i| &self.links[i])
    }
}
