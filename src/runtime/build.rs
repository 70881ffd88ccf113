//! Graph compiler: transforms a plan pipe into an executable `Program`
//!
//! The program is built bottom-up over a series of ordered passes:
//!
//! 1. instantiate every process and variable
//! 2. connect each process's input ports to their inbound links
//! 3. connect each sink variable to its inbound link
//! 4. bind variable values, presets first and then plan defaults
//! 5. create one kernel pipe per process-to-process stream link
//! 6. build each process's command descriptor
//!
//! Each pass reads what earlier passes wrote and never overwrites it.
//! Compilation stops at the first fault.

use crate::plan::{self, Arg, PortDir, Ref, ValueType};
use crate::runtime::errors::BuildError;
use crate::runtime::program::{
    CommandSpec, LinkId, LinkInstance, ProcessInstance, Program, Value, VariableInstance,
};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::debug;

/// Executable name reserved for self-invocation in nested plans
const SELF_EXE: &str = "hoser";

const FILE_PREFIX: &str = "file://";

impl Program {
    /// Compile `pipe` into a runnable program.
    ///
    /// `presets` maps variable names to caller-supplied values; entries
    /// without a matching variable are ignored. The pipe must have been
    /// normalized (the parser does this on load).
    pub fn build(
        pipe: &plan::Pipe,
        presets: BTreeMap<String, Value>,
    ) -> Result<Program, BuildError> {
        check_links(pipe)?;

        // Pass 1: instantiate nodes
        let mut procs = BTreeMap::new();
        for proc in &pipe.procs {
            procs.insert(
                proc.node.name.clone(),
                ProcessInstance {
                    plan: proc.clone(),
                    links: HashMap::new(),
                    cmd: None,
                },
            );
        }
        let mut vars = BTreeMap::new();
        for var in &pipe.vars {
            vars.insert(
                var.node.name.clone(),
                VariableInstance {
                    plan: var.clone(),
                    input: None,
                    output: None,
                    value: None,
                },
            );
        }
        let mut links: Vec<LinkInstance> = Vec::new();

        // Pass 2: connect process inputs
        for proc in &pipe.procs {
            connect_proc(pipe, proc, &mut procs, &mut vars, &mut links)?;
        }

        // Pass 3: connect variable sinks
        for var in &pipe.vars {
            connect_var(pipe, var, &mut procs, &mut vars, &mut links)?;
        }

        // Pass 4: bind preset then default values; every variable must end
        // up bound
        for (name, value) in presets {
            if let Some(var) = vars.get_mut(&name) {
                var.bind(value, &mut links)?;
            }
        }
        for (name, var) in vars.iter_mut() {
            bind_default(var, &mut links)?;
            if var.value.is_none() {
                return Err(BuildError::UnboundVariable(name.clone()));
            }
        }

        // Pass 5: materialize process-to-process stream pipes. Iterating
        // by dst creates each shared link's pipe exactly once.
        for (name, proc_inst) in &procs {
            for &id in proc_inst.links.values() {
                let link = &mut links[id];
                if link.ty == ValueType::Stream
                    && link.dst.node == *name
                    && link.read.is_none()
                    && procs.contains_key(&link.src.node)
                {
                    let (rd, wr) =
                        os_pipe::pipe().map_err(|source| BuildError::PipeCreationFailed {
                            src: link.src.clone(),
                            dst: link.dst.clone(),
                            source,
                        })?;
                    link.read = Some(OwnedFd::from(rd));
                    link.write = Some(OwnedFd::from(wr));
                    debug!("pipe {} -> {}", link.src, link.dst);
                }
            }
        }

        // Pass 6: build command descriptors
        let names: Vec<String> = procs.keys().cloned().collect();
        for name in names {
            let spec = build_cmd(&procs[&name], &links)?;
            procs
                .get_mut(&name)
                .expect("process vanished between passes")
                .cmd = Some(spec);
        }

        Ok(Program::from_parts(procs, vars, links))
    }
}

/// Validate the link table: every dst must name an existing input-side
/// port, and no two links may share a destination.
fn check_links(pipe: &plan::Pipe) -> Result<(), BuildError> {
    for link in &pipe.links {
        let dst_node = if let Some(proc) = pipe.find_proc(&link.dst.node) {
            &proc.node
        } else if let Some(var) = pipe.find_var(&link.dst.node) {
            &var.node
        } else {
            return Err(BuildError::UnresolvedRef(link.dst.clone()));
        };
        match dst_node.find_port(&link.dst.port) {
            Some((_, PortDir::In)) => {}
            _ => {
                return Err(BuildError::UnknownPort {
                    node: link.dst.node.clone(),
                    port: link.dst.port.clone(),
                });
            }
        }
    }
    for pair in pipe.links.windows(2) {
        if pair[0].dst == pair[1].dst {
            return Err(BuildError::DuplicateLink(pair[0].dst.clone()));
        }
    }
    Ok(())
}

/// Connect every wired input port of `proc`, registering the shared link
/// instance on both endpoints and typechecking the connection.
fn connect_proc(
    pipe: &plan::Pipe,
    proc: &plan::Process,
    procs: &mut BTreeMap<String, ProcessInstance>,
    vars: &mut BTreeMap<String, VariableInstance>,
    links: &mut Vec<LinkInstance>,
) -> Result<(), BuildError> {
    let dst_name = &proc.node.name;
    for in_port in &proc.node.inputs {
        let dst_ref = Ref::new(dst_name.clone(), in_port.name.clone());
        let Some(link) = pipe.find_link(&dst_ref) else {
            continue; // unwired port
        };

        let id: LinkId = links.len();
        links.push(LinkInstance::new(
            in_port.ty,
            link.src.clone(),
            link.dst.clone(),
        ));
        procs
            .get_mut(dst_name)
            .expect("destination instantiated in pass 1")
            .links
            .insert(in_port.name.clone(), id);

        let src_port = if let Some(src) = pipe.find_proc(&link.src.node) {
            let (port, _) = src.node.find_port(&link.src.port).ok_or_else(|| {
                BuildError::UnknownPort {
                    node: link.src.node.clone(),
                    port: link.src.port.clone(),
                }
            })?;
            procs
                .get_mut(&link.src.node)
                .expect("source instantiated in pass 1")
                .links
                .insert(link.src.port.clone(), id);
            port
        } else if let Some(src) = pipe.find_var(&link.src.node) {
            let (port, _) = src.node.find_port(&link.src.port).ok_or_else(|| {
                BuildError::UnknownPort {
                    node: link.src.node.clone(),
                    port: link.src.port.clone(),
                }
            })?;
            vars.get_mut(&link.src.node)
                .expect("source instantiated in pass 1")
                .output = Some(id);
            port
        } else {
            return Err(BuildError::UnresolvedRef(link.src.clone()));
        };

        if src_port.ty != in_port.ty {
            return Err(BuildError::TypeMismatch {
                src_ty: src_port.ty,
                dst_ty: in_port.ty,
                src: link.src.clone(),
                dst: link.dst.clone(),
            });
        }
    }
    Ok(())
}

/// Connect a sink variable to its inbound link. Sinks must be produced by
/// a process, never by another variable.
fn connect_var(
    pipe: &plan::Pipe,
    var: &plan::Variable,
    procs: &mut BTreeMap<String, ProcessInstance>,
    vars: &mut BTreeMap<String, VariableInstance>,
    links: &mut Vec<LinkInstance>,
) -> Result<(), BuildError> {
    let Some(in_port) = var.input() else {
        return Ok(()); // source variables are connected from the consumer side
    };
    let dst_ref = Ref::new(var.node.name.clone(), in_port.name.clone());
    let Some(link) = pipe.find_link(&dst_ref) else {
        return Ok(());
    };

    let id: LinkId = links.len();
    links.push(LinkInstance::new(
        in_port.ty,
        link.src.clone(),
        link.dst.clone(),
    ));
    vars.get_mut(&var.node.name)
        .expect("sink instantiated in pass 1")
        .input = Some(id);

    if let Some(src) = pipe.find_proc(&link.src.node) {
        let (src_port, _) = src.node.find_port(&link.src.port).ok_or_else(|| {
            BuildError::UnknownPort {
                node: link.src.node.clone(),
                port: link.src.port.clone(),
            }
        })?;
        procs
            .get_mut(&link.src.node)
            .expect("source instantiated in pass 1")
            .links
            .insert(link.src.port.clone(), id);
        if src_port.ty != in_port.ty {
            return Err(BuildError::TypeMismatch {
                src_ty: src_port.ty,
                dst_ty: in_port.ty,
                src: link.src.clone(),
                dst: link.dst.clone(),
            });
        }
        Ok(())
    } else if pipe.find_var(&link.src.node).is_some() {
        Err(BuildError::VariableToVariable {
            src: link.src.clone(),
            dst: link.dst.clone(),
        })
    } else {
        Err(BuildError::UnresolvedRef(link.src.clone()))
    }
}

/// Bind a still-unbound variable from its plan default: `file://` paths
/// open as read/write streams, non-empty literals bind string variables.
fn bind_default(
    var: &mut VariableInstance,
    links: &mut [LinkInstance],
) -> Result<(), BuildError> {
    if var.value.is_some() {
        return Ok(()); // already set by preset
    }
    match var.plan.value_type() {
        Some(ValueType::Stream) => {
            if let Some(path) = var.plan.default.strip_prefix(FILE_PREFIX) {
                let path = path.to_string();
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|source| BuildError::FileOpenFailed {
                        name: var.plan.node.name.clone(),
                        path: path.clone(),
                        source,
                    })?;
                var.bind(Value::Stream(OwnedFd::from(file)), links)?;
            }
            Ok(())
        }
        Some(ValueType::String) => {
            if var.plan.has_default() {
                let default = var.plan.default.clone();
                var.bind(Value::String(default), links)?;
            }
            Ok(())
        }
        None => Ok(()),
    }
}

fn dev_fd_path(fd: &OwnedFd) -> String {
    format!("/dev/fd/{}", fd.as_raw_fd())
}

/// Compose the command descriptor for one process: resolve the executable,
/// substitute port references in the argument template, and record the
/// standard-stream wiring.
fn build_cmd(
    proc_inst: &ProcessInstance,
    links: &[LinkInstance],
) -> Result<CommandSpec, BuildError> {
    let proc = &proc_inst.plan;
    let mut args = Vec::with_capacity(proc.args.len());
    let mut inherit = Vec::new();

    for arg in &proc.args {
        match arg {
            Arg::Literal(s) => args.push(s.clone()),
            Arg::Port(port_name) => {
                let (port, dir) =
                    proc.node
                        .find_port(port_name)
                        .ok_or_else(|| BuildError::UnknownPort {
                            node: proc.node.name.clone(),
                            port: port_name.clone(),
                        })?;
                let unwired = || BuildError::UnwiredArg {
                    proc: proc.node.name.clone(),
                    port: port_name.clone(),
                };
                let link = proc_inst
                    .links
                    .get(port_name)
                    .map(|&id| &links[id])
                    .ok_or_else(unwired)?;
                match (dir, port.ty) {
                    (PortDir::In, ValueType::Stream) => {
                        let fd = link.read.as_ref().ok_or_else(unwired)?;
                        args.push(dev_fd_path(fd));
                        inherit.push(fd.as_raw_fd());
                    }
                    (PortDir::In, ValueType::String) => {
                        args.push(link.value.clone().ok_or_else(unwired)?);
                    }
                    (PortDir::Out, ValueType::Stream) => {
                        let fd = link.write.as_ref().ok_or_else(unwired)?;
                        args.push(dev_fd_path(fd));
                        inherit.push(fd.as_raw_fd());
                    }
                    (PortDir::Out, ValueType::String) => {
                        return Err(BuildError::UnsupportedArg {
                            proc: proc.node.name.clone(),
                            port: port_name.clone(),
                            ty: port.ty,
                        });
                    }
                }
            }
        }
    }

    let exe = if proc.exe == SELF_EXE {
        env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| proc.exe.clone())
    } else {
        proc.exe.clone()
    };

    let stdio = |port: &str, read_side: bool| {
        proc_inst.links.get(port).copied().filter(|&id| {
            if read_side {
                links[id].read.is_some()
            } else {
                links[id].write.is_some()
            }
        })
    };

    Ok(CommandSpec {
        exe,
        args,
        stdin: stdio("stdin", true),
        stdout: stdio("stdout", false),
        stderr: stdio("stderr", false),
        inherit,
    })
}
