//! Compiled program instances and the process supervisor
//!
//! A `Program` is the executable form of a plan: one instance per process
//! and variable, plus an arena of link instances shared by both endpoints.
//! `start()` spawns one worker thread per process; each worker launches
//! the child, waits for exit or cancellation, and closes the pipe ends its
//! process owns. Closing promptly is what lets downstream readers see EOF.

use crate::plan;
use crate::runtime::errors::BuildError;
use crossbeam_channel::{Receiver, Sender, bounded, select, unbounded};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Index of a `LinkInstance` in the program's arena.
///
/// Both endpoints of an edge store the same id, so whichever pass learns a
/// transport first publishes it to both sides.
pub type LinkId = usize;

/// Compile-time materialization of a link: pipe endpoints for a stream
/// edge, a constant for a string edge
#[derive(Debug)]
pub struct LinkInstance {
    pub ty: plan::ValueType,
    pub src: plan::Ref,
    pub dst: plan::Ref,
    /// Reading end that dst reads from (stream links only)
    pub read: Option<OwnedFd>,
    /// Writing end that src writes to (stream links only)
    pub write: Option<OwnedFd>,
    /// The constant carried by a string link
    pub value: Option<String>,
}

impl LinkInstance {
    pub(crate) fn new(ty: plan::ValueType, src: plan::Ref, dst: plan::Ref) -> Self {
        Self {
            ty,
            src,
            dst,
            read: None,
            write: None,
            value: None,
        }
    }
}

/// A value bound to a variable: an open descriptor or a string
#[derive(Debug)]
pub enum Value {
    Stream(OwnedFd),
    String(String),
}

/// Prepared command descriptor for one process
#[derive(Debug)]
pub struct CommandSpec {
    pub exe: String,
    pub args: Vec<String>,
    /// Links wired to the child's standard streams, when populated
    pub stdin: Option<LinkId>,
    pub stdout: Option<LinkId>,
    pub stderr: Option<LinkId>,
    /// Descriptors named by `/dev/fd/N` arguments; they must survive exec
    pub inherit: Vec<RawFd>,
}

/// A plan process bound to an OS process
#[derive(Debug)]
pub struct ProcessInstance {
    pub plan: plan::Process,
    /// Every wired port of this process, by port name
    pub links: HashMap<String, LinkId>,
    pub cmd: Option<CommandSpec>,
}

/// A plan variable with its bound value and boundary links
#[derive(Debug)]
pub struct VariableInstance {
    pub plan: plan::Variable,
    /// Inbound link, if the variable is a sink produced by the graph
    pub input: Option<LinkId>,
    /// Outbound link, if the variable is a source consumed by the graph
    pub output: Option<LinkId>,
    pub value: Option<Value>,
}

impl VariableInstance {
    /// Bind a preset or default value, writing through to any connected
    /// link so both endpoints observe it.
    ///
    /// Stream links receive a duplicate of the descriptor; the variable
    /// keeps the original for the program's lifetime so the owning worker
    /// can close its end exactly once.
    pub(crate) fn bind(
        &mut self,
        value: Value,
        links: &mut [LinkInstance],
    ) -> Result<(), BuildError> {
        let name = &self.plan.node.name;
        match (self.plan.value_type(), value) {
            (Some(plan::ValueType::Stream), Value::Stream(fd)) => {
                if let Some(out) = self.output {
                    links[out].read = Some(dup_bound(&fd, name)?);
                }
                if let Some(inp) = self.input {
                    links[inp].write = Some(dup_bound(&fd, name)?);
                }
                self.value = Some(Value::Stream(fd));
                Ok(())
            }
            (Some(plan::ValueType::String), Value::String(s)) => {
                if let Some(out) = self.output {
                    links[out].value = Some(s.clone());
                }
                self.value = Some(Value::String(s));
                Ok(())
            }
            (Some(expected), _) => Err(BuildError::BindTypeMismatch {
                name: name.clone(),
                expected,
            }),
            // a variable without a port can never bind; report it the way
            // the totality check would
            (None, _) => Err(BuildError::UnboundVariable(name.clone())),
        }
    }
}

fn dup_bound(fd: &OwnedFd, name: &str) -> Result<OwnedFd, BuildError> {
    fd.try_clone().map_err(|source| BuildError::BindFailed {
        name: name.to_string(),
        source,
    })
}

/// Uninhabited message type: the cancellation channel signals by closing
enum Cancelled {}

/// Cloneable handle that cancels a running program.
///
/// Cancellation is observed by workers at their exit-wait point; the OS
/// children themselves are left running.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<Mutex<Option<Sender<Cancelled>>>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// The compiled, executable form of one plan pipe
#[derive(Debug)]
pub struct Program {
    pub(crate) procs: BTreeMap<String, ProcessInstance>,
    pub(crate) vars: BTreeMap<String, VariableInstance>,
    pub(crate) links: Vec<LinkInstance>,
    canceller: CancelHandle,
    cancel_rx: Receiver<Cancelled>,
    exit_tx: Option<Sender<(String, Option<i32>)>>,
    exit_rx: Option<Receiver<(String, Option<i32>)>>,
    workers: Vec<(String, JoinHandle<()>)>,
    started: bool,
}

/// Everything one worker needs to launch and supervise its child
struct Launch {
    name: String,
    exe: String,
    args: Vec<String>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    inherit: Vec<RawFd>,
    /// Parent-side pipe ends owned by this process, closed when the
    /// worker concludes
    owned: Vec<OwnedFd>,
}

impl Program {
    pub(crate) fn from_parts(
        procs: BTreeMap<String, ProcessInstance>,
        vars: BTreeMap<String, VariableInstance>,
        links: Vec<LinkInstance>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = unbounded();
        let (exit_tx, exit_rx) = unbounded();
        Self {
            procs,
            vars,
            links,
            canceller: CancelHandle {
                tx: Arc::new(Mutex::new(Some(cancel_tx))),
            },
            cancel_rx,
            exit_tx: Some(exit_tx),
            exit_rx: Some(exit_rx),
            workers: Vec::new(),
            started: false,
        }
    }

    pub fn procs(&self) -> &BTreeMap<String, ProcessInstance> {
        &self.procs
    }

    pub fn vars(&self) -> &BTreeMap<String, VariableInstance> {
        &self.vars
    }

    pub fn links(&self) -> &[LinkInstance] {
        &self.links
    }

    /// Handle for cancelling this program from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    /// Launch every process concurrently. May be called exactly once.
    pub fn start(&mut self) {
        assert!(!self.started, "start() already called");
        self.started = true;

        let exit_tx = self
            .exit_tx
            .clone()
            .expect("exit channel taken before start()");

        // Assemble all launches before spawning anything so every pipe
        // endpoint is duplicated while it is still open in the arena.
        let names: Vec<String> = self.procs.keys().cloned().collect();
        let mut launches = Vec::with_capacity(names.len());
        for name in names {
            match self.assemble(&name) {
                Ok(launch) => launches.push(launch),
                Err(err) => {
                    error!("[{}] start failed: {}", name, err);
                    let _ = exit_tx.send((name, Some(1)));
                }
            }
        }

        for launch in launches {
            let name = launch.name.clone();
            let cancel = self.cancel_rx.clone();
            let exits = exit_tx.clone();
            let handle = thread::spawn(move || supervise(launch, cancel, exits));
            self.workers.push((name, handle));
        }
    }

    /// Block until every worker has concluded, returning the exit code of
    /// each process that was seen to exit (cancelled workers are absent).
    pub fn wait(&mut self) -> BTreeMap<String, i32> {
        assert!(self.started, "start() never called");
        let exit_rx = self.exit_rx.take().expect("wait() already called");
        // Drop our sender so the channel closes once all workers finish.
        drop(self.exit_tx.take());

        let mut codes = BTreeMap::new();
        for (name, code) in exit_rx.iter() {
            if let Some(code) = code {
                codes.insert(name, code);
            }
        }
        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("[{}] worker panicked", name);
            }
        }
        codes
    }

    fn assemble(&mut self, name: &str) -> io::Result<Launch> {
        let proc_inst = self.procs.get_mut(name).expect("unknown process");
        let spec = proc_inst.cmd.take().expect("command descriptor not built");

        // Duplicates for the child's standard streams; the parent copies
        // stay in the arena until taken below.
        let stdin = dup_end(&self.links, spec.stdin, true)?;
        let stdout = dup_end(&self.links, spec.stdout, false)?;
        let stderr = dup_end(&self.links, spec.stderr, false)?;

        let mut owned = Vec::new();
        for &id in proc_inst.links.values() {
            let link = &mut self.links[id];
            if link.dst.node == name
                && let Some(fd) = link.read.take()
            {
                owned.push(fd);
            }
            if link.src.node == name
                && let Some(fd) = link.write.take()
            {
                owned.push(fd);
            }
        }

        Ok(Launch {
            name: name.to_string(),
            exe: spec.exe,
            args: spec.args,
            stdin,
            stdout,
            stderr,
            inherit: spec.inherit,
            owned,
        })
    }
}

fn dup_end(
    links: &[LinkInstance],
    id: Option<LinkId>,
    read_side: bool,
) -> io::Result<Option<OwnedFd>> {
    let Some(id) = id else { return Ok(None) };
    let end = if read_side {
        links[id].read.as_ref()
    } else {
        links[id].write.as_ref()
    };
    match end {
        Some(fd) => Ok(Some(fd.try_clone()?)),
        None => Ok(None),
    }
}

fn supervise(launch: Launch, cancel: Receiver<Cancelled>, exits: Sender<(String, Option<i32>)>) {
    let Launch {
        name,
        exe,
        args,
        stdin,
        stdout,
        stderr,
        inherit,
        owned,
    } = launch;

    let mut cmd = Command::new(&exe);
    cmd.args(&args);
    cmd.stdin(stdin.map(Stdio::from).unwrap_or_else(Stdio::null));
    cmd.stdout(stdout.map(Stdio::from).unwrap_or_else(Stdio::null));
    cmd.stderr(stderr.map(Stdio::from).unwrap_or_else(Stdio::null));
    if !inherit.is_empty() {
        // Pipes are created close-on-exec; descriptors passed by path must
        // survive into the child. Safety: fcntl is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                for &fd in &inherit {
                    if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    info!("[{}] start: {} {}", name, exe, args.join(" "));
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!("[{}] start failed: {}", name, err);
            drop(owned);
            let _ = exits.send((name, Some(1)));
            return;
        }
    };
    // Release the child's stdio duplicates; keeping them open would hold
    // back EOF on the pipes this process writes.
    drop(cmd);

    let (exited_tx, exited_rx) = bounded(1);
    let wait_name = name.clone();
    thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                error!("[{}] wait: {}", wait_name, err);
                1
            }
        };
        let _ = exited_tx.send(code);
    });

    select! {
        recv(cancel) -> _ => {
            debug!("[{}] cancelled, abandoning wait", name);
            drop(owned);
            let _ = exits.send((name, None));
        }
        recv(exited_rx) -> code => {
            let code = code.unwrap_or(1);
            info!("[{}] exited: {}", name, code);
            drop(owned);
            let _ = exits.send((name, Some(code)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Arg, Link, Node, Pipe, Port, Process, Ref, ValueType, Variable};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::time::{Duration, Instant};

    fn stream_port(name: &str) -> Port {
        Port {
            name: name.to_string(),
            ty: ValueType::Stream,
        }
    }

    fn shell(name: &str, script: &str) -> Process {
        Process {
            node: Node {
                name: name.to_string(),
                ..Default::default()
            },
            exe: "sh".to_string(),
            args: vec![
                Arg::Literal("-c".to_string()),
                Arg::Literal(script.to_string()),
            ],
        }
    }

    fn source_var(name: &str, ty: ValueType, default: &str) -> Variable {
        Variable {
            node: Node {
                name: name.to_string(),
                inputs: vec![],
                outputs: vec![Port {
                    name: "value".to_string(),
                    ty,
                }],
            },
            default: default.to_string(),
        }
    }

    #[test]
    fn test_file_default_reaches_child_as_path_argument() {
        let mut scratch = tempfile::NamedTempFile::new().unwrap();
        scratch.write_all(b"hi").unwrap();

        let mut pipe = Pipe {
            name: "read_file".to_string(),
            procs: vec![Process {
                node: Node {
                    name: "cat".to_string(),
                    inputs: vec![stream_port("in")],
                    outputs: vec![],
                },
                exe: "cat".to_string(),
                args: vec![Arg::Port("in".to_string())],
            }],
            vars: vec![source_var(
                "src",
                ValueType::Stream,
                &format!("file://{}", scratch.path().display()),
            )],
            links: vec![Link {
                src: Ref::new("src", "value"),
                dst: Ref::new("cat", "in"),
            }],
        };
        pipe.normalize();

        let mut program = Program::build(&pipe, BTreeMap::new()).unwrap();
        let spec = program.procs()["cat"].cmd.as_ref().unwrap();
        assert!(
            spec.args[0].starts_with("/dev/fd/"),
            "expected a descriptor path argument, got {:?}",
            spec.args[0]
        );

        program.start();
        let codes = program.wait();
        assert_eq!(codes["cat"], 0);
    }

    #[test]
    fn test_bytes_flow_between_processes_and_eof_propagates() {
        let sink = tempfile::NamedTempFile::new().unwrap();
        let sink_path = sink.path().display().to_string();

        let mut writer = shell("writer", "printf hosed");
        writer.node.outputs = vec![stream_port("stdout")];
        let mut reader = shell("reader", &format!("cat >{sink_path}"));
        reader.node.inputs = vec![stream_port("stdin")];

        let mut pipe = Pipe {
            name: "chain".to_string(),
            procs: vec![writer, reader],
            vars: vec![],
            links: vec![Link {
                src: Ref::new("writer", "stdout"),
                dst: Ref::new("reader", "stdin"),
            }],
        };
        pipe.normalize();

        let mut program = Program::build(&pipe, BTreeMap::new()).unwrap();
        program.start();
        let codes = program.wait();

        // The reader only exits once every write end is closed, so wait()
        // returning at all shows close propagation worked.
        assert_eq!(codes["writer"], 0);
        assert_eq!(codes["reader"], 0);

        let mut copied = String::new();
        File::open(sink.path())
            .unwrap()
            .read_to_string(&mut copied)
            .unwrap();
        assert_eq!(copied, "hosed");
    }

    #[test]
    fn test_sink_variable_receives_process_output() {
        let mut scratch = tempfile::NamedTempFile::new().unwrap();

        let mut writer = shell("writer", "printf result");
        writer.node.outputs = vec![stream_port("stdout")];

        let mut pipe = Pipe {
            name: "to_var".to_string(),
            procs: vec![writer],
            vars: vec![Variable {
                node: Node {
                    name: "out".to_string(),
                    inputs: vec![stream_port("value")],
                    outputs: vec![],
                },
                default: format!("file://{}", scratch.path().display()),
            }],
            links: vec![Link {
                src: Ref::new("writer", "stdout"),
                dst: Ref::new("out", "value"),
            }],
        };
        pipe.normalize();

        let mut program = Program::build(&pipe, BTreeMap::new()).unwrap();
        program.start();
        let codes = program.wait();
        assert_eq!(codes["writer"], 0);

        let mut written = String::new();
        scratch.seek(SeekFrom::Start(0)).unwrap();
        scratch.read_to_string(&mut written).unwrap();
        assert_eq!(written, "result");
    }

    #[test]
    fn test_cancel_abandons_exit_wait() {
        let mut pipe = Pipe {
            name: "slow".to_string(),
            procs: vec![shell("sleeper", "sleep 5")],
            ..Default::default()
        };
        pipe.normalize();

        let mut program = Program::build(&pipe, BTreeMap::new()).unwrap();
        let handle = program.cancel_handle();
        program.start();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.cancel();
        });

        let begin = Instant::now();
        let codes = program.wait();
        canceller.join().unwrap();

        assert!(
            begin.elapsed() < Duration::from_secs(4),
            "wait() should return well before the child exits"
        );
        // the cancelled worker reports no exit code
        assert!(!codes.contains_key("sleeper"));
    }

    #[test]
    fn test_spawn_failure_reported_as_nonzero_exit() {
        let mut pipe = Pipe {
            name: "missing".to_string(),
            procs: vec![Process {
                node: Node {
                    name: "ghost".to_string(),
                    ..Default::default()
                },
                exe: "/nonexistent/definitely-not-here".to_string(),
                args: vec![],
            }],
            ..Default::default()
        };
        pipe.normalize();

        let mut program = Program::build(&pipe, BTreeMap::new()).unwrap();
        program.start();
        let codes = program.wait();
        assert_eq!(codes["ghost"], 1);
    }

    #[test]
    #[should_panic(expected = "start() already called")]
    fn test_start_twice_panics() {
        let mut pipe = Pipe {
            name: "empty".to_string(),
            ..Default::default()
        };
        pipe.normalize();
        let mut program = Program::build(&pipe, BTreeMap::new()).unwrap();
        program.start();
        program.start();
    }

    #[test]
    #[should_panic(expected = "start() never called")]
    fn test_wait_without_start_panics() {
        let mut pipe = Pipe {
            name: "empty".to_string(),
            ..Default::default()
        };
        pipe.normalize();
        let mut program = Program::build(&pipe, BTreeMap::new()).unwrap();
        program.wait();
    }
}
