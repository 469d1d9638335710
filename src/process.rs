//! Process Spawning
//!
//! The compile rule and the testscript runner invoke child processes
//! through the `Spawner` facade so that everything above it can be tested
//! without a real toolchain. `RealSpawner` wraps `std::process`;
//! `ScriptedSpawner` replays canned results and records invocations.

use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use thiserror::Error;

/// A command line to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Environment variables to set.
    pub env_set: Vec<(String, String)>,
    /// Environment variables to unset (for example IFCPATH).
    pub env_unset: Vec<String>,
    pub stdin: Option<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            if a.contains(' ') {
                write!(f, " '{}'", a)?;
            } else {
                write!(f, " {}", a)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn ok(self) -> bool {
        self.status == 0
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unable to execute {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} terminated abnormally")]
    Abnormal { program: String },

    #[error("i/o error communicating with {program}: {source}")]
    Io {
        program: String,
        source: std::io::Error,
    },
}

/// The process-spawning facade.
pub trait Spawner: Send + Sync {
    /// Run to completion, capturing output.
    fn run(&self, cmd: &ProcessCommand) -> Result<ProcessResult, ProcessError>;

    /// Run with a line server: each line the child writes to stdout is
    /// passed to `serve`; a `Some` response is written back to the
    /// child's stdin. Used for the dynamic module mapper.
    fn run_served(
        &self,
        cmd: &ProcessCommand,
        serve: &mut dyn FnMut(&str) -> Option<String>,
    ) -> Result<ProcessResult, ProcessError>;
}

/// Spawner over `std::process`.
#[derive(Debug, Default)]
pub struct RealSpawner;

impl RealSpawner {
    fn command(cmd: &ProcessCommand) -> Command {
        let mut c = Command::new(&cmd.program);
        c.args(&cmd.args);
        if let Some(d) = &cmd.cwd {
            c.current_dir(d);
        }
        for (k, v) in &cmd.env_set {
            c.env(k, v);
        }
        for k in &cmd.env_unset {
            c.env_remove(k);
        }
        c
    }
}

impl Spawner for RealSpawner {
    fn run(&self, cmd: &ProcessCommand) -> Result<ProcessResult, ProcessError> {
        let mut c = Self::command(cmd);
        c.stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        c.stdout(Stdio::piped());
        c.stderr(Stdio::piped());

        let mut child = c.spawn().map_err(|e| ProcessError::Spawn {
            program: cmd.program.clone(),
            source: e,
        })?;

        if let Some(input) = &cmd.stdin {
            let mut stdin = child.stdin.take().expect("piped stdin");
            // The child may exit without reading; a broken pipe is not an
            // error here.
            let _ = stdin.write_all(input.as_bytes());
        }

        let out = child.wait_with_output().map_err(|e| ProcessError::Io {
            program: cmd.program.clone(),
            source: e,
        })?;

        let status = match out.status.code() {
            Some(c) => c,
            None => {
                return Err(ProcessError::Abnormal {
                    program: cmd.program.clone(),
                })
            }
        };

        Ok(ProcessResult {
            status,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    fn run_served(
        &self,
        cmd: &ProcessCommand,
        serve: &mut dyn FnMut(&str) -> Option<String>,
    ) -> Result<ProcessResult, ProcessError> {
        let mut c = Self::command(cmd);
        c.stdin(Stdio::piped());
        c.stdout(Stdio::piped());
        c.stderr(Stdio::piped());

        let mut child = c.spawn().map_err(|e| ProcessError::Spawn {
            program: cmd.program.clone(),
            source: e,
        })?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        // Drain stderr on the side so the child cannot block on a full
        // pipe while we are serving requests.
        let err_thread = std::thread::spawn(move || {
            let mut s = String::new();
            let _ = stderr.read_to_string(&mut s);
            s
        });

        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).map_err(|e| ProcessError::Io {
                program: cmd.program.clone(),
                source: e,
            })?;
            if n == 0 {
                break;
            }
            let req = line.trim_end_matches(['\n', '\r']);
            if let Some(mut resp) = serve(req) {
                resp.push('\n');
                stdin
                    .write_all(resp.as_bytes())
                    .map_err(|e| ProcessError::Io {
                        program: cmd.program.clone(),
                        source: e,
                    })?;
            }
        }
        drop(stdin);

        let status = child.wait().map_err(|e| ProcessError::Io {
            program: cmd.program.clone(),
            source: e,
        })?;
        let stderr = err_thread.join().unwrap_or_default();

        let status = match status.code() {
            Some(c) => c,
            None => {
                return Err(ProcessError::Abnormal {
                    program: cmd.program.clone(),
                })
            }
        };

        Ok(ProcessResult {
            status,
            stdout: String::new(),
            stderr,
        })
    }
}

/// One scripted child-process behavior.
pub struct ScriptedRun {
    pub result: ProcessResult,
    /// Request lines the "child" issues when run through `run_served`.
    pub requests: Vec<String>,
    /// Files the "child" writes as a side effect (a compiler producing
    /// its output).
    pub creates: Vec<(PathBuf, String)>,
}

impl ScriptedRun {
    pub fn exit(status: i32) -> Self {
        Self {
            result: ProcessResult {
                status,
                ..Default::default()
            },
            requests: Vec::new(),
            creates: Vec::new(),
        }
    }

    pub fn output(status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            result: ProcessResult {
                status,
                stdout: stdout.into(),
                stderr: stderr.into(),
            },
            requests: Vec::new(),
            creates: Vec::new(),
        }
    }

    pub fn serving(status: i32, requests: Vec<String>) -> Self {
        Self {
            result: ProcessResult {
                status,
                ..Default::default()
            },
            requests,
            creates: Vec::new(),
        }
    }

    /// Also write a file when this run executes.
    pub fn creating(mut self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.creates.push((path.into(), content.into()));
        self
    }
}

/// Replays a queue of scripted runs and records every invocation.
#[derive(Default)]
pub struct ScriptedSpawner {
    runs: Mutex<VecDeque<ScriptedRun>>,
    invocations: Mutex<Vec<ProcessCommand>>,
    /// Responses collected from the server callback, per served run.
    responses: Mutex<Vec<Vec<String>>>,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, run: ScriptedRun) {
        self.runs.lock().unwrap().push_back(run);
    }

    pub fn invocations(&self) -> Vec<ProcessCommand> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn served_responses(&self) -> Vec<Vec<String>> {
        self.responses.lock().unwrap().clone()
    }

    fn next(&self, cmd: &ProcessCommand) -> ScriptedRun {
        self.invocations.lock().unwrap().push(cmd.clone());
        let run = self
            .runs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::exit(0));
        for (p, content) in &run.creates {
            if let Some(d) = p.parent() {
                let _ = std::fs::create_dir_all(d);
            }
            let _ = std::fs::write(p, content);
        }
        run
    }
}

impl Spawner for ScriptedSpawner {
    fn run(&self, cmd: &ProcessCommand) -> Result<ProcessResult, ProcessError> {
        Ok(self.next(cmd).result)
    }

    fn run_served(
        &self,
        cmd: &ProcessCommand,
        serve: &mut dyn FnMut(&str) -> Option<String>,
    ) -> Result<ProcessResult, ProcessError> {
        let run = self.next(cmd);
        let mut rs = Vec::new();
        for req in &run.requests {
            if let Some(r) = serve(req) {
                rs.push(r);
            }
        }
        self.responses.lock().unwrap().push(rs);
        Ok(run.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display() {
        let c = ProcessCommand::new("g++")
            .arg("-c")
            .arg("a b.cxx");
        assert_eq!(c.to_string(), "g++ -c 'a b.cxx'");
    }

    #[test]
    fn test_scripted_replay_and_log() {
        let s = ScriptedSpawner::new();
        s.push(ScriptedRun::output(0, "out", ""));
        s.push(ScriptedRun::exit(1));

        let r = s.run(&ProcessCommand::new("cc").arg("-c")).unwrap();
        assert_eq!(r.status, 0);
        assert_eq!(r.stdout, "out");

        let r = s.run(&ProcessCommand::new("cc")).unwrap();
        assert_eq!(r.status, 1);

        assert_eq!(s.invocation_count(), 2);
        assert_eq!(s.invocations()[0].args, vec!["-c"]);
    }

    #[test]
    fn test_scripted_served() {
        let s = ScriptedSpawner::new();
        s.push(ScriptedRun::serving(0, vec!["HELLO 1 gcc".into()]));

        let mut seen = Vec::new();
        let r = s
            .run_served(&ProcessCommand::new("cc"), &mut |req| {
                seen.push(req.to_string());
                Some("HELLO 1 mason".to_string())
            })
            .unwrap();
        assert_eq!(r.status, 0);
        assert_eq!(seen, vec!["HELLO 1 gcc"]);
        assert_eq!(s.served_responses(), vec![vec!["HELLO 1 mason".to_string()]]);
    }

    #[test]
    fn test_real_spawner_echo() {
        // /bin/sh is a reasonable assumption for the test environment.
        let s = RealSpawner;
        let r = s
            .run(&ProcessCommand::new("sh").arg("-c").arg("echo hi; echo err >&2"))
            .unwrap();
        assert_eq!(r.status, 0);
        assert_eq!(r.stdout, "hi\n");
        assert_eq!(r.stderr, "err\n");
    }

    #[test]
    fn test_real_spawner_served() {
        let s = RealSpawner;
        let mut reqs = Vec::new();
        let r = s
            .run_served(
                &ProcessCommand::new("sh")
                    .arg("-c")
                    .arg("echo PING; read x; test \"$x\" = PONG"),
                &mut |req| {
                    reqs.push(req.to_string());
                    Some("PONG".to_string())
                },
            )
            .unwrap();
        assert_eq!(r.status, 0);
        assert_eq!(reqs, vec!["PING"]);
    }
}
