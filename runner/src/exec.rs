use itertools::Itertools;
use nix::{
    sys::{
        resource::{getrusage, UsageWho},
        signal::{killpg, SigSet, Signal},
        time::{TimeVal, TimeValLike},
    },
    unistd::Pid,
};
use std::{
    ffi::{OsStr, OsString},
    fmt::{self, Display},
    io::{self, Read},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("Failed to wait for `{command}`: {source}")]
    Wait { command: String, source: io::Error },
    #[error("`{command}` did not finish within {timeout:?}, output:\n{}", .output.join("\n"))]
    Timeout {
        command: String,
        timeout: Duration,
        output: Vec<String>,
    },
    #[error("`{command}` exited with {status}, output:\n{}", .output.join("\n"))]
    Failed {
        command: String,
        status: ExitStatus,
        output: Vec<String>,
    },
}

impl ExecError {
    /// combined output of a command that exited unsuccessfully or timed out
    pub fn output(&self) -> &[String] {
        match self {
            Self::Failed { output, .. } | Self::Timeout { output, .. } => output,
            _ => &[],
        }
    }
}

/// A fully resolved external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            dir: None,
        }
    }

    /// build an invocation from a `[program, args...]` list, `None` if the list is empty
    pub fn from_parts<S: AsRef<OsStr>>(parts: &[S]) -> Option<Self> {
        let (program, args) = parts.split_first()?;

        Some(Self::new(program).args(args))
    }

    /// run `command` through `sh -c`
    pub fn shell(command: &str) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// run this invocation through `program`, e.g. a profiler taking the command after `--`
    pub fn wrap<S: AsRef<OsStr>>(self, program: impl AsRef<OsStr>, args: &[S]) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: args
                .iter()
                .map(|arg| arg.as_ref().to_owned())
                .chain(std::iter::once(self.program))
                .chain(self.args)
                .collect(),
            dir: self.dir,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref dir) = self.dir {
            command.current_dir(dir);
        }

        // own process group, a timeout kills wrapped commands together with their children
        command.process_group(0);

        // the runner blocks termination signals for its listener thread, engines get them back
        // SAFETY: sigprocmask is async-signal-safe and touches no memory of the parent
        unsafe {
            command.pre_exec(|| SigSet::all().thread_unblock().map_err(io::Error::from));
        }

        command
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            std::iter::once(&self.program)
                .chain(self.args.iter())
                .map(|part| part.to_string_lossy())
                .join(" ")
        )
    }
}

/// Outcome of a successful invocation
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// wall clock time from spawn until exit
    pub runtime: Duration,
    /// CPU time the child spent in user mode
    pub user: Duration,
    /// CPU time the child spent in kernel mode
    pub sys: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    /// stdout followed by stderr, split on newlines
    ///
    /// A trailing newline yields a final empty line, engines are compared with the same rule so
    /// this never causes a mismatch on its own.
    pub fn lines(&self) -> Vec<String> {
        combined_lines(&self.stdout, &self.stderr)
    }
}

fn combined_lines(stdout: &[u8], stderr: &[u8]) -> Vec<String> {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(stderr));

    combined.split('\n').map(str::to_owned).collect()
}

// (user, sys) CPU time of all terminated and waited-for children
fn children_usage() -> (Duration, Duration) {
    let usage = match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => usage,
        Err(error) => {
            warn!(error = ?error, "Failed to read resource usage of child processes");
            return (Duration::ZERO, Duration::ZERO);
        }
    };

    let to_duration = |time: TimeVal| {
        u64::try_from(time.num_microseconds())
            .map(Duration::from_micros)
            .unwrap_or_default()
    };

    (to_duration(usage.user_time()), to_duration(usage.system_time()))
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buffer = Vec::new();

    if let Some(mut pipe) = pipe {
        if let Err(error) = pipe.read_to_end(&mut buffer) {
            warn!(error = ?error, "Failed to read child output");
        }
    }

    buffer
}

// `None` if the child was killed after `timeout`
fn wait(
    child: &mut Child,
    timeout: Option<Duration>,
    command: &str,
) -> Result<Option<ExitStatus>, ExecError> {
    let wait_error = |source: io::Error| ExecError::Wait {
        command: command.to_owned(),
        source,
    };

    let Some(timeout) = timeout else {
        return child.wait().map(Some).map_err(wait_error);
    };

    match child.wait_timeout(timeout).map_err(wait_error)? {
        Some(status) => Ok(Some(status)),
        None => {
            // the whole group, grandchildren would keep the output pipes open
            let group = i32::try_from(child.id()).map(Pid::from_raw);
            let killed = match group {
                Ok(group) => killpg(group, Signal::SIGKILL).map_err(io::Error::from),
                Err(_) => child.kill(),
            };
            if let Err(error) = killed {
                warn!(error = ?error, command = command, "Failed to kill timed out child");
            }
            child.wait().map_err(wait_error)?;

            Ok(None)
        }
    }
}

/// run an invocation to completion, capturing its output and resource usage
///
/// Any exit status other than success is an error carrying the combined output.
pub fn execute(invocation: &Invocation, timeout: Option<Duration>) -> Result<RunOutput, ExecError> {
    let command = invocation.to_string();
    debug!(command = %command, timeout = ?timeout, "Executing");

    let (user_before, sys_before) = children_usage();
    let start = Instant::now();

    let mut child = invocation
        .command()
        .spawn()
        .map_err(|source| ExecError::Spawn {
            command: command.clone(),
            source,
        })?;
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    // both pipes are drained concurrently so a chatty child can't block on a full pipe
    let (status, runtime, stdout, stderr) = thread::scope(|scope| {
        let stdout = scope.spawn(move || drain(stdout_pipe));
        let stderr = scope.spawn(move || drain(stderr_pipe));

        let status = wait(&mut child, timeout, &command);
        let runtime = start.elapsed();

        (
            status,
            runtime,
            stdout.join().unwrap_or_default(),
            stderr.join().unwrap_or_default(),
        )
    });
    let Some(status) = status? else {
        return Err(ExecError::Timeout {
            command,
            timeout: timeout.unwrap_or_default(),
            output: combined_lines(&stdout, &stderr),
        });
    };

    let (user_after, sys_after) = children_usage();

    trace!(
        command = %command,
        stdout = %String::from_utf8_lossy(&stdout),
        stderr = %String::from_utf8_lossy(&stderr),
        "Captured output"
    );

    if !status.success() {
        return Err(ExecError::Failed {
            command,
            status,
            output: combined_lines(&stdout, &stderr),
        });
    }

    debug!(
        command = %command,
        "Finished in {} ns",
        runtime.as_nanos()
    );

    Ok(RunOutput {
        runtime,
        user: user_after.saturating_sub(user_before),
        sys: sys_after.saturating_sub(sys_before),
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_stdout_then_stderr() {
        let output = execute(
            &Invocation::shell("echo err >&2; echo out; echo more"),
            None,
        )
        .unwrap();

        assert_eq!(output.lines(), vec!["out", "more", "err", ""]);
    }

    #[test]
    fn failure_keeps_output() {
        let error = execute(&Invocation::shell("echo broken; exit 3"), None).unwrap_err();

        assert!(matches!(error, ExecError::Failed { .. }));
        assert_eq!(error.output(), ["broken", ""]);
    }

    #[test]
    fn slow_commands_time_out() {
        let start = Instant::now();
        let error = execute(
            &Invocation::new("sleep").arg("5"),
            Some(Duration::from_millis(100)),
        )
        .unwrap_err();

        assert!(matches!(error, ExecError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_kills_children_of_wrapped_commands() {
        let start = Instant::now();
        let error = execute(
            &Invocation::shell("echo started; sleep 3; echo done"),
            Some(Duration::from_millis(200)),
        )
        .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(error, ExecError::Timeout { .. }));
        assert_eq!(error.output(), ["started", ""]);
        assert!(error.to_string().contains("started"));
    }

    #[test]
    fn failure_message_contains_command_and_output() {
        let error = execute(&Invocation::shell("echo broken; exit 3"), None).unwrap_err();
        let message = error.to_string();

        assert!(message.contains("sh -c echo broken; exit 3"));
        assert!(message.contains("broken"));
    }

    #[test]
    fn children_cpu_time_is_measured() {
        let output = execute(
            &Invocation::shell("i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done"),
            None,
        )
        .unwrap();

        assert!(output.user + output.sys > Duration::ZERO);
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        assert!(matches!(
            execute(&Invocation::new("/nonexistent/dbbench-engine"), None),
            Err(ExecError::Spawn { .. })
        ));
    }

    #[test]
    fn wrapping_prepends_program() {
        let wrapped = Invocation::new("sqlite3")
            .arg("db")
            .wrap("samply", &["record", "--"]);

        assert_eq!(wrapped.to_string(), "samply record -- sqlite3 db");
        assert_eq!(
            Invocation::from_parts(&["sync"]).map(|i| i.to_string()),
            Some("sync".to_owned())
        );
        assert!(Invocation::from_parts::<&str>(&[]).is_none());
    }
}
