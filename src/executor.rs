//! Command execution and output capture.
//!
//! [`Session::execute`] runs one command line through the configured
//! interpreter, saves stdout, stderr, their combination and the exit code to
//! the session's scratch files, and mirrors the streams to the debug log
//! depending on verbosity. The child always writes straight to the scratch
//! files; at higher verbosity, follower threads tail them while it runs.
//! The recorded exit code is always the child's own status.

use crate::error::Interrupt;
use crate::schema::CommandLine;
use crate::session::{ScratchFiles, Session};
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Target for mirrored command output.
pub const OUTPUT_TARGET: &str = "shtest::output";

const FOLLOW_POLL: Duration = Duration::from_millis(10);

/// How a command's streams are captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    /// Streams go straight to the scratch files, nothing is echoed.
    Redirect,
    /// Stderr is echoed live and saved, stdout is saved only.
    EchoStderr,
    /// Both streams are echoed live with a prefix and saved.
    EchoBoth,
}

impl CaptureStrategy {
    pub fn for_verbosity(verbosity: u8) -> Self {
        match verbosity {
            0 | 1 => CaptureStrategy::Redirect,
            2 => CaptureStrategy::EchoStderr,
            _ => CaptureStrategy::EchoBoth,
        }
    }
}

fn operator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?x)^(?:
                \|\|? | && | ; | &                  # pipes and control operators
              | [0-9]*(?:>>?|<<?|<>) (?:&[0-9-])?   # redirections, fd duplication
              | &>>?                                # redirect both streams
              | \$\(.*\) | `.*`                     # command substitution
              | [<>]\(.*\)                          # process substitution
            )$",
        )
        .expect("operator pattern is valid")
    })
}

/// Whether a token is shell syntax that must reach the interpreter unquoted.
pub fn is_shell_operator(token: &str) -> bool {
    operator_pattern().is_match(token)
}

/// Single-quote a token so the shell treats it as one literal word.
///
/// Tokens with `=` are always quoted; a leading `NAME=value` word would
/// otherwise be an assignment.
pub fn quote_token(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:,+@%".contains(c))
    {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

impl CommandLine {
    /// Render as a single line for `<shell> -c`.
    pub fn to_shell_line(&self) -> String {
        match self {
            CommandLine::Raw(line) => line.clone(),
            CommandLine::Tokens(tokens) => tokens
                .iter()
                .map(|token| {
                    if is_shell_operator(token) {
                        token.clone()
                    } else {
                        quote_token(token)
                    }
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine::Raw(line.to_string())
    }
}

/// Exit code as a shell reports it: the status, or 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

impl Session {
    /// Build the interpreter invocation for a command line.
    pub(crate) fn shell_command(&self, line: &str) -> Command {
        let options = self.options();
        let mut cmd = Command::new(&options.shell);
        cmd.arg("-c").arg(line);
        cmd.current_dir(self.work_dir());
        cmd.envs(&options.env);
        cmd.env("SHTEST_WORKDIR", self.work_dir());
        cmd.env("SHTEST_BASEDIR", self.base_dir());
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Execute a command and capture its results into the scratch files.
    ///
    /// The command's own non-zero exit is returned as data. Only failing to
    /// set up the execution (scratch files, spawning the interpreter) is an
    /// interrupt.
    pub fn execute(&mut self, cmd: &CommandLine) -> Result<i32, Interrupt> {
        let line = cmd.to_shell_line();
        let verbosity = self.verbosity();
        let strategy = CaptureStrategy::for_verbosity(verbosity);
        debug!(command = %line, ?strategy, "executing");

        let captured = run_captured(self.shell_command(&line), self.scratch(), strategy);
        let code = captured.map_err(|e| self.interrupt(e))?;
        debug!(command = %line, exit_code = code, "command finished");

        if verbosity >= 1 {
            self.log_captured()?;
        }
        Ok(code)
    }

    /// Run a command whose output only goes to the debug log.
    ///
    /// Used for `sh` steps; the scratch files keep the last `execute` results.
    pub fn run_plain(&mut self, cmd: &CommandLine) -> Result<i32, Interrupt> {
        let line = cmd.to_shell_line();
        debug!(command = %line, "running");
        let output = run_logged(self.shell_command(&line));
        output.map_err(|e| {
            self.interrupt(Interrupt::resource(format!("failed to run {line:?}"), e))
        })
    }

    fn log_captured(&mut self) -> Result<(), Interrupt> {
        let stdout = self.last_stdout()?;
        let stderr = self.last_stderr()?;
        log_stream("stdout", &stdout);
        log_stream("stderr", &stderr);
        Ok(())
    }
}

fn log_stream(label: &str, content: &str) {
    if content.is_empty() {
        debug!(target: OUTPUT_TARGET, "{label} is empty");
    } else {
        debug!(target: OUTPUT_TARGET, "{label}:\n{}", indent(content));
    }
}

/// Indent every line by four spaces.
pub(crate) fn indent(content: &str) -> String {
    content
        .lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn open(path: &Path) -> Result<File, Interrupt> {
    File::open(path)
        .map_err(|e| Interrupt::resource(format!("failed to open {}", path.display()), e))
}

fn create(path: &Path) -> Result<File, Interrupt> {
    File::create(path)
        .map_err(|e| Interrupt::resource(format!("failed to create {}", path.display()), e))
}

fn run_captured(
    mut command: Command,
    scratch: &ScratchFiles,
    strategy: CaptureStrategy,
) -> Result<i32, Interrupt> {
    let stdout = create(&scratch.stdout)?;
    let stderr = create(&scratch.stderr)?;
    let mut output = create(&scratch.output)?;
    fs::write(&scratch.exit_code, "")
        .map_err(|e| Interrupt::resource("failed to reset exit code file", e))?;

    let code = match strategy {
        CaptureStrategy::Redirect => {
            command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            let status = command
                .status()
                .map_err(|e| Interrupt::resource("failed to spawn command", e))?;
            append(&scratch.stdout, &mut output)?;
            append(&scratch.stderr, &mut output)?;
            exit_code(status)
        }
        CaptureStrategy::EchoStderr | CaptureStrategy::EchoBoth => {
            let echo_stdout = (strategy == CaptureStrategy::EchoBoth).then_some("stdout");
            let followed = [
                (open(&scratch.stdout)?, echo_stdout),
                (open(&scratch.stderr)?, Some("stderr")),
            ];
            command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            let mut child = command
                .spawn()
                .map_err(|e| Interrupt::resource("failed to spawn command", e))?;

            let output = Arc::new(Mutex::new(output));
            let done = Arc::new(AtomicBool::new(false));
            let followers = followed.map(|(file, echo)| {
                follow(file, Arc::clone(&output), echo, Arc::clone(&done))
            });

            // Only the child is waited for. Anything that inherited its
            // streams keeps writing to the scratch files unobserved.
            let status = child.wait();
            done.store(true, Ordering::Release);
            let status =
                status.map_err(|e| Interrupt::resource("failed to wait for command", e))?;

            for follower in followers {
                let result = follower.join().map_err(|_| {
                    Interrupt::resource("output follower panicked", io::Error::other("panic"))
                })?;
                result.map_err(|e| Interrupt::resource("failed to capture command output", e))?;
            }
            exit_code(status)
        }
    };

    fs::write(&scratch.exit_code, format!("{code}\n"))
        .map_err(|e| Interrupt::resource("failed to write exit code file", e))?;
    Ok(code)
}

fn append(from: &Path, to: &mut File) -> Result<(), Interrupt> {
    let mut source = open(from)?;
    io::copy(&mut source, to)
        .map_err(|e| Interrupt::resource("failed to write combined output", e))?;
    Ok(())
}

/// Tail a capture file until the command has exited, copying each line into
/// the combined log and echoing it when labelled.
fn follow(
    file: File,
    combined: Arc<Mutex<File>>,
    echo: Option<&'static str>,
    done: Arc<AtomicBool>,
) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            // Checked before reading, so the pass after exit sees every byte.
            let exited = done.load(Ordering::Acquire);
            let read = reader.read_until(b'\n', &mut line)?;
            if line.ends_with(b"\n") {
                forward(&line, &combined, echo)?;
                line.clear();
            } else if read == 0 {
                if exited {
                    if !line.is_empty() {
                        forward(&line, &combined, echo)?;
                    }
                    return Ok(());
                }
                thread::sleep(FOLLOW_POLL);
            }
        }
    })
}

fn forward(line: &[u8], combined: &Mutex<File>, echo: Option<&str>) -> io::Result<()> {
    combined
        .lock()
        .map_err(|_| io::Error::other("combined output lock poisoned"))?
        .write_all(line)?;
    if let Some(label) = echo {
        let text = String::from_utf8_lossy(line);
        info!(target: OUTPUT_TARGET, "{label}: {}", text.trim_end_matches(['\n', '\r']));
    }
    Ok(())
}

/// Run a command, forward its output to the debug log, return its exit code.
pub(crate) fn run_logged(mut command: Command) -> io::Result<i32> {
    let output = command.output()?;
    log_stream("stdout", &String::from_utf8_lossy(&output.stdout));
    log_stream("stderr", &String::from_utf8_lossy(&output.stderr));
    Ok(exit_code(output.status))
}
