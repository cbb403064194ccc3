//! Detached background processes owned by a session.
//!
//! Each process gets a bookkeeping directory `bg/<id>/` holding the command
//! text, the pid and append-only `stdout`/`stderr` capture files. The pid
//! comes from the spawn call itself. Every process runs in its own process
//! group so stopping it also reaches anything it forked.

use crate::error::Interrupt;
use crate::executor::indent;
use crate::session::Session;
use crate::watcher::poll_until;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Target for background supervision events.
pub const BACKGROUND_TARGET: &str = "shtest::background";

const STOP_POLL: Duration = Duration::from_millis(10);

/// One detached process.
#[derive(Debug)]
pub struct BackgroundProcess {
    id: String,
    name: Option<String>,
    pid: u32,
    command: String,
    dir: PathBuf,
    child: Child,
}

impl BackgroundProcess {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir.join("stdout")
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir.join("stderr")
    }
}

/// Registry of a session's background processes, in launch order.
#[derive(Debug)]
pub struct BackgroundSupervisor {
    root: PathBuf,
    next_id: usize,
    stop_grace: Duration,
    processes: Vec<BackgroundProcess>,
}

impl BackgroundSupervisor {
    pub fn new(root: PathBuf, stop_grace: Duration) -> Self {
        Self {
            root,
            next_id: 0,
            stop_grace,
            processes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.processes.iter().map(|p| p.id.clone()).collect()
    }

    /// Look a process up by id or by the name it was launched with.
    pub fn get(&self, key: &str) -> Option<&BackgroundProcess> {
        self.processes
            .iter()
            .find(|p| p.id == key || p.name.as_deref() == Some(key))
    }

    /// Spawn `command` detached and register it.
    pub fn launch(
        &mut self,
        mut command: Command,
        text: &str,
        name: Option<&str>,
    ) -> Result<&BackgroundProcess, Interrupt> {
        if let Some(name) = name
            && self.get(name).is_some()
        {
            return Err(Interrupt::Script(format!(
                "background process {name:?} is already running"
            )));
        }

        self.next_id += 1;
        let id = format!("bg-{}", self.next_id);
        let dir = self.root.join(&id);
        let resource =
            |what: &str, e: io::Error| Interrupt::resource(format!("{what} for {id}"), e);

        fs::create_dir_all(&dir).map_err(|e| resource("failed to create directory", e))?;
        fs::write(dir.join("cmd"), text).map_err(|e| resource("failed to record command", e))?;
        let stdout =
            open_append(&dir.join("stdout")).map_err(|e| resource("failed to open stdout", e))?;
        let stderr =
            open_append(&dir.join("stderr")).map_err(|e| resource("failed to open stderr", e))?;

        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        let child = command.spawn().map_err(|e| Interrupt::Launch {
            command: text.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        confirm_started(pid).map_err(|reason| Interrupt::Launch {
            command: text.to_string(),
            reason,
        })?;
        let pid_file = dir.join("pid");
        let recorded = fs::write(&pid_file, format!("{pid}\n"))
            .map_err(|e| resource("failed to record pid", e));

        info!(
            target: BACKGROUND_TARGET,
            id = %id,
            pid,
            command = text,
            "background process started"
        );
        // Registered before the pid check so teardown still stops it.
        self.processes.push(BackgroundProcess {
            id,
            name: name.map(str::to_string),
            pid,
            command: text.to_string(),
            dir,
            child,
        });
        recorded?;
        Ok(&self.processes[self.processes.len() - 1])
    }

    /// Signal a process to stop, reap it and remove its bookkeeping.
    ///
    /// A process that already exited is not an error.
    pub fn stop(&mut self, key: &str) -> Result<(), Interrupt> {
        let index = self
            .processes
            .iter()
            .position(|p| p.id == key || p.name.as_deref() == Some(key))
            .ok_or_else(|| Interrupt::Script(format!("no background process named {key:?}")))?;
        let mut process = self.processes.remove(index);
        terminate(&mut process.child, self.stop_grace);

        match fs::remove_dir_all(&process.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Interrupt::resource(
                format!("failed to remove {}", process.dir.display()),
                e,
            )),
        }
    }

    /// Stop every process; failures are logged, never returned.
    pub fn stop_all(&mut self) {
        for id in self.ids() {
            if let Err(e) = self.stop(&id) {
                warn!(
                    target: BACKGROUND_TARGET,
                    id = %id,
                    error = %e,
                    "failed to stop background process"
                );
            }
        }
    }

    /// Write every process's captured output to the debug log.
    pub fn dump(&self) {
        for process in &self.processes {
            debug!(
                target: BACKGROUND_TARGET,
                id = %process.id,
                pid = process.pid,
                "background command: {}",
                process.command
            );
            let id = &process.id;
            let streams = [
                ("stdout", process.stdout_path()),
                ("stderr", process.stderr_path()),
            ];
            for (label, path) in streams {
                match fs::read_to_string(&path) {
                    Ok(content) if content.is_empty() => {
                        debug!(target: BACKGROUND_TARGET, id = %id, "{label} is empty");
                    }
                    Ok(content) => {
                        let content = indent(&content);
                        debug!(target: BACKGROUND_TARGET, id = %id, "{label}:\n{content}");
                    }
                    Err(error) => {
                        warn!(target: BACKGROUND_TARGET, id = %id, %error, "cannot read {label}");
                    }
                }
            }
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Null-signal the new pid; an unreaped zombie still counts as started.
fn confirm_started(pid: u32) -> Result<(), String> {
    let pid = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(()),
        Err(errno) => Err(format!("process {pid} not found after spawn: {errno}")),
    }
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => {
            warn!(
                target: BACKGROUND_TARGET,
                pid,
                %errno,
                ?signal,
                "failed to signal process group"
            );
        }
    }
}

/// SIGTERM the group, wait out the grace period, then SIGKILL and reap.
fn terminate(child: &mut Child, grace: Duration) {
    let pid = child.id();
    signal_group(pid, Signal::SIGTERM);

    // A grace period past the end of time means waiting for the process.
    let deadline = Instant::now().checked_add(grace);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(target: BACKGROUND_TARGET, pid, %status, "background process exited");
                return;
            }
            Ok(None) if deadline.is_none_or(|d| Instant::now() < d) => {
                thread::sleep(STOP_POLL);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(
                    target: BACKGROUND_TARGET,
                    pid,
                    error = %e,
                    "failed to poll background process"
                );
                return;
            }
        }
    }

    warn!(target: BACKGROUND_TARGET, pid, "still running after SIGTERM; sending SIGKILL");
    signal_group(pid, Signal::SIGKILL);
    if let Err(e) = child.wait() {
        warn!(target: BACKGROUND_TARGET, pid, error = %e, "failed to reap background process");
    }
}

impl Session {
    /// Launch a detached background command, returning its id.
    pub fn bg_launch(&mut self, cmd: &str, name: Option<&str>) -> Result<String, Interrupt> {
        let command = self.shell_command(cmd);
        let launched = self
            .background
            .launch(command, cmd, name)
            .map(|p| (p.id().to_string(), p.pid()));
        let (id, pid) = launched.map_err(|e| self.interrupt(e))?;

        if let Some(name) = name {
            self.export(format!("BG_{name}_PID"), pid.to_string());
        }
        Ok(id)
    }

    /// Stop a background command by id or name, withdrawing its `BG_<name>_PID`.
    pub fn bg_stop(&mut self, key: &str) -> Result<(), Interrupt> {
        let name = self.background.get(key).and_then(|p| p.name.clone());
        let stopped = self.background.stop(key);
        if let Some(name) = name {
            self.unexport(&format!("BG_{name}_PID"));
        }
        stopped.map_err(|e| self.interrupt(e))
    }

    pub fn bg_pid(&self, key: &str) -> Option<u32> {
        self.background.get(key).map(BackgroundProcess::pid)
    }

    pub fn bg_stdout_path(&self, key: &str) -> Option<PathBuf> {
        self.background.get(key).map(BackgroundProcess::stdout_path)
    }

    pub fn bg_stderr_path(&self, key: &str) -> Option<PathBuf> {
        self.background.get(key).map(BackgroundProcess::stderr_path)
    }

    pub fn bg_command(&self, key: &str) -> Option<&str> {
        self.background.get(key).map(BackgroundProcess::command)
    }

    pub fn bg_ids(&self) -> Vec<String> {
        self.background.ids()
    }

    /// Poll a background process's captured stdout and stderr for `pattern`.
    pub fn bg_wait_for_output(
        &mut self,
        key: &str,
        pattern: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<bool, Interrupt> {
        let re = Regex::new(pattern)
            .map_err(|e| Interrupt::Script(format!("invalid regex {pattern:?}: {e}")));
        let re = re.map_err(|e| self.interrupt(e))?;
        let paths = self
            .bg_stdout_path(key)
            .zip(self.bg_stderr_path(key))
            .ok_or_else(|| Interrupt::Script(format!("no background process named {key:?}")));
        let (stdout, stderr) = paths.map_err(|e| self.interrupt(e))?;

        poll_until(interval, timeout, || {
            let seen = [&stdout, &stderr]
                .into_iter()
                .filter_map(|path| fs::read(path).ok())
                .any(|bytes| re.is_match(&String::from_utf8_lossy(&bytes)));
            Ok(seen)
        })
    }
}
