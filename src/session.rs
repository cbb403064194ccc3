//! One isolated run of one test file.
//!
//! A [`Session`] owns a fresh temporary directory laid out as
//!
//! ```text
//! shtest.XXXXXX/
//!   work/      current directory of every command
//!   scratch/   stdout, stderr, output, exit-code of the last command
//!   bg/<id>/   bookkeeping and capture files of each background process
//! ```
//!
//! All interpreter state (verbosity, the pending assertion operator, the
//! background registry) lives on the session, so several sessions can run
//! side by side in one process.

use crate::assertion::AssertOperator;
use crate::background::BackgroundSupervisor;
use crate::error::Interrupt;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Settings a session is created with.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Debug logging and capture level (0–4+).
    pub verbosity: u8,
    /// Interpreter for command lines, run as `<shell> -c <line>`.
    pub shell: String,
    /// Extra environment for every command.
    pub env: HashMap<String, String>,
    /// Directory the test files live in, exported as `SHTEST_BASEDIR`.
    pub base_dir: PathBuf,
    /// Time a background process gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            verbosity: 0,
            shell: "sh".to_string(),
            env: HashMap::new(),
            base_dir: PathBuf::from("."),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// Scratch files holding the most recent command's results.
#[derive(Debug, Clone)]
pub struct ScratchFiles {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub output: PathBuf,
    pub exit_code: PathBuf,
}

impl ScratchFiles {
    fn new(dir: &Path) -> Self {
        Self {
            stdout: dir.join("stdout"),
            stderr: dir.join("stderr"),
            output: dir.join("output"),
            exit_code: dir.join("exit-code"),
        }
    }

    fn reset(&self) -> std::io::Result<()> {
        for path in [&self.stdout, &self.stderr, &self.output, &self.exit_code] {
            fs::write(path, "")?;
        }
        Ok(())
    }
}

/// Result of a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub passed: bool,
    pub assert_count: usize,
}

/// Workspace and state for one test file.
pub struct Session {
    root: Option<tempfile::TempDir>,
    work_dir: PathBuf,
    scratch: ScratchFiles,
    options: SessionOptions,
    assert_count: usize,
    failed: bool,
    pub(crate) operator: AssertOperator,
    pub(crate) background: BackgroundSupervisor,
}

impl Session {
    /// Allocate a fresh workspace and reset all counters.
    pub fn begin(options: SessionOptions) -> Result<Self, Interrupt> {
        let root = tempfile::Builder::new()
            .prefix("shtest.")
            .tempdir()
            .map_err(|e| Interrupt::resource("failed to create session directory", e))?;

        let work_dir = root.path().join("work");
        let scratch_dir = root.path().join("scratch");
        let bg_dir = root.path().join("bg");
        for dir in [&work_dir, &scratch_dir, &bg_dir] {
            fs::create_dir_all(dir).map_err(|e| {
                Interrupt::resource(format!("failed to create {}", dir.display()), e)
            })?;
        }

        let scratch = ScratchFiles::new(&scratch_dir);
        scratch
            .reset()
            .map_err(|e| Interrupt::resource("failed to initialize scratch files", e))?;

        debug!(dir = %root.path().display(), "session started");

        Ok(Self {
            root: Some(root),
            work_dir,
            scratch,
            background: BackgroundSupervisor::new(bg_dir, options.stop_grace),
            options,
            assert_count: 0,
            failed: false,
            operator: AssertOperator::Equals,
        })
    }

    /// Mark the session failed and hand back the interrupt to propagate.
    ///
    /// Callers return the result as `Err`, which unwinds the test file up to
    /// the runner.
    pub fn interrupt(&mut self, cause: Interrupt) -> Interrupt {
        self.failed = true;
        error!(status = cause.status(), "{cause}");
        cause
    }

    /// Stop every background process, remove the workspace and report.
    pub fn end(mut self) -> SessionOutcome {
        if self.failed {
            self.background.dump();
        }
        self.background.stop_all();

        if let Some(root) = self.root.take() {
            let path = root.path().to_path_buf();
            if let Err(e) = root.close() {
                warn!(dir = %path.display(), error = %e, "failed to remove session directory");
            }
        }

        let outcome = SessionOutcome {
            passed: !self.failed,
            assert_count: self.assert_count,
        };
        debug!(passed = outcome.passed, assertions = outcome.assert_count, "session ended");
        outcome
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn base_dir(&self) -> &Path {
        &self.options.base_dir
    }

    pub fn verbosity(&self) -> u8 {
        self.options.verbosity
    }

    pub fn set_verbosity(&mut self, verbosity: u8) {
        self.options.verbosity = verbosity;
    }

    pub fn assert_count(&self) -> usize {
        self.assert_count
    }

    pub(crate) fn count_assertion(&mut self) {
        self.assert_count += 1;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn scratch(&self) -> &ScratchFiles {
        &self.scratch
    }

    /// Export a variable to every later command of this session.
    pub fn export(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.env.insert(key.into(), value.into());
    }

    pub fn unexport(&mut self, key: &str) {
        self.options.env.remove(key);
    }

    /// Resolve a script path against the work directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }

    /// Write a file in the work directory, creating parent directories.
    pub fn write_file(&mut self, path: impl AsRef<Path>, contents: &str) -> Result<(), Interrupt> {
        let path = self.resolve(path);
        let written = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(&path, contents));
        written.map_err(|e| {
            let cause = Interrupt::resource(format!("failed to write {}", path.display()), e);
            self.interrupt(cause)
        })
    }

    /// Read a file, treating failure as a resource error.
    pub(crate) fn read_scratch(&mut self, path: &Path) -> Result<String, Interrupt> {
        fs::read(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|e| {
                let cause = Interrupt::resource(format!("failed to read {}", path.display()), e);
                self.interrupt(cause)
            })
    }

    pub fn last_stdout(&mut self) -> Result<String, Interrupt> {
        let path = self.scratch.stdout.clone();
        self.read_scratch(&path)
    }

    pub fn last_stderr(&mut self) -> Result<String, Interrupt> {
        let path = self.scratch.stderr.clone();
        self.read_scratch(&path)
    }

    /// Both streams of the last command.
    pub fn last_output(&mut self) -> Result<String, Interrupt> {
        let path = self.scratch.output.clone();
        self.read_scratch(&path)
    }

    /// Exit code of the last command, `None` before the first `execute`.
    pub fn last_exit_code(&mut self) -> Result<Option<i32>, Interrupt> {
        let path = self.scratch.exit_code.clone();
        let text = self.read_scratch(&path)?;
        Ok(text.trim().parse().ok())
    }

    pub fn last_stdout_path(&self) -> &Path {
        &self.scratch.stdout
    }

    pub fn last_stderr_path(&self) -> &Path {
        &self.scratch.stderr
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Reached without `end` only when unwinding from a panic.
        if !self.background.is_empty() {
            self.background.stop_all();
        }
    }
}
