//! Test execution engine.
//!
//! Runs test files one after another, each in its own [`Session`], and stops
//! at the first failure.

use crate::error::INTERRUPT_STATUS;
use crate::executor::run_logged;
use crate::loader::{self, LoadError};
use crate::schema::{SuiteConfig, TestScript};
use crate::script::{PollDefaults, run_script};
use crate::session::{Session, SessionOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Minimum verbosity when rerunning a single file.
pub const RUN_ONE_VERBOSITY: u8 = 1;

/// Settings for a run.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Directory holding the test files and `shtest.yaml`.
    pub base_dir: PathBuf,
    pub verbosity: u8,
    /// Script run inside each session before the file body (overrides the suite config).
    pub local_setup: Option<PathBuf>,
    pub config: SuiteConfig,
}

/// Totals of a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub files_passed: usize,
    pub assertions: usize,
}

/// Why a run did not succeed.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no test files found in {}", .0.display())]
    NoTestFiles(PathBuf),
    #[error("no failed test case recorded in {}", .0.display())]
    NoLastTestCase(PathBuf),
    #[error("no test file matches {0:?}")]
    NoMatch(String),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("global setup command {command:?} exited with status {code}")]
    GlobalSetup { command: String, code: i32 },
    #[error("global setup command {command:?} could not run: {source}")]
    GlobalSetupSpawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{} failed with status {status}", path.display())]
    Failed { path: PathBuf, status: i32 },
}

impl RunError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::NoTestFiles(_)
            | RunError::NoLastTestCase(_)
            | RunError::NoMatch(_)
            | RunError::Load(_) => 1,
            RunError::GlobalSetup { code, .. } => *code,
            RunError::GlobalSetupSpawn { .. } => INTERRUPT_STATUS,
            RunError::Failed { status, .. } => *status,
        }
    }
}

/// Sequential, fail-fast test runner.
pub struct Runner {
    options: RunnerOptions,
    poll: PollDefaults,
}

impl Runner {
    pub fn new(options: RunnerOptions) -> Self {
        let poll = PollDefaults {
            interval: Duration::try_from_secs_f64(options.config.poll_interval)
                .unwrap_or(PollDefaults::default().interval),
            timeout: Duration::try_from_secs_f64(options.config.poll_timeout)
                .unwrap_or(PollDefaults::default().timeout),
        };
        Self { options, poll }
    }

    pub fn base_dir(&self) -> &Path {
        &self.options.base_dir
    }

    fn local_setup_path(&self) -> Option<PathBuf> {
        self.options
            .local_setup
            .as_ref()
            .or(self.options.config.local_setup.as_ref())
            .map(|path| self.options.base_dir.join(path))
    }

    /// Test files in the base directory, sorted.
    pub fn discover(&self, recursive: bool) -> Result<Vec<PathBuf>, RunError> {
        let exclude: Vec<PathBuf> = self.local_setup_path().into_iter().collect();
        let files = loader::find_tests(self.base_dir(), recursive, &exclude)?;
        if files.is_empty() {
            return Err(RunError::NoTestFiles(self.base_dir().to_path_buf()));
        }
        Ok(files)
    }

    /// Run every file in order, stopping at the first failure.
    pub fn run_all(&self, files: &[PathBuf]) -> Result<Summary, RunError> {
        self.run_files(files, self.options.verbosity)
    }

    /// Run one file: the one matching `pattern`, or the last failed one.
    pub fn run_one(&self, pattern: Option<&str>) -> Result<Summary, RunError> {
        let file = match pattern {
            Some(pattern) => self.select(pattern)?,
            None => loader::read_last_failed(self.base_dir())?
                .ok_or_else(|| RunError::NoLastTestCase(self.base_dir().to_path_buf()))?,
        };
        let verbosity = self.options.verbosity.max(RUN_ONE_VERBOSITY);
        self.run_files(&[file], verbosity)
    }

    fn select(&self, pattern: &str) -> Result<PathBuf, RunError> {
        let direct = self.base_dir().join(pattern);
        if direct.is_file() {
            return Ok(direct);
        }

        let exclude: Vec<PathBuf> = self.local_setup_path().into_iter().collect();
        let files = loader::find_tests(self.base_dir(), true, &exclude)?;
        let matches = loader::select_tests(&files, self.base_dir(), pattern);
        match matches.as_slice() {
            [] => Err(RunError::NoMatch(pattern.to_string())),
            [only] => Ok(only.to_path_buf()),
            [first, ..] => {
                let count = matches.len();
                warn!(pattern, count, "several test files match; running the first");
                Ok(first.to_path_buf())
            }
        }
    }

    fn run_files(&self, files: &[PathBuf], verbosity: u8) -> Result<Summary, RunError> {
        self.global_setup()?;
        let setup = self
            .local_setup_path()
            .map(|path| loader::load_script(&path))
            .transpose()?;

        let mut summary = Summary::default();
        for file in files {
            let name = self.display_name(file);
            let script = match loader::load_script(file) {
                Ok(script) => script,
                Err(e) => {
                    println!("✗ {name}");
                    self.remember_failure(file);
                    return Err(e.into());
                }
            };

            info!(file = %name, "running test file");
            match self.run_file(&script, setup.as_ref(), verbosity) {
                Ok(assertions) => {
                    println!("✓ {name} ({assertions} assertions)");
                    summary.files_passed += 1;
                    summary.assertions += assertions;
                }
                Err(status) => {
                    println!("✗ {name}");
                    self.remember_failure(file);
                    return Err(RunError::Failed {
                        path: file.clone(),
                        status,
                    });
                }
            }
        }

        println!(
            "\n{} passed, {} assertions",
            summary.files_passed, summary.assertions
        );
        Ok(summary)
    }

    /// Run one script in a fresh session; `Err` carries the exit status.
    fn run_file(
        &self,
        script: &TestScript,
        setup: Option<&TestScript>,
        verbosity: u8,
    ) -> Result<usize, i32> {
        let mut session = Session::begin(self.session_options(verbosity)).map_err(|e| {
            error!("{e}");
            e.status()
        })?;

        let result = match setup {
            Some(setup) => run_script(&mut session, setup, &self.poll),
            None => Ok(()),
        }
        .and_then(|()| run_script(&mut session, script, &self.poll));

        let outcome = session.end();
        match result {
            Ok(()) => Ok(outcome.assert_count),
            Err(interrupt) => Err(interrupt.status()),
        }
    }

    fn session_options(&self, verbosity: u8) -> SessionOptions {
        SessionOptions {
            verbosity,
            shell: self.options.config.shell.clone(),
            env: self.options.config.env.clone(),
            base_dir: self.options.base_dir.clone(),
            stop_grace: Duration::from_millis(self.options.config.stop_grace_ms),
        }
    }

    /// Run the suite's setup commands in the base directory.
    fn global_setup(&self) -> Result<(), RunError> {
        for line in &self.options.config.setup {
            debug!(command = %line, "global setup");
            let mut command = Command::new(&self.options.config.shell);
            command
                .arg("-c")
                .arg(line)
                .current_dir(self.base_dir())
                .envs(&self.options.config.env)
                .env("SHTEST_BASEDIR", self.base_dir())
                .stdin(Stdio::null());

            let code = run_logged(command).map_err(|source| RunError::GlobalSetupSpawn {
                command: line.clone(),
                source,
            })?;
            if code != 0 {
                return Err(RunError::GlobalSetup {
                    command: line.clone(),
                    code,
                });
            }
        }
        Ok(())
    }

    fn remember_failure(&self, file: &Path) {
        if let Err(e) = loader::record_last_failed(self.base_dir(), file) {
            warn!(error = %e, "failed to record last failed test case");
        }
    }

    fn display_name(&self, file: &Path) -> String {
        file.strip_prefix(self.base_dir())
            .unwrap_or(file)
            .display()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LAST_TESTCASE;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn runner(dir: &TempDir, config: SuiteConfig) -> Runner {
        Runner::new(RunnerOptions {
            base_dir: dir.path().to_path_buf(),
            verbosity: 0,
            local_setup: None,
            config,
        })
    }

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_passing_file_counts_assertions() {
        let dir = tempdir().unwrap();
        write(&dir, "a.yaml", "steps:\n  - run: \"false\"\n  - assert_exit_code: 1\n");

        let runner = runner(&dir, SuiteConfig::default());
        let files = runner.discover(false).unwrap();
        let summary = runner.run_all(&files).unwrap();
        assert_eq!(summary, Summary { files_passed: 1, assertions: 1 });
        assert!(!dir.path().join(LAST_TESTCASE).exists());
    }

    #[test]
    fn test_failure_records_last_testcase() {
        let dir = tempdir().unwrap();
        write(&dir, "a.yaml", "steps:\n  - run: \"false\"\n  - assert_exit_code: 0\n");

        let runner = runner(&dir, SuiteConfig::default());
        let files = runner.discover(false).unwrap();
        let err = runner.run_all(&files).unwrap_err();
        assert_eq!(err.exit_code(), INTERRUPT_STATUS);
        let marker = fs::read_to_string(dir.path().join(LAST_TESTCASE)).unwrap();
        assert_eq!(marker.trim(), "a.yaml");
    }

    #[test]
    fn test_fail_fast_skips_later_files() {
        let dir = tempdir().unwrap();
        write(&dir, "a.yaml", "steps:\n  - assert_equals: { expected: x, actual: y }\n");
        write(&dir, "b.yaml", "steps:\n  - sh: \"touch ${SHTEST_BASEDIR}/b-ran\"\n");

        let runner = runner(&dir, SuiteConfig::default());
        let files = runner.discover(false).unwrap();
        assert!(runner.run_all(&files).is_err());
        assert!(!dir.path().join("b-ran").exists());
    }

    #[test]
    fn test_sh_failure_surfaces_its_code() {
        let dir = tempdir().unwrap();
        write(&dir, "a.yaml", "steps:\n  - sh: \"exit 5\"\n");

        let runner = runner(&dir, SuiteConfig::default());
        let err = runner.run_all(&runner.discover(false).unwrap()).unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_no_test_files() {
        let dir = tempdir().unwrap();
        let err = runner(&dir, SuiteConfig::default()).discover(false).unwrap_err();
        assert!(matches!(err, RunError::NoTestFiles(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_global_setup_runs_once_in_base_dir() {
        let dir = tempdir().unwrap();
        let check = "steps:\n  - assert_file: { path: \"${BASEDIR}/setup.log\", contains: once }\n";
        write(&dir, "a.yaml", check);
        write(&dir, "b.yaml", check);
        let config = SuiteConfig {
            setup: vec!["echo once >> setup.log".to_string()],
            ..SuiteConfig::default()
        };

        let runner = runner(&dir, config);
        let summary = runner.run_all(&runner.discover(false).unwrap()).unwrap();
        assert_eq!(summary.files_passed, 2);
        let log = fs::read_to_string(dir.path().join("setup.log")).unwrap();
        assert_eq!(log, "once\n");
    }

    #[test]
    fn test_global_setup_failure_aborts_with_its_code() {
        let dir = tempdir().unwrap();
        write(&dir, "a.yaml", "steps: []\n");
        let config = SuiteConfig {
            setup: vec!["exit 9".to_string()],
            ..SuiteConfig::default()
        };

        let runner = runner(&dir, config);
        let err = runner.run_all(&runner.discover(false).unwrap()).unwrap_err();
        assert!(matches!(err, RunError::GlobalSetup { code: 9, .. }));
        assert_eq!(err.exit_code(), 9);
    }

    #[test]
    fn test_local_setup_runs_in_every_session() {
        let dir = tempdir().unwrap();
        write(&dir, "setup.yaml", "steps:\n  - write_file: { path: fixture, contents: ready }\n");
        write(&dir, "a.yaml", "steps:\n  - assert_file: { path: fixture, contains: ready }\n");
        write(&dir, "b.yaml", "steps:\n  - assert_file: { path: fixture, contains: ready }\n");

        let runner = Runner::new(RunnerOptions {
            base_dir: dir.path().to_path_buf(),
            verbosity: 0,
            local_setup: Some(PathBuf::from("setup.yaml")),
            config: SuiteConfig::default(),
        });
        let files = runner.discover(false).unwrap();
        assert_eq!(files.len(), 2);
        let summary = runner.run_all(&files).unwrap();
        assert_eq!(summary, Summary { files_passed: 2, assertions: 2 });
    }

    #[test]
    fn test_run_one_by_glob_and_last_failed() {
        let dir = tempdir().unwrap();
        write(&dir, "good.yaml", "steps:\n  - run: \"true\"\n  - assert_success\n");
        write(&dir, "bad.yaml", "steps:\n  - run: \"true\"\n  - not: assert_success\n");

        let runner = runner(&dir, SuiteConfig::default());
        assert!(matches!(runner.run_one(None), Err(RunError::NoLastTestCase(_))));
        assert!(matches!(runner.run_one(Some("nothing*")), Err(RunError::NoMatch(_))));

        assert_eq!(runner.run_one(Some("go?d")).unwrap().files_passed, 1);
        assert!(runner.run_one(Some("bad")).is_err());

        let err = runner.run_one(None).unwrap_err();
        match err {
            RunError::Failed { path, status } => {
                assert_eq!(path, dir.path().join("bad.yaml"));
                assert_eq!(status, INTERRUPT_STATUS);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_load_error_exits_one() {
        let dir = tempdir().unwrap();
        write(&dir, "broken.yaml", "steps: [ {");

        let runner = runner(&dir, SuiteConfig::default());
        let err = runner.run_all(&runner.discover(false).unwrap()).unwrap_err();
        assert!(matches!(err, RunError::Load(_)));
        assert_eq!(err.exit_code(), 1);
        assert!(dir.path().join(LAST_TESTCASE).exists());
    }
}
