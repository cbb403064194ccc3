//! Schema definitions for shtest script files.
//!
//! A test file is a list of steps run in order inside one session. Scripts
//! are written in YAML (or TOML) and validated against these types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Suite-level configuration loaded from `shtest.yaml` in the base directory.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SuiteConfig {
    /// Schema version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Interpreter used for every command line (run as `<shell> -c <line>`).
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Environment variables exported to every command of every test file.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Global setup commands, run once in the base directory before the first file.
    #[serde(default)]
    pub setup: Vec<String>,

    /// Local setup script run inside each session before the file body (overridden by `-s`).
    #[serde(default)]
    pub local_setup: Option<PathBuf>,

    /// Grace period in milliseconds between SIGTERM and SIGKILL when stopping background processes.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Default polling interval in seconds for `wait_for_change` and `bg_wait_output`.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,

    /// Default polling timeout in seconds for `wait_for_change` and `bg_wait_output`.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: f64,
}

fn default_version() -> u32 {
    1
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_poll_interval() -> f64 {
    0.1
}

fn default_poll_timeout() -> f64 {
    5.0
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            shell: default_shell(),
            env: HashMap::new(),
            setup: Vec::new(),
            local_setup: None,
            stop_grace_ms: default_stop_grace_ms(),
            poll_interval: default_poll_interval(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

/// Root document for a test script.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TestScript {
    /// Schema version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Environment variables exported to every command of this script.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Steps, run in order. The first failing step aborts the file.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A command line, either a raw shell string or a list of tokens.
///
/// Raw strings go to the interpreter unchanged. In a token list, shell
/// operators (`|`, `>`, `2>&1`, `$(...)`, ...) pass through and every other
/// token is quoted so it reaches the command as a literal argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum CommandLine {
    /// A shell line, passed through as written.
    Raw(String),
    /// Tokens joined with literal quoting.
    Tokens(Vec<String>),
}

/// A single step of a test script.
///
/// Each step is a single-key map (or a bare string for steps without
/// arguments) where the key selects the action.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Execute a command and capture its stdout, stderr and exit code.
    Run(CommandLine),

    /// Execute a command that must succeed; a non-zero exit fails the file with that code.
    Sh(CommandLine),

    /// Write a file (relative to the work directory).
    WriteFile(WriteFile),

    /// Assert that the last command exited with status 0.
    AssertSuccess,

    /// Assert the last command's exit code.
    AssertExitCode(i32),

    /// Assert two interpolated strings are equal.
    AssertEquals(AssertEquals),

    /// Assert the last stdout contains this literal text (empty: stdout is empty).
    AssertStdout(String),

    /// Assert the last stderr contains this literal text (empty: stderr is empty).
    AssertStderr(String),

    /// Assert the last combined output contains this literal text (empty: no output).
    AssertOutput(String),

    /// Assert the last stdout matches this regex (empty: stdout is empty).
    AssertStdoutRe(String),

    /// Assert the last stderr matches this regex (empty: stderr is empty).
    AssertStderrRe(String),

    /// Assert the last combined output matches this regex (empty: no output).
    AssertOutputRe(String),

    /// Assert a file contains literal text.
    AssertFile(FileContains),

    /// Assert a file matches a regex.
    AssertFileRe(FileMatches),

    /// Assert two files have no differences.
    AssertNoDiff(NoDiff),

    /// Assert the last stdout has no differences from the given text.
    AssertStdoutNoDiff(StdoutNoDiff),

    /// Negate exactly one nested assertion. Cannot be nested.
    Not(Box<Step>),

    /// Launch a background command.
    BgStart(BgStart),

    /// Stop a background command by name or id.
    BgStop(String),

    /// Assert a background command's output matches a regex within a timeout.
    BgWaitOutput(BgWaitOutput),

    /// Run a trigger command and assert a file changes within a timeout.
    WaitForChange(WaitForChange),
}

impl Step {
    /// Whether this step ends in an assertion, and so may be wrapped in `not`.
    pub fn is_assertion(&self) -> bool {
        !matches!(
            self,
            Step::Run(_)
                | Step::Sh(_)
                | Step::WriteFile(_)
                | Step::Not(_)
                | Step::BgStart(_)
                | Step::BgStop(_)
        )
    }

    /// Step keyword as written in scripts.
    pub fn keyword(&self) -> &'static str {
        match self {
            Step::Run(_) => "run",
            Step::Sh(_) => "sh",
            Step::WriteFile(_) => "write_file",
            Step::AssertSuccess => "assert_success",
            Step::AssertExitCode(_) => "assert_exit_code",
            Step::AssertEquals(_) => "assert_equals",
            Step::AssertStdout(_) => "assert_stdout",
            Step::AssertStderr(_) => "assert_stderr",
            Step::AssertOutput(_) => "assert_output",
            Step::AssertStdoutRe(_) => "assert_stdout_re",
            Step::AssertStderrRe(_) => "assert_stderr_re",
            Step::AssertOutputRe(_) => "assert_output_re",
            Step::AssertFile(_) => "assert_file",
            Step::AssertFileRe(_) => "assert_file_re",
            Step::AssertNoDiff(_) => "assert_no_diff",
            Step::AssertStdoutNoDiff(_) => "assert_stdout_no_diff",
            Step::Not(_) => "not",
            Step::BgStart(_) => "bg_start",
            Step::BgStop(_) => "bg_stop",
            Step::BgWaitOutput(_) => "bg_wait_output",
            Step::WaitForChange(_) => "wait_for_change",
        }
    }
}

/// Write a file with specific contents.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WriteFile {
    /// Path to the file (relative to the work directory).
    pub path: PathBuf,

    /// File contents (interpolated).
    pub contents: String,
}

/// Compare two strings after `${VAR}` interpolation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AssertEquals {
    pub expected: String,
    pub actual: String,
}

/// Literal substring check against a file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileContains {
    /// Path to the file (relative to the work directory, interpolated).
    pub path: String,

    /// Text the file must contain (empty: file must be empty).
    pub contains: String,
}

/// Regex check against a file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileMatches {
    /// Path to the file (relative to the work directory, interpolated).
    pub path: String,

    /// Pattern the file must match (empty: file must be empty).
    pub pattern: String,
}

/// Diff two files.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NoDiff {
    /// Expected file (relative to the work directory, interpolated).
    pub expected: String,

    /// Actual file (relative to the work directory, interpolated).
    pub actual: String,

    /// Ignore lines that are empty after trimming.
    #[serde(default)]
    pub ignore_blank_lines: bool,
}

/// Diff the last stdout against expected text.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StdoutNoDiff {
    /// Expected stdout (interpolated).
    pub expected: String,

    /// Ignore lines that are empty after trimming.
    #[serde(default)]
    pub ignore_blank_lines: bool,
}

/// Launch a detached command.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BgStart {
    /// Shell line to run in the background.
    pub cmd: String,

    /// Name used to refer to the process in later steps and `${BG_<name>_PID}`.
    #[serde(default)]
    pub name: Option<String>,
}

/// Poll a background process's captured output.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BgWaitOutput {
    /// Name or id of the background process.
    pub name: String,

    /// Regex to look for in captured stdout or stderr.
    pub pattern: String,

    /// Polling interval in seconds.
    #[serde(default)]
    pub interval: Option<f64>,

    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Run a trigger and watch a file's metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WaitForChange {
    /// Trigger command, executed like `run`.
    pub cmd: CommandLine,

    /// File to watch (relative to the work directory, interpolated).
    pub file: String,

    /// Polling interval in seconds.
    #[serde(default)]
    pub interval: Option<f64>,

    /// Timeout in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Generate the JSON Schema for test scripts.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(TestScript)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_script() {
        let yaml = r#"
version: 1
steps:
  - run: "echo hello"
  - assert_success
  - assert_stdout: hello
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(script.version, 1);
        assert_eq!(script.steps.len(), 3);
        assert!(matches!(&script.steps[0], Step::Run(CommandLine::Raw(s)) if s == "echo hello"));
        assert!(matches!(script.steps[1], Step::AssertSuccess));
    }

    #[test]
    fn parse_token_command_line() {
        let yaml = r#"
steps:
  - run: ["printf", "%s", "a b", "|", "wc", "-c"]
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        match &script.steps[0] {
            Step::Run(CommandLine::Tokens(tokens)) => assert_eq!(tokens.len(), 6),
            other => panic!("expected token list, got {other:?}"),
        }
    }

    #[test]
    fn parse_full_script() {
        let yaml = r#"
version: 1
env:
  GREETING: hi
steps:
  - write_file:
      path: input.txt
      contents: "one\n"
  - run: "cat input.txt"
  - assert_exit_code: 0
  - assert_equals: { expected: "0", actual: "${EXIT_CODE}" }
  - assert_file: { path: input.txt, contains: one }
  - assert_file_re: { path: input.txt, pattern: "^o" }
  - assert_no_diff: { expected: a, actual: b, ignore_blank_lines: true }
  - assert_stdout_no_diff: { expected: "one\n" }
  - not: assert_success
  - bg_start: { cmd: "sleep 100", name: server }
  - bg_wait_output: { name: server, pattern: ready, timeout: 1 }
  - bg_stop: server
  - wait_for_change: { cmd: "touch f", file: f, interval: 0.01, timeout: 0.5 }
"#;
        let script: TestScript = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(script.env.get("GREETING"), Some(&"hi".to_string()));
        assert_eq!(script.steps.len(), 13);
        match &script.steps[6] {
            Step::AssertNoDiff(diff) => assert!(diff.ignore_blank_lines),
            other => panic!("expected assert_no_diff, got {other:?}"),
        }
        match &script.steps[7] {
            Step::AssertStdoutNoDiff(diff) => assert!(!diff.ignore_blank_lines),
            other => panic!("expected assert_stdout_no_diff, got {other:?}"),
        }
        match &script.steps[8] {
            Step::Not(inner) => assert!(matches!(**inner, Step::AssertSuccess)),
            other => panic!("expected not, got {other:?}"),
        }
        match &script.steps[9] {
            Step::BgStart(bg) => assert_eq!(bg.name.as_deref(), Some("server")),
            other => panic!("expected bg_start, got {other:?}"),
        }
    }

    #[test]
    fn suite_config_defaults() {
        let config: SuiteConfig = serde_yaml::from_str("version: 1").unwrap();
        assert_eq!(config.shell, "sh");
        assert_eq!(config.stop_grace_ms, 2000);
        assert!(config.setup.is_empty());
        assert_eq!(config.poll_timeout, SuiteConfig::default().poll_timeout);
    }

    #[test]
    fn only_assertions_are_negatable() {
        assert!(Step::AssertSuccess.is_assertion());
        assert!(Step::AssertStdout("x".into()).is_assertion());
        assert!(!Step::Run(CommandLine::Raw("true".into())).is_assertion());
        assert!(!Step::Not(Box::new(Step::AssertSuccess)).is_assertion());
    }

    #[test]
    fn schema_names_step_keywords() {
        let schema = serde_json::to_string(&generate_schema()).unwrap();
        assert!(schema.contains("assert_stdout_re"));
        assert!(schema.contains("wait_for_change"));
    }
}
