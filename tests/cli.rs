//! Integration tests for the shtest command line.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn shtest_cmd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_shtest"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn run_in(dir: &Path, args: &[&str]) -> Output {
    shtest_cmd().arg("-d").arg(dir).args(args).output().unwrap()
}

fn describe(output: &Output) -> String {
    format!(
        "status: {:?}\nstdout: {}\nstderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

const PASSING: &str = r#"version: 1
steps:
  - run: "false"
  - assert_exit_code: 1
"#;

const FAILING: &str = r#"version: 1
steps:
  - run: "false"
  - assert_exit_code: 0
"#;

#[test]
fn test_run_all_passes() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.yaml"), PASSING).unwrap();
    fs::write(
        temp_dir.path().join("b.toml"),
        "steps = [ { run = \"echo 'a.b'\" }, { assert_stdout = \"a.b\" } ]\n",
    )
    .unwrap();

    let output = run_in(temp_dir.path(), &["-A"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✓ a.yaml"), "{stdout}");
    assert!(stdout.contains("2 passed, 2 assertions"), "{stdout}");
    assert!(!temp_dir.path().join(".last-testcase").exists());
}

#[test]
fn test_failure_exits_88_and_records_last_testcase() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.yaml"), FAILING).unwrap();
    fs::write(temp_dir.path().join("b.yaml"), PASSING).unwrap();

    let output = run_in(temp_dir.path(), &["-A"]);
    assert_eq!(output.status.code(), Some(88), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✗ a.yaml"), "{stdout}");
    assert!(!stdout.contains("b.yaml"), "fail-fast should skip b.yaml: {stdout}");

    let marker = fs::read_to_string(temp_dir.path().join(".last-testcase")).unwrap();
    assert_eq!(marker.trim(), "a.yaml");
}

#[test]
fn test_rerun_last_failed() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.yaml"), FAILING).unwrap();
    assert_eq!(run_in(temp_dir.path(), &["-A"]).status.code(), Some(88));

    // Fix the file, then rerun it by the recorded name.
    fs::write(temp_dir.path().join("a.yaml"), PASSING).unwrap();
    let output = run_in(temp_dir.path(), &["-O"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
}

#[test]
fn test_run_one_by_glob() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("good.yaml"), PASSING).unwrap();
    fs::write(temp_dir.path().join("bad.yaml"), FAILING).unwrap();

    let output = run_in(temp_dir.path(), &["-O", "go*"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));

    let output = run_in(temp_dir.path(), &["-O", "missing*"]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
}

#[test]
fn test_no_last_testcase_exits_one() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.yaml"), PASSING).unwrap();

    let output = run_in(temp_dir.path(), &["-O"]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
}

#[test]
fn test_no_test_files_exits_one() {
    let temp_dir = TempDir::new().unwrap();
    let output = run_in(temp_dir.path(), &["-A"]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no test files"));
}

#[test]
fn test_recursive_discovery() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir(temp_dir.path().join("nested")).unwrap();
    fs::write(temp_dir.path().join("nested/inner.yaml"), PASSING).unwrap();

    assert_eq!(run_in(temp_dir.path(), &["-A"]).status.code(), Some(1));
    let output = run_in(temp_dir.path(), &["-A", "-a"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
}

#[test]
fn test_sh_failure_surfaces_exit_code() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.yaml"), "steps:\n  - sh: \"exit 3\"\n").unwrap();

    let output = run_in(temp_dir.path(), &["-A"]);
    assert_eq!(output.status.code(), Some(3), "{}", describe(&output));
}

#[test]
fn test_local_setup_script() {
    let temp_dir = TempDir::new().unwrap();
    let setup_dir = TempDir::new().unwrap();
    let setup = setup_dir.path().join("setup.yaml");
    fs::write(&setup, "env:\n  GREETING: hi\nsteps:\n  - sh: \"echo fixture > data\"\n").unwrap();
    fs::write(
        temp_dir.path().join("a.yaml"),
        r#"steps:
  - run: "cat data; echo $GREETING"
  - assert_stdout_no_diff: { expected: "fixture\nhi\n" }
"#,
    )
    .unwrap();

    let output = shtest_cmd()
        .arg("-A")
        .arg("-d")
        .arg(temp_dir.path())
        .arg("-s")
        .arg(&setup)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
}

#[test]
fn test_suite_config_setup_and_env() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("shtest.yaml"),
        "env:\n  TOOL: widget\nsetup:\n  - \"echo built > artifact\"\n",
    )
    .unwrap();
    fs::write(
        temp_dir.path().join("a.yaml"),
        r#"steps:
  - run: "cat $SHTEST_BASEDIR/artifact; echo $TOOL"
  - assert_stdout_re: "^built$"
  - assert_stdout_re: "^widget$"
"#,
    )
    .unwrap();

    let output = run_in(temp_dir.path(), &["-A"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
}

#[test]
fn test_background_processes_do_not_outlive_the_run() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("a.yaml"),
        r#"steps:
  - bg_start: { cmd: "echo $$ > $SHTEST_BASEDIR/bg.pid; exec sleep 100", name: sleeper }
  - bg_wait_output: { name: sleeper, pattern: "never", timeout: 0.2 }
"#,
    )
    .unwrap();

    let output = run_in(temp_dir.path(), &["-A"]);
    assert_eq!(output.status.code(), Some(88), "{}", describe(&output));

    let pid = fs::read_to_string(temp_dir.path().join("bg.pid")).unwrap();
    let alive = Command::new("kill")
        .arg("-0")
        .arg(pid.trim())
        .status()
        .unwrap()
        .success();
    assert!(!alive, "background process {} survived", pid.trim());
}

const TWO_STREAMS: &str = r#"steps:
  - run: "echo out-marker; echo err-marker >&2; exit 2"
  - assert_exit_code: 2
"#;

fn run_verbose(script: &str, verbosity: Option<&str>) -> (Output, String) {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("a.yaml"), script).unwrap();
    let mut args = vec!["-A"];
    args.extend(verbosity);
    let output = run_in(temp_dir.path(), &args);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    (output, stderr)
}

#[test]
fn test_quiet_run_logs_nothing() {
    let (output, stderr) = run_verbose(TWO_STREAMS, None);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(!stderr.contains("out-marker"), "{stderr}");
    assert!(!stderr.contains("err-marker"), "{stderr}");
}

#[test]
fn test_verbose_logs_captured_streams() {
    let (output, stderr) = run_verbose(
        "steps:\n  - run: \"true\"\n  - assert_success\n",
        Some("-v"),
    );
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(stderr.contains("stdout is empty"), "{stderr}");
    assert!(stderr.contains("stderr is empty"), "{stderr}");

    let (output, stderr) = run_verbose(TWO_STREAMS, Some("-v"));
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(stderr.contains("stdout:\n    out-marker"), "{stderr}");
    assert!(stderr.contains("stderr:\n    err-marker"), "{stderr}");
    assert!(!stderr.contains("stderr: err-marker"), "no live echo at -v: {stderr}");
}

#[test]
fn test_very_verbose_echoes_stderr_only() {
    let (output, stderr) = run_verbose(TWO_STREAMS, Some("-vv"));
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(stderr.contains("stderr: err-marker"), "{stderr}");
    assert!(!stderr.contains("stdout: out-marker"), "{stderr}");
    // The captured streams are still logged after the command.
    assert!(stderr.contains("stdout:\n    out-marker"), "{stderr}");
}

#[test]
fn test_trace_verbosity_echoes_both_streams() {
    let (output, stderr) = run_verbose(TWO_STREAMS, Some("-vvv"));
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert!(stderr.contains("stdout: out-marker"), "{stderr}");
    assert!(stderr.contains("stderr: err-marker"), "{stderr}");
}

#[test]
fn test_failure_dumps_background_output() {
    let script = r#"steps:
  - bg_start: { cmd: "echo diag-marker; echo diag-error >&2; sleep 100", name: srv }
  - bg_wait_output: { name: srv, pattern: "diag-error", timeout: 5 }
  - assert_equals: { expected: "a", actual: "b" }
"#;
    let (output, stderr) = run_verbose(script, Some("-v"));
    assert_eq!(output.status.code(), Some(88), "{}", describe(&output));
    assert!(stderr.contains("stdout:\n    diag-marker"), "{stderr}");
    assert!(stderr.contains("stderr:\n    diag-error"), "{stderr}");
}

#[test]
fn test_info_prints_schema() {
    let output = shtest_cmd().arg("-i").output().unwrap();
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    let schema: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let text = schema.to_string();
    for keyword in ["assert_exit_code", "bg_start", "wait_for_change", "not"] {
        assert!(text.contains(keyword), "schema lacks {keyword}");
    }
}

#[test]
fn test_usage_errors_exit_one() {
    assert_eq!(shtest_cmd().output().unwrap().status.code(), Some(1));
    assert_eq!(shtest_cmd().arg("-a").output().unwrap().status.code(), Some(1));
    assert_eq!(shtest_cmd().arg("--bogus").output().unwrap().status.code(), Some(1));
}

#[test]
fn test_help_exits_zero() {
    let output = shtest_cmd().arg("-h").output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("-O"));
}
