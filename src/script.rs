//! Interpreter for test scripts: maps each step onto a [`Session`] call.

use crate::diff::DiffMode;
use crate::env::{has_references, interpolate};
use crate::error::Interrupt;
use crate::schema::{Step, TestScript};
use crate::session::Session;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tracing::debug;

/// Polling settings used when a step leaves `interval` or `timeout` out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollDefaults {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollDefaults {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Run every step of `script` in `session`, stopping at the first interrupt.
pub fn run_script(
    session: &mut Session,
    script: &TestScript,
    defaults: &PollDefaults,
) -> Result<(), Interrupt> {
    for (key, value) in &script.env {
        session.export(key.clone(), value.clone());
    }
    for (index, step) in script.steps.iter().enumerate() {
        debug!(step = index + 1, keyword = step.keyword(), "running step");
        run_step(session, step, defaults)?;
    }
    Ok(())
}

fn run_step(session: &mut Session, step: &Step, defaults: &PollDefaults) -> Result<(), Interrupt> {
    match step {
        Step::Run(cmd) => session.execute(cmd).map(drop),
        Step::Sh(cmd) => {
            let code = session.run_plain(cmd)?;
            if code == 0 {
                return Ok(());
            }
            Err(session.interrupt(Interrupt::CommandFailed {
                command: cmd.to_shell_line(),
                code,
            }))
        }
        Step::WriteFile(file) => {
            let contents = expand(session, &file.contents)?;
            session.write_file(&file.path, &contents)
        }
        Step::AssertSuccess => session.assert_success(),
        Step::AssertExitCode(code) => session.assert_exit_code(*code),
        Step::AssertEquals(values) => {
            let expected = expand(session, &values.expected)?;
            let actual = expand(session, &values.actual)?;
            session.assert_equals(&expected, &actual)
        }
        Step::AssertStdout(text) => {
            let text = expand(session, text)?;
            session.assert_stdout(&text)
        }
        Step::AssertStderr(text) => {
            let text = expand(session, text)?;
            session.assert_stderr(&text)
        }
        Step::AssertOutput(text) => {
            let text = expand(session, text)?;
            session.assert_output(&text)
        }
        Step::AssertStdoutRe(pattern) => {
            let pattern = expand(session, pattern)?;
            session.assert_stdout_re(&pattern)
        }
        Step::AssertStderrRe(pattern) => {
            let pattern = expand(session, pattern)?;
            session.assert_stderr_re(&pattern)
        }
        Step::AssertOutputRe(pattern) => {
            let pattern = expand(session, pattern)?;
            session.assert_output_re(&pattern)
        }
        Step::AssertFile(check) => {
            let path = expand(session, &check.path)?;
            let text = expand(session, &check.contains)?;
            session.assert_file(path, &text)
        }
        Step::AssertFileRe(check) => {
            let path = expand(session, &check.path)?;
            let pattern = expand(session, &check.pattern)?;
            session.assert_file_re(path, &pattern)
        }
        Step::AssertNoDiff(diff) => {
            let expected = expand(session, &diff.expected)?;
            let actual = expand(session, &diff.actual)?;
            session.assert_no_diff(expected, actual, DiffMode::from_flag(diff.ignore_blank_lines))
        }
        Step::AssertStdoutNoDiff(diff) => {
            let expected = expand(session, &diff.expected)?;
            session.assert_stdout_no_diff(&expected, DiffMode::from_flag(diff.ignore_blank_lines))
        }
        Step::Not(inner) => session.not(|s| run_step(s, inner, defaults)),
        Step::BgStart(bg) => session.bg_launch(&bg.cmd, bg.name.as_deref()).map(drop),
        Step::BgStop(key) => session.bg_stop(key),
        Step::BgWaitOutput(wait) => {
            let pattern = expand(session, &wait.pattern)?;
            let interval = seconds(session, wait.interval, defaults.interval)?;
            let timeout = seconds(session, wait.timeout, defaults.timeout)?;
            let found = session.bg_wait_for_output(&wait.name, &pattern, interval, timeout)?;
            let label = format!("background process {:?} should print {pattern:?}", wait.name);
            session.make_assertion(true, found, &label, &[format!("gave up after {timeout:?}")])
        }
        Step::WaitForChange(watch) => {
            let file = expand(session, &watch.file)?;
            let interval = seconds(session, watch.interval, defaults.interval)?;
            let timeout = seconds(session, watch.timeout, defaults.timeout)?;
            let changed = session.wait_for_change(&watch.cmd, &file, interval, timeout)?;
            let label = format!("{file} should change after `{}`", watch.cmd.to_shell_line());
            session.make_assertion(true, changed, &label, &[format!("gave up after {timeout:?}")])
        }
    }
}

/// Interpolate `${VAR}` references in a step argument.
fn expand(session: &mut Session, text: &str) -> Result<String, Interrupt> {
    if !has_references(text) {
        return Ok(text.to_string());
    }
    let vars = variables(session)?;
    interpolate(text, &vars).map_err(|e| session.interrupt(Interrupt::Script(e)))
}

/// Variables visible to interpolation; session values shadow exported ones.
fn variables(session: &mut Session) -> Result<HashMap<String, String>, Interrupt> {
    let mut vars = session.options().env.clone();
    vars.insert("WORKDIR".into(), session.work_dir().display().to_string());
    vars.insert("BASEDIR".into(), session.base_dir().display().to_string());

    let exit_code = session.last_exit_code()?;
    vars.insert("EXIT_CODE".into(), exit_code.map(|c| c.to_string()).unwrap_or_default());
    let stdout = session.last_stdout()?;
    vars.insert("STDOUT".into(), trim_newline(&stdout).to_string());
    let stderr = session.last_stderr()?;
    vars.insert("STDERR".into(), trim_newline(&stderr).to_string());

    for id in session.bg_ids() {
        let Some(process) = session.background.get(&id) else {
            continue;
        };
        let Some(name) = process.name() else {
            continue;
        };
        let streams = [
            ("STDOUT", process.stdout_path()),
            ("STDERR", process.stderr_path()),
        ];
        for (suffix, path) in streams {
            let content = fs::read(&path)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            vars.insert(format!("BG_{name}_{suffix}"), trim_newline(&content).to_string());
        }
    }
    Ok(vars)
}

fn trim_newline(text: &str) -> &str {
    text.strip_suffix('\n').unwrap_or(text)
}

fn seconds(
    session: &mut Session,
    value: Option<f64>,
    default: Duration,
) -> Result<Duration, Interrupt> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs).map_err(|e| {
            session.interrupt(Interrupt::Script(format!("invalid duration {secs}: {e}")))
        }),
    }
}
