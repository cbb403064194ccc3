//! Assertions over the last command's results and the session's files.
//!
//! Every assertion funnels through [`Session::make_assertion`]: on success
//! it counts, on failure it logs the label and diagnostics and returns the
//! interrupt that aborts the test file. [`Session::not`] flips the operator
//! for exactly one nested assertion.

use crate::diff::{DiffMode, unified_diff};
use crate::error::Interrupt;
use crate::executor::indent;
use crate::session::Session;
use regex::RegexBuilder;
use std::fmt::Debug;
use std::fs;
use std::path::Path;
use tracing::{error, trace};

/// Comparison used by the next assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssertOperator {
    #[default]
    Equals,
    NotEquals,
}

/// Escape regex metacharacters so a pattern matches `text` literally.
pub fn escape_literal(text: &str) -> String {
    regex::escape(text)
}

/// Which captured stream an output assertion reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    Output,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::Output => "output",
        }
    }
}

impl Session {
    /// Run one assertion with the operator flipped to `NotEquals`.
    ///
    /// The operator is reset to `Equals` afterwards whatever the outcome.
    /// Not a stack: `not(not(..))` behaves like a single `not`.
    pub fn not<T>(
        &mut self,
        assertion: impl FnOnce(&mut Session) -> Result<T, Interrupt>,
    ) -> Result<T, Interrupt> {
        self.operator = AssertOperator::NotEquals;
        let result = assertion(self);
        self.operator = AssertOperator::Equals;
        result
    }

    /// Compare `expected` with `actual` under the pending operator.
    ///
    /// Consumes the operator. On failure the session is marked failed and
    /// the returned interrupt must be propagated.
    pub fn make_assertion<T: PartialEq + Debug>(
        &mut self,
        expected: T,
        actual: T,
        label: &str,
        diagnostics: &[String],
    ) -> Result<(), Interrupt> {
        let operator = std::mem::take(&mut self.operator);
        let holds = match operator {
            AssertOperator::Equals => expected == actual,
            AssertOperator::NotEquals => expected != actual,
        };

        if holds {
            self.count_assertion();
            trace!(label, ?operator, "assertion passed");
            return Ok(());
        }

        let negated = if operator == AssertOperator::NotEquals { "not " } else { "" };
        error!("{label}");
        error!("  expected {negated}{expected:?}");
        error!("  actual       {actual:?}");
        for line in diagnostics {
            error!("  {line}");
        }
        Err(self.interrupt(Interrupt::assertion(label)))
    }

    /// Fail immediately, bypassing the operator.
    fn fail(&mut self, label: String, diagnostics: &[String]) -> Interrupt {
        self.operator = AssertOperator::Equals;
        error!("{label}");
        for line in diagnostics {
            error!("  {line}");
        }
        self.interrupt(Interrupt::assertion(label))
    }

    pub fn assert_equals(&mut self, expected: &str, actual: &str) -> Result<(), Interrupt> {
        self.make_assertion(expected, actual, "values differ", &[])
    }

    pub fn assert_exit_code(&mut self, expected: i32) -> Result<(), Interrupt> {
        let actual = self.last_exit_code()?;
        let label = format!("exit code should be {expected}");
        let diagnostics = match actual {
            Some(_) => self.output_diagnostics()?,
            None => vec!["no command has been executed".to_string()],
        };
        self.make_assertion(Some(expected), actual, &label, &diagnostics)
    }

    pub fn assert_success(&mut self) -> Result<(), Interrupt> {
        self.assert_exit_code(0)
    }

    /// Last stdout contains `text` literally (empty `text`: stdout is empty).
    pub fn assert_stdout(&mut self, text: &str) -> Result<(), Interrupt> {
        self.assert_stream(Stream::Stdout, &escape_literal(text))
    }

    pub fn assert_stderr(&mut self, text: &str) -> Result<(), Interrupt> {
        self.assert_stream(Stream::Stderr, &escape_literal(text))
    }

    pub fn assert_output(&mut self, text: &str) -> Result<(), Interrupt> {
        self.assert_stream(Stream::Output, &escape_literal(text))
    }

    /// Last stdout matches `pattern` (empty `pattern`: stdout is empty).
    pub fn assert_stdout_re(&mut self, pattern: &str) -> Result<(), Interrupt> {
        self.assert_stream(Stream::Stdout, pattern)
    }

    pub fn assert_stderr_re(&mut self, pattern: &str) -> Result<(), Interrupt> {
        self.assert_stream(Stream::Stderr, pattern)
    }

    pub fn assert_output_re(&mut self, pattern: &str) -> Result<(), Interrupt> {
        self.assert_stream(Stream::Output, pattern)
    }

    fn assert_stream(&mut self, stream: Stream, pattern: &str) -> Result<(), Interrupt> {
        let content = match stream {
            Stream::Stdout => self.last_stdout()?,
            Stream::Stderr => self.last_stderr()?,
            Stream::Output => self.last_output()?,
        };
        self.assert_matches(stream.name(), &content, pattern)
    }

    /// File contains `text` literally (empty `text`: file is empty).
    pub fn assert_file(&mut self, path: impl AsRef<Path>, text: &str) -> Result<(), Interrupt> {
        self.assert_file_re(path, &escape_literal(text))
    }

    pub fn assert_file_re(
        &mut self,
        path: impl AsRef<Path>,
        pattern: &str,
    ) -> Result<(), Interrupt> {
        let path = self.resolve(path);
        let content = self.read_for_assertion(&path)?;
        self.assert_matches(&path.display().to_string(), &content, pattern)
    }

    /// Regex match against content, line-anchored; an empty pattern expects empty content.
    pub fn assert_matches(
        &mut self,
        what: &str,
        content: &str,
        pattern: &str,
    ) -> Result<(), Interrupt> {
        if pattern.is_empty() {
            let label = format!("{what} should be empty");
            return self.make_assertion("", content, &label, &[]);
        }

        let re = match RegexBuilder::new(pattern).multi_line(true).build() {
            Ok(re) => re,
            Err(e) => {
                return Err(self.fail(format!("invalid regex {pattern:?}"), &[e.to_string()]));
            }
        };
        let label = format!("{what} should match {pattern:?}");
        let diagnostics = content_diagnostics(what, content);
        self.make_assertion(true, re.is_match(content), &label, &diagnostics)
    }

    /// Two files agree, line by line.
    pub fn assert_no_diff(
        &mut self,
        expected: impl AsRef<Path>,
        actual: impl AsRef<Path>,
        mode: DiffMode,
    ) -> Result<(), Interrupt> {
        let expected = self.resolve(expected);
        let actual = self.resolve(actual);
        let expected_text = self.read_for_assertion(&expected)?;
        let actual_text = self.read_for_assertion(&actual)?;
        self.assert_texts_agree(
            &expected_text,
            &actual_text,
            mode,
            &expected.display().to_string(),
            &actual.display().to_string(),
        )
    }

    /// Last stdout agrees with `expected`, line by line.
    pub fn assert_stdout_no_diff(
        &mut self,
        expected: &str,
        mode: DiffMode,
    ) -> Result<(), Interrupt> {
        let actual = self.last_stdout()?;
        self.assert_texts_agree(expected, &actual, mode, "expected", "stdout")
    }

    fn assert_texts_agree(
        &mut self,
        expected: &str,
        actual: &str,
        mode: DiffMode,
        expected_label: &str,
        actual_label: &str,
    ) -> Result<(), Interrupt> {
        let diff = unified_diff(expected, actual, mode, expected_label, actual_label);
        let diagnostics: Vec<String> = diff
            .as_deref()
            .map(|d| d.lines().map(str::to_string).collect())
            .unwrap_or_default();
        let label = format!("{actual_label} should not differ from {expected_label}");
        self.make_assertion(true, diff.is_none(), &label, &diagnostics)
    }

    fn read_for_assertion(&mut self, path: &Path) -> Result<String, Interrupt> {
        match fs::read(path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => Err(self.fail(format!("cannot read {}", path.display()), &[e.to_string()])),
        }
    }

    fn output_diagnostics(&mut self) -> Result<Vec<String>, Interrupt> {
        let stdout = self.last_stdout()?;
        let stderr = self.last_stderr()?;
        let mut lines = content_diagnostics("stdout", &stdout);
        lines.extend(content_diagnostics("stderr", &stderr));
        Ok(lines)
    }
}

fn content_diagnostics(what: &str, content: &str) -> Vec<String> {
    if content.is_empty() {
        vec![format!("{what} is empty")]
    } else {
        vec![format!("{what}:\n{}", indent(content))]
    }
}
