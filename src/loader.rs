//! Script loader.
//!
//! Loads test scripts and the suite configuration from disk, discovers test
//! files and keeps track of the last failed one.

use crate::schema::{Step, SuiteConfig, TestScript};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for loading scripts and configuration.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid TOML in {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unsupported file format: {0} (expected .yaml, .yml, or .toml)")]
    UnsupportedFormat(String),
    #[error("{}: step {step}: {reason}", path.display())]
    Invalid {
        path: PathBuf,
        step: usize,
        reason: String,
    },
}

/// The name of the suite configuration file.
pub const SUITE_CONFIG_FILENAME: &str = "shtest.yaml";

/// Marker file in the base directory naming the last failed test file.
pub const LAST_TESTCASE: &str = ".last-testcase";

const SCRIPT_EXTENSIONS: [&str; 3] = ["yaml", "yml", "toml"];

fn read(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and validate a test script.
pub fn load_script(path: &Path) -> Result<TestScript, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if !SCRIPT_EXTENSIONS.contains(&ext) {
        return Err(LoadError::UnsupportedFormat(ext.to_string()));
    }
    let contents = read(path)?;

    let script: TestScript = if ext == "toml" {
        toml::from_str(&contents).map_err(|source| LoadError::Toml {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        serde_yaml::from_str(&contents).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };

    for (index, step) in script.steps.iter().enumerate() {
        if let Step::Not(inner) = step
            && !inner.is_assertion()
        {
            return Err(LoadError::Invalid {
                path: path.to_path_buf(),
                step: index + 1,
                reason: format!("`not` cannot wrap `{}`", inner.keyword()),
            });
        }
    }
    Ok(script)
}

/// Load suite configuration from a directory.
///
/// Looks for `shtest.yaml` in the given directory.
/// Returns `None` if the file doesn't exist, `Err` if it exists but is invalid.
pub fn load_suite_config(dir: &Path) -> Result<Option<SuiteConfig>, LoadError> {
    let config_path = dir.join(SUITE_CONFIG_FILENAME);

    if !config_path.exists() {
        return Ok(None);
    }

    let contents = read(&config_path)?;
    let config = serde_yaml::from_str(&contents).map_err(|source| LoadError::Yaml {
        path: config_path,
        source,
    })?;
    Ok(Some(config))
}

/// Find test files in `dir`, sorted by path.
///
/// Skips the suite configuration and any path in `exclude`.
pub fn find_tests(
    dir: &Path,
    recursive: bool,
    exclude: &[PathBuf],
) -> Result<Vec<PathBuf>, LoadError> {
    let mut tests = Vec::new();
    collect_tests(dir, recursive, exclude, &mut tests)?;
    tests.sort();
    Ok(tests)
}

fn collect_tests(
    dir: &Path,
    recursive: bool,
    exclude: &[PathBuf],
    tests: &mut Vec<PathBuf>,
) -> Result<(), LoadError> {
    let io_error = |source: io::Error| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();

        if path.is_dir() {
            if recursive {
                collect_tests(&path, recursive, exclude, tests)?;
            }
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && SCRIPT_EXTENSIONS.contains(&ext)
        {
            if path.file_name().is_some_and(|f| f == SUITE_CONFIG_FILENAME)
                || exclude.iter().any(|excluded| same_file(excluded, &path))
            {
                continue;
            }
            tests.push(path);
        }
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Glob match supporting `*` and `?`, anchored at both ends.
pub fn matches_glob(pattern: &str, candidate: &str) -> bool {
    let mut source = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source).is_ok_and(|re| re.is_match(candidate))
}

/// Test files whose file name, stem or path relative to `base` matches `pattern`.
pub fn select_tests<'a>(tests: &'a [PathBuf], base: &Path, pattern: &str) -> Vec<&'a PathBuf> {
    tests
        .iter()
        .filter(|path| {
            let path = path.as_path();
            let name = path.file_name().map(|n| n.to_string_lossy());
            let stem = path.file_stem().map(|n| n.to_string_lossy());
            let relative = path.strip_prefix(base).unwrap_or(path).to_string_lossy();
            [name, stem, Some(relative)]
                .into_iter()
                .flatten()
                .any(|candidate| matches_glob(pattern, &candidate))
        })
        .collect()
}

/// Remember `test` as the last failed test file.
pub fn record_last_failed(base: &Path, test: &Path) -> Result<(), LoadError> {
    let marker = base.join(LAST_TESTCASE);
    let relative = test.strip_prefix(base).unwrap_or(test);
    fs::write(&marker, format!("{}\n", relative.display())).map_err(|source| LoadError::Io {
        path: marker,
        source,
    })
}

/// The last failed test file, resolved against `base`, if one was recorded.
pub fn read_last_failed(base: &Path) -> Result<Option<PathBuf>, LoadError> {
    let marker = base.join(LAST_TESTCASE);
    match fs::read_to_string(&marker) {
        Ok(content) => {
            let recorded = content.trim();
            Ok((!recorded.is_empty()).then(|| base.join(recorded)))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(LoadError::Io { path: marker, source }),
    }
}
