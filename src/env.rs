//! Variable interpolation for assertion arguments.

use std::collections::HashMap;

/// Interpolate `${VAR}` references in a string.
///
/// First checks the provided map, then falls back to process environment
/// variables. A bare `$VAR` is left untouched. Returns an error message if a
/// referenced variable is not set.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// let vars = HashMap::from([("EXIT_CODE".to_string(), "1".to_string())]);
/// assert_eq!(shtest::env::interpolate("code=${EXIT_CODE}", &vars).unwrap(), "code=1");
/// ```
pub fn interpolate(s: &str, vars: &HashMap<String, String>) -> Result<String, String> {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(open) = rest.find("${") {
        result.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("Unclosed variable reference: ${{{after}"))?;
        let name = &after[..close];
        match vars.get(name) {
            Some(value) => result.push_str(value),
            None => {
                let value =
                    std::env::var(name).map_err(|_| format!("Variable '{name}' is not set"))?;
                result.push_str(&value);
            }
        }
        rest = &after[close + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Whether a string needs interpolation at all.
pub fn has_references(s: &str) -> bool {
    s.contains("${")
}
