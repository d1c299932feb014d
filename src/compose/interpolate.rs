//! `${VAR}` substitution in compose files.
//!
//! Supported forms: `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`,
//! `${VAR:?message}`, `${VAR?message}`, `${VAR:+replacement}`,
//! `${VAR+replacement}` and `$$` for a literal `$`. Defaults and replacements
//! are interpolated themselves.

use crate::error::{Error, Result};
use log::warn;
use serde_yaml::Value;
use std::collections::HashMap;

pub type Environment = HashMap<String, String>;

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub fn interpolate(input: &str, env: &Environment) -> Result<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        match chars.get(i + 1) {
            Some('$') => {
                out.push('$');
                i += 2;
            }
            Some('{') => {
                let end = closing_brace(&chars, i + 2).ok_or_else(|| {
                    Error::invalid(format!("unterminated variable reference in {input:?}"))
                })?;
                let body: String = chars[i + 2..end].iter().collect();
                out.push_str(&expand(&body, env)?);
                i = end + 1;
            }
            Some(&c) if is_name_start(c) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_name_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                out.push_str(&lookup(&name, env));
                i = end;
            }
            _ => {
                out.push('$');
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Index of the `}` closing a `${` whose body starts at `from`.
fn closing_brace(chars: &[char], from: usize) -> Option<usize> {
    let mut depth = 0;
    let mut i = from;
    while i < chars.len() {
        match chars[i] {
            '$' if chars.get(i + 1) == Some(&'{') => {
                depth += 1;
                i += 2;
                continue;
            }
            '}' if depth == 0 => return Some(i),
            '}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    None
}

fn lookup(name: &str, env: &Environment) -> String {
    match env.get(name) {
        Some(value) => value.clone(),
        None => {
            warn!("variable {name} is not set, substituting an empty string");
            String::new()
        }
    }
}

fn expand(body: &str, env: &Environment) -> Result<String> {
    let name_len = body
        .char_indices()
        .find(|(_, c)| !is_name_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    let (name, rest) = body.split_at(name_len);
    if name.is_empty() || !name.starts_with(is_name_start) {
        return Err(Error::invalid(format!("invalid variable name in ${{{body}}}")));
    }
    if rest.is_empty() {
        return Ok(lookup(name, env));
    }

    let value = env.get(name);
    let (op, arg) = if let Some(arg) = rest.strip_prefix(":-") {
        (":-", arg)
    } else if let Some(arg) = rest.strip_prefix(":?") {
        (":?", arg)
    } else if let Some(arg) = rest.strip_prefix(":+") {
        (":+", arg)
    } else {
        rest.split_at_checked(1)
            .ok_or_else(|| Error::invalid(format!("invalid substitution ${{{body}}}")))?
    };

    let set = value.is_some();
    let non_empty = value.is_some_and(|v| !v.is_empty());
    match op {
        ":-" if non_empty => Ok(value.cloned().unwrap_or_default()),
        ":-" => interpolate(arg, env),
        "-" if set => Ok(value.cloned().unwrap_or_default()),
        "-" => interpolate(arg, env),
        ":?" if non_empty => Ok(value.cloned().unwrap_or_default()),
        "?" if set => Ok(value.cloned().unwrap_or_default()),
        ":?" | "?" => Err(Error::invalid(format!(
            "required variable {name} is missing a value: {}",
            interpolate(arg, env)?
        ))),
        ":+" if non_empty => interpolate(arg, env),
        "+" if set => interpolate(arg, env),
        ":+" | "+" => Ok(String::new()),
        _ => Err(Error::invalid(format!("invalid substitution ${{{body}}}"))),
    }
}

/// Interpolates every string scalar of a parsed yaml document in place.
/// Mapping keys are left alone.
pub fn interpolate_value(value: &mut Value, env: &Environment) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = interpolate(s, env)?;
            }
        }
        Value::Sequence(items) => {
            for item in items {
                interpolate_value(item, env)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, env)?;
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn env() -> Environment {
        HashMap::from([
            ("TAG".to_string(), "1.25".to_string()),
            ("EMPTY".to_string(), String::new()),
            ("PORT".to_string(), "8080".to_string()),
        ])
    }

    #[test]
    fn plain_and_braced_references() {
        let env = env();
        assert_eq!(interpolate("nginx:$TAG", &env).unwrap(), "nginx:1.25");
        assert_eq!(interpolate("nginx:${TAG}-alpine", &env).unwrap(), "nginx:1.25-alpine");
        assert_eq!(interpolate("${MISSING}x", &env).unwrap(), "x");
        assert_eq!(interpolate("cost: $$5 and $", &env).unwrap(), "cost: $5 and $");
    }

    #[test]
    fn defaults_distinguish_unset_from_empty() {
        let env = env();
        assert_eq!(interpolate("${EMPTY:-fallback}", &env).unwrap(), "fallback");
        assert_eq!(interpolate("${EMPTY-fallback}", &env).unwrap(), "");
        assert_eq!(interpolate("${MISSING-fallback}", &env).unwrap(), "fallback");
        assert_eq!(interpolate("${TAG:-fallback}", &env).unwrap(), "1.25");
    }

    #[test]
    fn nested_defaults() {
        let env = env();
        assert_eq!(
            interpolate("${MISSING:-${PORT:-80}}:80", &env).unwrap(),
            "8080:80"
        );
        assert_eq!(interpolate("${MISSING:-${ALSO_MISSING:-80}}", &env).unwrap(), "80");
    }

    #[test]
    fn required_variables() {
        let env = env();
        assert_eq!(interpolate("${TAG:?tag required}", &env).unwrap(), "1.25");
        assert_eq!(interpolate("${EMPTY?set but empty is fine}", &env).unwrap(), "");
        let err = interpolate("${EMPTY:?tag required}", &env).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("tag required"));
        assert!(interpolate("${MISSING?}", &env).is_err());
    }

    #[test]
    fn replacement_when_set() {
        let env = env();
        assert_eq!(interpolate("${TAG:+pinned}", &env).unwrap(), "pinned");
        assert_eq!(interpolate("${EMPTY:+pinned}", &env).unwrap(), "");
        assert_eq!(interpolate("${EMPTY+pinned}", &env).unwrap(), "pinned");
    }

    #[test]
    fn malformed_references_are_rejected() {
        let env = env();
        assert!(interpolate("${TAG", &env).is_err());
        assert!(interpolate("${}", &env).is_err());
        assert!(interpolate("${1ABC}", &env).is_err());
    }

    #[test]
    fn interpolates_nested_documents() {
        let mut doc: Value = serde_yaml::from_str(
            r#"
services:
  web:
    image: "nginx:${TAG}"
    ports: ["${PORT}:80"]
    environment:
      $KEY: "$$HOME"
"#,
        )
        .unwrap();
        interpolate_value(&mut doc, &env()).unwrap();
        let web = &doc["services"]["web"];
        assert_eq!(web["image"].as_str(), Some("nginx:1.25"));
        assert_eq!(web["ports"][0].as_str(), Some("8080:80"));
        assert_eq!(web["environment"]["$KEY"].as_str(), Some("$HOME"));
    }
}
