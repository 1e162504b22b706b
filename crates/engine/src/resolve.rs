use std::path::{Component, Path, PathBuf};

use serde_json::{Map, Value};

use toolgate_policy::{placeholders, ArgsSchema};

/// Turns an argv template plus validated arguments into the final argv.
///
/// Templates containing `{name}` placeholders get them substituted in
/// place; an element whose placeholder names an absent optional
/// argument is dropped entirely, which lets optional flags disappear
/// cleanly. Templates without any placeholder get the argument values
/// appended instead, in argument-name order.
///
/// Each value lands inside exactly one argv element, so no shell ever
/// re-tokenizes user input.
pub fn resolve_command(
    template: &[String],
    args: &Map<String, Value>,
    schema: &ArgsSchema,
) -> Vec<String> {
    let uses_placeholders = template.iter().any(|element| !placeholders(element).is_empty());
    if !uses_placeholders {
        let mut argv = template.to_vec();
        for name in schema.properties.keys() {
            if let Some(value) = args.get(name) {
                argv.push(render_value(value));
            }
        }
        return argv;
    }

    let mut argv = Vec::with_capacity(template.len());
    'elements: for element in template {
        let names = placeholders(element);
        if names.is_empty() {
            argv.push(element.clone());
            continue;
        }
        for name in &names {
            if !args.contains_key(name) {
                continue 'elements;
            }
        }
        argv.push(substitute(element, &names, args));
    }
    argv
}

/// One forward pass over the template element. Substituted values are
/// never rescanned, so an argument value that itself contains a
/// `{name}` token stays literal.
fn substitute(element: &str, names: &[String], args: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(element.len());
    let mut rest = element;
    while !rest.is_empty() {
        let next = names
            .iter()
            .filter_map(|name| {
                let token = format!("{{{name}}}");
                rest.find(&token).map(|at| (at, name, token.len()))
            })
            .min_by_key(|&(at, _, _)| at);
        let Some((at, name, token_len)) = next else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..at]);
        if let Some(value) = args.get(name) {
            out.push_str(&render_value(value));
        }
        rest = &rest[at + token_len..];
    }
    out
}

/// Strings render bare, everything else as compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Rejects any absolute path mentioned in a string argument that falls
/// outside the allowlist. Tokens are whitespace-split words starting
/// with '/'; relative paths pass because the command decides what they
/// are relative to. Existing paths are canonicalized so symlinks cannot
/// dodge the check; paths being created resolve through their deepest
/// existing ancestor with `.` and `..` folded out, so traversal cannot
/// point a not-yet-written file outside an allowed base.
pub fn check_path_allowlist(
    args: &Map<String, Value>,
    allowed: &[PathBuf],
) -> Result<(), String> {
    let bases: Vec<PathBuf> = allowed
        .iter()
        .map(|base| base.canonicalize().unwrap_or_else(|_| lexical_clean(base)))
        .collect();
    for (key, value) in args {
        check_value(key, value, &bases)?;
    }
    Ok(())
}

/// Absolute form of a candidate for the prefix check. Existing paths
/// canonicalize outright; an absent path first folds `.`/`..` away and
/// then canonicalizes its deepest existing ancestor, so symlinked
/// directories still resolve even when the final file does not exist
/// yet.
fn resolve_candidate(candidate: &Path) -> PathBuf {
    if let Ok(resolved) = candidate.canonicalize() {
        return resolved;
    }
    let cleaned = lexical_clean(candidate);
    for ancestor in cleaned.ancestors().skip(1) {
        let Ok(resolved) = ancestor.canonicalize() else {
            continue;
        };
        if let Ok(rest) = cleaned.strip_prefix(ancestor) {
            return resolved.join(rest);
        }
    }
    cleaned
}

/// Drops `.` components and folds each `..` into its parent without
/// touching the filesystem. `..` at the root stays at the root.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn check_value(key: &str, value: &Value, bases: &[PathBuf]) -> Result<(), String> {
    match value {
        Value::String(text) => {
            for token in text.split_whitespace() {
                if !token.starts_with('/') {
                    continue;
                }
                let token = token.trim_end_matches([';', '&', '|']);
                let resolved = resolve_candidate(Path::new(token));
                if !bases.iter().any(|base| resolved.starts_with(base)) {
                    return Err(format!(
                        "argument '{key}' references '{token}' outside the allowed paths"
                    ));
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_value(key, item, bases)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for nested in map.values() {
                check_value(key, nested, bases)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
