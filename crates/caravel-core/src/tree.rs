//! YAML configuration tree utilities.
//!
//! The effective configuration is a `serde_yaml` value tree: the merged
//! package description plus runtime and runner sections. This module
//! provides the operations the rest of the engine performs on that tree:
//!
//! - Dotted-path navigation (`get_path` / `set_path`)
//! - Recursive deep merge with overlay-wins semantics (`deep_merge`)
//! - String-level variable interpolation to a fixpoint (`resolve`)
//!
//! Interpolation substitutes `${a.b.c}` tokens with the referenced node's
//! scalar rendering and repeats until no token remains. A pass budget of
//! 16 bounds reference chains; exceeding it is reported as a cycle.

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::{CaravelError, CaravelResult};

/// Maximum substitution passes before a reference chain is declared a cycle.
const MAX_RESOLVE_DEPTH: usize = 16;

/// Navigate into a nested value by dotted path (`"runner.image"`).
#[must_use]
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_mapping()?.get(segment)?;
    }
    Some(current)
}

/// Fetch a string leaf by dotted path.
#[must_use]
pub fn get_str<'a>(root: &'a Value, path: &str) -> Option<&'a str> {
    get_path(root, path).and_then(Value::as_str)
}

/// Set a value at a dotted path, creating intermediate mappings as needed.
///
/// A non-mapping intermediate node is replaced by a mapping; an empty
/// path is ignored with a warning.
pub fn set_path(root: &mut Value, path: &str, new_val: Value) {
    if path.is_empty() {
        warn!("set_path: empty path; skipping");
        return;
    }

    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_mapping() {
            *current = Value::Mapping(Mapping::new());
        }
        let Some(map) = current.as_mapping_mut() else {
            return;
        };
        let key = Value::from(segment);
        if segments.peek().is_none() {
            map.insert(key, new_val);
            return;
        }
        current = map
            .entry(key)
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
}

/// Recursively deep-merge `overlay` into `base`.
///
/// - Mappings merge recursively per-key.
/// - Scalars and sequences from the overlay **replace** the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_map.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Apply a rewrite to every string leaf in the tree.
///
/// Used to canonicalize workspace aliases (`${workspace}`, `$WORKSPACE`)
/// into ordinary tree references before a resolve pass.
pub fn map_strings(root: &mut Value, f: &impl Fn(&str) -> String) {
    match root {
        Value::String(s) => {
            let rewritten = f(s);
            if rewritten != *s {
                *s = rewritten;
            }
        },
        Value::Mapping(map) => {
            for (_, child) in map.iter_mut() {
                map_strings(child, f);
            }
        },
        Value::Sequence(seq) => {
            for child in seq.iter_mut() {
                map_strings(child, f);
            }
        },
        _ => {},
    }
}

/// Evaluate all `${a.b.c}` interpolations in the tree to a fixpoint.
///
/// # Errors
///
/// Returns a `configuration` error when a referenced path does not exist
/// or points at a non-scalar node, and when the pass budget is exceeded
/// (a reference cycle).
pub fn resolve(root: &mut Value) -> CaravelResult<()> {
    for _ in 0..MAX_RESOLVE_DEPTH {
        let snapshot = root.clone();
        if !substitute_pass(root, &snapshot)? {
            return Ok(());
        }
    }
    Err(CaravelError::config(format!(
        "variable interpolation did not terminate within {MAX_RESOLVE_DEPTH} passes; \
         reference cycle suspected"
    )))
}

/// One substitution pass over every string leaf. Returns whether any
/// token was substituted.
fn substitute_pass(node: &mut Value, snapshot: &Value) -> CaravelResult<bool> {
    match node {
        Value::String(s) => {
            if let Some(rewritten) = substitute_string(s, snapshot)? {
                *s = rewritten;
                Ok(true)
            } else {
                Ok(false)
            }
        },
        Value::Mapping(map) => {
            let mut changed = false;
            for (_, child) in map.iter_mut() {
                changed |= substitute_pass(child, snapshot)?;
            }
            Ok(changed)
        },
        Value::Sequence(seq) => {
            let mut changed = false;
            for child in seq.iter_mut() {
                changed |= substitute_pass(child, snapshot)?;
            }
            Ok(changed)
        },
        _ => Ok(false),
    }
}

/// Substitute all `${...}` tokens in one string. Returns `None` when the
/// string contains no token.
fn substitute_string(s: &str, snapshot: &Value) -> CaravelResult<Option<String>> {
    if !s.contains("${") {
        return Ok(None);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    let mut substituted = false;
    while let Some(start) = rest.find("${") {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        let Some(end) = tail.find('}') else {
            // Unterminated token; keep the remainder verbatim.
            out.push_str(tail);
            rest = "";
            break;
        };
        let reference = &tail[2..end];
        let target = get_path(snapshot, reference).ok_or_else(|| {
            CaravelError::config(format!("unresolved reference `${{{reference}}}`"))
        })?;
        out.push_str(&scalar_to_string(target, reference)?);
        substituted = true;
        rest = &tail[end..][1..];
    }
    out.push_str(rest);
    if substituted {
        Ok(Some(out))
    } else {
        Ok(None)
    }
}

/// Render a referenced node as a string for substitution.
fn scalar_to_string(val: &Value, reference: &str) -> CaravelResult<String> {
    match val {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(CaravelError::config(format!(
            "reference `${{{reference}}}` resolves to null"
        ))),
        _ => Err(CaravelError::config(format!(
            "reference `${{{reference}}}` resolves to a non-scalar node"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_get_path() {
        let root = tree("runner:\n  image: ubuntu:18.04\n  count: 2\n");
        assert_eq!(get_str(&root, "runner.image"), Some("ubuntu:18.04"));
        assert_eq!(
            get_path(&root, "runner.count").and_then(Value::as_u64),
            Some(2)
        );
        assert!(get_path(&root, "runner.missing").is_none());
        assert!(get_path(&root, "runner.image.deeper").is_none());
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut root = Value::Mapping(Mapping::new());
        set_path(&mut root, "runtime.workspace", Value::from("/pkg/workspace"));
        assert_eq!(get_str(&root, "runtime.workspace"), Some("/pkg/workspace"));
    }

    #[test]
    fn test_set_path_overwrites_scalar_intermediate() {
        let mut root = tree("runtime: oops\n");
        set_path(&mut root, "runtime.root", Value::from("/pkg"));
        assert_eq!(get_str(&root, "runtime.root"), Some("/pkg"));
    }

    #[test]
    fn test_deep_merge_overlay_wins() {
        let mut base = tree("runner:\n  image: a:0.0.1\n  executable: docker\n");
        let overlay = tree("runner:\n  image: a:0.0.2\n");
        deep_merge(&mut base, &overlay);
        assert_eq!(get_str(&base, "runner.image"), Some("a:0.0.2"));
        assert_eq!(get_str(&base, "runner.executable"), Some("docker"));
    }

    #[test]
    fn test_deep_merge_sequences_replace() {
        let mut base = tree("args: [a, b]\n");
        let overlay = tree("args: [c]\n");
        deep_merge(&mut base, &overlay);
        let args = get_path(&base, "args").unwrap().as_sequence().unwrap();
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_resolve_simple_reference() {
        let mut root = tree("name: mnist\nimage: 'repo/${name}:latest'\n");
        resolve(&mut root).unwrap();
        assert_eq!(get_str(&root, "image"), Some("repo/mnist:latest"));
    }

    #[test]
    fn test_resolve_chained_references() {
        let mut root = tree(
            "runtime:\n  root: /pkg\n  workspace: '${runtime.root}/workspace'\ndata: '${runtime.workspace}/input'\n",
        );
        resolve(&mut root).unwrap();
        assert_eq!(get_str(&root, "data"), Some("/pkg/workspace/input"));
    }

    #[test]
    fn test_resolve_numeric_reference() {
        let mut root = tree("count: 4\nflag: 'gpus=${count}'\n");
        resolve(&mut root).unwrap();
        assert_eq!(get_str(&root, "flag"), Some("gpus=4"));
    }

    #[test]
    fn test_resolve_unresolved_reference_fails() {
        let mut root = tree("image: '${runner.image}'\n");
        let err = resolve(&mut root).unwrap_err();
        assert!(err.to_string().contains("unresolved reference"));
    }

    #[test]
    fn test_resolve_cycle_fails() {
        let mut root = tree("a: '${b}'\nb: '${a}'\n");
        let err = resolve(&mut root).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut root = tree("name: mnist\nimage: 'repo/${name}'\n");
        resolve(&mut root).unwrap();
        let first = root.clone();
        resolve(&mut root).unwrap();
        assert_eq!(root, first);
    }

    #[test]
    fn test_map_strings_rewrites_aliases() {
        let mut root = tree("default: '${workspace}/input'\n");
        map_strings(&mut root, &|s: &str| {
            s.replace("${workspace}", "${runtime.workspace}")
        });
        assert_eq!(
            get_str(&root, "default"),
            Some("${runtime.workspace}/input")
        );
    }
}
