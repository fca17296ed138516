//! JSON pointer (RFC 6901) helpers over `serde_json::Value`.

use serde_json::Value;

/// Split a pointer into unescaped reference tokens. `None` when the pointer
/// is malformed: missing the leading `/`, or carrying a `~` escape other than
/// `~0`/`~1`.
pub(crate) fn parse(pointer: &str) -> Option<Vec<String>> {
    if pointer.is_empty() {
        return Some(Vec::new());
    }
    let rest = pointer.strip_prefix('/')?;
    rest.split('/').map(unescape).collect()
}

fn unescape(token: &str) -> Option<String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return None,
        }
    }
    Some(out)
}

fn step<'a>(cur: &'a mut Value, token: &str) -> Option<&'a mut Value> {
    match cur {
        Value::Object(map) => map.get_mut(token),
        Value::Array(items) => items.get_mut(token.parse::<usize>().ok()?),
        _ => None,
    }
}

/// Value at `tokens`, if present.
pub(crate) fn get_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    tokens.iter().try_fold(doc, |cur, t| step(cur, t))
}

/// Remove the value at `tokens`. Returns whether anything was removed; an
/// absent path, or the empty pointer, is left alone.
pub(crate) fn remove(doc: &mut Value, tokens: &[String]) -> bool {
    let Some((last, parents)) = tokens.split_last() else { return false };
    match get_mut(doc, parents) {
        Some(Value::Object(map)) => map.remove(last).is_some(),
        Some(Value::Array(items)) => match last.parse::<usize>() {
            Ok(i) if i < items.len() => {
                items.remove(i);
                true
            }
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_escapes() {
        assert_eq!(
            parse("/metadata/annotations/sidecar.istio.io~1status").unwrap(),
            vec!["metadata", "annotations", "sidecar.istio.io/status"]
        );
        assert_eq!(parse("/a~0b").unwrap(), vec!["a~b"]);
        assert_eq!(parse("").unwrap(), Vec::<String>::new());
        assert!(parse("no-slash").is_none());
        assert!(parse("/bad~2").is_none());
    }

    #[test]
    fn removes_object_keys_and_array_items() {
        let mut doc = json!({"a": {"b": 1, "c": [1, 2, 3]}});
        assert!(remove(&mut doc, &parse("/a/c/1").unwrap()));
        assert!(remove(&mut doc, &parse("/a/b").unwrap()));
        assert!(!remove(&mut doc, &parse("/a/b").unwrap()));
        assert!(!remove(&mut doc, &parse("/a/c/9").unwrap()));
        assert!(!remove(&mut doc, &parse("").unwrap()));
        assert_eq!(doc, json!({"a": {"c": [1, 3]}}));
    }
}
