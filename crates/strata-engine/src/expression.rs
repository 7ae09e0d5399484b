use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::ExpressionError;

const OPEN: &str = "${{";
const SPLAT: &str = "*";

/// A parsed `${{ <path> }}` occurrence.
///
/// Member access (`a.b`), quoted index access (`a["b"]`), numeric index access
/// (`a[0]`) and splats (`a.*`, `a[*]`) all normalize to one list of segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    segments: Vec<String>,
    raw: String,
    field: String,
}

impl Reference {
    /// Parse the text between `${{` and `}}`.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Parse`] when `expression` is not an identifier chain.
    pub fn parse(expression: &str, field: &str) -> Result<Self, ExpressionError> {
        let raw = format!("{OPEN} {} }}}}", expression.trim());
        let fail = |reason: &str| ExpressionError::Parse {
            raw: raw.clone(),
            field: field.to_string(),
            reason: reason.to_string(),
        };

        let chars: Vec<char> = expression.trim().chars().collect();
        if chars.is_empty() {
            return Err(fail("empty path"));
        }

        let mut segments = Vec::new();
        let mut index = 0;
        let mut expect_name = true;
        while index < chars.len() {
            let ch = chars[index];
            if expect_name {
                let start = index;
                if ch == '*' && !segments.is_empty() {
                    index += 1;
                } else if ch.is_ascii_alphanumeric() || ch == '_' {
                    while index < chars.len()
                        && (chars[index].is_ascii_alphanumeric()
                            || chars[index] == '_'
                            || chars[index] == '-')
                    {
                        index += 1;
                    }
                } else {
                    return Err(fail(&format!("unexpected character '{ch}'")));
                }
                let name: String = chars[start..index].iter().collect();
                if segments.is_empty()
                    && !name.starts_with(|first: char| first.is_ascii_alphabetic() || first == '_')
                {
                    return Err(fail("path must start with a name"));
                }
                segments.push(name);
                expect_name = false;
                continue;
            }

            match ch {
                '.' => {
                    expect_name = true;
                    index += 1;
                }
                '[' => {
                    let Some(offset) = chars[index..].iter().position(|item| *item == ']') else {
                        return Err(fail("unterminated index"));
                    };
                    let inner: String = chars[index + 1..index + offset].iter().collect();
                    segments.push(parse_index(inner.trim()).ok_or_else(|| fail("invalid index"))?);
                    index += offset + 1;
                }
                other => return Err(fail(&format!("unexpected character '{other}'"))),
            }
        }

        if expect_name {
            return Err(fail("path ends with '.'"));
        }

        Ok(Self {
            segments,
            raw,
            field: field.to_string(),
        })
    }

    /// First segment: a node name or a static context key such as `vars`.
    #[must_use]
    pub fn root(&self) -> &str {
        self.segments.first().map_or("", String::as_str)
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Normalized dot-path, e.g. `ingresses.backend.url`.
    #[must_use]
    pub fn path(&self) -> String {
        self.segments.join(".")
    }

    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Configuration field the reference was found in.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.path())
    }
}

fn parse_index(inner: &str) -> Option<String> {
    if inner == SPLAT {
        return Some(SPLAT.to_string());
    }
    if !inner.is_empty() && inner.chars().all(|ch| ch.is_ascii_digit()) {
        return Some(inner.to_string());
    }
    for quote in ['"', '\''] {
        if let Some(unquoted) = inner
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
            && !unquoted.is_empty()
            && !unquoted.contains(quote)
        {
            return Some(unquoted.to_string());
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    Reference(Reference),
}

/// Configuration value with every embedded reference parsed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Literal(Value),
    /// The whole value is one reference; it resolves to the referenced value's
    /// own shape rather than to a string.
    Reference(Reference),
    /// Text with embedded references, resolved to a string.
    Template(Vec<Fragment>),
    List(Vec<ConfigValue>),
    Map(Vec<(String, ConfigValue)>),
}

/// Outcome of substituting references against a [`Context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Value),
    /// At least one reference has no value yet; the listed references are missing.
    Pending(Vec<Reference>),
}

impl Resolution {
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Pending(_) => None,
        }
    }
}

impl ConfigValue {
    /// Parse every string inside `value`, recursing through arrays and objects.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Parse`] for the first malformed reference.
    pub fn parse(value: &Value, field: &str) -> Result<Self, ExpressionError> {
        match value {
            Value::String(text) => parse_string(text, field),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| Self::parse(item, &format!("{field}[{index}]")))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Value::Object(map) => map
                .iter()
                .map(|(key, item)| {
                    let nested = if field.is_empty() {
                        key.clone()
                    } else {
                        format!("{field}.{key}")
                    };
                    Self::parse(item, &nested).map(|parsed| (key.clone(), parsed))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Map),
            other => Ok(Self::Literal(other.clone())),
        }
    }

    /// All references in document order.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => found.push(reference),
            Self::Template(fragments) => {
                for fragment in fragments {
                    if let Fragment::Reference(reference) = fragment {
                        found.push(reference);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(found);
                }
            }
            Self::Map(entries) => {
                for (_, item) in entries {
                    item.collect_references(found);
                }
            }
        }
    }

    /// Substitute every reference from `context`.
    #[must_use]
    pub fn resolve(&self, context: &Context) -> Resolution {
        let mut missing = Vec::new();
        let value = self.substitute(context, &mut missing);
        if missing.is_empty() {
            Resolution::Resolved(value)
        } else {
            Resolution::Pending(missing)
        }
    }

    fn substitute(&self, context: &Context, missing: &mut Vec<Reference>) -> Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Reference(reference) => context.lookup(reference).unwrap_or_else(|| {
                missing.push(reference.clone());
                Value::Null
            }),
            Self::Template(fragments) => {
                let mut text = String::new();
                for fragment in fragments {
                    match fragment {
                        Fragment::Text(literal) => text.push_str(literal),
                        Fragment::Reference(reference) => match context.lookup(reference) {
                            Some(value) => text.push_str(&stringify(&value)),
                            None => missing.push(reference.clone()),
                        },
                    }
                }
                Value::String(text)
            }
            Self::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.substitute(context, missing))
                    .collect(),
            ),
            Self::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), item.substitute(context, missing)))
                    .collect(),
            ),
        }
    }
}

fn parse_string(text: &str, field: &str) -> Result<ConfigValue, ExpressionError> {
    if !text.contains(OPEN) {
        return Ok(ConfigValue::Literal(Value::String(text.to_string())));
    }

    let mut fragments = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            fragments.push(Fragment::Text(rest[..start].to_string()));
        }
        let after_dollar = &rest[start + 1..];
        let Some(end) = matching_brace(after_dollar) else {
            return Err(ExpressionError::Parse {
                raw: rest[start..].to_string(),
                field: field.to_string(),
                reason: "unterminated expression".to_string(),
            });
        };
        // `after_dollar[..=end]` is `{{ ... }}`; strip the doubled braces.
        let inner = &after_dollar[2..end - 1];
        fragments.push(Fragment::Reference(Reference::parse(inner, field)?));
        rest = &after_dollar[end + 1..];
    }
    if !rest.is_empty() {
        fragments.push(Fragment::Text(rest.to_string()));
    }

    if let [Fragment::Reference(reference)] = fragments.as_slice() {
        return Ok(ConfigValue::Reference(reference.clone()));
    }
    Ok(ConfigValue::Template(fragments))
}

/// Byte offset of the brace closing the one `text` opens with.
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0_usize;
    for (offset, ch) in text.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (offset >= 3 && text[..offset].ends_with('}')).then_some(offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Values references are resolved against, keyed by root name.
///
/// Node outputs live under the node name; static keys such as `vars` and
/// `environment` are inserted up front. Keys are ordered so serialization and
/// splat queries are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    roots: BTreeMap<String, Value>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, root: impl Into<String>, value: Value) {
        self.roots.insert(root.into(), value);
    }

    /// Look up a parsed reference; `None` means "not yet available".
    #[must_use]
    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        let (root, rest) = reference.segments().split_first()?;
        query(self.roots.get(root)?, rest)
    }
}

/// Walk `segments` into `value`.
///
/// A `*` segment fans out over array items or object values and yields an
/// array of every match. Items with no match are dropped; a splat with no
/// matches at all is `None`.
fn query(value: &Value, segments: &[String]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };

    if first == SPLAT {
        let items: Box<dyn Iterator<Item = &Value>> = match value {
            Value::Array(items) => Box::new(items.iter()),
            Value::Object(map) => Box::new(map.values()),
            _ => return None,
        };
        let matches: Vec<Value> = items.filter_map(|item| query(item, rest)).collect();
        return (!matches.is_empty()).then_some(Value::Array(matches));
    }

    match value {
        Value::Object(map) => query(map.get(first)?, rest),
        Value::Array(items) => query(items.get(first.parse::<usize>().ok()?)?, rest),
        _ => None,
    }
}

/// Every reference inside `value`, in document order.
///
/// # Errors
///
/// Returns [`ExpressionError::Parse`] for a malformed reference.
pub fn find_references(value: &Value) -> Result<Vec<Reference>, ExpressionError> {
    let parsed = ConfigValue::parse(value, "")?;
    Ok(parsed.references().into_iter().cloned().collect())
}

/// Resolve a dot-path against `context`. `Ok(None)` means "not yet available".
///
/// # Errors
///
/// Returns [`ExpressionError::Parse`] when `path` is not a valid path.
pub fn resolve(path: &str, context: &Context) -> Result<Option<Value>, ExpressionError> {
    let reference = Reference::parse(path, path)?;
    Ok(context.lookup(&reference))
}

/// Substitute every reference inside `value`.
///
/// # Errors
///
/// Returns [`ExpressionError::Parse`] for a malformed reference.
pub fn substitute(value: &Value, context: &Context) -> Result<Resolution, ExpressionError> {
    Ok(ConfigValue::parse(value, "")?.resolve(context))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use serde_json::json;

    use super::{ConfigValue, Context, Reference, Resolution, find_references, resolve, substitute};

    fn context() -> Context {
        let mut context = Context::new();
        context.insert("db", json!({ "host": "10.0.0.1", "port": 5432 }));
        context.insert(
            "ingresses",
            json!({
                "backend": { "url": "https://api" },
                "frontend": { "url": "https://www" },
                "admin": { "internal": true },
            }),
        );
        context.insert("pods", json!([{ "ip": "a" }, { "ip": "b" }, { "name": "c" }]));
        context
    }

    #[test]
    fn finds_references_through_nested_values() {
        let value = json!({
            "url": "postgres://${{ db.host }}:${{db.port}}/app",
            "hosts": ["${{ ingresses.backend.url }}", "plain"],
            "count": 3,
        });
        let references = find_references(&value).expect("parse");
        let paths: Vec<String> = references.iter().map(Reference::path).collect();
        assert_eq!(
            paths,
            vec!["ingresses.backend.url", "db.host", "db.port"],
            "objects are visited in key order"
        );
        assert_eq!(references[0].field(), "hosts[0]");
    }

    #[test]
    fn normalizes_index_access_to_dot_path() {
        let reference = Reference::parse("ingresses['backend'].url", "url").expect("parse");
        assert_eq!(reference.path(), "ingresses.backend.url");
        let reference = Reference::parse("pods[1].ip", "ip").expect("parse");
        assert_eq!(reference.segments(), ["pods", "1", "ip"]);
        let reference = Reference::parse("pods[*].ip", "ip").expect("parse");
        assert_eq!(reference.path(), "pods.*.ip");
    }

    #[test]
    fn rejects_malformed_expressions_with_raw_text() {
        for bad in ["", "db..host", "db.", "1db", "db[", "db[x]", "db host", "*.x"] {
            let error = Reference::parse(bad, "url").expect_err(bad);
            assert!(error.to_string().contains("url"), "{error}");
        }

        let error = find_references(&json!({ "url": "${{ db.host" })).expect_err("unterminated");
        assert!(error.to_string().contains("${{ db.host"), "{error}");
    }

    #[test]
    fn ignores_single_brace_syntax() {
        let references = find_references(&json!("${HOME}/bin")).expect("parse");
        assert!(references.is_empty());
    }

    #[test]
    fn missing_paths_are_not_yet_available() {
        let context = context();
        for path in ["app.url", "db.user", "db.host.inner", "pods.7", "pods.*.missing"] {
            assert_eq!(resolve(path, &context).expect("valid path"), None, "{path}");
        }
        assert_eq!(resolve("db.host", &Context::new()).expect("valid"), None);
    }

    #[test]
    fn splat_returns_every_match_in_order() {
        let context = context();
        assert_eq!(
            resolve("pods.*.ip", &context).expect("valid"),
            Some(json!(["a", "b"]))
        );
        assert_eq!(
            resolve("ingresses.*.url", &context).expect("valid"),
            Some(json!(["https://api", "https://www"])),
            "object splat follows key order"
        );
    }

    #[test]
    fn whole_value_reference_keeps_structure() {
        let resolved = substitute(&json!({ "target": "${{ db }}" }), &context()).expect("parse");
        assert_eq!(
            resolved,
            Resolution::Resolved(json!({ "target": { "host": "10.0.0.1", "port": 5432 } }))
        );
    }

    #[test]
    fn interpolation_preserves_surrounding_text() {
        let resolved =
            substitute(&json!("postgres://${{ db.host }}:${{ db.port }}/app"), &context())
                .expect("parse");
        assert_eq!(
            resolved,
            Resolution::Resolved(json!("postgres://10.0.0.1:5432/app"))
        );
    }

    #[test]
    fn pending_lists_every_missing_reference() {
        let resolved =
            substitute(&json!(["${{ app.url }}", "${{ db.host }}", "${{ cache.host }}"]), &context())
                .expect("parse");
        let missing = match resolved {
            Resolution::Pending(missing) => missing,
            Resolution::Resolved(_) => Vec::new(),
        };
        let paths: Vec<String> = missing.iter().map(Reference::path).collect();
        assert_eq!(paths, vec!["app.url", "cache.host"]);
    }

    #[test]
    fn resolution_is_deterministic() {
        let value = json!({ "b": "${{ ingresses.*.url }}", "a": "x-${{ pods.*.ip }}" });
        let parsed = ConfigValue::parse(&value, "").expect("parse");
        let first = serde_json::to_vec(&parsed.resolve(&context()).into_value())
            .expect("serialize");
        let second = serde_json::to_vec(&parsed.resolve(&context()).into_value())
            .expect("serialize");
        assert_eq!(first, second);
    }
}
