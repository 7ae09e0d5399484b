use std::cmp::Reverse;
use std::collections::BTreeSet;

const REDACTED: &str = "[REDACTED]";
const MIN_REDACTED_LEN: usize = 3;

/// Replace every sensitive value in `text`, in raw and JSON-escaped form.
///
/// Values shorter than three characters are left alone.
#[must_use]
pub fn redact_sensitive(text: &str, sensitive_values: &BTreeSet<String>) -> String {
    let mut needles: BTreeSet<String> = BTreeSet::new();
    for value in sensitive_values
        .iter()
        .filter(|value| value.chars().count() >= MIN_REDACTED_LEN)
    {
        if let Some(escaped) = json_escaped(value) {
            needles.insert(escaped);
        }
        needles.insert(value.clone());
    }

    // Longest first: a shorter value must not split a longer one
    let mut ordered: Vec<&String> = needles.iter().collect();
    ordered.sort_by_key(|needle| Reverse(needle.len()));

    let mut result = text.to_string();
    for needle in ordered {
        result = result.replace(needle.as_str(), REDACTED);
    }
    result
}

fn json_escaped(value: &str) -> Option<String> {
    let encoded = serde_json::to_string(value).ok()?;
    let inner = encoded.strip_prefix('"')?.strip_suffix('"')?;
    (inner != value).then(|| inner.to_string())
}
