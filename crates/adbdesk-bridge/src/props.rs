use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// One `getprop` line: `[key]: [value]`, value possibly empty. Interleaved
/// warnings from the tool do not match and are skipped.
static PROP_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(?P<key>[^\[\]]+)\]:\s*\[(?P<value>[^\[\]]*)\]\s*$").unwrap());

/// Parse a property block into a map. Non-matching lines are ignored,
/// duplicate keys last-wins, malformed input never panics.
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    let mut props = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(caps) = PROP_LINE_RE.captures(line) {
            props.insert(caps["key"].to_string(), caps["value"].to_string());
        }
    }
    props
}

/// Re-emit a property map as sorted `[key]: [value]` lines. Parsing the
/// output yields the same map back.
pub fn serialize_properties(props: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = props.keys().collect();
    keys.sort();
    let mut out = String::new();
    for key in keys {
        out.push_str(&format!("[{}]: [{}]\n", key, props[key]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_lines() {
        let text = "[ro.product.model]: [Pixel 7]\n[ro.build.version.sdk]: [33]";
        let props = parse_properties(text);
        assert_eq!(props.get("ro.product.model").unwrap(), "Pixel 7");
        assert_eq!(props.get("ro.build.version.sdk").unwrap(), "33");
    }

    #[test]
    fn empty_values_are_kept() {
        let props = parse_properties("[persist.sys.locale]: []");
        assert_eq!(props.get("persist.sys.locale").unwrap(), "");
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let text = "[good.before]: [1]\n[missing.bracket]: [oops\nnot a property at all\n[good.after]: [2]";
        let props = parse_properties(text);
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("good.before").unwrap(), "1");
        assert_eq!(props.get("good.after").unwrap(), "2");
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let props = parse_properties("[k]: [first]\n[k]: [second]");
        assert_eq!(props.get("k").unwrap(), "second");
    }

    #[test]
    fn no_match_yields_empty_map() {
        assert!(parse_properties("warning: daemon not running\n").is_empty());
        assert!(parse_properties("").is_empty());
    }

    #[test]
    fn parse_is_idempotent_through_serialization() {
        let text = "[b]: [2]\n[a]: [1]\nnoise\n[c]: []";
        let first = parse_properties(text);
        let second = parse_properties(&serialize_properties(&first));
        assert_eq!(first, second);
    }
}
