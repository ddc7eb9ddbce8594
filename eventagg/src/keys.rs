//! Deterministic naming for collections, documents and shards.
//!
//! Everything here is a pure function of its inputs. The hot path never needs a
//! registry lookup to find where an event's aggregates live: the collection is
//! derived from the app id and event key, the shard from the segment value.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::config::KeySanitization;
use crate::types::{AppId, CollectionName, ShardPostfix};

/// Prefix of every aggregate collection name.
pub const COLLECTION_PREFIX: &str = "events";

/// Prefix marking a segment value that would collide with a bucket id fragment.
pub const RESERVED_VALUE_PREFIX: &str = "[CLY]";

/// Prefix of event keys reserved for internal producers.
pub const INTERNAL_EVENT_PREFIX: &str = "[CLY]_";

/// Literal segment name of the unsegmented bucket.
pub const NO_SEGMENT: &str = "no-segment";

const MAX_EVENT_KEY_CHARS: usize = 127;

/// Collection holding the aggregates of `short_key` for `app_id`.
///
/// `"events"` followed by the hex SHA-1 of `short_key + app_id`.
pub fn collection_name(app_id: &AppId, short_key: &str) -> CollectionName {
    let mut hasher = Sha1::new();
    hasher.update(short_key.as_bytes());
    hasher.update(app_id.as_ref().as_bytes());
    let digest = hex::encode(hasher.finalize());
    CollectionName::from_digest(format!("{COLLECTION_PREFIX}{digest}"))
}

/// Shard symbol for an already sanitized segment value.
///
/// First symbol of the standard base64 encoding of the value's MD5 digest.
pub fn shard_postfix(sanitized_value: &str) -> ShardPostfix {
    let digest = md5::compute(sanitized_value.as_bytes());
    let encoded = STANDARD.encode(digest.0);
    // A 16-byte digest always encodes to 24 symbols.
    let symbol = encoded.chars().next().unwrap_or('A');
    ShardPostfix::from_symbol(symbol)
}

/// Id of the meta document for one coarse bucket and shard.
pub fn meta_document_id(zero: &str, postfix: ShardPostfix) -> String {
    format!("{NO_SEGMENT}_{zero}_{postfix}")
}

/// Make a segment value usable as a document field name.
///
/// Strips every leading `$`, turns every `.` into `:` and tags values that look
/// like day numbers (`"1"` to `"31"`).
pub fn sanitize_segment_value(raw: &str) -> String {
    let stripped = raw.trim_start_matches('$');
    let value = stripped.replace('.', ":");

    if is_day_number(&value) {
        format!("{RESERVED_VALUE_PREFIX}{value}")
    } else {
        value
    }
}

fn is_day_number(value: &str) -> bool {
    value
        .parse::<u8>()
        .is_ok_and(|day| (1..=31).contains(&day) && day.to_string() == value)
}

/// Make a segmentation key usable as a document field name.
///
/// The same name is used on aggregate, meta and raw paths. The result never
/// starts with `$` and never contains `.`.
pub fn sanitize_segment_key(raw: &str, mode: KeySanitization) -> String {
    match mode {
        KeySanitization::Unified => raw.trim_start_matches('$').replace('.', ":"),
        KeySanitization::Legacy => {
            let rest = raw.strip_prefix('$').map_or_else(|| raw.to_string(), |rest| format!(":{rest}"));
            rest.replace('.', ":")
        }
    }
}

/// Canonical short form of an event key, or `None` if nothing is left.
///
/// Removes `system.`, `..` and `$` in a single left-to-right pass, trims, and
/// caps the result at 127 characters.
pub fn fix_event_key(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(c) = rest.chars().next() {
        if let Some(tail) = rest.strip_prefix("system.") {
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("..") {
            rest = tail;
        } else {
            if c != '$' {
                out.push(c);
            }
            rest = &rest[c.len_utf8()..];
        }
    }

    let short: String = out.trim().chars().take(MAX_EVENT_KEY_CHARS).collect();
    if short.is_empty() {
        None
    } else {
        Some(short)
    }
}

/// Key under which the catalog stores per-event segment lists.
pub fn catalog_key(short_key: &str) -> String {
    short_key.replace('.', ":")
}

/// Textual form of a segmentation value.
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn app(id: &str) -> AppId {
        AppId::try_new(id).expect("valid app id")
    }

    #[test]
    fn collection_name_matches_known_digest() {
        let name = collection_name(&app("app1"), "purchase");
        assert_eq!(
            name.as_str(),
            "eventsa1602216ffba2359dd35b3a86aa41a5c2c135462"
        );
    }

    #[test]
    fn shard_postfix_matches_known_digests() {
        assert_eq!(shard_postfix("a").symbol(), 'D');
        assert_eq!(shard_postfix("b").symbol(), 'k');
        assert_eq!(shard_postfix("red").symbol(), 'v');
    }

    #[test]
    fn value_sanitization_rewrites_dots_and_dollar() {
        assert_eq!(sanitize_segment_value("$price.usd"), "price:usd");
        assert_eq!(sanitize_segment_value("1.5"), "1:5");
    }

    #[test]
    fn repeated_dollars_are_all_stripped() {
        assert_eq!(sanitize_segment_value("$$x"), "x");
        assert_eq!(sanitize_segment_value("$$$"), "");
        assert_eq!(sanitize_segment_key("$$k", KeySanitization::Unified), "k");
        assert_eq!(sanitize_segment_key("a$b", KeySanitization::Unified), "a$b");
    }

    #[test]
    fn day_numbers_are_tagged() {
        assert_eq!(sanitize_segment_value("5"), "[CLY]5");
        assert_eq!(sanitize_segment_value("31"), "[CLY]31");
        assert_eq!(sanitize_segment_value("32"), "32");
        assert_eq!(sanitize_segment_value("05"), "05");
        assert_eq!(sanitize_segment_value("0"), "0");
    }

    #[test]
    fn unified_keys_strip_dollars_and_rewrite_dots() {
        assert_eq!(sanitize_segment_key("a.b", KeySanitization::Unified), "a:b");
        assert_eq!(sanitize_segment_key("$a.b", KeySanitization::Unified), "a:b");
    }

    #[test]
    fn legacy_keys_replace_leading_dollar_and_dots_with_colons() {
        assert_eq!(sanitize_segment_key("$a.b", KeySanitization::Legacy), ":a:b");
        assert_eq!(sanitize_segment_key("a.b", KeySanitization::Legacy), "a:b");
        assert_eq!(sanitize_segment_key("$$k", KeySanitization::Legacy), ":$k");
    }

    #[test]
    fn event_keys_are_canonicalized() {
        assert_eq!(fix_event_key("system.login").as_deref(), Some("login"));
        assert_eq!(fix_event_key("buy..now$").as_deref(), Some("buynow"));
        assert_eq!(fix_event_key("  view  ").as_deref(), Some("view"));
        assert_eq!(fix_event_key("$$"), None);
        assert_eq!(fix_event_key(&"k".repeat(300)).map(|k| k.len()), Some(127));
    }

    #[test]
    fn values_render_as_text() {
        assert_eq!(value_as_text(&json!("x")), "x");
        assert_eq!(value_as_text(&json!(3)), "3");
        assert_eq!(value_as_text(&json!(true)), "true");
        assert_eq!(value_as_text(&json!(null)), "null");
        assert_eq!(value_as_text(&json!([1, 2])), "[1,2]");
    }

    proptest! {
        #[test]
        fn collection_name_is_pure(app_id in "[a-f0-9]{24}", key in "[a-zA-Z_ ]{1,40}") {
            let id = app(&app_id);
            prop_assert_eq!(collection_name(&id, &key), collection_name(&id, &key));
        }

        #[test]
        fn distinct_inputs_give_distinct_collections(
            app_id in "[a-f0-9]{24}",
            first in "[a-z]{1,20}",
            second in "[a-z]{1,20}",
        ) {
            prop_assume!(first != second);
            let id = app(&app_id);
            prop_assert_ne!(collection_name(&id, &first), collection_name(&id, &second));
        }

        #[test]
        fn shard_postfix_is_pure_and_in_alphabet(value in ".{0,64}") {
            let sanitized = sanitize_segment_value(&value);
            let postfix = shard_postfix(&sanitized);
            prop_assert_eq!(postfix, shard_postfix(&sanitized));
            prop_assert!(ShardPostfix::ALPHABET.contains(postfix.symbol()));
            prop_assert!(!sanitized.starts_with('$'));
        }

        #[test]
        fn sanitized_keys_never_contain_dots(key in "[$]{0,3}[a-z.$]{0,20}") {
            for mode in [KeySanitization::Unified, KeySanitization::Legacy] {
                let sanitized = sanitize_segment_key(&key, mode);
                prop_assert!(!sanitized.contains('.'));
                prop_assert!(!sanitized.starts_with('$'));
            }
        }
    }
}
