//! Request fingerprinting for idempotency comparison.
//!
//! A fingerprint is the SHA-256 (hex) of a canonical JSON document:
//!
//! ```text
//! {"tenantId":..,"eventType":..,"priority":..,"toEmail":..,"templateId":..,"variables":..}
//! ```
//!
//! - top-level keys appear in exactly that order
//! - `toEmail` is trimmed and lowercased
//! - every object inside `variables` has its keys sorted (UTF-16 code unit order,
//!   which is what JavaScript's default sort produces), except that array-index keys
//!   (`"0"` up to `"4294967294"`, no leading zeros) come first in ascending numeric
//!   order, as JavaScript objects always enumerate them; arrays keep their order
//! - numbers are written the way ECMAScript `Number.prototype.toString` writes them
//!   (`10.0` is `10`, `1e21` is `1e+21`, `1e-7` is `1e-7`)
//! - the recipient display name is not part of the document
//!
//! The writer below emits compact JSON without relying on `serde_json::Map`
//! iteration order, so the digest does not change if a dependency turns on
//! `preserve_order`.

use std::cmp::Ordering;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::notification::Submission;

/// Hex-encoded SHA-256 of the submission's canonical form.
pub fn fingerprint(submission: &Submission) -> String {
    let canonical = canonical_document(submission);
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

/// The exact bytes that get hashed.
pub fn canonical_document(submission: &Submission) -> String {
    let mut out = String::with_capacity(256);
    out.push('{');
    write_field(&mut out, "tenantId", &Value::from(submission.tenant_id.as_str()), true);
    write_field(&mut out, "eventType", &Value::from(submission.event_type.as_str()), false);
    write_field(&mut out, "priority", &Value::from(submission.priority.as_str()), false);
    write_field(&mut out, "toEmail", &Value::from(submission.normalized_email()), false);
    write_field(&mut out, "templateId", &Value::from(submission.template_id.as_str()), false);
    write_field(&mut out, "variables", &submission.variables, false);
    out.push('}');
    out
}

fn write_field(out: &mut String, key: &str, value: &Value, first: bool) {
    if !first {
        out.push(',');
    }
    write_string(out, key);
    out.push(':');
    write_sorted(out, value);
}

fn write_sorted(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| match (array_index(a), array_index(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => a.encode_utf16().cmp(b.encode_utf16()),
            });

            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_sorted(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_sorted(out, item);
            }
            out.push(']');
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) => write_number(out, f),
            None => out.push_str(&n.to_string()),
        },
        // Scalars serialize infallibly.
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Numeric value of a canonical array-index key.
fn array_index(key: &str) -> Option<u32> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if key.len() > 1 && key.starts_with('0') {
        return None;
    }
    key.parse::<u32>().ok().filter(|&i| i != u32::MAX)
}

/// ECMAScript Number-to-String for finite values.
fn write_number(out: &mut String, value: f64) {
    if value == 0.0 {
        out.push('0');
        return;
    }
    if value.is_sign_negative() {
        out.push('-');
    }

    // `{:e}` yields the shortest round-trip digits, e.g. `1.2345e3`.
    let sci = format!("{:e}", value.abs());
    let (mantissa, exp) = match sci.split_once('e') {
        Some(parts) => parts,
        None => (sci.as_str(), "0"),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    let n = exp.parse::<i32>().unwrap_or(0) + 1;

    if k <= n && n <= 21 {
        out.push_str(&digits);
        out.extend(std::iter::repeat_n('0', (n - k) as usize));
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        out.push_str(int);
        out.push('.');
        out.push_str(frac);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat_n('0', (-n) as usize));
        out.push_str(&digits);
    } else {
        let (first, rest) = digits.split_at(1);
        out.push_str(first);
        if !rest.is_empty() {
            out.push('.');
            out.push_str(rest);
        }
        out.push('e');
        out.push(if n > 0 { '+' } else { '-' });
        out.push_str(&(n - 1).abs().to_string());
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push_str(&Value::from(s).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{Priority, Recipient};
    use proptest::prelude::*;
    use serde_json::json;

    fn submission(variables: Value) -> Submission {
        Submission {
            tenant_id: "acme".to_string(),
            event_type: "otp.requested".to_string(),
            priority: Priority::P0,
            to: Recipient {
                email: "bob@example.com".to_string(),
                name: None,
            },
            template_id: "tpl-1".to_string(),
            variables,
            idempotency_key: "k1".to_string(),
            ttl_seconds: None,
        }
    }

    #[test]
    fn canonical_document_has_fixed_shape() {
        let s = submission(json!({"b": 1, "a": {"z": [3, {"y": true, "x": null}], "c": "d"}}));
        assert_eq!(
            canonical_document(&s),
            r#"{"tenantId":"acme","eventType":"otp.requested","priority":"P0","toEmail":"bob@example.com","templateId":"tpl-1","variables":{"a":{"c":"d","z":[3,{"x":null,"y":true}]},"b":1}}"#
        );
    }

    #[test]
    fn digest_is_hex_sha256() {
        let fp = fingerprint(&submission(json!({})));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn display_name_and_email_case_do_not_matter() {
        let a = submission(json!({"code": "1"}));
        let mut b = a.clone();
        b.to = Recipient {
            email: "  BOB@Example.com ".to_string(),
            name: Some("Robert".to_string()),
        };
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn idempotency_key_and_ttl_do_not_matter() {
        let a = submission(json!({"code": "1"}));
        let mut b = a.clone();
        b.idempotency_key = "other".to_string();
        b.ttl_seconds = Some(30);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn material_fields_change_the_digest() {
        let base = submission(json!({"code": "1"}));

        let mut other = base.clone();
        other.priority = Priority::P1;
        assert_ne!(fingerprint(&base), fingerprint(&other));

        let mut other = base.clone();
        other.variables = json!({"code": "2"});
        assert_ne!(fingerprint(&base), fingerprint(&other));

        let mut other = base.clone();
        other.template_id = "tpl-2".to_string();
        assert_ne!(fingerprint(&base), fingerprint(&other));
    }

    #[test]
    fn array_order_is_significant() {
        let a = submission(json!({"items": [1, 2]}));
        let b = submission(json!({"items": [2, 1]}));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    fn parsed(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn integral_floats_hash_like_integers() {
        let floats = submission(parsed(r#"{"amount": 10.0, "n": 1e3}"#));
        let ints = submission(parsed(r#"{"amount": 10, "n": 1000}"#));
        assert_eq!(
            canonical_document(&floats),
            r#"{"tenantId":"acme","eventType":"otp.requested","priority":"P0","toEmail":"bob@example.com","templateId":"tpl-1","variables":{"amount":10,"n":1000}}"#
        );
        assert_eq!(
            fingerprint(&floats),
            "8a6b14cb410ccad2387c399d82e9a4ee9abcf15b906833947d010e91b6a1606f"
        );
        assert_eq!(fingerprint(&floats), fingerprint(&ints));
    }

    #[test]
    fn numbers_use_ecmascript_notation() {
        let s = submission(parsed(
            r#"{"big":1e21,"tiny":1e-7,"small":0.000001,"neg":-0.5,"frac":1234.5678,"z":-0.0,"i":4294967295}"#,
        ));
        assert_eq!(
            canonical_document(&s),
            r#"{"tenantId":"acme","eventType":"otp.requested","priority":"P0","toEmail":"bob@example.com","templateId":"tpl-1","variables":{"big":1e+21,"frac":1234.5678,"i":4294967295,"neg":-0.5,"small":0.000001,"tiny":1e-7,"z":0}}"#
        );
        assert_eq!(
            fingerprint(&s),
            "db48d10bb7404f79893c8e417a7e542bcb19c303a904fc9361559c3431dd44e2"
        );
    }

    #[test]
    fn array_index_keys_sort_numerically_first() {
        let s = submission(parsed(r#"{"b":1,"10":2,"2":3}"#));
        assert_eq!(
            fingerprint(&s),
            "ffe95d2058872c5a1d6e2f8190844758828272932a28eb6c9e43ffd92eac6a5a"
        );

        // Leading zeros and 2^32-1 are ordinary string keys.
        let s = submission(parsed(
            r#"{"4294967295":1,"4294967294":2,"01":3,"1":4,"a":5,"B":6}"#,
        ));
        assert!(canonical_document(&s).ends_with(
            r#""variables":{"1":4,"4294967294":2,"01":3,"4294967295":1,"B":6,"a":5}}"#
        ));
        assert_eq!(
            fingerprint(&s),
            "52252b68298a57e4a6de66d83269fbbe6926c41b4c54ababbc293deca5e0d1ab"
        );
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,8}".prop_map(Value::from),
        ]
    }

    fn json_tree() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::vec(("[a-zA-Z_]{1,6}", inner), 0..4).prop_map(|pairs| {
                    Value::Object(pairs.into_iter().collect())
                }),
            ]
        })
    }

    fn reversed_keys(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.reverse();
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), reversed_keys(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(reversed_keys).collect()),
            other => other.clone(),
        }
    }

    proptest! {
        #[test]
        fn key_order_never_changes_the_digest(
            pairs in prop::collection::vec(("[a-z]{1,6}", json_tree()), 0..6)
        ) {
            let vars = Value::Object(pairs.into_iter().collect());
            let a = submission(vars.clone());
            let b = submission(reversed_keys(&vars));
            prop_assert_eq!(fingerprint(&a), fingerprint(&b));
        }

        #[test]
        fn fingerprint_is_deterministic(name in proptest::option::of("[A-Za-z ]{0,20}")) {
            let mut a = submission(json!({"x": 1}));
            let first = fingerprint(&a);
            a.to.name = name;
            prop_assert_eq!(fingerprint(&a), first);
        }
    }
}
