//! # Content Digest
//!
//! CANONICAL digest used to bind report content to its attested
//! `report_hash`. This is the only reference implementation; the report
//! producer and the integrity verifier must agree on it byte for byte.
//!
//! ## Canonical JSON
//!
//! The report producer hashes `json.dumps(report, sort_keys=True)` from the
//! Python standard library, so the canonical form reproduces that output
//! byte for byte:
//!
//! - Object keys sorted by Unicode code point, recursively.
//! - Separators `", "` between items and `": "` between key and value.
//!   Empty objects and arrays are `{}` and `[]`.
//! - Strings are pure ASCII: `"` `\\` `\n` `\r` `\t` `\b` `\f` use their short
//!   escapes, every other character outside `0x20..=0x7e` becomes `\uXXXX` in
//!   lowercase hex, and code points above U+FFFF become a surrogate pair.
//! - Integers in plain decimal. Floats in shortest round-trip form with
//!   Python's layout: `0.82`, `100.0`, `1e-05`, `1e+16`.
//! - Array order preserved.
//!
//! Key ordering does not rely on the `serde_json::Map` backing type, so
//! enabling `preserve_order` anywhere in the dependency graph cannot change
//! the digest.
//!
//! ## Algorithm
//!
//! `content_digest = SHA-256(canonical_json(content))`, rendered as 64
//! lowercase hex characters.

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

/// Compute SHA-256 and return lowercase hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA-256 and return the raw 32 bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let sum = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&sum);
    out
}

/// Serializes `value` into its canonical byte form.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_canonical(value, &mut out);
    out
}

/// Digest of the canonical serialization of `value`, lowercase hex.
pub fn content_digest_hex(value: &Value) -> String {
    sha256_hex(&canonical_json(value))
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.extend_from_slice(b", ");
                }
                write_string(key, out);
                out.extend_from_slice(b": ");
                write_canonical(val, out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.extend_from_slice(b", ");
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    out.push(b'"');
    for ch in s.chars() {
        match ch {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            '\u{08}' => out.extend_from_slice(b"\\b"),
            '\u{0c}' => out.extend_from_slice(b"\\f"),
            ' '..='~' => out.push(ch as u8),
            _ => {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    out.extend_from_slice(b"\\u");
                    for shift in [12, 8, 4, 0] {
                        out.push(HEX[usize::from((*unit >> shift) & 0xf)]);
                    }
                }
            }
        }
    }
    out.push(b'"');
}

fn write_number(n: &Number, out: &mut Vec<u8>) {
    if let Some(i) = n.as_i64() {
        out.extend_from_slice(i.to_string().as_bytes());
    } else if let Some(u) = n.as_u64() {
        out.extend_from_slice(u.to_string().as_bytes());
    } else if let Some(f) = n.as_f64() {
        out.extend_from_slice(float_repr(f).as_bytes());
    } else {
        out.extend_from_slice(n.to_string().as_bytes());
    }
}

/// Formats a finite float the way Python's `repr(float)` does.
///
/// The digits come from Rust's shortest round-trip `{:e}` output; only the
/// layout differs. Positional notation is used while the decimal exponent
/// lies in `-4..16`, scientific notation with a signed, two-digit minimum
/// exponent otherwise.
fn float_repr(f: f64) -> String {
    let sci = format!("{:e}", f);
    let (mantissa, exp) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return sci,
    };
    let exp: i32 = match exp.parse() {
        Ok(e) => e,
        Err(_) => return sci,
    };
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let ndigits = digits.len() as i32;
    // Position of the decimal point relative to the start of `digits`.
    let point = exp + 1;

    let body = if point <= -4 || point > 16 {
        let (head, tail) = digits.split_at(1);
        let frac = if tail.is_empty() {
            String::new()
        } else {
            format!(".{}", tail)
        };
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{}{}e{}{:02}", head, frac, exp_sign, exp.abs())
    } else if point <= 0 {
        format!("0.{}{}", "0".repeat((-point) as usize), digits)
    } else if point >= ndigits {
        format!("{}{}.0", digits, "0".repeat((point - ndigits) as usize))
    } else {
        let (int, frac) = digits.split_at(point as usize);
        format!("{}.{}", int, frac)
    };
    format!("{}{}", sign, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_deterministic() {
        let a = b"some payload bytes";
        let h1 = sha256_hex(a);
        let h2 = sha256_hex(a);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_eq!(hex::encode(sha256(a)), h1);
    }

    #[test]
    fn known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": true, "m": [3, {"y": null, "x": "s"}]}});
        let bytes = canonical_json(&v);
        assert_eq!(
            String::from_utf8_lossy(&bytes),
            r#"{"a": {"m": [3, {"x": "s", "y": null}], "z": true}, "b": 1}"#
        );
    }

    #[test]
    fn canonical_ignores_source_key_order() {
        let a: Value = serde_json::from_str(r#"{"risk": 0.5, "findings": ["reentrancy"], "id": 7}"#)
            .unwrap_or_else(|e| panic!("{}", e));
        let b: Value = serde_json::from_str(r#"{ "id":7,"findings":[ "reentrancy" ],"risk":0.5 }"#)
            .unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(content_digest_hex(&a), content_digest_hex(&b));
    }

    #[test]
    fn canonical_preserves_array_order() {
        let a = json!({"v": [1, 2]});
        let b = json!({"v": [2, 1]});
        assert_ne!(content_digest_hex(&a), content_digest_hex(&b));
    }

    #[test]
    fn canonical_escapes_non_ascii() {
        let v = json!({"q": "say \"hi\"\n", "u": "ünï", "lock": "🔒", "del": "\u{7f}", "tab": "a\tb"});
        assert_eq!(
            String::from_utf8_lossy(&canonical_json(&v)),
            r#"{"del": "\u007f", "lock": "\ud83d\udd12", "q": "say \"hi\"\n", "tab": "a\tb", "u": "\u00fcn\u00ef"}"#
        );
    }

    #[test]
    fn floats_use_python_layout() {
        let cases = [
            (0.82, "0.82"),
            (100.0, "100.0"),
            (0.0, "0.0"),
            (-0.0, "-0.0"),
            (0.0001, "0.0001"),
            (1e-5, "1e-05"),
            (-2.5e-7, "-2.5e-07"),
            (1e15, "1000000000000000.0"),
            (1e16, "1e+16"),
            (1.5e300, "1.5e+300"),
            (123456789.123, "123456789.123"),
            (0.1 + 0.2, "0.30000000000000004"),
        ];
        for (f, expected) in cases {
            assert_eq!(float_repr(f), expected, "repr of {}", f);
        }
    }

    #[test]
    fn integers_stay_integers() {
        let v = json!({"a": -3, "b": 18446744073709551615u64, "c": 7.0});
        assert_eq!(
            String::from_utf8_lossy(&canonical_json(&v)),
            r#"{"a": -3, "b": 18446744073709551615, "c": 7.0}"#
        );
    }

    // Digests below were produced with
    // hashlib.sha256(json.dumps(doc, sort_keys=True).encode()).hexdigest().

    #[test]
    fn matches_producer_digest_for_flat_report() {
        let doc = json!({
            "risk_score": 0.82,
            "contract_name": "Vault",
            "vulnerabilities": [{"type": "reentrancy", "severity": "high"}]
        });
        assert_eq!(
            String::from_utf8_lossy(&canonical_json(&doc)),
            r#"{"contract_name": "Vault", "risk_score": 0.82, "vulnerabilities": [{"severity": "high", "type": "reentrancy"}]}"#
        );
        assert_eq!(
            content_digest_hex(&doc),
            "fab7b16a3d37a8428ceb1499a65bbd395a07cb2fab08314a4f14a4d3025f13ae"
        );
    }

    #[test]
    fn matches_producer_digest_for_nested_unicode_report() {
        let raw = r#"{
            "contract_name": "Trésor 🔒",
            "risk_score": 0.4567,
            "analysis_timestamp": "2024-05-01T12:00:00.123456",
            "vulnerabilities": [
                {"line": 88, "type": "reentrancy", "confidence": 1e-05},
                {"line": -3, "type": "overflow\ttab", "confidence": 100.0}
            ],
            "meta": {"big": 1e16, "zero": 0.0, "ok": true, "none": null, "empty": {}, "list": []},
            "note": "say \"hi\"\n\u007f"
        }"#;
        let doc: Value = serde_json::from_str(raw).unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(
            content_digest_hex(&doc),
            "d2b2072208e2542b24ad2ff352b28bb04f0bd71f01d45e3cb775a27662df1979"
        );
    }

    #[test]
    fn tampered_content_changes_digest() {
        let original = json!({"contract": "Vault", "risk_score": 0.82});
        let tampered = json!({"contract": "Vault", "risk_score": 0.12});
        assert_ne!(content_digest_hex(&original), content_digest_hex(&tampered));
    }
}
