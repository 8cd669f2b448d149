//! Query string and urlencoded form parsing.

use std::collections::BTreeMap;

/// A decoded query parameter: a scalar, or an array accumulated from a
/// `key[]` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Scalar parameter. Repeated plain keys keep the last value.
    Single(String),
    /// Array parameter, one element per `key[]=…` occurrence.
    Array(Vec<String>),
}

impl Value {
    /// The scalar value, when this parameter is not an array.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Single(s) => Some(s),
            Value::Array(_) => None,
        }
    }
}

/// Decoded query or form parameters keyed by name.
pub type QueryMap = BTreeMap<String, Value>;

/// Parses `key=value&…` with percent-decoding applied to both sides.
///
/// Repeated keys retain the last value; a key ending in `[]` collects every
/// occurrence into an array under the bracket-less name. Used both for URI
/// query strings and `application/x-www-form-urlencoded` bodies.
pub fn parse(input: &str) -> QueryMap {
    let mut map = QueryMap::new();

    for piece in input.split('&') {
        if piece.is_empty() {
            continue;
        }

        let (key, value) = piece.split_once('=').unwrap_or((piece, ""));
        let key = decode(key);
        let value = decode(value);

        match key.strip_suffix("[]") {
            Some(base) => match map.get_mut(base) {
                Some(Value::Array(items)) => items.push(value),
                _ => {
                    map.insert(base.to_string(), Value::Array(vec![value]));
                }
            },
            None => {
                map.insert(key, Value::Single(value));
            }
        }
    }

    map
}

/// Percent-decodes a component, mapping `+` to space. Invalid escapes are
/// kept literally.
pub fn decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (hex(bytes.get(i + 1)), hex(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_basic_pairs() {
        let map = parse("user=qwe&id=223");
        assert_eq!(Some(&Value::Single("qwe".to_string())), map.get("user"));
        assert_eq!(Some(&Value::Single("223".to_string())), map.get("id"));
    }

    #[test]
    fn missing_equals_yields_empty_value() {
        let map = parse("debug&name=");
        assert_eq!(Some(&Value::Single(String::new())), map.get("debug"));
        assert_eq!(Some(&Value::Single(String::new())), map.get("name"));
    }

    #[test]
    fn repeated_plain_keys_keep_last_value() {
        let map = parse("a=1&a=2&a=3");
        assert_eq!(Some(&Value::Single("3".to_string())), map.get("a"));
    }

    #[test]
    fn bracket_keys_accumulate_arrays() {
        let map = parse("tag[]=x&tag[]=y&tag[]=z");
        assert_eq!(
            Some(&Value::Array(vec![
                "x".to_string(),
                "y".to_string(),
                "z".to_string()
            ])),
            map.get("tag")
        );
    }

    #[test]
    fn percent_decoding_applies_to_keys_and_values() {
        let map = parse("full%20name=J%C3%BCrgen+M");
        assert_eq!(
            Some(&Value::Single("Jürgen M".to_string())),
            map.get("full name")
        );
    }

    #[test]
    fn invalid_escapes_are_literal() {
        assert_eq!("100%", decode("100%"));
        assert_eq!("%zz", decode("%zz"));
        assert_eq!("a%2", decode("a%2"));
    }

    #[test]
    fn empty_pieces_are_skipped() {
        let map = parse("&&a=1&&");
        assert_eq!(1, map.len());
    }

    #[test]
    fn value_may_contain_equals() {
        let map = parse("very=long=value=with=equals");
        assert_eq!(
            Some(&Value::Single("long=value=with=equals".to_string())),
            map.get("very")
        );
    }
}
