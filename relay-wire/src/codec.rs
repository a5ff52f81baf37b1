use crate::error::DecodeError;
use crate::value::Value;

/// Serializes a [`Value`] to its wire representation.
///
/// The format is length-prefixed for strings and containers and
/// self-describing via a one-byte type tag, matching the wire calibration in
/// the core specification: `n` null, `b` bool, `i` int, `f` float, `s` byte
/// string, `u` text string, `l` list, `d` map (dict). Binary byte strings and
/// text strings use distinct tags (`s` vs `u`) so the distinction survives a
/// round trip. Map keys are encoded in sorted order (via `BTreeMap`'s
/// iteration order) for reproducibility across encodes of the same logical
/// value.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(b'n'),
        Value::Bool(b) => {
            out.push(b'b');
            out.push(if *b { b'1' } else { b'0' });
        }
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b';');
        }
        Value::Float(f) => {
            out.push(b'f');
            out.extend_from_slice(format_float(*f).as_bytes());
            out.push(b';');
        }
        Value::Bytes(b) => {
            out.push(b's');
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::Text(s) => {
            let bytes = s.as_bytes();
            out.push(b'u');
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b';');
        }
        Value::Map(map) => {
            out.push(b'd');
            for (key, val) in map {
                encode_into(&Value::Text(key.clone()), out);
                encode_into(val, out);
            }
            out.push(b';');
        }
    }
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Deserializes a complete [`Value`] from `bytes`, failing with
/// [`DecodeError`] on any truncation or unknown type tag.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let (value, pos) = decode_at(bytes, 0)?;
    if pos != bytes.len() {
        return Err(DecodeError::TrailingBytes {
            offset: pos,
            trailing: bytes.len() - pos,
        });
    }
    Ok(value)
}

fn decode_at(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let tag = *bytes
        .get(pos)
        .ok_or(DecodeError::Truncated { offset: pos })?;
    match tag {
        b'n' => Ok((Value::Null, pos + 1)),
        b'b' => decode_bool(bytes, pos),
        b'i' => decode_int(bytes, pos),
        b'f' => decode_float(bytes, pos),
        b's' => decode_bytes_tag(bytes, pos),
        b'u' => decode_text(bytes, pos),
        b'l' => decode_list(bytes, pos),
        b'd' => decode_map(bytes, pos),
        other => Err(DecodeError::UnknownTag {
            offset: pos,
            tag: other,
        }),
    }
}

fn decode_bool(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let digit = *bytes
        .get(pos + 1)
        .ok_or(DecodeError::Truncated { offset: pos })?;
    match digit {
        b'0' => Ok((Value::Bool(false), pos + 2)),
        b'1' => Ok((Value::Bool(true), pos + 2)),
        _ => Err(DecodeError::BadNumber { offset: pos }),
    }
}

fn find(bytes: &[u8], from: usize, needle: u8) -> Result<usize, DecodeError> {
    bytes[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| i + from)
        .ok_or(DecodeError::Truncated { offset: from })
}

fn decode_int(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let end = find(bytes, pos + 1, b';')?;
    let text = std::str::from_utf8(&bytes[pos + 1..end])
        .map_err(|_| DecodeError::BadNumber { offset: pos })?;
    let n: i64 = text.parse().map_err(|_| DecodeError::BadNumber { offset: pos })?;
    Ok((Value::Int(n), end + 1))
}

fn decode_float(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let end = find(bytes, pos + 1, b';')?;
    let text = std::str::from_utf8(&bytes[pos + 1..end])
        .map_err(|_| DecodeError::BadNumber { offset: pos })?;
    let f: f64 = text.parse().map_err(|_| DecodeError::BadNumber { offset: pos })?;
    Ok((Value::Float(f), end + 1))
}

fn decode_length_prefixed<'a>(
    bytes: &'a [u8],
    pos: usize,
) -> Result<(&'a [u8], usize), DecodeError> {
    let colon = find(bytes, pos + 1, b':')?;
    let len_text = std::str::from_utf8(&bytes[pos + 1..colon])
        .map_err(|_| DecodeError::BadLength { offset: pos })?;
    let len: usize = len_text
        .parse()
        .map_err(|_| DecodeError::BadLength { offset: pos })?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or(DecodeError::BadLength { offset: pos })?;
    if end > bytes.len() {
        return Err(DecodeError::Truncated { offset: pos });
    }
    Ok((&bytes[start..end], end))
}

fn decode_bytes_tag(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let (payload, end) = decode_length_prefixed(bytes, pos)?;
    Ok((Value::Bytes(payload.to_vec()), end))
}

fn decode_text(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let (payload, end) = decode_length_prefixed(bytes, pos)?;
    let text = std::str::from_utf8(payload)
        .map_err(|_| DecodeError::InvalidUtf8 { offset: pos })?
        .to_owned();
    Ok((Value::Text(text), end))
}

fn decode_list(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let mut items = Vec::new();
    let mut cursor = pos + 1;
    loop {
        match bytes.get(cursor) {
            None => return Err(DecodeError::Truncated { offset: cursor }),
            Some(b';') => return Ok((Value::List(items), cursor + 1)),
            Some(_) => {
                let (value, next) = decode_at(bytes, cursor)?;
                items.push(value);
                cursor = next;
            }
        }
    }
}

fn decode_map(bytes: &[u8], pos: usize) -> Result<(Value, usize), DecodeError> {
    let mut map = std::collections::BTreeMap::new();
    let mut cursor = pos + 1;
    loop {
        match bytes.get(cursor) {
            None => return Err(DecodeError::Truncated { offset: cursor }),
            Some(b';') => return Ok((Value::Map(map), cursor + 1)),
            Some(_) => {
                let (key, next) = decode_at(bytes, cursor)?;
                let key = key
                    .into_text_lossy()
                    .ok_or(DecodeError::BadNumber { offset: cursor })?;
                let (val, next) = decode_at(bytes, next)?;
                map.insert(key, val);
                cursor = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_scalars() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(-123456),
            Value::Float(3.5),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Text("hello".to_string()),
        ] {
            let encoded = encode(&value);
            assert_eq!(decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn encodes_map_keys_sorted() {
        let value = map! {
            "zeta" => "z",
            "alpha" => "a",
            "mid" => "m",
        };
        let encoded = encode(&value);
        let a_pos = encoded.windows(5).position(|w| w == b"u1:al").unwrap();
        let z_pos = encoded.windows(5).position(|w| w == b"u1:ze").unwrap();
        assert!(a_pos < z_pos, "alpha must be encoded before zeta");
    }

    #[test]
    fn round_trips_nested_structures() {
        let value = map! {
            "type" => "empty",
            "count" => 3_i64,
            "nested" => Value::List(vec![Value::Int(1), Value::Text("x".into()), Value::Null]),
        };
        let encoded = encode(&value);
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn distinguishes_bytes_from_text() {
        let bytes_val = Value::Bytes(b"hi".to_vec());
        let text_val = Value::Text("hi".to_string());
        assert_ne!(encode(&bytes_val), encode(&text_val));
        assert_eq!(decode(&encode(&bytes_val)).unwrap(), bytes_val);
        assert_eq!(decode(&encode(&text_val)).unwrap(), text_val);
    }

    #[test]
    fn fails_on_truncated_input() {
        let err = decode(b"s5:hi").unwrap_err();
        assert_eq!(err, DecodeError::Truncated { offset: 0 });
    }

    #[test]
    fn fails_on_unknown_tag() {
        let err = decode(b"z1:x").unwrap_err();
        assert_eq!(err, DecodeError::UnknownTag { offset: 0, tag: b'z' });
    }

    #[test]
    fn fails_on_empty_payload() {
        assert_eq!(decode(b"").unwrap_err(), DecodeError::Empty);
    }

    #[test]
    fn fails_on_trailing_bytes() {
        let mut encoded = encode(&Value::Int(1));
        encoded.extend_from_slice(b"garbage");
        assert!(matches!(
            decode(&encoded).unwrap_err(),
            DecodeError::TrailingBytes { .. }
        ));
    }
}
