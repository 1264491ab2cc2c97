use mysql_common::value::Value;

const NULL: &[u8] = b"NULL";

/// Escape bytes the way the MySQL client library does: each byte in the
/// table below becomes a two-byte backslash sequence, everything else
/// passes through unchanged. Not idempotent: re-escaping expands every
/// backslash again.
///
/// | byte | emitted |
/// |------|---------|
/// | 0x00 | `\0`    |
/// | 0x0A | `\n`    |
/// | 0x0D | `\r`    |
/// | 0x5C | `\\`    |
/// | 0x27 | `\'`    |
/// | 0x22 | `\"`    |
/// | 0x1A | `\Z`    |
pub fn escape(input: &[u8]) -> Vec<u8> {
    let mut dest = Vec::with_capacity(2 * input.len());

    for &b in input {
        let esc = match b {
            0x00 => b'0',
            b'\n' => b'n',
            b'\r' => b'r',
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            0x1A => b'Z',
            _ => 0,
        };

        if esc != 0 {
            dest.push(b'\\');
            dest.push(esc);
        } else {
            dest.push(b);
        }
    }

    dest
}

/// Single-quoted, escaped SQL string literal.
pub fn literal(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * input.len() + 2);
    out.push(b'\'');
    out.extend_from_slice(&escape(input));
    out.push(b'\'');
    out
}

/// Convert a row value into its wire-ready tuple fragment: the four bytes
/// `NULL`, or a quoted literal. Text-protocol results only ever carry
/// `Value::NULL` and `Value::Bytes`; the remaining arms cover rows read
/// over the binary protocol.
pub fn value_literal(value: &Value) -> Vec<u8> {
    match value {
        Value::NULL => NULL.to_vec(),
        Value::Bytes(bytes) => literal(bytes),
        Value::Int(v) => literal(v.to_string().as_bytes()),
        Value::UInt(v) => literal(v.to_string().as_bytes()),
        Value::Float(v) => literal(format_float(f64::from(*v)).as_bytes()),
        Value::Double(v) => literal(format_float(*v).as_bytes()),
        Value::Date(y, mo, d, h, mi, s, us) => {
            literal(format_date(*y, *mo, *d, *h, *mi, *s, *us).as_bytes())
        }
        Value::Time(neg, days, h, mi, s, us) => {
            literal(format_time(*neg, *days, *h, *mi, *s, *us).as_bytes())
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f.is_sign_positive() {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else {
        f.to_string()
    }
}

fn format_date(y: u16, mo: u8, d: u8, h: u8, mi: u8, s: u8, us: u32) -> String {
    if h == 0 && mi == 0 && s == 0 && us == 0 {
        format!("{:04}-{:02}-{:02}", y, mo, d)
    } else if us == 0 {
        format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, mo, d, h, mi, s)
    } else {
        format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, mo, d, h, mi, s, us
        )
    }
}

fn format_time(neg: bool, days: u32, h: u8, mi: u8, s: u8, us: u32) -> String {
    let sign = if neg { "-" } else { "" };
    let total_hours = days * 24 + u32::from(h);

    if us == 0 {
        format!("{}{:02}:{:02}:{:02}", sign, total_hours, mi, s)
    } else {
        format!("{}{:02}:{:02}:{:02}.{:06}", sign, total_hours, mi, s, us)
    }
}

/// Quote an identifier (table or column name) with backticks.
pub fn escape_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverse of `escape`, for round-trip checks only.
    fn unescape(input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        let mut iter = input.iter();

        while let Some(&b) = iter.next() {
            if b != b'\\' {
                out.push(b);
                continue;
            }

            match iter.next() {
                Some(b'0') => out.push(0x00),
                Some(b'n') => out.push(b'\n'),
                Some(b'r') => out.push(b'\r'),
                Some(b'Z') => out.push(0x1A),
                Some(&e) => out.push(e),
                None => out.push(b'\\'),
            }
        }

        out
    }

    fn parse_sql_literal(input: &[u8]) -> Vec<u8> {
        assert!(input.len() >= 2);
        assert_eq!(input[0], b'\'');
        assert_eq!(input[input.len() - 1], b'\'');
        unescape(&input[1..input.len() - 1])
    }

    #[test]
    fn test_escape() {
        let input = [0u8, b'\n', b'\r', b'\\', b'\'', b'"', 0x1A, b'a'];
        let expected: &[u8] = br#"\0\n\r\\\'\"\Za"#;
        assert_eq!(escape(&input), expected);
    }

    #[test]
    fn test_escape_passthrough() {
        let input = b"hello, world 123";
        assert_eq!(escape(input), input.to_vec());
    }

    #[test]
    fn test_escape_not_idempotent() {
        let once = escape(b"\\");
        let twice = escape(&once);
        assert_eq!(once, b"\\\\".to_vec());
        assert_eq!(twice, b"\\\\\\\\".to_vec());
        assert_ne!(once, twice);
    }

    #[test]
    fn test_literal_round_trip() {
        let inputs: [&[u8]; 4] = [
            b"",
            b"plain text",
            &[0u8, b'\n', b'\r', b'\\', b'\'', b'"', 0x1A, b'a'],
            &[0xFF, 0x00, 0x1A, 0x80, b'\''],
        ];

        for input in inputs {
            assert_eq!(parse_sql_literal(&literal(input)), input.to_vec());
        }

        let all_bytes: Vec<u8> = (0u8..=255).collect();
        assert_eq!(parse_sql_literal(&literal(&all_bytes)), all_bytes);
    }

    #[test]
    fn test_value_literal_null() {
        assert_eq!(value_literal(&Value::NULL), b"NULL".to_vec());
    }

    #[test]
    fn test_value_literal_bytes() {
        assert_eq!(
            value_literal(&Value::Bytes(b"it's".to_vec())),
            b"'it\\'s'".to_vec()
        );
    }

    #[test]
    fn test_value_literal_numbers() {
        assert_eq!(value_literal(&Value::Int(-42)), b"'-42'".to_vec());
        assert_eq!(value_literal(&Value::UInt(42)), b"'42'".to_vec());
    }

    #[test]
    fn test_value_literal_date() {
        let date = Value::Date(2024, 3, 1, 0, 0, 0, 0);
        assert_eq!(value_literal(&date), b"'2024-03-01'".to_vec());

        let ts = Value::Date(2024, 3, 1, 12, 30, 5, 0);
        assert_eq!(value_literal(&ts), b"'2024-03-01 12:30:05'".to_vec());
    }

    #[test]
    fn test_escape_identifier() {
        assert_eq!(escape_identifier("users"), "`users`");
        assert_eq!(escape_identifier("od`d"), "`od``d`");
    }
}
