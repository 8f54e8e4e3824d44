use crate::obis_utils::{expect_byte, scan_number, Obis};
use log::debug;

/// A value record decoded from one line of an ASCII telegram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRecord {
    pub obis: Obis,
    pub value: f64,
}

/// Try the supported record shapes in order:
/// `A-B:C.D.E(...)(...)`, `1-0:C.D.E(value)` and `C.D.E(value)`.
pub fn parse_record(line: &[u8]) -> Option<ValueRecord> {
    return parse_full_form(line)
        .or_else(|| parse_legacy_full_form(line))
        .or_else(|| parse_abbreviated_form(line));
}

/// `A-B:C.D.E` followed by any number of groups. The first group that is
/// not a timestamp and starts with a number provides the value.
fn parse_full_form(line: &[u8]) -> Option<ValueRecord> {
    let mut pos = 0;
    scan_number(line, &mut pos)?;
    expect_byte(line, &mut pos, b'-')?;
    scan_number(line, &mut pos)?;
    expect_byte(line, &mut pos, b':')?;
    let obis = scan_cde(line, &mut pos)?;

    let mut rest = &line[pos..];
    loop {
        let open = rest.iter().position(|c| *c == b'(')?;
        let close = open + 1 + rest[open + 1..].iter().position(|c| *c == b')')?;
        let content = &rest[open + 1..close];

        if is_timestamp(content) {
            debug!("Skipping timestamp content: '{}'", String::from_utf8_lossy(content));
        } else if let Some(value) = parse_leading_f64(skip_leading_zeros(content)) {
            return Some(ValueRecord { obis, value });
        }
        rest = &rest[close + 1..];
    }
}

fn parse_legacy_full_form(line: &[u8]) -> Option<ValueRecord> {
    let rest = line.strip_prefix(b"1-0:")?;
    return parse_cde_with_value(rest);
}

fn parse_abbreviated_form(line: &[u8]) -> Option<ValueRecord> {
    return parse_cde_with_value(line);
}

fn parse_cde_with_value(text: &[u8]) -> Option<ValueRecord> {
    let mut pos = 0;
    let obis = scan_cde(text, &mut pos)?;
    expect_byte(text, &mut pos, b'(')?;
    let value = parse_leading_f64(&text[pos..])?;
    Some(ValueRecord { obis, value })
}

fn scan_cde(text: &[u8], pos: &mut usize) -> Option<Obis> {
    let major = scan_number(text, pos)?;
    expect_byte(text, pos, b'.')?;
    let minor = scan_number(text, pos)?;
    expect_byte(text, pos, b'.')?;
    let micro = scan_number(text, pos)?;
    Some(Obis::new(major, minor, micro))
}

/// Group contents longer than 10 characters that end in `W`/`S` (DST flag)
/// or consist only of digits are taken as timestamps.
pub fn is_timestamp(content: &[u8]) -> bool {
    if content.len() <= 10 {
        return false;
    }
    return matches!(content.last(), Some(b'W') | Some(b'S')) || content.iter().all(|c| c.is_ascii_digit());
}

fn skip_leading_zeros(content: &[u8]) -> &[u8] {
    let mut start = 0;
    while content[start..].len() > 1 && content[start] == b'0' && content[start + 1] != b'.' {
        start += 1;
    }
    return &content[start..];
}

/// Parse the longest numeric prefix (`[+-]digits[.digits][e[+-]digits]`).
pub fn parse_leading_f64(text: &[u8]) -> Option<f64> {
    let digits = |from: usize| text[from..].iter().take_while(|c| c.is_ascii_digit()).count();

    let mut end = 0;
    if matches!(text.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let mut mantissa = digits(end);
    end += mantissa;
    if text.get(end) == Some(&b'.') {
        let fraction = digits(end + 1);
        mantissa += fraction;
        end += 1 + fraction;
    }
    if mantissa == 0 {
        return None;
    }
    if matches!(text.get(end), Some(b'e') | Some(b'E')) {
        let mut exp = end + 1;
        if matches!(text.get(exp), Some(b'+') | Some(b'-')) {
            exp += 1;
        }
        let exp_digits = digits(exp);
        if exp_digits > 0 {
            end = exp + exp_digits;
        }
    }
    std::str::from_utf8(&text[..end]).ok()?.parse::<f64>().ok()
}
