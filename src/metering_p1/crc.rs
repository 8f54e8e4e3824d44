use crc16::{State, ARC, X_25};

/// Checksum of an ASCII telegram: reflected polynomial 0xA001, initial value 0.
/// Covers everything from `/` up to and including `!`.
pub fn ascii_checksum(data: &[u8]) -> u16 {
    return State::<ARC>::calculate(data);
}

/// Checksum of a binary (HDLC) frame: X.25, initial 0xFFFF, final xor 0xFFFF.
/// Covers the bytes between the opening flag and the checksum field.
pub fn binary_checksum(data: &[u8]) -> u16 {
    return State::<X_25>::calculate(data);
}

/// The ASCII checksum is sent as up to 4 hex digits right after `!`.
pub fn ascii_transmitted(field: &[u8]) -> Option<u16> {
    let digits = field.iter().take_while(|c| c.is_ascii_hexdigit()).count();
    if digits == 0 || digits > 4 {
        return None;
    }
    let text = std::str::from_utf8(&field[..digits]).ok()?;
    u16::from_str_radix(text, 16).ok()
}

/// The binary checksum is stored little endian in front of the closing flag.
pub fn binary_transmitted(field: &[u8]) -> Option<u16> {
    match field {
        [low, high, ..] => Some(u16::from_le_bytes([*low, *high])),
        _ => None,
    }
}
