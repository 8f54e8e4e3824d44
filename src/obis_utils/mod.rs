use std::fmt;

/// A meter value address reduced to its C.D.E part and packed into one key.
///
/// Layout is `major` (12 bits) << 16 | `minor` (8 bits) << 8 | `micro` (8 bits).
/// The A-B group of a full OBIS code is accepted when parsing but not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Obis(u32);

impl Obis {
    /// Sentinel for a code that could not be parsed.
    pub const INVALID: Obis = Obis(0xffff_ffff);

    pub fn new(major: u32, minor: u32, micro: u32) -> Self {
        return Obis((major & 0xfff) << 16 | (minor & 0xff) << 8 | (micro & 0xff));
    }

    /// Parse `A-B:C.D.E` or `C.D.E`. Anything else yields [`Obis::INVALID`].
    pub fn parse(code: &str) -> Self {
        match parse_parts(code.as_bytes()) {
            Some((major, minor, micro)) => Obis::new(major, minor, micro),
            None => Obis::INVALID,
        }
    }

    pub fn is_valid(&self) -> bool {
        return *self != Obis::INVALID;
    }

    pub fn raw(&self) -> u32 {
        return self.0;
    }

    pub fn major(&self) -> u32 {
        return self.0 >> 16 & 0xfff;
    }

    pub fn minor(&self) -> u32 {
        return self.0 >> 8 & 0xff;
    }

    pub fn micro(&self) -> u32 {
        return self.0 & 0xff;
    }

    /// Human readable name for the codes commonly found in P1 telegrams.
    pub fn description(&self) -> Option<&'static str> {
        if !self.is_valid() {
            return None;
        }
        let d = match (self.major(), self.minor(), self.micro()) {
            // Energy values
            (1, 8, 0) => "Active energy + (total)",
            (1, 8, 1) => "Active energy + (tariff 1)",
            (1, 8, 2) => "Active energy + (tariff 2)",
            (2, 8, 0) => "Active energy - (total)",
            (2, 8, 1) => "Active energy - (tariff 1)",
            (2, 8, 2) => "Active energy - (tariff 2)",
            (3, 8, 0) => "Reactive energy + (total)",
            (4, 8, 0) => "Reactive energy - (total)",

            // Power values
            (1, 7, 0) => "Active power + (total)",
            (2, 7, 0) => "Active power - (total)",
            (3, 7, 0) => "Reactive power + (total)",
            (4, 7, 0) => "Reactive power - (total)",
            (21, 7, 0) => "Active power + (L1)",
            (41, 7, 0) => "Active power + (L2)",
            (61, 7, 0) => "Active power + (L3)",
            (22, 7, 0) => "Active power - (L1)",
            (42, 7, 0) => "Active power - (L2)",
            (62, 7, 0) => "Active power - (L3)",

            // Voltage and current
            (32, 7, 0) => "Voltage (L1)",
            (52, 7, 0) => "Voltage (L2)",
            (72, 7, 0) => "Voltage (L3)",
            (31, 7, 0) => "Current (L1)",
            (51, 7, 0) => "Current (L2)",
            (71, 7, 0) => "Current (L3)",

            // Identification and time
            (1, 0, 0) => "Date and time",
            (0, 2, 0) => "Firmware version",
            (96, 1, 0) => "Equipment identifier",
            (96, 14, 0) => "Tariff indicator",
            (14, 7, 0) => "Supply frequency",
            _ => return None,
        };
        return Some(d);
    }
}

impl fmt::Display for Obis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "invalid");
        }
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.micro())
    }
}

/// Read a run of decimal digits starting at `pos`. Fails on an empty run or overflow.
pub(crate) fn scan_number(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    let start = *pos;
    let mut value: u32 = 0;
    while let Some(c) = bytes.get(*pos).filter(|c| c.is_ascii_digit()) {
        value = value.checked_mul(10)?.checked_add((c - b'0') as u32)?;
        *pos += 1;
    }
    if *pos == start {
        return None;
    }
    Some(value)
}

pub(crate) fn expect_byte(bytes: &[u8], pos: &mut usize, expected: u8) -> Option<()> {
    if bytes.get(*pos) != Some(&expected) {
        return None;
    }
    *pos += 1;
    Some(())
}

fn parse_parts(code: &[u8]) -> Option<(u32, u32, u32)> {
    let mut pos = 0;
    let first = scan_number(code, &mut pos)?;

    let major = match code.get(pos) {
        Some(b'-') => {
            pos += 1;
            let _b_part = scan_number(code, &mut pos)?;
            expect_byte(code, &mut pos, b':')?;
            let major = scan_number(code, &mut pos)?;
            expect_byte(code, &mut pos, b'.')?;
            major
        }
        Some(b'.') => {
            pos += 1;
            first
        }
        _ => return None,
    };
    let minor = scan_number(code, &mut pos)?;
    expect_byte(code, &mut pos, b'.')?;
    let micro = scan_number(code, &mut pos)?;

    if pos != code.len() || major > 0xfff || minor > 0xff || micro > 0xff {
        return None;
    }
    Some((major, minor, micro))
}
