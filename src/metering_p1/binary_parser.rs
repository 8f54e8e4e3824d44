use super::P1Error;
use crate::obis_utils::Obis;

/// Marks the end of the HDLC address/control header.
pub const CONTROL_BYTE: u8 = 0x13;

const FRAME_TYPE_LEN: usize = 3;
// control byte, HCS (2) and LLC (3)
const CONTROL_SKIP: usize = 6;

const TAG_NULL: u8 = 0x00;
const TAG_ARRAY: u8 = 0x01;
const TAG_STRUCT: u8 = 0x02;
const TAG_UINT32: u8 = 0x06;
const TAG_OCTET_STRING: u8 = 0x09;
const TAG_STRING: u8 = 0x0a;
const TAG_DATETIME: u8 = 0x0c;
const TAG_SCALAR: u8 = 0x0f;
const TAG_UINT16: u8 = 0x10;
const TAG_INT16: u8 = 0x12;
const TAG_ENUM: u8 = 0x16;

/// What a single data element means to the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    Skip,
    /// A 6 byte octet string; the following scalar belongs to this address.
    Address(Obis),
    Value(f64),
}

/// Find the first data element after the frame header.
pub fn find_payload_start(frame: &[u8], crc_boundary: usize) -> Result<usize, P1Error> {
    let end = crc_boundary.min(frame.len());
    let control = frame.get(FRAME_TYPE_LEN..end)
        .and_then(|header| header.iter().position(|b| *b == CONTROL_BYTE))
        .ok_or(P1Error::MissingControlByte)?;
    return Ok(FRAME_TYPE_LEN + control + CONTROL_SKIP);
}

/// Decode the element at `cursor`. Returns the element and its width in bytes.
/// Elements may not extend past `crc_boundary`.
pub fn read_element(frame: &[u8], cursor: usize, crc_boundary: usize) -> Result<(Element, usize), P1Error> {
    let end = crc_boundary.min(frame.len());
    let data = frame.get(cursor..end).filter(|d| !d.is_empty()).ok_or(P1Error::TruncatedBinaryElement { tag: 0, offset: cursor })?;
    let tag = data[0];

    let width = match tag {
        TAG_NULL => 1,
        TAG_ARRAY | TAG_STRUCT | TAG_SCALAR | TAG_ENUM => 2,
        TAG_UINT32 => 5,
        TAG_UINT16 | TAG_INT16 => 3,
        TAG_DATETIME => 13,
        TAG_OCTET_STRING | TAG_STRING => match data.get(1) {
            Some(len) => 2 + *len as usize,
            None => return Err(P1Error::TruncatedBinaryElement { tag, offset: cursor }),
        },
        _ => return Err(P1Error::UnsupportedBinaryTag(tag)),
    };
    if width > data.len() {
        return Err(P1Error::TruncatedBinaryElement { tag, offset: cursor });
    }

    let element = match tag {
        TAG_UINT32 => {
            let raw = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
            Element::Value(raw as f64 / 1000.0)
        }
        TAG_UINT16 => {
            let raw = u16::from_be_bytes([data[1], data[2]]);
            Element::Value(raw as f64 / 10.0)
        }
        TAG_INT16 => {
            let raw = i16::from_be_bytes([data[1], data[2]]);
            Element::Value(raw as f64 / 10.0)
        }
        // A-B are skipped, C.D.E identify the value
        TAG_OCTET_STRING if data[1] == 6 => Element::Address(Obis::new(data[4] as u32, data[5] as u32, data[6] as u32)),
        _ => Element::Skip,
    };
    return Ok((element, width));
}
