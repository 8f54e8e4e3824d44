use super::structs::DataFormat;
use super::P1Error;

/// Smallest buffer that can hold a binary frame header plus its checksum.
pub const MIN_BUFFER_SIZE: usize = 8;

/// Fixed capacity store for exactly one telegram.
pub struct TelegramBuffer {
    data: Vec<u8>,
    position: usize,
    crc_boundary: usize,
    format: DataFormat,
}

impl TelegramBuffer {
    /// Allocates the whole buffer up front; later pushes never allocate.
    pub fn with_capacity(capacity: usize) -> Result<Self, P1Error> {
        if capacity < MIN_BUFFER_SIZE {
            return Err(P1Error::InvalidBufferSize(capacity));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(capacity).map_err(|_| P1Error::BufferAllocation(capacity))?;
        data.resize(capacity, 0);

        return Ok(TelegramBuffer {
            data,
            position: 0,
            crc_boundary: 0,
            format: DataFormat::Unknown,
        });
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.crc_boundary = 0;
        self.format = DataFormat::Unknown;
    }

    pub fn push(&mut self, byte: u8) -> Result<(), P1Error> {
        if self.position >= self.data.len() {
            return Err(P1Error::BufferOverrun(self.data.len()));
        }
        self.data[self.position] = byte;
        self.position += 1;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        return self.position == self.data.len();
    }

    pub fn capacity(&self) -> usize {
        return self.data.len();
    }

    pub fn position(&self) -> usize {
        return self.position;
    }

    /// Bytes written for the current telegram.
    pub fn as_slice(&self) -> &[u8] {
        return &self.data[..self.position];
    }

    /// Offset of the checksum field, 0 while it is not known yet.
    pub fn crc_boundary(&self) -> usize {
        return self.crc_boundary;
    }

    /// Sets the boundary once per telegram. Returns false if it was already set.
    pub fn set_crc_boundary(&mut self, boundary: usize) -> bool {
        if self.crc_boundary != 0 {
            return false;
        }
        self.crc_boundary = boundary;
        return true;
    }

    pub fn format(&self) -> DataFormat {
        return self.format;
    }

    pub fn set_format(&mut self, format: DataFormat) {
        self.format = format;
    }
}
