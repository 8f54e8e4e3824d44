use std::fmt;

/// Wire format of the telegram currently held in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Unknown,
    Ascii,
    Binary,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataFormat::Unknown => "UNKNOWN",
            DataFormat::Ascii => "ASCII",
            DataFormat::Binary => "BINARY",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P1State {
    Identifying,
    Reading,
    VerifyingCrc,
    ProcessingAscii,
    ProcessingBinary,
    Waiting,
    ErrorRecovery,
}

fn minimum_period_default() -> u64 { return 0 }
fn buffer_size_default() -> usize { return 3000 }

/// Settings of one reader instance.
#[derive(Debug, Clone, PartialEq)]
pub struct P1Config {
    /// Minimum time between two telegrams in ms, 0 disables the check.
    pub minimum_period_ms: u64,
    /// Telegram buffer capacity in bytes.
    pub buffer_size: usize,
}

impl Default for P1Config {
    fn default() -> Self {
        return P1Config {
            minimum_period_ms: minimum_period_default(),
            buffer_size: buffer_size_default(),
        };
    }
}

/// Timestamps (ms) of the last entry into each state.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CycleTimes {
    pub identifying: u64,
    pub reading: u64,
    pub verifying: u64,
    pub processing: u64,
    pub waiting: u64,
    pub error_recovery: u64,
}

/// Phase durations of the last successfully processed telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub identifying_ms: u64,
    pub reading_ms: u64,
    pub message_loops: u32,
    pub processing_ms: u64,
    pub processing_loops: u32,
    pub total_ms: u64,
    pub buffered_bytes: usize,
}

impl CycleStats {
    pub(crate) fn from_times(times: &CycleTimes, message_loops: u32, processing_loops: u32, buffered_bytes: usize) -> Self {
        return CycleStats {
            identifying_ms: times.reading.saturating_sub(times.identifying),
            reading_ms: times.processing.saturating_sub(times.reading),
            message_loops,
            processing_ms: times.waiting.saturating_sub(times.processing),
            processing_loops,
            total_ms: times.waiting.saturating_sub(times.identifying),
            buffered_bytes,
        };
    }
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifying = {} ms, Message = {} ms ({} loops), Processing = {} ms ({} loops), (Total = {} ms). {} bytes in buffer",
            self.identifying_ms,
            self.reading_ms,
            self.message_loops,
            self.processing_ms,
            self.processing_loops,
            self.total_ms,
            self.buffered_bytes)
    }
}
