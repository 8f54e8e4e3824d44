use log::{debug, error, info, warn};
use thiserror::Error;

use crate::obis_utils::Obis;
use crate::sensors::SensorRegistry;
use crate::transport::{ByteSink, ByteSource, Clock, ReadRequestLine};
use crate::triggers::{P1Event, Triggers};

pub mod ascii_parser;
pub mod binary_parser;
pub mod buffer;
pub mod crc;
pub mod discard_log;
pub mod structs;

use binary_parser::Element;
use buffer::TelegramBuffer;
use discard_log::DiscardLog;
pub use structs::{CycleStats, DataFormat, P1Config, P1State};
use structs::CycleTimes;

/// Longest silence accepted while waiting for a new telegram.
pub const IDLE_TIMEOUT_MS: u64 = 60_000;
/// A telegram must be complete this long after its first byte.
pub const MESSAGE_TIMEOUT_MS: u64 = 10_000;
/// Work done per tick in the reading and processing states.
pub const TICK_BUDGET_MS: u64 = 25;
/// Silence needed before leaving error recovery.
pub const RECOVERY_QUIET_MS: u64 = 500;
/// Bytes drained per tick during error recovery.
pub const MAX_DISCARD_PER_TICK: usize = 200;

const ASCII_START: u8 = b'/';
const ASCII_CRC_MARK: u8 = b'!';
const HDLC_FLAG: u8 = 0x7e;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum P1Error {
    #[error("Not a valid OBIS code: '{0}'")]
    InvalidAddress(String),
    #[error("OBIS code '{0}' already has a sensor")]
    DuplicateAddress(String),
    #[error("Unknown data format (0x{0:02x})")]
    UnknownFramingByte(u8),
    #[error("Unknown frame format (0x{0:02X})")]
    MalformedBinaryHeader(u8),
    #[error("Message buffer overrun ({0} bytes)")]
    BufferOverrun(usize),
    #[error("Complete message not received within {0} seconds")]
    FrameTimeout(u64),
    #[error("CRC mismatch, calculated {computed:04X} != {transmitted:04X}")]
    ChecksumMismatch { computed: u16, transmitted: u16 },
    #[error("CRC field is missing or not hexadecimal")]
    MalformedChecksumField,
    #[error("Unexpected end of frame (0x{0:02x})")]
    UnexpectedFrameEnd(u8),
    #[error("Unsupported data type 0x{0:02x}")]
    UnsupportedBinaryTag(u8),
    #[error("Data element 0x{tag:02x} at offset {offset} runs into the CRC")]
    TruncatedBinaryElement { tag: u8, offset: usize },
    #[error("Could not find control byte")]
    MissingControlByte,
    #[error("Data was received before being requested. If flow control via the RTS signal is not used, the minimum period should be 0")]
    UnsolicitedData,
    #[error("No data received for {0} seconds")]
    IdleTimeout(u64),
    #[error("Failed to allocate {0} bytes for buffer")]
    BufferAllocation(usize),
    #[error("Buffer size {0} is too small")]
    InvalidBufferSize(usize),
}

/// Reads P1 telegrams from a byte source and hands the values to sensors.
///
/// Call [`P1Reader::tick`] repeatedly from the host loop. Every call does a
/// bounded amount of work and returns; a telegram is usually assembled and
/// decoded over several calls.
pub struct P1Reader<S: ByteSource, C: Clock> {
    config: P1Config,
    source: S,
    clock: C,
    sensors: SensorRegistry,
    triggers: Triggers,
    buffer: TelegramBuffer,
    discard_log: DiscardLog,
    state: P1State,
    times: CycleTimes,
    num_message_loops: u32,
    num_processing_loops: u32,
    // 0 until processing of the current telegram has started
    data_cursor: usize,
    current_obis: Obis,
    display_time_stats: bool,
    time_stats_counter: u32,
    time_stats_as_info_next: u32,
    last_cycle_stats: Option<CycleStats>,
    last_error: Option<P1Error>,
    read_request: Option<Box<dyn ReadRequestLine>>,
    secondary_requested: bool,
    passthrough: Option<Box<dyn ByteSink>>,
}

impl<S: ByteSource, C: Clock> P1Reader<S, C> {
    /// Fails if the telegram buffer cannot be allocated; the reader never
    /// runs on a smaller buffer than configured.
    pub fn new(config: P1Config, sensors: SensorRegistry, source: S, clock: C) -> Result<Self, P1Error> {
        let buffer = TelegramBuffer::with_capacity(config.buffer_size).map_err(|e| {
            error!("{}", e);
            e
        })?;
        let now = clock.millis();
        info!("P1 reader with {} byte buffer, minimum period {} ms, {} sensors",
            config.buffer_size, config.minimum_period_ms, sensors.len());

        return Ok(P1Reader {
            config,
            source,
            clock,
            sensors,
            triggers: Triggers::new(),
            buffer,
            discard_log: DiscardLog::new(),
            state: P1State::Identifying,
            times: CycleTimes { identifying: now, error_recovery: now, ..Default::default() },
            num_message_loops: 0,
            num_processing_loops: 0,
            data_cursor: 0,
            current_obis: Obis::INVALID,
            display_time_stats: false,
            time_stats_counter: 0,
            time_stats_as_info_next: 1,
            last_cycle_stats: None,
            last_error: None,
            read_request: None,
            secondary_requested: false,
            passthrough: None,
        });
    }

    pub fn triggers_mut(&mut self) -> &mut Triggers {
        return &mut self.triggers;
    }

    /// Receive every flushed hex dump of discarded bytes.
    pub fn on_discard<F: FnMut(&str) + 'static>(&mut self, sink: F) {
        self.discard_log.set_sink(Box::new(sink));
    }

    pub fn set_read_request_line(&mut self, line: Box<dyn ReadRequestLine>) {
        self.read_request = Some(line);
    }

    pub fn set_passthrough(&mut self, sink: Box<dyn ByteSink>) {
        self.passthrough = Some(sink);
    }

    pub fn state(&self) -> P1State {
        return self.state;
    }

    pub fn buffer(&self) -> &TelegramBuffer {
        return &self.buffer;
    }

    pub fn last_error(&self) -> Option<&P1Error> {
        return self.last_error.as_ref();
    }

    pub fn last_cycle_stats(&self) -> Option<&CycleStats> {
        return self.last_cycle_stats.as_ref();
    }

    /// Whether the secondary device requested data when this telegram started.
    pub fn secondary_requested(&self) -> bool {
        return self.secondary_requested;
    }

    pub fn source(&self) -> &S {
        return &self.source;
    }

    /// Run one slice of work for the current state.
    pub fn tick(&mut self) {
        let loop_start = self.clock.millis();
        let result = match self.state {
            P1State::Identifying => {
                let result = self.identify(loop_start);
                if result.is_ok() && self.state == P1State::Reading {
                    // bytes after the start byte are read in the same tick
                    self.read_message(loop_start)
                } else {
                    result
                }
            }
            P1State::Reading => self.read_message(loop_start),
            P1State::VerifyingCrc => self.verify_crc(),
            P1State::ProcessingAscii => self.process_ascii(loop_start),
            P1State::ProcessingBinary => self.process_binary(loop_start),
            P1State::Waiting => self.wait(loop_start),
            P1State::ErrorRecovery => {
                self.recover(loop_start);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn fail(&mut self, e: P1Error) {
        match e {
            P1Error::ChecksumMismatch { .. } | P1Error::MalformedChecksumField | P1Error::UnsolicitedData => {
                error!("{}. Resetting.", e)
            }
            _ => warn!("{}. Resetting.", e),
        }
        self.last_error = Some(e);
        self.change_state(P1State::ErrorRecovery);
    }

    fn get_byte(&mut self) -> Option<u8> {
        let byte = self.source.read_byte()?;
        if self.secondary_requested {
            if let Some(sink) = self.passthrough.as_mut() {
                sink.write_byte(byte);
            }
        }
        Some(byte)
    }

    fn budget_spent(&self, loop_start: u64) -> bool {
        return self.clock.millis().saturating_sub(loop_start) >= TICK_BUDGET_MS;
    }

    fn identify(&mut self, now: u64) -> Result<(), P1Error> {
        if !self.source.available() {
            if now.saturating_sub(self.times.identifying) > IDLE_TIMEOUT_MS {
                return Err(P1Error::IdleTimeout(IDLE_TIMEOUT_MS / 1000));
            }
            return Ok(());
        }
        let byte = match self.get_byte() {
            Some(b) => b,
            None => return Ok(()),
        };
        let format = match byte {
            ASCII_START => DataFormat::Ascii,
            HDLC_FLAG => DataFormat::Binary,
            other => return Err(P1Error::UnknownFramingByte(other)),
        };
        debug!("{} data format", format);
        self.buffer.set_format(format);
        self.buffer.push(byte)?;
        self.change_state(P1State::Reading);
        Ok(())
    }

    fn read_message(&mut self, loop_start: u64) -> Result<(), P1Error> {
        self.num_message_loops += 1;
        while self.source.available() {
            let byte = match self.get_byte() {
                Some(b) => b,
                None => break,
            };
            self.buffer.push(byte)?;

            match self.buffer.format() {
                DataFormat::Ascii if byte == ASCII_CRC_MARK => {
                    // the checksum field starts right after '!'
                    let position = self.buffer.position();
                    self.buffer.set_crc_boundary(position);
                }
                DataFormat::Binary if self.buffer.position() == 3 => {
                    let boundary = binary_crc_boundary(self.buffer.as_slice())?;
                    self.buffer.set_crc_boundary(boundary);
                }
                _ => {}
            }

            if self.frame_complete(byte)? {
                self.change_state(P1State::VerifyingCrc);
                return Ok(());
            }
            if self.buffer.is_full() {
                return Err(P1Error::BufferOverrun(self.buffer.capacity()));
            }
            if self.budget_spent(loop_start) {
                break;
            }
        }

        if loop_start.saturating_sub(self.times.reading) > MESSAGE_TIMEOUT_MS {
            return Err(P1Error::FrameTimeout(MESSAGE_TIMEOUT_MS / 1000));
        }
        Ok(())
    }

    fn frame_complete(&self, last_byte: u8) -> Result<bool, P1Error> {
        let boundary = self.buffer.crc_boundary();
        let position = self.buffer.position();
        if boundary == 0 || position <= boundary {
            return Ok(false);
        }
        match self.buffer.format() {
            DataFormat::Ascii => Ok(last_byte == b'\n'),
            DataFormat::Binary if position == boundary + 3 => {
                if last_byte != HDLC_FLAG {
                    return Err(P1Error::UnexpectedFrameEnd(last_byte));
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn verify_crc(&mut self) -> Result<(), P1Error> {
        let data = self.buffer.as_slice();
        let boundary = self.buffer.crc_boundary();
        let (computed, transmitted) = match self.buffer.format() {
            DataFormat::Binary => (crc::binary_checksum(&data[1..boundary]), crc::binary_transmitted(&data[boundary..])),
            _ => (crc::ascii_checksum(&data[..boundary]), crc::ascii_transmitted(&data[boundary..])),
        };

        if transmitted == Some(computed) {
            debug!("CRC verification OK");
            let next = match self.buffer.format() {
                DataFormat::Binary => P1State::ProcessingBinary,
                _ => P1State::ProcessingAscii,
            };
            self.change_state(next);
            return Ok(());
        }

        for byte in data {
            self.discard_log.add_byte(*byte);
        }
        self.discard_log.flush();
        match transmitted {
            Some(transmitted) => Err(P1Error::ChecksumMismatch { computed, transmitted }),
            None => Err(P1Error::MalformedChecksumField),
        }
    }

    fn process_ascii(&mut self, loop_start: u64) -> Result<(), P1Error> {
        self.num_processing_loops += 1;
        // index of the '!' that precedes the checksum
        let end = self.buffer.crc_boundary().saturating_sub(1);
        loop {
            let finished = {
                let data = self.buffer.as_slice();
                let mut start = self.data_cursor;
                while start < end && (data[start] == b'\n' || data[start] == b'\r') {
                    start += 1;
                }
                let mut line_end = start;
                while line_end < end && !matches!(data[line_end], b'\n' | b'\r' | ASCII_CRC_MARK) {
                    line_end += 1;
                }
                if line_end > start {
                    dispatch_line(&mut self.sensors, &data[start..line_end]);
                }
                self.data_cursor = line_end + 1;
                line_end >= end
            };

            if finished {
                self.change_state(P1State::Waiting);
                return Ok(());
            }
            if self.budget_spent(loop_start) {
                return Ok(());
            }
        }
    }

    fn process_binary(&mut self, loop_start: u64) -> Result<(), P1Error> {
        self.num_processing_loops += 1;
        let boundary = self.buffer.crc_boundary();
        if self.data_cursor == 0 {
            self.data_cursor = binary_parser::find_payload_start(self.buffer.as_slice(), boundary)?;
        }

        loop {
            if self.data_cursor >= boundary {
                self.change_state(P1State::Waiting);
                return Ok(());
            }
            let (element, width) = binary_parser::read_element(self.buffer.as_slice(), self.data_cursor, boundary)?;
            match element {
                Element::Address(obis) => self.current_obis = obis,
                Element::Value(value) => {
                    if !self.sensors.publish_value(self.current_obis, value) {
                        debug!("No sensor matched obis code {} (value: {})", self.current_obis, value);
                    }
                }
                Element::Skip => {}
            }
            self.data_cursor += width;

            if self.budget_spent(loop_start) {
                return Ok(());
            }
        }
    }

    fn wait(&mut self, now: u64) -> Result<(), P1Error> {
        if self.display_time_stats {
            self.display_time_stats = false;
            self.report_cycle_stats();
        }

        let minimum_period = self.config.minimum_period_ms;
        if minimum_period == 0 || now.saturating_sub(self.times.identifying) > minimum_period {
            self.change_state(P1State::Identifying);
            return Ok(());
        }
        if self.source.available() {
            if self.read_requested() {
                debug!("Data requested by secondary device, reading early");
                self.change_state(P1State::Identifying);
                return Ok(());
            }
            return Err(P1Error::UnsolicitedData);
        }
        Ok(())
    }

    fn report_cycle_stats(&mut self) {
        let stats = CycleStats::from_times(&self.times, self.num_message_loops, self.num_processing_loops, self.buffer.position());
        self.time_stats_counter += 1;
        if self.time_stats_counter == self.time_stats_as_info_next {
            self.time_stats_as_info_next <<= 1;
            info!("Cycle times: {}", stats);
        } else {
            debug!("Cycle times: {}", stats);
        }
        self.last_cycle_stats = Some(stats);
    }

    fn recover(&mut self, now: u64) {
        if self.source.available() {
            for _ in 0..MAX_DISCARD_PER_TICK {
                match self.get_byte() {
                    Some(byte) => self.discard_log.add_byte(byte),
                    None => break,
                }
            }
            self.times.error_recovery = now;
        } else if now.saturating_sub(self.times.error_recovery) > RECOVERY_QUIET_MS {
            self.discard_log.flush();
            self.change_state(P1State::Waiting);
        }
    }

    fn read_requested(&self) -> bool {
        return self.read_request.as_ref().map(|line| line.is_requesting()).unwrap_or(false);
    }

    fn change_state(&mut self, new_state: P1State) {
        let now = self.clock.millis();
        match new_state {
            P1State::Identifying => {
                self.times.identifying = now;
                self.buffer.clear();
                self.num_message_loops = 0;
                self.num_processing_loops = 0;
                self.secondary_requested = self.read_requested();
                self.triggers.fire(P1Event::ReadyToReceive);
            }
            P1State::Reading => {
                self.times.reading = now;
                self.triggers.fire(P1Event::ReceivingUpdate);
            }
            P1State::VerifyingCrc => {
                self.times.verifying = now;
            }
            P1State::ProcessingAscii | P1State::ProcessingBinary => {
                self.times.processing = now;
                self.data_cursor = 0;
                self.current_obis = Obis::INVALID;
                self.triggers.fire(P1Event::UpdateReceived);
            }
            P1State::Waiting => {
                if self.state != P1State::ErrorRecovery {
                    self.display_time_stats = true;
                    self.triggers.fire(P1Event::UpdateProcessed);
                }
                self.times.waiting = now;
            }
            P1State::ErrorRecovery => {
                self.times.error_recovery = now;
                self.triggers.fire(P1Event::CommunicationError);
            }
        }
        debug!("State {:?} -> {:?}", self.state, new_state);
        self.state = new_state;
    }
}

/// Checksum offset of a binary frame from its 3 header bytes.
fn binary_crc_boundary(header: &[u8]) -> Result<usize, P1Error> {
    let format = header[1];
    if format & 0xe0 != 0xa0 {
        return Err(P1Error::MalformedBinaryHeader(format));
    }
    let length = ((format & 0x1f) as usize) << 8 | header[2] as usize;
    // format field and checksum alone take 4 bytes
    if length < 4 {
        return Err(P1Error::MalformedBinaryHeader(format));
    }
    Ok(length - 1)
}

fn dispatch_line(sensors: &mut SensorRegistry, line: &[u8]) {
    let record = ascii_parser::parse_record(line);
    if let Some(r) = &record {
        if sensors.publish_value(r.obis, r.value) {
            return;
        }
    }
    if sensors.publish_text(line) {
        return;
    }
    match record {
        Some(r) => debug!("No sensor matched line '{}' with obis code {} (parsed value: {})",
            String::from_utf8_lossy(line), r.obis, r.value),
        None => debug!("No sensor matched line '{}'", String::from_utf8_lossy(line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ManualClock, ScriptedSource};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const IDENT: &str = "/ISk5\\2MT382-1000\r\n";

    type Values = Rc<RefCell<Vec<(String, f64)>>>;

    struct Harness {
        reader: P1Reader<ScriptedSource, ManualClock>,
        source: ScriptedSource,
        clock: ManualClock,
        values: Values,
        texts: Rc<RefCell<Vec<String>>>,
        events: Rc<RefCell<Vec<P1Event>>>,
        discarded: Rc<RefCell<String>>,
    }

    impl Harness {
        fn new(config: P1Config, obis_codes: &[&str], text_ids: &[&str]) -> Self {
            let values: Values = Rc::new(RefCell::new(Vec::new()));
            let texts = Rc::new(RefCell::new(Vec::new()));
            let mut sensors = SensorRegistry::new();
            for code in obis_codes {
                let v = values.clone();
                let name = code.to_string();
                sensors.register_sensor(code, move |x| v.borrow_mut().push((name.clone(), x))).unwrap();
            }
            for id in text_ids {
                let t = texts.clone();
                let name = id.to_string();
                sensors.register_text_sensor(id, move |line| t.borrow_mut().push(format!("{}={}", name, line)));
            }

            let source = ScriptedSource::default();
            let clock = ManualClock::default();
            let mut reader = P1Reader::new(config, sensors, source.clone(), clock.clone()).unwrap();

            let events = Rc::new(RefCell::new(Vec::new()));
            let e = events.clone();
            reader.triggers_mut().subscribe(Box::new(move |event: P1Event| e.borrow_mut().push(event)));
            let discarded = Rc::new(RefCell::new(String::new()));
            let d = discarded.clone();
            reader.on_discard(move |hex| d.borrow_mut().push_str(hex));

            Harness { reader, source, clock, values, texts, events, discarded }
        }

        fn with_sensors(obis_codes: &[&str]) -> Self {
            Self::new(P1Config::default(), obis_codes, &[])
        }

        /// Tick until the reader is back in Waiting, collecting the states seen after each tick.
        fn run_to_waiting(&mut self) -> Vec<P1State> {
            let mut states = Vec::new();
            for _ in 0..100 {
                self.reader.tick();
                states.push(self.reader.state());
                if self.reader.state() == P1State::Waiting {
                    return states;
                }
                if self.reader.state() == P1State::ErrorRecovery && self.source.remaining() == 0 {
                    self.clock.advance(RECOVERY_QUIET_MS + 1);
                }
            }
            panic!("reader did not reach Waiting: {:?}", states);
        }

        fn count(&self, event: P1Event) -> usize {
            self.events.borrow().iter().filter(|e| **e == event).count()
        }
    }

    fn ascii_telegram(lines: &str) -> Vec<u8> {
        let body = format!("{}{}!", IDENT, lines);
        let crc = crc::ascii_checksum(body.as_bytes());
        format!("{}{:04X}\r\n", body, crc).into_bytes()
    }

    /// Wrap `payload` (starting after the frame format field) into an HDLC frame.
    fn binary_frame(payload: &[u8]) -> Vec<u8> {
        let length = payload.len() + 4;
        let mut frame = vec![HDLC_FLAG, 0xa0 | (length >> 8) as u8, (length & 0xff) as u8];
        frame.extend_from_slice(payload);
        let crc = crc::binary_checksum(&frame[1..]);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.push(HDLC_FLAG);
        frame
    }

    fn binary_payload(elements: &[u8]) -> Vec<u8> {
        // destination, source, control, HCS, LLC
        let mut payload = vec![0x41, 0x08, 0x83, CONTROL, 0x82, 0x5d, 0xe6, 0xe7, 0x00];
        payload.extend_from_slice(elements);
        payload
    }

    const CONTROL: u8 = binary_parser::CONTROL_BYTE;

    #[test]
    fn test_ascii_telegram_is_dispatched() {
        let mut h = Harness::with_sensors(&["1.8.0"]);
        let telegram = ascii_telegram("1-0:1.8.0(001234.567*kWh)\r\n");
        h.source.push(&telegram);

        let states = h.run_to_waiting();
        assert_eq!(states, vec![P1State::VerifyingCrc, P1State::ProcessingAscii, P1State::Waiting]);
        assert_eq!(*h.values.borrow(), vec![("1.8.0".to_string(), 1234.567)]);
        assert_eq!(*h.events.borrow(), vec![P1Event::ReceivingUpdate, P1Event::UpdateReceived, P1Event::UpdateProcessed]);
        assert_eq!(h.reader.buffer().format(), DataFormat::Ascii);
        assert_eq!(h.reader.buffer().position(), telegram.len());
        assert!(h.discarded.borrow().is_empty());
        assert!(h.reader.last_error().is_none());
    }

    #[test]
    fn test_full_dsmr_telegram() {
        let mut h = Harness::new(P1Config::default(),
            &["1-0:1.8.1", "1-0:1.8.2", "1-0:1.7.0", "0-1:24.2.1", "32.7.0", "0-0:96.14.0"],
            &["0-0:1.0.0", "/"]);
        let lines = "\r\n\
            1-3:0.2.8(50)\r\n\
            0-0:1.0.0(210101120000W)\r\n\
            1-0:1.8.1(000123.456*kWh)\r\n\
            1-0:1.8.2(000234.567*kWh)\r\n\
            0-0:96.14.0(0002)\r\n\
            1-0:1.7.0(01.193*kW)\r\n\
            1-0:32.7.0(230.1*V)\r\n\
            0-1:24.2.1(210101120000W)(00012.345*m3)\r\n";
        h.source.push(&ascii_telegram(lines));
        h.run_to_waiting();

        assert_eq!(*h.values.borrow(), vec![
            ("1-0:1.8.1".to_string(), 123.456),
            ("1-0:1.8.2".to_string(), 234.567),
            ("0-0:96.14.0".to_string(), 2.0),
            ("1-0:1.7.0".to_string(), 1.193),
            ("32.7.0".to_string(), 230.1),
            ("0-1:24.2.1".to_string(), 12.345),
        ]);
        assert_eq!(*h.texts.borrow(), vec![
            "/=/ISk5\\2MT382-1000".to_string(),
            "0-0:1.0.0=0-0:1.0.0(210101120000W)".to_string(),
        ]);
    }

    #[test]
    fn test_checksum_mismatch_dumps_telegram() {
        let mut h = Harness::with_sensors(&["1.8.0"]);
        let mut telegram = ascii_telegram("1-0:1.8.0(001234.567*kWh)\r\n");
        let digit = telegram.len() - 3;
        telegram[digit] = if telegram[digit] == b'0' { b'1' } else { b'0' };
        h.source.push(&telegram);

        let states = h.run_to_waiting();
        assert_eq!(states[..2], [P1State::VerifyingCrc, P1State::ErrorRecovery]);
        assert!(matches!(h.reader.last_error(), Some(P1Error::ChecksumMismatch { .. })));
        assert!(h.values.borrow().is_empty());
        assert_eq!(*h.discarded.borrow(), hex::encode(&telegram));
        assert_eq!(h.count(P1Event::CommunicationError), 1);
        assert_eq!(h.count(P1Event::UpdateReceived), 0);
        assert_eq!(h.count(P1Event::UpdateProcessed), 0);
        assert!(h.reader.last_cycle_stats().is_none());
    }

    #[test]
    fn test_overrun_stays_inside_buffer() {
        let mut h = Harness::new(P1Config { minimum_period_ms: 0, buffer_size: 32 }, &["1.8.0"], &[]);
        let mut data = IDENT.as_bytes().to_vec();
        data.extend(std::iter::repeat(b'x').take(100));
        h.source.push(&data);

        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::ErrorRecovery);
        assert_eq!(h.reader.last_error(), Some(&P1Error::BufferOverrun(32)));
        assert_eq!(h.reader.buffer().position(), 32);
        assert_eq!(h.source.remaining(), data.len() - 32);

        // the rest is drained and logged
        h.run_to_waiting();
        assert_eq!(h.source.remaining(), 0);
        assert_eq!(h.discarded.borrow().len(), (data.len() - 32) * 2);
    }

    #[test]
    fn test_binary_frame_is_dispatched() {
        let mut h = Harness::with_sensors(&["1-0:1.8.0", "1-0:32.7.0", "1-0:2.7.0"]);
        let frame = binary_frame(&binary_payload(&[
            0x0f, 0x00, 0x00, 0x00, 0x00,
            0x0c, 0x07, 0xe4, 0x01, 0x01, 0x03, 0x0c, 0x00, 0x00, 0xff, 0x80, 0x00, 0x00,
            0x02, 0x03,
            0x0a, 0x04, b'K', b'F', b'M', b'_',
            0x09, 0x06, 0x01, 0x00, 0x01, 0x08, 0x00, 0xff,
            0x06, 0x00, 0x12, 0xd6, 0x87,
            0x09, 0x06, 0x01, 0x00, 0x20, 0x07, 0x00, 0xff,
            0x12, 0x09, 0x03,
            0x09, 0x06, 0x01, 0x00, 0x02, 0x07, 0x00, 0xff,
            0x10, 0x00, 0x00,
            0x16, 0x1b,
        ]));
        h.source.push(&frame);

        let states = h.run_to_waiting();
        assert_eq!(states, vec![P1State::VerifyingCrc, P1State::ProcessingBinary, P1State::Waiting]);
        assert_eq!(h.reader.buffer().format(), DataFormat::Binary);
        assert_eq!(*h.values.borrow(), vec![
            ("1-0:1.8.0".to_string(), 1234.567),
            ("1-0:32.7.0".to_string(), 230.7),
            ("1-0:2.7.0".to_string(), 0.0),
        ]);
    }

    #[test]
    fn test_binary_errors() {
        // wrong frame format bits
        let mut h = Harness::with_sensors(&[]);
        h.source.push(&[HDLC_FLAG, 0x80, 0x10]);
        h.reader.tick();
        assert_eq!(h.reader.last_error(), Some(&P1Error::MalformedBinaryHeader(0x80)));

        // closing flag missing
        let mut h = Harness::with_sensors(&[]);
        let mut frame = binary_frame(&binary_payload(&[0x00]));
        let last = frame.len() - 1;
        frame[last] = 0x00;
        h.source.push(&frame);
        h.reader.tick();
        assert_eq!(h.reader.last_error(), Some(&P1Error::UnexpectedFrameEnd(0x00)));

        // unknown tag
        let mut h = Harness::with_sensors(&[]);
        h.source.push(&binary_frame(&binary_payload(&[0x00, 0x05, 0x00])));
        h.run_to_waiting();
        assert_eq!(h.reader.last_error(), Some(&P1Error::UnsupportedBinaryTag(0x05)));
        assert_eq!(h.count(P1Event::CommunicationError), 1);

        // no control byte
        let mut h = Harness::with_sensors(&[]);
        h.source.push(&binary_frame(&[0x41, 0x08, 0x83, 0x10, 0x00, 0x00]));
        h.run_to_waiting();
        assert_eq!(h.reader.last_error(), Some(&P1Error::MissingControlByte));
    }

    #[test]
    fn test_unknown_framing_byte() {
        let mut h = Harness::with_sensors(&[]);
        h.source.push(b"X1-0:1.8.0(1)\r\n");
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::ErrorRecovery);
        assert_eq!(h.reader.last_error(), Some(&P1Error::UnknownFramingByte(b'X')));

        h.run_to_waiting();
        assert_eq!(*h.discarded.borrow(), hex::encode("1-0:1.8.0(1)\r\n"));
    }

    #[test]
    fn test_idle_timeout_fires_once() {
        let mut h = Harness::with_sensors(&[]);
        h.clock.set(IDLE_TIMEOUT_MS);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Identifying);

        h.clock.advance(1);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::ErrorRecovery);
        assert_eq!(h.reader.last_error(), Some(&P1Error::IdleTimeout(60)));

        h.clock.advance(100);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::ErrorRecovery);
        assert_eq!(h.count(P1Event::CommunicationError), 1);

        // recovery ends quietly and the cycle starts over
        h.clock.advance(RECOVERY_QUIET_MS);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Waiting);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Identifying);
        assert_eq!(h.count(P1Event::ReadyToReceive), 1);
        assert_eq!(h.count(P1Event::UpdateProcessed), 0);
    }

    #[test]
    fn test_frame_timeout() {
        let mut h = Harness::with_sensors(&[]);
        h.source.push(b"/ISk5");
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Reading);

        h.clock.advance(MESSAGE_TIMEOUT_MS);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Reading);
        h.clock.advance(1);
        h.reader.tick();
        assert_eq!(h.reader.last_error(), Some(&P1Error::FrameTimeout(10)));
    }

    #[test]
    fn test_recovery_waits_for_silence() {
        let mut h = Harness::with_sensors(&[]);
        h.source.push(b"?");
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::ErrorRecovery);

        for _ in 0..3 {
            h.clock.advance(400);
            h.source.push(&[0xaa; 250]);
            h.reader.tick();
            assert_eq!(h.source.remaining(), 250 - MAX_DISCARD_PER_TICK);
            h.reader.tick();
            assert_eq!(h.source.remaining(), 0);
        }
        h.clock.advance(RECOVERY_QUIET_MS);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::ErrorRecovery);
        h.clock.advance(1);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Waiting);
        assert_eq!(h.discarded.borrow().len(), 750 * 2);
    }

    #[test]
    fn test_minimum_period_and_unsolicited_data() {
        let config = P1Config { minimum_period_ms: 10_000, buffer_size: 3000 };
        let mut h = Harness::new(config, &["1.8.0"], &[]);
        h.source.push(&ascii_telegram("1-0:1.8.0(1)\r\n"));
        h.run_to_waiting();

        h.clock.advance(5_000);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Waiting);

        h.source.push(b"/");
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::ErrorRecovery);
        assert_eq!(h.reader.last_error(), Some(&P1Error::UnsolicitedData));
    }

    #[test]
    fn test_minimum_period_elapses() {
        let config = P1Config { minimum_period_ms: 10_000, buffer_size: 3000 };
        let mut h = Harness::new(config, &["1.8.0"], &[]);
        h.source.push(&ascii_telegram("1-0:1.8.0(1)\r\n"));
        h.run_to_waiting();

        h.clock.set(10_000);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Waiting);
        h.clock.set(10_001);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Identifying);
    }

    #[test]
    fn test_secondary_request_and_passthrough() {
        let config = P1Config { minimum_period_ms: 10_000, buffer_size: 3000 };
        let mut h = Harness::new(config, &["1.8.0"], &[]);
        let line = Arc::new(AtomicBool::new(false));
        h.reader.set_read_request_line(Box::new(line.clone()));
        let forwarded = Rc::new(RefCell::new(Vec::new()));
        let f = forwarded.clone();
        h.reader.set_passthrough(Box::new(move |b: u8| f.borrow_mut().push(b)));

        let first = ascii_telegram("1-0:1.8.0(1)\r\n");
        h.source.push(&first);
        h.run_to_waiting();
        assert!(!h.reader.secondary_requested());
        assert!(forwarded.borrow().is_empty());

        // requested data may arrive within the minimum period
        line.store(true, Ordering::Relaxed);
        let second = ascii_telegram("1-0:1.8.0(2)\r\n");
        h.source.push(&second);
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Identifying);
        assert!(h.reader.secondary_requested());
        h.run_to_waiting();

        assert_eq!(*forwarded.borrow(), second);
        assert_eq!(*h.values.borrow(), vec![("1.8.0".to_string(), 1.0), ("1.8.0".to_string(), 2.0)]);
    }

    #[test]
    fn test_processing_is_spread_over_ticks() {
        let mut h = Harness::with_sensors(&["1.8.1", "1.8.2", "2.8.1", "2.8.2"]);
        h.source.push(&ascii_telegram("1-0:1.8.1(1)\r\n1-0:1.8.2(2)\r\n1-0:2.8.1(3)\r\n1-0:2.8.2(4)\r\n"));
        h.reader.tick();
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::ProcessingAscii);

        h.clock.set_step(TICK_BUDGET_MS);
        let mut ticks = 0;
        while h.reader.state() == P1State::ProcessingAscii {
            h.reader.tick();
            ticks += 1;
            assert!(ticks < 20);
        }
        assert_eq!(h.reader.state(), P1State::Waiting);
        assert!(ticks > 1);
        let values: Vec<f64> = h.values.borrow().iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(h.reader.last_cycle_stats().map(|s| s.processing_loops), None);

        h.clock.set_step(0);
        h.reader.tick();
        let stats = h.reader.last_cycle_stats().unwrap();
        assert_eq!(stats.processing_loops, ticks);
        assert_eq!(stats.message_loops, 1);
    }

    #[test]
    fn test_next_telegram_starts_clean() {
        let mut h = Harness::with_sensors(&["1.8.0"]);
        h.source.push(&ascii_telegram("1-0:1.8.0(1)\r\n"));
        h.run_to_waiting();
        h.reader.tick();
        assert_eq!(h.reader.state(), P1State::Identifying);
        assert_eq!(h.reader.buffer().position(), 0);
        assert_eq!(h.reader.buffer().crc_boundary(), 0);
        assert_eq!(h.reader.buffer().format(), DataFormat::Unknown);

        let second = ascii_telegram("1-0:1.8.0(2.5)\r\n");
        h.source.push(&second);
        h.run_to_waiting();
        h.reader.tick();
        assert_eq!(*h.values.borrow(), vec![("1.8.0".to_string(), 1.0), ("1.8.0".to_string(), 2.5)]);
        assert_eq!(h.count(P1Event::ReadyToReceive), 2);
        assert_eq!(h.reader.last_cycle_stats().unwrap().buffered_bytes, second.len());
    }

    #[test]
    fn test_rejects_invalid_buffer() {
        let result = P1Reader::new(P1Config { minimum_period_ms: 0, buffer_size: 0 },
            SensorRegistry::new(), ScriptedSource::default(), ManualClock::default());
        assert_eq!(result.err(), Some(P1Error::InvalidBufferSize(0)));
    }
}
