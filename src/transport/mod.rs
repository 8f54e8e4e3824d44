use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{error::TryRecvError, Receiver, Sender};

/// Polled byte input. Implementations must never block.
pub trait ByteSource {
    fn available(&mut self) -> bool;
    fn read_byte(&mut self) -> Option<u8>;
}

/// Monotonic milliseconds.
pub trait Clock {
    fn millis(&self) -> u64;
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        return SystemClock { start: Instant::now() };
    }
}

impl Clock for SystemClock {
    fn millis(&self) -> u64 {
        return self.start.elapsed().as_millis() as u64;
    }
}

/// Request line of a secondary P1 device (RTS), read as a flag.
pub trait ReadRequestLine {
    fn is_requesting(&self) -> bool;
}

impl ReadRequestLine for Arc<AtomicBool> {
    fn is_requesting(&self) -> bool {
        return self.load(Ordering::Relaxed);
    }
}

/// Receives every byte read while a secondary device requests data.
pub trait ByteSink {
    fn write_byte(&mut self, byte: u8);
}

impl<F: FnMut(u8)> ByteSink for F {
    fn write_byte(&mut self, byte: u8) {
        self(byte)
    }
}

/// Byte source fed by a tokio task through a channel of chunks.
pub struct ChannelSource {
    receiver: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    closed: bool,
}

impl ChannelSource {
    pub fn new(receiver: Receiver<Vec<u8>>) -> Self {
        return ChannelSource {
            receiver,
            pending: VecDeque::new(),
            closed: false,
        };
    }

    /// True once the feeding task is gone and every byte was consumed.
    pub fn is_exhausted(&self) -> bool {
        return self.closed && self.pending.is_empty();
    }

    fn poll(&mut self) {
        while self.pending.is_empty() && !self.closed {
            match self.receiver.try_recv() {
                Ok(chunk) => self.pending.extend(chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Input channel closed");
                    self.closed = true;
                }
            }
        }
    }
}

impl ByteSource for ChannelSource {
    fn available(&mut self) -> bool {
        self.poll();
        return !self.pending.is_empty();
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.poll();
        return self.pending.pop_front();
    }
}

/// Copy everything from `reader` into `sender` until EOF or error.
pub async fn pump<R: AsyncRead + Unpin>(mut reader: R, sender: Sender<Vec<u8>>) {
    let mut buffer = [0u8; 256];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                info!("End of input reached");
                break;
            }
            Ok(n) => {
                if sender.send(buffer[..n].to_vec()).await.is_err() {
                    debug!("Reader is gone, stopping input");
                    break;
                }
            }
            Err(e) => {
                error!("Reading input failed: {e:?}");
                break;
            }
        }
    }
}
