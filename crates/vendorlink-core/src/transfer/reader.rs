//! Background read loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::device::EndpointDescriptor;
use crate::events::{DataEncoding, InboundData};
use crate::protocol::packet::decode;
use crate::transport::{TransportError, UsbTransport};

/// Read loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    pub read_timeout: Duration,
    pub error_backoff: Duration,
    pub max_consecutive_errors: u32,
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadExit {
    /// Stop was requested.
    Stopped,
    /// Too many consecutive read failures.
    Escalated { errors: u32 },
}

/// Receives what the loop reads. Called on the reader thread.
pub trait InboundHandler: Send + Sync + 'static {
    /// A non-empty chunk arrived.
    fn on_chunk(&self, chunk: &[u8]);

    /// A read timed out with no data.
    fn on_idle(&self) {}

    /// The loop is giving up after `errors` consecutive failures. The loop
    /// terminates once this returns.
    fn on_escalation(&self, errors: u32, last: &TransportError);
}

/// Handle to a running read loop.
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<ReadExit>>,
}

impl ReaderHandle {
    pub fn spawn<T, H>(
        transport: Arc<T>,
        endpoint: EndpointDescriptor,
        config: ReaderConfig,
        handler: Arc<H>,
    ) -> std::io::Result<Self>
    where
        T: UsbTransport + ?Sized + 'static,
        H: InboundHandler + ?Sized,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("vendorlink-read-{:02x}", endpoint.address))
            .spawn(move || read_loop(transport.as_ref(), &endpoint, config, handler.as_ref(), &flag))?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Ask the loop to stop after its current read.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait for it to end. From the reader thread itself
    /// this only signals, since a thread cannot join itself.
    pub fn stop_and_join(mut self) -> Option<ReadExit> {
        self.stop();
        let thread = self.thread.take()?;
        if thread.thread().id() == thread::current().id() {
            return None;
        }
        match thread.join() {
            Ok(exit) => Some(exit),
            Err(_) => {
                error!("Read loop panicked");
                None
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop<T, H>(
    transport: &T,
    endpoint: &EndpointDescriptor,
    config: ReaderConfig,
    handler: &H,
    stop: &AtomicBool,
) -> ReadExit
where
    T: UsbTransport + ?Sized,
    H: InboundHandler + ?Sized,
{
    info!(endpoint = %format!("0x{:02X}", endpoint.address), "Starting read loop");
    let buf_len = usize::from(endpoint.max_packet_size.max(1));
    let mut consecutive_errors = 0u32;

    while !stop.load(Ordering::SeqCst) {
        match transport.read(endpoint, buf_len, config.read_timeout) {
            Ok(chunk) if chunk.is_empty() => handler.on_idle(),
            Ok(chunk) => {
                consecutive_errors = 0;
                debug!(len = chunk.len(), "Read chunk");
                handler.on_chunk(&chunk);
            }
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                consecutive_errors += 1;
                warn!(error = %e, consecutive_errors, "Read failed");
                if consecutive_errors >= config.max_consecutive_errors {
                    error!(errors = consecutive_errors, "Too many consecutive read errors");
                    handler.on_escalation(consecutive_errors, &e);
                    return ReadExit::Escalated {
                        errors: consecutive_errors,
                    };
                }
                thread::sleep(config.error_backoff);
            }
        }
    }

    debug!("Read loop stopped");
    ReadExit::Stopped
}

/// Render a chunk for the consumer: UTF-8 text when valid, else
/// `0x0a 0xff ...`. Carries the decoded frame when the chunk is one.
pub fn render_inbound(chunk: &[u8]) -> InboundData {
    let (text, encoding) = match std::str::from_utf8(chunk) {
        Ok(s) => (s.to_string(), DataEncoding::Utf8),
        Err(_) => (
            chunk
                .iter()
                .map(|b| format!("0x{:02x}", b))
                .collect::<Vec<_>>()
                .join(" "),
            DataEncoding::Hex,
        ),
    };
    InboundData {
        text,
        encoding,
        bytes: chunk.to_vec(),
        packet: decode(chunk).ok(),
    }
}
