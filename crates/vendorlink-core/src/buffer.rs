//! Readiness gate between the link and its consumer.
//!
//! Events pushed before the consumer is ready are held back. Status, device
//! info and network interface events keep only their latest value; everything
//! else is queued in arrival order. `mark_ready` flushes the lot by
//! (timestamp, sequence).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::events::{EventRecord, EventSink, LinkEvent, trace_event};

/// How a pushed event is held while the consumer is away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Data,
    Status,
    DeviceInfo,
    NetworkInterface,
}

impl EventClass {
    pub fn of(event: &LinkEvent) -> Self {
        match event {
            LinkEvent::ConnectionStatus(_) => EventClass::Status,
            LinkEvent::DeviceAttached(_) => EventClass::DeviceInfo,
            LinkEvent::NetworkInterface(_) => EventClass::NetworkInterface,
            _ => EventClass::Data,
        }
    }
}

#[derive(Debug)]
struct BufferedEvent {
    record: EventRecord,
    at: DateTime<Utc>,
    sequence: u64,
}

#[derive(Default)]
struct Held {
    ready: bool,
    next_sequence: u64,
    status: Option<BufferedEvent>,
    device_info: Option<BufferedEvent>,
    network: Option<BufferedEvent>,
    queue: VecDeque<BufferedEvent>,
}

impl Held {
    fn hold(&mut self, class: EventClass, event: BufferedEvent) {
        match class {
            EventClass::Status => self.status = Some(event),
            EventClass::DeviceInfo => self.device_info = Some(event),
            EventClass::NetworkInterface => self.network = Some(event),
            EventClass::Data => self.queue.push_back(event),
        }
    }

    fn drain_sorted(&mut self) -> Vec<BufferedEvent> {
        let mut all: Vec<BufferedEvent> = self.queue.drain(..).collect();
        all.extend(self.status.take());
        all.extend(self.device_info.take());
        all.extend(self.network.take());
        all.sort_by_key(|e| (e.at, e.sequence));
        all
    }

    fn len(&self) -> usize {
        self.queue.len()
            + usize::from(self.status.is_some())
            + usize::from(self.device_info.is_some())
            + usize::from(self.network.is_some())
    }
}

pub struct ReadinessBuffer {
    held: Mutex<Held>,
    sink: Arc<dyn EventSink>,
    ready_tx: watch::Sender<bool>,
}

impl ReadinessBuffer {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            held: Mutex::new(Held::default()),
            sink,
            ready_tx,
        }
    }

    /// Stamp and deliver `event`, or hold it until the consumer is ready.
    pub fn push(&self, event: LinkEvent) {
        trace_event(&event);
        let class = EventClass::of(&event);

        let mut held = self.held.lock();
        let at = Utc::now();
        let sequence = held.next_sequence;
        held.next_sequence += 1;
        let buffered = BufferedEvent {
            record: EventRecord::at(event, at),
            at,
            sequence,
        };

        if held.ready {
            if self.sink.is_available() && self.sink.deliver(&buffered.record).is_ok() {
                return;
            }
            warn!("Consumer went away, buffering events");
            held.ready = false;
            self.ready_tx.send_replace(false);
        }
        held.hold(class, buffered);
    }

    /// Consumer is listening: flush everything held, then deliver directly.
    pub fn mark_ready(&self) {
        let mut held = self.held.lock();
        let pending = held.drain_sorted();
        debug!(count = pending.len(), "Flushing buffered events");

        let mut pending = pending.into_iter();
        while let Some(event) = pending.next() {
            if self.sink.deliver(&event.record).is_err() {
                warn!("Consumer failed during flush, keeping remaining events");
                let class = EventClass::of(&event.record.event);
                held.hold(class, event);
                for rest in pending {
                    let class = EventClass::of(&rest.record.event);
                    held.hold(class, rest);
                }
                return;
            }
        }

        held.ready = true;
        self.ready_tx.send_replace(true);
    }

    /// Consumer went away: hold events again.
    pub fn mark_unavailable(&self) {
        self.held.lock().ready = false;
        self.ready_tx.send_replace(false);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Number of events waiting for the consumer.
    pub fn pending(&self) -> usize {
        self.held.lock().len()
    }

    /// Wait up to `timeout` for the consumer to become ready.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready_tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, DataEncoding, InboundData, SinkError};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn data(text: &str) -> LinkEvent {
        LinkEvent::DataReceived(InboundData {
            text: text.into(),
            encoding: DataEncoding::Utf8,
            bytes: text.as_bytes().to_vec(),
            packet: None,
        })
    }

    fn texts(rx: &async_channel::Receiver<EventRecord>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(match record.event {
                LinkEvent::DataReceived(d) => d.text,
                other => other.kind().to_string(),
            });
        }
        out
    }

    #[test]
    fn test_buffered_events_flush_once_in_order() {
        let (sink, rx) = ChannelSink::unbounded();
        let buffer = ReadinessBuffer::new(Arc::new(sink));

        buffer.push(data("A"));
        buffer.push(data("B"));
        buffer.push(data("C"));
        assert_eq!(buffer.pending(), 3);
        assert!(rx.is_empty());

        buffer.mark_ready();
        assert_eq!(texts(&rx), vec!["A", "B", "C"]);

        buffer.mark_ready();
        assert!(rx.is_empty());

        buffer.push(data("D"));
        assert_eq!(texts(&rx), vec!["D"]);
    }

    #[test]
    fn test_single_slot_events_keep_latest() {
        let (sink, rx) = ChannelSink::unbounded();
        let buffer = ReadinessBuffer::new(Arc::new(sink));

        buffer.push(LinkEvent::ConnectionStatus(true));
        buffer.push(data("A"));
        buffer.push(LinkEvent::ConnectionStatus(false));
        buffer.push(LinkEvent::NetworkInterface("eth0".into()));
        buffer.push(LinkEvent::NetworkInterface("wlan0".into()));
        assert_eq!(buffer.pending(), 3);

        buffer.mark_ready();
        let records: Vec<EventRecord> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].event, data("A"));
        assert_eq!(records[1].event, LinkEvent::ConnectionStatus(false));
        assert_eq!(records[2].event, LinkEvent::NetworkInterface("wlan0".into()));
    }

    #[test]
    fn test_unavailable_consumer_rebuffers() {
        let (sink, rx) = ChannelSink::unbounded();
        let buffer = ReadinessBuffer::new(Arc::new(sink));
        buffer.mark_ready();

        buffer.mark_unavailable();
        buffer.push(data("late"));
        assert!(rx.is_empty());
        assert_eq!(buffer.pending(), 1);

        buffer.mark_ready();
        assert_eq!(texts(&rx), vec!["late"]);
    }

    struct FlakySink {
        up: AtomicBool,
        tx: async_channel::Sender<EventRecord>,
    }

    impl EventSink for FlakySink {
        fn is_available(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn deliver(&self, record: &EventRecord) -> Result<(), SinkError> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(SinkError::Unavailable);
            }
            self.tx.try_send(record.clone()).map_err(|_| SinkError::Unavailable)
        }
    }

    #[test]
    fn test_delivery_failure_reenters_buffering() {
        let (tx, rx) = async_channel::unbounded();
        let sink = Arc::new(FlakySink {
            up: AtomicBool::new(true),
            tx,
        });
        let buffer = ReadinessBuffer::new(sink.clone());
        buffer.mark_ready();
        assert!(buffer.is_ready());

        sink.up.store(false, Ordering::SeqCst);
        buffer.push(data("X"));
        assert!(!buffer.is_ready());
        assert_eq!(buffer.pending(), 1);

        // Flush fails while the sink is still down
        buffer.mark_ready();
        assert!(!buffer.is_ready());
        assert_eq!(buffer.pending(), 1);

        sink.up.store(true, Ordering::SeqCst);
        buffer.mark_ready();
        assert_eq!(texts(&rx), vec!["X"]);
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let (sink, _rx) = ChannelSink::unbounded();
        let buffer = Arc::new(ReadinessBuffer::new(Arc::new(sink)));

        assert!(!buffer.wait_until_ready(Duration::from_millis(20)).await);

        let b = buffer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            b.mark_ready();
        });
        assert!(buffer.wait_until_ready(Duration::from_secs(2)).await);
    }
}
