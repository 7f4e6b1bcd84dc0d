use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which report family a queued [`Report`] belongs to (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Url,
    Health,
}

/// A pre-serialized report waiting to go out (§4.10 `send_pb_report`).
#[derive(Debug, Clone)]
pub struct Report {
    pub kind: ReportKind,
    pub topic: String,
    pub buf: Vec<u8>,
}

/// The `send_pb_report(topic, buf, len)` contract (§4.10): an opaque,
/// swappable transport so the core stays testable without a broker.
pub trait PbReportSink: Send + Sync {
    fn send_pb_report(&self, topic: &str, buf: &[u8]);
}

/// Sends reports as UDP datagrams to a fixed collector address, one
/// datagram per report (no fragmentation handling — callers keep reports
/// under the path MTU).
pub struct UdpReportSink {
    socket: UdpSocket,
    collector: SocketAddr,
}

impl UdpReportSink {
    pub fn bind(collector: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self { socket, collector })
    }
}

impl PbReportSink for UdpReportSink {
    fn send_pb_report(&self, _topic: &str, buf: &[u8]) {
        if let Err(e) = self.socket.send_to(buf, self.collector) {
            tracing::warn!(error = %e, "failed to send report");
        }
    }
}

#[derive(Debug, Default)]
struct EmitterStats {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Queues reports off the dispatch loop and flushes them to a
/// [`PbReportSink`] on a worker thread, batched by a fixed interval
/// (§4.10, §5: off-box sends are a suspension point external collaborators
/// own, never the core).
#[derive(Clone)]
pub struct ReportEmitter {
    sender: Sender<Report>,
    stats: Arc<EmitterStats>,
}

impl ReportEmitter {
    pub fn spawn(sink: Arc<dyn PbReportSink>, queue_size: usize, flush_interval: Duration) -> Self {
        let (sender, receiver) = bounded(queue_size);
        let stats = Arc::new(EmitterStats::default());
        let worker_stats = stats.clone();
        std::thread::spawn(move || Self::worker_loop(receiver, sink, flush_interval, worker_stats));
        Self { sender, stats }
    }

    fn worker_loop(receiver: Receiver<Report>, sink: Arc<dyn PbReportSink>, flush_interval: Duration, stats: Arc<EmitterStats>) {
        let mut last_flush = Instant::now();
        loop {
            match receiver.recv_timeout(flush_interval) {
                Ok(report) => {
                    stats.received.fetch_add(1, Ordering::Relaxed);
                    sink.send_pb_report(&report.topic, &report.buf);
                    stats.sent.fetch_add(1, Ordering::Relaxed);
                    last_flush = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    last_flush = Instant::now();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Queue a report; drops it (counted) if the queue is full rather than
    /// stalling the dispatch loop.
    pub fn emit(&self, report: Report) {
        if self.sender.try_send(report).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sent(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<(String, Vec<u8>)>>);

    impl PbReportSink for RecordingSink {
        fn send_pb_report(&self, topic: &str, buf: &[u8]) {
            self.0.lock().unwrap().push((topic.to_string(), buf.to_vec()));
        }
    }

    #[test]
    fn emitted_report_reaches_sink() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let emitter = ReportEmitter::spawn(sink.clone(), 16, Duration::from_millis(10));
        emitter.emit(Report { kind: ReportKind::Url, topic: "session.topic".to_string(), buf: b"hello".to_vec() });

        let deadline = Instant::now() + Duration::from_secs(1);
        while sink.0.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let received = sink.0.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "session.topic");
    }
}
