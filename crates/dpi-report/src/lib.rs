//! Report emitter (C9, §4.10): URL/event reports and periodic DPI-health
//! flow-telemetry, both serialized and handed to an off-box transport
//! through a single `send_pb_report(topic, buf, len)` contract.
//!
//! Grounded on `sase-ips::alerts::pipeline::AlertPipeline`'s bounded
//! crossbeam channel + batched UDP flush worker; the same shape here
//! drains a queue of pre-serialized reports instead of CEF-formatted
//! alerts, and flushes on a fixed interval rather than on a batch-size
//! threshold (the spec's C9 runs "on a periodic tick driven by each
//! plugin", not on backpressure).

mod sink;
mod stats;

pub use sink::{PbReportSink, Report, ReportEmitter, ReportKind, UdpReportSink};
pub use stats::{FlowTelemetry, HealthStats};

use dpi_common::flow::FlowTag;
use serde::Serialize;

/// Default DPI-health reporting interval (§4.10: "default 120 s").
pub const HEALTH_REPORT_INTERVAL_SECS: u64 = 120;

/// URL/event report (§6 "Reports"): JSON, sent on `session.topic`, with a
/// one-shot `blocker_topic` override when `action == block`.
#[derive(Debug, Clone, Serialize)]
pub struct UrlReport {
    pub device_id: String,
    pub url: String,
    pub action: String,
    pub rule_name: Option<String>,
    pub policy_name: Option<String>,
    pub timestamp_ms: u64,
    pub categories: Option<Vec<String>>,
    pub risk_level: Option<i32>,
}

/// One reportable accumulator's contribution to the periodic DPI-health
/// report (§4.10 "flow telemetry").
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub device_mac: [u8; 6],
    pub vendor: String,
    pub app_name: String,
    pub tags: Vec<String>,
    pub tol_ms: u64,
    pub pkts_scanned: u64,
}

impl From<(&[u8; 6], &FlowTag)> for FlowReport {
    fn from((mac, tag): (&[u8; 6], &FlowTag)) -> Self {
        Self {
            device_mac: *mac,
            vendor: tag.vendor.clone(),
            app_name: tag.app_name.clone(),
            tags: tag.tags.clone(),
            tol_ms: tag.tol_ms,
            pkts_scanned: tag.pkts_scanned,
        }
    }
}

/// Serialize a URL report to JSON and queue it (§6, §4.10). `blocker_topic`
/// overrides `session_topic` for this one message when the action is
/// `block` and an override is configured.
pub fn emit_url_report(
    emitter: &ReportEmitter,
    report: &UrlReport,
    session_topic: &str,
    blocker_topic: Option<&str>,
) {
    let topic = if report.action == "block" {
        blocker_topic.unwrap_or(session_topic)
    } else {
        session_topic
    };
    let Ok(buf) = serde_json::to_vec(report) else {
        tracing::warn!("failed to serialize url report");
        return;
    };
    emitter.emit(Report { kind: ReportKind::Url, topic: topic.to_string(), buf });
}

/// Serialize the periodic DPI-health payload to JSON and queue it (§4.10).
pub fn emit_health_report(emitter: &ReportEmitter, telemetry: &FlowTelemetry, health_topic: &str) {
    let Ok(buf) = serde_json::to_vec(telemetry) else {
        tracing::warn!("failed to serialize health report");
        return;
    };
    emitter.emit(Report { kind: ReportKind::Health, topic: health_topic.to_string(), buf });
}

/// Bundles an emitter with the topic config a plugin needs to send URL
/// reports (§4.10), so attribute plugins hold one value instead of three.
#[derive(Clone)]
pub struct ReportSink {
    pub emitter: ReportEmitter,
    pub session_topic: String,
    pub blocker_topic: Option<String>,
}

impl ReportSink {
    pub fn emit_url(&self, report: &UrlReport) {
        emit_url_report(&self.emitter, report, &self.session_topic, self.blocker_topic.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct RecordingSink(Mutex<Vec<(String, Vec<u8>)>>);
    impl PbReportSink for RecordingSink {
        fn send_pb_report(&self, topic: &str, buf: &[u8]) {
            self.0.lock().unwrap().push((topic.to_string(), buf.to_vec()));
        }
    }

    #[test]
    fn block_action_overrides_topic() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let emitter = ReportEmitter::spawn(sink.clone(), 16, Duration::from_millis(10));
        let report = UrlReport {
            device_id: "aa:bb".to_string(),
            url: "http://bad.example".to_string(),
            action: "block".to_string(),
            rule_name: None,
            policy_name: None,
            timestamp_ms: 0,
            categories: None,
            risk_level: None,
        };
        emit_url_report(&emitter, &report, "session.topic", Some("blocker.topic"));

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while sink.0.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let received = sink.0.lock().unwrap();
        assert_eq!(received[0].0, "blocker.topic");
    }
}
