//! `DpiWorld` (§9 Design Notes): "Encapsulate [engine handle, signature
//! version, plugin registry] in a single value constructed at startup;
//! avoid free-floating singletons."
//!
//! Everything the ingress loop touches per packet — the bound
//! [`Dispatcher`], the flow table, the policy engine and verdict caches,
//! and the report emitter — hangs off one `DpiWorld` built once in
//! [`DpiWorld::new`], rather than module-level statics.

use crate::config::GatewayConfig;
use dpi_common::metrics::LatencyHistogram;
use dpi_dataplane::{AccumulatorStore, Dispatcher, DispatchStats};
use dpi_inspect::attributes::{DhcpPlugin, DnsPlugin, MdnsPlugin, NeighborPlugin, SniHostUrlPlugin};
use dpi_inspect::classify::{AlwaysTag, SignaturePlugin};
use dpi_inspect::{SignatureEngine, SignatureLoader};
use dpi_policy::cache::VerdictCache;
use dpi_policy::engine::PolicyEngine;
use dpi_policy::rule::NullTagResolver;
use dpi_policy::TagResolver;
use dpi_report::{FlowReport, FlowTelemetry, HealthStats, ReportEmitter, ReportSink, UdpReportSink};
use std::sync::Arc;
use std::time::Duration;

/// Everything one dispatch call needs, built once at startup (§9).
pub struct DpiWorld {
    pub config: GatewayConfig,
    pub dispatcher: Dispatcher,
    pub store: Arc<AccumulatorStore>,
    pub policy: Arc<PolicyEngine>,
    pub cache: Arc<VerdictCache>,
    pub signature_engine: Arc<SignatureEngine>,
    pub signature_loader: SignatureLoader,
    pub neighbor: Arc<NeighborPlugin>,
    pub report_emitter: ReportEmitter,
    pub health_stats: Arc<HealthStats>,
    pub dispatch_stats: DispatchStats,
    pub dispatch_latency: LatencyHistogram,
}

impl DpiWorld {
    /// Build a fully-wired world from config (§9). `gateway_mac` is used as
    /// the "local" side for DNS answer rewriting.
    pub fn new(config: GatewayConfig) -> std::io::Result<Self> {
        let resolver: Arc<dyn TagResolver> = Arc::new(NullTagResolver);
        let mut dispatcher = Dispatcher::new(resolver);

        let policy = Arc::new(PolicyEngine::new());
        let cache = Arc::new(VerdictCache::new());
        let store = Arc::new(AccumulatorStore::new(config.acc_ttl()));

        let (_handle, signature_engine) = SignatureEngine::handle_create(config.sandbox_size);
        let signature_loader = SignatureLoader::new(signature_engine.clone());
        let app_check = Arc::new(AlwaysTag);
        let signature_plugin = Arc::new(SignaturePlugin::new(signature_engine.clone(), app_check));

        let sink = UdpReportSink::bind(config.report_collector)?;
        let report_emitter = ReportEmitter::spawn(Arc::new(sink), 1024, Duration::from_millis(500));
        let report_sink = ReportSink {
            emitter: report_emitter.clone(),
            session_topic: config.mqtt_topic.clone(),
            blocker_topic: config.blocker_topic.clone(),
        };

        let dns_plugin = Arc::new(
            DnsPlugin::new(policy.clone(), cache.clone(), config.policy_table.clone(), config.gateway_mac)
                .with_report_sink(report_sink.clone()),
        );
        let sni_plugin = Arc::new(
            SniHostUrlPlugin::new(policy.clone(), cache.clone(), config.policy_table.clone())
                .with_report_sink(report_sink.clone()),
        );
        let dhcp_plugin = Arc::new(DhcpPlugin::new(Vec::new(), Vec::new()));
        let mdns_plugin = Arc::new(MdnsPlugin::new(Vec::new(), config.mdns_src_ip));
        let neighbor_plugin = Arc::new(NeighborPlugin::new(Duration::from_secs(300)));

        dispatcher.bind(signature_plugin, Default::default());
        dispatcher.bind(dns_plugin, Default::default());
        dispatcher.bind(sni_plugin, Default::default());
        dispatcher.bind(dhcp_plugin, Default::default());
        dispatcher.bind(mdns_plugin, Default::default());
        dispatcher.bind(neighbor_plugin.clone(), Default::default());

        let health_stats = Arc::new(HealthStats::default());
        spawn_health_report_tick(
            store.clone(),
            health_stats.clone(),
            report_emitter.clone(),
            config.dpi_health_stats_topic.clone(),
            config.dpi_health_stats_interval(),
        );

        Ok(Self {
            config,
            dispatcher,
            store,
            policy,
            cache,
            signature_engine,
            signature_loader,
            neighbor: neighbor_plugin,
            report_emitter,
            health_stats,
            dispatch_stats: DispatchStats::default(),
            dispatch_latency: LatencyHistogram::new(),
        })
    }
}

/// Periodic DPI-health tick (§4.3 `close_window`, §4.10): every `interval`,
/// close the reporting window and emit per-engine counters plus every
/// reportable flow seen since the last tick.
fn spawn_health_report_tick(
    store: Arc<AccumulatorStore>,
    health_stats: Arc<HealthStats>,
    emitter: ReportEmitter,
    topic: String,
    interval: Duration,
) {
    std::thread::spawn(move || loop {
        std::thread::sleep(interval);
        let flows =
            store.reportable_flows().iter().map(|(mac, tag)| FlowReport::from((mac, tag))).collect::<Vec<_>>();
        store.close_window();
        let telemetry = FlowTelemetry { stats: health_stats.snapshot(), flows };
        dpi_report::emit_health_report(&emitter, &telemetry, &topic);
    });
}
