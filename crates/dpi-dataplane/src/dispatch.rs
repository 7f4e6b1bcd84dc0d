//! DPI dispatcher (C4, §4.4).
//!
//! Grounded on `sase-dataplane::pipeline::{Stage, Pipeline}`'s ordered
//! `Vec<Box<dyn Stage>>` iteration shape; the NAT/encrypt/encap/QoS stages
//! that pipeline built have no counterpart here (see DESIGN.md) and are
//! replaced by the plugin fan-out, targeting, and verdict-aggregation rules
//! of §4.4.

use crate::accumulator::{AccHandle, AccumulatorStore, PluginDecision};
use dpi_common::header::NetHeader;
use dpi_policy::rule::{SetPredicate, TagResolver};
use std::sync::Arc;

/// Final, aggregated verdict for one dispatch call (§4.4 step 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Drop,
    Passthru,
    Inspect,
}

/// A DPI plugin bound to the dispatcher. Plugins are invoked in bind order
/// (§4.4 "Ordering").
pub trait DpiPlugin: Send + Sync {
    /// Stable id, used as the key into `Accumulator::plugins`.
    fn id(&self) -> u32;

    fn name(&self) -> &'static str;

    /// Handle one packet for a flow already routed to this plugin. Returning
    /// `Drop` short-circuits the remaining plugins (§4.4 step 6e).
    fn on_packet(&self, header: &mut NetHeader<'_>, acc: AccHandle, store: &AccumulatorStore) -> PluginDecision;
}

/// MAC targeting/exclusion for one bound plugin (§4.4 "Targeting semantics").
/// `None` means the unrestricted case for that side.
#[derive(Default)]
pub struct Targeting {
    pub targeted_devices: Option<SetPredicate>,
    pub excluded_devices: Option<SetPredicate>,
}

impl Targeting {
    fn included(&self, resolver: &dyn TagResolver, smac: &str, dmac: &str) -> bool {
        if let Some(excluded) = &self.excluded_devices {
            if excluded.holds(resolver, smac) || excluded.holds(resolver, dmac) {
                return false;
            }
        }
        match &self.targeted_devices {
            None => true,
            Some(targeted) => targeted.holds(resolver, smac) || targeted.holds(resolver, dmac),
        }
    }
}

struct BoundPlugin {
    plugin: Arc<dyn DpiPlugin>,
    targeting: Targeting,
}

/// The DPI dispatcher: owns the plugin list (not the plugins themselves,
/// per §3's ownership summary) and runs §4.4's fan-out algorithm.
pub struct Dispatcher {
    plugins: Vec<BoundPlugin>,
    resolver: Arc<dyn TagResolver>,
}

impl Dispatcher {
    pub fn new(resolver: Arc<dyn TagResolver>) -> Self {
        Self { plugins: Vec::new(), resolver }
    }

    /// Bind a plugin at the end of the dispatch order (§4.4 "Ordering").
    pub fn bind(&mut self, plugin: Arc<dyn DpiPlugin>, targeting: Targeting) {
        self.plugins.push(BoundPlugin { plugin, targeting });
    }

    fn mac_string(mac: [u8; 6]) -> String {
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        )
    }

    /// `dispatch(packet)` (§4.4). `smac`/`dmac` come from the parsed
    /// `NetHeader`; the caller is expected to have already filtered
    /// zero-payload UDP per step 1 before reaching this call (the caller
    /// owns the parse, this owns fan-out).
    pub fn dispatch(
        &self,
        header: &mut NetHeader<'_>,
        acc: AccHandle,
        store: &AccumulatorStore,
        smac: [u8; 6],
        dmac: [u8; 6],
    ) -> Verdict {
        let short_circuit = store.with(acc, |a| a.dpi_done && !a.dpi_always).unwrap_or(false);
        if short_circuit {
            return Verdict::Passthru;
        }

        let smac_s = Self::mac_string(smac);
        let dmac_s = Self::mac_string(dmac);

        let mut any_inspect = false;
        let mut all_passthru = true;
        let mut dropped = false;

        for bound in &self.plugins {
            if !bound.targeting.included(self.resolver.as_ref(), &smac_s, &dmac_s) {
                continue;
            }

            store.with_mut(acc, |a| {
                let info = a.plugin_info_mut(bound.plugin.id());
                if info.decision == PluginDecision::Clear {
                    info.decision = PluginDecision::Inspect;
                }
            });

            let should_call = store
                .with(acc, |a| {
                    a.plugins
                        .iter()
                        .find(|p| p.plugin_id == bound.plugin.id())
                        .map(|p| p.decision == PluginDecision::Inspect)
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            let decision = if should_call {
                let d = bound.plugin.on_packet(header, acc, store);
                store.with_mut(acc, |a| a.plugin_info_mut(bound.plugin.id()).decision = d);
                d
            } else {
                store
                    .with(acc, |a| {
                        a.plugins.iter().find(|p| p.plugin_id == bound.plugin.id()).map(|p| p.decision)
                    })
                    .flatten()
                    .unwrap_or(PluginDecision::Clear)
            };

            match decision {
                PluginDecision::Drop => {
                    dropped = true;
                    break;
                }
                PluginDecision::Passthru => {}
                _ => all_passthru = false,
            }
            if matches!(decision, PluginDecision::Inspect) {
                any_inspect = true;
            }
        }

        let verdict = if dropped {
            Verdict::Drop
        } else if all_passthru {
            Verdict::Passthru
        } else {
            let _ = any_inspect;
            Verdict::Inspect
        };

        if matches!(verdict, Verdict::Drop | Verdict::Passthru) {
            store.with_mut(acc, |a| a.dpi_done = true);
        }

        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpi_common::header::IngressSource;
    use dpi_policy::rule::NullTagResolver;
    use std::time::Duration;

    struct AlwaysPassthru;
    impl DpiPlugin for AlwaysPassthru {
        fn id(&self) -> u32 {
            1
        }
        fn name(&self) -> &'static str {
            "always-passthru"
        }
        fn on_packet(&self, _header: &mut NetHeader<'_>, _acc: AccHandle, _store: &AccumulatorStore) -> PluginDecision {
            PluginDecision::Passthru
        }
    }

    struct AlwaysDrop;
    impl DpiPlugin for AlwaysDrop {
        fn id(&self) -> u32 {
            2
        }
        fn name(&self) -> &'static str {
            "always-drop"
        }
        fn on_packet(&self, _header: &mut NetHeader<'_>, _acc: AccHandle, _store: &AccumulatorStore) -> PluginDecision {
            PluginDecision::Drop
        }
    }

    fn sample_header(buf: &mut [u8]) -> NetHeader<'_> {
        buf[12] = 0x08;
        buf[13] = 0x00;
        buf[14] = 0x45;
        buf[16] = 0x00;
        buf[17] = 40;
        buf[23] = 6;
        NetHeader::parse(buf, IngressSource::Socket).unwrap().unwrap()
    }

    #[test]
    fn all_passthru_aggregates_to_passthru() {
        let store = AccumulatorStore::new(Duration::from_secs(60));
        let mut dispatcher = Dispatcher::new(Arc::new(NullTagResolver));
        dispatcher.bind(Arc::new(AlwaysPassthru), Targeting::default());

        let key = dpi_common::flow::FlowKey {
            smac: [0; 6],
            dmac: [0; 6],
            vlan: 0,
            ethertype: 0x0800,
            ip_version: dpi_common::flow::IpVersion::V4,
            protocol: 6,
            sip: "10.0.0.1".parse().unwrap(),
            dip: "10.0.0.2".parse().unwrap(),
            sport: 1,
            dport: 2,
            icmp_id: None,
        };
        let acc = store.insert(key);

        let mut buf = [0u8; 54];
        let mut header = sample_header(&mut buf);
        let verdict = dispatcher.dispatch(&mut header, acc, &store, [0; 6], [0; 6]);
        assert_eq!(verdict, Verdict::Passthru);
    }

    #[test]
    fn drop_short_circuits_remaining_plugins() {
        let store = AccumulatorStore::new(Duration::from_secs(60));
        let mut dispatcher = Dispatcher::new(Arc::new(NullTagResolver));
        dispatcher.bind(Arc::new(AlwaysDrop), Targeting::default());
        dispatcher.bind(Arc::new(AlwaysPassthru), Targeting::default());

        let key = dpi_common::flow::FlowKey {
            smac: [0; 6],
            dmac: [0; 6],
            vlan: 0,
            ethertype: 0x0800,
            ip_version: dpi_common::flow::IpVersion::V4,
            protocol: 6,
            sip: "10.0.0.1".parse().unwrap(),
            dip: "10.0.0.2".parse().unwrap(),
            sport: 3,
            dport: 4,
            icmp_id: None,
        };
        let acc = store.insert(key);

        let mut buf = [0u8; 54];
        let mut header = sample_header(&mut buf);
        let verdict = dispatcher.dispatch(&mut header, acc, &store, [0; 6], [0; 6]);
        assert_eq!(verdict, Verdict::Drop);
    }
}
