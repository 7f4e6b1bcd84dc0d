use criterion::{criterion_group, criterion_main, Criterion};
use dpi_common::flow::{FlowKey, IpVersion};
use dpi_dataplane::AccumulatorStore;
use std::time::Duration;

fn key(i: u32) -> FlowKey {
    FlowKey {
        smac: [0; 6],
        dmac: [1; 6],
        vlan: 0,
        ethertype: 0x0800,
        ip_version: IpVersion::V4,
        protocol: 6,
        sip: std::net::IpAddr::V4(std::net::Ipv4Addr::from(i)),
        dip: std::net::IpAddr::V4(std::net::Ipv4Addr::from(i.wrapping_add(1))),
        sport: (i % 60000) as u16,
        dport: 443,
        icmp_id: None,
    }
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("accumulator_insert", |b| {
        let store = AccumulatorStore::new(Duration::from_secs(60));
        let mut i = 0u32;
        b.iter(|| {
            store.insert(key(i));
            i = i.wrapping_add(1);
        });
    });
}

fn bench_lookup_hit(c: &mut Criterion) {
    let store = AccumulatorStore::new(Duration::from_secs(60));
    for i in 0..10_000 {
        store.insert(key(i));
    }
    c.bench_function("accumulator_lookup_hit", |b| {
        let k = key(5_000);
        b.iter(|| store.lookup(&k));
    });
}

criterion_group!(benches, bench_insert, bench_lookup_hit);
criterion_main!(benches);
