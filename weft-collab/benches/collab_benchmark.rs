use criterion::{black_box, criterion_group, criterion_main, Criterion};
use uuid::Uuid;
use weft_collab::{ClientConfig, LocalHub, SyncMessage};
use weft_core::NodeKey;

fn bench_delta_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let doc = Uuid::new_v4();
    let delta = vec![0u8; 64];

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(black_box(peer), black_box(doc), black_box(1), black_box(delta.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let encoded = SyncMessage::delta(Uuid::new_v4(), Uuid::new_v4(), 1, vec![0u8; 64]).encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_hub_round_trip(c: &mut Criterion) {
    c.bench_function("hub_paragraph_round_trip", |b| {
        let mut hub = LocalHub::new(Uuid::new_v4());
        let config = ClientConfig { verify_after_sync: false, ..ClientConfig::default() };
        let a = hub.add_client("a", ClientConfig { bootstrap: true, ..config.clone() }).unwrap();
        let other = hub.add_client("b", config).unwrap();
        hub.connect(a).unwrap();
        hub.connect(other).unwrap();

        b.iter(|| {
            hub.update(a, |u| {
                let p = u.create_element("paragraph")?;
                let t = u.create_text("benchmark")?;
                u.append(p, t)?;
                u.append(NodeKey::ROOT, p)
            })
            .unwrap();
            black_box(hub.pump().unwrap());
        })
    });
}

criterion_group!(benches, bench_delta_encode, bench_delta_decode, bench_hub_round_trip);
criterion_main!(benches);
