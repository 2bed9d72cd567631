use criterion::{criterion_group, criterion_main, Criterion};
use pgm_proto::{PacketType, Sqn, Tsi};
use pgm_transport::rxw::{ReceiveWindow, RxwConfig};
use pgm_transport::skb::{Skb, SkbMeta};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::hint::black_box;
use std::time::{Duration, Instant};

fn config() -> RxwConfig {
    RxwConfig {
        capacity: 4096,
        nak_bo_ivl: Duration::from_millis(50),
        nak_rpt_ivl: Duration::from_millis(200),
        nak_rdata_ivl: Duration::from_secs(2),
        nak_ncf_retries: 50,
        nak_data_retries: 50,
    }
}

fn skb(sqn: u32) -> Skb {
    let meta = SkbMeta {
        tsi: Tsi::default(),
        packet_type: PacketType::Odata,
        sqn: Sqn(sqn),
        trail: Sqn(0),
        fragment: None,
        parity_index: None,
    };
    Skb::new(vec![0xAB; 1400], 0..1400, meta)
}

fn bench_in_order(c: &mut Criterion) {
    c.bench_function("rxw_insert_deliver_1000_in_order", |b| {
        b.iter(|| {
            let mut rxw = ReceiveWindow::new(Tsi::default(), config());
            let mut rng = StdRng::seed_from_u64(1);
            let now = Instant::now();
            for i in 0..1000u32 {
                rxw.insert(skb(i), now, &mut rng);
            }
            while let Some(msg) = rxw.pop_message() {
                black_box(msg);
            }
        })
    });
}

fn bench_with_holes(c: &mut Criterion) {
    c.bench_function("rxw_insert_1000_with_10pct_holes_then_repair", |b| {
        b.iter(|| {
            let mut rxw = ReceiveWindow::new(Tsi::default(), config());
            let mut rng = StdRng::seed_from_u64(2);
            let now = Instant::now();
            for i in 0..1000u32 {
                if i % 10 != 3 {
                    rxw.insert(skb(i), now, &mut rng);
                }
            }
            for i in 0..1000u32 {
                if i % 10 == 3 {
                    rxw.insert(skb(i), now, &mut rng);
                }
            }
            while let Some(msg) = rxw.pop_message() {
                black_box(msg);
            }
        })
    });
}

criterion_group!(benches, bench_in_order, bench_with_holes);
criterion_main!(benches);
