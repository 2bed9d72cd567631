use pgm_proto::options::OptFragment;
use pgm_proto::{PacketType, Sqn, Tsi};
use pgm_transport::rxw::{Insert, ReceiveWindow, RxMessage, RxwConfig};
use pgm_transport::skb::{Skb, SkbMeta};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

fn config(capacity: usize) -> RxwConfig {
    RxwConfig {
        capacity,
        nak_bo_ivl: Duration::from_millis(50),
        nak_rpt_ivl: Duration::from_millis(200),
        nak_rdata_ivl: Duration::from_secs(2),
        nak_ncf_retries: 50,
        nak_data_retries: 50,
    }
}

fn window(capacity: usize) -> (ReceiveWindow, StdRng, Instant) {
    let rxw = ReceiveWindow::new(Tsi::default(), config(capacity));
    (rxw, StdRng::seed_from_u64(7), Instant::now())
}

fn data_skb(sqn: u32, trail: u32, payload: &[u8]) -> Skb {
    let meta = SkbMeta {
        tsi: Tsi::default(),
        packet_type: PacketType::Odata,
        sqn: Sqn(sqn),
        trail: Sqn(trail),
        fragment: None,
        parity_index: None,
    };
    Skb::new(payload.to_vec(), 0..payload.len(), meta)
}

fn frag_skb(sqn: u32, trail: u32, payload: &[u8], first: u32, offset: u32, total: u32) -> Skb {
    let meta = SkbMeta {
        tsi: Tsi::default(),
        packet_type: PacketType::Odata,
        sqn: Sqn(sqn),
        trail: Sqn(trail),
        fragment: Some(OptFragment {
            apdu_first_sqn: Sqn(first),
            offset,
            apdu_len: total,
        }),
        parity_index: None,
    };
    Skb::new(payload.to_vec(), 0..payload.len(), meta)
}

#[test]
fn in_order_arrival_commits_immediately() {
    let (mut rxw, mut rng, now) = window(64);
    for (i, payload) in [b"A".as_slice(), b"BB", b"CCC"].iter().enumerate() {
        assert_eq!(
            rxw.insert(data_skb(i as u32, 0, payload), now, &mut rng),
            Insert::Stored
        );
    }
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"A".to_vec())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"BB".to_vec())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"CCC".to_vec())));
    assert_eq!(rxw.pop_message(), None);
    assert_eq!(rxw.commit(), Sqn(3));
}

#[test]
fn hole_blocks_delivery_until_repaired() {
    let (mut rxw, mut rng, now) = window(64);
    rxw.insert(data_skb(0, 0, b"zero"), now, &mut rng);
    rxw.insert(data_skb(2, 0, b"two"), now, &mut rng);

    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"zero".to_vec())));
    assert_eq!(rxw.pop_message(), None, "sqn 2 held behind the hole");

    // The repair fills the hole and releases everything behind it.
    rxw.insert(data_skb(1, 0, b"one"), now, &mut rng);
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"one".to_vec())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"two".to_vec())));
}

#[test]
fn first_nak_deadline_is_jittered_backoff() {
    let (mut rxw, mut rng, now) = window(64);
    rxw.insert(data_skb(0, 0, b"a"), now, &mut rng);
    rxw.insert(data_skb(5, 0, b"f"), now, &mut rng);

    let deadline = rxw.next_deadline().expect("holes have deadlines");
    let delta = deadline - now;
    assert!(delta >= Duration::from_millis(25), "jitter floor: {delta:?}");
    assert!(delta <= Duration::from_millis(75), "jitter ceiling: {delta:?}");

    // Nothing due before the deadline.
    assert!(rxw.timer_expired(now, &mut rng).is_empty());

    let later = now + Duration::from_millis(80);
    let naks = rxw.timer_expired(later, &mut rng);
    assert_eq!(naks, vec![Sqn(1), Sqn(2), Sqn(3), Sqn(4)]);

    // WaitNcf: the repeat timer is the NCF interval, not the back-off.
    let repeat = rxw.next_deadline().unwrap() - later;
    assert_eq!(repeat, Duration::from_millis(200));
}

#[test]
fn ncf_confirm_moves_to_wait_data() {
    let (mut rxw, mut rng, now) = window(64);
    rxw.insert(data_skb(0, 0, b"a"), now, &mut rng);
    rxw.insert(data_skb(2, 0, b"c"), now, &mut rng);

    let t1 = now + Duration::from_millis(80);
    assert_eq!(rxw.timer_expired(t1, &mut rng), vec![Sqn(1)]);

    assert!(rxw.confirm(Sqn(1), t1));
    // Wait-Data holds for the RDATA interval; no NAK repeats meanwhile.
    assert_eq!(rxw.next_deadline(), Some(t1 + Duration::from_secs(2)));
    assert!(rxw.timer_expired(t1 + Duration::from_millis(300), &mut rng).is_empty());

    // RDATA lands: state Have-Data, delivery resumes.
    rxw.insert(data_skb(1, 0, b"b"), t1, &mut rng);
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"a".to_vec())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"b".to_vec())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"c".to_vec())));
}

#[test]
fn exhausted_retries_declare_loss() {
    let (mut rxw, mut rng, now) = window(64);
    let mut cfg = config(64);
    cfg.nak_ncf_retries = 2;
    rxw = ReceiveWindow::new(Tsi::default(), cfg);

    rxw.insert(data_skb(0, 0, b"a"), now, &mut rng);
    rxw.insert(data_skb(2, 0, b"c"), now, &mut rng);

    let mut at = now;
    let mut naks_sent = 0;
    for _ in 0..8 {
        at += Duration::from_millis(500);
        naks_sent += rxw.timer_expired(at, &mut rng).len();
        if rxw.lost_count() > 0 {
            break;
        }
    }
    assert_eq!(naks_sent, 2, "both NAK attempts consumed");
    assert_eq!(rxw.lost_count(), 1);

    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"a".to_vec())));
    assert_eq!(
        rxw.pop_message(),
        Some(RxMessage::Lost {
            first: Sqn(1),
            count: 1
        })
    );
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"c".to_vec())));
    assert_eq!(rxw.commit(), Sqn(3));
}

#[test]
fn late_repair_after_loss_is_dropped() {
    let (mut rxw, mut rng, now) = window(64);
    let mut cfg = config(64);
    cfg.nak_ncf_retries = 0;
    rxw = ReceiveWindow::new(Tsi::default(), cfg);

    rxw.insert(data_skb(0, 0, b"a"), now, &mut rng);
    rxw.insert(data_skb(2, 0, b"c"), now, &mut rng);
    rxw.timer_expired(now + Duration::from_millis(100), &mut rng);
    assert_eq!(rxw.lost_count(), 1);

    let dups_before = rxw.dup_count();
    assert_eq!(
        rxw.insert(data_skb(1, 0, b"b"), now, &mut rng),
        Insert::Duplicate
    );
    assert_eq!(rxw.dup_count(), dups_before + 1);
}

#[test]
fn apdu_delivered_only_when_every_fragment_arrives() {
    let (mut rxw, mut rng, now) = window(64);
    let total = 10u32;
    // Fragments of one APDU: "0123" + "4567" + "89".
    rxw.insert(frag_skb(0, 0, b"0123", 0, 0, total), now, &mut rng);
    rxw.insert(frag_skb(2, 0, b"89", 0, 8, total), now, &mut rng);
    assert_eq!(rxw.pop_message(), None, "middle fragment outstanding");

    rxw.insert(frag_skb(1, 0, b"4567", 0, 4, total), now, &mut rng);
    assert_eq!(
        rxw.pop_message(),
        Some(RxMessage::Data(b"0123456789".to_vec()))
    );
    assert_eq!(rxw.commit(), Sqn(3), "cursor jumps the whole APDU");
}

#[test]
fn fragmented_and_whole_apdus_interleave() {
    let (mut rxw, mut rng, now) = window(64);
    rxw.insert(data_skb(0, 0, b"solo"), now, &mut rng);
    rxw.insert(frag_skb(1, 0, b"ab", 1, 0, 4), now, &mut rng);
    rxw.insert(frag_skb(2, 0, b"cd", 1, 2, 4), now, &mut rng);
    rxw.insert(data_skb(3, 0, b"tail"), now, &mut rng);

    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"solo".to_vec())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"abcd".to_vec())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"tail".to_vec())));
}

#[test]
fn spm_trail_advance_declares_midwindow_loss() {
    // A 1024-slot window holding 0..499 and 700..999; the source then
    // declares its trail at 700.
    let (mut rxw, mut rng, now) = window(1024);
    for i in 0..500u32 {
        rxw.insert(data_skb(i, 0, &[1]), now, &mut rng);
    }
    for i in 700..1000u32 {
        rxw.insert(data_skb(i, 0, &[2]), now, &mut rng);
    }
    for _ in 0..500 {
        assert!(matches!(rxw.pop_message(), Some(RxMessage::Data(_))));
    }
    assert_eq!(rxw.pop_message(), None);

    rxw.update_trail(Sqn(700));
    assert_eq!(rxw.trail(), Sqn(700));
    assert_eq!(rxw.lost_count(), 200);
    assert_eq!(
        rxw.pop_message(),
        Some(RxMessage::Lost {
            first: Sqn(500),
            count: 200
        })
    );
    for _ in 700..1000 {
        assert!(matches!(rxw.pop_message(), Some(RxMessage::Data(_))));
    }
    assert_eq!(rxw.pop_message(), None);
    assert_eq!(rxw.commit(), Sqn(1000));
}

#[test]
fn trail_advance_within_committed_region_loses_nothing() {
    let (mut rxw, mut rng, now) = window(1024);
    for i in 0..100u32 {
        rxw.insert(data_skb(i, 0, &[1]), now, &mut rng);
    }
    while rxw.pop_message().is_some() {}

    rxw.update_trail(Sqn(50));
    assert_eq!(rxw.trail(), Sqn(50));
    assert_eq!(rxw.lost_count(), 0);
    assert_eq!(rxw.pop_message(), None);
}

#[test]
fn duplicates_are_counted_not_delivered() {
    let (mut rxw, mut rng, now) = window(64);
    rxw.insert(data_skb(0, 0, b"x"), now, &mut rng);
    assert_eq!(rxw.insert(data_skb(0, 0, b"x"), now, &mut rng), Insert::Duplicate);
    assert_eq!(rxw.dup_count(), 1);
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"x".to_vec())));
    assert_eq!(rxw.pop_message(), None);
}

#[test]
fn window_defined_by_spm_then_backfilled() {
    let (mut rxw, mut rng, now) = window(64);
    rxw.update_trail(Sqn(10));
    assert!(rxw.is_defined());
    assert_eq!(rxw.trail(), Sqn(10));

    // Data from before the declared trail is a stale duplicate.
    assert_eq!(
        rxw.insert(data_skb(9, 0, b"old"), now, &mut rng),
        Insert::Duplicate
    );
    assert_eq!(
        rxw.insert(data_skb(10, 10, b"new"), now, &mut rng),
        Insert::Stored
    );
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(b"new".to_vec())));
}
