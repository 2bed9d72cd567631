use pgm_proto::{PacketType, Sqn, Tsi};
use pgm_transport::skb::{Skb, SkbMeta};
use pgm_transport::txw::{fragment_plan, NakOutcome, Repair, TransmitWindow, TxwError};

fn skb(sqn: u32, payload: &[u8]) -> Skb {
    let meta = SkbMeta {
        tsi: Tsi::default(),
        packet_type: PacketType::Odata,
        sqn: Sqn(sqn),
        trail: Sqn(0),
        fragment: None,
        parity_index: None,
    };
    let mut wire = vec![0u8; 16];
    wire.extend_from_slice(payload);
    let start = wire.len() - payload.len();
    let end = wire.len();
    Skb::new(wire, start..end, meta)
}

#[test]
fn push_assigns_consecutive_sqns() {
    let mut txw = TransmitWindow::new(8, Sqn(100));
    assert!(txw.is_empty());
    assert_eq!(txw.lead(), Sqn(99));

    for i in 0..3u32 {
        let assigned = txw.push(skb(100 + i, &[i as u8])).unwrap();
        assert_eq!(assigned, Sqn(100 + i));
    }
    assert_eq!(txw.len(), 3);
    assert_eq!(txw.trail(), Sqn(100));
    assert_eq!(txw.lead(), Sqn(102));
}

#[test]
fn push_rejects_wrong_sqn_and_full_window() {
    let mut txw = TransmitWindow::new(2, Sqn(0));
    assert_eq!(
        txw.push(skb(5, b"x")),
        Err(TxwError::NotNextLead {
            got: Sqn(5),
            want: Sqn(0)
        })
    );
    txw.push(skb(0, b"a")).unwrap();
    txw.push(skb(1, b"b")).unwrap();
    assert_eq!(txw.push(skb(2, b"c")), Err(TxwError::WindowFull));

    txw.advance_trail(Sqn(1));
    assert_eq!(txw.push(skb(2, b"c")), Ok(Sqn(2)));
}

#[test]
fn retransmit_returns_identical_payload() {
    let mut txw = TransmitWindow::new(16, Sqn(0));
    let payload = b"retained for repair".to_vec();
    txw.push(skb(0, &payload)).unwrap();

    let clone = txw.retransmit(Sqn(0)).expect("in window");
    assert_eq!(clone.payload(), payload.as_slice());
    // The window slot and the retransmission share one buffer.
    assert!(clone.ref_count() >= 2);

    assert!(txw.retransmit(Sqn(1)).is_none());
    txw.advance_trail(Sqn(1));
    assert!(txw.retransmit(Sqn(0)).is_none(), "discarded after trail");
}

#[test]
fn advance_trail_is_idempotent_and_clamped() {
    let mut txw = TransmitWindow::new(8, Sqn(0));
    for i in 0..5u32 {
        txw.push(skb(i, &[i as u8])).unwrap();
    }
    txw.advance_trail(Sqn(3));
    assert_eq!(txw.trail(), Sqn(3));
    txw.advance_trail(Sqn(3));
    assert_eq!(txw.trail(), Sqn(3));
    txw.advance_trail(Sqn(2));
    assert_eq!(txw.trail(), Sqn(3), "trail never moves backward");
    txw.advance_trail(Sqn(100));
    assert_eq!(txw.trail(), txw.next_lead(), "clamped to the lead");
    assert!(txw.is_empty());
}

#[test]
fn nak_elimination_absorbs_duplicates() {
    let mut txw = TransmitWindow::new(8, Sqn(0));
    txw.push(skb(0, b"a")).unwrap();
    txw.push(skb(1, b"b")).unwrap();

    assert_eq!(txw.queue_nak(Sqn(1)), NakOutcome::Queued);
    assert_eq!(txw.queue_nak(Sqn(1)), NakOutcome::Eliminated);
    assert_eq!(txw.queue_nak(Sqn(7)), NakOutcome::Missing);

    let Some(Repair::Selective(repair)) = txw.pop_repair() else {
        panic!("expected a selective repair");
    };
    assert_eq!(repair.sqn(), Sqn(1));
    assert_eq!(repair.payload(), b"b");
    assert!(txw.pop_repair().is_none());

    // After draining, a fresh NAK queues again.
    assert_eq!(txw.queue_nak(Sqn(1)), NakOutcome::Queued);
}

#[test]
fn stale_repairs_are_skipped() {
    let mut txw = TransmitWindow::new(8, Sqn(0));
    for i in 0..4u32 {
        txw.push(skb(i, &[i as u8])).unwrap();
    }
    txw.queue_nak(Sqn(0));
    txw.queue_nak(Sqn(3));
    txw.advance_trail(Sqn(2));

    let Some(Repair::Selective(repair)) = txw.pop_repair() else {
        panic!("expected a repair");
    };
    assert_eq!(repair.sqn(), Sqn(3), "repair for discarded sqn skipped");
}

#[test]
fn window_wraps_around_sequence_space() {
    let start = u32::MAX - 2;
    let mut txw = TransmitWindow::new(8, Sqn(start));
    for i in 0..6u32 {
        txw.push(skb(start.wrapping_add(i), &[i as u8])).unwrap();
    }
    assert_eq!(txw.lead(), Sqn(2));
    assert_eq!(txw.len(), 6);
    let repair = txw.retransmit(Sqn(1)).unwrap();
    assert_eq!(repair.payload(), &[4]);
}

#[test]
fn group_payloads_require_complete_group() {
    let mut txw = TransmitWindow::new(16, Sqn(0));
    for i in 0..4u32 {
        txw.push(skb(i, &[i as u8; 4])).unwrap();
    }
    let group = txw.group_payloads(Sqn(0), 4).expect("complete");
    assert_eq!(group.len(), 4);
    assert_eq!(group[2], &[2u8; 4]);
    assert!(txw.group_payloads(Sqn(0), 8).is_none(), "missing packets");

    txw.advance_trail(Sqn(2));
    assert!(txw.group_payloads(Sqn(0), 4).is_none(), "partially discarded");
}

#[test]
fn fragment_plan_splits_with_remainder() {
    let plan = fragment_plan(40_000, 1400, 32).unwrap();
    assert_eq!(plan.len(), 29);
    assert!(plan[..28].iter().all(|r| r.len() == 1400));
    assert_eq!(plan[28].len(), 40_000 - 28 * 1400);

    let single = fragment_plan(100, 1400, 16).unwrap();
    assert_eq!(single, vec![0..100]);

    assert!(matches!(
        fragment_plan(40_000, 1400, 16),
        Err(TxwError::ApduTooLarge { .. })
    ));
}
