use pgm_fec::ReedSolomon;
use pgm_proto::{PacketType, Sqn, Tsi};
use pgm_transport::rxw::{Insert, ReceiveWindow, RxMessage, RxwConfig};
use pgm_transport::skb::{Skb, SkbMeta};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

const K: usize = 4;

fn window() -> (ReceiveWindow, StdRng, Instant) {
    let mut rxw = ReceiveWindow::new(
        Tsi::default(),
        RxwConfig {
            capacity: 64,
            nak_bo_ivl: Duration::from_millis(50),
            nak_rpt_ivl: Duration::from_millis(200),
            nak_rdata_ivl: Duration::from_secs(2),
            nak_ncf_retries: 50,
            nak_data_retries: 50,
        },
    );
    assert!(rxw.set_fec(255, K, false));
    (rxw, StdRng::seed_from_u64(3), Instant::now())
}

fn data_skb(sqn: u32, payload: &[u8]) -> Skb {
    let meta = SkbMeta {
        tsi: Tsi::default(),
        packet_type: PacketType::Odata,
        sqn: Sqn(sqn),
        trail: Sqn(0),
        fragment: None,
        parity_index: None,
    };
    Skb::new(payload.to_vec(), 0..payload.len(), meta)
}

fn parity_skb(group: u32, h: u32, payload: Vec<u8>) -> Skb {
    let len = payload.len();
    let meta = SkbMeta {
        tsi: Tsi::default(),
        packet_type: PacketType::Rdata,
        sqn: Sqn(group),
        trail: Sqn(0),
        fragment: None,
        parity_index: Some(h),
    };
    Skb::new(payload, 0..len, meta)
}

/// Source-side parity for one transmission group of equal-length packets.
fn encode_parity(sources: &[Vec<u8>], h: usize) -> Vec<u8> {
    let rs = ReedSolomon::new(255, K).unwrap();
    let refs: Vec<&[u8]> = sources.iter().map(|s| s.as_slice()).collect();
    let mut out = vec![0u8; sources[0].len()];
    rs.encode(&refs, K + h, &mut out).unwrap();
    out
}

#[test]
fn one_erasure_repaired_by_one_parity() {
    let (mut rxw, mut rng, now) = window();
    let sources: Vec<Vec<u8>> = (0..K).map(|i| vec![i as u8 ^ 0x5a; 16]).collect();

    rxw.insert(data_skb(0, &sources[0]), now, &mut rng);
    rxw.insert(data_skb(1, &sources[1]), now, &mut rng);
    // sqn 2 lost on the wire.
    rxw.insert(data_skb(3, &sources[3]), now, &mut rng);
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[0].clone())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[1].clone())));
    assert_eq!(rxw.pop_message(), None);

    let parity = encode_parity(&sources, 0);
    assert_eq!(
        rxw.insert(parity_skb(0, 0, parity), now, &mut rng),
        Insert::Stored
    );

    // The erased packet is reconstructed bit-exactly and delivery resumes.
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[2].clone())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[3].clone())));
    assert_eq!(rxw.lost_count(), 0);
}

#[test]
fn multiple_erasures_need_matching_parity_count() {
    let (mut rxw, mut rng, now) = window();
    let sources: Vec<Vec<u8>> = (0..K).map(|i| vec![(i * 37) as u8; 32]).collect();

    // Only sqns 0 and 3 arrive; 1 and 2 are erased.
    rxw.insert(data_skb(0, &sources[0]), now, &mut rng);
    rxw.insert(data_skb(3, &sources[3]), now, &mut rng);

    rxw.insert(parity_skb(0, 0, encode_parity(&sources, 0)), now, &mut rng);
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[0].clone())));
    assert_eq!(rxw.pop_message(), None, "one parity cannot mend two holes");

    rxw.insert(parity_skb(0, 1, encode_parity(&sources, 1)), now, &mut rng);
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[1].clone())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[2].clone())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[3].clone())));
}

#[test]
fn unneeded_parity_is_a_duplicate() {
    let (mut rxw, mut rng, now) = window();
    let sources: Vec<Vec<u8>> = (0..K).map(|i| vec![i as u8; 8]).collect();
    for (i, s) in sources.iter().enumerate() {
        rxw.insert(data_skb(i as u32, s), now, &mut rng);
    }
    let outcome = rxw.insert(
        parity_skb(0, 0, encode_parity(&sources, 0)),
        now,
        &mut rng,
    );
    assert_eq!(outcome, Insert::Duplicate);
}

#[test]
fn var_pktlen_restores_exact_lengths() {
    let (mut rxw, mut rng, now) = window();
    assert!(rxw.set_fec(255, K, true));

    let sources = vec![
        b"short".to_vec(),
        b"a somewhat longer packet".to_vec(),
        b"mid-size one".to_vec(),
        b"x".to_vec(),
    ];
    // Source symbols embed each packet's length behind zero padding.
    let max = sources.iter().map(|s| s.len()).max().unwrap();
    let symbol_len = max + 2;
    let symbols: Vec<Vec<u8>> = sources
        .iter()
        .map(|p| {
            let mut s = p.clone();
            let plen = s.len() as u16;
            s.resize(symbol_len - 2, 0);
            s.extend_from_slice(&plen.to_be_bytes());
            s
        })
        .collect();
    let parity = encode_parity(&symbols, 0);

    rxw.insert(data_skb(0, &sources[0]), now, &mut rng);
    // sqn 1 lost.
    rxw.insert(data_skb(2, &sources[2]), now, &mut rng);
    rxw.insert(data_skb(3, &sources[3]), now, &mut rng);
    rxw.insert(parity_skb(0, 0, parity), now, &mut rng);

    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[0].clone())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[1].clone())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[2].clone())));
    assert_eq!(rxw.pop_message(), Some(RxMessage::Data(sources[3].clone())));
}

#[test]
fn parity_cancels_pending_nak_state() {
    let (mut rxw, mut rng, now) = window();
    let sources: Vec<Vec<u8>> = (0..K).map(|i| vec![i as u8; 8]).collect();
    rxw.insert(data_skb(0, &sources[0]), now, &mut rng);
    rxw.insert(data_skb(1, &sources[1]), now, &mut rng);
    rxw.insert(data_skb(3, &sources[3]), now, &mut rng);
    assert!(rxw.next_deadline().is_some(), "hole schedules a NAK");

    rxw.insert(parity_skb(0, 0, encode_parity(&sources, 0)), now, &mut rng);
    assert_eq!(rxw.next_deadline(), None, "repair cleared the NAK timer");
}
