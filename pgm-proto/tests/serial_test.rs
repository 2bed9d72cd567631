use pgm_proto::Sqn;
use proptest::prelude::*;

#[test]
fn window_edges() {
    let trail = Sqn(u32::MAX - 5);
    let lead = Sqn(10);
    assert!(trail.lt(lead));
    assert_eq!(lead.wrapping_sub(trail), 16);
    for s in trail.range_to(lead.next()) {
        assert!(trail.lte(s) && s.lte(lead));
    }
}

proptest! {
    #[test]
    fn antisymmetry(a: u32, b: u32) {
        let (a, b) = (Sqn(a), Sqn(b));
        if a != b && a.wrapping_sub(b) != 1 << 31 {
            prop_assert_ne!(a.lt(b), b.lt(a));
        }
    }

    #[test]
    fn transitive_within_window(base: u32, x in 0u32..1 << 30, y in 0u32..1 << 30) {
        // Any three values spanning less than 2^31 are totally ordered.
        let a = Sqn(base);
        let (lo, hi) = (x.min(y), x.max(y));
        let b = a.wrapping_add(lo);
        let c = a.wrapping_add(hi);
        prop_assert!(a.lte(b));
        prop_assert!(b.lte(c));
        prop_assert!(a.lte(c));
        if lo != 0 && lo != hi {
            prop_assert!(a.lt(b) && b.lt(c) && a.lt(c));
        }
    }

    #[test]
    fn add_then_sub_round_trips(base: u32, d in 0u32..1 << 31) {
        let a = Sqn(base);
        prop_assert_eq!(a.wrapping_add(d).wrapping_sub(a), d);
    }
}
