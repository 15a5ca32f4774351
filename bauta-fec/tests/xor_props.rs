//! Property tests for the XOR block codec: lossless round-trips, single-loss
//! recovery at every index, and non-recovery of multi-loss blocks.

use bauta_fec::{FecParams, XorCodec};
use proptest::prelude::*;

fn arb_batch() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 1..40)
}

fn arb_params() -> impl Strategy<Value = FecParams> {
    (1u8..=100, 1u8..=20).prop_map(|(pct, bs)| FecParams::new(pct, bs).unwrap())
}

proptest! {
    #[test]
    fn no_loss_no_change(batch in arb_batch(), params in arb_params()) {
        let codec = XorCodec::new(params);
        let encoded = codec.encode(&batch);
        prop_assert_eq!(&encoded[..batch.len()], &batch[..]);
        let received: Vec<Option<Vec<u8>>> = encoded.into_iter().map(Some).collect();
        let out = codec.decode(&received, &[]);
        prop_assert!(out.iter().all(Option::is_none));
    }

    #[test]
    fn any_single_loss_recovers(batch in arb_batch(), params in arb_params(), idx in any::<prop::sample::Index>()) {
        let codec = XorCodec::new(params);
        let encoded = codec.encode(&batch);
        let lost = idx.index(batch.len());
        let mut received: Vec<Option<Vec<u8>>> = encoded.iter().cloned().map(Some).collect();
        received[lost] = None;
        let out = codec.decode(&received, &[lost]);
        prop_assert_eq!(out[lost].as_ref(), Some(&batch[lost]));
    }

    #[test]
    fn same_block_double_loss_stays_lost(batch in arb_batch(), pct in 1u8..=100) {
        prop_assume!(batch.len() >= 2);
        // One block covering the whole batch guarantees both losses collide.
        let bs = batch.len().min(255) as u8;
        let codec = XorCodec::new(FecParams::new(pct, bs).unwrap());
        let encoded = codec.encode(&batch);
        let mut received: Vec<Option<Vec<u8>>> = encoded.iter().cloned().map(Some).collect();
        received[0] = None;
        received[1] = None;
        let out = codec.decode(&received, &[0, 1]);
        prop_assert!(out[0].is_none());
        prop_assert!(out[1].is_none());
    }
}
