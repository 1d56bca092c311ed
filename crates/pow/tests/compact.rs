use vcoin_pow::difficulty::{
    compact_to_target, compact_to_u256, hash_meets_target, target_to_compact, CompactError,
};

#[test]
fn compact_to_target_roundtrip() {
    let bits = 0x1d00ffff;
    let target = compact_to_target(bits).expect("target");
    assert_eq!(target_to_compact(&target), bits);
}

#[test]
fn compact_target_layout() {
    let target = compact_to_target(0x207fffff).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
}

#[test]
fn sign_bit_and_overflow_are_rejected() {
    assert_eq!(compact_to_u256(0x1d80_ffff), Err(CompactError::Negative));
    assert_eq!(compact_to_u256(0x2301_0000), Err(CompactError::Overflow));
    assert!(compact_to_u256(0x0180_0000).expect("zero").is_zero());
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    assert!(hash_meets_target(&[0x00u8; 32], &target));
    assert!(!hash_meets_target(&[0xffu8; 32], &target));
}
