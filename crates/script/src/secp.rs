use std::sync::OnceLock;

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, VerifyOnly};
use vcoin_consensus::Hash256;

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

pub(crate) fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

/// Verifies a DER signature (without hash-type byte) over `digest`.
///
/// Parsing is lax and high-S signatures are normalized before verification, so any
/// encoding a permissive DER reader would accept keeps verifying.
pub(crate) fn verify_ecdsa(digest: &Hash256, der: &[u8], pubkey: &[u8]) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(mut signature) = Signature::from_der_lax(der) else {
        return false;
    };
    signature.normalize_s();
    let message = Message::from_digest(*digest);
    secp256k1_verify()
        .verify_ecdsa(&message, &signature, &pubkey)
        .is_ok()
}
