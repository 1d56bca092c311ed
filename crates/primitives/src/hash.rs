use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha2::Sha256;
use vcoin_consensus::Hash256;

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Double SHA-256, used for transaction ids, block ids, and merkle nodes.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(Sha256::digest(data)));
    out
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha256(data)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_of_empty_input() {
        let digest = sha256d(b"");
        assert_eq!(digest[0], 0x5d);
        assert_eq!(digest[31], 0x56);
    }
}
