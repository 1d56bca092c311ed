//! Legacy signature hashing.

use vcoin_consensus::Hash256;
use vcoin_primitives::encoding::Encoder;
use vcoin_primitives::hash::sha256d;
use vcoin_primitives::{Encodable, Transaction, TxOut};

use crate::opcodes::{find_and_delete, OP_CODESEPARATOR};

pub const SIGHASH_ALL: i32 = 1;
pub const SIGHASH_NONE: i32 = 2;
pub const SIGHASH_SINGLE: i32 = 3;
pub const SIGHASH_ANYONECANPAY: i32 = 0x80;

/// Digest returned for an out-of-range input, or SIGHASH_SINGLE without a matching output.
///
/// Signing this value is accepted by consensus, so it is returned rather than rejected.
pub const SIGHASH_ONE: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

/// Hash committed to by the signature on input `input_index` of `tx`.
pub fn signature_hash(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: i32,
) -> Hash256 {
    if input_index >= tx.vin.len() {
        return SIGHASH_ONE;
    }

    let mut copy = tx.clone();
    let script_code = find_and_delete(script_code, &[OP_CODESEPARATOR]);
    for input in &mut copy.vin {
        input.script_sig.clear();
    }
    copy.vin[input_index].script_sig = script_code;

    match hash_type & 0x1f {
        SIGHASH_NONE => {
            copy.vout.clear();
            zero_other_sequences(&mut copy, input_index);
        }
        SIGHASH_SINGLE => {
            if input_index >= copy.vout.len() {
                return SIGHASH_ONE;
            }
            copy.vout.truncate(input_index + 1);
            for output in &mut copy.vout[..input_index] {
                *output = TxOut::new(-1, Vec::new());
            }
            zero_other_sequences(&mut copy, input_index);
        }
        _ => {}
    }

    if hash_type & SIGHASH_ANYONECANPAY != 0 {
        let input = copy.vin.swap_remove(input_index);
        copy.vin = vec![input];
    }

    let mut encoder = Encoder::with_capacity(copy.serialized_size() + 4);
    copy.consensus_encode(&mut encoder);
    encoder.write_i32_le(hash_type);
    sha256d(&encoder.into_inner())
}

fn zero_other_sequences(tx: &mut Transaction, input_index: usize) {
    for (index, input) in tx.vin.iter_mut().enumerate() {
        if index != input_index {
            input.sequence = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcoin_primitives::{OutPoint, TxIn};

    fn spend(inputs: usize, outputs: usize) -> Transaction {
        Transaction {
            version: 1,
            vin: (0..inputs)
                .map(|index| TxIn {
                    prevout: OutPoint::new([index as u8 + 1; 32], index as u32),
                    script_sig: vec![0x51],
                    sequence: u32::MAX,
                })
                .collect(),
            vout: (0..outputs)
                .map(|index| TxOut::new(1000 * (index as i64 + 1), vec![0x51]))
                .collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn out_of_range_input_hashes_to_one() {
        let tx = spend(1, 1);
        assert_eq!(signature_hash(&[0x51], &tx, 3, SIGHASH_ALL), SIGHASH_ONE);
    }

    #[test]
    fn single_without_matching_output_hashes_to_one() {
        let tx = spend(2, 1);
        assert_eq!(signature_hash(&[0x51], &tx, 1, SIGHASH_SINGLE), SIGHASH_ONE);
        assert_ne!(signature_hash(&[0x51], &tx, 0, SIGHASH_SINGLE), SIGHASH_ONE);
    }

    #[test]
    fn codeseparators_do_not_affect_digest() {
        let tx = spend(1, 1);
        assert_eq!(
            signature_hash(&[0x51, OP_CODESEPARATOR], &tx, 0, SIGHASH_ALL),
            signature_hash(&[0x51], &tx, 0, SIGHASH_ALL)
        );
    }

    #[test]
    fn none_ignores_outputs_and_foreign_sequences() {
        let tx = spend(2, 2);
        let mut changed = tx.clone();
        changed.vout[1].value = 7;
        changed.vin[1].sequence = 5;
        assert_eq!(
            signature_hash(&[0x51], &tx, 0, SIGHASH_NONE),
            signature_hash(&[0x51], &changed, 0, SIGHASH_NONE)
        );
        assert_ne!(
            signature_hash(&[0x51], &tx, 0, SIGHASH_ALL),
            signature_hash(&[0x51], &changed, 0, SIGHASH_ALL)
        );
    }

    #[test]
    fn anyonecanpay_ignores_other_inputs() {
        let tx = spend(2, 1);
        let mut changed = tx.clone();
        changed.vin[1].prevout = OutPoint::new([9; 32], 4);
        let hash_type = SIGHASH_ALL | SIGHASH_ANYONECANPAY;
        assert_eq!(
            signature_hash(&[0x51], &tx, 0, hash_type),
            signature_hash(&[0x51], &changed, 0, hash_type)
        );
    }
}
