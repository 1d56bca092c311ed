//! Signature operation counting.

use vcoin_primitives::Transaction;

use crate::opcodes::*;
use crate::standard::is_pay_to_script_hash;

/// Counts signature operations in `script`.
///
/// With `accurate`, a multisig preceded by OP_1..OP_16 counts that many keys;
/// otherwise every multisig counts as twenty. Counting stops at a malformed push.
pub fn script_sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut last_opcode = 0xffu8;
    for instruction in instructions(script) {
        let Ok(instruction) = instruction else {
            break;
        };
        match instruction.opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                count += match last_opcode {
                    OP_1..=OP_16 if accurate => decode_small_int(last_opcode).unwrap_or(20) as u32,
                    _ => 20,
                };
            }
            _ => {}
        }
        last_opcode = instruction.opcode;
    }
    count
}

/// Inexact count over every scriptSig and scriptPubKey of a transaction.
pub fn legacy_sigop_count(tx: &Transaction) -> u32 {
    let inputs: u32 = tx
        .vin
        .iter()
        .map(|input| script_sigop_count(&input.script_sig, false))
        .sum();
    let outputs: u32 = tx
        .vout
        .iter()
        .map(|output| script_sigop_count(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// Accurate count of the redeem script a P2SH spend reveals.
///
/// Returns 0 when `script_pubkey` is not P2SH or `script_sig` is not push-only.
pub fn p2sh_sigop_count(script_sig: &[u8], script_pubkey: &[u8]) -> u32 {
    if !is_pay_to_script_hash(script_pubkey) {
        return 0;
    }
    let mut last_push: &[u8] = &[];
    for instruction in instructions(script_sig) {
        match instruction {
            Ok(instruction) if instruction.opcode <= OP_16 => last_push = instruction.data,
            _ => return 0,
        }
    }
    script_sigop_count(last_push, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multisig_counts_depend_on_accuracy() {
        let script = [OP_2, OP_CHECKMULTISIG, OP_CHECKSIG];
        assert_eq!(script_sigop_count(&script, true), 3);
        assert_eq!(script_sigop_count(&script, false), 21);
        assert_eq!(script_sigop_count(&[OP_CHECKMULTISIGVERIFY], true), 20);
    }

    #[test]
    fn counting_stops_at_truncated_push() {
        let script = [OP_CHECKSIG, 0x05, 0x01, OP_CHECKSIG];
        assert_eq!(script_sigop_count(&script, false), 1);
    }

    #[test]
    fn p2sh_counts_redeem_script() {
        let redeem = [OP_1, OP_CHECKMULTISIG];
        let mut script_sig = vec![OP_0];
        script_sig.extend(push_data(&redeem));
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend([0u8; 20]);
        script_pubkey.push(OP_EQUAL);
        assert_eq!(p2sh_sigop_count(&script_sig, &script_pubkey), 1);
        assert_eq!(p2sh_sigop_count(&[OP_NOP], &script_pubkey), 0);
    }
}
