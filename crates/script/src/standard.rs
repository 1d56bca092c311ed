//! Standard script templates.

use vcoin_primitives::Transaction;

use crate::interpreter::{eval_script, SignatureChecker, SCRIPT_VERIFY_NONE};
use crate::opcodes::*;

pub const MAX_STANDARD_MULTISIG_KEYS: usize = 3;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Solution {
    PubKey(Vec<u8>),
    PubKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
    MultiSig { required: usize, keys: Vec<Vec<u8>> },
}

impl Solution {
    pub fn kind(&self) -> &'static str {
        match self {
            Solution::PubKey(_) => "pubkey",
            Solution::PubKeyHash(_) => "pubkeyhash",
            Solution::ScriptHash(_) => "scripthash",
            Solution::MultiSig { .. } => "multisig",
        }
    }
}

/// Exact byte pattern `OP_HASH160 <20 bytes> OP_EQUAL`.
pub fn is_pay_to_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_pubkey_push(data: &[u8], opcode: u8) -> bool {
    opcode <= OP_PUSHDATA4 && (33..=65).contains(&data.len())
}

/// Matches `script` against the standard output templates.
pub fn solve(script: &[u8]) -> Option<Solution> {
    if is_pay_to_script_hash(script) {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        return Some(Solution::ScriptHash(hash));
    }

    let ops: Vec<Instruction<'_>> = instructions(script).collect::<Result<_, _>>().ok()?;
    match ops.as_slice() {
        [key, check] if check.opcode == OP_CHECKSIG && is_pubkey_push(key.data, key.opcode) => {
            Some(Solution::PubKey(key.data.to_vec()))
        }
        [dup, hash160, hash, equal_verify, check]
            if dup.opcode == OP_DUP
                && hash160.opcode == OP_HASH160
                && hash.opcode <= OP_PUSHDATA4
                && hash.data.len() == 20
                && equal_verify.opcode == OP_EQUALVERIFY
                && check.opcode == OP_CHECKSIG =>
        {
            let mut out = [0u8; 20];
            out.copy_from_slice(hash.data);
            Some(Solution::PubKeyHash(out))
        }
        [first, keys @ .., total, check] if check.opcode == OP_CHECKMULTISIG => {
            let required = decode_small_int(first.opcode)? as usize;
            let total = decode_small_int(total.opcode)? as usize;
            if keys.iter().any(|key| !is_pubkey_push(key.data, key.opcode)) {
                return None;
            }
            if required < 1 || total < 1 || required > total || keys.len() != total {
                return None;
            }
            Some(Solution::MultiSig {
                required,
                keys: keys.iter().map(|key| key.data.to_vec()).collect(),
            })
        }
        _ => None,
    }
}

pub fn is_standard_script(script: &[u8]) -> bool {
    match solve(script) {
        Some(Solution::MultiSig { keys, .. }) => (1..=MAX_STANDARD_MULTISIG_KEYS).contains(&keys.len()),
        Some(_) => true,
        None => false,
    }
}

/// Stack items a standard scriptSig pushes to satisfy `solution`.
pub fn script_sig_args_expected(solution: &Solution) -> usize {
    match solution {
        Solution::PubKey(_) => 1,
        Solution::PubKeyHash(_) => 2,
        Solution::MultiSig { required, .. } => required + 1,
        Solution::ScriptHash(_) => 1,
    }
}

/// Checks that input `input_index` of `tx` spends `prev_script` with exactly the
/// stack items the template expects, including a standard P2SH redeem script.
pub fn is_input_standard(tx: &Transaction, input_index: usize, prev_script: &[u8]) -> bool {
    let Some(input) = tx.vin.get(input_index) else {
        return false;
    };
    let Some(solution) = solve(prev_script) else {
        return false;
    };
    let mut expected = script_sig_args_expected(&solution);

    let checker = SignatureChecker {
        tx,
        input_index,
        hash_type: 0,
        flags: SCRIPT_VERIFY_NONE,
    };
    let mut stack = Vec::new();
    if eval_script(&input.script_sig, &mut stack, &checker).is_err() {
        return false;
    }

    if let Solution::ScriptHash(_) = solution {
        let Some(redeem_script) = stack.last() else {
            return false;
        };
        match solve(redeem_script) {
            Some(Solution::ScriptHash(_)) | None => return false,
            Some(inner) => expected += script_sig_args_expected(&inner),
        }
    }

    stack.len() == expected
}
