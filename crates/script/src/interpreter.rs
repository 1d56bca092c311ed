//! Script interpreter and validation.

use ripemd::{Digest as RipemdDigest, Ripemd160};
use sha1::Sha1;
use vcoin_consensus::constants::MAX_SCRIPT_SIZE;
use vcoin_log::{log_category, Category};
use vcoin_primitives::hash::{hash160, sha256, sha256d};
use vcoin_primitives::Transaction;

use crate::opcodes::*;
use crate::secp::verify_ecdsa;
use crate::sighash::{signature_hash, SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_SINGLE};
use crate::standard::is_pay_to_script_hash;

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;

pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
pub const MAX_OPS_PER_SCRIPT: usize = 201;
pub const MAX_STACK_SIZE: usize = 1000;
pub const MAX_PUBKEYS_PER_MULTISIG: i64 = 20;
const MAX_NUM_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptError {
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    BadOpcode,
    DisabledOpcode,
    UnbalancedConditional,
    InvalidStackOperation,
    NumberOverflow,
    Verify,
    OpReturn,
    PubkeyCount,
    SigCount,
    EvalFalse,
    SigPushOnly,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ScriptError::ScriptSize => "script is too large",
            ScriptError::PushSize => "push value exceeds element size limit",
            ScriptError::OpCount => "operation limit exceeded",
            ScriptError::StackSize => "stack size limit exceeded",
            ScriptError::BadOpcode => "invalid or malformed opcode",
            ScriptError::DisabledOpcode => "disabled opcode",
            ScriptError::UnbalancedConditional => "unbalanced conditional",
            ScriptError::InvalidStackOperation => "operation on too few stack items",
            ScriptError::NumberOverflow => "numeric operand exceeds four bytes",
            ScriptError::Verify => "verify operation failed",
            ScriptError::OpReturn => "OP_RETURN executed",
            ScriptError::PubkeyCount => "multisig key count out of range",
            ScriptError::SigCount => "multisig signature count out of range",
            ScriptError::EvalFalse => "script evaluated to false",
            ScriptError::SigPushOnly => "scriptSig is not push-only",
        };
        f.write_str(message)
    }
}

impl std::error::Error for ScriptError {}

/// Signature context: the spending transaction and which input is being checked.
#[derive(Clone, Copy)]
pub struct SignatureChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    /// Zero means "take the hash type from each signature's final byte".
    pub hash_type: i32,
    pub flags: ScriptFlags,
}

impl<'a> SignatureChecker<'a> {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        if self.flags & SCRIPT_VERIFY_STRICTENC != 0
            && (!is_canonical_signature(sig) || !is_canonical_pubkey(pubkey))
        {
            return false;
        }
        if !matches!(pubkey.len(), 33 | 65) {
            return false;
        }
        let Some((&last, der)) = sig.split_last() else {
            return false;
        };
        let hash_type = if self.hash_type == 0 {
            last as i32
        } else if self.hash_type != last as i32 {
            return false;
        } else {
            self.hash_type
        };
        let digest = signature_hash(script_code, self.tx, self.input_index, hash_type);
        let ok = verify_ecdsa(&digest, der, pubkey);
        if !ok {
            log_category!(
                Category::Script,
                "signature check failed for input {} of {}",
                self.input_index,
                hex(&self.tx.txid())
            );
        }
        ok
    }
}

/// Strict DER encoding plus a recognised hash type.
pub fn is_canonical_signature(sig: &[u8]) -> bool {
    let len = sig.len();
    if !(9..=73).contains(&len) {
        return false;
    }
    let base_type = (sig[len - 1] as i32) & !SIGHASH_ANYONECANPAY;
    if !(SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base_type) {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != len - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= len {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != len {
        return false;
    }
    let integer_ok = |marker: u8, value: &[u8]| {
        marker == 0x02
            && !value.is_empty()
            && value[0] & 0x80 == 0
            && !(value.len() > 1 && value[0] == 0 && value[1] & 0x80 == 0)
    };
    integer_ok(sig[2], &sig[4..4 + len_r]) && integer_ok(sig[4 + len_r], &sig[6 + len_r..len - 1])
}

pub fn is_canonical_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.first() {
        Some(0x04) => pubkey.len() == 65,
        Some(0x02) | Some(0x03) => pubkey.len() == 33,
        _ => false,
    }
}

/// Runs `script_sig` then `script_pubkey`, and the redeem script when P2SH applies.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    tx: &Transaction,
    input_index: usize,
    flags: ScriptFlags,
    hash_type: i32,
) -> Result<(), ScriptError> {
    let checker = SignatureChecker {
        tx,
        input_index,
        hash_type,
        flags,
    };

    let mut stack = Vec::new();
    eval_script(script_sig, &mut stack, &checker)?;
    let p2sh = flags & SCRIPT_VERIFY_P2SH != 0;
    let mut stack_copy = if p2sh { stack.clone() } else { Vec::new() };

    eval_script(script_pubkey, &mut stack, &checker)?;
    if !stack.last().is_some_and(|top| cast_to_bool(top)) {
        return Err(ScriptError::EvalFalse);
    }

    if p2sh && is_pay_to_script_hash(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        let redeem_script = stack_copy.pop().ok_or(ScriptError::InvalidStackOperation)?;
        eval_script(&redeem_script, &mut stack_copy, &checker)?;
        if !stack_copy.last().is_some_and(|top| cast_to_bool(top)) {
            return Err(ScriptError::EvalFalse);
        }
    }

    Ok(())
}

fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT
            | OP_SUBSTR
            | OP_LEFT
            | OP_RIGHT
            | OP_INVERT
            | OP_AND
            | OP_OR
            | OP_XOR
            | OP_2MUL
            | OP_2DIV
            | OP_MUL
            | OP_DIV
            | OP_MOD
            | OP_LSHIFT
            | OP_RSHIFT
    )
}

/// Evaluates `script` on top of `stack`.
pub fn eval_script(
    script: &[u8],
    stack: &mut Vec<Vec<u8>>,
    checker: &SignatureChecker<'_>,
) -> Result<(), ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }

    let mut cursor = 0usize;
    let mut code_start = 0usize;
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut alt_stack: Vec<Vec<u8>> = Vec::new();
    let mut op_count = 0usize;

    while cursor < script.len() {
        let executing = exec_stack.iter().all(|branch| *branch);
        let instruction = match next_instruction(script, &mut cursor) {
            Some(Ok(instruction)) => instruction,
            _ => return Err(ScriptError::BadOpcode),
        };
        let opcode = instruction.opcode;

        if instruction.data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode);
        }

        if executing && opcode <= OP_PUSHDATA4 {
            stack.push(instruction.data.to_vec());
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let value = opcode as i64 - (OP_1 as i64 - 1);
                    stack.push(script_num_to_vec(value));
                }
                OP_NOP | OP_NOP1..=OP_NOP10 => {}

                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let top = pop(stack)?;
                        value = cast_to_bool(&top);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                }
                OP_ELSE => {
                    let last = exec_stack
                        .last_mut()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec_stack
                        .pop()
                        .ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(top(stack, 1)?) {
                        return Err(ScriptError::Verify);
                    }
                    stack.pop();
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                OP_TOALTSTACK => alt_stack.push(pop(stack)?),
                OP_FROMALTSTACK => {
                    let value = alt_stack
                        .pop()
                        .ok_or(ScriptError::InvalidStackOperation)?;
                    stack.push(value);
                }
                OP_2DROP => {
                    require(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    require(stack, 2)?;
                    let len = stack.len();
                    stack.extend_from_within(len - 2..);
                }
                OP_3DUP => {
                    require(stack, 3)?;
                    let len = stack.len();
                    stack.extend_from_within(len - 3..);
                }
                OP_2OVER => {
                    require(stack, 4)?;
                    let len = stack.len();
                    stack.extend_from_within(len - 4..len - 2);
                }
                OP_2ROT => {
                    require(stack, 6)?;
                    let len = stack.len();
                    let moved: Vec<_> = stack.drain(len - 6..len - 4).collect();
                    stack.extend(moved);
                }
                OP_2SWAP => {
                    require(stack, 4)?;
                    let len = stack.len();
                    stack.swap(len - 4, len - 2);
                    stack.swap(len - 3, len - 1);
                }
                OP_IFDUP => {
                    let value = top(stack, 1)?;
                    if cast_to_bool(value) {
                        let value = value.clone();
                        stack.push(value);
                    }
                }
                OP_DEPTH => stack.push(script_num_to_vec(stack.len() as i64)),
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let value = top(stack, 1)?.clone();
                    stack.push(value);
                }
                OP_NIP => {
                    require(stack, 2)?;
                    let len = stack.len();
                    stack.remove(len - 2);
                }
                OP_OVER => {
                    let value = top(stack, 2)?.clone();
                    stack.push(value);
                }
                OP_PICK | OP_ROLL => {
                    require(stack, 2)?;
                    let depth = decode_script_num(&pop(stack)?)?;
                    if depth < 0 || depth as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let index = stack.len() - 1 - depth as usize;
                    let value = if opcode == OP_ROLL {
                        stack.remove(index)
                    } else {
                        stack[index].clone()
                    };
                    stack.push(value);
                }
                OP_ROT => {
                    require(stack, 3)?;
                    let len = stack.len();
                    stack[len - 3..].rotate_left(1);
                }
                OP_SWAP => {
                    require(stack, 2)?;
                    let len = stack.len();
                    stack.swap(len - 2, len - 1);
                }
                OP_TUCK => {
                    require(stack, 2)?;
                    let len = stack.len();
                    let value = stack[len - 1].clone();
                    stack.insert(len - 2, value);
                }
                OP_SIZE => {
                    let len = top(stack, 1)?.len();
                    stack.push(script_num_to_vec(len as i64));
                }

                OP_EQUAL | OP_EQUALVERIFY => {
                    require(stack, 2)?;
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(bool_to_vec(equal));
                    }
                }

                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let value = decode_script_num(top(stack, 1)?)?;
                    let result = match opcode {
                        OP_1ADD => value + 1,
                        OP_1SUB => value - 1,
                        OP_NEGATE => -value,
                        OP_ABS => value.abs(),
                        OP_NOT => (value == 0) as i64,
                        _ => (value != 0) as i64,
                    };
                    stack.pop();
                    stack.push(script_num_to_vec(result));
                }
                OP_ADD
                | OP_SUB
                | OP_BOOLAND
                | OP_BOOLOR
                | OP_NUMEQUAL
                | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL
                | OP_LESSTHAN
                | OP_GREATERTHAN
                | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL
                | OP_MIN
                | OP_MAX => {
                    let a = decode_script_num(top(stack, 2)?)?;
                    let b = decode_script_num(top(stack, 1)?)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    stack.truncate(stack.len() - 2);
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(script_num_to_vec(result));
                    }
                }
                OP_WITHIN => {
                    let value = decode_script_num(top(stack, 3)?)?;
                    let min = decode_script_num(top(stack, 2)?)?;
                    let max = decode_script_num(top(stack, 1)?)?;
                    stack.truncate(stack.len() - 3);
                    stack.push(bool_to_vec(min <= value && value < max));
                }

                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let value = pop(stack)?;
                    let digest = match opcode {
                        OP_RIPEMD160 => Ripemd160::digest(&value).to_vec(),
                        OP_SHA1 => Sha1::digest(&value).to_vec(),
                        OP_SHA256 => sha256(&value).to_vec(),
                        OP_HASH160 => hash160(&value).to_vec(),
                        _ => sha256d(&value).to_vec(),
                    };
                    stack.push(digest);
                }
                OP_CODESEPARATOR => code_start = cursor,

                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    require(stack, 2)?;
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;
                    let script_code = find_and_delete(&script[code_start..], &push_data(&sig));
                    let ok = checker.check_sig(&sig, &pubkey, &script_code);
                    if opcode == OP_CHECKSIGVERIFY {
                        if !ok {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(bool_to_vec(ok));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let mut index = 1usize;
                    require(stack, index)?;
                    let mut keys_count = decode_script_num(top(stack, index)?)?;
                    if !(0..=MAX_PUBKEYS_PER_MULTISIG).contains(&keys_count) {
                        return Err(ScriptError::PubkeyCount);
                    }
                    op_count += keys_count as usize;
                    if op_count > MAX_OPS_PER_SCRIPT {
                        return Err(ScriptError::OpCount);
                    }
                    index += 1;
                    let mut key_index = index;
                    index += keys_count as usize;
                    require(stack, index)?;
                    let mut sigs_count = decode_script_num(top(stack, index)?)?;
                    if sigs_count < 0 || sigs_count > keys_count {
                        return Err(ScriptError::SigCount);
                    }
                    index += 1;
                    let mut sig_index = index;
                    index += sigs_count as usize;
                    require(stack, index)?;

                    let mut script_code = script[code_start..].to_vec();
                    for offset in 0..sigs_count as usize {
                        let sig = top(stack, sig_index + offset)?;
                        script_code = find_and_delete(&script_code, &push_data(sig));
                    }

                    let mut success = true;
                    while success && sigs_count > 0 {
                        let sig = top(stack, sig_index)?;
                        let pubkey = top(stack, key_index)?;
                        if checker.check_sig(sig, pubkey, &script_code) {
                            sig_index += 1;
                            sigs_count -= 1;
                        }
                        key_index += 1;
                        keys_count -= 1;
                        if sigs_count > keys_count {
                            success = false;
                        }
                    }

                    // Includes the extra element consumed by the historic off-by-one.
                    stack.truncate(stack.len() - index);
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::Verify);
                        }
                    } else {
                        stack.push(bool_to_vec(success));
                    }
                }
                _ => return Err(ScriptError::BadOpcode),
            }
        }

        if stack.len() + alt_stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

fn require(stack: &[Vec<u8>], count: usize) -> Result<(), ScriptError> {
    if stack.len() < count {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(())
}

/// Element `depth` positions from the top (1 is the top).
fn top(stack: &[Vec<u8>], depth: usize) -> Result<&Vec<u8>, ScriptError> {
    require(stack, depth)?;
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Vec<Vec<u8>>) -> Result<Vec<u8>, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn bool_to_vec(value: bool) -> Vec<u8> {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

pub fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

/// Little-endian sign-magnitude decode; non-minimal encodings are accepted.
pub fn decode_script_num(data: &[u8]) -> Result<i64, ScriptError> {
    if data.len() > MAX_NUM_SIZE {
        return Err(ScriptError::NumberOverflow);
    }
    let Some(&last) = data.last() else {
        return Ok(0);
    };
    let mut result: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        result |= (*byte as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let mask = !(0x80i64 << (8 * (data.len() - 1)));
        result = -(result & mask);
    }
    Ok(result)
}

pub fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = result.last_mut() {
        if *last & 0x80 != 0 {
            result.push(if value < 0 { 0x80 } else { 0 });
        } else if value < 0 {
            *last |= 0x80;
        }
    }
    result
}

fn hex(hash: &[u8; 32]) -> String {
    hash.iter().rev().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcoin_primitives::{OutPoint, TxIn, TxOut};

    fn dummy_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::new([1; 32], 0),
                script_sig: Vec::new(),
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::new(50, vec![OP_1])],
            lock_time: 0,
        }
    }

    fn run(script: &[u8]) -> Result<Vec<Vec<u8>>, ScriptError> {
        let tx = dummy_tx();
        let checker = SignatureChecker {
            tx: &tx,
            input_index: 0,
            hash_type: 0,
            flags: SCRIPT_VERIFY_P2SH,
        };
        let mut stack = Vec::new();
        eval_script(script, &mut stack, &checker)?;
        Ok(stack)
    }

    #[test]
    fn arithmetic_and_comparison() {
        let stack = run(&[OP_2, OP_3, OP_ADD, OP_5, OP_NUMEQUAL]).expect("eval");
        assert_eq!(stack, vec![vec![1]]);
        let stack = run(&[OP_1, OP_0, OP_2, OP_WITHIN]).expect("eval");
        assert_eq!(stack, vec![vec![1]]);
        let stack = run(&[OP_1NEGATE, OP_ABS, OP_1SUB]).expect("eval");
        assert_eq!(stack, vec![Vec::<u8>::new()]);
    }

    #[test]
    fn numbers_wider_than_four_bytes_fail() {
        let script = [0x05, 1, 2, 3, 4, 5, OP_1ADD];
        assert_eq!(run(&script), Err(ScriptError::NumberOverflow));
    }

    #[test]
    fn disabled_opcode_fails_even_unexecuted() {
        let script = [OP_0, OP_IF, OP_CAT, OP_ENDIF, OP_1];
        assert_eq!(run(&script), Err(ScriptError::DisabledOpcode));
    }

    #[test]
    fn verif_fails_in_unexecuted_branch_but_reserved_does_not() {
        assert_eq!(
            run(&[OP_0, OP_IF, OP_VERIF, OP_ENDIF]),
            Err(ScriptError::BadOpcode)
        );
        assert!(run(&[OP_0, OP_IF, OP_RESERVED, OP_VER, OP_ENDIF, OP_1]).is_ok());
        assert_eq!(run(&[OP_RESERVED]), Err(ScriptError::BadOpcode));
    }

    #[test]
    fn unbalanced_conditionals_fail() {
        assert_eq!(run(&[OP_1, OP_IF]), Err(ScriptError::UnbalancedConditional));
        assert_eq!(run(&[OP_ENDIF]), Err(ScriptError::UnbalancedConditional));
        let stack = run(&[OP_0, OP_IF, OP_2, OP_ELSE, OP_3, OP_ENDIF]).expect("eval");
        assert_eq!(stack, vec![vec![3]]);
    }

    #[test]
    fn op_count_limit() {
        let mut script = vec![OP_NOP; MAX_OPS_PER_SCRIPT];
        assert!(run(&script).is_ok());
        script.push(OP_NOP);
        assert_eq!(run(&script), Err(ScriptError::OpCount));
    }

    #[test]
    fn stack_manipulation() {
        let stack = run(&[OP_1, OP_2, OP_3, OP_ROT]).expect("eval");
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_3, OP_2, OP_ROLL]).expect("eval");
        assert_eq!(stack, vec![vec![2], vec![3], vec![1]]);
        let stack = run(&[OP_1, OP_2, OP_TUCK]).expect("eval");
        assert_eq!(stack, vec![vec![2], vec![1], vec![2]]);
        let stack = run(&[OP_1, OP_2, OP_3, OP_4, OP_5, OP_6, OP_2ROT]).expect("eval");
        assert_eq!(
            stack,
            vec![vec![3], vec![4], vec![5], vec![6], vec![1], vec![2]]
        );
        let stack = run(&[OP_5, OP_TOALTSTACK, OP_FROMALTSTACK]).expect("eval");
        assert_eq!(stack, vec![vec![5]]);
    }

    #[test]
    fn script_numbers_encode_sign_magnitude() {
        assert_eq!(script_num_to_vec(-1), vec![0x81]);
        assert_eq!(script_num_to_vec(128), vec![0x80, 0x00]);
        assert_eq!(script_num_to_vec(-128), vec![0x80, 0x80]);
        assert_eq!(decode_script_num(&[0x80, 0x80]), Ok(-128));
        assert_eq!(decode_script_num(&[0x01, 0x00]), Ok(1));
    }

    #[test]
    fn negative_zero_is_false() {
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x80, 0x00]));
    }

    #[test]
    fn canonical_encodings() {
        assert!(is_canonical_pubkey(&[0x02; 33]));
        assert!(!is_canonical_pubkey(&[0x04; 33]));
        let mut sig = vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x01];
        assert!(is_canonical_signature(&sig));
        sig[8] = 0x05;
        assert!(!is_canonical_signature(&sig));
        sig[8] = 0x81;
        sig[4] = 0x81;
        assert!(!is_canonical_signature(&sig));
    }
}
