//! Opcode values and script tokenization.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_RESERVED: u8 = 0x50;
pub const OP_1: u8 = 0x51;
pub const OP_2: u8 = 0x52;
pub const OP_3: u8 = 0x53;
pub const OP_4: u8 = 0x54;
pub const OP_5: u8 = 0x55;
pub const OP_6: u8 = 0x56;
pub const OP_7: u8 = 0x57;
pub const OP_8: u8 = 0x58;
pub const OP_9: u8 = 0x59;
pub const OP_10: u8 = 0x5a;
pub const OP_11: u8 = 0x5b;
pub const OP_12: u8 = 0x5c;
pub const OP_13: u8 = 0x5d;
pub const OP_14: u8 = 0x5e;
pub const OP_15: u8 = 0x5f;
pub const OP_16: u8 = 0x60;

pub const OP_NOP: u8 = 0x61;
pub const OP_VER: u8 = 0x62;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_VERIF: u8 = 0x65;
pub const OP_VERNOTIF: u8 = 0x66;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;

pub const OP_TOALTSTACK: u8 = 0x6b;
pub const OP_FROMALTSTACK: u8 = 0x6c;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_3DUP: u8 = 0x6f;
pub const OP_2OVER: u8 = 0x70;
pub const OP_2ROT: u8 = 0x71;
pub const OP_2SWAP: u8 = 0x72;
pub const OP_IFDUP: u8 = 0x73;
pub const OP_DEPTH: u8 = 0x74;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_NIP: u8 = 0x77;
pub const OP_OVER: u8 = 0x78;
pub const OP_PICK: u8 = 0x79;
pub const OP_ROLL: u8 = 0x7a;
pub const OP_ROT: u8 = 0x7b;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_TUCK: u8 = 0x7d;

pub const OP_CAT: u8 = 0x7e;
pub const OP_SUBSTR: u8 = 0x7f;
pub const OP_LEFT: u8 = 0x80;
pub const OP_RIGHT: u8 = 0x81;
pub const OP_SIZE: u8 = 0x82;

pub const OP_INVERT: u8 = 0x83;
pub const OP_AND: u8 = 0x84;
pub const OP_OR: u8 = 0x85;
pub const OP_XOR: u8 = 0x86;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;

pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_2MUL: u8 = 0x8d;
pub const OP_2DIV: u8 = 0x8e;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_MUL: u8 = 0x95;
pub const OP_DIV: u8 = 0x96;
pub const OP_MOD: u8 = 0x97;
pub const OP_LSHIFT: u8 = 0x98;
pub const OP_RSHIFT: u8 = 0x99;
pub const OP_BOOLAND: u8 = 0x9a;
pub const OP_BOOLOR: u8 = 0x9b;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
pub const OP_NUMNOTEQUAL: u8 = 0x9e;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
pub const OP_MIN: u8 = 0xa3;
pub const OP_MAX: u8 = 0xa4;
pub const OP_WITHIN: u8 = 0xa5;

pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA1: u8 = 0xa7;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

pub const OP_NOP1: u8 = 0xb0;
pub const OP_NOP10: u8 = 0xb9;

/// One parsed script element: the opcode and, for pushes, the pushed bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: &'a [u8],
}

/// Reads the instruction at `*cursor`, advancing past it.
///
/// Returns `None` at the end of the script and `Some(Err(()))` for a truncated push.
pub fn next_instruction<'a>(
    script: &'a [u8],
    cursor: &mut usize,
) -> Option<Result<Instruction<'a>, ()>> {
    let opcode = *script.get(*cursor)?;
    *cursor += 1;
    let len = match opcode {
        0x01..=0x4b => opcode as usize,
        OP_PUSHDATA1 => match script.get(*cursor) {
            Some(len) => {
                *cursor += 1;
                *len as usize
            }
            None => return Some(Err(())),
        },
        OP_PUSHDATA2 => match script.get(*cursor..*cursor + 2) {
            Some(bytes) => {
                *cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            None => return Some(Err(())),
        },
        OP_PUSHDATA4 => match script.get(*cursor..*cursor + 4) {
            Some(bytes) => {
                *cursor += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            None => return Some(Err(())),
        },
        _ => 0,
    };
    let end = match cursor.checked_add(len) {
        Some(end) if end <= script.len() => end,
        _ => {
            *cursor = script.len();
            return Some(Err(()));
        }
    };
    let data = &script[*cursor..end];
    *cursor = end;
    Some(Ok(Instruction { opcode, data }))
}

/// Iterator over a script's instructions; stops after the first malformed push.
pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = next_instruction(self.script, &mut self.cursor)?;
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions {
        script,
        cursor: 0,
        failed: false,
    }
}

/// Value of OP_0 and OP_1..OP_16, if `opcode` is one of them.
pub fn decode_small_int(opcode: u8) -> Option<u8> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(opcode - OP_1 + 1),
        _ => None,
    }
}

/// A script consisting only of pushes and small-integer opcodes.
pub fn is_push_only(script: &[u8]) -> bool {
    instructions(script).all(|item| matches!(item, Ok(ins) if ins.opcode <= OP_16))
}

/// Canonical push of `data`, as produced when a script is built with `<< data`.
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(OP_PUSHDATA1);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(OP_PUSHDATA2);
        out.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        out.push(OP_PUSHDATA4);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}

/// Removes every occurrence of `pattern` that starts on an instruction boundary.
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> Vec<u8> {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut cursor = 0usize;
    loop {
        while script.len() - cursor >= pattern.len()
            && &script[cursor..cursor + pattern.len()] == pattern
        {
            cursor += pattern.len();
        }
        let start = cursor;
        match next_instruction(script, &mut cursor) {
            Some(Ok(_)) => out.extend_from_slice(&script[start..cursor]),
            Some(Err(())) => {
                out.extend_from_slice(&script[start..]);
                break;
            }
            None => break,
        }
    }
    out
}

/// A script whose first opcode is OP_RETURN can never be spent.
pub fn is_unspendable(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_pushes() {
        let script = [OP_DUP, 0x02, 0xaa, 0xbb, OP_PUSHDATA1, 0x01, 0xcc, OP_1];
        let parsed: Vec<_> = instructions(&script).collect::<Result<_, _>>().expect("parse");
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[1].data, &[0xaa, 0xbb]);
        assert_eq!(parsed[2].data, &[0xcc]);
        assert!(instructions(&[0x05, 0x01]).any(|item| item.is_err()));
    }

    #[test]
    fn push_only_accepts_small_ints() {
        assert!(is_push_only(&[OP_0, OP_1, OP_16, 0x01, 0x00]));
        assert!(!is_push_only(&[OP_1, OP_DUP]));
        assert!(!is_push_only(&[0x02, 0x00]));
    }

    #[test]
    fn find_and_delete_respects_boundaries() {
        let sig = push_data(&[0xab]);
        // The OP_CODESEPARATOR byte inside the push must survive.
        let script = [0x01, OP_CODESEPARATOR, OP_CODESEPARATOR, OP_DUP];
        assert_eq!(
            find_and_delete(&script, &[OP_CODESEPARATOR]),
            vec![0x01, OP_CODESEPARATOR, OP_DUP]
        );
        let script = [0x01, 0xab, OP_DUP, 0x01, 0xab];
        assert_eq!(find_and_delete(&script, &sig), vec![OP_DUP]);
    }

    #[test]
    fn push_data_picks_smallest_prefix() {
        assert_eq!(push_data(&[7u8; 3])[0], 3);
        assert_eq!(&push_data(&[7u8; 80])[..2], &[OP_PUSHDATA1, 80]);
        assert_eq!(&push_data(&[7u8; 300])[..3], &[OP_PUSHDATA2, 0x2c, 0x01]);
    }
}
