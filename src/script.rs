//! Script parsing, serialization and classification.
//!
//! A [`ParsedScript`] keeps the original serialized bytes alongside the
//! decoded opcode sequence. The preserved bytes are authoritative: signature
//! hashing always works on them, and re-encoding the opcode list reproduces
//! them exactly unless decoding hit a truncated push.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use bitcoin::opcodes::{all, Opcode};

use crate::interpreter::ScriptError;
use crate::opcode::{decode_op_n, ParsedOpcode};

/// Scripts larger than this are rejected outright.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// A decoded script together with its original serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedScript {
    ops: Vec<ParsedOpcode>,
    raw: Vec<u8>,
}

impl ParsedScript {
    /// Decodes `bytes`. A push that claims more bytes than remain yields a
    /// trailing [`ParsedOpcode::ParseError`] and stops decoding.
    pub fn parse(bytes: &[u8]) -> Self {
        let mut ops = Vec::new();
        let mut cursor = 0usize;

        while cursor < bytes.len() {
            let opcode = bytes[cursor];
            cursor += 1;

            if (0x01..=0x4b).contains(&opcode) {
                let push_len = opcode as usize;
                if cursor + push_len > bytes.len() {
                    ops.push(ParsedOpcode::ParseError);
                    break;
                }
                ops.push(ParsedOpcode::Push(
                    Opcode::from(opcode),
                    bytes[cursor..cursor + push_len].to_vec(),
                ));
                cursor += push_len;
            } else if opcode == all::OP_PUSHDATA1.to_u8()
                || opcode == all::OP_PUSHDATA2.to_u8()
                || opcode == all::OP_PUSHDATA4.to_u8()
            {
                let width = pushdata_width(opcode);
                let Ok(push_len) = read_push_length(bytes, &mut cursor, width) else {
                    ops.push(ParsedOpcode::ParseError);
                    break;
                };
                if cursor + push_len > bytes.len() {
                    ops.push(ParsedOpcode::ParseError);
                    break;
                }
                ops.push(ParsedOpcode::Push(
                    Opcode::from(opcode),
                    bytes[cursor..cursor + push_len].to_vec(),
                ));
                cursor += push_len;
            } else {
                ops.push(ParsedOpcode::Op(Opcode::from(opcode)));
            }
        }

        Self {
            ops,
            raw: bytes.to_vec(),
        }
    }

    /// The preserved serialization.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn ops(&self) -> &[ParsedOpcode] {
        &self.ops
    }

    pub fn has_parse_error(&self) -> bool {
        self.ops
            .last()
            .map(ParsedOpcode::is_parse_error)
            .unwrap_or(false)
    }

    /// Re-encodes the opcode sequence. Forbidden (returns `None`) when the
    /// script decoded with a parse error; otherwise byte-identical to
    /// [`ParsedScript::raw`].
    pub fn assemble(&self) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.raw.len());
        for op in &self.ops {
            if !op.write_into(&mut out) {
                return None;
            }
        }
        Some(out)
    }
}

fn pushdata_width(opcode: u8) -> usize {
    if opcode == all::OP_PUSHDATA1.to_u8() {
        1
    } else if opcode == all::OP_PUSHDATA2.to_u8() {
        2
    } else {
        4
    }
}

/// Reads a little-endian push length of `width` bytes at `*cursor`.
pub(crate) fn read_push_length(
    bytes: &[u8],
    cursor: &mut usize,
    width: usize,
) -> Result<usize, ScriptError> {
    if bytes.len() < *cursor + width {
        return Err(ScriptError::BadOpcode);
    }
    let mut len: usize = 0;
    for i in 0..width {
        len |= (bytes[*cursor + i] as usize) << (8 * i);
    }
    *cursor += width;
    Ok(len)
}

/// Advances past the instruction starting at `index`, clamping to the script
/// end on a truncated push.
fn instruction_end(bytes: &[u8], index: usize) -> usize {
    let opcode = bytes[index];
    let mut cursor = index + 1;

    if (0x01..=0x4b).contains(&opcode) {
        return (cursor + opcode as usize).min(bytes.len());
    }
    if opcode == all::OP_PUSHDATA1.to_u8()
        || opcode == all::OP_PUSHDATA2.to_u8()
        || opcode == all::OP_PUSHDATA4.to_u8()
    {
        let width = pushdata_width(opcode);
        match read_push_length(bytes, &mut cursor, width) {
            Ok(len) => return (cursor + len).min(bytes.len()),
            Err(_) => return bytes.len(),
        }
    }
    cursor
}

/// Only data pushes (up to OP_16), and no truncated push.
pub fn is_push_only(bytes: &[u8]) -> bool {
    let script = ParsedScript::parse(bytes);
    script
        .ops()
        .iter()
        .all(|op| !op.is_parse_error() && op.value() <= all::OP_PUSHNUM_16.to_u8())
}

/// `HASH160 <20 bytes> EQUAL`.
pub fn is_p2sh(bytes: &[u8]) -> bool {
    bytes.len() == 23
        && bytes[0] == all::OP_HASH160.to_u8()
        && bytes[1] == 0x14
        && bytes[22] == all::OP_EQUAL.to_u8()
}

/// Extracts `(version, program)` from a witness program: a version opcode
/// (OP_0 or OP_1..OP_16) followed by a single direct push of 2..=40 bytes.
pub fn witness_program(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if bytes.len() < 4 || bytes.len() > 42 {
        return None;
    }
    let version = match bytes[0] {
        0x00 => 0,
        v if (all::OP_PUSHNUM_1.to_u8()..=all::OP_PUSHNUM_16.to_u8()).contains(&v) => {
            v - all::OP_PUSHNUM_1.to_u8() + 1
        }
        _ => return None,
    };
    let push_len = bytes[1] as usize;
    if !(2..=40).contains(&push_len) || push_len != bytes.len() - 2 {
        return None;
    }
    Some((version, &bytes[2..]))
}

/// Serializes a single canonical push of `data` (direct length or PUSHDATA
/// prefix, never a small-integer opcode). This is the byte pattern that
/// signature deletion and P2SH witness matching compare against.
pub fn single_push_script(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    if data.len() <= 0x4b {
        out.push(data.len() as u8);
    } else if data.len() <= 0xff {
        out.push(all::OP_PUSHDATA1.to_u8());
        out.push(data.len() as u8);
    } else if data.len() <= 0xffff {
        out.push(all::OP_PUSHDATA2.to_u8());
        out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    } else {
        out.push(all::OP_PUSHDATA4.to_u8());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    }
    out.extend_from_slice(data);
    out
}

/// Whether the script is exactly one push-class instruction.
pub fn is_canonical_single_push(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let script = ParsedScript::parse(bytes);
    script.ops().len() == 1
        && !script.has_parse_error()
        && script.ops()[0].value() <= all::OP_PUSHNUM_16.to_u8()
}

/// Removes every instruction-aligned occurrence of `pattern` from `script`.
/// Returns the filtered bytes and the number of occurrences removed.
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> (Vec<u8>, usize) {
    if pattern.is_empty() || script.len() < pattern.len() {
        return (script.to_vec(), 0);
    }

    let mut result = Vec::with_capacity(script.len());
    let mut index = 0usize;
    let mut removed = 0usize;

    while index < script.len() {
        while script[index..].starts_with(pattern) {
            removed += 1;
            index += pattern.len();
        }
        if index >= script.len() {
            break;
        }
        let end = instruction_end(script, index);
        result.extend_from_slice(&script[index..end]);
        index = end;
    }

    (result, removed)
}

/// Drops every OP_CODESEPARATOR from `bytes`. Fails on a truncated push,
/// which cannot be re-encoded faithfully.
pub fn strip_code_separators(bytes: &[u8]) -> Result<Vec<u8>, ScriptError> {
    let mut stripped = Vec::with_capacity(bytes.len());
    let mut index = 0usize;

    while index < bytes.len() {
        let opcode = bytes[index];
        let end = instruction_end(bytes, index);
        if (0x01..=0x4e).contains(&opcode) {
            // instruction_end clamps overruns; recheck the push really fits.
            let fragment = ParsedScript::parse(&bytes[index..end]);
            if fragment.has_parse_error() {
                return Err(ScriptError::BadOpcode);
            }
        }
        if opcode != all::OP_CODESEPARATOR.to_u8() {
            stripped.extend_from_slice(&bytes[index..end]);
        }
        index = end;
    }

    Ok(stripped)
}

/// Counts legacy signature operations. `accurate` uses the preceding OP_N
/// for CHECKMULTISIG key counts (BIP16 semantics); otherwise every multisig
/// costs the 20-key maximum. Counting stops at a truncated push, as the
/// reference implementation does.
pub fn count_sigops(bytes: &[u8], accurate: bool) -> u32 {
    const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

    let script = ParsedScript::parse(bytes);
    let mut total: u32 = 0;
    let mut last_op: Option<Opcode> = None;

    for op in script.ops() {
        match op {
            ParsedOpcode::Op(opcode) => {
                if *opcode == all::OP_CHECKSIG || *opcode == all::OP_CHECKSIGVERIFY {
                    total = total.saturating_add(1);
                } else if *opcode == all::OP_CHECKMULTISIG
                    || *opcode == all::OP_CHECKMULTISIGVERIFY
                {
                    let add = if accurate {
                        last_op
                            .and_then(decode_op_n)
                            .unwrap_or(MAX_PUBKEYS_PER_MULTISIG)
                    } else {
                        MAX_PUBKEYS_PER_MULTISIG
                    };
                    total = total.saturating_add(add);
                }
                last_op = Some(*opcode);
            }
            ParsedOpcode::Push(..) => {
                last_op = None;
            }
            ParsedOpcode::ParseError => break,
        }
    }

    total
}
