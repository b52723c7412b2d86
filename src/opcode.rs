//! Parsed opcodes.
//!
//! A script decodes into a sequence of [`ParsedOpcode`]s: plain single-byte
//! operations, data pushes with their payload, or a single trailing
//! [`ParsedOpcode::ParseError`] when a push claims more bytes than the script
//! still holds.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use bitcoin::opcodes::{all, Opcode};

/// Value reported for a [`ParsedOpcode::ParseError`]; outside the range of
/// opcodes the interpreter will ever execute.
pub const PARSE_ERROR_VALUE: u8 = 0xff;

/// One decoded script instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedOpcode {
    /// A single-byte operation (including OP_0, OP_1NEGATE and OP_1..OP_16,
    /// whose pushed value is implied by the opcode itself).
    Op(Opcode),
    /// A data push carrying an explicit payload.
    Push(Opcode, Vec<u8>),
    /// A push whose declared length overruns the script.
    ParseError,
}

impl ParsedOpcode {
    /// The wire value of the opcode.
    pub fn value(&self) -> u8 {
        match self {
            ParsedOpcode::Op(op) => op.to_u8(),
            ParsedOpcode::Push(op, _) => op.to_u8(),
            ParsedOpcode::ParseError => PARSE_ERROR_VALUE,
        }
    }

    /// Explicit push payload, if any.
    pub fn push_data(&self) -> Option<&[u8]> {
        match self {
            ParsedOpcode::Push(_, data) => Some(data),
            _ => None,
        }
    }

    pub fn is_parse_error(&self) -> bool {
        matches!(self, ParsedOpcode::ParseError)
    }

    /// Minimal push of `data`, per the canonical-push rules: OP_0 for the
    /// empty vector, OP_1..OP_16 and OP_1NEGATE for their single-byte forms,
    /// then the shortest explicit encoding.
    pub fn for_push(data: &[u8]) -> ParsedOpcode {
        if data.is_empty() {
            return ParsedOpcode::Op(all::OP_PUSHBYTES_0);
        }
        if data.len() == 1 {
            let value = data[0];
            if value == 0x81 {
                return ParsedOpcode::Op(all::OP_PUSHNUM_NEG1);
            }
            if (1..=16).contains(&value) {
                let op = Opcode::from(all::OP_PUSHNUM_1.to_u8() + value - 1);
                return ParsedOpcode::Op(op);
            }
        }
        let op = if data.len() <= 0x4b {
            Opcode::from(data.len() as u8)
        } else if data.len() <= 0xff {
            all::OP_PUSHDATA1
        } else if data.len() <= 0xffff {
            all::OP_PUSHDATA2
        } else {
            all::OP_PUSHDATA4
        };
        ParsedOpcode::Push(op, data.to_vec())
    }

    /// Serializes this opcode into `out`. Returns `false` for
    /// [`ParsedOpcode::ParseError`], which has no wire form.
    pub fn write_into(&self, out: &mut Vec<u8>) -> bool {
        match self {
            ParsedOpcode::Op(op) => out.push(op.to_u8()),
            ParsedOpcode::Push(op, data) => {
                let value = op.to_u8();
                out.push(value);
                if value == all::OP_PUSHDATA1.to_u8() {
                    out.push(data.len() as u8);
                } else if value == all::OP_PUSHDATA2.to_u8() {
                    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                } else if value == all::OP_PUSHDATA4.to_u8() {
                    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                }
                out.extend_from_slice(data);
            }
            ParsedOpcode::ParseError => return false,
        }
        true
    }
}

/// Whether `data` pushed via `opcode` uses the canonical (shortest) encoding.
pub fn is_minimal_push(opcode: u8, data: &[u8]) -> bool {
    if data.is_empty() {
        return opcode == all::OP_PUSHBYTES_0.to_u8();
    }

    if data.len() == 1 {
        let value = data[0];
        if value == 0x81 {
            return opcode == all::OP_PUSHNUM_NEG1.to_u8();
        }
        if (1..=16).contains(&value) {
            return opcode == all::OP_PUSHNUM_1.to_u8() + value - 1;
        }
    }

    if data.len() <= 75 {
        return opcode as usize == data.len();
    }
    if data.len() <= 0xff {
        return opcode == all::OP_PUSHDATA1.to_u8();
    }
    if data.len() <= 0xffff {
        return opcode == all::OP_PUSHDATA2.to_u8();
    }
    opcode == all::OP_PUSHDATA4.to_u8()
}

/// Decodes OP_1..OP_16 into its small integer; `None` for anything else.
pub(crate) fn decode_op_n(opcode: Opcode) -> Option<u32> {
    let value = opcode.to_u8();
    if value >= all::OP_PUSHNUM_1.to_u8() && value <= all::OP_PUSHNUM_16.to_u8() {
        Some((value - all::OP_PUSHNUM_1.to_u8() + 1) as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_push_matches_minimality() {
        let cases: &[&[u8]] = &[
            &[],
            &[0x01],
            &[0x10],
            &[0x11],
            &[0x81],
            &[0x80],
            &[0xaa; 75],
            &[0xaa; 76],
            &[0xaa; 255],
            &[0xaa; 256],
        ];
        for data in cases {
            let op = ParsedOpcode::for_push(data);
            assert!(
                is_minimal_push(op.value(), data),
                "non-minimal choice for {} bytes",
                data.len()
            );
        }
    }

    #[test]
    fn small_int_pushes_are_bare_opcodes() {
        assert_eq!(
            ParsedOpcode::for_push(&[0x10]),
            ParsedOpcode::Op(all::OP_PUSHNUM_16)
        );
        assert_eq!(
            ParsedOpcode::for_push(&[0x81]),
            ParsedOpcode::Op(all::OP_PUSHNUM_NEG1)
        );
        // 0x11 = 17 has no small-int opcode.
        assert_eq!(ParsedOpcode::for_push(&[0x11]).value(), 0x01);
    }

    #[test]
    fn pushdata_prefixes_serialize() {
        let mut out = Vec::new();
        assert!(ParsedOpcode::for_push(&[0xaa; 76]).write_into(&mut out));
        assert_eq!(out[0], all::OP_PUSHDATA1.to_u8());
        assert_eq!(out[1], 76);
        assert_eq!(out.len(), 78);

        out.clear();
        assert!(ParsedOpcode::for_push(&[0xbb; 300]).write_into(&mut out));
        assert_eq!(out[0], all::OP_PUSHDATA2.to_u8());
        assert_eq!(&out[1..3], &300u16.to_le_bytes());
    }

    #[test]
    fn parse_error_has_no_wire_form() {
        let mut out = Vec::new();
        assert!(!ParsedOpcode::ParseError.write_into(&mut out));
        assert!(out.is_empty());
        assert_eq!(ParsedOpcode::ParseError.value(), PARSE_ERROR_VALUE);
    }

    #[test]
    fn non_minimal_forms_rejected() {
        // One byte pushed through PUSHDATA1.
        assert!(!is_minimal_push(all::OP_PUSHDATA1.to_u8(), &[0x42]));
        // 76 bytes need PUSHDATA1, not PUSHDATA2.
        assert!(!is_minimal_push(all::OP_PUSHDATA2.to_u8(), &[0x42; 76]));
        // Empty payload must be OP_0.
        assert!(!is_minimal_push(0x01, &[]));
    }
}
