//! Chain-state coin storage.
//!
//! A [`Coins`] entry holds every unspent output of one transaction in the
//! compact layout the chain-state database persists: a varint version, a
//! packed height/coinbase word, a bit-field of spent slots and one compressed
//! record per unspent output. Decoding is lazy: each unspent output is
//! recorded as a slice of the source buffer and only materialized when asked
//! for, so scanning a large entry for a single output stays cheap.

#[cfg(not(feature = "std"))]
use alloc::{sync::Arc, vec::Vec};
#[cfg(feature = "std")]
use std::sync::Arc;

use core::fmt;

use bitcoin::opcodes::all;
use bitcoin::{ScriptBuf, Transaction, Txid};

use crate::script::MAX_SCRIPT_SIZE;

/// Height word that marks a coin as not yet confirmed.
const UNCONFIRMED_HEIGHT_WORD: u32 = 0x7fff_ffff;

const SCRIPT_RAW: u8 = 0x00;
const SCRIPT_P2PKH: u8 = 0x01;
const SCRIPT_P2SH: u8 = 0x02;
const SCRIPT_PUBKEY: u8 = 0x03;

/// Codec failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoinsError {
    /// The buffer ended inside a record.
    UnexpectedEnd,
    /// Unknown script compression prefix.
    BadScriptPrefix(u8),
    /// A raw script claimed more than the script size limit.
    OversizedScript(usize),
    /// The requested output index is not tracked by this entry.
    IndexOutOfBounds(usize),
}

impl fmt::Display for CoinsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoinsError::UnexpectedEnd => f.write_str("coin record truncated"),
            CoinsError::BadScriptPrefix(prefix) => {
                write!(f, "unknown script compression prefix {prefix:#04x}")
            }
            CoinsError::OversizedScript(len) => write!(f, "compressed script of {len} bytes"),
            CoinsError::IndexOutOfBounds(index) => write!(f, "output index {index} out of range"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CoinsError {}

/// A single unspent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub value: u64,
    pub script: ScriptBuf,
}

/// A coin returned by the single-output fast path, with its locating context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinRecord {
    pub version: i32,
    pub txid: Txid,
    pub index: u32,
    pub height: i32,
    pub coinbase: bool,
    pub output: Coin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CoinSlot {
    Decoded(Coin),
    /// Compressed record bytes at `offset..offset + len` of the source
    /// buffer, not yet parsed.
    Deferred { offset: usize, len: usize },
}

/// The unspent outputs of one transaction.
#[derive(Debug, Clone)]
pub struct Coins {
    pub version: i32,
    pub txid: Txid,
    /// Confirmation height; `-1` while unconfirmed.
    pub height: i32,
    pub coinbase: bool,
    outputs: Vec<Option<CoinSlot>>,
    source: Option<Arc<[u8]>>,
}

impl Coins {
    /// Captures every spendable output of `tx`.
    pub fn from_tx(tx: &Transaction, height: i32) -> Self {
        let outputs = tx
            .output
            .iter()
            .map(|txout| {
                if is_unspendable(txout.script_pubkey.as_bytes()) {
                    None
                } else {
                    Some(CoinSlot::Decoded(Coin {
                        value: txout.value.to_sat(),
                        script: txout.script_pubkey.clone(),
                    }))
                }
            })
            .collect();

        Self {
            version: tx.version.0,
            txid: tx.compute_txid(),
            height,
            coinbase: tx.is_coinbase(),
            outputs,
            source: None,
        }
    }

    /// Number of tracked output slots (spent slots included).
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn is_unspent(&self, index: usize) -> bool {
        matches!(self.outputs.get(index), Some(Some(_)))
    }

    pub fn is_fully_spent(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    /// The output at `index`, decoding it on first access.
    pub fn output(&mut self, index: usize) -> Result<Option<&Coin>, CoinsError> {
        if index >= self.outputs.len() {
            return Ok(None);
        }
        self.materialize(index)?;
        Ok(match &self.outputs[index] {
            Some(CoinSlot::Decoded(coin)) => Some(coin),
            Some(CoinSlot::Deferred { .. }) => unreachable!("just materialized"),
            None => None,
        })
    }

    /// Removes and returns the output at `index`.
    pub fn spend(&mut self, index: usize) -> Result<Option<Coin>, CoinsError> {
        if index >= self.outputs.len() {
            return Ok(None);
        }
        self.materialize(index)?;
        Ok(match self.outputs[index].take() {
            Some(CoinSlot::Decoded(coin)) => Some(coin),
            _ => None,
        })
    }

    /// Decodes every deferred output.
    pub fn decode_all(&mut self) -> Result<(), CoinsError> {
        for index in 0..self.outputs.len() {
            self.materialize(index)?;
        }
        Ok(())
    }

    /// All slots as decoded coins. Call [`Coins::decode_all`] first; deferred
    /// slots read as spent here.
    pub fn decoded_outputs(&self) -> Vec<Option<&Coin>> {
        self.outputs
            .iter()
            .map(|slot| match slot {
                Some(CoinSlot::Decoded(coin)) => Some(coin),
                _ => None,
            })
            .collect()
    }

    fn materialize(&mut self, index: usize) -> Result<(), CoinsError> {
        let Some(Some(CoinSlot::Deferred { offset, len })) = self.outputs.get(index) else {
            return Ok(());
        };
        let (offset, len) = (*offset, *len);
        let source = self
            .source
            .as_ref()
            .ok_or(CoinsError::UnexpectedEnd)?
            .clone();
        let record = source.get(offset..offset + len).ok_or(CoinsError::UnexpectedEnd)?;
        let mut cursor = 0usize;
        let coin = read_output(record, &mut cursor)?;
        self.outputs[index] = Some(CoinSlot::Decoded(coin));
        Ok(())
    }

    /// Serializes the entry. A fully spent entry encodes to zero bytes; the
    /// caller deletes the database key instead of storing it.
    pub fn encode(&self) -> Vec<u8> {
        let tracked = self
            .outputs
            .iter()
            .rposition(Option::is_some)
            .map(|last| last + 1)
            .unwrap_or(0);
        if tracked == 0 {
            return Vec::new();
        }

        let mut out = Vec::new();
        write_varint(&mut out, self.version as u32 as u64);

        let height_word = if self.height < 0 {
            UNCONFIRMED_HEIGHT_WORD
        } else {
            self.height as u32
        };
        let bits = (height_word << 1) | u32::from(self.coinbase);
        out.extend_from_slice(&bits.to_le_bytes());

        let field_len = (tracked + 7) / 8;
        write_varint(&mut out, field_len as u64);
        let field_start = out.len();
        out.resize(field_start + field_len, 0);
        for index in 0..tracked {
            if self.outputs[index].is_none() {
                out[field_start + index / 8] |= 0x80 >> (index % 8);
            }
        }

        for index in 0..tracked {
            match &self.outputs[index] {
                None => {}
                Some(CoinSlot::Decoded(coin)) => {
                    write_output(&mut out, coin);
                }
                Some(CoinSlot::Deferred { offset, len }) => {
                    // Never touched since decoding; copy the record verbatim.
                    let source = self.source.as_ref().expect("deferred slot has a source");
                    out.extend_from_slice(&source[*offset..*offset + *len]);
                }
            }
        }

        out
    }

    /// Decodes an entry, deferring per-output parsing.
    pub fn decode(bytes: &[u8], txid: Txid) -> Result<Self, CoinsError> {
        let source: Arc<[u8]> = Arc::from(bytes);
        let mut cursor = 0usize;

        let version = read_varint(&source, &mut cursor)? as u32 as i32;
        let bits = read_u32(&source, &mut cursor)?;
        let coinbase = bits & 1 != 0;
        let height_word = bits >> 1;
        let height = if height_word == UNCONFIRMED_HEIGHT_WORD {
            -1
        } else {
            height_word as i32
        };

        let field_len = read_varint(&source, &mut cursor)? as usize;
        let field_end = cursor.checked_add(field_len).ok_or(CoinsError::UnexpectedEnd)?;
        if field_len == 0 || field_end > source.len() {
            return Err(CoinsError::UnexpectedEnd);
        }
        let field_start = cursor;
        cursor += field_len;

        let total_bits = field_len * 8;
        let mut outputs = Vec::with_capacity(total_bits);
        let mut bit = 0usize;
        while bit < total_bits {
            let spent = source[field_start + bit / 8] & (0x80 >> (bit % 8)) != 0;
            if !spent && cursor == source.len() {
                break;
            }
            if spent {
                outputs.push(None);
            } else {
                let offset = cursor;
                skip_output(&source, &mut cursor)?;
                outputs.push(Some(CoinSlot::Deferred {
                    offset,
                    len: cursor - offset,
                }));
            }
            bit += 1;
        }

        // Only the final field byte may carry padding, the padding must be
        // all zeroes, and nothing may follow the last output record.
        if outputs.len() <= (field_len - 1) * 8 {
            return Err(CoinsError::UnexpectedEnd);
        }
        for rest in bit..total_bits {
            if source[field_start + rest / 8] & (0x80 >> (rest % 8)) != 0 {
                return Err(CoinsError::UnexpectedEnd);
            }
        }
        if cursor != source.len() {
            return Err(CoinsError::UnexpectedEnd);
        }

        Ok(Self {
            version,
            txid,
            height,
            coinbase,
            outputs,
            source: Some(source),
        })
    }

    /// Decodes the single output `index` of a serialized entry without
    /// building the outputs vector.
    pub fn parse_output(
        bytes: &[u8],
        txid: Txid,
        index: u32,
    ) -> Result<Option<CoinRecord>, CoinsError> {
        let mut cursor = 0usize;

        let version = read_varint(bytes, &mut cursor)? as u32 as i32;
        let bits = read_u32(bytes, &mut cursor)?;
        let coinbase = bits & 1 != 0;
        let height_word = bits >> 1;
        let height = if height_word == UNCONFIRMED_HEIGHT_WORD {
            -1
        } else {
            height_word as i32
        };

        let field_len = read_varint(bytes, &mut cursor)? as usize;
        let field_end = cursor.checked_add(field_len).ok_or(CoinsError::UnexpectedEnd)?;
        if field_end > bytes.len() {
            return Err(CoinsError::UnexpectedEnd);
        }
        let field_start = cursor;
        cursor += field_len;

        let wanted = index as usize;
        if wanted >= field_len * 8 {
            return Ok(None);
        }

        for slot in 0..=wanted {
            let spent = bytes[field_start + slot / 8] & (0x80 >> (slot % 8)) != 0;
            if spent {
                if slot == wanted {
                    return Ok(None);
                }
                continue;
            }
            if cursor == bytes.len() {
                return Ok(None);
            }
            if slot == wanted {
                let output = read_output(bytes, &mut cursor)?;
                return Ok(Some(CoinRecord {
                    version,
                    txid,
                    index,
                    height,
                    coinbase,
                    output,
                }));
            }
            skip_output(bytes, &mut cursor)?;
        }

        Ok(None)
    }
}

impl PartialEq for Coins {
    /// Pointwise equality on header fields and output slots. A deferred slot
    /// never equals a decoded one; decode both sides first for a deep
    /// comparison.
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.txid == other.txid
            && self.height == other.height
            && self.coinbase == other.coinbase
            && self.outputs == other.outputs
    }
}

impl Eq for Coins {}

fn is_unspendable(script: &[u8]) -> bool {
    (!script.is_empty() && script[0] == all::OP_RETURN.to_u8()) || script.len() > MAX_SCRIPT_SIZE
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

fn read_varint(bytes: &[u8], cursor: &mut usize) -> Result<u64, CoinsError> {
    let first = *bytes.get(*cursor).ok_or(CoinsError::UnexpectedEnd)?;
    *cursor += 1;
    let width = match first {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        byte => return Ok(byte as u64),
    };
    if *cursor + width > bytes.len() {
        return Err(CoinsError::UnexpectedEnd);
    }
    let mut value: u64 = 0;
    for i in 0..width {
        value |= (bytes[*cursor + i] as u64) << (8 * i);
    }
    *cursor += width;
    Ok(value)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, CoinsError> {
    if *cursor + 4 > bytes.len() {
        return Err(CoinsError::UnexpectedEnd);
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[*cursor..*cursor + 4]);
    *cursor += 4;
    Ok(u32::from_le_bytes(word))
}

fn read_exact<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
) -> Result<&'a [u8], CoinsError> {
    if *cursor + len > bytes.len() {
        return Err(CoinsError::UnexpectedEnd);
    }
    let slice = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}

fn write_output(out: &mut Vec<u8>, coin: &Coin) {
    let script = coin.script.as_bytes();
    if let Some(hash) = p2pkh_hash(script) {
        out.push(SCRIPT_P2PKH);
        out.extend_from_slice(hash);
    } else if let Some(hash) = p2sh_hash(script) {
        out.push(SCRIPT_P2SH);
        out.extend_from_slice(hash);
    } else if let Some(pubkey) = p2pk_compressed(script) {
        out.push(SCRIPT_PUBKEY);
        out.extend_from_slice(pubkey);
    } else {
        out.push(SCRIPT_RAW);
        write_varint(out, script.len() as u64);
        out.extend_from_slice(script);
    }
    write_varint(out, coin.value);
}

fn read_output(bytes: &[u8], cursor: &mut usize) -> Result<Coin, CoinsError> {
    let prefix = *bytes.get(*cursor).ok_or(CoinsError::UnexpectedEnd)?;
    *cursor += 1;
    let script = match prefix {
        SCRIPT_RAW => {
            let len = read_varint(bytes, cursor)?;
            if len > MAX_SCRIPT_SIZE as u64 {
                return Err(CoinsError::OversizedScript(len as usize));
            }
            ScriptBuf::from_bytes(read_exact(bytes, cursor, len as usize)?.to_vec())
        }
        SCRIPT_P2PKH => build_p2pkh(read_exact(bytes, cursor, 20)?),
        SCRIPT_P2SH => build_p2sh(read_exact(bytes, cursor, 20)?),
        SCRIPT_PUBKEY => build_p2pk(read_exact(bytes, cursor, 33)?),
        other => return Err(CoinsError::BadScriptPrefix(other)),
    };
    let value = read_varint(bytes, cursor)?;
    Ok(Coin { value, script })
}

fn skip_output(bytes: &[u8], cursor: &mut usize) -> Result<(), CoinsError> {
    let prefix = *bytes.get(*cursor).ok_or(CoinsError::UnexpectedEnd)?;
    *cursor += 1;
    let script_len = match prefix {
        SCRIPT_RAW => {
            let len = read_varint(bytes, cursor)?;
            if len > MAX_SCRIPT_SIZE as u64 {
                return Err(CoinsError::OversizedScript(len as usize));
            }
            len as usize
        }
        SCRIPT_P2PKH | SCRIPT_P2SH => 20,
        SCRIPT_PUBKEY => 33,
        other => return Err(CoinsError::BadScriptPrefix(other)),
    };
    read_exact(bytes, cursor, script_len)?;
    read_varint(bytes, cursor)?;
    Ok(())
}

fn p2pkh_hash(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 25
        && script[0] == all::OP_DUP.to_u8()
        && script[1] == all::OP_HASH160.to_u8()
        && script[2] == 0x14
        && script[23] == all::OP_EQUALVERIFY.to_u8()
        && script[24] == all::OP_CHECKSIG.to_u8()
    {
        Some(&script[3..23])
    } else {
        None
    }
}

fn p2sh_hash(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 23
        && script[0] == all::OP_HASH160.to_u8()
        && script[1] == 0x14
        && script[22] == all::OP_EQUAL.to_u8()
    {
        Some(&script[2..22])
    } else {
        None
    }
}

fn p2pk_compressed(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 35
        && script[0] == 0x21
        && matches!(script[1], 0x02 | 0x03)
        && script[34] == all::OP_CHECKSIG.to_u8()
    {
        Some(&script[1..34])
    } else {
        None
    }
}

fn build_p2pkh(hash: &[u8]) -> ScriptBuf {
    let mut script = Vec::with_capacity(25);
    script.push(all::OP_DUP.to_u8());
    script.push(all::OP_HASH160.to_u8());
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(all::OP_EQUALVERIFY.to_u8());
    script.push(all::OP_CHECKSIG.to_u8());
    ScriptBuf::from_bytes(script)
}

fn build_p2sh(hash: &[u8]) -> ScriptBuf {
    let mut script = Vec::with_capacity(23);
    script.push(all::OP_HASH160.to_u8());
    script.push(0x14);
    script.extend_from_slice(hash);
    script.push(all::OP_EQUAL.to_u8());
    ScriptBuf::from_bytes(script)
}

fn build_p2pk(pubkey: &[u8]) -> ScriptBuf {
    let mut script = Vec::with_capacity(35);
    script.push(0x21);
    script.extend_from_slice(pubkey);
    script.push(all::OP_CHECKSIG.to_u8());
    ScriptBuf::from_bytes(script)
}
