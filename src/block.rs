//! Non-contextual block validation.
//!
//! Everything here is checkable from the block alone: shape, sizes, sigop
//! weight, Merkle commitments and the derived weight/subsidy arithmetic.
//! Contextual rules (prev-block linkage, difficulty, median time, BIP34
//! enforcement height) belong to the chain layer.

#[cfg(not(feature = "std"))]
use alloc::{collections::BTreeSet, vec::Vec};
#[cfg(feature = "std")]
use std::collections::BTreeSet;

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Block, OutPoint, Transaction, TxMerkleNode};

use crate::num::{parse_num, MAX_COINBASE_NUM_SIZE};
use crate::opcode::{decode_op_n, ParsedOpcode};
use crate::script::{count_sigops, ParsedScript};

/// Maximum serialized base size of a block, and of its transaction count.
pub const MAX_BLOCK_SIZE: usize = 1_000_000;
/// Weight units per base-size byte.
pub const WITNESS_SCALE_FACTOR: u64 = 4;
/// Upper bound for legacy sigops scaled by [`WITNESS_SCALE_FACTOR`].
pub const MAX_SIGOPS_WEIGHT: u64 = 80_000;
/// Total money supply cap, in satoshis.
pub const MAX_MONEY: i64 = 21_000_000 * 100_000_000;
/// Blocks between subsidy halvings.
pub const HALVING_INTERVAL: u32 = 210_000;
/// The subsidy is zero from this halving onward.
const MAX_HALVINGS: u32 = 33;
const BASE_SUBSIDY: i64 = 50 * 100_000_000;

const WITNESS_COMMITMENT_MAGIC: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// Outcome channel for block checks: a rejection reason and a ban score,
/// where 100 marks a consensus-fatal block.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ValidationState {
    reason: Option<&'static str>,
    score: u32,
}

impl ValidationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.reason.is_none()
    }

    pub fn reason(&self) -> Option<&'static str> {
        self.reason
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    fn invalid(&mut self, reason: &'static str, score: u32) -> bool {
        self.reason = Some(reason);
        self.score = score;
        false
    }
}

/// Checks everything about `block` that does not require chain context.
///
/// `check_pow` delegates proof-of-work to the header against its own encoded
/// target; `check_merkle` covers the transaction Merkle commitment, including
/// the duplicate-transaction malleation rule.
pub fn check_block(
    block: &Block,
    state: &mut ValidationState,
    check_pow: bool,
    check_merkle: bool,
) -> bool {
    if check_pow
        && block
            .header
            .validate_pow(block.header.target())
            .is_err()
    {
        return state.invalid("high-hash", 50);
    }

    if block.txdata.is_empty()
        || block.txdata.len() > MAX_BLOCK_SIZE
        || block_base_size(block) > MAX_BLOCK_SIZE
    {
        return state.invalid("bad-blk-length", 100);
    }

    if !block.txdata[0].is_coinbase() {
        return state.invalid("bad-cb-missing", 100);
    }
    if block.txdata[1..].iter().any(Transaction::is_coinbase) {
        return state.invalid("bad-cb-multiple", 100);
    }

    for tx in &block.txdata {
        if !check_transaction_sanity(tx, state) {
            return false;
        }
    }

    let mut sigops: u64 = 0;
    for tx in &block.txdata {
        sigops += transaction_legacy_sigops(tx) as u64;
    }
    if sigops * WITNESS_SCALE_FACTOR > MAX_SIGOPS_WEIGHT {
        return state.invalid("bad-blk-sigops", 100);
    }

    if check_merkle {
        match block_merkle_root(block) {
            None => return state.invalid("bad-txns-duplicate", 100),
            Some(root) => {
                if TxMerkleNode::from_byte_array(root) != block.header.merkle_root {
                    return state.invalid("bad-txnmrklroot", 100);
                }
            }
        }
    }

    true
}

/// Context-free transaction checks.
pub fn check_transaction_sanity(tx: &Transaction, state: &mut ValidationState) -> bool {
    if tx.input.is_empty() {
        return state.invalid("bad-txns-vin-empty", 10);
    }
    if tx.output.is_empty() {
        return state.invalid("bad-txns-vout-empty", 10);
    }
    if tx.base_size() > MAX_BLOCK_SIZE {
        return state.invalid("bad-txns-oversize", 100);
    }

    let mut total: i64 = 0;
    for output in &tx.output {
        let value = output.value.to_sat();
        if value > MAX_MONEY as u64 {
            return state.invalid("bad-txns-vout-toolarge", 100);
        }
        total += value as i64;
        if !is_money_range(total) {
            return state.invalid("bad-txns-txouttotal-toolarge", 100);
        }
    }

    let mut seen: BTreeSet<OutPoint> = BTreeSet::new();
    for input in &tx.input {
        if !seen.insert(input.previous_output) {
            return state.invalid("bad-txns-inputs-duplicate", 100);
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.input[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return state.invalid("bad-cb-length", 100);
        }
    } else if tx.input.iter().any(|input| input.previous_output.is_null()) {
        return state.invalid("bad-txns-prevout-null", 10);
    }

    true
}

/// Legacy sigops of one transaction (all input and output scripts, inaccurate
/// multisig counting).
pub fn transaction_legacy_sigops(tx: &Transaction) -> u32 {
    let mut total: u32 = 0;
    for input in &tx.input {
        total = total.saturating_add(count_sigops(input.script_sig.as_bytes(), false));
    }
    for output in &tx.output {
        total = total.saturating_add(count_sigops(output.script_pubkey.as_bytes(), false));
    }
    total
}

/// Merkle root over `leaves`, or `None` when an adjacent duplicate pair makes
/// the tree malleable (CVE-2012-2459). The empty tree hashes to zero.
pub fn compute_merkle_root(leaves: &[[u8; 32]]) -> Option<[u8; 32]> {
    if leaves.is_empty() {
        return Some([0u8; 32]);
    }

    let mut hashes: Vec<[u8; 32]> = leaves.to_vec();
    let mut mutated = false;

    while hashes.len() > 1 {
        // Detect before the odd-duplication: an equal pair supplied by the
        // block itself is the malleation signal, the implicit duplicate of a
        // trailing leaf is not.
        let mut pos = 0;
        while pos + 1 < hashes.len() {
            if hashes[pos] == hashes[pos + 1] {
                mutated = true;
            }
            pos += 2;
        }

        if hashes.len() % 2 == 1 {
            let last = *hashes.last().expect("non-empty");
            hashes.push(last);
        }

        let mut next = Vec::with_capacity(hashes.len() / 2);
        for pair in hashes.chunks_exact(2) {
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&pair[0]);
            concat[32..].copy_from_slice(&pair[1]);
            next.push(sha256d::Hash::hash(&concat).to_byte_array());
        }
        hashes = next;
    }

    if mutated {
        None
    } else {
        Some(hashes[0])
    }
}

/// Merkle root of the block's txids.
pub fn block_merkle_root(block: &Block) -> Option<[u8; 32]> {
    let leaves: Vec<[u8; 32]> = block
        .txdata
        .iter()
        .map(|tx| tx.compute_txid().to_byte_array())
        .collect();
    compute_merkle_root(&leaves)
}

/// Merkle root of the block's wtxids, with the coinbase pinned to zero.
pub fn witness_merkle_root(block: &Block) -> Option<[u8; 32]> {
    let leaves: Vec<[u8; 32]> = block
        .txdata
        .iter()
        .enumerate()
        .map(|(index, tx)| {
            if index == 0 {
                [0u8; 32]
            } else {
                tx.compute_wtxid().to_byte_array()
            }
        })
        .collect();
    compute_merkle_root(&leaves)
}

/// Validates the BIP141 witness commitment: the last coinbase output whose
/// script starts `OP_RETURN 0x24 0xaa21a9ed` must carry
/// `hash256(witness_root || witness_nonce)`, where the nonce is the sole
/// 32-byte item of the coinbase witness. A block with no witness data needs
/// no commitment.
pub fn check_witness_commitment(block: &Block) -> bool {
    if block.txdata.is_empty() {
        return false;
    }
    let coinbase = &block.txdata[0];
    if !coinbase.is_coinbase() {
        return false;
    }

    let commitment_pos = coinbase.output.iter().rposition(|output| {
        let script = output.script_pubkey.as_bytes();
        script.len() >= 38 && script[0..6] == WITNESS_COMMITMENT_MAGIC
    });

    let Some(pos) = commitment_pos else {
        return block
            .txdata
            .iter()
            .all(|tx| tx.input.iter().all(|input| input.witness.is_empty()));
    };

    let witness = &coinbase.input[0].witness;
    if witness.len() != 1 || witness[0].len() != 32 {
        return false;
    }
    let nonce: &[u8] = &witness[0];

    let Some(root) = witness_merkle_root(block) else {
        return false;
    };

    let mut concat = [0u8; 64];
    concat[..32].copy_from_slice(&root);
    concat[32..].copy_from_slice(nonce);
    let expected = sha256d::Hash::hash(&concat).to_byte_array();

    coinbase.output[pos].script_pubkey.as_bytes()[6..38] == expected
}

/// Serialized size with witness data stripped.
pub fn block_base_size(block: &Block) -> usize {
    let mut size = 80 + compact_size_len(block.txdata.len() as u64);
    for tx in &block.txdata {
        size += tx.base_size();
    }
    size
}

/// Full serialized size.
pub fn block_total_size(block: &Block) -> usize {
    let mut size = 80 + compact_size_len(block.txdata.len() as u64);
    for tx in &block.txdata {
        size += tx.total_size();
    }
    size
}

/// `base × (scale − 1) + total`.
pub fn block_weight(block: &Block) -> u64 {
    block_base_size(block) as u64 * (WITNESS_SCALE_FACTOR - 1) + block_total_size(block) as u64
}

/// `⌈weight / scale⌉`.
pub fn block_vsize(block: &Block) -> u64 {
    (block_weight(block) + WITNESS_SCALE_FACTOR - 1) / WITNESS_SCALE_FACTOR
}

/// Miner subsidy at `height`: 50 BTC halved every [`HALVING_INTERVAL`]
/// blocks, zero from the 33rd halving (the shift has already bottomed out).
pub fn get_block_subsidy(height: u32) -> i64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= MAX_HALVINGS {
        return 0;
    }
    BASE_SUBSIDY >> halvings
}

/// Subsidy plus fees. Returns `-1` when any partial sum leaves the money
/// range, so callers cannot mistake an overflowed reward for a payable one.
pub fn block_reward(height: u32, fees: &[i64]) -> i64 {
    let mut reward = get_block_subsidy(height);
    for &fee in fees {
        if !is_money_range(fee) {
            return -1;
        }
        reward += fee;
        if !is_money_range(reward) {
            return -1;
        }
    }
    reward
}

/// BIP34: the height committed in the first instruction of the coinbase
/// script. Small heights use the bare OP_N forms; larger ones a number push
/// of up to six bytes.
pub fn coinbase_height(block: &Block) -> Option<i64> {
    let coinbase = block.txdata.first()?;
    if !coinbase.is_coinbase() {
        return None;
    }
    let script = ParsedScript::parse(coinbase.input[0].script_sig.as_bytes());
    match script.ops().first()? {
        ParsedOpcode::Op(op) => {
            if op.to_u8() == 0x00 {
                Some(0)
            } else {
                decode_op_n(*op).map(i64::from)
            }
        }
        ParsedOpcode::Push(_, data) => parse_num(data, false, MAX_COINBASE_NUM_SIZE).ok(),
        ParsedOpcode::ParseError => None,
    }
}

/// The canonical scriptSig prefix committing to `height`.
pub fn encode_coinbase_height(height: i64) -> Vec<u8> {
    let mut out = Vec::new();
    ParsedOpcode::for_push(&crate::num::encode_num(height)).write_into(&mut out);
    out
}

fn is_money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

fn compact_size_len(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
