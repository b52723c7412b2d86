#![cfg_attr(not(feature = "std"), no_std)]
//! Consensus-critical core of a Bitcoin full node: the script interpreter
//! with its verify driver, non-contextual block validation, and the compact
//! chain-state coin codec.
//!
//! The goal of this crate is to reproduce the reference network's validation
//! semantics bit-exactly in Rust: every opcode, push-encoding rule,
//! signature-encoding rule and flag-gated soft-fork branch of the script
//! machine; the block-level weight, sigop and Merkle rules including the
//! duplicate-transaction malleation check; and the byte layout the
//! chain-state database persists unspent outputs in.
//!
//! Script verification is exposed both through the `libbitcoinconsensus`
//! shaped entry points in this module and through the lower-level
//! [`Interpreter`]. Block checks live in [`block`], the coin codec in
//! [`coins`].

#[cfg(not(feature = "std"))]
extern crate alloc;

pub mod block;
pub mod coins;
mod interpreter;
pub mod num;
pub mod opcode;
pub mod script;
#[cfg(feature = "std")]
mod sigcache;
pub mod stack;
mod tx;

pub use interpreter::{Interpreter, ScriptError, ScriptFlags, SigVersion, SpendContext};
#[cfg(feature = "std")]
pub use sigcache::SigCache;
pub use tx::TransactionContext;

use core::fmt;

/// Do not enable any verification.
pub const VERIFY_NONE: u32 = 0;
/// Evaluate P2SH (BIP16) subscripts.
pub const VERIFY_P2SH: u32 = 1 << 0;
/// Enforce strict ECDSA encoding (BIP62).
pub const VERIFY_STRICTENC: u32 = 1 << 1;
/// Enforce strict DER (BIP66) compliance.
pub const VERIFY_DERSIG: u32 = 1 << 2;
/// Require signatures to use low-S form (BIP62).
pub const VERIFY_LOW_S: u32 = 1 << 3;
/// Enforce NULLDUMMY (BIP147).
pub const VERIFY_NULLDUMMY: u32 = 1 << 4;
/// Require scriptSig to be push only.
pub const VERIFY_SIGPUSHONLY: u32 = 1 << 5;
/// Require minimal data encodings (BIP62).
pub const VERIFY_MINIMALDATA: u32 = 1 << 6;
/// Discourage use of upgradable NOP opcodes.
pub const VERIFY_DISCOURAGE_UPGRADABLE_NOPS: u32 = 1 << 7;
/// Require a clean stack after evaluation.
pub const VERIFY_CLEANSTACK: u32 = 1 << 8;
/// Enable CHECKLOCKTIMEVERIFY (BIP65).
pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
/// Enable CHECKSEQUENCEVERIFY (BIP112).
pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
/// Enable WITNESS (BIP141).
pub const VERIFY_WITNESS: u32 = 1 << 11;
/// Discourage unknown witness program versions.
pub const VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM: u32 = 1 << 12;
/// Require minimal encodings for IF/NOTIF conditions in witness scripts.
pub const VERIFY_MINIMALIF: u32 = 1 << 13;
/// Failing signatures must be empty (BIP146).
pub const VERIFY_NULLFAIL: u32 = 1 << 14;
/// Require compressed pubkeys in segwit v0 contexts.
pub const VERIFY_WITNESS_PUBKEYTYPE: u32 = 1 << 15;
/// Enable Merkle-authenticated script trees for witness v1 programs.
pub const VERIFY_MAST: u32 = 1 << 16;

/// Aggregate of the deployed consensus soft-fork flags.
pub const VERIFY_ALL: u32 = VERIFY_P2SH
    | VERIFY_DERSIG
    | VERIFY_NULLDUMMY
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_WITNESS;

/// [`VERIFY_ALL`] plus the standardness policy flags.
pub const VERIFY_STANDARD: u32 = VERIFY_ALL
    | VERIFY_STRICTENC
    | VERIFY_LOW_S
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CLEANSTACK
    | VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM
    | VERIFY_MINIMALIF
    | VERIFY_NULLFAIL
    | VERIFY_WITNESS_PUBKEYTYPE;

/// Computes flags for soft fork activation heights on the main network.
pub fn height_to_flags(height: u32) -> u32 {
    let mut flag = VERIFY_NONE;

    if height >= 173_805 {
        flag |= VERIFY_P2SH;
    }
    if height >= 363_725 {
        flag |= VERIFY_DERSIG;
    }
    if height >= 388_381 {
        flag |= VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if height >= 419_328 {
        flag |= VERIFY_CHECKSEQUENCEVERIFY;
    }
    if height >= 481_824 {
        flag |= VERIFY_NULLDUMMY | VERIFY_WITNESS;
    }

    flag
}

/// Errors returned by the consensus verifier.
///
/// The variants mirror the identifiers exposed by `libbitcoinconsensus`.
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub enum Error {
    /// Script verification failed; the detailed APIs carry the
    /// [`ScriptError`].
    ERR_SCRIPT = 0,
    /// An invalid input index for the spending transaction.
    ERR_TX_INDEX,
    /// The declared transaction length did not match the decoded size.
    ERR_TX_SIZE_MISMATCH,
    /// An error deserializing the spending transaction.
    ERR_TX_DESERIALIZE,
    /// Input amount is required if WITNESS is used.
    ERR_AMOUNT_REQUIRED,
    /// Script verification flags are invalid.
    ERR_INVALID_FLAGS,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;

        let description = match *self {
            ERR_SCRIPT => "script failed verification",
            ERR_TX_INDEX => "an invalid input index for the spending transaction",
            ERR_TX_SIZE_MISMATCH => "transaction length mismatch",
            ERR_TX_DESERIALIZE => "an error deserializing the spending transaction",
            ERR_AMOUNT_REQUIRED => "input amount is required if WITNESS is used",
            ERR_INVALID_FLAGS => "script verification flags are invalid",
        };

        f.write_str(description)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Detailed failure information returned by the diagnostic verification APIs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScriptFailure {
    /// High-level error code.
    pub error: Error,
    /// Detailed interpreter error.
    pub script_error: ScriptError,
    /// Value of the opcode being executed when the failure applies to one.
    pub opcode: Option<u8>,
    /// Byte offset of that opcode within its script.
    pub offset: Option<usize>,
}

impl ScriptFailure {
    fn from_error(error: Error) -> Self {
        Self {
            error,
            script_error: ScriptError::Ok,
            opcode: None,
            offset: None,
        }
    }
}

/// Verifies a single spend (input) of a transaction under [`VERIFY_ALL`].
pub fn verify(
    spent_output_script: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    input_index: usize,
) -> Result<(), Error> {
    verify_with_flags(
        spent_output_script,
        amount,
        spending_transaction,
        input_index,
        VERIFY_ALL,
    )
}

/// Same as [`verify`] but also reports the interpreter's [`ScriptError`].
pub fn verify_with_details(
    spent_output_script: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    input_index: usize,
) -> Result<(), ScriptFailure> {
    perform_verification(
        spent_output_script,
        amount,
        spending_transaction,
        input_index,
        VERIFY_ALL,
    )
}

/// Same as [`verify`] but with explicit script verification flags.
pub fn verify_with_flags(
    spent_output_script: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
) -> Result<(), Error> {
    perform_verification(
        spent_output_script,
        amount,
        spending_transaction,
        input_index,
        flags,
    )
    .map_err(|failure| failure.error)
}

/// Same as [`verify_with_flags`] but also reports the interpreter's
/// [`ScriptError`] together with the failing opcode and offset.
pub fn verify_with_flags_detailed(
    spent_output_script: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
) -> Result<(), ScriptFailure> {
    perform_verification(
        spent_output_script,
        amount,
        spending_transaction,
        input_index,
        flags,
    )
}

/// Same as [`verify_with_flags_detailed`], probing and feeding `sig_cache`.
#[cfg(feature = "std")]
pub fn verify_with_flags_cached(
    spent_output_script: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
    sig_cache: &SigCache,
) -> Result<(), ScriptFailure> {
    let (tx_ctx, flags) = prepare(spending_transaction, input_index, flags)?;
    let spend = SpendContext::new(spent_output_script, amount, true);
    let mut interpreter = Interpreter::new(&tx_ctx, input_index, spend, flags)
        .map_err(ScriptFailure::from_error)?;
    interpreter.set_sig_cache(sig_cache);
    run_interpreter(&mut interpreter)
}

fn perform_verification(
    spent_output_script: &[u8],
    amount: u64,
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
) -> Result<(), ScriptFailure> {
    let (tx_ctx, flags) = prepare(spending_transaction, input_index, flags)?;
    let spend = SpendContext::new(spent_output_script, amount, true);
    let mut interpreter = Interpreter::new(&tx_ctx, input_index, spend, flags)
        .map_err(ScriptFailure::from_error)?;
    run_interpreter(&mut interpreter)
}

fn prepare(
    spending_transaction: &[u8],
    input_index: usize,
    flags: u32,
) -> Result<(TransactionContext, ScriptFlags), ScriptFailure> {
    let tx_ctx =
        TransactionContext::parse(spending_transaction).map_err(ScriptFailure::from_error)?;
    tx_ctx
        .ensure_input_index(input_index)
        .map_err(ScriptFailure::from_error)?;
    let flags = ScriptFlags::from_bits(flags).map_err(ScriptFailure::from_error)?;
    Ok((tx_ctx, flags))
}

fn run_interpreter(interpreter: &mut Interpreter) -> Result<(), ScriptFailure> {
    interpreter.verify().map_err(|error| ScriptFailure {
        error,
        script_error: interpreter.last_script_error(),
        opcode: interpreter.failure_opcode(),
        offset: interpreter.failure_offset(),
    })
}
