//! Script interpreter.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};
#[cfg(all(feature = "std", not(feature = "external-secp")))]
use std::sync::OnceLock;
#[cfg(feature = "std")]
use std::vec::Vec;

use core::{cell::RefCell, mem};

use bitcoin::{
    absolute::LOCK_TIME_THRESHOLD,
    blockdata::script::{Script, ScriptBuf},
    blockdata::transaction::Sequence,
    hashes::{hash160, ripemd160, sha1, sha256, sha256d, Hash},
    opcodes::{all, Opcode},
    secp256k1::{self, ecdsa::Signature as EcdsaSignature, Message, PublicKey, Secp256k1},
    sighash::{EcdsaSighashType, SegwitV0Sighash, SighashCache},
    Transaction, Witness,
};

use crate::num::{
    encode_num, parse_num, MAX_NUM_SIZE, MAX_NUM_SIZE_EXTENDED,
};
use crate::opcode::is_minimal_push;
use crate::script::{
    find_and_delete, is_canonical_single_push, is_p2sh, is_push_only, single_push_script,
    strip_code_separators, witness_program, MAX_SCRIPT_SIZE,
};
#[cfg(feature = "std")]
use crate::sigcache::SigCache;
use crate::stack::{ScriptStack, MAX_SCRIPT_ELEMENT_SIZE, MAX_STACK_SIZE};
use crate::tx::TransactionContext;
use crate::{
    Error, VERIFY_CHECKLOCKTIMEVERIFY, VERIFY_CHECKSEQUENCEVERIFY, VERIFY_CLEANSTACK,
    VERIFY_DERSIG, VERIFY_DISCOURAGE_UPGRADABLE_NOPS,
    VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM, VERIFY_LOW_S, VERIFY_MAST, VERIFY_MINIMALDATA,
    VERIFY_MINIMALIF, VERIFY_NULLDUMMY, VERIFY_NULLFAIL, VERIFY_P2SH, VERIFY_SIGPUSHONLY,
    VERIFY_STRICTENC, VERIFY_WITNESS, VERIFY_WITNESS_PUBKEYTYPE,
};

/// Fine-grained script failure, mirroring the reference `ScriptError_t`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScriptError {
    Ok,
    Unknown,
    EvalFalse,
    OpReturn,
    ScriptSize,
    PushSize,
    OpCount,
    StackSize,
    SigCount,
    PubkeyCount,
    Verify,
    EqualVerify,
    CheckSigVerify,
    CheckMultiSigVerify,
    NumEqualVerify,
    BadOpcode,
    DisabledOpcode,
    InvalidStackOperation,
    InvalidAltstackOperation,
    UnbalancedConditional,
    NegativeLockTime,
    UnsatisfiedLockTime,
    SigHashType,
    SigDer,
    MinimalData,
    SigPushOnly,
    SigHighS,
    SigNullDummy,
    PubkeyType,
    CleanStack,
    MinimalIf,
    NullFail,
    DiscourageUpgradableNops,
    DiscourageUpgradableWitnessProgram,
    WitnessProgramWrongLength,
    WitnessProgramWitnessEmpty,
    WitnessProgramMismatch,
    WitnessMalleated,
    WitnessMalleatedP2SH,
    WitnessUnexpected,
    WitnessPubkeyType,
}

const SUPPORTED_FLAGS: u32 = VERIFY_P2SH
    | VERIFY_STRICTENC
    | VERIFY_DERSIG
    | VERIFY_LOW_S
    | VERIFY_NULLDUMMY
    | VERIFY_SIGPUSHONLY
    | VERIFY_MINIMALDATA
    | VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | VERIFY_CLEANSTACK
    | VERIFY_CHECKLOCKTIMEVERIFY
    | VERIFY_CHECKSEQUENCEVERIFY
    | VERIFY_WITNESS
    | VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM
    | VERIFY_MINIMALIF
    | VERIFY_NULLFAIL
    | VERIFY_WITNESS_PUBKEYTYPE
    | VERIFY_MAST;

const MAX_OPS_PER_SCRIPT: usize = 201;
const MAX_PUBKEYS_PER_MULTISIG: usize = 20;
const MAX_MAST_PATH_DEPTH: usize = 32;
const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000ffff;
const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

#[cfg(all(feature = "external-secp", feature = "std"))]
type VerificationContext = Secp256k1<secp256k1::All>;
#[cfg(not(all(feature = "external-secp", feature = "std")))]
type VerificationContext = Secp256k1<secp256k1::VerifyOnly>;

#[cfg(all(feature = "std", not(feature = "external-secp")))]
static SECP256K1: OnceLock<VerificationContext> = OnceLock::new();

fn with_secp256k1_verification_ctx<R>(f: impl FnOnce(&VerificationContext) -> R) -> R {
    #[cfg(all(feature = "std", feature = "external-secp"))]
    {
        // `bitcoin::secp256k1` re-exports the `global` module when the
        // upstream `secp256k1` crate is built with the `global-context`
        // feature, so we can piggyback on that singleton instead of creating
        // ad-hoc contexts.
        f(&*bitcoin::secp256k1::global::SECP256K1)
    }
    #[cfg(all(feature = "std", not(feature = "external-secp")))]
    {
        f(SECP256K1.get_or_init(Secp256k1::verification_only))
    }
    #[cfg(not(feature = "std"))]
    {
        let ctx = Secp256k1::verification_only();
        f(&ctx)
    }
}

/// Wrapper for script verification flags.
#[derive(Debug, Clone, Copy)]
pub struct ScriptFlags(u32);

impl ScriptFlags {
    pub fn from_bits(bits: u32) -> Result<Self, Error> {
        if bits & !SUPPORTED_FLAGS != 0 {
            return Err(Error::ERR_INVALID_FLAGS);
        }
        Ok(Self(Self::apply_implied_bits(bits)))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    fn apply_implied_bits(mut bits: u32) -> u32 {
        if bits & VERIFY_MAST != 0 {
            bits |= VERIFY_WITNESS;
        }
        if bits & VERIFY_WITNESS != 0 {
            bits |= VERIFY_P2SH;
        }
        bits
    }
}

/// Signature-hashing scheme selector: 0 for legacy, 1 for BIP143 witness v0.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SigVersion {
    Base,
    WitnessV0,
}

#[derive(Clone, Copy)]
struct SignatureParts {
    signature: EcdsaSignature,
    sighash_type: u32,
}

#[derive(Default)]
struct ScriptCodeCache {
    identity: ScriptIdentity,
    code_separator: usize,
    script: ScriptBuf,
}

#[derive(Copy, Clone, Default, PartialEq, Eq)]
struct ScriptIdentity {
    ptr: *const u8,
    len: usize,
}

impl ScriptIdentity {
    fn new(script: &Script) -> Self {
        Self {
            ptr: script.as_bytes().as_ptr(),
            len: script.as_bytes().len(),
        }
    }
}

impl ScriptCodeCache {
    fn matches(&self, identity: ScriptIdentity, code_separator: usize) -> bool {
        self.identity == identity && self.code_separator == code_separator
    }
}

/// Input-specific data required to run the interpreter.
pub struct SpendContext<'script> {
    pub script_pubkey: &'script [u8],
    pub amount: u64,
    pub has_amount: bool,
}

impl<'script> SpendContext<'script> {
    pub fn new(script_pubkey: &'script [u8], amount: u64, has_amount: bool) -> Self {
        Self {
            script_pubkey,
            amount,
            has_amount,
        }
    }
}

/// High-level script verification context.
pub struct Interpreter<'tx, 'script> {
    flags: ScriptFlags,
    amount: u64,
    has_amount: bool,
    spent_output_script: &'script [u8],
    tx_ctx: &'tx TransactionContext,
    input_index: usize,
    script_code_cache: Option<ScriptCodeCache>,
    sighash_cache: RefCell<SighashCache<&'tx Transaction>>,
    #[cfg(feature = "std")]
    sig_cache: Option<&'tx SigCache>,
    stack: ScriptStack,
    exec_stack: Vec<bool>,
    last_error: ScriptError,
    cur_opcode: Option<u8>,
    cur_offset: Option<usize>,
    fail_opcode: Option<u8>,
    fail_offset: Option<usize>,
    op_count: usize,
    had_witness: bool,
}

impl<'tx, 'script> Interpreter<'tx, 'script> {
    pub fn new(
        tx_ctx: &'tx TransactionContext,
        input_index: usize,
        spend: SpendContext<'script>,
        flags: ScriptFlags,
    ) -> Result<Self, Error> {
        tx_ctx.ensure_input_index(input_index)?;

        let SpendContext {
            script_pubkey,
            amount,
            has_amount,
        } = spend;

        Ok(Self {
            flags,
            amount,
            has_amount,
            spent_output_script: script_pubkey,
            tx_ctx,
            input_index,
            script_code_cache: None,
            sighash_cache: RefCell::new(SighashCache::new(tx_ctx.tx())),
            #[cfg(feature = "std")]
            sig_cache: None,
            stack: ScriptStack::new(),
            exec_stack: Vec::new(),
            last_error: ScriptError::Ok,
            cur_opcode: None,
            cur_offset: None,
            fail_opcode: None,
            fail_offset: None,
            op_count: 0,
            had_witness: false,
        })
    }

    /// Probes `cache` before ECDSA verification and records successes in it.
    #[cfg(feature = "std")]
    pub fn set_sig_cache(&mut self, cache: &'tx SigCache) {
        self.sig_cache = Some(cache);
    }

    pub fn verify(&mut self) -> Result<(), Error> {
        self.last_error = ScriptError::Ok;
        self.had_witness = false;
        self.cur_opcode = None;
        self.cur_offset = None;
        self.fail_opcode = None;
        self.fail_offset = None;

        let txin = &self.tx_ctx.tx().input[self.input_index];
        let witness_enabled = self.flags.bits() & VERIFY_WITNESS != 0;
        let p2sh_enabled = self.flags.bits() & VERIFY_P2SH != 0;
        let spent_is_p2sh = is_p2sh(self.spent_output_script);
        if witness_enabled
            && spent_is_p2sh
            && !txin.witness.is_empty()
            && !is_canonical_single_push(txin.script_sig.as_bytes())
        {
            return Err(self.fail(ScriptError::WitnessMalleatedP2SH));
        }
        if self.flags.bits() & VERIFY_SIGPUSHONLY != 0 && !is_push_only(txin.script_sig.as_bytes())
        {
            return Err(self.fail(ScriptError::SigPushOnly));
        }
        if witness_enabled && !txin.witness.is_empty() && !self.has_amount {
            return Err(Error::ERR_AMOUNT_REQUIRED);
        }

        let sig_script_res = self.run_on_main_stack(txin.script_sig.as_bytes(), SigVersion::Base);
        self.track_script_error(sig_script_res)?;
        let mut p2sh_stack = if p2sh_enabled && spent_is_p2sh {
            Some(self.stack.clone())
        } else {
            None
        };
        let spent_script_res = self.run_on_main_stack(self.spent_output_script, SigVersion::Base);
        self.track_script_error(spent_script_res)?;
        if witness_enabled {
            if let Some((version, program)) = witness_program(self.spent_output_script) {
                self.had_witness = true;
                if !txin.script_sig.is_empty() {
                    return Err(self.fail(ScriptError::WitnessMalleated));
                }
                let witness_res = self.execute_witness_program(version, program, &txin.witness);
                self.track_script_error(witness_res)?;
                let mut stack = ScriptStack::new();
                self.push_bool_element(&mut stack, true)?;
                self.stack = stack;
            }
        }

        if p2sh_enabled && spent_is_p2sh {
            if !is_push_only(txin.script_sig.as_bytes()) {
                return Err(self.fail(ScriptError::SigPushOnly));
            }

            let mut stack_copy = p2sh_stack
                .take()
                .expect("P2SH spend requires preserved stack state");
            if stack_copy.is_empty() {
                return Err(self.fail(ScriptError::EvalFalse));
            }

            let redeem_script = stack_copy.pop().ok_or(Error::ERR_SCRIPT)?;
            self.run_script(&mut stack_copy, &redeem_script, SigVersion::Base)?;
            if stack_copy.is_empty() || !cast_to_bool(stack_copy.last().unwrap()) {
                return Err(self.fail(ScriptError::EvalFalse));
            }

            if witness_enabled {
                if let Some((version, program)) = witness_program(&redeem_script) {
                    self.had_witness = true;
                    let expected = single_push_script(&redeem_script);
                    if txin.script_sig.as_bytes() != expected.as_slice() {
                        return Err(self.fail(ScriptError::WitnessMalleatedP2SH));
                    }
                    let witness_res = self.execute_witness_program(version, program, &txin.witness);
                    self.track_script_error(witness_res)?;
                    stack_copy = ScriptStack::new();
                    self.push_element(&mut stack_copy, vec![1])?;
                }
            }

            self.stack = stack_copy;
        }

        if self.stack.is_empty() || !cast_to_bool(self.stack.last().unwrap()) {
            return Err(self.fail(ScriptError::EvalFalse));
        }

        if witness_enabled && !self.had_witness && !txin.witness.is_empty() {
            return Err(self.fail(ScriptError::WitnessUnexpected));
        }

        if self.flags.bits() & VERIFY_CLEANSTACK != 0 {
            self.require_clean_stack(&self.stack)
                .map_err(|err| self.fail(err))
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn last_script_error(&self) -> ScriptError {
        self.last_error
    }

    /// Opcode value at the point of failure, when one applies.
    #[inline]
    pub fn failure_opcode(&self) -> Option<u8> {
        self.fail_opcode
    }

    /// Byte offset of the failing instruction, when one applies.
    #[inline]
    pub fn failure_offset(&self) -> Option<usize> {
        self.fail_offset
    }

    fn fail(&mut self, error: ScriptError) -> Error {
        self.last_error = error;
        self.fail_opcode = self.cur_opcode;
        self.fail_offset = self.cur_offset;
        Error::ERR_SCRIPT
    }

    fn map_failure<T, E>(&mut self, result: Result<T, E>, error: ScriptError) -> Result<T, Error> {
        result.map_err(|_| self.fail(error))
    }

    fn pop_or(&mut self, stack: &mut ScriptStack, error: ScriptError) -> Result<Vec<u8>, Error> {
        let value = stack.pop();
        self.map_failure(value.ok_or(()), error)
    }

    fn track_script_error<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        match result {
            Err(err) if err == Error::ERR_SCRIPT => {
                if matches!(self.last_error, ScriptError::Ok) {
                    self.last_error = ScriptError::Unknown;
                }
                Err(err)
            }
            other => other,
        }
    }

    fn push_element(&mut self, stack: &mut ScriptStack, data: Vec<u8>) -> Result<(), Error> {
        stack.push(data).map_err(|err| self.fail(err))
    }

    fn push_bool_element(&mut self, stack: &mut ScriptStack, value: bool) -> Result<(), Error> {
        stack.push_bool(value).map_err(|err| self.fail(err))
    }

    fn add_ops(&mut self, count: usize) -> Result<(), Error> {
        self.op_count += count;
        if self.op_count > MAX_OPS_PER_SCRIPT {
            Err(self.fail(ScriptError::OpCount))
        } else {
            Ok(())
        }
    }

    fn run_script(
        &mut self,
        stack: &mut ScriptStack,
        script_bytes: &[u8],
        sigversion: SigVersion,
    ) -> Result<(), Error> {
        if script_bytes.is_empty() {
            return Ok(());
        }
        if script_bytes.len() > MAX_SCRIPT_SIZE {
            return Err(self.fail(ScriptError::ScriptSize));
        }

        self.exec_stack.clear();
        self.op_count = 0;
        let script = ScriptBuf::from_bytes(script_bytes.to_vec());
        let bytes = script.as_bytes();
        let mut altstack: Vec<Vec<u8>> = Vec::new();
        let mut code_separator = 0usize;
        let mut cursor = 0usize;
        let script_len = bytes.len();

        while cursor < script_len {
            let position = cursor;
            let opcode = bytes[cursor];
            cursor += 1;
            self.cur_opcode = Some(opcode);
            self.cur_offset = Some(position);
            let should_execute = self.exec_stack.iter().all(|&cond| cond);

            if (0x01..=0x4b).contains(&opcode) {
                let push_len = opcode as usize;
                if cursor + push_len > script_len {
                    return Err(self.fail(ScriptError::BadOpcode));
                }
                if push_len > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(self.fail(ScriptError::PushSize));
                }
                if should_execute {
                    if self.flags.bits() & VERIFY_MINIMALDATA != 0
                        && !is_minimal_push(opcode, &bytes[cursor..cursor + push_len])
                    {
                        return Err(self.fail(ScriptError::MinimalData));
                    }
                    self.push_element(stack, bytes[cursor..cursor + push_len].to_vec())?;
                }
                cursor += push_len;
            } else if opcode == all::OP_PUSHDATA1.to_u8()
                || opcode == all::OP_PUSHDATA2.to_u8()
                || opcode == all::OP_PUSHDATA4.to_u8()
            {
                let width = match opcode {
                    x if x == all::OP_PUSHDATA1.to_u8() => 1,
                    x if x == all::OP_PUSHDATA2.to_u8() => 2,
                    _ => 4,
                };
                let mut len_cursor = cursor;
                let push_len = crate::script::read_push_length(bytes, &mut len_cursor, width)
                    .map_err(|err| self.fail(err))?;
                if push_len > MAX_SCRIPT_ELEMENT_SIZE {
                    return Err(self.fail(ScriptError::PushSize));
                }
                if len_cursor + push_len > script_len {
                    return Err(self.fail(ScriptError::BadOpcode));
                }
                if should_execute {
                    if self.flags.bits() & VERIFY_MINIMALDATA != 0
                        && !is_minimal_push(opcode, &bytes[len_cursor..len_cursor + push_len])
                    {
                        return Err(self.fail(ScriptError::MinimalData));
                    }
                    self.push_element(stack, bytes[len_cursor..len_cursor + push_len].to_vec())?;
                }
                cursor = len_cursor + push_len;
            } else {
                let op = Opcode::from(opcode);

                if matches!(op, all::OP_VERIF | all::OP_VERNOTIF) {
                    return Err(self.fail(ScriptError::BadOpcode));
                }
                if is_disabled(op) {
                    // Disabled opcodes poison the script even on dead branches.
                    return Err(self.fail(ScriptError::DisabledOpcode));
                }
                if opcode > all::OP_PUSHNUM_16.to_u8() {
                    self.add_ops(1)?;
                }

                if is_control_flow(op) {
                    let control_res =
                        self.handle_control_flow(stack, op, should_execute, sigversion);
                    self.track_script_error(control_res)?;
                } else if should_execute {
                    if op == all::OP_CODESEPARATOR {
                        code_separator = cursor;
                    } else {
                        let opcode_res = self.execute_opcode(
                            stack,
                            &mut altstack,
                            op,
                            &script,
                            code_separator,
                            sigversion,
                        );
                        self.track_script_error(opcode_res)?;
                    }
                }
            }

            let limit_res = self.ensure_stack_limit(stack.len(), altstack.len());
            self.track_script_error(limit_res)?;
        }

        self.cur_opcode = None;
        self.cur_offset = None;

        if !self.exec_stack.is_empty() {
            return Err(self.fail(ScriptError::UnbalancedConditional));
        }

        Ok(())
    }

    fn run_on_main_stack(
        &mut self,
        script_bytes: &[u8],
        sigversion: SigVersion,
    ) -> Result<(), Error> {
        let mut stack = mem::take(&mut self.stack);
        let run_res = self.run_script(&mut stack, script_bytes, sigversion);
        let result = self.track_script_error(run_res);
        self.stack = stack;
        result
    }

    fn execute_opcode(
        &mut self,
        stack: &mut ScriptStack,
        altstack: &mut Vec<Vec<u8>>,
        op: Opcode,
        script: &Script,
        code_separator: usize,
        sigversion: SigVersion,
    ) -> Result<(), Error> {
        use all::*;

        let opcode = op.to_u8();
        let require_minimal = self.flags.bits() & VERIFY_MINIMALDATA != 0;

        if matches!(
            op,
            OP_RESERVED | OP_RESERVED1 | OP_RESERVED2 | OP_VER | OP_INVALIDOPCODE
        ) {
            return Err(self.fail(ScriptError::BadOpcode));
        }

        if opcode == OP_PUSHBYTES_0.to_u8() {
            return self.push_element(stack, Vec::new());
        }
        if opcode >= OP_PUSHNUM_1.to_u8() && opcode <= OP_PUSHNUM_16.to_u8() {
            let value = (opcode - OP_PUSHNUM_1.to_u8() + 1) as i64;
            return self.push_element(stack, encode_num(value));
        }

        match op {
            OP_TOALTSTACK => {
                let value = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
                altstack.push(value);
            }
            OP_FROMALTSTACK => {
                let value = altstack
                    .pop()
                    .ok_or_else(|| self.fail(ScriptError::InvalidAltstackOperation))?;
                self.push_element(stack, value)?;
            }
            OP_IFDUP => {
                let value = stack
                    .last()
                    .ok_or_else(|| self.fail(ScriptError::InvalidStackOperation))?
                    .clone();
                if cast_to_bool(&value) {
                    self.push_element(stack, value)?;
                }
            }
            OP_DEPTH => {
                let depth = encode_num(stack.len() as i64);
                self.push_element(stack, depth)?;
            }
            OP_PUSHNUM_NEG1 => {
                self.push_element(stack, encode_num(-1))?;
            }
            OP_NOP => {}
            OP_NOP1 | OP_NOP4 | OP_NOP5 | OP_NOP6 | OP_NOP7 | OP_NOP8 | OP_NOP9 | OP_NOP10 => {
                if self.flags.bits() & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                    return Err(self.fail(ScriptError::DiscourageUpgradableNops));
                }
            }
            OP_DUP => {
                let value = stack
                    .last()
                    .ok_or_else(|| self.fail(ScriptError::InvalidStackOperation))?
                    .clone();
                self.push_element(stack, value)?;
            }
            OP_DROP => {
                self.pop_or(stack, ScriptError::InvalidStackOperation)?;
            }
            OP_NIP => {
                if !stack.erase(-2, -1) {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
            }
            OP_OVER => {
                let value = stack
                    .top(-2)
                    .ok_or_else(|| self.fail(ScriptError::InvalidStackOperation))?
                    .clone();
                self.push_element(stack, value)?;
            }
            OP_ROT => {
                if stack.len() < 3 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                stack.swap(-3, -2);
                stack.swap(-2, -1);
            }
            OP_SWAP => {
                if stack.len() < 2 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                stack.swap(-2, -1);
            }
            OP_TUCK => {
                if stack.len() < 2 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                let value = stack.top(-1).expect("length checked").clone();
                stack.insert(-2, value);
            }
            OP_2DROP => {
                if stack.len() < 2 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                stack.pop();
                stack.pop();
            }
            OP_2DUP => {
                if stack.len() < 2 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                let first = stack.top(-2).expect("length checked").clone();
                let second = stack.top(-1).expect("length checked").clone();
                self.push_element(stack, first)?;
                self.push_element(stack, second)?;
            }
            OP_PICK => {
                let depth = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
                if depth < 0 || depth as usize >= stack.len() {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                let value = stack
                    .top(-1 - depth as isize)
                    .expect("depth checked")
                    .clone();
                self.push_element(stack, value)?;
            }
            OP_ROLL => {
                let depth = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
                if depth < 0 || depth as usize >= stack.len() {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                let index = stack.len() - 1 - depth as usize;
                let value = stack.items.remove(index);
                self.push_element(stack, value)?;
            }
            OP_3DUP => {
                if stack.len() < 3 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                let first = stack.top(-3).expect("length checked").clone();
                let second = stack.top(-2).expect("length checked").clone();
                let third = stack.top(-1).expect("length checked").clone();
                self.push_element(stack, first)?;
                self.push_element(stack, second)?;
                self.push_element(stack, third)?;
            }
            OP_2OVER => {
                if stack.len() < 4 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                let first = stack.top(-4).expect("length checked").clone();
                let second = stack.top(-3).expect("length checked").clone();
                self.push_element(stack, first)?;
                self.push_element(stack, second)?;
            }
            OP_2ROT => {
                if stack.len() < 6 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                let first = stack.top(-6).expect("length checked").clone();
                let second = stack.top(-5).expect("length checked").clone();
                stack.erase(-6, -4);
                self.push_element(stack, first)?;
                self.push_element(stack, second)?;
            }
            OP_2SWAP => {
                if stack.len() < 4 {
                    return Err(self.fail(ScriptError::InvalidStackOperation));
                }
                stack.swap(-4, -2);
                stack.swap(-3, -1);
            }
            OP_SIZE => {
                let value = stack
                    .last()
                    .ok_or_else(|| self.fail(ScriptError::InvalidStackOperation))?;
                let size = encode_num(value.len() as i64);
                self.push_element(stack, size)?;
            }
            OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                let mut num = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
                match op {
                    OP_1ADD => num += 1,
                    OP_1SUB => num -= 1,
                    OP_NEGATE => num = -num,
                    OP_ABS => {
                        if num < 0 {
                            num = -num;
                        }
                    }
                    OP_NOT => num = if num == 0 { 1 } else { 0 },
                    OP_0NOTEQUAL => num = if num != 0 { 1 } else { 0 },
                    _ => {}
                }
                let encoded = encode_num(num);
                self.push_element(stack, encoded)?;
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
                let b = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
                let a = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
                let result = match op {
                    OP_ADD => a.checked_add(b).ok_or(Error::ERR_SCRIPT)?,
                    OP_SUB => a.checked_sub(b).ok_or(Error::ERR_SCRIPT)?,
                    OP_BOOLAND => i64::from(a != 0 && b != 0),
                    OP_BOOLOR => i64::from(a != 0 || b != 0),
                    OP_NUMEQUAL | OP_NUMEQUALVERIFY => i64::from(a == b),
                    OP_NUMNOTEQUAL => i64::from(a != b),
                    OP_LESSTHAN => i64::from(a < b),
                    OP_GREATERTHAN => i64::from(a > b),
                    OP_LESSTHANOREQUAL => i64::from(a <= b),
                    OP_GREATERTHANOREQUAL => i64::from(a >= b),
                    OP_MIN => a.min(b),
                    OP_MAX => a.max(b),
                    _ => 0,
                };
                self.push_element(stack, encode_num(result))?;
                if op == OP_NUMEQUALVERIFY {
                    self.op_verify_with_code(stack, ScriptError::NumEqualVerify)?;
                }
            }
            OP_WITHIN => {
                let max = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
                let min = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
                let value = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
                self.push_bool_element(stack, value >= min && value < max)?;
            }
            OP_CLTV => {
                if self.flags.bits() & VERIFY_CHECKLOCKTIMEVERIFY == 0 {
                    // Still NOP2 without the flag.
                    if self.flags.bits() & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                        return Err(self.fail(ScriptError::DiscourageUpgradableNops));
                    }
                } else {
                    let locktime =
                        self.peek_scriptnum(stack, require_minimal, MAX_NUM_SIZE_EXTENDED)?;
                    if locktime < 0 {
                        return Err(self.fail(ScriptError::NegativeLockTime));
                    }
                    if let Err(err) = self.check_lock_time(locktime as u64) {
                        return Err(self.fail(err));
                    }
                }
            }
            OP_CSV => {
                if self.flags.bits() & VERIFY_CHECKSEQUENCEVERIFY == 0 {
                    // Still NOP3 without the flag.
                    if self.flags.bits() & VERIFY_DISCOURAGE_UPGRADABLE_NOPS != 0 {
                        return Err(self.fail(ScriptError::DiscourageUpgradableNops));
                    }
                } else {
                    let sequence =
                        self.peek_scriptnum(stack, require_minimal, MAX_NUM_SIZE_EXTENDED)?;
                    if sequence < 0 {
                        return Err(self.fail(ScriptError::NegativeLockTime));
                    }
                    if let Err(err) = self.check_sequence(sequence as u64) {
                        return Err(self.fail(err));
                    }
                }
            }
            OP_RIPEMD160 => self.op_ripemd160(stack)?,
            OP_SHA1 => self.op_sha1(stack)?,
            OP_SHA256 => self.op_sha256(stack)?,
            OP_HASH160 => self.op_hash160(stack)?,
            OP_HASH256 => self.op_hash256(stack)?,
            OP_EQUAL => self.op_equal(stack)?,
            OP_EQUALVERIFY => {
                self.op_equal(stack)?;
                self.op_verify_with_code(stack, ScriptError::EqualVerify)?;
            }
            OP_VERIFY => self.op_verify(stack)?,
            OP_RETURN => return Err(self.fail(ScriptError::OpReturn)),
            OP_CHECKSIG => self.op_checksig(stack, script, code_separator, sigversion)?,
            OP_CHECKSIGVERIFY => {
                self.op_checksig(stack, script, code_separator, sigversion)?;
                self.op_verify_with_code(stack, ScriptError::CheckSigVerify)?;
            }
            OP_CHECKMULTISIG => {
                self.op_checkmultisig(stack, script, code_separator, sigversion)?;
            }
            OP_CHECKMULTISIGVERIFY => {
                self.op_checkmultisig(stack, script, code_separator, sigversion)?;
                self.op_verify_with_code(stack, ScriptError::CheckMultiSigVerify)?;
            }
            _ => return Err(self.fail(ScriptError::BadOpcode)),
        }

        Ok(())
    }

    fn handle_control_flow(
        &mut self,
        stack: &mut ScriptStack,
        op: Opcode,
        should_execute: bool,
        sigversion: SigVersion,
    ) -> Result<(), Error> {
        use all::*;

        match op {
            OP_IF | OP_NOTIF => {
                let mut value = false;
                if should_execute {
                    let condition = self.pop_or(stack, ScriptError::UnbalancedConditional)?;
                    let enforce_minimal_if = sigversion == SigVersion::WitnessV0
                        && self.flags.bits() & VERIFY_MINIMALIF != 0;
                    if enforce_minimal_if
                        && !condition.is_empty()
                        && !is_minimal_if_condition(&condition)
                    {
                        return Err(self.fail(ScriptError::MinimalIf));
                    }
                    value = cast_to_bool(&condition);
                    if op == OP_NOTIF {
                        value = !value;
                    }
                }
                self.exec_stack.push(value);
            }
            OP_ELSE => {
                let Some(top) = self.exec_stack.last_mut() else {
                    return Err(self.fail(ScriptError::UnbalancedConditional));
                };
                *top = !*top;
            }
            OP_ENDIF => {
                if self.exec_stack.pop().is_none() {
                    return Err(self.fail(ScriptError::UnbalancedConditional));
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn ensure_stack_limit(&mut self, stack_size: usize, altstack_size: usize) -> Result<(), Error> {
        if stack_size + altstack_size > MAX_STACK_SIZE {
            Err(self.fail(ScriptError::StackSize))
        } else {
            Ok(())
        }
    }

    fn op_hash160(&mut self, stack: &mut ScriptStack) -> Result<(), Error> {
        let data = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        let hash = hash160::Hash::hash(&data);
        self.push_element(stack, hash.to_byte_array().to_vec())
    }

    fn op_ripemd160(&mut self, stack: &mut ScriptStack) -> Result<(), Error> {
        let data = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        let hash = ripemd160::Hash::hash(&data);
        self.push_element(stack, hash.to_byte_array().to_vec())
    }

    fn op_sha1(&mut self, stack: &mut ScriptStack) -> Result<(), Error> {
        let data = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        let hash = sha1::Hash::hash(&data);
        self.push_element(stack, hash.to_byte_array().to_vec())
    }

    fn op_sha256(&mut self, stack: &mut ScriptStack) -> Result<(), Error> {
        let data = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        let hash = sha256::Hash::hash(&data);
        self.push_element(stack, hash.to_byte_array().to_vec())
    }

    fn op_hash256(&mut self, stack: &mut ScriptStack) -> Result<(), Error> {
        let data = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        let hash = sha256d::Hash::hash(&data);
        self.push_element(stack, hash.to_byte_array().to_vec())
    }

    fn op_equal(&mut self, stack: &mut ScriptStack) -> Result<(), Error> {
        let a = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        let b = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        self.push_bool_element(stack, a == b)
    }

    fn op_verify(&mut self, stack: &mut ScriptStack) -> Result<(), Error> {
        self.op_verify_with_code(stack, ScriptError::Verify)
    }

    fn op_verify_with_code(
        &mut self,
        stack: &mut ScriptStack,
        error: ScriptError,
    ) -> Result<(), Error> {
        let value = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        if !cast_to_bool(&value) {
            return Err(self.fail(error));
        }
        Ok(())
    }

    fn op_checksig(
        &mut self,
        stack: &mut ScriptStack,
        script: &Script,
        code_separator: usize,
        sigversion: SigVersion,
    ) -> Result<(), Error> {
        let pubkey = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        let sig = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        let sig_parts = self.parse_signature(&sig)?;
        self.check_pubkey_encoding(&pubkey, sigversion)?;
        let script_code = self.build_script_code(script, code_separator)?;
        let result =
            self.verify_ecdsa_signature(sig_parts, &pubkey, &script_code, sigversion, &sig)?;
        if !result && self.flags.bits() & VERIFY_NULLFAIL != 0 && !sig.is_empty() {
            return Err(self.fail(ScriptError::NullFail));
        }
        self.push_bool_element(stack, result)
    }

    fn op_checkmultisig(
        &mut self,
        stack: &mut ScriptStack,
        script: &Script,
        code_separator: usize,
        sigversion: SigVersion,
    ) -> Result<(), Error> {
        let require_minimal = self.flags.bits() & VERIFY_MINIMALDATA != 0;
        let n_keys = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
        if n_keys < 0 || n_keys as usize > MAX_PUBKEYS_PER_MULTISIG {
            return Err(self.fail(ScriptError::PubkeyCount));
        }
        let n_keys = n_keys as usize;
        self.add_ops(n_keys)?;
        if stack.len() < n_keys {
            return Err(self.fail(ScriptError::InvalidStackOperation));
        }

        let mut pubkeys = Vec::with_capacity(n_keys);
        for _ in 0..n_keys {
            let key = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
            pubkeys.push(key);
        }

        let n_sigs = self.pop_scriptnum(stack, require_minimal, MAX_NUM_SIZE)?;
        if n_sigs < 0 || n_sigs as usize > n_keys {
            return Err(self.fail(ScriptError::SigCount));
        }
        let n_sigs = n_sigs as usize;
        if stack.len() < n_sigs + 1 {
            return Err(self.fail(ScriptError::InvalidStackOperation));
        }

        let mut sigs = Vec::with_capacity(n_sigs);
        for _ in 0..n_sigs {
            let sig = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
            sigs.push(sig);
        }

        let script_code = self.build_script_code(script, code_separator)?;
        let dummy = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        if self.flags.bits() & VERIFY_NULLDUMMY != 0 && !dummy.is_empty() {
            return Err(self.fail(ScriptError::SigNullDummy));
        }

        let mut success = true;
        let mut sig_index = 0usize;
        let mut key_index = 0usize;

        while success && sig_index < sigs.len() {
            if pubkeys.len() - key_index < sigs.len() - sig_index {
                success = false;
                break;
            }

            self.check_pubkey_encoding(&pubkeys[key_index], sigversion)?;
            let sig_parts = self.parse_signature(&sigs[sig_index])?;
            let sig_valid = self.verify_ecdsa_signature(
                sig_parts,
                &pubkeys[key_index],
                &script_code,
                sigversion,
                &sigs[sig_index],
            )?;
            // A miss only advances the key cursor; signatures may skip keys
            // as long as their relative order matches the key order.
            if sig_valid {
                sig_index += 1;
            }
            key_index += 1;
        }

        if !success && self.flags.bits() & VERIFY_NULLFAIL != 0 {
            let has_non_empty = sigs.iter().any(|sig| !sig.is_empty());
            if has_non_empty {
                return Err(self.fail(ScriptError::NullFail));
            }
        }

        self.push_bool_element(stack, success)
    }

    fn pop_scriptnum(
        &mut self,
        stack: &mut ScriptStack,
        minimal: bool,
        max_len: usize,
    ) -> Result<i64, Error> {
        let bytes = self.pop_or(stack, ScriptError::InvalidStackOperation)?;
        self.decode_scriptnum(&bytes, minimal, max_len)
    }

    fn peek_scriptnum(
        &mut self,
        stack: &ScriptStack,
        minimal: bool,
        max_len: usize,
    ) -> Result<i64, Error> {
        let bytes = stack
            .last()
            .ok_or_else(|| self.fail(ScriptError::InvalidStackOperation))?;
        self.decode_scriptnum(bytes, minimal, max_len)
    }

    fn decode_scriptnum(
        &mut self,
        bytes: &[u8],
        minimal: bool,
        max_len: usize,
    ) -> Result<i64, Error> {
        parse_num(bytes, minimal, max_len).map_err(|_| self.fail(ScriptError::Unknown))
    }

    fn check_lock_time(&self, locktime: u64) -> Result<(), ScriptError> {
        if locktime > u32::MAX as u64 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        let tx = self.tx_ctx.tx();
        let tx_lock = tx.lock_time.to_consensus_u32();
        let locktime_u32 = locktime as u32;
        if tx_lock < locktime_u32 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        if (tx_lock < LOCK_TIME_THRESHOLD) != (locktime_u32 < LOCK_TIME_THRESHOLD) {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        let sequence = tx.input[self.input_index].sequence.to_consensus_u32();
        if sequence == Sequence::MAX.0 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        Ok(())
    }

    fn check_sequence(&self, sequence: u64) -> Result<(), ScriptError> {
        if sequence > u32::MAX as u64 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }
        let sequence_u32 = sequence as u32;
        if sequence_u32 & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            return Ok(());
        }

        let tx_sequence = self.tx_ctx.tx().input[self.input_index]
            .sequence
            .to_consensus_u32();
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        let tx_type = tx_sequence & SEQUENCE_LOCKTIME_TYPE_FLAG;
        let seq_type = sequence_u32 & SEQUENCE_LOCKTIME_TYPE_FLAG;
        if tx_type != seq_type {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        let tx_value = if tx_type != 0 {
            (tx_sequence & SEQUENCE_LOCKTIME_MASK) << SEQUENCE_LOCKTIME_GRANULARITY
        } else {
            tx_sequence & SEQUENCE_LOCKTIME_MASK
        };
        let seq_value = if seq_type != 0 {
            (sequence_u32 & SEQUENCE_LOCKTIME_MASK) << SEQUENCE_LOCKTIME_GRANULARITY
        } else {
            sequence_u32 & SEQUENCE_LOCKTIME_MASK
        };

        if tx_value < seq_value {
            return Err(ScriptError::UnsatisfiedLockTime);
        }

        Ok(())
    }

    fn parse_signature(
        &mut self,
        sig_with_hashtype: &[u8],
    ) -> Result<Option<SignatureParts>, Error> {
        if sig_with_hashtype.is_empty() {
            return Ok(None);
        }

        self.check_signature_encoding(sig_with_hashtype)?;

        if sig_with_hashtype.len() == 1 {
            return Ok(None);
        }

        let sighash_type = *sig_with_hashtype.last().unwrap() as u32;
        let sig_bytes = &sig_with_hashtype[..sig_with_hashtype.len() - 1];
        let strict_encoding =
            self.flags.bits() & (VERIFY_DERSIG | VERIFY_LOW_S | VERIFY_STRICTENC) != 0;
        let signature = if strict_encoding {
            EcdsaSignature::from_der(sig_bytes).map_err(|_| self.fail(ScriptError::SigDer))?
        } else {
            match EcdsaSignature::from_der_lax(sig_bytes) {
                Ok(sig) => sig,
                Err(_) => return Ok(None),
            }
        };

        Ok(Some(SignatureParts {
            signature,
            sighash_type,
        }))
    }

    fn check_signature_encoding(&mut self, sig_with_hashtype: &[u8]) -> Result<(), Error> {
        if sig_with_hashtype.is_empty() {
            return Ok(());
        }
        let flags = self.flags.bits();
        let enforce_der = flags & (VERIFY_DERSIG | VERIFY_LOW_S | VERIFY_STRICTENC) != 0;
        if enforce_der && !is_valid_signature_encoding(sig_with_hashtype) {
            return Err(self.fail(ScriptError::SigDer));
        }
        if flags & VERIFY_LOW_S != 0 && !is_low_der_signature(sig_with_hashtype) {
            return Err(self.fail(ScriptError::SigHighS));
        }
        if flags & VERIFY_STRICTENC != 0 && !is_defined_hashtype_signature(sig_with_hashtype) {
            return Err(self.fail(ScriptError::SigHashType));
        }
        Ok(())
    }

    fn check_pubkey_encoding(
        &mut self,
        pubkey: &[u8],
        sigversion: SigVersion,
    ) -> Result<(), Error> {
        if self.flags.bits() & VERIFY_STRICTENC != 0 && !is_valid_pubkey_encoding(pubkey) {
            return Err(self.fail(ScriptError::PubkeyType));
        }
        if sigversion == SigVersion::WitnessV0
            && self.flags.bits() & VERIFY_WITNESS_PUBKEYTYPE != 0
            && !is_compressed_pubkey(pubkey)
        {
            return Err(self.fail(ScriptError::WitnessPubkeyType));
        }
        Ok(())
    }

    fn build_script_code(
        &mut self,
        script: &Script,
        code_separator: usize,
    ) -> Result<ScriptBuf, Error> {
        let identity = ScriptIdentity::new(script);
        let needs_refresh = self
            .script_code_cache
            .as_ref()
            .map(|cache| !cache.matches(identity, code_separator))
            .unwrap_or(true);
        if needs_refresh {
            let script_buf = Self::materialize_script_code(script, code_separator)?;
            self.script_code_cache = Some(ScriptCodeCache {
                identity,
                code_separator,
                script: script_buf,
            });
        }
        Ok(self
            .script_code_cache
            .as_ref()
            .expect("script code cache is initialized")
            .script
            .clone())
    }

    fn materialize_script_code(script: &Script, code_separator: usize) -> Result<ScriptBuf, Error> {
        if code_separator > script.as_bytes().len() {
            return Err(Error::ERR_SCRIPT);
        }
        let tail = &script.as_bytes()[code_separator..];
        let stripped = strip_code_separators(tail).map_err(|_| Error::ERR_SCRIPT)?;
        Ok(ScriptBuf::from_bytes(stripped))
    }

    fn execute_witness_program(
        &mut self,
        version: u8,
        program: &[u8],
        witness: &'tx Witness,
    ) -> Result<(), Error> {
        match version {
            0 => match program.len() {
                20 => self.verify_p2wpkh(program, witness),
                32 => self.verify_p2wsh(program, witness),
                _ => Err(self.fail(ScriptError::WitnessProgramWrongLength)),
            },
            1 if program.len() == 32 && self.flags.bits() & VERIFY_MAST != 0 => {
                self.verify_mast(program, witness)
            }
            _ => {
                if self.flags.bits() & VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM != 0 {
                    Err(self.fail(ScriptError::DiscourageUpgradableWitnessProgram))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn verify_p2wpkh(&mut self, program: &[u8], witness: &Witness) -> Result<(), Error> {
        if witness.len() != 2 {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }

        let mut stack = ScriptStack::from_witness(witness).map_err(|err| self.fail(err))?;
        // DUP HASH160 <program> EQUALVERIFY CHECKSIG
        let mut script = Vec::with_capacity(program.len() + 5);
        script.push(all::OP_DUP.to_u8());
        script.push(all::OP_HASH160.to_u8());
        script.extend_from_slice(&single_push_script(program));
        script.push(all::OP_EQUALVERIFY.to_u8());
        script.push(all::OP_CHECKSIG.to_u8());

        self.run_script(&mut stack, &script, SigVersion::WitnessV0)?;
        self.ensure_witness_success(&stack)
    }

    fn verify_p2wsh(&mut self, program: &[u8], witness: &Witness) -> Result<(), Error> {
        if witness.is_empty() {
            return Err(self.fail(ScriptError::WitnessProgramWitnessEmpty));
        }

        let witness_script = witness[witness.len() - 1].to_vec();
        let script_hash = sha256::Hash::hash(&witness_script);
        let hash_bytes: &[u8] = script_hash.as_ref();
        if hash_bytes != program {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }

        let mut stack = ScriptStack::from_witness_prefix(witness, witness.len() - 1)
            .map_err(|err| self.fail(err))?;

        self.run_script(&mut stack, &witness_script, SigVersion::WitnessV0)?;
        self.ensure_witness_success(&stack)
    }

    /// Witness v1: a Merkle-authenticated subscript tree committed to by the
    /// 32-byte program. The witness stack carries, from the top down, a
    /// metadata element (subscript count and tree version), a Merkle path, a
    /// leaf position, and the subscript bodies; anything below that seeds the
    /// execution stack.
    fn verify_mast(&mut self, program: &[u8], witness: &'tx Witness) -> Result<(), Error> {
        if witness.len() < 4 {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }

        let metadata = &witness[witness.len() - 1];
        if metadata.is_empty() || metadata.len() > 5 {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }

        let subscripts = metadata[0] as usize;
        if subscripts == 0 || witness.len() < subscripts + 3 {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }

        let mut tree_version: u32 = 0;
        for (shift, &byte) in metadata[1..].iter().enumerate() {
            tree_version |= (byte as u32) << (8 * shift);
        }
        if tree_version > 0 {
            if self.flags.bits() & VERIFY_DISCOURAGE_UPGRADABLE_WITNESS_PROGRAM != 0 {
                return Err(self.fail(ScriptError::DiscourageUpgradableWitnessProgram));
            }
            return Ok(());
        }

        let path = &witness[witness.len() - 2];
        if path.len() % 32 != 0 || path.len() / 32 > MAX_MAST_PATH_DEPTH {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }
        let depth = path.len() / 32;

        let posdata = &witness[witness.len() - 3];
        if posdata.len() > 4 {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }
        let mut pos: u32 = 0;
        for (shift, &byte) in posdata.iter().enumerate() {
            pos |= (byte as u32) << (8 * shift);
        }
        if depth < 32 && pos as u64 >= 1u64 << depth {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }

        let mut script = Vec::new();
        for index in 0..subscripts {
            let body = &witness[witness.len() - 4 - index];
            if script.len() + body.len() > MAX_SCRIPT_SIZE {
                return Err(self.fail(ScriptError::ScriptSize));
            }
            script.extend_from_slice(body);
        }

        let mut hash = sha256d::Hash::hash(&script).to_byte_array();
        let mut branch_pos = pos;
        for level in 0..depth {
            let node = &path[level * 32..(level + 1) * 32];
            let mut concat = [0u8; 64];
            if branch_pos & 1 == 1 {
                concat[..32].copy_from_slice(node);
                concat[32..].copy_from_slice(&hash);
            } else {
                concat[..32].copy_from_slice(&hash);
                concat[32..].copy_from_slice(node);
            }
            hash = sha256d::Hash::hash(&concat).to_byte_array();
            branch_pos >>= 1;
        }
        if hash != program {
            return Err(self.fail(ScriptError::WitnessProgramMismatch));
        }

        let input_items = witness.len() - 3 - subscripts;
        let mut stack = ScriptStack::from_witness_prefix(witness, input_items)
            .map_err(|err| self.fail(err))?;
        self.run_script(&mut stack, &script, SigVersion::WitnessV0)?;
        self.ensure_witness_success(&stack)
    }

    fn require_clean_stack(&self, stack: &ScriptStack) -> Result<(), ScriptError> {
        if stack.len() != 1 {
            return Err(ScriptError::CleanStack);
        }
        if !cast_to_bool(stack.last().expect("stack length checked")) {
            return Err(ScriptError::CleanStack);
        }
        Ok(())
    }

    fn ensure_witness_success(&mut self, stack: &ScriptStack) -> Result<(), Error> {
        if stack.len() != 1 {
            return Err(self.fail(ScriptError::CleanStack));
        }
        if !cast_to_bool(stack.last().expect("stack length checked")) {
            return Err(self.fail(ScriptError::EvalFalse));
        }
        Ok(())
    }

    fn verify_ecdsa_signature(
        &self,
        sig_parts: Option<SignatureParts>,
        pubkey_bytes: &[u8],
        script_code: &Script,
        sigversion: SigVersion,
        raw_signature: &[u8],
    ) -> Result<bool, Error> {
        let Some(SignatureParts {
            signature,
            sighash_type,
        }) = sig_parts
        else {
            return Ok(false);
        };

        let pubkey = match PublicKey::from_slice(pubkey_bytes) {
            Ok(pk) => pk,
            Err(_) => return Ok(false),
        };

        let mut normalized_sig = signature;
        normalized_sig.normalize_s();

        let raw_sighash_type = sighash_type;
        let sighash_type = EcdsaSighashType::from_consensus(raw_sighash_type);

        let mut script_bytes = script_code.as_bytes().to_vec();
        if sigversion == SigVersion::Base {
            let sig_push = single_push_script(raw_signature);
            let (filtered, _) = find_and_delete(&script_bytes, &sig_push);
            script_bytes = filtered;
        }
        let script_buf = ScriptBuf::from_bytes(script_bytes);
        let (digest, message) = match sigversion {
            SigVersion::Base => {
                let sighash = self
                    .sighash_cache
                    .borrow()
                    .legacy_signature_hash(self.input_index, &script_buf, raw_sighash_type)
                    .map_err(|_| Error::ERR_SCRIPT)?;
                (sighash.to_byte_array(), <Message as From<_>>::from(sighash))
            }
            SigVersion::WitnessV0 => {
                let mut engine = SegwitV0Sighash::engine();
                {
                    let mut cache = self.sighash_cache.borrow_mut();
                    cache
                        .segwit_v0_encode_signing_data_to(
                            &mut engine,
                            self.input_index,
                            &script_buf,
                            bitcoin::Amount::from_sat(self.amount),
                            sighash_type,
                        )
                        .map_err(|_| Error::ERR_SCRIPT)?;
                }
                let sighash = SegwitV0Sighash::from_engine(engine);
                (sighash.to_byte_array(), <Message as From<_>>::from(sighash))
            }
        };
        #[cfg(not(feature = "std"))]
        let _ = digest;

        #[cfg(feature = "std")]
        if let Some(cache) = self.sig_cache {
            if cache.contains(&digest, raw_signature, pubkey_bytes) {
                return Ok(true);
            }
        }

        let is_valid = with_secp256k1_verification_ctx(|secp| {
            secp.verify_ecdsa(&message, &normalized_sig, &pubkey)
                .is_ok()
        });

        #[cfg(feature = "std")]
        if is_valid {
            if let Some(cache) = self.sig_cache {
                cache.insert(&digest, raw_signature, pubkey_bytes);
            }
        }

        Ok(is_valid)
    }
}

pub(crate) fn cast_to_bool(data: &[u8]) -> bool {
    for (i, &byte) in data.iter().enumerate() {
        if byte != 0 {
            if i == data.len() - 1 && byte == 0x80 {
                return false;
            }
            return true;
        }
    }
    false
}

fn is_disabled(op: Opcode) -> bool {
    use all::*;

    matches!(
        op,
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

fn is_control_flow(op: Opcode) -> bool {
    use all::*;

    matches!(op, OP_IF | OP_NOTIF | OP_ELSE | OP_ENDIF)
}

fn is_minimal_if_condition(data: &[u8]) -> bool {
    data.len() == 1 && data[0] == 1
}

fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    if sig.len() < 9 || sig.len() > 73 {
        return false;
    }
    if sig[0] != 0x30 {
        return false;
    }
    if sig[1] as usize != sig.len() - 3 {
        return false;
    }

    let len_r = sig[3] as usize;
    if 5 + len_r >= sig.len() {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;

    if sig[2] != 0x02 {
        return false;
    }
    if len_r == 0 {
        return false;
    }
    if sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && (sig[5] & 0x80) == 0 {
        return false;
    }

    if sig[len_r + 4] != 0x02 {
        return false;
    }
    if len_s == 0 {
        return false;
    }
    if len_r + len_s + 7 != sig.len() {
        return false;
    }
    if sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && (sig[len_r + 7] & 0x80) == 0 {
        return false;
    }
    true
}

fn is_defined_hashtype_signature(sig: &[u8]) -> bool {
    if sig.is_empty() {
        return false;
    }
    let base = sig[sig.len() - 1] & 0x1f;
    matches!(base, 0x01..=0x03)
}

fn is_low_der_signature(sig: &[u8]) -> bool {
    if !is_valid_signature_encoding(sig) || sig.len() < 2 {
        return false;
    }

    let sig_bytes = &sig[..sig.len() - 1];
    let Ok(signature) = EcdsaSignature::from_der(sig_bytes) else {
        return false;
    };
    let mut normalized = signature;
    normalized.normalize_s();
    normalized == signature
}

fn is_valid_pubkey_encoding(pubkey: &[u8]) -> bool {
    if pubkey.len() == 33 {
        matches!(pubkey[0], 0x02 | 0x03)
    } else if pubkey.len() == 65 {
        pubkey[0] == 0x04
    } else {
        false
    }
}

fn is_compressed_pubkey(pubkey: &[u8]) -> bool {
    pubkey.len() == 33 && matches!(pubkey[0], 0x02 | 0x03)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VERIFY_DERSIG, VERIFY_NONE, VERIFY_P2SH, VERIFY_SIGPUSHONLY};

    #[test]
    fn rejects_unknown_flags() {
        let invalid_bit = 1 << 31;
        ScriptFlags::from_bits(invalid_bit).expect_err("invalid flag");
    }

    #[test]
    fn flag_roundtrip_without_implied_bits_is_lossless() {
        let bits = VERIFY_P2SH | VERIFY_SIGPUSHONLY | VERIFY_DERSIG;
        let flags = ScriptFlags::from_bits(bits).unwrap();
        assert_eq!(flags.bits(), bits);
    }

    #[test]
    fn witness_flag_enables_helper_bits() {
        let flags = ScriptFlags::from_bits(VERIFY_WITNESS).unwrap();
        let expected = VERIFY_WITNESS | VERIFY_P2SH;
        assert_eq!(flags.bits(), expected);
    }

    #[test]
    fn mast_flag_implies_witness_helpers() {
        let flags = ScriptFlags::from_bits(VERIFY_MAST).unwrap();
        let expected = VERIFY_MAST | VERIFY_WITNESS | VERIFY_P2SH;
        assert_eq!(flags.bits(), expected);
    }

    #[test]
    fn none_is_supported() {
        assert_eq!(ScriptFlags::from_bits(VERIFY_NONE).unwrap().bits(), 0);
    }

    #[test]
    fn truthiness_ignores_negative_zero() {
        assert!(!cast_to_bool(&[]));
        assert!(!cast_to_bool(&[0x00, 0x00]));
        assert!(!cast_to_bool(&[0x80]));
        assert!(!cast_to_bool(&[0x00, 0x80]));
        assert!(cast_to_bool(&[0x01]));
        assert!(cast_to_bool(&[0x80, 0x00]));
    }

    #[test]
    fn der_encoding_validation() {
        // 71-byte signature with correct structure.
        let mut sig = Vec::new();
        sig.push(0x30);
        sig.push(68);
        sig.push(0x02);
        sig.push(32);
        sig.push(0x01);
        sig.extend_from_slice(&[0x11; 31]);
        sig.push(0x02);
        sig.push(32);
        sig.push(0x01);
        sig.extend_from_slice(&[0x22; 31]);
        sig.push(0x01); // sighash type
        assert_eq!(sig.len(), 71);
        assert!(is_valid_signature_encoding(&sig));
        assert!(is_defined_hashtype_signature(&sig));

        let mut bad = sig.clone();
        bad[0] = 0x31;
        assert!(!is_valid_signature_encoding(&bad));

        let mut negative_r = sig.clone();
        negative_r[4] = 0x80;
        assert!(!is_valid_signature_encoding(&negative_r));

        let mut undefined_hashtype = sig;
        *undefined_hashtype.last_mut().unwrap() = 0x04;
        assert!(!is_defined_hashtype_signature(&undefined_hashtype));
    }

    #[test]
    fn pubkey_encoding_validation() {
        let mut compressed = vec![0x02];
        compressed.extend_from_slice(&[0u8; 32]);
        assert!(is_valid_pubkey_encoding(&compressed));
        assert!(is_compressed_pubkey(&compressed));

        let mut uncompressed = vec![0x04];
        uncompressed.extend_from_slice(&[0u8; 64]);
        assert!(is_valid_pubkey_encoding(&uncompressed));
        assert!(!is_compressed_pubkey(&uncompressed));

        let mut hybrid = vec![0x06];
        hybrid.extend_from_slice(&[0u8; 64]);
        assert!(!is_valid_pubkey_encoding(&hybrid));
    }
}
