use bitcoin::{
    absolute::LockTime,
    blockdata::script::{Builder, PushBytesBuf},
    consensus as btc_consensus,
    hashes::{sha256, Hash},
    hex::FromHex,
    opcodes::all,
    transaction::Version,
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use bitcoin_consensus::{verify_with_flags, VERIFY_ALL, VERIFY_P2SH, VERIFY_WITNESS};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

struct BenchCase {
    name: &'static str,
    script_pubkey: Vec<u8>,
    amount: u64,
    tx_bytes: Vec<u8>,
    flags: u32,
}

pub fn verification_bench(c: &mut Criterion) {
    let cases = vec![legacy_p2pkh_case(), simple_p2sh_case(), simple_p2wsh_case()];

    let mut group = c.benchmark_group("verify");
    for case in cases {
        group.bench_with_input(BenchmarkId::new("spend", case.name), &case, |b, case| {
            b.iter(|| run_case(case));
        });
    }
    group.finish();
}

fn run_case(case: &BenchCase) {
    verify_with_flags(
        case.script_pubkey.as_slice(),
        case.amount,
        &case.tx_bytes,
        0,
        case.flags,
    )
    .expect("verification");
}

fn legacy_p2pkh_case() -> BenchCase {
    let spent = Vec::from_hex("76a9144bfbaf6afb76cc5771bc6404810d1cc041a6933988ac").unwrap();
    let spending = Vec::from_hex("02000000013f7cebd65c27431a90bba7f796914fe8cc2ddfc3f2cbd6f7e5f2fc854534da95000000006b483045022100de1ac3bcdfb0332207c4a91f3832bd2c2915840165f876ab47c5f8996b971c3602201c6c053d750fadde599e6f5c4e1963df0f01fc0d97815e8157e3d59fe09ca30d012103699b464d1d8bc9e47d4fb1cdaa89a1c5783d68363c4dbc4b524ed3d857148617feffffff02836d3c01000000001976a914fc25d6d5c94003bf5b0c7b640a248e2c637fcfb088ac7ada8202000000001976a914fbed3d9b11183209a57999d54d59f67c019e756c88ac6acb0700").unwrap();

    BenchCase {
        name: "p2pkh",
        script_pubkey: spent,
        amount: 0,
        tx_bytes: spending,
        flags: VERIFY_ALL,
    }
}

fn simple_p2sh_case() -> BenchCase {
    let redeem_script = Builder::new().push_opcode(all::OP_PUSHNUM_1).into_script();
    let script_sig = Builder::new()
        .push_slice(PushBytesBuf::try_from(redeem_script.as_bytes().to_vec()).unwrap())
        .into_script();
    let tx = single_input_tx(script_sig, Witness::new());
    let spent_script = ScriptBuf::new_p2sh(&redeem_script.script_hash());

    BenchCase {
        name: "p2sh",
        script_pubkey: spent_script.into_bytes(),
        amount: 0,
        tx_bytes: btc_consensus::serialize(&tx),
        flags: VERIFY_P2SH,
    }
}

fn simple_p2wsh_case() -> BenchCase {
    let witness_script = Builder::new().push_opcode(all::OP_PUSHNUM_1).into_script();
    let program = sha256::Hash::hash(witness_script.as_bytes());
    let spent_script = Builder::new()
        .push_opcode(all::OP_PUSHBYTES_0)
        .push_slice(PushBytesBuf::try_from(program.to_byte_array().to_vec()).unwrap())
        .into_script();
    let witness = Witness::from(vec![witness_script.as_bytes().to_vec()]);
    let tx = single_input_tx(ScriptBuf::new(), witness);

    BenchCase {
        name: "p2wsh",
        script_pubkey: spent_script.into_bytes(),
        amount: 25_000,
        tx_bytes: btc_consensus::serialize(&tx),
        flags: VERIFY_WITNESS | VERIFY_P2SH,
    }
}

fn single_input_tx(script_sig: ScriptBuf, witness: Witness) -> Transaction {
    Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::default(),
            script_sig,
            sequence: Sequence::MAX,
            witness,
        }],
        output: vec![TxOut {
            value: Amount::from_sat(25_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

criterion_group!(benches, verification_bench);
criterion_main!(benches);
