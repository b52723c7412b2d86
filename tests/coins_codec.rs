//! Chain-state codec behaviour over whole transactions.

use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, ScriptBuf, Transaction, TxOut,
};
use bitcoin_consensus::coins::{Coins, CoinsError};

fn tx_with_outputs(outputs: Vec<(u64, Vec<u8>)>) -> Transaction {
    Transaction {
        version: Version(1),
        lock_time: LockTime::ZERO,
        input: vec![],
        output: outputs
            .into_iter()
            .map(|(value, script)| TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(script),
            })
            .collect(),
    }
}

fn p2pkh(fill: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[fill; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

fn p2sh(fill: u8) -> Vec<u8> {
    let mut script = vec![0xa9, 0x14];
    script.extend_from_slice(&[fill; 20]);
    script.push(0x87);
    script
}

fn p2pk_compressed(fill: u8) -> Vec<u8> {
    let mut script = vec![0x21, 0x02];
    script.extend_from_slice(&[fill; 32]);
    script.push(0xac);
    script
}

#[test]
fn template_scripts_roundtrip_compressed() {
    let tx = tx_with_outputs(vec![
        (1_000, p2pkh(0x11)),
        (2_000, p2sh(0x22)),
        (3_000, p2pk_compressed(0x33)),
        (4_000, vec![0x51, 0x87]),
    ]);
    let coins = Coins::from_tx(&tx, 500_000);

    let encoded = coins.encode();
    let mut decoded = Coins::decode(&encoded, tx.compute_txid()).unwrap();
    decoded.decode_all().unwrap();
    assert_eq!(decoded, coins);
    assert_eq!(decoded.height, 500_000);
    assert!(!decoded.coinbase);

    // The templated scripts compress to prefix + payload + value; the raw
    // one costs its varint length too. Header: 1 (version) + 4 (bits) + 2
    // (field length + field byte).
    let expected = 7 + (1 + 20 + 3) + (1 + 20 + 3) + (1 + 33 + 3) + (1 + 1 + 2 + 3);
    assert_eq!(encoded.len(), expected);
}

#[test]
fn spend_then_reencode_shrinks() {
    let tx = tx_with_outputs(vec![
        (10, p2pkh(0x01)),
        (20, p2pkh(0x02)),
        (30, p2pkh(0x03)),
    ]);
    let mut coins = Coins::from_tx(&tx, 10);

    let spent = coins.spend(2).unwrap().unwrap();
    assert_eq!(spent.value, 30);

    let encoded = coins.encode();
    let mut decoded = Coins::decode(&encoded, tx.compute_txid()).unwrap();
    decoded.decode_all().unwrap();
    // The trailing spent slot vanishes from the wire form.
    assert_eq!(decoded.len(), 2);
    assert!(decoded.is_unspent(0) && decoded.is_unspent(1));

    // Spending everything leaves nothing to store.
    let mut empty = coins;
    assert!(empty.spend(0).unwrap().is_some());
    assert!(empty.spend(1).unwrap().is_some());
    assert!(empty.is_fully_spent());
    assert!(empty.encode().is_empty());
}

#[test]
fn fast_path_agrees_with_full_decode() {
    let tx = tx_with_outputs(vec![
        (100, p2pkh(0x44)),
        (200, vec![0x6a]), // unspendable, pruned at construction
        (300, p2sh(0x55)),
        (400, p2pk_compressed(0x66)),
    ]);
    let txid = tx.compute_txid();
    let coins = Coins::from_tx(&tx, 42);
    let encoded = coins.encode();

    let mut full = Coins::decode(&encoded, txid).unwrap();
    for index in 0..4u32 {
        let fast = Coins::parse_output(&encoded, txid, index).unwrap();
        let slow = full.output(index as usize).unwrap().cloned();
        assert_eq!(fast.as_ref().map(|record| &record.output), slow.as_ref());
        if let Some(record) = fast {
            assert_eq!(record.txid, txid);
            assert_eq!(record.index, index);
            assert_eq!(record.height, 42);
            assert!(!record.coinbase);
        }
    }

    // Indexes beyond the tracked range are absent, not errors.
    assert!(Coins::parse_output(&encoded, txid, 100).unwrap().is_none());
}

#[test]
fn coinbase_and_unconfirmed_headers() {
    let mut tx = tx_with_outputs(vec![(5_000_000_000, p2pkh(0x77))]);
    tx.input.push(bitcoin::TxIn {
        previous_output: bitcoin::OutPoint::null(),
        script_sig: ScriptBuf::from_bytes(vec![0x01, 0x64]),
        sequence: bitcoin::Sequence::MAX,
        witness: bitcoin::Witness::new(),
    });
    let coins = Coins::from_tx(&tx, 100);
    assert!(coins.coinbase);

    let decoded = Coins::decode(&coins.encode(), tx.compute_txid()).unwrap();
    assert!(decoded.coinbase);
    assert_eq!(decoded.height, 100);

    let mut mempool_coins = Coins::from_tx(&tx, -1);
    mempool_coins.coinbase = false;
    let decoded = Coins::decode(&mempool_coins.encode(), tx.compute_txid()).unwrap();
    assert_eq!(decoded.height, -1);
    assert!(!decoded.coinbase);
}

#[test]
fn corrupt_buffers_error_cleanly() {
    let tx = tx_with_outputs(vec![(9, p2pkh(0x01))]);
    let txid = tx.compute_txid();
    let encoded = Coins::from_tx(&tx, 3).encode();

    for cut in 1..encoded.len() {
        match Coins::decode(&encoded[..cut], txid) {
            Err(CoinsError::UnexpectedEnd) => {}
            Err(other) => panic!("cut at {cut}: unexpected error {other}"),
            Ok(_) => panic!("cut at {cut}: truncated buffer decoded"),
        }
    }

    let mut bad_prefix = encoded;
    // First output record starts after version, bits and the 1-byte field.
    bad_prefix[7] = 0x09;
    assert!(matches!(
        Coins::decode(&bad_prefix, txid),
        Err(CoinsError::BadScriptPrefix(0x09))
    ));
}
