// src/ledger/transaction.rs
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::wallet::Wallet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Transfer,
    Mint,
    EscrowRelease,
}

/// A signed transaction. The signature covers the canonical payload
/// (`{type,from,to,amount,nonce,timestamp}` serialized in exactly that
/// field order with no extra whitespace); `tx_id` is the SHA-256 of the
/// canonical payload with the signature appended as a final field.
/// Any mutation of a canonical field invalidates both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub from: String,
    pub to: String,
    pub amount: i64,
    pub nonce: u64,
    pub timestamp: i64,
    #[serde(rename = "pubkeyPem")]
    pub pubkey_pem: String,
    pub signature: String,
    #[serde(rename = "txId")]
    pub tx_id: String,
}

/// An accepted transaction plus its position in the total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub tx: Transaction,
}

// Field order here is the canonical signature form; serde_json preserves
// struct declaration order, so serializing these is the stable encoding.
#[derive(Serialize)]
struct CanonicalPayload<'a> {
    #[serde(rename = "type")]
    tx_type: TxType,
    from: &'a str,
    to: &'a str,
    amount: i64,
    nonce: u64,
    timestamp: i64,
}

#[derive(Serialize)]
struct CanonicalSigned<'a> {
    #[serde(rename = "type")]
    tx_type: TxType,
    from: &'a str,
    to: &'a str,
    amount: i64,
    nonce: u64,
    timestamp: i64,
    signature: &'a str,
}

impl Transaction {
    /// Build and sign a transaction with the given wallet. The wallet's
    /// public key becomes `pubkeyPem`; callers are responsible for `from`
    /// actually matching the signer where the type requires it.
    pub fn build_signed(
        tx_type: TxType,
        from: &str,
        to: &str,
        amount: i64,
        nonce: u64,
        timestamp: i64,
        wallet: &Wallet,
    ) -> Self {
        let payload = canonical_payload(tx_type, from, to, amount, nonce, timestamp);
        let signature = wallet.sign(payload.as_bytes());
        let tx_id = compute_tx_id(tx_type, from, to, amount, nonce, timestamp, &signature);
        Self {
            tx_type,
            from: from.to_string(),
            to: to.to_string(),
            amount,
            nonce,
            timestamp,
            pubkey_pem: wallet.public_key_pem().to_string(),
            signature,
            tx_id,
        }
    }

    /// The canonical payload bytes this transaction's signature covers.
    pub fn canonical_payload(&self) -> String {
        canonical_payload(
            self.tx_type,
            &self.from,
            &self.to,
            self.amount,
            self.nonce,
            self.timestamp,
        )
    }

    /// Recompute the expected `txId` from the canonical fields.
    pub fn expected_tx_id(&self) -> String {
        compute_tx_id(
            self.tx_type,
            &self.from,
            &self.to,
            self.amount,
            self.nonce,
            self.timestamp,
            &self.signature,
        )
    }
}

fn canonical_payload(
    tx_type: TxType,
    from: &str,
    to: &str,
    amount: i64,
    nonce: u64,
    timestamp: i64,
) -> String {
    serde_json::to_string(&CanonicalPayload {
        tx_type,
        from,
        to,
        amount,
        nonce,
        timestamp,
    })
    .expect("canonical payload serialization cannot fail")
}

fn compute_tx_id(
    tx_type: TxType,
    from: &str,
    to: &str,
    amount: i64,
    nonce: u64,
    timestamp: i64,
    signature: &str,
) -> String {
    let signed = serde_json::to_string(&CanonicalSigned {
        tx_type,
        from,
        to,
        amount,
        nonce,
        timestamp,
        signature,
    })
    .expect("canonical payload serialization cannot fail");
    let mut hasher = Sha256::new();
    hasher.update(signed.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet;

    #[test]
    fn canonical_payload_is_stable() {
        let w = Wallet::generate();
        let tx = Transaction::build_signed(
            TxType::Transfer,
            "acct_aaaaaaaaaaaaaaaa",
            "acct_bbbbbbbbbbbbbbbb",
            100,
            2,
            1_700_000_000_000,
            &w,
        );
        assert_eq!(
            tx.canonical_payload(),
            "{\"type\":\"transfer\",\"from\":\"acct_aaaaaaaaaaaaaaaa\",\
             \"to\":\"acct_bbbbbbbbbbbbbbbb\",\"amount\":100,\"nonce\":2,\
             \"timestamp\":1700000000000}"
        );
    }

    #[test]
    fn signature_covers_canonical_payload() {
        let w = Wallet::generate();
        let tx = Transaction::build_signed(TxType::Transfer, "a", "b", 5, 1, 1, &w);
        assert!(wallet::verify(
            &tx.pubkey_pem,
            tx.canonical_payload().as_bytes(),
            &tx.signature
        ));
        assert_eq!(tx.tx_id, tx.expected_tx_id());
    }

    #[test]
    fn mutation_breaks_tx_id_and_signature() {
        let w = Wallet::generate();
        let mut tx = Transaction::build_signed(TxType::Transfer, "a", "b", 5, 1, 1, &w);
        tx.amount = 6;
        assert_ne!(tx.tx_id, tx.expected_tx_id());
        assert!(!wallet::verify(
            &tx.pubkey_pem,
            tx.canonical_payload().as_bytes(),
            &tx.signature
        ));
    }

    #[test]
    fn log_entry_flattens_transaction_fields() {
        let w = Wallet::generate();
        let tx = Transaction::build_signed(TxType::Mint, "a", "a", 10, 1, 1, &w);
        let entry = LogEntry { seq: 1, tx };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["seq"], 1);
        assert_eq!(json["type"], "mint");
        assert!(json["txId"].is_string());
        let back: LogEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.seq, 1);
        assert_eq!(back.tx.amount, 10);
    }
}
