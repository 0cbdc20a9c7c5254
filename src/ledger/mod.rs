// src/ledger/mod.rs
// Leader-ordered signed transaction log with a deterministic balance
// projection. The leader is the only writer; followers replay entries
// strictly contiguously by `seq`.

pub mod transaction;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::errors::{MeshError, Result, TxRejection};
use crate::storage::{self, MeshDb};
use crate::wallet::{self, Wallet};

use transaction::{LogEntry, Transaction, TxType};

const ENTRY_PREFIX: &str = "ledger:entry:";
const LAST_SEQ_KEY: &str = "ledger:meta:last_seq";
const LEADER_PEM_KEY: &str = "ledger:meta:leader_pem";

/// Out-of-order entries buffered ahead of the contiguous head.
const GAP_BUFFER_CAP: usize = 512;

/// Default page size for `tx_log_batch` responses.
pub const BATCH_PAGE_SIZE: usize = 200;

/// Deterministic escrow account for a task:
/// `escrow_` + first 24 hex chars of SHA-256(taskId). No key material
/// exists for it; only a leader-signed release can drain it.
pub fn escrow_account_for(task_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("escrow_{}", &digest[..24])
}

fn entry_key(seq: u64) -> String {
    format!("{}{:020}", ENTRY_PREFIX, seq)
}

/// Outcome of ingesting a remote log entry on a follower.
#[derive(Debug)]
pub enum RemoteApply {
    /// The entry (and possibly buffered successors) were applied.
    Applied { up_to: u64, applied: usize },
    /// The entry is ahead of the contiguous head and was buffered; the
    /// caller should request the gap starting at `missing_from`.
    Buffered { have: u64, missing_from: u64 },
}

struct Projection {
    last_seq: u64,
    balances: HashMap<String, i64>,
    nonces: HashMap<String, u64>,
    tx_seq: HashMap<String, u64>,
    leader_pem: Option<String>,
    gap_buffer: BTreeMap<u64, LogEntry>,
}

impl Projection {
    fn empty() -> Self {
        Self {
            last_seq: 0,
            balances: HashMap::new(),
            nonces: HashMap::new(),
            tx_seq: HashMap::new(),
            leader_pem: None,
            gap_buffer: BTreeMap::new(),
        }
    }

    /// Apply one accepted entry to the projection. Exactly-once is the
    /// caller's responsibility (checked via `tx_seq` before insert).
    fn apply(&mut self, entry: &LogEntry) {
        let tx = &entry.tx;
        match tx.tx_type {
            TxType::Mint => {
                if tx.from == tx.to {
                    *self.balances.entry(tx.to.clone()).or_insert(0) += tx.amount;
                }
            }
            TxType::Transfer | TxType::EscrowRelease => {
                *self.balances.entry(tx.from.clone()).or_insert(0) -= tx.amount;
                *self.balances.entry(tx.to.clone()).or_insert(0) += tx.amount;
            }
        }
        self.nonces.insert(tx.from.clone(), tx.nonce);
        self.tx_seq.insert(tx.tx_id.clone(), entry.seq);
        self.last_seq = entry.seq;
    }
}

pub struct Ledger {
    db: MeshDb,
    state: RwLock<Projection>,
}

impl Ledger {
    /// Open the ledger, replaying the persisted log from seq=1 to rebuild
    /// the balance and nonce projections.
    pub fn open(db: MeshDb) -> Result<Self> {
        let mut p = Projection::empty();
        p.leader_pem = storage::get::<String>(&db, LEADER_PEM_KEY)?;
        let entries: Vec<LogEntry> = storage::iter_prefix(&db, ENTRY_PREFIX)?;
        for entry in &entries {
            if entry.seq != p.last_seq + 1 {
                return Err(MeshError::Storage(format!(
                    "ledger log has a gap: found seq {} after {}",
                    entry.seq, p.last_seq
                )));
            }
            p.apply(entry);
        }
        let persisted_last = storage::get_counter(&db, LAST_SEQ_KEY)?;
        if persisted_last != p.last_seq {
            tracing::warn!(
                persisted = persisted_last,
                replayed = p.last_seq,
                "last_seq counter disagrees with replay; trusting the log"
            );
            storage::put_counter(&db, LAST_SEQ_KEY, p.last_seq)?;
        }
        tracing::info!(last_seq = p.last_seq, "ledger opened");
        Ok(Self {
            db,
            state: RwLock::new(p),
        })
    }

    /// First-start initialization. A leader with an empty log mints the
    /// genesis supply to its own account and records its public key as
    /// the leader key; on later startups this is a no-op.
    pub fn initialize(
        &self,
        is_leader: bool,
        wallet: &Wallet,
        genesis_supply: i64,
    ) -> Result<Option<(u64, String)>> {
        if !is_leader {
            return Ok(None);
        }
        {
            let state = self.state.read();
            if let Some(pem) = &state.leader_pem {
                if pem.trim() != wallet.public_key_pem().trim() {
                    return Err(MeshError::BadKeyMaterial(
                        "ledger already carries a different leader key".into(),
                    ));
                }
                if state.last_seq > 0 {
                    return Ok(None);
                }
            }
        }
        self.set_leader_pem(wallet.public_key_pem())?;
        if self.last_seq() > 0 {
            return Ok(None);
        }
        let account = wallet.account_id();
        let mint = Transaction::build_signed(
            TxType::Mint,
            account,
            account,
            genesis_supply,
            1,
            chrono::Utc::now().timestamp_millis(),
            wallet,
        );
        let (seq, tx_id) = self.submit_local_as_leader(mint)?;
        tracing::info!(seq, %tx_id, supply = genesis_supply, "minted genesis supply");
        Ok(Some((seq, tx_id)))
    }

    fn set_leader_pem(&self, pem: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.leader_pem.is_none() {
            storage::put(&self.db, LEADER_PEM_KEY, &pem.to_string())?;
            state.leader_pem = Some(pem.to_string());
        }
        Ok(())
    }

    /// Validate a transaction against the current projection without
    /// changing any state.
    pub fn verify(&self, tx: &Transaction) -> std::result::Result<(), TxRejection> {
        let state = self.state.read();
        verify_against(&state, tx)
    }

    /// Leader-only append: validate, assign the next `seq`, persist with a
    /// synced write, and apply to the projection. Rejections leave the log
    /// untouched.
    pub fn submit_local_as_leader(
        &self,
        tx: Transaction,
    ) -> std::result::Result<(u64, String), TxRejection> {
        let mut state = self.state.write();
        verify_against(&state, &tx)?;
        let seq = state.last_seq + 1;
        let entry = LogEntry { seq, tx };
        persist_entry(&self.db, &entry);
        state.apply(&entry);
        Ok((seq, entry.tx.tx_id))
    }

    /// Follower-side ingestion of a broadcast log entry. Contiguous
    /// entries are verified and applied (draining any buffered
    /// successors); entries ahead of the head are buffered.
    pub fn apply_remote_entry(
        &self,
        entry: LogEntry,
    ) -> std::result::Result<RemoteApply, TxRejection> {
        let mut state = self.state.write();
        if entry.seq <= state.last_seq {
            // Replayed history: a no-op if we already hold this txId,
            // otherwise the peer's log conflicts with ours.
            return match state.tx_seq.get(&entry.tx.tx_id) {
                Some(_) => Ok(RemoteApply::Applied {
                    up_to: state.last_seq,
                    applied: 0,
                }),
                None => Err(TxRejection::OutOfOrder {
                    got: entry.seq,
                    expected: state.last_seq + 1,
                }),
            };
        }
        if entry.seq > state.last_seq + 1 {
            if state.gap_buffer.len() < GAP_BUFFER_CAP {
                state.gap_buffer.insert(entry.seq, entry);
            } else {
                // Keep the entries nearest the head; drop the farthest.
                let highest = state.gap_buffer.keys().next_back().copied();
                if let Some(highest) = highest {
                    if entry.seq < highest {
                        state.gap_buffer.remove(&highest);
                        state.gap_buffer.insert(entry.seq, entry);
                    }
                }
            }
            return Ok(RemoteApply::Buffered {
                have: state.last_seq,
                missing_from: state.last_seq + 1,
            });
        }

        let mut applied = 0usize;
        self.ingest_contiguous(&mut state, entry)?;
        applied += 1;
        // Drain any buffered successors that are now contiguous.
        loop {
            let next = state.last_seq + 1;
            let Some(buffered) = state.gap_buffer.remove(&next) else {
                break;
            };
            match self.ingest_contiguous(&mut state, buffered) {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!(seq = next, error = %e, "dropping invalid buffered entry");
                    break;
                }
            }
        }
        Ok(RemoteApply::Applied {
            up_to: state.last_seq,
            applied,
        })
    }

    fn ingest_contiguous(
        &self,
        state: &mut Projection,
        entry: LogEntry,
    ) -> std::result::Result<(), TxRejection> {
        // First non-leader bootstrap: the mint entry's signer is trusted as
        // the leader and its key stored as metadata before full validation.
        if state.last_seq == 0
            && state.leader_pem.is_none()
            && entry.tx.tx_type == TxType::Mint
        {
            verify_intrinsic(&entry.tx)?;
            let pem = entry.tx.pubkey_pem.clone();
            if storage::put(&self.db, LEADER_PEM_KEY, &pem).is_err() {
                tracing::error!("failed to persist leader key metadata");
            }
            state.leader_pem = Some(pem);
            tracing::info!("adopted leader key from genesis mint entry");
        }
        verify_against(state, &entry.tx)?;
        persist_entry(&self.db, &entry);
        state.apply(&entry);
        Ok(())
    }

    pub fn balance(&self, account_id: &str) -> i64 {
        *self.state.read().balances.get(account_id).unwrap_or(&0)
    }

    pub fn nonce(&self, account_id: &str) -> u64 {
        *self.state.read().nonces.get(account_id).unwrap_or(&0)
    }

    /// Confirmations for a transaction: `lastSeq - seq + 1`, or None if
    /// the transaction is not in the local replicated log.
    pub fn confirmations(&self, tx_id: &str) -> Option<u64> {
        let state = self.state.read();
        state
            .tx_seq
            .get(tx_id)
            .map(|seq| state.last_seq - seq + 1)
    }

    pub fn last_seq(&self) -> u64 {
        self.state.read().last_seq
    }

    pub fn leader_pem(&self) -> Option<String> {
        self.state.read().leader_pem.clone()
    }

    pub fn is_leader_key(&self, pem: &str) -> bool {
        self.state
            .read()
            .leader_pem
            .as_deref()
            .map(|l| l.trim() == pem.trim())
            .unwrap_or(false)
    }

    /// Page of entries with `seq > since_seq`, plus whether more follow.
    pub fn entries_since(&self, since_seq: u64, limit: usize) -> Result<(Vec<LogEntry>, bool)> {
        let limit = limit.clamp(1, BATCH_PAGE_SIZE);
        let start = entry_key(since_seq + 1);
        let entries: Vec<LogEntry> =
            storage::iter_from(&self.db, &start, ENTRY_PREFIX, limit)?;
        let has_more = entries
            .last()
            .map(|e| e.seq < self.last_seq())
            .unwrap_or(false);
        Ok((entries, has_more))
    }

    /// Full recompute of the projection from the persisted log, compared
    /// against the incremental one. Exercised by tests; the projection is
    /// maintained incrementally everywhere else.
    pub fn verify_projection(&self) -> Result<()> {
        let entries: Vec<LogEntry> = storage::iter_prefix(&self.db, ENTRY_PREFIX)?;
        let mut fresh = Projection::empty();
        for entry in &entries {
            fresh.apply(entry);
        }
        let state = self.state.read();
        if fresh.balances != state.balances || fresh.nonces != state.nonces {
            return Err(MeshError::Storage(
                "incremental projection diverged from full recompute".into(),
            ));
        }
        Ok(())
    }
}

fn persist_entry(db: &MeshDb, entry: &LogEntry) {
    // Storage failures are fatal: a half-applied ledger must not keep
    // running.
    if let Err(e) = storage::put_sync(db, &entry_key(entry.seq), entry) {
        tracing::error!(seq = entry.seq, error = %e, "FATAL: ledger append failed");
        std::process::exit(1);
    }
    if let Err(e) = storage::put_counter(db, LAST_SEQ_KEY, entry.seq) {
        tracing::error!(seq = entry.seq, error = %e, "FATAL: ledger head update failed");
        std::process::exit(1);
    }
}

/// Intrinsic checks that need no projection: fields, amount, signature,
/// txId integrity, signer/account binding.
fn verify_intrinsic(tx: &Transaction) -> std::result::Result<(), TxRejection> {
    if tx.from.is_empty() {
        return Err(TxRejection::MissingField("from"));
    }
    if tx.to.is_empty() {
        return Err(TxRejection::MissingField("to"));
    }
    if tx.pubkey_pem.is_empty() {
        return Err(TxRejection::MissingField("pubkeyPem"));
    }
    if tx.signature.is_empty() {
        return Err(TxRejection::MissingField("signature"));
    }
    if tx.tx_id.is_empty() {
        return Err(TxRejection::MissingField("txId"));
    }
    if tx.amount <= 0 {
        return Err(TxRejection::BadAmount);
    }
    match tx.tx_type {
        TxType::Transfer => {
            if wallet::account_id_of(&tx.pubkey_pem) != tx.from {
                return Err(TxRejection::FromMismatch);
            }
        }
        TxType::Mint => {
            if tx.from != tx.to || wallet::account_id_of(&tx.pubkey_pem) != tx.from {
                return Err(TxRejection::FromMismatch);
            }
        }
        TxType::EscrowRelease => {
            if !tx.from.starts_with("escrow_") {
                return Err(TxRejection::BadEscrowAccount(tx.from.clone()));
            }
        }
    }
    if !wallet::verify(&tx.pubkey_pem, tx.canonical_payload().as_bytes(), &tx.signature) {
        return Err(TxRejection::BadSignature);
    }
    if tx.expected_tx_id() != tx.tx_id {
        return Err(TxRejection::BadTxId);
    }
    Ok(())
}

fn verify_against(
    state: &Projection,
    tx: &Transaction,
) -> std::result::Result<(), TxRejection> {
    verify_intrinsic(tx)?;
    if state.tx_seq.contains_key(&tx.tx_id) {
        return Err(TxRejection::DuplicateTx(tx.tx_id.clone()));
    }
    match tx.tx_type {
        TxType::Mint => {
            if state.last_seq != 0 {
                return Err(TxRejection::MintNotAllowed);
            }
        }
        TxType::EscrowRelease => {
            let leader_ok = state
                .leader_pem
                .as_deref()
                .map(|l| l.trim() == tx.pubkey_pem.trim())
                .unwrap_or(false);
            if !leader_ok {
                return Err(TxRejection::NotLeader);
            }
        }
        TxType::Transfer => {}
    }
    let expected = state.nonces.get(&tx.from).copied().unwrap_or(0) + 1;
    if tx.nonce != expected {
        return Err(TxRejection::BadNonce {
            got: tx.nonce,
            expected,
        });
    }
    if matches!(tx.tx_type, TxType::Transfer | TxType::EscrowRelease) {
        let available = *state.balances.get(&tx.from).unwrap_or(&0);
        if available < tx.amount {
            return Err(TxRejection::InsufficientBalance {
                available,
                needed: tx.amount,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escrow_account_is_deterministic() {
        let a = escrow_account_for("task_0123456789abcdef");
        let b = escrow_account_for("task_0123456789abcdef");
        assert_eq!(a, b);
        assert!(a.starts_with("escrow_"));
        assert_eq!(a.len(), "escrow_".len() + 24);
        assert_ne!(a, escrow_account_for("task_fedcba9876543210"));
    }

    #[test]
    fn entry_keys_sort_numerically() {
        assert!(entry_key(2) < entry_key(10));
        assert!(entry_key(999) < entry_key(1000));
    }
}
