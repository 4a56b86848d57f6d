//! Mempool: pending transactions validated against a copy of the latest
//! committed state. The interface consensus relies on is `reap` and `update`.

use std::sync::Mutex;

use tracing::debug;

use crate::state::{execute_tx, State};
use crate::types::{Hash, Tx};

#[derive(thiserror::Error, Debug)]
pub enum MempoolError {
    #[error("invalid tx: {0}")]
    InvalidTx(String),
}

struct Inner {
    /// State copy with all pending txs applied, for sequence continuity.
    state: State,
    txs: Vec<Tx>,
}

pub struct Mempool {
    inner: Mutex<Inner>,
}

impl Mempool {
    pub fn new(state: State) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                txs: Vec::new(),
            }),
        }
    }

    /// Validate and admit a transaction.
    pub fn add_tx(&self, tx: Tx) -> Result<(), MempoolError> {
        let mut inner = self.inner.lock().expect("mempool lock");
        let height = inner.state.last_block_height + 1;
        let mut trial = inner.state.clone();
        match execute_tx(&mut trial, &tx, height) {
            Ok(_) => {
                inner.state = trial;
                inner.txs.push(tx);
                Ok(())
            }
            Err(e) => Err(MempoolError::InvalidTx(e.to_string())),
        }
    }

    /// All pending transactions, in admission order.
    pub fn reap(&self) -> Vec<Tx> {
        self.inner.lock().expect("mempool lock").txs.clone()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("mempool lock").txs.len()
    }

    /// Drop committed transactions and re-validate the remainder against the
    /// new state.
    pub fn update(&self, state: State, committed: &[Tx]) {
        let committed_hashes: Vec<Hash> = committed.iter().map(|tx| tx.hash()).collect();
        let mut inner = self.inner.lock().expect("mempool lock");

        let pending: Vec<Tx> = inner
            .txs
            .drain(..)
            .filter(|tx| !committed_hashes.contains(&tx.hash()))
            .collect();

        inner.state = state;
        let height = inner.state.last_block_height + 1;
        let mut kept = Vec::with_capacity(pending.len());
        let mut trial = inner.state.clone();
        for tx in pending {
            match execute_tx(&mut trial, &tx, height) {
                Ok(_) => kept.push(tx),
                Err(e) => {
                    debug!(error = %e, "dropping stale mempool tx");
                    trial = inner.state.clone();
                    // Re-apply the kept prefix so later txs still chain.
                    for k in &kept {
                        let _ = execute_tx(&mut trial, k, height);
                    }
                }
            }
        }
        inner.state = trial;
        inner.txs = kept;
    }
}
