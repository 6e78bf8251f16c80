// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Thread-safe transaction store keyed by gateway reference.
//!
//! Each transaction lives behind its own [`Mutex`]. Holding that mutex is the
//! row lock: the reconciliation path re-reads the status under it before
//! writing, so concurrent reconcilers serialize per reference while different
//! references proceed in parallel.

use crate::MarketError;
use crate::base::{Reference, TransactionId};
use crate::transaction::{NewTransaction, Transaction};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared handle to a single transaction row.
pub type TransactionRow = Arc<Mutex<Transaction>>;

/// A thread-safe transaction store with unique references.
#[derive(Debug)]
pub struct TransactionStore {
    /// Transactions indexed by gateway reference.
    transactions: DashMap<Reference, TransactionRow>,

    /// Next transaction id to hand out.
    next_id: AtomicU64,
}

impl TransactionStore {
    /// Creates a new empty transaction store.
    pub fn new() -> Self {
        Self {
            transactions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Persists a new `pending` transaction.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::PersistenceFailure`] if a transaction with the
    /// same reference already exists; references are unique.
    pub fn insert(&self, new: NewTransaction) -> Result<Transaction, MarketError> {
        // Entry API keeps check-and-insert atomic per reference.
        match self.transactions.entry(new.reference.clone()) {
            Entry::Occupied(entry) => Err(MarketError::PersistenceFailure(format!(
                "duplicate transaction reference {}",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                let transaction = Transaction::pending(id, new);
                entry.insert(Arc::new(Mutex::new(transaction.clone())));
                Ok(transaction)
            }
        }
    }

    /// Returns the row handle for `reference`, for callers that need to lock it.
    pub fn row(&self, reference: &Reference) -> Option<TransactionRow> {
        self.transactions.get(reference).map(|r| Arc::clone(r.value()))
    }

    /// Returns a snapshot of the transaction for `reference`.
    pub fn get(&self, reference: &Reference) -> Option<Transaction> {
        self.row(reference).map(|row| row.lock().clone())
    }

    /// Snapshots of every transaction, newest first.
    pub fn list(&self) -> Vec<Transaction> {
        let rows: Vec<TransactionRow> = self
            .transactions
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();
        let mut snapshots: Vec<Transaction> = rows.iter().map(|row| row.lock().clone()).collect();
        snapshots.sort_by(|a, b| b.id.cmp(&a.id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{PackageId, PhoneNumber, UserId};
    use crate::transaction::TransactionStatus;
    use rust_decimal_macros::dec;

    fn new_tx(reference: &str) -> NewTransaction {
        NewTransaction {
            user_id: UserId(1),
            package_id: PackageId(1),
            amount: dec!(250),
            currency: "KSH".to_string(),
            slots_purchased: 3,
            phone_number: PhoneNumber::parse("254711111111").unwrap(),
            reference: Reference::from(reference),
            provider_reference: Some("merchant-1".to_string()),
        }
    }

    #[test]
    fn insert_starts_pending_with_sequential_ids() {
        let store = TransactionStore::new();
        let first = store.insert(new_tx("a")).unwrap();
        let second = store.insert(new_tx("b")).unwrap();
        assert_eq!(first.status, TransactionStatus::Pending);
        assert_eq!(first.id, TransactionId(1));
        assert_eq!(second.id, TransactionId(2));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn duplicate_reference_is_rejected() {
        let store = TransactionStore::new();
        store.insert(new_tx("dup")).unwrap();
        let result = store.insert(new_tx("dup"));
        assert!(matches!(result, Err(MarketError::PersistenceFailure(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn list_is_newest_first() {
        let store = TransactionStore::new();
        store.insert(new_tx("a")).unwrap();
        store.insert(new_tx("b")).unwrap();
        store.insert(new_tx("c")).unwrap();
        let refs: Vec<String> = store
            .list()
            .into_iter()
            .map(|tx| tx.reference.to_string())
            .collect();
        assert_eq!(refs, vec!["c", "b", "a"]);
    }

    #[test]
    fn get_returns_snapshot() {
        let store = TransactionStore::new();
        store.insert(new_tx("snap")).unwrap();
        let row = store.row(&Reference::from("snap")).unwrap();
        row.lock().settle(TransactionStatus::Failed, Some("cancelled".into()));
        let snapshot = store.get(&Reference::from("snap")).unwrap();
        assert_eq!(snapshot.status, TransactionStatus::Failed);
        assert!(store.get(&Reference::from("missing")).is_none());
    }
}
