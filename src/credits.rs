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

//! Credit ledger.
//!
//! One [`UserCredits`] record per user holds the spendable slot balance and the
//! lifetime purchase counter. Records are created lazily by the first credit;
//! reads of an absent record report zero.
//!
//! # Example
//!
//! ```
//! use slot_ledger_rs::{CreditLedger, UserId};
//!
//! let ledger = CreditLedger::new();
//! ledger.credit(UserId(1), 3).unwrap();
//! ledger.debit(UserId(1)).unwrap();
//!
//! let balance = ledger.balance(UserId(1));
//! assert_eq!(balance.slots_remaining, 2);
//! assert_eq!(balance.total_purchased, 3);
//! ```

use crate::MarketError;
use crate::base::UserId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};
use std::sync::Arc;

/// Point-in-time view of a user's credits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub slots_remaining: u32,
    pub total_purchased: u32,
}

#[derive(Debug)]
struct CreditsData {
    user_id: UserId,
    slots_remaining: u32,
    total_purchased: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CreditsData {
    fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            slots_remaining: 0,
            total_purchased: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn balance(&self) -> Balance {
        Balance {
            slots_remaining: self.slots_remaining,
            total_purchased: self.total_purchased,
        }
    }

    /// Adds purchased slots. Both counters are computed before either is
    /// written, so an overflow leaves the record untouched.
    fn credit(&mut self, slots: u32) -> Result<(), MarketError> {
        let (Some(remaining), Some(total)) = (
            self.slots_remaining.checked_add(slots),
            self.total_purchased.checked_add(slots),
        ) else {
            return Err(MarketError::PersistenceFailure(format!(
                "credit of {} slots overflows balance for user {}",
                slots, self.user_id
            )));
        };
        self.slots_remaining = remaining;
        self.total_purchased = total;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Spends exactly one slot.
    fn debit(&mut self) -> Result<(), MarketError> {
        if self.slots_remaining == 0 {
            return Err(MarketError::InsufficientSlots);
        }
        self.slots_remaining -= 1;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A single user's credit record.
///
/// All reads and writes go through the inner mutex, which serializes the
/// read-modify-write of concurrent debits and credits for this user.
#[derive(Debug)]
pub struct UserCredits {
    inner: Mutex<CreditsData>,
}

impl UserCredits {
    pub fn new(user_id: UserId) -> Self {
        Self {
            inner: Mutex::new(CreditsData::new(user_id)),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.inner.lock().user_id
    }

    pub fn slots_remaining(&self) -> u32 {
        self.inner.lock().slots_remaining
    }

    pub fn total_purchased(&self) -> u32 {
        self.inner.lock().total_purchased
    }

    pub fn balance(&self) -> Balance {
        self.inner.lock().balance()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.lock().created_at
    }

    pub fn credit(&self, slots: u32) -> Result<Balance, MarketError> {
        let mut data = self.inner.lock();
        data.credit(slots)?;
        Ok(data.balance())
    }

    pub fn debit(&self) -> Result<Balance, MarketError> {
        let mut data = self.inner.lock();
        data.debit()?;
        Ok(data.balance())
    }
}

impl Serialize for UserCredits {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("UserCredits", 3)?;
        state.serialize_field("user", &data.user_id)?;
        state.serialize_field("slots_remaining", &data.slots_remaining)?;
        state.serialize_field("total_purchased", &data.total_purchased)?;
        state.end()
    }
}

/// Per-user slot balances.
#[derive(Debug, Default)]
pub struct CreditLedger {
    accounts: DashMap<UserId, Arc<UserCredits>>,
}

impl CreditLedger {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    /// Adds `slots` to both `slots_remaining` and `total_purchased`, creating
    /// the record if the user has none yet.
    ///
    /// # Errors
    ///
    /// [`MarketError::PersistenceFailure`] if either counter would overflow;
    /// nothing is written in that case.
    pub fn credit(&self, user_id: UserId, slots: u32) -> Result<Balance, MarketError> {
        // Clone the handle out so the map shard is released before the row lock.
        let account = Arc::clone(
            self.accounts
                .entry(user_id)
                .or_insert_with(|| Arc::new(UserCredits::new(user_id)))
                .value(),
        );
        account.credit(slots)
    }

    /// Spends one slot.
    ///
    /// # Errors
    ///
    /// [`MarketError::InsufficientSlots`] when the balance is zero or the user
    /// has never purchased.
    pub fn debit(&self, user_id: UserId) -> Result<Balance, MarketError> {
        let account = self
            .account(user_id)
            .ok_or(MarketError::InsufficientSlots)?;
        account.debit()
    }

    /// Current balance; zero for users without a record.
    pub fn balance(&self, user_id: UserId) -> Balance {
        self.account(user_id)
            .map(|account| account.balance())
            .unwrap_or_default()
    }

    /// Whether the user can spend a slot right now, and how many they have.
    pub fn has_slots(&self, user_id: UserId) -> (bool, u32) {
        let remaining = self.balance(user_id).slots_remaining;
        (remaining > 0, remaining)
    }

    pub fn account(&self, user_id: UserId) -> Option<Arc<UserCredits>> {
        self.accounts.get(&user_id).map(|r| Arc::clone(r.value()))
    }

    /// All credit records ordered by user id.
    pub fn accounts(&self) -> Vec<Arc<UserCredits>> {
        let mut accounts: Vec<(UserId, Arc<UserCredits>)> = self
            .accounts
            .iter()
            .map(|r| (*r.key(), Arc::clone(r.value())))
            .collect();
        accounts.sort_by_key(|(user_id, _)| *user_id);
        accounts.into_iter().map(|(_, account)| account).collect()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // === CreditsData internals ===

    #[test]
    fn credit_increments_both_counters() {
        let mut data = CreditsData::new(UserId(1));
        data.credit(3).unwrap();
        data.credit(5).unwrap();
        assert_eq!(data.slots_remaining, 8);
        assert_eq!(data.total_purchased, 8);
    }

    #[test]
    fn debit_does_not_touch_total_purchased() {
        let mut data = CreditsData::new(UserId(1));
        data.credit(2).unwrap();
        data.debit().unwrap();
        assert_eq!(data.slots_remaining, 1);
        assert_eq!(data.total_purchased, 2);
    }

    #[test]
    fn debit_at_zero_fails() {
        let mut data = CreditsData::new(UserId(1));
        assert_eq!(data.debit(), Err(MarketError::InsufficientSlots));
        assert_eq!(data.slots_remaining, 0);
    }

    #[test]
    fn overflowing_credit_writes_nothing() {
        let mut data = CreditsData::new(UserId(1));
        data.credit(5).unwrap();
        data.debit().unwrap();
        data.total_purchased = u32::MAX - 1;

        let result = data.credit(5);
        assert!(matches!(result, Err(MarketError::PersistenceFailure(_))));
        assert_eq!(data.slots_remaining, 4);
        assert_eq!(data.total_purchased, u32::MAX - 1);
    }

    // === Ledger ===

    #[test]
    fn balance_of_unknown_user_is_zero() {
        let ledger = CreditLedger::new();
        assert_eq!(ledger.balance(UserId(99)), Balance::default());
        assert!(ledger.is_empty());
    }

    #[test]
    fn debit_unknown_user_is_insufficient() {
        let ledger = CreditLedger::new();
        assert_eq!(ledger.debit(UserId(5)), Err(MarketError::InsufficientSlots));
        // A failed debit never creates a record.
        assert!(ledger.account(UserId(5)).is_none());
    }

    #[test]
    fn credit_creates_record_lazily() {
        let ledger = CreditLedger::new();
        let balance = ledger.credit(UserId(3), 1).unwrap();
        assert_eq!(
            balance,
            Balance {
                slots_remaining: 1,
                total_purchased: 1
            }
        );
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.has_slots(UserId(3)), (true, 1));
    }

    #[test]
    fn accounts_are_ordered_by_user() {
        let ledger = CreditLedger::new();
        ledger.credit(UserId(9), 1).unwrap();
        ledger.credit(UserId(2), 1).unwrap();
        ledger.credit(UserId(5), 1).unwrap();
        let users: Vec<UserId> = ledger.accounts().iter().map(|a| a.user_id()).collect();
        assert_eq!(users, vec![UserId(2), UserId(5), UserId(9)]);
    }

    #[test]
    fn serializer_emits_balance_fields() {
        let account = UserCredits::new(UserId(42));
        account.credit(3).unwrap();
        account.debit().unwrap();

        let json = serde_json::to_string(&account).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["user"], 42);
        assert_eq!(parsed["slots_remaining"], 2);
        assert_eq!(parsed["total_purchased"], 3);
    }
}
