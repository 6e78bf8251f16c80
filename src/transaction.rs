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

//! Purchase transactions.
//!
//! Transactions follow a state machine:
//! - [`Pending`] → [`Completed`] (gateway confirmed the charge)
//! - [`Pending`] → [`Failed`] (gateway declined, cancelled, or answered nonsense)
//!
//! Terminal states never change.
//!
//! [`Pending`]: TransactionStatus::Pending
//! [`Completed`]: TransactionStatus::Completed
//! [`Failed`]: TransactionStatus::Failed

use crate::base::{PackageId, PhoneNumber, Reference, TransactionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Only `pending` may move, and only to a terminal state.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Completed) | (Self::Pending, Self::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One purchase attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    /// Package that funded this purchase; its inventory is decremented on completion.
    pub package_id: PackageId,
    pub amount: Decimal,
    pub currency: String,
    pub slots_purchased: u32,
    pub phone_number: PhoneNumber,
    pub reference: Reference,
    /// Secondary provider identifier, when the gateway issues one.
    pub provider_reference: Option<String>,
    pub status: TransactionStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to persist a new `pending` transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub package_id: PackageId,
    pub amount: Decimal,
    pub currency: String,
    pub slots_purchased: u32,
    pub phone_number: PhoneNumber,
    pub reference: Reference,
    pub provider_reference: Option<String>,
}

impl Transaction {
    pub(crate) fn pending(id: TransactionId, new: NewTransaction) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id: new.user_id,
            package_id: new.package_id,
            amount: new.amount,
            currency: new.currency,
            slots_purchased: new.slots_purchased,
            phone_number: new.phone_number,
            reference: new.reference,
            provider_reference: new.provider_reference,
            status: TransactionStatus::Pending,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Writes a terminal status. Returns `false` (and writes nothing) for any
    /// transition other than `pending → terminal`.
    pub(crate) fn settle(&mut self, next: TransactionStatus, message: Option<String>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.message = message;
        self.updated_at = Utc::now();
        true
    }
}
