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

//! Reconciliation engine.
//!
//! The [`Engine`] owns the package catalog, the credit ledger, the daily
//! upload quota and the transaction store, and drives purchases through the
//! payment gateway.
//!
//! # Purchase lifecycle
//!
//! - **Initiate**: pick a purchasable package, start a charge with the gateway,
//!   record a `pending` transaction under the gateway's reference.
//! - **Reconcile**: ask the gateway how the charge went and, once it has an
//!   answer, move the transaction to `completed` or `failed`. Completion credits
//!   the user's slots and takes one unit of package inventory.
//!
//! # Idempotency
//!
//! Reconciliation can be triggered by a webhook, a user poll and an admin at
//! the same time. A terminal transaction is returned as-is without calling the
//! gateway. The terminal write happens under the transaction's row lock after
//! re-reading its status, so only the first reconciler to get there applies the
//! credit; the others observe the terminal state and return it.
//!
//! # Lock order
//!
//! transaction row → user credits → package. Debits take only the user
//! credits lock and inventory updates only the package lock, so no cycle exists.

use crate::MarketError;
use crate::base::{PhoneNumber, Reference, UserId};
use crate::catalog::{PackageCatalog, PackageSelector, PricingPackage};
use crate::config::MarketConfig;
use crate::credits::{Balance, CreditLedger};
use crate::gateway::{ChargeMetadata, ChargeRequest, GatewayAdapter, GatewayStatus};
use crate::notify::{NotificationDispatcher, Notifier, PaymentEvent};
use crate::quota::{DailyUploadCounter, UploadQuota};
use crate::transaction::{NewTransaction, Transaction, TransactionStatus};
use crate::transaction_store::{TransactionRow, TransactionStore};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const UNRECOGNIZED_RESPONSE: &str = "Invalid response from payment gateway";
const GENERIC_FAILURE: &str = "Transaction failed";

/// Result of a reconciliation, in the three-value form shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub reference: Reference,
    pub status: TransactionStatus,
    /// Slots this purchase granted; zero unless completed.
    pub slots_added: u32,
    pub message: String,
}

impl Reconciliation {
    fn from_transaction(transaction: &Transaction) -> Self {
        let (slots_added, message) = match transaction.status {
            TransactionStatus::Completed => (
                transaction.slots_purchased,
                format!("Payment completed, {} slots added", transaction.slots_purchased),
            ),
            TransactionStatus::Failed => (
                0,
                transaction
                    .message
                    .clone()
                    .unwrap_or_else(|| GENERIC_FAILURE.to_string()),
            ),
            TransactionStatus::Pending => (0, "Waiting for payment confirmation".to_string()),
        };
        Self {
            reference: transaction.reference.clone(),
            status: transaction.status,
            slots_added,
            message,
        }
    }

    fn pending(transaction: &Transaction, message: &str) -> Self {
        Self {
            reference: transaction.reference.clone(),
            status: TransactionStatus::Pending,
            slots_added: 0,
            message: message.to_string(),
        }
    }
}

/// Outcome of an accepted upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UploadAdmission {
    pub daily_remaining: u32,
    pub slots_remaining: u32,
}

/// Payment-to-credit reconciliation engine.
///
/// # Invariants
///
/// - A transaction only moves `pending → completed` or `pending → failed`.
/// - A reference credits the ledger at most once.
/// - `slots_remaining` and `available_slots` never go below zero.
pub struct Engine {
    catalog: PackageCatalog,
    ledger: CreditLedger,
    quota: UploadQuota,
    transactions: TransactionStore,
    gateway: Arc<dyn GatewayAdapter>,
    notifications: NotificationDispatcher,
}

impl Engine {
    /// Creates an engine with an empty catalog.
    pub fn new(
        gateway: Arc<dyn GatewayAdapter>,
        notifier: Arc<dyn Notifier>,
        notification_capacity: usize,
    ) -> Self {
        Engine {
            catalog: PackageCatalog::new(),
            ledger: CreditLedger::new(),
            quota: UploadQuota::new(),
            transactions: TransactionStore::new(),
            gateway,
            notifications: NotificationDispatcher::new(notifier, notification_capacity),
        }
    }

    /// Creates an engine and seeds the catalog with the configured packages.
    pub fn from_config(
        config: &MarketConfig,
        gateway: Arc<dyn GatewayAdapter>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, MarketError> {
        let engine = Self::new(gateway, notifier, config.notifications.queue_capacity);
        let seeded = engine.catalog.seed(&config.packages)?;
        info!(seeded, gateway = engine.gateway.name(), "engine ready");
        Ok(engine)
    }

    pub fn catalog(&self) -> &PackageCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn quota(&self) -> &UploadQuota {
        &self.quota
    }

    pub fn find_purchasable(
        &self,
        selector: PackageSelector,
    ) -> Result<PricingPackage, MarketError> {
        self.catalog.find_purchasable(selector)
    }

    /// Starts a purchase.
    ///
    /// # Errors
    ///
    /// - [`MarketError::InvalidPackage`] - Nothing purchasable matches `selector`.
    /// - [`MarketError::InvalidPhoneNumber`] - `payout_phone` is not `254XXXXXXXXX`.
    /// - [`MarketError::GatewayUnavailable`] - The gateway could not be reached.
    /// - [`MarketError::GatewayRejected`] - The gateway declined the charge.
    /// - [`MarketError::PersistenceFailure`] - The gateway reused a known reference.
    pub fn initiate(
        &self,
        user_id: UserId,
        selector: PackageSelector,
        payout_phone: &str,
    ) -> Result<Transaction, MarketError> {
        let package = self.catalog.find_purchasable(selector)?;
        let phone = PhoneNumber::parse(payout_phone).ok_or(MarketError::InvalidPhoneNumber)?;

        let request = ChargeRequest {
            amount: package.price,
            currency: package.currency.clone(),
            payout_phone: phone.clone(),
            metadata: ChargeMetadata {
                user_id,
                package_id: package.id,
                slots: package.slots,
                description: format!("Buy {} Slots", package.slots),
            },
        };
        let receipt = self.gateway.initiate_charge(&request).map_err(|e| {
            warn!(%user_id, package_id = %package.id, error = %e, "charge initiation failed");
            MarketError::from(e)
        })?;

        let transaction = self.transactions.insert(NewTransaction {
            user_id,
            package_id: package.id,
            amount: package.price,
            currency: package.currency,
            slots_purchased: package.slots,
            phone_number: phone,
            reference: receipt.reference,
            provider_reference: receipt.provider_reference,
        })?;

        info!(
            %user_id,
            reference = %transaction.reference,
            package_id = %transaction.package_id,
            amount = %transaction.amount,
            "purchase initiated"
        );
        Ok(transaction)
    }

    /// Brings the transaction for `reference` up to date with the gateway.
    ///
    /// Safe to call any number of times, concurrently. Terminal transactions
    /// are returned without contacting the gateway. A gateway that cannot be
    /// reached leaves the transaction pending.
    ///
    /// # Errors
    ///
    /// - [`MarketError::NotFound`] - Unknown reference.
    /// - [`MarketError::PersistenceFailure`] - The terminal update could not be
    ///   applied; nothing was written and the transaction stays pending.
    pub fn reconcile(&self, reference: &Reference) -> Result<Reconciliation, MarketError> {
        let row = self
            .transactions
            .row(reference)
            .ok_or(MarketError::NotFound)?;
        self.reconcile_row(&row)
    }

    /// Like [`Engine::reconcile`], but only for the transaction's owner.
    /// Someone else's reference is reported as [`MarketError::NotFound`].
    pub fn reconcile_for_user(
        &self,
        user_id: UserId,
        reference: &Reference,
    ) -> Result<Reconciliation, MarketError> {
        let row = self
            .transactions
            .row(reference)
            .ok_or(MarketError::NotFound)?;
        if row.lock().user_id != user_id {
            return Err(MarketError::NotFound);
        }
        self.reconcile_row(&row)
    }

    fn reconcile_row(&self, row: &TransactionRow) -> Result<Reconciliation, MarketError> {
        let snapshot = row.lock().clone();
        if snapshot.status.is_terminal() {
            debug!(reference = %snapshot.reference, status = %snapshot.status, "already settled");
            return Ok(Reconciliation::from_transaction(&snapshot));
        }

        // The gateway call happens without any lock held.
        let verification = match self.gateway.verify(&snapshot.reference) {
            Ok(verification) => verification,
            Err(e) => {
                warn!(reference = %snapshot.reference, error = %e, "verification failed, leaving pending");
                let (_, message) = MarketError::from(e).user_status();
                return Ok(Reconciliation::pending(&snapshot, message));
            }
        };

        if let Some(amount) = verification.amount {
            if amount != snapshot.amount {
                warn!(
                    reference = %snapshot.reference,
                    expected = %snapshot.amount,
                    reported = %amount,
                    "gateway reported a different amount"
                );
            }
        }

        let (next, message) = match verification.status {
            GatewayStatus::Processing => {
                debug!(reference = %snapshot.reference, "still processing");
                return Ok(Reconciliation::from_transaction(&snapshot));
            }
            GatewayStatus::Success => (TransactionStatus::Completed, None),
            GatewayStatus::Failure { reason } => (
                TransactionStatus::Failed,
                Some(reason.unwrap_or_else(|| GENERIC_FAILURE.to_string())),
            ),
            GatewayStatus::Unrecognized => {
                warn!(reference = %snapshot.reference, raw = %verification.raw, "unrecognized gateway response, failing");
                (TransactionStatus::Failed, Some(UNRECOGNIZED_RESPONSE.to_string()))
            }
        };

        let (settled, applied) = self.settle(row, next, message).inspect_err(|e| {
            error!(reference = %snapshot.reference, error = %e, "terminal update aborted");
        })?;
        if applied {
            self.announce(&settled);
        }
        Ok(Reconciliation::from_transaction(&settled))
    }

    /// Applies a terminal transition as one unit under the row lock.
    ///
    /// Returns the transaction as it stands afterwards and whether this call
    /// was the one that moved it. The ledger credit is the only step that can
    /// fail and runs first; inventory and status writes cannot fail.
    fn settle(
        &self,
        row: &TransactionRow,
        next: TransactionStatus,
        message: Option<String>,
    ) -> Result<(Transaction, bool), MarketError> {
        let mut transaction = row.lock();

        // Second check: another reconciler may have won while we were
        // talking to the gateway.
        if transaction.status.is_terminal() {
            debug!(reference = %transaction.reference, status = %transaction.status, "lost settle race");
            return Ok((transaction.clone(), false));
        }

        if next == TransactionStatus::Completed {
            let balance = self
                .ledger
                .credit(transaction.user_id, transaction.slots_purchased)?;
            // Inventory is soft: money already captured is always credited.
            if !self.catalog.decrement_inventory(transaction.package_id) {
                warn!(
                    reference = %transaction.reference,
                    package_id = %transaction.package_id,
                    "package sold out or removed before confirmation, credited anyway"
                );
            }
            info!(
                reference = %transaction.reference,
                user_id = %transaction.user_id,
                slots = transaction.slots_purchased,
                slots_remaining = balance.slots_remaining,
                "payment completed"
            );
        } else {
            info!(
                reference = %transaction.reference,
                user_id = %transaction.user_id,
                message = message.as_deref().unwrap_or(""),
                "payment failed"
            );
        }

        transaction.settle(next, message);
        Ok((transaction.clone(), true))
    }

    fn announce(&self, transaction: &Transaction) {
        let event = match transaction.status {
            TransactionStatus::Completed => PaymentEvent::Completed {
                user_id: transaction.user_id,
                reference: transaction.reference.clone(),
                slots: transaction.slots_purchased,
            },
            TransactionStatus::Failed => PaymentEvent::Failed {
                user_id: transaction.user_id,
                reference: transaction.reference.clone(),
                message: transaction.message.clone(),
            },
            TransactionStatus::Pending => return,
        };
        self.notifications.dispatch(event);
    }

    /// Current balance; zero for users who never purchased.
    pub fn balance(&self, user_id: UserId) -> Balance {
        self.ledger.balance(user_id)
    }

    /// Spends one of the user's slots.
    pub fn debit(&self, user_id: UserId) -> Result<Balance, MarketError> {
        self.ledger.debit(user_id)
    }

    /// Reserves one upload against today's system-wide cap.
    pub fn try_reserve_daily_slot(&self) -> Result<DailyUploadCounter, MarketError> {
        self.quota.try_reserve_daily_slot()
    }

    /// Gates an upload: system quota first, then the user's balance.
    ///
    /// If the user has no slots the daily reservation is kept, not returned.
    ///
    /// # Errors
    ///
    /// - [`MarketError::QuotaExceeded`] - Today's cap is reached (or unset).
    /// - [`MarketError::InsufficientSlots`] - The user has no slots left.
    pub fn admit_upload(&self, user_id: UserId) -> Result<UploadAdmission, MarketError> {
        self.admit_upload_on(UploadQuota::today(), user_id)
    }

    pub fn admit_upload_on(
        &self,
        date: NaiveDate,
        user_id: UserId,
    ) -> Result<UploadAdmission, MarketError> {
        let counter = self.quota.try_reserve_on(date)?;
        let balance = self.ledger.debit(user_id).inspect_err(|e| {
            debug!(%user_id, %date, error = %e, "upload denied after daily reservation");
        })?;
        Ok(UploadAdmission {
            daily_remaining: counter.remaining(),
            slots_remaining: balance.slots_remaining,
        })
    }

    pub fn transaction(&self, reference: &Reference) -> Option<Transaction> {
        self.transactions.get(reference)
    }

    /// Every transaction, newest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions.list()
    }
}
