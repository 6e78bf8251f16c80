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

//! # Slot Ledger
//!
//! Turns mobile-money payments into upload credits. Users buy packages of
//! upload slots, pay through an external gateway, and spend one slot per
//! document upload, subject to a system-wide daily cap.
//!
//! ## Core Components
//!
//! - [`Engine`]: Purchase initiation and idempotent reconciliation
//! - [`PackageCatalog`]: Purchasable packages with inventory
//! - [`CreditLedger`]: Per-user slot balances
//! - [`UploadQuota`]: Daily system-wide upload counters
//! - [`GatewayAdapter`]: Payment provider capability ([`MpesaGateway`], [`ScriptedGateway`])
//! - [`MarketError`]: Error types for marketplace operations
//!
//! ## Example
//!
//! ```
//! use slot_ledger_rs::{
//!     Engine, GatewayStatus, LogNotifier, MarketConfig, PackageSelector, ScriptedGateway,
//!     TransactionStatus, UserId,
//! };
//! use std::sync::Arc;
//!
//! let gateway = Arc::new(ScriptedGateway::new());
//! let engine =
//!     Engine::from_config(&MarketConfig::default(), gateway.clone(), Arc::new(LogNotifier))
//!         .unwrap();
//!
//! // Buy the 3-slot package
//! let tx = engine
//!     .initiate(UserId(7), PackageSelector::Slots(3), "254712345678")
//!     .unwrap();
//! assert_eq!(tx.status, TransactionStatus::Pending);
//!
//! // The provider confirms; reconciling credits the slots once
//! gateway.set_status(tx.reference.clone(), GatewayStatus::Success);
//! engine.reconcile(&tx.reference).unwrap();
//! engine.reconcile(&tx.reference).unwrap();
//! assert_eq!(engine.balance(UserId(7)).slots_remaining, 3);
//! ```
//!
//! ## Thread Safety
//!
//! Every store is a [`dashmap::DashMap`] of individually locked records, so
//! operations on different users, packages or references run in parallel.
//! Reconciliation of one reference is serialized by its row lock.

mod base;
pub mod catalog;
pub mod config;
pub mod credits;
mod engine;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod quota;
mod transaction;
mod transaction_store;

pub use base::{PackageId, PhoneNumber, Reference, TransactionId, UserId};
pub use catalog::{NewPackage, PackageCatalog, PackageSelector, PackageUpdate, PricingPackage};
pub use config::{MarketConfig, MpesaConfig};
pub use credits::{Balance, CreditLedger, UserCredits};
pub use engine::{Engine, Reconciliation, UploadAdmission};
pub use error::MarketError;
pub use gateway::{
    ChargeReceipt, ChargeRequest, GatewayAdapter, GatewayError, GatewayStatus, MpesaGateway,
    ScriptedGateway, Verification,
};
pub use notify::{LogNotifier, Notifier, PaymentEvent};
pub use quota::{DailyUploadCounter, UploadQuota};
pub use transaction::{Transaction, TransactionStatus};
pub use transaction_store::TransactionStore;
