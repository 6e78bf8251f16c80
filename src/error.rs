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

//! Error types for marketplace operations.

use crate::gateway::GatewayError;
use crate::transaction::TransactionStatus;
use thiserror::Error;

/// Marketplace operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    /// No package matches the selection, or it is disabled or sold out
    #[error("package is invalid or not available for purchase")]
    InvalidPackage,

    /// Payout phone number is not in `254XXXXXXXXX` format
    #[error("invalid phone number (expected 254XXXXXXXXX)")]
    InvalidPhoneNumber,

    /// User has no slots left to spend
    #[error("insufficient upload slots")]
    InsufficientSlots,

    /// System-wide daily upload cap has been reached
    #[error("daily upload quota exceeded")]
    QuotaExceeded,

    /// Gateway could not be reached or timed out
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Gateway explicitly declined the request
    #[error("payment gateway rejected the request: {0}")]
    GatewayRejected(String),

    /// Referenced transaction or package does not exist
    #[error("not found")]
    NotFound,

    /// An atomic update could not be committed
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
}

impl MarketError {
    /// Maps the error onto the three-value status surface shown to users.
    ///
    /// Gateway detail is never exposed; only the kind of failure is.
    pub fn user_status(&self) -> (TransactionStatus, &'static str) {
        match self {
            MarketError::GatewayUnavailable(_) => (
                TransactionStatus::Pending,
                "Payment gateway is unavailable, please try again shortly",
            ),
            MarketError::PersistenceFailure(_) => (
                TransactionStatus::Pending,
                "Payment is being processed, please check again shortly",
            ),
            MarketError::InvalidPackage => (
                TransactionStatus::Failed,
                "Selected package is not available",
            ),
            MarketError::InvalidPhoneNumber => (
                TransactionStatus::Failed,
                "Invalid phone number. Format: 254XXXXXXXXX",
            ),
            MarketError::GatewayRejected(_) => {
                (TransactionStatus::Failed, "Payment request was declined")
            }
            MarketError::InsufficientSlots => (
                TransactionStatus::Failed,
                "You have no upload slots left. Please purchase slots to continue",
            ),
            MarketError::QuotaExceeded => (
                TransactionStatus::Failed,
                "The daily upload quota has been exhausted. Please try again tomorrow",
            ),
            MarketError::NotFound => (TransactionStatus::Failed, "Transaction not found"),
        }
    }
}

impl From<GatewayError> for MarketError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unavailable(detail) => MarketError::GatewayUnavailable(detail),
            GatewayError::Rejected(detail) => MarketError::GatewayRejected(detail),
        }
    }
}
