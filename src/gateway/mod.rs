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

//! Payment gateway capability.
//!
//! The marketplace talks to payment providers only through [`GatewayAdapter`].
//! Adapters own authentication, wire encoding and response parsing, and hand
//! back a [`Verification`] whose [`GatewayStatus`] is one of four buckets. The
//! reconciliation logic never looks at provider payloads beyond that.

pub mod mpesa;
pub mod scripted;

use crate::base::{PackageId, PhoneNumber, Reference, UserId};
use rust_decimal::Decimal;
use thiserror::Error;

pub use mpesa::MpesaGateway;
pub use scripted::ScriptedGateway;

/// Failures talking to a gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network error, timeout, or failed provider authentication
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The provider answered and declined
    #[error("gateway rejected: {0}")]
    Rejected(String),
}

/// Context forwarded to the provider with a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeMetadata {
    pub user_id: UserId,
    pub package_id: PackageId,
    pub slots: u32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeRequest {
    pub amount: Decimal,
    pub currency: String,
    pub payout_phone: PhoneNumber,
    pub metadata: ChargeMetadata,
}

/// What the provider hands back when it accepts a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub reference: Reference,
    pub provider_reference: Option<String>,
    pub customer_message: Option<String>,
}

/// Outcome of a charge as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    /// Money captured.
    Success,
    /// Declined, cancelled, or otherwise finished without capture.
    Failure { reason: Option<String> },
    /// Not decided yet; ask again later.
    Processing,
    /// The provider answered with something that could not be interpreted.
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub status: GatewayStatus,
    /// Captured amount, when the provider reports one.
    pub amount: Option<Decimal>,
    /// Provider payload, kept for logging only.
    pub raw: String,
}

impl Verification {
    pub fn new(status: GatewayStatus, raw: impl Into<String>) -> Self {
        Self {
            status,
            amount: None,
            raw: raw.into(),
        }
    }
}

/// A payment provider.
///
/// Implementations must bound every network call with a timeout and report
/// it as [`GatewayError::Unavailable`]; callers rely on `verify` returning.
pub trait GatewayAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts a charge and returns the provider's reference for it.
    fn initiate_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError>;

    /// Asks the provider for the current state of a charge.
    fn verify(&self, reference: &Reference) -> Result<Verification, GatewayError>;
}
