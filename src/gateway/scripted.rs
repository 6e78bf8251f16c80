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

//! In-memory gateway driven by a script.
//!
//! Used by the simulator binary and by tests. Initiations consume queued
//! outcomes (falling back to generated `SIM-<n>` references); `verify` reports
//! whatever status was last set for the reference, `Processing` by default.

use super::{
    ChargeReceipt, ChargeRequest, GatewayAdapter, GatewayError, GatewayStatus, Verification,
};
use crate::base::Reference;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
enum Initiation {
    Accept(Reference),
    Reject(String),
    Unavailable(String),
}

#[derive(Debug, Default)]
pub struct ScriptedGateway {
    initiations: Mutex<VecDeque<Initiation>>,
    outcomes: DashMap<Reference, Result<Verification, GatewayError>>,
    charges: DashMap<Reference, ChargeRequest>,
    sequence: AtomicU64,
    verify_calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next accepted charge gets `reference`.
    pub fn queue_reference(&self, reference: impl Into<Reference>) {
        self.initiations
            .lock()
            .push_back(Initiation::Accept(reference.into()));
    }

    /// The next initiation is declined by the provider.
    pub fn queue_rejection(&self, message: impl Into<String>) {
        self.initiations
            .lock()
            .push_back(Initiation::Reject(message.into()));
    }

    /// The next initiation fails to reach the provider.
    pub fn queue_unavailable(&self, message: impl Into<String>) {
        self.initiations
            .lock()
            .push_back(Initiation::Unavailable(message.into()));
    }

    /// Sets what `verify` reports for `reference` from now on.
    pub fn set_status(&self, reference: impl Into<Reference>, status: GatewayStatus) {
        let reference = reference.into();
        let amount = match status {
            GatewayStatus::Success => self.charges.get(&reference).map(|c| c.amount),
            _ => None,
        };
        let verification = Verification {
            raw: format!("{status:?}"),
            status,
            amount,
        };
        self.outcomes.insert(reference, Ok(verification));
    }

    /// `verify` answers with an uninterpretable payload.
    pub fn set_unrecognized(&self, reference: impl Into<Reference>, raw: impl Into<String>) {
        self.outcomes.insert(
            reference.into(),
            Ok(Verification::new(GatewayStatus::Unrecognized, raw)),
        );
    }

    /// `verify` fails as if the provider could not be reached.
    pub fn set_unavailable(&self, reference: impl Into<Reference>, message: impl Into<String>) {
        self.outcomes
            .insert(reference.into(), Err(GatewayError::Unavailable(message.into())));
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// The request recorded for an accepted charge.
    pub fn charge(&self, reference: &Reference) -> Option<ChargeRequest> {
        self.charges.get(reference).map(|c| c.value().clone())
    }
}

impl GatewayAdapter for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn initiate_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        let scripted = self.initiations.lock().pop_front();
        let reference = match scripted {
            Some(Initiation::Reject(message)) => return Err(GatewayError::Rejected(message)),
            Some(Initiation::Unavailable(message)) => {
                return Err(GatewayError::Unavailable(message));
            }
            Some(Initiation::Accept(reference)) => reference,
            None => {
                let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                Reference::new(format!("SIM-{n}"))
            }
        };
        self.charges.insert(reference.clone(), request.clone());
        Ok(ChargeReceipt {
            reference,
            provider_reference: None,
            customer_message: Some("Enter M-Pesa PIN".to_string()),
        })
    }

    fn verify(&self, reference: &Reference) -> Result<Verification, GatewayError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        match self.outcomes.get(reference) {
            Some(outcome) => outcome.value().clone(),
            None => Ok(Verification::new(GatewayStatus::Processing, "")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{PackageId, PhoneNumber, UserId};
    use crate::gateway::ChargeMetadata;
    use rust_decimal_macros::dec;

    fn request() -> ChargeRequest {
        ChargeRequest {
            amount: dec!(100),
            currency: "KSH".to_string(),
            payout_phone: PhoneNumber::parse("254700000001").unwrap(),
            metadata: ChargeMetadata {
                user_id: UserId(1),
                package_id: PackageId(1),
                slots: 1,
                description: "Buy 1 Slots".to_string(),
            },
        }
    }

    #[test]
    fn generates_references_when_nothing_is_queued() {
        let gateway = ScriptedGateway::new();
        let first = gateway.initiate_charge(&request()).unwrap();
        let second = gateway.initiate_charge(&request()).unwrap();
        assert_eq!(first.reference.as_str(), "SIM-1");
        assert_eq!(second.reference.as_str(), "SIM-2");
    }

    #[test]
    fn queued_outcomes_are_consumed_in_order() {
        let gateway = ScriptedGateway::new();
        gateway.queue_rejection("invalid msisdn");
        gateway.queue_unavailable("timeout");
        gateway.queue_reference("ws_CO_1");

        assert_eq!(
            gateway.initiate_charge(&request()),
            Err(GatewayError::Rejected("invalid msisdn".into()))
        );
        assert_eq!(
            gateway.initiate_charge(&request()),
            Err(GatewayError::Unavailable("timeout".into()))
        );
        let receipt = gateway.initiate_charge(&request()).unwrap();
        assert_eq!(receipt.reference.as_str(), "ws_CO_1");
        assert!(gateway.charge(&receipt.reference).is_some());
    }

    #[test]
    fn verify_defaults_to_processing_and_counts_calls() {
        let gateway = ScriptedGateway::new();
        let reference = Reference::from("unknown");
        assert_eq!(
            gateway.verify(&reference).unwrap().status,
            GatewayStatus::Processing
        );
        gateway.set_unavailable("unknown", "dns");
        assert!(gateway.verify(&reference).is_err());
        assert_eq!(gateway.verify_calls(), 2);
    }

    #[test]
    fn success_reports_charged_amount() {
        let gateway = ScriptedGateway::new();
        let receipt = gateway.initiate_charge(&request()).unwrap();
        gateway.set_status(receipt.reference.clone(), GatewayStatus::Success);
        let verification = gateway.verify(&receipt.reference).unwrap();
        assert_eq!(verification.status, GatewayStatus::Success);
        assert_eq!(verification.amount, Some(dec!(100)));
    }
}
