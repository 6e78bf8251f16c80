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

//! M-Pesa STK push adapter.
//!
//! Charges are started with an STK push (the customer gets a PIN prompt on
//! their phone) and checked with the STK push query API. Every call fetches a
//! client-credentials OAuth token first and carries its own timeout.
//!
//! # Query result mapping
//!
//! | Provider answer | Status |
//! |-----------------|--------|
//! | HTML body (WAF page) or invalid JSON | `Unrecognized` |
//! | `errorCode` present (e.g. 500.001.1001, still being processed) | `Processing` |
//! | `fault` present (spike arrest) | `Processing` |
//! | `ResultCode` 0 | `Success` |
//! | `ResultCode` 1037 (no answer from handset yet) | `Processing` |
//! | `ResultCode` 1032 | `Failure` ("Transaction cancelled") |
//! | any other `ResultCode` | `Failure` (with `ResultDesc`) |
//! | no `ResultCode`, `ResponseCode` 0 | `Processing` |
//! | anything else | `Unrecognized` |

use super::{
    ChargeReceipt, ChargeRequest, GatewayAdapter, GatewayError, GatewayStatus, Verification,
};
use crate::base::Reference;
use crate::config::MpesaConfig;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Local;
use reqwest::blocking::Client;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const RESULT_SUCCESS: &str = "0";
const RESULT_CANCELLED: &str = "1032";
const RESULT_AWAITING_USER: &str = "1037";

const TOKEN_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: u64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    call_back_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryRequest<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

pub struct MpesaGateway {
    config: MpesaConfig,
    client: Client,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(config.auth_timeout())
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.environment.base_url(), path)
    }

    fn access_token(&self) -> Result<String, GatewayError> {
        let response = self
            .client
            .get(self.url(TOKEN_PATH))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .timeout(self.config.auth_timeout())
            .send()
            .map_err(|e| GatewayError::Unavailable(format!("auth request: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| GatewayError::Unavailable(format!("auth response: {e}")))?;
        if !status.is_success() {
            return Err(GatewayError::Unavailable(format!(
                "auth failed with status {status}: {body}"
            )));
        }

        serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("access_token").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| GatewayError::Unavailable("auth response without access_token".into()))
    }

    /// Provider password: base64 of shortcode, passkey and timestamp.
    fn password(&self, timestamp: &str) -> String {
        STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        token: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<String, GatewayError> {
        // Error answers arrive with non-2xx statuses and JSON bodies that the
        // parsers below understand, so the status code is not checked here.
        self.client
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .timeout(timeout)
            .send()
            .and_then(|response| response.text())
            .map_err(|e| GatewayError::Unavailable(e.to_string()))
    }
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// Reads a code that the provider sends either as a string or as a number.
fn code_field(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(code) => Some(code.clone()),
        Value::Number(n) => n
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| n.as_f64().map(|v| format!("{v:.0}"))),
        _ => None,
    }
}

fn string_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Interprets an STK push response.
pub fn parse_initiation(body: &str) -> Result<ChargeReceipt, GatewayError> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| GatewayError::Unavailable(format!("unreadable initiation response: {e}")))?;

    if code_field(&parsed, "ResponseCode").as_deref() != Some("0") {
        let message = string_field(&parsed, "CustomerMessage")
            .or_else(|| string_field(&parsed, "errorMessage"))
            .unwrap_or_else(|| "request rejected".to_string());
        return Err(GatewayError::Rejected(message));
    }

    let reference = string_field(&parsed, "CheckoutRequestID").ok_or_else(|| {
        GatewayError::Unavailable("initiation response without CheckoutRequestID".into())
    })?;

    Ok(ChargeReceipt {
        reference: Reference::new(reference),
        provider_reference: string_field(&parsed, "MerchantRequestID"),
        customer_message: string_field(&parsed, "CustomerMessage"),
    })
}

/// Interprets an STK push query response.
pub fn interpret_query_response(body: &str) -> Verification {
    if body.trim_start().starts_with('<') {
        return Verification::new(GatewayStatus::Unrecognized, body);
    }
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return Verification::new(GatewayStatus::Unrecognized, body);
    };
    if !parsed.is_object() {
        return Verification::new(GatewayStatus::Unrecognized, body);
    }

    // API-level errors (query sent too early, gateway hiccups) and spike
    // arrest faults say nothing about the payment itself.
    if let Some(code) = parsed.get("errorCode").and_then(Value::as_str) {
        debug!(error_code = code, "STK query answered with an API error");
        return Verification::new(GatewayStatus::Processing, body);
    }

    if parsed.get("fault").is_some() {
        return Verification::new(GatewayStatus::Processing, body);
    }

    let status = match code_field(&parsed, "ResultCode").as_deref() {
        Some(RESULT_SUCCESS) => GatewayStatus::Success,
        Some(RESULT_AWAITING_USER) => GatewayStatus::Processing,
        Some(RESULT_CANCELLED) => GatewayStatus::Failure {
            reason: Some("Transaction cancelled".to_string()),
        },
        Some(_) => GatewayStatus::Failure {
            reason: string_field(&parsed, "ResultDesc"),
        },
        None if code_field(&parsed, "ResponseCode").as_deref() == Some("0") => {
            GatewayStatus::Processing
        }
        None => GatewayStatus::Unrecognized,
    };
    Verification::new(status, body)
}

impl GatewayAdapter for MpesaGateway {
    fn name(&self) -> &'static str {
        "mpesa"
    }

    fn initiate_charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        // The provider only takes whole currency units.
        let amount = Some(request.amount)
            .filter(|amount| amount.fract().is_zero())
            .and_then(|amount| amount.to_u64())
            .filter(|amount| *amount > 0)
            .ok_or_else(|| {
                GatewayError::Rejected("amount must be a positive whole number".into())
            })?;

        let token = self.access_token()?;
        let timestamp = timestamp();
        let phone = request.payout_phone.as_str();
        let push = StkPushRequest {
            business_short_code: &self.config.shortcode,
            password: self.password(&timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount,
            party_a: phone,
            party_b: &self.config.shortcode,
            phone_number: phone,
            call_back_url: &self.config.callback_url,
            account_reference: &self.config.account_reference,
            transaction_desc: &request.metadata.description,
        };

        let body = self.post(STK_PUSH_PATH, &token, &push, self.config.initiate_timeout())?;
        debug!(user_id = %request.metadata.user_id, response = %body, "STK push response");
        parse_initiation(&body)
    }

    fn verify(&self, reference: &Reference) -> Result<Verification, GatewayError> {
        let token = self.access_token()?;
        let timestamp = timestamp();
        let query = StkQueryRequest {
            business_short_code: &self.config.shortcode,
            password: self.password(&timestamp),
            timestamp,
            checkout_request_id: reference.as_str(),
        };

        let body = self.post(STK_QUERY_PATH, &token, &query, self.config.query_timeout())?;
        let verification = interpret_query_response(&body);
        if verification.status == GatewayStatus::Unrecognized {
            warn!(reference = %reference, response = %body, "unrecognized STK query response");
        }
        Ok(verification)
    }
}
