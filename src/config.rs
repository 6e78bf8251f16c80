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

//! Startup configuration.
//!
//! Loaded once from YAML and passed into constructors; nothing in the
//! marketplace reads the environment on its own. Every section has defaults,
//! so an empty document is a valid configuration.

use crate::catalog::NewPackage;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default = "default_packages")]
    pub packages: Vec<NewPackage>,
    #[serde(default)]
    pub mpesa: MpesaConfig,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            notifications: NotificationConfig::default(),
            packages: default_packages(),
            mpesa: MpesaConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Events buffered for the notifier before new ones are dropped.
    pub queue_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MpesaEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl MpesaEnvironment {
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Sandbox => "https://sandbox.safaricom.co.ke",
            Self::Production => "https://api.safaricom.co.ke",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpesaConfig {
    pub environment: MpesaEnvironment,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    /// Provider callback; the provider requires one even when only polling is used.
    pub callback_url: String,
    pub account_reference: String,
    pub auth_timeout_secs: u64,
    pub initiate_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl MpesaConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn initiate_timeout(&self) -> Duration {
        Duration::from_secs(self.initiate_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            environment: MpesaEnvironment::Sandbox,
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: String::new(),
            passkey: String::new(),
            callback_url: "https://example.com/callback".to_string(),
            account_reference: "Checkmate".to_string(),
            auth_timeout_secs: 10,
            initiate_timeout_secs: 30,
            query_timeout_secs: 10,
        }
    }
}

fn features(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_packages() -> Vec<NewPackage> {
    vec![
        NewPackage {
            name: "1 Slot".to_string(),
            price: dec!(100),
            currency: "KSH".to_string(),
            slots: 1,
            features: features(&[
                "1 Document Check",
                "AI Detection",
                "Plagiarism Scan",
                "Instant Results",
            ]),
            unavailable: false,
            highlight: false,
            offer: None,
            available_slots: 100,
        },
        NewPackage {
            name: "3 Slots".to_string(),
            price: dec!(250),
            currency: "KSH".to_string(),
            slots: 3,
            features: features(&[
                "3 Document Checks",
                "AI Detection",
                "Plagiarism Scan",
                "Best Value",
            ]),
            unavailable: false,
            highlight: true,
            offer: Some("POPULAR".to_string()),
            available_slots: 100,
        },
        NewPackage {
            name: "5 Slots".to_string(),
            price: dec!(480),
            currency: "KSH".to_string(),
            slots: 5,
            features: features(&[
                "5 Document Checks",
                "AI Detection",
                "Plagiarism Scan",
                "Priority Support",
            ]),
            unavailable: true,
            highlight: false,
            offer: None,
            available_slots: 100,
        },
    ]
}

impl MarketConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }
}
