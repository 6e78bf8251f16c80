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

use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use serde::Deserialize;
use slot_ledger_rs::logging::init_logging;
use slot_ledger_rs::{
    Engine, GatewayStatus, LogNotifier, MarketConfig, MarketError, PackageSelector, Reference,
    ScriptedGateway, UserId,
};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Payer number used for every simulated purchase.
const SIMULATED_PAYER: &str = "254700000000";

/// Slot Ledger simulator - replay purchase and upload scenarios
///
/// Reads a scenario CSV, drives it against an in-memory payment gateway and
/// writes the resulting per-user credit balances to stdout.
#[derive(Parser, Debug)]
#[command(name = "slot-ledger")]
#[command(
    about = "Replays payment and upload scenarios against the slot ledger",
    long_about = None
)]
struct Args {
    /// Path to scenario CSV
    ///
    /// Expected format: type,user,reference,value
    /// Example: slot-ledger scenario.csv > credits.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// YAML configuration (packages, logging, notifications)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match MarketConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                process::exit(1);
            }
        },
        None => MarketConfig::default(),
    };
    init_logging(&config.log);

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let gateway = Arc::new(ScriptedGateway::new());
    let engine = match Engine::from_config(&config, gateway.clone(), Arc::new(LogNotifier)) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error seeding packages: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_scenario(&engine, &gateway, BufReader::new(file)) {
        eprintln!("Error processing scenario: {}", e);
        process::exit(1);
    }

    if let Err(e) = write_credits(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the scenario format.
///
/// Fields: `type, user, reference, value`
#[derive(Debug, Deserialize)]
struct ScenarioRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    user: Option<u32>,
    reference: Option<String>,
    value: Option<String>,
}

/// What the provider will answer for a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Settlement {
    Status(GatewayStatus),
    Unrecognized,
    Unavailable,
}

impl Settlement {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "success" => Some(Self::Status(GatewayStatus::Success)),
            "failure" => Some(Self::Status(GatewayStatus::Failure { reason: None })),
            "cancelled" => Some(Self::Status(GatewayStatus::Failure {
                reason: Some("Transaction cancelled".to_string()),
            })),
            "processing" => Some(Self::Status(GatewayStatus::Processing)),
            "unrecognized" => Some(Self::Unrecognized),
            "unavailable" => Some(Self::Unavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// Set today's system-wide upload cap.
    Limit(u32),
    Purchase {
        user_id: UserId,
        reference: Reference,
        slots: u32,
    },
    /// Decide the provider's answer for a reference; nothing is reconciled.
    Settle {
        reference: Reference,
        settlement: Settlement,
    },
    Poll {
        user_id: UserId,
        reference: Reference,
    },
    Upload {
        user_id: UserId,
    },
}

impl ScenarioRecord {
    /// Returns `None` for unknown types or missing required fields.
    fn into_step(self) -> Option<Step> {
        let user_id = self.user.map(UserId);
        let reference = self.reference.filter(|r| !r.is_empty()).map(Reference::new);

        match self.kind.to_lowercase().as_str() {
            "limit" => Some(Step::Limit(self.value?.parse().ok()?)),
            "purchase" => Some(Step::Purchase {
                user_id: user_id?,
                reference: reference?,
                slots: self.value?.parse().ok()?,
            }),
            "settle" => Some(Step::Settle {
                reference: reference?,
                settlement: Settlement::parse(&self.value?)?,
            }),
            "poll" => Some(Step::Poll {
                user_id: user_id?,
                reference: reference?,
            }),
            "upload" => Some(Step::Upload { user_id: user_id? }),
            _ => None,
        }
    }
}

fn apply(engine: &Engine, gateway: &ScriptedGateway, step: Step) -> Result<(), MarketError> {
    match step {
        Step::Limit(max_uploads) => {
            let counter = engine.quota().set_max_uploads(max_uploads);
            info!(date = %counter.date, max_uploads, "daily limit set");
        }
        Step::Purchase {
            user_id,
            reference,
            slots,
        } => {
            let selector = PackageSelector::Slots(slots);
            // Only queue the reference for a charge that will reach the gateway.
            engine.find_purchasable(selector)?;
            gateway.queue_reference(reference);
            engine.initiate(user_id, selector, SIMULATED_PAYER)?;
        }
        Step::Settle {
            reference,
            settlement,
        } => match settlement {
            Settlement::Status(status) => gateway.set_status(reference, status),
            Settlement::Unrecognized => gateway.set_unrecognized(reference, "<html>"),
            Settlement::Unavailable => gateway.set_unavailable(reference, "connection reset"),
        },
        Step::Poll { user_id, reference } => {
            let outcome = engine.reconcile_for_user(user_id, &reference)?;
            info!(%user_id, %reference, status = %outcome.status, message = %outcome.message, "polled");
        }
        Step::Upload { user_id } => {
            let admission = engine.admit_upload(user_id)?;
            info!(
                %user_id,
                daily_remaining = admission.daily_remaining,
                slots_remaining = admission.slots_remaining,
                "upload admitted"
            );
        }
    }
    Ok(())
}

/// Replays a scenario from a CSV reader.
///
/// Rows are streamed. Malformed rows and rejected operations are logged and
/// skipped; only a failing reader stops the replay.
///
/// # CSV Format
///
/// Expected columns: `type, user, reference, value`
/// - `limit`: `value` is today's upload cap
/// - `purchase`: `user` buys the package with `value` slots; the gateway issues `reference`
/// - `settle`: the provider's answer for `reference` (`success`, `failure`,
///   `cancelled`, `processing`, `unrecognized`, `unavailable`)
/// - `poll`: `user` checks the status of `reference`
/// - `upload`: `user` uploads one document
///
/// # Example
///
/// ```csv
/// type,user,reference,value
/// limit,,,10
/// purchase,1,ws_CO_1,3
/// settle,,ws_CO_1,success
/// poll,1,ws_CO_1,
/// upload,1,,
/// ```
pub fn run_scenario<R: Read>(
    engine: &Engine,
    gateway: &ScriptedGateway,
    reader: R,
) -> Result<(), csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<ScenarioRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(line, error = %e, "skipping malformed row");
                continue;
            }
        };
        let Some(step) = record.into_step() else {
            warn!(line, "skipping invalid step");
            continue;
        };
        debug!(line, ?step, "applying");
        if let Err(e) = apply(engine, gateway, step) {
            warn!(line, error = %e, "step rejected");
        }
    }

    Ok(())
}

/// Writes per-user credit balances as CSV, ordered by user.
///
/// # CSV Format
///
/// Columns: `user, slots_remaining, total_purchased`
pub fn write_credits<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for account in engine.ledger().accounts() {
        wtr.serialize(account.as_ref())?;
    }
    wtr.flush()?;
    Ok(())
}
