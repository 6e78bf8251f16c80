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

//! Payment notifications.
//!
//! Terminal transitions are announced through a [`Notifier`]. Delivery runs on
//! a dedicated worker thread fed by a bounded channel, so the reconciliation
//! path only ever enqueues. A full queue drops the event with a warning.

use crate::base::{Reference, UserId};
use crossbeam::channel::{self, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    Completed {
        user_id: UserId,
        reference: Reference,
        slots: u32,
    },
    Failed {
        user_id: UserId,
        reference: Reference,
        message: Option<String>,
    },
}

impl PaymentEvent {
    pub fn reference(&self) -> &Reference {
        match self {
            Self::Completed { reference, .. } | Self::Failed { reference, .. } => reference,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Delivers payment events to users (email, push, ...).
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &PaymentEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &PaymentEvent) -> Result<(), NotifyError> {
        match event {
            PaymentEvent::Completed {
                user_id,
                reference,
                slots,
            } => info!(%user_id, %reference, slots, "payment completed"),
            PaymentEvent::Failed {
                user_id,
                reference,
                message,
            } => info!(%user_id, %reference, message = message.as_deref().unwrap_or(""), "payment failed"),
        }
        Ok(())
    }
}

/// Queues events for a background worker that calls the notifier.
pub struct NotificationDispatcher {
    sender: Option<Sender<PaymentEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded::<PaymentEvent>(capacity.max(1));
        let worker = thread::Builder::new()
            .name("payment-notifier".to_string())
            .spawn(move || {
                for event in receiver.iter() {
                    if let Err(e) = notifier.notify(&event) {
                        warn!(reference = %event.reference(), error = %e, "notification failed");
                    }
                }
            });

        match worker {
            Ok(worker) => Self {
                sender: Some(sender),
                worker: Some(worker),
            },
            Err(e) => {
                warn!(error = %e, "could not start notification worker, notifications disabled");
                Self {
                    sender: None,
                    worker: None,
                }
            }
        }
    }

    /// Enqueues an event without waiting. Returns whether it was accepted.
    pub fn dispatch(&self, event: PaymentEvent) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(reference = %event.reference(), "notification queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(event)) => {
                warn!(reference = %event.reference(), "notification worker gone, dropping event");
                false
            }
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
