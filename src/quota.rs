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

//! System-wide daily upload cap.
//!
//! One counter per calendar date (server local time). A date without a
//! counter behaves as `max_uploads = 0`, so uploads stay blocked until an
//! administrator sets the day's cap.

use crate::MarketError;
use chrono::{Local, NaiveDate};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Counter state for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyUploadCounter {
    pub date: NaiveDate,
    pub max_uploads: u32,
    pub current_uploads: u32,
}

impl DailyUploadCounter {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            max_uploads: 0,
            current_uploads: 0,
        }
    }

    /// Uploads still allowed today, never below zero.
    pub fn remaining(&self) -> u32 {
        self.max_uploads.saturating_sub(self.current_uploads)
    }
}

#[derive(Debug, Default)]
pub struct UploadQuota {
    counters: DashMap<NaiveDate, Arc<Mutex<DailyUploadCounter>>>,
}

impl UploadQuota {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    pub fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    /// Reserves one upload against today's cap.
    ///
    /// # Errors
    ///
    /// [`MarketError::QuotaExceeded`] when `current_uploads >= max_uploads`.
    pub fn try_reserve_daily_slot(&self) -> Result<DailyUploadCounter, MarketError> {
        self.try_reserve_on(Self::today())
    }

    pub fn try_reserve_on(&self, date: NaiveDate) -> Result<DailyUploadCounter, MarketError> {
        let counter = self.counter(date);
        let mut counter = counter.lock();
        if counter.current_uploads >= counter.max_uploads {
            return Err(MarketError::QuotaExceeded);
        }
        counter.current_uploads += 1;
        Ok(*counter)
    }

    /// Sets today's cap, keeping the uploads already counted.
    pub fn set_max_uploads(&self, max_uploads: u32) -> DailyUploadCounter {
        self.set_max_uploads_on(Self::today(), max_uploads)
    }

    pub fn set_max_uploads_on(&self, date: NaiveDate, max_uploads: u32) -> DailyUploadCounter {
        let counter = self.counter(date);
        let mut counter = counter.lock();
        counter.max_uploads = max_uploads;
        *counter
    }

    /// Today's counter; reading creates it.
    pub fn daily_status(&self) -> DailyUploadCounter {
        self.status_on(Self::today())
    }

    pub fn status_on(&self, date: NaiveDate) -> DailyUploadCounter {
        *self.counter(date).lock()
    }

    fn counter(&self, date: NaiveDate) -> Arc<Mutex<DailyUploadCounter>> {
        Arc::clone(
            self.counters
                .entry(date)
                .or_insert_with(|| Arc::new(Mutex::new(DailyUploadCounter::new(date))))
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn unset_cap_blocks_uploads() {
        let quota = UploadQuota::new();
        assert_eq!(quota.try_reserve_on(day(1)), Err(MarketError::QuotaExceeded));
        // The denied read still created the record.
        assert_eq!(quota.status_on(day(1)), DailyUploadCounter::new(day(1)));
    }

    #[test]
    fn reserves_up_to_cap() {
        let quota = UploadQuota::new();
        quota.set_max_uploads_on(day(2), 2);
        assert_eq!(quota.try_reserve_on(day(2)).unwrap().current_uploads, 1);
        assert_eq!(quota.try_reserve_on(day(2)).unwrap().current_uploads, 2);
        assert_eq!(quota.try_reserve_on(day(2)), Err(MarketError::QuotaExceeded));
        assert_eq!(quota.status_on(day(2)).remaining(), 0);
    }

    #[test]
    fn dates_are_independent() {
        let quota = UploadQuota::new();
        quota.set_max_uploads_on(day(3), 1);
        quota.try_reserve_on(day(3)).unwrap();
        assert_eq!(quota.try_reserve_on(day(4)), Err(MarketError::QuotaExceeded));
        assert_eq!(quota.status_on(day(3)).current_uploads, 1);
    }

    #[test]
    fn lowering_cap_keeps_count_and_clamps_remaining() {
        let quota = UploadQuota::new();
        quota.set_max_uploads_on(day(5), 3);
        quota.try_reserve_on(day(5)).unwrap();
        quota.try_reserve_on(day(5)).unwrap();
        let counter = quota.set_max_uploads_on(day(5), 1);
        assert_eq!(counter.current_uploads, 2);
        assert_eq!(counter.remaining(), 0);
    }
}
