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

//! Package catalog.
//!
//! Read-mostly store of purchasable offers. A package is purchasable only while
//! it is not flagged `unavailable` and still has inventory left.
//!
//! Inventory is soft: it gates new purchases, but a confirmed payment is
//! credited even when the package sold out in the meantime. The decrement is
//! clamped at zero and never fails.

use crate::MarketError;
use crate::base::PackageId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn default_currency() -> String {
    "KSH".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPackage {
    pub id: PackageId,
    pub name: String,
    pub price: Decimal,
    pub currency: String,
    /// Slots credited per purchase.
    pub slots: u32,
    pub features: Vec<String>,
    pub unavailable: bool,
    pub highlight: bool,
    /// Marketing badge such as `POPULAR`.
    pub offer: Option<String>,
    /// Remaining sellable units.
    pub available_slots: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PricingPackage {
    pub fn is_purchasable(&self) -> bool {
        !self.unavailable && self.available_slots > 0
    }
}

/// Input for creating a package, also used for seeding from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPackage {
    pub name: String,
    pub price: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub slots: u32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub highlight: bool,
    #[serde(default)]
    pub offer: Option<String>,
    #[serde(default)]
    pub available_slots: u32,
}

/// Keeps an explicit `null` apart from a missing field: `Some(None)` versus
/// `None`.
fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUpdate {
    pub name: Option<String>,
    pub price: Option<Decimal>,
    pub currency: Option<String>,
    pub slots: Option<u32>,
    pub features: Option<Vec<String>>,
    pub unavailable: Option<bool>,
    pub highlight: Option<bool>,
    /// `Some(None)` (JSON `null`) clears the badge.
    #[serde(default, deserialize_with = "explicit_null")]
    pub offer: Option<Option<String>>,
    pub available_slots: Option<u32>,
}

/// How a buyer picks a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageSelector {
    /// Cheapest purchasable package granting exactly this many slots.
    Slots(u32),
    /// A specific package.
    Id(PackageId),
}

/// Prices are charged in whole currency units.
fn validate(price: Decimal, slots: u32) -> Result<(), MarketError> {
    if slots == 0 || price <= Decimal::ZERO || !price.fract().is_zero() {
        return Err(MarketError::InvalidPackage);
    }
    Ok(())
}

type PackageRow = Arc<Mutex<PricingPackage>>;

#[derive(Debug)]
pub struct PackageCatalog {
    packages: DashMap<PackageId, PackageRow>,
    next_id: AtomicU32,
}

impl PackageCatalog {
    pub fn new() -> Self {
        Self {
            packages: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Inserts `packages` only when the catalog is empty. Returns how many
    /// packages were created.
    pub fn seed(&self, packages: &[NewPackage]) -> Result<usize, MarketError> {
        if !self.packages.is_empty() {
            return Ok(0);
        }
        for package in packages {
            self.create(package.clone())?;
        }
        Ok(packages.len())
    }

    pub fn create(&self, new: NewPackage) -> Result<PricingPackage, MarketError> {
        validate(new.price, new.slots)?;
        let id = PackageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Utc::now();
        let package = PricingPackage {
            id,
            name: new.name,
            price: new.price,
            currency: new.currency,
            slots: new.slots,
            features: new.features,
            unavailable: new.unavailable,
            highlight: new.highlight,
            offer: new.offer,
            available_slots: new.available_slots,
            created_at: now,
            updated_at: now,
        };
        self.packages.insert(id, Arc::new(Mutex::new(package.clone())));
        Ok(package)
    }

    pub fn update(
        &self,
        id: PackageId,
        changes: PackageUpdate,
    ) -> Result<PricingPackage, MarketError> {
        let row = self.row(id).ok_or(MarketError::NotFound)?;
        let mut package = row.lock();

        let price = changes.price.unwrap_or(package.price);
        let slots = changes.slots.unwrap_or(package.slots);
        validate(price, slots)?;

        package.price = price;
        package.slots = slots;
        if let Some(name) = changes.name {
            package.name = name;
        }
        if let Some(currency) = changes.currency {
            package.currency = currency;
        }
        if let Some(features) = changes.features {
            package.features = features;
        }
        if let Some(unavailable) = changes.unavailable {
            package.unavailable = unavailable;
        }
        if let Some(highlight) = changes.highlight {
            package.highlight = highlight;
        }
        if let Some(offer) = changes.offer {
            package.offer = offer;
        }
        if let Some(available_slots) = changes.available_slots {
            package.available_slots = available_slots;
        }
        package.updated_at = Utc::now();
        Ok(package.clone())
    }

    pub fn delete(&self, id: PackageId) -> Result<(), MarketError> {
        self.packages
            .remove(&id)
            .map(|_| ())
            .ok_or(MarketError::NotFound)
    }

    pub fn get(&self, id: PackageId) -> Option<PricingPackage> {
        self.row(id).map(|row| row.lock().clone())
    }

    /// Every package, cheapest first.
    pub fn list(&self) -> Vec<PricingPackage> {
        let mut packages = self.snapshot();
        packages.sort_by(|a, b| a.price.cmp(&b.price).then(a.id.cmp(&b.id)));
        packages
    }

    /// Selects a package that can be bought right now.
    ///
    /// # Errors
    ///
    /// [`MarketError::InvalidPackage`] if nothing matches, or the match is
    /// disabled or out of inventory.
    pub fn find_purchasable(
        &self,
        selector: PackageSelector,
    ) -> Result<PricingPackage, MarketError> {
        match selector {
            PackageSelector::Id(id) => self
                .get(id)
                .filter(PricingPackage::is_purchasable)
                .ok_or(MarketError::InvalidPackage),
            PackageSelector::Slots(slots) => self
                .list()
                .into_iter()
                .find(|p| p.slots == slots && p.is_purchasable())
                .ok_or(MarketError::InvalidPackage),
        }
    }

    /// Takes one unit of inventory. Returns whether a unit was taken; an
    /// exhausted or deleted package is left alone.
    pub fn decrement_inventory(&self, id: PackageId) -> bool {
        let Some(row) = self.row(id) else {
            return false;
        };
        let mut package = row.lock();
        if package.available_slots == 0 {
            return false;
        }
        package.available_slots -= 1;
        package.updated_at = Utc::now();
        true
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    fn row(&self, id: PackageId) -> Option<PackageRow> {
        self.packages.get(&id).map(|r| Arc::clone(r.value()))
    }

    fn snapshot(&self) -> Vec<PricingPackage> {
        let rows: Vec<PackageRow> = self.packages.iter().map(|r| Arc::clone(r.value())).collect();
        rows.iter().map(|row| row.lock().clone()).collect()
    }
}

impl Default for PackageCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn package(slots: u32, price: Decimal, available_slots: u32) -> NewPackage {
        NewPackage {
            name: format!("{slots} Slots"),
            price,
            currency: "KSH".to_string(),
            slots,
            features: vec![],
            unavailable: false,
            highlight: false,
            offer: None,
            available_slots,
        }
    }

    #[test]
    fn find_by_slots_requires_inventory_and_availability() {
        let catalog = PackageCatalog::new();
        catalog.create(package(1, dec!(100), 0)).unwrap();
        let mut disabled = package(3, dec!(250), 10);
        disabled.unavailable = true;
        catalog.create(disabled).unwrap();

        assert_eq!(
            catalog.find_purchasable(PackageSelector::Slots(1)),
            Err(MarketError::InvalidPackage)
        );
        assert_eq!(
            catalog.find_purchasable(PackageSelector::Slots(3)),
            Err(MarketError::InvalidPackage)
        );
        assert_eq!(
            catalog.find_purchasable(PackageSelector::Slots(7)),
            Err(MarketError::InvalidPackage)
        );
    }

    #[test]
    fn find_by_slots_prefers_cheapest() {
        let catalog = PackageCatalog::new();
        catalog.create(package(3, dec!(300), 5)).unwrap();
        let cheap = catalog.create(package(3, dec!(250), 5)).unwrap();
        let found = catalog.find_purchasable(PackageSelector::Slots(3)).unwrap();
        assert_eq!(found.id, cheap.id);
    }

    #[test]
    fn find_by_id() {
        let catalog = PackageCatalog::new();
        let created = catalog.create(package(5, dec!(480), 1)).unwrap();
        let found = catalog.find_purchasable(PackageSelector::Id(created.id)).unwrap();
        assert_eq!(found, created);
        assert_eq!(
            catalog.find_purchasable(PackageSelector::Id(PackageId(999))),
            Err(MarketError::InvalidPackage)
        );
    }

    #[test]
    fn decrement_is_clamped_at_zero() {
        let catalog = PackageCatalog::new();
        let created = catalog.create(package(1, dec!(100), 1)).unwrap();
        assert!(catalog.decrement_inventory(created.id));
        assert!(!catalog.decrement_inventory(created.id));
        assert_eq!(catalog.get(created.id).unwrap().available_slots, 0);
        assert!(!catalog.decrement_inventory(PackageId(404)));
    }

    #[test]
    fn create_and_update_validate_price_and_slots() {
        let catalog = PackageCatalog::new();
        assert_eq!(
            catalog.create(package(0, dec!(100), 1)),
            Err(MarketError::InvalidPackage)
        );
        assert_eq!(
            catalog.create(package(1, dec!(0), 1)),
            Err(MarketError::InvalidPackage)
        );
        let created = catalog.create(package(1, dec!(100), 1)).unwrap();
        let bad = PackageUpdate {
            price: Some(dec!(-1)),
            ..Default::default()
        };
        assert_eq!(catalog.update(created.id, bad), Err(MarketError::InvalidPackage));
        assert_eq!(catalog.get(created.id).unwrap().price, dec!(100));
    }

    #[test]
    fn fractional_prices_are_rejected() {
        let catalog = PackageCatalog::new();
        assert_eq!(
            catalog.create(package(1, dec!(100.5), 1)),
            Err(MarketError::InvalidPackage)
        );
        let created = catalog.create(package(1, dec!(100.00), 1)).unwrap();
        let bad = PackageUpdate {
            price: Some(dec!(99.99)),
            ..Default::default()
        };
        assert_eq!(catalog.update(created.id, bad), Err(MarketError::InvalidPackage));
        assert_eq!(catalog.get(created.id).unwrap().price, dec!(100));
    }

    #[test]
    fn null_offer_in_update_clears_badge() {
        let catalog = PackageCatalog::new();
        let mut badged = package(3, dec!(250), 1);
        badged.offer = Some("POPULAR".to_string());
        let created = catalog.create(badged).unwrap();

        let keep: PackageUpdate = serde_json::from_str(r#"{"highlight":true}"#).unwrap();
        assert_eq!(keep.offer, None);
        let updated = catalog.update(created.id, keep).unwrap();
        assert_eq!(updated.offer.as_deref(), Some("POPULAR"));

        let clear: PackageUpdate = serde_json::from_str(r#"{"offer":null}"#).unwrap();
        assert_eq!(clear.offer, Some(None));
        let updated = catalog.update(created.id, clear).unwrap();
        assert_eq!(updated.offer, None);
        assert!(updated.highlight);
    }

    #[test]
    fn update_applies_only_given_fields() {
        let catalog = PackageCatalog::new();
        let created = catalog.create(package(1, dec!(100), 1)).unwrap();
        let updated = catalog
            .update(
                created.id,
                PackageUpdate {
                    unavailable: Some(true),
                    offer: Some(Some("POPULAR".to_string())),
                    available_slots: Some(20),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.unavailable);
        assert_eq!(updated.offer.as_deref(), Some("POPULAR"));
        assert_eq!(updated.available_slots, 20);
        assert_eq!(updated.price, dec!(100));
        assert_eq!(updated.name, "1 Slots");
    }

    #[test]
    fn delete_unknown_is_not_found() {
        let catalog = PackageCatalog::new();
        let created = catalog.create(package(1, dec!(100), 1)).unwrap();
        catalog.delete(created.id).unwrap();
        assert_eq!(catalog.delete(created.id), Err(MarketError::NotFound));
        assert_eq!(
            catalog.update(created.id, PackageUpdate::default()),
            Err(MarketError::NotFound)
        );
    }

    #[test]
    fn seed_only_fills_empty_catalog() {
        let catalog = PackageCatalog::new();
        let seeds = vec![package(5, dec!(480), 1), package(1, dec!(100), 1)];
        assert_eq!(catalog.seed(&seeds).unwrap(), 2);
        assert_eq!(catalog.seed(&seeds).unwrap(), 0);
        let prices: Vec<Decimal> = catalog.list().iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![dec!(100), dec!(480)]);
    }
}
