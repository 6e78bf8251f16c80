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

//! Deadlock detection tests using parking_lot's built-in deadlock detector.
//!
//! These drive the real engine from many threads at once: reconciliation
//! (transaction → credits → package), upload debits (credits), catalog
//! administration (package) and snapshot listings. The detector watches every
//! parking_lot mutex involved for cycles in the lock graph.

use parking_lot::deadlock;
use rust_decimal_macros::dec;
use slot_ledger_rs::{
    Engine, GatewayStatus, LogNotifier, MarketError, NewPackage, PackageId, PackageSelector,
    PackageUpdate, Reference, ScriptedGateway, TransactionStatus, UserId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const PHONE: &str = "254700000001";

// === Deadlock Detection Infrastructure ===

struct Detector {
    running: Arc<AtomicBool>,
    found: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

/// Starts a background thread that checks for deadlocks every 50ms.
fn start_deadlock_detector() -> Detector {
    let running = Arc::new(AtomicBool::new(true));
    let found = Arc::new(AtomicBool::new(false));
    let handle = {
        let running = running.clone();
        let found = found.clone();
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
                let deadlocks = deadlock::check_deadlock();
                if deadlocks.is_empty() {
                    continue;
                }
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                found.store(true, Ordering::SeqCst);
                return;
            }
        })
    };
    Detector {
        running,
        found,
        handle,
    }
}

/// Stops the detector and fails the test if it saw a cycle.
fn stop_deadlock_detector(detector: Detector) {
    detector.running.store(false, Ordering::SeqCst);
    detector.handle.join().unwrap();
    assert!(
        !detector.found.load(Ordering::SeqCst),
        "deadlock detected, see output above"
    );
}

// === Helpers ===

fn make_package(slots: u32, available_slots: u32) -> NewPackage {
    NewPackage {
        name: format!("{slots} Slots"),
        price: dec!(100) * rust_decimal::Decimal::from(slots),
        currency: "KSH".to_string(),
        slots,
        features: vec![],
        unavailable: false,
        highlight: false,
        offer: None,
        available_slots,
    }
}

fn setup() -> (Arc<Engine>, Arc<ScriptedGateway>, PackageId) {
    let gateway = Arc::new(ScriptedGateway::new());
    let engine = Engine::new(gateway.clone(), Arc::new(LogNotifier), 4096);
    let package = engine.catalog().create(make_package(1, 1_000)).unwrap();
    (Arc::new(engine), gateway, package.id)
}

/// Initiates `count` purchases for `users` round-robin, each confirmed by the gateway.
fn confirmed_purchases(
    engine: &Engine,
    gateway: &ScriptedGateway,
    users: u32,
    count: u32,
) -> Vec<(UserId, Reference)> {
    (0..count)
        .map(|i| {
            let user_id = UserId(i % users + 1);
            let tx = engine
                .initiate(user_id, PackageSelector::Slots(1), PHONE)
                .unwrap();
            gateway.set_status(tx.reference.clone(), GatewayStatus::Success);
            (user_id, tx.reference)
        })
        .collect()
}

// === Tests ===

/// Many threads reconcile the same references at once.
#[test]
fn no_deadlock_reconcile_storm() {
    let detector = start_deadlock_detector();
    let (engine, gateway, package_id) = setup();
    let purchases = Arc::new(confirmed_purchases(&engine, &gateway, 5, 200));

    const NUM_THREADS: usize = 16;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let engine = engine.clone();
            let purchases = purchases.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                // Each thread walks the list from a different offset.
                for i in 0..purchases.len() {
                    let (_, reference) = &purchases[(i + t * 13) % purchases.len()];
                    let outcome = engine.reconcile(reference).unwrap();
                    assert_eq!(outcome.status, TransactionStatus::Completed);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    stop_deadlock_detector(detector);

    let total: u32 = (1..=5)
        .map(|u| engine.balance(UserId(u)).total_purchased)
        .sum();
    assert_eq!(total, 200);
    assert_eq!(engine.catalog().get(package_id).unwrap().available_slots, 800);
}

/// Uploads debit the same users that reconciliation is crediting.
#[test]
fn no_deadlock_debits_during_settlement() {
    let detector = start_deadlock_detector();
    let (engine, gateway, _) = setup();
    engine.quota().set_max_uploads(10_000);
    let purchases = Arc::new(confirmed_purchases(&engine, &gateway, 3, 150));

    let reconciler = {
        let engine = engine.clone();
        let purchases = purchases.clone();
        thread::spawn(move || {
            for (user_id, reference) in purchases.iter() {
                engine.reconcile_for_user(*user_id, reference).unwrap();
            }
        })
    };
    let uploaders: Vec<_> = (1..=3)
        .map(|u| {
            let engine = engine.clone();
            thread::spawn(move || {
                let mut admitted: u32 = 0;
                for _ in 0..200 {
                    match engine.admit_upload(UserId(u)) {
                        Ok(_) => admitted += 1,
                        Err(e) => assert_eq!(e, MarketError::InsufficientSlots),
                    }
                }
                admitted
            })
        })
        .collect();

    reconciler.join().unwrap();
    let admitted: u32 = uploaders.into_iter().map(|h| h.join().unwrap()).sum();

    stop_deadlock_detector(detector);

    let remaining: u32 = (1..=3)
        .map(|u| engine.balance(UserId(u)).slots_remaining)
        .sum();
    assert_eq!(admitted + remaining, 150);
}

/// Admins edit and delete packages while purchases settle against them.
#[test]
fn no_deadlock_catalog_admin_during_settlement() {
    let detector = start_deadlock_detector();
    let (engine, gateway, package_id) = setup();
    let purchases = Arc::new(confirmed_purchases(&engine, &gateway, 4, 200));

    let admin = {
        let engine = engine.clone();
        thread::spawn(move || {
            for i in 0..500u32 {
                let changes = PackageUpdate {
                    available_slots: Some(1_000 - i),
                    highlight: Some(i % 2 == 0),
                    ..Default::default()
                };
                engine.catalog().update(package_id, changes).unwrap();
                let extra = engine.catalog().create(make_package(2, 5)).unwrap();
                engine.catalog().list();
                engine.catalog().delete(extra.id).unwrap();
            }
        })
    };
    let reconcilers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let purchases = purchases.clone();
            thread::spawn(move || {
                for (_, reference) in purchases.iter() {
                    engine.reconcile(reference).unwrap();
                }
            })
        })
        .collect();

    admin.join().unwrap();
    for handle in reconcilers {
        handle.join().unwrap();
    }

    stop_deadlock_detector(detector);

    let total: u32 = (1..=4)
        .map(|u| engine.balance(UserId(u)).total_purchased)
        .sum();
    assert_eq!(total, 200);
}

/// Listings snapshot every store while it is being mutated.
#[test]
fn no_deadlock_iteration_during_mutation() {
    let detector = start_deadlock_detector();
    let (engine, gateway, _) = setup();
    let purchases = Arc::new(confirmed_purchases(&engine, &gateway, 10, 100));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    let _ = engine.transactions();
                    let _ = engine.ledger().accounts();
                    let _ = engine.catalog().list();
                    let _ = engine.quota().daily_status();
                }
            })
        })
        .collect();
    let writers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let purchases = purchases.clone();
            thread::spawn(move || {
                for (user_id, reference) in purchases.iter() {
                    engine.reconcile(reference).unwrap();
                    let _ = engine.debit(*user_id);
                }
            })
        })
        .collect();

    for handle in writers {
        handle.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    for handle in readers {
        handle.join().unwrap();
    }

    stop_deadlock_detector(detector);

    assert!(
        engine
            .transactions()
            .iter()
            .all(|tx| tx.status == TransactionStatus::Completed)
    );
}

/// New purchases keep arriving while older ones settle.
#[test]
fn no_deadlock_initiate_during_reconcile() {
    let detector = start_deadlock_detector();
    let (engine, gateway, _) = setup();

    const NUM_THREADS: usize = 8;
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let engine = engine.clone();
            let gateway = gateway.clone();
            thread::spawn(move || {
                let user_id = UserId(t as u32 + 1);
                for _ in 0..50 {
                    let tx = engine
                        .initiate(user_id, PackageSelector::Slots(1), PHONE)
                        .unwrap();
                    gateway.set_status(tx.reference.clone(), GatewayStatus::Success);
                    engine.reconcile(&tx.reference).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    stop_deadlock_detector(detector);

    assert_eq!(engine.transactions().len(), NUM_THREADS * 50);
    for t in 1..=NUM_THREADS as u32 {
        assert_eq!(engine.balance(UserId(t)).slots_remaining, 50);
    }
}
