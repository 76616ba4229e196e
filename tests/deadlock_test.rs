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
//! These tests drive the real ledger from many threads at once. Every row
//! lock in the store is a parking_lot mutex, and the `deadlock_detection`
//! feature lets a watcher thread report cycles in the lock graph while the
//! operations race.

use bnpl_ledger::{
    AdminId, Caller, Customer, Ledger, LedgerError, NewCustomer, NewMerchant, NewPurchaseRequest,
    OpenTransaction, PaymentMethod, PaymentTarget, ReferenceKind, RequestStatus, SettlementType,
    Transaction, TransactionId, TransactionStatus,
};
use parking_lot::deadlock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

// === Deadlock Detection Infrastructure ===

struct Detector {
    running: Arc<AtomicBool>,
    found: Arc<AtomicBool>,
}

/// Starts a background thread that checks for deadlocks.
fn start_deadlock_detector() -> Detector {
    let running = Arc::new(AtomicBool::new(true));
    let found = Arc::new(AtomicBool::new(false));
    let (running_clone, found_clone) = (running.clone(), found.clone());

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                found_clone.store(true, Ordering::SeqCst);
                return;
            }
        }
    });

    Detector { running, found }
}

/// Stops the detector and fails the test if it saw a cycle.
fn stop_deadlock_detector(detector: Detector) {
    detector.running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150)); // Let detector thread exit
    assert!(
        !detector.found.load(Ordering::SeqCst),
        "Deadlock detected! See output above for details."
    );
}

// === Helpers ===

fn register_customer(ledger: &Ledger, user: &str, limit: Decimal) -> Caller {
    let customer = ledger
        .register_customer(NewCustomer::new(user).with_credit_limit(limit))
        .unwrap();
    Caller::Customer(customer.id)
}

fn register_merchant(ledger: &Ledger, user: &str) -> Caller {
    let input = NewMerchant::new(user, "Panda");
    let merchant = ledger.register_merchant(input).unwrap();
    Caller::Merchant(merchant.id)
}

fn buy(ledger: &Ledger, customer: &Caller, merchant: &Caller, amount: Decimal) -> TransactionId {
    let customer_id = customer.customer().unwrap();
    let groceries = NewPurchaseRequest::new(customer_id, "Groceries", amount);
    let request = ledger.create_purchase_request(merchant, groceries).unwrap();
    let accepted = ledger.accept_purchase_request(customer, request.id, None);
    accepted.unwrap().transaction.id
}

fn account(ledger: &Ledger, customer: &Caller) -> Customer {
    let id = customer.customer().unwrap();
    ledger.customer(customer, id).unwrap()
}

// === Tests ===

/// Many threads accept the same request; exactly one wins.
#[test]
fn racing_accepts_debit_once() {
    let detector = start_deadlock_detector();
    let ledger = Arc::new(Ledger::default());
    let customer = register_customer(&ledger, "user-1", dec!(5000));
    let merchant = register_merchant(&ledger, "user-2");

    const NUM_THREADS: usize = 32;
    let laptop = NewPurchaseRequest::new(customer.customer().unwrap(), "Laptop", dec!(4000));
    let request = ledger.create_purchase_request(&merchant, laptop).unwrap();

    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ledger.accept_purchase_request(&customer, request.id, None)
            })
        })
        .collect();

    let mut accepted = 0;
    for handle in handles {
        match handle.join().expect("Thread panicked") {
            Ok(_) => accepted += 1,
            Err(error) => assert_eq!(error, LedgerError::NotPending(RequestStatus::Accepted)),
        }
    }

    stop_deadlock_detector(detector);

    assert_eq!(accepted, 1);
    assert_eq!(ledger.store().transactions.len(), 1);
    assert_eq!(ledger.store().plans.len(), 1);
    assert_eq!(ledger.store().settlements.len(), 1);
    let customer = account(&ledger, &customer);
    assert_eq!(customer.available_balance, dec!(1000));
    assert!(customer.is_balanced());
}

/// Concurrent payments against one transaction never overpay it.
#[test]
fn racing_payments_stop_at_zero() {
    let detector = start_deadlock_detector();
    let ledger = Arc::new(Ledger::default());
    let customer = register_customer(&ledger, "user-1", dec!(5000));
    let merchant = register_merchant(&ledger, "user-2");
    let txn = buy(&ledger, &customer, &merchant, dec!(1000));

    const NUM_THREADS: usize = 40;
    let succeeded = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let ledger = ledger.clone();
            let succeeded = succeeded.clone();
            thread::spawn(move || {
                let target = PaymentTarget::Transaction(txn);
                match ledger.make_payment(&customer, target, dec!(100), PaymentMethod::Wallet) {
                    Ok(_) => {
                        succeeded.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(LedgerError::Overpayment { .. }) => {}
                    Err(LedgerError::TransactionNotActive(_)) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    assert_eq!(succeeded.load(Ordering::SeqCst), 10);
    let txn = ledger.transaction(&customer, txn).unwrap();
    assert_eq!(txn.status, TransactionStatus::Completed);
    assert_eq!(txn.paid_amount, dec!(1000));
    assert_eq!(ledger.payments(&customer).len(), 10);
    let customer = account(&ledger, &customer);
    assert_eq!(customer.available_balance, dec!(5000));
    assert_eq!(customer.outstanding_balance, Decimal::ZERO);
}

/// One customer paying down many transactions from many threads.
#[test]
fn parallel_payments_across_transactions() {
    let detector = start_deadlock_detector();
    let ledger = Arc::new(Ledger::default());
    let customer = register_customer(&ledger, "user-1", dec!(50000));
    let merchant = register_merchant(&ledger, "user-2");

    const NUM_TRANSACTIONS: usize = 20;
    const PAYMENTS_PER_TRANSACTION: usize = 10;
    let txns: Vec<_> = (0..NUM_TRANSACTIONS)
        .map(|_| buy(&ledger, &customer, &merchant, dec!(1000)))
        .collect();
    assert_eq!(account(&ledger, &customer).available_balance, dec!(30000));

    let handles: Vec<_> = txns
        .iter()
        .map(|&txn| {
            let ledger = ledger.clone();
            thread::spawn(move || {
                let target = PaymentTarget::Transaction(txn);
                for _ in 0..PAYMENTS_PER_TRANSACTION {
                    ledger
                        .make_payment(&customer, target, dec!(100), PaymentMethod::Card)
                        .unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    let completed = ledger.transactions(&customer, Some(TransactionStatus::Completed));
    assert_eq!(completed.len(), NUM_TRANSACTIONS);
    let customer = account(&ledger, &customer);
    assert_eq!(customer.available_balance, dec!(50000));
    assert!(customer.is_balanced());
}

/// Merchants racing to receive the same settlement all get one record.
#[test]
fn racing_settlement_receipts_create_one() {
    let detector = start_deadlock_detector();
    let ledger = Arc::new(Ledger::default());
    let customer = register_customer(&ledger, "user-1", dec!(5000));
    let merchant = register_merchant(&ledger, "user-2");
    let tyres = NewPurchaseRequest::new(customer.customer().unwrap(), "Tyres", dec!(800));
    let request = ledger.create_purchase_request(&merchant, tyres).unwrap();

    // Book a plan-less, unsettled transaction directly.
    let txn = {
        let mut uow = ledger.store().begin(request.created_at);
        let now = uow.now();
        let mut owner = uow.lock_customer(request.customer_id).unwrap();
        owner.debit(dec!(800), now).unwrap();
        let id = uow.next_transaction_id();
        let number = uow.issue_reference(ReferenceKind::Transaction);
        let transaction = Transaction::open(
            id,
            number,
            OpenTransaction {
                merchant_id: request.merchant_id,
                customer_id: request.customer_id,
                purchase_request_id: request.id,
                total_amount: dec!(800),
                commission_rate: dec!(0.005),
                due_date: now + chrono::Duration::days(10),
            },
            now,
        );
        uow.put_customer(owner);
        uow.insert_transaction(transaction);
        uow.commit().unwrap();
        id
    };
    let target = PaymentTarget::Transaction(txn);
    ledger
        .make_payment(&customer, target, dec!(800), PaymentMethod::Wallet)
        .unwrap();

    const NUM_THREADS: usize = 16;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|i| {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                if i % 4 == 0 {
                    // Admin attempts may lose with DuplicateSettlement.
                    ledger
                        .create_income_settlement(&Caller::Admin(AdminId(1)), txn)
                        .ok()
                        .map(|settlement| settlement.id)
                } else {
                    Some(ledger.receive_settlement(&merchant, txn).unwrap().id)
                }
            })
        })
        .collect();

    let ids: Vec<_> = handles
        .into_iter()
        .filter_map(|handle| handle.join().expect("Thread panicked"))
        .collect();

    stop_deadlock_detector(detector);

    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(ledger.store().settlements.len(), 1);
    let merchant_id = merchant.merchant().unwrap();
    let merchant = ledger.merchant(&merchant, merchant_id).unwrap();
    assert_eq!(merchant.balance, dec!(796.00));
}

/// Purchases, payments, withdrawals and sweeps all at once across several
/// customers and merchants.
#[test]
fn mixed_operations_keep_books_balanced() {
    let detector = start_deadlock_detector();
    let ledger = Arc::new(Ledger::default());

    const NUM_CUSTOMERS: usize = 8;
    const NUM_MERCHANTS: usize = 4;
    const ROUNDS: usize = 25;
    let customers: Vec<_> = (0..NUM_CUSTOMERS)
        .map(|i| register_customer(&ledger, &format!("customer-{i}"), dec!(50000)))
        .collect();
    let merchants: Vec<_> = (0..NUM_MERCHANTS)
        .map(|i| register_merchant(&ledger, &format!("merchant-{i}")))
        .collect();

    let mut handles = Vec::new();
    for (i, customer) in customers.iter().copied().enumerate() {
        let ledger = ledger.clone();
        let merchants = merchants.clone();
        handles.push(thread::spawn(move || {
            for round in 0..ROUNDS {
                let merchant = merchants[(i + round) % merchants.len()];
                let txn = buy(&ledger, &customer, &merchant, dec!(120));
                let target = if round % 2 == 0 {
                    PaymentTarget::Transaction(txn)
                } else {
                    let opened = ledger.transaction(&customer, txn).unwrap();
                    PaymentTarget::Plan(opened.repayment_plan_id.unwrap())
                };
                ledger
                    .make_payment(&customer, target, dec!(120), PaymentMethod::Wallet)
                    .unwrap();
            }
        }));
    }
    for merchant in merchants.iter().copied() {
        let ledger = ledger.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ROUNDS {
                match ledger.request_withdrawal(&merchant, dec!(50), None) {
                    Ok(_) | Err(LedgerError::InsufficientBalance { .. }) => {}
                    Err(other) => panic!("unexpected error: {other}"),
                }
                thread::yield_now();
            }
        }));
    }
    {
        let ledger = ledger.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ROUNDS {
                ledger.sweep_overdue();
                ledger.expire_purchase_requests();
            }
        }));
    }

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    for customer in &customers {
        let customer = account(&ledger, customer);
        assert!(customer.is_balanced());
        assert_eq!(customer.outstanding_balance, Decimal::ZERO);
    }
    for merchant in &merchants {
        let merchant_id = merchant.merchant().unwrap();
        let settlements = ledger.settlements(merchant, None);
        let income: Decimal = settlements
            .iter()
            .filter(|s| s.settlement_type == SettlementType::Income)
            .map(|s| s.net_amount)
            .sum();
        let withdrawn: Decimal = settlements
            .iter()
            .filter(|s| s.settlement_type == SettlementType::Withdrawal)
            .map(|s| s.net_amount)
            .sum();
        let balance = ledger.merchant(merchant, merchant_id).unwrap().balance;
        assert_eq!(balance, income - withdrawn);
    }
    assert_eq!(ledger.store().transactions.len(), NUM_CUSTOMERS * ROUNDS);

    println!(
        "Mixed operations completed: {} transactions, {} settlements",
        ledger.store().transactions.len(),
        ledger.store().settlements.len()
    );
}

/// Registering the same user from many threads yields one profile.
#[test]
fn racing_registrations_claim_once() {
    let detector = start_deadlock_detector();
    let ledger = Arc::new(Ledger::default());

    const NUM_THREADS: usize = 24;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let ledger = ledger.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ledger.register_customer(NewCustomer::new("user-1")).is_ok()
            })
        })
        .collect();

    let registered = handles
        .into_iter()
        .map(|handle| handle.join().expect("Thread panicked"))
        .filter(|ok| *ok)
        .count();

    stop_deadlock_detector(detector);

    assert_eq!(registered, 1);
    assert_eq!(ledger.store().customers.len(), 1);
}
