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

//! In-memory storage with row locks and all-or-nothing units of work.
//!
//! Every table is a [`DashMap`] of `Arc<Mutex<T>>` rows. A [`UnitOfWork`]
//! locks the rows an operation touches, hands out drafts to mutate, and
//! stages inserts. [`UnitOfWork::commit`] runs in two phases:
//!
//! 1. Reserve every uniqueness key (registration keys, the one income
//!    settlement per transaction, reference numbers). Any clash undoes the
//!    reservations made so far and fails the whole unit.
//! 2. Write drafts back into the locked rows, insert new rows and append
//!    the unit's events to the journal.
//!
//! Dropping a unit of work without committing releases its locks and
//! discards every staged change.
//!
//! # Lock order
//!
//! Rows are locked table by table in the order of [`LockLevel`]:
//! customers, merchants, branches, purchase requests, transactions, plans,
//! settlements. Callers learn related ids from an unlocked snapshot first,
//! then lock in order and re-validate against the locked rows.
//!
//! No DashMap shard guard is ever held while waiting on a row mutex; row
//! handles are cloned out of the map before locking.

use crate::base::{
    BranchId, CustomerId, MerchantId, PaymentId, PlanId, PurchaseRequestId, ReferenceKind,
    ScheduleId, SettlementId, TransactionId,
};
use crate::customer::{Customer, CustomerLimitHistory};
use crate::error::LedgerError;
use crate::journal::{Journal, LedgerEvent};
use crate::merchant::{Branch, Merchant};
use crate::payment::Payment;
use crate::purchase::PurchaseRequest;
use crate::repayment::RepaymentPlan;
use crate::settlement::Settlement;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A stored entity with a typed primary key.
pub trait Record: Clone + Send + 'static {
    type Id: Copy + Ord + Eq + Hash + fmt::Display + Send + Sync + 'static;

    /// Entity name used in not-found errors.
    const ENTITY: &'static str;

    fn id(&self) -> Self::Id;
}

macro_rules! record {
    ($ty:ty, $id:ty, $entity:literal) => {
        impl Record for $ty {
            type Id = $id;
            const ENTITY: &'static str = $entity;

            fn id(&self) -> Self::Id {
                self.id
            }
        }
    };
}

record!(Customer, CustomerId, "customer");
record!(Merchant, MerchantId, "merchant");
record!(Branch, BranchId, "branch");
record!(PurchaseRequest, PurchaseRequestId, "purchase request");
record!(Transaction, TransactionId, "transaction");
record!(RepaymentPlan, PlanId, "repayment plan");
record!(Payment, PaymentId, "payment");
record!(Settlement, SettlementId, "settlement");

type Row<T> = Arc<Mutex<T>>;

/// One entity table plus its id sequence.
pub struct Table<T: Record> {
    rows: DashMap<T::Id, Row<T>>,
    sequence: AtomicU64,
}

impl<T: Record> Table<T> {
    fn new() -> Self {
        Self {
            rows: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Next primary key value. Values burnt by rolled-back units are not reused.
    fn allocate(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn row(&self, id: T::Id) -> Result<Row<T>, LedgerError> {
        self.rows
            .get(&id)
            .map(|row| Arc::clone(row.value()))
            .ok_or_else(|| LedgerError::not_found(T::ENTITY, id))
    }

    fn insert(&self, value: T) {
        self.rows.insert(value.id(), Arc::new(Mutex::new(value)));
    }

    /// Snapshot of one row. Waits for any unit of work holding it.
    pub fn get(&self, id: T::Id) -> Option<T> {
        let row = self.row(id).ok()?;
        let value = row.lock().clone();
        Some(value)
    }

    pub fn fetch(&self, id: T::Id) -> Result<T, LedgerError> {
        let row = self.row(id)?;
        let value = row.lock().clone();
        Ok(value)
    }

    /// Snapshots of every row matching `predicate`, ordered by id.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let mut rows: Vec<(T::Id, Row<T>)> = self
            .rows
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        rows.sort_by_key(|(id, _)| *id);

        rows.into_iter()
            .filter_map(|(_, row)| {
                let value = row.lock();
                predicate(&*value).then(|| value.clone())
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<T::Id> {
        let mut ids: Vec<T::Id> = self.rows.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Keys that must be unique across the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UniqueKey {
    CustomerUser(String),
    CustomerCode(String),
    NationalId(String),
    MerchantUser(String),
    CommercialRegistration(String),
    /// At most one income settlement per transaction.
    IncomeSettlement(TransactionId),
}

impl UniqueKey {
    fn conflict(&self) -> LedgerError {
        match self {
            Self::CustomerUser(user) => {
                LedgerError::Conflict(format!("user {user} already has a customer profile"))
            }
            Self::CustomerCode(code) => {
                LedgerError::Conflict(format!("customer code {code} already issued"))
            }
            Self::NationalId(_) => LedgerError::Conflict("national id already registered".into()),
            Self::MerchantUser(user) => {
                LedgerError::Conflict(format!("user {user} already has a merchant profile"))
            }
            Self::CommercialRegistration(cr) => {
                LedgerError::Conflict(format!("commercial registration {cr} already registered"))
            }
            Self::IncomeSettlement(_) => LedgerError::DuplicateSettlement,
        }
    }
}

/// Tables are locked in ascending level order within a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    Customer,
    Merchant,
    Branch,
    PurchaseRequest,
    Transaction,
    Plan,
    Settlement,
}

pub struct MemoryStore {
    pub customers: Table<Customer>,
    pub merchants: Table<Merchant>,
    pub branches: Table<Branch>,
    pub purchase_requests: Table<PurchaseRequest>,
    pub transactions: Table<Transaction>,
    pub plans: Table<RepaymentPlan>,
    pub payments: Table<Payment>,
    pub settlements: Table<Settlement>,
    limit_history: DashMap<CustomerId, Vec<CustomerLimitHistory>>,
    index: DashMap<UniqueKey, u64>,
    schedule_sequence: AtomicU64,
    journal: Journal,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            customers: Table::new(),
            merchants: Table::new(),
            branches: Table::new(),
            purchase_requests: Table::new(),
            transactions: Table::new(),
            plans: Table::new(),
            payments: Table::new(),
            settlements: Table::new(),
            limit_history: DashMap::new(),
            index: DashMap::new(),
            schedule_sequence: AtomicU64::new(0),
            journal: Journal::new(),
        }
    }

    /// Starts a unit of work stamped with `now`.
    pub fn begin(&self, now: DateTime<Utc>) -> UnitOfWork<'_> {
        UnitOfWork::new(self, now)
    }

    /// Raw id stored under a unique key.
    pub fn lookup(&self, key: &UniqueKey) -> Option<u64> {
        self.index.get(key).map(|id| *id)
    }

    pub fn income_settlement_for(&self, transaction_id: TransactionId) -> Option<SettlementId> {
        self.lookup(&UniqueKey::IncomeSettlement(transaction_id))
            .map(SettlementId)
    }

    pub fn limit_history(&self, customer_id: CustomerId) -> Vec<CustomerLimitHistory> {
        self.limit_history
            .get(&customer_id)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    fn next_schedule_id(&self) -> ScheduleId {
        ScheduleId(self.schedule_sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Locked rows, drafts and inserts for one table.
struct Staged<T: Record> {
    locked: BTreeMap<T::Id, ArcMutexGuard<RawMutex, T>>,
    updates: BTreeMap<T::Id, T>,
    inserts: Vec<T>,
}

impl<T: Record> Staged<T> {
    fn new() -> Self {
        Self {
            locked: BTreeMap::new(),
            updates: BTreeMap::new(),
            inserts: Vec::new(),
        }
    }

    /// Locks the row on first access and returns a draft of it. Later calls
    /// return the latest staged draft.
    fn lock(&mut self, table: &Table<T>, id: T::Id) -> Result<T, LedgerError> {
        if let Some(draft) = self.updates.get(&id) {
            return Ok(draft.clone());
        }
        if let Some(guard) = self.locked.get(&id) {
            return Ok(T::clone(guard));
        }
        let row = table.row(id)?;
        let guard = row.lock_arc();
        let draft = T::clone(&guard);
        self.locked.insert(id, guard);
        Ok(draft)
    }

    fn put(&mut self, draft: T) {
        debug_assert!(
            self.locked.contains_key(&draft.id()),
            "{} {} updated without holding its lock",
            T::ENTITY,
            draft.id()
        );
        self.updates.insert(draft.id(), draft);
    }

    /// Writes drafts and inserts. Row locks stay held until the unit drops.
    fn write(&mut self, table: &Table<T>) {
        for (id, draft) in std::mem::take(&mut self.updates) {
            if let Some(guard) = self.locked.get_mut(&id) {
                **guard = draft;
            }
        }
        for row in self.inserts.drain(..) {
            table.insert(row);
        }
    }
}

macro_rules! staged_accessors {
    ($field:ident: $ty:ty, $id:ident, $level:expr;
        $lock:ident, $put:ident, $insert:ident, $next_id:ident) => {
        /// Locks the row and returns a draft; stage changes with the matching `put`.
        pub fn $lock(&mut self, id: $id) -> Result<$ty, LedgerError> {
            self.enter($level);
            self.$field.lock(&self.store.$field, id)
        }

        pub fn $put(&mut self, draft: $ty) {
            self.$field.put(draft);
        }

        pub fn $insert(&mut self, row: $ty) {
            self.$field.inserts.push(row);
        }

        pub fn $next_id(&self) -> $id {
            $id(self.store.$field.allocate())
        }
    };
}

/// One atomic ledger operation.
pub struct UnitOfWork<'a> {
    store: &'a MemoryStore,
    now: DateTime<Utc>,
    level: Option<LockLevel>,
    customers: Staged<Customer>,
    merchants: Staged<Merchant>,
    branches: Staged<Branch>,
    purchase_requests: Staged<PurchaseRequest>,
    transactions: Staged<Transaction>,
    plans: Staged<RepaymentPlan>,
    payments: Staged<Payment>,
    settlements: Staged<Settlement>,
    limit_history: Vec<CustomerLimitHistory>,
    unique_keys: Vec<(UniqueKey, u64)>,
    references: Vec<(String, ReferenceKind)>,
    events: Vec<LedgerEvent>,
}

impl<'a> UnitOfWork<'a> {
    fn new(store: &'a MemoryStore, now: DateTime<Utc>) -> Self {
        Self {
            store,
            now,
            level: None,
            customers: Staged::new(),
            merchants: Staged::new(),
            branches: Staged::new(),
            purchase_requests: Staged::new(),
            transactions: Staged::new(),
            plans: Staged::new(),
            payments: Staged::new(),
            settlements: Staged::new(),
            limit_history: Vec::new(),
            unique_keys: Vec::new(),
            references: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn store(&self) -> &'a MemoryStore {
        self.store
    }

    fn enter(&mut self, level: LockLevel) {
        debug_assert!(
            self.level.is_none_or(|held| held <= level),
            "lock order violated: {level:?} after {:?}",
            self.level
        );
        self.level = Some(self.level.map_or(level, |held| held.max(level)));
    }

    staged_accessors! {
        customers: Customer, CustomerId, LockLevel::Customer;
        lock_customer, put_customer, insert_customer, next_customer_id
    }
    staged_accessors! {
        merchants: Merchant, MerchantId, LockLevel::Merchant;
        lock_merchant, put_merchant, insert_merchant, next_merchant_id
    }
    staged_accessors! {
        branches: Branch, BranchId, LockLevel::Branch;
        lock_branch, put_branch, insert_branch, next_branch_id
    }
    staged_accessors! {
        purchase_requests: PurchaseRequest, PurchaseRequestId, LockLevel::PurchaseRequest;
        lock_purchase_request, put_purchase_request,
        insert_purchase_request, next_purchase_request_id
    }
    staged_accessors! {
        transactions: Transaction, TransactionId, LockLevel::Transaction;
        lock_transaction, put_transaction, insert_transaction, next_transaction_id
    }
    staged_accessors! {
        plans: RepaymentPlan, PlanId, LockLevel::Plan;
        lock_plan, put_plan, insert_plan, next_plan_id
    }
    staged_accessors! {
        settlements: Settlement, SettlementId, LockLevel::Settlement;
        lock_settlement, put_settlement, insert_settlement, next_settlement_id
    }

    pub fn insert_payment(&mut self, payment: Payment) {
        self.payments.inserts.push(payment);
    }

    pub fn next_payment_id(&self) -> PaymentId {
        PaymentId(self.store.payments.allocate())
    }

    pub fn next_schedule_id(&self) -> ScheduleId {
        self.store.next_schedule_id()
    }

    pub fn append_limit_history(&mut self, row: CustomerLimitHistory) {
        self.limit_history.push(row);
    }

    /// Claims `key` for `id` when the unit commits.
    pub fn claim(&mut self, key: UniqueKey, id: u64) {
        self.unique_keys.push((key, id));
    }

    /// Generates a reference number not yet issued by the store or this unit.
    pub fn issue_reference(&mut self, kind: ReferenceKind) -> String {
        loop {
            let reference = kind.generate(self.now);
            let staged = self.references.iter().any(|(r, _)| *r == reference);
            if !staged && !self.store.journal.is_issued(&reference) {
                self.references.push((reference.clone(), kind));
                return reference;
            }
        }
    }

    pub fn record(&mut self, event: LedgerEvent) {
        self.events.push(event);
    }

    /// Makes every staged change visible at once, or none of them.
    pub fn commit(mut self) -> Result<(), LedgerError> {
        let store = self.store;

        let mut claimed: Vec<&UniqueKey> = Vec::with_capacity(self.unique_keys.len());
        for (key, id) in &self.unique_keys {
            let reserved = match store.index.entry(key.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(entry) => {
                    entry.insert(*id);
                    true
                }
            };
            if !reserved {
                for key in claimed {
                    store.index.remove(key);
                }
                return Err(key.conflict());
            }
            claimed.push(key);
        }

        for (position, (reference, kind)) in self.references.iter().enumerate() {
            if let Err(error) = store.journal.reserve(reference, *kind) {
                for (reference, _) in &self.references[..position] {
                    store.journal.release(reference);
                }
                for key in claimed {
                    store.index.remove(key);
                }
                return Err(error);
            }
        }

        self.customers.write(&store.customers);
        self.merchants.write(&store.merchants);
        self.branches.write(&store.branches);
        self.purchase_requests.write(&store.purchase_requests);
        self.transactions.write(&store.transactions);
        self.plans.write(&store.plans);
        self.payments.write(&store.payments);
        self.settlements.write(&store.settlements);
        for row in self.limit_history {
            let mut history = store.limit_history.entry(row.customer_id).or_default();
            history.push(row);
        }
        store.journal.append(self.events);
        Ok(())
    }
}
