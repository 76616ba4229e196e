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

//! Ordered journal of committed ledger events.
//!
//! Pairs a [`DashMap`] of issued reference numbers, used to reject
//! duplicates, with a [`SegQueue`] that keeps events in commit order. Each
//! unit of work lands as one batch, so a drain never sees half a commit.

use crate::base::ReferenceKind;
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CustomerRegistered,
    MerchantRegistered,
    CustomerStatusChanged,
    MerchantStatusChanged,
    LimitChanged,
    PurchaseRequested,
    PurchaseAccepted,
    PurchaseRejected,
    PurchaseCancelled,
    PurchaseExpired,
    TransactionOpened,
    TransactionCompleted,
    TransactionOverdue,
    PlanCreated,
    PlanCompleted,
    PaymentApplied,
    SettlementCreated,
    SettlementProcessing,
    SettlementCompleted,
    SettlementFailed,
    WithdrawalRequested,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::CustomerRegistered => "customer_registered",
            EventKind::MerchantRegistered => "merchant_registered",
            EventKind::CustomerStatusChanged => "customer_status_changed",
            EventKind::MerchantStatusChanged => "merchant_status_changed",
            EventKind::LimitChanged => "limit_changed",
            EventKind::PurchaseRequested => "purchase_requested",
            EventKind::PurchaseAccepted => "purchase_accepted",
            EventKind::PurchaseRejected => "purchase_rejected",
            EventKind::PurchaseCancelled => "purchase_cancelled",
            EventKind::PurchaseExpired => "purchase_expired",
            EventKind::TransactionOpened => "transaction_opened",
            EventKind::TransactionCompleted => "transaction_completed",
            EventKind::TransactionOverdue => "transaction_overdue",
            EventKind::PlanCreated => "plan_created",
            EventKind::PlanCompleted => "plan_completed",
            EventKind::PaymentApplied => "payment_applied",
            EventKind::SettlementCreated => "settlement_created",
            EventKind::SettlementProcessing => "settlement_processing",
            EventKind::SettlementCompleted => "settlement_completed",
            EventKind::SettlementFailed => "settlement_failed",
            EventKind::WithdrawalRequested => "withdrawal_requested",
        };
        f.write_str(name)
    }
}

/// One committed change to a ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: EventKind,
    /// Reference number or code of the record that changed.
    pub reference: String,
    pub amount: Option<Decimal>,
    pub occurred_at: DateTime<Utc>,
}

impl LedgerEvent {
    pub fn new(kind: EventKind, reference: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            reference: reference.into(),
            amount: None,
            occurred_at,
        }
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }
}

/// Event log with reference-number deduplication.
///
/// Reference reservation is atomic per reference through the entry API, so
/// two units of work can never both issue the same number.
#[derive(Debug, Default)]
pub struct Journal {
    references: DashMap<String, ReferenceKind>,
    batches: SegQueue<Vec<LedgerEvent>>,
    pending: AtomicUsize,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a reference number.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Conflict`] if the reference was already issued.
    pub fn reserve(&self, reference: &str, kind: ReferenceKind) -> Result<(), LedgerError> {
        match self.references.entry(reference.to_string()) {
            Entry::Occupied(_) => Err(LedgerError::Conflict(format!(
                "reference {reference} already issued"
            ))),
            Entry::Vacant(entry) => {
                entry.insert(kind);
                Ok(())
            }
        }
    }

    /// Gives back a reservation made by a unit of work that did not commit.
    pub fn release(&self, reference: &str) {
        self.references.remove(reference);
    }

    pub fn is_issued(&self, reference: &str) -> bool {
        self.references.contains_key(reference)
    }

    pub fn reference_kind(&self, reference: &str) -> Option<ReferenceKind> {
        self.references.get(reference).map(|kind| *kind)
    }

    /// Appends one committed unit's events as a single batch.
    pub fn append(&self, events: impl IntoIterator<Item = LedgerEvent>) {
        let batch: Vec<LedgerEvent> = events.into_iter().collect();
        if batch.is_empty() {
            return;
        }
        self.pending.fetch_add(batch.len(), Ordering::AcqRel);
        self.batches.push(batch);
    }

    /// Removes and returns every event recorded so far, oldest first.
    pub fn drain(&self) -> Vec<LedgerEvent> {
        let mut drained = Vec::new();
        while let Some(batch) = self.batches.pop() {
            self.pending.fetch_sub(batch.len(), Ordering::AcqRel);
            drained.extend(batch);
        }
        drained
    }

    /// Number of events not yet drained.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
