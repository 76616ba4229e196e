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

//! BNPL transactions.
//!
//! A transaction is opened exactly once, when a purchase request is
//! accepted, and tracks repayment of the extended credit:
//! - [`Active`] → [`Completed`] (remaining amount reaches zero)
//! - [`Active`] → [`Overdue`] (due date passed with money still owed)
//! - [`Overdue`] → [`Completed`] (late repayment)
//!
//! `paid_amount + remaining_amount == total_amount` holds after every change.
//!
//! [`Active`]: TransactionStatus::Active
//! [`Completed`]: TransactionStatus::Completed
//! [`Overdue`]: TransactionStatus::Overdue

use crate::base::{CustomerId, MerchantId, PlanId, PurchaseRequestId, TransactionId};
use crate::error::LedgerError;
use crate::settlement::split_commission;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Completed,
    Overdue,
    Cancelled,
}

impl TransactionStatus {
    /// Money may still be paid against the transaction.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Active | Self::Overdue)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionId,
    pub transaction_number: String,
    pub merchant_id: MerchantId,
    pub customer_id: CustomerId,
    pub purchase_request_id: PurchaseRequestId,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub remaining_amount: Decimal,
    /// Platform rate at the moment the transaction was opened.
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub merchant_net_amount: Decimal,
    pub status: TransactionStatus,
    pub due_date: DateTime<Utc>,
    pub repayment_plan_id: Option<PlanId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything needed to open a transaction.
#[derive(Debug, Clone)]
pub struct OpenTransaction {
    pub merchant_id: MerchantId,
    pub customer_id: CustomerId,
    pub purchase_request_id: PurchaseRequestId,
    pub total_amount: Decimal,
    pub commission_rate: Decimal,
    pub due_date: DateTime<Utc>,
}

impl Transaction {
    pub fn open(
        id: TransactionId,
        transaction_number: String,
        params: OpenTransaction,
        now: DateTime<Utc>,
    ) -> Self {
        let (commission_amount, merchant_net_amount) =
            split_commission(params.total_amount, params.commission_rate);
        Self {
            id,
            transaction_number,
            merchant_id: params.merchant_id,
            customer_id: params.customer_id,
            purchase_request_id: params.purchase_request_id,
            total_amount: params.total_amount,
            paid_amount: Decimal::ZERO,
            remaining_amount: params.total_amount,
            commission_rate: params.commission_rate,
            commission_amount,
            merchant_net_amount,
            status: TransactionStatus::Active,
            due_date: params.due_date,
            repayment_plan_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.remaining_amount >= Decimal::ZERO,
            "Invariant violated: remaining amount went negative: {}",
            self.remaining_amount
        );
        debug_assert_eq!(
            self.paid_amount + self.remaining_amount,
            self.total_amount,
            "Invariant violated: paid + remaining != total"
        );
    }

    /// Applies a repayment. Returns `true` when this payment completed the
    /// transaction.
    pub fn record_payment(
        &mut self,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        if !self.status.is_open() {
            return Err(LedgerError::TransactionNotActive(self.status));
        }
        if amount > self.remaining_amount {
            return Err(LedgerError::Overpayment {
                amount,
                remaining: self.remaining_amount,
            });
        }

        self.paid_amount += amount;
        self.remaining_amount -= amount;
        self.updated_at = now;

        let completed = self.remaining_amount.is_zero();
        if completed {
            self.status = TransactionStatus::Completed;
            self.completed_at = Some(now);
        }
        self.assert_invariants();
        Ok(completed)
    }

    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        now > self.due_date && self.remaining_amount > Decimal::ZERO
    }

    /// Moves an active transaction past its due date to `Overdue`.
    ///
    /// Never reopens a completed transaction. Returns whether the status
    /// changed.
    pub fn mark_overdue_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == TransactionStatus::Active && self.is_overdue_at(now) {
            self.status = TransactionStatus::Overdue;
            self.updated_at = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn open(total: Decimal, now: DateTime<Utc>) -> Transaction {
        Transaction::open(
            TransactionId(1),
            "TXN-0000BEEF".into(),
            OpenTransaction {
                merchant_id: MerchantId(1),
                customer_id: CustomerId(1),
                purchase_request_id: PurchaseRequestId(1),
                total_amount: total,
                commission_rate: dec!(0.005),
                due_date: now + Duration::days(10),
            },
            now,
        )
    }

    #[test]
    fn open_snapshots_commission() {
        let txn = open(dec!(1000), Utc::now());
        assert_eq!(txn.commission_amount, dec!(5.00));
        assert_eq!(txn.merchant_net_amount, dec!(995.00));
        assert_eq!(txn.remaining_amount, dec!(1000));
        assert_eq!(txn.status, TransactionStatus::Active);
    }

    #[test]
    fn partial_then_exact_payment_completes() {
        let now = Utc::now();
        let mut txn = open(dec!(1000), now);

        assert_eq!(txn.record_payment(dec!(333.33), now), Ok(false));
        assert_eq!(txn.remaining_amount, dec!(666.67));
        assert_eq!(txn.paid_amount, dec!(333.33));

        assert_eq!(txn.record_payment(dec!(666.67), now), Ok(true));
        assert_eq!(txn.remaining_amount, Decimal::ZERO);
        assert_eq!(txn.status, TransactionStatus::Completed);
        assert_eq!(txn.completed_at, Some(now));
    }

    #[test]
    fn overpayment_is_rejected() {
        let now = Utc::now();
        let mut txn = open(dec!(100), now);
        assert_eq!(
            txn.record_payment(dec!(100.01), now),
            Err(LedgerError::Overpayment {
                amount: dec!(100.01),
                remaining: dec!(100),
            })
        );
        assert_eq!(txn.paid_amount, Decimal::ZERO);
    }

    #[test]
    fn completed_transaction_takes_no_more_payments() {
        let now = Utc::now();
        let mut txn = open(dec!(50), now);
        txn.record_payment(dec!(50), now).unwrap();
        let completed = TransactionStatus::Completed;
        assert_eq!(
            txn.record_payment(dec!(1), now),
            Err(LedgerError::TransactionNotActive(completed))
        );
    }

    #[test]
    fn overdue_only_after_due_date_and_never_reopens() {
        let now = Utc::now();
        let mut txn = open(dec!(100), now);
        assert!(!txn.mark_overdue_if_due(now + Duration::days(10)));
        assert!(txn.mark_overdue_if_due(now + Duration::days(11)));
        assert_eq!(txn.status, TransactionStatus::Overdue);
        assert!(!txn.mark_overdue_if_due(now + Duration::days(12)));

        // Overdue transactions can still be repaid.
        assert_eq!(
            txn.record_payment(dec!(100), now + Duration::days(12)),
            Ok(true)
        );
        assert!(!txn.mark_overdue_if_due(now + Duration::days(30)));
        assert_eq!(txn.status, TransactionStatus::Completed);
    }
}
