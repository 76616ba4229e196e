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

//! Merchant settlements and commission arithmetic.
//!
//! Income settlements are created once per transaction, at acceptance, and
//! credit the merchant with the gross amount minus platform commission.
//! Withdrawals pay the merchant's balance out to their bank and carry no
//! commission. Status moves independently of the balance effect, which is
//! applied when the settlement is created:
//! - `pending` → `processing` → `completed`
//! - `pending` / `processing` → `failed` → `processing` (retry)
//! - `pending` → `completed`

use crate::base::{MerchantId, SettlementId, TransactionId, round_money};
use crate::error::LedgerError;
use crate::merchant::BankDetails;
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Splits a gross amount into `(commission, net)` at `rate`.
///
/// Commission is rounded to two places; net is whatever is left, so the two
/// always add back up to `gross`.
pub fn split_commission(gross: Decimal, rate: Decimal) -> (Decimal, Decimal) {
    let commission = round_money(gross * rate);
    (commission, gross - commission)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementType {
    Income,
    Withdrawal,
}

impl fmt::Display for SettlementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Income => f.write_str("income"),
            Self::Withdrawal => f.write_str("withdrawal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub settlement_reference: String,
    pub merchant_id: MerchantId,
    /// Absent for withdrawals.
    pub transaction_id: Option<TransactionId>,
    pub settlement_type: SettlementType,
    pub gross_amount: Decimal,
    pub commission_rate: Decimal,
    pub commission_amount: Decimal,
    pub net_amount: Decimal,
    pub status: SettlementStatus,
    /// Bank details as they were when the settlement was created.
    pub bank: BankDetails,
    pub bank_reference: Option<String>,
    pub notes: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Settlement {
    /// Income settlement for an accepted transaction.
    pub fn income(
        id: SettlementId,
        settlement_reference: String,
        transaction: &Transaction,
        bank: BankDetails,
        status: SettlementStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let (commission_amount, net_amount) =
            split_commission(transaction.total_amount, transaction.commission_rate);
        Self {
            id,
            settlement_reference,
            merchant_id: transaction.merchant_id,
            transaction_id: Some(transaction.id),
            settlement_type: SettlementType::Income,
            gross_amount: transaction.total_amount,
            commission_rate: transaction.commission_rate,
            commission_amount,
            net_amount,
            status,
            bank,
            bank_reference: None,
            notes: Some(format!("settlement for {}", transaction.transaction_number)),
            failure_reason: None,
            created_at: now,
            processed_at: None,
            completed_at: (status == SettlementStatus::Completed).then_some(now),
        }
    }

    /// Payout of `amount` from the merchant balance.
    pub fn withdrawal(
        id: SettlementId,
        settlement_reference: String,
        merchant_id: MerchantId,
        amount: Decimal,
        bank: BankDetails,
        status: SettlementStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            settlement_reference,
            merchant_id,
            transaction_id: None,
            settlement_type: SettlementType::Withdrawal,
            gross_amount: amount,
            commission_rate: Decimal::ZERO,
            commission_amount: Decimal::ZERO,
            net_amount: amount,
            status,
            bank,
            bank_reference: None,
            notes: Some("withdrawal request".to_string()),
            failure_reason: None,
            created_at: now,
            processed_at: None,
            completed_at: (status == SettlementStatus::Completed).then_some(now),
        }
    }

    fn transition(
        &self,
        allowed: &[SettlementStatus],
        to: SettlementStatus,
    ) -> Result<(), LedgerError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(LedgerError::SettlementTransition {
                from: self.status,
                to,
            })
        }
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        self.transition(
            &[SettlementStatus::Pending, SettlementStatus::Failed],
            SettlementStatus::Processing,
        )?;
        self.status = SettlementStatus::Processing;
        self.failure_reason = None;
        self.processed_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(
        &mut self,
        bank_reference: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.transition(
            &[SettlementStatus::Pending, SettlementStatus::Processing],
            SettlementStatus::Completed,
        )?;
        self.status = SettlementStatus::Completed;
        self.bank_reference = bank_reference;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.transition(
            &[SettlementStatus::Pending, SettlementStatus::Processing],
            SettlementStatus::Failed,
        )?;
        self.status = SettlementStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.processed_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{CustomerId, PurchaseRequestId};
    use crate::transaction::OpenTransaction;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn transaction(total: Decimal, rate: Decimal) -> Transaction {
        let now = Utc::now();
        Transaction::open(
            TransactionId(7),
            "TXN-0000000A".into(),
            OpenTransaction {
                merchant_id: MerchantId(2),
                customer_id: CustomerId(3),
                purchase_request_id: PurchaseRequestId(4),
                total_amount: total,
                commission_rate: rate,
                due_date: now + Duration::days(10),
            },
            now,
        )
    }

    #[test]
    fn commission_is_rounded_and_net_absorbs_the_rest() {
        assert_eq!(
            split_commission(dec!(1000), dec!(0.005)),
            (dec!(5.00), dec!(995.00))
        );
        assert_eq!(
            split_commission(dec!(333.33), dec!(0.005)),
            (dec!(1.67), dec!(331.66))
        );
        assert_eq!(
            split_commission(dec!(10), Decimal::ZERO),
            (dec!(0), dec!(10))
        );
    }

    #[test]
    fn income_settlement_snapshots_transaction() {
        let now = Utc::now();
        let txn = transaction(dec!(1000), dec!(0.005));
        let bank = BankDetails::new("Bank", "123", "SA00");
        let stl = Settlement::income(
            SettlementId(1),
            "STL-1".into(),
            &txn,
            bank.clone(),
            SettlementStatus::Completed,
            now,
        );

        assert_eq!(stl.settlement_type, SettlementType::Income);
        assert_eq!(stl.transaction_id, Some(txn.id));
        assert_eq!(stl.merchant_id, txn.merchant_id);
        assert_eq!(stl.gross_amount, dec!(1000));
        assert_eq!(stl.commission_amount, dec!(5.00));
        assert_eq!(stl.net_amount, dec!(995.00));
        assert_eq!(stl.bank, bank);
        assert_eq!(stl.completed_at, Some(now));
    }

    #[test]
    fn withdrawal_has_no_commission() {
        let stl = Settlement::withdrawal(
            SettlementId(2),
            "STL-2".into(),
            MerchantId(1),
            dec!(250),
            BankDetails::default(),
            SettlementStatus::Pending,
            Utc::now(),
        );
        assert_eq!(stl.transaction_id, None);
        assert_eq!(stl.commission_amount, Decimal::ZERO);
        assert_eq!(stl.net_amount, dec!(250));
        assert_eq!(stl.completed_at, None);
    }

    #[test]
    fn status_transitions() {
        let now = Utc::now();
        let txn = transaction(dec!(100), dec!(0.005));
        let mut stl = Settlement::income(
            SettlementId(1),
            "STL-1".into(),
            &txn,
            BankDetails::default(),
            SettlementStatus::Pending,
            now,
        );

        stl.mark_processing(now).unwrap();
        stl.mark_failed("bank timeout", now).unwrap();
        assert_eq!(stl.failure_reason.as_deref(), Some("bank timeout"));

        stl.mark_processing(now).unwrap();
        assert_eq!(stl.failure_reason, None);
        stl.mark_completed(Some("BANK-42".into()), now).unwrap();
        assert_eq!(stl.bank_reference.as_deref(), Some("BANK-42"));

        assert_eq!(
            stl.mark_processing(now),
            Err(LedgerError::SettlementTransition {
                from: SettlementStatus::Completed,
                to: SettlementStatus::Processing,
            })
        );
        assert!(stl.mark_failed("late", now).is_err());
        assert!(stl.mark_completed(None, now).is_err());
        assert_eq!(stl.status, SettlementStatus::Completed);
    }
}
