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

//! Customer payments.
//!
//! A payment row is written once, already `completed`, and never edited.

use crate::base::{CustomerId, PaymentId, PlanId, ScheduleId, TransactionId};
use crate::error::LedgerError;
use crate::transaction::TransactionStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    Wallet,
    Card,
    BankTransfer,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Wallet => "wallet",
            Self::Card => "card",
            Self::BankTransfer => "bank_transfer",
        };
        f.write_str(name)
    }
}

impl FromStr for PaymentMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wallet" => Ok(Self::Wallet),
            "card" => Ok(Self::Card),
            "bank_transfer" => Ok(Self::BankTransfer),
            other => Err(LedgerError::Invalid(format!("payment method '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        };
        f.write_str(name)
    }
}

/// What a payment is made against. Plan payments resolve to the plan's
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTarget {
    Transaction(TransactionId),
    Plan(PlanId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub payment_reference: String,
    pub transaction_id: TransactionId,
    pub customer_id: CustomerId,
    /// The installment this payment retired, if any.
    pub repayment_schedule_id: Option<ScheduleId>,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub payment_date: DateTime<Utc>,
}

impl Payment {
    #[allow(clippy::too_many_arguments)]
    pub fn completed(
        id: PaymentId,
        payment_reference: String,
        transaction_id: TransactionId,
        customer_id: CustomerId,
        repayment_schedule_id: Option<ScheduleId>,
        amount: Decimal,
        payment_method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payment_reference,
            transaction_id,
            customer_id,
            repayment_schedule_id,
            amount,
            payment_method,
            status: PaymentStatus::Completed,
            payment_date: now,
        }
    }
}

/// A payment together with the transaction state it left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub transaction_number: String,
    pub transaction_status: TransactionStatus,
    pub remaining_amount: Decimal,
    pub installment_number: Option<u32>,
}
