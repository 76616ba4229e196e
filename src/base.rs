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

//! Core identifier types, money rounding and reference numbers.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! ledger_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ledger_id!(
    /// Unique identifier for a customer credit line.
    CustomerId
);
ledger_id!(
    /// Unique identifier for a merchant.
    MerchantId
);
ledger_id!(BranchId);
ledger_id!(PurchaseRequestId);
ledger_id!(
    /// Unique identifier for a BNPL transaction.
    ///
    /// A transaction exists only once its purchase request was accepted.
    TransactionId
);
ledger_id!(PlanId);
ledger_id!(ScheduleId);
ledger_id!(PaymentId);
ledger_id!(SettlementId);
ledger_id!(
    /// Identity of a platform administrator, as supplied by the caller layer.
    AdminId
);

/// Decimal places kept for amounts in SAR.
pub const MONEY_SCALE: u32 = 2;

/// Rounds an amount to two decimal places, halves away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Kind of record a reference number is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    PurchaseRequest,
    Transaction,
    Payment,
    Plan,
    Settlement,
    LimitChange,
}

impl ReferenceKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::PurchaseRequest => "PR",
            Self::Transaction => "TXN",
            Self::Payment => "PAY",
            Self::Plan => "PLAN",
            Self::Settlement => "STL",
            Self::LimitChange => "LIM",
        }
    }

    /// Generates a fresh reference number for this kind.
    ///
    /// Requests, transactions, payments and limit changes use
    /// `<prefix>-<8 hex>`; plans and settlements embed the issue time as
    /// `<prefix>-<yyyymmddHHMMSS><6 hex>`. Uniqueness is enforced by the
    /// journal, callers retry on collision.
    pub fn generate(&self, now: DateTime<Utc>) -> String {
        let hex = Uuid::new_v4().simple().to_string().to_uppercase();
        match self {
            Self::Plan | Self::Settlement => {
                let stamp = now.format("%Y%m%d%H%M%S");
                format!("{}-{}{}", self.prefix(), stamp, &hex[..6])
            }
            _ => format!("{}-{}", self.prefix(), &hex[..8]),
        }
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}
