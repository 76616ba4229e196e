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

//! Customer credit lines.
//!
//! A customer holds a credit limit split between `available_balance` (unused
//! credit) and `outstanding_balance` (credit extended and not yet repaid).
//!
//! ```text
//!   debit(amount)   available ──► outstanding   (purchase accepted)
//!   credit(amount)  outstanding ──► available   (payment received)
//!   change_limit    available += new_limit - credit_limit
//! ```
//!
//! # Example
//!
//! ```
//! use bnpl_ledger::{Customer, CustomerId, NewCustomer};
//! use chrono::Utc;
//! use rust_decimal_macros::dec;
//!
//! let now = Utc::now();
//! let mut customer = Customer::new(
//!     CustomerId(1),
//!     NewCustomer::new("user-1"),
//!     "ABCD2345".into(),
//!     dec!(5000),
//!     50,
//!     now,
//! );
//! customer.debit(dec!(1000), now).unwrap();
//! assert_eq!(customer.available_balance, dec!(4000));
//! assert_eq!(customer.outstanding_balance, dec!(1000));
//! ```

use crate::base::{AdminId, CustomerId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Alphabet for customer codes; 0, O, 1, I and L are left out.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;

/// Generates a human-friendly customer code merchants can type in.
pub fn generate_customer_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| {
            let index = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[index] as char
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerStatus {
    Active,
    Suspended,
    Blocked,
}

impl fmt::Display for CustomerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

impl FromStr for CustomerStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "blocked" => Ok(Self::Blocked),
            other => Err(LedgerError::Invalid(format!(
                "customer status '{other}'; must be active, suspended or blocked"
            ))),
        }
    }
}

/// Registration input for a customer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCustomer {
    /// Identity reference issued by the authentication layer.
    pub user_ref: String,
    pub national_id: Option<String>,
    /// Overrides the configured default credit limit.
    pub credit_limit: Option<Decimal>,
}

impl NewCustomer {
    pub fn new(user_ref: impl Into<String>) -> Self {
        Self {
            user_ref: user_ref.into(),
            ..Self::default()
        }
    }

    pub fn with_national_id(mut self, national_id: impl Into<String>) -> Self {
        self.national_id = Some(national_id.into());
        self
    }

    pub fn with_credit_limit(mut self, limit: Decimal) -> Self {
        self.credit_limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub user_ref: String,
    pub customer_code: String,
    pub national_id: Option<String>,
    pub credit_limit: Decimal,
    pub available_balance: Decimal,
    pub outstanding_balance: Decimal,
    pub status: CustomerStatus,
    /// Stored as supplied; 0-100, higher means lower risk.
    pub risk_score: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn new(
        id: CustomerId,
        input: NewCustomer,
        customer_code: String,
        credit_limit: Decimal,
        risk_score: u8,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_ref: input.user_ref,
            customer_code,
            national_id: input.national_id,
            credit_limit,
            available_balance: credit_limit,
            outstanding_balance: Decimal::ZERO,
            status: CustomerStatus::Active,
            risk_score,
            created_at: now,
            updated_at: now,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.outstanding_balance >= Decimal::ZERO,
            "Invariant violated: outstanding balance went negative: {}",
            self.outstanding_balance
        );
        debug_assert!(
            self.available_balance >= Decimal::ZERO,
            "Invariant violated: available balance went negative: {}",
            self.available_balance
        );
    }

    /// True when `available_balance + outstanding_balance == credit_limit`.
    pub fn is_balanced(&self) -> bool {
        self.available_balance + self.outstanding_balance == self.credit_limit
    }

    pub fn is_active(&self) -> bool {
        self.status == CustomerStatus::Active
    }

    pub fn can_afford(&self, amount: Decimal) -> bool {
        self.is_active() && self.available_balance >= amount
    }

    /// Extends credit: moves `amount` from available to outstanding.
    pub fn debit(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        if !self.is_active() {
            return Err(LedgerError::CustomerInactive);
        }
        if !self.can_afford(amount) {
            return Err(LedgerError::InsufficientCredit {
                required: amount,
                available: self.available_balance,
            });
        }
        self.available_balance -= amount;
        self.outstanding_balance += amount;
        self.updated_at = now;
        self.assert_invariants();
        Ok(())
    }

    /// Restores credit after a payment or refund.
    ///
    /// Outstanding balance is floored at zero.
    pub fn credit(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.available_balance += amount;
        self.outstanding_balance = (self.outstanding_balance - amount).max(Decimal::ZERO);
        self.updated_at = now;
        self.assert_invariants();
    }

    /// Moves the limit; available balance shifts by the same delta.
    pub fn change_limit(
        &mut self,
        new_limit: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if new_limit < self.outstanding_balance {
            return Err(LedgerError::LimitBelowOutstanding {
                requested: new_limit,
                outstanding: self.outstanding_balance,
            });
        }
        self.available_balance += new_limit - self.credit_limit;
        self.credit_limit = new_limit;
        self.updated_at = now;
        self.assert_invariants();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitChangeStatus {
    Pending,
    Approved,
    Rejected,
}

/// Who approved a limit change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approver {
    /// Within the auto-approve ceiling.
    Auto,
    /// Above the ceiling; still approved automatically, tagged for review.
    AutoHighLimit,
    Admin(AdminId),
}

impl fmt::Display for Approver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::AutoHighLimit => f.write_str("auto_high_limit"),
            Self::Admin(id) => write!(f, "{id}"),
        }
    }
}

/// Audit row for one credit-limit change. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerLimitHistory {
    pub customer_id: CustomerId,
    pub reference: String,
    pub previous_limit: Decimal,
    pub new_limit: Decimal,
    pub requested_limit: Decimal,
    pub status: LimitChangeStatus,
    pub reason: Option<String>,
    pub approved_by: Approver,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn customer(limit: Decimal) -> Customer {
        Customer::new(
            CustomerId(1),
            NewCustomer::new("u-1"),
            generate_customer_code(),
            limit,
            50,
            Utc::now(),
        )
    }

    #[test]
    fn new_customer_has_full_available_balance() {
        let c = customer(dec!(5000));
        assert_eq!(c.available_balance, dec!(5000));
        assert_eq!(c.outstanding_balance, Decimal::ZERO);
        assert!(c.is_active());
        assert!(c.is_balanced());
    }

    #[test]
    fn debit_moves_available_to_outstanding() {
        let mut c = customer(dec!(5000));
        c.debit(dec!(1200.50), Utc::now()).unwrap();
        assert_eq!(c.available_balance, dec!(3799.50));
        assert_eq!(c.outstanding_balance, dec!(1200.50));
        assert!(c.is_balanced());
    }

    #[test]
    fn debit_beyond_available_reports_both_amounts() {
        let mut c = customer(dec!(500));
        let result = c.debit(dec!(800), Utc::now());
        assert_eq!(
            result,
            Err(LedgerError::InsufficientCredit {
                required: dec!(800),
                available: dec!(500),
            })
        );
        assert_eq!(c.available_balance, dec!(500));
    }

    #[test]
    fn suspended_customer_cannot_afford_anything() {
        let mut c = customer(dec!(5000));
        c.status = CustomerStatus::Suspended;
        assert!(!c.can_afford(dec!(1)));
        assert_eq!(
            c.debit(dec!(1), Utc::now()),
            Err(LedgerError::CustomerInactive)
        );
    }

    #[test]
    fn credit_restores_available_and_floors_outstanding() {
        let mut c = customer(dec!(5000));
        c.debit(dec!(1000), Utc::now()).unwrap();
        c.credit(dec!(400), Utc::now());
        assert_eq!(c.available_balance, dec!(4400));
        assert_eq!(c.outstanding_balance, dec!(600));
        assert!(c.is_balanced());

        c.credit(dec!(700), Utc::now());
        assert_eq!(c.outstanding_balance, Decimal::ZERO);
    }

    #[test]
    fn change_limit_shifts_available_by_delta() {
        let mut c = customer(dec!(5000));
        c.debit(dec!(1000), Utc::now()).unwrap();

        c.change_limit(dec!(8000), Utc::now()).unwrap();
        assert_eq!(c.credit_limit, dec!(8000));
        assert_eq!(c.available_balance, dec!(7000));
        assert!(c.is_balanced());

        c.change_limit(dec!(1000), Utc::now()).unwrap();
        assert_eq!(c.available_balance, Decimal::ZERO);
        assert!(c.is_balanced());
    }

    #[test]
    fn change_limit_below_outstanding_fails() {
        let mut c = customer(dec!(5000));
        c.debit(dec!(3000), Utc::now()).unwrap();
        assert_eq!(
            c.change_limit(dec!(2999.99), Utc::now()),
            Err(LedgerError::LimitBelowOutstanding {
                requested: dec!(2999.99),
                outstanding: dec!(3000),
            })
        );
        assert_eq!(c.credit_limit, dec!(5000));
    }

    #[test]
    fn customer_codes_use_unambiguous_alphabet() {
        for _ in 0..100 {
            let code = generate_customer_code();
            assert_eq!(code.len(), 8);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn status_parses_from_text() {
        assert_eq!(
            "Suspended".parse::<CustomerStatus>(),
            Ok(CustomerStatus::Suspended)
        );
        assert!("frozen".parse::<CustomerStatus>().is_err());
    }

    #[test]
    fn approver_tags() {
        assert_eq!(Approver::Auto.to_string(), "auto");
        assert_eq!(Approver::AutoHighLimit.to_string(), "auto_high_limit");
        assert_eq!(Approver::Admin(AdminId(7)).to_string(), "7");
    }
}
