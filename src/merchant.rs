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

//! Merchants, their branches and settlement balance.
//!
//! `balance` holds net-of-commission funds the merchant may withdraw. It
//! grows through income settlements and shrinks through withdrawals.

use crate::base::{BranchId, MerchantId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MerchantStatus {
    Active,
    Suspended,
    PendingApproval,
    Blocked,
}

impl fmt::Display for MerchantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::PendingApproval => "pending_approval",
            Self::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

impl FromStr for MerchantStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "pending_approval" => Ok(Self::PendingApproval),
            "blocked" => Ok(Self::Blocked),
            other => Err(LedgerError::Invalid(format!("merchant status '{other}'"))),
        }
    }
}

/// Payout destination, snapshotted onto every settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub bank_name: Option<String>,
    pub bank_account: Option<String>,
    pub iban: Option<String>,
}

impl BankDetails {
    pub fn new(
        bank_name: impl Into<String>,
        bank_account: impl Into<String>,
        iban: impl Into<String>,
    ) -> Self {
        Self {
            bank_name: Some(bank_name.into()),
            bank_account: Some(bank_account.into()),
            iban: Some(iban.into()),
        }
    }
}

/// Registration input for a merchant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMerchant {
    pub user_ref: String,
    pub shop_name: String,
    pub shop_name_ar: Option<String>,
    pub commercial_registration: Option<String>,
    pub vat_number: Option<String>,
    pub city: Option<String>,
    pub bank: BankDetails,
}

impl NewMerchant {
    pub fn new(user_ref: impl Into<String>, shop_name: impl Into<String>) -> Self {
        Self {
            user_ref: user_ref.into(),
            shop_name: shop_name.into(),
            ..Self::default()
        }
    }

    pub fn with_commercial_registration(mut self, cr: impl Into<String>) -> Self {
        self.commercial_registration = Some(cr.into());
        self
    }

    pub fn with_bank(mut self, bank: BankDetails) -> Self {
        self.bank = bank;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: MerchantId,
    pub user_ref: String,
    pub shop_name: String,
    pub shop_name_ar: Option<String>,
    pub commercial_registration: Option<String>,
    pub vat_number: Option<String>,
    pub city: Option<String>,
    pub bank: BankDetails,
    pub status: MerchantStatus,
    pub is_verified: bool,
    pub total_transactions: u64,
    pub total_volume: Decimal,
    pub balance: Decimal,
    pub total_commission_paid: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Merchant {
    pub fn new(id: MerchantId, input: NewMerchant, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_ref: input.user_ref,
            shop_name: input.shop_name,
            shop_name_ar: input.shop_name_ar,
            commercial_registration: input.commercial_registration,
            vat_number: input.vat_number,
            city: input.city,
            bank: input.bank,
            status: MerchantStatus::Active,
            is_verified: false,
            total_transactions: 0,
            total_volume: Decimal::ZERO,
            balance: Decimal::ZERO,
            total_commission_paid: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.balance >= Decimal::ZERO,
            "Invariant violated: merchant balance went negative: {}",
            self.balance
        );
    }

    pub fn is_active(&self) -> bool {
        self.status == MerchantStatus::Active
    }

    /// Counts an accepted sale towards the merchant's statistics.
    pub fn record_sale(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.total_transactions += 1;
        self.total_volume += amount;
        self.updated_at = now;
    }

    /// Credits an income settlement.
    pub fn accrue(&mut self, net_amount: Decimal, commission_amount: Decimal, now: DateTime<Utc>) {
        self.balance += net_amount;
        self.total_commission_paid += commission_amount;
        self.updated_at = now;
        self.assert_invariants();
    }

    pub fn withdraw(&mut self, amount: Decimal, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        if amount > self.balance {
            return Err(LedgerError::InsufficientBalance {
                required: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        self.updated_at = now;
        self.assert_invariants();
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBranch {
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub phone: Option<String>,
}

impl NewBranch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A merchant location; descriptive only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub merchant_id: MerchantId,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(
        id: BranchId,
        merchant_id: MerchantId,
        input: NewBranch,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            merchant_id,
            name: input.name,
            address: input.address,
            city: input.city,
            phone: input.phone,
            is_active: true,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn merchant() -> Merchant {
        let input = NewMerchant::new("m-1", "Jarir Books");
        Merchant::new(MerchantId(1), input, Utc::now())
    }

    #[test]
    fn new_merchant_is_active_and_unverified() {
        let m = merchant();
        assert!(m.is_active());
        assert!(!m.is_verified);
        assert_eq!(m.balance, Decimal::ZERO);
    }

    #[test]
    fn accrue_adds_net_and_tracks_commission() {
        let mut m = merchant();
        m.accrue(dec!(995.00), dec!(5.00), Utc::now());
        m.accrue(dec!(199.00), dec!(1.00), Utc::now());
        assert_eq!(m.balance, dec!(1194.00));
        assert_eq!(m.total_commission_paid, dec!(6.00));
    }

    #[test]
    fn withdraw_more_than_balance_fails_and_leaves_balance() {
        let mut m = merchant();
        m.accrue(dec!(100), dec!(0.50), Utc::now());
        assert_eq!(
            m.withdraw(dec!(100.01), Utc::now()),
            Err(LedgerError::InsufficientBalance {
                required: dec!(100.01),
                available: dec!(100),
            })
        );
        assert_eq!(m.balance, dec!(100));

        m.withdraw(dec!(100), Utc::now()).unwrap();
        assert_eq!(m.balance, Decimal::ZERO);
    }

    #[test]
    fn withdraw_rejects_non_positive_amount() {
        let mut m = merchant();
        assert_eq!(
            m.withdraw(Decimal::ZERO, Utc::now()),
            Err(LedgerError::InvalidAmount)
        );
    }

    #[test]
    fn record_sale_updates_counters() {
        let mut m = merchant();
        m.record_sale(dec!(250), Utc::now());
        m.record_sale(dec!(750), Utc::now());
        assert_eq!(m.total_transactions, 2);
        assert_eq!(m.total_volume, dec!(1000));
    }

    #[test]
    fn status_round_trips_through_text() {
        let status: MerchantStatus = "pending_approval".parse().unwrap();
        assert_eq!(status, MerchantStatus::PendingApproval);
        assert_eq!(status.to_string(), "pending_approval");
    }
}
