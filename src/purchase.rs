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

//! Purchase requests.
//!
//! A merchant offers a purchase to a customer; the customer either accepts
//! it (turning it into a [`Transaction`](crate::Transaction)) or rejects it.
//!
//! ```text
//!             ┌──accept──► Accepted
//!             ├──reject──► Rejected
//!   Pending ──┼──expire──► Expired
//!             └──cancel──► Cancelled
//! ```
//!
//! All four outcomes are terminal.

use crate::base::{BranchId, CustomerId, MerchantId, PurchaseRequestId, TransactionId};
use crate::error::LedgerError;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Merchant input for a new purchase request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseRequest {
    pub customer_id: CustomerId,
    pub branch_id: Option<BranchId>,
    pub product_name: String,
    pub product_description: Option<String>,
    pub quantity: u32,
    pub unit_price: Decimal,
}

impl NewPurchaseRequest {
    pub fn new(
        customer_id: CustomerId,
        product_name: impl Into<String>,
        unit_price: Decimal,
    ) -> Self {
        Self {
            customer_id,
            branch_id: None,
            product_name: product_name.into(),
            product_description: None,
            quantity: 1,
            unit_price,
        }
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_branch(mut self, branch_id: BranchId) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.product_description = Some(description.into());
        self
    }

    /// Unit price times quantity; a product beyond the decimal range is
    /// rejected as an invalid amount.
    pub fn total_amount(&self) -> Result<Decimal, LedgerError> {
        self.unit_price
            .checked_mul(Decimal::from(self.quantity))
            .ok_or(LedgerError::InvalidAmount)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        if self.unit_price <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }
        if self.product_name.trim().is_empty() {
            return Err(LedgerError::Invalid("product name is required".into()));
        }
        self.total_amount()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub id: PurchaseRequestId,
    pub reference_number: String,
    pub merchant_id: MerchantId,
    pub customer_id: CustomerId,
    pub branch_id: Option<BranchId>,
    pub product_name: String,
    pub product_description: Option<String>,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub total_amount: Decimal,
    pub status: RequestStatus,
    pub expires_at: DateTime<Utc>,
    pub transaction_id: Option<TransactionId>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
}

impl PurchaseRequest {
    /// Builds a pending request; total and expiry are fixed here.
    pub fn new(
        id: PurchaseRequestId,
        reference_number: String,
        merchant_id: MerchantId,
        input: NewPurchaseRequest,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let total_amount = input.total_amount()?;
        Ok(Self {
            id,
            reference_number,
            merchant_id,
            customer_id: input.customer_id,
            branch_id: input.branch_id,
            product_name: input.product_name,
            product_description: input.product_description,
            quantity: input.quantity,
            unit_price: input.unit_price,
            total_amount,
            status: RequestStatus::Pending,
            expires_at: now + ttl,
            transaction_id: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            accepted_at: None,
            rejected_at: None,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Pending and not yet past its expiry.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Pending && !self.is_expired_at(now)
    }

    fn ensure_pending(&self) -> Result<(), LedgerError> {
        if self.status.is_terminal() {
            return Err(LedgerError::NotPending(self.status));
        }
        Ok(())
    }

    pub fn accept(
        &mut self,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.ensure_pending()?;
        self.status = RequestStatus::Accepted;
        self.transaction_id = Some(transaction_id);
        self.accepted_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn reject(
        &mut self,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.ensure_pending()?;
        self.status = RequestStatus::Rejected;
        self.rejection_reason = reason;
        self.rejected_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        self.ensure_pending()?;
        self.status = RequestStatus::Cancelled;
        self.updated_at = now;
        Ok(())
    }

    /// Flips a pending request past its expiry to `Expired`.
    ///
    /// Returns whether the request changed.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == RequestStatus::Pending && self.is_expired_at(now) {
            self.status = RequestStatus::Expired;
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
    use rust_decimal_macros::dec;

    fn request(now: DateTime<Utc>) -> PurchaseRequest {
        let input = NewPurchaseRequest::new(CustomerId(2), "Headphones", dec!(249.99))
            .with_description("Noise cancelling, black")
            .with_quantity(3);
        PurchaseRequest::new(
            PurchaseRequestId(1),
            "PR-0000AAAA".into(),
            MerchantId(1),
            input,
            Duration::hours(24),
            now,
        )
        .unwrap()
    }

    #[test]
    fn new_request_computes_total_and_expiry() {
        let now = Utc::now();
        let pr = request(now);
        assert_eq!(pr.total_amount, dec!(749.97));
        assert_eq!(
            pr.product_description.as_deref(),
            Some("Noise cancelling, black")
        );
        assert_eq!(pr.expires_at, now + Duration::hours(24));
        assert_eq!(pr.status, RequestStatus::Pending);
        assert!(pr.is_open_at(now));
    }

    #[test]
    fn validate_rejects_bad_input() {
        let input = NewPurchaseRequest::new(CustomerId(1), "Pen", dec!(2)).with_quantity(0);
        assert_eq!(input.validate(), Err(LedgerError::InvalidQuantity));

        let input = NewPurchaseRequest::new(CustomerId(1), "Pen", dec!(0));
        assert_eq!(input.validate(), Err(LedgerError::InvalidAmount));

        let input = NewPurchaseRequest::new(CustomerId(1), "  ", dec!(2));
        assert!(matches!(input.validate(), Err(LedgerError::Invalid(_))));
    }

    #[test]
    fn total_beyond_decimal_range_is_invalid_amount() {
        let yacht = NewPurchaseRequest::new(CustomerId(1), "Yacht", Decimal::MAX);
        assert_eq!(yacht.total_amount(), Ok(Decimal::MAX));

        let fleet = yacht.with_quantity(2);
        assert_eq!(fleet.total_amount(), Err(LedgerError::InvalidAmount));
        assert_eq!(fleet.validate(), Err(LedgerError::InvalidAmount));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let now = Utc::now();

        let mut pr = request(now);
        pr.accept(TransactionId(9), now).unwrap();
        assert_eq!(pr.transaction_id, Some(TransactionId(9)));
        assert_eq!(
            pr.reject(None, now),
            Err(LedgerError::NotPending(RequestStatus::Accepted))
        );
        assert_eq!(
            pr.cancel(now),
            Err(LedgerError::NotPending(RequestStatus::Accepted))
        );
        assert!(!pr.expire_if_due(now + Duration::days(2)));

        let mut pr = request(now);
        pr.reject(Some("changed my mind".into()), now).unwrap();
        assert_eq!(pr.rejection_reason.as_deref(), Some("changed my mind"));
        assert_eq!(
            pr.accept(TransactionId(1), now),
            Err(LedgerError::NotPending(RequestStatus::Rejected))
        );

        let mut pr = request(now);
        pr.cancel(now).unwrap();
        assert_eq!(
            pr.accept(TransactionId(1), now),
            Err(LedgerError::NotPending(RequestStatus::Cancelled))
        );
    }

    #[test]
    fn expire_only_after_deadline() {
        let now = Utc::now();
        let mut pr = request(now);
        assert!(!pr.expire_if_due(now + Duration::hours(24)));
        let just_after = now + Duration::hours(24) + Duration::seconds(1);
        assert!(pr.expire_if_due(just_after));
        assert_eq!(pr.status, RequestStatus::Expired);
        assert!(!pr.expire_if_due(now + Duration::hours(48)));
    }
}
