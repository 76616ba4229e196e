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

//! Error types for ledger operations.
//!
//! Every failure carries enough structure for the caller layer to map it to
//! a user-facing response; [`LedgerError::kind`] gives the coarse category.

use crate::purchase::RequestStatus;
use crate::settlement::SettlementStatus;
use crate::transaction::TransactionStatus;
use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

/// Coarse error category handed to the caller layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The referenced entity does not exist.
    NotFound,
    /// Caller role or ownership mismatch.
    Forbidden,
    /// Malformed or out-of-range input.
    Validation,
    /// Domain rule violation.
    Business,
    /// Uniqueness violation.
    Conflict,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Validation => "validation_error",
            Self::Business => "business_error",
            Self::Conflict => "conflict",
        };
        f.write_str(name)
    }
}

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Referenced entity does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Caller is not allowed to act on this entity
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// Amount is zero or negative
    #[error("amount must be positive")]
    InvalidAmount,

    /// Quantity is zero
    #[error("quantity must be at least 1")]
    InvalidQuantity,

    /// Installment count outside the offered plans
    #[error("invalid plan type {0}; options: 1, 3, 6, 12, 18, 24 months")]
    InvalidPlanType(u32),

    /// Credit limit is zero or negative
    #[error("credit limit must be positive")]
    InvalidCreditLimit,

    /// Free-form input rejected by validation
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Customer credit line cannot cover the amount
    #[error("insufficient credit: required {required} SAR, available {available} SAR")]
    InsufficientCredit {
        required: Decimal,
        available: Decimal,
    },

    /// Merchant balance cannot cover the withdrawal
    #[error("insufficient balance: required {required} SAR, available {available} SAR")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },

    /// Customer account is suspended or blocked
    #[error("customer account is not active")]
    CustomerInactive,

    /// Merchant account is not active
    #[error("merchant account is not active")]
    MerchantInactive,

    /// Purchase request already left the pending state
    #[error("purchase request is already {0}")]
    NotPending(RequestStatus),

    /// Purchase request passed its expiry time
    #[error("purchase request has expired")]
    RequestExpired,

    /// New limit would not cover the outstanding balance
    #[error("cannot reduce limit below outstanding balance ({outstanding} SAR)")]
    LimitBelowOutstanding {
        requested: Decimal,
        outstanding: Decimal,
    },

    /// New limit exceeds the platform maximum
    #[error("maximum credit limit is {maximum} SAR")]
    LimitAboveMaximum {
        requested: Decimal,
        maximum: Decimal,
    },

    /// Payment would exceed what is still owed
    #[error("payment amount ({amount} SAR) exceeds remaining balance ({remaining} SAR)")]
    Overpayment {
        amount: Decimal,
        remaining: Decimal,
    },

    /// Transaction status does not allow the operation
    #[error("transaction is {0}")]
    TransactionNotActive(TransactionStatus),

    /// Transaction must be fully repaid first
    #[error("transaction is {0}; only completed transactions can be settled")]
    TransactionNotCompleted(TransactionStatus),

    /// Transaction already carries a repayment plan
    #[error("transaction already has a repayment plan")]
    PlanAlreadyExists,

    /// Repayment schedule was already generated for the plan
    #[error("repayment schedule already generated")]
    ScheduleAlreadyGenerated,

    /// An income settlement exists for the transaction
    #[error("settlement already exists for this transaction")]
    DuplicateSettlement,

    /// Settlement status transition not allowed
    #[error("settlement cannot move from {from} to {to}")]
    SettlementTransition {
        from: SettlementStatus,
        to: SettlementStatus,
    },

    /// Uniqueness violation on registration or reference numbers
    #[error("conflict: {0}")]
    Conflict(String),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::InvalidAmount
            | Self::InvalidQuantity
            | Self::InvalidPlanType(_)
            | Self::InvalidCreditLimit
            | Self::Invalid(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InsufficientCredit { .. }
            | Self::InsufficientBalance { .. }
            | Self::CustomerInactive
            | Self::MerchantInactive
            | Self::NotPending(_)
            | Self::RequestExpired
            | Self::LimitBelowOutstanding { .. }
            | Self::LimitAboveMaximum { .. }
            | Self::Overpayment { .. }
            | Self::TransactionNotActive(_)
            | Self::TransactionNotCompleted(_)
            | Self::PlanAlreadyExists
            | Self::ScheduleAlreadyGenerated
            | Self::DuplicateSettlement
            | Self::SettlementTransition { .. } => ErrorKind::Business,
        }
    }
}
