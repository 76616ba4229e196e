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

//! Authenticated caller context.
//!
//! Identity and role are verified by the layer in front of the ledger; the
//! engine only checks that the role fits the operation and that the caller
//! owns the records it touches.

use crate::base::{AdminId, CustomerId, MerchantId};
use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "lowercase")]
pub enum Caller {
    Customer(CustomerId),
    Merchant(MerchantId),
    Admin(AdminId),
}

impl Caller {
    pub fn customer(&self) -> Result<CustomerId, LedgerError> {
        match self {
            Self::Customer(id) => Ok(*id),
            _ => Err(LedgerError::Forbidden("customer role required")),
        }
    }

    pub fn merchant(&self) -> Result<MerchantId, LedgerError> {
        match self {
            Self::Merchant(id) => Ok(*id),
            _ => Err(LedgerError::Forbidden("merchant role required")),
        }
    }

    pub fn admin(&self) -> Result<AdminId, LedgerError> {
        match self {
            Self::Admin(id) => Ok(*id),
            _ => Err(LedgerError::Forbidden("admin role required")),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin(_))
    }

    /// The customer themself, or an admin.
    pub fn ensure_customer(&self, customer_id: CustomerId) -> Result<(), LedgerError> {
        match self {
            Self::Customer(id) if *id == customer_id => Ok(()),
            Self::Admin(_) => Ok(()),
            _ => Err(LedgerError::Forbidden("record belongs to another customer")),
        }
    }

    /// The merchant themself, or an admin.
    pub fn ensure_merchant(&self, merchant_id: MerchantId) -> Result<(), LedgerError> {
        match self {
            Self::Merchant(id) if *id == merchant_id => Ok(()),
            Self::Admin(_) => Ok(()),
            _ => Err(LedgerError::Forbidden("record belongs to another merchant")),
        }
    }

    /// Either side of a purchase, or an admin.
    pub fn ensure_party(
        &self,
        customer_id: CustomerId,
        merchant_id: MerchantId,
    ) -> Result<(), LedgerError> {
        match self {
            Self::Customer(id) if *id == customer_id => Ok(()),
            Self::Merchant(id) if *id == merchant_id => Ok(()),
            Self::Admin(_) => Ok(()),
            _ => Err(LedgerError::Forbidden("not a party to this purchase")),
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Customer(id) => write!(f, "customer:{id}"),
            Self::Merchant(id) => write!(f, "merchant:{id}"),
            Self::Admin(id) => write!(f, "admin:{id}"),
        }
    }
}
