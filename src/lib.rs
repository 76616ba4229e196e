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

//! # BNPL Ledger
//!
//! This library provides a buy-now-pay-later ledger: customer credit lines,
//! merchant purchase requests, transactions with installment plans,
//! customer payments, and merchant settlements net of platform commission.
//!
//! ## Core Components
//!
//! - [`Ledger`]: Runs every operation as one atomic unit of work
//! - [`Customer`]: Credit line with available and outstanding balances
//! - [`PurchaseRequest`]: Merchant offer that becomes a [`Transaction`] once accepted
//! - [`RepaymentPlan`]: Monthly installment schedule for a transaction
//! - [`Settlement`]: Merchant income or withdrawal record
//! - [`LedgerError`]: Error types for ledger operation failures
//!
//! ## Example
//!
//! ```
//! use bnpl_ledger::{
//!     Caller, Ledger, LedgerConfig, NewCustomer, NewMerchant, NewPurchaseRequest, PaymentMethod,
//!     PaymentTarget, PlanType,
//! };
//! use rust_decimal_macros::dec;
//!
//! let ledger = Ledger::new(LedgerConfig::default());
//! let customer = ledger.register_customer(NewCustomer::new("user-1")).unwrap();
//! let merchant = ledger
//!     .register_merchant(NewMerchant::new("user-2", "Tech Store"))
//!     .unwrap();
//! let as_customer = Caller::Customer(customer.id);
//! let as_merchant = Caller::Merchant(merchant.id);
//!
//! // The merchant offers a purchase; the customer takes it over three months.
//! let phone = NewPurchaseRequest::new(customer.id, "Phone", dec!(1000));
//! let request = ledger.create_purchase_request(&as_merchant, phone).unwrap();
//! let accepted = ledger
//!     .accept_purchase_request(&as_customer, request.id, Some(PlanType::ThreeMonths))
//!     .unwrap();
//! assert_eq!(accepted.settlement.net_amount, dec!(995.00));
//!
//! // Paying the first installment.
//! let target = PaymentTarget::Transaction(accepted.transaction.id);
//! let receipt = ledger
//!     .make_payment(&as_customer, target, dec!(333.33), PaymentMethod::Wallet)
//!     .unwrap();
//! assert_eq!(receipt.remaining_amount, dec!(666.67));
//! assert_eq!(receipt.installment_number, Some(1));
//! ```
//!
//! ## Thread Safety
//!
//! The ledger is `Sync`; operations on different customers and merchants
//! run in parallel, and operations that share rows serialize on row locks.

mod base;
mod caller;
mod clock;
pub mod config;
mod customer;
mod engine;
pub mod error;
pub mod journal;
mod merchant;
mod payment;
mod purchase;
mod repayment;
mod settlement;
pub mod store;
mod transaction;

pub use base::{
    AdminId, BranchId, CustomerId, MONEY_SCALE, MerchantId, PaymentId, PlanId, PurchaseRequestId,
    ReferenceKind, ScheduleId, SettlementId, TransactionId, round_money,
};
pub use caller::Caller;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use customer::{
    Approver, Customer, CustomerLimitHistory, CustomerStatus, LimitChangeStatus, NewCustomer,
    generate_customer_code,
};
pub use engine::{Acceptance, InstallmentDue, Ledger, OverdueSweep};
pub use error::{ErrorKind, LedgerError};
pub use journal::{EventKind, Journal, LedgerEvent};
pub use merchant::{BankDetails, Branch, Merchant, MerchantStatus, NewBranch, NewMerchant};
pub use payment::{Payment, PaymentMethod, PaymentReceipt, PaymentStatus, PaymentTarget};
pub use purchase::{NewPurchaseRequest, PurchaseRequest, RequestStatus};
pub use repayment::{
    PlanStatus, PlanType, RepaymentPlan, RepaymentSchedule, ScheduleStatus, installment_amounts,
};
pub use settlement::{Settlement, SettlementStatus, SettlementType, split_commission};
pub use store::{MemoryStore, UnitOfWork};
pub use transaction::{OpenTransaction, Transaction, TransactionStatus};
