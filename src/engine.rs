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

//! Ledger operations.
//!
//! The [`Ledger`] is the central component: every public operation runs as
//! one [`UnitOfWork`] against the [`MemoryStore`], so either all of its
//! changes become visible or none do.
//!
//! # Operations
//!
//! - **Registration**: customers, merchants and branches.
//! - **Credit**: limit changes with an append-only history.
//! - **Purchase lifecycle**: create, accept, reject, cancel, expire.
//! - **Payments**: against a transaction or its repayment plan.
//! - **Settlements**: one income settlement per transaction, withdrawals,
//!   and the administrative status transitions.
//! - **Sweeps**: request expiry and overdue marking. Both are idempotent.
//!
//! # Thread Safety
//!
//! Operations on unrelated customers and merchants run in parallel. Rows
//! shared by two operations are locked in a fixed order (see
//! [`store`](crate::store)), so racing operations serialize instead of
//! deadlocking. Two customers accepting the same request, or two payments
//! against one transaction, are applied one after the other; the loser of
//! an accept race sees [`LedgerError::NotPending`].

use crate::base::{
    BranchId, CustomerId, MerchantId, PaymentId, PlanId, PurchaseRequestId, ReferenceKind,
    ScheduleId, SettlementId, TransactionId,
};
use crate::caller::Caller;
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::customer::{
    Approver, Customer, CustomerLimitHistory, CustomerStatus, LimitChangeStatus, NewCustomer,
    generate_customer_code,
};
use crate::error::LedgerError;
use crate::journal::{EventKind, Journal, LedgerEvent};
use crate::merchant::{BankDetails, Branch, Merchant, MerchantStatus, NewBranch, NewMerchant};
use crate::payment::{Payment, PaymentMethod, PaymentReceipt, PaymentTarget};
use crate::purchase::{NewPurchaseRequest, PurchaseRequest, RequestStatus};
use crate::repayment::{PlanStatus, PlanType, RepaymentPlan, RepaymentSchedule};
use crate::settlement::{Settlement, SettlementStatus, SettlementType};
use crate::store::{MemoryStore, UniqueKey, UnitOfWork};
use crate::transaction::{OpenTransaction, Transaction, TransactionStatus};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything an accepted purchase request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub request: PurchaseRequest,
    pub transaction: Transaction,
    pub plan: RepaymentPlan,
    pub settlement: Settlement,
}

/// An unpaid installment together with the plan it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallmentDue {
    pub plan_id: PlanId,
    pub plan_reference: String,
    pub transaction_id: TransactionId,
    pub installment: RepaymentSchedule,
}

/// Counts of records changed by [`Ledger::sweep_overdue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverdueSweep {
    pub transactions: usize,
    pub installments: usize,
}

/// BNPL ledger engine.
///
/// # Invariants
///
/// - `available_balance + outstanding_balance == credit_limit` for every
///   customer after every operation.
/// - `paid_amount + remaining_amount == total_amount` for every
///   transaction and plan.
/// - At most one income settlement exists per transaction.
/// - Purchase requests never leave a terminal state.
pub struct Ledger {
    store: MemoryStore,
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    /// Creates an empty ledger on the system clock.
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: MemoryStore::new(),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Direct access to the tables, bypassing caller checks.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn journal(&self) -> &Journal {
        self.store.journal()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn initial_settlement_status(&self) -> SettlementStatus {
        if self.config.settle_immediately {
            SettlementStatus::Completed
        } else {
            SettlementStatus::Pending
        }
    }

    // -- registration -------------------------------------------------------

    /// Opens a credit line for a verified user.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Conflict`] - User or national id already registered.
    /// - [`LedgerError::InvalidCreditLimit`] - Requested limit not positive.
    /// - [`LedgerError::LimitAboveMaximum`] - Requested limit above the maximum.
    pub fn register_customer(&self, input: NewCustomer) -> Result<Customer, LedgerError> {
        if input.user_ref.trim().is_empty() {
            return Err(LedgerError::Invalid("user reference is empty".into()));
        }
        let credit_limit = match input.credit_limit {
            Some(limit) => limit,
            None => self.config.default_credit_limit,
        };
        self.check_limit_bounds(credit_limit)?;

        let taken = |key: &UniqueKey| self.store.lookup(key).is_some();
        let user_key = UniqueKey::CustomerUser(input.user_ref.clone());
        if taken(&user_key) {
            return Err(LedgerError::Conflict(format!(
                "user {} already has a customer profile",
                input.user_ref
            )));
        }
        let national_key = input.national_id.clone().map(UniqueKey::NationalId);
        if national_key.as_ref().is_some_and(taken) {
            let message = "national id already registered";
            return Err(LedgerError::Conflict(message.into()));
        }

        let code = loop {
            let code = generate_customer_code();
            if !taken(&UniqueKey::CustomerCode(code.clone())) {
                break code;
            }
        };

        let mut uow = self.store.begin(self.now());
        let id = uow.next_customer_id();
        let customer = Customer::new(
            id,
            input,
            code.clone(),
            credit_limit,
            self.config.default_risk_score,
            uow.now(),
        );
        uow.claim(user_key, id.0);
        uow.claim(UniqueKey::CustomerCode(code.clone()), id.0);
        if let Some(key) = national_key {
            uow.claim(key, id.0);
        }
        uow.insert_customer(customer.clone());
        let event = LedgerEvent::new(EventKind::CustomerRegistered, code, uow.now());
        uow.record(event.with_amount(credit_limit));
        uow.commit()?;

        info!(
            customer_id = %id,
            code = %customer.customer_code,
            limit = %credit_limit,
            "customer registered"
        );
        Ok(customer)
    }

    /// Registers a merchant. New merchants are active but unverified.
    pub fn register_merchant(&self, input: NewMerchant) -> Result<Merchant, LedgerError> {
        if input.user_ref.trim().is_empty() {
            return Err(LedgerError::Invalid("user reference is empty".into()));
        }
        if input.shop_name.trim().is_empty() {
            return Err(LedgerError::Invalid("shop name is empty".into()));
        }

        let taken = |key: &UniqueKey| self.store.lookup(key).is_some();
        let user_key = UniqueKey::MerchantUser(input.user_ref.clone());
        if taken(&user_key) {
            return Err(LedgerError::Conflict(format!(
                "user {} already has a merchant profile",
                input.user_ref
            )));
        }
        let cr_key = input
            .commercial_registration
            .clone()
            .map(UniqueKey::CommercialRegistration);
        if cr_key.as_ref().is_some_and(taken) {
            let message = "commercial registration already registered";
            return Err(LedgerError::Conflict(message.into()));
        }

        let mut uow = self.store.begin(self.now());
        let id = uow.next_merchant_id();
        let merchant = Merchant::new(id, input, uow.now());
        uow.claim(user_key, id.0);
        if let Some(key) = cr_key {
            uow.claim(key, id.0);
        }
        uow.insert_merchant(merchant.clone());
        uow.record(LedgerEvent::new(
            EventKind::MerchantRegistered,
            merchant_reference(id),
            uow.now(),
        ));
        uow.commit()?;

        info!(merchant_id = %id, shop = %merchant.shop_name, "merchant registered");
        Ok(merchant)
    }

    pub fn add_branch(&self, caller: &Caller, input: NewBranch) -> Result<Branch, LedgerError> {
        let merchant_id = caller.merchant()?;
        if input.name.trim().is_empty() {
            return Err(LedgerError::Invalid("branch name is empty".into()));
        }

        let mut uow = self.store.begin(self.now());
        uow.lock_merchant(merchant_id)?;
        let id = uow.next_branch_id();
        let branch = Branch::new(id, merchant_id, input, uow.now());
        uow.insert_branch(branch.clone());
        uow.commit()?;

        info!(merchant_id = %merchant_id, branch_id = %branch.id, "branch added");
        Ok(branch)
    }

    pub fn deactivate_branch(
        &self,
        caller: &Caller,
        branch_id: BranchId,
    ) -> Result<Branch, LedgerError> {
        let merchant_id = caller.merchant()?;
        let peek = self.store.branches.fetch(branch_id)?;
        if peek.merchant_id != merchant_id {
            return Err(LedgerError::Forbidden("branch belongs to another merchant"));
        }

        let mut uow = self.store.begin(self.now());
        let mut branch = uow.lock_branch(branch_id)?;
        branch.is_active = false;
        uow.put_branch(branch.clone());
        uow.commit()?;

        info!(merchant_id = %merchant_id, branch_id = %branch_id, "branch deactivated");
        Ok(branch)
    }

    pub fn set_customer_status(
        &self,
        caller: &Caller,
        customer_id: CustomerId,
        status: CustomerStatus,
    ) -> Result<Customer, LedgerError> {
        let admin = caller.admin()?;

        let mut uow = self.store.begin(self.now());
        let mut customer = uow.lock_customer(customer_id)?;
        customer.status = status;
        customer.updated_at = uow.now();
        uow.put_customer(customer.clone());
        uow.record(LedgerEvent::new(
            EventKind::CustomerStatusChanged,
            &customer.customer_code,
            uow.now(),
        ));
        uow.commit()?;

        info!(
            admin_id = %admin,
            customer_id = %customer_id,
            status = %status,
            "customer status changed"
        );
        Ok(customer)
    }

    /// Changes a merchant's status and, when given, its verification flag.
    pub fn set_merchant_status(
        &self,
        caller: &Caller,
        merchant_id: MerchantId,
        status: MerchantStatus,
        verified: Option<bool>,
    ) -> Result<Merchant, LedgerError> {
        let admin = caller.admin()?;

        let mut uow = self.store.begin(self.now());
        let mut merchant = uow.lock_merchant(merchant_id)?;
        merchant.status = status;
        if let Some(verified) = verified {
            merchant.is_verified = verified;
        }
        merchant.updated_at = uow.now();
        uow.put_merchant(merchant.clone());
        uow.record(LedgerEvent::new(
            EventKind::MerchantStatusChanged,
            merchant_reference(merchant_id),
            uow.now(),
        ));
        uow.commit()?;

        info!(
            admin_id = %admin,
            merchant_id = %merchant_id,
            status = %status,
            "merchant status changed"
        );
        Ok(merchant)
    }

    // -- credit ---------------------------------------------------------------

    fn check_limit_bounds(&self, limit: Decimal) -> Result<(), LedgerError> {
        if limit <= Decimal::ZERO {
            return Err(LedgerError::InvalidCreditLimit);
        }
        if limit > self.config.max_credit_limit {
            return Err(LedgerError::LimitAboveMaximum {
                requested: limit,
                maximum: self.config.max_credit_limit,
            });
        }
        Ok(())
    }

    /// Moves a customer's credit limit.
    ///
    /// Every valid request is approved straight away. Customer requests up to
    /// the auto-approve ceiling are tagged `auto`, larger ones
    /// `auto_high_limit`; admin changes record the admin.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidCreditLimit`] - Limit not positive.
    /// - [`LedgerError::LimitAboveMaximum`] - Limit above the platform maximum.
    /// - [`LedgerError::LimitBelowOutstanding`] - Limit would not cover what is owed.
    pub fn change_credit_limit(
        &self,
        caller: &Caller,
        customer_id: CustomerId,
        new_limit: Decimal,
        reason: Option<String>,
    ) -> Result<CustomerLimitHistory, LedgerError> {
        let approved_by = match caller {
            Caller::Customer(id) if *id == customer_id => {
                if new_limit <= self.config.auto_approve_limit_ceiling {
                    Approver::Auto
                } else {
                    Approver::AutoHighLimit
                }
            }
            Caller::Admin(admin) => Approver::Admin(*admin),
            _ => return Err(LedgerError::Forbidden("record belongs to another customer")),
        };
        self.check_limit_bounds(new_limit)?;

        let mut uow = self.store.begin(self.now());
        let mut customer = uow.lock_customer(customer_id)?;
        let previous_limit = customer.credit_limit;
        customer.change_limit(new_limit, uow.now())?;

        let history = CustomerLimitHistory {
            customer_id,
            reference: uow.issue_reference(ReferenceKind::LimitChange),
            previous_limit,
            new_limit,
            requested_limit: new_limit,
            status: LimitChangeStatus::Approved,
            reason,
            approved_by,
            created_at: uow.now(),
        };
        uow.put_customer(customer);
        uow.append_limit_history(history.clone());
        let event = LedgerEvent::new(EventKind::LimitChanged, &history.reference, uow.now());
        uow.record(event.with_amount(new_limit));
        uow.commit()?;

        info!(
            customer_id = %customer_id,
            previous = %previous_limit,
            limit = %new_limit,
            approved_by = %approved_by,
            "credit limit changed"
        );
        Ok(history)
    }

    // -- purchase lifecycle -------------------------------------------------

    /// Offers a purchase to a customer.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] - Customer, merchant or branch unknown.
    /// - [`LedgerError::MerchantInactive`] / [`LedgerError::CustomerInactive`].
    /// - [`LedgerError::InsufficientCredit`] - Customer cannot cover the total.
    pub fn create_purchase_request(
        &self,
        caller: &Caller,
        input: NewPurchaseRequest,
    ) -> Result<PurchaseRequest, LedgerError> {
        let merchant_id = caller.merchant()?;
        input.validate()?;
        let total = input.total_amount()?;

        let mut uow = self.store.begin(self.now());
        let customer = uow.lock_customer(input.customer_id)?;
        let merchant = uow.lock_merchant(merchant_id)?;
        if !merchant.is_active() {
            return Err(LedgerError::MerchantInactive);
        }
        if !customer.is_active() {
            return Err(LedgerError::CustomerInactive);
        }
        if !customer.can_afford(total) {
            return Err(LedgerError::InsufficientCredit {
                required: total,
                available: customer.available_balance,
            });
        }
        if let Some(branch_id) = input.branch_id {
            let branch = uow.lock_branch(branch_id)?;
            if branch.merchant_id != merchant_id || !branch.is_active {
                return Err(LedgerError::not_found("branch", branch_id));
            }
        }

        let id = uow.next_purchase_request_id();
        let reference = uow.issue_reference(ReferenceKind::PurchaseRequest);
        let request = PurchaseRequest::new(
            id,
            reference,
            merchant_id,
            input,
            self.config.request_ttl(),
            uow.now(),
        )?;
        uow.insert_purchase_request(request.clone());
        let reference = &request.reference_number;
        let event = LedgerEvent::new(EventKind::PurchaseRequested, reference, uow.now());
        uow.record(event.with_amount(total));
        uow.commit()?;

        info!(
            request_id = %id,
            reference = %request.reference_number,
            merchant_id = %merchant_id,
            customer_id = %request.customer_id,
            amount = %total,
            "purchase request created"
        );
        Ok(request)
    }

    /// Accepts a purchase request on the addressed customer's behalf.
    ///
    /// Debits the customer, opens the transaction with a repayment plan of
    /// `plan_type` (one month by default) and settles the merchant, all in
    /// one unit. A request found past its expiry is stored as expired and
    /// the call fails with [`LedgerError::RequestExpired`].
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] - Unknown request.
    /// - [`LedgerError::Forbidden`] - Request addressed to another customer.
    /// - [`LedgerError::NotPending`] - Request already left `pending`.
    /// - [`LedgerError::RequestExpired`] - Request passed its expiry.
    /// - [`LedgerError::CustomerInactive`] / [`LedgerError::InsufficientCredit`].
    pub fn accept_purchase_request(
        &self,
        caller: &Caller,
        request_id: PurchaseRequestId,
        plan_type: Option<PlanType>,
    ) -> Result<Acceptance, LedgerError> {
        let customer_id = caller.customer()?;
        let peek = self.store.purchase_requests.fetch(request_id)?;
        if peek.customer_id != customer_id {
            return Err(LedgerError::Forbidden("purchase request addressed to another customer"));
        }
        let plan_type = plan_type.unwrap_or_default();

        let mut uow = self.store.begin(self.now());
        let now = uow.now();
        let mut customer = uow.lock_customer(customer_id)?;
        let mut merchant = uow.lock_merchant(peek.merchant_id)?;
        let mut request = uow.lock_purchase_request(request_id)?;

        if request.status != RequestStatus::Pending {
            warn!(
                request_id = %request_id,
                status = %request.status,
                "purchase request no longer pending"
            );
            return Err(LedgerError::NotPending(request.status));
        }
        if request.expire_if_due(now) {
            uow.record(LedgerEvent::new(
                EventKind::PurchaseExpired,
                &request.reference_number,
                now,
            ));
            uow.put_purchase_request(request);
            uow.commit()?;
            info!(request_id = %request_id, "purchase request expired on accept");
            return Err(LedgerError::RequestExpired);
        }

        let total = request.total_amount;
        customer.debit(total, now)?;

        let transaction_id = uow.next_transaction_id();
        let transaction_number = uow.issue_reference(ReferenceKind::Transaction);
        request.accept(transaction_id, now)?;

        let mut transaction = Transaction::open(
            transaction_id,
            transaction_number,
            OpenTransaction {
                merchant_id: request.merchant_id,
                customer_id,
                purchase_request_id: request_id,
                total_amount: total,
                commission_rate: self.config.platform_commission_rate,
                due_date: now + self.config.repayment_period(),
            },
            now,
        );
        uow.record(LedgerEvent::new(EventKind::PurchaseAccepted, &request.reference_number, now));
        let reference = &transaction.transaction_number;
        let event = LedgerEvent::new(EventKind::TransactionOpened, reference, now);
        uow.record(event.with_amount(total));
        let plan = self.build_plan(&mut uow, &transaction, plan_type, total)?;
        transaction.repayment_plan_id = Some(plan.id);

        merchant.record_sale(total, now);
        let settlement = self.settle_income(&mut uow, &transaction, &mut merchant);

        uow.put_customer(customer);
        uow.put_merchant(merchant);
        uow.put_purchase_request(request.clone());
        uow.insert_transaction(transaction.clone());
        uow.insert_plan(plan.clone());
        uow.commit()?;

        info!(
            request_id = %request_id,
            transaction_id = %transaction_id,
            customer_id = %customer_id,
            amount = %total,
            installments = plan.number_of_installments,
            "purchase request accepted"
        );
        Ok(Acceptance {
            request,
            transaction,
            plan,
            settlement,
        })
    }

    /// Creates a plan with its schedule and records the event. The caller
    /// inserts the returned plan.
    fn build_plan(
        &self,
        uow: &mut UnitOfWork<'_>,
        transaction: &Transaction,
        plan_type: PlanType,
        total: Decimal,
    ) -> Result<RepaymentPlan, LedgerError> {
        let now = uow.now();
        let reference = uow.issue_reference(ReferenceKind::Plan);
        let mut plan = RepaymentPlan::new(
            uow.next_plan_id(),
            reference,
            transaction.id,
            transaction.customer_id,
            plan_type,
            total,
            now,
        );
        plan.generate_schedule(|| uow.next_schedule_id(), now)?;
        let event = LedgerEvent::new(EventKind::PlanCreated, &plan.plan_reference, now);
        uow.record(event.with_amount(total));
        Ok(plan)
    }

    /// Stages the income settlement for `transaction` and accrues the
    /// merchant. Commit fails with [`LedgerError::DuplicateSettlement`] if
    /// another unit settled the transaction first.
    fn settle_income(
        &self,
        uow: &mut UnitOfWork<'_>,
        transaction: &Transaction,
        merchant: &mut Merchant,
    ) -> Settlement {
        let now = uow.now();
        let id = uow.next_settlement_id();
        let reference = uow.issue_reference(ReferenceKind::Settlement);
        let settlement = Settlement::income(
            id,
            reference,
            transaction,
            merchant.bank.clone(),
            self.initial_settlement_status(),
            now,
        );
        merchant.accrue(settlement.net_amount, settlement.commission_amount, now);

        uow.claim(UniqueKey::IncomeSettlement(transaction.id), id.0);
        uow.insert_settlement(settlement.clone());
        let reference = &settlement.settlement_reference;
        let event = LedgerEvent::new(EventKind::SettlementCreated, reference, now);
        uow.record(event.with_amount(settlement.net_amount));
        settlement
    }

    pub fn reject_purchase_request(
        &self,
        caller: &Caller,
        request_id: PurchaseRequestId,
        reason: Option<String>,
    ) -> Result<PurchaseRequest, LedgerError> {
        let customer_id = caller.customer()?;
        let peek = self.store.purchase_requests.fetch(request_id)?;
        if peek.customer_id != customer_id {
            return Err(LedgerError::Forbidden("purchase request addressed to another customer"));
        }

        let mut uow = self.store.begin(self.now());
        let mut request = uow.lock_purchase_request(request_id)?;
        request.reject(reason, uow.now())?;
        uow.put_purchase_request(request.clone());
        uow.record(LedgerEvent::new(
            EventKind::PurchaseRejected,
            &request.reference_number,
            uow.now(),
        ));
        uow.commit()?;

        info!(request_id = %request_id, customer_id = %customer_id, "purchase request rejected");
        Ok(request)
    }

    pub fn cancel_purchase_request(
        &self,
        caller: &Caller,
        request_id: PurchaseRequestId,
    ) -> Result<PurchaseRequest, LedgerError> {
        let merchant_id = caller.merchant()?;
        let peek = self.store.purchase_requests.fetch(request_id)?;
        if peek.merchant_id != merchant_id {
            return Err(LedgerError::Forbidden("purchase request belongs to another merchant"));
        }

        let mut uow = self.store.begin(self.now());
        let mut request = uow.lock_purchase_request(request_id)?;
        request.cancel(uow.now())?;
        uow.put_purchase_request(request.clone());
        uow.record(LedgerEvent::new(
            EventKind::PurchaseCancelled,
            &request.reference_number,
            uow.now(),
        ));
        uow.commit()?;

        info!(request_id = %request_id, merchant_id = %merchant_id, "purchase request cancelled");
        Ok(request)
    }

    /// Flips every pending request past its expiry to `expired`. Returns how
    /// many changed.
    pub fn expire_purchase_requests(&self) -> usize {
        let now = self.now();
        let due = self
            .store
            .purchase_requests
            .filter(|request| {
                request.status == RequestStatus::Pending && request.is_expired_at(now)
            });

        let mut expired = 0;
        for candidate in due {
            let mut uow = self.store.begin(now);
            let Ok(mut request) = uow.lock_purchase_request(candidate.id) else {
                continue;
            };
            if !request.expire_if_due(now) {
                continue;
            }
            uow.record(LedgerEvent::new(
                EventKind::PurchaseExpired,
                &request.reference_number,
                now,
            ));
            uow.put_purchase_request(request);
            match uow.commit() {
                Ok(()) => expired += 1,
                Err(error) => {
                    warn!(request_id = %candidate.id, %error, "expiry sweep skipped request")
                }
            }
        }

        debug!(expired, "purchase request expiry sweep finished");
        expired
    }

    // -- repayment ------------------------------------------------------------

    /// Attaches a plan to an active transaction that has none, built from
    /// the amount still owed. The transaction's due date moves to the last
    /// installment.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::TransactionNotActive`] - Transaction is not `active`.
    /// - [`LedgerError::PlanAlreadyExists`] - Transaction already has a plan.
    pub fn select_repayment_plan(
        &self,
        caller: &Caller,
        transaction_id: TransactionId,
        plan_type: PlanType,
    ) -> Result<RepaymentPlan, LedgerError> {
        let customer_id = caller.customer()?;
        let peek = self.store.transactions.fetch(transaction_id)?;
        if peek.customer_id != customer_id {
            return Err(LedgerError::Forbidden("transaction belongs to another customer"));
        }

        let mut uow = self.store.begin(self.now());
        let mut transaction = uow.lock_transaction(transaction_id)?;
        if transaction.status != TransactionStatus::Active {
            return Err(LedgerError::TransactionNotActive(transaction.status));
        }
        if transaction.repayment_plan_id.is_some() {
            return Err(LedgerError::PlanAlreadyExists);
        }

        let remaining = transaction.remaining_amount;
        let plan = self.build_plan(&mut uow, &transaction, plan_type, remaining)?;
        if let Some(last) = plan.schedule.last() {
            transaction.due_date = last.due_date;
        }
        transaction.repayment_plan_id = Some(plan.id);
        transaction.updated_at = uow.now();

        uow.put_transaction(transaction);
        uow.insert_plan(plan.clone());
        uow.commit()?;

        info!(
            transaction_id = %transaction_id,
            plan_id = %plan.id,
            installments = plan.number_of_installments,
            amount = %remaining,
            "repayment plan selected"
        );
        Ok(plan)
    }

    // -- payments -------------------------------------------------------------

    /// Applies a customer payment.
    ///
    /// The payment reduces the transaction's remaining amount and restores
    /// the customer's credit. When the transaction has a plan and the amount
    /// covers the earliest unpaid installment, that installment is retired;
    /// smaller payments count against the transaction only.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotFound`] - Unknown transaction or plan.
    /// - [`LedgerError::Forbidden`] - Transaction belongs to another customer.
    /// - [`LedgerError::InvalidAmount`] - Amount not positive.
    /// - [`LedgerError::TransactionNotActive`] - Nothing left to pay.
    /// - [`LedgerError::Overpayment`] - Amount above the remaining balance.
    pub fn make_payment(
        &self,
        caller: &Caller,
        target: PaymentTarget,
        amount: Decimal,
        method: PaymentMethod,
    ) -> Result<PaymentReceipt, LedgerError> {
        let customer_id = caller.customer()?;
        let transaction_id = match target {
            PaymentTarget::Transaction(id) => id,
            PaymentTarget::Plan(plan_id) => self.store.plans.fetch(plan_id)?.transaction_id,
        };
        let peek = self.store.transactions.fetch(transaction_id)?;
        if peek.customer_id != customer_id {
            return Err(LedgerError::Forbidden("transaction belongs to another customer"));
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }

        let mut uow = self.store.begin(self.now());
        let now = uow.now();
        let mut customer = uow.lock_customer(customer_id)?;
        let mut transaction = uow.lock_transaction(transaction_id)?;
        let mut plan = match transaction.repayment_plan_id {
            Some(plan_id) => Some(uow.lock_plan(plan_id)?),
            None => None,
        };

        let completed = transaction.record_payment(amount, now)?;
        customer.credit(amount, now);

        let payment_id = uow.next_payment_id();
        let reference = uow.issue_reference(ReferenceKind::Payment);
        let mut installment = None;
        if let Some(plan) = plan.as_mut() {
            let was_active = plan.status == PlanStatus::Active;
            let retired = plan.retire_next_installment(amount, payment_id, &reference, now);
            if let Some(schedule_id) = retired {
                installment = plan
                    .schedule
                    .iter()
                    .find(|row| row.id == schedule_id)
                    .map(|row| (schedule_id, row.installment_number));
            }
            if was_active && plan.status == PlanStatus::Completed {
                uow.record(LedgerEvent::new(EventKind::PlanCompleted, &plan.plan_reference, now));
            }
        }

        let payment = Payment::completed(
            payment_id,
            reference,
            transaction_id,
            customer_id,
            installment.map(|(schedule_id, _)| schedule_id),
            amount,
            method,
            now,
        );
        let reference = &payment.payment_reference;
        let event = LedgerEvent::new(EventKind::PaymentApplied, reference, now);
        uow.record(event.with_amount(amount));
        if completed {
            uow.record(LedgerEvent::new(
                EventKind::TransactionCompleted,
                &transaction.transaction_number,
                now,
            ));
        }

        let receipt = PaymentReceipt {
            payment: payment.clone(),
            transaction_number: transaction.transaction_number.clone(),
            transaction_status: transaction.status,
            remaining_amount: transaction.remaining_amount,
            installment_number: installment.map(|(_, number)| number),
        };

        uow.put_customer(customer);
        uow.put_transaction(transaction);
        if let Some(plan) = plan {
            uow.put_plan(plan);
        }
        uow.insert_payment(payment);
        uow.commit()?;

        info!(
            payment_id = %payment_id,
            transaction_id = %transaction_id,
            customer_id = %customer_id,
            amount = %amount,
            remaining = %receipt.remaining_amount,
            installment = ?receipt.installment_number,
            "payment applied"
        );
        Ok(receipt)
    }

    // -- settlements ----------------------------------------------------------

    /// Settles a transaction for its merchant.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::DuplicateSettlement`] - Transaction already settled.
    pub fn create_income_settlement(
        &self,
        caller: &Caller,
        transaction_id: TransactionId,
    ) -> Result<Settlement, LedgerError> {
        caller.admin()?;
        let peek = self.store.transactions.fetch(transaction_id)?;
        if self.store.income_settlement_for(transaction_id).is_some() {
            warn!(transaction_id = %transaction_id, "transaction already settled");
            return Err(LedgerError::DuplicateSettlement);
        }
        self.settle_transaction(peek.merchant_id, transaction_id)
    }

    fn settle_transaction(
        &self,
        merchant_id: MerchantId,
        transaction_id: TransactionId,
    ) -> Result<Settlement, LedgerError> {
        let mut uow = self.store.begin(self.now());
        let mut merchant = uow.lock_merchant(merchant_id)?;
        let transaction = uow.lock_transaction(transaction_id)?;
        let settlement = self.settle_income(&mut uow, &transaction, &mut merchant);
        uow.put_merchant(merchant);
        if let Err(error) = uow.commit() {
            if error == LedgerError::DuplicateSettlement {
                warn!(transaction_id = %transaction_id, "lost settlement race");
            }
            return Err(error);
        }

        info!(
            settlement_id = %settlement.id,
            transaction_id = %transaction_id,
            merchant_id = %merchant_id,
            net = %settlement.net_amount,
            commission = %settlement.commission_amount,
            "income settlement created"
        );
        Ok(settlement)
    }

    /// Returns the merchant's settlement for a transaction, creating it for
    /// a fully repaid transaction that has none yet.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Forbidden`] - Transaction belongs to another merchant.
    /// - [`LedgerError::TransactionNotCompleted`] - Unsettled and not repaid.
    pub fn receive_settlement(
        &self,
        caller: &Caller,
        transaction_id: TransactionId,
    ) -> Result<Settlement, LedgerError> {
        let merchant_id = caller.merchant()?;
        let peek = self.store.transactions.fetch(transaction_id)?;
        if peek.merchant_id != merchant_id {
            return Err(LedgerError::Forbidden("transaction belongs to another merchant"));
        }
        if let Some(existing) = self.existing_income_settlement(transaction_id) {
            return Ok(existing);
        }
        if peek.status != TransactionStatus::Completed {
            return Err(LedgerError::TransactionNotCompleted(peek.status));
        }

        match self.settle_transaction(merchant_id, transaction_id) {
            Err(LedgerError::DuplicateSettlement) => self
                .existing_income_settlement(transaction_id)
                .ok_or(LedgerError::DuplicateSettlement),
            result => result,
        }
    }

    fn existing_income_settlement(&self, transaction_id: TransactionId) -> Option<Settlement> {
        self.store
            .income_settlement_for(transaction_id)
            .and_then(|id| self.store.settlements.get(id))
    }

    /// Pays `amount` out of the merchant's balance. Given bank details
    /// replace the ones on file before the payout is recorded.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - Amount not positive.
    /// - [`LedgerError::InsufficientBalance`] - Amount above the balance.
    pub fn request_withdrawal(
        &self,
        caller: &Caller,
        amount: Decimal,
        bank: Option<BankDetails>,
    ) -> Result<Settlement, LedgerError> {
        let merchant_id = caller.merchant()?;
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount);
        }

        let mut uow = self.store.begin(self.now());
        let now = uow.now();
        let mut merchant = uow.lock_merchant(merchant_id)?;
        merchant.withdraw(amount, now)?;
        if let Some(bank) = bank {
            merchant.bank = bank;
        }

        let reference = uow.issue_reference(ReferenceKind::Settlement);
        let settlement = Settlement::withdrawal(
            uow.next_settlement_id(),
            reference,
            merchant_id,
            amount,
            merchant.bank.clone(),
            self.initial_settlement_status(),
            now,
        );
        uow.put_merchant(merchant);
        uow.insert_settlement(settlement.clone());
        let reference = &settlement.settlement_reference;
        let event = LedgerEvent::new(EventKind::WithdrawalRequested, reference, now);
        uow.record(event.with_amount(amount));
        uow.commit()?;

        info!(
            settlement_id = %settlement.id,
            merchant_id = %merchant_id,
            amount = %amount,
            "withdrawal recorded"
        );
        Ok(settlement)
    }

    fn transition_settlement(
        &self,
        caller: &Caller,
        settlement_id: SettlementId,
        kind: EventKind,
        apply: impl FnOnce(&mut Settlement, DateTime<Utc>) -> Result<(), LedgerError>,
    ) -> Result<Settlement, LedgerError> {
        let admin = caller.admin()?;

        let mut uow = self.store.begin(self.now());
        let mut settlement = uow.lock_settlement(settlement_id)?;
        apply(&mut settlement, uow.now())?;
        uow.put_settlement(settlement.clone());
        uow.record(LedgerEvent::new(kind, &settlement.settlement_reference, uow.now()));
        uow.commit()?;

        info!(
            admin_id = %admin,
            settlement_id = %settlement_id,
            status = %settlement.status,
            "settlement status changed"
        );
        Ok(settlement)
    }

    pub fn mark_settlement_processing(
        &self,
        caller: &Caller,
        settlement_id: SettlementId,
    ) -> Result<Settlement, LedgerError> {
        self.transition_settlement(
            caller,
            settlement_id,
            EventKind::SettlementProcessing,
            |s, now| s.mark_processing(now),
        )
    }

    pub fn mark_settlement_completed(
        &self,
        caller: &Caller,
        settlement_id: SettlementId,
        bank_reference: Option<String>,
    ) -> Result<Settlement, LedgerError> {
        self.transition_settlement(
            caller,
            settlement_id,
            EventKind::SettlementCompleted,
            |s, now| s.mark_completed(bank_reference, now),
        )
    }

    pub fn mark_settlement_failed(
        &self,
        caller: &Caller,
        settlement_id: SettlementId,
        reason: impl Into<String>,
    ) -> Result<Settlement, LedgerError> {
        let reason = reason.into();
        self.transition_settlement(
            caller,
            settlement_id,
            EventKind::SettlementFailed,
            |s, now| s.mark_failed(reason, now),
        )
    }

    // -- sweeps ---------------------------------------------------------------

    /// Marks open transactions past their due date, and pending installments
    /// past theirs, as overdue. Never touches completed records.
    pub fn sweep_overdue(&self) -> OverdueSweep {
        let now = self.now();
        let candidates = self.store.transactions.filter(|txn| txn.status.is_open());

        let mut sweep = OverdueSweep::default();
        for candidate in candidates {
            let mut uow = self.store.begin(now);
            let Ok(mut transaction) = uow.lock_transaction(candidate.id) else {
                continue;
            };
            let transaction_changed = transaction.mark_overdue_if_due(now);
            let mut installments = 0;
            if let Some(plan_id) = transaction.repayment_plan_id {
                if let Ok(mut plan) = uow.lock_plan(plan_id) {
                    installments = plan.mark_overdue_installments(now);
                    if installments > 0 {
                        uow.put_plan(plan);
                    }
                }
            }
            if !transaction_changed && installments == 0 {
                continue;
            }
            if transaction_changed {
                uow.record(LedgerEvent::new(
                    EventKind::TransactionOverdue,
                    &transaction.transaction_number,
                    now,
                ));
                uow.put_transaction(transaction);
            }
            match uow.commit() {
                Ok(()) => {
                    sweep.transactions += usize::from(transaction_changed);
                    sweep.installments += installments;
                }
                Err(error) => {
                    warn!(
                        transaction_id = %candidate.id,
                        %error,
                        "overdue sweep skipped transaction"
                    );
                }
            }
        }

        debug!(
            transactions = sweep.transactions,
            installments = sweep.installments,
            "overdue sweep finished"
        );
        sweep
    }

    // -- queries --------------------------------------------------------------

    pub fn customer(
        &self,
        caller: &Caller,
        customer_id: CustomerId,
    ) -> Result<Customer, LedgerError> {
        let customer = self.store.customers.fetch(customer_id)?;
        caller.ensure_customer(customer_id)?;
        Ok(customer)
    }

    /// Finds a customer by the short code they hand to merchants.
    pub fn customer_by_code(&self, caller: &Caller, code: &str) -> Result<Customer, LedgerError> {
        if matches!(caller, Caller::Customer(_)) {
            return Err(LedgerError::Forbidden("merchant or admin role required"));
        }
        let code = code.trim().to_ascii_uppercase();
        self.store
            .lookup(&UniqueKey::CustomerCode(code.clone()))
            .and_then(|id| self.store.customers.get(CustomerId(id)))
            .ok_or_else(|| LedgerError::not_found("customer", code))
    }

    pub fn merchant(
        &self,
        caller: &Caller,
        merchant_id: MerchantId,
    ) -> Result<Merchant, LedgerError> {
        let merchant = self.store.merchants.fetch(merchant_id)?;
        caller.ensure_merchant(merchant_id)?;
        Ok(merchant)
    }

    pub fn branches(&self, caller: &Caller) -> Result<Vec<Branch>, LedgerError> {
        let merchant_id = caller.merchant()?;
        let branches = self.store.branches.filter(|b| b.merchant_id == merchant_id);
        Ok(branches)
    }

    pub fn purchase_request(
        &self,
        caller: &Caller,
        request_id: PurchaseRequestId,
    ) -> Result<PurchaseRequest, LedgerError> {
        let request = self.store.purchase_requests.fetch(request_id)?;
        caller.ensure_party(request.customer_id, request.merchant_id)?;
        Ok(request)
    }

    /// Requests visible to the caller, optionally narrowed to one status.
    pub fn purchase_requests(
        &self,
        caller: &Caller,
        status: Option<RequestStatus>,
    ) -> Vec<PurchaseRequest> {
        let caller = *caller;
        self.store.purchase_requests.filter(|request| {
            let party = caller.ensure_party(request.customer_id, request.merchant_id);
            party.is_ok() && status.is_none_or(|status| request.status == status)
        })
    }

    pub fn transaction(
        &self,
        caller: &Caller,
        transaction_id: TransactionId,
    ) -> Result<Transaction, LedgerError> {
        let transaction = self.store.transactions.fetch(transaction_id)?;
        caller.ensure_party(transaction.customer_id, transaction.merchant_id)?;
        Ok(transaction)
    }

    pub fn transactions(
        &self,
        caller: &Caller,
        status: Option<TransactionStatus>,
    ) -> Vec<Transaction> {
        let caller = *caller;
        self.store.transactions.filter(|txn| {
            let party = caller.ensure_party(txn.customer_id, txn.merchant_id);
            party.is_ok() && status.is_none_or(|status| txn.status == status)
        })
    }

    pub fn repayment_plan(
        &self,
        caller: &Caller,
        plan_id: PlanId,
    ) -> Result<RepaymentPlan, LedgerError> {
        let plan = self.store.plans.fetch(plan_id)?;
        caller.ensure_customer(plan.customer_id)?;
        Ok(plan)
    }

    pub fn repayment_plans(&self, caller: &Caller) -> Vec<RepaymentPlan> {
        let caller = *caller;
        self.store
            .plans
            .filter(|plan| caller.ensure_customer(plan.customer_id).is_ok())
    }

    pub fn payment(&self, caller: &Caller, payment_id: PaymentId) -> Result<Payment, LedgerError> {
        let payment = self.store.payments.fetch(payment_id)?;
        caller.ensure_customer(payment.customer_id)?;
        Ok(payment)
    }

    pub fn payments(&self, caller: &Caller) -> Vec<Payment> {
        let caller = *caller;
        self.store
            .payments
            .filter(|payment| caller.ensure_customer(payment.customer_id).is_ok())
    }

    /// A payment with the current state of its transaction.
    pub fn payment_receipt(
        &self,
        caller: &Caller,
        payment_id: PaymentId,
    ) -> Result<PaymentReceipt, LedgerError> {
        let payment = self.payment(caller, payment_id)?;
        let transaction = self.store.transactions.fetch(payment.transaction_id)?;
        let installment = (transaction.repayment_plan_id, payment.repayment_schedule_id);
        let installment_number = match installment {
            (Some(plan_id), Some(schedule_id)) => self.installment_number(plan_id, schedule_id),
            _ => None,
        };
        Ok(PaymentReceipt {
            payment,
            transaction_number: transaction.transaction_number,
            transaction_status: transaction.status,
            remaining_amount: transaction.remaining_amount,
            installment_number,
        })
    }

    fn installment_number(&self, plan_id: PlanId, schedule_id: ScheduleId) -> Option<u32> {
        let plan = self.store.plans.get(plan_id)?;
        let row = plan.schedule.iter().find(|row| row.id == schedule_id)?;
        Some(row.installment_number)
    }

    pub fn settlement(
        &self,
        caller: &Caller,
        settlement_id: SettlementId,
    ) -> Result<Settlement, LedgerError> {
        let settlement = self.store.settlements.fetch(settlement_id)?;
        caller.ensure_merchant(settlement.merchant_id)?;
        Ok(settlement)
    }

    pub fn settlements(
        &self,
        caller: &Caller,
        settlement_type: Option<SettlementType>,
    ) -> Vec<Settlement> {
        let caller = *caller;
        self.store.settlements.filter(|settlement| {
            caller.ensure_merchant(settlement.merchant_id).is_ok()
                && settlement_type.is_none_or(|kind| settlement.settlement_type == kind)
        })
    }

    pub fn limit_history(
        &self,
        caller: &Caller,
        customer_id: CustomerId,
    ) -> Result<Vec<CustomerLimitHistory>, LedgerError> {
        self.store.customers.fetch(customer_id)?;
        caller.ensure_customer(customer_id)?;
        Ok(self.store.limit_history(customer_id))
    }

    fn installments_where(
        &self,
        customer_id: CustomerId,
        keep: impl Fn(&RepaymentSchedule) -> bool,
    ) -> Vec<InstallmentDue> {
        let mut due: Vec<InstallmentDue> = self
            .store
            .plans
            .filter(|plan| plan.customer_id == customer_id && plan.status == PlanStatus::Active)
            .into_iter()
            .flat_map(|plan| {
                plan.schedule
                    .iter()
                    .filter(|row| row.status.is_outstanding() && keep(row))
                    .map(|row| InstallmentDue {
                        plan_id: plan.id,
                        plan_reference: plan.plan_reference.clone(),
                        transaction_id: plan.transaction_id,
                        installment: row.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        due.sort_by_key(|item| (item.installment.due_date, item.plan_id));
        due
    }

    /// Unpaid installments falling due within `days` days, overdue ones included.
    pub fn upcoming_installments(
        &self,
        caller: &Caller,
        days: i64,
    ) -> Result<Vec<InstallmentDue>, LedgerError> {
        let customer_id = caller.customer()?;
        if days < 0 {
            return Err(LedgerError::Invalid("days must not be negative".into()));
        }
        let horizon = self.now() + Duration::days(days);
        Ok(self.installments_where(customer_id, |row| row.due_date <= horizon))
    }

    /// Unpaid installments past their due date, whether or not a sweep has
    /// flagged them yet.
    pub fn overdue_installments(
        &self,
        caller: &Caller,
    ) -> Result<Vec<InstallmentDue>, LedgerError> {
        let customer_id = caller.customer()?;
        let now = self.now();
        Ok(self.installments_where(customer_id, |row| row.is_overdue_at(now)))
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

fn merchant_reference(id: MerchantId) -> String {
    format!("MER-{id}")
}
