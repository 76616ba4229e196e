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

//! Repayment plans and installment schedules.
//!
//! A plan splits a transaction's amount into `plan_type` monthly
//! installments. Every installment but the last is `round(total / n, 2)`;
//! the last absorbs the rounding residue so the schedule sums exactly to
//! the plan total. Installment `i` falls due `i` calendar months after the
//! schedule was generated.
//!
//! # Example
//!
//! ```
//! use bnpl_ledger::{installment_amounts, PlanType};
//! use rust_decimal_macros::dec;
//!
//! let amounts = installment_amounts(dec!(100.00), PlanType::ThreeMonths).unwrap();
//! assert_eq!(amounts, vec![dec!(33.33), dec!(33.33), dec!(33.34)]);
//! ```

use crate::base::{CustomerId, PaymentId, PlanId, ScheduleId, TransactionId, round_money};
use crate::error::LedgerError;
use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Installment count offered to customers, in months.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum PlanType {
    #[default]
    OneMonth,
    ThreeMonths,
    SixMonths,
    TwelveMonths,
    EighteenMonths,
    TwentyFourMonths,
}

impl PlanType {
    pub const ALL: [PlanType; 6] = [
        Self::OneMonth,
        Self::ThreeMonths,
        Self::SixMonths,
        Self::TwelveMonths,
        Self::EighteenMonths,
        Self::TwentyFourMonths,
    ];

    pub fn months(&self) -> u32 {
        match self {
            Self::OneMonth => 1,
            Self::ThreeMonths => 3,
            Self::SixMonths => 6,
            Self::TwelveMonths => 12,
            Self::EighteenMonths => 18,
            Self::TwentyFourMonths => 24,
        }
    }
}

impl TryFrom<u32> for PlanType {
    type Error = LedgerError;

    fn try_from(months: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|plan| plan.months() == months)
            .ok_or(LedgerError::InvalidPlanType(months))
    }
}

impl From<PlanType> for u32 {
    fn from(plan: PlanType) -> Self {
        plan.months()
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} months", self.months())
    }
}

/// Splits `total` into installment amounts for `plan`.
///
/// Fails when the total is too small to give every installment a positive
/// amount.
pub fn installment_amounts(total: Decimal, plan: PlanType) -> Result<Vec<Decimal>, LedgerError> {
    if total <= Decimal::ZERO {
        return Err(LedgerError::InvalidAmount);
    }
    let count = plan.months();
    let per_installment = round_money(total / Decimal::from(count));
    let leading = per_installment * Decimal::from(count - 1);
    let last = total - leading;
    if per_installment <= Decimal::ZERO || last <= Decimal::ZERO {
        return Err(LedgerError::Invalid(format!(
            "{total} SAR cannot be split into {count} installments"
        )));
    }

    let mut amounts = vec![per_installment; count as usize - 1];
    amounts.push(last);
    Ok(amounts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Completed,
    Defaulted,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Defaulted => "defaulted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Paid,
    Overdue,
    Partial,
}

impl ScheduleStatus {
    /// Still waiting for money.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Overdue)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Partial => "partial",
        };
        f.write_str(name)
    }
}

/// One installment of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentSchedule {
    pub id: ScheduleId,
    pub plan_id: PlanId,
    pub installment_number: u32,
    pub amount: Decimal,
    pub due_date: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub paid_amount: Decimal,
    pub paid_date: Option<DateTime<Utc>>,
    pub payment_id: Option<PaymentId>,
    pub payment_reference: Option<String>,
}

impl RepaymentSchedule {
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_outstanding() && now > self.due_date
    }

    fn mark_paid(&mut self, payment_id: PaymentId, payment_reference: &str, now: DateTime<Utc>) {
        self.status = ScheduleStatus::Paid;
        self.paid_amount = self.amount;
        self.paid_date = Some(now);
        self.payment_id = Some(payment_id);
        self.payment_reference = Some(payment_reference.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentPlan {
    pub id: PlanId,
    pub plan_reference: String,
    pub transaction_id: TransactionId,
    pub customer_id: CustomerId,
    pub plan_type: PlanType,
    pub total_amount: Decimal,
    pub installment_amount: Decimal,
    pub number_of_installments: u32,
    pub status: PlanStatus,
    pub paid_installments: u32,
    pub paid_amount: Decimal,
    pub remaining_amount: Decimal,
    pub next_payment_date: Option<DateTime<Utc>>,
    pub next_payment_amount: Option<Decimal>,
    /// Installments ordered by number.
    pub schedule: Vec<RepaymentSchedule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RepaymentPlan {
    /// Creates a plan without installments; call
    /// [`generate_schedule`](Self::generate_schedule) next.
    pub fn new(
        id: PlanId,
        plan_reference: String,
        transaction_id: TransactionId,
        customer_id: CustomerId,
        plan_type: PlanType,
        total_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            plan_reference,
            transaction_id,
            customer_id,
            plan_type,
            total_amount,
            installment_amount: round_money(total_amount / Decimal::from(plan_type.months())),
            number_of_installments: plan_type.months(),
            status: PlanStatus::Active,
            paid_installments: 0,
            paid_amount: Decimal::ZERO,
            remaining_amount: total_amount,
            next_payment_date: None,
            next_payment_amount: None,
            schedule: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.remaining_amount >= Decimal::ZERO,
            "Invariant violated: plan remaining went negative: {}",
            self.remaining_amount
        );
    }

    /// Builds the installment rows. A plan is scheduled once; a second call
    /// fails and leaves the existing rows untouched.
    pub fn generate_schedule(
        &mut self,
        mut next_id: impl FnMut() -> ScheduleId,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if !self.schedule.is_empty() {
            return Err(LedgerError::ScheduleAlreadyGenerated);
        }

        let amounts = installment_amounts(self.total_amount, self.plan_type)?;
        let mut rows = Vec::with_capacity(amounts.len());
        for (number, amount) in (1u32..).zip(amounts) {
            let due_date = now
                .checked_add_months(Months::new(number))
                .ok_or_else(|| LedgerError::Invalid("installment due date out of range".into()))?;
            rows.push(RepaymentSchedule {
                id: next_id(),
                plan_id: self.id,
                installment_number: number,
                amount,
                due_date,
                status: ScheduleStatus::Pending,
                paid_amount: Decimal::ZERO,
                paid_date: None,
                payment_id: None,
                payment_reference: None,
            });
        }

        self.schedule = rows;
        self.updated_at = now;
        self.refresh_next_payment();
        Ok(())
    }

    /// The earliest installment still waiting for money.
    pub fn next_installment(&self) -> Option<&RepaymentSchedule> {
        self.schedule
            .iter()
            .filter(|row| row.status.is_outstanding())
            .min_by_key(|row| row.installment_number)
    }

    fn refresh_next_payment(&mut self) {
        let next = self.next_installment().map(|r| (r.due_date, r.amount));
        self.next_payment_date = next.map(|(date, _)| date);
        self.next_payment_amount = next.map(|(_, amount)| amount);
    }

    /// Records a payment that retired one installment.
    pub fn apply_installment_payment(&mut self, amount: Decimal, now: DateTime<Utc>) {
        self.paid_installments += 1;
        self.paid_amount += amount;
        self.remaining_amount -= amount;
        self.updated_at = now;

        if self.remaining_amount <= Decimal::ZERO {
            self.remaining_amount = Decimal::ZERO;
            self.status = PlanStatus::Completed;
            self.completed_at = Some(now);
            self.next_payment_date = None;
            self.next_payment_amount = None;
        } else {
            self.refresh_next_payment();
        }
        self.assert_invariants();
    }

    /// Retires the next installment if `amount` covers it.
    ///
    /// Smaller payments leave the schedule untouched and return `None`.
    pub fn retire_next_installment(
        &mut self,
        amount: Decimal,
        payment_id: PaymentId,
        payment_reference: &str,
        now: DateTime<Utc>,
    ) -> Option<ScheduleId> {
        let row = self
            .schedule
            .iter_mut()
            .filter(|row| row.status.is_outstanding())
            .min_by_key(|row| row.installment_number)?;
        if amount < row.amount {
            return None;
        }
        row.mark_paid(payment_id, payment_reference, now);
        let schedule_id = row.id;
        self.apply_installment_payment(amount, now);
        Some(schedule_id)
    }

    /// Flags pending installments past their due date. Returns how many changed.
    pub fn mark_overdue_installments(&mut self, now: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for row in &mut self.schedule {
            if row.status == ScheduleStatus::Pending && now > row.due_date {
                row.status = ScheduleStatus::Overdue;
                changed += 1;
            }
        }
        if changed > 0 {
            self.updated_at = now;
        }
        changed
    }

    pub fn scheduled_total(&self) -> Decimal {
        self.schedule.iter().map(|row| row.amount).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn plan(total: Decimal, plan_type: PlanType, now: DateTime<Utc>) -> RepaymentPlan {
        let mut plan = RepaymentPlan::new(
            PlanId(1),
            "PLAN-20250101000000ABCDEF".into(),
            TransactionId(1),
            CustomerId(1),
            plan_type,
            total,
            now,
        );
        let mut next = 0u64;
        plan.generate_schedule(
            || {
                next += 1;
                ScheduleId(next)
            },
            now,
        )
        .unwrap();
        plan
    }

    #[test]
    fn plan_type_accepts_only_offered_durations() {
        for months in [1, 3, 6, 12, 18, 24] {
            assert_eq!(PlanType::try_from(months).unwrap().months(), months);
        }
        for months in [0, 2, 4, 9, 36] {
            assert_eq!(
                PlanType::try_from(months),
                Err(LedgerError::InvalidPlanType(months))
            );
        }
    }

    #[test]
    fn last_installment_absorbs_rounding() {
        assert_eq!(
            installment_amounts(dec!(1000), PlanType::ThreeMonths).unwrap(),
            vec![dec!(333.33), dec!(333.33), dec!(333.34)]
        );
        let amounts = installment_amounts(dec!(999.99), PlanType::TwentyFourMonths).unwrap();
        assert_eq!(amounts.len(), 24);
        assert_eq!(amounts.iter().copied().sum::<Decimal>(), dec!(999.99));
    }

    #[test]
    fn rounding_up_cannot_push_last_installment_below_zero() {
        // 0.36 / 24 = 0.015 rounds to 0.02, and 23 * 0.02 > 0.36.
        assert!(matches!(
            installment_amounts(dec!(0.36), PlanType::TwentyFourMonths),
            Err(LedgerError::Invalid(_))
        ));
    }

    #[test]
    fn schedule_uses_calendar_months() {
        let now = Utc.with_ymd_and_hms(2025, 1, 31, 9, 30, 0).unwrap();
        let plan = plan(dec!(300), PlanType::ThreeMonths, now);

        let due: Vec<_> = plan.schedule.iter().map(|row| row.due_date).collect();
        assert_eq!(due[0], Utc.with_ymd_and_hms(2025, 2, 28, 9, 30, 0).unwrap());
        assert_eq!(due[1], Utc.with_ymd_and_hms(2025, 3, 31, 9, 30, 0).unwrap());
        assert_eq!(due[2], Utc.with_ymd_and_hms(2025, 4, 30, 9, 30, 0).unwrap());
        assert_eq!(plan.next_payment_date, Some(due[0]));
        assert_eq!(plan.next_payment_amount, Some(dec!(100)));
    }

    #[test]
    fn schedule_is_generated_once() {
        let now = Utc::now();
        let mut plan = plan(dec!(1000), PlanType::ThreeMonths, now);
        let result = plan.generate_schedule(|| ScheduleId(99), now);
        assert_eq!(result, Err(LedgerError::ScheduleAlreadyGenerated));
        assert_eq!(plan.schedule.len(), 3);
        assert_eq!(plan.scheduled_total(), dec!(1000));
    }

    #[test]
    fn retiring_installments_advances_next_payment_and_completes() {
        let now = Utc::now();
        let mut plan = plan(dec!(1000), PlanType::ThreeMonths, now);

        assert_eq!(
            plan.retire_next_installment(dec!(333.33), PaymentId(1), "PAY-1", now),
            Some(ScheduleId(1))
        );
        assert_eq!(plan.paid_installments, 1);
        assert_eq!(plan.remaining_amount, dec!(666.67));
        assert_eq!(plan.next_payment_amount, Some(dec!(333.33)));
        assert_eq!(plan.next_payment_date, Some(plan.schedule[1].due_date));
        assert_eq!(plan.schedule[0].status, ScheduleStatus::Paid);
        assert_eq!(plan.schedule[0].payment_reference.as_deref(), Some("PAY-1"));

        plan.retire_next_installment(dec!(333.33), PaymentId(2), "PAY-2", now);
        plan.retire_next_installment(dec!(333.34), PaymentId(3), "PAY-3", now);
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.remaining_amount, Decimal::ZERO);
        assert_eq!(plan.paid_amount + plan.remaining_amount, plan.total_amount);
        assert_eq!(plan.next_payment_date, None);
        assert_eq!(plan.next_payment_amount, None);
        assert!(plan.completed_at.is_some());
    }

    #[test]
    fn payment_below_installment_retires_nothing() {
        let now = Utc::now();
        let mut plan = plan(dec!(1000), PlanType::ThreeMonths, now);
        assert_eq!(
            plan.retire_next_installment(dec!(100), PaymentId(1), "PAY-1", now),
            None
        );
        assert_eq!(plan.paid_installments, 0);
        assert_eq!(plan.remaining_amount, dec!(1000));
        let pending = |row: &RepaymentSchedule| row.status == ScheduleStatus::Pending;
        assert!(plan.schedule.iter().all(pending));
    }

    #[test]
    fn overdue_installments_stay_payable() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut plan = plan(dec!(600), PlanType::SixMonths, now);
        let later = Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap();

        assert_eq!(plan.mark_overdue_installments(later), 2);
        assert_eq!(plan.mark_overdue_installments(later), 0);
        assert!(plan.schedule[0].is_overdue_at(later));

        assert_eq!(
            plan.retire_next_installment(dec!(100), PaymentId(1), "PAY-1", later),
            Some(ScheduleId(1))
        );
        assert_eq!(
            plan.next_installment().map(|row| row.installment_number),
            Some(2)
        );
    }
}
