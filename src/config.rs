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

//! Business-rule configuration.
//!
//! Defaults match the platform's published terms. [`LedgerConfig::load`]
//! layers an optional `ledger.toml` and `BNPL_*` environment variables on
//! top of them.

use crate::error::LedgerError;
use chrono::Duration;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Credit line granted at registration, in SAR.
    pub default_credit_limit: Decimal,
    /// Highest credit limit a customer may hold.
    pub max_credit_limit: Decimal,
    /// Limit requests up to this value are tagged `auto`, above it `auto_high_limit`.
    pub auto_approve_limit_ceiling: Decimal,
    /// Fraction of gross value kept by the platform (0.005 = 0.5%).
    pub platform_commission_rate: Decimal,
    pub purchase_request_expiry_hours: i64,
    pub default_repayment_days: i64,
    pub default_risk_score: u8,
    /// Record settlements as `completed` on creation. When off they start
    /// `pending` and move through the admin transitions.
    pub settle_immediately: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_credit_limit: dec!(5000.00),
            max_credit_limit: dec!(50000.00),
            auto_approve_limit_ceiling: dec!(5000.00),
            platform_commission_rate: dec!(0.005),
            purchase_request_expiry_hours: 24,
            default_repayment_days: 10,
            default_risk_score: 50,
            settle_immediately: true,
        }
    }
}

impl LedgerConfig {
    /// Loads configuration from `ledger.toml` (optional) and `BNPL_*` variables.
    pub fn load() -> Result<Self, LedgerError> {
        let config = Config::builder()
            .add_source(File::with_name("ledger").required(false))
            .add_source(Environment::with_prefix("BNPL"))
            .build()
            .map_err(|e| LedgerError::Invalid(format!("configuration: {e}")))?;

        let config: Self = config
            .try_deserialize()
            .map_err(|e| LedgerError::Invalid(format!("configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let rate = self.platform_commission_rate;
        if rate < Decimal::ZERO || rate >= Decimal::ONE {
            return Err(LedgerError::Invalid("platform_commission_rate must be in [0, 1)".into()));
        }
        if self.purchase_request_expiry_hours <= 0 {
            return Err(LedgerError::Invalid(
                "purchase_request_expiry_hours must be positive".into(),
            ));
        }
        if self.default_repayment_days <= 0 {
            return Err(LedgerError::Invalid("default_repayment_days must be positive".into()));
        }
        if self.default_credit_limit > self.max_credit_limit {
            return Err(LedgerError::Invalid(
                "default_credit_limit exceeds max_credit_limit".into(),
            ));
        }
        if self.default_risk_score > 100 {
            return Err(LedgerError::Invalid("default_risk_score must be within 0..=100".into()));
        }
        Ok(())
    }

    pub fn request_ttl(&self) -> Duration {
        Duration::hours(self.purchase_request_expiry_hours)
    }

    pub fn repayment_period(&self) -> Duration {
        Duration::days(self.default_repayment_days)
    }
}
