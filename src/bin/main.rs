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
use anyhow::{Context, Result};
use bnpl_ledger::{
    BankDetails, Caller, CustomerId, Ledger, LedgerConfig, LedgerError, MerchantId, NewCustomer,
    NewMerchant, NewPurchaseRequest, PaymentMethod, PaymentTarget, PlanId, PlanType,
    PurchaseRequestId, TransactionId,
};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// BNPL Ledger - Replay ledger command CSV files
///
/// Reads ledger commands from a CSV file, applies them in order and writes
/// customer and merchant balances to stdout.
#[derive(Parser, Debug)]
#[command(name = "bnpl-ledger")]
#[command(about = "Replays BNPL ledger commands from a CSV file", long_about = None)]
struct Args {
    /// Path to CSV file with commands
    ///
    /// Expected format: command,actor,target,amount,detail
    /// Example: cargo run -- commands.csv > balances.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Also write the event journal to this CSV file
    #[arg(long, value_name = "PATH")]
    journal: Option<PathBuf>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = LedgerConfig::load().context("loading ledger configuration")?;

    let file = File::open(&args.input)
        .with_context(|| format!("opening '{}'", args.input.display()))?;
    let ledger = replay(Ledger::new(config), BufReader::new(file)).context("reading commands")?;

    write_balances(&ledger, std::io::stdout()).context("writing balances")?;

    if let Some(path) = &args.journal {
        let file = File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
        write_journal(&ledger, file).context("writing journal")?;
    }
    Ok(())
}

/// Raw CSV record matching the input format.
///
/// Fields: `command, actor, target, amount, detail`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    command: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    actor: Option<u64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    target: Option<u64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default)]
    detail: Option<String>,
}

/// A parsed replay command. Ids refer to records created earlier in the
/// same file; the ledger numbers every table from 1.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    RegisterCustomer {
        user_ref: String,
        limit: Option<Decimal>,
    },
    RegisterMerchant { shop_name: String },
    Request {
        merchant: MerchantId,
        customer: CustomerId,
        amount: Decimal,
        product: String,
    },
    Accept {
        customer: CustomerId,
        request: PurchaseRequestId,
        plan: Option<PlanType>,
    },
    Reject {
        customer: CustomerId,
        request: PurchaseRequestId,
        reason: Option<String>,
    },
    Cancel {
        merchant: MerchantId,
        request: PurchaseRequestId,
    },
    Pay {
        customer: CustomerId,
        target: PaymentTarget,
        amount: Decimal,
        method: PaymentMethod,
    },
    Withdraw {
        merchant: MerchantId,
        amount: Decimal,
        iban: Option<String>,
    },
    Settle {
        merchant: MerchantId,
        transaction: TransactionId,
    },
    Limit {
        customer: CustomerId,
        amount: Decimal,
    },
    Expire,
    Sweep,
}

impl CsvRecord {
    /// Converts a CSV record to a command.
    ///
    /// Returns `None` for unknown commands or missing required fields.
    fn into_command(self) -> Option<Command> {
        let detail = self.detail.filter(|detail| !detail.is_empty());
        let command = match self.command.to_lowercase().as_str() {
            "customer" => Command::RegisterCustomer {
                user_ref: detail?,
                limit: self.amount,
            },
            "merchant" => Command::RegisterMerchant { shop_name: detail? },
            "request" => Command::Request {
                merchant: MerchantId(self.actor?),
                customer: CustomerId(self.target?),
                amount: self.amount?,
                product: detail.unwrap_or_else(|| "item".to_string()),
            },
            "accept" => Command::Accept {
                customer: CustomerId(self.actor?),
                request: PurchaseRequestId(self.target?),
                plan: match detail {
                    Some(months) => Some(PlanType::try_from(months.parse::<u32>().ok()?).ok()?),
                    None => None,
                },
            },
            "reject" => Command::Reject {
                customer: CustomerId(self.actor?),
                request: PurchaseRequestId(self.target?),
                reason: detail,
            },
            "cancel" => Command::Cancel {
                merchant: MerchantId(self.actor?),
                request: PurchaseRequestId(self.target?),
            },
            "pay" | "pay_plan" => Command::Pay {
                customer: CustomerId(self.actor?),
                target: if self.command.eq_ignore_ascii_case("pay") {
                    PaymentTarget::Transaction(TransactionId(self.target?))
                } else {
                    PaymentTarget::Plan(PlanId(self.target?))
                },
                amount: self.amount?,
                method: match detail {
                    Some(method) => method.parse().ok()?,
                    None => PaymentMethod::default(),
                },
            },
            "withdraw" => Command::Withdraw {
                merchant: MerchantId(self.actor?),
                amount: self.amount?,
                iban: detail,
            },
            "settle" => Command::Settle {
                merchant: MerchantId(self.actor?),
                transaction: TransactionId(self.target?),
            },
            "limit" => Command::Limit {
                customer: CustomerId(self.actor?),
                amount: self.amount?,
            },
            "expire" => Command::Expire,
            "sweep" => Command::Sweep,
            _ => return None,
        };
        Some(command)
    }
}

fn apply(ledger: &Ledger, command: Command) -> Result<(), LedgerError> {
    match command {
        Command::RegisterCustomer { user_ref, limit } => {
            let mut input = NewCustomer::new(user_ref);
            if let Some(limit) = limit {
                input = input.with_credit_limit(limit);
            }
            ledger.register_customer(input)?;
        }
        Command::RegisterMerchant { shop_name } => {
            let user_ref = format!("merchant:{shop_name}");
            ledger.register_merchant(NewMerchant::new(user_ref, shop_name))?;
        }
        Command::Request {
            merchant,
            customer,
            amount,
            product,
        } => {
            ledger.create_purchase_request(
                &Caller::Merchant(merchant),
                NewPurchaseRequest::new(customer, product, amount),
            )?;
        }
        Command::Accept {
            customer,
            request,
            plan,
        } => {
            ledger.accept_purchase_request(&Caller::Customer(customer), request, plan)?;
        }
        Command::Reject {
            customer,
            request,
            reason,
        } => {
            ledger.reject_purchase_request(&Caller::Customer(customer), request, reason)?;
        }
        Command::Cancel { merchant, request } => {
            ledger.cancel_purchase_request(&Caller::Merchant(merchant), request)?;
        }
        Command::Pay {
            customer,
            target,
            amount,
            method,
        } => {
            ledger.make_payment(&Caller::Customer(customer), target, amount, method)?;
        }
        Command::Withdraw {
            merchant,
            amount,
            iban,
        } => {
            let caller = Caller::Merchant(merchant);
            let bank = match iban {
                Some(iban) => {
                    let current = ledger.merchant(&caller, merchant)?.bank;
                    Some(BankDetails {
                        iban: Some(iban),
                        ..current
                    })
                }
                None => None,
            };
            ledger.request_withdrawal(&caller, amount, bank)?;
        }
        Command::Settle {
            merchant,
            transaction,
        } => {
            ledger.receive_settlement(&Caller::Merchant(merchant), transaction)?;
        }
        Command::Limit { customer, amount } => {
            ledger.change_credit_limit(&Caller::Customer(customer), customer, amount, None)?;
        }
        Command::Expire => {
            ledger.expire_purchase_requests();
        }
        Command::Sweep => {
            ledger.sweep_overdue();
        }
    }
    Ok(())
}

/// Replays commands from a CSV reader.
///
/// Malformed rows and rejected commands are logged and skipped; replay
/// continues with the next row.
///
/// # CSV Format
///
/// Expected columns: `command, actor, target, amount, detail`
///
/// ```csv
/// command,actor,target,amount,detail
/// customer,,,5000,user-1
/// merchant,,,,Tech Store
/// request,1,1,1000,Phone
/// accept,1,1,,3
/// pay,1,1,333.33,card
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
pub fn replay<R: Read>(ledger: Ledger, reader: R) -> Result<Ledger, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(error) => {
                warn!(line = line + 2, %error, "skipping malformed row");
                continue;
            }
        };
        let Some(command) = record.into_command() else {
            warn!(line = line + 2, "skipping invalid command");
            continue;
        };
        debug!(line = line + 2, ?command, "applying");
        if let Err(error) = apply(&ledger, command) {
            warn!(line = line + 2, kind = %error.kind(), %error, "command rejected");
        }
    }

    Ok(ledger)
}

#[derive(Debug, Serialize)]
struct CustomerRow {
    customer: u64,
    code: String,
    credit_limit: String,
    available: String,
    outstanding: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct MerchantRow {
    merchant: u64,
    shop: String,
    transactions: u64,
    volume: String,
    balance: String,
    commission_paid: String,
}

/// Writes customer balances, a blank line, then merchant balances.
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_balances<W: Write>(ledger: &Ledger, mut writer: W) -> Result<(), csv::Error> {
    {
        let mut wtr = Writer::from_writer(&mut writer);
        for customer in ledger.store().customers.filter(|_| true) {
            wtr.serialize(CustomerRow {
                customer: customer.id.0,
                code: customer.customer_code,
                credit_limit: format!("{:.2}", customer.credit_limit),
                available: format!("{:.2}", customer.available_balance),
                outstanding: format!("{:.2}", customer.outstanding_balance),
                status: customer.status.to_string(),
            })?;
        }
        wtr.flush()?;
    }
    writeln!(writer)?;

    let mut wtr = Writer::from_writer(writer);
    for merchant in ledger.store().merchants.filter(|_| true) {
        wtr.serialize(MerchantRow {
            merchant: merchant.id.0,
            shop: merchant.shop_name,
            transactions: merchant.total_transactions,
            volume: format!("{:.2}", merchant.total_volume),
            balance: format!("{:.2}", merchant.balance),
            commission_paid: format!("{:.2}", merchant.total_commission_paid),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// Drains the event journal into a CSV writer, oldest first.
pub fn write_journal<W: Write>(ledger: &Ledger, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for event in ledger.journal().drain() {
        wtr.serialize(event)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bnpl_ledger::{RequestStatus, TransactionStatus};
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    const HEADER: &str = "command,actor,target,amount,detail\n";

    fn run(body: &str) -> Ledger {
        let csv = format!("{HEADER}{body}");
        replay(Ledger::default(), Cursor::new(csv)).unwrap()
    }

    #[test]
    fn parse_registration_and_purchase() {
        let ledger = run("customer,,,,user-1\n\
                          merchant,,,,Tech Store\n\
                          request,1,1,1000,Phone\n\
                          accept,1,1,,3\n");

        let customer = ledger.store().customers.get(CustomerId(1)).unwrap();
        assert_eq!(customer.available_balance, dec!(4000));
        assert_eq!(customer.outstanding_balance, dec!(1000));

        let merchant = ledger.store().merchants.get(MerchantId(1)).unwrap();
        assert_eq!(merchant.balance, dec!(995.00));

        let plan = ledger.store().plans.get(PlanId(1)).unwrap();
        assert_eq!(plan.number_of_installments, 3);
    }

    #[test]
    fn parse_payments_to_completion() {
        let ledger = run("customer,,,,user-1\n\
                          merchant,,,,Tech Store\n\
                          request,1,1,300,Phone\n\
                          accept,1,1,,3\n\
                          pay,1,1,100,card\n\
                          pay_plan,1,1,100,wallet\n\
                          pay,1,1,100,bank_transfer\n");

        let txn = ledger.store().transactions.get(TransactionId(1)).unwrap();
        assert_eq!(txn.status, TransactionStatus::Completed);
        assert_eq!(ledger.store().payments.len(), 3);
    }

    #[test]
    fn parse_with_whitespace() {
        let ledger = run(" customer , , , 2000 , user-1 \n");
        let customer = ledger.store().customers.get(CustomerId(1)).unwrap();
        assert_eq!(customer.credit_limit, dec!(2000));
    }

    #[test]
    fn skip_malformed_and_rejected_rows() {
        let ledger = run("customer,,,,user-1\n\
                          merchant,,,,Tech Store\n\
                          invalid,row,data,here,now\n\
                          request,1,1,9000,TV\n\
                          request,1,1,100,Cable\n\
                          accept,1,1,,5\n\
                          accept,1,1,,\n");

        // The 9000 request exceeds the limit; plan type 5 is not offered.
        assert_eq!(ledger.store().purchase_requests.len(), 1);
        let requests = &ledger.store().purchase_requests;
        let request = requests.get(PurchaseRequestId(1)).unwrap();
        assert_eq!(request.status, RequestStatus::Accepted);
    }

    #[test]
    fn withdrawal_updates_iban() {
        let ledger = run("customer,,,,user-1\n\
                          merchant,,,,Tech Store\n\
                          request,1,1,1000,Phone\n\
                          accept,1,1,,\n\
                          withdraw,1,,500,SA4420000001234567891234\n");

        let merchant = ledger.store().merchants.get(MerchantId(1)).unwrap();
        assert_eq!(merchant.balance, dec!(495.00));
        assert_eq!(
            merchant.bank.iban.as_deref(),
            Some("SA4420000001234567891234")
        );
    }

    #[test]
    fn write_balances_to_csv() {
        let ledger = run("customer,,,,user-1\n\
                          merchant,,,,Tech Store\n\
                          request,1,1,1000,Phone\n\
                          accept,1,1,,\n");

        let mut output = Vec::new();
        write_balances(&ledger, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        let customer_header = "customer,code,credit_limit,available,outstanding,status";
        assert!(output.contains(customer_header));
        assert!(output.contains(",5000.00,4000.00,1000.00,active"));
        let merchant_header = "merchant,shop,transactions,volume,balance,commission_paid";
        assert!(output.contains(merchant_header));
        assert!(output.contains("1,Tech Store,1,1000.00,995.00,5.00"));
    }

    #[test]
    fn write_journal_drains_events() {
        let ledger = run("customer,,,,user-1\nmerchant,,,,Tech Store\n");

        let mut output = Vec::new();
        write_journal(&ledger, &mut output).unwrap();

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("kind,reference,amount,occurred_at\n"));
        assert!(output.contains("customer_registered"));
        assert!(output.contains("merchant_registered,MER-1"));
        assert!(ledger.journal().is_empty());
    }
}
