//! Processor fee estimation and net-amount computation.
//!
//! Fees follow the standard card-processing shape: a percentage of the
//! charged amount plus a fixed per-transaction component. Rates are
//! configuration, not business logic scattered across call sites; the
//! defaults match the published card rates of each processor.
//!
//! All amounts are integer minor units (cents). The percentage component is
//! expressed in basis points so the half-up rounding is exact integer math.

use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::payments::PaymentProcessor;

/// Fee schedule for a single processor: `amount * percent_bps/10_000 + fixed_cents`.
#[derive(Debug, Clone, Copy)]
pub struct FeeSchedule {
    /// Percentage component in basis points (290 = 2.90%).
    pub percent_bps: i64,
    /// Fixed component in cents.
    pub fixed_cents: i64,
}

impl FeeSchedule {
    /// Published default card rate for a processor.
    pub fn default_for(processor: PaymentProcessor) -> Self {
        match processor {
            // 2.9% + $0.30
            PaymentProcessor::Stripe => FeeSchedule {
                percent_bps: 290,
                fixed_cents: 30,
            },
            // 2.99% + $0.49
            PaymentProcessor::Paypal => FeeSchedule {
                percent_bps: 299,
                fixed_cents: 49,
            },
        }
    }
}

/// Pure fee calculator over per-processor schedules.
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    schedules: HashMap<PaymentProcessor, FeeSchedule>,
}

impl Default for FeeCalculator {
    fn default() -> Self {
        let mut schedules = HashMap::new();
        for processor in PaymentProcessor::ALL {
            schedules.insert(processor, FeeSchedule::default_for(processor));
        }
        Self { schedules }
    }
}

impl FeeCalculator {
    /// Build a calculator with explicit schedules. Every supported processor
    /// must have an entry; a missing one is a configuration error surfaced at
    /// first use rather than a silent fallback.
    pub fn new(schedules: HashMap<PaymentProcessor, FeeSchedule>) -> Self {
        Self { schedules }
    }

    fn schedule(&self, processor: PaymentProcessor) -> Result<&FeeSchedule> {
        self.schedules.get(&processor).ok_or_else(|| {
            AppError::Config(format!("no fee schedule configured for {}", processor))
        })
    }

    /// Estimate the processor fee for a charge of `amount_cents`.
    ///
    /// Half-up rounding on the percentage component, matching how processors
    /// round their own statements.
    pub fn calculate_fee(&self, processor: PaymentProcessor, amount_cents: i64) -> Result<i64> {
        if amount_cents < 0 {
            return Err(AppError::BadRequest("amount must be non-negative".into()));
        }
        let schedule = self.schedule(processor)?;
        let percent = (amount_cents * schedule.percent_bps + 5_000) / 10_000;
        Ok(percent + schedule.fixed_cents)
    }
}

/// Net amount credited to the organization for a settled gift.
///
/// When the donor covers the fee, the fee was charged on top and the full
/// donation amount is payable. Otherwise the *actual settled* processor fee
/// (reported by the settlement webhook, which may differ from the pre-charge
/// estimate) comes out of the donation.
pub fn compute_net_amount(
    amount_cents: i64,
    processor_fee_cents: i64,
    donor_covers_fee: bool,
) -> i64 {
    if donor_covers_fee {
        amount_cents
    } else {
        amount_cents - processor_fee_cents
    }
}
