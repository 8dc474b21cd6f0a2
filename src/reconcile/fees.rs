//! Fee escalation for replacement transactions.

use crate::onchain::FeeParams;

/// Fee multipliers are kept as integer percentages so scaling stays exact in
/// wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    /// Used whenever the node cannot give us an estimate.
    pub floor: FeeParams,
    pub speed_up_percent: u128,
    pub cancel_percent: u128,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            floor: FeeParams::from_gwei(5, 2),
            speed_up_percent: 125,
            cancel_percent: 200,
        }
    }
}

/// `1.25` → `125`. Multipliers below 1 are treated as 1.
pub fn multiplier_to_percent(multiplier: f64) -> u128 {
    (multiplier.max(1.0) * 100.0).round() as u128
}

impl FeePolicy {
    pub fn new(floor: FeeParams, speed_up_multiplier: f64, cancel_multiplier: f64) -> Self {
        Self {
            floor,
            speed_up_percent: multiplier_to_percent(speed_up_multiplier),
            cancel_percent: multiplier_to_percent(cancel_multiplier),
        }
    }

    /// Fees for a first submission.
    pub fn initial(&self, estimate: Option<FeeParams>) -> FeeParams {
        clamp(estimate.unwrap_or(self.floor))
    }

    pub fn speed_up(&self, estimate: Option<FeeParams>, prior: Option<FeeParams>) -> FeeParams {
        self.escalate(estimate, prior, self.speed_up_percent)
    }

    pub fn cancel(&self, estimate: Option<FeeParams>, prior: Option<FeeParams>) -> FeeParams {
        self.escalate(estimate, prior, self.cancel_percent)
    }

    /// Scale the larger of the current estimate and what the transaction
    /// being replaced paid. Nodes reject replacements that do not outbid the
    /// transaction they replace.
    fn escalate(
        &self,
        estimate: Option<FeeParams>,
        prior: Option<FeeParams>,
        percent: u128,
    ) -> FeeParams {
        let base = estimate.unwrap_or(self.floor);
        let base = prior.map_or(base, |p| base.max(p));
        clamp(FeeParams::new(
            scale(base.max_fee_per_gas, percent),
            scale(base.max_priority_fee_per_gas, percent),
        ))
    }
}

fn scale(wei: u128, percent: u128) -> u128 {
    wei.saturating_mul(percent) / 100
}

/// The priority fee can never exceed the max fee.
fn clamp(fees: FeeParams) -> FeeParams {
    FeeParams::new(
        fees.max_fee_per_gas,
        fees.max_priority_fee_per_gas.min(fees.max_fee_per_gas),
    )
}
