//! Token-based cost estimation for finalized jobs.

use rust_decimal::Decimal;

/// Flat per-token pricing.
#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    per_token: Decimal,
}

impl CostModel {
    pub fn new(per_token: Decimal) -> Self {
        Self { per_token }
    }

    /// Estimated cost of `tokens` tokens. Negative counts are treated as zero.
    pub fn estimate(&self, tokens: i64) -> Decimal {
        if tokens <= 0 {
            return Decimal::ZERO;
        }
        (Decimal::from(tokens) * self.per_token).normalize()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn estimate_multiplies_tokens() {
        let model = CostModel::new(dec!(0.000002));
        assert_eq!(model.estimate(1_500), dec!(0.003));
    }

    #[test]
    fn estimate_zero_and_negative() {
        let model = CostModel::new(dec!(0.01));
        assert_eq!(model.estimate(0), Decimal::ZERO);
        assert_eq!(model.estimate(-5), Decimal::ZERO);
    }
}
