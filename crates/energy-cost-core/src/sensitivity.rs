//! One-at-a-time sensitivity analysis.
//!
//! Each parameter is moved to `base × (1 ± variation)` while the others stay
//! at their base values, and the levelized cost is re-evaluated. Results are
//! ordered by absolute elasticity, most sensitive first.

use serde::{Deserialize, Serialize};

use crate::lcoe::{evaluate, EngineInputs, Technology, MAX_HORIZON_YEARS};

pub const DEFAULT_VARIATION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parameter {
    Capex,
    OandM,
    CapacityFactor,
    UsefulLife,
    DiscountRate,
    RoundTripEfficiency,
    CycleLife,
    CyclesPerYear,
    CapacityFade,
    FuelCost,
}

const GENERATION_PARAMETERS: &[Parameter] = &[
    Parameter::Capex,
    Parameter::CapacityFactor,
    Parameter::UsefulLife,
    Parameter::OandM,
    Parameter::FuelCost,
    Parameter::DiscountRate,
];

const STORAGE_PARAMETERS: &[Parameter] = &[
    Parameter::Capex,
    Parameter::RoundTripEfficiency,
    Parameter::CycleLife,
    Parameter::CyclesPerYear,
    Parameter::CapacityFade,
    Parameter::DiscountRate,
];

impl Parameter {
    fn name(&self, technology: Technology) -> &'static str {
        match (self, technology) {
            (Self::Capex, Technology::Generation) => "capex_per_kw",
            (Self::Capex, Technology::Storage) => "capex_per_kwh",
            (Self::OandM, Technology::Generation) => "om_per_kw_year",
            (Self::OandM, Technology::Storage) => "om_per_kwh_year",
            (Self::CapacityFactor, _) => "capacity_factor",
            (Self::UsefulLife, _) => "useful_life_years",
            (Self::DiscountRate, _) => "discount_rate",
            (Self::RoundTripEfficiency, _) => "round_trip_efficiency",
            (Self::CycleLife, _) => "cycle_life",
            (Self::CyclesPerYear, _) => "cycles_per_year",
            (Self::CapacityFade, _) => "capacity_fade_rate",
            (Self::FuelCost, _) => "fuel_cost_per_kwh",
        }
    }

    fn get(&self, inputs: &EngineInputs) -> f64 {
        match self {
            Self::Capex => inputs.capex_per_unit,
            Self::OandM => inputs.om_per_unit_year,
            Self::CapacityFactor => inputs.capacity_factor,
            Self::UsefulLife => inputs.useful_life_years as f64,
            Self::DiscountRate => inputs.rates.discount_rate,
            Self::RoundTripEfficiency => inputs.round_trip_efficiency,
            Self::CycleLife => inputs.cycle_life,
            Self::CyclesPerYear => inputs.cycles_per_year,
            Self::CapacityFade => inputs.capacity_fade_rate,
            Self::FuelCost => inputs.fuel_cost_per_kwh,
        }
    }

    /// Apply `value` and return what was actually set.
    fn set(&self, inputs: &mut EngineInputs, value: f64) -> f64 {
        match self {
            Self::Capex => inputs.capex_per_unit = value,
            Self::OandM => inputs.om_per_unit_year = value,
            Self::CapacityFactor => inputs.capacity_factor = value.min(1.0),
            Self::UsefulLife => {
                inputs.useful_life_years = value.round().clamp(1.0, MAX_HORIZON_YEARS as f64) as u32;
                return inputs.useful_life_years as f64;
            }
            Self::DiscountRate => inputs.rates.discount_rate = value,
            Self::RoundTripEfficiency => inputs.round_trip_efficiency = value.min(1.0),
            Self::CycleLife => inputs.cycle_life = value,
            Self::CyclesPerYear => inputs.cycles_per_year = value,
            Self::CapacityFade => inputs.capacity_fade_rate = value,
            Self::FuelCost => inputs.fuel_cost_per_kwh = value,
        }
        self.get(inputs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityRow {
    pub parameter: String,
    pub base_value: f64,
    pub low_value: f64,
    pub high_value: f64,
    pub base_result: f64,
    pub low_result: f64,
    pub high_result: f64,
    /// Change in result per unit change in the parameter.
    pub sensitivity: f64,
    /// Relative change in result per relative change in the parameter.
    pub elasticity: f64,
}

/// Run the analysis. Returns an empty table when the base case itself
/// cannot be evaluated; parameters whose perturbation makes evaluation fail
/// are left out.
pub fn analyze(base: &EngineInputs, variation: f64) -> Vec<SensitivityRow> {
    let Some(base_eval) = evaluate(base) else {
        return Vec::new();
    };
    let base_result = base_eval.value_usd_per_kwh;

    let parameters = match base.technology {
        Technology::Generation => GENERATION_PARAMETERS,
        Technology::Storage => STORAGE_PARAMETERS,
    };

    let mut rows = Vec::new();
    for param in parameters {
        let base_value = param.get(base);
        // Fuel only matters for plants that burn it.
        if *param == Parameter::FuelCost && base_value == 0.0 {
            continue;
        }

        let mut low = base.clone();
        let low_value = param.set(&mut low, base_value * (1.0 - variation));
        let mut high = base.clone();
        let high_value = param.set(&mut high, base_value * (1.0 + variation));

        let (Some(low_eval), Some(high_eval)) = (evaluate(&low), evaluate(&high)) else {
            continue;
        };
        let low_result = low_eval.value_usd_per_kwh;
        let high_result = high_eval.value_usd_per_kwh;

        let dv = high_value - low_value;
        let sensitivity = if dv != 0.0 {
            (high_result - low_result) / dv
        } else {
            0.0
        };
        let elasticity = if base_value != 0.0 && base_result != 0.0 && dv != 0.0 {
            ((high_result - low_result) / base_result) / (dv / base_value)
        } else {
            0.0
        };

        rows.push(SensitivityRow {
            parameter: param.name(base.technology).to_string(),
            base_value,
            low_value,
            high_value,
            base_result,
            low_result,
            high_result,
            sensitivity,
            elasticity,
        });
    }

    rows.sort_by(|a, b| {
        b.elasticity
            .abs()
            .total_cmp(&a.elasticity.abs())
            .then_with(|| a.parameter.cmp(&b.parameter))
    });
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lcoe::Rates;
    use crate::models::{FinancingTerms, IncentivePolicy, IncentiveTerms};

    fn pv_inputs() -> EngineInputs {
        EngineInputs {
            technology: Technology::Generation,
            size: 7.0,
            capex_per_unit: 2500.0,
            om_per_unit_year: 20.0,
            useful_life_years: 25,
            capacity_factor: 0.2,
            degradation_rate: 0.005,
            round_trip_efficiency: 1.0,
            depth_of_discharge: 1.0,
            capacity_fade_rate: 0.0,
            cycle_life: 0.0,
            cycles_per_year: 0.0,
            rates: Rates {
                discount_rate: 0.06,
                inflation_rate: 0.02,
            },
            financing: FinancingTerms {
                loan_rate: 0.05,
                loan_term_years: 15,
                down_payment_fraction: 0.2,
            },
            incentives: IncentiveTerms {
                itc_fraction: 0.3,
                rebate_per_kw: 0.0,
                rebate_per_kwh: 0.0,
                policy: IncentivePolicy::Upfront,
                amortize_years: 0,
            },
            rebate_per_unit: 0.0,
            fuel_cost_per_kwh: 0.0,
        }
    }

    #[test]
    fn capex_raises_cost_and_capacity_factor_lowers_it() {
        let rows = analyze(&pv_inputs(), DEFAULT_VARIATION);
        assert_eq!(rows.len(), 5);

        let capex = rows.iter().find(|r| r.parameter == "capex_per_kw").unwrap();
        assert!(capex.high_result > capex.base_result);
        assert!(capex.low_result < capex.base_result);
        assert!(capex.elasticity > 0.0);

        let cf = rows.iter().find(|r| r.parameter == "capacity_factor").unwrap();
        assert!(cf.elasticity < 0.0);
        // Output scales linearly, so LCOE is exactly inverse in capacity factor.
        assert!((cf.low_result * 0.8 - cf.base_result).abs() < 1e-12);
    }

    #[test]
    fn sorted_by_absolute_elasticity() {
        let rows = analyze(&pv_inputs(), DEFAULT_VARIATION);
        for pair in rows.windows(2) {
            assert!(pair[0].elasticity.abs() >= pair[1].elasticity.abs());
        }
    }

    #[test]
    fn unevaluable_base_yields_empty_table() {
        let mut inputs = pv_inputs();
        inputs.capacity_factor = 0.0;
        assert!(analyze(&inputs, DEFAULT_VARIATION).is_empty());
    }

    #[test]
    fn fuel_cost_is_varied_when_present() {
        let mut inputs = pv_inputs();
        inputs.fuel_cost_per_kwh = 0.04;
        let rows = analyze(&inputs, DEFAULT_VARIATION);
        assert_eq!(rows.len(), 6);
        let fuel = rows.iter().find(|r| r.parameter == "fuel_cost_per_kwh").unwrap();
        assert!(fuel.elasticity > 0.0);
        assert!((fuel.sensitivity - (fuel.high_result - fuel.low_result) / 0.016).abs() < 1e-9);
    }

    #[test]
    fn life_is_rounded_to_whole_years() {
        let rows = analyze(&pv_inputs(), DEFAULT_VARIATION);
        let life = rows.iter().find(|r| r.parameter == "useful_life_years").unwrap();
        assert_eq!(life.low_value, 20.0);
        assert_eq!(life.high_value, 30.0);
    }
}
