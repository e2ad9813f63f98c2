//! Levelized cost engine.
//!
//! Computes LCOE for generation entities and LCOS for storage entities from
//! a scenario, the entity's facts and the global assumptions:
//!
//! ```text
//! LCOE = Σ cost_t / (1+r)^t  ÷  Σ output_t / (1+r)^t      t = 0..N
//! ```
//!
//! The engine is split in two steps so that sensitivity analysis can perturb
//! the numeric inputs directly:
//!
//! 1. [`EngineInputs::resolve`] selects facts, applies defaults and converts
//!    every percentage into a fraction.
//! 2. [`evaluate`] builds the yearly cash-flow table and discounts it.
//!
//! No clock, randomness or I/O is involved; identical inputs produce
//! bit-identical outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::models::{
    Assumption, Entity, EntityType, Fact, FinancingTerms, IncentivePolicy, IncentiveTerms,
    ScenarioSpec,
};
use crate::normalize;

pub const HOURS_PER_YEAR: f64 = 8760.0;
/// Replacement cost as a share of the initial capital cost.
pub const REPLACEMENT_COST_FRACTION: f64 = 0.7;
/// Storage capacity never fades below this share of nameplate.
pub const MIN_CAPACITY_RETENTION: f64 = 0.5;

/// Longest useful life or loan term the cash-flow table is built for.
pub const MAX_HORIZON_YEARS: u32 = 100;

pub const DEFAULT_CAPACITY_FADE_PERCENT: f64 = 2.0;
pub const DEFAULT_DEPTH_OF_DISCHARGE_PERCENT: f64 = 90.0;

pub const GENERATION_REQUIRED: &[&str] = &[
    "capex_per_kw",
    "om_per_kw_year",
    "degradation_rate",
    "useful_life_years",
];

pub const STORAGE_REQUIRED: &[&str] = &[
    "capex_per_kwh",
    "om_per_kwh_year",
    "round_trip_efficiency",
    "cycle_life",
    "useful_life_years",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technology {
    Generation,
    Storage,
}

/// Discount and inflation rates as fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub discount_rate: f64,
    pub inflation_rate: f64,
}

impl Rates {
    /// Look up `discount_rate` and `inflation_rate` by exact name.
    pub fn from_assumptions(assumptions: &[Assumption]) -> Result<Self, PipelineError> {
        let lookup = |name: &str| -> Result<f64, PipelineError> {
            let assumption = assumptions
                .iter()
                .find(|a| a.name == name)
                .ok_or_else(|| PipelineError::MissingAssumption {
                    name: name.to_string(),
                })?;
            let (percent, _) = normalize::normalize(assumption.value, &assumption.unit, "annual_rate")?;
            Ok(percent / 100.0)
        };
        Ok(Self {
            discount_rate: lookup("discount_rate")?,
            inflation_rate: lookup("inflation_rate")?,
        })
    }
}

/// The fact chosen for one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedFact {
    pub fact_id: i64,
    pub value: f64,
    pub unit: String,
    pub quality_score: f64,
}

/// Pick the best fact per metric: highest quality, then most recently
/// extracted, then lowest id.
pub fn select_facts(facts: &[Fact]) -> BTreeMap<String, &Fact> {
    let mut best: BTreeMap<String, &Fact> = BTreeMap::new();
    for fact in facts {
        match best.get(&fact.metric) {
            Some(current) if !better_fact(fact, current) => {}
            _ => {
                best.insert(fact.metric.clone(), fact);
            }
        }
    }
    best
}

fn better_fact(candidate: &Fact, current: &Fact) -> bool {
    candidate
        .quality_score
        .total_cmp(&current.quality_score)
        .then_with(|| candidate.extracted_at.cmp(&current.extracted_at))
        .then_with(|| current.id.cmp(&candidate.id))
        .is_gt()
}

/// Fully resolved numeric inputs. Rates and percentages are fractions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInputs {
    pub technology: Technology,
    /// kW for generation, kWh for storage.
    pub size: f64,
    pub capex_per_unit: f64,
    pub om_per_unit_year: f64,
    pub useful_life_years: u32,
    pub capacity_factor: f64,
    pub degradation_rate: f64,
    pub round_trip_efficiency: f64,
    pub depth_of_discharge: f64,
    pub capacity_fade_rate: f64,
    pub cycle_life: f64,
    pub cycles_per_year: f64,
    pub rates: Rates,
    pub financing: FinancingTerms,
    pub incentives: IncentiveTerms,
    /// Rebate per kW or per kWh depending on the technology.
    pub rebate_per_unit: f64,
    /// Fuel cost per kWh generated, escalated with inflation.
    #[serde(default)]
    pub fuel_cost_per_kwh: f64,
}

/// Inputs plus the provenance needed for the breakdown.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub inputs: EngineInputs,
    pub selected: BTreeMap<String, SelectedFact>,
    pub defaults_used: Vec<String>,
    pub confidence: f64,
}

impl EngineInputs {
    pub fn resolve(
        scenario: &ScenarioSpec,
        entity: &Entity,
        facts: &[Fact],
        rates: Rates,
    ) -> Result<Resolved, PipelineError> {
        let technology = if entity.entity_type.is_storage() {
            Technology::Storage
        } else if entity.entity_type.is_generation() {
            Technology::Generation
        } else {
            return Err(PipelineError::invalid(format!(
                "entity type '{}' has no levelized cost model",
                entity.entity_type
            )));
        };

        let best = select_facts(facts);
        let mut selected = BTreeMap::new();
        let mut defaults_used = Vec::new();

        let required = match technology {
            Technology::Generation => GENERATION_REQUIRED,
            Technology::Storage => STORAGE_REQUIRED,
        };
        for metric in required {
            if !best.contains_key(*metric) {
                return Err(PipelineError::InsufficientData {
                    entity_id: entity.id,
                    metric: metric.to_string(),
                });
            }
        }

        let mut take = |metric: &str| -> Option<f64> {
            best.get(metric).map(|f| {
                selected.insert(
                    metric.to_string(),
                    SelectedFact {
                        fact_id: f.id,
                        value: f.value,
                        unit: f.unit.clone(),
                        quality_score: f.quality_score,
                    },
                );
                f.value
            })
        };

        let lp = &scenario.load_profile;
        let mut inputs = EngineInputs {
            technology,
            size: 0.0,
            capex_per_unit: 0.0,
            om_per_unit_year: 0.0,
            useful_life_years: 0,
            capacity_factor: 0.0,
            degradation_rate: 0.0,
            round_trip_efficiency: 1.0,
            depth_of_discharge: 1.0,
            capacity_fade_rate: 0.0,
            cycle_life: 0.0,
            cycles_per_year: 0.0,
            rates,
            financing: scenario.financing.clone(),
            incentives: scenario.incentives.clone(),
            rebate_per_unit: 0.0,
            fuel_cost_per_kwh: 0.0,
        };

        let life = take("useful_life_years").unwrap_or_default();
        match technology {
            Technology::Generation => {
                inputs.size = lp.system_size_kw;
                inputs.capex_per_unit = take("capex_per_kw").unwrap_or_default();
                inputs.om_per_unit_year = take("om_per_kw_year").unwrap_or_default();
                inputs.degradation_rate = take("degradation_rate").unwrap_or_default() / 100.0;
                inputs.capacity_factor = match take("capacity_factor") {
                    Some(percent) => percent / 100.0,
                    None => {
                        defaults_used.push("capacity_factor".to_string());
                        lp.capacity_factor
                    }
                };
                inputs.rebate_per_unit = scenario.incentives.rebate_per_kw;
                inputs.fuel_cost_per_kwh = match take("fuel_cost_per_kwh") {
                    Some(cost) => cost,
                    None => {
                        if entity.entity_type == EntityType::Thermal {
                            defaults_used.push("fuel_cost_per_kwh".to_string());
                        }
                        0.0
                    }
                };
            }
            Technology::Storage => {
                inputs.size = lp.storage_kwh;
                inputs.capex_per_unit = take("capex_per_kwh").unwrap_or_default();
                inputs.om_per_unit_year = take("om_per_kwh_year").unwrap_or_default();
                inputs.round_trip_efficiency =
                    take("round_trip_efficiency").unwrap_or_default() / 100.0;
                inputs.cycle_life = take("cycle_life").unwrap_or_default();
                inputs.cycles_per_year = lp.cycles_per_year;
                inputs.capacity_fade_rate = match take("capacity_fade_rate") {
                    Some(percent) => percent / 100.0,
                    None => {
                        defaults_used.push("capacity_fade_rate".to_string());
                        DEFAULT_CAPACITY_FADE_PERCENT / 100.0
                    }
                };
                inputs.depth_of_discharge = match take("depth_of_discharge") {
                    Some(percent) => percent / 100.0,
                    None => {
                        defaults_used.push("depth_of_discharge".to_string());
                        DEFAULT_DEPTH_OF_DISCHARGE_PERCENT / 100.0
                    }
                };
                inputs.rebate_per_unit = scenario.incentives.rebate_per_kwh;
            }
        }

        // A life outside 1..=MAX_HORIZON_YEARS is an extraction artefact.
        let rounded = life.round();
        if !(1.0..=MAX_HORIZON_YEARS as f64).contains(&rounded) {
            return Err(PipelineError::InsufficientData {
                entity_id: entity.id,
                metric: "useful_life_years".to_string(),
            });
        }
        inputs.useful_life_years = rounded as u32;
        if inputs.financing.loan_term_years > MAX_HORIZON_YEARS {
            return Err(PipelineError::invalid(format!(
                "loan_term_years must be <= {}",
                MAX_HORIZON_YEARS
            )));
        }

        let confidence = selected
            .values()
            .map(|s| s.quality_score)
            .fold(f64::INFINITY, f64::min);
        let confidence = if confidence.is_finite() { confidence } else { 0.0 };

        Ok(Resolved {
            inputs,
            selected,
            defaults_used,
            confidence,
        })
    }
}

/// One row of the cash-flow table. Costs are positive, incentives negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearRow {
    pub year: u32,
    pub capital_usd: f64,
    pub om_usd: f64,
    #[serde(default)]
    pub fuel_usd: f64,
    pub replacement_usd: f64,
    pub incentive_usd: f64,
    pub output_kwh: f64,
    pub discount_factor: f64,
}

impl YearRow {
    fn empty(year: u32, discount_factor: f64) -> Self {
        Self {
            year,
            capital_usd: 0.0,
            om_usd: 0.0,
            fuel_usd: 0.0,
            replacement_usd: 0.0,
            incentive_usd: 0.0,
            output_kwh: 0.0,
            discount_factor,
        }
    }

    pub fn net_cost_usd(&self) -> f64 {
        self.capital_usd + self.om_usd + self.fuel_usd + self.replacement_usd + self.incentive_usd
    }
}

/// Per-kWh cost components and totals of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub value_usd_per_kwh: f64,
    pub capex_share: f64,
    pub om_share: f64,
    #[serde(default)]
    pub fuel_share: f64,
    pub financing_share: f64,
    pub incentive_offset: f64,
    pub replacement_share: f64,
    pub pv_costs_usd: f64,
    pub pv_output_kwh: f64,
    pub yearly: Vec<YearRow>,
}

/// Persisted breakdown of a computed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub technology: Technology,
    #[serde(flatten)]
    pub evaluation: Evaluation,
    pub discount_rate: f64,
    pub inflation_rate: f64,
    pub useful_life_years: u32,
    pub selected_facts: BTreeMap<String, SelectedFact>,
    pub defaults_used: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedCost {
    pub lcoe_usd_per_kwh: Option<f64>,
    pub lcos_usd_per_kwh: Option<f64>,
    pub confidence: f64,
    pub breakdown: Breakdown,
}

/// Resolve and evaluate one (scenario, entity) pair.
pub fn compute(
    scenario: &ScenarioSpec,
    entity: &Entity,
    facts: &[Fact],
    assumptions: &[Assumption],
) -> Result<ComputedCost, PipelineError> {
    let rates = Rates::from_assumptions(assumptions)?;
    let resolved = EngineInputs::resolve(scenario, entity, facts, rates)?;
    let evaluation = evaluate(&resolved.inputs).ok_or_else(|| PipelineError::InsufficientData {
        entity_id: entity.id,
        metric: "output".to_string(),
    })?;

    let value = evaluation.value_usd_per_kwh;
    let (lcoe, lcos) = match resolved.inputs.technology {
        Technology::Generation => (Some(value), None),
        Technology::Storage => (None, Some(value)),
    };
    Ok(ComputedCost {
        lcoe_usd_per_kwh: lcoe,
        lcos_usd_per_kwh: lcos,
        confidence: resolved.confidence,
        breakdown: Breakdown {
            technology: resolved.inputs.technology,
            evaluation,
            discount_rate: rates.discount_rate,
            inflation_rate: rates.inflation_rate,
            useful_life_years: resolved.inputs.useful_life_years,
            selected_facts: resolved.selected,
            defaults_used: resolved.defaults_used,
        },
    })
}

/// Level annuity payment for a loan of `principal` at `rate` over `years`.
pub fn annuity_payment(principal: f64, rate: f64, years: u32) -> f64 {
    if years == 0 {
        return principal;
    }
    if rate == 0.0 {
        return principal / years as f64;
    }
    principal * rate / (1.0 - (1.0 + rate).powi(-(years as i32)))
}

/// Years at which storage is replaced, strictly before end of life.
pub fn replacement_years(cycle_life: f64, cycles_per_year: f64, life: u32) -> Vec<u32> {
    if cycles_per_year <= 0.0 {
        return Vec::new();
    }
    let years_per_pack = cycle_life / cycles_per_year;
    if years_per_pack >= life as f64 {
        return Vec::new();
    }
    let interval = (years_per_pack.floor() as u32).max(1);
    (1..)
        .map(|k| k * interval)
        .take_while(|y| *y < life)
        .collect()
}

/// Build and discount the cash-flow table. Returns `None` when the
/// discounted output is not positive.
pub fn evaluate(inputs: &EngineInputs) -> Option<Evaluation> {
    let life = inputs.useful_life_years;
    let r = inputs.rates.discount_rate;
    let inflation = inputs.rates.inflation_rate;

    let capital = inputs.capex_per_unit * inputs.size;
    let incentives = (inputs.incentives.itc_fraction * capital
        + inputs.rebate_per_unit * inputs.size)
        .clamp(0.0, capital.max(0.0));

    let (upfront_incentive, amortized) = match inputs.incentives.policy {
        IncentivePolicy::Upfront => (incentives, None),
        IncentivePolicy::Amortized => {
            let years = inputs.incentives.amortize_years.min(life).max(1);
            (0.0, Some((years, incentives / years as f64)))
        }
    };

    let net_capital = capital - upfront_incentive;
    let fin = &inputs.financing;
    let down_payment = net_capital * fin.down_payment_fraction;
    let principal = net_capital - down_payment;
    let (loan_years, payment) = if principal > 0.0 && fin.loan_term_years > 0 {
        (
            fin.loan_term_years,
            annuity_payment(principal, fin.loan_rate, fin.loan_term_years),
        )
    } else {
        (0, 0.0)
    };

    let replacements = match inputs.technology {
        Technology::Storage => {
            replacement_years(inputs.cycle_life, inputs.cycles_per_year, life)
        }
        Technology::Generation => Vec::new(),
    };

    let horizon = life.max(loan_years);
    let mut yearly = Vec::with_capacity(horizon as usize + 1);
    let mut last_replacement = 0u32;

    let mut pv_capital = 0.0;
    let mut pv_om = 0.0;
    let mut pv_fuel = 0.0;
    let mut pv_replacement = 0.0;
    let mut pv_incentive = 0.0;
    let mut pv_output = 0.0;

    for t in 0..=horizon {
        let discount_factor = 1.0 / (1.0 + r).powi(t as i32);
        let mut row = YearRow::empty(t, discount_factor);

        if t == 0 {
            row.capital_usd = down_payment;
        } else {
            if t <= loan_years {
                row.capital_usd = payment;
            }
            if let Some((years, per_year)) = amortized {
                if t <= years {
                    row.incentive_usd = -per_year;
                }
            }
            if t <= life {
                let escalation = (1.0 + inflation).powi(t as i32 - 1);
                row.om_usd = inputs.om_per_unit_year * inputs.size * escalation;
                row.output_kwh = match inputs.technology {
                    Technology::Generation => generation_output(inputs, t),
                    Technology::Storage => {
                        let age = t - 1 - last_replacement;
                        storage_throughput(inputs, age)
                    }
                };
                if inputs.technology == Technology::Generation {
                    row.fuel_usd = inputs.fuel_cost_per_kwh * row.output_kwh * escalation;
                }
                if replacements.contains(&t) {
                    row.replacement_usd = REPLACEMENT_COST_FRACTION * capital;
                    last_replacement = t;
                }
            }
        }

        pv_capital += row.capital_usd * discount_factor;
        pv_om += row.om_usd * discount_factor;
        pv_fuel += row.fuel_usd * discount_factor;
        pv_replacement += row.replacement_usd * discount_factor;
        pv_incentive += -row.incentive_usd * discount_factor;
        pv_output += row.output_kwh * discount_factor;
        yearly.push(row);
    }

    if !(pv_output > 0.0) || !pv_output.is_finite() {
        return None;
    }

    let pv_costs = pv_capital + pv_om + pv_fuel + pv_replacement - pv_incentive;
    let capex_share = capital / pv_output;
    let financing_share = (pv_capital - net_capital) / pv_output;
    let incentive_offset = (upfront_incentive + pv_incentive) / pv_output;
    let om_share = pv_om / pv_output;
    let fuel_share = pv_fuel / pv_output;
    let replacement_share = pv_replacement / pv_output;

    Some(Evaluation {
        value_usd_per_kwh: pv_costs / pv_output,
        capex_share,
        om_share,
        fuel_share,
        financing_share,
        incentive_offset,
        replacement_share,
        pv_costs_usd: pv_costs,
        pv_output_kwh: pv_output,
        yearly,
    })
}

fn generation_output(inputs: &EngineInputs, t: u32) -> f64 {
    let retention = (1.0 - inputs.degradation_rate * (t - 1) as f64).max(0.0);
    inputs.size * inputs.capacity_factor * HOURS_PER_YEAR * retention
}

fn storage_throughput(inputs: &EngineInputs, age: u32) -> f64 {
    let retention = (1.0 - inputs.capacity_fade_rate * age as f64).max(MIN_CAPACITY_RETENTION);
    inputs.size
        * inputs.depth_of_discharge
        * inputs.cycles_per_year
        * inputs.round_trip_efficiency
        * retention
}
