//! Core data models used throughout the energy cost pipeline.
//!
//! These types describe the catalog (entities, assumptions, scenarios),
//! the extraction output (candidate facts and facts), and the bookkeeping
//! rows of the job queue and the admin audit log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Kind of catalogued product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Pv,
    Battery,
    Inverter,
    Thermal,
    Wind,
    Hydro,
    Policy,
    Tariff,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        EntityType::Pv,
        EntityType::Battery,
        EntityType::Inverter,
        EntityType::Thermal,
        EntityType::Wind,
        EntityType::Hydro,
        EntityType::Policy,
        EntityType::Tariff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pv => "pv",
            Self::Battery => "battery",
            Self::Inverter => "inverter",
            Self::Thermal => "thermal",
            Self::Wind => "wind",
            Self::Hydro => "hydro",
            Self::Policy => "policy",
            Self::Tariff => "tariff",
        }
    }

    /// Technologies that produce energy and get an LCOE.
    pub fn is_generation(&self) -> bool {
        matches!(self, Self::Pv | Self::Thermal | Self::Wind | Self::Hydro)
    }

    /// Technologies that cycle energy and get an LCOS.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Battery)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| PipelineError::invalid(format!("unknown entity type: '{}'", s)))
    }
}

/// A catalogued product, unique on (name, manufacturer, model, version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub version: Option<String>,
}

/// Input for registering an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Raw extractor output: one candidate (entity, metric, value, unit) triple.
///
/// This is the fixed structural contract between the pipeline and any
/// extractor implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFact {
    pub entity_hint: Option<String>,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub confidence: f64,
    pub span: String,
}

/// A normalized, scored observation about an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub entity_id: i64,
    pub document_id: Option<i64>,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub span_excerpt: String,
    pub quality_score: f64,
    pub extracted_at: DateTime<Utc>,
    pub extraction_method: String,
}

/// Named global economic parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assumption {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub document_id: Option<i64>,
}

/// Market price observation for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: i64,
    pub entity_id: i64,
    pub value: f64,
    pub currency: String,
    pub basis: String,
    pub region: Option<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub document_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseCase {
    Residential,
    Commercial,
    Utility,
}

impl UseCase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Residential => "residential",
            Self::Commercial => "commercial",
            Self::Utility => "utility",
        }
    }
}

impl FromStr for UseCase {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "residential" => Ok(Self::Residential),
            "commercial" => Ok(Self::Commercial),
            "utility" => Ok(Self::Utility),
            other => Err(PipelineError::invalid(format!("unknown use case: '{}'", other))),
        }
    }
}

/// Sizing and utilisation of the modelled system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProfile {
    /// Generation nameplate size in kW.
    pub system_size_kw: f64,
    /// Fallback capacity factor (fraction) when no fact provides one.
    pub capacity_factor: f64,
    /// Storage nameplate energy in kWh.
    pub storage_kwh: f64,
    pub cycles_per_year: f64,
    #[serde(default)]
    pub annual_energy_kwh: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancingTerms {
    /// Annual loan interest rate (fraction).
    pub loan_rate: f64,
    pub loan_term_years: u32,
    /// Share of net capital paid upfront (fraction).
    pub down_payment_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncentivePolicy {
    /// Subtract incentives from the year-0 outlay.
    Upfront,
    /// Spread incentives evenly over `amortize_years`.
    Amortized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncentiveTerms {
    /// Investment tax credit as a fraction of capital cost.
    pub itc_fraction: f64,
    #[serde(default)]
    pub rebate_per_kw: f64,
    #[serde(default)]
    pub rebate_per_kwh: f64,
    pub policy: IncentivePolicy,
    #[serde(default)]
    pub amortize_years: u32,
}

/// Immutable analysis context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: i64,
    #[serde(flatten)]
    pub spec: ScenarioSpec,
    pub created_at: DateTime<Utc>,
}

/// Everything a caller supplies to create a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    pub use_case: UseCase,
    pub region: String,
    pub load_profile: LoadProfile,
    pub financing: FinancingTerms,
    pub incentives: IncentiveTerms,
    /// Entity types the scenario covers. Empty means every generation and
    /// storage type.
    #[serde(default)]
    pub technologies: Vec<EntityType>,
}

impl ScenarioSpec {
    /// Reject parameter sets the engine cannot model.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::invalid("scenario name must not be empty"));
        }
        let lp = &self.load_profile;
        if !(lp.system_size_kw >= 0.0 && lp.storage_kwh >= 0.0) {
            return Err(PipelineError::invalid("system sizes must be >= 0"));
        }
        if !(0.0..=1.0).contains(&lp.capacity_factor) {
            return Err(PipelineError::invalid("capacity_factor must be in [0, 1]"));
        }
        if !(lp.cycles_per_year >= 0.0) {
            return Err(PipelineError::invalid("cycles_per_year must be >= 0"));
        }
        let fin = &self.financing;
        if !(0.0..=1.0).contains(&fin.down_payment_fraction) {
            return Err(PipelineError::invalid(
                "down_payment_fraction must be in [0, 1]",
            ));
        }
        if !(fin.loan_rate > -1.0) {
            return Err(PipelineError::invalid("loan_rate must be > -1"));
        }
        if fin.loan_term_years > crate::lcoe::MAX_HORIZON_YEARS {
            return Err(PipelineError::invalid(format!(
                "loan_term_years must be <= {}",
                crate::lcoe::MAX_HORIZON_YEARS
            )));
        }
        if fin.down_payment_fraction < 1.0 && fin.loan_term_years == 0 {
            return Err(PipelineError::invalid(
                "loan_term_years must be > 0 when part of the capital is financed",
            ));
        }
        let inc = &self.incentives;
        if !(0.0..=1.0).contains(&inc.itc_fraction) {
            return Err(PipelineError::invalid("itc_fraction must be in [0, 1]"));
        }
        if inc.policy == IncentivePolicy::Amortized && inc.amortize_years == 0 {
            return Err(PipelineError::invalid(
                "amortize_years must be > 0 for the amortized incentive policy",
            ));
        }
        Ok(())
    }

    /// Whether entities of `entity_type` are in scope for this scenario.
    pub fn covers(&self, entity_type: EntityType) -> bool {
        if self.technologies.is_empty() {
            entity_type.is_generation() || entity_type.is_storage()
        } else {
            self.technologies.contains(&entity_type)
        }
    }
}

/// Append-only record of one administrative action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub result: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Pipeline DAG stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SeedSearch,
    Fetch,
    Extract,
    Normalize,
    Compute,
    Rank,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::SeedSearch,
        Stage::Fetch,
        Stage::Extract,
        Stage::Normalize,
        Stage::Compute,
        Stage::Rank,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SeedSearch => "seed_search",
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Normalize => "normalize",
            Self::Compute => "compute",
            Self::Rank => "rank",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| PipelineError::invalid(format!("unknown stage: '{}'", s)))
    }
}

/// Lifecycle of one queued stage instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Running,
        JobState::Succeeded,
        JobState::FailedRetryable,
        JobState::FailedTerminal,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
            Self::Cancelled => "cancelled",
        }
    }

    /// States from which an enqueue may revive the row.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedTerminal | Self::Cancelled
        )
    }
}

impl FromStr for JobState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| PipelineError::invalid(format!("unknown job state: '{}'", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips_through_str() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert_eq!("PV".parse::<EntityType>().unwrap(), EntityType::Pv);
        assert!("geothermal".parse::<EntityType>().is_err());
    }

    #[test]
    fn empty_technologies_cover_generation_and_storage() {
        let spec = crate::scenarios::preset(UseCase::Residential, "CA");
        assert!(spec.covers(EntityType::Pv));
        assert!(spec.covers(EntityType::Battery));
        assert!(!spec.covers(EntityType::Inverter));
        assert!(!spec.covers(EntityType::Tariff));
    }

    #[test]
    fn validate_rejects_amortized_without_years() {
        let mut spec = crate::scenarios::preset(UseCase::Commercial, "TX");
        spec.incentives.policy = IncentivePolicy::Amortized;
        spec.incentives.amortize_years = 0;
        assert!(spec.validate().is_err());
        spec.incentives.amortize_years = 5;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unbounded_loan_term() {
        let mut spec = crate::scenarios::preset(UseCase::Residential, "CA");
        spec.financing.loan_term_years = 5_000_000;
        assert!(spec.validate().is_err());
        spec.financing.loan_term_years = 25;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn scenario_serializes_flat() {
        let scenario = Scenario {
            id: 3,
            spec: crate::scenarios::preset(UseCase::Utility, "AZ"),
            created_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&scenario).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["use_case"], "utility");
        assert_eq!(json["region"], "AZ");
    }
}
