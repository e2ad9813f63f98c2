//! Scenario presets by use case and US region, plus manufacturer product
//! presets that bundle a scenario with catalog facts for one product.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::models::{
    EntityType, FinancingTerms, IncentivePolicy, IncentiveTerms, LoadProfile, NewEntity,
    ScenarioSpec, UseCase,
};

/// Federal investment tax credit applied in every preset region.
pub const FEDERAL_ITC: f64 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegionProfile {
    pub code: &'static str,
    /// Multiplier on the use-case capacity factor.
    pub irradiance_factor: f64,
    /// Relative installed-cost level; informational only, costs come from facts.
    pub cost_multiplier: f64,
    pub state_rebate_per_kw: f64,
}

pub const REGIONS: &[RegionProfile] = &[
    RegionProfile {
        code: "CA",
        irradiance_factor: 1.1,
        cost_multiplier: 1.2,
        state_rebate_per_kw: 1000.0,
    },
    RegionProfile {
        code: "TX",
        irradiance_factor: 1.05,
        cost_multiplier: 0.9,
        state_rebate_per_kw: 0.0,
    },
    RegionProfile {
        code: "FL",
        irradiance_factor: 1.0,
        cost_multiplier: 1.0,
        state_rebate_per_kw: 0.0,
    },
    RegionProfile {
        code: "NY",
        irradiance_factor: 0.85,
        cost_multiplier: 1.3,
        state_rebate_per_kw: 1500.0,
    },
    RegionProfile {
        code: "AZ",
        irradiance_factor: 1.2,
        cost_multiplier: 0.95,
        state_rebate_per_kw: 0.0,
    },
];

/// Used for region codes outside the table.
const NEUTRAL_REGION: RegionProfile = RegionProfile {
    code: "US",
    irradiance_factor: 1.0,
    cost_multiplier: 1.0,
    state_rebate_per_kw: 0.0,
};

pub fn region(code: &str) -> RegionProfile {
    REGIONS
        .iter()
        .find(|r| r.code.eq_ignore_ascii_case(code.trim()))
        .copied()
        .unwrap_or(NEUTRAL_REGION)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UseCaseProfile {
    pub system_size_kw: f64,
    pub capacity_factor: f64,
    pub annual_energy_kwh: f64,
    /// Suggested `discount_rate` assumption (fraction).
    pub discount_rate: f64,
    pub debt_fraction: f64,
    pub loan_rate: f64,
    pub loan_term_years: u32,
    pub storage_kwh: f64,
    pub cycles_per_year: f64,
}

pub fn use_case_profile(use_case: UseCase) -> UseCaseProfile {
    match use_case {
        UseCase::Residential => UseCaseProfile {
            system_size_kw: 7.0,
            capacity_factor: 0.19,
            annual_energy_kwh: 10_000.0,
            discount_rate: 0.06,
            debt_fraction: 0.8,
            loan_rate: 0.04,
            loan_term_years: 20,
            storage_kwh: 13.5,
            cycles_per_year: 365.0,
        },
        UseCase::Commercial => UseCaseProfile {
            system_size_kw: 100.0,
            capacity_factor: 0.22,
            annual_energy_kwh: 150_000.0,
            discount_rate: 0.08,
            debt_fraction: 0.7,
            loan_rate: 0.05,
            loan_term_years: 15,
            storage_kwh: 100.0,
            cycles_per_year: 300.0,
        },
        UseCase::Utility => UseCaseProfile {
            system_size_kw: 50_000.0,
            capacity_factor: 0.25,
            annual_energy_kwh: 100_000_000.0,
            discount_rate: 0.07,
            debt_fraction: 0.6,
            loan_rate: 0.04,
            loan_term_years: 20,
            storage_kwh: 1000.0,
            cycles_per_year: 250.0,
        },
    }
}

/// Build a ready-to-store scenario for `use_case` in `region_code`.
pub fn preset(use_case: UseCase, region_code: &str) -> ScenarioSpec {
    let profile = use_case_profile(use_case);
    let region = region(region_code);
    let code = if region == NEUTRAL_REGION {
        region_code.trim().to_ascii_uppercase()
    } else {
        region.code.to_string()
    };

    ScenarioSpec {
        name: format!("{} {}", use_case.as_str(), code),
        use_case,
        region: code,
        load_profile: LoadProfile {
            system_size_kw: profile.system_size_kw,
            capacity_factor: (profile.capacity_factor * region.irradiance_factor).min(1.0),
            storage_kwh: profile.storage_kwh,
            cycles_per_year: profile.cycles_per_year,
            annual_energy_kwh: Some(profile.annual_energy_kwh),
        },
        financing: FinancingTerms {
            loan_rate: profile.loan_rate,
            loan_term_years: profile.loan_term_years,
            down_payment_fraction: 1.0 - profile.debt_fraction,
        },
        incentives: IncentiveTerms {
            itc_fraction: FEDERAL_ITC,
            rebate_per_kw: region.state_rebate_per_kw,
            rebate_per_kwh: 0.0,
            policy: IncentivePolicy::Upfront,
            amortize_years: 0,
        },
        technologies: Vec::new(),
    }
}

// ============ Product presets ============

/// Extraction method recorded on facts seeded from the product tables.
pub const CATALOG_METHOD: &str = "catalog";

/// Quality score given to seeded product facts.
pub const CATALOG_QUALITY: f64 = 0.95;

pub const PRODUCT_MANUFACTURER: &str = "Tesla";

const HOURS_PER_YEAR: f64 = 8760.0;

/// Highest roof complexity multiplier on solar roof capex.
pub const MAX_ROOF_COMPLEXITY: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    Powerwall3,
    Powerwall2,
    Megapack,
    SolarPanels,
    SolarRoof,
}

impl Product {
    pub const ALL: [Product; 5] = [
        Product::Powerwall3,
        Product::Powerwall2,
        Product::Megapack,
        Product::SolarPanels,
        Product::SolarRoof,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Powerwall3 => "powerwall_3",
            Self::Powerwall2 => "powerwall_2",
            Self::Megapack => "megapack",
            Self::SolarPanels => "solar_panels",
            Self::SolarRoof => "solar_roof",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Powerwall3 => "Powerwall 3",
            Self::Powerwall2 => "Powerwall 2",
            Self::Megapack => "Megapack",
            Self::SolarPanels => "Solar Panels",
            Self::SolarRoof => "Solar Roof",
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Powerwall3 | Self::Powerwall2 | Self::Megapack => EntityType::Battery,
            Self::SolarPanels | Self::SolarRoof => EntityType::Pv,
        }
    }

    /// Use case assumed when the caller does not pick one.
    pub fn default_use_case(&self) -> UseCase {
        match self {
            Self::Megapack => UseCase::Utility,
            _ => UseCase::Residential,
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Product {
    type Err = PipelineError;

    /// Accepts `powerwall_3`, `powerwall-3`, `Powerwall 3` and the like.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Product::ALL
            .into_iter()
            .find(|p| p.as_str().replace('_', "") == key)
            .ok_or_else(|| PipelineError::invalid(format!("unknown product: '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BatterySpec {
    capex_per_kwh: f64,
    power_kw: f64,
    capacity_kwh: f64,
    round_trip_efficiency_percent: f64,
    cycle_life: f64,
    calendar_life_years: f64,
    capacity_fade_percent: f64,
    om_per_kwh_year: f64,
    depth_of_discharge_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SolarSpec {
    capex_per_kw: f64,
    om_per_kw_year: f64,
    degradation_percent: f64,
    warranty_years: f64,
    default_size_kw: f64,
}

const POWERWALL_3: BatterySpec = BatterySpec {
    capex_per_kwh: 800.0,
    power_kw: 11.5,
    capacity_kwh: 13.5,
    round_trip_efficiency_percent: 97.5,
    cycle_life: 4000.0,
    calendar_life_years: 10.0,
    capacity_fade_percent: 2.0,
    om_per_kwh_year: 3.0,
    depth_of_discharge_percent: 100.0,
};

const POWERWALL_2: BatterySpec = BatterySpec {
    capex_per_kwh: 700.0,
    power_kw: 5.0,
    capacity_kwh: 13.5,
    round_trip_efficiency_percent: 90.0,
    cycle_life: 3650.0,
    calendar_life_years: 10.0,
    capacity_fade_percent: 2.5,
    om_per_kwh_year: 4.0,
    depth_of_discharge_percent: 100.0,
};

const MEGAPACK: BatterySpec = BatterySpec {
    capex_per_kwh: 300.0,
    power_kw: 1900.0,
    capacity_kwh: 3900.0,
    round_trip_efficiency_percent: 92.0,
    cycle_life: 4000.0,
    calendar_life_years: 20.0,
    capacity_fade_percent: 1.5,
    om_per_kwh_year: 2.0,
    depth_of_discharge_percent: 100.0,
};

const SOLAR_PANELS: SolarSpec = SolarSpec {
    capex_per_kw: 2500.0,
    om_per_kw_year: 12.0,
    degradation_percent: 0.4,
    warranty_years: 25.0,
    default_size_kw: 7.0,
};

const SOLAR_ROOF: SolarSpec = SolarSpec {
    capex_per_kw: 4000.0,
    om_per_kw_year: 8.0,
    degradation_percent: 0.4,
    warranty_years: 25.0,
    default_size_kw: 10.0,
};

/// Batteries in product presets cycle once a day.
const PRODUCT_CYCLES_PER_YEAR: f64 = 365.0;

/// Base capacity factor of a solar product before the regional irradiance
/// adjustment.
fn solar_capacity_factor(product: Product, use_case: UseCase) -> f64 {
    match (product, use_case) {
        (Product::SolarRoof, _) => 0.18,
        (_, UseCase::Residential) => 0.19,
        (_, UseCase::Commercial) => 0.22,
        (_, UseCase::Utility) => 0.25,
    }
}

/// Caller choices for a product preset. Everything is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProductOptions {
    #[serde(default)]
    pub use_case: Option<UseCase>,
    /// Number of units for batteries, system size in kW for solar.
    #[serde(default)]
    pub quantity: Option<f64>,
    /// Capex multiplier for solar roof, `1.0..=MAX_ROOF_COMPLEXITY`.
    #[serde(default)]
    pub roof_complexity: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
}

/// One fact seeded from a product table, in canonical units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogFact {
    pub metric: &'static str,
    pub value: f64,
    pub unit: &'static str,
}

impl CatalogFact {
    fn new(metric: &'static str, value: f64, unit: &'static str) -> Self {
        Self {
            metric,
            value,
            unit,
        }
    }
}

/// A product entity, its catalog facts and a scenario sized for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductPreset {
    pub product: Product,
    pub entity: NewEntity,
    pub facts: Vec<CatalogFact>,
    pub scenario: ScenarioSpec,
}

/// Build the preset for `product` in `region_code`.
///
/// Facts carry national list prices; the region only moves the scenario
/// (irradiance, rebates). Fails with `InvalidRequest` on a non-positive
/// quantity or a roof complexity outside `1.0..=MAX_ROOF_COMPLEXITY`.
pub fn product_preset(
    product: Product,
    region_code: &str,
    options: &ProductOptions,
) -> Result<ProductPreset, PipelineError> {
    if let Some(q) = options.quantity {
        if !q.is_finite() || q <= 0.0 {
            return Err(PipelineError::invalid("quantity must be positive"));
        }
    }
    let complexity = options.roof_complexity.unwrap_or(1.0);
    if !(1.0..=MAX_ROOF_COMPLEXITY).contains(&complexity) {
        return Err(PipelineError::invalid(format!(
            "roof_complexity must be between 1.0 and {}",
            MAX_ROOF_COMPLEXITY
        )));
    }
    if options.roof_complexity.is_some() && product != Product::SolarRoof {
        return Err(PipelineError::invalid(format!(
            "roof_complexity only applies to {}",
            Product::SolarRoof
        )));
    }

    let use_case = options.use_case.unwrap_or(product.default_use_case());
    let mut scenario = preset(use_case, region_code);
    let irradiance = region(region_code).irradiance_factor;

    let facts = match product {
        Product::Powerwall3 | Product::Powerwall2 | Product::Megapack => {
            let spec = match product {
                Product::Powerwall3 => POWERWALL_3,
                Product::Powerwall2 => POWERWALL_2,
                _ => MEGAPACK,
            };
            let units = options.quantity.unwrap_or(1.0);
            scenario.load_profile.storage_kwh = spec.capacity_kwh * units;
            scenario.load_profile.cycles_per_year = PRODUCT_CYCLES_PER_YEAR;
            scenario.load_profile.annual_energy_kwh =
                Some(spec.capacity_kwh * units * PRODUCT_CYCLES_PER_YEAR);
            vec![
                CatalogFact::new("capex_per_kwh", spec.capex_per_kwh, "USD/kWh"),
                CatalogFact::new("om_per_kwh_year", spec.om_per_kwh_year, "USD/kWh/yr"),
                CatalogFact::new("round_trip_efficiency", spec.round_trip_efficiency_percent, "%"),
                CatalogFact::new("depth_of_discharge", spec.depth_of_discharge_percent, "%"),
                CatalogFact::new("cycle_life", spec.cycle_life, "cycles"),
                CatalogFact::new("capacity_fade_rate", spec.capacity_fade_percent, "%/yr"),
                CatalogFact::new("useful_life_years", spec.calendar_life_years, "yr"),
                CatalogFact::new("warranty_years", spec.calendar_life_years, "yr"),
                CatalogFact::new("capacity_kwh", spec.capacity_kwh, "kWh"),
                CatalogFact::new("power_kw", spec.power_kw, "kW"),
            ]
        }
        Product::SolarPanels | Product::SolarRoof => {
            let spec = if product == Product::SolarRoof {
                SOLAR_ROOF
            } else {
                SOLAR_PANELS
            };
            let size_kw = options.quantity.unwrap_or(spec.default_size_kw);
            let capacity_factor = (solar_capacity_factor(product, use_case) * irradiance).min(1.0);
            scenario.load_profile.system_size_kw = size_kw;
            scenario.load_profile.capacity_factor = capacity_factor;
            scenario.load_profile.annual_energy_kwh =
                Some(size_kw * capacity_factor * HOURS_PER_YEAR);
            vec![
                CatalogFact::new("capex_per_kw", spec.capex_per_kw * complexity, "USD/kW"),
                CatalogFact::new("om_per_kw_year", spec.om_per_kw_year, "USD/kW/yr"),
                CatalogFact::new("degradation_rate", spec.degradation_percent, "%/yr"),
                CatalogFact::new("useful_life_years", spec.warranty_years, "yr"),
                CatalogFact::new("warranty_years", spec.warranty_years, "yr"),
            ]
        }
    };

    scenario.name = match &options.name {
        Some(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => format!(
            "{} {} {}",
            PRODUCT_MANUFACTURER,
            product.display_name(),
            scenario.region
        ),
    };
    scenario.technologies = vec![product.entity_type()];

    Ok(ProductPreset {
        product,
        entity: NewEntity {
            name: product.display_name().to_string(),
            entity_type: product.entity_type(),
            manufacturer: Some(PRODUCT_MANUFACTURER.to_string()),
            model: Some(product.as_str().to_string()),
            version: None,
        },
        facts,
        scenario,
    })
}
