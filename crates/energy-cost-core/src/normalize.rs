//! Unit normalization.
//!
//! Converts a raw `(value, unit)` pair into the canonical unit of a target
//! metric. A unit string is parsed into a numerator and zero or more
//! denominator quantities (separated by `/` or `per`); each token is looked
//! up in a fixed vocabulary that maps it to a dimension and a scale factor
//! relative to the canonical unit of that dimension. The resulting dimension
//! signature must match one accepted by the metric.
//!
//! Everything here is pure: no locale, clock, or configuration input.

use crate::error::PipelineError;

/// Physical dimension of a unit token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    Currency,
    Power,
    Energy,
    Time,
    Percent,
    Cycles,
}

use Dimension::*;

/// `(token, dimension, scale to canonical)`. Canonical units are USD, kW,
/// kWh, year, percent and cycles.
const VOCABULARY: &[(&str, Dimension, f64)] = &[
    ("$", Currency, 1.0),
    ("USD", Currency, 1.0),
    ("usd", Currency, 1.0),
    ("dollar", Currency, 1.0),
    ("dollars", Currency, 1.0),
    ("¢", Currency, 0.01),
    ("c", Currency, 0.01),
    ("cent", Currency, 0.01),
    ("cents", Currency, 0.01),
    ("k$", Currency, 1000.0),
    ("kUSD", Currency, 1000.0),
    ("W", Power, 0.001),
    ("Wp", Power, 0.001),
    ("kW", Power, 1.0),
    ("kWp", Power, 1.0),
    ("MW", Power, 1000.0),
    ("GW", Power, 1e6),
    ("Wh", Energy, 0.001),
    ("kWh", Energy, 1.0),
    ("MWh", Energy, 1000.0),
    ("GWh", Energy, 1e6),
    ("yr", Time, 1.0),
    ("year", Time, 1.0),
    ("years", Time, 1.0),
    ("y", Time, 1.0),
    ("a", Time, 1.0),
    ("annum", Time, 1.0),
    ("month", Time, 1.0 / 12.0),
    ("months", Time, 1.0 / 12.0),
    ("mo", Time, 1.0 / 12.0),
    ("%", Percent, 1.0),
    ("percent", Percent, 1.0),
    ("pct", Percent, 1.0),
    ("fraction", Percent, 100.0),
    ("ratio", Percent, 100.0),
    ("cycle", Cycles, 1.0),
    ("cycles", Cycles, 1.0),
];

/// Canonical metrics: `(name, canonical unit, accepted signatures)`.
/// A signature is `(numerator dimensions, denominator dimensions)`, each
/// sorted.
type Signature = (&'static [Dimension], &'static [Dimension]);

const METRICS: &[(&str, &str, &[Signature])] = &[
    ("capex_per_kw", "USD/kW", &[(&[Currency], &[Power])]),
    ("capex_per_kwh", "USD/kWh", &[(&[Currency], &[Energy])]),
    ("om_per_kw_year", "USD/kW/yr", &[(&[Currency], &[Power, Time])]),
    ("om_per_kwh_year", "USD/kWh/yr", &[(&[Currency], &[Energy, Time])]),
    ("fuel_cost_per_kwh", "USD/kWh", &[(&[Currency], &[Energy])]),
    (
        "degradation_rate",
        "%/yr",
        &[(&[Percent], &[Time]), (&[Percent], &[])],
    ),
    (
        "capacity_fade_rate",
        "%/yr",
        &[(&[Percent], &[Time]), (&[Percent], &[])],
    ),
    ("round_trip_efficiency", "%", &[(&[Percent], &[])]),
    ("depth_of_discharge", "%", &[(&[Percent], &[])]),
    ("capacity_factor", "%", &[(&[Percent], &[])]),
    ("useful_life_years", "yr", &[(&[Time], &[])]),
    ("warranty_years", "yr", &[(&[Time], &[])]),
    ("cycle_life", "cycles", &[(&[Cycles], &[]), (&[], &[])]),
    ("capacity_kwh", "kWh", &[(&[Energy], &[])]),
    ("power_kw", "kW", &[(&[Power], &[])]),
    ("price_usd", "USD", &[(&[Currency], &[])]),
    (
        "annual_rate",
        "%",
        &[(&[Percent], &[]), (&[Percent], &[Time])],
    ),
];

/// Extractor and operator vocabulary mapped onto canonical metric names.
const ALIASES: &[(&str, &str)] = &[
    ("efficiency_percent", "round_trip_efficiency"),
    ("efficiency", "round_trip_efficiency"),
    ("round_trip_efficiency_percent", "round_trip_efficiency"),
    ("capex_per_w", "capex_per_kw"),
    ("capex_per_watt", "capex_per_kw"),
    ("cost_per_kw", "capex_per_kw"),
    ("cost_per_kwh", "capex_per_kwh"),
    ("om_per_kw", "om_per_kw_year"),
    ("om_cost_per_kw_year", "om_per_kw_year"),
    ("opex_per_kw_year", "om_per_kw_year"),
    ("om_per_kwh", "om_per_kwh_year"),
    ("opex_per_kwh_year", "om_per_kwh_year"),
    ("fuel_cost", "fuel_cost_per_kwh"),
    ("fuel_cost_per_mwh", "fuel_cost_per_kwh"),
    ("degradation", "degradation_rate"),
    ("degradation_percent", "degradation_rate"),
    ("fade_rate", "capacity_fade_rate"),
    ("capacity_fade", "capacity_fade_rate"),
    ("dod", "depth_of_discharge"),
    ("dod_percent", "depth_of_discharge"),
    ("lifetime_years", "useful_life_years"),
    ("lifetime", "useful_life_years"),
    ("life_years", "useful_life_years"),
    ("warranty", "warranty_years"),
    ("cycles", "cycle_life"),
    ("capacity", "capacity_kwh"),
    ("power", "power_kw"),
    ("price", "price_usd"),
    ("discount_rate", "annual_rate"),
    ("inflation_rate", "annual_rate"),
];

/// Metrics whose presence implies a storage product.
const STORAGE_METRICS: &[&str] = &[
    "capex_per_kwh",
    "om_per_kwh_year",
    "round_trip_efficiency",
    "depth_of_discharge",
    "capacity_fade_rate",
    "cycle_life",
    "capacity_kwh",
];

/// Resolve a metric name or alias to its canonical name.
pub fn canonical_metric(name: &str) -> Option<&'static str> {
    let key = name.trim().to_ascii_lowercase();
    if let Some((canonical, _, _)) = METRICS.iter().find(|(m, _, _)| *m == key) {
        return Some(canonical);
    }
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
}

/// Canonical unit label for a canonical metric.
pub fn canonical_unit(metric: &str) -> Option<&'static str> {
    METRICS
        .iter()
        .find(|(m, _, _)| *m == metric)
        .map(|(_, unit, _)| *unit)
}

pub fn is_storage_metric(metric: &str) -> bool {
    STORAGE_METRICS.contains(&metric)
}

/// Convert `raw_value` expressed in `raw_unit` into the canonical unit of
/// `target_metric` (which may be an alias).
pub fn normalize(
    raw_value: f64,
    raw_unit: &str,
    target_metric: &str,
) -> Result<(f64, &'static str), PipelineError> {
    let unrecognized = || PipelineError::UnrecognizedUnit {
        unit: raw_unit.to_string(),
        metric: target_metric.to_string(),
    };

    let metric = canonical_metric(target_metric).ok_or_else(unrecognized)?;
    let (_, canonical, accepted) = METRICS
        .iter()
        .find(|(m, _, _)| *m == metric)
        .ok_or_else(unrecognized)?;

    let parsed = parse_unit(raw_unit).ok_or_else(unrecognized)?;
    let matches = accepted
        .iter()
        .any(|(num, den)| parsed.numerator == *num && parsed.denominator == *den);
    if !matches || !raw_value.is_finite() {
        return Err(unrecognized());
    }

    Ok((raw_value * parsed.scale, canonical))
}

#[derive(Debug, PartialEq)]
struct ParsedUnit {
    numerator: Vec<Dimension>,
    denominator: Vec<Dimension>,
    scale: f64,
}

fn parse_unit(raw: &str) -> Option<ParsedUnit> {
    let text = raw.trim();
    let mut parts = split_ratio(text).into_iter();

    let mut numerator = Vec::new();
    let mut scale = 1.0;
    if let Some(head) = parts.next() {
        for token in head.split_whitespace() {
            for (dim, s) in lookup(token)? {
                numerator.push(dim);
                scale *= s;
            }
        }
    }

    let mut denominator = Vec::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        for token in part.split_whitespace() {
            for (dim, s) in lookup(token)? {
                denominator.push(dim);
                scale /= s;
            }
        }
    }

    numerator.sort();
    denominator.sort();
    Some(ParsedUnit {
        numerator,
        denominator,
        scale,
    })
}

/// Split on `/` and on the word `per` (any case).
fn split_ratio(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for slash_part in text.split('/') {
        let mut current = Vec::new();
        for word in slash_part.split_whitespace() {
            if word.eq_ignore_ascii_case("per") {
                out.push(current.join(" "));
                current.clear();
            } else {
                current.push(word);
            }
        }
        out.push(current.join(" "));
    }
    out
}

fn lookup_single(token: &str) -> Option<(Dimension, f64)> {
    VOCABULARY
        .iter()
        .find(|(t, _, _)| *t == token)
        .or_else(|| VOCABULARY.iter().find(|(t, _, _)| t.eq_ignore_ascii_case(token)))
        .map(|(_, dim, scale)| (*dim, *scale))
}

/// Look up a token, expanding power/energy × time composites such as
/// `kW-yr`, `kW·yr` and `kWyr`.
fn lookup(token: &str) -> Option<Vec<(Dimension, f64)>> {
    if let Some(single) = lookup_single(token) {
        return Some(vec![single]);
    }

    for sep in ['-', '·', '*'] {
        if let Some((left, right)) = token.split_once(sep) {
            return composite(left, right);
        }
    }

    token
        .char_indices()
        .skip(1)
        .find_map(|(i, _)| composite(&token[..i], &token[i..]))
}

fn composite(left: &str, right: &str) -> Option<Vec<(Dimension, f64)>> {
    let l = lookup_single(left)?;
    let r = lookup_single(right)?;
    if matches!(l.0, Power | Energy) && r.0 == Time {
        Some(vec![l, r])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn per_watt_capex_scales_to_per_kw() {
        let (v, u) = normalize(0.85, "$/W", "capex_per_kw").unwrap();
        assert!(approx(v, 850.0));
        assert_eq!(u, "USD/kW");

        let (v, _) = normalize(1.2, "USD/Wp", "capex_per_w").unwrap();
        assert!(approx(v, 1200.0));
    }

    #[test]
    fn energy_scales() {
        assert!(approx(normalize(13.5, "kWh", "capacity_kwh").unwrap().0, 13.5));
        assert!(approx(normalize(13500.0, "Wh", "capacity_kwh").unwrap().0, 13.5));
        assert!(approx(normalize(2.0, "MWh", "capacity_kwh").unwrap().0, 2000.0));
        assert!(approx(normalize(1.0, "GWh", "capacity_kwh").unwrap().0, 1e6));
        assert!(approx(normalize(300.0, "$/MWh", "capex_per_kwh").unwrap().0, 0.3));
        assert!(approx(normalize(30.0, "$/MWh", "fuel_cost_per_mwh").unwrap().0, 0.03));
    }

    #[test]
    fn power_scales() {
        assert!(approx(normalize(5000.0, "W", "power_kw").unwrap().0, 5.0));
        assert!(approx(normalize(2.0, "MW", "power_kw").unwrap().0, 2000.0));
        assert!(approx(normalize(1.0, "GW", "power_kw").unwrap().0, 1e6));
        assert!(approx(normalize(7.0, "kWp", "power_kw").unwrap().0, 7.0));
    }

    #[test]
    fn currency_scales() {
        assert!(approx(normalize(250.0, "cents", "price_usd").unwrap().0, 2.5));
        assert!(approx(normalize(10.0, "¢", "price_usd").unwrap().0, 0.1));
        assert!(approx(normalize(3.0, "k$", "price_usd").unwrap().0, 3000.0));
        assert!(approx(normalize(4.0, "dollars", "price_usd").unwrap().0, 4.0));
    }

    #[test]
    fn composite_om_units() {
        for unit in ["$/kW-yr", "$/kWyr", "$/kW·yr", "$/kW-year", "$/kW/yr", "USD per kW per year"] {
            let (v, u) = normalize(20.0, unit, "om_per_kw_year")
                .unwrap_or_else(|e| panic!("{unit}: {e}"));
            assert!(approx(v, 20.0), "{unit}");
            assert_eq!(u, "USD/kW/yr");
        }
        let (v, _) = normalize(1.0, "$/kW/month", "om_per_kw_year").unwrap();
        assert!(approx(v, 12.0));
        let (v, _) = normalize(5.0, "$/kWh-yr", "om_per_kwh_year").unwrap();
        assert!(approx(v, 5.0));
    }

    #[test]
    fn percent_forms() {
        assert!(approx(normalize(0.9, "fraction", "round_trip_efficiency").unwrap().0, 90.0));
        assert!(approx(normalize(90.0, "%", "efficiency_percent").unwrap().0, 90.0));
        assert!(approx(normalize(0.5, "%/yr", "degradation_rate").unwrap().0, 0.5));
        assert!(approx(normalize(0.5, "%", "degradation_rate").unwrap().0, 0.5));
        assert!(approx(normalize(6.0, "pct", "discount_rate").unwrap().0, 6.0));
    }

    #[test]
    fn time_and_cycles() {
        assert!(approx(normalize(25.0, "years", "lifetime_years").unwrap().0, 25.0));
        assert!(approx(normalize(120.0, "months", "warranty_years").unwrap().0, 10.0));
        assert!(approx(normalize(6000.0, "cycles", "cycle_life").unwrap().0, 6000.0));
        assert!(approx(normalize(6000.0, "", "cycle_life").unwrap().0, 6000.0));
    }

    #[test]
    fn case_insensitive_fallback() {
        assert!(approx(normalize(13.5, "KWH", "capacity_kwh").unwrap().0, 13.5));
        assert!(approx(normalize(13.5, "kwh", "capacity_kwh").unwrap().0, 13.5));
    }

    #[test]
    fn every_vocabulary_token_parses() {
        for (token, _, _) in VOCABULARY {
            assert!(parse_unit(token).is_some(), "{token}");
        }
    }

    #[test]
    fn unknown_or_mismatched_units_fail() {
        let err = normalize(1.0, "furlongs", "capex_per_kw").unwrap_err();
        assert_eq!(err.kind(), "unrecognized_unit");
        assert!(normalize(1.0, "kWh", "power_kw").is_err());
        assert!(normalize(1.0, "$/kWh", "capex_per_kw").is_err());
        assert!(normalize(1.0, "$/", "capex_per_kw").is_err());
        assert!(normalize(1.0, "kW", "not_a_metric").is_err());
        assert!(normalize(f64::NAN, "kW", "power_kw").is_err());
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(canonical_metric("efficiency_percent"), Some("round_trip_efficiency"));
        assert_eq!(canonical_metric("capex_per_w"), Some("capex_per_kw"));
        assert_eq!(canonical_metric("Capex_Per_KW"), Some("capex_per_kw"));
        assert_eq!(canonical_metric("lifetime_years"), Some("useful_life_years"));
        assert_eq!(canonical_metric("bogus"), None);
        assert!(is_storage_metric("cycle_life"));
        assert!(!is_storage_metric("capex_per_kw"));
    }
}
