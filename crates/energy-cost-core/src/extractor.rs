//! Extractor contract and the built-in rule-based extractor.
//!
//! An [`Extractor`] turns document text into raw [`CandidateFact`]s. It is
//! purely functional: no I/O, no clock, no shared state. Units and metric
//! names are returned as written; the normalize stage canonicalizes them.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::CandidateFact;

/// Characters of context kept on each side of a match.
const SPAN_RADIUS: usize = 50;

/// Text handed to an extractor.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentText<'a> {
    pub title: Option<&'a str>,
    pub body: &'a str,
}

/// Pluggable fact extractor.
pub trait Extractor: Send + Sync {
    /// Recorded as `extraction_method` on every fact derived from this
    /// extractor's output.
    fn method(&self) -> &str;

    fn extract(&self, doc: &DocumentText<'_>) -> Vec<CandidateFact>;
}

struct Rule {
    metric: &'static str,
    regex: Regex,
    unit: &'static str,
    confidence: f64,
    /// Product named by the pattern itself.
    product: Option<&'static str>,
}

impl Rule {
    fn new(metric: &'static str, pattern: &str, unit: &'static str, confidence: f64) -> Self {
        Self {
            metric,
            regex: Regex::new(&format!("(?i){pattern}")).expect("valid extraction pattern"),
            unit,
            confidence,
            product: None,
        }
    }

    fn for_product(mut self, product: &'static str) -> Self {
        self.product = Some(product);
        self
    }
}

// A rule whose `reject` group matches is discarded; the regex crate has no
// lookahead, so trailing context that changes the meaning is captured instead.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    const NUM: &str = r"(\d[\d,]*(?:\.\d+)?)";
    let p = |s: &str| s.replace("{n}", NUM);
    vec![
        // capacity
        Rule::new("capacity_kwh", &p(r"{n}\s*kWh\s*(?:usable\s*)?capacity"), "kWh", 0.9),
        Rule::new("capacity_kwh", &p(r"capacity[:\s]*{n}\s*kWh\b"), "kWh", 0.8),
        Rule::new(
            "capacity_kwh",
            &p(r"{n}\s*kilowatt.?hours?\s*(?:of\s*)?(?:usable\s*)?(?:capacity|storage)"),
            "kWh",
            0.85,
        ),
        // power
        Rule::new("power_kw", &p(r"{n}\s*kW\s*(?:continuous\s*)?power"), "kW", 0.9),
        Rule::new("power_kw", &p(r"power\s*(?:rating|output)[:\s]*{n}\s*kW\b"), "kW", 0.85),
        Rule::new("power_kw", &p(r"{n}\s*kilowatts?\s*(?:of\s*)?(?:power|output)"), "kW", 0.8),
        // efficiency
        Rule::new(
            "efficiency_percent",
            &p(r"{n}\s*%\s*(?:round.?trip\s*)?efficiency"),
            "%",
            0.9,
        ),
        Rule::new("efficiency_percent", &p(r"efficiency[:\s]*{n}\s*%"), "%", 0.85),
        Rule::new("efficiency_percent", &p(r"{n}\s*percent\s*efficient"), "%", 0.8),
        // warranty
        Rule::new("warranty_years", r"(\d+).?year\s*(?:product\s*)?warranty", "years", 0.9),
        Rule::new("warranty_years", r"warranty[:\s]*(\d+)\s*years?", "years", 0.85),
        Rule::new("warranty_years", r"guaranteed\s*for\s*(\d+)\s*years?", "years", 0.8),
        // cycle life
        Rule::new(
            "cycle_life",
            r"(\d[\d,]*)\s*(?:charge\s*)?cycles?\b(?P<reject>\s*(?:per|/|a|each)\s*(?:year|yr))?",
            "cycles",
            0.85,
        ),
        Rule::new("cycle_life", r"cycle\s*life[:\s]*(?:of\s*)?(\d[\d,]*)", "cycles", 0.9),
        // price
        Rule::new("price_usd", &p(r"\${n}(?P<reject>\s*(?:/|per\b))?"), "USD", 0.7),
        Rule::new("price_usd", &p(r"price[:\s]*\${n}(?P<reject>\s*(?:/|per\b))?"), "USD", 0.8),
        Rule::new("price_usd", &p(r"{n}\s*USD\b(?P<reject>\s*(?:/|per\b))?"), "USD", 0.75),
        // capital cost
        Rule::new(
            "capex_per_w",
            &p(r"\$\s*{n}\s*(?:/|per)\s*(?:Wp?|watts?)\b"),
            "$/W",
            0.8,
        ),
        Rule::new(
            "capex_per_kw",
            &p(r"\$\s*{n}\s*(?:/|per)\s*kWp?\b(?P<reject>\s*(?:[-·/]|per)\s*(?:yr|year|month))?"),
            "$/kW",
            0.85,
        ),
        Rule::new(
            "capex_per_kwh",
            &p(r"\$\s*{n}\s*(?:/|per)\s*kWh\b(?P<reject>\s*(?:[-·/]|per)\s*(?:yr|year|month))?"),
            "$/kWh",
            0.85,
        ),
        // O&M
        Rule::new(
            "om_per_kw_year",
            &p(r"\$\s*{n}\s*(?:/|per)\s*kW\s*(?:[-·/]|per)\s*(?:yr|year)\b"),
            "$/kW/yr",
            0.8,
        ),
        Rule::new(
            "om_per_kwh_year",
            &p(r"\$\s*{n}\s*(?:/|per)\s*kWh\s*(?:[-·/]|per)\s*(?:yr|year)\b"),
            "$/kWh/yr",
            0.8,
        ),
        // fuel
        Rule::new(
            "fuel_cost_per_mwh",
            &p(r"fuel\s+costs?(?:\s+(?:of|is|are))?[:\s]*\$\s*{n}\s*(?:/|per)\s*MWh\b"),
            "$/MWh",
            0.85,
        ),
        // degradation
        Rule::new(
            "degradation_rate",
            &p(r"{n}\s*%\s*(?:per\s+year|/\s*yr|/\s*year|annual(?:ly)?)?\s*(?:annual\s+)?degradation"),
            "%/yr",
            0.85,
        ),
        Rule::new(
            "degradation_rate",
            &p(r"degradation(?:\s+rate)?(?:\s+of)?[:\s]*{n}\s*%"),
            "%/yr",
            0.85,
        ),
        // lifetime
        Rule::new(
            "lifetime_years",
            r"(?:useful|expected|design|service)\s+life(?:time)?(?:\s+of)?[:\s]*(\d+)\s*years?",
            "years",
            0.85,
        ),
        Rule::new(
            "lifetime_years",
            r"(\d+)[-\s]*years?\s+(?:useful|design|service)\s+life",
            "years",
            0.85,
        ),
        // operating characteristics
        Rule::new(
            "capacity_factor",
            &p(r"capacity\s+factor(?:\s+of)?[:\s]*{n}\s*%"),
            "%",
            0.85,
        ),
        Rule::new(
            "depth_of_discharge",
            &p(r"{n}\s*%\s*(?:depth\s+of\s+discharge|DoD)\b"),
            "%",
            0.85,
        ),
        // Tesla product lines
        Rule::new(
            "capacity_kwh",
            &p(r"Powerwall\s*(?:3|2)?\s*(?:has\s*)?{n}\s*kWh"),
            "kWh",
            0.95,
        )
        .for_product("Tesla Powerwall"),
        Rule::new("capacity_kwh", &p(r"{n}\s*kWh\s*Powerwall"), "kWh", 0.9)
            .for_product("Tesla Powerwall"),
        Rule::new("capacity_kwh", &p(r"Megapack\s*(?:has\s*)?{n}\s*MWh"), "MWh", 0.95)
            .for_product("Tesla Megapack"),
        Rule::new("capacity_kwh", &p(r"{n}\s*MWh\s*Megapack"), "MWh", 0.9)
            .for_product("Tesla Megapack"),
        Rule::new(
            "power_kw",
            r"Tesla\s*Solar\s*Panels?\s*(?:produce\s*)?(\d+)\s*W\b",
            "W",
            0.95,
        )
        .for_product("Tesla Solar Panel"),
        Rule::new("power_kw", r"(\d+)\s*watt\s*Tesla\s*(?:solar\s*)?panel", "W", 0.9)
            .for_product("Tesla Solar Panel"),
    ]
});

/// Known product names, most specific first. The second element is the
/// canonical entity name.
static PRODUCTS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\bpowerwall\s*3\b", "Tesla Powerwall 3"),
        (r"(?i)\bpowerwall\s*2\b", "Tesla Powerwall 2"),
        (r"(?i)\bpowerwall\s*\+", "Tesla Powerwall+"),
        (r"(?i)\bpowerwall\b", "Tesla Powerwall"),
        (r"(?i)\bmegapack\s*2\s*xl\b", "Tesla Megapack 2 XL"),
        (r"(?i)\bmegapack\b", "Tesla Megapack"),
        (r"(?i)\bsolar\s+roof\b", "Tesla Solar Roof"),
        (r"(?i)\btesla\s+solar\s+panels?\b", "Tesla Solar Panel"),
        (r"(?i)\blg\s+(?:chem\s+)?resu\b", "LG RESU"),
        (r"(?i)\benphase\s+iq\s+battery\b", "Enphase IQ Battery"),
        (r"(?i)\bgenerac\s+pwrcell\b", "Generac PWRcell"),
        (r"(?i)\bbyd\s+battery-box\b", "BYD Battery-Box"),
        (r"(?i)\bsonnen\s*(?:batterie|core|eco)\b", "sonnenBatterie"),
    ]
    .into_iter()
    .map(|(re, name)| (Regex::new(re).expect("valid product pattern"), name))
    .collect()
});

const TESLA_KEYWORDS: &[&str] = &["tesla", "powerwall", "solar roof", "megapack", "solar panel"];

/// Regex extractor covering capacity, power, efficiency, warranty, cycle
/// life, price, capital cost, O&M, fuel cost, degradation, lifetime, capacity
/// factor and depth of discharge.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleExtractor;

impl RuleExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for RuleExtractor {
    fn method(&self) -> &str {
        "rule_based"
    }

    fn extract(&self, doc: &DocumentText<'_>) -> Vec<CandidateFact> {
        let text = doc.body;
        let title_product = doc.title.and_then(find_product);
        let title_hint = doc
            .title
            .map(collapse_whitespace)
            .filter(|t| !t.is_empty() && t.chars().count() <= 120);
        let lower = format!("{} {}", doc.title.unwrap_or_default(), text).to_lowercase();
        let tesla_document = TESLA_KEYWORDS.iter().any(|k| lower.contains(k));

        let mut out: Vec<CandidateFact> = Vec::new();
        for rule in RULES.iter() {
            for caps in rule.regex.captures_iter(text) {
                if caps.name("reject").is_some() {
                    continue;
                }
                let Some(m) = caps.get(1) else { continue };
                let Ok(value) = m.as_str().replace(',', "").parse::<f64>() else {
                    continue;
                };
                let Some(whole) = caps.get(0) else { continue };

                let start = floor_boundary(text, whole.start().saturating_sub(SPAN_RADIUS));
                let end = ceil_boundary(text, (whole.end() + SPAN_RADIUS).min(text.len()));
                let span = text[start..end].trim();

                let mut confidence = rule.confidence;
                let span_lower = span.to_lowercase();
                if tesla_document && TESLA_KEYWORDS.iter().any(|k| span_lower.contains(k)) {
                    confidence = (confidence + 0.1).min(0.98);
                }

                let entity_hint = rule
                    .product
                    .map(str::to_string)
                    .or_else(|| nearest_product(span, whole.start() - start))
                    .or_else(|| title_product.clone())
                    .or_else(|| title_hint.clone());

                push_unique(
                    &mut out,
                    CandidateFact {
                        entity_hint,
                        metric: rule.metric.to_string(),
                        value,
                        unit: rule.unit.to_string(),
                        confidence,
                        span: span.to_string(),
                    },
                );
            }
        }
        out
    }
}

/// Keep one candidate per (metric, value, hint), with the highest
/// confidence seen.
fn push_unique(out: &mut Vec<CandidateFact>, candidate: CandidateFact) {
    if let Some(existing) = out.iter_mut().find(|c| {
        c.metric == candidate.metric
            && c.value == candidate.value
            && c.entity_hint == candidate.entity_hint
    }) {
        if candidate.confidence > existing.confidence {
            *existing = candidate;
        }
    } else {
        out.push(candidate);
    }
}

fn find_product(text: &str) -> Option<String> {
    PRODUCTS
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, name)| name.to_string())
}

/// Product mention in `span` closest to byte offset `anchor`.
fn nearest_product(span: &str, anchor: usize) -> Option<String> {
    let mut best: Option<(usize, usize, &str)> = None;
    for (rank, (re, name)) in PRODUCTS.iter().enumerate() {
        for m in re.find_iter(span) {
            let distance = m.start().abs_diff(anchor);
            let better = match best {
                None => true,
                Some((d, r, _)) => distance < d || (distance == d && rank < r),
            };
            if better {
                best = Some((distance, rank, name));
            }
        }
    }
    best.map(|(_, _, name)| name.to_string())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(title: Option<&str>, body: &str) -> Vec<CandidateFact> {
        RuleExtractor::new().extract(&DocumentText { title, body })
    }

    fn find<'a>(facts: &'a [CandidateFact], metric: &str) -> Vec<&'a CandidateFact> {
        facts.iter().filter(|f| f.metric == metric).collect()
    }

    #[test]
    fn powerwall_datasheet() {
        let facts = extract(
            Some("Powerwall 2 Datasheet"),
            "Powerwall 2 offers 13.5 kWh usable capacity and 5 kW continuous power \
             with 90% round-trip efficiency and a 10-year warranty.",
        );

        let capacity = find(&facts, "capacity_kwh");
        assert!(capacity.iter().any(|f| f.value == 13.5 && f.unit == "kWh"));
        assert!(capacity
            .iter()
            .all(|f| f.entity_hint.as_deref() == Some("Tesla Powerwall 2")
                || f.entity_hint.as_deref() == Some("Tesla Powerwall")));
        assert!(find(&facts, "power_kw").iter().any(|f| f.value == 5.0));
        assert!(find(&facts, "efficiency_percent").iter().any(|f| f.value == 90.0));
        assert!(find(&facts, "warranty_years").iter().any(|f| f.value == 10.0));

        // Tesla content boost, capped at 0.98
        let top = capacity.iter().map(|f| f.confidence).fold(0.0, f64::max);
        assert!(top > 0.9 && top <= 0.98);
    }

    #[test]
    fn cost_metrics_and_rejects() {
        let facts = extract(
            Some("Utility-scale PV cost benchmark"),
            "Installed cost is $950/kW with fixed O&M of $18/kW-yr. \
             Panels show 0.5% per year degradation and a useful life of 30 years. \
             Battery storage runs $350/kWh.",
        );
        assert!(find(&facts, "capex_per_kw").iter().any(|f| f.value == 950.0));
        assert!(!find(&facts, "capex_per_kw").iter().any(|f| f.value == 18.0));
        assert!(find(&facts, "om_per_kw_year").iter().any(|f| f.value == 18.0));
        assert!(find(&facts, "degradation_rate").iter().any(|f| f.value == 0.5));
        assert!(find(&facts, "lifetime_years").iter().any(|f| f.value == 30.0));
        assert!(find(&facts, "capex_per_kwh").iter().any(|f| f.value == 350.0));
        // "$950/kW" is a unit cost, never a bare price.
        assert!(find(&facts, "price_usd").is_empty());
        // No product in the text: the title is the hint.
        assert!(facts
            .iter()
            .all(|f| f.entity_hint.as_deref() == Some("Utility-scale PV cost benchmark")));
    }

    #[test]
    fn cycles_per_year_is_not_cycle_life() {
        let facts = extract(None, "Rated for 6,000 cycles. Typical use is 365 cycles per year.");
        let cycles = find(&facts, "cycle_life");
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].value, 6000.0);
        assert_eq!(cycles[0].entity_hint, None);
    }

    #[test]
    fn span_is_bounded_and_utf8_safe() {
        let body = format!("{}13.5 kWh usable capacity{}", "é".repeat(80), "ü".repeat(80));
        let facts = extract(None, &body);
        let capacity = find(&facts, "capacity_kwh");
        let fact = capacity[0];
        assert!(fact.span.contains("13.5 kWh"));
        assert!(fact.span.len() <= "13.5 kWh usable capacity".len() + 2 * SPAN_RADIUS + 2);
    }

    #[test]
    fn duplicate_matches_collapse() {
        let facts = extract(None, "Price: $12,000 for the system.");
        let prices = find(&facts, "price_usd");
        assert_eq!(prices.len(), 1);
        assert_eq!(prices[0].value, 12000.0);
        assert_eq!(prices[0].confidence, 0.8);
    }

    #[test]
    fn megapack_units_are_mwh() {
        let facts = extract(None, "Each Megapack has 3.9 MWh of storage.");
        let cap = find(&facts, "capacity_kwh");
        assert!(cap
            .iter()
            .any(|f| f.value == 3.9 && f.unit == "MWh" && f.entity_hint.as_deref() == Some("Tesla Megapack")));
    }

    #[test]
    fn fuel_cost_per_mwh() {
        let facts = extract(None, "Combined-cycle plants face fuel costs of $32.50/MWh this year.");
        let fuel = find(&facts, "fuel_cost_per_mwh");
        assert_eq!(fuel.len(), 1);
        assert_eq!(fuel[0].value, 32.5);
        assert_eq!(fuel[0].unit, "$/MWh");
        assert!(find(&facts, "price_usd").is_empty());
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(extract(Some("Title"), "").is_empty());
    }
}
