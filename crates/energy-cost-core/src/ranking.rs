//! Ranking of computed results.
//!
//! Results with an LCOE go into the `lcoe` list; results with only an LCOS
//! go into the `storage` list. Each list is ordered by ascending value, then
//! descending confidence, then entity name, then entity id, so the order is
//! total and stable across runs.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Input row: one computed result joined with its entity name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankInput {
    pub entity_id: i64,
    pub entity_name: String,
    pub lcoe_usd_per_kwh: Option<f64>,
    pub lcos_usd_per_kwh: Option<f64>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankEntry {
    pub rank: u32,
    pub entity_id: i64,
    pub entity_name: String,
    pub value: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rankings {
    pub lcoe: Vec<RankEntry>,
    pub storage: Vec<RankEntry>,
}

pub fn rank(results: &[RankInput]) -> Rankings {
    let mut lcoe = Vec::new();
    let mut storage = Vec::new();
    for r in results {
        match (r.lcoe_usd_per_kwh, r.lcos_usd_per_kwh) {
            (Some(v), _) => lcoe.push((v, r)),
            (None, Some(v)) => storage.push((v, r)),
            (None, None) => {}
        }
    }
    Rankings {
        lcoe: order(lcoe),
        storage: order(storage),
    }
}

fn order(mut rows: Vec<(f64, &RankInput)>) -> Vec<RankEntry> {
    rows.sort_by(|(va, a), (vb, b)| compare(*va, a, *vb, b));
    rows.into_iter()
        .enumerate()
        .map(|(i, (value, r))| RankEntry {
            rank: i as u32 + 1,
            entity_id: r.entity_id,
            entity_name: r.entity_name.clone(),
            value,
            confidence: r.confidence,
        })
        .collect()
}

fn compare(va: f64, a: &RankInput, vb: f64, b: &RankInput) -> Ordering {
    va.total_cmp(&vb)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.entity_name.cmp(&b.entity_name))
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}
