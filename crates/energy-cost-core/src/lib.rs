//! # Energy Cost Core
//!
//! Pure, I/O-free logic for the energy cost pipeline: data models, the
//! error taxonomy, unit normalization, fact quality scoring, the extractor
//! contract, the LCOE/LCOS engine, ranking, sensitivity analysis, and
//! scenario presets.
//!
//! This crate contains no tokio, sqlx, or network dependencies. Everything
//! here is deterministic: the same inputs always produce the same outputs.

pub mod error;
pub mod extractor;
pub mod lcoe;
pub mod models;
pub mod normalize;
pub mod quality;
pub mod ranking;
pub mod scenarios;
pub mod sensitivity;

pub use error::PipelineError;
