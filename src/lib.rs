//! # Energy Cost
//!
//! Collects public cost and performance data for energy technologies,
//! normalizes it into scored facts, and computes levelized cost of energy
//! (LCOE) and of storage (LCOS) under user-defined scenarios.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐   ┌──────────┐
//! │ Seed search │──▶│ Fetch+Dedup  │──▶│ Extract + │──▶│  SQLite   │
//! │   (trait)   │   │  (robots)    │   │ Normalize │   │  (WAL)    │
//! └─────────────┘   └──────────────┘   └───────────┘   └────┬─────┘
//!                                                           │
//!                           ┌──────────────┬────────────────┤
//!                           ▼              ▼                ▼
//!                     ┌──────────┐   ┌──────────┐    ┌────────────┐
//!                     │ Compute  │──▶│   Rank   │    │   Admin    │
//!                     │ LCOE/LCOS│   │          │    │ (audited)  │
//!                     └──────────┘   └──────────┘    └────────────┘
//! ```
//!
//! Every stage runs as a job in the persisted queue (`jobs` table); the
//! CLI (`ecost`) and the HTTP API only enqueue work or read results.
//!
//! ## Quick Start
//!
//! ```bash
//! ecost init
//! ecost assumption set discount_rate 7 %
//! ecost assumption set inflation_rate 2.5 %
//! ecost ingest search "solar panels LCOE" --wait
//! ecost scenario preset residential CA
//! ecost compute 1 --wait
//! ecost rank 1
//! ecost serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | SQLite pool and timestamp helpers |
//! | [`migrate`] | Schema creation |
//! | [`fetch`] | Seed search and HTTP fetching with robots.txt |
//! | [`sources`] | Source registry and content-hash dedup |
//! | [`catalog`] | Entities, facts, assumptions, scenarios, prices |
//! | [`extract`] | Extract and normalize stages |
//! | [`compute`] | Compute stage and sensitivity |
//! | [`rank`] | Rank stage |
//! | [`queue`] | Persisted job queue |
//! | [`pipeline`] | Stage handlers and the worker pool |
//! | [`admin`] | Audited admin control plane |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |
//!
//! Pure logic (normalization, scoring, the cost engine, ranking) lives in
//! the `energy-cost-core` crate.

pub mod admin;
pub mod catalog;
pub mod commands;
pub mod compute;
pub mod config;
pub mod db;
pub mod extract;
pub mod fetch;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod queue;
pub mod rank;
pub mod server;
pub mod sources;

pub use energy_cost_core as core;
