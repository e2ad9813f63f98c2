//! # Energy Cost CLI (`ecost`)
//!
//! The `ecost` binary drives the pipeline, manages the catalog, and runs
//! the HTTP server and admin actions.
//!
//! ## Usage
//!
//! ```bash
//! ecost --config ./config/ecost.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ecost init` | Create the SQLite database and run schema migrations |
//! | `ecost serve` | Start the HTTP server and the worker pool |
//! | `ecost work [--once]` | Run the worker pool, or drain due jobs once |
//! | `ecost refresh` | Queue fetches for stale sources |
//! | `ecost ingest search <queries…>` | Queue seed searches |
//! | `ecost ingest crawl <urls…>` | Register URLs and queue fetches |
//! | `ecost extract` | Queue extraction of unprocessed documents |
//! | `ecost compute <scenario_id>` | Queue compute for a scenario |
//! | `ecost rank <scenario_id>` | Rank a scenario's results and print them |
//! | `ecost sensitivity <scenario_id> <entity_id>` | Print a sensitivity table |
//! | `ecost entity add\|list` | Manage entities |
//! | `ecost assumption set\|list` | Manage global assumptions |
//! | `ecost scenario create\|preset\|product\|list` | Manage scenarios, seed product presets |
//! | `ecost price add\|list` | Manage price observations |
//! | `ecost source list\|reset` | Inspect sources, re-enable a denied one |
//! | `ecost admin …` | Scale, vacuum, backup, status, audit log |
//! | `ecost jobs` | Job counts and recent jobs |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! ecost init --config ./config/ecost.toml
//!
//! # Crawl two pages and process everything that follows
//! ecost ingest crawl https://www.nrel.gov/ https://www.eia.gov/ --wait
//!
//! # Residential California scenario, computed and ranked
//! ecost scenario preset residential CA
//! ecost compute 1 --wait
//! ecost rank 1
//!
//! # Scale the worker pool down to two workers
//! ecost admin scale worker 2 --actor ops@example.com
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use energy_cost::catalog::NewPrice;
use energy_cost::commands;
use energy_cost::config;
use energy_cost::core::models::{EntityType, NewEntity, UseCase};
use energy_cost::core::scenarios::ProductOptions;
use energy_cost::logging::{self, LogFormat};
use energy_cost::server;

/// Energy Cost CLI: collect technology cost data and compute LCOE/LCOS.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ecost.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ecost",
    about = "Energy Cost: collect technology cost data and rank technologies by levelized cost",
    version,
    long_about = "Energy Cost crawls public sources for cost and performance figures, normalizes \
    them into scored facts, and computes levelized cost of energy (LCOE) and of storage (LCOS) \
    for user-defined scenarios, via a CLI and an HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ecost.toml`. Only the `[db]` section is required.
    #[arg(long, global = true, default_value = "./config/ecost.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and every table. Running it again
    /// is safe.
    Init,

    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind` and, unless `--no-workers` is given, runs
    /// the worker pool in the same process.
    Serve {
        /// Serve the API only; leave the queue to `ecost work`.
        #[arg(long)]
        no_workers: bool,
    },

    /// Run pipeline workers.
    ///
    /// Without `--once` the pool runs until Ctrl-C, including the periodic
    /// refresh of stale sources.
    Work {
        /// Process every due job, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Queue a fetch for every source not crawled within `pipeline.freshness_hours`.
    Refresh,

    /// Queue ingestion work.
    Ingest {
        #[command(subcommand)]
        action: IngestAction,
    },

    /// Queue extraction for every document that has no candidates or facts yet.
    Extract {
        /// Process the queue before returning.
        #[arg(long)]
        wait: bool,
    },

    /// Queue levelized-cost computation for every entity a scenario covers.
    Compute {
        scenario_id: i64,
        /// Process the queue before returning.
        #[arg(long)]
        wait: bool,
    },

    /// Rank a scenario's stored results and print both lists.
    Rank { scenario_id: i64 },

    /// Print a one-at-a-time sensitivity table for one entity.
    Sensitivity {
        scenario_id: i64,
        entity_id: i64,
        /// Relative perturbation applied to each input (default 0.2).
        #[arg(long)]
        variation: Option<f64>,
    },

    /// Manage catalogued entities.
    Entity {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Manage global economic assumptions.
    Assumption {
        #[command(subcommand)]
        action: AssumptionAction,
    },

    /// Manage scenarios.
    Scenario {
        #[command(subcommand)]
        action: ScenarioAction,
    },

    /// Manage price observations.
    Price {
        #[command(subcommand)]
        action: PriceAction,
    },

    /// Inspect registered sources.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Administrative actions. Mutating actions are audited.
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },

    /// Show job counts per stage and state, and recent jobs.
    Jobs {
        /// Only list jobs in this state (pending, running, succeeded, …).
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum IngestAction {
    /// Queue one seed search per query.
    Search {
        #[arg(required = true)]
        queries: Vec<String>,
        /// Process the queue before returning.
        #[arg(long)]
        wait: bool,
    },
    /// Register URLs as sources and queue a fetch for each.
    Crawl {
        #[arg(required = true)]
        urls: Vec<String>,
        /// Process the queue before returning.
        #[arg(long)]
        wait: bool,
    },
}

#[derive(Subcommand)]
enum EntityAction {
    /// Insert an entity, or update the type of an existing one.
    Add {
        #[arg(long)]
        name: String,
        /// pv, battery, inverter, thermal, wind, hydro, policy or tariff.
        #[arg(long = "type")]
        entity_type: String,
        #[arg(long)]
        manufacturer: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        version: Option<String>,
    },
    /// List entities.
    List {
        /// Case-insensitive name substring.
        #[arg(long)]
        q: Option<String>,
        #[arg(long = "type")]
        entity_type: Option<String>,
        #[arg(long)]
        manufacturer: Option<String>,
    },
}

#[derive(Subcommand)]
enum AssumptionAction {
    /// Set a named assumption, e.g. `discount_rate 7 %`.
    Set {
        name: String,
        value: f64,
        unit: String,
    },
    List,
}

#[derive(Subcommand)]
enum ScenarioAction {
    /// Create a scenario from a JSON file.
    Create {
        #[arg(long)]
        file: PathBuf,
    },
    /// Create a scenario from a use-case and region preset.
    Preset {
        /// residential, commercial or utility.
        use_case: String,
        /// Region code, e.g. CA or TX. Unknown regions get neutral factors.
        region: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Seed a Tesla product's catalog facts and create a scenario sized for it.
    Product {
        /// powerwall-3, powerwall-2, megapack, solar-panels or solar-roof.
        product: String,
        /// Region code, e.g. CA or TX.
        region: String,
        /// Override the product's default use case.
        #[arg(long)]
        use_case: Option<String>,
        /// Units for batteries, kW for solar.
        #[arg(long)]
        quantity: Option<f64>,
        /// Solar roof capex multiplier (1.0 to 1.5).
        #[arg(long)]
        roof_complexity: Option<f64>,
        #[arg(long)]
        name: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
enum PriceAction {
    /// Record a price observation.
    Add {
        #[arg(long)]
        entity_id: i64,
        #[arg(long)]
        value: f64,
        /// per_kw, per_kwh, per_w or per_unit.
        #[arg(long)]
        basis: String,
        #[arg(long, default_value = "USD")]
        currency: String,
        #[arg(long)]
        region: Option<String>,
    },
    List {
        #[arg(long)]
        entity_id: Option<i64>,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    List,
    /// Re-enable a source disabled by a fetch denial.
    Reset { url: String },
}

#[derive(Subcommand)]
enum AdminAction {
    /// Set the replica count of a scale target.
    Scale {
        target: String,
        replicas: i64,
        /// Recorded in the audit log (default `admin.default_actor`).
        #[arg(long)]
        actor: Option<String>,
    },
    /// VACUUM and ANALYZE the database.
    Vacuum {
        #[arg(long)]
        actor: Option<String>,
    },
    /// Write a snapshot of the database into `admin.backup_dir`.
    Backup {
        #[arg(long)]
        actor: Option<String>,
    },
    /// Print database health.
    DbStatus,
    /// Print server health.
    ServerStatus,
    /// Print audit records, newest first.
    Audit {
        #[arg(long)]
        limit: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose, cli.log_format);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            commands::run_init(&cfg).await?;
        }
        Commands::Serve { no_workers } => {
            server::run_server(&cfg, !no_workers).await?;
        }
        Commands::Work { once } => {
            commands::run_work(&cfg, once).await?;
        }
        Commands::Refresh => {
            commands::run_refresh(&cfg).await?;
        }
        Commands::Ingest { action } => match action {
            IngestAction::Search { queries, wait } => {
                commands::run_ingest_search(&cfg, &queries, wait).await?;
            }
            IngestAction::Crawl { urls, wait } => {
                commands::run_ingest_crawl(&cfg, &urls, wait).await?;
            }
        },
        Commands::Extract { wait } => {
            commands::run_extract(&cfg, wait).await?;
        }
        Commands::Compute { scenario_id, wait } => {
            commands::run_compute(&cfg, scenario_id, wait).await?;
        }
        Commands::Rank { scenario_id } => {
            commands::run_rank(&cfg, scenario_id).await?;
        }
        Commands::Sensitivity {
            scenario_id,
            entity_id,
            variation,
        } => {
            commands::run_sensitivity(&cfg, scenario_id, entity_id, variation).await?;
        }
        Commands::Entity { action } => match action {
            EntityAction::Add {
                name,
                entity_type,
                manufacturer,
                model,
                version,
            } => {
                let entity = NewEntity {
                    name,
                    entity_type: entity_type.parse::<EntityType>()?,
                    manufacturer,
                    model,
                    version,
                };
                commands::run_entity_add(&cfg, entity).await?;
            }
            EntityAction::List {
                q,
                entity_type,
                manufacturer,
            } => {
                commands::run_entity_list(&cfg, q, entity_type.as_deref(), manufacturer).await?;
            }
        },
        Commands::Assumption { action } => match action {
            AssumptionAction::Set { name, value, unit } => {
                commands::run_assumption_set(&cfg, &name, value, &unit).await?;
            }
            AssumptionAction::List => {
                commands::run_assumption_list(&cfg).await?;
            }
        },
        Commands::Scenario { action } => match action {
            ScenarioAction::Create { file } => {
                commands::run_scenario_create(&cfg, &file).await?;
            }
            ScenarioAction::Preset {
                use_case,
                region,
                name,
            } => {
                commands::run_scenario_preset(&cfg, &use_case, &region, name).await?;
            }
            ScenarioAction::Product {
                product,
                region,
                use_case,
                quantity,
                roof_complexity,
                name,
            } => {
                let use_case = use_case.map(|u| u.parse::<UseCase>()).transpose()?;
                let options = ProductOptions {
                    use_case,
                    quantity,
                    roof_complexity,
                    name,
                };
                commands::run_scenario_product(&cfg, &product, &region, &options).await?;
            }
            ScenarioAction::List => {
                commands::run_scenario_list(&cfg).await?;
            }
        },
        Commands::Price { action } => match action {
            PriceAction::Add {
                entity_id,
                value,
                basis,
                currency,
                region,
            } => {
                let price = NewPrice {
                    entity_id,
                    value,
                    currency,
                    basis,
                    region,
                    valid_from: None,
                    valid_to: None,
                    document_id: None,
                };
                commands::run_price_add(&cfg, price).await?;
            }
            PriceAction::List { entity_id } => {
                commands::run_price_list(&cfg, entity_id).await?;
            }
        },
        Commands::Source { action } => match action {
            SourceAction::List => {
                commands::run_source_list(&cfg).await?;
            }
            SourceAction::Reset { url } => {
                commands::run_source_reset(&cfg, &url).await?;
            }
        },
        Commands::Admin { action } => match action {
            AdminAction::Scale {
                target,
                replicas,
                actor,
            } => {
                commands::run_admin_scale(&cfg, &target, replicas, actor).await?;
            }
            AdminAction::Vacuum { actor } => {
                commands::run_admin_db(&cfg, "vacuum_analyze", actor).await?;
            }
            AdminAction::Backup { actor } => {
                commands::run_admin_db(&cfg, "backup_snapshot", actor).await?;
            }
            AdminAction::DbStatus => {
                commands::run_admin_db_status(&cfg).await?;
            }
            AdminAction::ServerStatus => {
                commands::run_admin_server_status(&cfg).await?;
            }
            AdminAction::Audit { limit } => {
                commands::run_admin_audit(&cfg, limit).await?;
            }
        },
        Commands::Jobs { state, limit } => {
            commands::run_jobs(&cfg, state.as_deref(), limit).await?;
        }
    }

    Ok(())
}
