use std::fs::File;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use otr_portfolio::{AccessContext, AccessRole};

mod commands;

use commands::{import, report};

#[derive(Parser)]
#[command(name = "otr")]
#[command(about = "Options trade recorder CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Import trades from a CSV file
    Import {
        #[arg(long)]
        owner: String,

        /// Acting user when importing into someone else's portfolio
        #[arg(long)]
        actor: Option<String>,

        #[arg(long)]
        file: String,

        /// Apply to an empty in-memory book and print the outcome; no DB needed
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Portfolio snapshots
    Snapshot {
        #[command(subcommand)]
        cmd: SnapshotCmd,
    },

    /// Valuation and performance reports
    Report {
        #[command(subcommand)]
        cmd: ReportCmd,
    },

    /// Shared-portfolio grants
    Access {
        #[command(subcommand)]
        cmd: AccessCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum SnapshotCmd {
    /// Record net value and FX rate for a day (today by default)
    Capture {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        actor: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    List {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        actor: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReportCmd {
    /// Net liquidation value and lifetime P/L
    Valuation {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        actor: Option<String>,
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// Period and horizon returns
    Performance {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        actor: Option<String>,
        /// Report from stored snapshots only, as of this date (YYYY-MM-DD)
        #[arg(long)]
        as_of: Option<String>,
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum AccessCmd {
    Grant {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        grantee: String,
        /// editor | viewer
        #[arg(long)]
        role: String,
    },

    Revoke {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        grantee: String,
    },

    /// Portfolios the actor has been granted access to
    List {
        #[arg(long)]
        actor: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = otr_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = otr_db::status(&pool).await?;
                    println!("db_ok={} has_ledger_table={}", s.ok, s.has_ledger_table);
                }
                DbCmd::Migrate => {
                    otr_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = otr_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Import {
            owner,
            actor,
            file,
            dry_run,
        } => {
            let owner = commands::parse_uuid(&owner, "owner")?;
            let actor = actor.map(|a| commands::parse_uuid(&a, "actor")).transpose()?;
            let input = File::open(&file).with_context(|| format!("open {file}"))?;
            let parsed = import::parse_trade_csv(input)?;

            let summary = if dry_run {
                // No grants to consult offline; an actor imports as an editor.
                let ctx = match actor {
                    Some(a) if a != owner => AccessContext {
                        owner_id: owner,
                        actor_id: a,
                        role: AccessRole::Editor,
                    },
                    _ => AccessContext::owner(owner),
                };
                let (summary, book) = import::dry_run(&ctx, parsed);
                println!("dry_run=true");
                println!(
                    "ledger_rows={} long_rows={} short_lots={}",
                    book.ledger().len(),
                    book.longs().active().count(),
                    book.shorts().open_lots().len()
                );
                summary
            } else {
                let pool = otr_db::connect_from_env().await?;
                let ctx = commands::resolve_context(&pool, owner, actor).await?;
                import::commit_rows(&pool, &ctx, parsed).await?
            };
            import::print_summary(&summary);
        }

        Commands::Snapshot { cmd } => match cmd {
            SnapshotCmd::Capture {
                owner,
                actor,
                date,
                config_paths,
            } => {
                let date = date.as_deref().map(parse_date).transpose()?;
                let (settings, config_json) = commands::load_settings(&config_paths)?;
                let prices = commands::build_price_cache(&settings, &config_json)?;
                let pool = otr_db::connect_from_env().await?;
                let ctx = context(&pool, &owner, actor).await?;
                report::snapshot_capture(&pool, &prices, &ctx, date).await?;
            }
            SnapshotCmd::List { owner, actor } => {
                let pool = otr_db::connect_from_env().await?;
                let ctx = context(&pool, &owner, actor).await?;
                report::snapshot_list(&pool, &ctx).await?;
            }
        },

        Commands::Report { cmd } => match cmd {
            ReportCmd::Valuation {
                owner,
                actor,
                config_paths,
            } => {
                let (settings, config_json) = commands::load_settings(&config_paths)?;
                let prices = commands::build_price_cache(&settings, &config_json)?;
                let pool = otr_db::connect_from_env().await?;
                let ctx = context(&pool, &owner, actor).await?;
                report::valuation(&pool, &prices, &ctx).await?;
            }
            ReportCmd::Performance {
                owner,
                actor,
                as_of,
                config_paths,
            } => {
                let as_of = as_of.as_deref().map(parse_date).transpose()?;
                let (settings, config_json) = commands::load_settings(&config_paths)?;
                let prices = commands::build_price_cache(&settings, &config_json)?;
                let pool = otr_db::connect_from_env().await?;
                let ctx = context(&pool, &owner, actor).await?;
                report::performance(&pool, &prices, &ctx, as_of).await?;
            }
        },

        Commands::Access { cmd } => {
            let pool = otr_db::connect_from_env().await?;
            match cmd {
                AccessCmd::Grant {
                    owner,
                    grantee,
                    role,
                } => {
                    let owner = commands::parse_uuid(&owner, "owner")?;
                    let grantee = commands::parse_uuid(&grantee, "grantee")?;
                    let role = AccessRole::parse(&role)
                        .ok_or_else(|| anyhow!("invalid role '{role}' (expected editor|viewer)"))?;
                    otr_db::grant_access(&pool, owner, grantee, role).await?;
                    println!("granted=true owner={owner} grantee={grantee} role={}", role.as_str());
                }
                AccessCmd::Revoke { owner, grantee } => {
                    let owner = commands::parse_uuid(&owner, "owner")?;
                    let grantee = commands::parse_uuid(&grantee, "grantee")?;
                    let removed = otr_db::revoke_access(&pool, owner, grantee).await?;
                    println!("revoked={removed} owner={owner} grantee={grantee}");
                }
                AccessCmd::List { actor } => {
                    let actor = commands::parse_uuid(&actor, "actor")?;
                    let owners = otr_db::accessible_owners(&pool, actor).await?;
                    println!("accessible={}", owners.len());
                    for (owner, role) in owners {
                        println!("owner={owner} role={}", role.as_str());
                    }
                }
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout stays `key=value`.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn context(pool: &sqlx::PgPool, owner: &str, actor: Option<String>) -> Result<AccessContext> {
    let owner = commands::parse_uuid(owner, "owner")?;
    let actor = actor.map(|a| commands::parse_uuid(&a, "actor")).transpose()?;
    commands::resolve_context(pool, owner, actor).await
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(d) => Ok(d),
        Err(_) => bail!("invalid date '{raw}' (expected YYYY-MM-DD)"),
    }
}
