use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use weight_trend::config::AppConfig;
use weight_trend::db::{self, PgTrendStore};
use weight_trend::models::{TrendView, WeightUnit};
use weight_trend::report;
use weight_trend::store::InMemoryStore;
use weight_trend::TrendMaterializer;

#[derive(Parser)]
#[command(name = "weight-trend")]
#[command(about = "Trend weight estimation and materialization for daily weigh-ins", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Database(DatabaseCommand),
    /// Run the trend engine over a CSV file without a database
    Estimate {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long)]
        user: Option<Uuid>,
        #[arg(long, default_value_t = 14)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}

/// Commands that need a Postgres connection.
#[derive(Subcommand)]
enum DatabaseCommand {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a demo weigh-in history
    Seed,
    /// Import weigh-ins from a CSV file (user_id,measured_on,weight[,unit])
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record a single weigh-in and refresh the user's trend
    Record {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        weight: f64,
        #[arg(long, default_value = "kg")]
        unit: WeightUnit,
    },
    /// Rebuild a user's trend rows from their full history
    Recompute {
        #[arg(long)]
        user: Uuid,
    },
    /// Print a user's trend, recomputing first if it is stale
    Show {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value_t = 14)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Generate a markdown trend report
    Report {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        goal: Option<f64>,
        #[arg(long, default_value_t = report::DEFAULT_RATE_WINDOW_DAYS)]
        window_days: i64,
        #[arg(long, default_value = "trend-report.md")]
        out: PathBuf,
    },
}

fn print_views(user: Uuid, views: &[TrendView], limit: usize, json: bool) -> anyhow::Result<()> {
    let recent = &views[views.len().saturating_sub(limit)..];
    if json {
        println!("{}", serde_json::to_string_pretty(recent)?);
        return Ok(());
    }

    if views.is_empty() {
        println!("No weigh-ins recorded for {user}.");
        return Ok(());
    }

    println!(
        "Trend for {user}: {:+.2} kg/week, volatility {}",
        report::best_fit_weekly_rate(views, report::DEFAULT_RATE_WINDOW_DAYS),
        report::volatility_badge(views)
    );
    for view in recent {
        println!(
            "- {} weighed {:.1} kg, trend {:.2} kg ({:.2} to {:.2})",
            view.measured_on, view.weight_kg, view.trend_weight, view.trend_ci_lower, view.trend_ci_upper
        );
    }
    Ok(())
}

async fn estimate_offline(
    config: &AppConfig,
    csv: &std::path::Path,
    user: Option<Uuid>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let parsed = db::read_weigh_ins(csv)?;
    let store = InMemoryStore::new();
    for weigh_in in &parsed.weigh_ins {
        store.record_observation(weigh_in.user_id, weigh_in.measured_on, weigh_in.weight_kg);
    }

    let users = match user {
        Some(user) => vec![user],
        None => store.users(),
    };
    let engine = TrendMaterializer::new(store, config.engine);
    for user in users {
        let views = engine.trend_view(user).await?;
        print_views(user, &views, limit, json)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command {
        Commands::Estimate {
            csv,
            user,
            limit,
            json,
        } => estimate_offline(&config, &csv, user, limit, json).await,
        Commands::Database(command) => run_with_database(&config, command).await,
    }
}

async fn run_with_database(config: &AppConfig, command: DatabaseCommand) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.database_url()?)
        .await
        .context("failed to connect to Postgres")?;
    let engine = TrendMaterializer::new(PgTrendStore::new(pool.clone()), config.engine);

    match command {
        DatabaseCommand::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        DatabaseCommand::Seed => {
            let user = db::seed(&pool, Utc::now().date_naive()).await?;
            engine.refresh_best_effort(user).await;
            println!("Seed data inserted for {user}.");
        }
        DatabaseCommand::Import { csv } => {
            let parsed = db::read_weigh_ins(&csv)?;
            let written = db::import_weigh_ins(&pool, &parsed.weigh_ins).await?;
            for user in parsed.users() {
                engine.refresh_best_effort(user).await;
            }
            println!(
                "Imported {written} weigh-ins from {} ({} skipped).",
                csv.display(),
                parsed.skipped
            );
        }
        DatabaseCommand::Record {
            user,
            date,
            weight,
            unit,
        } => {
            let weight_kg = unit.to_kg(weight);
            if !(weight_kg.is_finite() && weight_kg > 0.0) {
                anyhow::bail!("weight must be a positive number, got {weight}");
            }
            let measured_on = date.unwrap_or_else(|| Utc::now().date_naive());
            db::record_observation(engine.store().pool(), user, measured_on, weight_kg).await?;
            engine.refresh_best_effort(user).await;
            println!("Recorded {weight_kg:.2} kg for {user} on {measured_on}.");
        }
        DatabaseCommand::Recompute { user } => {
            let written = engine.recompute(user).await?;
            println!(
                "Wrote {written} trend rows for {user} (model v{}).",
                engine.model_version()
            );
        }
        DatabaseCommand::Show { user, limit, json } => {
            let views = engine.trend_view(user).await?;
            print_views(user, &views, limit, json)?;
        }
        DatabaseCommand::Report {
            user,
            goal,
            window_days,
            out,
        } => {
            let views = engine.trend_view(user).await?;
            let output = report::build_report(&user.to_string(), &views, goal, window_days);
            std::fs::write(&out, output)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
