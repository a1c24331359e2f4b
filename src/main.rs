use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};

use siphon::config::Config;
use siphon::{Pipeline, Resource, Source, WriteDisposition};

#[derive(Parser)]
#[command(name = "siphon")]
#[command(about = "Staged extract/normalize/load pipeline runner")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the pipeline config file
    #[arg(long, default_value = "siphon.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pending and archived load packages
    Status,
    /// Load every pending package into the configured destination
    Resume,
    /// Print the stored schema
    Schema,
    /// Run a small built-in source end to end against the destination
    Demo,
}

fn demo_source() -> anyhow::Result<Source> {
    let rows = (1..=5).map(|id| {
        json!({
            "id": id,
            "example_string": format!("row {}", id),
        })
    });
    let source = Source::new("demo")
        .resource(Resource::new("example_rows", rows.collect::<Vec<_>>()))?
        .resource(
            Resource::derived("example_row_labels", "example_rows", |row| {
                let id = row["id"].as_i64().unwrap_or_default();
                vec![json!({"row_id": id, "label": format!("label-{}", id)})]
            })
            .write_disposition(WriteDisposition::Replace),
        )?;
    Ok(source)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    siphon::logging::init_logging();

    let cli = Cli::parse();
    let config = Config::load_from(&cli.config)?;
    let pipeline = Pipeline::from_config(&config)?;

    match cli.command {
        Commands::Status => {
            let storage = pipeline.storage();
            let pending = storage.pending_packages()?;
            let archived = storage.archived_packages()?;
            println!("Pipeline: {}", pipeline.name());
            println!("Pending packages: {}", pending.len());
            for load_id in &pending {
                let package =
                    siphon::load::LoadPackage::open(storage.package_dir(load_id), load_id)?;
                let counts = package.counts()?;
                println!(
                    "  {} (new: {}, started: {}, completed: {}, failed: {})",
                    load_id, counts.new, counts.started, counts.completed, counts.failed
                );
                for (table, rows) in package.table_row_counts()? {
                    println!("    {}: {} rows", table, rows);
                }
            }
            println!("Archived packages: {}", archived.len());
            for load_id in &archived {
                println!("  {}", load_id);
            }
        }
        Commands::Resume => {
            println!("Resuming pending load packages...");
            let infos = pipeline.load_pending().await?;
            if infos.is_empty() {
                println!("Nothing to load.");
            }
            for info in infos {
                report(&info);
            }
        }
        Commands::Schema => {
            let schema = pipeline.schema()?;
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Commands::Demo => {
            println!("Running demo pipeline...");
            info!("starting demo run");
            match pipeline.run(demo_source()?).await {
                Ok(info) => report(&info),
                Err(e) => {
                    error!("demo run failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

fn report(info: &siphon::LoadInfo) {
    println!("\nLoad {}:", info.load_id);
    println!("  Completed jobs: {}", info.completed_jobs);
    println!("  Failed jobs: {}", info.failed_jobs);
    for (table, rows) in &info.table_rows {
        println!("  {}: {} rows", table, rows);
    }
}
