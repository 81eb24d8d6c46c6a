use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paperflow::config::{load_config, to_toml, AppConfig};
use paperflow::models::{DiscoveryConfiguration, PipelineConfiguration, SourcePaper, SourceType};
use paperflow::pipeline::{default_definitions, StageGraph};
use paperflow::{DiscoveryAggregator, SourceRegistry};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// paperflow - Process research papers and discover related work
#[derive(Parser, Debug)]
#[command(name = "paperflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Process research papers and discover related work", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover papers related to a DOI
    Discover {
        /// DOI of the source paper
        #[arg(long)]
        doi: String,

        /// Title of the source paper, used by title-based lookups
        #[arg(long)]
        title: Option<String>,

        /// Discovery preset (default, fast, comprehensive)
        #[arg(long)]
        preset: Option<String>,

        /// Source ids to query, replacing the preset's sources (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Merge copies of the same paper found by different sources
        #[arg(long)]
        dedup: bool,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List pipeline and discovery presets
    Presets {
        #[arg(long)]
        json: bool,
    },

    /// Validate a pipeline preset and print its dispatch waves
    Plan {
        /// Pipeline preset (fast, quick, comprehensive, research-grade); defaults to `[pipeline]`
        preset: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(cli: &Cli, config: &AppConfig) {
    let level = if cli.quiet {
        "error".to_string()
    } else {
        match cli.verbose {
            0 => config.logging.level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("paperflow={}", level)),
    );

    if cli.log_json || config.logging.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&cli, &config);

    match &cli.command {
        Commands::Discover {
            doi,
            title,
            preset,
            sources,
            dedup,
            json,
        } => {
            let mut settings = config.discovery.clone();
            if let Some(preset) = preset {
                settings.preset = preset.clone();
            }
            if !sources.is_empty() {
                settings.sources = sources.clone();
            }
            settings.deduplicate |= *dedup;
            let configuration = settings.configuration()?;

            let registry = SourceRegistry::with_default_sources(&config.api_keys)?;
            let aggregator = DiscoveryAggregator::new(registry);
            let paper = SourcePaper::new(title.clone().unwrap_or_default()).with_doi(doi.clone());

            let result = aggregator.discover(&paper, &configuration).await?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!(
                    "{} related papers (confidence {:.2}){}",
                    result.total_papers(),
                    result.overall_confidence_score,
                    if result.requires_user_review { ", needs review" } else { "" }
                );
                for (rank, paper) in result.discovered_papers.iter().enumerate() {
                    println!(
                        "{:>3}. [{:.2}] {} ({}, {}){}",
                        rank + 1,
                        paper.relevance_score,
                        paper.title,
                        paper.source.name(),
                        paper.relationship,
                        paper.doi.as_deref().map(|d| format!(" doi:{}", d)).unwrap_or_default()
                    );
                }
                for warning in &result.warnings {
                    eprintln!("warning: {}", warning);
                }
                for error in &result.errors {
                    eprintln!("error: {}", error);
                }
            }
        }

        Commands::Presets { json } => {
            let pipelines = PipelineConfiguration::presets();
            let discovery: Vec<(&str, DiscoveryConfiguration)> = ["default", "fast", "comprehensive"]
                .into_iter()
                .filter_map(|name| DiscoveryConfiguration::preset(name).map(|c| (name, c)))
                .collect();

            if *json {
                let value = serde_json::json!({
                    "pipeline": pipelines,
                    "discovery": discovery
                        .iter()
                        .map(|(name, c)| serde_json::json!({ "name": name, "configuration": c }))
                        .collect::<Vec<_>>(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Pipeline presets:");
                for preset in &pipelines {
                    let stages: Vec<&str> = preset.required_stages.iter().map(|s| s.id()).collect();
                    println!(
                        "  {:<15} concurrency {}, timeout {} min: {}",
                        preset.name,
                        preset.max_concurrent_agents,
                        preset.timeout_minutes,
                        stages.join(", ")
                    );
                }
                println!("Discovery presets:");
                for (name, preset) in &discovery {
                    let sources: Vec<&str> = preset.enabled_sources.iter().map(SourceType::id).collect();
                    println!(
                        "  {:<15} {} per source, {} total, threshold {}, {}s: {}",
                        name,
                        preset.max_papers_per_source,
                        preset.max_total_papers,
                        preset.minimum_relevance_score,
                        preset.timeout_seconds,
                        sources.join(", ")
                    );
                }
            }
        }

        Commands::Plan { preset } => {
            let mut settings = config.pipeline.clone();
            if let Some(preset) = preset {
                settings.preset = preset.clone();
            }
            let configuration = settings.configuration()?;
            let violations = configuration.validate();
            if !violations.is_empty() {
                anyhow::bail!("invalid preset '{}': {}", settings.preset, violations.join("; "));
            }
            let graph = StageGraph::build(&configuration.required_stages, &default_definitions())?;

            println!(
                "{}: {} stages, concurrency {}, timeout {} min",
                configuration.name,
                graph.len(),
                configuration.max_concurrent_agents,
                configuration.timeout_minutes
            );
            for (index, wave) in graph.waves().iter().enumerate() {
                let stages: Vec<String> = wave
                    .iter()
                    .filter_map(|stage| graph.definition(*stage))
                    .map(|d| {
                        let mut label = d.stage.id().to_string();
                        if configuration.stage_toggled_off(d.stage) {
                            label.push_str(" (skipped)");
                        } else if !d.parallel {
                            label.push_str(" (exclusive)");
                        }
                        label
                    })
                    .collect();
                println!("  wave {}: {}", index + 1, stages.join(", "));
            }
        }

        Commands::Config => {
            print!("{}", to_toml(&config)?);
        }
    }

    Ok(())
}
