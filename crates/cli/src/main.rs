use anyhow::Context;
use clap::{Parser, Subcommand};
use lis_core::handlers::MemoryLineInserter;
use lis_core::seed::load_seed_file;
use lis_core::{CoreConfig, Engine};
use lis_uuid::EntityId;
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lis")]
#[command(about = "Analyzer integration engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse the Q (QC) segments of an ASTM message
    ParseQc {
        /// ASTM message file
        file: PathBuf,
    },
    /// Parse an HL7 ORU^R01 result message
    ParseOru {
        /// HL7 message file
        file: PathBuf,
    },
    /// Render an HL7 ORM^O01 order from a YAML order request
    GenerateOrm {
        /// Order request YAML
        yaml: PathBuf,
    },
    /// Identify the analyzer and handler for a message
    Route {
        /// Seed YAML with analyzers and handlers
        #[arg(long)]
        seed: PathBuf,
        /// Source IP the message arrived from
        #[arg(long)]
        ip: Option<IpAddr>,
        /// Message file
        file: PathBuf,
    },
    /// Run a message through the full ingest pipeline
    Ingest {
        /// Seed YAML with analyzers and handlers
        #[arg(long)]
        seed: PathBuf,
        /// Source IP the message arrived from
        #[arg(long)]
        ip: Option<IpAddr>,
        /// Message file
        file: PathBuf,
    },
    /// Apply an analyzer's active mappings to a message
    Apply {
        /// Seed YAML with analyzers and mappings
        #[arg(long)]
        seed: PathBuf,
        /// Analyzer id
        analyzer_id: String,
        /// ASTM message file
        file: PathBuf,
    },
    /// Preview how an analyzer's mappings interpret a message
    Preview {
        /// Seed YAML with analyzers and mappings
        #[arg(long)]
        seed: PathBuf,
        /// Analyzer id
        analyzer_id: String,
        /// ASTM message file
        file: PathBuf,
    },
    /// Check whether an analyzer's configuration can be activated
    ValidateActivation {
        /// Seed YAML with analyzers and mappings
        #[arg(long)]
        seed: PathBuf,
        /// Analyzer id
        analyzer_id: String,
    },
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn engine(seed: &Path) -> anyhow::Result<Engine> {
    let seed = load_seed_file(seed)?;
    Ok(Engine::from_seed(
        Arc::new(CoreConfig::default()),
        seed,
        Arc::new(MemoryLineInserter::default()),
        None,
    )?)
}

fn message_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = read(path)?;
    Ok(astm::split_lines(&text)
        .into_iter()
        .map(String::from)
        .collect())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::ParseQc { file }) => {
            let segments = astm::parse_q_segments(&read(&file)?)?;
            if segments.is_empty() {
                println!("No QC segments found.");
            } else {
                print_json(&segments)?;
            }
        }
        Some(Commands::ParseOru { file }) => {
            print_json(&hl7::parse_oru_r01(&read(&file)?)?)?;
        }
        Some(Commands::GenerateOrm { yaml }) => {
            let request: hl7::OrderRequest = serde_yaml::from_str(&read(&yaml)?)
                .with_context(|| format!("invalid order request in {}", yaml.display()))?;
            let message = hl7::generate_orm_o01(Some(&request))?;
            for segment in message.split('\r').filter(|s| !s.is_empty()) {
                println!("{segment}");
            }
        }
        Some(Commands::Route { seed, ip, file }) => {
            let engine = engine(&seed)?;
            let routed = engine.router().route(ip, &message_lines(&file)?)?;
            match (&routed.analyzer, &routed.handler) {
                (Some(analyzer), Some(handler)) => println!(
                    "{}: analyzer {} ({}) via handler '{}'",
                    routed.method,
                    analyzer.id,
                    analyzer.name,
                    handler.name()
                ),
                _ => println!("{}: no analyzer matched", routed.method),
            }
        }
        Some(Commands::Ingest { seed, ip, file }) => {
            let engine = engine(&seed)?;
            let outcome = engine.pipeline().ingest(ip, &read(&file)?)?;
            print_json(&outcome)?;
        }
        Some(Commands::Apply {
            seed,
            analyzer_id,
            file,
        }) => {
            let engine = engine(&seed)?;
            let analyzer_id = EntityId::parse(&analyzer_id)?;
            let result = engine
                .mapping_engine()
                .apply(analyzer_id, &message_lines(&file)?)?;
            print_json(&result)?;
        }
        Some(Commands::Preview {
            seed,
            analyzer_id,
            file,
        }) => {
            let engine = engine(&seed)?;
            let analyzer_id = EntityId::parse(&analyzer_id)?;
            let preview = engine
                .preview()
                .preview_mapping(analyzer_id, &read(&file)?)?;
            print_json(&preview)?;
        }
        Some(Commands::ValidateActivation { seed, analyzer_id }) => {
            let engine = engine(&seed)?;
            let analyzer_id = EntityId::parse(&analyzer_id)?;
            print_json(&engine.mappings().validate_activation(analyzer_id)?)?;
        }
        None => {
            println!("Use 'lis --help' for commands");
        }
    }

    Ok(())
}
