mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use codeflow_core::config::{AppConfig, StoreBackend};
use codeflow_core::event::EventBus;
use codeflow_core::graph::{NodeKind, WorkflowGraph};
use codeflow_core::types::{RunContext, WorkflowSpec};
use codeflow_engine::{Engine, Outbound};
use codeflow_store::{SqliteStore, Stores};

#[derive(Parser)]
#[command(name = "codeflow", version, about = "Workflow engine for AI coding agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "codeflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow file and print every structural error
    Validate {
        /// Workflow file (.toml or .json)
        file: PathBuf,
    },
    /// Drive a workflow to completion with simulated agents
    Run {
        /// Workflow file (.toml or .json)
        file: PathBuf,
        /// Number of simulated agents
        #[arg(short, long, default_value_t = 2)]
        agents: usize,
        /// Run context entries; values are parsed as JSON when possible
        #[arg(long = "context", value_name = "KEY=VALUE", value_parser = parse_context_entry)]
        context: Vec<(String, serde_json::Value)>,
        /// Chance that a simulated agent fails its task
        #[arg(long, default_value_t = 0.0, value_parser = parse_rate)]
        fail_rate: f64,
    },
    /// Print nodes, successors and parallel/join pairing
    Inspect {
        /// Workflow file (.toml or .json)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Inspect { file } => inspect(&file),
        Commands::Run {
            file,
            agents,
            context,
            fail_rate,
        } => {
            let spec = load_workflow(&file)?;
            let engine = build_engine(&config)?;
            let context: RunContext = context.into_iter().collect();
            simulate::run(&engine, spec, agents, context, fail_rate).await
        }
    }
}

fn build_engine(config: &AppConfig) -> anyhow::Result<Engine> {
    let stores = match config.store.backend {
        StoreBackend::Memory => Stores::memory(),
        StoreBackend::Sqlite => {
            let path = config.store.resolved_path();
            info!(path = %path.display(), "Opening SQLite store");
            Stores::sqlite(Arc::new(SqliteStore::open(&path)?))
        }
    };
    let bus = Arc::new(EventBus::new(config.notifier.buffer));
    Ok(Engine::new(stores, Outbound::local(bus), config.engine.clone()))
}

/// Read a workflow file. Accepts a full workflow (`name` plus `graph`) or a
/// bare graph document, in which case the file stem names the workflow.
fn load_workflow(path: &Path) -> anyhow::Result<WorkflowSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read workflow file {}", path.display()))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");

    let spec = if is_json {
        serde_json::from_str::<WorkflowSpec>(&content)
            .or_else(|_| serde_json::from_str::<WorkflowGraph>(&content).map(|g| bare(path, g)))
            .with_context(|| format!("{} is not a workflow document", path.display()))?
    } else {
        toml::from_str::<WorkflowSpec>(&content)
            .or_else(|_| toml::from_str::<WorkflowGraph>(&content).map(|g| bare(path, g)))
            .with_context(|| format!("{} is not a workflow document", path.display()))?
    };
    if spec.graph.is_empty() {
        warn!(file = %path.display(), "Workflow file has no nodes");
    }
    Ok(spec)
}

fn bare(path: &Path, graph: WorkflowGraph) -> WorkflowSpec {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workflow".to_string());
    WorkflowSpec::new(name, graph)
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let spec = load_workflow(file)?;
    let result = spec.graph.validate();
    if result.is_valid() {
        println!("{}: valid ({} nodes)", spec.name, spec.graph.len());
        return Ok(());
    }
    println!("{}: {} problem(s)", spec.name, result.errors.len());
    for error in &result.errors {
        println!("  - {error}");
    }
    anyhow::bail!("workflow {} is malformed", spec.name)
}

fn inspect(file: &Path) -> anyhow::Result<()> {
    let spec = load_workflow(file)?;
    let graph = &spec.graph;
    println!("Workflow: {}", spec.name);
    if let Some(description) = &spec.description {
        println!("  {description}");
    }
    println!();

    for node in graph.nodes() {
        let detail = match &node.kind {
            NodeKind::Task { template } if !template.required_capabilities.is_empty() => {
                let caps: Vec<&str> = template
                    .required_capabilities
                    .iter()
                    .map(String::as_str)
                    .collect();
                format!(" [needs: {}]", caps.join(", "))
            }
            NodeKind::Condition { expr } => format!(" [if {expr}]"),
            _ => String::new(),
        };
        let next: Vec<&str> = node.outgoing.iter().map(|n| n.as_str()).collect();
        let next = if next.is_empty() {
            "-".to_string()
        } else {
            next.join(", ")
        };
        println!(
            "{:<16} {:<10} -> {}{}",
            node.id.as_str(),
            node.kind.name(),
            next,
            detail
        );
    }

    let regions = graph.parallel_regions();
    if !regions.is_empty() {
        println!();
        println!("Parallel regions:");
        for (parallel, join) in &regions {
            println!("  {parallel} => {join}");
        }
    }

    let validation = graph.validate();
    if !validation.is_valid() {
        println!();
        println!(
            "{} structural problem(s); run `codeflow validate` for details",
            validation.errors.len()
        );
    }
    Ok(())
}

fn parse_context_entry(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_rate(raw: &str) -> Result<f64, String> {
    let rate: f64 = raw.parse().map_err(|_| format!("`{raw}` is not a number"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("rate must be between 0 and 1, got {rate}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_context_entry() {
        let (key, value) = parse_context_entry("tests_passed=true").unwrap();
        assert_eq!(key, "tests_passed");
        assert_eq!(value, serde_json::Value::Bool(true));

        let (_, value) = parse_context_entry("branch=main").unwrap();
        assert_eq!(value, serde_json::Value::String("main".into()));

        let (_, value) = parse_context_entry("coverage=0.8").unwrap();
        assert_eq!(value, serde_json::json!(0.8));

        assert!(parse_context_entry("novalue").is_err());
        assert!(parse_context_entry("=1").is_err());
    }

    #[test]
    fn test_parse_rate_bounds() {
        assert_eq!(parse_rate("0.25").unwrap(), 0.25);
        assert!(parse_rate("1.5").is_err());
        assert!(parse_rate("-0.1").is_err());
        assert!(parse_rate("often").is_err());
    }

    #[test]
    fn test_load_bare_graph_uses_file_stem() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[[nodes]]
id = "start"
kind = "start"
outgoing = ["end"]

[[nodes]]
id = "end"
kind = "end"
"#
        )
        .unwrap();

        let spec = load_workflow(file.path()).unwrap();
        let stem = file.path().file_stem().unwrap().to_string_lossy().into_owned();
        assert_eq!(spec.name, stem);
        assert_eq!(spec.graph.len(), 2);
        assert!(spec.graph.validate().is_valid());
    }

    #[test]
    fn test_demo_workflow_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/feature.toml");
        let spec = load_workflow(&path).unwrap();
        assert_eq!(spec.name, "feature");
        assert!(spec.graph.validate().is_valid());
        let regions = spec.graph.parallel_regions();
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn test_load_full_workflow_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"name":"review","graph":{{"nodes":[
                {{"id":"s","kind":"start","outgoing":["t"]}},
                {{"id":"t","kind":"task","template":{{"required_capabilities":["rust"]}},"outgoing":["e"]}},
                {{"id":"e","kind":"end"}}
            ]}}}}"#
        )
        .unwrap();

        let spec = load_workflow(file.path()).unwrap();
        assert_eq!(spec.name, "review");
        assert!(spec.triggers.contains("manual"));
        assert!(spec.graph.validate().is_valid());
    }
}
