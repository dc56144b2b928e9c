//! kubectl-mhc: A kubectl plugin for inspecting MachineHealthChecks
//!
//! This plugin provides convenient commands to interact with MachineHealthCheck resources:
//! - `kubectl mhc list` - List all MachineHealthCheck resources
//! - `kubectl mhc status [name]` - Show how many selected machines are healthy

use std::process;

use clap::{Parser, Subcommand};
use kube::{api::Api, Client, ResourceExt};
use serde::Serialize;

use machine_health_operator::crd::MachineHealthCheck;
use machine_health_operator::error::{Error, Result};

#[derive(Parser)]
#[command(name = "kubectl-mhc")]
#[command(about = "A kubectl plugin for inspecting MachineHealthChecks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace (defaults to "default")
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Output format (table, json, yaml)
    #[arg(short, long, global = true, default_value = "table")]
    output: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List all MachineHealthCheck resources
    List {
        /// Show all namespaces
        #[arg(short = 'A', long)]
        all_namespaces: bool,
    },
    /// Show the health of the machines selected by MachineHealthCheck(s)
    Status {
        /// Name of a specific MachineHealthCheck (optional, shows all if omitted)
        name: Option<String>,
        /// Show all namespaces
        #[arg(short = 'A', long)]
        all_namespaces: bool,
    },
}

/// Health summary of one MachineHealthCheck, as last recorded in its status
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct HealthSummary {
    name: String,
    namespace: String,
    cluster: String,
    expected_machines: i32,
    current_healthy: i32,
    unhealthy: i32,
    targets: Vec<String>,
    /// Whether the last pass saw the current generation
    up_to_date: bool,
}

impl HealthSummary {
    fn from_health_check(mhc: &MachineHealthCheck) -> Self {
        let status = mhc.status.clone().unwrap_or_default();
        let up_to_date = status.observed_generation.is_some()
            && status.observed_generation == mhc.metadata.generation;
        Self {
            name: mhc.name_any(),
            namespace: mhc.namespace().unwrap_or_else(|| "default".to_string()),
            cluster: mhc.spec.cluster_name.clone(),
            expected_machines: status.expected_machines,
            current_healthy: status.current_healthy,
            unhealthy: (status.expected_machines - status.current_healthy).max(0),
            targets: status.targets,
            up_to_date,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::try_default().await.map_err(Error::KubeError)?;

    match cli.command {
        Commands::List { all_namespaces } => {
            let health_checks =
                fetch(&client, None, all_namespaces, cli.namespace.as_deref()).await?;
            list(&health_checks, all_namespaces, &cli.output)
        }
        Commands::Status {
            name,
            all_namespaces,
        } => {
            let health_checks = fetch(
                &client,
                name.as_deref(),
                all_namespaces,
                cli.namespace.as_deref(),
            )
            .await?;
            let show_namespace = all_namespaces || (name.is_none() && cli.namespace.is_none());
            status(&health_checks, show_namespace, &cli.output)
        }
    }
}

async fn fetch(
    client: &Client,
    name: Option<&str>,
    all_namespaces: bool,
    namespace: Option<&str>,
) -> Result<Vec<MachineHealthCheck>> {
    let ns = namespace.unwrap_or("default");
    if let Some(name) = name {
        let api: Api<MachineHealthCheck> = Api::namespaced(client.clone(), ns);
        return Ok(vec![api.get(name).await.map_err(Error::KubeError)?]);
    }

    let api: Api<MachineHealthCheck> = if all_namespaces {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), ns)
    };
    Ok(api
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?
        .items)
}

/// Helper function to format values as JSON
fn format_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::ConfigError(format!("JSON serialization error: {}", e)))
}

/// Helper function to format values as YAML
fn format_yaml<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::ConfigError(format!("YAML serialization error: {}", e)))
}

/// Helper function to format the health check list as table
fn format_list_table(health_checks: &[MachineHealthCheck], show_namespace: bool) -> String {
    let mut out = String::new();
    if show_namespace {
        out.push_str(&format!(
            "{:<30} {:<15} {:<20} {:<10} {:<10}\n",
            "NAME", "NAMESPACE", "CLUSTER", "EXPECTED", "HEALTHY"
        ));
    } else {
        out.push_str(&format!(
            "{:<30} {:<20} {:<10} {:<10}\n",
            "NAME", "CLUSTER", "EXPECTED", "HEALTHY"
        ));
    }
    for mhc in health_checks {
        let summary = HealthSummary::from_health_check(mhc);
        if show_namespace {
            out.push_str(&format!(
                "{:<30} {:<15} {:<20} {:<10} {:<10}\n",
                summary.name,
                summary.namespace,
                summary.cluster,
                summary.expected_machines,
                summary.current_healthy
            ));
        } else {
            out.push_str(&format!(
                "{:<30} {:<20} {:<10} {:<10}\n",
                summary.name, summary.cluster, summary.expected_machines, summary.current_healthy
            ));
        }
    }
    out
}

/// List MachineHealthCheck resources
fn list(health_checks: &[MachineHealthCheck], all_namespaces: bool, output: &str) -> Result<()> {
    match output {
        "json" => println!("{}", format_json(health_checks)?),
        "yaml" => println!("{}", format_yaml(health_checks)?),
        _ => print!("{}", format_list_table(health_checks, all_namespaces)),
    }
    Ok(())
}

/// Show the health summary of MachineHealthCheck resources
fn status(health_checks: &[MachineHealthCheck], show_namespace: bool, output: &str) -> Result<()> {
    if health_checks.is_empty() {
        println!("No MachineHealthCheck resources found.");
        return Ok(());
    }

    let summaries: Vec<_> = health_checks
        .iter()
        .map(HealthSummary::from_health_check)
        .collect();

    match output {
        "json" => println!("{}", format_json(&summaries)?),
        "yaml" => println!("{}", format_yaml(&summaries)?),
        _ => {
            if show_namespace {
                println!(
                    "{:<30} {:<15} {:<10} {:<10} {:<10} {:<40}",
                    "NAME", "NAMESPACE", "EXPECTED", "HEALTHY", "UNHEALTHY", "TARGETS"
                );
            } else {
                println!(
                    "{:<30} {:<10} {:<10} {:<10} {:<40}",
                    "NAME", "EXPECTED", "HEALTHY", "UNHEALTHY", "TARGETS"
                );
            }
            for summary in summaries {
                let mut name = summary.name.clone();
                if !summary.up_to_date {
                    name.push('*');
                }
                let targets = summary.targets.join(",");
                if show_namespace {
                    println!(
                        "{:<30} {:<15} {:<10} {:<10} {:<10} {:<40}",
                        name,
                        summary.namespace,
                        summary.expected_machines,
                        summary.current_healthy,
                        summary.unhealthy,
                        targets
                    );
                } else {
                    println!(
                        "{:<30} {:<10} {:<10} {:<10} {:<40}",
                        name,
                        summary.expected_machines,
                        summary.current_healthy,
                        summary.unhealthy,
                        targets
                    );
                }
            }
        }
    }

    Ok(())
}
