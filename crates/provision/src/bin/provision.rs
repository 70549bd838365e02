//! Provision CLI - cluster instance provisioning for CTO Platform.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cto_provision::{
    Credentials, Ec2, InstanceState, NodeTemplate, Provisioner, SshWaitConfig, SSH_PORT,
};

/// Provision CLI - create, resume, stop and terminate cluster instances.
#[derive(Parser)]
#[command(name = "provision")]
#[command(about = "Provision and manage cluster instances on EC2")]
struct Cli {
    /// AWS access key ID (or set `AWS_ACCESS_KEY_ID` env var).
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: String,

    /// AWS secret access key (or set `AWS_SECRET_ACCESS_KEY` env var).
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: String,

    /// AWS session token (or set `AWS_SESSION_TOKEN` env var).
    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,

    /// AWS region (e.g., us-east-1).
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Override the EC2 endpoint URL.
    #[arg(long, env = "EC2_ENDPOINT_URL")]
    endpoint: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resume stopped instances and launch new ones until `count` are up.
    Up {
        /// Cluster name.
        #[arg(long)]
        cluster: String,

        /// Number of instances to bring up.
        #[arg(long)]
        count: usize,

        /// Node template (YAML or JSON).
        #[arg(long)]
        template: PathBuf,

        /// Extra instance tags (repeatable, `key=value`).
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,

        /// Always launch new instances instead of resuming stopped ones.
        #[arg(long, default_value = "false")]
        no_resume: bool,
    },

    /// Stop the running instances of a cluster.
    Stop {
        /// Cluster name.
        #[arg(long)]
        cluster: String,
    },

    /// Terminate every instance of a cluster.
    Terminate {
        /// Cluster name.
        #[arg(long)]
        cluster: String,
    },

    /// Wait until every instance of a cluster reaches a state.
    Wait {
        /// Cluster name.
        #[arg(long)]
        cluster: String,

        /// Target state (running, stopped, terminated).
        #[arg(long)]
        state: InstanceState,
    },

    /// Wait until every running instance of a cluster serves SSH.
    WaitSsh {
        /// Cluster name.
        #[arg(long)]
        cluster: String,

        /// Probe private instead of public addresses.
        #[arg(long, default_value = "false")]
        private: bool,

        /// SSH port.
        #[arg(long, default_value_t = SSH_PORT)]
        port: u16,

        /// Give up after this many seconds (waits indefinitely if unset).
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Show private and public IPs of the running instances of a cluster.
    Ips {
        /// Cluster name.
        #[arg(long)]
        cluster: String,
    },

    /// List every instance in the region.
    Describe,
}

fn parse_tag(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid tag '{s}': expected key=value"))?;
    if key.is_empty() {
        return Err(format!("invalid tag '{s}': empty key"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Create provider
    let mut credentials = Credentials::new(cli.access_key_id, cli.secret_access_key);
    if let Some(token) = cli.session_token {
        credentials = credentials.with_session_token(token);
    }
    let mut ec2 = Ec2::new(credentials).context("Failed to create EC2 client")?;
    if let Some(endpoint) = cli.endpoint {
        ec2 = ec2.with_endpoint(endpoint);
    }
    let provisioner = Provisioner::new(ec2);
    let region = cli.region.as_str();

    match cli.command {
        Commands::Up {
            cluster,
            count,
            template,
            tags,
            no_resume,
        } => {
            let template = NodeTemplate::from_file(&template)
                .with_context(|| format!("Failed to load template {}", template.display()))?;
            let tags: BTreeMap<String, String> = tags.into_iter().collect();

            let nodes = provisioner
                .ensure_count(region, &cluster, &template, &tags, count, !no_resume)
                .await
                .with_context(|| format!("Failed to bring up cluster {cluster}"))?;
            info!(cluster = %cluster, instances = nodes.len(), "Cluster instances up");
            print_json(&nodes)?;
        }

        Commands::Stop { cluster } => {
            let ids = provisioner
                .stop_instances(region, &cluster)
                .await
                .with_context(|| format!("Failed to stop cluster {cluster}"))?;
            print_json(&ids)?;
        }

        Commands::Terminate { cluster } => {
            let ids = provisioner
                .terminate_instances(region, &cluster)
                .await
                .with_context(|| format!("Failed to terminate cluster {cluster}"))?;
            print_json(&ids)?;
        }

        Commands::Wait { cluster, state } => {
            provisioner
                .wait_instances(region, &cluster, state)
                .await
                .with_context(|| format!("Failed waiting for cluster {cluster} to be {state}"))?;
            info!(cluster = %cluster, state = %state, "Cluster reached state");
        }

        Commands::WaitSsh {
            cluster,
            private,
            port,
            timeout_secs,
        } => {
            let config = SshWaitConfig {
                port,
                deadline: timeout_secs.map(Duration::from_secs),
                ..SshWaitConfig::default()
            };
            let addresses = provisioner
                .wait_for_ssh(region, &cluster, private, config)
                .await
                .with_context(|| format!("Failed waiting for SSH on cluster {cluster}"))?;
            print_json(&addresses)?;
        }

        Commands::Ips { cluster } => {
            let ips = provisioner
                .instance_ips(region, &cluster)
                .await
                .with_context(|| format!("Failed to get IPs of cluster {cluster}"))?;
            print_json(&ips)?;
        }

        Commands::Describe => {
            let instances = provisioner
                .describe_instances(region)
                .await
                .context("Failed to describe instances")?;
            print_json(&instances)?;
        }
    }

    Ok(())
}
