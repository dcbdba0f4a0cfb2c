#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kctl_api::{DeleteRequest, DeleteStatus, InProcApi, KctlApi, UpdateRequest, UpdateResponse, UpdateStatus};
use kctl_core::{RecreateConfig, ResourceKind};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kctl", version, about = "Recreate-update pods, jobs and cronjobs")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: KCTL_NAMESPACE or "default")
    #[arg(long = "ns", global = true, env = "KCTL_NAMESPACE")]
    namespace: Option<String>,

    /// Seconds to wait for a deletion to be observed (default: KCTL_DELETE_TIMEOUT_SECS or 30)
    #[arg(long = "timeout", global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the object from a manifest, or delete and recreate it if it exists
    Update {
        /// Manifest file (YAML or JSON); "-" reads stdin
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Kind to assume when the manifest has none (pod, job, cronjob)
        #[arg(long = "kind", value_parser = parse_kind)]
        kind: Option<ResourceKind>,
    },
    /// Dry-run a manifest without touching the live object
    Validate {
        #[arg(short = 'f', long = "file")]
        file: String,
        #[arg(long = "kind", value_parser = parse_kind)]
        kind: Option<ResourceKind>,
    },
    /// Delete an object, wait until it is gone and clean up its pods
    Delete {
        /// pod, job or cronjob
        #[arg(value_parser = parse_kind)]
        kind: ResourceKind,
        name: String,
    },
}

fn parse_kind(s: &str) -> Result<ResourceKind, String> {
    ResourceKind::parse(s).ok_or_else(|| format!("unsupported kind '{}'; expected pod, job or cronjob", s))
}

/// kctl's own progress at info; kube/hyper chatter only when something goes wrong.
const DEFAULT_LOG: &str = "warn,kctl=info,kctl_api=info,kctl_ops=info";

fn init_tracing() {
    let env = std::env::var("KCTL_LOG").unwrap_or_else(|_| DEFAULT_LOG.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| {
        eprintln!("invalid KCTL_LOG '{}', using '{}'", env, DEFAULT_LOG);
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG)
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KCTL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KCTL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Flags win over `KCTL_*`; timeouts are clamped like env values.
fn apply_flags(cli: &Cli, mut config: RecreateConfig) -> RecreateConfig {
    if let Some(ns) = cli.namespace.clone() {
        config.default_namespace = ns;
    }
    if let Some(secs) = cli.timeout_secs {
        config.deletion_timeout = RecreateConfig::clamp_timeout(Duration::from_secs(secs));
    }
    config
}

fn read_request(file: &str, kind: Option<ResourceKind>) -> Result<UpdateRequest> {
    let text = if file == "-" {
        std::io::read_to_string(std::io::stdin()).context("reading manifest from stdin")?
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?
    };
    let mut req = UpdateRequest::from_yaml(&text)?;
    req.kind = kind;
    Ok(req)
}

fn print_update(out: Output, resp: &UpdateResponse) -> Result<()> {
    match out {
        Output::Json => println!("{}", serde_json::to_string_pretty(resp)?),
        Output::Human => {
            println!("{} ({})", resp.message, resp.code);
            if let Some(n) = resp.swept {
                println!("swept {} pod(s)", n);
            }
            for e in &resp.sweep_errors {
                println!("sweep error: {}", e);
            }
            if resp.object_absent {
                println!("warning: the previous object was deleted and the new one was not created");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = apply_flags(&cli, RecreateConfig::from_env());
    let api = InProcApi::connect(config).await?;

    let ok = match cli.command {
        Commands::Update { file, kind } => {
            let req = read_request(&file, kind)?;
            info!(file = %file, "update invoked");
            let resp = api.update(req).await?;
            print_update(cli.output, &resp)?;
            matches!(resp.status, UpdateStatus::Created | UpdateStatus::Recreated)
        }
        Commands::Validate { file, kind } => {
            let req = read_request(&file, kind)?;
            match api.validate(req).await {
                Ok(()) => {
                    match cli.output {
                        Output::Human => println!("valid"),
                        Output::Json => println!("{}", serde_json::json!({ "valid": true })),
                    }
                    true
                }
                Err(e) => {
                    error!(error = %e, "validate failed");
                    match cli.output {
                        Output::Human => eprintln!("invalid: {}", e),
                        Output::Json => println!("{}", serde_json::json!({ "valid": false, "error": e })),
                    }
                    false
                }
            }
        }
        Commands::Delete { kind, name } => {
            let req = DeleteRequest { kind, namespace: cli.namespace.clone(), name, timeout: None };
            let resp = api.delete(req).await?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
                Output::Human => {
                    println!("{} ({})", resp.message, resp.code);
                    if let Some(n) = resp.swept {
                        println!("swept {} pod(s)", n);
                    }
                    for e in &resp.sweep_errors {
                        println!("sweep error: {}", e);
                    }
                }
            }
            resp.status == DeleteStatus::Deleted
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_flag_is_clamped() {
        let cli = Cli::try_parse_from(["kctl", "--timeout", "0", "delete", "pod", "y"]).expect("parses");
        let cfg = apply_flags(&cli, RecreateConfig::default());
        assert_eq!(cfg.deletion_timeout, Duration::from_secs(1));

        let cli = Cli::try_parse_from(["kctl", "delete", "job", "y", "--timeout", "12"]).expect("parses");
        assert_eq!(apply_flags(&cli, RecreateConfig::default()).deletion_timeout, Duration::from_secs(12));
    }

    #[test]
    fn invalid_timeout_env_does_not_abort_parsing() {
        std::env::set_var("KCTL_DELETE_TIMEOUT_SECS", "abc");
        let cli = Cli::try_parse_from(["kctl", "delete", "pod", "y"]).expect("env is not read by the parser");
        assert_eq!(cli.timeout_secs, None);
        let cfg = apply_flags(&cli, RecreateConfig::from_env());
        std::env::remove_var("KCTL_DELETE_TIMEOUT_SECS");
        assert_eq!(cfg.deletion_timeout, RecreateConfig::default().deletion_timeout);
    }

    #[test]
    fn kinds_parse_from_short_and_plural_forms() {
        let cli = Cli::try_parse_from(["kctl", "delete", "cj", "nightly"]).expect("parses");
        assert!(matches!(cli.command, Commands::Delete { kind: ResourceKind::CronJob, .. }));
        assert!(Cli::try_parse_from(["kctl", "delete", "deployment", "x"]).is_err());
    }
}
