#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use hindsight_bundle::{detect_cluster_version, detect_service_cidr, parse_major_minor, Bundle, ClusterVersion, DirBundle};
use hindsight_import::{import_bundle, ImportConfig, ImportSummary};
use hindsight_kubehub::KubeBackend;
use hindsight_proxy::{router, serve, KubeUpstream, ProxyState};
use hindsight_rewrite::{default_rewriter, ResourceRewriter};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hindsight", version, about = "Browse a support bundle through a live API server")]
struct Cli {
    /// Output format for summaries
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig of the backend API server (default: inferred)
    #[arg(long, env = "HINDSIGHT_KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, env = "HINDSIGHT_CONTEXT", global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load an extracted bundle into the backend
    Import {
        /// Extracted bundle directory
        bundle: PathBuf,
    },
    /// Serve the backend with bundle objects restored, importing first
    Serve {
        /// Extracted bundle directory
        bundle: PathBuf,
        /// Listen address
        #[arg(long, env = "HINDSIGHT_PROXY_ADDR", default_value = "localhost:8080")]
        addr: String,
        /// Seconds to drain in-flight requests on shutdown
        #[arg(long = "grace-secs", env = "HINDSIGHT_GRACE_SECS", default_value_t = 10)]
        grace_secs: u64,
        /// Serve a backend that was already imported
        #[arg(long = "skip-import", action = ArgAction::SetTrue)]
        skip_import: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("HINDSIGHT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HINDSIGHT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HINDSIGHT_METRICS_ADDR; expected host:port");
        }
    }
}

async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let options = KubeConfigOptions { context: context.map(str::to_string), ..Default::default() };
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &options).await.context("loading kubeconfig")?
        }
        None if context.is_some() => Config::from_kubeconfig(&options).await.context("loading kubeconfig")?,
        None => Config::infer().await.context("inferring kube config")?,
    };
    Client::try_from(config).context("creating kube client")
}

/// Reports the version the bundle was recorded from and warns when the
/// backend serves a different one.
async fn check_versions(bundle: &dyn Bundle, client: &Client) {
    let recorded = match detect_cluster_version(bundle) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "bundle has no usable cluster version");
            return;
        }
    };
    info!(version = %recorded, git_version = %recorded.git_version, "bundle recorded from cluster");
    match detect_service_cidr(bundle) {
        Ok(Some(cidr)) => info!(service_cidr = %cidr, "recorded service IP range; start the backend with the same range"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "bundle has no usable service IP range"),
    }
    match client.apiserver_version().await {
        Ok(info) => match parse_major_minor(&info.major, &info.minor) {
            Some(served) if !same_minor(&recorded, served) => {
                warn!(recorded = %recorded, served = %info.git_version, "backend version differs from the bundle's cluster")
            }
            Some(_) => {}
            None => warn!(major = %info.major, minor = %info.minor, "unparseable backend version"),
        },
        Err(e) => warn!(error = %e, "querying backend version failed"),
    }
}

fn same_minor(recorded: &ClusterVersion, served: (u32, u32)) -> bool {
    (recorded.major, recorded.minor) == served
}

fn spawn_shutdown(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown requested");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    match unix_signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; listening for Ctrl-C only");
            let _ = signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
}

fn report(summary: &ImportSummary, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            for f in &summary.failures {
                warn!(path = %f.path, object = ?f.object, error = %f.error, "not imported");
            }
            info!(%summary, "import finished");
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(summary)?),
    }
    Ok(())
}

async fn run_import(
    bundle: &dyn Bundle,
    client: &Client,
    rewriter: &dyn ResourceRewriter,
    cancel: CancellationToken,
    output: Output,
) -> Result<()> {
    let backend = KubeBackend::new(client.clone());
    let started = Instant::now();
    let summary = import_bundle(bundle, &backend, rewriter, &ImportConfig::default(), cancel)
        .await
        .context("importing bundle")?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "import complete");
    report(&summary, output)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    spawn_shutdown(cancel.clone());
    let client = connect(cli.kubeconfig.as_deref(), cli.context.as_deref()).await?;
    let rewriter = Arc::new(default_rewriter());

    match cli.command {
        Commands::Import { bundle } => {
            let bundle = DirBundle::open(&bundle).with_context(|| format!("opening bundle {}", bundle.display()))?;
            check_versions(&bundle, &client).await;
            run_import(&bundle, &client, rewriter.as_ref(), cancel, cli.output).await?;
        }
        Commands::Serve { bundle, addr, grace_secs, skip_import } => {
            let bundle = Arc::new(
                DirBundle::open(&bundle).with_context(|| format!("opening bundle {}", bundle.display()))?,
            );
            check_versions(bundle.as_ref(), &client).await;
            if skip_import {
                info!("skipping import");
            } else {
                run_import(bundle.as_ref(), &client, rewriter.as_ref(), cancel.clone(), cli.output).await?;
            }
            let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {}", addr))?;
            let state = ProxyState::new(bundle, rewriter, Arc::new(KubeUpstream::new(client)));
            serve(listener, router(state), cancel, Duration::from_secs(grace_secs)).await?;
            info!("proxy stopped");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["hindsight", "serve", "/tmp/bundle"]).unwrap();
        match cli.command {
            Commands::Serve { addr, grace_secs, skip_import, .. } => {
                assert!(addr.ends_with(":8080"));
                assert_eq!(grace_secs, 10);
                assert!(!skip_import);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
