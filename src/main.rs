//! xds-snapshot binary

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use xds_snapshot::cli::{Cli, LogFormat};
use xds_snapshot::k8s::{FileIdentitySource, IdentitySource, KubeIdentitySource, DEFAULT_TOKEN_TTL};
use xds_snapshot::output::render;
use xds_snapshot::session::{gather_inputs, take_snapshot};
use xds_snapshot::{Error, ErrorCategory};

#[tokio::main]
async fn main() -> ExitCode {
    // The Kubernetes client and our TLS channels both need a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {:?}", e);
        return ExitCode::from(70);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Snapshot run failed");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config();
    config.validate()?;
    let identity = cli.identity()?;
    let node_id = cli.node_id()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting run");
            on_signal.cancel();
        }
    });

    let cluster: Option<Arc<dyn IdentitySource>> = if cli.needs_cluster() {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;
        Some(Arc::new(KubeIdentitySource::new(
            client,
            cli.istio_namespace.clone(),
            DEFAULT_TOKEN_TTL,
        )))
    } else {
        None
    };
    let source = FileIdentitySource::new(cli.trust_anchor.clone(), cli.token_file.clone(), cluster);

    let inputs = gather_inputs(&source, node_id, identity, &cancel).await?;
    let snapshot = take_snapshot(&config, inputs, &cancel).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    render(&snapshot, cli.output, &mut out)?;
    out.flush()?;

    if !snapshot.is_complete() {
        warn!(
            decode_errors = snapshot.decode_errors().count(),
            "Some resources could not be decoded"
        );
    }
    Ok(())
}

/// Exit code per error category
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<Error>().map(Error::category) {
        Some(ErrorCategory::Configuration) => 2,
        Some(ErrorCategory::Transport) => 3,
        Some(ErrorCategory::Trust) => 4,
        Some(ErrorCategory::ClockSkew) => 5,
        Some(ErrorCategory::Aborted) => 130,
        None => 1,
    }
}
