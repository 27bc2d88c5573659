use std::time::Duration;

use clap::Parser;
use contour_operator::config::{OperatorConfig, DEFAULT_CONTOUR_IMAGE, DEFAULT_ENVOY_IMAGE};
use contour_operator::controllers::contour_controller::{self, State};
use contour_operator::util::telemetry::{self, LogFormat};
use tracing::info;

mod handlers;
mod server;

#[derive(Parser, Debug)]
#[command(author, version, about = "Manages Contour and Envoy for Contour custom resources", long_about = None)]
struct Cli {
    /// Image of the Contour control plane and the certgen Job
    #[arg(long, env = "CONTOUR_IMAGE", default_value = DEFAULT_CONTOUR_IMAGE)]
    contour_image: String,

    /// Image of the Envoy data plane
    #[arg(long, env = "ENVOY_IMAGE", default_value = DEFAULT_ENVOY_IMAGE)]
    envoy_image: String,

    /// Address of the health, metrics and diagnostics server
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// compact or json
    #[arg(long, env = "LOG_FORMAT", default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[arg(long, env = "JOB_POLL_INTERVAL_SECS", default_value_t = 1)]
    job_poll_interval_secs: u64,

    #[arg(long, env = "JOB_POLL_TIMEOUT_SECS", default_value_t = 10)]
    job_poll_timeout_secs: u64,

    /// Requeue delay after a successful pass
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    resync_interval_secs: u64,

    /// Requeue delay after a failed pass
    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value_t = 60)]
    error_requeue_secs: u64,
}

impl Cli {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            contour_image: self.contour_image.clone(),
            envoy_image: self.envoy_image.clone(),
            job_poll_interval: Duration::from_secs(self.job_poll_interval_secs),
            job_poll_timeout: Duration::from_secs(self.job_poll_timeout_secs),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format)?;

    let config = cli.operator_config();
    info!(
        "Starting contour-operator with Contour image {} and Envoy image {}",
        config.contour_image, config.envoy_image
    );

    let client = kube::Client::try_default().await?;

    // Initiatilize Kubernetes controller state
    let state = State::default();
    let controller = contour_controller::run(state.clone(), client, config);

    // Start web server
    let server = server::build_server(state, &cli.metrics_addr)?;

    // Both runtimes implements graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server);
    controller.map_err(|e| anyhow::anyhow!("controller failed: {e}"))?;
    server?;
    Ok(())
}
