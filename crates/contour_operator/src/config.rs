use tokio::time::Duration;

pub const DEFAULT_CONTOUR_IMAGE: &str = "ghcr.io/projectcontour/contour:v1.28.0";
pub const DEFAULT_ENVOY_IMAGE: &str = "docker.io/envoyproxy/envoy:v1.29.1";

/// Operator-wide settings that are not part of any `Contour`.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    pub contour_image: String,
    pub envoy_image: String,
    /// Interval between certgen Job creation attempts while the old Job terminates.
    pub job_poll_interval: Duration,
    /// Give up recreating the certgen Job after this long and retry on the next pass.
    pub job_poll_timeout: Duration,
    /// Requeue delay after a successful pass.
    pub resync_interval: Duration,
    /// Requeue delay after a failed pass.
    pub error_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            contour_image: DEFAULT_CONTOUR_IMAGE.to_string(),
            envoy_image: DEFAULT_ENVOY_IMAGE.to_string(),
            job_poll_interval: Duration::from_secs(1),
            job_poll_timeout: Duration::from_secs(10),
            resync_interval: Duration::from_secs(5 * 60),
            error_requeue: Duration::from_secs(60),
        }
    }
}
