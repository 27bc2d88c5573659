pub mod contour_status;
pub mod errors;
pub mod labels;
pub mod metrics;
pub mod telemetry;
