//! Health scoring.

mod score;

pub use score::{overall_score, score_device, worst_status, GpuHealth, HealthIssue, HealthStatus};
