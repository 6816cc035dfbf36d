use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for the run pipeline.
pub struct RunboardMetrics {
    /// Sessions opened by `create_session`.
    pub sessions_opened: IntCounter,
    /// Runs persisted by the leaderboard.
    pub runs_submitted: IntCounter,
    /// Submissions that improved the submitter's best time.
    pub personal_bests: IntCounter,
    /// Submissions that improved the cohort's best time.
    pub world_records: IntCounter,
    /// Notification rows written by activity fan-out.
    pub notifications_written: IntCounter,
    /// Completions rejected during validation.
    pub rejected_submissions: IntCounter,
    /// Version of the active XP systems snapshot.
    pub xp_config_version: IntGauge,
}

impl RunboardMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.sessions_opened.clone()))?;
        registry.register(Box::new(metrics.runs_submitted.clone()))?;
        registry.register(Box::new(metrics.personal_bests.clone()))?;
        registry.register(Box::new(metrics.world_records.clone()))?;
        registry.register(Box::new(metrics.notifications_written.clone()))?;
        registry.register(Box::new(metrics.rejected_submissions.clone()))?;
        registry.register(Box::new(metrics.xp_config_version.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric names")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            sessions_opened: IntCounter::with_opts(Opts::new(
                "runboard_sessions_opened_total",
                "Run sessions opened",
            ))?,
            runs_submitted: IntCounter::with_opts(Opts::new(
                "runboard_runs_submitted_total",
                "Runs persisted",
            ))?,
            personal_bests: IntCounter::with_opts(Opts::new(
                "runboard_personal_bests_total",
                "Submissions that set a personal best",
            ))?,
            world_records: IntCounter::with_opts(Opts::new(
                "runboard_world_records_total",
                "Submissions that set a world record",
            ))?,
            notifications_written: IntCounter::with_opts(Opts::new(
                "runboard_notifications_written_total",
                "Notification rows written",
            ))?,
            rejected_submissions: IntCounter::with_opts(Opts::new(
                "runboard_rejected_submissions_total",
                "Completions rejected by validation",
            ))?,
            xp_config_version: IntGauge::with_opts(Opts::new(
                "runboard_xp_config_version",
                "Version of the active XP systems config",
            ))?,
        })
    }
}
