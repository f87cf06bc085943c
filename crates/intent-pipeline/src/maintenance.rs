//! Periodic background jobs.
//!
//! Each task runs on its own interval loop. A failing run is logged and the
//! loop carries on with the next tick.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::MaintenanceConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::IntentPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTask {
    RecomputeTransitions,
    SweepSessions,
    SweepTokens,
    RunLearning,
}

impl MaintenanceTask {
    pub const ALL: [MaintenanceTask; 4] = [
        Self::RecomputeTransitions,
        Self::SweepSessions,
        Self::SweepTokens,
        Self::RunLearning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecomputeTransitions => "recompute-transitions",
            Self::SweepSessions => "sweep-sessions",
            Self::SweepTokens => "sweep-tokens",
            Self::RunLearning => "run-learning",
        }
    }

    pub fn interval(&self, config: &MaintenanceConfig) -> Duration {
        let secs = match self {
            Self::RecomputeTransitions => config.transition_recompute_secs,
            Self::SweepSessions => config.session_sweep_secs,
            Self::SweepTokens => config.token_sweep_secs,
            Self::RunLearning => config.learning_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

impl std::fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaintenanceTask {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PipelineError::Config(format!("unknown maintenance task: {s}")))
    }
}

/// Run one task now. Returns how many items it touched.
pub async fn run_once(pipeline: &IntentPipeline, task: MaintenanceTask) -> PipelineResult<usize> {
    let now = Utc::now();
    match task {
        MaintenanceTask::RecomputeTransitions => pipeline.recompute_transitions(now).await,
        MaintenanceTask::SweepSessions => pipeline.sweep_sessions(now).await,
        MaintenanceTask::SweepTokens => pipeline.sweep_tokens(now).await,
        MaintenanceTask::RunLearning => pipeline.run_learning(now).await.map(|r| r.suggestions),
    }
}

/// Spawn one loop per task. The handles run until aborted.
pub fn spawn_all(pipeline: Arc<IntentPipeline>, config: &MaintenanceConfig) -> Vec<JoinHandle<()>> {
    MaintenanceTask::ALL
        .into_iter()
        .map(|task| {
            let pipeline = pipeline.clone();
            let every = task.interval(config);
            tokio::spawn(async move { run_loop(&pipeline, task, every).await })
        })
        .collect()
}

async fn run_loop(pipeline: &IntentPipeline, task: MaintenanceTask, every: Duration) {
    let mut ticker = time::interval(every);
    // First tick fires immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match run_once(pipeline, task).await {
            Ok(n) => tracing::debug!(task = %task, affected = n, "maintenance run finished"),
            Err(e) => tracing::warn!(task = %task, error = %e, "maintenance run failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::PipelineConfig;
    use crate::mock::RecordingExecutor;
    use crate::pipeline::{Resolution, Services, Stores};
    use intent_protocol::RequestContext;

    #[test]
    fn parses_both_spellings() {
        assert_eq!(
            "sweep-tokens".parse::<MaintenanceTask>().unwrap(),
            MaintenanceTask::SweepTokens
        );
        assert_eq!(
            "recompute_transitions".parse::<MaintenanceTask>().unwrap(),
            MaintenanceTask::RecomputeTransitions
        );
        assert!("vacuum".parse::<MaintenanceTask>().is_err());
    }

    #[test]
    fn intervals_follow_config() {
        let config = MaintenanceConfig::default();
        assert_eq!(
            MaintenanceTask::RunLearning.interval(&config),
            Duration::from_secs(86_400)
        );
        assert_eq!(
            MaintenanceTask::SweepSessions.interval(&config),
            Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loops_survive_ticks_and_leave_fresh_tokens() {
        let pipeline = Arc::new(IntentPipeline::new(
            PipelineConfig::default(),
            Arc::new(InMemoryCatalog::factory_defaults()),
            Services::new(Arc::new(RecordingExecutor::new())),
            Stores::in_memory(),
        ));
        let ctx = RequestContext::new("f1", "u1", "factory_admin");
        let token = match pipeline.resolve_intent(&ctx, "报废批次MB-20240301").await.unwrap() {
            Resolution::Preview(t) => t,
            other => panic!("expected preview, got {other:?}"),
        };

        let handles = spawn_all(
            pipeline.clone(),
            &MaintenanceConfig {
                token_sweep_secs: 2,
                session_sweep_secs: 2,
                ..MaintenanceConfig::default()
            },
        );
        time::sleep(Duration::from_secs(5)).await;
        assert!(handles.iter().all(|h| !h.is_finished()));

        // The token is well within its TTL.
        assert_eq!(run_once(&pipeline, MaintenanceTask::SweepTokens).await.unwrap(), 0);
        let swept = pipeline
            .sweep_tokens(token.expires_at + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        for h in handles {
            h.abort();
        }
    }
}
