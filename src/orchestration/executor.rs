//! # Round Executor
//!
//! Runs every command of one round concurrently under a per-round
//! concurrency limit and folds the per-command outcomes into a single
//! round outcome.
//!
//! Failure semantics:
//! - First fatal outcome cancels the round; commands still waiting for a
//!   permit report a benign success so they never mask the fatal.
//! - Transient connection failures are retried in place up to the
//!   configured budget before hardening into a fatal.
//! - The whole round runs under a wall-clock timeout; expiry cancels all
//!   in-flight commands and reports a retryable outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::config::EngineConfig;
use crate::docker::DockerUseCase;
use crate::orchestration::outcome::Outcome;

const PROVENANCE: &str = "executor";

/// Tunables for one executor instance.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum commands in flight within one round
    pub limit_per_test: usize,
    /// Total attempts per command on transient connection failure
    pub connection_retries: u32,
    /// Pause between transient connection retries
    pub retry_delay: Duration,
    /// Wall-clock budget for one whole round
    pub round_timeout: Duration,
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            limit_per_test: config.limit_per_test,
            connection_retries: config.connection_retries,
            retry_delay: config.retry_delay,
            round_timeout: config.round_timeout,
        }
    }
}

/// Executes rounds of commands against the Docker use-case.
pub struct RoundExecutor {
    usecase: Arc<dyn DockerUseCase>,
    config: ExecutorConfig,
}

impl RoundExecutor {
    pub fn new(usecase: Arc<dyn DockerUseCase>, config: ExecutorConfig) -> Self {
        Self { usecase, config }
    }

    /// Run one round to completion and aggregate the outcome.
    #[instrument(skip_all, fields(round_size = round.len()))]
    pub async fn execute_round(&self, round: &[Command]) -> Outcome {
        if round.is_empty() {
            return Outcome::success(PROVENANCE);
        }

        let token = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.config.limit_per_test.max(1)));
        let mut tasks = JoinSet::new();

        for command in round {
            let usecase = Arc::clone(&self.usecase);
            let semaphore = Arc::clone(&semaphore);
            let token = token.clone();
            let command = command.clone();
            let retries = self.config.connection_retries;
            let retry_delay = self.config.retry_delay;

            tasks.spawn(async move {
                run_command(usecase, semaphore, token, command, retries, retry_delay).await
            });
        }

        let collect_token = token.clone();
        let collect = async move {
            let mut results = Vec::with_capacity(round.len());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((id, outcome)) => {
                        if outcome.is_fatal() {
                            // Cut the rest of the round off immediately.
                            collect_token.cancel();
                        }
                        results.push((id, outcome));
                    }
                    Err(join_err) => {
                        collect_token.cancel();
                        results.push((
                            Uuid::nil(),
                            Outcome::fatal(PROVENANCE, format!("command task failed: {join_err}")),
                        ));
                    }
                }
            }
            results
        };

        match tokio::time::timeout(self.config.round_timeout, collect).await {
            Ok(results) => aggregate(results),
            Err(_) => {
                token.cancel();
                warn!(
                    timeout_secs = self.config.round_timeout.as_secs(),
                    "Round timed out"
                );
                Outcome::retryable(
                    PROVENANCE,
                    format!(
                        "round timed out after {}s",
                        self.config.round_timeout.as_secs()
                    ),
                )
            }
        }
    }
}

async fn run_command(
    usecase: Arc<dyn DockerUseCase>,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    command: Command,
    retries: u32,
    retry_delay: Duration,
) -> (Uuid, Outcome) {
    let mut attempts: u32 = 0;

    // `retries` is the total attempt budget, not the extra-retry count.
    loop {
        // A cancelled round makes waiting commands moot; they report a
        // benign success so aggregation sees only the real failure.
        let permit = tokio::select! {
            _ = token.cancelled() => return (command.id, Outcome::success(PROVENANCE)),
            acquired = semaphore.clone().acquire_owned() => match acquired {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        command.id,
                        Outcome::fatal(PROVENANCE, "round semaphore closed"),
                    )
                }
            },
        };

        let outcome = usecase.run(&token, &command).await;
        drop(permit);
        attempts += 1;

        if outcome.is_transient_connection() && !token.is_cancelled() {
            if attempts < retries {
                debug!(
                    command_id = %command.id,
                    target = %command.target.ip,
                    attempt = attempts,
                    "Transient connection failure, retrying"
                );
                tokio::time::sleep(retry_delay).await;
                continue;
            }
            return (
                command.id,
                Outcome::fatal(
                    PROVENANCE,
                    format!(
                        "could not connect to docker daemon at {}: {}",
                        command.target.ip,
                        outcome.error_message()
                    ),
                ),
            );
        }

        return (command.id, outcome);
    }
}

/// Fold per-command outcomes into a round outcome.
///
/// Precedence: fatal, then delayed, then retryable, then trap, then
/// success. A retryable round carries the failing command IDs so the
/// handler can narrow the republished round to exactly those commands.
fn aggregate(results: Vec<(Uuid, Outcome)>) -> Outcome {
    if let Some((_, fatal)) = results.iter().find(|(_, o)| o.is_fatal()) {
        return fatal.clone();
    }

    let max_delay = results
        .iter()
        .filter_map(|(_, o)| if o.is_delayed() { o.delay() } else { None })
        .max();
    if let Some(delay) = max_delay {
        return Outcome::delayed(PROVENANCE, delay);
    }

    let failures: Vec<&(Uuid, Outcome)> = results
        .iter()
        .filter(|(_, o)| o.is_requeue() && !o.is_success())
        .collect();
    if !failures.is_empty() {
        let failed_ids: Vec<String> = failures.iter().map(|(id, _)| id.to_string()).collect();
        let message = failures
            .iter()
            .map(|(_, o)| o.error_message())
            .collect::<Vec<_>>()
            .join("; ");
        return Outcome::retryable(PROVENANCE, message)
            .with_meta("failed", serde_json::json!(failed_ids));
    }

    if results.iter().any(|(_, o)| o.is_trap()) {
        return Outcome::trap(PROVENANCE);
    }

    Outcome::success(PROVENANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Order, Target};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted use-case: outcomes keyed by container name, with an
    /// attempt counter per command.
    struct Scripted {
        outcomes: std::collections::HashMap<String, Vec<Outcome>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(outcomes: Vec<(&str, Vec<Outcome>)>) -> Self {
            Self {
                outcomes: outcomes
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DockerUseCase for Scripted {
        async fn run(&self, token: &CancellationToken, command: &Command) -> Outcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let name = match &command.order {
                Order::StartContainer { name } => name.clone(),
                other => other.kind().to_string(),
            };
            let script = self.outcomes.get(&name).cloned().unwrap_or_default();
            // First scripted outcome for the first attempt, and so on;
            // falls back to the last entry.
            let per_command = script
                .get(command_attempt(&name, call) as usize)
                .or_else(|| script.last())
                .cloned()
                .unwrap_or_else(|| Outcome::success("test"));

            if per_command.error.is_none() && token.is_cancelled() {
                return Outcome::success("test");
            }
            per_command
        }
    }

    // Attempt tracking is per-test simple: scripted tests use one command
    // or distinct outcomes per command, so the global call index works.
    fn command_attempt(_name: &str, call: u32) -> u32 {
        call
    }

    fn command(name: &str) -> Command {
        Command::new(
            Target::new("10.0.0.1"),
            Order::StartContainer {
                name: name.to_string(),
            },
            Duration::from_secs(30),
        )
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            limit_per_test: 4,
            connection_retries: 3,
            retry_delay: Duration::from_millis(1),
            round_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_all_success_round() {
        let usecase = Arc::new(Scripted::new(vec![(
            "node0",
            vec![Outcome::success("test")],
        )]));
        let executor = RoundExecutor::new(usecase, config());

        let outcome = executor.execute_round(&[command("node0")]).await;
        assert!(outcome.is_success());
        assert!(!outcome.is_requeue());
    }

    #[tokio::test]
    async fn test_empty_round_is_success() {
        let usecase = Arc::new(Scripted::new(vec![]));
        let executor = RoundExecutor::new(usecase, config());
        assert!(executor.execute_round(&[]).await.is_success());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_in_place() {
        let usecase = Arc::new(Scripted::new(vec![(
            "node0",
            vec![
                Outcome::transient_connection("test", "refused"),
                Outcome::transient_connection("test", "refused"),
                Outcome::success("test"),
            ],
        )]));
        let executor = RoundExecutor::new(Arc::clone(&usecase) as Arc<dyn DockerUseCase>, config());

        let outcome = executor.execute_round(&[command("node0")]).await;
        assert!(outcome.is_success());
        assert_eq!(usecase.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_retries_exhausted_becomes_fatal() {
        let usecase = Arc::new(Scripted::new(vec![(
            "node0",
            vec![Outcome::transient_connection("test", "refused")],
        )]));
        let executor = RoundExecutor::new(Arc::clone(&usecase) as Arc<dyn DockerUseCase>, config());

        let outcome = executor.execute_round(&[command("node0")]).await;
        assert!(outcome.is_fatal());
        assert!(outcome.error_message().contains("could not connect"));
        // exactly the configured attempt budget
        assert_eq!(usecase.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_wins_over_other_failures() {
        let usecase = Arc::new(Scripted::new(vec![
            ("node0", vec![Outcome::fatal("test", "disk full")]),
            ("node1", vec![Outcome::retryable("test", "flaky")]),
        ]));
        let executor = RoundExecutor::new(usecase, config());

        let outcome = executor
            .execute_round(&[command("node0"), command("node1")])
            .await;
        assert!(outcome.is_fatal());
        assert_eq!(outcome.error_message(), "disk full");
    }

    #[tokio::test]
    async fn test_partial_failure_reports_failing_ids() {
        let usecase = Arc::new(Scripted::new(vec![
            ("node0", vec![Outcome::success("test")]),
            ("node1", vec![Outcome::retryable("test", "flaky")]),
        ]));
        let executor = RoundExecutor::new(usecase, config());

        let failing = command("node1");
        let outcome = executor
            .execute_round(&[command("node0"), failing.clone()])
            .await;
        assert!(outcome.is_requeue());

        let failed = outcome.metadata.get("failed").expect("failed metadata");
        let ids: Vec<String> = serde_json::from_value(failed.clone()).expect("id list");
        assert_eq!(ids, vec![failing.id.to_string()]);
    }

    #[tokio::test]
    async fn test_delayed_wins_over_retryable() {
        let usecase = Arc::new(Scripted::new(vec![
            (
                "node0",
                vec![Outcome::delayed("test", Duration::from_millis(750))],
            ),
            ("node1", vec![Outcome::retryable("test", "flaky")]),
        ]));
        let executor = RoundExecutor::new(usecase, config());

        let outcome = executor
            .execute_round(&[command("node0"), command("node1")])
            .await;
        assert!(outcome.is_delayed());
        assert_eq!(outcome.delay(), Some(Duration::from_millis(750)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_timeout_is_retryable() {
        struct Stuck;

        #[async_trait]
        impl DockerUseCase for Stuck {
            async fn run(&self, _token: &CancellationToken, _command: &Command) -> Outcome {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Outcome::success("test")
            }
        }

        let mut cfg = config();
        cfg.round_timeout = Duration::from_secs(5);
        let executor = RoundExecutor::new(Arc::new(Stuck), cfg);

        let outcome = executor.execute_round(&[command("node0")]).await;
        assert!(outcome.is_requeue());
        assert!(outcome.error_message().contains("timed out"));
    }

    fn outcome_for(tag: u8) -> Outcome {
        match tag {
            0 => Outcome::fatal("test", "boom"),
            1 => Outcome::delayed("test", Duration::from_millis(100)),
            2 => Outcome::retryable("test", "flaky"),
            3 => Outcome::trap("test"),
            _ => Outcome::success("test"),
        }
    }

    proptest! {
        #[test]
        fn prop_aggregate_precedence(tags in prop::collection::vec(0u8..5, 1..20)) {
            let results: Vec<(Uuid, Outcome)> = tags
                .iter()
                .map(|t| (Uuid::new_v4(), outcome_for(*t)))
                .collect();
            let min = *tags.iter().min().unwrap();
            let folded = aggregate(results);

            match min {
                0 => prop_assert!(folded.is_fatal()),
                1 => prop_assert!(folded.is_delayed()),
                2 => prop_assert!(folded.is_requeue() && !folded.is_delayed()),
                3 => prop_assert!(folded.is_trap()),
                _ => prop_assert!(folded.is_success() && !folded.is_trap()),
            }
        }
    }
}
