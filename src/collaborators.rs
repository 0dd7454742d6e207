//! Interfaces to the services the engine consumes but does not own: text
//! generation, phase notifications and progress tracking.
//!
//! Every call goes through [`bounded`], so a slow or failing collaborator costs
//! at most `timeout * (retries + 1)` and never blocks a transaction forever.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roadmap_core::models::{CandidateStep, RoadmapStep};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
#[error("{collaborator} failed: {message}")]
pub struct CollaboratorError {
    pub collaborator: &'static str,
    pub message: String,
    /// A critical failure aborts the surrounding transaction instead of being
    /// logged and ignored.
    pub critical: bool,
}

impl CollaboratorError {
    pub fn recoverable(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
            critical: false,
        }
    }

    pub fn critical(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
            critical: true,
        }
    }
}

/// What the text generator gets to work with when proposing new steps.
#[derive(Debug, Clone, Serialize)]
pub struct ExpansionContext {
    pub tree_id: Uuid,
    pub goal: String,
    pub step: RoadmapStep,
    /// Free text supplied by the caller.
    pub context: String,
}

/// What the text generator gets to work with when writing a reinforcement message.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionContext {
    pub goal: String,
    pub reflection: Option<String>,
    /// The step had already been completed before this request.
    pub duplicate: bool,
}

/// A completion as reported to the progress recorder.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Stable across the retries of one request.
    pub trace_id: Uuid,
    pub tree_id: Uuid,
    pub user_id: Uuid,
    pub step_id: Uuid,
    pub title: String,
    pub reflection: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Propose new steps, in order, for branch expansion.
    async fn propose_steps(
        &self,
        context: &ExpansionContext,
    ) -> Result<Vec<CandidateStep>, CollaboratorError>;

    async fn summarize_completion(
        &self,
        step: &RoadmapStep,
        context: &CompletionContext,
    ) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_phase_complete(&self, phase_id: &str, tree_id: Uuid)
        -> Result<(), CollaboratorError>;
}

/// Keeps derived memory/progress state in step with completions.
///
/// Called inside the completion transaction, possibly more than once for the
/// same request when a version conflict forces a retry; implementations should
/// treat `trace_id` as an idempotency key.
#[async_trait]
pub trait ProgressRecorder: Send + Sync {
    async fn record_completion(&self, event: &ProgressEvent) -> Result<(), CollaboratorError>;
}

/// Offline generator: one candidate per non-empty context line, and a fixed
/// reinforcement template.
#[derive(Debug, Clone, Default)]
pub struct TemplateTextGenerator;

#[async_trait]
impl TextGenerator for TemplateTextGenerator {
    async fn propose_steps(
        &self,
        context: &ExpansionContext,
    ) -> Result<Vec<CandidateStep>, CollaboratorError> {
        Ok(context
            .context
            .lines()
            .map(|line| line.trim().trim_start_matches(&['-', '*'][..]).trim())
            .filter(|line| !line.is_empty())
            .map(CandidateStep::from)
            .collect())
    }

    async fn summarize_completion(
        &self,
        step: &RoadmapStep,
        context: &CompletionContext,
    ) -> Result<String, CollaboratorError> {
        let mut message = format!("Nice work finishing \"{}\".", step.title);
        if context.reflection.is_some() {
            message.push_str(" Thanks for writing down how it went.");
        }
        Ok(message)
    }
}

/// Notifier that only logs.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_phase_complete(
        &self,
        phase_id: &str,
        tree_id: Uuid,
    ) -> Result<(), CollaboratorError> {
        tracing::info!(%tree_id, phase_id, "Phase completed");
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NoopProgressRecorder;

#[async_trait]
impl ProgressRecorder for NoopProgressRecorder {
    async fn record_completion(&self, _event: &ProgressEvent) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Message used when the text generator cannot produce one.
pub fn fallback_reinforcement(step: &RoadmapStep) -> String {
    format!("Step \"{}\" is complete. Keep going!", step.title)
}

/// Run a collaborator call with a per-attempt timeout and `retries` extra attempts.
pub(crate) async fn bounded<T, F, Fut>(
    collaborator: &'static str,
    timeout: Duration,
    retries: u32,
    mut call: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => CollaboratorError::recoverable(
                collaborator,
                format!("timed out after {}ms", timeout.as_millis()),
            ),
        };
        if attempt > retries {
            return Err(err);
        }
        tracing::warn!(collaborator, attempt, error = %err, "Collaborator call failed, retrying");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn bounded_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = bounded("flaky", Duration::from_secs(1), 1, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CollaboratorError::recoverable("flaky", "first call fails"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bounded_gives_up_after_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = bounded("broken", Duration::from_secs(1), 2, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CollaboratorError::critical("broken", "down"))
        })
        .await;
        assert!(result.unwrap_err().critical);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn bounded_times_out_slow_calls() {
        let result: Result<(), _> = bounded("slow", Duration::from_millis(10), 0, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.message.contains("timed out"));
        assert!(!err.critical);
    }

    #[tokio::test]
    async fn template_generator_proposes_one_step_per_line() {
        let step = RoadmapStep::new("Learn ownership", "basics");
        let context = ExpansionContext {
            tree_id: Uuid::new_v4(),
            goal: "Learn Rust".to_string(),
            step,
            context: "- Read the borrow checker chapter\n\n* Write a linked list\n".to_string(),
        };
        let steps = TemplateTextGenerator.propose_steps(&context).await.unwrap();
        let titles: Vec<_> = steps.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Read the borrow checker chapter", "Write a linked list"]);
    }
}
