use log::{error, info, warn};
use sha2::{Digest, Sha256};
use std::future::Future;

use crate::core::state::{ContentState, ContentStateMachine, StateTransitionError, TransitionOutcome};
use crate::services::workflow::PipelineResult;

#[derive(Debug)]
pub enum TrackedRun {
    /// The item was already COMPLETE or DELETED; the pipeline did not run.
    Skipped(ContentState),
    Finished {
        result: PipelineResult,
        outcome: TransitionOutcome,
    },
}

/// Runs one pipeline attempt for `content_id`, recording IN_PROGRESS before it and
/// COMPLETE or ERROR after it.
///
/// An item left IN_PROGRESS by an interrupted attempt is first recorded as ERROR, so
/// it counts against the retry budget like any other failure.
pub async fn run_tracked<F, Fut>(
    machine: &ContentStateMachine,
    content_id: &str,
    pipeline: F,
) -> Result<TrackedRun, StateTransitionError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = PipelineResult>,
{
    machine.initialize_content(content_id)?;

    let mut current = machine
        .current_state(content_id)?
        .ok_or_else(|| StateTransitionError::NotInitialized(content_id.to_string()))?;

    if current == ContentState::InProgress {
        warn!("Content {} was left {}; recording the interrupted attempt", content_id, current);
        current = machine
            .transition_state(content_id, ContentState::Error, Some("interrupted before completion"))?
            .state();
    }

    if matches!(current, ContentState::Complete | ContentState::Deleted) {
        info!("Content {} is {}, nothing to do", content_id, current);
        return Ok(TrackedRun::Skipped(current));
    }

    machine.transition_state(content_id, ContentState::InProgress, None)?;
    let result = pipeline().await;

    let outcome = if result.success {
        machine.transition_state(content_id, ContentState::Complete, None)?
    } else {
        let message = format!(
            "{} (steps completed: [{}])",
            result.error,
            result.steps_summary()
        );
        let outcome = machine.transition_state(content_id, ContentState::Error, Some(&message))?;
        if outcome.is_auto_terminated() {
            error!("Content {} abandoned after repeated failures", content_id);
        }
        outcome
    };

    Ok(TrackedRun::Finished { result, outcome })
}

/// Stable content id for a subject: a readable slug of its words followed by the first
/// eight hex digits of the subject's SHA-256, so distinct subjects never share a
/// lifecycle even when their slugs coincide.
pub fn content_id_for(subject: &str) -> String {
    let subject = subject.trim();
    let slug = subject
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("-");
    let slug: String = slug.chars().take(40).collect();
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "content" } else { slug };
    format!("{}-{}", slug, subject_digest(subject))
}

fn subject_digest(subject: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    hash[..8].to_string()
}
