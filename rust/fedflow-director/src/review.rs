//! Human review of experiment plans before they are queued.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use tokio::task;
use tracing::warn;

use crate::experiment::Experiment;

/// Decides whether a submitted experiment may be queued.
#[async_trait]
pub trait PlanReviewer: Send + Sync {
    async fn review(&self, experiment: &Experiment) -> bool;
}

#[async_trait]
impl<F> PlanReviewer for F
where
    F: Fn(&Experiment) -> bool + Send + Sync,
{
    async fn review(&self, experiment: &Experiment) -> bool {
        self(experiment)
    }
}

/// Asks the operator on the terminal of the director.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReviewer;

#[async_trait]
impl PlanReviewer for ConsoleReviewer {
    async fn review(&self, experiment: &Experiment) -> bool {
        let prompt = format!(
            "Experiment `{}` submitted by `{}` for envoys [{}], archive at {}.\nAccept? [y/N] ",
            experiment.name(),
            experiment.submitter().unwrap_or("unknown"),
            experiment
                .collaborators()
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            experiment.archive_path().display(),
        );
        // stdin is blocking
        task::spawn_blocking(move || ask(&prompt))
            .await
            .unwrap_or_else(|err| {
                warn!("plan review was interrupted: {}", err);
                false
            })
    }
}

fn ask(prompt: &str) -> bool {
    let mut stdout = io::stdout();
    if write!(stdout, "{}", prompt).and_then(|_| stdout.flush()).is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => is_yes(&answer),
        Err(err) => {
            warn!("failed to read the review decision: {}", err);
            false
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("nope"));
    }
}
