use crate::core::error::{FailureKind, TransferOutcome};
use crate::core::model::DownloadLink;
use async_trait::async_trait;

/// Runs one mirror of an item. Implementations persist the attempt marker
/// before touching the network.
#[async_trait]
pub trait MirrorRunner: Send + Sync {
    async fn attempt(&self, index: usize, link: &DownloadLink, resume: bool) -> TransferOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackResult {
    pub outcome: TransferOutcome,
    /// Mirror indexes attempted, in order.
    pub attempted: Vec<usize>,
}

/// Tries mirrors from `resume_at` (or 0) onward until one finishes or is
/// stopped. Only the mirror the item was interrupted on resumes its
/// partial output; later mirrors start fresh.
pub async fn run_mirrors(
    links: &[DownloadLink],
    resume_at: Option<usize>,
    runner: &dyn MirrorRunner,
) -> FallbackResult {
    let start = resume_at.unwrap_or(0);
    let mut attempted = vec![];
    let mut last_failure = None;

    for (index, link) in links.iter().enumerate().skip(start) {
        attempted.push(index);
        let outcome = runner.attempt(index, link, resume_at == Some(index)).await;
        if outcome.ends_fallback() {
            return FallbackResult { outcome, attempted };
        }
        if let TransferOutcome::Failed(kind) = outcome {
            tracing::warn!(mirror = index, url = %link.url, "mirror failed: {}", kind);
            last_failure = Some(kind);
        }
    }

    let kind = last_failure.unwrap_or(FailureKind::Unknown);
    FallbackResult { outcome: TransferOutcome::Failed(kind), attempted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::link;
    use std::sync::Mutex;

    struct Scripted {
        outcomes: Vec<TransferOutcome>,
        calls: Mutex<Vec<(usize, bool)>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<TransferOutcome>) -> Self {
            Self { outcomes, calls: Mutex::new(vec![]) }
        }
    }

    #[async_trait]
    impl MirrorRunner for Scripted {
        async fn attempt(&self, index: usize, _link: &DownloadLink, resume: bool) -> TransferOutcome {
            self.calls.lock().unwrap().push((index, resume));
            self.outcomes[index]
        }
    }

    fn mirrors(n: usize) -> Vec<DownloadLink> {
        (0..n).map(|i| link(&format!("https://m{}.example/v.mp4", i))).collect()
    }

    const FAIL: TransferOutcome = TransferOutcome::Failed(FailureKind::ConnectionError);

    #[tokio::test]
    async fn falls_through_failed_mirrors_in_order() {
        let runner = Scripted::new(vec![FAIL, FAIL, TransferOutcome::Done]);
        let r = run_mirrors(&mirrors(3), None, &runner).await;
        assert_eq!(r.outcome, TransferOutcome::Done);
        assert_eq!(r.attempted, vec![0, 1, 2]);
        assert_eq!(*runner.calls.lock().unwrap(), vec![(0, false), (1, false), (2, false)]);
    }

    #[tokio::test]
    async fn exhaustion_reports_the_last_failure() {
        let runner = Scripted::new(vec![
            TransferOutcome::Failed(FailureKind::TooSmall),
            TransferOutcome::Failed(FailureKind::WrongContent),
        ]);
        let r = run_mirrors(&mirrors(2), None, &runner).await;
        assert_eq!(r.outcome, TransferOutcome::Failed(FailureKind::WrongContent));
        assert_eq!(r.attempted, vec![0, 1]);
    }

    #[tokio::test]
    async fn stop_ends_the_loop() {
        let runner = Scripted::new(vec![TransferOutcome::Stopped, TransferOutcome::Done]);
        let r = run_mirrors(&mirrors(2), None, &runner).await;
        assert_eq!(r.outcome, TransferOutcome::Stopped);
        assert_eq!(r.attempted, vec![0]);
    }

    #[tokio::test]
    async fn resume_starts_at_the_persisted_mirror_only_once() {
        let runner = Scripted::new(vec![TransferOutcome::Done, FAIL, FAIL, TransferOutcome::Done]);
        let r = run_mirrors(&mirrors(4), Some(1), &runner).await;
        assert_eq!(r.outcome, TransferOutcome::Done);
        assert_eq!(*runner.calls.lock().unwrap(), vec![(1, true), (2, false), (3, false)]);
    }

    #[tokio::test]
    async fn no_mirrors_is_an_unknown_failure() {
        let runner = Scripted::new(vec![]);
        let r = run_mirrors(&[], None, &runner).await;
        assert_eq!(r.outcome, TransferOutcome::Failed(FailureKind::Unknown));
        assert!(r.attempted.is_empty());
    }
}
