//! Ordered fallback helper: try each attempt in turn, keep the first success.

use anyhow::Result;
use futures::future::BoxFuture;

/// A named unit of work. The future is not polled until its turn comes.
pub struct Attempt<'a, T> {
    pub name: &'static str,
    pub fut: BoxFuture<'a, Result<T>>,
}

impl<'a, T> Attempt<'a, T> {
    pub fn new(name: &'static str, fut: BoxFuture<'a, Result<T>>) -> Self {
        Self { name, fut }
    }
}

#[derive(Debug)]
pub struct AttemptSuccess<T> {
    pub name: &'static str,
    pub value: T,
    /// `"<name>: <error>"` for every attempt that failed before this one.
    pub failures: Vec<String>,
}

/// Run attempts in order and return the first that succeeds.
///
/// Fails with every attempt's error joined when none succeed.
pub async fn first_success<T>(attempts: Vec<Attempt<'_, T>>) -> Result<AttemptSuccess<T>> {
    let mut failures = Vec::new();
    for attempt in attempts {
        match attempt.fut.await {
            Ok(value) => {
                return Ok(AttemptSuccess {
                    name: attempt.name,
                    value,
                    failures,
                });
            }
            Err(e) => {
                tracing::debug!(attempt = attempt.name, error = %format!("{:#}", e), "Attempt failed");
                failures.push(format!("{}: {:#}", attempt.name, e));
            }
        }
    }
    if failures.is_empty() {
        anyhow::bail!("No attempts to run");
    }
    anyhow::bail!("All attempts failed: {}", failures.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_first_attempt_wins() {
        let out = first_success(vec![
            Attempt::new("primary", async { Ok(1) }.boxed()),
            Attempt::new("fallback", async { Ok(2) }.boxed()),
        ])
        .await
        .unwrap();
        assert_eq!(out.name, "primary");
        assert_eq!(out.value, 1);
        assert!(out.failures.is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_in_order() {
        let out = first_success(vec![
            Attempt::new("primary", async { Err(anyhow::anyhow!("npm missing")) }.boxed()),
            Attempt::new("fallback", async { Ok("installed") }.boxed()),
        ])
        .await
        .unwrap();
        assert_eq!(out.name, "fallback");
        assert_eq!(out.value, "installed");
        assert_eq!(out.failures, vec!["primary: npm missing".to_string()]);
    }

    #[tokio::test]
    async fn test_later_attempts_not_run_after_success() {
        let runs = AtomicUsize::new(0);
        let out = first_success(vec![
            Attempt::new(
                "a",
                async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed(),
            ),
            Attempt::new(
                "b",
                async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed(),
            ),
        ])
        .await;
        assert!(out.is_ok());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_fail_reports_every_error() {
        let err = first_success::<()>(vec![
            Attempt::new("a", async { Err(anyhow::anyhow!("first")) }.boxed()),
            Attempt::new("b", async { Err(anyhow::anyhow!("second")) }.boxed()),
        ])
        .await
        .unwrap_err()
        .to_string();
        assert!(err.contains("a: first"));
        assert!(err.contains("b: second"));
    }

    #[tokio::test]
    async fn test_empty_list_fails() {
        assert!(first_success::<()>(Vec::new()).await.is_err());
    }
}
