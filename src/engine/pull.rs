//! Image acquisition honoring a pull policy, with bounded retries

use super::{ContainerEngine, EngineError, ImageInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull on every use
    Always,
    /// Pull only when the image is absent locally
    #[default]
    IfNotPresent,
    /// Never pull; the image must already be local
    Never,
}

impl FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(PullPolicy::Always),
            "if-not-present" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            _ => Err(format!(
                "Invalid pull policy: {}. Valid options: always, if-not-present, never",
                s
            )),
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PullPolicy::Always => write!(f, "always"),
            PullPolicy::IfNotPresent => write!(f, "if-not-present"),
            PullPolicy::Never => write!(f, "never"),
        }
    }
}

/// How images get pulled: policy plus retry budget for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOptions {
    pub policy: PullPolicy,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            policy: PullPolicy::IfNotPresent,
            retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Makes `reference` available locally and returns its inspect data
pub async fn ensure_image(
    engine: &dyn ContainerEngine,
    reference: &str,
    options: &PullOptions,
) -> Result<ImageInfo, EngineError> {
    if options.policy != PullPolicy::Always {
        if let Some(info) = engine.inspect_image(reference).await? {
            debug!(image = %reference, "Image present locally");
            return Ok(info);
        }
    }

    if options.policy == PullPolicy::Never {
        return Err(EngineError::NotFound(format!(
            "{} is not present locally and pull policy is never",
            reference
        )));
    }

    pull_with_retry(engine, reference, options).await?;

    engine
        .inspect_image(reference)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("{} missing after pull", reference)))
}

/// Pulls, retrying transient failures with linear backoff
pub async fn pull_with_retry(
    engine: &dyn ContainerEngine,
    reference: &str,
    options: &PullOptions,
) -> Result<(), EngineError> {
    let mut attempt = 0;
    loop {
        match engine.pull_image(reference).await {
            Ok(()) => {
                debug!(image = %reference, attempt, "Pulled image");
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < options.retries => {
                attempt += 1;
                warn!(
                    image = %reference,
                    attempt,
                    retries = options.retries,
                    error = %e,
                    "Transient pull failure, retrying"
                );
                tokio::time::sleep(options.backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    fn fast(policy: PullPolicy, retries: u32) -> PullOptions {
        PullOptions {
            policy,
            retries,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!(
            "If-Not-Present".parse::<PullPolicy>().unwrap(),
            PullPolicy::IfNotPresent
        );
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_if_not_present_skips_pull_for_local_image() {
        let engine = MockEngine::new();
        engine.add_local_image("builder:1", ImageInfo::new("sha256:1"));

        ensure_image(&engine, "builder:1", &fast(PullPolicy::IfNotPresent, 0))
            .await
            .unwrap();
        assert_eq!(engine.pulls_of("builder:1"), 0);
    }

    #[tokio::test]
    async fn test_always_pulls() {
        let engine = MockEngine::new();
        engine.add_remote_image("builder:1", ImageInfo::new("sha256:1"));

        ensure_image(&engine, "builder:1", &fast(PullPolicy::Always, 0))
            .await
            .unwrap();
        ensure_image(&engine, "builder:1", &fast(PullPolicy::Always, 0))
            .await
            .unwrap();
        assert_eq!(engine.pulls_of("builder:1"), 2);
    }

    #[tokio::test]
    async fn test_never_fails_when_absent() {
        let engine = MockEngine::new();
        engine.add_remote_image("builder:1", ImageInfo::new("sha256:1"));

        let err = ensure_image(&engine, "builder:1", &fast(PullPolicy::Never, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(engine.pulls_of("builder:1"), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_retried_within_budget() {
        let engine = MockEngine::new();
        engine.add_remote_image("bp:1", ImageInfo::new("sha256:1"));
        engine.fail_pulls("bp:1", 2);

        pull_with_retry(&engine, "bp:1", &fast(PullPolicy::Always, 2))
            .await
            .unwrap();
        assert_eq!(engine.pulls_of("bp:1"), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let engine = MockEngine::new();
        engine.add_remote_image("bp:1", ImageInfo::new("sha256:1"));
        engine.fail_pulls("bp:1", 5);

        assert!(pull_with_retry(&engine, "bp:1", &fast(PullPolicy::Always, 1))
            .await
            .is_err());
        assert_eq!(engine.pulls_of("bp:1"), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let engine = MockEngine::new();
        assert!(pull_with_retry(&engine, "missing:1", &fast(PullPolicy::Always, 3))
            .await
            .is_err());
        assert_eq!(engine.pulls_of("missing:1"), 1);
    }
}
