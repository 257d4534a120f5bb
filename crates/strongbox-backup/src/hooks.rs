//! Pre-run hooks
//!
//! Each hook is a shell command line run with `sh -c` in the run's work dir,
//! with `STRONGBOX_WORKDIR` pointing there so hooks can leave files for the
//! sources to pick up.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use strongbox_core::types::HookSpec;
use strongbox_core::{AbortSignal, Error, Result};

pub const WORKDIR_ENV: &str = "STRONGBOX_WORKDIR";

/// What happened to one hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Succeeded,
    /// A required tool is not on PATH
    Skipped { missing: String },
    /// An optional hook failed; the run continues
    Failed { message: String },
}

/// Run hooks in order; a failing mandatory hook stops the sequence
pub async fn run_hooks(
    hooks: &[HookSpec],
    workdir: &Path,
    abort: &AbortSignal,
) -> Result<Vec<(String, HookOutcome)>> {
    let mut outcomes = Vec::with_capacity(hooks.len());
    for hook in hooks {
        abort.check()?;
        let outcome = run_hook(hook, workdir, abort).await?;
        outcomes.push((hook.name.clone(), outcome));
    }
    Ok(outcomes)
}

pub async fn run_hook(
    hook: &HookSpec,
    workdir: &Path,
    abort: &AbortSignal,
) -> Result<HookOutcome> {
    if let Some(missing) = hook.requires.iter().find(|tool| which::which(tool).is_err()) {
        info!("Skipping hook '{}': {} not found on PATH", hook.name, missing);
        return Ok(HookOutcome::Skipped {
            missing: missing.clone(),
        });
    }

    debug!("Running hook '{}': {}", hook.name, hook.run);
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&hook.run)
        .current_dir(workdir)
        .env(WORKDIR_ENV, workdir)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let run = async {
        match hook.timeout_secs {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), command.output()).await {
                    Ok(output) => output.map_err(|e| e.to_string()),
                    Err(_) => Err(format!("timed out after {}s", secs)),
                }
            }
            None => command.output().await.map_err(|e| e.to_string()),
        }
    };

    let result = tokio::select! {
        result = run => result,
        _ = abort.cancelled() => return Err(Error::Cancelled),
    };

    let failure = match result {
        Ok(output) if output.status.success() => {
            info!("Hook '{}' finished", hook.name);
            return Ok(HookOutcome::Succeeded);
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            format!("exited with {}: {}", output.status, stderr.trim())
        }
        Err(message) => message,
    };

    if hook.mandatory {
        return Err(Error::hook_failed(&hook.name, failure));
    }
    warn!("Optional hook '{}' failed: {}", hook.name, failure);
    Ok(HookOutcome::Failed { message: failure })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn hook(name: &str, run: &str, mandatory: bool) -> HookSpec {
        HookSpec {
            name: name.to_string(),
            run: run.to_string(),
            requires: vec![],
            mandatory,
            timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_hook_writes_into_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_hook(
            &hook("list", "echo pkgs > \"$STRONGBOX_WORKDIR/listing.txt\"", true),
            dir.path(),
            &AbortSignal::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, HookOutcome::Succeeded);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("listing.txt")).unwrap(),
            "pkgs\n"
        );
    }

    #[tokio::test]
    async fn test_missing_tool_skips_hook() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = hook("brew", "brew bundle dump", true);
        spec.requires = vec!["strongbox-no-such-tool".into()];

        let outcome = run_hook(&spec, dir.path(), &AbortSignal::new()).await.unwrap();
        assert_eq!(
            outcome,
            HookOutcome::Skipped {
                missing: "strongbox-no-such-tool".into()
            }
        );
    }

    #[tokio::test]
    async fn test_failing_mandatory_hook_stops_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = vec![
            hook("first", "echo 'disk full' >&2; exit 3", true),
            hook("second", "touch second-ran", true),
        ];
        let err = run_hooks(&hooks, dir.path(), &AbortSignal::new())
            .await
            .unwrap_err();
        match err {
            Error::HookFailed { hook, message } => {
                assert_eq!(hook, "first");
                assert!(message.contains("disk full"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dir.path().join("second-ran").exists());
    }

    #[tokio::test]
    async fn test_failing_optional_hook_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let outcomes = run_hooks(
            &[hook("optional", "exit 1", false), hook("next", "true", true)],
            dir.path(),
            &AbortSignal::new(),
        )
        .await
        .unwrap();
        assert!(matches!(outcomes[0].1, HookOutcome::Failed { .. }));
        assert_eq!(outcomes[1].1, HookOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_timeout_fails_hook() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = hook("slow", "sleep 5", true);
        spec.timeout_secs = Some(0);
        let err = run_hook(&spec, dir.path(), &AbortSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HookFailed { .. }));
    }

    #[tokio::test]
    async fn test_abort_cancels_hook() {
        let dir = tempfile::tempdir().unwrap();
        let abort = AbortSignal::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.abort();
        });
        let err = run_hook(&hook("slow", "sleep 5", true), dir.path(), &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
