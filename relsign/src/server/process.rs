// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Running signing programs.
//!
//! Signing programs are external processes that occasionally hang (waiting on a hardware token,
//! a smart card, or a network service). Every invocation goes through [`run_signing_program`],
//! which enforces a time budget with escalating signals and retries failed attempts.

use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use rustix::process::{kill_process, Pid, Signal};
use tokio::{io::AsyncWriteExt, process::Child};
use tracing::instrument;

use crate::{
    error::SigningError,
    server::config::{Format, SigningPolicy},
};

/// How a single attempt is supervised and how often it's retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long the program may run before it's sent SIGINT.
    pub timeout: Duration,
    /// How long to wait after SIGINT before sending SIGTERM, and after SIGTERM before SIGKILL.
    pub grace_period: Duration,
    pub max_attempts: u32,
    /// The delay after the first failed attempt. Later delays grow linearly.
    pub retry_delay: Duration,
}

impl From<&SigningPolicy> for RetryPolicy {
    fn from(policy: &SigningPolicy) -> Self {
        Self {
            timeout: policy.timeout(),
            grace_period: policy.grace_period(),
            max_attempts: policy.max_attempts.max(1),
            retry_delay: policy.retry_delay(),
        }
    }
}

impl RetryPolicy {
    /// The same policy with a different attempt ceiling.
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// How long to wait after failed attempt number `attempt` before trying again.
    fn delay_after(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(attempt)
    }
}

/// How an attempt ended.
#[derive(Debug)]
enum Outcome {
    Exited(ExitStatus),
    /// The program exceeded its time budget and was signalled until it exited.
    TimedOut,
}

/// Run `format`'s signing program to sign `input` into `output`.
///
/// The program is invoked as `program [args...] <format> <input> <output> <filename>`. The
/// format's passphrase, if any, is written to its standard input; it never appears on the
/// command line. Standard output and standard error of every attempt go to `log`.
///
/// # Errors
///
/// [`SigningError::Failed`] with the contents of `log` if no attempt succeeds.
#[instrument(skip_all, err, fields(format = %format.name, filename = filename))]
pub async fn run_signing_program(
    format: &Format,
    input: &Path,
    output: &Path,
    filename: &str,
    log: &Path,
    policy: RetryPolicy,
) -> Result<(), SigningError> {
    let log_file = tokio::fs::File::create(log).await?.into_std().await;

    for attempt in 1..=policy.max_attempts {
        let mut command = tokio::process::Command::new(&format.program);
        command
            .args(&format.args)
            .arg(&format.name)
            .arg(input)
            .arg(output)
            .arg(filename)
            .stdin(Stdio::piped())
            .stdout(log_file.try_clone()?)
            .stderr(log_file.try_clone()?)
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        tracing::debug!(pid = child.id(), attempt, "Started signing program");

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(passphrase) = &format.passphrase {
                // Programs that don't read their input may exit before it's written.
                if let Err(error) = stdin.write_all(passphrase.expose().as_bytes()).await {
                    tracing::debug!(?error, "Unable to write the passphrase to the signing program");
                }
            }
            drop(stdin);
        }

        match supervise(&mut child, &policy).await? {
            Outcome::Exited(status) if status.success() => {
                tracing::debug!(attempt, "Signing program succeeded");
                return Ok(());
            }
            Outcome::Exited(status) => {
                tracing::info!(attempt, %status, "Signing program failed");
            }
            Outcome::TimedOut => {
                tracing::info!(attempt, timeout = ?policy.timeout, "Signing program timed out");
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay_after(attempt)).await;
        }
    }

    tracing::warn!(
        attempts = policy.max_attempts,
        "Signing program exceeded its maximum number of attempts"
    );
    let log = tokio::fs::read(log).await.unwrap_or_default();
    Err(SigningError::Failed {
        attempts: policy.max_attempts,
        log: String::from_utf8_lossy(&log).into_owned(),
    })
}

/// Wait for `child` to exit, escalating from SIGINT to SIGTERM to SIGKILL once its time budget
/// is spent.
async fn supervise(child: &mut Child, policy: &RetryPolicy) -> std::io::Result<Outcome> {
    if let Ok(status) = tokio::time::timeout(policy.timeout, child.wait()).await {
        return Ok(Outcome::Exited(status?));
    }

    for signal in [Signal::INT, Signal::TERM] {
        let Some(pid) = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .and_then(Pid::from_raw)
        else {
            // The child has already been reaped.
            return Ok(Outcome::TimedOut);
        };
        tracing::debug!(?signal, "Signalling signing program");
        if let Err(error) = kill_process(pid, signal) {
            tracing::debug!(?error, "Unable to signal the signing program");
        }
        if let Ok(status) = tokio::time::timeout(policy.grace_period, child.wait()).await {
            status?;
            return Ok(Outcome::TimedOut);
        }
    }

    tracing::warn!("Signing program ignored SIGINT and SIGTERM; killing it");
    child.kill().await?;
    Ok(Outcome::TimedOut)
}

/// Sign each format's test file once, to catch bad passphrases before accepting requests.
///
/// The test file is copied to a temporary directory and signed there, so nothing is written to
/// the store.
#[instrument(skip_all, err, fields(format = %format.name))]
pub async fn self_test(format: &Format, policy: RetryPolicy) -> anyhow::Result<()> {
    let Some(test_file) = &format.test_file else {
        return Ok(());
    };

    let workspace = tempfile::TempDir::new()?;
    let filename = test_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "test-file".to_string());
    let input = workspace.path().join(&filename);
    let output = workspace.path().join(format!("{filename}.signed"));
    let log = workspace.path().join(format!("{filename}.out"));
    tokio::fs::copy(test_file, &input).await?;

    match run_signing_program(format, &input, &output, &filename, &log, policy).await {
        Ok(()) => {
            tracing::info!("Signing self-test passed");
            Ok(())
        }
        Err(SigningError::Failed { log, .. }) => {
            tracing::error!(log, "Signing self-test failed; is the passphrase correct?");
            Err(anyhow::anyhow!(
                "the signing program for format '{}' failed its self-test",
                format.name
            ))
        }
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, time::Instant};

    use super::*;
    use crate::server::{config::Secret, test_utils};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            grace_period: Duration::from_millis(200),
            max_attempts: 3,
            retry_delay: Duration::ZERO,
        }
    }

    fn format(script: &Path, passphrase: Option<&str>) -> Format {
        Format {
            name: "fmtA".to_string(),
            program: "/bin/sh".into(),
            args: vec![script.display().to_string()],
            passphrase: passphrase.map(Secret::from),
            concurrency: NonZeroUsize::new(1).unwrap(),
            output_suffix: String::new(),
            test_file: None,
        }
    }

    #[tokio::test]
    async fn program_receives_arguments_and_passphrase() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let program = test_utils::script(
            dir.path(),
            "sign",
            r#"read passphrase
echo "signing $4 as $1 with $passphrase"
[ "$passphrase" = "hunter2" ] || exit 1
cp "$2" "$3"
"#,
        )?;
        let input = dir.path().join("input");
        let output = dir.path().join("output");
        let log = dir.path().join("output.out");
        std::fs::write(&input, "content")?;

        run_signing_program(
            &format(&program, Some("hunter2")),
            &input,
            &output,
            "app.bin",
            &log,
            policy(),
        )
        .await?;

        assert_eq!(std::fs::read_to_string(&output)?, "content");
        assert_eq!(
            std::fs::read_to_string(&log)?,
            "signing app.bin as fmtA with hunter2\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_retried_until_the_ceiling() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let counter = dir.path().join("attempts");
        let program = test_utils::script(
            dir.path(),
            "sign",
            &format!("echo attempt >> {}\necho 'no smart card' >&2\nexit 3\n", counter.display()),
        )?;

        let result = run_signing_program(
            &format(&program, None),
            &dir.path().join("input"),
            &dir.path().join("output"),
            "app.bin",
            &dir.path().join("output.out"),
            policy(),
        )
        .await;

        match result {
            Err(SigningError::Failed { attempts, log }) => {
                assert_eq!(attempts, 3);
                assert!(log.contains("no smart card"));
            }
            other => panic!("expected the signing program to fail, got {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&counter)?.lines().count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn transient_failures_recover() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let marker = dir.path().join("failed-once");
        let program = test_utils::script(
            dir.path(),
            "sign",
            &format!(
                "if [ ! -e {marker} ]; then touch {marker}; exit 1; fi\ncp \"$2\" \"$3\"\n",
                marker = marker.display()
            ),
        )?;
        let input = dir.path().join("input");
        std::fs::write(&input, "content")?;

        run_signing_program(
            &format(&program, None),
            &input,
            &dir.path().join("output"),
            "app.bin",
            &dir.path().join("output.out"),
            policy(),
        )
        .await?;

        assert!(dir.path().join("output").exists());
        Ok(())
    }

    #[tokio::test]
    async fn hung_programs_are_interrupted() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let signals = dir.path().join("signals");
        let program = test_utils::script(
            dir.path(),
            "sign",
            &format!(
                "trap 'echo INT >> {signals}; exit 1' INT\n\
                 trap 'echo TERM >> {signals}; exit 1' TERM\n\
                 while true; do sleep 0.1; done\n",
                signals = signals.display()
            ),
        )?;
        let policy = RetryPolicy {
            timeout: Duration::from_millis(200),
            grace_period: Duration::from_secs(2),
            max_attempts: 1,
            ..policy()
        };

        let started = Instant::now();
        let result = run_signing_program(
            &format(&program, None),
            &dir.path().join("input"),
            &dir.path().join("output"),
            "app.bin",
            &dir.path().join("output.out"),
            policy,
        )
        .await;

        assert!(matches!(result, Err(SigningError::Failed { attempts: 1, .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
        // SIGINT alone was enough; SIGTERM was never needed.
        assert_eq!(std::fs::read_to_string(&signals)?, "INT\n");
        Ok(())
    }

    #[tokio::test]
    async fn programs_ignoring_signals_are_killed() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let signals = dir.path().join("signals");
        let program = test_utils::script(
            dir.path(),
            "sign",
            &format!(
                "trap 'echo INT >> {signals}' INT\n\
                 trap 'echo TERM >> {signals}' TERM\n\
                 while true; do sleep 0.1; done\n",
                signals = signals.display()
            ),
        )?;
        let policy = RetryPolicy {
            timeout: Duration::from_millis(200),
            grace_period: Duration::from_millis(500),
            max_attempts: 1,
            ..policy()
        };

        let started = Instant::now();
        let result = run_signing_program(
            &format(&program, None),
            &dir.path().join("input"),
            &dir.path().join("output"),
            "app.bin",
            &dir.path().join("output.out"),
            policy,
        )
        .await;

        assert!(matches!(result, Err(SigningError::Failed { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
        // The program saw SIGINT, then SIGTERM, and was then killed.
        assert_eq!(std::fs::read_to_string(&signals)?, "INT\nTERM\n");
        Ok(())
    }

    #[test]
    fn retry_delays_grow_linearly_and_saturate() {
        let policy = RetryPolicy {
            retry_delay: Duration::from_secs(2),
            ..policy()
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(6));

        let extreme = RetryPolicy {
            retry_delay: Duration::MAX,
            ..policy
        };
        assert_eq!(extreme.delay_after(u32::MAX), Duration::MAX);
    }

    #[tokio::test]
    async fn self_test_catches_bad_passphrases() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let program = test_utils::script(
            dir.path(),
            "sign",
            "read passphrase\n[ \"$passphrase\" = \"hunter2\" ] || exit 1\ncp \"$2\" \"$3\"\n",
        )?;
        let test_file = dir.path().join("test.exe");
        std::fs::write(&test_file, "test content")?;

        let mut good = format(&program, Some("hunter2"));
        good.test_file = Some(test_file.clone());
        self_test(&good, policy().with_max_attempts(2)).await?;

        let mut bad = format(&program, Some("letmein"));
        bad.test_file = Some(test_file);
        assert!(self_test(&bad, policy().with_max_attempts(2)).await.is_err());

        self_test(&format(&program, None), policy()).await?;
        Ok(())
    }
}
