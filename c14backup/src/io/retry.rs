//! Bounded retry with a fixed delay between attempts.
//!
//! External tools talking to the provider fail intermittently. Each caller
//! decides what counts as success, what failure is tolerable (the desired
//! state already holds) and what is worth another attempt.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::RetryExhausted;
use crate::io::process::{CommandOutput, CommandRunner, CommandSpec};

/// Classification of one command attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// Non-zero result that still leaves things in a usable state.
    Tolerated(String),
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `spec` until `classify` accepts its output or attempts run out.
    ///
    /// Spawn failures (tool missing) are returned immediately. Exhaustion
    /// returns [`RetryExhausted`] carrying the last attempt's full output.
    pub fn run_command<R, F>(
        &self,
        runner: &R,
        label: &str,
        spec: &CommandSpec,
        classify: F,
    ) -> Result<CommandOutput>
    where
        R: CommandRunner + ?Sized,
        F: Fn(&CommandOutput) -> Verdict,
    {
        let mut last_output = String::new();
        for attempt in 1..=self.max_attempts {
            let output = runner.run(spec)?;
            match classify(&output) {
                Verdict::Success => {
                    debug!(label, attempt, "command succeeded");
                    return Ok(output);
                }
                Verdict::Tolerated(reason) => {
                    debug!(label, attempt, reason = %reason, "tolerated command failure");
                    return Ok(output);
                }
                Verdict::Retry => {
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        exit_code = ?output.exit_code,
                        "command failed"
                    );
                    last_output = output.describe(spec);
                }
            }
            if attempt < self.max_attempts {
                thread::sleep(self.delay);
            }
        }
        Err(RetryExhausted {
            label: label.to_string(),
            attempts: self.max_attempts,
            last_output,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, output};

    fn exit_zero(out: &CommandOutput) -> Verdict {
        if out.success() {
            Verdict::Success
        } else {
            Verdict::Retry
        }
    }

    #[test]
    fn retries_until_success() {
        let runner = ScriptedRunner::new();
        runner.push("rsync", output(12, "", "connection unexpectedly closed"));
        runner.push("rsync", output(12, "", "connection unexpectedly closed"));
        runner.push("rsync", output(0, "done", ""));

        let policy = RetryPolicy::new(5, Duration::ZERO);
        let out = policy
            .run_command(&runner, "transfer", &CommandSpec::new("rsync"), exit_zero)
            .expect("eventually succeeds");
        assert_eq!(out.stdout_text(), "done");
        assert_eq!(runner.calls_to("rsync").len(), 3);
    }

    #[test]
    fn exhaustion_reports_last_output() {
        let runner = ScriptedRunner::new();
        for i in 0..3 {
            runner.push("sshfs", output(1, "", &format!("attempt {i} refused")));
        }

        let policy = RetryPolicy::new(3, Duration::ZERO);
        let err = policy
            .run_command(&runner, "mount", &CommandSpec::new("sshfs").arg("u@h:/buffer"), exit_zero)
            .unwrap_err();
        let exhausted = err.downcast_ref::<RetryExhausted>().expect("retry exhausted");
        assert_eq!(exhausted.attempts, 3);
        assert!(exhausted.last_output.contains("attempt 2 refused"));
        assert!(exhausted.last_output.contains("sshfs u@h:/buffer"));
    }

    #[test]
    fn tolerated_failure_stops_retrying() {
        let runner = ScriptedRunner::new();
        runner.push("sshfs", output(1, "", "fuse: mountpoint is not empty"));

        let policy = RetryPolicy::new(5, Duration::ZERO);
        policy
            .run_command(&runner, "mount", &CommandSpec::new("sshfs"), |out| {
                if out.lines().iter().any(|l| l == "fuse: mountpoint is not empty") {
                    Verdict::Tolerated("already mounted".to_string())
                } else {
                    exit_zero(out)
                }
            })
            .expect("tolerated");
        assert_eq!(runner.calls_to("sshfs").len(), 1);
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
