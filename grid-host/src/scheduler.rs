//! The cluster's batch scheduler, driven over the frontend shell.
//!
//! The scheduler has no API; everything goes through its command-line
//! tools, with grep/sed pipelines on the frontend doing the parsing. The
//! command strings here are load-bearing and mirror what the tools print.

use crate::shell::{CommandRunner, ShellError};
use std::sync::Arc;
use std::time::Duration;

/// Errors from scheduler interactions.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The frontend shell failed underneath the scheduler command.
    #[error("shell error during scheduler command: {0}")]
    Shell(#[from] ShellError),

    /// The submission did not yield a usable reservation id.
    #[error("scheduler did not return a reservation id (got '{output}')")]
    BadReservationId {
        /// What the submission pipeline printed instead.
        output: String,
    },

    /// The reservation disappeared or failed before becoming ready.
    #[error("reservation {reservation} never became ready (observed '{output}')")]
    NotReady {
        /// The reservation being polled.
        reservation: String,
        /// The poll output that was neither OK nor TIME.
        output: String,
    },

    /// The ready poll was retried too many times.
    #[error("reservation {reservation} still not ready after {attempts} polls")]
    PollTimeout {
        /// The reservation being polled.
        reservation: String,
        /// How many polls were attempted.
        attempts: u32,
    },

    /// The node list could not be extracted from the reservation.
    #[error("could not extract nodes for reservation {reservation} (got '{output}')")]
    NodeExtraction {
        /// The reservation being listed.
        reservation: String,
        /// What the extraction pipeline printed.
        output: String,
    },

    /// A granted node did not answer its reachability probe.
    #[error("node {node} is not reachable (observed '{output}')")]
    NodeUnreachable {
        /// The node that failed the probe.
        node: String,
        /// The probe output.
        output: String,
    },
}

/// A reservation id as printed by the scheduler: a positive decimal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReservationId(String);

impl ReservationId {
    /// The id exactly as the scheduler printed it.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Drives the batch scheduler through a frontend [`CommandRunner`].
pub struct SchedulerClient {
    runner: Arc<dyn CommandRunner>,
    max_poll_attempts: u32,
    poll_sleep: Duration,
}

impl SchedulerClient {
    /// Create a client running scheduler commands through `runner`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        max_poll_attempts: u32,
        poll_sleep: Duration,
    ) -> Self {
        Self {
            runner,
            max_poll_attempts,
            poll_sleep,
        }
    }

    /// Load the scheduler tools into the frontend shell's environment.
    pub async fn initialize(&self) -> Result<(), SchedulerError> {
        self.runner.run("module load prun").await?;
        Ok(())
    }

    /// Reserve `node_count` nodes for `duration_secs` seconds.
    pub async fn submit(
        &self,
        node_count: usize,
        duration_secs: u64,
    ) -> Result<ReservationId, SchedulerError> {
        let command = format!(
            "preserve -1 -# {node_count} {duration_secs} \
             | grep \"Reservation number\" \
             | sed -e \"s/^Reservation number \\([[:digit:]]*\\):$/\\1/\" \
             | grep -E \"^[[:digit:]]*$\""
        );
        let output = self.runner.run(&command).await?;
        let id = output.trim();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SchedulerError::BadReservationId {
                output: output.clone(),
            });
        }
        tracing::info!(reservation = id, node_count, "reservation submitted");
        Ok(ReservationId(id.to_string()))
    }

    /// Poll until the reservation's nodes are handed out.
    ///
    /// Each poll runs a composite command on the frontend that prints OK
    /// once the nodes show up, TIME when the scheduler is still thinking,
    /// and anything else when the reservation is gone.
    pub async fn wait_ready(&self, reservation: &ReservationId) -> Result<(), SchedulerError> {
        let command = poll_command(reservation);
        for attempt in 1..=self.max_poll_attempts {
            let output = self.runner.run(&command).await?;
            match output.as_str() {
                "OK" => {
                    tracing::info!(reservation = %reservation, "reservation ready");
                    return Ok(());
                }
                "TIME" => {
                    tracing::debug!(
                        reservation = %reservation,
                        attempt,
                        "reservation not ready yet"
                    );
                    tokio::time::sleep(self.poll_sleep).await;
                }
                _ => {
                    return Err(SchedulerError::NotReady {
                        reservation: reservation.to_string(),
                        output,
                    });
                }
            }
        }
        Err(SchedulerError::PollTimeout {
            reservation: reservation.to_string(),
            attempts: self.max_poll_attempts,
        })
    }

    /// The nodes granted to a ready reservation, in scheduler order.
    pub async fn granted_nodes(
        &self,
        reservation: &ReservationId,
    ) -> Result<Vec<String>, SchedulerError> {
        let command = format!(
            "preserve -llist | grep -E \"^{id}[[:space:]]\" \
             | sed -e \"s/^{d}{s}{ns}{s}{ns}{s}{ns}{s}{ns}{s}{ns}{s}r{s}{d}{s}\\(.*\\)$/\\1/\"",
            id = reservation,
            s = "[[:space:]][[:space:]]*",
            d = "[[:digit:]][[:digit:]]*",
            ns = "[^[:space:]][^[:space:]]*",
        );
        let output = self.runner.run(&command).await?;
        if output.is_empty() {
            return Err(SchedulerError::NodeExtraction {
                reservation: reservation.to_string(),
                output,
            });
        }
        // The sed not matching leaves the raw listing line, which starts
        // with the reservation id.
        if output.starts_with(&format!("{reservation} ")) {
            return Err(SchedulerError::NodeExtraction {
                reservation: reservation.to_string(),
                output,
            });
        }
        Ok(output.split_whitespace().map(str::to_string).collect())
    }

    /// Check that a granted node answers over SSH.
    pub async fn probe_node(
        &self,
        reservation: &ReservationId,
        node: &str,
    ) -> Result<(), SchedulerError> {
        let command = format!(
            "if ! qstat -j {reservation} > /dev/null 2> /dev/null; then echo \"ERR\"; \
             else ssh -n -T -o BatchMode=yes {node} \"echo \\\"OK\\\"\"; fi"
        );
        let output = self.runner.run(&command).await?;
        if output.lines().last() != Some("OK") {
            return Err(SchedulerError::NodeUnreachable {
                node: node.to_string(),
                output,
            });
        }
        Ok(())
    }

    /// Cancel the reservation.
    pub async fn cancel(&self, reservation: &ReservationId) -> Result<(), SchedulerError> {
        self.runner
            .run(&format!("preserve -c {reservation}"))
            .await?;
        tracing::info!(reservation = %reservation, "reservation cancelled");
        Ok(())
    }
}

/// The composite ready-poll command.
///
/// Bounded on the frontend side as well: a handful of in-shell checks, then
/// TIME so the caller can decide whether to keep waiting.
fn poll_command(reservation: &ReservationId) -> String {
    format!(
        "ERR=0; COUNT=0; \
         while ! qstat -j {id} | grep \"usage\" {devnull}; do \
         if ! qstat -j {id} {devnull}; then echo \"ERR\"; ERR=1; break; fi; \
         sleep 1; \
         if [ $COUNT -gt 3 ]; then echo \"TIME\"; ERR=1; break; fi; \
         COUNT=$(($COUNT + 1)); \
         done; \
         if [ $ERR -eq 0 ]; then \
         while ! preserve -llist | grep -E \"^{id}[[:space:]]\" \
         | sed -e \"s/^{d}{s}{ns}{s}{ns}{s}{ns}{s}{ns}{s}{ns}{s}r{s}{d}{s}\\(.*\\)$/\\1/\" \
         | grep -v -E \"^{id}[[:space:]]\" {devnull}; do \
         if ! qstat -j {id} {devnull}; then echo \"ERR\"; ERR=1; break; fi; \
         sleep 1; \
         done; \
         fi; \
         if [ $ERR -eq 0 ]; then echo \"OK\"; fi",
        id = reservation,
        devnull = ">/dev/null 2>/dev/null",
        s = "[[:space:]][[:space:]]*",
        d = "[[:digit:]][[:digit:]]*",
        ns = "[^[:space:]][^[:space:]]*",
    )
}
