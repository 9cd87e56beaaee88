//! Outbound send wrapper.
//!
//! Every message leaving the process goes through here: scheduled on the
//! process-wide [`RateBucket`], raced against a hard timeout, retried on
//! transient failures, and — when the server rate-limits a mention-carrying
//! payload — retried once with mentions stripped, since mentions make the
//! driver fetch group metadata and multiply the rate budget.

use std::sync::Arc;
use std::time::Duration;

use crate::driver::{DriverError, MessageContent, SendOptions, SentMessage, SocketDriver};
use crate::rate_bucket::{OpClass, RateBucket};

/// Hard per-call bound on one send attempt.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(40);

/// Transient failures are retried this many times, with 1 s then 2 s backoff.
const MAX_TRANSIENT_RETRIES: u32 = 2;

/// Shared send path. One per process.
pub struct Outbound {
    bucket: Arc<RateBucket>,
}

impl Outbound {
    /// Wrapper over a shared bucket.
    pub fn new(bucket: Arc<RateBucket>) -> Self {
        Self { bucket }
    }

    /// The bucket all sends are scheduled through.
    pub fn bucket(&self) -> &Arc<RateBucket> {
        &self.bucket
    }

    /// Send a message with the full retry policy.
    ///
    /// `ephemeral_expiration` defaults to 0 unless the caller set it.
    ///
    /// # Errors
    ///
    /// Returns the final [`DriverError`] once the retry budget is exhausted
    /// or a non-retryable failure occurs.
    pub async fn send(
        &self,
        driver: &dyn SocketDriver,
        jid: &str,
        content: MessageContent,
        options: SendOptions,
    ) -> Result<SentMessage, DriverError> {
        let mut options = options;
        options.ephemeral_expiration.get_or_insert(0);

        let mut content = content;
        let mut transient_attempts = 0u32;
        let mut mentions_stripped = false;

        loop {
            match self.attempt(driver, jid, &content, &options).await {
                Ok(sent) => return Ok(sent),
                Err(DriverError::RateLimited)
                    if !mentions_stripped && !content.mentions.is_empty() =>
                {
                    tracing::debug!(jid, "rate limited with mentions, retrying stripped");
                    mentions_stripped = true;
                    content = content.without_mentions();
                }
                Err(e) if e.is_transient() && transient_attempts < MAX_TRANSIENT_RETRIES => {
                    transient_attempts += 1;
                    tracing::debug!(
                        jid,
                        attempt = transient_attempts,
                        error = %e,
                        "transient send failure, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(u64::from(transient_attempts))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One scheduled, timeout-bounded attempt.
    async fn attempt(
        &self,
        driver: &dyn SocketDriver,
        jid: &str,
        content: &MessageContent,
        options: &SendOptions,
    ) -> Result<SentMessage, DriverError> {
        self.bucket
            .run(OpClass::Send, async {
                match tokio::time::timeout(
                    SEND_TIMEOUT,
                    driver.send_message(jid, content.clone(), options.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DriverError::Timeout),
                }
            })
            .await
    }
}
