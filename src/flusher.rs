//! A background thread that sends queued events to the server.
use std::{
    sync::{
        mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError},
        Arc,
    },
    time::Duration,
};

use crate::{api_client::ApiClient, batch::BatchEventQueue, event::CapturedEvent, Error, Result};

/// Configuration for [`FlusherThread`].
#[derive(Debug, Clone)]
pub(crate) struct FlusherConfig {
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
}

/// Exponential backoff for retryable batch failures.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub max_retry_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (starting at 0).
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_interval
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

enum Command {
    /// Flush the queue. The sender, if any, is notified when the flush is done.
    Flush(Option<SyncSender<()>>),
    Stop,
}

/// The flusher thread.
///
/// Flushes every `flush_interval`, when triggered, and one final time when stopped.
pub(crate) struct FlusherThread {
    join_handle: std::thread::JoinHandle<()>,
    command_sender: SyncSender<Command>,
}

impl FlusherThread {
    pub fn start(
        api: Arc<ApiClient>,
        queue: BatchEventQueue,
        config: FlusherConfig,
    ) -> std::io::Result<FlusherThread> {
        // Triggers use `try_send()`: a full buffer means a flush is already pending.
        let (command_sender, command_receiver) = std::sync::mpsc::sync_channel::<Command>(8);

        let join_handle = std::thread::Builder::new()
            .name("posthog-flusher".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run(&api, &queue, &config, &command_receiver)
                }));
                if result.is_err() {
                    log::error!(target: "posthog", "flusher thread panicked, queued events are not sent anymore");
                }
            })?;

        Ok(FlusherThread {
            join_handle,
            command_sender,
        })
    }

    /// Ask the thread to flush without waiting.
    pub fn trigger(&self) {
        match self.command_sender.try_send(Command::Flush(None)) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                log::warn!(target: "posthog", "flusher thread is not running");
            }
        }
    }

    /// Flush the queue and block until the server received all queued events (or they were
    /// dropped after failing).
    pub fn flush(&self) -> Result<()> {
        let (ack_sender, ack_receiver) = std::sync::mpsc::sync_channel(1);
        self.command_sender
            .send(Command::Flush(Some(ack_sender)))
            .map_err(|_| Error::Shutdown)?;
        ack_receiver.recv().map_err(|_| Error::Shutdown)
    }

    /// Flush remaining events, stop the thread and wait for it to exit.
    pub fn shutdown(self) -> Result<()> {
        // Error means the thread has already exited.
        let _ = self.command_sender.send(Command::Stop);
        self.join_handle
            .join()
            .map_err(|_| Error::ThreadPanicked("flusher"))
    }
}

fn run(
    api: &ApiClient,
    queue: &BatchEventQueue,
    config: &FlusherConfig,
    commands: &Receiver<Command>,
) {
    loop {
        match commands.recv_timeout(config.flush_interval) {
            Err(RecvTimeoutError::Timeout) => flush_queue(api, queue, &config.retry),
            Ok(Command::Flush(ack)) => {
                flush_queue(api, queue, &config.retry);
                if let Some(ack) = ack {
                    // The waiter may have gone away.
                    let _ = ack.send(());
                }
            }
            Ok(Command::Stop) => {
                log::debug!(target: "posthog", "flusher thread received stop command");
                flush_queue(api, queue, &config.retry);
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!(target: "posthog", "flusher thread received disconnected");
                flush_queue(api, queue, &config.retry);
                return;
            }
        }
    }
}

/// Send all queued events in batches.
pub(crate) fn flush_queue(api: &ApiClient, queue: &BatchEventQueue, retry: &RetryPolicy) {
    loop {
        let batch = queue.next_batch();
        if batch.is_empty() {
            return;
        }
        if let Err(err) = send_with_retry(api, &batch, retry) {
            log::warn!(target: "posthog", events = batch.len(); "dropping batch of events: {err}");
        }
    }
}

fn send_with_retry(api: &ApiClient, batch: &[CapturedEvent], retry: &RetryPolicy) -> Result<()> {
    let mut attempt = 0;
    loop {
        match api.capture_batch(batch) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay(attempt);
                log::debug!(target: "posthog", attempt = attempt + 1, delay_ms = delay.as_millis() as u64; "retrying batch: {err}");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
