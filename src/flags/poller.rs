//! A background poller thread that periodically requests flag definitions from the server and
//! stores them for local evaluation.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    api_client::ApiClient,
    flags::{eval::LocalEvaluator, store::LocalFlagsStore},
    Error, Result,
};

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub(crate) struct PollerThreadConfig {
    /// Interval to wait between requests for definitions.
    pub interval: Duration,
    /// Randomized duration subtracted from `interval` on every iteration, so that multiple
    /// server instances don't synchronize and produce spiky network load.
    pub jitter: Duration,
}

/// Fetch flag definitions once and replace the contents of `store`.
///
/// A quota limited project loses its definitions, so flags fall back to the server.
pub(crate) fn load_flags(api: &ApiClient, store: &LocalFlagsStore) -> Result<()> {
    match api.local_evaluation() {
        Ok(response) => {
            let evaluator = LocalEvaluator::from_response(response);
            log::debug!(target: "posthog", flags = evaluator.len(); "loaded flag definitions");
            store.set(evaluator);
            Ok(())
        }
        Err(Error::QuotaLimited) => {
            store.clear();
            Err(Error::QuotaLimited)
        }
        Err(err) => Err(err),
    }
}

/// A flag definitions poller thread.
///
/// The poller thread polls the server periodically to fetch the latest definitions and stores them
/// in the client's local flags store. The client keeps a stop handle of its own, so the thread
/// outlives this value until it is stopped or the client shuts down.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` if definitions haven't been fetched yet. Holds `Some(Ok(()))` if definitions
    /// have been fetched successfully. Holds `Some(Err(...))` if there was an unrecoverable error.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    /// Starts the poller thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub(crate) fn start(
        api: Arc<ApiClient>,
        store: Arc<LocalFlagsStore>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // A buffer of 1 is enough: a stop command is sent with `try_send()` and a full buffer
        // means another thread has already asked to stop.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            let result = Arc::clone(&result);
            let update_result = move |value| {
                let mut slot = result.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                *slot = Some(value);
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("posthog-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        log::debug!(target: "posthog", "polling flag definitions");
                        match load_flags(&api, &store) {
                            Ok(()) => update_result(Ok(())),
                            Err(
                                err @ (Error::Unauthorized
                                | Error::InvalidHostUrl(_)
                                | Error::PersonalApiKeyRequired),
                            ) => {
                                // Unrecoverable errors
                                log::warn!(target: "posthog", "stopping flag poller: {err}");
                                update_result(Err(err));
                                return;
                            }
                            Err(err) => {
                                log::warn!(target: "posthog", "failed to load flag definitions: {err}");
                            }
                        }

                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) => {
                                log::debug!(target: "posthog", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "posthog", "poller thread received disconnected");
                                return;
                            }
                        }
                    }));

                    if result.is_err() {
                        update_result(Err(Error::ThreadPanicked("poller")));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Waits for the first successful definitions fetch.
    ///
    /// # Errors
    ///
    /// - [`Error::ThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidHostUrl`]
    /// - [`Error::PersonalApiKeyRequired`]
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::ThreadPanicked("poller"))?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::ThreadPanicked("poller"))?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Either the thread has already exited or a stop command is pending.
        let _ = self.stop_sender.try_send(());
    }

    pub(crate) fn stop_handle(&self) -> PollerStopHandle {
        PollerStopHandle(self.stop_sender.clone())
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle
            .join()
            .map_err(|_| Error::ThreadPanicked("poller"))?;
        Ok(())
    }
}

/// Lets the client stop pollers it started without owning them.
#[derive(Clone)]
pub(crate) struct PollerStopHandle(std::sync::mpsc::SyncSender<()>);

impl PollerStopHandle {
    pub fn stop(&self) {
        let _ = self.0.try_send(());
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
