use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::DownloadConfig;
use crate::domain::{ChannelEntry, Inventory, TimeWindow};
use crate::error::HarvestError;
use crate::fdsn::FdsnClient;
use crate::preprocess::Preprocessor;
use crate::trace::Trace;

/// One channel to fetch for one chunk. `index` points into the inventory.
#[derive(Debug, Clone, Copy)]
pub struct FetchTask<'a> {
    pub index: usize,
    pub entry: &'a ChannelEntry,
    pub window: TimeWindow,
}

#[derive(Debug)]
pub enum TaskOutcome {
    Success(Trace),
    /// The service confirmed there is nothing for this channel and window.
    NoData,
    Failed { reason: String },
}

#[derive(Debug)]
pub struct FetchResult {
    pub index: usize,
    pub attempts: u32,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_attempts: config.fetch_attempts.max(1),
            delay: config.retry_delay,
        }
    }

    /// Linear backoff after the given failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.delay * attempt
    }
}

enum TaskState {
    Fetching { attempt: u32 },
    Retry { attempt: u32 },
    Done { attempt: u32, outcome: TaskOutcome },
}

/// Bounded worker pool that fetches and cleans every pending channel of a
/// chunk and hands results back in completion order.
pub struct FetchScheduler<'a, C: FdsnClient, P: Preprocessor> {
    client: &'a C,
    preprocessor: &'a P,
    config: &'a DownloadConfig,
    inventory: &'a Inventory,
    workers: usize,
    retry: RetryPolicy,
}

impl<'a, C: FdsnClient, P: Preprocessor> FetchScheduler<'a, C, P> {
    pub fn new(
        client: &'a C,
        preprocessor: &'a P,
        config: &'a DownloadConfig,
        inventory: &'a Inventory,
    ) -> Self {
        Self {
            client,
            preprocessor,
            config,
            inventory,
            workers: config.max_workers.max(1),
            retry: RetryPolicy::from_config(config),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Runs one task to a terminal state.
    pub fn execute(&self, task: &FetchTask<'_>) -> FetchResult {
        let label = task.entry.label();
        let mut state = TaskState::Fetching { attempt: 1 };
        loop {
            state = match state {
                TaskState::Fetching { attempt } => {
                    debug!(channel = %label, attempt, "fetching");
                    match self.client.fetch_waveform(task.entry, &task.window) {
                        Ok(raw) if raw.is_empty() => {
                            warn!(channel = %label, window = %task.window, "response carried no samples");
                            TaskState::Done {
                                attempt,
                                outcome: TaskOutcome::NoData,
                            }
                        }
                        Ok(raw) => {
                            debug!(channel = %label, samples = raw.sample_count(), "fetched");
                            let outcome = match self.preprocessor.preprocess(
                                raw,
                                self.inventory,
                                self.config,
                                &task.window,
                            ) {
                                Ok(trace) => TaskOutcome::Success(trace),
                                Err(err) => {
                                    warn!(channel = %label, window = %task.window, error = %err, "preprocessing failed");
                                    TaskOutcome::Failed {
                                        reason: err.to_string(),
                                    }
                                }
                            };
                            TaskState::Done { attempt, outcome }
                        }
                        Err(HarvestError::NoData(_)) => {
                            warn!(channel = %label, window = %task.window, "no data");
                            TaskState::Done {
                                attempt,
                                outcome: TaskOutcome::NoData,
                            }
                        }
                        Err(err) if attempt < self.retry.max_attempts => {
                            warn!(channel = %label, attempt, error = %err, "fetch failed, retrying");
                            TaskState::Retry { attempt }
                        }
                        Err(err) => {
                            warn!(channel = %label, attempts = attempt, error = %err, "fetch failed, giving up");
                            TaskState::Done {
                                attempt,
                                outcome: TaskOutcome::Failed {
                                    reason: err.to_string(),
                                },
                            }
                        }
                    }
                }
                TaskState::Retry { attempt } => {
                    let delay = self.retry.backoff(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    TaskState::Fetching {
                        attempt: attempt + 1,
                    }
                }
                TaskState::Done { attempt, outcome } => {
                    return FetchResult {
                        index: task.index,
                        attempts: attempt,
                        outcome,
                    };
                }
            };
        }
    }

    /// Dispatches every task and passes each result to `on_result` on the
    /// calling thread as soon as it completes. The first error returned by
    /// `on_result` stops dispatch of queued tasks and is returned once the
    /// workers have wound down.
    pub fn run<F>(&self, tasks: Vec<FetchTask<'_>>, mut on_result: F) -> Result<(), HarvestError>
    where
        F: FnMut(FetchResult) -> Result<(), HarvestError>,
    {
        if tasks.is_empty() {
            return Ok(());
        }
        let workers = self.workers.min(tasks.len());
        let queue = Mutex::new(tasks.into_iter());
        let (tx, rx) = mpsc::channel::<FetchResult>();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = queue.lock().ok().and_then(|mut pending| pending.next());
                        let Some(task) = next else {
                            break;
                        };
                        if tx.send(self.execute(&task)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for result in rx {
                on_result(result)?;
            }
            Ok(())
        })
    }
}
