use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use super::dispatch::{Dispatched, Dispatcher};
use crate::cancel::CancellationToken;
use crate::codec::LogRecord;
use crate::config::EngineConfig;
use crate::engine::{EngineError, EngineResult};
use crate::wal::{FlushObserver, LogPosition, WalReader, WalWriter};

const THREAD_NAME: &str = "duralog-applier";

struct Progress {
    /// Next record to apply.
    applied: LogPosition,
    /// Latest record boundary with no transaction batch pending.
    quiescent: LogPosition,
    failure: Option<String>,
    wake: bool,
}

struct Shared {
    progress: Mutex<Progress>,
    cond: Condvar,
    /// Unapplied WAL bytes that trigger an early wake-up.
    high_water: u64,
    log_size: u64,
    interval: Duration,
    backoff: Duration,
    cancel: CancellationToken,
}

impl Shared {
    fn wake(&self) {
        let mut progress = self.progress.lock();
        progress.wake = true;
        self.cond.notify_all();
    }
}

impl FlushObserver for Shared {
    fn flushed(&self, frontier: LogPosition) {
        let mut progress = self.progress.lock();
        if progress.applied.bytes_until(frontier, self.log_size) >= self.high_water {
            progress.wake = true;
            self.cond.notify_all();
        }
    }
}

/// Background thread that applies flushed WAL records to the row layer.
pub struct Applier {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Applier {
    /// Start applying at `start`, which must be a record boundary.
    pub fn spawn(
        config: &EngineConfig,
        writer: Arc<WalWriter>,
        dispatcher: Dispatcher,
        start: LogPosition,
    ) -> EngineResult<Self> {
        let shared = Arc::new(Shared {
            progress: Mutex::new(Progress {
                applied: start,
                quiescent: start,
                failure: None,
                wake: false,
            }),
            cond: Condvar::new(),
            high_water: (config.cache_bytes() as f64 * config.applier_high_water) as u64,
            log_size: config.wal_log_size,
            interval: config.apply_interval(),
            backoff: config.retry_backoff(),
            cancel: CancellationToken::new(),
        });
        writer.set_observer(Arc::clone(&shared) as Arc<dyn FlushObserver>);

        let worker = Worker {
            shared: Arc::clone(&shared),
            reader: WalReader::new(Arc::clone(&writer), start, config.max_record_len()),
            writer,
            dispatcher,
            held: None,
        };
        let handle = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || worker.run())
            .map_err(|source| EngineError::Spawn {
                name: THREAD_NAME,
                source,
            })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn applied(&self) -> LogPosition {
        self.shared.progress.lock().applied
    }

    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Block until the record at `barrier` has been applied, and return the
    /// quiescent position at that moment. Everything up to the returned
    /// position is in the row layer before the call returns.
    ///
    /// Progress is compared by position, not by sequence number, so a
    /// barrier is never satisfied by a record that merely carries a larger
    /// sequence number.
    pub fn wait_synced(&self, barrier: LogPosition) -> EngineResult<LogPosition> {
        self.shared.wake();
        let mut progress = self.shared.progress.lock();
        loop {
            if progress.applied > barrier {
                return Ok(progress.quiescent);
            }
            if let Some(failure) = &progress.failure {
                return Err(EngineError::Applier(failure.clone()));
            }
            if self.shared.cancel.is_cancelled() {
                return Err(EngineError::Stopped);
            }
            self.shared.cond.wait_for(&mut progress, self.shared.interval);
        }
    }

    /// Stop the thread and wait for it. Records flushed but not yet applied
    /// stay in the WAL for the next replay.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
        self.shared.wake();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("applier thread panicked");
            }
        }
    }
}

impl Drop for Applier {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    shared: Arc<Shared>,
    writer: Arc<WalWriter>,
    reader: WalReader<Arc<WalWriter>>,
    dispatcher: Dispatcher,
    /// A record that failed to apply, retried before reading further.
    held: Option<(LogPosition, LogRecord)>,
}

impl Worker {
    fn run(mut self) {
        info!(start = %self.reader.position(), "applier started");
        let cancel = self.shared.cancel.clone();
        while !cancel.is_cancelled() {
            let target = self.writer.frontier();
            if self.held.is_none() && self.reader.position() >= target {
                self.idle();
                continue;
            }
            if let Err(e) = self.step(target) {
                error!(error = %e, code = e.code(), position = %self.reader.position(), "apply failed, retrying");
                if e.is_fatal() {
                    self.shared.progress.lock().failure = Some(e.to_string());
                    self.shared.cond.notify_all();
                }
                if cancel.sleep(self.shared.backoff) {
                    break;
                }
            }
        }
        info!(applied = %self.reader.position(), "applier stopped");
    }

    fn idle(&self) {
        let mut progress = self.shared.progress.lock();
        if !progress.wake {
            self.shared
                .cond
                .wait_for(&mut progress, self.shared.interval);
        }
        progress.wake = false;
    }

    fn step(&mut self, target: LogPosition) -> EngineResult<()> {
        let (pos, record) = match self.held.take() {
            Some(held) => held,
            None => match self.reader.seq_next(Some(target))? {
                Some(next) => next,
                None => return Ok(()),
            },
        };

        let outcome = match self.dispatcher.dispatch(pos, &record) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.held = Some((pos, record));
                return Err(e);
            }
        };

        let next = self.reader.position();
        let mut progress = self.shared.progress.lock();
        progress.applied = next;
        if self.dispatcher.is_quiescent() {
            progress.quiescent = next;
        }
        if let Dispatched::Sync(seq) = outcome {
            debug!(seq, position = %pos, "sync barrier applied");
        }
        self.shared.cond.notify_all();
        Ok(())
    }
}
