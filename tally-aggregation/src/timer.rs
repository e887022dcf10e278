// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dedicated scheduler thread for the persistence cycle.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::sync::{Parker, Unparker};

use crate::persistence::PersistenceCycle;

/// Builder for [`PersistenceTimer`].
pub struct PersistenceTimerBuilder {
    flush_interval: Duration,
    shutdown_timeout: Duration,
    thread_name: String,
}

impl Default for PersistenceTimerBuilder {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3),
            shutdown_timeout: Duration::from_secs(30),
            thread_name: "tally-persistence".into(),
        }
    }
}

impl PersistenceTimerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the cycle ticks. Defaults to 3 seconds, which is also the worst-case
    /// staleness of persisted aggregates.
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        assert!(
            flush_interval > Duration::ZERO,
            "flush_interval must not be zero"
        );
        self.flush_interval = flush_interval;
        self
    }

    /// How long [`PersistenceTimer::close`] waits for the final tick. Defaults to 30 seconds.
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        assert!(
            shutdown_timeout > Duration::ZERO,
            "shutdown_timeout must not be zero"
        );
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty());
        self.thread_name = name;
        self
    }

    /// Start ticking `cycle` on a new thread.
    pub fn start(self, cycle: Arc<PersistenceCycle>) -> std::io::Result<PersistenceTimer> {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let shutdown_signal = Arc::new(AtomicBool::new(false));
        let scheduler = Scheduler {
            cycle,
            flush_interval: self.flush_interval,
            shutdown_signal: Arc::clone(&shutdown_signal),
            parker,
        };
        let handle = thread::Builder::new()
            .name(self.thread_name)
            .spawn(move || scheduler.run())?;
        Ok(PersistenceTimer {
            handle: Some(handle),
            shutdown_signal,
            unparker,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Guard for the persistence thread. Dropping it runs a final tick and stops the thread.
pub struct PersistenceTimer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown_signal: Arc<AtomicBool>,
    unparker: Unparker,
    shutdown_timeout: Duration,
}

impl PersistenceTimer {
    /// Alias for `drop(timer)`.
    pub fn close(self) {}
}

impl Drop for PersistenceTimer {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown_signal.store(true, Ordering::Release);
        self.unparker.unpark();
        tracing::info!("awaiting final persistence tick");
        let deadline = Instant::now() + self.shutdown_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("final persistence tick did not finish in time, abandoning it");
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if handle.join().is_err() {
            tracing::error!("persistence thread panicked");
        }
        tracing::info!("persistence thread shut down");
    }
}

struct Scheduler {
    cycle: Arc<PersistenceCycle>,
    flush_interval: Duration,
    shutdown_signal: Arc<AtomicBool>,
    parker: Parker,
}

impl Scheduler {
    fn run(self) {
        let span = tracing::span!(tracing::Level::TRACE, "tally persistence");
        let _enter = span.enter();
        let mut next_tick = Instant::now() + self.flush_interval;
        loop {
            self.parker.park_deadline(next_tick);
            if self.shutdown_signal.load(Ordering::Acquire) {
                break;
            }
            if Instant::now() < next_tick {
                // spurious wakeup
                continue;
            }
            self.cycle.tick();
            next_tick = Instant::now() + self.flush_interval;
        }
        let report = self.cycle.tick();
        tracing::info!(
            written = report.written,
            restored = report.restored,
            "final persistence tick finished"
        );
    }
}
