//! Async decode worker (C5).
//!
//! One worker per stream, core-pinned, driven on demand by the render
//! loop through a mutex and two condition variables: *request* (render
//! loop → worker, "decode the next frame") and *ready* (worker → render
//! loop, "a frame or a terminal outcome is available").

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};
use parking_lot::{Condvar, Mutex};

use crate::core_affinity::{pin_current_thread, reserve_core};
use crate::error::DecodeOutcome;
use crate::pool::Pool;

use super::Decoder;

/// Bounded wait for a worker to notice cancellation and exit cleanly
/// before the supervisor gives up on it (§4.3).
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Decoding,
    FrameReady,
    Terminal(DecodeOutcome),
}

struct Shared {
    status: Mutex<Status>,
    requested: Mutex<bool>,
    exiting: Mutex<bool>,
    slot_index: Mutex<Option<usize>>,
    request_cv: Condvar,
    ready_cv: Condvar,
}

/// Handle to a running decode worker. Dropping it does not stop the
/// thread; call [`Worker::shut_down`] for an orderly stop.
pub struct Worker {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a worker decoding `decoder`'s frames into `pool`, one
    /// dedicated logical core reserved from the process-wide allocator.
    pub fn spawn(stream_index: usize, mut decoder: Box<dyn Decoder>, pool: Arc<Pool>) -> Self {
        let shared = Arc::new(Shared {
            status: Mutex::new(Status::Idle),
            requested: Mutex::new(false),
            exiting: Mutex::new(false),
            slot_index: Mutex::new(None),
            request_cv: Condvar::new(),
            ready_cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let core = reserve_core();
        let join = std::thread::Builder::new()
            .name(format!("decode-worker-{stream_index}"))
            .spawn(move || {
                pin_current_thread(core);
                info!("decode worker {stream_index} started on core {core}");
                run(worker_shared, pool, decoder.as_mut());
            })
            .expect("failed to spawn decode worker thread");

        Self {
            shared,
            join: Some(join),
        }
    }

    /// Signal the worker to decode the next frame, if it is idle. A
    /// no-op while the worker is already decoding or has hit a terminal
    /// outcome.
    pub fn request_next(&self) {
        let mut requested = self.shared.requested.lock();
        *requested = true;
        self.shared.request_cv.notify_one();
    }

    /// Non-blocking check for a terminal outcome, used by the render loop
    /// (which must never block on the worker — frames are picked up
    /// straight from the pool via [`Pool::borrow_latest`]).
    pub fn poll_terminal(&self) -> Option<DecodeOutcome> {
        match self.shared.status.try_lock() {
            Some(status) => match *status {
                Status::Terminal(outcome) => Some(outcome),
                _ => None,
            },
            None => None,
        }
    }

    /// Block until the worker reports *frame-ready* or a terminal
    /// outcome, returning the slot index on success.
    pub fn wait_ready(&self) -> WorkerResult {
        let mut status = self.shared.status.lock();
        loop {
            match *status {
                Status::FrameReady => {
                    *status = Status::Idle;
                    return WorkerResult::Frame(self.shared.slot_index.lock().take().unwrap());
                }
                Status::Terminal(outcome) => return WorkerResult::Terminal(outcome),
                Status::Idle | Status::Decoding => {
                    self.shared.ready_cv.wait(&mut status);
                }
            }
        }
    }

    /// Like [`Worker::wait_ready`], but gives up after `timeout` and
    /// returns `None` instead of blocking indefinitely. Used to enforce
    /// the first-frame decode deadline at stream open.
    pub fn wait_ready_timeout(&self, timeout: Duration) -> Option<WorkerResult> {
        let mut status = self.shared.status.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match *status {
                Status::FrameReady => {
                    *status = Status::Idle;
                    return Some(WorkerResult::Frame(self.shared.slot_index.lock().take().unwrap()));
                }
                Status::Terminal(outcome) => return Some(WorkerResult::Terminal(outcome)),
                Status::Idle | Status::Decoding => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let result = self.shared.ready_cv.wait_for(&mut status, deadline - now);
                    if result.timed_out() {
                        return None;
                    }
                }
            }
        }
    }

    /// Request cancellation and join the thread, up to [`SHUTDOWN_GRACE`].
    /// If the worker is still stuck past the grace period (e.g. blocked
    /// inside the codec library), its thread is abandoned to the OS
    /// rather than blocking the supervisor's teardown indefinitely.
    pub fn shut_down(mut self) {
        *self.shared.exiting.lock() = true;
        *self.shared.requested.lock() = true;
        self.shared.request_cv.notify_one();

        if let Some(join) = self.join.take() {
            let shared = Arc::clone(&self.shared);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = join.join();
                let _ = done_tx.send(());
                drop(shared);
            });
            if done_rx.recv_timeout(SHUTDOWN_GRACE).is_err() {
                warn!("decode worker did not exit within the shutdown grace period");
            }
        }
    }
}

pub enum WorkerResult {
    Frame(usize),
    Terminal(DecodeOutcome),
}

fn run(shared: Arc<Shared>, pool: Arc<Pool>, decoder: &mut dyn Decoder) {
    loop {
        {
            let mut requested = shared.requested.lock();
            while !*requested {
                shared.request_cv.wait(&mut requested);
            }
            *requested = false;
        }

        if *shared.exiting.lock() {
            return;
        }

        *shared.status.lock() = Status::Decoding;

        let Some(idx) = pool.acquire_free() else {
            // The render loop only signals when it believes a slot is
            // free; if that race is lost, just go back to idle and wait
            // for the next request rather than spinning.
            *shared.status.lock() = Status::Idle;
            continue;
        };

        let outcome = pool.decode_into(idx, decoder);

        let mut status = shared.status.lock();
        match outcome {
            DecodeOutcome::Ok => {
                *shared.slot_index.lock() = Some(idx);
                *status = Status::FrameReady;
            }
            DecodeOutcome::Eof | DecodeOutcome::Fatal => {
                *status = Status::Terminal(outcome);
            }
            DecodeOutcome::Retry => unreachable!("Pool::decode_into never returns Retry"),
        }
        drop(status);
        shared.ready_cv.notify_one();

        if matches!(outcome, DecodeOutcome::Eof | DecodeOutcome::Fatal) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FrameSlot;

    struct CountingDecoder {
        frames_remaining: u32,
    }

    impl Decoder for CountingDecoder {
        fn dimensions(&self) -> (u32, u32) {
            (64, 64)
        }

        fn next_frame(&mut self, _slot: &mut FrameSlot) -> DecodeOutcome {
            if self.frames_remaining == 0 {
                return DecodeOutcome::Eof;
            }
            self.frames_remaining -= 1;
            DecodeOutcome::Ok
        }
    }

    #[test]
    fn request_next_produces_a_frame_then_eof() {
        let pool = Arc::new(Pool::new(64, 64, 2));
        let decoder = Box::new(CountingDecoder { frames_remaining: 2 });
        let worker = Worker::spawn(0, decoder, pool);

        worker.request_next();
        assert!(matches!(worker.wait_ready(), WorkerResult::Frame(_)));

        worker.request_next();
        assert!(matches!(worker.wait_ready(), WorkerResult::Frame(_)));

        worker.request_next();
        assert!(matches!(
            worker.wait_ready(),
            WorkerResult::Terminal(DecodeOutcome::Eof)
        ));

        worker.shut_down();
    }

    #[test]
    fn poll_terminal_is_none_until_eof_then_reports_it() {
        let pool = Arc::new(Pool::new(64, 64, 2));
        let decoder = Box::new(CountingDecoder { frames_remaining: 0 });
        let worker = Worker::spawn(0, decoder, pool);

        assert_eq!(worker.poll_terminal(), None);
        worker.request_next();
        assert!(matches!(
            worker.wait_ready(),
            WorkerResult::Terminal(DecodeOutcome::Eof)
        ));
        assert_eq!(worker.poll_terminal(), Some(DecodeOutcome::Eof));
        worker.shut_down();
    }

    #[test]
    fn wait_ready_timeout_gives_up_when_no_request_was_made() {
        let pool = Arc::new(Pool::new(64, 64, 2));
        let decoder = Box::new(CountingDecoder { frames_remaining: 1 });
        let worker = Worker::spawn(0, decoder, pool);
        // No request_next() call, so the worker never produces anything.
        assert!(worker.wait_ready_timeout(Duration::from_millis(50)).is_none());
        worker.shut_down();
    }

    #[test]
    fn shut_down_returns_within_the_grace_period_for_an_idle_worker() {
        let pool = Arc::new(Pool::new(64, 64, 2));
        let decoder = Box::new(CountingDecoder { frames_remaining: 100 });
        let worker = Worker::spawn(0, decoder, pool);
        let start = std::time::Instant::now();
        worker.shut_down();
        assert!(start.elapsed() < SHUTDOWN_GRACE * 2);
    }
}
