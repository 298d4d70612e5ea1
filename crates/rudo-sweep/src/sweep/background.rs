//! Background sweeper thread.
//!
//! The mutator hands the whole sweep state (session, catalog and partial
//! state) to the worker as one [`SweepJob`] and gets it back at the
//! rendezvous. Nothing is shared mutably between the two threads while
//! the job is out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use super::{PartialCollectState, SweepSession};
use crate::error::{Result, SweepError};
use crate::heap::{DisposeQueues, HeapInfo};
use crate::tracing::internal as trace;

/// Everything the background pass needs, moved to the worker and back.
#[derive(Debug)]
pub(crate) struct SweepJob {
    pub session: SweepSession,
    pub heap: Box<HeapInfo>,
    pub partial: PartialCollectState,
    pub dispose: Arc<DisposeQueues>,
}

type JobResult = (SweepJob, Result<()>);

/// A dedicated thread running the first sweep pass and `finish`.
#[derive(Debug)]
pub struct BackgroundSweeper {
    jobs: Option<Sender<SweepJob>>,
    results: Receiver<JobResult>,
    handle: Option<JoinHandle<()>>,
    sweeping: AtomicBool,
}

impl BackgroundSweeper {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn() -> std::io::Result<Self> {
        let (job_tx, job_rx) = channel::unbounded::<SweepJob>();
        let (result_tx, result_rx) = channel::unbounded::<JobResult>();
        let handle = thread::Builder::new()
            .name("rudo-sweep-background".to_owned())
            .spawn(move || worker_loop(&job_rx, &result_tx))?;
        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            handle: Some(handle),
            sweeping: AtomicBool::new(false),
        })
    }

    /// A sweeper whose worker exited while holding a job.
    #[cfg(test)]
    pub(crate) fn lost() -> Self {
        let (job_tx, _job_rx) = channel::unbounded::<SweepJob>();
        let (_result_tx, result_rx) = channel::unbounded::<JobResult>();
        Self {
            jobs: Some(job_tx),
            results: result_rx,
            handle: None,
            sweeping: AtomicBool::new(true),
        }
    }

    /// Whether a job is out on the worker.
    ///
    /// Only the thread owning the cycle writes the flag, so a `true` read
    /// here means the catalog must not be touched.
    #[must_use]
    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// Hand `job` to the worker.
    ///
    /// # Errors
    ///
    /// [`SweepError::BackgroundSweepActive`] if a job is already out, and
    /// [`SweepError::BackgroundWorkerLost`] if the worker has exited. The
    /// job is returned alongside the error so the caller keeps its state.
    pub(crate) fn submit(&self, job: SweepJob) -> std::result::Result<(), (SweepJob, SweepError)> {
        if self.is_sweeping() {
            return Err((job, SweepError::BackgroundSweepActive));
        }
        let Some(jobs) = &self.jobs else {
            return Err((job, SweepError::BackgroundWorkerLost));
        };
        trace::log_background_handoff(job.session.id(), true);
        self.sweeping.store(true, Ordering::Release);
        if let Err(channel::SendError(job)) = jobs.send(job) {
            self.sweeping.store(false, Ordering::Release);
            return Err((job, SweepError::BackgroundWorkerLost));
        }
        Ok(())
    }

    /// Block until the worker hands the job back.
    ///
    /// # Errors
    ///
    /// [`SweepError::BackgroundWorkerLost`] if the worker exited without
    /// returning the job (the sweep panicked).
    pub(crate) fn wait(&self) -> Result<JobResult> {
        let result = self
            .results
            .recv()
            .map_err(|_| SweepError::BackgroundWorkerLost);
        self.sweeping.store(false, Ordering::Release);
        let (job, outcome) = result?;
        trace::log_background_handoff(job.session.id(), false);
        Ok((job, outcome))
    }
}

fn worker_loop(jobs: &Receiver<SweepJob>, results: &Sender<JobResult>) {
    for mut job in jobs {
        let outcome = job
            .session
            .background_sweep(&mut job.heap, &mut job.partial, &job.dispose);
        if results.send((job, outcome)).is_err() {
            break;
        }
    }
}

impl Drop for BackgroundSweeper {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop.
        self.jobs = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
