//! Worker pool for deferred script verification.
//!
//! A block's script checks are pushed through a [`CheckControl`] while its inputs are
//! being applied; `wait` then collects one result per submitted check. The first failure
//! raises the batch's abort flag so queued work for that batch is skipped, and dropping
//! the control discards whatever results are still in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use vcoin_consensus::constants::SCRIPT_CHECK_BATCH;
use vcoin_log::{log_category, log_warn, Category};
use vcoin_primitives::Transaction;
use vcoin_script::{verify_script, ScriptError, ScriptFlags};

/// One input's script verification, self-contained so it can move to a worker.
#[derive(Clone, Debug)]
pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub flags: ScriptFlags,
}

impl ScriptCheck {
    pub fn verify(&self) -> Result<(), ScriptError> {
        let script_sig = &self.tx.vin[self.input_index].script_sig;
        verify_script(
            script_sig,
            &self.script_pubkey,
            &self.tx,
            self.input_index,
            self.flags,
            0,
        )
    }
}

#[derive(Debug)]
pub struct CheckFailure {
    pub input_index: usize,
    pub error: ScriptError,
}

struct Job {
    checks: Vec<ScriptCheck>,
    abort: Arc<AtomicBool>,
    results: Sender<Result<usize, CheckFailure>>,
}

pub struct CheckQueue {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl CheckQueue {
    /// Starts `threads` workers; the queue holds up to `capacity` pending batches.
    pub fn new(threads: usize, capacity: usize) -> std::io::Result<Self> {
        let (job_tx, job_rx) = bounded::<Job>(capacity.max(1));
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let job_rx: Receiver<Job> = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("scriptch.{index}"))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        run_job(job);
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            jobs: Some(job_tx),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    pub fn control(&self) -> CheckControl<'_> {
        let (results_tx, results_rx) = unbounded();
        CheckControl {
            queue: self,
            pending: Vec::new(),
            submitted: 0,
            abort: Arc::new(AtomicBool::new(false)),
            results_tx,
            results_rx,
        }
    }
}

impl Drop for CheckQueue {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log_warn!("script check worker panicked");
            }
        }
    }
}

fn run_job(job: Job) {
    let count = job.checks.len();
    for check in &job.checks {
        if job.abort.load(Ordering::Relaxed) {
            break;
        }
        if let Err(error) = check.verify() {
            job.abort.store(true, Ordering::Relaxed);
            let _ = job.results.send(Err(CheckFailure {
                input_index: check.input_index,
                error,
            }));
            return;
        }
    }
    let _ = job.results.send(Ok(count));
}

/// Collects the script checks of one block.
pub struct CheckControl<'q> {
    queue: &'q CheckQueue,
    pending: Vec<ScriptCheck>,
    submitted: usize,
    abort: Arc<AtomicBool>,
    results_tx: Sender<Result<usize, CheckFailure>>,
    results_rx: Receiver<Result<usize, CheckFailure>>,
}

impl CheckControl<'_> {
    pub fn add(&mut self, checks: Vec<ScriptCheck>) {
        self.pending.extend(checks);
        while self.pending.len() >= SCRIPT_CHECK_BATCH {
            let rest = self.pending.split_off(SCRIPT_CHECK_BATCH);
            let batch = std::mem::replace(&mut self.pending, rest);
            self.submit(batch);
        }
    }

    fn submit(&mut self, checks: Vec<ScriptCheck>) {
        if checks.is_empty() {
            return;
        }
        let job = Job {
            checks,
            abort: Arc::clone(&self.abort),
            results: self.results_tx.clone(),
        };
        match self.queue.jobs.as_ref() {
            Some(jobs) if self.queue.threads() > 0 => match jobs.send(job) {
                Ok(()) => self.submitted += 1,
                // Workers are gone; verify on this thread instead.
                Err(err) => {
                    self.submitted += 1;
                    run_job(err.into_inner());
                }
            },
            _ => {
                self.submitted += 1;
                run_job(job);
            }
        }
    }

    /// Blocks until every submitted check has reported. Returns the first failure.
    pub fn wait(mut self) -> Result<(), CheckFailure> {
        let remaining = std::mem::take(&mut self.pending);
        self.submit(remaining);
        let mut verified = 0usize;
        for _ in 0..self.submitted {
            match self.results_rx.recv() {
                Ok(Ok(count)) => verified += count,
                Ok(Err(failure)) => {
                    self.abort.store(true, Ordering::Relaxed);
                    return Err(failure);
                }
                Err(_) => break,
            }
        }
        log_category!(Category::Bench, "verified {} script checks", verified);
        Ok(())
    }
}
