//! Parallel multithreaded driver: one long-lived worker per evaluation
//! node, a one-shot start signal per worker and a shared down-counter
//! as the step barrier. Workers never talk to each other; their step
//! parameters are written only while they are blocked, and their
//! status slots are read only after the barrier.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::core::databus::TimeInterval;
use crate::core::error::{Result, SimbusError};
use crate::core::submodel::{ElementRef, SubModel};
use crate::steptypes::{
    do_communication_step, enter_coupling_step_mode, pre_step_update, StepParams,
};

enum WorkerCommand {
    Step(StepParams),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StepStatus {
    Ok,
    Failed(String),
}

struct StepCounter {
    remaining: Mutex<usize>,
    all_done: Condvar,
}

impl StepCounter {
    fn new() -> Self {
        Self {
            remaining: Mutex::new(0),
            all_done: Condvar::new(),
        }
    }

    fn reset(&self, count: usize) {
        *self.remaining.lock() = count;
    }

    fn decrement(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
            if *remaining == 0 {
                self.all_done.notify_all();
            }
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.all_done.wait(&mut remaining);
        }
    }
}

struct Worker {
    start_tx: Sender<WorkerCommand>,
    status: Arc<Mutex<StepStatus>>,
    handle: Option<JoinHandle<()>>,
}

fn worker_loop(
    element: ElementRef,
    start_rx: Receiver<WorkerCommand>,
    status: Arc<Mutex<StepStatus>>,
    counter: Arc<StepCounter>,
) {
    loop {
        match start_rx.recv() {
            Ok(WorkerCommand::Step(params)) => {
                let result = {
                    let mut harness = element.lock();
                    do_communication_step(&mut harness, &params)
                };
                *status.lock() = match result {
                    Ok(()) => StepStatus::Ok,
                    Err(e) => {
                        error!("element step failed: {e}");
                        StepStatus::Failed(e.to_string())
                    }
                };
                counter.decrement();
            }
            Ok(WorkerCommand::Shutdown) | Err(_) => break,
        }
    }
    debug!("step worker stopped");
}

pub struct ParallelMtDriver {
    workers: Vec<Worker>,
    counter: Arc<StepCounter>,
}

impl ParallelMtDriver {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
            counter: Arc::new(StepCounter::new()),
        }
    }

    /// Spawn one worker per evaluation node.
    pub fn configure(&mut self, _params: &StepParams, sub_model: &SubModel) -> Result<()> {
        if !self.workers.is_empty() {
            return Ok(());
        }

        for node in &sub_model.evaluation_list {
            let (start_tx, start_rx) = crossbeam_channel::bounded(1);
            let status = Arc::new(Mutex::new(StepStatus::Ok));
            let element = Arc::clone(&node.element);
            let counter = Arc::clone(&self.counter);
            let worker_status = Arc::clone(&status);

            let name = element.lock().name().to_string();
            let handle = std::thread::Builder::new()
                .name(format!("step-{name}"))
                .spawn(move || worker_loop(element, start_rx, worker_status, counter))
                .map_err(|e| {
                    SimbusError::Runtime(format!("could not create step worker thread: {e}"))
                })?;

            self.workers.push(Worker {
                start_tx,
                status,
                handle: Some(handle),
            });
        }

        Ok(())
    }

    pub fn do_step(&mut self, params: &StepParams, sub_model: &SubModel) -> Result<()> {
        for (_, element) in &sub_model.elements {
            let mut harness = element.lock();
            enter_coupling_step_mode(&mut harness, params).map_err(|e| {
                error!("enter coupling step mode of elements failed");
                e
            })?;
        }

        // parts of the step that must not be multi-threaded
        for (_, element) in &sub_model.elements {
            let mut harness = element.lock();
            pre_step_update(&mut harness, params).map_err(|e| {
                error!("pre step update of elements failed");
                e
            })?;
        }

        // only this thread is running here, so the counter reset needs
        // no interlock with the workers
        self.counter.reset(self.workers.len());
        for worker in &self.workers {
            worker
                .start_tx
                .send(WorkerCommand::Step(params.clone()))
                .map_err(|_| SimbusError::Runtime("step worker is gone".into()))?;
        }

        self.counter.wait();

        for worker in &self.workers {
            if let StepStatus::Failed(message) = &*worker.status.lock() {
                error!(
                    "synchronisation step from {} s to {} s failed: {message}",
                    params.time, params.time_end_step
                );
                return Err(SimbusError::Runtime(message.clone()));
            }
        }

        let communication_point = TimeInterval::point(params.time_end_step);
        for node in &sub_model.evaluation_list {
            let mut harness = node.element.lock();
            harness
                .enter_communication_point(&communication_point)
                .map_err(|e| {
                    error!("element enter communication point failed");
                    e
                })?;
        }

        Ok(())
    }
}

impl Default for ParallelMtDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ParallelMtDriver {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.start_tx.send(WorkerCommand::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_barrier() {
        let counter = Arc::new(StepCounter::new());
        counter.reset(3);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || counter.decrement()));
        }
        counter.wait();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_counter_wait_on_zero_returns() {
        let counter = StepCounter::new();
        counter.reset(0);
        counter.wait();
    }
}
