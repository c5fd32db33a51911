//! The outer simulation loop.
//!
//! The task validates its input, installs the global time epsilon,
//! selects the driver and advances the synchronisation time until one
//! of the termination conditions holds: an element finished (with the
//! first-finished policy), all elements finished, the end time was
//! reached, or an interrupt arrived. Storage is flushed even when a
//! step fails.

use tracing::{debug, error, info};

use crate::core::compare::{self, double_lt};
use crate::core::element::{FinishInfo, FinishState};
use crate::core::error::{Result, SimbusError};
use crate::core::model::Model;
use crate::core::signals;
use crate::core::submodel::SubModel;
use crate::input::{EndType, TaskInput};
use crate::steptypes::{CouplingMethod, StepDriver, StepParams};
use crate::storage::ResultsStorage;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub time_start: f64,
    pub time_end: Option<f64>,
    pub step_size: f64,
    pub sum_time: bool,
    pub coupling: CouplingMethod,
    pub stop_if_first_component_finished: bool,
    pub use_inputs_at_end_time: bool,
    pub relative_eps: f64,
    pub rt_factor_enabled: bool,
}

impl Task {
    /// Validate and log the task settings.
    pub fn read(input: &TaskInput) -> Result<Self> {
        info!("reading settings:");

        let time_start = input.start_time.unwrap_or(0.0);
        if time_start < 0.0 {
            return Err(SimbusError::Config(format!(
                "start time {time_start} s cannot be smaller than 0.0 s"
            )));
        }
        info!("  start time: {time_start} s");

        let time_end = input.end_time;
        match time_end {
            Some(end) => info!("  end time: {end} s"),
            None => info!("  end time: infinite"),
        }

        let step_size = input.delta_time.unwrap_or(0.01);
        if step_size <= 0.0 {
            return Err(SimbusError::Config(format!(
                "synchronisation time step {step_size} s must be positive"
            )));
        }
        info!("  synchronisation time step: {step_size} s");

        let coupling = input.coupling;
        match coupling {
            CouplingMethod::Sequential => info!("  type: sequential co-simulation"),
            CouplingMethod::ParallelSingleThreaded => {
                info!("  type: parallel (single-threaded) co-simulation")
            }
            CouplingMethod::ParallelMultiThreaded => {
                info!("  type: parallel (multithreaded) co-simulation")
            }
        }

        let sum_time = input.sum_time.unwrap_or(false);
        if sum_time {
            debug!("  using summation for time calculation");
        }

        let use_inputs_at_end_time = match input.input_at_end_time {
            Some(flag) => flag,
            None => {
                tracing::warn!("input time not specified");
                false
            }
        };
        if use_inputs_at_end_time {
            debug!("  using input at end time as default");
        } else {
            debug!("  using input at start time as default");
        }

        let relative_eps = input.relative_eps.unwrap_or(1e-10);
        info!("  epsilon: {relative_eps}");

        Ok(Self {
            time_start,
            time_end,
            step_size,
            sum_time,
            coupling,
            stop_if_first_component_finished: input.end_type == EndType::FirstComponent,
            use_inputs_at_end_time,
            relative_eps,
            rt_factor_enabled: input.timing_output.unwrap_or(false),
        })
    }

    /// Validate cross-field constraints and install the global epsilon.
    pub fn setup(&self) -> Result<()> {
        if let Some(end) = self.time_end {
            if end <= self.time_start {
                return Err(SimbusError::Config(format!(
                    "the end time is not after the start time ({end} s <= {} s)",
                    self.time_start
                )));
            }
        }

        compare::set_eps(self.relative_eps * self.step_size);
        Ok(())
    }

    /// Storage setup and registration; runs before the stepping loop.
    pub fn prepare_run(&self, model: &mut Model, storage: &mut ResultsStorage) -> Result<()> {
        storage.setup(self.time_start).map_err(|e| {
            error!("could not setup storage");
            e
        })?;
        model.register_storage(storage, self.step_size).map_err(|e| {
            error!("could not setup element storage");
            e
        })
    }

    fn sub_model_finished(sub_model: &SubModel) -> bool {
        sub_model
            .evaluation_list
            .iter()
            .all(|node| node.element.lock().finish_state() == FinishState::Finished)
    }

    fn check_if_finished(&self, params: &StepParams, sub_model: &SubModel, time: f64) -> bool {
        if signals::is_interrupted() {
            return true;
        }

        if self.stop_if_first_component_finished && params.component_finished() {
            return true;
        }

        // all elements finished ends the run regardless of end time
        if Self::sub_model_finished(sub_model) {
            return true;
        }

        match self.time_end {
            Some(end) => !double_lt(time, end),
            None => false,
        }
    }

    /// Run the whole simulation: initialization, stepping loop, finish
    /// and storage flush.
    pub fn run(&self, model: &mut Model, storage: &mut ResultsStorage) -> Result<TaskOutcome> {
        self.setup()?;

        model.initialize(self.time_start).map_err(|e| {
            error!("initialization of model failed");
            e
        })?;

        self.prepare_run(model, storage)?;

        debug!("synchronisation time-step-size: {}", self.step_size);
        model.store_initial_results(self.time_start)?;

        let mut params = StepParams::new(self.step_size, self.sum_time);
        params.time = self.time_start;
        params.time_end_step = self.time_start;

        let mut driver = StepDriver::new(self.coupling);
        let mut status: Result<()> = Ok(());

        {
            let sub_model = model.sub_model()?;
            driver.configure(&params, sub_model)?;

            while !self.check_if_finished(&params, sub_model, params.time) {
                // for fixed step sizes this is more accurate than
                // summing all time steps
                if !params.sum_time {
                    params.time_end_step =
                        self.time_start + (params.num_steps + 1) as f64 * self.step_size;
                } else {
                    params.time_end_step += self.step_size;
                }

                if let Err(e) = driver.do_step(&params, sub_model) {
                    status = Err(e);
                    break;
                }

                params.num_steps += 1;
                params.time = params.time_end_step;
            }

            let finish_info = FinishInfo {
                a_component_finished: params.component_finished(),
                stop_if_first_component_finished: self.stop_if_first_component_finished,
                error_occurred: status.is_err(),
            };
            if let Err(e) = driver.finish(&params, sub_model, &finish_info) {
                if status.is_ok() {
                    status = Err(e);
                }
            }
        }

        // backends always get a chance to finalise what was written
        if let Err(e) = model.finish_storage() {
            if status.is_ok() {
                status = Err(e);
            }
        }
        if let Err(e) = storage.finish() {
            if status.is_ok() {
                status = Err(e);
            }
        }

        status?;

        if signals::is_interrupted() {
            info!("simulation interrupted at {} s", params.time);
            return Ok(TaskOutcome::Interrupted);
        }

        info!(
            "simulation finished at {} s after {} synchronisation steps",
            params.time, params.num_steps
        );
        Ok(TaskOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ModelInput;

    fn task_input(yaml: &str) -> TaskInput {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_defaults() {
        let task = Task::read(&task_input("{}")).unwrap();
        assert_eq!(task.time_start, 0.0);
        assert_eq!(task.time_end, None);
        assert_eq!(task.step_size, 0.01);
        assert_eq!(task.relative_eps, 1e-10);
        assert!(!task.sum_time);
        assert!(!task.stop_if_first_component_finished);
    }

    #[test]
    fn test_negative_start_rejected() {
        assert!(Task::read(&task_input("start_time: -1.0")).is_err());
    }

    #[test]
    fn test_end_before_start_rejected() {
        let task = Task::read(&task_input("{ start_time: 1.0, end_time: 0.5 }")).unwrap();
        assert!(task.setup().is_err());
    }

    #[test]
    fn test_zero_step_size_rejected() {
        assert!(Task::read(&task_input("delta_time: 0.0")).is_err());
    }

    #[test]
    fn test_full_run_without_result_dir() {
        let input = ModelInput::from_yaml(
            r#"
task: { delta_time: 0.1, end_time: 0.3 }
components:
  - name: source
    kind: constant
    parameters: { value: 1.0 }
    outputs: [ { name: out } ]
  - name: sink
    kind: passthrough
    inputs: [ { name: in } ]
    outputs: [ { name: out } ]
connections:
  - from: source.out
    to: sink.in
"#,
        )
        .unwrap();
        let task = Task::read(&input.task).unwrap();
        let mut model = Model::build(&input, &task).unwrap();
        let mut storage = ResultsStorage::default();

        let outcome = task.run(&mut model, &mut storage).unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);

        let sink = model.element_by_name("sink").unwrap().lock();
        assert!((sink.time() - 0.3).abs() < 1e-9);
        assert_eq!(
            sink.databus().output(0).unwrap().value_cell().get_double().unwrap(),
            1.0
        );
    }
}
