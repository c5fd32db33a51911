//! Stepping drivers: advance every element of a sub-model across one
//! synchronisation step.
//!
//! All three drivers share the per-element communication step
//! ([`do_communication_step`]); they differ only in how those calls are
//! dispatched and when output changes become visible to other elements.

mod parallel_mt;
mod parallel_st;
mod sequential;

pub use parallel_mt::ParallelMtDriver;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::core::compare::double_lt;
use crate::core::databus::TimeInterval;
use crate::core::element::{ElementHarness, FinishInfo, FinishState};
use crate::core::error::{Result, SimbusError};
use crate::core::submodel::SubModel;
use crate::storage::{ChannelClass, StoreLevel};

/// Coupling method selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CouplingMethod {
    #[default]
    Sequential,
    ParallelSingleThreaded,
    ParallelMultiThreaded,
}

/// Parameters of one synchronisation step.
#[derive(Clone)]
pub struct StepParams {
    pub time: f64,
    pub time_step_size: f64,
    pub time_end_step: f64,
    pub is_new_step: bool,
    pub num_steps: u64,
    pub sum_time: bool,
    /// OR-reduction over all elements; set whenever an element reports
    /// itself finished.
    pub a_component_finished: Arc<AtomicBool>,
}

impl StepParams {
    pub fn new(time_step_size: f64, sum_time: bool) -> Self {
        Self {
            time: 0.0,
            time_step_size,
            time_end_step: 0.0,
            is_new_step: true,
            num_steps: 0,
            sum_time,
            a_component_finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn component_finished(&self) -> bool {
        self.a_component_finished.load(Ordering::Relaxed)
    }

    fn flag_component_finished(&self) {
        self.a_component_finished.store(true, Ordering::Relaxed);
    }
}

/// Advance one element to the end of the synchronisation step,
/// sub-stepping by its own time step where it has one. Inputs are
/// evaluated per coupling step, results stored per coupling step with
/// the synchronisation level on the final one.
pub fn do_communication_step(harness: &mut ElementHarness, params: &StepParams) -> Result<()> {
    let step_end = params.time_end_step;

    if harness.finish_state() == FinishState::Finished {
        params.flag_component_finished();
        return Ok(());
    }

    let mut level = StoreLevel::Communication;

    while harness.finish_state() != FinishState::Finished && double_lt(harness.time(), step_end) {
        let mut interval = TimeInterval::new(params.time, step_end);
        let mut step_size = params.time_step_size;
        if harness.has_own_time() {
            interval.start = harness.time();
            if harness.time_step() > 0.0 {
                step_size = harness.time_step();
                interval.end = interval.start + step_size;
            } else {
                interval.end = step_end;
            }
        }

        if harness.use_inputs_at_end_time() {
            let at_end = TimeInterval::point(interval.end);
            harness.databus_mut().trigger_in_connections(&at_end)
        } else {
            harness.databus_mut().trigger_in_connections(&interval)
        }
        .map_err(|e| {
            error!("[{}] update inports failed", harness.name());
            e
        })?;
        harness.update_in_channels()?;

        let store_time = if harness.store_inputs_at_end_time()? {
            interval.end
        } else {
            interval.start
        };
        harness.store(ChannelClass::In, store_time, level).map_err(|e| {
            error!("[{}] storing inport failed", harness.name());
            e
        })?;

        harness
            .do_step(interval.start, step_size, interval.end, params.is_new_step)
            .map_err(|e| {
                error!("[{}] step failed", harness.name());
                e
            })?;

        let at_element_time = TimeInterval::point(harness.time());
        harness.update_out_channels(&at_element_time).map_err(|e| {
            error!("[{}] updating outports failed", harness.name());
            e
        })?;

        // the last coupling step is the new synchronisation step
        level = if harness.reached(step_end) {
            StoreLevel::Communication
        } else {
            StoreLevel::Coupling
        };

        let now = harness.time();
        harness.store(ChannelClass::Out, now, level)?;
        harness.store(ChannelClass::Local, now, level)?;
        harness.store(ChannelClass::RtFactor, now, level)?;
    }

    if harness.finish_state() == FinishState::Finished {
        params.flag_component_finished();
        tracing::warn!(
            "[{}] element finished at time {}",
            harness.name(),
            harness.time()
        );
    }

    Ok(())
}

/// Enter coupling-step mode on all outgoing connections of an element.
pub(crate) fn enter_coupling_step_mode(
    harness: &mut ElementHarness,
    params: &StepParams,
) -> Result<()> {
    harness
        .databus_mut()
        .enter_coupling_step(params.time_step_size)
        .map_err(|e| {
            error!("[{}] enter coupling step mode failed", harness.name());
            e
        })
}

fn hook_interval(harness: &ElementHarness, params: &StepParams) -> TimeInterval {
    let mut interval = TimeInterval::new(params.time, params.time_end_step);
    if harness.has_own_time() {
        interval.start = harness.time();
        if params.time_step_size > 0.0 {
            interval.end = interval.start + params.time_step_size;
        }
    }
    interval
}

/// Input evaluation plus the single-threaded pre-step hook.
pub(crate) fn pre_step_update(harness: &mut ElementHarness, params: &StepParams) -> Result<()> {
    if !harness.uses_step_update_hooks() {
        return Ok(());
    }
    let interval = hook_interval(harness, params);
    harness.databus_mut().trigger_in_connections(&interval)?;
    harness.pre_step_update(interval.start, params.time_step_size)
}

/// Input evaluation plus the single-threaded post-step hook.
pub(crate) fn post_step_update(harness: &mut ElementHarness, params: &StepParams) -> Result<()> {
    if !harness.uses_step_update_hooks() {
        return Ok(());
    }
    let interval = hook_interval(harness, params);
    harness.databus_mut().trigger_in_connections(&interval)?;
    harness.post_step_update(interval.start, params.time_step_size)
}

/// Final input evaluation of a finishing run, so stored inputs reach
/// the end time.
fn trigger_final_inputs(harness: &mut ElementHarness, params: &StepParams) -> Result<()> {
    let mut interval = TimeInterval::new(harness.time(), params.time_end_step);
    if harness.has_own_time() {
        interval.start = harness.time();
        if harness.time_step() > 0.0 {
            interval.end = interval.start + harness.time_step();
        } else {
            interval.end = params.time_end_step;
        }
    }

    enter_coupling_step_mode(harness, params)?;
    harness.databus_mut().trigger_in_connections(&interval)?;

    if !harness.store_inputs_at_end_time()? {
        // with end-time storage the final row was already written by
        // the last step
        harness.store(ChannelClass::In, interval.start, StoreLevel::Communication)?;
    }
    Ok(())
}

/// A driver for one coupling method.
pub enum StepDriver {
    Sequential,
    ParallelSingleThreaded,
    ParallelMultiThreaded(ParallelMtDriver),
}

impl StepDriver {
    pub fn new(method: CouplingMethod) -> Self {
        match method {
            CouplingMethod::Sequential => StepDriver::Sequential,
            CouplingMethod::ParallelSingleThreaded => StepDriver::ParallelSingleThreaded,
            CouplingMethod::ParallelMultiThreaded => {
                StepDriver::ParallelMultiThreaded(ParallelMtDriver::new())
            }
        }
    }

    /// One-time preparation against the ordered sub-model.
    pub fn configure(&mut self, params: &StepParams, sub_model: &SubModel) -> Result<()> {
        match self {
            StepDriver::ParallelMultiThreaded(driver) => driver.configure(params, sub_model),
            _ => Ok(()),
        }
    }

    /// Advance every element across `[params.time, params.time_end_step]`.
    pub fn do_step(&mut self, params: &StepParams, sub_model: &SubModel) -> Result<()> {
        match self {
            StepDriver::Sequential => sequential::do_step(params, sub_model),
            StepDriver::ParallelSingleThreaded => parallel_st::do_step(params, sub_model),
            StepDriver::ParallelMultiThreaded(driver) => driver.do_step(params, sub_model),
        }
    }

    /// Bring stored inputs up to the final time and run every
    /// element's finish hook.
    pub fn finish(
        &mut self,
        params: &StepParams,
        sub_model: &SubModel,
        finish_info: &FinishInfo,
    ) -> Result<()> {
        let mut status = Ok(());

        for node in &sub_model.evaluation_list {
            let mut harness = node.element.lock();
            if let Err(e) = trigger_final_inputs(&mut harness, params) {
                error!("[{}] final input evaluation failed: {e}", harness.name());
                status = Err(SimbusError::Runtime(format!(
                    "final input evaluation of {} failed",
                    harness.name()
                )));
            }
        }

        for (_, element) in &sub_model.elements {
            let mut harness = element.lock();
            if let Err(e) = harness.finish(finish_info) {
                error!("[{}] finish failed: {e}", harness.name());
                status = Err(SimbusError::Runtime(format!(
                    "finish of {} failed",
                    harness.name()
                )));
            }
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::databus::{Databus, DatabusInfo};
    use crate::core::element::Element;
    use crate::core::port::NanCheck;

    struct Idle;

    impl Element for Idle {
        fn setup(&mut self, _databus: &mut Databus) -> Result<()> {
            Ok(())
        }

        fn initialize(&mut self, _start_time: f64) -> Result<()> {
            Ok(())
        }

        fn do_step(
            &mut self,
            _databus: &mut Databus,
            _start: f64,
            _step_size: f64,
            _end: f64,
            _is_new_step: bool,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_finished_element_flags_params() {
        let databus = Databus::setup(
            DatabusInfo::default(),
            DatabusInfo::default(),
            NanCheck::Always,
            0,
        )
        .unwrap();
        let mut harness = ElementHarness::new("idle", 0, 0, Box::new(Idle), databus);
        harness.set_finished();

        let mut params = StepParams::new(0.1, false);
        params.time_end_step = 0.1;
        do_communication_step(&mut harness, &params).unwrap();
        assert!(params.component_finished());
    }

    #[test]
    fn test_coupling_method_serde_names() {
        let method: CouplingMethod = serde_yaml::from_str("parallel_multi_threaded").unwrap();
        assert_eq!(method, CouplingMethod::ParallelMultiThreaded);
        assert_eq!(
            serde_yaml::to_string(&CouplingMethod::Sequential).unwrap().trim(),
            "sequential"
        );
    }

    #[test]
    fn test_step_params_finished_flag() {
        let params = StepParams::new(0.1, false);
        assert!(!params.component_finished());
        params.flag_component_finished();
        assert!(params.component_finished());
        // shared across clones
        let clone = params.clone();
        assert!(clone.component_finished());
    }
}
