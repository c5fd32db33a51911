//! Sequential driver: elements step in evaluation order and promote
//! their outputs immediately, so every element sees the already-updated
//! outputs of the elements ordered before it.

use tracing::error;

use crate::core::databus::TimeInterval;
use crate::core::error::Result;
use crate::core::submodel::SubModel;
use crate::steptypes::{
    do_communication_step, enter_coupling_step_mode, post_step_update, pre_step_update, StepParams,
};

pub(crate) fn do_step(params: &StepParams, sub_model: &SubModel) -> Result<()> {
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

    let communication_point = TimeInterval::point(params.time_end_step);
    for node in &sub_model.evaluation_list {
        let mut harness = node.element.lock();
        do_communication_step(&mut harness, params).map_err(|e| {
            error!("element step failed");
            e
        })?;
        harness
            .enter_communication_point(&communication_point)
            .map_err(|e| {
                error!("element enter communication point failed");
                e
            })?;
    }

    for (_, element) in &sub_model.elements {
        let mut harness = element.lock();
        post_step_update(&mut harness, params).map_err(|e| {
            error!("post step update of elements failed");
            e
        })?;
    }

    Ok(())
}
