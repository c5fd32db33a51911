//! Trapezoidal integrator with optional sub-stepping.
//!
//! Each step splits `[start, end]` into `num_sub_steps` slices and
//! re-evaluates the input at every slice boundary, so a linearly
//! interpolating feed integrates exactly.

use serde::Deserialize;

use crate::core::databus::{Databus, TimeInterval};
use crate::core::element::Element;
use crate::core::error::{Result, SimbusError};
use crate::core::value::{ChannelType, ValueCell};
use crate::elements::parse_parameters;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct IntegratorParameters {
    gain: f64,
    initial_state: f64,
    num_sub_steps: u32,
}

impl Default for IntegratorParameters {
    fn default() -> Self {
        Self {
            gain: 1.0,
            initial_state: 0.0,
            num_sub_steps: 1,
        }
    }
}

pub struct Integrator {
    parameters: IntegratorParameters,
    state: ValueCell,
    derivative: ValueCell,
}

impl Integrator {
    pub fn from_parameters(parameters: &serde_yaml::Value) -> Result<Self> {
        let parameters: IntegratorParameters = parse_parameters(parameters)?;
        if parameters.num_sub_steps == 0 {
            return Err(SimbusError::Config(
                "integrator: num_sub_steps must be at least 1".into(),
            ));
        }
        Ok(Self {
            parameters,
            state: ValueCell::double(0.0),
            derivative: ValueCell::double(0.0),
        })
    }
}

impl Element for Integrator {
    fn setup(&mut self, databus: &mut Databus) -> Result<()> {
        if databus.num_in_channels() != 1 {
            return Err(SimbusError::Config(format!(
                "integrator: illegal number of input ports, expected 1, read {}",
                databus.num_in_channels()
            )));
        }
        if databus.num_out_channels() > 1 {
            return Err(SimbusError::Config(format!(
                "integrator: illegal number of output ports, expected 0 or 1, read {}",
                databus.num_out_channels()
            )));
        }

        databus.set_in_reference(0, self.derivative.clone(), ChannelType::Double)?;
        if databus.num_out_channels() == 1 {
            databus.set_out_reference(0, self.state.clone(), ChannelType::Double)?;
        } else {
            // keep the state observable in result files
            databus.add_local_channel(
                "state",
                "integrator.state",
                None,
                self.state.clone(),
                ChannelType::Double,
            )?;
        }
        Ok(())
    }

    fn initialize(&mut self, _start_time: f64) -> Result<()> {
        self.state.set_double(self.parameters.initial_state)
    }

    fn do_step(
        &mut self,
        databus: &mut Databus,
        start: f64,
        step_size: f64,
        _end: f64,
        _is_new_step: bool,
    ) -> Result<()> {
        let sub_step = step_size / f64::from(self.parameters.num_sub_steps);

        let mut state = self.state.get_double()?;
        let mut previous = self.derivative.get_double()?;
        let mut time = start;

        for _ in 0..self.parameters.num_sub_steps {
            time += sub_step;
            databus
                .trigger_in_connections(&TimeInterval::point(time))
                .map_err(|e| {
                    SimbusError::Runtime(format!(
                        "integrator: could not update inports at time {time}: {e}"
                    ))
                })?;
            let current = self.derivative.get_double()?;
            state += self.parameters.gain * 0.5 * (previous + current) * sub_step;
            previous = current;
        }

        self.state.set_double(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::databus::DatabusInfo;
    use crate::core::port::{NanCheck, PortInfo};

    fn integrator_bus() -> Databus {
        // no connection and no default: input updates are skipped and
        // the derivative cell keeps what the test writes into it
        let in_info = PortInfo::new("derivative", ChannelType::Double, "i.derivative");
        Databus::setup(
            DatabusInfo::new(vec![in_info], Vec::new()),
            DatabusInfo::new(
                vec![PortInfo::new("state", ChannelType::Double, "i.state")],
                Vec::new(),
            ),
            NanCheck::Always,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_integrates_constant_derivative() {
        let params = serde_yaml::from_str("{ gain: 2.0, num_sub_steps: 4 }").unwrap();
        let mut element = Integrator::from_parameters(&params).unwrap();
        let mut bus = integrator_bus();
        element.setup(&mut bus).unwrap();
        element.initialize(0.0).unwrap();

        element.derivative.set_double(3.0).unwrap();
        element.do_step(&mut bus, 0.0, 0.5, 0.5, true).unwrap();
        // d/dt x = 2 * 3 over 0.5 s
        assert!((element.state.get_double().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_port_count_validated() {
        let params = serde_yaml::Value::Null;
        let mut element = Integrator::from_parameters(&params).unwrap();
        let mut bus = Databus::setup(
            DatabusInfo::default(),
            DatabusInfo::default(),
            NanCheck::Always,
            0,
        )
        .unwrap();
        assert!(element.setup(&mut bus).is_err());
    }

    #[test]
    fn test_zero_sub_steps_rejected() {
        let params = serde_yaml::from_str("num_sub_steps: 0").unwrap();
        assert!(Integrator::from_parameters(&params).is_err());
    }
}
