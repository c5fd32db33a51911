//! Sine-wave source with a function-bound output: the databus samples
//! `A sin(2 pi f t + phi) + c` directly at the requested time.

use std::f64::consts::PI;
use std::sync::Arc;

use serde::Deserialize;

use crate::core::databus::Databus;
use crate::core::element::Element;
use crate::core::error::{Result, SimbusError};
use crate::core::value::ChannelType;
use crate::elements::parse_parameters;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct SinusParameters {
    amplitude: f64,
    /// In Hz.
    frequency: f64,
    phase: f64,
    offset: f64,
}

impl Default for SinusParameters {
    fn default() -> Self {
        Self {
            amplitude: 10.0,
            frequency: 1.0,
            phase: 0.0,
            offset: 0.0,
        }
    }
}

pub struct SinusGenerator {
    parameters: SinusParameters,
}

impl SinusGenerator {
    pub fn from_parameters(parameters: &serde_yaml::Value) -> Result<Self> {
        Ok(Self {
            parameters: parse_parameters(parameters)?,
        })
    }
}

impl Element for SinusGenerator {
    fn setup(&mut self, databus: &mut Databus) -> Result<()> {
        if databus.num_out_channels() != 1 {
            return Err(SimbusError::Config(format!(
                "sinus_generator: expected exactly one output port, read {}",
                databus.num_out_channels()
            )));
        }

        let SinusParameters {
            amplitude,
            frequency,
            phase,
            offset,
        } = self.parameters;
        databus.set_out_reference_fn(
            0,
            Arc::new(move |t| amplitude * (2.0 * PI * frequency * t + phase).sin() + offset),
            ChannelType::Double,
        )
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::databus::{DatabusInfo, TimeInterval};
    use crate::core::port::{NanCheck, PortInfo};

    #[test]
    fn test_sine_sampled_at_time() {
        let params = serde_yaml::from_str("{ amplitude: 2.0, frequency: 0.25 }").unwrap();
        let mut element = SinusGenerator::from_parameters(&params).unwrap();
        let mut bus = Databus::setup(
            DatabusInfo::default(),
            DatabusInfo::new(
                vec![PortInfo::new("out", ChannelType::Double, "sine.out")],
                Vec::new(),
            ),
            NanCheck::Always,
            0,
        )
        .unwrap();
        element.setup(&mut bus).unwrap();

        // quarter period of 0.25 Hz is 1 s: sin(pi/2) = 1
        bus.trigger_out_channels(&TimeInterval::point(1.0)).unwrap();
        let value = bus.output(0).unwrap().value_cell().get_double().unwrap();
        assert!((value - 2.0).abs() < 1e-12);
    }
}
