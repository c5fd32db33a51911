//! Multiplies each input by a factor.

use serde::Deserialize;

use crate::core::databus::Databus;
use crate::core::element::Element;
use crate::core::error::{Result, SimbusError};
use crate::core::value::{ChannelType, ValueCell};
use crate::elements::parse_parameters;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct GainParameters {
    gain: f64,
}

impl Default for GainParameters {
    fn default() -> Self {
        Self { gain: 1.0 }
    }
}

pub struct Gain {
    parameters: GainParameters,
    inputs: Vec<ValueCell>,
    outputs: Vec<ValueCell>,
}

impl Gain {
    pub fn from_parameters(parameters: &serde_yaml::Value) -> Result<Self> {
        Ok(Self {
            parameters: parse_parameters(parameters)?,
            inputs: Vec::new(),
            outputs: Vec::new(),
        })
    }

    fn compute(&self) -> Result<()> {
        for (input, output) in self.inputs.iter().zip(self.outputs.iter()) {
            output.set_double(self.parameters.gain * input.get_double()?)?;
        }
        Ok(())
    }
}

impl Element for Gain {
    fn setup(&mut self, databus: &mut Databus) -> Result<()> {
        if databus.num_in_channels() != databus.num_out_channels()
            || databus.num_in_channels() == 0
        {
            return Err(SimbusError::Config(format!(
                "gain: expected matching input and output port counts, read {} and {}",
                databus.num_in_channels(),
                databus.num_out_channels()
            )));
        }

        for port in 0..databus.num_in_channels() {
            let input = ValueCell::double(0.0);
            databus.set_in_reference(port, input.clone(), ChannelType::Double)?;
            self.inputs.push(input);

            let output = ValueCell::double(0.0);
            databus.set_out_reference(port, output.clone(), ChannelType::Double)?;
            self.outputs.push(output);
        }
        Ok(())
    }

    fn initialize(&mut self, _start_time: f64) -> Result<()> {
        self.compute()
    }

    fn do_step(
        &mut self,
        _databus: &mut Databus,
        _start: f64,
        _step_size: f64,
        _end: f64,
        _is_new_step: bool,
    ) -> Result<()> {
        self.compute()
    }

    fn update_out_channels(&mut self) -> Result<()> {
        self.compute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::databus::DatabusInfo;
    use crate::core::port::{NanCheck, PortInfo};

    #[test]
    fn test_gain_scales_input() {
        let params = serde_yaml::from_str("gain: -2.0").unwrap();
        let mut element = Gain::from_parameters(&params).unwrap();
        let mut bus = Databus::setup(
            DatabusInfo::new(
                vec![PortInfo::new("in", ChannelType::Double, "g.in")],
                Vec::new(),
            ),
            DatabusInfo::new(
                vec![PortInfo::new("out", ChannelType::Double, "g.out")],
                Vec::new(),
            ),
            NanCheck::Always,
            0,
        )
        .unwrap();
        element.setup(&mut bus).unwrap();

        element.inputs[0].set_double(3.0).unwrap();
        element.do_step(&mut bus, 0.0, 0.1, 0.1, true).unwrap();
        assert_eq!(element.outputs[0].get_double().unwrap(), -6.0);
    }

    #[test]
    fn test_mismatched_ports_rejected() {
        let mut element = Gain::from_parameters(&serde_yaml::Value::Null).unwrap();
        let mut bus = Databus::setup(
            DatabusInfo::new(
                vec![PortInfo::new("in", ChannelType::Double, "g.in")],
                Vec::new(),
            ),
            DatabusInfo::default(),
            NanCheck::Always,
            0,
        )
        .unwrap();
        assert!(element.setup(&mut bus).is_err());
    }
}
