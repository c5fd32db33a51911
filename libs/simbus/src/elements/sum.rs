//! Weighted sum of all inputs onto a single output.

use serde::Deserialize;

use crate::core::databus::Databus;
use crate::core::element::Element;
use crate::core::error::{Result, SimbusError};
use crate::core::value::{ChannelType, ValueCell};
use crate::elements::parse_parameters;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
struct SumParameters {
    /// One weight per input; missing weights default to 1.
    gains: Option<Vec<f64>>,
}

pub struct Sum {
    parameters: SumParameters,
    inputs: Vec<ValueCell>,
    output: ValueCell,
}

impl Sum {
    pub fn from_parameters(parameters: &serde_yaml::Value) -> Result<Self> {
        Ok(Self {
            parameters: parse_parameters(parameters)?,
            inputs: Vec::new(),
            output: ValueCell::double(0.0),
        })
    }

    fn weight(&self, port: usize) -> f64 {
        self.parameters
            .gains
            .as_ref()
            .and_then(|gains| gains.get(port).copied())
            .unwrap_or(1.0)
    }

    fn compute(&self) -> Result<()> {
        let mut acc = 0.0;
        for (port, input) in self.inputs.iter().enumerate() {
            acc += self.weight(port) * input.get_double()?;
        }
        self.output.set_double(acc)
    }
}

impl Element for Sum {
    fn setup(&mut self, databus: &mut Databus) -> Result<()> {
        if databus.num_in_channels() == 0 || databus.num_out_channels() != 1 {
            return Err(SimbusError::Config(format!(
                "sum: expected at least one input port and exactly one output port, read {} and {}",
                databus.num_in_channels(),
                databus.num_out_channels()
            )));
        }
        if let Some(gains) = &self.parameters.gains {
            if gains.len() != databus.num_in_channels() {
                return Err(SimbusError::Config(format!(
                    "sum: {} gains for {} input ports",
                    gains.len(),
                    databus.num_in_channels()
                )));
            }
        }

        for port in 0..databus.num_in_channels() {
            let input = ValueCell::double(0.0);
            databus.set_in_reference(port, input.clone(), ChannelType::Double)?;
            self.inputs.push(input);
        }
        databus.set_out_reference(0, self.output.clone(), ChannelType::Double)
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

    fn sum_bus(inputs: usize) -> Databus {
        let in_infos = (0..inputs)
            .map(|i| PortInfo::new(format!("in{i}"), ChannelType::Double, format!("s.in{i}")))
            .collect();
        Databus::setup(
            DatabusInfo::new(in_infos, Vec::new()),
            DatabusInfo::new(
                vec![PortInfo::new("out", ChannelType::Double, "s.out")],
                Vec::new(),
            ),
            NanCheck::Always,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_weighted_sum() {
        let params = serde_yaml::from_str("gains: [1.0, -0.5]").unwrap();
        let mut element = Sum::from_parameters(&params).unwrap();
        let mut bus = sum_bus(2);
        element.setup(&mut bus).unwrap();

        element.inputs[0].set_double(4.0).unwrap();
        element.inputs[1].set_double(2.0).unwrap();
        element.do_step(&mut bus, 0.0, 0.1, 0.1, true).unwrap();
        assert_eq!(element.output.get_double().unwrap(), 3.0);
    }

    #[test]
    fn test_gain_count_mismatch_rejected() {
        let params = serde_yaml::from_str("gains: [1.0]").unwrap();
        let mut element = Sum::from_parameters(&params).unwrap();
        let mut bus = sum_bus(2);
        assert!(element.setup(&mut bus).is_err());
    }
}
