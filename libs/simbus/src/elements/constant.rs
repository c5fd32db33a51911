//! Fixed-value source.

use serde::Deserialize;

use crate::core::databus::Databus;
use crate::core::element::Element;
use crate::core::error::{Result, SimbusError};
use crate::core::value::{ChannelType, ValueCell};
use crate::elements::parse_parameters;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
struct ConstantParameters {
    /// Single output value.
    value: Option<f64>,
    /// One value per output port; wins over `value`.
    values: Option<Vec<f64>>,
}

pub struct Constant {
    parameters: ConstantParameters,
    cells: Vec<ValueCell>,
}

impl Constant {
    pub fn from_parameters(parameters: &serde_yaml::Value) -> Result<Self> {
        Ok(Self {
            parameters: parse_parameters(parameters)?,
            cells: Vec::new(),
        })
    }

    fn value_for(&self, port: usize, num_out: usize) -> Result<f64> {
        if let Some(values) = &self.parameters.values {
            if values.len() != num_out {
                return Err(SimbusError::Config(format!(
                    "constant: {} values for {num_out} output ports",
                    values.len()
                )));
            }
            return Ok(values[port]);
        }
        Ok(self.parameters.value.unwrap_or(0.0))
    }
}

impl Element for Constant {
    fn setup(&mut self, databus: &mut Databus) -> Result<()> {
        let num_out = databus.num_out_channels();
        if num_out == 0 {
            return Err(SimbusError::Config(
                "constant: at least one output port expected".into(),
            ));
        }

        for port in 0..num_out {
            let cell = ValueCell::double(self.value_for(port, num_out)?);
            databus.set_out_reference(port, cell.clone(), ChannelType::Double)?;
            self.cells.push(cell);
        }
        Ok(())
    }

    fn initialize(&mut self, _start_time: f64) -> Result<()> {
        let num_out = self.cells.len();
        for (port, cell) in self.cells.iter().enumerate() {
            cell.set_double(self.value_for(port, num_out)?)?;
        }
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
    fn test_constant_publishes_value() {
        let params = serde_yaml::from_str("value: 7.5").unwrap();
        let mut element = Constant::from_parameters(&params).unwrap();
        let mut databus = Databus::setup(
            DatabusInfo::default(),
            DatabusInfo::new(
                vec![PortInfo::new("out", ChannelType::Double, "c.out")],
                Vec::new(),
            ),
            NanCheck::Always,
            0,
        )
        .unwrap();

        element.setup(&mut databus).unwrap();
        element.initialize(0.0).unwrap();
        databus.trigger_out_channels(&TimeInterval::point(0.0)).unwrap();
        assert_eq!(
            databus.output(0).unwrap().value_cell().get_double().unwrap(),
            7.5
        );
    }

    #[test]
    fn test_values_length_mismatch_fails() {
        let params = serde_yaml::from_str("values: [1.0, 2.0]").unwrap();
        let mut element = Constant::from_parameters(&params).unwrap();
        let mut databus = Databus::setup(
            DatabusInfo::default(),
            DatabusInfo::new(
                vec![PortInfo::new("out", ChannelType::Double, "c.out")],
                Vec::new(),
            ),
            NanCheck::Always,
            0,
        )
        .unwrap();
        assert!(element.setup(&mut databus).is_err());
    }
}
