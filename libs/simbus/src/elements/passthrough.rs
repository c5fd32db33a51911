//! Copies each input to the matching output unchanged.

use crate::core::databus::Databus;
use crate::core::element::Element;
use crate::core::error::{Result, SimbusError};
use crate::core::value::{ChannelType, ValueCell};

pub struct Passthrough {
    inputs: Vec<ValueCell>,
    outputs: Vec<ValueCell>,
}

impl Passthrough {
    pub fn new() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    fn copy(&self) -> Result<()> {
        for (input, output) in self.inputs.iter().zip(self.outputs.iter()) {
            output.set(&input.get())?;
        }
        Ok(())
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Element for Passthrough {
    fn setup(&mut self, databus: &mut Databus) -> Result<()> {
        if databus.num_in_channels() != databus.num_out_channels()
            || databus.num_in_channels() == 0
        {
            return Err(SimbusError::Config(format!(
                "passthrough: expected matching input and output port counts, read {} and {}",
                databus.num_in_channels(),
                databus.num_out_channels()
            )));
        }

        for port in 0..databus.num_in_channels() {
            let ty = databus
                .in_info()
                .info(port)
                .map(|info| info.port_type)
                .unwrap_or(ChannelType::Double);

            let input = ValueCell::zero(ty);
            databus.set_in_reference(port, input.clone(), ty)?;
            self.inputs.push(input);

            let output = ValueCell::zero(ty);
            databus.set_out_reference(port, output.clone(), ty)?;
            self.outputs.push(output);
        }
        Ok(())
    }

    fn initialize(&mut self, _start_time: f64) -> Result<()> {
        self.copy()
    }

    fn do_step(
        &mut self,
        _databus: &mut Databus,
        _start: f64,
        _step_size: f64,
        _end: f64,
        _is_new_step: bool,
    ) -> Result<()> {
        self.copy()
    }

    fn update_out_channels(&mut self) -> Result<()> {
        self.copy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::databus::DatabusInfo;
    use crate::core::port::{NanCheck, PortInfo};

    #[test]
    fn test_copies_typed_values() {
        let mut element = Passthrough::new();
        let mut bus = Databus::setup(
            DatabusInfo::new(
                vec![PortInfo::new("in", ChannelType::Integer, "p.in")],
                Vec::new(),
            ),
            DatabusInfo::new(
                vec![PortInfo::new("out", ChannelType::Integer, "p.out")],
                Vec::new(),
            ),
            NanCheck::Always,
            0,
        )
        .unwrap();
        element.setup(&mut bus).unwrap();

        element.inputs[0]
            .set(&crate::core::value::ChannelValue::Integer(9))
            .unwrap();
        element.do_step(&mut bus, 0.0, 0.1, 0.1, true).unwrap();
        assert_eq!(
            element.outputs[0].get(),
            crate::core::value::ChannelValue::Integer(9)
        );
    }
}
