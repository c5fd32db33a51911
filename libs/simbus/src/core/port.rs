//! Port metadata and runtime ports.
//!
//! A [`PortInfo`] is created when the model file is read and lives for
//! the whole run; runtime ports are created during databus setup and
//! carry the current typed value, the binding into the element's own
//! storage, conversion chains and (for inputs) the incoming connection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::core::connection::Connection;
use crate::core::conversion::{LinearConversion, RangeConversion, TypeConversion, UnitConversion};
use crate::core::error::{Result, SimbusError};
use crate::core::throttle::{Emission, RepeatLimiter};
use crate::core::value::{ChannelType, ChannelValue, ValueCell};

/// When a NaN on a double output port is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NanCheck {
    #[default]
    Always,
    ConnectedOnly,
    Never,
}

/// Immutable port metadata.
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub name: String,
    /// Name of the variable inside the element's own tool, if different.
    pub name_in_tool: Option<String>,
    pub description: Option<String>,
    pub unit: Option<String>,
    /// Stable id used by result backends.
    pub id: String,
    pub port_type: ChannelType,
    pub min: Option<ChannelValue>,
    pub max: Option<ChannelValue>,
    pub scale: Option<ChannelValue>,
    pub offset: Option<ChannelValue>,
    pub default_value: Option<ChannelValue>,
    pub initial_value: Option<ChannelValue>,
    pub initial_value_is_exact: bool,
    pub write_result: bool,
    pub connected: bool,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, port_type: ChannelType, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            name_in_tool: None,
            description: None,
            unit: None,
            id: id.into(),
            port_type,
            min: None,
            max: None,
            scale: None,
            offset: None,
            default_value: None,
            initial_value: None,
            initial_value_is_exact: false,
            // binary blobs are not written to results unless asked for
            write_result: !port_type.is_binary(),
            connected: false,
        }
    }

    /// The name used in log messages.
    pub fn log_name(&self) -> &str {
        &self.name
    }
}

/// An ordered, contiguous family of scalar ports sharing a base name.
#[derive(Debug, Clone)]
pub struct VectorPortInfo {
    pub name: String,
    pub start_index: usize,
    /// Inclusive.
    pub end_index: usize,
    /// Index of the first child in the scalarised info list.
    pub first_child: usize,
}

impl VectorPortInfo {
    pub fn len(&self) -> usize {
        self.end_index - self.start_index + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn child_name(&self, index: usize) -> String {
        format!("{}[{}]", self.name, index)
    }
}

/// What an output port samples its value from.
pub enum OutputBinding {
    /// A cell inside the element's own storage.
    Cell(ValueCell),
    /// A time-indexed pure function.
    Function(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
}

impl std::fmt::Debug for OutputBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputBinding::Cell(_) => f.write_str("Cell"),
            OutputBinding::Function(_) => f.write_str("Function"),
        }
    }
}

/// Runtime input port.
#[derive(Debug)]
pub struct InputPort {
    value: ValueCell,
    binding: Option<ValueCell>,
    connection: Option<Arc<Connection>>,
    type_conversion: Option<TypeConversion>,
    unit_conversion: Option<UnitConversion>,
    linear_conversion: Option<LinearConversion>,
    range_conversion: Option<RangeConversion>,
    is_discrete: bool,
    defined_during_init: bool,
}

impl InputPort {
    /// Create the port from its metadata; conversions derived from
    /// min/max/scale/offset, default value applied if present.
    pub fn from_info(info: &PortInfo) -> Result<Self> {
        if info.port_type == ChannelType::Unknown {
            return Err(SimbusError::Port(format!(
                "port {}: setup inport: unknown type",
                info.log_name()
            )));
        }

        let value = ValueCell::zero(info.port_type);
        let mut defined_during_init = false;
        if let Some(default) = &info.default_value {
            value.set(default)?;
            defined_during_init = true;
        }

        let (range_conversion, linear_conversion) = if info.port_type.is_numeric() {
            (
                RangeConversion::new(info.min.clone(), info.max.clone())?,
                LinearConversion::new(info.scale.clone(), info.offset.clone())?,
            )
        } else {
            (None, None)
        };

        Ok(Self {
            value,
            binding: None,
            connection: None,
            type_conversion: None,
            unit_conversion: None,
            linear_conversion,
            range_conversion,
            is_discrete: false,
            defined_during_init,
        })
    }

    pub fn set_reference(&mut self, info: &PortInfo, cell: ValueCell, ty: ChannelType) -> Result<()> {
        if self.binding.is_some() {
            return Err(SimbusError::Port(format!(
                "port {}: set inport reference: reference already set",
                info.log_name()
            )));
        }
        if ty != ChannelType::Unknown && info.port_type != ty {
            let binary_ok = info.port_type.is_binary() && ty.is_binary();
            if !binary_ok {
                return Err(SimbusError::Port(format!(
                    "port {}: set inport reference: mismatching types",
                    info.log_name()
                )));
            }
        }
        self.binding = Some(cell);
        Ok(())
    }

    /// Wire the incoming connection; sets up unit conversion against
    /// the source port's unit and type conversion against its type.
    pub fn set_connection(
        &mut self,
        info: &PortInfo,
        connection: Arc<Connection>,
        source_unit: Option<&str>,
        source_type: ChannelType,
    ) -> Result<()> {
        if self.connection.is_some() {
            return Err(SimbusError::Port(format!(
                "port {}: set inport connection: connection already set",
                info.log_name()
            )));
        }

        if info.port_type == ChannelType::Double {
            self.unit_conversion = UnitConversion::new(source_unit, info.unit.as_deref());
        }

        if info.port_type != source_type {
            let conversion = TypeConversion::new(source_type, info.port_type).map_err(|e| {
                SimbusError::Port(format!(
                    "port {}: set connection: could not setup type conversion: {e}",
                    info.log_name()
                ))
            })?;
            if !conversion.is_identity() {
                self.type_conversion = Some(conversion);
            }
        }

        self.connection = Some(connection);
        Ok(())
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    pub fn is_connected(&self, info: &PortInfo) -> bool {
        info.connected || self.connection.is_some()
    }

    /// A port is usable when it is connected or carries a default.
    pub fn is_valid(&self, info: &PortInfo) -> bool {
        self.is_connected(info) || info.default_value.is_some()
    }

    pub fn set_discrete(&mut self) {
        self.is_discrete = true;
    }

    pub fn is_discrete(&self) -> bool {
        self.is_discrete
    }

    pub fn is_defined_during_init(&self) -> bool {
        self.defined_during_init
    }

    pub fn mark_defined_during_init(&mut self) {
        self.defined_during_init = true;
    }

    /// Current (post-conversion) value.
    pub fn value_cell(&self) -> &ValueCell {
        &self.value
    }

    /// Pull the connection value at `time_start`, run the conversion
    /// chain and copy the result into the element's bound cell. An
    /// unconnected port just forwards its default value untouched.
    pub fn update(&mut self, info: &PortInfo, time_start: f64) -> Result<()> {
        if let Some(connection) = &self.connection {
            connection.update_to_output(time_start)?;
            let mut val = connection.current_value();

            if let Some(conversion) = &self.type_conversion {
                conversion.apply(&mut val).map_err(|e| {
                    SimbusError::Port(format!(
                        "port {}: update inport: could not execute type conversion: {e}",
                        info.log_name()
                    ))
                })?;
            }

            if info.port_type == ChannelType::Double {
                if let Some(conversion) = &self.unit_conversion {
                    conversion.apply(&mut val).map_err(|e| {
                        SimbusError::Port(format!(
                            "port {}: update inport: could not execute unit conversion: {e}",
                            info.log_name()
                        ))
                    })?;
                }
            }

            if info.port_type.is_numeric() {
                if let Some(conversion) = &self.linear_conversion {
                    conversion.apply(&mut val).map_err(|e| {
                        SimbusError::Port(format!(
                            "port {}: update inport: could not execute linear conversion: {e}",
                            info.log_name()
                        ))
                    })?;
                }
                if let Some(conversion) = &self.range_conversion {
                    conversion.apply(&mut val).map_err(|e| {
                        SimbusError::Port(format!(
                            "port {}: update inport: could not execute range conversion: {e}",
                            info.log_name()
                        ))
                    })?;
                }
            }

            self.value.replace(val);
            if connection.is_defined_during_init() {
                self.defined_during_init = true;
            }
        }

        if let Some(binding) = &self.binding {
            binding.set(&self.value.get())?;
        }

        Ok(())
    }
}

/// Runtime output port.
#[derive(Debug)]
pub struct OutputPort {
    value: ValueCell,
    binding: Option<OutputBinding>,
    connections: Vec<Arc<Connection>>,
    range_conversion: Option<RangeConversion>,
    range_conversion_active: bool,
    linear_conversion: Option<LinearConversion>,
    nan_check: NanCheck,
    nan_warnings: RepeatLimiter,
    defined_during_init: bool,
}

impl OutputPort {
    pub fn from_info(info: &PortInfo, nan_check: NanCheck, max_nan_warnings: usize) -> Result<Self> {
        if info.port_type == ChannelType::Unknown {
            return Err(SimbusError::Port(format!(
                "port {}: setup outport: unknown type",
                info.log_name()
            )));
        }

        let value = ValueCell::zero(info.port_type);

        let (range_conversion, linear_conversion) = if info.port_type.is_numeric() {
            (
                RangeConversion::new(info.min.clone(), info.max.clone())?,
                LinearConversion::new(info.scale.clone(), info.offset.clone())?,
            )
        } else {
            (None, None)
        };

        let mut port = Self {
            value,
            binding: None,
            connections: Vec::new(),
            range_conversion,
            range_conversion_active: true,
            linear_conversion,
            nan_check,
            nan_warnings: RepeatLimiter::new(max_nan_warnings),
            defined_during_init: false,
        };

        if let Some(default) = &info.default_value {
            port.binding = Some(OutputBinding::Cell(ValueCell::new(default.clone())));
        }

        Ok(port)
    }

    pub fn set_reference(&mut self, info: &PortInfo, cell: ValueCell, ty: ChannelType) -> Result<()> {
        // a binding created from the default value may be replaced
        let default_binding =
            matches!(&self.binding, Some(OutputBinding::Cell(_))) && info.default_value.is_some();
        if self.binding.is_some() && !default_binding {
            return Err(SimbusError::Port(format!(
                "port {}: set outport reference: reference already set",
                info.log_name()
            )));
        }
        if ty != ChannelType::Unknown && info.port_type != ty {
            let binary_ok = info.port_type.is_binary() && ty.is_binary();
            if !binary_ok {
                return Err(SimbusError::Port(format!(
                    "port {}: set outport reference: mismatching types",
                    info.log_name()
                )));
            }
        }
        self.binding = Some(OutputBinding::Cell(cell));
        Ok(())
    }

    pub fn set_reference_fn(
        &mut self,
        info: &PortInfo,
        function: Arc<dyn Fn(f64) -> f64 + Send + Sync>,
        ty: ChannelType,
    ) -> Result<()> {
        if ty != ChannelType::Unknown && info.port_type != ty {
            return Err(SimbusError::Port(format!(
                "port {}: set outport function: mismatching types",
                info.log_name()
            )));
        }
        if matches!(self.binding, Some(OutputBinding::Function(_))) {
            return Err(SimbusError::Port(format!(
                "port {}: set outport function: reference already set",
                info.log_name()
            )));
        }
        self.binding = Some(OutputBinding::Function(function));
        Ok(())
    }

    pub fn register_connection(&mut self, connection: Arc<Connection>) {
        self.connections.push(connection);
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    pub fn function(&self) -> Option<Arc<dyn Fn(f64) -> f64 + Send + Sync>> {
        match &self.binding {
            Some(OutputBinding::Function(f)) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.binding.is_some()
    }

    pub fn is_connected(&self, info: &PortInfo) -> bool {
        info.connected || !self.connections.is_empty()
    }

    pub fn set_range_conversion_active(&mut self, active: bool) {
        self.range_conversion_active = active;
    }

    pub fn value_cell(&self) -> &ValueCell {
        &self.value
    }

    pub fn is_defined_during_init(&self) -> bool {
        self.defined_during_init
    }

    /// Sample the binding at `time_start`, apply range and linear
    /// conversions, push the value into every outgoing connection and
    /// run the NaN policy.
    pub fn update(&mut self, info: &PortInfo, time_start: f64) -> Result<()> {
        match &self.binding {
            Some(OutputBinding::Function(f)) => {
                let val = f(time_start);
                self.value.set(&ChannelValue::Double(val))?;
            }
            Some(OutputBinding::Cell(cell)) => {
                self.value.set(&cell.get())?;
            }
            None => {
                return Err(SimbusError::Port(format!(
                    "port {}: update outport: no value reference",
                    info.log_name()
                )));
            }
        }

        if info.port_type.is_numeric() {
            let mut val = self.value.get();
            if self.range_conversion_active {
                if let Some(conversion) = &self.range_conversion {
                    conversion.apply(&mut val).map_err(|e| {
                        SimbusError::Port(format!(
                            "port {}: update outport: could not execute range conversion: {e}",
                            info.log_name()
                        ))
                    })?;
                }
            }
            if let Some(conversion) = &self.linear_conversion {
                conversion.apply(&mut val).map_err(|e| {
                    SimbusError::Port(format!(
                        "port {}: update outport: could not execute linear conversion: {e}",
                        info.log_name()
                    ))
                })?;
            }
            self.value.set(&val)?;
        }

        let current = self.value.get();
        self.defined_during_init = true;
        for connection in &self.connections {
            connection.update_from_input(time_start, &current)?;
        }

        if info.port_type == ChannelType::Double {
            let val = current.as_double()?;
            if val.is_nan() {
                return self.handle_nan(info, time_start);
            }
        }

        Ok(())
    }

    fn handle_nan(&mut self, info: &PortInfo, time: f64) -> Result<()> {
        let connected = !self.connections.is_empty();
        let message = format!(
            "outport {} at time {time} is not a number (NaN)",
            info.name
        );

        match self.nan_check {
            NanCheck::Always => {
                error!("{message}");
                Err(SimbusError::Runtime(message))
            }
            NanCheck::ConnectedOnly => {
                if connected {
                    error!("{message}");
                    Err(SimbusError::Runtime(message))
                } else {
                    self.warn_nan(&message, false);
                    Ok(())
                }
            }
            NanCheck::Never => {
                self.warn_nan(&message, connected);
                Ok(())
            }
        }
    }

    fn warn_nan(&mut self, message: &str, as_error: bool) {
        match self.nan_warnings.next() {
            Emission::Emit => {
                if as_error {
                    error!("{message}");
                } else {
                    warn!("{message}");
                }
            }
            Emission::EmitLast => {
                if as_error {
                    error!("{message}");
                } else {
                    warn!("{message}");
                }
                warn!("this warning will not be shown anymore");
            }
            Emission::Suppress => {}
        }
    }
}

/// Observable value of the element that is neither input nor output.
#[derive(Debug)]
pub struct LocalPort {
    binding: ValueCell,
}

impl LocalPort {
    pub fn new(binding: ValueCell) -> Self {
        Self { binding }
    }

    pub fn value_cell(&self) -> &ValueCell {
        &self.binding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double_info(name: &str) -> PortInfo {
        PortInfo::new(name, ChannelType::Double, format!("test.{name}"))
    }

    #[test]
    fn test_unknown_type_rejected() {
        let info = PortInfo::new("p", ChannelType::Unknown, "test.p");
        assert!(InputPort::from_info(&info).is_err());
        assert!(OutputPort::from_info(&info, NanCheck::Always, 0).is_err());
    }

    #[test]
    fn test_binary_write_result_defaults_off() {
        assert!(!PortInfo::new("b", ChannelType::Binary, "test.b").write_result);
        assert!(double_info("d").write_result);
    }

    #[test]
    fn test_input_reference_only_once() {
        let info = double_info("in");
        let mut port = InputPort::from_info(&info).unwrap();
        port.set_reference(&info, ValueCell::double(0.0), ChannelType::Double)
            .unwrap();
        assert!(
            port.set_reference(&info, ValueCell::double(0.0), ChannelType::Double)
                .is_err()
        );
    }

    #[test]
    fn test_input_reference_type_mismatch() {
        let info = double_info("in");
        let mut port = InputPort::from_info(&info).unwrap();
        assert!(
            port.set_reference(
                &info,
                ValueCell::zero(ChannelType::Integer),
                ChannelType::Integer
            )
            .is_err()
        );
    }

    #[test]
    fn test_default_value_makes_input_valid() {
        let mut info = double_info("in");
        assert!(!InputPort::from_info(&info).unwrap().is_valid(&info));
        info.default_value = Some(ChannelValue::Double(1.5));
        let port = InputPort::from_info(&info).unwrap();
        assert!(port.is_valid(&info));
        assert!(port.is_defined_during_init());
        assert_eq!(port.value_cell().get_double().unwrap(), 1.5);
    }

    #[test]
    fn test_output_update_applies_conversions() {
        let mut info = double_info("out");
        info.min = Some(ChannelValue::Double(0.0));
        info.max = Some(ChannelValue::Double(10.0));
        info.scale = Some(ChannelValue::Double(2.0));
        let mut port = OutputPort::from_info(&info, NanCheck::Always, 0).unwrap();
        let cell = ValueCell::double(30.0);
        port.set_reference(&info, cell, ChannelType::Double).unwrap();

        port.update(&info, 0.0).unwrap();
        // range clamps to 10, then scale doubles it
        assert_eq!(port.value_cell().get_double().unwrap(), 20.0);
    }

    #[test]
    fn test_output_function_binding() {
        let info = double_info("out");
        let mut port = OutputPort::from_info(&info, NanCheck::Always, 0).unwrap();
        port.set_reference_fn(&info, Arc::new(|t| 2.0 * t), ChannelType::Double)
            .unwrap();
        port.update(&info, 3.0).unwrap();
        assert_eq!(port.value_cell().get_double().unwrap(), 6.0);
    }

    #[test]
    fn test_nan_policy_always_errors() {
        let info = double_info("out");
        let mut port = OutputPort::from_info(&info, NanCheck::Always, 0).unwrap();
        port.set_reference(&info, ValueCell::double(f64::NAN), ChannelType::Double)
            .unwrap();
        assert!(port.update(&info, 0.2).is_err());
    }

    #[test]
    fn test_nan_policy_never_warns_only() {
        let info = double_info("out");
        let mut port = OutputPort::from_info(&info, NanCheck::Never, 2).unwrap();
        port.set_reference(&info, ValueCell::double(f64::NAN), ChannelType::Double)
            .unwrap();
        for _ in 0..5 {
            assert!(port.update(&info, 0.0).is_ok());
        }
    }

    #[test]
    fn test_vector_info_child_names() {
        let vec_info = VectorPortInfo {
            name: "x".into(),
            start_index: 2,
            end_index: 4,
            first_child: 0,
        };
        assert_eq!(vec_info.len(), 3);
        assert_eq!(vec_info.child_name(2), "x[2]");
    }
}
