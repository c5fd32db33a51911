//! Declarative model input.
//!
//! These structures mirror the model file one-to-one; the reader only
//! parses and validates shape, all cross-referencing (port lookup,
//! connection endpoints) happens during model assembly.

use std::path::Path;

use serde::Deserialize;

use crate::core::error::{Result, SimbusError};
use crate::core::port::NanCheck;
use crate::core::value::{ChannelType, ChannelValue};
use crate::steptypes::CouplingMethod;
use crate::storage::StoreLevel;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelInput {
    #[serde(default)]
    pub name: Option<String>,
    pub task: TaskInput,
    #[serde(default)]
    pub config: ConfigInput,
    #[serde(default)]
    pub results: ResultsInput,
    pub components: Vec<ComponentInput>,
    #[serde(default)]
    pub connections: Vec<ConnectionInput>,
}

impl ModelInput {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| SimbusError::Config(format!("could not parse model input: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SimbusError::Config(format!("could not read model file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }
}

/// Global settings of the run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskInput {
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    /// Synchronisation step size.
    #[serde(default)]
    pub delta_time: Option<f64>,
    #[serde(default)]
    pub coupling: CouplingMethod,
    /// Relative epsilon for time comparisons, scaled by `delta_time`.
    #[serde(default)]
    pub relative_eps: Option<f64>,
    /// Evaluate element inputs at the end of their coupling step.
    #[serde(default)]
    pub input_at_end_time: Option<bool>,
    /// Advance time by summation instead of `n * delta_time`.
    #[serde(default)]
    pub sum_time: Option<bool>,
    #[serde(default)]
    pub end_type: EndType,
    /// Record real-time factors per element.
    #[serde(default)]
    pub timing_output: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndType {
    #[default]
    AllComponents,
    FirstComponent,
}

/// Global engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConfigInput {
    pub nan_check: NanCheck,
    /// Warning cap for lenient NaN policies; 0 means unlimited.
    pub nan_check_num_messages: usize,
    /// Warning cap for time snapping; 0 means unlimited.
    pub time_snap_num_messages: usize,
}

impl Default for ConfigInput {
    fn default() -> Self {
        Self {
            nan_check: NanCheck::Always,
            nan_check_num_messages: 10,
            time_snap_num_messages: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ResultsInput {
    pub result_dir: Option<String>,
    pub store_level: Option<StoreLevelInput>,
    pub store_inputs: Option<bool>,
    pub store_outputs: Option<bool>,
    pub store_locals: Option<bool>,
    pub store_rt_factors: Option<bool>,
    pub backends: Option<Vec<BackendInput>>,
    /// Default rate gates, overridable per component.
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub step_time: Option<f64>,
    pub step_count: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreLevelInput {
    None,
    Communication,
    Coupling,
}

impl From<StoreLevelInput> for StoreLevel {
    fn from(level: StoreLevelInput) -> Self {
        match level {
            StoreLevelInput::None => StoreLevel::None,
            StoreLevelInput::Communication => StoreLevel::Communication,
            StoreLevelInput::Coupling => StoreLevel::Coupling,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct BackendInput {
    pub kind: BackendKind,
    #[serde(default)]
    pub store_at_runtime: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Csv,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentInput {
    pub name: String,
    pub kind: String,
    /// Element-specific parameters, interpreted by the element factory.
    #[serde(default)]
    pub parameters: serde_yaml::Value,
    /// Own coupling time step; absent means the element steps with the
    /// synchronisation step.
    #[serde(default)]
    pub time_step: Option<f64>,
    /// Per-element override of the task's input evaluation time.
    #[serde(default)]
    pub input_at_end_time: Option<bool>,
    #[serde(default)]
    pub inputs: Vec<PortInput>,
    #[serde(default)]
    pub outputs: Vec<PortInput>,
    #[serde(default)]
    pub results: Option<ComponentResultsInput>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ComponentResultsInput {
    pub result_level: Option<StoreLevelInput>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub step_time: Option<f64>,
    pub step_count: Option<u64>,
}

/// A scalar port, or a vector family when both indices are given.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortInput {
    pub name: String,
    #[serde(default)]
    pub name_in_tool: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(rename = "type", default = "default_port_type")]
    pub port_type: ChannelType,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub min: Option<serde_yaml::Value>,
    #[serde(default)]
    pub max: Option<serde_yaml::Value>,
    #[serde(default)]
    pub scale: Option<serde_yaml::Value>,
    #[serde(default)]
    pub offset: Option<serde_yaml::Value>,
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    #[serde(default)]
    pub initial: Option<serde_yaml::Value>,
    #[serde(default)]
    pub initial_is_exact: bool,
    #[serde(default)]
    pub write_result: Option<bool>,
    #[serde(default)]
    pub start_index: Option<usize>,
    #[serde(default)]
    pub end_index: Option<usize>,
}

fn default_port_type() -> ChannelType {
    ChannelType::Double
}

impl PortInput {
    pub fn is_vector(&self) -> bool {
        self.start_index.is_some() || self.end_index.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionInput {
    /// `element.port`, an output of the source element.
    pub from: String,
    /// `element.port`, an input of the target element.
    pub to: String,
    #[serde(default)]
    pub decouple: Option<DecoupleInput>,
    #[serde(default)]
    pub interpolation: Option<InterExtraInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoupleInput {
    Never,
    Always,
    IfNeeded { priority: i32 },
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct InterExtraInput {
    pub interpolation_order: usize,
    pub extrapolation_order: usize,
}

/// Interpret a YAML scalar as a typed channel value.
pub fn value_from_yaml(value: &serde_yaml::Value, ty: ChannelType) -> Result<ChannelValue> {
    let fail = || {
        SimbusError::Config(format!(
            "value {value:?} does not fit channel type {ty}"
        ))
    };
    match ty {
        ChannelType::Double => value
            .as_f64()
            .or_else(|| value.as_i64().map(|i| i as f64))
            .map(ChannelValue::Double)
            .ok_or_else(fail),
        ChannelType::Integer => value
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(ChannelValue::Integer)
            .ok_or_else(fail),
        ChannelType::Bool => value.as_bool().map(ChannelValue::Bool).ok_or_else(fail),
        ChannelType::String => value
            .as_str()
            .map(|s| ChannelValue::String(s.to_string()))
            .ok_or_else(fail),
        ChannelType::Binary | ChannelType::BinaryRef | ChannelType::Unknown => Err(fail()),
    }
}

/// Split an `element.port` endpoint reference.
pub fn split_endpoint(endpoint: &str) -> Result<(&str, &str)> {
    endpoint.split_once('.').ok_or_else(|| {
        SimbusError::Config(format!(
            "connection endpoint \"{endpoint}\" is not of the form element.port"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
task:
  delta_time: 0.1
  end_time: 0.3
components:
  - name: source
    kind: constant
    parameters: { value: 7.5 }
    outputs:
      - name: out
  - name: sink
    kind: passthrough
    inputs:
      - name: in
    outputs:
      - name: out
connections:
  - from: source.out
    to: sink.in
"#;

    #[test]
    fn test_minimal_model_parses() {
        let model = ModelInput::from_yaml(MINIMAL).unwrap();
        assert_eq!(model.components.len(), 2);
        assert_eq!(model.connections.len(), 1);
        assert_eq!(model.task.delta_time, Some(0.1));
        assert_eq!(model.task.coupling, CouplingMethod::Sequential);
        assert_eq!(model.components[0].outputs[0].port_type, ChannelType::Double);
    }

    #[test]
    fn test_decouple_variants() {
        let never: DecoupleInput = serde_yaml::from_str("never").unwrap();
        assert_eq!(never, DecoupleInput::Never);
        let if_needed: DecoupleInput = serde_yaml::from_str("if_needed: { priority: 2 }").unwrap();
        assert_eq!(if_needed, DecoupleInput::IfNeeded { priority: 2 });
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = ModelInput::from_yaml(&MINIMAL.replace("connections:", "connectoins:"));
        assert!(result.is_err());
    }

    #[test]
    fn test_vector_port_flag() {
        let port: PortInput = serde_yaml::from_str(
            "{ name: x, start_index: 0, end_index: 2 }",
        )
        .unwrap();
        assert!(port.is_vector());
    }

    #[test]
    fn test_value_from_yaml() {
        let v = serde_yaml::Value::from(2);
        assert_eq!(
            value_from_yaml(&v, ChannelType::Double).unwrap(),
            ChannelValue::Double(2.0)
        );
        assert_eq!(
            value_from_yaml(&v, ChannelType::Integer).unwrap(),
            ChannelValue::Integer(2)
        );
        assert!(value_from_yaml(&v, ChannelType::Bool).is_err());
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(split_endpoint("a.out").unwrap(), ("a", "out"));
        assert!(split_endpoint("nodot").is_err());
    }
}
