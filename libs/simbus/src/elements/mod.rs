//! Built-in analytic elements and their factory.

mod constant;
mod gain;
mod integrator;
mod passthrough;
mod sinus;
mod sum;

pub use constant::Constant;
pub use gain::Gain;
pub use integrator::Integrator;
pub use passthrough::Passthrough;
pub use sinus::SinusGenerator;
pub use sum::Sum;

use crate::core::element::Element;
use crate::core::error::{Result, SimbusError};

/// Build an element from its kind string and parameter block.
pub fn create_element(kind: &str, parameters: &serde_yaml::Value) -> Result<Box<dyn Element>> {
    match kind {
        "constant" => Ok(Box::new(Constant::from_parameters(parameters)?)),
        "integrator" => Ok(Box::new(Integrator::from_parameters(parameters)?)),
        "gain" => Ok(Box::new(Gain::from_parameters(parameters)?)),
        "sum" => Ok(Box::new(Sum::from_parameters(parameters)?)),
        "sinus_generator" => Ok(Box::new(SinusGenerator::from_parameters(parameters)?)),
        "passthrough" => Ok(Box::new(Passthrough::new())),
        other => Err(SimbusError::Config(format!("unknown element kind \"{other}\""))),
    }
}

pub(crate) fn parse_parameters<T>(parameters: &serde_yaml::Value) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if parameters.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(parameters.clone())
        .map_err(|e| SimbusError::Config(format!("invalid element parameters: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_fails() {
        let params = serde_yaml::Value::Null;
        assert!(create_element("flux_capacitor", &params).is_err());
    }

    #[test]
    fn test_known_kinds() {
        let params = serde_yaml::Value::Null;
        for kind in [
            "constant",
            "integrator",
            "gain",
            "sum",
            "sinus_generator",
            "passthrough",
        ] {
            assert!(create_element(kind, &params).is_ok(), "kind {kind}");
        }
    }
}
