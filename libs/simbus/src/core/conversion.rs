//! Value conversions applied along the port update protocol: range
//! clamping, linear scale/offset, unit conversion and the documented
//! type coercions. Each conversion validates its configuration at setup
//! and degenerates to `None` when it would be the identity.

use tracing::warn;

use crate::core::error::{Result, SimbusError};
use crate::core::units::{self, SiDef, NO_UNIT};
use crate::core::value::{ChannelType, ChannelValue};

/// Clamp a numeric value into `[min, max]`.
#[derive(Debug, Clone)]
pub struct RangeConversion {
    min: Option<ChannelValue>,
    max: Option<ChannelValue>,
}

impl RangeConversion {
    /// Returns `None` when no bound is given or both bounds are the
    /// full range of the type.
    pub fn new(min: Option<ChannelValue>, max: Option<ChannelValue>) -> Result<Option<Self>> {
        let (min, max) = match (min, max) {
            (None, None) => return Ok(None),
            pair => pair,
        };

        let ty = min
            .as_ref()
            .or(max.as_ref())
            .map(ChannelValue::channel_type)
            .expect("at least one bound is present");

        if let (Some(min), Some(max)) = (&min, &max) {
            if min.channel_type() != max.channel_type() {
                return Err(SimbusError::Config(
                    "range conversion: types of min value and max value do not match".into(),
                ));
            }
            if !min.leq(max) {
                return Err(SimbusError::Config(
                    "range conversion: specified max. value < specified min. value".into(),
                ));
            }
        }

        if !ty.is_numeric() {
            return Err(SimbusError::Config(format!(
                "range conversion is not defined for type {ty}"
            )));
        }

        let empty = match ty {
            ChannelType::Double => {
                min.as_ref().is_none_or(|m| *m == ChannelValue::Double(-f64::MAX))
                    && max.as_ref().is_none_or(|m| *m == ChannelValue::Double(f64::MAX))
            }
            ChannelType::Integer => {
                min.as_ref().is_none_or(|m| *m == ChannelValue::Integer(i32::MIN))
                    && max.as_ref().is_none_or(|m| *m == ChannelValue::Integer(i32::MAX))
            }
            _ => unreachable!("numeric types only"),
        };
        if empty {
            return Ok(None);
        }

        Ok(Some(Self { min, max }))
    }

    pub fn apply(&self, value: &mut ChannelValue) -> Result<()> {
        if let Some(min) = &self.min {
            if value.channel_type() != min.channel_type() {
                return Err(SimbusError::Port(format!(
                    "range conversion: value has wrong type {}, expected: {}",
                    value.channel_type(),
                    min.channel_type()
                )));
            }
            if value.leq(min) {
                return value.set_from(min);
            }
        }
        if let Some(max) = &self.max {
            if value.channel_type() != max.channel_type() {
                return Err(SimbusError::Port(format!(
                    "range conversion: value has wrong type {}, expected: {}",
                    value.channel_type(),
                    max.channel_type()
                )));
            }
            if value.geq(max) {
                return value.set_from(max);
            }
        }
        Ok(())
    }
}

/// `v := v * factor + offset` for numeric types.
#[derive(Debug, Clone)]
pub struct LinearConversion {
    factor: Option<ChannelValue>,
    offset: Option<ChannelValue>,
}

impl LinearConversion {
    pub fn new(
        factor: Option<ChannelValue>,
        offset: Option<ChannelValue>,
    ) -> Result<Option<Self>> {
        let (factor, offset) = match (factor, offset) {
            (None, None) => return Ok(None),
            pair => pair,
        };

        let ty = factor
            .as_ref()
            .or(offset.as_ref())
            .map(ChannelValue::channel_type)
            .expect("at least one part is present");

        if let (Some(f), Some(o)) = (&factor, &offset) {
            if f.channel_type() != o.channel_type() {
                return Err(SimbusError::Config(format!(
                    "linear conversion: types of factor value ({}) and offset value ({}) do not match",
                    f.channel_type(),
                    o.channel_type()
                )));
            }
        }

        if !ty.is_numeric() {
            return Err(SimbusError::Config(format!(
                "linear conversion is not defined for type {ty}"
            )));
        }

        let empty = match ty {
            ChannelType::Double => {
                factor.as_ref().is_none_or(|f| *f == ChannelValue::Double(1.0))
                    && offset.as_ref().is_none_or(|o| *o == ChannelValue::Double(0.0))
            }
            ChannelType::Integer => {
                factor.as_ref().is_none_or(|f| *f == ChannelValue::Integer(1))
                    && offset.as_ref().is_none_or(|o| *o == ChannelValue::Integer(0))
            }
            _ => unreachable!("numeric types only"),
        };
        if empty {
            return Ok(None);
        }

        Ok(Some(Self { factor, offset }))
    }

    pub fn apply(&self, value: &mut ChannelValue) -> Result<()> {
        if let Some(factor) = &self.factor {
            value.scale(factor)?;
        }
        if let Some(offset) = &self.offset {
            value.add_offset(offset)?;
        }
        Ok(())
    }
}

/// Convert between two unit strings through their SI definitions.
#[derive(Debug, Clone)]
pub struct UnitConversion {
    source: SiDef,
    target: SiDef,
}

impl UnitConversion {
    /// Returns `None` when both sides name the same unit or either side
    /// is unknown (an unknown unit string is a warning, not an error).
    pub fn new(from_unit: Option<&str>, to_unit: Option<&str>) -> Option<Self> {
        let from = from_unit.filter(|u| !u.is_empty() && *u != NO_UNIT)?;
        let to = to_unit.filter(|u| !u.is_empty() && *u != NO_UNIT)?;

        if from == to {
            return None;
        }

        let source = match units::si_def(from) {
            Some(def) => def,
            None => {
                warn!("unit conversion: unknown unit string \"{from}\", ignoring");
                return None;
            }
        };
        let target = match units::si_def(to) {
            Some(def) => def,
            None => {
                warn!("unit conversion: unknown unit string \"{to}\", ignoring");
                return None;
            }
        };

        Some(Self { source, target })
    }

    pub fn apply(&self, value: &mut ChannelValue) -> Result<()> {
        let mut v = value.as_double().map_err(|_| {
            SimbusError::Port(format!(
                "unit conversion: value has wrong type {}, expected: Double",
                value.channel_type()
            ))
        })?;

        v = (v + self.source.offset) * self.source.factor;
        v = v / self.target.factor - self.target.offset;

        value.set_from(&ChannelValue::Double(v))
    }
}

/// The seven documented coercions between double, integer and bool.
#[derive(Debug, Clone, Copy)]
pub struct TypeConversion {
    from: ChannelType,
    to: ChannelType,
}

impl TypeConversion {
    pub fn new(from: ChannelType, to: ChannelType) -> Result<Self> {
        use ChannelType::*;
        let legal = from == to
            || matches!(
                (from, to),
                (Integer, Double)
                    | (Double, Integer)
                    | (Bool, Double)
                    | (Double, Bool)
                    | (Bool, Integer)
                    | (Integer, Bool)
            );
        if !legal {
            return Err(SimbusError::Config(format!(
                "type conversion: illegal conversion selected ({from} -> {to})"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }

    pub fn apply(&self, value: &mut ChannelValue) -> Result<()> {
        if value.channel_type() != self.from {
            return Err(SimbusError::Port(format!(
                "type conversion: value has wrong type {}, expected: {}",
                value.channel_type(),
                self.from
            )));
        }

        use ChannelType::*;
        let converted = match (self.from, self.to) {
            (a, b) if a == b => return Ok(()),
            (Integer, Double) => ChannelValue::Double(value.as_integer()? as f64),
            // round to nearest
            (Double, Integer) => {
                ChannelValue::Integer((value.as_double()? + 0.5).floor() as i32)
            }
            (Bool, Double) => ChannelValue::Double(if value.as_bool()? { 1.0 } else { 0.0 }),
            (Double, Bool) => ChannelValue::Bool(value.as_double()? > 0.0),
            (Bool, Integer) => ChannelValue::Integer(if value.as_bool()? { 1 } else { 0 }),
            (Integer, Bool) => ChannelValue::Bool(value.as_integer()? != 0),
            _ => unreachable!("validated in new()"),
        };
        *value = converted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_clamps() {
        let conv = RangeConversion::new(
            Some(ChannelValue::Double(0.0)),
            Some(ChannelValue::Double(60.0)),
        )
        .unwrap()
        .unwrap();

        let mut v = ChannelValue::Double(100.0);
        conv.apply(&mut v).unwrap();
        assert_eq!(v, ChannelValue::Double(60.0));

        let mut v = ChannelValue::Double(-5.0);
        conv.apply(&mut v).unwrap();
        assert_eq!(v, ChannelValue::Double(0.0));

        let mut v = ChannelValue::Double(30.0);
        conv.apply(&mut v).unwrap();
        assert_eq!(v, ChannelValue::Double(30.0));
    }

    #[test]
    fn test_range_min_greater_max_fails() {
        let result = RangeConversion::new(
            Some(ChannelValue::Double(10.0)),
            Some(ChannelValue::Double(0.0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_range_full_range_is_empty() {
        let conv = RangeConversion::new(
            Some(ChannelValue::Double(-f64::MAX)),
            Some(ChannelValue::Double(f64::MAX)),
        )
        .unwrap();
        assert!(conv.is_none());
    }

    #[test]
    fn test_linear() {
        let conv = LinearConversion::new(
            Some(ChannelValue::Double(0.5)),
            Some(ChannelValue::Double(1.0)),
        )
        .unwrap()
        .unwrap();
        let mut v = ChannelValue::Double(100.0);
        conv.apply(&mut v).unwrap();
        assert_eq!(v, ChannelValue::Double(51.0));
    }

    #[test]
    fn test_linear_identity_is_empty() {
        let conv = LinearConversion::new(
            Some(ChannelValue::Double(1.0)),
            Some(ChannelValue::Double(0.0)),
        )
        .unwrap();
        assert!(conv.is_none());
    }

    #[test]
    fn test_linear_non_numeric_fails() {
        let result = LinearConversion::new(Some(ChannelValue::Bool(true)), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_unit_kmh_to_ms() {
        let conv = UnitConversion::new(Some("km/h"), Some("m/s")).unwrap();
        let mut v = ChannelValue::Double(360.0);
        conv.apply(&mut v).unwrap();
        assert!((v.as_double().unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_unknown_degrades_to_identity() {
        assert!(UnitConversion::new(Some("widget"), Some("m/s")).is_none());
        assert!(UnitConversion::new(Some("m"), Some("m")).is_none());
        assert!(UnitConversion::new(None, Some("m")).is_none());
    }

    #[test]
    fn test_type_double_to_integer_rounds() {
        let conv = TypeConversion::new(ChannelType::Double, ChannelType::Integer).unwrap();
        let mut v = ChannelValue::Double(2.5);
        conv.apply(&mut v).unwrap();
        assert_eq!(v, ChannelValue::Integer(3));

        let mut v = ChannelValue::Double(-1.6);
        conv.apply(&mut v).unwrap();
        assert_eq!(v, ChannelValue::Integer(-2));
    }

    #[test]
    fn test_type_bool_coercions() {
        let conv = TypeConversion::new(ChannelType::Double, ChannelType::Bool).unwrap();
        let mut v = ChannelValue::Double(0.3);
        conv.apply(&mut v).unwrap();
        assert_eq!(v, ChannelValue::Bool(true));

        let conv = TypeConversion::new(ChannelType::Bool, ChannelType::Integer).unwrap();
        let mut v = ChannelValue::Bool(true);
        conv.apply(&mut v).unwrap();
        assert_eq!(v, ChannelValue::Integer(1));
    }

    #[test]
    fn test_type_illegal_pair_fails() {
        assert!(TypeConversion::new(ChannelType::String, ChannelType::Double).is_err());
        assert!(TypeConversion::new(ChannelType::Binary, ChannelType::Integer).is_err());
    }
}
