//! Unit strings and their SI definitions.
//!
//! A unit maps to `(factor, offset)` against its SI base:
//! `si = (value + offset) * factor`. The table covers the units that
//! appear in models; unknown strings are reported by the caller and
//! degrade to identity.

use std::f64::consts::PI;

/// SI definition of a unit string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiDef {
    pub factor: f64,
    pub offset: f64,
}

impl SiDef {
    const fn factor(factor: f64) -> Self {
        Self { factor, offset: 0.0 }
    }
}

/// The unit string used for the time column of result files.
pub const TIME_UNIT: &str = "s";

/// A unit string that explicitly means "no unit".
pub const NO_UNIT: &str = "-";

/// Look up the SI definition of a unit string.
pub fn si_def(unit: &str) -> Option<SiDef> {
    let def = match unit {
        // time
        "s" => SiDef::factor(1.0),
        "ms" => SiDef::factor(1e-3),
        "min" => SiDef::factor(60.0),
        "h" => SiDef::factor(3600.0),
        // length
        "m" => SiDef::factor(1.0),
        "mm" => SiDef::factor(1e-3),
        "cm" => SiDef::factor(1e-2),
        "km" => SiDef::factor(1e3),
        // velocity
        "m/s" => SiDef::factor(1.0),
        "km/h" => SiDef::factor(1000.0 / 3600.0),
        // angle
        "rad" => SiDef::factor(1.0),
        "deg" => SiDef::factor(PI / 180.0),
        // angular velocity
        "rad/s" => SiDef::factor(1.0),
        "rpm" => SiDef::factor(2.0 * PI / 60.0),
        // mass
        "kg" => SiDef::factor(1.0),
        "g" => SiDef::factor(1e-3),
        "t" => SiDef::factor(1e3),
        // force, pressure, energy, power
        "N" => SiDef::factor(1.0),
        "kN" => SiDef::factor(1e3),
        "Pa" => SiDef::factor(1.0),
        "bar" => SiDef::factor(1e5),
        "J" => SiDef::factor(1.0),
        "kJ" => SiDef::factor(1e3),
        "W" => SiDef::factor(1.0),
        "kW" => SiDef::factor(1e3),
        // temperature
        "K" => SiDef::factor(1.0),
        "degC" => SiDef {
            factor: 1.0,
            offset: 273.15,
        },
        _ => return None,
    };
    Some(def)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_velocity_units() {
        let kmh = si_def("km/h").unwrap();
        // 360 km/h = 100 m/s
        assert!(((360.0 + kmh.offset) * kmh.factor - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_temperature_offset() {
        let c = si_def("degC").unwrap();
        assert!(((20.0 + c.offset) * c.factor - 293.15).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_unit() {
        assert!(si_def("furlong/fortnight").is_none());
    }
}
