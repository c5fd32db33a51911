//! Typed port values.
//!
//! [`ChannelValue`] is the scalar carried on every port and every filter
//! sample. `Unknown` is the zero tag and is forbidden on any live port;
//! every operation that moves a value between types checks the tag and
//! fails loudly on mismatch. The only sanctioned cross-type moves are
//! the coercions in [`crate::core::conversion::TypeConversion`].

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, SimbusError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    Unknown,
    Double,
    Integer,
    Bool,
    String,
    Binary,
    BinaryRef,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Unknown => "Unknown",
            ChannelType::Double => "Double",
            ChannelType::Integer => "Integer",
            ChannelType::Bool => "Bool",
            ChannelType::String => "String",
            ChannelType::Binary | ChannelType::BinaryRef => "Binary",
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, ChannelType::Binary | ChannelType::BinaryRef)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ChannelType::Double | ChannelType::Integer)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ChannelValue {
    #[default]
    Unknown,
    Double(f64),
    Integer(i32),
    Bool(bool),
    String(String),
    Binary(Vec<u8>),
    /// Bytes owned elsewhere; never copied on assignment.
    BinaryRef(Arc<[u8]>),
}

impl ChannelValue {
    /// The zero value of a type.
    pub fn zero(ty: ChannelType) -> Self {
        match ty {
            ChannelType::Unknown => ChannelValue::Unknown,
            ChannelType::Double => ChannelValue::Double(0.0),
            ChannelType::Integer => ChannelValue::Integer(0),
            ChannelType::Bool => ChannelValue::Bool(false),
            ChannelType::String => ChannelValue::String(String::new()),
            ChannelType::Binary => ChannelValue::Binary(Vec::new()),
            ChannelType::BinaryRef => ChannelValue::BinaryRef(Arc::from(&[] as &[u8])),
        }
    }

    pub fn channel_type(&self) -> ChannelType {
        match self {
            ChannelValue::Unknown => ChannelType::Unknown,
            ChannelValue::Double(_) => ChannelType::Double,
            ChannelValue::Integer(_) => ChannelType::Integer,
            ChannelValue::Bool(_) => ChannelType::Bool,
            ChannelValue::String(_) => ChannelType::String,
            ChannelValue::Binary(_) => ChannelType::Binary,
            ChannelValue::BinaryRef(_) => ChannelType::BinaryRef,
        }
    }

    /// Assign from `source`, keeping our tag. Fails on tag mismatch;
    /// the owned binary/borrowed binary pair converts both ways.
    pub fn set_from(&mut self, source: &ChannelValue) -> Result<()> {
        match (&mut *self, source) {
            (ChannelValue::Double(d), ChannelValue::Double(s)) => *d = *s,
            (ChannelValue::Integer(d), ChannelValue::Integer(s)) => *d = *s,
            (ChannelValue::Bool(d), ChannelValue::Bool(s)) => *d = *s,
            (ChannelValue::String(d), ChannelValue::String(s)) => {
                d.clear();
                d.push_str(s);
            }
            (ChannelValue::Binary(d), ChannelValue::Binary(s)) => {
                d.clear();
                d.extend_from_slice(s);
            }
            (ChannelValue::Binary(d), ChannelValue::BinaryRef(s)) => {
                d.clear();
                d.extend_from_slice(s);
            }
            (ChannelValue::BinaryRef(d), ChannelValue::BinaryRef(s)) => *d = Arc::clone(s),
            (ChannelValue::BinaryRef(d), ChannelValue::Binary(s)) => *d = Arc::from(s.as_slice()),
            (dst, src) => {
                return Err(SimbusError::Port(format!(
                    "set: mismatching types, source type: {}, target type: {}",
                    src.channel_type(),
                    dst.channel_type()
                )));
            }
        }
        Ok(())
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            ChannelValue::Double(d) => Ok(*d),
            other => Err(SimbusError::Port(format!(
                "expected Double value, got {}",
                other.channel_type()
            ))),
        }
    }

    pub fn as_integer(&self) -> Result<i32> {
        match self {
            ChannelValue::Integer(i) => Ok(*i),
            other => Err(SimbusError::Port(format!(
                "expected Integer value, got {}",
                other.channel_type()
            ))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ChannelValue::Bool(b) => Ok(*b),
            other => Err(SimbusError::Port(format!(
                "expected Bool value, got {}",
                other.channel_type()
            ))),
        }
    }

    /// Multiply by a factor of the same numeric type.
    pub fn scale(&mut self, factor: &ChannelValue) -> Result<()> {
        match (&mut *self, factor) {
            (ChannelValue::Double(v), ChannelValue::Double(f)) => *v *= f,
            (ChannelValue::Integer(v), ChannelValue::Integer(f)) => *v *= f,
            (v, f) => {
                return Err(SimbusError::Port(format!(
                    "scale: type {} not allowed with factor type {}",
                    v.channel_type(),
                    f.channel_type()
                )));
            }
        }
        Ok(())
    }

    /// Add an offset of the same numeric type.
    pub fn add_offset(&mut self, offset: &ChannelValue) -> Result<()> {
        match (&mut *self, offset) {
            (ChannelValue::Double(v), ChannelValue::Double(o)) => *v += o,
            (ChannelValue::Integer(v), ChannelValue::Integer(o)) => *v += o,
            (v, o) => {
                return Err(SimbusError::Port(format!(
                    "add offset: type {} not allowed with offset type {}",
                    v.channel_type(),
                    o.channel_type()
                )));
            }
        }
        Ok(())
    }

    /// `self <= other` for numeric types; false for mixed tags.
    pub fn leq(&self, other: &ChannelValue) -> bool {
        match (self, other) {
            (ChannelValue::Double(a), ChannelValue::Double(b)) => a <= b,
            (ChannelValue::Integer(a), ChannelValue::Integer(b)) => a <= b,
            _ => false,
        }
    }

    /// `self >= other` for numeric types; false for mixed tags.
    pub fn geq(&self, other: &ChannelValue) -> bool {
        match (self, other) {
            (ChannelValue::Double(a), ChannelValue::Double(b)) => a >= b,
            (ChannelValue::Integer(a), ChannelValue::Integer(b)) => a >= b,
            _ => false,
        }
    }

    /// Equality for numeric, bool and string values; false for mixed tags.
    pub fn eq_value(&self, other: &ChannelValue) -> bool {
        match (self, other) {
            (ChannelValue::Double(a), ChannelValue::Double(b)) => a == b,
            (ChannelValue::Integer(a), ChannelValue::Integer(b)) => a == b,
            (ChannelValue::Bool(a), ChannelValue::Bool(b)) => a == b,
            (ChannelValue::String(a), ChannelValue::String(b)) => a == b,
            _ => false,
        }
    }

    /// Render the value the way result files expect it: `%.13E` doubles,
    /// plain integers, `0|1` bools, printable-ASCII strings with `_`
    /// masking, `\xHH`-escaped binary.
    pub fn to_result_string(&self) -> Result<String> {
        match self {
            ChannelValue::Double(d) => Ok(format_exp13(*d)),
            ChannelValue::Integer(i) => Ok(format!("{i}")),
            ChannelValue::Bool(b) => Ok(if *b { "1".into() } else { "0".into() }),
            ChannelValue::String(s) => Ok(mask_nonprintable(s)),
            ChannelValue::Binary(b) => Ok(escape_binary(b)),
            ChannelValue::BinaryRef(b) => Ok(escape_binary(b)),
            ChannelValue::Unknown => {
                Err(SimbusError::Port("value to string: unknown type".into()))
            }
        }
    }
}

/// C-style `%.13E`: one leading digit, 13 fractional digits, `E`,
/// explicit exponent sign, at least two exponent digits.
pub fn format_exp13(v: f64) -> String {
    if v.is_nan() {
        return "NAN".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "INF" } else { "-INF" }.to_string();
    }

    let s = format!("{v:.13E}");
    match s.split_once('E') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{mantissa}E{sign}{digits:0>2}")
        }
        None => s,
    }
}

fn mask_nonprintable(s: &str) -> String {
    s.bytes()
        .map(|b| {
            if (b' '..=b'~').contains(&b) {
                b as char
            } else {
                '_'
            }
        })
        .collect()
}

fn escape_binary(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for b in bytes {
        out.push_str(&format!("\\x{b:02x}"));
    }
    out
}

/// A shared value slot.
///
/// Elements keep their state in cells and register clones with the
/// databus during setup; ports copy in and out of them, and the result
/// storage samples them at store time. The cell pins its tag at
/// creation; assignments through [`ValueCell::set`] are tag-checked.
#[derive(Debug, Clone)]
pub struct ValueCell {
    inner: Arc<Mutex<ChannelValue>>,
}

impl ValueCell {
    pub fn new(value: ChannelValue) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    pub fn zero(ty: ChannelType) -> Self {
        Self::new(ChannelValue::zero(ty))
    }

    pub fn double(v: f64) -> Self {
        Self::new(ChannelValue::Double(v))
    }

    pub fn channel_type(&self) -> ChannelType {
        self.inner.lock().channel_type()
    }

    pub fn get(&self) -> ChannelValue {
        self.inner.lock().clone()
    }

    /// Tag-checked assignment.
    pub fn set(&self, value: &ChannelValue) -> Result<()> {
        self.inner.lock().set_from(value)
    }

    /// Overwrite including the tag. Reserved for setup-time typing.
    pub fn replace(&self, value: ChannelValue) {
        *self.inner.lock() = value;
    }

    pub fn get_double(&self) -> Result<f64> {
        self.inner.lock().as_double()
    }

    pub fn set_double(&self, v: f64) -> Result<()> {
        self.set(&ChannelValue::Double(v))
    }

    /// Whether two cells share the same slot.
    pub fn same_slot(&self, other: &ValueCell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_values() {
        assert_eq!(ChannelValue::zero(ChannelType::Double), ChannelValue::Double(0.0));
        assert_eq!(ChannelValue::zero(ChannelType::Integer), ChannelValue::Integer(0));
        assert_eq!(ChannelValue::zero(ChannelType::Bool), ChannelValue::Bool(false));
        assert_eq!(ChannelValue::zero(ChannelType::Unknown), ChannelValue::Unknown);
    }

    #[test]
    fn test_set_from_mismatch_fails() {
        let mut v = ChannelValue::Double(1.0);
        assert!(v.set_from(&ChannelValue::Integer(2)).is_err());
        assert_eq!(v, ChannelValue::Double(1.0));
    }

    #[test]
    fn test_set_from_string_copies() {
        let mut v = ChannelValue::String("old".into());
        v.set_from(&ChannelValue::String("new".into())).unwrap();
        assert_eq!(v, ChannelValue::String("new".into()));
    }

    #[test]
    fn test_binary_ref_aliases() {
        let bytes: Arc<[u8]> = Arc::from(&b"abc"[..]);
        let mut v = ChannelValue::zero(ChannelType::BinaryRef);
        v.set_from(&ChannelValue::BinaryRef(Arc::clone(&bytes))).unwrap();
        match v {
            ChannelValue::BinaryRef(r) => assert!(Arc::ptr_eq(&r, &bytes)),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn test_scale_and_offset() {
        let mut v = ChannelValue::Double(2.0);
        v.scale(&ChannelValue::Double(3.0)).unwrap();
        v.add_offset(&ChannelValue::Double(1.0)).unwrap();
        assert_eq!(v, ChannelValue::Double(7.0));

        let mut i = ChannelValue::Integer(4);
        i.scale(&ChannelValue::Integer(2)).unwrap();
        assert_eq!(i, ChannelValue::Integer(8));

        let mut b = ChannelValue::Bool(true);
        assert!(b.scale(&ChannelValue::Double(2.0)).is_err());
    }

    #[test]
    fn test_comparisons_mixed_tags_are_false() {
        assert!(!ChannelValue::Double(1.0).leq(&ChannelValue::Integer(2)));
        assert!(!ChannelValue::Double(1.0).geq(&ChannelValue::Integer(0)));
        assert!(!ChannelValue::Double(1.0).eq_value(&ChannelValue::Integer(1)));
    }

    #[test]
    fn test_format_exp13() {
        assert_eq!(format_exp13(7.5), "7.5000000000000E+00");
        assert_eq!(format_exp13(0.0), "0.0000000000000E+00");
        assert_eq!(format_exp13(-0.015), "-1.5000000000000E-02");
        assert_eq!(format_exp13(1.0e123), "1.0000000000000E+123");
    }

    #[test]
    fn test_result_strings() {
        assert_eq!(
            ChannelValue::Integer(-42).to_result_string().unwrap(),
            "-42"
        );
        assert_eq!(ChannelValue::Bool(true).to_result_string().unwrap(), "1");
        assert_eq!(
            ChannelValue::String("a\tb".into()).to_result_string().unwrap(),
            "a_b"
        );
        assert_eq!(
            ChannelValue::Binary(vec![0x00, 0xff]).to_result_string().unwrap(),
            "\\x00\\xff"
        );
        assert!(ChannelValue::Unknown.to_result_string().is_err());
    }

    #[test]
    fn test_value_cell_tag_checked() {
        let cell = ValueCell::zero(ChannelType::Double);
        cell.set_double(2.5).unwrap();
        assert_eq!(cell.get_double().unwrap(), 2.5);
        assert!(cell.set(&ChannelValue::Integer(1)).is_err());
    }
}
