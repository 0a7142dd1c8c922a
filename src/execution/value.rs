use crate::{binary::types::ValueType, error::TrapKind};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }

    pub fn matches(&self, ty: ValueType) -> bool {
        self.value_type() == ty
    }

    /// Zero value a local of type `ty` starts with.
    pub fn default_for(ty: ValueType) -> Self {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Value::I32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Value::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Parses a textual argument as a value of type `ty`. Integers accept
    /// decimal or `0x` hex; an unsigned literal that only fits when
    /// reinterpreted (e.g. `4294967295` for i32) is accepted as well.
    pub fn parse(ty: ValueType, text: &str) -> Result<Self, ParseValueError> {
        let err = || ParseValueError {
            ty,
            text: text.to_string(),
        };
        let value = match ty {
            ValueType::I32 => Value::I32(match parse_int(text) {
                Some(v) => i32::try_from(v)
                    .or_else(|_| u32::try_from(v).map(|v| v as i32))
                    .map_err(|_| err())?,
                None => return Err(err()),
            }),
            ValueType::I64 => Value::I64(match parse_int(text) {
                Some(v) => i64::try_from(v)
                    .or_else(|_| u64::try_from(v).map(|v| v as i64))
                    .map_err(|_| err())?,
                None => return Err(err()),
            }),
            ValueType::F32 => Value::F32(text.parse().map_err(|_| err())?),
            ValueType::F64 => Value::F64(text.parse().map_err(|_| err())?),
        };
        Ok(value)
    }
}

fn parse_int(text: &str) -> Option<i128> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i128::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i128>().ok()?,
    };
    Some(if negative { -magnitude } else { magnitude })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {ty} literal `{text}`")]
pub struct ParseValueError {
    pub ty: ValueType,
    pub text: String,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::F32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::I32(if value { 1 } else { 0 })
    }
}

pub(crate) fn pop(stack: &mut Vec<Value>) -> Result<Value, TrapKind> {
    stack
        .pop()
        .ok_or(TrapKind::Malformed("operand stack underflow"))
}

pub(crate) fn pop_i32(stack: &mut Vec<Value>) -> Result<i32, TrapKind> {
    match pop(stack)? {
        Value::I32(v) => Ok(v),
        _ => Err(TrapKind::Malformed("expected an i32 operand")),
    }
}

pub(crate) fn pop_i64(stack: &mut Vec<Value>) -> Result<i64, TrapKind> {
    match pop(stack)? {
        Value::I64(v) => Ok(v),
        _ => Err(TrapKind::Malformed("expected an i64 operand")),
    }
}

pub(crate) fn pop_f32(stack: &mut Vec<Value>) -> Result<f32, TrapKind> {
    match pop(stack)? {
        Value::F32(v) => Ok(v),
        _ => Err(TrapKind::Malformed("expected an f32 operand")),
    }
}

pub(crate) fn pop_f64(stack: &mut Vec<Value>) -> Result<f64, TrapKind> {
    match pop(stack)? {
        Value::F64(v) => Ok(v),
        _ => Err(TrapKind::Malformed("expected an f64 operand")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Block,
    Loop,
    If,
}

/// Branch target of an active structured block.
#[derive(Debug, Clone)]
pub struct Label {
    pub kind: LabelKind,
    /// Where a branch to this label continues: after `end`, or at the `loop`
    /// instruction itself.
    pub pc: usize,
    pub sp: usize,
    /// Values carried by a branch.
    pub arity: usize,
    /// Values left when the block falls through its `end`.
    pub results: usize,
}

#[cfg(test)]
mod tests {
    use super::{pop_i32, Value};
    use crate::{binary::types::ValueType, error::TrapKind};

    #[test]
    fn value_type_and_matches() {
        assert_eq!(Value::I64(3).value_type(), ValueType::I64);
        assert!(Value::F32(1.5).matches(ValueType::F32));
        assert!(!Value::I32(1).matches(ValueType::I64));
        assert_eq!(Value::default_for(ValueType::F64), Value::F64(0.0));
        assert_eq!(Value::from(true), Value::I32(1));
    }

    #[test]
    fn parse_values() {
        let tests = vec![
            (ValueType::I32, "42", Value::I32(42)),
            (ValueType::I32, "-7", Value::I32(-7)),
            (ValueType::I32, "0xff", Value::I32(255)),
            (ValueType::I32, "4294967295", Value::I32(-1)),
            (ValueType::I64, "-9223372036854775808", Value::I64(i64::MIN)),
            (ValueType::F32, "1.5", Value::F32(1.5)),
            (ValueType::F64, "-0.25", Value::F64(-0.25)),
        ];
        for (ty, text, want) in tests {
            assert_eq!(Value::parse(ty, text), Ok(want), "{ty} {text}");
        }

        assert!(Value::parse(ValueType::I32, "4294967296").is_err());
        assert!(Value::parse(ValueType::I64, "abc").is_err());
        assert_eq!(
            Value::parse(ValueType::I32, "1.0").unwrap_err().to_string(),
            "invalid i32 literal `1.0`"
        );
    }

    #[test]
    fn pop_checks_operand_type() {
        let mut stack = vec![Value::I64(1)];
        assert_eq!(
            pop_i32(&mut stack),
            Err(TrapKind::Malformed("expected an i32 operand"))
        );
        assert_eq!(pop_i32(&mut stack), Err(TrapKind::Malformed("operand stack underflow")));
    }
}
