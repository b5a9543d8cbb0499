//! Runtime values and the operators defined over them.
//!
//! Arithmetic promotes `Int` to `Float` when either side is a float. Bitwise
//! operators and shifts accept only `Int`. Anything else is a
//! [`ValueError`]; values are never coerced silently.

use std::fmt;

use thiserror::Error;

use crate::ast::{BinaryOp, Pos, UnaryOp};
use crate::error::{ErrorKind, ScriptError};

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Void,
}

/// An operator failure without a source position. The interpreter attaches
/// the position of the failing expression via [`ValueError::at`].
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ValueError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ValueError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeMismatch, message)
    }

    pub fn at(self, pos: Pos) -> ScriptError {
        ScriptError::runtime(self.kind, self.message, pos.line, pos.column)
    }
}

pub type ValueResult = Result<RuntimeValue, ValueError>;

impl RuntimeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuntimeValue::Int(_) => "int",
            RuntimeValue::Float(_) => "float",
            RuntimeValue::Bool(_) => "bool",
            RuntimeValue::String(_) => "string",
            RuntimeValue::Bytes(_) => "bytes",
            RuntimeValue::Void => "void",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            RuntimeValue::Int(n) => *n != 0,
            RuntimeValue::Float(f) => *f != 0.0,
            RuntimeValue::Bool(b) => *b,
            RuntimeValue::String(s) => !s.is_empty(),
            RuntimeValue::Bytes(b) => !b.is_empty(),
            RuntimeValue::Void => false,
        }
    }

    pub fn as_int(&self) -> Result<i64, ValueError> {
        match self {
            RuntimeValue::Int(n) => Ok(*n),
            other => Err(ValueError::type_mismatch(format!("Expected int, got {}", other.type_name()))),
        }
    }

    /// Interprets the value as a non-negative millisecond count.
    pub fn as_millis(&self) -> Result<u64, ValueError> {
        let ms = match self {
            RuntimeValue::Int(n) => *n as f64,
            RuntimeValue::Float(f) if f.is_finite() => *f,
            other => {
                return Err(ValueError::type_mismatch(format!(
                    "Expected a duration in milliseconds, got {}",
                    other.type_name()
                )))
            }
        };
        if ms < 0.0 {
            return Err(ValueError::new(ErrorKind::TypeMismatch, format!("Negative duration: {}", self)));
        }
        Ok(ms as u64)
    }

    /// Appends this value to a frame payload: an `Int` is one byte, `Bytes` are copied.
    pub fn extend_payload(&self, payload: &mut Vec<u8>) -> Result<(), ValueError> {
        match self {
            RuntimeValue::Int(n) => {
                let byte = u8::try_from(*n)
                    .map_err(|_| ValueError::new(ErrorKind::InvalidFrame, format!("Byte value out of range: {}", n)))?;
                payload.push(byte);
                Ok(())
            }
            RuntimeValue::Bytes(bytes) => {
                payload.extend_from_slice(bytes);
                Ok(())
            }
            other => Err(ValueError::type_mismatch(format!(
                "Frame data must be int or bytes, got {}",
                other.type_name()
            ))),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            RuntimeValue::Int(n) => Some(*n as f64),
            RuntimeValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality across any pair of types. Ints and floats compare numerically;
    /// other mismatched types are simply unequal.
    pub fn loose_eq(&self, other: &RuntimeValue) -> bool {
        match (self, other) {
            (RuntimeValue::Int(a), RuntimeValue::Int(b)) => a == b,
            (RuntimeValue::Int(i), RuntimeValue::Float(f)) | (RuntimeValue::Float(f), RuntimeValue::Int(i)) => {
                int_eq_float(*i, *f)
            }
            _ => self == other,
        }
    }

    pub fn binary(op: BinaryOp, left: &RuntimeValue, right: &RuntimeValue) -> ValueResult {
        use RuntimeValue::*;
        match op {
            BinaryOp::Or => Ok(Bool(left.is_truthy() || right.is_truthy())),
            BinaryOp::And => Ok(Bool(left.is_truthy() && right.is_truthy())),
            BinaryOp::Eq => Ok(Bool(left.loose_eq(right))),
            BinaryOp::NotEq => Ok(Bool(!left.loose_eq(right))),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, left, right),
            BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::BitAnd | BinaryOp::Shl | BinaryOp::Shr => {
                bitwise(op, left, right)
            }
            BinaryOp::Add => match (left, right) {
                (String(a), String(b)) => Ok(String(format!("{}{}", a, b))),
                (Bytes(a), Bytes(b)) => Ok(Bytes([a.as_slice(), b.as_slice()].concat())),
                _ => arithmetic(op, left, right),
            },
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, left, right),
        }
    }

    pub fn unary(op: UnaryOp, operand: &RuntimeValue) -> ValueResult {
        match (op, operand) {
            (UnaryOp::Not, v) => Ok(RuntimeValue::Bool(!v.is_truthy())),
            (UnaryOp::Neg, RuntimeValue::Int(n)) => n
                .checked_neg()
                .map(RuntimeValue::Int)
                .ok_or_else(|| ValueError::new(ErrorKind::Overflow, "Integer overflow in '-'")),
            (UnaryOp::Neg, RuntimeValue::Float(f)) => Ok(RuntimeValue::Float(-f)),
            (UnaryOp::BitNot, RuntimeValue::Int(n)) => Ok(RuntimeValue::Int(!n)),
            (op, v) => Err(ValueError::type_mismatch(format!(
                "Operator '{}' is not defined for {}",
                op.symbol(),
                v.type_name()
            ))),
        }
    }

    /// `bytes[i]` yields an int, `string[i]` a one-character string.
    pub fn index(&self, index: &RuntimeValue) -> ValueResult {
        let i = index.as_int()?;
        let out_of_range = |len: usize| {
            ValueError::new(ErrorKind::IndexOutOfRange, format!("Index {} out of range for length {}", i, len))
        };
        match self {
            RuntimeValue::Bytes(bytes) => usize::try_from(i)
                .ok()
                .and_then(|i| bytes.get(i))
                .map(|b| RuntimeValue::Int(i64::from(*b)))
                .ok_or_else(|| out_of_range(bytes.len())),
            RuntimeValue::String(s) => usize::try_from(i)
                .ok()
                .and_then(|i| s.chars().nth(i))
                .map(|c| RuntimeValue::String(c.to_string()))
                .ok_or_else(|| out_of_range(s.chars().count())),
            other => Err(ValueError::type_mismatch(format!("Cannot index into {}", other.type_name()))),
        }
    }

    pub fn member(&self, field: &str) -> ValueResult {
        match (self, field) {
            (RuntimeValue::Bytes(b), "length" | "len") => Ok(RuntimeValue::Int(b.len() as i64)),
            (RuntimeValue::String(s), "length" | "len") => Ok(RuntimeValue::Int(s.chars().count() as i64)),
            (v, _) => Err(ValueError::new(
                ErrorKind::UndefinedIdentifier,
                format!("{} has no member '{}'", v.type_name(), field),
            )),
        }
    }

    pub fn len(&self) -> Result<usize, ValueError> {
        match self {
            RuntimeValue::Bytes(b) => Ok(b.len()),
            RuntimeValue::String(s) => Ok(s.chars().count()),
            other => Err(ValueError::type_mismatch(format!("len() is not defined for {}", other.type_name()))),
        }
    }

    pub fn to_int(&self) -> ValueResult {
        match self {
            RuntimeValue::Int(n) => Ok(RuntimeValue::Int(*n)),
            RuntimeValue::Float(f) if f.is_finite() => Ok(RuntimeValue::Int(f.trunc() as i64)),
            RuntimeValue::Bool(b) => Ok(RuntimeValue::Int(i64::from(*b))),
            RuntimeValue::String(s) => {
                let s = s.trim();
                let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => i64::from_str_radix(hex, 16),
                    None => s.parse::<i64>(),
                };
                parsed
                    .map(RuntimeValue::Int)
                    .map_err(|_| ValueError::type_mismatch(format!("Cannot convert \"{}\" to int", s)))
            }
            other => Err(ValueError::type_mismatch(format!("Cannot convert {} to int", other.type_name()))),
        }
    }

    pub fn to_float(&self) -> ValueResult {
        match self {
            RuntimeValue::Int(n) => Ok(RuntimeValue::Float(*n as f64)),
            RuntimeValue::Float(f) => Ok(RuntimeValue::Float(*f)),
            RuntimeValue::String(s) => s
                .trim()
                .parse::<f64>()
                .map(RuntimeValue::Float)
                .map_err(|_| ValueError::type_mismatch(format!("Cannot convert \"{}\" to float", s))),
            other => Err(ValueError::type_mismatch(format!("Cannot convert {} to float", other.type_name()))),
        }
    }

    /// `hex(255)` is `"0xFF"`, `hex([1, 2])` is `"01 02"`.
    pub fn to_hex(&self) -> ValueResult {
        match self {
            RuntimeValue::Int(n) if *n < 0 => Ok(RuntimeValue::String(format!("-0x{:X}", n.unsigned_abs()))),
            RuntimeValue::Int(n) => Ok(RuntimeValue::String(format!("0x{:X}", n))),
            RuntimeValue::Bytes(b) => Ok(RuntimeValue::String(hex_bytes(b))),
            other => Err(ValueError::type_mismatch(format!("hex() is not defined for {}", other.type_name()))),
        }
    }
}

pub(crate) fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

/// Exact comparison: an int equals a float only when the float is integral
/// and holds the same value.
fn int_eq_float(i: i64, f: f64) -> bool {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f) && f as i64 == i
}

fn compare(op: BinaryOp, left: &RuntimeValue, right: &RuntimeValue) -> ValueResult {
    let ordering = match (left, right) {
        (RuntimeValue::Int(a), RuntimeValue::Int(b)) => a.partial_cmp(b),
        (RuntimeValue::String(a), RuntimeValue::String(b)) => a.partial_cmp(b),
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => return Err(mismatch(op, left, right)),
        },
    };
    let result = match ordering {
        // NaN compares false against everything.
        None => false,
        Some(o) => match op {
            BinaryOp::Lt => o.is_lt(),
            BinaryOp::Le => o.is_le(),
            BinaryOp::Gt => o.is_gt(),
            _ => o.is_ge(),
        },
    };
    Ok(RuntimeValue::Bool(result))
}

fn bitwise(op: BinaryOp, left: &RuntimeValue, right: &RuntimeValue) -> ValueResult {
    let (a, b) = match (left, right) {
        (RuntimeValue::Int(a), RuntimeValue::Int(b)) => (*a, *b),
        _ => return Err(mismatch(op, left, right)),
    };
    let shift = || {
        u32::try_from(b)
            .ok()
            .filter(|s| *s < 64)
            .ok_or_else(|| ValueError::new(ErrorKind::Overflow, format!("Shift amount out of range: {}", b)))
    };
    let value = match op {
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::BitAnd => a & b,
        BinaryOp::Shl => a << shift()?,
        _ => a >> shift()?,
    };
    Ok(RuntimeValue::Int(value))
}

fn arithmetic(op: BinaryOp, left: &RuntimeValue, right: &RuntimeValue) -> ValueResult {
    let overflow = || ValueError::new(ErrorKind::Overflow, format!("Integer overflow in '{}'", op.symbol()));
    let div_zero = || ValueError::new(ErrorKind::DivisionByZero, "Division by zero");

    if let (RuntimeValue::Int(a), RuntimeValue::Int(b)) = (left, right) {
        let (a, b) = (*a, *b);
        let value = match op {
            BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
            BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
            BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
            BinaryOp::Div if b == 0 => return Err(div_zero()),
            BinaryOp::Div => a.checked_div(b).ok_or_else(overflow)?,
            BinaryOp::Rem if b == 0 => return Err(div_zero()),
            BinaryOp::Rem => a.checked_rem(b).ok_or_else(overflow)?,
            _ => return Err(mismatch(op, left, right)),
        };
        return Ok(RuntimeValue::Int(value));
    }

    let (a, b) = match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(mismatch(op, left, right)),
    };
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(div_zero()),
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        _ => return Err(mismatch(op, left, right)),
    };
    Ok(RuntimeValue::Float(value))
}

fn mismatch(op: BinaryOp, left: &RuntimeValue, right: &RuntimeValue) -> ValueError {
    ValueError::type_mismatch(format!(
        "Operator '{}' is not defined for {} and {}",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

impl fmt::Display for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeValue::Int(n) => write!(f, "{}", n),
            RuntimeValue::Float(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 => write!(f, "{:.1}", x),
            RuntimeValue::Float(x) => write!(f, "{}", x),
            RuntimeValue::Bool(b) => write!(f, "{}", b),
            RuntimeValue::String(s) => write!(f, "{}", s),
            RuntimeValue::Bytes(b) => write!(f, "[{}]", hex_bytes(b)),
            RuntimeValue::Void => write!(f, "void"),
        }
    }
}

impl From<i64> for RuntimeValue {
    fn from(n: i64) -> Self {
        RuntimeValue::Int(n)
    }
}

impl From<bool> for RuntimeValue {
    fn from(b: bool) -> Self {
        RuntimeValue::Bool(b)
    }
}

impl From<Vec<u8>> for RuntimeValue {
    fn from(bytes: Vec<u8>) -> Self {
        RuntimeValue::Bytes(bytes)
    }
}
