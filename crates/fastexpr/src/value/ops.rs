//! Operator semantics shared by the VM and the reference evaluator.
//!
//! Integer arithmetic wraps unless an overflow mode is requested. Operations
//! on `Null` operands are lifted: they produce `Null` (arithmetic) or follow
//! nullable comparison rules.

use std::cmp::Ordering;

use num_traits::{CheckedDiv, CheckedRem, PrimInt, WrappingAdd, WrappingMul, WrappingSub};

use super::{Thrown, Value};
use crate::node::{ArithOp, CmpOp};
use crate::types::Type;

/// Overflow handling of an arithmetic or conversion instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    Wrap,
    /// Throw when the result leaves the signed range of the operand width.
    Signed,
    /// Throw when the result leaves the unsigned range of the operand width.
    Unsigned,
}

impl Overflow {
    /// Overflow mode for an operation over `operand`.
    pub fn select(checked: bool, operand: &Type) -> Self {
        match (checked, operand.non_nullable().is_unsigned()) {
            (false, _) => Overflow::Wrap,
            (true, false) => Overflow::Signed,
            (true, true) => Overflow::Unsigned,
        }
    }

    fn is_checked(self) -> bool {
        self != Overflow::Wrap
    }
}

fn int_arith<T>(op: ArithOp, a: T, b: T, checked: bool) -> Result<T, Thrown>
where
    T: PrimInt + CheckedRem + WrappingAdd + WrappingSub + WrappingMul,
{
    match op {
        ArithOp::Add if checked => a.checked_add(&b).ok_or_else(Thrown::overflow),
        ArithOp::Add => Ok(a.wrapping_add(&b)),
        ArithOp::Sub if checked => a.checked_sub(&b).ok_or_else(Thrown::overflow),
        ArithOp::Sub => Ok(a.wrapping_sub(&b)),
        ArithOp::Mul if checked => a.checked_mul(&b).ok_or_else(Thrown::overflow),
        ArithOp::Mul => Ok(a.wrapping_mul(&b)),
        ArithOp::Div if b.is_zero() => Err(Thrown::divide_by_zero()),
        ArithOp::Div => CheckedDiv::checked_div(&a, &b).ok_or_else(Thrown::overflow),
        ArithOp::Rem if b.is_zero() => Err(Thrown::divide_by_zero()),
        ArithOp::Rem => CheckedRem::checked_rem(&a, &b).ok_or_else(Thrown::overflow),
        ArithOp::And => Ok(a & b),
        ArithOp::Or => Ok(a | b),
        ArithOp::Xor => Ok(a ^ b),
        ArithOp::Shl | ArithOp::Shr => unreachable!("shifts are handled by shift()"),
    }
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> Result<Value, Thrown> {
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Rem => a % b,
        other => {
            return Err(Thrown::invalid_operation(format!(
                "operator {other:?} is not defined for f64"
            )))
        }
    };
    Ok(Value::F64(result))
}

fn shift(op: ArithOp, value: Value, amount: &Value) -> Result<Value, Thrown> {
    let n = match amount {
        Value::Null => return Ok(Value::Null),
        other => other
            .as_i64()
            .ok_or_else(|| Thrown::invalid_operation("shift amount must be an integer"))?
            as u32,
    };
    let left = op == ArithOp::Shl;
    Ok(match value {
        Value::Null => Value::Null,
        Value::I32(x) => Value::I32(if left { x.wrapping_shl(n) } else { x.wrapping_shr(n) }),
        Value::I64(x) => Value::I64(if left { x.wrapping_shl(n) } else { x.wrapping_shr(n) }),
        Value::U32(x) => Value::U32(if left { x.wrapping_shl(n) } else { x.wrapping_shr(n) }),
        Value::U64(x) => Value::U64(if left { x.wrapping_shl(n) } else { x.wrapping_shr(n) }),
        other => {
            return Err(Thrown::invalid_operation(format!(
                "cannot shift {other:?}"
            )))
        }
    })
}

/// Applies a binary arithmetic or bitwise operator.
pub fn arith(op: ArithOp, a: Value, b: Value, overflow: Overflow) -> Result<Value, Thrown> {
    if matches!(op, ArithOp::Shl | ArithOp::Shr) {
        return shift(op, a, &b);
    }
    let checked = overflow.is_checked();
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::I32(x), Value::I32(y)) => match overflow {
            Overflow::Unsigned => {
                int_arith(op, x as u32, y as u32, true).map(|r| Value::I32(r as i32))
            }
            _ => int_arith(op, x, y, checked).map(Value::I32),
        },
        (Value::I64(x), Value::I64(y)) => match overflow {
            Overflow::Unsigned => {
                int_arith(op, x as u64, y as u64, true).map(|r| Value::I64(r as i64))
            }
            _ => int_arith(op, x, y, checked).map(Value::I64),
        },
        (Value::U32(x), Value::U32(y)) => match overflow {
            Overflow::Signed => int_arith(op, x as i32, y as i32, true).map(|r| Value::U32(r as u32)),
            _ => int_arith(op, x, y, checked).map(Value::U32),
        },
        (Value::U64(x), Value::U64(y)) => match overflow {
            Overflow::Signed => int_arith(op, x as i64, y as i64, true).map(|r| Value::U64(r as u64)),
            _ => int_arith(op, x, y, checked).map(Value::U64),
        },
        (Value::F64(x), Value::F64(y)) => float_arith(op, x, y),
        (Value::Bool(x), Value::Bool(y)) => match op {
            ArithOp::And => Ok(Value::Bool(x & y)),
            ArithOp::Or => Ok(Value::Bool(x | y)),
            ArithOp::Xor => Ok(Value::Bool(x ^ y)),
            other => Err(Thrown::invalid_operation(format!(
                "operator {other:?} is not defined for bool"
            ))),
        },
        (a, b) => Err(Thrown::invalid_operation(format!(
            "operator {op:?} is not defined for {a:?} and {b:?}"
        ))),
    }
}

/// Arithmetic negation.
pub fn negate(value: Value, overflow: Overflow) -> Result<Value, Thrown> {
    let checked = overflow.is_checked();
    match value {
        Value::Null => Ok(Value::Null),
        Value::I32(x) => int_arith(ArithOp::Sub, 0, x, checked).map(Value::I32),
        Value::I64(x) => int_arith(ArithOp::Sub, 0, x, checked).map(Value::I64),
        Value::U32(x) => int_arith(ArithOp::Sub, 0, x, checked).map(Value::U32),
        Value::U64(x) => int_arith(ArithOp::Sub, 0, x, checked).map(Value::U64),
        Value::F64(x) => Ok(Value::F64(-x)),
        other => Err(Thrown::invalid_operation(format!("cannot negate {other:?}"))),
    }
}

/// Logical not for bools, bitwise complement for integers.
pub fn not(value: Value) -> Result<Value, Thrown> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Bool(b) => Ok(Value::Bool(!b)),
        Value::I32(x) => Ok(Value::I32(!x)),
        Value::I64(x) => Ok(Value::I64(!x)),
        Value::U32(x) => Ok(Value::U32(!x)),
        Value::U64(x) => Ok(Value::U64(!x)),
        other => Err(Thrown::invalid_operation(format!("cannot complement {other:?}"))),
    }
}

/// Primitive comparison. A `Null` operand makes ordering comparisons false
/// and equality true only when both sides are null.
pub fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        let both = a.is_null() && b.is_null();
        return match op {
            CmpOp::Eq => both,
            CmpOp::Ne => !both,
            _ => false,
        };
    }
    let ordering = match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::I32(x), Value::I32(y)) => Some(x.cmp(y)),
        (Value::I64(x), Value::I64(y)) => Some(x.cmp(y)),
        (Value::U32(x), Value::U32(y)) => Some(x.cmp(y)),
        (Value::U64(x), Value::U64(y)) => Some(x.cmp(y)),
        (Value::F64(x), Value::F64(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (x, y) if matches!(op, CmpOp::Eq | CmpOp::Ne) => {
            return x.generic_eq(y) == (op == CmpOp::Eq);
        }
        _ => None,
    };
    match op {
        CmpOp::Eq => ordering == Some(Ordering::Equal),
        CmpOp::Ne => ordering != Some(Ordering::Equal),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

enum Num {
    Int(i128),
    Float(f64),
}

macro_rules! to_int {
    ($num:expr, $checked:expr, $t:ty) => {
        match $num {
            Num::Int(i) if $checked => <$t>::try_from(i).map_err(|_| Thrown::overflow()),
            Num::Int(i) => Ok(i as $t),
            Num::Float(f) if $checked => {
                let (lo, hi) = (<$t>::MIN as f64, <$t>::MAX as f64 + 1.0);
                let t = f.trunc();
                if f.is_nan() || t < lo || t >= hi {
                    Err(Thrown::overflow())
                } else {
                    Ok(t as $t)
                }
            }
            Num::Float(f) => Ok(f as $t),
        }
    };
}

/// Numeric conversion to `to`. `overflow` selects how the *source* is read:
/// `Unsigned` reinterprets signed sources as unsigned before range checking.
pub fn convert(value: Value, to: &Type, overflow: Overflow) -> Result<Value, Thrown> {
    let num = match value {
        Value::Null => return Ok(Value::Null),
        Value::I32(x) if overflow == Overflow::Unsigned => Num::Int(x as u32 as i128),
        Value::I32(x) => Num::Int(x as i128),
        Value::I64(x) if overflow == Overflow::Unsigned => Num::Int(x as u64 as i128),
        Value::I64(x) => Num::Int(x as i128),
        Value::U32(x) => Num::Int(x as i128),
        Value::U64(x) => Num::Int(x as i128),
        Value::F64(x) => Num::Float(x),
        Value::Bool(b) if to.non_nullable() == &Type::Bool => return Ok(Value::Bool(b)),
        other => return Err(Thrown::invalid_cast(&other, to)),
    };
    let checked = overflow.is_checked();
    match to.non_nullable() {
        Type::I32 => to_int!(num, checked, i32).map(Value::I32),
        Type::I64 => to_int!(num, checked, i64).map(Value::I64),
        Type::U32 => to_int!(num, checked, u32).map(Value::U32),
        Type::U64 => to_int!(num, checked, u64).map(Value::U64),
        Type::F64 => Ok(Value::F64(match num {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        })),
        other => Err(Thrown::invalid_operation(format!(
            "no numeric conversion to {other}"
        ))),
    }
}

/// Extracts the value of a nullable, throwing on `Null`.
pub fn unwrap_nullable(value: Value) -> Result<Value, Thrown> {
    match value {
        Value::Null => Err(Thrown::invalid_operation("Nullable object must have a value")),
        other => Ok(other),
    }
}

/// Checked read of a boxed value as value type `ty`.
pub fn unbox(value: Value, ty: &Type) -> Result<Value, Thrown> {
    match value {
        Value::Null if ty.admits_null() => Ok(Value::Null),
        Value::Null => Err(Thrown::null_reference()),
        v if v.type_matches(ty) => Ok(v),
        v => Err(Thrown::invalid_cast(&v, ty)),
    }
}

/// Checked reference cast; `Null` always passes.
pub fn cast_class(value: Value, ty: &Type) -> Result<Value, Thrown> {
    if value.is_null() || value.type_matches(ty) {
        Ok(value)
    } else {
        Err(Thrown::invalid_cast(&value, ty))
    }
}

/// String concatenation; `Null` reads as the empty string.
pub fn concat(a: &Value, b: &Value) -> Value {
    let mut s = String::new();
    for v in [a, b] {
        if !v.is_null() {
            s.push_str(&v.to_string());
        }
    }
    Value::str(s)
}

/// Reads instance field `index` of an object or struct.
pub fn load_field(receiver: &Value, index: usize) -> Result<Value, Thrown> {
    match receiver {
        Value::Object(obj) => Ok(obj.get(index)),
        Value::Struct(s) => Ok(s.fields[index].clone()),
        Value::Null => Err(Thrown::null_reference()),
        other => Err(Thrown::invalid_operation(format!(
            "{other:?} has no field {index}"
        ))),
    }
}

/// Writes instance field `index`; structs are updated in place.
pub fn store_field(receiver: &mut Value, index: usize, value: Value) -> Result<(), Thrown> {
    match receiver {
        Value::Object(obj) => {
            obj.set(index, value);
            Ok(())
        }
        Value::Struct(s) => {
            s.fields[index] = value;
            Ok(())
        }
        Value::Null => Err(Thrown::null_reference()),
        other => Err(Thrown::invalid_operation(format!(
            "{other:?} has no field {index}"
        ))),
    }
}

/// Converts an index operand to a slot position.
pub fn index_of(index: &Value) -> Result<usize, Thrown> {
    match index {
        Value::I32(i) => usize::try_from(*i).map_err(|_| Thrown::index_out_of_range(0)),
        Value::I64(i) => usize::try_from(*i).map_err(|_| Thrown::index_out_of_range(0)),
        Value::U32(i) => Ok(*i as usize),
        Value::U64(i) => usize::try_from(*i).map_err(|_| Thrown::index_out_of_range(usize::MAX)),
        other => Err(Thrown::invalid_operation(format!(
            "{other:?} is not a valid array index"
        ))),
    }
}

pub fn array_get(array: &Value, index: &Value) -> Result<Value, Thrown> {
    match array {
        Value::Array(arr) => arr.get(index_of(index)?),
        Value::Null => Err(Thrown::null_reference()),
        other => Err(Thrown::invalid_operation(format!("{other:?} is not an array"))),
    }
}

pub fn array_set(array: &Value, index: &Value, value: Value) -> Result<(), Thrown> {
    match array {
        Value::Array(arr) => arr.set(index_of(index)?, value),
        Value::Null => Err(Thrown::null_reference()),
        other => Err(Thrown::invalid_operation(format!("{other:?} is not an array"))),
    }
}

pub fn array_len(array: &Value) -> Result<Value, Thrown> {
    match array {
        Value::Array(arr) => Ok(Value::I32(arr.len() as i32)),
        Value::Null => Err(Thrown::null_reference()),
        other => Err(Thrown::invalid_operation(format!("{other:?} is not an array"))),
    }
}

/// Allocates a zero-initialised array of `len` elements.
pub fn new_array_len(elem: &Type, len: &Value) -> Result<Value, Thrown> {
    let n = match len {
        Value::I32(n) if *n < 0 => {
            return Err(Thrown::invalid_operation("array length must not be negative"))
        }
        other => index_of(other)?,
    };
    Ok(Value::new_array(
        elem.clone(),
        (0..n).map(|_| elem.default_value()).collect(),
    ))
}

/// The exception raised by a `throw` of `value`.
pub fn throw_value(value: Value) -> Thrown {
    match value {
        Value::Null => Thrown::null_reference(),
        other => Thrown(other),
    }
}

/// Invokes a function value.
pub fn invoke_value(target: &Value, args: &[Value]) -> Result<Value, Thrown> {
    match target {
        Value::Func(f) => f.call(args),
        Value::Null => Err(Thrown::null_reference()),
        other => Err(Thrown::invalid_operation(format!("{other:?} is not callable"))),
    }
}

/// One step of a built-in conversion between static types.
#[derive(Debug, Clone, PartialEq)]
pub enum ConvStep {
    Numeric { to: Type, overflow: Overflow },
    /// Nullable to its underlying value; throws on null.
    Unwrap,
    Unbox(Type),
    Cast(Type),
}

/// Plans a conversion from `from` to `to`, or `None` if no built-in
/// conversion exists. Boxing and nullable wrapping need no step.
pub fn plan_conversion(from: &Type, to: &Type, checked: bool) -> Option<Vec<ConvStep>> {
    if from == to {
        return Some(Vec::new());
    }
    if let Type::Nullable(inner) = to {
        if &**inner == from {
            return Some(Vec::new());
        }
    }
    if let Type::Nullable(inner) = from {
        if &**inner == to {
            return Some(vec![ConvStep::Unwrap]);
        }
    }
    let (src, dst) = (from.non_nullable(), to.non_nullable());
    if src.is_primitive() && dst.is_primitive() {
        if !(src.is_numeric() && dst.is_numeric()) {
            return None;
        }
        let mut steps = Vec::new();
        if matches!(from, Type::Nullable(_)) && !matches!(to, Type::Nullable(_)) {
            steps.push(ConvStep::Unwrap);
        }
        steps.push(ConvStep::Numeric {
            to: dst.clone(),
            overflow: Overflow::select(checked, src),
        });
        return Some(steps);
    }
    match (from.is_reference(), to.is_reference()) {
        // boxing
        (false, true) if to == &Type::Object => Some(Vec::new()),
        (true, false) if from == &Type::Object => Some(vec![ConvStep::Unbox(to.clone())]),
        (true, true) if to.accepts(from) => Some(Vec::new()),
        (true, true) if from.accepts(to) => Some(vec![ConvStep::Cast(to.clone())]),
        _ => None,
    }
}

/// Applies planned conversion steps to a value.
pub fn apply_conversion(mut value: Value, steps: &[ConvStep]) -> Result<Value, Thrown> {
    for step in steps {
        value = match step {
            ConvStep::Numeric { to, overflow } => convert(value, to, *overflow)?,
            ConvStep::Unwrap => unwrap_nullable(value)?,
            ConvStep::Unbox(ty) => unbox(value, ty)?,
            ConvStep::Cast(ty) => cast_class(value, ty)?,
        };
    }
    Ok(value)
}
