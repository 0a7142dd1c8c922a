//! Numeric operators with WebAssembly semantics: wrapping integer
//! arithmetic, trapping division and truncation, IEEE float operations with
//! WebAssembly `min`/`max`/`nearest`.

use super::value::{pop_f32, pop_f64, pop_i32, pop_i64, Value};
use crate::{
    binary::instruction::{NumericOp, TruncSatOp},
    error::TrapKind,
};
use num_traits::Float;

type Pop<T> = fn(&mut Vec<Value>) -> Result<T, TrapKind>;

fn unary<T, R: Into<Value>>(
    stack: &mut Vec<Value>,
    pop: Pop<T>,
    f: impl FnOnce(T) -> R,
) -> Result<Value, TrapKind> {
    let a = pop(stack)?;
    Ok(f(a).into())
}

fn binary<T, R: Into<Value>>(
    stack: &mut Vec<Value>,
    pop: Pop<T>,
    f: impl FnOnce(T, T) -> R,
) -> Result<Value, TrapKind> {
    let b = pop(stack)?;
    let a = pop(stack)?;
    Ok(f(a, b).into())
}

fn try_unary<T, R: Into<Value>>(
    stack: &mut Vec<Value>,
    pop: Pop<T>,
    f: impl FnOnce(T) -> Result<R, TrapKind>,
) -> Result<Value, TrapKind> {
    let a = pop(stack)?;
    Ok(f(a)?.into())
}

fn try_binary<T, R: Into<Value>>(
    stack: &mut Vec<Value>,
    pop: Pop<T>,
    f: impl FnOnce(T, T) -> Result<R, TrapKind>,
) -> Result<Value, TrapKind> {
    let b = pop(stack)?;
    let a = pop(stack)?;
    Ok(f(a, b)?.into())
}

/// Pops the operands of `op`, pushes its result.
pub(crate) fn eval(op: NumericOp, stack: &mut Vec<Value>) -> Result<(), TrapKind> {
    use NumericOp::*;

    let value = match op {
        I32Eqz => unary(stack, pop_i32, |a| a == 0)?,
        I32Eq => binary(stack, pop_i32, |a, b| a == b)?,
        I32Ne => binary(stack, pop_i32, |a, b| a != b)?,
        I32LtS => binary(stack, pop_i32, |a, b| a < b)?,
        I32LtU => binary(stack, pop_i32, |a, b| (a as u32) < (b as u32))?,
        I32GtS => binary(stack, pop_i32, |a, b| a > b)?,
        I32GtU => binary(stack, pop_i32, |a, b| (a as u32) > (b as u32))?,
        I32LeS => binary(stack, pop_i32, |a, b| a <= b)?,
        I32LeU => binary(stack, pop_i32, |a, b| (a as u32) <= (b as u32))?,
        I32GeS => binary(stack, pop_i32, |a, b| a >= b)?,
        I32GeU => binary(stack, pop_i32, |a, b| (a as u32) >= (b as u32))?,

        I64Eqz => unary(stack, pop_i64, |a| a == 0)?,
        I64Eq => binary(stack, pop_i64, |a, b| a == b)?,
        I64Ne => binary(stack, pop_i64, |a, b| a != b)?,
        I64LtS => binary(stack, pop_i64, |a, b| a < b)?,
        I64LtU => binary(stack, pop_i64, |a, b| (a as u64) < (b as u64))?,
        I64GtS => binary(stack, pop_i64, |a, b| a > b)?,
        I64GtU => binary(stack, pop_i64, |a, b| (a as u64) > (b as u64))?,
        I64LeS => binary(stack, pop_i64, |a, b| a <= b)?,
        I64LeU => binary(stack, pop_i64, |a, b| (a as u64) <= (b as u64))?,
        I64GeS => binary(stack, pop_i64, |a, b| a >= b)?,
        I64GeU => binary(stack, pop_i64, |a, b| (a as u64) >= (b as u64))?,

        F32Eq => binary(stack, pop_f32, |a, b| a == b)?,
        F32Ne => binary(stack, pop_f32, |a, b| a != b)?,
        F32Lt => binary(stack, pop_f32, |a, b| a < b)?,
        F32Gt => binary(stack, pop_f32, |a, b| a > b)?,
        F32Le => binary(stack, pop_f32, |a, b| a <= b)?,
        F32Ge => binary(stack, pop_f32, |a, b| a >= b)?,

        F64Eq => binary(stack, pop_f64, |a, b| a == b)?,
        F64Ne => binary(stack, pop_f64, |a, b| a != b)?,
        F64Lt => binary(stack, pop_f64, |a, b| a < b)?,
        F64Gt => binary(stack, pop_f64, |a, b| a > b)?,
        F64Le => binary(stack, pop_f64, |a, b| a <= b)?,
        F64Ge => binary(stack, pop_f64, |a, b| a >= b)?,

        I32Clz => unary(stack, pop_i32, |a| a.leading_zeros() as i32)?,
        I32Ctz => unary(stack, pop_i32, |a| a.trailing_zeros() as i32)?,
        I32Popcnt => unary(stack, pop_i32, |a| a.count_ones() as i32)?,
        I32Add => binary(stack, pop_i32, i32::wrapping_add)?,
        I32Sub => binary(stack, pop_i32, i32::wrapping_sub)?,
        I32Mul => binary(stack, pop_i32, i32::wrapping_mul)?,
        I32DivS => try_binary(stack, pop_i32, |a, b| {
            if b == 0 {
                return Err(TrapKind::DivideByZero);
            }
            a.checked_div(b).ok_or(TrapKind::IntegerOverflow)
        })?,
        I32DivU => try_binary(stack, pop_i32, |a, b| {
            (a as u32)
                .checked_div(b as u32)
                .map(|v| v as i32)
                .ok_or(TrapKind::DivideByZero)
        })?,
        I32RemS => try_binary(stack, pop_i32, |a, b| {
            if b == 0 {
                return Err(TrapKind::DivideByZero);
            }
            Ok(a.wrapping_rem(b))
        })?,
        I32RemU => try_binary(stack, pop_i32, |a, b| {
            (a as u32)
                .checked_rem(b as u32)
                .map(|v| v as i32)
                .ok_or(TrapKind::DivideByZero)
        })?,
        I32And => binary(stack, pop_i32, |a, b| a & b)?,
        I32Or => binary(stack, pop_i32, |a, b| a | b)?,
        I32Xor => binary(stack, pop_i32, |a, b| a ^ b)?,
        I32Shl => binary(stack, pop_i32, |a, b| a.wrapping_shl(b as u32))?,
        I32ShrS => binary(stack, pop_i32, |a, b| a.wrapping_shr(b as u32))?,
        I32ShrU => binary(stack, pop_i32, |a, b| (a as u32).wrapping_shr(b as u32) as i32)?,
        I32Rotl => binary(stack, pop_i32, |a, b| a.rotate_left(b as u32))?,
        I32Rotr => binary(stack, pop_i32, |a, b| a.rotate_right(b as u32))?,

        I64Clz => unary(stack, pop_i64, |a| i64::from(a.leading_zeros()))?,
        I64Ctz => unary(stack, pop_i64, |a| i64::from(a.trailing_zeros()))?,
        I64Popcnt => unary(stack, pop_i64, |a| i64::from(a.count_ones()))?,
        I64Add => binary(stack, pop_i64, i64::wrapping_add)?,
        I64Sub => binary(stack, pop_i64, i64::wrapping_sub)?,
        I64Mul => binary(stack, pop_i64, i64::wrapping_mul)?,
        I64DivS => try_binary(stack, pop_i64, |a, b| {
            if b == 0 {
                return Err(TrapKind::DivideByZero);
            }
            a.checked_div(b).ok_or(TrapKind::IntegerOverflow)
        })?,
        I64DivU => try_binary(stack, pop_i64, |a, b| {
            (a as u64)
                .checked_div(b as u64)
                .map(|v| v as i64)
                .ok_or(TrapKind::DivideByZero)
        })?,
        I64RemS => try_binary(stack, pop_i64, |a, b| {
            if b == 0 {
                return Err(TrapKind::DivideByZero);
            }
            Ok(a.wrapping_rem(b))
        })?,
        I64RemU => try_binary(stack, pop_i64, |a, b| {
            (a as u64)
                .checked_rem(b as u64)
                .map(|v| v as i64)
                .ok_or(TrapKind::DivideByZero)
        })?,
        I64And => binary(stack, pop_i64, |a, b| a & b)?,
        I64Or => binary(stack, pop_i64, |a, b| a | b)?,
        I64Xor => binary(stack, pop_i64, |a, b| a ^ b)?,
        I64Shl => binary(stack, pop_i64, |a, b| a.wrapping_shl(b as u32))?,
        I64ShrS => binary(stack, pop_i64, |a, b| a.wrapping_shr(b as u32))?,
        I64ShrU => binary(stack, pop_i64, |a, b| (a as u64).wrapping_shr(b as u32) as i64)?,
        I64Rotl => binary(stack, pop_i64, |a, b| a.rotate_left((b & 63) as u32))?,
        I64Rotr => binary(stack, pop_i64, |a, b| a.rotate_right((b & 63) as u32))?,

        F32Abs => unary(stack, pop_f32, f32::abs)?,
        F32Neg => unary(stack, pop_f32, |a| -a)?,
        F32Ceil => unary(stack, pop_f32, f32::ceil)?,
        F32Floor => unary(stack, pop_f32, f32::floor)?,
        F32Trunc => unary(stack, pop_f32, f32::trunc)?,
        F32Nearest => unary(stack, pop_f32, f32::round_ties_even)?,
        F32Sqrt => unary(stack, pop_f32, f32::sqrt)?,
        F32Add => binary(stack, pop_f32, |a, b| a + b)?,
        F32Sub => binary(stack, pop_f32, |a, b| a - b)?,
        F32Mul => binary(stack, pop_f32, |a, b| a * b)?,
        F32Div => binary(stack, pop_f32, |a, b| a / b)?,
        F32Min => binary(stack, pop_f32, wasm_min)?,
        F32Max => binary(stack, pop_f32, wasm_max)?,
        F32Copysign => binary(stack, pop_f32, f32::copysign)?,

        F64Abs => unary(stack, pop_f64, f64::abs)?,
        F64Neg => unary(stack, pop_f64, |a| -a)?,
        F64Ceil => unary(stack, pop_f64, f64::ceil)?,
        F64Floor => unary(stack, pop_f64, f64::floor)?,
        F64Trunc => unary(stack, pop_f64, f64::trunc)?,
        F64Nearest => unary(stack, pop_f64, f64::round_ties_even)?,
        F64Sqrt => unary(stack, pop_f64, f64::sqrt)?,
        F64Add => binary(stack, pop_f64, |a, b| a + b)?,
        F64Sub => binary(stack, pop_f64, |a, b| a - b)?,
        F64Mul => binary(stack, pop_f64, |a, b| a * b)?,
        F64Div => binary(stack, pop_f64, |a, b| a / b)?,
        F64Min => binary(stack, pop_f64, wasm_min)?,
        F64Max => binary(stack, pop_f64, wasm_max)?,
        F64Copysign => binary(stack, pop_f64, f64::copysign)?,

        I32WrapI64 => unary(stack, pop_i64, |a| a as i32)?,
        I32TruncF32S => try_unary(stack, pop_f32, |a| {
            checked_trunc(f64::from(a), I32_MIN_EXCLUSIVE, I32_MAX_EXCLUSIVE).map(|v| v as i32)
        })?,
        I32TruncF32U => try_unary(stack, pop_f32, |a| {
            checked_trunc(f64::from(a), -1.0, U32_MAX_EXCLUSIVE).map(|v| v as u32 as i32)
        })?,
        I32TruncF64S => try_unary(stack, pop_f64, |a| {
            checked_trunc(a, I32_MIN_EXCLUSIVE, I32_MAX_EXCLUSIVE).map(|v| v as i32)
        })?,
        I32TruncF64U => try_unary(stack, pop_f64, |a| {
            checked_trunc(a, -1.0, U32_MAX_EXCLUSIVE).map(|v| v as u32 as i32)
        })?,
        I64ExtendI32S => unary(stack, pop_i32, i64::from)?,
        I64ExtendI32U => unary(stack, pop_i32, |a| i64::from(a as u32))?,
        I64TruncF32S => try_unary(stack, pop_f32, |a| {
            checked_trunc(f64::from(a), I64_MIN_EXCLUSIVE, I64_MAX_EXCLUSIVE).map(|v| v as i64)
        })?,
        I64TruncF32U => try_unary(stack, pop_f32, |a| {
            checked_trunc(f64::from(a), -1.0, U64_MAX_EXCLUSIVE).map(|v| v as u64 as i64)
        })?,
        I64TruncF64S => try_unary(stack, pop_f64, |a| {
            checked_trunc(a, I64_MIN_EXCLUSIVE, I64_MAX_EXCLUSIVE).map(|v| v as i64)
        })?,
        I64TruncF64U => try_unary(stack, pop_f64, |a| {
            checked_trunc(a, -1.0, U64_MAX_EXCLUSIVE).map(|v| v as u64 as i64)
        })?,
        F32ConvertI32S => unary(stack, pop_i32, |a| a as f32)?,
        F32ConvertI32U => unary(stack, pop_i32, |a| a as u32 as f32)?,
        F32ConvertI64S => unary(stack, pop_i64, |a| a as f32)?,
        F32ConvertI64U => unary(stack, pop_i64, |a| a as u64 as f32)?,
        F32DemoteF64 => unary(stack, pop_f64, |a| a as f32)?,
        F64ConvertI32S => unary(stack, pop_i32, f64::from)?,
        F64ConvertI32U => unary(stack, pop_i32, |a| f64::from(a as u32))?,
        F64ConvertI64S => unary(stack, pop_i64, |a| a as f64)?,
        F64ConvertI64U => unary(stack, pop_i64, |a| a as u64 as f64)?,
        F64PromoteF32 => unary(stack, pop_f32, f64::from)?,
        I32ReinterpretF32 => unary(stack, pop_f32, |a| a.to_bits() as i32)?,
        I64ReinterpretF64 => unary(stack, pop_f64, |a| a.to_bits() as i64)?,
        F32ReinterpretI32 => unary(stack, pop_i32, |a| f32::from_bits(a as u32))?,
        F64ReinterpretI64 => unary(stack, pop_i64, |a| f64::from_bits(a as u64))?,

        I32Extend8S => unary(stack, pop_i32, |a| i32::from(a as i8))?,
        I32Extend16S => unary(stack, pop_i32, |a| i32::from(a as i16))?,
        I64Extend8S => unary(stack, pop_i64, |a| i64::from(a as i8))?,
        I64Extend16S => unary(stack, pop_i64, |a| i64::from(a as i16))?,
        I64Extend32S => unary(stack, pop_i64, |a| i64::from(a as i32))?,
    };

    stack.push(value);
    Ok(())
}

/// Saturating float-to-int conversions. `as` casts already saturate and map
/// NaN to zero.
pub(crate) fn trunc_sat(op: TruncSatOp, stack: &mut Vec<Value>) -> Result<(), TrapKind> {
    use TruncSatOp::*;

    let value = match op {
        I32TruncSatF32S => unary(stack, pop_f32, |a| a as i32)?,
        I32TruncSatF32U => unary(stack, pop_f32, |a| a as u32 as i32)?,
        I32TruncSatF64S => unary(stack, pop_f64, |a| a as i32)?,
        I32TruncSatF64U => unary(stack, pop_f64, |a| a as u32 as i32)?,
        I64TruncSatF32S => unary(stack, pop_f32, |a| a as i64)?,
        I64TruncSatF32U => unary(stack, pop_f32, |a| a as u64 as i64)?,
        I64TruncSatF64S => unary(stack, pop_f64, |a| a as i64)?,
        I64TruncSatF64U => unary(stack, pop_f64, |a| a as u64 as i64)?,
    };

    stack.push(value);
    Ok(())
}

const I32_MIN_EXCLUSIVE: f64 = -2_147_483_649.0;
const I32_MAX_EXCLUSIVE: f64 = 2_147_483_648.0;
const U32_MAX_EXCLUSIVE: f64 = 4_294_967_296.0;
// largest f64 below -2^63
const I64_MIN_EXCLUSIVE: f64 = -9_223_372_036_854_777_856.0;
const I64_MAX_EXCLUSIVE: f64 = 9_223_372_036_854_775_808.0;
const U64_MAX_EXCLUSIVE: f64 = 18_446_744_073_709_551_616.0;

/// Truncates toward zero, trapping when the result does not fit the open
/// interval `(lower, upper)`.
fn checked_trunc(value: f64, lower: f64, upper: f64) -> Result<f64, TrapKind> {
    if value.is_nan() {
        return Err(TrapKind::InvalidConversionToInteger);
    }
    if !(value > lower && value < upper) {
        return Err(TrapKind::IntegerOverflow);
    }
    Ok(value.trunc())
}

/// NaN if either operand is NaN; `-0` is smaller than `+0`.
fn wasm_min<F: Float>(a: F, b: F) -> F {
    if a.is_nan() || b.is_nan() {
        F::nan()
    } else if a == b {
        if a.is_sign_negative() { a } else { b }
    } else {
        a.min(b)
    }
}

fn wasm_max<F: Float>(a: F, b: F) -> F {
    if a.is_nan() || b.is_nan() {
        F::nan()
    } else if a == b {
        if a.is_sign_positive() { a } else { b }
    } else {
        a.max(b)
    }
}

#[cfg(test)]
mod tests {
    use super::{eval, trunc_sat};
    use crate::{
        binary::instruction::{NumericOp, TruncSatOp},
        error::TrapKind,
        execution::value::Value,
    };

    fn run(op: NumericOp, args: &[Value]) -> Result<Value, TrapKind> {
        let mut stack = args.to_vec();
        eval(op, &mut stack)?;
        assert_eq!(stack.len(), 1);
        Ok(stack[0])
    }

    #[test]
    fn integer_division() {
        let tests = vec![
            (NumericOp::I32DivS, -7, 2, Ok(Value::I32(-3))),
            (NumericOp::I32DivU, -1, 2, Ok(Value::I32(i32::MAX))),
            (NumericOp::I32RemS, -7, 2, Ok(Value::I32(-1))),
            (NumericOp::I32RemS, i32::MIN, -1, Ok(Value::I32(0))),
            (NumericOp::I32DivS, 1, 0, Err(TrapKind::DivideByZero)),
            (NumericOp::I32RemU, 1, 0, Err(TrapKind::DivideByZero)),
            (NumericOp::I32DivS, i32::MIN, -1, Err(TrapKind::IntegerOverflow)),
        ];
        for (op, a, b, want) in tests {
            assert_eq!(run(op, &[Value::I32(a), Value::I32(b)]), want, "{op:?}");
        }

        assert_eq!(
            run(NumericOp::I64DivS, &[Value::I64(i64::MIN), Value::I64(-1)]),
            Err(TrapKind::IntegerOverflow)
        );
    }

    #[test]
    fn shifts_and_rotates_mask_their_count() {
        assert_eq!(
            run(NumericOp::I32Shl, &[Value::I32(1), Value::I32(33)]),
            Ok(Value::I32(2))
        );
        assert_eq!(
            run(NumericOp::I32ShrU, &[Value::I32(-1), Value::I32(28)]),
            Ok(Value::I32(0xF))
        );
        assert_eq!(
            run(NumericOp::I32ShrS, &[Value::I32(-16), Value::I32(2)]),
            Ok(Value::I32(-4))
        );
        assert_eq!(
            run(NumericOp::I64Rotl, &[Value::I64(1), Value::I64(65)]),
            Ok(Value::I64(2))
        );
    }

    #[test]
    fn checked_truncation() {
        assert_eq!(
            run(NumericOp::I32TruncF64S, &[Value::F64(-2147483648.9)]),
            Ok(Value::I32(i32::MIN))
        );
        assert_eq!(
            run(NumericOp::I32TruncF64S, &[Value::F64(2147483648.0)]),
            Err(TrapKind::IntegerOverflow)
        );
        assert_eq!(
            run(NumericOp::I32TruncF32U, &[Value::F32(-0.5)]),
            Ok(Value::I32(0))
        );
        assert_eq!(
            run(NumericOp::I64TruncF64U, &[Value::F64(f64::NAN)]),
            Err(TrapKind::InvalidConversionToInteger)
        );
        assert_eq!(
            run(NumericOp::I64TruncF64S, &[Value::F64(-9223372036854775808.0)]),
            Ok(Value::I64(i64::MIN))
        );
    }

    #[test]
    fn saturating_truncation() {
        let tests = vec![
            (TruncSatOp::I32TruncSatF32S, Value::F32(f32::NAN), Value::I32(0)),
            (TruncSatOp::I32TruncSatF64S, Value::F64(1e10), Value::I32(i32::MAX)),
            (TruncSatOp::I32TruncSatF64U, Value::F64(-3.0), Value::I32(0)),
            (TruncSatOp::I64TruncSatF64U, Value::F64(1e30), Value::I64(-1)),
        ];
        for (op, arg, want) in tests {
            let mut stack = vec![arg];
            trunc_sat(op, &mut stack).expect("saturating truncation never traps");
            assert_eq!(stack, vec![want], "{op:?}");
        }
    }

    #[test]
    fn float_min_max_nearest() {
        let min = run(NumericOp::F32Min, &[Value::F32(0.0), Value::F32(-0.0)]);
        assert!(matches!(min, Ok(Value::F32(v)) if v == 0.0 && v.is_sign_negative()));

        let max = run(NumericOp::F64Max, &[Value::F64(f64::NAN), Value::F64(1.0)]);
        assert!(matches!(max, Ok(Value::F64(v)) if v.is_nan()));

        assert_eq!(
            run(NumericOp::F64Nearest, &[Value::F64(2.5)]),
            Ok(Value::F64(2.0))
        );
        assert_eq!(
            run(NumericOp::F32Nearest, &[Value::F32(-3.5)]),
            Ok(Value::F32(-4.0))
        );
    }

    #[test]
    fn sign_extension_and_reinterpret() {
        assert_eq!(
            run(NumericOp::I32Extend8S, &[Value::I32(0x80)]),
            Ok(Value::I32(-128))
        );
        assert_eq!(
            run(NumericOp::I64Extend32S, &[Value::I64(0xFFFF_FFFF)]),
            Ok(Value::I64(-1))
        );
        assert_eq!(
            run(NumericOp::I32ReinterpretF32, &[Value::F32(1.0)]),
            Ok(Value::I32(0x3F80_0000))
        );
    }

    #[test]
    fn operand_type_mismatch_is_malformed() {
        assert_eq!(
            run(NumericOp::I32Add, &[Value::I64(1), Value::I32(2)]),
            Err(TrapKind::Malformed("expected an i32 operand"))
        );
    }
}
