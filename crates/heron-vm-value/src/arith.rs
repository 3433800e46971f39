//! Reference numeric semantics.
//!
//! The interpreter, the runtime stubs and the JIT fast paths must all agree
//! with these functions bit for bit. Int32 results are produced only when both
//! operands are Int32 and the exact result is an int32 other than negative
//! zero; everything else is a Double and integral doubles are never re-tagged.

use crate::value::Value;

/// A value already converted with ToNumber
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i32),
    Double(f64),
}

impl Number {
    #[inline]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(n) => f64::from(n),
            Self::Double(d) => d,
        }
    }

    /// Int32 when the double is integral and in range, except negative zero
    pub fn from_f64_exact(d: f64) -> Self {
        if d.fract() == 0.0
            && d >= f64::from(i32::MIN)
            && d <= f64::from(i32::MAX)
            && !(d == 0.0 && d.is_sign_negative())
        {
            Self::Int(d as i32)
        } else {
            Self::Double(d)
        }
    }
}

impl From<Number> for Value {
    #[inline]
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => Value::Int32(i),
            Number::Double(d) => Value::Double(d),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn apply(self, lhs: Number, rhs: Number) -> Number {
        match (lhs, rhs) {
            (Number::Int(l), Number::Int(r)) => int_op(self, l, r),
            _ => Number::Double(double_op(self, lhs.as_f64(), rhs.as_f64())),
        }
    }
}

/// The double path shared by every operand combination that is not int/int.
#[inline]
pub fn double_op(op: ArithOp, l: f64, r: f64) -> f64 {
    match op {
        ArithOp::Add => l + r,
        ArithOp::Sub => l - r,
        ArithOp::Mul => l * r,
        ArithOp::Div => l / r,
        ArithOp::Mod => l % r,
    }
}

fn int_op(op: ArithOp, l: i32, r: i32) -> Number {
    let fallback = || Number::Double(double_op(op, f64::from(l), f64::from(r)));
    match op {
        ArithOp::Add => l.checked_add(r).map_or_else(fallback, Number::Int),
        ArithOp::Sub => l.checked_sub(r).map_or_else(fallback, Number::Int),
        ArithOp::Mul => match l.checked_mul(r) {
            Some(0) if l < 0 || r < 0 => Number::Double(-0.0),
            Some(n) => Number::Int(n),
            None => fallback(),
        },
        ArithOp::Div => {
            if r == 0 || (l == i32::MIN && r == -1) || (l == 0 && r < 0) || l % r != 0 {
                fallback()
            } else {
                Number::Int(l / r)
            }
        }
        ArithOp::Mod => {
            if r == 0 || (l == i32::MIN && r == -1) {
                fallback()
            } else {
                match l % r {
                    0 if l < 0 => Number::Double(-0.0),
                    n => Number::Int(n),
                }
            }
        }
    }
}

/// Unary minus
pub fn negate(n: Number) -> Number {
    match n {
        Number::Int(0) => Number::Double(-0.0),
        Number::Int(i) => i.checked_neg().map_or(Number::Double(-f64::from(i)), Number::Int),
        Number::Double(d) => Number::Double(-d),
    }
}

/// `++` / `--` share the add path
#[inline]
pub fn increment(n: Number, delta: i32) -> Number {
    ArithOp::Add.apply(n, Number::Int(delta))
}

/// ECMAScript ToInt32
pub fn to_int32(d: f64) -> i32 {
    if !d.is_finite() {
        return 0;
    }
    let truncated = d.trunc();
    if truncated >= f64::from(i32::MIN) && truncated <= f64::from(i32::MAX) {
        return truncated as i32;
    }
    let modulo = truncated.rem_euclid(4_294_967_296.0);
    modulo as u32 as i32
}

#[inline]
pub fn to_uint32(d: f64) -> u32 {
    to_int32(d) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
}

impl BitOp {
    pub fn apply(self, l: i32, r: i32) -> Number {
        let shift = (r as u32) & 31;
        match self {
            Self::And => Number::Int(l & r),
            Self::Or => Number::Int(l | r),
            Self::Xor => Number::Int(l ^ r),
            Self::Shl => Number::Int(l.wrapping_shl(shift)),
            Self::Shr => Number::Int(l >> shift),
            Self::UShr => {
                let result = (l as u32) >> shift;
                match i32::try_from(result) {
                    Ok(n) => Number::Int(n),
                    Err(_) => Number::Double(f64::from(result)),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelOp {
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

impl RelOp {
    /// Numeric comparison; any NaN operand makes every relation false.
    pub fn compare(self, lhs: Number, rhs: Number) -> bool {
        if let (Number::Int(l), Number::Int(r)) = (lhs, rhs) {
            return self.compare_ord(l.cmp(&r));
        }
        let (l, r) = (lhs.as_f64(), rhs.as_f64());
        match self {
            Self::Less => l < r,
            Self::LessEq => l <= r,
            Self::Greater => l > r,
            Self::GreaterEq => l >= r,
        }
    }

    /// Relation applied to an already computed ordering (strings, code points)
    pub fn compare_ord(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Self::Less => ord == Less,
            Self::LessEq => ord != Greater,
            Self::Greater => ord == Greater,
            Self::GreaterEq => ord != Less,
        }
    }
}

/// Numeric equality: NaN is unequal to itself and the zeros are equal.
pub fn numbers_equal(lhs: Number, rhs: Number) -> bool {
    match (lhs, rhs) {
        (Number::Int(l), Number::Int(r)) => l == r,
        _ => lhs.as_f64() == rhs.as_f64(),
    }
}

/// ECMAScript string to number conversion, restricted to decimal and hex
/// literals plus `Infinity`.
pub fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).map_or(f64::NAN, |n| n as f64);
    }
    match trimmed {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if trimmed.contains(|c: char| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => {
            f64::NAN
        }
        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(n: i32) -> Number {
        Number::Int(n)
    }

    #[test]
    fn int_add_stays_int_until_overflow() {
        assert_eq!(ArithOp::Add.apply(int(1), int(2)), int(3));
        assert_eq!(
            ArithOp::Add.apply(int(i32::MAX), int(1)),
            Number::Double(2147483648.0)
        );
    }

    #[test]
    fn division_detects_negative_zero_and_inexact_results() {
        assert_eq!(ArithOp::Div.apply(int(6), int(3)), int(2));
        assert_eq!(ArithOp::Div.apply(int(7), int(2)), Number::Double(3.5));
        let neg_zero = ArithOp::Div.apply(int(0), int(-5));
        assert!(matches!(neg_zero, Number::Double(d) if d == 0.0 && d.is_sign_negative()));
        assert_eq!(
            ArithOp::Div.apply(int(i32::MIN), int(-1)),
            Number::Double(2147483648.0)
        );
        assert!(matches!(ArithOp::Div.apply(int(1), int(0)), Number::Double(d) if d == f64::INFINITY));
    }

    #[test]
    fn mul_and_mod_produce_negative_zero() {
        let product = ArithOp::Mul.apply(int(-4), int(0));
        assert!(matches!(product, Number::Double(d) if d.is_sign_negative() && d == 0.0));
        let remainder = ArithOp::Mod.apply(int(-4), int(2));
        assert!(matches!(remainder, Number::Double(d) if d.is_sign_negative() && d == 0.0));
        assert_eq!(ArithOp::Mod.apply(int(-5), int(3)), int(-2));
    }

    #[test]
    fn doubles_are_never_retagged() {
        assert_eq!(
            ArithOp::Add.apply(Number::Double(1.5), Number::Double(1.5)),
            Number::Double(3.0)
        );
        assert_eq!(ArithOp::Sub.apply(int(3), Number::Double(1.0)), Number::Double(2.0));
    }

    #[test]
    fn negate_edges() {
        assert!(matches!(negate(int(0)), Number::Double(d) if d.is_sign_negative()));
        assert_eq!(negate(int(i32::MIN)), Number::Double(2147483648.0));
        assert_eq!(negate(int(5)), int(-5));
    }

    #[test]
    fn to_int32_wraps_modulo_two_pow_32() {
        assert_eq!(to_int32(4294967296.0 + 5.0), 5);
        assert_eq!(to_int32(2147483648.0), i32::MIN);
        assert_eq!(to_int32(-1.9), -1);
        assert_eq!(to_int32(f64::NAN), 0);
    }

    #[test]
    fn unsigned_shift_can_leave_int32_range() {
        assert_eq!(BitOp::UShr.apply(-1, 0), Number::Double(4294967295.0));
        assert_eq!(BitOp::UShr.apply(-1, 1), int(i32::MAX));
        assert_eq!(BitOp::Shl.apply(1, 33), int(2));
    }

    #[test]
    fn relations_with_nan_are_false() {
        let nan = Number::Double(f64::NAN);
        for op in [RelOp::Less, RelOp::LessEq, RelOp::Greater, RelOp::GreaterEq] {
            assert!(!op.compare(nan, int(1)));
        }
        assert!(RelOp::LessEq.compare(int(2), Number::Double(2.0)));
    }

    #[test]
    fn parse_number_handles_common_literals() {
        assert_eq!(parse_number(" 42 "), 42.0);
        assert_eq!(parse_number("0x10"), 16.0);
        assert_eq!(parse_number(""), 0.0);
        assert!(parse_number("abc").is_nan());
        assert_eq!(parse_number("1e3"), 1000.0);
    }
}
