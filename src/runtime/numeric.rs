//! Numeric semantics shared by the interpreter, the constant folder and the
//! trace backend
//!
//! Integer division and modulo round toward negative infinity; fixnum
//! results that leave the 62-bit range are promoted to bignums.

use super::value::Value;
use crate::error::{Error, Result};
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive, Zero};

/// Arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn eval<T: PartialOrd>(self, a: T, b: T) -> bool {
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

/// Floor division; `None` on division by zero
#[inline]
pub fn floor_div(a: i64, b: i64) -> Option<i128> {
    if b == 0 {
        return None;
    }
    let (a, b) = (a as i128, b as i128);
    let q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// Modulo with the sign of the divisor; `None` on division by zero
#[inline]
pub fn floor_mod(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        return None;
    }
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

/// Fixnum arithmetic; `None` on division by zero
pub fn fixnum_arith(op: ArithOp, a: i64, b: i64) -> Option<Value> {
    let (wa, wb) = (a as i128, b as i128);
    let result = match op {
        ArithOp::Add => wa + wb,
        ArithOp::Sub => wa - wb,
        ArithOp::Mul => wa * wb,
        ArithOp::Div => floor_div(a, b)?,
        ArithOp::Mod => floor_mod(a, b)? as i128,
    };
    Some(Value::int(result))
}

/// Float arithmetic (IEEE, modulo follows the divisor's sign)
pub fn float_arith(op: ArithOp, x: f64, y: f64) -> f64 {
    match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Mod => {
            let m = x % y;
            if m != 0.0 && (m < 0.0) != (y < 0.0) {
                m + y
            } else {
                m
            }
        }
    }
}

fn to_bigint(v: &Value) -> Option<BigInt> {
    match v {
        Value::Fixnum(n) => Some(BigInt::from(*n)),
        Value::Bignum(b) => Some((**b).clone()),
        _ => None,
    }
}

/// Float view of any numeric value
pub fn to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Fixnum(n) => Some(*n as f64),
        Value::Bignum(b) => b.to_f64(),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

fn bigint_arith(op: ArithOp, a: BigInt, b: BigInt) -> Result<Value> {
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div | ArithOp::Mod => {
            if b.is_zero() {
                return Err(Error::zero_division());
            }
            let q = &a / &b;
            let r = &a - &q * &b;
            let adjust = !r.is_zero() && ((r < BigInt::zero()) != (b < BigInt::zero()));
            if op == ArithOp::Div {
                if adjust {
                    q - 1
                } else {
                    q
                }
            } else if adjust {
                r + b
            } else {
                r
            }
        }
    };
    Ok(Value::bigint(result))
}

/// Arithmetic on any pair of numbers (integers promote to floats when mixed)
pub fn arith(op: ArithOp, a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Fixnum(x), Value::Fixnum(y)) => {
            fixnum_arith(op, *x, *y).ok_or_else(Error::zero_division)
        }
        (Value::Float(_), _) | (_, Value::Float(_)) => {
            match (to_f64(a), to_f64(b)) {
                (Some(x), Some(y)) => Ok(Value::Float(float_arith(op, x, y))),
                _ => Err(coerce_error(a, b)),
            }
        }
        _ => match (to_bigint(a), to_bigint(b)) {
            (Some(x), Some(y)) => bigint_arith(op, x, y),
            _ => Err(coerce_error(a, b)),
        },
    }
}

/// Comparison on any pair of numbers
pub fn compare(op: CmpOp, a: &Value, b: &Value) -> Result<bool> {
    match (a, b) {
        (Value::Fixnum(x), Value::Fixnum(y)) => Ok(op.eval(x, y)),
        (Value::Float(_), _) | (_, Value::Float(_)) => match (to_f64(a), to_f64(b)) {
            (Some(x), Some(y)) => Ok(op.eval(x, y)),
            _ if matches!(op, CmpOp::Eq) => Ok(false),
            _ if matches!(op, CmpOp::Ne) => Ok(true),
            _ => Err(compare_error(a, b)),
        },
        _ => match (to_bigint(a), to_bigint(b)) {
            (Some(x), Some(y)) => Ok(op.eval(x, y)),
            _ if matches!(op, CmpOp::Eq) => Ok(false),
            _ if matches!(op, CmpOp::Ne) => Ok(true),
            _ => Err(compare_error(a, b)),
        },
    }
}

fn coerce_error(a: &Value, b: &Value) -> Error {
    Error::type_error(format!(
        "{} can't be coerced into {}",
        b.type_name(),
        a.type_name()
    ))
}

fn compare_error(a: &Value, b: &Value) -> Error {
    Error::argument_error(format!(
        "comparison of {} with {} failed",
        a.type_name(),
        b.type_name()
    ))
}

/// `a << b` for fixnums (negative shifts go right)
pub fn fixnum_lshift(a: i64, b: i64) -> Value {
    if b < 0 {
        return fixnum_rshift(a, -b);
    }
    if b < 64 {
        let wide = (a as i128) << b;
        if (wide >> b) == a as i128 {
            return Value::int(wide);
        }
    }
    let shift = b.min(1 << 20) as usize;
    Value::bigint(BigInt::from(a) << shift)
}

/// `a >> b` for fixnums (arithmetic shift)
pub fn fixnum_rshift(a: i64, b: i64) -> Value {
    if b < 0 {
        return fixnum_lshift(a, -b);
    }
    Value::Fixnum(if b >= 63 { if a < 0 { -1 } else { 0 } } else { a >> b })
}

/// Float truncated toward zero
pub fn float_to_int(x: f64) -> Result<Value> {
    if !x.is_finite() {
        return Err(Error::runtime(
            crate::error::RuntimeErrorKind::RangeError,
            format!("{} out of integer range", float_to_s(x)),
        ));
    }
    let t = x.trunc();
    if t.abs() < 9.0e18 {
        Ok(Value::int(t as i128))
    } else {
        Ok(Value::bigint(BigInt::from_f64(t).unwrap_or_default()))
    }
}

/// Ruby's `Float#to_s`
pub fn float_to_s(x: f64) -> String {
    if x.is_nan() {
        return "NaN".into();
    }
    if x.is_infinite() {
        return if x > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    let abs = x.abs();
    if abs == 0.0 || (1e-4..1e16).contains(&abs) {
        let s = format!("{}", x);
        if s.contains('.') {
            s
        } else {
            format!("{}.0", s)
        }
    } else {
        let s = format!("{:e}", x);
        let (mantissa, exp) = s.split_once('e').unwrap_or((&s, "0"));
        let mantissa = if mantissa.contains('.') {
            mantissa.to_string()
        } else {
            format!("{}.0", mantissa)
        };
        let exp: i32 = exp.parse().unwrap_or(0);
        format!("{}e{}{:02}", mantissa, if exp < 0 { '-' } else { '+' }, exp.abs())
    }
}

/// Ruby's `String#to_i`: leading integer prefix, 0 when there is none
pub fn str_to_i(s: &str) -> Value {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let clean: String = digits
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '_')
        .filter(|c| *c != '_')
        .collect();
    if clean.is_empty() {
        return Value::Fixnum(0);
    }
    let n = clean.parse::<BigInt>().unwrap_or_default();
    Value::bigint(if negative { -n } else { n })
}

/// Ruby's `String#to_f`: leading float prefix, 0.0 when there is none
pub fn str_to_f(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let bytes = s.as_bytes();
    while end < bytes.len() {
        let c = bytes[end];
        match c {
            b'0'..=b'9' => seen_digit = true,
            b'+' | b'-' if end == 0 || matches!(bytes[end - 1], b'e' | b'E') => {}
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }
    let mut candidate = &s[..end];
    while !candidate.is_empty() {
        if let Ok(x) = candidate.parse::<f64>() {
            return x;
        }
        candidate = &candidate[..candidate.len() - 1];
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::FIXNUM_MAX;

    #[test]
    fn test_floor_division() {
        assert_eq!(floor_div(7, 2), Some(3));
        assert_eq!(floor_div(-7, 2), Some(-4));
        assert_eq!(floor_div(7, -2), Some(-4));
        assert_eq!(floor_div(1, 0), None);
        assert_eq!(floor_mod(-7, 2), Some(1));
        assert_eq!(floor_mod(7, -2), Some(-1));
        assert_eq!(floor_mod(6, 3), Some(0));
    }

    #[test]
    fn test_fixnum_overflow_promotes() {
        let v = fixnum_arith(ArithOp::Add, FIXNUM_MAX, 1).unwrap();
        assert!(matches!(v, Value::Bignum(_)));
        let back = arith(ArithOp::Sub, &v, &Value::Fixnum(1)).unwrap();
        assert_eq!(back.as_fixnum(), Some(FIXNUM_MAX));
    }

    #[test]
    fn test_mixed_arith() {
        let v = arith(ArithOp::Add, &Value::Fixnum(1), &Value::Float(0.5)).unwrap();
        assert_eq!(v.as_float(), Some(1.5));
        assert!(arith(ArithOp::Div, &Value::Fixnum(1), &Value::Fixnum(0)).is_err());
        assert_eq!(
            arith(ArithOp::Div, &Value::Fixnum(1), &Value::Float(0.0)).unwrap().as_float(),
            Some(f64::INFINITY)
        );
        assert!(arith(ArithOp::Add, &Value::Fixnum(1), &Value::string("x")).is_err());
    }

    #[test]
    fn test_float_mod_sign() {
        assert_eq!(float_arith(ArithOp::Mod, -7.5, 2.0), 0.5);
        assert_eq!(float_arith(ArithOp::Mod, 7.5, -2.0), -0.5);
    }

    #[test]
    fn test_compare() {
        assert!(compare(CmpOp::Lt, &Value::Fixnum(1), &Value::Float(1.5)).unwrap());
        assert!(!compare(CmpOp::Eq, &Value::Fixnum(1), &Value::string("1")).unwrap());
        assert!(compare(CmpOp::Lt, &Value::Fixnum(1), &Value::Nil).is_err());
    }

    #[test]
    fn test_shifts() {
        assert_eq!(fixnum_lshift(1, 3).as_fixnum(), Some(8));
        assert!(matches!(fixnum_lshift(1, 70), Value::Bignum(_)));
        assert_eq!(fixnum_rshift(-8, 1).as_fixnum(), Some(-4));
        assert_eq!(fixnum_rshift(-8, 100).as_fixnum(), Some(-1));
    }

    #[test]
    fn test_float_to_s() {
        assert_eq!(float_to_s(1.0), "1.0");
        assert_eq!(float_to_s(2.5), "2.5");
        assert_eq!(float_to_s(1e20), "1.0e+20");
        assert_eq!(float_to_s(1.5e-7), "1.5e-07");
        assert_eq!(float_to_s(f64::INFINITY), "Infinity");
    }

    #[test]
    fn test_string_conversions() {
        assert_eq!(str_to_i("  42abc").as_fixnum(), Some(42));
        assert_eq!(str_to_i("-1_000").as_fixnum(), Some(-1000));
        assert_eq!(str_to_i("abc").as_fixnum(), Some(0));
        assert_eq!(str_to_f("3.25xyz"), 3.25);
        assert_eq!(str_to_f("1e3"), 1000.0);
        assert_eq!(str_to_f("x"), 0.0);
    }
}
