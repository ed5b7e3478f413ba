//! Constant folding
//!
//! An operation whose operands are all constant loads is evaluated at
//! record or optimize time. Folding never touches guards or terminators and
//! gives up whenever the result would not be an immediate (bignum
//! promotion, division by zero, out-of-range float conversion), leaving the
//! instruction for the backend to handle at run time.

use super::function::Function;
use super::ir::{BitOp, Constant, InstId, InstKind};
use crate::runtime::numeric;
use crate::runtime::value::Value;

fn fixnum(func: &Function, id: InstId) -> Option<i64> {
    func.get(id)?.kind.as_const()?.as_fixnum()
}

fn float(func: &Function, id: InstId) -> Option<f64> {
    func.get(id)?.kind.as_const()?.as_float()
}

fn immediate(value: Value) -> Option<Constant> {
    match value {
        Value::Fixnum(n) => Some(Constant::Fixnum(n)),
        _ => None,
    }
}

/// Constant result of `kind`, if its operands are all constants
pub fn fold(func: &Function, kind: &InstKind) -> Option<Constant> {
    match *kind {
        InstKind::FixnumArith { op, lhs, rhs, .. } => {
            immediate(numeric::fixnum_arith(op, fixnum(func, lhs)?, fixnum(func, rhs)?)?)
        }
        InstKind::FixnumCmp { op, lhs, rhs } => {
            Some(Constant::Boolean(op.eval(fixnum(func, lhs)?, fixnum(func, rhs)?)))
        }
        InstKind::FixnumBit { op, lhs, rhs } => {
            let (a, b) = (fixnum(func, lhs)?, fixnum(func, rhs)?);
            match op {
                BitOp::And => Some(Constant::Fixnum(a & b)),
                BitOp::Or => Some(Constant::Fixnum(a | b)),
                BitOp::Xor => Some(Constant::Fixnum(a ^ b)),
                BitOp::Lshift => immediate(numeric::fixnum_lshift(a, b)),
                BitOp::Rshift => immediate(numeric::fixnum_rshift(a, b)),
            }
        }
        InstKind::FixnumComplement(v) => Some(Constant::Fixnum(!fixnum(func, v)?)),
        InstKind::FixnumToFloat(v) => Some(Constant::Float(fixnum(func, v)? as f64)),
        InstKind::FloatArith { op, lhs, rhs } => Some(Constant::Float(numeric::float_arith(
            op,
            float(func, lhs)?,
            float(func, rhs)?,
        ))),
        InstKind::FloatCmp { op, lhs, rhs } => {
            Some(Constant::Boolean(op.eval(float(func, lhs)?, float(func, rhs)?)))
        }
        InstKind::FloatToFixnum(v) => immediate(numeric::float_to_int(float(func, v)?).ok()?),
        _ => None,
    }
}
