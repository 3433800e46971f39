//! Operator semantics that need the heap: coercions, equality, ordering and
//! string conversion.

use heron_vm_value::arith::{numbers_equal, parse_number};
use heron_vm_value::{Number, RelOp, Value};

use crate::engine::Engine;
use crate::error::VmResult;
use crate::heap::CellBody;

/// ECMAScript Number::toString for finite and non-finite doubles
pub fn number_to_string(d: f64) -> String {
    if d.is_nan() {
        return "NaN".to_string();
    }
    if d.is_infinite() {
        return if d > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if d == 0.0 {
        return "0".to_string();
    }
    if d.abs() >= 1e21 {
        let text = format!("{d:e}");
        return match text.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
            _ => text,
        };
    }
    format!("{d}")
}

impl Engine {
    /// ToNumeric. Numbers keep their representation; anything converted
    /// from another type is a double.
    pub(crate) fn to_numeric(&self, word: u64) -> Number {
        match self.decode(word) {
            Value::Int32(n) => Number::Int(n),
            Value::Double(d) => Number::Double(d),
            Value::Cell(id) => match self.heap.get(id).body() {
                CellBody::String(s) => Number::Double(parse_number(s)),
                _ => Number::Double(f64::NAN),
            },
            other => Number::Double(other.to_number_primitive().unwrap_or(f64::NAN)),
        }
    }

    pub(crate) fn to_boolean(&self, word: u64) -> bool {
        let value = self.decode(word);
        match value {
            Value::Cell(id) => match self.heap.get(id).body() {
                CellBody::String(s) => !s.is_empty(),
                _ => true,
            },
            other => other.truthy_primitive().unwrap_or(false),
        }
    }

    pub(crate) fn is_string(&self, word: u64) -> bool {
        self.encoding
            .as_cell(word)
            .is_some_and(|id| matches!(self.heap.get(id).body(), CellBody::String(_)))
    }

    fn string_of(&self, value: Value) -> Option<&str> {
        self.heap.get(value.as_cell()?).as_str()
    }

    /// ToString rendering of a value
    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Int32(n) => n.to_string(),
            Value::Double(d) => number_to_string(d),
            Value::Cell(id) => match self.heap.get(id).body() {
                CellBody::String(s) => s.to_string(),
                CellBody::Function { code_block } => {
                    let name = self
                        .code_blocks
                        .get(*code_block as usize)
                        .map_or("anonymous", |code| code.name());
                    format!("function {name}")
                }
                CellBody::HostFunction { index } => {
                    let name = self
                        .host_functions
                        .get(*index as usize)
                        .map_or("anonymous", |h| h.name.as_str());
                    format!("function {name}")
                }
                CellBody::Arguments { .. } => "[object Arguments]".to_string(),
                CellBody::Scope { .. } => "[object Scope]".to_string(),
                CellBody::Object => match self.error_fields(id) {
                    Some((name, message)) => format!("{name}: {message}"),
                    None => "[object Object]".to_string(),
                },
            },
        }
    }

    /// `name` and `message` of an object that carries both as strings
    fn error_fields(&self, id: heron_vm_value::CellId) -> Option<(&str, &str)> {
        let structure = self.heap.get(id).structure()?;
        let name = self.structures.lookup(structure, self.name_atom)?;
        let message = self.structures.lookup(structure, self.message_atom)?;
        let name = self.string_of(self.decode(self.heap.slot(id, name)))?;
        let message = self.string_of(self.decode(self.heap.slot(id, message)))?;
        Some((name, message))
    }

    /// `===`
    pub(crate) fn strict_equals(&self, lhs: u64, rhs: u64) -> bool {
        let (l, r) = (self.decode(lhs), self.decode(rhs));
        match (l, r) {
            (Value::Int32(_) | Value::Double(_), Value::Int32(_) | Value::Double(_)) => {
                numbers_equal(self.to_numeric(lhs), self.to_numeric(rhs))
            }
            (Value::Cell(a), Value::Cell(b)) => {
                a == b
                    || matches!(
                        (self.string_of(l), self.string_of(r)),
                        (Some(x), Some(y)) if x == y
                    )
            }
            _ => l == r,
        }
    }

    /// `==`. Objects compare by identity and are never equal to a primitive.
    pub(crate) fn loose_equals(&self, lhs: u64, rhs: u64) -> bool {
        let (l, r) = (self.decode(lhs), self.decode(rhs));
        if l.is_nullish() || r.is_nullish() {
            return l.is_nullish() && r.is_nullish();
        }
        let l_object = l.as_cell().is_some() && self.string_of(l).is_none();
        let r_object = r.as_cell().is_some() && self.string_of(r).is_none();
        match (l_object, r_object) {
            (true, true) => l == r,
            (true, false) | (false, true) => false,
            (false, false) => {
                if let (Some(a), Some(b)) = (self.string_of(l), self.string_of(r)) {
                    a == b
                } else {
                    numbers_equal(self.to_numeric(lhs), self.to_numeric(rhs))
                }
            }
        }
    }

    /// `<`, `<=`, `>`, `>=`: strings compare by code point, everything else
    /// numerically
    pub(crate) fn relational(&self, op: RelOp, lhs: u64, rhs: u64) -> bool {
        let (l, r) = (self.decode(lhs), self.decode(rhs));
        if let (Some(a), Some(b)) = (self.string_of(l), self.string_of(r)) {
            return op.compare_ord(a.cmp(b));
        }
        op.compare(self.to_numeric(lhs), self.to_numeric(rhs))
    }

    /// String concatenation for `+` with a string operand
    pub(crate) fn concat(&mut self, lhs: u64, rhs: u64) -> VmResult<u64> {
        let mut text = self.display(self.decode(lhs));
        text.push_str(&self.display(self.decode(rhs)));
        let id = self.heap.alloc_string(&text)?;
        Ok(self.encoding.cell(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(2.0), "2");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(-1.25), "-1.25");
        assert_eq!(number_to_string(1e21), "1e+21");
    }
}
