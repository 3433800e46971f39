//! Constant pool

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// A constant-pool entry. Strings become heap cells when the CodeBlock is
/// installed into an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    Undefined,
    Null,
    Boolean(bool),
    Int32(i32),
    Double(f64),
    String(Box<str>),
}

impl Constant {
    /// Create a string constant
    #[inline]
    pub fn string(s: impl Into<Box<str>>) -> Self {
        Self::String(s.into())
    }

    #[inline]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The code point of a one-character string constant
    pub fn single_char(&self) -> Option<char> {
        let s = self.as_string()?;
        let mut chars = s.chars();
        let c = chars.next()?;
        chars.next().is_none().then_some(c)
    }

    fn key(&self) -> ConstantKey {
        match self {
            Self::Undefined => ConstantKey::Undefined,
            Self::Null => ConstantKey::Null,
            Self::Boolean(b) => ConstantKey::Boolean(*b),
            Self::Int32(n) => ConstantKey::Int32(*n),
            Self::Double(d) => ConstantKey::Double(d.to_bits()),
            Self::String(s) => ConstantKey::String(s.clone()),
        }
    }
}

/// Hashable identity of a constant; doubles compare by bits so `-0.0` and
/// `0.0` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Undefined,
    Null,
    Boolean(bool),
    Int32(i32),
    Double(u64),
    String(Box<str>),
}

/// Constant pool with deduplication
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    constants: Vec<Constant>,
    index: FxHashMap<ConstantKey, u32>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constant, returning the index of an identical existing entry if
    /// there is one.
    pub fn add(&mut self, constant: Constant) -> u32 {
        let key = constant.key();
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.constants.len() as u32;
        self.constants.push(constant);
        self.index.insert(key, idx);
        idx
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.constants.iter()
    }

    pub fn into_vec(self) -> Vec<Constant> {
        self.constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates_by_identity() {
        let mut pool = ConstantPool::new();
        let a = pool.add(Constant::Int32(1));
        let b = pool.add(Constant::Double(0.0));
        let c = pool.add(Constant::Double(-0.0));
        let d = pool.add(Constant::Int32(1));
        let e = pool.add(Constant::string("x"));
        let f = pool.add(Constant::string("x"));
        assert_eq!(a, d);
        assert_ne!(b, c);
        assert_eq!(e, f);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn single_char_detection() {
        assert_eq!(Constant::string("a").single_char(), Some('a'));
        assert_eq!(Constant::string("ab").single_char(), None);
        assert_eq!(Constant::string("").single_char(), None);
        assert_eq!(Constant::Int32(97).single_char(), None);
    }
}
