use crate::heap::ObjRef;

/// A runtime value. Numbers and booleans live directly on the stack;
/// everything else is a handle into the [`Heap`](crate::heap::Heap).
///
/// Equality derives field-wise: numbers compare by value, object handles by
/// identity. Interned strings make identity comparison correct for strings;
/// list deep-equality needs the heap and lives in the VM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// The `none` literal, also the natives' failure sentinel.
    None,
    /// `true` or `false`.
    Bool(bool),
    /// All numbers are 64-bit floats.
    Number(f64),
    /// A handle to a heap object.
    Obj(ObjRef),
}

impl Value {
    /// `none` and `false` are falsey, every other value is truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::None | Value::Bool(false))
    }

    /// Returns the number if this value is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the object handle if this value is one.
    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::Obj(r)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn falseyness() {
        assert!(Value::None.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
    }
}
