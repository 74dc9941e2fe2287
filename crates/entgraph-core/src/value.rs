//! Dynamic SQL values and identity keys.

use std::fmt;
use std::hash::{Hash, Hasher};

/// A dynamically-typed SQL value.
///
/// Entity fields, statement parameters and result columns all travel as
/// `Value`s; the metadata registry decides which column a value belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::TinyInt(v) => Some(*v != 0),
            Value::SmallInt(v) => Some(*v != 0),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Compare two values as identity components.
    ///
    /// Integers compare by numeric value regardless of width, so a key read
    /// back as `BIGINT` matches the `INTEGER` a caller assigned. NULL never
    /// equals anything, including NULL.
    pub fn key_eq(&self, other: &Value) -> bool {
        if self.is_null() || other.is_null() {
            return false;
        }
        match (self.integer_key(), other.integer_key()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => match (self, other) {
                (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
                (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
                _ => self == other,
            },
            _ => false,
        }
    }

    fn integer_key(&self) -> Option<i64> {
        match self {
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
                self.as_i64()
            }
            _ => None,
        }
    }

    fn hash_key<H: Hasher>(&self, hasher: &mut H) {
        if let Some(i) = self.integer_key() {
            1u8.hash(hasher);
            i.hash(hasher);
            return;
        }
        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                2u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Float(f) => {
                3u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Double(f) => {
                4u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                5u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                6u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                7u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Date(d) => {
                8u8.hash(hasher);
                d.hash(hasher);
            }
            Value::Timestamp(ts) => {
                9u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                10u8.hash(hasher);
                u.hash(hasher);
            }
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {}
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::TinyInt(v) => write!(f, "{v}"),
            Value::SmallInt(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) | Value::Text(v) => write!(f, "'{v}'"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Date(d) => write!(f, "date({d})"),
            Value::Timestamp(ts) => write!(f, "timestamp({ts})"),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

// Conversion implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

/// A hashable identity built from one or more column values.
///
/// Equality and hashing follow [`Value::key_eq`], so keys can be used to
/// match generated `BIGINT` keys against client-assigned integers of any
/// width.
#[derive(Debug, Clone)]
pub struct ValueKey(Vec<Value>);

impl ValueKey {
    /// Build a key from identity column values, in declaration order.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Build a key from a single identity value.
    pub fn single(value: Value) -> Self {
        Self(vec![value])
    }

    /// The component values of this key.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// True if any component is NULL (the key cannot identify a row).
    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.key_eq(b) || (a.is_null() && b.is_null()))
    }
}

impl Eq for ValueKey {}

impl Hash for ValueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for v in &self.0 {
            v.hash_key(state);
        }
    }
}

impl fmt::Display for ValueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                write!(f, "(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn integer_widths_share_identity() {
        assert!(Value::Int(7).key_eq(&Value::BigInt(7)));
        assert!(Value::SmallInt(7).key_eq(&Value::TinyInt(7)));
        assert!(!Value::Int(7).key_eq(&Value::Text("7".into())));

        let mut keys = HashSet::new();
        keys.insert(ValueKey::single(Value::Int(7)));
        assert!(keys.contains(&ValueKey::single(Value::BigInt(7))));
        assert!(!keys.contains(&ValueKey::single(Value::BigInt(8))));
    }

    #[test]
    fn null_is_not_an_identity() {
        assert!(!Value::Null.key_eq(&Value::Null));
        assert!(ValueKey::new(vec![Value::Int(1), Value::Null]).has_null());
        assert!(!ValueKey::single(Value::Int(1)).has_null());
    }

    #[test]
    fn composite_keys_compare_componentwise() {
        let a = ValueKey::new(vec![Value::BigInt(1), Value::Text("x".into())]);
        let b = ValueKey::new(vec![Value::Int(1), Value::Text("x".into())]);
        let c = ValueKey::new(vec![Value::Int(1), Value::Text("y".into())]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "(1, 'x')");
    }

    #[test]
    fn option_conversion() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3_i64)), Value::BigInt(3));
        assert_eq!(Value::from("a"), Value::Text("a".to_string()));
    }
}
