use std::cmp::Ordering;
use std::fmt;

use crate::intern::{RefString, StringPool};
use crate::prop::ValueKind;

/// A typed property value. Numeric unsigned properties all carry `u64`;
/// the narrower widths of the original record share one comparison
/// semantics so nothing is lost.
#[derive(Clone, Debug)]
pub enum Value {
    Str(RefString),
    Bool(bool),
    ULong(u64),
    Double(f64),
    StrList(Vec<String>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Bool(_) => ValueKind::Bool,
            Value::ULong(_) => ValueKind::ULong,
            Value::Double(_) => ValueKind::Double,
            Value::StrList(_) => ValueKind::StrList,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::Str(s) => s.as_str(),
            other => panic!("expected string value, got {:?}", other.kind()),
        }
    }

    pub fn as_ulong(&self) -> u64 {
        match self {
            Value::ULong(v) => *v,
            other => panic!("expected unsigned value, got {:?}", other.kind()),
        }
    }

    pub fn as_double(&self) -> f64 {
        match self {
            Value::Double(v) => *v,
            other => panic!("expected double value, got {:?}", other.kind()),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(v) => *v,
            other => panic!("expected boolean value, got {:?}", other.kind()),
        }
    }

    pub fn as_words(&self) -> &[String] {
        match self {
            Value::StrList(words) => words,
            other => panic!("expected word list, got {:?}", other.kind()),
        }
    }

    /// Default (zero-suppressible) check used by the save path.
    pub fn is_default(&self) -> bool {
        match self {
            Value::Str(s) => s.is_empty(),
            Value::Bool(b) => !b,
            Value::ULong(v) => *v == 0,
            Value::Double(v) => *v == 0.0,
            Value::StrList(words) => words.is_empty(),
        }
    }

    /// Total ordering between two values of the same kind. A kind
    /// mismatch is a malformed query, which is a programmer error.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a.as_str().cmp(b.as_str()),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::ULong(a), Value::ULong(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (a, b) => panic!(
                "value kind mismatch in comparison: {:?} vs {:?}",
                a.kind(),
                b.kind()
            ),
        }
    }

    pub fn matches_eq(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Equal
    }

    /// Text form used on disk and in serialized queries.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.as_str().to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::ULong(v) => v.to_string(),
            Value::Double(v) => format!("{:.6}", v),
            Value::StrList(words) => words.join(" "),
        }
    }

    /// Parses the text form back into a value of the given kind.
    pub fn from_text(kind: ValueKind, text: &str, pool: &StringPool) -> Result<Value, ValueParseError> {
        match kind {
            ValueKind::Str => Ok(Value::Str(pool.intern(text))),
            ValueKind::Bool => match text.trim() {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" | "" => Ok(Value::Bool(false)),
                other => Err(ValueParseError::new(kind, other)),
            },
            ValueKind::ULong => text
                .trim()
                .parse::<u64>()
                .map(Value::ULong)
                .map_err(|_| ValueParseError::new(kind, text)),
            ValueKind::Double => text
                .trim()
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| ValueParseError::new(kind, text)),
            ValueKind::StrList => Ok(Value::StrList(crate::intern::split_words(text))),
        }
    }
}

#[derive(Debug)]
pub struct ValueParseError {
    pub kind: ValueKind,
    pub text: String,
}

impl ValueParseError {
    fn new(kind: ValueKind, text: &str) -> Self {
        Self {
            kind,
            text: text.to_string(),
        }
    }
}

impl fmt::Display for ValueParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot parse {:?} from {:?}", self.kind, self.text)
    }
}

impl std::error::Error for ValueParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_ulong() {
        let a = Value::ULong(3);
        let b = Value::ULong(8);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert!(Value::ULong(8).matches_eq(&b));
    }

    #[test]
    #[should_panic(expected = "value kind mismatch")]
    fn compare_mismatch_panics() {
        Value::ULong(1).compare(&Value::Double(1.0));
    }

    #[test]
    fn text_round_trip() {
        let pool = StringPool::new();
        let v = Value::from_text(ValueKind::ULong, "42", &pool).unwrap();
        assert_eq!(v.to_text(), "42");
        let v = Value::from_text(ValueKind::Double, "2.500000", &pool).unwrap();
        assert_eq!(v.to_text(), "2.500000");
        let v = Value::from_text(ValueKind::Bool, "1", &pool).unwrap();
        assert!(v.as_bool());
    }

    #[test]
    fn default_detection() {
        let pool = StringPool::new();
        assert!(Value::Str(pool.intern("")).is_default());
        assert!(!Value::Str(pool.intern("x")).is_default());
        assert!(Value::ULong(0).is_default());
        assert!(Value::Double(0.0).is_default());
    }
}
