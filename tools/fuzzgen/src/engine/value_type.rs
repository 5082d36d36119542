use crate::codec::{Scalar, TypeTag};
use crate::errors::FuzzError;
use std::fmt;
use std::str::FromStr;

/// Category descriptor that drives [`super::ValueEngine::make`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Any value of the numeric type, full representable range.
    Scalar(TypeTag),
    /// Integer-backed enumeration with inclusive bounds.
    Enumerated { min: i64, max: i64 },
    /// A registered composite type, by registry name.
    Composite(String),
    Reference(Box<ValueType>),
    Opaque,
    Text,
    Callable,
}

impl ValueType {
    pub fn composite(name: impl Into<String>) -> Self {
        Self::Composite(name.into())
    }

    pub fn reference(inner: ValueType) -> Self {
        Self::Reference(Box::new(inner))
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(tag) => write!(f, "{tag}"),
            Self::Enumerated { min, max } => write!(f, "enum[{min}..={max}]"),
            Self::Composite(name) => f.write_str(name),
            Self::Reference(inner) => write!(f, "&{inner}"),
            Self::Opaque => f.write_str("opaque"),
            Self::Text => f.write_str("text"),
            Self::Callable => f.write_str("callable"),
        }
    }
}

/// Parses the [`fmt::Display`] form back. Unrecognised names are composites.
impl FromStr for ValueType {
    type Err = FuzzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(inner) = s.strip_prefix('&') {
            return Ok(Self::reference(inner.parse()?));
        }
        if let Some(range) = s.strip_prefix("enum[").and_then(|r| r.strip_suffix(']')) {
            let bad = || FuzzError::InvalidBounds(format!("malformed enumeration {s}"));
            let (min, max) = range.split_once("..=").ok_or_else(bad)?;
            let min = min.trim().parse::<i64>().map_err(|_| bad())?;
            let max = max.trim().parse::<i64>().map_err(|_| bad())?;
            if min > max {
                return Err(bad());
            }
            return Ok(Self::Enumerated { min, max });
        }
        if let Some(tag) = TypeTag::parse(s) {
            return Ok(Self::Scalar(tag));
        }
        match s {
            "" => Err(FuzzError::UnknownType(String::new())),
            "opaque" => Ok(Self::Opaque),
            "text" => Ok(Self::Text),
            "callable" => Ok(Self::Callable),
            name => Ok(Self::composite(name)),
        }
    }
}

/// Handle into a session's instance arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// What [`super::ValueEngine::make`] hands back. Heap values stay owned by the
/// engine; callers only ever hold an [`InstanceId`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Instance(InstanceId),
    Reference(Box<Value>),
    Null,
}

impl Value {
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Self::Scalar(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<InstanceId> {
        match self {
            Self::Instance(id) => Some(*id),
            _ => None,
        }
    }

    /// Follows references down to the first non-reference value.
    pub fn referent(&self) -> &Value {
        let mut current = self;
        while let Self::Reference(inner) = current {
            current = inner;
        }
        current
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}
