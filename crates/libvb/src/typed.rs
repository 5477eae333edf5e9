use std::{convert::TryFrom, fmt};

use serde::{Deserialize, Serialize, Serializer};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{Error, Result};

/// Type tag of a typed parameter, using the subsystem's discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ParamKind {
    Int32 = 1,
    #[strum(to_string = "uint32")]
    UInt32 = 2,
    Int64 = 3,
    #[strum(to_string = "uint64")]
    UInt64 = 4,
    Double = 5,
    Boolean = 6,
    String = 7,
}

impl ParamKind {
    #[inline]
    pub fn tag(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for ParamKind {
    type Error = i32;

    fn try_from(tag: i32) -> std::result::Result<Self, i32> {
        Ok(match tag {
            1 => ParamKind::Int32,
            2 => ParamKind::UInt32,
            3 => ParamKind::Int64,
            4 => ParamKind::UInt64,
            5 => ParamKind::Double,
            6 => ParamKind::Boolean,
            7 => ParamKind::String,
            other => return Err(other),
        })
    }
}

/// Payload of a typed parameter. The active variant is the parameter's kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Boolean(bool),
    String(String),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Int32(_) => ParamKind::Int32,
            ParamValue::UInt32(_) => ParamKind::UInt32,
            ParamValue::Int64(_) => ParamKind::Int64,
            ParamValue::UInt64(_) => ParamKind::UInt64,
            ParamValue::Double(_) => ParamKind::Double,
            ParamValue::Boolean(_) => ParamKind::Boolean,
            ParamValue::String(_) => ParamKind::String,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            ParamValue::Int32(v) => Some(v.into()),
            ParamValue::UInt32(v) => Some(v.into()),
            ParamValue::Int64(v) => Some(v.into()),
            ParamValue::UInt64(v) => Some(v.into()),
            _ => None,
        }
    }

    /// Convert to `kind`, range checking integers.
    ///
    /// Integers convert between each other when the value fits and widen to
    /// `Double`; booleans and strings only convert to themselves.
    pub fn coerce(self, name: &str, kind: ParamKind) -> Result<ParamValue> {
        if self.kind() == kind {
            return Ok(self);
        }

        let mismatch = |value: &ParamValue| {
            Error::invalid(name, format!("cannot use {} value {} as {}", value.kind(), value, kind))
        };

        let Some(wide) = self.as_i128() else {
            return Err(mismatch(&self));
        };

        let converted = match kind {
            ParamKind::Int32 => i32::try_from(wide).ok().map(ParamValue::Int32),
            ParamKind::UInt32 => u32::try_from(wide).ok().map(ParamValue::UInt32),
            ParamKind::Int64 => i64::try_from(wide).ok().map(ParamValue::Int64),
            ParamKind::UInt64 => u64::try_from(wide).ok().map(ParamValue::UInt64),
            ParamKind::Double => Some(ParamValue::Double(wide as f64)),
            ParamKind::Boolean | ParamKind::String => return Err(mismatch(&self)),
        };

        converted
            .ok_or_else(|| Error::invalid(name, format!("{} is out of range for {}", self, kind)))
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int32(v) => write!(f, "{v}"),
            ParamValue::UInt32(v) => write!(f, "{v}"),
            ParamValue::Int64(v) => write!(f, "{v}"),
            ParamValue::UInt64(v) => write!(f, "{v}"),
            ParamValue::Double(v) => write!(f, "{v}"),
            ParamValue::Boolean(v) => write!(f, "{v}"),
            ParamValue::String(v) => write!(f, "{v:?}"),
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ParamValue::Int32(v) => serializer.serialize_i32(*v),
            ParamValue::UInt32(v) => serializer.serialize_u32(*v),
            ParamValue::Int64(v) => serializer.serialize_i64(*v),
            ParamValue::UInt64(v) => serializer.serialize_u64(*v),
            ParamValue::Double(v) => serializer.serialize_f64(*v),
            ParamValue::Boolean(v) => serializer.serialize_bool(*v),
            ParamValue::String(v) => serializer.serialize_str(v),
        }
    }
}

/// Loosely typed input as read from a document; narrowed later by
/// [`ParamValue::coerce`].
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum NativeValue {
    Boolean(bool),
    Signed(i64),
    Unsigned(u64),
    Double(f64),
    String(String),
}

impl From<NativeValue> for ParamValue {
    fn from(value: NativeValue) -> Self {
        match value {
            NativeValue::Boolean(v) => ParamValue::Boolean(v),
            NativeValue::Signed(v) => ParamValue::Int64(v),
            NativeValue::Unsigned(v) => ParamValue::UInt64(v),
            NativeValue::Double(v) => ParamValue::Double(v),
            NativeValue::String(v) => ParamValue::String(v),
        }
    }
}

macro_rules! impl_from_native {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(v: $ty) -> Self {
                    ParamValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_native!(
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    bool => Boolean,
    String => String,
    &str => String,
);

/// One named, strongly typed parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedValue {
    pub name: String,
    pub value: ParamValue,
}

impl TypedValue {
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ParamKind {
        self.value.kind()
    }
}
