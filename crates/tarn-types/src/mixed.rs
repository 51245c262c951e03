//! The dynamically-typed [`Mixed`] value.
//!
//! `Mixed` is the value currency of the engine: query constants, column
//! reads and writes, aggregate results, and the client-reset converter all
//! traffic in it.

use std::cmp::Ordering;
use std::fmt;

use crate::keys::{DataType, ObjKey, ObjLink};

/// A point in time: seconds since the Unix epoch plus a nanosecond part.
///
/// The nanosecond part always has the same sign as the second part (or is
/// zero), matching the on-disk encoding of two packed integers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanoseconds: i32,
}

impl Timestamp {
    /// Build a timestamp.
    #[must_use]
    pub const fn new(seconds: i64, nanoseconds: i32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }
}

/// A 96-bit object identifier (timestamp + machine + counter), kept opaque.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct ObjectId(pub [u8; 12]);

/// A 128-bit UUID, kept opaque; ordering is bytewise.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Uuid(pub [u8; 16]);

/// A 128-bit decimal, stored as an opaque scaled integer.
///
/// The engine only needs equality, ordering, and storage; arithmetic is the
/// SDK's business.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Decimal(pub i128);

/// A dynamically-typed value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Mixed {
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Binary(Vec<u8>),
    Timestamp(Timestamp),
    ObjectId(ObjectId),
    Uuid(Uuid),
    /// A link to an object in the column's fixed target table.
    Link(ObjKey),
    /// A link carrying its own target table.
    TypedLink(ObjLink),
    /// Placeholder marking a nested list (the list itself is a collection
    /// accessor, not a value).
    List,
    /// Placeholder marking a nested dictionary.
    Dictionary,
}

impl Mixed {
    /// Whether this is the null value.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The storage type, or `None` for null and the collection placeholders.
    #[must_use]
    pub const fn data_type(&self) -> Option<DataType> {
        Some(match self {
            Self::Null | Self::List | Self::Dictionary => return None,
            Self::Bool(_) => DataType::Bool,
            Self::Int(_) => DataType::Int,
            Self::Float(_) => DataType::Float,
            Self::Double(_) => DataType::Double,
            Self::Decimal(_) => DataType::Decimal,
            Self::String(_) => DataType::String,
            Self::Binary(_) => DataType::Binary,
            Self::Timestamp(_) => DataType::Timestamp,
            Self::ObjectId(_) => DataType::ObjectId,
            Self::Uuid(_) => DataType::Uuid,
            Self::Link(_) => DataType::Link,
            Self::TypedLink(_) => DataType::TypedLink,
        })
    }

    /// Extract an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract a bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Extract a string slice.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract a link key.
    #[must_use]
    pub const fn as_link(&self) -> Option<ObjKey> {
        match self {
            Self::Link(k) => Some(*k),
            _ => None,
        }
    }

    /// The value as `f64` if it is any numeric kind.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn numeric_value(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(f64::from(*v)),
            Self::Double(v) => Some(*v),
            Self::Decimal(d) => Some(d.0 as f64),
            _ => None,
        }
    }

    /// Rank used to order values of different types (nulls first, then by
    /// type family). Matches the sort order of the original engine closely
    /// enough for descriptor purposes: numerics share one family.
    const fn type_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) | Self::Double(_) | Self::Decimal(_) => 2,
            Self::String(_) => 3,
            Self::Binary(_) => 4,
            Self::Timestamp(_) => 5,
            Self::ObjectId(_) => 6,
            Self::Uuid(_) => 7,
            Self::Link(_) => 8,
            Self::TypedLink(_) => 9,
            Self::List => 10,
            Self::Dictionary => 11,
        }
    }

    /// Total order over all values, used by sort and distinct descriptors.
    ///
    /// Values of the same numeric family compare by value across types;
    /// NaN sorts after every other double (IEEE total order).
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Self::Null, Self::Null)
            | (Self::List, Self::List)
            | (Self::Dictionary, Self::Dictionary) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Binary(a), Self::Binary(b)) => a.cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => a.cmp(b),
            (Self::ObjectId(a), Self::ObjectId(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::Decimal(a), Self::Decimal(b)) => a.cmp(b),
            (Self::Link(a), Self::Link(b)) => a.cmp(b),
            (Self::TypedLink(a), Self::TypedLink(b)) => {
                (a.table, a.obj).cmp(&(b.table, b.obj))
            }
            // Mixed numeric family: compare as doubles, NaN last.
            (a, b) => {
                let av = a.numeric_value().unwrap_or(f64::NAN);
                let bv = b.numeric_value().unwrap_or(f64::NAN);
                av.total_cmp(&bv)
            }
        }
    }
}

impl fmt::Display for Mixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{}", v.0),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Binary(v) => write!(f, "<{} bytes>", v.len()),
            Self::Timestamp(v) => write!(f, "{}.{:09}", v.seconds, v.nanoseconds.unsigned_abs()),
            Self::ObjectId(v) => {
                for b in v.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Self::Uuid(v) => {
                for b in v.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Self::Link(k) => write!(f, "{k}"),
            Self::TypedLink(l) => write!(f, "{}:{}", l.table, l.obj),
            Self::List => f.write_str("<list>"),
            Self::Dictionary => f.write_str("<dictionary>"),
        }
    }
}

impl From<i64> for Mixed {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Mixed {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Mixed {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for Mixed {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<f64> for Mixed {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<Option<i64>> for Mixed {
    fn from(v: Option<i64>) -> Self {
        v.map_or(Self::Null, Self::Int)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_has_no_type() {
        assert!(Mixed::Null.is_null());
        assert_eq!(Mixed::Null.data_type(), None);
        assert_eq!(Mixed::Int(1).data_type(), Some(DataType::Int));
    }

    #[test]
    fn empty_string_is_not_null() {
        let empty = Mixed::from("");
        assert!(!empty.is_null());
        assert_ne!(empty, Mixed::Null);
        assert_eq!(empty.total_cmp(&Mixed::Null), Ordering::Greater);
    }

    #[test]
    fn cross_type_numeric_order() {
        assert_eq!(
            Mixed::Int(2).total_cmp(&Mixed::Double(2.5)),
            Ordering::Less
        );
        assert_eq!(
            Mixed::Double(3.0).total_cmp(&Mixed::Int(3)),
            Ordering::Equal
        );
        assert_eq!(
            Mixed::Float(1.5).total_cmp(&Mixed::Int(1)),
            Ordering::Greater
        );
    }

    #[test]
    fn nan_and_infinity_order() {
        let nan = Mixed::Double(f64::NAN);
        let inf = Mixed::Double(f64::INFINITY);
        let neg_inf = Mixed::Double(f64::NEG_INFINITY);
        assert_eq!(neg_inf.total_cmp(&inf), Ordering::Less);
        assert_eq!(inf.total_cmp(&nan), Ordering::Less);
        assert_eq!(nan.total_cmp(&nan), Ordering::Equal);
    }

    #[test]
    fn nulls_sort_first() {
        let mut values = vec![Mixed::Int(1), Mixed::Null, Mixed::from("a"), Mixed::Bool(true)];
        values.sort_by(Mixed::total_cmp);
        assert_eq!(values[0], Mixed::Null);
    }

    #[test]
    fn timestamp_order() {
        let a = Timestamp::new(10, 0);
        let b = Timestamp::new(10, 5);
        let c = Timestamp::new(11, 0);
        assert!(a < b && b < c);
    }
}
