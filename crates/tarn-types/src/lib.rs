//! Shared identifier and value types for the Tarn engine.
//!
//! Everything here is a plain value type: refs into the file, opaque
//! table/column/object keys, and the dynamically-typed [`Mixed`] value.
//! The storage and transaction machinery is built on top of these in the
//! higher crates.

pub mod keys;
pub mod mixed;

pub use keys::{ColKey, ColumnAttr, DataType, ObjKey, ObjLink, TableKey};
pub use mixed::{Decimal, Mixed, ObjectId, Timestamp, Uuid};

use std::fmt;

/// A reference to an on-disk node: the byte offset of its header inside
/// the file.
///
/// Refs are stable for the lifetime of the snapshot that produced them,
/// always 8-byte aligned, and `Ref::NONE` (offset 0) means "none"; the
/// file header occupies offset 0, so no node can live there.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Ref(u64);

impl Ref {
    /// The null ref.
    pub const NONE: Self = Self(0);

    /// Create a ref from a byte offset.
    ///
    /// Returns `None` if the offset is not 8-byte aligned (offset 0 is
    /// allowed and is the null ref).
    #[inline]
    pub const fn new(offset: u64) -> Option<Self> {
        if offset % 8 == 0 {
            Some(Self(offset))
        } else {
            None
        }
    }

    /// Get the raw byte offset.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the null ref.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Whether this ref points at a node.
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A 63-bit payload with a one-bit tag, packed into a single array element.
///
/// Tag clear: the payload is a [`Ref`] (refs are 8-byte aligned, so the low
/// bit of a raw ref is always zero). Tag set: the payload is a small inline
/// integer. This one-bit discrimination is used throughout the node forest
/// and the radix index instead of separate type fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOrTagged {
    /// An untagged node ref (possibly `Ref::NONE`).
    Ref(Ref),
    /// An inline 63-bit integer.
    Tagged(i64),
}

impl RefOrTagged {
    /// Largest magnitude an inline integer can carry.
    pub const MAX_TAGGED: i64 = (1_i64 << 62) - 1;

    /// Smallest inline integer.
    pub const MIN_TAGGED: i64 = -(1_i64 << 62);

    /// Whether `value` fits the 63-bit inline form.
    #[inline]
    pub const fn fits(value: i64) -> bool {
        value >= Self::MIN_TAGGED && value <= Self::MAX_TAGGED
    }

    /// Pack into the raw element representation.
    ///
    /// # Panics
    ///
    /// Panics if a tagged value does not fit 63 bits; callers check
    /// [`Self::fits`] first and fall back to a ref-to-blob encoding.
    #[inline]
    pub fn pack(self) -> u64 {
        match self {
            Self::Ref(r) => r.get(),
            Self::Tagged(v) => {
                assert!(Self::fits(v), "tagged value {v} exceeds 63 bits");
                ((v as u64) << 1) | 1
            }
        }
    }

    /// Unpack from the raw element representation.
    #[inline]
    pub fn unpack(raw: u64) -> Self {
        if raw & 1 == 0 {
            // Untagged: the raw value is an aligned ref.
            Self::Ref(Ref(raw))
        } else {
            // Arithmetic shift recovers the sign of the 63-bit payload.
            Self::Tagged((raw as i64) >> 1)
        }
    }

    /// The ref, if untagged.
    #[inline]
    pub const fn as_ref(self) -> Option<Ref> {
        match self {
            Self::Ref(r) => Some(r),
            Self::Tagged(_) => None,
        }
    }

    /// The inline integer, if tagged.
    #[inline]
    pub const fn as_tagged(self) -> Option<i64> {
        match self {
            Self::Tagged(v) => Some(v),
            Self::Ref(_) => None,
        }
    }
}

/// A snapshot version number.
///
/// Versions are assigned by committed write transactions and are totally
/// ordered: a read transaction bound to version V observes all commits
/// ≤ V and none after.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct VersionId(pub u64);

impl VersionId {
    /// The version of a freshly-created, never-committed file.
    pub const ZERO: Self = Self(0);

    /// The next version in sequence.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_alignment() {
        assert!(Ref::new(0).is_some());
        assert!(Ref::new(8).is_some());
        assert!(Ref::new(24).is_some());
        assert!(Ref::new(7).is_none());
        assert!(Ref::new(12).is_none());
        assert!(Ref::new(0).unwrap().is_none());
        assert!(Ref::new(8).unwrap().is_some());
    }

    #[test]
    fn ref_or_tagged_round_trip() {
        for v in [0_i64, 1, -1, 42, -42, RefOrTagged::MAX_TAGGED, RefOrTagged::MIN_TAGGED] {
            let packed = RefOrTagged::Tagged(v).pack();
            assert_eq!(packed & 1, 1, "tagged values carry the tag bit");
            assert_eq!(RefOrTagged::unpack(packed), RefOrTagged::Tagged(v));
        }
        for r in [0_u64, 8, 4096, 1 << 40] {
            let packed = RefOrTagged::Ref(Ref::new(r).unwrap()).pack();
            assert_eq!(packed, r);
            assert_eq!(
                RefOrTagged::unpack(packed),
                RefOrTagged::Ref(Ref::new(r).unwrap())
            );
        }
    }

    #[test]
    fn tagged_bounds() {
        assert!(RefOrTagged::fits(RefOrTagged::MAX_TAGGED));
        assert!(RefOrTagged::fits(RefOrTagged::MIN_TAGGED));
        assert!(!RefOrTagged::fits(RefOrTagged::MAX_TAGGED + 1));
        assert!(!RefOrTagged::fits(RefOrTagged::MIN_TAGGED - 1));
        assert!(!RefOrTagged::fits(i64::MAX));
        assert!(!RefOrTagged::fits(i64::MIN));
    }

    #[test]
    #[should_panic(expected = "exceeds 63 bits")]
    fn tagged_overflow_panics() {
        let _ = RefOrTagged::Tagged(i64::MAX).pack();
    }

    #[test]
    fn version_ordering() {
        assert!(VersionId::ZERO < VersionId::ZERO.next());
        assert_eq!(VersionId(3).next(), VersionId(4));
    }
}
