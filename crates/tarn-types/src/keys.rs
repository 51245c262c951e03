//! Opaque table, column, and object identifiers.
//!
//! All three are plain integers with documented bit packings so they can be
//! stored directly in node arrays. The packings are part of the file format.

use std::fmt;

/// Identifies a table within a group.
///
/// The low 16 bits are the table's position in the group's table array; the
/// high 16 bits are a generation tag bumped every time a position is reused,
/// so a removed table's key can never alias a table created later.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableKey(u32);

impl TableKey {
    /// The null table key (used by null [`super::ObjLink`]s).
    pub const NONE: Self = Self(0xFFFF_FFFF);

    /// Build a key from a table position and generation tag.
    #[inline]
    #[must_use]
    pub const fn new(index: u16, generation: u16) -> Self {
        Self(((generation as u32) << 16) | index as u32)
    }

    /// Reconstruct from the raw packed value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw packed value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Position in the group's table array.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    /// Generation tag for the position.
    #[inline]
    pub const fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Whether this is the null key.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tk({}.{})", self.index(), self.generation())
    }
}

/// The storage type of a column or [`super::Mixed`] value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(u8)]
pub enum DataType {
    Int = 0,
    Bool = 1,
    String = 2,
    Binary = 3,
    Timestamp = 4,
    Float = 5,
    Double = 6,
    Decimal = 7,
    ObjectId = 8,
    Uuid = 9,
    Link = 10,
    TypedLink = 11,
    Mixed = 12,
}

impl DataType {
    /// Decode from the raw column-key bits.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Int,
            1 => Self::Bool,
            2 => Self::String,
            3 => Self::Binary,
            4 => Self::Timestamp,
            5 => Self::Float,
            6 => Self::Double,
            7 => Self::Decimal,
            8 => Self::ObjectId,
            9 => Self::Uuid,
            10 => Self::Link,
            11 => Self::TypedLink,
            12 => Self::Mixed,
            _ => return None,
        })
    }

    /// Whether values of this type can back a search index.
    #[must_use]
    pub const fn is_indexable(self) -> bool {
        matches!(
            self,
            Self::Int | Self::Bool | Self::String | Self::Timestamp | Self::ObjectId | Self::Uuid
        )
    }

    /// Whether this type aggregates numerically (min/max/sum/avg).
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::Double | Self::Decimal)
    }
}

bitflags::bitflags! {
    /// Attribute flags packed into a [`ColKey`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColumnAttr: u16 {
        /// Values may be null.
        const NULLABLE = 1 << 0;
        /// The column is a list collection.
        const LIST = 1 << 1;
        /// The column is a set collection.
        const SET = 1 << 2;
        /// The column is a dictionary collection.
        const DICTIONARY = 1 << 3;
        /// The column has a search index.
        const INDEXED = 1 << 4;
        /// The column is the table's primary key.
        const PRIMARY_KEY = 1 << 5;
        /// A strong link: removing the origin object cascades to the
        /// target (embedded-object ownership).
        const STRONG = 1 << 6;
        /// The column holds backlinks, maintained automatically as the
        /// reciprocal of a link column on the origin table.
        const BACKLINK = 1 << 7;
    }
}

impl ColumnAttr {
    /// Whether any collection flag is set.
    #[must_use]
    pub const fn is_collection(self) -> bool {
        self.intersects(Self::LIST.union(Self::SET).union(Self::DICTIONARY))
    }
}

/// Identifies a column within a table.
///
/// Packs `(index, type, attributes)` into 64 bits:
/// bits 0–15 column index, bits 16–23 [`DataType`], bits 24–39
/// [`ColumnAttr`]. The remaining bits are reserved and zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ColKey(u64);

impl ColKey {
    /// Build a key from its parts.
    #[inline]
    #[must_use]
    pub const fn new(index: u16, data_type: DataType, attrs: ColumnAttr) -> Self {
        Self((index as u64) | ((data_type as u64) << 16) | ((attrs.bits() as u64) << 24))
    }

    /// Reconstruct from the raw packed value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw packed value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Position in the table's column specification.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    /// The column's storage type.
    ///
    /// # Panics
    ///
    /// Panics if the packed type bits are invalid; keys are only minted by
    /// [`Self::new`], so this indicates memory corruption.
    #[inline]
    #[must_use]
    pub fn data_type(self) -> DataType {
        DataType::from_raw(((self.0 >> 16) & 0xFF) as u8).expect("corrupt ColKey type bits")
    }

    /// The column's attribute flags.
    #[inline]
    #[must_use]
    pub const fn attrs(self) -> ColumnAttr {
        ColumnAttr::from_bits_truncate(((self.0 >> 24) & 0xFFFF) as u16)
    }

    /// Whether values may be null.
    #[inline]
    #[must_use]
    pub const fn is_nullable(self) -> bool {
        self.attrs().contains(ColumnAttr::NULLABLE)
    }

    /// Whether the column is a list.
    #[inline]
    #[must_use]
    pub const fn is_list(self) -> bool {
        self.attrs().contains(ColumnAttr::LIST)
    }

    /// Whether the column carries a search index.
    #[inline]
    #[must_use]
    pub const fn is_indexed(self) -> bool {
        self.attrs().contains(ColumnAttr::INDEXED)
    }

    /// Whether the column is the table's primary key.
    #[inline]
    #[must_use]
    pub const fn is_primary_key(self) -> bool {
        self.attrs().contains(ColumnAttr::PRIMARY_KEY)
    }

    /// Copy of this key with different attribute flags.
    ///
    /// Used when an index is added or removed: the column keeps its
    /// identity (index and type) and only the attribute bits change.
    #[inline]
    #[must_use]
    pub fn with_attrs(self, attrs: ColumnAttr) -> Self {
        Self::new(self.index() as u16, self.data_type(), attrs)
    }
}

impl fmt::Display for ColKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ck({}:{:?})", self.index(), self.data_type())
    }
}

/// Identifies an object (row) within a table.
///
/// A 63-bit signed integer. Negative values are tombstones: soft-deleted
/// rows retained for sync conflict resolution. Keys are stable across
/// cluster splits and merges.
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
pub struct ObjKey(pub i64);

impl ObjKey {
    /// The null object key (used by null [`ObjLink`]s and absent links).
    pub const NONE: Self = Self(0);

    /// The raw key value.
    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Whether this key is a tombstone.
    #[inline]
    pub const fn is_tombstone(self) -> bool {
        self.0 < 0
    }

    /// The tombstone twin of a live key (and vice versa).
    #[inline]
    #[must_use]
    pub const fn toggled_tombstone(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ok({})", self.0)
    }
}

/// A fully-qualified link: target table plus target object.
///
/// Null when either half is the respective null key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ObjLink {
    pub table: TableKey,
    pub obj: ObjKey,
}

impl ObjLink {
    /// The null link.
    pub const NULL: Self = Self {
        table: TableKey::NONE,
        obj: ObjKey::NONE,
    };

    /// Build a link.
    #[inline]
    #[must_use]
    pub const fn new(table: TableKey, obj: ObjKey) -> Self {
        Self { table, obj }
    }

    /// Whether this is the null link.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.table.is_none() || matches!(self.obj, ObjKey::NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_key_packing() {
        let tk = TableKey::new(7, 3);
        assert_eq!(tk.index(), 7);
        assert_eq!(tk.generation(), 3);
        assert_eq!(TableKey::from_raw(tk.raw()), tk);
        assert!(!tk.is_none());
        assert!(TableKey::NONE.is_none());
    }

    #[test]
    fn table_key_no_aliasing_across_generations() {
        let first = TableKey::new(2, 0);
        let reused = TableKey::new(2, 1);
        assert_eq!(first.index(), reused.index());
        assert_ne!(first, reused);
    }

    #[test]
    fn col_key_packing() {
        let ck = ColKey::new(
            4,
            DataType::String,
            ColumnAttr::NULLABLE | ColumnAttr::INDEXED,
        );
        assert_eq!(ck.index(), 4);
        assert_eq!(ck.data_type(), DataType::String);
        assert!(ck.is_nullable());
        assert!(ck.is_indexed());
        assert!(!ck.is_list());
        assert!(!ck.is_primary_key());
        assert_eq!(ColKey::from_raw(ck.raw()), ck);
    }

    #[test]
    fn col_key_attr_rewrite_keeps_identity() {
        let ck = ColKey::new(1, DataType::Int, ColumnAttr::empty());
        let indexed = ck.with_attrs(ColumnAttr::INDEXED);
        assert_eq!(indexed.index(), ck.index());
        assert_eq!(indexed.data_type(), ck.data_type());
        assert!(indexed.is_indexed());
    }

    #[test]
    fn obj_key_tombstones() {
        let live = ObjKey(42);
        assert!(!live.is_tombstone());
        let dead = live.toggled_tombstone();
        assert!(dead.is_tombstone());
        assert_eq!(dead.toggled_tombstone(), live);
    }

    #[test]
    fn obj_link_null() {
        assert!(ObjLink::NULL.is_null());
        assert!(ObjLink::new(TableKey::NONE, ObjKey(5)).is_null());
        assert!(ObjLink::new(TableKey::new(0, 0), ObjKey::NONE).is_null());
        assert!(!ObjLink::new(TableKey::new(0, 0), ObjKey(5)).is_null());
    }

    #[test]
    fn data_type_round_trip() {
        for raw in 0..=12_u8 {
            let dt = DataType::from_raw(raw).unwrap();
            assert_eq!(dt as u8, raw);
        }
        assert!(DataType::from_raw(13).is_none());
    }
}
