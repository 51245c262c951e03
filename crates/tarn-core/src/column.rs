//! The value codec: how one [`Mixed`] value is packed into a column-leaf
//! element.
//!
//! Every column leaf is a packed array of 64-bit-or-smaller elements; the
//! column's [`ColKey`] fixes the interpretation:
//!
//! - non-nullable `Int` is zigzag-encoded so small magnitudes stay narrow;
//! - nullable scalars use ref-or-tagged: 0 is null, a tagged payload is the
//!   inline value, a ref points at an overflow blob;
//! - `Float`/`Double` store raw IEEE bits with one reserved NaN payload as
//!   the null sentinel (real NaNs are canonicalized away from it);
//! - `String`/`Binary`/`Decimal`/`ObjectId`/`Uuid`/`Timestamp`/`Mixed`
//!   store a blob ref, 0 meaning null (an empty blob is distinct);
//! - `Link` stores the target key plus one, 0 meaning no link;
//! - collection columns store the ref of their element tree, 0 meaning the
//!   collection was never materialized;
//! - backlink columns store 0, a tagged origin key, or a ref to a sorted
//!   key list.

use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_node::{Array, blob};
use tarn_types::{
    ColKey, DataType, Decimal, Mixed, ObjKey, ObjLink, ObjectId, Ref, RefOrTagged, TableKey,
    Timestamp, Uuid,
};

/// Null sentinel bit pattern for `f32` columns (a quiet NaN payload the
/// canonicalization below never produces).
pub const NULL_FLOAT_BITS: u32 = 0x7FC0_0001;

/// Canonical bit pattern user NaNs are stored as.
pub const CANONICAL_NAN_F32: u32 = 0x7FC0_0000;

/// Null sentinel bit pattern for `f64` columns.
pub const NULL_DOUBLE_BITS: u64 = 0x7FF8_0000_0000_0001;

/// Canonical bit pattern user NaNs are stored as.
pub const CANONICAL_NAN_F64: u64 = 0x7FF8_0000_0000_0000;

const fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

const fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn type_error(col: ColKey, value: &Mixed) -> TarnError {
    TarnError::logic(format!(
        "value {value} cannot be stored in column {col}"
    ))
}

/// The raw element a freshly-created row gets in this column: null for
/// nullable columns, the type's zero value otherwise.
#[must_use]
pub fn default_raw(col: ColKey) -> u64 {
    if col.attrs().is_collection() || col.attrs().contains(tarn_types::ColumnAttr::BACKLINK) {
        return 0;
    }
    if col.is_nullable() {
        return match col.data_type() {
            DataType::Float => u64::from(NULL_FLOAT_BITS),
            DataType::Double => NULL_DOUBLE_BITS,
            _ => 0,
        };
    }
    // Non-nullable zero defaults: 0 / false / 0.0 / empty string all
    // encode as a raw zero element.
    0
}

/// Encode `value` into the raw element for `col`, allocating blobs as
/// needed. The caller is responsible for freeing whatever the slot held
/// before (see [`free_raw`]).
pub fn encode(alloc: &mut SlabAlloc, col: ColKey, value: &Mixed) -> Result<u64> {
    let nullable = col.is_nullable();
    if value.is_null() {
        if !nullable {
            return Err(TarnError::logic(format!(
                "null written to non-nullable column {col}"
            )));
        }
        return Ok(match col.data_type() {
            DataType::Float => u64::from(NULL_FLOAT_BITS),
            DataType::Double => NULL_DOUBLE_BITS,
            _ => 0,
        });
    }

    match (col.data_type(), value) {
        (DataType::Int, Mixed::Int(v)) => {
            if nullable {
                if RefOrTagged::fits(*v) {
                    Ok(RefOrTagged::Tagged(*v).pack())
                } else {
                    let r = blob::create(alloc, &v.to_le_bytes())?;
                    Ok(RefOrTagged::Ref(r).pack())
                }
            } else {
                Ok(zigzag(*v))
            }
        }
        (DataType::Bool, Mixed::Bool(v)) => {
            if nullable {
                Ok(RefOrTagged::Tagged(i64::from(*v)).pack())
            } else {
                Ok(u64::from(*v))
            }
        }
        (DataType::Float, Mixed::Float(v)) => {
            let mut bits = v.to_bits();
            if v.is_nan() {
                bits = CANONICAL_NAN_F32;
            }
            Ok(u64::from(bits))
        }
        (DataType::Double, Mixed::Double(v)) => {
            let mut bits = v.to_bits();
            if v.is_nan() {
                bits = CANONICAL_NAN_F64;
            }
            Ok(bits)
        }
        (DataType::String, Mixed::String(s)) => {
            let r = blob::create(alloc, s.as_bytes())?;
            Ok(RefOrTagged::Ref(r).pack())
        }
        (DataType::Binary, Mixed::Binary(b)) => {
            let r = blob::create(alloc, b)?;
            Ok(RefOrTagged::Ref(r).pack())
        }
        (DataType::Timestamp, Mixed::Timestamp(ts)) => {
            let mut buf = [0_u8; 12];
            buf[..8].copy_from_slice(&ts.seconds.to_le_bytes());
            buf[8..].copy_from_slice(&ts.nanoseconds.to_le_bytes());
            let r = blob::create(alloc, &buf)?;
            Ok(RefOrTagged::Ref(r).pack())
        }
        (DataType::Decimal, Mixed::Decimal(d)) => {
            let r = blob::create(alloc, &d.0.to_le_bytes())?;
            Ok(RefOrTagged::Ref(r).pack())
        }
        (DataType::ObjectId, Mixed::ObjectId(oid)) => {
            let r = blob::create(alloc, &oid.0)?;
            Ok(RefOrTagged::Ref(r).pack())
        }
        (DataType::Uuid, Mixed::Uuid(u)) => {
            let r = blob::create(alloc, &u.0)?;
            Ok(RefOrTagged::Ref(r).pack())
        }
        (DataType::Link, Mixed::Link(k)) => {
            if k.0 < 0 {
                return Err(TarnError::logic("links cannot target tombstones"));
            }
            Ok((k.0 as u64) + 1)
        }
        (DataType::TypedLink, Mixed::TypedLink(l)) => {
            let mut buf = [0_u8; 12];
            buf[..4].copy_from_slice(&l.table.raw().to_le_bytes());
            buf[4..].copy_from_slice(&l.obj.0.to_le_bytes());
            let r = blob::create(alloc, &buf)?;
            Ok(RefOrTagged::Ref(r).pack())
        }
        (DataType::Mixed, v) => {
            let tagged = encode_mixed_blob(v)?;
            let r = blob::create(alloc, &tagged)?;
            Ok(RefOrTagged::Ref(r).pack())
        }
        _ => Err(type_error(col, value)),
    }
}

/// Decode the raw element of `col` back into a [`Mixed`].
pub fn decode(alloc: &SlabAlloc, col: ColKey, raw: u64) -> Result<Mixed> {
    let nullable = col.is_nullable();
    match col.data_type() {
        DataType::Int => {
            if nullable {
                match RefOrTagged::unpack(raw) {
                    RefOrTagged::Ref(r) if r.is_none() => Ok(Mixed::Null),
                    RefOrTagged::Tagged(v) => Ok(Mixed::Int(v)),
                    RefOrTagged::Ref(r) => {
                        let bytes = blob::read(alloc, r)?;
                        Ok(Mixed::Int(i64::from_le_bytes(
                            bytes.try_into().map_err(|_| {
                                TarnError::invalid_database("short int overflow blob")
                            })?,
                        )))
                    }
                }
            } else {
                Ok(Mixed::Int(unzigzag(raw)))
            }
        }
        DataType::Bool => {
            if nullable {
                match RefOrTagged::unpack(raw) {
                    RefOrTagged::Ref(r) if r.is_none() => Ok(Mixed::Null),
                    RefOrTagged::Tagged(v) => Ok(Mixed::Bool(v != 0)),
                    RefOrTagged::Ref(_) => {
                        Err(TarnError::invalid_database("bool column holds a ref"))
                    }
                }
            } else {
                Ok(Mixed::Bool(raw != 0))
            }
        }
        DataType::Float => {
            let bits = raw as u32;
            if nullable && bits == NULL_FLOAT_BITS {
                Ok(Mixed::Null)
            } else {
                Ok(Mixed::Float(f32::from_bits(bits)))
            }
        }
        DataType::Double => {
            if nullable && raw == NULL_DOUBLE_BITS {
                Ok(Mixed::Null)
            } else {
                Ok(Mixed::Double(f64::from_bits(raw)))
            }
        }
        DataType::String => match RefOrTagged::unpack(raw) {
            RefOrTagged::Ref(r) if r.is_none() => Ok(if nullable {
                Mixed::Null
            } else {
                Mixed::String(String::new())
            }),
            RefOrTagged::Ref(r) => {
                let bytes = blob::read(alloc, r)?;
                Ok(Mixed::String(
                    std::str::from_utf8(bytes)
                        .map_err(|_| TarnError::invalid_database("non-UTF-8 string blob"))?
                        .to_owned(),
                ))
            }
            RefOrTagged::Tagged(_) => {
                Err(TarnError::invalid_database("string column holds a tagged value"))
            }
        },
        DataType::Binary => match RefOrTagged::unpack(raw) {
            RefOrTagged::Ref(r) if r.is_none() => Ok(if nullable {
                Mixed::Null
            } else {
                Mixed::Binary(Vec::new())
            }),
            RefOrTagged::Ref(r) => Ok(Mixed::Binary(blob::read(alloc, r)?.to_vec())),
            RefOrTagged::Tagged(_) => {
                Err(TarnError::invalid_database("binary column holds a tagged value"))
            }
        },
        DataType::Timestamp => match RefOrTagged::unpack(raw) {
            RefOrTagged::Ref(r) if r.is_none() => Ok(Mixed::Null),
            RefOrTagged::Ref(r) => {
                let bytes = blob::read(alloc, r)?;
                if bytes.len() != 12 {
                    return Err(TarnError::invalid_database("short timestamp blob"));
                }
                Ok(Mixed::Timestamp(Timestamp {
                    seconds: i64::from_le_bytes(bytes[..8].try_into().expect("8 bytes")),
                    nanoseconds: i32::from_le_bytes(bytes[8..].try_into().expect("4 bytes")),
                }))
            }
            RefOrTagged::Tagged(_) => {
                Err(TarnError::invalid_database("timestamp column holds a tagged value"))
            }
        },
        DataType::Decimal => match RefOrTagged::unpack(raw) {
            RefOrTagged::Ref(r) if r.is_none() => Ok(Mixed::Null),
            RefOrTagged::Ref(r) => {
                let bytes = blob::read(alloc, r)?;
                Ok(Mixed::Decimal(Decimal(i128::from_le_bytes(
                    bytes
                        .try_into()
                        .map_err(|_| TarnError::invalid_database("short decimal blob"))?,
                ))))
            }
            RefOrTagged::Tagged(_) => {
                Err(TarnError::invalid_database("decimal column holds a tagged value"))
            }
        },
        DataType::ObjectId => match RefOrTagged::unpack(raw) {
            RefOrTagged::Ref(r) if r.is_none() => Ok(Mixed::Null),
            RefOrTagged::Ref(r) => {
                let bytes = blob::read(alloc, r)?;
                Ok(Mixed::ObjectId(ObjectId(bytes.try_into().map_err(
                    |_| TarnError::invalid_database("short object-id blob"),
                )?)))
            }
            RefOrTagged::Tagged(_) => {
                Err(TarnError::invalid_database("object-id column holds a tagged value"))
            }
        },
        DataType::Uuid => match RefOrTagged::unpack(raw) {
            RefOrTagged::Ref(r) if r.is_none() => Ok(Mixed::Null),
            RefOrTagged::Ref(r) => {
                let bytes = blob::read(alloc, r)?;
                Ok(Mixed::Uuid(Uuid(bytes.try_into().map_err(|_| {
                    TarnError::invalid_database("short uuid blob")
                })?)))
            }
            RefOrTagged::Tagged(_) => {
                Err(TarnError::invalid_database("uuid column holds a tagged value"))
            }
        },
        DataType::Link => {
            if raw == 0 {
                Ok(Mixed::Null)
            } else {
                Ok(Mixed::Link(ObjKey((raw - 1) as i64)))
            }
        }
        DataType::TypedLink => match RefOrTagged::unpack(raw) {
            RefOrTagged::Ref(r) if r.is_none() => Ok(Mixed::Null),
            RefOrTagged::Ref(r) => {
                let bytes = blob::read(alloc, r)?;
                if bytes.len() != 12 {
                    return Err(TarnError::invalid_database("short typed-link blob"));
                }
                Ok(Mixed::TypedLink(ObjLink::new(
                    TableKey::from_raw(u32::from_le_bytes(
                        bytes[..4].try_into().expect("4 bytes"),
                    )),
                    ObjKey(i64::from_le_bytes(bytes[4..].try_into().expect("8 bytes"))),
                )))
            }
            RefOrTagged::Tagged(_) => {
                Err(TarnError::invalid_database("typed-link column holds a tagged value"))
            }
        },
        DataType::Mixed => match RefOrTagged::unpack(raw) {
            RefOrTagged::Ref(r) if r.is_none() => Ok(Mixed::Null),
            RefOrTagged::Ref(r) => decode_mixed_blob(blob::read(alloc, r)?),
            RefOrTagged::Tagged(_) => {
                Err(TarnError::invalid_database("mixed column holds a tagged value"))
            }
        },
    }
}

/// Free whatever heap storage the raw element of `col` owns (blob refs).
/// Collection refs are not freed here: collections own node trees freed by
/// the cluster layer.
pub fn free_raw(alloc: &mut SlabAlloc, col: ColKey, raw: u64) -> Result<()> {
    if col.attrs().is_collection() || col.attrs().contains(tarn_types::ColumnAttr::BACKLINK) {
        return Ok(());
    }
    let has_blob = matches!(
        col.data_type(),
        DataType::Int
            | DataType::String
            | DataType::Binary
            | DataType::Timestamp
            | DataType::Decimal
            | DataType::ObjectId
            | DataType::Uuid
            | DataType::TypedLink
            | DataType::Mixed
    );
    if has_blob {
        if let RefOrTagged::Ref(r) = RefOrTagged::unpack(raw) {
            if r.is_some() {
                blob::free(alloc, r)?;
            }
        }
    }
    Ok(())
}

/// Serialized form of a value in an any-typed column: one type byte, then
/// the value's own little-endian payload.
fn encode_mixed_blob(value: &Mixed) -> Result<Vec<u8>> {
    let Some(dt) = value.data_type() else {
        return Err(TarnError::logic("collections cannot nest in a mixed blob"));
    };
    let mut out = vec![dt as u8];
    match value {
        Mixed::Bool(v) => out.push(u8::from(*v)),
        Mixed::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
        Mixed::Float(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
        Mixed::Double(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
        Mixed::Decimal(d) => out.extend_from_slice(&d.0.to_le_bytes()),
        Mixed::String(s) => out.extend_from_slice(s.as_bytes()),
        Mixed::Binary(b) => out.extend_from_slice(b),
        Mixed::Timestamp(ts) => {
            out.extend_from_slice(&ts.seconds.to_le_bytes());
            out.extend_from_slice(&ts.nanoseconds.to_le_bytes());
        }
        Mixed::ObjectId(oid) => out.extend_from_slice(&oid.0),
        Mixed::Uuid(u) => out.extend_from_slice(&u.0),
        Mixed::Link(k) => out.extend_from_slice(&k.0.to_le_bytes()),
        Mixed::TypedLink(l) => {
            out.extend_from_slice(&l.table.raw().to_le_bytes());
            out.extend_from_slice(&l.obj.0.to_le_bytes());
        }
        Mixed::Null | Mixed::List | Mixed::Dictionary => unreachable!("filtered above"),
    }
    Ok(out)
}

fn decode_mixed_blob(bytes: &[u8]) -> Result<Mixed> {
    let bad = || TarnError::invalid_database("malformed mixed blob");
    let (&tag, rest) = bytes.split_first().ok_or_else(bad)?;
    let dt = DataType::from_raw(tag).ok_or_else(bad)?;
    Ok(match dt {
        DataType::Bool => Mixed::Bool(*rest.first().ok_or_else(bad)? != 0),
        DataType::Int => Mixed::Int(i64::from_le_bytes(rest.try_into().map_err(|_| bad())?)),
        DataType::Float => Mixed::Float(f32::from_bits(u32::from_le_bytes(
            rest.try_into().map_err(|_| bad())?,
        ))),
        DataType::Double => Mixed::Double(f64::from_bits(u64::from_le_bytes(
            rest.try_into().map_err(|_| bad())?,
        ))),
        DataType::Decimal => Mixed::Decimal(Decimal(i128::from_le_bytes(
            rest.try_into().map_err(|_| bad())?,
        ))),
        DataType::String => Mixed::String(
            std::str::from_utf8(rest).map_err(|_| bad())?.to_owned(),
        ),
        DataType::Binary => Mixed::Binary(rest.to_vec()),
        DataType::Timestamp => {
            if rest.len() != 12 {
                return Err(bad());
            }
            Mixed::Timestamp(Timestamp {
                seconds: i64::from_le_bytes(rest[..8].try_into().expect("8 bytes")),
                nanoseconds: i32::from_le_bytes(rest[8..].try_into().expect("4 bytes")),
            })
        }
        DataType::ObjectId => Mixed::ObjectId(ObjectId(rest.try_into().map_err(|_| bad())?)),
        DataType::Uuid => Mixed::Uuid(Uuid(rest.try_into().map_err(|_| bad())?)),
        DataType::Link => Mixed::Link(ObjKey(i64::from_le_bytes(
            rest.try_into().map_err(|_| bad())?,
        ))),
        DataType::TypedLink => {
            if rest.len() != 12 {
                return Err(bad());
            }
            Mixed::TypedLink(ObjLink::new(
                TableKey::from_raw(u32::from_le_bytes(rest[..4].try_into().expect("4 bytes"))),
                ObjKey(i64::from_le_bytes(rest[4..].try_into().expect("8 bytes"))),
            ))
        }
        DataType::Mixed => return Err(bad()),
    })
}

/// Raw collection-tree ref stored in a collection column element.
#[must_use]
pub fn collection_ref(raw: u64) -> Ref {
    match RefOrTagged::unpack(raw) {
        RefOrTagged::Ref(r) => r,
        RefOrTagged::Tagged(_) => Ref::NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_types::ColumnAttr;

    fn col(dt: DataType, attrs: ColumnAttr) -> ColKey {
        ColKey::new(0, dt, attrs)
    }

    fn round_trip(alloc: &mut SlabAlloc, ck: ColKey, value: &Mixed) -> Mixed {
        let raw = encode(alloc, ck, value).unwrap();
        decode(alloc, ck, raw).unwrap()
    }

    #[test]
    fn int_zigzag_keeps_small_magnitudes_narrow() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        for v in [0_i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    #[test]
    fn nullable_int_inline_and_overflow() {
        let mut alloc = SlabAlloc::new_scratch();
        let ck = col(DataType::Int, ColumnAttr::NULLABLE);
        assert_eq!(round_trip(&mut alloc, ck, &Mixed::Null), Mixed::Null);
        assert_eq!(round_trip(&mut alloc, ck, &Mixed::Int(42)), Mixed::Int(42));
        assert_eq!(
            round_trip(&mut alloc, ck, &Mixed::Int(i64::MAX)),
            Mixed::Int(i64::MAX),
            "values past 63 bits go through an overflow blob"
        );
        assert_eq!(
            round_trip(&mut alloc, ck, &Mixed::Int(i64::MIN)),
            Mixed::Int(i64::MIN)
        );
    }

    #[test]
    fn null_rejected_on_non_nullable() {
        let mut alloc = SlabAlloc::new_scratch();
        let ck = col(DataType::Int, ColumnAttr::empty());
        assert!(encode(&mut alloc, ck, &Mixed::Null).is_err());
    }

    #[test]
    fn double_nan_and_infinity_survive() {
        let mut alloc = SlabAlloc::new_scratch();
        let ck = col(DataType::Double, ColumnAttr::NULLABLE);
        assert_eq!(round_trip(&mut alloc, ck, &Mixed::Null), Mixed::Null);
        match round_trip(&mut alloc, ck, &Mixed::Double(f64::NAN)) {
            Mixed::Double(v) => assert!(v.is_nan(), "NaN must not decode as null"),
            other => panic!("expected double, got {other:?}"),
        }
        assert_eq!(
            round_trip(&mut alloc, ck, &Mixed::Double(f64::INFINITY)),
            Mixed::Double(f64::INFINITY)
        );
        assert_eq!(
            round_trip(&mut alloc, ck, &Mixed::Double(f64::NEG_INFINITY)),
            Mixed::Double(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn empty_string_distinct_from_null() {
        let mut alloc = SlabAlloc::new_scratch();
        let ck = col(DataType::String, ColumnAttr::NULLABLE);
        assert_eq!(
            round_trip(&mut alloc, ck, &Mixed::from("")),
            Mixed::from("")
        );
        assert_eq!(round_trip(&mut alloc, ck, &Mixed::Null), Mixed::Null);
    }

    #[test]
    fn link_encoding() {
        let mut alloc = SlabAlloc::new_scratch();
        let ck = col(DataType::Link, ColumnAttr::NULLABLE);
        assert_eq!(
            round_trip(&mut alloc, ck, &Mixed::Link(ObjKey(0))),
            Mixed::Link(ObjKey(0)),
            "key zero is a real link, not null"
        );
        assert_eq!(round_trip(&mut alloc, ck, &Mixed::Null), Mixed::Null);
    }

    #[test]
    fn timestamp_and_uuid_round_trip() {
        let mut alloc = SlabAlloc::new_scratch();
        let ts = Mixed::Timestamp(Timestamp::new(-62_135_596_800, 999_999_999));
        assert_eq!(
            round_trip(
                &mut alloc,
                col(DataType::Timestamp, ColumnAttr::NULLABLE),
                &ts
            ),
            ts
        );
        let uuid = Mixed::Uuid(Uuid(*b"0123456789abcdef"));
        assert_eq!(
            round_trip(&mut alloc, col(DataType::Uuid, ColumnAttr::NULLABLE), &uuid),
            uuid
        );
    }

    #[test]
    fn mixed_column_round_trip() {
        let mut alloc = SlabAlloc::new_scratch();
        let ck = col(DataType::Mixed, ColumnAttr::NULLABLE);
        for v in [
            Mixed::Int(-5),
            Mixed::Bool(true),
            Mixed::from("text"),
            Mixed::Double(2.5),
            Mixed::Link(ObjKey(9)),
        ] {
            assert_eq!(round_trip(&mut alloc, ck, &v), v);
        }
    }

    #[test]
    fn free_raw_releases_blobs() {
        let mut alloc = SlabAlloc::new_scratch();
        let ck = col(DataType::String, ColumnAttr::NULLABLE);
        let raw = encode(&mut alloc, ck, &Mixed::from("transient")).unwrap();
        free_raw(&mut alloc, ck, raw).unwrap();
        let r = collection_ref(raw);
        assert!(alloc.free_space_snapshot().iter().any(|e| e.pos == r.get()));
    }
}
