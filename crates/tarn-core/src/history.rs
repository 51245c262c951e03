//! Synchronization history: an ordered store of opaque changeset blobs.
//!
//! When a history type is configured, commits carrying a changeset append
//! one blob. The store is a B+tree whose first element is the tagged base
//! version; entry `i` holds the changeset that produced version
//! `base + i`. The blob wire format belongs to the sync layer and is
//! opaque here.

use tarn_alloc::SlabAlloc;
use tarn_error::{Result, TarnError};
use tarn_node::{BpTree, blob};
use tarn_types::{Ref, RefOrTagged, VersionId};

/// Create an empty history anchored at `base` (the first version the
/// next appended changeset will produce).
pub fn create(alloc: &mut SlabAlloc, base: VersionId) -> Result<Ref> {
    let mut tree = BpTree::create(alloc)?;
    tree.push(
        alloc,
        RefOrTagged::Tagged(i64::try_from(base.0).expect("version fits")).pack(),
    )?;
    Ok(tree.root_ref())
}

/// The base version of the history at `root`.
pub fn base_version(alloc: &SlabAlloc, root: Ref) -> Result<VersionId> {
    let tree = BpTree::from_ref(root);
    match RefOrTagged::unpack(tree.get(alloc, 0)?) {
        RefOrTagged::Tagged(v) => Ok(VersionId(v as u64)),
        RefOrTagged::Ref(_) => Err(TarnError::invalid_database(
            "history base slot holds a ref",
        )),
    }
}

/// Number of changesets stored.
pub fn changeset_count(alloc: &SlabAlloc, root: Ref) -> Result<u64> {
    Ok(BpTree::from_ref(root).size(alloc)? - 1)
}

/// Append one changeset blob; returns the new history root.
pub fn append(alloc: &mut SlabAlloc, root: Ref, changeset: &[u8]) -> Result<Ref> {
    let mut tree = BpTree::from_ref(root);
    let blob_ref = blob::create(alloc, changeset)?;
    tree.push(alloc, RefOrTagged::Ref(blob_ref).pack())?;
    Ok(tree.root_ref())
}

/// Read the changeset that produced `version`.
pub fn get(alloc: &SlabAlloc, root: Ref, version: VersionId) -> Result<Option<Vec<u8>>> {
    let base = base_version(alloc, root)?;
    if version < base {
        return Ok(None);
    }
    let idx = version.0 - base.0 + 1;
    let tree = BpTree::from_ref(root);
    if idx >= tree.size(alloc)? {
        return Ok(None);
    }
    match RefOrTagged::unpack(tree.get(alloc, idx)?) {
        RefOrTagged::Ref(r) if r.is_some() => Ok(Some(blob::read(alloc, r)?.to_vec())),
        _ => Ok(None),
    }
}

/// All changesets in version order.
pub fn all(alloc: &SlabAlloc, root: Ref) -> Result<Vec<Vec<u8>>> {
    let tree = BpTree::from_ref(root);
    let mut out = Vec::new();
    for idx in 1..tree.size(alloc)? {
        if let RefOrTagged::Ref(r) = RefOrTagged::unpack(tree.get(alloc, idx)?) {
            if r.is_some() {
                out.push(blob::read(alloc, r)?.to_vec());
            }
        }
    }
    Ok(out)
}

/// Free the history and its blobs.
pub fn destroy(alloc: &mut SlabAlloc, root: Ref) -> Result<()> {
    let tree = BpTree::from_ref(root);
    for idx in 1..tree.size(alloc)? {
        if let RefOrTagged::Ref(r) = RefOrTagged::unpack(tree.get(alloc, idx)?) {
            if r.is_some() {
                blob::free(alloc, r)?;
            }
        }
    }
    tree.destroy(alloc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let mut alloc = SlabAlloc::new_scratch();
        let mut root = create(&mut alloc, VersionId(10)).unwrap();
        root = append(&mut alloc, root, b"first").unwrap();
        root = append(&mut alloc, root, b"second").unwrap();
        assert_eq!(base_version(&alloc, root).unwrap(), VersionId(10));
        assert_eq!(changeset_count(&alloc, root).unwrap(), 2);
        assert_eq!(get(&alloc, root, VersionId(10)).unwrap().unwrap(), b"first");
        assert_eq!(get(&alloc, root, VersionId(11)).unwrap().unwrap(), b"second");
        assert_eq!(get(&alloc, root, VersionId(9)).unwrap(), None);
        assert_eq!(get(&alloc, root, VersionId(12)).unwrap(), None);
        assert_eq!(
            all(&alloc, root).unwrap(),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }
}
