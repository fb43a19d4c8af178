//! Key spaces inside one physical store.
//!
//! Both backends keep metadata and data records in a single ordered map and
//! tell them apart by a one-byte tag in front of every physical key. Tags are
//! ordered, so each key space is one contiguous range.

use std::ops::Bound;

/// Metadata records.
pub const META: u8 = 0x00;

/// Data records.
pub const DATA: u8 = 0x01;

/// Physical key for `key` in key space `ns`.
pub fn physical_key(ns: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.push(ns);
    out.extend_from_slice(key);
    out
}

/// Logical key of `physical`, or `None` if it belongs to another key space.
pub fn logical_key(ns: u8, physical: &[u8]) -> Option<&[u8]> {
    match physical.split_first() {
        Some((&tag, rest)) if tag == ns => Some(rest),
        _ => None,
    }
}

/// Translate a logical lower bound into the physical key space.
pub fn physical_bound(ns: u8, from: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match from {
        Bound::Included(key) => Bound::Included(physical_key(ns, key)),
        Bound::Excluded(key) => Bound::Excluded(physical_key(ns, key)),
        Bound::Unbounded => Bound::Included(vec![ns]),
    }
}

/// Borrow a physical bound for a lookup.
pub fn borrow_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}
