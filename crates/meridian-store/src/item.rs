//! MVCC items and the comparators derived from a key ordering.
//!
//! An item is an immutable payload plus two sequence tags bounding its
//! visibility window: `born_sn` is the store sequence number at insertion,
//! `dead_sn` is zero while live and set exactly once on logical deletion.
//! An item is visible to a snapshot `s` iff
//! `born_sn <= s && (dead_sn == 0 || dead_sn > s)`.

use std::cmp::Ordering;
use std::fmt;
use std::io::{Read, Write};
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use meridian_skiplist::CompareFn;

use crate::error::{Error, Result};

/// User-supplied ordering over raw keys.
pub type KeyComparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Comparator over items, shared by writers, iterators, and the reclaimer.
pub(crate) type ItemCmpFn = Arc<CompareFn<Item>>;

/// One MVCC version of a user key.
pub struct Item {
    data: Bytes,
    born_sn: u32,
    dead_sn: AtomicU32,
}

impl Item {
    /// Wraps a payload in an unstamped item.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            born_sn: 0,
            dead_sn: AtomicU32::new(0),
        }
    }

    /// The user payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The payload as shared bytes.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Sequence number at insertion.
    #[inline]
    pub fn born_sn(&self) -> u32 {
        self.born_sn
    }

    /// Sequence number at logical deletion; zero while live.
    #[inline]
    pub fn dead_sn(&self) -> u32 {
        self.dead_sn.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn stamp_born(&mut self, sn: u32) {
        self.born_sn = sn;
    }

    /// Stamps the death sequence number. Returns false if another delete
    /// already stamped it.
    pub(crate) fn mark_dead(&self, sn: u32) -> bool {
        self.dead_sn
            .compare_exchange(0, sn, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    /// Whether a snapshot with sequence number `sn` observes this item.
    #[inline]
    pub fn is_visible(&self, sn: u32) -> bool {
        let dead = self.dead_sn();
        self.born_sn <= sn && (dead == 0 || dead > sn)
    }

    /// In-memory footprint used for byte accounting.
    pub fn size(&self) -> usize {
        mem::size_of::<Self>() + self.data.len()
    }

    /// Writes `u16 length (big-endian) || payload`. A zero-length payload
    /// is legal. `buf` is caller scratch and must hold at least the length
    /// prefix.
    pub fn encode(&self, buf: &mut [u8], w: &mut impl Write) -> Result<()> {
        if buf.len() < 2 {
            return Err(Error::not_enough_space(2, buf.len()));
        }
        let len = self.data.len();
        if len > u16::MAX as usize {
            return Err(Error::not_enough_space(len, u16::MAX as usize));
        }
        buf[..2].copy_from_slice(&(len as u16).to_be_bytes());
        w.write_all(&buf[..2])?;
        w.write_all(&self.data)?;
        Ok(())
    }

    /// Reads one length-prefixed item. Sequence tags are not persisted;
    /// the decoded item is unstamped.
    pub fn decode(buf: &mut [u8], r: &mut impl Read) -> Result<Item> {
        if buf.len() < 2 {
            return Err(Error::not_enough_space(2, buf.len()));
        }
        r.read_exact(&mut buf[..2])?;
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if len == 0 {
            return Ok(Item::new(Bytes::new()));
        }
        let mut data = vec![0u8; len];
        r.read_exact(&mut data)?;
        Ok(Item::new(data))
    }
}

impl Clone for Item {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            born_sn: self.born_sn,
            dead_sn: AtomicU32::new(self.dead_sn()),
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("data_len", &self.data.len())
            .field("born_sn", &self.born_sn)
            .field("dead_sn", &self.dead_sn())
            .finish()
    }
}

/// Total order for the index: key order, with same-key versions adjacent
/// in ascending `born_sn`.
pub(crate) fn new_insert_compare(key_cmp: KeyComparator) -> ItemCmpFn {
    Arc::new(move |a: &Item, b: &Item| {
        key_cmp(a.data(), b.data()).then_with(|| a.born_sn().cmp(&b.born_sn()))
    })
}

/// Iteration order: same-key versions compare equal so readers collapse
/// them.
pub(crate) fn new_iter_compare(key_cmp: KeyComparator) -> ItemCmpFn {
    Arc::new(move |a: &Item, b: &Item| key_cmp(a.data(), b.data()))
}

/// Equality probe for inserts: two items are equal only when both are live
/// and carry the same key. A dead predecessor therefore never blocks a
/// re-insert, while a live one makes the put a duplicate.
pub(crate) fn new_exist_compare(key_cmp: KeyComparator) -> ItemCmpFn {
    Arc::new(move |a: &Item, b: &Item| {
        if a.dead_sn() != 0 || b.dead_sn() != 0 {
            Ordering::Greater
        } else {
            key_cmp(a.data(), b.data())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn lex_cmp() -> KeyComparator {
        Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
    }

    fn stamped(data: &[u8], born: u32, dead: u32) -> Item {
        let mut item = Item::new(Bytes::copy_from_slice(data));
        item.stamp_born(born);
        if dead != 0 {
            assert!(item.mark_dead(dead));
        }
        item
    }

    #[test]
    fn test_visibility_window() {
        let item = stamped(b"k", 3, 0);
        assert!(!item.is_visible(2));
        assert!(item.is_visible(3));
        assert!(item.is_visible(10));

        let item = stamped(b"k", 3, 7);
        assert!(item.is_visible(3));
        assert!(item.is_visible(6));
        assert!(!item.is_visible(7));
        assert!(!item.is_visible(9));
    }

    #[test]
    fn test_mark_dead_is_set_once() {
        let item = stamped(b"k", 1, 0);
        assert!(item.mark_dead(5));
        assert!(!item.mark_dead(6));
        assert_eq!(item.dead_sn(), 5);
    }

    #[test]
    fn test_codec_roundtrip() {
        let mut scratch = [0u8; 4];
        let mut out = Vec::new();
        let item = Item::new(Bytes::from_static(b"hello"));
        item.encode(&mut scratch, &mut out).unwrap();
        assert_eq!(out, [&[0, 5][..], b"hello"].concat());

        let decoded = Item::decode(&mut scratch, &mut Cursor::new(&out)).unwrap();
        assert_eq!(decoded.data(), b"hello");
        assert_eq!(decoded.born_sn(), 0);
    }

    #[test]
    fn test_codec_zero_length_item() {
        let mut scratch = [0u8; 4];
        let mut out = Vec::new();
        Item::new(Bytes::new()).encode(&mut scratch, &mut out).unwrap();
        assert_eq!(out, vec![0, 0]);

        let decoded = Item::decode(&mut scratch, &mut Cursor::new(&out)).unwrap();
        assert!(decoded.data().is_empty());
    }

    #[test]
    fn test_encode_rejects_short_buffer() {
        let mut scratch = [0u8; 1];
        let mut out = Vec::new();
        let err = Item::new(Bytes::from_static(b"x"))
            .encode(&mut scratch, &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::NotEnoughSpace { needed: 2, .. }));
    }

    #[test]
    fn test_insert_compare_orders_versions() {
        let cmp = new_insert_compare(lex_cmp());
        let v1 = stamped(b"a", 1, 0);
        let v2 = stamped(b"a", 2, 0);
        let other = stamped(b"b", 1, 0);

        assert_eq!(cmp(&v1, &v2), Ordering::Less);
        assert_eq!(cmp(&v2, &v1), Ordering::Greater);
        assert_eq!(cmp(&v1, &v1), Ordering::Equal);
        assert_eq!(cmp(&v2, &other), Ordering::Less);
    }

    #[test]
    fn test_iter_compare_collapses_versions() {
        let cmp = new_iter_compare(lex_cmp());
        let v1 = stamped(b"a", 1, 0);
        let v2 = stamped(b"a", 9, 3);
        assert_eq!(cmp(&v1, &v2), Ordering::Equal);
    }

    #[test]
    fn test_exist_compare_ignores_dead_versions() {
        let cmp = new_exist_compare(lex_cmp());
        let live = stamped(b"a", 1, 0);
        let dead = stamped(b"a", 1, 2);
        let fresh = stamped(b"a", 3, 0);

        assert_eq!(cmp(&fresh, &live), Ordering::Equal);
        assert_ne!(cmp(&fresh, &dead), Ordering::Equal);
    }
}
