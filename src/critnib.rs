//! Critnib: a path-compressed radix/critbit hybrid keyed by `usize`
//! addresses, offering both exact (`get`) and `<=`/`>=` (`find_le`/
//! `find_ge`) lookups. Reads are lock-free; writes are serialized by one
//! mutex.
//!
//! Grounded in `original_source/src/critnib.c`. Two deliberate departures
//! from the original, both named in `SPEC_FULL.md` §9:
//!
//! - The tagged-pointer trick (`(word)n & 1` to distinguish leaf from
//!   internal) is replaced by a `Node` sum type, matched on after an
//!   atomic load rather than inspected via pointer-bit games.
//! - Deleted nodes are never freed to the allocator while a reader could
//!   still be mid-walk over them. The original keeps this invariant with
//!   a fixed-size ring of raw pointers (`pending_del_nodes`/
//!   `pending_del_leaves`) plus a singly-linked immediate-reuse free list
//!   threaded through dead fields of the freed node itself. This crate
//!   keeps the same two-stage recycling (ring for the grace period, then
//!   an immediate-reuse pool) but holds both stages as plain `Vec`/array
//!   collections behind the writer mutex instead of repurposing live
//!   struct fields as linked-list pointers.
//!
//! `DELETED_LIFE` (how many deletes a stale reader can survive before it
//! must restart) is not given an explicit value in the headers this crate
//! was grounded on; 16 is carried over from the critnib implementation
//! this one descends from (used by pmdk, the project `critnib.c` itself
//! was adapted from).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, TierError};
use crate::slab::FastSlab;

const SLICE: u32 = 4;
const NIB: usize = 0xF;
const SLNODES: usize = 16;
const DELETED_LIFE: usize = 16;

enum Node {
    Internal {
        shift: u32,
        path: usize,
        child: [AtomicPtr<Node>; SLNODES],
    },
    Leaf {
        key: usize,
        value: AtomicUsize,
    },
}

fn path_mask(shift: u32) -> usize {
    !NIB << shift
}

fn slice_index(key: usize, shift: u32) -> usize {
    (key >> shift) & NIB
}

fn empty_children() -> [AtomicPtr<Node>; SLNODES] {
    std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut()))
}

fn is_leaf(n: *mut Node) -> bool {
    matches!(unsafe { &*n }, Node::Leaf { .. })
}

fn shift_of(n: *mut Node) -> u32 {
    match unsafe { &*n } {
        Node::Internal { shift, .. } => *shift,
        Node::Leaf { .. } => unreachable!("shift_of called on a leaf"),
    }
}

fn child_slot(n: *mut Node, idx: usize) -> *const AtomicPtr<Node> {
    match unsafe { &*n } {
        Node::Internal { child, .. } => &child[idx] as *const AtomicPtr<Node>,
        Node::Leaf { .. } => unreachable!("child_slot called on a leaf"),
    }
}

struct Writer {
    free_pool: Vec<NonNull<Node>>,
    pending_del_nodes: [Option<NonNull<Node>>; DELETED_LIFE],
    pending_del_leaves: [Option<NonNull<Node>>; DELETED_LIFE],
}

pub struct Critnib {
    root: AtomicPtr<Node>,
    remove_count: AtomicU64,
    writer: Mutex<Writer>,
    node_alloc: FastSlab,
}

unsafe impl Send for Critnib {}
unsafe impl Sync for Critnib {}

impl Critnib {
    pub fn new() -> Result<Self> {
        Ok(Critnib {
            root: AtomicPtr::new(std::ptr::null_mut()),
            remove_count: AtomicU64::new(0),
            writer: Mutex::new(Writer {
                free_pool: Vec::new(),
                pending_del_nodes: [None; DELETED_LIFE],
                pending_del_leaves: [None; DELETED_LIFE],
            }),
            node_alloc: FastSlab::new(std::mem::size_of::<Node>(), 0)?,
        })
    }

    fn alloc(&self, w: &mut Writer, value: Node) -> Result<NonNull<Node>> {
        if let Some(n) = w.free_pool.pop() {
            unsafe { n.as_ptr().write(value) };
            return Ok(n);
        }
        let mem = self.node_alloc.malloc()?;
        let n = mem.cast::<Node>();
        unsafe { n.as_ptr().write(value) };
        Ok(n)
    }

    /// Writes key: value. `update`: overwrite if the key already exists
    /// instead of returning `TierError::Exists`.
    pub fn insert(&self, key: usize, value: usize, update: bool) -> Result<()> {
        let mut w = self.writer.lock();

        let leaf = self.alloc(&mut w, Node::Leaf { key, value: AtomicUsize::new(value) })?;

        let mut n = self.root.load(Ordering::Acquire);
        if n.is_null() {
            self.root.store(leaf.as_ptr(), Ordering::Release);
            return Ok(());
        }

        let mut parent: *const AtomicPtr<Node> = &self.root;
        let mut prev = n;

        while !n.is_null() && !is_leaf(n) && (key & path_mask(shift_of(n))) == internal_path(n) {
            prev = n;
            let idx = slice_index(key, shift_of(n));
            parent = child_slot(n, idx);
            n = unsafe { (*parent).load(Ordering::Acquire) };
        }

        if n.is_null() {
            let idx = slice_index(key, shift_of(prev));
            unsafe { (*child_slot(prev, idx)).store(leaf.as_ptr(), Ordering::Release) };
            return Ok(());
        }

        let path = if is_leaf(n) { leaf_key(n) } else { internal_path(n) };
        let at = path ^ key;
        if at == 0 {
            w.free_pool.push(leaf);
            if update {
                if let Node::Leaf { value: v, .. } = unsafe { &*n } {
                    v.store(value, Ordering::Release);
                }
                return Ok(());
            }
            return Err(TierError::Exists);
        }

        let sh = (usize::BITS - 1 - at.leading_zeros()) & !(SLICE - 1);
        let m = match self.alloc(
            &mut w,
            Node::Internal { shift: sh, path: key & path_mask(sh), child: empty_children() },
        ) {
            Ok(m) => m,
            Err(e) => {
                w.free_pool.push(leaf);
                return Err(e);
            }
        };
        if let Node::Internal { child, .. } = unsafe { &*m.as_ptr() } {
            child[slice_index(key, sh)].store(leaf.as_ptr(), Ordering::Relaxed);
            child[slice_index(path, sh)].store(n, Ordering::Relaxed);
        }
        unsafe { (*parent).store(m.as_ptr(), Ordering::Release) };

        Ok(())
    }

    pub fn remove(&self, key: usize) -> Option<usize> {
        let mut w = self.writer.lock();

        let n = self.root.load(Ordering::Acquire);
        if n.is_null() {
            return None;
        }

        let del = (self.remove_count.fetch_add(1, Ordering::AcqRel) % DELETED_LIFE as u64) as usize;
        if let Some(evicted) = w.pending_del_nodes[del].take() {
            w.free_pool.push(evicted);
        }
        if let Some(evicted) = w.pending_del_leaves[del].take() {
            w.free_pool.push(evicted);
        }

        if is_leaf(n) {
            if leaf_key(n) != key {
                return None;
            }
            self.root.store(std::ptr::null_mut(), Ordering::Release);
            let value = leaf_value(n);
            w.pending_del_leaves[del] = NonNull::new(n);
            return Some(value);
        }

        let mut k_parent: *const AtomicPtr<Node> = &self.root;
        let mut n_parent: *const AtomicPtr<Node> = &self.root;
        let mut n_cur = n;
        let mut kn = n;

        loop {
            if is_leaf(kn) {
                break;
            }
            n_parent = k_parent;
            n_cur = kn;
            let idx = slice_index(key, shift_of(n_cur));
            k_parent = child_slot(n_cur, idx);
            kn = unsafe { (*k_parent).load(Ordering::Acquire) };
            if kn.is_null() {
                return None;
            }
        }

        if leaf_key(kn) != key {
            return None;
        }
        let value = leaf_value(kn);

        unsafe { (*k_parent).store(std::ptr::null_mut(), Ordering::Release) };

        let mut only_child = None;
        let mut multiple = false;
        if let Node::Internal { child, .. } = unsafe { &*n_cur } {
            for (i, slot) in child.iter().enumerate() {
                if !slot.load(Ordering::Acquire).is_null() {
                    if only_child.is_some() {
                        multiple = true;
                        break;
                    }
                    only_child = Some(i);
                }
            }
        }

        if !multiple {
            let idx = only_child.expect("critnib: internal node left with no children");
            let replacement = unsafe { (*child_slot(n_cur, idx)).load(Ordering::Acquire) };
            unsafe { (*n_parent).store(replacement, Ordering::Release) };
            w.pending_del_nodes[del] = NonNull::new(n_cur);
        }

        w.pending_del_leaves[del] = NonNull::new(kn);
        Some(value)
    }

    /// Exact-match lookup. Lock-free; restarts if it observes more than
    /// `DELETED_LIFE` concurrent removes while walking.
    pub fn get(&self, key: usize) -> Option<usize> {
        loop {
            let wrs1 = self.remove_count.load(Ordering::Acquire);
            let mut n = self.root.load(Ordering::Acquire);
            while !n.is_null() && !is_leaf(n) {
                let idx = slice_index(key, shift_of(n));
                n = unsafe { (*child_slot(n, idx)).load(Ordering::Acquire) };
            }
            let res = if !n.is_null() && leaf_key(n) == key { Some(leaf_value(n)) } else { None };
            let wrs2 = self.remove_count.load(Ordering::Acquire);
            if wrs1 + DELETED_LIFE as u64 > wrs2 {
                return res;
            }
        }
    }

    pub fn find_le(&self, key: usize) -> Option<(usize, usize)> {
        loop {
            let wrs1 = self.remove_count.load(Ordering::Acquire);
            let n = self.root.load(Ordering::Acquire);
            let res = if n.is_null() { None } else { find_le(n, key) };
            let wrs2 = self.remove_count.load(Ordering::Acquire);
            if wrs1 + DELETED_LIFE as u64 > wrs2 {
                return res;
            }
        }
    }

    pub fn find_ge(&self, key: usize) -> Option<(usize, usize)> {
        loop {
            let wrs1 = self.remove_count.load(Ordering::Acquire);
            let n = self.root.load(Ordering::Acquire);
            let res = if n.is_null() { None } else { find_ge(n, key) };
            let wrs2 = self.remove_count.load(Ordering::Acquire);
            if wrs1 + DELETED_LIFE as u64 > wrs2 {
                return res;
            }
        }
    }

    /// Visits every `(key, value)` pair with `min <= key <= max`, in
    /// ascending key order. Takes the writer lock, same as the original's
    /// `critnib_iter`.
    pub fn iter(&self, min: usize, max: usize, mut func: impl FnMut(usize, usize)) {
        let w = self.writer.lock();
        let root = self.root.load(Ordering::Acquire);
        if !root.is_null() {
            iter_node(root, min, max, &mut func);
        }
        drop(w);
    }
}

fn internal_path(n: *mut Node) -> usize {
    match unsafe { &*n } {
        Node::Internal { path, .. } => *path,
        Node::Leaf { .. } => unreachable!("internal_path called on a leaf"),
    }
}

fn leaf_key(n: *mut Node) -> usize {
    match unsafe { &*n } {
        Node::Leaf { key, .. } => *key,
        Node::Internal { .. } => unreachable!("leaf_key called on an internal node"),
    }
}

fn leaf_value(n: *mut Node) -> usize {
    match unsafe { &*n } {
        Node::Leaf { value, .. } => value.load(Ordering::Acquire),
        Node::Internal { .. } => unreachable!("leaf_value called on an internal node"),
    }
}

fn find_predecessor(n: *mut Node) -> Option<(usize, usize)> {
    let mut n = n;
    loop {
        let nib = match unsafe { &*n } {
            Node::Internal { child, .. } => {
                (0..SLNODES).rev().find(|&i| !child[i].load(Ordering::Acquire).is_null())
            }
            Node::Leaf { .. } => unreachable!(),
        }?;
        n = child_slot(n, nib);
        let n_loaded = unsafe { (*n).load(Ordering::Acquire) };
        if is_leaf(n_loaded) {
            return Some((leaf_key(n_loaded), leaf_value(n_loaded)));
        }
        n = n_loaded;
    }
}

fn find_successor(n: *mut Node) -> Option<(usize, usize)> {
    let mut n = n;
    loop {
        let nib = match unsafe { &*n } {
            Node::Internal { child, .. } => {
                (0..SLNODES).find(|&i| !child[i].load(Ordering::Acquire).is_null())
            }
            Node::Leaf { .. } => unreachable!(),
        }?;
        n = child_slot(n, nib);
        let n_loaded = unsafe { (*n).load(Ordering::Acquire) };
        if is_leaf(n_loaded) {
            return Some((leaf_key(n_loaded), leaf_value(n_loaded)));
        }
        n = n_loaded;
    }
}

fn find_le(n: *mut Node, key: usize) -> Option<(usize, usize)> {
    if n.is_null() {
        return None;
    }
    if is_leaf(n) {
        return if leaf_key(n) <= key { Some((leaf_key(n), leaf_value(n))) } else { None };
    }
    let path = internal_path(n);
    let shift = shift_of(n);
    if ((key ^ path) >> shift) & !NIB != 0 {
        return if path < key { find_predecessor(n) } else { None };
    }

    let nib = slice_index(key, shift);
    let m = unsafe { (*child_slot(n, nib)).load(Ordering::Acquire) };
    if let Some(found) = find_le(m, key) {
        return Some(found);
    }

    for i in (0..nib).rev() {
        let m = unsafe { (*child_slot(n, i)).load(Ordering::Acquire) };
        if !m.is_null() {
            return if is_leaf(m) { Some((leaf_key(m), leaf_value(m))) } else { find_predecessor(m) };
        }
    }

    None
}

fn find_ge(n: *mut Node, key: usize) -> Option<(usize, usize)> {
    if n.is_null() {
        return None;
    }
    if is_leaf(n) {
        return if leaf_key(n) >= key { Some((leaf_key(n), leaf_value(n))) } else { None };
    }
    let path = internal_path(n);
    let shift = shift_of(n);
    if ((key ^ path) >> shift) & !NIB != 0 {
        return if path > key { find_successor(n) } else { None };
    }

    let nib = slice_index(key, shift);
    let m = unsafe { (*child_slot(n, nib)).load(Ordering::Acquire) };
    if let Some(found) = find_ge(m, key) {
        return Some(found);
    }

    for i in (nib + 1)..SLNODES {
        let m = unsafe { (*child_slot(n, i)).load(Ordering::Acquire) };
        if !m.is_null() {
            return if is_leaf(m) { Some((leaf_key(m), leaf_value(m))) } else { find_successor(m) };
        }
    }

    None
}

fn iter_node(n: *mut Node, min: usize, max: usize, func: &mut impl FnMut(usize, usize)) {
    if is_leaf(n) {
        let key = leaf_key(n);
        if key >= min && key <= max {
            func(key, leaf_value(n));
        }
        return;
    }
    let path = internal_path(n);
    let shift = shift_of(n);
    if path > max || (path | path_mask(shift)) < min {
        return;
    }
    if let Node::Internal { child, .. } = unsafe { &*n } {
        for slot in child {
            let m = slot.load(Ordering::Acquire);
            if !m.is_null() {
                iter_node(m, min, max, func);
            }
        }
    }
}

impl Drop for Critnib {
    fn drop(&mut self) {
        fn free_subtree(alloc: &FastSlab, n: *mut Node) {
            if n.is_null() {
                return;
            }
            if let Node::Internal { child, .. } = unsafe { &*n } {
                for slot in child {
                    free_subtree(alloc, slot.load(Ordering::Relaxed));
                }
            }
            unsafe { alloc.free(NonNull::new_unchecked(n as *mut u8)) };
        }

        free_subtree(&self.node_alloc, self.root.load(Ordering::Relaxed));

        let mut w = self.writer.lock();
        for slot in w.pending_del_nodes.iter_mut().chain(w.pending_del_leaves.iter_mut()) {
            if let Some(n) = slot.take() {
                unsafe { self.node_alloc.free(n.cast::<u8>()) };
            }
        }
        for n in w.free_pool.drain(..) {
            unsafe { self.node_alloc.free(n.cast::<u8>()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_roundtrip() {
        let c = Critnib::new().unwrap();
        for i in 0..1000usize {
            c.insert(i * 8, i * 2 + 1, false).unwrap();
        }
        for i in 0..1000usize {
            assert_eq!(c.get(i * 8), Some(i * 2 + 1));
        }
        assert_eq!(c.get(12345), None);
    }

    #[test]
    fn duplicate_insert_without_update_fails() {
        let c = Critnib::new().unwrap();
        c.insert(8, 1, false).unwrap();
        assert!(matches!(c.insert(8, 2, false), Err(TierError::Exists)));
        assert_eq!(c.get(8), Some(1));
    }

    #[test]
    fn duplicate_insert_with_update_overwrites() {
        let c = Critnib::new().unwrap();
        c.insert(8, 1, false).unwrap();
        c.insert(8, 2, true).unwrap();
        assert_eq!(c.get(8), Some(2));
    }

    #[test]
    fn remove_then_get_returns_none() {
        let c = Critnib::new().unwrap();
        c.insert(16, 99, false).unwrap();
        assert_eq!(c.remove(16), Some(99));
        assert_eq!(c.get(16), None);
        assert_eq!(c.remove(16), None);
    }

    #[test]
    fn find_le_and_find_ge() {
        let c = Critnib::new().unwrap();
        for key in [8usize, 16, 32, 64, 128] {
            c.insert(key, key, false).unwrap();
        }
        assert_eq!(c.find_le(40), Some((32, 32)));
        assert_eq!(c.find_le(8), Some((8, 8)));
        assert_eq!(c.find_le(4), None);
        assert_eq!(c.find_ge(40), Some((64, 64)));
        assert_eq!(c.find_ge(128), Some((128, 128)));
        assert_eq!(c.find_ge(200), None);
    }

    #[test]
    fn iter_visits_ascending_within_range() {
        let c = Critnib::new().unwrap();
        for key in [8usize, 800, 80, 8000, 8_000_000] {
            c.insert(key, key, false).unwrap();
        }
        let mut seen = Vec::new();
        c.iter(0, 9000, |k, _| seen.push(k));
        assert_eq!(seen, vec![8, 80, 800, 8000]);
    }

    #[test]
    fn survives_concurrent_churn_up_to_deleted_life() {
        use std::sync::Arc;

        let c = Arc::new(Critnib::new().unwrap());
        for i in 0..200usize {
            c.insert(i, i, false).unwrap();
        }

        std::thread::scope(|scope| {
            let reader = Arc::clone(&c);
            scope.spawn(move || {
                for _ in 0..500 {
                    for i in 0..200usize {
                        let _ = reader.get(i);
                    }
                }
            });

            let writer = Arc::clone(&c);
            scope.spawn(move || {
                for round in 0..(DELETED_LIFE * 4) {
                    let key = round % 200;
                    writer.remove(key);
                    writer.insert(key, key, false).unwrap();
                }
            });
        });
    }
}
