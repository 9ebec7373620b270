use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::sync::{Arc, Mutex};

use super::ops::NodeOps;
use crate::{Errno, FileType, Inode, Result};

pub(crate) const ROOT_INODE: Inode = 1;

/// automatic inode numbers are handed out sequentially from here, far above
/// anything a filesystem will assign itself.
const FIRST_AUTOMATIC_INODE: Inode = 1 << 63;

/// The identity of an inode, fixed for its whole life.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StableAttr {
    pub kind: FileType,
    pub ino: Inode,
    pub generation: u64,
}

/// nodes whose reachability ended as a side effect of a tree operation;
/// their `on_forget` must be fired after the table lock is gone.
pub(crate) type Forgotten = Vec<Arc<dyn NodeOps>>;

pub(crate) struct LookupOutcome {
    pub stable: StableAttr,
    pub is_new: bool,
    pub forgotten: Forgotten,
}

#[derive(Clone, Copy)]
struct ChildEdge {
    ino: Inode,
    persistent: bool,
}

/// name → child mapping which remembers insertion order, so directory
/// listings stay deterministic across concurrent readers.
#[derive(Default)]
struct Children {
    order: Vec<OsString>,
    map: HashMap<OsString, ChildEdge>,
}

impl Children {
    fn get(&self, name: &OsStr) -> Option<ChildEdge> {
        self.map.get(name).copied()
    }

    fn insert(&mut self, name: OsString, edge: ChildEdge) {
        if self.map.insert(name.clone(), edge).is_none() {
            self.order.push(name);
        }
    }

    fn remove(&mut self, name: &OsStr) -> Option<ChildEdge> {
        let edge = self.map.remove(name)?;
        self.order.retain(|existing| existing != name);

        Some(edge)
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&OsString, ChildEdge)> {
        self.order.iter().map(|name| (name, self.map[name]))
    }
}

struct InodeEntry {
    stable: StableAttr,
    lookup_count: u64,
    persistent: bool,
    children: Children,
    parents: HashSet<(Inode, OsString)>,
    ops: Arc<dyn NodeOps>,
}

struct TableInner {
    entries: HashMap<Inode, InodeEntry>,
    next_automatic_inode: Inode,
}

/// The authoritative representation of the mounted namespace: a graph of
/// inodes addressed by node id, with the lookup counts the kernel holds on
/// them.
///
/// All lookup-count and edge mutations happen under one lock, held only for
/// the duration of the tree operation itself; user callbacks never run with
/// it held. An inode leaves the table once its lookup count is zero, it is
/// not persistent, and it is no longer wired into the tree (invariant 3);
/// reaping cascades to parents that thereby become empty and forgotten, and
/// to orphaned non-persistent children of a detached subtree.
pub(crate) struct InodeTable {
    inner: Mutex<TableInner>,
}

impl InodeTable {
    pub fn new(root_ops: Arc<dyn NodeOps>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_INODE,
            InodeEntry {
                stable: StableAttr {
                    kind: FileType::Directory,
                    ino: ROOT_INODE,
                    generation: 0,
                },
                lookup_count: 0,
                persistent: true,
                children: Children::default(),
                parents: HashSet::new(),
                ops: root_ops,
            },
        );

        Self {
            inner: Mutex::new(TableInner {
                entries,
                next_automatic_inode: FIRST_AUTOMATIC_INODE,
            }),
        }
    }

    pub fn get_ops(&self, inode: Inode) -> Option<Arc<dyn NodeOps>> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&inode)
            .map(|entry| entry.ops.clone())
    }

    pub fn stable(&self, inode: Inode) -> Option<StableAttr> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&inode)
            .map(|entry| entry.stable)
    }

    pub fn contains(&self, inode: Inode) -> bool {
        self.inner.lock().unwrap().entries.contains_key(&inode)
    }

    #[cfg(test)]
    pub fn lookup_count(&self, inode: Inode) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&inode)
            .map(|entry| entry.lookup_count)
    }

    /// resolve an existing child and take one kernel reference on it; the
    /// default lookup path.
    pub fn lookup_child(
        &self,
        parent: Inode,
        name: &OsStr,
    ) -> Result<(StableAttr, Arc<dyn NodeOps>)> {
        let mut inner = self.inner.lock().unwrap();

        let edge = inner
            .entries
            .get(&parent)
            .ok_or_else(Errno::new_not_exist)?
            .children
            .get(name)
            .ok_or_else(Errno::new_not_exist)?;

        let child = inner
            .entries
            .get_mut(&edge.ino)
            .ok_or_else(Errno::new_not_exist)?;
        child.lookup_count += 1;

        Ok((child.stable, child.ops.clone()))
    }

    /// Insert the result of an entry-producing operation and take one
    /// kernel reference.
    ///
    /// An existing child bound to the same operations object (or to the
    /// same caller-supplied stable identity) is reused; otherwise the new
    /// attr wins and the old child is detached, surviving in the table as
    /// long as the kernel still references it. A caller-supplied inode
    /// number that is already in the table binds the existing inode under
    /// the new name, which is how hard links come into being.
    pub fn lookup_or_create(
        &self,
        parent: Inode,
        name: &OsStr,
        ops: Arc<dyn NodeOps>,
        kind: FileType,
        ino: Inode,
        generation: u64,
    ) -> Result<LookupOutcome> {
        let mut forgotten = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        let parent_entry = inner
            .entries
            .get(&parent)
            .ok_or_else(Errno::new_not_exist)?;
        if parent_entry.stable.kind != FileType::Directory {
            return Err(Errno::new_not_dir());
        }

        if let Some(edge) = parent_entry.children.get(name) {
            let existing = inner
                .entries
                .get_mut(&edge.ino)
                .expect("child edge points at a live inode");

            let same_ops = Arc::ptr_eq(&existing.ops, &ops);
            let same_identity = ino != 0 && ino == existing.stable.ino;

            if (same_ops || same_identity) && kind == existing.stable.kind {
                existing.lookup_count += 1;
                let stable = existing.stable;

                return Ok(LookupOutcome {
                    stable,
                    is_new: false,
                    forgotten,
                });
            }

            // the new attr wins and the old child is detached
            detach_edge(&mut inner, parent, name, &mut forgotten);
        }

        // a known stable identity rebinds the existing inode (hard link)
        if ino != 0 {
            if let Some(existing) = inner.entries.get_mut(&ino) {
                if existing.stable.kind != kind {
                    return Err(Errno::new_exist());
                }

                existing.lookup_count += 1;
                existing.parents.insert((parent, name.to_owned()));
                let stable = existing.stable;

                inner.entries.get_mut(&parent).unwrap().children.insert(
                    name.to_owned(),
                    ChildEdge {
                        ino,
                        persistent: false,
                    },
                );

                return Ok(LookupOutcome {
                    stable,
                    is_new: false,
                    forgotten,
                });
            }
        }

        let new_ino = if ino == 0 {
            let minted = inner.next_automatic_inode;
            inner.next_automatic_inode += 1;
            minted
        } else {
            ino
        };

        let stable = StableAttr {
            kind,
            ino: new_ino,
            generation,
        };

        let mut parents = HashSet::with_capacity(1);
        parents.insert((parent, name.to_owned()));

        inner.entries.insert(
            new_ino,
            InodeEntry {
                stable,
                lookup_count: 1,
                persistent: false,
                children: Children::default(),
                parents,
                ops,
            },
        );

        inner.entries.get_mut(&parent).unwrap().children.insert(
            name.to_owned(),
            ChildEdge {
                ino: new_ino,
                persistent: false,
            },
        );

        Ok(LookupOutcome {
            stable,
            is_new: true,
            forgotten,
        })
    }

    /// drop `nlookup` kernel references. Unknown inodes and `nlookup == 0`
    /// are no-ops; FORGET must never fail the session.
    pub fn forget(&self, inode: Inode, nlookup: u64) -> Forgotten {
        let mut forgotten = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        if let Some(entry) = inner.entries.get_mut(&inode) {
            entry.lookup_count = entry.lookup_count.saturating_sub(nlookup);

            if entry.lookup_count == 0 {
                reap(&mut inner, inode, &mut forgotten);
            }
        }

        forgotten
    }

    /// bind an existing inode as a child under a new name, without touching
    /// its lookup count. Used to build static trees and by rename.
    pub fn add_child(
        &self,
        parent: Inode,
        name: &OsStr,
        child: Inode,
        persistent: bool,
        overwrite: bool,
    ) -> Result<Forgotten> {
        let mut forgotten = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        let parent_entry = inner
            .entries
            .get(&parent)
            .ok_or_else(Errno::new_not_exist)?;
        if parent_entry.stable.kind != FileType::Directory {
            return Err(Errno::new_not_dir());
        }

        let existing = parent_entry.children.get(name);
        if existing.is_some() && !overwrite {
            return Err(Errno::new_exist());
        }

        // rebinding the same child under the same name only updates flags
        if existing.map(|edge| edge.ino) == Some(child) {
            let child_entry = inner.entries.get_mut(&child).unwrap();
            if persistent {
                child_entry.persistent = true;
            }

            inner
                .entries
                .get_mut(&parent)
                .unwrap()
                .children
                .insert(name.to_owned(), ChildEdge { ino: child, persistent });

            return Ok(forgotten);
        }

        let child_entry = inner.entries.get(&child).ok_or_else(Errno::new_not_exist)?;
        if child_entry.stable.kind == FileType::Directory && !child_entry.parents.is_empty() {
            // directories have at most one parent
            return Err(Errno(libc::EPERM));
        }

        if existing.is_some() {
            detach_edge(&mut inner, parent, name, &mut forgotten);
        }

        let child_entry = inner.entries.get_mut(&child).unwrap();
        child_entry.parents.insert((parent, name.to_owned()));
        if persistent {
            child_entry.persistent = true;
        }

        inner
            .entries
            .get_mut(&parent)
            .unwrap()
            .children
            .insert(name.to_owned(), ChildEdge { ino: child, persistent });

        Ok(forgotten)
    }

    /// remove the edge. A hard-linked child survives through its other
    /// parents; otherwise it becomes eligible for reaping.
    pub fn rm_child(&self, parent: Inode, name: &OsStr) -> Result<Forgotten> {
        let mut forgotten = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        inner
            .entries
            .get(&parent)
            .ok_or_else(Errno::new_not_exist)?
            .children
            .get(name)
            .ok_or_else(Errno::new_not_exist)?;

        unlink_edge(&mut inner, parent, name, &mut forgotten);

        Ok(forgotten)
    }

    /// move or exchange a child, atomically under the tree lock.
    pub fn mv_child(
        &self,
        parent: Inode,
        name: &OsStr,
        new_parent: Inode,
        new_name: &OsStr,
        exchange: bool,
        overwrite: bool,
    ) -> Result<Forgotten> {
        let mut forgotten = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        let source = inner
            .entries
            .get(&parent)
            .ok_or_else(Errno::new_not_exist)?
            .children
            .get(name)
            .ok_or_else(Errno::new_not_exist)?;

        let target_parent = inner
            .entries
            .get(&new_parent)
            .ok_or_else(Errno::new_not_exist)?;
        if target_parent.stable.kind != FileType::Directory {
            return Err(Errno::new_not_dir());
        }
        let target = target_parent.children.get(new_name);

        if exchange {
            let target = target.ok_or_else(Errno::new_not_exist)?;

            // exchanging two names of the same inode changes nothing
            if target.ino == source.ino {
                return Ok(forgotten);
            }

            // swap the two bindings in place; lookup counts are untouched
            inner
                .entries
                .get_mut(&parent)
                .unwrap()
                .children
                .insert(name.to_owned(), ChildEdge { ino: target.ino, ..source });
            inner
                .entries
                .get_mut(&new_parent)
                .unwrap()
                .children
                .insert(new_name.to_owned(), ChildEdge { ino: source.ino, ..target });

            let source_entry = inner.entries.get_mut(&source.ino).unwrap();
            source_entry.parents.remove(&(parent, name.to_owned()));
            source_entry.parents.insert((new_parent, new_name.to_owned()));

            let target_entry = inner.entries.get_mut(&target.ino).unwrap();
            target_entry.parents.remove(&(new_parent, new_name.to_owned()));
            target_entry.parents.insert((parent, name.to_owned()));

            return Ok(forgotten);
        }

        if target.is_some() {
            if !overwrite {
                return Err(Errno::new_exist());
            }

            detach_edge(&mut inner, new_parent, new_name, &mut forgotten);
        }

        inner.entries.get_mut(&parent).unwrap().children.remove(name);
        inner
            .entries
            .get_mut(&new_parent)
            .unwrap()
            .children
            .insert(new_name.to_owned(), source);

        let child = inner.entries.get_mut(&source.ino).unwrap();
        child.parents.remove(&(parent, name.to_owned()));
        child.parents.insert((new_parent, new_name.to_owned()));

        reap(&mut inner, parent, &mut forgotten);

        Ok(forgotten)
    }

    /// snapshot of a directory for the default readdir: ".", "..", then the
    /// children in insertion order.
    pub fn dir_entries(&self, parent: Inode) -> Result<Vec<(OsString, Inode, FileType)>> {
        let inner = self.inner.lock().unwrap();

        let parent_entry = inner
            .entries
            .get(&parent)
            .ok_or_else(Errno::new_not_exist)?;
        if parent_entry.stable.kind != FileType::Directory {
            return Err(Errno::new_not_dir());
        }

        let grand_parent = parent_entry
            .parents
            .iter()
            .next()
            .map(|(ino, _)| *ino)
            .unwrap_or(parent);

        let mut entries = vec![
            (OsString::from("."), parent, FileType::Directory),
            (OsString::from(".."), grand_parent, FileType::Directory),
        ];

        for (name, edge) in parent_entry.children.iter() {
            let kind = inner
                .entries
                .get(&edge.ino)
                .map(|child| child.stable.kind)
                .unwrap_or(FileType::RegularFile);

            entries.push((name.clone(), edge.ino, kind));
        }

        Ok(entries)
    }

    /// empty the table on shutdown; every node's `on_forget` fires.
    pub fn clear(&self) -> Forgotten {
        let mut inner = self.inner.lock().unwrap();

        inner.next_automatic_inode = FIRST_AUTOMATIC_INODE;

        inner
            .entries
            .drain()
            .map(|(_, entry)| entry.ops)
            .collect()
    }

    #[cfg(test)]
    fn assert_edges_consistent(&self) {
        let inner = self.inner.lock().unwrap();

        for (ino, entry) in &inner.entries {
            for (name, edge) in entry.children.iter() {
                let child = inner
                    .entries
                    .get(&edge.ino)
                    .unwrap_or_else(|| panic!("child {} of {} is gone", edge.ino, ino));
                assert!(
                    child.parents.contains(&(*ino, name.clone())),
                    "missing back edge {} -> {:?}",
                    ino,
                    name
                );
            }

            for (parent, name) in &entry.parents {
                let forward = inner
                    .entries
                    .get(parent)
                    .and_then(|parent_entry| parent_entry.children.get(name));
                assert_eq!(
                    forward.map(|edge| edge.ino),
                    Some(*ino),
                    "missing forward edge {} -> {:?}",
                    parent,
                    name
                );
            }
        }
    }
}

/// remove one parent→child edge, reaping only the detached child. Used
/// where the parent is about to gain a replacement edge and must stay put.
fn detach_edge(inner: &mut TableInner, parent: Inode, name: &OsStr, forgotten: &mut Forgotten) {
    let edge = match inner
        .entries
        .get_mut(&parent)
        .and_then(|parent_entry| parent_entry.children.remove(name))
    {
        None => return,
        Some(edge) => edge,
    };

    if let Some(child) = inner.entries.get_mut(&edge.ino) {
        child.parents.remove(&(parent, name.to_owned()));
    }

    reap(inner, edge.ino, forgotten);
}

/// remove one parent→child edge and reap whatever became unreachable on
/// either side.
fn unlink_edge(inner: &mut TableInner, parent: Inode, name: &OsStr, forgotten: &mut Forgotten) {
    detach_edge(inner, parent, name, forgotten);
    reap(inner, parent, forgotten);
}

/// Remove every inode reachable from `start` that satisfies invariant 3,
/// cascading both ways: to parents that became empty while already
/// forgotten, and down a detached subtree to orphaned children.
fn reap(inner: &mut TableInner, start: Inode, forgotten: &mut Forgotten) {
    let mut worklist = vec![start];

    while let Some(ino) = worklist.pop() {
        let eligible = match inner.entries.get(&ino) {
            None => false,
            Some(entry) => {
                ino != ROOT_INODE
                    && !entry.persistent
                    && entry.lookup_count == 0
                    && (entry.children.is_empty() || entry.parents.is_empty())
            }
        };

        if !eligible {
            continue;
        }

        let entry = inner.entries.remove(&ino).unwrap();

        for (parent, name) in &entry.parents {
            if let Some(parent_entry) = inner.entries.get_mut(parent) {
                if parent_entry
                    .children
                    .get(name)
                    .map(|edge| edge.ino == ino)
                    .unwrap_or(false)
                {
                    parent_entry.children.remove(name);
                    worklist.push(*parent);
                }
            }
        }

        for (name, edge) in entry.children.iter() {
            if let Some(child) = inner.entries.get_mut(&edge.ino) {
                child.parents.remove(&(ino, name.clone()));
                worklist.push(edge.ino);
            }
        }

        forgotten.push(entry.ops);
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct TestNode {
        forgets: AtomicUsize,
    }

    impl TestNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                forgets: AtomicUsize::new(0),
            })
        }
    }

    impl NodeOps for TestNode {
        fn on_forget(&self) {
            self.forgets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fire(forgotten: Forgotten) {
        for ops in forgotten {
            ops.on_forget();
        }
    }

    fn create(table: &InodeTable, parent: Inode, name: &str, kind: FileType) -> StableAttr {
        let outcome = table
            .lookup_or_create(parent, OsStr::new(name), TestNode::new(), kind, 0, 0)
            .unwrap();
        assert!(outcome.is_new);
        assert!(outcome.forgotten.is_empty());

        outcome.stable
    }

    #[test]
    fn lookup_forget_arithmetic() {
        let table = InodeTable::new(TestNode::new());

        let node = TestNode::new();
        let first = table
            .lookup_or_create(
                ROOT_INODE,
                OsStr::new("a"),
                node.clone(),
                FileType::Directory,
                0,
                0,
            )
            .unwrap();
        assert!(first.is_new);
        assert_eq!(table.lookup_count(first.stable.ino), Some(1));

        // a second lookup of the same ops object reuses the inode
        let second = table
            .lookup_or_create(
                ROOT_INODE,
                OsStr::new("a"),
                node,
                FileType::Directory,
                0,
                0,
            )
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.stable.ino, first.stable.ino);
        assert_eq!(table.lookup_count(first.stable.ino), Some(2));

        // net of increments and decrements
        fire(table.forget(first.stable.ino, 1));
        assert_eq!(table.lookup_count(first.stable.ino), Some(1));

        fire(table.forget(first.stable.ino, 1));
        assert!(!table.contains(first.stable.ino));

        table.assert_edges_consistent();
    }

    #[test]
    fn forget_is_noop_for_zero_and_unknown() {
        let table = InodeTable::new(TestNode::new());

        let stable = create(&table, ROOT_INODE, "a", FileType::RegularFile);

        fire(table.forget(stable.ino, 0));
        assert!(table.contains(stable.ino));
        assert_eq!(table.lookup_count(stable.ino), Some(1));

        fire(table.forget(424242, 1));
        assert!(table.contains(stable.ino));
    }

    #[test]
    fn static_tree_survives_forget() {
        // mount a tree containing /a/b (persistent), look both up, forget
        // both; the nodes stay in the table at lookup count zero
        let table = InodeTable::new(TestNode::new());

        let a = create(&table, ROOT_INODE, "a", FileType::Directory);
        let b = create(&table, a.ino, "b", FileType::RegularFile);

        fire(table.add_child(ROOT_INODE, OsStr::new("a"), a.ino, true, true).unwrap());
        fire(table.add_child(a.ino, OsStr::new("b"), b.ino, true, true).unwrap());

        fire(table.forget(b.ino, 1));
        fire(table.forget(a.ino, 1));

        assert!(table.contains(a.ino));
        assert!(table.contains(b.ino));
        assert_eq!(table.lookup_count(a.ino), Some(0));
        assert_eq!(table.lookup_count(b.ino), Some(0));

        table.assert_edges_consistent();
    }

    #[test]
    fn dynamic_tree_reaps_on_forget() {
        let table = InodeTable::new(TestNode::new());

        let a = create(&table, ROOT_INODE, "a", FileType::Directory);
        let b = create(&table, a.ino, "b", FileType::RegularFile);

        fire(table.forget(b.ino, 1));
        assert!(!table.contains(b.ino));
        assert!(table.contains(a.ino));

        fire(table.forget(a.ino, 1));
        assert!(!table.contains(a.ino));

        table.assert_edges_consistent();
    }

    #[test]
    fn forgotten_dir_waits_for_children() {
        // a directory forgotten while it still has a cached child is
        // reaped once the child goes away
        let table = InodeTable::new(TestNode::new());

        let dir = create(&table, ROOT_INODE, "dir", FileType::Directory);
        let file = create(&table, dir.ino, "file", FileType::RegularFile);

        fire(table.forget(dir.ino, 1));
        assert!(table.contains(dir.ino));

        fire(table.forget(file.ino, 1));
        assert!(!table.contains(file.ino));
        assert!(!table.contains(dir.ino));

        table.assert_edges_consistent();
    }

    #[test]
    fn hard_link_survives_single_unlink() {
        let table = InodeTable::new(TestNode::new());

        let node = TestNode::new();
        let first = table
            .lookup_or_create(
                ROOT_INODE,
                OsStr::new("one"),
                node.clone(),
                FileType::RegularFile,
                0,
                0,
            )
            .unwrap();

        // binding the same stable identity under a second name hard-links it
        let second = table
            .lookup_or_create(
                ROOT_INODE,
                OsStr::new("two"),
                node.clone(),
                FileType::RegularFile,
                first.stable.ino,
                0,
            )
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.stable.ino, first.stable.ino);
        assert_eq!(table.lookup_count(first.stable.ino), Some(2));

        fire(table.rm_child(ROOT_INODE, OsStr::new("one")).unwrap());
        assert!(table.contains(first.stable.ino));

        fire(table.rm_child(ROOT_INODE, OsStr::new("two")).unwrap());
        // kernel still references it
        assert!(table.contains(first.stable.ino));

        fire(table.forget(first.stable.ino, 2));
        assert!(!table.contains(first.stable.ino));
        assert_eq!(node.forgets.load(Ordering::SeqCst), 1);

        table.assert_edges_consistent();
    }

    #[test]
    fn new_attr_wins_and_detaches_old_child() {
        let table = InodeTable::new(TestNode::new());

        let old = create(&table, ROOT_INODE, "name", FileType::RegularFile);

        let replacement = table
            .lookup_or_create(
                ROOT_INODE,
                OsStr::new("name"),
                TestNode::new(),
                FileType::RegularFile,
                0,
                0,
            )
            .unwrap();
        assert!(replacement.is_new);
        assert_ne!(replacement.stable.ino, old.ino);

        // the old child is detached but not destroyed: the kernel still
        // holds a reference
        assert!(table.contains(old.ino));
        fire(table.forget(old.ino, 1));
        assert!(!table.contains(old.ino));

        table.assert_edges_consistent();
    }

    #[test]
    fn mv_child_exchange_swaps_bindings() {
        let table = InodeTable::new(TestNode::new());

        let dir_a = create(&table, ROOT_INODE, "A", FileType::Directory);
        let dir_b = create(&table, ROOT_INODE, "B", FileType::Directory);
        let x = create(&table, dir_a.ino, "x", FileType::RegularFile);
        let y = create(&table, dir_b.ino, "y", FileType::RegularFile);

        let forgotten = table
            .mv_child(dir_a.ino, OsStr::new("x"), dir_b.ino, OsStr::new("y"), true, false)
            .unwrap();
        // no reaping occurs
        assert!(forgotten.is_empty());

        let (x_now, _) = table.lookup_child(dir_a.ino, OsStr::new("x")).unwrap();
        let (y_now, _) = table.lookup_child(dir_b.ino, OsStr::new("y")).unwrap();
        assert_eq!(x_now.ino, y.ino);
        assert_eq!(y_now.ino, x.ino);

        // counts: one from creation, one from the lookup just above
        assert_eq!(table.lookup_count(x.ino), Some(2));
        assert_eq!(table.lookup_count(y.ino), Some(2));

        table.assert_edges_consistent();
    }

    #[test]
    fn mv_child_overwrite_detaches_target() {
        let table = InodeTable::new(TestNode::new());

        let x = create(&table, ROOT_INODE, "x", FileType::RegularFile);
        let y = create(&table, ROOT_INODE, "y", FileType::RegularFile);

        assert!(matches!(
            table.mv_child(ROOT_INODE, OsStr::new("x"), ROOT_INODE, OsStr::new("y"), false, false),
            Err(errno) if errno.is_exist()
        ));

        fire(
            table
                .mv_child(ROOT_INODE, OsStr::new("x"), ROOT_INODE, OsStr::new("y"), false, true)
                .unwrap(),
        );

        let (bound, _) = table.lookup_child(ROOT_INODE, OsStr::new("y")).unwrap();
        assert_eq!(bound.ino, x.ino);

        // the overwritten target follows invariant 3 once forgotten
        assert!(table.contains(y.ino));
        fire(table.forget(y.ino, 1));
        assert!(!table.contains(y.ino));

        table.assert_edges_consistent();
    }

    #[test]
    fn dir_entries_keep_insertion_order() {
        let table = InodeTable::new(TestNode::new());

        create(&table, ROOT_INODE, "zeta", FileType::RegularFile);
        create(&table, ROOT_INODE, "alpha", FileType::RegularFile);
        create(&table, ROOT_INODE, "mid", FileType::Directory);

        let names = table
            .dir_entries(ROOT_INODE)
            .unwrap()
            .into_iter()
            .map(|(name, _, _)| name)
            .collect::<Vec<_>>();

        assert_eq!(
            names,
            vec![
                OsString::from("."),
                OsString::from(".."),
                OsString::from("zeta"),
                OsString::from("alpha"),
                OsString::from("mid"),
            ]
        );
    }

    #[test]
    fn add_child_rejects_second_dir_parent() {
        let table = InodeTable::new(TestNode::new());

        let dir = create(&table, ROOT_INODE, "dir", FileType::Directory);

        assert!(table
            .add_child(ROOT_INODE, OsStr::new("alias"), dir.ino, false, false)
            .is_err());
    }

    #[test]
    fn clear_fires_on_forget_for_everything() {
        let table = InodeTable::new(TestNode::new());

        let node = TestNode::new();
        table
            .lookup_or_create(
                ROOT_INODE,
                OsStr::new("a"),
                node.clone(),
                FileType::RegularFile,
                0,
                0,
            )
            .unwrap();

        fire(table.clear());
        assert_eq!(node.forgets.load(Ordering::SeqCst), 1);
        assert!(!table.contains(ROOT_INODE));
    }
}
