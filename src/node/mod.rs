//! The tree-structured filesystem surface.
//!
//! A filesystem is a tree of nodes. Each node supplies an implementation of
//! [`NodeOps`] and overrides the operations it supports; everything it does
//! not override gets the documented default reply. The session maintains the
//! kernel-facing inode table (node ids, lookup counts, parent/child edges)
//! so node implementations never deal with the FUSE protocol directly.
//!
//! Entry-producing operations ([`NodeOps::lookup`], [`NodeOps::mkdir`], ...)
//! return an [`Entry`] describing the child node; the session inserts it
//! into the tree, minting an inode number unless the entry carries one.

pub use dir::{DirStream, VecDirStream};
pub use handle::FileHandle;
pub use ops::{Entry, NodeOps, Opened};
pub use tree::StableAttr;

pub(crate) use handle::{HandleEntry, HandleTable};
pub(crate) use tree::{InodeTable, ROOT_INODE};

mod dir;
mod handle;
mod ops;
mod tree;

pub mod prelude {
    pub use super::{DirStream, Entry, FileHandle, NodeOps, Opened, VecDirStream};
    pub use crate::reply::*;
    pub use crate::{Errno, FileType, MountOptions, Request, Result, SetAttr, Session, Timestamp};
}
