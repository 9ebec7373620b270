use crate::reply::DirectoryEntry;
use crate::Result;

/// A directory entry cursor.
///
/// Streams must be deterministic: given the same directory state, two
/// cursors iterate in the same order, or concurrent readers of the same
/// directory will see entries appear and disappear. Implementations backed
/// by hashed containers must impose an order.
pub trait DirStream: Send {
    /// whether there are further entries. May be called on closed streams.
    fn has_next(&self) -> bool;

    /// retrieve the next entry. Only called after [`has_next`] returned
    /// true.
    ///
    /// [`has_next`]: DirStream::has_next
    fn next_entry(&mut self) -> Result<DirectoryEntry>;

    /// release resources related to this stream.
    fn close(&mut self) {}
}

/// A [`DirStream`] over a pre-collected entry list, iterating in list
/// order.
pub struct VecDirStream {
    entries: Vec<DirectoryEntry>,
    position: usize,
}

impl VecDirStream {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self {
            entries,
            position: 0,
        }
    }
}

impl DirStream for VecDirStream {
    fn has_next(&self) -> bool {
        self.position < self.entries.len()
    }

    fn next_entry(&mut self) -> Result<DirectoryEntry> {
        let entry = self.entries[self.position].clone();
        self.position += 1;

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;
    use crate::FileType;

    fn entry(name: &str, inode: u64) -> DirectoryEntry {
        DirectoryEntry {
            inode,
            kind: FileType::RegularFile,
            name: OsString::from(name),
        }
    }

    #[test]
    fn iterates_in_order() {
        let mut stream = VecDirStream::new(vec![entry("a", 2), entry("b", 3)]);

        assert!(stream.has_next());
        assert_eq!(stream.next_entry().unwrap().name, "a");
        assert!(stream.has_next());
        assert_eq!(stream.next_entry().unwrap().name, "b");
        assert!(!stream.has_next());
    }

    #[test]
    fn two_cursors_agree() {
        let entries = vec![entry("x", 2), entry("y", 3), entry("z", 4)];

        let mut first = VecDirStream::new(entries.clone());
        let mut second = VecDirStream::new(entries);

        while first.has_next() {
            assert_eq!(
                first.next_entry().unwrap().name,
                second.next_entry().unwrap().name
            );
        }
        assert!(!second.has_next());
    }
}
