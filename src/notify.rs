//! unsolicited messages to the kernel: cache invalidation and deletion
//! notifications.
//!
//! A notification is an out message with unique id 0 whose error field
//! carries the notification code instead of an errno.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use bincode::Options;
use futures_channel::mpsc::UnboundedSender;
use futures_util::SinkExt;

use crate::abi::{
    fuse_notify_code, fuse_notify_delete_out, fuse_notify_inval_entry_out,
    fuse_notify_inval_inode_out, fuse_out_header, FUSE_NOTIFY_DELETE_OUT_SIZE,
    FUSE_NOTIFY_INVAL_ENTRY_OUT_SIZE, FUSE_NOTIFY_INVAL_INODE_OUT_SIZE, FUSE_OUT_HEADER_SIZE,
};
use crate::dispatch::ReplyMessage;
use crate::helper::get_bincode_config;
use crate::Inode;

/// a handle to push notifications into a mounted session. Cheap to clone;
/// sending after the session ended reports [`NotifyError::SessionClosed`].
#[derive(Debug, Clone)]
pub struct Notify {
    sender: UnboundedSender<ReplyMessage>,
}

/// sending a notification failed because the session is gone.
#[derive(Debug, Eq, PartialEq)]
pub struct SessionClosed;

impl Notify {
    pub(crate) fn new(sender: UnboundedSender<ReplyMessage>) -> Self {
        Self { sender }
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), SessionClosed> {
        self.sender
            .clone()
            .send(ReplyMessage::Data(data))
            .await
            .map_err(|_| SessionClosed)
    }

    /// tell the kernel to drop cached pages of an inode. `len == 0`
    /// invalidates everything from `offset` on.
    pub async fn invalidate_inode(
        &self,
        inode: Inode,
        offset: i64,
        len: i64,
    ) -> Result<(), SessionClosed> {
        let out_header = fuse_out_header {
            len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_INVAL_INODE_OUT_SIZE) as u32,
            error: fuse_notify_code::FUSE_NOTIFY_INVAL_INODE as i32,
            unique: 0,
        };

        let inval_inode_out = fuse_notify_inval_inode_out {
            ino: inode,
            off: offset,
            len,
        };

        let mut data =
            Vec::with_capacity(FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_INVAL_INODE_OUT_SIZE);

        get_bincode_config()
            .serialize_into(&mut data, &out_header)
            .expect("won't happened");
        get_bincode_config()
            .serialize_into(&mut data, &inval_inode_out)
            .expect("won't happened");

        self.send(data).await
    }

    /// tell the kernel a dentry is no longer valid.
    pub async fn invalidate_entry(
        &self,
        parent: Inode,
        name: &OsStr,
    ) -> Result<(), SessionClosed> {
        let name = name.as_bytes();

        let out_header = fuse_out_header {
            len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_INVAL_ENTRY_OUT_SIZE + name.len() + 1) as u32,
            error: fuse_notify_code::FUSE_NOTIFY_INVAL_ENTRY as i32,
            unique: 0,
        };

        let inval_entry_out = fuse_notify_inval_entry_out {
            parent,
            namelen: name.len() as u32,
            _padding: 0,
        };

        let mut data = Vec::with_capacity(
            FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_INVAL_ENTRY_OUT_SIZE + name.len() + 1,
        );

        get_bincode_config()
            .serialize_into(&mut data, &out_header)
            .expect("won't happened");
        get_bincode_config()
            .serialize_into(&mut data, &inval_entry_out)
            .expect("won't happened");

        data.extend_from_slice(name);
        data.push(0);

        self.send(data).await
    }

    /// tell the kernel a child was deleted, so it can drop the dentry and
    /// the inode in one go.
    pub async fn delete(
        &self,
        parent: Inode,
        child: Inode,
        name: &OsStr,
    ) -> Result<(), SessionClosed> {
        let name = name.as_bytes();

        let out_header = fuse_out_header {
            len: (FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_DELETE_OUT_SIZE + name.len() + 1) as u32,
            error: fuse_notify_code::FUSE_NOTIFY_DELETE as i32,
            unique: 0,
        };

        let delete_out = fuse_notify_delete_out {
            parent,
            child,
            namelen: name.len() as u32,
            _padding: 0,
        };

        let mut data = Vec::with_capacity(
            FUSE_OUT_HEADER_SIZE + FUSE_NOTIFY_DELETE_OUT_SIZE + name.len() + 1,
        );

        get_bincode_config()
            .serialize_into(&mut data, &out_header)
            .expect("won't happened");
        get_bincode_config()
            .serialize_into(&mut data, &delete_out)
            .expect("won't happened");

        data.extend_from_slice(name);
        data.push(0);

        self.send(data).await
    }
}
