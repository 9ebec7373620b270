use bincode::Options;
use nix::sys::stat::mode_t;

use crate::FileType;

pub trait Apply: Sized {
    fn apply<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        f(&mut self);
        self
    }
}

impl<T> Apply for T {}

/// The kernel speaks its native byte order on /dev/fuse, with fixed-width
/// integers and no length prefixes.
pub(crate) fn get_bincode_config() -> impl Options {
    bincode::options()
        .with_native_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub(crate) fn get_first_null_position(data: impl AsRef<[u8]>) -> Option<usize> {
    data.as_ref().iter().position(|char| *char == 0)
}

/// returns the padding size to align `size` to 8 bytes, used by dirent
/// serializing.
pub(crate) fn get_padding_size(size: usize) -> usize {
    (8 - size % 8) % 8
}

/// combine the file kind and the permission bits into a `st_mode` value.
pub fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    kind.const_into_mode_t() as u32 | perm as u32
}

/// extract the permission bits from a `st_mode` value.
pub fn perm_from_mode_and_kind(kind: FileType, mode: mode_t) -> u16 {
    (mode ^ kind.const_into_mode_t()) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_null() {
        assert_eq!(get_first_null_position(b"abc\0def"), Some(3));
        assert_eq!(get_first_null_position(b"abc"), None);
        assert_eq!(get_first_null_position(b"\0"), Some(0));
    }

    #[test]
    fn padding() {
        assert_eq!(get_padding_size(24), 0);
        assert_eq!(get_padding_size(25), 7);
        assert_eq!(get_padding_size(31), 1);
    }

    #[test]
    fn mode_round_trip() {
        let mode = mode_from_kind_and_perm(FileType::RegularFile, 0o644);
        assert_eq!(mode, libc::S_IFREG as u32 | 0o644);
        assert_eq!(
            perm_from_mode_and_kind(FileType::RegularFile, mode as mode_t),
            0o644
        );
    }
}
