use std::io::{self, Cursor};

/// A type which may be used as a read-only export device.
///
/// Each session owns its own device handle. Where the platform supports it,
/// `read_at` performs a positional read which never touches a shared seek
/// cursor.
pub trait Read: io::Read + io::Seek {
    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Option<io::Result<usize>> {
        // No-op by default.
        None
    }
}

// Trait implementations for types commonly used with this library.

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    use crate::Read;

    // Use fused read+seek system calls on UNIX platforms.

    impl Read for File {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> Option<io::Result<usize>> {
            Some(FileExt::read_at(self, buf, offset))
        }
    }

    impl Read for &File {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> Option<io::Result<usize>> {
            Some(FileExt::read_at(*self, buf, offset))
        }
    }
}

#[cfg(not(unix))]
mod unix {
    use std::fs::File;

    use crate::Read;

    // Fall back to seek then read system calls on non-UNIX platforms.

    impl Read for File {}
    impl Read for &File {}
}

impl<T> Read for Cursor<T> where T: AsRef<[u8]> {}
