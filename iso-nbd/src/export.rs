use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Information about a resolved, read-only Network Block Device export.
#[derive(Clone, Debug, PartialEq)]
pub struct Export {
    /// The name requested by the client.
    pub name: String,
    /// The canonical path of the backing file beneath the export root.
    pub path: PathBuf,
    /// The size of the backing file in bytes at resolution time.
    pub size: u64,
}

/// Errors produced when a client's export name cannot be served.
#[derive(Debug)]
pub enum ResolveError {
    /// No readable regular file exists for the export name.
    NotFound(String),

    /// The export name is malformed or refers to a location outside of the
    /// export root.
    Forbidden(String),

    /// The file system failed for a reason other than a missing file.
    Io(io::Error),
}

impl std::error::Error for ResolveError {}

impl fmt::Display for ResolveError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResolveError::NotFound(name) => write!(fmt, "export not found: {name:?}"),
            ResolveError::Forbidden(name) => write!(fmt, "export name not permitted: {name:?}"),
            ResolveError::Io(err) => write!(fmt, "failed to resolve export: {err}"),
        }
    }
}

impl From<io::Error> for ResolveError {
    fn from(src: io::Error) -> Self {
        ResolveError::Io(src)
    }
}

/// A directory of files which are exposed as read-only exports by name.
///
/// Export names are looked up fresh on every handshake; nothing is cached.
#[derive(Clone, Debug)]
pub struct ExportDir {
    root: PathBuf,
}

impl ExportDir {
    /// Creates an `ExportDir` serving the files beneath `root`, which must be
    /// an existing directory.
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("export root {} is not a directory", root.display()),
            ));
        }

        Ok(Self { root })
    }

    /// Returns the canonical export root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves the raw export `name` sent by a client to a readable regular
    /// file beneath the export root. Returns the export along with the
    /// read-only handle its size was taken from; every session serves its own
    /// handle, so reads never share a seek cursor.
    pub fn resolve(&self, name: &[u8]) -> Result<(Export, File), ResolveError> {
        let name = std::str::from_utf8(name)
            .map_err(|_| ResolveError::Forbidden(String::from_utf8_lossy(name).into_owned()))?;

        if name.is_empty() {
            // The default export is not supported, the root is never a file.
            return Err(ResolveError::NotFound(name.to_string()));
        }

        let relative = Path::new(name);
        let plain = !name.contains('\0')
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !plain {
            return Err(ResolveError::Forbidden(name.to_string()));
        }

        let path = match fs::canonicalize(self.root.join(relative)) {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ResolveError::NotFound(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        // Symbolic links are followed by canonicalization, so check the final
        // location as well as the name itself.
        if !path.starts_with(&self.root) {
            return Err(ResolveError::Forbidden(name.to_string()));
        }

        // Opening the file proves it is readable; stat through the handle so
        // the size belongs to the file that was actually checked.
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                return Err(ResolveError::NotFound(name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(ResolveError::NotFound(name.to_string()));
        }

        let export = Export {
            name: name.to_string(),
            path,
            size: metadata.len(),
        };

        Ok((export, file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn export_dir() -> (tempfile::TempDir, ExportDir) {
        let dir = tempfile::tempdir().expect("failed to create temporary directory");

        let mut file = File::create(dir.path().join("disk.iso")).expect("failed to create file");
        file.write_all(&[0xaa; 4096]).expect("failed to write file");

        fs::create_dir(dir.path().join("images")).expect("failed to create subdirectory");
        File::create(dir.path().join("images").join("boot.img"))
            .expect("failed to create nested file")
            .write_all(b"boot")
            .expect("failed to write nested file");

        let exports = ExportDir::new(dir.path()).expect("failed to create export directory");
        (dir, exports)
    }

    #[test]
    fn resolve_ok() {
        let (_dir, exports) = export_dir();

        let (export, _) = exports.resolve(b"disk.iso").expect("failed to resolve export");
        assert_eq!(export.name, "disk.iso");
        assert_eq!(export.size, 4096);
        assert_eq!(export.path, exports.root().join("disk.iso"));
        assert!(export.path.is_absolute(), "export path must be absolute");

        let (nested, _) = exports
            .resolve(b"images/boot.img")
            .expect("failed to resolve nested export");
        assert_eq!(nested.size, 4);
    }

    #[cfg(unix)]
    #[test]
    fn resolved_handle_outlives_replacement() {
        use std::io::Read;

        let (dir, exports) = export_dir();
        let (export, mut file) = exports.resolve(b"disk.iso").expect("failed to resolve export");

        // Swap a different file into place after resolution.
        let replacement = dir.path().join("disk.iso.new");
        fs::write(&replacement, b"replaced").expect("failed to write replacement");
        fs::rename(&replacement, dir.path().join("disk.iso")).expect("failed to replace file");

        let mut data = Vec::new();
        file.read_to_end(&mut data).expect("failed to read resolved handle");

        assert_eq!(export.size, 4096);
        assert_eq!(data, vec![0xaa; 4096], "handle must refer to the resolved file");
    }

    #[test]
    fn resolve_not_found() {
        let (_dir, exports) = export_dir();

        for name in [&b"missing.iso"[..], b"", b"images"] {
            let err = exports.resolve(name).expect_err("resolve succeeded");
            assert!(
                matches!(err, ResolveError::NotFound(_)),
                "expected NotFound for {:?}, but got: {:?}",
                name,
                err
            );
        }
    }

    #[test]
    fn resolve_forbidden() {
        let (_dir, exports) = export_dir();

        for name in [
            &b"../disk.iso"[..],
            b"images/../../disk.iso",
            b"/etc/passwd",
            b"./disk.iso",
            b"disk\0.iso",
            b"\xff\xfe",
        ] {
            let err = exports.resolve(name).expect_err("resolve succeeded");
            assert!(
                matches!(err, ResolveError::Forbidden(_)),
                "expected Forbidden for {:?}, but got: {:?}",
                name,
                err
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn resolve_symlink_escape() {
        let (dir, exports) = export_dir();
        let outside = tempfile::NamedTempFile::new().expect("failed to create outside file");

        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape.iso"))
            .expect("failed to create symlink");

        let err = exports.resolve(b"escape.iso").expect_err("resolve succeeded");
        assert!(
            matches!(err, ResolveError::Forbidden(_)),
            "expected Forbidden, but got: {:?}",
            err
        );
    }

    #[test]
    fn root_must_be_directory() {
        let file = tempfile::NamedTempFile::new().expect("failed to create file");
        let err = ExportDir::new(file.path()).expect_err("created export directory from file");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
