use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use crate::errfmt;
use crate::error::Result;

/// How a backend should open a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenFlags {
    /// Read-only.
    Read,
    /// Write-only, appending, creating the file if absent.
    AppendCreate,
    /// Write-only, truncating any existing contents.
    TruncWrite,
}

/// The lstat subset the index cares about.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

/// One directory entry from a backend readdir.
#[derive(Clone, Debug)]
pub struct DirEnt {
    pub name: String,
    pub is_dir: bool,
}

/// An open file on a backend store.
pub trait Handle: Send {
    /// Reads the whole file from the beginning.
    fn read_all(&mut self) -> Result<Vec<u8>>;

    /// Reads at an absolute offset without moving the append cursor.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes the whole buffer, appending when opened with AppendCreate.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Truncates the file to the given size.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Closes the handle, surfacing any close-time error.
    fn close(self: Box<Self>) -> Result<()>;
}

/// A backing store offering open/read/write/close/lstat over opaque bpaths.
///
/// The enclosing file system resolves logical paths; the index only ever
/// sees backend paths ("bpaths") and the backend that owns them.
pub trait Backend: Send + Sync {
    /// Scheme tag used in path specs, e.g. "posix".
    fn scheme(&self) -> &'static str;

    /// Opens a file. `mode` is the permission set for newly created files.
    fn open(&self, bpath: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn Handle>>;

    /// Stats a path without following symlinks.
    fn lstat(&self, bpath: &str) -> Result<FileStat>;

    /// Lists a directory.
    fn readdir(&self, bpath: &str) -> Result<Vec<DirEnt>>;
}

/// Maps path-spec schemes to backends.
///
/// Specs beginning with `/` implicitly carry the `posix:` scheme; anything
/// else must be `<scheme>:<bpath>`. The registry is a collaborator handed to
/// the index at construction, never a process-wide global.
pub struct BackendRegistry {
    backends: HashMap<&'static str, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// A registry with the posix backend preinstalled.
    pub fn with_posix() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(PosixBackend));
        reg
    }

    /// Registers a backend under its scheme.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.scheme(), backend);
    }

    /// Resolves a path spec into (backend, bpath).
    pub fn resolve(&self, spec: &str) -> Result<(Arc<dyn Backend>, String)> {
        let (scheme, bpath) = if spec.starts_with('/') {
            ("posix", spec)
        } else {
            spec.split_once(':')
                .ok_or_else(|| errfmt!("path spec without scheme: {spec}"))?
        };
        let backend = self
            .backends
            .get(scheme)
            .ok_or_else(|| errfmt!("no backend for scheme {scheme:?} in spec {spec:?}"))?;
        Ok((backend.clone(), bpath.to_string()))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_posix()
    }
}

/// The local-filesystem backend.
pub struct PosixBackend;

impl Backend for PosixBackend {
    fn scheme(&self) -> &'static str {
        "posix"
    }

    fn open(&self, bpath: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn Handle>> {
        let mut opts = OpenOptions::new();
        match flags {
            OpenFlags::Read => {
                opts.read(true);
            }
            OpenFlags::AppendCreate => {
                opts.append(true).create(true);
            }
            OpenFlags::TruncWrite => {
                opts.write(true).truncate(true).create(true);
            }
        }
        #[cfg(unix)]
        if flags != OpenFlags::Read {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;
        let file = opts.open(bpath)?;
        Ok(Box::new(PosixHandle { file }))
    }

    fn lstat(&self, bpath: &str) -> Result<FileStat> {
        let meta = std::fs::symlink_metadata(bpath)?;
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    fn readdir(&self, bpath: &str) -> Result<Vec<DirEnt>> {
        let mut out = Vec::new();
        for dent in std::fs::read_dir(bpath)? {
            let dent = dent?;
            out.push(DirEnt {
                name: dent.file_name().to_string_lossy().into_owned(),
                is_dir: dent.file_type()?.is_dir(),
            });
        }
        Ok(out)
    }
}

struct PosixHandle {
    file: File,
}

impl Handle for PosixHandle {
    fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            Ok(self.file.read_at(buf, offset)?)
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom};
            self.file.seek(SeekFrom::Start(offset))?;
            Ok(self.file.read(buf)?)
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        // durability stays with the store; dropping the handle closes the fd
        drop(self);
        Ok(())
    }
}

/// Runs `f` with the process umask cleared, restoring it afterwards.
///
/// Dropping files carry an explicit permission set; the creator's umask must
/// not mask bits out of it.
#[cfg(unix)]
pub(crate) fn with_umask_cleared<T>(f: impl FnOnce() -> T) -> T {
    let old = unsafe { libc::umask(0) };
    let out = f();
    unsafe { libc::umask(old) };
    out
}

#[cfg(not(unix))]
pub(crate) fn with_umask_cleared<T>(f: impl FnOnce() -> T) -> T {
    f()
}
