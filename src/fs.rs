//! The filesystem seam the engine is written against.
//!
//! [`LocalFs`] is used in production, [`MemoryFs`] keeps a whole log tree in
//! memory for tests and throwaway instances. Both give readers a handle that
//! observes bytes appended after it was opened, which the following reader
//! relies on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A write handle positioned at the end of a file.
pub trait AppendFile: Write + Send {
    /// Flush file contents to stable storage.
    fn sync_data(&mut self) -> io::Result<()>;
}

impl AppendFile for File {
    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }
}

pub trait FileSystem: Debug + Send + Sync {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;
    /// Open for appending, creating the file if needed.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn AppendFile>>;
    /// Create an empty file, replacing any existing one.
    fn create(&self, path: &Path) -> io::Result<Box<dyn AppendFile>>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Names of the entries directly below `dir`.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn file_size(&self, path: &Path) -> io::Result<u64>;
}

pub type SharedFs = Arc<dyn FileSystem>;

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FileSystem for LocalFs {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn AppendFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn AppendFile>> {
        Ok(Box::new(File::create(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            if let Ok(name) = entry?.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

type MemFile = Arc<RwLock<Vec<u8>>>;

#[derive(Debug, Default)]
struct MemTree {
    files: BTreeMap<PathBuf, MemFile>,
    dirs: BTreeSet<PathBuf>,
}

impl MemTree {
    fn require_parent(&self, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !self.dirs.contains(parent) => {
                Err(not_found(parent))
            }
            _ => Ok(()),
        }
    }
}

/// Thread-safe in-memory filesystem.
#[derive(Debug, Default)]
pub struct MemoryFs {
    tree: Mutex<MemTree>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> io::Result<std::sync::MutexGuard<'_, MemTree>> {
        self.tree
            .lock()
            .map_err(|_| io::Error::other("in-memory filesystem lock poisoned"))
    }

    fn file(&self, path: &Path) -> io::Result<MemFile> {
        self.tree()?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} does not exist", path.display()))
}

fn poisoned() -> io::Error {
    io::Error::other("in-memory file lock poisoned")
}

impl FileSystem for MemoryFs {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(MemReader {
            data: self.file(path)?,
            pos: 0,
        }))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn AppendFile>> {
        let mut tree = self.tree()?;
        tree.require_parent(path)?;
        let data = tree.files.entry(path.to_path_buf()).or_default().clone();
        Ok(Box::new(MemAppender { data }))
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn AppendFile>> {
        let mut tree = self.tree()?;
        tree.require_parent(path)?;
        let data = MemFile::default();
        tree.files.insert(path.to_path_buf(), data.clone());
        Ok(Box::new(MemAppender { data }))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut tree = self.tree()?;
        tree.require_parent(to)?;
        if let Some(data) = tree.files.remove(from) {
            tree.files.insert(to.to_path_buf(), data);
            return Ok(());
        }
        if !tree.dirs.contains(from) {
            return Err(not_found(from));
        }
        if tree.dirs.contains(to) || tree.files.contains_key(to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", to.display()),
            ));
        }

        let moved_dirs: Vec<PathBuf> = tree
            .dirs
            .iter()
            .filter(|d| d.starts_with(from))
            .cloned()
            .collect();
        for dir in moved_dirs {
            tree.dirs.remove(&dir);
            if let Ok(rest) = dir.strip_prefix(from) {
                tree.dirs.insert(to.join(rest));
            }
        }
        let moved_files: Vec<PathBuf> = tree
            .files
            .keys()
            .filter(|f| f.starts_with(from))
            .cloned()
            .collect();
        for file in moved_files {
            if let (Some(data), Ok(rest)) = (tree.files.remove(&file), file.strip_prefix(from)) {
                tree.files.insert(to.join(rest), data);
            }
        }
        Ok(())
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        let tree = self.tree()?;
        if !tree.dirs.contains(dir) {
            return Err(not_found(dir));
        }
        let children = tree
            .dirs
            .iter()
            .chain(tree.files.keys())
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect();
        Ok(children)
    }

    fn exists(&self, path: &Path) -> bool {
        self.tree()
            .map(|t| t.files.contains_key(path) || t.dirs.contains(path))
            .unwrap_or(false)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.tree().map(|t| t.dirs.contains(path)).unwrap_or(false)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        let mut tree = self.tree()?;
        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            tree.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.tree()?
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        let data = self.file(path)?;
        let len = data.read().map_err(|_| poisoned())?.len();
        Ok(len as u64)
    }
}

struct MemReader {
    data: MemFile,
    pos: u64,
}

impl Read for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read().map_err(|_| poisoned())?;
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for MemReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.read().map_err(|_| poisoned())?.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

struct MemAppender {
    data: MemFile,
}

impl Write for MemAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.write().map_err(|_| poisoned())?.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AppendFile for MemAppender {
    fn sync_data(&mut self) -> io::Result<()> {
        Ok(())
    }
}
