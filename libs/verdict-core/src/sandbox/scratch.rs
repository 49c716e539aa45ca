// Ephemeral scratch directories, one per sandbox session
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Hands out per-session directories under a common root.
/// Each directory is removed when its `TempDir` is dropped, whatever the outcome.
#[derive(Debug, Clone)]
pub struct ScratchAllocator {
    root: PathBuf,
}

impl ScratchAllocator {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allocate(&self) -> io::Result<TempDir> {
        std::fs::create_dir_all(&self.root)?;
        tempfile::Builder::new()
            .prefix("verdict-")
            .tempdir_in(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let root = tempfile::tempdir().unwrap();
        let allocator = ScratchAllocator::new(root.path());

        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().starts_with(root.path()));

        std::fs::write(first.path().join("scratch.txt"), "data").unwrap();
        let path = first.path().to_path_buf();
        drop(first);
        assert!(!path.exists());
        assert!(second.path().exists());
    }

    #[test]
    fn test_creates_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        let allocator = ScratchAllocator::new(&nested);
        let dir = allocator.allocate().unwrap();
        assert!(dir.path().starts_with(&nested));
    }
}
