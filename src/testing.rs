//! Support code shared by the unit tests: an in-memory disk with a
//! monotonically ticking clock.

use crate::fs::{DiskInterface, MTime, ReadResult};
use hashbrown::HashMap;
use std::cell::{Cell, RefCell};

struct TestFile {
    mtime: u64,
    content: Vec<u8>,
}

/// Memory-backed `DiskInterface`.  Every write bumps a fake clock so "newer
/// than" relations between files are easy to script.
pub struct TestDisk {
    files: RefCell<HashMap<String, TestFile>>,
    clock: Cell<u64>,
}

impl TestDisk {
    pub fn new() -> Self {
        TestDisk {
            files: RefCell::new(HashMap::new()),
            clock: Cell::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.set(self.clock.get() + 1);
        self.clock.get()
    }

    /// Create or overwrite a file, stamping it newer than everything else.
    pub fn add(&self, path: &str, content: &str) {
        let mtime = self.tick();
        self.files.borrow_mut().insert(
            path.to_string(),
            TestFile {
                mtime,
                content: content.as_bytes().to_vec(),
            },
        );
    }

    /// Overwrite content without changing the mtime, as a restat-friendly
    /// command would.
    pub fn write_unchanged(&self, path: &str, content: &str) {
        let mut files = self.files.borrow_mut();
        let file = files.get_mut(path).expect("write_unchanged of absent file");
        file.content = content.as_bytes().to_vec();
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.files
            .borrow()
            .get(path)
            .map(|f| String::from_utf8_lossy(&f.content).into_owned())
    }

    pub fn mtime_of(&self, path: &str) -> Option<u64> {
        self.files.borrow().get(path).map(|f| f.mtime)
    }
}

impl DiskInterface for TestDisk {
    fn stat(&self, path: &str) -> anyhow::Result<MTime> {
        Ok(match self.files.borrow().get(path) {
            Some(file) => MTime::Stamp(file.mtime),
            None => MTime::Missing,
        })
    }

    fn read_file(&self, path: &str) -> anyhow::Result<ReadResult> {
        Ok(match self.files.borrow().get(path) {
            Some(file) => ReadResult::Okay(file.content.clone()),
            None => ReadResult::NotFound,
        })
    }

    fn write_file(&self, path: &str, content: &str) -> anyhow::Result<()> {
        self.add(path, content);
        Ok(())
    }

    fn make_dirs(&self, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.files.borrow_mut().remove(path).is_some())
    }
}
