//! Dependency Database
//!
//! A per-target, line-oriented journal of prerequisite fingerprints and
//! module maps (`<target>.d`). Validation reads lines and compares them to
//! what the rule expects; the first mismatch truncates the rest and
//! switches to writing. After close the database is either fully
//! revalidated or fully rewritten, never partially rewritten.
//!
//! The file ends with a blank-line terminator so that an interrupted
//! write is detected as corrupt on the next read.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::diag::IoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Writing,
}

#[derive(Debug)]
pub struct DepDb {
    path: PathBuf,
    /// Existing lines, terminator excluded.
    lines: Vec<String>,
    pos: usize,
    state: State,
    /// Validated prefix plus appended lines, pending write-out.
    out: Vec<String>,
    /// Set by the caller when revalidated content should have its mtime
    /// bumped on close (the target is about to be recompiled).
    pub touch: bool,
}

impl DepDb {
    /// Open (or create) the database for reading.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IoError> {
        let path = path.into();
        let lines = match fs::read_to_string(&path) {
            Ok(content) => {
                let mut ls: Vec<String> = content.lines().map(str::to_string).collect();
                // A valid database ends with the blank terminator; anything
                // else is a torn write and invalidates the whole content.
                if content.ends_with("\n\n") && matches!(ls.last(), Some(l) if l.is_empty()) {
                    ls.pop();
                    ls
                } else {
                    Vec::new()
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(IoError::new("read", &path, e)),
        };

        Ok(Self {
            path,
            lines,
            pos: 0,
            state: State::Reading,
            out: Vec::new(),
            touch: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True until the first mismatch or explicit write.
    pub fn reading(&self) -> bool {
        self.state == State::Reading
    }

    pub fn writing(&self) -> bool {
        self.state == State::Writing
    }

    fn start_writing(&mut self) {
        if self.state == State::Reading {
            // Keep the validated prefix; everything from the current
            // position on is discarded.
            self.out = self.lines[..self.pos].to_vec();
            self.state = State::Writing;
        }
    }

    /// Compare the next line to `line`. Equal lines advance; a mismatch
    /// (or EOF, or an earlier mismatch) truncates from this point and
    /// appends `line`. Returns true if the line was already present.
    pub fn expect(&mut self, line: &str) -> bool {
        if self.state == State::Reading {
            if self.pos < self.lines.len() && self.lines[self.pos] == line {
                self.pos += 1;
                return true;
            }
            tracing::trace!(path = %self.path.display(), line, "depdb mismatch");
            self.start_writing();
        }
        self.out.push(line.to_string());
        false
    }

    /// Append a line, forcing writing mode.
    pub fn write(&mut self, line: &str) {
        self.start_writing();
        self.out.push(line.to_string());
    }

    /// Read the next cached line, or None on EOF or in writing mode.
    pub fn read(&mut self) -> Option<String> {
        if self.state == State::Reading && self.pos < self.lines.len() {
            let l = self.lines[self.pos].clone();
            self.pos += 1;
            Some(l)
        } else {
            None
        }
    }

    /// Skip one cached line while revalidating.
    pub fn skip(&mut self) {
        if self.state == State::Reading && self.pos < self.lines.len() {
            self.pos += 1;
        }
    }

    /// Current read position, for `truncate` and `rewind`.
    pub fn mark(&self) -> usize {
        self.pos
    }

    /// Move the read position back to an earlier mark (reading mode
    /// only).
    pub fn rewind(&mut self, mark: usize) {
        if self.state == State::Reading {
            self.pos = mark.min(self.lines.len());
        }
    }

    /// The database file's own mtime (its last validation time).
    pub fn file_mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).ok()?.modified().ok()
    }

    /// Retroactively invalidate everything from `mark` on (a cached
    /// prerequisite read ahead of the mismatch turned out stale).
    pub fn truncate(&mut self, mark: usize) {
        if self.state == State::Reading {
            self.out = self.lines[..mark.min(self.lines.len())].to_vec();
            self.state = State::Writing;
        }
    }

    /// Close, flushing a rewrite or bumping the mtime as requested.
    pub fn close(mut self) -> Result<(), IoError> {
        match self.state {
            State::Writing => {
                self.out.push(String::new()); // Terminator.
                let mut content = self.out.join("\n");
                content.push('\n');
                fs::write(&self.path, content).map_err(|e| IoError::new("write", &self.path, e))
            }
            State::Reading => {
                if self.touch {
                    // Re-write the identical content; this is the mtime
                    // bump (the file is small).
                    let mut content = self.lines.join("\n");
                    content.push('\n');
                    content.push('\n');
                    fs::write(&self.path, content)
                        .map_err(|e| IoError::new("write", &self.path, e))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Verify the database is not newer than its target after a
    /// successful update. A violation indicates a bug in the rule's
    /// mtime discipline.
    pub fn check_mtime(path: &Path, target_mtime: SystemTime) {
        if let Ok(md) = fs::metadata(path) {
            if let Ok(m) = md.modified() {
                if m > target_mtime {
                    tracing::warn!(
                        path = %path.display(),
                        "dependency database mtime is newer than its target"
                    );
                    debug_assert!(false, "depdb mtime newer than target");
                }
            }
        }
    }

    /// Remaining unread line count (diagnostics/tests).
    pub fn remaining(&self) -> usize {
        if self.state == State::Reading {
            self.lines.len() - self.pos
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("main.o.d")
    }

    #[test]
    fn test_expect_close_reopen_read() {
        let dir = tempfile::tempdir().unwrap();
        let p = db_path(&dir);

        let mut db = DepDb::open(&p).unwrap();
        assert!(!db.expect("cxx.compile 1")); // Empty db: starts writing.
        db.close().unwrap();

        let mut db = DepDb::open(&p).unwrap();
        assert_eq!(db.read().as_deref(), Some("cxx.compile 1"));
        assert_eq!(db.read(), None);
    }

    #[test]
    fn test_revalidation_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = db_path(&dir);

        let mut db = DepDb::open(&p).unwrap();
        db.write("rule");
        db.write("checksum");
        db.write("/src/a.h");
        db.close().unwrap();

        let mut db = DepDb::open(&p).unwrap();
        assert!(db.expect("rule"));
        assert!(db.expect("checksum"));
        assert!(db.expect("/src/a.h"));
        assert!(db.reading());
        db.close().unwrap();

        // Content unchanged.
        let mut db = DepDb::open(&p).unwrap();
        assert_eq!(db.read().as_deref(), Some("rule"));
        assert_eq!(db.remaining(), 2);
    }

    #[test]
    fn test_mismatch_truncates_from_point() {
        let dir = tempfile::tempdir().unwrap();
        let p = db_path(&dir);

        let mut db = DepDb::open(&p).unwrap();
        db.write("rule");
        db.write("old-options");
        db.write("/src/a.h");
        db.close().unwrap();

        let mut db = DepDb::open(&p).unwrap();
        assert!(db.expect("rule"));
        assert!(!db.expect("new-options")); // Mismatch: truncate here.
        assert!(db.writing());
        db.close().unwrap();

        let mut db = DepDb::open(&p).unwrap();
        assert_eq!(db.read().as_deref(), Some("rule"));
        assert_eq!(db.read().as_deref(), Some("new-options"));
        // The stale header line is gone.
        assert_eq!(db.read(), None);
    }

    #[test]
    fn test_torn_write_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let p = db_path(&dir);
        // No blank-line terminator.
        fs::write(&p, "rule\nchecksum\n").unwrap();

        let mut db = DepDb::open(&p).unwrap();
        assert_eq!(db.read(), None);
        assert!(!db.expect("rule"));
        assert!(db.writing());
    }

    #[test]
    fn test_touch_bumps_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let p = db_path(&dir);

        let mut db = DepDb::open(&p).unwrap();
        db.write("rule");
        db.close().unwrap();

        let before = fs::metadata(&p).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut db = DepDb::open(&p).unwrap();
        assert!(db.expect("rule"));
        db.touch = true;
        db.close().unwrap();

        let after = fs::metadata(&p).unwrap().modified().unwrap();
        assert!(after >= before);

        // Content still valid.
        let mut db = DepDb::open(&p).unwrap();
        assert_eq!(db.read().as_deref(), Some("rule"));
    }

    #[test]
    fn test_skip_advances_without_compare() {
        let dir = tempfile::tempdir().unwrap();
        let p = db_path(&dir);

        let mut db = DepDb::open(&p).unwrap();
        db.write("a");
        db.write("b");
        db.close().unwrap();

        let mut db = DepDb::open(&p).unwrap();
        db.skip();
        assert_eq!(db.read().as_deref(), Some("b"));
    }
}
