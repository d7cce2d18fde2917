//! Daily-rotating append-only file.
//!
//! The live file keeps a fixed name. On the first write of a new local day the
//! live file is renamed to `<name>.<YYYY-MM-DD>` (the day it covered) and a fresh
//! file is opened. Only the newest `backups` rotated files are kept; `0` keeps
//! all of them.
//!
//! Used by the JSON-lines file sink and by the application log layer.

use chrono::{DateTime, Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const DATE_SUFFIX_FORMAT: &str = "%Y-%m-%d";

/// Append-only file rotated at local midnight.
#[derive(Debug)]
pub struct DailyRotatingFile {
    path: PathBuf,
    backups: usize,
    file: File,
    current_day: NaiveDate,
}

impl DailyRotatingFile {
    /// Open (or create) the live file, creating parent directories if needed.
    ///
    /// The day the live file belongs to is taken from its modification time,
    /// so a file last written yesterday is rotated on the first write today.
    pub fn open(path: impl AsRef<Path>, backups: usize) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_day = file
            .metadata()
            .and_then(|m| m.modified())
            .map(|t| DateTime::<Local>::from(t).date_naive())
            .unwrap_or_else(|_| Local::now().date_naive());

        Ok(Self {
            path,
            backups,
            file,
            current_day,
        })
    }

    /// Path of the live file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line (a newline is added).
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.write_line_on(Local::now().date_naive(), line)
    }

    /// Append one line as if the wall clock showed `today`.
    pub fn write_line_on(&mut self, today: NaiveDate, line: &str) -> io::Result<()> {
        self.rotate_if_needed(today)?;
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file.write_all(&buf)
    }

    /// Rotate when `today` is past the day the live file covers.
    pub fn rotate_if_needed(&mut self, today: NaiveDate) -> io::Result<()> {
        if today <= self.current_day {
            return Ok(());
        }

        self.file.flush()?;
        let rotated = rotated_path(&self.path, self.current_day);
        fs::rename(&self.path, &rotated)?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.current_day = today;

        self.prune()
    }

    /// Rotated files currently on disk, newest first.
    pub fn rotated_files(&self) -> io::Result<Vec<PathBuf>> {
        let Some(file_name) = self.path.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return Ok(Vec::new());
        };
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let prefix = format!("{}.", file_name);

        let mut dated: Vec<(NaiveDate, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let suffix = name.strip_prefix(&prefix)?;
                let day = NaiveDate::parse_from_str(suffix, DATE_SUFFIX_FORMAT).ok()?;
                Some((day, entry.path()))
            })
            .collect();

        dated.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dated.into_iter().map(|(_, path)| path).collect())
    }

    fn prune(&self) -> io::Result<()> {
        if self.backups == 0 {
            return Ok(());
        }
        for stale in self.rotated_files()?.into_iter().skip(self.backups) {
            fs::remove_file(stale)?;
        }
        Ok(())
    }
}

impl Write for DailyRotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rotate_if_needed(Local::now().date_naive())?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// `<dir>/<name>.<YYYY-MM-DD>`
fn rotated_path(base: &Path, day: NaiveDate) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}.{}", name, day.format(DATE_SUFFIX_FORMAT)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/logs/data.log");
        let mut file = DailyRotatingFile::open(&path, 7).unwrap();
        file.write_line("hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn rotates_on_new_day() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        let mut file = DailyRotatingFile::open(&path, 7).unwrap();
        file.current_day = day(2024, 3, 1);

        file.write_line_on(day(2024, 3, 1), "first").unwrap();
        file.write_line_on(day(2024, 3, 2), "second").unwrap();

        let rotated = dir.path().join("data.log.2024-03-01");
        assert_eq!(fs::read_to_string(&rotated).unwrap(), "first\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "second\n");
    }

    #[test]
    fn same_day_does_not_rotate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        let mut file = DailyRotatingFile::open(&path, 7).unwrap();
        file.current_day = day(2024, 3, 1);

        file.write_line_on(day(2024, 3, 1), "a").unwrap();
        file.write_line_on(day(2024, 3, 1), "b").unwrap();

        assert!(file.rotated_files().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn keeps_only_newest_backups() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        let mut file = DailyRotatingFile::open(&path, 2).unwrap();
        file.current_day = day(2024, 3, 1);

        for d in 1..=5 {
            file.write_line_on(day(2024, 3, d), &format!("day {}", d))
                .unwrap();
        }

        let rotated = file.rotated_files().unwrap();
        assert_eq!(
            rotated,
            vec![
                dir.path().join("data.log.2024-03-04"),
                dir.path().join("data.log.2024-03-03"),
            ]
        );
        assert_eq!(fs::read_to_string(&path).unwrap(), "day 5\n");
    }

    #[test]
    fn zero_backups_keeps_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");
        let mut file = DailyRotatingFile::open(&path, 0).unwrap();
        file.current_day = day(2024, 1, 1);

        for d in 1..=4 {
            file.write_line_on(day(2024, 1, d), "x").unwrap();
        }
        assert_eq!(file.rotated_files().unwrap().len(), 3);
    }

    #[test]
    fn ignores_unrelated_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data.log.backup"), "keep").unwrap();
        fs::write(dir.path().join("other.log.2024-01-01"), "keep").unwrap();

        let file = DailyRotatingFile::open(dir.path().join("data.log"), 1).unwrap();
        assert!(file.rotated_files().unwrap().is_empty());
    }
}
