use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const BACKUP_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";
const MEGABYTE: u64 = 1024 * 1024;
const DEFAULT_MAX_SIZE_MB: u64 = 100;

/// Rotation and retention settings of a [`RollingFile`].
#[derive(Debug, Clone)]
pub struct RollPolicy {
    /// Size in megabytes at which the file is rotated; 0 means 100.
    pub max_size_mb: u64,
    /// Rotated files to keep; 0 keeps all of them.
    pub max_count: usize,
    /// Rotated files older than this are removed.
    pub max_age: Option<Duration>,
    /// Gzip rotated files.
    pub compress: bool,
    pub create_parent: bool,
    pub dir_mode: u32,
    pub file_mode: u32,
    /// Apply `file_mode` to files that already exist.
    pub chmod: bool,
    /// Owner and group applied to newly opened files.
    pub chown: Option<(Option<u32>, Option<u32>)>,
}

impl Default for RollPolicy {
    fn default() -> Self {
        RollPolicy {
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            max_count: 0,
            max_age: None,
            compress: false,
            create_parent: true,
            dir_mode: 0o755,
            file_mode: 0o640,
            chmod: true,
            chown: None,
        }
    }
}

/// A rotated file found next to the active one.
#[derive(Debug)]
struct Backup {
    timestamp: DateTime<Utc>,
    sequence: u32,
    path: PathBuf,
    compressed: bool,
}

/// Size-rotated log file.
///
/// When a write would push the file past `max_size_mb`, the file is renamed
/// to `<stem>-<timestamp><ext>` and a fresh one is opened. Retention and
/// compression of rotated files run on a background thread started at the
/// first rotation, so a write that rotates only pays for the rename. The file
/// is opened lazily and reopened after [`close`](RollingFile::close).
pub struct RollingFile {
    path: PathBuf,
    policy: RollPolicy,
    retention: Arc<Retention>,
    mill_tx: Option<SyncSender<()>>,
    file: Option<File>,
    size: u64,
}

/// Retention settings and backup discovery, shared with the cleanup thread.
struct Retention {
    dir: PathBuf,
    pattern: Regex,
    max_count: usize,
    max_age: Option<Duration>,
    compress: bool,
}

impl RollingFile {
    /// Opens (creating if necessary) the file at `path`.
    pub fn open(path: impl Into<PathBuf>, policy: RollPolicy) -> io::Result<Self> {
        let path = path.into();
        let (stem, ext) = split_name(&path);
        let backup_pattern = Regex::new(&format!(
            r"^{}-(\d{{4}}-\d{{2}}-\d{{2}}T\d{{2}}-\d{{2}}-\d{{2}}\.\d{{3}})(?:-(\d+))?{}(\.gz)?$",
            regex::escape(&stem),
            regex::escape(&ext),
        ))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let retention = Arc::new(Retention {
            dir,
            pattern: backup_pattern,
            max_count: policy.max_count,
            max_age: policy.max_age,
            compress: policy.compress,
        });

        let mut roller = RollingFile {
            path,
            policy,
            retention,
            mill_tx: None,
            file: None,
            size: 0,
        };
        roller.open_existing()?;
        Ok(roller)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn max_size(&self) -> u64 {
        match self.policy.max_size_mb {
            0 => DEFAULT_MAX_SIZE_MB * MEGABYTE,
            mb => mb.saturating_mul(MEGABYTE),
        }
    }

    /// Closes the active file. The next write opens it again.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    /// Rotates immediately, regardless of size.
    pub fn rotate(&mut self) -> io::Result<()> {
        self.close()?;
        if self.path.exists() {
            let backup = self.backup_path(Utc::now());
            fs::rename(&self.path, &backup)?;
            tracing::debug!(from = %self.path.display(), to = %backup.display(), "rotated log file");
        }
        self.file = Some(self.create_file(true)?);
        self.size = 0;
        self.request_mill();
        Ok(())
    }

    /// Wakes the cleanup thread. A request that arrives while one is already
    /// pending is dropped; the pending pass sees every backup.
    fn request_mill(&mut self) {
        if self.mill_tx.is_none() {
            let (tx, rx) = mpsc::sync_channel::<()>(1);
            let retention = Arc::clone(&self.retention);
            let spawned = thread::Builder::new()
                .name("log-retention".into())
                .spawn(move || {
                    while rx.recv().is_ok() {
                        retention.mill();
                    }
                });
            match spawned {
                Ok(_) => self.mill_tx = Some(tx),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to start log retention thread");
                    return;
                }
            }
        }
        if let Some(tx) = &self.mill_tx {
            if let Err(TrySendError::Disconnected(())) = tx.try_send(()) {
                self.mill_tx = None;
            }
        }
    }

    fn open_existing(&mut self) -> io::Result<()> {
        if self.policy.create_parent {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                create_dir_all(parent, self.policy.dir_mode)?;
            }
        }
        let file = self.create_file(false)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn create_file(&self, truncate: bool) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(self.policy.file_mode);
        }
        let file = options.open(&self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if self.policy.chmod {
                file.set_permissions(fs::Permissions::from_mode(self.policy.file_mode))?;
            }
            if let Some((owner, group)) = self.policy.chown {
                std::os::unix::fs::chown(&self.path, owner, group)?;
            }
        }
        Ok(file)
    }

    fn backup_path(&self, now: DateTime<Utc>) -> PathBuf {
        let (stem, ext) = split_name(&self.path);
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        let stamp = now.format(BACKUP_TIME_FORMAT);
        let mut candidate = dir.join(format!("{stem}-{stamp}{ext}"));
        let mut n = 1;
        while candidate.exists() || gz_name(&candidate).exists() {
            candidate = dir.join(format!("{stem}-{stamp}-{n}{ext}"));
            n += 1;
        }
        candidate
    }
}

impl Retention {
    fn backups(&self) -> io::Result<Vec<Backup>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(caps) = self.pattern.captures(name) else {
                continue;
            };
            let Ok(naive) = NaiveDateTime::parse_from_str(&caps[1], BACKUP_TIME_FORMAT) else {
                continue;
            };
            backups.push(Backup {
                timestamp: Utc.from_utc_datetime(&naive),
                sequence: caps.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0),
                path: entry.path(),
                compressed: caps.get(3).is_some(),
            });
        }
        // newest first
        backups.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        Ok(backups)
    }

    /// Applies retention and compression to rotated files. Failures are
    /// logged.
    fn mill(&self) {
        let backups = match self.backups() {
            Ok(backups) => backups,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list rotated log files");
                return;
            }
        };

        let cutoff = self
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| Utc::now() - age);

        for (i, backup) in backups.iter().enumerate() {
            let over_count = self.max_count > 0 && i >= self.max_count;
            let too_old = cutoff.map_or(false, |cutoff| backup.timestamp < cutoff);
            if over_count || too_old {
                if let Err(e) = fs::remove_file(&backup.path) {
                    tracing::warn!(path = %backup.path.display(), error = %e, "failed to remove rotated log file");
                }
                continue;
            }
            if self.compress && !backup.compressed {
                if let Err(e) = compress_file(&backup.path) {
                    tracing::warn!(path = %backup.path.display(), error = %e, "failed to compress rotated log file");
                }
            }
        }
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len() as u64;
        let max = self.max_size();
        if len > max {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write length {len} exceeds maximum file size {max}"),
            ));
        }
        if self.file.is_none() {
            self.open_existing()?;
        }
        if self.size + len > max {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "log file is not open"))?;
        let n = file.write(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// `app.log` -> (`app`, `.log`).
fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

fn gz_name(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.gz", path.display()))
}

fn compress_file(path: &Path) -> io::Result<()> {
    let target = gz_name(path);
    let mut source = File::open(path)?;
    let mut encoder = GzEncoder::new(File::create(&target)?, Compression::default());
    io::copy(&mut source, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    fs::remove_file(path)
}

fn create_dir_all(dir: &Path, mode: u32) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Polls the directory until `done` holds; cleanup runs on its own thread.
    fn wait_for(dir: &Path, done: impl Fn(&[String]) -> bool) -> Vec<String> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let names = names(dir);
            if done(&names) || std::time::Instant::now() > deadline {
                return names;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/app.log");
        let mut file = RollingFile::open(&path, RollPolicy::default()).unwrap();
        file.write_all(b"hello\n").unwrap();
        file.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[cfg(unix)]
    #[test]
    fn applies_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let policy = RollPolicy {
            file_mode: 0o600,
            ..Default::default()
        };
        RollingFile::open(&path, policy).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn rejects_writes_larger_than_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RollPolicy {
            max_size_mb: 1,
            ..Default::default()
        };
        let mut file = RollingFile::open(dir.path().join("app.log"), policy).unwrap();
        let err = file.write(&vec![b'x'; (MEGABYTE + 1) as usize]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rotation_keeps_max_count_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let policy = RollPolicy {
            max_count: 2,
            ..Default::default()
        };
        let mut file = RollingFile::open(&path, policy).unwrap();
        for i in 0..4 {
            file.write_all(format!("generation {i}\n").as_bytes()).unwrap();
            file.rotate().unwrap();
        }
        let names = wait_for(dir.path(), |names| names.len() == 3);
        assert_eq!(names.len(), 3, "{names:?}");
        assert!(names.contains(&"app.log".to_string()));
        assert!(names.iter().filter(|n| n.starts_with("app-")).all(|n| n.ends_with(".log")));
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn rotated_files_are_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let policy = RollPolicy {
            compress: true,
            ..Default::default()
        };
        let mut file = RollingFile::open(&path, policy).unwrap();
        file.write_all(b"compress me\n").unwrap();
        file.rotate().unwrap();

        let names = wait_for(dir.path(), |names| {
            names.iter().any(|n| n.ends_with(".log.gz")) && names.len() == 2
        });
        let gz: Vec<_> = names.into_iter().filter(|n| n.ends_with(".log.gz")).collect();
        assert_eq!(gz.len(), 1);
        let mut text = String::new();
        GzDecoder::new(File::open(dir.path().join(&gz[0])).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "compress me\n");
    }

    #[test]
    fn old_backups_are_removed_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(dir.path().join("app-2001-01-01T00-00-00.000.log"), "ancient").unwrap();
        let policy = RollPolicy {
            max_age: Some(Duration::from_secs(86_400)),
            ..Default::default()
        };
        let mut file = RollingFile::open(&path, policy).unwrap();
        file.write_all(b"recent\n").unwrap();
        file.rotate().unwrap();

        let names = wait_for(dir.path(), |names| names.len() == 2);
        assert!(!names.contains(&"app-2001-01-01T00-00-00.000.log".to_string()));
        assert_eq!(names.len(), 2, "{names:?}");
    }

    #[test]
    fn size_limit_triggers_rotation_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let policy = RollPolicy {
            max_size_mb: 1,
            ..Default::default()
        };
        let mut file = RollingFile::open(&path, policy).unwrap();
        let line = [b'x'; 1000];
        let lines = (MEGABYTE / 1000) as usize + 10;
        for _ in 0..lines {
            file.write_all(&line).unwrap();
        }
        file.flush().unwrap();

        let names = names(dir.path());
        assert_eq!(names.len(), 2, "{names:?}");
        let backup = dir.path().join(names.iter().find(|n| n.starts_with("app-")).unwrap());
        let rotated = fs::metadata(&backup).unwrap().len();
        let active = fs::metadata(&path).unwrap().len();
        assert!(rotated <= MEGABYTE);
        assert_eq!(rotated % 1000, 0);
        assert_eq!(rotated + active, (lines * 1000) as u64);
    }

    #[test]
    fn pending_cleanup_finishes_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let policy = RollPolicy {
            compress: true,
            ..Default::default()
        };
        let mut file = RollingFile::open(&path, policy).unwrap();
        file.write_all(b"last words\n").unwrap();
        file.rotate().unwrap();
        drop(file);

        let names = wait_for(dir.path(), |names| names.iter().any(|n| n.ends_with(".gz")));
        assert!(names.iter().any(|n| n.ends_with(".log.gz")), "{names:?}");
    }

    #[test]
    fn close_then_write_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let mut file = RollingFile::open(&path, RollPolicy::default()).unwrap();
        file.write_all(b"a\n").unwrap();
        file.close().unwrap();
        file.close().unwrap();
        file.write_all(b"b\n").unwrap();
        file.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\n");
    }
}
