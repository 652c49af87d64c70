use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::models::config::{duration_secs, CallInfo, RecordingOptions};
use crate::models::error::{RecordingError, Result};
use crate::models::recording_result::RecordingMetadata;
use crate::storage::metadata;
use crate::traits::delegates::{DelegateSet, StorageDelegate};

/// Extensions treated as recordings by cleanup.
const RECORDING_EXTENSIONS: [&str; 4] = ["wav", "mp3", "m4a", "opus"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileManagerConfig {
    /// Free bytes required before a recording may start (default: 100 MiB).
    pub min_free_space: u64,

    /// Delete recordings older than `retention` when space runs low.
    pub auto_cleanup: bool,

    #[serde(with = "duration_secs")]
    pub retention: Duration,

    /// Attempts at `_NNN` suffixes before giving up on a unique name.
    pub max_unique_attempts: u32,
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self {
            min_free_space: 100 * 1024 * 1024,
            auto_cleanup: false,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            max_unique_attempts: 1000,
        }
    }
}

impl FileManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_unique_attempts == 0 {
            return Err(RecordingError::Configuration(
                "max unique attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub available: u64,
    pub total: u64,
}

/// Free-space query for the volume holding a path.
pub trait DiskSpaceProvider: Send + Sync {
    fn disk_space(&self, path: &Path) -> Result<DiskSpace>;
}

/// `statvfs` on unix.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDiskSpace;

impl DiskSpaceProvider for SystemDiskSpace {
    #[cfg(unix)]
    #[allow(clippy::unnecessary_cast)]
    fn disk_space(&self, path: &Path) -> Result<DiskSpace> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| RecordingError::Storage(format!("invalid path: {}", path.display())))?;

        // SAFETY: `c_path` is NUL-terminated and `stat` is a plain C struct.
        let stat = unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(RecordingError::io(
                    "failed to query disk space",
                    io::Error::last_os_error(),
                ));
            }
            stat
        };

        Ok(DiskSpace {
            available: stat.f_bavail as u64 * stat.f_frsize as u64,
            total: stat.f_blocks as u64 * stat.f_frsize as u64,
        })
    }

    #[cfg(not(unix))]
    fn disk_space(&self, path: &Path) -> Result<DiskSpace> {
        fs::metadata(path).map_err(|e| RecordingError::io("failed to query disk space", e))?;
        // No portable free-space query; report unlimited space.
        Ok(DiskSpace {
            available: u64::MAX,
            total: u64::MAX,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageWarning {
    LowDiskSpace {
        directory: PathBuf,
        available: u64,
        required: u64,
    },
    CleanupPerformed {
        directory: PathBuf,
        files_deleted: usize,
        bytes_freed: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_deleted: usize,
    pub bytes_freed: u64,
}

/// Naming, free-space checks, cleanup and sidecar I/O for recording files.
pub struct RecordingFileManager {
    config: FileManagerConfig,
    disk: Arc<dyn DiskSpaceProvider>,
    delegates: DelegateSet<dyn StorageDelegate>,
}

impl RecordingFileManager {
    pub fn new(config: FileManagerConfig) -> Self {
        Self::with_disk_space(config, Arc::new(SystemDiskSpace))
    }

    pub fn with_disk_space(config: FileManagerConfig, disk: Arc<dyn DiskSpaceProvider>) -> Self {
        Self {
            config,
            disk,
            delegates: DelegateSet::new(),
        }
    }

    pub fn config(&self) -> &FileManagerConfig {
        &self.config
    }

    pub fn add_delegate(&self, delegate: Arc<dyn StorageDelegate>) {
        self.delegates.add(delegate);
    }

    /// Expand the options' file-name template and append the codec extension.
    ///
    /// Placeholders: `{timestamp}` (`YYYYMMDD_HHMMSS`), `{date}`, `{time}`,
    /// `{caller}`, `{callee}`, `{duration}` (max duration in seconds),
    /// `{codec}`, `{samplerate}`, `{channels}`. Characters that are invalid in
    /// file names are replaced by `_`.
    pub fn generate_file_name(
        &self,
        options: &RecordingOptions,
        call: &CallInfo,
        now: DateTime<Utc>,
    ) -> String {
        let party = |number: &str| {
            let trimmed = number.trim();
            if trimmed.is_empty() {
                "unknown".to_string()
            } else {
                trimmed.to_string()
            }
        };

        let name = options
            .file_name_template
            .replace("{timestamp}", &now.format("%Y%m%d_%H%M%S").to_string())
            .replace("{date}", &now.format("%Y-%m-%d").to_string())
            .replace("{time}", &now.format("%H-%M-%S").to_string())
            .replace("{caller}", &party(&call.caller_number))
            .replace("{callee}", &party(&call.callee_number))
            .replace("{duration}", &options.max_duration.as_secs().to_string())
            .replace("{codec}", &options.codec.name().to_lowercase())
            .replace("{samplerate}", &options.sample_rate.to_string())
            .replace("{channels}", &options.channels.to_string());

        format!("{}.{}", sanitize_file_name(&name), options.codec.file_extension())
    }

    /// `dir/name`, or the first free `dir/stem_NNN.ext`.
    pub fn ensure_unique_file_name(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }

        let base = Path::new(name);
        let stem = base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("recording");
        let extension = base.extension().and_then(|s| s.to_str());

        for i in 1..=self.config.max_unique_attempts {
            let file_name = match extension {
                Some(ext) => format!("{}_{:03}.{}", stem, i, ext),
                None => format!("{}_{:03}", stem, i),
            };
            let path = dir.join(file_name);
            if !path.exists() {
                return Ok(path);
            }
        }

        Err(RecordingError::Storage(format!(
            "no unique file name for {} after {} attempts",
            name, self.config.max_unique_attempts
        )))
    }

    /// Free space on the volume that holds (or will hold) `dir`.
    pub fn check_disk_space(&self, dir: &Path) -> Result<DiskSpace> {
        self.disk.disk_space(existing_ancestor(dir))
    }

    /// Fail with `InsufficientSpace` unless `min_free_space` is available,
    /// cleaning up old recordings first when enabled.
    pub fn ensure_space(&self, dir: &Path) -> Result<DiskSpace> {
        let required = self.config.min_free_space;
        let space = self.check_disk_space(dir)?;
        if space.available >= required {
            return Ok(space);
        }

        warn!(
            "Low disk space in {}: {} bytes available, {} required",
            dir.display(),
            space.available,
            required
        );
        self.warn(StorageWarning::LowDiskSpace {
            directory: dir.to_path_buf(),
            available: space.available,
            required,
        });

        let space = if self.config.auto_cleanup && dir.is_dir() {
            let report = self.cleanup_old_recordings(dir, self.config.retention)?;
            if report.files_deleted == 0 {
                space
            } else {
                self.check_disk_space(dir)?
            }
        } else {
            space
        };

        if space.available >= required {
            Ok(space)
        } else {
            Err(RecordingError::InsufficientSpace {
                available: space.available,
                required,
            })
        }
    }

    /// Delete recordings (and their sidecars) last modified at least `retention` ago.
    pub fn cleanup_old_recordings(&self, dir: &Path, retention: Duration) -> Result<CleanupReport> {
        let entries = fs::read_dir(dir).map_err(|e| RecordingError::io("failed to list recordings", e))?;
        let now = SystemTime::now();
        let mut report = CleanupReport::default();

        for entry in entries.flatten() {
            let path = entry.path();
            if !is_recording_file(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < retention {
                continue;
            }

            match self.delete_recording(&path) {
                Ok(true) => {
                    report.files_deleted += 1;
                    report.bytes_freed += meta.len();
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to delete old recording {}: {}", path.display(), e),
            }
        }

        if report.files_deleted > 0 {
            info!(
                "Cleaned up {} recordings ({} bytes) in {}",
                report.files_deleted,
                report.bytes_freed,
                dir.display()
            );
            self.warn(StorageWarning::CleanupPerformed {
                directory: dir.to_path_buf(),
                files_deleted: report.files_deleted,
                bytes_freed: report.bytes_freed,
            });
        }
        Ok(report)
    }

    /// Create an empty recording file, creating parent directories as needed.
    pub fn create_recording_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| RecordingError::io("failed to create recording directory", e))?;
            }
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| RecordingError::io("failed to create recording file", e))?;

        debug!("Created recording file {}", path.display());
        self.delegates.notify(|d| d.on_file_created(path));
        Ok(())
    }

    /// Delete a recording and its sidecar. Returns whether the audio file existed.
    pub fn delete_recording(&self, path: &Path) -> Result<bool> {
        let existed = remove_if_exists(path)
            .map_err(|e| RecordingError::io("failed to delete recording", e))?;
        remove_if_exists(&metadata::metadata_path(path))
            .map_err(|e| RecordingError::io("failed to delete metadata", e))?;

        if existed {
            debug!("Deleted recording {}", path.display());
            self.delegates.notify(|d| d.on_file_deleted(path));
        }
        Ok(existed)
    }

    pub fn write_metadata(&self, metadata: &RecordingMetadata, recording_path: &Path) -> Result<PathBuf> {
        metadata::write_metadata(metadata, recording_path)
    }

    pub fn read_metadata(&self, recording_path: &Path) -> Result<RecordingMetadata> {
        metadata::read_metadata(recording_path)
    }

    /// Whether a file can be created in `dir` right now.
    pub fn is_writable(&self, dir: &Path) -> bool {
        let marker = dir.join(format!(".write_check_{}", uuid::Uuid::new_v4()));
        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {
                let _ = fs::remove_file(&marker);
                true
            }
            Err(_) => false,
        }
    }

    fn warn(&self, warning: StorageWarning) {
        self.delegates.notify(|d| d.on_storage_warning(&warning));
    }
}

/// Replace characters that are invalid in file names on common platforms.
pub fn sanitize_file_name(input: &str) -> String {
    let sanitized: String = input
        .trim()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim_matches('.');
    if sanitized.is_empty() {
        "recording".to_string()
    } else {
        sanitized.to_string()
    }
}

fn is_recording_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| RECORDING_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."))
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;

    struct FixedSpace {
        available: Mutex<Vec<u64>>,
    }

    impl FixedSpace {
        /// Successive queries return successive values; the last one repeats.
        fn sequence(values: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                available: Mutex::new(values.iter().rev().copied().collect()),
            })
        }
    }

    impl DiskSpaceProvider for FixedSpace {
        fn disk_space(&self, _path: &Path) -> Result<DiskSpace> {
            let mut values = self.available.lock();
            let available = if values.len() > 1 {
                values.pop().unwrap_or(0)
            } else {
                values.last().copied().unwrap_or(0)
            };
            Ok(DiskSpace {
                available,
                total: 1 << 40,
            })
        }
    }

    #[derive(Default)]
    struct Events {
        warnings: Mutex<Vec<StorageWarning>>,
        created: Mutex<Vec<PathBuf>>,
        deleted: Mutex<Vec<PathBuf>>,
    }

    impl StorageDelegate for Events {
        fn on_storage_warning(&self, warning: &StorageWarning) {
            self.warnings.lock().push(warning.clone());
        }

        fn on_file_created(&self, path: &Path) {
            self.created.lock().push(path.to_path_buf());
        }

        fn on_file_deleted(&self, path: &Path) {
            self.deleted.lock().push(path.to_path_buf());
        }
    }

    fn age_file(path: &Path, age: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn template_placeholders() {
        let manager = RecordingFileManager::new(FileManagerConfig::default());
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let call = CallInfo::new("sip:1001@pbx/a", "1002");

        let name = manager.generate_file_name(&RecordingOptions::default(), &call, now);
        assert_eq!(name, "call_20240305_140709_sip_1001@pbx_a_1002.wav");

        let options = RecordingOptions {
            file_name_template: "{date}-{time}-{codec}-{samplerate}-{channels}-{duration}-{callee}".into(),
            ..Default::default()
        };
        let name = manager.generate_file_name(&options, &CallInfo::default(), now);
        assert_eq!(name, "2024-03-05-14-07-09-pcm_wav-8000-1-14400-unknown.wav");
    }

    #[test]
    fn compressed_codecs_still_get_wav_extension() {
        let manager = RecordingFileManager::new(FileManagerConfig::default());
        let options = RecordingOptions {
            codec: crate::models::config::AudioCodec::Opus,
            file_name_template: "{codec}".into(),
            ..Default::default()
        };
        let name = manager.generate_file_name(&options, &CallInfo::default(), Utc::now());
        assert_eq!(name, "opus.wav");
    }

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize_file_name("a<b>c:d\"e|f?g*h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_file_name("with space\ttab"), "with_space_tab");
        assert_eq!(sanitize_file_name("..."), "recording");
        assert_eq!(sanitize_file_name(""), "recording");
    }

    #[test]
    fn unique_names_get_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RecordingFileManager::new(FileManagerConfig::default());

        let first = manager.ensure_unique_file_name(dir.path(), "call.wav").unwrap();
        assert_eq!(first, dir.path().join("call.wav"));
        fs::write(&first, b"").unwrap();

        let second = manager.ensure_unique_file_name(dir.path(), "call.wav").unwrap();
        assert_eq!(second, dir.path().join("call_001.wav"));
        fs::write(&second, b"").unwrap();

        let third = manager.ensure_unique_file_name(dir.path(), "call.wav").unwrap();
        assert_eq!(third, dir.path().join("call_002.wav"));
    }

    #[test]
    fn unique_name_gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RecordingFileManager::new(FileManagerConfig {
            max_unique_attempts: 2,
            ..Default::default()
        });
        for name in ["call.wav", "call_001.wav", "call_002.wav"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert!(matches!(
            manager.ensure_unique_file_name(dir.path(), "call.wav"),
            Err(RecordingError::Storage(_))
        ));
    }

    #[test]
    fn ensure_space_reports_shortfall() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Events::default());
        let manager = RecordingFileManager::with_disk_space(
            FileManagerConfig::default(),
            FixedSpace::sequence(&[1024]),
        );
        manager.add_delegate(events.clone());

        let err = manager.ensure_space(dir.path()).unwrap_err();
        assert_eq!(
            err,
            RecordingError::InsufficientSpace {
                available: 1024,
                required: 100 * 1024 * 1024
            }
        );
        assert!(matches!(
            events.warnings.lock()[0],
            StorageWarning::LowDiskSpace { available: 1024, .. }
        ));
    }

    #[test]
    fn ensure_space_cleans_up_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.wav");
        fs::write(&old, vec![0u8; 64]).unwrap();
        age_file(&old, Duration::from_secs(40 * 24 * 60 * 60));

        let manager = RecordingFileManager::with_disk_space(
            FileManagerConfig {
                auto_cleanup: true,
                ..Default::default()
            },
            FixedSpace::sequence(&[10, 500 * 1024 * 1024]),
        );

        let space = manager.ensure_space(dir.path()).unwrap();
        assert_eq!(space.available, 500 * 1024 * 1024);
        assert!(!old.exists());
    }

    #[test]
    fn cleanup_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Events::default());
        let manager = RecordingFileManager::new(FileManagerConfig::default());
        manager.add_delegate(events.clone());

        let old = dir.path().join("old.wav");
        let old_sidecar = metadata::metadata_path(&old);
        let fresh = dir.path().join("fresh.wav");
        let notes = dir.path().join("notes.txt");
        for path in [&old, &old_sidecar, &fresh, &notes] {
            fs::write(path, b"data").unwrap();
        }
        let month = Duration::from_secs(31 * 24 * 60 * 60);
        age_file(&old, month);
        age_file(&notes, month);

        let report = manager
            .cleanup_old_recordings(dir.path(), Duration::from_secs(7 * 24 * 60 * 60))
            .unwrap();

        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.bytes_freed, 4);
        assert!(!old.exists());
        assert!(!old_sidecar.exists());
        assert!(fresh.exists());
        assert!(notes.exists());
        assert_eq!(*events.deleted.lock(), vec![old.clone()]);
        assert!(matches!(
            events.warnings.lock()[0],
            StorageWarning::CleanupPerformed { files_deleted: 1, .. }
        ));
    }

    #[test]
    fn create_and_delete_recording() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(Events::default());
        let manager = RecordingFileManager::new(FileManagerConfig::default());
        manager.add_delegate(events.clone());

        let path = dir.path().join("nested").join("call.wav");
        manager.create_recording_file(&path).unwrap();
        assert!(path.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(manager.create_recording_file(&path).is_err());

        assert!(manager.delete_recording(&path).unwrap());
        assert!(!manager.delete_recording(&path).unwrap());
        assert_eq!(events.created.lock().len(), 1);
        assert_eq!(events.deleted.lock().len(), 1);
    }

    #[test]
    fn writability_check() {
        let dir = tempfile::tempdir().unwrap();
        let manager = RecordingFileManager::new(FileManagerConfig::default());
        assert!(manager.is_writable(dir.path()));
        assert!(!manager.is_writable(&dir.path().join("missing")));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn system_disk_space_reports_something() {
        let dir = tempfile::tempdir().unwrap();
        let space = SystemDiskSpace.disk_space(dir.path()).unwrap();
        assert!(space.total >= space.available);
    }
}
