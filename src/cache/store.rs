use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use log::{info, warn};
use rand::seq::SliceRandom;

use crate::config::AppConfig;
use crate::images::image_extension;

/// Bytes read from an entry to check that it is readable.
const HEADER_PROBE_LEN: usize = 512;

/// A file in the cache folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    name: String,
    path: PathBuf,
}

impl CacheEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extension(&self) -> Option<String> {
        image_extension(&self.name)
    }
}

/// Strictly increasing IDs derived from the wall clock, used as file names.
#[derive(Debug, Default)]
pub struct EntryIdGenerator {
    last: AtomicI64,
}

impl EntryIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> i64 {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros() * 1_000);

        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Filesystem view of the cache folder for one config snapshot.
#[derive(Debug, Clone)]
pub struct CacheStore {
    folder: String,
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl CacheStore {
    pub fn new(base_dir: &Path, config: &AppConfig) -> Self {
        let dir = base_dir.join(&config.cache_folder);
        let tmp_dir = dir.join(&config.cache_tmp_folder);
        Self {
            folder: config.cache_folder.clone(),
            dir,
            tmp_dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// URL segment the cache is served under.
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Regular files in the cache folder at call time. Sub-directories (the
    /// temp folder included) are not entries.
    pub fn list(&self) -> io::Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = dir_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            entries.push(CacheEntry {
                name,
                path: dir_entry.path(),
            });
        }
        Ok(entries)
    }

    pub fn count(&self) -> io::Result<usize> {
        self.list().map(|entries| entries.len())
    }

    /// Supported extension and a readable, non-empty header. This is a
    /// readability probe, not structural validation.
    pub fn is_valid_image(&self, entry: &CacheEntry) -> bool {
        if entry.extension().is_none() {
            return false;
        }

        let mut file = match fs::File::open(entry.path()) {
            Ok(file) => file,
            Err(e) => {
                warn!("Could not open cache entry {}: {}", entry.path().display(), e);
                return false;
            }
        };

        let mut header = [0u8; HEADER_PROBE_LEN];
        matches!(file.read(&mut header), Ok(n) if n > 0)
    }

    /// Best-effort delete; failures are logged only.
    pub fn remove(&self, entry: &CacheEntry) {
        match fs::remove_file(entry.path()) {
            Ok(()) => info!("Removed invalid cache entry: {}", entry.name()),
            Err(e) => warn!("Failed to remove cache entry {}: {}", entry.path().display(), e),
        }
    }

    /// Maintenance pass: deletes every entry that fails `is_valid_image` and
    /// returns the ones that pass.
    pub fn prune_invalid(&self) -> io::Result<Vec<CacheEntry>> {
        let (valid, invalid): (Vec<_>, Vec<_>) = self
            .list()?
            .into_iter()
            .partition(|entry| self.is_valid_image(entry));

        for entry in &invalid {
            self.remove(entry);
        }

        Ok(valid)
    }

    pub fn pick_random(entries: &[CacheEntry]) -> Option<&CacheEntry> {
        entries.choose(&mut rand::thread_rng())
    }

    /// Resolves a requested file name to an existing, servable entry.
    pub fn lookup(&self, name: &str) -> Option<CacheEntry> {
        if name.starts_with('.') || name.contains(['/', '\\']) || image_extension(name).is_none() {
            return None;
        }

        let path = self.path_for(name);
        if !path.is_file() {
            return None;
        }

        Some(CacheEntry {
            name: name.to_string(),
            path,
        })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn url_for(&self, entry: &CacheEntry, host: &str) -> String {
        format!("http://{}/{}/{}", host, self.folder, entry.name())
    }

    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [&self.dir, &self.tmp_dir] {
            if !dir.is_dir() {
                info!("Creating folder: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }

    /// Where a raw download with the given ID is staged before transcoding.
    pub fn temp_path(&self, id: i64, extension: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}.{}", id, extension))
    }

    /// Where the final bytes of entry `id` are written before being renamed
    /// into the cache folder. Listing only sees complete files.
    pub fn staging_path(&self, id: i64) -> PathBuf {
        self.tmp_dir.join(format!("{}.jpg.part", id))
    }

    /// Published entries are always named `.jpg`, even when the transcoder
    /// kept the original PNG bytes.
    pub fn entry_for_id(&self, id: i64) -> CacheEntry {
        let name = format!("{}.jpg", id);
        CacheEntry {
            path: self.dir.join(&name),
            name,
        }
    }
}
