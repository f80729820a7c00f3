// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Folder-based sync target, as used by plain mp3 players and SD cards

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{debug, warn};

use crate::episode::{Episode, generate_filename_stem, get_audio_extension};
use crate::error::DeviceError;
use crate::task::{DeviceTrack, SyncRequest, SyncTarget};
use crate::transfer::{BLOCK_SIZE, ProgressHook};

const PARTIAL_SUFFIX: &str = ".partial";
const UNKNOWN_PODCAST: &str = "Unknown Podcast";

/// Copies episodes to `<root>/<podcast>/<episode file>`
#[derive(Debug, Clone)]
pub struct FilesystemDevice {
    root: PathBuf,
    quota: Option<u64>,
}

impl FilesystemDevice {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota: None,
        }
    }

    /// Never report more free space than `bytes` minus what is stored
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_for(&self, episode: &Episode) -> PathBuf {
        let podcast = episode
            .podcast_title
            .as_deref()
            .map(sanitize_filename::sanitize)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_PODCAST.to_string());
        self.root.join(podcast)
    }

    fn track_path(&self, request: &SyncRequest<'_>) -> PathBuf {
        let extension = request
            .source
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_else(|| get_audio_extension(request.episode));
        self.folder_for(request.episode).join(format!(
            "{}.{}",
            generate_filename_stem(request.episode),
            extension
        ))
    }

    fn track_for(&self, path: &Path) -> Option<DeviceTrack> {
        let size = fs::metadata(path).ok()?.len();
        let id = path.strip_prefix(&self.root).ok()?.to_string_lossy().into_owned();
        let title = path.file_stem()?.to_string_lossy().into_owned();
        Some(DeviceTrack { id, title, size })
    }

    fn used_bytes(&self) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let Ok(entries) = fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| match entry.file_type() {
                    Ok(kind) if kind.is_dir() => walk(&entry.path()),
                    Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
                    Err(_) => 0,
                })
                .sum()
        }
        walk(&self.root)
    }

    fn copy(
        &self,
        source: &Path,
        partial: &Path,
        progress: &mut ProgressHook<'_>,
    ) -> Result<bool, DeviceError> {
        let mut reader = File::open(source).map_err(|e| io_error(source, e))?;
        let total = reader.metadata().map_err(|e| io_error(source, e))?.len();
        let mut writer = File::create(partial).map_err(|e| io_error(partial, e))?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut block = 0;

        if progress(block, BLOCK_SIZE, Some(total)).is_break() {
            return Ok(false);
        }

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_error(source, e)),
            };
            writer
                .write_all(&buf[..n])
                .map_err(|e| io_error(partial, e))?;
            block += 1;

            if progress(block, BLOCK_SIZE, Some(total)).is_break() {
                return Ok(false);
            }
        }

        writer.flush().map_err(|e| io_error(partial, e))?;
        Ok(true)
    }
}

impl SyncTarget for FilesystemDevice {
    fn add_track(
        &self,
        request: &SyncRequest<'_>,
        progress: &mut ProgressHook<'_>,
    ) -> Result<bool, DeviceError> {
        let target = self.track_path(request);
        let folder = self.folder_for(request.episode);
        fs::create_dir_all(&folder).map_err(|e| io_error(&folder, e))?;

        let mut partial = target.as_os_str().to_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        let copied = self.copy(request.source, &partial, progress);
        if !matches!(copied, Ok(true)) {
            if let Err(e) = fs::remove_file(&partial)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(path = %partial.display(), "Could not remove partial copy: {}", e);
            }
            return copied;
        }

        fs::rename(&partial, &target).map_err(|e| io_error(&target, e))?;
        debug!(path = %target.display(), "Track copied to device");
        Ok(true)
    }

    fn get_free_space(&self) -> Result<u64, DeviceError> {
        let disk = available_disk_space(&self.root);
        let quota = self
            .quota
            .map(|quota| quota.saturating_sub(self.used_bytes()));

        match (disk, quota) {
            (Some(disk), Some(quota)) => Ok(disk.min(quota)),
            (Some(free), None) | (None, Some(free)) => Ok(free),
            (None, None) => {
                debug!(root = %self.root.display(), "No disk found for device, free space unknown");
                Ok(u64::MAX)
            }
        }
    }

    fn episode_on_device(&self, episode: &Episode) -> Option<DeviceTrack> {
        let stem = generate_filename_stem(episode);
        let entries = fs::read_dir(self.folder_for(episode)).ok()?;
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.extension().is_none_or(|ext| ext != &PARTIAL_SUFFIX[1..])
                    && path.file_stem().is_some_and(|s| s.to_string_lossy() == stem)
            })
            .find_map(|path| self.track_for(&path))
    }

    fn remove_track(&self, track: &DeviceTrack) -> Result<(), DeviceError> {
        let path = self.root.join(&track.id);
        fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
        debug!(path = %path.display(), "Track removed from device");

        // Drop the podcast folder once it is empty
        if let Some(folder) = path.parent()
            && folder != self.root
        {
            let _ = fs::remove_dir(folder);
        }
        Ok(())
    }
}

fn io_error(path: &Path, source: io::Error) -> DeviceError {
    DeviceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn nearest_existing_path(path: &Path) -> PathBuf {
    let mut candidate = path.to_path_buf();
    while !candidate.exists() {
        if !candidate.pop() {
            return PathBuf::from(".");
        }
    }
    candidate
}

/// Free space of the disk mounted closest to `path`
fn available_disk_space(path: &Path) -> Option<u64> {
    let target = nearest_existing_path(path);
    let target = fs::canonicalize(&target).unwrap_or(target);
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
