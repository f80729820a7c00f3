// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use super::{Attempt, Completion};
use crate::episode::Episode;
use crate::error::{DeviceError, TaskError, TransferError};
use crate::transfer::ProgressHook;

/// What a device is asked to store
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    pub episode: &'a Episode,
    /// Downloaded file to copy
    pub source: &'a Path,
}

/// A track already present on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTrack {
    /// Device-specific identifier, e.g. a path relative to the mount point
    pub id: String,
    pub title: String,
    pub size: u64,
}

/// A place episodes can be synchronized to
///
/// `add_track` reports progress through the same hook as a download; when
/// the hook breaks the device should stop and leave nothing half-written.
pub trait SyncTarget: Send + Sync {
    /// Copy an episode onto the device; `Ok(false)` means the device declined
    fn add_track(
        &self,
        request: &SyncRequest<'_>,
        progress: &mut ProgressHook<'_>,
    ) -> Result<bool, DeviceError>;

    /// Free space in bytes
    fn get_free_space(&self) -> Result<u64, DeviceError>;

    fn episode_on_device(&self, episode: &Episode) -> Option<DeviceTrack>;

    fn remove_track(&self, track: &DeviceTrack) -> Result<(), DeviceError>;
}

/// Copy of a downloaded episode onto a [`SyncTarget`]
pub struct SyncTask {
    source: PathBuf,
    device: Arc<dyn SyncTarget>,
    copy_started: AtomicBool,
}

impl SyncTask {
    pub(crate) fn new(source: PathBuf, device: Arc<dyn SyncTarget>) -> Self {
        Self {
            source,
            device,
            copy_started: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub(crate) fn source_size(&self) -> Option<u64> {
        std::fs::metadata(&self.source).ok().map(|m| m.len())
    }

    pub(crate) fn run(&self, attempt: &mut Attempt<'_>) -> Result<Completion, TaskError> {
        let task = attempt.task();
        let episode = task.episode();

        let size = self
            .source_size()
            .ok_or_else(|| TaskError::MissingSource(self.source.clone()))?;

        if let Some(track) = self.device.episode_on_device(episode) {
            info!(task = %task.id(), track = %track.id, "Episode already on device");
            return Ok(Completion {
                path: None,
                bytes: track.size,
            });
        }

        let available = self.device.get_free_space()?;
        if size > available {
            return Err(DeviceError::InsufficientSpace {
                required: size,
                available,
            }
            .into());
        }

        self.copy_started.store(true, Ordering::SeqCst);
        let mut aborted = false;
        let added = self.device.add_track(
            &SyncRequest {
                episode,
                source: &self.source,
            },
            &mut |block, block_size, total| {
                let flow = attempt.on_block(block, block_size, total);
                aborted |= flow.is_break();
                flow
            },
        );

        if aborted {
            return Err(TransferError::Aborted.into());
        }
        if added? {
            Ok(Completion {
                path: None,
                bytes: size,
            })
        } else {
            Err(DeviceError::Rejected(format!("'{}' was not added", episode.title)).into())
        }
    }

    /// Remove whatever a started copy left on the device
    pub(crate) fn cleanup(&self, episode: &Episode) {
        if !self.copy_started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(track) = self.device.episode_on_device(episode)
            && let Err(e) = self.device.remove_track(&track)
        {
            warn!(track = %track.id, "Could not remove track from device: {}", e);
        }
    }
}
