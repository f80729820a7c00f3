// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Attempt, Completion};
use crate::episode::{Episode, FilenameHints, generate_filename, reconcile_filename};
use crate::error::{TaskError, TransferError};
use crate::progress::ProgressEvent;
use crate::transfer::{TransferRequest, Transferer, prepare_url};

/// Suffix of the in-progress file next to the final one
const PARTIAL_SUFFIX: &str = ".partial";

/// Download of one episode into a directory
///
/// Bytes go to `<final name>.partial` and are moved over the final name
/// once the transfer completed. The final name may change after the
/// transfer when the server reports a different type or name.
pub struct DownloadTask {
    transferer: Arc<dyn Transferer>,
    download_dir: PathBuf,
    filename: Mutex<String>,
    mime_type: Mutex<Option<String>>,
}

impl DownloadTask {
    pub(crate) fn new(episode: &Episode, download_dir: PathBuf, transferer: Arc<dyn Transferer>) -> Self {
        Self {
            transferer,
            download_dir,
            filename: Mutex::new(generate_filename(episode)),
            mime_type: Mutex::new(episode.enclosure.mime_type.clone()),
        }
    }

    pub fn final_path(&self) -> PathBuf {
        self.download_dir.join(&*self.filename.lock())
    }

    pub fn partial_path(&self) -> PathBuf {
        partial_path_for(&self.final_path())
    }

    /// Size of a partial file left behind by an earlier run
    pub(crate) fn retained_bytes(&self) -> Option<u64> {
        fs::metadata(self.partial_path()).ok().map(|m| m.len())
    }

    /// Make sure a partial file exists for a requeued download
    pub(crate) fn ensure_partial(&self) {
        let partial = self.partial_path();
        if partial.exists() {
            return;
        }
        let created = fs::create_dir_all(&self.download_dir).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&partial)
                .map(drop)
        });
        if let Err(e) = created {
            warn!(path = %partial.display(), "Could not create partial file: {}", e);
        }
    }

    pub(crate) fn cleanup(&self) {
        let partial = self.partial_path();
        match fs::remove_file(&partial) {
            Ok(()) => debug!(path = %partial.display(), "Removed partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %partial.display(), "Could not remove partial file: {}", e),
        }
    }

    pub(crate) fn run(&self, attempt: &mut Attempt<'_>) -> Result<Completion, TaskError> {
        let task = attempt.task();
        let episode = task.episode();
        let config = task.config().snapshot();

        fs::create_dir_all(&self.download_dir).map_err(|e| TaskError::CreateDirectoryFailed {
            path: self.download_dir.clone(),
            source: e,
        })?;

        let partial = self.partial_path();
        let request = TransferRequest {
            url: episode.enclosure.url.clone(),
            credentials: episode.credentials.clone(),
        };

        let attempts = config.retries.saturating_add(1);
        let mut attempt_no = 1;
        let outcome = loop {
            let result = self.transferer.retrieve_resume(&request, &partial, &mut |block, size, total| {
                attempt.on_block(block, size, total)
            });

            match result {
                Ok(outcome) => break outcome,
                Err(e @ TransferError::ContentTooShort { .. })
                    if attempt_no < attempts && !task.stop_requested() =>
                {
                    warn!(task = %task.id(), attempt = attempt_no, "Retrying after short read: {}", e);
                    task.report(ProgressEvent::TransferRetrying {
                        task: task.id(),
                        title: task.title().to_string(),
                        attempt: attempt_no,
                        error: e.to_string(),
                    });
                    std::thread::sleep(config.retry_delay());
                    attempt_no += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        task.report(ProgressEvent::Finalizing {
            task: task.id(),
            title: task.title().to_string(),
        });

        // Escaping and normalisation alone must not count as a redirect
        let requested_url = if outcome.resolved_url == request.url {
            request.url.clone()
        } else {
            prepare_url(&request.url)
                .map(|(url, _)| url.to_string())
                .unwrap_or_else(|_| request.url.clone())
        };
        let content_type = outcome.headers.content_type();
        let disposition = outcome.headers.content_disposition_filename();
        let hints = FilenameHints {
            content_type: content_type.as_deref(),
            disposition: disposition.as_deref(),
            requested_url: &requested_url,
            resolved_url: &outcome.resolved_url,
        };
        self.reconcile(&hints, content_type.as_deref());

        let final_path = self.final_path();
        finalize(&partial, &final_path)?;

        Ok(Completion {
            path: Some(final_path),
            bytes: outcome.bytes_written,
        })
    }

    fn reconcile(&self, hints: &FilenameHints<'_>, content_type: Option<&str>) {
        let mut mime_type = self.mime_type.lock();
        let mut filename = self.filename.lock();

        let reconciled = reconcile_filename(&filename, mime_type.as_deref(), hints);
        if reconciled != *filename {
            info!(from = %filename, to = %reconciled, "Download renamed after transfer");
            *filename = reconciled;
        }
        if let Some(content_type) = content_type {
            *mime_type = Some(content_type.to_string());
        }
    }
}

fn partial_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Move the finished partial file over the final name
///
/// Falls back to copy and delete when a rename is not possible, e.g.
/// across filesystems.
fn finalize(partial: &Path, target: &Path) -> Result<(), TaskError> {
    if let Err(e) = fs::rename(partial, target) {
        debug!(
            from = %partial.display(),
            to = %target.display(),
            "Rename failed ({}), copying instead",
            e
        );
        fs::copy(partial, target)
            .and_then(|_| fs::remove_file(partial))
            .map_err(|e| TaskError::FinalizeFailed {
                from: partial.to_path_buf(),
                to: target.to_path_buf(),
                source: e,
            })?;
    }
    Ok(())
}
