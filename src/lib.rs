// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;
pub mod device;
pub mod episode;
pub mod error;
pub mod http;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod task;
pub mod throttle;
pub mod transfer;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{Config, RateLimit, SharedConfig};
pub use device::FilesystemDevice;
pub use episode::{Credentials, Enclosure, Episode, generate_filename};
pub use error::{ConfigError, DeviceError, HttpError, TaskError, TransferError};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use manager::QueueManager;
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use queue::TaskQueue;
pub use task::{Activity, SyncTarget, Task, TaskId, TaskStatus};
pub use transfer::{ResumableTransfer, Transferer};
