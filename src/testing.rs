// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mocks shared by the unit tests of several modules

use std::collections::VecDeque;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use url::Url;

use crate::config::Config;
use crate::error::HttpError;
use crate::http::{Headers, HttpClient, HttpRequest, HttpResponse};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::task::Task;

/// Deterministic, non-repeating-per-block payload
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Config without delays so retry paths run instantly
pub fn fast_config() -> Config {
    Config {
        retry_delay_ms: 0,
        retry_backoff_ms: 0,
        progress_interval_ms: 0,
        ..Config::default()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub range_start: Option<u64>,
    pub with_credentials: bool,
}

/// In-memory HTTP server for a single resource
pub struct MediaServer {
    data: Vec<u8>,
    honor_range: bool,
    misreport_range: bool,
    reject_credentials: bool,
    content_type: Option<String>,
    disposition: Option<String>,
    resolved_url: Option<String>,
    block_delay: Duration,
    statuses: Mutex<VecDeque<u16>>,
    connect_failures: Mutex<u32>,
    truncations: Mutex<VecDeque<u64>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MediaServer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            honor_range: true,
            misreport_range: false,
            reject_credentials: false,
            content_type: None,
            disposition: None,
            resolved_url: None,
            block_delay: Duration::ZERO,
            statuses: Mutex::new(VecDeque::new()),
            connect_failures: Mutex::new(0),
            truncations: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer range requests with 200 and the full body
    pub fn ignoring_range(mut self) -> Self {
        self.honor_range = false;
        self
    }

    /// Answer range requests with 206 starting at offset zero
    pub fn misreporting_range(mut self) -> Self {
        self.misreport_range = true;
        self
    }

    /// Answer 401 to any request carrying credentials
    pub fn rejecting_credentials(mut self) -> Self {
        self.reject_credentials = true;
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn with_disposition(mut self, disposition: &str) -> Self {
        self.disposition = Some(disposition.to_string());
        self
    }

    pub fn with_resolved_url(mut self, url: &str) -> Self {
        self.resolved_url = Some(url.to_string());
        self
    }

    /// Sleep before every body read
    pub fn with_block_delay(mut self, delay: Duration) -> Self {
        self.block_delay = delay;
        self
    }

    /// Answer the next requests with these statuses and an empty body
    pub fn respond_with_statuses(&self, statuses: &[u16]) {
        self.statuses.lock().extend(statuses);
    }

    /// Fail the next `count` requests with a connect error
    pub fn fail_to_connect(&self, count: u32) {
        *self.connect_failures.lock() += count;
    }

    /// Drop the connection of the next response after `bytes` body bytes
    pub fn truncate_next(&self, bytes: u64) {
        self.truncations.lock().push_back(bytes);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    fn response(&self, request: &HttpRequest<'_>, status: u16, headers: Headers, body: Body) -> HttpResponse {
        let url = match &self.resolved_url {
            Some(resolved) => Url::parse(resolved).unwrap(),
            None => request.url.clone(),
        };
        HttpResponse {
            status,
            headers,
            url,
            body: Box::new(body),
        }
    }
}

impl HttpClient for MediaServer {
    fn get(&self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError> {
        self.requests.lock().push(RecordedRequest {
            url: request.url.to_string(),
            range_start: request.range_start,
            with_credentials: request.credentials.is_some(),
        });

        {
            let mut failures = self.connect_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(HttpError::Connect {
                    url: request.url.to_string(),
                    message: "connection refused".to_string(),
                });
            }
        }

        if let Some(status) = self.statuses.lock().pop_front() {
            return Ok(self.response(request, status, Headers::new(), Body::empty()));
        }

        if self.reject_credentials && request.credentials.is_some() {
            return Ok(self.response(request, 401, Headers::new(), Body::empty()));
        }

        let len = self.data.len() as u64;
        let mut headers = Headers::new();
        if let Some(content_type) = &self.content_type {
            headers.insert("Content-Type", content_type.clone());
        }
        if let Some(disposition) = &self.disposition {
            headers.insert("Content-Disposition", disposition.clone());
        }

        let (status, body) = match request.range_start {
            Some(_) if self.misreport_range => {
                headers.insert(
                    "Content-Range",
                    format!("bytes 0-{}/{}", len.saturating_sub(1), len),
                );
                (206, self.data.clone())
            }
            Some(start) if self.honor_range && start >= len => {
                headers.insert("Content-Range", format!("bytes */{}", len));
                return Ok(self.response(request, 416, headers, Body::empty()));
            }
            Some(start) if self.honor_range => {
                headers.insert(
                    "Content-Range",
                    format!("bytes {}-{}/{}", start, len - 1, len),
                );
                (206, self.data[start as usize..].to_vec())
            }
            _ => (200, self.data.clone()),
        };
        headers.insert("Content-Length", body.len().to_string());

        let body = Body {
            inner: Cursor::new(body),
            cut_at: self.truncations.lock().pop_front(),
            delay: self.block_delay,
        };
        Ok(self.response(request, status, headers, body))
    }
}

struct Body {
    inner: Cursor<Vec<u8>>,
    cut_at: Option<u64>,
    delay: Duration,
}

impl Body {
    fn empty() -> Self {
        Self {
            inner: Cursor::new(Vec::new()),
            cut_at: None,
            delay: Duration::ZERO,
        }
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let limit = match self.cut_at {
            Some(cut) => {
                let pos = self.inner.position();
                if pos >= cut {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    ));
                }
                ((cut - pos) as usize).min(buf.len())
            }
            None => buf.len(),
        };
        self.inner.read(&mut buf[..limit])
    }
}

/// Reporter that keeps every event for later inspection
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&ProgressEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| matches(e)).count()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().push(event);
    }
}

/// Pauses or cancels its task once reported progress reaches a threshold
pub struct StopAt {
    threshold: f64,
    cancel: bool,
    fired: AtomicBool,
    task: OnceLock<Weak<Task>>,
    pub recorded: RecordingReporter,
}

impl StopAt {
    pub fn pause_at(threshold: f64) -> Arc<Self> {
        Arc::new(Self::new(threshold, false))
    }

    pub fn cancel_at(threshold: f64) -> Arc<Self> {
        Arc::new(Self::new(threshold, true))
    }

    fn new(threshold: f64, cancel: bool) -> Self {
        Self {
            threshold,
            cancel,
            fired: AtomicBool::new(false),
            task: OnceLock::new(),
            recorded: RecordingReporter::default(),
        }
    }

    pub fn attach(&self, task: &Arc<Task>) {
        let _ = self.task.set(Arc::downgrade(task));
    }
}

impl ProgressReporter for StopAt {
    fn report(&self, event: ProgressEvent) {
        if let ProgressEvent::TaskProgress { progress, .. } = &event
            && *progress >= self.threshold
            && !self.fired.swap(true, Ordering::SeqCst)
            && let Some(task) = self.task.get().and_then(Weak::upgrade)
        {
            if self.cancel {
                task.cancel();
            } else {
                task.pause();
            }
        }
        self.recorded.report(event);
    }
}
