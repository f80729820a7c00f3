// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use reqwest::blocking::Client;
use reqwest::header::{RANGE, USER_AGENT};
use reqwest::redirect::Policy;
use url::Url;

use crate::config::SharedConfig;
use crate::episode::Credentials;
use crate::error::HttpError;
use crate::transfer::ContentRange;

/// Response headers with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// MIME essence of the Content-Type header (parameters dropped)
    pub fn content_type(&self) -> Option<String> {
        let value = self.get("content-type")?;
        value
            .parse::<mime::Mime>()
            .ok()
            .map(|m| m.essence_str().to_string())
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        self.get("content-range").and_then(|v| v.parse().ok())
    }

    /// Filename suggested by a Content-Disposition header
    ///
    /// `filename*` (RFC 5987, percent-encoded) wins over plain `filename`.
    pub fn content_disposition_filename(&self) -> Option<String> {
        let value = self.get("content-disposition")?;
        let mut plain = None;
        let mut extended = None;

        for param in value.split(';').skip(1) {
            let Some((key, raw)) = param.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let raw = raw.trim();

            if key == "filename*" {
                // charset'language'percent-encoded-value
                let encoded = raw.splitn(3, '\'').nth(2).unwrap_or(raw);
                let decoded = percent_decode_str(encoded.trim_matches('"'))
                    .decode_utf8_lossy()
                    .into_owned();
                extended = Some(decoded);
            } else if key == "filename" {
                plain = Some(raw.trim_matches('"').to_string());
            }
        }

        extended.or(plain).filter(|name| !name.trim().is_empty())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(&name, value);
        }
        headers
    }
}

/// A single GET request as seen by the transfer layer
#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub url: &'a Url,
    /// Byte offset for a `Range: bytes=<start>-` header
    pub range_start: Option<u64>,
    pub credentials: Option<&'a Credentials>,
}

/// HTTP response with status, headers, final URL, and body reader
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    /// URL after following redirects
    pub url: Url,
    pub body: Box<dyn Read + Send>,
}

/// HTTP client abstraction for testability
pub trait HttpClient: Send + Sync {
    /// Issue a GET request, following redirects
    fn get(&self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError>;
}

impl<C: HttpClient + ?Sized> HttpClient for std::sync::Arc<C> {
    fn get(&self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError> {
        (**self).get(request)
    }
}

/// Default HTTP client implementation using blocking reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    client: Client,
    user_agent: String,
}

impl ReqwestClient {
    /// Create a client honoring the timeouts and user agent in `config`
    ///
    /// The redirect budget is read from `config` on every redirect, so a
    /// change to `retries` applies to the next request.
    pub fn from_config(config: &SharedConfig) -> Result<Self, reqwest::Error> {
        let settings = config.snapshot();
        let live = config.clone();
        let mut builder = Client::builder()
            .redirect(Policy::custom(move |attempt| {
                let limit = live.snapshot().retry_policy().redirect as usize;
                if attempt.previous().len() > limit {
                    attempt.error(format!("too many redirects (limit {})", limit))
                } else {
                    attempt.follow()
                }
            }))
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs));

        builder = match settings.request_timeout_secs {
            0 => builder.timeout(None::<Duration>),
            secs => builder.timeout(Duration::from_secs(secs)),
        };

        Ok(Self {
            client: builder.build()?,
            user_agent: settings.user_agent,
        })
    }

    /// Create a new ReqwestClient with a custom reqwest client
    pub fn with_client(client: Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, request: &HttpRequest<'_>) -> Result<HttpResponse, HttpError> {
        let url = request.url.as_str();
        let mut builder = self
            .client
            .get(request.url.clone())
            .header(USER_AGENT, &self.user_agent);

        if let Some(start) = request.range_start {
            builder = builder.header(RANGE, format!("bytes={}-", start));
        }

        if let Some(credentials) = request.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = builder.send().map_err(|e| classify_error(url, e))?;

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(HttpResponse {
            status: response.status().as_u16(),
            headers,
            url: response.url().clone(),
            body: Box::new(response),
        })
    }
}

fn classify_error(url: &str, error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout {
            url: url.to_string(),
        }
    } else if error.is_connect() {
        HttpError::Connect {
            url: url.to_string(),
            message: error.to_string(),
        }
    } else {
        HttpError::RequestFailed {
            url: url.to_string(),
            source: error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reqwest_client_can_be_created() {
        let _client = ReqwestClient::from_config(&SharedConfig::default()).unwrap();
    }

    #[test]
    fn reqwest_client_can_be_cloned() {
        let client = ReqwestClient::from_config(&SharedConfig::default()).unwrap();
        let _cloned = client.clone();
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let headers = headers(&[("Content-Length", "1234")]);
        assert_eq!(headers.get("content-length"), Some("1234"));
        assert_eq!(headers.get("CONTENT-LENGTH"), Some("1234"));
        assert_eq!(headers.content_length(), Some(1234));
    }

    #[test]
    fn content_type_drops_parameters() {
        let headers = headers(&[("Content-Type", "audio/mpeg; charset=binary")]);
        assert_eq!(headers.content_type().as_deref(), Some("audio/mpeg"));
    }

    #[test]
    fn malformed_content_type_is_ignored() {
        let headers = headers(&[("Content-Type", "not a mime type")]);
        assert_eq!(headers.content_type(), None);
    }

    #[test]
    fn disposition_plain_filename() {
        let headers = headers(&[(
            "Content-Disposition",
            "attachment; filename=\"episode 12.mp3\"",
        )]);
        assert_eq!(
            headers.content_disposition_filename().as_deref(),
            Some("episode 12.mp3")
        );
    }

    #[test]
    fn disposition_extended_filename_wins() {
        let headers = headers(&[(
            "Content-Disposition",
            "attachment; filename=\"fallback.mp3\"; filename*=UTF-8''caf%C3%A9.m4a",
        )]);
        assert_eq!(
            headers.content_disposition_filename().as_deref(),
            Some("café.m4a")
        );
    }

    #[test]
    fn disposition_without_filename() {
        let headers = headers(&[("Content-Disposition", "inline")]);
        assert_eq!(headers.content_disposition_filename(), None);
    }

    #[test]
    fn content_range_is_parsed_from_headers() {
        let headers = headers(&[("Content-Range", "bytes 100-199/200")]);
        let range = headers.content_range().unwrap();
        assert_eq!(range.start, 100);
        assert_eq!(range.stop, Some(199));
        assert_eq!(range.length, Some(200));
    }
}
