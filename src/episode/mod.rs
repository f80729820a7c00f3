// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod filename;

use std::fmt;

use chrono::{DateTime, FixedOffset};
use percent_encoding::percent_decode_str;
use url::Url;

pub use filename::{
    FilenameHints, extension_from_url, filename_from_url, generate_filename, generate_filename_stem,
    get_audio_extension, is_known_redirector, is_sane_extension, mime_to_extension,
    reconcile_filename,
};

/// A podcast episode as handed to the transfer engine by the feed model
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    pub title: String,
    pub guid: Option<String>,
    pub pub_date: Option<DateTime<FixedOffset>>,
    /// Title of the podcast the episode belongs to
    pub podcast_title: Option<String>,
    pub enclosure: Enclosure,
    /// Credentials configured for the podcast, if any
    pub credentials: Option<Credentials>,
}

/// The media file attached to an episode
#[derive(Debug, Clone, PartialEq)]
pub struct Enclosure {
    /// Download URL as found in the feed; may be empty or malformed
    pub url: String,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
}

/// HTTP basic-auth credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Episode {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            guid: None,
            pub_date: None,
            podcast_title: None,
            enclosure: Enclosure {
                url: url.into(),
                length: None,
                mime_type: None,
            },
            credentials: None,
        }
    }

    /// Build an episode for a bare media URL, titled after its file name
    pub fn from_url(url: &str) -> Self {
        let title = Url::parse(url)
            .ok()
            .and_then(|parsed| {
                let segment = parsed
                    .path_segments()
                    .and_then(|mut segments| segments.next_back())
                    .filter(|s| !s.is_empty())
                    .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned());

                segment
                    .map(|s| match s.rsplit_once('.') {
                        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                        _ => s,
                    })
                    .or_else(|| parsed.host_str().map(String::from))
            })
            .unwrap_or_else(|| url.to_string());

        Self::new(title, url)
    }

    /// Stable identity used to avoid duplicate tasks for the same episode
    pub fn key(&self) -> &str {
        self.guid.as_deref().unwrap_or(&self.enclosure.url)
    }
}
