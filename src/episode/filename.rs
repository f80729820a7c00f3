// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use percent_encoding::percent_decode_str;
use url::Url;

use super::Episode;

/// Maximum length for the title portion of a filename
const MAX_TITLE_LENGTH: usize = 100;

/// Longest extension still considered well-formed
const MAX_EXTENSION_LENGTH: usize = 5;

/// Hosts whose URLs only bounce to the real file and say nothing about its name
const REDIRECTOR_HOSTS: &[&str] = &[
    "feedburner.com",
    "feedproxy.google.com",
    "podtrac.com",
    "chtbl.com",
    "pdst.fm",
];

/// Response details that may change the name of a finished download
#[derive(Debug, Clone, Copy)]
pub struct FilenameHints<'a> {
    /// MIME essence of the response Content-Type
    pub content_type: Option<&'a str>,
    /// Filename suggested by Content-Disposition
    pub disposition: Option<&'a str>,
    pub requested_url: &'a str,
    /// URL after redirects
    pub resolved_url: &'a str,
}

/// Check if a character is allowed in filenames (whitelist approach)
fn is_valid_filename_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')
}

/// Generate a filename stem (without extension) for an episode
///
/// Format: "YYYY-MM-DD-sanitized-title" or "undated-sanitized-title"
pub fn generate_filename_stem(episode: &Episode) -> String {
    let date_prefix = episode
        .pub_date
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    format!("{}-{}", date_prefix, sanitize_title(&episode.title))
}

/// Get the media file extension for an episode
///
/// Taken from the URL path when it names a known media type, then from
/// the enclosure MIME type, defaulting to "mp3".
pub fn get_audio_extension(episode: &Episode) -> String {
    if let Some(ext) = extension_from_url(&episode.enclosure.url)
        .filter(|ext| mime_for_extension(ext).is_some())
    {
        return ext;
    }

    if let Some(ref mime) = episode.enclosure.mime_type
        && let Some(ext) = mime_to_extension(mime)
    {
        return ext.to_string();
    }

    "mp3".to_string()
}

/// Generate a complete filename for an episode (with extension)
pub fn generate_filename(episode: &Episode) -> String {
    format!(
        "{}.{}",
        generate_filename_stem(episode),
        get_audio_extension(episode)
    )
}

/// Whether `ext` looks like a real file extension
///
/// Empty, overlong, whitespace-containing, or purely numeric extensions are
/// what servers produce for URLs like `/download.php?id=7` or `/ep.1234`.
pub fn is_sane_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LENGTH
        && !ext.chars().any(char::is_whitespace)
        && !ext.chars().all(|c| c.is_ascii_digit())
        && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Lower-cased extension of the last path segment of `url`, if sane
pub fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let filename = parsed.path_segments()?.next_back()?;
    let (_, ext) = filename.rsplit_once('.')?;
    Some(ext.to_lowercase()).filter(|ext| is_sane_extension(ext))
}

/// Sanitized last path segment of `url`, if it looks like a media filename
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    sane_filename(&decoded)
}

/// Sanitize `name`, keeping it only with a non-empty stem and a sane extension
fn sane_filename(name: &str) -> Option<String> {
    let clean = sanitize_filename::sanitize(name);
    clean
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.trim().is_empty() && is_sane_extension(ext))
        .then_some(clean)
}

/// Whether `url` points at a known tracking/redirect service
pub fn is_known_redirector(url: &str) -> bool {
    let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) else {
        return false;
    };

    REDIRECTOR_HOSTS
        .iter()
        .any(|r| host == *r || host.ends_with(&format!(".{}", r)))
}

/// Work out the final filename of a finished download
///
/// A sane Content-Disposition filename wins. Next comes the filename of the
/// URL the download was redirected to, unless that is a known redirector.
/// Otherwise the stem of `current` is kept and its extension is replaced
/// when the response MIME type disagrees with both the known type and the
/// current extension (or the extension is malformed).
pub fn reconcile_filename(current: &str, known_mime: Option<&str>, hints: &FilenameHints<'_>) -> String {
    if let Some(name) = hints.disposition.and_then(sane_filename) {
        return name;
    }

    if hints.resolved_url != hints.requested_url
        && !is_known_redirector(hints.resolved_url)
        && let Some(name) = filename_from_url(hints.resolved_url)
    {
        return name;
    }

    let (stem, mut ext) = match current.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext.to_lowercase())),
        _ => (current, None),
    };

    if let Some(content_type) = hints.content_type
        && let Some(implied) = mime_to_extension(content_type)
    {
        let malformed = !ext.as_deref().is_some_and(is_sane_extension);
        let known_differs = known_mime.is_none_or(|k| !k.eq_ignore_ascii_case(content_type));
        let ext_differs = ext
            .as_deref()
            .and_then(mime_for_extension)
            .is_none_or(|m| !m.eq_ignore_ascii_case(content_type));

        if malformed || (known_differs && ext_differs) {
            ext = Some(implied.to_string());
        }
    }

    match ext {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem.to_string(),
    }
}

/// Sanitize a title for use in a filename using whitelist approach
fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| if is_valid_filename_char(c) { c } else { '-' })
        .collect();

    let collapsed = collapse_separators(&sanitized);
    let trimmed = collapsed.trim_matches(|c: char| c == '-' || c.is_whitespace());

    if trimmed.len() > MAX_TITLE_LENGTH {
        truncate_at_boundary(trimmed, MAX_TITLE_LENGTH)
    } else {
        trimmed.to_string()
    }
}

/// Collapse multiple spaces and dashes into single dashes
fn collapse_separators(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut last_was_separator = false;

    for c in s.chars() {
        if c == '-' || c.is_whitespace() {
            if !last_was_separator {
                result.push('-');
                last_was_separator = true;
            }
        } else {
            result.push(c);
            last_was_separator = false;
        }
    }

    result
}

/// Truncate string at a word boundary
fn truncate_at_boundary(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }

    let truncated: String = s.chars().take(max_len).collect();
    if let Some(pos) = truncated.rfind('-')
        && pos > max_len / 2
    {
        return truncated[..pos].to_string();
    }

    truncated.trim_end_matches('-').to_string()
}

/// Map MIME types to file extensions
pub fn mime_to_extension(mime: &str) -> Option<&'static str> {
    match mime.to_lowercase().as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => Some("m4a"),
        "audio/aac" => Some("aac"),
        "audio/ogg" | "application/ogg" => Some("ogg"),
        "audio/opus" => Some("opus"),
        "audio/wav" | "audio/x-wav" => Some("wav"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "video/mp4" => Some("mp4"),
        "video/x-m4v" => Some("m4v"),
        "video/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

/// Canonical MIME type for a media extension
fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext.to_lowercase().as_str() {
        "mp3" => Some("audio/mpeg"),
        "m4a" => Some("audio/mp4"),
        "aac" => Some("audio/aac"),
        "ogg" | "oga" => Some("audio/ogg"),
        "opus" => Some("audio/opus"),
        "wav" => Some("audio/wav"),
        "flac" => Some("audio/flac"),
        "mp4" => Some("video/mp4"),
        "m4v" => Some("video/x-m4v"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}
