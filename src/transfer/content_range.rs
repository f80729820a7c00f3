// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::str::FromStr;

/// A parsed `Content-Range: bytes <start>-<stop>/<length>` header
///
/// `stop` and `length` are optional because some servers answer with
/// `bytes 100-/*` or leave the total unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub stop: Option<u64>,
    pub length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidContentRange;

impl FromStr for ContentRange {
    type Err = InvalidContentRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (unit, spec) = s.split_once(char::is_whitespace).ok_or(InvalidContentRange)?;
        if !unit.eq_ignore_ascii_case("bytes") {
            return Err(InvalidContentRange);
        }

        let (range, length) = match spec.trim().split_once('/') {
            Some((range, length)) => (range.trim(), Some(length.trim())),
            None => (spec.trim(), None),
        };

        let (start, stop) = range.split_once('-').ok_or(InvalidContentRange)?;
        let start: u64 = start.trim().parse().map_err(|_| InvalidContentRange)?;
        let stop: Option<u64> = match stop.trim() {
            "" => None,
            stop => Some(stop.parse().map_err(|_| InvalidContentRange)?),
        };
        let length: Option<u64> = match length {
            None | Some("*") => None,
            Some(length) => Some(length.parse().map_err(|_| InvalidContentRange)?),
        };

        if stop.is_some_and(|stop| stop < start) {
            return Err(InvalidContentRange);
        }
        if let (Some(stop), Some(length)) = (stop, length)
            && stop >= length
        {
            return Err(InvalidContentRange);
        }

        Ok(ContentRange {
            start,
            stop,
            length,
        })
    }
}
