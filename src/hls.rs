// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Reading the live HLS playlist and synthesizing clipped playlists.
//!
//! The transcoder emits `stream.m3u8` plus 2-second `stream<N>.ts` segments
//! whose media-sequence numbers increase monotonically across restarts.

use base::{bail_t, Error};
use db::movement::SEGMENT_SECONDS;
use std::fmt::Write as _;
use std::path::Path;

/// A parsed view of the live playlist: the media-sequence number of its
/// first listed segment and how many segments it lists.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LivePlaylist {
    pub media_sequence: u64,
    pub segment_count: u64,
}

impl LivePlaylist {
    /// The media-sequence number of the newest listed segment.
    pub fn live_edge(&self) -> u64 {
        self.media_sequence + self.segment_count.saturating_sub(1)
    }
}

pub fn parse_live_playlist(body: &str) -> Result<LivePlaylist, Error> {
    if !body.starts_with("#EXTM3U") {
        bail_t!(DataLoss, "playlist is missing #EXTM3U header");
    }
    let mut media_sequence = None;
    let mut segment_count = 0;
    for line in body.lines() {
        if let Some(seq) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = Some(seq.trim().parse::<u64>().map_err(|_| {
                base::format_err_t!(DataLoss, "bad media sequence {:?}", seq)
            })?);
        } else if !line.starts_with('#') && !line.trim().is_empty() {
            segment_count += 1;
        }
    }
    let media_sequence = match media_sequence {
        Some(s) => s,
        None => bail_t!(DataLoss, "playlist is missing #EXT-X-MEDIA-SEQUENCE"),
    };
    Ok(LivePlaylist {
        media_sequence,
        segment_count,
    })
}

/// Reads and parses the live playlist at `path`.
pub fn read_live_playlist(path: &Path) -> Result<LivePlaylist, Error> {
    let body = std::fs::read_to_string(path).map_err(|e| {
        base::Error::wrap(base::ErrorKind::Unavailable, e)
            .context(format!("unable to read playlist {}", path.display()))
    })?;
    parse_live_playlist(&body)
}

/// The inclusive segment range covered by a clip: `preseq` segments of
/// lead-in, the movement itself at 2 s per segment (rounded up), and
/// `postseq` segments of tail.
pub fn clip_range(start_segment: u64, seconds: u32, preseq: u32, postseq: u32) -> (u64, u64) {
    // A zero-length movement still covers the segment it started in.
    let movement_segments = u64::from(seconds.div_ceil(SEGMENT_SECONDS)).max(1);
    let first = start_segment.saturating_sub(u64::from(preseq));
    let last = start_segment + movement_segments + u64::from(postseq) - 1;
    (first, last)
}

/// Synthesizes a fixed playlist over the clip range, with `#EXT-X-ENDLIST`.
pub fn clip_playlist(start_segment: u64, seconds: u32, preseq: u32, postseq: u32) -> String {
    let (first, last) = clip_range(start_segment, seconds, preseq, postseq);
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{SEGMENT_SECONDS}");
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{first}");
    for n in first..=last {
        let _ = writeln!(out, "#EXTINF:{SEGMENT_SECONDS}.000000,");
        let _ = writeln!(out, "stream{n}.ts");
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// Segment file name for a media-sequence number.
pub fn segment_file(n: u64) -> String {
    format!("stream{n}.ts")
}
