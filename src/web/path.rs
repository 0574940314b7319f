// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Decodes request paths.

use std::str::FromStr;

/// A decoded request path.
#[derive(Debug, Eq, PartialEq)]
pub(super) enum Path {
    Movements,       // "/api/movements"
    MovementsStream, // "/api/movements/stream"
    Settings,        // "/api/settings"
    CameraNew,       // "/api/camera/new"
    Camera(String),  // "/api/camera/<key>"
    Stats,           // "/api/stats"
    DiskStatus,      // "/api/diskstatus"
    DiskCleanup,     // "/api/diskcleanup"
    // "/video/live/<camera_key>/<file>"
    LiveMedia {
        camera_key: String,
        file: String,
    },
    // "/video/<startSegment>/<seconds>/<camera_key>/<file>"
    ClipMedia {
        start_segment: u64,
        seconds: u32,
        camera_key: String,
        file: String,
    },
    // "/mp4/<startSegment>/<seconds>/<camera_key>"
    Mp4 {
        start_segment: u64,
        seconds: u32,
        camera_key: String,
    },
    Image(String),         // "/image/<movement_key>"
    Frame(String, String), // "/frame/<movement_key>/<filename>"
    NotFound,
}

/// A path component that is safe to join onto a directory: no traversal, no
/// hidden files.
fn safe_file(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/') && !name.contains("..")
}

impl Path {
    /// Decodes a request path, notably not including any request
    /// parameters.
    pub(super) fn decode(path: &str) -> Self {
        if let Some(rest) = path.strip_prefix("/api/") {
            return match rest {
                "movements" => Path::Movements,
                "movements/stream" => Path::MovementsStream,
                "settings" => Path::Settings,
                "camera/new" => Path::CameraNew,
                "stats" => Path::Stats,
                "diskstatus" => Path::DiskStatus,
                "diskcleanup" => Path::DiskCleanup,
                _ => match rest.strip_prefix("camera/") {
                    Some(key) if safe_file(key) => Path::Camera(key.to_owned()),
                    _ => Path::NotFound,
                },
            };
        }
        if let Some(rest) = path.strip_prefix("/video/live/") {
            let (camera_key, file) = match rest.split_once('/') {
                Some(pair) => pair,
                None => return Path::NotFound,
            };
            if !safe_file(camera_key) || !safe_file(file) {
                return Path::NotFound;
            }
            return Path::LiveMedia {
                camera_key: camera_key.to_owned(),
                file: file.to_owned(),
            };
        }
        if let Some(rest) = path.strip_prefix("/video/") {
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() != 4 {
                return Path::NotFound;
            }
            let (start, seconds, camera_key, file) = (parts[0], parts[1], parts[2], parts[3]);
            let (start_segment, seconds) = match (u64::from_str(start), u32::from_str(seconds)) {
                (Ok(s), Ok(d)) => (s, d),
                _ => return Path::NotFound,
            };
            if !safe_file(camera_key) || !safe_file(file) {
                return Path::NotFound;
            }
            return Path::ClipMedia {
                start_segment,
                seconds,
                camera_key: camera_key.to_owned(),
                file: file.to_owned(),
            };
        }
        if let Some(rest) = path.strip_prefix("/mp4/") {
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() != 3 {
                return Path::NotFound;
            }
            let (start, seconds, camera_key) = (parts[0], parts[1], parts[2]);
            let (start_segment, seconds) = match (u64::from_str(start), u32::from_str(seconds)) {
                (Ok(s), Ok(d)) => (s, d),
                _ => return Path::NotFound,
            };
            if !safe_file(camera_key) {
                return Path::NotFound;
            }
            return Path::Mp4 {
                start_segment,
                seconds,
                camera_key: camera_key.to_owned(),
            };
        }
        if let Some(key) = path.strip_prefix("/image/") {
            if safe_file(key) {
                return Path::Image(key.to_owned());
            }
            return Path::NotFound;
        }
        if let Some(rest) = path.strip_prefix("/frame/") {
            let (key, file) = match rest.split_once('/') {
                Some(pair) => pair,
                None => return Path::NotFound,
            };
            if safe_file(key) && safe_file(file) {
                return Path::Frame(key.to_owned(), file.to_owned());
            }
            return Path::NotFound;
        }
        Path::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::Path;

    #[test]
    fn paths() {
        assert_eq!(Path::decode("/api/movements"), Path::Movements);
        assert_eq!(Path::decode("/api/movements/stream"), Path::MovementsStream);
        assert_eq!(Path::decode("/api/settings"), Path::Settings);
        assert_eq!(Path::decode("/api/camera/new"), Path::CameraNew);
        assert_eq!(
            Path::decode("/api/camera/C12345"),
            Path::Camera("C12345".to_owned())
        );
        assert_eq!(Path::decode("/api/stats"), Path::Stats);
        assert_eq!(Path::decode("/api/diskstatus"), Path::DiskStatus);
        assert_eq!(Path::decode("/api/diskcleanup"), Path::DiskCleanup);
        assert_eq!(Path::decode("/api/junk"), Path::NotFound);

        assert_eq!(
            Path::decode("/video/live/C12345/stream.m3u8"),
            Path::LiveMedia {
                camera_key: "C12345".to_owned(),
                file: "stream.m3u8".to_owned(),
            }
        );
        assert_eq!(
            Path::decode("/video/100/10/C12345/stream.m3u8"),
            Path::ClipMedia {
                start_segment: 100,
                seconds: 10,
                camera_key: "C12345".to_owned(),
                file: "stream.m3u8".to_owned(),
            }
        );
        assert_eq!(Path::decode("/video/x/10/C12345/f.ts"), Path::NotFound);
        assert_eq!(
            Path::decode("/mp4/100/10/C12345"),
            Path::Mp4 {
                start_segment: 100,
                seconds: 10,
                camera_key: "C12345".to_owned(),
            }
        );
        assert_eq!(
            Path::decode("/image/000000000042"),
            Path::Image("000000000042".to_owned())
        );
        assert_eq!(
            Path::decode("/frame/000000000042/mov000000000042_0001.jpg"),
            Path::Frame(
                "000000000042".to_owned(),
                "mov000000000042_0001.jpg".to_owned()
            )
        );
        assert_eq!(Path::decode("/"), Path::NotFound);
    }

    #[test]
    fn rejects_traversal() {
        assert_eq!(Path::decode("/video/live/C1/../../etc/passwd"), Path::NotFound);
        assert_eq!(Path::decode("/video/live/C1/.hidden"), Path::NotFound);
        assert_eq!(Path::decode("/frame/k/..%2fescape"), Path::NotFound);
        assert_eq!(Path::decode("/image/../db"), Path::NotFound);
    }
}
