// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Movement and camera key codecs, segment arithmetic, and the per-tag
//! detection fold.

use crate::json::{DetectionTag, Movement, ProcessingState};
use base::{bail_t, Error};

/// Epoch offset for camera keys: 2020-09-13T12:26:40Z.
pub const CAMERA_KEY_EPOCH_SEC: i64 = 1_600_000_000;

/// Width of a movement key: a zero-padded decimal millisecond epoch.
pub const MOVEMENT_KEY_WIDTH: usize = 12;

/// Seconds of video per HLS segment.
pub const SEGMENT_SECONDS: u32 = 2;

/// Encodes a movement key from its start time.
pub fn movement_key(start_ms: i64) -> String {
    format!("{start_ms:0width$}", width = MOVEMENT_KEY_WIDTH)
}

/// Decodes a movement key back to its start time.
///
/// Keys are padded to at least [`MOVEMENT_KEY_WIDTH`] digits; epochs past
/// 2001 naturally occupy 13, which still sorts correctly among themselves.
pub fn parse_movement_key(key: &str) -> Result<i64, Error> {
    if key.len() < MOVEMENT_KEY_WIDTH || !key.bytes().all(|b| b.is_ascii_digit()) {
        bail_t!(InvalidArgument, "malformed movement key {:?}", key);
    }
    key.parse::<i64>()
        .map_err(|_| base::format_err_t!(InvalidArgument, "malformed movement key {:?}", key))
}

/// Encodes a camera key from a creation time.
pub fn camera_key(unix_sec: i64) -> String {
    format!("C{}", unix_sec - CAMERA_KEY_EPOCH_SEC)
}

/// Running duration of a segment range, in seconds.
pub fn segment_seconds(start_segment: u64, end_segment: u64) -> u32 {
    end_segment.saturating_sub(start_segment) as u32 * SEGMENT_SECONDS
}

/// Constructs the record for a just-started movement.
pub fn new_movement(camera_key: &str, now_ms: i64, start_segment: Option<u64>) -> Movement {
    Movement {
        camera_key: camera_key.to_owned(),
        start_date_ms: now_ms,
        start_segment,
        processing_state: ProcessingState::Pending,
        detection_started_at: Some(now_ms),
        poll_count: 1,
        ..Movement::default()
    }
}

/// Folds one frame's detections into the movement.
///
/// For each tag: `max_probability` is the max across all frames reporting
/// it, `count` the number of such frames, and `max_probability_image` the
/// frame that produced the max. Also maintains the per-frame ML stats.
pub fn apply_frame(
    m: &mut Movement,
    image: &str,
    detections: &[(String, f64)],
    processing_time_ms: i64,
) {
    m.frames_received_from_ml += 1;
    m.ml_total_processing_time_ms += processing_time_ms;
    if processing_time_ms > m.ml_max_processing_time_ms {
        m.ml_max_processing_time_ms = processing_time_ms;
    }
    for (tag, probability) in detections {
        match m.detection_output.tags.iter_mut().find(|t| &t.tag == tag) {
            Some(t) => {
                t.count += 1;
                if *probability > t.max_probability {
                    t.max_probability = *probability;
                    t.max_probability_image = image.to_owned();
                }
            }
            None => m.detection_output.tags.push(DetectionTag {
                tag: tag.clone(),
                max_probability: *probability,
                count: 1,
                max_probability_image: image.to_owned(),
            }),
        }
    }
}

/// Returns the image that best represents the movement: the frame behind the
/// highest-probability tag, if any detection exists.
pub fn best_image(m: &Movement) -> Option<&str> {
    m.detection_output
        .tags
        .iter()
        .max_by(|a, b| {
            a.max_probability
                .partial_cmp(&b.max_probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|t| t.max_probability_image.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_key_roundtrip() {
        let ms = 1_700_000_123_456;
        let key = movement_key(ms);
        assert_eq!(key, "1700000123456");
        assert_eq!(parse_movement_key(&key).unwrap(), ms);
    }

    #[test]
    fn movement_key_pads_small_values() {
        assert_eq!(movement_key(42), "000000000042");
        assert_eq!(movement_key(42).len(), MOVEMENT_KEY_WIDTH);
        assert_eq!(parse_movement_key("000000000042").unwrap(), 42);
    }

    #[test]
    fn movement_key_rejects_garbage() {
        parse_movement_key("42").unwrap_err();
        parse_movement_key("00000000004x").unwrap_err();
        parse_movement_key("0000012.3456").unwrap_err();
    }

    #[test]
    fn camera_key_format() {
        assert_eq!(camera_key(1_600_000_000), "C0");
        assert_eq!(camera_key(1_700_000_123), "C100000123");
    }

    #[test]
    fn segment_arithmetic() {
        assert_eq!(segment_seconds(100, 105), 10);
        assert_eq!(segment_seconds(100, 100), 0);
        // end before start shouldn't underflow
        assert_eq!(segment_seconds(105, 100), 0);
    }

    #[test]
    fn apply_frame_aggregates_tags() {
        let mut m = new_movement("C42", 1_700_000_000_000, Some(100));
        apply_frame(
            &mut m,
            "mov000000000001_0001.jpg",
            &[("person".to_owned(), 0.93), ("car".to_owned(), 0.42)],
            120,
        );
        apply_frame(
            &mut m,
            "mov000000000001_0002.jpg",
            &[("person".to_owned(), 0.71)],
            250,
        );

        assert_eq!(m.frames_received_from_ml, 2);
        assert_eq!(m.ml_total_processing_time_ms, 370);
        assert_eq!(m.ml_max_processing_time_ms, 250);

        assert_eq!(m.detection_output.tags.len(), 2);
        let person = m
            .detection_output
            .tags
            .iter()
            .find(|t| t.tag == "person")
            .unwrap();
        assert_eq!(person.max_probability, 0.93);
        assert_eq!(person.count, 2);
        assert_eq!(person.max_probability_image, "mov000000000001_0001.jpg");
        let car = m
            .detection_output
            .tags
            .iter()
            .find(|t| t.tag == "car")
            .unwrap();
        assert_eq!(car.max_probability, 0.42);
        assert_eq!(car.count, 1);

        assert_eq!(best_image(&m), Some("mov000000000001_0001.jpg"));
    }

    #[test]
    fn apply_frame_with_no_detections_still_counts() {
        let mut m = new_movement("C42", 1_700_000_000_000, None);
        apply_frame(&mut m, "f.jpg", &[], 10);
        assert_eq!(m.frames_received_from_ml, 1);
        assert!(m.detection_output.tags.is_empty());
        assert_eq!(best_image(&m), None);
    }
}
