// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP surface: JSON listings, settings and camera mutations, live and
//! clipped HLS serving, MP4 export, frame images, and the server-sent event
//! stream.

mod path;

use self::path::Path;
use crate::control::Nvr;
use crate::hls;
use crate::janitor::Target;
use crate::json::{
    CameraToClient, ConfigToClient, ListMode, MovementToClient, MovementsResponse,
};
use base::{format_err_t, ErrorKind};
use db::json::{Camera, DiskStatus, Movement, Settings};
use db::store::{Namespace, ScanOpts};
use futures::StreamExt as _;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Bytes;
use hyper::Body;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use url::form_urlencoded;

/// Default and maximum page sizes of `GET /movements`.
const DEFAULT_LIMIT: usize = 200;
const MAX_LIMIT: usize = 10_000;

/// Deadline on a one-shot MP4 export.
const MP4_DEADLINE: Duration = Duration::from_secs(120);

/// An HTTP error response. A thin wrapper over the hyper response type that
/// allows automatic conversion from `base::Error`.
struct HttpError(Response<Body>);

impl From<Response<Body>> for HttpError {
    fn from(response: Response<Body>) -> Self {
        HttpError(response)
    }
}

impl From<base::Error> for HttpError {
    fn from(err: base::Error) -> Self {
        HttpError(from_base_error(err))
    }
}

fn plain_response<B: Into<Body>>(status: StatusCode, body: B) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(body.into())
        .expect("hardcoded head should be valid")
}

fn not_found<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::NOT_FOUND, body))
}

fn bad_req<B: Into<Body>>(body: B) -> HttpError {
    HttpError(plain_response(StatusCode::BAD_REQUEST, body))
}

fn from_base_error(err: base::Error) -> Response<Body> {
    use ErrorKind::*;
    let status_code = match err.kind() {
        InvalidArgument | FailedPrecondition | OutOfRange => StatusCode::BAD_REQUEST,
        NotFound => StatusCode::NOT_FOUND,
        Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    plain_response(status_code, err.to_string())
}

type ResponseResult = Result<Response<Body>, HttpError>;

fn serve_json<T: serde::Serialize>(out: &T) -> ResponseResult {
    let body = serde_json::to_vec(out)
        .map_err(|e| HttpError(plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())))?;
    Ok(Response::builder()
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .body(body.into())
        .expect("hardcoded head should be valid"))
}

/// Extracts an `application/json` POST body from a request.
async fn extract_json_body(req: &mut Request<Body>) -> Result<Bytes, HttpError> {
    if *req.method() != Method::POST {
        return Err(plain_response(StatusCode::METHOD_NOT_ALLOWED, "POST expected").into());
    }
    let b = std::mem::replace(req.body_mut(), Body::empty());
    hyper::body::to_bytes(b).await.map_err(|e| {
        HttpError(plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to read request body: {e}"),
        ))
    })
}

fn query_pairs(req: &Request<Body>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some(q) = req.uri().query() {
        for (key, value) in form_urlencoded::parse(q.as_bytes()) {
            let (key, value): (&str, &str) = (key.borrow(), value.borrow());
            out.insert(key.to_owned(), value.to_owned());
        }
    }
    out
}

/// Serves a file from disk as a streamed body, or 404.
async fn serve_file(path: &std::path::Path, content_type: &'static str) -> ResponseResult {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(not_found(format!(
                "{} not found",
                path.file_name().unwrap_or_default().to_string_lossy()
            )))
        }
        Err(e) => {
            return Err(HttpError(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
            )))
        }
    };
    let stream = tokio_util::io::ReaderStream::new(file);
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, HeaderValue::from_static(content_type))
        .body(Body::wrap_stream(stream))
        .expect("hardcoded head should be valid"))
}

pub struct Service {
    nvr: Arc<Nvr>,
}

impl Service {
    pub fn new(nvr: Arc<Nvr>) -> Self {
        Service { nvr }
    }

    /// Serves an HTTP request. Always returns `Ok`: error responses are
    /// normal responses as far as hyper is concerned.
    pub async fn serve(
        self: Arc<Self>,
        req: Request<Body>,
    ) -> Result<Response<Body>, std::convert::Infallible> {
        let p = Path::decode(req.uri().path());
        debug!("request on {}: {:?}", req.uri(), p);
        if *req.method() == Method::POST && self.nvr.is_shutting_down() {
            return Ok(plain_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "shutting down",
            ));
        }
        Ok(self.serve_inner(req, p).await.unwrap_or_else(|e| e.0))
    }

    async fn serve_inner(self: Arc<Self>, mut req: Request<Body>, p: Path) -> ResponseResult {
        match p {
            Path::Movements => self.movements(&req),
            Path::MovementsStream => self.movements_stream(&req),
            Path::Settings => self.post_settings(&mut req).await,
            Path::CameraNew => self.post_camera_new(&mut req).await,
            Path::Camera(key) => self.post_camera(&mut req, &key).await,
            Path::Stats => self.stats(&req),
            Path::DiskStatus => self.disk_status(&req),
            Path::DiskCleanup => self.post_disk_cleanup(&req).await,
            Path::LiveMedia { camera_key, file } => self.live_media(&camera_key, &file).await,
            Path::ClipMedia {
                start_segment,
                seconds,
                camera_key,
                file,
            } => {
                self.clip_media(&req, start_segment, seconds, &camera_key, &file)
                    .await
            }
            Path::Mp4 {
                start_segment,
                seconds,
                camera_key,
            } => {
                self.mp4(&req, start_segment, seconds, &camera_key).await
            }
            Path::Image(movement_key) => self.image(&movement_key).await,
            Path::Frame(movement_key, file) => self.frame(&movement_key, &file).await,
            Path::NotFound => Err(not_found("path not understood")),
        }
    }

    fn cameras_by_key(&self) -> Result<HashMap<String, Camera>, base::Error> {
        Ok(self
            .nvr
            .store
            .scan::<Camera>(Namespace::Cameras, &ScanOpts::forward())?
            .into_iter()
            .collect())
    }

    fn camera_or_404(&self, key: &str) -> Result<Camera, HttpError> {
        self.nvr
            .store
            .get::<Camera>(Namespace::Cameras, key)
            .map_err(HttpError::from)?
            .ok_or_else(|| not_found(format!("no such camera {key}")))
    }

    fn movement_or_404(&self, key: &str) -> Result<Movement, HttpError> {
        self.nvr
            .store
            .get::<Movement>(Namespace::Movements, key)
            .map_err(HttpError::from)?
            .ok_or_else(|| not_found(format!("no such movement {key}")))
    }

    fn frames_dir(&self) -> Result<PathBuf, HttpError> {
        let settings = self
            .nvr
            .settings()
            .ok_or_else(|| HttpError::from(format_err_t!(FailedPrecondition, "no settings configured")))?;
        Ok(PathBuf::from(&settings.disk_base_dir).join(&settings.detection_frames_path))
    }

    /// `GET /movements`: newest-first listing with cursor pagination.
    fn movements(&self, req: &Request<Body>) -> ResponseResult {
        let q = query_pairs(req);
        let mode = match q.get("mode") {
            None => ListMode::Movement,
            Some(m) => {
                ListMode::parse(m).ok_or_else(|| bad_req(format!("unknown mode {m:?}")))?
            }
        };
        let limit = match q.get("limit") {
            None => DEFAULT_LIMIT,
            Some(l) => l
                .parse::<usize>()
                .ok()
                .filter(|l| (1..=MAX_LIMIT).contains(l))
                .ok_or_else(|| bad_req(format!("limit must be 1..={MAX_LIMIT}")))?,
        };
        let cursor = q.get("cursor").cloned();

        let settings = self.nvr.settings();
        let filters = settings
            .as_ref()
            .map(|s| s.detection_tag_filters.clone())
            .unwrap_or_default();
        let cameras = self.cameras_by_key().map_err(HttpError::from)?;

        let mut movements: Vec<MovementToClient> = Vec::new();
        let mut next_cursor = None;
        let mut has_more = false;
        let mut page_cursor = cursor;
        'fetch: loop {
            let mut opts = ScanOpts::reverse().limit(limit + 1);
            if let Some(c) = &page_cursor {
                opts = opts.lt(c.clone());
            }
            let rows = self
                .nvr
                .store
                .scan::<Movement>(Namespace::Movements, &opts)
                .map_err(HttpError::from)?;
            let extra = rows.len() > limit;
            let taken = rows.len().min(limit);
            for (i, (key, m)) in rows.into_iter().take(limit).enumerate() {
                page_cursor = Some(key.clone());
                let camera_name = cameras
                    .get(&m.camera_key)
                    .map(|c| c.name.as_str())
                    .unwrap_or("");
                let mtc = MovementToClient::new(&key, camera_name, &m);
                if mode == ListMode::Filtered && !mtc.passes_filters(&filters) {
                    continue;
                }
                movements.push(mtc);
                if movements.len() == limit {
                    has_more = extra || i + 1 < taken;
                    next_cursor = Some(key);
                    break 'fetch;
                }
            }
            if !extra {
                break;
            }
        }

        let cameras_out: Vec<CameraToClient> = cameras
            .iter()
            .filter(|(_, c)| !c.delete)
            .map(|(k, c)| CameraToClient::new(k, c))
            .collect();
        serve_json(&MovementsResponse {
            config: ConfigToClient { settings },
            cameras: cameras_out,
            movements,
            has_more,
            next_cursor,
        })
    }

    /// `GET /movements/stream`: server-sent events.
    fn movements_stream(&self, _req: &Request<Body>) -> ResponseResult {
        let sub = self.nvr.hub.subscribe();
        let stream =
            UnboundedReceiverStream::new(sub.rx).map(Ok::<Bytes, std::convert::Infallible>);
        Ok(Response::builder()
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            )
            .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .body(Body::wrap_stream(stream))
            .expect("hardcoded head should be valid"))
    }

    async fn post_settings(&self, req: &mut Request<Body>) -> ResponseResult {
        let body = extract_json_body(req).await?;
        let settings: Settings =
            serde_json::from_slice(&body).map_err(|e| bad_req(e.to_string()))?;
        settings.validate().map_err(HttpError::from)?;
        let dir = std::path::Path::new(&settings.disk_base_dir);
        if !dir.is_dir() {
            return Err(bad_req(format!(
                "diskBaseDir {:?} is not an existing directory",
                settings.disk_base_dir
            )));
        }
        self.nvr
            .store
            .put(Namespace::Settings, "config", &settings)
            .map_err(HttpError::from)?;
        Ok(plain_response(StatusCode::CREATED, "created"))
    }

    async fn post_camera_new(&self, req: &mut Request<Body>) -> ResponseResult {
        let body = extract_json_body(req).await?;
        let mut camera: Camera =
            serde_json::from_slice(&body).map_err(|e| bad_req(e.to_string()))?;
        // Server-owned state is never writable by clients.
        camera.state_last_processed_movement_key = None;
        camera.validate().map_err(HttpError::from)?;

        let mut sec = self.nvr.clocks.realtime_ms() / 1_000;
        let key = loop {
            let key = db::movement::camera_key(sec);
            let taken = self
                .nvr
                .store
                .get::<Camera>(Namespace::Cameras, &key)
                .map_err(HttpError::from)?
                .is_some();
            if !taken {
                break key;
            }
            sec += 1;
        };

        let dir = crate::streamer::camera_dir(&camera);
        std::fs::create_dir_all(&dir).map_err(|e| {
            HttpError::from(base::Error::wrap(ErrorKind::FailedPrecondition, e).context(
                format!("unable to create camera folder {}", dir.display()),
            ))
        })?;
        self.nvr
            .store
            .put(Namespace::Cameras, &key, &camera)
            .map_err(HttpError::from)?;
        Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .body(serde_json::json!({ "key": key }).to_string().into())
            .expect("hardcoded head should be valid"))
    }

    /// `POST /camera/<key>[?delopt=reset|del|delall]`.
    async fn post_camera(&self, req: &mut Request<Body>, key: &str) -> ResponseResult {
        let q = query_pairs(req);
        let existing = self.camera_or_404(key)?;
        // Every variant stops a running transcoder first; plain updates get
        // a fresh one on the next tick.
        self.nvr.stop_camera(key).await;

        match q.get("delopt").map(String::as_str) {
            None => {
                let body = extract_json_body(req).await?;
                let mut camera: Camera =
                    serde_json::from_slice(&body).map_err(|e| bad_req(e.to_string()))?;
                camera.state_last_processed_movement_key =
                    existing.state_last_processed_movement_key;
                camera.validate().map_err(HttpError::from)?;
                self.nvr
                    .store
                    .put(Namespace::Cameras, key, &camera)
                    .map_err(HttpError::from)?;
            }
            Some("reset") => {
                self.nvr
                    .clone()
                    .wipe_camera(key, &existing)
                    .await
                    .map_err(HttpError::from)?;
            }
            Some("del") => {
                let mut camera = existing;
                camera.delete = true;
                self.nvr
                    .store
                    .put(Namespace::Cameras, key, &camera)
                    .map_err(HttpError::from)?;
            }
            Some("delall") => {
                self.nvr
                    .clone()
                    .wipe_camera(key, &existing)
                    .await
                    .map_err(HttpError::from)?;
                let mut camera = existing;
                camera.delete = true;
                self.nvr
                    .store
                    .put(Namespace::Cameras, key, &camera)
                    .map_err(HttpError::from)?;
            }
            Some(other) => return Err(bad_req(format!("unknown delopt {other:?}"))),
        }
        serve_json(&serde_json::json!({ "ok": true }))
    }

    fn stats(&self, _req: &Request<Body>) -> ResponseResult {
        let stats = db::stats::movement_stats(&self.nvr.store).map_err(HttpError::from)?;
        serve_json(&stats)
    }

    fn disk_status(&self, _req: &Request<Body>) -> ResponseResult {
        let rows: HashMap<String, DiskStatus> = self
            .nvr
            .store
            .scan::<DiskStatus>(Namespace::DiskStatus, &ScanOpts::forward())
            .map_err(HttpError::from)?
            .into_iter()
            .collect();
        serve_json(&rows)
    }

    async fn post_disk_cleanup(&self, req: &Request<Body>) -> ResponseResult {
        if *req.method() != Method::POST {
            return Err(plain_response(StatusCode::METHOD_NOT_ALLOWED, "POST expected").into());
        }
        let q = query_pairs(req);
        let target = q
            .get("target")
            .and_then(|t| t.parse::<i32>().ok())
            .and_then(Target::from_pct)
            .ok_or_else(|| bad_req("target must be 1..=99 or -1"))?;
        let outcome = self
            .nvr
            .clone()
            .run_janitor_now(target)
            .await
            .map_err(HttpError::from)?;
        serve_json(&outcome)
    }

    fn media_type_for(file: &str) -> Result<&'static str, HttpError> {
        if file.ends_with(".m3u8") {
            Ok("application/x-mpegURL")
        } else if file.ends_with(".ts") {
            Ok("video/MP2T")
        } else {
            Err(not_found("unknown media type"))
        }
    }

    /// Live playlist and segments straight from the camera folder.
    async fn live_media(&self, camera_key: &str, file: &str) -> ResponseResult {
        let camera = self.camera_or_404(camera_key)?;
        let content_type = Self::media_type_for(file)?;
        serve_file(&crate::streamer::camera_dir(&camera).join(file), content_type).await
    }

    /// A synthesized fixed playlist over a segment range, or the segments
    /// themselves.
    async fn clip_media(
        &self,
        req: &Request<Body>,
        start_segment: u64,
        seconds: u32,
        camera_key: &str,
        file: &str,
    ) -> ResponseResult {
        let camera = self.camera_or_404(camera_key)?;
        let q = query_pairs(req);
        let preseq = q
            .get("preseq")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(camera.segments_prior_to_movement);
        let postseq = q
            .get("postseq")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(camera.segments_post_movement);
        if file.ends_with(".m3u8") {
            let body = hls::clip_playlist(start_segment, seconds, preseq, postseq);
            return Ok(Response::builder()
                .header(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-mpegURL"),
                )
                .body(body.into())
                .expect("hardcoded head should be valid"));
        }
        let content_type = Self::media_type_for(file)?;
        serve_file(&crate::streamer::camera_dir(&camera).join(file), content_type).await
    }

    /// One-shot `-c copy` export of a segment range as MP4.
    async fn mp4(
        &self,
        req: &Request<Body>,
        start_segment: u64,
        seconds: u32,
        camera_key: &str,
    ) -> ResponseResult {
        let camera = self.camera_or_404(camera_key)?;
        let q = query_pairs(req);
        let preseq = q
            .get("preseq")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(camera.segments_prior_to_movement);
        let postseq = q
            .get("postseq")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(camera.segments_post_movement);
        let (first, last) = hls::clip_range(start_segment, seconds, preseq, postseq);
        let dir = crate::streamer::camera_dir(&camera);
        let mut list = String::new();
        for n in first..=last {
            let p = dir.join(hls::segment_file(n));
            if p.exists() {
                list.push_str(&format!("file '{}'\n", p.display()));
            }
        }
        if list.is_empty() {
            return Err(not_found("no segments on disk for requested range"));
        }

        let scratch = tempfile::tempdir().map_err(|e| {
            HttpError::from(base::Error::wrap(ErrorKind::Internal, e))
        })?;
        let list_path = scratch.path().join("clip.concat");
        let out_path = scratch.path().join("clip.mp4");
        std::fs::write(&list_path, list)
            .map_err(|e| HttpError::from(base::Error::wrap(ErrorKind::Internal, e)))?;
        let args = vec![
            "-hide_banner".to_owned(),
            "-loglevel".to_owned(),
            "warning".to_owned(),
            "-f".to_owned(),
            "concat".to_owned(),
            "-safe".to_owned(),
            "0".to_owned(),
            "-i".to_owned(),
            list_path.to_string_lossy().into_owned(),
            "-c".to_owned(),
            "copy".to_owned(),
            "-movflags".to_owned(),
            "+faststart".to_owned(),
            out_path.to_string_lossy().into_owned(),
        ];
        let completed = self
            .nvr
            .supervisor
            .run_to_completion(
                &format!("mp4-{camera_key}-{start_segment}"),
                &self.nvr.transcoder_bin,
                args,
                Some(MP4_DEADLINE),
            )
            .await
            .map_err(HttpError::from)?;
        if completed.code != Some(0) {
            warn!(camera = %camera.name, code = ?completed.code, signal = ?completed.signal,
                  "mp4 export failed");
            return Err(HttpError::from(format_err_t!(
                Internal,
                "transcode failed: {}",
                String::from_utf8_lossy(&completed.stderr)
            )));
        }

        let mut response = serve_file(&out_path, "video/mp4").await?;
        let filename = format!("{}-{}.mp4", camera.name.replace('/', "_"), start_segment);
        response.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
                .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
        );
        // The open file handle keeps streaming after the scratch dir is
        // gone.
        drop(scratch);
        Ok(response)
    }

    /// The movement's representative image: its best detection frame, else
    /// its first extracted frame.
    async fn image(&self, movement_key: &str) -> ResponseResult {
        let movement = self.movement_or_404(movement_key)?;
        let frames_dir = self.frames_dir()?;
        if let Some(name) = db::movement::best_image(&movement) {
            return serve_file(&frames_dir.join(name), "image/jpeg").await;
        }
        let prefix = crate::extractor::frame_prefix(movement_key);
        let mut candidates: Vec<String> = std::fs::read_dir(&frames_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().map(str::to_owned))
                    .filter(|n| n.starts_with(&prefix) && n.ends_with(".jpg"))
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort();
        match candidates.first() {
            Some(name) => serve_file(&frames_dir.join(name), "image/jpeg").await,
            None => Err(not_found("movement has no frames")),
        }
    }

    /// An individual extracted frame.
    async fn frame(&self, movement_key: &str, file: &str) -> ResponseResult {
        self.movement_or_404(movement_key)?;
        let prefix = crate::extractor::frame_prefix(movement_key);
        if !file.starts_with(&prefix) || !file.ends_with(".jpg") {
            return Err(not_found("no such frame"));
        }
        serve_file(&self.frames_dir()?.join(file), "image/jpeg").await
    }
}

#[cfg(test)]
mod tests;
