//! HTTP front end (spec §4/§7): one catch-all route handling GET/HEAD/POST,
//! wiring together query parsing, cache lookup, the image pipeline, and
//! telemetry. `Dirpy-Data` is attached to every response, success or not.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{FromRequest, Multipart, Path, RawQuery, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::sync::Mutex;

use crate::cache::{self, Cache, CacheEntry};
use crate::config::Config;
use crate::error::DirpyError;
use crate::pipeline::Pipeline;
use crate::query::{parse_query, OptionBag};
use crate::source;
use crate::telemetry::MetaData;

pub struct AppState {
    pub cfg: Config,
    pub cache: Option<Mutex<Cache>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(handle_root))
        .route("/*rel_file", any(handle))
        .with_state(state)
}

async fn handle_root(state: State<Arc<AppState>>, method: Method, raw_query: RawQuery, request: Request) -> Response {
    dispatch(state, method, String::new(), raw_query, request).await
}

async fn handle(
    state: State<Arc<AppState>>,
    method: Method,
    Path(rel_file): Path<String>,
    raw_query: RawQuery,
    request: Request,
) -> Response {
    dispatch(state, method, rel_file, raw_query, request).await
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    rel_file: String,
    RawQuery(raw_query): RawQuery,
    request: Request,
) -> Response {
    let started = Instant::now();
    let file_path = format!("/{rel_file}");
    let raw_query = raw_query.unwrap_or_default();

    if file_path == "/favicon.ico" {
        return no_content(MetaData::new(), &state.cfg, started);
    }

    let query = parse_query(&raw_query);

    if query.pipeline.iter().any(|(cmd, _)| cmd == "status") {
        return no_content(MetaData::new(), &state.cfg, started);
    }

    let is_post = method == Method::POST;
    let post_body = match extract_post_file(&method, request).await {
        Ok(b) => b,
        Err(err) => return error_response(err, MetaData::new(), &state.cfg, started),
    };
    let post_body: Option<&[u8]> = post_body.as_deref();

    // Cache lookup, skipped entirely for POST requests.
    if let (Some(cache), false) = (&state.cache, is_post) {
        let key = cache::fingerprint(&state.cfg.redis_prefix, &file_path, &raw_query);
        let read_start = Instant::now();
        let mut guard = cache.lock().await;
        let hit = guard.get(&key).await;
        drop(guard);
        if let Some(entry) = hit {
            let (mut meta, out_fmt, bytes) = entry.into_meta_data();
            meta.c.insert("cache_hit".to_string(), 1);
            meta.add_ms_seconds("time_cache_read", read_start.elapsed().as_secs_f64());
            return image_response(bytes, out_fmt, meta, &state.cfg, started, method == Method::HEAD);
        }
    }

    let result = run_pipeline(&state, &file_path, &rel_file, &query.load.unwrap_or_default(), &query.save.unwrap_or_default(), &query.pipeline, post_body).await;

    match result {
        Ok((bytes, out_fmt, mut meta)) => {
            if bytes.is_empty() {
                return no_content(meta, &state.cfg, started);
            }

            if let (Some(cache), false) = (&state.cache, is_post) {
                let key = cache::fingerprint(&state.cfg.redis_prefix, &file_path, &raw_query);
                let entry = CacheEntry {
                    out_fmt: out_fmt.clone(),
                    out_bytes: bytes.clone(),
                    meta_g: meta.g.clone(),
                    meta_c: meta.c.clone(),
                };
                let write_start = Instant::now();
                let mut guard = cache.lock().await;
                let wrote = guard.put(&key, &entry).await;
                drop(guard);
                meta.add_ms_seconds("time_cache_write", write_start.elapsed().as_secs_f64());
                if wrote {
                    meta.c.insert("cache_write".to_string(), 1);
                }
            }

            image_response(bytes, out_fmt, meta, &state.cfg, started, method == Method::HEAD)
        }
        Err((err, meta)) => error_response(err, meta, &state.cfg, started),
    }
}

async fn run_pipeline(
    state: &AppState,
    file_path: &str,
    rel_file: &str,
    load_opts: &OptionBag,
    save_opts: &OptionBag,
    cmds: &[(String, OptionBag)],
    post_body: Option<&[u8]>,
) -> Result<(Vec<u8>, String, MetaData), (DirpyError, MetaData)> {
    let mut meta = MetaData::new();

    let run = async {
        let load_start = Instant::now();
        let loaded = source::load(
            &state.cfg.http_root,
            rel_file.trim_start_matches('/'),
            load_opts,
            post_body,
            state.cfg.allow_post,
        )
        .await?;
        meta.add_ms_seconds("load_time", load_start.elapsed().as_secs_f64());

        let mut pipeline = Pipeline::decode(loaded.bytes, loaded.file_path, &state.cfg, &mut meta)?;

        for (cmd, opts) in cmds {
            let step_start = Instant::now();
            match cmd.as_str() {
                "resize" => pipeline.resize(opts)?,
                "crop" => pipeline.crop(opts)?,
                "pad" => pipeline.pad(opts)?,
                "transpose" => pipeline.transpose(opts)?,
                other if other.starts_with('_') => {
                    return Err(DirpyError::user(format!("Internal method not run()-able: {other}")));
                }
                other => return Err(DirpyError::user(format!("Unknown command: {other}"))),
            }
            meta.add_ms_seconds(&format!("time_{cmd}"), step_start.elapsed().as_secs_f64());
        }

        let save_start = Instant::now();
        let out = pipeline.save(save_opts, &state.cfg, &mut meta)?;
        meta.add_ms_seconds("time_save", save_start.elapsed().as_secs_f64());

        let _ = file_path;
        Ok((out.bytes, out.out_fmt))
    };

    match run.await {
        Ok((bytes, out_fmt)) => Ok((bytes, out_fmt, meta)),
        Err(err) => Err((err, meta)),
    }
}

/// POST bodies are `multipart/form-data` with a single `file` part, the
/// way the original reads `form['file'].file` off a `cgi.FieldStorage`.
/// Non-POST requests, and POSTs that aren't multipart at all, simply have
/// no POST source available.
async fn extract_post_file(method: &Method, request: Request) -> Result<Option<Vec<u8>>, DirpyError> {
    if *method != Method::POST {
        return Ok(None);
    }

    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if !content_type.starts_with("multipart/form-data") {
        return Ok(None);
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| DirpyError::user(format!("Malformed multipart POST body: {e}")))?;

    let mut file_bytes: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DirpyError::user(format!("Malformed multipart POST body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        if file_bytes.is_some() {
            return Err(DirpyError::user("POST data must contain exactly one 'file' part"));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| DirpyError::user(format!("Malformed multipart POST body: {e}")))?;
        file_bytes = Some(bytes.to_vec());
    }

    match file_bytes {
        Some(bytes) => Ok(Some(bytes)),
        None => Err(DirpyError::user("POST data missing 'file' part")),
    }
}

fn no_content(meta: MetaData, cfg: &Config, started: Instant) -> Response {
    let data = meta.flush(cfg, started);
    let mut headers = HeaderMap::new();
    headers.insert("Dirpy-Data", HeaderValue::from_str(&data).unwrap_or(HeaderValue::from_static("{}")));
    (StatusCode::NO_CONTENT, headers).into_response()
}

fn image_response(bytes: Vec<u8>, out_fmt: String, meta: MetaData, cfg: &Config, started: Instant, head: bool) -> Response {
    let data = meta.flush(cfg, started);
    let mut headers = HeaderMap::new();
    headers.insert("Dirpy-Data", HeaderValue::from_str(&data).unwrap_or(HeaderValue::from_static("{}")));
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_str(&format!("image/{out_fmt}")).unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(axum::http::header::CONTENT_LENGTH, HeaderValue::from(bytes.len()));

    if head {
        (StatusCode::OK, headers).into_response()
    } else {
        (StatusCode::OK, headers, bytes).into_response()
    }
}

fn error_response(err: DirpyError, meta: MetaData, cfg: &Config, started: Instant) -> Response {
    match &err {
        DirpyError::Fatal { .. } => tracing::warn!("{}", err.log_message()),
        DirpyError::User { .. } => tracing::debug!("{}", err.log_message()),
        DirpyError::Uncaught(_) => tracing::warn!("{}", err.log_message()),
    }

    let data = meta.flush(cfg, started);
    let mut headers = HeaderMap::new();
    headers.insert("Dirpy-Data", HeaderValue::from_str(&data).unwrap_or(HeaderValue::from_static("{}")));
    headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, headers, err.client_message()).into_response()
}
