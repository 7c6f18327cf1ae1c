//! Read-only HTTP view over the artifact directory.
//!
//! Every request re-lists or re-reads the directory; nothing is cached and
//! nothing is locked, so the gallery keeps serving while the pipeline writes
//! (or after it has stopped).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::store::{content_type_for, latest_event, ArtifactReader};

const MAX_REQUEST_BYTES: usize = 8192;
/// Upper bound for `GET /?limit=N`.
pub const MAX_LIST_LIMIT: usize = 200;

#[derive(Clone, Debug)]
pub struct GalleryConfig {
    pub addr: String,
    /// Default number of artifacts on the index page.
    pub limit: usize,
    pub title: String,
    /// Concurrent connections served; the rest get 503.
    pub max_connections: usize,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            limit: 20,
            title: "Recent Detections".to_string(),
            max_connections: 64,
        }
    }
}

#[derive(Debug)]
pub struct GalleryHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl GalleryHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("gallery server thread panicked"))?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }
}

struct GalleryContext {
    cfg: GalleryConfig,
    reader: ArtifactReader,
    event_log: PathBuf,
}

pub struct GalleryServer {
    cfg: GalleryConfig,
    reader: ArtifactReader,
    event_log: PathBuf,
}

impl GalleryServer {
    pub fn new(cfg: GalleryConfig, reader: ArtifactReader, event_log: impl Into<PathBuf>) -> Self {
        Self {
            cfg,
            reader,
            event_log: event_log.into(),
        }
    }

    /// Bind and start serving on a background thread.
    ///
    /// A bind failure is returned here; it is the one gallery error that is
    /// fatal to the process.
    pub fn spawn(self) -> Result<GalleryHandle> {
        let listener = TcpListener::bind(&self.cfg.addr)
            .with_context(|| format!("bind gallery on {}", self.cfg.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = Arc::new(GalleryContext {
            cfg: self.cfg,
            reader: self.reader,
            event_log: self.event_log,
        });
        let join = std::thread::Builder::new()
            .name("gallery".to_string())
            .spawn(move || {
                run_gallery(listener, ctx, shutdown_thread);
                log::debug!("gallery accept loop exited");
            })?;
        log::info!("gallery listening on http://{}", addr);

        Ok(GalleryHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

/// Decrements the active connection count when a handler thread ends.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pause before the next `accept()` after a failed one.
///
/// No accept error ends the loop: an aborted handshake costs one client and
/// descriptor exhaustion clears as handler threads finish.
fn accept_retry_delay(err: &std::io::Error) -> Duration {
    match err.kind() {
        std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::Interrupted => Duration::ZERO,
        _ => Duration::from_millis(50),
    }
}

fn run_gallery(listener: TcpListener, ctx: Arc<GalleryContext>, shutdown: Arc<AtomicBool>) {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((mut stream, peer)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    log::warn!("gallery dropping connection from {}: {}", peer, err);
                    continue;
                }
                if active.fetch_add(1, Ordering::SeqCst) >= ctx.cfg.max_connections {
                    active.fetch_sub(1, Ordering::SeqCst);
                    log::warn!("gallery busy, rejecting {}", peer);
                    let _ = stream.set_write_timeout(Some(Duration::from_secs(1)));
                    let _ = write_json_response(&mut stream, 503, r#"{"error":"busy"}"#);
                    continue;
                }
                let slot = ConnectionSlot(active.clone());
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("gallery-conn".to_string())
                    .spawn(move || {
                        let _slot = slot;
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::debug!("gallery request from {} failed: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("gallery could not spawn handler: {}", err);
                }
            }
            Err(err) => {
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    log::warn!("gallery accept failed: {}", err);
                }
                std::thread::sleep(accept_retry_delay(&err));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &GalleryContext) -> Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    if let Some(name) = request.path.strip_prefix("/images/") {
        return match ctx.reader.fetch(name) {
            Ok(bytes) => write_response(&mut stream, 200, content_type_for(name), &bytes),
            Err(err) => {
                log::debug!("gallery: {}", err);
                write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)
            }
        };
    }

    match request.path.as_str() {
        "/" => {
            let limit = request
                .query_param("limit")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(ctx.cfg.limit)
                .clamp(1, MAX_LIST_LIMIT);
            let names = match ctx.reader.list_recent(limit) {
                Ok(names) => names,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(err) => {
                    log::warn!("gallery listing failed: {}", err);
                    write_json_response(&mut stream, 500, r#"{"error":"listing_failed"}"#)?;
                    return Ok(());
                }
            };
            let page = render_index(&ctx.cfg.title, &names);
            write_response(&mut stream, 200, "text/html; charset=utf-8", page.as_bytes())
        }
        "/health" => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        "/events/latest" => match latest_event(&ctx.event_log) {
            Ok(Some(event)) => {
                let payload = serde_json::to_vec(&event)?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            Ok(None) => write_json_response(&mut stream, 404, r#"{"error":"no_events"}"#),
            Err(err) => {
                log::warn!("gallery could not read event log: {}", err);
                write_json_response(&mut stream, 500, r#"{"error":"event_log_unreadable"}"#)
            }
        },
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn render_index(title: &str, names: &[String]) -> String {
    let title = html_escape(title);
    let mut items = String::new();
    for name in names {
        let name = html_escape(name);
        items.push_str(&format!(
            "    <figure><img src=\"/images/{name}\" alt=\"{name}\" loading=\"lazy\"><figcaption>{name}</figcaption></figure>\n"
        ));
    }
    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="5">
<title>{title}</title>
<style>
body {{ background-color: #121212; color: white; font-family: sans-serif; }}
.carousel {{ display: flex; overflow-x: scroll; position: fixed; bottom: 0; height: 20vh; width: 100vw; background: rgba(0,0,0,0.6); }}
.carousel figure {{ margin: 5px; height: 100%; }}
.carousel img {{ height: 85%; border-radius: 8px; }}
figcaption {{ font-size: 0.7em; }}
</style>
</head>
<body>
<h2>{title}</h2>
<p>{count} most recent</p>
<div class="carousel">
{items}</div>
</body>
</html>
"#,
        title = title,
        count = names.len(),
        items = items
    )
}

fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (raw_path, None),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Option<String>,
}

impl HttpRequest {
    fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .as_deref()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}
