//! Frame ingestion sources.
//!
//! This module provides the `FrameSource` contract and its implementations:
//! - RTSP streams from the PTZ camera (feature: rtsp-gstreamer)
//! - Synthetic `stub://` streams (testing, demos)
//!
//! Sources are opened once as a pre-flight check, then reopened by the
//! pipeline. `next_frame` distinguishes a clean end of stream from a
//! transient hiccup so the caller can decide between stopping and
//! reconnecting.

pub mod rtsp;

use thiserror::Error;
use url::Url;

use crate::frame::Frame;

pub use rtsp::{RtspConfig, RtspSource, RtspStats};

/// The stream could not be opened.
#[derive(Debug, Error)]
#[error("cannot open stream {url}: {reason}")]
pub struct ConnectError {
    /// Redacted URL.
    pub url: String,
    pub reason: String,
}

impl ConnectError {
    pub fn new(url: &str, reason: impl Into<String>) -> Self {
        Self {
            url: redact_url(url),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    /// The stream finished; no more frames will arrive.
    #[error("end of stream")]
    EndOfStream,
    /// A hiccup; reopening the stream may recover.
    #[error("transient read error: {0}")]
    Transient(String),
}

/// A live video transport.
pub trait FrameSource: Send {
    /// Open (or reopen) the stream.
    fn open(&mut self) -> Result<(), ConnectError>;

    /// Read the next frame. Frame ids keep increasing across reopens.
    fn next_frame(&mut self) -> Result<Frame, ReadError>;

    /// Release transport resources. Safe to call when not open.
    fn close(&mut self);

    /// Redacted description for logs.
    fn describe(&self) -> String;
}

/// Replace URL credentials with `***` so they never reach the logs.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if !url.username().is_empty() {
                let _ = url.set_username("***");
            }
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}
