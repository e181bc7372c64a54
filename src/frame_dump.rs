use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use uuid::Uuid;

use crate::{
    broadcaster::VideoSink,
    error::{Error, MediaErrorKind},
    frame::VideoFrame,
};

/// Debug sink that writes the next frame to disk after [`FrameDumpSink::request_dump`].
#[derive(Debug)]
pub struct FrameDumpSink {
    id: String,
    path: PathBuf,
    requested: AtomicBool,
}

impl FrameDumpSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: path.into(),
            requested: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request_dump(&self) {
        self.requested.store(true, Ordering::Release);
    }
}

impl VideoSink for FrameDumpSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_frame(&self, frame: &VideoFrame) {
        if !self.requested.swap(false, Ordering::AcqRel) {
            return;
        }
        match write_i420(frame, &self.path) {
            Ok(()) => tracing::info!(
                "dumped {}x{} frame to {}",
                frame.width,
                frame.height,
                self.path.display()
            ),
            Err(err) => tracing::error!("failed to dump frame: {}", err),
        }
    }
}

/// Writes the Y, U and V planes of `frame` back to back.
pub fn write_i420(frame: &VideoFrame, path: &Path) -> Result<(), Error> {
    let mut file = File::create(path).map_err(|e| {
        Error::new_media(
            format!("failed to create {}: {}", path.display(), e),
            MediaErrorKind::DumpError,
        )
    })?;
    for plane in [frame.buffer.y(), frame.buffer.u(), frame.buffer.v()] {
        file.write_all(plane)?;
    }
    file.flush()?;
    Ok(())
}
