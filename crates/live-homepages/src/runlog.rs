//! Append-only NDJSON run log.
//!
//! Entries are written whole under a mutex and flushed one by one, so a
//! crash keeps every completed row. The first write error is reported and
//! disables the sink; fetching never waits on a broken log.
use crawl_common::{write_ndjson_to, Event};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub struct RunLog {
    sink: Mutex<Option<Box<dyn Write + Send>>>,
}

impl RunLog {
    pub fn disabled() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    /// Open `path` for appending. An unopenable path degrades to no log.
    pub fn open(path: &Path) -> Self {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self::from_writer(file),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot open run log; continuing without it");
                Self::disabled()
            }
        }
    }

    pub fn from_writer(w: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Some(Box::new(w))),
        }
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.sink.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn append(&self, event: &Event) {
        let mut sink = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(w) = sink.as_mut() else {
            return;
        };
        if let Err(e) = write_ndjson_to(w, event) {
            tracing::warn!(error = %format!("{:#}", e), "run log write failed; continuing without it");
            *sink = None;
        }
    }
}
