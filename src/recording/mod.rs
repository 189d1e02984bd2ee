//! Session recording
//!
//! A [`SessionRecorder`] receives every byte the shell sends to the client,
//! with its offset from the start of the session, and writes a replay
//! artifact. The format is picked once at startup through
//! [`SessionLogFormat`].

mod asciinema;
mod uml;

pub use asciinema::AsciinemaRecorder;
pub use uml::UmlRecorder;

use crate::helper::{sanitize_file_name, unix_timestamp};
use crate::os::context::TermSize;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Sink for terminal output of one session
pub trait SessionRecorder: Send {
    /// Record `data` sent `elapsed` after the session started
    fn record(&mut self, elapsed: Duration, data: &[u8]);

    /// Flush and close the artifact
    fn finish(&mut self);
}

/// Recording format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionLogFormat {
    /// asciicast v2 (`.cast`)
    #[default]
    Asciinema,
    /// User-Mode-Linux ttylog (`.ulm.log`)
    Uml,
    /// Do not record
    None,
}

impl SessionLogFormat {
    fn extension(self) -> Option<&'static str> {
        match self {
            SessionLogFormat::Asciinema => Some("cast"),
            SessionLogFormat::Uml => Some("ulm.log"),
            SessionLogFormat::None => None,
        }
    }
}

/// Who and what a recording is about
#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Authenticated user
    pub user: String,
    /// Source address
    pub src_ip: String,
    /// Session identifier
    pub session_id: String,
    /// Terminal type
    pub term: String,
    /// Terminal geometry at shell start
    pub size: TermSize,
}

/// Where and how sessions are recorded
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Format
    pub format: SessionLogFormat,
    /// Output directory
    pub dir: PathBuf,
}

impl RecordingConfig {
    /// Disabled recording
    pub fn disabled() -> Self {
        RecordingConfig {
            format: SessionLogFormat::None,
            dir: PathBuf::new(),
        }
    }

    /// Open a recorder for a new shell
    ///
    /// Failure is logged and yields `None`; the session proceeds unrecorded.
    pub fn open(&self, meta: &SessionMeta) -> Option<Box<dyn SessionRecorder>> {
        match create_recorder(self.format, &self.dir, meta) {
            Ok(Some((path, recorder))) => {
                info!(session_id = %meta.session_id, path = ?path, "Recording session");
                Some(recorder)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %meta.session_id, error = %e, "Session recorder unavailable");
                None
            }
        }
    }
}

/// Create a recorder of `format` under `dir`
pub fn create_recorder(
    format: SessionLogFormat,
    dir: &Path,
    meta: &SessionMeta,
) -> io::Result<Option<(PathBuf, Box<dyn SessionRecorder>)>> {
    let Some(ext) = format.extension() else {
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let name = format!(
        "{}-{}-{}-{}.{}",
        unix_timestamp(),
        sanitize_file_name(&meta.user),
        sanitize_file_name(&meta.src_ip),
        sanitize_file_name(&meta.session_id),
        ext
    );
    let path = dir.join(name);

    let recorder: Box<dyn SessionRecorder> = match format {
        SessionLogFormat::Asciinema => Box::new(AsciinemaRecorder::create(&path, meta)?),
        SessionLogFormat::Uml => Box::new(UmlRecorder::create(&path)?),
        SessionLogFormat::None => return Ok(None),
    };
    Ok(Some((path, recorder)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SessionMeta {
        SessionMeta {
            user: "../root".into(),
            src_ip: "192.0.2.1".into(),
            session_id: "abc".into(),
            term: "xterm".into(),
            size: TermSize::default(),
        }
    }

    #[test]
    fn test_none_format_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let result = create_recorder(SessionLogFormat::None, dir.path(), &meta()).unwrap();
        assert!(result.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_name_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let (path, mut rec) = create_recorder(SessionLogFormat::Asciinema, dir.path(), &meta())
            .unwrap()
            .unwrap();
        rec.finish();

        assert_eq!(path.parent().unwrap(), dir.path());
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-.._root-192.0.2.1-abc.cast"), "{}", name);
    }

    #[test]
    fn test_open_failure_is_not_fatal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = RecordingConfig {
            format: SessionLogFormat::Uml,
            // a regular file cannot be used as a directory
            dir: file.path().join("sessions"),
        };
        assert!(config.open(&meta()).is_none());
        assert!(RecordingConfig::disabled().open(&meta()).is_none());
    }

    #[test]
    fn test_format_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            fmt: SessionLogFormat,
        }
        let w: Wrapper = toml::from_str("fmt = \"uml\"").unwrap();
        assert_eq!(w.fmt, SessionLogFormat::Uml);
        let w: Wrapper = toml::from_str("fmt = \"none\"").unwrap();
        assert_eq!(w.fmt, SessionLogFormat::None);
    }
}
