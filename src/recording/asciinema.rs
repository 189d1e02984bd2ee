//! asciicast v2 writer

use super::{SessionMeta, SessionRecorder};
use crate::helper::unix_timestamp;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Serialize)]
struct Header<'a> {
    version: u8,
    width: u32,
    height: u32,
    timestamp: u64,
    title: String,
    env: BTreeMap<&'a str, &'a str>,
}

/// Writes a `.cast` file: a JSON header line, then one `[time, "o", data]`
/// event per output chunk
pub struct AsciinemaRecorder {
    out: Option<BufWriter<File>>,
}

impl AsciinemaRecorder {
    /// Create the file and write the header
    pub fn create(path: &Path, meta: &SessionMeta) -> io::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        let header = Header {
            version: 2,
            width: meta.size.width,
            height: meta.size.height,
            timestamp: unix_timestamp(),
            title: format!("{}@{} ({})", meta.user, meta.src_ip, meta.session_id),
            env: BTreeMap::from([("SHELL", "/bin/bash"), ("TERM", meta.term.as_str())]),
        };
        serde_json::to_writer(&mut out, &header)?;
        out.write_all(b"\n")?;
        Ok(AsciinemaRecorder { out: Some(out) })
    }

    fn write_event(out: &mut BufWriter<File>, elapsed: Duration, data: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(data);
        serde_json::to_writer(&mut *out, &(elapsed.as_secs_f64(), "o", text.as_ref()))?;
        out.write_all(b"\n")
    }
}

impl SessionRecorder for AsciinemaRecorder {
    fn record(&mut self, elapsed: Duration, data: &[u8]) {
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = Self::write_event(out, elapsed, data) {
                warn!(error = %e, "asciicast write failed, recording stopped");
                self.out = None;
            }
        }
    }

    fn finish(&mut self) {
        if let Some(mut out) = self.out.take() {
            if let Err(e) = out.flush() {
                warn!(error = %e, "asciicast flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::context::TermSize;

    #[test]
    fn test_cast_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.cast");
        let meta = SessionMeta {
            user: "root".into(),
            src_ip: "198.51.100.7".into(),
            session_id: "id1".into(),
            term: "xterm-256color".into(),
            size: TermSize::new(100, 30),
        };

        let mut rec = AsciinemaRecorder::create(&path, &meta).unwrap();
        rec.record(Duration::from_millis(1500), b"$ ");
        rec.record(Duration::from_millis(2000), b"ls\r\n");
        rec.finish();
        // recording after finish is ignored
        rec.record(Duration::from_secs(3), b"late");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["version"], 2);
        assert_eq!(header["width"], 100);
        assert_eq!(header["height"], 30);
        assert_eq!(header["env"]["TERM"], "xterm-256color");

        let event: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(event[0], 2.0);
        assert_eq!(event[1], "o");
        assert_eq!(event[2], "ls\r\n");
    }
}
