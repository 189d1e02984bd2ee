//! User-Mode-Linux ttylog writer
//!
//! Each record is six little-endian 32-bit fields (`op`, `tty`, `len`,
//! `direction`, `sec`, `usec`) followed by `len` bytes of data. The log
//! opens with an `OPEN` record and ends with a `CLOSE` record.

use super::SessionRecorder;
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Record opcodes
pub const OP_OPEN: i32 = 1;
/// Session closed
pub const OP_CLOSE: i32 = 2;
/// Data written to or read from the tty
pub const OP_WRITE: i32 = 3;

/// Data flowing to the client
pub const DIR_WRITE: i32 = 2;

const TTY_ID: u32 = 1;

/// Writes a ttylog replayable by the usual playlog tools
pub struct UmlRecorder {
    out: Option<BufWriter<File>>,
    started: SystemTime,
}

impl UmlRecorder {
    /// Create the log and write the `OPEN` record
    pub fn create(path: &Path) -> io::Result<Self> {
        let mut recorder = UmlRecorder {
            out: Some(BufWriter::new(File::create(path)?)),
            started: SystemTime::now(),
        };
        recorder.write_record(OP_OPEN, 0, Duration::ZERO, &[])?;
        Ok(recorder)
    }

    fn write_record(
        &mut self,
        op: i32,
        direction: i32,
        elapsed: Duration,
        data: &[u8],
    ) -> io::Result<()> {
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };

        let stamp = (self.started + elapsed)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut rec = BytesMut::with_capacity(24 + data.len());
        rec.put_i32_le(op);
        rec.put_u32_le(TTY_ID);
        rec.put_i32_le(data.len() as i32);
        rec.put_i32_le(direction);
        rec.put_u32_le(stamp.as_secs() as u32);
        rec.put_u32_le(stamp.subsec_micros());
        rec.put_slice(data);
        out.write_all(&rec)
    }
}

impl SessionRecorder for UmlRecorder {
    fn record(&mut self, elapsed: Duration, data: &[u8]) {
        if let Err(e) = self.write_record(OP_WRITE, DIR_WRITE, elapsed, data) {
            warn!(error = %e, "ttylog write failed, recording stopped");
            self.out = None;
        }
    }

    fn finish(&mut self) {
        let elapsed = self.started.elapsed().unwrap_or_default();
        let result = self
            .write_record(OP_CLOSE, 0, elapsed, &[])
            .and_then(|_| match self.out.take() {
                Some(mut out) => out.flush(),
                None => Ok(()),
            });
        if let Err(e) = result {
            warn!(error = %e, "ttylog close failed");
        }
        self.out = None;
    }
}
