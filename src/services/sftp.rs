//! SFTP v3 subsystem over the virtual filesystem
//!
//! Packets are `uint32 length | byte type | payload`. Requests carry a
//! `uint32 id` that is echoed in the response. Only the operations an
//! intruder needs to browse, download and upload are implemented; everything
//! else is answered with `SSH_FX_OP_UNSUPPORTED`.

use crate::error::MirageError;
use crate::os::fs::{resolve_path, DirEntry, VirtualFs};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Protocol version we speak
pub const SFTP_VERSION: u32 = 3;

/// Largest accepted packet
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// Largest file accepted through `WRITE`
const MAX_FILE_LEN: usize = 64 * 1024 * 1024;

/// Open handles allowed per session
const MAX_OPEN_HANDLES: usize = 32;

/// File contents buffered across all open handles of a session
const MAX_BUFFERED_LEN: usize = MAX_FILE_LEN;

const SSH_FXP_INIT: u8 = 1;
const SSH_FXP_VERSION: u8 = 2;
const SSH_FXP_OPEN: u8 = 3;
const SSH_FXP_CLOSE: u8 = 4;
const SSH_FXP_READ: u8 = 5;
const SSH_FXP_WRITE: u8 = 6;
const SSH_FXP_LSTAT: u8 = 7;
const SSH_FXP_FSTAT: u8 = 8;
const SSH_FXP_OPENDIR: u8 = 11;
const SSH_FXP_READDIR: u8 = 12;
const SSH_FXP_MKDIR: u8 = 14;
const SSH_FXP_REALPATH: u8 = 16;
const SSH_FXP_STAT: u8 = 17;
const SSH_FXP_STATUS: u8 = 101;
const SSH_FXP_HANDLE: u8 = 102;
const SSH_FXP_DATA: u8 = 103;
const SSH_FXP_NAME: u8 = 104;
const SSH_FXP_ATTRS: u8 = 105;

const SSH_FX_OK: u32 = 0;
const SSH_FX_EOF: u32 = 1;
const SSH_FX_NO_SUCH_FILE: u32 = 2;
const SSH_FX_FAILURE: u32 = 4;
const SSH_FX_BAD_MESSAGE: u32 = 5;
const SSH_FX_OP_UNSUPPORTED: u32 = 8;

const SSH_FILEXFER_ATTR_SIZE: u32 = 0x01;
const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x02;
const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x04;

const SSH_FXF_WRITE: u32 = 0x02;
const SSH_FXF_APPEND: u32 = 0x04;
const SSH_FXF_CREAT: u32 = 0x08;
const SSH_FXF_TRUNC: u32 = 0x10;

const MODE_DIR: u32 = 0o040755;
const MODE_FILE: u32 = 0o100644;

#[derive(Debug)]
enum OpenHandle {
    Dir { entries: Vec<DirEntry>, drained: bool },
    File { path: String, data: Vec<u8>, dirty: bool },
}

/// One SFTP session bound to a channel
#[derive(Debug)]
pub struct SftpServer {
    fs: Arc<dyn VirtualFs>,
    home: String,
    uid: u32,
    gid: u32,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
    max_handles: usize,
    max_buffered: usize,
}

fn take_u32(buf: &mut Bytes) -> Result<u32, MirageError> {
    if buf.remaining() < 4 {
        return Err(MirageError::Protocol("truncated sftp packet".into()));
    }
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut Bytes) -> Result<u64, MirageError> {
    if buf.remaining() < 8 {
        return Err(MirageError::Protocol("truncated sftp packet".into()));
    }
    Ok(buf.get_u64())
}

fn take_string(buf: &mut Bytes) -> Result<Bytes, MirageError> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(MirageError::Protocol("truncated sftp string".into()));
    }
    Ok(buf.split_to(len))
}

fn take_path(buf: &mut Bytes) -> Result<String, MirageError> {
    let raw = take_string(buf)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn put_string(out: &mut BytesMut, data: &[u8]) {
    out.put_u32(data.len() as u32);
    out.put_slice(data);
}

fn frame(kind: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut payload = BytesMut::new();
    payload.put_u8(kind);
    body(&mut payload);
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_slice(&payload);
    out
}

fn status(id: u32, code: u32, message: &str) -> BytesMut {
    frame(SSH_FXP_STATUS, |out| {
        out.put_u32(id);
        out.put_u32(code);
        put_string(out, message.as_bytes());
        put_string(out, b"en");
    })
}

impl SftpServer {
    /// Serve the filesystem rooted at `home` for a user with `uid`/`gid`
    pub fn new(fs: Arc<dyn VirtualFs>, home: impl Into<String>, uid: u32, gid: u32) -> Self {
        SftpServer {
            fs,
            home: home.into(),
            uid,
            gid,
            handles: HashMap::new(),
            next_handle: 0,
            max_handles: MAX_OPEN_HANDLES,
            max_buffered: MAX_BUFFERED_LEN,
        }
    }

    /// Serve packets until the client closes the stream
    ///
    /// Returns 0 on a clean EOF and 1 on a framing or transport error.
    pub async fn run<S>(mut self, mut stream: S) -> i32
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            let len = match stream.read_u32().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!(error = %e, "SFTP read failed");
                    return 1;
                }
            };
            if len == 0 || len > MAX_PACKET_LEN {
                warn!(len, "SFTP packet length out of range");
                return 1;
            }

            let mut packet = vec![0u8; len];
            if let Err(e) = stream.read_exact(&mut packet).await {
                warn!(error = %e, "SFTP packet truncated");
                return 1;
            }

            let reply = self.handle_packet(Bytes::from(packet));
            if let Some(reply) = reply {
                if let Err(e) = stream.write_all(&reply).await {
                    warn!(error = %e, "SFTP write failed");
                    return 1;
                }
                let _ = stream.flush().await;
            }
        }

        self.flush_all();
        0
    }

    /// Handle one packet (without its length prefix) and build the response
    pub fn handle_packet(&mut self, mut packet: Bytes) -> Option<BytesMut> {
        if !packet.has_remaining() {
            return None;
        }
        let kind = packet.get_u8();

        if kind == SSH_FXP_INIT {
            let version = take_u32(&mut packet).unwrap_or(0);
            debug!(client_version = version, "SFTP init");
            return Some(frame(SSH_FXP_VERSION, |out| out.put_u32(SFTP_VERSION)));
        }

        let id = match take_u32(&mut packet) {
            Ok(id) => id,
            Err(_) => return None,
        };

        let result = match kind {
            SSH_FXP_REALPATH => self.realpath(id, &mut packet),
            SSH_FXP_STAT | SSH_FXP_LSTAT => self.stat(id, &mut packet),
            SSH_FXP_FSTAT => self.fstat(id, &mut packet),
            SSH_FXP_OPENDIR => self.opendir(id, &mut packet),
            SSH_FXP_READDIR => self.readdir(id, &mut packet),
            SSH_FXP_OPEN => self.open(id, &mut packet),
            SSH_FXP_READ => self.read(id, &mut packet),
            SSH_FXP_WRITE => self.write(id, &mut packet),
            SSH_FXP_CLOSE => self.close(id, &mut packet),
            SSH_FXP_MKDIR => self.mkdir(id, &mut packet),
            other => {
                info!(request = other, "SFTP request unsupported");
                Ok(status(id, SSH_FX_OP_UNSUPPORTED, "Operation unsupported"))
            }
        };

        Some(result.unwrap_or_else(|e| {
            warn!(error = %e, "Malformed SFTP request");
            status(id, SSH_FX_BAD_MESSAGE, "Bad message")
        }))
    }

    fn resolve(&self, path: &str) -> String {
        resolve_path(&self.home, &self.home, if path.is_empty() { "." } else { path })
    }

    fn attrs(&self, out: &mut BytesMut, is_dir: bool, size: u64) {
        out.put_u32(
            SSH_FILEXFER_ATTR_SIZE | SSH_FILEXFER_ATTR_UIDGID | SSH_FILEXFER_ATTR_PERMISSIONS,
        );
        out.put_u64(size);
        out.put_u32(self.uid);
        out.put_u32(self.gid);
        out.put_u32(if is_dir { MODE_DIR } else { MODE_FILE });
    }

    fn long_name(entry: &DirEntry) -> String {
        let (perm, links) = if entry.is_dir {
            ("drwxr-xr-x", 2)
        } else {
            ("-rw-r--r--", 1)
        };
        format!(
            "{} {} root root {:>8} Jan  1 00:00 {}",
            perm, links, entry.size, entry.name
        )
    }

    fn new_handle(&mut self, handle: OpenHandle) -> Option<String> {
        if self.handles.len() >= self.max_handles {
            warn!(open = self.handles.len(), "SFTP handle limit reached");
            return None;
        }
        self.next_handle += 1;
        let name = format!("h{}", self.next_handle);
        self.handles.insert(name.clone(), handle);
        Some(name)
    }

    fn buffered_len(&self) -> usize {
        self.handles
            .values()
            .map(|handle| match handle {
                OpenHandle::File { data, .. } => data.len(),
                OpenHandle::Dir { .. } => 0,
            })
            .sum()
    }

    fn handle_reply(id: u32, handle: Option<String>) -> BytesMut {
        match handle {
            Some(handle) => frame(SSH_FXP_HANDLE, |out| {
                out.put_u32(id);
                put_string(out, handle.as_bytes());
            }),
            None => status(id, SSH_FX_FAILURE, "Too many open files"),
        }
    }

    fn realpath(&self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let path = self.resolve(&take_path(packet)?);
        info!(path = %path, "SFTP realpath");
        Ok(frame(SSH_FXP_NAME, |out| {
            out.put_u32(id);
            out.put_u32(1);
            put_string(out, path.as_bytes());
            put_string(out, path.as_bytes());
            out.put_u32(0);
        }))
    }

    fn stat(&self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let path = self.resolve(&take_path(packet)?);
        info!(path = %path, "SFTP stat");
        if self.fs.is_dir(&path) {
            return Ok(frame(SSH_FXP_ATTRS, |out| {
                out.put_u32(id);
                self.attrs(out, true, 4096);
            }));
        }
        match self.fs.file_size(&path) {
            Some(size) => Ok(frame(SSH_FXP_ATTRS, |out| {
                out.put_u32(id);
                self.attrs(out, false, size);
            })),
            None => Ok(status(id, SSH_FX_NO_SUCH_FILE, "No such file")),
        }
    }

    fn fstat(&self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let handle = take_path(packet)?;
        Ok(match self.handles.get(&handle) {
            Some(OpenHandle::Dir { .. }) => frame(SSH_FXP_ATTRS, |out| {
                out.put_u32(id);
                self.attrs(out, true, 4096);
            }),
            Some(OpenHandle::File { data, .. }) => frame(SSH_FXP_ATTRS, |out| {
                out.put_u32(id);
                self.attrs(out, false, data.len() as u64);
            }),
            None => status(id, SSH_FX_FAILURE, "Invalid handle"),
        })
    }

    fn opendir(&mut self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let path = self.resolve(&take_path(packet)?);
        info!(path = %path, "SFTP opendir");
        match self.fs.read_dir(&path) {
            Ok(mut entries) => {
                entries.insert(
                    0,
                    DirEntry {
                        name: ".".into(),
                        is_dir: true,
                        size: 4096,
                    },
                );
                let handle = self.new_handle(OpenHandle::Dir {
                    entries,
                    drained: false,
                });
                Ok(Self::handle_reply(id, handle))
            }
            Err(_) => Ok(status(id, SSH_FX_NO_SUCH_FILE, "No such file")),
        }
    }

    fn readdir(&mut self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let handle = take_path(packet)?;
        let Some(OpenHandle::Dir { entries, drained }) = self.handles.get_mut(&handle) else {
            return Ok(status(id, SSH_FX_FAILURE, "Invalid handle"));
        };
        if *drained {
            return Ok(status(id, SSH_FX_EOF, "End of file"));
        }
        *drained = true;
        let entries = std::mem::take(entries);
        Ok(frame(SSH_FXP_NAME, |out| {
            out.put_u32(id);
            out.put_u32(entries.len() as u32);
            for entry in &entries {
                put_string(out, entry.name.as_bytes());
                put_string(out, Self::long_name(entry).as_bytes());
                self.attrs(out, entry.is_dir, entry.size);
            }
        }))
    }

    fn open(&mut self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let path = self.resolve(&take_path(packet)?);
        let pflags = take_u32(packet)?;
        let writing = pflags & (SSH_FXF_WRITE | SSH_FXF_APPEND | SSH_FXF_CREAT) != 0;
        info!(path = %path, pflags, "SFTP open");

        if self.fs.is_dir(&path) {
            return Ok(status(id, SSH_FX_FAILURE, "Is a directory"));
        }
        if self.handles.len() >= self.max_handles {
            return Ok(Self::handle_reply(id, None));
        }
        let data = match self.fs.read_file(&path) {
            Ok(data) if pflags & SSH_FXF_TRUNC == 0 => data,
            Ok(_) => Vec::new(),
            Err(_) if pflags & SSH_FXF_CREAT != 0 => Vec::new(),
            Err(_) => return Ok(status(id, SSH_FX_NO_SUCH_FILE, "No such file")),
        };
        if self.buffered_len() + data.len() > self.max_buffered {
            return Ok(status(id, SSH_FX_FAILURE, "Out of memory"));
        }

        let handle = self.new_handle(OpenHandle::File {
            path,
            data,
            dirty: writing,
        });
        Ok(Self::handle_reply(id, handle))
    }

    fn read(&mut self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let handle = take_path(packet)?;
        let offset = take_u64(packet)? as usize;
        let len = take_u32(packet)? as usize;
        let Some(OpenHandle::File { data, .. }) = self.handles.get(&handle) else {
            return Ok(status(id, SSH_FX_FAILURE, "Invalid handle"));
        };
        if offset >= data.len() {
            return Ok(status(id, SSH_FX_EOF, "End of file"));
        }
        let end = data.len().min(offset + len.min(MAX_PACKET_LEN / 2));
        Ok(frame(SSH_FXP_DATA, |out| {
            out.put_u32(id);
            put_string(out, &data[offset..end]);
        }))
    }

    fn write(&mut self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let handle = take_path(packet)?;
        let offset = take_u64(packet)? as usize;
        let chunk = take_string(packet)?;
        let buffered = self.buffered_len();
        let max_buffered = self.max_buffered;
        let Some(OpenHandle::File { data, dirty, .. }) = self.handles.get_mut(&handle) else {
            return Ok(status(id, SSH_FX_FAILURE, "Invalid handle"));
        };
        if offset > MAX_FILE_LEN || chunk.len() > MAX_FILE_LEN - offset {
            return Ok(status(id, SSH_FX_FAILURE, "File too large"));
        }
        let end = offset + chunk.len();
        if end > data.len() && buffered - data.len() + end > max_buffered {
            return Ok(status(id, SSH_FX_FAILURE, "Out of memory"));
        }
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(&chunk);
        *dirty = true;
        Ok(status(id, SSH_FX_OK, "Success"))
    }

    fn close(&mut self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let handle = take_path(packet)?;
        match self.handles.remove(&handle) {
            Some(OpenHandle::File { path, data, dirty }) if dirty => {
                info!(path = %path, size = data.len(), "SFTP upload");
                match self.fs.write_file(&path, &data) {
                    Ok(()) => Ok(status(id, SSH_FX_OK, "Success")),
                    Err(e) => Ok(status(id, SSH_FX_FAILURE, &e.to_string())),
                }
            }
            Some(_) => Ok(status(id, SSH_FX_OK, "Success")),
            None => Ok(status(id, SSH_FX_FAILURE, "Invalid handle")),
        }
    }

    fn mkdir(&mut self, id: u32, packet: &mut Bytes) -> Result<BytesMut, MirageError> {
        let path = self.resolve(&take_path(packet)?);
        info!(path = %path, "SFTP mkdir");
        if self.fs.exists(&path) {
            return Ok(status(id, SSH_FX_FAILURE, "File exists"));
        }
        match self.fs.create_dir_all(&path) {
            Ok(()) => Ok(status(id, SSH_FX_OK, "Success")),
            Err(e) => Ok(status(id, SSH_FX_FAILURE, &e.to_string())),
        }
    }

    fn flush_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            if let OpenHandle::File {
                path,
                data,
                dirty: true,
            } = handle
            {
                info!(path = %path, size = data.len(), "SFTP upload (unclosed)");
                if let Err(e) = self.fs.write_file(&path, &data) {
                    warn!(path = %path, error = %e, "SFTP upload lost");
                }
            }
        }
    }
}
