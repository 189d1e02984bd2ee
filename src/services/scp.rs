//! SCP (rcp protocol) over the virtual filesystem
//!
//! `scp -t` makes us the sink: the client sends `C`/`D`/`E`/`T` control
//! lines and file bodies, each acknowledged with a single `\0`. `scp -f`
//! makes us the source for one file. Uploaded files land in the virtual
//! filesystem, which may mirror them to disk.

use crate::helper::DEFAULT_BUFFER_SIZE;
use crate::os::fs::{resolve_path, VirtualFs};
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, info, warn};

/// Largest accepted upload
pub const MAX_UPLOAD_LEN: u64 = 64 * 1024 * 1024;

const ACK: u8 = 0;
const ERROR: u8 = 1;

/// Transfer direction requested by the remote `scp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpMode {
    /// `-t`: the client uploads into `target`
    Sink {
        /// Destination file or directory (absolute)
        target: String,
    },
    /// `-f`: the client downloads `path`
    Source {
        /// File to send (absolute)
        path: String,
    },
}

impl ScpMode {
    /// Parse an `scp ...` command line, resolving the path against `cwd`
    pub fn parse(command: &str, cwd: &str, home: &str) -> Option<Self> {
        let mut words = command.split_whitespace();
        if !words.next()?.ends_with("scp") {
            return None;
        }

        let mut sink = None;
        let mut path = None;
        for word in words {
            match word {
                "-t" => sink = Some(true),
                "-f" => sink = Some(false),
                "--" => {}
                flag if flag.starts_with('-') => {}
                other => path = Some(other),
            }
        }

        let path = resolve_path(cwd, home, path.unwrap_or("."));
        match sink? {
            true => Some(ScpMode::Sink { target: path }),
            false => Some(ScpMode::Source { path }),
        }
    }
}

/// Error raised inside a transfer; reported to the client as a `\x01` line
#[derive(Debug)]
struct ScpError(String);

impl From<std::io::Error> for ScpError {
    fn from(e: std::io::Error) -> Self {
        ScpError(e.to_string())
    }
}

/// One `scp` invocation bound to a channel
#[derive(Debug)]
pub struct ScpService {
    fs: Arc<dyn VirtualFs>,
    mode: ScpMode,
}

impl ScpService {
    /// Serve `mode` against `fs`
    pub fn new(fs: Arc<dyn VirtualFs>, mode: ScpMode) -> Self {
        ScpService { fs, mode }
    }

    /// Run the transfer; 0 on success, 1 on protocol or filesystem errors
    pub async fn run<S>(self, stream: S) -> i32
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, reader);

        let result = match &self.mode {
            ScpMode::Sink { target } => self.sink(&mut reader, &mut writer, target).await,
            ScpMode::Source { path } => self.source(&mut reader, &mut writer, path).await,
        };

        match result {
            Ok(()) => {
                let _ = writer.shutdown().await;
                0
            }
            Err(ScpError(message)) => {
                warn!(error = %message, "SCP transfer failed");
                let _ = writer
                    .write_all(format!("\x01scp: {}\n", message).as_bytes())
                    .await;
                let _ = writer.shutdown().await;
                1
            }
        }
    }

    async fn sink<R, W>(&self, reader: &mut R, writer: &mut W, target: &str) -> Result<(), ScpError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut dirs: Vec<String> = Vec::new();
        let base_is_dir = self.fs.is_dir(target);
        ack(writer).await?;

        loop {
            let mut line = Vec::new();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(());
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            debug!(record = %line, "SCP control record");

            let current = dirs.last().map(String::as_str).unwrap_or(target);
            match line.as_bytes().first().copied() {
                Some(b'C') => {
                    let (size, name) = parse_record(&line)?;
                    if size > MAX_UPLOAD_LEN {
                        return Err(ScpError(format!("{}: file too large", name)));
                    }
                    let dest = if !dirs.is_empty() || base_is_dir {
                        format!("{}/{}", current.trim_end_matches('/'), name)
                    } else {
                        target.to_string()
                    };
                    ack(writer).await?;

                    let mut data = vec![0u8; size as usize];
                    reader.read_exact(&mut data).await?;
                    let mut status = [0u8; 1];
                    reader.read_exact(&mut status).await?;

                    info!(path = %dest, size, "SCP upload");
                    self.fs
                        .write_file(&dest, &data)
                        .map_err(|e| ScpError(e.to_string()))?;
                    ack(writer).await?;
                }
                Some(b'D') => {
                    let (_, name) = parse_record(&line)?;
                    let dir = if !dirs.is_empty() || base_is_dir {
                        format!("{}/{}", current.trim_end_matches('/'), name)
                    } else {
                        target.to_string()
                    };
                    self.fs
                        .create_dir_all(&dir)
                        .map_err(|e| ScpError(e.to_string()))?;
                    dirs.push(dir);
                    ack(writer).await?;
                }
                Some(b'E') => {
                    dirs.pop();
                    ack(writer).await?;
                }
                Some(b'T') => ack(writer).await?,
                Some(ERROR) | Some(2) => {
                    return Err(ScpError(format!("client error: {}", &line[1..])));
                }
                _ => return Err(ScpError("protocol error".into())),
            }
        }
    }

    async fn source<R, W>(&self, reader: &mut R, writer: &mut W, path: &str) -> Result<(), ScpError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        wait_ack(reader).await?;
        let data = self
            .fs
            .read_file(path)
            .map_err(|_| ScpError(format!("{}: No such file or directory", path)))?;
        let name = path.rsplit('/').next().unwrap_or(path);

        info!(path = %path, size = data.len(), "SCP download");
        writer
            .write_all(format!("C0644 {} {}\n", data.len(), name).as_bytes())
            .await?;
        writer.flush().await?;
        wait_ack(reader).await?;

        writer.write_all(&data).await?;
        writer.write_all(&[ACK]).await?;
        writer.flush().await?;
        wait_ack(reader).await
    }
}

/// Split `Xmode size name` into size and name
fn parse_record(line: &str) -> Result<(u64, String), ScpError> {
    let mut parts = line[1..].splitn(3, ' ');
    let _mode = parts.next();
    let size = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ScpError("protocol error: bad size".into()))?;
    let name = parts
        .next()
        .filter(|n| !n.is_empty() && *n != "." && *n != ".." && !n.contains('/'))
        .ok_or_else(|| ScpError("protocol error: bad file name".into()))?;
    Ok((size, name.to_string()))
}

async fn ack<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), ScpError> {
    writer.write_all(&[ACK]).await?;
    writer.flush().await?;
    Ok(())
}

async fn wait_ack<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(), ScpError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await?;
    match byte[0] {
        ACK => Ok(()),
        _ => Err(ScpError("transfer aborted by client".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::fs::MemoryFs;
    use tokio::io::duplex;

    fn fs() -> Arc<MemoryFs> {
        Arc::new(MemoryFs::seeded("svr04", &[]))
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!(
            ScpMode::parse("scp -t /tmp", "/root", "/root"),
            Some(ScpMode::Sink {
                target: "/tmp".into()
            })
        );
        assert_eq!(
            ScpMode::parse("scp -r -d -t -- loot", "/root", "/root"),
            Some(ScpMode::Sink {
                target: "/root/loot".into()
            })
        );
        assert_eq!(
            ScpMode::parse("/usr/bin/scp -f ~/id_rsa", "/", "/root"),
            Some(ScpMode::Source {
                path: "/root/id_rsa".into()
            })
        );
        assert_eq!(ScpMode::parse("scp /tmp", "/", "/root"), None);
        assert_eq!(ScpMode::parse("ls -t", "/", "/root"), None);
    }

    #[tokio::test]
    async fn test_sink_single_file() {
        let fs = fs();
        let service = ScpService::new(
            fs.clone(),
            ScpMode::Sink {
                target: "/tmp".into(),
            },
        );
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(service.run(server));

        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], ACK);

        client.write_all(b"C0755 5 bot.sh\n").await.unwrap();
        client.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], ACK);
        client.write_all(b"echo\n\0").await.unwrap();
        client.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], ACK);
        client.shutdown().await.unwrap();

        assert_eq!(task.await.unwrap(), 0);
        assert_eq!(fs.read_file("/tmp/bot.sh").unwrap(), b"echo\n");
    }

    #[tokio::test]
    async fn test_sink_directory_records() {
        let fs = fs();
        let service = ScpService::new(
            fs.clone(),
            ScpMode::Sink {
                target: "/tmp".into(),
            },
        );
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(service.run(server));

        client
            .write_all(b"D0755 0 kit\nC0644 2 a\nhi\0E\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(task.await.unwrap(), 0);
        assert!(fs.is_dir("/tmp/kit"));
        assert_eq!(fs.read_file("/tmp/kit/a").unwrap(), b"hi");

        let mut acks = Vec::new();
        client.read_to_end(&mut acks).await.unwrap();
        assert_eq!(acks, vec![ACK; 5]);
    }

    #[tokio::test]
    async fn test_sink_protocol_error() {
        let service = ScpService::new(
            fs(),
            ScpMode::Sink {
                target: "/tmp".into(),
            },
        );
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(service.run(server));

        client.write_all(b"Xgarbage\n").await.unwrap();
        assert_eq!(task.await.unwrap(), 1);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out[0], ACK);
        assert_eq!(out[1], ERROR);
    }

    #[tokio::test]
    async fn test_source_existing_file() {
        let service = ScpService::new(
            fs(),
            ScpMode::Source {
                path: "/etc/hostname".into(),
            },
        );
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(service.run(server));

        client.write_all(&[ACK]).await.unwrap();
        let mut header = vec![0u8; "C0644 6 hostname\n".len()];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header, b"C0644 6 hostname\n");

        client.write_all(&[ACK]).await.unwrap();
        let mut body = [0u8; 7];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"svr04\n\0");
        client.write_all(&[ACK]).await.unwrap();

        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_source_missing_file() {
        let service = ScpService::new(
            fs(),
            ScpMode::Source {
                path: "/root/.ssh/id_rsa".into(),
            },
        );
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(service.run(server));

        client.write_all(&[ACK]).await.unwrap();
        assert_eq!(task.await.unwrap(), 1);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out[0], ERROR);
        assert!(String::from_utf8_lossy(&out).contains("No such file or directory"));
    }
}
