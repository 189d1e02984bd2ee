//! Line-editing pseudo-terminal
//!
//! [`LineEditor`] is a byte-at-a-time state machine producing echo bytes and
//! completed lines. [`Terminal`] drives it over an async byte stream, writes
//! prompts and command output, follows window-size updates and tees every
//! byte sent to the client into an optional session recorder.

use super::context::TermSize;
use crate::helper::to_crlf;
use crate::recording::SessionRecorder;
use std::io;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

const MAX_LINE_LENGTH: usize = 4096;

/// What a keystroke produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// Enter was pressed (Ctrl-C yields an empty line)
    Line(String),
    /// Ctrl-D on an empty line
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscapeState {
    Normal,
    GotEsc,
    GotCsi,
}

/// Byte-oriented line editor
#[derive(Debug)]
pub struct LineEditor {
    buffer: Vec<u8>,
    esc: EscapeState,
    width: u32,
    prompt_len: usize,
    after_cr: bool,
}

impl LineEditor {
    /// An editor for a terminal `width` columns wide
    pub fn new(width: u32) -> Self {
        LineEditor {
            buffer: Vec::new(),
            esc: EscapeState::Normal,
            width: width.max(1),
            prompt_len: 0,
            after_cr: false,
        }
    }

    /// Follow a window-size change
    pub fn set_width(&mut self, width: u32) {
        self.width = width.max(1);
    }

    /// Length of the prompt preceding the input, for wrap-aware erasing
    pub fn set_prompt_len(&mut self, len: usize) {
        self.prompt_len = len;
    }

    /// Bytes typed so far on the current line
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Process one input byte, returning the echo and maybe an event
    pub fn feed(&mut self, byte: u8) -> (Vec<u8>, Option<LineEvent>) {
        let after_cr = std::mem::replace(&mut self.after_cr, false);

        match self.esc {
            EscapeState::GotEsc => {
                self.esc = if byte == b'[' || byte == b'O' {
                    EscapeState::GotCsi
                } else {
                    EscapeState::Normal
                };
                return (Vec::new(), None);
            }
            EscapeState::GotCsi => {
                // parameters continue until a final byte in 0x40..=0x7e
                if (0x40..=0x7e).contains(&byte) {
                    self.esc = EscapeState::Normal;
                }
                return (Vec::new(), None);
            }
            EscapeState::Normal => {}
        }

        match byte {
            b'\n' if after_cr => (Vec::new(), None),
            b'\r' | b'\n' => {
                self.after_cr = byte == b'\r';
                let line = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                (b"\r\n".to_vec(), Some(LineEvent::Line(line)))
            }
            0x7f | 0x08 => self.erase_char(),
            0x03 => {
                self.buffer.clear();
                (b"^C\r\n".to_vec(), Some(LineEvent::Line(String::new())))
            }
            0x04 => {
                if self.buffer.is_empty() {
                    (Vec::new(), Some(LineEvent::Eof))
                } else {
                    (Vec::new(), None)
                }
            }
            0x15 => {
                let mut echo = Vec::new();
                while !self.buffer.is_empty() {
                    echo.extend(self.erase_char().0);
                }
                (echo, None)
            }
            0x1b => {
                self.esc = EscapeState::GotEsc;
                (Vec::new(), None)
            }
            b if b >= 0x20 => {
                if self.buffer.len() >= MAX_LINE_LENGTH {
                    return (vec![0x07], None);
                }
                self.buffer.push(b);
                (vec![b], None)
            }
            _ => (Vec::new(), None),
        }
    }

    fn erase_char(&mut self) -> (Vec<u8>, Option<LineEvent>) {
        if self.buffer.is_empty() {
            return (Vec::new(), None);
        }
        // drop a whole UTF-8 sequence
        while let Some(b) = self.buffer.pop() {
            if b & 0xc0 != 0x80 {
                break;
            }
        }

        let column = (self.prompt_len + char_count(&self.buffer)) % self.width as usize;
        if column == self.width as usize - 1 {
            // the erased cell is the last column of the previous row
            let w = self.width;
            (
                format!("\x1b[A\x1b[{w}G \x1b[{w}G").into_bytes(),
                None,
            )
        } else {
            (b"\x08 \x08".to_vec(), None)
        }
    }
}

fn char_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b & 0xc0 != 0x80).count()
}

/// Async terminal over a channel's byte stream
pub struct Terminal<R, W> {
    reader: R,
    writer: W,
    editor: LineEditor,
    resize: Option<watch::Receiver<TermSize>>,
    recorder: Option<Box<dyn SessionRecorder>>,
    started: Instant,
    pending: Vec<u8>,
}

impl<R, W> Terminal<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a terminal of the given size
    pub fn new(reader: R, writer: W, size: TermSize) -> Self {
        Terminal {
            reader,
            writer,
            editor: LineEditor::new(size.width),
            resize: None,
            recorder: None,
            started: Instant::now(),
            pending: Vec::new(),
        }
    }

    /// Follow window-size updates from `rx`
    pub fn with_resize(mut self, rx: watch::Receiver<TermSize>) -> Self {
        self.resize = Some(rx);
        self
    }

    /// Tee output into `recorder`
    pub fn with_recorder(mut self, recorder: Box<dyn SessionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Write bytes as-is
    pub async fn write_raw(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(self.started.elapsed(), data);
        }
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    /// Write command output, translating `\n` to `\r\n`
    pub async fn write_output(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_raw(&to_crlf(data)).await
    }

    /// Show `prompt` and read one line; `Ok(None)` means end of input
    pub async fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        self.editor.set_prompt_len(prompt.chars().count());
        self.write_raw(prompt.as_bytes()).await?;

        let mut buf = [0u8; 1024];
        loop {
            while !self.pending.is_empty() {
                let byte = self.pending.remove(0);
                let (echo, event) = self.editor.feed(byte);
                self.write_raw(&echo).await?;
                match event {
                    Some(LineEvent::Line(line)) => return Ok(Some(line)),
                    Some(LineEvent::Eof) => return Ok(None),
                    None => {}
                }
            }

            let n = match self.resize.as_mut() {
                Some(resize) => {
                    tokio::select! {
                        read = self.reader.read(&mut buf) => read?,
                        changed = resize.changed() => {
                            match changed {
                                Ok(()) => {
                                    let size = *resize.borrow_and_update();
                                    self.editor.set_width(size.width);
                                }
                                Err(_) => self.resize = None,
                            }
                            continue;
                        }
                    }
                }
                None => self.reader.read(&mut buf).await?,
            };

            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Flush the recorder; called once when the session ends
    pub fn finish(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            recorder.finish();
        }
    }
}

impl<R, W> Drop for Terminal<R, W> {
    fn drop(&mut self) {
        if let Some(mut recorder) = self.recorder.take() {
            recorder.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::duplex;

    fn feed_all(editor: &mut LineEditor, input: &[u8]) -> (Vec<u8>, Vec<LineEvent>) {
        let mut echo = Vec::new();
        let mut events = Vec::new();
        for &b in input {
            let (e, ev) = editor.feed(b);
            echo.extend(e);
            events.extend(ev);
        }
        (echo, events)
    }

    #[test]
    fn test_simple_line() {
        let mut editor = LineEditor::new(80);
        let (echo, events) = feed_all(&mut editor, b"ls -la\r");
        assert_eq!(echo, b"ls -la\r\n");
        assert_eq!(events, vec![LineEvent::Line("ls -la".into())]);
    }

    #[test]
    fn test_crlf_is_one_line() {
        let mut editor = LineEditor::new(80);
        let (_, events) = feed_all(&mut editor, b"a\r\nb\n");
        assert_eq!(
            events,
            vec![LineEvent::Line("a".into()), LineEvent::Line("b".into())]
        );
    }

    #[test]
    fn test_backspace_and_kill_line() {
        let mut editor = LineEditor::new(80);
        let (echo, events) = feed_all(&mut editor, b"lss\x7f");
        assert!(events.is_empty());
        assert!(echo.ends_with(b"\x08 \x08"));
        assert_eq!(editor.pending(), b"ls");

        feed_all(&mut editor, b"\x15");
        assert!(editor.pending().is_empty());

        // backspace on an empty line does nothing
        assert_eq!(editor.feed(0x7f), (Vec::new(), None));
    }

    #[test]
    fn test_backspace_removes_utf8_char() {
        let mut editor = LineEditor::new(80);
        feed_all(&mut editor, "hé".as_bytes());
        feed_all(&mut editor, b"\x7f");
        assert_eq!(editor.pending(), b"h");
    }

    #[test]
    fn test_backspace_across_wrap() {
        let mut editor = LineEditor::new(10);
        editor.set_prompt_len(2);
        // prompt (2) + 8 chars fills the first row exactly
        feed_all(&mut editor, b"abcdefgh");
        let (echo, _) = editor.feed(0x7f);
        assert_eq!(echo, b"\x1b[A\x1b[10G \x1b[10G");
    }

    #[test]
    fn test_ctrl_c_and_ctrl_d() {
        let mut editor = LineEditor::new(80);
        let (echo, events) = feed_all(&mut editor, b"rm -rf\x03");
        assert_eq!(events, vec![LineEvent::Line(String::new())]);
        assert!(echo.ends_with(b"^C\r\n"));

        assert_eq!(feed_all(&mut editor, b"x\x04").1, vec![]);
        feed_all(&mut editor, b"\x15");
        assert_eq!(feed_all(&mut editor, b"\x04").1, vec![LineEvent::Eof]);
    }

    #[test]
    fn test_escape_sequences_swallowed() {
        let mut editor = LineEditor::new(80);
        let (echo, events) = feed_all(&mut editor, b"\x1b[A\x1b[1;5Cok\x1bOB\r");
        assert_eq!(echo, b"ok\r\n");
        assert_eq!(events, vec![LineEvent::Line("ok".into())]);
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl SessionRecorder for Capture {
        fn record(&mut self, _elapsed: Duration, data: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(data);
        }
        fn finish(&mut self) {}
    }

    #[tokio::test]
    async fn test_terminal_read_line_and_record() {
        let (mut client, server) = duplex(1024);
        let (r, w) = tokio::io::split(server);
        let capture = Capture::default();
        let mut term = Terminal::new(r, w, TermSize::default()).with_recorder(Box::new(capture.clone()));

        client.write_all(b"whoami\rid\r").await.unwrap();
        assert_eq!(term.read_line("$ ").await.unwrap(), Some("whoami".into()));
        term.write_output(b"root\n").await.unwrap();
        assert_eq!(term.read_line("$ ").await.unwrap(), Some("id".into()));

        let mut out = vec![0u8; b"$ whoami\r\nroot\r\n$ id\r\n".len()];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(out, b"$ whoami\r\nroot\r\n$ id\r\n");
        assert_eq!(capture.0.lock().unwrap().as_slice(), out.as_slice());

        client.shutdown().await.unwrap();
        assert_eq!(term.read_line("$ ").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminal_follows_resize() {
        let (mut client, server) = duplex(1024);
        let (r, w) = tokio::io::split(server);
        let (tx, rx) = watch::channel(TermSize::default());
        let mut term = Terminal::new(r, w, TermSize::default()).with_resize(rx);

        let reader = tokio::spawn(async move {
            let line = term.read_line("").await.unwrap();
            (line, term.editor.width)
        });

        tx.send(TermSize::new(132, 43)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"x\r").await.unwrap();

        let (line, width) = reader.await.unwrap();
        assert_eq!(line, Some("x".into()));
        assert_eq!(width, 132);
    }
}
