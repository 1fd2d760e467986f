//! Local keyboard relay for interactive job sessions.
//!
//! Stdin is read on a dedicated OS thread since the read blocks; keys are
//! handed to the async side over a single-slot channel, so the reader stalls
//! until the session has forwarded the previous chunk.

use std::io::{self, Read};

use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// Bytes typed locally, forwarded as-is.
    Key(Vec<u8>),
    /// Local input closed. The session sends a normal close with reason `EOF`.
    Eof,
}

/// Read stdin on a background thread.
pub fn spawn_stdin_reader() -> mpsc::Receiver<InputEvent> {
    spawn_reader(io::stdin())
}

/// Read `reader` on a background thread until EOF, a read error, or the
/// receiver being dropped.
pub fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> mpsc::Receiver<InputEvent> {
    let (tx, rx) = mpsc::channel(1);
    std::thread::spawn(move || {
        let mut buf = [0u8; 1024];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(InputEvent::Key(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("stdin read failed: {e}");
                    break;
                }
            }
        }
        let _ = tx.blocking_send(InputEvent::Eof);
    });
    rx
}

/// Puts the terminal in cbreak mode (no line buffering, no local echo) and
/// restores the original settings on drop. Output processing is left on so
/// remote newlines still render.
pub struct CbreakGuard {
    original: Option<nix::sys::termios::Termios>,
}

impl CbreakGuard {
    /// No-op when stdin is not a terminal.
    pub fn enter() -> Self {
        use nix::sys::termios::{self, LocalFlags, SetArg};
        use std::io::IsTerminal;

        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Self { original: None };
        }
        let Ok(original) = termios::tcgetattr(&stdin) else {
            return Self { original: None };
        };
        let mut cbreak = original.clone();
        cbreak
            .local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO);
        if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &cbreak) {
            debug!("failed to enter cbreak mode: {e}");
            return Self { original: None };
        }
        Self {
            original: Some(original),
        }
    }

    pub fn is_active(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for CbreakGuard {
    fn drop(&mut self) {
        if let Some(ref original) = self.original {
            use nix::sys::termios;
            let _ = termios::tcsetattr(&io::stdin(), termios::SetArg::TCSANOW, original);
        }
    }
}
