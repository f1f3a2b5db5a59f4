//! Adapts a piped child-process stream into a newline-delimited
//! channel of owned lines, read by a dedicated background task so the
//! producer (the OS pipe) and the consumer (readiness logic) never
//! share a buffer directly.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// A lazily-consumed, finite stream of lines.
///
/// Closes (further `recv` calls return `None`) once the underlying
/// reader hits EOF or a read error. A `LineStream` built from `None`
/// is closed from the start — this is how a command with no stdout
/// or stderr pipe configured still gets a well-behaved stream.
pub struct LineStream {
    rx: Option<mpsc::Receiver<String>>,
}

impl LineStream {
    pub fn new<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(reader) = reader else {
            return Self { rx: None };
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(mut line)) => {
                        line.push('\n');
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        Self { rx: Some(rx) }
    }

    /// Receive the next line, or `None` once the stream has closed.
    pub async fn recv(&mut self) -> Option<String> {
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

/// Drain a stream to completion and return its full contents.
pub async fn read_all(mut stream: LineStream) -> String {
    let mut buf = String::new();
    while let Some(line) = stream.recv().await {
        buf.push_str(&line);
    }
    buf
}
