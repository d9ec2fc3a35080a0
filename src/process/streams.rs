//! Stdin and merged stdout/stderr plumbing for a supervised process.

#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::pin::Pin;
#[cfg(unix)]
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
#[cfg(unix)]
use tokio::net::unix::pipe;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Bytes an `InputStream` can buffer before writes wait for the child to read.
pub const INPUT_BUFFER_SIZE: usize = 64 * 1024;

/// Lines the output stream buffers before the child's writes are held back.
pub const DEFAULT_OUTPUT_BUFFER: usize = 1024;

/// Writable handle to the child's standard input.
///
/// Bytes written before the process starts are buffered and delivered once
/// it runs. Shutting the handle down (or dropping it) closes the child's
/// stdin. After the process completes, writes fail with `BrokenPipe`.
#[derive(Debug)]
pub struct InputStream {
    inner: DuplexStream,
}

impl InputStream {
    pub(crate) fn pair() -> (Self, DuplexStream) {
        let (inner, source) = tokio::io::duplex(INPUT_BUFFER_SIZE);
        (Self { inner }, source)
    }
}

impl AsyncWrite for InputStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Copy everything the caller writes into the child's stdin, then close it.
pub(crate) async fn forward_input(mut source: DuplexStream, mut stdin: ChildStdin) {
    match tokio::io::copy(&mut source, &mut stdin).await {
        Ok(bytes) => tracing::debug!(bytes, "Input stream closed by caller"),
        Err(e) => tracing::debug!(error = %e, "Stopped forwarding input"),
    }
    if let Err(e) = stdin.shutdown().await {
        tracing::debug!(error = %e, "Failed to close child stdin");
    }
}

/// Forward-only sequence of lines the child wrote to stdout and stderr.
///
/// The sequence ends once the process has completed and its output has been
/// drained. Lines have their trailing `\n` / `\r\n` removed; invalid UTF-8 is
/// replaced lossily.
#[derive(Debug)]
pub struct OutputLines {
    inner: ReceiverStream<String>,
}

impl OutputLines {
    pub(crate) fn channel(buffer: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            tx,
            Self {
                inner: ReceiverStream::new(rx),
            },
        )
    }

    /// Wait for the next line, or `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<String> {
        self.inner.next().await
    }
}

impl Stream for OutputLines {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One pipe shared by the child's stdout and stderr.
///
/// Returns the read end plus a write end for each stream. The caller must
/// drop both `Stdio` values (including any copy a `Command` keeps) once the
/// child is spawned, or the reader never sees end-of-file.
#[cfg(unix)]
pub(crate) fn merged_output_pipe() -> std::io::Result<(pipe::Receiver, Stdio, Stdio)> {
    let (reader, writer) = std::io::pipe()?;
    let stderr = writer.try_clone()?;
    let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok((reader, Stdio::from(writer), Stdio::from(stderr)))
}

/// Reader tasks feeding an `OutputLines`, plus the sender that keeps it open.
#[derive(Debug)]
pub(crate) struct OutputPump {
    tx: mpsc::Sender<String>,
    stop: CancellationToken,
    readers: Vec<JoinHandle<()>>,
}

impl OutputPump {
    pub(crate) fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            stop: CancellationToken::new(),
            readers: Vec::with_capacity(2),
        }
    }

    /// Start a reader task for one of the child's output pipes.
    pub(crate) fn attach<R>(&mut self, reader: R, source: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tx = self.tx.clone();
        let stop = self.stop.clone();
        self.readers.push(tokio::spawn(pump_lines(reader, tx, stop, source)));
    }

    /// Give the readers `drain_timeout` to finish, then release the sequence.
    ///
    /// Readers still waiting on an idle pipe after that (for example because
    /// a grandchild inherited it) stop reading. Lines already read, and any
    /// data the pipe still holds, are still delivered to the consumer; the
    /// sequence ends when the last reader is done.
    pub(crate) async fn close(self, drain_timeout: Duration) {
        let Self { tx, stop, mut readers } = self;
        let drained = tokio::time::timeout(drain_timeout, async {
            for reader in &mut readers {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::debug!(
                timeout = ?drain_timeout,
                "Output readers still running, stopping reads on idle pipes"
            );
            stop.cancel();
        }
        drop(tx);
    }
}

async fn pump_lines<R>(
    reader: R,
    tx: mpsc::Sender<String>,
    stop: CancellationToken,
    source: &'static str,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut consumer_gone = false;

    loop {
        buf.clear();
        // Ready data always wins; `stop` only interrupts a read that would block.
        let read = tokio::select! {
            biased;
            read = reader.read_until(b'\n', &mut buf) => read,
            () = stop.cancelled() => {
                tracing::debug!(stream = source, "Stopped reading idle output pipe");
                break;
            }
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                // Keep draining without a consumer so the child never blocks on a full pipe.
                if consumer_gone {
                    continue;
                }
                if tx.send(decode_line(&buf)).await.is_err() {
                    tracing::debug!(stream = source, "Output consumer dropped");
                    consumer_gone = true;
                }
            }
            Err(e) => {
                tracing::warn!(stream = source, error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
