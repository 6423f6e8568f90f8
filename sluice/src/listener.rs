//! TCP listeners that feed received lines onto pipeline tapes.

use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sluice_histogram::{Granularity, Tape};
use sluice_system::ShutdownHandle;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Maximum number of lines pushed onto a tape at once.
const MAX_BATCH: usize = 1000;

/// Accepts connections on one port and pushes their lines onto the port's tapes.
///
/// Every connection is read line by line. Lines are collected into batches, which are pushed onto
/// the tapes in round-robin order. Lines longer than `max_line_length` bytes are discarded.
#[derive(Debug)]
pub struct LineListener {
    granularity: Granularity,
    port: u16,
    tapes: Vec<Arc<dyn Tape>>,
    next: AtomicUsize,
    max_line_length: usize,
}

impl LineListener {
    pub fn new(
        granularity: Granularity,
        port: u16,
        tapes: Vec<Arc<dyn Tape>>,
        max_line_length: usize,
    ) -> Self {
        Self {
            granularity,
            port,
            tapes,
            next: AtomicUsize::new(0),
            max_line_length,
        }
    }

    /// Accepts connections until shutdown is requested.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: ShutdownHandle) {
        sluice_log::info!(
            granularity = self.granularity.name(),
            "listening for {} samples on port {}",
            self.granularity,
            self.port
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tokio::spawn(self.clone().handle_connection(stream, addr, shutdown.clone()));
                    }
                    Err(error) => sluice_log::error!(
                        error = &error as &dyn Error,
                        port = self.port,
                        "failed to accept connection"
                    ),
                },
            }
        }

        sluice_log::debug!(port = self.port, "listener stopped");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: ShutdownHandle,
    ) {
        sluice_log::trace!(port = self.port, "accepted connection from {addr}");

        tokio::select! {
            biased;

            _ = shutdown.notified() => (),
            result = self.read_lines(stream) => {
                if let Err(error) = result {
                    sluice_log::debug!(
                        error = &error as &dyn Error,
                        port = self.port,
                        "connection from {addr} failed"
                    );
                }
            }
        }
    }

    /// Reads lines from `reader` until it is exhausted.
    async fn read_lines<R>(&self, reader: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut batch = Vec::new();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match read_line(&mut reader, &mut buf, self.max_line_length).await? {
                LineRead::Eof => break,
                LineRead::TooLong => {
                    sluice_log::debug!(port = self.port, "discarding line over maximum length");
                }
                LineRead::Line => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        batch.push(line.to_owned());
                    }
                }
            }

            if !batch.is_empty() && (reader.buffer().is_empty() || batch.len() >= MAX_BATCH) {
                self.push(std::mem::take(&mut batch)).await;
            }
        }

        if !batch.is_empty() {
            self.push(batch).await;
        }

        Ok(())
    }

    /// Pushes a batch onto the next tape.
    async fn push(&self, lines: Vec<String>) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.tapes.len();
        let tape = self.tapes[index].clone();
        let count = lines.len();

        match tokio::task::spawn_blocking(move || tape.push(&lines)).await {
            Ok(Ok(())) => (),
            Ok(Err(error)) => sluice_log::error!(
                error = &error as &dyn Error,
                port = self.port,
                "failed to push {count} lines onto tape"
            ),
            Err(error) => sluice_log::error!(
                error = &error as &dyn Error,
                port = self.port,
                "failed to push {count} lines onto tape"
            ),
        }
    }
}

/// Outcome of [`read_line`].
#[derive(Debug)]
enum LineRead {
    /// A line was read into the buffer.
    Line,
    /// A line exceeded the maximum length and was skipped.
    TooLong,
    /// The reader is exhausted.
    Eof,
}

/// Reads the next line into `buf` without buffering more than `max` bytes of it.
///
/// The trailing line break is not removed.
async fn read_line<R>(
    reader: &mut BufReader<R>,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<LineRead>
where
    R: AsyncRead + Unpin,
{
    let limit = max as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }

    let line_len = buf.strip_suffix(b"\n").map_or(buf.len(), <[u8]>::len);
    if line_len <= max {
        return Ok(LineRead::Line);
    }

    // Skip the remainder of the line.
    let mut ended = buf.ends_with(b"\n");
    while !ended {
        buf.clear();
        let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
        ended = read == 0 || buf.ends_with(b"\n");
    }

    Ok(LineRead::TooLong)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sluice_histogram::MemoryTape;
    use sluice_system::Controller;
    use tokio::io::AsyncWriteExt;

    use super::*;

    fn listener(tapes: &[Arc<MemoryTape>], max_line_length: usize) -> LineListener {
        let tapes = tapes
            .iter()
            .map(|tape| tape.clone() as Arc<dyn Tape>)
            .collect();
        LineListener::new(Granularity::Minute, 0, tapes, max_line_length)
    }

    fn drain(tape: &MemoryTape) -> Vec<String> {
        tape.poll(usize::MAX).unwrap()
    }

    #[tokio::test]
    async fn test_read_lines() {
        let tape = Arc::new(MemoryTape::new());
        let listener = listener(&[tape.clone()], 64);

        let input: &[u8] = b"a 1 source=x\r\n\n  \nb 2 source=x\nc 3 source=x";
        listener.read_lines(input).await.unwrap();

        assert_eq!(
            drain(&tape),
            ["a 1 source=x", "b 2 source=x", "c 3 source=x"]
        );
    }

    #[tokio::test]
    async fn test_discard_long_lines() {
        let tape = Arc::new(MemoryTape::new());
        let listener = listener(&[tape.clone()], 8);

        let input: &[u8] = b"short\nthis line is way too long\nok\n";
        listener.read_lines(input).await.unwrap();

        assert_eq!(drain(&tape), ["short", "ok"]);
    }

    #[tokio::test]
    async fn test_long_line_at_eof() {
        let tape = Arc::new(MemoryTape::new());
        let listener = listener(&[tape.clone()], 4);

        let input: &[u8] = b"ok\nunterminated";
        listener.read_lines(input).await.unwrap();

        assert_eq!(drain(&tape), ["ok"]);
    }

    #[tokio::test]
    async fn test_round_robin() {
        let first = Arc::new(MemoryTape::new());
        let second = Arc::new(MemoryTape::new());
        let listener = listener(&[first.clone(), second.clone()], 64);

        listener.push(vec!["a".to_owned()]).await;
        listener.push(vec!["b".to_owned()]).await;
        listener.push(vec!["c".to_owned()]).await;

        assert_eq!(drain(&first), ["a", "c"]);
        assert_eq!(drain(&second), ["b"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serve_tcp() {
        let tape = Arc::new(MemoryTape::new());
        let listener = Arc::new(listener(&[tape.clone()], 64));

        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let controller = Controller::new();
        let server = tokio::spawn(listener.serve(socket, controller.handle()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"a 1 source=x\nb 2 source=x\n").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        for _ in 0..100 {
            if tape.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(drain(&tape), ["a 1 source=x", "b 2 source=x"]);

        controller.shutdown(None);
        server.await.unwrap();
    }
}
