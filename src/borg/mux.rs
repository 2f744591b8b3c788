//! Line multiplexing across subprocess output streams.
//!
//! One reader task per stream deposits tagged lines into a shared bounded
//! channel; the receiver side drains them as a single merged sequence. The
//! channel doubles as the buffer-plus-wakeup primitive: a reader finishing
//! drops its sender clone, and once every reader is done and the buffer is
//! empty the merged sequence ends, with no sentinel enqueued.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identity of the subprocess stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    /// The data stream (borg's stdout): plain command output.
    Primary,
    /// The structured stream (borg's stderr): line-delimited JSON events.
    Secondary,
}

/// One line read from a subprocess stream, newline stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Which stream produced the line.
    pub tag: StreamTag,
    /// The line text.
    pub text: String,
}

/// Buffer capacity of the merged line channel.
///
/// Bounded so a stalled consumer exerts the same backpressure a full pipe
/// would, instead of buffering a runaway stream in memory.
pub const LINE_BUFFER: usize = 64;

/// Attaches stream readers to a [`LineMux`].
///
/// Drop the tap once every stream is attached; the mux cannot observe
/// end-of-input while a tap is alive.
#[derive(Debug, Clone)]
pub struct LineTap {
    tx: mpsc::Sender<RawLine>,
}

impl LineTap {
    /// Spawn a reader task that drains `reader` line-by-line into the mux.
    ///
    /// The task finishes when the stream hits end-of-file or the mux side is
    /// dropped. Lines from one reader arrive in read order.
    pub fn attach<R>(&self, tag: StreamTag, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(text)) => {
                        if tx.send(RawLine { tag, text }).await.is_err() {
                            // consumer went away; stop reading
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(?tag, %error, "stream read failed");
                        break;
                    }
                }
            }
        })
    }
}

/// Merges lines from all attached stream readers into one sequence.
pub struct LineMux {
    rx: mpsc::Receiver<RawLine>,
}

impl LineMux {
    /// Create a mux and the tap used to attach readers to it.
    #[must_use]
    pub fn channel() -> (LineTap, Self) {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        (LineTap { tx }, Self { rx })
    }

    /// Drain the next line.
    ///
    /// Waits until a line is available. Returns `None` only once every
    /// attached reader has finished *and* all buffered lines were consumed.
    pub async fn recv(&mut self) -> Option<RawLine> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn merges_lines_from_both_streams() {
        let (out_rx, mut out_tx) = tokio::io::duplex(1024);
        let (err_rx, mut err_tx) = tokio::io::duplex(1024);

        let (tap, mut mux) = LineMux::channel();
        tap.attach(StreamTag::Primary, out_rx);
        tap.attach(StreamTag::Secondary, err_rx);
        drop(tap);

        tokio::spawn(async move {
            out_tx.write_all(b"a1\na2\na3\n").await.unwrap();
            drop(out_tx);
        });
        tokio::spawn(async move {
            err_tx.write_all(b"b1\nb2\n").await.unwrap();
            drop(err_tx);
        });

        let mut primary = Vec::new();
        let mut secondary = Vec::new();
        while let Some(line) = mux.recv().await {
            match line.tag {
                StreamTag::Primary => primary.push(line.text),
                StreamTag::Secondary => secondary.push(line.text),
            }
        }

        // N + M lines total, per-stream order preserved
        assert_eq!(primary, vec!["a1", "a2", "a3"]);
        assert_eq!(secondary, vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn preserves_order_within_a_stream() {
        let (rx, mut tx) = tokio::io::duplex(4096);
        let (tap, mut mux) = LineMux::channel();
        tap.attach(StreamTag::Primary, rx);
        drop(tap);

        tokio::spawn(async move {
            for i in 0..200 {
                tx.write_all(format!("line-{i}\n").as_bytes()).await.unwrap();
            }
            drop(tx);
        });

        let mut n = 0;
        while let Some(line) = mux.recv().await {
            assert_eq!(line.text, format!("line-{n}"));
            n += 1;
        }
        assert_eq!(n, 200);
    }

    #[tokio::test]
    async fn ends_only_after_all_readers_finish() {
        let (fast_rx, mut fast_tx) = tokio::io::duplex(1024);
        let (slow_rx, mut slow_tx) = tokio::io::duplex(1024);

        let (tap, mut mux) = LineMux::channel();
        tap.attach(StreamTag::Primary, fast_rx);
        tap.attach(StreamTag::Secondary, slow_rx);
        drop(tap);

        fast_tx.write_all(b"only\n").await.unwrap();
        drop(fast_tx);

        // the fast reader is long gone; the mux must keep waiting for the slow one
        assert_eq!(mux.recv().await.map(|l| l.text), Some("only".to_string()));

        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            slow_tx.write_all(b"late\n").await.unwrap();
            drop(slow_tx);
        });

        assert_eq!(mux.recv().await.map(|l| l.text), Some("late".to_string()));
        assert!(mux.recv().await.is_none());
    }

    #[tokio::test]
    async fn reads_from_mock_stream() {
        let reader = tokio_test::io::Builder::new().read(b"one\ntwo\n").build();
        let (tap, mut mux) = LineMux::channel();
        tap.attach(StreamTag::Secondary, reader);
        drop(tap);

        assert_eq!(mux.recv().await.map(|l| l.text), Some("one".to_string()));
        assert_eq!(mux.recv().await.map(|l| l.text), Some("two".to_string()));
        assert!(mux.recv().await.is_none());
    }

    #[tokio::test]
    async fn ends_immediately_with_no_readers() {
        let (tap, mut mux) = LineMux::channel();
        drop(tap);
        assert!(mux.recv().await.is_none());
    }

    #[tokio::test]
    async fn buffered_lines_survive_reader_completion() {
        let (rx, mut tx) = tokio::io::duplex(1024);
        let (tap, mut mux) = LineMux::channel();
        tap.attach(StreamTag::Secondary, rx);
        drop(tap);

        tx.write_all(b"x\ny\n").await.unwrap();
        drop(tx);

        // give the reader task time to finish before draining
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(mux.recv().await.map(|l| l.text), Some("x".to_string()));
        assert_eq!(mux.recv().await.map(|l| l.text), Some("y".to_string()));
        assert!(mux.recv().await.is_none());
    }
}
