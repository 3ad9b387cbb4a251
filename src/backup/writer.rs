//! Streaming gzip compression with progress accounting.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

/// Log a progress line every time this many compressed bytes were written.
const LOG_PROGRESS_EVERY: u64 = 64 * 1024 * 1024;

/// Observes the progress of a dump.
pub trait ProgressObserver: Send {
    /// Sets the expected total, or `None` if it's unknown.
    fn set_total(&mut self, total: Option<u64>);

    /// Advances the progress by `n` bytes.
    fn inc(&mut self, n: u64);

    /// Marks the progress as done.
    fn finish(&mut self);
}

/// [ProgressObserver] reporting through the log.
#[derive(Debug)]
pub struct LogProgress {
    label: String,
    total: Option<u64>,
    current: u64,
    next_log: u64,
}

impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            total: None,
            current: 0,
            next_log: LOG_PROGRESS_EVERY,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }
}

impl ProgressObserver for LogProgress {
    fn set_total(&mut self, total: Option<u64>) {
        self.total = total;
        if let Some(total) = total {
            log::debug!(target: "backup::progress", "{}: estimated size {}", self.label, format_size(total));
        }
    }

    fn inc(&mut self, n: u64) {
        self.current += n;
        if self.current >= self.next_log {
            self.next_log = self.current + LOG_PROGRESS_EVERY;
            match self.total {
                Some(total) => log::debug!(
                    target: "backup::progress",
                    "{}: {} compressed (estimated {} uncompressed)",
                    self.label,
                    format_size(self.current),
                    format_size(total)
                ),
                None => log::debug!(target: "backup::progress", "{}: {} compressed", self.label, format_size(self.current)),
            }
        }
    }

    fn finish(&mut self) {
        self.total = Some(self.current);
        log::trace!(target: "backup::progress", "{}: done, {} compressed", self.label, format_size(self.current));
    }
}

fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Forwards writes to `inner` and counts them.
#[derive(Debug)]
pub struct ProgressWriter<W, P> {
    inner: W,
    progress: P,
    written: u64,
}

impl<W: Write, P: ProgressObserver> ProgressWriter<W, P> {
    pub fn new(inner: W, progress: P) -> Self {
        Self {
            inner,
            progress,
            written: 0,
        }
    }
}

impl<W: Write, P: ProgressObserver> Write for ProgressWriter<W, P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        self.progress.inc(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Gzip compresses everything written to it into `W`.
///
/// The compressed stream is only complete after [finish](Self::finish):
/// dropping the writer loses the gzip trailer.
#[derive(Debug)]
pub struct CompressingWriter<W: Write, P: ProgressObserver> {
    encoder: GzEncoder<ProgressWriter<W, P>>,
}

impl<W: Write, P: ProgressObserver> CompressingWriter<W, P> {
    pub fn new(sink: W, progress: P) -> Self {
        let progress_writer = ProgressWriter::new(sink, progress);
        Self {
            encoder: GzEncoder::new(progress_writer, Compression::default()),
        }
    }

    /// Bytes of compressed output written so far.
    pub fn compressed_len(&self) -> u64 {
        self.encoder.get_ref().written
    }

    /// Finalizes the gzip stream and returns the sink with the compressed length.
    pub fn finish(self) -> io::Result<(W, u64)> {
        let mut progress_writer = self.encoder.finish()?;
        progress_writer.flush()?;
        progress_writer.progress.finish();

        let ProgressWriter { inner, written, .. } = progress_writer;
        Ok((inner, written))
    }
}

impl<W: Write, P: ProgressObserver> Write for CompressingWriter<W, P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use flate2::read::GzDecoder;

    use super::*;

    /// Progress shared with the test.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct SharedProgress {
        pub(crate) current: Arc<AtomicU64>,
        pub(crate) done: Arc<AtomicBool>,
    }

    impl ProgressObserver for SharedProgress {
        fn set_total(&mut self, _total: Option<u64>) {}

        fn inc(&mut self, n: u64) {
            self.current.fetch_add(n, Ordering::SeqCst);
        }

        fn finish(&mut self) {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    /// Sink failing once `capacity` bytes were written.
    struct FullSink {
        capacity: usize,
    }

    impl Write for FullSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.len() > self.capacity {
                return Err(io::Error::other("sink is full"));
            }
            self.capacity -= buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample_dump() -> Vec<u8> {
        (0..20_000)
            .map(|i| format!("INSERT INTO t VALUES ({i}, 'row {i}');\n"))
            .collect::<String>()
            .into_bytes()
    }

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut plain = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut plain).unwrap();
        plain
    }

    #[test]
    fn should_decompress_to_original_bytes() {
        let dump = sample_dump();

        for _ in 0..2 {
            let mut writer = CompressingWriter::new(Vec::new(), SharedProgress::default());
            for chunk in dump.chunks(4096) {
                writer.write_all(chunk).unwrap();
            }
            let (compressed, len) = writer.finish().unwrap();

            assert_eq!(len, compressed.len() as u64);
            assert!(compressed.len() < dump.len());
            assert_eq!(gunzip(&compressed), dump);
        }
    }

    #[test]
    fn should_count_compressed_bytes() {
        let progress = SharedProgress::default();
        let mut writer = CompressingWriter::new(Vec::new(), progress.clone());
        writer.write_all(&sample_dump()).unwrap();
        assert!(!progress.done.load(Ordering::SeqCst));

        let (compressed, _) = writer.finish().unwrap();
        assert_eq!(
            progress.current.load(Ordering::SeqCst),
            compressed.len() as u64
        );
        assert!(progress.done.load(Ordering::SeqCst));
    }

    #[test]
    fn should_produce_valid_stream_for_empty_input() {
        let writer = CompressingWriter::new(Vec::new(), SharedProgress::default());
        let (compressed, len) = writer.finish().unwrap();
        assert!(len > 0);
        assert!(gunzip(&compressed).is_empty());
    }

    #[test]
    fn should_propagate_sink_errors() {
        let mut writer = CompressingWriter::new(FullSink { capacity: 16 }, SharedProgress::default());
        let write_res = writer.write_all(&sample_dump());
        let res = write_res.and_then(|_| writer.finish().map(|_| ()));
        assert_eq!(res.unwrap_err().to_string(), "sink is full");
    }

    #[test]
    fn should_track_log_progress() {
        let mut progress = LogProgress::new("a/orders");
        progress.set_total(Some(1000));
        progress.inc(LOG_PROGRESS_EVERY + 1);
        progress.finish();
        assert_eq!(progress.current(), LOG_PROGRESS_EVERY + 1);
    }
}
