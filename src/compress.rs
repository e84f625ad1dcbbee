//! Parallel multi-member gzip compression.
//!
//! The tar stream is cut into fixed-size chunks. Each chunk is compressed
//! on the worker pool into a complete gzip member, and the coordinating
//! thread writes the members back in input order. Concatenated members
//! form a valid gzip stream that `gzip -d` and `tar xzf` read directly.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender};
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::ThreadPoolBuilder;
use tracing::{debug, trace};

use crate::error::{ArchiveError, Result};
use crate::progress::ProgressReporter;

/// Same block size pigz uses.
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

/// Largest accepted `--chunk-size`. Every in-flight chunk is buffered in
/// memory, `8 * threads` of them at most.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

pub(crate) type EncodeFn = fn(&[u8], Compression) -> io::Result<Vec<u8>>;

/// Totals for one compression run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressStats {
    pub chunks: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct ParallelGzip {
    threads: usize,
    chunk_size: usize,
    level: Compression,
    encode: EncodeFn,
}

impl ParallelGzip {
    /// Compressor at maximum level with `threads` workers.
    pub fn new(threads: usize, chunk_size: usize) -> Self {
        Self {
            threads: threads.max(1),
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
            level: Compression::best(),
            encode: gzip_member,
        }
    }

    pub(crate) fn with_encoder(mut self, encode: EncodeFn) -> Self {
        self.encode = encode;
        self
    }

    /// Runs `produce` on its own thread, feeding everything it writes
    /// through the worker pool, and writes the ordered gzip members to
    /// `output` from the calling thread.
    ///
    /// The first failure of any stage aborts the others and is returned.
    pub fn compress<F, W>(
        &self,
        produce: F,
        output: &mut W,
        progress: &ProgressReporter,
    ) -> Result<CompressStats>
    where
        F: FnOnce(&mut ChunkWriter) -> Result<()> + Send,
        W: Write,
    {
        let jobs = self.threads;
        let abort = AbortSignal::new();

        let (chunk_tx, chunk_rx) = crossbeam_channel::bounded::<Chunk>(jobs * 4);
        let (result_tx, result_rx) =
            crossbeam_channel::bounded::<anyhow::Result<Chunk>>(jobs * 4);

        let pool = ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|index| format!("gzbackup-compress-{index}"))
            .build()
            .map_err(|err| {
                ArchiveError::CompressionFailed(format!("failed to create compression pool: {err}"))
            })?;

        for _ in 0..jobs {
            let worker_rx = chunk_rx.clone();
            let worker_tx = result_tx.clone();
            let worker_abort = abort.clone();
            let level = self.level;
            let encode = self.encode;
            pool.spawn(move || compression_worker(worker_rx, worker_tx, worker_abort, level, encode));
        }

        drop(result_tx);
        drop(chunk_rx);

        debug!(
            workers = jobs,
            chunk_size = self.chunk_size,
            "compression pipeline started"
        );

        let chunk_size = self.chunk_size;
        let outcome = thread::scope(|scope| -> Result<(ProducerOutcome, Result<CompressStats>)> {
            let producer_abort = abort.clone();
            let producer_progress = progress.clone();
            let producer = thread::Builder::new()
                .name("gzbackup-tar".to_string())
                .spawn_scoped(scope, move || {
                    let mut writer =
                        ChunkWriter::new(chunk_tx, chunk_size, producer_abort.clone(), producer_progress);
                    let result = produce(&mut writer).and_then(|()| {
                        writer.flush_remaining().map_err(|err| {
                            ArchiveError::CompressionFailed(format!("failed to queue final chunk: {err}"))
                        })
                    });
                    match result {
                        Ok(()) => ProducerOutcome::Done {
                            chunks: writer.next_index,
                            bytes: writer.bytes_written,
                        },
                        Err(err) => ProducerOutcome::Failed {
                            first: producer_abort.request(),
                            err,
                        },
                    }
                })
                .map_err(|err| {
                    ArchiveError::CompressionFailed(format!("failed to spawn tar producer: {err}"))
                })?;

            let written = write_ordered(result_rx, output, &abort);

            let produced = producer
                .join()
                .map_err(|_| ArchiveError::from(anyhow!("tar producer thread panicked")))?;
            Ok((produced, written))
        });

        // Workers have all exited once the result channel closed.
        drop(pool);

        let (produced, written) = outcome?;
        let stats = match (produced, written) {
            (ProducerOutcome::Failed { first: true, err }, _) => return Err(err),
            (_, Err(err)) => return Err(err),
            (ProducerOutcome::Failed { err, .. }, Ok(_)) => return Err(err),
            (ProducerOutcome::Done { chunks, bytes }, Ok(stats)) => {
                if stats.chunks != chunks {
                    return Err(ArchiveError::CompressionFailed(format!(
                        "queued {chunks} chunks but wrote {}",
                        stats.chunks
                    )));
                }
                CompressStats {
                    bytes_in: bytes,
                    ..stats
                }
            }
        };

        if abort.is_set() {
            return Err(ArchiveError::CompressionFailed(
                "pipeline aborted due to a prior error".to_string(),
            ));
        }

        debug!(
            chunks = stats.chunks,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "compression pipeline finished"
        );
        Ok(stats)
    }
}

enum ProducerOutcome {
    Done { chunks: u64, bytes: u64 },
    Failed { first: bool, err: ArchiveError },
}

/// Compresses `data` into one self-contained gzip member.
pub(crate) fn gzip_member(data: &[u8], level: Compression) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), level);
    encoder.write_all(data)?;
    encoder.finish()
}

fn compression_worker(
    chunk_rx: Receiver<Chunk>,
    result_tx: Sender<anyhow::Result<Chunk>>,
    abort: AbortSignal,
    level: Compression,
    encode: EncodeFn,
) {
    while let Ok(Chunk { index, data }) = chunk_rx.recv() {
        if abort.is_set() {
            return;
        }

        let result = encode(&data, level).map_err(|err| {
            abort.request();
            anyhow!("chunk {index} failed to compress: {err}")
        });
        let failed = result.is_err();
        if let Ok(member) = &result {
            trace!(index, raw = data.len(), compressed = member.len(), "chunk compressed");
        }

        let sent = result_tx.send(result.map(|data| Chunk { index, data }));
        if failed || sent.is_err() {
            return;
        }
    }
}

/// Re-sequences compressed chunks and writes them to `output`.
///
/// Takes the receiver by value so an early return closes the channel and
/// unblocks any worker still sending.
fn write_ordered<W: Write>(
    result_rx: Receiver<anyhow::Result<Chunk>>,
    output: &mut W,
    abort: &AbortSignal,
) -> Result<CompressStats> {
    let mut pending = BTreeMap::<u64, Vec<u8>>::new();
    let mut stats = CompressStats::default();

    for item in result_rx {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                abort.request();
                return Err(err.into());
            }
        };

        pending.insert(chunk.index, chunk.data);

        while let Some(data) = pending.remove(&stats.chunks) {
            if let Err(err) = output.write_all(&data) {
                abort.request();
                return Err(ArchiveError::CompressionFailed(format!(
                    "failed to write compressed output: {err}"
                )));
            }
            stats.bytes_out += data.len() as u64;
            stats.chunks += 1;
        }
    }

    if !pending.is_empty() {
        abort.request();
        return Err(ArchiveError::CompressionFailed(format!(
            "pipeline terminated with {} out-of-order chunks after chunk {}",
            pending.len(),
            stats.chunks
        )));
    }

    output.flush().map_err(|err| {
        abort.request();
        ArchiveError::CompressionFailed(format!("failed to flush compressed output: {err}"))
    })?;
    Ok(stats)
}

#[derive(Clone)]
struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Sets the flag. Returns true for the caller that tripped it first.
    fn request(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

struct Chunk {
    index: u64,
    data: Vec<u8>,
}

/// `Write` sink handed to the producer. Cuts the stream into indexed
/// chunks and blocks when the worker queue is full.
pub struct ChunkWriter {
    tx: Sender<Chunk>,
    buffer: Vec<u8>,
    chunk_size: usize,
    next_index: u64,
    bytes_written: u64,
    abort: AbortSignal,
    progress: ProgressReporter,
}

impl ChunkWriter {
    fn new(
        tx: Sender<Chunk>,
        chunk_size: usize,
        abort: AbortSignal,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            next_index: 0,
            bytes_written: 0,
            abort,
            progress,
        }
    }

    fn flush_remaining(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            self.send_chunk()?;
        }
        Ok(())
    }

    /// Fails with `BrokenPipe` once any stage has aborted. The kind must
    /// not be `Interrupted`: `write_all` retries that forever.
    fn ensure_running(&self) -> io::Result<()> {
        if self.abort.is_set() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "compression aborted",
            ));
        }
        Ok(())
    }

    fn send_chunk(&mut self) -> io::Result<()> {
        self.ensure_running()?;

        let data = mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        let len = data.len() as u64;
        self.tx
            .send(Chunk {
                index: self.next_index,
                data,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "compression pipeline closed"))?;

        self.next_index += 1;
        self.bytes_written += len;
        self.progress.add_bytes(len);
        Ok(())
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_running()?;

        let mut rest = buf;
        while !rest.is_empty() {
            if self.buffer.len() == self.chunk_size {
                self.send_chunk()?;
            }
            let room = self.chunk_size - self.buffer.len();
            let (head, tail) = rest.split_at(room.min(rest.len()));
            self.buffer.extend_from_slice(head);
            rest = tail;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
