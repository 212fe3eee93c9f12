//! Block assembly over a streamed upstream body.
//!
//! The sink slices an incoming byte stream into fixed-size blocks and
//! hands every completed block to a callback; the driver's callback is
//! what persists slice files and flips bitmap bits. Downstream reads pull
//! the stream, so the client's read rate throttles disk writes.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::Stream;
use http_body_util::BodyExt;

use crate::iobuf::BoxError;

/// `(block bytes, block index, absolute end position, eof)`.
pub type BlockFn = Box<dyn FnMut(&[u8], u32, u64, bool) -> io::Result<()> + Send>;
pub type ErrorFn = Box<dyn FnMut(&io::Error) + Send>;
pub type CloseFn = Box<dyn FnOnce(bool) + Send>;

pub struct BlockSink {
    block_size: u64,
    pos: u64,
    skipping: bool,
    buf: Vec<u8>,
    on_block: BlockFn,
}

impl BlockSink {
    /// `start_at` is the absolute byte offset the stream begins at. A
    /// start inside a block discards bytes up to the next boundary, so
    /// only whole blocks are ever assembled.
    pub fn new(block_size: u64, start_at: u64, on_block: BlockFn) -> Self {
        assert!(block_size > 0);
        Self {
            block_size,
            pos: start_at,
            skipping: start_at % block_size != 0,
            buf: Vec::with_capacity(block_size as usize),
            on_block,
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let within = (self.pos % self.block_size) as usize;
            let room = self.block_size as usize - within;
            if self.skipping {
                if within != 0 {
                    let n = room.min(rest.len());
                    self.pos += n as u64;
                    rest = &rest[n..];
                    continue;
                }
                self.skipping = false;
                continue;
            }
            if self.buf.len() == self.block_size as usize {
                self.emit(false)?;
            }
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            self.pos += take as u64;
            rest = &rest[take..];
        }
        Ok(())
    }

    /// Flush the trailing block, full or partial, with `eof = true`.
    pub fn finish(&mut self) -> io::Result<()> {
        self.emit(true)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn emit(&mut self, eof: bool) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let index = ((self.pos - self.buf.len() as u64) / self.block_size) as u32;
        (self.on_block)(&self.buf, index, self.pos, eof)?;
        self.buf.clear();
        Ok(())
    }
}

/// Fires the close callback exactly once, with the EOF flag observed at
/// the time the body finished or was dropped mid-stream.
pub struct CloseGuard {
    cb: Option<CloseFn>,
    eof: bool,
}

impl CloseGuard {
    pub fn new(cb: CloseFn) -> Self {
        Self { cb: Some(cb), eof: false }
    }

    pub fn fire(&mut self, eof: bool) {
        if let Some(cb) = self.cb.take() {
            cb(eof);
        }
        self.eof = eof;
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.take() {
            cb(self.eof);
        }
    }
}

/// Wrap an upstream body: every frame is fed to the sink and forwarded
/// downstream unchanged. A callback error is sticky and poisons the
/// stream; the close callback still runs with the observed EOF flag.
pub fn save_block_stream<B>(
    body: B,
    sink: BlockSink,
    on_error: ErrorFn,
    on_close: CloseFn,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send
where
    B: http_body::Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    struct State<B> {
        body: B,
        sink: BlockSink,
        on_error: ErrorFn,
        guard: CloseGuard,
    }

    let state = State {
        body,
        sink,
        on_error,
        guard: CloseGuard::new(on_close),
    };

    futures::stream::try_unfold(state, |mut st| async move {
        loop {
            match st.body.frame().await {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue; // trailers
                    };
                    if data.is_empty() {
                        continue;
                    }
                    if let Err(err) = st.sink.feed(&data) {
                        (st.on_error)(&err);
                        return Err(BoxError::from(err));
                    }
                    return Ok(Some((data, st)));
                }
                Some(Err(err)) => {
                    let err: BoxError = err.into();
                    let io_err = io::Error::new(io::ErrorKind::Other, err.to_string());
                    (st.on_error)(&io_err);
                    return Err(err);
                }
                None => {
                    if let Err(err) = st.sink.finish() {
                        (st.on_error)(&err);
                        st.guard.fire(true);
                        return Err(BoxError::from(err));
                    }
                    st.guard.fire(true);
                    return Ok(None);
                }
            }
        }
    })
}

/// Asynchronous variant of the per-block callback: blocks are copied onto
/// a bounded queue drained by a dedicated writer thread, so the reader
/// path is only charged with the memcpy. The writer's first error becomes
/// sticky and is re-surfaced on the next block and on `finish`.
pub struct AsyncBlockWriter {
    tx: Option<std::sync::mpsc::SyncSender<Job>>,
    err: Arc<Mutex<Option<(io::ErrorKind, String)>>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

struct Job {
    data: Vec<u8>,
    index: u32,
    pos: u64,
    eof: bool,
}

impl AsyncBlockWriter {
    pub fn spawn(capacity: usize, mut inner: BlockFn) -> Self {
        let (tx, rx) = std::sync::mpsc::sync_channel::<Job>(capacity.max(1));
        let err = Arc::new(Mutex::new(None));
        let err_slot = Arc::clone(&err);
        let handle = std::thread::spawn(move || {
            for job in rx {
                if err_slot.lock().expect("block writer").is_some() {
                    continue; // drain after failure
                }
                if let Err(e) = inner(&job.data, job.index, job.pos, job.eof) {
                    *err_slot.lock().expect("block writer") = Some((e.kind(), e.to_string()));
                }
            }
        });
        Self {
            tx: Some(tx),
            err,
            handle: Some(handle),
        }
    }

    pub fn block_fn(&self) -> BlockFn {
        let tx = self.tx.as_ref().expect("writer running").clone();
        let err = Arc::clone(&self.err);
        Box::new(move |buf, index, pos, eof| {
            if let Some((kind, msg)) = err.lock().expect("block writer").as_ref() {
                return Err(io::Error::new(*kind, msg.clone()));
            }
            tx.send(Job {
                data: buf.to_vec(),
                index,
                pos,
                eof,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "block writer gone"))
        })
    }

    /// Close the queue, wait for the writer to drain and report its
    /// sticky error, if any. Must run before metadata is promoted.
    pub fn finish(mut self) -> io::Result<()> {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        match self.err.lock().expect("block writer").take() {
            Some((kind, msg)) => Err(io::Error::new(kind, msg)),
            None => Ok(()),
        }
    }
}

impl Drop for AsyncBlockWriter {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_sink(block_size: u64, start: u64) -> (BlockSink, Arc<Mutex<Vec<(u32, Vec<u8>, bool)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        let sink = BlockSink::new(
            block_size,
            start,
            Box::new(move |buf, idx, _pos, eof| {
                out.lock().unwrap().push((idx, buf.to_vec(), eof));
                Ok(())
            }),
        );
        (sink, seen)
    }

    #[test]
    fn reassembles_exact_input_in_order() {
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let (mut sink, seen) = collecting_sink(4096, 0);
        // feed in ragged pieces to exercise buffering boundaries
        for piece in body.chunks(977) {
            sink.feed(piece).unwrap();
        }
        sink.finish().unwrap();

        let seen = seen.lock().unwrap();
        let mut rebuilt = Vec::new();
        for (i, (idx, data, eof)) in seen.iter().enumerate() {
            assert_eq!(*idx as usize, i);
            assert_eq!(*eof, i + 1 == seen.len());
            if i + 1 < seen.len() {
                assert_eq!(data.len(), 4096);
            }
            rebuilt.extend_from_slice(data);
        }
        assert_eq!(rebuilt, body);
    }

    #[test]
    fn partial_last_block_flushes_on_eof() {
        let (mut sink, seen) = collecting_sink(10, 0);
        sink.feed(&[1u8; 25]).unwrap();
        sink.finish().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2].1.len(), 5);
        assert!(seen[2].2);
    }

    #[test]
    fn unaligned_start_skips_to_boundary() {
        // stream starts at absolute offset 5 with block size 10: bytes
        // 5..10 are discarded, block 1 is the first complete one.
        let (mut sink, seen) = collecting_sink(10, 5);
        sink.feed(&[9u8; 25]).unwrap(); // covers offsets 5..30
        sink.finish().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[0].1.len(), 10);
        assert_eq!(seen[1].0, 2);
    }

    #[test]
    fn aligned_start_uses_absolute_indices() {
        let (mut sink, seen) = collecting_sink(10, 30);
        sink.feed(&[7u8; 20]).unwrap();
        sink.finish().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, 3);
        assert_eq!(seen[1].0, 4);
    }

    #[test]
    fn callback_error_is_returned() {
        let mut sink = BlockSink::new(
            4,
            0,
            Box::new(|_, _, _, _| Err(io::Error::new(io::ErrorKind::Other, "disk full"))),
        );
        assert!(sink.feed(&[0u8; 8]).is_err());
    }

    #[test]
    fn async_writer_surfaces_error_on_finish() {
        let writer = AsyncBlockWriter::spawn(
            2,
            Box::new(|_, idx, _, _| {
                if idx == 1 {
                    Err(io::Error::new(io::ErrorKind::Other, "boom"))
                } else {
                    Ok(())
                }
            }),
        );
        let mut f = writer.block_fn();
        f(&[0u8; 4], 0, 4, false).unwrap();
        f(&[0u8; 4], 1, 8, false).unwrap();
        assert!(writer.finish().is_err());
    }
}
