//! Ordered composition of local file slices and upstream sub-requests
//! into one client body.
//!
//! The composer owns every segment; dropping the composite stream drops
//! all still-open segments, which closes files and aborts in-flight
//! sub-request bodies. An error from any segment ends the stream, so a
//! failed sub-request can never interleave bytes with healthy segments.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::PathBuf;

use bytes::{Buf, Bytes};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::iobuf::BoxError;

const READ_CHUNK: u64 = 64 * 1024;

pub type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;
pub type FetchFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<ByteStream, BoxError>> + Send>;

pub enum Segment {
    /// `len` bytes of a local file starting at `offset`.
    File {
        path: PathBuf,
        offset: u64,
        len: u64,
    },
    /// A lazily issued upstream sub-request. `skip` discards leading
    /// bytes, `len` caps what the client sees; with `drain` the remainder
    /// of the body is still pulled so write-through completes.
    Upstream {
        fetch: FetchFn,
        skip: u64,
        len: u64,
        drain: bool,
    },
}

enum Active {
    File {
        file: tokio::fs::File,
        remaining: u64,
    },
    Upstream {
        stream: ByteStream,
        skip: u64,
        remaining: u64,
        drain: bool,
    },
}

impl Segment {
    async fn open(self) -> Result<Active, BoxError> {
        match self {
            Segment::File { path, offset, len } => {
                let mut file = tokio::fs::File::open(&path).await.map_err(|err| {
                    BoxError::from(io::Error::new(
                        err.kind(),
                        format!("open cache segment {}: {err}", path.display()),
                    ))
                })?;
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset)).await?;
                }
                Ok(Active::File { file, remaining: len })
            }
            Segment::Upstream { fetch, skip, len, drain } => {
                let stream = fetch().await?;
                Ok(Active::Upstream {
                    stream,
                    skip,
                    remaining: len,
                    drain,
                })
            }
        }
    }
}

impl Active {
    /// Next non-empty chunk, or `None` when the segment is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, BoxError> {
        match self {
            Active::File { file, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let want = (*remaining).min(READ_CHUNK) as usize;
                let mut buf = vec![0u8; want];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Err(BoxError::from(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "cache segment shorter than recorded",
                    )));
                }
                buf.truncate(n);
                *remaining -= n as u64;
                Ok(Some(Bytes::from(buf)))
            }
            Active::Upstream {
                stream,
                skip,
                remaining,
                drain,
            } => loop {
                if *remaining == 0 {
                    if !*drain {
                        return Ok(None);
                    }
                    match stream.next().await {
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return Err(err),
                        None => return Ok(None),
                    }
                }
                match stream.next().await {
                    Some(Ok(mut bytes)) => {
                        if *skip > 0 {
                            let n = (*skip).min(bytes.len() as u64);
                            bytes.advance(n as usize);
                            *skip -= n;
                            if bytes.is_empty() {
                                continue;
                            }
                        }
                        if bytes.len() as u64 > *remaining {
                            let keep = bytes.split_to(*remaining as usize);
                            *remaining = 0;
                            return Ok(Some(keep));
                        }
                        *remaining -= bytes.len() as u64;
                        return Ok(Some(bytes));
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(BoxError::from(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "upstream segment ended early",
                        )))
                    }
                }
            },
        }
    }
}

/// Concatenate segments into one byte stream, in order.
pub fn compose(segments: Vec<Segment>) -> impl Stream<Item = Result<Bytes, BoxError>> + Send {
    struct State {
        pending: VecDeque<Segment>,
        active: Option<Active>,
    }

    let state = State {
        pending: segments.into(),
        active: None,
    };

    futures::stream::try_unfold(state, |mut st| async move {
        loop {
            if st.active.is_none() {
                match st.pending.pop_front() {
                    Some(segment) => st.active = Some(segment.open().await?),
                    None => return Ok(None),
                }
            }
            match st.active.as_mut().expect("active segment").next_chunk().await? {
                Some(bytes) => return Ok(Some((bytes, st))),
                None => {
                    st.active = None;
                    continue;
                }
            }
        }
    })
}

/// Window an existing stream: discard `skip` leading bytes, deliver at
/// most `len`, and with `drain` keep pulling the source to completion so
/// side effects (write-through) still happen.
pub fn clip(
    stream: ByteStream,
    skip: u64,
    len: u64,
    drain: bool,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send {
    let active = Active::Upstream {
        stream,
        skip,
        remaining: len,
        drain,
    };
    futures::stream::try_unfold(active, |mut active| async move {
        match active.next_chunk().await? {
            Some(bytes) => Ok(Some((bytes, active))),
            None => Ok(None),
        }
    })
}
