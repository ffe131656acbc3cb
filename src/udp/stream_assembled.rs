use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;
use crate::buffers::buffer_pool::BufferPool;
use crate::timer::TimerConsumer;
use crate::udp::udp_header::UdpHeader;

/// A received datagram's payload: a pooled buffer and the range inside it
pub struct Chunk {
    buf: Vec<u8>,
    offset: usize,
    len: usize,
}

impl Chunk {
    pub fn new(buf: Vec<u8>, offset: usize, len: usize) -> Chunk {
        debug_assert!(offset + len <= buf.len());
        Chunk {
            buf,
            offset,
            len,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf[self.offset..self.offset + self.len]
    }
}

/// Collects the chunks of one UDP stream. Chunks may arrive in any order and more than once; the
///  first copy of each chunk wins.
pub struct StreamAssembled {
    stream_id: Uuid,
    sender: SocketAddr,
    chunks: Vec<Option<Chunk>>,
    last_index: Option<usize>,
    started: Instant,
    last_seen: Instant,
    processed: bool,
}

impl StreamAssembled {
    pub fn new(stream_id: Uuid, sender: SocketAddr, now: Instant) -> StreamAssembled {
        StreamAssembled {
            stream_id,
            sender,
            chunks: Vec::new(),
            last_index: None,
            started: now,
            last_seen: now,
            processed: false,
        }
    }

    pub fn sender(&self) -> SocketAddr {
        self.sender
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Adds a chunk, returning `false` if it was discarded - as a duplicate, as inconsistent with
    ///  the stream's last chunk, or because the stream was processed already. Discarded chunks'
    ///  buffers go back to the pool.
    pub fn add_chunk(&mut self, header: &UdpHeader, chunk: Chunk, pool: &BufferPool, now: Instant) -> bool {
        let index = header.chunk_index();

        let rejection = if self.processed {
            Some("stream was processed already")
        }
        else if self.chunks.get(index).map(|c| c.is_some()).unwrap_or(false) {
            Some("duplicate chunk")
        }
        else if self.last_index.map(|last| index > last || (header.is_last() && index != last)).unwrap_or(false) {
            Some("chunk is inconsistent with the stream's last chunk")
        }
        else if header.is_last() && index + 1 < self.chunks.len() {
            Some("last chunk precedes chunks that were received already")
        }
        else {
            None
        };

        if let Some(reason) = rejection {
            trace!("stream {}: discarding chunk #{}: {}", self.stream_id, index, reason);
            pool.recycle(chunk.buf);
            return false;
        }

        if self.chunks.len() <= index {
            self.chunks.resize_with(index + 1, || None);
        }
        self.chunks[index] = Some(chunk);
        if header.is_last() {
            self.last_index = Some(index);
        }
        self.last_seen = now;
        true
    }

    /// complete iff the last chunk was received, and all chunks before it
    pub fn is_complete(&self) -> bool {
        match self.last_index {
            Some(last) => self.chunks.len() == last + 1 && self.chunks.iter().all(|c| c.is_some()),
            None => false,
        }
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    /// Returns the reassembled content and marks the stream processed. All buffers are returned
    ///  to the pool.
    pub fn take_content(&mut self, pool: &BufferPool) -> Bytes {
        let total_len = self.chunks.iter()
            .flatten()
            .map(|c| c.len)
            .sum();

        let mut result = BytesMut::with_capacity(total_len);
        for chunk in self.chunks.iter().flatten() {
            result.extend_from_slice(chunk.as_slice());
        }
        self.close(pool);
        result.freeze()
    }

    /// discards the stream, returning its buffers to the pool
    pub fn close(&mut self, pool: &BufferPool) {
        self.processed = true;
        for chunk in self.chunks.drain(..).flatten() {
            pool.recycle(chunk.buf);
        }
    }
}


/// All incomplete streams of one UDP socket, by stream id
pub struct StreamTable {
    streams: Mutex<FxHashMap<Uuid, StreamAssembled>>,
    pool: Arc<BufferPool>,
    assembly_timeout: Duration,
    max_chunks_per_stream: usize,
}

impl StreamTable {
    pub fn new(pool: Arc<BufferPool>, assembly_timeout: Duration, max_chunks_per_stream: usize) -> StreamTable {
        StreamTable {
            streams: Default::default(),
            pool,
            assembly_timeout,
            max_chunks_per_stream,
        }
    }

    /// Feeds a chunk into its stream. Returns the stream's content if this chunk completed it;
    ///  the stream is removed from the table then.
    pub fn on_chunk(&self, sender: SocketAddr, header: &UdpHeader, chunk: Chunk, now: Instant) -> Option<Bytes> {
        if header.chunk_index() >= self.max_chunks_per_stream {
            debug!("chunk #{} of stream {} from {:?} exceeds the maximum stream size - discarding", header.chunk_index(), header.stream_id, sender);
            self.pool.recycle(chunk.buf);
            return None;
        }

        let mut streams = self.streams.lock().unwrap();
        let stream = streams.entry(header.stream_id)
            .or_insert_with(|| {
                trace!("new stream {} from {:?}", header.stream_id, sender);
                StreamAssembled::new(header.stream_id, sender, now)
            });

        if stream.sender() != sender {
            debug!("chunk for stream {} from {:?}, but the stream was started by {:?} - discarding", header.stream_id, sender, stream.sender());
            self.pool.recycle(chunk.buf);
            return None;
        }

        if !stream.add_chunk(header, chunk, &self.pool, now) || !stream.is_complete() {
            return None;
        }

        let mut stream = streams.remove(&header.stream_id)?;
        drop(streams);
        Some(stream.take_content(&self.pool))
    }

    /// discards incomplete streams that received no chunk for longer than the assembly timeout
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut streams = self.streams.lock().unwrap();
        let before = streams.len();
        streams.retain(|stream_id, stream| {
            let expired = !stream.is_processed() && now.saturating_duration_since(stream.last_seen()) > self.assembly_timeout;
            if expired {
                debug!("discarding incomplete stream {} from {:?} with {} chunks", stream_id, stream.sender(), stream.num_chunks());
                stream.close(&self.pool);
            }
            !expired
        });
        before - streams.len()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// discards all streams, e.g. on shutdown
    pub fn clear(&self) {
        let mut streams = self.streams.lock().unwrap();
        for (_, mut stream) in streams.drain() {
            stream.close(&self.pool);
        }
    }
}

impl TimerConsumer for StreamTable {
    fn on_timer(&self, now: Instant) {
        self.sweep_expired(now);
    }
}
