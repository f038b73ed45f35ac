//! An in-process byte pipe between two threads.
//!
//! The pipe buffers a queue of immutable [`Bytes`] chunks. Writing a
//! `Bytes` value never copies it: as long as the pipe has any free space
//! the whole chunk is queued, even if that takes the pipe past its soft
//! capacity. Only the *next* write is held back until readers catch up.
//! [`Pipe::write_slice`] copies and so honours the capacity exactly.
//!
//! Read and write ends block independently. A non-blocking end returns
//! `Ok(None)` where a blocking end would wait; a blocking end waits at
//! most the pipe's timeout and then fails with [`Error::Timeout`].
//!
//! ```text
//!   writer ──write()──▶ [chunk][chunk][chunk] ──read()──▶ reader
//!                        ◀──── buffered ────▶
//!                        ◀──────── max (soft) ─────────▶
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sync::event::SyncEvent;

/// Default soft capacity of a pipe and read size used by `read_all`.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

#[derive(Debug)]
struct PipeState {
    buffer: VecDeque<Bytes>,
    /// Unread bytes across all chunks.
    buffered: usize,
    eof: bool,
    closed: bool,
    read_blocking: bool,
    write_blocking: bool,
    read_flag: Option<Arc<SyncEvent>>,
}

impl PipeState {
    fn capacity(&self, max: usize) -> usize {
        max.saturating_sub(self.buffered)
    }

    fn flag_reader(&self) {
        if let Some(flag) = &self.read_flag {
            flag.set();
        }
    }

    fn take(&mut self, nbytes: usize) -> Option<Bytes> {
        let mut chunk = self.buffer.pop_front()?;
        if chunk.len() > nbytes {
            let head = chunk.split_to(nbytes);
            self.buffer.push_front(chunk);
            chunk = head;
        }
        self.buffered -= chunk.len();
        Some(chunk)
    }

    fn take_all(&mut self) -> Bytes {
        self.consolidate();
        self.buffered = 0;
        self.buffer.pop_front().unwrap_or_default()
    }

    fn consolidate(&mut self) {
        if self.buffer.len() > 1 {
            let mut all = BytesMut::with_capacity(self.buffered);
            for chunk in self.buffer.drain(..) {
                all.extend_from_slice(&chunk);
            }
            self.buffer.push_back(all.freeze());
        }
    }
}

/// Builder for [`Pipe`].
#[derive(Debug, Clone)]
pub struct PipeBuilder {
    name: Option<String>,
    max: usize,
    read_blocking: bool,
    write_blocking: bool,
    timeout: Option<Duration>,
}

impl Default for PipeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeBuilder {
    /// Both ends blocking, no timeout, [`DEFAULT_BUFFER_SIZE`] capacity.
    pub fn new() -> Self {
        Self {
            name: None,
            max: DEFAULT_BUFFER_SIZE,
            read_blocking: true,
            write_blocking: true,
            timeout: None,
        }
    }

    /// Name used in log messages.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Soft capacity in bytes.
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn read_blocking(mut self, blocking: bool) -> Self {
        self.read_blocking = blocking;
        self
    }

    pub fn write_blocking(mut self, blocking: bool) -> Self {
        self.write_blocking = blocking;
        self
    }

    /// Upper bound on any single blocked read or write.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Pipe {
        Pipe {
            name: self.name.unwrap_or_else(|| "pipe".to_string()),
            max: self.max,
            timeout: self.timeout,
            state: Mutex::new(PipeState {
                buffer: VecDeque::new(),
                buffered: 0,
                eof: false,
                closed: false,
                read_blocking: self.read_blocking,
                write_blocking: self.write_blocking,
                read_flag: None,
            }),
            cond: Condvar::new(),
        }
    }
}

/// Thread-safe buffered byte stream with a soft capacity.
#[derive(Debug)]
pub struct Pipe {
    name: String,
    max: usize,
    timeout: Option<Duration>,
    state: Mutex<PipeState>,
    cond: Condvar,
}

impl Pipe {
    pub fn builder() -> PipeBuilder {
        PipeBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout.map(|timeout| Instant::now() + timeout)
    }

    /// Waits once on the condition variable, failing if `deadline` passed.
    fn block<'a>(
        &self,
        state: MutexGuard<'a, PipeState>,
        deadline: Option<Instant>,
        op: &str,
    ) -> Result<MutexGuard<'a, PipeState>> {
        debug!(pipe = %self.name, op, "pipe waiting");
        match deadline {
            None => Ok(self
                .cond
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner())),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    warn!(pipe = %self.name, op, "pipe timed out");
                    return Err(Error::Timeout);
                }
                let (state, _) = self
                    .cond
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                Ok(state)
            }
        }
    }

    pub fn set_read_blocking(&self, blocking: bool) {
        self.lock().read_blocking = blocking;
    }

    pub fn set_write_blocking(&self, blocking: bool) {
        self.lock().write_blocking = blocking;
    }

    /// Discards any unread data, marks EOF and wakes all waiters.
    pub fn close(&self) {
        debug!(pipe = %self.name, "pipe close");
        let mut state = self.lock();
        if state.buffered > 0 {
            warn!(
                pipe = %self.name,
                discarded = state.buffered,
                "pipe closed with unread data"
            );
        }
        state.buffer.clear();
        state.buffered = 0;
        state.eof = true;
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Marks the write side finished. Readers drain the buffer and then
    /// see end of stream.
    pub fn write_eof(&self) {
        let mut state = self.lock();
        state.eof = true;
        self.cond.notify_all();
    }

    /// True if the buffer holds no unread data.
    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    /// Number of unread bytes.
    pub fn buffered(&self) -> usize {
        self.lock().buffered
    }

    /// Number of bytes the next write is guaranteed to accept.
    ///
    /// A result of 0 also clears the read flag: there is no point waking a
    /// writer until a reader has made room.
    pub fn can_write(&self) -> Result<usize> {
        let state = self.lock();
        if state.eof {
            return Err(Error::BrokenPipe);
        }
        let wlen = state.capacity(self.max);
        if wlen == 0 {
            if let Some(flag) = &state.read_flag {
                flag.clear();
            }
        }
        Ok(wlen)
    }

    /// True if the next read will not block: data is buffered, or EOF has
    /// been written.
    pub fn can_read(&self) -> bool {
        let state = self.lock();
        !state.buffer.is_empty() || state.eof
    }

    /// Registers a flag that is set every time a read is attempted.
    ///
    /// If the pipe is already closed no reader will ever arrive, so the flag
    /// is set straight away.
    pub fn set_read_flag(&self, flag: Arc<SyncEvent>) {
        let mut state = self.lock();
        if state.closed {
            flag.set();
        }
        state.read_flag = Some(flag);
    }

    fn wait_for(
        &self,
        timeout: Option<Duration>,
        op: &str,
        ready: impl Fn(&PipeState) -> Result<bool>,
    ) -> Result<()> {
        let deadline = self.deadline(timeout);
        let mut state = self.lock();
        while !ready(&*state)? {
            state = self.block(state, deadline, op)?;
        }
        Ok(())
    }

    /// Waits until a write would accept data.
    pub fn write_wait(&self, timeout: Option<Duration>) -> Result<()> {
        let max = self.max;
        self.wait_for(timeout, "write_wait", |state| {
            if state.eof {
                Err(Error::BrokenPipe)
            } else {
                Ok(state.capacity(max) > 0)
            }
        })
    }

    /// Waits until a read would not block.
    pub fn read_wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_for(timeout, "read_wait", |state| {
            Ok(!state.buffer.is_empty() || state.eof)
        })
    }

    /// Waits until all buffered data has been read.
    pub fn flush_wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_for(timeout, "flush_wait", |state| Ok(state.buffer.is_empty()))
    }

    /// Blocks until a reader has taken everything buffered.
    ///
    /// The timeout restarts whenever the reader makes progress, so only a
    /// stalled reader makes this fail. A non-blocking write end fails at
    /// once with [`Error::WouldBlock`] while data is still buffered.
    pub fn flush(&self) -> Result<()> {
        let mut deadline = self.deadline(self.timeout);
        let mut state = self.lock();
        let mut remaining = state.buffered;
        while !state.buffer.is_empty() {
            if !state.write_blocking {
                return Err(Error::WouldBlock);
            }
            if state.buffered < remaining {
                remaining = state.buffered;
                deadline = self.deadline(self.timeout);
            }
            state = self.block(state, deadline, "flush")?;
        }
        Ok(())
    }

    /// Waits for write space, honouring the write-blocking mode.
    fn writable(&self) -> Result<Option<(MutexGuard<'_, PipeState>, usize)>> {
        let deadline = self.deadline(self.timeout);
        let mut state = self.lock();
        loop {
            if state.eof {
                return Err(Error::BrokenPipe);
            }
            let wlen = state.capacity(self.max);
            if wlen > 0 {
                return Ok(Some((state, wlen)));
            }
            if !state.write_blocking {
                return Ok(None);
            }
            state = self.block(state, deadline, "write")?;
        }
    }

    /// Queues `data` without copying it.
    ///
    /// Returns the number of bytes accepted, which is always all of them,
    /// or `None` if the pipe is full and the write end is non-blocking.
    pub fn write(&self, data: Bytes) -> Result<Option<usize>> {
        let Some((mut state, _)) = self.writable()? else {
            return Ok(None);
        };
        let nbytes = data.len();
        if nbytes > 0 {
            state.buffer.push_back(data);
            state.buffered += nbytes;
            self.cond.notify_all();
        }
        Ok(Some(nbytes))
    }

    /// Copies at most the remaining capacity from `data`.
    pub fn write_slice(&self, data: &[u8]) -> Result<Option<usize>> {
        let Some((mut state, wlen)) = self.writable()? else {
            return Ok(None);
        };
        let nbytes = data.len().min(wlen);
        if nbytes > 0 {
            state.buffer.push_back(Bytes::copy_from_slice(&data[..nbytes]));
            state.buffered += nbytes;
            self.cond.notify_all();
        }
        Ok(Some(nbytes))
    }

    fn read_inner(&self, nbytes: usize, force_blocking: bool) -> Result<Option<Bytes>> {
        let deadline = self.deadline(self.timeout);
        let mut state = self.lock();
        state.flag_reader();
        loop {
            if nbytes == 0 && !state.buffer.is_empty() {
                return Ok(Some(Bytes::new()));
            }
            if let Some(chunk) = state.take(nbytes) {
                self.cond.notify_all();
                return Ok(Some(chunk));
            }
            if state.eof {
                return Ok(Some(Bytes::new()));
            }
            if !(state.read_blocking || force_blocking) {
                return Ok(None);
            }
            state = self.block(state, deadline, "read")?;
        }
    }

    /// Reads between 1 and `nbytes` bytes.
    ///
    /// An empty result means end of stream, except for a zero-length read,
    /// which waits like any other read but takes nothing. `None` is only returned by a
    /// non-blocking read end when there is nothing to read yet.
    pub fn read(&self, nbytes: usize) -> Result<Option<Bytes>> {
        self.read_inner(nbytes, false)
    }

    /// Reads everything up to EOF.
    ///
    /// Always blocks, whatever the read-blocking mode: asking for the whole
    /// stream means waiting for it.
    pub fn read_all(&self) -> Result<Bytes> {
        let mut data = BytesMut::new();
        loop {
            match self.read_inner(DEFAULT_BUFFER_SIZE, true)? {
                Some(chunk) if chunk.is_empty() => return Ok(data.freeze()),
                Some(chunk) => data.extend_from_slice(&chunk),
                None => continue,
            }
        }
    }

    /// Reads up to and including the first occurrence of `delimiter`.
    ///
    /// At EOF without a match, whatever remains is returned (possibly
    /// empty). Fails with [`Error::NoBufferSpace`] if the buffer is full
    /// and holds no match, since none can ever arrive.
    pub fn read_until(&self, delimiter: &[u8]) -> Result<Option<Bytes>> {
        if delimiter.is_empty() {
            return Ok(Some(Bytes::new()));
        }
        let deadline = self.deadline(self.timeout);
        let mut state = self.lock();
        loop {
            let mut found = state.buffer.front().and_then(|chunk| find(chunk, delimiter));
            if found.is_none() && state.buffer.len() > 1 {
                state.consolidate();
                found = state.buffer.front().and_then(|chunk| find(chunk, delimiter));
            }
            if let Some(pos) = found {
                let result = state.take(pos + delimiter.len()).unwrap_or_default();
                state.flag_reader();
                self.cond.notify_all();
                return Ok(Some(result));
            }
            if state.eof {
                let rest = state.take_all();
                self.cond.notify_all();
                return Ok(Some(rest));
            }
            if state.capacity(self.max) == 0 {
                return Err(Error::NoBufferSpace);
            }
            state.flag_reader();
            if !state.read_blocking {
                return Ok(None);
            }
            state = self.block(state, deadline, "read_until")?;
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
