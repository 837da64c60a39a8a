//! Ring-buffer pipes (`SPEC_FULL.md` §4.6.9: "a pipe inode is a pair of
//! ring buffers guarded by blocking queues").
//!
//! No heap means no boxed per-pipe allocation: a fixed `NPIPE`-sized table
//! holds every open pipe, indexed by id. Adapted from the teacher's
//! `Pipe`/`PipeInner` (byte-at-a-time copy, `nread`/`nwrite` counters that
//! only ever grow so `nwrite - nread` is always the live byte count,
//! separate read/write wait channels) down onto `wait::Blocking` instead of
//! its own `WaitChannel` + `SpinLock`, the same seam `buf.rs`/`device.rs`
//! already block through.

use crate::param::{NPIPE, PIPE_SIZE};
use crate::wait::Blocking;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PipeError {
    /// Both ends are closed and there is nothing left to read.
    BrokenPipe,
}

struct Pipe {
    data: [u8; PIPE_SIZE],
    nread: u32,
    nwrite: u32,
    read_open: bool,
    write_open: bool,
    in_use: bool,
}

impl Pipe {
    const fn empty() -> Self {
        Self {
            data: [0; PIPE_SIZE],
            nread: 0,
            nwrite: 0,
            read_open: false,
            write_open: false,
            in_use: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.nread == self.nwrite
    }

    fn is_full(&self) -> bool {
        self.nwrite - self.nread == PIPE_SIZE as u32
    }
}

pub type PipeId = u32;

/// Wait channels are derived from the pipe id: reads block on `id`, writes
/// block on `id + NPIPE`, so the two halves of the same pipe never collide
/// and neither collides with any other pipe's channels.
fn read_channel(id: PipeId) -> usize {
    id as usize
}

fn write_channel(id: PipeId) -> usize {
    id as usize + NPIPE
}

pub struct PipeTable {
    pipes: [Pipe; NPIPE],
}

impl PipeTable {
    pub fn new() -> Self {
        Self {
            pipes: array_macro::array![_ => Pipe::empty(); NPIPE],
        }
    }

    /// Allocates a fresh pipe with both ends open. `None` if the table is
    /// full.
    pub fn alloc(&mut self) -> Option<PipeId> {
        let id = (0..NPIPE as u32).find(|&i| !self.pipes[i as usize].in_use)?;
        self.pipes[id as usize] = Pipe {
            read_open: true,
            write_open: true,
            in_use: true,
            ..Pipe::empty()
        };
        Some(id)
    }

    /// Closes one end of the pipe, waking whichever side might be blocked
    /// on the other (a reader needs to see `write_open` go false to return
    /// EOF instead of blocking forever; a writer needs to see `read_open`
    /// go false to fail instead of blocking forever). Returns whether both
    /// ends are now closed, in which case the slot is freed for `alloc`.
    pub fn close(&mut self, id: PipeId, writable: bool, blocking: &mut impl Blocking) -> bool {
        let p = &mut self.pipes[id as usize];
        if writable {
            p.write_open = false;
            blocking.wake(read_channel(id));
        } else {
            p.read_open = false;
            blocking.wake(write_channel(id));
        }
        let freed = !p.read_open && !p.write_open;
        if freed {
            self.pipes[id as usize] = Pipe::empty();
        }
        freed
    }

    /// Reads up to `buf.len()` bytes. Blocks while the pipe is empty and
    /// the write end is still open; returns `Ok(0)` (EOF) once the writer
    /// has closed and nothing is left.
    pub fn read(&mut self, id: PipeId, buf: &mut [u8], blocking: &mut impl Blocking) -> Result<usize, PipeError> {
        loop {
            let p = &self.pipes[id as usize];
            if !p.is_empty() {
                break;
            }
            if !p.write_open {
                return Ok(0);
            }
            blocking.block_on(read_channel(id));
        }
        let p = &mut self.pipes[id as usize];
        let mut n = 0;
        while n < buf.len() && p.nread != p.nwrite {
            buf[n] = p.data[(p.nread as usize) % PIPE_SIZE];
            p.nread = p.nread.wrapping_add(1);
            n += 1;
        }
        blocking.wake(write_channel(id));
        Ok(n)
    }

    /// Writes `buf` in full, byte at a time, blocking whenever the ring
    /// fills up. Fails if the read end closes while bytes are still
    /// pending (nobody can ever drain them).
    pub fn write(&mut self, id: PipeId, buf: &[u8], blocking: &mut impl Blocking) -> Result<usize, PipeError> {
        let mut n = 0;
        while n < buf.len() {
            if !self.pipes[id as usize].read_open {
                return Err(PipeError::BrokenPipe);
            }
            if self.pipes[id as usize].is_full() {
                blocking.block_on(write_channel(id));
                continue;
            }
            let p = &mut self.pipes[id as usize];
            p.data[(p.nwrite as usize) % PIPE_SIZE] = buf[n];
            p.nwrite = p.nwrite.wrapping_add(1);
            n += 1;
            blocking.wake(read_channel(id));
        }
        Ok(n)
    }
}

impl Default for PipeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::NeverBlocks;

    #[test]
    fn write_then_read_round_trips_without_blocking() {
        let mut pipes = PipeTable::new();
        let mut nb = NeverBlocks;
        let id = pipes.alloc().unwrap();
        let written = pipes.write(id, b"hello", &mut nb).unwrap();
        assert_eq!(written, 5);
        let mut out = [0u8; 5];
        let read = pipes.read(id, &mut out, &mut nb).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn read_after_writer_closes_with_no_data_returns_eof() {
        let mut pipes = PipeTable::new();
        let mut nb = NeverBlocks;
        let id = pipes.alloc().unwrap();
        pipes.close(id, true, &mut nb);
        let mut out = [0u8; 4];
        assert_eq!(pipes.read(id, &mut out, &mut nb), Ok(0));
    }

    #[test]
    fn write_after_reader_closes_is_a_broken_pipe() {
        let mut pipes = PipeTable::new();
        let mut nb = NeverBlocks;
        let id = pipes.alloc().unwrap();
        pipes.close(id, false, &mut nb);
        assert_eq!(pipes.write(id, b"x", &mut nb), Err(PipeError::BrokenPipe));
    }

    #[test]
    fn closing_both_ends_frees_the_slot_for_reuse() {
        let mut pipes = PipeTable::new();
        let mut nb = NeverBlocks;
        let id = pipes.alloc().unwrap();
        assert!(!pipes.close(id, true, &mut nb));
        assert!(pipes.close(id, false, &mut nb));
        let reused = pipes.alloc().unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn partial_read_leaves_remaining_bytes_queued() {
        let mut pipes = PipeTable::new();
        let mut nb = NeverBlocks;
        let id = pipes.alloc().unwrap();
        pipes.write(id, b"abcdef", &mut nb).unwrap();
        let mut first = [0u8; 3];
        assert_eq!(pipes.read(id, &mut first, &mut nb), Ok(3));
        assert_eq!(&first, b"abc");
        let mut second = [0u8; 3];
        assert_eq!(pipes.read(id, &mut second, &mut nb), Ok(3));
        assert_eq!(&second, b"def");
    }
}
