//! Kernel pipes
//!
//! A fixed pool of unidirectional byte streams. Each pipe is a ring
//! buffer with per-endpoint open flags; a pipe slot returns to the pool
//! once both ends are closed. Reads signal EOF when the buffer is
//! drained and the write end is gone; writes into a reader-less pipe are
//! a broken pipe.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Number of pipes in the process-wide pool.
pub const PIPE_COUNT: usize = 8;

/// Byte capacity of each pipe.
pub const PIPE_CAPACITY: usize = 4096;

struct Pipe {
    buf: [u8; PIPE_CAPACITY],
    read_pos: usize,
    write_pos: usize,
    count: usize,
    read_open: bool,
    write_open: bool,
    in_use: bool,
}

impl Pipe {
    const fn new() -> Self {
        Self {
            buf: [0; PIPE_CAPACITY],
            read_pos: 0,
            write_pos: 0,
            count: 0,
            read_open: false,
            write_open: false,
            in_use: false,
        }
    }
}

static POOL: Mutex<[Pipe; PIPE_COUNT]> = Mutex::new([const { Pipe::new() }; PIPE_COUNT]);

/// Claim a free pipe; both endpoints start open.
pub fn allocate() -> KernelResult<usize> {
    let mut pool = POOL.lock();
    for (id, pipe) in pool.iter_mut().enumerate() {
        if !pipe.in_use {
            *pipe = Pipe::new();
            pipe.in_use = true;
            pipe.read_open = true;
            pipe.write_open = true;
            return Ok(id);
        }
    }
    Err(KernelError::ResourceExhausted { resource: "pipes" })
}

fn release_if_orphaned(pipe: &mut Pipe) {
    if !pipe.read_open && !pipe.write_open {
        pipe.in_use = false;
    }
}

/// Close the read end; breaks future writes.
pub fn close_read(id: usize) {
    let mut pool = POOL.lock();
    if let Some(pipe) = pool.get_mut(id) {
        pipe.read_open = false;
        release_if_orphaned(pipe);
    }
}

/// Close the write end; the reader sees EOF after draining.
pub fn close_write(id: usize) {
    let mut pool = POOL.lock();
    if let Some(pipe) = pool.get_mut(id) {
        pipe.write_open = false;
        release_if_orphaned(pipe);
    }
}

/// Read up to `buf.len()` bytes.
///
/// Returns 0 for EOF (writer closed, buffer drained) and `WouldBlock`
/// when the buffer is empty but the writer is still open; the syscall
/// layer turns that into a yield-and-retry loop.
pub fn read(id: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let mut pool = POOL.lock();
    let pipe = pool.get_mut(id).ok_or(KernelError::BrokenPipe)?;
    if !pipe.in_use || !pipe.read_open {
        return Err(KernelError::BrokenPipe);
    }
    if pipe.count == 0 {
        if !pipe.write_open {
            return Ok(0); // EOF
        }
        return Err(KernelError::WouldBlock);
    }
    let n = core::cmp::min(buf.len(), pipe.count);
    for byte in buf.iter_mut().take(n) {
        *byte = pipe.buf[pipe.read_pos];
        pipe.read_pos = (pipe.read_pos + 1) % PIPE_CAPACITY;
    }
    pipe.count -= n;
    Ok(n)
}

/// Write up to `data.len()` bytes, returning how many fit.
///
/// A full buffer yields `WouldBlock`; a closed read end is a broken
/// pipe.
pub fn write(id: usize, data: &[u8]) -> KernelResult<usize> {
    let mut pool = POOL.lock();
    let pipe = pool.get_mut(id).ok_or(KernelError::BrokenPipe)?;
    if !pipe.in_use || !pipe.write_open || !pipe.read_open {
        return Err(KernelError::BrokenPipe);
    }
    let space = PIPE_CAPACITY - pipe.count;
    if space == 0 {
        return Err(KernelError::WouldBlock);
    }
    let n = core::cmp::min(data.len(), space);
    for &byte in data.iter().take(n) {
        pipe.buf[pipe.write_pos] = byte;
        pipe.write_pos = (pipe.write_pos + 1) % PIPE_CAPACITY;
    }
    pipe.count += n;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The pool is process-wide state shared by every test in this
    // binary, so each test fully releases what it allocates.

    #[test]
    fn test_pipe_round_trip() {
        let id = allocate().unwrap();
        assert_eq!(write(id, b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(read(id, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        close_read(id);
        close_write(id);
    }

    #[test]
    fn test_pipe_eof_after_writer_close() {
        let id = allocate().unwrap();
        write(id, b"x").unwrap();
        close_write(id);
        let mut buf = [0u8; 4];
        assert_eq!(read(id, &mut buf).unwrap(), 1);
        assert_eq!(read(id, &mut buf).unwrap(), 0); // EOF
        close_read(id);
    }

    #[test]
    fn test_pipe_broken_on_reader_close() {
        let id = allocate().unwrap();
        close_read(id);
        assert!(matches!(write(id, b"x"), Err(KernelError::BrokenPipe)));
        close_write(id);
    }

    #[test]
    fn test_pipe_empty_read_would_block() {
        let id = allocate().unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(read(id, &mut buf), Err(KernelError::WouldBlock)));
        close_read(id);
        close_write(id);
    }

    #[test]
    fn test_pipe_capacity_limit() {
        let id = allocate().unwrap();
        let big = [0u8; PIPE_CAPACITY + 100];
        assert_eq!(write(id, &big).unwrap(), PIPE_CAPACITY);
        assert!(matches!(write(id, b"x"), Err(KernelError::WouldBlock)));
        let mut drain = [0u8; PIPE_CAPACITY];
        assert_eq!(read(id, &mut drain).unwrap(), PIPE_CAPACITY);
        close_read(id);
        close_write(id);
    }

    #[test]
    fn test_pipe_slot_reuse_after_both_ends_close() {
        let id = allocate().unwrap();
        close_read(id);
        close_write(id);
        let again = allocate().unwrap();
        close_read(again);
        close_write(again);
    }

    #[test]
    fn test_pipe_wraparound() {
        let id = allocate().unwrap();
        let chunk = [7u8; PIPE_CAPACITY - 10];
        assert_eq!(write(id, &chunk).unwrap(), chunk.len());
        let mut buf = [0u8; PIPE_CAPACITY];
        assert_eq!(read(id, &mut buf).unwrap(), chunk.len());
        // Ring indices have advanced close to the end; the next write
        // wraps around the buffer boundary
        let data: [u8; 64] = core::array::from_fn(|i| i as u8);
        assert_eq!(write(id, &data).unwrap(), 64);
        assert_eq!(read(id, &mut buf).unwrap(), 64);
        assert_eq!(&buf[..64], &data);
        close_read(id);
        close_write(id);
    }
}
