//! An append-only arena of executable memory.
//!
//! Thunks are small and are never freed individually, so rather than giving each one its own
//! mapping we carve them out of larger chunks. Chunks are mapped readable, writable, and
//! executable; code is never rewritten once copied in, so patching happens in data, not here.
//! All chunks are unmapped when the arena is dropped.

use crate::compile::CompilationError;
use libc::{
    mmap, munmap, sysconf, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE,
    _SC_PAGESIZE,
};
use parking_lot::Mutex;
use std::{ffi::c_void, io, ptr};

/// The minimum size of a chunk.
const CHUNK_LEN: usize = 64 * 1024;
/// Every allocation is aligned to this many bytes.
const ALIGN: usize = 16;

#[derive(Debug)]
struct Chunk {
    /// A pointer to the beginning of the `mmap`ed chunk.
    buf: *mut u8,
    /// How many bytes were mapped?
    len: usize,
}

#[derive(Debug, Default)]
struct ArenaInner {
    chunks: Vec<Chunk>,
    /// The offset of the first free byte in the last chunk.
    off: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ExecArena {
    inner: Mutex<ArenaInner>,
}

// The raw pointers are only ever dereferenced while holding `inner`'s lock (to copy code in) or
// executed, which is safe from any thread.
unsafe impl Send for ExecArena {}
unsafe impl Sync for ExecArena {}

fn page_size() -> usize {
    usize::try_from(unsafe { sysconf(_SC_PAGESIZE) })
        .ok()
        .filter(|x| *x > 0)
        .unwrap_or(4096)
}

impl ExecArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Copy `code` into executable memory, returning a pointer to its first byte.
    pub(crate) fn alloc(&self, code: &[u8]) -> Result<*const u8, CompilationError> {
        let len = code.len().next_multiple_of(ALIGN);
        let mut lk = self.inner.lock();
        let fits = lk
            .chunks
            .last()
            .is_some_and(|c| lk.off + len <= c.len);
        if !fits {
            let chunk_len = len.max(CHUNK_LEN).next_multiple_of(page_size());
            let buf = unsafe {
                mmap(
                    ptr::null_mut(),
                    chunk_len,
                    PROT_READ | PROT_WRITE | PROT_EXEC,
                    MAP_ANON | MAP_PRIVATE,
                    -1,
                    0,
                )
            };
            if buf == MAP_FAILED {
                return Err(CompilationError::ResourceExhausted(Box::new(
                    io::Error::last_os_error(),
                )));
            }
            lk.chunks.push(Chunk {
                buf: buf as *mut u8,
                len: chunk_len,
            });
            lk.off = 0;
        }
        let off = lk.off;
        let chunk = lk
            .chunks
            .last()
            .ok_or_else(|| CompilationError::InternalError("No code chunk".into()))?;
        let p = unsafe { chunk.buf.add(off) };
        unsafe {
            p.copy_from_nonoverlapping(code.as_ptr(), code.len());
        }
        lk.off = off + len;
        Ok(p)
    }

    /// How many bytes of executable memory have been mapped?
    #[cfg(test)]
    pub(crate) fn mapped(&self) -> usize {
        self.inner.lock().chunks.iter().map(|c| c.len).sum()
    }
}

impl Drop for ExecArena {
    fn drop(&mut self) {
        for c in self.inner.get_mut().chunks.drain(..) {
            unsafe {
                munmap(c.buf as *mut c_void, c.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_contiguous() {
        let a = ExecArena::new();
        let p1 = a.alloc(&[0xc3; 3]).unwrap();
        let p2 = a.alloc(&[0x90; 20]).unwrap();
        assert_eq!(p1 as usize % ALIGN, 0);
        assert_eq!(p2 as usize - p1 as usize, 16);
        assert_eq!(unsafe { *p2.add(19) }, 0x90);
        assert_eq!(a.mapped(), CHUNK_LEN.next_multiple_of(page_size()));
    }

    #[test]
    fn large_allocations_get_their_own_chunk() {
        let a = ExecArena::new();
        a.alloc(&[0; 16]).unwrap();
        let big = vec![0xccu8; CHUNK_LEN + 1];
        let p = a.alloc(&big).unwrap();
        assert_eq!(unsafe { *p.add(CHUNK_LEN) }, 0xcc);
        assert!(a.mapped() > 2 * CHUNK_LEN);
    }
}
