//! Reference-counted byte storage backing packets, frames and side data.
//!
//! A [`Buffer`] is either empty or a handle onto shared storage. Handles are
//! moved by default ([`Buffer::take`]); a second handle onto the same storage is
//! only created through [`Buffer::ref_buffer`]. Mutable access is refused while
//! the storage is shared, callers go through [`Buffer::make_writable`] first.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Error, Result};

struct Storage {
    data: Vec<u8>,
    pool: Option<Weak<PoolInner>>,
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|w| w.upgrade()) {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

#[derive(Default)]
pub struct Buffer {
    storage: Option<Arc<Storage>>,
}

fn try_zeroed(size: usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size).map_err(|_| Error::alloc(size))?;
    data.resize(size, 0);
    Ok(data)
}

impl Buffer {
    pub fn empty() -> Self {
        Self { storage: None }
    }

    /// Allocates `size` zeroed bytes. Allocation failure is reported, never
    /// turned into a shorter buffer.
    pub fn try_alloc(size: usize) -> Result<Self> {
        Ok(Self::from_vec(try_zeroed(size)?))
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            storage: Some(Arc::new(Storage { data, pool: None })),
        }
    }

    pub fn from_bytes(data: &Bytes) -> Self {
        Self::from_vec(data.to_vec())
    }

    pub fn copy_from_slice(data: &[u8]) -> Result<Self> {
        let mut out = Vec::new();
        out.try_reserve_exact(data.len())
            .map_err(|_| Error::alloc(data.len()))?;
        out.extend_from_slice(data);
        Ok(Self::from_vec(out))
    }

    /// New handle onto the same storage.
    pub fn ref_buffer(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }

    /// Releases this handle. Storage is freed (or returned to its pool) once
    /// the last handle goes.
    pub fn unref(&mut self) {
        self.storage = None;
    }

    /// Moves the storage out, leaving this handle empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn is_null(&self) -> bool {
        self.storage.is_none()
    }

    pub fn ref_count(&self) -> usize {
        self.storage.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    pub fn is_writable(&self) -> bool {
        self.ref_count() == 1
    }

    pub fn same_storage(&self, other: &Buffer) -> bool {
        match (&self.storage, &other.storage) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Copy-on-write: if the storage is shared, replace this handle with an
    /// exclusive copy. No-op when already exclusive or empty.
    pub fn make_writable(&mut self) -> Result<()> {
        if self.storage.is_none() || self.is_writable() {
            return Ok(());
        }
        let copy = Self::copy_from_slice(self.data())?;
        *self = copy;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        self.storage
            .as_deref()
            .map(|s| s.data.as_slice())
            .unwrap_or(&[])
    }

    /// Mutable view, refused while the storage is shared.
    pub fn data_mut(&mut self) -> Result<&mut [u8]> {
        match self.storage.as_mut() {
            None => Ok(&mut []),
            Some(storage) => Arc::get_mut(storage)
                .map(|s| s.data.as_mut_slice())
                .ok_or_else(|| {
                    Error::ContractViolation("mutable access to a shared buffer".to_string())
                }),
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows or shrinks the buffer, copying first if it is shared.
    pub fn realloc(&mut self, size: usize) -> Result<()> {
        if self.storage.is_none() {
            *self = Self::try_alloc(size)?;
            return Ok(());
        }
        self.make_writable()?;
        let storage = self
            .storage
            .as_mut()
            .and_then(Arc::get_mut)
            .ok_or_else(|| Error::InvariantBroken("buffer shared after make_writable".into()))?;
        if size > storage.data.len() {
            let extra = size - storage.data.len();
            storage
                .data
                .try_reserve_exact(extra)
                .map_err(|_| Error::alloc(size))?;
        }
        storage.data.resize(size, 0);
        // pooled storage no longer matches the pool size
        storage.pool = None;
        Ok(())
    }

    /// Points this handle at `src`'s storage, dropping the old one.
    pub fn replace(&mut self, src: &Buffer) {
        if !self.same_storage(src) {
            *self = src.ref_buffer();
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.data())
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        self.ref_buffer()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

struct PoolInner {
    size: usize,
    poison: Option<u8>,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl PoolInner {
    fn release(&self, mut data: Vec<u8>) {
        if let Some(byte) = self.poison {
            data.iter_mut().for_each(|b| *b = byte);
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.free.lock().push(data);
    }
}

/// Pool of equally sized buffers. Storage released by the last handle goes
/// back to the pool instead of the allocator.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self::build(size, None)
    }

    /// Pool that overwrites every released buffer with `byte`, so a stale
    /// read shows up as poison instead of plausible data.
    pub fn with_poison(size: usize, byte: u8) -> Self {
        Self::build(size, Some(byte))
    }

    fn build(size: usize, poison: Option<u8>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                size,
                poison,
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn get(&self) -> Result<Buffer> {
        let reused = self.inner.free.lock().pop();
        let data = match reused {
            Some(data) => data,
            None => try_zeroed(self.inner.size)?,
        };
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(Buffer {
            storage: Some(Arc::new(Storage {
                data,
                pool: Some(Arc::downgrade(&self.inner)),
            })),
        })
    }

    /// Buffers handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.inner.free.lock().len()
    }

    pub fn ptr_eq(&self, other: &BufferPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("size", &self.inner.size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
