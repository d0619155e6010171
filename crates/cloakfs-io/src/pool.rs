//! Process-wide pool of scratch buffers for block operations.
//!
//! Buffers are zeroed when they return to the pool, so freed scratch
//! space never holds plaintext. Callers own a buffer for the duration of
//! one block operation; the RAII guard releases on scope exit.

use parking_lot::Mutex;
use zeroize::Zeroize;

static POOL: Mutex<Vec<Box<[u8]>>> = Mutex::new(Vec::new());

/// A pooled scratch buffer, viewed at the requested length.
pub struct PoolBuf {
    data: Box<[u8]>,
    len: usize,
}

impl std::ops::Deref for PoolBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl std::ops::DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.data.zeroize();
        let data = std::mem::take(&mut self.data);
        POOL.lock().push(data);
    }
}

/// Take a zeroed buffer of at least `size` bytes from the pool,
/// allocating if nothing fits.
pub fn allocate(size: usize) -> PoolBuf {
    let mut pool = POOL.lock();
    let found = pool.iter().position(|b| b.len() >= size);
    let data = match found {
        Some(idx) => pool.swap_remove(idx),
        None => vec![0u8; size].into_boxed_slice(),
    };
    drop(pool);

    PoolBuf { data, len: size }
}

/// Drop every pooled buffer.
pub fn destroy_all() {
    POOL.lock().clear();
}
