use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use pollster::block_on;
use thiserror::Error;

use crate::gpu::GpuContext;

#[derive(Debug, Error)]
pub enum BufferPoolError {
    #[error(
        "GPU memory limit exceeded (allocation size: {size}, current usage: {usage}, limit: {limit})"
    )]
    MemoryLimitExceeded { size: u64, usage: u64, limit: u64 },
    #[error("failed to create GPU buffer of {size} bytes: {reason}")]
    AllocationFailed { size: u64, reason: String },
}

struct BufferEntry {
    buffer: wgpu::Buffer,
    size: u64,
}

/// Best-fit pool for `wgpu::Buffer` allocations organized by usage flags.
///
/// Activation buffers are released back here when the last tensor handle
/// drops, so a forward pass after the first one allocates nothing new.
/// `memory_usage` counts every byte created through the pool that has not
/// been freed by [`GpuBufferPool::clear`].
pub struct GpuBufferPool {
    context: Arc<GpuContext>,
    idle: Mutex<HashMap<wgpu::BufferUsages, Vec<BufferEntry>>>,
    total_allocated_bytes: AtomicU64,
    max_memory: Option<u64>,
}

impl GpuBufferPool {
    pub fn new(context: Arc<GpuContext>, max_memory: Option<u64>) -> Self {
        Self {
            context,
            idle: Mutex::new(HashMap::new()),
            total_allocated_bytes: AtomicU64::new(0),
            max_memory,
        }
    }

    pub fn acquire(
        &self,
        size: u64,
        usage: wgpu::BufferUsages,
        label: Option<&str>,
    ) -> Result<wgpu::Buffer, BufferPoolError> {
        if let Some(entry) = self.take_best_fit(size, usage) {
            trace!(target: "mobilenet::gpu", "reusing pooled buffer of {} bytes", entry.size);
            return Ok(entry.buffer);
        }

        if let Some(limit) = self.max_memory {
            let current = self.memory_usage();
            if current + size > limit {
                // Idle buffers are the only memory we can give back.
                self.clear();
                let current_after_clear = self.memory_usage();
                if current_after_clear + size > limit {
                    return Err(BufferPoolError::MemoryLimitExceeded {
                        size,
                        usage: current_after_clear,
                        limit,
                    });
                }
            }
        }

        let device = self.context.device();
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label,
            size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(error) = block_on(device.pop_error_scope()) {
            return Err(BufferPoolError::AllocationFailed {
                size,
                reason: error.to_string(),
            });
        }

        self.total_allocated_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(buffer)
    }

    pub fn recycle(&self, buffer: wgpu::Buffer, size: u64, usage: wgpu::BufferUsages) {
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        idle.entry(usage)
            .or_default()
            .push(BufferEntry { buffer, size });
    }

    pub fn available(&self) -> usize {
        self.idle
            .lock()
            .map(|map| map.values().map(|v| v.len()).sum())
            .unwrap_or_else(|poisoned| poisoned.into_inner().values().map(|v| v.len()).sum())
    }

    /// Returns the total size in bytes of all buffers allocated by this pool and not yet freed.
    pub fn memory_usage(&self) -> u64 {
        self.total_allocated_bytes.load(Ordering::Relaxed)
    }

    /// Configured allocation budget, if any.
    pub fn memory_limit(&self) -> Option<u64> {
        self.max_memory
    }

    /// Drops all idle buffers, freeing their memory.
    pub fn clear(&self) {
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let freed_bytes: u64 = idle
            .values()
            .flat_map(|entries| entries.iter().map(|entry| entry.size))
            .sum();
        idle.clear();
        if freed_bytes > 0 {
            debug!(target: "mobilenet::gpu", "released {freed_bytes} idle bytes from buffer pool");
        }
        self.total_allocated_bytes
            .fetch_sub(freed_bytes, Ordering::Relaxed);
    }

    fn take_best_fit(&self, size: u64, usage: wgpu::BufferUsages) -> Option<BufferEntry> {
        let mut idle = match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let buffers = idle.get_mut(&usage)?;

        let mut best_index = None;
        let mut best_size = u64::MAX;
        for (index, entry) in buffers.iter().enumerate() {
            if entry.size < size {
                continue;
            }
            if entry.size < best_size {
                best_size = entry.size;
                best_index = Some(index);
                if entry.size == size {
                    break;
                }
            }
        }

        best_index.map(|index| buffers.swap_remove(index))
    }
}

impl fmt::Debug for GpuBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBufferPool")
            .field("idle_buffers", &self.available())
            .field("memory_usage", &self.memory_usage())
            .field("max_memory", &self.max_memory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuAvailability, GpuContextOptions};

    fn test_context() -> Option<Arc<GpuContext>> {
        match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(ctx) => Some(ctx),
            _ => None,
        }
    }

    #[test]
    fn memory_limit_is_enforced_after_clearing_idle_buffers() {
        let Some(ctx) = test_context() else {
            eprintln!("Skipping GPU memory test: no GPU");
            return;
        };

        let pool = GpuBufferPool::new(ctx.clone(), Some(1024));
        assert_eq!(pool.memory_usage(), 0);

        let buf1 = pool
            .acquire(512, wgpu::BufferUsages::STORAGE, None)
            .expect("alloc 512");
        assert_eq!(pool.memory_usage(), 512);

        let result = pool.acquire(600, wgpu::BufferUsages::STORAGE, None);
        assert!(matches!(
            result,
            Err(BufferPoolError::MemoryLimitExceeded { .. })
        ));

        pool.recycle(buf1, 512, wgpu::BufferUsages::STORAGE);
        assert_eq!(pool.available(), 1);

        // The idle 512-byte buffer is too small, so the pool drops it to make room.
        let buf2 = pool
            .acquire(600, wgpu::BufferUsages::STORAGE, None)
            .expect("alloc 600 after clear");
        assert_eq!(pool.memory_usage(), 600);
        assert_eq!(pool.available(), 0);

        pool.recycle(buf2, 600, wgpu::BufferUsages::STORAGE);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_buffer() {
        let Some(ctx) = test_context() else {
            eprintln!("Skipping GPU pool test: no GPU");
            return;
        };
        let pool = GpuBufferPool::new(ctx, None);
        let usage = wgpu::BufferUsages::STORAGE;
        let big = pool.acquire(4096, usage, None).expect("big");
        let small = pool.acquire(256, usage, None).expect("small");
        pool.recycle(big, 4096, usage);
        pool.recycle(small, 256, usage);

        let reused = pool.acquire(200, usage, None).expect("reuse");
        assert_eq!(reused.size(), 256);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.memory_usage(), 4096 + 256);
    }
}
