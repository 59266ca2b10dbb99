//! The resource pool tests draw CPU cores and accelerator devices from.
//!
//! A take/return handle idiom: `try_obtain` hands back a [`ResourceHandle`]
//! carrying the specific ids it reserved, and `release`-ing it returns them
//! to the free list.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ResourceError;
use crate::model::{ResourceAttrs, ResourceRequest};

/// Issues a fresh generation id to every [`ResourcePool`] created, so a
/// handle can be checked against the exact pool instance that issued it.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// A CPU core / accelerator device pool with a single oversubscription
/// escape hatch: when the pool is otherwise idle, one test requesting more
/// than the pool's total capacity is allowed to run alone rather than being
/// rejected outright.
#[derive(Debug)]
pub struct ResourcePool {
    total_cores: u32,
    total_devices: u32,
    free_cores: Vec<u32>,
    free_devices: Vec<u32>,
    allow_oversubscription: bool,
    /// Number of handles currently checked out; used to tell "pool idle" for
    /// the oversubscription rule.
    outstanding: u32,
    generation: u64,
}

/// A reservation of specific core/device ids, released back to the pool it
/// came from via [`ResourcePool::release`]. Not `Clone`: a handle must be
/// released exactly once.
#[derive(Debug)]
pub struct ResourceHandle {
    pub attrs: ResourceAttrs,
    oversubscribed: bool,
    generation: u64,
}

impl ResourcePool {
    pub fn new(total_cores: u32, total_devices: u32, allow_oversubscription: bool) -> Self {
        Self {
            total_cores,
            total_devices,
            free_cores: (0..total_cores).collect(),
            free_devices: (0..total_devices).collect(),
            allow_oversubscription,
            outstanding: 0,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn total_cores(&self) -> u32 {
        self.total_cores
    }

    pub fn total_devices(&self) -> u32 {
        self.total_devices
    }

    pub fn available_cores(&self) -> u32 {
        self.free_cores.len() as u32
    }

    pub fn available_devices(&self) -> u32 {
        self.free_devices.len() as u32
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding == 0
    }

    /// Whether `request` could ever be satisfied by this pool, with or
    /// without the oversubscription escape hatch.
    pub fn can_ever_satisfy(&self, request: ResourceRequest) -> bool {
        if request.cores <= self.total_cores && request.devices <= self.total_devices {
            return true;
        }
        self.allow_oversubscription
    }

    /// Try to reserve `request` now. Returns `Ok(None)` if the request can't
    /// be satisfied right now but could later (the caller should keep it
    /// queued), and an error if the pool can never satisfy it even with
    /// oversubscription.
    pub fn try_obtain(
        &mut self,
        request: ResourceRequest,
    ) -> Result<Option<ResourceHandle>, ResourceError> {
        if request.cores <= self.free_cores.len() as u32
            && request.devices <= self.free_devices.len() as u32
        {
            let cpu_ids = self.free_cores.split_off(self.free_cores.len() - request.cores as usize);
            let device_ids =
                self.free_devices.split_off(self.free_devices.len() - request.devices as usize);
            self.outstanding += 1;
            return Ok(Some(ResourceHandle {
                attrs: ResourceAttrs {
                    total_cpus: request.cores,
                    cpu_ids,
                    total_devices: request.devices,
                    device_ids,
                },
                oversubscribed: false,
                generation: self.generation,
            }));
        }

        if self.is_idle()
            && self.allow_oversubscription
            && (request.cores > self.total_cores || request.devices > self.total_devices)
        {
            self.outstanding += 1;
            return Ok(Some(ResourceHandle {
                attrs: ResourceAttrs {
                    total_cpus: request.cores,
                    cpu_ids: (0..request.cores).collect(),
                    total_devices: request.devices,
                    device_ids: (0..request.devices).collect(),
                },
                oversubscribed: true,
                generation: self.generation,
            }));
        }

        if !self.can_ever_satisfy(request) {
            return Err(ResourceError::Insufficient {
                requested_cores: request.cores,
                requested_devices: request.devices,
                available_cores: self.total_cores,
                available_devices: self.total_devices,
            });
        }

        Ok(None)
    }

    /// Idempotent against a stale handle: releasing a handle from a
    /// different pool generation, or releasing into an already-empty pool,
    /// is a programmer error reported as [`ResourceError::DoubleRelease`]
    /// rather than silently corrupting the free lists.
    pub fn release(&mut self, handle: ResourceHandle) -> Result<(), ResourceError> {
        if handle.generation != self.generation || self.outstanding == 0 {
            tracing::error!("resource handle released twice or from a stale pool generation");
            return Err(ResourceError::DoubleRelease);
        }
        self.outstanding -= 1;
        if !handle.oversubscribed {
            self.free_cores.extend(handle.attrs.cpu_ids);
            self.free_devices.extend(handle.attrs.device_ids);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_and_release_roundtrip() {
        let mut pool = ResourcePool::new(4, 0, true);
        let handle = pool.try_obtain(ResourceRequest { cores: 2, devices: 0 }).unwrap().unwrap();
        assert_eq!(pool.available_cores(), 2);
        pool.release(handle).unwrap();
        assert_eq!(pool.available_cores(), 4);
    }

    #[test]
    fn release_from_a_different_pool_generation_is_rejected() {
        let mut pool_a = ResourcePool::new(4, 0, true);
        let pool_b = ResourcePool::new(4, 0, true);
        let handle = pool_a.try_obtain(ResourceRequest { cores: 2, devices: 0 }).unwrap().unwrap();
        let mut pool_b = pool_b;
        assert!(matches!(pool_b.release(handle), Err(ResourceError::DoubleRelease)));
    }

    #[test]
    fn release_into_an_already_empty_pool_is_rejected() {
        let mut pool = ResourcePool::new(4, 0, true);
        let handle = pool.try_obtain(ResourceRequest { cores: 2, devices: 0 }).unwrap().unwrap();
        pool.release(handle).unwrap();
        let stray = ResourceHandle {
            attrs: ResourceAttrs {
                total_cpus: 0,
                cpu_ids: vec![],
                total_devices: 0,
                device_ids: vec![],
            },
            oversubscribed: false,
            generation: pool.generation,
        };
        assert!(matches!(pool.release(stray), Err(ResourceError::DoubleRelease)));
    }

    #[test]
    fn request_exceeding_total_waits_without_oversubscription_when_busy() {
        let mut pool = ResourcePool::new(4, 0, true);
        let _h1 = pool.try_obtain(ResourceRequest { cores: 1, devices: 0 }).unwrap().unwrap();
        let result = pool.try_obtain(ResourceRequest { cores: 8, devices: 0 }).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn oversubscription_allowed_when_idle() {
        let mut pool = ResourcePool::new(4, 0, true);
        let handle = pool.try_obtain(ResourceRequest { cores: 8, devices: 0 }).unwrap();
        assert!(handle.is_some());
    }

    #[test]
    fn oversubscription_disabled_rejects_outright() {
        let mut pool = ResourcePool::new(4, 0, false);
        let result = pool.try_obtain(ResourceRequest { cores: 8, devices: 0 });
        assert!(result.is_err());
    }
}
