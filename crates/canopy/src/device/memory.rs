//! Accelerator-resident storage.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Counts accelerator jobs that still use an allocation.
///
/// Host-initiated access waits until the count drops to zero, which orders it
/// after every kernel already launched against the allocation.
#[derive(Debug, Default)]
struct Fence {
    pending: Mutex<usize>,
    idle: Condvar,
}

impl Fence {
    fn acquire(&self) {
        *self.pending.lock() += 1;
    }

    fn release(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }
}

/// One accelerator allocation.
#[derive(Debug)]
pub(crate) struct DeviceMemory<T> {
    data: RwLock<Box<[T]>>,
    fence: Fence,
}

impl<T> DeviceMemory<T> {
    pub(crate) fn new(data: Box<[T]>) -> Self {
        Self {
            data: RwLock::new(data),
            fence: Fence::default(),
        }
    }

    /// Read after all in-flight jobs using this allocation finish.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Box<[T]>> {
        self.fence.wait();
        self.data.read()
    }

    /// Write after all in-flight jobs using this allocation finish.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Box<[T]>> {
        self.fence.wait();
        self.data.write()
    }

    /// Reserve the allocation for a queued job until the lease drops.
    pub(crate) fn lease(self: &Arc<Self>) -> JobLease<T> {
        self.fence.acquire();
        JobLease {
            memory: Arc::clone(self),
        }
    }
}

/// A queued job's claim on an allocation.
///
/// Host-side access blocks while any lease is alive. The job itself reads and
/// writes through the lease without waiting on its own fence.
#[derive(Debug)]
pub(crate) struct JobLease<T> {
    memory: Arc<DeviceMemory<T>>,
}

impl<T> JobLease<T> {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Box<[T]>> {
        self.memory.data.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Box<[T]>> {
        self.memory.data.write()
    }
}

impl<T> Drop for JobLease<T> {
    fn drop(&mut self) {
        self.memory.fence.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn host_read_waits_for_job() {
        let memory = Arc::new(DeviceMemory::new(vec![0u32; 4].into_boxed_slice()));
        let lease = memory.lease();

        let job = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            lease.write().fill(7);
        });

        assert_eq!(&**memory.read(), &[7, 7, 7, 7]);
        job.join().unwrap();
    }

    #[test]
    fn lease_released_when_job_panics() {
        let memory = Arc::new(DeviceMemory::new(vec![1u8; 2].into_boxed_slice()));
        let lease = memory.lease();
        let job = std::thread::spawn(move || {
            let _lease = lease;
            panic!("job failed");
        });
        assert!(job.join().is_err());
        assert_eq!(&**memory.write(), &[1, 1]);
    }
}
