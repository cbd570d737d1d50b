//! Execution streams.
//!
//! A [`Stream`] orders accelerator work. Jobs submitted to one stream run one
//! after another in submission order on a dedicated worker; jobs on different
//! streams may overlap. The default stream is synchronous: work submitted to it
//! runs on the caller's thread before the call returns.
//!
//! Streams own neither forests nor buffers. Queued jobs hold shared handles to
//! whatever they use until they finish.

use super::Device;
use crate::error::{Error, UnsupportedDeviceError};

#[cfg(feature = "accelerator")]
use self::worker::Worker;

/// Ordering context for accelerator launches.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    #[cfg(feature = "accelerator")]
    worker: Option<std::sync::Arc<Worker>>,
}

impl Stream {
    /// The synchronous (null) stream.
    pub fn synchronous() -> Self {
        Self::default()
    }

    /// A stream for `device`.
    ///
    /// Host streams are synchronous. Accelerator streams get their own ordered
    /// worker, or fail with [`UnsupportedDeviceError`] in host-only builds.
    pub fn new(device: Device) -> Result<Self, UnsupportedDeviceError> {
        match device {
            Device::Host => Ok(Self::synchronous()),
            Device::Accelerator => Self::asynchronous(),
        }
    }

    #[cfg(feature = "accelerator")]
    fn asynchronous() -> Result<Self, UnsupportedDeviceError> {
        super::require_accelerator("create an accelerator stream")?;
        Ok(Self {
            worker: Some(std::sync::Arc::new(Worker::spawn())),
        })
    }

    #[cfg(not(feature = "accelerator"))]
    fn asynchronous() -> Result<Self, UnsupportedDeviceError> {
        super::require_accelerator("create an accelerator stream")?;
        Ok(Self::synchronous())
    }

    /// Whether submitted work may still be running after submission returns.
    #[cfg(feature = "accelerator")]
    pub fn is_asynchronous(&self) -> bool {
        self.worker.is_some()
    }

    /// Whether submitted work may still be running after submission returns.
    #[cfg(not(feature = "accelerator"))]
    pub fn is_asynchronous(&self) -> bool {
        false
    }

    /// Block until every job submitted so far has finished.
    ///
    /// Returns the first error raised by a job since the previous call.
    pub fn synchronize(&self) -> Result<(), Error> {
        #[cfg(feature = "accelerator")]
        if let Some(worker) = &self.worker {
            return worker.synchronize();
        }
        Ok(())
    }

    /// Run `job` in stream order: queued on an asynchronous stream, inline
    /// otherwise.
    #[cfg(feature = "accelerator")]
    pub(crate) fn submit<F>(&self, job: F) -> Result<(), Error>
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        match &self.worker {
            Some(worker) => {
                worker.enqueue(Box::new(job));
                Ok(())
            }
            None => job(),
        }
    }
}

#[cfg(feature = "accelerator")]
mod worker {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    use parking_lot::{Condvar, Mutex};

    use crate::error::Error;

    pub(super) type Job = Box<dyn FnOnce() -> Result<(), Error> + Send + 'static>;

    #[derive(Debug, Default)]
    struct Status {
        pending: usize,
        error: Option<Error>,
    }

    #[derive(Debug, Default)]
    struct Shared {
        status: Mutex<Status>,
        idle: Condvar,
    }

    impl Shared {
        fn finish(&self, result: Result<(), Error>) {
            let mut status = self.status.lock();
            status.pending -= 1;
            if let Err(err) = result {
                tracing::warn!(error = %err, "stream job failed");
                status.error.get_or_insert(err);
            }
            if status.pending == 0 {
                self.idle.notify_all();
            }
        }
    }

    /// Dedicated thread executing jobs in submission order.
    #[derive(Debug)]
    pub(super) struct Worker {
        sender: Mutex<Option<mpsc::Sender<Job>>>,
        shared: std::sync::Arc<Shared>,
        thread: Mutex<Option<JoinHandle<()>>>,
    }

    impl Worker {
        pub(super) fn spawn() -> Self {
            let (sender, receiver) = mpsc::channel::<Job>();
            let shared = std::sync::Arc::new(Shared::default());
            let worker_shared = std::sync::Arc::clone(&shared);

            let thread = std::thread::Builder::new()
                .name("canopy-stream".into())
                .spawn(move || {
                    for job in receiver {
                        let result = catch_unwind(AssertUnwindSafe(job))
                            .unwrap_or_else(|panic| Err(Error::KernelFault(panic_message(&*panic))));
                        worker_shared.finish(result);
                    }
                })
                .ok();
            if thread.is_none() {
                tracing::warn!("failed to spawn stream worker; jobs will run inline");
            }

            Self {
                sender: Mutex::new(thread.as_ref().map(|_| sender)),
                shared,
                thread: Mutex::new(thread),
            }
        }

        pub(super) fn enqueue(&self, job: Job) {
            self.shared.status.lock().pending += 1;
            let rejected = match self.sender.lock().as_ref() {
                Some(sender) => sender.send(job).err().map(|e| e.0),
                None => Some(job),
            };
            if let Some(job) = rejected {
                let result = catch_unwind(AssertUnwindSafe(job))
                    .unwrap_or_else(|panic| Err(Error::KernelFault(panic_message(&*panic))));
                self.shared.finish(result);
            }
        }

        pub(super) fn synchronize(&self) -> Result<(), Error> {
            let mut status = self.shared.status.lock();
            while status.pending > 0 {
                self.shared.idle.wait(&mut status);
            }
            status.error.take().map_or(Ok(()), Err)
        }
    }

    impl Drop for Worker {
        fn drop(&mut self) {
            // Closing the channel lets the worker drain its queue and exit.
            self.sender.lock().take();
            if let Some(thread) = self.thread.lock().take() {
                let _ = thread.join();
            }
        }
    }

    fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
        if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "job panicked".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_stream_is_synchronous() {
        let stream = Stream::new(Device::Host).unwrap();
        assert!(!stream.is_asynchronous());
        assert_eq!(stream.synchronize(), Ok(()));
    }

    #[cfg(feature = "accelerator")]
    #[test]
    fn jobs_run_in_submission_order() {
        use std::sync::{Arc, Mutex};

        let stream = Stream::new(Device::Accelerator).unwrap();
        assert!(stream.is_asynchronous());

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream
                .submit(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[cfg(feature = "accelerator")]
    #[test]
    fn first_error_reported_once() {
        let stream = Stream::new(Device::Accelerator).unwrap();
        stream.submit(|| Err(Error::KernelFault("first".into()))).unwrap();
        stream.submit(|| Err(Error::KernelFault("second".into()))).unwrap();
        assert_eq!(stream.synchronize(), Err(Error::KernelFault("first".into())));
        assert_eq!(stream.synchronize(), Ok(()));
    }

    #[cfg(feature = "accelerator")]
    #[test]
    fn panicking_job_becomes_fault() {
        let stream = Stream::new(Device::Accelerator).unwrap();
        stream.submit(|| panic!("boom")).unwrap();
        assert_eq!(stream.synchronize(), Err(Error::KernelFault("boom".into())));
    }

    #[cfg(not(feature = "accelerator"))]
    #[test]
    fn accelerator_stream_unsupported() {
        let err = Stream::new(Device::Accelerator).unwrap_err();
        assert_eq!(err.operation(), "create an accelerator stream");
    }
}
