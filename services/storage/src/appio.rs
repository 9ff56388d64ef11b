//! AppIO worker.
//!
//! A single thread that runs result handling and user callbacks, so
//! neither ever executes on the kernel's delivery context.

use std::io;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::Sender;
use spin::Mutex;

type Task = Box<dyn FnOnce() + Send>;

pub struct AppIo {
    queue: Mutex<Option<Sender<Task>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl AppIo {
    pub fn start() -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();

        let worker = thread::Builder::new()
            .name("fs-appio".into())
            .spawn(move || {
                for task in receiver.iter() {
                    task();
                }
                log::debug!("appio: worker exiting");
            })?;

        Ok(Self {
            queue: Mutex::new(Some(sender)),
            thread_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues `task` to run on the worker. Returns false once the worker
    /// has shut down.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match self.queue.lock().as_ref() {
            Some(queue) => queue.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// True when called from the worker itself.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for AppIo {
    fn drop(&mut self) {
        self.queue.lock().take();

        if let Some(worker) = self.worker.lock().take() {
            // The last owner may be a task running on the worker.
            if !self.is_current() && worker.join().is_err() {
                log::error!("appio: worker panicked");
            }
        }
    }
}
