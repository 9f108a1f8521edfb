//! Command gate: serialises control-plane actions onto the engine work loop.
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Sender, bounded, unbounded};

use crate::error::AudioError;

type Action = Box<dyn FnOnce() + Send + 'static>;

/// A single work-loop thread plus the channel feeding it.
///
/// Submitted actions run one at a time in submission order. Calls made from
/// the work loop itself run inline.
pub struct CommandGate {
    tx: Option<Sender<Action>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl CommandGate {
    /// Spawn the work-loop thread.
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Action>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for action in rx.iter() {
                    action();
                }
            })?;
        let worker_id = worker.thread().id();
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            worker_id,
        })
    }

    /// Whether the caller is running on the work loop.
    pub fn on_work_loop(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Run `action` on the work loop and wait for its result.
    pub fn run_action<R, F>(&self, action: F) -> Result<R, AudioError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.on_work_loop() {
            return Ok(action());
        }
        let tx = self.tx.as_ref().ok_or(AudioError::NoDevice)?;
        let (reply_tx, reply_rx) = bounded(1);
        tx.send(Box::new(move || {
            let _ = reply_tx.send(action());
        }))
        .map_err(|_| AudioError::NoDevice)?;
        reply_rx.recv().map_err(|_| AudioError::NoDevice)
    }
}

impl Drop for CommandGate {
    fn drop(&mut self) {
        self.tx.take();
        if self.on_work_loop() {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
