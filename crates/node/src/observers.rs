//! Observer lists and the callback executor.
//!
//! Observer sets are written once during startup and read on every processed
//! block, so they sit behind a read-mostly lock. Notifications are delivered
//! on a dedicated executor thread after the originating transaction has
//! committed; a handler can never deadlock against the processor.

use crate::processor::{BlockOperation, ProcessResult};
use parking_lot::RwLock;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use strand_types::{Account, Block};
use tracing::warn;

pub type BlockObserver = Box<dyn Fn(&ProcessResult, &Arc<Block>) + Send + Sync>;
pub type ForkObserver = Box<dyn Fn(bool, &Arc<Block>, &Arc<Block>) + Send + Sync>;

enum Event {
    Block(ProcessResult, Arc<Block>),
    Fork(bool, Arc<Block>, Arc<Block>),
    Stop,
}

struct Registry {
    block: RwLock<Vec<BlockObserver>>,
    fork: RwLock<Vec<ForkObserver>>,
}

/// Observer registry plus its delivery thread.
pub struct Observers {
    registry: Arc<Registry>,
    sender: mpsc::SyncSender<Event>,
    handle: parking_lot::Mutex<Option<thread::JoinHandle<()>>>,
}

impl Observers {
    /// Bound on queued notifications; overflow drops the newest event.
    const MAX_PENDING: usize = 64 * 1024;

    pub fn new() -> Self {
        let registry = Arc::new(Registry {
            block: RwLock::new(Vec::new()),
            fork: RwLock::new(Vec::new()),
        });
        let (sender, receiver) = mpsc::sync_channel::<Event>(Self::MAX_PENDING);
        let registry_l = registry.clone();
        let handle = thread::Builder::new()
            .name("observers".into())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event {
                        Event::Block(result, block) => {
                            for observer in registry_l.block.read().iter() {
                                observer(&result, &block);
                            }
                        }
                        Event::Fork(added, first, second) => {
                            for observer in registry_l.fork.read().iter() {
                                observer(added, &first, &second);
                            }
                        }
                        Event::Stop => return,
                    }
                }
            })
            .expect("spawn observers thread");
        Observers {
            registry,
            sender,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Registers a block observer. Called during startup only.
    pub fn add_block_observer(&self, observer: BlockObserver) {
        self.registry.block.write().push(observer);
    }

    /// Registers a fork observer. Called during startup only.
    pub fn add_fork_observer(&self, observer: ForkObserver) {
        self.registry.fork.write().push(observer);
    }

    pub fn notify_block(&self, result: ProcessResult, block: Arc<Block>) {
        if self.sender.try_send(Event::Block(result, block)).is_err() {
            warn!(target: "observers", "block notification dropped");
        }
    }

    pub fn notify_fork(&self, added: bool, first: Arc<Block>, second: Arc<Block>) {
        if self.sender.try_send(Event::Fork(added, first, second)).is_err() {
            warn!(target: "observers", "fork notification dropped");
        }
    }

    pub fn stop(&self) {
        let _ = self.sender.send(Event::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for Observers {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the outbound JSON callback envelope for one processed block.
pub fn callback_envelope(
    result: &ProcessResult,
    block: &Block,
    root: Option<&Account>,
) -> serde_json::Value {
    let mut value = serde_json::json!({
        "notify": "block",
        "operation": result.operation.as_str(),
        "error_code": result.code(),
        "block": block.to_json(),
    });
    if result.operation == BlockOperation::Confirm {
        value["last_confirm_height"] = result.last_confirm_height.to_string().into();
    }
    if let Some(root) = root {
        value["root"] = strand_types::address::encode(root).into();
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn delivers_on_background_thread() {
        let observers = Observers::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_l = hits.clone();
        observers.add_block_observer(Box::new(move |result, _| {
            assert_eq!(result.operation, BlockOperation::Append);
            hits_l.fetch_add(1, Ordering::SeqCst);
        }));

        let block = Arc::new(crate::test_support::sample_block());
        observers.notify_block(ProcessResult::success(BlockOperation::Append), block);

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while hits.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        observers.stop();
    }
}
