//! Timer thread running scheduled and recurring actions.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Action = Box<dyn FnMut() + Send>;

struct Entry {
    at: Instant,
    sequence: u64,
    interval: Option<Duration>,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.sequence == other.sequence
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.sequence).cmp(&(other.at, other.sequence))
    }
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Reverse<Entry>>,
    sequence: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

/// Owns the timer thread; dropping stops it.
pub struct Alarm {
    shared: Arc<Shared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Alarm {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            condvar: Condvar::new(),
        });
        let shared_l = shared.clone();
        let handle = thread::Builder::new()
            .name("alarm".into())
            .spawn(move || run(shared_l))
            .expect("spawn alarm thread");
        Alarm {
            shared,
            handle: Some(handle),
        }
    }

    /// Runs `action` once after `delay`.
    pub fn schedule<F: FnOnce() + Send + 'static>(&self, delay: Duration, action: F) {
        let mut action = Some(action);
        self.push(delay, None, Box::new(move || {
            if let Some(f) = action.take() {
                f();
            }
        }));
    }

    /// Runs `action` every `interval`, starting one interval from now.
    pub fn recurring<F: FnMut() + Send + 'static>(&self, interval: Duration, action: F) {
        self.push(interval, Some(interval), Box::new(action));
    }

    fn push(&self, delay: Duration, interval: Option<Duration>, action: Action) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.sequence += 1;
        let sequence = state.sequence;
        state.queue.push(Reverse(Entry {
            at: Instant::now() + delay,
            sequence,
            interval,
            action,
        }));
        self.shared.condvar.notify_one();
    }

    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.shared.condvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Default for Alarm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            return;
        }
        let now = Instant::now();
        match state.queue.peek() {
            Some(Reverse(entry)) if entry.at <= now => {
                let Reverse(mut entry) = state.queue.pop().expect("peeked entry");
                drop(state);
                (entry.action)();
                state = shared.state.lock();
                if let Some(interval) = entry.interval {
                    if !state.stopped {
                        entry.at = Instant::now() + interval;
                        state.queue.push(Reverse(entry));
                    }
                }
            }
            Some(Reverse(entry)) => {
                let at = entry.at;
                shared.condvar.wait_until(&mut state, at);
            }
            None => {
                shared.condvar.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn one_shot_fires() {
        let alarm = Alarm::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_l = hits.clone();
        alarm.schedule(Duration::from_millis(10), move || {
            hits_l.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recurring_fires_repeatedly() {
        let alarm = Alarm::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits_l = hits.clone();
        alarm.recurring(Duration::from_millis(5), move || {
            hits_l.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert!(hits.load(Ordering::SeqCst) >= 3);
    }
}
