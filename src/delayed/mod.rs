//! Bucketed delay queue driven by a one-second ticker.
//!
//! Time is logical: a task put with delay `d` runs on the `d`-th call to
//! [`DelayedQueue::tick`]. The ring holds `window + deferred` buckets; a delay
//! longer than the ring lands in its last bucket and is re-bucketed with the
//! remainder when that bucket fires.

use crate::logger::{self, BreadcrumbFlags};
use crossbeam_channel::{select, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_WINDOW_SLOTS: usize = 60;
pub const DEFAULT_DEFERRED_SLOTS: usize = 4;
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

pub trait DelayedTask: Send + Sync {
    /// Identity used to keep at most one placement per task.
    type Key: Eq + Hash + Clone + Send;

    fn key(&self) -> Self::Key;

    fn execute(&self);

    /// Ticks until the task wants to run again; zero retires it.
    fn remaining_time(&self) -> u32;
}

struct Scheduled<T> {
    task: Arc<T>,
    /// Delay still owed after this bucket fires.
    deferred: u32,
}

struct Ring<T: DelayedTask> {
    slots: Vec<Vec<Scheduled<T>>>,
    cursor: usize,
    index: FxHashMap<T::Key, usize>,
}

impl<T: DelayedTask> Ring<T> {
    fn remove(&mut self, key: &T::Key) -> bool {
        let Some(slot) = self.index.remove(key) else {
            return false;
        };
        self.slots[slot].retain(|entry| &entry.task.key() != key);
        true
    }
}

pub struct DelayedQueue<T: DelayedTask> {
    ring: Mutex<Ring<T>>,
    capacity: usize,
}

impl<T: DelayedTask> DelayedQueue<T> {
    pub fn new(window_slots: usize, deferred_slots: usize) -> Self {
        let capacity = window_slots.saturating_add(deferred_slots).max(2);
        Self {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| Vec::new()).collect(),
                cursor: 0,
                index: FxHashMap::default(),
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.ring.lock().index.contains_key(key)
    }

    /// Schedules `task` to run after `delay` ticks, dropping any earlier
    /// placement with the same key. A zero delay runs on the next tick.
    pub fn put(&self, task: Arc<T>, delay: u32) {
        let mut ring = self.ring.lock();
        ring.remove(&task.key());
        self.place(&mut ring, task, delay);
    }

    /// Puts a task taken off the ring back, unless a `put` for its key landed
    /// while it was out.
    fn requeue(&self, task: Arc<T>, delay: u32) {
        let mut ring = self.ring.lock();
        if ring.index.contains_key(&task.key()) {
            return;
        }
        self.place(&mut ring, task, delay);
    }

    fn place(&self, ring: &mut Ring<T>, task: Arc<T>, delay: u32) {
        let offset = delay.max(1) as usize;
        let last = self.capacity - 1;
        let (offset, deferred) = if offset <= last {
            (offset, 0)
        } else {
            (last, (offset - last) as u32)
        };
        let slot = (ring.cursor + offset) % self.capacity;
        ring.index.insert(task.key(), slot);
        ring.slots[slot].push(Scheduled { task, deferred });
    }

    pub fn cancel(&self, key: &T::Key) -> bool {
        self.ring.lock().remove(key)
    }

    /// Advances one bucket and runs what is due. Tasks execute without the
    /// queue lock held. Returns the number of tasks executed.
    pub fn tick(&self) -> usize {
        let due = {
            let mut ring = self.ring.lock();
            ring.cursor = (ring.cursor + 1) % self.capacity;
            let cursor = ring.cursor;
            let due = std::mem::take(&mut ring.slots[cursor]);
            for entry in &due {
                ring.index.remove(&entry.task.key());
            }
            due
        };

        let mut executed = 0;
        for entry in due {
            if entry.deferred > 0 {
                self.requeue(entry.task, entry.deferred);
                continue;
            }
            entry.task.execute();
            executed += 1;
            let remaining = entry.task.remaining_time();
            if remaining > 0 {
                self.requeue(entry.task, remaining);
            }
        }
        executed
    }
}

impl<T: DelayedTask + 'static> DelayedQueue<T> {
    /// Starts the consumer thread. Dropping the handle stops and joins it.
    pub fn spawn_ticker(self: &Arc<Self>, period: Duration) -> io::Result<TickerHandle> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let queue = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("dns-ttl-queue".into())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(period);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            let executed = queue.tick();
                            if executed > 0 {
                                logger::breadcrumb(
                                    BreadcrumbFlags::QUEUE,
                                    format!("ttl tick executed {executed} tasks"),
                                );
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;
        Ok(TickerHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

#[derive(Debug)]
pub struct TickerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the select.
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                logger::error("ttl queue thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests;
