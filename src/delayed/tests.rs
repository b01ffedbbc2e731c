use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Weak;

/// Counts executions and asks to be rescheduled from a scripted list.
struct Scripted {
    name: &'static str,
    runs: AtomicU32,
    reschedule: StdMutex<Vec<u32>>,
}

impl Scripted {
    fn new(name: &'static str, reschedule: Vec<u32>) -> Arc<Self> {
        Arc::new(Self {
            name,
            runs: AtomicU32::new(0),
            reschedule: StdMutex::new(reschedule),
        })
    }

    fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

impl DelayedTask for Scripted {
    type Key = &'static str;

    fn key(&self) -> &'static str {
        self.name
    }

    fn execute(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn remaining_time(&self) -> u32 {
        let mut next = self.reschedule.lock().unwrap();
        if next.is_empty() {
            0
        } else {
            next.remove(0)
        }
    }
}

fn tick_n<T: DelayedTask>(queue: &DelayedQueue<T>, n: usize) -> usize {
    (0..n).map(|_| queue.tick()).sum()
}

#[test]
fn task_runs_after_its_delay() {
    let queue = DelayedQueue::new(8, 2);
    let task = Scripted::new("a", vec![]);
    queue.put(Arc::clone(&task), 3);
    assert_eq!(tick_n(&queue, 2), 0);
    assert_eq!(queue.tick(), 1);
    assert_eq!(task.runs(), 1);
    assert!(queue.is_empty());
}

#[test]
fn put_replaces_existing_placement() {
    let queue = DelayedQueue::new(8, 2);
    let first = Scripted::new("host", vec![]);
    let second = Scripted::new("host", vec![]);
    queue.put(Arc::clone(&first), 2);
    queue.put(Arc::clone(&second), 5);
    assert_eq!(queue.len(), 1);
    tick_n(&queue, 5);
    assert_eq!(first.runs(), 0);
    assert_eq!(second.runs(), 1);
}

#[test]
fn positive_remaining_time_reschedules() {
    let queue = DelayedQueue::new(8, 2);
    let task = Scripted::new("r", vec![2]);
    queue.put(Arc::clone(&task), 1);
    queue.tick();
    assert_eq!(task.runs(), 1);
    assert!(queue.contains(&"r"));
    queue.tick();
    assert_eq!(task.runs(), 1);
    queue.tick();
    assert_eq!(task.runs(), 2);
    assert!(!queue.contains(&"r"));
}

#[test]
fn delay_beyond_ring_is_deferred_not_run() {
    let queue = DelayedQueue::new(4, 1);
    assert_eq!(queue.capacity(), 5);
    let task = Scripted::new("far", vec![]);
    queue.put(Arc::clone(&task), 11);
    assert_eq!(tick_n(&queue, 10), 0);
    assert_eq!(task.runs(), 0);
    assert!(queue.contains(&"far"));
    assert_eq!(queue.tick(), 1);
    assert_eq!(task.runs(), 1);
}

#[test]
fn cancel_removes_task() {
    let queue = DelayedQueue::new(8, 2);
    let task = Scripted::new("c", vec![]);
    queue.put(Arc::clone(&task), 1);
    assert!(queue.cancel(&"c"));
    assert!(!queue.cancel(&"c"));
    queue.tick();
    assert_eq!(task.runs(), 0);
}

#[test]
fn zero_delay_runs_next_tick() {
    let queue = DelayedQueue::new(8, 2);
    let task = Scripted::new("z", vec![]);
    queue.put(Arc::clone(&task), 0);
    queue.tick();
    assert_eq!(task.runs(), 1);
}

#[test]
fn ticker_thread_drives_queue_and_joins_on_drop() {
    let queue = Arc::new(DelayedQueue::new(8, 2));
    let task = Scripted::new("t", vec![]);
    queue.put(Arc::clone(&task), 1);
    let handle = queue.spawn_ticker(Duration::from_millis(10)).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while task.runs() == 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    drop(handle);
    assert_eq!(task.runs(), 1);
    assert_eq!(Arc::strong_count(&queue), 1);
}

/// Renews its own key from inside `execute` while asking to run again.
struct Renewing {
    queue: Weak<DelayedQueue<Renewing>>,
    runs: Arc<AtomicU32>,
    renew_delay: u32,
    remaining: u32,
}

impl DelayedTask for Renewing {
    type Key = &'static str;

    fn key(&self) -> &'static str {
        "renewed.test"
    }

    fn execute(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(queue) = self.queue.upgrade() {
            let fresh = Renewing {
                queue: Weak::new(),
                runs: Arc::clone(&self.runs),
                renew_delay: 0,
                remaining: 0,
            };
            queue.put(Arc::new(fresh), self.renew_delay);
        }
    }

    fn remaining_time(&self) -> u32 {
        self.remaining
    }
}

#[test]
fn put_during_tick_wins_over_reschedule() {
    let queue = Arc::new(DelayedQueue::new(8, 2));
    let runs = Arc::new(AtomicU32::new(0));
    let stale = Renewing {
        queue: Arc::downgrade(&queue),
        runs: Arc::clone(&runs),
        renew_delay: 2,
        remaining: 5,
    };
    queue.put(Arc::new(stale), 1);

    assert_eq!(queue.tick(), 1);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.tick(), 0);
    assert_eq!(queue.tick(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());
    assert_eq!(tick_n(&*queue, 6), 0);
}

#[test]
fn deferred_entry_yields_to_newer_put() {
    let queue = DelayedQueue::new(4, 1);
    let far = Scripted::new("host", vec![]);
    let near = Scripted::new("host", vec![]);
    queue.put(Arc::clone(&far), 11);
    assert_eq!(tick_n(&queue, 4), 0);
    queue.put(Arc::clone(&near), 3);
    assert_eq!(tick_n(&queue, 3), 1);
    assert_eq!(near.runs(), 1);
    assert_eq!(tick_n(&queue, 10), 0);
    assert_eq!(far.runs(), 0);
}
