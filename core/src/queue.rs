//! Four-level priority message queue (spec.md §4.2, §8). Messages enter at one of four
//! priorities and the delivery loop drains them in a fixed order. Grounded on the teacher's
//! `im/daemon.rs` outbound-FIFO-plus-notify pattern, generalized from a single per-channel FIFO
//! to the four-queue priority scheme and extended with a pause flag for passthrough mode.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Interrupt,
    Normal,
    IdleFirst,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: String,
    pub priority: Priority,
    pub path: std::path::PathBuf,
    pub status: MessageStatus,
    #[serde(skip, default = "Instant_now")]
    pub enqueued_at: std::time::Instant,
}

#[allow(non_snake_case)]
fn Instant_now() -> std::time::Instant {
    std::time::Instant::now()
}

struct Inner {
    interrupt: VecDeque<Message>,
    normal: VecDeque<Message>,
    idle_first: Vec<Message>,
    idle: VecDeque<Message>,
    paused: bool,
}

/// Shared queue handle. All mutation goes through `&self`, guarded by an internal mutex; the
/// `Notify` lets the delivery loop sleep until something changes instead of polling.
pub struct Queue {
    inner: StdMutex<Inner>,
    notify: Notify,
}

impl Queue {
    pub fn new() -> Arc<Self> {
        Arc::new(Queue {
            inner: StdMutex::new(Inner {
                interrupt: VecDeque::new(),
                normal: VecDeque::new(),
                idle_first: Vec::new(),
                idle: VecDeque::new(),
                paused: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Add a message at the given priority. Interrupt messages bypass pause entirely; the queue
    /// accepts enqueues regardless of pause state (only dequeue respects it, spec.md §8).
    pub fn enqueue(&self, from: String, priority: Priority, path: std::path::PathBuf) -> Uuid {
        let id = Uuid::new_v4();
        let msg = Message {
            id,
            from,
            priority,
            path,
            status: MessageStatus::Pending,
            enqueued_at: std::time::Instant::now(),
        };
        {
            let mut inner = self.inner.lock().expect("queue mutex");
            match priority {
                Priority::Interrupt => inner.interrupt.push_back(msg),
                Priority::Normal => inner.normal.push_back(msg),
                // Idle-first is LIFO: most recently queued idle-first message is drained first.
                Priority::IdleFirst => inner.idle_first.push(msg),
                Priority::Idle => inner.idle.push_back(msg),
            }
        }
        self.notify.notify_waiters();
        id
    }

    /// Pop the next message to deliver, or `None` if nothing is eligible right now.
    ///
    /// Order: interrupt (always, even paused) > normal (unless paused) > idle-first LIFO (only
    /// when `idle_ok`) > idle FIFO (only when `idle_ok`). `idle_ok` is the caller's
    /// `vt.is_idle(threshold)` read; idle-tier messages never deliver while the terminal is busy.
    pub fn dequeue(&self, idle_ok: bool) -> Option<Message> {
        let mut inner = self.inner.lock().expect("queue mutex");
        if let Some(m) = inner.interrupt.pop_front() {
            return Some(m);
        }
        if inner.paused {
            return None;
        }
        if let Some(m) = inner.normal.pop_front() {
            return Some(m);
        }
        if idle_ok {
            if let Some(m) = inner.idle_first.pop() {
                return Some(m);
            }
            if let Some(m) = inner.idle.pop_front() {
                return Some(m);
            }
        }
        None
    }

    pub fn pause(&self) {
        self.inner.lock().expect("queue mutex").paused = true;
    }

    pub fn unpause(&self) {
        self.inner.lock().expect("queue mutex").paused = false;
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().expect("queue mutex").paused
    }

    pub fn lookup(&self, id: Uuid) -> Option<Message> {
        let inner = self.inner.lock().expect("queue mutex");
        inner
            .interrupt
            .iter()
            .chain(inner.normal.iter())
            .chain(inner.idle_first.iter())
            .chain(inner.idle.iter())
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().expect("queue mutex");
        inner.interrupt.len() + inner.normal.len() + inner.idle_first.len() + inner.idle.len()
    }

    /// Resolves once something changes (enqueue, unpause). The delivery loop races this against
    /// its 1s idle-poll tick.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn p(name: &str) -> PathBuf {
        PathBuf::from(name)
    }

    #[test]
    fn interrupt_bypasses_pause() {
        let q = Queue::new();
        q.pause();
        q.enqueue("a".into(), Priority::Interrupt, p("i"));
        let m = q.dequeue(false).expect("interrupt delivered while paused");
        assert_eq!(m.priority, Priority::Interrupt);
    }

    #[test]
    fn idle_first_is_lifo() {
        let q = Queue::new();
        q.enqueue("a".into(), Priority::IdleFirst, p("1"));
        q.enqueue("a".into(), Priority::IdleFirst, p("2"));
        let m1 = q.dequeue(true).unwrap();
        let m2 = q.dequeue(true).unwrap();
        assert_eq!(m1.path, p("2"));
        assert_eq!(m2.path, p("1"));
    }

    #[test]
    fn idle_is_fifo() {
        let q = Queue::new();
        q.enqueue("a".into(), Priority::Idle, p("1"));
        q.enqueue("a".into(), Priority::Idle, p("2"));
        let m1 = q.dequeue(true).unwrap();
        let m2 = q.dequeue(true).unwrap();
        assert_eq!(m1.path, p("1"));
        assert_eq!(m2.path, p("2"));
    }

    #[test]
    fn full_priority_order() {
        let q = Queue::new();
        q.enqueue("a".into(), Priority::Idle, p("idle"));
        q.enqueue("a".into(), Priority::IdleFirst, p("idle-first"));
        q.enqueue("a".into(), Priority::Normal, p("normal"));
        q.enqueue("a".into(), Priority::Interrupt, p("interrupt"));

        assert_eq!(q.dequeue(true).unwrap().path, p("interrupt"));
        assert_eq!(q.dequeue(true).unwrap().path, p("normal"));
        assert_eq!(q.dequeue(true).unwrap().path, p("idle-first"));
        assert_eq!(q.dequeue(true).unwrap().path, p("idle"));
    }

    #[test]
    fn idle_tier_gated_on_idle_ok() {
        let q = Queue::new();
        q.enqueue("a".into(), Priority::Idle, p("idle"));
        q.enqueue("a".into(), Priority::IdleFirst, p("idle-first"));
        assert!(q.dequeue(false).is_none());
        assert!(q.dequeue(true).is_some());
    }

    #[test]
    fn pause_then_unpause_releases_normal() {
        let q = Queue::new();
        q.pause();
        q.enqueue("a".into(), Priority::Normal, p("n"));
        assert!(q.dequeue(true).is_none());
        q.unpause();
        assert!(q.dequeue(true).is_some());
    }
}
