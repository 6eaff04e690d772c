//! Delivery loop (T2, spec.md §4.3): wakes on queue activity or a 1s tick, decides whether the
//! terminal is idle, dequeues the next eligible message, and writes a single announcement line
//! into the PTY. Grounded on the teacher's `im/daemon.rs` outbound daemon task (`select!` between
//! a notify and a timer, draining one item per wake) generalized from "send a chat message" to
//! "announce a file path the agent should read".

use std::sync::Arc;
use std::time::Duration;

use crate::queue::{MessageStatus, Priority, Queue};
use crate::vt::{Vt, WriteOutcome};

const ETX: u8 = 0x03;
const INTERRUPT_SETTLE: Duration = Duration::from_millis(200);
const POLL_TICK: Duration = Duration::from_secs(1);

/// Fired once a message's announcement has been written to the PTY (or timed out — spec.md §4.3
/// treats a write timeout as "delivered": the bytes are still queued on the writer thread).
pub type OnDelivered = Arc<dyn Fn(uuid::Uuid, MessageStatus) + Send + Sync>;

pub struct DeliveryLoop {
    queue: Arc<Queue>,
    vt: Vt,
    write_deadline: Duration,
    idle_threshold: Duration,
    on_delivered: OnDelivered,
}

impl DeliveryLoop {
    pub fn new(
        queue: Arc<Queue>,
        vt: Vt,
        write_deadline: Duration,
        idle_threshold: Duration,
        on_delivered: OnDelivered,
    ) -> Self {
        DeliveryLoop {
            queue,
            vt,
            write_deadline,
            idle_threshold,
            on_delivered,
        }
    }

    /// Run until told to shut down (spec.md §5: every long-lived task observes the shutdown
    /// signal at its next suspension point). Intended to be spawned as its own task.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(POLL_TICK) => {}
                _ = shutdown.changed() => {}
            }

            if *shutdown.borrow() {
                return;
            }

            if self.queue.is_paused() {
                // Only interrupt messages can be delivered while passthrough holds the pause;
                // dequeue(false) still drains those (spec.md §8).
                while let Some(msg) = self.queue.dequeue(false) {
                    if self.deliver(msg).await {
                        // The writer thread is still working through a stalled write; stop
                        // draining and resume on the next wake (spec.md §4.3).
                        break;
                    }
                }
                continue;
            }

            let idle_ok = self.vt.is_idle(self.idle_threshold);
            while let Some(msg) = self.queue.dequeue(idle_ok) {
                if self.deliver(msg).await {
                    break;
                }
            }
        }
    }

    /// Deliver one message; returns `true` if the write timed out (drain should stop here).
    async fn deliver(&self, msg: crate::queue::Message) -> bool {
        if matches!(msg.priority, Priority::Interrupt) {
            let _ = self.vt.write_pty(vec![ETX], self.write_deadline).await;
            tokio::time::sleep(INTERRUPT_SETTLE).await;
        }

        let line = format!(
            "[h2-message from={} id={} priority={:?}] Read {}\r",
            msg.from,
            msg.id,
            msg.priority,
            msg.path.display()
        );

        let (status, timed_out) = match self.vt.write_pty(line.into_bytes(), self.write_deadline).await {
            Ok(WriteOutcome::Written(_)) => (MessageStatus::Delivered, false),
            // The write is still in flight on the vt writer thread; from the queue's
            // perspective the message has left the queue and cannot be redelivered, so it is
            // recorded delivered (spec.md §4.3 Open Question resolution, see DESIGN.md). The
            // writer is backed up, though, so the caller stops draining until the next wake.
            Ok(WriteOutcome::Timeout) => (MessageStatus::Delivered, true),
            Err(_) => (MessageStatus::Failed, false),
        };

        (self.on_delivered)(msg.id, status);
        timed_out
    }
}
