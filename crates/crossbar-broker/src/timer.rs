// Broker timer list: one task owns an ascending deadline list and is
// driven over a command channel, so registration and cancellation never
// race the firing path.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Handler run when a timer fires. Runs on the timer task; keep it short.
pub type TimerFn = Box<dyn FnMut() + Send>;

/// Opaque handle for cancel and refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

enum Command {
    Register {
        id: TimerId,
        interval: Duration,
        cyclic: bool,
        handler: TimerFn,
    },
    Cancel(TimerId),
    /// Push the deadline out from now; one-shot timers stay one-shot.
    Refresh { id: TimerId, interval: Duration },
}

pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
}

impl Timers {
    /// Spawn the timer task. Dropping the handle stops it.
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self {
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, interval: Duration, cyclic: bool, handler: TimerFn) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(Command::Register {
            id,
            interval,
            cyclic,
            handler,
        });
        id
    }

    pub(crate) fn cancel(&self, id: TimerId) {
        let _ = self.tx.send(Command::Cancel(id));
    }

    pub(crate) fn refresh(&self, id: TimerId, interval: Duration) {
        let _ = self.tx.send(Command::Refresh { id, interval });
    }
}

struct Entry {
    id: TimerId,
    deadline: Instant,
    interval: Duration,
    cyclic: bool,
    handler: TimerFn,
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    // Kept sorted ascending by deadline; the front is always next to fire.
    let mut entries: Vec<Entry> = Vec::new();
    loop {
        let command = if let Some(next) = entries.first().map(|e| e.deadline) {
            tokio::select! {
                cmd = rx.recv() => cmd,
                _ = tokio::time::sleep_until(next) => {
                    fire_due(&mut entries);
                    continue;
                }
            }
        } else {
            rx.recv().await
        };
        match command {
            Some(Command::Register {
                id,
                interval,
                cyclic,
                handler,
            }) => {
                arm(
                    &mut entries,
                    Entry {
                        id,
                        deadline: Instant::now() + interval,
                        interval,
                        cyclic,
                        handler,
                    },
                );
            }
            Some(Command::Cancel(id)) => entries.retain(|e| e.id != id),
            Some(Command::Refresh { id, interval }) => {
                if let Some(pos) = entries.iter().position(|e| e.id == id) {
                    let mut entry = entries.remove(pos);
                    entry.interval = interval;
                    entry.deadline = Instant::now() + interval;
                    arm(&mut entries, entry);
                }
            }
            // Owner dropped; stop the task.
            None => return,
        }
    }
}

fn arm(entries: &mut Vec<Entry>, entry: Entry) {
    let pos = entries.partition_point(|e| e.deadline <= entry.deadline);
    entries.insert(pos, entry);
}

fn fire_due(entries: &mut Vec<Entry>) {
    let now = Instant::now();
    while entries.first().is_some_and(|e| e.deadline <= now) {
        let mut entry = entries.remove(0);
        // Cyclic timers re-arm from the wake time before the handler runs,
        // so a slow handler does not shift the cadence further.
        if entry.cyclic {
            entry.deadline = now + entry.interval;
        }
        (entry.handler)();
        if entry.cyclic {
            arm(entries, entry);
        }
    }
}
