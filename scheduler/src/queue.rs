//! The command queue between a device's clients and its scheduler.
//!
//! Any number of [`CommandSender`]s may append to the queue; exactly
//! one [`CommandReceiver`] (owned by the scheduler thread) removes
//! items from the front.  The queue is strictly FIFO and unbounded.
//!
//! Once a [`Command::Close`] has been enqueued the queue is closed:
//! further calls to [`CommandSender::enqueue`] are rejected (and
//! logged) and the command is dropped.  Hence a `Close` is always the
//! last thing the scheduler sees.
//!
//! The queue is also closed when the receiver is dropped, for example
//! when the scheduler thread dies, so that commands are never accepted
//! by a queue nobody will read.
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{event, Level};

use super::command::Command;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Command>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    nonempty: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding this lock cannot leave the VecDeque
        // in an inconsistent state, so it is safe to carry on.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, cmd: Command) -> Result<(), QueueClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(QueueClosed(cmd.name()));
        }
        if matches!(cmd, Command::Close) {
            state.closed = true;
        }
        state.items.push_back(cmd);
        drop(state);
        self.nonempty.notify_one();
        Ok(())
    }
}

/// Signals that a command was not queued because the device's queue
/// has already been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed(pub &'static str);

impl Display for QueueClosed {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(
            f,
            "command {} was dropped because the device is closing",
            self.0
        )
    }
}

impl Error for QueueClosed {}

/// Creates a new, empty, open command queue.
pub fn command_queue() -> (CommandSender, CommandReceiver) {
    let shared = Arc::new(Shared::default());
    (
        CommandSender {
            shared: Arc::clone(&shared),
        },
        CommandReceiver { shared },
    )
}

/// The producer side of a command queue.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct CommandSender {
    shared: Arc<Shared>,
}

impl CommandSender {
    /// Append `cmd` to the queue.  This only blocks for as long as
    /// it takes to acquire the queue's lock.
    ///
    /// # Errors
    ///
    /// [`QueueClosed`] if a [`Command::Close`] has already been
    /// enqueued.  Nothing is queued in that case.
    pub fn enqueue(&self, cmd: Command) -> Result<(), QueueClosed> {
        self.shared.push(cmd).map_err(|e| {
            event!(Level::WARN, "{}", e);
            e
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The consumer side of a command queue.  There is only ever one of
/// these per queue (it does not implement `Clone`).
#[derive(Debug)]
pub struct CommandReceiver {
    shared: Arc<Shared>,
}

impl CommandReceiver {
    /// Removes and returns the command at the head of the queue.
    /// Never blocks (other than to acquire the lock).
    pub fn try_dequeue(&self) -> Option<Command> {
        self.shared.lock().items.pop_front()
    }

    /// Returns a new sender for this queue.
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Appends a command generated by the scheduler itself (for
    /// example a state notification).  Like
    /// [`CommandSender::enqueue`], this is refused once the queue is
    /// closed, but it is not an error worth logging: the loop is
    /// about to exit anyway.
    pub(crate) fn push_internal(&self, cmd: Command) {
        if let Err(e) = self.shared.push(cmd) {
            event!(Level::DEBUG, "{}", e);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.shared.lock().items.is_empty()
    }

    /// Blocks until the queue is non-empty or `timeout` has elapsed,
    /// whichever is first.  Returns true if the queue is non-empty.
    /// Spurious wakeups are absorbed here.
    pub fn wait_for_command(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if !state.items.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.shared.nonempty.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl Drop for CommandReceiver {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.closed = true;
        if !state.items.is_empty() {
            event!(
                Level::DEBUG,
                "discarding {} unprocessed commands",
                state.items.len()
            );
            state.items.clear();
        }
    }
}

#[test]
fn test_fifo_order() {
    let (tx, rx) = command_queue();
    tx.enqueue(Command::Run).unwrap();
    tx.enqueue(Command::Stop).unwrap();
    tx.enqueue(Command::Step).unwrap();
    assert_eq!(tx.len(), 3);
    let names: Vec<&str> = std::iter::from_fn(|| rx.try_dequeue())
        .map(|c| c.name())
        .collect();
    assert_eq!(names, vec!["Run", "Stop", "Step"]);
    assert!(rx.try_dequeue().is_none());
}

#[test]
fn test_enqueue_after_close_is_rejected() {
    let (tx, rx) = command_queue();
    tx.enqueue(Command::Step).unwrap();
    tx.enqueue(Command::Close).unwrap();
    assert!(tx.is_closed());
    assert_eq!(tx.enqueue(Command::Step), Err(QueueClosed("Step")));
    assert_eq!(tx.enqueue(Command::Close), Err(QueueClosed("Close")));
    assert!(matches!(rx.try_dequeue(), Some(Command::Step)));
    assert!(matches!(rx.try_dequeue(), Some(Command::Close)));
    assert!(rx.try_dequeue().is_none());
}

#[test]
fn test_dropping_receiver_closes_queue() {
    let (tx, rx) = command_queue();
    tx.enqueue(Command::Run).unwrap();
    drop(rx);
    assert!(tx.is_closed());
    assert!(tx.is_empty());
    assert_eq!(tx.enqueue(Command::Step), Err(QueueClosed("Step")));
}

#[test]
fn test_wait_returns_immediately_when_nonempty() {
    let (tx, rx) = command_queue();
    tx.enqueue(Command::Run).unwrap();
    let start = Instant::now();
    assert!(rx.wait_for_command(Duration::from_secs(10)));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_wait_times_out_when_empty() {
    let (_tx, rx) = command_queue();
    assert!(!rx.wait_for_command(Duration::from_millis(5)));
}

#[test]
fn test_wait_is_interrupted_by_enqueue() {
    let (tx, rx) = command_queue();
    let producer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        tx.enqueue(Command::Close).unwrap();
    });
    let start = Instant::now();
    assert!(rx.wait_for_command(Duration::from_secs(30)));
    assert!(start.elapsed() < Duration::from_secs(10));
    producer.join().unwrap();
}

#[test]
fn test_many_producers_keep_per_producer_order() {
    let (tx, rx) = command_queue();
    let producers: Vec<_> = (1..=4u32)
        .map(|id| {
            let tx = tx.clone();
            std::thread::spawn(move || {
                for i in 1..=50u32 {
                    tx.enqueue(Command::step_n(id * 1000 + i).unwrap()).unwrap();
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    let mut last_seen = [0u32; 5];
    let mut total = 0;
    while let Some(cmd) = rx.try_dequeue() {
        if let Command::StepN(n) = cmd {
            let id = (n.get() / 1000) as usize;
            let seq = n.get() % 1000;
            assert!(seq > last_seen[id]);
            last_seen[id] = seq;
            total += 1;
        }
    }
    assert_eq!(total, 200);
}
