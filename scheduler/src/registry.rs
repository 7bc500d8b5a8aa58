//! The table of devices.
//!
//! Each device gets a slot number when it is added to the
//! [`Registry`], and keeps it until it is deleted.  Deleting a device
//! empties its slot but never moves any other device, so slot
//! numbers held by user interfaces and debuggers stay valid.  An
//! empty slot may be reused by a later device.
//!
//! The registry also records which devices are connected to the link
//! hub (the virtual cable between calculators).  Pausing or resuming
//! the linked devices is done by queueing `Stop` or `Run` commands
//! for each of them; the registry never touches a device's state
//! directly.
//!
//! The whole table is protected by a single mutex.  It is held only
//! while the table is read or changed, never while a command is
//! queued, a thread is joined or a host object is called.
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::{event, Level};

use super::clock::{SystemWallClock, WallClock};
use super::command::Command;
use super::engine::Engine;
use super::host::{Clipboard, Debugger, DeviceHost, DeviceUi, MemoryClipboard};
use super::listener::StateListener;
use super::queue::{command_queue, CommandSender, QueueClosed};
use super::scheduler::{DeviceScheduler, SchedulerHandle};

/// The slot table grows by this many entries at a time.
pub const SLOT_BLOCK: usize = 4;

/// Identifies one device for the whole of its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Slot(usize);

impl Slot {
    pub const fn new(n: usize) -> Slot {
        Slot(n)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        Display::fmt(&self.0, f)
    }
}

/// Describes the device in a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
}

impl DeviceInfo {
    pub fn new(name: &str, model: &str) -> DeviceInfo {
        DeviceInfo {
            name: name.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// The table never grows beyond this many slots.
    pub max_slots: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig { max_slots: 16 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// There is no room for another device.
    AllocationFailed,
    NoSuchSlot(Slot),
    /// The device's scheduler has not been started.
    NotStarted(Slot),
    AlreadyStarted(Slot),
    /// The device's scheduler thread is still running, so the device
    /// cannot be deleted yet.
    SchedulerRunning(Slot),
    SchedulerPanicked(Slot),
    Spawn(String),
    Queue(QueueClosed),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            RegistryError::AllocationFailed => f.write_str("no free slot for another device"),
            RegistryError::NoSuchSlot(slot) => write!(f, "slot {slot} has no device"),
            RegistryError::NotStarted(slot) => {
                write!(f, "the device in slot {slot} has no scheduler running")
            }
            RegistryError::AlreadyStarted(slot) => {
                write!(f, "the device in slot {slot} already has a scheduler")
            }
            RegistryError::SchedulerRunning(slot) => write!(
                f,
                "the scheduler for slot {slot} is still running; stop it before deleting the device"
            ),
            RegistryError::SchedulerPanicked(slot) => {
                write!(f, "the scheduler thread for slot {slot} panicked")
            }
            RegistryError::Spawn(msg) => write!(f, "failed to start scheduler thread: {msg}"),
            RegistryError::Queue(e) => Display::fmt(e, f),
        }
    }
}

impl Error for RegistryError {}

impl From<QueueClosed> for RegistryError {
    fn from(e: QueueClosed) -> RegistryError {
        RegistryError::Queue(e)
    }
}

struct SlotEntry {
    info: DeviceInfo,
    ui: Option<Arc<dyn DeviceUi>>,
    scheduler: Option<SchedulerHandle>,
    /// Set while `shutdown_device` is waiting for the scheduler
    /// thread, whose handle it has taken out of the table.
    closing: bool,
    debugger: Option<Arc<dyn Debugger>>,
    linked: bool,
}

impl SlotEntry {
    /// True while a scheduler thread may still act on this slot.
    fn scheduler_alive(&self) -> bool {
        self.closing
            || self
                .scheduler
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

impl Debug for SlotEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("SlotEntry")
            .field("info", &self.info)
            .field("has_ui", &self.ui.is_some())
            .field("scheduler", &self.scheduler)
            .field("closing", &self.closing)
            .field("has_debugger", &self.debugger.is_some())
            .field("linked", &self.linked)
            .finish()
    }
}

#[derive(Debug, Default)]
struct SlotTable {
    entries: Vec<Option<SlotEntry>>,
}

impl SlotTable {
    fn get(&self, slot: Slot) -> Option<&SlotEntry> {
        self.entries.get(slot.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, slot: Slot) -> Option<&mut SlotEntry> {
        self.entries.get_mut(slot.0).and_then(Option::as_mut)
    }

    fn occupied(&self) -> impl Iterator<Item = (Slot, &SlotEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (Slot(i), e)))
    }

    /// Finds the lowest empty slot, growing the table if there is
    /// none.
    fn allocate(&mut self, max_slots: usize) -> Result<Slot, RegistryError> {
        if let Some(i) = self.entries.iter().position(Option::is_none) {
            return Ok(Slot(i));
        }
        let current = self.entries.len();
        let new_len = (current + SLOT_BLOCK).min(max_slots);
        if new_len <= current {
            return Err(RegistryError::AllocationFailed);
        }
        self.entries
            .try_reserve_exact(new_len - current)
            .map_err(|_| RegistryError::AllocationFailed)?;
        self.entries.resize_with(new_len, || None);
        Ok(Slot(current))
    }
}

type DebuggerFactory = dyn Fn(Slot) -> Arc<dyn Debugger> + Send + Sync;

pub struct Registry {
    table: Mutex<SlotTable>,
    config: RegistryConfig,
    clipboard: Arc<dyn Clipboard>,
    debugger_factory: Option<Box<DebuggerFactory>>,
    this: Weak<Registry>,
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("Registry")
            .field("table", &self.table)
            .field("config", &self.config)
            .field("clipboard", &self.clipboard)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Arc<Registry> {
        Registry::build(config, Arc::new(MemoryClipboard::new()), None)
    }

    /// Builds a registry which uses the given clipboard and which
    /// calls `debugger_factory` to create a debugger for a device the
    /// first time one is asked for.
    pub fn with_collaborators(
        config: RegistryConfig,
        clipboard: Arc<dyn Clipboard>,
        debugger_factory: Box<DebuggerFactory>,
    ) -> Arc<Registry> {
        Registry::build(config, clipboard, Some(debugger_factory))
    }

    fn build(
        config: RegistryConfig,
        clipboard: Arc<dyn Clipboard>,
        debugger_factory: Option<Box<DebuggerFactory>>,
    ) -> Arc<Registry> {
        Arc::new_cyclic(|this| Registry {
            table: Mutex::new(SlotTable::default()),
            config,
            clipboard,
            debugger_factory,
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a device to the table.  Its scheduler is not started.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AllocationFailed`] if there is no free slot
    /// and the table cannot grow.
    pub fn add_device(&self, info: DeviceInfo) -> Result<Slot, RegistryError> {
        let mut table = self.lock();
        let slot = match table.allocate(self.config.max_slots) {
            Ok(slot) => slot,
            Err(e) => {
                drop(table);
                event!(Level::WARN, "cannot add device {}: {}", info.name, e);
                return Err(e);
            }
        };
        event!(
            Level::INFO,
            "device {} ({}) is in slot {}",
            info.name,
            info.model,
            slot
        );
        table.entries[slot.0] = Some(SlotEntry {
            info,
            ui: None,
            scheduler: None,
            closing: false,
            debugger: None,
            linked: false,
        });
        Ok(slot)
    }

    /// Starts the scheduler thread for the device in `slot`, handing
    /// it `engine`.  Returns a sender for the device's commands.
    pub fn start_device<E>(
        &self,
        slot: Slot,
        engine: E,
        listener: Option<Box<dyn StateListener<E>>>,
    ) -> Result<CommandSender, RegistryError>
    where
        E: Engine + Send + 'static,
    {
        self.start_device_with_clock(slot, engine, listener, SystemWallClock::new())
    }

    pub fn start_device_with_clock<E, C>(
        &self,
        slot: Slot,
        engine: E,
        listener: Option<Box<dyn StateListener<E>>>,
        clock: C,
    ) -> Result<CommandSender, RegistryError>
    where
        E: Engine + Send + 'static,
        C: WallClock + Send + 'static,
    {
        match self.lock().get(slot) {
            None => return Err(RegistryError::NoSuchSlot(slot)),
            Some(entry) if entry.scheduler.is_some() || entry.closing => {
                return Err(RegistryError::AlreadyStarted(slot));
            }
            Some(_) => (),
        }

        let (_, receiver) = command_queue();
        let host: Weak<dyn DeviceHost> = self.this.clone();
        let mut scheduler =
            DeviceScheduler::with_clock(slot, engine, receiver, clock).with_host(host);
        if let Some(listener) = listener {
            scheduler = scheduler.with_listener(listener);
        }
        let handle = scheduler
            .spawn()
            .map_err(|e| RegistryError::Spawn(e.to_string()))?;
        let sender = handle.sender().clone();

        let mut table = self.lock();
        match table.get_mut(slot) {
            Some(entry) if entry.scheduler.is_none() && !entry.closing => {
                entry.scheduler = Some(handle);
                Ok(sender)
            }
            other => {
                // Someone else got there first (or deleted the device)
                // while we were starting the thread.
                let err = match other {
                    None => RegistryError::NoSuchSlot(slot),
                    Some(_) => RegistryError::AlreadyStarted(slot),
                };
                drop(table);
                if handle.shutdown().is_err() {
                    event!(Level::ERROR, "surplus scheduler for slot {} panicked", slot);
                }
                Err(err)
            }
        }
    }

    /// Removes the device in `slot` from the table.
    ///
    /// # Errors
    ///
    /// Deletion is refused (with [`RegistryError::SchedulerRunning`])
    /// while the device's scheduler thread is alive, including while
    /// another caller is still shutting it down; use
    /// [`Registry::shutdown_device`] first.
    pub fn delete_device(&self, slot: Slot) -> Result<DeviceInfo, RegistryError> {
        let mut table = self.lock();
        let entry = match table.get(slot) {
            None => return Err(RegistryError::NoSuchSlot(slot)),
            Some(entry) => entry,
        };
        if entry.scheduler_alive() {
            drop(table);
            event!(
                Level::WARN,
                "refusing to delete the device in slot {} while its scheduler is running",
                slot
            );
            return Err(RegistryError::SchedulerRunning(slot));
        }
        let removed = table.entries[slot.0].take();
        drop(table);
        match removed {
            Some(SlotEntry {
                info, scheduler, ..
            }) => {
                if let Some(handle) = scheduler {
                    if handle.join().is_err() {
                        event!(Level::ERROR, "the scheduler for slot {} had panicked", slot);
                    }
                }
                event!(Level::INFO, "deleted device {} from slot {}", info.name, slot);
                Ok(info)
            }
            None => Err(RegistryError::NoSuchSlot(slot)),
        }
    }

    /// Asks the scheduler for `slot` to close, and waits for it.
    /// The device stays in the table (and can be deleted afterwards).
    /// Until the thread has exited the slot counts as running.
    pub fn shutdown_device(&self, slot: Slot) -> Result<(), RegistryError> {
        let sender = self.sender(slot)?;
        if sender.enqueue(Command::Close).is_err() {
            event!(Level::DEBUG, "slot {} was already closing", slot);
        }
        let handle = match self.lock().get_mut(slot) {
            Some(entry) => {
                let handle = entry.scheduler.take();
                if handle.is_some() {
                    entry.closing = true;
                }
                handle
            }
            None => None,
        };
        let handle = match handle {
            Some(handle) => handle,
            // Another caller is already waiting for it.
            None => return Ok(()),
        };
        let joined = handle.join();
        // The entry cannot have been deleted or reused meanwhile,
        // because deletion is refused while `closing` is set.
        if let Some(entry) = self.lock().get_mut(slot) {
            entry.closing = false;
        }
        event!(Level::DEBUG, "scheduler for slot {} has exited", slot);
        joined.map_err(|_| RegistryError::SchedulerPanicked(slot))
    }

    /// Closes every running scheduler.
    pub fn shutdown_all(&self) {
        for slot in self.slots() {
            match self.shutdown_device(slot) {
                Ok(()) | Err(RegistryError::NotStarted(_)) => (),
                Err(e) => event!(Level::ERROR, "{}", e),
            }
        }
    }

    pub fn device(&self, slot: Slot) -> Option<DeviceInfo> {
        self.lock().get(slot).map(|entry| entry.info.clone())
    }

    /// Returns a sender for the commands of the device in `slot`.
    pub fn sender(&self, slot: Slot) -> Result<CommandSender, RegistryError> {
        match self.lock().get(slot) {
            None => Err(RegistryError::NoSuchSlot(slot)),
            Some(entry) => entry
                .scheduler
                .as_ref()
                .map(|handle| handle.sender().clone())
                .ok_or(RegistryError::NotStarted(slot)),
        }
    }

    pub fn enqueue(&self, slot: Slot, cmd: Command) -> Result<(), RegistryError> {
        let sender = self.sender(slot)?;
        sender.enqueue(cmd).map_err(RegistryError::from)
    }

    /// True while the scheduler thread for `slot` is alive (even if
    /// it has been asked to close).
    pub fn is_running(&self, slot: Slot) -> bool {
        self.lock().get(slot).is_some_and(SlotEntry::scheduler_alive)
    }

    pub fn debugger(&self, slot: Slot) -> Option<Arc<dyn Debugger>> {
        self.lock().get(slot).and_then(|entry| entry.debugger.clone())
    }

    pub fn set_debugger(
        &self,
        slot: Slot,
        debugger: Option<Arc<dyn Debugger>>,
    ) -> Result<(), RegistryError> {
        match self.lock().get_mut(slot) {
            Some(entry) => {
                entry.debugger = debugger;
                Ok(())
            }
            None => Err(RegistryError::NoSuchSlot(slot)),
        }
    }

    pub fn set_ui(&self, slot: Slot, ui: Option<Arc<dyn DeviceUi>>) -> Result<(), RegistryError> {
        match self.lock().get_mut(slot) {
            Some(entry) => {
                entry.ui = ui;
                Ok(())
            }
            None => Err(RegistryError::NoSuchSlot(slot)),
        }
    }

    /// The occupied slots, in slot order.
    pub fn slots(&self) -> Vec<Slot> {
        self.lock().occupied().map(|(slot, _)| slot).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().occupied().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current size of the slot table, including empty slots.
    pub fn capacity(&self) -> usize {
        self.lock().entries.len()
    }

    fn set_linked(&self, slot: Slot, linked: bool) -> Result<(), RegistryError> {
        match self.lock().get_mut(slot) {
            Some(entry) => {
                entry.linked = linked;
                Ok(())
            }
            None => Err(RegistryError::NoSuchSlot(slot)),
        }
    }

    pub fn connect_link(&self, slot: Slot) -> Result<(), RegistryError> {
        self.set_linked(slot, true)?;
        event!(Level::INFO, "slot {} connected to the link hub", slot);
        Ok(())
    }

    pub fn disconnect_link(&self, slot: Slot) -> Result<(), RegistryError> {
        self.set_linked(slot, false)?;
        event!(Level::INFO, "slot {} disconnected from the link hub", slot);
        Ok(())
    }

    pub fn linked_slots(&self) -> Vec<Slot> {
        self.lock()
            .occupied()
            .filter(|(_, entry)| entry.linked)
            .map(|(slot, _)| slot)
            .collect()
    }

    fn broadcast_to_linked(&self, make: fn() -> Command) -> usize {
        let targets: Vec<(Slot, CommandSender)> = self
            .lock()
            .occupied()
            .filter(|(_, entry)| entry.linked)
            .filter_map(|(slot, entry)| {
                entry
                    .scheduler
                    .as_ref()
                    .map(|handle| (slot, handle.sender().clone()))
            })
            .collect();
        targets
            .into_iter()
            .filter(|(slot, sender)| match sender.enqueue(make()) {
                Ok(()) => true,
                Err(e) => {
                    event!(Level::WARN, "slot {}: {}", slot, e);
                    false
                }
            })
            .count()
    }

    /// Stops every device on the link hub.  Returns the number of
    /// devices told to stop.
    pub fn pause_all_linked(&self) -> usize {
        let n = self.broadcast_to_linked(|| Command::Stop);
        event!(Level::DEBUG, "paused {} linked devices", n);
        n
    }

    /// Restarts every device on the link hub.
    pub fn resume_all_linked(&self) -> usize {
        let n = self.broadcast_to_linked(|| Command::Run);
        event!(Level::DEBUG, "resumed {} linked devices", n);
        n
    }
}

/// Schedulers reach the registry through this.  Every method copies
/// what it needs out of the table and releases the lock before
/// calling the UI, debugger or clipboard.
impl DeviceHost for Registry {
    fn repaint(&self, slot: Slot) {
        let ui = self.lock().get(slot).and_then(|entry| entry.ui.clone());
        if let Some(ui) = ui {
            ui.repaint();
        }
    }

    fn show_debugger(&self, slot: Slot) {
        let debugger = match self.debugger(slot) {
            Some(debugger) => debugger,
            None => match self.debugger_factory.as_ref() {
                Some(factory) => {
                    let created = factory(slot);
                    if self.set_debugger(slot, Some(Arc::clone(&created))).is_err() {
                        event!(Level::WARN, "slot {} vanished while opening its debugger", slot);
                        return;
                    }
                    created
                }
                None => {
                    event!(Level::WARN, "no debugger is available for slot {}", slot);
                    return;
                }
            },
        };
        debugger.show();
    }

    fn connect_link(&self, slot: Slot) {
        if let Err(e) = Registry::connect_link(self, slot) {
            event!(Level::WARN, "{}", e);
        }
    }

    fn disconnect_link(&self, slot: Slot) {
        if let Err(e) = Registry::disconnect_link(self, slot) {
            event!(Level::WARN, "{}", e);
        }
    }

    fn clipboard_text(&self) -> Option<String> {
        self.clipboard.text()
    }

    fn set_clipboard_text(&self, text: &str) {
        self.clipboard.set_text(text);
    }
}

#[test]
fn test_slots_are_allocated_in_blocks() {
    let registry = Registry::new(RegistryConfig { max_slots: 6 });
    assert_eq!(registry.capacity(), 0);
    let first = registry.add_device(DeviceInfo::new("a", "TI-83+")).unwrap();
    assert_eq!(first, Slot::new(0));
    assert_eq!(registry.capacity(), SLOT_BLOCK);
    for i in 1..6 {
        assert_eq!(
            registry.add_device(DeviceInfo::new("x", "TI-84+")).unwrap(),
            Slot::new(i)
        );
    }
    assert_eq!(registry.capacity(), 6);
    assert_eq!(
        registry.add_device(DeviceInfo::new("overflow", "TI-84+")),
        Err(RegistryError::AllocationFailed)
    );
}

#[test]
fn test_delete_keeps_other_slots_stable() {
    let registry = Registry::new(RegistryConfig::default());
    let a = registry.add_device(DeviceInfo::new("a", "TI-83+")).unwrap();
    let b = registry.add_device(DeviceInfo::new("b", "TI-83+")).unwrap();
    let c = registry.add_device(DeviceInfo::new("c", "TI-83+")).unwrap();
    assert_eq!(registry.delete_device(b).unwrap().name, "b");
    assert_eq!(registry.slots(), vec![a, c]);
    assert_eq!(registry.device(a).unwrap().name, "a");
    assert_eq!(registry.device(c).unwrap().name, "c");
    assert_eq!(registry.device(b), None);
    // The empty slot is reused.
    assert_eq!(registry.add_device(DeviceInfo::new("d", "TI-84+")).unwrap(), b);
    assert_eq!(registry.delete_device(Slot::new(99)), Err(RegistryError::NoSuchSlot(Slot::new(99))));
}

#[test]
fn test_link_membership() {
    let registry = Registry::new(RegistryConfig::default());
    let a = registry.add_device(DeviceInfo::new("a", "TI-83+")).unwrap();
    let b = registry.add_device(DeviceInfo::new("b", "TI-83+")).unwrap();
    assert!(registry.linked_slots().is_empty());
    Registry::connect_link(&registry, b).unwrap();
    assert_eq!(registry.linked_slots(), vec![b]);
    Registry::connect_link(&registry, a).unwrap();
    assert_eq!(registry.linked_slots(), vec![a, b]);
    Registry::disconnect_link(&registry, b).unwrap();
    assert_eq!(registry.linked_slots(), vec![a]);
    // No scheduler is running, so there is nobody to pause.
    assert_eq!(registry.pause_all_linked(), 0);
}

#[test]
fn test_sender_for_unstarted_device() {
    let registry = Registry::new(RegistryConfig::default());
    let a = registry.add_device(DeviceInfo::new("a", "TI-83+")).unwrap();
    assert_eq!(registry.sender(a).unwrap_err(), RegistryError::NotStarted(a));
    assert_eq!(
        registry.enqueue(a, Command::Run),
        Err(RegistryError::NotStarted(a))
    );
    assert!(!registry.is_running(a));
}
