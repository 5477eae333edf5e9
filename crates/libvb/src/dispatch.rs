//! Registry mapping subsystem event registrations to user handlers.
//!
//! Registration and deregistration take the write lock; dispatch only holds
//! the read lock long enough to clone the registration, so handlers run
//! unlocked and may re-enter the table.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
};

use log::{debug, info, warn};

use crate::{
    error::{Error, Result},
    event::{DomainEvent, EventKind, EventSource, Handler, HandlerRef, Opaque},
    subsystem::Subsystem,
};

const REGISTER_OP: &str = "virConnectDomainEventRegisterAny";
const DEREGISTER_OP: &str = "virConnectDomainEventDeregisterAny";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Registered,
    Deregistered,
}

/// Scope of the registration ids one subsystem connection hands out. Two
/// connections may return the same id, so every table lookup by id is made
/// within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection {}", self.0)
    }
}

struct Registration {
    kind: EventKind,
    handler: Arc<Handler>,
    opaque: Opaque,
}

#[derive(Default)]
struct Slots {
    next: u64,
    by_slot: HashMap<u64, Arc<Registration>>,
    by_id: HashMap<(ConnectionId, i32), u64>,
}

#[derive(Default)]
struct Inner {
    connections: AtomicU64,
    slots: RwLock<Slots>,
    methods: RwLock<HashMap<String, Arc<Handler>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Handle given to the subsystem at registration. The subsystem calls
/// [`EventAdapter::deliver`] for every event it raises for that
/// registration, from whichever thread it likes.
#[derive(Clone)]
pub struct EventAdapter {
    table: Weak<Inner>,
    slot: u64,
    kind: EventKind,
}

impl EventAdapter {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Route one event to the registered handler.
    ///
    /// Events for a registration that is already gone are dropped. A
    /// handler or event whose shape differs from the registered kind fails
    /// this dispatch only.
    pub fn deliver(&self, source: &EventSource, event: &DomainEvent) -> Result<()> {
        let Some(inner) = self.table.upgrade() else {
            debug!(
                "dropping {} event for {}: table is gone",
                event.kind(),
                source.domain.name
            );
            return Ok(());
        };

        let registration = read(&inner.slots).by_slot.get(&self.slot).cloned();
        let Some(registration) = registration else {
            debug!(
                "dropping {} event for {}: no longer registered",
                event.kind(),
                source.domain.name
            );
            return Ok(());
        };

        if event.kind() != registration.kind {
            return Err(Error::HandlerContract {
                kind: registration.kind,
                reason: format!("received a {} event", event.kind()),
            });
        }

        registration.handler.invoke(source, event, &registration.opaque)
    }
}

impl std::fmt::Debug for EventAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventAdapter")
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Thread safe registry of event registrations. Clones share state.
#[derive(Clone, Default)]
pub struct DispatchTable {
    inner: Arc<Inner>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process wide table.
    pub fn global() -> &'static DispatchTable {
        static GLOBAL: OnceLock<DispatchTable> = OnceLock::new();
        GLOBAL.get_or_init(DispatchTable::new)
    }

    /// A fresh id scope for one subsystem connection.
    pub fn connection(&self) -> ConnectionId {
        ConnectionId(self.inner.connections.fetch_add(1, Ordering::Relaxed))
    }

    /// Define a handler that registrations can refer to by name. Returns the
    /// handler previously defined under `name`.
    pub fn define_method(&self, name: impl Into<String>, handler: Handler) -> Option<Arc<Handler>> {
        write(&self.inner.methods).insert(name.into(), Arc::new(handler))
    }

    fn resolve(&self, kind: EventKind, handler: HandlerRef) -> Result<Arc<Handler>> {
        match handler {
            HandlerRef::Direct(handler) => Ok(handler),
            HandlerRef::Named(name) => {
                read(&self.inner.methods)
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| Error::HandlerContract {
                        kind,
                        reason: format!("no handler named {name:?}"),
                    })
            }
        }
    }

    /// Register `handler` for `kind` events on `subsystem`, optionally
    /// limited to one domain, and return the subsystem's registration id.
    ///
    /// Every kind goes through `virConnectDomainEventRegisterAny`; the older
    /// lifecycle-only `virConnectDomainEventRegister` is a `Lifecycle`
    /// registration here.
    pub fn register<S: Subsystem + ?Sized>(
        &self,
        connection: ConnectionId,
        subsystem: &S,
        kind: EventKind,
        handler: impl Into<HandlerRef>,
        domain: Option<&str>,
        opaque: Opaque,
    ) -> Result<i32> {
        let handler = self.resolve(kind, handler.into())?;

        let slot = {
            let mut slots = write(&self.inner.slots);
            let slot = slots.next;
            slots.next += 1;
            slots.by_slot.insert(
                slot,
                Arc::new(Registration {
                    kind,
                    handler,
                    opaque,
                }),
            );
            slot
        };

        let adapter = EventAdapter {
            table: Arc::downgrade(&self.inner),
            slot,
            kind,
        };

        match subsystem.register_event(domain, kind, adapter) {
            Ok(id) => {
                let mut slots = write(&self.inner.slots);
                if let Some(stale) = slots.by_id.insert((connection, id), slot) {
                    warn!(
                        "{} reused registration id {} while still live, dropping slot {}",
                        connection, id, stale
                    );
                    slots.by_slot.remove(&stale);
                }
                info!(
                    "registered {} handler as {} on {} for {}",
                    kind,
                    id,
                    subsystem.uri(),
                    domain.unwrap_or("all domains")
                );
                Ok(id)
            }
            Err(source) => {
                write(&self.inner.slots).by_slot.remove(&slot);
                Err(Error::query(
                    REGISTER_OP,
                    format!("{} events on {}", kind, subsystem.uri()),
                    source,
                ))
            }
        }
    }

    /// Deregister `id` of `connection`. Unknown ids fail without reaching
    /// the subsystem; if the subsystem fails the registration stays in place.
    pub fn deregister<S: Subsystem + ?Sized>(
        &self,
        connection: ConnectionId,
        subsystem: &S,
        id: i32,
    ) -> Result<()> {
        let key = (connection, id);
        let (slot, registration) = {
            let mut slots = write(&self.inner.slots);
            let Some(slot) = slots.by_id.remove(&key) else {
                return Err(Error::UnknownRegistration(id));
            };
            let registration = slots.by_slot.remove(&slot);
            (slot, registration)
        };

        if let Err(source) = subsystem.deregister_event(id) {
            let mut slots = write(&self.inner.slots);
            slots.by_id.insert(key, slot);
            if let Some(registration) = registration {
                slots.by_slot.insert(slot, registration);
            }
            return Err(Error::query(
                DEREGISTER_OP,
                format!("registration {} on {}", id, subsystem.uri()),
                source,
            ));
        }

        debug!("deregistered {} of {}", id, connection);
        Ok(())
    }

    /// Deregister everything `connection` registered, attempting every id.
    /// The first failure is returned.
    pub fn deregister_all<S: Subsystem + ?Sized>(
        &self,
        connection: ConnectionId,
        subsystem: &S,
    ) -> Result<()> {
        let mut first = None;
        for (id, _) in self.registered(connection) {
            if let Err(err) = self.deregister(connection, subsystem, id) {
                warn!("failed to deregister {}: {}", id, err);
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn state(&self, connection: ConnectionId, id: i32) -> RegistrationState {
        if read(&self.inner.slots).by_id.contains_key(&(connection, id)) {
            RegistrationState::Registered
        } else {
            RegistrationState::Deregistered
        }
    }

    /// Live registrations of `connection` as `(id, kind)`, by id.
    pub fn registered(&self, connection: ConnectionId) -> Vec<(i32, EventKind)> {
        let slots = read(&self.inner.slots);
        let mut out: Vec<_> = slots
            .by_id
            .iter()
            .filter(|((owner, _), _)| *owner == connection)
            .filter_map(|((_, id), slot)| slots.by_slot.get(slot).map(|r| (*id, r.kind)))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }

    /// Number of live registrations across all connections.
    pub fn len(&self) -> usize {
        read(&self.inner.slots).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
