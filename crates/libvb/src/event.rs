//! Domain event kinds, payloads and the handlers they are delivered to.

use std::{any::Any, convert::TryFrom, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{Error, Result};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Lifecycle = 0,
    Reboot = 1,
    RtcChange = 2,
    Watchdog = 3,
    IoError = 4,
    Graphics = 5,
    IoErrorReason = 6,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Lifecycle,
        EventKind::Reboot,
        EventKind::RtcChange,
        EventKind::Watchdog,
        EventKind::IoError,
        EventKind::Graphics,
        EventKind::IoErrorReason,
    ];

    #[inline]
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Number of positional arguments a handler of this kind receives,
    /// connection, domain and opaque included.
    pub fn arity(self) -> usize {
        match self {
            EventKind::Lifecycle => 5,
            EventKind::Reboot => 3,
            EventKind::RtcChange => 4,
            EventKind::Watchdog => 4,
            EventKind::IoError => 6,
            EventKind::IoErrorReason => 7,
            EventKind::Graphics => 8,
        }
    }
}

impl TryFrom<i32> for EventKind {
    type Error = Error;

    fn try_from(id: i32) -> Result<Self> {
        EventKind::ALL
            .get(usize::try_from(id).map_err(|_| Error::UnknownEventKind(id))?)
            .copied()
            .ok_or(Error::UnknownEventKind(id))
    }
}

/// Connection an event was raised on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub uri: String,
}

/// Domain an event is about. `id` is absent for inactive domains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRef {
    pub name: String,
    pub id: Option<u32>,
}

/// Origin of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub connection: Connection,
    pub domain: DomainRef,
}

impl EventSource {
    pub fn new(uri: impl Into<String>, domain: impl Into<String>, id: Option<u32>) -> Self {
        Self {
            connection: Connection { uri: uri.into() },
            domain: DomainRef {
                name: domain.into(),
                id,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphicsAddress {
    pub family: i32,
    pub node: String,
    pub service: String,
}

/// One `(type, name)` pair of a graphics client's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphicsIdentity {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

/// Event-specific arguments, by kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    Lifecycle {
        event: i32,
        detail: i32,
    },
    Reboot,
    RtcChange {
        utc_offset: i64,
    },
    Watchdog {
        action: i32,
    },
    IoError {
        src_path: String,
        dev_alias: String,
        action: i32,
    },
    IoErrorReason {
        src_path: String,
        dev_alias: String,
        action: i32,
        reason: String,
    },
    Graphics {
        phase: i32,
        local: GraphicsAddress,
        remote: GraphicsAddress,
        auth_scheme: String,
        subject: Vec<GraphicsIdentity>,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Lifecycle { .. } => EventKind::Lifecycle,
            DomainEvent::Reboot => EventKind::Reboot,
            DomainEvent::RtcChange { .. } => EventKind::RtcChange,
            DomainEvent::Watchdog { .. } => EventKind::Watchdog,
            DomainEvent::IoError { .. } => EventKind::IoError,
            DomainEvent::IoErrorReason { .. } => EventKind::IoErrorReason,
            DomainEvent::Graphics { .. } => EventKind::Graphics,
        }
    }
}

/// Caller value handed back verbatim with every event.
#[derive(Clone, Default)]
pub struct Opaque(Option<Arc<dyn Any + Send + Sync>>);

impl Opaque {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref())
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Opaque(..)"),
            None => f.write_str("Opaque(None)"),
        }
    }
}

pub type LifecycleFn = dyn Fn(&Connection, &DomainRef, i32, i32, &Opaque) + Send + Sync;
pub type RebootFn = dyn Fn(&Connection, &DomainRef, &Opaque) + Send + Sync;
pub type RtcChangeFn = dyn Fn(&Connection, &DomainRef, i64, &Opaque) + Send + Sync;
pub type WatchdogFn = dyn Fn(&Connection, &DomainRef, i32, &Opaque) + Send + Sync;
pub type IoErrorFn = dyn Fn(&Connection, &DomainRef, &str, &str, i32, &Opaque) + Send + Sync;
pub type IoErrorReasonFn =
    dyn Fn(&Connection, &DomainRef, &str, &str, i32, &str, &Opaque) + Send + Sync;
pub type GraphicsFn = dyn Fn(
        &Connection,
        &DomainRef,
        i32,
        &GraphicsAddress,
        &GraphicsAddress,
        &str,
        &[GraphicsIdentity],
        &Opaque,
    ) + Send
    + Sync;

/// A user handler with the positional signature of one event kind.
pub enum Handler {
    Lifecycle(Box<LifecycleFn>),
    Reboot(Box<RebootFn>),
    RtcChange(Box<RtcChangeFn>),
    Watchdog(Box<WatchdogFn>),
    IoError(Box<IoErrorFn>),
    IoErrorReason(Box<IoErrorReasonFn>),
    Graphics(Box<GraphicsFn>),
}

impl Handler {
    pub fn lifecycle(
        f: impl Fn(&Connection, &DomainRef, i32, i32, &Opaque) + Send + Sync + 'static,
    ) -> Self {
        Handler::Lifecycle(Box::new(f))
    }

    pub fn reboot(f: impl Fn(&Connection, &DomainRef, &Opaque) + Send + Sync + 'static) -> Self {
        Handler::Reboot(Box::new(f))
    }

    pub fn rtc_change(
        f: impl Fn(&Connection, &DomainRef, i64, &Opaque) + Send + Sync + 'static,
    ) -> Self {
        Handler::RtcChange(Box::new(f))
    }

    pub fn watchdog(
        f: impl Fn(&Connection, &DomainRef, i32, &Opaque) + Send + Sync + 'static,
    ) -> Self {
        Handler::Watchdog(Box::new(f))
    }

    pub fn io_error(
        f: impl Fn(&Connection, &DomainRef, &str, &str, i32, &Opaque) + Send + Sync + 'static,
    ) -> Self {
        Handler::IoError(Box::new(f))
    }

    pub fn io_error_reason(
        f: impl Fn(&Connection, &DomainRef, &str, &str, i32, &str, &Opaque) + Send + Sync + 'static,
    ) -> Self {
        Handler::IoErrorReason(Box::new(f))
    }

    pub fn graphics(
        f: impl Fn(
                &Connection,
                &DomainRef,
                i32,
                &GraphicsAddress,
                &GraphicsAddress,
                &str,
                &[GraphicsIdentity],
                &Opaque,
            ) + Send
            + Sync
            + 'static,
    ) -> Self {
        Handler::Graphics(Box::new(f))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Handler::Lifecycle(_) => EventKind::Lifecycle,
            Handler::Reboot(_) => EventKind::Reboot,
            Handler::RtcChange(_) => EventKind::RtcChange,
            Handler::Watchdog(_) => EventKind::Watchdog,
            Handler::IoError(_) => EventKind::IoError,
            Handler::IoErrorReason(_) => EventKind::IoErrorReason,
            Handler::Graphics(_) => EventKind::Graphics,
        }
    }

    /// Call the handler with the positional arguments of `event`.
    pub(crate) fn invoke(
        &self,
        source: &EventSource,
        event: &DomainEvent,
        opaque: &Opaque,
    ) -> Result<()> {
        let (conn, dom) = (&source.connection, &source.domain);
        match (self, event) {
            (Handler::Lifecycle(f), DomainEvent::Lifecycle { event, detail }) => {
                f(conn, dom, *event, *detail, opaque)
            }
            (Handler::Reboot(f), DomainEvent::Reboot) => f(conn, dom, opaque),
            (Handler::RtcChange(f), DomainEvent::RtcChange { utc_offset }) => {
                f(conn, dom, *utc_offset, opaque)
            }
            (Handler::Watchdog(f), DomainEvent::Watchdog { action }) => {
                f(conn, dom, *action, opaque)
            }
            (
                Handler::IoError(f),
                DomainEvent::IoError {
                    src_path,
                    dev_alias,
                    action,
                },
            ) => f(conn, dom, src_path, dev_alias, *action, opaque),
            (
                Handler::IoErrorReason(f),
                DomainEvent::IoErrorReason {
                    src_path,
                    dev_alias,
                    action,
                    reason,
                },
            ) => f(conn, dom, src_path, dev_alias, *action, reason, opaque),
            (
                Handler::Graphics(f),
                DomainEvent::Graphics {
                    phase,
                    local,
                    remote,
                    auth_scheme,
                    subject,
                },
            ) => f(conn, dom, *phase, local, remote, auth_scheme, subject, opaque),
            (handler, event) => {
                return Err(Error::HandlerContract {
                    kind: handler.kind(),
                    reason: format!(
                        "handler takes {} arguments but a {} event carries {}",
                        handler.kind().arity(),
                        event.kind(),
                        event.kind().arity()
                    ),
                })
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{:?}", self.kind())
    }
}

/// How a registration names its handler.
#[derive(Debug, Clone)]
pub enum HandlerRef {
    Direct(Arc<Handler>),
    /// A handler previously defined on the dispatch table under this name.
    Named(String),
}

impl HandlerRef {
    pub fn named(name: impl Into<String>) -> Self {
        HandlerRef::Named(name.into())
    }
}

impl From<Handler> for HandlerRef {
    fn from(handler: Handler) -> Self {
        HandlerRef::Direct(Arc::new(handler))
    }
}

impl From<Arc<Handler>> for HandlerRef {
    fn from(handler: Arc<Handler>) -> Self {
        HandlerRef::Direct(handler)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_event_ids() {
        for (id, kind) in EventKind::ALL.iter().enumerate() {
            assert_eq!(kind.id(), id as i32);
            assert_eq!(EventKind::try_from(id as i32).unwrap(), *kind);
        }
        assert!(matches!(EventKind::try_from(7), Err(Error::UnknownEventKind(7))));
        assert!(matches!(EventKind::try_from(-1), Err(Error::UnknownEventKind(-1))));
        assert_eq!(EventKind::from_str("io_error_reason").unwrap(), EventKind::IoErrorReason);
        assert_eq!(EventKind::RtcChange.to_string(), "rtc_change");
    }

    #[test]
    fn test_opaque_downcast() {
        let opaque = Opaque::new("x");
        assert_eq!(opaque.downcast_ref::<&str>(), Some(&"x"));
        assert_eq!(opaque.downcast_ref::<u32>(), None);
        assert!(Opaque::none().downcast_ref::<&str>().is_none());
    }

    #[test]
    fn test_shape_mismatch() {
        let handler = Handler::reboot(|_, _, _| {});
        let source = EventSource::new("test:///default", "vm", Some(1));
        let err = handler
            .invoke(&source, &DomainEvent::Watchdog { action: 1 }, &Opaque::none())
            .unwrap_err();
        assert!(matches!(err, Error::HandlerContract { kind: EventKind::Reboot, .. }));
        handler.invoke(&source, &DomainEvent::Reboot, &Opaque::none()).unwrap();
    }
}
