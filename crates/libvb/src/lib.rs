//! Typed parameters, count-then-fetch queries and event dispatch for a
//! libvirt-style virtualization subsystem.

pub mod binding;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod params;
pub mod query;
pub mod subsystem;
pub mod typed;


pub use binding::Binding;
pub use codec::{decode, encode, RawParams, RawTypedParam, FIELD_LENGTH};
pub use dispatch::{ConnectionId, DispatchTable, EventAdapter, RegistrationState};
pub use error::{Error, Result, SubsystemError};
pub use event::{
    Connection, DomainEvent, DomainRef, EventKind, EventSource, GraphicsAddress, GraphicsIdentity,
    Handler, HandlerRef, Opaque,
};
pub use params::ParameterSet;
pub use subsystem::{
    Activity, NodeStat, ParamTarget, ResourceKind, Selector, StatsTarget, Subsystem,
};
pub use typed::{ParamKind, ParamValue, TypedValue};
