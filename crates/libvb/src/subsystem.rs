//! The seam to the underlying virtualization subsystem.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{codec::RawParams, dispatch::EventAdapter, error::SubsystemError, event::EventKind};

/// Category of managed object a listing targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Domain,
    Network,
    StoragePool,
    Interface,
    NodeDevice,
    Secret,
    NwFilter,
    Snapshot,
    /// Direct children of one snapshot.
    SnapshotChild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Activity {
    #[default]
    Active,
    Defined,
}

impl ResourceKind {
    /// Names of the count and list entry points, for diagnostics.
    pub fn ops(self, activity: Activity) -> (&'static str, &'static str) {
        use Activity::*;
        use ResourceKind::*;
        match (self, activity) {
            (Domain, Active) => ("virConnectNumOfDomains", "virConnectListDomains"),
            (Domain, Defined) => (
                "virConnectNumOfDefinedDomains",
                "virConnectListDefinedDomains",
            ),
            (Network, Active) => ("virConnectNumOfNetworks", "virConnectListNetworks"),
            (Network, Defined) => (
                "virConnectNumOfDefinedNetworks",
                "virConnectListDefinedNetworks",
            ),
            (StoragePool, Active) => (
                "virConnectNumOfStoragePools",
                "virConnectListStoragePools",
            ),
            (StoragePool, Defined) => (
                "virConnectNumOfDefinedStoragePools",
                "virConnectListDefinedStoragePools",
            ),
            (Interface, Active) => ("virConnectNumOfInterfaces", "virConnectListInterfaces"),
            (Interface, Defined) => (
                "virConnectNumOfDefinedInterfaces",
                "virConnectListDefinedInterfaces",
            ),
            (NodeDevice, _) => ("virNodeNumOfDevices", "virNodeListDevices"),
            (Secret, _) => ("virConnectNumOfSecrets", "virConnectListSecrets"),
            (NwFilter, _) => ("virConnectNumOfNWFilters", "virConnectListNWFilters"),
            (Snapshot, _) => ("virDomainSnapshotNum", "virDomainSnapshotListNames"),
            (SnapshotChild, _) => (
                "virDomainSnapshotNumChildren",
                "virDomainSnapshotListChildrenNames",
            ),
        }
    }

    /// Only domains, networks, storage pools and interfaces have a defined
    /// (inactive) listing.
    pub fn has_defined_listing(self) -> bool {
        matches!(
            self,
            ResourceKind::Domain
                | ResourceKind::Network
                | ResourceKind::StoragePool
                | ResourceKind::Interface
        )
    }
}

/// Narrows a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub activity: Activity,
    /// Node device capability, e.g. `pci`.
    pub capability: Option<String>,
    /// Owning domain of a snapshot listing.
    pub domain: Option<String>,
    /// Parent snapshot of a snapshot child listing.
    pub snapshot: Option<String>,
    pub flags: u32,
}

impl Selector {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn defined() -> Self {
        Self {
            activity: Activity::Defined,
            ..Self::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn of_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn of_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// Owner of a typed parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamTarget {
    Scheduler { domain: String },
    Memory { domain: String },
    Blkio { domain: String },
    NodeMemory,
}

/// Entry point names for one parameter target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamOps {
    pub probe: &'static str,
    pub get: &'static str,
    pub set: &'static str,
}

impl ParamTarget {
    pub fn ops(&self) -> ParamOps {
        match self {
            ParamTarget::Scheduler { .. } => ParamOps {
                probe: "virDomainGetSchedulerType",
                get: "virDomainGetSchedulerParametersFlags",
                set: "virDomainSetSchedulerParametersFlags",
            },
            ParamTarget::Memory { .. } => ParamOps {
                probe: "virDomainGetMemoryParameters",
                get: "virDomainGetMemoryParameters",
                set: "virDomainSetMemoryParameters",
            },
            ParamTarget::Blkio { .. } => ParamOps {
                probe: "virDomainGetBlkioParameters",
                get: "virDomainGetBlkioParameters",
                set: "virDomainSetBlkioParameters",
            },
            ParamTarget::NodeMemory => ParamOps {
                probe: "virNodeGetMemoryParameters",
                get: "virNodeGetMemoryParameters",
                set: "virNodeSetMemoryParameters",
            },
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            ParamTarget::Scheduler { domain }
            | ParamTarget::Memory { domain }
            | ParamTarget::Blkio { domain } => Some(domain),
            ParamTarget::NodeMemory => None,
        }
    }
}

impl fmt::Display for ParamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamTarget::Scheduler { domain } => {
                write!(f, "scheduler parameters of domain {domain}")
            }
            ParamTarget::Memory { domain } => write!(f, "memory parameters of domain {domain}"),
            ParamTarget::Blkio { domain } => write!(f, "blkio parameters of domain {domain}"),
            ParamTarget::NodeMemory => write!(f, "node memory parameters"),
        }
    }
}

/// Host statistics source. `-1` selects the aggregate over all CPUs or cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsTarget {
    Cpu(i32),
    Memory(i32),
}

impl StatsTarget {
    pub fn op(self) -> &'static str {
        match self {
            StatsTarget::Cpu(_) => "virNodeGetCPUStats",
            StatsTarget::Memory(_) => "virNodeGetMemoryStats",
        }
    }
}

impl fmt::Display for StatsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsTarget::Cpu(-1) => write!(f, "cpu stats of all cpus"),
            StatsTarget::Cpu(n) => write!(f, "cpu stats of cpu {n}"),
            StatsTarget::Memory(-1) => write!(f, "memory stats of all cells"),
            StatsTarget::Memory(n) => write!(f, "memory stats of cell {n}"),
        }
    }
}

/// One `{field, value}` record of a node statistics array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub field: String,
    pub value: u64,
}

impl NodeStat {
    pub fn new(field: impl Into<String>, value: u64) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

/// Entry points of the virtualization subsystem.
///
/// Every `fetch_*`/`get_*` call receives a destination sized from the
/// preceding probe and returns how many entries it actually filled.
pub trait Subsystem {
    /// Connection URI, used as diagnostic context.
    fn uri(&self) -> String;

    fn probe_count(&self, kind: ResourceKind, selector: &Selector) -> Result<usize, SubsystemError>;

    fn fetch_names(
        &self,
        kind: ResourceKind,
        selector: &Selector,
        dest: &mut [String],
    ) -> Result<usize, SubsystemError>;

    /// Active domains are listed by id rather than by name.
    fn fetch_domain_ids(&self, dest: &mut [u32]) -> Result<usize, SubsystemError>;

    fn probe_parameters(&self, target: &ParamTarget, flags: u32) -> Result<usize, SubsystemError>;

    fn get_parameters(
        &self,
        target: &ParamTarget,
        dest: &mut RawParams,
        flags: u32,
    ) -> Result<usize, SubsystemError>;

    fn set_parameters(
        &self,
        target: &ParamTarget,
        params: &RawParams,
        flags: u32,
    ) -> Result<(), SubsystemError>;

    fn probe_stats(&self, target: StatsTarget, flags: u32) -> Result<usize, SubsystemError>;

    fn fetch_stats(
        &self,
        target: StatsTarget,
        dest: &mut [NodeStat],
        flags: u32,
    ) -> Result<usize, SubsystemError>;

    /// Arrange for `adapter` to be called with every matching event, from any
    /// thread, until deregistered.
    fn register_event(
        &self,
        domain: Option<&str>,
        kind: EventKind,
        adapter: EventAdapter,
    ) -> Result<i32, SubsystemError>;

    fn deregister_event(&self, id: i32) -> Result<(), SubsystemError>;
}

impl<S: Subsystem + ?Sized> Subsystem for Box<S> {
    fn uri(&self) -> String {
        (**self).uri()
    }

    fn probe_count(
        &self,
        kind: ResourceKind,
        selector: &Selector,
    ) -> Result<usize, SubsystemError> {
        (**self).probe_count(kind, selector)
    }

    fn fetch_names(
        &self,
        kind: ResourceKind,
        selector: &Selector,
        dest: &mut [String],
    ) -> Result<usize, SubsystemError> {
        (**self).fetch_names(kind, selector, dest)
    }

    fn fetch_domain_ids(&self, dest: &mut [u32]) -> Result<usize, SubsystemError> {
        (**self).fetch_domain_ids(dest)
    }

    fn probe_parameters(&self, target: &ParamTarget, flags: u32) -> Result<usize, SubsystemError> {
        (**self).probe_parameters(target, flags)
    }

    fn get_parameters(
        &self,
        target: &ParamTarget,
        dest: &mut RawParams,
        flags: u32,
    ) -> Result<usize, SubsystemError> {
        (**self).get_parameters(target, dest, flags)
    }

    fn set_parameters(
        &self,
        target: &ParamTarget,
        params: &RawParams,
        flags: u32,
    ) -> Result<(), SubsystemError> {
        (**self).set_parameters(target, params, flags)
    }

    fn probe_stats(&self, target: StatsTarget, flags: u32) -> Result<usize, SubsystemError> {
        (**self).probe_stats(target, flags)
    }

    fn fetch_stats(
        &self,
        target: StatsTarget,
        dest: &mut [NodeStat],
        flags: u32,
    ) -> Result<usize, SubsystemError> {
        (**self).fetch_stats(target, dest, flags)
    }

    fn register_event(
        &self,
        domain: Option<&str>,
        kind: EventKind,
        adapter: EventAdapter,
    ) -> Result<i32, SubsystemError> {
        (**self).register_event(domain, kind, adapter)
    }

    fn deregister_event(&self, id: i32) -> Result<(), SubsystemError> {
        (**self).deregister_event(id)
    }
}
