use log::debug;

use crate::{
    codec,
    dispatch::{ConnectionId, DispatchTable, RegistrationState},
    error::{Error, Result},
    event::{EventKind, HandlerRef, Opaque},
    params::ParameterSet,
    query::{self, DomainIdListing, NameListing, ParameterListing, StatsListing},
    subsystem::{Activity, ParamTarget, ResourceKind, Selector, StatsTarget, Subsystem},
    typed::{ParamValue, TypedValue},
};

/// High level operations over one subsystem connection.
pub struct Binding<S> {
    subsystem: S,
    table: DispatchTable,
    connection: ConnectionId,
}

impl<S: Subsystem> Binding<S> {
    /// Bind `subsystem`, registering events on the process wide table.
    pub fn new(subsystem: S) -> Self {
        Self::with_table(subsystem, DispatchTable::global().clone())
    }

    pub fn with_table(subsystem: S, table: DispatchTable) -> Self {
        let connection = table.connection();
        Self {
            subsystem,
            table,
            connection,
        }
    }

    pub fn subsystem(&self) -> &S {
        &self.subsystem
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    fn check_selector(kind: ResourceKind, selector: &Selector) -> Result<()> {
        if selector.activity == Activity::Defined && !kind.has_defined_listing() {
            return Err(Error::invalid("activity", format!("{kind} has no defined listing")));
        }
        if matches!(kind, ResourceKind::Snapshot | ResourceKind::SnapshotChild)
            && selector.domain.is_none()
        {
            return Err(Error::invalid("domain", "snapshot listing needs a domain"));
        }
        if kind == ResourceKind::SnapshotChild && selector.snapshot.is_none() {
            return Err(Error::invalid("snapshot", "child listing needs a parent snapshot"));
        }
        Ok(())
    }

    /// Number of `kind` resources, without listing them.
    pub fn count(&self, kind: ResourceKind, selector: &Selector) -> Result<usize> {
        Self::check_selector(kind, selector)?;
        self.subsystem.probe_count(kind, selector).map_err(|source| {
            let (op, _) = kind.ops(selector.activity);
            Error::query(
                op,
                format!("{} {} count on {}", selector.activity, kind, self.subsystem.uri()),
                source,
            )
        })
    }

    /// Names of `kind` resources. Running domains have no name listing, use
    /// [`Binding::list_domain_ids`].
    pub fn list_names(&self, kind: ResourceKind, selector: &Selector) -> Result<Vec<String>> {
        if kind == ResourceKind::Domain && selector.activity == Activity::Active {
            return Err(Error::invalid("activity", "active domains are listed by id"));
        }
        Self::check_selector(kind, selector)?;
        query::run(&NameListing {
            subsystem: &self.subsystem,
            kind,
            selector,
        })
    }

    pub fn list_domain_ids(&self) -> Result<Vec<u32>> {
        query::run(&DomainIdListing {
            subsystem: &self.subsystem,
        })
    }

    pub fn parameters(&self, target: &ParamTarget, flags: u32) -> Result<ParameterSet> {
        let raw = query::run(&ParameterListing {
            subsystem: &self.subsystem,
            target,
            flags,
        })?;
        raw.decode()
    }

    /// Change some of `target`'s parameters.
    ///
    /// Each input value is converted to the type the subsystem currently
    /// reports for that name; names it does not report are rejected. Only the
    /// input entries are sent.
    pub fn set_parameters(
        &self,
        target: &ParamTarget,
        input: &ParameterSet,
        flags: u32,
    ) -> Result<()> {
        if input.is_empty() {
            debug!("nothing to set for {}", target);
            return Ok(());
        }

        let current = self.parameters(target, flags)?;
        let mut coerced = ParameterSet::with_capacity(input.len());
        for entry in input {
            let Some(existing) = current.get(&entry.name) else {
                return Err(Error::invalid(&entry.name, format!("not one of the {target}")));
            };
            let value = entry.value.clone().coerce(&entry.name, existing.kind())?;
            coerced.insert(entry.name.clone(), value);
        }

        let raw = codec::encode(&coerced)?;
        debug!("setting {} of {} on {}", raw.len(), target, self.subsystem.uri());
        self.subsystem
            .set_parameters(target, &raw, flags)
            .map_err(|source| {
                Error::query(
                    target.ops().set,
                    format!("{} on {}", target, self.subsystem.uri()),
                    source,
                )
            })
    }

    /// Host statistics as `UInt64` parameters.
    pub fn node_stats(&self, target: StatsTarget, flags: u32) -> Result<ParameterSet> {
        let stats = query::run(&StatsListing {
            subsystem: &self.subsystem,
            target,
            flags,
        })?;
        Ok(stats
            .into_iter()
            .map(|stat| TypedValue::new(stat.field, ParamValue::UInt64(stat.value)))
            .collect())
    }

    pub fn register_event(
        &self,
        kind: EventKind,
        handler: impl Into<HandlerRef>,
        domain: Option<&str>,
        opaque: Opaque,
    ) -> Result<i32> {
        self.table.register(
            self.connection,
            &self.subsystem,
            kind,
            handler,
            domain,
            opaque,
        )
    }

    pub fn deregister_event(&self, id: i32) -> Result<()> {
        self.table.deregister(self.connection, &self.subsystem, id)
    }

    pub fn deregister_all(&self) -> Result<()> {
        self.table.deregister_all(self.connection, &self.subsystem)
    }

    pub fn registration_state(&self, id: i32) -> RegistrationState {
        self.table.state(self.connection, id)
    }

    /// This connection's live registrations as `(id, kind)`.
    pub fn registered(&self) -> Vec<(i32, EventKind)> {
        self.table.registered(self.connection)
    }
}
