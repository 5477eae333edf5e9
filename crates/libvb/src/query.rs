//! Count-then-fetch retrieval of variable-length lists.
//!
//! The subsystem is asked how many entries exist, a buffer of exactly that
//! size is allocated, and the subsystem fills it, reporting how many entries
//! it actually wrote. The list may change between the two calls; the result
//! is truncated to what the second call reported.

use log::{debug, warn};

use crate::{
    codec::RawParams,
    error::{Error, Result, SubsystemError},
    subsystem::{NodeStat, ParamTarget, ResourceKind, Selector, StatsTarget, Subsystem},
};

/// Destination of a fetch, sized from the probe.
pub trait QueryBuffer: Sized {
    fn with_len(len: usize) -> Self;

    fn len(&self) -> usize;

    /// Drop (and release) everything past `len`.
    fn truncate(&mut self, len: usize);
}

impl<T: Default + Clone> QueryBuffer for Vec<T> {
    fn with_len(len: usize) -> Self {
        vec![T::default(); len]
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn truncate(&mut self, len: usize) {
        Vec::truncate(self, len)
    }
}

impl QueryBuffer for RawParams {
    fn with_len(len: usize) -> Self {
        RawParams::zeroed(len)
    }

    fn len(&self) -> usize {
        RawParams::len(self)
    }

    fn truncate(&mut self, len: usize) {
        RawParams::truncate(self, len)
    }
}

/// Diagnostic context of a query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub probe_op: &'static str,
    pub fetch_op: &'static str,
    pub resource: String,
}

pub trait TwoPhase {
    type Buffer: QueryBuffer;

    fn probe(&self) -> std::result::Result<usize, SubsystemError>;

    fn fetch(&self, buffer: &mut Self::Buffer) -> std::result::Result<usize, SubsystemError>;

    fn context(&self) -> QueryContext;
}

/// Run both phases of `query`.
///
/// A zero probe returns an empty buffer without issuing the fetch. On fetch
/// failure the buffer is released before the error is returned.
pub fn run<Q: TwoPhase + ?Sized>(query: &Q) -> Result<Q::Buffer> {
    let count = match query.probe() {
        Ok(count) => count,
        Err(source) => {
            let ctx = query.context();
            return Err(Error::query(ctx.probe_op, ctx.resource, source));
        }
    };

    if count == 0 {
        return Ok(Q::Buffer::with_len(0));
    }

    let mut buffer = Q::Buffer::with_len(count);
    let filled = match query.fetch(&mut buffer) {
        Ok(filled) => filled,
        Err(source) => {
            drop(buffer);
            let ctx = query.context();
            return Err(Error::query(ctx.fetch_op, ctx.resource, source));
        }
    };

    if filled > count {
        let ctx = query.context();
        warn!(
            "{} reported {} entries for {} but only {} were allocated",
            ctx.fetch_op, filled, ctx.resource, count
        );
    } else if filled < count {
        debug!("list shrank from {} to {} between probe and fetch", count, filled);
    }

    buffer.truncate(filled.min(count));
    Ok(buffer)
}

/// Names of one resource kind.
pub struct NameListing<'a, S: ?Sized> {
    pub subsystem: &'a S,
    pub kind: ResourceKind,
    pub selector: &'a Selector,
}

impl<S: Subsystem + ?Sized> TwoPhase for NameListing<'_, S> {
    type Buffer = Vec<String>;

    fn probe(&self) -> std::result::Result<usize, SubsystemError> {
        self.subsystem.probe_count(self.kind, self.selector)
    }

    fn fetch(&self, buffer: &mut Vec<String>) -> std::result::Result<usize, SubsystemError> {
        self.subsystem.fetch_names(self.kind, self.selector, buffer)
    }

    fn context(&self) -> QueryContext {
        let (probe_op, fetch_op) = self.kind.ops(self.selector.activity);
        let mut resource = format!("{} {} list", self.selector.activity, self.kind);
        if let Some(domain) = &self.selector.domain {
            resource.push_str(&format!(" of domain {domain}"));
        }
        if let Some(capability) = &self.selector.capability {
            resource.push_str(&format!(" with capability {capability}"));
        }
        resource.push_str(&format!(" on {}", self.subsystem.uri()));
        QueryContext {
            probe_op,
            fetch_op,
            resource,
        }
    }
}

/// Ids of running domains.
pub struct DomainIdListing<'a, S: ?Sized> {
    pub subsystem: &'a S,
}

impl<S: Subsystem + ?Sized> TwoPhase for DomainIdListing<'_, S> {
    type Buffer = Vec<u32>;

    fn probe(&self) -> std::result::Result<usize, SubsystemError> {
        self.subsystem.probe_count(ResourceKind::Domain, &Selector::active())
    }

    fn fetch(&self, buffer: &mut Vec<u32>) -> std::result::Result<usize, SubsystemError> {
        self.subsystem.fetch_domain_ids(buffer)
    }

    fn context(&self) -> QueryContext {
        QueryContext {
            probe_op: "virConnectNumOfDomains",
            fetch_op: "virConnectListDomains",
            resource: format!("active domain ids on {}", self.subsystem.uri()),
        }
    }
}

/// Typed parameters of one target.
pub struct ParameterListing<'a, S: ?Sized> {
    pub subsystem: &'a S,
    pub target: &'a ParamTarget,
    pub flags: u32,
}

impl<S: Subsystem + ?Sized> TwoPhase for ParameterListing<'_, S> {
    type Buffer = RawParams;

    fn probe(&self) -> std::result::Result<usize, SubsystemError> {
        self.subsystem.probe_parameters(self.target, self.flags)
    }

    fn fetch(&self, buffer: &mut RawParams) -> std::result::Result<usize, SubsystemError> {
        self.subsystem.get_parameters(self.target, buffer, self.flags)
    }

    fn context(&self) -> QueryContext {
        let ops = self.target.ops();
        QueryContext {
            probe_op: ops.probe,
            fetch_op: ops.get,
            resource: format!("{} on {}", self.target, self.subsystem.uri()),
        }
    }
}

/// Node statistics records.
pub struct StatsListing<'a, S: ?Sized> {
    pub subsystem: &'a S,
    pub target: StatsTarget,
    pub flags: u32,
}

impl<S: Subsystem + ?Sized> TwoPhase for StatsListing<'_, S> {
    type Buffer = Vec<NodeStat>;

    fn probe(&self) -> std::result::Result<usize, SubsystemError> {
        self.subsystem.probe_stats(self.target, self.flags)
    }

    fn fetch(&self, buffer: &mut Vec<NodeStat>) -> std::result::Result<usize, SubsystemError> {
        self.subsystem.fetch_stats(self.target, buffer, self.flags)
    }

    fn context(&self) -> QueryContext {
        QueryContext {
            probe_op: self.target.op(),
            fetch_op: self.target.op(),
            resource: format!("{} on {}", self.target, self.subsystem.uri()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use proptest::prelude::*;

    use super::*;

    struct Scripted {
        probe: std::result::Result<usize, SubsystemError>,
        fetch: std::result::Result<usize, SubsystemError>,
        fetched: Cell<Option<usize>>,
    }

    impl Scripted {
        fn new(probe: usize, fetch: usize) -> Self {
            Self {
                probe: Ok(probe),
                fetch: Ok(fetch),
                fetched: Cell::new(None),
            }
        }
    }

    impl TwoPhase for Scripted {
        type Buffer = Vec<u32>;

        fn probe(&self) -> std::result::Result<usize, SubsystemError> {
            self.probe.clone()
        }

        fn fetch(&self, buffer: &mut Vec<u32>) -> std::result::Result<usize, SubsystemError> {
            self.fetched.set(Some(buffer.len()));
            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = i as u32 + 1;
            }
            self.fetch.clone()
        }

        fn context(&self) -> QueryContext {
            QueryContext {
                probe_op: "count",
                fetch_op: "list",
                resource: "things".to_string(),
            }
        }
    }

    #[test]
    fn test_zero_probe_skips_fetch() {
        let query = Scripted::new(0, 5);
        let out = run(&query).unwrap();
        assert!(out.is_empty());
        assert_eq!(query.fetched.get(), None);
    }

    #[test]
    fn test_buffer_sized_from_probe_and_truncated() {
        let query = Scripted::new(3, 2);
        let out = run(&query).unwrap();
        assert_eq!(query.fetched.get(), Some(3));
        assert_eq!(out, vec![1, 2]);
    }

    proptest! {
        #[test]
        fn result_length_follows_fetch(probe in 0usize..64, fetch in 0usize..64) {
            let query = Scripted::new(probe, fetch);
            let out = run(&query).unwrap();
            if probe == 0 {
                prop_assert!(out.is_empty());
                prop_assert_eq!(query.fetched.get(), None);
            } else {
                prop_assert_eq!(query.fetched.get(), Some(probe));
                prop_assert_eq!(out.len(), fetch.min(probe));
            }
        }
    }

    #[test]
    fn test_over_report_is_clamped() {
        let query = Scripted::new(2, 7);
        assert_eq!(run(&query).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_failures_name_their_phase() {
        let query = Scripted {
            probe: Err(SubsystemError::new(1, "boom")),
            ..Scripted::new(0, 0)
        };
        match run(&query) {
            Err(Error::Query { op, resource, .. }) => {
                assert_eq!(op, "count");
                assert_eq!(resource, "things");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(query.fetched.get(), None);

        let query = Scripted {
            fetch: Err(SubsystemError::new(2, "gone")),
            ..Scripted::new(4, 0)
        };
        match run(&query) {
            Err(Error::Query { op, source, .. }) => {
                assert_eq!(op, "list");
                assert_eq!(source.code, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
