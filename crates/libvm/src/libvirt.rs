//! The subsystem seam on top of the libvirt bindings.
use std::{
    ffi::CString,
    os::raw::{c_char, c_int, c_longlong, c_void},
    panic::{catch_unwind, AssertUnwindSafe},
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};

use libvb::{
    Activity, DomainEvent, EventAdapter, EventKind, EventSource, GraphicsAddress, GraphicsIdentity,
    NodeStat, ParamTarget, RawParams, RawTypedParam, ResourceKind, Selector, StatsTarget, Subsystem,
    SubsystemError,
};
use log::{debug, error, warn};
use virt::{connect::Connect, sys};

use crate::cstr::{copy_cstr, field_name, take_cstr};

/// Errors from this module.
#[derive(Debug, thiserror::Error)]
pub enum VirtError {
    /// Error connecting to libvirtd.
    #[error("couldn't connect to the libvirt daemon at {0}")]
    Connect(String, #[source] virt::error::Error),

    /// Error installing the default event loop.
    #[error("couldn't register the default event loop implementation")]
    EventImpl(#[source] SubsystemError),

    /// Error running the event loop.
    #[error("event loop iteration failed")]
    EventLoop(#[source] SubsystemError),
}

const _: () =
    assert!(std::mem::size_of::<RawTypedParam>() == std::mem::size_of::<sys::virTypedParameter>());

/// Wake up interval of the event loop, so a stop request is noticed.
const STOP_POLL_MS: c_int = 500;

fn last_error() -> SubsystemError {
    unsafe {
        let err = sys::virGetLastError();
        if err.is_null() {
            return SubsystemError::new(-1, "unknown libvirt error");
        }
        SubsystemError {
            code: (*err).code,
            domain: (*err).domain,
            message: copy_cstr((*err).message).unwrap_or_default(),
        }
    }
}

fn check(ret: c_int) -> Result<usize, SubsystemError> {
    if ret < 0 {
        Err(last_error())
    } else {
        Ok(ret as usize)
    }
}

fn cstring(s: &str) -> Result<CString, SubsystemError> {
    CString::new(s).map_err(|_| SubsystemError::new(-1, format!("{s:?} contains a NUL byte")))
}

fn max_len(len: usize) -> c_int {
    c_int::try_from(len).unwrap_or(c_int::MAX)
}

static EVENT_IMPL: OnceLock<Result<(), SubsystemError>> = OnceLock::new();

/// Install libvirt's default event loop. Must happen before the first
/// connection for events to be delivered.
fn register_event_impl() -> Result<(), VirtError> {
    EVENT_IMPL
        .get_or_init(|| check(unsafe { sys::virEventRegisterDefaultImpl() }).map(|_| ()))
        .clone()
        .map_err(VirtError::EventImpl)
}

unsafe extern "C" fn tick(_: c_int, _: *mut c_void) {}

/// Drive the default event loop until `stop` is set.
pub fn run_event_loop(stop: &AtomicBool) -> anyhow::Result<()> {
    register_event_impl()?;
    let timer =
        unsafe { sys::virEventAddTimeout(STOP_POLL_MS, Some(tick), ptr::null_mut(), None) };
    if timer < 0 {
        return Err(VirtError::EventLoop(last_error()).into());
    }

    debug!("running libvirt event loop");
    let mut result = Ok(());
    while !stop.load(Ordering::SeqCst) {
        if unsafe { sys::virEventRunDefaultImpl() } < 0 {
            result = Err(VirtError::EventLoop(last_error()).into());
            break;
        }
    }

    unsafe { sys::virEventRemoveTimeout(timer) };
    result
}

struct DomainHandle(sys::virDomainPtr);

impl Drop for DomainHandle {
    fn drop(&mut self) {
        unsafe { sys::virDomainFree(self.0) };
    }
}

struct SnapshotHandle(sys::virDomainSnapshotPtr);

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        unsafe { sys::virDomainSnapshotFree(self.0) };
    }
}

type CountFn = unsafe extern "C" fn(sys::virConnectPtr) -> c_int;
type ListFn = unsafe extern "C" fn(sys::virConnectPtr, *mut *mut c_char, c_int) -> c_int;

/// Connection level count/list pair. Active domains have no name listing.
fn connect_calls(
    kind: ResourceKind,
    activity: Activity,
) -> Result<(CountFn, Option<ListFn>), SubsystemError> {
    use Activity::*;
    use ResourceKind::*;
    Ok(match (kind, activity) {
        (Domain, Active) => (sys::virConnectNumOfDomains as CountFn, None),
        (Domain, Defined) => (
            sys::virConnectNumOfDefinedDomains as CountFn,
            Some(sys::virConnectListDefinedDomains as ListFn),
        ),
        (Network, Active) => (
            sys::virConnectNumOfNetworks as CountFn,
            Some(sys::virConnectListNetworks as ListFn),
        ),
        (Network, Defined) => (
            sys::virConnectNumOfDefinedNetworks as CountFn,
            Some(sys::virConnectListDefinedNetworks as ListFn),
        ),
        (StoragePool, Active) => (
            sys::virConnectNumOfStoragePools as CountFn,
            Some(sys::virConnectListStoragePools as ListFn),
        ),
        (StoragePool, Defined) => (
            sys::virConnectNumOfDefinedStoragePools as CountFn,
            Some(sys::virConnectListDefinedStoragePools as ListFn),
        ),
        (Interface, Active) => (
            sys::virConnectNumOfInterfaces as CountFn,
            Some(sys::virConnectListInterfaces as ListFn),
        ),
        (Interface, Defined) => (
            sys::virConnectNumOfDefinedInterfaces as CountFn,
            Some(sys::virConnectListDefinedInterfaces as ListFn),
        ),
        (Secret, _) => (
            sys::virConnectNumOfSecrets as CountFn,
            Some(sys::virConnectListSecrets as ListFn),
        ),
        (NwFilter, _) => (
            sys::virConnectNumOfNWFilters as CountFn,
            Some(sys::virConnectListNWFilters as ListFn),
        ),
        (NodeDevice, _) | (Snapshot, _) | (SnapshotChild, _) => {
            return Err(SubsystemError::new(
                -1,
                format!("{kind} is not listed on the connection"),
            ))
        }
    })
}

/// Access libvirt for all the things this program needs.
pub struct Libvirt {
    conn: Connect,
    uri: String,
}

impl Libvirt {
    pub fn connect(uri: &str) -> anyhow::Result<Self> {
        register_event_impl()?;
        debug!("connecting to libvirtd {}", uri);
        let conn = Connect::open(uri).map_err(|e| VirtError::Connect(uri.to_string(), e))?;
        Ok(Self {
            conn,
            uri: uri.to_string(),
        })
    }

    #[inline]
    fn ptr(&self) -> sys::virConnectPtr {
        self.conn.as_ptr()
    }

    fn lookup(&self, name: &str) -> Result<DomainHandle, SubsystemError> {
        let name = cstring(name)?;
        let dom = unsafe { sys::virDomainLookupByName(self.ptr(), name.as_ptr()) };
        if dom.is_null() {
            return Err(last_error());
        }
        Ok(DomainHandle(dom))
    }

    fn snapshot_domain(&self, selector: &Selector) -> Result<DomainHandle, SubsystemError> {
        let Some(domain) = &selector.domain else {
            return Err(SubsystemError::new(-1, "snapshot listing needs a domain"));
        };
        self.lookup(domain)
    }

    fn parent_snapshot(&self, selector: &Selector) -> Result<SnapshotHandle, SubsystemError> {
        let dom = self.snapshot_domain(selector)?;
        let Some(name) = &selector.snapshot else {
            return Err(SubsystemError::new(-1, "child listing needs a parent snapshot"));
        };
        let name = cstring(name)?;
        let snap = unsafe { sys::virDomainSnapshotLookupByName(dom.0, name.as_ptr(), 0) };
        if snap.is_null() {
            return Err(last_error());
        }
        Ok(SnapshotHandle(snap))
    }

    fn target_domain(&self, target: &ParamTarget) -> Result<Option<DomainHandle>, SubsystemError> {
        target.domain().map(|d| self.lookup(d)).transpose()
    }
}

impl Drop for Libvirt {
    fn drop(&mut self) {
        debug!("closing connection to {}", self.uri);
        if let Err(e) = self.conn.close() {
            warn!("failed to close connection to {}: {}", self.uri, e);
        }
    }
}

fn dom_ptr(dom: &Option<DomainHandle>) -> sys::virDomainPtr {
    dom.as_ref().map_or(ptr::null_mut(), |d| d.0)
}

/// Release function for records whose strings libvirt allocated.
unsafe fn clear_params(params: *mut RawTypedParam, len: usize) {
    sys::virTypedParamsClear(params.cast(), max_len(len));
}

impl Subsystem for Libvirt {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn probe_count(
        &self,
        kind: ResourceKind,
        selector: &Selector,
    ) -> Result<usize, SubsystemError> {
        let ret = match kind {
            ResourceKind::NodeDevice => {
                let cap = selector.capability.as_deref().map(cstring).transpose()?;
                let cap = cap.as_ref().map_or(ptr::null(), |c| c.as_ptr());
                unsafe { sys::virNodeNumOfDevices(self.ptr(), cap, selector.flags) }
            }
            ResourceKind::Snapshot => {
                let dom = self.snapshot_domain(selector)?;
                unsafe { sys::virDomainSnapshotNum(dom.0, selector.flags) }
            }
            ResourceKind::SnapshotChild => {
                let snap = self.parent_snapshot(selector)?;
                unsafe { sys::virDomainSnapshotNumChildren(snap.0, selector.flags) }
            }
            _ => {
                let (count, _) = connect_calls(kind, selector.activity)?;
                unsafe { count(self.ptr()) }
            }
        };
        check(ret)
    }

    fn fetch_names(
        &self,
        kind: ResourceKind,
        selector: &Selector,
        dest: &mut [String],
    ) -> Result<usize, SubsystemError> {
        let mut raw: Vec<*mut c_char> = vec![ptr::null_mut(); dest.len()];
        let max = max_len(raw.len());
        let ret = match kind {
            ResourceKind::NodeDevice => {
                let cap = selector.capability.as_deref().map(cstring).transpose()?;
                let cap = cap.as_ref().map_or(ptr::null(), |c| c.as_ptr());
                unsafe {
                    sys::virNodeListDevices(self.ptr(), cap, raw.as_mut_ptr(), max, selector.flags)
                }
            }
            ResourceKind::Snapshot => {
                let dom = self.snapshot_domain(selector)?;
                unsafe {
                    sys::virDomainSnapshotListNames(dom.0, raw.as_mut_ptr(), max, selector.flags)
                }
            }
            ResourceKind::SnapshotChild => {
                let snap = self.parent_snapshot(selector)?;
                unsafe {
                    sys::virDomainSnapshotListChildrenNames(
                        snap.0,
                        raw.as_mut_ptr(),
                        max,
                        selector.flags,
                    )
                }
            }
            _ => {
                let (_, Some(list)) = connect_calls(kind, selector.activity)? else {
                    return Err(SubsystemError::new(-1, "active domains are listed by id"));
                };
                unsafe { list(self.ptr(), raw.as_mut_ptr(), max) }
            }
        };
        let reported = check(ret)?;

        let filled = reported.min(raw.len());
        for (slot, name) in dest.iter_mut().zip(&raw[..filled]) {
            *slot = unsafe { take_cstr(*name) }.unwrap_or_default();
        }
        Ok(reported)
    }

    fn fetch_domain_ids(&self, dest: &mut [u32]) -> Result<usize, SubsystemError> {
        let mut raw: Vec<c_int> = vec![0; dest.len()];
        let reported = check(unsafe {
            sys::virConnectListDomains(self.ptr(), raw.as_mut_ptr(), max_len(raw.len()))
        })?;
        for (slot, id) in dest.iter_mut().zip(raw.iter().take(reported)) {
            *slot = *id as u32;
        }
        Ok(reported)
    }

    fn probe_parameters(&self, target: &ParamTarget, flags: u32) -> Result<usize, SubsystemError> {
        let dom = self.target_domain(target)?;
        let mut n: c_int = 0;
        match target {
            ParamTarget::Scheduler { .. } => {
                let policy = unsafe { sys::virDomainGetSchedulerType(dom_ptr(&dom), &mut n) };
                if policy.is_null() {
                    return Err(last_error());
                }
                let policy = unsafe { take_cstr(policy) };
                debug!("{} uses scheduler {:?}", target, policy);
            }
            ParamTarget::Memory { .. } => {
                check(unsafe {
                    sys::virDomainGetMemoryParameters(dom_ptr(&dom), ptr::null_mut(), &mut n, flags)
                })?;
            }
            ParamTarget::Blkio { .. } => {
                check(unsafe {
                    sys::virDomainGetBlkioParameters(dom_ptr(&dom), ptr::null_mut(), &mut n, flags)
                })?;
            }
            ParamTarget::NodeMemory => {
                check(unsafe {
                    sys::virNodeGetMemoryParameters(self.ptr(), ptr::null_mut(), &mut n, flags)
                })?;
            }
        }
        Ok(n.max(0) as usize)
    }

    fn get_parameters(
        &self,
        target: &ParamTarget,
        dest: &mut RawParams,
        flags: u32,
    ) -> Result<usize, SubsystemError> {
        let dom = self.target_domain(target)?;
        let mut n = max_len(dest.len());
        let params: sys::virTypedParameterPtr = dest.as_mut_ptr().cast();
        let ret = unsafe {
            match target {
                ParamTarget::Scheduler { .. } => {
                    sys::virDomainGetSchedulerParametersFlags(dom_ptr(&dom), params, &mut n, flags)
                }
                ParamTarget::Memory { .. } => {
                    sys::virDomainGetMemoryParameters(dom_ptr(&dom), params, &mut n, flags)
                }
                ParamTarget::Blkio { .. } => {
                    sys::virDomainGetBlkioParameters(dom_ptr(&dom), params, &mut n, flags)
                }
                ParamTarget::NodeMemory => {
                    sys::virNodeGetMemoryParameters(self.ptr(), params, &mut n, flags)
                }
            }
        };
        // string payloads now belong to libvirt's allocator
        unsafe { dest.adopt_foreign(clear_params) };
        check(ret)?;
        Ok(n.max(0) as usize)
    }

    fn set_parameters(
        &self,
        target: &ParamTarget,
        params: &RawParams,
        flags: u32,
    ) -> Result<(), SubsystemError> {
        let dom = self.target_domain(target)?;
        let n = max_len(params.len());
        let raw = params.as_ptr() as sys::virTypedParameterPtr;
        let ret = unsafe {
            match target {
                ParamTarget::Scheduler { .. } => {
                    sys::virDomainSetSchedulerParametersFlags(dom_ptr(&dom), raw, n, flags)
                }
                ParamTarget::Memory { .. } => {
                    sys::virDomainSetMemoryParameters(dom_ptr(&dom), raw, n, flags)
                }
                ParamTarget::Blkio { .. } => {
                    sys::virDomainSetBlkioParameters(dom_ptr(&dom), raw, n, flags)
                }
                ParamTarget::NodeMemory => {
                    sys::virNodeSetMemoryParameters(self.ptr(), raw, n, flags)
                }
            }
        };
        check(ret).map(|_| ())
    }

    fn probe_stats(&self, target: StatsTarget, flags: u32) -> Result<usize, SubsystemError> {
        let mut n: c_int = 0;
        let ret = unsafe {
            match target {
                StatsTarget::Cpu(cpu) => {
                    sys::virNodeGetCPUStats(self.ptr(), cpu, ptr::null_mut(), &mut n, flags)
                }
                StatsTarget::Memory(cell) => {
                    sys::virNodeGetMemoryStats(self.ptr(), cell, ptr::null_mut(), &mut n, flags)
                }
            }
        };
        check(ret)?;
        Ok(n.max(0) as usize)
    }

    fn fetch_stats(
        &self,
        target: StatsTarget,
        dest: &mut [NodeStat],
        flags: u32,
    ) -> Result<usize, SubsystemError> {
        let mut n = max_len(dest.len());
        let records: Vec<(String, u64)> = match target {
            StatsTarget::Cpu(cpu) => {
                let mut raw: Vec<sys::virNodeCPUStats> = zeroed_records(dest.len());
                check(unsafe {
                    sys::virNodeGetCPUStats(self.ptr(), cpu, raw.as_mut_ptr(), &mut n, flags)
                })?;
                raw.iter().map(|r| (field_name(&r.field), r.value as u64)).collect()
            }
            StatsTarget::Memory(cell) => {
                let mut raw: Vec<sys::virNodeMemoryStats> = zeroed_records(dest.len());
                check(unsafe {
                    sys::virNodeGetMemoryStats(self.ptr(), cell, raw.as_mut_ptr(), &mut n, flags)
                })?;
                raw.iter().map(|r| (field_name(&r.field), r.value as u64)).collect()
            }
        };

        let reported = n.max(0) as usize;
        for (slot, (field, value)) in dest.iter_mut().zip(records.into_iter().take(reported)) {
            *slot = NodeStat { field, value };
        }
        Ok(reported)
    }

    fn register_event(
        &self,
        domain: Option<&str>,
        kind: EventKind,
        adapter: EventAdapter,
    ) -> Result<i32, SubsystemError> {
        let dom = domain.map(|d| self.lookup(d)).transpose()?;
        let opaque = Box::into_raw(Box::new(Callback {
            adapter,
            uri: self.uri.clone(),
        }));

        let ret = unsafe {
            sys::virConnectDomainEventRegisterAny(
                self.ptr(),
                dom_ptr(&dom),
                kind.id(),
                trampoline(kind),
                opaque.cast(),
                Some(free_callback),
            )
        };
        if ret < 0 {
            let err = last_error();
            // libvirt only takes ownership on success
            drop(unsafe { Box::from_raw(opaque) });
            return Err(err);
        }
        debug!("libvirt callback {} handles {} events", ret, kind);
        Ok(ret)
    }

    fn deregister_event(&self, id: i32) -> Result<(), SubsystemError> {
        check(unsafe { sys::virConnectDomainEventDeregisterAny(self.ptr(), id) }).map(|_| ())
    }
}

fn zeroed_records<T>(len: usize) -> Vec<T> {
    (0..len).map(|_| unsafe { std::mem::zeroed() }).collect()
}

/// State behind the opaque pointer of one libvirt callback.
struct Callback {
    adapter: EventAdapter,
    uri: String,
}

unsafe extern "C" fn free_callback(opaque: *mut c_void) {
    if !opaque.is_null() {
        drop(Box::from_raw(opaque.cast::<Callback>()));
    }
}

unsafe fn deliver(
    dom: sys::virDomainPtr,
    opaque: *mut c_void,
    event: impl FnOnce() -> DomainEvent,
) {
    let Some(callback) = opaque.cast::<Callback>().as_ref() else {
        return;
    };
    let id = sys::virDomainGetID(dom);
    let source = EventSource::new(
        &callback.uri,
        copy_cstr(sys::virDomainGetName(dom)).unwrap_or_default(),
        (id != u32::MAX).then_some(id),
    );

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let event = event();
        callback.adapter.deliver(&source, &event)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(
            "dropped {} event for {}: {}",
            callback.adapter.kind(),
            source.domain.name,
            e
        ),
        Err(_) => error!(
            "{} handler for {} panicked",
            callback.adapter.kind(),
            source.domain.name
        ),
    }
}

unsafe fn text(ptr: *const c_char) -> String {
    copy_cstr(ptr).unwrap_or_default()
}

unsafe fn graphics_address(addr: *const sys::virDomainEventGraphicsAddress) -> GraphicsAddress {
    match addr.as_ref() {
        Some(addr) => GraphicsAddress {
            family: addr.family,
            node: text(addr.node as *const c_char),
            service: text(addr.service as *const c_char),
        },
        None => GraphicsAddress::default(),
    }
}

unsafe fn graphics_subject(
    subject: *const sys::virDomainEventGraphicsSubject,
) -> Vec<GraphicsIdentity> {
    let Some(subject) = subject.as_ref() else {
        return Vec::new();
    };
    if subject.identities.is_null() || subject.nidentity <= 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(subject.identities, subject.nidentity as usize)
        .iter()
        .map(|identity| GraphicsIdentity {
            kind: text(identity.type_ as *const c_char),
            name: text(identity.name as *const c_char),
        })
        .collect()
}

unsafe extern "C" fn on_lifecycle(
    _: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    event: c_int,
    detail: c_int,
    opaque: *mut c_void,
) {
    deliver(dom, opaque, || DomainEvent::Lifecycle { event, detail });
}

unsafe extern "C" fn on_reboot(_: sys::virConnectPtr, dom: sys::virDomainPtr, opaque: *mut c_void) {
    deliver(dom, opaque, || DomainEvent::Reboot);
}

unsafe extern "C" fn on_rtc_change(
    _: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    utc_offset: c_longlong,
    opaque: *mut c_void,
) {
    deliver(dom, opaque, || DomainEvent::RtcChange { utc_offset });
}

unsafe extern "C" fn on_watchdog(
    _: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    action: c_int,
    opaque: *mut c_void,
) {
    deliver(dom, opaque, || DomainEvent::Watchdog { action });
}

unsafe extern "C" fn on_io_error(
    _: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    src_path: *const c_char,
    dev_alias: *const c_char,
    action: c_int,
    opaque: *mut c_void,
) {
    deliver(dom, opaque, || DomainEvent::IoError {
        src_path: text(src_path),
        dev_alias: text(dev_alias),
        action,
    });
}

unsafe extern "C" fn on_io_error_reason(
    _: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    src_path: *const c_char,
    dev_alias: *const c_char,
    action: c_int,
    reason: *const c_char,
    opaque: *mut c_void,
) {
    deliver(dom, opaque, || DomainEvent::IoErrorReason {
        src_path: text(src_path),
        dev_alias: text(dev_alias),
        action,
        reason: text(reason),
    });
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn on_graphics(
    _: sys::virConnectPtr,
    dom: sys::virDomainPtr,
    phase: c_int,
    local: *const sys::virDomainEventGraphicsAddress,
    remote: *const sys::virDomainEventGraphicsAddress,
    auth_scheme: *const c_char,
    subject: *const sys::virDomainEventGraphicsSubject,
    opaque: *mut c_void,
) {
    deliver(dom, opaque, || DomainEvent::Graphics {
        phase,
        local: graphics_address(local),
        remote: graphics_address(remote),
        auth_scheme: text(auth_scheme),
        subject: graphics_subject(subject),
    });
}

type GenericCallback = unsafe extern "C" fn(sys::virConnectPtr, sys::virDomainPtr, *mut c_void);

/// libvirt takes every event callback as the generic signature and calls it
/// with the arguments of the registered event id.
fn trampoline(kind: EventKind) -> sys::virConnectDomainEventGenericCallback {
    let callback = match kind {
        EventKind::Lifecycle => on_lifecycle as *const (),
        EventKind::Reboot => on_reboot as *const (),
        EventKind::RtcChange => on_rtc_change as *const (),
        EventKind::Watchdog => on_watchdog as *const (),
        EventKind::IoError => on_io_error as *const (),
        EventKind::IoErrorReason => on_io_error_reason as *const (),
        EventKind::Graphics => on_graphics as *const (),
    };
    Some(unsafe { std::mem::transmute::<*const (), GenericCallback>(callback) })
}
