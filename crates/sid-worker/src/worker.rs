// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker-proxy and worker resource data, their type descriptors, and the
//! worker-proxy lifecycle state machine.

use std::any::Any;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use sid_core::{CreateFlags, Data, EventSource, Params as CoreParams, Resource, ResourceOps, ResourceType};

use crate::channel::{Channel, Role, WorkerKind};
use crate::channel_spec::ChannelSpec;
use crate::control::TimeoutSpec;
use crate::error::{Error, Result};

/// `NEW → ASSIGNED ⇄ IDLE → EXITING → EXITED`, plus `TIMED_OUT` reachable
/// from any state on exec-timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    New,
    Assigned,
    Idle,
    Exiting,
    TimedOut,
    Exited,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Exited)
    }
}

/// Parent-side resource data for one forked worker. Lives in the
/// worker-proxy resource's `Data` slot.
///
/// Caches its own resource id (stable for the resource's lifetime) so state
/// transitions can log without re-entering the tree's borrow from inside
/// `with_data_mut`.
pub struct WorkerProxyData {
    pub id: String,
    pub pid: i32,
    pub kind: WorkerKind,
    state: WorkerState,
    pub channels: Vec<Channel>,
    pub timeout_spec: TimeoutSpec,
    pub arg: Option<Rc<dyn Any>>,
    pub idle_timeout_es: Option<EventSource>,
    pub exec_timeout_es: Option<EventSource>,
    /// Keeps the child-reap registration alive for the proxy's lifetime;
    /// an `EventSource` unregisters itself as soon as it's dropped.
    child_reap_es: Option<EventSource>,
}

impl WorkerProxyData {
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// `_change_worker_proxy_state`: logs the transition, then applies it.
    pub fn set_state(&mut self, state: WorkerState) {
        debug!(id = %self.id, from = ?self.state, to = ?state, "worker state changed");
        self.state = state;
    }

    pub fn channel_mut(&mut self, id: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.id() == id)
    }
}

/// Child-side resource data for the top-level `worker` resource run inside
/// a forked internal worker process.
pub struct WorkerData {
    pub channel_specs: Vec<ChannelSpec>,
    pub channels: Vec<Channel>,
    pub parent_exited: bool,
    pub arg: Option<Rc<dyn Any>>,
    /// Keeps the `SIGTERM`/`SIGINT`/`SIGUSR1` registration alive for the
    /// worker's lifetime; an `EventSource` unregisters itself as soon as
    /// it's dropped.
    signal_es: Option<EventSource>,
}

impl WorkerData {
    pub fn channel_mut(&mut self, id: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.id() == id)
    }
}

/// Construction params threaded from `get_new_worker`'s fork outcome into
/// `ResourceOps::init`.
pub(crate) struct WorkerProxyKickstart {
    pub pid: i32,
    pub kind: WorkerKind,
    pub channels: Vec<Channel>,
    pub timeout_spec: TimeoutSpec,
    pub arg: Option<Rc<dyn Any>>,
}

pub(crate) struct WorkerKickstart {
    pub channel_specs: Vec<ChannelSpec>,
    pub channels: Vec<Channel>,
    pub arg: Option<Rc<dyn Any>>,
}

struct WorkerProxyOps;

impl ResourceOps for WorkerProxyOps {
    fn init(&self, res: &Resource, params: &CoreParams) -> sid_core::Result<Option<Data>> {
        let kickstart = params
            .downcast_ref::<RefCell<Option<WorkerProxyKickstart>>>()
            .and_then(|cell| cell.borrow_mut().take())
            .ok_or(sid_core::Error::InvalidArgument)?;

        let mut proxy = WorkerProxyData {
            id: res.id(),
            pid: kickstart.pid,
            kind: kickstart.kind,
            state: WorkerState::New,
            channels: kickstart.channels,
            timeout_spec: kickstart.timeout_spec,
            arg: kickstart.arg,
            idle_timeout_es: None,
            exec_timeout_es: None,
            child_reap_es: None,
        };

        let loop_ = res.event_loop_handle()?;
        let pid = proxy.pid;
        let child_res = res.clone();
        // Priority 1: strictly after channel I/O (priority 0) within the
        // same poll iteration, so pending messages drain before EXITED
        // fires.
        let owns_loop = res.res_type().with_event_loop;
        let child_reap_es = loop_
            .create_child_event_source(pid, 1, move |_exit| {
                child_res.with_data_mut(|d| {
                    if let Some(p) = d.and_then(|d| d.downcast_mut::<WorkerProxyData>()) {
                        p.set_state(WorkerState::Exited);
                    }
                });
                // Priority 1 lets pending channel I/O (priority 0) drain
                // this same iteration before EXITED is announced and the
                // proxy resource is unreffed.
                if owns_loop {
                    child_res.exit_event_loop()?;
                }
                child_res.unref();
                Ok(())
            })
            .map_err(sid_core::Error::from)?;
        proxy.child_reap_es = Some(child_reap_es);

        if kickstart.timeout_spec.usec > 0 {
            let deadline = loop_.clock().now() + Duration::from_micros(kickstart.timeout_spec.usec);
            let signum = kickstart.timeout_spec.signum;
            let timeout_res = res.clone();
            let timeout_pid = kickstart.pid;
            let es = loop_
                .create_time_event_source(deadline, 0, move |_| {
                    timeout_res.with_data_mut(|d| {
                        if let Some(p) = d.and_then(|d| d.downcast_mut::<WorkerProxyData>()) {
                            p.set_state(WorkerState::TimedOut);
                        }
                    });
                    if signum != 0 {
                        if let Ok(sig) = nix::sys::signal::Signal::try_from(signum) {
                            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(timeout_pid), sig);
                        }
                    }
                    Ok(())
                })
                .map_err(sid_core::Error::from)?;
            proxy.exec_timeout_es = Some(es);
        }

        Ok(Some(Box::new(proxy)))
    }
}

struct WorkerOps;

impl ResourceOps for WorkerOps {
    fn init(&self, res: &Resource, params: &CoreParams) -> sid_core::Result<Option<Data>> {
        let kickstart = params
            .downcast_ref::<RefCell<Option<WorkerKickstart>>>()
            .and_then(|cell| cell.borrow_mut().take())
            .ok_or(sid_core::Error::InvalidArgument)?;

        let mut worker = WorkerData {
            channel_specs: kickstart.channel_specs,
            channels: kickstart.channels,
            parent_exited: false,
            arg: kickstart.arg,
            signal_es: None,
        };

        let loop_ = res.event_loop_handle()?;
        let sig_res = res.clone();
        let signal_es = loop_
            .create_signal_event_source(
                vec![
                    nix::sys::signal::Signal::SIGTERM as i32,
                    nix::sys::signal::Signal::SIGINT as i32,
                    nix::sys::signal::Signal::SIGUSR1 as i32,
                ],
                0,
                move |sig| {
                    if sig == nix::sys::signal::Signal::SIGTERM as i32
                        || sig == nix::sys::signal::Signal::SIGINT as i32
                    {
                        sig_res.exit_event_loop()?;
                    } else if sig == nix::sys::signal::Signal::SIGUSR1 as i32 {
                        sig_res.with_data_mut(|d| {
                            if let Some(w) = d.and_then(|d| d.downcast_mut::<WorkerData>()) {
                                w.parent_exited = true;
                            }
                        });
                    }
                    Ok(())
                },
            )
            .map_err(sid_core::Error::from)?;
        worker.signal_es = Some(signal_es);

        Ok(Some(Box::new(worker)))
    }
}

pub static WORKER_PROXY_TYPE: ResourceType = ResourceType {
    name: "worker-proxy",
    short_name: "wrp",
    description: "Parent-side representation of a forked worker process, \
                  owning the worker-proxy <--> worker channel endpoints.",
    with_event_loop: false,
    disallow_isolation: false,
    watchdog: None,
    ops: &WorkerProxyOps,
};

/// Used by `run_new_worker`: an external worker's proxy drives its own
/// event loop directly (the caller blocks inside `Resource::run_event_loop`
/// rather than sharing an ancestor's loop).
pub static WORKER_PROXY_WITH_LOOP_TYPE: ResourceType = ResourceType {
    name: "worker-proxy",
    short_name: "wrp",
    description: "Parent-side representation of a forked worker process, \
                  owning the worker-proxy <--> worker channel endpoints.",
    with_event_loop: true,
    disallow_isolation: false,
    watchdog: None,
    ops: &WorkerProxyOps,
};

pub static WORKER_TYPE: ResourceType = ResourceType {
    name: "worker",
    short_name: "wrk",
    description: "Top-level resource in a forked worker process, owning the \
                  worker <--> worker-proxy channel endpoints.",
    with_event_loop: true,
    disallow_isolation: false,
    watchdog: None,
    ops: &WorkerOps,
};

pub(crate) fn create_worker_proxy(
    parent: &Resource,
    id_part: Option<&str>,
    with_event_loop: bool,
    kickstart: WorkerProxyKickstart,
) -> Result<Resource> {
    let ty: &'static ResourceType = if with_event_loop {
        &WORKER_PROXY_WITH_LOOP_TYPE
    } else {
        &WORKER_PROXY_TYPE
    };
    let cell: RefCell<Option<WorkerProxyKickstart>> = RefCell::new(Some(kickstart));
    parent
        .create_child(ty, CreateFlags { disallow_isolation: true }, id_part, &cell, 0, vec![])
        .map_err(Error::from)
}

pub(crate) fn create_worker(
    id_part: Option<&str>,
    kickstart: WorkerKickstart,
    svc_links: Vec<sid_core::ServiceLinkDef>,
) -> Result<Resource> {
    let cell: RefCell<Option<WorkerKickstart>> = RefCell::new(Some(kickstart));
    Resource::create_root(&WORKER_TYPE, CreateFlags::default(), id_part, &cell, 0, svc_links).map_err(Error::from)
}

/// `sid_wrk_ctl_detect_worker`: true iff `res` is a worker or descends from
/// one. Used by channel setup to choose which endpoint's buffer mode to
/// wire up, and by `chan_send`/`yield_worker` to pick a role.
pub fn detect_worker(res: &Resource) -> bool {
    use sid_core::SearchMode;
    sid_core::same_type(res.res_type(), &WORKER_TYPE)
        || res.search(SearchMode::Anc, Some(&WORKER_TYPE), None).is_some()
}

pub(crate) fn find_worker_proxy_ancestor(res: &Resource) -> Option<Resource> {
    use sid_core::SearchMode;
    if sid_core::same_type(res.res_type(), &WORKER_PROXY_TYPE)
        || sid_core::same_type(res.res_type(), &WORKER_PROXY_WITH_LOOP_TYPE)
    {
        return Some(res.clone());
    }
    res.search(SearchMode::Anc, Some(&WORKER_PROXY_TYPE), None)
        .or_else(|| res.search(SearchMode::Anc, Some(&WORKER_PROXY_WITH_LOOP_TYPE), None))
}

pub(crate) fn find_worker_ancestor(res: &Resource) -> Option<Resource> {
    use sid_core::SearchMode;
    if sid_core::same_type(res.res_type(), &WORKER_TYPE) {
        return Some(res.clone());
    }
    res.search(SearchMode::Anc, Some(&WORKER_TYPE), None)
        .or_else(|| res.search(SearchMode::Top, Some(&WORKER_TYPE), None))
}

/// Resolves the raw FD an "external wire extension" should be redirected
/// onto for this channel, if its `ChannelSpec` requests one.
pub(crate) fn ext_redirect_fd(spec: &ChannelSpec) -> Option<RawFd> {
    spec.ext_wire_extension.map(|e| e.redirect_fd)
}

pub(crate) fn channel_role_for(res: &Resource) -> Role {
    if detect_worker(res) {
        Role::Worker
    } else {
        Role::Proxy
    }
}
