// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker control: the resource that owns a worker type's channel layout and
//! spawn policy, and the operations built on top of it — `get_new_worker`,
//! `run_worker`, `run_new_worker`, `chan_send`, `chan_close`, `yield_worker`,
//! and the lookups (`get_idle_worker`, `find_worker`, `get_worker_state`,
//! `get_worker_id`, `get_worker_arg`).
//!
//! Grounded in `wrk-ctl.c`'s `sid_wrk_ctl_*` family: `_do_worker_control_
//! get_new_worker` (fork/signal/prctl orchestration), `_run_internal_worker`
//! / `_run_external_worker`, `_chan_buf_send`/`_channel_prepare_send`, and
//! `_chan_buf_recv`.

use std::any::Any;
use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::warn;

use sid_core::{CreateFlags, Data, Params as CoreParams, Readiness, Resource, ResourceOps, ResourceType, ServiceLinkDef};

use crate::channel::{Channel, Role, WorkerKind};
use crate::channel_spec::{deep_copy_channel_specs, ChannelSpec, RxCallback, Wire};
use crate::command::ChannelCommand;
use crate::error::{Error, Result};
use crate::fd_pass;
use crate::spawn;
use crate::worker::{
    self, create_worker, create_worker_proxy, find_worker_ancestor, find_worker_proxy_ancestor, WorkerData,
    WorkerKickstart, WorkerProxyKickstart, WorkerState,
};

/// An exec/idle timeout: after `usec` microseconds with no activity, `signum`
/// is sent to the worker (0 disables the timeout entirely).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSpec {
    pub usec: u64,
    pub signum: i32,
}

impl TimeoutSpec {
    pub const NONE: TimeoutSpec = TimeoutSpec { usec: 0, signum: 0 };
}

impl Default for TimeoutSpec {
    fn default() -> Self {
        TimeoutSpec::NONE
    }
}

/// What happens when a worker calls [`yield_worker`]: by default, a proxy
/// that sees `YIELD` tears the worker down immediately, since nothing else
/// is waiting to reuse it. Configuring [`OnYield::ArmIdleTimer`] instead
/// keeps the worker around as `IDLE` for [`get_idle_worker`] to reclaim.
#[derive(Debug, Clone, Copy)]
pub enum OnYield {
    /// Exit the worker's event loop as soon as the `YIELD` command reaches
    /// the proxy with no parent-exited signal pending.
    TerminateImmediately,
    /// Arm an idle timer instead of exiting immediately, giving
    /// `get_idle_worker` a window to reclaim the worker before it's killed.
    ArmIdleTimer(Duration),
}

impl Default for OnYield {
    fn default() -> Self {
        OnYield::TerminateImmediately
    }
}

pub type InitCallback = Rc<dyn Fn(Option<&Resource>, Option<&Rc<dyn Any>>) -> Result<()>>;

/// Parameters for an external (`execve`'d) worker.
#[derive(Clone)]
pub struct ExternalParams {
    pub exec_file: String,
    pub args: Vec<String>,
    /// `"KEY=VALUE"` entries, passed to `execve` verbatim.
    pub env: Vec<String>,
}

/// Static configuration for one worker-control resource: its channel layout
/// and spawn policy. Deep-copied into the resource's data at creation time.
#[derive(Clone, Default)]
pub struct WorkerControlConfig {
    pub worker_type: Option<WorkerKindConfig>,
    init_cb: Option<InitCallback>,
    init_cb_arg: Option<Rc<dyn Any>>,
    default_timeout: TimeoutSpec,
    on_yield: OnYield,
}

/// Whether this worker-control spawns internal (in-process event-loop
/// children) or external (`execve`'d) workers, plus the spawn policy each
/// needs.
#[derive(Clone)]
pub enum WorkerKindConfig {
    Internal,
    External,
}

impl WorkerControlConfig {
    pub fn new(kind: WorkerKindConfig) -> Self {
        Self {
            worker_type: Some(kind),
            ..Default::default()
        }
    }

    /// Called once per worker, right after its resource is created (the
    /// worker itself for internal workers; nothing for external ones, which
    /// have no resource of their own to pass).
    pub fn with_init_callback(mut self, cb: InitCallback, arg: Option<Rc<dyn Any>>) -> Self {
        self.init_cb = Some(cb);
        self.init_cb_arg = arg;
        self
    }

    pub fn with_default_timeout(mut self, timeout: TimeoutSpec) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Policy applied once a worker `YIELD`s (see [`yield_worker`]) and its
    /// proxy observes the command.
    pub fn with_on_yield(mut self, policy: OnYield) -> Self {
        self.on_yield = policy;
        self
    }
}

/// Per-`get_new_worker` parameters.
#[derive(Default, Clone)]
pub struct Params {
    /// The worker-proxy's (and, for internal workers, the worker's) id
    /// part. Falls back to `"wrk-<pid>"` if absent.
    pub id: Option<String>,
    pub channel_specs: Vec<ChannelSpec>,
    pub timeout: Option<TimeoutSpec>,
    pub proxy_arg: Option<Rc<dyn Any>>,
    pub worker_arg: Option<Rc<dyn Any>>,
    /// Required when the worker-control was configured for external workers;
    /// rejected (`NotSupported`) otherwise.
    pub external: Option<ExternalParams>,
}

struct PendingWorkerInit {
    id: String,
    kind: WorkerKind,
    channels: Vec<Channel>,
    worker_arg: Option<Rc<dyn Any>>,
    external: Option<(Vec<std::ffi::CString>, Vec<std::ffi::CString>, std::ffi::CString)>,
    /// `cloneable` service links collected from the worker-control and its
    /// ancestors at fork time, before the child severs into its own tree via
    /// `create_root`. Merged with whatever `run_worker`/`run_new_worker` is
    /// called with once the worker resource itself is created.
    inherited_svc_links: Vec<ServiceLinkDef>,
}

/// Resource data for a worker-control resource: its channel-spec template,
/// init callback, default timeout/yield policy, and (between `get_new_worker`
/// returning in the child and `run_worker` consuming it) the one pending
/// worker init.
pub struct WorkerControl {
    kind: WorkerKind,
    channel_specs: Vec<Rc<ChannelSpec>>,
    init_cb: Option<InitCallback>,
    init_cb_arg: Option<Rc<dyn Any>>,
    default_timeout: TimeoutSpec,
    on_yield: OnYield,
    pending: Option<PendingWorkerInit>,
}

struct WorkerControlOps;

impl ResourceOps for WorkerControlOps {
    fn init(&self, _res: &Resource, params: &CoreParams) -> sid_core::Result<Option<Data>> {
        let config = params
            .downcast_ref::<RefCell<Option<WorkerControlConfig>>>()
            .and_then(|cell| cell.borrow_mut().take())
            .ok_or(sid_core::Error::InvalidArgument)?;
        let kind = match config.worker_type {
            Some(WorkerKindConfig::Internal) | None => WorkerKind::Internal,
            Some(WorkerKindConfig::External) => WorkerKind::External,
        };
        Ok(Some(Box::new(WorkerControl {
            kind,
            channel_specs: Vec::new(),
            init_cb: config.init_cb,
            init_cb_arg: config.init_cb_arg,
            default_timeout: config.default_timeout,
            on_yield: config.on_yield,
            pending: None,
        })))
    }
}

pub static WORKER_CONTROL_TYPE: ResourceType = ResourceType {
    name: "worker-control",
    short_name: "wctl",
    description: "Owns a worker type's channel layout and spawn policy; \
                  forks and supervises the worker processes it creates.",
    with_event_loop: false,
    disallow_isolation: false,
    watchdog: None,
    ops: &WorkerControlOps,
};

/// Creates a worker-control resource as a child of `parent`, with its
/// channel-spec template deep-copied in so the caller's `Vec` stays
/// independently owned.
pub fn create(
    parent: &Resource,
    id_part: Option<&str>,
    config: WorkerControlConfig,
    channel_specs: &[ChannelSpec],
) -> Result<Resource> {
    let specs = deep_copy_channel_specs(channel_specs)?;
    let cell: RefCell<Option<WorkerControlConfig>> = RefCell::new(Some(config));
    let res = parent
        .create_child(&WORKER_CONTROL_TYPE, CreateFlags::default(), id_part, &cell, 0, vec![])
        .map_err(Error::from)?;
    res.with_data_mut(|d| {
        if let Some(wc) = d.and_then(|d| d.downcast_mut::<WorkerControl>()) {
            wc.channel_specs = specs.into_iter().map(Rc::new).collect();
        }
    });
    Ok(res)
}

fn generated_id(pid: i32) -> String {
    format!("wrk-{pid}")
}

/// `sid_wrk_ctl_get_new_worker`: forks a new worker. Returns `Some(proxy)`
/// in the parent; returns `None` in the child, which must then call
/// [`run_worker`] to finish setup and (for internal workers) run its event
/// loop, or (for external workers) `execve`.
pub fn get_new_worker(wc_res: &Resource, params: Params) -> Result<Option<Resource>> {
    get_new_worker_impl(wc_res, params, false)
}

fn get_new_worker_impl(wc_res: &Resource, params: Params, proxy_owns_loop: bool) -> Result<Option<Resource>> {
    let (kind, specs, default_timeout) = wc_res.with_data_mut(|d| {
        let wc = d
            .and_then(|d| d.downcast_mut::<WorkerControl>())
            .ok_or(Error::Core(sid_core::Error::InvalidArgument))?;
        if wc.pending.is_some() {
            return Err(Error::AlreadyPrepared);
        }
        let specs: Vec<Rc<ChannelSpec>> = if params.channel_specs.is_empty() {
            wc.channel_specs.clone()
        } else {
            deep_copy_channel_specs(&params.channel_specs)?
                .into_iter()
                .map(Rc::new)
                .collect()
        };
        Ok((wc.kind, specs, wc.default_timeout))
    })?;

    if params.external.is_some() != (kind == WorkerKind::External) {
        return Err(Error::UnsupportedForWorkerType);
    }

    let timeout = params.timeout.unwrap_or(default_timeout);

    let mut fds = Vec::with_capacity(specs.len());
    for spec in &specs {
        fds.push(spec.create_fds()?);
    }

    let original_ppid = nix::unistd::getpid().as_raw();
    let guard = spawn::block_all_signals()?;

    // SAFETY: signals are blocked for the duration of the fork, and this
    // process is single-threaded by construction (the resource tree and
    // event loop are both `Rc`-based, non-`Send` types).
    let outcome = unsafe { spawn::fork() };
    let outcome = match outcome {
        Ok(o) => o,
        Err(e) => {
            guard.restore()?;
            return Err(e);
        }
    };

    match outcome {
        spawn::ForkOutcome::Parent { child_pid } => {
            for ch_fds in &fds {
                if let Some(fd) = ch_fds.worker_fd {
                    let _ = nix::unistd::close(fd);
                }
            }
            guard.restore()?;

            let mut channels: Vec<Channel> = specs
                .iter()
                .zip(fds.iter())
                .map(|(spec, fd)| Channel::new(Rc::clone(spec), Role::Proxy, fd.proxy_fd, kind))
                .collect();

            let id_part = params.id.clone().unwrap_or_else(|| generated_id(child_pid));
            let proxy = create_worker_proxy(
                wc_res,
                Some(&id_part),
                proxy_owns_loop,
                WorkerProxyKickstart {
                    pid: child_pid,
                    kind,
                    channels: Vec::new(),
                    timeout_spec: timeout,
                    arg: params.proxy_arg,
                },
            )?;
            setup_channels(Some(&proxy), Role::Proxy, kind, &mut channels)?;
            proxy.with_data_mut(|d| {
                if let Some(p) = d.and_then(|d| d.downcast_mut::<crate::worker::WorkerProxyData>()) {
                    p.channels = channels;
                }
            });
            Ok(Some(proxy))
        }
        spawn::ForkOutcome::Child => {
            let sig = nix::sys::signal::Signal::SIGUSR1;
            // Internal workers watch for their parent's death via SIGUSR1
            // (see worker.rs); external workers get SIGTERM, since they have
            // no sid event loop of their own to observe the signal with.
            let pdeathsig = if kind == WorkerKind::External {
                nix::sys::signal::Signal::SIGTERM
            } else {
                sig
            };
            if spawn::set_parent_death_signal(pdeathsig).is_err() {
                spawn::terminate_self_as_orphan();
            }
            if spawn::parent_already_exited(original_ppid) {
                spawn::terminate_self_as_orphan();
            }

            for ch_fds in &fds {
                if let Some(fd) = ch_fds.proxy_fd {
                    let _ = nix::unistd::close(fd);
                }
            }

            let channels: Vec<Channel> = specs
                .iter()
                .zip(fds.iter())
                .map(|(spec, fd)| Channel::new(Rc::clone(spec), Role::Worker, fd.worker_fd, kind))
                .collect();

            let id = params.id.unwrap_or_else(|| generated_id(nix::unistd::getpid().as_raw()));

            let external = match params.external {
                Some(ext) => Some(build_exec_argv(&ext)?),
                None => None,
            };

            if kind == WorkerKind::External {
                let keep: Vec<RawFd> = channels.iter().filter_map(|c| c.fd).collect();
                spawn::close_non_channel_fds(&keep)?;
            }

            // The worker resource created by `run_worker` starts a fresh tree
            // via `create_root`, so anything the worker-control's own tree
            // would otherwise have made reachable is gone unless copied
            // across here, before that severance happens.
            let inherited_svc_links = wc_res.cloneable_service_links();

            wc_res.with_data_mut(|d| {
                if let Some(wc) = d.and_then(|d| d.downcast_mut::<WorkerControl>()) {
                    wc.pending = Some(PendingWorkerInit {
                        id,
                        kind,
                        channels,
                        worker_arg: params.worker_arg,
                        external,
                        inherited_svc_links,
                    });
                }
            });

            guard.restore()?;
            Ok(None)
        }
    }
}

fn build_exec_argv(
    ext: &ExternalParams,
) -> Result<(Vec<std::ffi::CString>, Vec<std::ffi::CString>, std::ffi::CString)> {
    let to_cstring = |s: &str| {
        std::ffi::CString::new(s).map_err(|_| Error::Core(sid_core::Error::InvalidArgument))
    };
    let prog = to_cstring(&ext.exec_file)?;
    let mut argv = Vec::with_capacity(ext.args.len() + 1);
    argv.push(prog.clone());
    for a in &ext.args {
        argv.push(to_cstring(a)?);
    }
    let mut envp = Vec::with_capacity(ext.env.len());
    for e in &ext.env {
        envp.push(to_cstring(e)?);
    }
    Ok((argv, envp, prog))
}

/// `sid_wrk_ctl_run_worker`: called in the child after [`get_new_worker`]
/// returned `None`. For an internal worker, builds the `worker` resource,
/// wires up its channels, invokes the configured init callback, and runs its
/// event loop — this call does not return until that loop exits. For an
/// external worker, wires up channel redirects and `execve`s — this call
/// never returns on success.
///
/// `svc_links` are merged with whatever `cloneable` links the worker-control
/// and its ancestors carried at fork time and attached to the new `worker`
/// resource; external workers ignore them; they have no resource of their
/// own to attach them to once `execve` replaces the process image.
pub fn run_worker(wc_res: &Resource, svc_links: Vec<ServiceLinkDef>) -> Result<()> {
    let (init_cb, init_cb_arg, pending) = wc_res.with_data_mut(|d| {
        let wc = d
            .and_then(|d| d.downcast_mut::<WorkerControl>())
            .ok_or(Error::Core(sid_core::Error::InvalidArgument))?;
        let pending = wc.pending.take().ok_or(Error::NotPrepared)?;
        Ok((wc.init_cb.clone(), wc.init_cb_arg.clone(), pending))
    })?;

    match pending.kind {
        WorkerKind::Internal => run_internal_worker(init_cb, init_cb_arg, pending, svc_links),
        WorkerKind::External => run_external_worker(init_cb, init_cb_arg, pending),
    }
}

fn run_internal_worker(
    init_cb: Option<InitCallback>,
    init_cb_arg: Option<Rc<dyn Any>>,
    pending: PendingWorkerInit,
    svc_links: Vec<ServiceLinkDef>,
) -> Result<()> {
    let mut inherited = pending.inherited_svc_links;
    inherited.extend(svc_links);
    let mut channels = pending.channels;
    let worker_res = create_worker(
        Some(&pending.id),
        WorkerKickstart {
            channel_specs: channels.iter().map(|c| Rc::clone(&c.spec)).collect(),
            channels: Vec::new(),
            arg: pending.worker_arg,
        },
        inherited,
    )?;

    setup_channels(Some(&worker_res), Role::Worker, WorkerKind::Internal, &mut channels)?;
    worker_res.with_data_mut(|d| {
        if let Some(w) = d.and_then(|d| d.downcast_mut::<WorkerData>()) {
            w.channels = channels;
        }
    });

    if let Some(cb) = &init_cb {
        cb(Some(&worker_res), init_cb_arg.as_ref())?;
    }

    worker_res.run_event_loop().map_err(Error::from)
}

fn run_external_worker(
    init_cb: Option<InitCallback>,
    init_cb_arg: Option<Rc<dyn Any>>,
    pending: PendingWorkerInit,
) -> Result<()> {
    let mut channels = pending.channels;
    setup_channels(None, Role::Worker, WorkerKind::External, &mut channels)?;
    drop(channels);

    if let Some(cb) = &init_cb {
        cb(None, init_cb_arg.as_ref())?;
    }

    let (argv, envp, prog) = pending
        .external
        .ok_or(Error::Core(sid_core::Error::InvalidArgument))?;
    let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(|c| c.as_c_str()).collect();
    let envp_refs: Vec<&std::ffi::CStr> = envp.iter().map(|c| c.as_c_str()).collect();
    nix::unistd::execve(&prog, &argv_refs, &envp_refs).map_err(Error::from)?;
    unreachable!("execve only returns on error, which is mapped above")
}

/// `sid_wrk_ctl_run_new_worker`: combined fork + run for an external worker
/// whose proxy owns its own event loop (rather than sharing an ancestor's,
/// as [`get_new_worker`] assumes). Returns the new proxy resource; the
/// caller drives its channel traffic by calling `proxy.run_event_loop()`.
pub fn run_new_worker(wc_res: &Resource, params: Params, svc_links: Vec<ServiceLinkDef>) -> Result<Resource> {
    {
        let kind = wc_res.with_data_mut(|d| {
            d.and_then(|d| d.downcast_ref::<WorkerControl>()).map(|wc| wc.kind)
        });
        if kind != Some(WorkerKind::External) {
            return Err(Error::UnsupportedForWorkerType);
        }
    }
    match get_new_worker_impl(wc_res, params, true)? {
        Some(proxy) => Ok(proxy),
        None => run_worker(wc_res, svc_links).map(|()| unreachable!("run_worker never returns Ok in the child")),
    }
}

fn with_channel_mut<R>(res: &Resource, role: Role, chan_id: &str, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
    res.with_data_mut(|d| {
        let d = d?;
        match role {
            Role::Proxy => d.downcast_mut::<crate::worker::WorkerProxyData>()?.channel_mut(chan_id).map(f),
            Role::Worker => d.downcast_mut::<WorkerData>()?.channel_mut(chan_id).map(f),
        }
    })
}

fn setup_channels(owner: Option<&Resource>, role: Role, kind: WorkerKind, channels: &mut [Channel]) -> Result<()> {
    for chan in channels.iter_mut() {
        setup_channel(owner, role, kind, chan)?;
    }
    Ok(())
}

fn setup_channel(owner: Option<&Resource>, role: Role, kind: WorkerKind, chan: &mut Channel) -> Result<()> {
    if role == Role::Worker {
        if let Some(redirect) = worker::ext_redirect_fd(&chan.spec) {
            if let Some(fd) = chan.fd {
                nix::unistd::dup2(fd, redirect).map_err(Error::from)?;
                let _ = nix::unistd::close(fd);
                chan.fd = Some(redirect);
            }
        }
    }

    if kind == WorkerKind::External && role == Role::Worker {
        return Ok(());
    }

    if let (Some(owner), Some(fd)) = (owner, chan.fd) {
        if chan.rx.is_some() {
            let source = register_channel_io(owner, role, chan.id().to_string(), fd)?;
            chan.io_source = Some(source);
        }
    }
    Ok(())
}

fn register_channel_io(
    owner: &Resource,
    role: Role,
    chan_id: String,
    fd: RawFd,
) -> Result<sid_core::EventSource> {
    let loop_ = owner.event_loop_handle()?;
    let cb_res = owner.clone();
    loop_
        .create_io_event_source(fd, true, false, sid_core::PRIORITY_NORMAL, move |readiness: Readiness| {
            on_channel_readable(&cb_res, role, &chan_id, readiness)
        })
        .map_err(Error::from)
        .map_err(Into::into)
}

struct RecvStep {
    cmd: Option<ChannelCommand>,
    payload: Vec<u8>,
    callback: Option<RxCallback>,
    fd_pass: Option<RawFd>,
    eof: bool,
}

/// `_chan_buf_recv`: reads once off `fd`, feeds the channel's rx buffer, and
/// extracts every complete message that results (size-prefix channels can
/// have more than one queued up after a single `read`). Socket-wire
/// `DATA_EXT` messages get their ancillary FD pulled off in the same pass.
fn recv_on_channel(chan: &mut Channel, readiness: Readiness) -> sid_core::Result<Vec<RecvStep>> {
    if readiness.error || readiness.hup_without_read {
        return Err(sid_core::Error::BrokenPipe);
    }
    let fd = chan.fd.ok_or(sid_core::Error::NotConnected)?;
    let is_socket = chan.spec.wire == Wire::Socket;

    // SAFETY: `fd` is owned by `chan` for as long as this channel lives and
    // stays open across the call; this borrow doesn't transfer or drop it.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let mut buf = [0u8; 4096];
    let n = loop {
        match nix::unistd::read(borrowed, &mut buf) {
            Ok(n) => break n,
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => return Ok(Vec::new()),
            Err(e) => return Err(sid_core::Error::from(e)),
        }
    };

    let mode = chan.rx.as_ref().ok_or(sid_core::Error::NotSupported)?.mode();
    let mut steps = Vec::new();

    if n > 0 {
        let rx = chan.rx.as_mut().ok_or(sid_core::Error::NotSupported)?;
        rx.feed(&buf[..n]);
        while rx.is_complete() {
            let (cmd, payload) = rx.take_framed().map_err(|e| match e {
                Error::Core(c) => c,
                _ => sid_core::Error::InvalidArgument,
            })?;
            let fd_pass = if cmd.carries_fd() && is_socket {
                Some(fd_pass::recv_fd(fd).map_err(|e| match e {
                    Error::Core(c) => c,
                    _ => sid_core::Error::InvalidArgument,
                })?)
            } else {
                None
            };
            steps.push(RecvStep {
                cmd: Some(cmd),
                payload,
                callback: chan.rx_spec().callback.clone(),
                fd_pass,
                eof: false,
            });
        }
        return Ok(steps);
    }

    // EOF. Plain-mode channels complete their one (possibly empty) message
    // right here, with the configured suffix appended; size-prefix channels
    // never complete a dangling partial frame, so nothing is delivered.
    if mode == crate::buffer::BufferMode::Plain {
        if let Some(suffix) = chan.rx_spec().data_suffix.clone() {
            chan.rx.as_mut().ok_or(sid_core::Error::NotSupported)?.feed(&suffix);
        }
        let payload = chan.rx.as_mut().ok_or(sid_core::Error::NotSupported)?.take_plain();
        steps.push(RecvStep {
            cmd: None,
            payload,
            callback: chan.rx_spec().callback.clone(),
            fd_pass: None,
            eof: true,
        });
    } else {
        steps.push(RecvStep {
            cmd: None,
            payload: Vec::new(),
            callback: None,
            fd_pass: None,
            eof: true,
        });
    }
    Ok(steps)
}

fn on_channel_readable(res: &Resource, role: Role, chan_id: &str, readiness: Readiness) -> sid_core::Result<()> {
    let outcome = with_channel_mut(res, role, chan_id, |chan| recv_on_channel(chan, readiness));
    let steps = match outcome {
        None => return Ok(()),
        Some(Err(e)) => {
            warn!(chan = chan_id, error = %e, "channel receive failed, tearing down");
            with_channel_mut(res, role, chan_id, |chan| {
                if let Some(rx) = &mut chan.rx {
                    rx.reset();
                }
                chan.io_source = None;
            });
            return Ok(());
        }
        Some(Ok(steps)) => steps,
    };

    let mut saw_eof = false;
    for step in steps {
        if step.eof {
            saw_eof = true;
        }
        if role == Role::Proxy && step.cmd == Some(ChannelCommand::Yield) {
            apply_on_yield_policy(res);
        }
        if let Some(cb) = step.callback {
            if let Err(e) = cb(res, step.cmd, &step.payload, step.fd_pass) {
                warn!(chan = chan_id, error = %e, "channel rx callback failed");
            }
        } else if let Some(fd) = step.fd_pass {
            let _ = nix::unistd::close(fd);
        }
    }
    if saw_eof {
        with_channel_mut(res, role, chan_id, |chan| chan.io_source = None);
    }
    Ok(())
}

/// Runs once a worker-proxy observes a `YIELD` from its worker: looks up the
/// owning worker-control's [`OnYield`] policy (the proxy is always its direct
/// child) and either tears the worker down immediately or parks it as
/// `IDLE` behind a timer.
fn apply_on_yield_policy(proxy_res: &Resource) {
    let policy = proxy_res.parent().and_then(|wc_res| {
        wc_res.with_data_mut(|d| d.and_then(|d| d.downcast_ref::<WorkerControl>()).map(|wc| wc.on_yield))
    });

    match policy.unwrap_or_default() {
        OnYield::TerminateImmediately => terminate_yielded_worker(proxy_res),
        OnYield::ArmIdleTimer(duration) => {
            proxy_res.with_data_mut(|d| {
                if let Some(p) = d.and_then(|d| d.downcast_mut::<crate::worker::WorkerProxyData>()) {
                    p.set_state(WorkerState::Idle);
                }
            });
            arm_idle_timer(proxy_res, duration);
        }
    }
}

fn terminate_yielded_worker(proxy_res: &Resource) {
    let pid = proxy_res.with_data_mut(|d| {
        d.and_then(|d| d.downcast_mut::<crate::worker::WorkerProxyData>()).map(|p| {
            p.set_state(WorkerState::Exiting);
            p.pid
        })
    });
    if let Some(pid) = pid {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM);
    }
}

fn arm_idle_timer(proxy_res: &Resource, duration: Duration) {
    let Ok(loop_) = proxy_res.event_loop_handle() else {
        return;
    };
    let deadline = loop_.clock().now() + duration;
    let timeout_res = proxy_res.clone();
    let Ok(es) = loop_.create_time_event_source(deadline, sid_core::PRIORITY_NORMAL, move |_| {
        terminate_yielded_worker(&timeout_res);
        Ok(())
    }) else {
        return;
    };
    proxy_res.with_data_mut(|d| {
        if let Some(p) = d.and_then(|d| d.downcast_mut::<crate::worker::WorkerProxyData>()) {
            p.idle_timeout_es = Some(es);
        }
    });
}

/// Payload handed to [`chan_send`].
pub struct DataSpec<'a> {
    pub payload: &'a [u8],
    /// A socket-wire channel only: an FD to pass alongside this message via
    /// `SCM_RIGHTS`, sent as `DATA_EXT` rather than plain `DATA`.
    pub fd_pass: Option<RawFd>,
}

/// `sid_wrk_ctl_chan_send`: locates `channel_id` on whichever side of a
/// worker-proxy/worker pair `current_res` belongs to, and sends `data` on
/// it. Proxy-side sends cancel any pending idle timeout and transition the
/// worker to `ASSIGNED` first, per the lifecycle state machine.
pub fn chan_send(current_res: &Resource, channel_id: &str, data: DataSpec) -> Result<()> {
    if channel_id.is_empty() {
        return Err(Error::Core(sid_core::Error::NoChannel));
    }
    if let Some(proxy_res) = find_worker_proxy_ancestor(current_res) {
        send_on(&proxy_res, Role::Proxy, channel_id, data, true)
    } else if let Some(worker_res) = find_worker_ancestor(current_res) {
        send_on(&worker_res, Role::Worker, channel_id, data, false)
    } else {
        Err(Error::Core(sid_core::Error::NoMedium))
    }
}

fn send_on(owner: &Resource, role: Role, channel_id: &str, data: DataSpec, is_proxy_side: bool) -> Result<()> {
    let cmd = if data.fd_pass.is_some() {
        ChannelCommand::DataExt
    } else {
        ChannelCommand::Data
    };

    let tx_prep = owner.with_data_mut(|d| {
        let d = d?;
        let chan = match role {
            Role::Proxy => d.downcast_mut::<crate::worker::WorkerProxyData>()?.channel_mut(channel_id),
            Role::Worker => d.downcast_mut::<WorkerData>()?.channel_mut(channel_id),
        }?;
        let fd = chan.fd?;
        let is_socket = chan.spec.wire == Wire::Socket;
        let callback = chan.tx_spec().callback.clone();
        if let Some(tx) = &mut chan.tx {
            tx.prepare(Some(cmd), data.payload);
        }
        Some((fd, is_socket, callback, chan.tx.is_some()))
    });
    let (fd, is_socket, callback, framed) = tx_prep.ok_or(Error::Core(sid_core::Error::NoChannel))?;

    if is_proxy_side {
        owner.with_data_mut(|d| {
            if let Some(p) = d.and_then(|d| d.downcast_mut::<crate::worker::WorkerProxyData>()) {
                p.idle_timeout_es = None;
                if p.state() != WorkerState::Assigned {
                    p.set_state(WorkerState::Assigned);
                }
            }
        });
    }

    if let Some(cb) = &callback {
        if let Err(e) = cb(owner, Some(cmd), data.payload, data.fd_pass) {
            warn!(chan = channel_id, error = %e, "channel tx callback failed");
        }
    }

    if framed {
        write_tx_buffer(owner, role, channel_id, fd)?;
    } else {
        write_all(fd, data.payload)?;
    }

    if let Some(pass_fd) = data.fd_pass {
        if is_socket {
            fd_pass::send_fd(fd, pass_fd)?;
        }
    }

    owner.with_data_mut(|d| {
        let d = d?;
        let chan = match role {
            Role::Proxy => d.downcast_mut::<crate::worker::WorkerProxyData>()?.channel_mut(channel_id),
            Role::Worker => d.downcast_mut::<WorkerData>()?.channel_mut(channel_id),
        }?;
        if let Some(tx) = &mut chan.tx {
            tx.reset();
        }
        Some(())
    });

    Ok(())
}

fn write_tx_buffer(owner: &Resource, role: Role, channel_id: &str, fd: RawFd) -> Result<()> {
    loop {
        let remaining: Option<Vec<u8>> = owner.with_data_mut(|d| {
            let d = d?;
            let chan = match role {
                Role::Proxy => d.downcast_mut::<crate::worker::WorkerProxyData>()?.channel_mut(channel_id),
                Role::Worker => d.downcast_mut::<WorkerData>()?.channel_mut(channel_id),
            }?;
            let tx = chan.tx.as_ref()?;
            if tx.is_drained() {
                None
            } else {
                Some(tx.remaining().to_vec())
            }
        });
        let Some(remaining) = remaining else { break };
        if remaining.is_empty() {
            break;
        }
        match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &remaining) {
            Ok(n) => {
                owner.with_data_mut(|d| {
                    if let Some(chan) = d.and_then(|d| match role {
                        Role::Proxy => d
                            .downcast_mut::<crate::worker::WorkerProxyData>()
                            .and_then(|p| p.channel_mut(channel_id)),
                        Role::Worker => d
                            .downcast_mut::<WorkerData>()
                            .and_then(|w| w.channel_mut(channel_id)),
                    }) {
                        if let Some(tx) = &mut chan.tx {
                            tx.advance(n);
                        }
                    }
                });
            }
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(())
}

fn write_all(fd: RawFd, mut payload: &[u8]) -> Result<()> {
    while !payload.is_empty() {
        match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, payload) {
            Ok(0) => return Err(Error::Core(sid_core::Error::BrokenPipe)),
            Ok(n) => payload = &payload[n..],
            Err(nix::Error::EINTR) | Err(nix::Error::EAGAIN) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(())
}

/// `sid_wrk_ctl_chan_close`: closes one channel's FD outright (after routing
/// the same send-preparation step `chan_send` does, for parity with the
/// original, which folds close into the same `_channel_prepare_send` path).
pub fn chan_close(current_res: &Resource, channel_id: &str) -> Result<()> {
    if channel_id.is_empty() {
        return Err(Error::Core(sid_core::Error::NoChannel));
    }
    let (owner, role) = if let Some(proxy_res) = find_worker_proxy_ancestor(current_res) {
        (proxy_res, Role::Proxy)
    } else if let Some(worker_res) = find_worker_ancestor(current_res) {
        (worker_res, Role::Worker)
    } else {
        return Err(Error::Core(sid_core::Error::NoMedium));
    };

    owner.with_data_mut(|d| {
        let d = d?;
        let chan = match role {
            Role::Proxy => d.downcast_mut::<crate::worker::WorkerProxyData>()?.channel_mut(channel_id),
            Role::Worker => d.downcast_mut::<WorkerData>()?.channel_mut(channel_id),
        }?;
        chan.io_source = None;
        let _ = chan.close();
        Some(())
    });
    Ok(())
}

/// `sid_wrk_ctl_yield_worker`: called from inside a running worker. Sends a
/// `YIELD` on the first `PipeToProxy`/`Socket` channel it finds, unless the
/// worker has already observed its parent exit (`SIGUSR1`), in which case it
/// terminates itself immediately rather than yielding into a void.
pub fn yield_worker(res: &Resource) -> Result<()> {
    let worker_res = find_worker_ancestor(res).ok_or(Error::Core(sid_core::Error::NoMedium))?;

    let parent_exited = worker_res.with_data_mut(|d| {
        d.and_then(|d| d.downcast_ref::<WorkerData>()).map(|w| w.parent_exited)
    });

    if parent_exited == Some(true) {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGTERM);
        return Ok(());
    }

    let channel_id = worker_res.with_data_mut(|d| {
        d.and_then(|d| d.downcast_ref::<WorkerData>()).and_then(|w| {
            w.channels
                .iter()
                .find(|c| matches!(c.spec.wire, Wire::PipeToProxy | Wire::Socket))
                .map(|c| c.id().to_string())
        })
    });
    let channel_id = channel_id.ok_or(Error::Core(sid_core::Error::NotConnected))?;

    chan_send(
        &worker_res,
        &channel_id,
        DataSpec {
            payload: &[],
            fd_pass: None,
        },
    )?;
    write_yield_command(&worker_res, &channel_id)
}

fn write_yield_command(worker_res: &Resource, channel_id: &str) -> Result<()> {
    // chan_send always frames outgoing data as DATA/DATA_EXT; YIELD carries
    // no payload and needs its own command word, so it's written directly
    // here rather than threaded through chan_send's DataSpec.
    let fd = worker_res.with_data_mut(|d| {
        d.and_then(|d| d.downcast_mut::<WorkerData>())
            .and_then(|w| w.channel_mut(channel_id))
            .and_then(|c| {
                if let Some(tx) = &mut c.tx {
                    tx.prepare(Some(ChannelCommand::Yield), &[]);
                }
                c.fd
            })
    });
    let fd = fd.ok_or(Error::Core(sid_core::Error::NoChannel))?;
    write_tx_buffer(worker_res, Role::Worker, channel_id, fd)
}

/// `sid_wrk_ctl_get_idle_worker`: the first direct worker-proxy child in
/// `WorkerState::Idle`.
pub fn get_idle_worker(wc_res: &Resource) -> Option<Resource> {
    let mut iter = wc_res.iter();
    let mut found = None;
    while let Some(child) = iter.next() {
        let is_idle = child.with_data_mut(|d| {
            d.and_then(|d| d.downcast_ref::<crate::worker::WorkerProxyData>())
                .map(|p| p.state() == WorkerState::Idle)
        });
        if is_idle == Some(true) {
            found = Some(child);
            break;
        }
    }
    found
}

/// `sid_wrk_ctl_find_worker`: the worker-proxy child whose id part equals
/// `id`.
pub fn find_worker(wc_res: &Resource, id: &str) -> Option<Resource> {
    wc_res
        .search(sid_core::SearchMode::ImmDesc, Some(&worker::WORKER_PROXY_TYPE), Some(id))
        .or_else(|| wc_res.search(sid_core::SearchMode::ImmDesc, Some(&worker::WORKER_PROXY_WITH_LOOP_TYPE), Some(id)))
}

pub fn get_worker_state(proxy_res: &Resource) -> Option<WorkerState> {
    proxy_res.with_data_mut(|d| {
        d.and_then(|d| d.downcast_ref::<crate::worker::WorkerProxyData>()).map(|p| p.state())
    })
}

pub fn get_worker_id(proxy_res: &Resource) -> Option<String> {
    proxy_res.with_data_mut(|d| {
        d.and_then(|d| d.downcast_ref::<crate::worker::WorkerProxyData>()).map(|p| p.id.clone())
    })
}

pub fn get_worker_arg(proxy_res: &Resource) -> Option<Rc<dyn Any>> {
    proxy_res.with_data_mut(|d| {
        d.and_then(|d| d.downcast_ref::<crate::worker::WorkerProxyData>())
            .and_then(|p| p.arg.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_spec_none_disables_timer() {
        assert_eq!(TimeoutSpec::NONE.usec, 0);
        assert_eq!(TimeoutSpec::default(), TimeoutSpec::NONE);
    }

    #[test]
    fn chan_send_rejects_empty_channel_id() {
        let root = worker::create_worker(
            None,
            WorkerKickstart {
                channel_specs: vec![],
                channels: vec![],
                arg: None,
            },
            vec![],
        );
        let root = root.expect("worker resource creation");
        let err = chan_send(&root, "", DataSpec { payload: b"x", fd_pass: None }).unwrap_err();
        assert_eq!(err, Error::Core(sid_core::Error::NoChannel));
    }
}
