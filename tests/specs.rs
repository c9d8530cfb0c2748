// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace-level integration tests for the concrete end-to-end scenarios:
//! real `fork()`, real pipes/sockets, real signals. Every scenario here
//! forks an actual child process from inside the test function itself (the
//! same pattern `sid_worker::control::get_new_worker` uses in production),
//! so each one is `#[serial]` — they share global signal-handling state
//! (`signal-hook`'s self-pipe) that concurrent forking tests would race on.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serial_test::serial;

use sid_core::{CreateFlags, Resource, ResourceOps, ResourceType};
use sid_worker::control::{self, DataSpec};
use sid_worker::{ChannelCommand, ChannelSpec, Params, TimeoutSpec, WorkerControlConfig, WorkerKindConfig, WorkerState, Wire};

struct TestRootOps;

impl ResourceOps for TestRootOps {
    fn init(&self, _res: &Resource, _params: &sid_core::Params) -> sid_core::Result<Option<sid_core::Data>> {
        Ok(None)
    }
}

/// Stands in for `sidd`'s `sid` root resource: owns the shared event loop
/// every worker-control/worker-proxy resource created under it in these
/// tests rides on.
static TEST_ROOT: ResourceType = ResourceType {
    name: "test-root",
    short_name: "troot",
    description: "integration-test root resource owning the shared event loop",
    with_event_loop: true,
    disallow_isolation: false,
    watchdog: None,
    ops: &TestRootOps,
};

fn test_root() -> Resource {
    Resource::create_root(&TEST_ROOT, CreateFlags::default(), None, &(), 0, vec![]).expect("root resource")
}

/// Runs `root`'s event loop until something calls `exit_event_loop` (a test
/// callback observing the event it's waiting for) or `bound` elapses,
/// whichever comes first. The bound exists so a test failure shows up as a
/// failed assertion after a short wait rather than a hung test process.
fn run_bounded(root: &Resource, bound: Duration) {
    let loop_ = root.event_loop_handle().expect("root owns a loop");
    let loop_for_cb = loop_.clone();
    let _bound_guard = loop_
        .create_time_event_source(Instant::now() + bound, i32::MAX, move |_| {
            loop_for_cb.request_exit();
            Ok(())
        })
        .expect("bound timer");
    root.run_event_loop().expect("event loop run");
}

fn worker_pid(proxy: &Resource) -> i32 {
    proxy
        .with_data(|d| {
            d.and_then(|d| d.downcast_ref::<sid_worker::WorkerProxyData>())
                .map(|p| p.pid)
        })
        .expect("worker-proxy data carries a pid")
}

fn terminate_and_reap(pid: i32) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM);
    let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(pid), None);
}

/// Scenario 1: two channels, `req` = pipe-to-worker, `resp` =
/// pipe-to-proxy, both size-prefix. The worker echoes whatever it reads on
/// `req` back out on `resp`. Sending `"hi!"` must transition the proxy
/// `NEW -> ASSIGNED` and deliver exactly `"hi!"` to the proxy's rx callback.
#[test]
#[serial]
fn echo_over_pipe_pair() {
    let root = test_root();
    let wc = control::create(
        &root,
        Some("echo"),
        WorkerControlConfig::new(WorkerKindConfig::Internal),
        &[],
    )
    .expect("worker-control resource");

    let mut req = ChannelSpec::new("req", Wire::PipeToWorker).expect("req spec");
    req.worker_rx.callback = Some(Rc::new(|res, cmd, payload, _fd| {
        assert_eq!(cmd, Some(ChannelCommand::Data));
        control::chan_send(res, "resp", DataSpec { payload, fd_pass: None })
    }));

    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let received_cb = Rc::clone(&received);
    let mut resp = ChannelSpec::new("resp", Wire::PipeToProxy).expect("resp spec");
    resp.proxy_rx.callback = Some(Rc::new(move |res, _cmd, payload, _fd| {
        *received_cb.borrow_mut() = Some(payload.to_vec());
        res.exit_event_loop().map_err(sid_worker::Error::from)
    }));

    let proxy = match control::get_new_worker(
        &wc,
        Params {
            channel_specs: vec![req, resp],
            ..Default::default()
        },
    )
    .expect("fork a worker")
    {
        Some(proxy) => proxy,
        None => {
            control::run_worker(&wc, vec![]).expect("run internal worker");
            std::process::exit(0);
        }
    };

    assert_eq!(control::get_worker_state(&proxy), Some(WorkerState::New));
    control::chan_send(&proxy, "req", DataSpec { payload: b"hi!", fd_pass: None }).expect("send hi!");
    assert_eq!(control::get_worker_state(&proxy), Some(WorkerState::Assigned));

    run_bounded(&root, Duration::from_secs(2));

    assert_eq!(received.borrow().as_deref(), Some(b"hi!".as_slice()));
    terminate_and_reap(worker_pid(&proxy));
}

/// Scenario 2: the worker yields once assigned. The proxy must
/// observe the `YIELD` command and, under the default
/// [`sid_worker::OnYield::TerminateImmediately`] policy, transition
/// `ASSIGNED -> EXITING` and send `SIGTERM`; reaping the child then drives
/// it to `EXITED`.
#[test]
#[serial]
fn yield_and_reap() {
    let root = test_root();
    let wc = control::create(
        &root,
        Some("yielder"),
        WorkerControlConfig::new(WorkerKindConfig::Internal),
        &[],
    )
    .expect("worker-control resource");

    let mut assign = ChannelSpec::new("assign", Wire::PipeToWorker).expect("assign spec");
    assign.worker_rx.callback = Some(Rc::new(|res, _cmd, _payload, _fd| control::yield_worker(res)));

    let observed_yield: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
    let observed_cb = Rc::clone(&observed_yield);
    let mut resp = ChannelSpec::new("resp", Wire::PipeToProxy).expect("resp spec");
    resp.proxy_rx.callback = Some(Rc::new(move |res, cmd, _payload, _fd| {
        if cmd == Some(ChannelCommand::Yield) {
            *observed_cb.borrow_mut() = true;
            res.exit_event_loop().map_err(sid_worker::Error::from)?;
        }
        Ok(())
    }));

    let proxy = match control::get_new_worker(
        &wc,
        Params {
            channel_specs: vec![assign, resp],
            ..Default::default()
        },
    )
    .expect("fork a worker")
    {
        Some(proxy) => proxy,
        None => {
            control::run_worker(&wc, vec![]).expect("run internal worker");
            std::process::exit(0);
        }
    };

    control::chan_send(&proxy, "assign", DataSpec { payload: &[], fd_pass: None }).expect("assign");
    assert_eq!(control::get_worker_state(&proxy), Some(WorkerState::Assigned));

    run_bounded(&root, Duration::from_secs(2));
    assert!(*observed_yield.borrow(), "proxy must observe the YIELD command");
    assert_eq!(control::get_worker_state(&proxy), Some(WorkerState::Exiting));

    // The default policy already sent SIGTERM from inside the YIELD
    // handler; wait out the reap to confirm EXITED is reached.
    run_bounded(&root, Duration::from_secs(2));
    assert_eq!(control::get_worker_state(&proxy), Some(WorkerState::Exited));
}

/// Scenario 3: an FD sent over a socket-wire channel round-trips
/// through the worker and back. The fd the parent receives back is
/// positive, distinct from the one it originally opened, and `fstat`
/// confirms both describe the same underlying file.
#[test]
#[serial]
fn fd_passing_round_trips_through_worker() {
    let root = test_root();
    let wc = control::create(
        &root,
        Some("fdpass"),
        WorkerControlConfig::new(WorkerKindConfig::Internal),
        &[],
    )
    .expect("worker-control resource");

    let mut sock = ChannelSpec::new("sock", Wire::Socket).expect("sock spec");
    sock.worker_rx.callback = Some(Rc::new(|res, cmd, _payload, fd| {
        assert_eq!(cmd, Some(ChannelCommand::DataExt));
        let fd = fd.expect("DATA_EXT over a socket carries an fd");
        let result = control::chan_send(res, "sock", DataSpec { payload: b"pong", fd_pass: Some(fd) });
        let _ = nix::unistd::close(fd);
        result
    }));

    let forwarded: Rc<RefCell<Option<RawFd>>> = Rc::new(RefCell::new(None));
    let forwarded_cb = Rc::clone(&forwarded);
    sock.proxy_rx.callback = Some(Rc::new(move |res, cmd, _payload, fd| {
        if cmd == Some(ChannelCommand::DataExt) {
            *forwarded_cb.borrow_mut() = fd;
            res.exit_event_loop().map_err(sid_worker::Error::from)?;
        }
        Ok(())
    }));

    let proxy = match control::get_new_worker(
        &wc,
        Params {
            channel_specs: vec![sock],
            ..Default::default()
        },
    )
    .expect("fork a worker")
    {
        Some(proxy) => proxy,
        None => {
            control::run_worker(&wc, vec![]).expect("run internal worker");
            std::process::exit(0);
        }
    };

    let original = nix::fcntl::open("/dev/null", nix::fcntl::OFlag::O_RDWR, nix::sys::stat::Mode::empty())
        .expect("open /dev/null");
    control::chan_send(&proxy, "sock", DataSpec { payload: b"ping", fd_pass: Some(original) })
        .expect("send ping with fd");

    run_bounded(&root, Duration::from_secs(2));

    let received = forwarded.borrow().expect("proxy observed the forwarded fd");
    assert_ne!(received, original, "receiver must get a distinct fd");
    let st_original = nix::sys::stat::fstat(original).expect("fstat original");
    let st_received = nix::sys::stat::fstat(received).expect("fstat received");
    assert_eq!(st_original.st_rdev, st_received.st_rdev);

    let _ = nix::unistd::close(original);
    let _ = nix::unistd::close(received);
    terminate_and_reap(worker_pid(&proxy));
}

/// Scenario 4: an external worker's stdout, redirected onto a
/// `pipe_to_proxy` channel with a `data_suffix`, completes exactly once on
/// EOF with the accumulated bytes plus the suffix appended.
#[test]
#[serial]
fn plain_mode_channel_completes_on_eof() {
    let root = test_root();
    let wc = control::create(
        &root,
        Some("ext"),
        WorkerControlConfig::new(WorkerKindConfig::External),
        &[],
    )
    .expect("worker-control resource");

    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let received_cb = Rc::clone(&received);
    let mut out = ChannelSpec::new("out", Wire::PipeToProxy)
        .expect("out spec")
        .with_ext_wire_extension(stdout_fd());
    out.proxy_rx.data_suffix = Some(vec![0u8]);
    out.proxy_rx.callback = Some(Rc::new(move |res, cmd, payload, _fd| {
        assert_eq!(cmd, None, "plain-mode channels carry no command header");
        *received_cb.borrow_mut() = Some(payload.to_vec());
        res.exit_event_loop().map_err(sid_worker::Error::from)
    }));

    let proxy = match control::get_new_worker(
        &wc,
        Params {
            channel_specs: vec![out],
            external: Some(sid_worker::ExternalParams {
                exec_file: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "printf 'A\\nB\\n'".to_string()],
                env: vec![],
            }),
            ..Default::default()
        },
    )
    .expect("fork a worker")
    {
        Some(proxy) => proxy,
        None => {
            control::run_worker(&wc, vec![]).expect("exec external worker");
            unreachable!("execve only returns on error, surfaced above");
        }
    };

    run_bounded(&root, Duration::from_secs(5));

    assert_eq!(received.borrow().as_deref(), Some(b"A\nB\n\0".as_slice()));
    let _ = nix::sys::wait::waitpid(nix::unistd::Pid::from_raw(worker_pid(&proxy)), None);
}

fn stdout_fd() -> RawFd {
    1
}

/// Scenario 5: a short exec timeout fires while the worker is
/// unresponsive (it never yields or sends anything); the proxy transitions
/// to `TIMED_OUT` and, once the signal reaps the child, to `EXITED`.
#[test]
#[serial]
fn exec_timeout_then_reap() {
    let root = test_root();
    let wc = control::create(
        &root,
        Some("timeout"),
        WorkerControlConfig::new(WorkerKindConfig::Internal).with_default_timeout(TimeoutSpec {
            usec: 50_000,
            signum: nix::sys::signal::Signal::SIGTERM as i32,
        }),
        &[],
    )
    .expect("worker-control resource");

    let proxy = match control::get_new_worker(&wc, Params::default()).expect("fork a worker") {
        Some(proxy) => proxy,
        None => {
            // Never yields, never sends: just waits to be timed out.
            control::run_worker(&wc, vec![]).expect("run internal worker");
            std::process::exit(0);
        }
    };

    assert_eq!(control::get_worker_state(&proxy), Some(WorkerState::New));

    run_bounded(&root, Duration::from_millis(500));
    assert_eq!(
        control::get_worker_state(&proxy),
        Some(WorkerState::Exited),
        "exec timeout must fire, then the reap must follow, within the bound"
    );
}

/// Scenario 5's other half: `signum = 0` disables the signal but
/// still transitions the proxy to `TIMED_OUT`.
#[test]
#[serial]
fn exec_timeout_with_no_signal_still_marks_timed_out() {
    let root = test_root();
    let wc = control::create(
        &root,
        Some("timeout-nosig"),
        WorkerControlConfig::new(WorkerKindConfig::Internal).with_default_timeout(TimeoutSpec {
            usec: 50_000,
            signum: 0,
        }),
        &[],
    )
    .expect("worker-control resource");

    let proxy = match control::get_new_worker(&wc, Params::default()).expect("fork a worker") {
        Some(proxy) => proxy,
        None => {
            control::run_worker(&wc, vec![]).expect("run internal worker");
            std::process::exit(0);
        }
    };

    run_bounded(&root, Duration::from_millis(300));
    assert_eq!(control::get_worker_state(&proxy), Some(WorkerState::TimedOut));

    terminate_and_reap(worker_pid(&proxy));
}
