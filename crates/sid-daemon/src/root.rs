// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The daemon's top-level resource: owns the event loop every worker-control
//! and worker-proxy resource underneath it shares, and exits that loop on
//! `SIGTERM`/`SIGINT`. Grounded in `sid.c`'s `sid_res_type_sid` root node,
//! minus the `systemd`/`logger` service-link wiring those backends would
//! need (out of scope).

use nix::sys::signal::Signal;
use tracing::info;

use sid_core::{CreateFlags, EventSource, Resource, ResourceOps, ResourceType};

/// Holds the root's `SIGTERM`/`SIGINT` registration alive for the resource's
/// lifetime; an `EventSource` unregisters itself as soon as it's dropped.
struct SidData {
    #[allow(dead_code)]
    signal_es: EventSource,
}

struct SidOps;

impl ResourceOps for SidOps {
    fn init(&self, res: &Resource, _params: &sid_core::Params) -> sid_core::Result<Option<sid_core::Data>> {
        let loop_ = res.event_loop_handle()?;
        let sig_res = res.clone();
        let signal_es = loop_
            .create_signal_event_source(
                vec![Signal::SIGTERM as i32, Signal::SIGINT as i32],
                0,
                move |sig| {
                    info!(signal = sig, "shutting down");
                    sig_res.exit_event_loop()
                },
            )
            .map_err(sid_core::Error::from)?;
        Ok(Some(Box::new(SidData { signal_es })))
    }
}

pub static SID_TYPE: ResourceType = ResourceType {
    name: "sid",
    short_name: "sid",
    description: "Top-level daemon resource; owns the shared event loop.",
    with_event_loop: true,
    disallow_isolation: true,
    watchdog: None,
    ops: &SidOps,
};

/// Creates the daemon's root resource, starting a fresh tree and event loop.
pub fn create_root() -> sid_core::Result<Resource> {
    Resource::create_root(&SID_TYPE, CreateFlags::default(), None, &(), 0, vec![])
}
