// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource tree and event-loop binding: the two layers every other
//! subsystem in the daemon (worker control among them) is built on.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod clock;
pub mod error;
pub mod reactor;
pub mod resource;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{Error, Result};
pub use reactor::{ChildExit, EventLoop, EventSource, Readiness, PRIORITY_NORMAL};
pub use resource::{
    same_type, CreateFlags, Data, Params, ResIter, Resource, ResourceOps, ResourceType,
    SearchMode, ServiceLinkDef,
};
