// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The resource tree: typed, reference-counted nodes with parent/child
//! links, optional owned event loops, and typed search/iteration.
//!
//! Nodes live in an arena (`Tree`) rather than behind individually boxed,
//! self-referential pointers: a resource handle is an arena index plus a
//! shared handle to the owning tree, not a pointer into the node itself.
//! Sibling order is kept as an intrusive doubly linked list threaded through
//! the arena slots so an iterator can retain `(prev, current, next)` across
//! removal of `current` without the index shifts a `Vec`-based child list
//! would cause.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::reactor::EventLoop;

/// Opaque per-resource payload. Type descriptors produce and consume these
/// through `init`/`destroy`; the tree itself never inspects the contents.
pub type Data = Box<dyn Any>;

/// Parameters passed into `ResourceOps::init`. Opaque to the tree.
pub type Params = dyn Any;

/// The operations a resource type supplies: a trait object stands in for a
/// vtable here, not a class hierarchy.
pub trait ResourceOps: Send + Sync {
    /// Runs after the node is linked into the tree and its event loop (if
    /// any) is created. Returning `Err` aborts construction; the tree rolls
    /// the partially built node back.
    fn init(&self, res: &Resource, params: &Params) -> Result<Option<Data>>;

    /// Runs during `destroy`, after all descendants are gone but before the
    /// node unlinks from its parent. Best-effort: the tree logs a non-`Ok`
    /// return but otherwise ignores it.
    fn destroy(&self, _res: &Resource) -> Result<()> {
        Ok(())
    }
}

/// Immutable resource type descriptor. Identity is by address — two
/// `&'static ResourceType` values name the same type iff they point at the
/// same static.
pub struct ResourceType {
    pub name: &'static str,
    pub short_name: &'static str,
    pub description: &'static str,
    pub with_event_loop: bool,
    pub disallow_isolation: bool,
    /// When set, `create` arms a watchdog at this interval on the nearest
    /// loop-owning ancestor right after the resource's own event loop (if
    /// any) is created. Mirrors the original's `reg->with_watchdog` check in
    /// `_create_resource`.
    pub watchdog: Option<std::time::Duration>,
    pub ops: &'static dyn ResourceOps,
}

pub fn same_type(a: &'static ResourceType, b: &'static ResourceType) -> bool {
    std::ptr::eq(a, b)
}

/// A named target a resource can notify of state changes (readiness,
/// status, log lines). The concrete delivery mechanism (systemd, a logger)
/// is an external collaborator; the tree only carries the definition and,
/// for `cloneable` links, decides whether a forked child inherits it.
#[derive(Debug, Clone)]
pub struct ServiceLinkDef {
    pub name: &'static str,
    pub cloneable: bool,
}

/// Flags passed to `create`, independent of the type's own attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateFlags {
    pub disallow_isolation: bool,
}

/// Search modes for `Resource::search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// The immediate parent only.
    ImmAnc,
    /// Any ancestor, nearest first.
    Anc,
    /// Direct children only.
    ImmDesc,
    /// Depth-first across the whole subtree rooted at `start`.
    WideDfs,
    /// The topmost ancestor (root of the tree `start` belongs to).
    Top,
}

type NodeId = usize;

struct Node {
    ty: &'static ResourceType,
    id: String,
    pid_created: i32,
    refcount: usize,
    data: Option<Data>,
    event_loop: Option<EventLoop>,
    service_links: Vec<ServiceLinkDef>,
    flags: CreateFlags,
    priority: i32,

    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    last_child: Option<NodeId>,
    prev_sibling: Option<NodeId>,
    next_sibling: Option<NodeId>,
    child_count: usize,
}

struct Tree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
}

impl Tree {
    fn get(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("dangling resource handle")
    }

    fn get_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("dangling resource handle")
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn link_child(&mut self, parent: NodeId, child: NodeId) {
        let prev_tail = self.get(parent).last_child;
        {
            let c = self.get_mut(child);
            c.parent = Some(parent);
            c.prev_sibling = prev_tail;
            c.next_sibling = None;
        }
        if let Some(tail) = prev_tail {
            self.get_mut(tail).next_sibling = Some(child);
        } else {
            self.get_mut(parent).first_child = Some(child);
        }
        self.get_mut(parent).last_child = Some(child);
        self.get_mut(parent).child_count += 1;
    }

    /// Removes `child` from its parent's sibling list without touching its
    /// own subtree. No-op if already detached.
    fn unlink_child(&mut self, child: NodeId) {
        let (parent, prev, next) = {
            let c = self.get(child);
            (c.parent, c.prev_sibling, c.next_sibling)
        };
        let Some(parent) = parent else { return };

        match prev {
            Some(p) => self.get_mut(p).next_sibling = next,
            None => self.get_mut(parent).first_child = next,
        }
        match next {
            Some(n) => self.get_mut(n).prev_sibling = prev,
            None => self.get_mut(parent).last_child = prev,
        }
        self.get_mut(parent).child_count -= 1;

        let c = self.get_mut(child);
        c.parent = None;
        c.prev_sibling = None;
        c.next_sibling = None;
    }

    fn children_rev(&self, parent: NodeId) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.get(parent).child_count);
        let mut cur = self.get(parent).last_child;
        while let Some(id) = cur {
            out.push(id);
            cur = self.get(id).prev_sibling;
        }
        out
    }

    fn children_fwd(&self, parent: NodeId) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.get(parent).child_count);
        let mut cur = self.get(parent).first_child;
        while let Some(id) = cur {
            out.push(id);
            cur = self.get(id).next_sibling;
        }
        out
    }

    fn free_node(&mut self, id: NodeId) {
        self.nodes[id] = None;
        self.free.push(id);
    }
}

/// A handle to one node in a resource tree. Cheap to clone; clones share the
/// same underlying arena slot, not a copy of the node.
#[derive(Clone)]
pub struct Resource {
    tree: Rc<RefCell<Tree>>,
    id: NodeId,
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.tree, &other.tree) && self.id == other.id
    }
}
impl Eq for Resource {}

impl Resource {
    /// Creates a root resource with no parent, starting a new tree. Worker
    /// control and the daemon's top-level resource both start here.
    pub fn create_root(
        ty: &'static ResourceType,
        flags: CreateFlags,
        id_part: Option<&str>,
        params: &Params,
        priority: i32,
        service_link_defs: Vec<ServiceLinkDef>,
    ) -> Result<Resource> {
        let tree = Rc::new(RefCell::new(Tree {
            nodes: Vec::new(),
            free: Vec::new(),
        }));
        Self::create_in(tree, None, ty, flags, id_part, params, priority, service_link_defs)
    }

    /// Creates `ty` as a child of `self`.
    pub fn create_child(
        &self,
        ty: &'static ResourceType,
        flags: CreateFlags,
        id_part: Option<&str>,
        params: &Params,
        priority: i32,
        service_link_defs: Vec<ServiceLinkDef>,
    ) -> Result<Resource> {
        Self::create_in(
            Rc::clone(&self.tree),
            Some(self.id),
            ty,
            flags,
            id_part,
            params,
            priority,
            service_link_defs,
        )
    }

    fn create_in(
        tree: Rc<RefCell<Tree>>,
        parent: Option<NodeId>,
        ty: &'static ResourceType,
        flags: CreateFlags,
        id_part: Option<&str>,
        params: &Params,
        priority: i32,
        service_link_defs: Vec<ServiceLinkDef>,
    ) -> Result<Resource> {
        let id = match id_part {
            Some(part) if !part.is_empty() => format!("{}/{}", ty.name, part),
            Some(_) => return Err(Error::InvalidArgument),
            None => ty.name.to_string(),
        };

        let pid_created = std::process::id() as i32;

        let node_id = {
            let mut t = tree.borrow_mut();
            let node = Node {
                ty,
                id: id.clone(),
                pid_created,
                refcount: 1,
                data: None,
                event_loop: None,
                service_links: service_link_defs,
                flags,
                priority,
                parent,
                first_child: None,
                last_child: None,
                prev_sibling: None,
                next_sibling: None,
                child_count: 0,
            };
            let nid = t.alloc(node);
            if let Some(p) = parent {
                t.link_child(p, nid);
            }
            nid
        };

        let res = Resource {
            tree: Rc::clone(&tree),
            id: node_id,
        };

        if ty.with_event_loop {
            match EventLoop::new() {
                Ok(loop_) => tree.borrow_mut().get_mut(node_id).event_loop = Some(loop_),
                Err(e) => {
                    res.rollback();
                    return Err(e);
                }
            }
        }

        if let Some(interval) = ty.watchdog {
            if let Err(e) = res.set_watchdog(interval) {
                res.rollback();
                return Err(e);
            }
        }

        match ty.ops.init(&res, params) {
            Ok(data) => {
                tree.borrow_mut().get_mut(node_id).data = data;
                debug!(id = %id, "resource created");
                Ok(res)
            }
            Err(e) => {
                res.rollback();
                Err(e)
            }
        }
    }

    /// Tears down a half-built node: any children it may have started (none
    /// normally, since `init` runs after linking but before returning the
    /// handle to the caller) plus the node itself, without running
    /// `ty.destroy` (construction never completed).
    fn rollback(&self) {
        let child_ids = self.tree.borrow().children_rev(self.id);
        for c in child_ids {
            Resource {
                tree: Rc::clone(&self.tree),
                id: c,
            }
            .destroy_recursive(false);
        }
        let mut t = self.tree.borrow_mut();
        t.unlink_child(self.id);
        t.free_node(self.id);
    }

    pub fn add_ref(&self) {
        self.tree.borrow_mut().get_mut(self.id).refcount += 1;
    }

    /// Decrements the reference count; when it reaches zero the node (and
    /// its subtree) is destroyed.
    pub fn unref(&self) {
        let remaining = {
            let mut t = self.tree.borrow_mut();
            let n = t.get_mut(self.id);
            n.refcount = n.refcount.saturating_sub(1);
            n.refcount
        };
        if remaining == 0 {
            self.destroy_recursive(true);
        }
    }

    /// Destroys this resource unconditionally (used by owners holding the
    /// only reference, and internally by `unref`).
    pub fn destroy(&self) {
        self.destroy_recursive(true);
    }

    fn destroy_recursive(&self, run_destroy_hook: bool) {
        let child_ids = self.tree.borrow().children_rev(self.id);
        for c in child_ids {
            Resource {
                tree: Rc::clone(&self.tree),
                id: c,
            }
            .destroy_recursive(true);
        }

        let (ty, id, pid_created) = {
            let t = self.tree.borrow();
            let n = t.get(self.id);
            (n.ty, n.id.clone(), n.pid_created)
        };

        if run_destroy_hook {
            if let Err(e) = ty.ops.destroy(self) {
                debug!(id = %id, error = %e, "type destroy hook returned an error (ignored)");
            }
        }

        let current_pid = std::process::id() as i32;
        if current_pid != pid_created {
            debug!(
                id = %id,
                pid_created,
                pid_current = current_pid,
                "destroying resource created in a different process (post-fork teardown)"
            );
        } else {
            debug!(id = %id, "destroying resource");
        }

        // Dropping the event loop unregisters every source it still owns.
        let mut t = self.tree.borrow_mut();
        t.get_mut(self.id).event_loop = None;
        t.get_mut(self.id).data = None;
        t.unlink_child(self.id);
        t.free_node(self.id);
    }

    pub fn id(&self) -> String {
        self.tree.borrow().get(self.id).id.clone()
    }

    /// The portion of the id after `"<type.name>/"`, if any.
    pub fn id_part(&self) -> Option<String> {
        let t = self.tree.borrow();
        let n = t.get(self.id);
        let prefix = format!("{}/", n.ty.name);
        n.id.strip_prefix(&prefix).map(|s| s.to_string())
    }

    pub fn res_type(&self) -> &'static ResourceType {
        self.tree.borrow().get(self.id).ty
    }

    pub fn priority(&self) -> i32 {
        self.tree.borrow().get(self.id).priority
    }

    /// The service link defs this resource was created with.
    pub fn service_links(&self) -> Vec<ServiceLinkDef> {
        self.tree.borrow().get(self.id).service_links.clone()
    }

    /// Walks self then ancestors, collecting every `cloneable` service link
    /// def reachable from here. A forked worker starts a brand new tree via
    /// `create_root`, severed from the worker-control's own tree, so any
    /// link the spawning side wants the child to keep must be copied across
    /// explicitly rather than inherited through the arena.
    pub fn cloneable_service_links(&self) -> Vec<ServiceLinkDef> {
        let mut out = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(res) = cur {
            out.extend(res.service_links().into_iter().filter(|l| l.cloneable));
            cur = res.parent();
        }
        out
    }

    pub fn with_data<R>(&self, f: impl FnOnce(Option<&Data>) -> R) -> R {
        let t = self.tree.borrow();
        f(t.get(self.id).data.as_ref())
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(Option<&mut Data>) -> R) -> R {
        let mut t = self.tree.borrow_mut();
        f(t.get_mut(self.id).data.as_mut())
    }

    pub fn parent(&self) -> Option<Resource> {
        self.tree.borrow().get(self.id).parent.map(|id| Resource {
            tree: Rc::clone(&self.tree),
            id,
        })
    }

    pub fn top_level(&self) -> Resource {
        let mut cur = self.clone();
        while let Some(p) = cur.parent() {
            cur = p;
        }
        cur
    }

    pub fn matches(&self, ty: Option<&'static ResourceType>, id_suffix: Option<&str>) -> bool {
        if let Some(ty) = ty {
            if !same_type(self.res_type(), ty) {
                return false;
            }
        }
        if let Some(suffix) = id_suffix {
            return self.id_part().as_deref() == Some(suffix);
        }
        true
    }

    /// Runs the resource's owned event loop (or its nearest loop-owning
    /// ancestor's), per `res_ev_loop_run`. Only the loop's own internal
    /// state is borrowed while dispatching — the tree's `RefCell` is not
    /// held across `run`, so callbacks remain free to create/destroy
    /// resources and event sources of their own.
    pub fn run_event_loop(&self) -> Result<()> {
        let loop_ = self.owned_event_loop()?;
        loop_.run()
    }

    pub fn exit_event_loop(&self) -> Result<()> {
        let loop_ = self.owned_event_loop()?;
        loop_.request_exit();
        Ok(())
    }

    pub fn set_watchdog(&self, interval: std::time::Duration) -> Result<()> {
        let loop_ = self.owned_event_loop()?;
        loop_.set_watchdog(interval);
        Ok(())
    }

    fn owned_event_loop(&self) -> Result<EventLoop> {
        let owner = self.nearest_loop_owner(true)?;
        let t = owner.tree.borrow();
        Ok(t.get(owner.id)
            .event_loop
            .clone()
            .expect("nearest_loop_owner invariant"))
    }

    /// Walks self, then ancestors, for the first node owning an event loop.
    pub(crate) fn nearest_loop_owner(&self, error_if_not_found: bool) -> Result<Resource> {
        let mut cur = self.clone();
        loop {
            let has_loop = self.tree.borrow().get(cur.id).event_loop.is_some();
            if has_loop {
                return Ok(cur);
            }
            match cur.parent() {
                Some(p) => cur = p,
                None => {
                    if error_if_not_found {
                        debug!(id = %self.id(), "no event-loop-owning ancestor reachable");
                        return Err(Error::NoMedium);
                    }
                    return Err(Error::NoMedium);
                }
            }
        }
    }

    /// Fetches a clone of the handle to the nearest owned event loop, for
    /// callers (worker control) that register sources on it directly.
    pub fn event_loop_handle(&self) -> Result<EventLoop> {
        self.owned_event_loop()
    }

    /// Detaches from the parent, reparenting children to the grandparent.
    /// Rejects nodes that own a loop or have no parent.
    pub fn isolate(&self) -> Result<()> {
        self.check_isolatable()?;
        let (parent, children) = {
            let t = self.tree.borrow();
            let n = t.get(self.id);
            (n.parent.expect("checked above"), t.children_fwd(self.id))
        };
        {
            let mut t = self.tree.borrow_mut();
            for c in &children {
                t.unlink_child(*c);
                t.link_child(parent, *c);
            }
            t.unlink_child(self.id);
        }
        debug!(id = %self.id(), "isolated (children reparented)");
        Ok(())
    }

    /// Detaches from the parent as a unit; its children stay attached to it.
    pub fn isolate_with_children(&self) -> Result<()> {
        self.check_isolatable()?;
        self.tree.borrow_mut().unlink_child(self.id);
        debug!(id = %self.id(), "isolated with children");
        Ok(())
    }

    fn check_isolatable(&self) -> Result<()> {
        let t = self.tree.borrow();
        let n = t.get(self.id);
        if n.event_loop.is_some() {
            return Err(Error::NotPermitted);
        }
        if n.parent.is_none() {
            return Err(Error::NotPermitted);
        }
        if n.flags.disallow_isolation || n.ty.disallow_isolation {
            return Err(Error::NotPermitted);
        }
        Ok(())
    }

    /// Reparents an orphan resource under `self`. Rejects a resource that
    /// already has a parent.
    pub fn add_child(&self, child: &Resource) -> Result<()> {
        if !Rc::ptr_eq(&self.tree, &child.tree) {
            return Err(Error::InvalidArgument);
        }
        if self.tree.borrow().get(child.id).parent.is_some() {
            return Err(Error::NotPermitted);
        }
        self.tree.borrow_mut().link_child(self.id, child.id);
        Ok(())
    }

    pub fn search(
        &self,
        mode: SearchMode,
        ty: Option<&'static ResourceType>,
        id_suffix: Option<&str>,
    ) -> Option<Resource> {
        match mode {
            SearchMode::ImmAnc => {
                let p = self.parent()?;
                p.matches(ty, id_suffix).then_some(p)
            }
            SearchMode::Anc => {
                let mut cur = self.parent();
                while let Some(c) = cur {
                    if c.matches(ty, id_suffix) {
                        return Some(c);
                    }
                    cur = c.parent();
                }
                None
            }
            SearchMode::ImmDesc => {
                let children = self.tree.borrow().children_fwd(self.id);
                for cid in children {
                    let c = Resource {
                        tree: Rc::clone(&self.tree),
                        id: cid,
                    };
                    if c.matches(ty, id_suffix) {
                        return Some(c);
                    }
                }
                None
            }
            SearchMode::WideDfs => self.wide_dfs(ty, id_suffix),
            SearchMode::Top => {
                let top = self.top_level();
                top.matches(ty, id_suffix).then_some(top)
            }
        }
    }

    fn wide_dfs(&self, ty: Option<&'static ResourceType>, id_suffix: Option<&str>) -> Option<Resource> {
        let mut queue: VecDeque<NodeId> = self.tree.borrow().children_fwd(self.id).into();
        while let Some(cur_id) = queue.pop_front() {
            let cur = Resource {
                tree: Rc::clone(&self.tree),
                id: cur_id,
            };
            if cur.matches(ty, id_suffix) {
                return Some(cur);
            }
            for cid in self.tree.borrow().children_fwd(cur_id) {
                queue.push_back(cid);
            }
        }
        None
    }

    pub fn iter(&self) -> ResIter {
        let (prev, next) = {
            let t = self.tree.borrow();
            let n = t.get(self.id);
            (n.last_child, n.first_child)
        };
        ResIter {
            tree: Rc::clone(&self.tree),
            owner: self.id,
            prev,
            current: None,
            next,
        }
    }
}

/// Bidirectional, removal-safe iterator over a resource's immediate
/// children. Tracks a `(prev, current, next)` triplet: each direction only
/// updates the pointer it consumes, so destroying `current` between calls
/// never invalidates whichever of `prev`/`next` the next call reads.
pub struct ResIter {
    tree: Rc<RefCell<Tree>>,
    owner: NodeId,
    prev: Option<NodeId>,
    current: Option<NodeId>,
    next: Option<NodeId>,
}

impl ResIter {
    pub fn reset(&mut self) {
        let t = self.tree.borrow();
        let n = t.get(self.owner);
        self.prev = n.last_child;
        self.current = None;
        self.next = n.first_child;
    }

    pub fn current(&self) -> Option<Resource> {
        self.current.map(|id| Resource {
            tree: Rc::clone(&self.tree),
            id,
        })
    }

    pub fn next(&mut self) -> Option<Resource> {
        let nid = self.next?;
        self.current = Some(nid);
        self.next = self.tree.borrow().get(nid).next_sibling;
        self.current()
    }

    pub fn previous(&mut self) -> Option<Resource> {
        let pid = self.prev?;
        self.current = Some(pid);
        self.prev = self.tree.borrow().get(pid).prev_sibling;
        self.current()
    }

    /// Destroys the current node (if any) via `Resource::destroy` and
    /// clears `current`; `prev`/`next` remain valid for further traversal.
    pub fn destroy_current(&mut self) {
        if let Some(id) = self.current.take() {
            Resource {
                tree: Rc::clone(&self.tree),
                id,
            }
            .destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopOps;
    impl ResourceOps for NoopOps {
        fn init(&self, _res: &Resource, _params: &Params) -> Result<Option<Data>> {
            Ok(None)
        }
    }

    static LEAF: ResourceType = ResourceType {
        name: "test/leaf",
        short_name: "leaf",
        description: "test leaf resource",
        with_event_loop: false,
        disallow_isolation: false,
        watchdog: None,
        ops: &NoopOps,
    };

    static BRANCH: ResourceType = ResourceType {
        name: "test/branch",
        short_name: "branch",
        description: "test branch resource",
        with_event_loop: false,
        disallow_isolation: false,
        watchdog: None,
        ops: &NoopOps,
    };

    fn root() -> Resource {
        Resource::create_root(&LEAF, CreateFlags::default(), None, &(), 0, vec![]).unwrap()
    }

    #[test]
    fn id_composition() {
        let r = root();
        assert_eq!(r.id(), "test/leaf");
        let c = r
            .create_child(&BRANCH, CreateFlags::default(), Some("a"), &(), 0, vec![])
            .unwrap();
        assert_eq!(c.id(), "test/branch/a");
        assert_eq!(c.id_part().as_deref(), Some("a"));
    }

    #[test]
    fn empty_id_part_rejected() {
        let r = root();
        let err = r
            .create_child(&BRANCH, CreateFlags::default(), Some(""), &(), 0, vec![])
            .unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn isolation_reparents_children_in_order() {
        // P has children [A, B, C]; B has children [X, Y].
        let p = root();
        let a = p
            .create_child(&LEAF, CreateFlags::default(), Some("a"), &(), 0, vec![])
            .unwrap();
        let b = p
            .create_child(&BRANCH, CreateFlags::default(), Some("b"), &(), 0, vec![])
            .unwrap();
        let c = p
            .create_child(&LEAF, CreateFlags::default(), Some("c"), &(), 0, vec![])
            .unwrap();
        let x = b
            .create_child(&LEAF, CreateFlags::default(), Some("x"), &(), 0, vec![])
            .unwrap();
        let y = b
            .create_child(&LEAF, CreateFlags::default(), Some("y"), &(), 0, vec![])
            .unwrap();

        b.isolate().unwrap();

        let ids: Vec<String> = {
            let mut it = p.iter();
            let mut v = vec![];
            while let Some(r) = it.next() {
                v.push(r.id());
            }
            v
        };
        assert_eq!(
            ids,
            vec![a.id(), x.id(), y.id(), c.id()],
            "isolate(B) must leave P's children as [A, X, Y, C]"
        );
    }

    #[test]
    fn isolate_rejects_node_without_parent() {
        let r = root();
        assert_eq!(r.isolate().unwrap_err(), Error::NotPermitted);
    }

    #[test]
    fn add_child_rejects_already_parented() {
        let p1 = root();
        let p2 = Resource::create_root(&LEAF, CreateFlags::default(), None, &(), 0, vec![]).unwrap();
        let c = p1
            .create_child(&LEAF, CreateFlags::default(), Some("c"), &(), 0, vec![])
            .unwrap();
        assert_eq!(p2.add_child(&c).unwrap_err(), Error::NotPermitted);
    }

    #[test]
    fn search_immediate_descendant_by_id() {
        let p = root();
        let _a = p
            .create_child(&LEAF, CreateFlags::default(), Some("a"), &(), 0, vec![])
            .unwrap();
        let b = p
            .create_child(&LEAF, CreateFlags::default(), Some("b"), &(), 0, vec![])
            .unwrap();
        let found = p
            .search(SearchMode::ImmDesc, Some(&LEAF), Some("b"))
            .unwrap();
        assert_eq!(found, b);
    }

    #[test]
    fn search_ancestor_walk() {
        let p = root();
        let mid = p
            .create_child(&BRANCH, CreateFlags::default(), None, &(), 0, vec![])
            .unwrap();
        let leaf = mid
            .create_child(&LEAF, CreateFlags::default(), Some("deep"), &(), 0, vec![])
            .unwrap();
        assert_eq!(leaf.search(SearchMode::ImmAnc, None, None).unwrap(), mid);
        assert_eq!(leaf.search(SearchMode::Anc, Some(&LEAF), None).unwrap(), p);
        assert_eq!(leaf.search(SearchMode::Top, None, None).unwrap(), p);
    }

    #[test]
    fn destroy_runs_post_order() {
        use std::sync::{Arc, Mutex};

        struct RecordingOps(Arc<Mutex<Vec<&'static str>>>);
        impl ResourceOps for RecordingOps {
            fn init(&self, _res: &Resource, _params: &Params) -> Result<Option<Data>> {
                Ok(None)
            }
            fn destroy(&self, res: &Resource) -> Result<()> {
                self.0.lock().unwrap().push(Box::leak(res.id().into_boxed_str()));
                Ok(())
            }
        }

        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let ops: &'static RecordingOps = Box::leak(Box::new(RecordingOps(Arc::clone(&log))));
        let ty: &'static ResourceType = Box::leak(Box::new(ResourceType {
            name: "test/rec",
            short_name: "rec",
            description: "",
            with_event_loop: false,
            disallow_isolation: false,
            watchdog: None,
            ops,
        }));

        let p = Resource::create_root(ty, CreateFlags::default(), None, &(), 0, vec![]).unwrap();
        let _c = p
            .create_child(ty, CreateFlags::default(), Some("child"), &(), 0, vec![])
            .unwrap();

        p.destroy();

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, vec!["test/rec/child", "test/rec"]);
    }

    #[test]
    fn unref_to_zero_destroys() {
        let p = root();
        let c = p
            .create_child(&LEAF, CreateFlags::default(), Some("c"), &(), 0, vec![])
            .unwrap();
        c.add_ref();
        c.unref();
        // Still alive: one ref remains.
        assert!(p.search(SearchMode::ImmDesc, Some(&LEAF), Some("c")).is_some());
        c.unref();
        assert!(p.search(SearchMode::ImmDesc, Some(&LEAF), Some("c")).is_none());
    }
}

/// Property tests for the tree's ordering invariants: isolating a node
/// preserves sibling order under the new parent for an arbitrary number of
/// siblings either side of it, and post-order destroy always visits every
/// descendant exactly once, children before the parent that held them.
#[cfg(test)]
mod tree_properties {
    use super::*;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    struct NoopOps;
    impl ResourceOps for NoopOps {
        fn init(&self, _res: &Resource, _params: &Params) -> Result<Option<Data>> {
            Ok(None)
        }
    }

    static NODE: ResourceType = ResourceType {
        name: "prop/node",
        short_name: "node",
        description: "",
        with_event_loop: false,
        disallow_isolation: false,
        watchdog: None,
        ops: &NoopOps,
    };

    fn make_root() -> Resource {
        Resource::create_root(&NODE, CreateFlags::default(), None, &(), 0, vec![]).unwrap()
    }

    proptest! {
        /// Invariant: with `before` siblings ahead of `target` and `after`
        /// behind it, and `grandchildren` children of `target` itself,
        /// `isolate(target)` leaves the parent's children as
        /// `before ++ grandchildren ++ after`, in the original relative
        /// order of each group.
        #[test]
        fn isolate_preserves_order(before in 0usize..5, grandchildren in 0usize..5, after in 0usize..5) {
            let p = make_root();
            let mut expected = Vec::new();

            for i in 0..before {
                let id = format!("before-{i}");
                p.create_child(&NODE, CreateFlags::default(), Some(&id), &(), 0, vec![]).unwrap();
                expected.push(id);
            }

            let target = p
                .create_child(&NODE, CreateFlags::default(), Some("target"), &(), 0, vec![])
                .unwrap();
            for i in 0..grandchildren {
                let id = format!("grand-{i}");
                target.create_child(&NODE, CreateFlags::default(), Some(&id), &(), 0, vec![]).unwrap();
                expected.push(id);
            }

            for i in 0..after {
                let id = format!("after-{i}");
                p.create_child(&NODE, CreateFlags::default(), Some(&id), &(), 0, vec![]).unwrap();
                expected.push(id);
            }

            target.isolate().unwrap();

            let mut it = p.iter();
            let mut got = Vec::new();
            while let Some(r) = it.next() {
                got.push(r.id_part().unwrap());
            }
            prop_assert_eq!(got, expected);
        }

        /// Invariant: for a tree of arbitrary branching built from `widths`
        /// (one entry per level, reused across siblings at that level),
        /// destroying the root visits every node exactly once and always
        /// visits a node's children before the node itself.
        #[test]
        fn destroy_visits_every_descendant_once_in_post_order(widths in prop::collection::vec(1usize..4, 1..4)) {
            // Each node's destroy hook records its own globally unique tag
            // (a monotonically increasing counter, not the resource id,
            // since ids are only unique *within a parent* — two nodes under
            // different parents may legitimately share an id).
            struct RecordingOps(Arc<Mutex<Vec<u32>>>);
            impl ResourceOps for RecordingOps {
                fn init(&self, _res: &Resource, _params: &Params) -> Result<Option<Data>> {
                    // Real tag is stashed right after creation via `with_data_mut`;
                    // this placeholder just gives that call a `Some` to overwrite.
                    Ok(Some(Box::new(0u32)))
                }
                fn destroy(&self, res: &Resource) -> Result<()> {
                    let tag = res.with_data(|d| *d.and_then(|d| d.downcast_ref::<u32>()).unwrap());
                    self.0.lock().unwrap().push(tag);
                    Ok(())
                }
            }

            let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
            let ops: &'static RecordingOps = Box::leak(Box::new(RecordingOps(Arc::clone(&log))));
            let ty: &'static ResourceType = Box::leak(Box::new(ResourceType {
                name: "prop/rec",
                short_name: "rec",
                description: "",
                with_event_loop: false,
                disallow_isolation: false,
                watchdog: None,
                ops,
            }));

            let mut next_tag = 0u32;
            let mut alloc_tag = move || {
                let t = next_tag;
                next_tag += 1;
                t
            };

            let root_tag = alloc_tag();
            let root = Resource::create_root(ty, CreateFlags::default(), None, &(), 0, vec![]).unwrap();
            root.with_data_mut(|d| *d.unwrap() = Box::new(root_tag));

            // parent_of[child_tag] = parent_tag, for every non-root node.
            let mut parent_of: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
            let mut all_tags = vec![root_tag];
            let mut frontier = vec![(root.clone(), root_tag)];
            for (level, &width) in widths.iter().enumerate() {
                let mut next = Vec::new();
                for (parent, parent_tag) in &frontier {
                    for i in 0..width {
                        let id = format!("l{level}-{i}");
                        let tag = alloc_tag();
                        let child = parent
                            .create_child(ty, CreateFlags::default(), Some(&id), &(), 0, vec![])
                            .unwrap();
                        child.with_data_mut(|d| *d.unwrap() = Box::new(tag));
                        parent_of.insert(tag, *parent_tag);
                        all_tags.push(tag);
                        next.push((child, tag));
                    }
                }
                frontier = next;
            }

            root.destroy();

            let seen = log.lock().unwrap().clone();
            prop_assert_eq!(seen.len(), all_tags.len(), "every node must be destroyed exactly once");

            let position: std::collections::HashMap<u32, usize> =
                seen.iter().enumerate().map(|(i, tag)| (*tag, i)).collect();
            for (&child, &parent) in &parent_of {
                prop_assert!(
                    position[&child] < position[&parent],
                    "child {child} must be destroyed before its parent {parent}"
                );
            }
        }
    }
}
