// simbridge: procedural-interface bridge for HDL simulators.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

// The facade: one uniform surface over whichever procedural interfaces
// the simulator actually provides.
//
// All state lives in a Gpi context: the backend registry and the three
// handle arenas, plus embedding state. The context sits in a
// thread-local cell owned by the simulator's thread (the only thread
// there is, per the cooperative model); `with` hands out short-lived
// borrows. The one rule that keeps reentrancy sound: no borrow is ever
// held across a call into user or runtime code. Dispatch therefore
// splits into fire-entry (borrow, transition, copy out the user
// function), the call itself (no borrow), and fire-exit (borrow,
// settle the state machine).
//
// The extern "C" wrappers at the bottom are the stable ABI the hosted
// runtime links against. They translate Results into sentinel returns
// plus a thread-local last-error record, because C callers cannot
// receive a Result.

use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};

use crate::arena::{Arena, Id, IdClass};
use crate::backend::{Backend, Cursor, CursorState, Registry, Selector, SimulatorInfo};
use crate::callback::{
    classify_edge, Callback, CbFunc, CbKind, CbSpec, Edge, EdgeSet, FireExit,
};
use crate::embed::{self, Embedding, EventKind, RuntimeHooks};
use crate::error::{Error, ErrorCode, Result};
use crate::extra;
use crate::naming::Component;
use crate::object::{Object, ObjectKind};
use crate::value::{self, Bit, SetAction, Value};


pub struct Gpi {
    registry: Registry,
    objects: Arena<Object>,
    callbacks: Arena<Callback>,
    iterators: Arena<Cursor>,
    pub embed: Embedding,
    // Value-change callbacks bound to each object, so release can
    // sweep them.
    bindings: HashMap<Id, Vec<Id>>,
    // High-water mark enforcing time monotonicity across dispatches.
    last_time: u64,
}

impl Gpi {
    pub fn new() -> Gpi {
        Gpi {
            registry: Registry::new(),
            objects: Arena::new(IdClass::Object),
            callbacks: Arena::new(IdClass::Callback),
            iterators: Arena::new(IdClass::Iterator),
            embed: Embedding::new(),
            bindings: HashMap::new(),
            last_time: 0,
        }
    }

    pub fn register_backend(&mut self, backend: Box<dyn Backend>) -> usize {
        self.registry.register(backend)
    }

    pub fn backend_count(&self) -> usize {
        self.registry.len()
    }

    // The live window: simulator identity captured at simulation
    // start, and no shutdown seen yet.
    fn require_live(&self, op: &'static str) -> Result<()> {
        if self.embed.info.is_some() && !self.embed.down {
            Ok(())
        } else {
            Err(Error::NotReady(op))
        }
    }

    pub fn capture_info(&mut self) -> Result<SimulatorInfo> {
        if let Some(info) = &self.embed.info {
            // Idempotent per process; a second interface announcing
            // start-of-simulation changes nothing.
            return Ok(info.clone());
        }
        let backend = self
            .registry
            .first()
            .ok_or(Error::NotReady("simulation start"))?;
        let info = backend.sim_info()?;
        self.embed.info = Some(info.clone());
        Ok(info)
    }

    /*
     * Hierarchy navigation
     */

    pub fn root_handle(&mut self, name: Option<&str>) -> Result<Id> {
        self.require_live("get_root_handle")?;
        let mut found = None;
        for (idx, backend) in self.registry.ordered() {
            match backend.root(name) {
                Ok(Some(seed)) => {
                    found = Some((idx, seed));
                    break;
                }
                Ok(None) => (),
                // A backend that cannot answer just loses its turn.
                Err(e) => e.report("root discovery"),
            }
        }
        let (idx, seed) = found.ok_or_else(|| {
            Error::NotFound(format!(
                "root handle {:?}",
                name.unwrap_or("<first top>")
            ))
        })?;
        let obj = Object::new(idx, seed)?;
        Ok(self.objects.insert(obj))
    }

    // Name lookup, routed through the parent's backend. The name may
    // be a whole relative path in that backend's convention; escaped
    // identifiers pass through whole.
    pub fn child_by_name(&mut self, parent: Id, name: &str) -> Result<Id> {
        self.require_live("get_by_name")?;
        let backend_idx = self.objects.get(parent)?.backend;
        let components = self.registry.get(backend_idx)?.convention().split(name);
        if components.is_empty() {
            return Err(Error::NotFound(name.to_string()));
        }
        // Walk component by component; intermediate discoveries are
        // released as soon as the walk moves past them.
        let mut current: Option<Object> = None;
        for comp in &components {
            let next_seed = {
                let backend = self.registry.get(backend_idx)?;
                let obj = match &current {
                    Some(o) => o,
                    None => self.objects.get(parent)?,
                };
                let found = match comp {
                    Component::Name(n) => backend.child_by_name(obj, n)?,
                    Component::Index(i) => {
                        obj.require_indexable("index lookup")?;
                        let position = obj.meta.position_of(*i)?;
                        backend.child_by_position(obj, position)?
                    }
                };
                match found {
                    Some(seed) => seed,
                    None => {
                        return Err(Error::NotFound(format!(
                            "{} under {}",
                            name, obj.meta.fullname
                        )))
                    }
                }
            };
            if let Some(o) = current.take() {
                self.registry.get(backend_idx)?.release_object(o.raw);
            }
            current = Some(Object::new(backend_idx, next_seed)?);
        }
        let obj = current.ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(self.objects.insert(obj))
    }

    pub fn child_by_index(&mut self, parent: Id, index: i64) -> Result<Id> {
        self.require_live("get_by_index")?;
        let (idx, seed) = {
            let obj = self.objects.get(parent)?;
            obj.require_indexable("index lookup")?;
            let position = obj.meta.position_of(index)?;
            let backend = self.registry.get(obj.backend)?;
            match backend.child_by_position(obj, position)? {
                Some(seed) => (obj.backend, seed),
                None => return Err(Error::InvalidIndex(index)),
            }
        };
        let obj = Object::new(idx, seed)?;
        Ok(self.objects.insert(obj))
    }

    pub fn iterate(&mut self, parent: Id, selector: Selector) -> Result<Id> {
        self.require_live("iterate")?;
        let cursor = {
            let obj = self.objects.get(parent)?;
            let backend = self.registry.get(obj.backend)?;
            Cursor {
                backend: obj.backend,
                selector,
                state: backend.iterate(obj, selector)?,
            }
        };
        Ok(self.iterators.insert(cursor))
    }

    // Advance an iterator. None is the terminal sentinel: once a
    // cursor ends, every further call ends the same way.
    pub fn iter_next(&mut self, it: Id) -> Result<Option<Id>> {
        let (idx, seed) = {
            let cursor = self.iterators.get_mut(it)?;
            if let CursorState::Done = cursor.state {
                return Ok(None);
            }
            let backend = self.registry.get(cursor.backend)?;
            match backend.cursor_next(&mut cursor.state)? {
                Some(seed) => (cursor.backend, seed),
                None => {
                    backend.cursor_free(&mut cursor.state);
                    cursor.state = CursorState::Done;
                    return Ok(None);
                }
            }
        };
        let obj = Object::new(idx, seed)?;
        Ok(Some(self.objects.insert(obj)))
    }

    pub fn object(&self, id: Id) -> Result<&Object> {
        self.objects.get(id)
    }

    pub fn object_mut(&mut self, id: Id) -> Result<&mut Object> {
        self.objects.get_mut(id)
    }

    // Identity comparison: same backend, same raw pointer. Two
    // discoveries of one design object compare equal here even though
    // their ids differ.
    pub fn same_object(&self, a: Id, b: Id) -> Result<bool> {
        let oa = self.objects.get(a)?;
        let ob = self.objects.get(b)?;
        Ok(oa.backend == ob.backend && oa.raw == ob.raw)
    }

    /*
     * Value I/O
     */

    pub fn get_binstr(&self, id: Id) -> Result<String> {
        self.require_live("get_value_binstr")?;
        let obj = self.objects.get(id)?;
        obj.require_signal("get_value_binstr")?;
        match obj.meta.kind {
            ObjectKind::Real | ObjectKind::Str => Err(Error::WrongKind {
                op: "get_value_binstr",
                kind: obj.meta.kind.label(),
            }),
            _ => {
                let backend = self.registry.get(obj.backend)?;
                backend.read_binstr(obj)
            }
        }
    }

    pub fn get_long(&self, id: Id) -> Result<i64> {
        self.require_live("get_value_long")?;
        let obj = self.objects.get(id)?;
        obj.require_signal("get_value_long")?;
        match obj.meta.kind {
            ObjectKind::Real | ObjectKind::Str => Err(Error::WrongKind {
                op: "get_value_long",
                kind: obj.meta.kind.label(),
            }),
            _ => {
                let backend = self.registry.get(obj.backend)?;
                backend.read_long(obj)
            }
        }
    }

    pub fn get_real(&self, id: Id) -> Result<f64> {
        self.require_live("get_value_real")?;
        let obj = self.objects.get(id)?;
        if obj.meta.kind != ObjectKind::Real {
            return Err(Error::WrongKind {
                op: "get_value_real",
                kind: obj.meta.kind.label(),
            });
        }
        let backend = self.registry.get(obj.backend)?;
        backend.read_real(obj)
    }

    pub fn get_str(&self, id: Id) -> Result<String> {
        self.require_live("get_value_str")?;
        let obj = self.objects.get(id)?;
        if obj.meta.kind != ObjectKind::Str {
            return Err(Error::WrongKind {
                op: "get_value_str",
                kind: obj.meta.kind.label(),
            });
        }
        let backend = self.registry.get(obj.backend)?;
        backend.read_str(obj)
    }

    pub fn set_value(&self, id: Id, val: Value, action: SetAction) -> Result<()> {
        self.require_live("set_value")?;
        let obj = self.objects.get(id)?;
        obj.require_signal("set_value")?;
        if obj.meta.is_const && action != SetAction::Release {
            return Err(Error::NotWritable(obj.meta.fullname.clone()));
        }
        if let Value::BinStr(s) = &val {
            // Catch alphabet and width mistakes here, with a good
            // message, rather than let a backend truncate silently.
            value::parse_binstr(s)?;
            if let Some(len) = obj.meta.length {
                if s.len() != len as usize {
                    return Err(Error::WrongKind {
                        op: "set_value",
                        kind: "bit-string of mismatched length",
                    });
                }
            }
        }
        let backend = self.registry.get(obj.backend)?;
        backend.write(obj, &val, action)
    }

    /*
     * Callback registration
     */

    fn insert_callback(&mut self, kind: CbKind, backend: usize, spec: CbSpec) -> Id {
        self.callbacks.insert(Callback::new(kind, backend, spec))
    }

    fn first_backend_index(&self) -> Result<usize> {
        if self.registry.len() == 0 {
            Err(Error::NotReady("callback registration"))
        } else {
            Ok(0)
        }
    }

    pub fn register_timed(&mut self, steps: u64) -> Result<Id> {
        self.require_live("register_timed")?;
        let idx = self.first_backend_index()?;
        let spec = CbSpec { kind: CbKind::Timed, steps, signal: None };
        Ok(self.insert_callback(CbKind::Timed, idx, spec))
    }

    pub fn register_next_step(&mut self) -> Result<Id> {
        self.require_live("register_next_time_step")?;
        let idx = self.first_backend_index()?;
        let spec = CbSpec { kind: CbKind::NextStep, steps: 0, signal: None };
        Ok(self.insert_callback(CbKind::NextStep, idx, spec))
    }

    pub fn register_read_only(&mut self) -> Result<Id> {
        self.require_live("register_read_only")?;
        let idx = self.first_backend_index()?;
        let spec = CbSpec { kind: CbKind::ReadOnly, steps: 0, signal: None };
        Ok(self.insert_callback(CbKind::ReadOnly, idx, spec))
    }

    pub fn register_read_write(&mut self) -> Result<Id> {
        self.require_live("register_read_write")?;
        let idx = self.first_backend_index()?;
        let spec = CbSpec { kind: CbKind::ReadWrite, steps: 0, signal: None };
        Ok(self.insert_callback(CbKind::ReadWrite, idx, spec))
    }

    pub fn register_value_change(&mut self, signal: Id, edges: EdgeSet) -> Result<Id> {
        self.require_live("register_value_change")?;
        let (backend_idx, raw) = {
            let obj = self.objects.get(signal)?;
            obj.require_signal("register_value_change")?;
            (obj.backend, obj.raw)
        };
        let spec = CbSpec {
            kind: CbKind::ValueChange,
            steps: 0,
            signal: Some(raw),
        };
        let mut cb = Callback::new(CbKind::ValueChange, backend_idx, spec);
        cb.bound = Some(signal);
        cb.edges = edges;
        let id = self.callbacks.insert(cb);
        self.bindings.entry(signal).or_insert_with(Vec::new).push(id);
        Ok(id)
    }

    // Install the user function and arm the callback with its owning
    // backend. This is the FREE -> PRIMED edge.
    pub fn set_user(&mut self, id: Id, func: CbFunc, data: *mut c_void) -> Result<()> {
        {
            let cb = self.callbacks.get_mut(id)?;
            cb.set_user(func, data)?;
        }
        let armed = self.arm_callback(id);
        if armed.is_err() {
            // A callback that never armed is not worth keeping around.
            self.discard_callback(id);
        }
        armed
    }

    fn arm_callback(&mut self, id: Id) -> Result<()> {
        // Sample the current level so the first wakeup can be
        // classified as an edge. An already-high signal must not
        // satisfy a rising request.
        let prev = self.observe_bound_level(id)?;
        let cb = self.callbacks.get_mut(id)?;
        cb.prev = prev;
        let backend = self.registry.get(cb.backend)?;
        let token = backend.cb_arm(&cb.spec, id.raw())?;
        cb.arm(token)
    }

    pub fn deregister(&mut self, id: Id) -> Result<()> {
        let deferred = {
            let cb = self.callbacks.get_mut(id)?;
            cb.deregister()
        };
        if !deferred {
            self.remove_callback(id, false);
        }
        Ok(())
    }

    // Tear a callback out: native registration first, then the arena
    // entry and any binding. `fired` says the native token was already
    // consumed by the simulator.
    fn remove_callback(&mut self, id: Id, fired: bool) {
        let info = {
            match self.callbacks.get(id) {
                Ok(cb) => Some((cb.backend, cb.spec.clone(), cb.cookie, cb.bound)),
                Err(_) => None,
            }
        };
        if let Some((backend_idx, spec, token, bound)) = info {
            if !token.is_null() {
                if let Ok(backend) = self.registry.get(backend_idx) {
                    if let Err(e) = backend.cb_disarm(&spec, token, id.raw(), fired) {
                        e.report("callback removal");
                    }
                }
            }
            if let Some(bound) = bound {
                if let Some(list) = self.bindings.get_mut(&bound) {
                    list.retain(|x| *x != id);
                }
            }
            let _ = self.callbacks.remove(id);
        }
    }

    fn discard_callback(&mut self, id: Id) {
        if let Ok(cb) = self.callbacks.get(id) {
            let bound = cb.bound;
            if let Some(bound) = bound {
                if let Some(list) = self.bindings.get_mut(&bound) {
                    list.retain(|x| *x != id);
                }
            }
        }
        let _ = self.callbacks.remove(id);
    }

    /*
     * Dispatch (driven by the module-level dispatch fn)
     */

    // Fire-entry: PRIMED -> CALL, plus the edge predicate for
    // value-change wakeups. Returns the user function to run, or None
    // when the wakeup was swallowed.
    pub fn fire_entry(&mut self, id: Id) -> Result<Option<(CbFunc, *mut c_void)>> {
        let observed = self.observe_bound_level(id)?;
        let cb = self.callbacks.get_mut(id)?;
        let pair = cb.fire_entry()?;
        if cb.kind == CbKind::ValueChange {
            let prev = cb.prev;
            cb.prev = observed;
            let edge = classify_edge(prev, observed.unwrap_or(Bit::X));
            let wanted = match edge {
                Some(e) => cb.edges.contains(e),
                // Not a clean edge; only an any-change subscription
                // cares.
                None => cb.edges == EdgeSet::all(),
            };
            if !wanted {
                cb.swallow()?;
                return Ok(None);
            }
        }
        Ok(Some(pair))
    }

    fn observe_bound_level(&self, id: Id) -> Result<Option<Bit>> {
        let cb = self.callbacks.get(id)?;
        if cb.kind != CbKind::ValueChange {
            return Ok(None);
        }
        let bound = match cb.bound {
            Some(b) => b,
            None => return Ok(None),
        };
        let obj = self.objects.get(bound)?;
        let backend = self.registry.get(cb.backend)?;
        Ok(backend
            .read_binstr(obj)?
            .chars()
            .last()
            .and_then(|c| Bit::from_char(c).ok()))
    }

    // Fire-exit: settle the state machine after the user function
    // returned. A nonzero status is a test error escaping the
    // callback; the caller forwards the returned event once no borrow
    // is held.
    pub fn fire_exit(
        &mut self,
        id: Id,
        status: c_int,
    ) -> Result<Option<(EventKind, String)>> {
        if status != 0 {
            let kind = {
                let cb = self.callbacks.get_mut(id)?;
                cb.force_delete();
                cb.kind
            };
            self.remove_callback(id, !kind.recurring());
            return Ok(Some((
                EventKind::TestError,
                format!("user callback returned status {}", status),
            )));
        }
        let exit = {
            let cb = self.callbacks.get_mut(id)?;
            cb.fire_exit()?
        };
        match exit {
            FireExit::Rearm => {
                let cb = self.callbacks.get_mut(id)?;
                let backend = self.registry.get(cb.backend)?;
                let token = backend.cb_rearm(&cb.spec, cb.cookie, id.raw())?;
                cb.cookie = token;
                Ok(None)
            }
            FireExit::Remove => {
                let recurring = self
                    .callbacks
                    .get(id)
                    .map(|cb| cb.kind.recurring())
                    .unwrap_or(false);
                // A recurring callback deleted mid-dispatch still owns
                // a live native registration; one-shot tokens were
                // consumed by the firing itself.
                self.remove_callback(id, !recurring);
                Ok(None)
            }
        }
    }

    /*
     * Release & teardown
     */

    pub fn release(&mut self, raw: u64) -> Result<()> {
        if let Ok(id) = Id::decode(raw, IdClass::Object) {
            if self.objects.contains(id) {
                return self.release_object(id);
            }
        }
        if let Ok(id) = Id::decode(raw, IdClass::Iterator) {
            if self.iterators.contains(id) {
                return self.release_iterator(id);
            }
        }
        Err(Error::InvalidHandle(raw))
    }

    fn release_object(&mut self, id: Id) -> Result<()> {
        // Callbacks bound to a dying handle go with it; the user finds
        // out from the log rather than from a stale dispatch.
        if let Some(cbs) = self.bindings.remove(&id) {
            for cb in cbs {
                if self.callbacks.contains(cb) {
                    log::info!(
                        "deregistering value-change callback bound to released handle"
                    );
                    let _ = self.deregister(cb);
                }
            }
        }
        let obj = self.objects.remove(id)?;
        if let Ok(backend) = self.registry.get(obj.backend) {
            backend.release_object(obj.raw);
        }
        Ok(())
    }

    fn release_iterator(&mut self, id: Id) -> Result<()> {
        let mut cursor = self.iterators.remove(id)?;
        if let Ok(backend) = self.registry.get(cursor.backend) {
            backend.cursor_free(&mut cursor.state);
        }
        Ok(())
    }

    /*
     * Time
     */

    pub fn sim_time(&mut self) -> Result<(u32, u32)> {
        let backend = self.registry.first().ok_or(Error::NotReady("get_sim_time"))?;
        let (hi, lo) = backend.time();
        let t = ((hi as u64) << 32) | lo as u64;
        if t < self.last_time {
            log::warn!(
                "simulator time ran backwards ({} after {}); clamping",
                t,
                self.last_time
            );
        } else {
            self.last_time = t;
        }
        let t = self.last_time;
        Ok(((t >> 32) as u32, t as u32))
    }

    pub fn sim_precision(&self) -> Result<i32> {
        let backend = self
            .registry
            .first()
            .ok_or(Error::NotReady("get_sim_precision"))?;
        Ok(backend.precision())
    }

    pub fn end_sim(&mut self) -> Result<()> {
        self.require_live("sim_end")?;
        let backend = self.registry.first().ok_or(Error::NotReady("sim_end"))?;
        backend.stop()
    }

    // Release everything we registered with the simulator. Errors are
    // logged and do not stop later steps.
    pub fn teardown(&mut self) {
        for id in self.callbacks.ids() {
            self.remove_callback(id, false);
        }
        for (_, mut cursor) in self.iterators.drain() {
            if let Ok(backend) = self.registry.get(cursor.backend) {
                backend.cursor_free(&mut cursor.state);
            }
        }
        for (_, obj) in self.objects.drain() {
            if let Ok(backend) = self.registry.get(obj.backend) {
                backend.release_object(obj.raw);
            }
        }
        self.bindings.clear();
        self.embed.mark_down();
    }
}


thread_local! {
    static CTX: RefCell<Gpi> = RefCell::new(Gpi::new());
}

// Short-lived access to the context. Everything runs on the
// simulator's thread; never call into user code from inside.
pub fn with<R>(f: impl FnOnce(&mut Gpi) -> R) -> R {
    CTX.with(|c| f(&mut c.borrow_mut()))
}


// Run one callback to completion: fire-entry under a borrow, the user
// function with no borrow held, fire-exit under a borrow again, then
// any event the exit produced. This is what every backend trampoline
// calls.
pub fn dispatch(raw: u64) {
    let id = match Id::decode(raw, IdClass::Callback) {
        Ok(id) => id,
        Err(e) => {
            e.report("callback dispatch");
            return;
        }
    };
    let pair = match with(|g| g.fire_entry(id)) {
        Ok(Some(pair)) => pair,
        Ok(None) => return,
        Err(e) => {
            e.report("callback dispatch");
            return;
        }
    };
    let (func, data) = pair;
    let status = func(data);
    match with(|g| g.fire_exit(id, status)) {
        Ok(Some((kind, message))) => emit_event(kind, &message),
        Ok(None) => (),
        Err(e) => e.report("callback dispatch"),
    }
}

// Deliver an out-of-band event to the runtime and, for terminal
// events, run teardown afterwards.
pub fn emit_event(kind: EventKind, message: &str) {
    let hooks = with(|g| g.embed.hooks);
    embed::call_event(hooks.as_ref(), kind, message);
    match kind {
        EventKind::Shutdown | EventKind::Abort => with(|g| g.teardown()),
        EventKind::TestError => (),
    }
}

// The start-of-simulation sequence, driven by whichever backend's
// native callback fires first. A second interface announcing startup
// finds the work already done.
pub fn simulation_started() {
    if with(|g| g.embed.initialized || g.embed.info.is_some()) {
        return;
    }
    let info = match with(|g| g.capture_info()) {
        Ok(info) => info,
        Err(e) => {
            e.report("simulation start");
            return;
        }
    };
    log::info!(
        "simulation started under {} {} (precision 10^{} s)",
        info.product,
        info.version,
        info.precision
    );
    match extra::load_from_env() {
        Ok(libs) => with(|g| g.embed.hold(libs)),
        Err(e) => {
            e.report("extra libraries");
            emit_event(EventKind::Abort, "extra library load failed");
            return;
        }
    }
    if !with(|g| g.embed.hooks.is_some()) {
        match embed::bootstrap() {
            Ok(Some(lib)) => with(|g| g.embed.hold(vec![lib])),
            Ok(None) => (),
            Err(e) => e.report("runtime bootstrap"),
        }
    }
    match with(|g| g.embed.hooks) {
        Some(hooks) => match embed::call_init(&hooks, &info) {
            Ok(()) => with(|g| g.embed.initialized = true),
            Err(e) => {
                e.report("runtime init");
                emit_event(EventKind::Abort, "hosted runtime failed to initialize");
            }
        },
        None => log::warn!("no hosted runtime attached; nothing will drive the test"),
    }
}

pub fn simulation_ended() {
    emit_event(EventKind::Shutdown, "end of simulation");
}


/*
 * The C ABI
 */

thread_local! {
    static LAST_ERROR: RefCell<Option<Error>> = RefCell::new(None);
    static LAST_ERROR_TEXT: RefCell<Option<CString>> = RefCell::new(None);
}

fn record_error(e: Error) {
    e.report("gpi");
    let internal = matches!(e, Error::Internal(_));
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(e));
    // A failed invariant is not something to keep simulating on top
    // of: tell the runtime, then shut the bridge down in order.
    if internal && !with(|g| g.embed.down) {
        emit_event(EventKind::Abort, "internal invariant failure");
    }
}

fn clear_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

// Collapse a Result into a sentinel for C, recording the error kind.
fn sentinel<T>(r: Result<T>, null: T) -> T {
    match r {
        Ok(v) => {
            clear_error();
            v
        }
        Err(e) => {
            record_error(e);
            null
        }
    }
}

fn status(r: Result<()>) -> c_int {
    match r {
        Ok(()) => {
            clear_error();
            0
        }
        Err(e) => {
            let code = e.code();
            record_error(e);
            i32::from(code)
        }
    }
}

unsafe fn opt_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        None
    } else {
        CStr::from_ptr(p).to_str().ok()
    }
}

fn object_id(raw: u64) -> Result<Id> {
    Id::decode(raw, IdClass::Object)
}

fn callback_id(raw: u64) -> Result<Id> {
    Id::decode(raw, IdClass::Callback)
}


#[no_mangle]
pub extern "C" fn gpi_attach_runtime(hooks: *const RuntimeHooks) -> c_int {
    if hooks.is_null() {
        return i32::from(ErrorCode::InvalidHandle);
    }
    let hooks = unsafe { *hooks };
    with(|g| g.embed.attach(hooks));
    0
}

#[no_mangle]
pub extern "C" fn gpi_embed_event(kind: c_int, message: *const c_char) {
    let kind = match EventKind::try_from(kind) {
        Ok(k) => k,
        Err(_) => {
            record_error(Error::Internal(format!("unknown event kind {}", kind)));
            return;
        }
    };
    let message = unsafe { opt_str(message) }.unwrap_or("").to_string();
    emit_event(kind, &message);
}

#[no_mangle]
pub extern "C" fn gpi_sim_end() {
    let r = with(|g| g.end_sim());
    if let Err(e) = r {
        record_error(e);
    }
}

#[no_mangle]
pub extern "C" fn gpi_get_sim_time(high: *mut u32, low: *mut u32) {
    let t = with(|g| g.sim_time());
    match t {
        Ok((hi, lo)) => unsafe {
            if !high.is_null() {
                *high = hi;
            }
            if !low.is_null() {
                *low = lo;
            }
        },
        Err(e) => record_error(e),
    }
}

#[no_mangle]
pub extern "C" fn gpi_get_sim_precision(precision: *mut c_int) {
    match with(|g| g.sim_precision()) {
        Ok(p) => unsafe {
            if !precision.is_null() {
                *precision = p;
            }
        },
        Err(e) => record_error(e),
    }
}

#[no_mangle]
pub extern "C" fn gpi_get_root_handle(name: *const c_char) -> u64 {
    let name = unsafe { opt_str(name) };
    sentinel(with(|g| g.root_handle(name)).map(|id| id.raw()), 0)
}

#[no_mangle]
pub extern "C" fn gpi_get_handle_by_name(parent: u64, name: *const c_char) -> u64 {
    let name = match unsafe { opt_str(name) } {
        Some(n) => n.to_string(),
        None => {
            record_error(Error::NotFound("null name".to_string()));
            return 0;
        }
    };
    sentinel(
        with(|g| {
            let parent = object_id(parent)?;
            g.child_by_name(parent, &name)
        })
        .map(|id| id.raw()),
        0,
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_handle_by_index(parent: u64, index: i64) -> u64 {
    sentinel(
        with(|g| {
            let parent = object_id(parent)?;
            g.child_by_index(parent, index)
        })
        .map(|id| id.raw()),
        0,
    )
}

#[no_mangle]
pub extern "C" fn gpi_iterate(parent: u64, selector: c_int) -> u64 {
    sentinel(
        with(|g| {
            let parent = object_id(parent)?;
            let selector = Selector::try_from(selector)
                .map_err(|_| Error::Internal(format!("unknown selector {}", selector)))?;
            g.iterate(parent, selector)
        })
        .map(|id| id.raw()),
        0,
    )
}

// Returns 0 at end of sequence with the last error cleared; a caller
// distinguishing END from failure checks gpi_last_error.
#[no_mangle]
pub extern "C" fn gpi_next(iterator: u64) -> u64 {
    sentinel(
        with(|g| {
            let it = Id::decode(iterator, IdClass::Iterator)?;
            g.iter_next(it)
        })
        .map(|next| next.map(|id| id.raw()).unwrap_or(0)),
        0,
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_name(handle: u64) -> *const c_char {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            g.object(id).map(|o| o.name_ptr())
        }),
        std::ptr::null(),
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_fullname(handle: u64) -> *const c_char {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            g.object(id).map(|o| o.fullname_ptr())
        }),
        std::ptr::null(),
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_type_str(handle: u64) -> *const c_char {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            g.object(id).map(|o| o.type_ptr())
        }),
        std::ptr::null(),
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_type(handle: u64) -> c_int {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            g.object(id).map(|o| i32::from(o.meta.kind))
        }),
        -1,
    )
}

#[no_mangle]
pub extern "C" fn gpi_is_constant(handle: u64) -> c_int {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            g.object(id).map(|o| o.meta.is_const as c_int)
        }),
        -1,
    )
}

#[no_mangle]
pub extern "C" fn gpi_is_indexable(handle: u64) -> c_int {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            g.object(id).map(|o| o.meta.kind.is_indexable() as c_int)
        }),
        -1,
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_length(handle: u64) -> i64 {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            let obj = g.object(id)?;
            obj.require_indexable("length")?;
            Ok(obj.meta.length.unwrap_or(0) as i64)
        }),
        -1,
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_range_left(handle: u64) -> i64 {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            let obj = g.object(id)?;
            obj.require_indexable("range")?;
            obj.meta
                .range
                .map(|(l, _)| l)
                .ok_or(Error::WrongKind { op: "range", kind: "unranged object" })
        }),
        0,
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_range_right(handle: u64) -> i64 {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            let obj = g.object(id)?;
            obj.require_indexable("range")?;
            obj.meta
                .range
                .map(|(_, r)| r)
                .ok_or(Error::WrongKind { op: "range", kind: "unranged object" })
        }),
        0,
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_value_binstr(handle: u64) -> *const c_char {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            let s = g.get_binstr(id)?;
            g.object_mut(id).map(|o| o.stash_value(&s))
        }),
        std::ptr::null(),
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_value_str(handle: u64) -> *const c_char {
    sentinel(
        with(|g| {
            let id = object_id(handle)?;
            let s = g.get_str(id)?;
            g.object_mut(id).map(|o| o.stash_value(&s))
        }),
        std::ptr::null(),
    )
}

#[no_mangle]
pub extern "C" fn gpi_get_value_long(handle: u64, out: *mut i64) -> c_int {
    status(with(|g| {
        let id = object_id(handle)?;
        let v = g.get_long(id)?;
        if !out.is_null() {
            unsafe { *out = v };
        }
        Ok(())
    }))
}

#[no_mangle]
pub extern "C" fn gpi_get_value_real(handle: u64, out: *mut f64) -> c_int {
    status(with(|g| {
        let id = object_id(handle)?;
        let v = g.get_real(id)?;
        if !out.is_null() {
            unsafe { *out = v };
        }
        Ok(())
    }))
}

fn action_from(code: c_int) -> Result<SetAction> {
    match code {
        0 => Ok(SetAction::DepositInertial),
        1 => Ok(SetAction::DepositNoDelay),
        2 => Ok(SetAction::Force),
        3 => Ok(SetAction::Release),
        _ => Err(Error::Internal(format!("unknown set action {}", code))),
    }
}

#[no_mangle]
pub extern "C" fn gpi_set_value_binstr(
    handle: u64,
    binstr: *const c_char,
    action: c_int,
) -> c_int {
    status(with(|g| {
        let id = object_id(handle)?;
        let action = action_from(action)?;
        let s = unsafe { opt_str(binstr) }
            .ok_or(Error::WrongKind { op: "set_value", kind: "null bit-string" })?;
        g.set_value(id, Value::BinStr(s.to_string()), action)
    }))
}

#[no_mangle]
pub extern "C" fn gpi_set_value_long(handle: u64, value: i64, action: c_int) -> c_int {
    status(with(|g| {
        let id = object_id(handle)?;
        let action = action_from(action)?;
        g.set_value(id, Value::Integer(value), action)
    }))
}

#[no_mangle]
pub extern "C" fn gpi_set_value_real(handle: u64, value: f64, action: c_int) -> c_int {
    status(with(|g| {
        let id = object_id(handle)?;
        let action = action_from(action)?;
        g.set_value(id, Value::Real(value), action)
    }))
}

#[no_mangle]
pub extern "C" fn gpi_set_value_str(
    handle: u64,
    text: *const c_char,
    action: c_int,
) -> c_int {
    status(with(|g| {
        let id = object_id(handle)?;
        let action = action_from(action)?;
        let s = unsafe { opt_str(text) }
            .ok_or(Error::WrongKind { op: "set_value", kind: "null string" })?;
        g.set_value(id, Value::Str(s.to_string()), action)
    }))
}

// Identity comparison; a handle is never path-equal, only
// object-equal.
#[no_mangle]
pub extern "C" fn gpi_same_object(a: u64, b: u64) -> c_int {
    sentinel(
        with(|g| {
            let a = object_id(a)?;
            let b = object_id(b)?;
            g.same_object(a, b).map(|same| same as c_int)
        }),
        -1,
    )
}

#[no_mangle]
pub extern "C" fn gpi_release_handle(handle: u64) -> c_int {
    status(with(|g| g.release(handle)))
}

#[no_mangle]
pub extern "C" fn gpi_register_timed_callback(steps: u64) -> u64 {
    sentinel(with(|g| g.register_timed(steps)).map(|id| id.raw()), 0)
}

#[no_mangle]
pub extern "C" fn gpi_register_next_time_step_callback() -> u64 {
    sentinel(with(|g| g.register_next_step()).map(|id| id.raw()), 0)
}

#[no_mangle]
pub extern "C" fn gpi_register_readonly_callback() -> u64 {
    sentinel(with(|g| g.register_read_only()).map(|id| id.raw()), 0)
}

#[no_mangle]
pub extern "C" fn gpi_register_readwrite_callback() -> u64 {
    sentinel(with(|g| g.register_read_write()).map(|id| id.raw()), 0)
}

#[no_mangle]
pub extern "C" fn gpi_register_value_change_callback(signal: u64, edges: c_int) -> u64 {
    sentinel(
        with(|g| {
            let signal = object_id(signal)?;
            let mut set = EdgeSet::empty();
            if edges & 1 != 0 {
                set = set | Edge::Rising;
            }
            if edges & 2 != 0 {
                set = set | Edge::Falling;
            }
            if set.is_empty() {
                set = EdgeSet::all();
            }
            g.register_value_change(signal, set)
        })
        .map(|id| id.raw()),
        0,
    )
}

#[no_mangle]
pub extern "C" fn gpi_set_callback(
    callback: u64,
    func: Option<CbFunc>,
    data: *mut c_void,
) -> c_int {
    status(with(|g| {
        let id = callback_id(callback)?;
        let func = func.ok_or(Error::Internal("null user function".to_string()))?;
        g.set_user(id, func, data)
    }))
}

#[no_mangle]
pub extern "C" fn gpi_deregister(callback: u64) -> c_int {
    status(with(|g| {
        let id = callback_id(callback)?;
        g.deregister(id)
    }))
}

#[no_mangle]
pub extern "C" fn gpi_last_error() -> c_int {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|e| i32::from(e.code()))
            .unwrap_or(0)
    })
}

#[no_mangle]
pub extern "C" fn gpi_last_error_message() -> *const c_char {
    LAST_ERROR.with(|slot| {
        let text = slot
            .borrow()
            .as_ref()
            .map(|e| format!("{}", e))
            .unwrap_or_default();
        let text = CString::new(text).unwrap_or_default();
        LAST_ERROR_TEXT.with(|t| {
            let mut t = t.borrow_mut();
            *t = Some(text);
            t.as_ref().unwrap().as_ptr()
        })
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    // Facade-level failure paths that need no backend at all. The
    // full simulation scenarios live with the mock kernel.

    #[test]
    fn everything_is_not_ready_before_start() {
        let mut g = Gpi::new();
        assert_eq!(
            g.root_handle(None),
            Err(Error::NotReady("get_root_handle"))
        );
        assert_eq!(g.register_timed(1), Err(Error::NotReady("register_timed")));
        assert_eq!(g.end_sim(), Err(Error::NotReady("sim_end")));
    }

    #[test]
    fn stale_ids_fail_fast() {
        let g = Gpi::new();
        let bogus = Id::decode(
            // Class nibble says Object, but nothing lives there.
            (1u64) << 60 | 42,
            IdClass::Object,
        )
        .unwrap();
        assert_eq!(
            g.object(bogus).err(),
            Some(Error::InvalidHandle(bogus.raw()))
        );
    }

    #[test]
    fn release_of_nonsense_is_invalid_handle() {
        let mut g = Gpi::new();
        assert_eq!(g.release(0), Err(Error::InvalidHandle(0)));
        assert_eq!(g.release(0xdead), Err(Error::InvalidHandle(0xdead)));
    }

    #[test]
    fn deregister_of_unknown_callback_fails() {
        let mut g = Gpi::new();
        let bogus = Id::decode((2u64) << 60 | 7, IdClass::Callback).unwrap();
        assert!(g.deregister(bogus).is_err());
    }

    #[test]
    fn action_codes() {
        assert_eq!(action_from(0).unwrap(), SetAction::DepositInertial);
        assert_eq!(action_from(1).unwrap(), SetAction::DepositNoDelay);
        assert_eq!(action_from(2).unwrap(), SetAction::Force);
        assert_eq!(action_from(3).unwrap(), SetAction::Release);
        assert!(action_from(4).is_err());
    }
}
