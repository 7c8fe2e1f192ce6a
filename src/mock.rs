// An in-memory simulator kernel for the test suite.
//
// The real backends can only be exercised inside a simulator process,
// so the integration tests run against this one instead: a little
// design tree of nine-state signals plus an event wheel that walks the
// phases of a time step in order (beginning-of-step, then evaluation
// cycles of values-settle and values-change, then read-write, then
// read-only). It implements the same Backend seam the real interfaces
// do, which is exactly what makes the facade, arena, and callback
// machinery testable end to end.

use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;

use crate::backend::{Backend, CursorState, Selector, SimulatorInfo, ValueStates};
use crate::callback::{CbKind, CbSpec};
use crate::error::{Error, Result};
use crate::naming::Convention;
use crate::object::{Object, ObjectKind, ObjectMeta, ObjectSeed, SimPtr};
use crate::value::{self, Bit, SetAction, Value};


struct Node {
    name: String,
    fullname: String,
    kind: ObjectKind,
    parent: Option<usize>,
    children: Vec<usize>,
    // Visible value, MSB first for vectors.
    value: Vec<Bit>,
    // What the design's own drivers are producing; visible unless
    // forced.
    driver: Vec<Bit>,
    forced: Option<Vec<Bit>>,
    real: f64,
    text: String,
    range: Option<(i64, i64)>,
    is_const: bool,
    // Bit select into a parent vector: (storage node, position).
    select: Option<(usize, u32)>,
}

impl Node {
    fn blank(name: String, fullname: String, kind: ObjectKind) -> Node {
        Node {
            name,
            fullname,
            kind,
            parent: None,
            children: Vec::new(),
            value: Vec::new(),
            driver: Vec::new(),
            forced: None,
            real: 0.0,
            text: String::new(),
            range: None,
            is_const: false,
            select: None,
        }
    }
}


struct Armed {
    cookie: u64,
    kind: CbKind,
    due: u64,
    signal: Option<usize>,
}

pub struct Kernel {
    time: u64,
    nodes: Vec<Node>,
    armed: Vec<Armed>,
    next_token: usize,
    changed: Vec<usize>,
    pending: Vec<(usize, Vec<Bit>)>,
    stopped: bool,
}

impl Kernel {
    // Resolve a bit select down to its storage node.
    fn canon(&self, idx: usize) -> usize {
        self.nodes[idx].select.map(|(p, _)| p).unwrap_or(idx)
    }

    fn visible(&self, idx: usize) -> Vec<Bit> {
        match self.nodes[idx].select {
            Some((p, pos)) => vec![self.nodes[p].value[pos as usize]],
            None => self.nodes[idx].value.clone(),
        }
    }

    fn mark_changed(&mut self, idx: usize) {
        let canon = self.canon(idx);
        if !self.changed.contains(&canon) {
            self.changed.push(canon);
        }
    }

    // A driver update: lands in the driver copy, and shows through
    // unless the signal is forced.
    fn drive_bits(&mut self, idx: usize, bits: Vec<Bit>) {
        let (storage, pos) = match self.nodes[idx].select {
            Some((p, pos)) => (p, Some(pos)),
            None => (idx, None),
        };
        match pos {
            Some(pos) => {
                let pos = pos as usize;
                if let Some(b) = bits.first() {
                    self.nodes[storage].driver[pos] = *b;
                }
            }
            None => self.nodes[storage].driver = bits,
        }
        if self.nodes[storage].forced.is_none() {
            let next = self.nodes[storage].driver.clone();
            if self.nodes[storage].value != next {
                self.nodes[storage].value = next;
                self.mark_changed(storage);
            }
        }
    }

    fn force_bits(&mut self, idx: usize, bits: Vec<Bit>) {
        let storage = self.canon(idx);
        self.nodes[storage].forced = Some(bits.clone());
        if self.nodes[storage].value != bits {
            self.nodes[storage].value = bits;
            self.mark_changed(storage);
        }
    }

    fn release_bits(&mut self, idx: usize) {
        let storage = self.canon(idx);
        self.nodes[storage].forced = None;
        let next = self.nodes[storage].driver.clone();
        if self.nodes[storage].value != next {
            self.nodes[storage].value = next;
            self.mark_changed(storage);
        }
    }
}


// Assembles the design tree before the kernel starts.
pub struct DesignBuilder {
    nodes: Vec<Node>,
}

impl DesignBuilder {
    pub fn new(top: &str) -> DesignBuilder {
        DesignBuilder {
            nodes: vec![Node::blank(
                top.to_string(),
                top.to_string(),
                ObjectKind::Scope,
            )],
        }
    }

    pub fn top(&self) -> usize {
        0
    }

    fn attach(&mut self, parent: usize, mut node: Node) -> usize {
        node.parent = Some(parent);
        node.fullname =
            Convention::DotBracket.join(Some(&self.nodes[parent].fullname), &node.name);
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.nodes[parent].children.push(idx);
        idx
    }

    pub fn scope(&mut self, parent: usize, name: &str) -> usize {
        self.attach(
            parent,
            Node::blank(name.to_string(), String::new(), ObjectKind::Scope),
        )
    }

    pub fn vector(
        &mut self,
        parent: usize,
        name: &str,
        left: i64,
        right: i64,
        init: &str,
    ) -> usize {
        let mut node =
            Node::blank(name.to_string(), String::new(), ObjectKind::LogicVector);
        node.value = value::parse_binstr(init).unwrap();
        node.driver = node.value.clone();
        node.range = Some((left, right));
        self.attach(parent, node)
    }

    pub fn logic(&mut self, parent: usize, name: &str, init: char) -> usize {
        let mut node = Node::blank(name.to_string(), String::new(), ObjectKind::Logic);
        node.value = vec![Bit::from_char(init).unwrap()];
        node.driver = node.value.clone();
        self.attach(parent, node)
    }

    pub fn integer(&mut self, parent: usize, name: &str, init: i64) -> usize {
        let mut node = Node::blank(name.to_string(), String::new(), ObjectKind::Integer);
        node.value = value::parse_binstr(&value::long_to_binstr(init, 32)).unwrap();
        node.driver = node.value.clone();
        self.attach(parent, node)
    }

    pub fn real(&mut self, parent: usize, name: &str, init: f64) -> usize {
        let mut node = Node::blank(name.to_string(), String::new(), ObjectKind::Real);
        node.real = init;
        self.attach(parent, node)
    }

    pub fn param(&mut self, parent: usize, name: &str, init: &str) -> usize {
        let mut node =
            Node::blank(name.to_string(), String::new(), ObjectKind::Parameter);
        node.value = value::parse_binstr(init).unwrap();
        node.driver = node.value.clone();
        node.is_const = true;
        self.attach(parent, node)
    }
}


fn encode(idx: usize) -> SimPtr {
    // Avoid a null pointer for node zero.
    SimPtr((idx + 1) as *mut c_void)
}

fn decode(raw: SimPtr) -> usize {
    (raw.0 as usize) - 1
}


struct MockBackend {
    k: Rc<RefCell<Kernel>>,
}

impl MockBackend {
    fn seed(&self, idx: usize) -> ObjectSeed {
        let k = self.k.borrow();
        let n = &k.nodes[idx];
        let length = match n.kind {
            ObjectKind::LogicVector => Some(n.value.len() as u32),
            ObjectKind::Array | ObjectKind::GenScope => Some(n.children.len() as u32),
            _ => None,
        };
        ObjectSeed {
            raw: encode(idx),
            meta: ObjectMeta {
                kind: n.kind,
                name: n.name.clone(),
                fullname: n.fullname.clone(),
                length,
                range: n.range,
                is_const: n.is_const,
            },
        }
    }

    // Bit selects materialize on first lookup and persist, so repeated
    // lookups agree on identity.
    fn bit_select(&self, parent: usize, position: u32) -> usize {
        let existing = {
            let k = self.k.borrow();
            k.nodes[parent]
                .children
                .iter()
                .copied()
                .find(|c| k.nodes[*c].select == Some((parent, position)))
        };
        if let Some(idx) = existing {
            return idx;
        }
        let mut k = self.k.borrow_mut();
        let index = k.nodes[parent]
            .range
            .map(|(l, r)| {
                if l > r {
                    l - position as i64
                } else {
                    l + position as i64
                }
            })
            .unwrap_or(position as i64);
        let name = format!("{}[{}]", k.nodes[parent].name, index);
        let fullname = Convention::DotBracket.index(&k.nodes[parent].fullname, index);
        let mut node = Node::blank(name, fullname, ObjectKind::Logic);
        node.parent = Some(parent);
        node.select = Some((parent, position));
        let idx = k.nodes.len();
        k.nodes.push(node);
        k.nodes[parent].children.push(idx);
        idx
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn convention(&self) -> Convention {
        Convention::DotBracket
    }

    fn states(&self) -> ValueStates {
        ValueStates::Nine
    }

    fn sim_info(&self) -> Result<SimulatorInfo> {
        Ok(SimulatorInfo {
            product: "mocksim".to_string(),
            version: "0.1".to_string(),
            precision: -12,
        })
    }

    fn root(&self, name: Option<&str>) -> Result<Option<ObjectSeed>> {
        let matches = {
            let k = self.k.borrow();
            match name {
                None => true,
                Some(wanted) => k.nodes[0].name == wanted,
            }
        };
        Ok(if matches { Some(self.seed(0)) } else { None })
    }

    fn child_by_name(&self, parent: &Object, name: &str) -> Result<Option<ObjectSeed>> {
        let wanted = crate::naming::unescape(name);
        let found = {
            let k = self.k.borrow();
            let idx = decode(parent.raw);
            k.nodes[idx]
                .children
                .iter()
                .copied()
                .find(|c| k.nodes[*c].name == wanted.as_ref())
        };
        Ok(found.map(|idx| self.seed(idx)))
    }

    fn child_by_position(&self, parent: &Object, position: u32) -> Result<Option<ObjectSeed>> {
        let idx = decode(parent.raw);
        let kind = parent.meta.kind;
        match kind {
            ObjectKind::LogicVector => {
                if position as usize >= parent.meta.length.unwrap_or(0) as usize {
                    return Ok(None);
                }
                Ok(Some(self.seed(self.bit_select(idx, position))))
            }
            _ => {
                let found = {
                    let k = self.k.borrow();
                    k.nodes[idx].children.get(position as usize).copied()
                };
                Ok(found.map(|c| self.seed(c)))
            }
        }
    }

    fn iterate(&self, parent: &Object, selector: Selector) -> Result<CursorState> {
        let children = {
            let k = self.k.borrow();
            k.nodes[decode(parent.raw)].children.clone()
        };
        let mut items = Vec::new();
        for c in children {
            let keep = {
                let k = self.k.borrow();
                let kind = k.nodes[c].kind;
                let selected = k.nodes[c].select.is_some();
                match selector {
                    Selector::Children => !selected,
                    Selector::Instances => kind.is_scope(),
                    Selector::Signals => kind.is_signal() && kind != ObjectKind::Parameter && !selected,
                    Selector::Parameters => kind == ObjectKind::Parameter,
                    Selector::Packages => false,
                }
            };
            if keep {
                items.push(self.seed(c));
            }
        }
        Ok(CursorState::List { items, at: 0 })
    }

    fn cursor_next(&self, state: &mut CursorState) -> Result<Option<ObjectSeed>> {
        match state {
            CursorState::List { items, at } => {
                if *at < items.len() {
                    let seed = items[*at].clone();
                    *at += 1;
                    Ok(Some(seed))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    fn cursor_free(&self, state: &mut CursorState) {
        *state = CursorState::Done;
    }

    fn read_binstr(&self, obj: &Object) -> Result<String> {
        let k = self.k.borrow();
        Ok(value::render_binstr(&k.visible(decode(obj.raw))))
    }

    fn read_long(&self, obj: &Object) -> Result<i64> {
        value::binstr_to_long(&self.read_binstr(obj)?)
    }

    fn read_real(&self, obj: &Object) -> Result<f64> {
        let k = self.k.borrow();
        Ok(k.nodes[decode(obj.raw)].real)
    }

    fn read_str(&self, obj: &Object) -> Result<String> {
        let k = self.k.borrow();
        Ok(k.nodes[decode(obj.raw)].text.clone())
    }

    fn write(&self, obj: &Object, val: &Value, action: SetAction) -> Result<()> {
        let idx = decode(obj.raw);
        let width = obj.meta.length.unwrap_or(match obj.meta.kind {
            ObjectKind::Integer => 32,
            _ => 1,
        });
        let bits = match val {
            Value::BinStr(s) => value::parse_binstr(s)?,
            Value::Integer(i) => value::parse_binstr(&value::long_to_binstr(*i, width))?,
            Value::Real(r) => {
                let mut k = self.k.borrow_mut();
                k.nodes[idx].real = *r;
                k.mark_changed(idx);
                return Ok(());
            }
            Value::Str(s) => {
                let mut k = self.k.borrow_mut();
                k.nodes[idx].text = s.clone();
                k.mark_changed(idx);
                return Ok(());
            }
        };
        let mut k = self.k.borrow_mut();
        match action {
            SetAction::DepositNoDelay => k.drive_bits(idx, bits),
            SetAction::DepositInertial => k.pending.push((idx, bits)),
            SetAction::Force => k.force_bits(idx, bits),
            SetAction::Release => k.release_bits(idx),
        }
        Ok(())
    }

    fn cb_arm(&self, spec: &CbSpec, cookie: u64) -> Result<SimPtr> {
        let mut k = self.k.borrow_mut();
        let due = k.time + spec.steps;
        k.armed.push(Armed {
            cookie,
            kind: spec.kind,
            due,
            signal: spec.signal.map(decode),
        });
        k.next_token += 1;
        Ok(SimPtr(k.next_token as *mut c_void))
    }

    fn cb_disarm(&self, _spec: &CbSpec, _token: SimPtr, cookie: u64, _fired: bool) -> Result<()> {
        let mut k = self.k.borrow_mut();
        k.armed.retain(|a| a.cookie != cookie);
        Ok(())
    }

    fn time(&self) -> (u32, u32) {
        let k = self.k.borrow();
        ((k.time >> 32) as u32, k.time as u32)
    }

    fn precision(&self) -> i32 {
        -12
    }

    fn stop(&self) -> Result<()> {
        self.k.borrow_mut().stopped = true;
        Ok(())
    }
}


// The testbench's handle on the kernel: drives signals like the design
// would and cranks simulated time through the phase sequence.
pub struct MockSim {
    k: Rc<RefCell<Kernel>>,
}

pub fn install(builder: DesignBuilder) -> MockSim {
    let kernel = Rc::new(RefCell::new(Kernel {
        time: 0,
        nodes: builder.nodes,
        armed: Vec::new(),
        next_token: 0,
        changed: Vec::new(),
        pending: Vec::new(),
        stopped: false,
    }));
    let sim = MockSim { k: kernel.clone() };
    crate::facade::with(|g| {
        g.register_backend(Box::new(MockBackend { k: kernel }));
        g.capture_info().expect("mock info");
    });
    sim
}

impl MockSim {
    fn find(&self, path: &str) -> usize {
        let k = self.k.borrow();
        k.nodes
            .iter()
            .position(|n| n.fullname == path)
            .unwrap_or_else(|| panic!("no node {}", path))
    }

    // Design-side driver activity, as opposed to a facade write.
    pub fn drive(&self, path: &str, binstr: &str) {
        let idx = self.find(path);
        let bits = value::parse_binstr(binstr).unwrap();
        self.k.borrow_mut().drive_bits(idx, bits);
    }

    pub fn time(&self) -> u64 {
        self.k.borrow().time
    }

    pub fn stopped(&self) -> bool {
        self.k.borrow().stopped
    }

    pub fn armed_count(&self) -> usize {
        self.k.borrow().armed.len()
    }

    fn collect<F>(&self, f: F) -> Vec<u64>
    where
        F: Fn(&Armed, u64) -> bool,
    {
        let k = self.k.borrow();
        let t = k.time;
        k.armed
            .iter()
            .filter(|a| f(a, t))
            .map(|a| a.cookie)
            .collect()
    }

    fn settle(&self) {
        let pending = {
            let mut k = self.k.borrow_mut();
            std::mem::take(&mut k.pending)
        };
        for (idx, bits) in pending {
            self.k.borrow_mut().drive_bits(idx, bits);
        }
    }

    // One full time step, phases in order. Dispatch happens with no
    // kernel borrow held, because callbacks re-enter the backend.
    pub fn step(&self) {
        if self.k.borrow().stopped {
            return;
        }
        self.k.borrow_mut().time += 1;

        // Beginning of time step: timed wakeups that came due, plus
        // every next-step subscription, in registration order.
        for cookie in self.collect(|a, t| match a.kind {
            CbKind::Timed => a.due <= t,
            CbKind::NextStep => true,
            _ => false,
        }) {
            crate::facade::dispatch(cookie);
        }

        // Evaluation cycles: settle pending deposits, publish value
        // changes, then the read-write phase. Writes from read-write
        // callbacks start another cycle.
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > 100 {
                panic!("evaluation did not converge");
            }
            self.settle();
            let changed = {
                let mut k = self.k.borrow_mut();
                std::mem::take(&mut k.changed)
            };
            if !changed.is_empty() {
                for cookie in self.collect(|a, _| {
                    a.kind == CbKind::ValueChange
                        && a.signal
                            .map(|s| {
                                let k = self.k.borrow();
                                changed.contains(&k.canon(s))
                            })
                            .unwrap_or(false)
                }) {
                    crate::facade::dispatch(cookie);
                }
            }
            let rw = self.collect(|a, _| a.kind == CbKind::ReadWrite);
            for cookie in rw.iter() {
                crate::facade::dispatch(*cookie);
            }
            let quiet = {
                let k = self.k.borrow();
                k.changed.is_empty() && k.pending.is_empty()
            };
            if quiet && rw.is_empty() {
                break;
            }
        }

        // End of time step: values stable, writes forbidden.
        for cookie in self.collect(|a, _| a.kind == CbKind::ReadOnly) {
            crate::facade::dispatch(cookie);
        }
    }

    pub fn run(&self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{Id, IdClass};
    use crate::backend::Selector;
    use crate::callback::Edge;
    use crate::facade::with;
    use enumflags2::BitFlags;
    use std::os::raw::c_int;

    // A design most tests share: top with an 8-bit bus holding 0xA5, a
    // clock, and a couple of extras.
    fn testbench() -> MockSim {
        let mut d = DesignBuilder::new("top");
        let top = d.top();
        d.vector(top, "bus", 7, 0, "10100101");
        d.logic(top, "clk", '0');
        d.param(top, "WIDTH", "00000000000000000000000000001000");
        d.integer(top, "count", 42);
        d.real(top, "ratio", 0.5);
        let core = d.scope(top, "core");
        d.vector(core, "state", 3, 0, "0000");
        install(d)
    }

    fn root() -> Id {
        with(|g| g.root_handle(Some("top"))).unwrap()
    }

    fn child(parent: Id, name: &str) -> Id {
        with(|g| g.child_by_name(parent, name)).unwrap()
    }

    extern "C" fn count_up(data: *mut c_void) -> c_int {
        let count = unsafe { &mut *(data as *mut u32) };
        *count += 1;
        0
    }

    fn arm_value_change(signal: Id, edges: BitFlags<Edge>, data: *mut c_void) -> Id {
        with(|g| {
            let cb = g.register_value_change(signal, edges)?;
            g.set_user(cb, count_up, data)?;
            Ok::<Id, Error>(cb)
        })
        .unwrap()
    }

    /*
     * Discovery and values
     */

    #[test]
    fn top_discovery_and_bit_read() {
        let _sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "10100101");
        let meta = with(|g| g.object(bus).map(|o| o.meta.clone())).unwrap();
        assert_eq!(meta.length, Some(8));
        assert_eq!(meta.kind, ObjectKind::LogicVector);
        assert_eq!(meta.fullname, "top.bus");
        assert_eq!(with(|g| g.get_long(bus)).unwrap(), 0xA5);
    }

    #[test]
    fn dotted_path_lookup_walks_the_hierarchy() {
        let _sim = testbench();
        let top = root();
        let state = child(top, "core.state");
        let meta = with(|g| g.object(state).map(|o| o.meta.clone())).unwrap();
        assert_eq!(meta.fullname, "top.core.state");
        assert_eq!(meta.length, Some(4));
        // Indexed components resolve too.
        let bit = child(top, "bus[7]");
        assert_eq!(with(|g| g.get_binstr(bit)).unwrap(), "1");
    }

    #[test]
    fn wrong_root_name_is_not_found() {
        let _sim = testbench();
        match with(|g| g.root_handle(Some("nonesuch"))) {
            Err(Error::NotFound(_)) => (),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn name_lookup_identity() {
        let _sim = testbench();
        let top = root();
        let a = child(top, "bus");
        let name = with(|g| g.object(a).map(|o| o.meta.name.clone())).unwrap();
        let b = child(top, &name);
        // Distinct handles, same underlying object.
        assert_ne!(a, b);
        assert!(with(|g| g.same_object(a, b)).unwrap());
    }

    #[test]
    fn value_kind_gates() {
        let _sim = testbench();
        let top = root();
        let ratio = child(top, "ratio");
        let count = child(top, "count");
        assert_eq!(with(|g| g.get_real(ratio)).unwrap(), 0.5);
        assert_eq!(with(|g| g.get_long(count)).unwrap(), 42);
        // A scope has no value.
        match with(|g| g.get_binstr(top)) {
            Err(Error::WrongKind { .. }) => (),
            other => panic!("expected WrongKind, got {:?}", other),
        }
        // And a real has no bit-string.
        assert!(with(|g| g.get_long(ratio)).is_err());
    }

    #[test]
    fn const_parameter_rejects_writes() {
        let _sim = testbench();
        let top = root();
        let width = child(top, "WIDTH");
        assert_eq!(
            with(|g| g.get_long(width)).unwrap(),
            8
        );
        match with(|g| {
            g.set_value(
                width,
                Value::BinStr("00000000000000000000000000000001".into()),
                SetAction::DepositNoDelay,
            )
        }) {
            Err(Error::NotWritable(name)) => assert_eq!(name, "top.WIDTH"),
            other => panic!("expected NotWritable, got {:?}", other),
        }
    }

    #[test]
    fn mismatched_width_rejected() {
        let _sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        assert!(with(|g| {
            g.set_value(bus, Value::BinStr("1111".into()), SetAction::DepositNoDelay)
        })
        .is_err());
    }

    /*
     * Indexing
     */

    #[test]
    fn index_lookup_respects_declared_range() {
        let _sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        // bus is [7:0]; index 7 is the leftmost bit, currently 1.
        let left = with(|g| g.child_by_index(bus, 7)).unwrap();
        let right = with(|g| g.child_by_index(bus, 0)).unwrap();
        assert_eq!(with(|g| g.get_binstr(left)).unwrap(), "1");
        assert_eq!(with(|g| g.get_binstr(right)).unwrap(), "1");
        let name = with(|g| g.object(left).map(|o| o.meta.fullname.clone())).unwrap();
        assert_eq!(name, "top.bus[7]");
        match with(|g| g.child_by_index(bus, 8)) {
            Err(Error::InvalidIndex(8)) => (),
            other => panic!("expected InvalidIndex, got {:?}", other),
        }
    }

    #[test]
    fn repeated_index_lookup_is_same_object() {
        let _sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        let a = with(|g| g.child_by_index(bus, 3)).unwrap();
        let b = with(|g| g.child_by_index(bus, 3)).unwrap();
        assert!(with(|g| g.same_object(a, b)).unwrap());
    }

    /*
     * Iteration
     */

    fn names_of(parent: Id, selector: Selector) -> Vec<String> {
        with(|g| {
            let it = g.iterate(parent, selector)?;
            let mut out = Vec::new();
            while let Some(h) = g.iter_next(it)? {
                out.push(g.object(h)?.meta.name.clone());
            }
            // Exhausted iterators keep answering END.
            assert_eq!(g.iter_next(it)?, None);
            Ok::<Vec<String>, Error>(out)
        })
        .unwrap()
    }

    #[test]
    fn iteration_is_total_and_stable() {
        let _sim = testbench();
        let top = root();
        let first = names_of(top, Selector::Children);
        let second = names_of(top, Selector::Children);
        assert_eq!(first, second);
        assert!(first.contains(&"bus".to_string()));
        assert!(first.contains(&"core".to_string()));
        assert!(first.contains(&"WIDTH".to_string()));
    }

    #[test]
    fn selectors_filter() {
        let _sim = testbench();
        let top = root();
        let signals = names_of(top, Selector::Signals);
        assert!(signals.contains(&"bus".to_string()));
        assert!(!signals.contains(&"core".to_string()));
        assert!(!signals.contains(&"WIDTH".to_string()));
        assert_eq!(names_of(top, Selector::Parameters), vec!["WIDTH"]);
        assert_eq!(names_of(top, Selector::Instances), vec!["core"]);
    }

    #[test]
    fn empty_scope_iterates_to_end_immediately() {
        let _sim = testbench();
        let top = root();
        let core = child(top, "core");
        let state = child(core, "state");
        let _ = state;
        let inner = names_of(core, Selector::Instances);
        assert!(inner.is_empty());
    }

    /*
     * Handle lifetime
     */

    #[test]
    fn release_is_exactly_once() {
        let _sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        let raw = bus.raw();
        assert!(with(|g| g.release(raw)).is_ok());
        assert_eq!(with(|g| g.release(raw)), Err(Error::InvalidHandle(raw)));
        assert!(with(|g| g.get_binstr(bus)).is_err());
    }

    #[test]
    fn release_sweeps_bound_callbacks() {
        let sim = testbench();
        let top = root();
        let clk = child(top, "clk");
        let mut count: u32 = 0;
        let _cb = arm_value_change(
            clk,
            BitFlags::all(),
            &mut count as *mut u32 as *mut c_void,
        );
        assert_eq!(sim.armed_count(), 1);
        with(|g| g.release(clk.raw())).unwrap();
        assert_eq!(sim.armed_count(), 0);
        sim.drive("top.clk", "1");
        sim.step();
        assert_eq!(count, 0);
    }

    /*
     * Writes
     */

    #[test]
    fn deposit_no_delay_reads_back_immediately() {
        let _sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        with(|g| {
            g.set_value(bus, Value::BinStr("00001111".into()), SetAction::DepositNoDelay)
        })
        .unwrap();
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "00001111");
    }

    #[test]
    fn inertial_deposit_lands_at_settle() {
        let sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        with(|g| {
            g.set_value(bus, Value::BinStr("11110000".into()), SetAction::DepositInertial)
        })
        .unwrap();
        // Not visible yet.
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "10100101");
        // Make sure a read-write callback fires within the step.
        let mut count: u32 = 0;
        with(|g| {
            let cb = g.register_read_write()?;
            g.set_user(cb, count_up, &mut count as *mut u32 as *mut c_void)
        })
        .unwrap();
        sim.step();
        assert_eq!(count, 1);
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "11110000");
    }

    #[test]
    fn force_blocks_drivers_until_release() {
        let sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        with(|g| {
            g.set_value(bus, Value::BinStr("11111111".into()), SetAction::Force)
        })
        .unwrap();
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "11111111");
        // Driver activity is masked while forced.
        sim.drive("top.bus", "00000000");
        sim.step();
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "11111111");
        with(|g| {
            g.set_value(bus, Value::BinStr("11111111".into()), SetAction::Release)
        })
        .unwrap();
        // The driver shows through again.
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "00000000");
    }

    #[test]
    fn nine_state_round_trip_through_kernel() {
        let _sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        with(|g| {
            g.set_value(bus, Value::BinStr("01XZUWLH".into()), SetAction::DepositNoDelay)
        })
        .unwrap();
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "01XZUWLH");
    }

    /*
     * Callbacks
     */

    #[test]
    fn edge_wait_counts_exactly() {
        let sim = testbench();
        let top = root();
        let clk = child(top, "clk");
        let mut rising: u32 = 0;
        let mut any: u32 = 0;
        arm_value_change(
            clk,
            BitFlags::from_flag(Edge::Rising),
            &mut rising as *mut u32 as *mut c_void,
        );
        arm_value_change(clk, BitFlags::all(), &mut any as *mut u32 as *mut c_void);
        for _ in 0..10 {
            sim.drive("top.clk", "1");
            sim.step();
            sim.drive("top.clk", "0");
            sim.step();
        }
        assert_eq!(rising, 10);
        assert_eq!(any, 20);
    }

    #[test]
    fn rising_on_already_high_signal_waits_for_next_edge() {
        let sim = testbench();
        let top = root();
        let clk = child(top, "clk");
        sim.drive("top.clk", "1");
        sim.step();
        let mut count: u32 = 0;
        arm_value_change(
            clk,
            BitFlags::from_flag(Edge::Rising),
            &mut count as *mut u32 as *mut c_void,
        );
        // A glitchless high level produces nothing.
        sim.step();
        assert_eq!(count, 0);
        // 1 -> 0 is not rising either.
        sim.drive("top.clk", "0");
        sim.step();
        assert_eq!(count, 0);
        // The next 0 -> 1 is.
        sim.drive("top.clk", "1");
        sim.step();
        assert_eq!(count, 1);
    }

    #[test]
    fn timed_callback_fires_exactly_on_schedule() {
        struct Timing {
            fired: u32,
            at: u64,
        }
        extern "C" fn on_timed(data: *mut c_void) -> c_int {
            let t = unsafe { &mut *(data as *mut Timing) };
            t.fired += 1;
            t.at = with(|g| {
                let (hi, lo) = g.sim_time().unwrap();
                ((hi as u64) << 32) | lo as u64
            });
            0
        }
        let sim = testbench();
        let mut timing = Timing { fired: 0, at: 0 };
        with(|g| {
            let cb = g.register_timed(5)?;
            g.set_user(cb, on_timed, &mut timing as *mut Timing as *mut c_void)
        })
        .unwrap();
        sim.run(4);
        assert_eq!(timing.fired, 0);
        sim.step();
        assert_eq!(timing.fired, 1);
        assert_eq!(timing.at, 5);
        // One-shot: no refire.
        sim.run(3);
        assert_eq!(timing.fired, 1);
        assert_eq!(sim.armed_count(), 0);
    }

    #[test]
    fn next_time_step_fires_once() {
        let sim = testbench();
        let mut count: u32 = 0;
        with(|g| {
            let cb = g.register_next_step()?;
            g.set_user(cb, count_up, &mut count as *mut u32 as *mut c_void)
        })
        .unwrap();
        sim.run(3);
        assert_eq!(count, 1);
    }

    #[test]
    fn read_only_fires_after_read_write() {
        extern "C" fn log_rw(data: *mut c_void) -> c_int {
            unsafe { &mut *(data as *mut Vec<&'static str>) }.push("rw");
            0
        }
        extern "C" fn log_ro(data: *mut c_void) -> c_int {
            unsafe { &mut *(data as *mut Vec<&'static str>) }.push("ro");
            0
        }
        let sim = testbench();
        let mut order: Vec<&'static str> = Vec::new();
        let data = &mut order as *mut Vec<&'static str> as *mut c_void;
        // Registered read-only first to make the ordering guarantee do
        // the work, not registration order.
        with(|g| {
            let ro = g.register_read_only()?;
            g.set_user(ro, log_ro, data)?;
            let rw = g.register_read_write()?;
            g.set_user(rw, log_rw, data)
        })
        .unwrap();
        sim.step();
        assert_eq!(order, vec!["rw", "ro"]);
    }

    #[test]
    fn writes_from_read_write_start_new_evaluation_cycle() {
        struct RwCtx {
            bus: u64,
        }
        extern "C" fn write_from_rw(data: *mut c_void) -> c_int {
            let ctx = unsafe { &*(data as *mut RwCtx) };
            let bus = Id::decode(ctx.bus, IdClass::Object).unwrap();
            with(|g| {
                g.set_value(bus, Value::BinStr("00000001".into()), SetAction::DepositNoDelay)
            })
            .unwrap();
            0
        }
        let sim = testbench();
        let top = root();
        let bus = child(top, "bus");
        let mut vc: u32 = 0;
        arm_value_change(bus, BitFlags::all(), &mut vc as *mut u32 as *mut c_void);
        let mut ctx = RwCtx { bus: bus.raw() };
        with(|g| {
            let rw = g.register_read_write()?;
            g.set_user(rw, write_from_rw, &mut ctx as *mut RwCtx as *mut c_void)
        })
        .unwrap();
        sim.step();
        // The write took effect within the same time step and its
        // value-change fired before the step ended.
        assert_eq!(with(|g| g.get_binstr(bus)).unwrap(), "00000001");
        assert_eq!(vc, 1);
    }

    #[test]
    fn self_deregister_fires_exactly_once() {
        struct SelfCtx {
            count: u32,
            cb: u64,
        }
        extern "C" fn once_only(data: *mut c_void) -> c_int {
            let ctx = unsafe { &mut *(data as *mut SelfCtx) };
            ctx.count += 1;
            let id = Id::decode(ctx.cb, IdClass::Callback).unwrap();
            with(|g| g.deregister(id)).unwrap();
            0
        }
        let sim = testbench();
        let top = root();
        let clk = child(top, "clk");
        let mut ctx = SelfCtx { count: 0, cb: 0 };
        let cb = with(|g| {
            let cb = g.register_value_change(clk, BitFlags::all())?;
            ctx.cb = cb.raw();
            g.set_user(cb, once_only, &mut ctx as *mut SelfCtx as *mut c_void)?;
            Ok::<Id, Error>(cb)
        })
        .unwrap();
        for _ in 0..5 {
            sim.drive("top.clk", "1");
            sim.step();
            sim.drive("top.clk", "0");
            sim.step();
        }
        assert_eq!(ctx.count, 1);
        assert_eq!(sim.armed_count(), 0);
        // The handle is gone too.
        assert!(with(|g| g.deregister(cb)).is_err());
    }

    #[test]
    fn deregister_before_fire_prevents_dispatch() {
        let sim = testbench();
        let top = root();
        let clk = child(top, "clk");
        let mut count: u32 = 0;
        let cb = arm_value_change(
            clk,
            BitFlags::all(),
            &mut count as *mut u32 as *mut c_void,
        );
        with(|g| g.deregister(cb)).unwrap();
        sim.drive("top.clk", "1");
        sim.step();
        assert_eq!(count, 0);
        assert_eq!(sim.armed_count(), 0);
    }

    #[test]
    fn failing_callback_reports_test_error_and_dies() {
        extern "C" fn explode(_data: *mut c_void) -> c_int {
            1
        }
        let sim = testbench();
        let top = root();
        let clk = child(top, "clk");
        let cb = with(|g| {
            let cb = g.register_value_change(clk, BitFlags::all())?;
            g.set_user(cb, explode, std::ptr::null_mut())?;
            Ok::<Id, Error>(cb)
        })
        .unwrap();
        sim.drive("top.clk", "1");
        sim.step();
        // Deleted despite being a recurring kind.
        assert_eq!(sim.armed_count(), 0);
        assert!(with(|g| g.deregister(cb)).is_err());
    }

    /*
     * Time and shutdown
     */

    #[test]
    fn time_advances_monotonically() {
        let sim = testbench();
        let mut last = 0u64;
        for _ in 0..5 {
            sim.step();
            let t = with(|g| {
                let (hi, lo) = g.sim_time().unwrap();
                ((hi as u64) << 32) | lo as u64
            });
            assert!(t >= last);
            last = t;
        }
        assert_eq!(last, 5);
        assert_eq!(with(|g| g.sim_precision()).unwrap(), -12);
    }

    #[test]
    fn end_sim_reaches_the_kernel() {
        let sim = testbench();
        with(|g| g.end_sim()).unwrap();
        assert!(sim.stopped());
    }

    #[test]
    fn teardown_releases_everything() {
        let sim = testbench();
        let top = root();
        let clk = child(top, "clk");
        let mut count: u32 = 0;
        arm_value_change(clk, BitFlags::all(), &mut count as *mut u32 as *mut c_void);
        assert_eq!(sim.armed_count(), 1);
        crate::facade::simulation_ended();
        assert_eq!(sim.armed_count(), 0);
        // The bridge is down: nothing works until a new simulation.
        assert!(with(|g| g.get_binstr(clk)).is_err());
        assert!(with(|g| g.register_timed(1)).is_err());
    }
}
