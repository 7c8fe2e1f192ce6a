// The seam every procedural interface implements.
//
// A Backend is the function table behind the facade: root discovery,
// lookup, iteration, value I/O, callback arming, time. One instance
// exists per interface the simulator actually provides, registered in
// order at load time; registry order decides who answers root lookups
// and registry-wide queries first.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::callback::CbSpec;
use crate::error::Result;
use crate::naming::Convention;
use crate::object::{Object, ObjectSeed, SimPtr};
use crate::value::{SetAction, Value};


// Identity and resolution of the simulator kernel hosting us.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatorInfo {
    pub product: String,
    pub version: String,
    // One internal time step is 10^precision seconds.
    pub precision: i32,
}


// What to walk when iterating a parent's children.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum Selector {
    Children = 1,
    Instances = 2,
    Signals = 3,
    Parameters = 4,
    Packages = 5,
}


// How many logic states the backend's value system can express.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValueStates {
    Four,
    Nine,
}


// In-progress traversal state. Native interfaces hand us an iterator
// object we scan one element at a time; interfaces (or selectors)
// without a native filter pre-collect and replay a list. No two
// cursors ever share underlying state.
pub enum CursorState {
    Native(SimPtr),
    List { items: Vec<ObjectSeed>, at: usize },
    Done,
}

pub struct Cursor {
    pub backend: usize,
    pub selector: Selector,
    pub state: CursorState,
}


pub trait Backend {
    fn name(&self) -> &'static str;

    fn convention(&self) -> Convention;

    fn states(&self) -> ValueStates;

    // Identity of the hosting kernel; available from simulation start.
    fn sim_info(&self) -> Result<SimulatorInfo>;

    // The top of the design. With a name, return it only on a match
    // with this backend's notion of top; with None, return the first
    // top-level scope.
    fn root(&self, name: Option<&str>) -> Result<Option<ObjectSeed>>;

    fn child_by_name(&self, parent: &Object, name: &str) -> Result<Option<ObjectSeed>>;

    // Position is zero-based; the facade has already translated the
    // caller's declared-range index.
    fn child_by_position(&self, parent: &Object, position: u32) -> Result<Option<ObjectSeed>>;

    fn iterate(&self, parent: &Object, selector: Selector) -> Result<CursorState>;

    // Advance a cursor. None means end-of-sequence; the facade
    // guarantees it is terminal.
    fn cursor_next(&self, state: &mut CursorState) -> Result<Option<ObjectSeed>>;

    // Drop any native iterator state early.
    fn cursor_free(&self, state: &mut CursorState);

    fn read_binstr(&self, obj: &Object) -> Result<String>;
    fn read_long(&self, obj: &Object) -> Result<i64>;
    fn read_real(&self, obj: &Object) -> Result<f64>;
    fn read_str(&self, obj: &Object) -> Result<String>;

    fn write(&self, obj: &Object, value: &Value, action: SetAction) -> Result<()>;

    // Register the callback natively; the cookie is the trampoline's
    // way back to the owning handle. Returns the simulator's
    // registration token.
    fn cb_arm(&self, spec: &CbSpec, cookie: u64) -> Result<SimPtr>;

    // Remove a native registration and reclaim any per-registration
    // storage keyed by the cookie. `fired` distinguishes a token that
    // already went off (one-shot kinds invalidate theirs) from a live
    // one.
    fn cb_disarm(&self, spec: &CbSpec, token: SimPtr, cookie: u64, fired: bool) -> Result<()>;

    // Re-arm a recurring callback after dispatch. Interfaces whose
    // value-change registrations persist have nothing to do.
    fn cb_rearm(&self, spec: &CbSpec, token: SimPtr, cookie: u64) -> Result<SimPtr> {
        let _ = cookie;
        let _ = spec;
        Ok(token)
    }

    fn time(&self) -> (u32, u32);

    fn precision(&self) -> i32;

    // Ask the simulator to end the simulation.
    fn stop(&self) -> Result<()>;

    // Release a discovery handle the simulator gave us, if the
    // interface wants that.
    fn release_object(&self, _raw: SimPtr) {}
}


// The process-wide ordered list of live backends. Owned by the facade
// context; construction order is registration order and never changes
// afterwards.
pub struct Registry {
    backends: Vec<Box<dyn Backend>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry { backends: Vec::new() }
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) -> usize {
        let id = self.backends.len();
        log::info!("registered {} backend at priority {}", backend.name(), id);
        self.backends.push(backend);
        id
    }

    pub fn get(&self, id: usize) -> Result<&dyn Backend> {
        self.backends
            .get(id)
            .map(|b| b.as_ref())
            .ok_or_else(|| crate::error::Error::Internal(format!(
                "no backend with id {}",
                id
            )))
    }

    pub fn first(&self) -> Option<&dyn Backend> {
        self.backends.first().map(|b| b.as_ref())
    }

    pub fn ordered(&self) -> impl Iterator<Item = (usize, &dyn Backend)> {
        self.backends.iter().enumerate().map(|(i, b)| (i, b.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_codes() {
        use std::convert::TryFrom;
        assert_eq!(i32::from(Selector::Children), 1);
        assert_eq!(Selector::try_from(3).unwrap(), Selector::Signals);
        assert!(Selector::try_from(6).is_err());
    }
}
