// (C) 2020 Brandon Lewis
//
// The callback handle model.
//
// A registered callback is a little state machine:
//
//   FREE --arm--> PRIMED --fires--> CALL --exit--> REPRIME or DELETE
//
// One-shot kinds (timed, next-time-step, read-only, read-write) always
// go CALL -> DELETE. Value-change callbacks re-arm, CALL -> REPRIME ->
// PRIMED, unless deregistered during their own dispatch, in which case
// the delete is deferred to just after the user function returns.
//
// Transitions happen at exactly four points: arm, fire-entry,
// fire-exit, and deregister. Anything a reentrant user function asks
// for becomes a flag checked at fire-exit.

use std::ffi::c_void;
use std::os::raw::c_int;

use enumflags2::BitFlags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::arena::Id;
use crate::error::{Error, Result};
use crate::object::SimPtr;
use crate::value::Bit;


// Stable integers across the ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum CbKind {
    // Fires in the values-changed sub-phase when the bound signal
    // matches the edge predicate. Recurring.
    ValueChange = 1,
    // Fires once, at the beginning of the time step exactly N steps
    // ahead.
    Timed = 2,
    // Fires once at the next beginning-of-time-step, whatever causes
    // it.
    NextStep = 3,
    // Fires once at the end of the current time step; values stable,
    // writes forbidden.
    ReadOnly = 4,
    // Fires once at the end of the current evaluation cycle; values
    // stable, writes allowed.
    ReadWrite = 5,
}

impl CbKind {
    pub fn recurring(&self) -> bool {
        matches!(self, CbKind::ValueChange)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CbKind::ValueChange => "value-change",
            CbKind::Timed => "timed",
            CbKind::NextStep => "next-time-step",
            CbKind::ReadOnly => "read-only",
            CbKind::ReadWrite => "read-write",
        }
    }
}


#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum Edge {
    Rising = 0b01,
    Falling = 0b10,
}

pub type EdgeSet = BitFlags<Edge>;

// Classify a transition between two observed scalar values. A rising
// edge is specifically 0-to-1 at the bit level; everything else that
// changes counts only for "any".
pub fn classify_edge(prev: Option<Bit>, now: Bit) -> Option<Edge> {
    let prev = prev?;
    match (prev.level(), now.level()) {
        (Some(false), Some(true)) => Some(Edge::Rising),
        (Some(true), Some(false)) => Some(Edge::Falling),
        _ => None,
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CbState {
    Free,
    Primed,
    Call,
    Reprime,
    Delete,
}


// What the backend needs to know to arm a callback natively.
#[derive(Clone, Debug)]
pub struct CbSpec {
    pub kind: CbKind,
    // Step count ahead, for Timed.
    pub steps: u64,
    // Raw pointer of the bound signal, for ValueChange.
    pub signal: Option<SimPtr>,
}


// What fire-exit decided should happen to the native registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FireExit {
    // Recurring callback stays armed.
    Rearm,
    // Remove the native registration and destroy the handle.
    Remove,
}


// The user function: opaque data in, status out. A nonzero status is a
// test error escaping the callback; the dispatch boundary reports it
// and force-deletes the callback.
pub type CbFunc = extern "C" fn(*mut c_void) -> c_int;


pub struct Callback {
    pub kind: CbKind,
    pub state: CbState,
    pub backend: usize,
    pub spec: CbSpec,
    pub func: Option<CbFunc>,
    pub data: *mut c_void,
    // The simulator's registration cookie, while PRIMED.
    pub cookie: SimPtr,
    // Bound signal handle, for value-change; lets release() find us.
    pub bound: Option<Id>,
    pub edges: EdgeSet,
    // Last observed scalar level, for edge classification.
    pub prev: Option<Bit>,
    // Set when deregister() arrives during our own dispatch.
    deferred_delete: bool,
}

impl Callback {
    pub fn new(kind: CbKind, backend: usize, spec: CbSpec) -> Callback {
        Callback {
            kind,
            state: CbState::Free,
            backend,
            spec,
            func: None,
            data: std::ptr::null_mut(),
            cookie: SimPtr::null(),
            bound: None,
            edges: BitFlags::all(),
            prev: None,
            deferred_delete: false,
        }
    }

    fn bad_transition(&self, wanted: &str) -> Error {
        Error::Internal(format!(
            "{} callback: illegal transition {:?} -> {}",
            self.kind.label(),
            self.state,
            wanted
        ))
    }

    // The user function is set exactly once, between creation and
    // arming.
    pub fn set_user(&mut self, func: CbFunc, data: *mut c_void) -> Result<()> {
        if self.state != CbState::Free || self.func.is_some() {
            return Err(self.bad_transition("set-user"));
        }
        self.func = Some(func);
        self.data = data;
        Ok(())
    }

    pub fn arm(&mut self, cookie: SimPtr) -> Result<()> {
        if self.state != CbState::Free {
            return Err(self.bad_transition("PRIMED"));
        }
        if self.func.is_none() {
            return Err(Error::Internal(format!(
                "{} callback armed with no user function",
                self.kind.label()
            )));
        }
        self.cookie = cookie;
        self.state = CbState::Primed;
        Ok(())
    }

    pub fn fire_entry(&mut self) -> Result<(CbFunc, *mut c_void)> {
        if self.state != CbState::Primed {
            return Err(self.bad_transition("CALL"));
        }
        self.state = CbState::Call;
        // Armed with a function, so this cannot be None.
        Ok((self.func.unwrap(), self.data))
    }

    // A wakeup that failed the edge predicate: back to PRIMED as if
    // nothing happened. The native registration persists.
    pub fn swallow(&mut self) -> Result<()> {
        if self.state != CbState::Call {
            return Err(self.bad_transition("PRIMED"));
        }
        self.state = CbState::Primed;
        Ok(())
    }

    // Deregister. Returns true when the delete had to be deferred
    // because we are inside this callback's own dispatch.
    pub fn deregister(&mut self) -> bool {
        if self.state == CbState::Call {
            self.deferred_delete = true;
            true
        } else {
            self.state = CbState::Delete;
            false
        }
    }

    pub fn force_delete(&mut self) {
        self.state = CbState::Delete;
    }

    pub fn fire_exit(&mut self) -> Result<FireExit> {
        if self.state != CbState::Call {
            return Err(self.bad_transition("REPRIME or DELETE"));
        }
        if self.deferred_delete || !self.kind.recurring() {
            self.state = CbState::Delete;
            Ok(FireExit::Remove)
        } else {
            // The REPRIME hop exists so the wants-to-re-arm decision is
            // an observable state, not an implicit fallthrough.
            self.state = CbState::Reprime;
            self.state = CbState::Primed;
            Ok(FireExit::Rearm)
        }
    }
}
