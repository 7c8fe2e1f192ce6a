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

// The embedding surface: the handshake that brings the hosted runtime
// up and the doorway through which out-of-band events reach it.
//
// A backend's start-of-simulation callback drives the sequence: capture
// simulator identity, load the configured extra libraries, make sure a
// runtime is attached (bootstrapping one from SIMBRIDGE_RUNTIME_LIB if
// the simulator does not already host it), then hand the runtime the
// identity record. The runtime talks back through the hook table it
// attached. Everything here is data and pure helpers; the facade owns
// the orchestration so that no context borrow is ever held across a
// call into runtime code.

use std::ffi::CString;
use std::os::raw::{c_char, c_int};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::backend::SimulatorInfo;
use crate::error::{Error, Result};
use crate::loader::SharedLib;
use crate::logging;

pub const ENV_RUNTIME_LIB: &str = "SIMBRIDGE_RUNTIME_LIB";
pub const RUNTIME_ENTRY: &[u8] = b"simbridge_runtime_init\0";


// Out-of-band notifications to the runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum EventKind {
    // Normal end of simulation.
    Shutdown = 0,
    // Forced termination; the simulator is going away.
    Abort = 1,
    // A failure originating on the simulator side of a test.
    TestError = 2,
}


#[repr(C)]
pub struct CSimInfo {
    pub product: *const c_char,
    pub version: *const c_char,
    pub precision: c_int,
}

pub type InitFn = extern "C" fn(*const CSimInfo) -> c_int;
pub type EventFn = extern "C" fn(c_int, *const c_char);

// Attached once by the hosted runtime. The logging hooks ride along so
// a single attach call wires the whole seam.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RuntimeHooks {
    pub init: Option<InitFn>,
    pub event: Option<EventFn>,
    pub log_filter: Option<logging::FilterFn>,
    pub log_sink: Option<logging::SinkFn>,
}


// Embedding state carried by the facade context.
pub struct Embedding {
    pub hooks: Option<RuntimeHooks>,
    pub info: Option<SimulatorInfo>,
    // True once the runtime's init hook has been called.
    pub initialized: bool,
    // True after a shutdown or abort event; the bridge refuses new
    // work from then on.
    pub down: bool,
    // Libraries that must outlive elaboration: extras and the
    // bootstrapped runtime.
    held: Vec<SharedLib>,
}

impl Embedding {
    pub fn new() -> Embedding {
        Embedding {
            hooks: None,
            info: None,
            initialized: false,
            down: false,
            held: Vec::new(),
        }
    }

    pub fn attach(&mut self, hooks: RuntimeHooks) {
        logging::attach(logging::SinkHooks {
            filter: hooks.log_filter,
            sink: hooks.log_sink,
        });
        self.hooks = Some(hooks);
        log::info!("hosted runtime attached");
    }

    pub fn hold(&mut self, libs: Vec<SharedLib>) {
        self.held.extend(libs);
    }

    pub fn mark_down(&mut self) {
        self.down = true;
        self.initialized = false;
        logging::detach();
    }
}


// Load the hosted runtime from its configured path and run its entry
// function. The entry is expected to call gpi_attach_runtime before
// returning; the caller verifies that happened.
pub fn bootstrap() -> Result<Option<SharedLib>> {
    let path = match std::env::var(ENV_RUNTIME_LIB) {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };
    let lib = SharedLib::open(&path)?;
    let entry: extern "C" fn() -> c_int = unsafe { lib.resolve(RUNTIME_ENTRY)? };
    let status = entry();
    if status != 0 {
        return Err(Error::Load(format!(
            "{}: runtime entry returned {}",
            path, status
        )));
    }
    Ok(Some(lib))
}


fn c_text(s: &str) -> CString {
    CString::new(s).unwrap_or_else(|_| CString::new(s.replace('\0', "?")).unwrap())
}

// Hand the runtime the simulator's identity. Called exactly once per
// process, with no context borrow held.
pub fn call_init(hooks: &RuntimeHooks, info: &SimulatorInfo) -> Result<()> {
    let init = hooks.init.ok_or_else(|| {
        Error::Internal("runtime attached without an init hook".to_string())
    })?;
    let product = c_text(&info.product);
    let version = c_text(&info.version);
    let c_info = CSimInfo {
        product: product.as_ptr(),
        version: version.as_ptr(),
        precision: info.precision,
    };
    let status = init(&c_info);
    if status != 0 {
        return Err(Error::Refused {
            code: status as i64,
            message: "runtime init hook failed".to_string(),
        });
    }
    Ok(())
}

// Deliver an out-of-band event. Absence of a runtime is not an error;
// the event still gets its log line.
pub fn call_event(hooks: Option<&RuntimeHooks>, kind: EventKind, message: &str) {
    log::info!("event {:?}: {}", kind, message);
    if let Some(event) = hooks.and_then(|h| h.event) {
        let text = c_text(message);
        event(i32::from(kind), text.as_ptr());
    }
}
