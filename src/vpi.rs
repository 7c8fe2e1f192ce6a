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

// The Verilog VPI backend.
//
// The simulator loads us as a VPI application and walks
// vlog_startup_routines; our entry probes the process image for the
// vpi_* symbols and, when they resolve, registers this backend plus the
// start/end-of-simulation callbacks. Everything after that is the
// Backend trait: lookups through vpi_handle_by_name/_by_index,
// iteration through vpi_iterate/vpi_scan, values through
// vpi_get_value/vpi_put_value, callbacks through vpi_register_cb with
// the cookie riding in user_data.
//
// VPI is four-state: weak and uninitialized characters fold on write
// and never appear on read.

// The PLI type names below match the interface header they mirror.
#![allow(non_camel_case_types)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

use crate::backend::{Backend, CursorState, Selector, SimulatorInfo, ValueStates};
use crate::callback::{CbKind, CbSpec};
use crate::error::{Error, Result};
use crate::loader::SharedLib;
use crate::naming::Convention;
use crate::object::{Object, ObjectKind, ObjectMeta, ObjectSeed, SimPtr};
use crate::value::{self, SetAction, Value};

pub type PLI_INT32 = i32;
pub type PLI_UINT32 = u32;
pub type PLI_BYTE8 = c_char;
pub type VpiHandle = *mut c_void;

// The slice of vpi_user.h this backend speaks.
#[allow(dead_code)]
pub mod consts {
    use super::PLI_INT32;

    // Object type codes.
    pub const VPI_INTEGER_VAR: PLI_INT32 = 25;
    pub const VPI_MEMORY: PLI_INT32 = 29;
    pub const VPI_MEMORY_WORD: PLI_INT32 = 30;
    pub const VPI_MODULE: PLI_INT32 = 32;
    pub const VPI_NAMED_BEGIN: PLI_INT32 = 33;
    pub const VPI_NAMED_EVENT: PLI_INT32 = 34;
    pub const VPI_NAMED_FORK: PLI_INT32 = 35;
    pub const VPI_NET: PLI_INT32 = 36;
    pub const VPI_NET_BIT: PLI_INT32 = 37;
    pub const VPI_PARAMETER: PLI_INT32 = 41;
    pub const VPI_PORT: PLI_INT32 = 44;
    pub const VPI_REAL_VAR: PLI_INT32 = 47;
    pub const VPI_REG: PLI_INT32 = 48;
    pub const VPI_REG_BIT: PLI_INT32 = 49;
    pub const VPI_GEN_SCOPE_ARRAY: PLI_INT32 = 133;
    pub const VPI_GEN_SCOPE: PLI_INT32 = 134;
    // SystemVerilog extensions.
    pub const VPI_PACKAGE: PLI_INT32 = 600;
    pub const VPI_INTERFACE: PLI_INT32 = 601;
    pub const VPI_LONG_INT_VAR: PLI_INT32 = 610;
    pub const VPI_SHORT_INT_VAR: PLI_INT32 = 611;
    pub const VPI_INT_VAR: PLI_INT32 = 612;
    pub const VPI_BYTE_VAR: PLI_INT32 = 614;
    pub const VPI_STRING_VAR: PLI_INT32 = 616;
    pub const VPI_ENUM_VAR: PLI_INT32 = 617;
    pub const VPI_STRUCT_VAR: PLI_INT32 = 618;
    pub const VPI_BIT_VAR: PLI_INT32 = 620;

    // Method (one-to-many / one-to-one) codes.
    pub const VPI_INTERNAL_SCOPE: PLI_INT32 = 92;
    pub const VPI_LEFT_RANGE: PLI_INT32 = 79;
    pub const VPI_RIGHT_RANGE: PLI_INT32 = 83;

    // Property codes.
    pub const VPI_TYPE: PLI_INT32 = 1;
    pub const VPI_NAME: PLI_INT32 = 2;
    pub const VPI_FULL_NAME: PLI_INT32 = 3;
    pub const VPI_SIZE: PLI_INT32 = 4;
    pub const VPI_TIME_PRECISION: PLI_INT32 = 12;

    // Scalar values.
    pub const VPI_0: PLI_INT32 = 0;
    pub const VPI_1: PLI_INT32 = 1;
    pub const VPI_Z: PLI_INT32 = 2;
    pub const VPI_X: PLI_INT32 = 3;

    // Value formats.
    pub const VPI_BIN_STR_VAL: PLI_INT32 = 1;
    pub const VPI_SCALAR_VAL: PLI_INT32 = 5;
    pub const VPI_INT_VAL: PLI_INT32 = 6;
    pub const VPI_REAL_VAL: PLI_INT32 = 7;
    pub const VPI_STRING_VAL: PLI_INT32 = 8;
    pub const VPI_SUPPRESS_VAL: PLI_INT32 = 13;

    // Time record types.
    pub const VPI_SCALED_REAL_TIME: PLI_INT32 = 1;
    pub const VPI_SIM_TIME: PLI_INT32 = 2;
    pub const VPI_SUPPRESS_TIME: PLI_INT32 = 3;

    // vpi_put_value flags.
    pub const VPI_NO_DELAY: PLI_INT32 = 1;
    pub const VPI_INERTIAL_DELAY: PLI_INT32 = 2;
    pub const VPI_FORCE_FLAG: PLI_INT32 = 5;
    pub const VPI_RELEASE_FLAG: PLI_INT32 = 6;

    // Callback reasons.
    pub const CB_VALUE_CHANGE: PLI_INT32 = 1;
    pub const CB_READ_WRITE_SYNCH: PLI_INT32 = 6;
    pub const CB_READ_ONLY_SYNCH: PLI_INT32 = 7;
    pub const CB_NEXT_SIM_TIME: PLI_INT32 = 8;
    pub const CB_AFTER_DELAY: PLI_INT32 = 9;
    pub const CB_START_OF_SIMULATION: PLI_INT32 = 11;
    pub const CB_END_OF_SIMULATION: PLI_INT32 = 12;

    // vpi_control operations.
    pub const VPI_FINISH: PLI_INT32 = 67;
}

use consts::*;


#[repr(C)]
#[derive(Copy, Clone)]
pub struct VpiTime {
    pub kind: PLI_INT32,
    pub high: PLI_UINT32,
    pub low: PLI_UINT32,
    pub real: f64,
}

impl VpiTime {
    fn sim(steps: u64) -> VpiTime {
        VpiTime {
            kind: VPI_SIM_TIME,
            high: (steps >> 32) as PLI_UINT32,
            low: steps as PLI_UINT32,
            real: 0.0,
        }
    }

    fn suppressed() -> VpiTime {
        VpiTime { kind: VPI_SUPPRESS_TIME, high: 0, low: 0, real: 0.0 }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union VpiValueUnion {
    pub str_: *mut PLI_BYTE8,
    pub scalar: PLI_INT32,
    pub integer: PLI_INT32,
    pub real: f64,
    pub time: *mut VpiTime,
    pub misc: *mut PLI_BYTE8,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct VpiValue {
    pub format: PLI_INT32,
    pub value: VpiValueUnion,
}

impl VpiValue {
    fn of_format(format: PLI_INT32) -> VpiValue {
        VpiValue {
            format,
            value: VpiValueUnion { integer: 0 },
        }
    }
}

pub type VpiCbFn = extern "C" fn(*mut VpiCbData) -> PLI_INT32;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct VpiCbData {
    pub reason: PLI_INT32,
    pub cb_rtn: Option<VpiCbFn>,
    pub obj: VpiHandle,
    pub time: *mut VpiTime,
    pub value: *mut VpiValue,
    pub index: PLI_INT32,
    pub user_data: *mut PLI_BYTE8,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct VpiVlogInfo {
    pub argc: PLI_INT32,
    pub argv: *mut *mut PLI_BYTE8,
    pub product: *mut PLI_BYTE8,
    pub version: *mut PLI_BYTE8,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct VpiErrorInfo {
    pub state: PLI_INT32,
    pub level: PLI_INT32,
    pub message: *mut PLI_BYTE8,
    pub product: *mut PLI_BYTE8,
    pub code: *mut PLI_BYTE8,
    pub file: *mut PLI_BYTE8,
    pub line: PLI_INT32,
}


// The resolved function table. Probed once from the process image; if
// any symbol is missing the simulator simply does not speak VPI.
#[derive(Copy, Clone)]
struct VpiTable {
    register_cb: unsafe extern "C" fn(*mut VpiCbData) -> VpiHandle,
    remove_cb: unsafe extern "C" fn(VpiHandle) -> PLI_INT32,
    handle_by_name: unsafe extern "C" fn(*const PLI_BYTE8, VpiHandle) -> VpiHandle,
    handle_by_index: unsafe extern "C" fn(VpiHandle, PLI_INT32) -> VpiHandle,
    handle: unsafe extern "C" fn(PLI_INT32, VpiHandle) -> VpiHandle,
    iterate: unsafe extern "C" fn(PLI_INT32, VpiHandle) -> VpiHandle,
    scan: unsafe extern "C" fn(VpiHandle) -> VpiHandle,
    get: unsafe extern "C" fn(PLI_INT32, VpiHandle) -> PLI_INT32,
    get_str: unsafe extern "C" fn(PLI_INT32, VpiHandle) -> *mut PLI_BYTE8,
    get_value: unsafe extern "C" fn(VpiHandle, *mut VpiValue),
    put_value:
        unsafe extern "C" fn(VpiHandle, *mut VpiValue, *mut VpiTime, PLI_INT32) -> VpiHandle,
    get_time: unsafe extern "C" fn(VpiHandle, *mut VpiTime),
    get_vlog_info: unsafe extern "C" fn(*mut VpiVlogInfo) -> PLI_INT32,
    chk_error: unsafe extern "C" fn(*mut VpiErrorInfo) -> PLI_INT32,
    free_object: unsafe extern "C" fn(VpiHandle) -> PLI_INT32,
    control: unsafe extern "C" fn(PLI_INT32, ...) -> PLI_INT32,
}

impl VpiTable {
    fn resolve(lib: &SharedLib) -> Result<VpiTable> {
        unsafe {
            Ok(VpiTable {
                register_cb: lib.resolve(b"vpi_register_cb\0")?,
                remove_cb: lib.resolve(b"vpi_remove_cb\0")?,
                handle_by_name: lib.resolve(b"vpi_handle_by_name\0")?,
                handle_by_index: lib.resolve(b"vpi_handle_by_index\0")?,
                handle: lib.resolve(b"vpi_handle\0")?,
                iterate: lib.resolve(b"vpi_iterate\0")?,
                scan: lib.resolve(b"vpi_scan\0")?,
                get: lib.resolve(b"vpi_get\0")?,
                get_str: lib.resolve(b"vpi_get_str\0")?,
                get_value: lib.resolve(b"vpi_get_value\0")?,
                put_value: lib.resolve(b"vpi_put_value\0")?,
                get_time: lib.resolve(b"vpi_get_time\0")?,
                get_vlog_info: lib.resolve(b"vpi_get_vlog_info\0")?,
                chk_error: lib.resolve(b"vpi_chk_error\0")?,
                free_object: lib.resolve(b"vpi_free_object\0")?,
                control: lib.resolve(b"vpi_control\0")?,
            })
        }
    }
}


// Map a VPI type code onto the abstract taxonomy. Pure so it can be
// tested without a simulator; size disambiguates scalars from vectors.
pub fn classify(type_code: PLI_INT32, size: PLI_INT32) -> ObjectKind {
    match type_code {
        VPI_MODULE | VPI_INTERFACE | VPI_PACKAGE | VPI_NAMED_BEGIN | VPI_NAMED_FORK
        | VPI_GEN_SCOPE | VPI_STRUCT_VAR => ObjectKind::Scope,
        VPI_GEN_SCOPE_ARRAY => ObjectKind::GenScope,
        VPI_MEMORY => ObjectKind::Array,
        VPI_NET | VPI_REG | VPI_MEMORY_WORD | VPI_BIT_VAR => {
            if size > 1 {
                ObjectKind::LogicVector
            } else {
                ObjectKind::Logic
            }
        }
        VPI_NET_BIT | VPI_REG_BIT => ObjectKind::Logic,
        VPI_INTEGER_VAR | VPI_INT_VAR | VPI_LONG_INT_VAR | VPI_SHORT_INT_VAR
        | VPI_BYTE_VAR => ObjectKind::Integer,
        VPI_REAL_VAR => ObjectKind::Real,
        VPI_STRING_VAR => ObjectKind::Str,
        VPI_ENUM_VAR => ObjectKind::Enum,
        VPI_PARAMETER => ObjectKind::Parameter,
        code => {
            log::debug!("unmapped vpi type code {}; treating as unknown", code);
            ObjectKind::Unknown
        }
    }
}


// Per-registration storage the simulator expects to stay put: the
// cb_data and its time/value records. Keyed by cookie, reclaimed at
// disarm.
struct CbStorage {
    data: VpiCbData,
    time: VpiTime,
    value: VpiValue,
}

pub struct VpiBackend {
    #[allow(dead_code)]
    lib: SharedLib,
    t: VpiTable,
    armed: RefCell<HashMap<u64, Box<CbStorage>>>,
}

impl VpiBackend {
    // Probe the process image. A simulator without VPI just fails the
    // first symbol.
    pub fn probe() -> Result<VpiBackend> {
        let lib = SharedLib::current()?;
        let t = VpiTable::resolve(&lib)?;
        Ok(VpiBackend { lib, t, armed: RefCell::new(HashMap::new()) })
    }

    // Surface any pending interface error as Refused.
    fn check(&self, ctx: &str) -> Result<()> {
        let mut info = VpiErrorInfo {
            state: 0,
            level: 0,
            message: std::ptr::null_mut(),
            product: std::ptr::null_mut(),
            code: std::ptr::null_mut(),
            file: std::ptr::null_mut(),
            line: 0,
        };
        let level = unsafe { (self.t.chk_error)(&mut info) };
        if level == 0 {
            return Ok(());
        }
        let message = if info.message.is_null() {
            ctx.to_string()
        } else {
            format!("{}: {}", ctx, unsafe {
                CStr::from_ptr(info.message).to_string_lossy()
            })
        };
        Err(Error::Refused { code: level as i64, message })
    }

    fn get_str_prop(&self, prop: PLI_INT32, hdl: VpiHandle) -> String {
        let p = unsafe { (self.t.get_str)(prop, hdl) };
        if p.is_null() {
            String::new()
        } else {
            // The interface owns the buffer only until the next call;
            // copy out immediately.
            unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
        }
    }

    // Read one bound of a declared range, through its expression
    // handle.
    fn range_bound(&self, method: PLI_INT32, hdl: VpiHandle) -> Option<i64> {
        let expr = unsafe { (self.t.handle)(method, hdl) };
        if expr.is_null() {
            return None;
        }
        let mut val = VpiValue::of_format(VPI_INT_VAL);
        unsafe {
            (self.t.get_value)(expr, &mut val);
            (self.t.free_object)(expr);
        }
        Some(unsafe { val.value.integer } as i64)
    }

    fn seed_from(&self, hdl: VpiHandle) -> Result<ObjectSeed> {
        let type_code = unsafe { (self.t.get)(VPI_TYPE, hdl) };
        let size = unsafe { (self.t.get)(VPI_SIZE, hdl) };
        let kind = classify(type_code, size);
        let name = self.get_str_prop(VPI_NAME, hdl);
        let fullname = self.get_str_prop(VPI_FULL_NAME, hdl);
        let range = match kind {
            ObjectKind::LogicVector | ObjectKind::Array | ObjectKind::GenScope => {
                match (
                    self.range_bound(VPI_LEFT_RANGE, hdl),
                    self.range_bound(VPI_RIGHT_RANGE, hdl),
                ) {
                    (Some(l), Some(r)) => Some((l, r)),
                    _ => None,
                }
            }
            _ => None,
        };
        let length = if kind.is_indexable() {
            Some(size.max(0) as u32)
        } else {
            None
        };
        let meta = ObjectMeta {
            kind,
            name,
            fullname,
            length,
            range,
            is_const: kind == ObjectKind::Parameter,
        };
        Ok(ObjectSeed { raw: SimPtr(hdl), meta })
    }

    fn collect(&self, relation: PLI_INT32, parent: VpiHandle, out: &mut Vec<ObjectSeed>) {
        let it = unsafe { (self.t.iterate)(relation, parent) };
        if it.is_null() {
            // A null iterator is VPI for "no objects of that class".
            return;
        }
        loop {
            let hdl = unsafe { (self.t.scan)(it) };
            if hdl.is_null() {
                // vpi_scan frees the iterator when it returns NULL.
                break;
            }
            match self.seed_from(hdl) {
                Ok(seed) => out.push(seed),
                Err(e) => e.report("vpi iteration"),
            }
        }
    }

    fn read_value(&self, obj: &Object, format: PLI_INT32) -> Result<VpiValue> {
        let mut val = VpiValue::of_format(format);
        unsafe { (self.t.get_value)(obj.raw.0, &mut val) };
        self.check(&obj.meta.fullname)?;
        Ok(val)
    }
}


fn selector_relations(selector: Selector) -> &'static [PLI_INT32] {
    match selector {
        Selector::Children => &[
            VPI_MODULE,
            VPI_GEN_SCOPE_ARRAY,
            VPI_NET,
            VPI_REG,
            VPI_MEMORY,
            VPI_INTEGER_VAR,
            VPI_REAL_VAR,
            VPI_STRING_VAR,
            VPI_ENUM_VAR,
            VPI_STRUCT_VAR,
            VPI_PARAMETER,
        ],
        Selector::Instances => &[VPI_MODULE, VPI_GEN_SCOPE_ARRAY],
        Selector::Signals => &[
            VPI_NET,
            VPI_REG,
            VPI_MEMORY,
            VPI_INTEGER_VAR,
            VPI_REAL_VAR,
            VPI_STRING_VAR,
            VPI_ENUM_VAR,
        ],
        Selector::Parameters => &[VPI_PARAMETER],
        Selector::Packages => &[VPI_PACKAGE],
    }
}


impl Backend for VpiBackend {
    fn name(&self) -> &'static str {
        "vpi"
    }

    fn convention(&self) -> Convention {
        Convention::DotBracket
    }

    fn states(&self) -> ValueStates {
        ValueStates::Four
    }

    fn sim_info(&self) -> Result<SimulatorInfo> {
        let mut info = VpiVlogInfo {
            argc: 0,
            argv: std::ptr::null_mut(),
            product: std::ptr::null_mut(),
            version: std::ptr::null_mut(),
        };
        let ok = unsafe { (self.t.get_vlog_info)(&mut info) };
        if ok == 0 {
            return Err(Error::Refused {
                code: 0,
                message: "vpi_get_vlog_info failed".to_string(),
            });
        }
        let text = |p: *mut PLI_BYTE8| {
            if p.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
            }
        };
        let precision = unsafe { (self.t.get)(VPI_TIME_PRECISION, std::ptr::null_mut()) };
        Ok(SimulatorInfo {
            product: text(info.product),
            version: text(info.version),
            precision,
        })
    }

    fn root(&self, name: Option<&str>) -> Result<Option<ObjectSeed>> {
        let it = unsafe { (self.t.iterate)(VPI_MODULE, std::ptr::null_mut()) };
        if it.is_null() {
            return Ok(None);
        }
        loop {
            let hdl = unsafe { (self.t.scan)(it) };
            if hdl.is_null() {
                return Ok(None);
            }
            let seed = self.seed_from(hdl)?;
            match name {
                None => {
                    unsafe { (self.t.free_object)(it) };
                    return Ok(Some(seed));
                }
                Some(wanted) if seed.meta.name == wanted => {
                    unsafe { (self.t.free_object)(it) };
                    return Ok(Some(seed));
                }
                Some(_) => (),
            }
        }
    }

    fn child_by_name(&self, parent: &Object, name: &str) -> Result<Option<ObjectSeed>> {
        let escaped = crate::naming::escape_verilog(name);
        let c_name = CString::new(escaped.as_ref()).map_err(|_| Error::NotFound(name.to_string()))?;
        let hdl = unsafe { (self.t.handle_by_name)(c_name.as_ptr(), parent.raw.0) };
        if hdl.is_null() {
            return Ok(None);
        }
        Ok(Some(self.seed_from(hdl)?))
    }

    fn child_by_position(&self, parent: &Object, position: u32) -> Result<Option<ObjectSeed>> {
        let index = parent.meta.index_at(position);
        let hdl = unsafe { (self.t.handle_by_index)(parent.raw.0, index as PLI_INT32) };
        if hdl.is_null() {
            return Ok(None);
        }
        Ok(Some(self.seed_from(hdl)?))
    }

    fn iterate(&self, parent: &Object, selector: Selector) -> Result<CursorState> {
        // VPI has one native iterator per relation; a selector spans
        // several, so pre-collect. This also pins down the iteration
        // order, which must be stable across repeats.
        let mut items = Vec::new();
        for relation in selector_relations(selector) {
            self.collect(*relation, parent.raw.0, &mut items);
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
            CursorState::Native(it) => {
                let hdl = unsafe { (self.t.scan)(it.0) };
                if hdl.is_null() {
                    *state = CursorState::Done;
                    Ok(None)
                } else {
                    Ok(Some(self.seed_from(hdl)?))
                }
            }
            CursorState::Done => Ok(None),
        }
    }

    fn cursor_free(&self, state: &mut CursorState) {
        if let CursorState::Native(it) = state {
            if !it.is_null() {
                unsafe { (self.t.free_object)(it.0) };
            }
        }
        *state = CursorState::Done;
    }

    fn read_binstr(&self, obj: &Object) -> Result<String> {
        let val = self.read_value(obj, VPI_BIN_STR_VAL)?;
        let p = unsafe { val.value.str_ };
        if p.is_null() {
            return Err(Error::Refused {
                code: 0,
                message: format!("{}: no bin-string value", obj.meta.fullname),
            });
        }
        Ok(unsafe { CStr::from_ptr(p) }
            .to_string_lossy()
            .to_ascii_uppercase())
    }

    fn read_long(&self, obj: &Object) -> Result<i64> {
        let width = obj.meta.length.unwrap_or(1);
        if width <= 32 {
            let val = self.read_value(obj, VPI_INT_VAL)?;
            Ok(unsafe { val.value.integer } as i64)
        } else {
            // The native integer format is 32-bit; go through the
            // bit-string for anything wider.
            value::binstr_to_long(&self.read_binstr(obj)?)
        }
    }

    fn read_real(&self, obj: &Object) -> Result<f64> {
        let val = self.read_value(obj, VPI_REAL_VAL)?;
        Ok(unsafe { val.value.real })
    }

    fn read_str(&self, obj: &Object) -> Result<String> {
        let val = self.read_value(obj, VPI_STRING_VAL)?;
        let p = unsafe { val.value.str_ };
        if p.is_null() {
            return Ok(String::new());
        }
        Ok(unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
    }

    fn write(&self, obj: &Object, value: &Value, action: SetAction) -> Result<()> {
        // Keeps any CString alive until after put_value returns.
        let mut text_keepalive = None;
        let mut val = match value {
            Value::BinStr(s) => {
                let bits = value::parse_binstr(s)?;
                let folded = value::render_binstr(&value::fold_binstr_4state(&bits));
                let c = CString::new(folded).map_err(|_| Error::Internal(
                    "NUL in folded bit-string".to_string(),
                ))?;
                let mut v = VpiValue::of_format(VPI_BIN_STR_VAL);
                v.value.str_ = c.as_ptr() as *mut PLI_BYTE8;
                text_keepalive = Some(c);
                v
            }
            Value::Integer(i) => {
                let mut v = VpiValue::of_format(VPI_INT_VAL);
                v.value.integer = *i as PLI_INT32;
                v
            }
            Value::Real(r) => {
                let mut v = VpiValue::of_format(VPI_REAL_VAL);
                v.value.real = *r;
                v
            }
            Value::Str(s) => {
                let c = CString::new(s.as_str()).map_err(|_| Error::Internal(
                    "NUL in string value".to_string(),
                ))?;
                let mut v = VpiValue::of_format(VPI_STRING_VAL);
                v.value.str_ = c.as_ptr() as *mut PLI_BYTE8;
                text_keepalive = Some(c);
                v
            }
        };
        if action == SetAction::Release {
            // The carried bits are ignored on release.
            val = VpiValue::of_format(VPI_SUPPRESS_VAL);
        }
        let flags = match action {
            SetAction::DepositInertial => VPI_INERTIAL_DELAY,
            SetAction::DepositNoDelay => VPI_NO_DELAY,
            SetAction::Force => VPI_FORCE_FLAG,
            SetAction::Release => VPI_RELEASE_FLAG,
        };
        let mut time = VpiTime::sim(0);
        unsafe {
            (self.t.put_value)(obj.raw.0, &mut val, &mut time, flags);
        }
        drop(text_keepalive);
        self.check(&obj.meta.fullname)
    }

    fn cb_arm(&self, spec: &CbSpec, cookie: u64) -> Result<SimPtr> {
        let mut storage = Box::new(CbStorage {
            data: VpiCbData {
                reason: 0,
                cb_rtn: Some(vpi_dispatch),
                obj: std::ptr::null_mut(),
                time: std::ptr::null_mut(),
                value: std::ptr::null_mut(),
                index: 0,
                user_data: cookie as usize as *mut PLI_BYTE8,
            },
            time: VpiTime::sim(0),
            value: VpiValue::of_format(VPI_SUPPRESS_VAL),
        });
        match spec.kind {
            CbKind::Timed => {
                storage.data.reason = CB_AFTER_DELAY;
                storage.time = VpiTime::sim(spec.steps);
            }
            CbKind::NextStep => {
                storage.data.reason = CB_NEXT_SIM_TIME;
            }
            CbKind::ReadWrite => {
                storage.data.reason = CB_READ_WRITE_SYNCH;
            }
            CbKind::ReadOnly => {
                storage.data.reason = CB_READ_ONLY_SYNCH;
            }
            CbKind::ValueChange => {
                storage.data.reason = CB_VALUE_CHANGE;
                storage.data.obj = spec
                    .signal
                    .ok_or_else(|| {
                        Error::Internal("value-change arm with no signal".to_string())
                    })?
                    .0;
                storage.time = VpiTime::suppressed();
            }
        }
        storage.data.time = &mut storage.time;
        storage.data.value = &mut storage.value;
        let token = unsafe { (self.t.register_cb)(&mut storage.data) };
        if token.is_null() {
            self.check("vpi_register_cb")?;
            return Err(Error::Refused {
                code: 0,
                message: format!("{} callback refused", spec.kind.label()),
            });
        }
        self.armed.borrow_mut().insert(cookie, storage);
        Ok(SimPtr(token))
    }

    fn cb_disarm(&self, spec: &CbSpec, token: SimPtr, cookie: u64, fired: bool) -> Result<()> {
        self.armed.borrow_mut().remove(&cookie);
        // A fired one-shot token was consumed by the simulator; only a
        // live registration wants vpi_remove_cb.
        if !fired && !token.is_null() {
            let ok = unsafe { (self.t.remove_cb)(token.0) };
            if ok == 0 {
                return Err(Error::Refused {
                    code: 0,
                    message: format!("{} callback removal refused", spec.kind.label()),
                });
            }
        }
        Ok(())
    }

    fn cb_rearm(&self, _spec: &CbSpec, token: SimPtr, _cookie: u64) -> Result<SimPtr> {
        // cbValueChange registrations persist until removed; the same
        // token keeps firing.
        Ok(token)
    }

    fn time(&self) -> (u32, u32) {
        let mut t = VpiTime::sim(0);
        unsafe { (self.t.get_time)(std::ptr::null_mut(), &mut t) };
        (t.high, t.low)
    }

    fn precision(&self) -> i32 {
        unsafe { (self.t.get)(VPI_TIME_PRECISION, std::ptr::null_mut()) }
    }

    fn stop(&self) -> Result<()> {
        unsafe { (self.t.control)(VPI_FINISH) };
        self.check("vpi_control(finish)")
    }

    fn release_object(&self, raw: SimPtr) {
        if !raw.is_null() {
            unsafe { (self.t.free_object)(raw.0) };
        }
    }
}


// Every armed callback funnels through here; the cookie in user_data
// leads back to the owning handle.
extern "C" fn vpi_dispatch(cb_data: *mut VpiCbData) -> PLI_INT32 {
    if cb_data.is_null() {
        return 0;
    }
    let cookie = unsafe { (*cb_data).user_data } as usize as u64;
    crate::facade::dispatch(cookie);
    0
}

extern "C" fn vpi_simulation_started(_cb_data: *mut VpiCbData) -> PLI_INT32 {
    crate::facade::simulation_started();
    0
}

extern "C" fn vpi_simulation_ended(_cb_data: *mut VpiCbData) -> PLI_INT32 {
    crate::facade::simulation_ended();
    0
}


fn register_phase_callback(t: &VpiTable, reason: PLI_INT32, rtn: VpiCbFn) -> Result<()> {
    let mut time = VpiTime::sim(0);
    let mut data = VpiCbData {
        reason,
        cb_rtn: Some(rtn),
        obj: std::ptr::null_mut(),
        time: &mut time,
        value: std::ptr::null_mut(),
        index: 0,
        user_data: std::ptr::null_mut(),
    };
    let token = unsafe { (t.register_cb)(&mut data) };
    if token.is_null() {
        Err(Error::Refused {
            code: 0,
            message: format!("lifecycle callback {} refused", reason),
        })
    } else {
        Ok(())
    }
}

// The simulator invokes this while walking vlog_startup_routines.
pub extern "C" fn vpi_entry() {
    crate::logging::install();
    let backend = match VpiBackend::probe() {
        Ok(b) => b,
        Err(e) => {
            log::debug!("vpi not provided by this simulator: {}", e);
            return;
        }
    };
    let t = backend.t;
    if let Err(e) = register_phase_callback(&t, CB_START_OF_SIMULATION, vpi_simulation_started)
    {
        e.report("vpi startup");
        return;
    }
    if let Err(e) = register_phase_callback(&t, CB_END_OF_SIMULATION, vpi_simulation_ended) {
        e.report("vpi startup");
    }
    crate::facade::with(|g| g.register_backend(Box::new(backend)));
}

#[no_mangle]
pub static vlog_startup_routines: [Option<extern "C" fn()>; 2] = [Some(vpi_entry), None];
