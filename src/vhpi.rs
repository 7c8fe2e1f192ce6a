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

// The VHDL VHPI backend.
//
// Same shape as the VPI backend, different vocabulary: the design is
// reached through the root instance rather than a top-module
// iteration, paths are colon-separated, and values are nine-state
// std_logic enumerations rather than four-state strings. Signal
// classification probes the object's natural value format and falls
// back to the base type name to tell logic from general enumerations.

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
use crate::value::{Bit, SetAction, Value};

pub type vhpiHandleT = *mut c_void;
pub type vhpiIntT = i32;
pub type vhpiEnumT = u32;
pub type vhpiCharT = c_char;

#[allow(dead_code)]
pub mod consts {
    use super::vhpiIntT;

    // Object class kinds.
    pub const VHPI_ROOT_INST_K: vhpiIntT = 67;
    pub const VHPI_COMP_INST_STMT_K: vhpiIntT = 14;
    pub const VHPI_BLOCK_STMT_K: vhpiIntT = 7;
    pub const VHPI_FOR_GENERATE_K: vhpiIntT = 28;
    pub const VHPI_IF_GENERATE_K: vhpiIntT = 33;
    pub const VHPI_PACK_INST_K: vhpiIntT = 57;
    pub const VHPI_SIG_DECL_K: vhpiIntT = 71;
    pub const VHPI_PORT_DECL_K: vhpiIntT = 60;
    pub const VHPI_GENERIC_DECL_K: vhpiIntT = 31;
    pub const VHPI_CONST_DECL_K: vhpiIntT = 16;
    pub const VHPI_INDEXED_NAME_K: vhpiIntT = 35;

    // One-to-one relations.
    pub const VHPI_ROOT_INST: vhpiIntT = 304;
    pub const VHPI_BASE_TYPE: vhpiIntT = 308;
    pub const VHPI_TOOL: vhpiIntT = 316;

    // One-to-many relations.
    pub const VHPI_INTERNAL_REGIONS: vhpiIntT = 407;
    pub const VHPI_DECLS: vhpiIntT = 403;
    pub const VHPI_SIG_DECLS: vhpiIntT = 413;
    pub const VHPI_PORT_DECLS: vhpiIntT = 411;
    pub const VHPI_GENERIC_DECLS: vhpiIntT = 405;
    pub const VHPI_CONST_DECLS: vhpiIntT = 401;
    pub const VHPI_COMP_INST_STMTS: vhpiIntT = 400;
    pub const VHPI_PACK_INSTS: vhpiIntT = 409;
    pub const VHPI_INDEXED_NAMES: vhpiIntT = 406;

    // Integer properties.
    pub const VHPI_KIND_P: vhpiIntT = 1;
    pub const VHPI_SIZE_P: vhpiIntT = 4;
    pub const VHPI_LEFT_BOUND_P: vhpiIntT = 6;
    pub const VHPI_RIGHT_BOUND_P: vhpiIntT = 7;
    pub const VHPI_IS_COMPOSITE_P: vhpiIntT = 12;

    // String properties.
    pub const VHPI_NAME_P: vhpiIntT = 1;
    pub const VHPI_FULL_NAME_P: vhpiIntT = 3;
    pub const VHPI_CASE_NAME_P: vhpiIntT = 2;
    pub const VHPI_TOOL_VERSION_P: vhpiIntT = 8;

    // Physical properties.
    pub const VHPI_RESOLUTION_LIMIT_P: vhpiIntT = 1;

    // Value formats.
    pub const VHPI_BIN_STR_VAL: vhpiIntT = 1;
    pub const VHPI_ENUM_VAL: vhpiIntT = 5;
    pub const VHPI_INT_VAL: vhpiIntT = 6;
    pub const VHPI_REAL_VAL: vhpiIntT = 8;
    pub const VHPI_STR_VAL: vhpiIntT = 9;
    pub const VHPI_ENUM_VEC_VAL: vhpiIntT = 15;
    pub const VHPI_OBJ_TYPE_VAL: vhpiIntT = 13;

    // Put-value modes.
    pub const VHPI_DEPOSIT: vhpiIntT = 1;
    pub const VHPI_DEPOSIT_PROPAGATE: vhpiIntT = 2;
    pub const VHPI_FORCE: vhpiIntT = 3;
    pub const VHPI_RELEASE: vhpiIntT = 5;

    // Callback reasons.
    pub const VHPI_CB_VALUE_CHANGE: vhpiIntT = 1001;
    pub const VHPI_CB_AFTER_DELAY: vhpiIntT = 1003;
    pub const VHPI_CB_NEXT_TIME_STEP: vhpiIntT = 1017;
    pub const VHPI_CB_LAST_KNOWN_DELTA_CYCLE: vhpiIntT = 1021;
    pub const VHPI_CB_END_OF_TIME_STEP: vhpiIntT = 1019;
    pub const VHPI_CB_START_OF_SIMULATION: vhpiIntT = 1026;
    pub const VHPI_CB_END_OF_SIMULATION: vhpiIntT = 1027;

    // vhpi_control commands.
    pub const VHPI_FINISH: vhpiIntT = 1;
}

use consts::*;

// The std_logic enumeration, in declaration order. VHPI enum values
// for logic signals are ordinals into this.
const STD_LOGIC: [Bit; 9] = [
    Bit::U,
    Bit::X,
    Bit::Zero,
    Bit::One,
    Bit::Z,
    Bit::W,
    Bit::L,
    Bit::H,
    Bit::DontCare,
];

fn ordinal_of(bit: Bit) -> vhpiEnumT {
    STD_LOGIC
        .iter()
        .position(|b| *b == bit)
        .map(|p| p as vhpiEnumT)
        .unwrap_or(1)
}


#[repr(C)]
#[derive(Copy, Clone)]
pub struct vhpiTimeT {
    pub high: u32,
    pub low: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct vhpiPhysT {
    pub high: i32,
    pub low: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union vhpiValueUnion {
    pub enumv: vhpiEnumT,
    pub enumvs: *mut vhpiEnumT,
    pub intg: vhpiIntT,
    pub real: f64,
    pub str_: *mut vhpiCharT,
    pub ptr: *mut c_void,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct vhpiValueT {
    pub format: vhpiIntT,
    pub buf_size: usize,
    pub num_elems: i32,
    pub unit: vhpiPhysT,
    pub value: vhpiValueUnion,
}

impl vhpiValueT {
    fn of_format(format: vhpiIntT) -> vhpiValueT {
        vhpiValueT {
            format,
            buf_size: 0,
            num_elems: 0,
            unit: vhpiPhysT { high: 0, low: 0 },
            value: vhpiValueUnion { intg: 0 },
        }
    }
}

pub type VhpiCbFn = extern "C" fn(*const vhpiCbDataT);

#[repr(C)]
#[derive(Copy, Clone)]
pub struct vhpiCbDataT {
    pub reason: vhpiIntT,
    pub cb_rtn: Option<VhpiCbFn>,
    pub obj: vhpiHandleT,
    pub time: *mut vhpiTimeT,
    pub value: *mut vhpiValueT,
    pub user_data: *mut c_void,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct vhpiErrorInfoT {
    pub severity: vhpiIntT,
    pub message: *mut vhpiCharT,
    pub str_: *mut vhpiCharT,
    pub file: *mut vhpiCharT,
    pub line: vhpiIntT,
}


#[derive(Copy, Clone)]
struct VhpiTable {
    handle_by_name: unsafe extern "C" fn(*const vhpiCharT, vhpiHandleT) -> vhpiHandleT,
    handle_by_index: unsafe extern "C" fn(vhpiIntT, vhpiHandleT, i32) -> vhpiHandleT,
    handle: unsafe extern "C" fn(vhpiIntT, vhpiHandleT) -> vhpiHandleT,
    iterator: unsafe extern "C" fn(vhpiIntT, vhpiHandleT) -> vhpiHandleT,
    scan: unsafe extern "C" fn(vhpiHandleT) -> vhpiHandleT,
    get: unsafe extern "C" fn(vhpiIntT, vhpiHandleT) -> vhpiIntT,
    get_str: unsafe extern "C" fn(vhpiIntT, vhpiHandleT) -> *const vhpiCharT,
    get_phys: unsafe extern "C" fn(vhpiIntT, vhpiHandleT) -> vhpiPhysT,
    get_value: unsafe extern "C" fn(vhpiHandleT, *mut vhpiValueT) -> i32,
    put_value: unsafe extern "C" fn(vhpiHandleT, *mut vhpiValueT, vhpiIntT) -> i32,
    register_cb: unsafe extern "C" fn(*mut vhpiCbDataT, i32) -> vhpiHandleT,
    remove_cb: unsafe extern "C" fn(vhpiHandleT) -> i32,
    get_time: unsafe extern "C" fn(*mut vhpiTimeT, *mut i64),
    check_error: unsafe extern "C" fn(*mut vhpiErrorInfoT) -> i32,
    release_handle: unsafe extern "C" fn(vhpiHandleT) -> i32,
    control: unsafe extern "C" fn(vhpiIntT, ...) -> i32,
}

impl VhpiTable {
    fn resolve(lib: &SharedLib) -> Result<VhpiTable> {
        unsafe {
            Ok(VhpiTable {
                handle_by_name: lib.resolve(b"vhpi_handle_by_name\0")?,
                handle_by_index: lib.resolve(b"vhpi_handle_by_index\0")?,
                handle: lib.resolve(b"vhpi_handle\0")?,
                iterator: lib.resolve(b"vhpi_iterator\0")?,
                scan: lib.resolve(b"vhpi_scan\0")?,
                get: lib.resolve(b"vhpi_get\0")?,
                get_str: lib.resolve(b"vhpi_get_str\0")?,
                get_phys: lib.resolve(b"vhpi_get_phys\0")?,
                get_value: lib.resolve(b"vhpi_get_value\0")?,
                put_value: lib.resolve(b"vhpi_put_value\0")?,
                register_cb: lib.resolve(b"vhpi_register_cb\0")?,
                remove_cb: lib.resolve(b"vhpi_remove_cb\0")?,
                get_time: lib.resolve(b"vhpi_get_time\0")?,
                check_error: lib.resolve(b"vhpi_check_error\0")?,
                release_handle: lib.resolve(b"vhpi_release_handle\0")?,
                control: lib.resolve(b"vhpi_control\0")?,
            })
        }
    }
}


struct CbStorage {
    data: vhpiCbDataT,
    time: vhpiTimeT,
}

pub struct VhpiBackend {
    #[allow(dead_code)]
    lib: SharedLib,
    t: VhpiTable,
    armed: RefCell<HashMap<u64, Box<CbStorage>>>,
}

impl VhpiBackend {
    pub fn probe() -> Result<VhpiBackend> {
        let lib = SharedLib::current()?;
        let t = VhpiTable::resolve(&lib)?;
        Ok(VhpiBackend { lib, t, armed: RefCell::new(HashMap::new()) })
    }

    fn check(&self, ctx: &str) -> Result<()> {
        let mut info = vhpiErrorInfoT {
            severity: 0,
            message: std::ptr::null_mut(),
            str_: std::ptr::null_mut(),
            file: std::ptr::null_mut(),
            line: 0,
        };
        let severity = unsafe { (self.t.check_error)(&mut info) };
        if severity == 0 {
            return Ok(());
        }
        let message = if info.message.is_null() {
            ctx.to_string()
        } else {
            format!("{}: {}", ctx, unsafe {
                CStr::from_ptr(info.message).to_string_lossy()
            })
        };
        Err(Error::Refused { code: severity as i64, message })
    }

    fn get_str_prop(&self, prop: vhpiIntT, hdl: vhpiHandleT) -> String {
        let p = unsafe { (self.t.get_str)(prop, hdl) };
        if p.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
        }
    }

    // Probe the natural value format and, for enumerations, the base
    // type name; std_logic and bit flavors are logic, anything else
    // enumerated stays Enum.
    fn classify_signal(&self, hdl: vhpiHandleT, size: vhpiIntT) -> ObjectKind {
        let mut probe = vhpiValueT::of_format(VHPI_OBJ_TYPE_VAL);
        let ok = unsafe { (self.t.get_value)(hdl, &mut probe) };
        if ok != 0 {
            return ObjectKind::Unknown;
        }
        match probe.format {
            VHPI_ENUM_VAL | VHPI_ENUM_VEC_VAL => {
                let base = unsafe { (self.t.handle)(VHPI_BASE_TYPE, hdl) };
                let type_name = if base.is_null() {
                    String::new()
                } else {
                    let n = self.get_str_prop(VHPI_NAME_P, base);
                    unsafe { (self.t.release_handle)(base) };
                    n.to_ascii_lowercase()
                };
                let logic = matches!(
                    type_name.as_str(),
                    "std_logic" | "std_ulogic" | "bit" | "std_logic_vector"
                        | "std_ulogic_vector" | "bit_vector"
                );
                match (logic, probe.format == VHPI_ENUM_VEC_VAL || size > 1) {
                    (true, true) => ObjectKind::LogicVector,
                    (true, false) => ObjectKind::Logic,
                    (false, _) => {
                        if type_name == "boolean" {
                            ObjectKind::Boolean
                        } else {
                            ObjectKind::Enum
                        }
                    }
                }
            }
            VHPI_INT_VAL => ObjectKind::Integer,
            VHPI_REAL_VAL => ObjectKind::Real,
            VHPI_STR_VAL => ObjectKind::Str,
            other => {
                log::debug!("unmapped vhpi value format {}; treating as unknown", other);
                ObjectKind::Unknown
            }
        }
    }

    fn seed_from(&self, hdl: vhpiHandleT) -> Result<ObjectSeed> {
        let class = unsafe { (self.t.get)(VHPI_KIND_P, hdl) };
        let size = unsafe { (self.t.get)(VHPI_SIZE_P, hdl) };
        let kind = match class {
            VHPI_ROOT_INST_K | VHPI_COMP_INST_STMT_K | VHPI_BLOCK_STMT_K
            | VHPI_IF_GENERATE_K | VHPI_PACK_INST_K => ObjectKind::Scope,
            VHPI_FOR_GENERATE_K => ObjectKind::GenScope,
            VHPI_GENERIC_DECL_K | VHPI_CONST_DECL_K => ObjectKind::Parameter,
            VHPI_SIG_DECL_K | VHPI_PORT_DECL_K | VHPI_INDEXED_NAME_K => {
                self.classify_signal(hdl, size)
            }
            code => {
                log::debug!("unmapped vhpi class kind {}; treating as unknown", code);
                ObjectKind::Unknown
            }
        };
        let name = self.get_str_prop(VHPI_CASE_NAME_P, hdl);
        let name = if name.is_empty() {
            self.get_str_prop(VHPI_NAME_P, hdl)
        } else {
            name
        };
        let fullname = self.get_str_prop(VHPI_FULL_NAME_P, hdl);
        let (length, range) = if kind.is_indexable() {
            let l = unsafe { (self.t.get)(VHPI_LEFT_BOUND_P, hdl) } as i64;
            let r = unsafe { (self.t.get)(VHPI_RIGHT_BOUND_P, hdl) } as i64;
            if size > 0 && (l - r).abs() + 1 == size as i64 {
                (Some(size as u32), Some((l, r)))
            } else {
                (Some(size.max(0) as u32), None)
            }
        } else {
            (None, None)
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

    fn collect(&self, relation: vhpiIntT, parent: vhpiHandleT, out: &mut Vec<ObjectSeed>) {
        let it = unsafe { (self.t.iterator)(relation, parent) };
        if it.is_null() {
            return;
        }
        loop {
            let hdl = unsafe { (self.t.scan)(it) };
            if hdl.is_null() {
                break;
            }
            match self.seed_from(hdl) {
                Ok(seed) => out.push(seed),
                Err(e) => e.report("vhpi iteration"),
            }
        }
    }

    // Read through a caller-allocated text buffer, the VHPI way.
    fn read_text(&self, obj: &Object, format: vhpiIntT) -> Result<String> {
        let capacity = obj.meta.length.unwrap_or(1) as usize + 1;
        let mut buffer = vec![0u8; capacity.max(2)];
        let mut val = vhpiValueT::of_format(format);
        val.buf_size = buffer.len();
        val.value.str_ = buffer.as_mut_ptr() as *mut vhpiCharT;
        let ok = unsafe { (self.t.get_value)(obj.raw.0, &mut val) };
        if ok != 0 {
            self.check(&obj.meta.fullname)?;
            return Err(Error::Refused {
                code: ok as i64,
                message: format!("{}: value read failed", obj.meta.fullname),
            });
        }
        let end = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
        Ok(String::from_utf8_lossy(&buffer[..end]).into_owned())
    }
}


fn selector_relations(selector: Selector) -> &'static [vhpiIntT] {
    match selector {
        Selector::Children => &[
            VHPI_INTERNAL_REGIONS,
            VHPI_COMP_INST_STMTS,
            VHPI_PORT_DECLS,
            VHPI_SIG_DECLS,
            VHPI_GENERIC_DECLS,
            VHPI_CONST_DECLS,
        ],
        Selector::Instances => &[VHPI_INTERNAL_REGIONS, VHPI_COMP_INST_STMTS],
        Selector::Signals => &[VHPI_PORT_DECLS, VHPI_SIG_DECLS],
        Selector::Parameters => &[VHPI_GENERIC_DECLS, VHPI_CONST_DECLS],
        Selector::Packages => &[VHPI_PACK_INSTS],
    }
}


impl Backend for VhpiBackend {
    fn name(&self) -> &'static str {
        "vhpi"
    }

    fn convention(&self) -> Convention {
        Convention::ColonParen
    }

    fn states(&self) -> ValueStates {
        ValueStates::Nine
    }

    fn sim_info(&self) -> Result<SimulatorInfo> {
        let tool = unsafe { (self.t.handle)(VHPI_TOOL, std::ptr::null_mut()) };
        let (product, version) = if tool.is_null() {
            ("vhpi".to_string(), String::new())
        } else {
            let p = self.get_str_prop(VHPI_NAME_P, tool);
            let v = self.get_str_prop(VHPI_TOOL_VERSION_P, tool);
            unsafe { (self.t.release_handle)(tool) };
            (p, v)
        };
        let limit = unsafe { (self.t.get_phys)(VHPI_RESOLUTION_LIMIT_P, std::ptr::null_mut()) };
        let mut fs = ((limit.high as i64) << 32 | limit.low as i64).max(1) as u64;
        // The resolution limit arrives in femtoseconds; reduce to a
        // power-of-ten exponent.
        let mut precision = -15i32;
        while fs >= 10 && fs % 10 == 0 {
            fs /= 10;
            precision += 1;
        }
        Ok(SimulatorInfo { product, version, precision })
    }

    fn root(&self, name: Option<&str>) -> Result<Option<ObjectSeed>> {
        let hdl = unsafe { (self.t.handle)(VHPI_ROOT_INST, std::ptr::null_mut()) };
        if hdl.is_null() {
            return Ok(None);
        }
        let seed = self.seed_from(hdl)?;
        match name {
            Some(wanted) if !wanted.eq_ignore_ascii_case(&seed.meta.name) => {
                // VHDL names are case-insensitive; an honest miss.
                unsafe { (self.t.release_handle)(hdl) };
                Ok(None)
            }
            _ => Ok(Some(seed)),
        }
    }

    fn child_by_name(&self, parent: &Object, name: &str) -> Result<Option<ObjectSeed>> {
        let escaped = crate::naming::escape_vhdl(name);
        let c_name =
            CString::new(escaped.as_ref()).map_err(|_| Error::NotFound(name.to_string()))?;
        let hdl = unsafe { (self.t.handle_by_name)(c_name.as_ptr(), parent.raw.0) };
        if hdl.is_null() {
            return Ok(None);
        }
        Ok(Some(self.seed_from(hdl)?))
    }

    fn child_by_position(&self, parent: &Object, position: u32) -> Result<Option<ObjectSeed>> {
        let index = parent.meta.index_at(position);
        let hdl = unsafe {
            (self.t.handle_by_index)(VHPI_INDEXED_NAMES, parent.raw.0, index as i32)
        };
        if hdl.is_null() {
            return Ok(None);
        }
        Ok(Some(self.seed_from(hdl)?))
    }

    fn iterate(&self, parent: &Object, selector: Selector) -> Result<CursorState> {
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
                unsafe { (self.t.release_handle)(it.0) };
            }
        }
        *state = CursorState::Done;
    }

    fn read_binstr(&self, obj: &Object) -> Result<String> {
        self.read_text(obj, VHPI_BIN_STR_VAL)
            .map(|s| s.to_ascii_uppercase())
    }

    fn read_long(&self, obj: &Object) -> Result<i64> {
        let mut val = vhpiValueT::of_format(VHPI_INT_VAL);
        let ok = unsafe { (self.t.get_value)(obj.raw.0, &mut val) };
        if ok != 0 {
            // Logic vectors do not answer IntVal everywhere; the
            // bit-string path is the portable fallback.
            return crate::value::binstr_to_long(&self.read_binstr(obj)?);
        }
        Ok(unsafe { val.value.intg } as i64)
    }

    fn read_real(&self, obj: &Object) -> Result<f64> {
        let mut val = vhpiValueT::of_format(VHPI_REAL_VAL);
        let ok = unsafe { (self.t.get_value)(obj.raw.0, &mut val) };
        if ok != 0 {
            self.check(&obj.meta.fullname)?;
            return Err(Error::Refused {
                code: ok as i64,
                message: format!("{}: real read failed", obj.meta.fullname),
            });
        }
        Ok(unsafe { val.value.real })
    }

    fn read_str(&self, obj: &Object) -> Result<String> {
        self.read_text(obj, VHPI_STR_VAL)
    }

    fn write(&self, obj: &Object, value: &Value, action: SetAction) -> Result<()> {
        let mode = match action {
            SetAction::DepositInertial => VHPI_DEPOSIT_PROPAGATE,
            SetAction::DepositNoDelay => VHPI_DEPOSIT,
            SetAction::Force => VHPI_FORCE,
            SetAction::Release => VHPI_RELEASE,
        };
        // Enum ordinals must stay alive until put_value returns.
        let mut ordinals;
        let mut text_keepalive = None;
        let mut val = match value {
            Value::BinStr(s) => {
                let bits = crate::value::parse_binstr(s)?;
                let mut v;
                if bits.len() == 1 {
                    v = vhpiValueT::of_format(VHPI_ENUM_VAL);
                    v.value.enumv = ordinal_of(bits[0]);
                } else {
                    ordinals = bits.iter().map(|b| ordinal_of(*b)).collect::<Vec<_>>();
                    v = vhpiValueT::of_format(VHPI_ENUM_VEC_VAL);
                    v.buf_size = ordinals.len() * std::mem::size_of::<vhpiEnumT>();
                    v.num_elems = ordinals.len() as i32;
                    v.value.enumvs = ordinals.as_mut_ptr();
                }
                v
            }
            Value::Integer(i) => {
                let mut v = vhpiValueT::of_format(VHPI_INT_VAL);
                v.value.intg = *i as vhpiIntT;
                v
            }
            Value::Real(r) => {
                let mut v = vhpiValueT::of_format(VHPI_REAL_VAL);
                v.value.real = *r;
                v
            }
            Value::Str(s) => {
                let c = CString::new(s.as_str())
                    .map_err(|_| Error::Internal("NUL in string value".to_string()))?;
                let mut v = vhpiValueT::of_format(VHPI_STR_VAL);
                v.buf_size = s.len() + 1;
                v.value.str_ = c.as_ptr() as *mut vhpiCharT;
                text_keepalive = Some(c);
                v
            }
        };
        let ok = unsafe { (self.t.put_value)(obj.raw.0, &mut val, mode) };
        drop(text_keepalive);
        if ok != 0 {
            self.check(&obj.meta.fullname)?;
            return Err(Error::Refused {
                code: ok as i64,
                message: format!("{}: write refused", obj.meta.fullname),
            });
        }
        Ok(())
    }

    fn cb_arm(&self, spec: &CbSpec, cookie: u64) -> Result<SimPtr> {
        let mut storage = Box::new(CbStorage {
            data: vhpiCbDataT {
                reason: 0,
                cb_rtn: Some(vhpi_dispatch),
                obj: std::ptr::null_mut(),
                time: std::ptr::null_mut(),
                value: std::ptr::null_mut(),
                user_data: cookie as usize as *mut c_void,
            },
            time: vhpiTimeT { high: 0, low: 0 },
        });
        match spec.kind {
            CbKind::Timed => {
                storage.data.reason = VHPI_CB_AFTER_DELAY;
                storage.time = vhpiTimeT {
                    high: (spec.steps >> 32) as u32,
                    low: spec.steps as u32,
                };
                storage.data.time = &mut storage.time;
            }
            CbKind::NextStep => storage.data.reason = VHPI_CB_NEXT_TIME_STEP,
            CbKind::ReadWrite => storage.data.reason = VHPI_CB_LAST_KNOWN_DELTA_CYCLE,
            CbKind::ReadOnly => storage.data.reason = VHPI_CB_END_OF_TIME_STEP,
            CbKind::ValueChange => {
                storage.data.reason = VHPI_CB_VALUE_CHANGE;
                storage.data.obj = spec
                    .signal
                    .ok_or_else(|| {
                        Error::Internal("value-change arm with no signal".to_string())
                    })?
                    .0;
            }
        }
        let token = unsafe { (self.t.register_cb)(&mut storage.data, 0) };
        if token.is_null() {
            self.check("vhpi_register_cb")?;
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
        if !fired && !token.is_null() {
            let ok = unsafe { (self.t.remove_cb)(token.0) };
            if ok != 0 {
                return Err(Error::Refused {
                    code: ok as i64,
                    message: format!("{} callback removal refused", spec.kind.label()),
                });
            }
        }
        Ok(())
    }

    fn time(&self) -> (u32, u32) {
        let mut t = vhpiTimeT { high: 0, low: 0 };
        unsafe { (self.t.get_time)(&mut t, std::ptr::null_mut()) };
        (t.high, t.low)
    }

    fn precision(&self) -> i32 {
        self.sim_info().map(|i| i.precision).unwrap_or(-15)
    }

    fn stop(&self) -> Result<()> {
        unsafe { (self.t.control)(VHPI_FINISH) };
        self.check("vhpi_control(finish)")
    }

    fn release_object(&self, raw: SimPtr) {
        if !raw.is_null() {
            unsafe { (self.t.release_handle)(raw.0) };
        }
    }
}


extern "C" fn vhpi_dispatch(cb_data: *const vhpiCbDataT) {
    if cb_data.is_null() {
        return;
    }
    let cookie = unsafe { (*cb_data).user_data } as usize as u64;
    crate::facade::dispatch(cookie);
}

extern "C" fn vhpi_simulation_started(_cb_data: *const vhpiCbDataT) {
    crate::facade::simulation_started();
}

extern "C" fn vhpi_simulation_ended(_cb_data: *const vhpiCbDataT) {
    crate::facade::simulation_ended();
}


fn register_phase_callback(t: &VhpiTable, reason: vhpiIntT, rtn: VhpiCbFn) -> Result<()> {
    let mut data = vhpiCbDataT {
        reason,
        cb_rtn: Some(rtn),
        obj: std::ptr::null_mut(),
        time: std::ptr::null_mut(),
        value: std::ptr::null_mut(),
        user_data: std::ptr::null_mut(),
    };
    let token = unsafe { (t.register_cb)(&mut data, 0) };
    if token.is_null() {
        Err(Error::Refused {
            code: 0,
            message: format!("lifecycle callback {} refused", reason),
        })
    } else {
        Ok(())
    }
}

pub extern "C" fn vhpi_entry() {
    crate::logging::install();
    let backend = match VhpiBackend::probe() {
        Ok(b) => b,
        Err(e) => {
            log::debug!("vhpi not provided by this simulator: {}", e);
            return;
        }
    };
    let t = backend.t;
    if let Err(e) =
        register_phase_callback(&t, VHPI_CB_START_OF_SIMULATION, vhpi_simulation_started)
    {
        e.report("vhpi startup");
        return;
    }
    if let Err(e) =
        register_phase_callback(&t, VHPI_CB_END_OF_SIMULATION, vhpi_simulation_ended)
    {
        e.report("vhpi startup");
    }
    crate::facade::with(|g| g.register_backend(Box::new(backend)));
}

#[no_mangle]
pub static vhpi_startup_routines: [Option<extern "C" fn()>; 2] = [Some(vhpi_entry), None];


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_logic_ordinals() {
        // Declaration order of the std_logic literals.
        assert_eq!(ordinal_of(Bit::U), 0);
        assert_eq!(ordinal_of(Bit::X), 1);
        assert_eq!(ordinal_of(Bit::Zero), 2);
        assert_eq!(ordinal_of(Bit::One), 3);
        assert_eq!(ordinal_of(Bit::Z), 4);
        assert_eq!(ordinal_of(Bit::W), 5);
        assert_eq!(ordinal_of(Bit::L), 6);
        assert_eq!(ordinal_of(Bit::H), 7);
        assert_eq!(ordinal_of(Bit::DontCare), 8);
    }

    #[test]
    fn startup_table_is_null_terminated() {
        assert!(vhpi_startup_routines[0].is_some());
        assert!(vhpi_startup_routines[1].is_none());
    }
}
