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

// The ModelSim FLI backend.
//
// FLI is the odd one out: discovery is by region and signal queries
// with slash-separated paths, and callbacks are processes. Every armed
// callback owns one simulator process; timed kinds schedule a wakeup
// on it, value-change kinds sensitize it to the signal, and the
// synch/postponed process priorities stand in for the read-write and
// read-only phases. Scheduled wakeups cannot be revoked, so a disarm
// drops the cookie from the armed set and a late wakeup finds nobody
// home and goes back to sleep.

#![allow(non_camel_case_types)]

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::sync::Mutex;

use crate::backend::{Backend, CursorState, Selector, SimulatorInfo, ValueStates};
use crate::callback::{CbKind, CbSpec};
use crate::error::{Error, Result};
use crate::loader::SharedLib;
use crate::naming::Convention;
use crate::object::{Object, ObjectKind, ObjectMeta, ObjectSeed, SimPtr};
use crate::value::{Bit, SetAction, Value};

pub type mtiRegionIdT = *mut c_void;
pub type mtiSignalIdT = *mut c_void;
pub type mtiTypeIdT = *mut c_void;
pub type mtiProcessIdT = *mut c_void;
pub type mtiInt32T = i32;

#[allow(dead_code)]
pub mod consts {
    use super::mtiInt32T;

    // mtiTypeKindT.
    pub const MTI_TYPE_SCALAR: mtiInt32T = 0;
    pub const MTI_TYPE_ARRAY: mtiInt32T = 1;
    pub const MTI_TYPE_RECORD: mtiInt32T = 2;
    pub const MTI_TYPE_ENUM: mtiInt32T = 3;
    pub const MTI_TYPE_INTEGER: mtiInt32T = 4;
    pub const MTI_TYPE_PHYSICAL: mtiInt32T = 5;
    pub const MTI_TYPE_REAL: mtiInt32T = 6;
    pub const MTI_TYPE_TIME: mtiInt32T = 9;

    // Process priorities.
    pub const MTI_PROC_NORMAL: mtiInt32T = 0;
    pub const MTI_PROC_IMMEDIATE: mtiInt32T = 1;
    pub const MTI_PROC_POSTPONED: mtiInt32T = 2;
    pub const MTI_PROC_SYNCH: mtiInt32T = 3;

    // Sensitization modes.
    pub const MTI_EVENT: mtiInt32T = 1;

    // Force modes.
    pub const MTI_FORCE_DEPOSIT: mtiInt32T = 1;
    pub const MTI_FORCE_FREEZE: mtiInt32T = 4;
}

use consts::*;

// std_logic literal order; FLI scalar values are ordinals into this.
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

fn bit_of(ordinal: i64) -> Bit {
    STD_LOGIC
        .get(ordinal.max(0) as usize)
        .copied()
        .unwrap_or(Bit::X)
}


pub type FliProcFn = extern "C" fn(*mut c_void);

#[derive(Copy, Clone)]
struct FliTable {
    find_region: unsafe extern "C" fn(*const c_char) -> mtiRegionIdT,
    find_signal: unsafe extern "C" fn(*const c_char) -> mtiSignalIdT,
    get_top_region: unsafe extern "C" fn() -> mtiRegionIdT,
    next_region: unsafe extern "C" fn(mtiRegionIdT) -> mtiRegionIdT,
    first_lower_region: unsafe extern "C" fn(mtiRegionIdT) -> mtiRegionIdT,
    first_signal: unsafe extern "C" fn(mtiRegionIdT) -> mtiSignalIdT,
    next_signal: unsafe extern "C" fn(mtiSignalIdT) -> mtiSignalIdT,
    get_region_name: unsafe extern "C" fn(mtiRegionIdT) -> *const c_char,
    get_region_full_name: unsafe extern "C" fn(mtiRegionIdT) -> *const c_char,
    get_signal_name: unsafe extern "C" fn(mtiSignalIdT) -> *const c_char,
    get_signal_region: unsafe extern "C" fn(mtiSignalIdT) -> mtiRegionIdT,
    get_signal_type: unsafe extern "C" fn(mtiSignalIdT) -> mtiTypeIdT,
    get_type_kind: unsafe extern "C" fn(mtiTypeIdT) -> mtiInt32T,
    get_array_element_type: unsafe extern "C" fn(mtiTypeIdT) -> mtiTypeIdT,
    tick_length: unsafe extern "C" fn(mtiTypeIdT) -> mtiInt32T,
    tick_left: unsafe extern "C" fn(mtiTypeIdT) -> mtiInt32T,
    tick_right: unsafe extern "C" fn(mtiTypeIdT) -> mtiInt32T,
    get_signal_value: unsafe extern "C" fn(mtiSignalIdT) -> mtiInt32T,
    get_array_signal_value:
        unsafe extern "C" fn(mtiSignalIdT, *mut c_void) -> *mut c_void,
    set_signal_value: unsafe extern "C" fn(mtiSignalIdT, mtiInt32T) -> mtiInt32T,
    force_signal: unsafe extern "C" fn(
        mtiSignalIdT,
        *mut c_char,
        mtiInt32T,
        mtiInt32T,
        mtiInt32T,
        mtiInt32T,
    ) -> mtiInt32T,
    release_signal: unsafe extern "C" fn(mtiSignalIdT) -> mtiInt32T,
    create_process_with_priority:
        unsafe extern "C" fn(*const c_char, FliProcFn, *mut c_void, mtiInt32T) -> mtiProcessIdT,
    schedule_wakeup: unsafe extern "C" fn(mtiProcessIdT, mtiInt32T) -> (),
    sensitize: unsafe extern "C" fn(mtiProcessIdT, mtiSignalIdT, mtiInt32T) -> (),
    desensitize: unsafe extern "C" fn(mtiProcessIdT) -> (),
    now: unsafe extern "C" fn() -> mtiInt32T,
    now_upper: unsafe extern "C" fn() -> mtiInt32T,
    get_resolution_limit: unsafe extern "C" fn() -> mtiInt32T,
    get_product_version: unsafe extern "C" fn() -> *const c_char,
    add_load_done_cb: unsafe extern "C" fn(FliProcFn, *mut c_void) -> (),
    add_quit_cb: unsafe extern "C" fn(FliProcFn, *mut c_void) -> (),
    quit: unsafe extern "C" fn() -> (),
}

impl FliTable {
    fn resolve(lib: &SharedLib) -> Result<FliTable> {
        unsafe {
            Ok(FliTable {
                find_region: lib.resolve(b"mti_FindRegion\0")?,
                find_signal: lib.resolve(b"mti_FindSignal\0")?,
                get_top_region: lib.resolve(b"mti_GetTopRegion\0")?,
                next_region: lib.resolve(b"mti_NextRegion\0")?,
                first_lower_region: lib.resolve(b"mti_FirstLowerRegion\0")?,
                first_signal: lib.resolve(b"mti_FirstSignal\0")?,
                next_signal: lib.resolve(b"mti_NextSignal\0")?,
                get_region_name: lib.resolve(b"mti_GetRegionName\0")?,
                get_region_full_name: lib.resolve(b"mti_GetRegionFullName\0")?,
                get_signal_name: lib.resolve(b"mti_GetSignalName\0")?,
                get_signal_region: lib.resolve(b"mti_GetSignalRegion\0")?,
                get_signal_type: lib.resolve(b"mti_GetSignalType\0")?,
                get_type_kind: lib.resolve(b"mti_GetTypeKind\0")?,
                get_array_element_type: lib.resolve(b"mti_GetArrayElementType\0")?,
                tick_length: lib.resolve(b"mti_TickLength\0")?,
                tick_left: lib.resolve(b"mti_TickLeft\0")?,
                tick_right: lib.resolve(b"mti_TickRight\0")?,
                get_signal_value: lib.resolve(b"mti_GetSignalValue\0")?,
                get_array_signal_value: lib.resolve(b"mti_GetArraySignalValue\0")?,
                set_signal_value: lib.resolve(b"mti_SetSignalValue\0")?,
                force_signal: lib.resolve(b"mti_ForceSignal\0")?,
                release_signal: lib.resolve(b"mti_ReleaseSignal\0")?,
                create_process_with_priority: lib
                    .resolve(b"mti_CreateProcessWithPriority\0")?,
                schedule_wakeup: lib.resolve(b"mti_ScheduleWakeup\0")?,
                sensitize: lib.resolve(b"mti_Sensitize\0")?,
                desensitize: lib.resolve(b"mti_Desensitize\0")?,
                now: lib.resolve(b"mti_Now\0")?,
                now_upper: lib.resolve(b"mti_NowUpper\0")?,
                get_resolution_limit: lib.resolve(b"mti_GetResolutionLimit\0")?,
                get_product_version: lib.resolve(b"mti_GetProductVersion\0")?,
                add_load_done_cb: lib.resolve(b"mti_AddLoadDoneCB\0")?,
                add_quit_cb: lib.resolve(b"mti_AddQuitCB\0")?,
                quit: lib.resolve(b"mti_Quit\0")?,
            })
        }
    }
}


lazy_static! {
    // Wakeups cannot be revoked, so disarm drops the cookie here and a
    // stale wakeup finds nothing to dispatch.
    static ref ARMED: Mutex<HashSet<u64>> = Mutex::new(HashSet::new());
}

fn armed_insert(cookie: u64) {
    if let Ok(mut g) = ARMED.lock() {
        g.insert(cookie);
    }
}

fn armed_remove(cookie: u64) -> bool {
    match ARMED.lock() {
        Ok(mut g) => g.remove(&cookie),
        Err(_) => false,
    }
}

fn armed_contains(cookie: u64) -> bool {
    match ARMED.lock() {
        Ok(g) => g.contains(&cookie),
        Err(_) => false,
    }
}


pub struct FliBackend {
    #[allow(dead_code)]
    lib: SharedLib,
    t: FliTable,
}

// Either side of the region/signal split, as one raw pointer plus the
// knowledge of which query family it answers to.
impl FliBackend {
    pub fn probe() -> Result<FliBackend> {
        let lib = SharedLib::current()?;
        let t = FliTable::resolve(&lib)?;
        Ok(FliBackend { lib, t })
    }

    fn text(&self, p: *const c_char) -> String {
        if p.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned()
        }
    }

    fn classify_type(&self, ty: mtiTypeIdT) -> ObjectKind {
        match unsafe { (self.t.get_type_kind)(ty) } {
            MTI_TYPE_ENUM => {
                // std_logic and bit are enumerations too; literal
                // count tells them apart from user enums.
                match unsafe { (self.t.tick_length)(ty) } {
                    2 | 9 => ObjectKind::Logic,
                    _ => ObjectKind::Enum,
                }
            }
            MTI_TYPE_ARRAY => {
                let elem = unsafe { (self.t.get_array_element_type)(ty) };
                if elem.is_null() {
                    return ObjectKind::Array;
                }
                match self.classify_type(elem) {
                    ObjectKind::Logic => ObjectKind::LogicVector,
                    _ => ObjectKind::Array,
                }
            }
            MTI_TYPE_RECORD => ObjectKind::Scope,
            MTI_TYPE_SCALAR | MTI_TYPE_INTEGER | MTI_TYPE_PHYSICAL | MTI_TYPE_TIME => {
                ObjectKind::Integer
            }
            MTI_TYPE_REAL => ObjectKind::Real,
            code => {
                log::debug!("unmapped fli type kind {}; treating as unknown", code);
                ObjectKind::Unknown
            }
        }
    }

    fn region_seed(&self, region: mtiRegionIdT) -> ObjectSeed {
        ObjectSeed {
            raw: SimPtr(region),
            meta: ObjectMeta::scope(
                self.text(unsafe { (self.t.get_region_name)(region) }),
                self.text(unsafe { (self.t.get_region_full_name)(region) }),
            ),
        }
    }

    fn signal_seed(&self, signal: mtiSignalIdT) -> ObjectSeed {
        let ty = unsafe { (self.t.get_signal_type)(signal) };
        let kind = self.classify_type(ty);
        let name = self.text(unsafe { (self.t.get_signal_name)(signal) });
        let region = unsafe { (self.t.get_signal_region)(signal) };
        let region_full = self.text(unsafe { (self.t.get_region_full_name)(region) });
        let fullname = Convention::Slash.join(Some(&region_full), &name);
        let (length, range) = if kind.is_indexable() {
            let len = unsafe { (self.t.tick_length)(ty) }.max(0) as u32;
            let l = unsafe { (self.t.tick_left)(ty) } as i64;
            let r = unsafe { (self.t.tick_right)(ty) } as i64;
            if (l - r).abs() + 1 == len as i64 {
                (Some(len), Some((l, r)))
            } else {
                (Some(len), None)
            }
        } else {
            (None, None)
        };
        ObjectSeed {
            raw: SimPtr(signal),
            meta: ObjectMeta {
                kind,
                name,
                fullname,
                length,
                range,
                is_const: false,
            },
        }
    }

    fn signal_bits(&self, obj: &Object) -> Result<Vec<Bit>> {
        match obj.meta.length {
            // Scalars answer directly.
            None | Some(1) => {
                let v = unsafe { (self.t.get_signal_value)(obj.raw.0) };
                Ok(vec![bit_of(v as i64)])
            }
            Some(n) => {
                let mut buffer = vec![0u8; n as usize];
                unsafe {
                    (self.t.get_array_signal_value)(
                        obj.raw.0,
                        buffer.as_mut_ptr() as *mut c_void,
                    )
                };
                Ok(buffer.iter().map(|b| bit_of(*b as i64)).collect())
            }
        }
    }
}


impl Backend for FliBackend {
    fn name(&self) -> &'static str {
        "fli"
    }

    fn convention(&self) -> Convention {
        Convention::Slash
    }

    fn states(&self) -> ValueStates {
        ValueStates::Nine
    }

    fn sim_info(&self) -> Result<SimulatorInfo> {
        let version = self.text(unsafe { (self.t.get_product_version)() });
        Ok(SimulatorInfo {
            product: "ModelSim".to_string(),
            version,
            precision: unsafe { (self.t.get_resolution_limit)() },
        })
    }

    fn root(&self, name: Option<&str>) -> Result<Option<ObjectSeed>> {
        let mut region = unsafe { (self.t.get_top_region)() };
        while !region.is_null() {
            let seed = self.region_seed(region);
            match name {
                None => return Ok(Some(seed)),
                Some(wanted) if wanted.eq_ignore_ascii_case(&seed.meta.name) => {
                    return Ok(Some(seed))
                }
                Some(_) => region = unsafe { (self.t.next_region)(region) },
            }
        }
        Ok(None)
    }

    fn child_by_name(&self, parent: &Object, name: &str) -> Result<Option<ObjectSeed>> {
        let path = Convention::Slash.join(Some(&parent.meta.fullname), name);
        let c_path =
            CString::new(path.clone()).map_err(|_| Error::NotFound(name.to_string()))?;
        let signal = unsafe { (self.t.find_signal)(c_path.as_ptr()) };
        if !signal.is_null() {
            return Ok(Some(self.signal_seed(signal)));
        }
        let region = unsafe { (self.t.find_region)(c_path.as_ptr()) };
        if !region.is_null() {
            return Ok(Some(self.region_seed(region)));
        }
        Ok(None)
    }

    fn child_by_position(&self, parent: &Object, position: u32) -> Result<Option<ObjectSeed>> {
        let index = parent.meta.index_at(position);
        let path = Convention::Slash.index(&parent.meta.fullname, index);
        let c_path = CString::new(path).map_err(|_| Error::InvalidIndex(index))?;
        let signal = unsafe { (self.t.find_signal)(c_path.as_ptr()) };
        if signal.is_null() {
            Ok(None)
        } else {
            Ok(Some(self.signal_seed(signal)))
        }
    }

    fn iterate(&self, parent: &Object, selector: Selector) -> Result<CursorState> {
        let mut items = Vec::new();
        let want_regions = matches!(selector, Selector::Children | Selector::Instances);
        let want_signals = matches!(selector, Selector::Children | Selector::Signals);
        if want_regions {
            let mut region = unsafe { (self.t.first_lower_region)(parent.raw.0) };
            while !region.is_null() {
                items.push(self.region_seed(region));
                region = unsafe { (self.t.next_region)(region) };
            }
        }
        if want_signals {
            let mut signal = unsafe { (self.t.first_signal)(parent.raw.0) };
            while !signal.is_null() {
                items.push(self.signal_seed(signal));
                signal = unsafe { (self.t.next_signal)(signal) };
            }
        }
        // Generics and packages have no signal-level query surface
        // here; those selectors yield the empty sequence.
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
        Ok(crate::value::render_binstr(&self.signal_bits(obj)?))
    }

    fn read_long(&self, obj: &Object) -> Result<i64> {
        match obj.meta.kind {
            ObjectKind::Integer | ObjectKind::Enum | ObjectKind::Boolean => {
                Ok(unsafe { (self.t.get_signal_value)(obj.raw.0) } as i64)
            }
            _ => crate::value::binstr_to_long(&self.read_binstr(obj)?),
        }
    }

    fn read_real(&self, obj: &Object) -> Result<f64> {
        // Real signals travel through the array-value query as a raw
        // double.
        let mut buffer = 0f64;
        unsafe {
            (self.t.get_array_signal_value)(
                obj.raw.0,
                &mut buffer as *mut f64 as *mut c_void,
            )
        };
        Ok(buffer)
    }

    fn read_str(&self, obj: &Object) -> Result<String> {
        let n = obj.meta.length.unwrap_or(0) as usize;
        let mut buffer = vec![0u8; n + 1];
        unsafe {
            (self.t.get_array_signal_value)(obj.raw.0, buffer.as_mut_ptr() as *mut c_void)
        };
        let end = buffer.iter().position(|b| *b == 0).unwrap_or(n);
        Ok(String::from_utf8_lossy(&buffer[..end]).into_owned())
    }

    fn write(&self, obj: &Object, value: &Value, action: SetAction) -> Result<()> {
        if action == SetAction::Release {
            unsafe { (self.t.release_signal)(obj.raw.0) };
            return Ok(());
        }
        let text = match value {
            Value::BinStr(s) => {
                crate::value::parse_binstr(s)?;
                if s.len() == 1 {
                    s.clone()
                } else {
                    // The force syntax for vectors is a based literal.
                    format!("2#{}", s)
                }
            }
            Value::Integer(i) => format!("{}", i),
            Value::Real(r) => format!("{}", r),
            Value::Str(s) => format!("\"{}\"", s),
        };
        let mode = match action {
            SetAction::Force => MTI_FORCE_FREEZE,
            _ => MTI_FORCE_DEPOSIT,
        };
        let c_text = CString::new(text)
            .map_err(|_| Error::Internal("NUL in forced value".to_string()))?;
        let ok = unsafe {
            (self.t.force_signal)(
                obj.raw.0,
                c_text.as_ptr() as *mut c_char,
                0,
                mode,
                -1,
                -1,
            )
        };
        if ok == 0 {
            return Err(Error::Refused {
                code: 0,
                message: format!("{}: force refused", obj.meta.fullname),
            });
        }
        Ok(())
    }

    fn cb_arm(&self, spec: &CbSpec, cookie: u64) -> Result<SimPtr> {
        let priority = match spec.kind {
            CbKind::ReadWrite => MTI_PROC_SYNCH,
            CbKind::ReadOnly => MTI_PROC_POSTPONED,
            _ => MTI_PROC_NORMAL,
        };
        let name = CString::new(format!("simbridge_cb_{:x}", cookie))
            .map_err(|_| Error::Internal("process name".to_string()))?;
        let proc_ = unsafe {
            (self.t.create_process_with_priority)(
                name.as_ptr(),
                fli_dispatch,
                cookie as usize as *mut c_void,
                priority,
            )
        };
        if proc_.is_null() {
            return Err(Error::Refused {
                code: 0,
                message: format!("{} process refused", spec.kind.label()),
            });
        }
        match spec.kind {
            CbKind::ValueChange => {
                let signal = spec
                    .signal
                    .ok_or_else(|| {
                        Error::Internal("value-change arm with no signal".to_string())
                    })?
                    .0;
                unsafe { (self.t.sensitize)(proc_, signal, MTI_EVENT) };
            }
            CbKind::Timed => unsafe {
                (self.t.schedule_wakeup)(proc_, spec.steps as mtiInt32T)
            },
            // Next-step and the synch phases fire on a zero-delay
            // wakeup; the priority chose the phase.
            _ => unsafe { (self.t.schedule_wakeup)(proc_, 0) },
        }
        armed_insert(cookie);
        Ok(SimPtr(proc_))
    }

    fn cb_disarm(&self, spec: &CbSpec, token: SimPtr, cookie: u64, _fired: bool) -> Result<()> {
        // The cookie leaves the armed set either way; a pending wakeup
        // that cannot be revoked will find it gone and go back to
        // sleep.
        armed_remove(cookie);
        if spec.kind == CbKind::ValueChange && !token.is_null() {
            unsafe { (self.t.desensitize)(token.0) };
        }
        Ok(())
    }

    fn cb_rearm(&self, _spec: &CbSpec, token: SimPtr, cookie: u64) -> Result<SimPtr> {
        // Sensitized processes stay sensitized; just re-admit the
        // cookie.
        armed_insert(cookie);
        Ok(token)
    }

    fn time(&self) -> (u32, u32) {
        let lo = unsafe { (self.t.now)() } as u32;
        let hi = unsafe { (self.t.now_upper)() } as u32;
        (hi, lo)
    }

    fn precision(&self) -> i32 {
        unsafe { (self.t.get_resolution_limit)() }
    }

    fn stop(&self) -> Result<()> {
        unsafe { (self.t.quit)() };
        Ok(())
    }
}


// Process bodies: the cookie is the process parameter.
extern "C" fn fli_dispatch(param: *mut c_void) {
    let cookie = param as usize as u64;
    if !armed_contains(cookie) {
        // A wakeup that outlived its deregistration.
        return;
    }
    // One-shot kinds consume their arming; the facade re-inserts via
    // cb_rearm when the callback survives.
    armed_remove(cookie);
    crate::facade::dispatch(cookie);
}

extern "C" fn fli_simulation_started(_param: *mut c_void) {
    crate::facade::simulation_started();
}

extern "C" fn fli_simulation_ended(_param: *mut c_void) {
    crate::facade::simulation_ended();
}


// The design reaches us through a foreign architecture whose attribute
// names this entry point.
#[no_mangle]
pub extern "C" fn simbridge_fli_init(
    _region: mtiRegionIdT,
    _param: *mut c_char,
    _generics: *mut c_void,
    _ports: *mut c_void,
) {
    crate::logging::install();
    let backend = match FliBackend::probe() {
        Ok(b) => b,
        Err(e) => {
            log::debug!("fli not provided by this simulator: {}", e);
            return;
        }
    };
    let t = backend.t;
    unsafe {
        (t.add_load_done_cb)(fli_simulation_started, std::ptr::null_mut());
        (t.add_quit_cb)(fli_simulation_ended, std::ptr::null_mut());
    }
    crate::facade::with(|g| g.register_backend(Box::new(backend)));
}
