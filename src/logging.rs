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

// The logging bridge.
//
// Everything in the crate logs through the standard `log` macros. The
// bridge installed here decides where those records land: when the
// hosted runtime has attached its filter and sink hooks, records are
// converted to C form and handed over; otherwise a compact one-line
// fallback goes to stderr. The bridge must work before embed-init and
// keep working after shutdown, so the hook table is consulted on every
// record and never assumed present.

use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

// Numeric levels as the hosted runtime sees them.
pub const LVL_TRACE: c_int = 5;
pub const LVL_DEBUG: c_int = 10;
pub const LVL_INFO: c_int = 20;
pub const LVL_WARNING: c_int = 30;
pub const LVL_ERROR: c_int = 40;
pub const LVL_CRITICAL: c_int = 50;


#[repr(C)]
pub struct LogRecord {
    pub name: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub message: *const c_char,
}

// Hook pair installed by the hosted runtime. The filter is consulted
// before the record is built in full; the sink owns presentation.
pub type FilterFn = extern "C" fn(name: *const c_char, level: c_int) -> c_int;
pub type SinkFn = extern "C" fn(record: *const LogRecord);

#[derive(Copy, Clone)]
pub struct SinkHooks {
    pub filter: Option<FilterFn>,
    pub sink: Option<SinkFn>,
}

lazy_static! {
    static ref HOOKS: Mutex<Option<SinkHooks>> = Mutex::new(None);
    static ref OVERRIDES: Mutex<Vec<(String, LevelFilter)>> = Mutex::new(Vec::new());
}

struct Bridge;
static BRIDGE: Bridge = Bridge;


// Install the bridge as the process logger. Idempotent; a second call
// (another backend's startup routine) is a no-op.
pub fn install() {
    if log::set_logger(&BRIDGE).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
    if let Ok(spec) = std::env::var("SIMBRIDGE_LOG_LEVEL") {
        set_overrides(parse_overrides(&spec));
    }
}

pub fn attach(hooks: SinkHooks) {
    if let Ok(mut g) = HOOKS.lock() {
        *g = Some(hooks);
    }
}

pub fn detach() {
    if let Ok(mut g) = HOOKS.lock() {
        *g = None;
    }
}

pub fn set_overrides(overrides: Vec<(String, LevelFilter)>) {
    if let Ok(mut g) = OVERRIDES.lock() {
        *g = overrides;
    }
}


pub fn level_to_int(level: Level) -> c_int {
    match level {
        Level::Trace => LVL_TRACE,
        Level::Debug => LVL_DEBUG,
        Level::Info => LVL_INFO,
        Level::Warn => LVL_WARNING,
        Level::Error => LVL_ERROR,
    }
}

fn filter_by_name(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_uppercase().as_str() {
        "TRACE" => Some(LevelFilter::Trace),
        "DEBUG" => Some(LevelFilter::Debug),
        "INFO" => Some(LevelFilter::Info),
        "WARN" | "WARNING" => Some(LevelFilter::Warn),
        "ERROR" | "CRITICAL" => Some(LevelFilter::Error),
        "OFF" | "NONE" => Some(LevelFilter::Off),
        _ => None,
    }
}

// A `name=LEVEL` list, comma separated. A bare LEVEL element sets the
// default for every logger. Unknown names are reported, not fatal.
pub fn parse_overrides(spec: &str) -> Vec<(String, LevelFilter)> {
    let mut out = Vec::new();
    for element in spec.split(',') {
        let element = element.trim();
        if element.is_empty() {
            continue;
        }
        let (name, level) = match element.find('=') {
            Some(at) => (&element[..at], &element[at + 1..]),
            None => ("", element),
        };
        match filter_by_name(level) {
            Some(f) => out.push((name.trim().to_string(), f)),
            None => eprintln!("simbridge: unknown log level {:?}", level),
        }
    }
    out
}

// Longest matching override prefix wins; otherwise Info.
fn effective_filter(target: &str) -> LevelFilter {
    let overrides = match OVERRIDES.lock() {
        Ok(g) => g,
        Err(_) => return LevelFilter::Info,
    };
    let mut best: Option<(usize, LevelFilter)> = None;
    for (name, filter) in overrides.iter() {
        let matches = name.is_empty() || target == name || target.starts_with(&format!("{}::", name));
        if matches {
            let len = name.len();
            if best.map(|(b, _)| len >= b).unwrap_or(true) {
                best = Some((len, *filter));
            }
        }
    }
    best.map(|(_, f)| f).unwrap_or(LevelFilter::Info)
}


// Interior NULs would truncate a C string; swap them out instead of
// dropping the record.
fn c_text(s: &str) -> CString {
    CString::new(s).unwrap_or_else(|_| CString::new(s.replace('\0', "?")).unwrap())
}

fn forward(hooks: SinkHooks, record: &Record) {
    let name = c_text(record.target());
    let level = level_to_int(record.level());
    if let Some(filter) = hooks.filter {
        if filter(name.as_ptr(), level) == 0 {
            return;
        }
    }
    let file = c_text(record.file().unwrap_or("<unknown>"));
    let message = c_text(&format!("{}", record.args()));
    let c_record = LogRecord {
        name: name.as_ptr(),
        level,
        file: file.as_ptr(),
        line: record.line().unwrap_or(0) as c_int,
        message: message.as_ptr(),
    };
    if let Some(sink) = hooks.sink {
        sink(&c_record);
    }
}

fn fallback(record: &Record) {
    eprintln!(
        "{:<5} {:<20} {}:{} {}",
        record.level(),
        record.target(),
        record.file().unwrap_or("?"),
        record.line().unwrap_or(0),
        record.args()
    );
}


impl Log for Bridge {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= effective_filter(metadata.target())
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let hooks = HOOKS.lock().ok().and_then(|g| *g);
        match hooks {
            Some(h) if h.sink.is_some() => forward(h, record),
            _ => fallback(record),
        }
    }

    fn flush(&self) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_global_level() {
        let o = parse_overrides("DEBUG");
        assert_eq!(o, vec![(String::new(), LevelFilter::Debug)]);
    }

    #[test]
    fn parse_named_levels() {
        let o = parse_overrides("simbridge::vpi=TRACE, simbridge=WARNING");
        assert_eq!(
            o,
            vec![
                ("simbridge::vpi".to_string(), LevelFilter::Trace),
                ("simbridge".to_string(), LevelFilter::Warn),
            ]
        );
    }

    #[test]
    fn parse_ignores_junk() {
        let o = parse_overrides("x=NOTALEVEL,,INFO");
        assert_eq!(o, vec![(String::new(), LevelFilter::Info)]);
    }

    #[test]
    fn level_numbers() {
        assert_eq!(level_to_int(Level::Debug), LVL_DEBUG);
        assert_eq!(level_to_int(Level::Error), LVL_ERROR);
    }

    #[test]
    fn override_prefix_matching() {
        set_overrides(vec![
            (String::new(), LevelFilter::Warn),
            ("simbridge::vpi".to_string(), LevelFilter::Trace),
        ]);
        assert_eq!(effective_filter("simbridge::vpi"), LevelFilter::Trace);
        assert_eq!(effective_filter("simbridge::vpi::raw"), LevelFilter::Trace);
        assert_eq!(effective_filter("simbridge::fli"), LevelFilter::Warn);
        set_overrides(Vec::new());
    }
}
