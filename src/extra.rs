// Extra-library loading, run once before the design elaborates.
//
// Users list additional shared libraries in SIMBRIDGE_EXTRA_LIBS as a
// comma-separated sequence of `library[:entry]` elements; each library
// is opened and its entry function (default `simbridge_entry`) invoked
// with no arguments, in list order. A failure aborts startup unless
// the element was marked optional with a leading `?`. Commas cannot
// appear in library paths; rely on the dynamic linker search path
// instead of exotic locations.

use regex::Regex;

use crate::error::{Error, Result};
use crate::loader::SharedLib;

pub const ENV_EXTRA_LIBS: &str = "SIMBRIDGE_EXTRA_LIBS";
pub const DEFAULT_ENTRY: &str = "simbridge_entry";


#[derive(Clone, Debug, PartialEq)]
pub struct ExtraLib {
    pub library: String,
    pub entry: String,
    pub optional: bool,
}


// Split one element into library and entry. The suffix after the last
// colon only counts as an entry name when it looks like one; this
// keeps drive-letter-free but colon-bearing paths usable.
fn parse_element(element: &str) -> Option<ExtraLib> {
    lazy_static! {
        static ref ENTRY: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    }
    let element = element.trim();
    if element.is_empty() {
        return None;
    }
    let (optional, element) = match element.strip_prefix('?') {
        Some(rest) => (true, rest),
        None => (false, element),
    };
    let (library, entry) = match element.rfind(':') {
        Some(at) if ENTRY.is_match(&element[at + 1..]) => {
            (&element[..at], element[at + 1..].to_string())
        }
        _ => (element, DEFAULT_ENTRY.to_string()),
    };
    Some(ExtraLib {
        library: library.to_string(),
        entry,
        optional,
    })
}

pub fn parse_list(spec: &str) -> Vec<ExtraLib> {
    spec.split(',').filter_map(parse_element).collect()
}


fn load_one(item: &ExtraLib) -> Result<SharedLib> {
    let lib = SharedLib::open(&item.library)?;
    let entry: extern "C" fn() = unsafe {
        let mut symbol = item.entry.clone().into_bytes();
        symbol.push(0);
        lib.resolve(&symbol)?
    };
    log::debug!("invoking {}:{}", item.library, item.entry);
    entry();
    Ok(lib)
}

// Load and invoke every configured element, in order. The returned
// libraries must be kept alive for the rest of the simulation; the
// embedding layer owns them.
pub fn load_list(spec: &str) -> Result<Vec<SharedLib>> {
    let mut held = Vec::new();
    for item in parse_list(spec) {
        match load_one(&item) {
            Ok(lib) => held.push(lib),
            Err(e) if item.optional => {
                log::warn!("optional library {} skipped: {}", item.library, e)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(held)
}

pub fn load_from_env() -> Result<Vec<SharedLib>> {
    match std::env::var(ENV_EXTRA_LIBS) {
        Ok(spec) => load_list(&spec),
        Err(_) => Ok(Vec::new()),
    }
}
