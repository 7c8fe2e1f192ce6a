// Thin wrapper over dynamic loading: open a library by name or path,
// or borrow the whole process image, and resolve typed symbols out of
// it. All failures carry the loader's own message so the log line is
// actionable.

use libloading::Library;

use crate::error::{Error, Result};


pub struct SharedLib {
    name: String,
    lib: Library,
}

impl SharedLib {
    pub fn open(spec: &str) -> Result<SharedLib> {
        // Loading foreign code is inherently unchecked; the element
        // came from configuration the user wrote.
        match unsafe { Library::new(spec) } {
            Ok(lib) => Ok(SharedLib { name: spec.to_string(), lib }),
            Err(e) => Err(Error::Load(format!("{}: {}", spec, e))),
        }
    }

    // The already-loaded process image. Simulators link or preload
    // their procedural interface into the process that hosts us, so
    // this is where vpi_/vhpi_/mti_ entry points live.
    #[cfg(unix)]
    pub fn current() -> Result<SharedLib> {
        Ok(SharedLib {
            name: "<process>".to_string(),
            lib: libloading::os::unix::Library::this().into(),
        })
    }

    #[cfg(windows)]
    pub fn current() -> Result<SharedLib> {
        match libloading::os::windows::Library::this() {
            Ok(lib) => Ok(SharedLib { name: "<process>".to_string(), lib: lib.into() }),
            Err(e) => Err(Error::Load(format!("<process>: {}", e))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // Resolve one symbol to a bare function pointer. The caller names
    // the type; nothing checks that the library agrees, which is the
    // nature of the boundary.
    pub unsafe fn resolve<T: Copy>(&self, symbol: &[u8]) -> Result<T> {
        match self.lib.get::<T>(symbol) {
            Ok(sym) => Ok(*sym),
            Err(e) => Err(Error::Load(format!(
                "{}: symbol {}: {}",
                self.name,
                String::from_utf8_lossy(symbol).trim_end_matches('\0'),
                e
            ))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_library_fails() {
        match SharedLib::open("libsimbridge-no-such-library.so") {
            Err(Error::Load(msg)) => {
                assert!(msg.contains("libsimbridge-no-such-library"))
            }
            other => panic!("expected load error, got {:?}", other.map(|l| l.name().to_string())),
        }
    }

    #[test]
    fn current_process_opens() {
        let lib = SharedLib::current().unwrap();
        assert_eq!(lib.name(), "<process>");
    }

    #[test]
    fn missing_symbol_fails() {
        let lib = SharedLib::current().unwrap();
        let r: Result<extern "C" fn()> =
            unsafe { lib.resolve(b"simbridge_no_such_symbol\0") };
        match r {
            Err(Error::Load(msg)) => assert!(msg.contains("simbridge_no_such_symbol")),
            Ok(_) => panic!("expected load error"),
            Err(e) => panic!("wrong error {:?}", e),
        }
    }
}
