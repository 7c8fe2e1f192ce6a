// The object handle model: a typed, named view of one thing the
// simulator knows about.
//
// Handles are created on discovery (root lookup, name lookup, index
// lookup, iteration), owned by the facade's arena, and released
// explicitly by the runtime. The backend that discovered an object is
// the only one that may ever touch its raw pointer again.

use std::ffi::c_void;
use std::ffi::CString;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{Error, Result};


// A raw pointer owned by a simulator. Only the originating backend
// dereferences it; everyone else treats it as a token. The bridge runs
// entirely on the simulator's thread, which is what makes carrying
// these around sound.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SimPtr(pub *mut c_void);

impl SimPtr {
    pub fn null() -> SimPtr {
        SimPtr(std::ptr::null_mut())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}


// The abstract type taxonomy. Every backend maps its native type codes
// onto exactly these kinds; codes it does not recognize become Unknown
// and are logged at debug level. The discriminants are the stable
// integers used across the C ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ObjectKind {
    // Module / entity / architecture / package instance.
    Scope = 1,
    // Indexable array of signals.
    Array = 2,
    // Logic or bit vector with declared bounds.
    LogicVector = 3,
    // Scalar logic or bit.
    Logic = 4,
    Integer = 5,
    Real = 6,
    Str = 7,
    Enum = 8,
    Boolean = 9,
    // Generate-loop instance; iterates as if an array of scopes.
    GenScope = 10,
    // Parameter / generic / constant. Always const.
    Parameter = 11,
    // Terminal; never iterated, never read.
    Unknown = 12,
}

impl ObjectKind {
    pub fn label(&self) -> &'static str {
        match self {
            ObjectKind::Scope => "scope",
            ObjectKind::Array => "array",
            ObjectKind::LogicVector => "logic vector",
            ObjectKind::Logic => "logic",
            ObjectKind::Integer => "integer",
            ObjectKind::Real => "real",
            ObjectKind::Str => "string",
            ObjectKind::Enum => "enum",
            ObjectKind::Boolean => "boolean",
            ObjectKind::GenScope => "generate scope",
            ObjectKind::Parameter => "parameter",
            ObjectKind::Unknown => "unknown",
        }
    }

    // Kinds whose value can be read (and, const-ness permitting,
    // written).
    pub fn is_signal(&self) -> bool {
        match self {
            ObjectKind::LogicVector
            | ObjectKind::Logic
            | ObjectKind::Integer
            | ObjectKind::Real
            | ObjectKind::Str
            | ObjectKind::Enum
            | ObjectKind::Boolean
            | ObjectKind::Parameter => true,
            _ => false,
        }
    }

    pub fn is_indexable(&self) -> bool {
        match self {
            ObjectKind::Array | ObjectKind::LogicVector | ObjectKind::GenScope => true,
            _ => false,
        }
    }

    pub fn is_scope(&self) -> bool {
        match self {
            ObjectKind::Scope | ObjectKind::GenScope => true,
            _ => false,
        }
    }
}


// Everything a backend learns about an object at discovery time.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectMeta {
    pub kind: ObjectKind,
    pub name: String,
    pub fullname: String,
    // Element count, for indexable kinds.
    pub length: Option<u32>,
    // Declared (left, right) bounds, when the interface reports them.
    pub range: Option<(i64, i64)>,
    pub is_const: bool,
}

impl ObjectMeta {
    pub fn scope(name: String, fullname: String) -> ObjectMeta {
        ObjectMeta {
            kind: ObjectKind::Scope,
            name,
            fullname,
            length: None,
            range: None,
            is_const: false,
        }
    }

    // Range consistency: an indexable object must know its length, and
    // when both bounds are declared the length must agree with them.
    pub fn validate(&self) -> Result<()> {
        if self.kind.is_indexable() && self.length.is_none() {
            return Err(Error::Internal(format!(
                "{} is indexable but has no length",
                self.fullname
            )));
        }
        if let (Some(len), Some((l, r))) = (self.length, self.range) {
            let expect = (l - r).abs() as u64 + 1;
            if len as u64 != expect {
                return Err(Error::Internal(format!(
                    "{}: length {} disagrees with range ({}, {})",
                    self.fullname, len, l, r
                )));
            }
        }
        Ok(())
    }

    // Map a caller index expressed in the declared range onto the
    // zero-based position backends iterate with. Out of range fails.
    pub fn position_of(&self, index: i64) -> Result<u32> {
        let (l, r) = match self.range {
            Some(lr) => lr,
            // Without declared bounds, indices are already positions.
            None => {
                let len = self.length.unwrap_or(0) as i64;
                if index < 0 || index >= len {
                    return Err(Error::InvalidIndex(index));
                }
                return Ok(index as u32);
            }
        };
        let (lo, hi) = if l <= r { (l, r) } else { (r, l) };
        if index < lo || index > hi {
            return Err(Error::InvalidIndex(index));
        }
        Ok(if l <= r {
            (index - l) as u32
        } else {
            (l - index) as u32
        })
    }

    // The inverse: the declared index sitting at a zero-based
    // position. Backends need declared indices to talk to the
    // simulator.
    pub fn index_at(&self, position: u32) -> i64 {
        match self.range {
            Some((l, r)) if l > r => l - position as i64,
            Some((l, _)) => l + position as i64,
            None => position as i64,
        }
    }
}


// What a backend hands the facade for each discovered object: the
// metadata plus the raw pointer the backend will want back.
#[derive(Clone, Debug)]
pub struct ObjectSeed {
    pub raw: SimPtr,
    pub meta: ObjectMeta,
}


// An arena-resident object. Owns the C-visible copies of its strings;
// pointers returned across the ABI stay valid until the next call on
// the same handle or its release.
pub struct Object {
    pub backend: usize,
    pub raw: SimPtr,
    pub meta: ObjectMeta,
    c_name: CString,
    c_fullname: CString,
    c_type: CString,
    c_value: Option<CString>,
}

impl Object {
    pub fn new(backend: usize, seed: ObjectSeed) -> Result<Object> {
        seed.meta.validate()?;
        let c_name = cstring_lossy(&seed.meta.name);
        let c_fullname = cstring_lossy(&seed.meta.fullname);
        let c_type = cstring_lossy(seed.meta.kind.label());
        Ok(Object {
            backend,
            raw: seed.raw,
            meta: seed.meta,
            c_name,
            c_fullname,
            c_type,
            c_value: None,
        })
    }

    pub fn name_ptr(&self) -> *const std::os::raw::c_char {
        self.c_name.as_ptr()
    }

    pub fn fullname_ptr(&self) -> *const std::os::raw::c_char {
        self.c_fullname.as_ptr()
    }

    pub fn type_ptr(&self) -> *const std::os::raw::c_char {
        self.c_type.as_ptr()
    }

    // Cache a freshly read value string and hand back its C pointer.
    pub fn stash_value(&mut self, value: &str) -> *const std::os::raw::c_char {
        self.c_value = Some(cstring_lossy(value));
        self.c_value.as_ref().unwrap().as_ptr()
    }

    pub fn require_signal(&self, op: &'static str) -> Result<()> {
        if self.meta.kind.is_signal() {
            Ok(())
        } else {
            Err(Error::WrongKind { op, kind: self.meta.kind.label() })
        }
    }

    pub fn require_indexable(&self, op: &'static str) -> Result<()> {
        if self.meta.kind.is_indexable() {
            Ok(())
        } else {
            Err(Error::WrongKind { op, kind: self.meta.kind.label() })
        }
    }
}


// Interior NULs cannot cross a C string boundary; mangling the name is
// better than refusing to show it at all.
fn cstring_lossy(s: &str) -> CString {
    CString::new(s).unwrap_or_else(|_| {
        CString::new(s.replace('\0', "?")).unwrap()
    })
}
