//! C layout tables handed to hosted modules.
//!
//! A hosted module never sees engine types. It receives plain `#[repr(C)]`
//! structs holding an opaque pointer and `extern "C"` functions operating on
//! it, so a module compiled separately (and linked against any version of the
//! guest API with the same layout) can call back into the engine.

use crate::{
    comm::Communicator,
    namemap::{Array, NameMap, NameMapError, Value},
    procmap::ProcessMap,
};
use std::{
    cell::RefCell,
    ffi::{CStr, CString},
    os::raw::{c_char, c_int, c_void},
    ptr,
    rc::Rc,
};
use tracing::{error, warn};

/// How hosted code gives control back to the engine.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TransferBlock {
    pub state: *const c_void,
    pub transfer: unsafe extern "C" fn(*const c_void),
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcMapTable {
    pub map: *const c_void,
    /// communicators come back as [`Communicator::handle`] addresses
    pub local: unsafe extern "C" fn(*const c_void) -> *mut c_void,
    pub world: unsafe extern "C" fn(*const c_void) -> *mut c_void,
    /// null if the bridge could not be built
    pub intercomm: unsafe extern "C" fn(*const c_void, *const c_char) -> *mut c_void,
    pub group: unsafe extern "C" fn(*const c_void) -> *const c_char,
}

pub const LOAD_OK: c_int = 0;
pub const LOAD_MISSING: c_int = 1;
pub const LOAD_EMPTY_QUEUE: c_int = 2;
pub const LOAD_INVALID: c_int = 3;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NameMapTable {
    pub map: *const c_void,
    pub save: unsafe extern "C" fn(*const c_void, *const c_char, *const RawValue),
    /// one of the `LOAD_*` codes
    pub load: unsafe extern "C" fn(*const c_void, *const c_char, *mut RawValue) -> c_int,
    pub queue_empty: unsafe extern "C" fn(*const c_void, *const c_char) -> c_int,
    pub exists: unsafe extern "C" fn(*const c_void, *const c_char) -> c_int,
}

pub const KIND_INT: u8 = 0;
pub const KIND_SIZE_T: u8 = 1;
pub const KIND_FLOAT: u8 = 2;
pub const KIND_DOUBLE: u8 = 3;
pub const KIND_POINTER: u8 = 4;
pub const KIND_ARRAY: u8 = 5;

/// Flat C view of a [`Value`]; `kind` says which field is meaningful.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawValue {
    pub kind: u8,
    pub int: i32,
    pub size: usize,
    pub float: f32,
    pub double: f64,
    pub pointer: *mut c_void,
    pub type_size: usize,
    pub count: usize,
    pub stride: usize,
}

impl Default for RawValue {
    fn default() -> Self {
        Self {
            kind: KIND_INT,
            int: 0,
            size: 0,
            float: 0.0,
            double: 0.0,
            pointer: ptr::null_mut(),
            type_size: 0,
            count: 0,
            stride: 0,
        }
    }
}

impl From<&Value> for RawValue {
    fn from(value: &Value) -> Self {
        let mut raw = RawValue::default();
        match value {
            Value::Int(v) => raw.int = *v,
            Value::SizeT(v) => {
                raw.kind = KIND_SIZE_T;
                raw.size = *v;
            }
            Value::Float(v) => {
                raw.kind = KIND_FLOAT;
                raw.float = *v;
            }
            Value::Double(v) => {
                raw.kind = KIND_DOUBLE;
                raw.double = *v;
            }
            Value::Pointer(v) => {
                raw.kind = KIND_POINTER;
                raw.pointer = *v;
            }
            Value::Array(array) => {
                raw.kind = KIND_ARRAY;
                raw.pointer = array.address() as *mut c_void;
                raw.type_size = array.type_size();
                raw.count = array.count();
                raw.stride = array.stride();
            }
        }
        raw
    }
}

impl RawValue {
    /// Arrays come back as borrowed views of `pointer`.
    ///
    /// # Safety
    /// For arrays, `pointer` must stay valid for as long as the value is read.
    pub unsafe fn to_value(&self) -> Option<Value> {
        Some(match self.kind {
            KIND_INT => Value::Int(self.int),
            KIND_SIZE_T => Value::SizeT(self.size),
            KIND_FLOAT => Value::Float(self.float),
            KIND_DOUBLE => Value::Double(self.double),
            KIND_POINTER => Value::Pointer(self.pointer),
            KIND_ARRAY => Value::Array(Array::borrowed(
                self.pointer as *const u8,
                self.type_size,
                self.count,
                self.stride,
            )),
            _ => return None,
        })
    }
}

unsafe fn name_arg<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    match CStr::from_ptr(name).to_str() {
        Ok(name) => Some(name),
        Err(error) => {
            error!(error = ?error, "Name passed by hosted code is not UTF-8");
            None
        }
    }
}

/// What the process-map table's opaque pointer refers to.
pub(crate) struct ProcMapBinding<C> {
    pub procmap: Rc<ProcessMap<C>>,
    pub group: CString,
}

impl<C: Communicator> ProcMapBinding<C> {
    pub fn new(procmap: Rc<ProcessMap<C>>) -> Self {
        let group = CString::new(procmap.group()).unwrap_or_default();
        Self { procmap, group }
    }

    pub fn table(&self) -> ProcMapTable {
        ProcMapTable {
            map: self as *const Self as *const c_void,
            local: procmap_local::<C>,
            world: procmap_world::<C>,
            intercomm: procmap_intercomm::<C>,
            group: procmap_group::<C>,
        }
    }
}

unsafe extern "C" fn procmap_local<C: Communicator>(map: *const c_void) -> *mut c_void {
    let binding = &*(map as *const ProcMapBinding<C>);
    binding.procmap.local().handle()
}

unsafe extern "C" fn procmap_world<C: Communicator>(map: *const c_void) -> *mut c_void {
    let binding = &*(map as *const ProcMapBinding<C>);
    binding.procmap.world().handle()
}

unsafe extern "C" fn procmap_intercomm<C: Communicator>(map: *const c_void, name: *const c_char) -> *mut c_void {
    let binding = &*(map as *const ProcMapBinding<C>);
    let Some(name) = name_arg(name) else {
        return ptr::null_mut();
    };

    match binding.procmap.intercomm(name) {
        // the cache keeps the communicator alive as long as the process map
        Ok(comm) => comm.handle(),
        Err(error) => {
            error!(error = ?error, "Hosted code asked for an intercommunicator to {name}");
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn procmap_group<C: Communicator>(map: *const c_void) -> *const c_char {
    let binding = &*(map as *const ProcMapBinding<C>);
    binding.group.as_ptr()
}

pub(crate) fn namemap_table(map: &Rc<RefCell<NameMap>>) -> NameMapTable {
    NameMapTable {
        map: Rc::as_ptr(map) as *const c_void,
        save: namemap_save,
        load: namemap_load,
        queue_empty: namemap_queue_empty,
        exists: namemap_exists,
    }
}

unsafe fn namemap_arg<'a>(map: *const c_void) -> &'a RefCell<NameMap> {
    &*(map as *const RefCell<NameMap>)
}

unsafe extern "C" fn namemap_save(map: *const c_void, name: *const c_char, value: *const RawValue) {
    let Some(name) = name_arg(name) else { return };
    if value.is_null() {
        warn!("Null value saved under {name}");
        return;
    }

    match (*value).to_value() {
        Some(value) => namemap_arg(map).borrow_mut().add(name, value),
        None => error!(kind = (*value).kind, "Unknown value kind saved under {name}"),
    }
}

unsafe extern "C" fn namemap_load(map: *const c_void, name: *const c_char, out: *mut RawValue) -> c_int {
    let Some(name) = name_arg(name) else {
        return LOAD_INVALID;
    };
    if out.is_null() {
        return LOAD_INVALID;
    }

    match namemap_arg(map).borrow_mut().take_retained(name) {
        Ok(value) => {
            *out = RawValue::from(&value);
            LOAD_OK
        }
        Err(NameMapError::Missing(_)) => LOAD_MISSING,
        Err(NameMapError::EmptyQueue(_)) => LOAD_EMPTY_QUEUE,
        Err(error) => {
            error!(error = ?error, "Load of {name} failed");
            LOAD_INVALID
        }
    }
}

unsafe extern "C" fn namemap_queue_empty(map: *const c_void, name: *const c_char) -> c_int {
    match name_arg(name) {
        Some(name) => namemap_arg(map).borrow().queue_empty(name) as c_int,
        None => 1,
    }
}

unsafe extern "C" fn namemap_exists(map: *const c_void, name: *const c_char) -> c_int {
    match name_arg(name) {
        Some(name) => namemap_arg(map).borrow().exists(name) as c_int,
        None => 0,
    }
}
