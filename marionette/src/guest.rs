//! The side a hosted program links against.
//!
//! The engine injects its tables through the `marionette_set_*` hooks before
//! every run; the functions here read them back. A program started on its own
//! never receives the tables and every call degrades gracefully: yielding
//! does nothing, stop is never requested and loads find nothing. The state is
//! per thread because each rank of the in-process backend is a thread.

use crate::{
    abi::{
        NameMapTable, ProcMapTable, RawValue, TransferBlock, KIND_ARRAY, KIND_DOUBLE, KIND_FLOAT, KIND_INT,
        KIND_POINTER, KIND_SIZE_T, LOAD_OK,
    },
    namemap::{Array, Value},
    puppet::module::{MainFn, ModuleHooks},
};
use std::{
    cell::Cell,
    ffi::{CStr, CString},
    os::raw::{c_int, c_void},
    ptr,
};
use tracing::{trace, warn};

#[derive(Clone, Copy)]
struct GuestState {
    transfer: *const TransferBlock,
    procmap: *const ProcMapTable,
    namemap: *const NameMapTable,
    stop: *const c_int,
}

thread_local! {
    static GUEST: Cell<GuestState> = const {
        Cell::new(GuestState {
            transfer: ptr::null(),
            procmap: ptr::null(),
            namemap: ptr::null(),
            stop: ptr::null(),
        })
    };
}

fn state() -> GuestState {
    GUEST.with(Cell::get)
}

fn update(change: impl FnOnce(&mut GuestState)) {
    GUEST.with(|cell| {
        let mut state = cell.get();
        change(&mut state);
        cell.set(state);
    });
}

pub unsafe extern "C" fn set_contexts(transfer: *const TransferBlock) {
    update(|state| state.transfer = transfer);
}

pub unsafe extern "C" fn set_procmap(procmap: *const ProcMapTable) {
    update(|state| state.procmap = procmap);
}

pub unsafe extern "C" fn set_namemap(namemap: *const NameMapTable) {
    update(|state| state.namemap = namemap);
}

pub unsafe extern "C" fn set_stop(stop: *const c_int) {
    update(|state| state.stop = stop);
}

/// Hooks of a unit compiled into the host image, for [`Module::from_hooks`](crate::puppet::Module::from_hooks).
pub fn module_hooks(main: MainFn) -> ModuleHooks {
    ModuleHooks {
        main,
        set_contexts,
        set_procmap,
        set_stop,
        set_namemap: Some(set_namemap),
    }
}

/// Export the hook symbols a shared library needs to be loaded as a puppet.
#[macro_export]
macro_rules! export_puppet_hooks {
    () => {
        #[no_mangle]
        pub unsafe extern "C" fn marionette_set_contexts(transfer: *const $crate::abi::TransferBlock) {
            $crate::guest::set_contexts(transfer)
        }

        #[no_mangle]
        pub unsafe extern "C" fn marionette_set_procmap(procmap: *const $crate::abi::ProcMapTable) {
            $crate::guest::set_procmap(procmap)
        }

        #[no_mangle]
        pub unsafe extern "C" fn marionette_set_namemap(namemap: *const $crate::abi::NameMapTable) {
            $crate::guest::set_namemap(namemap)
        }

        #[no_mangle]
        pub unsafe extern "C" fn marionette_set_stop(stop: *const ::std::os::raw::c_int) {
            $crate::guest::set_stop(stop)
        }
    };
}

pub fn is_engine_active() -> bool {
    !state().transfer.is_null()
}

/// Give control back to the engine; returns when the engine proceeds again.
pub fn yield_to_host() {
    let transfer = state().transfer;
    if transfer.is_null() {
        return;
    }

    unsafe {
        let block = *transfer;
        (block.transfer)(block.state);
    }
}

pub fn is_stop_requested() -> bool {
    let stop = state().stop;
    // the engine writes the flag while this side is suspended
    !stop.is_null() && unsafe { ptr::read_volatile(stop) } != 0
}

/// Opaque communicator handed out by the engine, the address of the
/// backend's native handle. A C program on the MPI backend reads it as
/// `*(MPI_Comm *) handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommHandle(*mut c_void);

impl CommHandle {
    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }

    /// # Safety
    /// The hosting engine must run the in-process backend with `C` as its
    /// communicator type, and the reference must not outlive the process map
    /// it came from.
    pub unsafe fn as_comm<'a, C>(&self) -> &'a C {
        &*(self.0 as *const C)
    }

    /// # Safety
    /// The hosting engine must run the MPI backend.
    #[cfg(feature = "mpi")]
    pub unsafe fn as_mpi(&self) -> mpi::ffi::MPI_Comm {
        *(self.0 as *const mpi::ffi::MPI_Comm)
    }
}

fn procmap() -> Option<ProcMapTable> {
    let table = state().procmap;
    (!table.is_null()).then(|| unsafe { *table })
}

fn namemap() -> Option<NameMapTable> {
    let table = state().namemap;
    (!table.is_null()).then(|| unsafe { *table })
}

fn c_name(name: &str) -> Option<CString> {
    match CString::new(name) {
        Ok(name) => Some(name),
        Err(_) => {
            warn!("Name {name:?} contains a NUL byte");
            None
        }
    }
}

/// communicator of this rank's group
pub fn local_world() -> Option<CommHandle> {
    let table = procmap()?;
    Some(CommHandle(unsafe { (table.local)(table.map) }))
}

pub fn world() -> Option<CommHandle> {
    let table = procmap()?;
    Some(CommHandle(unsafe { (table.world)(table.map) }))
}

/// Bridge to group `to`; collective over both groups on the first call.
pub fn intercomm(to: &str) -> Option<CommHandle> {
    let table = procmap()?;
    let name = c_name(to)?;
    let comm = unsafe { (table.intercomm)(table.map, name.as_ptr()) };

    (!comm.is_null()).then_some(CommHandle(comm))
}

pub fn group() -> Option<String> {
    let table = procmap()?;
    let name = unsafe { CStr::from_ptr((table.group)(table.map)) };

    Some(name.to_string_lossy().into_owned())
}

fn save(name: &str, value: &Value) {
    let Some(table) = namemap() else { return };
    let Some(name) = c_name(name) else { return };

    let raw = RawValue::from(value);
    unsafe { (table.save)(table.map, name.as_ptr(), &raw) };
}

pub fn save_int(name: &str, value: i32) {
    save(name, &Value::Int(value));
}

pub fn save_size_t(name: &str, value: usize) {
    save(name, &Value::SizeT(value));
}

pub fn save_float(name: &str, value: f32) {
    save(name, &Value::Float(value));
}

pub fn save_double(name: &str, value: f64) {
    save(name, &Value::Double(value));
}

pub fn save_pointer(name: &str, value: *mut c_void) {
    save(name, &Value::Pointer(value));
}

/// Saves a view of `values`, not a copy: they have to stay put until read.
pub fn save_array<T: Copy>(name: &str, values: &[T]) {
    save(name, &Value::Array(Array::from_slice(values)));
}

/// strided variant of [`save_array`]
pub fn save_array_raw(name: &str, address: *const u8, type_size: usize, count: usize, stride: usize) {
    save(name, &Value::Array(Array::borrowed(address, type_size, count, stride)));
}

fn load(name: &str, kind: u8) -> Option<RawValue> {
    let table = namemap()?;
    let c_name = c_name(name)?;

    let mut raw = RawValue::default();
    let code = unsafe { (table.load)(table.map, c_name.as_ptr(), &mut raw) };
    if code != LOAD_OK {
        trace!(code, "Nothing to load under {name}");
        return None;
    }
    if raw.kind != kind {
        warn!(expected = kind, found = raw.kind, "Value under {name} has another type");
        return None;
    }

    Some(raw)
}

pub fn load_int(name: &str) -> Option<i32> {
    load(name, KIND_INT).map(|raw| raw.int)
}

pub fn load_size_t(name: &str) -> Option<usize> {
    load(name, KIND_SIZE_T).map(|raw| raw.size)
}

pub fn load_float(name: &str) -> Option<f32> {
    load(name, KIND_FLOAT).map(|raw| raw.float)
}

pub fn load_double(name: &str) -> Option<f64> {
    load(name, KIND_DOUBLE).map(|raw| raw.double)
}

pub fn load_pointer(name: &str) -> Option<*mut c_void> {
    load(name, KIND_POINTER).map(|raw| raw.pointer)
}

/// View of a stored array; valid until the next load of `name` for queued
/// values, and for as long as the saving side keeps the memory otherwise.
pub fn load_array(name: &str) -> Option<Array> {
    load(name, KIND_ARRAY)
        .map(|raw| Array::borrowed(raw.pointer as *const u8, raw.type_size, raw.count, raw.stride))
}

pub fn queue_empty(name: &str) -> bool {
    let (Some(table), Some(name)) = (namemap(), c_name(name)) else {
        return true;
    };

    unsafe { (table.queue_empty)(table.map, name.as_ptr()) != 0 }
}

pub fn exists(name: &str) -> bool {
    let (Some(table), Some(name)) = (namemap(), c_name(name)) else {
        return false;
    };

    unsafe { (table.exists)(table.map, name.as_ptr()) != 0 }
}
