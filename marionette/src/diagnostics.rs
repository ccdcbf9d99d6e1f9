//! Which puppet each rank thread is running, for crash reports.
//!
//! Purely a debugging aid: nothing in the engine reads it back.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    panic,
    sync::Once,
    thread::{self, ThreadId},
};
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub puppet: String,
    pub group: String,
}

static ACTIVE: Lazy<Mutex<HashMap<ThreadId, Record>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static HOOK: Once = Once::new();

pub fn set_active(puppet: &str, group: &str) {
    ACTIVE.lock().insert(
        thread::current().id(),
        Record {
            puppet: puppet.to_string(),
            group: group.to_string(),
        },
    );
}

pub fn clear_active() {
    ACTIVE.lock().remove(&thread::current().id());
}

pub fn active() -> Option<Record> {
    ACTIVE.lock().get(&thread::current().id()).cloned()
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname for crash report");
            "<unknown host>".to_string()
        }
    }
}

/// Chain a hook in front of the current panic hook that reports host,
/// thread and the puppet that was running on it.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let current = thread::current();
            let thread = current.name().unwrap_or("<unnamed>");
            // try_lock: the panic may come from inside a locked section
            let record = ACTIVE
                .try_lock()
                .and_then(|active| active.get(&current.id()).cloned());

            match record {
                Some(record) => error!(
                    host = hostname(),
                    thread,
                    puppet = record.puppet,
                    group = record.group,
                    "Panic while running a puppet"
                ),
                None => error!(host = hostname(), thread, "Panic outside of any puppet"),
            }

            previous(info);
        }));
    });
}
