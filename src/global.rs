//! Optional process-wide store for embedded callers.
//!
//! Firmware that cannot thread a [`Store`] handle through its call graph
//! installs one here once at boot and reaches it through [`with_store`].
//! The spinlock is uncontended by construction (the engine is single
//! caller by contract); it only guards against accidental reentry.

use alloc::boxed::Box;

use spin::{Mutex, Once};

use crate::error::{Error, Result};
use crate::port::NvmPort;
use crate::schema::{SchemaEntry, SchemaTable};
use crate::store::{InitStatus, Store};

type GlobalStore = Store<'static, Box<dyn NvmPort + Send>>;

static STORE: Once<Mutex<GlobalStore>> = Once::new();

/// Installs the process-wide store and mounts it. Fails with
/// `InvalidState` if one is already installed.
pub fn install(
    port: Box<dyn NvmPort + Send>,
    schema: &'static [SchemaEntry],
) -> Result<InitStatus> {
    if STORE.get().is_some() {
        return Err(Error::InvalidState);
    }
    let store = STORE.call_once(|| Mutex::new(Store::new(port, SchemaTable::new(schema))));
    store.lock().init()
}

/// Runs `f` against the installed store. `None` before [`install`].
pub fn with_store<R>(f: impl FnOnce(&mut GlobalStore) -> R) -> Option<R> {
    STORE.get().map(|store| f(&mut store.lock()))
}

/// Whether [`install`] has run.
pub fn is_installed() -> bool {
    STORE.get().is_some()
}
