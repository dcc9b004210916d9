//! Process-wide cache of compiled kernels.
//!
//! Entries are keyed by (device context, element type, kernel variant) and
//! live for the rest of the process. Devices that share a context share the
//! compiled kernels. The cache is consulted on every launch and written only
//! on the first use of a key, so a single mutex is enough; it is held while
//! compiling so two devices racing on the same key compile once.

use crate::device::ContextId;
use crate::error::{Result, SpmvError};
use crate::kernels::KernelVariant;
use crate::traits::Real;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub context: ContextId,
    pub type_name: &'static str,
    pub variant: KernelVariant,
}

impl KernelKey {
    pub fn new<T: Real>(context: ContextId, variant: KernelVariant) -> Self {
        Self {
            context,
            type_name: T::TYPE_NAME,
            variant,
        }
    }
}

/// A compiled kernel and the group size it prefers on its device.
#[derive(Debug)]
pub struct KernelCacheEntry<K> {
    pub kernel: K,
    pub group_size: usize,
}

type Entries = HashMap<KernelKey, Arc<dyn Any + Send + Sync>>;

static KERNELS: OnceLock<Mutex<Entries>> = OnceLock::new();

fn kernels() -> &'static Mutex<Entries> {
    KERNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the cached kernel for `key`, compiling it with `compile` on first use.
pub fn get_or_compile<K, F>(key: KernelKey, compile: F) -> Result<Arc<KernelCacheEntry<K>>>
where
    K: Send + Sync + 'static,
    F: FnOnce() -> Result<KernelCacheEntry<K>>,
{
    let mut map = kernels().lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(entry) = map.get(&key) {
        return Arc::clone(entry)
            .downcast::<KernelCacheEntry<K>>()
            .map_err(|_| SpmvError::Internal(format!("kernel cache type mismatch for {:?}", key)));
    }

    log::debug!(
        "compiling kernel {} for {} on context {:?}",
        key.variant.name(),
        key.type_name,
        key.context
    );
    let entry = Arc::new(compile()?);
    map.insert(key, entry.clone() as Arc<dyn Any + Send + Sync>);
    Ok(entry)
}

/// Whether a kernel for `key` has been compiled.
pub fn contains(key: &KernelKey) -> bool {
    kernels()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(key)
}
