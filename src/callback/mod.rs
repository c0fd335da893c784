//! Host callbacks exposed to script by numeric id.
//!
//! A handle is registered either strong (kept until disposed) or weak (kept
//! while its target is alive). Weak handles whose target has gone are
//! disposed by [`CallbackRegistry::sweep`], which [`SweepTimer`] runs on a
//! fixed period.

mod sweep;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::marshal::ScriptValue;
use crate::pending::CommandBuffer;
use crate::store::SynchronizedStore;

pub use sweep::SweepTimer;

/// Host function callable from script.
pub type HostFunction = Arc<dyn Fn(&[ScriptValue]) -> ScriptValue + Send + Sync>;

type WeakInvoke = dyn Fn(&[ScriptValue]) -> Option<ScriptValue> + Send + Sync;

/// Whether script expects a value back from the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Value,
}

impl ReturnKind {
    pub fn expects_result(self) -> bool {
        self == Self::Value
    }
}

/// Answers whether a weakly held callback target is still reachable.
pub trait Liveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

impl<T: ?Sized + Send + Sync> Liveness for Weak<T> {
    fn is_alive(&self) -> bool {
        self.strong_count() > 0
    }
}

enum Target {
    Strong(HostFunction),
    /// Registered weak but with no target to track; always invocable.
    Static(HostFunction),
    Weak {
        invoke: Box<WeakInvoke>,
        liveness: Box<dyn Liveness>,
    },
}

pub struct CallbackHandle {
    id: u64,
    return_kind: ReturnKind,
    is_weak: bool,
    is_static_target: bool,
    disposed: AtomicBool,
    target: Mutex<Option<Arc<Target>>>,
    registry: Weak<CallbackRegistry>,
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("return_kind", &self.return_kind)
            .field("is_weak", &self.is_weak)
            .field("is_static_target", &self.is_static_target)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl CallbackHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn return_kind(&self) -> ReturnKind {
        self.return_kind
    }

    pub fn is_weak(&self) -> bool {
        self.is_weak
    }

    pub fn is_static_target(&self) -> bool {
        self.is_static_target
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// False once disposed, or once a weak target has been dropped.
    pub fn is_target_alive(&self) -> bool {
        let target = self.target.lock().clone();
        match target.as_deref() {
            None => false,
            Some(Target::Weak { liveness, .. }) => liveness.is_alive(),
            Some(Target::Strong(_)) | Some(Target::Static(_)) => true,
        }
    }

    /// Runs the callback. Returns `None` when disposed, when the target is
    /// gone, or when nothing is expected back.
    pub fn invoke(&self, args: &[ScriptValue]) -> Option<ScriptValue> {
        if self.is_disposed() {
            trace!(target: "callbacks", id = self.id, "invocation of disposed callback ignored");
            return None;
        }

        let target = self.target.lock().clone()?;
        let result = match target.as_ref() {
            Target::Strong(function) | Target::Static(function) => function(args),
            Target::Weak { invoke, .. } => match invoke(args) {
                Some(value) => value,
                None => {
                    debug!(target: "callbacks", id = self.id, "callback target collected, disposing");
                    self.dispose();
                    return None;
                }
            },
        };

        match self.return_kind {
            ReturnKind::Value => Some(result),
            ReturnKind::Void => None,
        }
    }

    /// Idempotent. Removes the registry entry and asks script to erase the
    /// matching closure.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.target.lock().take();
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.id);
        }
    }
}

/// Process-scoped table of every callback exposed to script.
pub struct CallbackRegistry {
    store: SynchronizedStore<Arc<CallbackHandle>>,
    commands: Arc<dyn CommandBuffer>,
    me: Weak<CallbackRegistry>,
}

impl CallbackRegistry {
    /// `commands` receives the fire-and-forget cleanup statement emitted when
    /// a handle is disposed.
    pub fn new(commands: Arc<dyn CommandBuffer>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            store: SynchronizedStore::new(),
            commands,
            me: me.clone(),
        })
    }

    fn register(
        &self,
        target: Target,
        return_kind: ReturnKind,
        is_weak: bool,
        is_static_target: bool,
    ) -> Arc<CallbackHandle> {
        let target = Arc::new(target);
        let (id, handle) = self.store.add_with(|id| {
            Arc::new(CallbackHandle {
                id,
                return_kind,
                is_weak,
                is_static_target,
                disposed: AtomicBool::new(false),
                target: Mutex::new(Some(Arc::clone(&target))),
                registry: self.me.clone(),
            })
        });
        trace!(target: "callbacks", id, is_weak, is_static_target, "callback registered");
        handle
    }

    /// Kept alive until disposed, whatever else holds the function.
    pub fn create_strong<F>(&self, function: F, return_kind: ReturnKind) -> Arc<CallbackHandle>
    where
        F: Fn(&[ScriptValue]) -> ScriptValue + Send + Sync + 'static,
    {
        self.register(Target::Strong(Arc::new(function)), return_kind, false, false)
    }

    /// Holds `target` weakly; `method` runs against it while it is alive.
    pub fn create_weak<T, F>(
        &self,
        target: &Arc<T>,
        method: F,
        return_kind: ReturnKind,
    ) -> Arc<CallbackHandle>
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &[ScriptValue]) -> ScriptValue + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(target);
        let liveness = weak.clone();
        let invoke = move |args: &[ScriptValue]| weak.upgrade().map(|target| method(&*target, args));
        self.register(
            Target::Weak {
                invoke: Box::new(invoke),
                liveness: Box::new(liveness),
            },
            return_kind,
            true,
            false,
        )
    }

    /// Weak registration of a function with no bound target. The sweep never
    /// collects it; it is invoked unconditionally until disposed.
    pub fn create_static<F>(&self, function: F, return_kind: ReturnKind) -> Arc<CallbackHandle>
    where
        F: Fn(&[ScriptValue]) -> ScriptValue + Send + Sync + 'static,
    {
        self.register(Target::Static(Arc::new(function)), return_kind, true, true)
    }

    /// Weak registration against the function itself: the handle lives as
    /// long as the caller keeps `function` alive.
    pub fn create_weak_function(
        &self,
        function: &HostFunction,
        return_kind: ReturnKind,
    ) -> Arc<CallbackHandle> {
        let weak = Arc::downgrade(function);
        let liveness = weak.clone();
        let invoke = move |args: &[ScriptValue]| weak.upgrade().map(|function| function(args));
        self.register(
            Target::Weak {
                invoke: Box::new(invoke),
                liveness: Box::new(liveness),
            },
            return_kind,
            true,
            false,
        )
    }

    /// Strong callback that disposes itself after its first invocation.
    pub fn create_self_disposing<F>(&self, action: F) -> Arc<CallbackHandle>
    where
        F: Fn(&[ScriptValue]) + Send + Sync + 'static,
    {
        let slot: Arc<OnceLock<Weak<CallbackHandle>>> = Arc::new(OnceLock::new());
        let own_handle = Arc::clone(&slot);
        let handle = self.create_strong(
            move |args| {
                action(args);
                if let Some(handle) = own_handle.get().and_then(Weak::upgrade) {
                    handle.dispose();
                }
                ScriptValue::Null
            },
            ReturnKind::Void,
        );
        let _ = slot.set(Arc::downgrade(&handle));
        handle
    }

    pub fn get(&self, id: u64) -> Option<Arc<CallbackHandle>> {
        self.store.get(id)
    }

    /// Script-side entry point. Unknown or disposed ids are a silent no-op.
    pub fn invoke(&self, id: u64, args: &[ScriptValue]) -> Option<ScriptValue> {
        match self.store.get(id) {
            Some(handle) => handle.invoke(args),
            None => {
                trace!(target: "callbacks", id, "invocation of unknown callback ignored");
                None
            }
        }
    }

    /// Disposes every weak, non-static handle whose target is gone.
    pub fn sweep(&self) -> usize {
        let collected = self.store.filter(|handle| {
            handle.is_weak()
                && !handle.is_static_target()
                && !handle.is_disposed()
                && !handle.is_target_alive()
        });

        for handle in &collected {
            handle.dispose();
        }

        if !collected.is_empty() {
            debug!(target: "callbacks", count = collected.len(), "swept collected callbacks");
        }
        collected.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn release(&self, id: u64) {
        self.store.remove(id);
        self.commands
            .submit(&format!("document.cleanupCallbackFunc({id})"));
    }
}
