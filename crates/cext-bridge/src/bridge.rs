//! The bridge context object.
//!
//! A [`Bridge`] owns one GIL, one handle registry, one native allocator and
//! two background threads: the reaper (disposes handles whose objects were
//! collected) and the collector (runs cleanup passes). Production code
//! creates one per process; tests create as many as they like.
//!
//! # Lifecycle
//!
//! ```text
//! Bridge::new ──► handle_for / call_method / upcalls ──► shutdown (or drop)
//!                                                         │
//!                     stop collector ◄─────────────────────┤
//!                     stop reaper    ◄─────────────────────┤
//!                     sweep: dispose every remaining handle┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use parking_lot::RwLock;

use crate::cleaner::{self, ReaperMessage, ReaperSync, SlotKey};
use crate::config::BridgeConfig;
use crate::context::{self, CallFrame};
use crate::error::BridgeError;
use crate::extension::Extension;
use crate::gc::{self, CleanupRequest, GcBridge, PassStats};
use crate::gil::{Gil, GilCell, GilGuard};
use crate::handle::{Handle, HandleRegistry};
use crate::mark::{self, Mark};
use crate::method::{self, NativeFunction, NativeMethod};
use crate::metrics::{BridgeMetrics, MetricsSnapshot};
use crate::native::NativeAllocator;
use crate::object::{DataCell, ManagedObject, ObjectKind, ObjectRef};
use crate::upcall::UPCALLS;
use crate::value::{Immediate, NativeAddress, Value};

type MethodTable = HashMap<(String, String), NativeMethod>;

/// State shared by the bridge, its threads and the upcalls.
pub(crate) struct Shared {
    me: Weak<Shared>,
    pub(crate) config: BridgeConfig,
    pub(crate) gil: Gil,
    pub(crate) registry: GilCell<HandleRegistry>,
    pub(crate) native: Arc<dyn NativeAllocator>,
    pub(crate) gc: GcBridge,
    pub(crate) reaper_sync: ReaperSync,
    pub(crate) metrics: BridgeMetrics,
    reaper_tx: Sender<ReaperMessage>,
    methods: RwLock<MethodTable>,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn request_cleanup(&self) -> CleanupRequest {
        let request = self.gc.request();
        self.metrics.record_request(request);
        request
    }

    pub(crate) fn disable_gc(&self) -> usize {
        self.gc.disable()
    }

    pub(crate) fn enable_gc(&self) {
        if let Some(request) = self.gc.enable() {
            self.metrics.record_request(request);
        }
    }

    /// Converts `value` to its native address, creating a handle if needed.
    ///
    /// The object is kept alive by the current call frame; boxed integers
    /// made outside a frame go to the carried roots instead.
    pub(crate) fn address_for(
        &self,
        guard: &GilGuard<'_>,
        value: &Value,
    ) -> Result<NativeAddress, BridgeError> {
        let immediate = match value {
            Value::Object(object) => return self.retained_address(guard, Arc::clone(object), false),
            Value::Integer(i) if Immediate::fixnum(*i).is_none() => {
                return self.retained_address(guard, ManagedObject::boxed_integer(*i), true);
            }
            Value::Integer(i) => Immediate::Fixnum(*i),
            Value::Nil => Immediate::Nil,
            Value::Bool(b) => Immediate::Bool(*b),
            Value::Symbol(id) => Immediate::Symbol(*id),
        };
        self.metrics.record_immediate();
        Ok(immediate.encode())
    }

    fn retained_address(
        &self,
        guard: &GilGuard<'_>,
        object: ObjectRef,
        bridge_owned: bool,
    ) -> Result<NativeAddress, BridgeError> {
        let address = self.handle_for_object(guard, &object)?;
        if let Some(object) = context::retain_local(self, object) {
            if bridge_owned {
                self.gc.carry(object);
            }
        }
        Ok(address)
    }

    /// Lookup-or-create. Serialized by the GIL, so concurrent callers for
    /// the same object observe one creation.
    fn handle_for_object(
        &self,
        guard: &GilGuard<'_>,
        object: &ObjectRef,
    ) -> Result<NativeAddress, BridgeError> {
        if self.is_shut_down() {
            return Err(BridgeError::ShutDown);
        }
        if let Some(handle) = self.registry.with(guard, |registry| registry.lookup(object.id())) {
            return Ok(handle.address());
        }

        let address = self.native.allocate(object.kind(), object)?;
        if address.is_immediate() {
            if let Err(err) = self.native.free(address) {
                crate::tracing::log_dispose_failure(address, &err);
            }
            return Err(BridgeError::Allocation(crate::error::NativeError::Misaligned(address)));
        }

        let handle = self.registry.with(guard, |registry| {
            if registry.is_address_live(address) {
                return Err(BridgeError::AddressInUse(address));
            }
            Ok(registry.insert(object, address))
        })?;
        self.watch(object, &handle);

        self.metrics.record_handle_created();
        crate::tracing::log_handle_created(address, object.id(), object.kind());
        Ok(address)
    }

    /// Registers the collection callback that queues `handle` for the reaper.
    fn watch(&self, object: &ObjectRef, handle: &Arc<Handle>) {
        let shared = Weak::clone(&self.me);
        let weak_handle = Arc::downgrade(handle);
        let key = handle.slot();
        object.on_collect(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            // A missing or non-active handle was already swept.
            if !weak_handle.upgrade().is_some_and(|handle| handle.mark_queued()) {
                return;
            }
            shared.notify_collected(key);
        });
    }

    fn notify_collected(&self, key: SlotKey) {
        self.reaper_sync.delivered();
        if self.reaper_tx.send(ReaperMessage::Collected(key)).is_err() {
            self.reaper_sync.processed(1);
        }
    }

    pub(crate) fn resolve_locked(
        &self,
        guard: &GilGuard<'_>,
        address: NativeAddress,
    ) -> Result<Value, BridgeError> {
        if address.is_immediate() {
            return Immediate::decode(address)
                .map(Value::from)
                .ok_or(BridgeError::InvalidImmediate(address));
        }
        let handle = self
            .registry
            .with(guard, |registry| registry.by_address(address))
            .ok_or(BridgeError::UnknownAddress(address))?;
        let object = handle.object().ok_or(BridgeError::Collected(address))?;
        Ok(Value::from_object(object))
    }

    /// Keeps the object at `address` alive on behalf of native memory.
    ///
    /// During a mark pass this reports to the pass. Otherwise the object is
    /// held until the current call frame pops.
    pub(crate) fn mark(&self, address: NativeAddress) {
        if mark::with_active(|marker| marker.mark(address)).is_some() || address.is_immediate() {
            return;
        }
        let guard = self.gil.acquire();
        let object = self
            .registry
            .with(&guard, |registry| registry.by_address(address))
            .and_then(|handle| handle.object());
        drop(guard);
        match object {
            Some(object) => {
                if let Some(object) = context::retain_local(self, object) {
                    self.gc.carry(object);
                }
            }
            None => crate::tracing::log_unknown_address("gc_mark", address),
        }
    }

    pub(crate) fn unmark_after_pass(&self, address: NativeAddress) {
        if address.is_resource() {
            self.gc.queue_unmark(address);
        }
    }

    /// Registers an object the bridge just created and keeps it alive.
    fn register_fresh(&self, object: ObjectRef) -> Result<NativeAddress, BridgeError> {
        let guard = self.gil.acquire();
        let address = self.handle_for_object(&guard, &object)?;
        drop(guard);
        if let Some(object) = context::retain_local(self, object) {
            self.gc.carry(object);
        }
        Ok(address)
    }

    pub(crate) fn allocate_managed_object(
        &self,
        kind: ObjectKind,
    ) -> Result<NativeAddress, BridgeError> {
        self.register_fresh(ManagedObject::new(kind))
    }

    pub(crate) fn wrap_cell(&self, cell: DataCell) -> Result<NativeAddress, BridgeError> {
        self.register_fresh(ManagedObject::wrap_data(cell))
    }

    pub(crate) fn define_method(&self, owner: &str, name: &str, function: NativeFunction) {
        self.methods.write().insert(
            (owner.to_owned(), name.to_owned()),
            NativeMethod::new(name, function),
        );
    }

    fn lookup_method(&self, owner: &str, name: &str) -> Option<NativeMethod> {
        self.methods
            .read()
            .get(&(owner.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Disposes the handles behind `keys`. Returns the released retained sets.
    pub(crate) fn reap_batch(&self, guard: &GilGuard<'_>, keys: &[SlotKey]) -> Vec<ObjectRef> {
        self.metrics.record_reaper_batch();
        let mut released = Vec::new();
        for &key in keys {
            // Already swept if missing.
            if let Some(handle) = self.registry.with(guard, |registry| registry.remove(key)) {
                released.extend(self.dispose(&handle));
            }
        }
        released
    }

    /// Frees one handle's native resource, isolating faults.
    fn dispose(&self, handle: &Handle) -> Vec<ObjectRef> {
        let address = handle.address();
        match panic::catch_unwind(AssertUnwindSafe(|| handle.dispose(&*self.native))) {
            Ok((Ok(()), released)) => {
                self.metrics.record_dispose(true);
                crate::tracing::log_handle_disposed(address);
                released
            }
            Ok((Err(err), released)) => {
                self.metrics.record_dispose(false);
                crate::tracing::log_dispose_failure(address, &err);
                released
            }
            Err(_) => {
                self.metrics.record_dispose(false);
                crate::tracing::log_dispose_panic(address);
                Vec::new()
            }
        }
    }

    fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.gil.blocking_section(|| loop {
            if !self.gc.wait_idle(deadline) || !self.reaper_sync.wait_drained(deadline) {
                return false;
            }
            // A pass may have released objects the reaper has yet to see.
            if self.gc.wait_idle(Instant::now()) && self.reaper_sync.pending() == 0 {
                return true;
            }
        })
    }
}

/// The native-extension bridge.
pub struct Bridge {
    shared: Arc<Shared>,
    reaper: Option<JoinHandle<()>>,
    collector: Option<JoinHandle<()>>,
    extensions: Vec<Extension>,
}

impl Bridge {
    /// Creates a bridge with the default configuration.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Spawn`] if a background thread cannot be started.
    pub fn new(native: Arc<dyn NativeAllocator>) -> Result<Self, BridgeError> {
        Self::with_config(BridgeConfig::default(), native)
    }

    /// Creates a bridge.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Spawn`] if a background thread cannot be started.
    pub fn with_config(
        config: BridgeConfig,
        native: Arc<dyn NativeAllocator>,
    ) -> Result<Self, BridgeError> {
        let (reaper_tx, reaper_rx) = channel::unbounded();
        let gil = Gil::with_poll_interval(config.interrupt_poll_interval);
        let registry = GilCell::new(&gil, HandleRegistry::default());
        let shared = Arc::new_cyclic(|me| Shared {
            me: Weak::clone(me),
            config,
            gil,
            registry,
            native,
            gc: GcBridge::new(),
            reaper_sync: ReaperSync::default(),
            metrics: BridgeMetrics::default(),
            reaper_tx,
            methods: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        });

        if shared.config.cleanup_on_release {
            let weak = Arc::downgrade(&shared);
            shared.gil.set_release_hook(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.request_cleanup();
                }
            });
        }

        let name = shared.config.reaper_thread_name.clone();
        let worker = Arc::clone(&shared);
        let reaper = thread::Builder::new()
            .name(name.clone())
            .spawn(move || cleaner::run_reaper(&worker, &reaper_rx))
            .map_err(|source| BridgeError::Spawn { name, source })?;

        let name = shared.config.collector_thread_name.clone();
        let worker = Arc::clone(&shared);
        let collector = thread::Builder::new()
            .name(name.clone())
            .spawn(move || gc::run_collector(&worker));

        let mut bridge = Self {
            shared,
            reaper: Some(reaper),
            collector: None,
            extensions: Vec::new(),
        };
        match collector {
            Ok(collector) => {
                bridge.collector = Some(collector);
                Ok(bridge)
            }
            Err(source) => {
                bridge.shutdown();
                Err(BridgeError::Spawn { name, source })
            }
        }
    }

    /// The execution lock.
    #[must_use]
    pub fn gil(&self) -> &Gil {
        &self.shared.gil
    }

    /// The configuration this bridge was created with.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Returns the native address for `value`, creating a handle if needed.
    ///
    /// Immediates are encoded directly and allocate nothing. Calling this
    /// again for the same live object returns the same address.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Allocation`] if the native resource cannot be
    /// allocated, [`BridgeError::ShutDown`] after shutdown.
    pub fn handle_for(&self, value: &Value) -> Result<NativeAddress, BridgeError> {
        if let Some(immediate) = value.as_immediate() {
            self.shared.metrics.record_immediate();
            return Ok(immediate.encode());
        }
        let guard = self.shared.gil.acquire();
        self.shared.address_for(&guard, value)
    }

    /// Returns the value behind a native address.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UnknownAddress`] if no live handle owns the address,
    /// [`BridgeError::Collected`] if its object is already gone, and
    /// [`BridgeError::InvalidImmediate`] for reserved bit patterns.
    pub fn resolve(&self, address: NativeAddress) -> Result<Value, BridgeError> {
        if address.is_immediate() {
            return Immediate::decode(address)
                .map(Value::from)
                .ok_or(BridgeError::InvalidImmediate(address));
        }
        let guard = self.shared.gil.acquire();
        self.shared.resolve_locked(&guard, address)
    }

    /// The live handle owning `address`.
    #[must_use]
    pub fn handle(&self, address: NativeAddress) -> Option<Arc<Handle>> {
        let guard = self.shared.gil.acquire();
        self.shared
            .registry
            .with(&guard, |registry| registry.by_address(address))
    }

    /// The handle of `object`, if one exists. Never creates one.
    #[must_use]
    pub fn existing_handle(&self, object: &ManagedObject) -> Option<Arc<Handle>> {
        let guard = self.shared.gil.acquire();
        self.shared
            .registry
            .with(&guard, |registry| registry.lookup(object.id()))
    }

    /// Number of handles in the cleaner list.
    #[must_use]
    pub fn live_handles(&self) -> usize {
        let guard = self.shared.gil.acquire();
        self.shared.registry.with(&guard, |registry| registry.len())
    }

    /// Snapshot of the cleaner list, most recently created first.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<Handle>> {
        let guard = self.shared.gil.acquire();
        self.shared.registry.with(&guard, |registry| registry.handles())
    }

    /// Suppresses cleanup passes until the matching [`enable_gc`](Self::enable_gc).
    ///
    /// Returns the new nesting depth.
    pub fn disable_gc(&self) -> usize {
        self.shared.disable_gc()
    }

    /// Re-enables cleanup. At depth zero, a request made while disabled runs.
    ///
    /// # Panics
    ///
    /// If cleanup is not disabled.
    pub fn enable_gc(&self) {
        self.shared.enable_gc();
    }

    /// Requests a cleanup pass on the collector thread.
    pub fn trigger_cleanup(&self) -> CleanupRequest {
        self.shared.request_cleanup()
    }

    /// Runs one cleanup pass on the calling thread.
    ///
    /// Returns `None` if cleanup is disabled; the pass is then deferred to
    /// the outermost [`enable_gc`](Self::enable_gc).
    pub fn collect(&self) -> Option<PassStats> {
        if self.shared.gc.defer_if_disabled() {
            self.shared.metrics.record_request(CleanupRequest::Deferred);
            return None;
        }
        Some(gc::run_cleanup_pass(&self.shared))
    }

    /// Declares that native memory references the object at `address`.
    pub fn mark(&self, address: NativeAddress) {
        self.shared.mark(address);
    }

    /// Clears the native mark flag of `address` at the end of the next pass.
    pub fn unmark_after_pass(&self, address: NativeAddress) {
        self.shared.unmark_after_pass(address);
    }

    /// Creates a managed object for native code and returns its address.
    ///
    /// The object is kept alive by the current call frame, or until the next
    /// cleanup pass outside one.
    ///
    /// # Errors
    ///
    /// As for [`handle_for`](Self::handle_for).
    pub fn allocate_managed_object(&self, kind: ObjectKind) -> Result<NativeAddress, BridgeError> {
        self.shared.allocate_managed_object(kind)
    }

    /// Wraps a Rust value as a data object.
    #[must_use]
    pub fn wrap_data<T: Mark + Send + Sync + 'static>(&self, value: T) -> ObjectRef {
        ManagedObject::wrap_data(DataCell::boxed(value))
    }

    /// Defines a native method on `owner`.
    pub fn define_method(&self, owner: &str, name: &str, function: NativeFunction) {
        self.shared.define_method(owner, name, function);
    }

    /// Returns the method `name` of `owner`.
    #[must_use]
    pub fn method(&self, owner: &str, name: &str) -> Option<NativeMethod> {
        self.shared.lookup_method(owner, name)
    }

    /// Calls the native method `name` of `owner` on `recv`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::UndefinedMethod`], [`BridgeError::ArityMismatch`],
    /// [`BridgeError::Raised`] if native code raised, or any conversion error.
    ///
    /// # Safety
    ///
    /// The native function must be sound to call with handle addresses.
    pub unsafe fn call_method(
        &self,
        owner: &str,
        name: &str,
        recv: &Value,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        let method = self
            .shared
            .lookup_method(owner, name)
            .ok_or_else(|| BridgeError::UndefinedMethod {
                owner: owner.to_owned(),
                name: name.to_owned(),
            })?;
        // SAFETY: caller contract.
        unsafe { self.call(&method, recv, args) }
    }

    /// Calls `method` on `recv`.
    ///
    /// # Errors
    ///
    /// As for [`call_method`](Self::call_method).
    ///
    /// # Safety
    ///
    /// As for [`call_method`](Self::call_method).
    pub unsafe fn call(
        &self,
        method: &NativeMethod,
        recv: &Value,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        // SAFETY: caller contract.
        unsafe { method::call(&self.shared, method, recv, args) }
    }

    /// Loads an extension library and runs its `Init_<name>` function.
    ///
    /// The library stays loaded until after the shutdown sweep.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Extension`] if loading or symbol lookup fails, and
    /// [`BridgeError::Raised`] if the init function raised.
    ///
    /// # Safety
    ///
    /// The library must export an init function with the
    /// [`InitFn`](crate::extension::InitFn) signature.
    pub unsafe fn load_extension(&mut self, path: impl AsRef<Path>) -> Result<&Extension, BridgeError> {
        if self.shared.is_shut_down() {
            return Err(BridgeError::ShutDown);
        }
        // SAFETY: caller contract.
        let extension = unsafe { Extension::open(path) }?;
        // SAFETY: caller contract.
        unsafe { self.init_extension(extension) }
    }

    /// Runs `Init_<name>` of an extension statically linked into the host.
    ///
    /// # Errors
    ///
    /// As [`load_extension`](Self::load_extension).
    ///
    /// # Safety
    ///
    /// The executable must export an init function for `name` with the
    /// [`InitFn`](crate::extension::InitFn) signature.
    pub unsafe fn load_builtin_extension(&mut self, name: &str) -> Result<&Extension, BridgeError> {
        if self.shared.is_shut_down() {
            return Err(BridgeError::ShutDown);
        }
        let extension = Extension::builtin(name)?;
        // SAFETY: caller contract.
        unsafe { self.init_extension(extension) }
    }

    /// # Safety
    ///
    /// See [`load_extension`](Self::load_extension).
    unsafe fn init_extension(&mut self, extension: Extension) -> Result<&Extension, BridgeError> {
        // SAFETY: caller contract.
        let init = unsafe { extension.init_fn() }?;
        {
            let frame = CallFrame::enter(&self.shared);
            let guard = self.shared.gil.acquire();
            // SAFETY: caller contract; the GIL is held inside a frame.
            unsafe { init(&UPCALLS) };
            if let Some(exception) = frame.take_exception() {
                return Err(BridgeError::Raised(exception));
            }
            drop(guard);
        }
        crate::tracing::log_extension_loaded(extension.name());
        self.extensions.push(extension);
        Ok(&self.extensions[self.extensions.len() - 1])
    }

    /// Extensions loaded so far.
    #[must_use]
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Objects held by the bridge until the next cleanup pass.
    #[must_use]
    pub fn carried_roots(&self) -> usize {
        self.shared.gc.carried_len()
    }

    /// Waits until no cleanup pass is pending and the reaper has processed
    /// every collection notification. Returns `false` on timeout.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        self.shared.quiesce(timeout)
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Stops both threads and disposes every remaining handle.
    ///
    /// Idempotent. Also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        shared.gil.clear_release_hook();
        shared.gc.shutdown();

        let collector = self.collector.take();
        let reaper = self.reaper.take();
        shared.gil.blocking_section(|| {
            if let Some(collector) = collector {
                if collector.join().is_err() {
                    crate::tracing::log_worker_panicked(&shared.config.collector_thread_name);
                }
            }
            // Ignored: the reaper may already be gone.
            let _ = shared.reaper_tx.send(ReaperMessage::Shutdown);
            if let Some(reaper) = reaper {
                if reaper.join().is_err() {
                    crate::tracing::log_worker_panicked(&shared.config.reaper_thread_name);
                }
            }
        });

        let guard = shared.gil.acquire();
        let handles = shared.registry.with(&guard, |registry| registry.drain());
        let mut released = Vec::new();
        let mut disposed = 0;
        if shared.config.dispose_on_shutdown {
            for handle in &handles {
                released.extend(shared.dispose(handle));
                disposed += 1;
            }
        }
        guard.release_no_cleanup();

        crate::tracing::log_shutdown_sweep(disposed, handles.len() - disposed);
        drop(handles);
        drop(released);
        drop(shared.gc.release_roots());
        shared.reaper_sync.reset();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("gil", &self.shared.gil)
            .field("shut_down", &self.is_shut_down())
            .field("extensions", &self.extensions)
            .finish_non_exhaustive()
    }
}
