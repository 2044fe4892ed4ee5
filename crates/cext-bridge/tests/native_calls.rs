//! Native call adapter and upcall tests.
//!
//! The native side is written as `extern "C"` functions in this file and
//! talks back to the bridge through `UPCALLS`, exactly like a loaded
//! extension would.

use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cext_bridge::native::{MallocAllocator, RecordingAllocator};
use cext_bridge::value::QNIL;
use cext_bridge::{
    Bridge, BridgeConfig, BridgeError, CleanupRequest, Immediate, ManagedObject, NativeAddress,
    NativeFunction, ObjectKind, Value, UPCALLS,
};

const QUIESCE: Duration = Duration::from_secs(10);

fn bridge() -> (Bridge, Arc<RecordingAllocator>) {
    let native = Arc::new(RecordingAllocator::new());
    let bridge = Bridge::new(native.clone()).unwrap();
    (bridge, native)
}

fn fixnum(raw: usize) -> i64 {
    match Immediate::decode(NativeAddress::from_raw(raw)) {
        Some(Immediate::Fixnum(n)) => n,
        other => panic!("expected a fixnum, got {other:?}"),
    }
}

fn encode(n: i64) -> usize {
    Immediate::fixnum(n).unwrap().encode().as_raw()
}

unsafe extern "C" fn identity(recv: usize) -> usize {
    recv
}

unsafe extern "C" fn second(_recv: usize, a: usize) -> usize {
    a
}

unsafe extern "C" fn add(_recv: usize, a: usize, b: usize) -> usize {
    encode(fixnum(a) + fixnum(b))
}

unsafe extern "C" fn sum_all(argc: c_int, argv: *const usize, _recv: usize) -> usize {
    let args = unsafe { std::slice::from_raw_parts(argv, usize::try_from(argc).unwrap()) };
    encode(args.iter().map(|a| fixnum(*a)).sum())
}

unsafe extern "C" fn raise_error(_recv: usize) -> usize {
    unsafe { (UPCALLS.raise)(c"boom".as_ptr()) };
    QNIL
}

unsafe extern "C" fn make_hash(_recv: usize) -> usize {
    unsafe { (UPCALLS.new_object)(ObjectKind::Hash.as_raw()) }
}

unsafe extern "C" fn make_bogus(_recv: usize) -> usize {
    unsafe { (UPCALLS.new_object)(0x1f) }
}

unsafe extern "C" fn return_garbage(_recv: usize) -> usize {
    0xdead_0000
}

unsafe extern "C" fn define_ping(_recv: usize) -> usize {
    let status = unsafe {
        (UPCALLS.define_method)(
            c"Widget".as_ptr(),
            c"ping".as_ptr(),
            identity as *const c_void,
            0,
        )
    };
    encode(i64::from(status))
}

unsafe extern "C" fn disable(_recv: usize) -> usize {
    unsafe { (UPCALLS.gc_disable)() };
    QNIL
}

unsafe extern "C" fn enable(_recv: usize) -> usize {
    unsafe { (UPCALLS.gc_enable)() };
    QNIL
}

static COUNTER_FREES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn free_counter(data: *mut c_void) {
    drop(unsafe { Box::from_raw(data.cast::<u64>()) });
    COUNTER_FREES.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn make_counter(_recv: usize) -> usize {
    let data = Box::into_raw(Box::new(7_u64)).cast::<c_void>();
    unsafe { (UPCALLS.wrap_data)(c"Counter".as_ptr(), None, Some(free_counter), data) }
}

#[test]
fn test_arity_zero_returns_receiver() {
    let (bridge, _native) = bridge();
    bridge.define_method("Object", "itself", NativeFunction::Arity0(identity));
    let recv = Value::from(ManagedObject::new(ObjectKind::Object));

    let result = unsafe { bridge.call_method("Object", "itself", &recv, &[]) }.unwrap();
    assert_eq!(result, recv);
    assert_eq!(bridge.metrics().native_calls, 1);
}

#[test]
fn test_arity_one_and_two() {
    let (bridge, _native) = bridge();
    bridge.define_method("Object", "second", NativeFunction::Arity1(second));
    bridge.define_method("Integer", "+", NativeFunction::Arity2(add));
    let arg = Value::from(ManagedObject::new(ObjectKind::String));

    let result = unsafe { bridge.call_method("Object", "second", &Value::Nil, &[arg.clone()]) };
    assert_eq!(result.unwrap(), arg);

    let result = unsafe {
        bridge.call_method("Integer", "+", &Value::Nil, &[Value::Integer(40), Value::Integer(2)])
    };
    assert_eq!(result.unwrap(), Value::Integer(42));
}

#[test]
fn test_variadic_receives_every_argument() {
    let (bridge, _native) = bridge();
    bridge.define_method("Kernel", "sum", NativeFunction::Variadic(sum_all));
    let args: Vec<Value> = (1..=6).map(Value::Integer).collect();

    let result = unsafe { bridge.call_method("Kernel", "sum", &Value::Nil, &args) };
    assert_eq!(result.unwrap(), Value::Integer(21));

    let result = unsafe { bridge.call_method("Kernel", "sum", &Value::Nil, &[]) };
    assert_eq!(result.unwrap(), Value::Integer(0));
}

#[test]
fn test_arity_mismatch_is_rejected_before_calling() {
    let (bridge, _native) = bridge();
    bridge.define_method("Integer", "+", NativeFunction::Arity2(add));

    let result = unsafe { bridge.call_method("Integer", "+", &Value::Nil, &[Value::Integer(1)]) };
    assert!(matches!(
        result,
        Err(BridgeError::ArityMismatch {
            given: 1,
            expected: 2
        })
    ));
    assert_eq!(bridge.metrics().native_calls, 0);
}

#[test]
fn test_undefined_method() {
    let (bridge, _native) = bridge();
    let result = unsafe { bridge.call_method("Object", "missing", &Value::Nil, &[]) };
    assert!(matches!(result, Err(BridgeError::UndefinedMethod { .. })));
}

#[test]
fn test_raise_becomes_error_and_releases_gil() {
    let (bridge, _native) = bridge();
    bridge.define_method("Object", "explode", NativeFunction::Arity0(raise_error));

    let result = unsafe { bridge.call_method("Object", "explode", &Value::Nil, &[]) };
    match result {
        Err(BridgeError::Raised(exception)) => assert_eq!(exception.message, "boom"),
        other => panic!("expected a raised exception, got {other:?}"),
    }
    assert!(!bridge.gil().is_held_by_current_thread());
    assert_eq!(bridge.metrics().native_exceptions, 1);

    // The next call starts clean.
    bridge.define_method("Object", "itself", NativeFunction::Arity0(identity));
    assert!(unsafe { bridge.call_method("Object", "itself", &Value::Nil, &[]) }.is_ok());
}

#[test]
fn test_new_object_upcall_registers_handle() {
    let (bridge, native) = bridge();
    bridge.define_method("Object", "make_hash", NativeFunction::Arity0(make_hash));

    let result = unsafe { bridge.call_method("Object", "make_hash", &Value::Nil, &[]) }.unwrap();
    let Value::Object(object) = result else {
        panic!("expected an object");
    };
    assert_eq!(object.kind(), ObjectKind::Hash);
    let handle = bridge.existing_handle(&object).unwrap();
    assert!(native.is_live(handle.address()));
}

#[test]
fn test_new_object_with_unknown_kind_raises() {
    let (bridge, native) = bridge();
    bridge.define_method("Object", "bogus", NativeFunction::Arity0(make_bogus));

    let result = unsafe { bridge.call_method("Object", "bogus", &Value::Nil, &[]) };
    assert!(matches!(result, Err(BridgeError::Raised(_))));
    assert_eq!(native.allocations(), 0);
}

#[test]
fn test_unknown_return_address_is_an_error() {
    let (bridge, _native) = bridge();
    bridge.define_method("Object", "garbage", NativeFunction::Arity0(return_garbage));

    let result = unsafe { bridge.call_method("Object", "garbage", &Value::Nil, &[]) };
    assert!(matches!(result, Err(BridgeError::UnknownAddress(_))));
}

#[test]
fn test_define_method_upcall() {
    let (bridge, _native) = bridge();
    bridge.define_method("Widget", "setup", NativeFunction::Arity0(define_ping));

    let status = unsafe { bridge.call_method("Widget", "setup", &Value::Nil, &[]) }.unwrap();
    assert_eq!(status, Value::Integer(0));
    assert!(bridge.method("Widget", "ping").is_some());

    let recv = Value::from(ManagedObject::new(ObjectKind::Object));
    let result = unsafe { bridge.call_method("Widget", "ping", &recv, &[]) }.unwrap();
    assert_eq!(result, recv);
}

#[test]
fn test_gc_disable_upcall_nests_with_bridge_api() {
    let native = Arc::new(RecordingAllocator::new());
    let config = BridgeConfig::default().with_cleanup_on_release(false);
    let bridge = Bridge::with_config(config, native).unwrap();
    bridge.define_method("GC", "disable", NativeFunction::Arity0(disable));
    bridge.define_method("GC", "enable", NativeFunction::Arity0(enable));

    unsafe { bridge.call_method("GC", "disable", &Value::Nil, &[]) }.unwrap();
    assert_eq!(bridge.trigger_cleanup(), CleanupRequest::Deferred);

    unsafe { bridge.call_method("GC", "enable", &Value::Nil, &[]) }.unwrap();
    assert!(bridge.quiesce(QUIESCE));
    assert!(bridge.metrics().cleanup_passes >= 1);

    // An unbalanced enable from native code is ignored.
    assert!(unsafe { bridge.call_method("GC", "enable", &Value::Nil, &[]) }.is_ok());
}

#[test]
fn test_wrap_data_upcall_frees_through_native_routine() {
    let (bridge, native) = bridge();
    bridge.define_method("Counter", "new", NativeFunction::Arity0(make_counter));
    let before = COUNTER_FREES.load(Ordering::SeqCst);

    let result = unsafe { bridge.call_method("Counter", "new", &Value::Nil, &[]) }.unwrap();
    let Value::Object(object) = result else {
        panic!("expected a data object");
    };
    assert_eq!(object.kind(), ObjectKind::Data);
    assert_eq!(object.data_cell().unwrap().data_type().name, "Counter");
    let address = bridge.existing_handle(&object).unwrap().address();

    drop(object);
    bridge.trigger_cleanup();
    assert!(bridge.quiesce(QUIESCE));
    assert_eq!(native.free_count(address), 1);
    assert_eq!(COUNTER_FREES.load(Ordering::SeqCst), before + 1);
}

static HOLDER_MARKS: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn mark_holder(data: *mut c_void) {
    let target = unsafe { *data.cast::<usize>() };
    unsafe { (UPCALLS.gc_mark)(target) };
    HOLDER_MARKS.fetch_add(1, Ordering::SeqCst);
}

unsafe extern "C" fn free_holder(data: *mut c_void) {
    drop(unsafe { Box::from_raw(data.cast::<usize>()) });
}

unsafe extern "C" fn make_holder(_recv: usize, target: usize) -> usize {
    let data = Box::into_raw(Box::new(target)).cast::<c_void>();
    unsafe { (UPCALLS.wrap_data)(c"Holder".as_ptr(), Some(mark_holder), Some(free_holder), data) }
}

#[test]
fn test_native_mark_routine_keeps_target_alive() {
    let native = Arc::new(MallocAllocator::new());
    let config = BridgeConfig::default().with_cleanup_on_release(false);
    let bridge = Bridge::with_config(config, native.clone()).unwrap();
    bridge.define_method("Holder", "new", NativeFunction::Arity1(make_holder));

    let target = ManagedObject::new(ObjectKind::String);
    let weak_target = Arc::downgrade(&target);
    let target_address = bridge.handle_for(&Value::from(Arc::clone(&target))).unwrap();
    let holder = unsafe { bridge.call_method("Holder", "new", &Value::Nil, &[Value::from(target)]) }.unwrap();
    let Value::Object(holder) = holder else {
        panic!("expected a data object");
    };
    assert!(bridge.quiesce(QUIESCE));

    let marks = HOLDER_MARKS.load(Ordering::SeqCst);
    assert!(bridge.collect().is_some());
    assert!(bridge.quiesce(QUIESCE));
    assert!(HOLDER_MARKS.load(Ordering::SeqCst) > marks);

    let target = weak_target.upgrade().expect("target kept alive by the mark routine");
    assert!(bridge.existing_handle(&holder).unwrap().retains(&target));
    assert!(native.flags(target_address).is_some());
    assert!(!native.is_marked(target_address));
    assert_eq!(bridge.carried_roots(), 0);
    drop(target);

    drop(holder);
    assert!(bridge.collect().is_some());
    assert!(bridge.quiesce(QUIESCE));
    assert!(weak_target.upgrade().is_none());
    assert_eq!(native.live_count(), 0);
}

#[test]
fn test_locals_survive_until_call_returns() {
    let (bridge, _native) = bridge();
    bridge.define_method("Object", "itself", NativeFunction::Arity0(identity));
    let object = ManagedObject::new(ObjectKind::Object);
    let weak = Arc::downgrade(&object);

    let result = unsafe { bridge.call_method("Object", "itself", &Value::from(object), &[]) }.unwrap();
    assert!(weak.upgrade().is_some());
    drop(result);
    bridge.trigger_cleanup();
    assert!(bridge.quiesce(QUIESCE));
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_upcall_outside_native_call_is_harmless() {
    let address = unsafe { (UPCALLS.new_object)(ObjectKind::Object.as_raw()) };
    assert_eq!(address, QNIL);
    unsafe { (UPCALLS.raise)(c"ignored".as_ptr()) };
    unsafe { (UPCALLS.gc_mark)(0x1000) };
}
