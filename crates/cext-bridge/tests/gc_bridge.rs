//! Mark pass and cleanup scheduling tests.
//!
//! Passes are driven explicitly with `Bridge::collect`; the release hook is
//! switched off so no background pass interferes.

use std::sync::Arc;
use std::time::Duration;

use cext_bridge::native::RecordingAllocator;
use cext_bridge::{
    Bridge, BridgeConfig, CleanupRequest, Mark, ManagedObject, Marker, NativeAddress, ObjectKind,
    ObjectRef, Value,
};

const QUIESCE: Duration = Duration::from_secs(10);

struct Opaque;

impl Mark for Opaque {
    fn mark(&self, _marker: &Marker<'_>) {}
}

fn manual_bridge() -> (Bridge, Arc<RecordingAllocator>) {
    let native = Arc::new(RecordingAllocator::new());
    let config = BridgeConfig::default().with_cleanup_on_release(false);
    let bridge = Bridge::with_config(config, native.clone()).unwrap();
    (bridge, native)
}

fn handle(bridge: &Bridge, object: &ObjectRef) -> NativeAddress {
    bridge.handle_for(&Value::from(Arc::clone(object))).unwrap()
}

#[test]
fn test_marked_object_survives_managed_drop() {
    let (bridge, native) = manual_bridge();
    let owner = bridge.wrap_data(Opaque);
    let owner_address = handle(&bridge, &owner);
    let target = ManagedObject::new(ObjectKind::String);
    let target_address = handle(&bridge, &target);

    native.set_references(owner_address, vec![target_address]);
    let stats = bridge.collect().unwrap();
    assert_eq!(stats.owners_scanned, 1);
    assert_eq!(stats.objects_marked, 1);
    assert!(bridge.handle(owner_address).unwrap().retains(&target));

    let weak = Arc::downgrade(&target);
    drop(target);
    assert!(bridge.quiesce(QUIESCE));
    assert!(weak.upgrade().is_some());
    assert_eq!(native.free_count(target_address), 0);
    assert!(bridge.resolve(target_address).is_ok());
}

#[test]
fn test_dropping_reference_releases_object_after_next_pass() {
    let (bridge, native) = manual_bridge();
    let owner = bridge.wrap_data(Opaque);
    let owner_address = handle(&bridge, &owner);
    let target = ManagedObject::new(ObjectKind::Array);
    let target_address = handle(&bridge, &target);

    native.set_references(owner_address, vec![target_address]);
    bridge.collect().unwrap();
    let weak = Arc::downgrade(&target);
    drop(target);

    native.set_references(owner_address, Vec::new());
    let stats = bridge.collect().unwrap();
    assert_eq!(stats.objects_marked, 0);
    assert!(bridge.quiesce(QUIESCE));

    assert!(weak.upgrade().is_none());
    assert_eq!(native.free_count(target_address), 1);
    assert_eq!(bridge.handle(owner_address).unwrap().retained_len(), 0);
}

#[test]
fn test_retained_set_dies_with_owner() {
    let (bridge, native) = manual_bridge();
    let owner = bridge.wrap_data(Opaque);
    let owner_address = handle(&bridge, &owner);
    let target = ManagedObject::new(ObjectKind::Object);
    let target_address = handle(&bridge, &target);

    native.set_references(owner_address, vec![target_address]);
    bridge.collect().unwrap();
    drop(target);
    drop(owner);
    assert!(bridge.quiesce(QUIESCE));

    assert_eq!(native.free_count(owner_address), 1);
    assert_eq!(native.free_count(target_address), 1);
    assert_eq!(bridge.live_handles(), 0);
}

#[test]
fn test_pass_clears_marks_and_unmark_queue() {
    let (bridge, native) = manual_bridge();
    let owner = bridge.wrap_data(Opaque);
    let owner_address = handle(&bridge, &owner);
    let target = ManagedObject::new(ObjectKind::Object);
    let target_address = handle(&bridge, &target);
    let queued = NativeAddress::from_raw(0x9000);

    native.set_references(owner_address, vec![target_address, target_address]);
    bridge.unmark_after_pass(queued);
    bridge.unmark_after_pass(NativeAddress::NIL);
    let stats = bridge.collect().unwrap();

    assert_eq!(stats.objects_marked, 1);
    assert_eq!(stats.unmarked, 2);
    let cleared = native.cleared_marks();
    assert!(cleared.contains(&target_address));
    assert!(cleared.contains(&queued));

    // The queue is consumed by the pass.
    let stats = bridge.collect().unwrap();
    assert_eq!(stats.unmarked, 1);
}

#[test]
fn test_unknown_reference_is_ignored() {
    let (bridge, native) = manual_bridge();
    let owner = bridge.wrap_data(Opaque);
    let owner_address = handle(&bridge, &owner);

    native.set_references(owner_address, vec![NativeAddress::from_raw(0x7770)]);
    let stats = bridge.collect().unwrap();
    assert_eq!(stats.objects_marked, 0);
    assert_eq!(native.mark_calls(), 1);
}

#[test]
fn test_non_owning_handles_are_not_scanned() {
    let (bridge, native) = manual_bridge();
    let plain = ManagedObject::new(ObjectKind::Object);
    handle(&bridge, &plain);

    let stats = bridge.collect().unwrap();
    assert_eq!(stats.owners_scanned, 0);
    assert_eq!(native.mark_calls(), 0);
}

#[test]
fn test_disabled_gc_defers_until_outermost_enable() {
    let (bridge, _native) = manual_bridge();
    assert_eq!(bridge.disable_gc(), 1);
    assert_eq!(bridge.disable_gc(), 2);

    assert!(bridge.collect().is_none());
    assert_eq!(bridge.trigger_cleanup(), CleanupRequest::Deferred);

    bridge.enable_gc();
    assert!(bridge.collect().is_none());
    assert_eq!(bridge.metrics().cleanup_passes, 0);

    bridge.enable_gc();
    assert!(bridge.quiesce(QUIESCE));
    let snap = bridge.metrics();
    assert_eq!(snap.cleanup_passes, 1);
    assert_eq!(snap.cleanup_deferred, 3);
    assert!(bridge.collect().is_some());
}

#[test]
fn test_enable_without_request_runs_nothing() {
    let (bridge, _native) = manual_bridge();
    bridge.disable_gc();
    bridge.enable_gc();
    assert!(bridge.quiesce(QUIESCE));
    assert_eq!(bridge.metrics().cleanup_passes, 0);
}

#[test]
#[should_panic(expected = "without a matching disable_gc")]
fn test_unbalanced_enable_panics() {
    let (bridge, _native) = manual_bridge();
    bridge.enable_gc();
}

#[test]
fn test_requests_coalesce() {
    let (bridge, _native) = manual_bridge();
    let requests = 100;
    for _ in 0..requests {
        let request = bridge.trigger_cleanup();
        assert!(matches!(
            request,
            CleanupRequest::Scheduled | CleanupRequest::Coalesced
        ));
    }
    assert!(bridge.quiesce(QUIESCE));

    let snap = bridge.metrics();
    assert_eq!(snap.cleanup_scheduled + snap.cleanup_coalesced, requests);
    assert!(snap.cleanup_passes >= 1);
    assert!(snap.cleanup_passes <= requests);
}

#[test]
fn test_release_hook_schedules_pass() {
    let native = Arc::new(RecordingAllocator::new());
    let bridge = Bridge::new(native).unwrap();
    drop(bridge.gil().acquire());
    assert!(bridge.quiesce(QUIESCE));
    assert!(bridge.metrics().cleanup_passes >= 1);
}

#[test]
fn test_mark_outside_pass_carries_object() {
    let (bridge, _native) = manual_bridge();
    let object = ManagedObject::new(ObjectKind::Object);
    let address = handle(&bridge, &object);
    let weak = Arc::downgrade(&object);

    bridge.mark(address);
    drop(object);
    assert_eq!(bridge.carried_roots(), 1);
    assert!(weak.upgrade().is_some());

    let stats = bridge.collect().unwrap();
    assert_eq!(stats.carried_released, 1);
    assert!(bridge.quiesce(QUIESCE));
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_allocate_managed_object_is_carried_until_pass() {
    let (bridge, native) = manual_bridge();
    let address = bridge.allocate_managed_object(ObjectKind::Hash).unwrap();
    assert!(native.is_live(address));
    assert!(matches!(bridge.resolve(address), Ok(Value::Object(_))));

    bridge.collect().unwrap();
    assert!(bridge.quiesce(QUIESCE));
    assert_eq!(native.free_count(address), 1);
}
