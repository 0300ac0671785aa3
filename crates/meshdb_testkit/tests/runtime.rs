//! Integration tests for the process runtime.

use meshdb_core::{
    DbError, DbProperties, ListenerAction, PermissionCheckCallback, PermissionCheckCallbackV3,
    PermissionCheckParam, ProcessSystemApiAdapter, RuntimeConfig, RuntimeContext, SecurityLabel,
    SecurityOption, StoreStatusNotifier, TimeOffset, TimerAction, TimerFinalizer,
    UserChangeEvent,
};
use meshdb_testkit::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn runtime() -> Arc<RuntimeContext> {
    RuntimeContext::new(RuntimeConfig::new().task_threads(2, 4))
}

fn counting_action(counter: &Arc<AtomicUsize>) -> TimerAction {
    let counter = Arc::clone(counter);
    Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn queued_tasks_run_in_order() {
    let runtime = runtime();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..20 {
        let seen = Arc::clone(&seen);
        runtime
            .schedule_queued_task(
                "ordered",
                Box::new(move || {
                    thread::sleep(Duration::from_millis(1));
                    seen.lock().push(i);
                }),
            )
            .unwrap();
    }
    assert!(wait_until(WAIT, || seen.lock().len() == 20));
    assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    assert!(runtime.is_task_pool_started());

    runtime.stop_task_pool();
    assert!(!runtime.is_task_pool_started());
    // The next schedule starts a fresh pool.
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    runtime
        .schedule_task(Box::new(move || flag.store(true, Ordering::SeqCst)))
        .unwrap();
    assert!(wait_until(WAIT, || ran.load(Ordering::SeqCst)));
}

#[test]
fn repeating_timer_stops_when_removed() {
    let runtime = runtime();
    let fired = Arc::new(AtomicUsize::new(0));
    let finalized = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finalized);
    let finalizer: TimerFinalizer = Box::new(move || flag.store(true, Ordering::SeqCst));

    let timer = runtime
        .set_timer(10, counting_action(&fired), Some(finalizer))
        .unwrap();
    assert!(runtime.is_event_loop_started());
    assert!(wait_until(WAIT, || fired.load(Ordering::SeqCst) >= 3));

    runtime.remove_timer(timer, true);
    assert!(wait_until(WAIT, || finalized.load(Ordering::SeqCst)));
    let after = fired.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), after);

    // Unknown ids are ignored.
    runtime.remove_timer(timer, true);
    runtime.remove_timer(u64::MAX, false);
}

#[test]
fn failing_timer_action_removes_timer() {
    let runtime = runtime();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let action: TimerAction = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(DbError::internal("done"))
    });
    let timer = runtime.set_timer(5, action, None).unwrap();
    thread::sleep(Duration::from_millis(80));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.modify_timer(timer, 10), Err(DbError::NoSuchEntry));
}

#[test]
fn timer_arguments_are_validated() {
    let runtime = runtime();
    let fired = Arc::new(AtomicUsize::new(0));
    assert!(matches!(
        runtime.set_timer(-1, counting_action(&fired), None),
        Err(DbError::InvalidArgs { .. })
    ));
    // Modifying before the loop exists finds nothing.
    assert_eq!(runtime.modify_timer(1, 10), Err(DbError::NoSuchEntry));
}

#[test]
fn user_change_reaches_every_kind() {
    let runtime = runtime();
    // No monitor yet: nothing to do.
    runtime.notify_user_changed();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut listeners = Vec::new();
    for event in UserChangeEvent::ALL {
        let seen = Arc::clone(&seen);
        let action: ListenerAction<UserChangeEvent> =
            Arc::new(move |event: &UserChangeEvent| seen.lock().push(*event));
        listeners.push(runtime.register_user_changed_listener(action, event).unwrap());
    }

    runtime.notify_user_changed();
    assert_eq!(seen.lock().len(), 3);
    for event in UserChangeEvent::ALL {
        assert!(seen.lock().contains(&event));
    }

    drop(listeners);
    runtime.notify_user_changed();
    assert_eq!(seen.lock().len(), 3);
}

#[test]
fn time_change_listeners_and_monitor_lifetime() {
    let runtime = runtime();
    runtime.notify_timestamp_changed(5);
    assert!(!runtime.is_time_tick_monitor_valid());

    let offsets = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&offsets);
    let action: ListenerAction<TimeOffset> =
        Arc::new(move |offset: &TimeOffset| sink.lock().push(*offset));
    let listener = runtime.register_time_changed_listener(action).unwrap();
    assert!(runtime.is_time_tick_monitor_valid());

    runtime.notify_timestamp_changed(1_500);
    assert_eq!(*offsets.lock(), vec![1_500]);

    // Still listened to: the monitor stays.
    runtime.stop_time_tick_monitor_if_need();
    assert!(runtime.is_time_tick_monitor_valid());

    drop(listener);
    runtime.stop_time_tick_monitor_if_need();
    assert!(!runtime.is_time_tick_monitor_valid());
}

#[test]
fn lock_status_follows_adapter() {
    let runtime = runtime();
    let adapter = Arc::new(MockSystemApiAdapter::new());
    runtime
        .set_process_system_api_adapter(Some(adapter.clone()))
        .unwrap();

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let action: ListenerAction<bool> = Arc::new(move |locked: &bool| sink.lock().push(*locked));
    let _listener = runtime.register_lock_status_lister(action).unwrap();
    assert!(adapter.has_event_callback());

    adapter.set_locked(true);
    assert!(runtime.is_access_controlled());
    adapter.set_locked(false);
    assert_eq!(*states.lock(), vec![true, false]);

    // A replacement adapter takes over the event registration.
    let replacement = Arc::new(MockSystemApiAdapter::new());
    runtime
        .set_process_system_api_adapter(Some(replacement.clone()))
        .unwrap();
    replacement.set_locked(true);
    assert_eq!(*states.lock(), vec![true, false, true]);
}

#[test]
fn rejected_event_registration_is_reported() {
    let runtime = runtime();
    let adapter = Arc::new(MockSystemApiAdapter::new());
    adapter.reject_event_registration(true);
    runtime.set_process_system_api_adapter(Some(adapter)).unwrap();
    let action: ListenerAction<bool> = Arc::new(|_: &bool| {});
    assert!(matches!(
        runtime.register_lock_status_lister(action),
        Err(DbError::SystemApiAdapterCall { .. })
    ));
}

#[test]
fn security_option_needs_adapter_and_existing_path() {
    let runtime = runtime();
    let dir = TempDataDir::new();
    let option = SecurityOption::new(SecurityLabel::S2, SecurityOption::ECE);
    assert_eq!(
        runtime.set_security_option(dir.path(), option),
        Err(DbError::NotSupport)
    );
    assert_eq!(runtime.get_security_option(dir.path()), Err(DbError::NotSupport));
    assert!(runtime.check_device_security_ability("peer", option));

    let adapter = Arc::new(MockSystemApiAdapter::new());
    runtime
        .set_process_system_api_adapter(Some(adapter.clone()))
        .unwrap();
    assert_eq!(
        runtime.set_security_option(&dir.path().join("missing"), option),
        Err(DbError::NotSupport)
    );
    runtime.set_security_option(dir.path(), option).unwrap();
    let real = std::fs::canonicalize(dir.path()).unwrap();
    assert_eq!(runtime.get_security_option(&real).unwrap(), option);

    // A not-set label is accepted and changes nothing.
    runtime
        .set_security_option(dir.path(), SecurityOption::default())
        .unwrap();
    assert_eq!(adapter.get_security_option(&real).unwrap(), option);

    adapter.deny_device("old-phone");
    assert!(!runtime.check_device_security_ability("old-phone", option));
}

#[test]
fn unreadable_flag_defaults_except_for_s3() {
    let runtime = runtime();
    let adapter = Arc::new(MockSystemApiAdapter::new());
    runtime
        .set_process_system_api_adapter(Some(adapter.clone()))
        .unwrap();
    let dir = TempDataDir::new();

    let s2 = dir.path().join("s2");
    adapter.put_label(
        &s2,
        SecurityOption::new(SecurityLabel::S2, SecurityOption::INVALID_FLAG),
    );
    assert_eq!(
        runtime.get_security_option(&s2).unwrap(),
        SecurityOption::new(SecurityLabel::S2, SecurityOption::ECE)
    );

    let s3 = dir.path().join("s3");
    adapter.put_label(
        &s3,
        SecurityOption::new(SecurityLabel::S3, SecurityOption::INVALID_FLAG),
    );
    assert!(matches!(
        runtime.get_security_option(&s3),
        Err(DbError::SystemApiAdapterCall { .. })
    ));
}

#[test]
fn communicator_adapter_is_installed_once() {
    let runtime = runtime();
    assert!(matches!(
        runtime.local_identity(),
        Err(DbError::NotInit { .. })
    ));
    assert!(!runtime.is_communicator_aggregator_valid());

    let adapter = Arc::new(MockCommunicatorAdapter::new("device-a"));
    runtime.set_communicator_adapter(adapter.clone()).unwrap();
    assert_eq!(adapter.created(), 1);
    assert!(adapter.aggregator().has_callbacks());
    assert_eq!(runtime.local_identity().unwrap(), "device-a");

    assert_eq!(
        runtime.set_communicator_adapter(Arc::new(MockCommunicatorAdapter::new("device-b"))),
        Err(DbError::NotSupport)
    );
    assert_eq!(runtime.local_identity().unwrap(), "device-a");
}

#[test]
fn newest_permission_check_wins() {
    let runtime = runtime();
    let param = PermissionCheckParam {
        user_id: "u".into(),
        app_id: "app".into(),
        store_id: "s".into(),
        device_id: "peer".into(),
        ..PermissionCheckParam::default()
    };
    runtime.run_permission_check(&param, 1).unwrap();

    let deny_all: PermissionCheckCallback = Arc::new(|_: &str, _: &str, _: &str, _: u8| false);
    runtime.set_permission_check_callback(Some(deny_all));
    assert_eq!(runtime.run_permission_check(&param, 1), Err(DbError::NotPermit));

    let by_device: PermissionCheckCallbackV3 =
        Arc::new(|param: &PermissionCheckParam, _: u8| param.device_id == "peer");
    runtime.set_permission_check_callback_v3(Some(by_device));
    runtime.run_permission_check(&param, 1).unwrap();
    let stranger = PermissionCheckParam {
        device_id: "stranger".into(),
        ..param.clone()
    };
    assert_eq!(runtime.run_permission_check(&stranger, 1), Err(DbError::NotPermit));

    runtime.set_permission_check_callback_v3(None);
    assert_eq!(runtime.run_permission_check(&param, 1), Err(DbError::NotPermit));
}

#[test]
fn store_status_changes_are_delivered_async() {
    let runtime = runtime();
    // Nothing installed: silently dropped.
    runtime.notify_database_status_change("u", "app", "s", "peer", true);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let notifier: StoreStatusNotifier =
        Arc::new(move |_: &str, _: &str, store: &str, device: &str, online: bool| {
            sink.lock().push((store.to_owned(), device.to_owned(), online));
        });
    runtime.set_store_status_notifier(Some(notifier));
    runtime.notify_database_status_change("u", "app", "s", "peer", true);
    assert!(wait_until(WAIT, || seen.lock().len() == 1));
    assert_eq!(seen.lock()[0], ("s".to_owned(), "peer".to_owned(), true));
}

#[test]
fn identity_helpers() {
    let runtime = runtime();
    runtime.set_process_label("proc");
    assert_eq!(runtime.process_label(), "proc");
    let first = runtime.generate_session_id();
    let second = runtime.generate_session_id();
    assert_ne!(first, 0);
    assert_ne!(first, second);

    let props = DbProperties::kv("u", "app", "s");
    assert!(runtime.is_syncer_need_active(&props));
    assert!(runtime.permission_check_param(&props).is_empty());
}
