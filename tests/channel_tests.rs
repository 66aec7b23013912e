use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use epicars_client::{
    client::{
        Channel, ChannelSnapshot, ConnectOutcome, ConnectionReason, Event, Notification,
        NotificationSink, PutOutcome, PutRejection, ReadOutcome, RecordingSink, Registry,
        StateChange, SubscribeOutcome, SubscriptionState,
    },
    config::{ClientConfig, EnumNamePolicy},
    dbr::{DbrBasicType, DbrCategory, DbrType, DbrValue, ValueAccessMode},
    transport::{
        ErrorCondition, RequestKind,
        loopback::{LoopbackTransport, WireCall},
    },
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

/// A registry talking to a fresh loopback server, recording every notification
fn setup() -> (Registry, Arc<LoopbackTransport>, Arc<RecordingSink>) {
    setup_with(|config| config)
}

fn setup_with(
    configure: impl FnOnce(ClientConfig) -> ClientConfig,
) -> (Registry, Arc<LoopbackTransport>, Arc<RecordingSink>) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
    let transport = Arc::new(LoopbackTransport::new());
    let sink = RecordingSink::new();
    let config = ClientConfig::default()
        .with_timeout(Duration::from_secs(2))
        .with_sink(sink.clone());
    let registry = Registry::new(configure(config), transport.clone());
    (registry, transport, sink)
}

/// Wait until the channel's snapshot satisfies `condition`
async fn wait_for(
    channel: &Channel,
    condition: impl Fn(&ChannelSnapshot) -> bool,
) -> Arc<ChannelSnapshot> {
    let mut updates = channel.watch();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        updates.wait_for(|record| condition(record.snapshot.as_ref())),
    )
    .await
    .expect("Timed out waiting for channel state")
    .expect("Channel state sender dropped")
    .snapshot
    .clone();
    snapshot
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition never became true");
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_handles_tear_down_with_the_last_release() {
    let (registry, transport, sink) = setup();
    transport.add_pv("TEST:SHARED", 7i32).unwrap();

    let tasks: Vec<_> = ["TEST:SHARED", "TEST:SHARED.VAL"]
        .into_iter()
        .map(|name| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create(name) })
        })
        .collect();
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }
    let b = handles.pop().unwrap();
    let a = handles.pop().unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(registry.list_registered().len(), 1);
    assert_eq!(registry.describe("TEST:SHARED").unwrap().shares, 2);

    assert_eq!(a.connect().await, ConnectOutcome::Connected);
    assert!(b.snapshot().is_connected());
    // Either spelling goes on the wire as the bare record name
    let creates: Vec<_> = transport
        .wire_calls()
        .into_iter()
        .filter(|call| matches!(call, WireCall::CreateChannel(_)))
        .collect();
    assert_eq!(creates, vec![WireCall::CreateChannel("TEST:SHARED".into())]);

    a.dispose();
    assert_eq!(a.get().await, ReadOutcome::Disposed);
    a.dispose();
    assert_eq!(sink.count(|e| matches!(e, Event::DoubleDispose)), 1);
    assert!(registry.is_registered("TEST:SHARED"));
    assert!(
        !transport
            .wire_calls_for("TEST:SHARED")
            .contains(&WireCall::ClearChannel("TEST:SHARED".into()))
    );
    assert_eq!(
        b.get().await.value().and_then(|v| v.as_scalar::<i32>()),
        Some(7)
    );

    let c = b.clone();
    assert_eq!(registry.describe("TEST:SHARED").unwrap().shares, 2);
    drop(b);
    assert!(registry.is_registered("TEST:SHARED"));
    drop(c);
    assert!(!registry.is_registered("TEST:SHARED"));
    assert!(registry.list_registered().is_empty());
    let clears = transport
        .wire_calls_for("TEST:SHARED")
        .into_iter()
        .filter(|call| matches!(call, WireCall::ClearChannel(_)))
        .count();
    assert_eq!(clears, 1);
    assert_eq!(sink.count(|e| matches!(e, Event::Deregistered)), 1);
    eventually(|| transport.open_channels() == 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_names_never_reach_the_wire() {
    let (registry, transport, sink) = setup();
    let names = ["", "HAS SPACE", "A.B.C", "REC.lower", ".VAL", "REC.TOOLONG"];
    for name in names {
        let channel = registry.get_or_create(name);
        let snapshot = channel.snapshot();
        assert!(!snapshot.is_valid(), "{name:?} should be invalid");
        assert!(snapshot.validity.reason.is_some());
        assert_eq!(channel.get().await, ReadOutcome::InvalidChannel);
        assert_eq!(channel.put(1i32), PutOutcome::InvalidChannel);
        assert_eq!(channel.subscribe(), SubscribeOutcome::InvalidChannel);
        assert_eq!(channel.connect().await, ConnectOutcome::InvalidChannel);
        assert_eq!(
            channel.put_ack(1i32).await,
            PutOutcome::InvalidChannel
        );
    }
    assert!(transport.wire_calls().is_empty());
    assert_eq!(
        sink.count(|e| matches!(e, Event::OperationOnInvalid(_))),
        names.len() * 5
    );
    assert!(registry.list_registered().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn every_event_advances_the_sequence_by_one() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:SEQ", 1.5f64).unwrap();
    let channel = registry.get_or_create("TEST:SEQ");
    assert_eq!(channel.snapshot().sequence_number, 1);
    assert_eq!(channel.subscription_state(), SubscriptionState::NotSubscribed);

    assert_eq!(channel.connect().await, ConnectOutcome::Connected);
    let connected = channel.snapshot();
    assert_eq!(connected.sequence_number, 2);
    assert_eq!(connected.connection.reason, ConnectionReason::Established);
    let descriptor = connected.field_descriptor.as_ref().unwrap();
    assert_eq!(descriptor.field_type, DbrBasicType::Double);
    assert_eq!(descriptor.element_count, 1);
    assert!(descriptor.is_writable);

    assert_eq!(channel.subscribe(), SubscribeOutcome::Subscribed);
    assert_eq!(channel.subscribe(), SubscribeOutcome::AlreadySubscribed);
    let acquired = wait_for(&channel, ChannelSnapshot::has_value).await;
    assert_eq!(acquired.sequence_number, 3);
    eventually(|| channel.subscription_state() == SubscriptionState::Subscribed).await;

    transport.set_value("TEST:SEQ", 2.5f64).unwrap();
    let changed = wait_for(&channel, |s| {
        s.value.as_ref().and_then(|v| v.as_scalar::<f64>()) == Some(2.5)
    })
    .await;
    assert_eq!(changed.sequence_number, 4);
    let record = channel.state_record();
    assert!(matches!(record.change, Some(StateChange::ValueChanged(_))));
    assert_eq!(record.previous.as_ref().unwrap().sequence_number, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn requests_are_flushed_as_they_are_made() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:FLUSH", 3i16).unwrap();
    let channel = registry.get_or_create("TEST:FLUSH");
    assert_eq!(channel.connect().await, ConnectOutcome::Connected);
    transport.clear_wire_log();

    let started = Instant::now();
    assert_eq!(
        channel.get().await.value().and_then(|v| v.as_scalar::<i16>()),
        Some(3)
    );
    // Far less than the idle flush interval
    assert!(started.elapsed() < Duration::from_secs(1));
    let calls = transport.wire_calls();
    let get = calls
        .iter()
        .position(|call| matches!(call, WireCall::Get { .. }))
        .unwrap();
    assert_eq!(calls[get + 1], WireCall::Flush);
}

#[tokio::test(flavor = "multi_thread")]
async fn put_ack_waits_for_the_written_value() {
    let (registry, transport, sink) = setup();
    transport.add_pv("TEST:PUT", 0i32).unwrap();
    let channel = registry.get_or_create("TEST:PUT");
    assert_eq!(channel.connect().await, ConnectOutcome::Connected);

    assert_eq!(channel.put_ack(42i32).await, PutOutcome::Success);
    assert_eq!(
        channel.snapshot().value.as_ref().unwrap().as_scalar::<i32>(),
        Some(42)
    );
    assert_eq!(transport.value("TEST:PUT"), Some(DbrValue::Long(vec![42])));
    // Subscribed now, so this is answered from the cache
    assert_eq!(
        channel.get().await.value().and_then(|v| v.as_scalar::<i32>()),
        Some(42)
    );
    assert_eq!(sink.count(|e| matches!(e, Event::RedundantGet)), 1);

    // Strings are converted to the native type
    assert_eq!(channel.put_ack("17").await, PutOutcome::Success);
    assert_eq!(transport.value("TEST:PUT"), Some(DbrValue::Long(vec![17])));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_writes_return_without_waiting_for_a_value() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:REJECT", 5i32).unwrap();
    let channel = registry.get_or_create("TEST:REJECT");
    assert!(matches!(
        channel.connect_and_acquire_value().await,
        ReadOutcome::Success(_)
    ));
    transport
        .reject_writes("TEST:REJECT", Some(ErrorCondition::PutFail))
        .unwrap();
    let before = channel.snapshot().sequence_number;

    let started = Instant::now();
    assert_eq!(
        channel.put_ack(9i32).await,
        PutOutcome::RejectedByServer(ErrorCondition::PutFail)
    );
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        channel.put_async(9i32).await,
        PutOutcome::RejectedByServer(ErrorCondition::PutFail)
    );
    assert_eq!(transport.value("TEST:REJECT"), Some(DbrValue::Long(vec![5])));
    assert_eq!(channel.snapshot().sequence_number, before + 1);

    transport.reject_writes("TEST:REJECT", None).unwrap();
    assert_eq!(channel.put_async(9i32).await, PutOutcome::Success);
    assert_eq!(transport.value("TEST:REJECT"), Some(DbrValue::Long(vec![9])));
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_refused_locally() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:RO", 1i32).unwrap();
    transport.set_writable("TEST:RO", false).unwrap();
    transport.add_pv("TEST:RW", 1i32).unwrap();

    let unconnected = registry.get_or_create("TEST:RW");
    assert_eq!(
        unconnected.put(2i32),
        PutOutcome::RejectedLocally(PutRejection::NotConnected)
    );

    let read_only = registry.get_or_create("TEST:RO");
    assert_eq!(read_only.connect().await, ConnectOutcome::Connected);
    assert_eq!(
        read_only.put_async(2i32).await,
        PutOutcome::RejectedLocally(PutRejection::NotWritable)
    );

    assert_eq!(unconnected.connect().await, ConnectOutcome::Connected);
    assert_eq!(
        unconnected.put(DbrValue::Long(vec![1, 2, 3])),
        PutOutcome::RejectedLocally(PutRejection::TooManyElements)
    );
    assert_eq!(
        unconnected.put("not a number"),
        PutOutcome::RejectedLocally(PutRejection::NoConvert)
    );
    assert_eq!(unconnected.put(2i32), PutOutcome::Success);
    assert!(
        !transport
            .wire_calls_for("TEST:RO")
            .iter()
            .any(|call| matches!(call, WireCall::Put { .. }))
    );
    eventually(|| transport.value("TEST:RW") == Some(DbrValue::Long(vec![2]))).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn enum_names_are_learned_once() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:ENUM", DbrValue::Enum(vec![1])).unwrap();
    transport
        .set_enum_strings("TEST:ENUM", &["Off", "On", "Fault"])
        .unwrap();
    let channel = registry.get_or_create("TEST:ENUM");

    let first = channel.connect_and_acquire_value().await;
    assert_eq!(first.value().unwrap().enum_label(), Some("On"));
    let names: Vec<String> = ["Off", "On", "Fault"].map(String::from).to_vec();
    assert_eq!(channel.snapshot().enum_names(), Some(&names[..]));
    let control = u16::from(DbrType::new(DbrBasicType::Enum, DbrCategory::Control));
    assert!(transport.wire_calls_for("TEST:ENUM").contains(&WireCall::Get {
        name: "TEST:ENUM".into(),
        record_type: control,
    }));

    // Once known, names are not asked for again, and never replaced
    transport
        .set_enum_strings("TEST:ENUM", &["Zero", "One"])
        .unwrap();
    transport.clear_wire_log();
    let second = channel.get().await;
    assert_eq!(second.value().unwrap().enum_label(), Some("On"));
    assert_eq!(channel.snapshot().enum_names(), Some(&names[..]));
    let basic = u16::from(DbrType::new(DbrBasicType::Enum, DbrCategory::Basic));
    assert!(transport.wire_calls_for("TEST:ENUM").contains(&WireCall::Get {
        name: "TEST:ENUM".into(),
        record_type: basic,
    }));

    assert_eq!(channel.put_async("Fault").await, PutOutcome::Success);
    assert_eq!(transport.value("TEST:ENUM"), Some(DbrValue::Enum(vec![2])));
}

#[tokio::test(flavor = "multi_thread")]
async fn timeouts_are_outcomes_and_late_replies_are_absorbed() {
    let (registry, transport, sink) = setup();
    transport.add_pv("TEST:SLOW", 5i16).unwrap();

    let missing = registry.get_or_create("TEST:MISSING");
    assert_eq!(
        missing.connect_within(Duration::from_millis(100)).await,
        ConnectOutcome::Timeout
    );
    assert_eq!(missing.get().await, ReadOutcome::NeverConnected);

    let channel = registry.get_or_create("TEST:SLOW");
    assert_eq!(channel.connect().await, ConnectOutcome::Connected);
    transport.hold_responses(true);
    let started = Instant::now();
    assert_eq!(
        channel.get_within(Duration::from_millis(200)).await,
        ReadOutcome::Timeout
    );
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!channel.snapshot().has_value());

    transport.hold_responses(false);
    eventually(|| {
        sink.count(|e| matches!(e, Event::LateCompletion(RequestKind::Get(_)))) == 1
    })
    .await;
    // The late value still lands in the snapshot
    let snapshot = wait_for(&channel, ChannelSnapshot::has_value).await;
    assert_eq!(snapshot.value.as_ref().unwrap().as_scalar::<i16>(), Some(5));
    assert!(snapshot.is_valid());
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnection_keeps_the_last_value() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:LINK", 3i32).unwrap();
    let channel = registry.get_or_create("TEST:LINK");
    assert_eq!(channel.subscribe(), SubscribeOutcome::Deferred);
    assert_eq!(
        channel
            .connect_and_acquire_value()
            .await
            .value()
            .and_then(|v| v.as_scalar::<i32>()),
        Some(3)
    );

    transport.drop_connection("TEST:LINK").unwrap();
    let lost = wait_for(&channel, |s| !s.is_connected()).await;
    assert_eq!(lost.connection.reason, ConnectionReason::Lost);
    assert_eq!(lost.value.as_ref().unwrap().as_scalar::<i32>(), Some(3));
    assert_eq!(
        channel.put(4i32),
        PutOutcome::RejectedLocally(PutRejection::NotConnected)
    );

    transport.restore_connection("TEST:LINK").unwrap();
    let restored = wait_for(&channel, ChannelSnapshot::is_connected).await;
    assert_eq!(restored.connection.reason, ConnectionReason::Restored);
    assert!(restored.field_descriptor.is_some());

    transport.set_value("TEST:LINK", 11i32).unwrap();
    wait_for(&channel, |s| {
        s.value.as_ref().and_then(|v| v.as_scalar::<i32>()) == Some(11)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_listeners_are_isolated() {
    let (registry, transport, sink) = setup();
    transport.add_pv("TEST:LISTEN", 1i32).unwrap();
    let channel = registry.get_or_create("TEST:LISTEN");

    let calls = Arc::new(AtomicUsize::new(0));
    let _bad = channel.on_state_changed(|_| panic!("listener failure"));
    let counter = calls.clone();
    let good = channel.on_state_changed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(channel.connect().await, ConnectOutcome::Connected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        sink.count(|e| matches!(e, Event::ListenerPanicked(m) if m == "listener failure")),
        1
    );
    let snapshot = channel.snapshot();
    assert!(snapshot.is_valid());
    assert_eq!(snapshot.sequence_number, 2);

    drop(good);
    assert!(matches!(channel.get().await, ReadOutcome::Success(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(channel.snapshot().sequence_number, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn disposal_ends_waits_and_late_callbacks_are_unrouted() {
    let (registry, transport, sink) = setup();
    transport.add_pv("TEST:GONE", 1i32).unwrap();
    let channel = registry.get_or_create("TEST:GONE");
    assert_eq!(channel.connect().await, ConnectOutcome::Connected);

    transport.hold_responses(true);
    let waiting = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.get_within(Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.deregister_all();
    assert_eq!(waiting.await.unwrap(), ReadOutcome::Disposed);
    assert!(channel.is_disposed());
    assert_eq!(channel.subscribe(), SubscribeOutcome::Disposed);

    transport.hold_responses(false);
    eventually(|| {
        sink.count(|e| matches!(e, Event::UnroutedCallback(RequestKind::Get(_)))) == 1
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_surprises_invalidate_the_channel() {
    let (registry, transport, sink) = setup();
    transport.add_pv("TEST:ODD", 1i32).unwrap();
    transport.set_reported_type("TEST:ODD", Some(99)).unwrap();
    let channel = registry.get_or_create("TEST:ODD");
    assert_eq!(channel.connect().await, ConnectOutcome::InvalidChannel);
    assert!(!channel.snapshot().is_valid());
    assert_eq!(sink.count(|e| matches!(e, Event::UnknownFieldType(99))), 1);
    transport.clear_wire_log();
    assert_eq!(channel.get().await, ReadOutcome::InvalidChannel);
    assert!(transport.wire_calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_is_only_requested_for_the_value_field() {
    let (registry, transport, sink) = setup();
    transport.add_pv("MOTOR", 2.0f64).unwrap();
    transport.add_pv("MOTOR.DESC", "Sample stage").unwrap();

    let desc = registry.get_or_create_with("MOTOR.DESC", ValueAccessMode::WithControl);
    assert_eq!(desc.access_mode(), ValueAccessMode::ValueOnly);
    assert!(desc.snapshot().is_valid());
    assert_eq!(
        sink.count(|e| matches!(e, Event::AccessModeDowngraded { field } if field == "DESC")),
        1
    );
    let value = desc.connect_and_acquire_value().await;
    assert_eq!(value.value().unwrap().to_string(), "Sample stage");

    let motor = registry.get_or_create_with("MOTOR", ValueAccessMode::WithStatus);
    assert_eq!(motor.access_mode(), ValueAccessMode::WithStatus);
    let value = motor.connect_and_acquire_value().await;
    assert!(value.value().unwrap().alarm.is_some());
}

#[tokio::test]
async fn threads_move_between_contexts() {
    let (first, first_transport, first_sink) = setup();
    let (second, second_transport, second_sink) = setup();
    first_transport.add_pv("TEST:CTX", 1i32).unwrap();
    second_transport.add_pv("TEST:CTX", 2i32).unwrap();
    assert_ne!(first.context_id(), second.context_id());

    let one = first.get_or_create("TEST:CTX");
    let two = second.get_or_create("TEST:CTX");
    assert_eq!(one.connect().await, ConnectOutcome::Connected);
    assert_eq!(two.connect().await, ConnectOutcome::Connected);
    assert_eq!(
        one.get().await.value().and_then(|v| v.as_scalar::<i32>()),
        Some(1)
    );
    assert_eq!(
        two.get().await.value().and_then(|v| v.as_scalar::<i32>()),
        Some(2)
    );
    assert!(first_sink.count(|e| matches!(e, Event::ContextReattached { .. })) >= 1);
    assert!(second_sink.count(|e| matches!(e, Event::ContextReattached { .. })) >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn notifications_are_broadcast() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:FEED", 1i32).unwrap();
    let mut feed = registry.subscribe_notifications();
    let channel = registry.get_or_create("TEST:FEED");
    assert_eq!(channel.connect().await, ConnectOutcome::Connected);
    drop(channel);

    let events: Vec<_> = feed
        .drain()
        .into_iter()
        .filter(|n| n.pv == "TEST:FEED")
        .map(|n| n.event)
        .collect();
    assert!(events.contains(&Event::Registered));
    assert!(events.contains(&Event::ConnectRequested));
    assert_eq!(events.last(), Some(&Event::Deregistered));
}

#[tokio::test(flavor = "multi_thread")]
async fn unbounded_timeouts_never_run_out() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:PATIENT", 3i32).unwrap();
    let channel = registry.get_or_create("TEST:PATIENT");

    let value = channel.connect_and_acquire_value_within(Duration::MAX).await;
    assert_eq!(value.value().and_then(|v| v.as_scalar::<i32>()), Some(3));
    assert_eq!(
        channel.put_ack_within(5i32, Duration::MAX).await,
        PutOutcome::Success
    );
    assert_eq!(transport.value("TEST:PATIENT"), Some(DbrValue::Long(vec![5])));
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_writes_leave_nothing_pending() {
    let (registry, transport, _sink) = setup();
    transport.add_pv("TEST:STUBBORN", 1i32).unwrap();
    transport
        .reject_writes("TEST:STUBBORN", Some(ErrorCondition::PutFail))
        .unwrap();
    let channel = registry.get_or_create("TEST:STUBBORN");
    let pending = || registry.describe("TEST:STUBBORN").unwrap().pending_requests;
    assert_eq!(channel.connect().await, ConnectOutcome::Connected);

    for attempt in 0..10i32 {
        assert_eq!(
            channel.put_ack(attempt).await,
            PutOutcome::RejectedByServer(ErrorCondition::PutFail)
        );
    }
    assert_eq!(pending(), 0);

    // Written but never answered
    transport.hold_responses(true);
    assert_eq!(
        channel.put_ack_within(2i32, Duration::from_millis(100)).await,
        PutOutcome::Timeout
    );
    assert_eq!(pending(), 0);
    transport.hold_responses(false);

    transport.reject_writes("TEST:STUBBORN", None).unwrap();
    assert_eq!(channel.put_ack(7i32).await, PutOutcome::Success);
    assert_eq!(pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_reads_are_unavailable() {
    let (registry, transport, sink) = setup();
    transport.add_pv("TEST:SECRET", 1i32).unwrap();
    transport
        .reject_reads("TEST:SECRET", Some(ErrorCondition::NoRdAccess))
        .unwrap();
    let channel = registry.get_or_create("TEST:SECRET");
    assert_eq!(channel.connect().await, ConnectOutcome::Connected);

    assert!(matches!(channel.get().await, ReadOutcome::Unavailable));
    assert_eq!(
        sink.count(|e| *e == Event::ServerError(ErrorCondition::NoRdAccess)),
        1
    );
    assert!(channel.snapshot().is_valid());
    assert!(!channel.snapshot().has_value());

    transport.reject_reads("TEST:SECRET", None).unwrap();
    assert_eq!(
        channel.get().await.value().and_then(|v| v.as_scalar::<i32>()),
        Some(1)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn enum_names_can_follow_the_server() {
    let (registry, transport, _sink) = setup_with(|config| {
        config
            .with_always_request_enum_names(true)
            .with_enum_name_policy(EnumNamePolicy::RefreshOnEveryControlResponse)
    });
    transport.add_pv("TEST:MODE", DbrValue::Enum(vec![0])).unwrap();
    transport
        .set_enum_strings("TEST:MODE", &["Manual", "Auto"])
        .unwrap();
    let channel = registry.get_or_create("TEST:MODE");
    let control = u16::from(DbrType::new(DbrBasicType::Enum, DbrCategory::Control));
    let names = |labels: &[&str]| labels.iter().map(|l| l.to_string()).collect::<Vec<_>>();

    let first = channel.connect_and_acquire_value().await;
    assert_eq!(first.value().unwrap().enum_label(), Some("Manual"));

    // Names are known, but still asked for, and replaced
    transport
        .set_enum_strings("TEST:MODE", &["Local", "Remote"])
        .unwrap();
    transport.clear_wire_log();
    let second = channel.get().await;
    assert_eq!(second.value().unwrap().enum_label(), Some("Local"));
    assert_eq!(
        channel.snapshot().enum_names(),
        Some(&names(&["Local", "Remote"])[..])
    );
    assert!(transport.wire_calls_for("TEST:MODE").contains(&WireCall::Get {
        name: "TEST:MODE".into(),
        record_type: control,
    }));

    // Subscriptions are made at control level too
    assert_eq!(channel.subscribe(), SubscribeOutcome::Subscribed);
    assert!(
        transport
            .wire_calls_for("TEST:MODE")
            .contains(&WireCall::Subscribe {
                name: "TEST:MODE".into(),
                record_type: control,
            })
    );
    eventually(|| channel.subscription_state() == SubscriptionState::Subscribed).await;
    transport
        .set_enum_strings("TEST:MODE", &["Hand", "Machine"])
        .unwrap();
    transport.set_value("TEST:MODE", DbrValue::Enum(vec![1])).unwrap();
    let snapshot = wait_for(&channel, |s| {
        s.value.as_ref().and_then(|v| v.enum_label()) == Some("Machine")
    })
    .await;
    assert_eq!(
        snapshot.enum_names(),
        Some(&names(&["Hand", "Machine"])[..])
    );
}

/// Looks at the registry from inside every notification
#[derive(Default)]
struct InspectingSink {
    registry: OnceLock<Registry>,
    inspected: AtomicUsize,
}

impl NotificationSink for InspectingSink {
    fn notify(&self, _notification: &Notification) {
        if let Some(registry) = self.registry.get() {
            let _ = registry.list_registered();
            let _ = registry.is_registered("TEST:LOOKED_AT");
            self.inspected.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sinks_may_inspect_the_registry() {
    let transport = Arc::new(LoopbackTransport::new());
    let sink = Arc::new(InspectingSink::default());
    let registry = Registry::new(ClientConfig::default().with_sink(sink.clone()), transport);
    let _ = sink.registry.set(registry.clone());

    let creating = tokio::task::spawn_blocking(move || {
        let _value = registry.get_or_create("TEST:LOOKED_AT");
        let _desc =
            registry.get_or_create_with("TEST:LOOKED_AT.DESC", ValueAccessMode::WithControl);
        let _shared = registry.get_or_create("TEST:LOOKED_AT");
        registry.list_registered().len()
    });
    let registered = tokio::time::timeout(Duration::from_secs(5), creating)
        .await
        .expect("Creating channels never finished")
        .unwrap();
    assert_eq!(registered, 2);
    // Registered twice, the downgrade, and both deregistrations at least
    assert!(sink.inspected.load(Ordering::SeqCst) >= 5);
}
