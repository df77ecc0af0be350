mod support;

use std::collections::BTreeMap;
use std::sync::Arc;

use support::*;
use telepathy_bus::error::names;
use telepathy_bus::{DBusError, MockBus, Variant};
use telepathy_client::constants::{
    connection_status, connection_status_reason, CONTACT_ATTR_ALIAS, CONTACT_ATTR_ID,
    IFACE_CONNECTION, IFACE_CONNECTION_ALIASING, IFACE_CONNECTION_CONTACTS,
};
use telepathy_client::feature::features;
use telepathy_client::{Connection, ConnectionEvent, Features, ReadyObject};

fn connection(bus: &Arc<MockBus>) -> Arc<Connection> {
    Connection::with_config(bus.clone(), CONN_BUS_NAME, CONN_PATH, config())
}

/// Contact attributes for every requested handle; handle 99 is rejected.
fn serve_contact_attributes(bus: &MockBus) {
    bus.on_call(CONN_PATH, IFACE_CONNECTION_CONTACTS, "GetContactAttributes", |call| {
        let handles = call
            .args
            .first()
            .and_then(Variant::as_u32_list)
            .unwrap_or_default();
        let attributes: BTreeMap<u32, Variant> = handles
            .iter()
            .filter(|handle| **handle != 99)
            .map(|handle| {
                let attrs = props([
                    (CONTACT_ATTR_ID, Variant::from(contact_id(*handle))),
                    (CONTACT_ATTR_ALIAS, Variant::from(format!("Contact {handle}"))),
                ]);
                (*handle, Variant::Map(attrs))
            })
            .collect();
        Ok(vec![Variant::U32Map(attributes)])
    });
}

#[tokio::test]
async fn core_comes_from_one_property_fetch() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    fake_connection_service(&bus);
    let connection = connection(&bus);

    let first = connection.become_ready(Features::new());
    let second = connection.become_ready(features([Connection::FEATURE_CORE]));
    first.await.expect("ready");
    second.await.expect("ready");

    assert_eq!(connection.status(), connection_status::CONNECTED);
    assert_eq!(connection.self_handle(), SELF_HANDLE);
    assert!(connection.has_immortal_handles());
    assert_eq!(members_on(&bus, CONN_PATH), vec!["GetAll"]);
}

#[tokio::test]
async fn legacy_calls_when_property_fetch_fails() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    bus.reply(
        CONN_PATH,
        IFACE_CONNECTION,
        "GetStatus",
        vec![Variant::U32(connection_status::CONNECTED)],
    );
    bus.reply(
        CONN_PATH,
        IFACE_CONNECTION,
        "GetInterfaces",
        vec![Variant::StrList(vec![IFACE_CONNECTION_CONTACTS.to_owned()])],
    );
    bus.reply(CONN_PATH, IFACE_CONNECTION, "GetSelfHandle", vec![Variant::U32(7)]);
    let connection = connection(&bus);

    connection.become_ready(Features::new()).await.expect("ready");

    assert_eq!(
        members_on(&bus, CONN_PATH),
        vec!["GetAll", "GetStatus", "GetInterfaces", "GetSelfHandle"]
    );
    assert_eq!(connection.self_handle(), 7);
    assert!(connection.has_interface(IFACE_CONNECTION_CONTACTS));
}

#[tokio::test]
async fn connecting_status_skips_interface_and_self_handle_calls() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    bus.reply(
        CONN_PATH,
        IFACE_CONNECTION,
        "GetStatus",
        vec![Variant::U32(connection_status::CONNECTING)],
    );
    let connection = connection(&bus);

    connection.become_ready(Features::new()).await.expect("ready");

    assert_eq!(members_on(&bus, CONN_PATH), vec!["GetAll", "GetStatus"]);
    assert_eq!(connection.status(), connection_status::CONNECTING);
    assert!(connection.interfaces().is_empty());
}

#[tokio::test]
async fn failed_status_query_fails_core() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    bus.fail(
        CONN_PATH,
        IFACE_CONNECTION,
        "GetStatus",
        DBusError::disconnected("gone"),
    );
    let connection = connection(&bus);

    let err = connection
        .become_ready(Features::new())
        .await
        .expect_err("core fails");
    assert_eq!(err.name, names::DISCONNECTED);
    assert!(!connection.is_ready(&Features::new()));
    assert!(connection.missing_features().contains(&Connection::FEATURE_CORE));
}

#[tokio::test]
async fn disconnection_invalidates_with_mapped_error() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    fake_connection_service(&bus);
    let connection = ready_connection(&bus, config()).await;
    let mut events = connection.events();

    bus.emit(
        CONN_PATH,
        IFACE_CONNECTION,
        "StatusChanged",
        vec![
            Variant::U32(connection_status::DISCONNECTED),
            Variant::U32(connection_status_reason::AUTHENTICATION_FAILED),
        ],
    );

    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::StatusChanged {
            status: connection_status::DISCONNECTED,
            reason: connection_status_reason::AUTHENTICATION_FAILED,
        }
    );
    let err = connection.dbus_proxy().invalidated().await;
    assert_eq!(err.name, names::AUTHENTICATION_FAILED);
    assert!(!connection.is_valid());
    let err = connection
        .become_ready(Features::new())
        .await
        .expect_err("invalidated proxy");
    assert_eq!(err.name, names::AUTHENTICATION_FAILED);
}

#[tokio::test]
async fn self_contact_follows_self_handle() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    bus.set_properties(
        CONN_PATH,
        IFACE_CONNECTION,
        props([
            ("Status", Variant::U32(connection_status::CONNECTED)),
            (
                "Interfaces",
                Variant::StrList(vec![
                    IFACE_CONNECTION_CONTACTS.to_owned(),
                    IFACE_CONNECTION_ALIASING.to_owned(),
                ]),
            ),
            ("SelfHandle", Variant::U32(SELF_HANDLE)),
            ("HasImmortalHandles", Variant::Bool(true)),
        ]),
    );
    serve_contact_attributes(&bus);
    let connection = connection(&bus);

    connection
        .become_ready(features([Connection::FEATURE_SELF_CONTACT]))
        .await
        .expect("self contact ready");
    let me = connection.self_contact().expect("self contact");
    assert_eq!(me.id(), contact_id(SELF_HANDLE));
    assert_eq!(me.alias(), "Contact 1");

    let mut events = connection.events();
    bus.emit(
        CONN_PATH,
        IFACE_CONNECTION,
        "SelfHandleChanged",
        vec![Variant::U32(2)],
    );
    assert_eq!(next_event(&mut events).await, ConnectionEvent::SelfHandleChanged(2));
    assert_eq!(next_event(&mut events).await, ConnectionEvent::SelfContactChanged);
    let me = connection.self_contact().expect("new self contact");
    assert_eq!(me.handle(), 2);
}

#[tokio::test]
async fn contacts_are_shared_and_invalid_handles_reported() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    bus.set_properties(
        CONN_PATH,
        IFACE_CONNECTION,
        props([
            ("Status", Variant::U32(connection_status::CONNECTED)),
            (
                "Interfaces",
                Variant::StrList(vec![IFACE_CONNECTION_CONTACTS.to_owned()]),
            ),
            ("SelfHandle", Variant::U32(SELF_HANDLE)),
            ("HasImmortalHandles", Variant::Bool(true)),
        ]),
    );
    serve_contact_attributes(&bus);
    let connection = connection(&bus);
    connection.become_ready(Features::new()).await.expect("ready");

    let first = connection
        .contacts_for_handles(&[5, 99, 5])
        .await
        .expect("resolve");
    assert_eq!(first.contacts.len(), 1);
    assert_eq!(first.invalid_handles, vec![99]);

    let second = connection.contacts_for_handles(&[5]).await.expect("resolve");
    let (a, b) = (first.get(5).expect("first"), second.get(5).expect("second"));
    assert!(Arc::ptr_eq(a, b));
}

#[tokio::test]
async fn inspect_falls_back_to_single_handles() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    fake_connection_service(&bus);
    bus.on_call(CONN_PATH, IFACE_CONNECTION, "InspectHandles", |call| {
        let handles = call
            .args
            .get(1)
            .and_then(Variant::as_u32_list)
            .unwrap_or_default();
        if handles.contains(&13) {
            return Err(DBusError::new(names::INVALID_HANDLE, "no such handle"));
        }
        Ok(vec![Variant::StrList(
            handles.iter().map(|handle| contact_id(*handle)).collect(),
        )])
    });
    let connection = ready_connection(&bus, config()).await;

    let resolved = connection
        .contacts_for_handles(&[4, 13])
        .await
        .expect("resolve");
    assert_eq!(resolved.invalid_handles, vec![13]);
    assert_eq!(resolved.get(4).map(|contact| contact.id().to_owned()), Some(contact_id(4)));
    assert_eq!(bus.call_count("InspectHandles"), 3);

    connection.inject_contact_ids([(20, "known@example.com".to_owned())]);
    let resolved = connection.contacts_for_handles(&[20]).await.expect("resolve");
    assert_eq!(resolved.contacts[0].id(), "known@example.com");
    assert_eq!(bus.call_count("InspectHandles"), 3);
}

#[tokio::test]
async fn release_waits_for_contact_attributes_that_hold_the_handle() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    bus.set_properties(
        CONN_PATH,
        IFACE_CONNECTION,
        props([
            ("Status", Variant::U32(connection_status::CONNECTED)),
            (
                "Interfaces",
                Variant::StrList(vec![IFACE_CONNECTION_CONTACTS.to_owned()]),
            ),
            ("SelfHandle", Variant::U32(SELF_HANDLE)),
            ("HasImmortalHandles", Variant::Bool(false)),
        ]),
    );
    serve_contact_attributes(&bus);
    bus.reply(CONN_PATH, IFACE_CONNECTION, "ReleaseHandles", Vec::new());
    let connection = connection(&bus);
    connection.become_ready(Features::new()).await.expect("ready");

    let first = connection.contacts_for_handles(&[5]).await.expect("resolve");
    assert_eq!(first.contacts.len(), 1);
    // Queues 5 for release; the sweep runs once this task yields.
    drop(first);
    bus.pause("GetContactAttributes");

    let (second, ()) = tokio::join!(connection.contacts_for_handles(&[5]), async {
        settle().await;
        assert_eq!(bus.call_count("ReleaseHandles"), 0);
        bus.resume("GetContactAttributes");
    });
    let second = second.expect("resolve again");
    settle().await;

    assert!(second.get(5).is_some());
    assert_eq!(
        members_on(&bus, CONN_PATH),
        vec!["GetAll", "GetContactAttributes", "GetContactAttributes"]
    );
}

#[tokio::test]
async fn unreferenced_contact_handles_are_released() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    bus.set_properties(
        CONN_PATH,
        IFACE_CONNECTION,
        props([
            ("Status", Variant::U32(connection_status::CONNECTED)),
            (
                "Interfaces",
                Variant::StrList(vec![IFACE_CONNECTION_CONTACTS.to_owned()]),
            ),
            ("SelfHandle", Variant::U32(SELF_HANDLE)),
            ("HasImmortalHandles", Variant::Bool(false)),
        ]),
    );
    serve_contact_attributes(&bus);
    bus.reply(CONN_PATH, IFACE_CONNECTION, "ReleaseHandles", Vec::new());
    let connection = connection(&bus);
    connection.become_ready(Features::new()).await.expect("ready");

    let resolved = connection.contacts_for_handles(&[5]).await.expect("resolve");
    drop(resolved);
    settle().await;

    let release = bus
        .calls()
        .into_iter()
        .find(|call| call.member == "ReleaseHandles")
        .expect("release sent");
    assert_eq!(release.args[1], Variant::U32List(vec![5]));
}
