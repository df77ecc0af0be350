mod support;

use std::sync::Arc;

use support::*;
use telepathy_bus::error::names;
use telepathy_bus::{MockBus, Variant, VariantMap};
use telepathy_client::constants::{
    connection_status, handle_type, IFACE_ACCOUNT, IFACE_CHANNEL, IFACE_CHANNEL_REQUEST,
};
use telepathy_client::{ChannelRequest, ChannelRequestEvent, Features, ReadyObject};

const REQUEST_PATH: &str = "/org/freedesktop/Telepathy/ChannelDispatcher/Request0";
const ACCOUNT_PATH: &str = "/org/freedesktop/Telepathy/Account/fake/proto/me0";
const HANDLER: &str = "org.freedesktop.Telepathy.Client.Chat";

fn serve_account(bus: &MockBus) {
    bus.set_properties(
        ACCOUNT_PATH,
        IFACE_ACCOUNT,
        props([
            ("DisplayName", Variant::from("Me")),
            ("Valid", Variant::Bool(true)),
            ("ConnectionStatus", Variant::U32(connection_status::CONNECTED)),
            ("Connection", Variant::object_path(CONN_PATH)),
        ]),
    );
}

fn request_properties() -> VariantMap {
    let request = props([(
        "org.freedesktop.Telepathy.Channel.ChannelType",
        Variant::from("org.freedesktop.Telepathy.Channel.Type.Text"),
    )]);
    props([
        ("Account", Variant::object_path(ACCOUNT_PATH)),
        ("UserActionTime", Variant::I64(1_700_000_000)),
        ("PreferredHandler", Variant::from(HANDLER)),
        ("Requests", Variant::List(vec![Variant::Map(request)])),
        ("Interfaces", Variant::StrList(Vec::new())),
        ("Hints", Variant::Map(props([("urgent", Variant::Bool(true))]))),
    ])
}

fn qualified(properties: VariantMap) -> VariantMap {
    properties
        .into_iter()
        .map(|(name, value)| (format!("{IFACE_CHANNEL_REQUEST}.{name}"), value))
        .collect()
}

async fn ready_request(bus: &Arc<MockBus>) -> Arc<ChannelRequest> {
    serve_account(bus);
    let request = ChannelRequest::with_config(
        bus.clone(),
        REQUEST_PATH,
        qualified(request_properties()),
        config(),
    );
    request.become_ready(Features::new()).await.expect("request ready");
    request
}

#[tokio::test]
async fn immutable_properties_are_enough() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    let request = ready_request(&bus).await;

    assert!(members_on(&bus, REQUEST_PATH).is_empty());
    assert_eq!(request.user_action_time(), 1_700_000_000);
    assert_eq!(request.preferred_handler(), HANDLER);
    assert_eq!(request.requests().len(), 1);
    assert!(request.hints().contains_key("urgent"));
    let account = request.account().expect("account");
    assert_eq!(account.object_path(), ACCOUNT_PATH);
    assert!(account.is_ready(&Features::new()));
    assert_eq!(account.display_name(), "Me");
}

#[tokio::test]
async fn partial_immutable_properties_need_a_fetch() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    serve_account(&bus);
    bus.set_properties(REQUEST_PATH, IFACE_CHANNEL_REQUEST, request_properties());
    let immutable = qualified(props([("Account", Variant::object_path(ACCOUNT_PATH))]));
    let request = ChannelRequest::with_config(bus.clone(), REQUEST_PATH, immutable, config());

    // The account is known before core is ready.
    assert!(request.account().is_some());
    request.become_ready(Features::new()).await.expect("request ready");

    assert_eq!(members_on(&bus, REQUEST_PATH), vec!["GetAll"]);
    assert_eq!(request.preferred_handler(), HANDLER);
}

#[tokio::test]
async fn failure_invalidates_with_the_reported_error() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    let request = ready_request(&bus).await;

    bus.emit(
        REQUEST_PATH,
        IFACE_CHANNEL_REQUEST,
        "Failed",
        vec![Variant::from(names::CANCELLED), Variant::from("user gave up")],
    );

    let err = request.dbus_proxy().invalidated().await;
    assert_eq!(err.name, names::CANCELLED);
    assert_eq!(err.message, "user gave up");
}

#[tokio::test]
async fn success_with_channel_hands_out_a_ready_channel() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    fake_connection_service(&bus);
    let request = ready_request(&bus).await;
    let mut events = request.events();

    let channel_properties: VariantMap = [
        ("ChannelType", Variant::from("org.freedesktop.Telepathy.Channel.Type.Text")),
        ("Interfaces", Variant::StrList(Vec::new())),
        ("TargetHandleType", Variant::U32(handle_type::CONTACT)),
        ("TargetHandle", Variant::U32(4)),
        ("TargetID", Variant::from(contact_id(4))),
        ("Requested", Variant::Bool(true)),
        ("InitiatorHandle", Variant::U32(SELF_HANDLE)),
        ("InitiatorID", Variant::from(contact_id(SELF_HANDLE))),
    ]
    .into_iter()
    .map(|(name, value)| (format!("{IFACE_CHANNEL}.{name}"), value))
    .collect();
    bus.emit(
        REQUEST_PATH,
        IFACE_CHANNEL_REQUEST,
        "SucceededWithChannel",
        vec![
            Variant::object_path(CONN_PATH),
            Variant::Map(VariantMap::new()),
            Variant::object_path(CHAN_PATH),
            Variant::Map(channel_properties),
        ],
    );
    // The legacy signal that follows must not report success twice.
    bus.emit(REQUEST_PATH, IFACE_CHANNEL_REQUEST, "Succeeded", Vec::new());

    let event = next_event(&mut events).await;
    assert!(format!("{event:?}").contains(CHAN_PATH));
    let ChannelRequestEvent::Succeeded { channel } = event;
    let channel = channel.expect("channel");
    assert_eq!(channel.object_path(), CHAN_PATH);
    assert!(channel.is_ready(&Features::new()));
    assert_eq!(channel.connection().dbus_proxy().bus_name(), CONN_BUS_NAME);
    assert_eq!(
        channel.target_contact().map(|contact| contact.handle()),
        Some(4)
    );

    let err = request.dbus_proxy().invalidated().await;
    assert_eq!(err.name, names::OBJECT_REMOVED);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn legacy_success_has_no_channel() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    let request = ready_request(&bus).await;
    let mut events = request.events();

    bus.emit(REQUEST_PATH, IFACE_CHANNEL_REQUEST, "Succeeded", Vec::new());

    let ChannelRequestEvent::Succeeded { channel } = next_event(&mut events).await;
    assert!(channel.is_none());
    let err = request.dbus_proxy().invalidated().await;
    assert_eq!(err.name, names::OBJECT_REMOVED);
}

#[tokio::test]
async fn cancel_asks_the_dispatcher() {
    init_logging();
    let bus = Arc::new(MockBus::new());
    bus.reply(REQUEST_PATH, IFACE_CHANNEL_REQUEST, "Cancel", Vec::new());
    let request = ready_request(&bus).await;

    request.cancel().await.expect("cancel");
    assert_eq!(members_on(&bus, REQUEST_PATH), vec!["Cancel"]);
}
