#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use telepathy_bus::{MockBus, Variant, VariantMap};
use telepathy_client::constants::{connection_status, IFACE_CONNECTION};
use telepathy_client::{ClientConfig, Connection, Features, ReadyObject};
use tokio::sync::broadcast;

pub const CONN_BUS_NAME: &str = "org.freedesktop.Telepathy.Connection.fake.proto.me";
pub const CONN_PATH: &str = "/org/freedesktop/Telepathy/Connection/fake/proto/me";
pub const CHAN_PATH: &str = "/org/freedesktop/Telepathy/Connection/fake/proto/me/channel1";
pub const SELF_HANDLE: u32 = 1;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Defaults, minus name-owner tracking so call logs only show proxy traffic.
pub fn config() -> ClientConfig {
    ClientConfig {
        track_name_owner: false,
        ..ClientConfig::default()
    }
}

pub fn props<const N: usize>(entries: [(&str, Variant); N]) -> VariantMap {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_owned(), value))
        .collect()
}

pub fn contact_id(handle: u32) -> String {
    format!("contact{handle}@example.com")
}

/// Serves a connected connection with immortal handles whose contact
/// identifiers come from [`contact_id`].
pub fn fake_connection_service(bus: &MockBus) {
    bus.set_properties(
        CONN_PATH,
        IFACE_CONNECTION,
        props([
            ("Status", Variant::U32(connection_status::CONNECTED)),
            ("Interfaces", Variant::StrList(Vec::new())),
            ("SelfHandle", Variant::U32(SELF_HANDLE)),
            ("HasImmortalHandles", Variant::Bool(true)),
        ]),
    );
    bus.on_call(CONN_PATH, IFACE_CONNECTION, "InspectHandles", |call| {
        let handles = call
            .args
            .get(1)
            .and_then(Variant::as_u32_list)
            .unwrap_or_default();
        Ok(vec![Variant::StrList(
            handles.iter().map(|handle| contact_id(*handle)).collect(),
        )])
    });
}

pub async fn ready_connection(bus: &Arc<MockBus>, config: ClientConfig) -> Arc<Connection> {
    let connection = Connection::with_config(bus.clone(), CONN_BUS_NAME, CONN_PATH, config);
    connection
        .become_ready(Features::new())
        .await
        .expect("connection core ready");
    connection
}

pub async fn next_event<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event before timeout")
        .expect("event stream open")
}

/// Lets spawned signal and pipeline tasks run.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Members called on `path`, in call order.
pub fn members_on(bus: &MockBus, path: &str) -> Vec<String> {
    bus.calls()
        .into_iter()
        .filter(|call| call.path == path)
        .map(|call| call.member)
        .collect()
}
