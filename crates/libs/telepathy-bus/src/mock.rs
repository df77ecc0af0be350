use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::bus::{Bus, MethodCall, Signal, SignalReceiver, DBUS_INTERFACE, PROPERTIES_INTERFACE};
use crate::error::{names, DBusError};
use crate::variant::{Variant, VariantMap};

type Handler = Arc<dyn Fn(&MethodCall) -> Result<Vec<Variant>, DBusError> + Send + Sync>;

struct Subscriber {
    path: String,
    interface: String,
    tx: mpsc::UnboundedSender<Signal>,
}

#[derive(Default)]
struct MockState {
    handlers: HashMap<(String, String, String), Handler>,
    properties: HashMap<(String, String), VariantMap>,
    name_owners: HashMap<String, Option<String>>,
    calls: Vec<MethodCall>,
    subscribers: Vec<Subscriber>,
    paused: HashMap<String, watch::Sender<bool>>,
}

/// An in-process [`Bus`] answering from scripted handlers.
///
/// Every call is recorded before it is answered. Unscripted calls fail with
/// `org.freedesktop.DBus.Error.UnknownMethod`, except `Properties.GetAll` for
/// objects registered with [`MockBus::set_properties`] and `GetNameOwner`,
/// which answers `:1.1` unless overridden with [`MockBus::set_name_owner`].
pub struct MockBus {
    state: Mutex<MockState>,
    connected: AtomicBool,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            connected: AtomicBool::new(true),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock bus mutex poisoned")
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Answer `interface.member` on `path` with `handler`.
    pub fn on_call<F>(&self, path: &str, interface: &str, member: &str, handler: F)
    where
        F: Fn(&MethodCall) -> Result<Vec<Variant>, DBusError> + Send + Sync + 'static,
    {
        self.state().handlers.insert(
            (path.to_owned(), interface.to_owned(), member.to_owned()),
            Arc::new(handler),
        );
    }

    /// Answer `interface.member` on `path` with a fixed reply.
    pub fn reply(&self, path: &str, interface: &str, member: &str, reply: Vec<Variant>) {
        self.on_call(path, interface, member, move |_| Ok(reply.clone()));
    }

    /// Answer `interface.member` on `path` with a fixed error.
    pub fn fail(&self, path: &str, interface: &str, member: &str, error: DBusError) {
        self.on_call(path, interface, member, move |_| Err(error.clone()));
    }

    /// Serve `properties` from `Properties.GetAll(interface)` on `path`.
    pub fn set_properties(&self, path: &str, interface: &str, properties: VariantMap) {
        self.state()
            .properties
            .insert((path.to_owned(), interface.to_owned()), properties);
    }

    /// Set the owner reported for `name`; `None` makes the name unowned.
    pub fn set_name_owner(&self, name: &str, owner: Option<&str>) {
        self.state()
            .name_owners
            .insert(name.to_owned(), owner.map(str::to_owned));
    }

    /// Hold every call to `member` until [`MockBus::resume`] is called.
    pub fn pause(&self, member: &str) {
        let (tx, _rx) = watch::channel(true);
        self.state().paused.insert(member.to_owned(), tx);
    }

    pub fn resume(&self, member: &str) {
        if let Some(tx) = self.state().paused.remove(member) {
            tx.send_replace(false);
        }
    }

    pub fn calls(&self) -> Vec<MethodCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, member: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.member == member)
            .count()
    }

    /// Called member names in call order.
    pub fn members(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .map(|call| call.member.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Deliver a signal to every live subscriber of (`path`, `interface`).
    pub fn emit(&self, path: &str, interface: &str, member: &str, args: Vec<Variant>) {
        let mut state = self.state();
        log::trace!("mockbus: emit {}.{} on {}", interface, member, path);
        state.subscribers.retain(|sub| {
            if sub.path != path || sub.interface != interface {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(Signal {
                    member: member.to_owned(),
                    args: args.clone(),
                })
                .is_ok()
        });
    }

    pub fn subscriber_count(&self, path: &str, interface: &str) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|sub| sub.path == path && sub.interface == interface && !sub.tx.is_closed())
            .count()
    }

    fn fallback_reply(&self, call: &MethodCall) -> Result<Vec<Variant>, DBusError> {
        let state = self.state();
        let first_str = call.args.first().and_then(Variant::as_str).unwrap_or_default();
        if call.interface == PROPERTIES_INTERFACE && call.member == "GetAll" {
            if let Some(props) = state
                .properties
                .get(&(call.path.clone(), first_str.to_owned()))
            {
                return Ok(vec![Variant::Map(props.clone())]);
            }
        }
        if call.interface == DBUS_INTERFACE && call.member == "GetNameOwner" {
            return match state.name_owners.get(first_str) {
                Some(Some(owner)) => Ok(vec![Variant::from(owner.as_str())]),
                Some(None) => Err(DBusError::new(
                    names::NAME_HAS_NO_OWNER,
                    format!("Could not get owner of name '{first_str}'"),
                )),
                None => Ok(vec![Variant::from(":1.1")]),
            };
        }
        Err(DBusError::unknown_method(format!(
            "No such method '{}' in interface '{}' at object path '{}'",
            call.member, call.interface, call.path
        )))
    }
}

#[async_trait]
impl Bus for MockBus {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn call(&self, call: MethodCall) -> Result<Vec<Variant>, DBusError> {
        let gate = {
            let mut state = self.state();
            state.calls.push(call.clone());
            state.paused.get(&call.member).map(watch::Sender::subscribe)
        };
        log::trace!("mockbus: call {}.{} on {}", call.interface, call.member, call.path);
        if !self.is_connected() {
            return Err(DBusError::disconnected("DBus connection disconnected"));
        }
        if let Some(mut rx) = gate {
            // a dropped sender means the pause was lifted
            let _ = rx.wait_for(|paused| !*paused).await;
        }
        let handler = self
            .state()
            .handlers
            .get(&(call.path.clone(), call.interface.clone(), call.member.clone()))
            .cloned();
        match handler {
            Some(handler) => handler(&call),
            None => self.fallback_reply(&call),
        }
    }

    fn subscribe(&self, path: &str, interface: &str) -> SignalReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(Subscriber {
            path: path.to_owned(),
            interface: interface.to_owned(),
            tx,
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/org/example/Obj";
    const IFACE: &str = "org.example.Iface";

    fn call(member: &str) -> MethodCall {
        MethodCall::new("org.example", PATH, IFACE, member, Vec::new())
    }

    #[tokio::test]
    async fn scripted_replies_and_call_log() {
        let bus = MockBus::new();
        bus.reply(PATH, IFACE, "Ping", vec![Variant::from("pong")]);

        let reply = bus.call(call("Ping")).await.expect("reply");
        assert_eq!(reply, vec![Variant::from("pong")]);

        let err = bus.call(call("Missing")).await.expect_err("unscripted");
        assert_eq!(err.name, names::UNKNOWN_METHOD);
        assert_eq!(bus.members(), vec!["Ping", "Missing"]);
    }

    #[tokio::test]
    async fn get_all_reads_property_table() {
        let bus = MockBus::new();
        let mut props = VariantMap::new();
        props.insert("Answer".into(), Variant::from(42u32));
        bus.set_properties(PATH, IFACE, props.clone());

        let got = bus.get_all("org.example", PATH, IFACE).await.expect("props");
        assert_eq!(got, props);
        bus.get_all("org.example", PATH, "org.example.Other")
            .await
            .expect_err("no table for other interface");
    }

    #[tokio::test]
    async fn name_owner_defaults_and_overrides() {
        let bus = MockBus::new();
        assert_eq!(bus.get_name_owner("org.example").await.expect("owner"), ":1.1");
        bus.set_name_owner("org.example", None);
        let err = bus.get_name_owner("org.example").await.expect_err("unowned");
        assert_eq!(err.name, names::NAME_HAS_NO_OWNER);
    }

    #[tokio::test]
    async fn disconnected_bus_fails_calls() {
        let bus = MockBus::new();
        bus.reply(PATH, IFACE, "Ping", Vec::new());
        bus.set_connected(false);
        let err = bus.call(call("Ping")).await.expect_err("disconnected");
        assert_eq!(err.name, names::DISCONNECTED);
    }

    #[tokio::test]
    async fn signals_arrive_in_order() {
        let bus = MockBus::new();
        let mut rx = bus.subscribe(PATH, IFACE);
        bus.emit(PATH, IFACE, "A", vec![Variant::from(1u32)]);
        bus.emit("/other", IFACE, "Ignored", Vec::new());
        bus.emit(PATH, IFACE, "B", Vec::new());

        assert_eq!(rx.recv().await.expect("first").member, "A");
        assert_eq!(rx.recv().await.expect("second").member, "B");
        drop(rx);
        bus.emit(PATH, IFACE, "C", Vec::new());
        assert_eq!(bus.subscriber_count(PATH, IFACE), 0);
    }

    #[tokio::test]
    async fn paused_member_waits_for_resume() {
        let bus = Arc::new(MockBus::new());
        bus.reply(PATH, IFACE, "Slow", vec![Variant::from(true)]);
        bus.pause("Slow");

        let task = tokio::spawn({
            let bus = Arc::clone(&bus);
            async move { bus.call(call("Slow")).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(bus.call_count("Slow"), 1);
        assert!(!task.is_finished());

        bus.resume("Slow");
        let reply = task.await.expect("join").expect("reply");
        assert_eq!(reply, vec![Variant::from(true)]);
    }
}
