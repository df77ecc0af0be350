use std::sync::{Arc, Mutex, MutexGuard, Weak};

use telepathy_bus::error::names;
use telepathy_bus::{Bus, DBusError, Signal, Variant, VariantMap, VariantMapExt};
use tokio::sync::broadcast;

use crate::account::Account;
use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::connection::{bus_name_for_object_path, Connection};
use crate::constants::{CHANNEL_DISPATCHER_BUS_NAME, IFACE_CHANNEL_REQUEST};
use crate::feature::{Feature, Features};
use crate::proxy::{spawn, DBusProxy};
use crate::readiness::{
    Introspectable, Introspectables, IntrospectFuture, ReadinessHelper, ReadyObject,
};

const MAIN_PROPERTIES: [&str; 5] = [
    "Account",
    "UserActionTime",
    "PreferredHandler",
    "Requests",
    "Interfaces",
];

/// Change notifications published by a [`ChannelRequest`].
#[derive(Clone, Debug)]
pub enum ChannelRequestEvent {
    /// The request was satisfied. `channel` is set when the service said
    /// which channel satisfied it; it is ready unless building it failed.
    Succeeded { channel: Option<Arc<Channel>> },
}

#[derive(Default)]
struct RequestState {
    account: Option<Arc<Account>>,
    user_action_time: i64,
    preferred_handler: String,
    requests: Vec<VariantMap>,
    interfaces: Vec<String>,
    hints: VariantMap,
    succeeded: bool,
    signals_connected: bool,
}

/// Proxy for a pending channel request on the channel dispatcher.
///
/// The proxy is invalidated once the request fails or succeeds.
pub struct ChannelRequest {
    readiness: ReadinessHelper<ChannelRequest>,
    config: ClientConfig,
    immutable_properties: VariantMap,
    state: Mutex<RequestState>,
    events: broadcast::Sender<ChannelRequestEvent>,
}

impl ReadyObject for ChannelRequest {
    fn readiness_helper(&self) -> &ReadinessHelper<Self> {
        &self.readiness
    }
}

impl ChannelRequest {
    /// Account, requests, hints and the rest of the main properties.
    pub const FEATURE_CORE: Feature = Feature::new("ChannelRequest", 0, true);

    pub fn new(bus: Arc<dyn Bus>, object_path: &str, immutable_properties: VariantMap) -> Arc<Self> {
        Self::with_config(bus, object_path, immutable_properties, ClientConfig::default())
    }

    pub fn with_config(
        bus: Arc<dyn Bus>,
        object_path: &str,
        immutable_properties: VariantMap,
        config: ClientConfig,
    ) -> Arc<Self> {
        let proxy = DBusProxy::new(bus, CHANNEL_DISPATCHER_BUS_NAME, object_path);
        let (events, _) = broadcast::channel(16);
        let request = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            readiness: ReadinessHelper::new(weak.clone(), proxy, 0, Self::introspectables()),
            config,
            immutable_properties,
            state: Mutex::new(RequestState::default()),
            events,
        });
        // The immutable properties are usable before core is ready.
        if let Some(early) = request.main_properties_from_immutable(false) {
            request.extract_main_properties(&early);
        }
        request
    }

    fn introspectables() -> Introspectables<Self> {
        let mut table = Introspectables::new();
        table.insert(
            Self::FEATURE_CORE,
            Introspectable::new([0], Features::new(), Vec::<String>::new(), Self::introspect_core),
        );
        table
    }

    fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().expect("channel request state mutex poisoned")
    }

    fn label(&self) -> &str {
        self.dbus_proxy().object_path()
    }

    pub fn object_path(&self) -> &str {
        self.dbus_proxy().object_path()
    }

    pub fn immutable_properties(&self) -> &VariantMap {
        &self.immutable_properties
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelRequestEvent> {
        self.events.subscribe()
    }

    pub fn account(&self) -> Option<Arc<Account>> {
        self.state().account.clone()
    }

    /// Seconds since the epoch of the user action behind the request, or 0.
    pub fn user_action_time(&self) -> i64 {
        self.state().user_action_time
    }

    pub fn preferred_handler(&self) -> String {
        self.state().preferred_handler.clone()
    }

    pub fn requests(&self) -> Vec<VariantMap> {
        self.state().requests.clone()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.state().interfaces.clone()
    }

    pub fn hints(&self) -> VariantMap {
        self.state().hints.clone()
    }

    /// Asks the dispatcher to cancel the request. Success is reported by
    /// the request failing with `Cancelled`.
    pub async fn cancel(&self) -> Result<(), DBusError> {
        self.dbus_proxy()
            .call(IFACE_CHANNEL_REQUEST, "Cancel", Vec::new())
            .await
            .map(|_| ())
    }

    /// Main properties found among the immutable ones. With `complete`,
    /// returns `None` unless all of them are present.
    fn main_properties_from_immutable(&self, complete: bool) -> Option<VariantMap> {
        let mut props = VariantMap::new();
        for name in MAIN_PROPERTIES.iter().copied().chain(["Hints"]) {
            match self
                .immutable_properties
                .get(&format!("{IFACE_CHANNEL_REQUEST}.{name}"))
            {
                Some(value) => {
                    props.insert(name.to_owned(), value.clone());
                }
                None if complete && name != "Hints" => return None,
                None => {}
            }
        }
        Some(props)
    }

    fn extract_main_properties(&self, props: &VariantMap) {
        let account_path = props
            .str_value("Account")
            .filter(|path| !path.is_empty() && *path != "/")
            .map(str::to_owned);

        let mut state = self.state();
        if let Some(path) = account_path {
            let reuse = state
                .account
                .as_ref()
                .is_some_and(|account| account.object_path() == path);
            if !reuse {
                if let Some(previous) = &state.account {
                    log::warn!(
                        "cr({}): account {} replaces {}",
                        self.label(),
                        path,
                        previous.object_path()
                    );
                }
                state.account = Some(Account::with_config(
                    Arc::clone(self.dbus_proxy().bus()),
                    &path,
                    self.config.clone(),
                ));
            }
        }
        if let Some(time) = props.get("UserActionTime").and_then(Variant::as_i64) {
            state.user_action_time = time;
        }
        if let Some(handler) = props.str_value("PreferredHandler") {
            state.preferred_handler = handler.to_owned();
        }
        if let Some(requests) = props.get("Requests").and_then(Variant::as_list) {
            state.requests = requests
                .iter()
                .filter_map(|request| request.as_map().cloned())
                .collect();
        }
        if let Some(interfaces) = props.str_list_value("Interfaces") {
            state.interfaces = interfaces.to_vec();
        }
        if let Some(hints) = props.map_value("Hints") {
            state.hints = hints.clone();
        }
    }

    fn introspect_core(request: Arc<Self>) -> IntrospectFuture {
        Box::pin(async move { request.introspect_main().await })
    }

    async fn introspect_main(self: &Arc<Self>) -> Result<(), DBusError> {
        self.connect_signals_once();
        let props = match self.main_properties_from_immutable(true) {
            Some(props) => props,
            None => self
                .dbus_proxy()
                .get_all(IFACE_CHANNEL_REQUEST)
                .await
                .map_err(|err| {
                    log::warn!("cr({}): GetAll(ChannelRequest) failed: {}", self.label(), err);
                    err
                })?,
        };
        self.extract_main_properties(&props);

        let account = self.state().account.clone();
        if let Some(account) = account {
            if let Err(err) = account.become_ready(Features::new()).await {
                log::warn!(
                    "cr({}): account {} failed to become ready: {}",
                    self.label(),
                    account.object_path(),
                    err
                );
            }
        }
        let interfaces = self.state().interfaces.clone();
        self.readiness.set_interfaces(interfaces);
        Ok(())
    }

    fn connect_signals_once(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.signals_connected {
                return;
            }
            state.signals_connected = true;
        }
        self.dbus_proxy()
            .connect_signals(IFACE_CHANNEL_REQUEST, Arc::downgrade(self), Self::on_signal);
    }

    fn on_signal(self: &Arc<Self>, signal: Signal) {
        match signal.member.as_str() {
            "Failed" => {
                let name = signal.args.first().and_then(Variant::as_str).unwrap_or_default();
                let message = signal.args.get(1).and_then(Variant::as_str).unwrap_or_default();
                log::debug!("cr({}): failed with {}", self.label(), name);
                self.dbus_proxy().invalidate(name, message);
            }
            "SucceededWithChannel" => {
                let connection_path = signal.args.first().and_then(Variant::as_str);
                let channel_path = signal.args.get(2).and_then(Variant::as_str);
                let channel_props = signal.args.get(3).and_then(Variant::as_map).cloned();
                if let (Some(connection_path), Some(channel_path)) = (connection_path, channel_path) {
                    self.on_succeeded_with_channel(
                        connection_path.to_owned(),
                        channel_path.to_owned(),
                        channel_props.unwrap_or_default(),
                    );
                }
            }
            "Succeeded" => {
                if self.mark_succeeded() {
                    self.finish_success(None);
                }
            }
            _ => {}
        }
    }

    /// Returns false when success was already reported.
    fn mark_succeeded(&self) -> bool {
        !std::mem::replace(&mut self.state().succeeded, true)
    }

    fn on_succeeded_with_channel(
        self: &Arc<Self>,
        connection_path: String,
        channel_path: String,
        channel_props: VariantMap,
    ) {
        if !self.mark_succeeded() {
            log::warn!("cr({}): success reported twice", self.label());
            return;
        }
        let connection = Connection::with_config(
            Arc::clone(self.dbus_proxy().bus()),
            &bus_name_for_object_path(&connection_path),
            &connection_path,
            self.config.clone(),
        );
        let channel = Channel::new(&connection, &channel_path, channel_props);
        let request = Arc::clone(self);
        spawn(async move {
            match channel.become_ready(Features::new()).await {
                Ok(()) => request.finish_success(Some(channel)),
                Err(err) => {
                    log::warn!(
                        "cr({}): channel {} failed to become ready: {}",
                        request.label(),
                        channel.object_path(),
                        err
                    );
                    request.finish_success(None);
                }
            }
        });
    }

    fn finish_success(&self, channel: Option<Arc<Channel>>) {
        let _ = self.events.send(ChannelRequestEvent::Succeeded { channel });
        self.dbus_proxy()
            .invalidate(names::OBJECT_REMOVED, "ChannelRequest succeeded");
    }
}
