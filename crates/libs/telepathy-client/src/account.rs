use std::sync::{Arc, Mutex, MutexGuard, Weak};

use telepathy_bus::error::names;
use telepathy_bus::{Bus, DBusError, Signal, Variant, VariantMap, VariantMapExt, PROPERTIES_INTERFACE};
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::connection::{bus_name_for_object_path, error_for_status_reason, Connection};
use crate::constants::{
    connection_status, connection_status_reason, ACCOUNT_MANAGER_BUS_NAME, ACCOUNT_OBJECT_PATH_BASE,
    IFACE_ACCOUNT, IFACE_ACCOUNT_AVATAR,
};
use crate::feature::{Feature, Features};
use crate::proxy::{spawn, DBusProxy};
use crate::readiness::{
    Introspectable, Introspectables, IntrospectFuture, ReadinessHelper, ReadyObject,
};

/// A `(type, status, message)` presence triple.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Presence {
    pub kind: u32,
    pub status: String,
    pub message: String,
}

impl Presence {
    fn from_variant(value: &Variant) -> Option<Self> {
        let fields = value.as_list()?;
        Some(Self {
            kind: fields.first()?.as_u32()?,
            status: fields.get(1).and_then(Variant::as_str).unwrap_or_default().to_owned(),
            message: fields.get(2).and_then(Variant::as_str).unwrap_or_default().to_owned(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Avatar {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Change notifications published by an [`Account`].
#[derive(Clone, Debug, PartialEq)]
pub enum AccountEvent {
    /// A property took a new value; only published once core is ready.
    PropertyChanged { name: String, value: Variant },
    /// `HasBeenOnline` became true for an account that was already ready.
    FirstOnline,
    ConnectionStatusChanged {
        status: u32,
        reason: u32,
        error: String,
    },
    ConnectionChanged(Option<String>),
    AvatarChanged(Avatar),
    Removed,
}

struct AccountState {
    properties: VariantMap,
    interfaces: Vec<String>,
    connection_error: String,
    connection_error_details: VariantMap,
    connection: Option<Arc<Connection>>,
    avatar: Avatar,
    signals_connected: bool,
    avatar_signals_connected: bool,
}

/// Proxy for an account held by the account manager.
pub struct Account {
    readiness: ReadinessHelper<Account>,
    config: ClientConfig,
    cm_name: String,
    protocol_name: String,
    state: Mutex<AccountState>,
    events: broadcast::Sender<AccountEvent>,
}

impl ReadyObject for Account {
    fn readiness_helper(&self) -> &ReadinessHelper<Self> {
        &self.readiness
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("object_path", &self.object_path())
            .field("valid", &self.is_valid())
            .finish()
    }
}

fn is_identifier(part: &str, allow_leading_digit: bool) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        Some(first) if allow_leading_digit && first.is_ascii_digit() => {}
        None => return allow_leading_digit,
        Some(_) => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Splits an account object path into connection manager and protocol
/// names. Protocol names use `-` where the path needs `_`.
pub fn parse_account_object_path(object_path: &str) -> Option<(String, String)> {
    let rest = object_path.strip_prefix(ACCOUNT_OBJECT_PATH_BASE)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    let [cm, protocol, account] = parts.as_slice() else {
        return None;
    };
    if !is_identifier(cm, false) || !is_identifier(protocol, false) || !is_identifier(account, true) {
        return None;
    }
    Some(((*cm).to_owned(), protocol.replace('_', "-")))
}

impl Account {
    /// Main account properties, kept in sync through `AccountPropertyChanged`.
    pub const FEATURE_CORE: Feature = Feature::new("Account", 0, true);
    /// The avatar, when the account supports the avatar interface.
    pub const FEATURE_AVATAR: Feature = Feature::new("Account", 1, false);

    /// Looks a feature up by the name used in configuration files.
    pub fn feature_by_name(name: &str) -> Option<Feature> {
        match name {
            "core" => Some(Self::FEATURE_CORE),
            "avatar" => Some(Self::FEATURE_AVATAR),
            _ => None,
        }
    }

    pub fn new(bus: Arc<dyn Bus>, object_path: &str) -> Arc<Self> {
        Self::with_config(bus, object_path, ClientConfig::default())
    }

    pub fn with_config(bus: Arc<dyn Bus>, object_path: &str, config: ClientConfig) -> Arc<Self> {
        let proxy = DBusProxy::new(bus, ACCOUNT_MANAGER_BUS_NAME, object_path);
        let (cm_name, protocol_name) = parse_account_object_path(object_path).unwrap_or_else(|| {
            log::warn!("acct({}): not a valid account object path", object_path);
            (String::new(), String::new())
        });
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            readiness: ReadinessHelper::new(weak.clone(), proxy, 0, Self::introspectables()),
            config,
            cm_name,
            protocol_name,
            state: Mutex::new(AccountState {
                properties: VariantMap::new(),
                interfaces: Vec::new(),
                connection_error: String::new(),
                connection_error_details: VariantMap::new(),
                connection: None,
                avatar: Avatar::default(),
                signals_connected: false,
                avatar_signals_connected: false,
            }),
            events,
        })
    }

    fn introspectables() -> Introspectables<Self> {
        let mut table = Introspectables::new();
        table.insert(
            Self::FEATURE_CORE,
            Introspectable::new([0], Features::new(), Vec::<String>::new(), Self::introspect_core),
        );
        table.insert(
            Self::FEATURE_AVATAR,
            Introspectable::new(
                [0],
                [Self::FEATURE_CORE],
                [IFACE_ACCOUNT_AVATAR],
                Self::introspect_avatar,
            ),
        );
        table
    }

    fn state(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().expect("account state mutex poisoned")
    }

    fn label(&self) -> &str {
        self.dbus_proxy().object_path()
    }

    pub fn object_path(&self) -> &str {
        self.dbus_proxy().object_path()
    }

    pub fn events(&self) -> broadcast::Receiver<AccountEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AccountEvent) {
        let _ = self.events.send(event);
    }

    pub fn cm_name(&self) -> &str {
        &self.cm_name
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    fn warn_unless_ready(&self, feature: Feature, accessor: &str) {
        if !self.is_feature_ready(feature) {
            log::warn!(
                "acct({}): {}() used without {} being ready",
                self.label(),
                accessor,
                feature
            );
        }
    }

    fn property<R>(&self, accessor: &str, read: impl FnOnce(&VariantMap) -> R) -> R {
        self.warn_unless_ready(Self::FEATURE_CORE, accessor);
        read(&self.state().properties)
    }

    /// A copy of the whole cached property map.
    pub fn properties(&self) -> VariantMap {
        self.property("properties", VariantMap::clone)
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.warn_unless_ready(Self::FEATURE_CORE, "interfaces");
        self.state().interfaces.clone()
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.state().interfaces.iter().any(|known| known == interface)
    }

    pub fn is_valid_account(&self) -> bool {
        self.property("is_valid_account", |props| props.bool_value("Valid").unwrap_or(false))
    }

    pub fn is_enabled(&self) -> bool {
        self.property("is_enabled", |props| props.bool_value("Enabled").unwrap_or(false))
    }

    pub fn connects_automatically(&self) -> bool {
        self.property("connects_automatically", |props| {
            props.bool_value("ConnectAutomatically").unwrap_or(false)
        })
    }

    pub fn has_been_online(&self) -> bool {
        self.property("has_been_online", |props| {
            props.bool_value("HasBeenOnline").unwrap_or(false)
        })
    }

    pub fn display_name(&self) -> String {
        self.property("display_name", |props| {
            props.str_value("DisplayName").unwrap_or_default().to_owned()
        })
    }

    pub fn nickname(&self) -> String {
        self.property("nickname", |props| {
            props.str_value("Nickname").unwrap_or_default().to_owned()
        })
    }

    pub fn normalized_name(&self) -> String {
        self.property("normalized_name", |props| {
            props.str_value("NormalizedName").unwrap_or_default().to_owned()
        })
    }

    /// The service name, falling back to the protocol name.
    pub fn service_name(&self) -> String {
        self.property("service_name", |props| match props.str_value("Service") {
            Some(service) if !service.is_empty() => service.to_owned(),
            _ => self.protocol_name.clone(),
        })
    }

    /// The icon name, falling back to `im-<protocol>`.
    pub fn icon_name(&self) -> String {
        self.property("icon_name", |props| match props.str_value("Icon") {
            Some(icon) if !icon.is_empty() => icon.to_owned(),
            _ => format!("im-{}", self.protocol_name),
        })
    }

    pub fn parameters(&self) -> VariantMap {
        self.property("parameters", |props| {
            props.map_value("Parameters").cloned().unwrap_or_default()
        })
    }

    pub fn automatic_presence(&self) -> Presence {
        self.presence("automatic_presence", "AutomaticPresence")
    }

    pub fn current_presence(&self) -> Presence {
        self.presence("current_presence", "CurrentPresence")
    }

    pub fn requested_presence(&self) -> Presence {
        self.presence("requested_presence", "RequestedPresence")
    }

    fn presence(&self, accessor: &str, key: &str) -> Presence {
        self.property(accessor, |props| {
            props
                .get(key)
                .and_then(Presence::from_variant)
                .unwrap_or_default()
        })
    }

    pub fn is_changing_presence(&self) -> bool {
        self.property("is_changing_presence", |props| {
            props.bool_value("ChangingPresence").unwrap_or(false)
        })
    }

    pub fn connection_status(&self) -> u32 {
        self.property("connection_status", |props| {
            props
                .u32_value("ConnectionStatus")
                .unwrap_or(connection_status::DISCONNECTED)
        })
    }

    pub fn connection_status_reason(&self) -> u32 {
        self.property("connection_status_reason", |props| {
            props
                .u32_value("ConnectionStatusReason")
                .unwrap_or(connection_status_reason::NONE_SPECIFIED)
        })
    }

    /// The error name of the last disconnection, empty while not
    /// disconnected.
    pub fn connection_error(&self) -> String {
        self.warn_unless_ready(Self::FEATURE_CORE, "connection_error");
        self.state().connection_error.clone()
    }

    pub fn connection_error_details(&self) -> VariantMap {
        self.warn_unless_ready(Self::FEATURE_CORE, "connection_error_details");
        self.state().connection_error_details.clone()
    }

    pub fn connection_object_path(&self) -> Option<String> {
        self.property("connection_object_path", |props| {
            props
                .str_value("Connection")
                .filter(|path| !path.is_empty() && *path != "/")
                .map(str::to_owned)
        })
    }

    /// Proxy for the account's current connection. It is not made ready.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.warn_unless_ready(Self::FEATURE_CORE, "connection");
        self.state().connection.clone()
    }

    pub fn avatar(&self) -> Avatar {
        self.warn_unless_ready(Self::FEATURE_AVATAR, "avatar");
        self.state().avatar.clone()
    }

    /// Asks the account manager to delete this account.
    pub async fn remove(&self) -> Result<(), DBusError> {
        self.dbus_proxy()
            .call(IFACE_ACCOUNT, "Remove", Vec::new())
            .await
            .map(|_| ())
    }

    pub async fn reconnect(&self) -> Result<(), DBusError> {
        self.dbus_proxy()
            .call(IFACE_ACCOUNT, "Reconnect", Vec::new())
            .await
            .map(|_| ())
    }

    /// Sets one account property on the service. The cached value changes
    /// when the service reports it.
    pub async fn set_property(&self, name: &str, value: Variant) -> Result<(), DBusError> {
        self.dbus_proxy()
            .call(
                PROPERTIES_INTERFACE,
                "Set",
                vec![Variant::from(IFACE_ACCOUNT), Variant::from(name), value],
            )
            .await
            .map(|_| ())
    }

    fn introspect_core(account: Arc<Self>) -> IntrospectFuture {
        Box::pin(async move { account.introspect_main().await })
    }

    fn introspect_avatar(account: Arc<Self>) -> IntrospectFuture {
        Box::pin(async move {
            account.connect_avatar_signals_once();
            account.retrieve_avatar().await
        })
    }

    async fn introspect_main(self: &Arc<Self>) -> Result<(), DBusError> {
        self.connect_signals_once();
        let props = self.dbus_proxy().get_all(IFACE_ACCOUNT).await.map_err(|err| {
            log::warn!("acct({}): GetAll(Account) failed: {}", self.label(), err);
            err
        })?;
        self.apply_properties(props, true);
        let interfaces = self.state().interfaces.clone();
        self.readiness.set_interfaces(interfaces);
        log::debug!("acct({}): core introspected", self.label());
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
            .connect_signals(IFACE_ACCOUNT, Arc::downgrade(self), Self::on_signal);
    }

    fn connect_avatar_signals_once(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.avatar_signals_connected {
                return;
            }
            state.avatar_signals_connected = true;
        }
        self.dbus_proxy()
            .connect_signals(IFACE_ACCOUNT_AVATAR, Arc::downgrade(self), |account, signal| {
                if signal.member == "AvatarChanged" {
                    log::debug!("acct({}): avatar changed, retrieving it", account.label());
                    let account = Arc::clone(account);
                    spawn(async move {
                        if let Err(err) = account.retrieve_avatar().await {
                            log::warn!("acct({}): avatar refresh failed: {}", account.label(), err);
                        }
                    });
                }
            });
    }

    fn on_signal(self: &Arc<Self>, signal: Signal) {
        match signal.member.as_str() {
            "AccountPropertyChanged" => {
                if let Some(delta) = signal.args.first().and_then(Variant::as_map) {
                    self.apply_properties(delta.clone(), false);
                }
            }
            "Removed" => self.on_removed(),
            _ => {}
        }
    }

    fn on_removed(&self) {
        {
            let mut state = self.state();
            state.properties.insert("Valid".to_owned(), Variant::Bool(false));
            state.properties.insert("Enabled".to_owned(), Variant::Bool(false));
        }
        self.emit(AccountEvent::Removed);
        self.dbus_proxy()
            .invalidate(names::OBJECT_REMOVED, "Account removed from AccountManager");
    }

    async fn retrieve_avatar(&self) -> Result<(), DBusError> {
        let props = self.dbus_proxy().get_all(IFACE_ACCOUNT_AVATAR).await?;
        let fields = props
            .get("Avatar")
            .and_then(Variant::as_list)
            .ok_or_else(|| DBusError::invalid_argument("Avatar property missing or malformed"))?;
        let avatar = Avatar {
            data: fields.first().and_then(Variant::as_bytes).unwrap_or_default().to_vec(),
            mime_type: fields.get(1).and_then(Variant::as_str).unwrap_or_default().to_owned(),
        };
        self.state().avatar = avatar.clone();
        if self.is_feature_ready(Self::FEATURE_AVATAR) {
            self.emit(AccountEvent::AvatarChanged(avatar));
        }
        Ok(())
    }

    /// Merges `delta` into the cached properties. Keys absent from `delta`
    /// keep their value; the initial snapshot additionally seeds the service
    /// and icon names the service left out.
    pub(crate) fn apply_properties(&self, delta: VariantMap, initial: bool) {
        let core_ready = self.is_feature_ready(Self::FEATURE_CORE);
        let mut events = Vec::new();
        let mut new_connection = None;
        {
            let mut state = self.state();
            let old_status = state.properties.u32_value("ConnectionStatus");
            let was_online = state.properties.bool_value("HasBeenOnline").unwrap_or(false);

            if initial {
                if !delta.contains_key("Service") {
                    state
                        .properties
                        .insert("Service".to_owned(), Variant::from(self.protocol_name.as_str()));
                }
                if delta.str_value("Icon").map_or(true, str::is_empty) {
                    state.properties.insert(
                        "Icon".to_owned(),
                        Variant::from(format!("im-{}", self.protocol_name)),
                    );
                }
            }

            for (name, value) in delta {
                // Once online, always online.
                if name == "HasBeenOnline" && was_online {
                    continue;
                }
                if initial && name == "Icon" && value.as_str().map_or(true, str::is_empty) {
                    continue;
                }
                if state.properties.get(&name) == Some(&value) {
                    continue;
                }
                match name.as_str() {
                    "Interfaces" => {
                        state.interfaces = value.as_str_list().unwrap_or_default().to_vec();
                    }
                    "Connection" => new_connection = Some(value.as_str().unwrap_or_default().to_owned()),
                    "ConnectionError" => {
                        state.connection_error = value.as_str().unwrap_or_default().to_owned();
                    }
                    "ConnectionErrorDetails" => {
                        state.connection_error_details = value.as_map().cloned().unwrap_or_default();
                    }
                    "HasBeenOnline" if value.as_bool() == Some(true) && core_ready => {
                        events.push(AccountEvent::FirstOnline);
                    }
                    _ => {}
                }
                log::trace!("acct({}): {} changed", self.label(), name);
                state.properties.insert(name.clone(), value.clone());
                events.push(AccountEvent::PropertyChanged { name, value });
            }

            let status = state.properties.u32_value("ConnectionStatus");
            if status.is_some() && status != old_status {
                let status = status.unwrap_or(connection_status::DISCONNECTED);
                let reason = state
                    .properties
                    .u32_value("ConnectionStatusReason")
                    .unwrap_or(connection_status_reason::NONE_SPECIFIED);
                if status != connection_status::DISCONNECTED {
                    state.connection_error.clear();
                    state.connection_error_details.clear();
                } else if state.connection_error.is_empty() {
                    state.connection_error = error_for_status_reason(reason).to_owned();
                }
                events.push(AccountEvent::ConnectionStatusChanged {
                    status,
                    reason,
                    error: state.connection_error.clone(),
                });
            }
        }

        if let Some(path) = new_connection {
            let path = Some(path).filter(|path| !path.is_empty() && path != "/");
            self.set_connection(path.as_deref());
            events.push(AccountEvent::ConnectionChanged(path));
        }

        if core_ready {
            for event in events {
                self.emit(event);
            }
        }
    }

    fn set_connection(&self, object_path: Option<&str>) {
        let connection = object_path.map(|path| {
            log::debug!("acct({}): building connection {}", self.label(), path);
            Connection::with_config(
                Arc::clone(self.dbus_proxy().bus()),
                &bus_name_for_object_path(path),
                path,
                self.config.clone(),
            )
        });
        self.state().connection = connection;
    }
}
