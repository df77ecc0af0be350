use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use telepathy_bus::error::names;
use telepathy_bus::{Bus, DBusError, Signal, Variant, VariantMap, VariantMapExt};
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::constants::{
    connection_status, connection_status_reason, handle_type, CONNECTION_BUS_NAME_BASE,
    CONTACT_ATTR_ID, IFACE_CONNECTION, IFACE_CONNECTION_ALIASING, IFACE_CONNECTION_CONTACTS,
};
use crate::contact::{Contact, ContactPtr, ResolvedContacts};
use crate::feature::{Feature, Features};
use crate::handles::{HandleContext, PendingHandles, ReferencedHandles};
use crate::proxy::{spawn, DBusProxy};
use crate::readiness::{
    Introspectable, Introspectables, IntrospectFuture, ReadinessHelper, ReadyObject,
};

/// Change notifications published by a [`Connection`].
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    StatusChanged { status: u32, reason: u32 },
    SelfHandleChanged(u32),
    SelfContactChanged,
}

struct ConnectionState {
    status: u32,
    status_reason: u32,
    interfaces: Vec<String>,
    self_handle: u32,
    self_contact: Option<ContactPtr>,
    has_immortal_handles: bool,
    signals_connected: bool,
}

/// Proxy for a Telepathy connection.
pub struct Connection {
    readiness: ReadinessHelper<Connection>,
    handles: Arc<HandleContext>,
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    contacts: Mutex<HashMap<u32, Weak<Contact>>>,
    contact_ids: Mutex<HashMap<u32, String>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ReadyObject for Connection {
    fn readiness_helper(&self) -> &ReadinessHelper<Self> {
        &self.readiness
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("bus_name", &self.dbus_proxy().bus_name())
            .field("object_path", &self.object_path())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Error name reported when a connection drops for `reason`.
pub fn error_for_status_reason(reason: u32) -> &'static str {
    use connection_status_reason as r;
    match reason {
        r::REQUESTED => names::CANCELLED,
        r::NETWORK_ERROR => names::NETWORK_ERROR,
        r::AUTHENTICATION_FAILED => names::AUTHENTICATION_FAILED,
        r::ENCRYPTION_ERROR => names::ENCRYPTION_ERROR,
        r::NAME_IN_USE => names::NOT_YOURS,
        r::CERT_UNTRUSTED | r::CERT_SELF_SIGNED => names::CERT_UNTRUSTED,
        r::CERT_EXPIRED => names::CERT_EXPIRED,
        r::CERT_NOT_PROVIDED
        | r::CERT_NOT_ACTIVATED
        | r::CERT_HOSTNAME_MISMATCH
        | r::CERT_FINGERPRINT_MISMATCH
        | r::CERT_OTHER_ERROR => names::CERT_INVALID,
        _ => names::DISCONNECTED,
    }
}

/// Well-known bus name of the connection exported at `object_path`.
pub fn bus_name_for_object_path(object_path: &str) -> String {
    let name = object_path.trim_start_matches('/').replace('/', ".");
    if !name.starts_with(CONNECTION_BUS_NAME_BASE) {
        log::warn!("conn({}): not a connection object path", object_path);
    }
    name
}

impl Connection {
    /// Status, status reason, interfaces and self handle.
    pub const FEATURE_CORE: Feature = Feature::new("Connection", 0, true);
    /// The self contact; only meaningful while connected.
    pub const FEATURE_SELF_CONTACT: Feature = Feature::new("Connection", 1, false);

    pub fn new(bus: Arc<dyn Bus>, bus_name: &str, object_path: &str) -> Arc<Self> {
        Self::with_config(bus, bus_name, object_path, ClientConfig::default())
    }

    pub fn with_config(
        bus: Arc<dyn Bus>,
        bus_name: &str,
        object_path: &str,
        config: ClientConfig,
    ) -> Arc<Self> {
        let proxy = DBusProxy::new(bus, bus_name, object_path);
        let handles = HandleContext::new(proxy.clone());
        let (events, _) = broadcast::channel(64);
        let track_name_owner = config.track_name_owner && proxy.is_valid();
        let connection = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            readiness: ReadinessHelper::new(
                weak.clone(),
                proxy.clone(),
                connection_status::UNKNOWN,
                Self::introspectables(),
            ),
            handles,
            config,
            state: Mutex::new(ConnectionState {
                status: connection_status::UNKNOWN,
                status_reason: connection_status_reason::NONE_SPECIFIED,
                interfaces: Vec::new(),
                self_handle: 0,
                self_contact: None,
                has_immortal_handles: false,
                signals_connected: false,
            }),
            contacts: Mutex::new(HashMap::new()),
            contact_ids: Mutex::new(HashMap::new()),
            events,
        });
        if track_name_owner {
            proxy.track_name_owner();
        }
        connection
    }

    fn introspectables() -> Introspectables<Self> {
        use connection_status::{CONNECTED, CONNECTING, DISCONNECTED, UNKNOWN};
        let mut table = Introspectables::new();
        table.insert(
            Self::FEATURE_CORE,
            Introspectable::new(
                [UNKNOWN, DISCONNECTED, CONNECTING, CONNECTED],
                Features::new(),
                Vec::<String>::new(),
                Self::introspect_core,
            ),
        );
        table.insert(
            Self::FEATURE_SELF_CONTACT,
            Introspectable::new(
                [CONNECTED],
                [Self::FEATURE_CORE],
                Vec::<String>::new(),
                Self::introspect_self_contact,
            ),
        );
        table
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().expect("connection state mutex poisoned")
    }

    fn label(&self) -> &str {
        self.dbus_proxy().object_path()
    }

    pub fn object_path(&self) -> &str {
        self.dbus_proxy().object_path()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn warn_unless_ready(&self, feature: Feature, accessor: &str) {
        if !self.is_feature_ready(feature) {
            log::warn!(
                "conn({}): {}() used without {} being ready",
                self.label(),
                accessor,
                feature
            );
        }
    }

    pub fn status(&self) -> u32 {
        self.warn_unless_ready(Self::FEATURE_CORE, "status");
        self.state().status
    }

    pub fn status_reason(&self) -> u32 {
        self.warn_unless_ready(Self::FEATURE_CORE, "status_reason");
        self.state().status_reason
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.warn_unless_ready(Self::FEATURE_CORE, "interfaces");
        self.state().interfaces.clone()
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.state().interfaces.iter().any(|known| known == interface)
    }

    pub fn self_handle(&self) -> u32 {
        self.warn_unless_ready(Self::FEATURE_CORE, "self_handle");
        self.state().self_handle
    }

    pub fn self_contact(&self) -> Option<ContactPtr> {
        self.warn_unless_ready(Self::FEATURE_SELF_CONTACT, "self_contact");
        self.state().self_contact.clone()
    }

    pub fn has_immortal_handles(&self) -> bool {
        self.state().has_immortal_handles
    }

    pub async fn connect(&self) -> Result<(), DBusError> {
        self.dbus_proxy()
            .call(IFACE_CONNECTION, "Connect", Vec::new())
            .await
            .map(|_| ())
    }

    pub async fn disconnect(&self) -> Result<(), DBusError> {
        self.dbus_proxy()
            .call(IFACE_CONNECTION, "Disconnect", Vec::new())
            .await
            .map(|_| ())
    }

    fn introspect_core(connection: Arc<Self>) -> IntrospectFuture {
        Box::pin(async move { connection.introspect_main().await })
    }

    fn introspect_self_contact(connection: Arc<Self>) -> IntrospectFuture {
        Box::pin(async move { connection.refresh_self_contact().await })
    }

    async fn call_single(&self, member: &str) -> Result<Variant, DBusError> {
        let reply = self.dbus_proxy().call(IFACE_CONNECTION, member, Vec::new()).await?;
        reply
            .into_iter()
            .next()
            .ok_or_else(|| DBusError::invalid_argument(format!("{member} returned no value")))
    }

    async fn introspect_main(self: &Arc<Self>) -> Result<(), DBusError> {
        self.connect_signals_once();

        let props = match self.dbus_proxy().get_all(IFACE_CONNECTION).await {
            Ok(props) => props,
            Err(err) => {
                log::debug!(
                    "conn({}): GetAll(Connection) failed, using legacy calls: {}",
                    self.label(),
                    err
                );
                VariantMap::new()
            }
        };

        let status = match props.u32_value("Status") {
            Some(status) => status,
            None => self
                .call_single("GetStatus")
                .await?
                .as_u32()
                .ok_or_else(|| DBusError::invalid_argument("GetStatus returned a non-integer"))?,
        };

        let mut interfaces = props.str_list_value("Interfaces").map(<[String]>::to_vec);
        let mut self_handle = props.u32_value("SelfHandle");
        if status == connection_status::CONNECTED {
            if interfaces.is_none() {
                match self.call_single("GetInterfaces").await {
                    Ok(value) => interfaces = value.as_str_list().map(<[String]>::to_vec),
                    Err(err) => log::warn!("conn({}): GetInterfaces failed: {}", self.label(), err),
                }
            }
            if self_handle.is_none() {
                match self.call_single("GetSelfHandle").await {
                    Ok(value) => self_handle = value.as_u32(),
                    Err(err) => log::warn!("conn({}): GetSelfHandle failed: {}", self.label(), err),
                }
            }
        }
        let immortal = props.bool_value("HasImmortalHandles").unwrap_or(false);
        let interfaces = interfaces.unwrap_or_default();

        {
            let mut state = self.state();
            state.status = status;
            state.interfaces = interfaces.clone();
            if let Some(handle) = self_handle {
                state.self_handle = handle;
            }
            state.has_immortal_handles = immortal;
        }
        self.handles.set_immortal(immortal);
        self.readiness.force_current_status(status);
        self.readiness.set_interfaces(interfaces);
        log::debug!("conn({}): core introspected, status {}", self.label(), status);
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
            .connect_signals(IFACE_CONNECTION, Arc::downgrade(self), Self::on_signal);
    }

    fn on_signal(self: &Arc<Self>, signal: Signal) {
        match signal.member.as_str() {
            "StatusChanged" => {
                let status = signal.args.first().and_then(Variant::as_u32);
                let reason = signal.args.get(1).and_then(Variant::as_u32).unwrap_or_default();
                if let Some(status) = status {
                    self.on_status_changed(status, reason);
                }
            }
            "SelfHandleChanged" => {
                if let Some(handle) = signal.args.first().and_then(Variant::as_u32) {
                    self.on_self_handle_changed(handle);
                }
            }
            "SelfContactChanged" => {
                if let Some(handle) = signal.args.first().and_then(Variant::as_u32) {
                    self.on_self_handle_changed(handle);
                }
            }
            _ => {}
        }
    }

    fn on_status_changed(&self, status: u32, reason: u32) {
        log::debug!("conn({}): status {} (reason {})", self.label(), status, reason);
        {
            let mut state = self.state();
            state.status = status;
            state.status_reason = reason;
        }
        self.emit(ConnectionEvent::StatusChanged { status, reason });
        if status == connection_status::DISCONNECTED {
            self.dbus_proxy().invalidate(
                error_for_status_reason(reason),
                format!("ConnectionStatusReason = {reason}"),
            );
            return;
        }
        self.readiness.set_current_status(status);
    }

    fn on_self_handle_changed(self: &Arc<Self>, handle: u32) {
        {
            let mut state = self.state();
            if state.self_handle == handle {
                return;
            }
            state.self_handle = handle;
        }
        self.emit(ConnectionEvent::SelfHandleChanged(handle));
        if self.is_feature_ready(Self::FEATURE_SELF_CONTACT) {
            let connection = Arc::clone(self);
            spawn(async move {
                if let Err(err) = connection.refresh_self_contact().await {
                    log::warn!(
                        "conn({}): failed to build new self contact: {}",
                        connection.label(),
                        err
                    );
                }
            });
        }
    }

    async fn refresh_self_contact(&self) -> Result<(), DBusError> {
        let handle = self.state().self_handle;
        let resolved = self.contacts_for_handles(&[handle]).await?;
        let contact = resolved.get(handle).cloned().ok_or_else(|| {
            DBusError::not_available(format!("self handle {handle} could not be resolved"))
        })?;
        let changed = {
            let mut state = self.state();
            let changed = state
                .self_contact
                .as_ref()
                .map_or(true, |current| !Arc::ptr_eq(current, &contact));
            state.self_contact = Some(contact);
            changed
        };
        if changed && self.is_feature_ready(Self::FEATURE_SELF_CONTACT) {
            self.emit(ConnectionEvent::SelfContactChanged);
        }
        Ok(())
    }

    /// Requests handles for `names`. See [`PendingHandles`].
    pub fn request_handles(&self, handle_type: u32, names: Vec<String>) -> PendingHandles {
        self.handles.request_handles(handle_type, names)
    }

    /// References `handles`, holding any not yet held.
    pub fn reference_handles(&self, handle_type: u32, handles: Vec<u32>) -> PendingHandles {
        self.handles.reference_handles(handle_type, handles)
    }

    /// Remembers identifiers the service already told us, so resolving
    /// those handles needs no `InspectHandles` call.
    pub fn inject_contact_ids<I>(&self, ids: I)
    where
        I: IntoIterator<Item = (u32, String)>,
    {
        let mut known = self.contact_ids.lock().expect("contact id mutex poisoned");
        for (handle, id) in ids {
            if handle != 0 && !id.is_empty() {
                known.insert(handle, id);
            }
        }
    }

    fn ensure_contact(&self, handle: u32, id: String, attributes: VariantMap) -> ContactPtr {
        let mut contacts = self.contacts.lock().expect("contact cache mutex poisoned");
        if let Some(existing) = contacts.get(&handle).and_then(Weak::upgrade) {
            if existing.id() == id {
                return existing;
            }
        }
        contacts.retain(|_, contact| contact.strong_count() > 0);
        let referenced = ReferencedHandles::new(&self.handles, handle_type::CONTACT, vec![handle]);
        let contact = Arc::new(Contact::new(referenced, id, attributes));
        contacts.insert(handle, Arc::downgrade(&contact));
        contact
    }

    /// Resolves contact handles into contacts. Handles the service rejects
    /// are reported in `invalid_handles` instead of failing the batch.
    pub async fn contacts_for_handles(&self, handles: &[u32]) -> Result<ResolvedContacts, DBusError> {
        let mut unique = Vec::with_capacity(handles.len());
        for handle in handles {
            if *handle != 0 && !unique.contains(handle) {
                unique.push(*handle);
            }
        }
        let mut resolved = ResolvedContacts::default();
        if unique.is_empty() {
            return Ok(resolved);
        }

        if self.has_interface(IFACE_CONNECTION_CONTACTS) {
            let mut attribute_interfaces = Vec::new();
            if self.has_interface(IFACE_CONNECTION_ALIASING) {
                attribute_interfaces.push(IFACE_CONNECTION_ALIASING.to_owned());
            }
            // The call holds the handles, so a pending release sweep must
            // wait until the contacts built from the reply reference them.
            let in_flight = self.handles.track_request(handle_type::CONTACT);
            let outcome = self
                .contacts_from_attributes(&unique, attribute_interfaces, &mut resolved)
                .await;
            drop(in_flight);
            outcome?;
        } else {
            let (ids, invalid) = self.inspect_handles(&unique).await?;
            for (handle, id) in ids {
                resolved
                    .contacts
                    .push(self.ensure_contact(handle, id, VariantMap::new()));
            }
            resolved.invalid_handles = invalid;
        }

        if !resolved.invalid_handles.is_empty() {
            log::warn!(
                "conn({}): invalid contact handles {:?}",
                self.label(),
                resolved.invalid_handles
            );
        }
        Ok(resolved)
    }

    async fn contacts_from_attributes(
        &self,
        handles: &[u32],
        attribute_interfaces: Vec<String>,
        resolved: &mut ResolvedContacts,
    ) -> Result<(), DBusError> {
        let reply = self
            .dbus_proxy()
            .call(
                IFACE_CONNECTION_CONTACTS,
                "GetContactAttributes",
                vec![
                    Variant::U32List(handles.to_vec()),
                    Variant::StrList(attribute_interfaces),
                    Variant::Bool(true),
                ],
            )
            .await?;
        let attributes = reply
            .first()
            .and_then(Variant::as_u32_map)
            .ok_or_else(|| {
                DBusError::invalid_argument("GetContactAttributes returned an unexpected reply")
            })?;
        for handle in handles {
            match attributes.get(handle).and_then(Variant::as_map) {
                Some(attrs) => {
                    let id = attrs.str_value(CONTACT_ATTR_ID).unwrap_or_default().to_owned();
                    resolved
                        .contacts
                        .push(self.ensure_contact(*handle, id, attrs.clone()));
                }
                None => resolved.invalid_handles.push(*handle),
            }
        }
        Ok(())
    }

    async fn inspect_handles(&self, handles: &[u32]) -> Result<(Vec<(u32, String)>, Vec<u32>), DBusError> {
        let mut ids: BTreeMap<u32, String> = BTreeMap::new();
        let mut unknown = Vec::new();
        {
            let known = self.contact_ids.lock().expect("contact id mutex poisoned");
            for handle in handles {
                match known.get(handle) {
                    Some(id) => {
                        ids.insert(*handle, id.clone());
                    }
                    None => unknown.push(*handle),
                }
            }
        }

        let mut invalid = Vec::new();
        if !unknown.is_empty() {
            match self.inspect(&unknown).await {
                Ok(found) => ids.extend(unknown.iter().copied().zip(found)),
                Err(err) if err.allows_fallback() => {
                    for handle in unknown {
                        match self.inspect(&[handle]).await {
                            Ok(mut found) => {
                                if let Some(id) = found.pop() {
                                    ids.insert(handle, id);
                                }
                            }
                            Err(err) if err.allows_fallback() => invalid.push(handle),
                            Err(err) => return Err(err),
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let ordered = handles
            .iter()
            .filter_map(|handle| ids.remove(handle).map(|id| (*handle, id)))
            .collect();
        Ok((ordered, invalid))
    }

    async fn inspect(&self, handles: &[u32]) -> Result<Vec<String>, DBusError> {
        let reply = self
            .dbus_proxy()
            .call(
                IFACE_CONNECTION,
                "InspectHandles",
                vec![
                    Variant::U32(handle_type::CONTACT),
                    Variant::U32List(handles.to_vec()),
                ],
            )
            .await?;
        match reply.first().and_then(Variant::as_str_list) {
            Some(ids) if ids.len() == handles.len() => Ok(ids.to_vec()),
            _ => Err(DBusError::invalid_argument("InspectHandles returned an unexpected reply")),
        }
    }
}
