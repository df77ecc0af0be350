use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use telepathy_bus::error::names;
use telepathy_bus::{DBusError, Signal, Variant, VariantMap, VariantMapExt};
use tokio::sync::{broadcast, oneshot};

use crate::connection::Connection;
use crate::constants::{handle_type, IFACE_CHANNEL, IFACE_CHANNEL_CONFERENCE, IFACE_CHANNEL_GROUP};
use crate::contact::ContactPtr;
use crate::feature::{Feature, Features};
use crate::proxy::{DBusProxy, ListenerId};
use crate::readiness::{
    Introspectable, Introspectables, IntrospectFuture, ReadinessHelper, ReadyObject,
};

mod group;

pub use group::{GroupMemberChangeDetails, GroupMembersChangedInfo};
use group::{GroupState, QueueItem};

/// Channel properties that, when all present among the immutable
/// properties, spare the `GetAll(Channel)` round trip.
const MAIN_PROPERTIES: [&str; 8] = [
    "ChannelType",
    "Interfaces",
    "TargetHandleType",
    "TargetHandle",
    "TargetID",
    "Requested",
    "InitiatorHandle",
    "InitiatorID",
];

/// Change notifications published by a [`Channel`] once its core is ready.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    GroupFlagsChanged {
        flags: u32,
        added: u32,
        removed: u32,
    },
    GroupMembersChanged {
        added: Vec<ContactPtr>,
        local_pending: Vec<ContactPtr>,
        remote_pending: Vec<ContactPtr>,
        removed: Vec<ContactPtr>,
        details: GroupMemberChangeDetails,
    },
    GroupHandleOwnersChanged {
        owners: BTreeMap<u32, u32>,
        added: Vec<u32>,
        removed: Vec<u32>,
    },
    GroupSelfContactChanged,
    ConferenceChannelMerged {
        object_path: String,
        channel_specific_handle: u32,
    },
    ConferenceChannelRemoved {
        object_path: String,
        details: VariantMap,
    },
}

/// One legacy call, or one follow-up introspection step, in the strictly
/// sequential fallback queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IntrospectStep {
    ChannelType,
    Handle,
    Interfaces,
    Group,
    GroupFlags,
    GroupMembers,
    GroupLocalPending,
    GroupSelfHandle,
    Conference,
}

#[derive(Default)]
struct ConferenceState {
    channels: Vec<String>,
    initial_channels: Vec<String>,
    initial_invitee_handles: Vec<u32>,
    initial_invitee_contacts: Vec<ContactPtr>,
    invitation_message: String,
    original_channels: BTreeMap<u32, String>,
    signals_connected: bool,
}

struct ChannelState {
    channel_type: String,
    interfaces: Vec<String>,
    target_handle_type: u32,
    target_handle: u32,
    target_id: String,
    target_contact: Option<ContactPtr>,
    requested: bool,
    initiator_handle: u32,
    initiator_contact: Option<ContactPtr>,
    signals_connected: bool,
    group: GroupState,
    conference: ConferenceState,
}

/// Proxy for a Telepathy channel.
///
/// A channel always belongs to a [`Connection`]; when that connection is
/// invalidated the channel is invalidated as orphaned.
pub struct Channel {
    readiness: ReadinessHelper<Channel>,
    connection: Arc<Connection>,
    immutable_properties: VariantMap,
    state: Mutex<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    orphan_listener: Option<ListenerId>,
}

impl ReadyObject for Channel {
    fn readiness_helper(&self) -> &ReadinessHelper<Self> {
        &self.readiness
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("object_path", &self.object_path())
            .field("connection", &self.connection.object_path())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(id) = self.orphan_listener {
            self.connection.dbus_proxy().remove_invalidation_listener(id);
        }
    }
}

impl Channel {
    /// Main properties, interfaces and, when present, the group and
    /// conference state.
    pub const FEATURE_CORE: Feature = Feature::new("Channel", 0, true);
    /// Contacts for the conference's initial invitees.
    pub const FEATURE_CONFERENCE_INITIAL_INVITEE_CONTACTS: Feature =
        Feature::new("Channel", 1, false);

    pub fn new(
        connection: &Arc<Connection>,
        object_path: &str,
        immutable_properties: VariantMap,
    ) -> Arc<Self> {
        let proxy = DBusProxy::new(
            Arc::clone(connection.dbus_proxy().bus()),
            connection.dbus_proxy().bus_name(),
            object_path,
        );
        let (events, _) = broadcast::channel(64);
        let channel = Arc::new_cyclic(|weak: &Weak<Self>| {
            let orphan_listener = connection.is_valid().then(|| {
                let weak = weak.clone();
                connection.dbus_proxy().on_invalidated(move |_| {
                    if let Some(channel) = weak.upgrade() {
                        channel.dbus_proxy().invalidate(
                            names::ORPHANED,
                            "Connection given as the owner of this channel was invalidated",
                        );
                    }
                })
            });
            Self {
                readiness: ReadinessHelper::new(
                    weak.clone(),
                    proxy.clone(),
                    0,
                    Self::introspectables(),
                ),
                connection: Arc::clone(connection),
                immutable_properties,
                state: Mutex::new(ChannelState {
                    channel_type: String::new(),
                    interfaces: Vec::new(),
                    target_handle_type: handle_type::NONE,
                    target_handle: 0,
                    target_id: String::new(),
                    target_contact: None,
                    requested: false,
                    initiator_handle: 0,
                    initiator_contact: None,
                    signals_connected: false,
                    group: GroupState::default(),
                    conference: ConferenceState::default(),
                }),
                events,
                orphan_listener,
            }
        });

        if channel.orphan_listener.is_some() {
            if connection.config().track_name_owner && proxy.is_valid() {
                proxy.track_name_owner();
            }
        } else {
            proxy.invalidate(
                names::INVALID_ARGUMENT,
                "Connection given as the owner for a Channel was invalid",
            );
        }
        channel
    }

    fn introspectables() -> Introspectables<Self> {
        let mut table = Introspectables::new();
        table.insert(
            Self::FEATURE_CORE,
            Introspectable::new([0], Features::new(), Vec::<String>::new(), Self::introspect_core),
        );
        table.insert(
            Self::FEATURE_CONFERENCE_INITIAL_INVITEE_CONTACTS,
            Introspectable::new(
                [0],
                [Self::FEATURE_CORE],
                [IFACE_CHANNEL_CONFERENCE],
                Self::introspect_conference_invitees,
            ),
        );
        table
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel state mutex poisoned")
    }

    fn label(&self) -> &str {
        self.dbus_proxy().object_path()
    }

    pub fn object_path(&self) -> &str {
        self.dbus_proxy().object_path()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn immutable_properties(&self) -> &VariantMap {
        &self.immutable_properties
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn is_core_ready(&self) -> bool {
        self.is_feature_ready(Self::FEATURE_CORE)
    }

    fn warn_unless_ready(&self, feature: Feature, accessor: &str) {
        if !self.is_feature_ready(feature) {
            log::warn!(
                "chan({}): {}() used without {} being ready",
                self.label(),
                accessor,
                feature
            );
        }
    }

    pub fn channel_type(&self) -> String {
        self.warn_unless_ready(Self::FEATURE_CORE, "channel_type");
        self.state().channel_type.clone()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.warn_unless_ready(Self::FEATURE_CORE, "interfaces");
        self.state().interfaces.clone()
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.state().interfaces.iter().any(|known| known == interface)
    }

    pub fn target_handle_type(&self) -> u32 {
        self.warn_unless_ready(Self::FEATURE_CORE, "target_handle_type");
        self.state().target_handle_type
    }

    pub fn target_handle(&self) -> u32 {
        self.warn_unless_ready(Self::FEATURE_CORE, "target_handle");
        self.state().target_handle
    }

    pub fn target_id(&self) -> String {
        self.warn_unless_ready(Self::FEATURE_CORE, "target_id");
        self.state().target_id.clone()
    }

    /// The remote contact for one-to-one channels.
    pub fn target_contact(&self) -> Option<ContactPtr> {
        self.warn_unless_ready(Self::FEATURE_CORE, "target_contact");
        self.state().target_contact.clone()
    }

    pub fn is_requested(&self) -> bool {
        self.warn_unless_ready(Self::FEATURE_CORE, "is_requested");
        self.state().requested
    }

    pub fn initiator_contact(&self) -> Option<ContactPtr> {
        self.warn_unless_ready(Self::FEATURE_CORE, "initiator_contact");
        self.state().initiator_contact.clone()
    }

    pub fn is_conference(&self) -> bool {
        self.warn_unless_ready(Self::FEATURE_CORE, "is_conference");
        self.has_interface(IFACE_CHANNEL_CONFERENCE)
    }

    pub fn conference_channels(&self) -> Vec<String> {
        self.warn_unless_ready(Self::FEATURE_CORE, "conference_channels");
        self.state().conference.channels.clone()
    }

    pub fn conference_initial_channels(&self) -> Vec<String> {
        self.warn_unless_ready(Self::FEATURE_CORE, "conference_initial_channels");
        self.state().conference.initial_channels.clone()
    }

    pub fn conference_initial_invitee_contacts(&self) -> Vec<ContactPtr> {
        self.warn_unless_ready(
            Self::FEATURE_CONFERENCE_INITIAL_INVITEE_CONTACTS,
            "conference_initial_invitee_contacts",
        );
        self.state().conference.initial_invitee_contacts.clone()
    }

    pub fn conference_invitation_message(&self) -> String {
        self.warn_unless_ready(Self::FEATURE_CORE, "conference_invitation_message");
        self.state().conference.invitation_message.clone()
    }

    /// Channels merged into this conference, keyed by the channel-specific
    /// handle they were merged under.
    pub fn conference_original_channels(&self) -> BTreeMap<u32, String> {
        self.warn_unless_ready(Self::FEATURE_CORE, "conference_original_channels");
        self.state().conference.original_channels.clone()
    }

    /// Asks the service to close the channel. The proxy is invalidated
    /// when the service reports `Closed`.
    pub async fn close(&self) -> Result<(), DBusError> {
        self.dbus_proxy()
            .call(IFACE_CHANNEL, "Close", Vec::new())
            .await
            .map(|_| ())
    }

    fn introspect_core(channel: Arc<Self>) -> IntrospectFuture {
        Box::pin(async move { channel.introspect_main().await })
    }

    fn introspect_conference_invitees(channel: Arc<Self>) -> IntrospectFuture {
        Box::pin(async move { channel.resolve_conference_invitees().await })
    }

    fn invalidation_or(&self, fallback: &str) -> DBusError {
        self.dbus_proxy()
            .invalidation()
            .unwrap_or_else(|| DBusError::not_available(fallback))
    }

    async fn introspect_main(self: &Arc<Self>) -> Result<(), DBusError> {
        if let Err(err) = self.connection.become_ready(Features::new()).await {
            log::warn!(
                "chan({}): owning connection failed to become ready: {}",
                self.label(),
                err
            );
            self.dbus_proxy().invalidate(err.name.clone(), err.message.clone());
            return Err(err);
        }
        // The group interface may report a better one later.
        let connection_self_handle = self.connection.self_handle();
        self.state().group.self_handle = connection_self_handle;

        self.connect_signals_once();

        let mut queue = VecDeque::new();
        let props = match self.main_properties_from_immutable() {
            Some(props) => props,
            None => match self.dbus_proxy().get_all(IFACE_CHANNEL).await {
                Ok(props) => props,
                Err(err) => {
                    log::warn!(
                        "chan({}): GetAll(Channel) failed, using legacy calls: {}",
                        self.label(),
                        err
                    );
                    VariantMap::new()
                }
            },
        };
        if self.extract_main_properties(&props) {
            self.now_have_interfaces(&mut queue);
        } else {
            queue.extend([
                IntrospectStep::ChannelType,
                IntrospectStep::Handle,
                IntrospectStep::Interfaces,
            ]);
        }

        while let Some(step) = queue.pop_front() {
            if !self.is_valid() {
                return Err(self.invalidation_or("channel invalidated during introspection"));
            }
            self.run_step(step, &mut queue).await;
        }

        self.wait_for_pipeline().await?;
        log::debug!("chan({}): core introspected", self.label());
        Ok(())
    }

    fn main_properties_from_immutable(&self) -> Option<VariantMap> {
        let mut props = VariantMap::new();
        for name in MAIN_PROPERTIES {
            let value = self
                .immutable_properties
                .get(&format!("{IFACE_CHANNEL}.{name}"))?;
            props.insert(name.to_owned(), value.clone());
        }
        Some(props)
    }

    /// Applies a main property map, returning false when it is too sparse
    /// to trust.
    fn extract_main_properties(&self, props: &VariantMap) -> bool {
        let have_props = props.len() >= 4
            && props.str_value("ChannelType").is_some_and(|kind| !kind.is_empty())
            && props.contains_key("Interfaces")
            && props.contains_key("TargetHandle")
            && props.contains_key("TargetHandleType");
        if !have_props {
            log::warn!(
                "chan({}): channel properties incomplete, using legacy calls",
                self.label()
            );
            return false;
        }

        let initiator_id = props.str_value("InitiatorID").unwrap_or_default().to_owned();
        let target_id = props.str_value("TargetID").unwrap_or_default().to_owned();
        let (initiator_handle, target_handle, target_handle_type) = {
            let mut state = self.state();
            state.channel_type = props.str_value("ChannelType").unwrap_or_default().to_owned();
            state.interfaces = props.str_list_value("Interfaces").unwrap_or_default().to_vec();
            state.target_handle_type = props.u32_value("TargetHandleType").unwrap_or_default();
            state.target_handle = props.u32_value("TargetHandle").unwrap_or_default();
            state.target_id = target_id.clone();
            state.requested = props.bool_value("Requested").unwrap_or(false);
            state.initiator_handle = props.u32_value("InitiatorHandle").unwrap_or_default();
            (state.initiator_handle, state.target_handle, state.target_handle_type)
        };
        let mut ids = vec![(initiator_handle, initiator_id)];
        if target_handle_type == handle_type::CONTACT {
            ids.push((target_handle, target_id));
        }
        self.connection.inject_contact_ids(ids);
        true
    }

    async fn call_single(&self, interface: &str, member: &str) -> Result<Vec<Variant>, DBusError> {
        let reply = self.dbus_proxy().call(interface, member, Vec::new()).await?;
        if reply.is_empty() {
            return Err(DBusError::invalid_argument(format!("{member} returned no value")));
        }
        Ok(reply)
    }

    async fn run_step(self: &Arc<Self>, step: IntrospectStep, queue: &mut VecDeque<IntrospectStep>) {
        match step {
            IntrospectStep::ChannelType => match self.call_single(IFACE_CHANNEL, "GetChannelType").await {
                Ok(reply) => {
                    let kind = reply[0].as_str().unwrap_or_default().to_owned();
                    log::debug!("chan({}): legacy ChannelType {}", self.label(), kind);
                    self.state().channel_type = kind;
                }
                Err(err) => self.log_step_failure("GetChannelType", &err),
            },
            IntrospectStep::Handle => match self.call_single(IFACE_CHANNEL, "GetHandle").await {
                Ok(reply) => {
                    let kind = reply[0].as_u32().unwrap_or_default();
                    let handle = reply.get(1).and_then(Variant::as_u32).unwrap_or_default();
                    let mut state = self.state();
                    state.target_handle_type = kind;
                    state.target_handle = handle;
                }
                Err(err) => self.log_step_failure("GetHandle", &err),
            },
            IntrospectStep::Interfaces => {
                match self.call_single(IFACE_CHANNEL, "GetInterfaces").await {
                    Ok(reply) => {
                        self.state().interfaces = reply[0].as_str_list().unwrap_or_default().to_vec();
                    }
                    Err(err) => self.log_step_failure("GetInterfaces", &err),
                }
                self.now_have_interfaces(queue);
            }
            IntrospectStep::Group => self.introspect_group(queue).await,
            IntrospectStep::GroupFlags => {
                match self.call_single(IFACE_CHANNEL_GROUP, "GetGroupFlags").await {
                    Ok(reply) => self.set_initial_group_flags(reply[0].as_u32().unwrap_or_default()),
                    Err(err) => self.log_step_failure("GetGroupFlags", &err),
                }
            }
            IntrospectStep::GroupMembers => {
                match self.call_single(IFACE_CHANNEL_GROUP, "GetAllMembers").await {
                    Ok(reply) => {
                        let members = reply[0].as_u32_list().unwrap_or_default().to_vec();
                        let remote_pending = reply
                            .get(2)
                            .and_then(Variant::as_u32_list)
                            .unwrap_or_default()
                            .to_vec();
                        let mut state = self.state();
                        state.group.initial_members = members;
                        state.group.initial_remote_pending = remote_pending;
                    }
                    Err(err) => self.log_step_failure("GetAllMembers", &err),
                }
            }
            IntrospectStep::GroupLocalPending => {
                match self
                    .call_single(IFACE_CHANNEL_GROUP, "GetLocalPendingMembersWithInfo")
                    .await
                {
                    Ok(reply) => {
                        self.state().group.initial_local_pending = group::parse_local_pending(&reply[0]);
                    }
                    Err(err) => self.log_step_failure("GetLocalPendingMembersWithInfo", &err),
                }
            }
            IntrospectStep::GroupSelfHandle => {
                match self.call_single(IFACE_CHANNEL_GROUP, "GetSelfHandle").await {
                    Ok(reply) => {
                        let handle = reply[0].as_u32().unwrap_or_default();
                        if handle != 0 {
                            self.state().group.self_handle = handle;
                        }
                    }
                    Err(err) => self.log_step_failure("GetSelfHandle", &err),
                }
                self.now_have_initial_members();
            }
            IntrospectStep::Conference => self.introspect_conference().await,
        }
    }

    fn log_step_failure(&self, member: &str, err: &DBusError) {
        log::warn!("chan({}): {} failed: {}", self.label(), member, err);
    }

    /// Queues the interface-specific steps once the interfaces are known.
    fn now_have_interfaces(self: &Arc<Self>, queue: &mut VecDeque<IntrospectStep>) {
        let interfaces = self.state().interfaces.clone();
        log::debug!("chan({}): interfaces {:?}", self.label(), interfaces);
        let has_group = interfaces.iter().any(|iface| iface == IFACE_CHANNEL_GROUP);
        let has_conference = interfaces.iter().any(|iface| iface == IFACE_CHANNEL_CONFERENCE);
        self.readiness.set_interfaces(interfaces);

        if has_group {
            queue.push_back(IntrospectStep::Group);
        } else {
            self.fake_group_if_needed();
        }
        if has_conference {
            queue.push_back(IntrospectStep::Conference);
        }
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
            .connect_signals(IFACE_CHANNEL, Arc::downgrade(self), Self::on_channel_signal);
    }

    fn on_channel_signal(self: &Arc<Self>, signal: Signal) {
        if signal.member == "Closed" {
            self.on_closed();
        }
    }

    fn on_closed(&self) {
        log::debug!("chan({}): closed by the service", self.label());
        let remove_info = self.state().group.self_remove_info.clone();
        let (name, message) = match remove_info.filter(|info| info.has_reason()) {
            Some(info) => {
                let self_handle = self.state().group.self_handle;
                let name = group::error_for_removal(&info, self_handle);
                let message = info.message().unwrap_or_default().to_owned();
                (name.to_owned(), message)
            }
            None => (names::CANCELLED.to_owned(), "channel closed".to_owned()),
        };
        self.dbus_proxy().invalidate(name, message);
    }

    async fn introspect_conference(self: &Arc<Self>) {
        let connect = {
            let mut state = self.state();
            !std::mem::replace(&mut state.conference.signals_connected, true)
        };
        if connect {
            self.dbus_proxy().connect_signals(
                IFACE_CHANNEL_CONFERENCE,
                Arc::downgrade(self),
                Self::on_conference_signal,
            );
        }

        let props = match self.dbus_proxy().get_all(IFACE_CHANNEL_CONFERENCE).await {
            Ok(props) => props,
            Err(err) => {
                self.log_step_failure("GetAll(Conference)", &err);
                return;
            }
        };
        let invitee_handles = props
            .u32_list_value("InitialInviteeHandles")
            .unwrap_or_default()
            .to_vec();
        let invitee_ids = props.str_list_value("InitialInviteeIDs").unwrap_or_default();
        if invitee_ids.len() == invitee_handles.len() {
            self.connection.inject_contact_ids(
                invitee_handles.iter().copied().zip(invitee_ids.iter().cloned()),
            );
        }

        let mut state = self.state();
        let conference = &mut state.conference;
        conference.channels = props.str_list_value("Channels").unwrap_or_default().to_vec();
        conference.initial_channels = props
            .str_list_value("InitialChannels")
            .unwrap_or_default()
            .to_vec();
        conference.initial_invitee_handles = invitee_handles;
        conference.invitation_message = props
            .str_value("InvitationMessage")
            .unwrap_or_default()
            .to_owned();
        conference.original_channels = props
            .get("OriginalChannels")
            .and_then(Variant::as_u32_map)
            .map(|channels| {
                channels
                    .iter()
                    .filter_map(|(handle, path)| path.as_str().map(|path| (*handle, path.to_owned())))
                    .collect()
            })
            .unwrap_or_default();
    }

    fn on_conference_signal(self: &Arc<Self>, signal: Signal) {
        let Some(object_path) = signal.args.first().and_then(Variant::as_str).map(str::to_owned) else {
            return;
        };
        let event = match signal.member.as_str() {
            "ChannelMerged" => {
                let channel_specific_handle =
                    signal.args.get(1).and_then(Variant::as_u32).unwrap_or_default();
                let mut state = self.state();
                if state.conference.channels.contains(&object_path) {
                    return;
                }
                state.conference.channels.push(object_path.clone());
                if channel_specific_handle != 0 {
                    state
                        .conference
                        .original_channels
                        .insert(channel_specific_handle, object_path.clone());
                }
                ChannelEvent::ConferenceChannelMerged {
                    object_path,
                    channel_specific_handle,
                }
            }
            "ChannelRemoved" => {
                let details = signal.args.get(1).and_then(Variant::as_map).cloned().unwrap_or_default();
                let mut state = self.state();
                let before = state.conference.channels.len();
                state.conference.channels.retain(|path| *path != object_path);
                if state.conference.channels.len() == before {
                    return;
                }
                state
                    .conference
                    .original_channels
                    .retain(|_, path| *path != object_path);
                ChannelEvent::ConferenceChannelRemoved { object_path, details }
            }
            _ => return,
        };
        if self.is_core_ready() {
            self.emit(event);
        }
    }

    async fn resolve_conference_invitees(&self) -> Result<(), DBusError> {
        let handles = self.state().conference.initial_invitee_handles.clone();
        let resolved = self.connection.contacts_for_handles(&handles).await?;
        if !self.is_valid() {
            return Err(self.invalidation_or("channel invalidated while resolving invitees"));
        }
        self.state().conference.initial_invitee_contacts = resolved.contacts;
        Ok(())
    }

    /// Waits until every membership event queued so far has been applied.
    async fn wait_for_pipeline(self: &Arc<Self>) -> Result<(), DBusError> {
        let (tx, rx) = oneshot::channel();
        if !self.enqueue(QueueItem::Barrier(tx)) {
            return Ok(());
        }
        rx.await
            .map_err(|_| self.invalidation_or("membership pipeline stopped"))
    }
}
