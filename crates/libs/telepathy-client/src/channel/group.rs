//! Group interface state and the membership pipeline.
//!
//! Membership deltas are queued and applied one at a time by a single
//! worker task, each after its unknown handles have been resolved into
//! contacts, so notifications come out in signal order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use telepathy_bus::error::names;
use telepathy_bus::{DBusError, Signal, Variant, VariantMap, VariantMapExt};
use tokio::sync::{mpsc, oneshot};

use super::{Channel, ChannelEvent, ChannelState, IntrospectStep};
use crate::constants::{change_reason, group_flags, handle_type, IFACE_CHANNEL_GROUP};
use crate::contact::{ContactPtr, ResolvedContacts};
use crate::proxy::spawn;
use crate::readiness::ReadyObject;

const KEY_ACTOR: &str = "actor";
const KEY_CHANGE_REASON: &str = "change-reason";
const KEY_MESSAGE: &str = "message";
const KEY_ERROR: &str = "error";
const KEY_CONTACT_IDS: &str = "contact-ids";

/// Details attached to a membership change.
///
/// Cloning shares the detail map.
#[derive(Clone, Debug, Default)]
pub struct GroupMemberChangeDetails {
    actor: Option<ContactPtr>,
    details: Arc<VariantMap>,
}

impl GroupMemberChangeDetails {
    pub(crate) fn new(actor: Option<ContactPtr>, details: VariantMap) -> Self {
        Self {
            actor,
            details: Arc::new(details),
        }
    }

    pub fn actor(&self) -> Option<&ContactPtr> {
        self.actor.as_ref()
    }

    pub fn actor_handle(&self) -> u32 {
        self.details.u32_value(KEY_ACTOR).unwrap_or_default()
    }

    pub fn has_reason(&self) -> bool {
        self.details.contains_key(KEY_CHANGE_REASON)
    }

    pub fn reason(&self) -> u32 {
        self.details.u32_value(KEY_CHANGE_REASON).unwrap_or(change_reason::NONE)
    }

    pub fn message(&self) -> Option<&str> {
        self.details.str_value(KEY_MESSAGE)
    }

    /// D-Bus error name the service attached to the change, if any.
    pub fn error(&self) -> Option<&str> {
        self.details.str_value(KEY_ERROR)
    }

    pub fn all_details(&self) -> &VariantMap {
        &self.details
    }
}

/// One membership delta, as received or as synthesized from the initial
/// group state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupMembersChangedInfo {
    pub added: Vec<u32>,
    pub removed: Vec<u32>,
    pub local_pending: Vec<u32>,
    pub remote_pending: Vec<u32>,
    pub actor: u32,
    pub reason: u32,
    pub message: String,
    pub details: VariantMap,
}

impl GroupMembersChangedInfo {
    /// Builds an event from the legacy `MembersChanged` arguments.
    pub fn from_legacy(
        message: String,
        added: Vec<u32>,
        removed: Vec<u32>,
        local_pending: Vec<u32>,
        remote_pending: Vec<u32>,
        actor: u32,
        reason: u32,
    ) -> Self {
        let mut details = VariantMap::new();
        if actor != 0 {
            details.insert(KEY_ACTOR.to_owned(), Variant::U32(actor));
        }
        if reason != change_reason::NONE {
            details.insert(KEY_CHANGE_REASON.to_owned(), Variant::U32(reason));
        }
        if !message.is_empty() {
            details.insert(KEY_MESSAGE.to_owned(), Variant::Str(message.clone()));
        }
        Self {
            added,
            removed,
            local_pending,
            remote_pending,
            actor,
            reason,
            message,
            details,
        }
    }

    /// Builds an event from `MembersChangedDetailed` arguments.
    pub fn from_details(
        added: Vec<u32>,
        removed: Vec<u32>,
        local_pending: Vec<u32>,
        remote_pending: Vec<u32>,
        details: VariantMap,
    ) -> Self {
        Self {
            added,
            removed,
            local_pending,
            remote_pending,
            actor: details.u32_value(KEY_ACTOR).unwrap_or_default(),
            reason: details.u32_value(KEY_CHANGE_REASON).unwrap_or(change_reason::NONE),
            message: details.str_value(KEY_MESSAGE).unwrap_or_default().to_owned(),
            details,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.local_pending.is_empty()
            && self.remote_pending.is_empty()
    }

    fn contact_ids(&self) -> Vec<(u32, String)> {
        self.details
            .get(KEY_CONTACT_IDS)
            .and_then(Variant::as_u32_map)
            .map(|ids| {
                ids.iter()
                    .filter_map(|(handle, id)| id.as_str().map(|id| (*handle, id.to_owned())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(super) struct LocalPendingInfo {
    to_be_added: u32,
    actor: u32,
    reason: u32,
    message: String,
}

/// Parses a `GetLocalPendingMembersWithInfo` / `LocalPendingMembers` value.
pub(super) fn parse_local_pending(value: &Variant) -> Vec<LocalPendingInfo> {
    value
        .as_list()
        .unwrap_or_default()
        .iter()
        .filter_map(|entry| {
            let fields = entry.as_list()?;
            Some(LocalPendingInfo {
                to_be_added: fields.first()?.as_u32()?,
                actor: fields.get(1).and_then(Variant::as_u32).unwrap_or_default(),
                reason: fields.get(2).and_then(Variant::as_u32).unwrap_or_default(),
                message: fields
                    .get(3)
                    .and_then(Variant::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            })
        })
        .collect()
}

/// Error name for a channel closed after we were removed with `details`.
pub(super) fn error_for_removal(details: &GroupMemberChangeDetails, self_handle: u32) -> &'static str {
    match details.reason() {
        change_reason::OFFLINE => names::OFFLINE,
        change_reason::KICKED => names::CHANNEL_KICKED,
        change_reason::BUSY => names::BUSY,
        change_reason::BANNED => names::CHANNEL_BANNED,
        change_reason::INVALID_CONTACT => names::DOES_NOT_EXIST,
        change_reason::NO_ANSWER => names::NO_ANSWER,
        change_reason::PERMISSION_DENIED => names::PERMISSION_DENIED,
        _ if details.actor_handle() == self_handle => names::CANCELLED,
        _ => names::TERMINATED,
    }
}

pub(super) enum QueueItem {
    Members { info: GroupMembersChangedInfo, counted: bool },
    Barrier(oneshot::Sender<()>),
}

#[derive(Default)]
pub(super) struct GroupState {
    flags: u32,
    using_members_changed_detailed: bool,
    handle_owners_available: bool,
    handle_owners: BTreeMap<u32, u32>,
    pub(super) self_handle: u32,
    self_contact: Option<ContactPtr>,
    members: BTreeMap<u32, ContactPtr>,
    local_pending: BTreeMap<u32, (ContactPtr, GroupMemberChangeDetails)>,
    remote_pending: BTreeMap<u32, ContactPtr>,
    pub(super) initial_members: Vec<u32>,
    pub(super) initial_remote_pending: Vec<u32>,
    pub(super) initial_local_pending: Vec<LocalPendingInfo>,
    have_members: bool,
    pub(super) self_remove_info: Option<GroupMemberChangeDetails>,
    queue: Option<mpsc::UnboundedSender<QueueItem>>,
    queued_deltas: usize,
    signals_connected: bool,
}

impl GroupState {
    fn knows(&self, handle: u32) -> bool {
        self.members.contains_key(&handle)
            || self.local_pending.contains_key(&handle)
            || self.remote_pending.contains_key(&handle)
    }

    fn find_contact(&self, handle: u32) -> Option<ContactPtr> {
        self.members
            .get(&handle)
            .or_else(|| self.local_pending.get(&handle).map(|(contact, _)| contact))
            .or_else(|| self.remote_pending.get(&handle))
            .cloned()
    }

    fn lookup(&self, resolved: &ResolvedContacts, handle: u32) -> Option<ContactPtr> {
        self.find_contact(handle)
            .or_else(|| resolved.get(handle).cloned())
    }

    fn take_contact(&mut self, handle: u32) -> Option<ContactPtr> {
        self.members
            .remove(&handle)
            .or_else(|| self.local_pending.remove(&handle).map(|(contact, _)| contact))
            .or_else(|| self.remote_pending.remove(&handle))
    }

    fn send(&self, item: QueueItem) -> bool {
        match &self.queue {
            Some(queue) => {
                let _ = queue.send(item);
                true
            }
            None => false,
        }
    }
}

fn group_properties_sufficient(props: &VariantMap) -> bool {
    props.len() >= 6
        && props
            .u32_value("GroupFlags")
            .is_some_and(|flags| flags & group_flags::PROPERTIES != 0)
        && [
            "HandleOwners",
            "LocalPendingMembers",
            "Members",
            "RemotePendingMembers",
            "SelfHandle",
        ]
        .iter()
        .all(|key| props.contains_key(*key))
}

fn u32_args(signal: &Signal, index: usize) -> Vec<u32> {
    signal
        .args
        .get(index)
        .and_then(Variant::as_u32_list)
        .unwrap_or_default()
        .to_vec()
}

impl Channel {
    pub(super) async fn introspect_group(self: &Arc<Self>, queue: &mut VecDeque<IntrospectStep>) {
        self.connect_group_signals_once();

        let props = match self.dbus_proxy().get_all(IFACE_CHANNEL_GROUP).await {
            Ok(props) => props,
            Err(err) => {
                log::warn!(
                    "chan({}): GetAll(Group) failed, using legacy calls: {}",
                    self.label(),
                    err
                );
                VariantMap::new()
            }
        };
        if !group_properties_sufficient(&props) {
            queue.extend([
                IntrospectStep::GroupFlags,
                IntrospectStep::GroupMembers,
                IntrospectStep::GroupLocalPending,
                IntrospectStep::GroupSelfHandle,
            ]);
            return;
        }

        self.set_initial_group_flags(props.u32_value("GroupFlags").unwrap_or_default());
        let identifiers: Vec<(u32, String)> = props
            .get("MemberIdentifiers")
            .and_then(Variant::as_u32_map)
            .map(|ids| {
                ids.iter()
                    .filter_map(|(handle, id)| id.as_str().map(|id| (*handle, id.to_owned())))
                    .collect()
            })
            .unwrap_or_default();
        self.connection.inject_contact_ids(identifiers);
        {
            let mut state = self.state();
            let group = &mut state.group;
            group.handle_owners = props
                .get("HandleOwners")
                .and_then(Variant::as_u32_map)
                .map(|owners| {
                    owners
                        .iter()
                        .filter_map(|(handle, owner)| owner.as_u32().map(|owner| (*handle, owner)))
                        .collect()
                })
                .unwrap_or_default();
            group.initial_members = props.u32_list_value("Members").unwrap_or_default().to_vec();
            group.initial_remote_pending = props
                .u32_list_value("RemotePendingMembers")
                .unwrap_or_default()
                .to_vec();
            group.initial_local_pending = props
                .get("LocalPendingMembers")
                .map(parse_local_pending)
                .unwrap_or_default();
            let self_handle = props.u32_value("SelfHandle").unwrap_or_default();
            if self_handle != 0 {
                group.self_handle = self_handle;
            }
        }
        self.now_have_initial_members();
    }

    pub(super) fn set_initial_group_flags(&self, flags: u32) {
        let mut state = self.state();
        let group = &mut state.group;
        group.flags = flags;
        group.using_members_changed_detailed = flags & group_flags::MEMBERS_CHANGED_DETAILED != 0;
        group.handle_owners_available = flags & group_flags::HANDLE_OWNERS_NOT_AVAILABLE == 0;
        log::debug!(
            "chan({}): group flags {:#x}, detailed members changes: {}",
            self.label(),
            flags,
            group.using_members_changed_detailed
        );
    }

    /// Turns the initial group state into pipeline events: one for the
    /// members and remote-pending members, then one per local-pending
    /// member, since each may carry its own actor, reason and message.
    pub(super) fn now_have_initial_members(self: &Arc<Self>) {
        let mut state = self.state();
        if state.group.have_members {
            return;
        }
        state.group.have_members = true;

        let mut events = vec![GroupMembersChangedInfo {
            added: std::mem::take(&mut state.group.initial_members),
            remote_pending: std::mem::take(&mut state.group.initial_remote_pending),
            ..GroupMembersChangedInfo::default()
        }];
        let mut seen = Vec::new();
        for info in std::mem::take(&mut state.group.initial_local_pending) {
            if seen.contains(&info.to_be_added) {
                continue;
            }
            seen.push(info.to_be_added);
            events.push(GroupMembersChangedInfo::from_legacy(
                info.message,
                Vec::new(),
                Vec::new(),
                vec![info.to_be_added],
                Vec::new(),
                info.actor,
                info.reason,
            ));
        }

        self.ensure_pipeline(&mut state);
        for info in events {
            state.group.send(QueueItem::Members { info, counted: false });
        }
    }

    /// One-to-one channels without a group interface are presented as a
    /// group of ourselves and the target. Other group-less channels still
    /// go through the pipeline once so the initiator and target contacts
    /// get resolved.
    pub(super) fn fake_group_if_needed(self: &Arc<Self>) {
        let mut state = self.state();
        if state.group.have_members {
            return;
        }
        let mut members = Vec::new();
        if state.target_handle_type == handle_type::CONTACT && state.target_handle != 0 {
            if state.group.self_handle != 0 {
                members.push(state.group.self_handle);
            }
            if !members.contains(&state.target_handle) {
                members.push(state.target_handle);
            }
        }
        state.group.initial_members = members;
        drop(state);
        self.now_have_initial_members();
    }

    fn ensure_pipeline(self: &Arc<Self>, state: &mut ChannelState) {
        if state.group.queue.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.group.queue = Some(tx);
        let weak = Arc::downgrade(self);
        spawn(async move {
            while let Some(item) = rx.recv().await {
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                if !channel.is_valid() {
                    break;
                }
                match item {
                    QueueItem::Members { info, counted } => {
                        channel.process_members_changed(info).await;
                        if counted {
                            let mut state = channel.state();
                            state.group.queued_deltas = state.group.queued_deltas.saturating_sub(1);
                        }
                    }
                    QueueItem::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
    }

    /// Queues `item` behind every pending membership event. Returns false
    /// when the pipeline has not been started.
    pub(super) fn enqueue(&self, item: QueueItem) -> bool {
        self.state().group.send(item)
    }

    /// Applies the oldest queued membership event.
    async fn process_members_changed(self: &Arc<Self>, info: GroupMembersChangedInfo) {
        let to_build = {
            let state = self.state();
            let group = &state.group;
            let mut to_build: Vec<u32> = Vec::new();
            let mut want = |handle: u32| {
                if handle != 0 && !to_build.contains(&handle) {
                    to_build.push(handle);
                }
            };
            for handle in info
                .added
                .iter()
                .chain(&info.local_pending)
                .chain(&info.remote_pending)
            {
                if !group.knows(*handle) {
                    want(*handle);
                }
            }
            if !group.knows(info.actor) {
                want(info.actor);
            }
            if state.initiator_contact.is_none() {
                want(state.initiator_handle);
            }
            if state.target_contact.is_none() && state.target_handle_type == handle_type::CONTACT {
                want(state.target_handle);
            }
            want(group.self_handle);
            to_build
        };

        let resolved = match self.connection.contacts_for_handles(&to_build).await {
            Ok(resolved) => resolved,
            Err(err) => {
                log::warn!(
                    "chan({}): resolving group contacts {:?} failed: {}",
                    self.label(),
                    to_build,
                    err
                );
                ResolvedContacts {
                    contacts: Vec::new(),
                    invalid_handles: to_build,
                }
            }
        };
        if !self.is_valid() {
            return;
        }

        let core_ready = self.is_core_ready();
        let (event, self_changed) = self.apply_members_changed(&info, &resolved);
        if !core_ready {
            return;
        }
        if let Some(event) = event {
            self.emit(event);
        }
        if self_changed {
            self.emit(ChannelEvent::GroupSelfContactChanged);
        }
    }

    fn apply_members_changed(
        &self,
        info: &GroupMembersChangedInfo,
        resolved: &ResolvedContacts,
    ) -> (Option<ChannelEvent>, bool) {
        let mut state = self.state();
        let label = self.label();
        let actor = if info.actor != 0 {
            state.group.lookup(resolved, info.actor)
        } else {
            None
        };
        let details = GroupMemberChangeDetails::new(actor, info.details.clone());
        let mut added = Vec::new();
        let mut local_pending = Vec::new();
        let mut remote_pending = Vec::new();
        let mut removed = Vec::new();
        let mut dropped = Vec::new();

        let group = &mut state.group;
        for handle in &info.added {
            if group.members.contains_key(handle) {
                continue;
            }
            let Some(contact) = group.lookup(resolved, *handle) else {
                dropped.push(*handle);
                continue;
            };
            group.take_contact(*handle);
            group.members.insert(*handle, Arc::clone(&contact));
            added.push(contact);
        }
        for handle in &info.local_pending {
            if group.local_pending.contains_key(handle) {
                continue;
            }
            let Some(contact) = group.lookup(resolved, *handle) else {
                dropped.push(*handle);
                continue;
            };
            group.take_contact(*handle);
            group
                .local_pending
                .insert(*handle, (Arc::clone(&contact), details.clone()));
            local_pending.push(contact);
        }
        for handle in &info.remote_pending {
            if group.remote_pending.contains_key(handle) {
                continue;
            }
            let Some(contact) = group.lookup(resolved, *handle) else {
                dropped.push(*handle);
                continue;
            };
            group.take_contact(*handle);
            group.remote_pending.insert(*handle, Arc::clone(&contact));
            remote_pending.push(contact);
        }
        for handle in &info.removed {
            if let Some(contact) = group.take_contact(*handle) {
                removed.push(contact);
            }
        }
        if !dropped.is_empty() {
            log::warn!(
                "chan({}): dropping group members that could not be resolved: {:?}",
                label,
                dropped
            );
        }

        let mut self_changed = false;
        if group.self_handle != 0 {
            let current = group.lookup(resolved, group.self_handle);
            let differs = match (&current, &group.self_contact) {
                (Some(new), Some(old)) => !Arc::ptr_eq(new, old),
                (None, None) => false,
                _ => true,
            };
            if differs {
                group.self_contact = current;
                self_changed = true;
            }
        }

        if state.initiator_contact.is_none() && state.initiator_handle != 0 {
            state.initiator_contact = resolved.get(state.initiator_handle).cloned();
        }
        if state.target_contact.is_none()
            && state.target_handle_type == handle_type::CONTACT
            && state.target_handle != 0
        {
            state.target_contact = resolved.get(state.target_handle).cloned();
        }

        if added.is_empty() && local_pending.is_empty() && remote_pending.is_empty() && removed.is_empty() {
            return (None, self_changed);
        }
        let event = ChannelEvent::GroupMembersChanged {
            added,
            local_pending,
            remote_pending,
            removed,
            details,
        };
        (Some(event), self_changed)
    }

    fn connect_group_signals_once(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.group.signals_connected {
                return;
            }
            state.group.signals_connected = true;
        }
        self.dbus_proxy()
            .connect_signals(IFACE_CHANNEL_GROUP, Arc::downgrade(self), Self::on_group_signal);
    }

    fn on_group_signal(self: &Arc<Self>, signal: Signal) {
        match signal.member.as_str() {
            "MembersChanged" => {
                let info = GroupMembersChangedInfo::from_legacy(
                    signal.args.first().and_then(Variant::as_str).unwrap_or_default().to_owned(),
                    u32_args(&signal, 1),
                    u32_args(&signal, 2),
                    u32_args(&signal, 3),
                    u32_args(&signal, 4),
                    signal.args.get(5).and_then(Variant::as_u32).unwrap_or_default(),
                    signal.args.get(6).and_then(Variant::as_u32).unwrap_or_default(),
                );
                self.on_members_changed(info, false);
            }
            "MembersChangedDetailed" => {
                let info = GroupMembersChangedInfo::from_details(
                    u32_args(&signal, 0),
                    u32_args(&signal, 1),
                    u32_args(&signal, 2),
                    u32_args(&signal, 3),
                    signal.args.get(4).and_then(Variant::as_map).cloned().unwrap_or_default(),
                );
                self.on_members_changed(info, true);
            }
            "GroupFlagsChanged" => {
                let added = signal.args.first().and_then(Variant::as_u32).unwrap_or_default();
                let removed = signal.args.get(1).and_then(Variant::as_u32).unwrap_or_default();
                self.on_group_flags_changed(added, removed);
            }
            "HandleOwnersChanged" => {
                let added: BTreeMap<u32, u32> = signal
                    .args
                    .first()
                    .and_then(Variant::as_u32_map)
                    .map(|owners| {
                        owners
                            .iter()
                            .filter_map(|(handle, owner)| owner.as_u32().map(|owner| (*handle, owner)))
                            .collect()
                    })
                    .unwrap_or_default();
                self.on_handle_owners_changed(added, u32_args(&signal, 1));
            }
            "SelfHandleChanged" => {
                if let Some(handle) = signal.args.first().and_then(Variant::as_u32) {
                    self.on_self_handle_changed(handle);
                }
            }
            "SelfContactChanged" => {
                if let Some(handle) = signal.args.first().and_then(Variant::as_u32) {
                    if let Some(id) = signal.args.get(1).and_then(Variant::as_str) {
                        self.connection.inject_contact_ids([(handle, id.to_owned())]);
                    }
                    self.on_self_handle_changed(handle);
                }
            }
            _ => {}
        }
    }

    fn on_members_changed(self: &Arc<Self>, info: GroupMembersChangedInfo, detailed: bool) {
        let mut state = self.state();
        // Only one of the two signals is honoured so each change is seen once.
        if detailed != state.group.using_members_changed_detailed {
            return;
        }
        log::debug!(
            "chan({}): members changed: {} added, {} removed, {} local pending, {} remote pending",
            self.label(),
            info.added.len(),
            info.removed.len(),
            info.local_pending.len(),
            info.remote_pending.len()
        );
        if !state.group.have_members {
            log::debug!(
                "chan({}): still waiting for initial group members, ignoring delta",
                self.label()
            );
            return;
        }
        if info.is_empty() {
            log::debug!("chan({}): empty membership delta skipped", self.label());
            return;
        }

        let self_handle = state.group.self_handle;
        if self_handle != 0 && info.removed.contains(&self_handle) {
            if info.reason == change_reason::RENAMED {
                drop(state);
                let replacements = info.added.len() + info.local_pending.len() + info.remote_pending.len();
                if info.removed.len() != 1 || replacements != 1 {
                    log::warn!(
                        "chan({}): rename of the self handle must remove one handle and add one, ignoring",
                        self.label()
                    );
                    return;
                }
                let new_handle = info
                    .added
                    .iter()
                    .chain(&info.local_pending)
                    .chain(&info.remote_pending)
                    .next()
                    .copied()
                    .unwrap_or_default();
                self.on_self_handle_changed(new_handle);
                return;
            }
            // Closed usually follows right away, before the actor could be resolved.
            let actor = state.group.find_contact(info.actor);
            state.group.self_remove_info = Some(GroupMemberChangeDetails::new(actor, info.details.clone()));
        }

        if state.group.queued_deltas >= self.connection.config().group_queue_capacity {
            drop(state);
            log::warn!(
                "chan({}): membership event queue overflowed, membership is no longer reliable",
                self.label()
            );
            self.dbus_proxy().invalidate(
                names::INCONSISTENT,
                "Too many group membership changes queued",
            );
            return;
        }

        self.connection.inject_contact_ids(info.contact_ids());
        state.group.queued_deltas += 1;
        state.group.send(QueueItem::Members { info, counted: true });
    }

    fn on_group_flags_changed(&self, added: u32, removed: u32) {
        let flags = {
            let mut state = self.state();
            let group = &mut state.group;
            let flags = (group.flags | added) & !removed;
            if flags == group.flags {
                return;
            }
            group.flags = flags;
            if flags & group_flags::MEMBERS_CHANGED_DETAILED != 0
                && !group.using_members_changed_detailed
            {
                group.using_members_changed_detailed = true;
                log::debug!("chan({}): switching to detailed membership changes", self.label());
            }
            flags
        };
        if self.is_core_ready() {
            self.emit(ChannelEvent::GroupFlagsChanged { flags, added, removed });
        }
    }

    fn on_handle_owners_changed(&self, added: BTreeMap<u32, u32>, removed: Vec<u32>) {
        let (owners, emit_added, emit_removed) = {
            let mut state = self.state();
            let group = &mut state.group;
            if !group.handle_owners_available {
                log::debug!(
                    "chan({}): handle owners not available, ignoring delta",
                    self.label()
                );
                return;
            }
            let mut emit_added = Vec::new();
            for (handle, owner) in added {
                if group.handle_owners.insert(handle, owner) != Some(owner) {
                    emit_added.push(handle);
                }
            }
            let mut emit_removed = Vec::new();
            for handle in removed {
                if group.handle_owners.remove(&handle).is_some() {
                    emit_removed.push(handle);
                }
            }
            (group.handle_owners.clone(), emit_added, emit_removed)
        };
        if (!emit_added.is_empty() || !emit_removed.is_empty()) && self.is_core_ready() {
            self.emit(ChannelEvent::GroupHandleOwnersChanged {
                owners,
                added: emit_added,
                removed: emit_removed,
            });
        }
    }

    fn on_self_handle_changed(self: &Arc<Self>, handle: u32) {
        {
            let mut state = self.state();
            if state.group.self_handle == handle {
                return;
            }
            state.group.self_handle = handle;
        }
        log::debug!("chan({}): group self handle is now {}", self.label(), handle);
        // An empty event re-resolves the self contact in order.
        self.enqueue(QueueItem::Members {
            info: GroupMembersChangedInfo::default(),
            counted: false,
        });
    }

    fn group_state_warn(&self, accessor: &str) {
        self.warn_unless_ready(Self::FEATURE_CORE, accessor);
        if !self.has_interface(IFACE_CHANNEL_GROUP) {
            log::warn!(
                "chan({}): {}() used on a channel without the group interface",
                self.label(),
                accessor
            );
        }
    }

    pub fn group_flags(&self) -> u32 {
        self.group_state_warn("group_flags");
        self.state().group.flags
    }

    pub fn group_can_add_contacts(&self) -> bool {
        self.group_flags() & group_flags::CAN_ADD != 0
    }

    pub fn group_can_remove_contacts(&self) -> bool {
        self.group_flags() & group_flags::CAN_REMOVE != 0
    }

    pub fn group_can_rescind_contacts(&self) -> bool {
        self.group_flags() & group_flags::CAN_RESCIND != 0
    }

    pub fn group_can_add_contacts_with_message(&self) -> bool {
        self.group_flags() & group_flags::MESSAGE_ADD != 0
    }

    pub fn group_can_remove_contacts_with_message(&self) -> bool {
        self.group_flags() & group_flags::MESSAGE_REMOVE != 0
    }

    pub fn group_can_depart_with_message(&self) -> bool {
        self.group_flags() & group_flags::MESSAGE_DEPART != 0
    }

    /// Current members, ordered by handle.
    pub fn group_contacts(&self) -> Vec<ContactPtr> {
        self.warn_unless_ready(Self::FEATURE_CORE, "group_contacts");
        self.state().group.members.values().cloned().collect()
    }

    pub fn group_local_pending_contacts(&self) -> Vec<ContactPtr> {
        self.warn_unless_ready(Self::FEATURE_CORE, "group_local_pending_contacts");
        self.state()
            .group
            .local_pending
            .values()
            .map(|(contact, _)| Arc::clone(contact))
            .collect()
    }

    pub fn group_remote_pending_contacts(&self) -> Vec<ContactPtr> {
        self.warn_unless_ready(Self::FEATURE_CORE, "group_remote_pending_contacts");
        self.state().group.remote_pending.values().cloned().collect()
    }

    /// Why `handle` is waiting for our approval.
    pub fn group_local_pending_contact_change_info(
        &self,
        handle: u32,
    ) -> Option<GroupMemberChangeDetails> {
        self.warn_unless_ready(Self::FEATURE_CORE, "group_local_pending_contact_change_info");
        self.state()
            .group
            .local_pending
            .get(&handle)
            .map(|(_, details)| details.clone())
    }

    /// Details of the change that removed us, once that happened.
    pub fn group_self_contact_remove_info(&self) -> Option<GroupMemberChangeDetails> {
        self.warn_unless_ready(Self::FEATURE_CORE, "group_self_contact_remove_info");
        self.state().group.self_remove_info.clone()
    }

    pub fn group_are_handle_owners_available(&self) -> bool {
        self.group_state_warn("group_are_handle_owners_available");
        self.state().group.handle_owners_available
    }

    /// Channel-specific handles mapped to their global owners.
    pub fn group_handle_owners(&self) -> BTreeMap<u32, u32> {
        self.group_state_warn("group_handle_owners");
        self.state().group.handle_owners.clone()
    }

    pub fn group_self_handle(&self) -> u32 {
        self.warn_unless_ready(Self::FEATURE_CORE, "group_self_handle");
        self.state().group.self_handle
    }

    pub fn group_self_contact(&self) -> Option<ContactPtr> {
        self.warn_unless_ready(Self::FEATURE_CORE, "group_self_contact");
        self.state().group.self_contact.clone()
    }

    fn require_group(&self, operation: &str) -> Result<(), DBusError> {
        if !self.is_core_ready() {
            return Err(DBusError::not_available(format!(
                "{operation} requires the channel core to be ready"
            )));
        }
        if !self.has_interface(IFACE_CHANNEL_GROUP) {
            return Err(DBusError::new(
                names::NOT_IMPLEMENTED,
                "Channel does not support the group interface",
            ));
        }
        Ok(())
    }

    /// Adds contacts to the group, or accepts them from local pending.
    pub async fn group_add_contacts(&self, handles: &[u32], message: &str) -> Result<(), DBusError> {
        self.require_group("group_add_contacts")?;
        if handles.is_empty() {
            return Err(DBusError::invalid_argument("Unable to add no contacts"));
        }
        self.dbus_proxy()
            .call(
                IFACE_CHANNEL_GROUP,
                "AddMembers",
                vec![Variant::U32List(handles.to_vec()), Variant::from(message)],
            )
            .await
            .map(|_| ())
    }

    /// Removes contacts from the group, rejects or rescinds pending ones.
    pub async fn group_remove_contacts(
        &self,
        handles: &[u32],
        message: &str,
        reason: u32,
    ) -> Result<(), DBusError> {
        self.require_group("group_remove_contacts")?;
        if handles.is_empty() {
            return Err(DBusError::invalid_argument("Unable to remove no contacts"));
        }
        let mut args = vec![Variant::U32List(handles.to_vec()), Variant::from(message)];
        let member = if reason == change_reason::NONE {
            "RemoveMembers"
        } else {
            args.push(Variant::U32(reason));
            "RemoveMembersWithReason"
        };
        self.dbus_proxy()
            .call(IFACE_CHANNEL_GROUP, member, args)
            .await
            .map(|_| ())
    }
}
