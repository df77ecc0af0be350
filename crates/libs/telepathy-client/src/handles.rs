//! Connection-scoped handle reference counting.
//!
//! The connection owns one [`HandleContext`]. Every live [`ReferencedHandles`]
//! counts once per handle it lists; when a count drops to zero the handle is
//! queued for release and a deferred sweep sends one `ReleaseHandles` per
//! handle type. Sweeps wait while `RequestHandles` or holding
//! `GetContactAttributes` calls are in flight, since those may hand back a
//! handle that is about to be released.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use telepathy_bus::{DBusError, Variant};
use tokio::sync::oneshot;

use crate::constants::{handle_type, IFACE_CONNECTION};
use crate::proxy::{defer, spawn, DBusProxy};

pub(crate) struct RequestInFlight {
    context: Arc<HandleContext>,
    ty: u32,
}

impl Drop for RequestInFlight {
    fn drop(&mut self) {
        self.context.request_landed(self.ty);
    }
}

#[derive(Default)]
struct HandleTypeState {
    refcounts: HashMap<u32, u32>,
    to_release: BTreeSet<u32>,
    requests_in_flight: u32,
    release_scheduled: bool,
}

pub(crate) struct HandleContext {
    proxy: DBusProxy,
    immortal: AtomicBool,
    types: Mutex<HashMap<u32, HandleTypeState>>,
}

impl HandleContext {
    pub(crate) fn new(proxy: DBusProxy) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            immortal: AtomicBool::new(false),
            types: Mutex::new(HashMap::new()),
        })
    }

    fn types(&self) -> MutexGuard<'_, HashMap<u32, HandleTypeState>> {
        self.types.lock().expect("handle table mutex poisoned")
    }

    fn label(&self) -> &str {
        self.proxy.object_path()
    }

    /// Services with immortal handles never see `ReleaseHandles`.
    pub(crate) fn set_immortal(&self, immortal: bool) {
        self.immortal.store(immortal, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self, ty: u32, handle: u32) -> u32 {
        self.types()
            .get(&ty)
            .and_then(|state| state.refcounts.get(&handle).copied())
            .unwrap_or(0)
    }

    /// Referenced, or unreferenced but not yet released.
    pub(crate) fn is_held(&self, ty: u32, handle: u32) -> bool {
        self.types().get(&ty).is_some_and(|state| {
            state.refcounts.contains_key(&handle) || state.to_release.contains(&handle)
        })
    }

    fn ref_handle(&self, ty: u32, handle: u32) {
        let mut types = self.types();
        let state = types.entry(ty).or_default();
        state.to_release.remove(&handle);
        *state.refcounts.entry(handle).or_insert(0) += 1;
    }

    fn unref_handle(self: &Arc<Self>, ty: u32, handle: u32) {
        let schedule = {
            let mut types = self.types();
            let state = types.entry(ty).or_default();
            let Some(count) = state.refcounts.get_mut(&handle) else {
                log::warn!("handles({}): unref of unknown handle {}/{}", self.label(), ty, handle);
                return;
            };
            *count -= 1;
            if *count > 0 {
                return;
            }
            state.refcounts.remove(&handle);
            state.to_release.insert(handle);
            if state.release_scheduled || state.requests_in_flight > 0 {
                false
            } else {
                state.release_scheduled = true;
                true
            }
        };
        if schedule {
            self.schedule_sweep(ty);
        }
    }

    fn schedule_sweep(self: &Arc<Self>, ty: u32) {
        let weak = Arc::downgrade(self);
        defer(move || {
            if let Some(context) = weak.upgrade() {
                context.release_sweep(ty);
            }
        });
    }

    fn release_sweep(&self, ty: u32) {
        let handles: Vec<u32> = {
            let mut types = self.types();
            let state = types.entry(ty).or_default();
            state.release_scheduled = false;
            if state.requests_in_flight > 0 {
                return;
            }
            std::mem::take(&mut state.to_release).into_iter().collect()
        };
        if handles.is_empty() || self.immortal.load(Ordering::SeqCst) {
            return;
        }
        if !self.proxy.is_valid() {
            log::debug!("handles({}): connection gone, not releasing {:?}", self.label(), handles);
            return;
        }

        log::trace!("handles({}): releasing {}/{:?}", self.label(), ty, handles);
        let proxy = self.proxy.clone();
        spawn(async move {
            let args = vec![Variant::U32(ty), Variant::U32List(handles)];
            if let Err(err) = proxy.call(IFACE_CONNECTION, "ReleaseHandles", args).await {
                log::warn!("handles({}): ReleaseHandles failed: {}", proxy.object_path(), err);
            }
        });
    }

    fn begin_request(&self, ty: u32) {
        self.types().entry(ty).or_default().requests_in_flight += 1;
    }

    fn request_landed(self: &Arc<Self>, ty: u32) {
        let schedule = {
            let mut types = self.types();
            let state = types.entry(ty).or_default();
            state.requests_in_flight = state.requests_in_flight.saturating_sub(1);
            if state.requests_in_flight == 0
                && !state.to_release.is_empty()
                && !state.release_scheduled
            {
                state.release_scheduled = true;
                true
            } else {
                false
            }
        };
        if schedule {
            self.schedule_sweep(ty);
        }
    }

    /// Counts a call that may hand back handles of type `ty` as in flight
    /// until the returned guard is dropped.
    pub(crate) fn track_request(self: &Arc<Self>, ty: u32) -> RequestInFlight {
        self.begin_request(ty);
        RequestInFlight {
            context: Arc::clone(self),
            ty,
        }
    }

    /// `RequestHandles(ty, names)`, retrying name by name when the batch is
    /// rejected because of a bad element.
    pub(crate) fn request_handles(self: &Arc<Self>, ty: u32, names: Vec<String>) -> PendingHandles {
        let (tx, rx) = oneshot::channel();
        let pending = PendingHandles::waiting(ty, true, names.clone(), Vec::new(), rx);
        if let Some(error) = self.proxy.invalidation() {
            return PendingHandles::failed(pending, error);
        }

        self.begin_request(ty);
        let context = Arc::clone(self);
        spawn(async move {
            let outcome = context.run_request(ty, names).await;
            context.request_landed(ty);
            let _ = tx.send(outcome);
        });
        pending
    }

    async fn run_request(self: &Arc<Self>, ty: u32, names: Vec<String>) -> HandlesOutcome {
        let mut outcome = HandlesOutcome::new(ty);
        let args = vec![Variant::U32(ty), Variant::StrList(names.clone())];
        match self.proxy.call(IFACE_CONNECTION, "RequestHandles", args).await {
            Ok(reply) => {
                let handles = reply
                    .first()
                    .and_then(Variant::as_u32_list)
                    .map(<[u32]>::to_vec)
                    .unwrap_or_default();
                if handles.len() != names.len() {
                    outcome.result = Err(DBusError::invalid_argument(
                        "RequestHandles returned a different number of handles",
                    ));
                    return outcome;
                }
                outcome.handles = ReferencedHandles::new(self, ty, handles);
                outcome.valid_names = names;
            }
            Err(err) if err.allows_fallback() && names.len() > 1 => {
                log::debug!(
                    "handles({}): RequestHandles failed with {}, retrying one by one",
                    self.label(),
                    err.name
                );
                let mut handles = Vec::new();
                for name in names {
                    let args = vec![Variant::U32(ty), Variant::StrList(vec![name.clone()])];
                    match self.proxy.call(IFACE_CONNECTION, "RequestHandles", args).await {
                        Ok(reply) => {
                            match reply.first().and_then(Variant::as_u32_list) {
                                Some([handle]) => {
                                    handles.push(*handle);
                                    outcome.valid_names.push(name);
                                }
                                _ => {
                                    outcome.invalid_names.insert(
                                        name,
                                        DBusError::invalid_argument("unexpected reply"),
                                    );
                                }
                            }
                        }
                        Err(err) => {
                            outcome.invalid_names.insert(name, err);
                        }
                    }
                }
                outcome.handles = ReferencedHandles::new(self, ty, handles);
            }
            Err(err) => outcome.result = Err(err),
        }
        outcome
    }

    /// `HoldHandles` for every handle not already held; completes without
    /// any call when all of them are.
    pub(crate) fn reference_handles(self: &Arc<Self>, ty: u32, handles: Vec<u32>) -> PendingHandles {
        if let Some(error) = self.proxy.invalidation() {
            let (_tx, rx) = oneshot::channel();
            let pending = PendingHandles::waiting(ty, false, Vec::new(), handles, rx);
            return PendingHandles::failed(pending, error);
        }

        let mut not_held = Vec::new();
        for handle in &handles {
            if !self.is_held(ty, *handle) && !not_held.contains(handle) {
                not_held.push(*handle);
            }
        }
        if not_held.is_empty() {
            log::trace!("handles({}): {:?} already held", self.label(), handles);
            let mut outcome = HandlesOutcome::new(ty);
            outcome.handles = ReferencedHandles::new(self, ty, handles.clone());
            return PendingHandles::finished(ty, false, Vec::new(), handles, outcome);
        }

        // keep the already held ones alive while the hold is in flight
        let held: Vec<u32> = handles
            .iter()
            .copied()
            .filter(|handle| !not_held.contains(handle))
            .collect();
        let keep_alive = ReferencedHandles::new(self, ty, held);

        let (tx, rx) = oneshot::channel();
        let pending = PendingHandles::waiting(ty, false, Vec::new(), handles.clone(), rx);
        let context = Arc::clone(self);
        spawn(async move {
            let outcome = context.run_hold(ty, handles, not_held).await;
            drop(keep_alive);
            let _ = tx.send(outcome);
        });
        pending
    }

    async fn run_hold(self: &Arc<Self>, ty: u32, handles: Vec<u32>, not_held: Vec<u32>) -> HandlesOutcome {
        let mut outcome = HandlesOutcome::new(ty);
        let args = vec![Variant::U32(ty), Variant::U32List(not_held.clone())];
        match self.proxy.call(IFACE_CONNECTION, "HoldHandles", args).await {
            Ok(_) => outcome.handles = ReferencedHandles::new(self, ty, handles),
            Err(err) if err.allows_fallback() && not_held.len() > 1 => {
                log::debug!(
                    "handles({}): HoldHandles failed with {}, retrying one by one",
                    self.label(),
                    err.name
                );
                let mut invalid = Vec::new();
                for handle in &not_held {
                    let args = vec![Variant::U32(ty), Variant::U32List(vec![*handle])];
                    if let Err(err) = self.proxy.call(IFACE_CONNECTION, "HoldHandles", args).await {
                        log::debug!("handles({}): handle {} invalid: {}", self.label(), handle, err);
                        invalid.push(*handle);
                    }
                }
                let valid: Vec<u32> = handles
                    .into_iter()
                    .filter(|handle| !invalid.contains(handle))
                    .collect();
                outcome.handles = ReferencedHandles::new(self, ty, valid);
                outcome.invalid_handles = invalid;
            }
            Err(err) => outcome.result = Err(err),
        }
        outcome
    }
}

struct RefInner {
    context: Weak<HandleContext>,
    handle_type: u32,
    handles: Vec<u32>,
}

impl RefInner {
    fn new(context: Weak<HandleContext>, handle_type: u32, handles: Vec<u32>) -> Self {
        if let Some(context) = context.upgrade() {
            for handle in &handles {
                context.ref_handle(handle_type, *handle);
            }
        }
        Self {
            context,
            handle_type,
            handles,
        }
    }
}

impl Clone for RefInner {
    fn clone(&self) -> Self {
        Self::new(self.context.clone(), self.handle_type, self.handles.clone())
    }
}

impl Drop for RefInner {
    fn drop(&mut self) {
        match self.context.upgrade() {
            Some(context) => {
                for handle in &self.handles {
                    context.unref_handle(self.handle_type, *handle);
                }
            }
            None if !self.handles.is_empty() => {
                log::debug!("handles: connection gone, skipping release of {:?}", self.handles);
            }
            None => {}
        }
    }
}

/// A list of handles kept alive on their connection.
///
/// Clones share one reference; mutation copies the list first, so a change
/// through one value never shows through another.
#[derive(Clone)]
pub struct ReferencedHandles {
    inner: Arc<RefInner>,
}

impl ReferencedHandles {
    pub(crate) fn new(context: &Arc<HandleContext>, handle_type: u32, handles: Vec<u32>) -> Self {
        Self {
            inner: Arc::new(RefInner::new(Arc::downgrade(context), handle_type, handles)),
        }
    }

    /// An empty list not bound to any connection.
    pub fn empty(handle_type: u32) -> Self {
        Self {
            inner: Arc::new(RefInner {
                context: Weak::new(),
                handle_type,
                handles: Vec::new(),
            }),
        }
    }

    pub fn handle_type(&self) -> u32 {
        self.inner.handle_type
    }

    pub fn handles(&self) -> &[u32] {
        &self.inner.handles
    }

    pub fn len(&self) -> usize {
        self.inner.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.handles.is_empty()
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.inner.handles.contains(&handle)
    }

    pub fn first(&self) -> Option<u32> {
        self.inner.handles.first().copied()
    }

    /// Whether the owning connection still exists.
    pub fn is_connection_alive(&self) -> bool {
        self.inner.context.strong_count() > 0
    }

    pub fn push(&mut self, handle: u32) {
        let inner = Arc::make_mut(&mut self.inner);
        if let Some(context) = inner.context.upgrade() {
            context.ref_handle(inner.handle_type, handle);
        }
        inner.handles.push(handle);
    }

    /// Removes every occurrence of `handle`, returning how many were removed.
    pub fn remove_all(&mut self, handle: u32) -> usize {
        if !self.contains(handle) {
            return 0;
        }
        let inner = Arc::make_mut(&mut self.inner);
        let before = inner.handles.len();
        inner.handles.retain(|candidate| *candidate != handle);
        let removed = before - inner.handles.len();
        if let Some(context) = inner.context.upgrade() {
            for _ in 0..removed {
                context.unref_handle(inner.handle_type, handle);
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        *self = Self {
            inner: Arc::new(RefInner {
                context: self.inner.context.clone(),
                handle_type: self.inner.handle_type,
                handles: Vec::new(),
            }),
        };
    }
}

impl PartialEq for ReferencedHandles {
    fn eq(&self, other: &Self) -> bool {
        self.inner.context.ptr_eq(&other.inner.context)
            && self.inner.handle_type == other.inner.handle_type
            && self.inner.handles == other.inner.handles
    }
}

impl Eq for ReferencedHandles {}

impl std::fmt::Debug for ReferencedHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferencedHandles")
            .field("handle_type", &self.inner.handle_type)
            .field("handles", &self.inner.handles)
            .finish()
    }
}

struct HandlesOutcome {
    result: Result<(), DBusError>,
    handles: ReferencedHandles,
    valid_names: Vec<String>,
    invalid_names: BTreeMap<String, DBusError>,
    invalid_handles: Vec<u32>,
}

impl HandlesOutcome {
    fn new(ty: u32) -> Self {
        Self {
            result: Ok(()),
            handles: ReferencedHandles::empty(ty),
            valid_names: Vec::new(),
            invalid_names: BTreeMap::new(),
            invalid_handles: Vec::new(),
        }
    }
}

/// A handle request (`RequestHandles`) or reference (`HoldHandles`) in
/// progress.
pub struct PendingHandles {
    handle_type: u32,
    is_request: bool,
    names_requested: Vec<String>,
    handles_to_reference: Vec<u32>,
    outcome: Option<HandlesOutcome>,
    rx: Option<oneshot::Receiver<HandlesOutcome>>,
}

impl PendingHandles {
    fn waiting(
        handle_type: u32,
        is_request: bool,
        names_requested: Vec<String>,
        handles_to_reference: Vec<u32>,
        rx: oneshot::Receiver<HandlesOutcome>,
    ) -> Self {
        Self {
            handle_type,
            is_request,
            names_requested,
            handles_to_reference,
            outcome: None,
            rx: Some(rx),
        }
    }

    fn finished(
        handle_type: u32,
        is_request: bool,
        names_requested: Vec<String>,
        handles_to_reference: Vec<u32>,
        outcome: HandlesOutcome,
    ) -> Self {
        Self {
            handle_type,
            is_request,
            names_requested,
            handles_to_reference,
            outcome: Some(outcome),
            rx: None,
        }
    }

    fn failed(mut pending: Self, error: DBusError) -> Self {
        let mut outcome = HandlesOutcome::new(pending.handle_type);
        outcome.result = Err(error);
        pending.outcome = Some(outcome);
        pending.rx = None;
        pending
    }

    pub fn handle_type(&self) -> u32 {
        self.handle_type
    }

    pub fn is_request(&self) -> bool {
        self.is_request
    }

    pub fn names_requested(&self) -> &[String] {
        &self.names_requested
    }

    pub fn handles_to_reference(&self) -> &[u32] {
        &self.handles_to_reference
    }

    /// `true` as soon as the outcome is known, without awaiting.
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Waits for the outcome.
    pub async fn wait(&mut self) -> Result<(), DBusError> {
        if self.outcome.is_none() {
            let outcome = match self.rx.take() {
                Some(rx) => rx.await.unwrap_or_else(|_| {
                    let mut outcome = HandlesOutcome::new(self.handle_type);
                    outcome.result = Err(DBusError::disconnected("connection dropped"));
                    outcome
                }),
                None => HandlesOutcome::new(self.handle_type),
            };
            self.outcome = Some(outcome);
        }
        match &self.outcome {
            Some(outcome) => outcome.result.clone(),
            None => Ok(()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(&self.outcome, Some(outcome) if outcome.result.is_err())
    }

    fn outcome(&self, accessor: &str) -> Option<&HandlesOutcome> {
        if self.outcome.is_none() {
            log::warn!("PendingHandles::{}() called before the operation finished", accessor);
        }
        self.outcome.as_ref()
    }

    pub fn handles(&self) -> ReferencedHandles {
        self.outcome("handles")
            .map(|outcome| outcome.handles.clone())
            .unwrap_or_else(|| ReferencedHandles::empty(self.handle_type))
    }

    pub fn valid_names(&self) -> Vec<String> {
        self.outcome("valid_names")
            .map(|outcome| outcome.valid_names.clone())
            .unwrap_or_default()
    }

    pub fn invalid_names(&self) -> BTreeMap<String, DBusError> {
        self.outcome("invalid_names")
            .map(|outcome| outcome.invalid_names.clone())
            .unwrap_or_default()
    }

    pub fn invalid_handles(&self) -> Vec<u32> {
        self.outcome("invalid_handles")
            .map(|outcome| outcome.invalid_handles.clone())
            .unwrap_or_default()
    }
}

impl Default for ReferencedHandles {
    fn default() -> Self {
        Self::empty(handle_type::NONE)
    }
}

#[cfg(test)]
mod tests {
    use telepathy_bus::error::names;
    use telepathy_bus::{Bus, MockBus};

    use super::*;
    use crate::constants::handle_type::CONTACT;

    const PATH: &str = "/org/freedesktop/Telepathy/Connection/cm/proto/me";

    fn context(bus: &Arc<MockBus>) -> Arc<HandleContext> {
        let proxy = DBusProxy::new(Arc::clone(bus) as Arc<dyn Bus>, "org.example.Conn", PATH);
        HandleContext::new(proxy)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn copies_share_one_reference() {
        let bus = Arc::new(MockBus::new());
        bus.reply(PATH, IFACE_CONNECTION, "ReleaseHandles", Vec::new());
        let ctx = context(&bus);

        let first = ReferencedHandles::new(&ctx, CONTACT, vec![5]);
        let copies: Vec<_> = (0..3).map(|_| first.clone()).collect();
        assert_eq!(ctx.refcount(CONTACT, 5), 1);
        drop(first);
        settle().await;
        assert_eq!(bus.call_count("ReleaseHandles"), 0);

        drop(copies);
        settle().await;
        assert_eq!(bus.call_count("ReleaseHandles"), 1);
        assert_eq!(
            bus.calls()[0].args,
            vec![Variant::U32(CONTACT), Variant::U32List(vec![5])]
        );
    }

    #[tokio::test]
    async fn mutation_copies_before_changing() {
        let bus = Arc::new(MockBus::new());
        let ctx = context(&bus);
        let original = ReferencedHandles::new(&ctx, CONTACT, vec![1, 2]);
        let mut copy = original.clone();

        copy.push(3);
        copy.remove_all(1);
        assert_eq!(original.handles(), &[1, 2]);
        assert_eq!(copy.handles(), &[2, 3]);
        assert_eq!(ctx.refcount(CONTACT, 1), 1);
        assert_eq!(ctx.refcount(CONTACT, 2), 2);
        assert_eq!(ctx.refcount(CONTACT, 3), 1);

        copy.clear();
        assert!(copy.is_empty());
        assert_eq!(ctx.refcount(CONTACT, 2), 1);
    }

    #[tokio::test]
    async fn rereference_before_sweep_cancels_release() {
        let bus = Arc::new(MockBus::new());
        bus.reply(PATH, IFACE_CONNECTION, "ReleaseHandles", Vec::new());
        let ctx = context(&bus);

        let first = ReferencedHandles::new(&ctx, CONTACT, vec![9]);
        drop(first);
        let again = ReferencedHandles::new(&ctx, CONTACT, vec![9]);
        settle().await;
        assert_eq!(bus.call_count("ReleaseHandles"), 0);
        drop(again);
        settle().await;
        assert_eq!(bus.call_count("ReleaseHandles"), 1);
    }

    #[tokio::test]
    async fn dropped_connection_skips_release() {
        let bus = Arc::new(MockBus::new());
        let ctx = context(&bus);
        let handles = ReferencedHandles::new(&ctx, CONTACT, vec![4]);
        drop(ctx);
        assert!(!handles.is_connection_alive());
        drop(handles);
        settle().await;
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn immortal_handles_are_never_released() {
        let bus = Arc::new(MockBus::new());
        let ctx = context(&bus);
        ctx.set_immortal(true);
        drop(ReferencedHandles::new(&ctx, CONTACT, vec![4]));
        settle().await;
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn already_held_reference_finishes_synchronously() {
        let bus = Arc::new(MockBus::new());
        let ctx = context(&bus);
        let _held = ReferencedHandles::new(&ctx, CONTACT, vec![5, 7]);

        let pending = ctx.reference_handles(CONTACT, vec![5, 7]);
        assert!(pending.is_finished());
        assert!(bus.calls().is_empty());
        assert_eq!(pending.handles(), ReferencedHandles::new(&ctx, CONTACT, vec![5, 7]));
    }

    #[tokio::test]
    async fn hold_falls_back_one_by_one() {
        let bus = Arc::new(MockBus::new());
        bus.on_call(PATH, IFACE_CONNECTION, "HoldHandles", |call| {
            match call.args.get(1).and_then(Variant::as_u32_list) {
                Some([3]) => Ok(Vec::new()),
                _ => Err(DBusError::new(names::INVALID_HANDLE, "bad handle")),
            }
        });
        let ctx = context(&bus);

        let mut pending = ctx.reference_handles(CONTACT, vec![3, 8]);
        assert!(!pending.is_finished());
        pending.wait().await.expect("partial success");
        assert_eq!(pending.handles().handles(), &[3]);
        assert_eq!(pending.invalid_handles(), vec![8]);
        assert_eq!(bus.call_count("HoldHandles"), 3);
    }

    #[tokio::test]
    async fn request_reports_invalid_names() {
        let bus = Arc::new(MockBus::new());
        bus.on_call(PATH, IFACE_CONNECTION, "RequestHandles", |call| {
            let names = call.args.get(1).and_then(Variant::as_str_list).unwrap_or_default();
            if names.iter().any(|name| name == "bogus") {
                return Err(DBusError::invalid_argument("no such contact"));
            }
            let handles: Vec<u32> = (0..names.len() as u32).map(|n| n + 10).collect();
            Ok(vec![Variant::U32List(handles)])
        });
        let ctx = context(&bus);

        let mut pending = ctx.request_handles(CONTACT, vec!["alice".into(), "bogus".into()]);
        pending.wait().await.expect("partial success");
        assert_eq!(pending.valid_names(), vec!["alice"]);
        assert!(pending.invalid_names().contains_key("bogus"));
        assert_eq!(pending.handles().handles(), &[10]);
        assert!(pending.is_request());
    }

    #[tokio::test]
    async fn sweep_waits_for_requests_in_flight() {
        let bus = Arc::new(MockBus::new());
        bus.reply(PATH, IFACE_CONNECTION, "RequestHandles", vec![Variant::U32List(vec![2])]);
        bus.reply(PATH, IFACE_CONNECTION, "ReleaseHandles", Vec::new());
        bus.pause("RequestHandles");
        let ctx = context(&bus);

        let mut pending = ctx.request_handles(CONTACT, vec!["bob".into()]);
        settle().await;
        drop(ReferencedHandles::new(&ctx, CONTACT, vec![1]));
        settle().await;
        assert_eq!(bus.call_count("ReleaseHandles"), 0);

        bus.resume("RequestHandles");
        pending.wait().await.expect("request");
        settle().await;
        assert_eq!(bus.call_count("ReleaseHandles"), 1);
    }

    #[tokio::test]
    async fn non_fallback_error_fails_the_batch() {
        let bus = Arc::new(MockBus::new());
        bus.fail(
            PATH,
            IFACE_CONNECTION,
            "HoldHandles",
            DBusError::disconnected("gone"),
        );
        let ctx = context(&bus);
        let mut pending = ctx.reference_handles(CONTACT, vec![1, 2]);
        let err = pending.wait().await.expect_err("disconnected");
        assert_eq!(err.name, names::DISCONNECTED);
        assert!(pending.is_error());
        assert!(pending.handles().is_empty());
    }
}
