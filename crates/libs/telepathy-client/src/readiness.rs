//! Generic incremental introspection.
//!
//! Each proxy type declares a static table of [`Introspectable`]s, one per
//! [`Feature`]. A [`ReadinessHelper`] walks that table for one proxy
//! instance: it schedules dependencies before dependents, never runs the
//! same feature twice concurrently, skips features whose status or interface
//! preconditions do not hold, and resolves every [`PendingReady`] once the
//! features it asked for have landed.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use telepathy_bus::error::names;
use telepathy_bus::DBusError;
use tokio::sync::oneshot;

use crate::feature::{Feature, Features};
use crate::proxy::{spawn, DBusProxy};

pub type IntrospectFuture = Pin<Box<dyn Future<Output = Result<(), DBusError>> + Send + 'static>>;
pub type IntrospectFn<T> = fn(Arc<T>) -> IntrospectFuture;

/// Preconditions and the introspection step for one feature.
pub struct Introspectable<T> {
    pub applicable_statuses: BTreeSet<u32>,
    pub depends_on_features: Features,
    pub depends_on_interfaces: BTreeSet<String>,
    pub introspect: IntrospectFn<T>,
}

impl<T> Introspectable<T> {
    pub fn new<S, F, I>(
        applicable_statuses: S,
        depends_on_features: F,
        depends_on_interfaces: I,
        introspect: IntrospectFn<T>,
    ) -> Self
    where
        S: IntoIterator<Item = u32>,
        F: IntoIterator<Item = Feature>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            applicable_statuses: applicable_statuses.into_iter().collect(),
            depends_on_features: depends_on_features.into_iter().collect(),
            depends_on_interfaces: depends_on_interfaces.into_iter().map(Into::into).collect(),
            introspect,
        }
    }
}

pub type Introspectables<T> = BTreeMap<Feature, Introspectable<T>>;

/// Implemented by every proxy built on a [`ReadinessHelper`].
pub trait ReadyObject: Send + Sync + Sized + 'static {
    fn readiness_helper(&self) -> &ReadinessHelper<Self>;

    fn dbus_proxy(&self) -> &DBusProxy {
        self.readiness_helper().proxy()
    }

    fn is_valid(&self) -> bool {
        self.dbus_proxy().is_valid()
    }

    /// Starts introspecting `features` (the core feature when empty).
    fn become_ready(&self, features: Features) -> PendingReady {
        self.readiness_helper().become_ready(features)
    }

    fn is_ready(&self, features: &Features) -> bool {
        self.readiness_helper().is_ready(features)
    }

    fn is_feature_ready(&self, feature: Feature) -> bool {
        self.readiness_helper().is_ready(&Features::from([feature]))
    }

    fn requested_features(&self) -> Features {
        self.readiness_helper().requested_features()
    }

    fn actual_features(&self) -> Features {
        self.readiness_helper().actual_features()
    }

    fn missing_features(&self) -> Features {
        self.readiness_helper().missing_features()
    }
}

struct MissingFeature {
    seq: u64,
    error: DBusError,
}

struct PendingOp {
    features: Features,
    tx: oneshot::Sender<Result<(), DBusError>>,
}

struct ReadinessState {
    current_status: u32,
    interfaces: BTreeSet<String>,
    requested: Features,
    satisfied: Features,
    skipped: Features,
    missing: BTreeMap<Feature, MissingFeature>,
    pending: Features,
    in_flight: Features,
    ops: Vec<PendingOp>,
    pending_status_change: Option<u32>,
    next_seq: u64,
}

impl ReadinessState {
    fn is_completed(&self, feature: &Feature) -> bool {
        self.satisfied.contains(feature)
            || self.skipped.contains(feature)
            || self.missing.contains_key(feature)
    }

    fn record_missing(&mut self, feature: Feature, error: DBusError) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.missing.insert(feature, MissingFeature { seq, error });
    }

    /// The earliest recorded failure among `features`, if any.
    fn outcome(&self, features: &Features) -> Result<(), DBusError> {
        match features
            .iter()
            .filter_map(|feature| self.missing.get(feature))
            .min_by_key(|missing| missing.seq)
        {
            Some(missing) => Err(missing.error.clone()),
            None => Ok(()),
        }
    }

    fn restart(&mut self, status: u32) {
        self.current_status = status;
        self.satisfied.clear();
        self.skipped.clear();
        self.missing.clear();
        self.pending = self.requested.clone();
    }
}

struct HelperInner<T> {
    target: Weak<T>,
    proxy: DBusProxy,
    introspectables: Introspectables<T>,
    core: Option<Feature>,
    state: Arc<Mutex<ReadinessState>>,
}

/// Per-instance readiness bookkeeping for a proxy of type `T`.
pub struct ReadinessHelper<T> {
    inner: Arc<HelperInner<T>>,
}

impl<T> Clone for ReadinessHelper<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ReadyObject> ReadinessHelper<T> {
    /// `target` is the proxy owning this helper, usually obtained through
    /// [`Arc::new_cyclic`].
    pub fn new(
        target: Weak<T>,
        proxy: DBusProxy,
        current_status: u32,
        introspectables: Introspectables<T>,
    ) -> Self {
        let core = introspectables
            .keys()
            .find(|feature| feature.is_core())
            .or_else(|| introspectables.keys().next())
            .copied();
        let state = Arc::new(Mutex::new(ReadinessState {
            current_status,
            interfaces: BTreeSet::new(),
            requested: Features::new(),
            satisfied: Features::new(),
            skipped: Features::new(),
            missing: BTreeMap::new(),
            pending: Features::new(),
            in_flight: Features::new(),
            ops: Vec::new(),
            pending_status_change: None,
            next_seq: 0,
        }));

        let weak_state = Arc::downgrade(&state);
        proxy.on_invalidated(move |error| {
            let Some(state) = weak_state.upgrade() else {
                return;
            };
            let ops = {
                let mut state = state.lock().expect("readiness mutex poisoned");
                state.pending.clear();
                state.in_flight.clear();
                state.pending_status_change = None;
                std::mem::take(&mut state.ops)
            };
            for op in ops {
                let _ = op.tx.send(Err(error.clone()));
            }
        });

        Self {
            inner: Arc::new(HelperInner {
                target,
                proxy,
                introspectables,
                core,
                state,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReadinessState> {
        self.inner.state.lock().expect("readiness mutex poisoned")
    }

    fn label(&self) -> &str {
        self.inner.proxy.object_path()
    }

    pub fn proxy(&self) -> &DBusProxy {
        &self.inner.proxy
    }

    pub fn core_feature(&self) -> Option<Feature> {
        self.inner.core
    }

    pub fn supported_features(&self) -> Features {
        self.inner.introspectables.keys().copied().collect()
    }

    pub fn current_status(&self) -> u32 {
        self.state().current_status
    }

    pub fn interfaces(&self) -> BTreeSet<String> {
        self.state().interfaces.clone()
    }

    pub fn requested_features(&self) -> Features {
        self.state().requested.clone()
    }

    pub fn actual_features(&self) -> Features {
        self.state().satisfied.clone()
    }

    pub fn missing_features(&self) -> Features {
        self.state().missing.keys().copied().collect()
    }

    pub fn missing_feature_error(&self, feature: Feature) -> Option<DBusError> {
        self.state()
            .missing
            .get(&feature)
            .map(|missing| missing.error.clone())
    }

    fn normalize(&self, features: Features) -> Features {
        match (features.is_empty(), self.inner.core) {
            (true, Some(core)) => Features::from([core]),
            _ => features,
        }
    }

    /// Whether every feature in `features` has been introspected or was found
    /// not applicable. Always `false` for an invalidated proxy.
    pub fn is_ready(&self, features: &Features) -> bool {
        if !self.inner.proxy.is_valid() {
            return false;
        }
        let features = self.normalize(features.clone());
        let state = self.state();
        if state.pending_status_change.is_some() {
            return false;
        }
        features.iter().all(|feature| {
            self.inner.introspectables.contains_key(feature)
                && (state.satisfied.contains(feature) || state.skipped.contains(feature))
        })
    }

    fn dependency_closure(&self, features: &Features) -> Features {
        let mut closure = Features::new();
        let mut stack: Vec<Feature> = features.iter().copied().collect();
        while let Some(feature) = stack.pop() {
            if !closure.insert(feature) {
                continue;
            }
            if let Some(introspectable) = self.inner.introspectables.get(&feature) {
                stack.extend(introspectable.depends_on_features.iter().copied());
            }
        }
        closure
    }

    pub fn become_ready(&self, features: Features) -> PendingReady {
        let requested = self.normalize(features);
        if let Some(error) = self.inner.proxy.invalidation() {
            return PendingReady::finished(requested, Err(error));
        }
        if let Some(unsupported) = requested
            .iter()
            .find(|feature| !self.inner.introspectables.contains_key(feature))
        {
            log::warn!("ready({}): unsupported feature {} requested", self.label(), unsupported);
            return PendingReady::finished(
                requested,
                Err(DBusError::invalid_argument(
                    "Requested features contains unsupported feature",
                )),
            );
        }

        let closure = self.dependency_closure(&requested);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            if state.pending_status_change.is_none()
                && closure.iter().all(|feature| state.is_completed(feature))
            {
                let outcome = state.outcome(&closure);
                return PendingReady::finished(requested, outcome);
            }
            for feature in &closure {
                state.requested.insert(*feature);
                if !state.is_completed(feature) {
                    state.pending.insert(*feature);
                }
            }
            state.ops.push(PendingOp {
                features: closure,
                tx,
            });
        }
        self.iterate();
        PendingReady::waiting(requested, rx)
    }

    /// Advances every pending feature whose preconditions are settled, then
    /// resolves the operations that became complete.
    fn iterate(&self) {
        let Some(target) = self.inner.target.upgrade() else {
            return;
        };
        let mut launches = Vec::new();
        let mut finished = Vec::new();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            if !self.inner.proxy.is_valid() || state.pending_status_change.is_some() {
                return;
            }

            loop {
                let mut progressed = false;
                let candidates: Vec<Feature> =
                    state.pending.difference(&state.in_flight).copied().collect();
                for feature in candidates {
                    let Some(introspectable) = self.inner.introspectables.get(&feature) else {
                        state.pending.remove(&feature);
                        continue;
                    };
                    let deps = &introspectable.depends_on_features;

                    if deps.iter().any(|dep| state.missing.contains_key(dep)) {
                        log::debug!(
                            "ready({}): {} depends on unavailable features",
                            self.label(),
                            feature
                        );
                        state.record_missing(
                            feature,
                            DBusError::not_available(
                                "Feature depends on other features that are not available",
                            ),
                        );
                        state.pending.remove(&feature);
                        progressed = true;
                        continue;
                    }
                    if deps.iter().any(|dep| state.skipped.contains(dep)) {
                        state.skipped.insert(feature);
                        state.pending.remove(&feature);
                        progressed = true;
                        continue;
                    }
                    let mut waiting = false;
                    for dep in deps {
                        if state.satisfied.contains(dep) {
                            continue;
                        }
                        waiting = true;
                        if !state.pending.contains(dep) && !state.in_flight.contains(dep) {
                            state.requested.insert(*dep);
                            state.pending.insert(*dep);
                            progressed = true;
                        }
                    }
                    if waiting {
                        continue;
                    }

                    if !introspectable
                        .applicable_statuses
                        .contains(&state.current_status)
                    {
                        log::debug!(
                            "ready({}): {} not applicable in status {}",
                            self.label(),
                            feature,
                            state.current_status
                        );
                        state.satisfied.insert(feature);
                        state.pending.remove(&feature);
                        progressed = true;
                        continue;
                    }
                    if !introspectable
                        .depends_on_interfaces
                        .is_subset(&state.interfaces)
                    {
                        log::debug!(
                            "ready({}): {} skipped, required interfaces absent",
                            self.label(),
                            feature
                        );
                        state.skipped.insert(feature);
                        state.pending.remove(&feature);
                        progressed = true;
                        continue;
                    }

                    state.in_flight.insert(feature);
                    launches.push((feature, introspectable.introspect));
                }
                if !progressed {
                    break;
                }
            }

            let ops = std::mem::take(&mut state.ops);
            for op in ops {
                if op.features.iter().all(|feature| state.is_completed(feature)) {
                    finished.push((op.tx, state.outcome(&op.features)));
                } else {
                    state.ops.push(op);
                }
            }
        }

        for (tx, outcome) in finished {
            let _ = tx.send(outcome);
        }
        for (feature, introspect) in launches {
            log::trace!("ready({}): introspecting {}", self.label(), feature);
            let helper = self.clone();
            let future = introspect(Arc::clone(&target));
            spawn(async move {
                let result = future.await;
                helper.set_introspect_completed(feature, result);
            });
        }
    }

    /// Records the outcome of one introspection step.
    pub fn set_introspect_completed(&self, feature: Feature, result: Result<(), DBusError>) {
        if !self.inner.proxy.is_valid() {
            log::debug!(
                "ready({}): ignoring {} completion, proxy invalidated",
                self.label(),
                feature
            );
            return;
        }
        {
            let mut state = self.state();
            if let Some(status) = state.pending_status_change {
                state.in_flight.remove(&feature);
                if !state.in_flight.is_empty() {
                    return;
                }
                state.pending_status_change = None;
                state.restart(status);
            } else {
                if !state.in_flight.remove(&feature) {
                    log::warn!(
                        "ready({}): completion for {} which is not being introspected",
                        self.label(),
                        feature
                    );
                    return;
                }
                state.pending.remove(&feature);
                match result {
                    Ok(()) => {
                        log::trace!("ready({}): {} ready", self.label(), feature);
                        state.satisfied.insert(feature);
                    }
                    Err(mut error) => {
                        log::warn!("ready({}): {} failed: {}", self.label(), feature, error);
                        if error.name.is_empty() {
                            error.name = names::NOT_AVAILABLE.to_owned();
                        }
                        state.record_missing(feature, error);
                    }
                }
            }
        }
        self.iterate();
    }

    /// Switches to `status` and reintrospects every requested feature. While
    /// features are in flight the switch waits for them to land.
    pub fn set_current_status(&self, status: u32) {
        {
            let mut state = self.state();
            if state.current_status == status && state.pending_status_change.is_none() {
                return;
            }
            if !state.in_flight.is_empty() {
                log::debug!(
                    "ready({}): status {} queued until introspection lands",
                    self.label(),
                    status
                );
                state.pending_status_change = Some(status);
                return;
            }
            state.pending_status_change = None;
            state.restart(status);
        }
        self.iterate();
    }

    /// Sets the status without reintrospecting; used by the step that
    /// discovers the status in the first place.
    pub fn force_current_status(&self, status: u32) {
        self.state().current_status = status;
    }

    /// Replaces the known interfaces. Features skipped for lack of an
    /// interface are scheduled again once it shows up.
    pub fn set_interfaces<I, S>(&self, interfaces: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let interfaces: BTreeSet<String> = interfaces.into_iter().map(Into::into).collect();
        let rescheduled = {
            let mut state = self.state();
            let added = !interfaces.is_subset(&state.interfaces);
            state.interfaces = interfaces;
            if !added {
                return;
            }
            let skipped: Vec<Feature> = state.skipped.iter().copied().collect();
            let mut rescheduled = false;
            for feature in skipped {
                if state.requested.contains(&feature) {
                    state.skipped.remove(&feature);
                    state.pending.insert(feature);
                    rescheduled = true;
                }
            }
            rescheduled
        };
        if rescheduled {
            self.iterate();
        }
    }
}

enum PendingInner {
    Finished(Option<Result<(), DBusError>>),
    Waiting(oneshot::Receiver<Result<(), DBusError>>),
}

/// Resolves when the requested features have been introspected.
pub struct PendingReady {
    requested: Features,
    inner: PendingInner,
}

impl PendingReady {
    fn finished(requested: Features, result: Result<(), DBusError>) -> Self {
        Self {
            requested,
            inner: PendingInner::Finished(Some(result)),
        }
    }

    fn waiting(requested: Features, rx: oneshot::Receiver<Result<(), DBusError>>) -> Self {
        Self {
            requested,
            inner: PendingInner::Waiting(rx),
        }
    }

    pub fn requested_features(&self) -> &Features {
        &self.requested
    }
}

impl Future for PendingReady {
    type Output = Result<(), DBusError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().inner {
            PendingInner::Finished(result) => Poll::Ready(result.take().unwrap_or_else(|| {
                Err(DBusError::invalid_argument("PendingReady polled after completion"))
            })),
            PendingInner::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(DBusError::new(names::CANCELLED, "proxy dropped before becoming ready"))
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use telepathy_bus::{Bus, MockBus};

    use super::*;
    use crate::feature::features;

    const PATH: &str = "/org/example/Gadget";
    const IFACE: &str = "org.example.Gadget";
    const EXTRA: &str = "org.example.Gadget.Extra";

    struct Gadget {
        readiness: ReadinessHelper<Gadget>,
        log: StdMutex<Vec<String>>,
    }

    impl ReadyObject for Gadget {
        fn readiness_helper(&self) -> &ReadinessHelper<Self> {
            &self.readiness
        }
    }

    impl Gadget {
        const CORE: Feature = Feature::new("Gadget", 0, true);
        const DEPENDENT: Feature = Feature::new("Gadget", 1, false);
        const EXTRA: Feature = Feature::new("Gadget", 2, false);
        const ONLINE: Feature = Feature::new("Gadget", 3, false);

        fn new(bus: &Arc<MockBus>) -> Arc<Self> {
            let proxy = DBusProxy::new(Arc::clone(bus) as Arc<dyn Bus>, "org.example", PATH);
            Arc::new_cyclic(|weak| Self {
                readiness: ReadinessHelper::new(weak.clone(), proxy, 0, Self::introspectables()),
                log: StdMutex::new(Vec::new()),
            })
        }

        fn introspectables() -> Introspectables<Self> {
            let mut table = Introspectables::new();
            table.insert(
                Self::CORE,
                Introspectable::new(
                    [0, 1],
                    Features::new(),
                    Vec::<String>::new(),
                    Self::introspect_core,
                ),
            );
            table.insert(
                Self::DEPENDENT,
                Introspectable::new(
                    [0, 1],
                    [Self::CORE],
                    Vec::<String>::new(),
                    Self::introspect_dependent,
                ),
            );
            table.insert(
                Self::EXTRA,
                Introspectable::new([0, 1], [Self::CORE], [EXTRA], Self::introspect_extra),
            );
            table.insert(
                Self::ONLINE,
                Introspectable::new(
                    [1],
                    [Self::CORE],
                    Vec::<String>::new(),
                    Self::introspect_online,
                ),
            );
            table
        }

        fn record(&self, entry: &str) {
            self.log.lock().expect("log mutex").push(entry.to_owned());
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().expect("log mutex").clone()
        }

        fn step(gadget: Arc<Self>, member: &'static str) -> IntrospectFuture {
            Box::pin(async move {
                gadget.record(&format!("{member}:start"));
                let result = gadget.dbus_proxy().call(IFACE, member, Vec::new()).await;
                gadget.record(&format!("{member}:end"));
                result.map(|_| ())
            })
        }

        fn introspect_core(gadget: Arc<Self>) -> IntrospectFuture {
            Self::step(gadget, "Core")
        }

        fn introspect_dependent(gadget: Arc<Self>) -> IntrospectFuture {
            Self::step(gadget, "Dependent")
        }

        fn introspect_extra(gadget: Arc<Self>) -> IntrospectFuture {
            Self::step(gadget, "Extra")
        }

        fn introspect_online(gadget: Arc<Self>) -> IntrospectFuture {
            Self::step(gadget, "Online")
        }
    }

    fn scripted_bus() -> Arc<MockBus> {
        let bus = Arc::new(MockBus::new());
        for member in ["Core", "Dependent", "Extra", "Online"] {
            bus.reply(PATH, IFACE, member, Vec::new());
        }
        bus
    }

    #[tokio::test]
    async fn empty_request_means_core() {
        let bus = scripted_bus();
        let gadget = Gadget::new(&bus);
        assert!(!gadget.is_ready(&Features::new()));

        gadget.become_ready(Features::new()).await.expect("core");
        assert!(gadget.is_ready(&Features::new()));
        assert!(gadget.is_feature_ready(Gadget::CORE));
        assert_eq!(gadget.actual_features(), features([Gadget::CORE]));
        assert_eq!(bus.members(), vec!["Core"]);
    }

    #[tokio::test]
    async fn repeated_requests_share_one_introspection() {
        let bus = scripted_bus();
        bus.pause("Core");
        let gadget = Gadget::new(&bus);

        let first = gadget.become_ready(features([Gadget::CORE]));
        let second = gadget.become_ready(features([Gadget::CORE]));
        tokio::task::yield_now().await;
        bus.resume("Core");

        first.await.expect("first");
        second.await.expect("second");
        gadget.become_ready(features([Gadget::CORE])).await.expect("third");
        assert_eq!(bus.call_count("Core"), 1);
    }

    #[tokio::test]
    async fn repeated_failure_reports_same_error_without_new_calls() {
        let bus = scripted_bus();
        bus.fail(PATH, IFACE, "Core", DBusError::new("Foo.Error", "nope"));
        let gadget = Gadget::new(&bus);

        let first = gadget.become_ready(Features::new()).await.expect_err("first");
        let second = gadget.become_ready(Features::new()).await.expect_err("second");
        assert_eq!(first, second);
        assert_eq!(first.name, "Foo.Error");
        assert_eq!(bus.call_count("Core"), 1);
        assert_eq!(gadget.missing_features(), features([Gadget::CORE]));
    }

    #[tokio::test]
    async fn dependencies_complete_before_dependents_start() {
        let bus = scripted_bus();
        bus.pause("Core");
        let gadget = Gadget::new(&bus);

        let pending = gadget.become_ready(features([Gadget::DEPENDENT]));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gadget.entries(), vec!["Core:start"]);
        bus.resume("Core");
        pending.await.expect("dependent");

        assert_eq!(
            gadget.entries(),
            vec!["Core:start", "Core:end", "Dependent:start", "Dependent:end"]
        );
        assert!(gadget.is_ready(&features([Gadget::CORE, Gadget::DEPENDENT])));
    }

    #[tokio::test]
    async fn failed_dependency_fails_dependents_with_root_cause() {
        let bus = scripted_bus();
        bus.fail(PATH, IFACE, "Core", DBusError::new("Foo.Error", "core broke"));
        let gadget = Gadget::new(&bus);

        let err = gadget
            .become_ready(features([Gadget::DEPENDENT]))
            .await
            .expect_err("dependent");
        assert_eq!(err.name, "Foo.Error");
        assert_eq!(bus.call_count("Dependent"), 0);
        let dependent = gadget
            .readiness_helper()
            .missing_feature_error(Gadget::DEPENDENT)
            .expect("recorded");
        assert_eq!(dependent.name, names::NOT_AVAILABLE);
    }

    #[tokio::test]
    async fn absent_interface_skips_until_discovered() {
        let bus = scripted_bus();
        let gadget = Gadget::new(&bus);

        gadget
            .become_ready(features([Gadget::EXTRA]))
            .await
            .expect("skipped is not an error");
        assert!(gadget.is_ready(&features([Gadget::EXTRA])));
        assert!(!gadget.actual_features().contains(&Gadget::EXTRA));
        assert_eq!(bus.call_count("Extra"), 0);

        gadget.readiness_helper().set_interfaces([EXTRA]);
        assert!(!gadget.is_ready(&features([Gadget::EXTRA])));
        gadget
            .become_ready(features([Gadget::EXTRA]))
            .await
            .expect("introspected");
        assert_eq!(bus.call_count("Extra"), 1);
        assert!(gadget.actual_features().contains(&Gadget::EXTRA));
    }

    #[tokio::test]
    async fn status_gates_features_and_restarts_introspection() {
        let bus = scripted_bus();
        let gadget = Gadget::new(&bus);

        gadget
            .become_ready(features([Gadget::ONLINE]))
            .await
            .expect("not applicable");
        assert_eq!(bus.call_count("Online"), 0);

        gadget.readiness_helper().set_current_status(1);
        gadget
            .become_ready(features([Gadget::ONLINE]))
            .await
            .expect("online");
        assert_eq!(bus.call_count("Online"), 1);
        assert_eq!(bus.call_count("Core"), 2);
    }

    #[tokio::test]
    async fn status_change_waits_for_in_flight_work() {
        let bus = scripted_bus();
        bus.pause("Core");
        let gadget = Gadget::new(&bus);

        let pending = gadget.become_ready(features([Gadget::ONLINE]));
        tokio::task::yield_now().await;
        gadget.readiness_helper().set_current_status(1);
        assert_eq!(gadget.readiness_helper().current_status(), 0);
        bus.resume("Core");

        pending.await.expect("online after restart");
        assert_eq!(gadget.readiness_helper().current_status(), 1);
        assert_eq!(bus.call_count("Core"), 2);
        assert_eq!(bus.call_count("Online"), 1);
    }

    #[tokio::test]
    async fn invalidation_aborts_and_blocks_further_work() {
        let bus = scripted_bus();
        bus.pause("Core");
        let gadget = Gadget::new(&bus);

        let pending = gadget.become_ready(Features::new());
        tokio::task::yield_now().await;
        gadget.dbus_proxy().invalidate("Foo.Error", "bus gone");
        let err = pending.await.expect_err("aborted");
        assert_eq!(err.name, "Foo.Error");
        bus.resume("Core");

        let calls = bus.calls().len();
        let err = gadget
            .become_ready(features([Gadget::DEPENDENT]))
            .await
            .expect_err("invalidated");
        assert_eq!(err.message, "bus gone");
        assert_eq!(bus.calls().len(), calls);
        assert!(!gadget.is_ready(&Features::new()));
    }

    #[tokio::test]
    async fn unsupported_feature_is_rejected() {
        let bus = scripted_bus();
        let gadget = Gadget::new(&bus);
        let err = gadget
            .become_ready(features([Feature::new("Other", 0, true)]))
            .await
            .expect_err("unsupported");
        assert_eq!(err.name, names::INVALID_ARGUMENT);
        assert!(bus.calls().is_empty());
    }
}
