use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use telepathy_bus::error::names;
use telepathy_bus::{
    Bus, DBusError, MethodCall, Signal, SignalReceiver, Variant, VariantMap, DBUS_INTERFACE,
    DBUS_PATH,
};
use tokio::sync::watch;

type InvalidationListener = Box<dyn FnOnce(&DBusError) + Send>;

/// Spawns `future` on the current tokio runtime, if there is one.
pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => log::warn!("proxy: no async runtime available, dropping background task"),
    }
}

/// Runs `f` after the current task yields, or inline without a runtime.
pub(crate) fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { f() });
        }
        Err(_) => f(),
    }
}

/// Identifies a listener registered with [`DBusProxy::on_invalidated`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

#[derive(Default)]
struct InvalidationState {
    error: Option<DBusError>,
    emitted: bool,
    next_listener: u64,
    listeners: Vec<(ListenerId, InvalidationListener)>,
}

struct ProxyInner {
    bus: Arc<dyn Bus>,
    bus_name: Mutex<String>,
    object_path: String,
    invalidation: Mutex<InvalidationState>,
    notify: watch::Sender<Option<DBusError>>,
}

/// Identity of one remote object plus its invalidation state.
///
/// Cloning is cheap and every clone shares the same state. Invalidation
/// happens at most once; the first reason wins and later attempts are
/// ignored. Listeners are notified from a deferred task so the code that
/// triggered the invalidation finishes first.
#[derive(Clone)]
pub struct DBusProxy {
    inner: Arc<ProxyInner>,
}

impl std::fmt::Debug for DBusProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DBusProxy")
            .field("bus_name", &self.bus_name())
            .field("object_path", &self.inner.object_path)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl DBusProxy {
    pub fn new(bus: Arc<dyn Bus>, bus_name: impl Into<String>, object_path: impl Into<String>) -> Self {
        let (notify, _) = watch::channel(None);
        let proxy = Self {
            inner: Arc::new(ProxyInner {
                bus,
                bus_name: Mutex::new(bus_name.into()),
                object_path: object_path.into(),
                invalidation: Mutex::new(InvalidationState::default()),
                notify,
            }),
        };
        if !proxy.inner.bus.is_connected() {
            proxy.invalidate(names::DISCONNECTED, "DBus connection disconnected");
        }
        proxy
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.inner.bus
    }

    pub fn bus_name(&self) -> String {
        self.inner
            .bus_name
            .lock()
            .expect("proxy bus name mutex poisoned")
            .clone()
    }

    pub fn object_path(&self) -> &str {
        &self.inner.object_path
    }

    fn invalidation_state(&self) -> std::sync::MutexGuard<'_, InvalidationState> {
        self.inner
            .invalidation
            .lock()
            .expect("proxy invalidation mutex poisoned")
    }

    pub fn is_valid(&self) -> bool {
        self.invalidation_state().error.is_none()
    }

    /// The stored invalidation, if any.
    pub fn invalidation(&self) -> Option<DBusError> {
        self.invalidation_state().error.clone()
    }

    /// Empty while the proxy is valid.
    pub fn invalidation_reason(&self) -> String {
        self.invalidation().map(|err| err.name).unwrap_or_default()
    }

    /// Empty while the proxy is valid.
    pub fn invalidation_message(&self) -> String {
        self.invalidation().map(|err| err.message).unwrap_or_default()
    }

    /// Marks the proxy permanently unusable. Returns `false` when it was
    /// already invalidated, in which case nothing changes.
    pub fn invalidate(&self, reason: impl Into<String>, message: impl Into<String>) -> bool {
        let error = DBusError::new(reason, message);
        {
            let mut state = self.invalidation_state();
            if let Some(existing) = &state.error {
                log::debug!(
                    "proxy({}): already invalidated by {}, ignoring {}",
                    self.inner.object_path,
                    existing.name,
                    error.name
                );
                return false;
            }
            log::debug!("proxy({}): invalidated: {}", self.inner.object_path, error);
            state.error = Some(error);
        }

        let proxy = self.clone();
        defer(move || proxy.emit_invalidated());
        true
    }

    fn emit_invalidated(&self) {
        let (error, listeners) = {
            let mut state = self.invalidation_state();
            let Some(error) = state.error.clone() else {
                return;
            };
            state.emitted = true;
            (error, std::mem::take(&mut state.listeners))
        };
        for (_, listener) in listeners {
            listener(&error);
        }
        self.inner.notify.send_replace(Some(error));
    }

    /// Registers `listener` to run once when the proxy is invalidated.
    /// Listeners run in registration order.
    pub fn on_invalidated<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce(&DBusError) + Send + 'static,
    {
        let mut state = self.invalidation_state();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        if state.emitted {
            if let Some(error) = state.error.clone() {
                drop(state);
                defer(move || listener(&error));
                return id;
            }
        }
        state.listeners.push((id, Box::new(listener)));
        id
    }

    /// Drops a listener that has not run yet.
    pub fn remove_invalidation_listener(&self, id: ListenerId) {
        self.invalidation_state()
            .listeners
            .retain(|(listener, _)| *listener != id);
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.invalidation_state().listeners.len()
    }

    /// Resolves with the invalidation once it has been announced.
    pub async fn invalidated(&self) -> DBusError {
        let mut rx = self.inner.notify.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(error) = current {
                return error;
            }
            if rx.changed().await.is_err() {
                return self
                    .invalidation()
                    .unwrap_or_else(|| DBusError::disconnected("proxy dropped"));
            }
        }
    }

    /// Calls `interface.member` on this object. Fails without touching the
    /// bus once the proxy is invalidated.
    pub async fn call(
        &self,
        interface: &str,
        member: &str,
        args: Vec<Variant>,
    ) -> Result<Vec<Variant>, DBusError> {
        if let Some(error) = self.invalidation() {
            return Err(error);
        }
        let call = MethodCall::new(self.bus_name(), self.object_path(), interface, member, args);
        self.inner.bus.call(call).await
    }

    /// `Properties.GetAll(interface)` on this object.
    pub async fn get_all(&self, interface: &str) -> Result<VariantMap, DBusError> {
        if let Some(error) = self.invalidation() {
            return Err(error);
        }
        self.inner
            .bus
            .get_all(&self.bus_name(), self.object_path(), interface)
            .await
    }

    pub fn subscribe(&self, interface: &str) -> SignalReceiver {
        self.inner.bus.subscribe(self.object_path(), interface)
    }

    /// Feeds every signal of `interface` to `handler` while both `target`
    /// and this proxy are alive and valid.
    pub(crate) fn connect_signals<T, F>(&self, interface: &str, target: Weak<T>, handler: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Arc<T>, Signal) + Send + 'static,
    {
        let mut rx = self.subscribe(interface);
        let proxy = Arc::downgrade(&self.inner);
        spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(target) = target.upgrade() else {
                    break;
                };
                let valid = proxy
                    .upgrade()
                    .map(|inner| DBusProxy { inner }.is_valid())
                    .unwrap_or(false);
                if !valid {
                    break;
                }
                handler(&target, signal);
            }
        });
    }

    /// Binds the proxy to the unique name currently owning its bus name and
    /// invalidates it when that owner goes away.
    pub(crate) fn track_name_owner(&self) {
        let well_known = self.bus_name();
        let mut rx = self.inner.bus.subscribe(DBUS_PATH, DBUS_INTERFACE);
        let weak = Arc::downgrade(&self.inner);
        spawn(async move {
            let resolved = {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let proxy = DBusProxy { inner };
                match proxy.inner.bus.get_name_owner(&well_known).await {
                    Ok(owner) => {
                        log::trace!("proxy({}): {} owned by {}", proxy.object_path(), well_known, owner);
                        *proxy
                            .inner
                            .bus_name
                            .lock()
                            .expect("proxy bus name mutex poisoned") = owner.clone();
                        owner
                    }
                    Err(err) => {
                        proxy.invalidate(err.name, err.message);
                        return;
                    }
                }
            };

            while let Some(signal) = rx.recv().await {
                if signal.member != "NameOwnerChanged" {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let proxy = DBusProxy { inner };
                if !proxy.is_valid() {
                    break;
                }
                let name = signal.args.first().and_then(Variant::as_str).unwrap_or_default();
                let new_owner = signal.args.get(2).and_then(Variant::as_str).unwrap_or_default();
                if (name == well_known || name == resolved) && new_owner != resolved {
                    proxy.invalidate(names::NAME_HAS_NO_OWNER, "Name owner lost (service crashed?)");
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use telepathy_bus::MockBus;

    use super::*;

    fn proxy(bus: &Arc<MockBus>) -> DBusProxy {
        DBusProxy::new(
            Arc::clone(bus) as Arc<dyn Bus>,
            "org.example.Service",
            "/org/example/Object",
        )
    }

    #[tokio::test]
    async fn first_invalidation_wins() {
        let bus = Arc::new(MockBus::new());
        let proxy = proxy(&bus);
        assert!(proxy.is_valid());

        assert!(proxy.invalidate("Foo.Error", "bus gone"));
        assert!(!proxy.invalidate("Bar.Error", "other"));
        assert_eq!(proxy.invalidation_reason(), "Foo.Error");
        assert_eq!(proxy.invalidation_message(), "bus gone");

        let announced = proxy.invalidated().await;
        assert_eq!(announced.name, "Foo.Error");
    }

    #[tokio::test]
    async fn listeners_run_after_invalidating_frame_in_order() {
        let bus = Arc::new(MockBus::new());
        let proxy = proxy(&bus);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            proxy.on_invalidated(move |err| {
                order
                    .lock()
                    .expect("order mutex")
                    .push(format!("{tag}:{}", err.name));
            });
        }

        proxy.invalidate("Foo.Error", "bus gone");
        assert!(order.lock().expect("order mutex").is_empty());

        proxy.invalidated().await;
        assert_eq!(
            *order.lock().expect("order mutex"),
            vec!["first:Foo.Error", "second:Foo.Error"]
        );
    }

    #[tokio::test]
    async fn removed_listener_never_runs() {
        let bus = Arc::new(MockBus::new());
        let proxy = proxy(&bus);
        let hits = Arc::new(AtomicUsize::new(0));
        let ids: Vec<ListenerId> = (0..2)
            .map(|_| {
                let counter = Arc::clone(&hits);
                proxy.on_invalidated(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert_ne!(ids[0], ids[1]);

        proxy.remove_invalidation_listener(ids[0]);
        assert_eq!(proxy.listener_count(), 1);

        proxy.invalidate("Foo.Error", "gone");
        proxy.invalidated().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_listener_still_notified() {
        let bus = Arc::new(MockBus::new());
        let proxy = proxy(&bus);
        proxy.invalidate("Foo.Error", "gone");
        proxy.invalidated().await;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        proxy.on_invalidated(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn calls_fail_fast_once_invalidated() {
        let bus = Arc::new(MockBus::new());
        bus.reply("/org/example/Object", "org.example.Iface", "Ping", Vec::new());
        let proxy = proxy(&bus);
        proxy.call("org.example.Iface", "Ping", Vec::new()).await.expect("valid call");

        proxy.invalidate("Foo.Error", "gone");
        let err = proxy
            .call("org.example.Iface", "Ping", Vec::new())
            .await
            .expect_err("invalidated");
        assert_eq!(err.name, "Foo.Error");
        assert_eq!(bus.call_count("Ping"), 1);
    }

    #[tokio::test]
    async fn disconnected_bus_invalidates_on_construction() {
        let bus = Arc::new(MockBus::new());
        bus.set_connected(false);
        let proxy = proxy(&bus);
        assert_eq!(proxy.invalidation_reason(), names::DISCONNECTED);
    }

    #[tokio::test]
    async fn lost_name_owner_invalidates() {
        let bus = Arc::new(MockBus::new());
        bus.set_name_owner("org.example.Service", Some(":1.7"));
        let proxy = proxy(&bus);
        proxy.track_name_owner();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(proxy.bus_name(), ":1.7");

        bus.emit(
            DBUS_PATH,
            DBUS_INTERFACE,
            "NameOwnerChanged",
            vec!["org.example.Service".into(), ":1.7".into(), "".into()],
        );
        let err = proxy.invalidated().await;
        assert_eq!(err.name, names::NAME_HAS_NO_OWNER);
    }

    #[tokio::test]
    async fn unowned_name_invalidates() {
        let bus = Arc::new(MockBus::new());
        bus.set_name_owner("org.example.Service", None);
        let proxy = proxy(&bus);
        proxy.track_name_owner();
        let err = proxy.invalidated().await;
        assert_eq!(err.name, names::NAME_HAS_NO_OWNER);
    }
}
