use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use telepathy_bus::{Bus, DBusError, Signal, Variant, VariantMap, VariantMapExt};
use tokio::sync::broadcast;

use crate::account::Account;
use crate::config::ClientConfig;
use crate::constants::{ACCOUNT_MANAGER_BUS_NAME, ACCOUNT_MANAGER_OBJECT_PATH, IFACE_ACCOUNT_MANAGER};
use crate::feature::{Feature, Features};
use crate::proxy::{spawn, DBusProxy};
use crate::readiness::{
    Introspectable, Introspectables, IntrospectFuture, ReadinessHelper, ReadyObject,
};

/// Change notifications published by an [`AccountManager`].
#[derive(Clone, Debug)]
pub enum AccountManagerEvent {
    /// A new account appeared and is ready with the configured features.
    NewAccount(Arc<Account>),
    AccountValidityChanged { object_path: String, valid: bool },
    AccountRemoved(String),
}

struct ManagerState {
    interfaces: Vec<String>,
    accounts: BTreeMap<String, Arc<Account>>,
    valid: Vec<String>,
    invalid: Vec<String>,
    signals_connected: bool,
}

/// Proxy for the account manager.
pub struct AccountManager {
    readiness: ReadinessHelper<AccountManager>,
    config: ClientConfig,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<AccountManagerEvent>,
}

impl ReadyObject for AccountManager {
    fn readiness_helper(&self) -> &ReadinessHelper<Self> {
        &self.readiness
    }
}

impl AccountManager {
    /// The account lists, with every account made ready.
    pub const FEATURE_CORE: Feature = Feature::new("AccountManager", 0, true);

    pub fn new(bus: Arc<dyn Bus>) -> Arc<Self> {
        Self::with_config(bus, ClientConfig::default())
    }

    pub fn with_config(bus: Arc<dyn Bus>, config: ClientConfig) -> Arc<Self> {
        let proxy = DBusProxy::new(bus, ACCOUNT_MANAGER_BUS_NAME, ACCOUNT_MANAGER_OBJECT_PATH);
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            readiness: ReadinessHelper::new(weak.clone(), proxy, 0, Self::introspectables()),
            config,
            state: Mutex::new(ManagerState {
                interfaces: Vec::new(),
                accounts: BTreeMap::new(),
                valid: Vec::new(),
                invalid: Vec::new(),
                signals_connected: false,
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
        table
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().expect("account manager state mutex poisoned")
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn events(&self) -> broadcast::Receiver<AccountManagerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AccountManagerEvent) {
        let _ = self.events.send(event);
    }

    fn warn_unless_ready(&self, accessor: &str) {
        if !self.is_feature_ready(Self::FEATURE_CORE) {
            log::warn!("am: {}() used without {} being ready", accessor, Self::FEATURE_CORE);
        }
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.warn_unless_ready("interfaces");
        self.state().interfaces.clone()
    }

    fn accounts_in(&self, paths: &[String]) -> Vec<Arc<Account>> {
        let state = self.state();
        paths
            .iter()
            .filter_map(|path| state.accounts.get(path).cloned())
            .collect()
    }

    pub fn valid_accounts(&self) -> Vec<Arc<Account>> {
        self.warn_unless_ready("valid_accounts");
        let paths = self.state().valid.clone();
        self.accounts_in(&paths)
    }

    pub fn invalid_accounts(&self) -> Vec<Arc<Account>> {
        self.warn_unless_ready("invalid_accounts");
        let paths = self.state().invalid.clone();
        self.accounts_in(&paths)
    }

    pub fn all_accounts(&self) -> Vec<Arc<Account>> {
        self.warn_unless_ready("all_accounts");
        self.state().accounts.values().cloned().collect()
    }

    pub fn account_for_path(&self, object_path: &str) -> Option<Arc<Account>> {
        self.warn_unless_ready("account_for_path");
        self.state().accounts.get(object_path).cloned()
    }

    /// Features made ready on every account before it is handed out.
    fn account_features(&self) -> Features {
        self.config
            .account_features
            .iter()
            .filter_map(|name| Account::feature_by_name(name))
            .collect()
    }

    fn build_account(&self, object_path: &str) -> Arc<Account> {
        Account::with_config(
            Arc::clone(self.dbus_proxy().bus()),
            object_path,
            self.config.clone(),
        )
    }

    fn introspect_core(manager: Arc<Self>) -> IntrospectFuture {
        Box::pin(async move { manager.introspect_main().await })
    }

    async fn introspect_main(self: &Arc<Self>) -> Result<(), DBusError> {
        self.connect_signals_once();
        let props = self.dbus_proxy().get_all(IFACE_ACCOUNT_MANAGER).await?;
        let valid = props.str_list_value("ValidAccounts").unwrap_or_default().to_vec();
        let invalid = props.str_list_value("InvalidAccounts").unwrap_or_default().to_vec();
        let interfaces = props.str_list_value("Interfaces").unwrap_or_default().to_vec();

        let accounts: Vec<Arc<Account>> = valid
            .iter()
            .chain(&invalid)
            .map(|path| self.build_account(path))
            .collect();
        let features = self.account_features();
        // Start every account first so they introspect concurrently.
        let pending: Vec<_> = accounts
            .iter()
            .map(|account| account.become_ready(features.clone()))
            .collect();
        for (account, ready) in accounts.iter().zip(pending) {
            if let Err(err) = ready.await {
                log::warn!(
                    "am: account {} failed to become ready: {}",
                    account.object_path(),
                    err
                );
            }
        }

        {
            let mut state = self.state();
            state.interfaces = interfaces.clone();
            state.valid = valid;
            state.invalid = invalid;
            for account in accounts {
                state
                    .accounts
                    .entry(account.object_path().to_owned())
                    .or_insert(account);
            }
        }
        self.readiness.set_interfaces(interfaces);
        log::debug!("am: core introspected");
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
            .connect_signals(IFACE_ACCOUNT_MANAGER, Arc::downgrade(self), Self::on_signal);
    }

    fn on_signal(self: &Arc<Self>, signal: Signal) {
        let Some(object_path) = signal.args.first().and_then(Variant::as_str).map(str::to_owned) else {
            return;
        };
        match signal.member.as_str() {
            "AccountValidityChanged" => {
                let valid = signal.args.get(1).and_then(Variant::as_bool).unwrap_or(false);
                self.on_validity_changed(object_path, valid);
            }
            "AccountRemoved" => self.on_account_removed(&object_path),
            _ => {}
        }
    }

    fn move_path(state: &mut ManagerState, object_path: &str, valid: bool) {
        state.valid.retain(|path| path != object_path);
        state.invalid.retain(|path| path != object_path);
        if valid {
            state.valid.push(object_path.to_owned());
        } else {
            state.invalid.push(object_path.to_owned());
        }
    }

    fn on_validity_changed(self: &Arc<Self>, object_path: String, valid: bool) {
        let known = {
            let mut state = self.state();
            let known = state.accounts.contains_key(&object_path);
            if known {
                Self::move_path(&mut state, &object_path, valid);
            }
            known
        };
        if known {
            if self.is_feature_ready(Self::FEATURE_CORE) {
                self.emit(AccountManagerEvent::AccountValidityChanged { object_path, valid });
            }
            return;
        }

        log::debug!("am: new account {}", object_path);
        let account = self.build_account(&object_path);
        let ready = account.become_ready(self.account_features());
        let weak = Arc::downgrade(self);
        spawn(async move {
            if let Err(err) = ready.await {
                log::warn!("am: new account {} failed to become ready: {}", object_path, err);
            }
            let Some(manager) = weak.upgrade() else {
                return;
            };
            {
                let mut state = manager.state();
                if state.accounts.contains_key(&object_path) {
                    return;
                }
                Self::move_path(&mut state, &object_path, valid);
                state.accounts.insert(object_path, Arc::clone(&account));
            }
            if manager.is_feature_ready(Self::FEATURE_CORE) {
                manager.emit(AccountManagerEvent::NewAccount(account));
            }
        });
    }

    fn on_account_removed(&self, object_path: &str) {
        let removed = {
            let mut state = self.state();
            state.valid.retain(|path| path != object_path);
            state.invalid.retain(|path| path != object_path);
            state.accounts.remove(object_path).is_some()
        };
        if removed {
            log::debug!("am: account {} removed", object_path);
            if self.is_feature_ready(Self::FEATURE_CORE) {
                self.emit(AccountManagerEvent::AccountRemoved(object_path.to_owned()));
            }
        }
    }

    /// Creates an account and returns it once it is ready with the
    /// configured account features.
    pub async fn create_account(
        &self,
        connection_manager: &str,
        protocol: &str,
        display_name: &str,
        parameters: VariantMap,
        properties: VariantMap,
    ) -> Result<Arc<Account>, DBusError> {
        let reply = self
            .dbus_proxy()
            .call(
                IFACE_ACCOUNT_MANAGER,
                "CreateAccount",
                vec![
                    Variant::from(connection_manager),
                    Variant::from(protocol),
                    Variant::from(display_name),
                    Variant::Map(parameters),
                    Variant::Map(properties),
                ],
            )
            .await?;
        let object_path = reply
            .first()
            .and_then(Variant::as_str)
            .ok_or_else(|| DBusError::invalid_argument("CreateAccount returned no object path"))?
            .to_owned();

        let existing = self.state().accounts.get(&object_path).cloned();
        let account = existing.unwrap_or_else(|| self.build_account(&object_path));
        account.become_ready(self.account_features()).await?;
        let mut state = self.state();
        Ok(Arc::clone(state.accounts.entry(object_path).or_insert(account)))
    }
}
