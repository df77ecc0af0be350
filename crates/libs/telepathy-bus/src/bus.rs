use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DBusError;
use crate::variant::{Variant, VariantMap};

pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// A method call addressed to one remote object.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodCall {
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Variant>,
}

impl MethodCall {
    pub fn new(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        args: Vec<Variant>,
    ) -> Self {
        Self {
            destination: destination.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            args,
        }
    }
}

/// One signal emission received on a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct Signal {
    pub member: String,
    pub args: Vec<Variant>,
}

/// Ordered stream of signals for one (object path, interface) subscription.
///
/// The subscription ends when the receiver is dropped.
pub type SignalReceiver = mpsc::UnboundedReceiver<Signal>;

/// The RPC transport consumed by every proxy.
///
/// Replies resolve asynchronously; the caller keeps running while a call is
/// outstanding. Use `Arc<dyn Bus>` as the handle type.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Whether the underlying bus connection is still usable.
    fn is_connected(&self) -> bool;

    /// Issue a method call and wait for its reply arguments.
    async fn call(&self, call: MethodCall) -> Result<Vec<Variant>, DBusError>;

    /// Subscribe to every signal emitted on `interface` by the object at
    /// `path`. Emissions are delivered in arrival order.
    fn subscribe(&self, path: &str, interface: &str) -> SignalReceiver;

    /// `org.freedesktop.DBus.Properties.GetAll(interface)`.
    async fn get_all(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
    ) -> Result<VariantMap, DBusError> {
        let reply = self
            .call(MethodCall::new(
                destination,
                path,
                PROPERTIES_INTERFACE,
                "GetAll",
                vec![Variant::from(interface)],
            ))
            .await?;
        match reply.into_iter().next() {
            Some(Variant::Map(map)) => Ok(map),
            _ => Err(DBusError::invalid_argument(format!(
                "GetAll({interface}) returned an unexpected reply"
            ))),
        }
    }

    /// Resolve the unique name currently owning `name`.
    async fn get_name_owner(&self, name: &str) -> Result<String, DBusError> {
        let reply = self
            .call(MethodCall::new(
                DBUS_SERVICE,
                DBUS_PATH,
                DBUS_INTERFACE,
                "GetNameOwner",
                vec![Variant::from(name)],
            ))
            .await?;
        reply
            .first()
            .and_then(Variant::as_str)
            .map(str::to_owned)
            .ok_or_else(|| DBusError::invalid_argument("GetNameOwner returned an unexpected reply"))
    }
}
