//! Message-bus boundary for Telepathy client proxies.
//!
//! Everything a proxy needs from the underlying RPC binding lives here:
//!
//! - **[`Variant`]** and **[`VariantMap`]**, the value model for call
//!   arguments, replies, signal payloads and property maps
//! - **[`DBusError`]**, the (error name, message) pair carried by error
//!   replies, with the well-known names in [`error::names`]
//! - **[`Bus`]**, the async trait issuing method calls and delivering signals
//! - **[`MockBus`]**, a scriptable in-process bus for tests
//!
//! Property bulk-fetch is an ordinary [`Bus::call`] to
//! `org.freedesktop.DBus.Properties.GetAll`; see [`Bus::get_all`].

pub mod bus;
pub mod error;
pub mod variant;

pub use bus::{
    Bus, MethodCall, Signal, SignalReceiver, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE,
    PROPERTIES_INTERFACE,
};
pub use error::DBusError;
pub use variant::{Variant, VariantMap, VariantMapExt};

mod mock;
pub use mock::MockBus;
