//! Client-side proxies for Telepathy services.
//!
//! Each proxy ([`Connection`], [`Channel`], [`Account`], [`AccountManager`],
//! [`ChannelRequest`]) mirrors one remote object. Its state is fetched
//! lazily in named [`Feature`]s: [`ReadyObject::become_ready`] introspects the
//! requested features and their dependencies, and signals keep the cached
//! state current afterwards. A proxy whose remote object goes away is
//! invalidated for good; see [`DBusProxy`].
//!
//! Handles held on behalf of the caller are reference counted per
//! connection through [`ReferencedHandles`].

pub mod account;
pub mod account_manager;
pub mod channel;
pub mod channel_request;
pub mod config;
pub mod connection;
pub mod constants;
pub mod contact;
pub mod feature;
pub mod handles;
pub mod proxy;
pub mod readiness;

pub use account::{Account, AccountEvent, Avatar, Presence};
pub use account_manager::{AccountManager, AccountManagerEvent};
pub use channel::{Channel, ChannelEvent, GroupMemberChangeDetails, GroupMembersChangedInfo};
pub use channel_request::{ChannelRequest, ChannelRequestEvent};
pub use config::{ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionEvent};
pub use contact::{Contact, ContactPtr, ResolvedContacts};
pub use feature::{Feature, Features};
pub use handles::{PendingHandles, ReferencedHandles};
pub use proxy::DBusProxy;
pub use readiness::{PendingReady, ReadyObject};
