//! Interface names and protocol enumerations.

pub const CONNECTION_BUS_NAME_BASE: &str = "org.freedesktop.Telepathy.Connection.";
pub const ACCOUNT_MANAGER_BUS_NAME: &str = "org.freedesktop.Telepathy.AccountManager";
pub const ACCOUNT_MANAGER_OBJECT_PATH: &str = "/org/freedesktop/Telepathy/AccountManager";
pub const ACCOUNT_OBJECT_PATH_BASE: &str = "/org/freedesktop/Telepathy/Account";
pub const CHANNEL_DISPATCHER_BUS_NAME: &str = "org.freedesktop.Telepathy.ChannelDispatcher";

pub const IFACE_CONNECTION: &str = "org.freedesktop.Telepathy.Connection";
pub const IFACE_CONNECTION_CONTACTS: &str = "org.freedesktop.Telepathy.Connection.Interface.Contacts";
pub const IFACE_CONNECTION_ALIASING: &str = "org.freedesktop.Telepathy.Connection.Interface.Aliasing";
pub const IFACE_CHANNEL: &str = "org.freedesktop.Telepathy.Channel";
pub const IFACE_CHANNEL_GROUP: &str = "org.freedesktop.Telepathy.Channel.Interface.Group";
pub const IFACE_CHANNEL_CONFERENCE: &str = "org.freedesktop.Telepathy.Channel.Interface.Conference";
pub const IFACE_ACCOUNT: &str = "org.freedesktop.Telepathy.Account";
pub const IFACE_ACCOUNT_AVATAR: &str = "org.freedesktop.Telepathy.Account.Interface.Avatar";
pub const IFACE_ACCOUNT_MANAGER: &str = "org.freedesktop.Telepathy.AccountManager";
pub const IFACE_CHANNEL_REQUEST: &str = "org.freedesktop.Telepathy.ChannelRequest";

/// Contact attribute carrying the contact identifier.
pub const CONTACT_ATTR_ID: &str = "org.freedesktop.Telepathy.Connection/contact-id";
pub const CONTACT_ATTR_ALIAS: &str = "org.freedesktop.Telepathy.Connection.Interface.Aliasing/alias";

pub mod handle_type {
    pub const NONE: u32 = 0;
    pub const CONTACT: u32 = 1;
    pub const ROOM: u32 = 2;
    pub const LIST: u32 = 3;
    pub const GROUP: u32 = 4;
}

pub mod connection_status {
    pub const CONNECTED: u32 = 0;
    pub const CONNECTING: u32 = 1;
    pub const DISCONNECTED: u32 = 2;
    /// Status before the first introspection learned the real one.
    pub const UNKNOWN: u32 = u32::MAX;
}

pub mod connection_status_reason {
    pub const NONE_SPECIFIED: u32 = 0;
    pub const REQUESTED: u32 = 1;
    pub const NETWORK_ERROR: u32 = 2;
    pub const AUTHENTICATION_FAILED: u32 = 3;
    pub const ENCRYPTION_ERROR: u32 = 4;
    pub const NAME_IN_USE: u32 = 5;
    pub const CERT_NOT_PROVIDED: u32 = 6;
    pub const CERT_UNTRUSTED: u32 = 7;
    pub const CERT_EXPIRED: u32 = 8;
    pub const CERT_NOT_ACTIVATED: u32 = 9;
    pub const CERT_HOSTNAME_MISMATCH: u32 = 10;
    pub const CERT_FINGERPRINT_MISMATCH: u32 = 11;
    pub const CERT_SELF_SIGNED: u32 = 12;
    pub const CERT_OTHER_ERROR: u32 = 13;
}

pub mod group_flags {
    pub const CAN_ADD: u32 = 0x1;
    pub const CAN_REMOVE: u32 = 0x2;
    pub const CAN_RESCIND: u32 = 0x4;
    pub const MESSAGE_ADD: u32 = 0x8;
    pub const MESSAGE_REMOVE: u32 = 0x10;
    pub const MESSAGE_ACCEPT: u32 = 0x20;
    pub const MESSAGE_REJECT: u32 = 0x40;
    pub const MESSAGE_RESCIND: u32 = 0x80;
    pub const CHANNEL_SPECIFIC_HANDLES: u32 = 0x100;
    pub const ONLY_ONE_GROUP: u32 = 0x200;
    pub const HANDLE_OWNERS_NOT_AVAILABLE: u32 = 0x400;
    pub const PROPERTIES: u32 = 0x800;
    pub const MEMBERS_CHANGED_DETAILED: u32 = 0x1000;
    pub const MESSAGE_DEPART: u32 = 0x2000;
}

pub mod change_reason {
    pub const NONE: u32 = 0;
    pub const OFFLINE: u32 = 1;
    pub const KICKED: u32 = 2;
    pub const BUSY: u32 = 3;
    pub const INVITED: u32 = 4;
    pub const BANNED: u32 = 5;
    pub const ERROR: u32 = 6;
    pub const INVALID_CONTACT: u32 = 7;
    pub const NO_ANSWER: u32 = 8;
    pub const RENAMED: u32 = 9;
    pub const PERMISSION_DENIED: u32 = 10;
    pub const SEPARATED: u32 = 11;
}
