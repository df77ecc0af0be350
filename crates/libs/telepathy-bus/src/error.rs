use serde::{Deserialize, Serialize};

/// Well-known error names.
pub mod names {
    pub const NOT_AVAILABLE: &str = "org.freedesktop.Telepathy.Error.NotAvailable";
    pub const NOT_IMPLEMENTED: &str = "org.freedesktop.Telepathy.Error.NotImplemented";
    pub const NOT_YET: &str = "org.freedesktop.Telepathy.Error.NotYet";
    pub const INVALID_ARGUMENT: &str = "org.freedesktop.Telepathy.Error.InvalidArgument";
    pub const INVALID_HANDLE: &str = "org.freedesktop.Telepathy.Error.InvalidHandle";
    pub const DISCONNECTED: &str = "org.freedesktop.Telepathy.Error.Disconnected";
    pub const NETWORK_ERROR: &str = "org.freedesktop.Telepathy.Error.NetworkError";
    pub const AUTHENTICATION_FAILED: &str = "org.freedesktop.Telepathy.Error.AuthenticationFailed";
    pub const ENCRYPTION_ERROR: &str = "org.freedesktop.Telepathy.Error.EncryptionError";
    pub const CANCELLED: &str = "org.freedesktop.Telepathy.Error.Cancelled";
    pub const TERMINATED: &str = "org.freedesktop.Telepathy.Error.Terminated";
    pub const ORPHANED: &str = "org.freedesktop.Telepathy.Qt.Error.Orphaned";
    pub const OBJECT_REMOVED: &str = "org.freedesktop.Telepathy.Qt.Error.ObjectRemoved";
    pub const INCONSISTENT: &str = "org.freedesktop.Telepathy.Qt.Error.Inconsistent";
    pub const NOT_YOURS: &str = "org.freedesktop.Telepathy.Error.NotYours";
    pub const OFFLINE: &str = "org.freedesktop.Telepathy.Error.Offline";
    pub const BUSY: &str = "org.freedesktop.Telepathy.Error.Busy";
    pub const NO_ANSWER: &str = "org.freedesktop.Telepathy.Error.NoAnswer";
    pub const DOES_NOT_EXIST: &str = "org.freedesktop.Telepathy.Error.DoesNotExist";
    pub const PERMISSION_DENIED: &str = "org.freedesktop.Telepathy.Error.PermissionDenied";
    pub const CHANNEL_KICKED: &str = "org.freedesktop.Telepathy.Error.Channel.Kicked";
    pub const CHANNEL_BANNED: &str = "org.freedesktop.Telepathy.Error.Channel.Banned";
    pub const CERT_UNTRUSTED: &str = "org.freedesktop.Telepathy.Error.Cert.Untrusted";
    pub const CERT_EXPIRED: &str = "org.freedesktop.Telepathy.Error.Cert.Expired";
    pub const CERT_INVALID: &str = "org.freedesktop.Telepathy.Error.Cert.Invalid";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
}

/// An error reply: a dotted error name plus a human readable message.
///
/// This is the only error shape the bus reports, and the one every readiness
/// future and every invalidation carries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct DBusError {
    pub name: String,
    pub message: String,
}

impl DBusError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::new(names::NOT_AVAILABLE, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(names::INVALID_ARGUMENT, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(names::DISCONNECTED, message)
    }

    pub fn unknown_method(message: impl Into<String>) -> Self {
        Self::new(names::UNKNOWN_METHOD, message)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// Returns `true` for batch failures that may be caused by a single bad
    /// element, so retrying the batch one element at a time is worthwhile.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self.name.as_str(),
            names::INVALID_HANDLE | names::INVALID_ARGUMENT | names::NOT_AVAILABLE
        )
    }

    /// Returns `true` for transient errors that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.name.as_str(),
            names::NOT_YET | names::NETWORK_ERROR | names::DISCONNECTED
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_name_and_message() {
        let err = DBusError::new("Foo.Error", "bus gone");
        assert_eq!(err.to_string(), "Foo.Error: bus gone");
    }

    #[test]
    fn fallback_errors() {
        assert!(DBusError::new(names::INVALID_HANDLE, "").allows_fallback());
        assert!(DBusError::invalid_argument("").allows_fallback());
        assert!(DBusError::not_available("").allows_fallback());
        assert!(!DBusError::disconnected("").allows_fallback());
        assert!(DBusError::disconnected("").is_retryable());
    }

    #[test]
    fn serde_shape() {
        let err = DBusError::new(names::CANCELLED, "closed");
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["name"], names::CANCELLED);
        let back: DBusError = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, err);
    }
}
