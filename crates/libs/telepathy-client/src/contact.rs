use std::sync::Arc;

use telepathy_bus::{VariantMap, VariantMapExt};

use crate::constants::CONTACT_ATTR_ALIAS;
use crate::handles::ReferencedHandles;

/// A resolved contact on one connection.
///
/// Contacts are shared: resolving the same handle twice on one connection
/// yields the same `Arc<Contact>` while any holder keeps it alive. The
/// contact keeps its handle referenced.
pub struct Contact {
    handle: ReferencedHandles,
    id: String,
    alias: String,
    attributes: VariantMap,
}

pub type ContactPtr = Arc<Contact>;

impl Contact {
    pub(crate) fn new(handle: ReferencedHandles, id: String, attributes: VariantMap) -> Self {
        let alias = attributes
            .str_value(CONTACT_ATTR_ALIAS)
            .map(str::to_owned)
            .unwrap_or_else(|| id.clone());
        Self {
            handle,
            id,
            alias,
            attributes,
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle.first().unwrap_or_default()
    }

    pub fn referenced_handle(&self) -> &ReferencedHandles {
        &self.handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The alias, or the identifier when the service reports none.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn attributes(&self) -> &VariantMap {
        &self.attributes
    }
}

impl std::fmt::Debug for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contact")
            .field("handle", &self.handle())
            .field("id", &self.id)
            .finish()
    }
}

/// Outcome of resolving a batch of handles.
#[derive(Clone, Debug, Default)]
pub struct ResolvedContacts {
    pub contacts: Vec<ContactPtr>,
    pub invalid_handles: Vec<u32>,
}

impl ResolvedContacts {
    pub fn get(&self, handle: u32) -> Option<&ContactPtr> {
        self.contacts.iter().find(|contact| contact.handle() == handle)
    }
}
