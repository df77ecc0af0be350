use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A named, independently tracked slice of a proxy's state.
///
/// Features are compile-time constants declared by each proxy type. Identity
/// is the (owner type, index) pair; `is_core` only marks the feature requested
/// when a caller asks for an empty set.
#[derive(Clone, Copy, Debug)]
pub struct Feature {
    owner: &'static str,
    index: u32,
    is_core: bool,
}

impl Feature {
    pub const fn new(owner: &'static str, index: u32, is_core: bool) -> Self {
        Self {
            owner,
            index,
            is_core,
        }
    }

    pub fn owner(&self) -> &'static str {
        self.owner
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_core(&self) -> bool {
        self.is_core
    }
}

impl PartialEq for Feature {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner && self.index == other.index
    }
}

impl Eq for Feature {}

impl Hash for Feature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.index.hash(state);
    }
}

impl PartialOrd for Feature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Feature {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.owner, self.index).cmp(&(other.owner, other.index))
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.index)
    }
}

pub type Features = BTreeSet<Feature>;

/// Builds a [`Features`] set from a list of features.
pub fn features<I: IntoIterator<Item = Feature>>(iter: I) -> Features {
    iter.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_core_flag() {
        let a = Feature::new("Channel", 0, true);
        let b = Feature::new("Channel", 0, false);
        let c = Feature::new("Account", 0, true);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(features([a, b, c]).len(), 2);
        assert_eq!(a.to_string(), "Channel#0");
    }
}
