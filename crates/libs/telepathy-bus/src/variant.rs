use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// String-keyed map of variants (`a{sv}`), used for property maps.
pub type VariantMap = BTreeMap<String, Variant>;

/// A dynamically typed bus value.
///
/// Covers the subset of the D-Bus type system Telepathy proxies exchange.
/// Struct members are positional, maps keyed by handles use [`Variant::U32Map`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    Bool(bool),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    ObjectPath(String),
    Bytes(Vec<u8>),
    StrList(Vec<String>),
    U32List(Vec<u32>),
    ObjectPathList(Vec<String>),
    List(Vec<Variant>),
    Struct(Vec<Variant>),
    Map(VariantMap),
    U32Map(BTreeMap<u32, Variant>),
}

impl Variant {
    pub fn object_path(path: impl Into<String>) -> Self {
        Self::ObjectPath(path.into())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            Self::I32(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            Self::I32(v) => Some(i64::from(*v)),
            Self::U32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => Some(*v),
            Self::U32(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    /// Strings and object paths.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) | Self::ObjectPath(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// String lists and object path lists.
    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            Self::StrList(v) | Self::ObjectPathList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32_list(&self) -> Option<&[u32]> {
        match self {
            Self::U32List(v) => Some(v),
            _ => None,
        }
    }

    /// Lists and struct members.
    pub fn as_list(&self) -> Option<&[Variant]> {
        match self {
            Self::List(v) | Self::Struct(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&VariantMap> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32_map(&self) -> Option<&BTreeMap<u32, Variant>> {
        match self {
            Self::U32Map(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<u64> for Variant {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<String>> for Variant {
    fn from(v: Vec<String>) -> Self {
        Self::StrList(v)
    }
}

impl From<Vec<u32>> for Variant {
    fn from(v: Vec<u32>) -> Self {
        Self::U32List(v)
    }
}

impl From<Vec<u8>> for Variant {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<VariantMap> for Variant {
    fn from(v: VariantMap) -> Self {
        Self::Map(v)
    }
}

/// Typed lookups on property maps.
pub trait VariantMapExt {
    fn str_value(&self, key: &str) -> Option<&str>;
    fn u32_value(&self, key: &str) -> Option<u32>;
    fn bool_value(&self, key: &str) -> Option<bool>;
    fn str_list_value(&self, key: &str) -> Option<&[String]>;
    fn u32_list_value(&self, key: &str) -> Option<&[u32]>;
    fn map_value(&self, key: &str) -> Option<&VariantMap>;
}

impl VariantMapExt for VariantMap {
    fn str_value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Variant::as_str)
    }

    fn u32_value(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(Variant::as_u32)
    }

    fn bool_value(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Variant::as_bool)
    }

    fn str_list_value(&self, key: &str) -> Option<&[String]> {
        self.get(key).and_then(Variant::as_str_list)
    }

    fn u32_list_value(&self, key: &str) -> Option<&[u32]> {
        self.get(key).and_then(Variant::as_u32_list)
    }

    fn map_value(&self, key: &str) -> Option<&VariantMap> {
        self.get(key).and_then(Variant::as_map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_reject_other_types() {
        assert_eq!(Variant::from(7u32).as_u32(), Some(7));
        assert_eq!(Variant::I32(-1).as_u32(), None);
        assert_eq!(Variant::from("x").as_u32(), None);
        assert_eq!(Variant::object_path("/a").as_str(), Some("/a"));
        assert!(Variant::Bool(true).as_map().is_none());
    }

    #[test]
    fn map_lookups() {
        let mut map = VariantMap::new();
        map.insert("Name".into(), "alice".into());
        map.insert("Flags".into(), 3u32.into());
        map.insert("List".into(), vec!["a".to_owned()].into());

        assert_eq!(map.str_value("Name"), Some("alice"));
        assert_eq!(map.u32_value("Flags"), Some(3));
        assert_eq!(map.str_list_value("List"), Some(&["a".to_owned()][..]));
        assert_eq!(map.bool_value("Flags"), None);
        assert_eq!(map.u32_value("Missing"), None);
    }
}
