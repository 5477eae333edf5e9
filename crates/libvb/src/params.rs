use std::fmt;

use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};

use crate::typed::{NativeValue, ParamValue, TypedValue};

/// Ordered set of typed parameters, unique by name.
///
/// Insertion order is kept; inserting an existing name replaces its value in
/// place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: Vec<TypedValue>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert or replace `name`, returning the previous value.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ParamValue>,
    ) -> Option<ParamValue> {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => Some(std::mem::replace(&mut entry.value, value)),
            None => {
                self.entries.push(TypedValue { name, value });
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TypedValue> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

impl Extend<TypedValue> for ParameterSet {
    fn extend<I: IntoIterator<Item = TypedValue>>(&mut self, iter: I) {
        for entry in iter {
            self.insert(entry.name, entry.value);
        }
    }
}

impl FromIterator<TypedValue> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = TypedValue>>(iter: I) -> Self {
        let mut set = ParameterSet::new();
        set.extend(iter);
        set
    }
}

impl IntoIterator for ParameterSet {
    type Item = TypedValue;
    type IntoIter = std::vec::IntoIter<TypedValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a TypedValue;
    type IntoIter = std::slice::Iter<'a, TypedValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Serialize for ParameterSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.name, &entry.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ParameterSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SetVisitor;

        impl<'de> Visitor<'de> for SetVisitor {
            type Value = ParameterSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of parameter names to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ParameterSet, A::Error> {
                let mut set = ParameterSet::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, value)) = map.next_entry::<String, NativeValue>()? {
                    set.insert(name, ParamValue::from(value));
                }
                Ok(set)
            }
        }

        deserializer.deserialize_map(SetVisitor)
    }
}
