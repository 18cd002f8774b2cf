//! Flag, trait and identity records, and their decoding from the service wire format.
use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Deserializer, Serialize};

/// A flag or trait value.
///
/// The wire format is untyped JSON, so decoding tries variants in a fixed order: bool, then int,
/// then float, then string. A JSON boolean therefore never turns into `0`/`1`, and an integral
/// number never turns into a float. `null` (or a missing value) decodes into [`TypedValue::Null`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From, Default)]
#[serde(untagged)]
pub enum TypedValue {
    #[allow(missing_docs)]
    Bool(bool),
    #[allow(missing_docs)]
    Int(i64),
    #[allow(missing_docs)]
    Float(f64),
    #[allow(missing_docs)]
    String(String),
    /// No value. A default flag holding `Null` has "no opinion" and is never served.
    #[default]
    Null,
}

impl From<&str> for TypedValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl TypedValue {
    #[allow(missing_docs)]
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }

    #[allow(missing_docs)]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TypedValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            TypedValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as `f64`. Integers are widened.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            TypedValue::Float(f) => Some(*f),
            TypedValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TypedValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A single resolved flag.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagRecord {
    /// Flag name, unique within a snapshot.
    pub name: String,
    /// Whether the flag is turned on.
    pub enabled: bool,
    /// Value attached to the flag. [`TypedValue::Null`] when the flag carries none.
    pub value: TypedValue,
}

impl FlagRecord {
    /// Create a new flag record.
    ///
    /// ```
    /// # use flagsync::FlagRecord;
    /// let record = FlagRecord::new("dark-mode", true, "midnight");
    /// assert!(record.enabled);
    /// ```
    pub fn new(name: impl Into<String>, enabled: bool, value: impl Into<TypedValue>) -> Self {
        FlagRecord {
            name: name.into(),
            enabled,
            value: value.into(),
        }
    }
}

/// An immutable set of flags keyed by name.
///
/// Snapshots are never mutated after construction. The client hands them out behind an `Arc` and
/// replaces them completely when new data arrives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagSnapshot {
    flags: HashMap<String, FlagRecord>,
}

impl FlagSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        FlagSnapshot::default()
    }

    /// Get a flag by name.
    pub fn get(&self, name: &str) -> Option<&FlagRecord> {
        self.flags.get(name)
    }

    /// Returns `true` only if the flag is present and enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).is_some_and(|flag| flag.enabled)
    }

    /// Returns the flag value, or `None` if the flag is absent or has no value.
    pub fn value(&self, name: &str) -> Option<&TypedValue> {
        self.get(name)
            .map(|flag| &flag.value)
            .filter(|value| !value.is_null())
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Iterate over flags in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &FlagRecord> {
        self.flags.values()
    }

    /// Names of all flags in the snapshot.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.flags.keys().map(String::as_str)
    }

    /// A copy of this snapshot without flags whose value is [`TypedValue::Null`].
    pub fn without_null_values(&self) -> FlagSnapshot {
        self.iter()
            .filter(|flag| !flag.value.is_null())
            .cloned()
            .collect()
    }
}

impl FromIterator<FlagRecord> for FlagSnapshot {
    /// Later records replace earlier ones with the same name.
    fn from_iter<T: IntoIterator<Item = FlagRecord>>(iter: T) -> Self {
        FlagSnapshot {
            flags: iter
                .into_iter()
                .map(|flag| (flag.name.clone(), flag))
                .collect(),
        }
    }
}

/// A user-level key-value attribute stored on the server for an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trait {
    /// Trait key.
    #[serde(rename = "trait_key")]
    pub key: String,
    /// Trait value.
    #[serde(rename = "trait_value", default)]
    pub value: TypedValue,
}

impl Trait {
    #[allow(missing_docs)]
    pub fn new(key: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        Trait {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Flags and traits of a single identity (end-user).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Identity {
    /// Flags resolved for this identity, including per-identity overrides.
    pub flags: FlagSnapshot,
    /// Traits stored for this identity.
    #[serde(default)]
    pub traits: Vec<Trait>,
}

/// What a flag query asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagQuery {
    /// End-user identifier. `None` queries environment-level flags.
    pub identity: Option<String>,
    /// Only keep the named flag in the resolved snapshot.
    pub flag_name: Option<String>,
}

impl FlagQuery {
    /// Query all environment flags.
    pub fn environment() -> FlagQuery {
        FlagQuery::default()
    }

    /// Query flags of the given identity, or environment flags if `identity` is `None`.
    pub fn for_identity(identity: Option<&str>) -> FlagQuery {
        FlagQuery {
            identity: identity.map(str::to_owned),
            flag_name: None,
        }
    }

    /// Restrict the query to a single flag.
    pub fn with_flag(mut self, flag_name: impl Into<String>) -> FlagQuery {
        self.flag_name = Some(flag_name.into());
        self
    }
}

/// `TryParse` allows a single flag to fail parsing without failing the whole response.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct FlagWire {
    feature: FeatureWire,
    enabled: bool,
    #[serde(default)]
    feature_state_value: TypedValue,
}

#[derive(Debug, Deserialize)]
struct FeatureWire {
    name: String,
}

impl<'de> Deserialize<'de> for FlagSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let flags = Vec::<TryParse<FlagWire>>::deserialize(deserializer)?;
        Ok(flags
            .into_iter()
            .filter_map(|flag| match flag {
                TryParse::Parsed(flag) => Some(FlagRecord {
                    name: flag.feature.name,
                    enabled: flag.enabled,
                    value: flag.feature_state_value,
                }),
                TryParse::ParseFailed(value) => {
                    log::warn!(target: "flagsync", flag:serde = value; "skipping malformed flag");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn typed_value_decodes_in_fixed_order() {
        let decode = |value: serde_json::Value| serde_json::from_value::<TypedValue>(value).unwrap();

        assert_eq!(decode(json!(true)), TypedValue::Bool(true));
        assert_eq!(decode(json!(1)), TypedValue::Int(1));
        assert_eq!(decode(json!(-7)), TypedValue::Int(-7));
        assert_eq!(decode(json!(1.5)), TypedValue::Float(1.5));
        assert_eq!(decode(json!("1")), TypedValue::String("1".to_owned()));
        assert_eq!(decode(json!(null)), TypedValue::Null);
    }

    #[test]
    fn decodes_flag_list() {
        let snapshot: FlagSnapshot = serde_json::from_value(json!([
            {
                "feature": {"id": 1, "name": "dark_mode", "type": "STANDARD"},
                "enabled": true,
                "feature_state_value": null
            },
            {
                "feature": {"id": 2, "name": "font_size", "type": "STANDARD"},
                "enabled": false,
                "feature_state_value": 12
            }
        ]))
        .unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.is_enabled("dark_mode"));
        assert!(!snapshot.is_enabled("font_size"));
        assert_eq!(snapshot.value("dark_mode"), None);
        assert_eq!(snapshot.value("font_size"), Some(&TypedValue::Int(12)));
    }

    #[test]
    fn malformed_flag_does_not_fail_the_snapshot() {
        let snapshot: FlagSnapshot = serde_json::from_value(json!([
            {"feature": {"name": "good"}, "enabled": true},
            {"feature": "not-an-object", "enabled": true},
            {"feature": {"name": "json"}, "enabled": true, "feature_state_value": {"a": 1}}
        ]))
        .unwrap();

        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["good"]);
    }

    #[test]
    fn decodes_identity_with_traits() {
        let identity: Identity = serde_json::from_value(json!({
            "flags": [{"feature": {"name": "beta"}, "enabled": true, "feature_state_value": "on"}],
            "traits": [
                {"trait_key": "age", "trait_value": 42},
                {"trait_key": "plan", "trait_value": "pro"}
            ]
        }))
        .unwrap();

        assert!(identity.flags.is_enabled("beta"));
        assert_eq!(
            identity.traits,
            vec![Trait::new("age", 42i64), Trait::new("plan", "pro")]
        );
    }

    #[test]
    fn without_null_values_drops_no_opinion_flags() {
        let snapshot: FlagSnapshot = [
            FlagRecord::new("a", true, TypedValue::Null),
            FlagRecord::new("b", false, 3i64),
        ]
        .into_iter()
        .collect();

        let filtered = snapshot.without_null_values();

        assert_eq!(filtered.len(), 1);
        assert!(filtered.get("b").is_some());
    }
}
