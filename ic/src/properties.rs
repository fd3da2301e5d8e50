//! Launch property composition
//!
//! Builds the ordered property and option sets handed to the server launch
//! script. Later layers override earlier ones on key collision while the key
//! keeps the position where it was first inserted, so rendered argument
//! vectors are deterministic.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::config::Config;

/// Property naming the instance base directory
pub const BASE_DIR_PROPERTY: &str = "jboss.server.base.dir";

/// Property naming the server profile to boot with
pub const DEFAULT_CONFIG_PROPERTY: &str = "jboss.server.default.config";

/// Output form that composed entries are rendered as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeForm {
    /// `-Dkey=value` invocation flags
    Cli,
    /// `key=value` lines for a properties file
    File,
    /// Free-form JVM flags, `key` immediately followed by `value`
    Jvm,
}

/// Insertion-ordered string map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    entries: Vec<(String, String)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`, replacing an existing value in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
        self
    }

    /// Layer every entry of `other` on top of this map
    pub fn merge(&mut self, other: &PropertyMap) -> &mut Self {
        for (k, v) in &other.entries {
            self.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render each entry according to `form`
    pub fn compose_as_list(&self, form: ComposeForm) -> Vec<String> {
        self.iter()
            .map(|(k, v)| match form {
                ComposeForm::Cli => format!("-D{}={}", k, v),
                ComposeForm::File => format!("{}={}", k, v),
                ComposeForm::Jvm => format!("{}{}", k, v),
            })
            .collect()
    }

    /// Render all entries as one string according to `form`
    ///
    /// File form is newline separated; the flag forms are space separated.
    pub fn compose_as_string(&self, form: ComposeForm) -> String {
        let separator = match form {
            ComposeForm::File => "\n",
            ComposeForm::Cli | ComposeForm::Jvm => " ",
        };
        self.compose_as_list(form).join(separator)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = PropertyMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for PropertyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Scalar value accepted on the right-hand side of a property
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Text of the value as written; floats are refused since their source
    /// text is already gone (`1.10` would come back as `1.1`)
    fn into_text(self) -> Option<String> {
        match self {
            Scalar::Bool(b) => Some(b.to_string()),
            Scalar::Int(i) => Some(i.to_string()),
            Scalar::Float(_) => None,
            Scalar::Str(s) => Some(s),
        }
    }
}

struct PropertyMapVisitor;

impl<'de> Visitor<'de> for PropertyMapVisitor {
    type Value = PropertyMap;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a mapping of property names to scalar values")
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<PropertyMap, E> {
        Ok(PropertyMap::new())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<PropertyMap, A::Error> {
        let mut map = PropertyMap::new();
        while let Some((key, value)) = access.next_entry::<String, Option<Scalar>>()? {
            if map.get(&key).is_some() {
                return Err(serde::de::Error::custom(format!("duplicate property '{}'", key)));
            }
            let text = match value {
                None => String::new(),
                Some(scalar) => scalar.into_text().ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "property '{}' has a fractional number value; quote it to keep it as written",
                        key
                    ))
                })?,
            };
            map.insert(key, text);
        }
        Ok(map)
    }
}

impl<'de> Deserialize<'de> for PropertyMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(PropertyMapVisitor)
    }
}

/// Properties and options composed for one instance launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchProperties {
    /// Rendered as `-Dkey=value`
    pub properties: PropertyMap,
    /// Rendered as `keyvalue`, passed through `JAVA_OPTS`
    pub options: PropertyMap,
}

impl LaunchProperties {
    /// Compose the launch set for `name`, lowest precedence first:
    /// tool defaults, global properties, global options, instance
    /// properties, instance options. Absent layers contribute nothing.
    pub fn compose(config: &Config, name: &str) -> Self {
        debug!(%name, "LaunchProperties::compose: called");
        let mut launch = Self::default();

        launch
            .properties
            .insert(
                BASE_DIR_PROPERTY,
                config.paths.instance_dir(name).to_string_lossy().into_owned(),
            )
            .insert(DEFAULT_CONFIG_PROPERTY, config.defaults.jboss.profile.clone());

        launch.properties.merge(&config.defaults.properties);
        launch.options.merge(&config.defaults.options);

        if let Some(instance) = config.instance(name) {
            debug!(%name, "LaunchProperties::compose: applying instance overrides");
            launch.properties.merge(&instance.properties);
            launch.options.merge(&instance.options);
        }

        debug!(
            properties = launch.properties.len(),
            options = launch.options.len(),
            "LaunchProperties::compose: returning"
        );
        launch
    }

    /// `-Dkey=value` arguments for the launch script
    pub fn property_args(&self) -> Vec<String> {
        self.properties.compose_as_list(ComposeForm::Cli)
    }

    /// Space-joined JVM flags, `None` when no options were composed
    pub fn java_opts(&self) -> Option<String> {
        if self.options.is_empty() {
            None
        } else {
            Some(self.options.compose_as_string(ComposeForm::Jvm))
        }
    }

    /// Properties in properties-file form
    pub fn properties_file(&self) -> String {
        let mut content = self.properties.compose_as_string(ComposeForm::File);
        content.push('\n');
        content
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceConfig;
    use proptest::prelude::*;

    fn config_with(defaults: PropertyMap, options: PropertyMap, instance: Option<InstanceConfig>) -> Config {
        let mut config = Config::default();
        config.defaults.properties = defaults;
        config.defaults.options = options;
        config.instances.extend(instance);
        config
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut map = PropertyMap::new();
        map.insert("a", "1").insert("b", "2").insert("a", "3");

        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(map.get("a"), Some("3"));
    }

    #[test]
    fn test_compose_forms() {
        let map: PropertyMap = [("a", "1"), ("b", "2")].into_iter().collect();

        assert_eq!(map.compose_as_list(ComposeForm::Cli), vec!["-Da=1", "-Db=2"]);
        assert_eq!(map.compose_as_string(ComposeForm::Cli), "-Da=1 -Db=2");
        assert_eq!(map.compose_as_string(ComposeForm::File), "a=1\nb=2");
    }

    #[test]
    fn test_jvm_form_has_no_separator() {
        let map: PropertyMap = [("-Xmx", "1g"), ("-XX:+UseG1GC", "")].into_iter().collect();

        assert_eq!(map.compose_as_list(ComposeForm::Jvm), vec!["-Xmx1g", "-XX:+UseG1GC"]);
        assert_eq!(map.compose_as_string(ComposeForm::Jvm), "-Xmx1g -XX:+UseG1GC");
    }

    #[test]
    fn test_compose_tool_defaults_first() {
        let config = Config::default();
        let launch = LaunchProperties::compose(&config, "web1");

        let keys: Vec<_> = launch.properties.keys().collect();
        assert_eq!(keys, vec![BASE_DIR_PROPERTY, DEFAULT_CONFIG_PROPERTY]);
        assert_eq!(launch.properties.get(BASE_DIR_PROPERTY), Some("/opt/app/jboss/web1"));
        assert_eq!(launch.properties.get(DEFAULT_CONFIG_PROPERTY), Some("standalone-full.xml"));
        assert!(launch.java_opts().is_none());
    }

    #[test]
    fn test_instance_property_overrides_default() {
        let mut instance = InstanceConfig::new("web1");
        instance.properties.insert("a", "2");
        let config = config_with([("a", "1")].into_iter().collect(), PropertyMap::new(), Some(instance));

        let launch = LaunchProperties::compose(&config, "web1");

        assert_eq!(launch.properties.get("a"), Some("2"));
        assert!(launch.property_args().contains(&"-Da=2".to_string()));
    }

    #[test]
    fn test_default_option_kept_without_override() {
        let config = config_with(
            PropertyMap::new(),
            [("x", "")].into_iter().collect(),
            Some(InstanceConfig::new("web1")),
        );

        let launch = LaunchProperties::compose(&config, "web1");

        assert_eq!(launch.options.get("x"), Some(""));
        assert_eq!(launch.java_opts().as_deref(), Some("x"));
    }

    #[test]
    fn test_instance_can_override_profile() {
        let mut instance = InstanceConfig::new("web1");
        instance.properties.insert(DEFAULT_CONFIG_PROPERTY, "standalone-ha.xml");
        let config = config_with(PropertyMap::new(), PropertyMap::new(), Some(instance));

        let launch = LaunchProperties::compose(&config, "web1");

        assert_eq!(launch.property_args()[1], "-Djboss.server.default.config=standalone-ha.xml");
    }

    #[test]
    fn test_properties_and_options_stay_separate() {
        let mut instance = InstanceConfig::new("web1");
        instance.options.insert("-Xmx", "2g");
        let config = config_with(
            [("-Xmx", "ignored")].into_iter().collect(),
            [("-Xmx", "1g")].into_iter().collect(),
            Some(instance),
        );

        let launch = LaunchProperties::compose(&config, "web1");

        assert_eq!(launch.properties.get("-Xmx"), Some("ignored"));
        assert_eq!(launch.options.get("-Xmx"), Some("2g"));
    }

    #[test]
    fn test_unknown_instance_contributes_nothing() {
        let config = config_with([("a", "1")].into_iter().collect(), PropertyMap::new(), None);
        let launch = LaunchProperties::compose(&config, "ghost");

        assert_eq!(launch.properties.len(), 3);
        assert_eq!(launch.properties.get("a"), Some("1"));
    }

    #[test]
    fn test_properties_file_rendering() {
        let config = Config::default();
        let launch = LaunchProperties::compose(&config, "web1");

        let file = launch.properties_file();
        assert!(file.starts_with("jboss.server.base.dir=/opt/app/jboss/web1\n"));
        assert!(file.ends_with("jboss.server.default.config=standalone-full.xml\n"));
    }

    #[test]
    fn test_deserialize_keeps_order_and_scalars() {
        let yaml = "zeta: 1\nalpha: true\nmid: text\nempty:\n";
        let map: PropertyMap = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid", "empty"]);
        assert_eq!(map.get("zeta"), Some("1"));
        assert_eq!(map.get("alpha"), Some("true"));
        assert_eq!(map.get("empty"), Some(""));
    }

    #[test]
    fn test_deserialize_refuses_unquoted_fractions() {
        let err = serde_yaml::from_str::<PropertyMap>("app.version: 1.10\n").unwrap_err();
        assert!(err.to_string().contains("quote it"), "{}", err);

        let map: PropertyMap = serde_yaml::from_str("app.version: '1.10'\n").unwrap();
        assert_eq!(map.get("app.version"), Some("1.10"));
    }

    #[test]
    fn test_deserialize_rejects_nested_values() {
        let yaml = "a:\n  b: c\n";
        assert!(serde_yaml::from_str::<PropertyMap>(yaml).is_err());
    }

    proptest! {
        #[test]
        fn prop_highest_layer_wins(
            defaults in proptest::collection::vec(("[a-d]", "[0-9]{1,3}"), 0..6),
            overrides in proptest::collection::vec(("[a-d]", "[0-9]{1,3}"), 0..6),
        ) {
            let defaults: PropertyMap = defaults.into_iter().collect();
            let overrides: PropertyMap = overrides.into_iter().collect();
            let mut instance = InstanceConfig::new("web1");
            instance.properties = overrides.clone();
            let config = config_with(defaults.clone(), PropertyMap::new(), Some(instance));

            let launch = LaunchProperties::compose(&config, "web1");

            for (k, v) in launch.properties.iter().skip(2) {
                let expected = overrides.get(k).or_else(|| defaults.get(k));
                prop_assert_eq!(Some(v), expected);
            }
            prop_assert_eq!(
                launch.properties.compose_as_list(ComposeForm::File).len(),
                launch.properties.compose_as_list(ComposeForm::Cli).len()
            );
        }
    }
}
