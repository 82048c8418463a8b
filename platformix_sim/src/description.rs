//! Environment description: which platforms a session instantiates.
//!
//! ```json
//! {
//!   "generics": { "runs": 20 },
//!   "alias": { "adder": "calc" },
//!   "platforms": {
//!     "calc": { "base_platform": "calc", "mock": true },
//!     "seq":  { "base_platform": "sequencer", "platform": "adder", "runs": 5 }
//!   }
//! }
//! ```
//!
//! Every key of a platform entry that isn't one of the structural fields is
//! handed to the kind's constructor as a keyword argument. Values are taken
//! literally; there is no templating.

use crate::error::DescriptionError;
use platformix_core::{ComponentSpec, Kwargs};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// One platform instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformEntry {
    /// Factory kind
    pub base_platform: String,

    /// Hosting platform
    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub wait: Vec<String>,

    /// Seconds
    #[serde(default)]
    pub start_max_wait: Option<f64>,

    /// Seconds
    #[serde(default)]
    pub stop_max_wait: Option<f64>,

    /// Instances with a false condition are skipped
    #[serde(default = "enabled")]
    pub condition: bool,

    #[serde(flatten)]
    pub kwargs: Kwargs,
}

fn enabled() -> bool {
    true
}

impl PlatformEntry {
    pub fn new(base_platform: impl Into<String>) -> Self {
        Self {
            base_platform: base_platform.into(),
            platform: None,
            wait: Vec::new(),
            start_max_wait: None,
            stop_max_wait: None,
            condition: true,
            kwargs: Kwargs::new(),
        }
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Construction parameters of the instance named `name`.
    pub fn spec(&self, name: &str) -> Result<ComponentSpec, DescriptionError> {
        let mut spec = ComponentSpec::new(name, self.base_platform.clone()).with_wait(self.wait.iter().cloned());
        spec.parent = self.platform.clone();
        if let Some(secs) = self.start_max_wait {
            spec = spec.with_start_max_wait(limit(name, "start_max_wait", secs)?);
        }
        if let Some(secs) = self.stop_max_wait {
            spec = spec.with_stop_max_wait(limit(name, "stop_max_wait", secs)?);
        }
        Ok(spec)
    }
}

fn limit(platform: &str, field: &'static str, secs: f64) -> Result<Duration, DescriptionError> {
    Duration::try_from_secs_f64(secs).map_err(|_| DescriptionError::InvalidLimit {
        platform: platform.to_string(),
        field,
    })
}

/// A whole test environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvDescription {
    /// Values tests can read; overridable from the command line
    #[serde(default)]
    pub generics: BTreeMap<String, Value>,

    /// Alternative names for platforms, usable in `platform` and `wait`
    #[serde(default)]
    pub alias: BTreeMap<String, String>,

    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformEntry>,
}

impl EnvDescription {
    pub fn from_json(text: &str) -> Result<Self, DescriptionError> {
        let description: Self = serde_json::from_str(text)?;
        description.validate()?;
        Ok(description)
    }

    pub fn from_value(value: Value) -> Result<Self, DescriptionError> {
        let description: Self = serde_json::from_value(value)?;
        description.validate()?;
        Ok(description)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DescriptionError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<(), DescriptionError> {
        for (alias, target) in &self.alias {
            if self.platforms.contains_key(alias) {
                return Err(DescriptionError::AliasShadowing(alias.clone()));
            }
            if !self.platforms.contains_key(target) {
                return Err(DescriptionError::UnknownAlias {
                    alias: alias.clone(),
                    target: target.clone(),
                });
            }
        }
        for (name, entry) in &self.platforms {
            entry.spec(name)?;
        }
        Ok(())
    }

    /// Platform name behind `name`, which may be an alias.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.alias.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Enabled instances with aliases resolved, in name order.
    pub fn instances(&self) -> Result<Vec<(ComponentSpec, &PlatformEntry)>, DescriptionError> {
        let mut out = Vec::new();
        for (name, entry) in self.platforms.iter().filter(|(_, e)| e.condition) {
            let mut spec = entry.spec(name)?;
            spec.parent = spec.parent.map(|p| self.resolve(&p).to_string());
            spec.wait = spec.wait.iter().map(|w| self.resolve(w).to_string()).collect();
            out.push((spec, entry));
        }
        Ok(out)
    }

    pub fn generic(&self, name: &str) -> Option<&Value> {
        self.generics.get(name)
    }

    /// Sets a generic from its command line text.
    ///
    /// `True`/`False` become booleans, then integers and floats are tried,
    /// anything else stays a string.
    pub fn override_generic(&mut self, name: &str, text: &str) {
        let value = match text {
            "True" => Value::Bool(true),
            "False" => Value::Bool(false),
            _ => text
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| text.parse::<f64>().map(Value::from))
                .unwrap_or_else(|_| Value::String(text.to_string())),
        };
        self.generics.insert(name.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_platforms_and_kwargs() {
        let d = EnvDescription::from_value(json!({
            "platforms": {
                "calc": {"base_platform": "calc", "mock": true, "start_max_wait": 1.5},
                "seq": {"base_platform": "sequencer", "platform": "calc", "wait": ["calc"], "runs": 3}
            }
        }))
        .unwrap();
        let calc = &d.platforms["calc"];
        assert_eq!(calc.kwargs["mock"], json!(true));
        assert!(!calc.kwargs.contains_key("base_platform"));
        let spec = calc.spec("calc").unwrap();
        assert_eq!(spec.start_max_wait, Some(Duration::from_millis(1500)));
        assert_eq!(spec.kind, "calc");

        let seq = d.platforms["seq"].spec("seq").unwrap();
        assert_eq!(seq.parent.as_deref(), Some("calc"));
        assert_eq!(seq.wait, ["calc"]);
    }

    #[test]
    fn test_alias_resolved() {
        let d = EnvDescription::from_value(json!({
            "alias": {"adder": "calc"},
            "platforms": {
                "calc": {"base_platform": "calc"},
                "seq": {"base_platform": "sequencer", "platform": "adder"}
            }
        }))
        .unwrap();
        let instances = d.instances().unwrap();
        let seq = instances.iter().find(|(s, _)| s.name == "seq").unwrap();
        assert_eq!(seq.0.parent.as_deref(), Some("calc"));
    }

    #[test]
    fn test_alias_errors() {
        let shadow = EnvDescription::from_value(json!({
            "alias": {"calc": "seq"},
            "platforms": {"calc": {"base_platform": "calc"}, "seq": {"base_platform": "sequencer"}}
        }));
        assert!(matches!(shadow, Err(DescriptionError::AliasShadowing(ref a)) if a == "calc"));

        let dangling = EnvDescription::from_value(json!({
            "alias": {"x": "ghost"},
            "platforms": {}
        }));
        assert!(matches!(dangling, Err(DescriptionError::UnknownAlias { .. })));
    }

    #[test]
    fn test_condition_skips_instance() {
        let d = EnvDescription::from_value(json!({
            "platforms": {
                "a": {"base_platform": "platformix"},
                "b": {"base_platform": "platformix", "condition": false}
            }
        }))
        .unwrap();
        let names: Vec<String> = d.instances().unwrap().into_iter().map(|(s, _)| s.name).collect();
        assert_eq!(names, ["a"]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            EnvDescription::from_json("{\"platforms\": {\"a\": {}}}"),
            Err(DescriptionError::Parse(_))
        ));
        assert!(matches!(
            EnvDescription::from_json("{\"model\": {}}"),
            Err(DescriptionError::Parse(_))
        ));
        let negative = EnvDescription::from_value(json!({
            "platforms": {"a": {"base_platform": "platformix", "stop_max_wait": -1.0}}
        }));
        assert!(matches!(negative, Err(DescriptionError::InvalidLimit { field: "stop_max_wait", .. })));
    }

    #[test]
    fn test_generic_overrides() {
        let mut d = EnvDescription::default();
        d.override_generic("enable", "True");
        d.override_generic("runs", "12");
        d.override_generic("ratio", "0.5");
        d.override_generic("tag", "a tag");
        assert_eq!(d.generic("enable"), Some(&json!(true)));
        assert_eq!(d.generic("runs"), Some(&json!(12)));
        assert_eq!(d.generic("ratio"), Some(&json!(0.5)));
        assert_eq!(d.generic("tag"), Some(&json!("a tag")));
    }
}
