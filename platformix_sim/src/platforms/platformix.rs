//! Self-test platform: a tag property and an echo method, nothing else.

use crate::error::FactoryError;
use crate::factory::{Blueprint, Parts};
use platformix_core::Worker;
use serde_json::Value;
use std::any::Any;
use tracing::debug;

#[derive(Debug, Default)]
pub struct Platformix {
    /// Holds whatever it's set to
    pub tag: Value,
}

impl Platformix {
    /// Returns its arguments in reverse order.
    pub fn call_test(&self, args: &[Value]) -> anyhow::Result<Value> {
        if args.is_empty() {
            anyhow::bail!("At least one arg expected");
        }
        debug!("call_test {:?}", args);
        Ok(Value::Array(args.iter().rev().cloned().collect()))
    }
}

impl Worker for Platformix {
    fn property(&self, name: &str) -> Option<Value> {
        (name == "tag").then(|| self.tag.clone())
    }

    fn set_property(&mut self, name: &str, value: Value) -> Option<anyhow::Result<Value>> {
        (name == "tag").then(|| {
            self.tag = value.clone();
            Ok(value)
        })
    }

    fn invoke(&mut self, method: &str, args: &[Value]) -> Option<anyhow::Result<Value>> {
        (method == "call_test").then(|| self.call_test(args))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub fn construct(blueprint: &Blueprint<'_>) -> Result<Parts, FactoryError> {
    let tag = blueprint.kwarg::<Value>("tag")?.unwrap_or(Value::Null);
    Ok(Parts::new(Box::new(Platformix { tag })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_test_reverses() {
        let p = Platformix::default();
        assert_eq!(p.call_test(&[json!(0), json!(101), json!(202)]).unwrap(), json!([202, 101, 0]));
        let err = p.call_test(&[]).unwrap_err();
        assert_eq!(err.to_string(), "At least one arg expected");
    }

    #[test]
    fn test_tag_property() {
        let mut p = Platformix::default();
        assert_eq!(p.property("tag"), Some(Value::Null));
        assert!(p.set_property("tag", json!("x")).unwrap().is_ok());
        assert_eq!(p.property("tag"), Some(json!("x")));
        assert!(p.property("colour").is_none());
        assert!(p.invoke("nope", &[]).is_none());
    }
}
