use super::{Emitter, Processor, ProcessorContext};
use crate::batch::Batch;
use crate::error::ProcessorError;
use crate::record::{AttributeValue, Attributes};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Set only when the key is absent.
    Insert,
    /// Set only when the key is present.
    Update,
    Upsert,
    Delete,
    /// Move `key` to `to`, overwriting.
    Rename,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    pub key: String,
    pub action: ActionKind,
    #[serde(default)]
    pub value: Option<AttributeValue>,
    #[serde(default)]
    pub from_attribute: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributesSettings {
    pub actions: Vec<ActionConfig>,
}

impl AttributesSettings {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.actions.is_empty() {
            return Err("actions must not be empty".into());
        }
        for (i, action) in self.actions.iter().enumerate() {
            compile(action).map_err(|e| format!("actions[{i}] ({}): {e}", action.key))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum ValueSource {
    Literal(AttributeValue),
    Attribute(String),
}

impl ValueSource {
    fn resolve(&self, attributes: &Attributes) -> Option<AttributeValue> {
        match self {
            ValueSource::Literal(value) => Some(value.clone()),
            ValueSource::Attribute(key) => attributes.get(key).cloned(),
        }
    }
}

#[derive(Debug, Clone)]
enum Action {
    Insert { key: String, value: ValueSource },
    Update { key: String, value: ValueSource },
    Upsert { key: String, value: ValueSource },
    Delete { key: String },
    Rename { key: String, to: String },
}

fn compile(config: &ActionConfig) -> Result<Action, String> {
    let key = config.key.clone();
    let value = || match (&config.value, &config.from_attribute) {
        (Some(value), None) => Ok(ValueSource::Literal(value.clone())),
        (None, Some(from)) => Ok(ValueSource::Attribute(from.clone())),
        (Some(_), Some(_)) => Err("set either `value` or `from_attribute`, not both".to_string()),
        (None, None) => Err("`value` or `from_attribute` is required".to_string()),
    };
    let no_value = || {
        if config.value.is_some() || config.from_attribute.is_some() {
            Err(format!("{:?} takes no value", config.action).to_lowercase())
        } else {
            Ok(())
        }
    };
    if config.to.is_some() && config.action != ActionKind::Rename {
        return Err("`to` is only valid for rename".into());
    }
    Ok(match config.action {
        ActionKind::Insert => Action::Insert { key, value: value()? },
        ActionKind::Update => Action::Update { key, value: value()? },
        ActionKind::Upsert => Action::Upsert { key, value: value()? },
        ActionKind::Delete => {
            no_value()?;
            Action::Delete { key }
        }
        ActionKind::Rename => {
            no_value()?;
            let to = config.to.clone().ok_or("rename requires `to`")?;
            Action::Rename { key, to }
        }
    })
}

impl Action {
    fn apply(&self, attributes: &mut Attributes) {
        match self {
            Action::Insert { key, value } => {
                if !attributes.contains_key(key)
                    && let Some(v) = value.resolve(attributes)
                {
                    attributes.insert(key.clone(), v);
                }
            }
            Action::Update { key, value } => {
                if attributes.contains_key(key)
                    && let Some(v) = value.resolve(attributes)
                {
                    attributes.insert(key.clone(), v);
                }
            }
            Action::Upsert { key, value } => {
                if let Some(v) = value.resolve(attributes) {
                    attributes.insert(key.clone(), v);
                }
            }
            Action::Delete { key } => {
                attributes.shift_remove(key);
            }
            Action::Rename { key, to } => {
                if let Some(v) = attributes.shift_remove(key) {
                    attributes.insert(to.clone(), v);
                }
            }
        }
    }
}

/// Applies an ordered list of attribute edits to every record.
pub struct AttributesProcessor {
    actions: Vec<Action>,
    ctx: ProcessorContext,
}

impl AttributesProcessor {
    pub fn new(settings: &AttributesSettings, ctx: ProcessorContext) -> Result<Self, String> {
        let actions = settings
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| compile(a).map_err(|e| format!("actions[{i}] ({}): {e}", a.key)))
            .collect::<Result<_, _>>()?;
        Ok(Self { actions, ctx })
    }

    fn apply(&self, attributes: &mut Attributes) {
        for action in &self.actions {
            action.apply(attributes);
        }
    }
}

impl Processor for AttributesProcessor {
    async fn process(&mut self, mut batch: Batch, out: &mut Emitter) -> Result<(), ProcessorError> {
        for record in &mut batch.records {
            self.apply(&mut record.attributes);
        }
        tracing::trace!(pipeline = %self.ctx.pipeline, records = batch.len(), "attributes applied");
        out.emit(batch).await
    }

    fn name(&self) -> &str {
        "attributes"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::test_util::*;

    fn processor(yaml: &str) -> AttributesProcessor {
        let settings: AttributesSettings = serde_yaml::from_str(yaml).unwrap();
        settings.validate().unwrap();
        AttributesProcessor::new(&settings, context("attributes")).unwrap()
    }

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), AttributeValue::from(*v)))
            .collect()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let p = processor("actions: [{key: env, action: insert, value: prod}]");
        let mut a = attrs(&[("env", "dev")]);
        p.apply(&mut a);
        assert_eq!(a["env"], "dev".into());

        let mut b = attrs(&[]);
        p.apply(&mut b);
        let once = b.clone();
        p.apply(&mut b);
        assert_eq!(b, once);
        assert_eq!(b["env"], "prod".into());
    }

    #[test]
    fn test_update_upsert_delete_rename() {
        let p = processor(
            r#"
actions:
  - {key: region, action: update, value: eu}
  - {key: tier, action: upsert, from_attribute: plan}
  - {key: secret, action: delete}
  - {key: user, action: rename, to: user.id}
"#,
        );
        let mut a = attrs(&[("plan", "gold"), ("secret", "x"), ("user", "42"), ("user.id", "old")]);
        p.apply(&mut a);
        assert!(!a.contains_key("region"));
        assert_eq!(a["tier"], "gold".into());
        assert!(!a.contains_key("secret"));
        assert!(!a.contains_key("user"));
        assert_eq!(a["user.id"], "42".into());
    }

    #[test]
    fn test_missing_source_attribute_is_a_no_op() {
        let p = processor("actions: [{key: tier, action: upsert, from_attribute: plan}]");
        let mut a = attrs(&[("tier", "free")]);
        p.apply(&mut a);
        assert_eq!(a["tier"], "free".into());
    }

    #[test]
    fn test_invalid_actions_are_rejected() {
        for yaml in [
            "actions: [{key: a, action: insert}]",
            "actions: [{key: a, action: delete, value: x}]",
            "actions: [{key: a, action: rename}]",
            "actions: [{key: a, action: upsert, value: x, to: b}]",
            "actions: []",
        ] {
            let settings: AttributesSettings = serde_yaml::from_str(yaml).unwrap();
            assert!(settings.validate().is_err(), "{yaml}");
        }
    }

    #[test]
    fn test_construction_fails_on_an_uncompilable_action() {
        let settings = AttributesSettings {
            actions: vec![
                ActionConfig {
                    key: "env".into(),
                    action: ActionKind::Insert,
                    value: Some("prod".into()),
                    from_attribute: None,
                    to: None,
                },
                ActionConfig {
                    key: "user".into(),
                    action: ActionKind::Rename,
                    value: None,
                    from_attribute: None,
                    to: None,
                },
            ],
        };
        let err = AttributesProcessor::new(&settings, context("attributes")).err().unwrap();
        assert!(err.starts_with("actions[1] (user)"), "{err}");
    }
}
