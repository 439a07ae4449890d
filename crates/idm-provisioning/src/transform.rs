//! Attribute value transformation.
//!
//! Script evaluation is pluggable through [`TransformEvaluator`]. The built-in
//! [`TemplateTransformEvaluator`] understands `${name}` expressions, where
//! `name` is `value` (the raw mapped value) or an entity property, with
//! optional `|lower`, `|upper` and `|trim` filters.

use std::sync::LazyLock;

use idm_connector::AttributeValue;
use idm_secrets::GuardedString;
use regex::Regex;
use thiserror::Error;

use crate::mapping::AttributeMapping;
use crate::model::ProvisioningEntity;

/// Transformation failures.
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    /// The expression could not be evaluated.
    #[error("Transformation of '{attribute}' failed: {message}")]
    Evaluation { attribute: String, message: String },

    /// The expression uses an unknown filter.
    #[error("Unknown transformation filter '{filter}' in '{attribute}'")]
    UnknownFilter { attribute: String, filter: String },
}

/// Evaluates mapping expressions in both directions.
pub trait TransformEvaluator: Send + Sync {
    /// Transform a raw internal value into the value written to the target.
    fn to_resource(
        &self,
        mapping: &AttributeMapping,
        entity: &ProvisioningEntity,
        value: AttributeValue,
    ) -> Result<AttributeValue, TransformError>;

    /// Transform a value read from the target into its internal form.
    fn from_resource(
        &self,
        mapping: &AttributeMapping,
        value: AttributeValue,
    ) -> Result<AttributeValue, TransformError>;
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([\w.]+)(?:\|(\w+))?\}").expect("PLACEHOLDER is a valid regex pattern")
});

/// `${...}` template evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateTransformEvaluator;

impl TemplateTransformEvaluator {
    /// Create an evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn evaluate(
        &self,
        mapping: &AttributeMapping,
        expression: &str,
        entity: Option<&ProvisioningEntity>,
        value: AttributeValue,
    ) -> Result<AttributeValue, TransformError> {
        let mut guarded = matches!(value, AttributeValue::Guarded(_));
        let lookup = |name: &str| -> AttributeValue {
            if name == "value" {
                value.clone()
            } else {
                entity.map_or(AttributeValue::Null, |e| e.property(name))
            }
        };

        // A lone placeholder without filter keeps the value's type.
        if let Some(captures) = PLACEHOLDER.captures(expression) {
            if captures.get(0).map(|m| m.as_str()) == Some(expression) && captures.get(2).is_none()
            {
                return Ok(lookup(&captures[1]));
            }
        }

        let mut rendered = String::with_capacity(expression.len());
        let mut last = 0;
        for captures in PLACEHOLDER.captures_iter(expression) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            rendered.push_str(&expression[last..whole.start()]);
            last = whole.end();

            let resolved = lookup(&captures[1]);
            guarded |= matches!(resolved, AttributeValue::Guarded(_));
            let text = render(mapping, resolved)?;
            match captures.get(2).map(|m| m.as_str()) {
                None => rendered.push_str(&text),
                Some("lower") => rendered.push_str(&text.to_lowercase()),
                Some("upper") => rendered.push_str(&text.to_uppercase()),
                Some("trim") => rendered.push_str(text.trim()),
                Some(other) => {
                    return Err(TransformError::UnknownFilter {
                        attribute: mapping.name.clone(),
                        filter: other.to_string(),
                    })
                }
            }
        }
        rendered.push_str(&expression[last..]);

        if guarded {
            Ok(AttributeValue::Guarded(GuardedString::new(rendered)))
        } else {
            Ok(AttributeValue::String(rendered))
        }
    }
}

fn render(mapping: &AttributeMapping, value: AttributeValue) -> Result<String, TransformError> {
    match value {
        AttributeValue::Null => Ok(String::new()),
        AttributeValue::String(s) => Ok(s),
        AttributeValue::Integer(i) => Ok(i.to_string()),
        AttributeValue::Boolean(b) => Ok(b.to_string()),
        AttributeValue::Guarded(g) => Ok(g.expose_secret().to_string()),
        other => Err(TransformError::Evaluation {
            attribute: mapping.name.clone(),
            message: format!("cannot interpolate a {} value", other.type_name()),
        }),
    }
}

impl TransformEvaluator for TemplateTransformEvaluator {
    fn to_resource(
        &self,
        mapping: &AttributeMapping,
        entity: &ProvisioningEntity,
        value: AttributeValue,
    ) -> Result<AttributeValue, TransformError> {
        match mapping.transform_to_resource.as_deref() {
            None => Ok(value),
            Some(expression) => self.evaluate(mapping, expression, Some(entity), value),
        }
    }

    fn from_resource(
        &self,
        mapping: &AttributeMapping,
        value: AttributeValue,
    ) -> Result<AttributeValue, TransformError> {
        match mapping.transform_from_resource.as_deref() {
            None => Ok(value),
            Some(expression) => self.evaluate(mapping, expression, None, value),
        }
    }
}
