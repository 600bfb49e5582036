//! Catalog entities: [`Step`], [`AttributeSpec`], [`WorkConfig`], [`HealthState`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::ids::{Name, StepId};

/// The kind of dispatch a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Synchronous external call; the client's response is the outcome.
    Sync,
    /// Asynchronous external call; the client later reports the outcome via
    /// webhook callback (`NotCompleteWork` followed by `CompleteWork`/`FailWork`).
    Async,
    /// Runs a registered script against the step's inputs.
    Script,
    /// Starts a child flow and completes when it deactivates.
    Flow,
}

/// How an attribute relates to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeRole {
    Required,
    Optional,
    Output,
}

/// The declared type of an attribute's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
}

/// How a consumer renames or transforms a producer's attribute before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeMapping {
    /// Rename the attribute as seen by this step.
    pub name: Option<Name>,
    /// Transform script name applied to the value before binding.
    pub script: Option<String>,
}

/// One attribute declaration on a step: a required/optional input, or an
/// output the step promises to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub role: AttributeRole,
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// JSON-encoded default literal, used by optional inputs that time out
    /// unset.
    pub default: Option<String>,
    /// Optional-input fallback timeout, anchored to when this step's
    /// required inputs became ready.
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,
    /// Whether this attribute drives per-element fan-out (`Array`-typed
    /// only).
    #[serde(default)]
    pub for_each: bool,
    #[serde(default)]
    pub mapping: Option<AttributeMapping>,
}

impl AttributeSpec {
    pub fn required(attr_type: AttributeType) -> Self {
        Self {
            role: AttributeRole::Required,
            attr_type,
            default: None,
            timeout: None,
            for_each: false,
            mapping: None,
        }
    }

    pub fn output(attr_type: AttributeType) -> Self {
        Self {
            role: AttributeRole::Output,
            attr_type,
            default: None,
            timeout: None,
            for_each: false,
            mapping: None,
        }
    }

    pub fn optional(attr_type: AttributeType, default: impl Into<String>) -> Self {
        Self {
            role: AttributeRole::Optional,
            attr_type,
            default: Some(default.into()),
            timeout: None,
            for_each: false,
            mapping: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_for_each(mut self) -> Self {
        self.for_each = true;
        self
    }
}

/// The backoff strategy for a step's work-item retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Per-step overrides of the engine-wide retry/parallelism defaults.
///
/// `max_retries == 0` means "inherit the engine default"; `max_retries < 0`
/// means "retry forever".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkConfig {
    pub max_retries: i32,
    #[serde(with = "duration_millis")]
    pub init_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    pub backoff_type: BackoffType,
    pub parallelism: u32,
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            init_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            backoff_type: BackoffType::Exponential,
            parallelism: 1,
        }
    }
}

impl WorkConfig {
    /// Merge per-step overrides onto the engine-wide default, field by field.
    /// A zero `max_retries` inherits rather than overriding to zero.
    pub fn resolved_against(&self, default: &WorkConfig) -> WorkConfig {
        WorkConfig {
            max_retries: if self.max_retries == 0 {
                default.max_retries
            } else {
                self.max_retries
            },
            init_backoff: if self.init_backoff.is_zero() {
                default.init_backoff
            } else {
                self.init_backoff
            },
            max_backoff: if self.max_backoff.is_zero() {
                default.max_backoff
            } else {
                self.max_backoff
            },
            backoff_type: self.backoff_type,
            parallelism: if self.parallelism == 0 {
                default.parallelism
            } else {
                self.parallelism
            },
        }
    }
}

/// The reported health of a registered step, set by `UpdateStepHealth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthState {
    pub status: HealthStatus,
    pub error: Option<String>,
}

/// HTTP dispatch configuration for a `Sync`/`Async` step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpSpec {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
}

/// Script dispatch configuration for a `Script` step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScriptSpec {
    pub language: String,
    pub source: String,
}

/// Child-flow dispatch configuration for a `Flow` step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlowSpec {
    pub plan_ref: String,
}

/// A reusable unit of work declared once into the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub attributes: HashMap<Name, AttributeSpec>,
    #[serde(default)]
    pub http: Option<HttpSpec>,
    #[serde(default)]
    pub script: Option<ScriptSpec>,
    #[serde(default)]
    pub predicate: Option<ScriptSpec>,
    #[serde(default)]
    pub flow: Option<FlowSpec>,
    #[serde(default)]
    pub work: WorkConfig,
    #[serde(default)]
    pub memoizable: bool,
}

impl Step {
    pub fn required_inputs(&self) -> impl Iterator<Item = (&Name, &AttributeSpec)> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role == AttributeRole::Required)
    }

    pub fn optional_inputs(&self) -> impl Iterator<Item = (&Name, &AttributeSpec)> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role == AttributeRole::Optional)
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&Name, &AttributeSpec)> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role == AttributeRole::Output)
    }

    pub fn for_each_attribute(&self) -> Option<&Name> {
        self.attributes
            .iter()
            .find(|(_, spec)| spec.for_each)
            .map(|(name, _)| name)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_config_inherits_zero_fields() {
        let default = WorkConfig {
            max_retries: 3,
            ..WorkConfig::default()
        };
        let override_cfg = WorkConfig {
            max_retries: 0,
            parallelism: 4,
            ..WorkConfig::default()
        };
        let resolved = override_cfg.resolved_against(&default);
        assert_eq!(resolved.max_retries, 3);
        assert_eq!(resolved.parallelism, 4);
    }

    #[test]
    fn negative_max_retries_means_unlimited_and_is_not_inherited() {
        let default = WorkConfig::default();
        let override_cfg = WorkConfig {
            max_retries: -1,
            ..WorkConfig::default()
        };
        let resolved = override_cfg.resolved_against(&default);
        assert_eq!(resolved.max_retries, -1);
    }
}
