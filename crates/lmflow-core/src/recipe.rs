//! The recipe model: input descriptors and step parameters.
//!
//! A recipe is a small expression tree whose nodes are typed operations
//! over content-addressed inputs. The external form may nest sub-recipes
//! inline (`computed_step`); the stored form is flattened, with every
//! inline sub-recipe replaced by an `internal_step_link` to a persisted
//! step of its own.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hash::ContentHash;
use crate::id::{DerivationId, StepId};

/// One input of a step, in recipe order.
///
/// `ComputedStep` only appears in external (unflattened) recipes;
/// `InternalStepLink` is its stored counterpart. All other variants appear
/// in both forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputDescriptor {
    /// Pin a specific content blob by hash.
    Content { hash: ContentHash },
    /// Inline UTF-8 string; hashed on definition, materialized on first use.
    Constant { value: String },
    /// Resolved through the document table at evaluation time.
    PinnedPath { path: String },
    /// The current value of another user-facing derivation.
    Derivation { id: DerivationId },
    /// An inline sub-recipe (external form only).
    ComputedStep { step: Box<StepParams> },
    /// Resolved form of an inline sub-recipe, stored after flattening.
    InternalStepLink { target_step_id: StepId },
}

/// Canonical parameters of an atomic recipe step: the operation tag,
/// operation-specific settings, and the ordered input list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepParams {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,
    pub inputs: Vec<InputDescriptor>,
}

impl InputDescriptor {
    /// The serde tag of this variant, used for shape comparisons.
    pub fn kind(&self) -> &'static str {
        match self {
            InputDescriptor::Content { .. } => "content",
            InputDescriptor::Constant { .. } => "constant",
            InputDescriptor::PinnedPath { .. } => "pinned_path",
            InputDescriptor::Derivation { .. } => "derivation",
            InputDescriptor::ComputedStep { .. } => "computed_step",
            InputDescriptor::InternalStepLink { .. } => "internal_step_link",
        }
    }
}

impl StepParams {
    pub fn new(operation: impl Into<String>, inputs: Vec<InputDescriptor>) -> Self {
        StepParams {
            operation: operation.into(),
            settings: Map::new(),
            inputs,
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// True when no input nests an inline sub-recipe.
    pub fn is_flattened(&self) -> bool {
        self.inputs
            .iter()
            .all(|input| !matches!(input, InputDescriptor::ComputedStep { .. }))
    }

    /// Derivation ids referenced directly by this step's inputs.
    pub fn derivation_refs(&self) -> impl Iterator<Item = &DerivationId> {
        self.inputs.iter().filter_map(|input| match input {
            InputDescriptor::Derivation { id } => Some(id),
            _ => None,
        })
    }

    /// Step ids referenced directly by this step's inputs.
    pub fn step_refs(&self) -> impl Iterator<Item = &StepId> {
        self.inputs.iter().filter_map(|input| match input {
            InputDescriptor::InternalStepLink { target_step_id } => Some(target_step_id),
            _ => None,
        })
    }

    /// Content hashes of `content` and hashed `constant` inputs, in order.
    /// These feed the step-input-content index at definition time.
    pub fn pinned_content_hashes(&self) -> Vec<ContentHash> {
        self.inputs
            .iter()
            .filter_map(|input| match input {
                InputDescriptor::Content { hash } => Some(hash.clone()),
                InputDescriptor::Constant { value } => Some(ContentHash::of(value)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_tags_match_the_wire_names() {
        let inputs = vec![
            InputDescriptor::Content {
                hash: ContentHash::of("x"),
            },
            InputDescriptor::Constant {
                value: "hello".to_string(),
            },
            InputDescriptor::PinnedPath {
                path: "/notes/a.md".to_string(),
            },
            InputDescriptor::Derivation {
                id: DerivationId::from("other"),
            },
            InputDescriptor::InternalStepLink {
                target_step_id: StepId::new("s-1"),
            },
        ];
        let tags: Vec<String> = inputs
            .iter()
            .map(|i| {
                serde_json::to_value(i).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(
            tags,
            ["content", "constant", "pinned_path", "derivation", "internal_step_link"]
        );
    }

    #[test]
    fn step_params_roundtrip() {
        let params = StepParams::new(
            "llm",
            vec![InputDescriptor::Constant {
                value: "body".to_string(),
            }],
        )
        .with_setting("prompt", "summarize")
        .with_setting("model", "small");

        let json = serde_json::to_string(&params).unwrap();
        let back: StepParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn empty_settings_are_omitted() {
        let params = StepParams::new("identity", vec![]);
        let value = serde_json::to_value(&params).unwrap();
        assert!(value.get("settings").is_none());
    }

    #[test]
    fn flattened_detection() {
        let nested = StepParams::new(
            "identity",
            vec![InputDescriptor::ComputedStep {
                step: Box::new(StepParams::new("concat", vec![])),
            }],
        );
        assert!(!nested.is_flattened());

        let flat = StepParams::new(
            "identity",
            vec![InputDescriptor::InternalStepLink {
                target_step_id: StepId::random(),
            }],
        );
        assert!(flat.is_flattened());
    }

    #[test]
    fn pinned_content_hashes_cover_constants() {
        let params = StepParams::new(
            "concat",
            vec![
                InputDescriptor::Content {
                    hash: ContentHash::of("a"),
                },
                InputDescriptor::Constant {
                    value: "b".to_string(),
                },
                InputDescriptor::Derivation {
                    id: DerivationId::from("ignored"),
                },
            ],
        );
        assert_eq!(
            params.pinned_content_hashes(),
            vec![ContentHash::of("a"), ContentHash::of("b")]
        );
    }
}
