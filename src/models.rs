//! Model name mapping and model listings.
//!
//! Clients address models by OpenAI names; the built-in table maps the common
//! ones onto Gemini models, and the config's `[models]` table can add to or
//! override it. Names found in neither pass through unchanged.

use std::collections::HashMap;
use std::hash::BuildHasher;

use crate::translate::gemini_types::ModelInfo;
use crate::translate::openai_types::{ModelList, ModelObject};

/// Fixed creation timestamp reported for every model; Gemini does not expose one.
pub const MODEL_CREATED: i64 = 1_686_935_002;

const DEFAULT_MODEL_MAP: &[(&str, &str)] = &[
    ("gpt-3.5-turbo", "gemini-1.5-flash"),
    ("gpt-4", "gemini-1.5-pro"),
    ("gpt-4-turbo", "gemini-1.5-pro"),
    ("gpt-4-turbo-preview", "gemini-1.5-pro"),
    ("gpt-4-vision-preview", "gemini-1.5-pro"),
    ("gpt-4o", "gemini-1.5-flash"),
    ("gpt-4o-mini", "gemini-1.5-flash-8b"),
    ("text-embedding-ada-002", "text-embedding-004"),
    ("text-embedding-3-small", "text-embedding-004"),
    ("text-embedding-3-large", "text-embedding-004"),
];

/// Resolve the Gemini model for a client-facing name.
pub fn resolve_model<S: BuildHasher>(requested: &str, overrides: &HashMap<String, String, S>) -> String {
    if let Some(mapped) = overrides.get(requested) {
        return mapped.clone();
    }

    DEFAULT_MODEL_MAP
        .iter()
        .find(|(from, _)| *from == requested)
        .map_or_else(
            || requested.trim_start_matches("models/").to_string(),
            |(_, to)| (*to).to_string(),
        )
}

pub fn model_object(id: &str, owned_by: &str) -> ModelObject {
    ModelObject {
        id: id.to_string(),
        object: "model".to_string(),
        created: MODEL_CREATED,
        owned_by: owned_by.to_string(),
    }
}

/// Convert backend models into a listing, preserving backend order.
pub fn model_list(models: &[ModelInfo], owned_by: &str) -> ModelList {
    ModelList {
        object: "list".to_string(),
        data: models
            .iter()
            .map(|m| model_object(m.name.trim_start_matches("models/"), owned_by))
            .collect(),
    }
}
