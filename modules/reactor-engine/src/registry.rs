//! Document model registry: document type -> reducer.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use reactor_store::Action;

use crate::error::ReactorError;

/// Pure state update for one scope. No I/O, no side effects.
///
/// Receives the current state of the action's scope and mutates it in place.
/// Returning an error rejects the action; the caller discards `state`.
pub trait Reducer: Send + Sync {
    fn reduce(&self, state: &mut serde_json::Value, action: &Action) -> Result<()>;
}

impl<F> Reducer for F
where
    F: Fn(&mut serde_json::Value, &Action) -> Result<()> + Send + Sync,
{
    fn reduce(&self, state: &mut serde_json::Value, action: &Action) -> Result<()> {
        self(state, action)
    }
}

#[derive(Clone)]
pub struct DocumentModel {
    pub document_type: String,
    pub reducer: Arc<dyn Reducer>,
    /// Starting state per scope for new documents.
    pub initial_state: BTreeMap<String, serde_json::Value>,
}

impl DocumentModel {
    pub fn new(document_type: impl Into<String>, reducer: impl Reducer + 'static) -> Self {
        Self {
            document_type: document_type.into(),
            reducer: Arc::new(reducer),
            initial_state: BTreeMap::new(),
        }
    }

    pub fn with_initial_state(mut self, scope: impl Into<String>, state: serde_json::Value) -> Self {
        self.initial_state.insert(scope.into(), state);
        self
    }
}

impl std::fmt::Debug for DocumentModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentModel")
            .field("document_type", &self.document_type)
            .field("initial_state", &self.initial_state)
            .finish()
    }
}

#[derive(Default)]
pub struct DocumentModelRegistry {
    models: RwLock<HashMap<String, Arc<DocumentModel>>>,
}

impl DocumentModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, model: DocumentModel) {
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model.document_type.clone(), Arc::new(model));
    }

    pub fn unregister(&self, document_type: &str) -> bool {
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(document_type)
            .is_some()
    }

    pub fn get(&self, document_type: &str) -> crate::error::Result<Arc<DocumentModel>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_type)
            .cloned()
            .ok_or_else(|| ReactorError::ModelNotFound(document_type.to_string()))
    }

    pub fn document_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn closures_are_reducers() {
        let registry = DocumentModelRegistry::new();
        registry.register(DocumentModel::new(
            "test/counter",
            |state: &mut serde_json::Value, _action: &Action| -> anyhow::Result<()> {
                let n = state["count"].as_i64().unwrap_or(0);
                state["count"] = json!(n + 1);
                Ok(())
            },
        ));

        let model = registry.get("test/counter").unwrap();
        let mut state = json!({});
        let action = Action::new("a", "INC", "global", json!({}));
        model.reducer.reduce(&mut state, &action).unwrap();
        model.reducer.reduce(&mut state, &action).unwrap();
        assert_eq!(state, json!({"count": 2}));
    }

    #[test]
    fn unknown_type_is_model_not_found() {
        let registry = DocumentModelRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(ReactorError::ModelNotFound(_))
        ));
        assert!(!registry.unregister("nope"));
    }
}
