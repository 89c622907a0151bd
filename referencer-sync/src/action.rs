//! Action validation and dispatch.
//!
//! A client action arrives as a type tag plus an untyped JSON map. Decoding
//! turns the pair into one [`Action`] variant or a [`ValidationError`] naming
//! the offending key; applying an action is exactly one store call.

use serde_json::Value;
use std::sync::Arc;

use crate::protocol::Payload;
use crate::storage::{
    Arrow, ArrowEndpoint, Highlight, StoreError, Underline, WorkspaceStore, DEFAULT_ARROW_STYLE,
    DEFAULT_HIGHLIGHT_TYPE,
};

/// The supported action type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    AddLayer,
    RemoveLayer,
    UpdateLayerName,
    UpdateLayerColor,
    ToggleLayerVisibility,
    ReorderLayers,
    AddHighlight,
    RemoveHighlight,
    UpdateHighlightAnnotation,
    AddArrow,
    RemoveArrow,
    UpdateArrowStyle,
    AddUnderline,
    RemoveUnderline,
    AddEditor,
    RemoveEditor,
    UpdateSectionName,
    ToggleSectionVisibility,
    ReorderEditors,
    UpdateEditorContent,
}

impl ActionKind {
    pub const ALL: [ActionKind; 20] = [
        ActionKind::AddLayer,
        ActionKind::RemoveLayer,
        ActionKind::UpdateLayerName,
        ActionKind::UpdateLayerColor,
        ActionKind::ToggleLayerVisibility,
        ActionKind::ReorderLayers,
        ActionKind::AddHighlight,
        ActionKind::RemoveHighlight,
        ActionKind::UpdateHighlightAnnotation,
        ActionKind::AddArrow,
        ActionKind::RemoveArrow,
        ActionKind::UpdateArrowStyle,
        ActionKind::AddUnderline,
        ActionKind::RemoveUnderline,
        ActionKind::AddEditor,
        ActionKind::RemoveEditor,
        ActionKind::UpdateSectionName,
        ActionKind::ToggleSectionVisibility,
        ActionKind::ReorderEditors,
        ActionKind::UpdateEditorContent,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::AddLayer => "addLayer",
            ActionKind::RemoveLayer => "removeLayer",
            ActionKind::UpdateLayerName => "updateLayerName",
            ActionKind::UpdateLayerColor => "updateLayerColor",
            ActionKind::ToggleLayerVisibility => "toggleLayerVisibility",
            ActionKind::ReorderLayers => "reorderLayers",
            ActionKind::AddHighlight => "addHighlight",
            ActionKind::RemoveHighlight => "removeHighlight",
            ActionKind::UpdateHighlightAnnotation => "updateHighlightAnnotation",
            ActionKind::AddArrow => "addArrow",
            ActionKind::RemoveArrow => "removeArrow",
            ActionKind::UpdateArrowStyle => "updateArrowStyle",
            ActionKind::AddUnderline => "addUnderline",
            ActionKind::RemoveUnderline => "removeUnderline",
            ActionKind::AddEditor => "addEditor",
            ActionKind::RemoveEditor => "removeEditor",
            ActionKind::UpdateSectionName => "updateSectionName",
            ActionKind::ToggleSectionVisibility => "toggleSectionVisibility",
            ActionKind::ReorderEditors => "reorderEditors",
            ActionKind::UpdateEditorContent => "updateEditorContent",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded, well-typed action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    AddLayer { id: String, name: String, color: String },
    RemoveLayer { id: String },
    UpdateLayerName { id: String, name: String },
    UpdateLayerColor { id: String, color: String },
    ToggleLayerVisibility { id: String },
    ReorderLayers { layer_ids: Vec<String> },
    AddHighlight { layer_id: String, highlight: Highlight },
    RemoveHighlight { layer_id: String, highlight_id: String },
    UpdateHighlightAnnotation { layer_id: String, highlight_id: String, annotation: String },
    AddArrow { layer_id: String, arrow: Arrow },
    RemoveArrow { layer_id: String, arrow_id: String },
    UpdateArrowStyle { layer_id: String, arrow_id: String, arrow_style: String },
    AddUnderline { layer_id: String, underline: Underline },
    RemoveUnderline { layer_id: String, underline_id: String },
    AddEditor { index: i64, name: String },
    RemoveEditor { index: i64 },
    UpdateSectionName { index: i64, name: String },
    ToggleSectionVisibility { index: i64 },
    ReorderEditors { permutation: Vec<i64> },
    UpdateEditorContent { index: i64, content: Value },
}

impl Action {
    /// Validate `payload` against the shape required by `kind`.
    pub fn parse(kind: ActionKind, payload: &Payload) -> Result<Self, ValidationError> {
        let p = Fields(payload);
        Ok(match kind {
            ActionKind::AddLayer => Action::AddLayer {
                id: p.string("id")?,
                name: p.string("name")?,
                color: p.string("color")?,
            },
            ActionKind::RemoveLayer => Action::RemoveLayer { id: p.string("id")? },
            ActionKind::UpdateLayerName => Action::UpdateLayerName {
                id: p.string("id")?,
                name: p.string("name")?,
            },
            ActionKind::UpdateLayerColor => Action::UpdateLayerColor {
                id: p.string("id")?,
                color: p.string("color")?,
            },
            ActionKind::ToggleLayerVisibility => {
                Action::ToggleLayerVisibility { id: p.string("id")? }
            }
            ActionKind::ReorderLayers => Action::ReorderLayers {
                layer_ids: p.string_array("layerIds")?,
            },
            ActionKind::AddHighlight => {
                let layer_id = p.string("layerId")?;
                let h = p.map("highlight")?;
                Action::AddHighlight {
                    layer_id,
                    highlight: Highlight {
                        id: h.string("id")?,
                        editor_index: h.int("editorIndex")?,
                        from: h.int("from")?,
                        to: h.int("to")?,
                        text: h.string_or_empty("text"),
                        annotation: h.string_or_empty("annotation"),
                        kind: DEFAULT_HIGHLIGHT_TYPE.to_string(),
                    },
                }
            }
            ActionKind::RemoveHighlight => Action::RemoveHighlight {
                layer_id: p.string("layerId")?,
                highlight_id: p.string("highlightId")?,
            },
            ActionKind::UpdateHighlightAnnotation => Action::UpdateHighlightAnnotation {
                layer_id: p.string("layerId")?,
                highlight_id: p.string("highlightId")?,
                annotation: p.string("annotation")?,
            },
            ActionKind::AddArrow => {
                let layer_id = p.string("layerId")?;
                let a = p.map("arrow")?;
                let id = a.string("id")?;
                let from = a.map("from")?;
                let to = a.map("to")?;
                Action::AddArrow {
                    layer_id,
                    arrow: Arrow {
                        id,
                        from: from.endpoint()?,
                        to: to.endpoint()?,
                        arrow_style: a
                            .0
                            .get("arrowStyle")
                            .and_then(Value::as_str)
                            .unwrap_or(DEFAULT_ARROW_STYLE)
                            .to_string(),
                    },
                }
            }
            ActionKind::RemoveArrow => Action::RemoveArrow {
                layer_id: p.string("layerId")?,
                arrow_id: p.string("arrowId")?,
            },
            ActionKind::UpdateArrowStyle => Action::UpdateArrowStyle {
                layer_id: p.string("layerId")?,
                arrow_id: p.string("arrowId")?,
                arrow_style: p.string("arrowStyle")?,
            },
            ActionKind::AddUnderline => {
                let layer_id = p.string("layerId")?;
                let u = p.map("underline")?;
                Action::AddUnderline {
                    layer_id,
                    underline: Underline {
                        id: u.string("id")?,
                        editor_index: u.int("editorIndex")?,
                        from: u.int("from")?,
                        to: u.int("to")?,
                        text: u.string_or_empty("text"),
                    },
                }
            }
            ActionKind::RemoveUnderline => Action::RemoveUnderline {
                layer_id: p.string("layerId")?,
                underline_id: p.string("underlineId")?,
            },
            ActionKind::AddEditor => Action::AddEditor {
                index: p.int("index")?,
                name: p.string("name")?,
            },
            ActionKind::RemoveEditor => Action::RemoveEditor { index: p.int("index")? },
            ActionKind::UpdateSectionName => Action::UpdateSectionName {
                index: p.int("index")?,
                name: p.string("name")?,
            },
            ActionKind::ToggleSectionVisibility => {
                Action::ToggleSectionVisibility { index: p.int("index")? }
            }
            ActionKind::ReorderEditors => Action::ReorderEditors {
                permutation: p.int_array("permutation")?,
            },
            ActionKind::UpdateEditorContent => Action::UpdateEditorContent {
                index: p.int("editorIndex")?,
                content: p.present("contentJson")?.clone(),
            },
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::AddLayer { .. } => ActionKind::AddLayer,
            Action::RemoveLayer { .. } => ActionKind::RemoveLayer,
            Action::UpdateLayerName { .. } => ActionKind::UpdateLayerName,
            Action::UpdateLayerColor { .. } => ActionKind::UpdateLayerColor,
            Action::ToggleLayerVisibility { .. } => ActionKind::ToggleLayerVisibility,
            Action::ReorderLayers { .. } => ActionKind::ReorderLayers,
            Action::AddHighlight { .. } => ActionKind::AddHighlight,
            Action::RemoveHighlight { .. } => ActionKind::RemoveHighlight,
            Action::UpdateHighlightAnnotation { .. } => ActionKind::UpdateHighlightAnnotation,
            Action::AddArrow { .. } => ActionKind::AddArrow,
            Action::RemoveArrow { .. } => ActionKind::RemoveArrow,
            Action::UpdateArrowStyle { .. } => ActionKind::UpdateArrowStyle,
            Action::AddUnderline { .. } => ActionKind::AddUnderline,
            Action::RemoveUnderline { .. } => ActionKind::RemoveUnderline,
            Action::AddEditor { .. } => ActionKind::AddEditor,
            Action::RemoveEditor { .. } => ActionKind::RemoveEditor,
            Action::UpdateSectionName { .. } => ActionKind::UpdateSectionName,
            Action::ToggleSectionVisibility { .. } => ActionKind::ToggleSectionVisibility,
            Action::ReorderEditors { .. } => ActionKind::ReorderEditors,
            Action::UpdateEditorContent { .. } => ActionKind::UpdateEditorContent,
        }
    }

    /// Perform the action against `workspace_id`.
    pub fn apply(&self, store: &WorkspaceStore, workspace_id: &str) -> Result<(), StoreError> {
        let ws = workspace_id;
        match self {
            Action::AddLayer { id, name, color } => store.add_layer(ws, id, name, color),
            Action::RemoveLayer { id } => store.remove_layer(ws, id),
            Action::UpdateLayerName { id, name } => store.update_layer_name(ws, id, name),
            Action::UpdateLayerColor { id, color } => store.update_layer_color(ws, id, color),
            Action::ToggleLayerVisibility { id } => store.toggle_layer_visibility(ws, id),
            Action::ReorderLayers { layer_ids } => store.reorder_layers(ws, layer_ids),
            Action::AddHighlight { layer_id, highlight } => store.add_highlight(layer_id, highlight),
            Action::RemoveHighlight { layer_id, highlight_id } => {
                store.remove_highlight(layer_id, highlight_id)
            }
            Action::UpdateHighlightAnnotation { layer_id, highlight_id, annotation } => {
                store.update_highlight_annotation(layer_id, highlight_id, annotation)
            }
            Action::AddArrow { layer_id, arrow } => store.add_arrow(layer_id, arrow),
            Action::RemoveArrow { layer_id, arrow_id } => store.remove_arrow(layer_id, arrow_id),
            Action::UpdateArrowStyle { layer_id, arrow_id, arrow_style } => {
                store.update_arrow_style(layer_id, arrow_id, arrow_style)
            }
            Action::AddUnderline { layer_id, underline } => store.add_underline(layer_id, underline),
            Action::RemoveUnderline { layer_id, underline_id } => {
                store.remove_underline(layer_id, underline_id)
            }
            Action::AddEditor { index, name } => store.add_editor(ws, *index, name),
            Action::RemoveEditor { index } => store.remove_editor(ws, *index),
            Action::UpdateSectionName { index, name } => store.update_section_name(ws, *index, name),
            Action::ToggleSectionVisibility { index } => store.toggle_section_visibility(ws, *index),
            Action::ReorderEditors { permutation } => store.reorder_editors(ws, permutation),
            Action::UpdateEditorContent { index, content } => {
                store.update_editor_content(ws, *index, content)
            }
        }
    }
}

/// Payload shape errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("key \"{key}\": missing")]
    Missing { key: String },
    #[error("key \"{key}\": expected {expected}, got {got}")]
    WrongType {
        key: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("{key}[{index}]: expected {expected}, got {got}")]
    WrongElementType {
        key: String,
        index: usize,
        expected: &'static str,
        got: &'static str,
    },
}

/// Dispatch failure. Displays as the message sent back to the client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates payloads and applies them to the store.
pub struct ActionDispatcher {
    store: Arc<WorkspaceStore>,
}

impl ActionDispatcher {
    pub fn new(store: Arc<WorkspaceStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    /// Decode and apply one action. Nothing is written if validation fails.
    pub fn dispatch(
        &self,
        workspace_id: &str,
        kind: ActionKind,
        payload: &Payload,
    ) -> Result<Action, DispatchError> {
        let action = Action::parse(kind, payload)?;
        action.apply(&self.store, workspace_id)?;
        log::debug!("Applied {kind} to workspace {workspace_id}");
        Ok(action)
    }
}

// ─── Payload field access ─────────────────────────────────────────────

/// Dynamic kind names used in validation messages.
fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}

#[derive(Clone, Copy)]
struct Fields<'a>(&'a Payload);

impl<'a> Fields<'a> {
    /// Required key; `null` counts as missing.
    fn present(self, key: &str) -> Result<&'a Value, ValidationError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Err(ValidationError::Missing { key: key.to_string() }),
            Some(value) => Ok(value),
        }
    }

    fn wrong(key: &str, expected: &'static str, got: &Value) -> ValidationError {
        ValidationError::WrongType {
            key: key.to_string(),
            expected,
            got: kind_of(got),
        }
    }

    fn string(self, key: &str) -> Result<String, ValidationError> {
        let value = self.present(key)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Self::wrong(key, "string", value))
    }

    fn string_or_empty(self, key: &str) -> String {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Numbers arrive as floats and are truncated toward zero.
    fn int(self, key: &str) -> Result<i64, ValidationError> {
        let value = self.present(key)?;
        value
            .as_f64()
            .map(|n| n as i64)
            .ok_or_else(|| Self::wrong(key, "number", value))
    }

    fn map(self, key: &str) -> Result<Fields<'a>, ValidationError> {
        let value = self.present(key)?;
        value
            .as_object()
            .map(Fields)
            .ok_or_else(|| Self::wrong(key, "map", value))
    }

    fn array(self, key: &str) -> Result<&'a Vec<Value>, ValidationError> {
        let value = self.present(key)?;
        value.as_array().ok_or_else(|| Self::wrong(key, "array", value))
    }

    fn string_array(self, key: &str) -> Result<Vec<String>, ValidationError> {
        self.array(key)?
            .iter()
            .enumerate()
            .map(|(index, item)| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ValidationError::WrongElementType {
                        key: key.to_string(),
                        index,
                        expected: "string",
                        got: kind_of(item),
                    })
            })
            .collect()
    }

    fn int_array(self, key: &str) -> Result<Vec<i64>, ValidationError> {
        self.array(key)?
            .iter()
            .enumerate()
            .map(|(index, item)| {
                item.as_f64()
                    .map(|n| n as i64)
                    .ok_or_else(|| ValidationError::WrongElementType {
                        key: key.to_string(),
                        index,
                        expected: "number",
                        got: kind_of(item),
                    })
            })
            .collect()
    }

    fn endpoint(self) -> Result<ArrowEndpoint, ValidationError> {
        Ok(ArrowEndpoint {
            editor_index: self.int("editorIndex")?,
            from: self.int("from")?,
            to: self.int("to")?,
            text: self.string_or_empty("text"),
        })
    }
}
