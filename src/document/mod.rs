//! Host-side model of the rendered document.
//!
//! A [`Document`] is either *assembling* (the host owns the markup and every
//! operation edits a local tree) or *live* (the view owns the DOM and every
//! operation is shipped to it through a [`ScriptEvaluator`]). Callers see the
//! same API in both states; [`Document::dispatch`] is the only place that
//! looks at the state.

mod attributes;
mod element;
mod local;
mod ops;

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{BridgeError, BridgeResult};
use crate::identity::{self, IdentityTag};
use crate::lock;
use crate::registry::{CallRegistry, HostFunction};

pub use attributes::{attribute_for_property, AttributeKind, KnownAttribute};
pub use element::{ClassList, ElementHandle};
use element::Placements;
pub use local::LocalTree;
pub use ops::{decode_reply, encode_reply, DomOp, DOM_ENTRY};

pub(crate) use local::{ensure_head, new_element};

/// Runs script in the view and returns its stringified result.
pub trait ScriptEvaluator: Send + Sync {
    fn evaluate(&self, script: &str) -> BridgeResult<String>;
}

enum DocumentState {
    Assembling {
        markup: String,
    },
    Live {
        /// Markup the view was started with. Only a cache once live.
        snapshot: String,
        evaluator: Arc<dyn ScriptEvaluator>,
    },
}

struct DocumentInner {
    state: Mutex<DocumentState>,
    registry: CallRegistry,
    placements: Placements,
}

/// Shared handle to a document. Clones refer to the same document.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

impl Document {
    /// Parses `html` and tags every element in it.
    pub fn parse(html: &str, registry: CallRegistry) -> Self {
        let tree = LocalTree::parse_document(html);
        let tagged = identity::tag_subtree(tree.root());
        trace!(target: "document", elements = tagged, "tagged document");

        Self {
            inner: Arc::new(DocumentInner {
                state: Mutex::new(DocumentState::Assembling {
                    markup: tree.serialize(),
                }),
                registry,
                placements: Placements::default(),
            }),
        }
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.inner.registry
    }

    pub(crate) fn placements(&self) -> &Placements {
        &self.inner.placements
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.inner.state), DocumentState::Live { .. })
    }

    /// Current markup while assembling, or the markup the view started with.
    pub fn markup(&self) -> String {
        match &*lock(&self.inner.state) {
            DocumentState::Assembling { markup } => markup.clone(),
            DocumentState::Live { snapshot, .. } => snapshot.clone(),
        }
    }

    /// Replaces the assembled markup wholesale, e.g. with the injected page.
    pub fn replace_markup(&self, markup: String) -> BridgeResult<()> {
        match &mut *lock(&self.inner.state) {
            DocumentState::Assembling { markup: current } => {
                *current = markup;
                Ok(())
            }
            DocumentState::Live { .. } => Err(BridgeError::precondition(
                "cannot replace the markup of a running document",
            )),
        }
    }

    /// Switches to live mode. From now on the view is authoritative.
    pub fn go_live(&self, evaluator: Arc<dyn ScriptEvaluator>) -> BridgeResult<()> {
        let mut state = lock(&self.inner.state);
        let snapshot = match &mut *state {
            DocumentState::Assembling { markup } => std::mem::take(markup),
            DocumentState::Live { .. } => {
                return Err(BridgeError::precondition("document is already running"))
            }
        };
        debug!(target: "document", bytes = snapshot.len(), "document is live");
        *state = DocumentState::Live {
            snapshot,
            evaluator,
        };
        Ok(())
    }

    /// Raw escape hatch: runs `script` in the view and returns its result.
    pub fn evaluate(&self, script: &str) -> BridgeResult<String> {
        let evaluator = match &*lock(&self.inner.state) {
            DocumentState::Live { evaluator, .. } => Arc::clone(evaluator),
            DocumentState::Assembling { .. } => {
                return Err(BridgeError::precondition(
                    "script can only be evaluated once the view is running",
                ))
            }
        };
        evaluator.evaluate(script)
    }

    /// Applies `op` locally or ships it to the view, depending on the state.
    pub fn dispatch(&self, op: DomOp) -> BridgeResult<Value> {
        let evaluator = {
            let mut state = lock(&self.inner.state);
            match &mut *state {
                DocumentState::Assembling { markup } => {
                    let mut tree = LocalTree::parse_document(markup);
                    let value = tree.apply(&op)?;
                    if tree.changed() {
                        *markup = tree.serialize();
                    }
                    return Ok(value);
                }
                DocumentState::Live { evaluator, .. } => Arc::clone(evaluator),
            }
        };

        // The state lock is released for the round trip, so host functions
        // invoked meanwhile may use the document too.
        trace!(target: "document", ?op, "dispatching to view");
        let raw = evaluator.evaluate(&op.to_script()?)?;
        decode_reply(&raw)
    }

    /// Creates a detached element. It is inserted by `append_child`.
    pub fn create_element(&self, name: &str) -> BridgeResult<ElementHandle> {
        let valid = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && name.starts_with(|c: char| c.is_ascii_alphabetic());
        if !valid {
            return Err(BridgeError::precondition(format!(
                "{name:?} is not a valid element name"
            )));
        }
        let name = name.to_ascii_lowercase();
        // Detached markup is reparsed as a fragment, which drops these.
        if matches!(name.as_str(), "html" | "head" | "body" | "frameset") {
            return Err(BridgeError::precondition(format!(
                "<{name}> cannot be created as a detached element"
            )));
        }

        let node = new_element(&name);
        let tag = node
            .as_element()
            .map(identity::tag_element)
            .ok_or_else(|| BridgeError::precondition("failed to create element"))?;
        Ok(ElementHandle::detached(self.clone(), tag, node.to_string()))
    }

    pub fn get_element_by_id(&self, id: &str) -> BridgeResult<Option<ElementHandle>> {
        let value = self.dispatch(DomOp::QueryById { id: id.to_string() })?;
        Ok(ops::into_tag(value)?.map(|tag| ElementHandle::found(self.clone(), tag)))
    }

    pub fn get_elements_by_class_name(&self, name: &str) -> BridgeResult<Vec<ElementHandle>> {
        let value = self.dispatch(DomOp::QueryByClass {
            name: name.to_string(),
        })?;
        Ok(self.handles(ops::into_tags(value)?))
    }

    pub fn get_elements_by_tag_name(&self, name: &str) -> BridgeResult<Vec<ElementHandle>> {
        let value = self.dispatch(DomOp::QueryByTag {
            name: name.to_string(),
        })?;
        Ok(self.handles(ops::into_tags(value)?))
    }

    /// Handle for an element known by its identity tag.
    pub fn element(&self, tag: &str) -> BridgeResult<ElementHandle> {
        let tag = IdentityTag::parse(tag)?;
        Ok(ElementHandle::known(self.clone(), tag))
    }

    /// Appends `child` to the body.
    pub fn append_child(&self, child: &ElementHandle) -> BridgeResult<()> {
        child.insert_into(None)
    }

    /// Appends markup to the body. Elements in it are tagged first.
    pub fn append(&self, html: &str) -> BridgeResult<()> {
        self.dispatch(DomOp::AppendHtml {
            parent: None,
            html: local::tag_markup(html),
        })
        .map(drop)
    }

    /// Calls `function` whenever `event` fires on the document.
    pub fn add_event_listener(&self, event: &str, function: &HostFunction) -> BridgeResult<()> {
        let key = self.registry().register(function);
        self.dispatch(DomOp::Listen {
            target: None,
            event: event.to_string(),
            function: key,
        })
        .map(drop)
    }

    fn handles(&self, tags: Vec<IdentityTag>) -> Vec<ElementHandle> {
        tags.into_iter()
            .map(|tag| ElementHandle::found(self.clone(), tag))
            .collect()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("running", &self.is_running())
            .field("functions", &self.registry().len())
            .finish()
    }
}
