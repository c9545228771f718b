use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use super::attributes::KnownAttribute;
use super::local::{tag_markup, LocalTree};
use super::ops::{self, DomOp};
use super::Document;
use crate::error::{BridgeError, BridgeResult};
use crate::identity::IdentityTag;
use crate::lock;
use crate::registry::HostFunction;

/// Where an element's node currently lives.
enum Placement {
    /// Held by the document: its local tree while assembling, the view once
    /// live. Removed live nodes stay here, parked outside the document tree.
    Document,
    /// Not inserted anywhere; the element's own markup is kept here.
    Detached { markup: String },
    /// Inside another element, resolved through that element's placement.
    Nested { container: Slot },
}

type Slot = Arc<Mutex<Placement>>;

/// One placement per identity tag, shared by every handle to that element.
#[derive(Default)]
pub(crate) struct Placements {
    slots: Mutex<HashMap<IdentityTag, Weak<Mutex<Placement>>>>,
}

impl Placements {
    fn get_or_insert(&self, tag: &IdentityTag, placement: impl FnOnce() -> Placement) -> Slot {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(tag).and_then(Weak::upgrade) {
            return slot;
        }
        slots.retain(|_, slot| slot.strong_count() > 0);
        let slot = Arc::new(Mutex::new(placement()));
        slots.insert(tag.clone(), Arc::downgrade(&slot));
        slot
    }

    /// Points handles of elements inside `markup` at `container`, which now
    /// holds them.
    fn nest_within(&self, markup: &str, container: &Slot) {
        let tags = LocalTree::parse_fragment(markup).tags();
        let slots = lock(&self.slots);
        for tag in tags {
            let Some(slot) = slots.get(&tag).and_then(Weak::upgrade) else {
                continue;
            };
            if Arc::ptr_eq(&slot, container) {
                continue;
            }
            let mut placement = lock(&slot);
            if matches!(*placement, Placement::Document) {
                *placement = Placement::Nested {
                    container: Arc::clone(container),
                };
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| slot.strong_count() > 0)
            .count()
    }
}

enum Root {
    Document,
    Fragment(Slot),
}

impl Root {
    fn of(slot: &Slot) -> Self {
        let mut current = Arc::clone(slot);
        loop {
            let next = match &*lock(&current) {
                Placement::Document => return Root::Document,
                Placement::Detached { .. } => None,
                Placement::Nested { container } => Some(Arc::clone(container)),
            };
            match next {
                Some(container) => current = container,
                None => return Root::Fragment(current),
            }
        }
    }

    fn same(&self, other: &Root) -> bool {
        match (self, other) {
            (Root::Document, Root::Document) => true,
            (Root::Fragment(a), Root::Fragment(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Whether `target` is `start` or one of the containers `start` is nested in.
fn chain_contains(start: &Slot, target: &Slot) -> bool {
    let mut current = Arc::clone(start);
    loop {
        if Arc::ptr_eq(&current, target) {
            return true;
        }
        let next = match &*lock(&current) {
            Placement::Nested { container } => Arc::clone(container),
            _ => return false,
        };
        current = next;
    }
}

/// Host-side proxy for one DOM element, addressed by its identity tag.
///
/// Handles stay valid across the document's switch to live mode. Every handle
/// to the same element shares one placement, so moving the element through
/// any of them is seen by all.
#[derive(Clone)]
pub struct ElementHandle {
    document: Document,
    tag: IdentityTag,
    placement: Slot,
}

impl ElementHandle {
    /// Handle for an element a document query just found.
    pub(crate) fn found(document: Document, tag: IdentityTag) -> Self {
        let placement = document
            .placements()
            .get_or_insert(&tag, || Placement::Document);
        if matches!(Root::of(&placement), Root::Fragment(_)) {
            *lock(&placement) = Placement::Document;
        }
        Self {
            document,
            tag,
            placement,
        }
    }

    /// Handle for a tag the caller already knows, wherever the element is.
    pub(crate) fn known(document: Document, tag: IdentityTag) -> Self {
        let placement = document
            .placements()
            .get_or_insert(&tag, || Placement::Document);
        Self {
            document,
            tag,
            placement,
        }
    }

    pub(crate) fn detached(document: Document, tag: IdentityTag, markup: String) -> Self {
        let placement = document
            .placements()
            .get_or_insert(&tag, || Placement::Document);
        *lock(&placement) = Placement::Detached { markup };
        Self {
            document,
            tag,
            placement,
        }
    }

    pub fn tag(&self) -> &IdentityTag {
        &self.tag
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Whether the element is part of the document (directly or through its
    /// ancestors) rather than detached or removed. Asks the view once live.
    pub fn is_attached(&self) -> bool {
        if self.is_local() {
            return false;
        }
        if !self.document.is_running() {
            return true;
        }
        let connected = self.dispatch(DomOp::IsConnected {
            target: self.tag.clone(),
        });
        matches!(connected, Ok(Value::Bool(true)))
    }

    /// Whether the element's markup is held on the host rather than by the
    /// document.
    fn is_local(&self) -> bool {
        matches!(Root::of(&self.placement), Root::Fragment(_))
    }

    fn dispatch(&self, op: DomOp) -> BridgeResult<Value> {
        let mut current = Arc::clone(&self.placement);
        loop {
            let next = match &mut *lock(&current) {
                Placement::Document => None,
                Placement::Detached { markup } => {
                    let mut tree = LocalTree::parse_fragment(markup);
                    let value = tree.apply(&op)?;
                    if tree.changed() {
                        *markup = tree.serialize();
                    }
                    return Ok(value);
                }
                Placement::Nested { container } => Some(Arc::clone(container)),
            };
            match next {
                Some(container) => current = container,
                None => return self.document.dispatch(op),
            }
        }
    }

    fn dispatch_string(&self, op: DomOp) -> BridgeResult<String> {
        Ok(ops::into_string(self.dispatch(op)?)?.unwrap_or_default())
    }

    pub fn get_attribute(&self, name: &str) -> BridgeResult<Option<String>> {
        ops::into_string(self.dispatch(DomOp::GetAttribute {
            target: self.tag.clone(),
            name: name.to_string(),
        })?)
    }

    pub fn set_attribute(&self, name: &str, value: &str) -> BridgeResult<()> {
        self.dispatch(DomOp::SetAttribute {
            target: self.tag.clone(),
            name: name.to_string(),
            value: value.to_string(),
        })
        .map(drop)
    }

    pub fn remove_attribute(&self, name: &str) -> BridgeResult<()> {
        self.dispatch(DomOp::RemoveAttribute {
            target: self.tag.clone(),
            name: name.to_string(),
        })
        .map(drop)
    }

    pub fn attribute(&self, known: KnownAttribute) -> BridgeResult<Option<String>> {
        self.get_attribute(known.attribute_name())
    }

    pub fn set_attribute_known(&self, known: KnownAttribute, value: &str) -> BridgeResult<()> {
        self.set_attribute(known.attribute_name(), value)
    }

    /// Reads a boolean attribute such as `checked` through its DOM property.
    pub fn flag(&self, known: KnownAttribute) -> BridgeResult<bool> {
        if !known.is_boolean() {
            return Err(BridgeError::precondition(format!(
                "{known} is not a boolean attribute"
            )));
        }
        match self.get_property(known.property_name())? {
            Value::Bool(on) => Ok(on),
            Value::String(text) => Ok(text == "true"),
            _ => Ok(false),
        }
    }

    pub fn set_flag(&self, known: KnownAttribute, on: bool) -> BridgeResult<()> {
        if !known.is_boolean() {
            return Err(BridgeError::precondition(format!(
                "{known} is not a boolean attribute"
            )));
        }
        self.set_property(known.property_name(), on)
    }

    pub fn get_property(&self, name: &str) -> BridgeResult<Value> {
        self.dispatch(DomOp::GetProperty {
            target: self.tag.clone(),
            name: name.to_string(),
        })
    }

    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> BridgeResult<()> {
        self.dispatch(DomOp::SetProperty {
            target: self.tag.clone(),
            name: name.to_string(),
            value: value.into(),
        })
        .map(drop)
    }

    pub fn value(&self) -> BridgeResult<String> {
        Ok(ops::into_string(self.get_property("value")?)?.unwrap_or_default())
    }

    pub fn set_value(&self, value: &str) -> BridgeResult<()> {
        self.set_property("value", value)
    }

    pub fn style(&self, name: &str) -> BridgeResult<String> {
        self.dispatch_string(DomOp::GetStyle {
            target: self.tag.clone(),
            name: name.to_string(),
        })
    }

    pub fn set_style(&self, name: &str, value: &str) -> BridgeResult<()> {
        self.dispatch(DomOp::SetStyle {
            target: self.tag.clone(),
            name: name.to_string(),
            value: value.to_string(),
        })
        .map(drop)
    }

    /// Snapshot of the element's classes, without its identity tag.
    pub fn class_list(&self) -> BridgeResult<ClassList> {
        let classes = ops::into_strings(self.dispatch(DomOp::GetClassList {
            target: self.tag.clone(),
        })?)?;
        Ok(ClassList {
            element: self.clone(),
            classes,
        })
    }

    pub fn inner_html(&self) -> BridgeResult<String> {
        self.dispatch_string(DomOp::GetInnerHtml {
            target: self.tag.clone(),
        })
    }

    pub fn set_inner_html(&self, html: &str) -> BridgeResult<()> {
        self.dispatch(DomOp::SetInnerHtml {
            target: self.tag.clone(),
            html: tag_markup(html),
        })
        .map(drop)
    }

    pub fn outer_html(&self) -> BridgeResult<String> {
        self.dispatch_string(DomOp::GetOuterHtml {
            target: self.tag.clone(),
        })
    }

    pub fn text_content(&self) -> BridgeResult<String> {
        self.dispatch_string(DomOp::GetTextContent {
            target: self.tag.clone(),
        })
    }

    pub fn set_text_content(&self, text: &str) -> BridgeResult<()> {
        self.dispatch(DomOp::SetTextContent {
            target: self.tag.clone(),
            text: text.to_string(),
        })
        .map(drop)
    }

    /// Upper-case tag name, e.g. `DIV`.
    pub fn tag_name(&self) -> BridgeResult<String> {
        self.dispatch_string(DomOp::GetTagName {
            target: self.tag.clone(),
        })
    }

    /// Appends markup as the last children of this element. Elements in it
    /// are tagged before insertion.
    pub fn append(&self, html: &str) -> BridgeResult<()> {
        self.dispatch(DomOp::AppendHtml {
            parent: Some(self.tag.clone()),
            html: tag_markup(html),
        })
        .map(drop)
    }

    pub fn append_child(&self, child: &ElementHandle) -> BridgeResult<()> {
        child.insert_into(Some(self))
    }

    /// Takes the element out of its parent. The handle stays usable and the
    /// element can be appended again. A live node is parked in the view, so
    /// it keeps its listeners and state.
    pub fn remove(&self) -> BridgeResult<()> {
        if matches!(*lock(&self.placement), Placement::Detached { .. }) {
            return Ok(());
        }
        if self.document.is_running() && !self.is_local() {
            self.dispatch(DomOp::Park {
                target: self.tag.clone(),
            })?;
            *lock(&self.placement) = Placement::Document;
            return Ok(());
        }
        self.take_out().map(drop)
    }

    pub fn add_event_listener(&self, event: &str, function: &HostFunction) -> BridgeResult<()> {
        let key = self.document.registry().register(function);
        self.dispatch(DomOp::Listen {
            target: Some(self.tag.clone()),
            event: event.to_string(),
            function: key,
        })
        .map(drop)
    }

    /// Inserts this element under `parent`, or under the body when `None`.
    pub(crate) fn insert_into(&self, parent: Option<&ElementHandle>) -> BridgeResult<()> {
        if let Some(parent) = parent {
            if chain_contains(&parent.placement, &self.placement) {
                return Err(BridgeError::precondition(
                    "an element cannot be appended to itself or its descendants",
                ));
            }
        }

        let own_markup = match &*lock(&self.placement) {
            Placement::Detached { markup } => Some(markup.clone()),
            _ => None,
        };
        let own_root = Root::of(&self.placement);
        let target_root = match parent {
            Some(parent) => Root::of(&parent.placement),
            None => Root::Document,
        };
        let parent_tag = parent.map(|parent| parent.tag.clone());
        let move_element = DomOp::AppendElement {
            parent: parent_tag.clone(),
            child: self.tag.clone(),
        };

        let op = match (own_markup, &own_root, &target_root) {
            (Some(html), _, _) => DomOp::AppendHtml {
                parent: parent_tag,
                html,
            },
            _ if own_root.same(&target_root) => move_element,
            // A live node never round-trips through markup: the detached
            // tree it moves into is parked in the view first.
            (None, Root::Document, Root::Fragment(fragment)) if self.document.is_running() => {
                park_fragment(&self.document, fragment)?;
                move_element
            }
            (None, _, _) => DomOp::AppendHtml {
                parent: parent_tag,
                html: self.take_out()?,
            },
        };

        match parent {
            Some(parent) => parent.dispatch(op)?,
            None => self.document.dispatch(op)?,
        };

        *lock(&self.placement) = match parent {
            Some(parent) => Placement::Nested {
                container: Arc::clone(&parent.placement),
            },
            None => Placement::Document,
        };
        Ok(())
    }

    /// Removes the node from a local tree and keeps its markup on the host.
    fn take_out(&self) -> BridgeResult<String> {
        let markup = self.outer_html()?;
        self.dispatch(DomOp::Remove {
            target: self.tag.clone(),
        })?;
        *lock(&self.placement) = Placement::Detached {
            markup: markup.clone(),
        };
        self.document
            .placements()
            .nest_within(&markup, &self.placement);
        Ok(markup)
    }
}

/// Moves a detached tree into the view's parking area so live nodes can be
/// appended into it. Elements nested in it follow.
fn park_fragment(document: &Document, fragment: &Slot) -> BridgeResult<()> {
    let markup = match &*lock(fragment) {
        Placement::Detached { markup } => markup.clone(),
        _ => return Ok(()),
    };
    document.dispatch(DomOp::ParkHtml { html: markup })?;
    *lock(fragment) = Placement::Document;
    Ok(())
}

impl PartialEq for ElementHandle {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl Eq for ElementHandle {}

impl fmt::Debug for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementHandle")
            .field("tag", &self.tag)
            .field("local", &self.is_local())
            .finish()
    }
}

/// Editable copy of an element's classes. Every change is written back to the
/// element immediately; the identity tag stays in place.
#[derive(Debug, Clone)]
pub struct ClassList {
    element: ElementHandle,
    classes: Vec<String>,
}

impl ClassList {
    pub fn contains(&self, name: &str) -> bool {
        self.classes.iter().any(|class| class == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn add(&mut self, name: &str) -> BridgeResult<()> {
        validate_class(name)?;
        if !self.contains(name) {
            self.classes.push(name.to_string());
            self.commit()?;
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> BridgeResult<()> {
        let before = self.classes.len();
        self.classes.retain(|class| class != name);
        if self.classes.len() != before {
            self.commit()?;
        }
        Ok(())
    }

    /// Replaces `old` with `new` in place. Returns whether `old` was present.
    pub fn replace(&mut self, old: &str, new: &str) -> BridgeResult<bool> {
        validate_class(new)?;
        let Some(position) = self.classes.iter().position(|class| class == old) else {
            return Ok(false);
        };
        if self.contains(new) {
            self.classes.remove(position);
        } else {
            self.classes[position] = new.to_string();
        }
        self.commit()?;
        Ok(true)
    }

    /// Adds or removes `name`; `force` pins the outcome. Returns whether the
    /// class is present afterwards.
    pub fn toggle(&mut self, name: &str, force: Option<bool>) -> BridgeResult<bool> {
        let present = force.unwrap_or(!self.contains(name));
        if present {
            self.add(name)?;
        } else {
            self.remove(name)?;
        }
        Ok(present)
    }

    fn commit(&self) -> BridgeResult<()> {
        self.element
            .dispatch(DomOp::SetClassList {
                target: self.element.tag.clone(),
                classes: self.classes.clone(),
            })
            .map(drop)
    }
}

fn validate_class(name: &str) -> BridgeResult<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(BridgeError::precondition(format!(
            "{name:?} is not a valid class name"
        )));
    }
    if IdentityTag::parse(name).is_ok() {
        return Err(BridgeError::precondition(
            "identity tags cannot be edited through the class list",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::find_in_classes;
    use crate::registry::CallRegistry;

    fn document(html: &str) -> Document {
        Document::parse(html, CallRegistry::new())
    }

    fn by_id(doc: &Document, id: &str) -> ElementHandle {
        doc.get_element_by_id(id).unwrap().expect("element present")
    }

    #[test]
    fn created_elements_are_detached_until_appended() {
        let doc = document("<body><div id=\"root\"></div></body>");
        let child = doc.create_element("div").unwrap();
        assert!(!child.is_attached());
        assert!(!doc.markup().contains(child.tag().as_str()));

        by_id(&doc, "root").append_child(&child).unwrap();
        assert!(child.is_attached());
        assert!(doc.markup().contains(child.tag().as_str()));
    }

    #[test]
    fn detached_elements_can_be_edited() {
        let doc = document("<body></body>");
        let item = doc.create_element("li").unwrap();
        item.set_text_content("first").unwrap();
        item.class_list().unwrap().add("done").unwrap();
        doc.append_child(&item).unwrap();

        let found = doc.get_elements_by_class_name("done").unwrap();
        assert_eq!(found, vec![item.clone()]);
        assert_eq!(item.text_content().unwrap(), "first");
    }

    #[test]
    fn nested_detached_children_follow_their_parent() {
        let doc = document("<body></body>");
        let list = doc.create_element("ul").unwrap();
        let item = doc.create_element("li").unwrap();
        list.append_child(&item).unwrap();
        item.set_attribute("data-n", "1").unwrap();
        assert!(!item.is_attached());
        assert!(list.inner_html().unwrap().contains("data-n=\"1\""));

        doc.append_child(&list).unwrap();
        assert!(item.is_attached());
        assert_eq!(item.get_attribute("data-n").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn appending_into_a_descendant_is_rejected() {
        let doc = document("<body></body>");
        let outer = doc.create_element("div").unwrap();
        let inner = doc.create_element("div").unwrap();
        outer.append_child(&inner).unwrap();
        assert!(matches!(
            inner.append_child(&outer),
            Err(BridgeError::Precondition(_))
        ));
        assert!(matches!(
            outer.append_child(&outer),
            Err(BridgeError::Precondition(_))
        ));
    }

    #[test]
    fn removed_elements_keep_their_identity() {
        let doc = document("<body><p id=\"p\">text</p><div id=\"d\"></div></body>");
        let paragraph = by_id(&doc, "p");
        paragraph.remove().unwrap();
        assert!(!paragraph.is_attached());
        assert!(doc.get_element_by_id("p").unwrap().is_none());
        assert_eq!(paragraph.text_content().unwrap(), "text");

        by_id(&doc, "d").append_child(&paragraph).unwrap();
        let again = by_id(&doc, "p");
        assert_eq!(again.tag(), paragraph.tag());
    }

    #[test]
    fn descendants_follow_a_removed_parent() {
        let doc = document("<body><div id=\"a\"><span id=\"s\">x</span></div></body>");
        let span = by_id(&doc, "s");
        let outer = by_id(&doc, "a");

        outer.remove().unwrap();
        assert!(!span.is_attached());
        assert_eq!(span.text_content().unwrap(), "x");
        span.set_text_content("y").unwrap();

        doc.append_child(&outer).unwrap();
        assert!(span.is_attached());
        assert_eq!(by_id(&doc, "s").text_content().unwrap(), "y");
    }

    #[test]
    fn lookups_reuse_one_placement_per_element() {
        let doc = document("<body><p id=\"p\"></p><div id=\"d\"></div></body>");
        let first = by_id(&doc, "p");
        let second = by_id(&doc, "p");
        assert!(Arc::ptr_eq(&first.placement, &second.placement));
        assert!(Arc::ptr_eq(
            &first.placement,
            &doc.element(first.tag().as_str()).unwrap().placement
        ));

        by_id(&doc, "d").append_child(&first).unwrap();
        assert!(matches!(*lock(&second.placement), Placement::Nested { .. }));

        drop((first, second));
        assert_eq!(doc.placements().len(), 0);
    }

    #[test]
    fn attached_elements_move_within_the_document() {
        let doc = document("<body><div id=\"a\"><span id=\"s\"></span></div><div id=\"b\"></div></body>");
        let span = by_id(&doc, "s");
        by_id(&doc, "b").append_child(&span).unwrap();
        assert!(by_id(&doc, "a").inner_html().unwrap().is_empty());
        assert!(by_id(&doc, "b").inner_html().unwrap().contains(span.tag().as_str()));
    }

    #[test]
    fn class_list_edits_hide_the_identity_tag() {
        let doc = document("<body><p id=\"p\" class=\"a b\"></p></body>");
        let paragraph = by_id(&doc, "p");
        let mut classes = paragraph.class_list().unwrap();
        assert_eq!(classes.iter().collect::<Vec<_>>(), ["a", "b"]);

        assert!(classes.replace("a", "c").unwrap());
        assert!(!classes.toggle("b", None).unwrap());
        assert!(classes.toggle("d", Some(true)).unwrap());
        assert!(classes.add(paragraph.tag().as_str()).is_err());

        let class = paragraph.get_attribute("class").unwrap().unwrap();
        assert_eq!(find_in_classes(&class).as_ref(), Some(paragraph.tag()));
        assert_eq!(class, format!("{} c d", paragraph.tag()));
    }

    #[test]
    fn known_attributes_and_flags() {
        let doc = document("<body><input id=\"i\" type=\"checkbox\"></body>");
        let input = by_id(&doc, "i");
        assert_eq!(
            input.attribute(KnownAttribute::Type).unwrap().as_deref(),
            Some("checkbox")
        );
        assert!(!input.flag(KnownAttribute::Checked).unwrap());
        input.set_flag(KnownAttribute::Checked, true).unwrap();
        assert!(input.flag(KnownAttribute::Checked).unwrap());
        assert!(input.flag(KnownAttribute::Type).is_err());
    }

    #[test]
    fn inner_html_is_tagged_on_write() {
        let doc = document("<body><div id=\"d\"></div></body>");
        let div = by_id(&doc, "d");
        div.set_inner_html("<em>x</em>").unwrap();
        let em = &doc.get_elements_by_tag_name("em").unwrap()[0];
        assert_eq!(em.tag_name().unwrap(), "EM");
        assert_eq!(div.text_content().unwrap(), "x");
    }

    #[test]
    fn element_listeners_use_registry_keys() {
        let doc = document("<body><button id=\"b\">go</button></body>");
        let button = by_id(&doc, "b");
        let function = HostFunction::new("clicked", |_| Ok(()));
        button.add_event_listener("click", &function).unwrap();
        let handler = button.get_attribute("onclick").unwrap().unwrap();
        assert_eq!(handler, format!("bridge(\"{}\")", function.key()));
    }
}
