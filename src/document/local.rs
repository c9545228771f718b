//! Applies [`DomOp`]s to a locally parsed tree. Used for the document while
//! it is being assembled and for elements that are not attached yet.

use html5ever::{local_name, namespace_url, ns, LocalName, QualName};
use kuchiki::traits::*;
use kuchiki::{ElementData, NodeDataRef, NodeRef};
use serde_json::Value;

use super::attributes::{attribute_for_property, KnownAttribute};
use super::ops::DomOp;
use crate::error::{BridgeError, BridgeResult};
use crate::identity::{self, class_attribute, find_in_classes, visible_classes, IdentityTag};

/// Holder for parked nodes: removed from the document but still reachable
/// by tag.
const PARKING: &str = "bridge-parking";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeKind {
    Document,
    Fragment,
}

pub struct LocalTree {
    root: NodeRef,
    kind: TreeKind,
    changed: bool,
}

impl LocalTree {
    pub fn parse_document(markup: &str) -> Self {
        Self {
            root: kuchiki::parse_html().one(markup),
            kind: TreeKind::Document,
            changed: false,
        }
    }

    /// Parses markup as a fragment. The `template` context accepts any
    /// element, including table parts such as `<tr>`.
    pub fn parse_fragment(markup: &str) -> Self {
        Self {
            root: parse_fragment_nodes(markup),
            kind: TreeKind::Fragment,
            changed: false,
        }
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// Identity tags of every element in the tree, in document order.
    pub fn tags(&self) -> Vec<IdentityTag> {
        self.root
            .descendants()
            .elements()
            .filter_map(|element| {
                element
                    .attributes
                    .borrow()
                    .get("class")
                    .and_then(find_in_classes)
            })
            .collect()
    }

    /// Whether an applied operation modified the tree.
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn serialize(&self) -> String {
        match self.kind {
            TreeKind::Document => self.root.to_string(),
            TreeKind::Fragment => self.root.children().map(|child| child.to_string()).collect(),
        }
    }

    pub fn apply(&mut self, op: &DomOp) -> BridgeResult<Value> {
        if op.is_mutation() {
            self.changed = true;
        }

        match op {
            DomOp::QueryById { id } => {
                let found = self
                    .root
                    .descendants()
                    .elements()
                    .filter(|element| !is_parked(element.as_node()))
                    .find(|element| element.attributes.borrow().get("id") == Some(id.as_str()));
                Ok(found
                    .map(|element| Value::String(self.identify(&element).into()))
                    .unwrap_or(Value::Null))
            }
            DomOp::QueryByClass { name } => {
                let matches: Vec<_> = self
                    .root
                    .descendants()
                    .elements()
                    .filter(|element| !is_parked(element.as_node()))
                    .filter(|element| has_class(element, name))
                    .collect();
                Ok(self.identify_all(matches))
            }
            DomOp::QueryByTag { name } => {
                let matches: Vec<_> = self
                    .root
                    .descendants()
                    .elements()
                    .filter(|element| !is_parked(element.as_node()))
                    .filter(|element| {
                        name == "*" || element.name.local.as_ref().eq_ignore_ascii_case(name)
                    })
                    .collect();
                Ok(self.identify_all(matches))
            }
            DomOp::GetAttribute { target, name } => {
                let node = self.find(target)?;
                let value = node
                    .attributes
                    .borrow()
                    .get(name.to_ascii_lowercase().as_str())
                    .map(str::to_string);
                Ok(value.map(Value::String).unwrap_or(Value::Null))
            }
            DomOp::SetAttribute {
                target,
                name,
                value,
            } => {
                let node = self.find(target)?;
                set_attribute(&node, target, name, value);
                Ok(Value::Null)
            }
            DomOp::RemoveAttribute { target, name } => {
                let node = self.find(target)?;
                if name.eq_ignore_ascii_case("class") {
                    set_classes(&node, target, &[]);
                } else {
                    node.attributes
                        .borrow_mut()
                        .remove(name.to_ascii_lowercase().as_str());
                }
                Ok(Value::Null)
            }
            DomOp::GetProperty { target, name } => {
                let node = self.find(target)?;
                Ok(read_property(&node, name))
            }
            DomOp::SetProperty {
                target,
                name,
                value,
            } => {
                let node = self.find(target)?;
                self.write_property(&node, target, name, value)?;
                Ok(Value::Null)
            }
            DomOp::GetStyle { target, name } => {
                let node = self.find(target)?;
                let style = node
                    .attributes
                    .borrow()
                    .get("style")
                    .map(str::to_string)
                    .unwrap_or_default();
                let value = parse_style(&style)
                    .into_iter()
                    .find(|(property, _)| property.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
                    .unwrap_or_default();
                Ok(Value::String(value))
            }
            DomOp::SetStyle {
                target,
                name,
                value,
            } => {
                let node = self.find(target)?;
                set_style(&node, name, value);
                Ok(Value::Null)
            }
            DomOp::GetClassList { target } => {
                let node = self.find(target)?;
                let classes = node
                    .attributes
                    .borrow()
                    .get("class")
                    .map(visible_classes)
                    .unwrap_or_default();
                Ok(Value::from(classes))
            }
            DomOp::SetClassList { target, classes } => {
                let node = self.find(target)?;
                set_classes(&node, target, classes);
                Ok(Value::Null)
            }
            DomOp::GetInnerHtml { target } => {
                let node = self.find(target)?;
                Ok(Value::String(inner_html(node.as_node())))
            }
            DomOp::SetInnerHtml { target, html } => {
                let node = self.find(target)?;
                clear_children(node.as_node());
                append_markup(node.as_node(), html);
                Ok(Value::Null)
            }
            DomOp::GetOuterHtml { target } => {
                let node = self.find(target)?;
                Ok(Value::String(node.as_node().to_string()))
            }
            DomOp::GetTextContent { target } => {
                let node = self.find(target)?;
                Ok(Value::String(node.as_node().text_contents()))
            }
            DomOp::SetTextContent { target, text } => {
                let node = self.find(target)?;
                clear_children(node.as_node());
                if !text.is_empty() {
                    node.as_node().append(NodeRef::new_text(text.as_str()));
                }
                Ok(Value::Null)
            }
            DomOp::GetTagName { target } => {
                let node = self.find(target)?;
                Ok(Value::String(tag_name(&node)))
            }
            DomOp::AppendHtml { parent, html } => {
                let container = self.container(parent.as_ref())?;
                append_markup(&container, html);
                Ok(Value::Null)
            }
            DomOp::AppendElement { parent, child } => {
                let container = self.container(parent.as_ref())?;
                let child_node = self.find(child)?.as_node().clone();
                if container
                    .inclusive_ancestors()
                    .any(|ancestor| ancestor == child_node)
                {
                    return Err(BridgeError::precondition(
                        "an element cannot be appended to itself or its descendants",
                    ));
                }
                child_node.detach();
                container.append(child_node);
                Ok(Value::Null)
            }
            DomOp::Remove { target } => {
                self.find(target)?.as_node().detach();
                Ok(Value::Null)
            }
            DomOp::Park { target } => {
                let node = self.find(target)?.as_node().clone();
                let parking = self.parking()?;
                node.detach();
                parking.append(node);
                Ok(Value::Null)
            }
            DomOp::ParkHtml { html } => {
                append_markup(&self.parking()?, html);
                Ok(Value::Null)
            }
            DomOp::IsConnected { target } => {
                let node = self.find(target)?;
                let connected = self.kind == TreeKind::Document && !is_parked(node.as_node());
                Ok(Value::Bool(connected))
            }
            DomOp::Listen {
                target,
                event,
                function,
            } => {
                self.listen(target.as_ref(), event, function)?;
                Ok(Value::Null)
            }
        }
    }

    pub fn find(&self, tag: &IdentityTag) -> BridgeResult<NodeDataRef<ElementData>> {
        self.root
            .descendants()
            .elements()
            .find(|element| has_class(element, tag.as_str()))
            .ok_or_else(|| BridgeError::ElementMissing(tag.to_string()))
    }

    fn container(&self, parent: Option<&IdentityTag>) -> BridgeResult<NodeRef> {
        match (parent, self.kind) {
            (Some(tag), _) => self.find(tag).map(|element| element.as_node().clone()),
            (None, TreeKind::Fragment) => Ok(self.root.clone()),
            (None, TreeKind::Document) => self
                .root
                .select_first("body")
                .map(|body| body.as_node().clone())
                .map_err(|_| BridgeError::precondition("document has no body")),
        }
    }

    fn parking(&self) -> BridgeResult<NodeRef> {
        let existing = self
            .root
            .descendants()
            .elements()
            .find(|element| &*element.name.local == PARKING);
        if let Some(parking) = existing {
            return Ok(parking.as_node().clone());
        }
        let parking = new_element(PARKING);
        if let Some(element) = parking.as_element() {
            element.attributes.borrow_mut().insert("hidden", String::new());
        }
        self.container(None)?.append(parking.clone());
        Ok(parking)
    }

    fn identify(&mut self, element: &ElementData) -> IdentityTag {
        let existing = element
            .attributes
            .borrow()
            .get("class")
            .and_then(find_in_classes);
        existing.unwrap_or_else(|| {
            self.changed = true;
            identity::tag_element(element)
        })
    }

    fn identify_all(&mut self, elements: Vec<NodeDataRef<ElementData>>) -> Value {
        let tags: Vec<String> = elements
            .iter()
            .map(|element| self.identify(element).into())
            .collect();
        Value::from(tags)
    }

    fn write_property(
        &mut self,
        node: &NodeDataRef<ElementData>,
        target: &IdentityTag,
        name: &str,
        value: &Value,
    ) -> BridgeResult<()> {
        let text = match value {
            Value::String(text) => Some(text.clone()),
            Value::Bool(true) => Some(String::new()),
            Value::Bool(false) | Value::Null => None,
            other => Some(other.to_string()),
        };

        match name {
            "innerHTML" => {
                clear_children(node.as_node());
                append_markup(node.as_node(), text.as_deref().unwrap_or_default());
            }
            "textContent" | "innerText" => {
                clear_children(node.as_node());
                if let Some(text) = text.filter(|text| !text.is_empty()) {
                    node.as_node().append(NodeRef::new_text(text));
                }
            }
            "tagName" | "nodeName" | "outerHTML" => {
                return Err(BridgeError::precondition(format!(
                    "property {name} cannot be set on a local element"
                )));
            }
            _ => {
                let attribute = attribute_for_property(name);
                match text {
                    Some(text) => set_attribute(node, target, &attribute, &text),
                    None => {
                        node.attributes
                            .borrow_mut()
                            .remove(attribute.as_str());
                    }
                }
            }
        }
        Ok(())
    }

    fn listen(
        &mut self,
        target: Option<&IdentityTag>,
        event: &str,
        function: &str,
    ) -> BridgeResult<()> {
        let call = format!("bridge({})", crate::injector::js_literal(function));
        match target {
            Some(tag) => {
                let node = self.find(tag)?;
                let attribute = format!("on{}", event.to_ascii_lowercase());
                let mut attributes = node.attributes.borrow_mut();
                let handler = match attributes.get(attribute.as_str()) {
                    Some(existing) if !existing.trim().is_empty() => {
                        format!("{}; {call}", existing.trim_end().trim_end_matches(';'))
                    }
                    _ => call,
                };
                attributes.insert(attribute.as_str(), handler);
                Ok(())
            }
            None if self.kind == TreeKind::Document => {
                let source = format!(
                    "document.addEventListener({}, function () {{ {call}; }});",
                    crate::injector::js_literal(event)
                );
                let script = new_element("script");
                script.append(NodeRef::new_text(source));
                identity::tag_subtree(&script);
                ensure_head(&self.root).append(script);
                Ok(())
            }
            None => Err(BridgeError::precondition(
                "document listeners need a document, not a detached element",
            )),
        }
    }
}

pub(crate) fn new_element(name: &str) -> NodeRef {
    NodeRef::new_element(
        QualName::new(None, ns!(html), LocalName::from(name)),
        Vec::<(kuchiki::ExpandedName, kuchiki::Attribute)>::new(),
    )
}

/// Returns the document's `<head>`, creating one if missing.
pub(crate) fn ensure_head(document: &NodeRef) -> NodeRef {
    if let Ok(head) = document.select_first("head") {
        return head.as_node().clone();
    }
    let head = new_element("head");
    match document.select_first("html") {
        Ok(html) => html.as_node().prepend(head.clone()),
        Err(()) => document.prepend(head.clone()),
    }
    head
}

/// Serializes `html` with every element given a fresh identity tag, so copied
/// markup never duplicates a tag already in use.
pub(crate) fn tag_markup(html: &str) -> String {
    let tree = LocalTree::parse_fragment(html);
    for child in tree.root().children() {
        identity::retag_subtree(&child);
    }
    tree.serialize()
}

fn parse_fragment_nodes(markup: &str) -> NodeRef {
    let context = QualName::new(None, ns!(html), local_name!("template"));
    let document = kuchiki::parse_fragment(context, Vec::new()).one(markup);
    // html5ever places fragment nodes under a synthetic <html> root.
    document
        .first_child()
        .filter(|child| child.as_element().is_some())
        .unwrap_or(document)
}

fn append_markup(container: &NodeRef, markup: &str) {
    let fragment = parse_fragment_nodes(markup);
    let nodes: Vec<NodeRef> = fragment.children().collect();
    for node in nodes {
        node.detach();
        identity::tag_subtree(&node);
        container.append(node);
    }
}

fn is_parked(node: &NodeRef) -> bool {
    node.inclusive_ancestors().any(|ancestor| {
        ancestor
            .as_element()
            .is_some_and(|element| &*element.name.local == PARKING)
    })
}

fn clear_children(node: &NodeRef) {
    let children: Vec<NodeRef> = node.children().collect();
    for child in children {
        child.detach();
    }
}

fn inner_html(node: &NodeRef) -> String {
    node.children().map(|child| child.to_string()).collect()
}

fn tag_name(element: &ElementData) -> String {
    element.name.local.as_ref().to_ascii_uppercase()
}

fn has_class(element: &ElementData, name: &str) -> bool {
    element
        .attributes
        .borrow()
        .get("class")
        .is_some_and(|classes| classes.split_ascii_whitespace().any(|class| class == name))
}

fn set_classes(element: &ElementData, tag: &IdentityTag, classes: &[String]) {
    element
        .attributes
        .borrow_mut()
        .insert("class", class_attribute(tag, classes));
}

fn set_attribute(element: &ElementData, tag: &IdentityTag, name: &str, value: &str) {
    let name = name.to_ascii_lowercase();
    if name == "class" {
        // The identity tag always stays first.
        let classes = visible_classes(value);
        set_classes(element, tag, &classes);
    } else {
        element
            .attributes
            .borrow_mut()
            .insert(name.as_str(), value.to_string());
    }
}

fn read_property(element: &NodeDataRef<ElementData>, name: &str) -> Value {
    let node = element.as_node();
    match name {
        "innerHTML" => return Value::String(inner_html(node)),
        "outerHTML" => return Value::String(node.to_string()),
        "textContent" | "innerText" => return Value::String(node.text_contents()),
        "tagName" | "nodeName" => return Value::String(tag_name(element)),
        _ => {}
    }

    let attribute = attribute_for_property(name);
    let attributes = element.attributes.borrow();
    let value = attributes.get(attribute.as_str());
    match KnownAttribute::lookup(name) {
        Some(known) if known.is_boolean() => Value::String(value.is_some().to_string()),
        _ => value
            .map(|value| Value::String(value.to_string()))
            .unwrap_or(Value::Null),
    }
}

fn parse_style(style: &str) -> Vec<(String, String)> {
    style
        .split(';')
        .filter_map(|declaration| {
            let (property, value) = declaration.split_once(':')?;
            let property = property.trim();
            if property.is_empty() {
                return None;
            }
            Some((property.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn set_style(element: &ElementData, name: &str, value: &str) {
    let mut attributes = element.attributes.borrow_mut();
    let mut declarations = parse_style(attributes.get("style").unwrap_or_default());
    declarations.retain(|(property, _)| !property.eq_ignore_ascii_case(name));
    if !value.is_empty() {
        declarations.push((name.to_string(), value.to_string()));
    }

    if declarations.is_empty() {
        attributes.remove("style");
    } else {
        let style = declarations
            .iter()
            .map(|(property, value)| format!("{property}: {value};"))
            .collect::<Vec<_>>()
            .join(" ");
        attributes.insert("style", style);
    }
}
