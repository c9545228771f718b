//! Identity tags let host-side handles refer to DOM nodes on both sides of the
//! bridge. A tag is a class name (`BridgeID_<uuid>`) stored as the first entry
//! of the element's class list, so the view can re-locate any element with
//! `getElementsByClassName` whether or not it existed at first render.

use std::fmt;

use kuchiki::iter::NodeIterator;
use kuchiki::{ElementData, NodeRef};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BridgeError;

pub const IDENTITY_PREFIX: &str = "BridgeID_";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityTag(String);

impl IdentityTag {
    pub fn generate() -> Self {
        Self(format!("{IDENTITY_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let trimmed = raw.trim();
        let valid = trimmed
            .strip_prefix(IDENTITY_PREFIX)
            .is_some_and(|rest| Uuid::parse_str(rest).is_ok());
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(BridgeError::InvalidIdentity(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdentityTag {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdentityTag> for String {
    fn from(tag: IdentityTag) -> Self {
        tag.0
    }
}

/// First identity tag found in a whitespace separated class attribute.
pub fn find_in_classes(classes: &str) -> Option<IdentityTag> {
    classes
        .split_ascii_whitespace()
        .find_map(|class| IdentityTag::parse(class).ok())
}

/// Class names with every identity tag removed.
pub fn visible_classes(classes: &str) -> Vec<String> {
    classes
        .split_ascii_whitespace()
        .filter(|class| IdentityTag::parse(class).is_err())
        .map(str::to_string)
        .collect()
}

/// Class attribute value with `tag` in front of `classes`.
pub fn class_attribute(tag: &IdentityTag, classes: &[String]) -> String {
    std::iter::once(tag.as_str())
        .chain(
            classes
                .iter()
                .map(String::as_str)
                .filter(|class| IdentityTag::parse(class).is_err()),
        )
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns the element's identity tag, assigning a fresh one if it has none.
pub fn tag_element(element: &ElementData) -> IdentityTag {
    let mut attributes = element.attributes.borrow_mut();
    let existing = attributes.get("class").map(str::to_string);
    if let Some(tag) = existing.as_deref().and_then(find_in_classes) {
        return tag;
    }

    let tag = IdentityTag::generate();
    let value = match existing.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(classes) => format!("{tag} {classes}"),
        None => tag.to_string(),
    };
    attributes.insert("class", value);
    tag
}

/// Replaces any identity tag the element carries with a fresh one.
pub fn retag_element(element: &ElementData) -> IdentityTag {
    {
        let mut attributes = element.attributes.borrow_mut();
        let visible = attributes.get("class").map(visible_classes);
        match visible {
            Some(classes) if !classes.is_empty() => {
                attributes.insert("class", classes.join(" "));
            }
            Some(_) => {
                attributes.remove("class");
            }
            None => {}
        }
    }
    tag_element(element)
}

/// Tags every element under (and including) `node` that is not tagged yet.
/// Returns the number of elements visited.
pub fn tag_subtree(node: &NodeRef) -> usize {
    let mut visited = 0;
    for element in node.inclusive_descendants().elements() {
        tag_element(&element);
        visited += 1;
    }
    visited
}

/// Gives every element under `node` a fresh tag, discarding copied ones.
pub fn retag_subtree(node: &NodeRef) -> usize {
    let mut visited = 0;
    for element in node.inclusive_descendants().elements() {
        retag_element(&element);
        visited += 1;
    }
    visited
}
