//! Static table of the common HTML attributes and the DOM properties that
//! reflect them.

use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Reflected as a string property.
    Text,
    /// Present/absent attribute reflected as a boolean property.
    Boolean,
}

macro_rules! known_attributes {
    ($($variant:ident => $attribute:literal, $property:literal, $kind:ident;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum KnownAttribute {
            $($variant,)*
        }

        impl KnownAttribute {
            pub const ALL: &'static [KnownAttribute] = &[$(KnownAttribute::$variant,)*];

            /// Name used in markup, e.g. `for`.
            pub fn attribute_name(self) -> &'static str {
                match self {
                    $(KnownAttribute::$variant => $attribute,)*
                }
            }

            /// Name of the reflecting DOM property, e.g. `htmlFor`.
            pub fn property_name(self) -> &'static str {
                match self {
                    $(KnownAttribute::$variant => $property,)*
                }
            }

            pub fn kind(self) -> AttributeKind {
                match self {
                    $(KnownAttribute::$variant => AttributeKind::$kind,)*
                }
            }
        }
    };
}

known_attributes! {
    Accept => "accept", "accept", Text;
    Action => "action", "action", Text;
    Alt => "alt", "alt", Text;
    Autocomplete => "autocomplete", "autocomplete", Text;
    Autofocus => "autofocus", "autofocus", Boolean;
    Autoplay => "autoplay", "autoplay", Boolean;
    Charset => "charset", "charset", Text;
    Checked => "checked", "checked", Boolean;
    Cite => "cite", "cite", Text;
    Class => "class", "className", Text;
    Cols => "cols", "cols", Text;
    Colspan => "colspan", "colSpan", Text;
    Content => "content", "content", Text;
    ContentEditable => "contenteditable", "contentEditable", Text;
    Controls => "controls", "controls", Boolean;
    CrossOrigin => "crossorigin", "crossOrigin", Text;
    Datetime => "datetime", "dateTime", Text;
    Default => "default", "default", Boolean;
    Defer => "defer", "defer", Boolean;
    Dir => "dir", "dir", Text;
    Disabled => "disabled", "disabled", Boolean;
    Download => "download", "download", Text;
    Draggable => "draggable", "draggable", Text;
    Enctype => "enctype", "enctype", Text;
    For => "for", "htmlFor", Text;
    Form => "form", "form", Text;
    Headers => "headers", "headers", Text;
    Height => "height", "height", Text;
    Hidden => "hidden", "hidden", Boolean;
    High => "high", "high", Text;
    Href => "href", "href", Text;
    Hreflang => "hreflang", "hreflang", Text;
    HttpEquiv => "http-equiv", "httpEquiv", Text;
    Id => "id", "id", Text;
    InputMode => "inputmode", "inputMode", Text;
    Label => "label", "label", Text;
    Lang => "lang", "lang", Text;
    List => "list", "list", Text;
    Loop => "loop", "loop", Boolean;
    Low => "low", "low", Text;
    Max => "max", "max", Text;
    MaxLength => "maxlength", "maxLength", Text;
    Media => "media", "media", Text;
    Method => "method", "method", Text;
    Min => "min", "min", Text;
    MinLength => "minlength", "minLength", Text;
    Multiple => "multiple", "multiple", Boolean;
    Muted => "muted", "muted", Boolean;
    Name => "name", "name", Text;
    NoValidate => "novalidate", "noValidate", Boolean;
    Open => "open", "open", Boolean;
    Optimum => "optimum", "optimum", Text;
    Pattern => "pattern", "pattern", Text;
    Placeholder => "placeholder", "placeholder", Text;
    Poster => "poster", "poster", Text;
    Preload => "preload", "preload", Text;
    ReadOnly => "readonly", "readOnly", Boolean;
    Rel => "rel", "rel", Text;
    Required => "required", "required", Boolean;
    Reversed => "reversed", "reversed", Boolean;
    Rows => "rows", "rows", Text;
    Rowspan => "rowspan", "rowSpan", Text;
    Sandbox => "sandbox", "sandbox", Text;
    Scope => "scope", "scope", Text;
    Selected => "selected", "selected", Boolean;
    Size => "size", "size", Text;
    Sizes => "sizes", "sizes", Text;
    Span => "span", "span", Text;
    Spellcheck => "spellcheck", "spellcheck", Text;
    Src => "src", "src", Text;
    Srcdoc => "srcdoc", "srcdoc", Text;
    Srclang => "srclang", "srclang", Text;
    Srcset => "srcset", "srcset", Text;
    Start => "start", "start", Text;
    Step => "step", "step", Text;
    Style => "style", "style", Text;
    TabIndex => "tabindex", "tabIndex", Text;
    Target => "target", "target", Text;
    Title => "title", "title", Text;
    Translate => "translate", "translate", Text;
    Type => "type", "type", Text;
    UseMap => "usemap", "useMap", Text;
    Value => "value", "value", Text;
    Width => "width", "width", Text;
    Wrap => "wrap", "wrap", Text;
}

impl KnownAttribute {
    /// Looks up an attribute by markup name (case-insensitive) or property name.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|known| {
            known.attribute_name().eq_ignore_ascii_case(name) || known.property_name() == name
        })
    }

    pub fn is_boolean(self) -> bool {
        self.kind() == AttributeKind::Boolean
    }
}

impl fmt::Display for KnownAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.attribute_name())
    }
}

impl FromStr for KnownAttribute {
    type Err = BridgeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::lookup(name).ok_or_else(|| {
            BridgeError::precondition(format!("{name:?} is not a known HTML attribute"))
        })
    }
}

/// Markup attribute reflected by the DOM property `property`.
pub fn attribute_for_property(property: &str) -> String {
    KnownAttribute::lookup(property)
        .map(|known| known.attribute_name().to_string())
        .unwrap_or_else(|| property.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_accepts_markup_and_property_names() {
        assert_eq!(KnownAttribute::lookup("for"), Some(KnownAttribute::For));
        assert_eq!(KnownAttribute::lookup("htmlFor"), Some(KnownAttribute::For));
        assert_eq!(KnownAttribute::lookup("READONLY"), Some(KnownAttribute::ReadOnly));
        assert_eq!(KnownAttribute::lookup("frobnicate"), None);
    }

    #[test]
    fn property_names_map_back_to_attributes() {
        assert_eq!(attribute_for_property("className"), "class");
        assert_eq!(attribute_for_property("tabIndex"), "tabindex");
        assert_eq!(attribute_for_property("data-role"), "data-role");
    }

    #[test]
    fn table_has_no_duplicate_names() {
        let mut names: Vec<_> = KnownAttribute::ALL
            .iter()
            .map(|known| known.attribute_name())
            .collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn boolean_attributes_are_flagged() {
        assert!(KnownAttribute::Checked.is_boolean());
        assert!(!KnownAttribute::Value.is_boolean());
        assert!("disabled".parse::<KnownAttribute>().unwrap().is_boolean());
        assert!("nope".parse::<KnownAttribute>().is_err());
    }
}
