//! Builds the page the view host renders: the bridge bootstrap, one stub per
//! host function, caller scripts, queued document listeners and CSS, all
//! placed in `<head>` before first render.

use std::collections::HashSet;

use kuchiki::NodeRef;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::document::{ensure_head, new_element, LocalTree};
use crate::identity::{self, IDENTITY_PREFIX};
use crate::outbound::HANDSHAKE;
use crate::registry::HostFunction;

/// Quotes `text` as a JavaScript string literal that is also safe inside an
/// inline `<script>` element.
pub fn js_literal(text: &str) -> String {
    let quoted = serde_json::Value::String(text.to_string()).to_string();
    quoted.replace("</", "<\\/")
}

/// View-side half of the bridge. `__CONFIG__` is replaced with
/// [`BootstrapConfig`] as JSON.
const BOOTSTRAP: &str = r#"(function () {
  "use strict";
  var config = __CONFIG__;
  // Removed nodes wait here, outside the document, until appended again.
  var parking = document.createElement("div");

  function uuid() {
    if (window.crypto && window.crypto.randomUUID) {
      return window.crypto.randomUUID();
    }
    return "xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx".replace(/[xy]/g, function (c) {
      var r = (Math.random() * 16) | 0;
      return (c === "x" ? r : (r & 0x3) | 0x8).toString(16);
    });
  }

  function isTag(name) {
    return name.indexOf(config.prefix) === 0;
  }

  function identify(el) {
    for (var i = 0; i < el.classList.length; i++) {
      if (isTag(el.classList[i])) {
        return el.classList[i];
      }
    }
    var tag = config.prefix + uuid();
    var rest = el.getAttribute("class");
    el.setAttribute("class", rest ? tag + " " + rest : tag);
    return tag;
  }

  function find(tag) {
    var el = document.getElementsByClassName(tag)[0] || parking.getElementsByClassName(tag)[0];
    if (!el) {
      throw { missing: tag };
    }
    return el;
  }

  function container(parent) {
    return parent ? find(parent) : document.body;
  }

  function visible(el) {
    return Array.prototype.filter.call(el.classList, function (c) {
      return !isTag(c);
    });
  }

  function setClasses(el, classes) {
    var tag = identify(el);
    var kept = classes.filter(function (c) {
      return c && !isTag(c);
    });
    el.setAttribute("class", [tag].concat(kept).join(" "));
  }

  // Replacing a placeholder leaves the container's other children untouched.
  function insertHtml(parent, html) {
    var placeholder = document.createElement("span");
    parent.appendChild(placeholder);
    placeholder.outerHTML = html;
  }

  function all(list) {
    return Array.prototype.map.call(list, identify);
  }

  var ops = {
    queryById: function (op) {
      var el = document.getElementById(op.id);
      return el ? identify(el) : null;
    },
    queryByClass: function (op) {
      return all(document.getElementsByClassName(op.name));
    },
    queryByTag: function (op) {
      return all(document.getElementsByTagName(op.name));
    },
    getAttribute: function (op) {
      return find(op.target).getAttribute(op.name);
    },
    setAttribute: function (op) {
      var el = find(op.target);
      if (op.name.toLowerCase() === "class") {
        setClasses(el, op.value.split(/\s+/));
      } else {
        el.setAttribute(op.name, op.value);
      }
    },
    removeAttribute: function (op) {
      var el = find(op.target);
      if (op.name.toLowerCase() === "class") {
        setClasses(el, []);
      } else {
        el.removeAttribute(op.name);
      }
    },
    getProperty: function (op) {
      var value = find(op.target)[op.name];
      if (value === undefined) {
        return null;
      }
      return typeof value === "object" && value !== null ? String(value) : value;
    },
    setProperty: function (op) {
      var el = find(op.target);
      if (op.name === "className") {
        setClasses(el, String(op.value).split(/\s+/));
      } else {
        el[op.name] = op.value;
      }
    },
    getStyle: function (op) {
      var style = find(op.target).style;
      return style.getPropertyValue(op.name) || style[op.name] || "";
    },
    setStyle: function (op) {
      var style = find(op.target).style;
      if (op.name.indexOf("-") === -1 && op.name in style) {
        style[op.name] = op.value;
      } else {
        style.setProperty(op.name, op.value);
      }
    },
    getClassList: function (op) {
      return visible(find(op.target));
    },
    setClassList: function (op) {
      setClasses(find(op.target), op.classes);
    },
    getInnerHtml: function (op) {
      return find(op.target).innerHTML;
    },
    setInnerHtml: function (op) {
      find(op.target).innerHTML = op.html;
    },
    getOuterHtml: function (op) {
      return find(op.target).outerHTML;
    },
    getTextContent: function (op) {
      return find(op.target).textContent;
    },
    setTextContent: function (op) {
      find(op.target).textContent = op.text;
    },
    getTagName: function (op) {
      return find(op.target).tagName;
    },
    appendHtml: function (op) {
      insertHtml(container(op.parent), op.html);
    },
    appendElement: function (op) {
      container(op.parent).appendChild(find(op.child));
    },
    remove: function (op) {
      find(op.target).remove();
    },
    park: function (op) {
      parking.appendChild(find(op.target));
    },
    parkHtml: function (op) {
      insertHtml(parking, op.html);
    },
    isConnected: function (op) {
      return document.documentElement.contains(find(op.target));
    },
    listen: function (op) {
      var target = op.target ? find(op.target) : document;
      target.addEventListener(op.event, function () {
        bridge(op["function"]);
      });
    }
  };

  function dom(op) {
    try {
      var handler = ops[op.op];
      if (!handler) {
        return JSON.stringify({ err: "unknown operation " + op.op });
      }
      var value = handler(op);
      return JSON.stringify({ ok: value === undefined ? null : value });
    } catch (e) {
      if (e && e.missing) {
        return JSON.stringify({ missing: e.missing });
      }
      return JSON.stringify({ err: String(e) });
    }
  }

  function bridge(fn) {
    var params = Array.prototype.slice.call(arguments, 1);
    fetch(config.listenerUrl, {
      method: "POST",
      headers: { "Content-Type": "application/json" },
      body: JSON.stringify({ type: "bridge", function: fn, parameters: params })
    }).catch(function (error) {
      console.error("bridge call failed", error);
    });
  }

  var socket = new WebSocket(config.commandUrl);
  socket.onopen = function () {
    socket.send(config.handshake);
  };
  socket.onmessage = function (event) {
    var frame;
    try {
      frame = JSON.parse(event.data);
    } catch (e) {
      return;
    }
    if (frame.type !== "eval") {
      return;
    }
    var reply = { type: "result", id: frame.id };
    try {
      var result = (0, eval)(frame.javascript);
      reply.result = result === undefined ? "undefined" : String(result);
    } catch (e) {
      reply.error = String(e);
    }
    socket.send(JSON.stringify(reply));
  };
  socket.onclose = function () {
    console.log("bridge command channel closed");
  };

  window.bridge = bridge;
  window.__bridge = { dom: dom, identify: identify, bridge: bridge };
})();
"#;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapConfig<'a> {
    listener_url: &'a str,
    command_url: &'a str,
    prefix: &'a str,
    handshake: &'a str,
}

/// Everything injected into a page before first render. Functions are only
/// referenced by key; registering them is up to the caller.
#[derive(Debug, Clone)]
pub struct Injection {
    listener_url: Url,
    command_url: Url,
    functions: Vec<HostFunction>,
    scripts: Vec<String>,
    listeners: Vec<(String, HostFunction)>,
    css: Option<String>,
    link_resources: bool,
}

impl Injection {
    pub fn new(listener_url: Url, command_url: Url) -> Self {
        Self {
            listener_url,
            command_url,
            functions: Vec::new(),
            scripts: Vec::new(),
            listeners: Vec::new(),
            css: None,
            link_resources: false,
        }
    }

    /// Host functions exposed to page script under their own names.
    pub fn with_functions(mut self, functions: impl IntoIterator<Item = HostFunction>) -> Self {
        self.functions.extend(functions);
        self
    }

    /// Raw script fragments appended after the bootstrap.
    pub fn with_scripts(mut self, scripts: impl IntoIterator<Item = String>) -> Self {
        self.scripts.extend(scripts);
        self
    }

    /// Document listeners queued before the page existed.
    pub fn with_listeners(
        mut self,
        listeners: impl IntoIterator<Item = (String, HostFunction)>,
    ) -> Self {
        self.listeners.extend(listeners);
        self
    }

    pub fn with_css(mut self, css: Option<String>) -> Self {
        self.css = css;
        self
    }

    /// Adds a `<base>` pointing at the inbound server so relative URLs load
    /// through its static route.
    pub fn link_resources(mut self, link: bool) -> Self {
        self.link_resources = link;
        self
    }

    /// Source of the single `<script>` placed in `<head>`.
    pub fn script(&self) -> String {
        let config = BootstrapConfig {
            listener_url: self.listener_url.as_str(),
            command_url: self.command_url.as_str(),
            prefix: IDENTITY_PREFIX,
            handshake: HANDSHAKE,
        };
        let config = serde_json::to_string(&config)
            .unwrap_or_else(|_| String::from("{}"))
            .replace("</", "<\\/");
        let mut script = BOOTSTRAP.replacen("__CONFIG__", &config, 1);

        let mut stubbed = HashSet::new();
        for function in &self.functions {
            let key = function.key();
            if !stubbed.insert(key.clone()) {
                continue;
            }
            if !is_identifier(function.name()) {
                warn!(
                    target: "injector",
                    name = function.name(),
                    "function name is not a valid script identifier; no stub generated"
                );
                continue;
            }
            script.push_str(&format!(
                "function {}() {{ bridge.apply(null, [{}].concat(Array.prototype.slice.call(arguments))); }}\n",
                function.name(),
                js_literal(&key)
            ));
        }

        for fragment in &self.scripts {
            script.push_str(fragment);
            script.push('\n');
        }

        for (event, function) in &self.listeners {
            let key = function.key();
            script.push_str(&format!(
                "document.addEventListener({}, function () {{ bridge({}); }});\n",
                js_literal(event),
                js_literal(&key)
            ));
        }

        script
    }

    /// Returns `markup` with the bridge injected and every element tagged.
    pub fn apply(&self, markup: &str) -> String {
        let tree = LocalTree::parse_document(markup);
        let head = ensure_head(tree.root());

        if let Some(css) = &self.css {
            let style = new_element("style");
            style.append(NodeRef::new_text(css.as_str()));
            head.append(style);
        }

        // Bootstrap runs before any page script in <head>.
        let script = new_element("script");
        script.append(NodeRef::new_text(self.script()));
        head.prepend(script);

        if self.link_resources {
            let base = new_element("base");
            if let Some(element) = base.as_element() {
                element
                    .attributes
                    .borrow_mut()
                    .insert("href", self.listener_url.to_string());
            }
            head.prepend(base);
        }

        let tagged = identity::tag_subtree(tree.root());
        debug!(target: "injector", elements = tagged, "page assembled");
        tree.serialize()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    starts && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use kuchiki::traits::*;

    use super::*;
    use crate::identity::find_in_classes;

    fn injection() -> Injection {
        Injection::new(
            Url::parse("http://127.0.0.1:22943/").unwrap(),
            Url::parse("ws://127.0.0.1:22944/").unwrap(),
        )
    }

    #[test]
    fn literals_cannot_close_the_script_element() {
        assert_eq!(js_literal("a\"b"), r#""a\"b""#);
        assert_eq!(js_literal("</script>"), r#""<\/script>""#);
    }

    #[test]
    fn stubs_call_bridge_with_the_function_key() {
        let greet = HostFunction::new("greet", |_| Ok(()));
        let script = injection().with_functions([greet.clone()]).script();
        assert!(script.contains("function greet()"));
        assert!(script.contains(&format!("[\"{}\"]", greet.key())));
    }

    #[test]
    fn invalid_names_get_no_stub() {
        let odd = HostFunction::new("not valid", |_| Ok(()));
        let script = injection().with_functions([odd]).script();
        assert!(!script.contains("function not valid"));
    }

    #[test]
    fn functions_passed_twice_get_one_stub() {
        let greet = HostFunction::new("greet", |_| Ok(()));
        let other = HostFunction::new("greet", |_| Ok(()));
        let script = injection()
            .with_functions([greet.clone(), greet.clone(), other.clone()])
            .script();
        assert_eq!(script.matches(&greet.key()).count(), 1);
        assert_eq!(script.matches(&other.key()).count(), 1);
    }

    #[test]
    fn bootstrap_carries_the_channel_urls() {
        let script = injection().script();
        assert!(script.contains("\"listenerUrl\":\"http://127.0.0.1:22943/\""));
        assert!(script.contains("\"commandUrl\":\"ws://127.0.0.1:22944/\""));
        assert!(script.contains("\"handshake\":\"connect\""));
        assert!(!script.contains("__CONFIG__"));
    }

    #[test]
    fn queued_listeners_are_wired_in_the_bootstrap() {
        let resize = HostFunction::new("resized", |_| Ok(()));
        let script = injection()
            .with_listeners([("resize".to_string(), resize.clone())])
            .script();
        assert!(script.contains(&format!(
            "document.addEventListener(\"resize\", function () {{ bridge(\"{}\"); }});",
            resize.key()
        )));
    }

    #[test]
    fn apply_creates_head_and_tags_everything() {
        let page = injection()
            .with_css(Some("p { color: red; }".into()))
            .link_resources(true)
            .apply("<p>hello</p>");

        let document = kuchiki::parse_html().one(page.as_str());
        let head = document.select_first("head").unwrap();
        let first = head.as_node().first_child().unwrap();
        let base = first.as_element().unwrap();
        assert_eq!(&*base.name.local, "base");
        assert_eq!(
            base.attributes.borrow().get("href"),
            Some("http://127.0.0.1:22943/")
        );
        assert!(document.select_first("head > script").is_ok());
        assert!(document.select_first("head > style").is_ok());

        for element in document.descendants().elements() {
            let classes = element.attributes.borrow().get("class").map(str::to_string);
            assert!(
                classes.as_deref().and_then(find_in_classes).is_some(),
                "{} is untagged",
                &*element.name.local
            );
        }
    }

    #[test]
    fn apply_keeps_existing_tags() {
        let registry = crate::registry::CallRegistry::new();
        let markup = crate::document::Document::parse("<p id=\"x\">a</p>", registry).markup();
        let before = kuchiki::parse_html().one(markup.as_str());
        let tag = before
            .select_first("#x")
            .unwrap()
            .attributes
            .borrow()
            .get("class")
            .map(str::to_string)
            .unwrap();
        let page = injection().apply(&markup);
        assert!(page.contains(&tag));
    }
}
