mod support;

use std::sync::Arc;

use kuchiki::traits::TendrilSink;
use support::FakeView;
use webbridge::document::{decode_reply, DomOp};
use webbridge::identity;
use webbridge::{BridgeError, CallRegistry, Document, HostFunction, KnownAttribute};

const PAGE: &str = r#"<html><head><title>t</title></head><body>
<div id="main" class="panel"><p id="greeting">hi</p></div>
<ul id="list"><li>one</li></ul>
</body></html>"#;

fn assembling() -> Document {
    Document::parse(PAGE, CallRegistry::new())
}

/// A running document whose view is an in-process `FakeView`.
fn live() -> (Document, Arc<FakeView>) {
    let document = assembling();
    let view = Arc::new(FakeView::new(&document.markup()));
    document.go_live(view.clone()).unwrap();
    (document, view)
}

fn parse_outer(html: &str) -> kuchiki::NodeRef {
    kuchiki::parse_html().one(html)
}

#[test]
fn missing_ids_are_none_in_both_modes() {
    assert!(assembling().get_element_by_id("nope").unwrap().is_none());

    let (document, _view) = live();
    assert!(document.get_element_by_id("nope").unwrap().is_none());
}

#[test]
fn created_element_is_appended_exactly_once() {
    let document = assembling();
    let before = document.get_elements_by_tag_name("div").unwrap().len();

    let element = document.create_element("div").unwrap();
    assert!(!element.is_attached());
    document.append_child(&element).unwrap();
    assert!(element.is_attached());

    let divs = document.get_elements_by_tag_name("div").unwrap();
    assert_eq!(divs.len(), before + 1);
    assert_eq!(divs.iter().filter(|div| **div == element).count(), 1);

    let outer = element.outer_html().unwrap();
    let parsed = parse_outer(&outer);
    let node = parsed.select_first("div").unwrap();
    let classes = node.attributes.borrow().get("class").unwrap_or_default().to_string();
    assert_eq!(identity::find_in_classes(&classes).as_ref(), Some(element.tag()));
    assert!(classes.starts_with(identity::IDENTITY_PREFIX));
}

#[test]
fn live_lookups_resolve_through_the_view() {
    let (document, view) = live();

    let main = document.get_element_by_id("main").unwrap().expect("main exists");
    let script = DomOp::GetTagName {
        target: main.tag().clone(),
    }
    .to_script()
    .unwrap();
    let reply = decode_reply(&document.evaluate(&script).unwrap()).unwrap();
    assert_eq!(reply, "DIV");
    assert_eq!(main.tag_name().unwrap(), "DIV");
    assert!(view.ops().contains(&String::from("queryById")));
}

#[test]
fn live_append_uses_append_html() {
    let (document, view) = live();
    let list = document.get_element_by_id("list").unwrap().unwrap();

    list.append("<li>two</li>").unwrap();

    let ops = view.ops();
    assert!(ops.contains(&String::from("appendHtml")));
    assert!(!ops.contains(&String::from("setInnerHtml")));
    assert_eq!(document.get_elements_by_tag_name("li").unwrap().len(), 2);
    assert!(view.markup().contains("two</li>"));
}

#[test]
fn live_writes_reach_the_view_not_the_snapshot() {
    let (document, view) = live();
    let greeting = document.get_element_by_id("greeting").unwrap().unwrap();

    greeting.set_text_content("Hello Ada").unwrap();

    assert_eq!(greeting.text_content().unwrap(), "Hello Ada");
    assert!(view.markup().contains("Hello Ada"));
    assert!(!document.markup().contains("Hello Ada"));
}

#[test]
fn detached_elements_built_up_then_attached_live() {
    let (document, view) = live();
    let card = document.create_element("section").unwrap();
    card.set_attribute("data-kind", "card").unwrap();
    card.class_list().unwrap().add("card").unwrap();
    let title = document.create_element("h2").unwrap();
    title.set_text_content("Title").unwrap();
    card.append_child(&title).unwrap();

    // Nothing has reached the view yet.
    assert!(view.ops().iter().all(|op| op != "appendHtml"));

    document.append_child(&card).unwrap();
    assert!(card.is_attached());
    assert!(title.is_attached());
    assert_eq!(title.text_content().unwrap(), "Title");
    assert_eq!(card.get_attribute("data-kind").unwrap().as_deref(), Some("card"));
    assert!(card.class_list().unwrap().contains("card"));

    let markup = view.markup();
    assert!(markup.contains("data-kind=\"card\""));
    assert!(markup.contains(title.tag().as_str()));
}

#[test]
fn removed_live_elements_can_be_reinserted() {
    let (document, view) = live();
    let greeting = document.get_element_by_id("greeting").unwrap().unwrap();
    let list = document.get_element_by_id("list").unwrap().unwrap();

    greeting.remove().unwrap();
    assert!(!greeting.is_attached());
    assert!(document.get_element_by_id("greeting").unwrap().is_none());
    greeting.set_text_content("back").unwrap();

    list.append_child(&greeting).unwrap();
    let found = document.get_element_by_id("greeting").unwrap().unwrap();
    assert_eq!(found, greeting);
    assert!(found.is_attached());
    assert_eq!(found.text_content().unwrap(), "back");
    assert!(view.markup().contains("back"));

    // The node itself moved; it was never rebuilt from markup.
    let ops = view.ops();
    assert!(ops.contains(&String::from("park")));
    assert!(!ops.contains(&String::from("getOuterHtml")));
    assert!(!ops.contains(&String::from("appendHtml")));
}

#[test]
fn live_element_moves_into_a_detached_parent_without_rebuilding() {
    let (document, view) = live();
    let greeting = document.get_element_by_id("greeting").unwrap().unwrap();
    let clicked = HostFunction::new("clicked", |_| Ok(()));
    greeting.add_event_listener("click", &clicked).unwrap();

    let holder = document.create_element("div").unwrap();
    holder.append_child(&greeting).unwrap();
    assert!(!greeting.is_attached());
    assert!(!holder.is_attached());
    assert!(document.get_element_by_id("greeting").unwrap().is_none());

    document.append_child(&holder).unwrap();
    assert!(holder.is_attached());
    assert!(greeting.is_attached());

    let ops = view.ops();
    assert!(ops.contains(&String::from("parkHtml")));
    assert!(!ops.contains(&String::from("getOuterHtml")));
    assert!(!ops.contains(&String::from("remove")));
    assert!(!ops.contains(&String::from("appendHtml")));

    let handler = greeting.get_attribute("onclick").unwrap().unwrap();
    assert!(handler.contains(&clicked.key()), "{handler}");
    assert!(holder.inner_html().unwrap().contains(greeting.tag().as_str()));
}

#[test]
fn handles_for_the_same_element_share_its_placement() {
    let document = assembling();
    let main = document.get_element_by_id("main").unwrap().unwrap();
    let list = document.get_element_by_id("list").unwrap().unwrap();

    let greeting = document.get_element_by_id("greeting").unwrap().unwrap();
    list.append_child(&greeting).unwrap();
    let again = document.get_element_by_id("greeting").unwrap().unwrap();
    main.append_child(&again).unwrap();
    list.remove().unwrap();

    assert!(greeting.is_attached());
    assert_eq!(greeting.text_content().unwrap(), "hi");
    assert!(!list.is_attached());
    assert!(document.get_element_by_id("greeting").unwrap().is_some());

    // Moving the greeting's parent out takes the greeting along.
    main.remove().unwrap();
    assert!(!greeting.is_attached());
    assert!(!again.is_attached());
    assert_eq!(again.text_content().unwrap(), "hi");
}

#[test]
fn stale_handles_report_missing_elements() {
    let (document, view) = live();
    let greeting = document.get_element_by_id("greeting").unwrap().unwrap();
    let tag = greeting.tag().clone();

    // Page script deletes the node behind the host's back.
    let script = DomOp::Remove {
        target: tag.clone(),
    }
    .to_script()
    .unwrap();
    decode_reply(&document.evaluate(&script).unwrap()).unwrap();

    let stale = document.element(tag.as_str()).unwrap();
    assert_eq!(stale, greeting);
    assert!(matches!(
        stale.text_content(),
        Err(BridgeError::ElementMissing(_))
    ));
    assert!(!stale.is_attached());
    assert!(!view.markup().contains(tag.as_str()));
}

#[test]
fn flags_and_styles_round_trip_live() {
    let (document, _view) = live();
    let main = document.get_element_by_id("main").unwrap().unwrap();

    main.set_flag(KnownAttribute::Hidden, true).unwrap();
    assert!(main.flag(KnownAttribute::Hidden).unwrap());
    main.set_style("color", "red").unwrap();
    assert_eq!(main.style("color").unwrap(), "red");

    let mut classes = main.class_list().unwrap();
    assert!(classes.toggle("active", None).unwrap());
    assert_eq!(
        main.class_list().unwrap().iter().collect::<Vec<_>>(),
        vec!["panel", "active"]
    );
}

#[test]
fn live_listeners_register_host_functions() {
    let (document, view) = live();
    let main = document.get_element_by_id("main").unwrap().unwrap();
    let clicked = HostFunction::new("clicked", |_| Ok(()));

    main.add_event_listener("click", &clicked).unwrap();

    let key = document.registry().register(&clicked);
    assert_eq!(document.registry().len(), 1);
    assert!(view.ops().contains(&String::from("listen")));
    assert!(view.markup().contains(&key));
}

#[test]
fn assembling_document_refuses_raw_script() {
    let document = assembling();
    assert!(matches!(
        document.evaluate("1"),
        Err(BridgeError::Precondition(_))
    ));
}
