use kurso_prose_core::{
    Attrs, Document, Editor, ElementNode, ExtensionRegistry, Marks, Node, Point, Selection,
    TextNode, VoidNode,
};
use serde_json::{Value, json};

fn editor_with_text(text: &str) -> Editor {
    let doc = Document {
        children: vec![Node::paragraph(text)],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    Editor::new(doc, selection, ExtensionRegistry::cms_profile())
}

fn image_node(src: &str, extra: &[(&str, Value)]) -> Node {
    let mut attrs = Attrs::default();
    attrs.insert("src".to_string(), Value::String(src.to_string()));
    for (name, value) in extra {
        attrs.insert((*name).to_string(), value.clone());
    }
    Node::Void(VoidNode {
        kind: "image".to_string(),
        attrs,
    })
}

fn editor_with_selected_image(extra: &[(&str, Value)]) -> Editor {
    let doc = Document {
        children: vec![Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![
                Node::Text(TextNode {
                    text: "ab".to_string(),
                    marks: Marks::default(),
                }),
                image_node("https://x.test/a.png", extra),
            ],
        })],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    let mut editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());
    editor.select_node(vec![0, 1]);
    editor
}

#[test]
fn insert_splits_text_run_at_caret() {
    let mut editor = editor_with_text("ab");
    editor.set_selection(Selection::caret(Point::new(vec![0, 0], 1)));

    editor
        .run_command("image.insert", Some(json!({ "src": "https://x.test/a.png" })))
        .unwrap();

    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    assert_eq!(paragraph.children.len(), 3);
    assert!(matches!(&paragraph.children[0], Node::Text(t) if t.text == "a"));
    assert!(matches!(
        &paragraph.children[1],
        Node::Void(v) if v.kind == "image" && v.attr_str("src") == Some("https://x.test/a.png")
    ));
    assert!(matches!(&paragraph.children[2], Node::Text(t) if t.text == "b"));

    let sel = editor.selection().as_text().unwrap();
    assert_eq!(sel.head, Point::new(vec![0, 2], 0));
}

#[test]
fn insert_at_block_end_keeps_a_caret_host_after_the_image() {
    let mut editor = editor_with_text("ab");
    editor.set_selection(Selection::caret(Point::new(vec![0, 0], 2)));

    editor
        .run_command(
            "image.insert",
            Some(json!({ "src": "https://x.test/a.png", "alt": "Logo", "title": "The logo" })),
        )
        .unwrap();

    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    assert_eq!(paragraph.children.len(), 3);
    assert!(matches!(&paragraph.children[0], Node::Text(t) if t.text == "ab"));
    assert!(matches!(
        &paragraph.children[1],
        Node::Void(v) if v.attr_str("alt") == Some("Logo") && v.attr_str("title") == Some("The logo")
    ));
    assert!(matches!(&paragraph.children[2], Node::Text(t) if t.text.is_empty()));

    let sel = editor.selection().as_text().unwrap();
    assert_eq!(sel.head, Point::new(vec![0, 2], 0));
}

#[test]
fn insert_requires_src_and_a_collapsed_selection() {
    let mut editor = editor_with_text("ab");

    let err = editor.run_command("image.insert", None).unwrap_err();
    assert!(err.message().contains("Missing args.src"));

    let err = editor
        .run_command("image.insert", Some(json!({ "src": "   " })))
        .unwrap_err();
    assert!(err.message().contains("Missing args.src"));

    editor.set_selection(Selection::text(
        Point::new(vec![0, 0], 0),
        Point::new(vec![0, 0], 2),
    ));
    let err = editor
        .run_command("image.insert", Some(json!({ "src": "https://x.test/a.png" })))
        .unwrap_err();
    assert!(err.message().contains("Selection must be collapsed"));
}

#[test]
fn set_width_and_align_update_the_selected_image() {
    let mut editor = editor_with_selected_image(&[]);

    editor
        .run_command("image.set_width", Some(json!({ "px": 400 })))
        .unwrap();
    editor
        .run_command("image.set_align", Some(json!({ "align": "center" })))
        .unwrap();

    let attrs = editor.run_query_json("image.attrs", None).unwrap();
    assert_eq!(attrs["src"], json!("https://x.test/a.png"));
    assert_eq!(attrs["width"], json!(400));
    assert_eq!(attrs["align"], json!("center"));

    editor
        .run_command("image.set_width", Some(json!({ "px": null })))
        .unwrap();
    editor.run_command("image.unset_align", None).unwrap();

    let attrs = editor.run_query_json("image.attrs", None).unwrap();
    assert!(attrs.get("width").is_none());
    assert!(attrs.get("align").is_none());
}

#[test]
fn set_width_replaces_height_and_undo_restores_it() {
    let mut editor = editor_with_selected_image(&[("height", json!(300))]);

    editor
        .run_command("image.set_width", Some(json!({ "px": 400 })))
        .unwrap();

    let attrs = editor.run_query_json("image.attrs", None).unwrap();
    assert_eq!(attrs["width"], json!(400));
    assert!(attrs.get("height").is_none());

    assert!(editor.undo());
    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    let Node::Void(image) = &paragraph.children[1] else {
        panic!("expected image void");
    };
    assert_eq!(image.attr_u64("height"), Some(300));
    assert!(image.attr_u64("width").is_none());
}

#[test]
fn set_width_validates_px() {
    let mut editor = editor_with_selected_image(&[]);

    for px in [json!(0), json!(-5), json!("wide")] {
        let err = editor
            .run_command("image.set_width", Some(json!({ "px": px })))
            .unwrap_err();
        assert!(err.message().contains("args.px must be a positive integer"));
    }
}

#[test]
fn set_width_requires_an_image_selection() {
    let mut editor = editor_with_text("ab");

    let err = editor
        .run_command("image.set_width", Some(json!({ "px": 400 })))
        .unwrap_err();
    assert!(err.message().contains("Select an image first"));
}

#[test]
fn set_align_rejects_unknown_values() {
    let mut editor = editor_with_selected_image(&[]);

    let err = editor
        .run_command("image.set_align", Some(json!({ "align": "bogus" })))
        .unwrap_err();
    assert!(err.message().contains("args.align must be left, center or right"));
}

#[test]
fn attrs_query_is_null_without_an_image_selection() {
    let editor = editor_with_text("ab");
    let attrs = editor.run_query_json("image.attrs", None).unwrap();
    assert_eq!(attrs, Value::Null);
}

#[test]
fn loading_pairs_dimensions_and_drops_invalid_align() {
    let doc = Document {
        children: vec![Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![image_node(
                "https://x.test/a.png",
                &[
                    ("width", json!(300)),
                    ("height", json!(200)),
                    ("align", json!(5)),
                ],
            )],
        })],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    let editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());

    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    let image = paragraph
        .children
        .iter()
        .find_map(|node| match node {
            Node::Void(v) if v.kind == "image" => Some(v),
            _ => None,
        })
        .unwrap();
    assert_eq!(image.attr_u64("width"), Some(300));
    assert!(image.attr_u64("height").is_none());
    assert!(image.attrs.get("align").is_none());
}

#[test]
fn normalization_pads_images_with_caret_hosts() {
    let doc = Document {
        children: vec![Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![
                Node::Text(TextNode {
                    text: "a".to_string(),
                    marks: Marks::default(),
                }),
                image_node("https://x.test/a.png", &[]),
                image_node("https://x.test/b.png", &[]),
            ],
        })],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    let mut editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());

    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    assert_eq!(paragraph.children.len(), 5);
    assert!(matches!(&paragraph.children[0], Node::Text(t) if t.text == "a"));
    assert!(matches!(&paragraph.children[1], Node::Void(_)));
    assert!(matches!(&paragraph.children[2], Node::Text(t) if t.text.is_empty()));
    assert!(matches!(&paragraph.children[3], Node::Void(_)));
    assert!(matches!(&paragraph.children[4], Node::Text(t) if t.text.is_empty()));

    // The trailing leaf is a real caret position after the last image.
    editor.set_selection(Selection::caret(Point::new(vec![0, 4], 0)));
    assert_eq!(
        editor.selection().as_text().unwrap().head,
        Point::new(vec![0, 4], 0)
    );
}

#[test]
fn backspace_selects_the_image_before_removing_it() {
    let doc = Document {
        children: vec![Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![
                Node::Text(TextNode {
                    text: "a".to_string(),
                    marks: Marks::default(),
                }),
                image_node("https://x.test/a.png", &[]),
                Node::Text(TextNode {
                    text: "b".to_string(),
                    marks: Marks::default(),
                }),
            ],
        })],
    };
    let selection = Selection::caret(Point::new(vec![0, 2], 0));
    let mut editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());

    editor.backspace().unwrap();
    assert!(matches!(
        editor.selection().as_node(),
        Some(sel) if sel.path == vec![0, 1]
    ));
    assert_eq!(editor.doc().to_plain_text(), "ab");

    editor.backspace().unwrap();
    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    assert_eq!(paragraph.children.len(), 1);
    assert!(matches!(&paragraph.children[0], Node::Text(t) if t.text == "ab"));
    assert_eq!(
        editor.selection().as_text().unwrap().head,
        Point::new(vec![0, 0], 1)
    );
}

#[test]
fn deleting_the_only_image_leaves_a_blank_paragraph() {
    let doc = Document {
        children: vec![Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![image_node("https://x.test/a.png", &[])],
        })],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    let mut editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());

    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    let image_ix = paragraph
        .children
        .iter()
        .position(|node| matches!(node, Node::Void(_)))
        .unwrap();
    editor.select_node(vec![0, image_ix]);

    editor.delete_selection().unwrap();

    assert!(editor.doc().is_blank());
    assert_eq!(editor.doc().children.len(), 1);
}
