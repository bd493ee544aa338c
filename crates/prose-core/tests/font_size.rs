use kurso_prose_core::{
    Attrs, Document, Editor, ElementNode, ExtensionRegistry, MAX_FONT_SIZE_PT, MIN_FONT_SIZE_PT,
    Marks, Node, Point, Selection, TextNode,
};
use serde_json::json;

fn editor_with_range(text: &str, start: usize, end: usize) -> Editor {
    let doc = Document {
        children: vec![Node::paragraph(text)],
    };
    let selection = Selection::text(Point::new(vec![0, 0], start), Point::new(vec![0, 0], end));
    Editor::new(doc, selection, ExtensionRegistry::cms_profile())
}

fn run_sizes(editor: &Editor) -> Vec<(String, Option<u32>)> {
    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    paragraph
        .children
        .iter()
        .map(|node| {
            let Node::Text(t) = node else {
                panic!("expected text runs");
            };
            (t.text.clone(), t.marks.font_size)
        })
        .collect()
}

#[test]
fn set_font_size_marks_only_the_selected_range() {
    let mut editor = editor_with_range("abcde", 1, 3);

    editor
        .run_command("marks.set_font_size", Some(json!({ "pt": 24 })))
        .unwrap();

    assert_eq!(
        run_sizes(&editor),
        vec![
            ("a".to_string(), None),
            ("bc".to_string(), Some(24)),
            ("de".to_string(), None),
        ]
    );

    let active: Marks = editor.run_query("marks.active", None).unwrap();
    assert_eq!(active.font_size, Some(24));
}

#[test]
fn unset_font_size_restores_the_default_and_merges_runs() {
    let mut editor = editor_with_range("abcde", 1, 3);

    editor
        .run_command("marks.set_font_size", Some(json!({ "pt": 24 })))
        .unwrap();
    editor.run_command("marks.unset_font_size", None).unwrap();

    assert_eq!(run_sizes(&editor), vec![("abcde".to_string(), None)]);
}

#[test]
fn set_font_size_clamps_to_supported_bounds() {
    let mut editor = editor_with_range("abcde", 0, 5);
    editor
        .run_command("marks.set_font_size", Some(json!({ "pt": 200 })))
        .unwrap();
    assert_eq!(
        run_sizes(&editor),
        vec![("abcde".to_string(), Some(MAX_FONT_SIZE_PT))]
    );

    let mut editor = editor_with_range("abcde", 0, 5);
    editor
        .run_command("marks.set_font_size", Some(json!({ "pt": 2 })))
        .unwrap();
    assert_eq!(
        run_sizes(&editor),
        vec![("abcde".to_string(), Some(MIN_FONT_SIZE_PT))]
    );
}

#[test]
fn set_font_size_requires_pt() {
    let mut editor = editor_with_range("abcde", 1, 3);

    let err = editor.run_command("marks.set_font_size", None).unwrap_err();
    assert!(err.message().contains("Missing args.pt"));

    let err = editor
        .run_command("marks.set_font_size", Some(json!({ "pt": "big" })))
        .unwrap_err();
    assert!(err.message().contains("Missing args.pt"));
}

#[test]
fn caret_font_size_is_staged_until_text_lands() {
    let doc = Document {
        children: vec![Node::paragraph("ab")],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 1));
    let mut editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());

    editor
        .run_command("marks.set_font_size", Some(json!({ "pt": 24 })))
        .unwrap();
    assert_eq!(
        editor.stored_marks().and_then(|m| m.font_size),
        Some(24)
    );
    assert!(!editor.can_undo());

    editor.insert_text("X").unwrap();
    assert_eq!(
        run_sizes(&editor),
        vec![
            ("a".to_string(), None),
            ("X".to_string(), Some(24)),
            ("b".to_string(), None),
        ]
    );
}

#[test]
fn font_size_rejects_node_selections() {
    let doc = Document {
        children: vec![Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![
                Node::Text(TextNode {
                    text: "ab".to_string(),
                    marks: Marks::default(),
                }),
                Node::image("https://x.test/a.png"),
            ],
        })],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    let mut editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());
    editor.select_node(vec![0, 1]);

    let err = editor
        .run_command("marks.set_font_size", Some(json!({ "pt": 24 })))
        .unwrap_err();
    assert!(err.message().contains("Font size applies to text selections"));
}

#[test]
fn out_of_range_sizes_are_clamped_when_loading() {
    let doc = Document {
        children: vec![Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![Node::Text(TextNode {
                text: "ab".to_string(),
                marks: Marks {
                    font_size: Some(4),
                    ..Marks::default()
                },
            })],
        })],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    let editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());

    assert_eq!(
        run_sizes(&editor),
        vec![("ab".to_string(), Some(MIN_FONT_SIZE_PT))]
    );
}
