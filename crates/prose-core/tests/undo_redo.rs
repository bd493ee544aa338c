use kurso_prose_core::{
    Attrs, Document, Editor, ElementNode, ExtensionRegistry, Marks, Node, Op, Point, Selection,
    TextNode, Transaction,
};

fn editor_with_text(text: &str) -> Editor {
    let doc = Document {
        children: vec![Node::paragraph(text)],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    Editor::new(doc, selection, ExtensionRegistry::cms_profile())
}

fn linked_paragraph() -> Node {
    Node::Element(ElementNode {
        kind: "paragraph".to_string(),
        attrs: Attrs::default(),
        children: vec![
            Node::Text(TextNode {
                text: "Hello ".to_string(),
                marks: Marks::default(),
            }),
            Node::Text(TextNode {
                text: "world".to_string(),
                marks: Marks {
                    link: Some("https://x.com".to_string()),
                    ..Marks::default()
                },
            }),
        ],
    })
}

#[test]
fn undo_redo_handles_multi_op_insert_order() {
    let mut editor = editor_with_text("");

    let tx = Transaction::new(vec![
        Op::InsertText {
            path: vec![0, 0],
            offset: 0,
            text: "a".to_string(),
        },
        Op::InsertText {
            path: vec![0, 0],
            offset: 1,
            text: "b".to_string(),
        },
    ])
    .selection_after(Selection::caret(Point::new(vec![0, 0], 2)))
    .source("test:multi_insert");

    editor.apply(tx).unwrap();
    assert_eq!(editor.doc().to_plain_text(), "ab");

    assert!(editor.undo());
    assert_eq!(editor.doc().to_plain_text(), "");
    assert_eq!(
        editor.selection().as_text().unwrap().head,
        Point::new(vec![0, 0], 0)
    );

    assert!(editor.redo());
    assert_eq!(editor.doc().to_plain_text(), "ab");
    assert_eq!(
        editor.selection().as_text().unwrap().head,
        Point::new(vec![0, 0], 2)
    );
}

#[test]
fn undo_reverts_validator_and_normalize_effects_in_one_step() {
    let doc = Document {
        children: vec![linked_paragraph()],
    };
    let selection = Selection::caret(Point::new(vec![0, 1], 1));
    let mut editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());

    editor.backspace().unwrap();

    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    assert_eq!(paragraph.children.len(), 1);
    let Node::Text(t) = &paragraph.children[0] else {
        panic!("expected merged text run");
    };
    assert_eq!(t.text, "Hello orld");
    assert!(t.marks.link.is_none());

    assert!(editor.undo());

    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    assert_eq!(paragraph.children.len(), 2);
    let Node::Text(head) = &paragraph.children[0] else {
        panic!("expected text run");
    };
    let Node::Text(tail) = &paragraph.children[1] else {
        panic!("expected text run");
    };
    assert_eq!(head.text, "Hello ");
    assert_eq!(tail.text, "world");
    assert_eq!(tail.marks.link.as_deref(), Some("https://x.com"));
    assert_eq!(
        editor.selection().as_text().unwrap().head,
        Point::new(vec![0, 1], 1)
    );

    assert!(editor.redo());
    assert_eq!(editor.doc().to_plain_text(), "Hello orld");
}

#[test]
fn caret_mark_toggle_adds_no_record_until_text_lands() {
    let mut editor = editor_with_text("ab");
    editor.set_selection(Selection::caret(Point::new(vec![0, 0], 1)));

    editor.run_command("marks.toggle_bold", None).unwrap();
    assert!(!editor.can_undo());

    editor.insert_text("X").unwrap();
    assert!(editor.can_undo());

    assert!(editor.undo());
    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    assert_eq!(paragraph.children.len(), 1);
    assert_eq!(editor.doc().to_plain_text(), "ab");

    assert!(editor.redo());
    let Node::Element(paragraph) = &editor.doc().children[0] else {
        panic!("expected paragraph element");
    };
    let Node::Text(t) = &paragraph.children[1] else {
        panic!("expected marked middle run");
    };
    assert_eq!(t.text, "X");
    assert!(t.marks.bold);
}

#[test]
fn new_edit_clears_redo_stack() {
    let mut editor = editor_with_text("");

    editor.insert_text("a").unwrap();
    editor.insert_text("b").unwrap();
    assert!(editor.undo());
    assert!(editor.can_redo());

    editor.insert_text("c").unwrap();
    assert!(!editor.can_redo());
    assert!(!editor.redo());
    assert_eq!(editor.doc().to_plain_text(), "ac");
}

#[test]
fn undo_capacity_drops_oldest_records() {
    let mut editor = editor_with_text("");

    for _ in 0..201 {
        editor.insert_text("a").unwrap();
    }

    let mut undos = 0;
    while editor.undo() {
        undos += 1;
    }
    assert_eq!(undos, 200);
    assert_eq!(editor.doc().to_plain_text(), "a");
}

#[test]
fn replace_document_resets_history() {
    let mut editor = editor_with_text("");
    editor.insert_text("typed").unwrap();
    assert!(editor.can_undo());

    editor.replace_document(Document {
        children: vec![Node::paragraph("fresh")],
    });

    assert!(!editor.can_undo());
    assert!(!editor.can_redo());
    assert_eq!(editor.doc().to_plain_text(), "fresh");
}

#[test]
fn undo_on_empty_stack_is_a_no_op() {
    let mut editor = editor_with_text("ab");
    assert!(!editor.undo());
    assert!(!editor.redo());
    assert_eq!(editor.doc().to_plain_text(), "ab");
}
