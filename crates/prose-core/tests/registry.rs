use kurso_prose_core::{
    AttrShape, AttrSpec, ChildConstraint, CommandSpec, Document, Editor, Extension,
    ExtensionRegistry, MarkSpec, Node, NodeRole, NodeSpec, Point, QuerySpec, RegistryError,
    Selection,
};
use serde_json::json;

struct CalloutExtension;

impl Extension for CalloutExtension {
    fn id(&self) -> &'static str {
        "callout"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec {
            kind: "callout".to_string(),
            role: NodeRole::Block,
            is_void: false,
            children: ChildConstraint::InlineOnly,
            tag: "aside".to_string(),
        }]
    }

    fn attr_specs(&self) -> Vec<AttrSpec> {
        vec![AttrSpec::new("callout", "tone", AttrShape::Str)]
    }

    fn mark_specs(&self) -> Vec<MarkSpec> {
        vec![MarkSpec {
            name: "highlight".to_string(),
            tag: "mark".to_string(),
            parse_tags: vec!["mark".to_string()],
            rank: 5,
        }]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::new("callout.insert", "Insert callout", |_, _| Ok(()))]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        vec![QuerySpec {
            id: "callout.tone".to_string(),
            handler: std::sync::Arc::new(|_, _| Ok(json!("neutral"))),
        }]
    }
}

#[test]
fn cms_profile_exposes_the_expected_surface() {
    let registry = ExtensionRegistry::cms_profile();

    for id in [
        "marks.toggle_bold",
        "marks.toggle_italic",
        "marks.toggle_underline",
        "marks.set_font_size",
        "marks.unset_font_size",
        "link.set",
        "link.unset",
        "image.insert",
        "image.set_width",
        "image.set_align",
        "image.unset_align",
    ] {
        assert!(registry.command(id).is_some(), "missing command {id}");
    }
    for id in ["marks.active", "image.attrs"] {
        assert!(registry.query(id).is_some(), "missing query {id}");
    }

    let paragraph = registry.node_spec("paragraph").unwrap();
    assert_eq!(paragraph.role, NodeRole::Block);
    assert!(!paragraph.is_void);
    assert_eq!(paragraph.tag, "p");

    let image = registry.node_spec("image").unwrap();
    assert!(image.is_void);
    assert_eq!(image.tag, "img");
    assert!(registry.is_void_kind("image"));

    let image_attrs: Vec<&str> = registry
        .attr_specs_for("image")
        .map(|spec| spec.name.as_str())
        .collect();
    assert_eq!(
        image_attrs,
        vec!["src", "alt", "title", "width", "height", "align"]
    );
    let align = registry
        .attr_specs_for("image")
        .find(|spec| spec.name == "align")
        .unwrap();
    assert_eq!(align.html_name, "data-align");
}

#[test]
fn marks_nest_by_rank_with_link_outermost() {
    let registry = ExtensionRegistry::cms_profile();
    let ranked: Vec<(&str, u8)> = registry
        .marks_in_rank_order()
        .into_iter()
        .map(|spec| (spec.name.as_str(), spec.rank))
        .collect();
    assert_eq!(
        ranked,
        vec![
            ("link", 0),
            ("bold", 1),
            ("italic", 2),
            ("underline", 3),
            ("font_size", 4),
        ]
    );

    assert_eq!(registry.mark_spec_for_tag("b").unwrap().name, "bold");
    assert_eq!(registry.mark_spec_for_tag("strong").unwrap().name, "bold");
    assert_eq!(registry.mark_spec_for_tag("i").unwrap().name, "italic");
}

#[test]
fn custom_extensions_register_alongside_the_profile() {
    let mut registry = ExtensionRegistry::cms_profile();
    registry
        .register_extension(Box::new(CalloutExtension))
        .unwrap();

    assert!(registry.command("callout.insert").is_some());
    assert!(registry.query("callout.tone").is_some());
    assert!(registry.node_spec("callout").is_some());
    assert_eq!(registry.mark_spec_for_tag("mark").unwrap().name, "highlight");
}

#[test]
fn duplicate_registrations_are_rejected() {
    let mut registry = ExtensionRegistry::cms_profile();
    registry
        .register_extension(Box::new(CalloutExtension))
        .unwrap();

    let err = registry
        .register_extension(Box::new(CalloutExtension))
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::DuplicateNodeKind {
            kind: "callout".to_string()
        }
    );
}

#[test]
fn duplicate_commands_are_rejected_even_across_extensions() {
    struct BoldAgain;
    impl Extension for BoldAgain {
        fn id(&self) -> &'static str {
            "bold_again"
        }
        fn commands(&self) -> Vec<CommandSpec> {
            vec![CommandSpec::new("marks.toggle_bold", "Bold", |_, _| Ok(()))]
        }
    }

    let mut registry = ExtensionRegistry::cms_profile();
    let err = registry.register_extension(Box::new(BoldAgain)).unwrap_err();
    assert_eq!(
        err,
        RegistryError::DuplicateCommand {
            id: "marks.toggle_bold".to_string()
        }
    );
}

#[test]
fn unknown_commands_and_queries_report_their_id() {
    let doc = Document {
        children: vec![Node::paragraph("ab")],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    let mut editor = Editor::new(doc, selection, ExtensionRegistry::cms_profile());

    let err = editor.run_command("nope.nothing", None).unwrap_err();
    assert!(err.message().contains("Unknown command: nope.nothing"));

    let err = editor.run_query_json("nope.nothing", None).unwrap_err();
    assert!(err.message().contains("Unknown query: nope.nothing"));
}

#[test]
fn registered_commands_run_against_the_editor() {
    struct ShoutExtension;
    impl Extension for ShoutExtension {
        fn id(&self) -> &'static str {
            "shout"
        }
        fn queries(&self) -> Vec<QuerySpec> {
            vec![QuerySpec {
                id: "shout.text".to_string(),
                handler: std::sync::Arc::new(|editor, _| {
                    Ok(json!(editor.doc().to_plain_text().to_uppercase()))
                }),
            }]
        }
    }

    let mut registry = ExtensionRegistry::cms_profile();
    registry.register_extension(Box::new(ShoutExtension)).unwrap();

    let doc = Document {
        children: vec![Node::paragraph("ab")],
    };
    let selection = Selection::caret(Point::new(vec![0, 0], 0));
    let editor = Editor::new(doc, selection, registry);

    let shouted: String = editor.run_query("shout.text", None).unwrap();
    assert_eq!(shouted, "AB");
}
