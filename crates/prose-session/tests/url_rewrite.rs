use kurso_prose_core::{Attrs, Document, ElementNode, Marks, Node, TextNode, VoidNode};
use kurso_prose_session::{OriginError, UrlRewriter};
use rstest::rstest;
use serde_json::json;

fn rewriter() -> UrlRewriter {
    UrlRewriter::new("http://cms.local", "/uploads/").unwrap()
}

#[rstest]
#[case("/uploads/a.png", "http://cms.local/uploads/a.png")]
#[case("/uploads/sub/b.jpg?v=2", "http://cms.local/uploads/sub/b.jpg?v=2")]
#[case("https://third.party/x.png", "https://third.party/x.png")]
#[case("/assets/logo.svg", "/assets/logo.svg")]
#[case("data:image/png;base64,AAAA", "data:image/png;base64,AAAA")]
fn display_form_resolves_only_upload_paths(#[case] stored: &str, #[case] display: &str) {
    assert_eq!(rewriter().to_display(stored), display);
}

#[rstest]
#[case("http://cms.local/uploads/a.png", "/uploads/a.png")]
#[case("http://cms.local:80/uploads/a.png", "/uploads/a.png")]
#[case("http://cms.local/uploads/b.jpg?v=2#frag", "/uploads/b.jpg?v=2#frag")]
#[case("https://cms.local/uploads/a.png", "https://cms.local/uploads/a.png")]
#[case("http://other.example/uploads/a.png", "http://other.example/uploads/a.png")]
#[case("http://cms.local:8080/uploads/a.png", "http://cms.local:8080/uploads/a.png")]
#[case("http://cms.local/assets/a.png", "http://cms.local/assets/a.png")]
#[case("not a url", "not a url")]
fn storage_form_collapses_only_own_uploads(#[case] display: &str, #[case] stored: &str) {
    assert_eq!(rewriter().to_storage(display), stored);
}

#[rstest]
#[case("/uploads/a.png")]
#[case("/uploads/sub/b.jpg?v=2")]
#[case("https://third.party/x.png")]
#[case("/assets/logo.svg")]
fn directions_invert_each_other(#[case] stored: &str) {
    let rewriter = rewriter();
    assert_eq!(rewriter.to_storage(&rewriter.to_display(stored)), stored);
}

#[test]
fn invalid_origins_are_rejected() {
    assert!(matches!(
        UrlRewriter::new("not a url", "/uploads/"),
        Err(OriginError::Unparseable { .. })
    ));
    assert!(matches!(
        UrlRewriter::new("mailto:", "/uploads/"),
        Err(OriginError::MissingHost(_))
    ));
}

#[test]
fn rewriting_is_structural_and_touches_only_image_sources() {
    fn image(src: &str) -> Node {
        let mut attrs = Attrs::default();
        attrs.insert("src".to_string(), json!(src));
        Node::Void(VoidNode {
            kind: "image".to_string(),
            attrs,
        })
    }

    // Text and link hrefs mention upload paths too; only the image src may
    // change.
    let mut doc = Document {
        children: vec![Node::Element(ElementNode {
            kind: "paragraph".to_string(),
            attrs: Attrs::default(),
            children: vec![
                Node::Text(TextNode {
                    text: "see /uploads/a.png ".to_string(),
                    marks: Marks::default(),
                }),
                Node::Text(TextNode {
                    text: "here".to_string(),
                    marks: Marks {
                        link: Some("/uploads/a.png".to_string()),
                        ..Marks::default()
                    },
                }),
                image("/uploads/a.png"),
                image("https://third.party/x.png"),
            ],
        })],
    };

    let rewriter = rewriter();
    rewriter.rewrite_for_display(&mut doc);

    let Node::Element(paragraph) = &doc.children[0] else {
        panic!("expected paragraph element");
    };
    assert!(matches!(
        &paragraph.children[0],
        Node::Text(t) if t.text == "see /uploads/a.png "
    ));
    assert!(matches!(
        &paragraph.children[1],
        Node::Text(t) if t.marks.link.as_deref() == Some("/uploads/a.png")
    ));
    assert!(matches!(
        &paragraph.children[2],
        Node::Void(v) if v.attr_str("src") == Some("http://cms.local/uploads/a.png")
    ));
    assert!(matches!(
        &paragraph.children[3],
        Node::Void(v) if v.attr_str("src") == Some("https://third.party/x.png")
    ));

    let before = doc.clone();
    rewriter.rewrite_for_storage(&mut doc);
    rewriter.rewrite_for_display(&mut doc);
    assert_eq!(doc, before);
}
