use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use thiserror::Error;

use crate::util::validate_url;

/// Maximum nesting depth for outline elements; deeper documents are rejected.
const MAX_OPML_DEPTH: usize = 50;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

impl From<quick_xml::Error> for OpmlError {
    fn from(e: quick_xml::Error) -> Self {
        OpmlError::XmlParse(e.to_string())
    }
}

/// A subscription extracted from an OPML `<outline xmlUrl=..>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlOutline {
    /// `title`, else `text`, else the feed URL.
    pub title: String,
    pub xml_url: String,
    /// Titles of the enclosing folder outlines followed by the entries of the outline's
    /// own `category` attribute, deduplicated.
    pub categories: Vec<String>,
}

/// Reads and parses an OPML file.
pub async fn parse_file(path: &Path) -> Result<Vec<OpmlOutline>, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_opml(&content)
}

/// Extracts every feed outline, at any nesting depth.
///
/// Outlines whose URL is not a public http(s) URL are skipped with a warning. Entity
/// declarations in a DOCTYPE are never expanded: quick-xml only resolves the five
/// predefined XML entities, and anything else makes attribute decoding fail.
pub fn parse_opml(content: &str) -> Result<Vec<OpmlOutline>, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut outlines = Vec::new();
    let mut buf = Vec::new();
    // One entry per open <outline>; folders contribute their title as a category.
    let mut folders: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if folders.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let attrs = read_attributes(&e, &reader)?;
                let folder = if attrs.xml_url.is_none() { attrs.title.clone() } else { None };
                if let Some(outline) = attrs.into_outline(&folders) {
                    outlines.push(outline);
                }
                folders.push(folder);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let attrs = read_attributes(&e, &reader)?;
                if let Some(outline) = attrs.into_outline(&folders) {
                    outlines.push(outline);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                folders.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(outlines)
}

#[derive(Default)]
struct OutlineAttributes {
    title: Option<String>,
    xml_url: Option<String>,
    category: Option<String>,
}

impl OutlineAttributes {
    fn into_outline(self, folders: &[Option<String>]) -> Option<OpmlOutline> {
        let url = self.xml_url?;
        if let Err(e) = validate_url(&url, false) {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
            return None;
        }

        let mut categories: Vec<String> = Vec::new();
        let declared = self
            .category
            .iter()
            .flat_map(|c| c.split(','))
            .map(|c| c.trim().trim_start_matches('/'))
            .filter(|c| !c.is_empty())
            .map(str::to_owned);
        for category in folders.iter().flatten().cloned().chain(declared) {
            if !categories.contains(&category) {
                categories.push(category);
            }
        }

        Some(OpmlOutline {
            title: self.title.unwrap_or_else(|| url.clone()),
            xml_url: url,
            categories,
        })
    }
}

fn read_attributes(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<OutlineAttributes, OpmlError> {
    let mut attrs = OutlineAttributes::default();
    let decoder = reader.decoder();

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        match attr.key.as_ref() {
            b"xmlUrl" => attrs.xml_url = Some(attr.decode_and_unescape_value(decoder)?.trim().to_string()),
            b"title" => attrs.title = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"text" => {
                if attrs.title.is_none() {
                    attrs.title = Some(attr.decode_and_unescape_value(decoder)?.to_string());
                }
            }
            b"category" => attrs.category = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            _ => {}
        }
    }

    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nested_outlines_carry_folder_categories() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Test Feeds</title></head>
  <body>
    <outline text="Blogs" title="Blogs">
      <outline type="rss" text="Example Blog" title="Example Blog" xmlUrl="https://example.com/feed.xml"/>
      <outline text="Rust">
        <outline type="rss" text="Deep" xmlUrl="https://deep.example.com/rss" category="/lang,Blogs"/>
      </outline>
    </outline>
    <outline type="rss" text="Top" xmlUrl="https://top.example.com/rss"/>
  </body>
</opml>"#;

        let outlines = parse_opml(content).unwrap();
        assert_eq!(
            outlines,
            vec![
                OpmlOutline {
                    title: "Example Blog".into(),
                    xml_url: "https://example.com/feed.xml".into(),
                    categories: vec!["Blogs".into()],
                },
                OpmlOutline {
                    title: "Deep".into(),
                    xml_url: "https://deep.example.com/rss".into(),
                    categories: vec!["Blogs".into(), "Rust".into(), "lang".into()],
                },
                OpmlOutline {
                    title: "Top".into(),
                    xml_url: "https://top.example.com/rss".into(),
                    categories: vec![],
                },
            ]
        );
    }

    #[test]
    fn test_title_falls_back_to_url() {
        let content = r#"<?xml version="1.0"?>
<opml version="2.0"><body><outline type="rss" xmlUrl="https://notitle.com/feed"/></body></opml>"#;

        let outlines = parse_opml(content).unwrap();
        assert_eq!(outlines.len(), 1);
        assert_eq!(outlines[0].title, "https://notitle.com/feed");
    }

    #[test]
    fn test_skip_private_and_non_http_urls() {
        let content = r#"<?xml version="1.0"?>
    <opml version="2.0"><body>
        <outline xmlUrl="https://valid.com/feed"/>
        <outline xmlUrl="http://192.168.1.1/feed"/>
        <outline xmlUrl="http://localhost/feed"/>
        <outline xmlUrl="file:///etc/passwd"/>
    </body></opml>"#;

        let outlines = parse_opml(content).unwrap();
        assert_eq!(outlines.len(), 1);
        assert_eq!(outlines[0].xml_url, "https://valid.com/feed");
    }

    #[test]
    fn test_malformed_xml_error() {
        assert!(parse_opml("<opml><body><outline></body>").is_err());
    }

    #[test]
    fn test_custom_entities_are_not_expanded() {
        let content = r#"<?xml version="1.0"?>
<!DOCTYPE opml [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<opml version="2.0">
    <body>
        <outline text="&xxe;" xmlUrl="https://example.com/feed.xml"/>
    </body>
</opml>"#;

        match parse_opml(content) {
            Ok(outlines) => {
                for outline in &outlines {
                    assert!(!outline.title.contains("root:"));
                }
            }
            Err(_) => {}
        }
    }

    #[test]
    fn test_deeply_nested_opml_rejected() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..100 {
            opml.push_str(r#"<outline text="level">"#);
        }
        for _ in 0..100 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let err = parse_opml(&opml).unwrap_err();
        assert!(matches!(err, OpmlError::MaxDepthExceeded(50)));
    }

    #[test]
    fn test_nesting_at_depth_limit_allowed() {
        let mut opml = String::from(r#"<?xml version="1.0"?><opml version="2.0"><body>"#);
        for _ in 0..50 {
            opml.push_str(r#"<outline text="level">"#);
        }
        opml.push_str(r#"<outline text="Deep Feed" xmlUrl="https://deep.example.com/feed"/>"#);
        for _ in 0..50 {
            opml.push_str("</outline>");
        }
        opml.push_str("</body></opml>");

        let outlines = parse_opml(&opml).unwrap();
        assert_eq!(outlines.len(), 1);
        assert_eq!(outlines[0].categories, vec!["level".to_string()]);
    }

    #[tokio::test]
    async fn test_parse_file() {
        let path = std::env::temp_dir().join(format!("feedsync-opml-{}.opml", std::process::id()));
        std::fs::write(
            &path,
            r#"<opml version="2.0"><body><outline text="A" xmlUrl="https://a.example.com/rss"/></body></opml>"#,
        )
        .unwrap();

        let outlines = parse_file(&path).await.unwrap();
        assert_eq!(outlines[0].title, "A");
        let _ = std::fs::remove_file(&path);

        assert!(matches!(parse_file(&path).await, Err(OpmlError::Io(_))));
    }
}
