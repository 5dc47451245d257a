//! Accessibility-tree snapshot as dumped by `uiautomator dump`.

use crate::error::{BridgeError, BridgeResult};
use crate::model::Bounds;
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use regex::Regex;

static BOUNDS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]$").expect("static bounds regex")
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiNode {
    pub class: String,
    pub text: String,
    pub content_desc: String,
    pub resource_id: String,
    pub clickable: bool,
    pub bounds: Option<Bounds>,
    pub children: Vec<UiNode>,
}

impl UiNode {
    /// Visible label of this node alone: text, else content description.
    pub fn label(&self) -> Option<&str> {
        let text = self.text.trim();
        if !text.is_empty() {
            return Some(text);
        }
        let desc = self.content_desc.trim();
        if !desc.is_empty() {
            return Some(desc);
        }
        None
    }

    /// Every text and content description in this subtree, document order.
    pub fn subtree_texts(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_texts(&mut out);
        out
    }

    fn collect_texts<'a>(&'a self, out: &mut Vec<&'a str>) {
        for t in [self.text.trim(), self.content_desc.trim()] {
            if !t.is_empty() {
                out.push(t);
            }
        }
        for child in &self.children {
            child.collect_texts(out);
        }
    }

    pub fn subtree_text(&self) -> String {
        self.subtree_texts().join(" ")
    }

    /// Breadth-first walk, root first.
    pub fn walk(&self) -> Vec<&UiNode> {
        let mut out = vec![self];
        let mut i = 0;
        while i < out.len() {
            let node = out[i];
            out.extend(node.children.iter());
            i += 1;
        }
        out
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }
}

pub fn parse_bounds(raw: &str) -> Option<Bounds> {
    let caps = BOUNDS_RE.captures(raw.trim())?;
    let n = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<i32>().ok());
    Some(Bounds::new(n(1)?, n(2)?, n(3)?, n(4)?))
}

fn node_from(e: &BytesStart<'_>) -> BridgeResult<UiNode> {
    let mut node = UiNode {
        class: String::from_utf8_lossy(e.name().as_ref()).to_string(),
        ..Default::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(|err| malformed(&err.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|err| malformed(&err.to_string()))?
            .to_string();
        match attr.key.as_ref() {
            b"text" => node.text = value,
            b"content-desc" => node.content_desc = value,
            b"resource-id" => node.resource_id = value,
            b"class" => node.class = value,
            b"clickable" => node.clickable = value == "true",
            b"bounds" => node.bounds = parse_bounds(&value),
            _ => {}
        }
    }
    Ok(node)
}

fn malformed(reason: &str) -> BridgeError {
    BridgeError::PerceptionInsufficient(format!("UI dump unreadable: {}", reason))
}

/// Parse a full dump. The returned root is synthetic; the document's
/// `<hierarchy>` element is its only child.
pub fn parse_dump(xml: &str) -> BridgeResult<UiNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<UiNode> = vec![UiNode::default()];
    let mut saw_node = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                saw_node |= e.name().as_ref() == b"node";
                stack.push(node_from(&e)?);
            }
            Ok(Event::Empty(e)) => {
                saw_node |= e.name().as_ref() == b"node";
                let node = node_from(&e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    return Err(malformed("unbalanced closing tag"));
                }
                let node = stack.pop().unwrap_or_default();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(&e.to_string())),
        }
    }

    if stack.len() != 1 {
        return Err(malformed("truncated document"));
    }
    if !saw_node {
        return Err(malformed("no nodes in hierarchy"));
    }
    Ok(stack.pop().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" clickable="false" bounds="[0,0][1080,1920]">
    <node index="0" text="Positions" resource-id="com.app:id/title" class="android.widget.TextView" clickable="false" bounds="[40,100][400,160]" />
    <node index="1" text="" content-desc="Close &amp; exit" resource-id="" class="android.widget.Button" clickable="true" bounds="[900,100][1040,160]" />
  </node>
</hierarchy>"#;

    #[test]
    fn test_parse_dump_structure() {
        let root = parse_dump(DUMP).unwrap();
        assert_eq!(root.children.len(), 1);
        let hierarchy = &root.children[0];
        assert_eq!(hierarchy.class, "hierarchy");
        let frame = &hierarchy.children[0];
        assert_eq!(frame.children.len(), 2);
        assert_eq!(frame.children[0].label(), Some("Positions"));
        assert_eq!(frame.children[1].label(), Some("Close & exit"));
        assert!(frame.children[1].clickable);
        assert_eq!(frame.children[0].bounds, Some(Bounds::new(40, 100, 400, 160)));
        assert_eq!(root.node_count(), 5);
    }

    #[test]
    fn test_truncated_dump_is_rejected() {
        let torn = &DUMP[..DUMP.len() / 2];
        assert!(parse_dump(torn).is_err());
    }

    #[test]
    fn test_empty_hierarchy_is_rejected() {
        assert!(parse_dump("<?xml version='1.0' ?><hierarchy rotation=\"0\"></hierarchy>").is_err());
        assert!(parse_dump("").is_err());
    }

    #[test]
    fn test_parse_bounds() {
        assert_eq!(parse_bounds("[0,84][1080,1794]"), Some(Bounds::new(0, 84, 1080, 1794)));
        assert_eq!(parse_bounds("0,84,1080"), None);
    }
}
