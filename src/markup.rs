use anyhow::{anyhow, bail, Context, Result};

/// Elements that never carry children and have no closing tag.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta",
    "source", "track", "wbr",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Element(Element),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub tag: String,
    /// Attributes in document order; names are lowercased, values unescaped.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(attr_name, _)| attr_name == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self.attrs.iter_mut().find(|(attr_name, _)| attr_name == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.attrs.push((name.to_string(), value.to_string())),
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    /// Depth-first search through this element's descendants.
    pub fn find_descendant(&self, pred: &dyn Fn(&Element) -> bool) -> Option<&Element> {
        for child in &self.children {
            if let Node::Element(element) = child {
                if pred(element) {
                    return Some(element);
                }
                if let Some(found) = element.find_descendant(pred) {
                    return Some(found);
                }
            }
        }
        None
    }
}

/// All elements in the forest matching `pred`, in document order.
pub fn find_all<'a>(nodes: &'a [Node], pred: &dyn Fn(&Element) -> bool) -> Vec<&'a Element> {
    let mut found = Vec::new();
    for node in nodes {
        if let Node::Element(element) = node {
            collect_matching(element, pred, &mut found);
        }
    }
    found
}

fn collect_matching<'a>(
    element: &'a Element,
    pred: &dyn Fn(&Element) -> bool,
    found: &mut Vec<&'a Element>,
) {
    if pred(element) {
        found.push(element);
    }
    for child in &element.children {
        if let Node::Element(element) = child {
            collect_matching(element, pred, found);
        }
    }
}

/// Visit every element in the forest, depth-first, allowing mutation.
pub fn walk_elements_mut(nodes: &mut [Node], visit: &mut dyn FnMut(&mut Element)) {
    for node in nodes {
        if let Node::Element(element) = node {
            walk_element_mut(element, visit);
        }
    }
}

fn walk_element_mut(element: &mut Element, visit: &mut dyn FnMut(&mut Element)) {
    visit(element);
    for child in &mut element.children {
        if let Node::Element(element) = child {
            walk_element_mut(element, visit);
        }
    }
}

/// Parse cooked markup into a node forest.
///
/// Covers the subset the chat server emits: nested elements, quoted and bare
/// attribute values, void elements, self-closing syntax, and character
/// entities in text and attribute values. Mismatched or unterminated tags are
/// errors.
pub fn parse(input: &str) -> Result<Vec<Node>> {
    let mut parser = Parser { input, pos: 0 };
    let mut nodes = Vec::new();
    match parser.parse_nodes(&mut nodes)? {
        None => Ok(nodes),
        Some(tag) => bail!("unexpected closing tag </{tag}> at top level"),
    }
}

/// Serialize a node forest back to markup, escaping text and attribute
/// values. Attribute values are always double-quoted.
pub fn to_html(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        write_node(node, &mut out);
    }
    out
}

fn write_node(node: &Node, out: &mut String) {
    match node {
        Node::Text(text) => out.push_str(&escape_text(text)),
        Node::Element(element) => {
            out.push('<');
            out.push_str(&element.tag);
            for (name, value) in &element.attrs {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                out.push_str(&escape_attr(value));
                out.push('"');
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&element.tag.as_str()) {
                return;
            }
            for child in &element.children {
                write_node(child, out);
            }
            out.push_str("</");
            out.push_str(&element.tag);
            out.push('>');
        }
    }
}

pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.input[self.pos..].starts_with(prefix)
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    /// Parse sibling nodes into `nodes` until end of input or a closing tag,
    /// whose name is returned for the caller to match.
    fn parse_nodes(&mut self, nodes: &mut Vec<Node>) -> Result<Option<String>> {
        loop {
            if self.pos >= self.input.len() {
                return Ok(None);
            }
            if self.starts_with("</") {
                self.pos += 2;
                let tag = self.parse_name()?;
                self.skip_whitespace();
                if !self.eat(">") {
                    bail!("malformed closing tag </{tag}");
                }
                return Ok(Some(tag));
            }
            if self.starts_with("<") {
                let element = self.parse_element()?;
                nodes.push(Node::Element(element));
                continue;
            }
            let text = self.parse_text()?;
            if !text.is_empty() {
                nodes.push(Node::Text(text));
            }
        }
    }

    fn parse_element(&mut self) -> Result<Element> {
        self.pos += 1; // consume '<'
        let tag = self.parse_name()?;
        let mut element = Element::new(&tag);

        loop {
            self.skip_whitespace();
            if self.eat("/>") {
                return Ok(element);
            }
            if self.eat(">") {
                break;
            }
            if self.pos >= self.input.len() {
                bail!("unterminated <{tag}> tag");
            }
            let (name, value) = self.parse_attr()?;
            element.attrs.push((name, value));
        }

        if VOID_ELEMENTS.contains(&tag.as_str()) {
            return Ok(element);
        }

        match self.parse_nodes(&mut element.children)? {
            Some(closing) if closing == tag => Ok(element),
            Some(closing) => bail!("mismatched closing tag: expected </{tag}>, found </{closing}>"),
            None => bail!("unterminated <{tag}> element"),
        }
    }

    fn parse_name(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        if self.pos == start {
            bail!("expected a name at byte {start}");
        }
        Ok(self.input[start..self.pos].to_ascii_lowercase())
    }

    fn parse_attr(&mut self) -> Result<(String, String)> {
        let name = self.parse_name()?;
        self.skip_whitespace();
        if !self.eat("=") {
            return Ok((name, String::new()));
        }
        self.skip_whitespace();

        let value = match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == quote {
                        break;
                    }
                    self.pos += c.len_utf8();
                }
                if self.peek() != Some(quote) {
                    bail!("unterminated value for attribute {name}");
                }
                let raw = &self.input[start..self.pos];
                self.pos += 1;
                unescape(raw)?
            }
            _ => {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c.is_whitespace() || c == '>' || c == '/' {
                        break;
                    }
                    self.pos += c.len_utf8();
                }
                unescape(&self.input[start..self.pos])?
            }
        };

        Ok((name, value))
    }

    fn parse_text(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '<' {
                break;
            }
            self.pos += c.len_utf8();
        }
        unescape(&self.input[start..self.pos])
    }
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];
        let end = rest
            .find(';')
            .ok_or_else(|| anyhow!("unterminated character entity in {raw:?}"))?;
        let entity = &rest[1..end];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" | "#39" => out.push('\''),
            _ if entity.starts_with('#') => {
                let code: u32 = entity[1..]
                    .parse()
                    .with_context(|| format!("invalid character reference &{entity};"))?;
                let c = char::from_u32(code)
                    .ok_or_else(|| anyhow!("character reference &{entity}; out of range"))?;
                out.push(c);
            }
            _ => bail!("unsupported character entity &{entity};"),
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MENTION_PARAGRAPH: &str =
        "<p>Hey <a class=\"mention\" href=\"/u/user1\">@user1</a></p>";

    #[test]
    fn parses_a_mention_paragraph() {
        let nodes = parse(MENTION_PARAGRAPH).unwrap();
        assert_eq!(nodes.len(), 1);

        let Node::Element(paragraph) = &nodes[0] else {
            panic!("expected an element");
        };
        assert_eq!(paragraph.tag, "p");
        assert_eq!(paragraph.children.len(), 2);
        assert_eq!(paragraph.children[0], Node::Text("Hey ".to_string()));

        let Node::Element(anchor) = &paragraph.children[1] else {
            panic!("expected the mention anchor");
        };
        assert_eq!(anchor.tag, "a");
        assert!(anchor.has_class("mention"));
        assert_eq!(anchor.attr("href"), Some("/u/user1"));
        assert_eq!(anchor.children, vec![Node::Text("@user1".to_string())]);
    }

    #[test]
    fn round_trips_cooked_markup() {
        let nodes = parse(MENTION_PARAGRAPH).unwrap();
        assert_eq!(to_html(&nodes), MENTION_PARAGRAPH);
    }

    #[test]
    fn unescapes_entities_in_text_and_attributes() {
        let nodes =
            parse("<p title=\"Tom &amp; Jerry\">1 &lt; 2 &gt; 0 &#33;</p>").unwrap();
        let Node::Element(paragraph) = &nodes[0] else {
            panic!("expected an element");
        };
        assert_eq!(paragraph.attr("title"), Some("Tom & Jerry"));
        assert_eq!(
            paragraph.children,
            vec![Node::Text("1 < 2 > 0 !".to_string())]
        );
    }

    #[test]
    fn escapes_on_serialization() {
        let mut element = Element::new("img");
        element.set_attr("title", "5 > 4 & \"so on\"");
        let html = to_html(&[Node::Element(element)]);
        assert_eq!(html, "<img title=\"5 &gt; 4 &amp; &quot;so on&quot;\">");
    }

    #[test]
    fn void_and_self_closing_elements_take_no_children() {
        let nodes = parse("<p>a<br>b<img src=\"x.png\">c<span/>d</p>").unwrap();
        let Node::Element(paragraph) = &nodes[0] else {
            panic!("expected an element");
        };
        assert_eq!(paragraph.children.len(), 7);
        let Node::Element(image) = &paragraph.children[3] else {
            panic!("expected the img element");
        };
        assert_eq!(image.attr("src"), Some("x.png"));
        assert!(image.children.is_empty());
    }

    #[test]
    fn set_attr_updates_in_place() {
        let mut element = Element::new("img");
        element.set_attr("src", "old.png");
        element.set_attr("src", "new.png");
        assert_eq!(element.attrs.len(), 1);
        assert_eq!(element.attr("src"), Some("new.png"));
    }

    #[test]
    fn rejects_mismatched_closing_tag() {
        let err = parse("<p><a>text</p></a>").unwrap_err();
        assert!(err.to_string().contains("mismatched closing tag"));
    }

    #[test]
    fn rejects_unterminated_element() {
        assert!(parse("<p>never closed").is_err());
        assert!(parse("<p attr=\"never closed").is_err());
    }

    #[test]
    fn find_all_matches_in_document_order() {
        let nodes = parse(
            "<p><a class=\"mention\" href=\"/u/a\">@a</a> and \
             <a class=\"mention\" href=\"/u/b\">@b</a></p>",
        )
        .unwrap();
        let anchors = find_all(&nodes, &|el| el.has_class("mention"));
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].attr("href"), Some("/u/a"));
        assert_eq!(anchors[1].attr("href"), Some("/u/b"));
    }

    #[test]
    fn walk_elements_mut_reaches_nested_elements() {
        let mut nodes = parse("<p><span><em>x</em></span></p>").unwrap();
        let mut visited = Vec::new();
        walk_elements_mut(&mut nodes, &mut |el| visited.push(el.tag.clone()));
        assert_eq!(visited, vec!["p", "span", "em"]);
    }
}
