//! HTML parsing and CSS-selector queries
//!
//! A thin layer over `scraper` that turns selector syntax errors and empty
//! `find_one` matches into tracked errors. Supported selectors include tag,
//! `#id`, `.class`, `[attr]`, `[attr OP "value"]` with `=`, `*=`, `^=`, `$=`,
//! `~=`, `|=`, `*` and descendant chains.
//!
//! `scraper::Html` is not `Send`, so parse and query inside a synchronous
//! block and keep only owned values across `.await` points.
//!
//! ```
//! use manga_fetcher::dom::parse_html;
//!
//! let doc = parse_html(br#"<div class="post"><a href="/m/1">One</a></div>"#);
//! let link = doc.root().find_one("div.post a").unwrap();
//! assert_eq!(link.attr("href"), Some("/m/1"));
//! assert_eq!(link.text(), "One");
//! ```

use scraper::{ElementRef, Html, Selector};

use crate::error::{EngineError, Result};

pub struct Document {
    html: Html,
}

/// Parse a full HTML document; the parser is lenient and never fails
pub fn parse_html(bytes: &[u8]) -> Document {
    let text = String::from_utf8_lossy(bytes);
    Document {
        html: Html::parse_document(&text),
    }
}

/// Parse a fragment such as an AJAX response body
pub fn parse_fragment(bytes: &[u8]) -> Document {
    let text = String::from_utf8_lossy(bytes);
    Document {
        html: Html::parse_fragment(&text),
    }
}

impl Document {
    pub fn root(&self) -> Element<'_> {
        Element {
            inner: self.html.root_element(),
        }
    }
}

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| {
        crate::track!(
            EngineError::Parsing {
                what: "selector".to_string(),
                message: format!("invalid selector '{}': {}", selector, e),
                sample: None,
            },
            "selector" => selector
        )
    })
}

#[derive(Clone, Copy)]
pub struct Element<'a> {
    inner: ElementRef<'a>,
}

impl<'a> Element<'a> {
    pub fn name(&self) -> &'a str {
        self.inner.value().name()
    }

    /// All matching descendants in document order
    pub fn find(&self, selector: &str) -> Result<Vec<Element<'a>>> {
        let sel = compile(selector)?;
        Ok(self.inner.select(&sel).map(|inner| Element { inner }).collect())
    }

    /// First matching descendant; no match is a not-found error
    pub fn find_one(&self, selector: &str) -> Result<Element<'a>> {
        let sel = compile(selector)?;
        self.inner
            .select(&sel)
            .next()
            .map(|inner| Element { inner })
            .ok_or_else(|| {
                crate::track!(
                    EngineError::NotFound(format!("element matching '{}'", selector)),
                    "selector" => selector
                )
            })
    }

    /// Like `find_one` but absence is not an error
    pub fn first(&self, selector: &str) -> Result<Option<Element<'a>>> {
        let sel = compile(selector)?;
        Ok(self.inner.select(&sel).next().map(|inner| Element { inner }))
    }

    pub fn attr(&self, name: &str) -> Option<&'a str> {
        self.inner.value().attr(name)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.inner.value().classes().any(|c| c == class)
    }

    /// Concatenated descendant text, trimmed
    pub fn text(&self) -> String {
        self.inner.text().collect::<String>().trim().to_string()
    }

    pub fn inner_html(&self) -> String {
        self.inner.inner_html()
    }

    pub fn parent(&self) -> Option<Element<'a>> {
        self.inner
            .parent()
            .and_then(ElementRef::wrap)
            .map(|inner| Element { inner })
    }

    /// Next sibling element, skipping text and comment nodes
    pub fn next_sibling(&self) -> Option<Element<'a>> {
        self.inner
            .next_siblings()
            .find_map(ElementRef::wrap)
            .map(|inner| Element { inner })
    }

    pub fn prev_sibling(&self) -> Option<Element<'a>> {
        self.inner
            .prev_siblings()
            .find_map(ElementRef::wrap)
            .map(|inner| Element { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    const PAGE: &[u8] = br#"
        <html><body>
          <div id="main" class="wrap">
            <ul class="chapters">
              <li class="wp-manga-chapter"><a href="/c/2" data-lang="en-US">Chapter 2</a></li>
              <li class="wp-manga-chapter"><a href="/c/1" data-lang="ja">Chapter <b>1</b></a></li>
            </ul>
            <img src="https://cdn.test/p1.webp" alt="page one">
          </div>
          <p class="note">  trailing  </p>
        </body></html>"#;

    #[test]
    fn test_descendant_and_class() {
        let doc = parse_html(PAGE);
        let links = doc.root().find("div#main ul.chapters li a").unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[1].text(), "Chapter 1");
        assert_eq!(links[0].parent().unwrap().name(), "li");
    }

    #[test]
    fn test_attribute_operators() {
        let doc = parse_html(PAGE);
        let root = doc.root();
        assert_eq!(root.find("a[href]").unwrap().len(), 2);
        assert_eq!(root.find(r#"a[href="/c/1"]"#).unwrap().len(), 1);
        assert_eq!(root.find(r#"a[href^="/c/"]"#).unwrap().len(), 2);
        assert_eq!(root.find(r#"img[src$=".webp"]"#).unwrap().len(), 1);
        assert_eq!(root.find(r#"img[src*="cdn"]"#).unwrap().len(), 1);
        assert_eq!(root.find(r#"img[alt~="one"]"#).unwrap().len(), 1);
        assert_eq!(root.find(r#"a[data-lang|="en"]"#).unwrap().len(), 1);
        assert!(root.find("*").unwrap().len() > 5);
    }

    #[test]
    fn test_siblings() {
        let doc = parse_html(PAGE);
        let first = doc.root().find_one("li.wp-manga-chapter").unwrap();
        let second = first.next_sibling().unwrap();
        assert_eq!(second.find_one("a").unwrap().attr("href"), Some("/c/1"));
        assert_eq!(second.prev_sibling().unwrap().text(), "Chapter 2");
        assert!(second.next_sibling().is_none());
    }

    #[test]
    fn test_text_is_trimmed() {
        let doc = parse_html(PAGE);
        assert_eq!(doc.root().find_one("p.note").unwrap().text(), "trailing");
    }

    #[test]
    fn test_find_one_missing_is_not_found() {
        let doc = parse_html(PAGE);
        let err = doc.root().find_one("div.reading-content img").err().unwrap();
        assert_eq!(err.category(), ErrorCategory::NotFound);
        assert!(doc.root().first("table").unwrap().is_none());
    }

    #[test]
    fn test_bad_selector_is_parsing_error() {
        let doc = parse_html(PAGE);
        let err = doc.root().find("a[href=").err().unwrap();
        assert_eq!(err.category(), ErrorCategory::Parsing);
    }
}
