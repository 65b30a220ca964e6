use std::cell::RefCell;
use std::rc::Rc;

use url::Url;

use super::document::HtmlDocument;
use super::handles::HandleAllocator;
use super::DomError;

/// Navigation and prompt surface of the embedding browser.
pub trait HostUi {
    fn current_url(&self) -> String;
    fn navigate(&self, url: &str);
    fn alert(&self, message: &str);
}

/// A top-level page: its url, the documents loaded into it and the user
/// visible effects scripts produced.
pub struct Page {
    url: RefCell<Url>,
    allocator: HandleAllocator,
    navigations: RefCell<Vec<String>>,
    alerts: RefCell<Vec<String>>,
}

impl Page {
    pub fn new(url: Url) -> Rc<Self> {
        Rc::new(Self {
            url: RefCell::new(url),
            allocator: HandleAllocator::new(),
            navigations: RefCell::new(Vec::new()),
            alerts: RefCell::new(Vec::new()),
        })
    }

    pub fn parse(url: &str) -> Result<Rc<Self>, DomError> {
        Ok(Self::new(Url::parse(url)?))
    }

    /// Parse `html` as the top-level document of this page.
    pub fn load_document(&self, html: &str) -> Rc<HtmlDocument> {
        let base = self.url.borrow().clone();
        HtmlDocument::parse(html, base, self.allocator.clone(), None)
    }

    pub fn allocator(&self) -> &HandleAllocator {
        &self.allocator
    }

    /// Navigations requested by scripts since the last call.
    pub fn take_navigations(&self) -> Vec<String> {
        std::mem::take(&mut *self.navigations.borrow_mut())
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.borrow().clone()
    }
}

impl HostUi for Page {
    fn current_url(&self) -> String {
        self.url.borrow().to_string()
    }

    fn navigate(&self, url: &str) {
        match Url::parse(url) {
            Ok(parsed) => {
                tracing::info!(target: "dom", %url, "navigation requested");
                *self.url.borrow_mut() = parsed;
                self.navigations.borrow_mut().push(url.to_string());
            }
            Err(err) => {
                tracing::warn!(target: "dom", %url, error = %err, "ignoring navigation to invalid url");
            }
        }
    }

    fn alert(&self, message: &str) {
        tracing::info!(target: "dom", %message, "alert");
        self.alerts.borrow_mut().push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_updates_current_url() {
        let page = Page::parse("https://example.com/index.html").unwrap();
        page.navigate("https://example.com/next.html");
        assert_eq!(page.current_url(), "https://example.com/next.html");
        assert_eq!(page.take_navigations(), vec!["https://example.com/next.html"]);
        assert!(page.take_navigations().is_empty());
    }

    #[test]
    fn invalid_navigation_is_ignored() {
        let page = Page::parse("https://example.com/").unwrap();
        page.navigate("not a url");
        assert_eq!(page.current_url(), "https://example.com/");
    }

    #[test]
    fn alerts_are_recorded() {
        let page = Page::parse("about:blank").unwrap();
        page.alert("hi");
        assert_eq!(page.alerts(), vec!["hi"]);
    }
}
