// Browser session ownership: which tab we are attached to, its health, and
// the thread that runs every browser call.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::browser::{BrowserPage, BrowserSession};

pub mod controller;
pub mod health;
pub mod runtime;

#[derive(Clone)]
struct Attachment {
    session: Arc<dyn BrowserSession>,
    page: Arc<dyn BrowserPage>,
}

/// The tab currently under control, shared between the controller (writer)
/// and everything that drives the page.
#[derive(Clone, Default)]
pub struct PageSlot {
    inner: Arc<Mutex<Option<Attachment>>>,
}

impl PageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, session: Arc<dyn BrowserSession>, page: Arc<dyn BrowserPage>) {
        *self.inner.lock() = Some(Attachment { session, page });
    }

    pub fn detach(&self) {
        *self.inner.lock() = None;
    }

    /// Attached page, unless it has closed underneath us.
    pub fn page(&self) -> Option<Arc<dyn BrowserPage>> {
        self.inner
            .lock()
            .as_ref()
            .map(|a| a.page.clone())
            .filter(|p| !p.is_closed())
    }

    /// Attached page even when closed; the controller needs it to notice.
    pub fn raw_page(&self) -> Option<Arc<dyn BrowserPage>> {
        self.inner.lock().as_ref().map(|a| a.page.clone())
    }

    pub fn session(&self) -> Option<Arc<dyn BrowserSession>> {
        self.inner.lock().as_ref().map(|a| a.session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::{ScriptedDriver, ScriptedPage};
    use crate::browser::BrowserDriver;

    #[tokio::test]
    async fn test_closed_page_is_hidden() {
        let driver = ScriptedDriver::new();
        let page = driver.add_page(ScriptedPage::new("t1", "https://qxbroker.com/trade", "Quotex"));
        let session = driver.connect("http://localhost:9222").await.unwrap();

        let slot = PageSlot::new();
        assert!(slot.page().is_none());
        slot.attach(session, page.clone());
        assert_eq!(slot.page().unwrap().id(), "t1");

        page.set_closed(true);
        assert!(slot.page().is_none());
        assert!(slot.raw_page().is_some());
        slot.detach();
        assert!(slot.session().is_none());
    }
}
