//! In-memory driver with canned pages. Used by the tests and by the CLI's
//! `--offline` mode. Evaluate answers are looked up by a marker substring of
//! the script; the most recently registered matching marker wins.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{BrowserDriver, BrowserPage, BrowserSession, DriverError, DriverResult, FrameHandler};

type Responder = Arc<dyn Fn(&str) -> DriverResult<Value> + Send + Sync>;

#[derive(Default)]
pub struct ScriptedDriver {
    pages: Mutex<Vec<Arc<ScriptedPage>>>,
    unreachable: AtomicBool,
    connects: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver whose `connect` always fails, as if no browser were listening.
    pub fn unreachable() -> Self {
        let d = Self::default();
        d.unreachable.store(true, Ordering::SeqCst);
        d
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn add_page(&self, page: ScriptedPage) -> Arc<ScriptedPage> {
        let page = Arc::new(page);
        self.pages.lock().push(page.clone());
        page
    }

    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn connect(&self, endpoint: &str) -> DriverResult<Arc<dyn BrowserSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DriverError::Transport(format!("connection refused: {endpoint}")));
        }
        let pages = self.pages.lock().clone();
        Ok(Arc::new(ScriptedSession { pages }))
    }
}

struct ScriptedSession {
    pages: Vec<Arc<ScriptedPage>>,
}

#[async_trait]
impl BrowserSession for ScriptedSession {
    async fn pages(&self) -> DriverResult<Vec<Arc<dyn BrowserPage>>> {
        Ok(self
            .pages
            .iter()
            .filter(|p| !p.is_closed())
            .map(|p| p.clone() as Arc<dyn BrowserPage>)
            .collect())
    }
}

pub struct ScriptedPage {
    id: String,
    url: Mutex<String>,
    title: Mutex<String>,
    responders: Mutex<Vec<(String, Responder)>>,
    handlers: Mutex<Vec<FrameHandler>>,
    actions: Mutex<Vec<String>>,
    evaluated: Mutex<Vec<String>>,
    missing: Mutex<Vec<String>>,
    closed: AtomicBool,
    hung: AtomicBool,
}

impl ScriptedPage {
    pub fn new(id: &str, url: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            url: Mutex::new(url.to_string()),
            title: Mutex::new(title.to_string()),
            responders: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            actions: Mutex::new(Vec::new()),
            evaluated: Mutex::new(Vec::new()),
            missing: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            hung: AtomicBool::new(false),
        }
    }

    pub fn respond(&self, marker: &str, value: Value) -> &Self {
        self.respond_with(marker, move |_| Ok(value.clone()))
    }

    pub fn respond_with<F>(&self, marker: &str, f: F) -> &Self
    where
        F: Fn(&str) -> DriverResult<Value> + Send + Sync + 'static,
    {
        self.responders.lock().push((marker.to_string(), Arc::new(f)));
        self
    }

    /// Selectors that `click`/`fill` report as absent.
    pub fn missing_selector(&self, selector: &str) -> &Self {
        self.missing.lock().push(selector.to_string());
        self
    }

    /// Deliver a frame to every subscribed handler.
    pub fn push_frame(&self, frame: &[u8]) {
        let handlers: Vec<FrameHandler> = self.handlers.lock().clone();
        for h in &handlers {
            h(frame);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    /// Evaluate never answers while hung; callers must time out.
    pub fn set_hung(&self, hung: bool) {
        self.hung.store(hung, Ordering::SeqCst);
    }

    pub fn set_url(&self, url: &str) {
        *self.url.lock() = url.to_string();
    }

    /// `click:<sel>`, `fill:<sel>=<value>`, `front`, `close` in call order.
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    pub fn evaluated_count(&self, marker: &str) -> usize {
        self.evaluated.lock().iter().filter(|s| s.contains(marker)).count()
    }

    fn record(&self, action: String) {
        self.actions.lock().push(action);
    }

    fn check_open(&self) -> DriverResult<()> {
        if self.is_closed() {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn url(&self) -> DriverResult<String> {
        self.check_open()?;
        Ok(self.url.lock().clone())
    }

    async fn title(&self) -> DriverResult<String> {
        self.check_open()?;
        Ok(self.title.lock().clone())
    }

    async fn evaluate(&self, script: &str) -> DriverResult<Value> {
        self.check_open()?;
        if self.hung.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        self.evaluated.lock().push(script.to_string());
        let responder = self
            .responders
            .lock()
            .iter()
            .rev()
            .find(|(marker, _)| script.contains(marker.as_str()))
            .map(|(_, r)| r.clone());
        match responder {
            Some(r) => r(script),
            None => Ok(Value::Null),
        }
    }

    async fn subscribe_frames(&self, handler: FrameHandler) -> DriverResult<()> {
        self.check_open()?;
        self.handlers.lock().push(handler);
        Ok(())
    }

    async fn click(&self, selector: &str) -> DriverResult<()> {
        self.check_open()?;
        if self.missing.lock().iter().any(|m| m == selector) {
            return Err(DriverError::ElementNotFound(selector.to_string()));
        }
        self.record(format!("click:{selector}"));
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> DriverResult<()> {
        self.check_open()?;
        if self.missing.lock().iter().any(|m| m == selector) {
            return Err(DriverError::ElementNotFound(selector.to_string()));
        }
        self.record(format!("fill:{selector}={value}"));
        Ok(())
    }

    async fn screenshot(&self) -> DriverResult<Vec<u8>> {
        self.check_open()?;
        // PNG signature only; enough for callers that write bytes to disk
        Ok(vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a])
    }

    async fn bring_to_front(&self) -> DriverResult<()> {
        self.check_open()?;
        self.record("front".to_string());
        Ok(())
    }

    async fn close(&self) -> DriverResult<()> {
        self.record("close".to_string());
        self.set_closed(true);
        Ok(())
    }
}
