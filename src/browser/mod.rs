// Remote-controlled browser seam. Everything above this module talks to
// the broker page only through these traits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod cdp;
pub mod cdp_types;
pub mod scripted;

/// Called once per streamed frame the page receives, on whatever task the
/// driver reads frames from. Must not block.
pub type FrameHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, &'static str),

    #[error("script raised: {0}")]
    Script(String),

    #[error("page closed")]
    Closed,

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("protocol: {0}")]
    Protocol(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn connect(&self, endpoint: &str) -> DriverResult<Arc<dyn BrowserSession>>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Open tabs, in the order the browser lists them.
    async fn pages(&self) -> DriverResult<Vec<Arc<dyn BrowserPage>>>;
}

#[async_trait]
pub trait BrowserPage: Send + Sync {
    fn id(&self) -> &str;

    fn is_closed(&self) -> bool;

    async fn url(&self) -> DriverResult<String>;

    async fn title(&self) -> DriverResult<String>;

    /// Evaluate a zero-argument JS function expression (`() => ...`) and
    /// return its JSON value. Promises are awaited.
    async fn evaluate(&self, script: &str) -> DriverResult<Value>;

    async fn subscribe_frames(&self, handler: FrameHandler) -> DriverResult<()>;

    async fn click(&self, selector: &str) -> DriverResult<()>;

    async fn fill(&self, selector: &str, value: &str) -> DriverResult<()>;

    /// PNG bytes of the visible viewport.
    async fn screenshot(&self) -> DriverResult<Vec<u8>>;

    async fn bring_to_front(&self) -> DriverResult<()>;

    async fn close(&self) -> DriverResult<()>;
}

/// Every outward browser call goes through here.
pub async fn with_timeout<T, F>(limit: Duration, what: &'static str, fut: F) -> DriverResult<T>
where
    F: Future<Output = DriverResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(DriverError::Timeout(limit, what)),
    }
}

/// Quote a Rust string as a JS string literal.
pub(crate) fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_elapsed() {
        let res: DriverResult<()> = with_timeout(Duration::from_millis(50), "sleep", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(res, Err(DriverError::Timeout(Duration::from_millis(50), "sleep")));
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string(r#"a"b"#), r#""a\"b""#);
    }
}
