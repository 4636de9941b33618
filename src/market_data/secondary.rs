// Second, independent interception path: a WebSocket wrapper installed in
// the page buffers incoming messages, and we drain that buffer on demand
// into a cache of our own. Catches sockets the devtools stream misses.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::browser::{with_timeout, BrowserPage};
use crate::market_data::adapters::BrokerVariant;
use crate::market_data::cache::MarketCaches;
use crate::market_data::interceptor::FrameInterceptor;
use crate::market_data::page::{hook_install_script, HOOK_DRAIN};

const HOOK_BUFFER: usize = 500;

pub struct PageHookFeed {
    interceptor: FrameInterceptor,
}

impl PageHookFeed {
    pub fn new(variant: BrokerVariant) -> Self {
        let interceptor = FrameInterceptor::new(variant, Arc::new(MarketCaches::new())).with_feed("secondary");
        Self { interceptor }
    }

    pub fn caches(&self) -> &Arc<MarketCaches> {
        self.interceptor.caches()
    }

    /// Wrap the page's WebSocket constructor. Only sockets opened afterwards
    /// are seen. Returns whether a new hook went in.
    pub async fn install(&self, page: &dyn BrowserPage, limit: Duration) -> bool {
        match with_timeout(limit, "hook install", page.evaluate(&hook_install_script(HOOK_BUFFER))).await {
            Ok(Value::Bool(true)) => {
                info!(page = page.id(), "page socket hook installed");
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "page socket hook not installed");
                false
            }
        }
    }

    /// Move buffered messages into the feed's cache. Returns frames applied.
    pub async fn drain(&self, page: &dyn BrowserPage, limit: Duration) -> usize {
        let frames = match with_timeout(limit, "hook drain", page.evaluate(HOOK_DRAIN)).await {
            Ok(Value::Array(frames)) => frames,
            Ok(_) => return 0,
            Err(e) => {
                debug!(error = %e, "hook drain failed");
                return 0;
            }
        };
        let mut applied = 0;
        for frame in frames.iter().filter_map(Value::as_str) {
            if self.interceptor.handle_frame(frame.as_bytes()) > 0 {
                applied += 1;
            }
        }
        if applied > 0 {
            debug!(buffered = frames.len(), applied, "hook buffer drained");
        }
        applied
    }
}
