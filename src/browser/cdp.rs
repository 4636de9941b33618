// Chrome DevTools Protocol driver. Attaches to an already running browser
// started with --remote-debugging-port; never launches one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use super::cdp_types::{
    Command, EvaluateResult, Incoming, ScreenshotResult, TargetInfo, VersionInfo, WebSocketFrameReceived,
};
use super::{js_string, BrowserDriver, BrowserPage, BrowserSession, DriverError, DriverResult, FrameHandler};

fn transport(e: impl std::fmt::Display) -> DriverError {
    DriverError::Transport(e.to_string())
}

fn protocol(e: impl std::fmt::Display) -> DriverError {
    DriverError::Protocol(e.to_string())
}

pub struct CdpDriver {
    http: reqwest::Client,
    call_timeout: Duration,
}

impl CdpDriver {
    pub fn new(call_timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), call_timeout }
    }
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    async fn connect(&self, endpoint: &str) -> DriverResult<Arc<dyn BrowserSession>> {
        let base = endpoint.trim_end_matches('/').to_string();
        let info: VersionInfo = self
            .http
            .get(format!("{base}/json/version"))
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?
            .json()
            .await
            .map_err(protocol)?;
        debug!(endpoint = %base, browser = %info.browser, "devtools endpoint reachable");

        Ok(Arc::new(CdpSession {
            http: self.http.clone(),
            base,
            call_timeout: self.call_timeout,
            pages: Mutex::new(HashMap::new()),
        }))
    }
}

struct CdpSession {
    http: reqwest::Client,
    base: String,
    call_timeout: Duration,
    // one page object per target id so subscriptions survive re-listing
    pages: Mutex<HashMap<String, Arc<CdpPage>>>,
}

#[async_trait]
impl BrowserSession for CdpSession {
    async fn pages(&self) -> DriverResult<Vec<Arc<dyn BrowserPage>>> {
        let targets: Vec<TargetInfo> = self
            .http
            .get(format!("{}/json/list", self.base))
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(protocol)?;

        let live: HashSet<String> = targets.iter().filter(|t| t.is_page()).map(|t| t.id.clone()).collect();
        let mut known = self.pages.lock();
        known.retain(|id, page| {
            let keep = live.contains(id) && !page.is_closed();
            if !keep {
                page.shared.mark_closed();
            }
            keep
        });

        let mut out: Vec<Arc<dyn BrowserPage>> = Vec::new();
        for target in targets.into_iter().filter(TargetInfo::is_page) {
            if let Some(page) = known.get(&target.id) {
                out.push(page.clone());
                continue;
            }
            // no debugger url means someone else holds the target
            let Some(ws_url) = target.ws_url.clone() else {
                trace!(target = %target.id, "skipping target without debugger url");
                continue;
            };
            let page = Arc::new(CdpPage::new(target.id.clone(), ws_url, self.http.clone(), self.base.clone(), self.call_timeout));
            known.insert(target.id, page.clone());
            out.push(page);
        }
        Ok(out)
    }
}

type Reply = oneshot::Sender<DriverResult<Value>>;

// State the socket reader task shares with the page handle
#[derive(Default)]
struct PageShared {
    pending: Mutex<HashMap<u64, Reply>>,
    handlers: Mutex<Vec<FrameHandler>>,
    closed: AtomicBool,
}

impl PageShared {
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, reply) in self.pending.lock().drain() {
            let _ = reply.send(Err(DriverError::Closed));
        }
    }

    fn dispatch(&self, text: &str) {
        let msg: Incoming = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                trace!(error = %e, "unparseable devtools message");
                return;
            }
        };

        if let Some(id) = msg.id {
            if let Some(reply) = self.pending.lock().remove(&id) {
                let res = match msg.error {
                    Some(err) => Err(DriverError::Protocol(format!("{} ({})", err.message, err.code))),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                let _ = reply.send(res);
            }
            return;
        }

        match msg.method.as_deref() {
            Some("Network.webSocketFrameReceived") => self.on_frame(msg.params),
            Some("Inspector.detached") | Some("Target.detachedFromTarget") => {
                debug!("devtools target detached");
                self.mark_closed();
            }
            _ => {}
        }
    }

    fn on_frame(&self, params: Value) {
        let Ok(ev) = serde_json::from_value::<WebSocketFrameReceived>(params) else {
            return;
        };
        let bytes = if ev.response.opcode == 2 {
            match BASE64.decode(ev.response.payload_data.as_bytes()) {
                Ok(b) => b,
                Err(_) => return,
            }
        } else {
            ev.response.payload_data.into_bytes()
        };
        // clone out so handlers run without the lock
        let handlers: Vec<FrameHandler> = self.handlers.lock().clone();
        for h in &handlers {
            h(&bytes);
        }
    }
}

pub struct CdpPage {
    id: String,
    ws_url: String,
    http: reqwest::Client,
    base: String,
    call_timeout: Duration,
    writer: tokio::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    shared: Arc<PageShared>,
    next_id: AtomicU64,
    network_enabled: AtomicBool,
}

impl CdpPage {
    fn new(id: String, ws_url: String, http: reqwest::Client, base: String, call_timeout: Duration) -> Self {
        Self {
            id,
            ws_url,
            http,
            base,
            call_timeout,
            writer: tokio::sync::Mutex::new(None),
            shared: Arc::new(PageShared::default()),
            next_id: AtomicU64::new(1),
            network_enabled: AtomicBool::new(false),
        }
    }

    // Lazily open the per-target socket and its reader/writer tasks.
    async fn writer(&self) -> DriverResult<mpsc::UnboundedSender<String>> {
        let mut guard = self.writer.lock().await;
        if let Some(tx) = guard.as_ref() {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        if self.is_closed() {
            return Err(DriverError::Closed);
        }

        let (stream, _) = tokio_tungstenite::connect_async(self.ws_url.as_str()).await.map_err(transport)?;
        debug!(target = %self.id, "attached to devtools target");
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let shared = self.shared.clone();
        let target = self.id.clone();
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => shared.dispatch(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(target = %target, error = %e, "devtools socket error");
                        break;
                    }
                }
            }
            shared.mark_closed();
        });

        *guard = Some(tx.clone());
        Ok(tx)
    }

    async fn call(&self, method: &'static str, params: Value) -> DriverResult<Value> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        let tx = self.writer().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&Command { id, method, params }).map_err(protocol)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, reply_tx);
        if tx.send(text).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(DriverError::Closed);
        }

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(DriverError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(DriverError::Timeout(self.call_timeout, method))
            }
        }
    }
}

#[async_trait]
impl BrowserPage for CdpPage {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn url(&self) -> DriverResult<String> {
        Ok(self.evaluate("() => location.href").await?.as_str().unwrap_or_default().to_string())
    }

    async fn title(&self) -> DriverResult<String> {
        Ok(self.evaluate("() => document.title").await?.as_str().unwrap_or_default().to_string())
    }

    async fn evaluate(&self, script: &str) -> DriverResult<Value> {
        let params = json!({
            "expression": format!("({script})()"),
            "returnByValue": true,
            "awaitPromise": true,
        });
        let raw = self.call("Runtime.evaluate", params).await?;
        let res: EvaluateResult = serde_json::from_value(raw).map_err(protocol)?;
        if let Some(ex) = res.exception {
            return Err(DriverError::Script(ex.message()));
        }
        Ok(res.result.value)
    }

    async fn subscribe_frames(&self, handler: FrameHandler) -> DriverResult<()> {
        self.shared.handlers.lock().push(handler);
        if !self.network_enabled.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.call("Network.enable", json!({})).await {
                self.network_enabled.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn click(&self, selector: &str) -> DriverResult<()> {
        let script = format!(
            "() => {{ const el = document.querySelector({sel}); if (!el) return false; el.click(); return true; }}",
            sel = js_string(selector)
        );
        match self.evaluate(&script).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(DriverError::ElementNotFound(selector.to_string())),
        }
    }

    async fn fill(&self, selector: &str, value: &str) -> DriverResult<()> {
        let script = format!(
            "() => {{ const el = document.querySelector({sel}); if (!el) return false; el.focus(); el.value = {val}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }})); return true; }}",
            sel = js_string(selector),
            val = js_string(value)
        );
        match self.evaluate(&script).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(DriverError::ElementNotFound(selector.to_string())),
        }
    }

    async fn screenshot(&self) -> DriverResult<Vec<u8>> {
        let raw = self.call("Page.captureScreenshot", json!({ "format": "png" })).await?;
        let shot: ScreenshotResult = serde_json::from_value(raw).map_err(protocol)?;
        BASE64.decode(shot.data.as_bytes()).map_err(protocol)
    }

    async fn bring_to_front(&self) -> DriverResult<()> {
        self.call("Page.bringToFront", json!({})).await.map(|_| ())
    }

    async fn close(&self) -> DriverResult<()> {
        self.http
            .get(format!("{}/json/close/{}", self.base, self.id))
            .send()
            .await
            .map_err(transport)?;
        self.shared.mark_closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispatch_routes_replies_and_errors() {
        let shared = PageShared::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        shared.pending.lock().insert(1, tx1);
        shared.pending.lock().insert(2, tx2);

        shared.dispatch(r#"{"id":1,"result":{"result":{"value":3}}}"#);
        shared.dispatch(r#"{"id":2,"error":{"code":-32000,"message":"No node"}}"#);

        assert_eq!(rx1.try_recv().unwrap().unwrap(), json!({"result": {"value": 3}}));
        assert!(matches!(rx2.try_recv().unwrap(), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_dispatch_decodes_text_and_binary_frames() {
        let shared = PageShared::default();
        let seen = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = seen.clone();
        shared.handlers.lock().push(Arc::new(move |b: &[u8]| sink.lock().push(b.to_vec())));

        shared.dispatch(r#"{"method":"Network.webSocketFrameReceived","params":{"requestId":"1","timestamp":1.0,"response":{"opcode":1,"mask":false,"payloadData":"42[\"quotes\",[]]"}}}"#);
        let b64 = BASE64.encode(b"\x04hello");
        shared.dispatch(&format!(
            r#"{{"method":"Network.webSocketFrameReceived","params":{{"response":{{"opcode":2,"payloadData":"{b64}"}}}}}}"#
        ));

        let seen = seen.lock();
        assert_eq!(seen[0], br#"42["quotes",[]]"#.to_vec());
        assert_eq!(seen[1], b"\x04hello".to_vec());
    }

    #[test]
    fn test_detach_fails_pending_calls() {
        let shared = PageShared::default();
        let (tx, mut rx) = oneshot::channel();
        shared.pending.lock().insert(7, tx);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        shared.handlers.lock().push(Arc::new(move |_: &[u8]| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        shared.dispatch(r#"{"method":"Inspector.detached","params":{"reason":"target_closed"}}"#);
        assert!(shared.closed.load(Ordering::SeqCst));
        assert_eq!(rx.try_recv().unwrap(), Err(DriverError::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
