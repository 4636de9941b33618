// Source: Chrome DevTools Protocol, HTTP discovery endpoints (/json/*) and
// the Runtime / Network / Page domains.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// GET /json/version
#[derive(Debug, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: Option<String>,
}

// GET /json/list, one entry per target
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: Option<String>,
}

impl TargetInfo {
    pub fn is_page(&self) -> bool {
        self.kind == "page"
    }
}

#[derive(Debug, Serialize)]
pub struct Command<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

// Anything the target sends: a reply (id set) or an event (method set)
#[derive(Debug, Deserialize)]
pub struct Incoming {
    pub id: Option<u64>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
    pub result: Option<Value>,
    pub error: Option<CdpError>,
}

#[derive(Debug, Deserialize)]
pub struct CdpError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

// Runtime.evaluate result
#[derive(Debug, Deserialize)]
pub struct EvaluateResult {
    pub result: RemoteObject,
    #[serde(rename = "exceptionDetails")]
    pub exception: Option<ExceptionDetails>,
}

#[derive(Debug, Deserialize)]
pub struct RemoteObject {
    #[serde(default)]
    pub value: Value,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExceptionDetails {
    #[serde(default)]
    pub text: String,
    pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    pub fn message(&self) -> String {
        self.exception
            .as_ref()
            .and_then(|e| e.description.clone())
            .unwrap_or_else(|| self.text.clone())
    }
}

// Network.webSocketFrameReceived params
#[derive(Debug, Deserialize)]
pub struct WebSocketFrameReceived {
    pub response: WebSocketFrame,
}

#[derive(Debug, Deserialize)]
pub struct WebSocketFrame {
    // 1 = text, 2 = binary (payloadData is base64)
    pub opcode: u8,
    #[serde(rename = "payloadData", default)]
    pub payload_data: String,
}

// Page.captureScreenshot result
#[derive(Debug, Deserialize)]
pub struct ScreenshotResult {
    pub data: String,
}
