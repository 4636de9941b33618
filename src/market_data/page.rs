// JS snippets evaluated inside the broker page, plus the Rust-side parsing
// of what they return. Every snippet is a one-argument function applied to
// a JSON literal so nothing user-supplied is spliced into code. Each one
// carries a `bf:` marker comment so scripted pages can answer it.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::market_data::profile::BrokerProfile;

pub mod marker {
    pub const CURRENT_ASSET: &str = "bf:current-asset";
    pub const DOM_PAYOUT: &str = "bf:dom-payout";
    pub const DOM_TEXT: &str = "bf:dom-text";
    pub const CHART_ENGINE: &str = "bf:chart-engine";
    pub const PAGE_GLOBALS: &str = "bf:page-globals";
    pub const OBJECT_SCAN: &str = "bf:object-scan";
    pub const HOOK_INSTALL: &str = "bf:hook-install";
    pub const HOOK_DRAIN: &str = "bf:hook-drain";
    pub const PICK_RESULT: &str = "bf:pick-result";
    pub const PROBE: &str = "bf:probe";
}

fn apply(script: &str, args: Value) -> String {
    format!("() => ({script})({args})")
}

const CURRENT_ASSET: &str = r#"(a) => { /* bf:current-asset */
  for (const sel of a.selectors) {
    try {
      const el = document.querySelector(sel);
      const text = el && (el.innerText || el.textContent || '').trim();
      if (text) return a.firstWord ? text.split(/\s+/)[0] : text;
    } catch (e) {}
  }
  return null;
}"#;

const DOM_PAYOUT: &str = r#"(a) => { /* bf:dom-payout */
  for (const sel of a.selectors) {
    try {
      const el = document.querySelector(sel);
      if (!el) continue;
      const v = parseFloat((el.innerText || el.textContent || '').replace('%', '').replace('+', '').trim());
      if (!isNaN(v)) return v;
    } catch (e) {}
  }
  return null;
}"#;

const DOM_TEXT: &str = r#"(a) => { /* bf:dom-text */
  const texts = [];
  try {
    for (const el of document.querySelectorAll('[class*="price"], [class*="Price"], [id*="price"]')) {
      if (texts.length >= a.maxElements) break;
      const t = (el.textContent || '').trim();
      if (t && t.length < 64) texts.push(t);
    }
  } catch (e) {}
  let body = '';
  try { body = ((document.body && document.body.innerText) || '').slice(0, a.maxBody); } catch (e) {}
  return { texts, body };
}"#;

const CHART_ENGINE: &str = r#"async (a) => { /* bf:chart-engine */
  const api = window.widget || (window.tradingView && window.tradingView.activeChart && window.tradingView.activeChart());
  if (!api || typeof api.getBars !== 'function') return null;
  const symbol = typeof api.getSymbol === 'function' ? api.getSymbol() : undefined;
  const resolution = typeof api.resolution === 'function' ? api.resolution() : undefined;
  return await new Promise((resolve) => {
    try {
      api.getBars(symbol, resolution, { from: 0, to: Math.floor(Date.now() / 1000) },
        (bars) => resolve(Array.isArray(bars) && bars.length ? bars.slice(-a.maxBars) : null),
        () => resolve(null));
    } catch (e) { resolve(null); }
  });
}"#;

const PAGE_GLOBALS: &str = r#"(a) => { /* bf:page-globals */
  const sources = [
    () => window.tvWidget?.chart?.().getSeries?.()?.data?.()?.get?.(),
    () => window.tradingView?.activeChart?.().getSeries?.()?.data?.()?.get?.(),
    () => window.candles?.find?.((c) => c.asset === a.asset)?.data,
    () => window.__QUOTEX_DATA?.candles,
    () => window.chartData,
    () => window.candlesData,
  ];
  for (const src of sources) {
    try {
      const rows = src();
      if (Array.isArray(rows) && rows.length > 10) return rows.slice(-a.maxBars);
    } catch (e) {}
  }
  return null;
}"#;

const OBJECT_SCAN: &str = r#"(a) => { /* bf:object-scan */
  const KEYS = ['time', 't', 'timestamp', 'open', 'o', 'high', 'h', 'low', 'l', 'close', 'c', 'volume', 'v'];
  const out = [];
  const seen = new WeakSet();
  let nodes = 0;
  const pick = (o) => { const r = {}; for (const k of KEYS) { if (k in o) r[k] = o[k]; } return r; };
  const tail = (arr) => arr.slice(-a.maxBars);
  const visit = (obj, depth) => {
    if (out.length >= a.maxCandidates || nodes >= a.maxNodes) return;
    if (!obj || typeof obj !== 'object' || seen.has(obj)) return;
    seen.add(obj);
    nodes++;
    try {
      if (Array.isArray(obj)) {
        if (obj.length >= a.minLength) {
          const first = obj[0];
          if (Array.isArray(first)) { out.push(tail(obj).map((r) => Array.isArray(r) ? r.slice(0, 6) : null)); return; }
          if (first && typeof first === 'object') { out.push(tail(obj).map((r) => (r && typeof r === 'object') ? pick(r) : null)); return; }
        }
        if (depth < a.maxDepth) { for (let i = 0; i < Math.min(obj.length, 50); i++) visit(obj[i], depth + 1); }
        return;
      }
      if (Array.isArray(obj.open) && Array.isArray(obj.close) && obj.open.length >= a.minLength) {
        const cols = {};
        for (const k of KEYS) { if (Array.isArray(obj[k])) cols[k] = tail(obj[k]); }
        out.push(cols);
        return;
      }
      if (depth >= a.maxDepth) return;
      for (const key of Object.keys(obj)) {
        let v;
        try { v = obj[key]; } catch (e) { continue; }
        visit(v, depth + 1);
      }
    } catch (e) {}
  };
  visit(window, 0);
  return out;
}"#;

const HOOK_INSTALL: &str = r#"(a) => { /* bf:hook-install */
  if (window.__bfHook) return false;
  const Native = window.WebSocket;
  if (!Native) return false;
  window.__bfFrames = [];
  const push = (data) => {
    const buf = window.__bfFrames;
    if (buf.length >= a.maxBuffer) buf.shift();
    buf.push(data);
  };
  const decoder = new TextDecoder('utf-8');
  function Hooked(...args) {
    const ws = new Native(...args);
    ws.addEventListener('message', (ev) => {
      try {
        if (typeof ev.data === 'string') push(ev.data);
        else if (ev.data instanceof ArrayBuffer) push(decoder.decode(ev.data));
        else if (ev.data && typeof ev.data.text === 'function') ev.data.text().then(push).catch(() => {});
      } catch (e) {}
    });
    return ws;
  }
  Hooked.prototype = Native.prototype;
  Object.assign(Hooked, { CONNECTING: 0, OPEN: 1, CLOSING: 2, CLOSED: 3 });
  window.WebSocket = Hooked;
  window.__bfHook = true;
  return true;
}"#;

pub const HOOK_DRAIN: &str =
    "() => { /* bf:hook-drain */ const f = window.__bfFrames || []; window.__bfFrames = []; return f; }";

const PICK_RESULT: &str = r#"(a) => { /* bf:pick-result */
  const needle = a.text.toLowerCase();
  for (const sel of a.containers) {
    let els;
    try { els = document.querySelectorAll(sel); } catch (e) { continue; }
    for (const el of els) {
      const t = (el.innerText || el.textContent || '').trim();
      if (t && t.length < 80 && t.toLowerCase().includes(needle) && el.offsetParent !== null) {
        el.click();
        return t;
      }
    }
  }
  return null;
}"#;

pub const PROBE: &str = "() => /* bf:probe */ document.readyState";

pub fn current_asset_script(profile: &BrokerProfile) -> String {
    apply(
        CURRENT_ASSET,
        json!({ "selectors": profile.asset_name_selectors, "firstWord": profile.asset_name_first_word }),
    )
}

pub fn dom_payout_script(profile: &BrokerProfile) -> String {
    apply(DOM_PAYOUT, json!({ "selectors": profile.payout_selectors }))
}

pub fn dom_text_script() -> String {
    apply(DOM_TEXT, json!({ "maxElements": 400, "maxBody": 200_000 }))
}

pub fn chart_engine_script(max_bars: usize) -> String {
    apply(CHART_ENGINE, json!({ "maxBars": max_bars }))
}

pub fn page_globals_script(asset: &str, max_bars: usize) -> String {
    apply(PAGE_GLOBALS, json!({ "asset": asset, "maxBars": max_bars }))
}

#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub min_length: usize,
    pub max_depth: u32,
    pub max_nodes: u32,
    pub max_bars: usize,
}

pub fn object_scan_script(limits: ScanLimits) -> String {
    apply(
        OBJECT_SCAN,
        json!({
            "minLength": limits.min_length,
            "maxDepth": limits.max_depth,
            "maxNodes": limits.max_nodes,
            "maxBars": limits.max_bars,
            "maxCandidates": 32,
        }),
    )
}

pub fn hook_install_script(max_buffer: usize) -> String {
    apply(HOOK_INSTALL, json!({ "maxBuffer": max_buffer }))
}

pub fn pick_result_script(profile: &BrokerProfile, text: &str) -> String {
    apply(PICK_RESULT, json!({ "containers": profile.result_containers, "text": text }))
}

/// What `dom_text_script` returns.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomText {
    #[serde(default)]
    pub texts: Vec<String>,
    #[serde(default)]
    pub body: String,
}

macro_rules! re {
    ($pat:expr) => {
        LazyLock::new(|| Regex::new($pat).unwrap())
    };
}

static RE_LABELLED: LazyLock<Regex> = re!(r"(?i)(?:Precio|Price|Bid|Ask|Rate)\s*[:\s]+\s*([0-9]{1,6}\.[0-9]{3,6})\b");
static RE_TOKEN: LazyLock<Regex> = re!(r"\b([0-9]{1,6}\.[0-9]{4,6})\b");

fn plausible(p: f64) -> bool {
    p.is_finite() && p > 0.0001 && p < 10_000.0
}

fn first_match(re: &Regex, text: &str) -> Option<f64> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .find(|p| plausible(*p))
}

/// Best guess at the displayed price: labelled values anywhere first, then
/// bare 4-6 decimal tokens from price-like elements, then from the body.
pub fn mine_price(dom: &DomText) -> Option<f64> {
    dom.texts
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(dom.body.as_str()))
        .find_map(|t| first_match(&RE_LABELLED, t))
        .or_else(|| dom.texts.iter().find_map(|t| first_match(&RE_TOKEN, t)))
        .or_else(|| first_match(&RE_TOKEN, &dom.body))
}
