// Requests the facade marshals onto the session loop, and the dispatcher
// that serves them there. Each request carries its own reply channel; a
// caller that gave up simply drops the receiver.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::market_data::cascade::AcquisitionCascade;
use crate::market_data::discovery::{AssetDiscovery, DiscoveryOutcome};
use crate::market_data::navigator::{ChartControl, PageNavigator, PayoutOracle};
use crate::market_data::types::{Acquisition, Timeframe};
use crate::session::controller::SessionController;

#[derive(Debug)]
pub enum SessionRequest {
    Acquire {
        instrument: String,
        tf: Timeframe,
        reply: oneshot::Sender<Acquisition>,
    },
    CurrentPrice {
        instrument: String,
        reply: oneshot::Sender<Option<f64>>,
    },
    Payout {
        instrument: String,
        reply: oneshot::Sender<Option<f64>>,
    },
    Switch {
        instrument: String,
        reply: oneshot::Sender<bool>,
    },
    CurrentInstrument {
        reply: oneshot::Sender<Option<String>>,
    },
    Screenshot {
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Discover {
        reply: oneshot::Sender<DiscoveryOutcome>,
    },
    /// Reply says whether a new connect loop was started.
    Reconnect {
        reply: Option<oneshot::Sender<bool>>,
    },
}

impl SessionRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionRequest::Acquire { .. } => "acquire",
            SessionRequest::CurrentPrice { .. } => "current_price",
            SessionRequest::Payout { .. } => "payout",
            SessionRequest::Switch { .. } => "switch",
            SessionRequest::CurrentInstrument { .. } => "current_instrument",
            SessionRequest::Screenshot { .. } => "screenshot",
            SessionRequest::Discover { .. } => "discover",
            SessionRequest::Reconnect { .. } => "reconnect",
        }
    }
}

/// Everything a request can touch. Lives on the session loop.
pub struct SessionServices {
    pub controller: Arc<SessionController>,
    pub cascade: Arc<AcquisitionCascade>,
    pub navigator: Arc<PageNavigator>,
    pub discovery: Arc<AssetDiscovery<PageNavigator, PageNavigator>>,
}

fn send<T>(reply: oneshot::Sender<T>, value: T, kind: &'static str) {
    if reply.send(value).is_err() {
        debug!(kind, "caller gone before reply");
    }
}

/// Serve one request. Spawned per request on the session loop.
pub async fn dispatch(services: Arc<SessionServices>, request: SessionRequest) {
    let kind = request.kind();
    trace!(kind, "session request");
    match request {
        SessionRequest::Acquire { instrument, tf, reply } => {
            let got = services.cascade.acquire(&instrument, tf).await;
            send(reply, got, kind);
        }
        SessionRequest::CurrentPrice { instrument, reply } => {
            let price = services.cascade.page_price(&instrument).await;
            send(reply, price, kind);
        }
        SessionRequest::Payout { instrument, reply } => {
            let payout = services.navigator.payout(&instrument).await;
            send(reply, payout, kind);
        }
        SessionRequest::Switch { instrument, reply } => {
            let ok = services.navigator.switch_to(&instrument).await;
            send(reply, ok, kind);
        }
        SessionRequest::CurrentInstrument { reply } => {
            let shown = services.navigator.current_instrument().await;
            send(reply, shown, kind);
        }
        SessionRequest::Screenshot { reply } => {
            let png = services.controller.screenshot().await;
            send(reply, png, kind);
        }
        SessionRequest::Discover { reply } => {
            let outcome = services.discovery.run().await;
            send(reply, outcome, kind);
        }
        SessionRequest::Reconnect { reply } => {
            let started = services.controller.spawn_reconnect();
            if let Some(reply) = reply {
                send(reply, started, kind);
            }
        }
    }
}
