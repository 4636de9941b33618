// The session loop: one OS thread, one current-thread runtime, one LocalSet.
// Every browser call happens on it. Consumers only ever hold the facade.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio::task::{spawn_local, LocalSet};
use tracing::{error, info};

use crate::browser::BrowserDriver;
use crate::config::FeedConfig;
use crate::error::FeedResult;
use crate::market_data::cache::MarketCaches;
use crate::market_data::cascade::AcquisitionCascade;
use crate::market_data::discovery::AssetDiscovery;
use crate::market_data::facade::MarketDataFacade;
use crate::market_data::interceptor::FrameInterceptor;
use crate::market_data::navigator::{ChartControl, PageNavigator};
use crate::market_data::profile::BrokerProfile;
use crate::market_data::router::{dispatch, SessionRequest, SessionServices};
use crate::market_data::secondary::PageHookFeed;
use crate::session::controller::SessionController;
use crate::session::PageSlot;

pub struct SessionLoop {
    facade: MarketDataFacade,
    thread: JoinHandle<()>,
}

impl SessionLoop {
    /// Build the whole object graph, start the loop thread and kick off the
    /// initial connect (and discovery, when enabled). Returns at once; the
    /// facade degrades locally until the session comes up. Rejects an
    /// invalid config before anything starts.
    pub fn spawn(cfg: FeedConfig, driver: Arc<dyn BrowserDriver>) -> FeedResult<Self> {
        cfg.validate()?;
        let caches = Arc::new(MarketCaches::new());
        let interceptor = Arc::new(FrameInterceptor::new(cfg.broker, caches.clone()));
        let hook = Arc::new(PageHookFeed::new(cfg.broker));
        let slot = PageSlot::new();
        let controller = Arc::new(SessionController::new(
            cfg.clone(),
            driver,
            slot.clone(),
            interceptor.clone(),
            hook.clone(),
        ));
        let navigator = Arc::new(PageNavigator::new(
            slot.clone(),
            BrokerProfile::for_variant(cfg.broker),
            caches.clone(),
            cfg.discovery.clone(),
            cfg.connect.call_timeout(),
        ));
        let discovery = Arc::new(AssetDiscovery::new(
            navigator.clone(),
            navigator.clone(),
            caches.clone(),
            cfg.discovery.clone(),
            cfg.cascade.poll_interval(),
        ));
        let cascade = Arc::new(AcquisitionCascade::new(
            &cfg,
            caches,
            slot,
            hook.clone(),
            navigator.clone() as Arc<dyn ChartControl>,
        ));

        let (tx, rx) = mpsc::channel(cfg.facade.queue_depth.max(1));
        let facade = MarketDataFacade::new(tx, interceptor, hook.caches().clone(), controller.subscribe(), cfg.clone());
        let services = Arc::new(SessionServices { controller, cascade, navigator, discovery });

        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let discover_at_startup = cfg.discovery.run_at_startup;
        let thread = std::thread::Builder::new()
            .name("brokerfeed-session".into())
            .spawn(move || {
                let local = LocalSet::new();
                local.block_on(&rt, serve(services, rx, discover_at_startup));
                info!("session loop stopped");
            })?;
        Ok(Self { facade, thread })
    }

    pub fn facade(&self) -> MarketDataFacade {
        self.facade.clone()
    }

    /// Drop this handle's facade and wait for the loop thread. Returns once
    /// every other facade clone is gone too.
    pub fn join(self) {
        drop(self.facade);
        if self.thread.join().is_err() {
            error!("session loop thread panicked");
        }
    }
}

async fn serve(services: Arc<SessionServices>, mut rx: mpsc::Receiver<SessionRequest>, discover_at_startup: bool) {
    spawn_local(services.controller.clone().run_health_loop());

    let startup = services.clone();
    spawn_local(async move {
        let connected = startup.controller.connect().await;
        if connected && discover_at_startup {
            let outcome = startup.discovery.run().await;
            info!(?outcome, "startup discovery finished");
        }
    });

    while let Some(request) = rx.recv().await {
        spawn_local(dispatch(services.clone(), request));
    }
}
