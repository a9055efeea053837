//! Binary entry point: wires config, engine, gateway, FIX acceptor, the
//! engine event drain, and the operational HTTP API.

use atlas_trading_engine::acceptor::run_acceptor;
use atlas_trading_engine::api;
use atlas_trading_engine::engine::{EngineEvent, MatchingEngine};
use atlas_trading_engine::gateway::Gateway;
use atlas_trading_engine::EngineConfig;
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = EngineConfig::from_env();
    info!("starting with config: {:?}", config);

    let (engine, events) = MatchingEngine::new(config.risk_limits());
    let engine = Arc::new(engine);
    engine.start();

    let gateway = Arc::new(Gateway::new(engine.clone()));
    let running = Arc::new(AtomicBool::new(true));

    let state = api::create_app_state(engine.clone(), gateway.clone());

    // Engine event drain: execution reports go to the gateway, market data
    // to the WebSocket topic, errors to the log.
    {
        let gateway = gateway.clone();
        let market_data_tx = state.market_data_tx.clone();
        let running = running.clone();
        std::thread::Builder::new()
            .name("event-drain".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    match events.recv_timeout(Duration::from_millis(200)) {
                        Ok(EngineEvent::MarketData(snapshot)) => {
                            let _ = market_data_tx.send(snapshot);
                        }
                        Ok(event) => gateway.on_engine_event(&event),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("spawn event drain");
    }

    // FIX acceptor on its own thread; it blocks on accept.
    {
        let addr = format!("0.0.0.0:{}", config.listen_port);
        let listener = match std::net::TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!("cannot bind FIX listener on {}: {}", addr, e);
                return;
            }
        };
        info!("FIX listener on {}", addr);
        let gateway = gateway.clone();
        let codec = config.codec();
        let heartbeat = config.heartbeat_interval();
        let running = running.clone();
        std::thread::Builder::new()
            .name("fix-acceptor".to_string())
            .spawn(move || {
                run_acceptor(listener, gateway, codec, "ATLAS".to_string(), heartbeat, running);
            })
            .expect("spawn acceptor");
    }

    let api_addr = format!("0.0.0.0:{}", config.api_port);
    let listener = match tokio::net::TcpListener::bind(&api_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind API listener on {}: {}", api_addr, e);
            return;
        }
    };
    info!("API listening on http://{}", api_addr);
    let app = api::create_router(state);
    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("API server failed: {}", e);
    }

    running.store(false, Ordering::Release);
    engine.stop();
}
