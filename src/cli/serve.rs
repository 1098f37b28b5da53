//! Serve command - run the control plane until Ctrl-C.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::helpers::App;
use crate::bus::{Event, EventKind};
use crate::ipc::{AutomationServer, HandlerRegistry, SystemAutomation};
use crate::logging;
use crate::sandbox::SandboxMonitor;
use crate::supervisor::{BridgeManager, GatewayFleet, ProcessStatus};

pub async fn cmd_serve(gateways: Vec<String>, bridge: Option<String>, no_automation: bool) -> Result<()> {
    let app = App::load()?;
    logging::init_logging(&app.cfg)?;

    app.bus.subscribe(EventKind::SandboxesRefreshed, |event| {
        if let Event::SandboxesRefreshed { sandboxes } = event {
            tracing::debug!(count = sandboxes.len(), "Sandboxes refreshed");
        }
    });

    let mut monitor = SandboxMonitor::new(Arc::clone(&app.registry), app.cfg.sandbox.poll_interval());
    monitor.start();

    let automation = if no_automation {
        None
    } else {
        let server = AutomationServer::new(
            app.cfg.automation.host.clone(),
            app.cfg.automation.port,
            HandlerRegistry::with_automation(Arc::new(SystemAutomation::new())),
        );
        server.start().await?;
        Some(server)
    };

    let fleet = GatewayFleet::new(
        Arc::clone(&app.registry),
        Arc::clone(&app.ports),
        Arc::clone(&app.bus),
        app.cfg.gateway.settings(),
    );
    fleet.on_status(|sandbox, status, message| match status {
        ProcessStatus::Error => {
            error!(sandbox = %sandbox, reason = message.unwrap_or_default(), "Gateway failed")
        }
        _ => info!(sandbox = %sandbox, status = %status, "Gateway status changed"),
    });

    app.bus.publish(Event::AppStarted);

    for sandbox in &gateways {
        if !fleet.start(sandbox, None).await {
            warn!(sandbox = %sandbox, "Gateway did not start");
        } else if !fleet.is_reachable(sandbox).await {
            warn!(sandbox = %sandbox, "Gateway is running but not answering WebSocket handshakes yet");
        }
    }

    let bridge_manager = match (bridge, automation.as_ref()) {
        (Some(sandbox), Some(server)) => {
            let port = match server.local_addr().await {
                Some(addr) => addr.port(),
                None => app.cfg.automation.port,
            };
            let manager = BridgeManager::new(
                Arc::clone(&app.registry),
                Arc::clone(&app.ports),
                Arc::clone(&app.bus),
                app.cfg.bridge.settings(),
                port,
            );
            if !manager.start(&sandbox).await {
                warn!(sandbox = %sandbox, "Bridge did not start");
            }
            Some(manager)
        }
        (Some(sandbox), None) => {
            warn!(sandbox = %sandbox, "Bridge needs the automation server; not starting it");
            None
        }
        _ => None,
    };

    info!(gateways = gateways.len(), "Control plane running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(manager) = &bridge_manager {
        manager.stop().await;
    }
    fleet.stop_all().await;
    if let Some(server) = &automation {
        server.stop().await;
    }
    monitor.stop().await;
    app.bus.publish(Event::AppShutdown);
    Ok(())
}
