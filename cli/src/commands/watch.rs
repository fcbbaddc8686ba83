use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use config::notifications::NotificationHandler;
use config::{NotificationMessage, NotificationServer};
use tokio::net::TcpListener;

use super::GlobalArgs;
use crate::output;

#[derive(Args)]
pub struct WatchArgs {
    /// WebSocket listen address (default: STRATA_WS_BIND or 127.0.0.1:8765)
    #[arg(long)]
    pub bind: Option<String>,

    /// Do not start the WebSocket server
    #[arg(long)]
    pub no_server: bool
}

fn print_notification(message: &NotificationMessage) -> anyhow::Result<()> {
    println!(
        "[{}] {} {}: {}",
        message.timestamp, message.level, message.kind, message.message
    );
    Ok(())
}

pub async fn run(args: WatchArgs, global: &GlobalArgs) -> Result<()> {
    let system = global.system()?;
    system.load()?;
    let handler: Arc<dyn NotificationHandler> = Arc::new(print_notification);
    system.notifications().add_handler(handler);
    system.start_watching()?;
    output::info(&format!(
        "Watching {} ({} environment)",
        system.settings().config_dir.display(),
        system.settings().environment
    ));

    let server = if args.no_server {
        None
    } else {
        let bind = args.bind.unwrap_or_else(|| system.settings().ws_bind.clone());
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("cannot listen on {bind}"))?;
        output::info(&format!("Notifications on ws://{}", listener.local_addr()?));
        let server = Arc::new(NotificationServer::new(Arc::clone(system.notifications())));
        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move { serving.serve(listener).await });
        Some((server, task))
    };

    tokio::signal::ctrl_c().await?;
    output::info("Shutting down");
    system.stop_watching();
    if let Some((server, task)) = server {
        server.shutdown();
        task.await??;
    }
    Ok(())
}
