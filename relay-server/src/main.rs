use std::sync::Arc;

use relay_server::{flags, http, RoomManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Transport listen address for game sessions.
const KCP_ADDR: &str = "127.0.0.1:10000";

/// Control-plane listen address.
const HTTP_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
/// Activates tracing, binds the KCP listener (a bind failure aborts the
/// process), creates the debug test room when DEBUG is set, serves the
/// control plane in the background and then runs the accept loop forever.
async fn main() {
    let default_level = if flags::in_debug() { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("relay_server={default_level},transport={default_level}").into()
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let kcp_addr = KCP_ADDR.parse().expect("fixed addr");
    let manager = Arc::new(
        RoomManager::bind(kcp_addr)
            .await
            .expect("bind KCP listener"),
    );
    if flags::in_debug() {
        manager.create_test_room().await;
    }

    let http_addr = HTTP_ADDR.parse().expect("fixed addr");
    let http_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(err) = http::serve(http_manager, http_addr).await {
            tracing::error!(source = "Http", error = %err, "control plane failed");
        }
    });

    tracing::info!(source = "RoomManager", addr = %kcp_addr, "start KCP");
    if let Err(err) = manager.listen().await {
        tracing::error!(source = "RoomManager", error = %err, "accept loop failed");
        std::process::exit(1);
    }
}
