use std::env;

use meshroom::signaling::relay::SignalingRelay;
use tokio::net::TcpListener;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), meshroom::error::Error> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = env::var("SIGNALING_ADDR").unwrap_or_else(|_| "0.0.0.0:4000".to_string());
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("signaling relay listening on {}", addr);

    let relay = SignalingRelay::new();
    relay.serve(listener).await
}
