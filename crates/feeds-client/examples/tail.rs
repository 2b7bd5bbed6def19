//! Print a feed's recent history, then follow it live.
//!
//! ```sh
//! cargo run -p feeds-client --example tail -- <BASE_URL> <FEED> [AUTH_ENDPOINT] [USER_ID]
//! ```
//!
//! Each item is printed to stdout as one JSON line (pipe to `jq` for
//! formatting). Set `RUST_LOG=feeds_client=debug` to watch reconnects.

use feeds_client::{ClientConfig, Event, FeedsClient, Listeners};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let usage = "usage: tail <BASE_URL> <FEED> [AUTH_ENDPOINT] [USER_ID]";
    let base_url = args.next().ok_or(usage)?;
    let feed_name = args.next().ok_or(usage)?;

    let mut config = ClientConfig::new(base_url);
    if let Some(endpoint) = args.next() {
        config = config.with_auth(endpoint);
    }
    let client = FeedsClient::new(config)?;
    if let Some(user_id) = args.next() {
        client.set_user_id(&user_id)?;
    }

    let feed = client.feed(&feed_name)?;
    let (listeners, mut events) = Listeners::channel();
    feed.subscribe(listeners, None).await?;

    while let Some(event) = events.recv().await {
        match event {
            Event::Open => tracing::info!(feed = %feed_name, "Following"),
            Event::Message(item) => println!("{}", serde_json::to_string(&item)?),
            Event::Error(e) => {
                eprintln!("Subscription ended: {e}");
                break;
            }
        }
    }
    Ok(())
}
