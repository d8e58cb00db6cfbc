//! sevo-server: ephemeral voice-message relay.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sevo::server::run().await
}
