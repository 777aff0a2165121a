use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chunkstream::config::ChunkConfig;
use chunkstream::receiver::{FrameHandler, FrameRelease, Receiver};
use chunkstream::sender::Sender;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let config = ChunkConfig::new(5 * 1024 * 1024);

    let receiver = Arc::new(Receiver::new(9200, Some(Arc::new(PrintingHandler {})), config.clone()).await?);
    let cloned_receiver = receiver.clone();
    tokio::spawn(async move { cloned_receiver.run().await });

    let remote = SocketAddr::from_str("127.0.0.1:9200")?;
    let sender = Arc::new(Sender::new(remote, config).await?);
    let cloned_sender = sender.clone();
    tokio::spawn(async move { cloned_sender.run().await });

    // a frame roughly the size of an uncompressed 1080p video frame
    let frame: Vec<u8> = (0..2 * 1024 * 1024).map(|i| i as u8).collect();
    for _ in 0..100 {
        sender.send(&frame).await?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    info!(
        "delivered {} frames, dropped {}",
        receiver.frame_count(),
        receiver.drop_count()
    );

    receiver.stop();
    sender.stop();
    Ok(())
}

struct PrintingHandler {}

#[async_trait::async_trait]
impl FrameHandler for PrintingHandler {
    async fn on_frame(&self, data: Vec<u8>, release: FrameRelease) {
        info!("received frame of {} bytes", data.len());
        release.release();
    }
}
