//! JSON-lines notification stream.

use anyhow::Context;
use nstopo::Notification;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::Receiver;

pub type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// stdout, or a TCP connection to `addr`.
pub async fn open(addr: Option<&str>) -> anyhow::Result<Writer> {
    match addr {
        Some(addr) => {
            let stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("connecting to {addr}"))?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write every notification as one JSON object per line until the channel
/// closes or the writer fails.
pub async fn forward(mut rx: Receiver<Notification>, mut writer: Writer) {
    while let Some(notification) = rx.recv().await {
        if let Err(e) = write_line(&mut writer, &notification).await {
            tracing::error!(error = %e, "event stream closed");
            return;
        }
    }
    let _ = writer.flush().await;
}

async fn write_line(writer: &mut Writer, notification: &Notification) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(notification)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
