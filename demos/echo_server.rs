use log::{error, info};
use sockwave::{accept_with_options, AcceptOptions, CompressionOptions};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let listener = TcpListener::bind("127.0.0.1:9001").await?;
    info!("echo server listening on ws://127.0.0.1:9001");

    loop {
        let (stream, addr) = listener.accept().await?;
        tokio::spawn(async move {
            let options = AcceptOptions {
                compression: Some(CompressionOptions::default()),
                insecure_skip_verify: true,
                ..Default::default()
            };
            let conn = match accept_with_options(stream, options).await {
                Ok(conn) => conn,
                Err(error) => {
                    error!("handshake with {addr} failed: {error}");
                    return;
                }
            };
            info!("{addr} connected");

            loop {
                match conn.read().await {
                    Ok(message) => {
                        if let Err(error) = conn.write(message).await {
                            error!("write to {addr} failed: {error}");
                            break;
                        }
                    }
                    Err(error) => {
                        info!("{addr} disconnected: {error}");
                        break;
                    }
                }
            }
        });
    }
}
