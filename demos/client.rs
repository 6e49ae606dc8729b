use sockwave::{connect_with_options, CloseCode, CompressionOptions, ConnectOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let options = ConnectOptions {
        compression: Some(CompressionOptions::default()),
        ..Default::default()
    };
    let conn = connect_with_options("ws://127.0.0.1:9001", options).await?;

    conn.write("hello over websocket").await?;
    let reply = conn.read().await?;
    println!("received: {reply:?}");

    conn.close(CloseCode::NORMAL, "done").await?;
    Ok(())
}
