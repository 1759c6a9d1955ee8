//! Basic image registry server example
//!
//! Run with: cargo run -p image-registry --example basic_server

use image_registry::RegistryBuilder;
use storage::MemoryStorage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let app = RegistryBuilder::new()
        .storage(MemoryStorage::new().into())
        .build();

    let addr = "127.0.0.1:9292";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Image registry listening on http://{}", addr);
    tracing::info!(
        "Try: curl -i -X POST -H 'x-image-meta-name: demo' \
         -H 'content-type: application/octet-stream' --data-binary @disk.img http://{}/images",
        addr
    );

    axum::serve(listener, app).await?;

    Ok(())
}
