//! Expose a local port through a tunnel broker.
//!
//! Usage: expose_local <broker-host> <broker-port> <local-port>

use localgate_client::{TunnelCluster, TunnelConfig, TunnelEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let remote_host = args.next().unwrap_or_else(|| "localhost".to_string());
    let remote_port: u16 = args.next().as_deref().unwrap_or("7070").parse()?;
    let local_port: u16 = args.next().as_deref().unwrap_or("3000").parse()?;

    let config = TunnelConfig::builder()
        .remote(remote_host, remote_port)
        .local_port(local_port)
        .session_expiry(true)
        .build()?;

    let mut handle = TunnelCluster::new(config).open()?;

    while let Some(event) = handle.next_event().await {
        match event {
            TunnelEvent::Open { remote_addr } => {
                println!("tunnel up via {}", remote_addr);
            }
            TunnelEvent::Request { method, path } => {
                println!("{} {}", method, path);
            }
            TunnelEvent::Dead => {
                println!("tunnel closed");
                break;
            }
            TunnelEvent::Error(e) => {
                eprintln!("tunnel failed: {}", e);
                break;
            }
        }
    }

    Ok(())
}
