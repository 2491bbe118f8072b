//! A host loop ticking at 60 Hz that serves WebSocket clients between frames.
//!
//! Connect with any WebSocket client, e.g. `websocat ws://127.0.0.1:9002`, and type lines.
use std::time::Duration;

use tickws::{Callbacks, HandshakePolicy, Options, WebSocketServer};

#[tokio::main]
async fn main() -> tickws::Result<()> {
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let mut server = WebSocketServer::new("127.0.0.1", 9002).with_options(
        Options::default()
            .with_handshake_policy(HandshakePolicy::Lenient)
            .with_handshake_timeout(Duration::from_secs(10))
            .with_max_connections(128),
    );
    let addr = server.start().await?;
    log::info!("tick host serving ws://{}", addr);

    let mut callbacks = Callbacks::new();
    callbacks
        .on_open(|conn| log::info!("{} joined", conn))
        .on_message(|message| {
            log::info!("[{}] {}: {}", message.id, message.connection.id, message.data)
        })
        .on_close(|conn| log::info!("{} left", conn));

    let mut tick = tokio::time::interval(Duration::from_secs(1) / 60);
    let mut frame: u64 = 0;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                frame += 1;
                let delivered = server.poll(&mut callbacks);
                if delivered > 0 {
                    log::debug!("frame {}: {} events", frame, delivered);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.shutdown().await;
    server.poll(&mut callbacks);
    Ok(())
}
