use std::time::{Duration, Instant};

use latica::{EngineChannels, EngineEvent, PublishOptions};
use serde::Serialize;

use crate::common::{ctrl_c, elapsed_s};
use crate::events::{emit, engine_event, EventStarted};

pub struct PublishConfig {
    pub secret: String,
    pub message: String,
    /// Keep relaying this long so the flood and any sync requests get served.
    pub linger: Duration,
}

#[derive(Serialize)]
struct EventPublished {
    event: &'static str,
    packet_id: String,
    subcluster_id: String,
    bytes: usize,
    elapsed_s: f64,
}

pub async fn run(
    mut channels: EngineChannels,
    config: PublishConfig,
    start: Instant,
) -> anyhow::Result<()> {
    let handle = channels.handle.clone();
    emit(&EventStarted::new(&handle.peer_id(), "publish"));

    let subcluster = handle.join(&config.secret).await?;
    let packet_id = handle
        .publish(
            subcluster,
            config.message.clone().into_bytes(),
            PublishOptions::default(),
        )
        .await?;

    emit(&EventPublished {
        event: "published",
        packet_id: hex::encode(packet_id),
        subcluster_id: hex::encode(subcluster),
        bytes: config.message.len(),
        elapsed_s: elapsed_s(start),
    });

    let deadline = tokio::time::sleep(config.linger);
    tokio::pin!(deadline);
    let shutdown = ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut shutdown => break,
            event = channels.events.recv() => match event {
                Some(
                    event @ (EngineEvent::Ready { .. }
                    | EngineEvent::Error { .. }
                    | EngineEvent::Warning { .. }),
                ) => {
                    emit(&engine_event(&event, elapsed_s(start)));
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    let info = handle.info().await?;
    if info.unpublished > 0 {
        eprintln!(
            "{} packet(s) not yet handed to any peer; they are kept in --state if set",
            info.unpublished
        );
    }
    Ok(())
}
