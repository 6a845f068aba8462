use std::time::Instant;

use latica::{EngineChannels, EngineEvent};

use crate::common::{ctrl_c, elapsed_s};
use crate::events::{emit, engine_event, EventStarted, EventSummary};

/// Print engine events until Ctrl+C or engine shutdown.
///
/// With a secret, joins that subcluster and prints only its messages;
/// without one, prints every event.
pub async fn run(
    mut channels: EngineChannels,
    secret: Option<String>,
    start: Instant,
) -> anyhow::Result<()> {
    let handle = channels.handle.clone();
    let subcluster = match &secret {
        Some(secret) => Some(handle.join(secret).await?),
        None => None,
    };

    let mode = if subcluster.is_some() { "listen" } else { "run" };
    emit(&EventStarted::new(&handle.peer_id(), mode));
    if let Some(id) = subcluster {
        eprintln!("Listening on subcluster {}", hex::encode(id));
    }
    eprintln!("Press Ctrl+C to stop.\n");

    let mut received: u64 = 0;
    let shutdown = ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            event = channels.events.recv() => match event {
                Some(event) => event,
                None => {
                    eprintln!("engine stopped");
                    break;
                }
            },
        };

        let show = match (&event, subcluster) {
            (_, None) => true,
            (EngineEvent::Packet(p) | EngineEvent::Stream(p), Some(id)) => p.subcluster_id == id,
            (EngineEvent::Error { .. } | EngineEvent::Ready { .. }, Some(_)) => true,
            _ => false,
        };
        if matches!(event, EngineEvent::Packet(_) | EngineEvent::Stream(_)) && show {
            received += 1;
        }
        if show {
            emit(&engine_event(&event, elapsed_s(start)));
        }
    }

    emit(&EventSummary {
        event: "summary",
        received,
        elapsed_s: elapsed_s(start),
    });
    if let Ok(metrics) = handle.metrics().await {
        eprintln!(
            "datagrams in/out: {}/{}, cache inserts: {}, sync rounds: {}",
            metrics.datagrams_in, metrics.datagrams_out, metrics.cache_inserts, metrics.sync_rounds
        );
    }
    Ok(())
}
