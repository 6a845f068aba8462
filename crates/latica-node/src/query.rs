use std::time::{Duration, Instant};

use latica::{EngineChannels, EngineEvent};

use crate::common::{ctrl_c, elapsed_s};
use crate::events::{emit, engine_event, EventStarted, EventSummary};

/// Flood `data` as a query and print answers for `wait`.
pub async fn run(
    mut channels: EngineChannels,
    data: &str,
    wait: Duration,
    start: Instant,
) -> anyhow::Result<()> {
    let handle = channels.handle.clone();
    emit(&EventStarted::new(&handle.peer_id(), "query"));

    let query_id = handle.query(data).await?;
    eprintln!("query {query_id} sent, waiting {} ms for answers", wait.as_millis());

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    let shutdown = ctrl_c();
    tokio::pin!(shutdown);

    let mut answers: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut shutdown => break,
            event = channels.events.recv() => match event {
                Some(event @ EngineEvent::Answer { .. }) if answers_query(&event, &query_id) => {
                    answers += 1;
                    emit(&engine_event(&event, elapsed_s(start)));
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    emit(&EventSummary {
        event: "summary",
        received: answers,
        elapsed_s: elapsed_s(start),
    });
    Ok(())
}

fn answers_query(event: &EngineEvent, id: &str) -> bool {
    matches!(event, EngineEvent::Answer { query_id, .. } if query_id == id)
}
