use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use latica::types::sha256;
use latica::{EngineHandle, EngineSnapshot, Id32, PeerId};

/// Parse a cluster argument: 64 hex chars are taken as-is, anything else is hashed.
pub fn parse_cluster(s: &str) -> anyhow::Result<Id32> {
    if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
        let mut id = [0u8; 32];
        hex::decode_to_slice(s, &mut id).with_context(|| format!("invalid cluster '{s}'"))?;
        return Ok(id);
    }
    Ok(sha256(s.as_bytes()))
}

/// Explicit --peer-id wins, then the snapshot's id, then a fresh one.
pub fn resolve_peer_id(
    arg: Option<&str>,
    snapshot: Option<&EngineSnapshot>,
) -> anyhow::Result<PeerId> {
    match (arg, snapshot) {
        (Some(s), Some(snap)) => {
            let id: PeerId = s.parse()?;
            anyhow::ensure!(
                id == snap.peer_id,
                "--peer-id {id} does not match the state file ({})",
                snap.peer_id
            );
            Ok(id)
        }
        (Some(s), None) => Ok(s.parse()?),
        (None, Some(snap)) => Ok(snap.peer_id),
        (None, None) => Ok(PeerId::random()),
    }
}

/// Read a snapshot file. A missing file is not an error.
pub fn load_state(path: &Path) -> anyhow::Result<Option<EngineSnapshot>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let snapshot = EngineSnapshot::from_bytes(&bytes)
                .with_context(|| format!("corrupt state file {}", path.display()))?;
            tracing::info!(
                path = %path.display(),
                packets = snapshot.packets.len(),
                "restoring state"
            );
            Ok(Some(snapshot))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

pub async fn save_state(handle: &EngineHandle, path: &Path) -> anyhow::Result<()> {
    let bytes = handle.snapshot().await?.to_bytes()?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Resolves on Ctrl+C.
pub async fn ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
    eprintln!("\nCtrl+C received, shutting down...");
}

/// Elapsed seconds since `start`.
pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_hex_is_taken_verbatim() {
        let hex_id = "ab".repeat(32);
        assert_eq!(parse_cluster(&hex_id).unwrap(), [0xab; 32]);
    }

    #[test]
    fn cluster_name_is_hashed() {
        assert_eq!(parse_cluster("latica").unwrap(), sha256(b"latica"));
        assert_ne!(parse_cluster("latica").unwrap(), parse_cluster("other").unwrap());
    }

    #[test]
    fn peer_id_must_match_state() {
        let snap = EngineSnapshot {
            peer_id: PeerId::from_bytes([1; 32]),
            clock: 0,
            packets: Vec::new(),
            unpublished: Vec::new(),
        };
        assert_eq!(resolve_peer_id(None, Some(&snap)).unwrap(), snap.peer_id);
        assert!(resolve_peer_id(Some(&"02".repeat(32)), Some(&snap)).is_err());
        assert!(resolve_peer_id(Some("nope"), None).is_err());
    }

    #[test]
    fn missing_state_file_is_fresh_start() {
        let path = std::env::temp_dir().join(format!("latica-missing-{}", PeerId::random()));
        assert!(load_state(&path).unwrap().is_none());
    }
}
