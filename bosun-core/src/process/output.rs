use std::sync::Arc;
use std::time::Duration;

use bosun_model::{EntityId, LogLevel};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::logbook::Logbook;

/// Copies each line of `reader` into the logbook until EOF.
///
/// Invalid UTF-8 is replaced rather than ending the stream. `delay` paces
/// consumers that render every entry.
pub(crate) async fn forward_lines<R>(
    reader: R,
    logbook: Arc<Logbook>,
    level: LogLevel,
    owner_id: EntityId,
    delay: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if let Err(err) = logbook.add(level, Some(&owner_id), line, None) {
                    warn!(target: "bosun::process", owner = %owner_id, error = %err, "failed to record output line");
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => {
                debug!(target: "bosun::process", owner = %owner_id, error = %err, "output stream closed");
                break;
            }
        }
    }
}
