use std::sync::Arc;

use color_eyre::Result;
use securekv_core::dispatch::{Dispatcher, MethodCall, MethodOutcome};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Run one call on the blocking pool; storage calls may block on OS I/O.
pub async fn dispatch(dispatcher: &Arc<Dispatcher>, call: MethodCall) -> Result<MethodOutcome> {
    let dispatcher = Arc::clone(dispatcher);
    let outcome = tokio::task::spawn_blocking(move || dispatcher.handle(&call)).await?;
    Ok(outcome)
}

/// JSON-lines transport: one `MethodCall` per input line, one `MethodOutcome`
/// per output line, answered in input order.
pub async fn run<R, W>(dispatcher: Arc<Dispatcher>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!(
        backend = dispatcher.executor().backend_name(),
        namespace = %dispatcher.executor().namespace(),
        "serving method calls"
    );
    let mut lines = reader.lines();
    let mut served = 0usize;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let outcome = match serde_json::from_str::<MethodCall>(&line) {
            Ok(call) => dispatch(&dispatcher, call).await?,
            Err(err) => {
                MethodOutcome::error("INVALID_ARGUMENT", format!("malformed call: {err}"))
            }
        };

        let mut encoded = serde_json::to_vec(&outcome)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        served += 1;
    }

    debug!(served, "input closed");
    Ok(())
}
