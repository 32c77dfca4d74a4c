//! Agent process wiring
//!
//! Behavior messages arrive as JSON lines on a reader (stdin in production)
//! and responses leave as JSON lines on a writer (stdout).

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cse_agent::provisioning::ProvisioningBackend;
use cse_agent::{
    cluster_handlers, BehaviorResponse, Dispatcher, InMemoryTaskTracker, ReconcilerContext,
    RetryingBackend, SimulatedBackend, TaskTracker,
};

use crate::config::Settings;
use crate::journal::{JournaledTracker, TaskJournal};

const INBOX_CAPACITY: usize = 64;
const RESPONSE_CAPACITY: usize = 64;

/// Forward each non-blank line of `reader` to the dispatcher inbox
///
/// Lines are forwarded as raw bytes; a line that is not a valid message is
/// dropped by the dispatcher without affecting the lines after it. Returns the
/// number of messages forwarded.
pub async fn read_messages<R>(mut reader: R, inbox: mpsc::Sender<Vec<u8>>) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut forwarded = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let message = line.trim_ascii();
        if message.is_empty() {
            continue;
        }
        if inbox.send(message.to_vec()).await.is_err() {
            warn!("dispatcher stopped, no longer reading messages");
            break;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

/// Write every response as one JSON line until the channel closes
pub async fn write_responses<W>(
    mut responses: mpsc::Receiver<BehaviorResponse>,
    mut writer: W,
) -> anyhow::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(response) = responses.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        written += 1;
    }
    Ok(written)
}

/// Run the agent until `reader` is exhausted or `cancel` fires
///
/// Running behaviors are always allowed to finish and answer before this
/// returns.
pub async fn run_agent<R, W>(
    settings: &Settings,
    reader: R,
    writer: W,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let stores = settings.stores()?;
    let backend: Arc<dyn ProvisioningBackend> = Arc::new(RetryingBackend::new(
        Arc::new(SimulatedBackend::new()),
        settings.retry_config(),
    ));
    let reconciler = Arc::new(ReconcilerContext::new(
        stores.provider,
        backend,
        settings.reconciler_config(),
    ));
    let registry = Arc::new(cluster_handlers(reconciler)?);

    let records = Arc::new(InMemoryTaskTracker::new());
    let tracker: Arc<dyn TaskTracker> = match &settings.task_journal {
        Some(path) => {
            let journal = TaskJournal::new(path);
            let tasks = journal.load().await?;
            info!(tasks = tasks.len(), path = %path.display(), "restoring task records");
            records.restore(tasks);
            Arc::new(JournaledTracker::new(records, journal))
        }
        None => records,
    };

    let (response_tx, response_rx) = mpsc::channel(RESPONSE_CAPACITY);
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    info!(behaviors = ?registry.kinds(), "agent started");
    let dispatcher = Arc::new(
        Dispatcher::new(registry, tracker, settings.dispatcher_config())
            .with_responses(response_tx),
    );

    let reading = async {
        tokio::select! {
            read = read_messages(reader, inbox_tx) => read,
            _ = cancel.cancelled() => Ok(0),
        }
    };
    let (read, (), written) = tokio::join!(
        reading,
        dispatcher.run(inbox_rx, cancel.clone()),
        write_responses(response_rx, writer),
    );
    let read = read.context("failed to read behavior messages")?;
    let written = written.context("failed to write behavior responses")?;
    debug!(read, written, "agent stopped");
    info!(messages = read, responses = written, "agent finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cse_agent::TaskStatus;

    #[tokio::test]
    async fn test_blank_lines_are_not_forwarded() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"{\"a\":1}\n\n   \n{\"b\":2}\n";

        let forwarded = read_messages(input, tx).await.unwrap();

        assert_eq!(forwarded, 2);
        assert_eq!(rx.recv().await.unwrap(), b"{\"a\":1}".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"{\"b\":2}".to_vec());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_stop_intake() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"{\"a\":1}\n\xff\xfe\n{\"b\":2}";

        let forwarded = read_messages(input, tx).await.unwrap();

        assert_eq!(forwarded, 3);
        assert_eq!(rx.recv().await.unwrap(), b"{\"a\":1}".to_vec());
        assert_eq!(rx.recv().await.unwrap(), vec![0xff, 0xfe]);
        assert_eq!(rx.recv().await.unwrap(), b"{\"b\":2}".to_vec());
    }

    #[tokio::test]
    async fn test_each_response_is_one_line() {
        let (tx, rx) = mpsc::channel(8);
        for id in ["t1", "t2"] {
            tx.send(BehaviorResponse {
                task_id: id.to_string(),
                entity_id: "e".to_string(),
                status: TaskStatus::Succeeded,
                payload: None,
                degraded: None,
                error: None,
            })
            .await
            .unwrap();
        }
        drop(tx);
        let mut out = Vec::new();

        let written = write_responses(rx, &mut out).await.unwrap();

        assert_eq!(written, 2);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"taskId\":\"t2\""));
    }
}
