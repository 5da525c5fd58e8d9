//! The collaborators around the supervisor: where inbound texts go, where
//! outbound ones come from, and what a fatal error means for the process.

use serde::Deserialize;
use smsrelay_client::{ErrorReport, Severity, SupervisorHandle};
use smsrelay_core::{DownstreamPayload, MmsMessage, OutboundMessage, TextMessage};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// Log every SMS/MMS the phone relays. Returns once all senders are gone.
pub async fn log_inbound(mut inbound: mpsc::Receiver<TextMessage>) -> usize {
    let mut received = 0;
    while let Some(text) = inbound.recv().await {
        received += 1;
        match &text {
            TextMessage::Sms(sms) => tracing::info!(
                from = %sms.phone_number,
                at = sms.timestamp,
                body = %sms.message,
                "sms received"
            ),
            TextMessage::Mms(mms) => tracing::info!(
                from = %mms.phone_number,
                at = mms.timestamp,
                recipients = ?mms.recipients,
                block_id = %mms.part_block_id,
                body = %mms.message,
                "mms received"
            ),
        }
    }
    received
}

/// One line of the outbound request stream.
#[derive(Debug, Deserialize)]
struct OutboundRequest {
    /// Registration token of the target device.
    to: String,
    phone_number: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    recipients: Vec<String>,
}

impl OutboundRequest {
    fn into_message(self, timestamp: i64) -> OutboundMessage {
        let text = TextMessage::from_record(MmsMessage {
            phone_number: self.phone_number,
            message: self.message,
            timestamp,
            recipients: self.recipients,
            part_block_id: String::new(),
        });
        DownstreamPayload::text(self.to, text).into()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Turn newline-delimited JSON requests into downstream messages.
///
/// Bad lines are logged and skipped. Returns how many messages were queued
/// once the reader is exhausted or the supervisor stops accepting.
pub async fn read_outbound<R>(
    reader: R,
    outbound: mpsc::Sender<OutboundMessage>,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut queued = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: OutboundRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed outbound request");
                continue;
            }
        };
        let message = request.into_message(now_millis());
        tracing::debug!(
            message_id = message.correlation_id(),
            to = message.target(),
            "queueing outbound message"
        );
        if outbound.send(message).await.is_err() {
            tracing::warn!("outbound channel closed");
            break;
        }
        queued += 1;
    }
    Ok(queued)
}

/// Why the daemon gave up.
#[derive(Debug, thiserror::Error)]
#[error("no connection left after fatal error on {}: {}", .0.connection, .0.error)]
pub struct Unserviceable(pub ErrorReport);

/// Watch reports for a fatal error that leaves nothing running.
///
/// A fatal error while other connections are still registered (say, a
/// failed replacement during a drain) only costs that one connection. The
/// report is kept, and once the registry empties there is nothing left to
/// relay through.
pub async fn enforce_fatal_policy(
    mut reports: mpsc::UnboundedReceiver<ErrorReport>,
    supervisor: SupervisorHandle,
) -> Result<(), Unserviceable> {
    let mut count = supervisor.watch_count();
    let mut pending: Option<ErrorReport> = None;
    loop {
        tokio::select! {
            report = reports.recv() => {
                let Some(report) = report else { return Ok(()) };
                if report.severity() != Severity::Fatal {
                    continue;
                }
                let remaining = supervisor.connection_count();
                if remaining == 0 {
                    return Err(Unserviceable(report));
                }
                tracing::warn!(remaining, "continuing on surviving connections");
                pending = Some(report);
            }
            changed = count.changed(), if pending.is_some() => {
                if changed.is_err() {
                    return Ok(());
                }
                if *count.borrow_and_update() == 0 {
                    if let Some(report) = pending.take() {
                        return Err(Unserviceable(report));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smsrelay_client::memory::MemoryConnector;
    use smsrelay_client::{ErrorSink, FanOutMode, Supervisor, SupervisorConfig};
    use smsrelay_core::SmsMessage;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn stdin_lines_become_downstream_messages() {
        let input = concat!(
            "{\"to\":\"device\",\"phone_number\":\"+15555550123\",\"message\":\"hi\"}\n",
            "\n",
            "not json\n",
            "{\"to\":\"device\",\"phone_number\":\"+1\",\"recipients\":[\"+2\",\"+3\"]}\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        let queued = read_outbound(input.as_bytes(), tx).await.unwrap();
        assert_eq!(queued, 2);

        let Some(OutboundMessage::Downstream(sms)) = rx.recv().await else {
            panic!("expected downstream message");
        };
        assert_eq!(sms.to, "device");
        assert!(!sms.data.is_mms());
        assert_eq!(sms.data.body(), "hi");

        let Some(OutboundMessage::Downstream(mms)) = rx.recv().await else {
            panic!("expected downstream message");
        };
        assert!(mms.data.is_mms());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reader_stops_when_outbound_closes() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let queued = read_outbound(
            &b"{\"to\":\"d\",\"phone_number\":\"+1\"}\n{\"to\":\"d\",\"phone_number\":\"+1\"}\n"[..],
            tx,
        )
        .await
        .unwrap();
        assert_eq!(queued, 0);
    }

    #[tokio::test]
    async fn inbound_logger_counts_until_closed() {
        let (tx, rx) = mpsc::channel::<TextMessage>(4);
        tx.send(
            SmsMessage {
                phone_number: "+1".into(),
                message: "hi".into(),
                timestamp: 1,
            }
            .into(),
        )
        .await
        .unwrap();
        drop(tx);
        assert_eq!(log_inbound(rx).await, 1);
    }

    #[tokio::test]
    async fn fatal_error_with_no_connections_is_unserviceable() {
        let (connector, _peers) = MemoryConnector::new();
        connector.fail_next(1);
        let (inbound, _inbound_rx) = mpsc::channel(1);
        let (errors, reports) = ErrorSink::channel();
        let supervisor = Supervisor::start(
            connector,
            SupervisorConfig {
                fan_out: FanOutMode::Broadcast,
            },
            inbound,
            errors,
        );

        let policy = tokio::spawn(enforce_fatal_policy(reports, supervisor.clone()));
        assert!(supervisor.spawn_connection().await.is_err());
        let outcome = timeout(WAIT, policy).await.unwrap().unwrap();
        let Err(Unserviceable(report)) = outcome else {
            panic!("expected the policy to give up");
        };
        assert!(report.error.is_fatal());
    }

    #[tokio::test]
    async fn fatal_error_with_survivors_keeps_running() {
        let (connector, mut peers) = MemoryConnector::new();
        let (inbound, _inbound_rx) = mpsc::channel(1);
        let (errors, reports) = ErrorSink::channel();
        let supervisor =
            Supervisor::start(connector, SupervisorConfig::default(), inbound, errors.clone());
        supervisor.spawn_connection().await.unwrap();
        let peer = peers.recv().await.unwrap();

        let policy = tokio::spawn(enforce_fatal_policy(reports, supervisor.clone()));
        errors.report(
            peer.connection,
            smsrelay_client::ClientError::fatal(smsrelay_client::HandshakeError::StreamClosed),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!policy.is_finished());
        policy.abort();
    }

    const DRAIN: &str = r#"<message><gcm xmlns="google:mobile:data">{"message_type":"control","control_type":"CONNECTION_DRAINING"}</gcm></message>"#;

    #[tokio::test]
    async fn failed_replacement_then_close_is_unserviceable() {
        let (connector, mut peers) = MemoryConnector::new();
        let (inbound, _inbound_rx) = mpsc::channel(1);
        let (errors, reports) = ErrorSink::channel();
        let supervisor = Supervisor::start(
            connector.clone(),
            SupervisorConfig::default(),
            inbound,
            errors,
        );
        supervisor.spawn_connection().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let policy = tokio::spawn(enforce_fatal_policy(reports, supervisor.clone()));

        // The replacement handshake fails while the old session survives.
        connector.fail_next(1);
        assert!(peer.push(DRAIN));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!policy.is_finished());
        assert_eq!(supervisor.connection_count(), 1);

        peer.close();
        let outcome = timeout(WAIT, policy).await.unwrap().unwrap();
        let Err(Unserviceable(report)) = outcome else {
            panic!("expected the policy to give up");
        };
        assert!(report.error.is_fatal());
    }
}
