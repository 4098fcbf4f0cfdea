use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    cli::JoinArgs,
    connector::{BusConnection, connect},
    message::{PeerMessage, StatusMessage},
};

const OUTBOUND_CAPACITY: usize = 16;

/// How long an interrupted client waits for the relay to acknowledge `Leave`.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Joins a session and bridges it to the terminal: stdin lines go out as
/// peer messages, peer messages and status updates are printed to stdout.
pub async fn run(args: JoinArgs) -> Result<()> {
    let target = args.target()?;
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let BusConnection {
        mut inbound,
        mut status,
    } = connect(&target.host, &target.session, &target.id, outbound_rx)
        .await
        .with_context(|| format!("failed to join session {}", target.session))?;

    write_stderr(&format!(
        "connected to session={} with id={}",
        target.session, target.id
    ))
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut outbound = Some(outbound_tx);

    loop {
        select! {
            line = stdin.next_line(), if outbound.is_some() => {
                if !handle_stdin_line(line?, &target.id, &mut outbound).await? {
                    // Dropping the sender makes the connector say goodbye.
                    outbound = None;
                }
            }
            message = inbound.recv() => match message {
                Some(message) => write_stdout(&render_peer_message(&message)).await?,
                None => break,
            },
            update = status.recv() => match update {
                Some(update) => write_stdout(&render_status(&update)).await?,
                None => break,
            },
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                leave_and_wait(&mut outbound, &mut inbound).await;
                break;
            }
        }
    }

    Ok(())
}

/// Drops the outbound sender so the connector sends `Leave`, then waits for
/// the relay to close the connection.
async fn leave_and_wait(
    outbound: &mut Option<mpsc::Sender<PeerMessage>>,
    inbound: &mut mpsc::Receiver<PeerMessage>,
) {
    *outbound = None;
    let closed = timeout(LEAVE_TIMEOUT, async {
        while inbound.recv().await.is_some() {}
    })
    .await;
    if closed.is_err() {
        debug!("relay did not close the connection after leave");
    }
}

/// Returns `false` once the user is done sending.
async fn handle_stdin_line(
    line: Option<String>,
    local_id: &str,
    outbound: &mut Option<mpsc::Sender<PeerMessage>>,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving the bus").await?;
        return Ok(false);
    }

    let Some(sender) = outbound.as_ref() else {
        return Ok(false);
    };
    Ok(sender.send(compose(local_id, text)).await.is_ok())
}

/// Builds the message for one input line. `@bob,carol text` is multicast to
/// `bob` and `carol`, anything else is broadcast.
pub fn compose(local_id: &str, text: &str) -> PeerMessage {
    if let Some(addressed) = text.strip_prefix('@') {
        if let Some((targets, body)) = addressed.split_once(' ') {
            let to: Vec<String> = targets
                .split(',')
                .map(str::trim)
                .filter(|target| !target.is_empty())
                .map(String::from)
                .collect();
            if !to.is_empty() {
                return PeerMessage::multicast(local_id, to, body.as_bytes().to_vec());
            }
        }
    }

    PeerMessage::broadcast(local_id, text.as_bytes().to_vec())
}

pub fn render_peer_message(message: &PeerMessage) -> String {
    format!(
        "<{}> {}",
        message.from,
        String::from_utf8_lossy(&message.msg).trim_end()
    )
}

pub fn render_status(status: &StatusMessage) -> String {
    let mut peers = status.peers.clone();
    peers.sort_unstable();
    format!("*** on board: {}", peers.join(", "))
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_broadcast() {
        assert_eq!(
            compose("alice", "hello everyone"),
            PeerMessage::broadcast("alice", b"hello everyone".to_vec())
        );
    }

    #[test]
    fn addressed_lines_are_multicast() {
        assert_eq!(
            compose("alice", "@bob,carol see you"),
            PeerMessage::multicast(
                "alice",
                vec!["bob".into(), "carol".into()],
                b"see you".to_vec()
            )
        );
    }

    #[test]
    fn bare_mention_is_broadcast() {
        assert_eq!(
            compose("alice", "@bob"),
            PeerMessage::broadcast("alice", b"@bob".to_vec())
        );
    }

    #[test]
    fn renders_messages_and_status() {
        let message = PeerMessage::broadcast("bob", b"hi\n".to_vec());
        assert_eq!(render_peer_message(&message), "<bob> hi");

        let status = StatusMessage {
            from: "blue-bus".into(),
            peers: vec!["carol".into(), "alice".into()],
        };
        assert_eq!(render_status(&status), "*** on board: alice, carol");
    }

    #[tokio::test]
    async fn interrupt_releases_outbound_and_waits_for_close() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<PeerMessage>(1);
        let (inbound_tx, mut inbound) = mpsc::channel(1);

        // Stands in for the connector: closes inbound once outbound is gone.
        let connector = tokio::spawn(async move {
            let leftover = outbound_rx.recv().await;
            inbound_tx
                .send(PeerMessage::broadcast("bob", b"late".to_vec()))
                .await
                .expect("inbound open");
            leftover
        });

        let mut outbound = Some(outbound_tx);
        leave_and_wait(&mut outbound, &mut inbound).await;

        assert!(outbound.is_none());
        assert!(connector.await.expect("connector task").is_none());
        assert!(inbound.recv().await.is_none());
    }
}
