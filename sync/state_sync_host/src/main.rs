//! Headless mirror client over stdio.
//!
//! Reads length-prefixed server envelopes from stdin, keeps a mirror tree in
//! sync and writes client envelopes to stdout. Logs go to stderr.

use state_sync_runtime::protocol::{
    CLIENT_TO_SERVER_CAP, SERVER_TO_CLIENT_CAP, reader_loop, writer_loop,
};
use state_sync_runtime::{
    ClientEnvelope, ClientSession, ConnectionState, ServerEnvelope, SyncConfig,
};
use std::io;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const TICK: Duration = Duration::from_millis(100);

enum LoopEvent {
    Envelope(ServerEnvelope),
    ReaderClosed,
}

fn main() {
    init_tracing();

    if let Err(err) = run() {
        tracing::error!("state_sync_host fatal error: {err}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::from_env();
    let sid = std::env::var("STATE_SYNC_SID").unwrap_or_else(|_| "S1".to_string());
    let outbound_queue_cap = config.outbound_queue_cap;
    let dropped_ack_count = AtomicU64::new(0);

    let (tx, rx) = mpsc::sync_channel(outbound_queue_cap);
    let writer_handle = thread::spawn(move || {
        let mut stdout = io::stdout().lock();
        writer_loop(&mut stdout, rx, CLIENT_TO_SERVER_CAP)
    });

    let (loop_tx, loop_rx) = mpsc::channel();
    let reader_handle = thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let read_result = reader_loop(&mut stdin, SERVER_TO_CLIENT_CAP, |envelope| {
            let _ = loop_tx.send(LoopEvent::Envelope(envelope));
        });

        if let Err(err) = &read_result {
            tracing::error!("reader loop terminated with error: {err}");
        }
        let _ = loop_tx.send(LoopEvent::ReaderClosed);
        read_result
    });

    let mut session = ClientSession::new(sid, &config);
    enqueue_control_envelope(tx.clone(), session.connect(), outbound_queue_cap);

    let started = Instant::now();
    loop {
        let now_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outgoing = match loop_rx.recv_timeout(TICK) {
            Ok(LoopEvent::Envelope(envelope)) => session.handle_server(envelope, now_ms),
            Ok(LoopEvent::ReaderClosed) | Err(RecvTimeoutError::Disconnected) => {
                // Stdio cannot be reopened, so a closed input ends the session.
                session.on_transport_lost();
                break;
            }
            Err(RecvTimeoutError::Timeout) => session.poll(now_ms),
        };

        for envelope in outgoing {
            send_envelope(&tx, envelope, &dropped_ack_count, outbound_queue_cap);
        }

        for invocation in session.drain_invocations() {
            tracing::info!(
                node = ?invocation.node,
                method = %invocation.method,
                args = ?invocation.args,
                "server invocation"
            );
        }

        if session.state() == ConnectionState::Disconnected {
            tracing::info!("session ended by server");
            break;
        }
    }

    tracing::debug!(mirror = %session.mirror().debug_json(), "final mirror state");
    session.teardown();
    drop(tx);

    if reader_handle.is_finished() {
        match reader_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("reader thread returned error: {err}"),
            Err(err) => tracing::error!("reader thread join failed: {err:?}"),
        }
    } else {
        // Avoid hanging process exit on a blocked stdio read during teardown.
        tracing::warn!("reader thread still active during shutdown; skipping join");
    }

    if writer_handle.is_finished() {
        match writer_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("writer thread returned error: {err}"),
            Err(err) => tracing::error!("writer thread join failed: {err:?}"),
        }
    } else {
        tracing::warn!("writer thread still active during shutdown; skipping join");
    }

    Ok(())
}

/// Acks are cumulative, so one dropped under back-pressure is superseded by
/// the next. Everything else must be delivered.
fn send_envelope(
    tx: &SyncSender<ClientEnvelope>,
    envelope: ClientEnvelope,
    dropped_ack_count: &AtomicU64,
    queue_capacity: usize,
) {
    if !matches!(envelope, ClientEnvelope::Ack { .. }) {
        enqueue_control_envelope(tx.clone(), envelope, queue_capacity);
        return;
    }

    match tx.try_send(envelope) {
        Ok(()) => {}
        Err(TrySendError::Full(_envelope)) => {
            let dropped = dropped_ack_count.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped.is_power_of_two() {
                tracing::warn!(
                    queue_capacity,
                    dropped,
                    "outbound queue full; dropped acknowledgement(s)"
                );
            }
        }
        Err(TrySendError::Disconnected(_envelope)) => {
            tracing::error!("failed to queue acknowledgement");
        }
    }
}

fn enqueue_control_envelope(
    tx: SyncSender<ClientEnvelope>,
    envelope: ClientEnvelope,
    queue_capacity: usize,
) {
    match tx.try_send(envelope) {
        Ok(()) => {}
        Err(TrySendError::Full(envelope)) => {
            tracing::warn!(
                queue_capacity,
                "outbound queue full; waiting to enqueue envelope"
            );
            thread::spawn(move || {
                if tx.send(envelope).is_err() {
                    tracing::error!("failed to enqueue envelope");
                }
            });
        }
        Err(TrySendError::Disconnected(_envelope)) => {
            tracing::error!("failed to enqueue envelope");
        }
    }
}
