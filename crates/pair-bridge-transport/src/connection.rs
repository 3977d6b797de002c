//! Per-connection read loop.
//!
//! A connection is `reading` until a full line arrives, handles exactly one
//! command per line, and either goes back to reading or parks in `waiting`
//! until its long-poll resolves. While waiting nothing else is dispatched:
//! bytes the client sends meanwhile are held back and replayed once the wait
//! is over, and the stream is watched for the client hanging up.

use std::sync::Arc;

use pair_bridge_core::{EmitPayload, SessionState, WaitOutcome, WaitTicket};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    BridgeCommand, BridgeResponse, MAX_FRAME_LEN, ProtocolError, Reply, encode_line, finish_frame, frame_too_long,
};
use crate::server::StopHandle;

/// Connection-level failure. Only ever ends the connection it happened on.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What a connection handler needs from its broker.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub session: Arc<SessionState>,
    pub cancel: CancellationToken,
    pub stop: StopHandle,
}

/// Result of dispatching one frame.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Reply(Reply),
    Wait(WaitTicket),
    Stop,
}

/// Apply one frame to the session.
pub(crate) fn dispatch(session: &SessionState, frame: &[u8]) -> Dispatch {
    let command = match BridgeCommand::parse(frame) {
        Ok(command) => command,
        Err(e) => return Dispatch::Reply(Reply::Response(e.into())),
    };

    match command {
        BridgeCommand::Emit { payload } => Dispatch::Reply(Reply::Response(emit(session, payload))),
        BridgeCommand::Wait { last_seen } => Dispatch::Wait(session.wait(last_seen)),
        BridgeCommand::Poll => Dispatch::Reply(Reply::Feedback(session.dequeue_feedback())),
        BridgeCommand::History { last } => Dispatch::Reply(Reply::Activities(session.tail(last))),
        BridgeCommand::Status => Dispatch::Reply(Reply::Status(session.snapshot())),
        BridgeCommand::Stop => Dispatch::Stop,
    }
}

fn emit(session: &SessionState, payload: Option<Value>) -> BridgeResponse {
    let Some(payload) = payload else {
        return ProtocolError::MissingPayload.into();
    };

    match EmitPayload::from_value(payload) {
        Ok(EmitPayload::Activity(event)) => {
            session.append(event);
            BridgeResponse::ok()
        }
        Ok(EmitPayload::Feedback(event)) => {
            session.enqueue_feedback(event);
            BridgeResponse::ok()
        }
        Err(e) => ProtocolError::from(e).into(),
    }
}

/// Serve one client until it disconnects, the broker stops, or a wait is
/// ended by the session stopping.
pub(crate) async fn handle_connection<S>(
    stream: S,
    ctx: ConnectionContext,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut frame = Vec::new();
    // bytes that arrived while parked in a wait
    let mut held = Vec::new();

    loop {
        let more = tokio::select! {
            () = ctx.cancel.cancelled() => return Ok(()),
            read = next_frame(&mut reader, &mut held, &mut frame) => read?,
        };
        if !more {
            tracing::debug!(session_id = %ctx.session.id(), "Client disconnected");
            return Ok(());
        }

        let line = frame.trim_ascii();
        if line.is_empty() {
            continue;
        }

        match dispatch(&ctx.session, line) {
            Dispatch::Reply(reply) => write_message(&mut reader, &reply).await?,
            Dispatch::Stop => {
                let ack = Reply::Response(BridgeResponse::ok_with(json!({ "stopping": true })));
                let written = write_message(&mut reader, &ack).await;
                ctx.stop.request_stop();
                written?;
            }
            Dispatch::Wait(WaitTicket::Ready(events)) => {
                write_message(&mut reader, &Reply::Activities(events)).await?;
            }
            Dispatch::Wait(WaitTicket::Stopped(event)) => {
                write_message(&mut reader, &Reply::Control(event)).await?;
                return Ok(());
            }
            Dispatch::Wait(WaitTicket::Pending { id, rx }) => {
                let outcome = tokio::select! {
                    outcome = rx => outcome,
                    closed = watch_hangup(&mut reader, &mut held) => {
                        ctx.session.remove_waiter(id);
                        match closed {
                            Ok(()) => tracing::debug!(session_id = %ctx.session.id(), "Waiter hung up"),
                            Err(e) => tracing::warn!(session_id = %ctx.session.id(), "Dropping waiter: {e}"),
                        }
                        return Ok(());
                    }
                };

                match outcome {
                    Ok(WaitOutcome::Activities(events)) => {
                        write_message(&mut reader, &Reply::Activities(events)).await?;
                    }
                    Ok(WaitOutcome::Stopped(event)) => {
                        write_message(&mut reader, &Reply::Control(event)).await?;
                        reader.get_mut().shutdown().await?;
                        return Ok(());
                    }
                    // sender gone without a verdict: the session was torn down
                    Err(_) => return Ok(()),
                }
            }
        }
    }
}

/// Next frame, taken from `held` first and then from the stream.
async fn next_frame<S>(
    reader: &mut BufReader<S>,
    held: &mut Vec<u8>,
    frame: &mut Vec<u8>,
) -> std::io::Result<bool>
where
    S: AsyncRead + Unpin,
{
    frame.clear();
    if let Some(end) = held.iter().position(|b| *b == b'\n') {
        frame.extend(held.drain(..=end));
        frame.pop();
        return Ok(true);
    }
    frame.append(held);
    finish_frame(reader, frame).await
}

/// Read whatever the client sends during a wait into `held`, until it
/// closes its end.
///
/// Resolves with `Ok` on a clean close and with an error if the stream
/// fails or the client piles up more than a frame's worth of input.
async fn watch_hangup<S>(reader: &mut BufReader<S>, held: &mut Vec<u8>) -> std::io::Result<()>
where
    S: AsyncRead + Unpin,
{
    loop {
        if reader.read_buf(held).await? == 0 {
            return Ok(());
        }
        if held.len() > MAX_FRAME_LEN {
            return Err(frame_too_long());
        }
    }
}

async fn write_message<S, T>(reader: &mut BufReader<S>, message: &T) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_line(message)?;
    let stream = reader.get_mut();
    stream.write_all(&line).await?;
    stream.flush().await?;
    Ok(())
}
