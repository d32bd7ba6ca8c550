//! IO task types and implementation for the bus channel.
//!
//! This module defines the request/response protocol between the
//! [`BusChannel`](crate::bus::BusChannel) handle and the single IO task that
//! owns the transport, plus the IO task loop itself.
//!
//! The IO task serializes every exchange on the bus: stale input is
//! discarded, one instruction packet goes out, the matching status packets
//! are collected, and only then is the next request taken off the queue. A
//! frame that has reached the wire is never abandoned; each exchange is
//! bounded by a protocol timeout derived from the command timeout and the
//! baud rate. Time spent waiting in the queue does not count against it.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use dxlbus_core::error::{CommError, Error, Result};
use dxlbus_core::transport::Transport;
use dxlbus_core::types::{MotorId, ProtocolVersion, RegisterValue};

use crate::bus::BusTiming;
use crate::instructions::{
    self, BulkReadEntry, BulkWriteEntry, ModelInfo, cmd_broadcast_ping, cmd_bulk_read,
    cmd_bulk_write, cmd_ping, cmd_read, cmd_write,
};
use crate::packet::{DecodeResult, StatusPacket, decode_status, describe_status_error};

/// Fixed overhead of a status packet: header, reserved, id, length,
/// instruction, error and CRC.
pub(crate) const STATUS_OVERHEAD: usize = 11;

/// Upper bound on stale bytes discarded before one transmit, so a bus that
/// never goes quiet cannot stall the IO task.
const MAX_STALE_BYTES: usize = 4096;

/// Largest number of motors that can answer a broadcast ping.
const MAX_RESPONDERS: usize = MotorId::MAX as usize + 1;

/// Time to clock one byte (start bit, 8 data bits, stop bit) at `baud_rate`.
pub(crate) fn byte_time(baud_rate: u32) -> Duration {
    Duration::from_secs_f64(10.0 / baud_rate as f64)
}

/// Protocol timeout for an exchange expecting `reply_bytes` back.
pub(crate) fn exchange_timeout(timing: &BusTiming, baud_rate: u32, reply_bytes: usize) -> Duration {
    timing.command_timeout + byte_time(baud_rate) * reply_bytes as u32
}

/// Listening window for a broadcast ping.
///
/// Long enough for every possible ID to answer with a 14-byte ping reply,
/// with 50% margin for inter-packet gaps.
pub(crate) fn discovery_window(timing: &BusTiming, baud_rate: u32) -> Duration {
    timing
        .discovery_window
        .unwrap_or_else(|| byte_time(baud_rate).mul_f64(1.5 * 14.0 * MAX_RESPONDERS as f64))
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A request sent from the bus handle to the IO task.
pub(crate) enum Request {
    Open {
        port: String,
        baud_rate: u32,
        protocol: ProtocolVersion,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Ping {
        id: MotorId,
        reply: oneshot::Sender<Result<ModelInfo>>,
    },
    Read {
        id: MotorId,
        address: u16,
        length: u16,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Write {
        id: MotorId,
        address: u16,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    BulkRead {
        entries: Vec<BulkReadEntry>,
        reply: oneshot::Sender<Result<BTreeMap<MotorId, RegisterValue>>>,
    },
    BulkWrite {
        entries: Vec<BulkWriteEntry>,
        reply: oneshot::Sender<Result<()>>,
    },
    Discover {
        reply: oneshot::Sender<Result<Vec<(MotorId, ModelInfo)>>>,
    },
    /// Graceful shutdown; returns the transport for test recovery.
    Shutdown {
        reply: oneshot::Sender<Box<dyn Transport>>,
    },
}

impl Request {
    /// Whether the caller stopped waiting for the reply.
    fn is_abandoned(&self) -> bool {
        match self {
            Request::Open { reply, .. }
            | Request::Close { reply }
            | Request::Write { reply, .. }
            | Request::BulkWrite { reply, .. } => reply.is_closed(),
            Request::Ping { reply, .. } => reply.is_closed(),
            Request::Read { reply, .. } => reply.is_closed(),
            Request::BulkRead { reply, .. } => reply.is_closed(),
            Request::Discover { reply } => reply.is_closed(),
            Request::Shutdown { reply } => reply.is_closed(),
        }
    }
}

/// A request waiting in the IO task's queue.
pub(crate) struct Queued {
    request: Request,
    /// Fired when the IO task takes the request off the queue.
    started: Option<oneshot::Sender<()>>,
}

/// Parameters of the currently open port.
#[derive(Debug, Clone)]
struct OpenPort {
    port: String,
    baud_rate: u32,
    protocol: ProtocolVersion,
}

/// Handle to the IO task. Stored inside `BusChannel`.
pub(crate) struct BusIo {
    pub cmd_tx: mpsc::Sender<Queued>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl BusIo {
    /// Queue a request and await its reply.
    ///
    /// `budget` is the protocol timeout of the exchange; the reply channel
    /// gets an extra 500ms of slack on top as a safety net. The IO task
    /// enforces the real timeout internally. The safety net starts once the
    /// IO task picks the request up, so a request queued behind a long
    /// exchange is never reported as timed out and then sent anyway.
    pub async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
        budget: Duration,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (started_tx, started_rx) = oneshot::channel();
        self.cmd_tx
            .send(Queued {
                request: make(reply_tx),
                started: Some(started_tx),
            })
            .await
            .map_err(|_| io_task_gone())?;

        // A dropped start signal means the IO task is gone; the reply
        // channel below reports that.
        let _ = started_rx.await;

        match tokio::time::timeout(budget + Duration::from_millis(500), reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(io_task_gone()),
            Err(_) => Err(CommError::Timeout.into()),
        }
    }

    /// Shut down the IO task and recover the transport.
    pub async fn shutdown(&self) -> Result<Box<dyn Transport>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(Queued {
                request: Request::Shutdown { reply: reply_tx },
                started: None,
            })
            .await;
        reply_rx.await.map_err(|_| io_task_gone())
    }
}

fn io_task_gone() -> Error {
    CommError::PortUnavailable("bus IO task has stopped".into()).into()
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task. Returns the handle for sending requests.
///
/// The IO task owns the transport exclusively. The channel starts closed;
/// nothing touches the transport until an `Open` request succeeds.
pub(crate) fn spawn_io_task(transport: Box<dyn Transport>, timing: BusTiming) -> BusIo {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Queued>(32);
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    let task = tokio::spawn(io_loop(transport, timing, cmd_rx, cancel_clone));

    BusIo {
        cmd_tx,
        cancel,
        task,
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// The main IO loop. Runs as a spawned Tokio task.
///
/// Cancellation takes priority over queued requests.
async fn io_loop(
    mut transport: Box<dyn Transport>,
    timing: BusTiming,
    mut cmd_rx: mpsc::Receiver<Queued>,
    cancel: CancellationToken,
) {
    let mut port: Option<OpenPort> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("IO task cancelled");
                break;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Queued { request: Request::Shutdown { reply }, .. }) => {
                        debug!("IO task shutdown requested");
                        let _ = reply.send(transport);
                        return;
                    }
                    Some(Queued { request, started }) => {
                        if request.is_abandoned() {
                            debug!("caller stopped waiting, dropping queued request");
                            continue;
                        }
                        if let Some(started) = started {
                            let _ = started.send(());
                        }
                        handle_request(&mut *transport, &timing, &mut port, request).await;
                    }
                    None => {
                        debug!("all request senders dropped, exiting IO task");
                        break;
                    }
                }
            }
        }
    }

    if port.is_some() {
        let _ = transport.close().await;
    }
}

async fn handle_request(
    transport: &mut dyn Transport,
    timing: &BusTiming,
    port: &mut Option<OpenPort>,
    request: Request,
) {
    match request {
        Request::Open {
            port: name,
            baud_rate,
            protocol,
            reply,
        } => {
            let _ = reply.send(open_port(transport, port, name, baud_rate, protocol).await);
        }
        Request::Close { reply } => {
            let _ = reply.send(close_port(transport, port).await);
        }
        Request::Ping { id, reply } => {
            let result = match require_open(port) {
                Ok(open) => execute_ping(transport, timing, open, id).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Request::Read {
            id,
            address,
            length,
            reply,
        } => {
            let result = match require_open(port) {
                Ok(open) => execute_read(transport, timing, open, id, address, length).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Request::Write {
            id,
            address,
            data,
            reply,
        } => {
            let result = match require_open(port) {
                Ok(open) => execute_write(transport, timing, open, id, address, &data).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Request::BulkRead { entries, reply } => {
            let result = match require_open(port) {
                Ok(open) => execute_bulk_read(transport, timing, open, &entries).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Request::BulkWrite { entries, reply } => {
            let result = match require_open(port) {
                Ok(_) => execute_bulk_write(transport, &entries).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Request::Discover { reply } => {
            let result = match require_open(port) {
                Ok(open) => execute_discover(transport, timing, open).await,
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Request::Shutdown { .. } => unreachable!("shutdown is handled by the IO loop"),
    }
}

fn require_open(port: &Option<OpenPort>) -> Result<&OpenPort> {
    port.as_ref()
        .ok_or_else(|| CommError::PortUnavailable("bus channel is closed".into()).into())
}

// ---------------------------------------------------------------------------
// Port lifecycle
// ---------------------------------------------------------------------------

async fn open_port(
    transport: &mut dyn Transport,
    slot: &mut Option<OpenPort>,
    port: String,
    baud_rate: u32,
    protocol: ProtocolVersion,
) -> Result<()> {
    if let Some(open) = slot {
        return Err(Error::InvalidParameter(format!(
            "bus channel already open on {} at {} baud; close it first",
            open.port, open.baud_rate
        )));
    }
    transport.open(&port, baud_rate).await?;
    info!(port = %port, baud_rate, %protocol, "bus channel open");
    *slot = Some(OpenPort {
        port,
        baud_rate,
        protocol,
    });
    Ok(())
}

async fn close_port(transport: &mut dyn Transport, slot: &mut Option<OpenPort>) -> Result<()> {
    let Some(open) = slot.take() else {
        return Ok(());
    };
    let result = transport.close().await;
    info!(port = %open.port, protocol = %open.protocol, "bus channel closed");
    result
}

// ---------------------------------------------------------------------------
// Exchanges
// ---------------------------------------------------------------------------

/// Read and drop whatever is already buffered on the receive side.
///
/// Status packets that arrive after their exchange ended would otherwise be
/// taken as the reply to the next frame for the same motor.
async fn discard_stale_input(transport: &mut dyn Transport) -> Result<()> {
    let mut chunk = [0u8; 256];
    let mut discarded = 0;
    while discarded < MAX_STALE_BYTES {
        match transport.receive(&mut chunk, Duration::ZERO).await {
            Ok(0) | Err(Error::Comm(CommError::NoResponse)) => break,
            Ok(n) => {
                trace!(bytes = ?&chunk[..n], "discarding stale input");
                discarded += n;
            }
            Err(e) => return Err(e),
        }
    }
    if discarded > 0 {
        debug!(len = discarded, "discarded stale input before transmit");
    }
    Ok(())
}

/// Put one frame on the wire after clearing stale input.
///
/// Any failure other than a closed port is reported as `TxFailed`: the
/// frame did not go out as a whole and no motor acted on it.
async fn send_frame(transport: &mut dyn Transport, frame: &[u8]) -> Result<()> {
    let sent = match discard_stale_input(transport).await {
        Ok(()) => {
            trace!(bytes = ?frame, "tx");
            transport.send(frame).await
        }
        Err(e) => Err(e),
    };
    sent.map_err(|e| match e {
        Error::Comm(CommError::PortUnavailable(_)) | Error::Comm(CommError::TxFailed(_)) => e,
        other => CommError::TxFailed(other.to_string()).into(),
    })
}

/// Status packets gathered during one listening window.
struct Collected {
    packets: Vec<StatusPacket>,
    /// Whether any bytes at all arrived, parsed or not.
    saw_bytes: bool,
}

/// Listen for status packets until every wanted ID has answered, the bus
/// goes silent, or `window` elapses.
///
/// With `wanted == None` every well-formed status packet is kept and only
/// silence or the deadline ends the window.
async fn collect_status(
    transport: &mut dyn Transport,
    wanted: Option<&[u8]>,
    window: Duration,
) -> Result<Collected> {
    let deadline = Instant::now() + window;
    let mut pending = Vec::new();
    let mut packets: Vec<StatusPacket> = Vec::new();
    let mut saw_bytes = false;
    let mut chunk = [0u8; 256];

    loop {
        if let Some(ids) = wanted {
            if ids.iter().all(|id| packets.iter().any(|p| p.id == *id)) {
                break;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match transport.receive(&mut chunk, deadline - now).await {
            Ok(0) => break,
            Ok(n) => {
                saw_bytes = true;
                trace!(bytes = ?&chunk[..n], "rx");
                pending.extend_from_slice(&chunk[..n]);
                drain_packets(&mut pending, wanted, &mut packets);
            }
            Err(Error::Comm(CommError::NoResponse)) => break,
            Err(e) => return Err(e),
        }
    }

    if !pending.is_empty() {
        debug!(len = pending.len(), "discarding unparsed bytes at end of exchange");
    }
    Ok(Collected { packets, saw_bytes })
}

fn drain_packets(pending: &mut Vec<u8>, wanted: Option<&[u8]>, packets: &mut Vec<StatusPacket>) {
    loop {
        match decode_status(pending) {
            DecodeResult::Status(status, consumed) => {
                pending.drain(..consumed);
                if !wanted.is_none_or(|ids| ids.contains(&status.id)) {
                    debug!(id = status.id, "skipping status packet from unexpected motor");
                    continue;
                }
                if packets.iter().any(|p| p.id == status.id) {
                    debug!(id = status.id, "skipping duplicate status packet");
                    continue;
                }
                packets.push(status);
            }
            DecodeResult::Discard(n) => {
                pending.drain(..n);
            }
            DecodeResult::Incomplete => break,
        }
    }
}

/// The error for an exchange that produced no usable status packet.
fn missing_reply(saw_bytes: bool) -> Error {
    if saw_bytes {
        CommError::Timeout.into()
    } else {
        CommError::NoResponse.into()
    }
}

fn check_status(id: MotorId, status: &StatusPacket) -> Result<()> {
    if status.is_ok() {
        return Ok(());
    }
    warn!(
        id = id.get(),
        code = status.error,
        "device error: {}",
        describe_status_error(status.error)
    );
    Err(CommError::DeviceError {
        id,
        code: status.error,
    }
    .into())
}

/// One instruction to one motor, one status packet back.
async fn exchange(
    transport: &mut dyn Transport,
    timing: &BusTiming,
    open: &OpenPort,
    id: MotorId,
    frame: &[u8],
    reply_bytes: usize,
) -> Result<StatusPacket> {
    send_frame(transport, frame).await?;
    let window = exchange_timeout(timing, open.baud_rate, reply_bytes);
    let collected = collect_status(transport, Some(&[id.get()]), window).await?;
    let status = collected
        .packets
        .into_iter()
        .next()
        .ok_or_else(|| missing_reply(collected.saw_bytes))?;
    check_status(id, &status)?;
    Ok(status)
}

async fn execute_ping(
    transport: &mut dyn Transport,
    timing: &BusTiming,
    open: &OpenPort,
    id: MotorId,
) -> Result<ModelInfo> {
    debug!(id = id.get(), "ping");
    let status = exchange(transport, timing, open, id, &cmd_ping(id), STATUS_OVERHEAD + 3).await?;
    instructions::parse_ping(&status)
}

async fn execute_read(
    transport: &mut dyn Transport,
    timing: &BusTiming,
    open: &OpenPort,
    id: MotorId,
    address: u16,
    length: u16,
) -> Result<Vec<u8>> {
    debug!(id = id.get(), address, length, "read");
    let frame = cmd_read(id, address, length);
    let reply_bytes = STATUS_OVERHEAD + length as usize;
    let status = exchange(transport, timing, open, id, &frame, reply_bytes).await?;
    if status.params.len() != length as usize {
        return Err(Error::Protocol(format!(
            "motor {id} returned {} bytes for a {length}-byte read at {address}",
            status.params.len()
        )));
    }
    Ok(status.params)
}

async fn execute_write(
    transport: &mut dyn Transport,
    timing: &BusTiming,
    open: &OpenPort,
    id: MotorId,
    address: u16,
    data: &[u8],
) -> Result<()> {
    debug!(id = id.get(), address, len = data.len(), "write");
    let frame = cmd_write(id, address, data);
    exchange(transport, timing, open, id, &frame, STATUS_OVERHEAD).await?;
    Ok(())
}

async fn execute_bulk_read(
    transport: &mut dyn Transport,
    timing: &BusTiming,
    open: &OpenPort,
    entries: &[BulkReadEntry],
) -> Result<BTreeMap<MotorId, RegisterValue>> {
    if entries.is_empty() {
        return Ok(BTreeMap::new());
    }
    debug!(motors = entries.len(), "bulk read");
    send_frame(transport, &cmd_bulk_read(entries)).await?;

    let ids: Vec<u8> = entries.iter().map(|e| e.id.get()).collect();
    let reply_bytes = entries
        .iter()
        .map(|e| STATUS_OVERHEAD + e.width.bytes())
        .sum();
    let window = exchange_timeout(timing, open.baud_rate, reply_bytes);
    let mut collected = collect_status(transport, Some(&ids), window).await?;

    let mut values = BTreeMap::new();
    for entry in entries {
        let Some(pos) = collected.packets.iter().position(|p| p.id == entry.id.get()) else {
            warn!(id = entry.id.get(), "motor missing from bulk read");
            return Err(CommError::PartialResponse(entry.id).into());
        };
        let status = collected.packets.swap_remove(pos);
        check_status(entry.id, &status)?;
        values.insert(
            entry.id,
            RegisterValue::from_le_bytes(entry.width, &status.params)?,
        );
    }
    Ok(values)
}

async fn execute_bulk_write(transport: &mut dyn Transport, entries: &[BulkWriteEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    debug!(motors = entries.len(), "bulk write");
    send_frame(transport, &cmd_bulk_write(entries)).await
}

async fn execute_discover(
    transport: &mut dyn Transport,
    timing: &BusTiming,
    open: &OpenPort,
) -> Result<Vec<(MotorId, ModelInfo)>> {
    let window = discovery_window(timing, open.baud_rate);
    debug!(window_ms = window.as_millis() as u64, "broadcast ping");
    send_frame(transport, &cmd_broadcast_ping()).await?;

    let collected = collect_status(transport, None, window).await?;
    let mut found = Vec::with_capacity(collected.packets.len());
    for status in &collected.packets {
        let Ok(id) = MotorId::new(status.id) else {
            debug!(id = status.id, "ignoring ping reply from reserved id");
            continue;
        };
        if !status.is_ok() {
            warn!(
                id = status.id,
                "ping reply carries error: {}",
                describe_status_error(status.error)
            );
        }
        match instructions::parse_ping(status) {
            Ok(info) => found.push((id, info)),
            Err(e) => warn!(id = status.id, error = %e, "ignoring malformed ping reply"),
        }
    }
    found.sort_by_key(|(id, _)| *id);
    debug!(found = found.len(), "broadcast ping complete");
    Ok(found)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
