//! Transport client backed by a dedicated I/O task.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::link::{ErrorCode, Incoming, Link, Outgoing, ServiceRequest};
use super::{IAm, ReadRequest, Transport, WriteRequest};
use crate::address::{self, Mac};
use crate::error::{Error, Result};
use crate::value::WireValue;

const COMMAND_QUEUE: usize = 64;
const ANNOUNCE_QUEUE: usize = 256;

enum Command {
    Request {
        destination: Mac,
        request: ServiceRequest,
        reply: oneshot::Sender<Result<Incoming>>,
    },
    WhoIs {
        listener: mpsc::Sender<IAm>,
    },
}

/// Handle to the transport I/O task.
///
/// Cloning is cheap; every clone talks to the same task. The task stops when
/// the last handle is dropped or the link closes.
#[derive(Clone)]
pub struct TransportClient {
    commands: mpsc::Sender<Command>,
}

impl TransportClient {
    /// Attach `link` and spawn the I/O task that owns it.
    pub fn start<L: Link>(link: L) -> Self {
        let channels = link.attach();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(io_task(rx, channels.outgoing, channels.incoming));
        Self { commands: tx }
    }

    async fn transact(
        &self,
        address: &str,
        request: ServiceRequest,
        timeout: Duration,
    ) -> Result<Incoming> {
        let destination = address::decode(address)?;
        let (reply, rx) = oneshot::channel();

        self.commands
            .send(Command::Request {
                destination,
                request,
                reply,
            })
            .await
            .map_err(|_| Error::protocol("transport stopped"))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => Err(Error::protocol("transport stopped before a reply arrived")),
            Err(_) => Err(Error::TransportTimeout(timeout)),
        }
    }
}

#[async_trait]
impl Transport for TransportClient {
    async fn read(&self, address: &str, request: ReadRequest, timeout: Duration) -> Result<WireValue> {
        let frame = self
            .transact(address, ServiceRequest::ReadProperty(request.clone()), timeout)
            .await?;

        match frame {
            Incoming::ComplexAck { value, .. } => Ok(value),
            other => Err(failure(other, &request)),
        }
    }

    async fn write(&self, address: &str, request: WriteRequest, timeout: Duration) -> Result<()> {
        let target = ReadRequest {
            object: request.object,
            property: request.property,
            index: request.index,
        };
        let frame = self
            .transact(address, ServiceRequest::WriteProperty(request), timeout)
            .await?;

        match frame {
            Incoming::SimpleAck { .. } => Ok(()),
            other => Err(failure(other, &target)),
        }
    }

    async fn who_is(&self) -> Result<mpsc::Receiver<IAm>> {
        let (listener, rx) = mpsc::channel(ANNOUNCE_QUEUE);
        self.commands
            .send(Command::WhoIs { listener })
            .await
            .map_err(|_| Error::protocol("transport stopped"))?;
        Ok(rx)
    }
}

/// Translate a non-success reply into an error.
fn failure(frame: Incoming, request: &ReadRequest) -> Error {
    match frame {
        Incoming::Error {
            code: ErrorCode::UnknownProperty,
            ..
        } => Error::UnsupportedProperty {
            object_type: request.object.object_type,
            property: request.property,
        },
        Incoming::Error { class, code, .. } => Error::protocol(format!(
            "device error {}:{} for {} {}",
            class, code, request.object, request.property
        )),
        Incoming::Reject { reason, .. } => Error::protocol(format!("request rejected: {}", reason)),
        Incoming::Abort { reason, .. } => Error::protocol(format!("request aborted: {}", reason)),
        other => Error::protocol(format!("unexpected acknowledgement: {:?}", other)),
    }
}

async fn io_task(
    mut commands: mpsc::Receiver<Command>,
    outgoing: mpsc::Sender<Outgoing>,
    mut incoming: mpsc::Receiver<Incoming>,
) {
    let mut pending: HashMap<u8, oneshot::Sender<Result<Incoming>>> = HashMap::new();
    let mut listeners: Vec<mpsc::Sender<IAm>> = Vec::new();
    let mut next_id: u8 = 0;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All transport handles dropped, stopping I/O task");
                    break;
                };

                match command {
                    Command::Request { destination, request, reply } => {
                        // Callers that timed out dropped their receivers.
                        pending.retain(|_, tx| !tx.is_closed());

                        let Some(invoke_id) = allocate_invoke_id(&pending, &mut next_id) else {
                            warn!(in_flight = pending.len(), "No free invoke id, failing request");
                            let _ = reply.send(Err(Error::protocol("all 256 invoke ids are in flight")));
                            continue;
                        };

                        trace!(invoke_id, ?destination, "Sending confirmed request");
                        let frame = Outgoing::Confirmed { invoke_id, destination, request };
                        if outgoing.send(frame).await.is_err() {
                            warn!("Link closed, stopping I/O task");
                            break;
                        }
                        pending.insert(invoke_id, reply);
                    }
                    Command::WhoIs { listener } => {
                        listeners.push(listener);
                        if outgoing.send(Outgoing::WhoIs).await.is_err() {
                            warn!("Link closed, stopping I/O task");
                            break;
                        }
                    }
                }
            }
            frame = incoming.recv() => {
                let Some(frame) = frame else {
                    warn!("Link closed, stopping I/O task");
                    break;
                };
                dispatch(frame, &mut pending, &mut listeners);
            }
        }
    }
}

fn dispatch(
    frame: Incoming,
    pending: &mut HashMap<u8, oneshot::Sender<Result<Incoming>>>,
    listeners: &mut Vec<mpsc::Sender<IAm>>,
) {
    if let Incoming::IAm {
        source,
        device_id,
        max_apdu,
        segmentation,
        vendor_id,
    } = frame
    {
        let address = match address::encode(&source) {
            Ok(address) => address,
            Err(e) => {
                warn!(error = %e, "Dropping I-Am with malformed source");
                return;
            }
        };
        let announcement = IAm {
            address,
            device_id,
            max_apdu,
            segmentation,
            vendor_id,
        };
        listeners.retain(|l| !l.is_closed());
        for listener in listeners.iter() {
            if listener.try_send(announcement.clone()).is_err() {
                warn!(device_id, "Announcement listener is full, dropping I-Am");
            }
        }
        return;
    }

    let Some(invoke_id) = frame.invoke_id() else {
        return;
    };
    match pending.remove(&invoke_id) {
        Some(reply) => {
            // The caller may have timed out in the meantime.
            let _ = reply.send(Ok(frame));
        }
        None => debug!(invoke_id, "Reply for unknown invoke id"),
    }
}

/// Next invoke id not currently in flight, if any.
fn allocate_invoke_id<T>(pending: &HashMap<u8, T>, next: &mut u8) -> Option<u8> {
    for _ in 0..=u8::MAX as usize {
        let candidate = *next;
        *next = next.wrapping_add(1);
        if !pending.contains_key(&candidate) {
            return Some(candidate);
        }
    }
    None
}
