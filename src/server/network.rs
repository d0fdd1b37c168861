//! TCP listener and per-connection dispatch into the queue manager.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::broker::manager::QueueManager;
use crate::config::RpcSettings;
use crate::error::{Error, Result};

use super::acl::Acl;
use super::codec::{Outbound, RpcCodec};
use super::protocol::*;

/// Bind the configured endpoint and serve until the task is dropped.
pub async fn serve(manager: Arc<QueueManager>, settings: RpcSettings) -> Result<()> {
    let acl = settings.acl.as_deref().map(Acl::parse).transpose()?;
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "broker listening");
    serve_listener(listener, manager, acl).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    manager: Arc<QueueManager>,
    acl: Option<Acl>,
) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        if let Some(acl) = &acl {
            if !acl.permits(&peer.ip()) {
                warn!(peer = %peer, "connection refused by acl");
                continue;
            }
        }
        debug!(peer = %peer, "client connected");
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, manager).await {
                debug!(peer = %peer, "connection closed with error: {}", e);
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, manager: Arc<QueueManager>) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut framed = Framed::new(socket, RpcCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let id = frame.header.id();
        let response = match handle_request(&manager, frame.header.meta, &frame.payload) {
            Ok(response) => response,
            Err(e) => Response::Error(ErrorReply {
                kind: e.kind().to_string(),
                message: e.to_string(),
            }),
        };
        framed.send(Outbound { id, response }).await?;
    }
    Ok(())
}

fn handle_request(manager: &QueueManager, opcode: u8, payload: &[u8]) -> Result<Response> {
    let (args, body) = split_payload(payload)?;
    match opcode {
        OP_PING => Ok(Response::Ok),

        OP_PUT => {
            let args: PutArgs = decode_args(args)?;
            let id = manager.put(
                &args.queue,
                Bytes::copy_from_slice(body),
                args.headers,
                args.tid.as_deref(),
            )?;
            Response::data(&IdReply { id }, Bytes::new())
        }

        OP_GET => {
            let args: GetArgs = decode_args(args)?;
            match manager.dequeue(&args.queue, &args.selector, args.tid.as_deref())? {
                Some(message) => Response::data(
                    &MessageMeta {
                        id: message.id,
                        headers: message.headers,
                    },
                    message.body,
                ),
                None => Ok(Response::Null),
            }
        }

        OP_LIST => {
            let args: ListArgs = decode_args(args)?;
            let headers = manager.list(&args.queue)?;
            Response::data(&HeadersReply { headers }, Bytes::new())
        }

        OP_PUBLISH => {
            let args: PublishArgs = decode_args(args)?;
            let id = manager.publish(
                &args.topic,
                Bytes::copy_from_slice(body),
                args.headers,
                args.tid.as_deref(),
            )?;
            Response::data(&IdReply { id }, Bytes::new())
        }

        OP_RETRIEVE => {
            let args: RetrieveArgs = decode_args(args)?;
            match manager.retrieve(
                &args.topic,
                args.seen.as_deref(),
                &args.selector,
                args.tid.as_deref(),
            )? {
                Some(message) => Response::data(
                    &MessageMeta {
                        id: message.id,
                        headers: message.headers,
                    },
                    message.body,
                ),
                None => Ok(Response::Null),
            }
        }

        OP_BEGIN => {
            let args: BeginArgs = decode_args(args)?;
            let tid = manager.begin(Duration::from_secs(args.timeout_secs))?;
            Response::data(&TidReply { tid }, Bytes::new())
        }

        OP_COMMIT => {
            let args: TidArgs = decode_args(args)?;
            manager.commit(&args.tid)?;
            Ok(Response::Ok)
        }

        OP_ABORT => {
            let args: TidArgs = decode_args(args)?;
            manager.abort(&args.tid)?;
            Ok(Response::Ok)
        }

        other => Err(Error::InvalidArgument(format!(
            "unknown opcode 0x{:02x}",
            other
        ))),
    }
}

fn decode_args<T: serde::de::DeserializeOwned>(args: &[u8]) -> Result<T> {
    serde_json::from_slice(args).map_err(|e| Error::InvalidArgument(format!("args: {}", e)))
}
