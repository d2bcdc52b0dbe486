//! In-process publish/subscribe binding.
//!
//! # Responsibilities
//! - Subject-addressed request/reply over tokio channels
//! - Queue groups: each request is delivered to one subscriber of a subject
//! - JSON codecs mirroring the HTTP binding
//!
//! # Design Decisions
//! - Subscribers take turns in subscription order; closed ones are pruned
//!   on the next request
//! - A request with no live subscriber fails as a transport error
//! - Failures travel as a reply carrying an `error-kind` header

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::endpoint::{Context, Endpoint, X_REQUEST_ID};
use crate::error::{Error, Result};
use crate::lifecycle::Shutdown;
use crate::transport::http::ErrorBody;
use crate::transport::{Client, RoundTrip, Server};

/// Header naming the [`crate::error::ErrorKind`] of a failed reply.
pub const ERROR_KIND_HEADER: &str = "error-kind";

const INBOX_CAPACITY: usize = 64;

/// A bus message, request or reply.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub subject: String,
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            headers: HashMap::new(),
            payload: payload.into(),
        }
    }
}

/// A request handed to one subscriber.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    reply: oneshot::Sender<Message>,
}

impl Delivery {
    pub fn respond(self, reply: Message) {
        // The requester may have given up already.
        let _ = self.reply.send(reply);
    }
}

#[derive(Default)]
struct QueueGroup {
    members: Vec<mpsc::Sender<Delivery>>,
    next: usize,
}

/// A subject-addressed message bus.
#[derive(Clone, Default)]
pub struct Bus {
    groups: Arc<DashMap<String, QueueGroup>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the queue group of `subject`.
    pub fn queue_subscribe(&self, subject: &str) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.groups.entry(subject.to_string()).or_default().members.push(tx);
        rx
    }

    fn pick(&self, subject: &str) -> Option<mpsc::Sender<Delivery>> {
        let mut group = self.groups.get_mut(subject)?;
        group.members.retain(|m| !m.is_closed());
        if group.members.is_empty() {
            return None;
        }
        let i = group.next % group.members.len();
        group.next = group.next.wrapping_add(1);
        Some(group.members[i].clone())
    }

    /// Send `message` to one subscriber of its subject and wait for the reply.
    pub async fn request(&self, message: Message) -> Result<Message> {
        let inbox = self
            .pick(&message.subject)
            .ok_or_else(|| Error::Transport(format!("no responders on '{}'", message.subject)))?;
        let (reply, rx) = oneshot::channel();
        inbox
            .send(Delivery { message, reply })
            .await
            .map_err(|_| Error::transport("subscriber went away"))?;
        rx.await.map_err(|_| Error::transport("request dropped by subscriber"))
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").field("subjects", &self.groups.len()).finish()
    }
}

/// Server binder speaking bus messages.
pub type BusServer<Req, Resp> = Server<Message, Message, Req, Resp>;

/// Serve every request on `subject` until `shutdown` fires.
pub fn serve_subject<Req, Resp>(bus: &Bus, subject: &str, server: BusServer<Req, Resp>, shutdown: &Shutdown) -> JoinHandle<()>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let mut inbox = bus.queue_subscribe(subject);
    let server = Arc::new(server);
    let subject = subject.to_string();
    let stopped = shutdown.signalled();

    tokio::spawn(async move {
        tokio::pin!(stopped);
        tracing::info!(%subject, "Bus binding subscribed");
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                delivery = inbox.recv() => match delivery {
                    Some(delivery) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            let Delivery { message, reply } = delivery;
                            let out = server.serve(Context::background(), message).await;
                            let _ = reply.send(out);
                        });
                    }
                    None => break,
                }
            }
        }
        tracing::info!(%subject, "Bus binding stopped");
    })
}

/// Requests on one subject.
#[derive(Debug, Clone)]
pub struct BusClient {
    bus: Bus,
    subject: String,
}

impl BusClient {
    pub fn new(bus: Bus, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }
}

impl RoundTrip<Message, Message> for BusClient {
    fn round_trip(&self, _ctx: &Context, mut wire: Message) -> BoxFuture<'static, Result<Message>> {
        wire.subject = self.subject.clone();
        let bus = self.bus.clone();
        async move { bus.request(wire).await }.boxed()
    }
}

pub fn decode_json_message<T: DeserializeOwned>(_ctx: &Context, msg: Message) -> Result<T> {
    serde_json::from_slice(&msg.payload).map_err(Error::decode)
}

pub fn encode_json_message<T: Serialize>(_ctx: &Context, value: T) -> Result<Message> {
    let payload = serde_json::to_vec(&value).map_err(Error::encode)?;
    Ok(Message::new(String::new(), payload))
}

pub fn encode_error_message(_ctx: &Context, err: &Error) -> Message {
    let kind = err.kind();
    let body = ErrorBody {
        error: err.to_string(),
        kind: kind.as_str().to_string(),
    };
    let mut msg = Message::new(String::new(), serde_json::to_vec(&body).unwrap_or_default());
    msg.headers.insert(ERROR_KIND_HEADER.to_string(), kind.as_str().to_string());
    msg
}

/// Decode a reply, turning error replies back into errors.
pub fn decode_json_reply<T: DeserializeOwned>(ctx: &Context, msg: Message) -> Result<T> {
    let Some(kind) = msg.headers.get(ERROR_KIND_HEADER) else {
        return decode_json_message(ctx, msg);
    };
    let detail = serde_json::from_slice::<ErrorBody>(&msg.payload)
        .map(|b| b.error)
        .unwrap_or_default();
    Err(match kind.as_str() {
        "rate_limited" => Error::RateLimited,
        "decode" => Error::Decode(detail),
        other => Error::Transport(format!("{other}: {detail}")),
    })
}

pub fn request_id_from_message(ctx: Context, msg: &Message) -> Context {
    match msg.headers.get(X_REQUEST_ID) {
        Some(id) if !id.is_empty() => ctx.with_request_id(id.clone()),
        _ => ctx,
    }
}

pub fn request_id_to_message(ctx: &Context, msg: &mut Message) {
    msg.headers.insert(X_REQUEST_ID.to_string(), ctx.request_id().to_string());
}

/// JSON server with request-id propagation.
pub fn json_server<Req, Resp>(endpoint: Endpoint<Req, Resp>) -> BusServer<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    Server::new(endpoint, decode_json_message::<Req>, encode_json_message::<Resp>, encode_error_message)
        .before(request_id_from_message)
        .after(request_id_to_message)
}

/// JSON client endpoint for `subject`.
pub fn json_client<Req, Resp>(bus: Bus, subject: &str) -> Endpoint<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    let transport: Arc<dyn RoundTrip<Message, Message>> = Arc::new(BusClient::new(bus, subject));
    Client::new(
        transport,
        encode_json_message::<Req>,
        decode_json_reply::<Resp>,
    )
    .before(request_id_to_message)
    .endpoint()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_queue_group_takes_turns() {
        let bus = Bus::new();
        let mut a = bus.queue_subscribe("stringsvc.count");
        let mut b = bus.queue_subscribe("stringsvc.count");

        for (i, name) in [(0, "a"), (1, "b"), (2, "a")] {
            let requester = tokio::spawn({
                let bus = bus.clone();
                async move { bus.request(Message::new("stringsvc.count", format!("{i}"))).await }
            });
            let delivery = if name == "a" { a.recv().await } else { b.recv().await }.unwrap();
            delivery.respond(Message::new("", name));
            assert_eq!(requester.await.unwrap().unwrap().payload, Bytes::from(name));
        }
    }

    #[tokio::test]
    async fn test_no_responders() {
        let bus = Bus::new();
        let err = bus.request(Message::new("nobody.home", "{}")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        drop(bus.queue_subscribe("gone"));
        assert!(bus.request(Message::new("gone", "{}")).await.is_err());
    }

    #[tokio::test]
    async fn test_json_round_trip_with_errors() {
        let bus = Bus::new();
        let shutdown = Shutdown::new();
        let ep: Endpoint<String, usize> = Endpoint::new(|_ctx, s: String| async move {
            if s == "throttle" {
                Err(Error::RateLimited)
            } else {
                Ok(s.len())
            }
        });
        let task = serve_subject(&bus, "stringsvc.count", json_server(ep), &shutdown);

        let client: Endpoint<String, usize> = json_client(bus.clone(), "stringsvc.count");
        assert_eq!(client.call(Context::background(), "hello".into()).await.unwrap(), 5);
        let err = client.call(Context::background(), "throttle".into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        shutdown.trigger();
        task.await.unwrap();
    }
}
