use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use rand::seq::IteratorRandom;
use tokio::{
    net::UdpSocket,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::{validate_write, ClientError, RequestError},
    message::{Message, MAX_DATAGRAM},
};

/// How long a client waits for a reply before giving up on a host.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hosts: Vec<SocketAddr>,
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn new(hosts: Vec<SocketAddr>) -> Self {
        Self {
            hosts,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One or more keys or values. Lets callers pass a single `&str` where a
/// request expects a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch(Vec<String>);

impl Batch {
    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl From<&str> for Batch {
    fn from(item: &str) -> Self {
        Batch(vec![item.to_string()])
    }
}

impl From<String> for Batch {
    fn from(item: String) -> Self {
        Batch(vec![item])
    }
}

impl From<Vec<String>> for Batch {
    fn from(items: Vec<String>) -> Self {
        Batch(items)
    }
}

impl From<Vec<&str>> for Batch {
    fn from(items: Vec<&str>) -> Self {
        Batch(items.into_iter().map(str::to_string).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Batch {
    fn from(items: [&str; N]) -> Self {
        Batch(items.iter().map(|item| item.to_string()).collect())
    }
}

/// A `write_result` together with the replica that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub host: SocketAddr,
    pub keys: Vec<String>,
    pub values: Vec<String>,
}

/// A `read_result` together with the replica that sent it. Absent keys have
/// neither a value nor an order index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReply {
    pub host: SocketAddr,
    pub keys: Vec<String>,
    pub values: Vec<Option<String>>,
    pub order_indices: Vec<Option<u64>>,
}

impl ReadReply {
    /// Value of the first key, the only one for single-key reads.
    pub fn value(&self) -> Option<&str> {
        self.values.first().and_then(|value| value.as_deref())
    }

    pub fn order_index(&self) -> Option<u64> {
        self.order_indices.first().copied().flatten()
    }

    /// Value and order index of `key`, if it was read and exists.
    pub fn get(&self, key: &str) -> Option<(&str, u64)> {
        let position = self.keys.iter().position(|k| k == key)?;
        let value = self.values.get(position)?.as_deref()?;
        let order_index = (*self.order_indices.get(position)?)?;
        Some((value, order_index))
    }
}

#[derive(Debug)]
struct OutstandingWrite {
    request: u64,
    host: SocketAddr,
    keys: Vec<String>,
    values: Vec<String>,
}

impl OutstandingWrite {
    fn message(&self) -> Message {
        Message::ClientWrite {
            keys: self.keys.clone(),
            values: self.values.clone(),
            request: Some(self.request),
        }
    }
}

/// Talks to the replicas over a single UDP socket.
///
/// Every request carries a fresh number and only a reply echoing that number
/// answers it. A request that times out is redirected once to a different
/// replica under the same number. The redirect may apply a write twice.
///
/// Results of submitted writes that arrive while waiting for something else
/// are kept in an inbox until [`Client::write_recv`] collects them. Any other
/// reply nobody waits for is dropped, so late answers to a redirected request
/// never reach a later call.
pub struct Client {
    socket: UdpSocket,
    hosts: Vec<SocketAddr>,
    timeout: Duration,
    next_request: u64,
    inbox: VecDeque<(SocketAddr, Message)>,
    outstanding: VecDeque<OutstandingWrite>,
}

impl Client {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        if config.hosts.is_empty() {
            return Err(ClientError::NoHosts);
        }
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        info!(hosts = ?config.hosts, local = ?socket.local_addr().ok(), "client constructed");
        Ok(Self {
            socket,
            hosts: config.hosts,
            timeout: config.timeout,
            next_request: 0,
            inbox: VecDeque::new(),
            outstanding: VecDeque::new(),
        })
    }

    /// Writes every key-value pair and waits for the write to be
    /// acknowledged. Returns the replica that answered.
    ///
    /// Invalid requests are rejected without touching the network. Without
    /// an explicit `host` a random replica is used.
    pub async fn write(
        &mut self,
        keys: impl Into<Batch>,
        values: impl Into<Batch>,
        host: Option<SocketAddr>,
    ) -> Result<SocketAddr, ClientError> {
        let keys = keys.into().into_inner();
        let values = values.into().into_inner();
        validate_write(&keys, &values)?;

        let host = self.target(host)?;
        let id = self.next_request();
        let request = Message::ClientWrite {
            keys,
            values,
            request: Some(id),
        };
        let (from, _) = self
            .request(host, &request, |reply| {
                matches!(reply, Message::WriteResult { request: Some(r), .. } if *r == id)
            })
            .await?;
        Ok(from)
    }

    /// Sends a write without waiting for it. Pair every call with a later
    /// [`Client::write_recv`].
    pub async fn submit_write(
        &mut self,
        keys: impl Into<Batch>,
        values: impl Into<Batch>,
        host: Option<SocketAddr>,
    ) -> Result<SocketAddr, ClientError> {
        let keys = keys.into().into_inner();
        let values = values.into().into_inner();
        validate_write(&keys, &values)?;

        let host = self.target(host)?;
        let write = OutstandingWrite {
            request: self.next_request(),
            host,
            keys,
            values,
        };
        self.send(host, &write.message()).await?;
        self.outstanding.push_back(write);
        Ok(host)
    }

    /// Number of submitted writes still waiting for their result.
    pub fn outstanding_writes(&self) -> usize {
        self.outstanding.len()
    }

    /// Waits for the result of any submitted write.
    ///
    /// On timeout the oldest submitted write is resent once to another
    /// replica. If that times out too, the write is abandoned.
    pub async fn write_recv(&mut self) -> Result<WriteAck, ClientError> {
        let Some(oldest) = self.outstanding.front() else {
            return Err(ClientError::NoOutstandingWrite);
        };
        let mut host = oldest.host;
        let mut redirected = false;
        loop {
            let expected: Vec<u64> = self.outstanding.iter().map(|write| write.request).collect();
            let accept = |reply: &Message| match reply {
                Message::WriteResult {
                    request: Some(request),
                    ..
                } => expected.contains(request),
                _ => false,
            };

            match self.receive(host, accept).await {
                Ok((
                    from,
                    Message::WriteResult {
                        key,
                        value,
                        request,
                    },
                )) => {
                    self.outstanding.retain(|write| Some(write.request) != request);
                    return Ok(WriteAck {
                        host: from,
                        keys: key,
                        values: value,
                    });
                }
                Ok(_) => return Err(ClientError::UnexpectedReply("write_result")),
                Err(ClientError::Timeout { host: silent, after }) if !redirected => {
                    let retry = self.target_excluding(silent)?;
                    let Some(write) = self.outstanding.front_mut() else {
                        return Err(ClientError::Timeout { host: silent, after });
                    };
                    warn!(
                        host = %silent,
                        %retry,
                        ?after,
                        keys = ?write.keys,
                        "write timed out, redirecting"
                    );
                    write.host = retry;
                    let request = write.message();
                    self.send(retry, &request).await?;
                    host = retry;
                    redirected = true;
                }
                Err(ClientError::Timeout { host: silent, after }) => {
                    if let Some(write) = self.outstanding.pop_front() {
                        warn!(
                            host = %silent,
                            keys = ?write.keys,
                            "abandoning write after redirect"
                        );
                    }
                    return Err(ClientError::Timeout { host: silent, after });
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Reads one or more keys. Waits while any of them has a write in flight
    /// on the answering replica.
    pub async fn read(
        &mut self,
        keys: impl Into<Batch>,
        host: Option<SocketAddr>,
    ) -> Result<ReadReply, ClientError> {
        let keys = keys.into().into_inner();
        if keys.is_empty() {
            return Err(RequestError::Empty.into());
        }

        let host = self.target(host)?;
        let id = self.next_request();
        let request = Message::ClientRead {
            key: keys,
            request: Some(id),
        };
        let (from, reply) = self
            .request(host, &request, |reply| {
                matches!(reply, Message::ReadResult { request: Some(r), .. } if *r == id)
            })
            .await?;
        let Message::ReadResult {
            key,
            value,
            order_index,
            ..
        } = reply
        else {
            return Err(ClientError::UnexpectedReply("read_result"));
        };
        Ok(ReadReply {
            host: from,
            keys: key,
            values: value,
            order_indices: order_index,
        })
    }

    /// Tells every replica to stop and closes the socket.
    pub async fn exit(self) -> Result<(), ClientError> {
        for &host in &self.hosts {
            self.send(host, &Message::Exit).await?;
        }
        info!("client sent exit to every host");
        Ok(())
    }

    /// Tells a single replica to stop.
    pub async fn exit_single(&self, host: SocketAddr) -> Result<(), ClientError> {
        self.send(host, &Message::Exit).await
    }

    fn next_request(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request = self.next_request.wrapping_add(1);
        id
    }

    fn target(&self, host: Option<SocketAddr>) -> Result<SocketAddr, ClientError> {
        match host {
            Some(host) => Ok(host),
            None => self
                .hosts
                .iter()
                .copied()
                .choose(&mut rand::thread_rng())
                .ok_or(ClientError::NoHosts),
        }
    }

    /// A random host other than `silent`. Falls back to `silent` when it is
    /// the only one known.
    fn target_excluding(&self, silent: SocketAddr) -> Result<SocketAddr, ClientError> {
        self.hosts
            .iter()
            .copied()
            .filter(|host| *host != silent)
            .choose(&mut rand::thread_rng())
            .or_else(|| self.hosts.first().copied())
            .ok_or(ClientError::NoHosts)
    }

    async fn send(&self, host: SocketAddr, message: &Message) -> Result<(), ClientError> {
        let bytes = serde_json::to_vec(message)?;
        self.socket.send_to(&bytes, host).await?;
        debug!(%host, kind = message.kind(), request = ?message.request(), "client sent message");
        Ok(())
    }

    /// Sends `request` and waits for a reply `accept` recognises, redirecting
    /// once on timeout.
    async fn request<F>(
        &mut self,
        host: SocketAddr,
        request: &Message,
        accept: F,
    ) -> Result<(SocketAddr, Message), ClientError>
    where
        F: Fn(&Message) -> bool,
    {
        self.send(host, request).await?;
        match self.receive(host, &accept).await {
            Err(ClientError::Timeout { host: silent, after }) => {
                let retry = self.target_excluding(silent)?;
                warn!(
                    host = %silent,
                    %retry,
                    ?after,
                    kind = request.kind(),
                    "no reply, redirecting"
                );
                self.send(retry, request).await?;
                self.receive(retry, &accept).await
            }
            other => other,
        }
    }

    /// Next reply `accept` recognises, from the inbox or the socket.
    async fn receive(
        &mut self,
        host: SocketAddr,
        accept: impl Fn(&Message) -> bool,
    ) -> Result<(SocketAddr, Message), ClientError> {
        if let Some(position) = self.inbox.iter().position(|(_, reply)| accept(reply)) {
            if let Some(queued) = self.inbox.remove(position) {
                return Ok(queued);
            }
        }

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => {
                    return Err(ClientError::Timeout {
                        host,
                        after: self.timeout,
                    })
                }
            };
            let reply: Message = serde_json::from_slice(&buf[..len])?;
            debug!(
                peer = %from,
                kind = reply.kind(),
                request = ?reply.request(),
                "client received reply"
            );
            if accept(&reply) {
                return Ok((from, reply));
            }
            self.keep_for_later(from, reply);
        }
    }

    /// Queues the result of a submitted write that is still outstanding, at
    /// most once per write. Everything else is dropped.
    fn keep_for_later(&mut self, from: SocketAddr, reply: Message) {
        let request = match &reply {
            Message::WriteResult {
                request: Some(request),
                ..
            } => *request,
            _ => {
                debug!(
                    peer = %from,
                    kind = reply.kind(),
                    request = ?reply.request(),
                    "dropping unexpected reply"
                );
                return;
            }
        };
        let outstanding = self.outstanding.iter().any(|write| write.request == request);
        let queued = self
            .inbox
            .iter()
            .any(|(_, queued)| queued.request() == Some(request));
        if outstanding && !queued {
            self.inbox.push_back((from, reply));
        } else {
            debug!(peer = %from, request, "dropping write result nobody waits for");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn recv_message(socket: &UdpSocket) -> (SocketAddr, Message) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram in time")
            .expect("recv");
        (from, serde_json::from_slice(&buf[..len]).expect("json"))
    }

    async fn send_message(socket: &UdpSocket, to: SocketAddr, message: &Message) {
        let bytes = serde_json::to_vec(message).expect("json");
        socket.send_to(&bytes, to).await.expect("send");
    }

    fn read_result(key: &str, value: &str, request: Option<u64>) -> Message {
        Message::ReadResult {
            key: vec![key.into()],
            value: vec![Some(value.into())],
            order_index: vec![Some(0)],
            request,
        }
    }

    #[test]
    fn batches_wrap_single_items() {
        assert_eq!(Batch::from("k").into_inner(), vec!["k".to_string()]);
        assert_eq!(
            Batch::from(["a", "b"]).into_inner(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(Batch::from(vec!["x"]), Batch::from("x".to_string()));
    }

    #[test]
    fn read_reply_accessors() {
        let reply = ReadReply {
            host: localhost(1),
            keys: vec!["a".into(), "b".into()],
            values: vec![Some("1".into()), None],
            order_indices: vec![Some(3), None],
        };
        assert_eq!(reply.value(), Some("1"));
        assert_eq!(reply.order_index(), Some(3));
        assert_eq!(reply.get("a"), Some(("1", 3)));
        assert_eq!(reply.get("b"), None);
        assert_eq!(reply.get("c"), None);
    }

    #[tokio::test]
    async fn connect_requires_hosts() {
        let result = Client::connect(ClientConfig::new(Vec::new())).await;
        assert!(matches!(result, Err(ClientError::NoHosts)));
    }

    #[tokio::test]
    async fn invalid_writes_never_reach_the_network() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let host = silent.local_addr().expect("addr");
        let mut client = Client::connect(ClientConfig::new(vec![host]))
            .await
            .expect("client");

        let mismatched = client.write(["a", "b"], "1", None).await;
        assert!(matches!(
            mismatched,
            Err(ClientError::InvalidRequest(RequestError::LengthMismatch { .. }))
        ));
        let duplicated = client.submit_write(["a", "a"], ["1", "2"], None).await;
        assert!(matches!(
            duplicated,
            Err(ClientError::InvalidRequest(RequestError::DuplicateKey(_)))
        ));
        assert_eq!(client.outstanding_writes(), 0);

        let mut buf = [0u8; 64];
        let quiet = Duration::from_millis(100);
        let nothing = tokio::time::timeout(quiet, silent.recv_from(&mut buf)).await;
        assert!(nothing.is_err(), "no datagram should have been sent");
    }

    #[tokio::test]
    async fn unanswered_read_redirects_once_then_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let host = silent.local_addr().expect("addr");
        let mut client = Client::connect(
            ClientConfig::new(vec![host]).with_timeout(Duration::from_millis(100)),
        )
        .await
        .expect("client");

        let result = client.read("k", None).await;
        assert!(matches!(result, Err(ClientError::Timeout { host: h, .. }) if h == host));

        let mut requests = Vec::new();
        for _ in 0..2 {
            let (_, message) = recv_message(&silent).await;
            let Message::ClientRead { key, request } = message else {
                panic!("expected a client read, got {message:?}");
            };
            assert_eq!(key, vec!["k".to_string()]);
            requests.push(request);
        }
        assert!(requests[0].is_some());
        assert_eq!(requests[0], requests[1], "a redirect keeps the request number");
    }

    #[tokio::test]
    async fn write_recv_without_submissions_fails_fast() {
        let mut client = Client::connect(ClientConfig::new(vec![localhost(9)]))
            .await
            .expect("client");
        assert!(matches!(
            client.write_recv().await,
            Err(ClientError::NoOutstandingWrite)
        ));
    }

    #[tokio::test]
    async fn write_recv_redirects_once_then_abandons_the_write() {
        let first = UdpSocket::bind("127.0.0.1:0").await.expect("bind first");
        let second = UdpSocket::bind("127.0.0.1:0").await.expect("bind second");
        let first_addr = first.local_addr().expect("first addr");
        let second_addr = second.local_addr().expect("second addr");
        let mut client = Client::connect(
            ClientConfig::new(vec![first_addr, second_addr])
                .with_timeout(Duration::from_millis(100)),
        )
        .await
        .expect("client");

        client.submit_write("k", "v", Some(first_addr)).await.expect("submit");
        let result = client.write_recv().await;
        assert!(
            matches!(result, Err(ClientError::Timeout { host, .. }) if host == second_addr),
            "unexpected result {result:?}"
        );
        assert_eq!(client.outstanding_writes(), 0);

        let (_, original) = recv_message(&first).await;
        let (_, redirected) = recv_message(&second).await;
        assert!(matches!(redirected, Message::ClientWrite { ref keys, .. } if *keys == ["k"]));
        assert!(original.request().is_some());
        assert_eq!(redirected, original);
    }

    #[tokio::test]
    async fn late_reply_from_a_timed_out_host_is_not_taken_by_the_next_read() {
        let slow = UdpSocket::bind("127.0.0.1:0").await.expect("bind slow");
        let fast = UdpSocket::bind("127.0.0.1:0").await.expect("bind fast");
        let slow_addr = slow.local_addr().expect("slow addr");
        let fast_addr = fast.local_addr().expect("fast addr");
        let mut client = Client::connect(
            ClientConfig::new(vec![slow_addr, fast_addr])
                .with_timeout(Duration::from_millis(200)),
        )
        .await
        .expect("client");

        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let (sent, late_sent) = tokio::sync::oneshot::channel::<()>();
        let slow_host = tokio::spawn(async move {
            let (client_addr, message) = recv_message(&slow).await;
            released.await.expect("release");
            send_message(&slow, client_addr, &read_result("k", "old", message.request())).await;
            sent.send(()).expect("report late reply");
        });
        let fast_host = tokio::spawn(async move {
            for value in ["old", "new"] {
                let (client_addr, message) = recv_message(&fast).await;
                send_message(&fast, client_addr, &read_result("k", value, message.request())).await;
            }
        });

        let first = client.read("k", Some(slow_addr)).await.expect("redirected read");
        assert_eq!(first.host, fast_addr);
        assert_eq!(first.value(), Some("old"));

        release.send(()).expect("release slow host");
        late_sent.await.expect("late reply sent");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = client.read("k", Some(fast_addr)).await.expect("read");
        assert_eq!(second.host, fast_addr);
        assert_eq!(second.value(), Some("new"));
        assert!(client.inbox.is_empty());

        slow_host.await.expect("slow host");
        fast_host.await.expect("fast host");
    }

    #[tokio::test]
    async fn repeated_writes_are_told_apart_by_request_number() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let host = server.local_addr().expect("addr");
        let mut client = Client::connect(ClientConfig::new(vec![host]))
            .await
            .expect("client");

        client.submit_write("k", "v", None).await.expect("submit");
        let (client_addr, submitted) = recv_message(&server).await;

        let responder = tokio::spawn(async move {
            let (_, blocking) = recv_message(&server).await;
            // The blocking write is answered first, then the submitted one.
            for message in [&blocking, &submitted] {
                let reply = Message::WriteResult {
                    key: vec!["k".into()],
                    value: vec!["v".into()],
                    request: message.request(),
                };
                send_message(&server, client_addr, &reply).await;
            }
        });

        client.write("k", "v", None).await.expect("blocking write");
        assert_eq!(client.outstanding_writes(), 1);
        let ack = client.write_recv().await.expect("submitted write");
        assert_eq!(ack.keys, vec!["k".to_string()]);
        assert_eq!(client.outstanding_writes(), 0);
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn only_results_of_outstanding_writes_wait_in_the_inbox() {
        let server = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let host = server.local_addr().expect("addr");
        let mut client = Client::connect(ClientConfig::new(vec![host]))
            .await
            .expect("client");
        client.submit_write("a", "1", None).await.expect("submit");

        let responder = tokio::spawn(async move {
            let (client_addr, write) = recv_message(&server).await;
            let (_, read) = recv_message(&server).await;
            let result = Message::WriteResult {
                key: vec!["a".into()],
                value: vec!["1".into()],
                request: write.request(),
            };
            // Unsolicited replies and a duplicate result arrive while the
            // client waits for its read.
            let stray = Message::WriteResult {
                key: vec!["a".into()],
                value: vec!["1".into()],
                request: Some(999),
            };
            let unnumbered = read_result("b", "x", None);
            for reply in [&stray, &unnumbered, &result, &result] {
                send_message(&server, client_addr, reply).await;
            }
            let answer = Message::ReadResult {
                key: vec!["b".into()],
                value: vec![None],
                order_index: vec![None],
                request: read.request(),
            };
            send_message(&server, client_addr, &answer).await;
        });

        let read = client.read("b", None).await.expect("read");
        assert_eq!(read.value(), None);
        assert_eq!(client.inbox.len(), 1);

        let ack = client.write_recv().await.expect("write result");
        assert_eq!(ack.keys, vec!["a".to_string()]);
        assert_eq!(client.outstanding_writes(), 0);
        assert!(client.inbox.is_empty());
        responder.await.expect("responder");
    }
}
