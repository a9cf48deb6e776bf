/// Stratum server - async TCP front end for miners.
///
/// Owns the live connection set and the job registry, accepts connections,
/// runs one strictly serialized packet loop per connection, and broadcasts
/// new work. Packet handling for different connections is fully independent;
/// within one connection at most one handler is ever in flight.
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use vetra_core::difficulty::{meets_target, target_from_difficulty};
use vetra_core::work::{CommitOutcome, WorkSource};

use super::codec::{http_redirect, FrameDecoder, FrameError};
use super::connection::{Connection, Outbound};
use super::protocol::{self, Request, Response, Submission};
use crate::config::Config;
use crate::error::ShareError;
use crate::jobs::{Job, JobRegistry};
use crate::metrics::prometheus as metrics;

/// Peers silent longer than this are dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(600);

/// One validated, deduplicated share, handed to the accounting collaborator.
#[derive(Debug, Clone)]
pub struct ShareEvent {
    pub username: String,
    pub job_id: String,
    pub difficulty: u64,
    pub block: bool,
}

pub struct StratumServer {
    config: Arc<Config>,
    connections: RwLock<HashMap<String, Arc<RwLock<Connection>>>>,
    connection_count: AtomicUsize,
    jobs: JobRegistry,
    share_sink: RwLock<Option<mpsc::UnboundedSender<ShareEvent>>>,
}

impl StratumServer {
    pub fn new(config: Arc<Config>) -> Self {
        tracing::info!(
            "🌐 creating stratum server on {}:{}",
            config.host,
            config.port
        );
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicUsize::new(0),
            jobs: JobRegistry::new(),
            share_sink: RwLock::new(None),
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Register the consumer of accepted-share events.
    pub async fn set_share_sink(&self, tx: mpsc::UnboundedSender<ShareEvent>) {
        *self.share_sink.write().await = Some(tx);
    }

    async fn emit_share(&self, event: ShareEvent) {
        if let Some(tx) = self.share_sink.read().await.as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Bind with SO_REUSEADDR (restarts must not trip "address in use") and
    /// run the accept loop.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        let sock_addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", addr, e))?;
        socket.bind(&socket2::SockAddr::from(sock_addr))?;
        socket.listen(1024)?;
        let listener = TcpListener::from_std(socket.into())?;
        tracing::info!("✅ stratum server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((mut socket, peer_addr)) => {
                    if self.connection_count() >= self.config.max_connections {
                        tracing::warn!(
                            "🚫 max connections ({}) reached, rejecting {}",
                            self.config.max_connections,
                            peer_addr
                        );
                        let _ = socket.shutdown().await;
                        continue;
                    }
                    tracing::debug!("🔌 new connection from {}", peer_addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer_addr).await {
                            tracing::debug!("connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => tracing::error!("accept failed: {}", e),
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();
        let connection = Arc::new(RwLock::new(Connection::new(
            session_id.clone(),
            peer_addr,
            &self.config,
        )));

        self.connections
            .write()
            .await
            .insert(session_id.clone(), connection.clone());
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        metrics::inc_connections();

        let (mut reader, mut writer) = socket.into_split();

        // Writer task: drains the outbound channel. Queued-byte accounting
        // lives in Outbound; the counter drops once bytes hit the socket.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let queued = Arc::new(AtomicUsize::new(0));
        connection
            .write()
            .await
            .set_outbound(Outbound::new(tx, queued.clone()));
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let len = msg.len();
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
                queued.fetch_sub(len, Ordering::Relaxed);
            }
        });

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 8192];
        'read: loop {
            let n = match tokio::time::timeout(READ_TIMEOUT, reader.read(&mut buf)).await {
                Ok(Ok(0)) => break 'read,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::debug!("read error from {}: {}", peer_addr, e);
                    break 'read;
                }
                Err(_) => {
                    tracing::debug!("⏱️  idle timeout: {}", peer_addr);
                    break 'read;
                }
            };

            let lines = match decoder.push(&buf[..n]) {
                Ok(lines) => lines,
                Err(FrameError::HttpRequest) => {
                    // Browser or proxy probing the port: point it at the
                    // public endpoint and hang up.
                    metrics::inc_http_probes();
                    tracing::debug!("http probe from {}, redirecting", peer_addr);
                    let outbound = connection.read().await.outbound();
                    if let Some(out) = outbound {
                        let _ = out.send(http_redirect(
                            &self.config.public_host,
                            self.config.public_port,
                        ));
                    }
                    break 'read;
                }
                Err(FrameError::Overflow(cap)) => {
                    tracing::warn!("🚫 {} exceeded the {}-byte frame buffer", peer_addr, cap);
                    break 'read;
                }
            };

            // Strictly serialized: no further bytes are read until every
            // decoded line has been fully handled.
            for line in lines {
                if let ControlFlow::Break(()) = self.dispatch(&connection, &line).await {
                    break 'read;
                }
            }
        }

        self.teardown(&connection, "closed").await;
        Ok(())
    }

    /// Destroy + unregister; both halves are idempotent.
    async fn teardown(&self, connection: &Arc<RwLock<Connection>>, reason: &str) {
        let (performed, session_id) = {
            let mut conn = connection.write().await;
            (conn.destroy(), conn.session_id.clone())
        };
        let removed = self.connections.write().await.remove(&session_id).is_some();
        if removed {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            metrics::dec_connections();
        }
        if performed {
            tracing::info!("🔌 connection {} destroyed ({})", session_id, reason);
        }
    }

    async fn send_json(&self, connection: &Arc<RwLock<Connection>>, message: &Value) -> bool {
        let line = message.to_string() + "\n";
        let outbound = connection.read().await.outbound();
        match outbound {
            Some(out) => out.send(line).is_ok(),
            None => false,
        }
    }

    async fn send_response(&self, connection: &Arc<RwLock<Connection>>, resp: &Response) -> bool {
        match serde_json::to_value(resp) {
            Ok(value) => self.send_json(connection, &value).await,
            Err(_) => false,
        }
    }

    /// Apply a ban penalty; Break when it crossed the threshold.
    async fn apply_penalty(
        &self,
        connection: &Arc<RwLock<Connection>>,
        weight: f64,
    ) -> ControlFlow<()> {
        let banned = connection.write().await.penalize(Instant::now(), weight);
        if banned {
            metrics::inc_bans();
            let peer = connection.read().await.peer_addr;
            tracing::warn!("🚫 banning {} (score crossed threshold)", peer);
            self.teardown(connection, "banned").await;
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Handle one decoded line. Break tears the connection down.
    async fn dispatch(
        &self,
        connection: &Arc<RwLock<Connection>>,
        line: &str,
    ) -> ControlFlow<()> {
        // A destroyed connection dispatches nothing further.
        if connection.read().await.is_destroyed() {
            return ControlFlow::Break(());
        }

        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("parse error: {}", e);
                let reply = Response::err(Value::Null, protocol::CODE_PARSE, "Parse error");
                if !self.send_response(connection, &reply).await {
                    self.teardown(connection, "write failed").await;
                    return ControlFlow::Break(());
                }
                return self
                    .apply_penalty(connection, self.config.ban.weight_parse)
                    .await;
            }
        };

        match request.method.as_str() {
            protocol::METHOD_SUBSCRIBE => self.handle_subscribe(connection, &request).await,
            protocol::METHOD_AUTHORIZE => self.handle_authorize(connection, &request).await,
            protocol::METHOD_SUBMIT => self.handle_submit(connection, &request).await,
            other => {
                tracing::debug!("unknown method {:?}", other);
                let reply = Response::err(
                    request.id.clone(),
                    protocol::CODE_METHOD_NOT_FOUND,
                    "Method not found",
                );
                if !self.send_response(connection, &reply).await {
                    self.teardown(connection, "write failed").await;
                    return ControlFlow::Break(());
                }
                self.apply_penalty(connection, self.config.ban.weight_unknown_method)
                    .await
            }
        }
    }

    async fn handle_subscribe(
        &self,
        connection: &Arc<RwLock<Connection>>,
        request: &Request,
    ) -> ControlFlow<()> {
        let (session_id, extranonce1) = {
            let mut conn = connection.write().await;
            conn.mark_subscribed();
            (conn.session_id.clone(), conn.extranonce1.clone())
        };
        tracing::debug!("📡 subscribe from session {}", session_id);

        let result = json!([
            [
                ["mining.notify", session_id.clone()],
                ["mining.set_difficulty", session_id]
            ],
            extranonce1,
            protocol::NONCE2_SIZE,
        ]);
        let reply = Response::ok(request.id.clone(), result);
        if !self.send_response(connection, &reply).await {
            self.teardown(connection, "write failed").await;
            return ControlFlow::Break(());
        }

        // Subscribers get the current job immediately instead of waiting for
        // the next broadcast.
        if let Some(job) = self.jobs.current().await {
            if !self.send_job(connection, &job, false).await {
                self.teardown(connection, "write failed").await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_authorize(
        &self,
        connection: &Arc<RwLock<Connection>>,
        request: &Request,
    ) -> ControlFlow<()> {
        let username = request
            .params
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if username.is_empty() {
            let reply = Response::err(
                request.id.clone(),
                ShareError::Malformed("").code(),
                "Invalid username",
            );
            if !self.send_response(connection, &reply).await {
                self.teardown(connection, "write failed").await;
                return ControlFlow::Break(());
            }
            return self
                .apply_penalty(connection, self.config.ban.weight_malformed)
                .await;
        }

        let password = request
            .params
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !self.config.password.is_empty() && password != self.config.password {
            tracing::warn!("🔐 bad password for user {}", username);
            let reply = Response::err(
                request.id.clone(),
                ShareError::Unauthorized.code(),
                "Bad password",
            );
            if !self.send_response(connection, &reply).await {
                self.teardown(connection, "write failed").await;
                return ControlFlow::Break(());
            }
            return self
                .apply_penalty(connection, self.config.ban.weight_unauthorized)
                .await;
        }

        let newly_added = connection.write().await.authorize(&username);
        if newly_added {
            tracing::info!("🔐 authorized user {}", username);
        }

        let reply = Response::ok(request.id.clone(), json!(true));
        if !self.send_response(connection, &reply).await {
            self.teardown(connection, "write failed").await;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// The share pipeline: format -> auth -> job lookup -> staleness ->
    /// duplicate -> proof -> share target -> (maybe) block commit.
    async fn handle_submit(
        &self,
        connection: &Arc<RwLock<Connection>>,
        request: &Request,
    ) -> ControlFlow<()> {
        let submission = match Submission::from_params(&request.params, self.config.max_nonce_hex)
        {
            Ok(submission) => submission,
            Err(err) => return self.reject(connection, request, err).await,
        };

        let (authorized, extranonce1, share_difficulty) = {
            let conn = connection.read().await;
            (
                conn.is_authorized_user(&submission.username),
                conn.extranonce1.clone(),
                conn.difficulty().unwrap_or(self.config.initial_difficulty),
            )
        };
        if !authorized {
            return self
                .reject(connection, request, ShareError::Unauthorized)
                .await;
        }

        let job = match self.jobs.get(&submission.job_id).await {
            Some(job) => job,
            None => {
                return self
                    .reject(
                        connection,
                        request,
                        ShareError::UnknownJob(submission.job_id.clone()),
                    )
                    .await
            }
        };

        if job.is_stale() && !job.accepts_stale() {
            return self
                .reject(
                    connection,
                    request,
                    ShareError::StaleJob(submission.job_id.clone()),
                )
                .await;
        }

        // Per-job duplicate detection catches the same tuple from any
        // connection, in any order.
        if !job.record_submission(&submission.fingerprint()) {
            return self.reject(connection, request, ShareError::Duplicate).await;
        }

        let proof = match job.get_proof(&extranonce1, &submission) {
            Some(proof) => proof,
            None => return self.reject(connection, request, ShareError::BadProof).await,
        };

        let share_target = target_from_difficulty(share_difficulty);
        if !meets_target(&proof.hash, &share_target) {
            return self.reject(connection, request, ShareError::BadProof).await;
        }

        let mut found_block = false;
        if meets_target(&proof.hash, job.target()) {
            found_block = true;
            match job.commit(&proof).await {
                Ok(CommitOutcome::Accepted { block_hash }) => {
                    metrics::inc_blocks_found();
                    tracing::info!(
                        "🎉 block found! job={} hash={} user={}",
                        job.id(),
                        block_hash,
                        submission.username
                    );
                }
                Ok(CommitOutcome::Rejected { reason }) => {
                    metrics::inc_block_submit_rejected();
                    tracing::error!("block submit rejected for job {}: {}", job.id(), reason);
                }
                Err(e) => {
                    // double-commit or upstream failure; surfaced, never dropped
                    metrics::inc_block_submit_rejected();
                    tracing::error!("commit failed for job {}: {}", job.id(), e);
                }
            }
        }

        metrics::inc_accepted();
        tracing::debug!(
            "📊 share accepted: user={} job={} diff={}",
            submission.username,
            submission.job_id,
            share_difficulty
        );
        self.emit_share(ShareEvent {
            username: submission.username.clone(),
            job_id: submission.job_id.clone(),
            difficulty: share_difficulty,
            block: found_block,
        })
        .await;

        let reply = Response::ok(request.id.clone(), json!(true));
        if !self.send_response(connection, &reply).await {
            self.teardown(connection, "write failed").await;
            return ControlFlow::Break(());
        }

        if self.config.dynamic_difficulty {
            let staged = connection.write().await.retarget(Instant::now());
            if let Some(next) = staged {
                metrics::inc_vardiff_retarget();
                {
                    let conn = connection.read().await;
                    tracing::info!(
                        "🎚️  vardiff retarget: session={} -> {}",
                        conn.session_id,
                        next
                    );
                }
                // Resend the current job clean so the staged difficulty is
                // adopted now rather than at the next template.
                if let Some(current) = self.jobs.current().await {
                    if !self.send_job(connection, &current, true).await {
                        self.teardown(connection, "write failed").await;
                        return ControlFlow::Break(());
                    }
                }
            }
        }
        ControlFlow::Continue(())
    }

    async fn reject(
        &self,
        connection: &Arc<RwLock<Connection>>,
        request: &Request,
        err: ShareError,
    ) -> ControlFlow<()> {
        metrics::inc_rejected();
        if matches!(err, ShareError::Duplicate) {
            metrics::inc_duplicates();
        }
        {
            let conn = connection.read().await;
            tracing::warn!("❌ share rejected from {}: {}", conn.peer_addr, err);
        }
        let reply = Response::err(request.id.clone(), err.code(), &err.to_string());
        if !self.send_response(connection, &reply).await {
            self.teardown(connection, "write failed").await;
            return ControlFlow::Break(());
        }
        self.apply_penalty(connection, err.ban_weight(&self.config.ban))
            .await
    }

    /// Deliver a job: flush any pending difficulty first, restart the
    /// vardiff window, then notify - the miner always starts a job under
    /// its final effective difficulty.
    async fn send_job(
        &self,
        connection: &Arc<RwLock<Connection>>,
        job: &Arc<Job>,
        clean: bool,
    ) -> bool {
        let (difficulty, changed) = {
            let mut conn = connection.write().await;
            if conn.is_destroyed() || !conn.is_subscribed() {
                return true;
            }
            let pair = conn.take_effective_difficulty(self.config.initial_difficulty);
            conn.reset_retarget(Instant::now());
            pair
        };

        if changed
            && !self
                .send_json(connection, &protocol::set_difficulty_message(difficulty))
                .await
        {
            return false;
        }

        let params = match job.notify_params(clean) {
            Ok(params) => params,
            Err(e) => {
                tracing::error!("notify serialization failed for job {}: {}", job.id(), e);
                return true;
            }
        };
        self.send_json(connection, &protocol::notify_message(params))
            .await
    }

    /// Push a job to every subscribed connection. Sends are channel pushes,
    /// so one slow peer cannot stall the broadcast; a peer over its backlog
    /// cap is destroyed instead.
    pub async fn broadcast_job(&self, job: &Arc<Job>, clean: bool) {
        let conns: Vec<Arc<RwLock<Connection>>> = {
            self.connections.read().await.values().cloned().collect()
        };
        let mut sent = 0usize;
        for connection in &conns {
            if self.send_job(connection, job, clean).await {
                sent += 1;
            } else {
                self.teardown(connection, "write backlog").await;
            }
        }
        tracing::info!("📢 broadcast job {} to {} miners", job.id(), sent);
        metrics::inc_job_broadcasts();
    }

    /// Wrap fresh upstream work into a job and broadcast it.
    pub async fn submit_work(
        &self,
        work: Arc<dyn WorkSource>,
        clean: bool,
    ) -> Result<Arc<Job>> {
        let job = self.jobs.create_job(work).await?;
        self.broadcast_job(&job, clean).await;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use vetra_core::hash::{self, Hash};
    use vetra_core::work::{Proof, TemplateTx};

    /// Work whose proofs always hash to zero: every share clears any target.
    struct EasyWork {
        txs: Vec<TemplateTx>,
        branch: Vec<String>,
    }

    impl EasyWork {
        fn new() -> Self {
            Self {
                txs: vec![TemplateTx::new([0x33; 32])],
                branch: vec!["ef".repeat(32)],
            }
        }
    }

    #[async_trait]
    impl WorkSource for EasyWork {
        async fn refresh(&self) -> Result<()> {
            Ok(())
        }

        fn target(&self) -> Result<Hash> {
            Ok([0x0f; 32])
        }

        fn difficulty(&self) -> u64 {
            16
        }

        fn prev_hash(&self) -> &str {
            "00000000bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
        }

        fn coinbase_halves(&self) -> (&str, &str) {
            ("01aa", "02bb")
        }

        fn merkle_branch(&self) -> &[String] {
            &self.branch
        }

        fn tree_root(&self) -> &str {
            "a1"
        }

        fn filter_root(&self) -> &str {
            "b2"
        }

        fn reserved_root(&self) -> &str {
            "c3"
        }

        fn version(&self) -> u32 {
            2
        }

        fn bits(&self) -> u32 {
            0x1d00ffff
        }

        fn time(&self) -> u32 {
            0x65000000
        }

        fn transactions(&self) -> &[TemplateTx] {
            &self.txs
        }

        fn leaf_hash(&self, txid: &Hash) -> Hash {
            hash::leaf_hash(txid)
        }

        fn get_proof(
            &self,
            nonce1: &str,
            nonce2: &str,
            time: &str,
            nonce: &str,
        ) -> Option<Proof> {
            for part in [nonce1, nonce2, time, nonce] {
                hex::decode(part).ok()?;
            }
            Some(Proof {
                hash: [0u8; 32],
                nonce1: nonce1.to_string(),
                nonce2: nonce2.to_string(),
                time: time.to_string(),
                nonce: nonce.to_string(),
            })
        }

        async fn commit(&self, proof: &Proof) -> Result<CommitOutcome> {
            Ok(CommitOutcome::Accepted {
                block_hash: hash::to_hex(&proof.hash),
            })
        }
    }

    async fn spawn_server() -> (Arc<StratumServer>, SocketAddr) {
        let config = Arc::new(Config::default().normalize());
        let server = Arc::new(StratumServer::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));
        (server, addr)
    }

    async fn read_json(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    #[tokio::test]
    async fn server_starts_empty() {
        let server = StratumServer::new(Arc::new(Config::default().normalize()));
        assert_eq!(server.connection_count(), 0);
        assert!(server.jobs().current().await.is_none());
    }

    #[tokio::test]
    async fn full_stratum_session() {
        let (server, addr) = spawn_server().await;
        let job = server
            .submit_work(Arc::new(EasyWork::new()), true)
            .await
            .unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // subscribe: reply, then initial difficulty, then the current job
        write_half
            .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
            .await
            .unwrap();
        let reply = read_json(&mut reader).await;
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["error"], Value::Null);
        let result = reply["result"].as_array().unwrap();
        assert_eq!(result[1].as_str().unwrap().len(), 8);
        assert_eq!(result[2], json!(protocol::NONCE2_SIZE));

        let set_diff = read_json(&mut reader).await;
        assert_eq!(set_diff["method"], json!("mining.set_difficulty"));
        assert_eq!(set_diff["params"], json!([1_000]));

        let notify = read_json(&mut reader).await;
        assert_eq!(notify["method"], json!("mining.notify"));
        let params = notify["params"].as_array().unwrap();
        assert_eq!(params.len(), 13);
        assert_eq!(params[0], json!(job.id()));

        // share events flow to the accounting sink
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        server.set_share_sink(events_tx).await;

        // submitting before authorize is an unauthorized-worker error
        let submit = format!(
            "{{\"id\":2,\"method\":\"mining.submit\",\"params\":[\"alice\",\"{}\",\"00112233\",\"0000003c\",\"deadbeef\"]}}\n",
            job.id()
        );
        write_half.write_all(submit.as_bytes()).await.unwrap();
        let reply = read_json(&mut reader).await;
        assert_eq!(reply["error"][0], json!(24));

        write_half
            .write_all(b"{\"id\":3,\"method\":\"mining.authorize\",\"params\":[\"alice\",\"\"]}\n")
            .await
            .unwrap();
        let reply = read_json(&mut reader).await;
        assert_eq!(reply["result"], json!(true));
        assert_eq!(reply["error"], Value::Null);

        // now the same tuple is accepted
        write_half.write_all(submit.as_bytes()).await.unwrap();
        let reply = read_json(&mut reader).await;
        assert_eq!(reply["id"], json!(2));
        assert_eq!(reply["result"], json!(true));
        assert_eq!(reply["error"], Value::Null);

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.username, "alice");
        assert_eq!(event.job_id, job.id());
        assert!(event.block);

        // the identical tuple again is a duplicate share
        write_half.write_all(submit.as_bytes()).await.unwrap();
        let reply = read_json(&mut reader).await;
        assert_eq!(reply["error"][0], json!(22));

        // a malformed nonce2 width is a validation error
        let bad = format!(
            "{{\"id\":4,\"method\":\"mining.submit\",\"params\":[\"alice\",\"{}\",\"0011223\",\"0000003c\",\"deadbeef\"]}}\n",
            job.id()
        );
        write_half.write_all(bad.as_bytes()).await.unwrap();
        let reply = read_json(&mut reader).await;
        assert_eq!(reply["error"][0], json!(20));

        // an unknown job id is rejected with the job-not-found code
        let unknown = "{\"id\":5,\"method\":\"mining.submit\",\"params\":[\"alice\",\"000000000000ffffffff\",\"00112233\",\"0000003c\",\"deadbeef\"]}\n";
        write_half.write_all(unknown.as_bytes()).await.unwrap();
        let reply = read_json(&mut reader).await;
        assert_eq!(reply["error"][0], json!(21));
    }

    #[tokio::test]
    async fn identical_tuple_from_two_connections_is_caught_once() {
        let (server, addr) = spawn_server().await;
        let job = server
            .submit_work(Arc::new(EasyWork::new()), true)
            .await
            .unwrap();

        let mut replies = Vec::new();
        for user in ["alice", "bob"] {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            write_half
                .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[]}\n")
                .await
                .unwrap();
            read_json(&mut reader).await; // subscribe reply
            read_json(&mut reader).await; // set_difficulty
            read_json(&mut reader).await; // notify

            let auth = format!(
                "{{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"{user}\",\"\"]}}\n"
            );
            write_half.write_all(auth.as_bytes()).await.unwrap();
            read_json(&mut reader).await;

            let submit = format!(
                "{{\"id\":3,\"method\":\"mining.submit\",\"params\":[\"{user}\",\"{}\",\"00112233\",\"0000003c\",\"deadbeef\"]}}\n",
                job.id()
            );
            write_half.write_all(submit.as_bytes()).await.unwrap();
            replies.push(read_json(&mut reader).await);
        }

        // whichever connection landed first won; the other is a duplicate
        assert_eq!(replies[0]["result"], json!(true));
        assert_eq!(replies[1]["error"][0], json!(22));
    }

    #[tokio::test]
    async fn http_probe_gets_redirect_then_close() {
        let (_server, addr) = spawn_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("X-Stratum: stratum+tcp://127.0.0.1:3333"));
        assert!(response.ends_with("{\"error\":null,\"result\":false,\"id\":0}"));
    }

    #[tokio::test]
    async fn repeated_garbage_accumulates_to_a_ban() {
        let (_server, addr) = spawn_server().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // weight_parse 5 against threshold 100: ~20 bad lines to a ban
        for _ in 0..40 {
            if write_half.write_all(b"this is not json\n").await.is_err() {
                break;
            }
        }

        let mut saw_eof = false;
        for _ in 0..80 {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => {
                    saw_eof = true;
                    break;
                }
                Ok(_) => {
                    let v: Value = serde_json::from_str(line.trim()).unwrap();
                    assert_eq!(v["error"][0], json!(protocol::CODE_PARSE));
                }
            }
        }
        assert!(saw_eof, "connection should be banned and closed");
    }
}
