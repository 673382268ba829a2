use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use docbridge_protocol::wellknown;

use crate::jail::{self, Jail};

const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

pub struct PoolConfig {
    pub child_root: PathBuf,
    pub lo_subpath: String,
    pub systemplate: Option<PathBuf>,
    pub lotemplate: Option<PathBuf>,
    pub client_port: u16,
    pub worker_bin: PathBuf,
    pub reply_fifo: PathBuf,
    pub num_prespawn: usize,
}

struct WorkerHandle {
    pid: u32,
    jail: Jail,
    hosted_url: Option<String>,
    child: Child,
    pipe: Option<pipe::Sender>,
}

/// The pre-forked pool of jailed workers and the URI routing table over
/// it. Single point of truth: for any URL at most one worker hosts it.
pub struct WorkerPool {
    config: PoolConfig,
    workers: HashMap<u32, WorkerHandle>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        WorkerPool {
            config,
            workers: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub async fn prespawn(&mut self) -> Result<()> {
        while self.workers.len() < self.config.num_prespawn {
            self.spawn_worker().await?;
        }
        Ok(())
    }

    /// Builds a fresh jail and forks a worker into it. The worker's
    /// request pipe lives inside the jail; the shared reply FIFO is
    /// already linked there.
    pub async fn spawn_worker(&mut self) -> Result<u32> {
        let jail = jail::create_jail(
            &self.config.child_root,
            &self.config.lo_subpath,
            self.config.systemplate.as_deref(),
            self.config.lotemplate.as_deref(),
            &self.config.reply_fifo,
        )?;

        let child = Command::new(&self.config.worker_bin)
            .arg(format!("--losubpath={}", self.config.lo_subpath))
            .arg(format!("--jailid={}", jail.id))
            .arg(format!("--pipe={}", wellknown::WORKER_REQUEST_PIPE))
            .arg(format!("--clientport={}", self.config.client_port))
            .current_dir(&jail.path)
            .spawn()
            .with_context(|| format!("spawning {}", self.config.worker_bin.display()))?;
        let pid = child.id().context("worker pid unavailable")?;

        info!(pid, jail = %jail.id, "worker spawned");
        self.workers.insert(
            pid,
            WorkerHandle {
                pid,
                jail,
                hosted_url: None,
                child,
                pipe: None,
            },
        );
        Ok(pid)
    }

    /// Routes a `request <session-id> <url>` from the gateway: reuse the
    /// worker already hosting the URL, else claim an idle worker, else
    /// fork a new one.
    pub async fn route(
        &mut self,
        session_id: &str,
        url: &str,
        replies: &mut mpsc::UnboundedReceiver<(u32, String)>,
    ) -> Result<()> {
        let plan = pick_route(
            self.workers
                .values()
                .map(|worker| (worker.pid, worker.hosted_url.as_deref())),
            url,
        );
        match plan {
            RoutePlan::Reuse(pid) => {
                debug!(pid, url, "reusing hosting worker");
                self.assign(pid, session_id, url, replies).await
            }
            RoutePlan::ProbeIdle(candidates) => {
                for pid in candidates {
                    match self.query_url(pid, replies).await {
                        Some(reply) if reply == "empty" => {
                            debug!(pid, url, "assigning idle worker");
                            return self.assign(pid, session_id, url, replies).await;
                        }
                        Some(hosted) => {
                            // stale bookkeeping; remember what it hosts
                            if let Some(worker) = self.workers.get_mut(&pid) {
                                worker.hosted_url = Some(hosted);
                            }
                        }
                        None => warn!(pid, "worker did not answer url query"),
                    }
                }
                let pid = self.spawn_worker().await?;
                self.assign(pid, session_id, url, replies).await
            }
            RoutePlan::Spawn => {
                let pid = self.spawn_worker().await?;
                self.assign(pid, session_id, url, replies).await
            }
        }
    }

    async fn assign(
        &mut self,
        pid: u32,
        session_id: &str,
        url: &str,
        replies: &mut mpsc::UnboundedReceiver<(u32, String)>,
    ) -> Result<()> {
        self.send_to_worker(pid, &format!("thread {} {}\r\n", session_id, url))
            .await?;
        match self.await_reply(pid, replies).await {
            Some(reply) if reply == "ok" => {
                if let Some(worker) = self.workers.get_mut(&pid) {
                    worker.hosted_url = Some(url.to_string());
                }
                info!(pid, session = session_id, url, "session routed");
                Ok(())
            }
            other => bail!("worker {} rejected session {}: {:?}", pid, session_id, other),
        }
    }

    async fn query_url(
        &mut self,
        pid: u32,
        replies: &mut mpsc::UnboundedReceiver<(u32, String)>,
    ) -> Option<String> {
        self.send_to_worker(pid, "query url\r\n").await.ok()?;
        self.await_reply(pid, replies).await
    }

    /// Waits for this worker's next reply on the shared FIFO. Replies
    /// from other workers arriving meanwhile are folded into the routing
    /// table instead of being dropped.
    async fn await_reply(
        &mut self,
        pid: u32,
        replies: &mut mpsc::UnboundedReceiver<(u32, String)>,
    ) -> Option<String> {
        let waited = timeout(REPLY_TIMEOUT, async {
            while let Some((from, rest)) = replies.recv().await {
                if from == pid {
                    return Some(rest);
                }
                self.note_reply(from, &rest);
            }
            None
        })
        .await;
        waited.ok().flatten()
    }

    /// Unsolicited traffic on the reply FIFO: startup advertisements and
    /// answers that outlived their timeout.
    pub fn note_reply(&mut self, pid: u32, rest: &str) {
        let Some(worker) = self.workers.get_mut(&pid) else {
            debug!(pid, reply = rest, "reply from unknown worker");
            return;
        };
        match rest {
            "empty" => worker.hosted_url = None,
            "ok" | "bad" => {}
            url => worker.hosted_url = Some(url.to_string()),
        }
    }

    async fn send_to_worker(&mut self, pid: u32, message: &str) -> Result<()> {
        let worker = self
            .workers
            .get_mut(&pid)
            .with_context(|| format!("unknown worker {}", pid))?;
        if worker.pipe.is_none() {
            let request_pipe = worker_request_pipe(&worker.jail.path);
            worker.pipe = Some(open_sender_retry(&request_pipe).await?);
        }
        worker
            .pipe
            .as_mut()
            .expect("pipe just opened")
            .write_all(message.as_bytes())
            .await
            .with_context(|| format!("writing to worker {}", pid))?;
        Ok(())
    }

    /// Reaps exited workers and tears down their jails. Returns the pids
    /// that went away so the caller can respawn to the minimum.
    pub fn harvest(&mut self) -> Vec<u32> {
        let mut dead = Vec::new();
        for (pid, worker) in self.workers.iter_mut() {
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    info!(pid = *pid, %status, url = ?worker.hosted_url, "worker exited");
                    dead.push(*pid);
                }
                Ok(None) => {}
                Err(err) => {
                    error!(pid = *pid, "wait failed: {}", err);
                    dead.push(*pid);
                }
            }
        }
        for pid in &dead {
            if let Some(worker) = self.workers.remove(pid) {
                worker.jail.remove();
            }
        }
        dead
    }

    pub async fn respawn_to_minimum(&mut self) {
        while self.workers.len() < self.config.num_prespawn {
            if let Err(err) = self.spawn_worker().await {
                error!("respawn failed: {:#}", err);
                break;
            }
        }
    }

    /// Terminates the pool; jails are removed once the children exit.
    pub async fn shutdown(&mut self) {
        for worker in self.workers.values_mut() {
            if let Err(err) = worker.child.start_kill() {
                warn!(pid = worker.pid, "kill failed: {}", err);
            }
        }
        for (_, mut worker) in self.workers.drain() {
            let _ = worker.child.wait().await;
            worker.jail.remove();
        }
    }
}

/// The routing decision, separated from process plumbing. A URL already
/// hosted is always reused, which is what keeps the at-most-one-worker-
/// per-URL invariant.
#[derive(Debug, PartialEq, Eq)]
enum RoutePlan {
    Reuse(u32),
    ProbeIdle(Vec<u32>),
    Spawn,
}

fn pick_route<'a>(workers: impl Iterator<Item = (u32, Option<&'a str>)>, url: &str) -> RoutePlan {
    let mut idle = Vec::new();
    for (pid, hosted) in workers {
        match hosted {
            Some(hosted) if hosted == url => return RoutePlan::Reuse(pid),
            None => idle.push(pid),
            Some(_) => {}
        }
    }
    if idle.is_empty() {
        RoutePlan::Spawn
    } else {
        RoutePlan::ProbeIdle(idle)
    }
}

fn worker_request_pipe(jail_path: &Path) -> PathBuf {
    let relative = Path::new(wellknown::WORKER_REQUEST_PIPE)
        .strip_prefix("/")
        .unwrap_or(Path::new("pipe"));
    jail_path.join(relative)
}

/// A FIFO's write end only opens once the worker holds the read end.
async fn open_sender_retry(path: &Path) -> Result<pipe::Sender> {
    for _ in 0..50 {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(sender) => return Ok(sender),
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("opening worker pipe {}", path.display()))
            }
        }
    }
    bail!("worker pipe {} never became readable", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_url_is_always_reused() {
        let workers = [
            (100, None),
            (200, Some("file:///a.odt")),
            (300, Some("file:///b.odt")),
        ];
        let plan = pick_route(workers.iter().map(|&(pid, url)| (pid, url)), "file:///a.odt");
        assert_eq!(plan, RoutePlan::Reuse(200));
    }

    #[test]
    fn idle_workers_are_probed_before_forking() {
        let workers = [(100, None), (200, Some("file:///a.odt")), (300, None)];
        let plan = pick_route(workers.iter().map(|&(pid, url)| (pid, url)), "file:///c.odt");
        assert_eq!(plan, RoutePlan::ProbeIdle(vec![100, 300]));
    }

    #[test]
    fn saturated_pool_forks() {
        let workers = [(200, Some("file:///a.odt")), (300, Some("file:///b.odt"))];
        let plan = pick_route(workers.iter().map(|&(pid, url)| (pid, url)), "file:///c.odt");
        assert_eq!(plan, RoutePlan::Spawn);

        let plan = pick_route(std::iter::empty(), "file:///c.odt");
        assert_eq!(plan, RoutePlan::Spawn);
    }
}
