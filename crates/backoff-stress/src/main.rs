//! Backoff stress tool
//!
//! Runs a simulated OSD (a set of PGs) against a set of clients: worker
//! threads add, release and check backoffs and reset client connections at
//! random, while one task per client connection acks every BLOCK it receives.
//! Ends with a full teardown and verifies that nothing leaked. Debug builds
//! also check the lock order on every acquisition.

use anyhow::{bail, Context, Result};
use cephconfig::{CephConfig, ConfigValue};
use clap::Parser;
use osd::{
    Backoff, BackoffConfig, BackoffOp, ChannelConnection, HObject, MOSDBackoff, PgBackoffs,
    Session, SpgId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backoff-stress")]
#[command(about = "Exercise OSD backoff bookkeeping under concurrency", long_about = None)]
struct Cli {
    /// Ceph configuration file path
    #[arg(
        short = 'c',
        long,
        env = "CEPH_CONF",
        default_value = "/etc/ceph/ceph.conf"
    )]
    conf: String,

    /// OSD id whose [osd.N] section is consulted
    #[arg(long, default_value = "0")]
    id: u32,

    /// Pool id of the simulated PGs
    #[arg(long, default_value = "1")]
    pool: i64,

    /// Number of PGs (pg_num)
    #[arg(long, default_value = "16")]
    pg_num: u32,

    /// Number of concurrent client sessions
    #[arg(long, default_value = "8")]
    sessions: usize,

    /// Number of worker threads
    #[arg(short, long, default_value = "8")]
    threads: usize,

    /// Operations per worker
    #[arg(long, default_value = "20000")]
    ops: usize,

    /// Seed for the random operation mix
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Send queue depth of each client connection
    #[arg(long, default_value = "1024")]
    queue_depth: usize,

    /// Give up after this long, e.g. "30s" or "2m"
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    timeout: Duration,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    cephconfig::Duration::parse_config_value(s)
        .map(|d| d.0)
        .map_err(|e| e.to_string())
}

#[derive(Default)]
struct Counters {
    added: AtomicU64,
    add_exists: AtomicU64,
    add_disconnected: AtomicU64,
    released: AtomicU64,
    checks: AtomicU64,
    checks_blocked: AtomicU64,
    resets: AtomicU64,
    pg_clears: AtomicU64,
    blocks_received: AtomicU64,
    unblocks_received: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[derive(Serialize)]
struct Summary {
    seed: u64,
    threads: usize,
    ops_per_thread: usize,
    pgs: usize,
    sessions_created: usize,
    backoffs_created: usize,
    elapsed_ms: u128,
    added: u64,
    add_exists: u64,
    add_disconnected: u64,
    released: u64,
    checks: u64,
    checks_blocked: u64,
    resets: u64,
    pg_clears: u64,
    blocks_received: u64,
    unblocks_received: u64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The simulated OSD and its clients
struct Cluster {
    config: Arc<BackoffConfig>,
    pool: i64,
    queue_depth: usize,
    runtime: Handle,
    pgs: Vec<Arc<PgBackoffs>>,
    /// Current session of each client
    slots: Mutex<Vec<Arc<Session>>>,
    every_session: Mutex<Vec<Arc<Session>>>,
    every_backoff: Mutex<Vec<Arc<Backoff>>>,
    clients: Mutex<JoinSet<()>>,
    counters: Counters,
}

impl Cluster {
    fn new(cli: &Cli, config: BackoffConfig, runtime: Handle) -> Arc<Self> {
        let config = Arc::new(config);
        let pgs = (0..cli.pg_num)
            .map(|seed| {
                let pg = PgBackoffs::new(
                    SpgId::from_pg(cli.pool, seed),
                    cli.pg_num,
                    Arc::clone(&config),
                );
                pg.set_osdmap_epoch(1);
                pg
            })
            .collect();
        let cluster = Arc::new(Self {
            config,
            pool: cli.pool,
            queue_depth: cli.queue_depth,
            runtime,
            pgs,
            slots: Mutex::new(Vec::new()),
            every_session: Mutex::new(Vec::new()),
            every_backoff: Mutex::new(Vec::new()),
            clients: Mutex::new(JoinSet::new()),
            counters: Counters::default(),
        });
        for i in 0..cli.sessions {
            let session = cluster.connect(i);
            lock(&cluster.slots).push(session);
        }
        cluster
    }

    /// Open a client connection and start the task that plays the client
    fn connect(self: &Arc<Self>, i: usize) -> Arc<Session> {
        let (con, rx) = ChannelConnection::new(None, self.queue_depth);
        let session = Session::new(format!("client.{}", i), con, Arc::clone(&self.config));
        debug!("connected {}", session);
        lock(&self.every_session).push(Arc::clone(&session));
        lock(&self.clients).spawn_on(
            client(Arc::clone(self), Arc::clone(&session), rx),
            &self.runtime,
        );
        session
    }

    fn session(&self, i: usize) -> Arc<Session> {
        Arc::clone(&lock(&self.slots)[i])
    }

    fn reconnect(self: &Arc<Self>, i: usize) {
        let fresh = self.connect(i);
        let old = std::mem::replace(&mut lock(&self.slots)[i], fresh);
        old.reset();
        bump(&self.counters.resets, 1);
    }

    /// An object of `pg`, from a small name space so that ranges collide
    fn random_object(&self, rng: &mut StdRng, pg: &PgBackoffs) -> HObject {
        let pg_num = pg.pg_num();
        loop {
            let hash = rng.gen::<u32>();
            if SpgId::for_hash(self.pool, hash, pg_num) == pg.pgid() {
                return HObject::new(self.pool, format!("obj{}", rng.gen_range(0..64)), hash);
            }
        }
    }

    fn random_range(&self, rng: &mut StdRng, pg: &PgBackoffs) -> (HObject, HObject) {
        let a = self.random_object(rng, pg);
        if rng.gen_bool(0.3) {
            return (a.clone(), a);
        }
        let b = self.random_object(rng, pg);
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    fn run_worker(self: &Arc<Self>, seed: u64, ops: usize) {
        let mut rng = StdRng::seed_from_u64(seed);
        let sessions = lock(&self.slots).len();
        for _ in 0..ops {
            let i = rng.gen_range(0..sessions);
            let pg = &self.pgs[rng.gen_range(0..self.pgs.len())];
            match rng.gen_range(0..100) {
                0..=34 => {
                    let session = self.session(i);
                    let (begin, end) = self.random_range(&mut rng, pg);
                    match pg.add_backoff(&session, begin, end) {
                        Ok(Some(b)) => {
                            bump(&self.counters.added, 1);
                            lock(&self.every_backoff).push(b);
                        }
                        Ok(None) => bump(&self.counters.add_disconnected, 1),
                        Err(_) => bump(&self.counters.add_exists, 1),
                    }
                }
                35..=59 => {
                    let (begin, end) = self.random_range(&mut rng, pg);
                    let n = pg.release_backoffs(&begin, &end);
                    bump(&self.counters.released, n as u64);
                }
                60..=84 => {
                    let session = self.session(i);
                    let oid = self.random_object(&mut rng, pg);
                    bump(&self.counters.checks, 1);
                    if session.check_backoff(pg.pgid(), &oid, &oid) {
                        bump(&self.counters.checks_blocked, 1);
                    }
                }
                85..=91 => {
                    let n = pg.release_pg_backoffs();
                    bump(&self.counters.released, n as u64);
                }
                92..=97 => self.reconnect(i),
                _ => {
                    pg.clear_backoffs();
                    bump(&self.counters.pg_clears, 1);
                }
            }
        }
    }

    /// Tear everything down and check that no backoff is left anywhere
    fn verify_teardown(&self) -> Result<()> {
        for pg in &self.pgs {
            pg.clear_backoffs();
        }
        let sessions = lock(&self.every_session).clone();
        for session in &sessions {
            session.reset();
        }

        for pg in &self.pgs {
            if pg.backoff_count() != 0 {
                bail!("pg {} still holds {} backoffs", pg.pgid(), pg.backoff_count());
            }
        }
        for session in &sessions {
            if session.backoff_count() != 0 {
                bail!(
                    "session {} still holds {} backoffs: {}",
                    session,
                    session.backoff_count(),
                    serde_json::to_string(&session.dump_backoffs())?
                );
            }
        }
        for b in lock(&self.every_backoff).iter() {
            if b.has_pg() {
                bail!("{} still linked to its pg", b);
            }
            // an ack that completed a release leaves the session link to the drop
            if b.has_session() && !b.is_deleting() {
                bail!("{} still linked to its session", b);
            }
        }
        Ok(())
    }

    fn summary(&self, cli: &Cli, elapsed: Duration) -> Summary {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        Summary {
            seed: cli.seed,
            threads: cli.threads,
            ops_per_thread: cli.ops,
            pgs: self.pgs.len(),
            sessions_created: lock(&self.every_session).len(),
            backoffs_created: lock(&self.every_backoff).len(),
            elapsed_ms: elapsed.as_millis(),
            added: get(&c.added),
            add_exists: get(&c.add_exists),
            add_disconnected: get(&c.add_disconnected),
            released: get(&c.released),
            checks: get(&c.checks),
            checks_blocked: get(&c.checks_blocked),
            resets: get(&c.resets),
            pg_clears: get(&c.pg_clears),
            blocks_received: get(&c.blocks_received),
            unblocks_received: get(&c.unblocks_received),
        }
    }
}

/// Client side of one connection: ack every BLOCK
///
/// Ends when the session is reset and the connection dropped.
async fn client(cluster: Arc<Cluster>, session: Arc<Session>, mut rx: mpsc::Receiver<MOSDBackoff>) {
    while let Some(m) = rx.recv().await {
        match m.op {
            BackoffOp::Block => {
                bump(&cluster.counters.blocks_received, 1);
                session.handle_backoff(&m.ack());
            }
            BackoffOp::Unblock => bump(&cluster.counters.unblocks_received, 1),
            BackoffOp::AckBlock => error!("client {} got {}", session.entity_name(), m),
        }
    }
    debug!("client task for {} done", session);
}

fn load_config(cli: &Cli) -> Result<BackoffConfig> {
    if Path::new(&cli.conf).exists() {
        debug!("Loading configuration from: {}", cli.conf);
        let conf = CephConfig::from_file(&cli.conf).context("Failed to parse ceph.conf")?;
        Ok(BackoffConfig::for_osd(&conf, cli.id))
    } else {
        debug!("Configuration file not found: {}", cli.conf);
        Ok(BackoffConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if cli.sessions == 0 || cli.pg_num == 0 {
        bail!("need at least one session and one pg");
    }
    let config = load_config(&cli)?;
    info!("backoff config: {:?}", config);

    let cluster = Cluster::new(&cli, config, Handle::current());
    let start = Instant::now();

    let mut workers = JoinSet::new();
    for t in 0..cli.threads {
        let cluster = Arc::clone(&cluster);
        let (seed, ops) = (cli.seed.wrapping_add(t as u64), cli.ops);
        workers.spawn_blocking(move || cluster.run_worker(seed, ops));
    }
    let finished = tokio::time::timeout(cli.timeout, async {
        while let Some(res) = workers.join_next().await {
            res.context("worker panicked")?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await;
    match finished {
        Ok(res) => res?,
        Err(_) => {
            // blocked workers would keep the runtime from shutting down
            error!(
                "workers did not finish within {:?}, lock-order deadlock?",
                cli.timeout
            );
            std::process::exit(2);
        }
    }
    let elapsed = start.elapsed();
    info!("workers finished in {:?}", elapsed);

    cluster.verify_teardown().context("Teardown left backoffs behind")?;

    // every connection is gone now, so every client task ends
    let mut clients = std::mem::take(&mut *lock(&cluster.clients));
    tokio::time::timeout(cli.timeout, async {
        while let Some(res) = clients.join_next().await {
            res.context("client task panicked")?;
        }
        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("client tasks did not finish")??;

    let summary = cluster.summary(&cli, elapsed);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} ops on {} threads in {} ms: {} added, {} released, {} of {} checks blocked, {} resets",
            cli.ops * cli.threads,
            cli.threads,
            summary.elapsed_ms,
            summary.added,
            summary.released,
            summary.checks_blocked,
            summary.checks,
            summary.resets
        );
        println!(
            "clients saw {} BLOCK and {} UNBLOCK",
            summary.blocks_received, summary.unblocks_received
        );
    }
    Ok(())
}
