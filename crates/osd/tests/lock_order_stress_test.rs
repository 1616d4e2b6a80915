//! Many threads adding, acking, releasing and tearing down backoffs across
//! shared sessions and PGs. Debug builds check the lock order on every
//! acquisition; a deadlock shows up as the watchdog timing out.

use osd::{
    Backoff, BackoffConfig, BackoffOp, ChannelConnection, HObject, MOSDBackoff, PgBackoffs,
    Session, SpgId,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

const PG_NUM: u32 = 8;
const THREADS: usize = 8;
const SESSIONS: usize = 4;
const OPS: usize = 3000;

struct Slot {
    session: Arc<Session>,
    rx: mpsc::Receiver<MOSDBackoff>,
}

struct Cluster {
    config: Arc<BackoffConfig>,
    pgs: Vec<Arc<PgBackoffs>>,
    slots: Vec<Mutex<Slot>>,
    every_session: Mutex<Vec<Arc<Session>>>,
    every_backoff: Mutex<Vec<Arc<Backoff>>>,
}

impl Cluster {
    fn new() -> Self {
        let config = Arc::new(BackoffConfig::default());
        let pgs = (0..PG_NUM)
            .map(|seed| PgBackoffs::new(SpgId::from_pg(1, seed), PG_NUM, Arc::clone(&config)))
            .collect();
        let cluster = Self {
            config,
            pgs,
            slots: Vec::new(),
            every_session: Mutex::new(Vec::new()),
            every_backoff: Mutex::new(Vec::new()),
        };
        let slots = (0..SESSIONS).map(|i| Mutex::new(cluster.connect(i))).collect();
        Self { slots, ..cluster }
    }

    fn connect(&self, i: usize) -> Slot {
        let (con, rx) = ChannelConnection::new(None, 4096);
        let session = Session::new(format!("client.{}", i), con, Arc::clone(&self.config));
        self.every_session.lock().unwrap().push(Arc::clone(&session));
        Slot { session, rx }
    }

    fn session(&self, i: usize) -> Arc<Session> {
        Arc::clone(&self.slots[i].lock().unwrap().session)
    }
}

/// An object of `pg`, picked from a small name space so that ranges collide
fn random_object(rng: &mut StdRng, pg: &PgBackoffs) -> HObject {
    let hash = pg.pgid().seed | (rng.gen::<u32>() << 3);
    HObject::new(1, format!("obj{}", rng.gen_range(0..16)), hash)
}

fn random_range(rng: &mut StdRng, pg: &PgBackoffs) -> (HObject, HObject) {
    let a = random_object(rng, pg);
    if rng.gen_bool(0.3) {
        return (a.clone(), a);
    }
    let b = random_object(rng, pg);
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn worker(cluster: &Cluster, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..OPS {
        let i = rng.gen_range(0..SESSIONS);
        let pg = &cluster.pgs[rng.gen_range(0..cluster.pgs.len())];
        match rng.gen_range(0..100) {
            0..=29 => {
                let session = cluster.session(i);
                let (begin, end) = random_range(&mut rng, pg);
                if let Ok(Some(b)) = pg.add_backoff(&session, begin, end) {
                    cluster.every_backoff.lock().unwrap().push(b);
                }
            }
            30..=49 => {
                // play the client: ack whatever was blocked
                let msgs: Vec<MOSDBackoff> = {
                    let mut slot = cluster.slots[i].lock().unwrap();
                    std::iter::from_fn(|| slot.rx.try_recv().ok()).collect()
                };
                let session = cluster.session(i);
                for m in msgs.iter().filter(|m| m.op == BackoffOp::Block) {
                    session.handle_backoff(&m.ack());
                }
            }
            50..=69 => {
                let (begin, end) = random_range(&mut rng, pg);
                pg.release_backoffs(&begin, &end);
            }
            70..=84 => {
                let session = cluster.session(i);
                let o = random_object(&mut rng, pg);
                session.check_backoff(pg.pgid(), &o, &"osd_op");
            }
            85..=91 => {
                pg.release_pg_backoffs();
            }
            92..=97 => {
                let fresh = cluster.connect(i);
                let old = std::mem::replace(&mut *cluster.slots[i].lock().unwrap(), fresh);
                old.session.reset();
            }
            _ => {
                pg.clear_backoffs();
            }
        }
    }
}

#[test]
fn test_concurrent_backoff_traffic() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();
    let cluster = Arc::new(Cluster::new());
    let (done_tx, done_rx) = std_mpsc::channel();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cluster = Arc::clone(&cluster);
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                worker(&cluster, 0x5eed + t as u64);
                let _ = done_tx.send(t);
            })
        })
        .collect();
    drop(done_tx);

    for _ in 0..THREADS {
        done_rx
            .recv_timeout(Duration::from_secs(120))
            .expect("workers stuck or panicked");
    }
    for h in handles {
        h.join().unwrap();
    }

    for pg in &cluster.pgs {
        pg.clear_backoffs();
    }
    let sessions = cluster.every_session.lock().unwrap();
    for session in sessions.iter() {
        session.reset();
    }

    for pg in &cluster.pgs {
        assert_eq!(pg.backoff_count(), 0, "{:?}", pg);
    }
    for session in sessions.iter() {
        assert_eq!(session.backoff_count(), 0, "{:?}", session);
        assert!(session.dump_backoffs().is_empty());
    }
    let backoffs = cluster.every_backoff.lock().unwrap();
    assert!(!backoffs.is_empty());
    for b in backoffs.iter() {
        assert!(!b.has_pg(), "{}", b);
        // an ack that completed a release drops the token without unlinking
        assert!(!b.has_session() || b.is_deleting(), "{}", b);
    }
}
