//! Bounded blocking pool of tracker connections
//!
//! One pool per client instance. All shared state lives behind one mutex
//! owned by the pool value. There is no background sweeper; idle expiry is
//! enforced lazily during lease/release.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::addr::TrackerAddress;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Hard bound on live connections, idle and leased together.
    pub max_conns: usize,
    /// Connections opened eagerly at construction, best effort.
    pub min_warm: usize,
    /// Idle connections older than this are closed on later pool calls.
    pub idle_expiry: Duration,
    /// Read/write timeout applied to every tracker socket. `None` disables.
    pub sock_timeout: Option<Duration>,
    /// Per-address TCP connect timeout during the failover sweep.
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_conns: 10,
            min_warm: 0,
            idle_expiry: Duration::from_secs(10),
            sock_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// One live connection to a tracker. Owned by the pool; callers hold it only
/// between `lease` and `release`/`invalidate`.
pub struct TrackerConn {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    addr: TrackerAddress,
    idle_since: Instant,
}

impl TrackerConn {
    fn open(addr: &TrackerAddress, opts: &PoolOptions) -> std::io::Result<TrackerConn> {
        let mut last_err = None;
        for sa in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sa, opts.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream.set_read_timeout(opts.sock_timeout)?;
                    stream.set_write_timeout(opts.sock_timeout)?;
                    let reader = BufReader::new(stream.try_clone()?);
                    debug!(tracker = %addr, "tracker connection opened");
                    return Ok(TrackerConn {
                        stream,
                        reader,
                        addr: addr.clone(),
                        idle_since: Instant::now(),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no resolved address")
        }))
    }

    pub fn addr(&self) -> &TrackerAddress {
        &self.addr
    }

    /// One request/response round trip. No pipelining: exactly one line out,
    /// one line back.
    pub fn roundtrip(&mut self, request: &str) -> std::io::Result<String> {
        self.stream.write_all(request.as_bytes())?;
        self.stream.flush()?;
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "tracker closed connection",
            ));
        }
        Ok(line)
    }

    fn expired(&self, expiry: Duration) -> bool {
        self.idle_since.elapsed() > expiry
    }

    /// Cheap lazy liveness probe: a readable socket here means either EOF or
    /// an unsolicited byte, both of which make the connection unusable.
    fn looks_dead(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut byte = [0u8; 1];
        let dead = match self.stream.peek(&mut byte) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        };
        if self.stream.set_nonblocking(false).is_err() {
            return true;
        }
        dead
    }
}

struct PoolState {
    idle: VecDeque<TrackerConn>,
    /// Idle + leased. Never exceeds `max_conns`.
    live: usize,
    /// Next index in the address list to try when dialing.
    next_addr: usize,
}

/// Reusable connections to the tracker tier. `lease`/`release`/`invalidate`
/// are safe to call from any number of threads.
pub struct ConnectionPool {
    addrs: Vec<TrackerAddress>,
    opts: PoolOptions,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    pub fn new(addrs: Vec<TrackerAddress>, opts: PoolOptions) -> Result<ConnectionPool> {
        if addrs.is_empty() {
            return Err(Error::Config("tracker address list must not be empty".into()));
        }
        if opts.max_conns == 0 {
            return Err(Error::Config("max_conns must be at least 1".into()));
        }
        let pool = ConnectionPool {
            addrs,
            opts,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                next_addr: 0,
            }),
            available: Condvar::new(),
        };
        pool.warm_up();
        Ok(pool)
    }

    pub fn addr_count(&self) -> usize {
        self.addrs.len()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    fn warm_up(&self) {
        let want = self.opts.min_warm.min(self.opts.max_conns);
        for _ in 0..want {
            match self.dial_rotating() {
                Ok(conn) => {
                    let mut st = self.state.lock();
                    st.live += 1;
                    st.idle.push_back(conn);
                }
                Err(e) => {
                    warn!(error = %e, "pool warm-up connect failed");
                    break;
                }
            }
        }
    }

    /// Borrow a connection, blocking up to `timeout` when the pool is at its
    /// bound with nothing idle.
    pub fn lease(&self, timeout: Duration) -> Result<TrackerConn> {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            self.expire_idle(&mut st);
            while let Some(conn) = st.idle.pop_front() {
                if conn.looks_dead() {
                    debug!(tracker = %conn.addr, "dropping dead idle connection");
                    st.live -= 1;
                    continue;
                }
                return Ok(conn);
            }
            if st.live < self.opts.max_conns {
                // Reserve the slot before dialing so the bound holds while
                // the lock is released.
                st.live += 1;
                drop(st);
                return match self.dial_rotating() {
                    Ok(conn) => Ok(conn),
                    Err(e) => {
                        let mut st = self.state.lock();
                        st.live -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            if self.available.wait_until(&mut st, deadline).timed_out() {
                return Err(Error::PoolTimeout(timeout));
            }
        }
    }

    /// Return a healthy connection for reuse.
    pub fn release(&self, mut conn: TrackerConn) {
        conn.idle_since = Instant::now();
        let mut st = self.state.lock();
        self.expire_idle(&mut st);
        st.idle.push_back(conn);
        self.available.notify_one();
    }

    /// Discard a connection after a transport error. The next lease dials a
    /// fresh one.
    pub fn invalidate(&self, conn: TrackerConn) {
        debug!(tracker = %conn.addr, "invalidating tracker connection");
        drop(conn);
        let mut st = self.state.lock();
        st.live -= 1;
        self.available.notify_one();
    }

    fn expire_idle(&self, st: &mut PoolState) {
        let expiry = self.opts.idle_expiry;
        while let Some(front) = st.idle.front() {
            if !front.expired(expiry) {
                break;
            }
            let conn = st.idle.pop_front().unwrap();
            debug!(tracker = %conn.addr, "closing expired idle connection");
            st.live -= 1;
        }
    }

    /// Dial the next address in rotation, sweeping the whole list once.
    fn dial_rotating(&self) -> Result<TrackerConn> {
        let start = {
            let st = self.state.lock();
            st.next_addr
        };
        let mut last_err = String::from("empty address list");
        for i in 0..self.addrs.len() {
            let idx = (start + i) % self.addrs.len();
            match TrackerConn::open(&self.addrs[idx], &self.opts) {
                Ok(conn) => {
                    self.state.lock().next_addr = (idx + 1) % self.addrs.len();
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(tracker = %self.addrs[idx], error = %e, "tracker connect failed");
                    last_err = format!("{}: {}", self.addrs[idx], e);
                }
            }
        }
        Err(Error::TrackerUnavailable(last_err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Accepts connections, counts them, and keeps them open.
    fn accepting_listener() -> (TrackerAddress, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        thread::spawn(move || {
            let mut held = Vec::new();
            for conn in listener.incoming() {
                match conn {
                    Ok(c) => {
                        count2.fetch_add(1, Ordering::SeqCst);
                        held.push(c);
                    }
                    Err(_) => break,
                }
            }
        });
        (
            TrackerAddress {
                host: "127.0.0.1".into(),
                port,
            },
            count,
        )
    }

    fn opts(max: usize) -> PoolOptions {
        PoolOptions {
            max_conns: max,
            min_warm: 0,
            idle_expiry: Duration::from_secs(60),
            sock_timeout: Some(Duration::from_secs(5)),
            connect_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn lease_respects_max_bound() {
        let (addr, _count) = accepting_listener();
        let pool = ConnectionPool::new(vec![addr], opts(2)).unwrap();

        let a = pool.lease(Duration::from_secs(1)).unwrap();
        let b = pool.lease(Duration::from_secs(1)).unwrap();
        match pool.lease(Duration::from_millis(100)) {
            Err(Error::PoolTimeout(_)) => {}
            other => panic!("expected pool timeout, got {:?}", other.map(|_| ())),
        }

        pool.release(a);
        let c = pool.lease(Duration::from_secs(1)).unwrap();
        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn release_reuses_connection() {
        let (addr, count) = accepting_listener();
        let pool = ConnectionPool::new(vec![addr], opts(4)).unwrap();

        let a = pool.lease(Duration::from_secs(1)).unwrap();
        pool.release(a);
        let b = pool.lease(Duration::from_secs(1)).unwrap();
        pool.release(b);
        // The accept loop runs on its own thread; give it a moment.
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_frees_slot() {
        let (addr, count) = accepting_listener();
        let pool = ConnectionPool::new(vec![addr], opts(1)).unwrap();

        let a = pool.lease(Duration::from_secs(1)).unwrap();
        pool.invalidate(a);
        let b = pool.lease(Duration::from_secs(1)).unwrap();
        pool.release(b);
        // The accept loop runs on its own thread; give it a moment.
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn warm_up_opens_min_warm_connections() {
        let (addr, count) = accepting_listener();
        let mut o = opts(4);
        o.min_warm = 2;
        let pool = ConnectionPool::new(vec![addr], o).unwrap();
        // The accept loop runs on its own thread; give it a moment.
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // Warm connections sit idle: leasing two reuses them, no new dials.
        let a = pool.lease(Duration::from_secs(1)).unwrap();
        let b = pool.lease(Duration::from_secs(1)).unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn roundtrip_with_timeouts_disabled() {
        // sock_timeout None is the disable sentinel; it must still round trip.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut line = String::new();
            if reader.read_line(&mut line).unwrap_or(0) > 0 {
                let mut w = conn;
                let _ = w.write_all(b"OK \r\n");
                thread::sleep(Duration::from_millis(100));
            }
        });
        let addr = TrackerAddress {
            host: "127.0.0.1".into(),
            port,
        };
        let mut o = opts(1);
        o.sock_timeout = None;
        let pool = ConnectionPool::new(vec![addr], o).unwrap();
        let mut conn = pool.lease(Duration::from_secs(1)).unwrap();
        assert_eq!(conn.roundtrip("ping\r\n").unwrap(), "OK \r\n");
        pool.release(conn);
    }

    #[test]
    fn rejects_empty_or_zero_configuration() {
        let (addr, _) = accepting_listener();
        assert!(matches!(
            ConnectionPool::new(Vec::new(), opts(2)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ConnectionPool::new(vec![addr], opts(0)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn expired_idle_connection_is_replaced() {
        let (addr, count) = accepting_listener();
        let mut o = opts(2);
        o.idle_expiry = Duration::from_millis(10);
        let pool = ConnectionPool::new(vec![addr], o).unwrap();

        let a = pool.lease(Duration::from_secs(1)).unwrap();
        pool.release(a);
        thread::sleep(Duration::from_millis(50));
        let b = pool.lease(Duration::from_secs(1)).unwrap();
        pool.release(b);
        // The accept loop runs on its own thread; give it a moment.
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dial_fails_over_to_next_address() {
        // A port that was bound and dropped is very likely refusing.
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let dead = TrackerAddress {
            host: "127.0.0.1".into(),
            port: dead_port,
        };
        let (live, _count) = accepting_listener();
        let pool = ConnectionPool::new(vec![dead, live.clone()], opts(2)).unwrap();

        let conn = pool.lease(Duration::from_secs(2)).unwrap();
        assert_eq!(conn.addr(), &live);
        pool.release(conn);
    }

    #[test]
    fn all_addresses_down_is_tracker_unavailable() {
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let dead = TrackerAddress {
            host: "127.0.0.1".into(),
            port: dead_port,
        };
        let pool = ConnectionPool::new(vec![dead], opts(2)).unwrap();
        match pool.lease(Duration::from_secs(1)) {
            Err(Error::TrackerUnavailable(_)) => {}
            other => panic!("expected tracker unavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn concurrent_lease_never_exceeds_bound() {
        let (addr, count) = accepting_listener();
        let pool = Arc::new(ConnectionPool::new(vec![addr], opts(3)).unwrap());
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            let current = Arc::clone(&current);
            handles.push(thread::spawn(move || {
                for _ in 0..10 {
                    let conn = pool.lease(Duration::from_secs(5)).unwrap();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                    current.fetch_sub(1, Ordering::SeqCst);
                    pool.release(conn);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(count.load(Ordering::SeqCst) <= 3);
    }
}
