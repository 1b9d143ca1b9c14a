//! Pooled keep-alive connection management.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use crate::config::ManagerSettings;
use crate::connection::Connection;
use crate::connector::{Dialer, RustlsDialer};
use crate::error::HttpError;

/// Identity under which connections are pooled.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ConnKey {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    /// Rendered proxy endpoint, if the connection runs through one.
    pub proxy: Option<String>,
}

/// Release disposition: back to the pool, or closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Reuse,
    DontReuse,
}

struct Idle {
    conn: Connection,
    since: Instant,
}

struct PoolState {
    idle: HashMap<ConnKey, Vec<Idle>>,
    closed: bool,
}

pub(crate) struct ManagerInner {
    pub(crate) settings: ManagerSettings,
    /// Dialer resolved from the settings at construction time.
    pub(crate) dialer: Arc<dyn Dialer>,
    state: Mutex<PoolState>,
    reaper_wake: Condvar,
    close_once: AtomicBool,
    handles: AtomicUsize,
}

/// Shared, cloneable handle over the connection pool.
///
/// The pool is closed exactly once: explicitly via [`Manager::close`], or
/// when the last handle is dropped. Closing evicts and closes every pooled
/// connection and makes subsequent acquires fail with
/// [`HttpError::ManagerClosed`].
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    pub fn new(settings: ManagerSettings) -> Manager {
        let dialer = settings.dialer.clone().unwrap_or_else(|| {
            match settings.tls_config.clone() {
                Some(config) => Arc::new(RustlsDialer::new(config)),
                None => Arc::new(RustlsDialer::default()),
            }
        });
        let inner = Arc::new(ManagerInner {
            settings,
            dialer,
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                closed: false,
            }),
            reaper_wake: Condvar::new(),
            close_once: AtomicBool::new(false),
            handles: AtomicUsize::new(1),
        });

        let reaper_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("courier-reaper".to_string())
            .spawn(move || reap_idle(reaper_inner))
            .expect("failed to spawn pool reaper thread");

        Manager { inner }
    }

    pub fn with_default_settings() -> Manager {
        Manager::new(ManagerSettings::default())
    }

    pub(crate) fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    pub(crate) fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.inner.dialer
    }

    /// Close the pool: every idle connection is closed and future acquires
    /// fail. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Pop an idle connection for `key`, or dial a fresh one.
    pub(crate) fn acquire(
        &self,
        key: &ConnKey,
        dial: &dyn Fn() -> Result<Connection, HttpError>,
    ) -> Result<ManagedConn, HttpError> {
        if let Some(conn) = self.inner.pop_idle(key)? {
            log::trace!("reusing pooled connection for {key:?}");
            return Ok(ManagedConn {
                conn: Some(conn),
                key: key.clone(),
                inner: Arc::clone(&self.inner),
                reused: true,
            });
        }
        self.acquire_fresh(key, dial)
    }

    /// Dial a fresh connection, bypassing the pool. Used for the transparent
    /// retry after a reused connection turned out to be dead.
    pub(crate) fn acquire_fresh(
        &self,
        key: &ConnKey,
        dial: &dyn Fn() -> Result<Connection, HttpError>,
    ) -> Result<ManagedConn, HttpError> {
        if self.inner.state.lock().unwrap().closed {
            return Err(HttpError::ManagerClosed);
        }
        let conn = dial()?;
        Ok(ManagedConn {
            conn: Some(conn),
            key: key.clone(),
            inner: Arc::clone(&self.inner),
            reused: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, key: &ConnKey) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.idle.get(key).map_or(0, Vec::len)
    }
}

impl Clone for Manager {
    fn clone(&self) -> Manager {
        self.inner.handles.fetch_add(1, Ordering::SeqCst);
        Manager {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.inner.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.close();
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl ManagerInner {
    fn close(&self) {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            self.reaper_wake.notify_all();
            std::mem::take(&mut state.idle)
        };
        let mut count = 0;
        for (_, conns) in drained {
            for mut idle in conns {
                idle.conn.close();
                count += 1;
            }
        }
        log::debug!("manager closed, evicted {count} idle connections");
    }

    fn pop_idle(&self, key: &ConnKey) -> Result<Option<Connection>, HttpError> {
        let mut stale = Vec::new();
        let popped = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(HttpError::ManagerClosed);
            }
            let cutoff = Instant::now().checked_sub(self.settings.idle_timeout);
            let mut popped = None;
            if let Some(conns) = state.idle.get_mut(key) {
                // LIFO: most recently released first
                while let Some(idle) = conns.pop() {
                    if cutoff.is_some_and(|cutoff| idle.since <= cutoff) {
                        stale.push(idle.conn);
                    } else {
                        popped = Some(idle.conn);
                        break;
                    }
                }
                if conns.is_empty() {
                    state.idle.remove(key);
                }
            }
            popped
        };
        for mut conn in stale {
            conn.close();
        }
        Ok(popped)
    }

    fn release(&self, key: &ConnKey, mut conn: Connection, disposition: Disposition) {
        if disposition == Disposition::DontReuse || conn.is_closed() {
            conn.close();
            return;
        }
        let overflow = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                Some(conn)
            } else {
                let conns = state.idle.entry(key.clone()).or_default();
                if conns.len() >= self.settings.max_idle_per_key {
                    Some(conn)
                } else {
                    conns.push(Idle {
                        conn,
                        since: Instant::now(),
                    });
                    self.reaper_wake.notify_all();
                    None
                }
            }
        };
        if let Some(mut conn) = overflow {
            log::trace!("pool full for {key:?}, closing released connection");
            conn.close();
        }
    }
}

/// Background sweep of idle connections.
///
/// Sleeps on the pool condvar while the pool is empty, otherwise wakes every
/// half idle-timeout and closes connections past their timestamp outside the
/// critical section.
fn reap_idle(inner: Arc<ManagerInner>) {
    let idle_timeout = inner.settings.idle_timeout;
    let interval = idle_timeout / 2;

    let mut state = inner.state.lock().unwrap();
    loop {
        if state.closed {
            return;
        }
        if state.idle.is_empty() {
            state = inner.reaper_wake.wait(state).unwrap();
            continue;
        }

        let (guard, _) = inner.reaper_wake.wait_timeout(state, interval).unwrap();
        state = guard;
        if state.closed {
            return;
        }

        let cutoff = match Instant::now().checked_sub(idle_timeout) {
            Some(cutoff) => cutoff,
            None => continue,
        };
        let mut expired = Vec::new();
        for conns in state.idle.values_mut() {
            let (keep, dead): (Vec<Idle>, Vec<Idle>) =
                std::mem::take(conns).into_iter().partition(|idle| idle.since > cutoff);
            *conns = keep;
            expired.extend(dead);
        }
        state.idle.retain(|_, conns| !conns.is_empty());

        if !expired.is_empty() {
            drop(state);
            log::debug!("reaper closing {} idle connections", expired.len());
            for mut idle in expired {
                idle.conn.close();
            }
            state = inner.state.lock().unwrap();
        }
    }
}

/// A connection checked out of the manager.
///
/// The release token starts at `DontReuse`: dropping the guard without an
/// explicit [`ManagedConn::release`]`(Reuse)` closes the socket, so an
/// unwind or early return can never leak a descriptor or return a dirty
/// connection to the pool.
pub(crate) struct ManagedConn {
    conn: Option<Connection>,
    key: ConnKey,
    inner: Arc<ManagerInner>,
    reused: bool,
}

impl ManagedConn {
    /// Whether this connection came from the pool rather than a fresh dial.
    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection already released")
    }

    pub(crate) fn release(mut self, disposition: Disposition) {
        self.release_inner(disposition);
    }

    /// Re-type an error through the manager's I/O funnel.
    pub(crate) fn wrap_err(&self, err: HttpError) -> HttpError {
        match err {
            HttpError::Io(io_err) => (self.inner.settings.wrap_io)(io_err),
            other => other,
        }
    }

    fn release_inner(&mut self, disposition: Disposition) {
        if let Some(conn) = self.conn.take() {
            self.inner.release(&self.key, conn, disposition);
        }
    }
}

impl Drop for ManagedConn {
    fn drop(&mut self) {
        self.release_inner(Disposition::DontReuse);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ScriptedIo;
    use std::time::Duration;

    fn test_key() -> ConnKey {
        ConnKey {
            host: "example.com".to_string(),
            port: 80,
            secure: false,
            proxy: None,
        }
    }

    fn scripted_dial() -> Result<Connection, HttpError> {
        Ok(Connection::new(Box::new(ScriptedIo::new::<&[u8]>(&[]))))
    }

    fn manager_with_timeout(idle_timeout: Duration) -> Manager {
        Manager::new(ManagerSettings {
            idle_timeout,
            ..ManagerSettings::default()
        })
    }

    #[test]
    fn release_reuse_grows_pool_by_one() {
        let mgr = Manager::with_default_settings();
        let key = test_key();

        let conn = mgr.acquire(&key, &scripted_dial).unwrap();
        assert!(!conn.is_reused());
        assert_eq!(mgr.idle_count(&key), 0);

        conn.release(Disposition::Reuse);
        assert_eq!(mgr.idle_count(&key), 1);

        let conn = mgr.acquire(&key, &scripted_dial).unwrap();
        assert!(conn.is_reused());
        assert_eq!(mgr.idle_count(&key), 0);
    }

    #[test]
    fn release_dont_reuse_closes_and_leaves_pool_unchanged() {
        let mgr = Manager::with_default_settings();
        let key = test_key();

        let conn = mgr.acquire(&key, &scripted_dial).unwrap();
        conn.release(Disposition::DontReuse);
        assert_eq!(mgr.idle_count(&key), 0);

        let conn = mgr.acquire(&key, &scripted_dial).unwrap();
        assert!(!conn.is_reused());
    }

    #[test]
    fn dropping_the_guard_defaults_to_dont_reuse() {
        let mgr = Manager::with_default_settings();
        let key = test_key();

        {
            let _conn = mgr.acquire(&key, &scripted_dial).unwrap();
            // dropped without release
        }
        assert_eq!(mgr.idle_count(&key), 0);
    }

    #[test]
    fn keys_are_isolated() {
        let mgr = Manager::with_default_settings();
        let key_a = test_key();
        let key_b = ConnKey {
            port: 8080,
            ..test_key()
        };

        mgr.acquire(&key_a, &scripted_dial)
            .unwrap()
            .release(Disposition::Reuse);
        assert_eq!(mgr.idle_count(&key_a), 1);
        assert_eq!(mgr.idle_count(&key_b), 0);

        assert!(!mgr.acquire(&key_b, &scripted_dial).unwrap().is_reused());
        assert!(mgr.acquire(&key_a, &scripted_dial).unwrap().is_reused());
    }

    #[test]
    fn idle_cap_closes_overflow() {
        let mgr = Manager::new(ManagerSettings {
            max_idle_per_key: 2,
            ..ManagerSettings::default()
        });
        let key = test_key();

        for _ in 0..3 {
            let conn = mgr.acquire_fresh(&key, &scripted_dial).unwrap();
            conn.release(Disposition::Reuse);
        }
        assert_eq!(mgr.idle_count(&key), 2);
    }

    #[test]
    fn close_evicts_everything_and_rejects_acquires() {
        let mgr = Manager::with_default_settings();
        let key = test_key();
        mgr.acquire(&key, &scripted_dial)
            .unwrap()
            .release(Disposition::Reuse);

        mgr.close();
        assert!(matches!(
            mgr.acquire(&key, &scripted_dial),
            Err(HttpError::ManagerClosed)
        ));

        // closing again is a no-op
        mgr.close();
    }

    #[test]
    fn release_after_close_closes_the_connection() {
        let mgr = Manager::with_default_settings();
        let key = test_key();
        let conn = mgr.acquire(&key, &scripted_dial).unwrap();

        mgr.close();
        conn.release(Disposition::Reuse);
        assert!(matches!(
            mgr.acquire(&key, &scripted_dial),
            Err(HttpError::ManagerClosed)
        ));
    }

    #[test]
    fn stale_idle_connections_are_not_handed_out() {
        let mgr = manager_with_timeout(Duration::from_millis(10));
        let key = test_key();
        mgr.acquire(&key, &scripted_dial)
            .unwrap()
            .release(Disposition::Reuse);

        std::thread::sleep(Duration::from_millis(30));
        let conn = mgr.acquire(&key, &scripted_dial).unwrap();
        assert!(!conn.is_reused());
    }

    #[test]
    fn reaper_evicts_idle_connections() {
        let mgr = manager_with_timeout(Duration::from_millis(20));
        let key = test_key();
        mgr.acquire(&key, &scripted_dial)
            .unwrap()
            .release(Disposition::Reuse);
        assert_eq!(mgr.idle_count(&key), 1);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(mgr.idle_count(&key), 0);
    }

    #[test]
    fn clone_shares_the_pool() {
        let mgr = Manager::with_default_settings();
        let clone = mgr.clone();
        let key = test_key();

        mgr.acquire(&key, &scripted_dial)
            .unwrap()
            .release(Disposition::Reuse);
        assert!(clone.acquire(&key, &scripted_dial).unwrap().is_reused());

        drop(clone);
        // pool still usable while one handle remains
        mgr.acquire(&key, &scripted_dial)
            .unwrap()
            .release(Disposition::Reuse);
    }
}
