//! Service announcement on the local network (mDNS).

#![allow(missing_docs)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use parking_lot::{Condvar, Mutex};
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;

pub const SERVICE_TYPE: &str = "_plc-rpc._tcp.local.";
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// What gets announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub name: SmolStr,
    pub interface: SmolStr,
    pub port: u16,
    pub properties: Vec<(String, String)>,
}

/// Announces the service and withdraws it again.
pub trait ServicePublisher: Send + Sync {
    fn publish(&self, announcement: &Announcement) -> Result<(), RuntimeError>;
    fn unpublish(&self);
}

/// A service bound to loopback, or without a name, is not announced.
#[must_use]
pub fn should_publish(name: Option<&str>, interface: &str) -> bool {
    let Some(name) = name else {
        return false;
    };
    if name.trim().is_empty() || interface.is_empty() || interface == "localhost" {
        return false;
    }
    !interface
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

pub struct MdnsPublisher {
    daemon: Mutex<Option<ServiceDaemon>>,
    fullname: Mutex<Option<String>>,
}

impl std::fmt::Debug for MdnsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdnsPublisher")
            .field("fullname", &*self.fullname.lock())
            .finish_non_exhaustive()
    }
}

impl Default for MdnsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl MdnsPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            daemon: Mutex::new(None),
            fullname: Mutex::new(None),
        }
    }
}

impl ServicePublisher for MdnsPublisher {
    fn publish(&self, announcement: &Announcement) -> Result<(), RuntimeError> {
        let mut daemon = self.daemon.lock();
        if daemon.is_none() {
            *daemon = Some(
                ServiceDaemon::new()
                    .map_err(|err| RuntimeError::Publisher(format!("mdns start: {err}").into()))?,
            );
        }
        let Some(daemon) = daemon.as_ref() else {
            return Err(RuntimeError::Publisher("mdns daemon unavailable".into()));
        };
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "plc".into());
        let host = format!("{hostname}.local.");
        let props: HashMap<String, String> = announcement.properties.iter().cloned().collect();
        let wildcard = matches!(announcement.interface.as_str(), "0.0.0.0" | "::");
        let info = if wildcard {
            ServiceInfo::new(
                SERVICE_TYPE,
                &announcement.name,
                &host,
                (),
                announcement.port,
                props,
            )
            .map(ServiceInfo::enable_addr_auto)
        } else {
            ServiceInfo::new(
                SERVICE_TYPE,
                &announcement.name,
                &host,
                announcement.interface.as_str(),
                announcement.port,
                props,
            )
        }
        .map_err(|err| RuntimeError::Publisher(format!("mdns info: {err}").into()))?;
        let fullname = info.get_fullname().to_string();
        daemon
            .register(info)
            .map_err(|err| RuntimeError::Publisher(format!("mdns register: {err}").into()))?;
        info!(service = %fullname, "service published");
        *self.fullname.lock() = Some(fullname);
        Ok(())
    }

    fn unpublish(&self) {
        let daemon = self.daemon.lock().take();
        let Some(daemon) = daemon else {
            return;
        };
        if let Some(fullname) = self.fullname.lock().take() {
            if let Err(err) = daemon.unregister(&fullname) {
                warn!("mdns unregister failed: {err}");
            } else {
                debug!(service = %fullname, "service unpublished");
            }
        }
        let _ = daemon.shutdown();
    }
}

/// Keeps trying to publish until it works or the handle is stopped.
pub struct PublisherHandle {
    publisher: Arc<dyn ServicePublisher>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    published: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PublisherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherHandle")
            .field("published", &self.is_published())
            .finish_non_exhaustive()
    }
}

impl PublisherHandle {
    pub fn start(
        publisher: Arc<dyn ServicePublisher>,
        announcement: Announcement,
    ) -> Result<Self, RuntimeError> {
        Self::start_with_interval(publisher, announcement, RETRY_INTERVAL)
    }

    pub fn start_with_interval(
        publisher: Arc<dyn ServicePublisher>,
        announcement: Announcement,
        interval: Duration,
    ) -> Result<Self, RuntimeError> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let published = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_published = published.clone();
        let thread_publisher = publisher.clone();
        let join = thread::Builder::new()
            .name("plc-publisher".into())
            .spawn(move || loop {
                match thread_publisher.publish(&announcement) {
                    Ok(()) => {
                        thread_published.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => warn!("{err}; retrying in {interval:?}"),
                }
                let (lock, cvar) = &*thread_stop;
                let mut stopped = lock.lock();
                if !*stopped {
                    cvar.wait_for(&mut stopped, interval);
                }
                if *stopped {
                    return;
                }
            })
            .map_err(|err| RuntimeError::ThreadSpawn(err.to_string().into()))?;
        Ok(Self {
            publisher,
            stop,
            published,
            join: Some(join),
        })
    }

    #[must_use]
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    /// Stop retrying and withdraw the announcement.
    pub fn shutdown(&mut self) {
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock() = true;
            cvar.notify_all();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        if self.published.swap(false, Ordering::SeqCst) {
            self.publisher.unpublish();
        }
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct Flaky {
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
        withdrawn: AtomicBool,
    }

    impl ServicePublisher for Flaky {
        fn publish(&self, _announcement: &Announcement) -> Result<(), RuntimeError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(RuntimeError::Publisher("no network".into()));
            }
            Ok(())
        }

        fn unpublish(&self) {
            self.withdrawn.store(true, Ordering::SeqCst);
        }
    }

    fn announcement() -> Announcement {
        Announcement {
            name: "line-3".into(),
            interface: "0.0.0.0".into(),
            port: 3000,
            properties: vec![("description".into(), "test".into())],
        }
    }

    #[test]
    fn loopback_and_anonymous_services_are_not_published() {
        assert!(!should_publish(None, "0.0.0.0"));
        assert!(!should_publish(Some(""), "0.0.0.0"));
        assert!(!should_publish(Some("a"), "localhost"));
        assert!(!should_publish(Some("a"), "127.0.0.1"));
        assert!(!should_publish(Some("a"), "::1"));
        assert!(!should_publish(Some("a"), ""));
        assert!(should_publish(Some("a"), "0.0.0.0"));
        assert!(should_publish(Some("a"), "192.168.1.20"));
    }

    #[test]
    fn retries_until_published_then_withdraws() {
        let flaky = Arc::new(Flaky::default());
        flaky.failures_left.store(2, Ordering::SeqCst);
        let mut handle = PublisherHandle::start_with_interval(
            flaky.clone(),
            announcement(),
            Duration::from_millis(10),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_published() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_published());
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
        handle.shutdown();
        assert!(flaky.withdrawn.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_interrupts_retry_wait() {
        let flaky = Arc::new(Flaky::default());
        flaky.failures_left.store(usize::MAX, Ordering::SeqCst);
        let mut handle = PublisherHandle::start_with_interval(
            flaky.clone(),
            announcement(),
            Duration::from_secs(60),
        )
        .unwrap();
        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!flaky.withdrawn.load(Ordering::SeqCst));
    }
}
