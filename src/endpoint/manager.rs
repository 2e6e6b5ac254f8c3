//! Endpoint manager: creates and shares endpoints keyed by protocol and
//! address.
//!
//! The manager is the single strong owner of every endpoint it hands
//! out. Services that reuse the same 5-tuple receive the same endpoint
//! and keep only `Weak` handles, re-resolved on use; once the manager
//! drops an endpoint (teardown), outstanding handles fail to upgrade
//! and their timers abort instead of keeping the endpoint alive.

use super::udp::UdpEndpoint;
use super::{
    Endpoint, EndpointOptions, EventSender, Protocol, TcpClientEndpoint, TcpServerEndpoint,
};
use crate::error::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

/// Key of a shared endpoint: clients by remote address, servers by
/// local address, local stream endpoints by socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointKey {
    Client(Protocol, SocketAddr),
    Server(Protocol, SocketAddr),
    #[cfg(unix)]
    LocalClient(std::path::PathBuf),
    #[cfg(unix)]
    LocalServer(std::path::PathBuf),
}

pub struct EndpointManager {
    events: EventSender,
    endpoints: Mutex<HashMap<EndpointKey, Arc<dyn Endpoint>>>,
}

impl EndpointManager {
    pub fn new(events: EventSender) -> Self {
        Self { events, endpoints: Mutex::new(HashMap::new()) }
    }

    /// Client endpoint toward `remote`, created on first use and shared
    /// by every service with the same remote 5-tuple.
    pub fn client(
        &self,
        protocol: Protocol,
        remote: SocketAddr,
        options: EndpointOptions,
    ) -> Result<Weak<dyn Endpoint>> {
        let key = EndpointKey::Client(protocol, remote);
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(existing) = endpoints.get(&key) {
            return Ok(Arc::downgrade(existing));
        }
        let endpoint: Arc<dyn Endpoint> = match protocol {
            Protocol::Tcp => {
                Arc::new(TcpClientEndpoint::start(remote, options, self.events.clone()))
            }
            Protocol::Udp => Arc::new(UdpEndpoint::client(remote, options, self.events.clone())?),
            Protocol::Local => {
                unreachable!("local endpoints are keyed by path, not socket address")
            }
        };
        debug!(?protocol, %remote, endpoint = %endpoint.id(), "created client endpoint");
        let weak = Arc::downgrade(&endpoint);
        endpoints.insert(key, endpoint);
        Ok(weak)
    }

    /// Server endpoint bound on `local`.
    pub async fn server(
        &self,
        protocol: Protocol,
        local: SocketAddr,
        options: EndpointOptions,
    ) -> Result<Weak<dyn Endpoint>> {
        let key = EndpointKey::Server(protocol, local);
        {
            let endpoints = self.endpoints.lock().unwrap();
            if let Some(existing) = endpoints.get(&key) {
                return Ok(Arc::downgrade(existing));
            }
        }
        // Bind outside the lock; binding may take time and must not
        // serialize unrelated lookups.
        let endpoint: Arc<dyn Endpoint> = match protocol {
            Protocol::Tcp => {
                Arc::new(TcpServerEndpoint::bind(local, options, self.events.clone()).await?)
            }
            Protocol::Udp => Arc::new(UdpEndpoint::bind(local, options, self.events.clone())?),
            Protocol::Local => {
                unreachable!("local endpoints are keyed by path, not socket address")
            }
        };
        debug!(?protocol, %local, endpoint = %endpoint.id(), "created server endpoint");
        let mut endpoints = self.endpoints.lock().unwrap();
        // A racing bind for the same key keeps the first one in.
        let entry = endpoints.entry(key).or_insert(endpoint);
        Ok(Arc::downgrade(entry))
    }

    /// Local stream client endpoint toward the socket at `path`.
    #[cfg(unix)]
    pub fn local_client(
        &self,
        path: impl Into<std::path::PathBuf>,
        options: EndpointOptions,
    ) -> Result<Weak<dyn Endpoint>> {
        let path = path.into();
        let key = EndpointKey::LocalClient(path.clone());
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(existing) = endpoints.get(&key) {
            return Ok(Arc::downgrade(existing));
        }
        let endpoint: Arc<dyn Endpoint> = Arc::new(super::client::LocalClientEndpoint::start(
            path,
            options,
            self.events.clone(),
        ));
        let weak = Arc::downgrade(&endpoint);
        endpoints.insert(key, endpoint);
        Ok(weak)
    }

    /// Local stream server endpoint bound at `path`.
    #[cfg(unix)]
    pub fn local_server(
        &self,
        path: impl Into<std::path::PathBuf>,
        options: EndpointOptions,
    ) -> Result<Weak<dyn Endpoint>> {
        let path = path.into();
        let key = EndpointKey::LocalServer(path.clone());
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(existing) = endpoints.get(&key) {
            return Ok(Arc::downgrade(existing));
        }
        let endpoint: Arc<dyn Endpoint> = Arc::new(super::server::LocalServerEndpoint::bind(
            &path,
            options,
            self.events.clone(),
        )?);
        let weak = Arc::downgrade(&endpoint);
        endpoints.insert(key, endpoint);
        Ok(weak)
    }

    /// Multicast UDP server endpoint: bound to the group port with
    /// address reuse, joined to `group` on `interface`. Keyed like any
    /// UDP server so repeated joins share one socket.
    pub fn multicast_server(
        &self,
        group: std::net::Ipv4Addr,
        port: u16,
        interface: std::net::Ipv4Addr,
        options: EndpointOptions,
    ) -> Result<Weak<dyn Endpoint>> {
        let key = EndpointKey::Server(Protocol::Udp, SocketAddr::new(group.into(), port));
        let mut endpoints = self.endpoints.lock().unwrap();
        if let Some(existing) = endpoints.get(&key) {
            return Ok(Arc::downgrade(existing));
        }
        let endpoint: Arc<dyn Endpoint> = Arc::new(UdpEndpoint::bind_multicast(
            group,
            port,
            interface,
            options,
            self.events.clone(),
        )?);
        debug!(%group, port, endpoint = %endpoint.id(), "created multicast endpoint");
        let weak = Arc::downgrade(&endpoint);
        endpoints.insert(key, endpoint);
        Ok(weak)
    }

    /// Resolve a key to a live endpoint.
    pub fn get(&self, key: &EndpointKey) -> Option<Arc<dyn Endpoint>> {
        self.endpoints.lock().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().unwrap().is_empty()
    }

    /// Stop and drop every endpoint. Weak handles held by services stop
    /// upgrading from here on.
    pub fn stop_all(&self) {
        let mut endpoints = self.endpoints.lock().unwrap();
        for (key, endpoint) in endpoints.drain() {
            debug!(?key, endpoint = %endpoint.id(), "stopping endpoint");
            endpoint.stop();
        }
    }
}

impl Drop for EndpointManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn options() -> EndpointOptions {
        EndpointOptions {
            max_message_size: 1400,
            queue_limit: 16,
            flush_timeout: std::time::Duration::from_millis(1000),
            connect_timeout: std::time::Duration::from_millis(100),
            max_connect_timeout: std::time::Duration::from_millis(6400),
            magic_cookies: false,
            command_framing: false,
        }
    }

    #[tokio::test]
    async fn same_tuple_shares_endpoint() {
        let (tx, _rx) = mpsc::channel(16);
        let manager = EndpointManager::new(tx);
        let remote: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let a = manager.client(Protocol::Udp, remote, options()).unwrap();
        let b = manager.client(Protocol::Udp, remote, options()).unwrap();
        assert!(Weak::ptr_eq(&a, &b));
        assert_eq!(manager.len(), 1);

        let other: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let c = manager.client(Protocol::Udp, other, options()).unwrap();
        assert!(!Weak::ptr_eq(&a, &c));
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn weak_handles_die_with_manager() {
        let (tx, _rx) = mpsc::channel(16);
        let manager = EndpointManager::new(tx);
        let remote: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let weak = manager.client(Protocol::Udp, remote, options()).unwrap();
        assert!(weak.upgrade().is_some());

        manager.stop_all();
        assert!(weak.upgrade().is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn server_sharing_and_lookup() {
        let (tx, _rx) = mpsc::channel(16);
        let manager = EndpointManager::new(tx);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = manager.server(Protocol::Udp, local, options()).await.unwrap();
        let b = manager.server(Protocol::Udp, local, options()).await.unwrap();
        assert!(Weak::ptr_eq(&a, &b));

        let resolved = manager.get(&EndpointKey::Server(Protocol::Udp, local)).unwrap();
        assert_eq!(resolved.id(), a.upgrade().unwrap().id());
        assert!(manager.get(&EndpointKey::Client(Protocol::Udp, local)).is_none());
    }
}
