//! Management surface
//!
//! D-Bus objects under the well-known name `org.RDPMux.RDPMux`: the
//! top-level registration interface guests call to announce themselves, and
//! one object per listener for operator control of authentication and
//! credentials. Registration failure at startup is the one fatal condition
//! of this process.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use tracing::{info, warn};
use zbus::{dbus_interface, ConnectionBuilder};

use crate::config::{BusKind, Config};
use crate::listener::RdpListener;
use crate::protocol::PROTOCOL_VERSION;
use crate::router::VmRouter;

/// Well-known bus name.
pub const BUS_NAME: &str = "org.RDPMux.RDPMux";
/// Object path of the registration interface.
pub const OBJECT_PATH: &str = "/org/RDPMux/RDPMux";

/// D-Bus object path for a listener, derived from its UUID.
pub fn listener_object_path(uuid: &str) -> String {
    let sanitized: String = uuid.chars().filter(|c| *c != '-').collect();
    format!("/org/RDPMux/RDPListener/{sanitized}")
}

/// The registration interface.
pub struct MuxInterface {
    router: Arc<VmRouter>,
}

impl MuxInterface {
    /// Wrap the router for bus export.
    pub fn new(router: Arc<VmRouter>) -> Self {
        Self { router }
    }

    /// Version check and registration, factored out for direct testing.
    /// Returns the socket path on success and the empty string on refusal,
    /// with no listener created in the refusal case.
    pub fn handle_register(&self, id: i32, version: i32, uuid: &str, port: u16) -> String {
        if version != PROTOCOL_VERSION {
            info!(
                uuid,
                version, "client tried to connect using unsupported protocol version, ignoring"
            );
            return String::new();
        }

        match self.router.register_vm(uuid, id, None, port) {
            Ok(port) => {
                info!(uuid, port, "vm registration accepted");
                format!("ipc://{}", self.router.socket_path().display())
            }
            Err(e) => {
                warn!(uuid, "vm registration failed: {e}");
                String::new()
            }
        }
    }
}

#[dbus_interface(name = "org.RDPMux.RDPMux")]
impl MuxInterface {
    /// Register a VM and return the router socket path, or the empty string
    /// on version mismatch or failure.
    async fn register(
        &self,
        #[zbus(object_server)] server: &zbus::ObjectServer,
        id: i32,
        version: i32,
        uuid: String,
        port: u16,
    ) -> String {
        let socket_path = self.handle_register(id, version, &uuid, port);
        if socket_path.is_empty() {
            return socket_path;
        }

        // export the per-listener control object
        if let Some(listener) = self.router.listener(&uuid) {
            let path = listener_object_path(&uuid);
            let iface = ListenerInterface {
                listener: Arc::downgrade(&listener),
            };
            match server.at(path.as_str(), iface).await {
                Ok(true) => info!(%path, "listener object exported"),
                Ok(false) => warn!(%path, "listener object already exported"),
                Err(e) => warn!(%path, "listener object export failed: {e}"),
            }
        }

        socket_path
    }

    /// Protocol versions this process accepts.
    #[dbus_interface(property)]
    fn supported_protocol_versions(&self) -> Vec<i32> {
        vec![PROTOCOL_VERSION]
    }
}

/// Per-listener control object. Holds a weak reference so a stopped
/// listener's object answers with an error instead of keeping it alive.
pub struct ListenerInterface {
    listener: Weak<RdpListener>,
}

impl ListenerInterface {
    fn listener(&self) -> zbus::fdo::Result<Arc<RdpListener>> {
        self.listener
            .upgrade()
            .ok_or_else(|| zbus::fdo::Error::UnknownObject("listener has stopped".into()))
    }
}

#[dbus_interface(name = "org.RDPMux.RDPListener")]
impl ListenerInterface {
    /// Bind a credential file for subsequently accepted peers.
    fn set_credential_file(&self, credential_file: String) -> zbus::fdo::Result<()> {
        self.listener()?
            .set_credential_path(credential_file.into());
        Ok(())
    }

    /// Toggle authentication and the associated security posture.
    fn set_authentication(&self, auth: bool) -> zbus::fdo::Result<()> {
        self.listener()?.set_authentication(auth);
        Ok(())
    }

    /// The listener's TCP port.
    #[dbus_interface(property)]
    fn port(&self) -> u16 {
        self.listener.upgrade().map(|l| l.port()).unwrap_or(0)
    }

    /// Number of connected peers.
    #[dbus_interface(property)]
    fn num_connected_peers(&self) -> u32 {
        self.listener
            .upgrade()
            .map(|l| l.connected_peer_count() as u32)
            .unwrap_or(0)
    }

    /// Whether new peers must authenticate.
    #[dbus_interface(property)]
    fn requires_authentication(&self) -> bool {
        self.listener
            .upgrade()
            .map(|l| l.requires_authentication())
            .unwrap_or(false)
    }
}

/// The exported management connection. Dropping it releases the bus name.
pub struct ManagementSurface {
    _connection: zbus::Connection,
}

/// Take the well-known name and export the registration object.
pub async fn serve(router: Arc<VmRouter>, config: &Config) -> Result<ManagementSurface> {
    let builder = match config.management_bus {
        BusKind::System => ConnectionBuilder::system(),
        BusKind::Session => ConnectionBuilder::session(),
    }
    .context("failed to connect to the message bus")?;

    let connection = builder
        .name(BUS_NAME)
        .context("invalid bus name")?
        .serve_at(OBJECT_PATH, MuxInterface::new(router))
        .context("failed to export the registration object")?
        .build()
        .await
        .context("failed to take the management bus name")?;

    info!(name = BUS_NAME, path = OBJECT_PATH, "management surface registered");

    Ok(ManagementSurface {
        _connection: connection,
    })
}
