//! Service context: every component, wired once at process start.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use crate::blob::BlobStore;
use crate::config::ServiceConfig;
use crate::controller::{ControllerOptions, PlcController, PlcState};
use crate::error::RuntimeError;
use crate::front::{ServiceFront, PROTOCOL_VERSION};
use crate::identity::Identity;
use crate::loader::ProgramLoader;
use crate::publisher::{should_publish, Announcement, MdnsPublisher, PublisherHandle};
use crate::transport::{spawn_binary_server, spawn_json_server, ServerHandle};
use crate::worker::Worker;

/// Scratch directory for uploads, relative to the working directory.
pub const BLOB_DIR_NAME: &str = "tmp";

/// The running service.
///
/// Construction opens the listeners but does not touch the installed
/// program; [`ServiceContext::bootstrap`] does that once the worker loop is
/// running.
pub struct ServiceContext {
    config: ServiceConfig,
    worker: Worker,
    controller: PlcController,
    front: Arc<ServiceFront>,
    identity: Option<Identity>,
    binary_server: Option<ServerHandle>,
    json_server: Option<ServerHandle>,
    publisher: Option<PublisherHandle>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("controller", &self.controller)
            .field("binary_server", &self.binary_server)
            .field("json_server", &self.json_server)
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    pub fn start(
        config: ServiceConfig,
        working_dir: impl Into<PathBuf>,
        loader: Arc<dyn ProgramLoader>,
    ) -> Result<Self, RuntimeError> {
        let working_dir = working_dir.into();
        let worker = Worker::new();
        let controller = PlcController::new(
            &working_dir,
            loader,
            worker.clone(),
            ControllerOptions::from(&config),
        )?;

        let identity =
            Identity::load_or_generate(&config.secret_path(&working_dir), config.identity.generate)?;
        if config.require_psk && identity.is_none() {
            return Err(RuntimeError::InvalidConfig(
                "auth.require_psk needs a service identity".into(),
            ));
        }
        if let Some(identity) = &identity {
            controller.set_identity(identity.id.clone());
        }

        let quit_worker = worker.clone();
        controller.set_quit_hook(move || quit_worker.quit());

        let blobs = BlobStore::open(working_dir.join(BLOB_DIR_NAME))?;
        let front = ServiceFront::new(
            controller.clone(),
            blobs,
            identity.clone(),
            config.require_psk,
        );

        let host = bind_host(&config.interface);
        let binary_server = if config.binding.binary() {
            Some(spawn_binary_server(
                &format!("{host}:{}", config.port),
                front.clone(),
            )?)
        } else {
            None
        };
        let json_server = if config.binding.json() {
            Some(spawn_json_server(
                &format!("{host}:{}", config.json_port),
                front.clone(),
            )?)
        } else {
            None
        };

        let mut service = Self {
            config,
            worker,
            controller,
            front,
            identity,
            binary_server,
            json_server,
            publisher: None,
        };
        service.publisher = service.start_publisher()?;
        Ok(service)
    }

    fn start_publisher(&self) -> Result<Option<PublisherHandle>, RuntimeError> {
        let name = self.config.name.as_deref();
        if !should_publish(name, &self.config.interface) {
            return Ok(None);
        }
        let Some(name) = self.config.name.clone() else {
            return Ok(None);
        };
        let (port, protocol) = match (self.binary_addr(), self.json_addr()) {
            (Some(addr), _) => (addr.port(), "binary"),
            (None, Some(addr)) => (addr.port(), "json"),
            (None, None) => return Ok(None),
        };
        let mut properties = vec![
            ("description".to_string(), name.to_string()),
            ("protocol".to_string(), protocol.to_string()),
            ("version".to_string(), PROTOCOL_VERSION.to_string()),
        ];
        if let Some(identity) = &self.identity {
            properties.push(("id".to_string(), identity.id.to_string()));
        }
        let announcement = Announcement {
            name,
            interface: self.config.interface.clone(),
            port,
            properties,
        };
        PublisherHandle::start(Arc::new(MdnsPublisher::new()), announcement).map(Some)
    }

    /// Load the installed program and start it when configured to.
    pub fn bootstrap(&self) -> PlcState {
        bootstrap(&self.controller, self.config.autostart)
    }

    /// Run the worker loop on the calling thread until the service is asked
    /// to quit, then tear everything down.
    pub fn run(mut self) -> Result<(), RuntimeError> {
        let bootstrap_controller = self.controller.clone();
        let autostart = self.config.autostart;
        thread::Builder::new()
            .name("plc-bootstrap".into())
            .spawn(move || {
                bootstrap(&bootstrap_controller, autostart);
            })
            .map_err(|err| RuntimeError::ThreadSpawn(err.to_string().into()))?;
        self.worker.run_loop();
        self.shutdown();
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Some(mut publisher) = self.publisher.take() {
            publisher.shutdown();
        }
        for server in [self.binary_server.take(), self.json_server.take()]
            .into_iter()
            .flatten()
        {
            server.shutdown();
        }
        self.controller.shutdown();
        self.worker.quit();
        info!("service stopped");
    }

    #[must_use]
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    #[must_use]
    pub fn controller(&self) -> &PlcController {
        &self.controller
    }

    #[must_use]
    pub fn front(&self) -> &Arc<ServiceFront> {
        &self.front
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn working_dir(&self) -> &Path {
        self.controller.working_dir()
    }

    #[must_use]
    pub fn binary_addr(&self) -> Option<std::net::SocketAddr> {
        self.binary_server.as_ref().map(ServerHandle::local_addr)
    }

    #[must_use]
    pub fn json_addr(&self) -> Option<std::net::SocketAddr> {
        self.json_server.as_ref().map(ServerHandle::local_addr)
    }
}

fn bind_host(interface: &str) -> String {
    match interface {
        "" => "localhost".to_string(),
        ipv6 if ipv6.contains(':') => format!("[{ipv6}]"),
        other => other.to_string(),
    }
}

fn bootstrap(controller: &PlcController, autostart: bool) -> PlcState {
    let state = controller.autoload();
    info!(state = %state, "autoload finished");
    if autostart && state == PlcState::Stopped && !controller.start_plc() {
        warn!("autostart failed");
    }
    controller.status()
}

/// Replace the current process with a fresh copy of itself.
///
/// Returns only if the restart could not be performed.
pub fn restart_process() {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            error!("cannot locate own executable: {err}");
            return;
        }
    };
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    info!(exe = %exe.display(), "restarting service");
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = Command::new(&exe).args(&args).exec();
        error!("re-exec failed: {err}");
    }
    #[cfg(not(unix))]
    {
        match Command::new(&exe).args(&args).spawn() {
            Ok(_) => std::process::exit(0),
            Err(err) => error!("restart failed: {err}"),
        }
    }
}
