//! The identity provisioning state machine.
//!
//! Evaluated once at startup:
//!
//! 1. local state present → reconcile against the registry
//! 2. otherwise restore CA + server from the store, all-or-nothing
//! 3. otherwise bootstrap a fresh CA, server and client set
//! 4. reconcile issues identities only for devices with none; existing
//!    identities are never re-issued by name
//! 5. ready → emit the tunnel configuration
//!
//! Store writes along the way are best-effort: a failed backup never
//! blocks a run, because local state is authoritative for this process
//! lifetime.

use crate::address::AddressResolver;
use crate::error::ProvisionError;
use crate::registry::DeviceRegistry;
use crate::state::{MaterialDir, ProvisioningState};
use crate::store::{self, KeyMaterialStore};
use crate::tunnel::TunnelConfigEmitter;
use hocus_pki::{CaConfig, Identity, IdentityRole, PkiError};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Device name reserved for the legacy shared client identity.
const SHARED_DEVICE: &str = "shared";

const SERVER_SUBJECT: &str = "Hocuspocus VPN Server";

/// Provisioning phases, in startup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Restoring,
    Bootstrapping,
    Reconciling,
    Ready,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Restoring => "restoring",
            Phase::Bootstrapping => "bootstrapping",
            Phase::Reconciling => "reconciling",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where this run's state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    Local,
    Restored,
    Bootstrapped,
}

/// Provisioner behaviour knobs.
#[derive(Debug, Clone)]
pub struct ProvisionerOptions {
    pub registry: DeviceRegistry,
    pub ca: CaConfig,
    pub material_dir: PathBuf,
    pub output_dir: PathBuf,
    pub p12_passphrase: String,
    pub shared_client_identity: bool,
    pub skip_failed_devices: bool,
}

/// Outcome of one provisioning run.
#[derive(Debug)]
pub struct ProvisionReport {
    pub address: IpAddr,
    pub source: StateSource,
    /// Device names issued fresh identities during this run
    pub issued: Vec<String>,
    pub server_rotated: bool,
    pub conf_path: PathBuf,
    pub secrets_path: PathBuf,
    pub state: ProvisioningState,
}

/// Drives the state machine once, synchronously, to completion.
pub struct Provisioner {
    options: ProvisionerOptions,
    material: MaterialDir,
    store: Arc<dyn KeyMaterialStore>,
    resolver: AddressResolver,
    emitter: TunnelConfigEmitter,
}

impl Provisioner {
    pub fn new(
        options: ProvisionerOptions,
        store: Arc<dyn KeyMaterialStore>,
        resolver: AddressResolver,
    ) -> Self {
        let material = MaterialDir::new(&options.material_dir);
        Self {
            options,
            material,
            store,
            resolver,
            emitter: TunnelConfigEmitter::default(),
        }
    }

    /// Run the full state machine and emit the tunnel configuration.
    pub async fn run(&self) -> Result<ProvisionReport, ProvisionError> {
        let mut phase = Phase::Uninitialized;
        match self.run_phases(&mut phase).await {
            Ok(report) => Ok(report),
            Err(e) => {
                advance(&mut phase, Phase::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases(&self, phase: &mut Phase) -> Result<ProvisionReport, ProvisionError> {
        let mut issued = Vec::new();

        // Precondition for everything else: the server certificate's SAN
        // must name the address peers will dial.
        let address = self.resolver.resolve().await?;

        let local = if self.material.has_server_identity() {
            info!(dir = %self.material.root().display(), "local server identity present");
            self.load_local()?
        } else {
            None
        };

        let (mut state, source) = match local {
            Some(state) => (state, StateSource::Local),
            None => {
                advance(phase, Phase::Restoring);
                match self.try_restore().await? {
                    Some(state) => {
                        info!("restored provisioning state from key-material store");
                        self.materialize(&state)?;
                        (state, StateSource::Restored)
                    }
                    None => {
                        advance(phase, Phase::Bootstrapping);
                        let state = self.bootstrap(address, &mut issued).await?;
                        (state, StateSource::Bootstrapped)
                    }
                }
            }
        };

        let mut server_rotated = false;
        if source != StateSource::Bootstrapped {
            if !state.server_covers(address) {
                info!(%address, "public address changed, re-issuing server identity");
                state.server = self.reissue_server(address, &state.ca)?;
                self.material.write_identity(
                    &state.server,
                    store::SERVER_CERT,
                    store::SERVER_KEY,
                )?;
                self.persist_best_effort(vec![
                    (store::SERVER_CERT.to_string(), state.server.cert_pem.clone().into_bytes()),
                    (store::SERVER_KEY.to_string(), state.server.key_pem.clone().into_bytes()),
                ])
                .await;
                server_rotated = true;
            }

            advance(phase, Phase::Reconciling);
            self.reconcile(&mut state, &mut issued).await?;
        }

        advance(phase, Phase::Ready);
        for (device, identity) in &state.clients {
            debug!(
                device,
                fingerprint = identity.fingerprint().unwrap_or_default(),
                "client identity active"
            );
        }

        let (conf_path, secrets_path) = self.emit(&state, address)?;
        info!(
            %address,
            devices = state.clients.len(),
            issued = issued.len(),
            conf = %conf_path.display(),
            "provisioning complete"
        );

        Ok(ProvisionReport {
            address,
            source,
            issued,
            server_rotated,
            conf_path,
            secrets_path,
            state,
        })
    }

    /// Load the complete identity set from the local material directory.
    /// Returns `None` when the CA or server halves are missing or
    /// unreadable, letting the caller fall through to restore.
    fn load_local(&self) -> Result<Option<ProvisioningState>, ProvisionError> {
        let Some(ca) = self
            .material
            .load_identity(IdentityRole::Ca, store::CA_CERT, store::CA_KEY)?
        else {
            warn!("local server identity present but CA is not, falling through to restore");
            return Ok(None);
        };
        let Some(server) = self.material.load_identity(
            IdentityRole::Server,
            store::SERVER_CERT,
            store::SERVER_KEY,
        )?
        else {
            return Ok(None);
        };

        let mut clients = BTreeMap::new();
        for name in self.client_names() {
            let loaded = self.material.load_identity(
                IdentityRole::Client,
                &store::client_cert_object(&name),
                &store::client_key_object(&name),
            )?;
            if let Some(identity) = loaded {
                clients.insert(name, identity);
            }
        }

        Ok(Some(ProvisioningState {
            ca,
            server,
            clients,
        }))
    }

    /// Attempt a full restore from the store. The CA and server pairs are
    /// all-or-nothing: partial remote state is never trusted, because a
    /// half-written state risks issuing certificates under an orphaned CA.
    /// Client identities are restored individually where complete.
    async fn try_restore(&self) -> Result<Option<ProvisioningState>, ProvisionError> {
        let ca_cert = self.fetch_absent_ok(store::CA_CERT).await?;
        let ca_key = self.fetch_absent_ok(store::CA_KEY).await?;
        let server_cert = self.fetch_absent_ok(store::SERVER_CERT).await?;
        let server_key = self.fetch_absent_ok(store::SERVER_KEY).await?;

        let (Some(ca_cert), Some(ca_key), Some(server_cert), Some(server_key)) =
            (ca_cert, ca_key, server_cert, server_key)
        else {
            return Ok(None);
        };

        let Some(ca) = rebuild_identity(IdentityRole::Ca, ca_cert, ca_key) else {
            return Ok(None);
        };
        let Some(server) = rebuild_identity(IdentityRole::Server, server_cert, server_key) else {
            return Ok(None);
        };

        let mut clients = BTreeMap::new();
        for name in self.client_names() {
            let cert = self.fetch_absent_ok(&store::client_cert_object(&name)).await?;
            let key = self.fetch_absent_ok(&store::client_key_object(&name)).await?;
            if let (Some(cert), Some(key)) = (cert, key) {
                if let Some(identity) = rebuild_identity(IdentityRole::Client, cert, key) {
                    clients.insert(name, identity);
                }
            }
        }

        Ok(Some(ProvisioningState {
            ca,
            server,
            clients,
        }))
    }

    /// First run: fresh CA, server identity naming the resolved address,
    /// one client identity per registered device.
    async fn bootstrap(
        &self,
        address: IpAddr,
        issued: &mut Vec<String>,
    ) -> Result<ProvisioningState, ProvisionError> {
        info!("bootstrapping fresh provisioning state");
        let ca = hocus_pki::create_root(&self.options.ca).map_err(|e| signing("bootstrap", e))?;
        info!(
            fingerprint = ca.fingerprint().unwrap_or_default(),
            "created root CA"
        );
        let server = self.reissue_server(address, &ca)?;

        self.material
            .write_identity(&ca, store::CA_CERT, store::CA_KEY)?;
        self.material
            .write_identity(&server, store::SERVER_CERT, store::SERVER_KEY)?;

        let mut objects = vec![
            (store::CA_CERT.to_string(), ca.cert_pem.clone().into_bytes()),
            (store::CA_KEY.to_string(), ca.key_pem.clone().into_bytes()),
            (store::SERVER_CERT.to_string(), server.cert_pem.clone().into_bytes()),
            (store::SERVER_KEY.to_string(), server.key_pem.clone().into_bytes()),
        ];

        let mut clients = BTreeMap::new();
        for name in self.client_names() {
            let identity = self
                .issue_client(&name, &ca, &mut objects)
                .map_err(|e| signing("bootstrap", e))?;
            issued.push(name.clone());
            clients.insert(name, identity);
        }

        self.persist_best_effort(objects).await;

        Ok(ProvisioningState {
            ca,
            server,
            clients,
        })
    }

    /// Issue identities for registered devices that have none. Existence
    /// is checked by device name only: an existing identity is never
    /// regenerated here, rotation is an explicit out-of-band action.
    async fn reconcile(
        &self,
        state: &mut ProvisioningState,
        issued: &mut Vec<String>,
    ) -> Result<(), ProvisionError> {
        let mut objects = Vec::new();
        for name in self.client_names() {
            if state.has_client(&name) {
                continue;
            }
            match self.issue_client(&name, &state.ca, &mut objects) {
                Ok(identity) => {
                    info!(device = %name, "issued identity for new device");
                    issued.push(name.clone());
                    state.clients.insert(name, identity);
                }
                Err(e) if self.options.skip_failed_devices => {
                    warn!(device = %name, error = %e, "skipping device after signing failure");
                }
                Err(e) => return Err(signing("reconcile", e)),
            }
        }

        if !objects.is_empty() {
            self.persist_best_effort(objects).await;
        }
        Ok(())
    }

    /// Render and write the tunnel daemon's configuration and secrets.
    fn emit(
        &self,
        state: &ProvisioningState,
        address: IpAddr,
    ) -> Result<(PathBuf, PathBuf), ProvisionError> {
        let conf = self.emitter.render_conf(
            state,
            &self.options.registry,
            address,
            self.options.skip_failed_devices,
        )?;
        let secrets = self.emitter.render_secrets();

        std::fs::create_dir_all(&self.options.output_dir)
            .map_err(|e| ProvisionError::io(&self.options.output_dir, e))?;
        let conf_path = self.options.output_dir.join("ipsec.conf");
        let secrets_path = self.options.output_dir.join("ipsec.secrets");
        std::fs::write(&conf_path, conf).map_err(|e| ProvisionError::io(&conf_path, e))?;
        std::fs::write(&secrets_path, secrets)
            .map_err(|e| ProvisionError::io(&secrets_path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&secrets_path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ProvisionError::io(&secrets_path, e))?;
        }
        Ok((conf_path, secrets_path))
    }

    fn reissue_server(&self, address: IpAddr, ca: &Identity) -> Result<Identity, ProvisionError> {
        hocus_pki::issue(
            &self.options.ca,
            IdentityRole::Server,
            SERVER_SUBJECT,
            &address.to_string(),
            ca,
        )
        .map_err(|e| signing("bootstrap", e))
    }

    /// Issue one client identity, write it (plus its PKCS12 bundle)
    /// locally, and queue the store objects for best-effort persistence.
    fn issue_client(
        &self,
        name: &str,
        ca: &Identity,
        objects: &mut Vec<(String, Vec<u8>)>,
    ) -> Result<Identity, PkiError> {
        let identity = hocus_pki::issue(&self.options.ca, IdentityRole::Client, name, name, ca)?;
        let bundle = hocus_pki::client_bundle(&identity, ca, &self.options.p12_passphrase)?;

        let cert_object = store::client_cert_object(name);
        let key_object = store::client_key_object(name);
        let p12_object = store::client_p12_object(name);
        self.material
            .write_identity(&identity, &cert_object, &key_object)
            .map_err(|e| PkiError::Io(std::io::Error::other(e.to_string())))?;
        self.material
            .write(&p12_object, &bundle)
            .map_err(|e| PkiError::Io(std::io::Error::other(e.to_string())))?;

        objects.push((cert_object, identity.cert_pem.clone().into_bytes()));
        objects.push((key_object, identity.key_pem.clone().into_bytes()));
        objects.push((p12_object, bundle));
        Ok(identity)
    }

    /// Registered device names, plus the legacy shared identity if enabled.
    fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .options
            .registry
            .devices()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        if self.options.shared_client_identity {
            names.push(SHARED_DEVICE.to_string());
        }
        names
    }

    /// Mirror a restored state into the local material directory.
    fn materialize(&self, state: &ProvisioningState) -> Result<(), ProvisionError> {
        self.material
            .write_identity(&state.ca, store::CA_CERT, store::CA_KEY)?;
        self.material
            .write_identity(&state.server, store::SERVER_CERT, store::SERVER_KEY)?;
        for (name, identity) in &state.clients {
            self.material.write_identity(
                identity,
                &store::client_cert_object(name),
                &store::client_key_object(name),
            )?;
        }
        Ok(())
    }

    /// Read one object during restore. Not-found and transient failures
    /// mean "absent for this run"; a permission failure is fatal, because
    /// falling through to bootstrap would re-key the CA and orphan every
    /// deployed device profile.
    async fn fetch_absent_ok(&self, object: &str) -> Result<Option<Vec<u8>>, ProvisionError> {
        match self.store.get(object).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.treat_as_absent() => {
                debug!(object, error = %e, "restore: object absent");
                Ok(None)
            }
            Err(e) => Err(ProvisionError::StoreAccess(e)),
        }
    }

    async fn persist_best_effort(&self, objects: Vec<(String, Vec<u8>)>) {
        for (object, data) in objects {
            if let Err(e) = self.store.put(&object, &data).await {
                warn!(object, error = %e, "best-effort store write failed");
            }
        }
    }
}

fn advance(phase: &mut Phase, next: Phase) {
    debug!(from = %phase, to = %next, "phase transition");
    *phase = next;
}

fn signing(stage: &'static str, source: PkiError) -> ProvisionError {
    ProvisionError::Signing { stage, source }
}

fn rebuild_identity(role: IdentityRole, cert: Vec<u8>, key: Vec<u8>) -> Option<Identity> {
    let cert_pem = String::from_utf8(cert).ok()?;
    let key_pem = String::from_utf8(key).ok()?;
    match Identity::from_pem_parts(role, cert_pem, key_pem) {
        Ok(identity) => Some(identity),
        Err(e) => {
            warn!(%role, error = %e, "restored material unparseable, treating as absent");
            None
        }
    }
}
