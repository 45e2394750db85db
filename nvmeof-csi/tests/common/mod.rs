//! Fake host collaborators for driving the node service in tests.
//!
//! The fakes share one event log so tests can assert the order in which
//! host state was mutated across fabric and mount operations.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nvmeof_csi::NodeService;
use nvmeof_csi::csi;
use nvmeof_csi::exec::ExecError;
use nvmeof_csi::initiator::{Initiator, InitiatorError, InitiatorFactory};
use nvmeof_csi::mount::{MountError, MountManager, Mounter};
use nvmeof_csi::types::ConnectionParams;

pub type EventLog = Arc<Mutex<Vec<String>>>;

fn record(log: &EventLog, event: String) {
    log.lock().unwrap().push(event);
}

/// In-memory mount table over real files.
pub struct FakeMounter {
    mounted: Mutex<HashMap<PathBuf, PathBuf>>,
    log: EventLog,
    pub fail_bind: bool,
}

impl FakeMounter {
    pub fn new(log: EventLog) -> Self {
        Self {
            mounted: Mutex::new(HashMap::new()),
            log,
            fail_bind: false,
        }
    }

    pub fn source_of(&self, target: &Path) -> Option<PathBuf> {
        self.mounted.lock().unwrap().get(target).cloned()
    }

    pub fn mounted(&self) -> HashSet<PathBuf> {
        self.mounted.lock().unwrap().keys().cloned().collect()
    }
}

#[tonic::async_trait]
impl Mounter for FakeMounter {
    async fn is_mount_point(&self, path: &Path) -> io::Result<bool> {
        if !path.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such path"));
        }
        Ok(self.mounted.lock().unwrap().contains_key(path))
    }

    async fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), MountError> {
        if self.fail_bind {
            return Err(MountError::CommandFailed {
                command: "mount --bind".to_string(),
                output: "mount: special device does not exist".to_string(),
            });
        }
        record(
            &self.log,
            format!("bind {} {}", source.display(), target.display()),
        );
        self.mounted
            .lock()
            .unwrap()
            .insert(target.to_path_buf(), source.to_path_buf());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        record(&self.log, format!("unmount {}", target.display()));
        self.mounted.lock().unwrap().remove(target);
        Ok(())
    }
}

/// Fabric initiator that materializes a device file after an optional delay.
pub struct FakeInitiatorFactory {
    device_dir: PathBuf,
    delay: Duration,
    connects: Arc<AtomicUsize>,
    log: EventLog,
}

impl FakeInitiatorFactory {
    pub fn new(device_dir: &Path, delay: Duration, log: EventLog) -> Self {
        Self {
            device_dir: device_dir.to_path_buf(),
            delay,
            connects: Arc::new(AtomicUsize::new(0)),
            log,
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl InitiatorFactory for FakeInitiatorFactory {
    fn create(&self, params: &ConnectionParams) -> Box<dyn Initiator> {
        Box::new(FakeInitiator {
            device: self
                .device_dir
                .join(format!("nvme-uuid.{}", params.uuid)),
            nqn: params.nqn.clone(),
            delay: self.delay,
            connects: self.connects.clone(),
            log: self.log.clone(),
        })
    }
}

struct FakeInitiator {
    device: PathBuf,
    nqn: String,
    delay: Duration,
    connects: Arc<AtomicUsize>,
    log: EventLog,
}

#[tonic::async_trait]
impl Initiator for FakeInitiator {
    async fn connect(&self) -> Result<PathBuf, InitiatorError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        record(&self.log, format!("connect start {}", self.nqn));
        tokio::time::sleep(self.delay).await;
        std::fs::write(&self.device, b"").map_err(|source| ExecError::Spawn {
            program: "fake-connect".to_string(),
            source,
        })?;
        record(&self.log, format!("connect end {}", self.nqn));
        Ok(self.device.clone())
    }

    async fn disconnect(&self) -> Result<(), InitiatorError> {
        record(&self.log, format!("disconnect {}", self.nqn));
        let _ = std::fs::remove_file(&self.device);
        Ok(())
    }
}

/// A node service wired to fakes rooted in a scratch directory.
pub struct Harness {
    pub node: Arc<NodeService>,
    pub mounter: Arc<FakeMounter>,
    pub initiators: Arc<FakeInitiatorFactory>,
    pub log: EventLog,
    pub root: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self::build(delay, false)
    }

    pub fn failing_bind() -> Self {
        Self::build(Duration::ZERO, true)
    }

    fn build(delay: Duration, fail_bind: bool) -> Self {
        let root = tempfile::tempdir().unwrap();
        let devices = root.path().join("dev");
        std::fs::create_dir_all(&devices).unwrap();

        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut mounter = FakeMounter::new(log.clone());
        mounter.fail_bind = fail_bind;
        let mounter = Arc::new(mounter);
        let initiators = Arc::new(FakeInitiatorFactory::new(&devices, delay, log.clone()));

        let node = NodeService::with_components(
            "test-node".to_string(),
            MountManager::new(mounter.clone()),
            initiators.clone(),
        );

        Self {
            node: Arc::new(node),
            mounter,
            initiators,
            log,
            root,
        }
    }

    pub fn staging_dir(&self) -> String {
        self.root.path().join("stage").display().to_string()
    }

    pub fn target_path(&self, pod: &str, volume_id: &str) -> String {
        self.root
            .path()
            .join("pods")
            .join(pod)
            .join(volume_id)
            .display()
            .to_string()
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

pub fn publish_context(nqn: &str, uuid: &str) -> HashMap<String, String> {
    HashMap::from([
        ("transport".to_string(), "tcp".to_string()),
        ("traddr".to_string(), "10.0.0.5".to_string()),
        ("trsvcid".to_string(), "4420".to_string()),
        ("nqn".to_string(), nqn.to_string()),
        ("uuid".to_string(), uuid.to_string()),
    ])
}

pub fn block_capability() -> Option<csi::VolumeCapability> {
    Some(csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
        }),
    })
}

pub fn stage_request(
    volume_id: &str,
    staging_dir: &str,
    context: HashMap<String, String>,
) -> csi::NodeStageVolumeRequest {
    csi::NodeStageVolumeRequest {
        volume_id: volume_id.to_string(),
        publish_context: context,
        staging_target_path: staging_dir.to_string(),
        volume_capability: block_capability(),
        ..Default::default()
    }
}

pub fn unstage_request(volume_id: &str, staging_dir: &str) -> csi::NodeUnstageVolumeRequest {
    csi::NodeUnstageVolumeRequest {
        volume_id: volume_id.to_string(),
        staging_target_path: staging_dir.to_string(),
    }
}

pub fn publish_request(
    volume_id: &str,
    staging_dir: &str,
    target_path: &str,
) -> csi::NodePublishVolumeRequest {
    csi::NodePublishVolumeRequest {
        volume_id: volume_id.to_string(),
        staging_target_path: staging_dir.to_string(),
        target_path: target_path.to_string(),
        volume_capability: block_capability(),
        ..Default::default()
    }
}

pub fn unpublish_request(volume_id: &str, target_path: &str) -> csi::NodeUnpublishVolumeRequest {
    csi::NodeUnpublishVolumeRequest {
        volume_id: volume_id.to_string(),
        target_path: target_path.to_string(),
    }
}
