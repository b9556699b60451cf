//! iSCSI Provisioner
//!
//! Turns a volume request into a virtual disk on the array and a
//! `PersistentVolume` describing how nodes reach it over iSCSI; deletes the
//! disk again when the volume is released.

use crate::domain::ports::{AccessMode, SanBackendRef};
use crate::error::{Error, Result};
use crate::metrics::ProvisionerMetrics;
use k8s_openapi::api::core::v1::{
    ISCSIPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

// =============================================================================
// Constants
// =============================================================================

/// Annotation naming the provisioner instance that created a volume
pub const ANN_IDENTITY: &str = "smcli-provisioner/identity";

/// Annotation naming the provisioner that created a volume
pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

pub const DEFAULT_FS_TYPE: &str = "ext4";

pub const DEFAULT_RECLAIM_POLICY: &str = "Delete";

/// Storage class parameter keys
pub mod params {
    pub const TARGET_PORTAL: &str = "targetPortal";
    pub const PORTALS: &str = "portals";
    pub const IQN: &str = "iqn";
    pub const ISCSI_INTERFACE: &str = "iscsiInterface";
    pub const FS_TYPE: &str = "fsType";
    pub const READ_ONLY: &str = "readonly";
}

// =============================================================================
// Storage Class Parameters
// =============================================================================

/// iSCSI connection settings read from storage class parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiParameters {
    pub target_portal: String,
    pub portals: Vec<String>,
    pub iqn: String,
    pub iscsi_interface: Option<String>,
    pub fs_type: String,
    pub read_only: bool,
}

impl IscsiParameters {
    pub fn from_map(parameters: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| param(parameters, key);

        let portals = match get(params::PORTALS) {
            "" => Vec::new(),
            list => list.split(',').map(str::to_string).collect(),
        };

        let fs_type = match get(params::FS_TYPE) {
            "" => DEFAULT_FS_TYPE.to_string(),
            fs => fs.to_string(),
        };

        Self {
            target_portal: get(params::TARGET_PORTAL).to_string(),
            portals,
            iqn: get(params::IQN).to_string(),
            iscsi_interface: Some(get(params::ISCSI_INTERFACE).to_string()).filter(|i| !i.is_empty()),
            fs_type,
            read_only: parse_bool(get(params::READ_ONLY)).unwrap_or(false),
        }
    }

    /// Check the settings a node needs to log in to the target
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.target_portal.is_empty() {
            missing.push(params::TARGET_PORTAL);
        }
        if self.iqn.is_empty() {
            missing.push(params::IQN);
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "missing storage class parameters: {}",
                missing.join(", ")
            )))
        }
    }

    /// Volume source for the disk. The bound LUN is not reported; the
    /// source always names LUN 0.
    pub fn volume_source(&self) -> ISCSIPersistentVolumeSource {
        ISCSIPersistentVolumeSource {
            target_portal: self.target_portal.clone(),
            portals: Some(self.portals.clone()).filter(|p| !p.is_empty()),
            iqn: self.iqn.clone(),
            iscsi_interface: self.iscsi_interface.clone(),
            lun: 0,
            read_only: Some(self.read_only),
            fs_type: Some(self.fs_type.clone()),
            ..Default::default()
        }
    }
}

fn param<'a>(parameters: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    parameters.get(key).map(String::as_str).unwrap_or_default()
}

/// Boolean spellings accepted for the `readonly` parameter
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Parse requested access modes, rejecting any an iSCSI LUN cannot honour
pub fn validate_access_modes(modes: &[String]) -> Result<Vec<AccessMode>> {
    let supported = || {
        AccessMode::SUPPORTED
            .iter()
            .map(AccessMode::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    };

    modes
        .iter()
        .map(|mode| {
            mode.parse::<AccessMode>()
                .ok()
                .filter(AccessMode::is_supported)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "invalid access mode {}: only {} are supported",
                        mode,
                        supported()
                    ))
                })
        })
        .collect()
}

// =============================================================================
// Volume Options
// =============================================================================

/// Everything needed to provision one volume
#[derive(Debug, Clone, Default)]
pub struct VolumeOptions {
    /// Name of the volume, also used as the disk label
    pub pv_name: String,
    pub capacity_bytes: u64,
    pub access_modes: Vec<String>,
    /// Storage class parameters
    pub parameters: BTreeMap<String, String>,
    pub reclaim_policy: Option<String>,
    pub storage_class_name: Option<String>,
    pub mount_options: Vec<String>,
    pub claim_ref: Option<ObjectReference>,
}

// =============================================================================
// Provisioner
// =============================================================================

/// Creates and deletes iSCSI volumes backed by array virtual disks
pub struct IscsiProvisioner {
    backend: SanBackendRef,
    identity: String,
    provisioner_name: String,
    metrics: Option<Arc<ProvisionerMetrics>>,
}

impl IscsiProvisioner {
    pub fn new(
        backend: SanBackendRef,
        identity: impl Into<String>,
        provisioner_name: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            identity: identity.into(),
            provisioner_name: provisioner_name.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ProvisionerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn provisioner_name(&self) -> &str {
        &self.provisioner_name
    }

    /// Whether this provisioner created the volume. The identity annotation
    /// only records which instance did; any instance may delete it.
    pub fn owns(&self, volume: &PersistentVolume) -> bool {
        volume
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANN_PROVISIONED_BY))
            == Some(&self.provisioner_name)
    }

    /// Create the disk for a volume request and describe it
    #[instrument(skip(self, options), fields(pv = %options.pv_name))]
    pub async fn provision(&self, options: &VolumeOptions) -> Result<PersistentVolume> {
        let result = self.try_provision(options).await;
        self.record("provision", &result);
        result
    }

    async fn try_provision(&self, options: &VolumeOptions) -> Result<PersistentVolume> {
        if options.pv_name.is_empty() {
            return Err(Error::Validation("volume name is empty".to_string()));
        }
        validate_access_modes(&options.access_modes)?;
        let parameters = IscsiParameters::from_map(&options.parameters);
        parameters.validate()?;

        info!(
            capacity_bytes = options.capacity_bytes,
            "New provision request received"
        );
        let created = self
            .backend
            .create_volume(&options.pv_name, options.capacity_bytes)
            .await?;
        info!(disk = %created.disk, lun = created.lun, "Volume provisioned");

        Ok(self.build_volume(options, &parameters))
    }

    fn build_volume(&self, options: &VolumeOptions, parameters: &IscsiParameters) -> PersistentVolume {
        let annotations = BTreeMap::from([
            (ANN_IDENTITY.to_string(), self.identity.clone()),
            (ANN_PROVISIONED_BY.to_string(), self.provisioner_name.clone()),
        ]);
        let capacity = BTreeMap::from([(
            "storage".to_string(),
            Quantity(options.capacity_bytes.to_string()),
        )]);

        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.pv_name.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(options.access_modes.clone()),
                capacity: Some(capacity),
                persistent_volume_reclaim_policy: Some(
                    options
                        .reclaim_policy
                        .clone()
                        .unwrap_or_else(|| DEFAULT_RECLAIM_POLICY.to_string()),
                ),
                storage_class_name: options.storage_class_name.clone(),
                mount_options: Some(options.mount_options.clone()).filter(|m| !m.is_empty()),
                claim_ref: options.claim_ref.clone(),
                iscsi: Some(parameters.volume_source()),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Delete the disk behind a volume this instance provisioned
    #[instrument(skip(self, volume), fields(pv = volume.metadata.name.as_deref().unwrap_or_default()))]
    pub async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let result = self.try_delete(volume).await;
        self.record("delete", &result);
        result
    }

    async fn try_delete(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume
            .metadata
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::Validation("volume has no name".to_string()))?;

        if !self.owns(volume) {
            return Err(Error::Validation(format!(
                "volume {} was not provisioned by {}",
                name, self.provisioner_name
            )));
        }

        self.backend.delete_volume(name).await?;
        info!("Volume deleted");
        Ok(())
    }

    fn record<T>(&self, operation: &str, result: &Result<T>) {
        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() { "success" } else { "failure" };
            metrics.record_operation(operation, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::san::testing::FakeArray;
    use crate::san::{SanConnection, SmcliClient};
    use assert_matches::assert_matches;

    const PVC: &str = "pvc-9e22c1f7-0beb-11e8-b445-184f32e4b2a1";
    const GIB: u64 = 1_073_741_824;

    fn provisioner(array: Arc<FakeArray>) -> IscsiProvisioner {
        let client = SmcliClient::new(SanConnection::new("10.0.0.5", "k8s", "/opt/SMcli"), array);
        IscsiProvisioner::new(Arc::new(client), "node-a", "smcli.storage/iscsi")
    }

    fn options() -> VolumeOptions {
        VolumeOptions {
            pv_name: PVC.to_string(),
            capacity_bytes: GIB,
            access_modes: vec!["ReadWriteOnce".to_string()],
            parameters: BTreeMap::from([
                (params::TARGET_PORTAL.to_string(), "10.0.0.10:3260".to_string()),
                (params::PORTALS.to_string(), "10.0.0.11:3260,10.0.0.12:3260".to_string()),
                (params::IQN.to_string(), "iqn.1984-05.com.dell:powervault.md3200i".to_string()),
                (params::ISCSI_INTERFACE.to_string(), "default".to_string()),
            ]),
            storage_class_name: Some("san".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parameters_defaults() {
        let parameters = IscsiParameters::from_map(&BTreeMap::new());

        assert_eq!(parameters.fs_type, "ext4");
        assert!(!parameters.read_only);
        assert!(parameters.portals.is_empty());
        assert_eq!(parameters.iscsi_interface, None);
        assert_matches!(parameters.validate(), Err(Error::Validation(msg)) if msg.contains("targetPortal, iqn"));
    }

    #[test]
    fn test_readonly_spellings() {
        for (value, expected) in [("true", true), ("T", true), ("1", true), ("False", false), ("yes", false), ("", false)] {
            let map = BTreeMap::from([(params::READ_ONLY.to_string(), value.to_string())]);
            assert_eq!(IscsiParameters::from_map(&map).read_only, expected, "{}", value);
        }
    }

    #[test]
    fn test_access_mode_validation() {
        let ok = vec!["ReadWriteOnce".to_string(), "ReadOnlyMany".to_string()];
        assert_eq!(
            validate_access_modes(&ok).unwrap(),
            vec![AccessMode::ReadWriteOnce, AccessMode::ReadOnlyMany]
        );

        let rwx = vec!["ReadWriteOnce".to_string(), "ReadWriteMany".to_string()];
        assert_matches!(validate_access_modes(&rwx), Err(Error::Validation(msg)) if msg.contains("ReadWriteMany"));

        let unknown = vec!["Everything".to_string()];
        assert_matches!(validate_access_modes(&unknown), Err(Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_provision_builds_iscsi_volume() {
        let array = Arc::new(FakeArray::new().with_luns([0, 1, 3]));
        let provisioner = provisioner(array.clone());

        let pv = provisioner.provision(&options()).await.unwrap();

        assert_eq!(pv.metadata.name.as_deref(), Some(PVC));
        assert!(provisioner.owns(&pv));

        let spec = pv.spec.unwrap();
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Delete"));
        assert_eq!(spec.storage_class_name.as_deref(), Some("san"));
        assert_eq!(spec.capacity.unwrap()["storage"], Quantity("1073741824".to_string()));

        let iscsi = spec.iscsi.unwrap();
        assert_eq!(iscsi.target_portal, "10.0.0.10:3260");
        assert_eq!(
            iscsi.portals,
            Some(vec!["10.0.0.11:3260".to_string(), "10.0.0.12:3260".to_string()])
        );
        assert_eq!(iscsi.iscsi_interface.as_deref(), Some("default"));
        assert_eq!(iscsi.lun, 0);
        assert_eq!(iscsi.fs_type.as_deref(), Some("ext4"));
        assert_eq!(iscsi.read_only, Some(false));

        // The array got LUN 2, the descriptor still says 0
        assert_eq!(array.lun_of("pvc-9e22c1f7-0beb-11e8-b445-18"), Some(2));
    }

    #[tokio::test]
    async fn test_unsupported_access_mode_has_no_side_effect() {
        let array = Arc::new(FakeArray::new());
        let provisioner = provisioner(array.clone());

        let mut options = options();
        options.access_modes = vec!["ReadWriteMany".to_string()];

        assert_matches!(provisioner.provision(&options).await, Err(Error::Validation(_)));
        assert!(array.statements().is_empty());
    }

    #[tokio::test]
    async fn test_delete_requires_ownership() {
        let array = Arc::new(FakeArray::new());
        let provisioner = provisioner(array.clone());
        let pv = provisioner.provision(&options()).await.unwrap();

        let other = IscsiProvisioner::new(
            Arc::new(SmcliClient::new(
                SanConnection::new("10.0.0.5", "k8s", "/opt/SMcli"),
                array.clone(),
            )),
            "node-a",
            "other.storage/iscsi",
        );
        assert!(!other.owns(&pv));
        assert_matches!(other.delete(&pv).await, Err(Error::Validation(_)));
        assert!(array.has_disk("pvc-9e22c1f7-0beb-11e8-b445-18"));

        provisioner.delete(&pv).await.unwrap();
        assert!(!array.has_disk("pvc-9e22c1f7-0beb-11e8-b445-18"));

        // Deleting again is still a success
        provisioner.delete(&pv).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_by_another_instance() {
        let array = Arc::new(FakeArray::new());
        let provisioner = provisioner(array.clone());
        let pv = provisioner.provision(&options()).await.unwrap();

        // A replacement pod with a new identity still cleans up
        let replacement = IscsiProvisioner::new(
            Arc::new(SmcliClient::new(
                SanConnection::new("10.0.0.5", "k8s", "/opt/SMcli"),
                array.clone(),
            )),
            "node-b",
            "smcli.storage/iscsi",
        );
        assert!(replacement.owns(&pv));
        replacement.delete(&pv).await.unwrap();
        assert!(!array.has_disk("pvc-9e22c1f7-0beb-11e8-b445-18"));
    }

    #[tokio::test]
    async fn test_operations_are_counted() {
        let metrics = Arc::new(ProvisionerMetrics::new().unwrap());
        let provisioner = provisioner(Arc::new(FakeArray::new())).with_metrics(metrics.clone());

        provisioner.provision(&options()).await.unwrap();
        let mut zero = options();
        zero.capacity_bytes = 0;
        assert!(provisioner.provision(&zero).await.is_err());

        assert_eq!(metrics.operations.with_label_values(&["provision", "success"]).get(), 1);
        assert_eq!(metrics.operations.with_label_values(&["provision", "failure"]).get(), 1);
    }
}
