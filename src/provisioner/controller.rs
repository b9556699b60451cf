//! Claim Controller
//!
//! Watches PersistentVolumeClaims and PersistentVolumes cluster-wide.
//! Pending claims of a storage class served by this provisioner get a disk
//! and a bound volume; released volumes this provisioner created are removed
//! from the array and from the API.

use super::iscsi::{IscsiProvisioner, VolumeOptions};
use super::quantity::parse_quantity;
use crate::error::{Error, ErrorAction, Result};
use backoff::ExponentialBackoff;
use dashmap::DashSet;
use futures::{stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Legacy annotation carrying the storage class of a claim
const ANN_STORAGE_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

// =============================================================================
// Configuration
// =============================================================================

/// Retry settings for provisioning and deleting
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// First retry delay
    pub initial_retry_interval: Duration,
    /// Longest delay between two retries
    pub max_retry_interval: Duration,
    /// Give up on a claim or volume after this long
    pub max_retry_elapsed: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            initial_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(60),
            max_retry_elapsed: Duration::from_secs(5 * 60),
        }
    }
}

impl ControllerConfig {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_retry_interval,
            max_interval: self.max_retry_interval,
            max_elapsed_time: Some(self.max_retry_elapsed),
            ..Default::default()
        }
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// Storage class a claim asks for
pub fn claim_storage_class(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.as_deref())
        .or_else(|| {
            claim
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANN_STORAGE_CLASS))
                .map(String::as_str)
        })
        .filter(|class| !class.is_empty())
}

/// A claim waits for a volume when it is pending, not bound to a volume
/// and not restricted by a label selector
pub fn claim_is_unbound(claim: &PersistentVolumeClaim) -> bool {
    if claim.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let pending = claim
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map_or(true, |phase| phase == "Pending");
    let Some(spec) = claim.spec.as_ref() else {
        return false;
    };
    let bound = spec.volume_name.as_deref().is_some_and(|v| !v.is_empty());
    pending && !bound && spec.selector.is_none()
}

/// Name of the volume provisioned for a claim
pub fn volume_name_for(claim: &PersistentVolumeClaim) -> Option<String> {
    claim.metadata.uid.as_ref().map(|uid| format!("pvc-{}", uid))
}

/// Build the provisioning request for a claim of the given class
pub fn volume_options_for(claim: &PersistentVolumeClaim, class: &StorageClass) -> Result<VolumeOptions> {
    let pv_name = volume_name_for(claim)
        .ok_or_else(|| Error::Validation(format!("claim {} has no uid", claim.name_any())))?;
    let spec = claim
        .spec
        .as_ref()
        .ok_or_else(|| Error::Validation(format!("claim {} has no spec", claim.name_any())))?;

    let requested = spec
        .resources
        .as_ref()
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .ok_or_else(|| {
            Error::Validation(format!("claim {} requests no storage", claim.name_any()))
        })?;

    Ok(VolumeOptions {
        pv_name,
        capacity_bytes: parse_quantity(&requested.0)?,
        access_modes: spec.access_modes.clone().unwrap_or_default(),
        parameters: class.parameters.clone().unwrap_or_default(),
        reclaim_policy: class.reclaim_policy.clone(),
        storage_class_name: class.metadata.name.clone(),
        mount_options: class.mount_options.clone().unwrap_or_default(),
        claim_ref: Some(claim_reference(claim)),
    })
}

fn claim_reference(claim: &PersistentVolumeClaim) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        namespace: claim.metadata.namespace.clone(),
        name: claim.metadata.name.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
        ..Default::default()
    }
}

/// A volume is ready for removal when it is released, its policy is
/// Delete, and this provisioner created it
pub fn volume_needs_deletion(volume: &PersistentVolume, provisioner: &IscsiProvisioner) -> bool {
    let released = volume
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Released");
    let reclaim_delete = volume
        .spec
        .as_ref()
        .and_then(|spec| spec.persistent_volume_reclaim_policy.as_deref())
        == Some("Delete");
    released && reclaim_delete && volume.metadata.deletion_timestamp.is_none() && provisioner.owns(volume)
}

fn is_status(err: &Error, code: u16) -> bool {
    matches!(err, Error::Kube(kube::Error::Api(response)) if response.code == code)
}

/// Map an error to a backoff decision following its [`ErrorAction`]
fn classify(err: Error) -> backoff::Error<Error> {
    match err.action() {
        ErrorAction::RequeueWithBackoff => backoff::Error::transient(err),
        ErrorAction::RequeueAfter(delay) => backoff::Error::retry_after(err, delay),
        ErrorAction::NoRequeue => backoff::Error::permanent(err),
    }
}

// =============================================================================
// Controller
// =============================================================================

enum Watched {
    Claim(PersistentVolumeClaim),
    Volume(PersistentVolume),
}

/// Watch loop driving an [`IscsiProvisioner`]
#[derive(Clone)]
pub struct ClaimController {
    client: Client,
    provisioner: Arc<IscsiProvisioner>,
    config: ControllerConfig,
    /// Claims and volumes currently being handled, by volume name
    in_flight: Arc<DashSet<String>>,
    cancel: CancellationToken,
}

impl ClaimController {
    pub fn new(
        client: Client,
        provisioner: Arc<IscsiProvisioner>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            provisioner,
            config,
            in_flight: Arc::new(DashSet::new()),
            cancel,
        }
    }

    /// Watch claims and volumes until cancelled
    pub async fn run(self) -> Result<()> {
        info!(
            provisioner = %self.provisioner.provisioner_name(),
            identity = %self.provisioner.identity(),
            "Claim controller started"
        );

        let claims = watcher(
            Api::<PersistentVolumeClaim>::all(self.client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .applied_objects()
        .map_ok(Watched::Claim);

        let volumes = watcher(
            Api::<PersistentVolume>::all(self.client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .applied_objects()
        .map_ok(Watched::Volume);

        let mut events = stream::select(claims.boxed(), volumes.boxed());

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(Watched::Claim(claim))) => self.on_claim(claim),
                    Some(Ok(Watched::Volume(volume))) => self.on_volume(volume),
                    Some(Err(e)) => warn!("Watch error: {}", e),
                    None => break,
                },
            }
        }

        info!("Claim controller stopped");
        Ok(())
    }

    fn on_claim(&self, claim: PersistentVolumeClaim) {
        if !claim_is_unbound(&claim) || claim_storage_class(&claim).is_none() {
            return;
        }
        let Some(pv_name) = volume_name_for(&claim) else {
            return;
        };
        let controller = self.clone();
        self.spawn_once(pv_name.clone(), async move {
            if let Err(e) = controller.provision_claim(&claim, &pv_name).await {
                error!(
                    claim = %claim.name_any(),
                    namespace = %claim.namespace().unwrap_or_default(),
                    pv = %pv_name,
                    "Failed to provision volume: {}",
                    e
                );
            }
        });
    }

    fn on_volume(&self, volume: PersistentVolume) {
        if !volume_needs_deletion(&volume, &self.provisioner) {
            return;
        }
        let name = volume.name_any();
        let controller = self.clone();
        self.spawn_once(name.clone(), async move {
            if let Err(e) = controller.delete_volume(&volume).await {
                error!(pv = %name, "Failed to delete volume: {}", e);
            }
        });
    }

    /// Run `task` unless one is already running for `key`
    fn spawn_once<F>(&self, key: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.in_flight.insert(key.clone()) {
            debug!(key = %key, "Already in progress");
            return;
        }
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            task.await;
            in_flight.remove(&key);
        });
    }

    async fn provision_claim(&self, claim: &PersistentVolumeClaim, pv_name: &str) -> Result<()> {
        let Some(class_name) = claim_storage_class(claim) else {
            return Ok(());
        };
        let classes = Api::<StorageClass>::all(self.client.clone());
        let Some(class) = classes.get_opt(class_name).await? else {
            debug!(class = %class_name, "Storage class not found");
            return Ok(());
        };
        if class.provisioner != self.provisioner.provisioner_name() {
            return Ok(());
        }

        let volumes = Api::<PersistentVolume>::all(self.client.clone());
        if volumes.get_opt(pv_name).await?.is_some() {
            debug!(pv = %pv_name, "Volume already exists");
            return Ok(());
        }

        let options = volume_options_for(claim, &class)?;
        info!(
            claim = %claim.name_any(),
            pv = %pv_name,
            capacity_bytes = options.capacity_bytes,
            "Provisioning volume for claim"
        );

        let provisioner = &self.provisioner;
        let options = &options;
        let volume = self
            .retry(|| async move { provisioner.provision(options).await.map_err(classify) })
            .await?;

        match volumes.create(&PostParams::default(), &volume).await {
            Ok(_) => {
                info!(pv = %pv_name, "Volume created");
                Ok(())
            }
            Err(e) => {
                let e = Error::from(e);
                if is_status(&e, 409) {
                    info!(pv = %pv_name, "Volume already created");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn delete_volume(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.name_any();
        info!(pv = %name, "Deleting released volume");

        let provisioner = &self.provisioner;
        self.retry(|| async move { provisioner.delete(volume).await.map_err(classify) })
            .await?;

        let volumes = Api::<PersistentVolume>::all(self.client.clone());
        match volumes.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = Error::from(e);
                if is_status(&e, 404) {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Retry `operation` with backoff, giving up when cancelled
    async fn retry<T, Fut, Op>(&self, operation: Op) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, backoff::Error<Error>>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = backoff::future::retry(self.config.backoff(), operation) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{CreatedVolume, DiskLabel, RollbackOutcome, SanBackend};
    use crate::provisioner::iscsi::{ANN_IDENTITY, ANN_PROVISIONED_BY};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeSpec,
        PersistentVolumeStatus,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct NullBackend;

    #[async_trait]
    impl SanBackend for NullBackend {
        async fn create_volume(&self, name: &str, _capacity_bytes: u64) -> Result<CreatedVolume> {
            Ok(CreatedVolume {
                disk: DiskLabel::new(name),
                lun: 0,
                already_existed: false,
            })
        }

        async fn delete_volume(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn defrag(&self) -> Result<()> {
            Ok(())
        }
    }

    fn provisioner() -> IscsiProvisioner {
        IscsiProvisioner::new(Arc::new(NullBackend), "node-a", "smcli.storage/iscsi")
    }

    fn claim() -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "name": "data",
                "namespace": "apps",
                "uid": "9e22c1f7-0beb-11e8-b445-184f32e4b2a1",
                "resourceVersion": "42"
            },
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "storageClassName": "san",
                "resources": { "requests": { "storage": "1Gi" } }
            },
            "status": { "phase": "Pending" }
        }))
        .unwrap()
    }

    fn storage_class() -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some("san".to_string()),
                ..Default::default()
            },
            provisioner: "smcli.storage/iscsi".to_string(),
            parameters: Some(BTreeMap::from([(
                "targetPortal".to_string(),
                "10.0.0.10:3260".to_string(),
            )])),
            reclaim_policy: Some("Retain".to_string()),
            mount_options: Some(vec!["noatime".to_string()]),
            ..Default::default()
        }
    }

    fn released_volume(annotations: BTreeMap<String, String>, policy: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pvc-9e22c1f7".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(policy.to_string()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some("Released".to_string()),
                ..Default::default()
            }),
        }
    }

    fn owned_annotations() -> BTreeMap<String, String> {
        BTreeMap::from([
            (ANN_IDENTITY.to_string(), "node-a".to_string()),
            (ANN_PROVISIONED_BY.to_string(), "smcli.storage/iscsi".to_string()),
        ])
    }

    #[test]
    fn test_pending_claim_is_unbound() {
        let claim = claim();
        assert!(claim_is_unbound(&claim));
        assert_eq!(claim_storage_class(&claim), Some("san"));
        assert_eq!(
            volume_name_for(&claim).as_deref(),
            Some("pvc-9e22c1f7-0beb-11e8-b445-184f32e4b2a1")
        );
    }

    #[test]
    fn test_bound_or_selective_claims_are_skipped() {
        let mut bound = claim();
        bound.spec.as_mut().unwrap().volume_name = Some("pv-1".to_string());
        assert!(!claim_is_unbound(&bound));

        let mut selective = claim();
        selective.spec.as_mut().unwrap().selector = Some(LabelSelector::default());
        assert!(!claim_is_unbound(&selective));

        let mut settled = claim();
        settled.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        });
        assert!(!claim_is_unbound(&settled));
    }

    #[test]
    fn test_legacy_storage_class_annotation() {
        let mut claim = claim();
        claim.spec = Some(PersistentVolumeClaimSpec::default());
        claim.metadata.annotations = Some(BTreeMap::from([(
            ANN_STORAGE_CLASS.to_string(),
            "legacy".to_string(),
        )]));
        assert_eq!(claim_storage_class(&claim), Some("legacy"));
    }

    #[test]
    fn test_volume_options_from_claim_and_class() {
        let options = volume_options_for(&claim(), &storage_class()).unwrap();

        assert_eq!(options.pv_name, "pvc-9e22c1f7-0beb-11e8-b445-184f32e4b2a1");
        assert_eq!(options.capacity_bytes, 1_073_741_824);
        assert_eq!(options.access_modes, vec!["ReadWriteOnce"]);
        assert_eq!(options.reclaim_policy.as_deref(), Some("Retain"));
        assert_eq!(options.storage_class_name.as_deref(), Some("san"));
        assert_eq!(options.mount_options, vec!["noatime"]);
        assert_eq!(options.parameters["targetPortal"], "10.0.0.10:3260");

        let claim_ref = options.claim_ref.unwrap();
        assert_eq!(claim_ref.namespace.as_deref(), Some("apps"));
        assert_eq!(claim_ref.name.as_deref(), Some("data"));
        assert_eq!(claim_ref.kind.as_deref(), Some("PersistentVolumeClaim"));
    }

    #[test]
    fn test_bad_quantity_fails_options() {
        let mut claim = claim();
        let resources = claim.spec.as_mut().unwrap().resources.as_mut().unwrap();
        resources
            .requests
            .as_mut()
            .unwrap()
            .insert("storage".to_string(), Quantity("lots".to_string()));

        assert_matches!(
            volume_options_for(&claim, &storage_class()),
            Err(Error::CapacityParse(_))
        );
    }

    #[test]
    fn test_released_owned_volume_needs_deletion() {
        let provisioner = provisioner();

        assert!(volume_needs_deletion(
            &released_volume(owned_annotations(), "Delete"),
            &provisioner
        ));
        assert!(!volume_needs_deletion(
            &released_volume(owned_annotations(), "Retain"),
            &provisioner
        ));

        let mut other_instance = owned_annotations();
        other_instance.insert(ANN_IDENTITY.to_string(), "node-b".to_string());
        assert!(volume_needs_deletion(&released_volume(other_instance, "Delete"), &provisioner));

        let mut foreign = owned_annotations();
        foreign.insert(ANN_PROVISIONED_BY.to_string(), "other.storage/iscsi".to_string());
        assert!(!volume_needs_deletion(&released_volume(foreign, "Delete"), &provisioner));

        let mut bound = released_volume(owned_annotations(), "Delete");
        bound.status.as_mut().unwrap().phase = Some("Bound".to_string());
        assert!(!volume_needs_deletion(&bound, &provisioner));
    }

    #[test]
    fn test_errors_map_to_backoff_decisions() {
        assert_matches!(
            classify(Error::VendorFailure {
                statement: "x".to_string(),
                exit_code: 1,
                message: "busy".to_string(),
            }),
            backoff::Error::Transient { retry_after: None, .. }
        );
        assert_matches!(
            classify(Error::AllocationExhausted {
                group: "k8s".to_string(),
                rollback: RollbackOutcome::Deleted { attempts: 1 },
            }),
            backoff::Error::Transient { retry_after: Some(d), .. } if d == Duration::from_secs(60)
        );
        assert_matches!(
            classify(Error::Validation("bad".to_string())),
            backoff::Error::Permanent(_)
        );
    }
}
