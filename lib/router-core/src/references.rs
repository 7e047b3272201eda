//! Back-references from RouterInstances to the IngressRules they serve
//!
//! Each IngressRule registers itself in the `ingressReferences` status list
//! of the RouterInstance of its ingress class. A finalizer guards deletion
//! so the reference is removed before the object disappears. The state is
//! derived from the stored object only (finalizer + deletion timestamp), so
//! it survives controller restarts.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use router_api::v1alpha1::IngressReference;
use router_api::{IngressRule, RouterInstance};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::generator::ChangeNotifier;
use crate::store::ResourceStore;

/// Deletion guard placed on every registered IngressRule
pub const INGRESS_FINALIZER: &str = "router.sipingress.io/ingress-references";

/// Whether the store has requested deletion of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    PendingDeletion,
}

impl Lifecycle {
    pub fn of(ingress: &IngressRule) -> Self {
        if ingress.metadata.deletion_timestamp.is_some() {
            Lifecycle::PendingDeletion
        } else {
            Lifecycle::Active
        }
    }
}

/// Registration state of one IngressRule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceState {
    /// No guard, not referenced (or released for deletion)
    Absent,
    /// Guard attached, reference not yet confirmed
    Registering,
    /// Guard attached and referenced by its RouterInstance
    Registered,
    /// Deletion requested while the guard is still attached
    Finalizing,
}

impl ReferenceState {
    /// State as far as it can be read from the IngressRule alone
    pub fn observe(ingress: &IngressRule) -> Self {
        match (Lifecycle::of(ingress), has_finalizer(ingress)) {
            (Lifecycle::Active, false) => ReferenceState::Absent,
            (Lifecycle::Active, true) => ReferenceState::Registering,
            (Lifecycle::PendingDeletion, true) => ReferenceState::Finalizing,
            (Lifecycle::PendingDeletion, false) => ReferenceState::Absent,
        }
    }
}

pub fn has_finalizer(ingress: &IngressRule) -> bool {
    ingress
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == INGRESS_FINALIZER))
}

/// Index of the reference to `namespace/name`
pub fn find_reference(references: &[IngressReference], namespace: &str, name: &str) -> Option<usize> {
    references
        .iter()
        .position(|r| r.namespace == namespace && r.name == name)
}

/// Refresh the reconciliation time of an existing reference or append a new
/// one. Returns `true` when appended.
pub fn upsert_reference(
    references: &mut Vec<IngressReference>,
    namespace: &str,
    name: &str,
    reconciliation_time: String,
) -> bool {
    match find_reference(references, namespace, name) {
        Some(index) => {
            references[index].reconciliation_time = Some(reconciliation_time);
            false
        }
        None => {
            references.push(IngressReference {
                namespace: namespace.to_string(),
                name: name.to_string(),
                reconciliation_time: Some(reconciliation_time),
            });
            true
        }
    }
}

/// Remove the reference to `namespace/name`, keeping the order of the rest
pub fn remove_reference(
    references: &mut Vec<IngressReference>,
    namespace: &str,
    name: &str,
) -> Option<IngressReference> {
    find_reference(references, namespace, name).map(|index| references.remove(index))
}

/// First RouterInstance serving `class`, in store order
pub fn find_router_instance<'a>(instances: &'a [RouterInstance], class: &str) -> Option<&'a RouterInstance> {
    let mut matching = instances
        .iter()
        .filter(|instance| instance.spec.ingress_class_name == class);
    let first = matching.next();
    if let Some(other) = matching.next() {
        warn!(
            ingress_class = class,
            chosen = %first.map(RouterInstance::key).unwrap_or_default(),
            ignored = %other.key(),
            "Several RouterInstances serve the same ingress class, using the first one"
        );
    }
    first
}

pub struct ReferenceReconciler<S> {
    store: Arc<S>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl<S: ResourceStore> ReferenceReconciler<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Drive one IngressRule towards its desired registration state.
    ///
    /// The generator is notified after every transition, failed ones
    /// included: the IngressRule itself changed, and the routing data must
    /// follow even when its reference could not be recorded.
    pub async fn reconcile(&self, ingress: &IngressRule) -> Result<ReferenceState> {
        let result = match ReferenceState::observe(ingress) {
            ReferenceState::Finalizing => self.finalize(ingress).await,
            ReferenceState::Absent if Lifecycle::of(ingress) == Lifecycle::PendingDeletion => {
                Ok(ReferenceState::Absent)
            }
            _ => self.register(ingress).await,
        };
        self.notifier.notify_changed();
        result
    }

    async fn register(&self, ingress: &IngressRule) -> Result<ReferenceState> {
        let (namespace, name) = identity(ingress)?;

        let guarded;
        let ingress = if has_finalizer(ingress) {
            ingress
        } else {
            let mut updated = ingress.clone();
            updated
                .metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(INGRESS_FINALIZER.to_string());
            guarded = self.store.replace_ingress_rule(&updated).await?;
            debug!(ingress = %ingress.owner(), "Deletion guard attached");
            &guarded
        };

        let instances = self.store.list_router_instances().await?;
        let class = &ingress.spec.ingress_class_name;
        let owner = find_router_instance(&instances, class);
        let owner_key = owner.map(RouterInstance::key);

        // A class change leaves a stale reference on the previous instance,
        // also when the new class has no instance yet.
        for other in instances.iter().filter(|i| Some(i.key()) != owner_key) {
            if self.unregister(other, namespace, name).await? {
                info!(
                    ingress = %ingress.owner(),
                    instance = %other.key(),
                    "Stale ingress reference removed"
                );
            }
        }

        let owner = owner.ok_or_else(|| {
            CoreError::NotFound(format!("no RouterInstance with ingressClassName '{}'", class))
        })?;

        let mut status = owner.status.clone().unwrap_or_default();
        let added = upsert_reference(&mut status.ingress_references, namespace, name, now());
        self.write_status(owner, status).await?;

        if added {
            info!(ingress = %ingress.owner(), instance = %owner.key(), "Ingress registered");
        } else {
            debug!(ingress = %ingress.owner(), instance = %owner.key(), "Ingress registration refreshed");
        }
        Ok(ReferenceState::Registered)
    }

    async fn finalize(&self, ingress: &IngressRule) -> Result<ReferenceState> {
        let (namespace, name) = identity(ingress)?;

        let instances = self.store.list_router_instances().await?;
        let mut removed = false;
        for instance in &instances {
            if self.unregister(instance, namespace, name).await? {
                info!(
                    ingress = %ingress.owner(),
                    instance = %instance.key(),
                    "Ingress unregistered"
                );
                removed = true;
            }
        }
        let class = &ingress.spec.ingress_class_name;
        if !removed && find_router_instance(&instances, class).is_none() {
            warn!(
                ingress = %ingress.owner(),
                "No RouterInstance left for ingress class '{}', releasing deletion guard",
                class
            );
        }

        let mut released = ingress.clone();
        if let Some(finalizers) = released.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != INGRESS_FINALIZER);
        }
        self.store.replace_ingress_rule(&released).await?;
        debug!(ingress = %ingress.owner(), "Deletion guard removed");
        Ok(ReferenceState::Absent)
    }

    /// Drop the reference to `namespace/name` from `instance`; returns
    /// whether one was stored
    async fn unregister(
        &self,
        instance: &RouterInstance,
        namespace: &str,
        name: &str,
    ) -> Result<bool> {
        let mut status = instance.status.clone().unwrap_or_default();
        if remove_reference(&mut status.ingress_references, namespace, name).is_none() {
            return Ok(false);
        }
        self.write_status(instance, status).await?;
        Ok(true)
    }

    async fn write_status(
        &self,
        instance: &RouterInstance,
        status: router_api::v1alpha1::RouterInstanceStatus,
    ) -> Result<()> {
        let mut updated = instance.clone();
        updated.status = Some(status);
        self.store.replace_router_instance_status(&updated).await?;
        Ok(())
    }
}

fn identity(ingress: &IngressRule) -> Result<(&str, &str)> {
    match (&ingress.metadata.namespace, &ingress.metadata.name) {
        (Some(namespace), Some(name)) => Ok((namespace, name)),
        _ => Err(CoreError::InvalidResource(format!(
            "IngressRule {} lacks name or namespace",
            ingress.owner()
        ))),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use router_api::v1alpha1::{IngressRuleSpec, RouterInstanceSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    impl ChangeNotifier for CountingNotifier {
        fn notify_changed(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn reference(name: &str) -> IngressReference {
        IngressReference {
            namespace: "default".to_string(),
            name: name.to_string(),
            reconciliation_time: None,
        }
    }

    fn names(references: &[IngressReference]) -> Vec<&str> {
        references.iter().map(|r| r.name.as_str()).collect()
    }

    fn router(name: &str, class: &str) -> RouterInstance {
        let mut instance = RouterInstance::new(
            name,
            RouterInstanceSpec {
                ingress_class_name: class.to_string(),
                ..Default::default()
            },
        );
        instance.metadata.namespace = Some("sip".to_string());
        instance
    }

    fn ingress(name: &str, class: &str) -> IngressRule {
        let mut ingress = IngressRule::new(
            name,
            IngressRuleSpec {
                ingress_class_name: class.to_string(),
                rules: vec![],
            },
        );
        ingress.metadata.namespace = Some("ns1".to_string());
        ingress
    }

    fn setup() -> (Arc<InMemoryStore>, Arc<CountingNotifier>, ReferenceReconciler<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let reconciler = ReferenceReconciler::new(store.clone(), notifier.clone());
        (store, notifier, reconciler)
    }

    fn references_of(store: &InMemoryStore, name: &str) -> Vec<IngressReference> {
        store
            .router_instance("sip", name)
            .and_then(|r| r.status)
            .map(|s| s.ingress_references)
            .unwrap_or_default()
    }

    #[test]
    fn test_remove_first_middle_last() {
        for (remove, expected) in [
            ("name1", vec!["name2", "name3", "name4"]),
            ("name2", vec!["name1", "name3", "name4"]),
            ("name4", vec!["name1", "name2", "name3"]),
        ] {
            let mut refs: Vec<_> = ["name1", "name2", "name3", "name4"]
                .into_iter()
                .map(reference)
                .collect();
            let removed = remove_reference(&mut refs, "default", remove).unwrap();
            assert_eq!(removed.name, remove);
            assert_eq!(names(&refs), expected);
        }
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut refs = vec![reference("name1")];
        assert!(remove_reference(&mut refs, "other", "name1").is_none());
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_upsert_deduplicates_and_refreshes() {
        let mut refs = vec![reference("a"), reference("b")];

        assert!(!upsert_reference(&mut refs, "default", "a", "t1".to_string()));
        assert!(upsert_reference(&mut refs, "default", "c", "t2".to_string()));
        assert!(!upsert_reference(&mut refs, "default", "c", "t3".to_string()));

        assert_eq!(names(&refs), vec!["a", "b", "c"]);
        assert_eq!(refs[0].reconciliation_time.as_deref(), Some("t1"));
        assert_eq!(refs[2].reconciliation_time.as_deref(), Some("t3"));
    }

    #[test]
    fn test_observe_states() {
        let mut i = ingress("i1", "sip-a");
        assert_eq!(ReferenceState::observe(&i), ReferenceState::Absent);

        i.metadata.finalizers = Some(vec![INGRESS_FINALIZER.to_string()]);
        assert_eq!(ReferenceState::observe(&i), ReferenceState::Registering);

        i.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()));
        assert_eq!(ReferenceState::observe(&i), ReferenceState::Finalizing);
    }

    #[tokio::test]
    async fn test_register_adds_guard_and_reference() {
        let (store, notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        let i1 = store.apply_ingress_rule(ingress("i1", "sip-a"));

        let state = reconciler.reconcile(&i1).await.unwrap();

        assert_eq!(state, ReferenceState::Registered);
        assert!(has_finalizer(&store.ingress_rule("ns1", "i1").unwrap()));
        let refs = references_of(&store, "r1");
        assert_eq!(refs.len(), 1);
        assert_eq!((refs[0].namespace.as_str(), refs[0].name.as_str()), ("ns1", "i1"));
        assert!(refs[0].reconciliation_time.is_some());
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registering_twice_keeps_one_entry() {
        let (store, _notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        store.apply_ingress_rule(ingress("i1", "sip-a"));

        for _ in 0..2 {
            let current = store.ingress_rule("ns1", "i1").unwrap();
            reconciler.reconcile(&current).await.unwrap();
        }

        assert_eq!(references_of(&store, "r1").len(), 1);
    }

    #[tokio::test]
    async fn test_no_matching_instance_is_not_found() {
        let (store, notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        let i1 = store.apply_ingress_rule(ingress("i1", "sip-missing"));

        let err = reconciler.reconcile(&i1).await.unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deletion_removes_only_that_reference() {
        let (store, _notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        for name in ["i1", "i2", "i3"] {
            let created = store.apply_ingress_rule(ingress(name, "sip-a"));
            reconciler.reconcile(&created).await.unwrap();
        }

        let marked = store.delete_ingress_rule("ns1", "i2").unwrap();
        let state = reconciler.reconcile(&marked).await.unwrap();

        assert_eq!(state, ReferenceState::Absent);
        assert_eq!(names(&references_of(&store, "r1")), vec!["i1", "i3"]);
        assert!(store.ingress_rule("ns1", "i2").is_none());
    }

    #[tokio::test]
    async fn test_deletion_without_instance_releases_guard() {
        let (store, _notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        let i1 = store.apply_ingress_rule(ingress("i1", "sip-a"));
        reconciler.reconcile(&i1).await.unwrap();

        store.delete_router_instance("sip", "r1");
        let marked = store.delete_ingress_rule("ns1", "i1").unwrap();
        reconciler.reconcile(&marked).await.unwrap();

        assert!(store.ingress_rule("ns1", "i1").is_none());
    }

    #[tokio::test]
    async fn test_class_change_moves_reference() {
        let (store, _notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        store.apply_router_instance(router("r2", "sip-b"));
        let i1 = store.apply_ingress_rule(ingress("i1", "sip-a"));
        reconciler.reconcile(&i1).await.unwrap();

        let moved = store.apply_ingress_rule(ingress("i1", "sip-b"));
        reconciler.reconcile(&moved).await.unwrap();

        assert!(references_of(&store, "r1").is_empty());
        assert_eq!(names(&references_of(&store, "r2")), vec!["i1"]);
    }

    #[tokio::test]
    async fn test_class_change_to_unserved_class_drops_old_reference() {
        let (store, _notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        let i1 = store.apply_ingress_rule(ingress("i1", "sip-a"));
        reconciler.reconcile(&i1).await.unwrap();

        let moved = store.apply_ingress_rule(ingress("i1", "sip-missing"));
        let err = reconciler.reconcile(&moved).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(references_of(&store, "r1").is_empty());
    }

    #[tokio::test]
    async fn test_deletion_after_class_change_clears_every_instance() {
        let (store, _notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        store.apply_router_instance(router("r2", "sip-b"));
        let i1 = store.apply_ingress_rule(ingress("i1", "sip-a"));
        reconciler.reconcile(&i1).await.unwrap();

        // class edited and deleted before the move was reconciled
        store.apply_ingress_rule(ingress("i1", "sip-b"));
        let marked = store.delete_ingress_rule("ns1", "i1").unwrap();
        reconciler.reconcile(&marked).await.unwrap();

        assert!(references_of(&store, "r1").is_empty());
        assert!(store.ingress_rule("ns1", "i1").is_none());
    }

    #[tokio::test]
    async fn test_stale_ingress_conflicts() {
        let (store, _notifier, reconciler) = setup();
        store.apply_router_instance(router("r1", "sip-a"));
        let stale = store.apply_ingress_rule(ingress("i1", "sip-a"));
        store.apply_ingress_rule(ingress("i1", "sip-a"));

        let err = reconciler.reconcile(&stale).await.unwrap_err();
        assert!(matches!(err, CoreError::Store(crate::error::StoreError::Conflict { .. })));
    }
}
