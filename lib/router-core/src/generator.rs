//! The generator: single writer of every derived artifact
//!
//! Reconcilers never write routing data or rendered configuration
//! themselves. They call [`ChangeNotifier::notify_changed`], and the
//! generator, after the debounce quiet period, re-reads the whole resource
//! graph and publishes only what changed. One writer means no two
//! reconcilers race each other on the same ConfigMap with stale reads.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use router_api::v1alpha1::{RouterCondition, RouterInstanceStatus};
use router_api::{IngressRule, RouterInstance};
use tracing::{debug, error, info, warn};

use crate::artifact::{
    annotation, config_name, new_artifact, routing_data_name, set_annotation,
    CONFIG_HASH_ANNOTATION, ROUTING_DATA_HASH_ANNOTATION, ROUTING_DATA_KEY,
};
use crate::config::GeneratorConfig;
use crate::debounce::Debouncer;
use crate::error::{CoreError, Result, StoreError};
use crate::hash::hash_string_map;
use crate::retry::retry_with_count;
use crate::routing_data::{routing_data_for, RoutingData};
use crate::store::ResourceStore;
use crate::template::render_all;

/// Condition: the template source of the instance could be read
pub const CONDITION_TEMPLATES_READ: &str = "TemplatesRead";
/// Condition: the last rendering of the templates succeeded
pub const CONDITION_TEMPLATES_RENDERED: &str = "TemplatesRendered";

/// Narrow handle given to reconcilers that need derived artifacts refreshed
pub trait ChangeNotifier: Send + Sync {
    fn notify_changed(&self);
}

/// What one reconcile pass did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    /// RouterInstances visited
    pub instances: usize,
    /// `namespace/name` of instances whose routing-data artifact was written
    pub routing_data_written: Vec<String>,
    /// `namespace/name` of instances whose rendered config was written
    pub configs_written: Vec<String>,
}

impl PassReport {
    /// Nothing was written downstream
    pub fn is_noop(&self) -> bool {
        self.routing_data_written.is_empty() && self.configs_written.is_empty()
    }
}

pub struct Generator<S> {
    pass: Arc<ReconcilePass<S>>,
    debouncer: Debouncer,
}

impl<S: ResourceStore + 'static> Generator<S> {
    /// Create the generator and its debounce worker. Must be called inside a
    /// tokio runtime.
    pub fn new(store: Arc<S>, config: GeneratorConfig) -> Self {
        let pass = Arc::new(ReconcilePass {
            store,
            max_attempts: config.max_attempts,
        });

        let debounced = pass.clone();
        let debouncer = Debouncer::new(config.debounce, move || {
            let pass = debounced.clone();
            async move {
                // Failures are logged by the pass and retried on the next trigger.
                let _ = pass.run_with_retry().await;
            }
        });

        Self { pass, debouncer }
    }

    /// Lifecycle hook: returns once `shutdown` resolves. A pass already
    /// running is not interrupted.
    pub async fn start<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            debounce = ?self.debouncer.quiet_period(),
            max_attempts = self.pass.max_attempts,
            "Starting generator"
        );
        shutdown.await;
        info!("Stopping generator");
    }

    /// One full pass with bounded retries, bypassing the debouncer
    pub async fn reconcile(&self) -> Result<PassReport> {
        self.pass.run_with_retry().await
    }
}

impl<S: ResourceStore + 'static> ChangeNotifier for Generator<S> {
    fn notify_changed(&self) {
        debug!("Generator notified of a change");
        self.debouncer.trigger();
    }
}

struct ReconcilePass<S> {
    store: Arc<S>,
    max_attempts: u32,
}

enum TemplateSource {
    Found(BTreeMap<String, String>),
    Missing { reason: &'static str, message: String },
}

impl<S: ResourceStore> ReconcilePass<S> {
    async fn run_with_retry(&self) -> Result<PassReport> {
        let result = retry_with_count(self.max_attempts, "Generator pass", || self.run()).await;
        match &result {
            Ok(report) => info!(
                instances = report.instances,
                routing_data_written = report.routing_data_written.len(),
                configs_written = report.configs_written.len(),
                "Generator finished"
            ),
            Err(e) => error!(
                attempts = self.max_attempts,
                "Generator pass abandoned until the next change: {}", e
            ),
        }
        result
    }

    /// One pass over the full resource graph. The first error aborts the
    /// remaining instances of the pass.
    async fn run(&self) -> Result<PassReport> {
        let mut instances = self.store.list_router_instances().await?;
        let ingresses = self.store.list_ingress_rules().await?;
        debug!(
            instances = instances.len(),
            ingresses = ingresses.len(),
            "Running generator pass"
        );

        instances.sort_by(|a, b| {
            (&a.metadata.name, &a.metadata.namespace)
                .cmp(&(&b.metadata.name, &b.metadata.namespace))
        });

        let mut report = PassReport::default();
        for instance in &instances {
            self.reconcile_instance(instance, &ingresses, &mut report).await?;
        }
        Ok(report)
    }

    async fn reconcile_instance(
        &self,
        instance: &RouterInstance,
        ingresses: &[IngressRule],
        report: &mut PassReport,
    ) -> Result<()> {
        let key = instance.key();
        let (namespace, name) = match (&instance.metadata.namespace, &instance.metadata.name) {
            (Some(namespace), Some(name)) => (namespace.as_str(), name.as_str()),
            _ => {
                return Err(CoreError::InvalidResource(format!(
                    "RouterInstance {} lacks name or namespace",
                    key
                )))
            }
        };
        report.instances += 1;

        let routing_data = routing_data_for(instance, ingresses);
        let routing_map =
            BTreeMap::from([(ROUTING_DATA_KEY.to_string(), routing_data.to_json()?)]);
        let routing_hash = hash_string_map(&routing_map);
        let status = instance.status.clone().unwrap_or_default();
        let mut regenerate = false;

        let existing = self.store.get_config_map(namespace, &routing_data_name(name)).await?;
        let stored_hash = existing
            .as_ref()
            .and_then(|cm| annotation(&cm.metadata, ROUTING_DATA_HASH_ANNOTATION));
        if stored_hash != Some(routing_hash.as_str()) {
            info!(
                instance = %key,
                ingress_class = %instance.spec.ingress_class_name,
                old_hash = stored_hash.unwrap_or("<none>"),
                new_hash = %routing_hash,
                "Routing data changed, updating {}", routing_data_name(name)
            );
            self.publish(
                instance,
                existing,
                routing_data_name(name),
                routing_map,
                ROUTING_DATA_HASH_ANNOTATION,
                &routing_hash,
            )
            .await?;
            report.routing_data_written.push(key.clone());
            regenerate = true;
        } else if status.router_data_hash.as_deref() != Some(routing_hash.as_str()) {
            // routing data was published but never rendered successfully
            regenerate = true;
        }

        let templates = match self.template_source(instance, namespace).await? {
            TemplateSource::Found(templates) => templates,
            TemplateSource::Missing { reason, message } => {
                warn!(instance = %key, "Skipping template rendering: {}", message);
                let mut status = status;
                let missing = condition(CONDITION_TEMPLATES_READ, "False", reason, Some(message));
                if status.set_condition(missing) {
                    self.write_status(instance, status).await?;
                }
                return Ok(());
            }
        };

        let templates_hash = hash_string_map(&templates);
        if status.templates_hash.as_deref() != Some(templates_hash.as_str()) {
            info!(
                instance = %key,
                old_hash = status.templates_hash.as_deref().unwrap_or("<none>"),
                new_hash = %templates_hash,
                "Templates changed"
            );
            regenerate = true;
        }

        if !regenerate {
            debug!(instance = %key, "Nothing has changed");
            return Ok(());
        }

        let published = self
            .render(instance, namespace, name, &status, &templates, &routing_data)
            .await?;

        let mut status = status;
        if published {
            report.configs_written.push(key.clone());
            status.configuration_generation += 1;
        }
        status.templates_hash = Some(templates_hash);
        status.router_data_hash = Some(routing_hash);
        status.set_condition(condition(CONDITION_TEMPLATES_READ, "True", "Found", None));
        status.set_condition(condition(CONDITION_TEMPLATES_RENDERED, "True", "Rendered", None));
        self.write_status(instance, status).await
    }

    /// Render the templates and publish the result when its content changed.
    ///
    /// Returns whether the rendered-config artifact was written.
    async fn render(
        &self,
        instance: &RouterInstance,
        namespace: &str,
        name: &str,
        status: &RouterInstanceStatus,
        templates: &BTreeMap<String, String>,
        routing_data: &RoutingData,
    ) -> Result<bool> {
        let rendered = match render_all(templates, routing_data) {
            Ok(rendered) => rendered,
            Err(errors) => {
                let mut status = status.clone();
                let failed = condition(
                    CONDITION_TEMPLATES_RENDERED,
                    "False",
                    "RenderError",
                    Some(errors.to_string()),
                );
                if status.set_condition(failed) {
                    if let Err(e) = self.write_status(instance, status).await {
                        warn!(instance = %instance.key(), "Unable to record render failure: {}", e);
                    }
                }
                return Err(errors.into());
            }
        };

        let config_hash = hash_string_map(&rendered);
        let existing = self.store.get_config_map(namespace, &config_name(name)).await?;
        let stored_hash = existing
            .as_ref()
            .and_then(|cm| annotation(&cm.metadata, CONFIG_HASH_ANNOTATION));

        if stored_hash == Some(config_hash.as_str()) {
            debug!(instance = %instance.key(), "Rendered configuration unchanged");
            return Ok(false);
        }

        info!(
            instance = %instance.key(),
            hash = %config_hash,
            "Publishing rendered configuration {}", config_name(name)
        );
        self.publish(
            instance,
            existing,
            config_name(name),
            rendered,
            CONFIG_HASH_ANNOTATION,
            &config_hash,
        )
        .await?;
        Ok(true)
    }

    async fn template_source(
        &self,
        instance: &RouterInstance,
        namespace: &str,
    ) -> Result<TemplateSource> {
        let Some(source) = instance.spec.template_source_ref.as_deref() else {
            return Ok(TemplateSource::Missing {
                reason: "NoTemplateSource",
                message: "templateSourceRef is not set".to_string(),
            });
        };

        match self.store.get_config_map(namespace, source).await? {
            Some(config_map) => Ok(TemplateSource::Found(config_map.data.unwrap_or_default())),
            None => Ok(TemplateSource::Missing {
                reason: "NotFound",
                message: format!("template ConfigMap {}/{} not found", namespace, source),
            }),
        }
    }

    /// Write content and hash annotation in one create or replace
    async fn publish(
        &self,
        instance: &RouterInstance,
        existing: Option<ConfigMap>,
        name: String,
        data: BTreeMap<String, String>,
        hash_annotation: &str,
        hash: &str,
    ) -> Result<()> {
        match existing {
            Some(mut config_map) => {
                config_map.data = Some(data);
                set_annotation(&mut config_map.metadata, hash_annotation, hash);
                self.store.replace_config_map(&config_map).await?;
            }
            None => {
                let mut config_map = new_artifact(instance, name)?;
                config_map.data = Some(data);
                set_annotation(&mut config_map.metadata, hash_annotation, hash);
                self.store.create_config_map(&config_map).await?;
            }
        }
        Ok(())
    }

    /// Persist `status`; an instance deleted during the pass is skipped
    async fn write_status(
        &self,
        instance: &RouterInstance,
        status: RouterInstanceStatus,
    ) -> Result<()> {
        let mut updated = instance.clone();
        updated.status = Some(status);
        match self.store.replace_router_instance_status(&updated).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound { .. }) => {
                info!(instance = %instance.key(), "RouterInstance deleted during generator pass");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: Option<String>,
) -> RouterCondition {
    RouterCondition {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message,
        last_transition_time: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
    }
}
