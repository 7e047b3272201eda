//! Watches ConfigMaps holding templates
//!
//! Only ConfigMaps named by some RouterInstance's `templateSourceRef` in
//! its own namespace schedule a pass; generator output and unrelated
//! ConfigMaps are ignored.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client, ResourceExt};
use kube_runtime::reflector::{self, Store};
use kube_runtime::{watcher, WatchStreamExt};
use router_api::RouterInstance;
use router_core::artifact::{is_managed, is_template_source};
use router_core::ChangeNotifier;
use tracing::{debug, info, warn};

pub struct TemplateSourceWatcher {
    client: Client,
    notifier: Arc<dyn ChangeNotifier>,
}

impl TemplateSourceWatcher {
    pub fn new(client: Client, notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self { client, notifier }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting template source watcher");

        let (instances, writer) = reflector::store::<RouterInstance>();
        let instance_api: Api<RouterInstance> = Api::all(self.client.clone());
        let instance_stream = watcher(instance_api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .touched_objects()
            .for_each(|_| futures::future::ready(()));
        tokio::spawn(instance_stream);

        instances
            .wait_until_ready()
            .await
            .map_err(|e| anyhow::anyhow!("RouterInstance cache never synced: {}", e))?;

        let config_maps: Api<ConfigMap> = Api::all(self.client.clone());
        let mut stream = watcher(config_maps, watcher::Config::default())
            .default_backoff()
            .touched_objects()
            .boxed();

        loop {
            match stream.try_next().await {
                Ok(Some(config_map)) => {
                    if !is_relevant(&instances, &config_map) {
                        continue;
                    }
                    debug!(
                        "Template source {}/{} changed",
                        config_map.namespace().unwrap_or_default(),
                        config_map.name_any()
                    );
                    self.notifier.notify_changed();
                }
                Ok(None) => break,
                Err(e) => warn!("ConfigMap watch error: {}", e),
            }
        }

        Ok(())
    }
}

fn is_relevant(instances: &Store<RouterInstance>, config_map: &ConfigMap) -> bool {
    !is_managed(&config_map.metadata)
        && is_template_source(
            instances.state().iter().map(|i| i.as_ref()),
            &config_map.metadata,
        )
}
