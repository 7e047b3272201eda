//! RouterInstance controller
//!
//! Any change to an instance may change its routing data, so every event
//! is forwarded to the generator. The controller also provisions the
//! router DaemonSet and LoadBalancer Service the instance owns.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Service;
use kube::{Api, Client};
use kube_runtime::{controller::Action, watcher, Controller};
use router_api::RouterInstance;
use router_core::workload::{daemon_set_for, service_for};
use router_core::{ChangeNotifier, CoreError};
use router_kube::KubeStore;
use tracing::{debug, error, info, warn};

struct Context {
    store: Arc<KubeStore>,
    notifier: Arc<dyn ChangeNotifier>,
    image: String,
    requeue: Duration,
}

pub struct RouterInstanceController {
    client: Client,
    context: Arc<Context>,
}

impl RouterInstanceController {
    pub fn new(
        store: Arc<KubeStore>,
        notifier: Arc<dyn ChangeNotifier>,
        image: String,
        requeue: Duration,
    ) -> Self {
        Self {
            client: store.client(),
            context: Arc::new(Context {
                store,
                notifier,
                image,
                requeue,
            }),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting RouterInstance reconciliation");

        let router_instances: Api<RouterInstance> = Api::all(self.client.clone());
        let mut stream = Controller::new(router_instances, watcher::Config::default())
            .owns(Api::<DaemonSet>::all(self.client.clone()), watcher::Config::default())
            .owns(Api::<Service>::all(self.client.clone()), watcher::Config::default())
            .run(reconcile, error_policy, self.context.clone())
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok((object, _)) => debug!("Reconciled RouterInstance {}", object),
                Err(e) => warn!("Error in RouterInstance reconciliation stream: {}", e),
            }
        }

        Ok(())
    }
}

async fn reconcile(instance: Arc<RouterInstance>, ctx: Arc<Context>) -> Result<Action, CoreError> {
    debug!(instance = %instance.key(), "RouterInstance changed");
    ctx.notifier.notify_changed();

    // Deleted instances take their workload along through owner references.
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let daemon_set = daemon_set_for(&instance, &ctx.image)?;
    if ctx.store.create_if_absent(&daemon_set).await? {
        info!(instance = %instance.key(), "Router DaemonSet created");
    }

    let service = service_for(&instance)?;
    if ctx.store.create_if_absent(&service).await? {
        info!(instance = %instance.key(), "Router Service created");
    }

    Ok(Action::await_change())
}

fn error_policy(instance: Arc<RouterInstance>, e: &CoreError, ctx: Arc<Context>) -> Action {
    error!(instance = %instance.key(), "Error provisioning router workload: {}", e);
    Action::requeue(ctx.requeue)
}
