//! IngressRule controller: keeps back-references and deletion guards in sync

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{Api, Client};
use kube_runtime::{controller::Action, watcher, Controller};
use router_api::IngressRule;
use router_core::{CoreError, ReferenceReconciler};
use router_kube::KubeStore;
use tracing::{debug, error, info, warn};

struct Context {
    references: Arc<ReferenceReconciler<KubeStore>>,
    requeue: Duration,
}

pub struct IngressRuleController {
    client: Client,
    context: Arc<Context>,
}

impl IngressRuleController {
    pub fn new(
        client: Client,
        references: Arc<ReferenceReconciler<KubeStore>>,
        requeue: Duration,
    ) -> Self {
        Self {
            client,
            context: Arc::new(Context { references, requeue }),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting IngressRule reconciliation");

        let ingress_rules: Api<IngressRule> = Api::all(self.client.clone());
        let mut stream = Controller::new(ingress_rules, watcher::Config::default())
            .run(reconcile, error_policy, self.context.clone())
            .boxed();

        while let Some(item) = stream.next().await {
            match item {
                Ok((object, _)) => debug!("Reconciled IngressRule {}", object),
                Err(e) => warn!("Error in IngressRule reconciliation stream: {}", e),
            }
        }

        Ok(())
    }
}

async fn reconcile(ingress: Arc<IngressRule>, ctx: Arc<Context>) -> Result<Action, CoreError> {
    debug!(ingress = %ingress.owner(), "Reconciling IngressRule");
    let state = ctx.references.reconcile(&ingress).await?;
    debug!(ingress = %ingress.owner(), ?state, "IngressRule reconciled");
    Ok(Action::await_change())
}

fn error_policy(ingress: Arc<IngressRule>, e: &CoreError, ctx: Arc<Context>) -> Action {
    if e.is_not_found() {
        warn!(ingress = %ingress.owner(), "IngressRule not registered: {}", e);
    } else {
        error!(ingress = %ingress.owner(), "Error reconciling IngressRule: {}", e);
    }
    Action::requeue(ctx.requeue)
}
