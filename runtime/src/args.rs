use crate::{admission::Admission, index, k8s};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::{api::PatchParams, runtime::watcher};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time::Duration,
};
use tracing::{info_span, Instrument};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const LEASE_NAME: &str = "customrouter-controller-write";
const RENEW_GRACE_PERIOD: Duration = Duration::from_secs(1);
const RECONCILIATION_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[clap(name = "customrouter", about = "Dynamic HTTP routing controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "customrouter=info,warn",
        env = "CUSTOMROUTER_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Namespace routing-table partitions are written to.
    #[clap(long, default_value = "customrouter")]
    partition_namespace: String,

    #[clap(long, default_value = "customrouter")]
    control_plane_namespace: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            admission_controller_disabled,
            partition_namespace,
            control_plane_namespace,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::default();
        let controller_metrics =
            index::ControllerMetrics::register(prom.sub_registry_with_prefix("customrouter"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // Build the index that turns resource events into partition and
        // artifact updates for the write controller.
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let idx = index::Index::shared(updates_tx);

        let routes = runtime.watch_all::<k8s::CustomHttpRoute>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(idx.clone(), routes).instrument(info_span!("customhttproutes")),
        );

        let attachments =
            runtime.watch_all::<k8s::ExternalProcessorAttachment>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(idx.clone(), attachments)
                .instrument(info_span!("externalprocessorattachments")),
        );

        tokio::spawn(
            index::Index::run(idx, RECONCILIATION_PERIOD).instrument(info_span!("reindex")),
        );

        let hostname =
            std::env::var("HOSTNAME").unwrap_or_else(|_| "customrouter-controller".to_string());
        let claims = init_lease(
            &runtime,
            kubert::LeaseParams {
                name: LEASE_NAME.to_string(),
                namespace: control_plane_namespace.clone(),
                claimant: hostname.clone(),
                lease_duration: LEASE_DURATION,
                renew_grace_period: RENEW_GRACE_PERIOD,
                field_manager: Some("customrouter-controller".into()),
            },
        )
        .await?;

        let controller = index::Controller::new(
            claims,
            hostname,
            runtime.client(),
            partition_namespace,
            updates_rx,
            controller_metrics,
        );
        tokio::spawn(controller.run().instrument(info_span!("controller")));

        let client = runtime.client();
        let runtime = runtime.spawn_server(|| Admission::new(client));

        // Block the main task on the shutdown signal; background tasks drain
        // before the process exits.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }
        Ok(())
    }
}

async fn init_lease<T>(
    runtime: &kubert::Runtime<T>,
    params: kubert::LeaseParams,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    let lease = coordv1::Lease {
        metadata: k8s::ObjectMeta {
            name: Some(params.name.clone()),
            namespace: Some(params.namespace.clone()),
            // A resource version of "0" creates the Lease only when it does
            // not already exist.
            resource_version: Some("0".to_string()),
            labels: Some(
                [
                    (
                        "app.kubernetes.io/name".to_string(),
                        "customrouter".to_string(),
                    ),
                    (
                        k8s::MANAGED_BY_LABEL.to_string(),
                        k8s::MANAGED_BY_VALUE.to_string(),
                    ),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    match k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), &params.namespace)
        .patch(
            LEASE_NAME,
            &PatchParams {
                field_manager: params.field_manager.clone().map(Into::into),
                ..Default::default()
            },
            &kube::api::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists, no need to create it"),
        Err(error) => return Err(error.into()),
    };

    let (claims, _task) = runtime.spawn_lease(params).await?;
    Ok(claims)
}
