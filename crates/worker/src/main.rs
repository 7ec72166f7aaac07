//! Notice delivery worker: fires due socket jobs, sends queued email and
//! periodically reconciles cached unread totals.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use notice_common::config::AppConfig;
use notice_common::db;
use notice_common::redis_pool::create_redis_pool;
use notice_engine::reconcile::Reconciler;
use notice_notifier::mail::smtp::{LogMailTransport, SmtpMailTransport};
use notice_notifier::mail::{MailTransport, standard_handlers};
use notice_notifier::runtime::DeliveryRuntime;
use notice_notifier::worker::{JobWorker, MailWorker, WorkerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notice_worker=info,notice_notifier=info,notice_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Notice worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;
    let runtime = DeliveryRuntime::build(pool, redis, &config)?;

    let options = WorkerOptions {
        // interval() panics on a zero period
        poll_interval: Duration::from_millis(config.worker_poll_interval_ms.max(1)),
        batch_size: config.worker_batch_size.max(1),
    };

    let transport: Arc<dyn MailTransport> = match &config.smtp {
        Some(smtp) => {
            tracing::info!(host = %smtp.host, port = smtp.port, "Delivering mail over SMTP");
            Arc::new(SmtpMailTransport::new(smtp)?)
        }
        None => {
            tracing::warn!("SMTP_HOST not set, queued mail will be logged only");
            Arc::new(LogMailTransport)
        }
    };
    let handlers = standard_handlers(runtime.store.clone(), runtime.receivers.clone());

    let cancel = CancellationToken::new();
    let mut handles = vec![
        tokio::spawn(
            JobWorker::new(runtime.jobs.clone(), runtime.service.clone(), options)
                .run(cancel.clone()),
        ),
        tokio::spawn(
            MailWorker::new(runtime.mail.clone(), handlers, transport, options)
                .run(cancel.clone()),
        ),
    ];

    if config.reconcile_interval_secs > 0 {
        let reconciler = Reconciler::new(
            runtime.store.clone(),
            runtime.service.lifecycle().clone(),
            Duration::from_secs(config.reconcile_interval_secs),
        );
        handles.push(tokio::spawn(reconciler.run(cancel.clone())));
    } else {
        tracing::info!("Counter reconciliation disabled");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Notice worker stopped.");
    Ok(())
}
