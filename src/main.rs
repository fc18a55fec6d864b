use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use postmeter::billing::{
    self, LiqPayCredentials, PaymentEventProcessor, QuotaLedger, RateLimits, SubscriptionService,
};
use postmeter::channels::{self, telegram, ChannelLogger, SenderRegistry, TelegramSender};
use postmeter::config;
use postmeter::generation::{ContentGenerator, DisabledGenerator, HttpContentGenerator};
use postmeter::job_queue::{start_worker, JobContext};
use postmeter::routes::api_routes;
use postmeter::scheduling::{self, PostDispatcher, RecurringSweep};
use sqlx::postgres::PgPoolOptions;
use tokio::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Postmeter API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let subscriptions = SubscriptionService::new(pool.clone(), *config::BILLING_PERIOD_DAYS);
    let trial = subscriptions.ensure_trial_plan().await?;
    tracing::info!(plan_id = trial.id, "trial plan ready");

    let credentials = LiqPayCredentials {
        public_key: config::LIQPAY_PUBLIC_KEY.clone(),
        private_key: config::LIQPAY_PRIVATE_KEY.clone(),
        sandbox: *config::LIQPAY_SANDBOX,
    };
    if credentials.private_key.is_empty() {
        tracing::warn!("LIQPAY_PRIVATE_KEY is not set; payment callbacks will be rejected");
    }

    let ledger = QuotaLedger::new(pool.clone());
    let logger = ChannelLogger::new(pool.clone());
    let rate_limits = RateLimits::new(config::RATE_LIMITS_PER_MINUTE.clone());
    let provider_timeout = Duration::from_secs(*config::PROVIDER_TIMEOUT_SECS);

    let generator: Arc<dyn ContentGenerator> = match config::CONTENT_GENERATOR_URL.as_ref() {
        Some(endpoint) => Arc::new(HttpContentGenerator::new(
            endpoint.clone(),
            config::CONTENT_GENERATOR_TOKEN.clone(),
            *config::PROVIDER_TIMEOUT_SECS,
        )?),
        None => {
            tracing::warn!("CONTENT_GENERATOR_URL is not set; recurring generation is disabled");
            Arc::new(DisabledGenerator)
        }
    };
    let senders = SenderRegistry::new().with(
        telegram::CHANNEL_TYPE,
        Arc::new(TelegramSender::new(
            config::TELEGRAM_API_BASE.clone(),
            *config::PROVIDER_TIMEOUT_SECS,
        )?),
    );

    let job_tx = start_worker(JobContext {
        pool: pool.clone(),
        ledger: ledger.clone(),
        logger: logger.clone(),
        generator: generator.clone(),
        provider_timeout,
    });

    let processor = PaymentEventProcessor::new(
        pool.clone(),
        subscriptions.clone(),
        *config::REFERRAL_BONUS_TOKENS,
    );
    let payment_events = billing::start_payment_worker(processor.clone());

    billing::spawn_subscription_scheduler(
        subscriptions.clone(),
        *config::SUBSCRIPTION_SWEEP_INTERVAL_SECS,
    );
    scheduling::spawn_post_sweep(
        PostDispatcher::new(
            pool.clone(),
            ledger.clone(),
            logger.clone(),
            senders,
            provider_timeout,
        ),
        *config::DISPATCH_SCAN_INTERVAL_SECS,
    );
    if generator.is_enabled() {
        scheduling::spawn_recurring_sweep(
            RecurringSweep::new(pool.clone(), job_tx.clone()),
            *config::DISPATCH_SCAN_INTERVAL_SECS,
        );
    }
    channels::logs::spawn_retention(logger.clone(), *config::CHANNEL_LOG_RETENTION_DAYS, 86_400);

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(pool.clone()))
        .layer(Extension(job_tx))
        .layer(Extension(generator))
        .layer(Extension(ledger))
        .layer(Extension(logger))
        .layer(Extension(rate_limits))
        .layer(Extension(subscriptions))
        .layer(Extension(processor))
        .layer(Extension(payment_events))
        .layer(Extension(credentials));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
