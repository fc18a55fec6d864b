use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, warn};

use super::subscription::SubscriptionService;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionTickReport {
    pub expired: u64,
    pub trials_renewed: u64,
}

/// key: subscription-scheduler -> daily expiry and trial renewal
pub fn spawn(service: SubscriptionService, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = time::interval(TokioDuration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(&service, Utc::now()).await {
                warn!(?err, "subscription automation tick failed");
            }
        }
    });
}

/// key: subscription-scheduler -> tick handler
pub async fn process_tick(
    service: &SubscriptionService,
    now: DateTime<Utc>,
) -> Result<SubscriptionTickReport> {
    service.ensure_trial_plan().await?;

    let expired = match service.expire_overdue(now).await {
        Ok(expired) => expired,
        Err(err) => {
            warn!(?err, "subscription expiry sweep failed");
            0
        }
    };
    let trials_renewed = service.renew_trials(now).await?;

    let report = SubscriptionTickReport {
        expired,
        trials_renewed,
    };
    debug!(?report, "subscription automation tick complete");
    Ok(report)
}
