use chrono::{Duration, TimeZone, Utc};
use postmeter::billing::{referral, run_subscription_tick, SubscriptionService, SubscriptionState};
use sqlx::PgPool;

async fn paid_company(pool: &PgPool, code: &str, valid_until: chrono::DateTime<Utc>) -> i32 {
    let plan_id: i32 = sqlx::query_scalar(
        "INSERT INTO plans (name, price, send_post_limit, ai_generation_limit) VALUES ($1, 20, 100, 50) RETURNING id",
    )
    .bind(format!("Pro {code}"))
    .fetch_one(pool)
    .await
    .unwrap();
    sqlx::query_scalar(
        r#"
        INSERT INTO companies (
            name, current_plan_id, referral_code, last_payment_at,
            subscription_valid_until, payment_service
        ) VALUES ($1, $2, $1, $3, $4, 'liqpay')
        RETURNING id
        "#,
    )
    .bind(code)
    .bind(plan_id)
    .bind(valid_until - Duration::days(30))
    .bind(valid_until)
    .fetch_one(pool)
    .await
    .unwrap()
}

// key: subscription-scheduler-tests -> expiry, trial renewal
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expiry_sweep_resets_only_lapsed_companies(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let service = SubscriptionService::new(pool.clone(), 30);
    let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
    let lapsed = paid_company(&pool, "LAPSED0001", now - Duration::seconds(1)).await;
    let current = paid_company(&pool, "CURRENT001", now + Duration::days(3)).await;

    let report = run_subscription_tick(&service, now).await.unwrap();
    assert_eq!(report.expired, 1);

    let view = service.subscription_view(lapsed, now).await.unwrap().unwrap();
    assert_eq!(view.state, SubscriptionState::Trial);
    assert!(view.plan.unwrap().is_trial);
    assert_eq!(view.company.subscription_valid_until, None);
    assert_eq!(view.company.payment_service, None);
    assert_eq!(view.company.last_payment_at, now);

    let view = service.subscription_view(current, now).await.unwrap().unwrap();
    assert_eq!(view.state, SubscriptionState::Active);

    // a second tick finds nothing left to expire
    let report = run_subscription_tick(&service, now).await.unwrap();
    assert_eq!(report.expired, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn trial_windows_roll_forward_after_a_period(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let service = SubscriptionService::new(pool.clone(), 30);
    let joined = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let stale = service.register_company("Stale", None, joined).await.unwrap();
    let fresh = service
        .register_company("Fresh", None, joined + Duration::days(20))
        .await
        .unwrap();

    let now = joined + Duration::days(31);
    let report = run_subscription_tick(&service, now).await.unwrap();
    assert_eq!(report.trials_renewed, 1);

    let stale = service.company(stale.id).await.unwrap().unwrap();
    assert_eq!(stale.last_payment_at, now);
    let fresh = service.company(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.last_payment_at, joined + Duration::days(20));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_bootstrap_creates_one_trial_plan(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let service = SubscriptionService::new(pool.clone(), 30);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        handles.push(tokio::spawn(async move { service.ensure_trial_plan().await.unwrap().id }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let trials: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plans WHERE is_trial")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(trials, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_referral_code_is_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let service = SubscriptionService::new(pool.clone(), 30);
    let first = service.register_company("First", None, Utc::now()).await.unwrap();
    let second = service
        .register_company("Second", Some(&first.referral_code), Utc::now())
        .await
        .unwrap();
    assert_eq!(second.referred_by_id, Some(first.id));

    let err = service
        .register_company("Third", Some("NOSUCHCODE"), Utc::now())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown referral code"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn referral_links_reject_self_and_reverse_pairs(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let service = SubscriptionService::new(pool.clone(), 30);
    let first = service.register_company("First", None, Utc::now()).await.unwrap();
    let second = service.register_company("Second", None, Utc::now()).await.unwrap();
    let mut conn = pool.acquire().await.unwrap();

    referral::link(&mut conn, first.id, second.id).await.unwrap();

    let err = referral::link(&mut conn, second.id, first.id).await.unwrap_err();
    assert!(err.to_string().contains("cycles are not allowed"));
    let err = referral::link(&mut conn, first.id, first.id).await.unwrap_err();
    assert!(err.to_string().contains("cannot refer itself"));

    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM referrals")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(links, 1);
}
