//! Tag-based invalidation quick-start: caching several methods under a
//! shared tag, then invalidating them all in one call without knowing
//! their individual keys.
//!
//! Run with `RUST_LOG=debug cargo run --example tag_invalidation`.

use std::time::Duration;

use tiercache::manager::CacheManager;
use tiercache::policy::PolicyDescriptor;

#[tokio::main]
async fn main() -> tiercache::error::CacheResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cache = CacheManager::<String>::builder().build();

    let order_policy = PolicyDescriptor::new("GetOrder")
        .with_duration(Duration::from_secs(60))
        .with_tag("customer:42");
    let invoice_policy = PolicyDescriptor::new("GetInvoice")
        .with_duration(Duration::from_secs(60))
        .with_tag("customer:42");

    cache
        .get_or_create_by("GetOrder", &[&1001i64], order_policy, || async {
            Ok::<_, tiercache::error::CacheError>("order-1001".to_string())
        })
        .await?;
    cache
        .get_or_create_by("GetInvoice", &[&1001i64], invoice_policy, || async {
            Ok::<_, tiercache::error::CacheError>("invoice-1001".to_string())
        })
        .await?;

    log::info!("cached an order and an invoice under tag `customer:42`");

    let removed = cache.invalidate_by_tags(&["customer:42"]).await?;
    log::info!("invalidated {} entries for customer 42: {removed:?}", removed.len());

    cache.shutdown().await;
    Ok(())
}
