//! Minimal `get_or_create` quick-start: a method whose result is
//! memoized under single-flight stampede protection.
//!
//! Run with `RUST_LOG=debug cargo run --example quick_start`.

use std::time::Duration;

use tiercache::manager::CacheManager;
use tiercache::policy::{PolicyDescriptor, StampedeMode};

#[tokio::main]
async fn main() -> tiercache::error::CacheResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("tiercache {} quick start", tiercache::VERSION);

    let cache = CacheManager::<String>::builder().build();

    let policy = PolicyDescriptor::new("GetUser")
        .with_duration(Duration::from_secs(30))
        .with_stampede_mode(StampedeMode::SingleFlight);

    let user = cache
        .get_or_create_by("GetUser", &[&7i64], policy.clone(), || async {
            log::info!("building GetUser(7) from scratch");
            Ok::<_, tiercache::error::CacheError>("user-7".to_string())
        })
        .await?;
    log::info!("first call returned {user:?}");

    let user_again = cache
        .get_or_create_by("GetUser", &[&7i64], policy, || async {
            log::warn!("this factory should not run on a cache hit");
            Ok::<_, tiercache::error::CacheError>("unexpected-rebuild".to_string())
        })
        .await?;
    log::info!("second call returned {user_again:?} (served from cache)");

    cache.shutdown().await;
    Ok(())
}
