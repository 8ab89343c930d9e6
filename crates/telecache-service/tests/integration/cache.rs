use std::time::{Duration, SystemTime};

use filetime::FileTime;
use telecache_service::caching::{CacheStatus, DiskCache, cleanup};
use telecache_service::config::Config;

use crate::{collect, contents, setup_service};

fn age_file(path: &std::path::Path, age: Duration) {
    let mtime = FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_mtime(path, mtime).unwrap();
}

#[tokio::test]
async fn test_status_transitions() {
    let env = setup_service(|_| ());
    let object = contents(40);
    env.add_object("obj", &object);
    let fetch = env.service.fetch();

    let status = fetch.cache_status("obj").await.unwrap().unwrap();
    assert_eq!(status.status, CacheStatus::NotCached);
    assert_eq!(status.total_bytes, 40);

    collect(fetch.fetch_object("obj").await.unwrap()).await;

    let status = fetch.cache_status("obj").await.unwrap().unwrap();
    assert_eq!(status.status, CacheStatus::Completed);
    assert_eq!(status.cached_bytes, 40);
}

#[tokio::test]
async fn test_clear_cache_then_fetch() {
    let env = setup_service(|_| ());
    let object = contents(20);
    env.add_object("a", &object);
    env.add_object("b", &contents(30));
    let fetch = env.service.fetch();

    collect(fetch.fetch_object("a").await.unwrap()).await;
    collect(fetch.fetch_object("b").await.unwrap()).await;
    assert_eq!(fetch.cache_size().await.unwrap(), 50);

    fetch.clear_cache().await.unwrap();
    assert_eq!(fetch.cache_size().await.unwrap(), 0);
    assert!(env.cache_dir.path().is_dir());

    let (_, fetched) = collect(fetch.fetch_object("a").await.unwrap()).await;
    assert_eq!(fetched, object);
    assert_eq!(fetch.cache_size().await.unwrap(), 20);
}

#[tokio::test]
async fn test_invalidate_file_and_thumbnail() {
    let env = setup_service(|_| ());
    env.add_object("file", &contents(10));
    env.add_object("thumb", &contents(5));
    let fetch = env.service.fetch();

    collect(fetch.fetch_object("file").await.unwrap()).await;
    collect(fetch.fetch_object("thumb").await.unwrap()).await;

    fetch.invalidate(&["file", "thumb"]).await;
    // invalidating twice is harmless
    fetch.invalidate(&["file", "thumb"]).await;

    assert!(!env.cache_file("file").exists());
    assert!(!env.cache_file("thumb").exists());
}

#[test]
fn test_cleanup_command() {
    let cache_dir = telecache_test::tempdir();
    let mut config = Config {
        cache_dir: cache_dir.path().to_owned(),
        ..Default::default()
    };
    config.cache.max_age = Duration::from_secs(600);

    std::fs::write(cache_dir.path().join("old"), b"old").unwrap();
    age_file(&cache_dir.path().join("old"), Duration::from_secs(1200));
    std::fs::write(cache_dir.path().join("new"), b"new").unwrap();

    // a dry run keeps everything
    cleanup(config.clone(), true).unwrap();
    assert!(cache_dir.path().join("old").exists());

    cleanup(config.clone(), false).unwrap();
    assert!(!cache_dir.path().join("old").exists());
    assert!(cache_dir.path().join("new").exists());

    // sweeping again changes nothing
    let cache = DiskCache::from_config(&config).unwrap();
    let stats = cache.cleanup(false).unwrap().unwrap();
    assert_eq!(stats.removed_expired + stats.removed_evicted, 0);
    assert_eq!(stats.retained_files, 1);
}

#[tokio::test]
async fn test_janitor_runs_in_service() {
    let env = setup_service(|config| {
        config.cache.cleanup_interval = Duration::from_millis(50);
    });
    let path = env.cache_file("expired");
    std::fs::write(&path, b"expired").unwrap();
    age_file(&path, Duration::from_secs(3600));
    std::fs::write(env.cache_file("fresh"), b"fresh").unwrap();

    for _ in 0..200 {
        if !path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(!path.exists());
    assert!(env.cache_file("fresh").exists());
}
