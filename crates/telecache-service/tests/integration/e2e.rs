use std::time::{Duration, SystemTime};

use filetime::FileTime;
use futures::StreamExt;
use telecache_service::caching::{CacheStatus, FetchError};
use telecache_service::download::CHUNK_SIZE;
use telecache_test::MockBotApi;

use crate::{collect, contents, setup_service, setup_service_with_limit};

/// Counts the requests made to `server` per API method, resetting the counter.
fn hits_by_method(server: &MockBotApi) -> Vec<(String, usize)> {
    let mut methods: Vec<(String, usize)> = vec![];
    for (uri, count) in server.all_hits() {
        let method = if uri.starts_with("/file/") {
            "download".to_owned()
        } else {
            let path = uri.split('?').next().unwrap_or_default();
            path.rsplit('/').next().unwrap_or_default().to_owned()
        };
        match methods.iter_mut().find(|(m, _)| *m == method) {
            Some((_, total)) => *total += count,
            None => methods.push((method, count)),
        }
    }
    methods.sort();
    methods
}

#[tokio::test]
async fn test_direct_fetch_then_cache_hit() {
    let env = setup_service(|_| ());
    let object = contents(40);
    env.add_object("small", &object);

    let stream = env.service.fetch().fetch_object("small").await.unwrap();
    let (sizes, fetched) = collect(stream).await;

    assert_eq!(fetched, object);
    assert_eq!(sizes, [40]);
    assert_eq!(std::fs::read(env.cache_file("small")).unwrap(), object);
    assert_eq!(
        hits_by_method(&env.public),
        [("download".to_owned(), 1), ("getFile".to_owned(), 1)]
    );

    // the second fetch is served from the cache without contacting the bot api
    let stream = env.service.fetch().fetch_object("small").await.unwrap();
    let (_, fetched) = collect(stream).await;

    assert_eq!(fetched, object);
    assert_eq!(env.public.accesses(), 0);
    assert_eq!(env.local.accesses(), 0);
}

#[tokio::test]
async fn test_direct_fetch_chunking() {
    let env = setup_service_with_limit(usize::MAX, |_| ());
    let object = contents(2 * CHUNK_SIZE + 1000);
    env.add_object("medium", &object);

    let stream = env.service.fetch().fetch_object("medium").await.unwrap();
    let (sizes, fetched) = collect(stream).await;

    assert_eq!(sizes, [CHUNK_SIZE, CHUNK_SIZE, 1000]);
    assert_eq!(fetched, object);
    assert_eq!(std::fs::read(env.cache_file("medium")).unwrap(), object);
    // the session was never involved
    assert_eq!(env.local.accesses(), 0);
}

#[tokio::test]
async fn test_oversized_object_falls_back_to_session() {
    let env = setup_service(|_| ());
    let object = contents(100);
    env.add_object("abc", &object);

    let stream = env.service.fetch().fetch_object("abc").await.unwrap();
    let (sizes, fetched) = collect(stream).await;

    assert_eq!(sizes, [100]);
    assert_eq!(fetched, object);
    assert_eq!(std::fs::read(env.cache_file("abc")).unwrap(), object);

    assert_eq!(hits_by_method(&env.public), [("getFile".to_owned(), 1)]);
    assert_eq!(
        hits_by_method(&env.local),
        [
            ("download".to_owned(), 1),
            ("getFile".to_owned(), 1),
            ("getMe".to_owned(), 1),
        ]
    );

    let status = env.service.fetch().cache_status("abc").await.unwrap().unwrap();
    assert_eq!(status.status, CacheStatus::Completed);
    assert_eq!(status.cached_bytes, 100);
}

#[tokio::test]
async fn test_session_fetch_chunking() {
    let env = setup_service(|_| ());
    let object = contents(3 * CHUNK_SIZE + 5);
    env.add_object("large", &object);

    let stream = env.service.fetch().fetch_object("large").await.unwrap();
    let (sizes, fetched) = collect(stream).await;

    assert_eq!(sizes, [CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE, 5]);
    assert_eq!(fetched, object);
    assert_eq!(std::fs::read(env.cache_file("large")).unwrap(), object);
}

#[tokio::test]
async fn test_incomplete_cache_file_is_refetched() {
    let env = setup_service(|_| ());
    let object = contents(30);
    env.add_object("partial", &object);
    std::fs::write(env.cache_file("partial"), &object[..10]).unwrap();

    let status = env.service.fetch().cache_status("partial").await.unwrap().unwrap();
    assert_eq!(status.status, CacheStatus::Caching);

    let stream = env.service.fetch().fetch_object("partial").await.unwrap();
    let (_, fetched) = collect(stream).await;

    assert_eq!(fetched, object);
    assert!(env.public.accesses() > 0);
    assert_eq!(std::fs::read(env.cache_file("partial")).unwrap(), object);
}

#[tokio::test]
async fn test_stale_cache_file_is_refetched() {
    let env = setup_service(|_| ());
    let object = contents(30);
    env.add_object("stale", &object);

    let path = env.cache_file("stale");
    std::fs::write(&path, vec![0; 30]).unwrap();
    let mtime = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(3600));
    filetime::set_file_mtime(&path, mtime).unwrap();

    let stream = env.service.fetch().fetch_object("stale").await.unwrap();
    let (_, fetched) = collect(stream).await;

    assert_eq!(fetched, object);
    assert!(env.public.accesses() > 0);
}

#[tokio::test]
async fn test_unknown_size_cache_hit() {
    let env = setup_service(|_| ());
    std::fs::write(env.cache_file("unregistered"), b"cached").unwrap();

    let stream = env
        .service
        .fetch()
        .fetch_object("unregistered")
        .await
        .unwrap();
    let (_, fetched) = collect(stream).await;

    assert_eq!(fetched, b"cached");
    assert_eq!(env.public.accesses(), 0);
    assert_eq!(
        env.service.fetch().cache_status("unregistered").await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_not_found_upstream_removes_partial_file() {
    let env = setup_service(|_| ());
    let path = env.cache_file("missing");
    std::fs::write(&path, b"leftover").unwrap();
    let mtime = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(3600));
    filetime::set_file_mtime(&path, mtime).unwrap();

    let result = env.service.fetch().fetch_object("missing").await;

    assert!(matches!(result, Err(FetchError::NotFoundUpstream)));
    assert!(!path.exists());
    assert_eq!(env.local.accesses(), 0);
}

#[tokio::test]
async fn test_oversized_without_session() {
    let env = setup_service(|config| config.session.url = None);
    env.add_object("abc", &contents(100));

    let result = env.service.fetch().fetch_object("abc").await;

    assert!(matches!(result, Err(FetchError::RuntimeNotStarted)));
    assert!(!env.cache_file("abc").exists());
}

#[tokio::test]
async fn test_session_error_is_raised() {
    let env = setup_service(|config| config.session.token = "wrong:token".into());
    env.add_object("abc", &contents(100));

    let mut stream = env.service.fetch().fetch_object("abc").await.unwrap();
    let first = stream.next().await.unwrap();

    assert!(matches!(first, Err(FetchError::Session(_))));
    assert!(stream.next().await.is_none());
    assert!(!env.cache_file("abc").exists());
}

#[tokio::test]
async fn test_invalid_object_id() {
    let env = setup_service(|_| ());

    let result = env.service.fetch().fetch_object("../etc/passwd").await;

    assert!(matches!(result, Err(FetchError::InvalidObjectId(_))));
    assert_eq!(env.public.accesses(), 0);
}

#[tokio::test]
async fn test_dropped_stream_removes_partial_file() {
    let env = setup_service_with_limit(usize::MAX, |_| ());
    env.add_object("medium", &contents(4 * CHUNK_SIZE));

    let mut stream = env.service.fetch().fetch_object("medium").await.unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.len(), CHUNK_SIZE);
    assert!(env.cache_file("medium").exists());

    drop(stream);
    assert!(!env.cache_file("medium").exists());
}

#[tokio::test]
async fn test_prefetch() {
    let env = setup_service(|_| ());
    let object = contents(100);
    env.add_object("abc", &object);
    let fetch = env.service.fetch();

    fetch.prefetch("abc").unwrap();
    // the first background download has not had a chance to run yet
    assert!(matches!(
        fetch.prefetch("abc"),
        Err(FetchError::AlreadyInProgress)
    ));

    for _ in 0..500 {
        if fetch.inflight().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(fetch.inflight().is_empty());
    let status = fetch.cache_status("abc").await.unwrap().unwrap();
    assert_eq!(status.status, CacheStatus::Completed);
    assert_eq!(std::fs::read(env.cache_file("abc")).unwrap(), object);
}

#[tokio::test]
async fn test_prefetch_limit() {
    let env = setup_service(|config| config.max_background_downloads = 1);
    env.add_object("a", &contents(10));
    env.add_object("b", &contents(10));

    env.service.fetch().prefetch("a").unwrap();
    assert!(matches!(
        env.service.fetch().prefetch("b"),
        Err(FetchError::TooManyInflight)
    ));
}
