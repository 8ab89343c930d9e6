use std::time::Duration;

use futures::StreamExt;
use telecache_service::config::Config;
use telecache_service::download::ByteStream;
use telecache_service::services::Service;
use telecache_service::services::metadata::ObjectMeta;
use telecache_test::{self as test, MockBotApi};

pub const TOKEN: &str = "123456:test-token";

/// The public bot API only serves objects up to this size in tests.
pub const SIZE_LIMIT: usize = 50;

/// A service wired to a fake public bot API and a fake self-hosted server.
pub struct TestEnv {
    pub service: Service,
    pub public: MockBotApi,
    pub local: MockBotApi,
    pub cache_dir: test::TempDir,
}

impl TestEnv {
    /// Makes `contents` available under `object_id` on both servers and registers its size.
    pub fn add_object(&self, object_id: &str, contents: &[u8]) {
        self.public.add_file(object_id, contents);
        self.local.add_file(object_id, contents);
        self.service.metadata().register(
            object_id,
            ObjectMeta {
                size: Some(contents.len() as u64),
                mime_type: Some("application/octet-stream".into()),
            },
        );
    }

    pub fn cache_file(&self, object_id: &str) -> std::path::PathBuf {
        self.cache_dir.path().join(object_id)
    }
}

/// Setup tests and create a test service.
///
/// The janitor is disabled. The `update_config` closure can modify the configuration before the
/// service is created.
pub fn setup_service(update_config: impl FnOnce(&mut Config)) -> TestEnv {
    setup_service_with_limit(SIZE_LIMIT, update_config)
}

/// Like [`setup_service`], with a custom size limit of the public bot API.
pub fn setup_service_with_limit(
    size_limit: usize,
    update_config: impl FnOnce(&mut Config),
) -> TestEnv {
    test::setup();

    let cache_dir = test::tempdir();
    let public = MockBotApi::public(TOKEN, size_limit);
    let local = MockBotApi::local(TOKEN);

    let mut config = Config {
        cache_dir: cache_dir.path().to_owned(),
        ..Default::default()
    };
    config.cache.cleanup_interval = Duration::ZERO;
    config.cache.max_age = Duration::from_secs(600);
    config.bot_api.url = public.url();
    config.bot_api.token = TOKEN.into();
    config.session.url = Some(local.url());
    config.session.token = String::new();
    update_config(&mut config);

    let service = Service::create(&config, tokio::runtime::Handle::current()).unwrap();

    TestEnv {
        service,
        public,
        local,
        cache_dir,
    }
}

/// Drains `stream`, returning the sizes of all chunks and the concatenated contents.
pub async fn collect(mut stream: ByteStream) -> (Vec<usize>, Vec<u8>) {
    let mut sizes = vec![];
    let mut contents = vec![];
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        sizes.push(chunk.len());
        contents.extend_from_slice(&chunk);
    }
    (sizes, contents)
}

/// Deterministic test contents of the given length.
pub fn contents(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
