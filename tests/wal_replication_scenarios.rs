//! End-to-end replication and concurrency scenarios, `SPEC_FULL.md` §8.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::tempdir;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use walrs::wal::codec::{Codec, JsonCodec};
use walrs::wal::framing;
use walrs::wal::log::{Log, LogOptions};
use walrs::wal::replication::{serve, ColdLogOpener, Follower, FollowerOptions, LeaderOptions, ReplicatorService};
use walrs::wal::segment::HEADER_SIZE;

fn cold_opener(dir: PathBuf, options: LogOptions) -> ColdLogOpener {
    Arc::new(move || Log::open_read_only(&dir, options.clone()))
}

async fn spawn_leader_with(log: Arc<Log>, options: LogOptions, tls: Option<ServerTlsConfig>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dir = log.dir().to_path_buf();
    let service = ReplicatorService::new(log, cold_opener(dir, options), LeaderOptions::default());
    tokio::spawn(async move {
        serve(listener, service, tls).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_leader(log: Arc<Log>) -> String {
    spawn_leader_with(log, LogOptions::default(), None).await
}

fn read_cert(name: &str) -> Vec<u8> {
    std::fs::read(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/certs").join(name)).unwrap()
}

fn pack_hello(payload: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    framing::pack("test", None, &payload.to_string(), &JsonCodec, &mut buf).unwrap();
    buf
}

// S3 Hot replication, `SPEC_FULL.md` §8.
#[tokio::test(flavor = "multi_thread")]
async fn s3_hot_replication_reaches_10000_within_2s() {
    let leader_dir = tempdir().unwrap();
    let leader_log = Log::open(leader_dir.path(), LogOptions::default()).unwrap();
    let endpoint = spawn_leader(Arc::clone(&leader_log)).await;

    let follower_dir = tempdir().unwrap();
    let follower_log = Log::open(follower_dir.path(), LogOptions::default()).unwrap();
    let follower = Follower::new(
        Arc::clone(&follower_log),
        FollowerOptions {
            filtered_streams: vec!["test".to_string()],
            ..FollowerOptions::default()
        },
    );
    let follower_task = {
        let follower = Arc::clone(&follower);
        tokio::spawn(async move { follower.run(endpoint).await })
    };

    for _ in 0..10_000 {
        leader_log.write(&pack_hello("hello"), |_| {}).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while follower_log.last_index() < 10_000 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        follower_log.last_index(),
        10_000,
        "follower did not catch up within 2s"
    );

    let mut reader = follower_log.open_reader(0);
    for _ in 0..10_000 {
        let entry = reader.read().unwrap();
        let (name, payload) = framing::unpack(&entry.data).unwrap();
        assert!(framing::match_stream(name, "test"));
        let value: String = JsonCodec.decode(payload).unwrap();
        assert_eq!(value, "hello");
    }

    follower.close();
    follower_task.abort();
}

// S4 Cold/out-of-cache replication, `SPEC_FULL.md` §8.
#[tokio::test(flavor = "multi_thread")]
async fn s4_cold_replication_three_fresh_followers_catch_up() {
    let leader_dir = tempdir().unwrap();
    let mut options = LogOptions::default();
    options.segment_size_bytes = HEADER_SIZE as u64 + 10;
    options.segment_cache_size = 2;
    let leader_log = Log::open(leader_dir.path(), options.clone()).unwrap();
    let endpoint = spawn_leader_with(Arc::clone(&leader_log), options, None).await;

    for _ in 0..512 {
        leader_log.write(&pack_hello("hi"), |_| {}).unwrap();
    }

    let mut follower_logs = Vec::new();
    let mut follower_tasks = Vec::new();
    let mut followers = Vec::new();
    for _ in 0..3 {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), LogOptions::default()).unwrap();
        let follower = Follower::new(
            Arc::clone(&log),
            FollowerOptions {
                filtered_streams: vec!["test".to_string()],
                ..FollowerOptions::default()
            },
        );
        let task = {
            let follower = Arc::clone(&follower);
            let endpoint = endpoint.clone();
            tokio::spawn(async move { follower.run(endpoint).await })
        };
        follower_logs.push((dir, log));
        follower_tasks.push(task);
        followers.push(follower);
    }

    for _ in 0..512 {
        leader_log.write(&pack_hello("hi"), |_| {}).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(25);
    loop {
        let all_caught_up = follower_logs
            .iter()
            .all(|(_, log)| log.last_index() == 1024);
        if all_caught_up || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for (_, log) in &follower_logs {
        assert_eq!(log.last_index(), 1024);
    }

    for follower in &followers {
        follower.close();
    }
    for task in follower_tasks {
        task.abort();
    }
}

// S5 Concurrent writes + multiple readers, `SPEC_FULL.md` §8.
#[test]
fn s5_concurrent_writers_and_readers_see_no_duplicates_or_gaps() {
    let dir = tempdir().unwrap();
    let log = Log::open(dir.path(), LogOptions::default()).unwrap();

    let writer_threads: Vec<_> = (0..16)
        .map(|_| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for _ in 0..625 {
                    log.write(b"x", |_| {}).unwrap();
                }
            })
        })
        .collect();
    for handle in writer_threads {
        handle.join().unwrap();
    }
    assert_eq!(log.last_index(), 10_000);

    let reader_threads: Vec<_> = (0..10)
        .map(|_| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                let mut reader = log.open_reader(0);
                let mut indices = Vec::with_capacity(10_000);
                for _ in 0..10_000 {
                    indices.push(reader.read().unwrap().index);
                }
                indices
            })
        })
        .collect();

    for handle in reader_threads {
        let indices = handle.join().unwrap();
        assert_eq!(indices, (1..=10_000).collect::<Vec<_>>());
    }
}

// S6 Mutual TLS replication, `SPEC_FULL.md` §8.
#[tokio::test(flavor = "multi_thread")]
async fn s6_mutual_tls_replication_reaches_exactly_100() {
    let ca = Certificate::from_pem(read_cert("ca.pem"));
    let server_identity = Identity::from_pem(read_cert("server.pem"), read_cert("server-key.pem"));
    let client_identity = Identity::from_pem(read_cert("client.pem"), read_cert("client-key.pem"));

    let server_tls = ServerTlsConfig::new()
        .identity(server_identity)
        .client_ca_root(ca.clone());
    let client_tls = ClientTlsConfig::new()
        .ca_certificate(ca)
        .identity(client_identity)
        .domain_name("localhost");

    let leader_dir = tempdir().unwrap();
    let leader_log = Log::open(leader_dir.path(), LogOptions::default()).unwrap();
    let endpoint = spawn_leader_with(Arc::clone(&leader_log), LogOptions::default(), Some(server_tls)).await;
    let endpoint = endpoint.replacen("http://", "https://", 1);

    let follower_dir = tempdir().unwrap();
    let follower_log = Log::open(follower_dir.path(), LogOptions::default()).unwrap();
    let follower = Follower::new(
        Arc::clone(&follower_log),
        FollowerOptions {
            filtered_streams: vec!["test".to_string()],
            tls: Some(client_tls),
            ..FollowerOptions::default()
        },
    );
    let follower_task = {
        let follower = Arc::clone(&follower);
        tokio::spawn(async move { follower.run(endpoint).await })
    };

    for _ in 0..100 {
        leader_log.write(&pack_hello("hello"), |_| {}).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while follower_log.last_index() < 100 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        follower_log.last_index(),
        100,
        "follower did not reach exactly 100 records over mutual TLS"
    );

    follower.close();
    follower_task.abort();
}
