//! Dispatcher end to end over HTTP: the copy-in, job, read-back workflow.

mod common;

use common::MockNameNode;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use webhdfs_fuse::cache::{CacheConfig, ManualClock, MetadataCache};
use webhdfs_fuse::config::MountConfig;
use webhdfs_fuse::dispatcher::IoConfig;
use webhdfs_fuse::{Dispatcher, FsError, HdfsPath, RestTransport};

fn p(s: &str) -> HdfsPath {
    HdfsPath::new(s)
}

struct Mounted {
    mock: MockNameNode,
    clock: ManualClock,
    fs: Dispatcher,
}

fn mount_with(io: IoConfig) -> Mounted {
    let mock = MockNameNode::start();
    let transport = RestTransport::new(&mock.transport_config(Some("alice"))).unwrap();
    let clock = ManualClock::new();
    let cache = MetadataCache::new(&CacheConfig::default(), Arc::new(clock.clone()));
    let fs = Dispatcher::new(Arc::new(transport), cache, io, "alice");
    Mounted { mock, clock, fs }
}

fn mount() -> Mounted {
    mount_with(IoConfig::default())
}

fn read_all(fs: &Dispatcher, path: &HdfsPath) -> Vec<u8> {
    let fh = fs.open(path, libc::O_RDONLY).unwrap();
    let mut out = Vec::new();
    loop {
        let chunk = fs.read(fh, out.len() as u64, 4).unwrap();
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    fs.release(fh).unwrap();
    out
}

#[test]
fn test_demo_out_over_http() {
    let m = mount();
    let path = p("/user/x/demo.out");

    let fh = m.fs.create(&path, 0o644, libc::O_WRONLY | libc::O_CREAT).unwrap();
    m.fs.write(fh, 0, b"line1\n").unwrap();
    m.fs.flush(fh).unwrap();
    m.fs.write(fh, 6, b"line2\n").unwrap();
    m.fs.flush(fh).unwrap();
    m.fs.release(fh).unwrap();

    assert_eq!(m.mock.file_data("/user/x/demo.out").unwrap(), b"line1\nline2\n");
    assert_eq!(m.mock.datanode_calls("CREATE"), 1);
    assert_eq!(m.mock.datanode_calls("APPEND"), 1);

    let fh = m.fs.open(&path, libc::O_RDONLY).unwrap();
    assert_eq!(&m.fs.read(fh, 0, 12).unwrap()[..], b"line1\nline2\n");
    m.fs.release(fh).unwrap();
}

#[test]
fn test_copy_in_then_read_back_in_small_chunks() {
    let m = mount_with(IoConfig {
        flush_threshold: 16,
        read_ahead: 8,
    });
    let path = p("/user/x/input/part-00000");
    m.mock.put_dir("/user/x/input");

    let payload: Vec<u8> = (0..100u8).collect();
    let fh = m.fs.create(&path, 0o644, libc::O_WRONLY | libc::O_CREAT).unwrap();
    for (i, chunk) in payload.chunks(10).enumerate() {
        m.fs.write(fh, (i * 10) as u64, chunk).unwrap();
    }
    m.fs.release(fh).unwrap();
    assert_eq!(m.mock.file_data("/user/x/input/part-00000").unwrap(), payload);

    assert_eq!(read_all(&m.fs, &path), payload);
}

#[test]
fn test_job_output_appears_after_ttl() {
    let m = mount();
    let dir = p("/user/x");
    assert!(m.fs.readdir(&dir).unwrap().is_empty());

    // A job running on the cluster writes output behind the mount's back.
    m.mock.put_file("/user/x/_SUCCESS", b"");
    assert!(m.fs.readdir(&dir).unwrap().is_empty());

    m.clock.advance(Duration::from_millis(2_000));
    let names: Vec<String> = m.fs.readdir(&dir).unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["_SUCCESS".to_string()]);
}

#[test]
fn test_getattr_is_cached() {
    let m = mount();
    m.mock.put_file("/user/x/f", b"abc");
    for _ in 0..4 {
        assert_eq!(m.fs.getattr(&p("/user/x/f")).unwrap().size, 3);
    }
    assert_eq!(m.mock.namenode_calls("GETFILESTATUS"), 1);
}

#[test]
fn test_rmdir_non_empty_over_http() {
    let m = mount();
    m.mock.put_file("/user/x/nonempty/child", b"c");

    assert!(matches!(
        m.fs.rmdir(&p("/user/x/nonempty")),
        Err(FsError::NotEmpty { .. })
    ));
    assert!(m.mock.exists("/user/x/nonempty/child"));
}

#[test]
fn test_failed_datanode_write_keeps_buffer() {
    let m = mount();
    let path = p("/user/x/retry.out");
    let fh = m.fs.create(&path, 0o644, libc::O_WRONLY | libc::O_CREAT).unwrap();
    m.fs.write(fh, 0, b"precious").unwrap();

    m.mock.fail_datanode("CREATE", 1);
    assert!(matches!(m.fs.flush(fh), Err(FsError::Io { .. })));
    assert!(!m.mock.exists("/user/x/retry.out"));

    m.fs.flush(fh).unwrap();
    m.fs.release(fh).unwrap();
    assert_eq!(m.mock.file_data("/user/x/retry.out").unwrap(), b"precious");
}

#[test]
fn test_mkdir_readdir_rename_unlink() {
    let m = mount();
    m.fs.mkdir(&p("/user/x/out"), 0o755).unwrap();
    m.mock.put_file("/user/x/a", b"12345");

    let names: BTreeSet<String> = m
        .fs
        .readdir(&p("/user/x"))
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains("out"));

    m.fs.rename(&p("/user/x/a"), &p("/user/x/out/a")).unwrap();
    assert!(matches!(
        m.fs.getattr(&p("/user/x/a")),
        Err(FsError::NotFound { .. })
    ));
    let moved = m.fs.getattr(&p("/user/x/out/a")).unwrap();
    assert_eq!(moved.size, 5);
    assert_eq!(moved.perm, 0o644);

    m.fs.unlink(&p("/user/x/out/a")).unwrap();
    assert!(!m.mock.exists("/user/x/out/a"));
    m.fs.rmdir(&p("/user/x/out")).unwrap();
    assert!(!m.mock.exists("/user/x/out"));
}

#[test]
fn test_truncate_and_chmod_over_http() {
    let m = mount();
    m.mock.put_file("/user/x/f", b"data");

    m.fs.chmod(&p("/user/x/f"), 0o600).unwrap();
    m.fs.truncate(&p("/user/x/f"), 0, None).unwrap();
    assert_eq!(m.mock.file_data("/user/x/f").unwrap(), b"");
    assert_eq!(m.mock.perm_of("/user/x/f"), Some(0o600));
    assert!(matches!(
        m.fs.truncate(&p("/user/x/f"), 3, None),
        Err(FsError::Unsupported { .. })
    ));
}

#[test]
fn test_statfs_over_http() {
    let m = mount();
    m.mock.put_file("/user/x/a", b"0123456789");
    let stats = m.fs.statfs().unwrap();
    assert_eq!(stats.used, 30);
    assert_eq!(stats.files, 4);
    assert!(stats.capacity > stats.used);
}

#[test]
fn test_mount_from_config_file() {
    let mock = MockNameNode::start();
    mock.put_file("/user/x/from-config", b"ok");

    let mut file = NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        r#"
namenode_host = "127.0.0.1"
namenode_port = {}
user = "etl"

[transport.retry]
initial_delay_ms = 1
"#,
        mock.port()
    )
    .unwrap();

    let config = MountConfig::from_file(file.path()).unwrap();
    let transport = RestTransport::new(&config.transport_config()).unwrap();
    let cache = MetadataCache::new(&config.cache, Arc::new(ManualClock::new()));
    let fs = Dispatcher::new(Arc::new(transport), cache, config.io.clone(), config.effective_user());

    assert_eq!(read_all(&fs, &p("/user/x/from-config")), b"ok");
    assert_eq!(mock.last_request().unwrap().user.as_deref(), Some("etl"));
}
