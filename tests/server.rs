//! A node served over TCP, driven through the client and the peer transport

use meshgrep::config::Config;
use meshgrep::error::ErrorKind;
use meshgrep::query::{FindQuery, IndexQuery, SearchQuery};
use meshgrep::repo::RepoStore;
use meshgrep::router::Router;
use meshgrep::server::protocol::{MAX_MESSAGE_SIZE, read_message, write_message};
use meshgrep::server::{NodeClient, NodeServer, PublicQuery, Request, Response, TcpTransport};
use meshgrep::transport::{NoTransport, Transport};
use meshgrep::utils::{Endpoint, LocalHosts};
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const IO_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

#[test]
fn test_node_round_trip() {
    let src = tempfile::tempdir().unwrap();
    let idx = tempfile::tempdir().unwrap();
    fs::create_dir_all(src.path().join("lib")).unwrap();
    fs::write(src.path().join("lib/greet.rs"), "pub fn greet() {\n    println!(\"hello\");\n}\n").unwrap();
    fs::write(src.path().join("lib/other.rs"), "pub fn other() {}\n").unwrap();

    let config = Config {
        index_root: Some(idx.path().to_path_buf()),
        ..Config::default()
    };
    let router = Router::with_hosts(
        Arc::new(config),
        Arc::new(RepoStore::in_memory()),
        LocalHosts::with_names([]),
        Arc::new(NoTransport),
    )
    .unwrap();
    let server = NodeServer::bind(Arc::new(router), "127.0.0.1:0").unwrap();
    let addr = server.local_addr();
    let handle = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.run())
    };

    let mut client = NodeClient::connect(&addr.to_string(), IO_TIMEOUT).unwrap();
    client.ping().unwrap();

    let query = IndexQuery::new("lib", src.path(), vec![PathBuf::from("lib")]);
    match client.submit(PublicQuery::Index(query)).unwrap() {
        Response::Index(result) => {
            assert!(result.errors.is_empty(), "{:?}", result.errors);
            assert_eq!(result.repo.unwrap().num_files, 2);
        }
        other => panic!("unexpected {other:?}"),
    }

    let query = SearchQuery::new("hello").with_repos(["lib"]);
    match client.submit(PublicQuery::Search(query.clone())).unwrap() {
        Response::Search(result) => {
            assert_eq!(result.num_matches, 1);
            assert_eq!(result.matches["lib/greet.rs"]["lib"][&2], "    println!(\"hello\");");
        }
        other => panic!("unexpected {other:?}"),
    }

    // the peer transport speaks the same protocol
    let endpoint = Endpoint::new("127.0.0.1", addr.port());
    let relayed = TcpTransport
        .search(&endpoint, &query, Duration::from_secs(10))
        .unwrap();
    assert_eq!(relayed.num_matches, 1);
    let found = TcpTransport
        .find(&endpoint, &FindQuery::new("other").with_repos(["lib"]), Duration::from_secs(10))
        .unwrap();
    assert_eq!(found.num_matches, 1);

    let repos = client.list_repos().unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(client.get_repo("lib").unwrap().key, "lib");
    let missing = client.get_repo("nope").unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NoRepoFound);

    let status = client.status().unwrap();
    assert_eq!(status.num_repos, 1);
    assert!(status.queries_served >= 4);

    client.delete_repo("lib").unwrap();
    assert!(client.list_repos().unwrap().is_empty());

    client.shutdown().unwrap();
    handle.join().unwrap().unwrap();
}

fn bare_node() -> Arc<NodeServer> {
    let router = Router::with_hosts(
        Arc::new(Config::default()),
        Arc::new(RepoStore::in_memory()),
        LocalHosts::with_names([]),
        Arc::new(NoTransport),
    )
    .unwrap();
    NodeServer::bind(Arc::new(router), "127.0.0.1:0").unwrap()
}

#[test]
fn test_malformed_frames() {
    let server = bare_node();
    let addr = server.local_addr();
    let handle = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.run())
    };

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(IO_TIMEOUT).unwrap();

    // bad JSON in a well-formed frame: answered, connection stays usable
    stream.write_all(&3u32.to_le_bytes()).unwrap();
    stream.write_all(b"{x}").unwrap();
    match read_message::<_, Response>(&mut stream).unwrap() {
        Response::Error(err) => assert_eq!(err.kind, ErrorKind::Validation),
        other => panic!("unexpected {other:?}"),
    }
    write_message(&mut stream, &Request::Ping).unwrap();
    assert!(matches!(read_message::<_, Response>(&mut stream).unwrap(), Response::Pong));

    // oversized frame: answered, then the connection is closed
    stream.write_all(&(MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes()).unwrap();
    match read_message::<_, Response>(&mut stream).unwrap() {
        Response::Error(err) => assert_eq!(err.kind, ErrorKind::Validation),
        other => panic!("unexpected {other:?}"),
    }
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap_or(0), 0);

    NodeClient::connect(&addr.to_string(), IO_TIMEOUT)
        .unwrap()
        .shutdown()
        .unwrap();
    handle.join().unwrap().unwrap();
}
