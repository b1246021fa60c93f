//! Server-wide shutdown: `/shutdown`, handle-driven shutdown, and drain.

use std::{net::SocketAddr, time::Duration};

use linechat_server::{Server, ServerConfig, ServerHandle, ServerPhase};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (ServerHandle, JoinHandle<Result<(), linechat_server::ServerError>>) {
    let server = Server::bind(ServerConfig::local()).await.unwrap();
    let handle = server.handle();
    (handle, tokio::spawn(server.run()))
}

/// Connect and register; returns the connection positioned after the
/// welcome line.
async fn join(addr: SocketAddr, name: &str) -> BufReader<TcpStream> {
    let mut stream = BufReader::new(TcpStream::connect(addr).await.unwrap());
    let mut line = String::new();

    stream.read_line(&mut line).await.unwrap();
    assert_eq!(line, "What's your name?\n");
    stream.get_mut().write_all(format!("{name}\n").as_bytes()).await.unwrap();

    line.clear();
    stream.read_line(&mut line).await.unwrap();
    assert_eq!(line, format!("Welcome to the chat, {name}!\n"));
    stream
}

/// Read until EOF; returns the number of bytes read before it.
async fn read_to_eof(stream: &mut BufReader<TcpStream>) -> usize {
    let mut total = 0;
    let mut line = String::new();
    loop {
        line.clear();
        let n = timeout(WAIT, stream.read_line(&mut line)).await.expect("no EOF").unwrap_or(0);
        if n == 0 {
            return total;
        }
        total += n;
    }
}

#[tokio::test]
async fn shutdown_command_terminates_everyone() {
    let (handle, run) = start_server().await;
    let addr = handle.local_addr();

    let mut admin = join(addr, "admin").await;
    let mut idle = join(addr, "idle").await;
    // Connected but never named: blocked waiting for a name
    let mut anonymous = BufReader::new(TcpStream::connect(addr).await.unwrap());

    admin.get_mut().write_all(b"/shutdown\n").await.unwrap();

    read_to_eof(&mut admin).await;
    read_to_eof(&mut idle).await;
    read_to_eof(&mut anonymous).await;

    let result = timeout(WAIT, run).await.expect("server did not stop").unwrap();
    assert!(result.is_ok());
    assert_eq!(handle.phase(), ServerPhase::Stopped);
    assert_eq!(handle.live_sessions(), 0);
    assert_eq!(handle.named_sessions(), 0);
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (handle, run) = start_server().await;
    let addr = handle.local_addr();

    handle.shutdown();
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();

    // Listener is gone; a late client is refused or immediately closed
    match TcpStream::connect(addr).await {
        Err(_) => {},
        Ok(stream) => {
            let mut late = BufReader::new(stream);
            assert_eq!(read_to_eof(&mut late).await, 0);
        },
    }
}

#[tokio::test]
async fn shutdown_with_no_clients_completes() {
    let (handle, run) = start_server().await;
    assert_eq!(handle.phase(), ServerPhase::Accepting);

    handle.shutdown();
    assert!(handle.is_terminating());

    timeout(WAIT, handle.drained()).await.unwrap();
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(handle.phase(), ServerPhase::Stopped);
}

#[tokio::test]
async fn repeated_shutdown_is_harmless() {
    let (handle, run) = start_server().await;
    let addr = handle.local_addr();
    let mut client = join(addr, "gina").await;

    handle.shutdown();
    handle.shutdown();
    client.get_mut().write_all(b"/shutdown\n").await.ok();

    read_to_eof(&mut client).await;
    timeout(WAIT, run).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn many_clients_drain() {
    let (handle, run) = start_server().await;
    let addr = handle.local_addr();

    let mut clients = Vec::new();
    for i in 0..20 {
        clients.push(join(addr, &format!("user{i}")).await);
    }
    // Some chatter in flight while shutting down
    for (i, client) in clients.iter_mut().enumerate().take(5) {
        client.get_mut().write_all(format!("hello from {i}\n").as_bytes()).await.unwrap();
    }

    handle.shutdown();

    for client in &mut clients {
        read_to_eof(client).await;
    }
    timeout(WAIT, run).await.expect("server did not drain").unwrap().unwrap();
    assert_eq!(handle.live_sessions(), 0);
}
