//! TCP echo server: one listener task, one fire-and-forget handler per
//! client. Run with `cargo run --example echo`, then `nc 127.0.0.1 8080`;
//! Ctrl-C shuts the runtime down.

use spindle::net::{self, Socket};
use std::io::ErrorKind;

const PORT: u16 = 8080;

async fn handle_client(client: Socket) {
    let mut buf = [0u8; 1024];

    loop {
        let n = match client.read(&mut buf).await {
            Ok(0) => {
                tracing::info!(fd = client.fd(), "client disconnected");
                break;
            }
            Ok(n) => n,
            // Readiness was stale; treat as a short read and re-await.
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => {
                tracing::warn!(fd = client.fd(), error = %e, "read failed");
                break;
            }
        };

        tracing::info!(fd = client.fd(), bytes = n, "echoing");

        let mut written = 0;
        while written < n {
            match client.write(&buf[written..n]).await {
                Ok(m) => written += m,
                Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
                Err(e) => {
                    tracing::warn!(fd = client.fd(), error = %e, "write failed");
                    return;
                }
            }
        }
    }
}

async fn echo_server(port: u16) -> i32 {
    let listener = net::listen("0.0.0.0", port);
    if !listener.is_valid() {
        tracing::error!("failed to create the listening socket");
        return 1;
    }

    tracing::info!(fd = listener.fd(), port, "server listening");

    loop {
        match listener.accept().await {
            Ok(client) => {
                tracing::info!(fd = client.fd(), "new client connected");
                spindle::fire_and_forget(handle_client(client));
            }
            Err(e) => tracing::warn!(error = %e, "failed to accept connection"),
        }
    }
}

extern "C" fn on_sigint(_: i32) {
    spindle::shutdown_and_exit(0);
}

#[spindle::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // Every runtime thread carries the runtime context, so the handler can
    // stop the scheduler and the reactor from wherever it is delivered.
    unsafe {
        use nix::sys::signal::{self, SigHandler, Signal};
        signal::signal(Signal::SIGINT, SigHandler::Handler(on_sigint))
            .expect("failed to install the SIGINT handler");
    }

    let code = echo_server(PORT).await;
    spindle::shutdown_and_exit(code);
}
