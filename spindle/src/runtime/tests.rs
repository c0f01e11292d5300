use super::*;
use crate as spindle;
use crate::net;
use crate::runtime::scheduler::PushKind;
use crate::task::{Task, TaskError};
use crate::test_utils::*;
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::io::{Read as _, Write as _};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Instant;

assert_impl_all!(scheduler::Scheduler: Send, Sync);
assert_impl_all!(scheduler::Handle: Send, Sync, Clone);
assert_impl_all!(Runtime: Send);
assert_impl_all!(Task<u32>: Send, Sync);

/// Echo until the peer disconnects. `WouldBlock` after readiness counts as
/// a short operation and simply re-awaits.
async fn echo(client: net::Socket) {
    let mut buf = [0u8; 1024];
    loop {
        let n = match client.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => break,
        };

        let mut written = 0;
        while written < n {
            match client.write(&buf[written..n]).await {
                Ok(m) => written += m,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => return,
            }
        }
    }
}

fn echo_client(port: u16, payload_len: usize) -> Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))?;

    let payload: Vec<u8> = (0..payload_len).map(|_| fastrand::u8(..)).collect();
    stream.write_all(&payload)?;

    let mut echoed = vec![0u8; payload_len];
    stream.read_exact(&mut echoed)?;
    anyhow::ensure!(echoed == payload, "echoed bytes differ from the payload");

    Ok(())
}

#[spindle::test(worker_threads = 2)]
async fn test_parent_resumes_after_child_completes() -> Result<()> {
    let child_ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&child_ran);
    let value = spindle::spawn(async move {
        flag.store(true, Ordering::SeqCst);
        41
    })
    .await;

    // Code after the await runs strictly after the child's completion and
    // observes its result.
    assert!(child_ran.load(Ordering::SeqCst));
    assert_eq!(value, Ok(41));
    Ok(())
}

#[spindle::test(worker_threads = 2)]
async fn test_children_return_values() -> Result<()> {
    let completions = Arc::new(AtomicUsize::new(0));

    let (c1, c2, cp) = (
        Arc::clone(&completions),
        Arc::clone(&completions),
        Arc::clone(&completions),
    );
    let parent = spindle::spawn(async move {
        let first = spindle::spawn(async move {
            c1.fetch_add(1, Ordering::SeqCst);
            42
        })
        .await
        .unwrap();

        // A task that is never spawned gets enqueued by its first await.
        let second = Task::new(async move {
            c2.fetch_add(1, Ordering::SeqCst);
            7
        })
        .await
        .unwrap();

        cp.fetch_add(1, Ordering::SeqCst);
        first + second
    });

    assert_eq!(parent.await, Ok(49));
    assert_eq!(completions.load(Ordering::SeqCst), 3);
    Ok(())
}

#[spindle::test(worker_threads = 2)]
async fn test_nested_awaits() -> Result<()> {
    let a = spindle::spawn(async {
        let b = spindle::spawn(async {
            let c = spindle::spawn(async { String::from("x") });
            let mut s = c.await.unwrap();
            s.push('!');
            s
        });
        b.await.unwrap()
    });

    assert_eq!(a.await.unwrap(), "x!");
    Ok(())
}

#[spindle::test(worker_threads = 2)]
async fn test_fire_and_forget_reclaims_frame() -> Result<()> {
    let drops = DropCounter::new();

    let guard = drops.guard();
    spindle::fire_and_forget(async move {
        let _frame = guard;
    });

    assert!(
        spin_until(Duration::from_secs(2), || drops.count() == 1),
        "frame was not reclaimed"
    );

    // A reclaimed frame must never be re-entered or dropped twice.
    spin_for(Duration::from_millis(20));
    assert_eq!(drops.count(), 1);
    Ok(())
}

#[spindle::test(worker_threads = 2)]
async fn test_panic_surfaces_at_awaiter() -> Result<()> {
    let res = spindle::spawn(async {
        panic!("boom");
    })
    .await;

    match res {
        Err(TaskError::Panicked(msg)) => assert!(msg.contains("boom")),
        other => panic!("expected a panicked task error, got {other:?}"),
    }
    Ok(())
}

#[spindle::test(worker_threads = 2)]
async fn test_worker_thread_names() -> Result<()> {
    let name = std::thread::current()
        .name()
        .expect("worker thread has a name")
        .to_owned();

    let (prefix, id) = name.rsplit_once('-').expect("name has an id suffix");
    assert_eq!(prefix, "spindle-worker");
    assert!(id.parse::<usize>().is_ok());
    Ok(())
}

// A task spawned once and later awaited enters a ready queue exactly
// 1 + (number of resumptions) times; the await itself must not re-enqueue
// an already-spawned child.
#[test]
fn test_enqueue_count_spawned_then_awaited() -> Result<()> {
    let runtime = Builder::new().worker_threads(2).build()?;
    let scheduler = runtime.scheduler();
    let reactor = runtime.reactor();

    let (rx, tx) = nix::unistd::pipe()?;
    let rx_fd = rx.as_raw_fd();
    reactor.register_fd(rx_fd);

    // Release the data only once the suspension reached the reactor (so
    // the fast path cannot short-circuit the count) and the parent had
    // time to wire its callback (so the child never cycles).
    let writer = {
        let reactor = reactor.clone();
        std::thread::spawn(move || {
            while reactor.registration_count() == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            std::thread::sleep(Duration::from_millis(10));
            nix::unistd::write(&tx, b"x").expect("write");
        })
    };

    let child_addr = runtime.run(async move {
        let child = spindle::spawn(async move {
            spindle::wait_for_read(rx_fd).await;
        });
        let addr = child.addr();
        child.await.unwrap();
        addr
    });

    writer.join().expect("writer thread");

    // One push from `spawn`, one from the I/O resumption; both remote.
    let kinds: Vec<_> = scheduler
        .tracker
        .pushes()
        .iter()
        .filter(|r| r.task == child_addr)
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds, vec![PushKind::Global, PushKind::Global]);

    Ok(())
}

#[test]
fn test_unspawned_child_enqueued_once() -> Result<()> {
    let runtime = Builder::new().worker_threads(2).build()?;
    let scheduler = runtime.scheduler();

    let child_addr = runtime.run(async move {
        let child = Task::new(async { 7 });
        let addr = child.addr();
        assert_eq!(child.await.unwrap(), 7);
        addr
    });

    // Enqueued exactly once, by the worker that observed the await, into
    // its own local queue.
    let kinds: Vec<_> = scheduler
        .tracker
        .pushes()
        .iter()
        .filter(|r| r.task == child_addr)
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds, vec![PushKind::Local]);

    Ok(())
}

// If readiness is immediate, the task never goes through the reactor.
#[test]
fn test_ready_fast_path_skips_reactor() -> Result<()> {
    let runtime = Builder::new().worker_threads(2).build()?;
    let reactor = runtime.reactor();

    let (rx, tx) = nix::unistd::pipe()?;
    nix::unistd::write(&tx, b"hello")?;
    let rx_fd = rx.as_raw_fd();

    runtime.run(async move {
        spindle::wait_for_read(rx_fd).await;
    });

    assert_eq!(reactor.registration_count(), 0);
    Ok(())
}

#[rstest]
#[case::two_workers(2)]
#[case::four_workers(4)]
fn test_compute_tasks_run_in_parallel(#[case] workers: usize) -> Result<()> {
    // Timing-based: meaningless without real parallelism.
    if std::thread::available_parallelism()?.get() < workers {
        return Ok(());
    }

    let spin = Duration::from_millis(50);
    let runtime = Builder::new().worker_threads(workers).build()?;

    let elapsed = runtime.run(async move {
        let started = Instant::now();

        let tasks: Vec<_> = (0..workers)
            .map(|_| spindle::spawn(async move { spin_for(spin) }))
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        started.elapsed()
    });

    let serial = spin * workers as u32;
    assert!(
        elapsed < serial,
        "{workers} compute tasks took {elapsed:?}, serial time is {serial:?}"
    );
    Ok(())
}

// Scenario: one client sends HELLO, reads the echo and disconnects; the
// handler task completes and is reclaimed.
#[test]
fn test_echo_single_client() -> Result<()> {
    let runtime = Builder::new().worker_threads(2).build()?;
    let drops = DropCounter::new();
    let (port_tx, port_rx) = mpsc::channel::<u16>();

    let client = std::thread::spawn(move || -> Result<Vec<u8>> {
        let port = port_rx.recv()?;
        let mut stream = TcpStream::connect(("127.0.0.1", port))?;
        stream.write_all(b"HELLO")?;

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf)?;
        Ok(buf.to_vec())
    });

    let handler_drops = drops.clone();
    runtime.run(async move {
        let listener = net::listen("127.0.0.1", 0);
        assert!(listener.is_valid());
        port_tx.send(listener.local_port().unwrap()).unwrap();

        let conn = listener.accept().await.unwrap();
        assert!(conn.is_valid());

        let guard = handler_drops.guard();
        spindle::fire_and_forget(async move {
            let _frame = guard;
            echo(conn).await;
        });

        // The handler completes once the client disconnects, and its frame
        // is destroyed exactly once.
        assert!(spin_until(Duration::from_secs(5), || handler_drops.count() == 1));
    });

    let echoed = client.join().expect("client thread")?;
    assert_eq!(echoed, b"HELLO");
    assert_eq!(drops.count(), 1);
    Ok(())
}

// Scenario: two clients connect back to back and each gets an exact echo
// of 1 KiB of random bytes; both handler tasks complete and are reclaimed.
#[test]
fn test_echo_two_concurrent_clients() -> Result<()> {
    const PAYLOAD_LEN: usize = 1024;

    let runtime = Builder::new().worker_threads(4).build()?;
    let drops = DropCounter::new();
    let (port_tx, port_rx) = mpsc::channel::<u16>();

    let clients = std::thread::spawn(move || -> Result<()> {
        let port = port_rx.recv()?;
        let first = std::thread::spawn(move || echo_client(port, PAYLOAD_LEN));
        let second = std::thread::spawn(move || echo_client(port, PAYLOAD_LEN));
        first.join().expect("first client")?;
        second.join().expect("second client")?;
        Ok(())
    });

    let handler_drops = drops.clone();
    runtime.run(async move {
        let listener = net::listen("127.0.0.1", 0);
        assert!(listener.is_valid());
        port_tx.send(listener.local_port().unwrap()).unwrap();

        for _ in 0..2 {
            let conn = listener.accept().await.unwrap();
            let guard = handler_drops.guard();
            spindle::fire_and_forget(async move {
                let _frame = guard;
                echo(conn).await;
            });
        }

        assert!(spin_until(Duration::from_secs(5), || handler_drops.count() == 2));
    });

    clients.join().expect("client threads")?;
    assert_eq!(drops.count(), 2);
    Ok(())
}

// Scenario: shutdown while a handler is still blocked on read. The workers
// exit after their current step, the reactor joins within a poll interval
// and the suspended task is leaked, not cancelled.
#[test]
fn test_shutdown_with_blocked_reader() -> Result<()> {
    let runtime = Builder::new()
        .worker_threads(2)
        .poll_interval(Duration::from_millis(10))
        .build()?;

    let (rx, tx) = nix::unistd::pipe()?;
    let rx_fd = rx.into_raw_fd();

    let started = Instant::now();
    runtime.run(async move {
        let sock = net::Socket::from_fd(rx_fd);
        spindle::fire_and_forget(async move {
            let mut buf = [0u8; 8];
            // Never becomes ready; the task stays suspended on the reactor.
            let _ = sock.read(&mut buf).await;
        });

        // Let the handler reach the reactor before shutting down.
        spin_for(Duration::from_millis(50));
    });

    // `run` returning means every worker and the reactor thread joined.
    assert!(started.elapsed() < Duration::from_secs(2));
    drop(tx);
    Ok(())
}

#[test]
fn test_builder_validation() {
    assert!(Builder::new().local_queue_limit(0).build().is_err());
    assert!(Builder::new().poll_interval(Duration::ZERO).build().is_err());
    assert!(Builder::new().worker_threads(1).build().is_ok());
}

#[test]
fn test_thread_name_fn() -> Result<()> {
    let runtime = Builder::new()
        .worker_threads(1)
        .thread_name_fn(|| "custom-worker".into())
        .build()?;

    let name = runtime.run(async {
        std::thread::current().name().map(str::to_owned)
    });

    assert_eq!(name.as_deref(), Some("custom-worker"));
    Ok(())
}
