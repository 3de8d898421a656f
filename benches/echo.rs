use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread::spawn,
    time::Duration,
};

use criterion::*;
use dualsock::{SocketConfig, SocketContext, StreamSocket};

fn setup_std_server() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")?;

    let addr = listener.local_addr()?;

    spawn(move || -> anyhow::Result<()> {
        loop {
            let (mut conn, _) = listener.accept()?;

            spawn(move || -> anyhow::Result<()> {
                let mut buff = [0u8; 11];

                loop {
                    conn.read_exact(&mut buff)?;
                    conn.write_all(&buff)?;
                }
            });
        }
    });

    Ok(addr)
}

fn std_client(conn: &mut TcpStream) -> anyhow::Result<()> {
    let mut buff = [0u8; 11];

    conn.write_all(&b"hello world"[..])?;

    conn.read_exact(&mut buff)?;

    assert_eq!(&buff, b"hello world");

    Ok(())
}

fn bench_std(c: &mut Criterion) {
    let addr = setup_std_server().unwrap();

    let mut conn = TcpStream::connect(addr).unwrap();

    c.bench_function("echo std", |b| b.iter(|| std_client(&mut conn).unwrap()));
}

fn setup_dualsock_server(ctx: SocketContext) -> anyhow::Result<SocketAddr> {
    let listener = ctx.stream()?;

    listener.bind("127.0.0.1:0".parse()?)?;

    listener.listen(0)?;

    let addr = listener.local_addr()?;

    spawn(move || -> anyhow::Result<()> {
        loop {
            let conn = listener.accept(Duration::ZERO)?;

            log::debug!("accept {}", conn.peer_addr()?);

            spawn(move || -> anyhow::Result<()> {
                let mut reader = conn.input_stream();
                let mut writer = conn.output_stream();

                let mut buff = [0u8; 11];

                loop {
                    reader.read_exact(&mut buff)?;
                    writer.write_all(&buff)?;
                }
            });
        }
    });

    Ok(addr)
}

fn dualsock_client(conn: &StreamSocket) -> anyhow::Result<()> {
    let mut buff = [0u8; 11];

    conn.write_all(&b"hello world"[..])?;

    conn.input_stream().read_exact(&mut buff)?;

    assert_eq!(&buff, b"hello world");

    Ok(())
}

fn bench_dualsock(c: &mut Criterion) {
    _ = pretty_env_logger::try_init();

    for (name, config) in [
        ("echo dualsock", SocketConfig::default()),
        (
            "echo dualsock two-descriptor",
            SocketConfig::default().with_force_two_descriptor(true),
        ),
    ] {
        let ctx = SocketContext::new(config);

        let addr = setup_dualsock_server(ctx.clone()).unwrap();

        let conn = ctx.stream().unwrap();

        conn.connect(addr, Duration::from_secs(5)).unwrap();

        c.bench_function(name, |b| b.iter(|| dualsock_client(&conn).unwrap()));
    }
}

criterion_group!(benches, bench_dualsock, bench_std);
criterion_main!(benches);
