//! Stand-in for jsockd used by the integration tests. Only built with the
//! `mock` feature.
//!
//! Accepts the same command line (`-b 00 [-m ..] [-sm ..] [-i ..] [-t ..] -s --
//! <sockets..>`), binds the sockets, prints `READY <n> <version>` and serves
//! a fixed set of queries instead of evaluating JavaScript:
//!
//! | query                  | behaviour                                          |
//! |------------------------|----------------------------------------------------|
//! | `echo`                 | `ok <param>`                                       |
//! | `increment`            | `ok <param + 1>`                                   |
//! | `throw`                | `exception "boom"`                                 |
//! | `messages`             | messages `"foo"` and `"bar"`, then `ok <2nd reply>`|
//! | `message_echo`         | message `<param>`, then `ok <reply>`               |
//! | `message_then_throw`   | message `<param>`, then `exception "after message"`|
//! | `mismatch`             | `ok` with the wrong id                             |
//! | `malformed`            | a line with an unknown status                      |
//! | `sleep <ms>`           | waits, then `ok null`                              |
//! | `crash`                | exits with status 3                                |
//! | `pid`                  | `ok <pid>`                                         |
//! | `log`                  | writes a multi-line log message, then `ok null`    |
//!
//! Test knobs, all environment variables:
//! - `JSOCKD_MOCK_READY`: replaces the READY line; `none` prints nothing
//! - `JSOCKD_MOCK_VERSION`: version in the READY line
//! - `JSOCKD_MOCK_THREADS`: count in the READY line
//! - `JSOCKD_MOCK_IGNORE_SIGTERM`: if set, SIGTERM is ignored

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

const VERSION: &str = "0.0.139";

struct Args {
    sockets: Vec<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let mut sockets = Vec::new();
    let mut separator = false;
    while let Some(arg) = args.next() {
        if separator {
            sockets.push(PathBuf::from(arg));
            continue;
        }
        match arg.as_str() {
            "-b" => {
                let sep = args.next().ok_or("-b needs a value")?;
                if sep != "00" {
                    return Err(format!("unsupported record separator {sep}"));
                }
            }
            "-m" | "-sm" | "-i" | "-t" => {
                args.next().ok_or(format!("{arg} needs a value"))?;
            }
            "-s" => {}
            "--" => separator = true,
            other => return Err(format!("unexpected argument {other}")),
        }
    }
    if sockets.is_empty() {
        return Err("no sockets given".to_string());
    }
    Ok(Args { sockets })
}

fn log(marker: char, level: &str, message: &str) {
    let prefix = std::env::var("JSOCKD_LOG_PREFIX")
        .map(|p| format!("{p} "))
        .unwrap_or_default();
    let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{prefix}{marker} jsockd {ts} [{level}] {message}");
}

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conn {
    /// Next NUL-terminated field, or None at end of stream.
    async fn field(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = Vec::new();
        if self.reader.read_until(0, &mut buf).await? == 0 {
            return Ok(None);
        }
        if buf.pop() != Some(0) {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    async fn send(&mut self, id: &str, status: &str, payload: &str) -> std::io::Result<()> {
        self.writer
            .write_all(format!("{id} {status} {payload}\n").as_bytes())
            .await
    }

    /// Send a message and return the client's reply.
    async fn message(&mut self, id: &str, payload: &str) -> std::io::Result<Option<String>> {
        self.send(id, "message", payload).await?;
        let Some(_reply_id) = self.field().await? else {
            return Ok(None);
        };
        self.field().await
    }
}

async fn serve(stream: UnixStream) -> std::io::Result<()> {
    let (r, w) = stream.into_split();
    let mut conn = Conn {
        reader: BufReader::new(r),
        writer: w,
    };
    loop {
        let Some(id) = conn.field().await? else {
            return Ok(());
        };
        let (Some(query), Some(param)) = (conn.field().await?, conn.field().await?) else {
            return Ok(());
        };
        match query.as_str() {
            "echo" => conn.send(&id, "ok", &param).await?,
            "increment" => match param.trim().parse::<i64>() {
                Ok(n) => conn.send(&id, "ok", &(n + 1).to_string()).await?,
                Err(_) => conn.send(&id, "exception", "\"not a number\"").await?,
            },
            "throw" => conn.send(&id, "exception", "\"boom\"").await?,
            "messages" => {
                let Some(_) = conn.message(&id, "\"foo\"").await? else {
                    return Ok(());
                };
                let Some(second) = conn.message(&id, "\"bar\"").await? else {
                    return Ok(());
                };
                conn.send(&id, "ok", &second).await?;
            }
            "message_echo" => {
                let Some(reply) = conn.message(&id, &param).await? else {
                    return Ok(());
                };
                conn.send(&id, "ok", &reply).await?;
            }
            "message_then_throw" => {
                let Some(_) = conn.message(&id, &param).await? else {
                    return Ok(());
                };
                conn.send(&id, "exception", "\"after message\"").await?;
            }
            "mismatch" => {
                let wrong = id.parse::<u64>().map_or(0, |n| n + 1_000_000);
                conn.send(&wrong.to_string(), "ok", "1").await?;
            }
            "malformed" => conn.send(&id, "done", "1").await?,
            "crash" => {
                log('$', "ERROR", "crashing on request");
                std::process::exit(3);
            }
            "pid" => conn.send(&id, "ok", &std::process::id().to_string()).await?,
            "log" => {
                log('*', "WARN", "first line");
                log('$', "WARN", "second line");
                conn.send(&id, "ok", "null").await?;
            }
            q => {
                if let Some(ms) = q.strip_prefix("sleep ").and_then(|ms| ms.parse::<u64>().ok()) {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    conn.send(&id, "ok", "null").await?;
                } else {
                    conn.send(&id, "exception", "\"unknown query\"").await?;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("jsockd_mock: {e}");
            std::process::exit(2);
        }
    };

    if std::env::var_os("JSOCKD_MOCK_IGNORE_SIGTERM").is_some() {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::spawn(async move {
                    while sigterm.recv().await.is_some() {
                        log('$', "INFO", "ignoring SIGTERM");
                    }
                });
            }
            Err(e) => eprintln!("jsockd_mock: {e}"),
        }
    }

    log('$', "INFO", "starting");
    println!("mock jsockd starting");

    let mut listeners = Vec::with_capacity(args.sockets.len());
    for path in &args.sockets {
        let _ = std::fs::remove_file(path);
        match UnixListener::bind(path) {
            Ok(listener) => listeners.push(listener),
            Err(e) => {
                eprintln!("jsockd_mock: bind {}: {e}", path.display());
                std::process::exit(2);
            }
        }
    }
    log(
        '$',
        "INFO",
        &format!("listening on {} sockets", listeners.len()),
    );

    let ready = std::env::var("JSOCKD_MOCK_READY").unwrap_or_else(|_| {
        let threads = std::env::var("JSOCKD_MOCK_THREADS")
            .unwrap_or_else(|_| listeners.len().to_string());
        let version = std::env::var("JSOCKD_MOCK_VERSION").unwrap_or_else(|_| VERSION.to_string());
        format!("READY {threads} {version}")
    });
    if ready != "none" {
        println!("{ready}");
    }
    let _ = std::io::stdout().flush();

    let mut tasks = Vec::new();
    for listener in listeners {
        tasks.push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream).await {
                                eprintln!("jsockd_mock: connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        eprintln!("jsockd_mock: accept: {e}");
                        return;
                    }
                }
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}
