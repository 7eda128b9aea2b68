//! A loopback SMTP relay for tests.
//!
//! Speaks just enough SMTP for lettre to deliver a message, records every
//! accepted transaction and answers `RCPT TO` and end-of-data with
//! configurable replies.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// A transaction the relay accepted.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: Vec<u8>,
}

/// Replies sent for `RCPT TO` and for the end of `DATA`.
#[derive(Debug, Clone, Copy)]
pub struct Replies {
    pub rcpt: &'static str,
    pub data: &'static str,
}

impl Default for Replies {
    fn default() -> Self {
        Self {
            rcpt: "250 OK",
            data: "250 OK queued",
        }
    }
}

#[derive(Debug)]
pub struct StubRelay {
    pub port: u16,
    received: Arc<Mutex<Vec<Transaction>>>,
}

impl StubRelay {
    /// Binds to a free loopback port and serves connections in the background.
    pub async fn start(replies: Replies) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let sink = sink.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, replies, sink).await {
                        log::error!("Stub relay connection failed: {}", e);
                    }
                });
            }
        });

        Ok(Self { port, received })
    }

    /// Returns every transaction accepted so far.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.received
            .lock()
            .map(|received| received.clone())
            .unwrap_or_default()
    }
}

fn angle_address(cmd: &str) -> String {
    let start = cmd.find('<').map_or(0, |i| i + 1);
    let end = cmd.rfind('>').unwrap_or(cmd.len());
    cmd.get(start..end).unwrap_or_default().to_string()
}

async fn handle_connection(
    socket: TcpStream,
    replies: Replies,
    sink: Arc<Mutex<Vec<Transaction>>>,
) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut transaction = Transaction::default();

    writer.write_all(b"220 stub relay ESMTP\r\n").await?;

    'connection: loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break 'connection;
        }
        let Some(cmd) = line.strip_suffix("\r\n") else {
            break 'connection;
        };
        let upper = cmd.to_uppercase();

        if upper.starts_with("HELO") || upper.starts_with("EHLO") {
            writer.write_all(b"250 stub relay\r\n").await?;
        } else if upper.starts_with("MAIL FROM:") {
            transaction = Transaction {
                mail_from: angle_address(cmd),
                ..Transaction::default()
            };
            writer.write_all(b"250 OK\r\n").await?;
        } else if upper.starts_with("RCPT TO:") {
            if replies.rcpt.starts_with('2') {
                transaction.rcpt_to.push(angle_address(cmd));
            }
            writer
                .write_all(format!("{}\r\n", replies.rcpt).as_bytes())
                .await?;
        } else if upper.starts_with("DATA") {
            writer
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;
            let mut data_line = String::new();
            'data_read: loop {
                data_line.clear();
                if reader.read_line(&mut data_line).await? == 0 {
                    break 'connection;
                }
                if data_line == ".\r\n" {
                    break 'data_read;
                }
                transaction.data.extend_from_slice(data_line.as_bytes());
            }

            if replies.data.starts_with('2')
                && let Ok(mut received) = sink.lock()
            {
                received.push(std::mem::take(&mut transaction));
            }
            writer
                .write_all(format!("{}\r\n", replies.data).as_bytes())
                .await?;
        } else if upper.starts_with("QUIT") {
            writer.write_all(b"221 OK\r\n").await?;
            break 'connection;
        } else if upper.starts_with("RSET") {
            transaction = Transaction::default();
            writer.write_all(b"250 OK\r\n").await?;
        } else {
            writer.write_all(b"250 OK\r\n").await?;
        }
    }

    Ok(())
}
