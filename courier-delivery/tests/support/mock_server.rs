//! Scripted SMTP server for delivery tests.
//!
//! Every command gets the response configured through the builder, the
//! full command stream is recorded for assertions, and connections are
//! counted so tests can verify pooling and the no-network guarantees.

#![allow(dead_code)] // shared test fixture, not every test uses every knob

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    MessageContent(String),
    Noop,
    Rset,
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Scripted {
    code: u16,
    message: String,
}

impl Scripted {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct ServerScript {
    greeting: Scripted,
    ehlo_capabilities: Vec<String>,
    mail_from: Scripted,
    rcpt_to: Scripted,
    data: Scripted,
    data_end: Scripted,
    drop_after_commands: Option<usize>,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            greeting: Scripted::new(220, "mx.test ESMTP ready"),
            ehlo_capabilities: vec!["mx.test".to_owned(), "SIZE 35882577".to_owned()],
            mail_from: Scripted::new(250, "OK"),
            rcpt_to: Scripted::new(250, "OK"),
            data: Scripted::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Scripted::new(250, "2.0.0 OK queued"),
            drop_after_commands: None,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<ReceivedCommand>>>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: ServerScript::default(),
        }
    }

    /// Server listening on the default script, for the happy path.
    pub async fn start() -> std::io::Result<Self> {
        Self::builder().build().await
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// How many TCP connections have been accepted.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub async fn commands(&self) -> Vec<ReceivedCommand> {
        self.commands.read().await.clone()
    }

    /// Message bodies received, in arrival order.
    pub async fn messages(&self) -> Vec<String> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|cmd| match cmd {
                ReceivedCommand::MessageContent(body) => Some(body.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle_client(
        mut stream: TcpStream,
        script: Arc<ServerScript>,
        commands: Arc<RwLock<Vec<ReceivedCommand>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut handled = 0_usize;

        writer.write_all(&script.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            line.clear();
            if script.drop_after_commands.is_some_and(|n| handled >= n) {
                return Ok(());
            }

            let read = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await;
            let Ok(Ok(n)) = read else { return Ok(()) };
            if n == 0 {
                return Ok(());
            }
            handled += 1;

            let trimmed = line.trim();
            let (verb, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));

            let (reply, command) = match verb.to_uppercase().as_str() {
                "EHLO" => {
                    let mut reply = String::new();
                    let last = script.ehlo_capabilities.len().saturating_sub(1);
                    for (i, cap) in script.ehlo_capabilities.iter().enumerate() {
                        let sep = if i < last { '-' } else { ' ' };
                        let _ = write!(&mut reply, "250{sep}{cap}\r\n");
                    }
                    (reply.into_bytes(), ReceivedCommand::Ehlo(rest.to_owned()))
                }
                "HELO" => (
                    Scripted::new(250, "Hello").to_bytes(),
                    ReceivedCommand::Helo(rest.to_owned()),
                ),
                "MAIL" => (
                    script.mail_from.to_bytes(),
                    ReceivedCommand::MailFrom(rest.to_owned()),
                ),
                "RCPT" => (
                    script.rcpt_to.to_bytes(),
                    ReceivedCommand::RcptTo(rest.to_owned()),
                ),
                "DATA" => (script.data.to_bytes(), ReceivedCommand::Data),
                "NOOP" => (Scripted::new(250, "OK").to_bytes(), ReceivedCommand::Noop),
                "RSET" => (Scripted::new(250, "OK").to_bytes(), ReceivedCommand::Rset),
                "QUIT" => {
                    commands.write().await.push(ReceivedCommand::Quit);
                    writer.write_all(&Scripted::new(221, "Bye").to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    Scripted::new(500, "Unknown command").to_bytes(),
                    ReceivedCommand::Other(trimmed.to_owned()),
                ),
            };

            commands.write().await.push(command.clone());
            writer.write_all(&reply).await?;
            writer.flush().await?;

            if command == ReceivedCommand::Data && script.data.code == 354 {
                let mut body = String::new();
                loop {
                    line.clear();
                    let n = reader.read_line(&mut line).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    if line.trim_end() == "." {
                        break;
                    }
                    // Strip transparency dot-stuffing like a real server.
                    match line.strip_prefix('.') {
                        Some(rest) => body.push_str(rest),
                        None => body.push_str(&line),
                    }
                }
                commands
                    .write()
                    .await
                    .push(ReceivedCommand::MessageContent(body));
                writer.write_all(&script.data_end.to_bytes()).await?;
                writer.flush().await?;
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: ServerScript,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.greeting = Scripted::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from = Scripted::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.rcpt_to = Scripted::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data = Scripted::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Scripted::new(code, message);
        self
    }

    /// Silently close the connection after the Nth command.
    #[must_use]
    pub const fn with_drop_after_commands(mut self, count: usize) -> Self {
        self.script.drop_after_commands = Some(count);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let script = Arc::clone(&script);
            let commands = Arc::clone(&commands);
            let connections = Arc::clone(&connections);
            let shutdown = Arc::clone(&shutdown);

            tokio::spawn(async move {
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let accepted =
                        timeout(Duration::from_millis(100), listener.accept()).await;
                    if let Ok(Ok((stream, _))) = accepted {
                        connections.fetch_add(1, Ordering::Relaxed);
                        let script = Arc::clone(&script);
                        let commands = Arc::clone(&commands);
                        tokio::spawn(async move {
                            let _ = MockSmtpServer::handle_client(stream, script, commands)
                                .await;
                        });
                    }
                }
            });
        }

        Ok(MockSmtpServer {
            addr,
            commands,
            connections,
            shutdown,
        })
    }
}
