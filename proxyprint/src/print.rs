//! Payload rendering and the print sink.
//!
//! Every relayed chunk can be rendered to a human-readable block and handed
//! to a single dedicated print-consuming task. The handoff is a bounded,
//! non-blocking queue: printing must never slow the relay hot path, so when
//! the queue is full the event is dropped rather than applying backpressure.

/// How relayed payload bytes are rendered when emitted to the print sink.
///
/// Serialized as the integers `0..=4` for compatibility with existing config
/// files; anything out of range is rejected at parse time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum PrintStatus {
    /// No output.
    #[default]
    None,
    /// Payload rendered as a (lossy) UTF-8 string.
    AsString,
    /// Payload rendered as a byte-array literal.
    AsBytesLiteral,
    /// Payload rendered as a lowercase hex bytestring.
    LowerHexBytes,
    /// Payload rendered as an uppercase hex bytestring.
    UpperHexBytes,
}

impl PrintStatus {
    pub fn is_none(&self) -> bool {
        matches!(self, PrintStatus::None)
    }

    /// Renders one relayed chunk, or `None` for [`PrintStatus::None`].
    pub fn render(&self, bytes: &[u8], from: &str, to: &str) -> Option<String> {
        let body = match self {
            PrintStatus::None => return None,
            PrintStatus::AsString => String::from_utf8_lossy(bytes).into_owned(),
            PrintStatus::AsBytesLiteral => format!("{bytes:?}"),
            PrintStatus::LowerHexBytes => bytes.iter().map(|b| format!("{b:02x}")).collect(),
            PrintStatus::UpperHexBytes => bytes.iter().map(|b| format!("{b:02X}")).collect(),
        };
        Some(format!(
            "{from} => {to} ({len} bytes)\n\
             -------------------\n\
             {body}\n\
             ===================\n",
            len = bytes.len(),
        ))
    }
}

impl TryFrom<i64> for PrintStatus {
    type Error = String;

    fn try_from(n: i64) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(PrintStatus::None),
            1 => Ok(PrintStatus::AsString),
            2 => Ok(PrintStatus::AsBytesLiteral),
            3 => Ok(PrintStatus::LowerHexBytes),
            4 => Ok(PrintStatus::UpperHexBytes),
            _ => Err(format!("invalid value: {n}")),
        }
    }
}

impl From<PrintStatus> for i64 {
    fn from(status: PrintStatus) -> i64 {
        status as i64
    }
}

impl std::fmt::Display for PrintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as i64)
    }
}

impl std::str::FromStr for PrintStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: i64 = s.parse().map_err(|_| format!("invalid value: {s}"))?;
        PrintStatus::try_from(n)
    }
}

/// Bound on queued print events; excess events are dropped, not blocked on.
const PRINT_QUEUE_CAP: usize = 50;

struct PrintEvent {
    line: String,
    from_server: bool,
}

/// Handle to the dedicated print-consuming task.
///
/// Cloned into every relay direction; [`PrintSink::emit`] renders and
/// enqueues without ever awaiting.
#[derive(Clone)]
pub struct PrintSink {
    tx: tokio::sync::mpsc::Sender<PrintEvent>,
}

enum Dest {
    Stdout,
    File(tokio::fs::File),
}

impl Dest {
    async fn open(path: &str) -> std::io::Result<Self> {
        if path.is_empty() {
            return Ok(Dest::Stdout);
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Dest::File(file))
    }

    async fn write(&mut self, line: &str) {
        use tokio::io::AsyncWriteExt;
        let res = match self {
            Dest::Stdout => {
                let mut out = tokio::io::stdout();
                match out.write_all(line.as_bytes()).await {
                    Ok(()) => out.flush().await,
                    Err(err) => Err(err),
                }
            }
            Dest::File(file) => file.write_all(line.as_bytes()).await,
        };
        if let Err(err) = res {
            tracing::warn!("error writing print output: {err}");
        }
    }
}

impl PrintSink {
    /// Opens the output destinations and spawns the drain task.
    pub async fn start(
        client_file: &str,
        server_file: &str,
    ) -> std::io::Result<(Self, tokio::task::JoinHandle<()>)> {
        let mut client_dest = Dest::open(client_file).await?;
        let mut server_dest = Dest::open(server_file).await?;
        let (tx, mut rx) = tokio::sync::mpsc::channel::<PrintEvent>(PRINT_QUEUE_CAP);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let dest = if event.from_server {
                    &mut server_dest
                } else {
                    &mut client_dest
                };
                dest.write(&event.line).await;
            }
        });
        Ok((Self { tx }, task))
    }

    fn emit(&self, line: String, from_server: bool) {
        // Dropped on a full queue; the relay never waits on the printer.
        let _ = self.tx.try_send(PrintEvent { line, from_server });
    }
}

/// Per-direction printer handed to a relay pipe.
#[derive(Clone)]
pub struct Printer {
    status: PrintStatus,
    sink: Option<PrintSink>,
    from_server: bool,
}

impl Printer {
    pub fn new(status: PrintStatus, sink: Option<PrintSink>, from_server: bool) -> Self {
        Self {
            status,
            sink,
            from_server,
        }
    }

    /// A printer that renders nothing.
    pub fn disabled() -> Self {
        Self::new(PrintStatus::None, None, false)
    }

    /// Renders and enqueues one relayed chunk. Never blocks.
    pub fn emit(&self, bytes: &[u8], from: &str, to: &str) {
        let Some(sink) = &self.sink else { return };
        if let Some(line) = self.status.render(bytes, from, to) {
            sink.emit(line, self.from_server);
        }
    }
}
