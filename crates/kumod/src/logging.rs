//! The disposition log: a JSON-lines event stream recording every
//! message state transition, written by a dedicated thread as
//! zstd-compressed, size-rotated segment files.
use chrono::Utc;
use kumo_log_types::{JsonLogRecord, RecordType, ResolvedAddress, Response};
use message::Message;
use serde::Deserialize;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::thread::JoinHandle;
use uuid::Uuid;
use zstd::stream::write::{AutoFinishEncoder, Encoder};

static LOGGER: OnceLock<Logger> = OnceLock::new();
static NODEID: OnceLock<Uuid> = OnceLock::new();

/// The id of this node, stamped into every log record
pub fn nodeid() -> Uuid {
    *NODEID.get_or_init(Uuid::new_v4)
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LogFileParams {
    /// Where to place the log files
    pub log_dir: PathBuf,
    /// How many uncompressed bytes to allow per file segment
    #[serde(default = "LogFileParams::default_max_file_size")]
    pub max_file_size: u64,
    /// Maximum number of outstanding items to be logged before
    /// submission blocks; bounds the cost of a logging stall
    #[serde(default = "LogFileParams::default_back_pressure")]
    pub back_pressure: usize,

    /// The zstd compression level.
    /// 0 selects the zstd default (currently 3)
    #[serde(default = "LogFileParams::default_compression_level")]
    pub compression_level: i32,
}

impl LogFileParams {
    fn default_max_file_size() -> u64 {
        1_000_000_000
    }
    fn default_back_pressure() -> usize {
        128_000
    }
    fn default_compression_level() -> i32 {
        0
    }
}

enum LogCommand {
    Record(std::sync::Arc<JsonLogRecord>),
    Terminate,
}

pub struct Logger {
    sender: flume::Sender<LogCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Logger {
    pub fn get() -> Option<&'static Logger> {
        LOGGER.get()
    }

    pub fn init(params: LogFileParams) -> anyhow::Result<()> {
        use anyhow::Context;
        std::fs::create_dir_all(&params.log_dir)
            .with_context(|| format!("creating log directory {}", params.log_dir.display()))?;

        let (sender, receiver) = flume::bounded(params.back_pressure);
        let thread = std::thread::Builder::new()
            .name("disposition-logger".to_string())
            .spawn(move || Self::logger_thread(params, receiver))?;

        let logger = Self {
            sender,
            thread: Mutex::new(Some(thread)),
        };

        LOGGER
            .set(logger)
            .map_err(|_| anyhow::anyhow!("logger already initialized"))?;
        Ok(())
    }

    fn logger_thread(params: LogFileParams, receiver: flume::Receiver<LogCommand>) {
        struct OpenedFile {
            file: AutoFinishEncoder<'static, File>,
            name: PathBuf,
            written: u64,
        }

        let mut file: Option<OpenedFile> = None;

        fn do_record(
            params: &LogFileParams,
            file: &mut Option<OpenedFile>,
            record: &JsonLogRecord,
        ) -> anyhow::Result<()> {
            use anyhow::Context;
            if file.is_none() {
                let now = Utc::now();
                let name = params.log_dir.join(now.format("%Y%m%d-%H%M%S").to_string());

                let f = std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&name)
                    .with_context(|| format!("open log file {name:?}"))?;

                file.replace(OpenedFile {
                    file: Encoder::new(f, params.compression_level)
                        .context("set up zstd encoder")?
                        .auto_finish(),
                    name,
                    written: 0,
                });
            }

            let mut need_rotate = false;

            if let Some(file) = file.as_mut() {
                let mut json = serde_json::to_string(record).context("serializing record")?;
                json.push('\n');
                file.file
                    .write_all(json.as_bytes())
                    .with_context(|| format!("writing record to {}", file.name.display()))?;
                file.written += json.len() as u64;

                need_rotate = file.written >= params.max_file_size;
            }

            if need_rotate {
                file.take();
            }

            Ok(())
        }

        while let Ok(cmd) = receiver.recv() {
            match cmd {
                LogCommand::Terminate => {
                    break;
                }
                LogCommand::Record(record) => {
                    if let Err(err) = do_record(&params, &mut file, &record) {
                        tracing::error!("failed to log: {err:#}");
                    }
                }
            }
        }
    }

    pub async fn log(&self, record: std::sync::Arc<JsonLogRecord>) -> anyhow::Result<()> {
        Ok(self.sender.send_async(LogCommand::Record(record)).await?)
    }

    /// Flush and stop the logging thread; called late in shutdown
    pub async fn signal_shutdown() {
        if let Some(logger) = Self::get() {
            logger.sender.send_async(LogCommand::Terminate).await.ok();
            let thread = logger.thread.lock().unwrap().take();
            if let Some(thread) = thread {
                tokio::task::spawn_blocking(move || {
                    thread.join().ok();
                })
                .await
                .ok();
            }
        }
    }
}

pub struct LogDisposition<'a> {
    pub kind: RecordType,
    pub msg: Message,
    pub site: &'a str,
    pub peer_address: Option<&'a ResolvedAddress>,
    pub response: Response,
    pub egress_pool: Option<&'a str>,
    pub egress_source: Option<&'a str>,
    pub delivery_protocol: Option<&'a str>,
    pub provider: Option<&'a str>,
    pub session_id: Option<Uuid>,
}

pub async fn log_disposition(args: LogDisposition<'_>) {
    let LogDisposition {
        kind,
        msg,
        site,
        peer_address,
        response,
        egress_pool,
        egress_source,
        delivery_protocol,
        provider,
        session_id,
    } = args;

    let (feedback_report, oob_report) = match kind {
        RecordType::Feedback => (crate::report_ingest::take_arf_report(&msg), None),
        RecordType::OOB => (None, crate::report_ingest::take_oob_report(&msg)),
        _ => (None, None),
    };

    let record = JsonLogRecord {
        kind,
        id: msg.id().to_string(),
        size: msg.get_data().len() as u64,
        sender: msg
            .sender()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|err| format!("{err:#}")),
        recipient: msg
            .recipient()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|err| format!("{err:#}")),
        queue: msg
            .get_queue_name()
            .unwrap_or_else(|err| format!("{err:#}")),
        site: site.to_string(),
        peer_address: peer_address.cloned(),
        response,
        timestamp: Utc::now(),
        created: msg.created(),
        num_attempts: msg.get_num_attempts(),
        egress_pool: egress_pool.map(|s| s.to_string()),
        egress_source: egress_source.map(|s| s.to_string()),
        feedback_report,
        oob_report,
        meta: msg.get_meta_obj(),
        headers: Default::default(),
        delivery_protocol: delivery_protocol.map(|s| s.to_string()),
        reception_protocol: None,
        nodeid: nodeid(),
        provider_name: provider.map(|s| s.to_string()),
        session_id,
    };
    let record = std::sync::Arc::new(record);

    crate::tsa_publisher::publish(&record);

    if let Some(logger) = Logger::get() {
        if let Err(err) = logger.log(record).await {
            tracing::error!("failed to log: {err:#}");
        }
    }
}
