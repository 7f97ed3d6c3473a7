use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// How diagnostic log lines are rendered
#[derive(Debug, Clone, Copy, Default)]
pub enum DiagnosticFormat {
    #[default]
    Full,
    Compact,
    Pretty,
    Json,
}

impl FromStr for DiagnosticFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "full" => Self::Full,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            "json" => Self::Json,
            _ => return Err(format!("invalid diagnostic format {s}")),
        })
    }
}

pub struct LoggingConfig<'a> {
    /// Where to place diagnostic log files; stderr when None
    pub log_dir: Option<PathBuf>,
    pub diag_format: DiagnosticFormat,
    /// Environment variable holding the filter directives
    pub filter_env_var: &'a str,
    pub default_filter: &'a str,
}

impl LoggingConfig<'_> {
    pub fn init(&self) -> anyhow::Result<()> {
        let filter = EnvFilter::try_from_env(self.filter_env_var)
            .or_else(|_| EnvFilter::try_new(self.default_filter))
            .context("building diagnostic filter")?;

        macro_rules! build_layer {
            ($writer:expr) => {{
                let layer = tracing_subscriber::fmt::layer().with_writer($writer);
                match self.diag_format {
                    DiagnosticFormat::Full => layer.boxed(),
                    DiagnosticFormat::Compact => layer.compact().boxed(),
                    DiagnosticFormat::Pretty => layer.pretty().boxed(),
                    DiagnosticFormat::Json => layer.json().boxed(),
                }
            }};
        }

        match &self.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating diagnostic log dir {}", dir.display()))?;
                let appender = tracing_appender::rolling::daily(dir, "diag.log");
                tracing_subscriber::registry()
                    .with(build_layer!(appender).with_filter(filter))
                    .try_init()
                    .map_err(|err| anyhow::anyhow!("initializing diagnostics: {err:#}"))?;
            }
            None => {
                tracing_subscriber::registry()
                    .with(build_layer!(std::io::stderr).with_filter(filter))
                    .try_init()
                    .map_err(|err| anyhow::anyhow!("initializing diagnostics: {err:#}"))?;
            }
        }

        Ok(())
    }
}
